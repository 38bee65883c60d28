//! Tracks live connections handed out by a group so they can be interrupted
//! when the group's selection changes.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::adapter::{BoxConn, BoxPacketConn, PacketConn};
use crate::error::{Error, Result};
use crate::types::Destination;

#[derive(Clone, Default)]
pub struct InterruptGroup {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    conns: DashMap<u64, Tracked>,
}

struct Tracked {
    token: CancellationToken,
    is_external: bool,
}

impl InterruptGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, is_external: bool) -> (u64, CancellationToken) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.inner.conns.insert(
            id,
            Tracked {
                token: token.clone(),
                is_external,
            },
        );
        (id, token)
    }

    /// Wrap a stream connection; the wrapper deregisters itself on drop.
    pub fn new_conn(&self, conn: BoxConn, is_external: bool) -> BoxConn {
        let (id, token) = self.track(is_external);
        Box::new(InterruptConn {
            inner: conn,
            token,
            id,
            group: Arc::downgrade(&self.inner),
        })
    }

    /// Wrap a packet connection; the wrapper deregisters itself on close.
    pub fn new_packet_conn(&self, conn: BoxPacketConn, is_external: bool) -> BoxPacketConn {
        let (id, token) = self.track(is_external);
        Box::new(InterruptPacketConn {
            inner: conn,
            token,
            id,
            group: Arc::downgrade(&self.inner),
        })
    }

    /// Close all tracked connections. External connections are skipped unless
    /// `also_external` is set.
    pub fn interrupt(&self, also_external: bool) {
        self.inner.conns.retain(|_, tracked| {
            if tracked.is_external && !also_external {
                return true;
            }
            tracked.token.cancel();
            false
        });
    }

    #[cfg(test)]
    pub(crate) fn tracked_len(&self) -> usize {
        self.inner.conns.len()
    }
}

fn interrupted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection interrupted")
}

struct InterruptConn {
    inner: BoxConn,
    token: CancellationToken,
    id: u64,
    group: Weak<Inner>,
}

impl AsyncRead for InterruptConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(interrupted()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for InterruptConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(interrupted()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(interrupted()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for InterruptConn {
    fn drop(&mut self) {
        if let Some(group) = self.group.upgrade() {
            group.conns.remove(&self.id);
        }
    }
}

struct InterruptPacketConn {
    inner: BoxPacketConn,
    token: CancellationToken,
    id: u64,
    group: Weak<Inner>,
}

#[async_trait]
impl PacketConn for InterruptPacketConn {
    async fn send_to(&self, buf: &[u8], destination: &Destination) -> Result<usize> {
        if self.token.is_cancelled() {
            return Err(Error::Io(interrupted()));
        }
        self.inner.send_to(buf, destination).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination)> {
        if self.token.is_cancelled() {
            return Err(Error::Io(interrupted()));
        }
        self.inner.recv_from(buf).await
    }

    fn close(&self) {
        self.inner.close();
        if let Some(group) = self.group.upgrade() {
            group.conns.remove(&self.id);
        }
    }
}
