//! Scriptable fake outbounds for group tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;

use crate::adapter::{BoxConn, BoxPacketConn, InboundContext, Outbound, PacketConn};
use crate::error::{Error, Result};
use crate::outbound::group::GroupServices;
use crate::outbound::OutboundManager;
use crate::services::pause::PauseManager;
use crate::services::urltest::{HistoryStorage, UrlTestHistory};
use crate::types::{Destination, Network};

/// Group services with a fresh, test-local history store.
pub(crate) fn test_services() -> GroupServices {
    GroupServices {
        outbound: Arc::new(OutboundManager::new()),
        connection: None,
        pause: Arc::new(PauseManager::new()),
        history: Arc::new(HistoryStorage::new()),
    }
}

pub(crate) fn fresh_history(delay: u16) -> UrlTestHistory {
    UrlTestHistory {
        time: tokio::time::Instant::now(),
        delay,
    }
}

pub(crate) struct FakeOutbound {
    tag: String,
    networks: Vec<Network>,
    dial_error: Mutex<Option<String>>,
    listen_error: Mutex<Option<String>>,
    dial_calls: AtomicU32,
    listen_calls: AtomicU32,
    // Keeps dialed peers alive so returned conns stay writable.
    peers: Mutex<Vec<DuplexStream>>,
}

impl FakeOutbound {
    pub(crate) fn new(tag: &str, networks: &[Network]) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            networks: networks.to_vec(),
            dial_error: Mutex::new(None),
            listen_error: Mutex::new(None),
            dial_calls: AtomicU32::new(0),
            listen_calls: AtomicU32::new(0),
            peers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_dial_error(&self, message: Option<&str>) {
        *self.dial_error.lock() = message.map(str::to_string);
    }

    pub(crate) fn set_listen_error(&self, message: Option<&str>) {
        *self.listen_error.lock() = message.map(str::to_string);
    }

    pub(crate) fn dial_calls(&self) -> u32 {
        self.dial_calls.load(Ordering::Acquire)
    }

    pub(crate) fn listen_calls(&self) -> u32 {
        self.listen_calls.load(Ordering::Acquire)
    }
}

fn scripted_error(message: String) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, message))
}

#[async_trait]
impl Outbound for FakeOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> &'static str {
        "fake"
    }

    fn network(&self) -> &[Network] {
        &self.networks
    }

    async fn dial_context(
        &self,
        _ctx: &InboundContext,
        _network: Network,
        _destination: &Destination,
    ) -> Result<BoxConn> {
        self.dial_calls.fetch_add(1, Ordering::AcqRel);
        if let Some(message) = self.dial_error.lock().clone() {
            return Err(scripted_error(message));
        }
        let (client, server) = tokio::io::duplex(1024);
        self.peers.lock().push(server);
        Ok(Box::new(client))
    }

    async fn listen_packet(
        &self,
        _ctx: &InboundContext,
        _destination: &Destination,
    ) -> Result<BoxPacketConn> {
        self.listen_calls.fetch_add(1, Ordering::AcqRel);
        if let Some(message) = self.listen_error.lock().clone() {
            return Err(scripted_error(message));
        }
        Ok(Box::new(FakePacketConn))
    }
}

pub(crate) struct FakePacketConn;

#[async_trait]
impl PacketConn for FakePacketConn {
    async fn send_to(&self, buf: &[u8], _destination: &Destination) -> Result<usize> {
        Ok(buf.len())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, Destination)> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "no data",
        )))
    }

    fn close(&self) {}
}
