//! Trait surface between the routing core and the concrete protocol
//! implementations. Dialers and DNS transports live behind these traits;
//! the core never sees wire formats.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::types::{Destination, Network};

/// Byte-stream connection produced by an outbound dialer.
pub trait AsyncConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncConn for T {}

pub type BoxConn = Box<dyn AsyncConn>;

/// Datagram connection produced by an outbound dialer.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send_to(&self, buf: &[u8], destination: &Destination) -> Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination)>;
    fn close(&self);
}

pub type BoxPacketConn = Box<dyn PacketConn>;

/// Per-query / per-connection metadata threaded through routing decisions.
#[derive(Debug, Clone, Default)]
pub struct InboundContext {
    pub source: Option<SocketAddr>,
    pub destination: Option<Destination>,
    pub query_type: Option<u16>,
    pub ip_version: Option<u8>,
    pub domain: String,
    /// Resolved addresses, filled in by response checks before address-limit
    /// rules re-match.
    pub destination_addresses: Vec<IpAddr>,
    /// Set for connections accepted from an inbound listener (as opposed to
    /// dials the engine makes for itself).
    pub is_external_connection: bool,
    pub(crate) rule_cache: RuleMatchCache,
}

/// Memoized per-rule match state; cleared before every rule evaluation so a
/// later `match_address_limit` can reuse the domain verdict without staleness.
#[derive(Debug, Clone, Default)]
pub(crate) struct RuleMatchCache {
    pub(crate) domain_match: Option<bool>,
}

impl InboundContext {
    pub fn reset_rule_cache(&mut self) {
        self.rule_cache = RuleMatchCache::default();
    }
}

/// An outbound dialer.
#[async_trait]
pub trait Outbound: Send + Sync {
    fn tag(&self) -> &str;

    fn outbound_type(&self) -> &'static str;

    /// Networks this outbound can carry.
    fn network(&self) -> &[Network];

    async fn dial_context(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Destination,
    ) -> Result<BoxConn>;

    async fn listen_packet(
        &self,
        ctx: &InboundContext,
        destination: &Destination,
    ) -> Result<BoxPacketConn>;

    /// Group view of this outbound, when it is one.
    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        None
    }
}

/// Extra surface exposed by group outbounds.
pub trait OutboundGroup: Send + Sync {
    /// Tag of the member currently preferred by the group.
    fn now(&self) -> String;

    /// All member tags, in configuration order.
    fn all(&self) -> Vec<String>;
}

/// Sink for connections accepted on behalf of a group outbound
/// (`new_connection_ex` / `new_packet_connection_ex`).
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn new_connection(&self, outbound_tag: &str, conn: BoxConn, metadata: InboundContext);

    async fn new_packet_connection(
        &self,
        outbound_tag: &str,
        conn: BoxPacketConn,
        metadata: InboundContext,
    );
}

/// Shared handle type used throughout the core.
pub type OutboundHandle = Arc<dyn Outbound>;
