//! DNS resolution routing.
//!
//! [`router::DnsRouter`] matches queries against an ordered rule list, picks
//! transports out of [`transport::DnsTransportManager`], and races them
//! through [`client::DnsClient`].

use std::sync::Arc;

use ipnet::IpNet;

pub mod client;
pub mod message;
pub mod reverse;
pub mod router;
pub mod rule;
pub mod transport;

pub use rb_config::DomainStrategy;

use self::transport::DnsTransport;

/// Per-query options. Rule-derived variants are always copies; a rule never
/// mutates the caller's options in place.
#[derive(Clone, Default)]
pub struct DnsQueryOptions {
    /// Pinned transport: when set, rules are not consulted.
    pub transport: Option<Arc<dyn DnsTransport>>,
    pub strategy: DomainStrategy,
    pub client_subnet: Option<IpNet>,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
}

impl std::fmt::Debug for DnsQueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsQueryOptions")
            .field("transport", &self.transport.as_ref().map(|t| t.tag()))
            .field("strategy", &self.strategy)
            .field("client_subnet", &self.client_subnet)
            .field("disable_cache", &self.disable_cache)
            .field("rewrite_ttl", &self.rewrite_ttl)
            .finish()
    }
}
