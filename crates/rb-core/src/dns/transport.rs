//! DNS transport trait and tag registry.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::RwLock;

use crate::dns::message::Message;
use crate::dns::DomainStrategy;
use crate::error::Result;

/// Transport type reserved for fake-IP allocators; such transports are
/// filtered out when the caller cannot consume synthetic addresses.
pub const TYPE_FAKEIP: &str = "fakeip";

/// One configured DNS upstream (UDP, TCP, TLS, HTTPS, fake-IP, ...).
///
/// Implementations own the wire protocol; the router only exchanges typed
/// messages with them.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    fn tag(&self) -> &str;

    fn transport_type(&self) -> &'static str;

    async fn exchange(&self, message: &Message) -> Result<Message>;

    /// Legacy transports carry their own default strategy; consulted only
    /// when the effective option is still unset.
    fn legacy_strategy(&self) -> Option<DomainStrategy> {
        None
    }

    /// Legacy transports carry their own default client subnet; consulted
    /// only when the effective option is still unset.
    fn legacy_client_subnet(&self) -> Option<IpNet> {
        None
    }
}

/// Thread-safe tag registry for DNS transports, with an optional default.
#[derive(Default)]
pub struct DnsTransportManager {
    transports: DashMap<String, Arc<dyn DnsTransport>>,
    default_tag: RwLock<Option<String>>,
}

impl DnsTransportManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transport: Arc<dyn DnsTransport>) {
        self.transports
            .insert(transport.tag().to_string(), transport);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn DnsTransport>> {
        self.transports.get(tag).map(|entry| entry.value().clone())
    }

    pub fn set_default(&self, tag: impl Into<String>) {
        *self.default_tag.write() = Some(tag.into());
    }

    /// The default transport used when no rule matched, if configured.
    pub fn default_transport(&self) -> Option<Arc<dyn DnsTransport>> {
        let tag = self.default_tag.read().clone()?;
        self.get(&tag)
    }
}

impl std::fmt::Debug for DnsTransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsTransportManager")
            .field("transports", &self.transports.len())
            .field("default_tag", &*self.default_tag.read())
            .finish()
    }
}
