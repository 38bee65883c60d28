//! Registry of outbound dialers by tag.

use dashmap::DashMap;

use crate::adapter::OutboundHandle;

/// Thread-safe tag registry for outbounds.
#[derive(Default)]
pub struct OutboundManager {
    outbounds: DashMap<String, OutboundHandle>,
}

impl OutboundManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outbound under its own tag; replaces any previous holder.
    pub fn register(&self, outbound: OutboundHandle) {
        self.outbounds.insert(outbound.tag().to_string(), outbound);
    }

    pub fn get(&self, tag: &str) -> Option<OutboundHandle> {
        self.outbounds.get(tag).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, tag: &str) {
        self.outbounds.remove(tag);
    }

    pub fn tags(&self) -> Vec<String> {
        self.outbounds
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl std::fmt::Debug for OutboundManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundManager")
            .field("outbounds", &self.outbounds.len())
            .finish()
    }
}
