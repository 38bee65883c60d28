//! Outbound groups: policy outbounds that pick among member dialers using
//! shared probe history.

use std::sync::Arc;

use crate::adapter::{ConnectionManager, Outbound};
use crate::outbound::OutboundManager;
use crate::services::pause::PauseManager;
use crate::services::urltest::HistoryStorage;

mod healthcheck;

pub mod fallback;
pub mod load_balance;

#[cfg(test)]
pub(crate) mod testutil;


pub use fallback::{Fallback, FallbackGroup};
pub use healthcheck::HealthChecker;
pub use load_balance::{LoadBalance, LoadBalanceGroup};

/// Services a group resolves at construction time.
#[derive(Clone)]
pub struct GroupServices {
    pub outbound: Arc<OutboundManager>,
    pub connection: Option<Arc<dyn ConnectionManager>>,
    pub pause: Arc<PauseManager>,
    /// Probe-history store; pass [`HistoryStorage::shared`] to share it
    /// process-wide, or a fresh store to keep it group-local. Members of one
    /// group always share the one given here.
    pub history: Arc<HistoryStorage>,
}

impl GroupServices {
    pub fn new(outbound: Arc<OutboundManager>) -> Self {
        Self {
            outbound,
            connection: None,
            pause: Arc::new(PauseManager::new()),
            history: HistoryStorage::shared(),
        }
    }
}

/// Effective leaf tag of an outbound: groups report their currently
/// preferred member, everything else reports its own tag.
pub fn real_tag(detour: &dyn Outbound) -> String {
    match detour.as_group() {
        Some(group) => group.now(),
        None => detour.tag().to_string(),
    }
}
