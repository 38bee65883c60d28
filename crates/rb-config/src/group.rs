//! Outbound group options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options shared by the fallback group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackOutboundOptions {
    pub outbounds: Vec<String>,
    pub url: String,
    #[serde(with = "crate::duration::option")]
    pub interval: Option<Duration>,
    #[serde(with = "crate::duration::option")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "crate::duration::option")]
    pub timeout: Option<Duration>,
    pub interrupt_exist_connections: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    ConsistentHashing,
    StickySessions,
}

impl LoadBalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::RoundRobin => "round-robin",
            LoadBalanceStrategy::ConsistentHashing => "consistent-hashing",
            LoadBalanceStrategy::StickySessions => "sticky-sessions",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalanceOutboundOptions {
    pub outbounds: Vec<String>,
    pub url: String,
    #[serde(with = "crate::duration::option")]
    pub interval: Option<Duration>,
    #[serde(with = "crate::duration::option")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "crate::duration::option")]
    pub timeout: Option<Duration>,
    pub strategy: LoadBalanceStrategy,
    pub interrupt_exist_connections: bool,
}
