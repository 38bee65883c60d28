//! DNS router and rule options.

use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Address family handling for resolved results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainStrategy {
    #[default]
    AsIs,
    PreferIpv4,
    PreferIpv6,
    Ipv4Only,
    Ipv6Only,
}

/// Router-level DNS options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsOptions {
    pub strategy: DomainStrategy,
    pub disable_cache: bool,
    pub disable_expire: bool,
    pub independent_cache: bool,
    pub cache_capacity: Option<u32>,
    pub client_subnet: Option<IpNet>,
    pub upstream_timeout_ms: u32,
    pub fallback_timeout_ms: u32,
    pub fallback_grace_ms: u32,
    pub reverse_mapping: bool,
    pub rules: Vec<DnsRuleOptions>,
}

/// Query type in a rule, either mnemonic ("A", "AAAA", "HTTPS") or numeric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryTypeOption {
    Name(String),
    Number(u16),
}

/// What a matching rule does with the query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DnsRuleAction {
    #[default]
    Route,
    RouteOptions,
    Reject,
    Predefined,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectMethod {
    #[default]
    Default,
    Drop,
}

/// One predefined resource record (`predefined` action).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredefinedRecordOptions {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    #[serde(default = "default_record_ttl")]
    pub ttl: u32,
}

fn default_record_ttl() -> u32 {
    600
}

/// One DNS routing rule: match conditions plus an action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsRuleOptions {
    // Match conditions.
    pub domain: Vec<String>,
    pub domain_suffix: Vec<String>,
    pub domain_keyword: Vec<String>,
    pub query_type: Vec<QueryTypeOption>,
    pub ip_cidr: Vec<IpNet>,
    pub invert: bool,

    // Action.
    pub action: DnsRuleAction,
    pub servers: Vec<String>,
    pub fallback_servers: Vec<String>,
    pub strategy: Option<DomainStrategy>,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpNet>,
    #[serde(with = "crate::duration::option")]
    pub upstream_timeout: Option<Duration>,
    #[serde(with = "crate::duration::option")]
    pub fallback_timeout: Option<Duration>,
    #[serde(with = "crate::duration::option")]
    pub fallback_grace: Option<Duration>,
    pub method: RejectMethod,
    pub rcode: Option<String>,
    pub answer: Vec<PredefinedRecordOptions>,
}
