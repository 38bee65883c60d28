//! DNS routing rules.
//!
//! The router only depends on the [`DnsRule`] trait; [`DefaultDnsRule`] is
//! the built-in implementation covering domain, query-type, and resolved
//! address conditions.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;

use rb_config::{DnsRuleOptions, DomainStrategy, QueryTypeOption, RejectMethod};

use crate::adapter::InboundContext;
use crate::dns::message::{
    fqdn_to_domain, Record, RecordData, RCODE_FORMAT_ERROR, RCODE_NAME_ERROR, RCODE_REFUSED,
    RCODE_SERVER_FAILURE, RCODE_SUCCESS, TYPE_A, TYPE_AAAA, TYPE_HTTPS,
};
use crate::error::{Error, Result};

/// Action of a matched rule.
#[derive(Debug, Clone)]
pub enum DnsRuleAction {
    Route {
        servers: Vec<String>,
        fallback_servers: Vec<String>,
        strategy: Option<DomainStrategy>,
        disable_cache: bool,
        rewrite_ttl: Option<u32>,
        client_subnet: Option<IpNet>,
        upstream_timeout: Option<Duration>,
        fallback_timeout: Option<Duration>,
        fallback_grace: Option<Duration>,
    },
    /// Merges tunables into the query options without terminating the walk.
    RouteOptions {
        strategy: Option<DomainStrategy>,
        disable_cache: bool,
        rewrite_ttl: Option<u32>,
        client_subnet: Option<IpNet>,
    },
    Reject {
        method: RejectMethod,
    },
    Predefined {
        rcode: u16,
        answers: Vec<Record>,
    },
}

impl std::fmt::Display for DnsRuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsRuleAction::Route { servers, .. } => write!(f, "route({})", servers.join(",")),
            DnsRuleAction::RouteOptions { .. } => f.write_str("route-options"),
            DnsRuleAction::Reject { method } => match method {
                RejectMethod::Default => f.write_str("reject"),
                RejectMethod::Drop => f.write_str("reject-drop"),
            },
            DnsRuleAction::Predefined { rcode, .. } => write!(f, "predefined({rcode})"),
        }
    }
}

/// One entry of the router's ordered rule list.
pub trait DnsRule: Send + Sync {
    /// Match against query metadata. The per-rule match cache on `metadata`
    /// has been reset by the caller.
    fn matches(&self, metadata: &mut InboundContext) -> bool;

    /// Re-match including resolved-address conditions
    /// (`metadata.destination_addresses`).
    fn match_address_limit(&self, metadata: &mut InboundContext) -> bool;

    /// Whether acceptance depends on resolved addresses; such rules only
    /// apply to A/AAAA/HTTPS queries and are re-checked after resolution.
    fn with_address_limit(&self) -> bool;

    fn action(&self) -> &DnsRuleAction;

    /// Compact description for match logs.
    fn describe(&self) -> String;
}

/// Built-in rule: domain / domain-suffix / domain-keyword / query-type
/// conditions plus an `ip_cidr` address limit.
#[derive(Debug)]
pub struct DefaultDnsRule {
    domain: Vec<String>,
    domain_suffix: Vec<String>,
    domain_keyword: Vec<String>,
    query_type: Vec<u16>,
    ip_cidr: Vec<IpNet>,
    invert: bool,
    action: DnsRuleAction,
}

impl DefaultDnsRule {
    pub fn new(options: DnsRuleOptions) -> Result<Self> {
        let query_type = options
            .query_type
            .iter()
            .map(parse_query_type)
            .collect::<Result<Vec<_>>>()?;
        let action = build_action(&options)?;
        Ok(Self {
            domain: options.domain.iter().map(|d| fqdn_to_domain(d)).collect(),
            domain_suffix: options
                .domain_suffix
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            domain_keyword: options
                .domain_keyword
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            query_type,
            ip_cidr: options.ip_cidr,
            invert: options.invert,
            action,
        })
    }

    fn match_domain(&self, metadata: &mut InboundContext) -> bool {
        if self.domain.is_empty() && self.domain_suffix.is_empty() && self.domain_keyword.is_empty()
        {
            return true;
        }
        if let Some(cached) = metadata.rule_cache.domain_match {
            return cached;
        }
        let domain = &metadata.domain;
        let verdict = self.domain.iter().any(|exact| exact == domain)
            || self
                .domain_suffix
                .iter()
                .any(|suffix| domain.ends_with(suffix))
            || self
                .domain_keyword
                .iter()
                .any(|keyword| domain.contains(keyword));
        metadata.rule_cache.domain_match = Some(verdict);
        verdict
    }

    fn match_base(&self, metadata: &mut InboundContext) -> bool {
        if !self.match_domain(metadata) {
            return false;
        }
        if !self.query_type.is_empty() {
            match metadata.query_type {
                Some(qtype) if self.query_type.contains(&qtype) => {}
                _ => return false,
            }
        }
        true
    }
}

impl DnsRule for DefaultDnsRule {
    fn matches(&self, metadata: &mut InboundContext) -> bool {
        self.match_base(metadata) != self.invert
    }

    fn match_address_limit(&self, metadata: &mut InboundContext) -> bool {
        if !self.matches(metadata) {
            return false;
        }
        if self.ip_cidr.is_empty() {
            return true;
        }
        metadata
            .destination_addresses
            .iter()
            .any(|addr| self.ip_cidr.iter().any(|cidr| cidr.contains(addr)))
    }

    fn with_address_limit(&self) -> bool {
        !self.ip_cidr.is_empty()
    }

    fn action(&self) -> &DnsRuleAction {
        &self.action
    }

    fn describe(&self) -> String {
        let mut parts = String::new();
        let mut push = |label: &str, values: &[String]| {
            if !values.is_empty() {
                if !parts.is_empty() {
                    parts.push(' ');
                }
                let _ = write!(parts, "{}={}", label, values.join(","));
            }
        };
        push("domain", &self.domain);
        push("domain_suffix", &self.domain_suffix);
        push("domain_keyword", &self.domain_keyword);
        if !self.query_type.is_empty() {
            if !parts.is_empty() {
                parts.push(' ');
            }
            let _ = write!(
                parts,
                "query_type={}",
                self.query_type
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            );
        }
        if !self.ip_cidr.is_empty() {
            if !parts.is_empty() {
                parts.push(' ');
            }
            let _ = write!(
                parts,
                "ip_cidr={}",
                self.ip_cidr
                    .iter()
                    .map(|net| net.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            );
        }
        parts
    }
}

/// Build the rule list for a router, in configuration order.
pub fn build_rules(options: Vec<DnsRuleOptions>) -> Result<Vec<Arc<dyn DnsRule>>> {
    options
        .into_iter()
        .enumerate()
        .map(|(index, rule)| {
            DefaultDnsRule::new(rule)
                .map(|rule| Arc::new(rule) as Arc<dyn DnsRule>)
                .map_err(|err| Error::invalid_config(format!("parse dns rule[{index}]: {err}")))
        })
        .collect()
}

fn build_action(options: &DnsRuleOptions) -> Result<DnsRuleAction> {
    match options.action {
        rb_config::DnsRuleAction::Route => Ok(DnsRuleAction::Route {
            servers: options.servers.clone(),
            fallback_servers: options.fallback_servers.clone(),
            strategy: options.strategy,
            disable_cache: options.disable_cache,
            rewrite_ttl: options.rewrite_ttl,
            client_subnet: options.client_subnet,
            upstream_timeout: options.upstream_timeout,
            fallback_timeout: options.fallback_timeout,
            fallback_grace: options.fallback_grace,
        }),
        rb_config::DnsRuleAction::RouteOptions => Ok(DnsRuleAction::RouteOptions {
            strategy: options.strategy,
            disable_cache: options.disable_cache,
            rewrite_ttl: options.rewrite_ttl,
            client_subnet: options.client_subnet,
        }),
        rb_config::DnsRuleAction::Reject => Ok(DnsRuleAction::Reject {
            method: options.method,
        }),
        rb_config::DnsRuleAction::Predefined => {
            let rcode = match &options.rcode {
                Some(rcode) => parse_rcode(rcode)?,
                None => RCODE_SUCCESS,
            };
            let answers = options
                .answer
                .iter()
                .map(build_record)
                .collect::<Result<Vec<_>>>()?;
            Ok(DnsRuleAction::Predefined { rcode, answers })
        }
    }
}

fn build_record(options: &rb_config::PredefinedRecordOptions) -> Result<Record> {
    let name = options
        .name
        .as_deref()
        .map(fqdn_to_domain)
        .unwrap_or_default();
    match options.record_type.to_ascii_uppercase().as_str() {
        "A" => {
            let addr = options.value.parse().map_err(|_| {
                Error::invalid_config(format!("invalid A record value: {}", options.value))
            })?;
            Ok(Record::a(name, options.ttl, addr))
        }
        "AAAA" => {
            let addr = options.value.parse().map_err(|_| {
                Error::invalid_config(format!("invalid AAAA record value: {}", options.value))
            })?;
            Ok(Record::aaaa(name, options.ttl, addr))
        }
        other => Err(Error::invalid_config(format!(
            "unsupported predefined record type: {other}"
        ))),
    }
}

fn parse_query_type(value: &QueryTypeOption) -> Result<u16> {
    match value {
        QueryTypeOption::Number(number) => Ok(*number),
        QueryTypeOption::Name(name) => match name.to_ascii_uppercase().as_str() {
            "A" => Ok(TYPE_A),
            "AAAA" => Ok(TYPE_AAAA),
            "HTTPS" => Ok(TYPE_HTTPS),
            "CNAME" => Ok(5),
            "NS" => Ok(2),
            "PTR" => Ok(12),
            "MX" => Ok(15),
            "TXT" => Ok(16),
            "SRV" => Ok(33),
            _ => Err(Error::invalid_config(format!("unknown query type: {name}"))),
        },
    }
}

fn parse_rcode(value: &str) -> Result<u16> {
    match value.to_ascii_uppercase().as_str() {
        "NOERROR" => Ok(RCODE_SUCCESS),
        "FORMERR" => Ok(RCODE_FORMAT_ERROR),
        "SERVFAIL" => Ok(RCODE_SERVER_FAILURE),
        "NXDOMAIN" => Ok(RCODE_NAME_ERROR),
        "REFUSED" => Ok(RCODE_REFUSED),
        other => other
            .parse()
            .map_err(|_| Error::invalid_config(format!("unknown rcode: {value}"))),
    }
}

/// Addresses an A/AAAA/HTTPS query; other query types never carry addresses,
/// so address-limit rules skip them.
pub fn is_address_query_type(qtype: u16) -> bool {
    matches!(qtype, TYPE_A | TYPE_AAAA | TYPE_HTTPS)
}

pub(crate) fn extract_predefined_addrs(answers: &[Record]) -> Vec<IpAddr> {
    answers
        .iter()
        .filter_map(|record| match record.data {
            RecordData::A(addr) => Some(IpAddr::V4(addr)),
            RecordData::Aaaa(addr) => Some(IpAddr::V6(addr)),
            _ => None,
        })
        .collect()
}
