//! Configuration types for the routebox core.
//!
//! rb-core consumes these structs; parsing accepts JSONC (comments and
//! trailing commas) through the [`jsonc`] module.

pub mod duration;
pub mod jsonc;

mod dns;
mod group;

pub use dns::{
    DnsOptions, DnsRuleAction, DnsRuleOptions, DomainStrategy, PredefinedRecordOptions,
    QueryTypeOption, RejectMethod,
};
pub use group::{FallbackOutboundOptions, LoadBalanceOutboundOptions, LoadBalanceStrategy};
