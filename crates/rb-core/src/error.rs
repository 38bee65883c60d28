use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error kinds shared by the DNS router and the outbound groups.
#[derive(Debug, Error)]
pub enum Error {
    /// A transport answered, but the answer failed the address-limit check
    /// or the query was explicitly refused.
    #[error("response rejected")]
    ResponseRejected,

    /// Same as [`Error::ResponseRejected`], sourced from the rejected-response
    /// negative cache.
    #[error("response rejected (cached)")]
    ResponseRejectedCached,

    /// A `reject` rule with the `drop` method matched; the caller should
    /// silently drop the inbound query.
    #[error("query dropped")]
    Dropped,

    /// Lookup succeeded but produced zero addresses.
    #[error("empty result")]
    EmptyResult,

    /// A predefined rule carries a non-zero DNS rcode.
    #[error("dns rcode {0}")]
    Rcode(u16),

    /// A query message that cannot be routed (for example, not exactly one
    /// question).
    #[error("invalid query")]
    InvalidQuery,

    /// Construction-time configuration error; aborts startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A referenced tag does not resolve against its registry.
    #[error("{kind} not found: {tag}")]
    NotFound { kind: &'static str, tag: String },

    /// A component was used before its `start` stage completed.
    #[error("not started")]
    NotStarted,

    /// Multiple racing branches failed.
    #[error("all branches failed: {}", format_errors(.0))]
    Aggregate(Vec<Error>),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig(message.into())
    }

    pub fn not_found(kind: &'static str, tag: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            tag: tag.into(),
        }
    }

    /// Collapse a list of branch errors: empty lists become [`Error::Cancelled`],
    /// single entries unwrap, anything else aggregates.
    pub fn aggregate(mut errors: Vec<Error>) -> Self {
        match errors.len() {
            0 => Error::Cancelled,
            1 => errors.remove(0),
            _ => Error::Aggregate(errors),
        }
    }

    /// Whether this error came from a rejected response, cached or live.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::ResponseRejected | Error::ResponseRejectedCached)
    }
}

fn format_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_unwraps_single() {
        let err = Error::aggregate(vec![Error::EmptyResult]);
        assert!(matches!(err, Error::EmptyResult));
    }

    #[test]
    fn aggregate_formats_all_branches() {
        let err = Error::aggregate(vec![Error::EmptyResult, Error::Rcode(3)]);
        let text = err.to_string();
        assert!(text.contains("empty result"));
        assert!(text.contains("rcode 3"));
    }
}
