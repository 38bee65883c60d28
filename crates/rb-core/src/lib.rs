//! Core routing engine: DNS resolution routing and outbound groups.
//!
//! The two subsystems share one concurrency vocabulary: cooperative
//! cancellation through [`tokio_util::sync::CancellationToken`], fan-in
//! result channels for racing, and point-in-time snapshots of shared health
//! state. Wire protocols (DNS transports, outbound dialers) stay behind the
//! traits in [`adapter`]; this crate only routes between them.

pub mod adapter;
pub mod common;
pub mod dns;
pub mod error;
pub mod outbound;
pub mod services;
pub mod types;

pub use error::{Error, Result};
