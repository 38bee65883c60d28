//! URL-test probing and the shared probe-history store.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::adapter::{InboundContext, Outbound};
use crate::error::{Error, Result};
use crate::types::{Destination, Network};

pub const DEFAULT_TEST_URL: &str = "https://www.gstatic.com/generate_204";

/// Result of the most recent successful probe of an outbound.
///
/// Presence of an entry means the outbound is currently believed available.
/// Entries are replaced wholesale, never mutated in place.
#[derive(Debug, Clone)]
pub struct UrlTestHistory {
    pub time: Instant,
    pub delay: u16,
}

/// Concurrent map from real outbound tag to probe history.
#[derive(Debug, Default)]
pub struct HistoryStorage {
    entries: DashMap<String, UrlTestHistory>,
}

impl HistoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide store, shared by groups that are not given their own.
    pub fn shared() -> Arc<HistoryStorage> {
        static SHARED: Lazy<Arc<HistoryStorage>> = Lazy::new(|| Arc::new(HistoryStorage::new()));
        Arc::clone(&SHARED)
    }

    pub fn load(&self, tag: &str) -> Option<UrlTestHistory> {
        self.entries.get(tag).map(|entry| entry.value().clone())
    }

    pub fn store(&self, tag: &str, history: UrlTestHistory) {
        self.entries.insert(tag.to_string(), history);
    }

    pub fn delete(&self, tag: &str) {
        self.entries.remove(tag);
    }
}

/// Probe `url` through `detour`, returning the observed delay in milliseconds.
///
/// HTTPS probes count a successful dial as healthy; HTTP probes issue a HEAD
/// request and require a 2xx/3xx status line.
pub async fn url_test(detour: &dyn Outbound, url: &str) -> Result<u16> {
    let link = if url.is_empty() { DEFAULT_TEST_URL } else { url };
    let (host, port, https, path) = parse_test_url(link)?;
    let start = Instant::now();
    let ctx = InboundContext::default();
    let destination = Destination::fqdn(host.clone(), port);
    let mut conn = detour.dial_context(&ctx, Network::Tcp, &destination).await?;
    if https {
        return Ok(elapsed_ms(start));
    }

    let request = format!("HEAD {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    conn.write_all(request.as_bytes()).await?;
    let mut buf = [0u8; 1024];
    let n = conn.read(&mut buf).await?;
    let response = std::str::from_utf8(&buf[..n]).unwrap_or("");
    if response.starts_with("HTTP/1.") {
        if let Some(code) = response
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
        {
            if (200..400).contains(&code) {
                return Ok(elapsed_ms(start));
            }
        }
    }
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "invalid http response",
    )))
}

fn elapsed_ms(start: Instant) -> u16 {
    start.elapsed().as_millis().min(u128::from(u16::MAX)) as u16
}

fn parse_test_url(url: &str) -> Result<(String, u16, bool, String)> {
    let (rest, https, default_port) = if let Some(rest) = url.strip_prefix("https://") {
        (rest, true, 443)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (rest, false, 80)
    } else {
        return Err(Error::invalid_config(format!("invalid test url: {url}")));
    };
    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, format!("/{path}")),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.split_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .map_err(|_| Error::invalid_config(format!("invalid test url port: {url}")))?,
        ),
        None => (authority.to_string(), default_port),
    };
    Ok((host, port, https, path))
}
