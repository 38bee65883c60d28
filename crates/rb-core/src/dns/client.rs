//! DNS client adapter: per-transport exchange/lookup with an optional
//! response cache and a rejected-response negative cache (RDRC).

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ipnet::IpNet;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::dns::message::{set_client_subnet, Message, Question, RCODE_SUCCESS, TYPE_A, TYPE_AAAA};
use crate::dns::transport::DnsTransport;
use crate::dns::{DnsQueryOptions, DomainStrategy};
use crate::error::{Error, Result};

/// Predicate over the addresses extracted from an answer; used by
/// address-limit rules to accept or reject a response after resolution.
pub type ResponseCheck = dyn Fn(&[IpAddr]) -> bool + Send + Sync;

const DEFAULT_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct DnsClientOptions {
    pub disable_cache: bool,
    pub disable_expire: bool,
    /// Cache per transport instead of globally; racing multiple transports
    /// with a shared cache would pollute it.
    pub independent_cache: bool,
    pub cache_capacity: Option<u32>,
    pub client_subnet: Option<IpNet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    name: String,
    qtype: u16,
    strategy: DomainStrategy,
    client_subnet: Option<IpNet>,
    transport: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RdrcKey {
    transport: String,
    name: String,
    qtype: u16,
}

struct CachedResponse {
    message: Message,
    stored_at: Instant,
    ttl: Duration,
}

pub struct DnsClient {
    disable_cache: bool,
    disable_expire: bool,
    independent_cache: bool,
    client_subnet: Option<IpNet>,
    cache: Option<Mutex<LruCache<CacheKey, CachedResponse>>>,
    rdrc: DashMap<RdrcKey, ()>,
}

impl DnsClient {
    pub fn new(options: DnsClientOptions) -> Self {
        let cache = if options.disable_cache {
            None
        } else {
            let capacity = options
                .cache_capacity
                .map(|capacity| capacity as usize)
                .unwrap_or(DEFAULT_CACHE_CAPACITY);
            let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
            Some(Mutex::new(LruCache::new(capacity)))
        };
        Self {
            disable_cache: options.disable_cache,
            disable_expire: options.disable_expire,
            independent_cache: options.independent_cache,
            client_subnet: options.client_subnet,
            cache,
            rdrc: DashMap::new(),
        }
    }

    pub fn start(&self) {
        tracing::debug!(target: "rb_core::dns", "dns client started");
    }

    pub fn independent_cache(&self) -> bool {
        self.independent_cache
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
        self.rdrc.clear();
    }

    /// Exchange `message` over `transport`.
    ///
    /// When `response_check` is given, a successful answer whose addresses do
    /// not satisfy it is reported as [`Error::ResponseRejected`], recorded in
    /// the RDRC, and never returned; later queries for the same question and
    /// transport surface [`Error::ResponseRejectedCached`] instead.
    pub async fn exchange(
        &self,
        transport: &Arc<dyn DnsTransport>,
        message: &Message,
        options: &DnsQueryOptions,
        response_check: Option<Arc<ResponseCheck>>,
    ) -> Result<Message> {
        let question = match message.question.as_slice() {
            [question] => question.clone(),
            _ => return Err(Error::InvalidQuery),
        };
        if strategy_excludes_query(options.strategy, question.qtype) {
            return Ok(Message::response_to(message, RCODE_SUCCESS));
        }

        if response_check.is_some() && self.load_rdrc(transport.tag(), &question) {
            return Err(Error::ResponseRejectedCached);
        }

        let disable_cache = self.disable_cache || options.disable_cache;
        let cache_key = self.cache_key(&question, options, transport.tag());
        if !disable_cache {
            if let Some(mut cached) = self.load_cache(&cache_key) {
                cached.id = message.id;
                if let Some(ttl) = options.rewrite_ttl {
                    cached.rewrite_ttl(ttl);
                }
                #[cfg(feature = "metrics")]
                metrics::counter!("dns_query_total", "source" => "cache").increment(1);
                return Ok(cached);
            }
        }

        let effective_subnet = options.client_subnet.or(self.client_subnet);
        let query = match &effective_subnet {
            Some(prefix) => set_client_subnet(message, prefix),
            None => message.clone(),
        };
        let mut response = transport.exchange(&query).await?;
        #[cfg(feature = "metrics")]
        metrics::counter!("dns_query_total", "source" => "upstream").increment(1);

        if let Some(check) = &response_check {
            if response.rcode == RCODE_SUCCESS {
                let addrs = response.answer_addrs();
                if !addrs.is_empty() && !check.as_ref()(&addrs) {
                    self.store_rdrc(transport.tag(), &question);
                    return Err(Error::ResponseRejected);
                }
            }
        }

        if let Some(ttl) = options.rewrite_ttl {
            response.rewrite_ttl(ttl);
        }
        if !disable_cache && response.rcode == RCODE_SUCCESS {
            if let Some(ttl) = response.min_answer_ttl() {
                if ttl > 0 {
                    self.store_cache(cache_key, &response, Duration::from_secs(u64::from(ttl)));
                }
            }
        }
        Ok(response)
    }

    /// Resolve `domain` to addresses, querying A/AAAA per the strategy and
    /// ordering the combined result accordingly.
    pub async fn lookup(
        &self,
        transport: &Arc<dyn DnsTransport>,
        domain: &str,
        options: &DnsQueryOptions,
        response_check: Option<Arc<ResponseCheck>>,
    ) -> Result<Vec<IpAddr>> {
        let results = match options.strategy {
            DomainStrategy::Ipv4Only => {
                vec![
                    self.exchange(
                        transport,
                        &Message::query(domain, TYPE_A),
                        options,
                        response_check,
                    )
                    .await,
                ]
            }
            DomainStrategy::Ipv6Only => {
                vec![
                    self.exchange(
                        transport,
                        &Message::query(domain, TYPE_AAAA),
                        options,
                        response_check,
                    )
                    .await,
                ]
            }
            _ => {
                let query_a = Message::query(domain, TYPE_A);
                let query_aaaa = Message::query(domain, TYPE_AAAA);
                let (v4, v6) = tokio::join!(
                    self.exchange(transport, &query_a, options, response_check.clone(),),
                    self.exchange(transport, &query_aaaa, options, response_check,),
                );
                vec![v4, v6]
            }
        };

        let mut v4_addrs = Vec::new();
        let mut v6_addrs = Vec::new();
        let mut errors = Vec::new();
        let mut rcode_error = None;
        let total = results.len();
        for result in results {
            match result {
                Ok(response) if response.rcode == RCODE_SUCCESS => {
                    for addr in response.answer_addrs() {
                        match addr {
                            IpAddr::V4(_) => v4_addrs.push(addr),
                            IpAddr::V6(_) => v6_addrs.push(addr),
                        }
                    }
                }
                Ok(response) => rcode_error = Some(response.rcode),
                Err(err) => errors.push(err),
            }
        }
        if errors.len() == total {
            return Err(Error::aggregate(errors));
        }

        let ordered = match options.strategy {
            DomainStrategy::PreferIpv6 => v6_addrs.into_iter().chain(v4_addrs).collect::<Vec<_>>(),
            _ => v4_addrs.into_iter().chain(v6_addrs).collect::<Vec<_>>(),
        };
        if ordered.is_empty() {
            if let Some(rcode) = rcode_error {
                return Err(Error::Rcode(rcode));
            }
            if let Some(err) = errors.into_iter().next() {
                return Err(err);
            }
        }
        Ok(ordered)
    }

    fn cache_key(&self, question: &Question, options: &DnsQueryOptions, transport: &str) -> CacheKey {
        CacheKey {
            name: question.name.clone(),
            qtype: question.qtype,
            strategy: options.strategy,
            client_subnet: options.client_subnet.or(self.client_subnet),
            transport: self
                .independent_cache
                .then(|| transport.to_string()),
        }
    }

    fn load_cache(&self, key: &CacheKey) -> Option<Message> {
        let cache = self.cache.as_ref()?;
        let mut cache = cache.lock();
        let expired = match cache.get(key) {
            Some(entry) => {
                if self.disable_expire {
                    return Some(entry.message.clone());
                }
                let elapsed = entry.stored_at.elapsed();
                if elapsed < entry.ttl {
                    let mut message = entry.message.clone();
                    let remaining = (entry.ttl - elapsed).as_secs().max(1) as u32;
                    message.rewrite_ttl(remaining);
                    return Some(message);
                }
                true
            }
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        None
    }

    fn store_cache(&self, key: CacheKey, response: &Message, ttl: Duration) {
        if let Some(cache) = &self.cache {
            cache.lock().put(
                key,
                CachedResponse {
                    message: response.clone(),
                    stored_at: Instant::now(),
                    ttl,
                },
            );
        }
    }

    fn load_rdrc(&self, transport: &str, question: &Question) -> bool {
        self.rdrc.contains_key(&RdrcKey {
            transport: transport.to_string(),
            name: question.name.clone(),
            qtype: question.qtype,
        })
    }

    fn store_rdrc(&self, transport: &str, question: &Question) {
        self.rdrc.insert(
            RdrcKey {
                transport: transport.to_string(),
                name: question.name.clone(),
                qtype: question.qtype,
            },
            (),
        );
    }
}

fn strategy_excludes_query(strategy: DomainStrategy, qtype: u16) -> bool {
    matches!(
        (strategy, qtype),
        (DomainStrategy::Ipv4Only, TYPE_AAAA) | (DomainStrategy::Ipv6Only, TYPE_A)
    )
}
