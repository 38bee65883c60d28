//! Load-balance group: round-robin, rendezvous-hash, or sticky-session
//! dispatch over the currently available members.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use publicsuffix::{List, Psl};

use rb_config::{LoadBalanceOutboundOptions, LoadBalanceStrategy};

use crate::adapter::{
    BoxConn, BoxPacketConn, InboundContext, Outbound, OutboundGroup, OutboundHandle,
};
use crate::error::{Error, Result};
use crate::outbound::group::{real_tag, GroupServices, HealthChecker};
use crate::types::{Destination, Host, Network};

pub const TYPE_LOAD_BALANCE: &str = "loadbalance";

const GROUP_NETWORKS: [Network; 2] = [Network::Tcp, Network::Udp];
const STICKY_TTL: Duration = Duration::from_secs(10 * 60);

/// Load-balance outbound adapter: resolves member tags at `start`, then
/// delegates to the inner [`LoadBalanceGroup`].
pub struct LoadBalance {
    tag: String,
    services: GroupServices,
    tags: Vec<String>,
    url: String,
    interval: Duration,
    idle_timeout: Duration,
    timeout: Duration,
    strategy: LoadBalanceStrategy,
    group: OnceCell<LoadBalanceGroup>,
}

impl LoadBalance {
    pub fn new(
        services: GroupServices,
        tag: impl Into<String>,
        options: LoadBalanceOutboundOptions,
    ) -> Result<Self> {
        if options.outbounds.is_empty() {
            return Err(Error::invalid_config("missing tags"));
        }
        Ok(Self {
            tag: tag.into(),
            services,
            tags: options.outbounds,
            url: options.url,
            interval: options.interval.unwrap_or_default(),
            idle_timeout: options.idle_timeout.unwrap_or_default(),
            timeout: options.timeout.unwrap_or_default(),
            strategy: options.strategy,
            group: OnceCell::new(),
        })
    }

    pub fn start(&self) -> Result<()> {
        let mut outbounds = Vec::with_capacity(self.tags.len());
        for (index, tag) in self.tags.iter().enumerate() {
            let detour = self
                .services
                .outbound
                .get(tag)
                .ok_or_else(|| Error::not_found("outbound", format!("[{index}] {tag}")))?;
            outbounds.push(detour);
        }
        let group = LoadBalanceGroup::new(
            &self.services,
            outbounds,
            self.url.clone(),
            self.interval,
            self.idle_timeout,
            self.timeout,
            self.strategy,
        )?;
        self.group
            .set(group)
            .map_err(|_| Error::invalid_config("load-balance group started twice"))
    }

    pub fn post_start(&self) -> Result<()> {
        self.group()?.post_start();
        Ok(())
    }

    pub fn close(&self) {
        if let Some(group) = self.group.get() {
            group.close();
        }
    }

    fn group(&self) -> Result<&LoadBalanceGroup> {
        self.group.get().ok_or(Error::NotStarted)
    }

    pub async fn new_connection_ex(&self, conn: BoxConn, mut metadata: InboundContext) {
        metadata.is_external_connection = true;
        if let Some(connection) = &self.services.connection {
            connection.new_connection(&self.tag, conn, metadata).await;
        }
    }

    pub async fn new_packet_connection_ex(&self, conn: BoxPacketConn, mut metadata: InboundContext) {
        metadata.is_external_connection = true;
        if let Some(connection) = &self.services.connection {
            connection
                .new_packet_connection(&self.tag, conn, metadata)
                .await;
        }
    }
}

#[async_trait]
impl Outbound for LoadBalance {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> &'static str {
        TYPE_LOAD_BALANCE
    }

    fn network(&self) -> &[Network] {
        &GROUP_NETWORKS
    }

    async fn dial_context(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Destination,
    ) -> Result<BoxConn> {
        let group = self.group()?;
        group.touch();
        group.dial_context(ctx, network, destination).await
    }

    async fn listen_packet(
        &self,
        ctx: &InboundContext,
        destination: &Destination,
    ) -> Result<BoxPacketConn> {
        let group = self.group()?;
        group.touch();
        group.listen_packet(ctx, destination).await
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        Some(self)
    }
}

impl OutboundGroup for LoadBalance {
    fn now(&self) -> String {
        match self.group.get() {
            Some(group) => group.now(),
            None => self.tags.first().cloned().unwrap_or_default(),
        }
    }

    fn all(&self) -> Vec<String> {
        self.tags.clone()
    }
}

struct StickyEntry {
    tag: String,
    expire: Instant,
}

/// The dispatching core of a load-balance group.
pub struct LoadBalanceGroup {
    checker: HealthChecker,
    outbounds: Vec<OutboundHandle>,
    outbound_map: HashMap<String, OutboundHandle>,
    strategy: LoadBalanceStrategy,
    rr_counter: AtomicU64,
    // Held only for O(1) map work; never across an await.
    sticky_cache: Mutex<HashMap<String, StickyEntry>>,
    last_selected: RwLock<Option<OutboundHandle>>,
}

impl LoadBalanceGroup {
    pub fn new(
        services: &GroupServices,
        outbounds: Vec<OutboundHandle>,
        url: String,
        interval: Duration,
        idle_timeout: Duration,
        timeout: Duration,
        strategy: LoadBalanceStrategy,
    ) -> Result<Self> {
        let checker = HealthChecker::new(
            Arc::clone(&services.outbound),
            Arc::clone(&services.pause),
            Arc::clone(&services.history),
            outbounds.clone(),
            url,
            interval,
            idle_timeout,
            timeout,
        )?;
        let outbound_map = outbounds
            .iter()
            .map(|detour| (detour.tag().to_string(), Arc::clone(detour)))
            .collect();
        Ok(Self {
            checker,
            outbounds,
            outbound_map,
            strategy,
            rr_counter: AtomicU64::new(0),
            sticky_cache: Mutex::new(HashMap::new()),
            last_selected: RwLock::new(None),
        })
    }

    pub fn post_start(&self) {
        self.checker.post_start();
    }

    pub fn touch(&self) {
        self.checker.touch();
    }

    pub fn close(&self) {
        self.checker.close();
    }

    pub fn now(&self) -> String {
        if let Some(selected) = self.last_selected.read().as_ref() {
            return selected.tag().to_string();
        }
        match self.outbounds.first() {
            Some(first) => first.tag().to_string(),
            None => String::new(),
        }
    }

    pub async fn dial_context(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Destination,
    ) -> Result<BoxConn> {
        let mut excluded = HashSet::new();
        let mut last_err: Option<Error> = None;
        let mut triggered_check = false;
        loop {
            let detour = match self.next_candidate(ctx, network, destination, &excluded) {
                Some(detour) => detour,
                None => {
                    return Err(last_err.unwrap_or_else(|| {
                        Error::not_found("supported outbound", network.as_str())
                    }))
                }
            };
            match detour.dial_context(ctx, network, destination).await {
                Ok(conn) => {
                    self.on_dial_success(ctx, network, destination, &detour);
                    return Ok(conn);
                }
                Err(err) => {
                    self.on_dial_failure(ctx, network, destination, &detour, &err);
                    excluded.insert(detour.tag().to_string());
                    if !triggered_check {
                        triggered_check = true;
                        let checker = self.checker.clone();
                        tokio::spawn(async move {
                            checker.check_outbounds(true).await;
                        });
                    }
                    last_err = Some(err);
                }
            }
        }
    }

    pub async fn listen_packet(
        &self,
        ctx: &InboundContext,
        destination: &Destination,
    ) -> Result<BoxPacketConn> {
        let mut excluded = HashSet::new();
        let mut last_err: Option<Error> = None;
        let mut triggered_check = false;
        loop {
            let detour = match self.next_candidate(ctx, Network::Udp, destination, &excluded) {
                Some(detour) => detour,
                None => {
                    return Err(last_err.unwrap_or_else(|| {
                        Error::not_found("supported outbound", Network::Udp.as_str())
                    }))
                }
            };
            match detour.listen_packet(ctx, destination).await {
                Ok(conn) => {
                    self.on_dial_success(ctx, Network::Udp, destination, &detour);
                    return Ok(conn);
                }
                Err(err) => {
                    self.on_dial_failure(ctx, Network::Udp, destination, &detour, &err);
                    excluded.insert(detour.tag().to_string());
                    if !triggered_check {
                        triggered_check = true;
                        let checker = self.checker.clone();
                        tokio::spawn(async move {
                            checker.check_outbounds(true).await;
                        });
                    }
                    last_err = Some(err);
                }
            }
        }
    }

    fn on_dial_success(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Destination,
        detour: &OutboundHandle,
    ) {
        *self.last_selected.write() = Some(Arc::clone(detour));
        if self.strategy == LoadBalanceStrategy::StickySessions {
            self.store_sticky(ctx, network, destination, detour);
        }
    }

    fn on_dial_failure(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Destination,
        detour: &OutboundHandle,
        err: &Error,
    ) {
        tracing::error!(
            target: "rb_core::outbound",
            outbound = %detour.tag(),
            error = %err,
            "load-balance dial failed"
        );
        self.checker.history().delete(&real_tag(detour.as_ref()));
        if self.strategy == LoadBalanceStrategy::StickySessions {
            self.delete_sticky(ctx, network, destination);
        }
    }

    /// Recompute candidates, drop excluded ones, and pick per strategy.
    fn next_candidate(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Destination,
        excluded: &HashSet<String>,
    ) -> Option<OutboundHandle> {
        let mut candidates = self.candidates(network);
        candidates.retain(|detour| !excluded.contains(detour.tag()));
        if candidates.is_empty() {
            return None;
        }
        Some(self.select_outbound(ctx, network, destination, &candidates))
    }

    /// Members with probe history for `network`; when probes have produced
    /// nothing yet, every member supporting the network is a candidate.
    fn candidates(&self, network: Network) -> Vec<OutboundHandle> {
        let mut network_candidates = Vec::with_capacity(self.outbounds.len());
        let mut available = Vec::with_capacity(self.outbounds.len());
        for detour in &self.outbounds {
            if !detour.network().contains(&network) {
                continue;
            }
            network_candidates.push(Arc::clone(detour));
            if self
                .checker
                .history()
                .load(&real_tag(detour.as_ref()))
                .is_some()
            {
                available.push(Arc::clone(detour));
            }
        }
        if available.is_empty() {
            network_candidates
        } else {
            available
        }
    }

    fn select_outbound(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Destination,
        candidates: &[OutboundHandle],
    ) -> OutboundHandle {
        match self.strategy {
            LoadBalanceStrategy::RoundRobin => self.select_round_robin(candidates),
            LoadBalanceStrategy::ConsistentHashing => {
                rendezvous_pick(&destination_key(destination), candidates)
            }
            LoadBalanceStrategy::StickySessions => {
                let key = sticky_key(ctx, network, destination);
                match self.load_sticky(&key, candidates) {
                    Some(cached) => cached,
                    None => rendezvous_pick(&key, candidates),
                }
            }
        }
    }

    /// The counter is group-global and survives candidate-set changes, so the
    /// long-term distribution stays stable across failure transitions.
    fn select_round_robin(&self, candidates: &[OutboundHandle]) -> OutboundHandle {
        let index = self.rr_counter.fetch_add(1, Ordering::Relaxed) % candidates.len() as u64;
        Arc::clone(&candidates[index as usize])
    }

    fn load_sticky(&self, key: &str, candidates: &[OutboundHandle]) -> Option<OutboundHandle> {
        let now = Instant::now();
        let tag = {
            let mut cache = self.sticky_cache.lock();
            match cache.get(key) {
                Some(entry) if now > entry.expire => {
                    cache.remove(key);
                    None
                }
                Some(entry) => Some(entry.tag.clone()),
                None => None,
            }
        }?;
        let detour = match self.outbound_map.get(&tag) {
            Some(detour) => detour,
            None => {
                // The outbound was removed; reselect.
                self.sticky_cache.lock().remove(key);
                return None;
            }
        };
        candidates
            .iter()
            .find(|candidate| Arc::ptr_eq(candidate, detour))
            .cloned()
    }

    fn store_sticky(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Destination,
        detour: &OutboundHandle,
    ) {
        let key = sticky_key(ctx, network, destination);
        let now = Instant::now();
        let mut cache = self.sticky_cache.lock();
        // The cache is TTL-bound only; sweep expired entries on write to keep
        // its size proportional to live sessions.
        cache.retain(|_, entry| entry.expire > now);
        cache.insert(
            key,
            StickyEntry {
                tag: detour.tag().to_string(),
                expire: now + STICKY_TTL,
            },
        );
    }

    fn delete_sticky(&self, ctx: &InboundContext, network: Network, destination: &Destination) {
        let key = sticky_key(ctx, network, destination);
        self.sticky_cache.lock().remove(&key);
    }

    #[cfg(test)]
    pub(crate) fn checker(&self) -> &HealthChecker {
        &self.checker
    }

    #[cfg(test)]
    pub(crate) fn sticky_entry(&self, key: &str) -> Option<(String, Instant)> {
        self.sticky_cache
            .lock()
            .get(key)
            .map(|entry| (entry.tag.clone(), entry.expire))
    }

    #[cfg(test)]
    pub(crate) fn force_sticky(&self, key: &str, tag: &str, expire: Instant) {
        self.sticky_cache.lock().insert(
            key.to_string(),
            StickyEntry {
                tag: tag.to_string(),
                expire,
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn sticky_len(&self) -> usize {
        self.sticky_cache.lock().len()
    }
}

/// Sticky keys bind the inbound source to the destination:
/// `network|source|destination-key`.
pub(crate) fn sticky_key(
    ctx: &InboundContext,
    network: Network,
    destination: &Destination,
) -> String {
    let source = ctx
        .source
        .map(|source| source.ip().to_string())
        .unwrap_or_default();
    format!("{}|{}|{}", network, source, destination_key(destination))
}

/// FQDN destinations collapse to their registrable domain (eTLD+1) so related
/// hosts map to one member; address literals are used as-is.
pub(crate) fn destination_key(destination: &Destination) -> String {
    let host = match &destination.host {
        Host::Fqdn(fqdn) => {
            let normalized = fqdn.trim_end_matches('.').to_ascii_lowercase();
            registrable_domain(&normalized).unwrap_or(normalized)
        }
        Host::Ip(ip) => ip.to_string(),
    };
    format!("{}:{}", host, destination.port)
}

fn registrable_domain(fqdn: &str) -> Option<String> {
    static PUBLIC_SUFFIX_LIST: Lazy<List> = Lazy::new(|| {
        const BUNDLED: &[u8] = include_bytes!("../../../resources/public_suffix_list.dat");
        List::from_bytes(BUNDLED).unwrap_or_default()
    });
    let domain = PUBLIC_SUFFIX_LIST.domain(fqdn.as_bytes())?;
    Some(String::from_utf8_lossy(domain.as_bytes()).into_owned())
}

/// Highest-random-weight pick: maximum `fnv1a64(key|tag)` wins, first on ties.
pub(crate) fn rendezvous_pick(key: &str, candidates: &[OutboundHandle]) -> OutboundHandle {
    let mut selected = &candidates[0];
    let mut best_score = 0u64;
    let mut first = true;
    for detour in candidates {
        let score = fnv1a64(&format!("{}|{}", key, detour.tag()));
        if first || score > best_score {
            selected = detour;
            best_score = score;
            first = false;
        }
    }
    Arc::clone(selected)
}

pub(crate) fn fnv1a64(data: &str) -> u64 {
    const OFFSET: u64 = 0xCBF2_9CE4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01B3;
    let mut hash = OFFSET;
    for byte in data.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
