//! Fallback group: first available member per network wins, with dial-time
//! failover and probe-driven recovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use rb_config::FallbackOutboundOptions;

use crate::adapter::{
    BoxConn, BoxPacketConn, InboundContext, Outbound, OutboundGroup, OutboundHandle,
};
use crate::common::interrupt::InterruptGroup;
use crate::error::{Error, Result};
use crate::outbound::group::{real_tag, GroupServices, HealthChecker};
use crate::types::{Destination, Network};

pub const TYPE_FALLBACK: &str = "fallback";

const GROUP_NETWORKS: [Network; 2] = [Network::Tcp, Network::Udp];

/// Fallback outbound adapter: resolves member tags at `start`, then delegates
/// to the inner [`FallbackGroup`].
pub struct Fallback {
    tag: String,
    services: GroupServices,
    tags: Vec<String>,
    url: String,
    interval: Duration,
    idle_timeout: Duration,
    timeout: Duration,
    interrupt_external_connections: bool,
    group: OnceCell<FallbackGroup>,
}

impl Fallback {
    pub fn new(
        services: GroupServices,
        tag: impl Into<String>,
        options: FallbackOutboundOptions,
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
            interrupt_external_connections: options.interrupt_exist_connections,
            group: OnceCell::new(),
        })
    }

    /// Resolve member tags and build the inner group.
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
        let group = FallbackGroup::new(
            &self.services,
            outbounds,
            self.url.clone(),
            self.interval,
            self.idle_timeout,
            self.timeout,
            self.interrupt_external_connections,
        )?;
        self.group
            .set(group)
            .map_err(|_| Error::invalid_config("fallback group started twice"))
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

    fn group(&self) -> Result<&FallbackGroup> {
        self.group.get().ok_or(Error::NotStarted)
    }

    /// Accept a connection on behalf of this group; it is marked external so a
    /// selection change only interrupts it when configured to.
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
impl Outbound for Fallback {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> &'static str {
        TYPE_FALLBACK
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

impl OutboundGroup for Fallback {
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

/// The dialing core of a fallback group.
pub struct FallbackGroup {
    inner: Arc<FallbackGroupInner>,
}

struct FallbackGroupInner {
    checker: HealthChecker,
    outbounds: Vec<OutboundHandle>,
    selected_tcp: RwLock<Option<OutboundHandle>>,
    selected_udp: RwLock<Option<OutboundHandle>>,
    interrupt_group: InterruptGroup,
    interrupt_external_connections: bool,
}

impl FallbackGroup {
    pub fn new(
        services: &GroupServices,
        outbounds: Vec<OutboundHandle>,
        url: String,
        interval: Duration,
        idle_timeout: Duration,
        timeout: Duration,
        interrupt_external_connections: bool,
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
        let inner = Arc::new(FallbackGroupInner {
            checker: checker.clone(),
            outbounds,
            selected_tcp: RwLock::new(None),
            selected_udp: RwLock::new(None),
            interrupt_group: InterruptGroup::new(),
            interrupt_external_connections,
        });
        // The checker keeps only a weak back-reference; the group owns the
        // checker, never the other way around.
        let weak = Arc::downgrade(&inner);
        checker.set_on_update(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.perform_update_check();
            }
        }));
        Ok(Self { inner })
    }

    pub fn post_start(&self) {
        self.inner.checker.post_start();
    }

    pub fn touch(&self) {
        self.inner.checker.touch();
    }

    pub fn close(&self) {
        self.inner.checker.close();
    }

    pub fn now(&self) -> String {
        self.inner.now()
    }

    pub async fn dial_context(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Destination,
    ) -> Result<BoxConn> {
        self.inner.dial_context(ctx, network, destination).await
    }

    pub async fn listen_packet(
        &self,
        ctx: &InboundContext,
        destination: &Destination,
    ) -> Result<BoxPacketConn> {
        self.inner.listen_packet(ctx, destination).await
    }

    /// Recompute preferred members after a probe round, interrupting existing
    /// connections when the selection changed.
    pub fn perform_update_check(&self) {
        self.inner.perform_update_check();
    }

    #[cfg(test)]
    pub(crate) fn checker(&self) -> &HealthChecker {
        &self.inner.checker
    }

    #[cfg(test)]
    pub(crate) fn interrupt_group(&self) -> &InterruptGroup {
        &self.inner.interrupt_group
    }
}

impl FallbackGroupInner {
    fn now(&self) -> String {
        if let Some(selected) = self.selected_tcp.read().as_ref() {
            return selected.tag().to_string();
        }
        if let Some(selected) = self.selected_udp.read().as_ref() {
            return selected.tag().to_string();
        }
        match self.outbounds.first() {
            Some(first) => first.tag().to_string(),
            None => String::new(),
        }
    }

    /// First member with probe history for `network`, else the first member
    /// supporting it. The flag reports whether the pick has history.
    fn select(&self, network: Network) -> (Option<OutboundHandle>, bool) {
        for detour in &self.outbounds {
            if !detour.network().contains(&network) {
                continue;
            }
            if self
                .checker
                .history()
                .load(&real_tag(detour.as_ref()))
                .is_some()
            {
                return (Some(Arc::clone(detour)), true);
            }
        }
        for detour in &self.outbounds {
            if !detour.network().contains(&network) {
                continue;
            }
            return (Some(Arc::clone(detour)), false);
        }
        (None, false)
    }

    async fn dial_context(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Destination,
    ) -> Result<BoxConn> {
        let mut last_err = None;
        let mut triggered_check = false;
        for detour in self.try_list(network) {
            match detour.dial_context(ctx, network, destination).await {
                Ok(conn) => {
                    self.store_selected(network, &detour);
                    return Ok(self
                        .interrupt_group
                        .new_conn(conn, ctx.is_external_connection));
                }
                Err(err) => {
                    self.on_dial_failure(&detour, &err, &mut triggered_check);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::not_found("supported outbound", network.as_str())))
    }

    async fn listen_packet(
        &self,
        ctx: &InboundContext,
        destination: &Destination,
    ) -> Result<BoxPacketConn> {
        let mut last_err = None;
        let mut triggered_check = false;
        for detour in self.try_list(Network::Udp) {
            match detour.listen_packet(ctx, destination).await {
                Ok(conn) => {
                    self.store_selected(Network::Udp, &detour);
                    return Ok(self
                        .interrupt_group
                        .new_packet_conn(conn, ctx.is_external_connection));
                }
                Err(err) => {
                    self.on_dial_failure(&detour, &err, &mut triggered_check);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::not_found("supported outbound", Network::Udp.as_str())))
    }

    /// Members supporting `network`, preferred (with history) before others,
    /// both partitions in configuration order.
    fn try_list(&self, network: Network) -> Vec<OutboundHandle> {
        let mut preferred = Vec::with_capacity(self.outbounds.len());
        let mut others = Vec::with_capacity(self.outbounds.len());
        for detour in &self.outbounds {
            if !detour.network().contains(&network) {
                continue;
            }
            if self
                .checker
                .history()
                .load(&real_tag(detour.as_ref()))
                .is_some()
            {
                preferred.push(Arc::clone(detour));
            } else {
                others.push(Arc::clone(detour));
            }
        }
        preferred.extend(others);
        preferred
    }

    fn on_dial_failure(&self, detour: &OutboundHandle, err: &Error, triggered_check: &mut bool) {
        tracing::error!(
            target: "rb_core::outbound",
            outbound = %detour.tag(),
            error = %err,
            "fallback dial failed"
        );
        self.checker.history().delete(&real_tag(detour.as_ref()));
        if !*triggered_check {
            *triggered_check = true;
            let checker = self.checker.clone();
            tokio::spawn(async move {
                checker.check_outbounds(true).await;
            });
        }
    }

    fn store_selected(&self, network: Network, detour: &OutboundHandle) {
        let slot = match network {
            Network::Tcp => &self.selected_tcp,
            Network::Udp => &self.selected_udp,
        };
        let previous = slot.write().replace(Arc::clone(detour));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, detour) {
                self.interrupt_group
                    .interrupt(self.interrupt_external_connections);
            }
        }
    }

    fn perform_update_check(&self) {
        let mut updated = false;
        for network in GROUP_NETWORKS {
            let (selected, exists) = self.select(network);
            let Some(selected) = selected else { continue };
            let slot = match network {
                Network::Tcp => &self.selected_tcp,
                Network::Udp => &self.selected_udp,
            };
            let mut slot = slot.write();
            match slot.as_ref() {
                None => {
                    *slot = Some(selected);
                }
                Some(previous) => {
                    if exists && !Arc::ptr_eq(previous, &selected) {
                        updated = true;
                        *slot = Some(selected);
                    }
                }
            }
        }
        if updated {
            self.interrupt_group
                .interrupt(self.interrupt_external_connections);
        }
    }
}
