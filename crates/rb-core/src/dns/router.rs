//! DNS router core: rule matching, transport selection, and the racing
//! dispatchers.
//!
//! Two racers exist. The plain racer starts every selected transport at once
//! and prefers the first NoError answer. The hedged racer additionally holds
//! a fallback cohort that only starts once `upstream_timeout` has elapsed,
//! trading a little latency for resilience against a slow primary set.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use rb_config::{DnsOptions, RejectMethod};

use crate::adapter::InboundContext;
use crate::dns::client::{DnsClient, DnsClientOptions, ResponseCheck};
use crate::dns::message::{
    fqdn_to_domain, Message, RCODE_FORMAT_ERROR, RCODE_REFUSED, RCODE_SUCCESS, TYPE_A, TYPE_AAAA,
};
use crate::dns::reverse::ReverseMapping;
use crate::dns::rule::{
    build_rules, extract_predefined_addrs, is_address_query_type, DnsRule, DnsRuleAction,
};
use crate::dns::transport::{DnsTransport, DnsTransportManager, TYPE_FAKEIP};
use crate::dns::{DnsQueryOptions, DomainStrategy};
use crate::error::{Error, Result};

type TransportHandle = Arc<dyn DnsTransport>;

/// Result of one rule-list walk.
struct DnsMatch {
    transports: Vec<TransportHandle>,
    fallback_transports: Vec<TransportHandle>,
    upstream_timeout: Duration,
    fallback_timeout: Duration,
    fallback_grace: Duration,
    rule: Option<(Arc<dyn DnsRule>, usize)>,
}

pub struct DnsRouter {
    transport: Arc<DnsTransportManager>,
    client: Arc<DnsClient>,
    rules: Vec<Arc<dyn DnsRule>>,
    default_strategy: DomainStrategy,
    upstream_timeout: Duration,
    fallback_timeout: Duration,
    fallback_grace: Duration,
    reverse_mapping: Option<ReverseMapping>,
}

impl DnsRouter {
    pub fn new(transport: Arc<DnsTransportManager>, options: &DnsOptions) -> Result<Self> {
        let client = Arc::new(DnsClient::new(DnsClientOptions {
            disable_cache: options.disable_cache,
            disable_expire: options.disable_expire,
            independent_cache: options.independent_cache,
            cache_capacity: options.cache_capacity,
            client_subnet: options.client_subnet,
        }));
        let rules = build_rules(options.rules.clone())?;
        Ok(Self {
            transport,
            client,
            rules,
            default_strategy: options.strategy,
            upstream_timeout: Duration::from_millis(u64::from(options.upstream_timeout_ms)),
            fallback_timeout: Duration::from_millis(u64::from(options.fallback_timeout_ms)),
            fallback_grace: Duration::from_millis(u64::from(options.fallback_grace_ms)),
            reverse_mapping: options
                .reverse_mapping
                .then(ReverseMapping::new),
        })
    }

    pub fn start(&self) {
        self.client.start();
    }

    pub fn clear_cache(&self) {
        self.client.clear_cache();
    }

    pub fn lookup_reverse_mapping(&self, addr: IpAddr) -> Option<String> {
        self.reverse_mapping.as_ref()?.lookup(addr)
    }

    /// Exchange a DNS message. `cancel` carries the caller's lifetime;
    /// internal deadlines only ever shorten it.
    pub async fn exchange(
        &self,
        cancel: &CancellationToken,
        message: &Message,
        mut options: DnsQueryOptions,
    ) -> Result<Message> {
        let question = match message.question.as_slice() {
            [question] => question.clone(),
            _ => {
                tracing::warn!(
                    target: "rb_core::dns",
                    count = message.question.len(),
                    "bad question size"
                );
                return Ok(Message::response_to(message, RCODE_FORMAT_ERROR));
            }
        };
        tracing::debug!(
            target: "rb_core::dns",
            domain = %question.name,
            qtype = question.qtype,
            "exchange"
        );
        #[cfg(feature = "metrics")]
        metrics::counter!("dns_exchange_total").increment(1);

        let mut metadata = InboundContext {
            query_type: Some(question.qtype),
            ip_version: match question.qtype {
                TYPE_A => Some(4),
                TYPE_AAAA => Some(6),
                _ => None,
            },
            domain: fqdn_to_domain(&question.name),
            ..InboundContext::default()
        };

        let (response, selected_transport) = if let Some(transport) = options.transport.clone() {
            apply_legacy_defaults(&transport, &mut options);
            if options.strategy == DomainStrategy::AsIs {
                options.strategy = self.default_strategy;
            }
            let exchange = self.client.exchange(&transport, message, &options, None);
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = bounded(self.upstream_timeout, exchange) => result,
            };
            (result?, Some(transport))
        } else {
            self.exchange_with_rules(cancel, message, &options, &mut metadata)
                .await?
        };

        if let Some(reverse) = &self.reverse_mapping {
            let from_fake_ip = selected_transport
                .as_ref()
                .is_some_and(|transport| transport.transport_type() == TYPE_FAKEIP);
            if !from_fake_ip {
                for record in &response.answer {
                    if let Some(addr) = record.as_ip() {
                        reverse.insert(
                            addr,
                            fqdn_to_domain(&record.name),
                            Duration::from_secs(u64::from(record.ttl)),
                        );
                    }
                }
            }
        }
        Ok(response)
    }

    /// Resolve `domain` to addresses through the rule list.
    pub async fn lookup(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        mut options: DnsQueryOptions,
    ) -> Result<Vec<IpAddr>> {
        tracing::debug!(target: "rb_core::dns", domain = %domain, "lookup domain");
        let mut metadata = InboundContext {
            domain: fqdn_to_domain(domain),
            ..InboundContext::default()
        };

        let result = if let Some(transport) = options.transport.clone() {
            apply_legacy_defaults(&transport, &mut options);
            if options.strategy == DomainStrategy::AsIs {
                options.strategy = self.default_strategy;
            }
            let lookup = self.client.lookup(&transport, domain, &options, None);
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = bounded(self.upstream_timeout, lookup) => result,
            }
        } else {
            self.lookup_with_rules(cancel, domain, &options, &mut metadata)
                .await
        };

        let result = match result {
            Ok(addrs) if addrs.is_empty() => Err(Error::EmptyResult),
            other => other,
        };
        match &result {
            Ok(addrs) => {
                tracing::info!(target: "rb_core::dns", domain = %domain, addrs = ?addrs, "lookup succeed");
            }
            Err(err) if err.is_rejected() => {
                tracing::debug!(target: "rb_core::dns", domain = %domain, error = %err, "response rejected");
            }
            Err(err) => {
                tracing::error!(target: "rb_core::dns", domain = %domain, error = %err, "lookup failed");
            }
        }
        result
    }

    async fn exchange_with_rules(
        &self,
        cancel: &CancellationToken,
        message: &Message,
        options: &DnsQueryOptions,
        metadata: &mut InboundContext,
    ) -> Result<(Message, Option<TransportHandle>)> {
        let is_address_query = metadata
            .query_type
            .map(is_address_query_type)
            .unwrap_or(false);
        let mut rule_index = None;
        loop {
            let mut dns_options = options.clone();
            let matched = self.match_dns(metadata, true, rule_index, is_address_query, &mut dns_options);
            rule_index = matched.rule.as_ref().map(|(_, index)| *index);
            if let Some((rule, _)) = &matched.rule {
                match rule.action() {
                    DnsRuleAction::Reject { method } => match method {
                        RejectMethod::Default => {
                            return Ok((Message::response_to(message, RCODE_REFUSED), None));
                        }
                        RejectMethod::Drop => return Err(Error::Dropped),
                    },
                    DnsRuleAction::Predefined { rcode, answers } => {
                        return Ok((predefined_response(message, *rcode, answers), None));
                    }
                    _ => {}
                }
            }
            let rule = matched.rule.as_ref().map(|(rule, _)| Arc::clone(rule));
            let with_address_limit = rule
                .as_ref()
                .map(|rule| rule.with_address_limit())
                .unwrap_or(false);
            let (primary_options, fallback_options) = self.derive_racer_options(&matched, dns_options);

            let result = if !matched.upstream_timeout.is_zero()
                && !matched.fallback_transports.is_empty()
            {
                self.exchange_hedged_racer(
                    cancel,
                    &matched,
                    message,
                    &primary_options,
                    &fallback_options,
                    rule.clone(),
                    with_address_limit,
                    metadata,
                )
                .await
            } else {
                let deadline = (!matched.upstream_timeout.is_zero())
                    .then_some(matched.upstream_timeout);
                self.exchange_racer(
                    cancel,
                    deadline,
                    &matched.transports,
                    message,
                    &primary_options,
                    rule.clone(),
                    with_address_limit,
                    metadata,
                )
                .await
            };
            match result {
                Ok(success) => return Ok(success),
                Err(err) => {
                    if err.is_rejected() {
                        tracing::debug!(
                            target: "rb_core::dns",
                            domain = %metadata.domain,
                            error = %err,
                            "response rejected"
                        );
                        if with_address_limit {
                            continue;
                        }
                    } else {
                        tracing::error!(
                            target: "rb_core::dns",
                            domain = %metadata.domain,
                            error = %err,
                            "exchange failed"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn lookup_with_rules(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        options: &DnsQueryOptions,
        metadata: &mut InboundContext,
    ) -> Result<Vec<IpAddr>> {
        let mut rule_index = None;
        loop {
            let mut dns_options = options.clone();
            let matched = self.match_dns(metadata, false, rule_index, true, &mut dns_options);
            rule_index = matched.rule.as_ref().map(|(_, index)| *index);
            if let Some((rule, _)) = &matched.rule {
                match rule.action() {
                    DnsRuleAction::Reject { method } => match method {
                        RejectMethod::Default => return Err(Error::ResponseRejected),
                        RejectMethod::Drop => return Err(Error::Dropped),
                    },
                    DnsRuleAction::Predefined { rcode, answers } => {
                        if *rcode != RCODE_SUCCESS {
                            return Err(Error::Rcode(*rcode));
                        }
                        return Ok(extract_predefined_addrs(answers));
                    }
                    _ => {}
                }
            }
            let rule = matched.rule.as_ref().map(|(rule, _)| Arc::clone(rule));
            let with_address_limit = rule
                .as_ref()
                .map(|rule| rule.with_address_limit())
                .unwrap_or(false);
            let (primary_options, fallback_options) = self.derive_racer_options(&matched, dns_options);

            let result = if !matched.upstream_timeout.is_zero()
                && !matched.fallback_transports.is_empty()
            {
                self.lookup_hedged_racer(
                    cancel,
                    &matched,
                    domain,
                    &primary_options,
                    &fallback_options,
                    rule.clone(),
                    with_address_limit,
                    metadata,
                )
                .await
            } else {
                let deadline = (!matched.upstream_timeout.is_zero())
                    .then_some(matched.upstream_timeout);
                self.lookup_racer(
                    cancel,
                    deadline,
                    &matched.transports,
                    domain,
                    &primary_options,
                    rule.clone(),
                    with_address_limit,
                    metadata,
                )
                .await
            };
            match result {
                Ok(addrs) => return Ok(addrs),
                Err(err) => {
                    if !with_address_limit {
                        return Err(err);
                    }
                    tracing::debug!(
                        target: "rb_core::dns",
                        domain = %domain,
                        error = %err,
                        "lookup attempt failed, trying subsequent rules"
                    );
                }
            }
        }
    }

    /// Build independent primary/fallback option copies: single-transport
    /// legacy fill-ins, strategy defaulting, and the cache-pollution guard.
    fn derive_racer_options(
        &self,
        matched: &DnsMatch,
        dns_options: DnsQueryOptions,
    ) -> (DnsQueryOptions, DnsQueryOptions) {
        let mut primary_options = dns_options.clone();
        let mut fallback_options = dns_options;
        if let [transport] = matched.transports.as_slice() {
            apply_legacy_defaults(transport, &mut primary_options);
        }
        if let [transport] = matched.fallback_transports.as_slice() {
            apply_legacy_defaults(transport, &mut fallback_options);
        }
        if primary_options.strategy == DomainStrategy::AsIs {
            primary_options.strategy = self.default_strategy;
        }
        if fallback_options.strategy == DomainStrategy::AsIs {
            fallback_options.strategy = self.default_strategy;
        }
        if !self.client.independent_cache() {
            // A shared cache would be polluted by racing writers, so racing
            // disables it for the raced queries.
            if matched.transports.len() > 1 {
                primary_options.disable_cache = true;
            }
            if !matched.upstream_timeout.is_zero() && !matched.fallback_transports.is_empty() {
                fallback_options.disable_cache = true;
            }
        }
        (primary_options, fallback_options)
    }

    /// Walk the rule list from `after_index + 1`, merging options along the
    /// way, until a terminating action resolves.
    fn match_dns(
        &self,
        metadata: &mut InboundContext,
        allow_fake_ip: bool,
        after_index: Option<usize>,
        is_address_query: bool,
        options: &mut DnsQueryOptions,
    ) -> DnsMatch {
        let start = after_index.map(|index| index + 1).unwrap_or(0);
        for (index, rule) in self.rules.iter().enumerate().skip(start) {
            if rule.with_address_limit() && !is_address_query {
                continue;
            }
            metadata.reset_rule_cache();
            if !rule.matches(metadata) {
                continue;
            }
            let display_index = index + 1;
            let description = rule.describe();
            if description.is_empty() {
                tracing::debug!(
                    target: "rb_core::dns",
                    "match[{}] => {}",
                    display_index,
                    rule.action()
                );
            } else {
                tracing::debug!(
                    target: "rb_core::dns",
                    "match[{}] {} => {}",
                    display_index,
                    description,
                    rule.action()
                );
            }
            match rule.action() {
                DnsRuleAction::Route {
                    servers,
                    fallback_servers,
                    strategy,
                    disable_cache,
                    rewrite_ttl,
                    client_subnet,
                    upstream_timeout,
                    fallback_timeout,
                    fallback_grace,
                } => {
                    if servers.is_empty() {
                        continue;
                    }
                    let mut has_fake_ip = false;
                    let transports =
                        self.resolve_transports(servers, allow_fake_ip, &mut has_fake_ip, "transport");
                    if transports.is_empty() {
                        continue;
                    }
                    let fallback_transports = self.resolve_transports(
                        fallback_servers,
                        allow_fake_ip,
                        &mut has_fake_ip,
                        "fallback transport",
                    );
                    if let Some(strategy) = strategy {
                        if *strategy != DomainStrategy::AsIs {
                            options.strategy = *strategy;
                        }
                    }
                    if has_fake_ip || *disable_cache {
                        options.disable_cache = true;
                    }
                    if let Some(ttl) = rewrite_ttl {
                        options.rewrite_ttl = Some(*ttl);
                    }
                    if let Some(prefix) = client_subnet {
                        options.client_subnet = Some(*prefix);
                    }
                    if let [transport] = transports.as_slice() {
                        apply_legacy_defaults(transport, options);
                    }
                    let mut upstream = upstream_timeout.unwrap_or_default();
                    if upstream.is_zero() {
                        upstream = self.upstream_timeout;
                    }
                    let mut fallback = fallback_timeout.unwrap_or_default();
                    if fallback.is_zero() {
                        fallback = self.fallback_timeout;
                    }
                    if fallback.is_zero() {
                        fallback = upstream;
                    }
                    let mut grace = fallback_grace.unwrap_or_default();
                    if grace.is_zero() {
                        grace = self.fallback_grace;
                    }
                    return DnsMatch {
                        transports,
                        fallback_transports,
                        upstream_timeout: upstream,
                        fallback_timeout: fallback,
                        fallback_grace: grace,
                        rule: Some((Arc::clone(rule), index)),
                    };
                }
                DnsRuleAction::RouteOptions {
                    strategy,
                    disable_cache,
                    rewrite_ttl,
                    client_subnet,
                } => {
                    if let Some(strategy) = strategy {
                        if *strategy != DomainStrategy::AsIs {
                            options.strategy = *strategy;
                        }
                    }
                    if *disable_cache {
                        options.disable_cache = true;
                    }
                    if let Some(ttl) = rewrite_ttl {
                        options.rewrite_ttl = Some(*ttl);
                    }
                    if let Some(prefix) = client_subnet {
                        options.client_subnet = Some(*prefix);
                    }
                }
                DnsRuleAction::Reject { .. } | DnsRuleAction::Predefined { .. } => {
                    return DnsMatch {
                        transports: Vec::new(),
                        fallback_transports: Vec::new(),
                        upstream_timeout: self.upstream_timeout,
                        fallback_timeout: self.fallback_timeout,
                        fallback_grace: self.fallback_grace,
                        rule: Some((Arc::clone(rule), index)),
                    };
                }
            }
        }
        let transports = match self.transport.default_transport() {
            Some(default) => vec![default],
            None => Vec::new(),
        };
        DnsMatch {
            transports,
            fallback_transports: Vec::new(),
            upstream_timeout: self.upstream_timeout,
            fallback_timeout: self.fallback_timeout,
            fallback_grace: self.fallback_grace,
            rule: None,
        }
    }

    /// Resolve server tags, deduplicating and dropping unknown tags without
    /// aborting the match. Fake-IP transports are filtered when the caller
    /// cannot consume synthetic addresses.
    fn resolve_transports(
        &self,
        tags: &[String],
        allow_fake_ip: bool,
        has_fake_ip: &mut bool,
        label: &'static str,
    ) -> Vec<TransportHandle> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(tags.len());
        for tag in tags {
            if tag.is_empty() || !seen.insert(tag.as_str()) {
                continue;
            }
            let Some(transport) = self.transport.get(tag) else {
                tracing::error!(target: "rb_core::dns", transport = %tag, "{} not found", label);
                continue;
            };
            if transport.transport_type() == TYPE_FAKEIP {
                *has_fake_ip = true;
                if !allow_fake_ip {
                    continue;
                }
            }
            resolved.push(transport);
        }
        resolved
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange_racer(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
        transports: &[TransportHandle],
        message: &Message,
        options: &DnsQueryOptions,
        rule: Option<Arc<dyn DnsRule>>,
        with_address_limit: bool,
        metadata: &InboundContext,
    ) -> Result<(Message, Option<TransportHandle>)> {
        let query_cancel = CancellationToken::new();
        let _query_guard = query_cancel.clone().drop_guard();
        let (tx, mut rx) = mpsc::channel(transports.len().max(1));
        for transport in transports {
            let tx = tx.clone();
            let token = query_cancel.clone();
            let client = Arc::clone(&self.client);
            let transport = Arc::clone(transport);
            let message = message.clone();
            let options = options.clone();
            let response_check = build_response_check(rule.clone(), with_address_limit, metadata);
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = token.cancelled() => return,
                    result = client.exchange(&transport, &message, &options, response_check) => result,
                };
                let _ = tx.try_send((result, transport));
            });
        }
        drop(tx);

        let deadline_at = deadline.map(|timeout| tokio::time::Instant::now() + timeout);
        let mut fallback_response: Option<(Message, Option<TransportHandle>)> = None;
        let mut errors = Vec::new();
        let mut all_rejected = true;
        let mut all_rejected_only = true;
        for _ in 0..transports.len() {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    return fallback_response.ok_or(Error::Cancelled);
                }
                _ = sleep_until_or_forever(deadline_at) => {
                    return fallback_response
                        .ok_or_else(|| Error::Timeout(deadline.unwrap_or_default()));
                }
                received = rx.recv() => received,
            };
            let Some((result, transport)) = received else {
                break;
            };
            match result {
                Ok(response) => {
                    // Prefer the first NoError response; retain the first
                    // response of any other rcode in case nothing better
                    // arrives.
                    if response.rcode == RCODE_SUCCESS {
                        query_cancel.cancel();
                        return Ok((response, Some(transport)));
                    }
                    if fallback_response.is_none() {
                        fallback_response = Some((response, Some(transport)));
                    }
                }
                Err(err) => {
                    classify_rejection(&err, &mut all_rejected, &mut all_rejected_only);
                    errors.push(err);
                }
            }
        }
        if let Some(fallback) = fallback_response {
            return Ok(fallback);
        }
        if all_rejected_only {
            return Err(Error::ResponseRejectedCached);
        }
        if all_rejected {
            return Err(Error::ResponseRejected);
        }
        Err(Error::aggregate(errors))
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange_hedged_racer(
        &self,
        cancel: &CancellationToken,
        matched: &DnsMatch,
        message: &Message,
        primary_options: &DnsQueryOptions,
        fallback_options: &DnsQueryOptions,
        rule: Option<Arc<dyn DnsRule>>,
        with_address_limit: bool,
        metadata: &InboundContext,
    ) -> Result<(Message, Option<TransportHandle>)> {
        let query_cancel = CancellationToken::new();
        let _query_guard = query_cancel.clone().drop_guard();
        let fallback_start = start_fallback_timer(&query_cancel, matched.upstream_timeout);

        let total = matched.transports.len() + matched.fallback_transports.len();
        let (tx, mut rx) = mpsc::channel(total.max(1));

        // Primary tasks live for upstream_timeout + fallback_grace, giving a
        // late primary answer a window to beat the fallback cohort.
        let primary_timeout = matched.upstream_timeout + matched.fallback_grace;
        for transport in &matched.transports {
            let tx = tx.clone();
            let token = query_cancel.clone();
            let client = Arc::clone(&self.client);
            let transport = Arc::clone(transport);
            let message = message.clone();
            let options = primary_options.clone();
            let response_check = build_response_check(rule.clone(), with_address_limit, metadata);
            tokio::spawn(async move {
                let exchange = client.exchange(&transport, &message, &options, response_check);
                let result = tokio::select! {
                    _ = token.cancelled() => return,
                    result = timeout(primary_timeout, exchange) => {
                        result.unwrap_or(Err(Error::Timeout(primary_timeout)))
                    }
                };
                let _ = tx.try_send((result, transport));
            });
        }
        let fallback_timeout = matched.fallback_timeout;
        for transport in &matched.fallback_transports {
            let tx = tx.clone();
            let token = query_cancel.clone();
            let start = fallback_start.clone();
            let client = Arc::clone(&self.client);
            let transport = Arc::clone(transport);
            let message = message.clone();
            let options = fallback_options.clone();
            let response_check = build_response_check(rule.clone(), with_address_limit, metadata);
            tokio::spawn(async move {
                tokio::select! {
                    _ = start.cancelled() => {}
                    _ = token.cancelled() => return,
                }
                if token.is_cancelled() {
                    return;
                }
                let exchange = client.exchange(&transport, &message, &options, response_check);
                let result = if fallback_timeout.is_zero() {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        result = exchange => result,
                    }
                } else {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        result = timeout(fallback_timeout, exchange) => {
                            result.unwrap_or(Err(Error::Timeout(fallback_timeout)))
                        }
                    }
                };
                let _ = tx.try_send((result, transport));
            });
        }
        drop(tx);

        let mut fallback_response: Option<(Message, Option<TransportHandle>)> = None;
        let mut errors = Vec::new();
        let mut all_rejected = true;
        let mut all_rejected_only = true;
        for _ in 0..total {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    return fallback_response.ok_or(Error::Cancelled);
                }
                received = rx.recv() => received,
            };
            let Some((result, transport)) = received else {
                break;
            };
            match result {
                Ok(response) => {
                    if response.rcode == RCODE_SUCCESS {
                        query_cancel.cancel();
                        return Ok((response, Some(transport)));
                    }
                    if fallback_response.is_none() {
                        fallback_response = Some((response, Some(transport)));
                    }
                }
                Err(err) => {
                    classify_rejection(&err, &mut all_rejected, &mut all_rejected_only);
                    errors.push(err);
                }
            }
        }
        if let Some(fallback) = fallback_response {
            return Ok(fallback);
        }
        if all_rejected_only {
            return Err(Error::ResponseRejectedCached);
        }
        if all_rejected {
            return Err(Error::ResponseRejected);
        }
        Err(Error::aggregate(errors))
    }

    #[allow(clippy::too_many_arguments)]
    async fn lookup_racer(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
        transports: &[TransportHandle],
        domain: &str,
        options: &DnsQueryOptions,
        rule: Option<Arc<dyn DnsRule>>,
        with_address_limit: bool,
        metadata: &InboundContext,
    ) -> Result<Vec<IpAddr>> {
        let query_cancel = CancellationToken::new();
        let _query_guard = query_cancel.clone().drop_guard();
        let (tx, mut rx) = mpsc::channel(transports.len().max(1));
        for transport in transports {
            let tx = tx.clone();
            let token = query_cancel.clone();
            let client = Arc::clone(&self.client);
            let transport = Arc::clone(transport);
            let domain = domain.to_string();
            let options = options.clone();
            let response_check = build_response_check(rule.clone(), with_address_limit, metadata);
            tokio::spawn(async move {
                let lookup = client.lookup(&transport, &domain, &options, response_check);
                let result = tokio::select! {
                    _ = token.cancelled() => return,
                    result = lookup => result,
                };
                let result = coerce_empty(result);
                let _ = tx.try_send(result);
            });
        }
        drop(tx);

        let deadline_at = deadline.map(|timeout| tokio::time::Instant::now() + timeout);
        // The first received result is retained and surfaced when no branch
        // succeeds before the context ends.
        let mut retained_err: Option<Error> = None;
        for _ in 0..transports.len() {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(retained_err.unwrap_or(Error::Cancelled));
                }
                _ = sleep_until_or_forever(deadline_at) => {
                    return Err(
                        retained_err.unwrap_or_else(|| Error::Timeout(deadline.unwrap_or_default()))
                    );
                }
                received = rx.recv() => received,
            };
            let Some(result) = received else { break };
            match result {
                Ok(addrs) => {
                    query_cancel.cancel();
                    return Ok(addrs);
                }
                Err(err) => {
                    if retained_err.is_none() {
                        retained_err = Some(err);
                    }
                }
            }
        }
        Err(retained_err.unwrap_or_else(|| Error::aggregate(Vec::new())))
    }

    #[allow(clippy::too_many_arguments)]
    async fn lookup_hedged_racer(
        &self,
        cancel: &CancellationToken,
        matched: &DnsMatch,
        domain: &str,
        primary_options: &DnsQueryOptions,
        fallback_options: &DnsQueryOptions,
        rule: Option<Arc<dyn DnsRule>>,
        with_address_limit: bool,
        metadata: &InboundContext,
    ) -> Result<Vec<IpAddr>> {
        let query_cancel = CancellationToken::new();
        let _query_guard = query_cancel.clone().drop_guard();
        let fallback_start = start_fallback_timer(&query_cancel, matched.upstream_timeout);

        let total = matched.transports.len() + matched.fallback_transports.len();
        let (tx, mut rx) = mpsc::channel(total.max(1));
        let primary_timeout = matched.upstream_timeout + matched.fallback_grace;
        for transport in &matched.transports {
            let tx = tx.clone();
            let token = query_cancel.clone();
            let client = Arc::clone(&self.client);
            let transport = Arc::clone(transport);
            let domain = domain.to_string();
            let options = primary_options.clone();
            let response_check = build_response_check(rule.clone(), with_address_limit, metadata);
            tokio::spawn(async move {
                let lookup = client.lookup(&transport, &domain, &options, response_check);
                let result = tokio::select! {
                    _ = token.cancelled() => return,
                    result = timeout(primary_timeout, lookup) => {
                        result.unwrap_or(Err(Error::Timeout(primary_timeout)))
                    }
                };
                let _ = tx.try_send(coerce_empty(result));
            });
        }
        let fallback_timeout = matched.fallback_timeout;
        for transport in &matched.fallback_transports {
            let tx = tx.clone();
            let token = query_cancel.clone();
            let start = fallback_start.clone();
            let client = Arc::clone(&self.client);
            let transport = Arc::clone(transport);
            let domain = domain.to_string();
            let options = fallback_options.clone();
            let response_check = build_response_check(rule.clone(), with_address_limit, metadata);
            tokio::spawn(async move {
                tokio::select! {
                    _ = start.cancelled() => {}
                    _ = token.cancelled() => return,
                }
                if token.is_cancelled() {
                    return;
                }
                let lookup = client.lookup(&transport, &domain, &options, response_check);
                let result = if fallback_timeout.is_zero() {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        result = lookup => result,
                    }
                } else {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        result = timeout(fallback_timeout, lookup) => {
                            result.unwrap_or(Err(Error::Timeout(fallback_timeout)))
                        }
                    }
                };
                let _ = tx.try_send(coerce_empty(result));
            });
        }
        drop(tx);

        let mut retained_err: Option<Error> = None;
        for _ in 0..total {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(retained_err.unwrap_or(Error::Cancelled));
                }
                received = rx.recv() => received,
            };
            let Some(result) = received else { break };
            match result {
                Ok(addrs) => {
                    query_cancel.cancel();
                    return Ok(addrs);
                }
                Err(err) => {
                    if retained_err.is_none() {
                        retained_err = Some(err);
                    }
                }
            }
        }
        Err(retained_err.unwrap_or_else(|| Error::aggregate(Vec::new())))
    }
}

/// `fallback_start` fires once `upstream_timeout` elapses, or immediately if
/// the race is already over.
fn start_fallback_timer(
    query_cancel: &CancellationToken,
    upstream_timeout: Duration,
) -> CancellationToken {
    let fallback_start = CancellationToken::new();
    let signal = fallback_start.clone();
    let query_cancel = query_cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(upstream_timeout) => {}
            _ = query_cancel.cancelled() => {}
        }
        signal.cancel();
    });
    fallback_start
}

fn classify_rejection(err: &Error, all_rejected: &mut bool, all_rejected_only: &mut bool) {
    match err {
        Error::ResponseRejectedCached => {}
        Error::ResponseRejected => {
            *all_rejected_only = false;
        }
        _ => {
            *all_rejected = false;
            *all_rejected_only = false;
        }
    }
}

/// Lookup tasks coerce an empty success into an error so the racer keeps
/// waiting for a transport that actually has addresses.
fn coerce_empty(result: Result<Vec<IpAddr>>) -> Result<Vec<IpAddr>> {
    match result {
        Ok(addrs) if addrs.is_empty() => Err(Error::EmptyResult),
        other => other,
    }
}

/// Each racing task gets an independent snapshot of the metadata so late
/// losers can never write into the winner's state.
fn build_response_check(
    rule: Option<Arc<dyn DnsRule>>,
    with_address_limit: bool,
    metadata: &InboundContext,
) -> Option<Arc<ResponseCheck>> {
    if !with_address_limit {
        return None;
    }
    let rule = rule?;
    let base = metadata.clone();
    Some(Arc::new(move |addrs: &[IpAddr]| {
        let mut snapshot = base.clone();
        snapshot.reset_rule_cache();
        snapshot.destination_addresses = addrs.to_vec();
        rule.match_address_limit(&mut snapshot)
    }))
}

fn apply_legacy_defaults(transport: &TransportHandle, options: &mut DnsQueryOptions) {
    if options.strategy == DomainStrategy::AsIs {
        if let Some(strategy) = transport.legacy_strategy() {
            options.strategy = strategy;
        }
    }
    if options.client_subnet.is_none() {
        options.client_subnet = transport.legacy_client_subnet();
    }
}

fn predefined_response(query: &Message, rcode: u16, answers: &[crate::dns::message::Record]) -> Message {
    let mut response = Message::response_to(query, rcode);
    let question_name = query
        .question
        .first()
        .map(|question| question.name.clone())
        .unwrap_or_default();
    for record in answers {
        let mut record = record.clone();
        if record.name.is_empty() {
            record.name = question_name.clone();
        }
        response.answer.push(record);
    }
    response
}

/// Run `future` under `limit` when it is non-zero.
async fn bounded<T>(
    limit: Duration,
    future: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    if limit.is_zero() {
        future.await
    } else {
        match timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
