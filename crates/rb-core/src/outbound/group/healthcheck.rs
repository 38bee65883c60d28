//! Periodic URL-test probing of a fixed outbound set.
//!
//! The ticker self-quiesces after `idle_timeout` without traffic; the next
//! `touch` installs a fresh one. Probe rounds are single-flight: overlapping
//! triggers collapse into the round already running.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::adapter::OutboundHandle;
use crate::error::{Error, Result};
use crate::outbound::group::real_tag;
use crate::outbound::OutboundManager;
use crate::services::pause::{PauseManager, PauseRegistration};
use crate::services::urltest::{url_test, HistoryStorage, UrlTestHistory};

pub(crate) const DEFAULT_URL_TEST_INTERVAL: Duration = Duration::from_secs(3 * 60);
pub(crate) const DEFAULT_URL_TEST_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub(crate) const TCP_TIMEOUT: Duration = Duration::from_secs(5);

const URL_TEST_CONCURRENCY: usize = 10;

type UpdateCallback = Box<dyn Fn() + Send + Sync>;

/// Cloneable handle to one group's health checker.
#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<CheckerInner>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker").finish_non_exhaustive()
    }
}

struct CheckerInner {
    outbound: Arc<OutboundManager>,
    pause: Arc<PauseManager>,
    history: Arc<HistoryStorage>,
    outbounds: Vec<OutboundHandle>,
    url: String,
    interval: Duration,
    idle_timeout: Duration,
    timeout: Duration,
    checking: AtomicBool,
    last_active: Mutex<Instant>,
    state: Mutex<TickerState>,
    on_update: Mutex<Option<UpdateCallback>>,
}

#[derive(Default)]
struct TickerState {
    started: bool,
    next_ticker_id: u64,
    ticker: Option<TickerHandle>,
}

struct TickerHandle {
    id: u64,
    cancel: CancellationToken,
}

impl HealthChecker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        outbound: Arc<OutboundManager>,
        pause: Arc<PauseManager>,
        history: Arc<HistoryStorage>,
        outbounds: Vec<OutboundHandle>,
        url: String,
        interval: Duration,
        idle_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let interval = if interval.is_zero() {
            DEFAULT_URL_TEST_INTERVAL
        } else {
            interval
        };
        let idle_timeout = if idle_timeout.is_zero() {
            DEFAULT_URL_TEST_IDLE_TIMEOUT
        } else {
            idle_timeout
        };
        let timeout = if timeout.is_zero() { TCP_TIMEOUT } else { timeout };
        if interval > idle_timeout {
            return Err(Error::invalid_config(
                "interval must be less or equal than idle_timeout",
            ));
        }
        Ok(Self {
            inner: Arc::new(CheckerInner {
                outbound,
                pause,
                history,
                outbounds,
                url,
                interval,
                idle_timeout,
                timeout,
                checking: AtomicBool::new(false),
                last_active: Mutex::new(Instant::now()),
                state: Mutex::new(TickerState::default()),
                on_update: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn history(&self) -> &HistoryStorage {
        &self.inner.history
    }

    pub(crate) fn set_on_update(&self, callback: UpdateCallback) {
        *self.inner.on_update.lock() = Some(callback);
    }

    /// Mark started and launch one best-effort probe round.
    pub(crate) fn post_start(&self) {
        self.inner.state.lock().started = true;
        *self.inner.last_active.lock() = Instant::now();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.check_outbounds(false).await;
        });
    }

    /// Record traffic: refresh `last_active`, installing a ticker if none is
    /// running.
    pub(crate) fn touch(&self) {
        let mut state = self.inner.state.lock();
        if !state.started {
            return;
        }
        if state.ticker.is_some() {
            *self.inner.last_active.lock() = Instant::now();
            return;
        }
        let id = state.next_ticker_id;
        state.next_ticker_id += 1;
        let cancel = CancellationToken::new();
        state.ticker = Some(TickerHandle {
            id,
            cancel: cancel.clone(),
        });
        let registration = self.inner.pause.register();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.loop_check(id, cancel, registration).await;
        });
    }

    pub(crate) fn close(&self) {
        let mut state = self.inner.state.lock();
        state.started = false;
        if let Some(handle) = state.ticker.take() {
            handle.cancel.cancel();
        }
    }

    /// Run one probe round. `force` probes members even when their history is
    /// fresh. Reentry while a round is running is a no-op.
    pub(crate) async fn check_outbounds(&self, force: bool) {
        self.inner.check_outbounds(force).await;
    }

    #[cfg(test)]
    pub(crate) fn has_ticker(&self) -> bool {
        self.inner.state.lock().ticker.is_some()
    }

    #[cfg(test)]
    pub(crate) fn interval(&self) -> Duration {
        self.inner.interval
    }

    #[cfg(test)]
    pub(crate) fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    #[cfg(test)]
    pub(crate) fn probe_timeout(&self) -> Duration {
        self.inner.timeout
    }
}

impl CheckerInner {
    async fn loop_check(
        self: Arc<Self>,
        ticker_id: u64,
        cancel: CancellationToken,
        mut pause: PauseRegistration,
    ) {
        if self.last_active.lock().elapsed() > self.interval {
            *self.last_active.lock() = Instant::now();
            self.check_outbounds(false).await;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            // A pause suspends the ticker without destroying it; the pause
            // registration is released only when this loop exits.
            pause.wait_active().await;
            if cancel.is_cancelled() {
                return;
            }
            if self.last_active.lock().elapsed() > self.idle_timeout {
                let mut state = self.state.lock();
                if state.ticker.as_ref().map(|handle| handle.id) == Some(ticker_id) {
                    state.ticker = None;
                }
                tracing::debug!(target: "rb_core::outbound", "health ticker idle, quiescing");
                return;
            }
            self.check_outbounds(false).await;
        }
    }

    async fn check_outbounds(&self, force: bool) {
        if self.checking.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut checked = HashSet::new();
        let mut jobs = Vec::new();
        for detour in &self.outbounds {
            let tag = detour.tag().to_string();
            let real = real_tag(detour.as_ref());
            if real.is_empty() || !checked.insert(real.clone()) {
                continue;
            }
            if !force {
                if let Some(history) = self.history.load(&real) {
                    if history.time.elapsed() < self.interval {
                        continue;
                    }
                }
            }
            let Some(resolved) = self.outbound.get(&real) else {
                continue;
            };
            jobs.push((tag, real, resolved));
        }
        futures::stream::iter(jobs)
            .for_each_concurrent(URL_TEST_CONCURRENCY, |(tag, real, detour)| async move {
                match tokio::time::timeout(self.timeout, url_test(detour.as_ref(), &self.url)).await
                {
                    Ok(Ok(delay)) => {
                        tracing::debug!(
                            target: "rb_core::outbound",
                            outbound = %tag,
                            delay_ms = delay,
                            "outbound available"
                        );
                        self.history.store(
                            &real,
                            UrlTestHistory {
                                time: Instant::now(),
                                delay,
                            },
                        );
                        #[cfg(feature = "metrics")]
                        metrics::counter!("urltest_probe_total", "result" => "ok").increment(1);
                    }
                    Ok(Err(err)) => {
                        tracing::debug!(
                            target: "rb_core::outbound",
                            outbound = %tag,
                            error = %err,
                            "outbound unavailable"
                        );
                        self.history.delete(&real);
                        #[cfg(feature = "metrics")]
                        metrics::counter!("urltest_probe_total", "result" => "fail").increment(1);
                    }
                    Err(_) => {
                        tracing::debug!(
                            target: "rb_core::outbound",
                            outbound = %tag,
                            "outbound probe timed out"
                        );
                        self.history.delete(&real);
                        #[cfg(feature = "metrics")]
                        metrics::counter!("urltest_probe_total", "result" => "timeout").increment(1);
                    }
                }
            })
            .await;
        self.checking.store(false, Ordering::Release);
        if let Some(on_update) = self.on_update.lock().as_ref() {
            on_update();
        }
    }
}
