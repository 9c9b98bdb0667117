//! Staggered keep-alive prober.
//!
//! Each sweep walks a snapshot of the registry and probes connections that
//! have been idle for at least `ping_interval`. Probes go out in batches of
//! `max_simultaneous_pings` with `delay_between_pings` between batches; the
//! delay is added to the sweep's notion of "now". The next sweep starts
//! `ping_interval / 4` after the previous one finished.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use wsgate_settings::KeepAliveSettings;

use crate::metrics::{
    KEEPALIVE_EVICTIONS_TOTAL, KEEPALIVE_PROBES_TOTAL, KEEPALIVE_SWEEP_DURATION_SECONDS,
};
use crate::registry::Registry;

/// Prober tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub ping_interval: Duration,
    pub max_simultaneous_pings: usize,
    pub delay_between_pings: Duration,
    /// Subtracted from "now" when stamping a probed connection.
    pub compensation: Duration,
    /// Unanswered probes before eviction (0 never evicts).
    pub max_missed_probes: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self::from(&KeepAliveSettings::default())
    }
}

impl From<&KeepAliveSettings> for KeepAliveConfig {
    fn from(settings: &KeepAliveSettings) -> Self {
        Self {
            ping_interval: settings.ping_interval(),
            max_simultaneous_pings: settings.max_simultaneous_pings.max(1),
            delay_between_pings: settings.delay_between_pings(),
            compensation: settings.compensation(),
            max_missed_probes: settings.max_missed_probes,
        }
    }
}

impl KeepAliveConfig {
    /// Pause between the end of one sweep and the start of the next.
    pub fn sweep_period(&self) -> Duration {
        self.ping_interval / 4
    }
}

/// What one sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Connections examined.
    pub examined: usize,
    /// Probes queued.
    pub probed: usize,
    /// Probe batches started.
    pub batches: usize,
    /// Connections closed for unanswered probes.
    pub evicted: usize,
    /// Connections skipped because they were already closing.
    pub skipped: usize,
    /// True if shutdown interrupted the sweep.
    pub interrupted: bool,
}

/// Periodic liveness prober over the shared [`Registry`].
pub struct KeepAlive {
    registry: Arc<Registry>,
    config: KeepAliveConfig,
    sweeps: AtomicU64,
}

impl KeepAlive {
    pub fn new(registry: Arc<Registry>, config: KeepAliveConfig) -> Self {
        Self {
            registry,
            config,
            sweeps: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &KeepAliveConfig {
        &self.config
    }

    /// Sweeps completed so far.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Run one sweep. Returns early (with `interrupted`) if `cancel` fires
    /// during a pacing pause.
    pub async fn sweep(&self, cancel: &CancellationToken) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut now = Instant::now();
        let mut in_batch = 0usize;

        for conn in self.registry.snapshot() {
            stats.examined += 1;
            if conn.is_closed() {
                stats.skipped += 1;
                continue;
            }
            if conn.idle_for(now) < self.config.ping_interval {
                continue;
            }

            if self.config.max_missed_probes > 0
                && conn.missed_probes() >= self.config.max_missed_probes
            {
                warn!(conn_id = %conn.id, missed = conn.missed_probes(), "closing unresponsive connection");
                conn.close();
                stats.evicted += 1;
                continue;
            }

            if in_batch == self.config.max_simultaneous_pings {
                tokio::select! {
                    () = cancel.cancelled() => {
                        stats.interrupted = true;
                        break;
                    }
                    () = tokio::time::sleep(self.config.delay_between_pings) => {}
                }
                now += self.config.delay_between_pings;
                in_batch = 0;
                // The connection may have gone away during the pause.
                if conn.is_closed() {
                    stats.skipped += 1;
                    continue;
                }
            }
            if in_batch == 0 {
                stats.batches += 1;
            }

            if !conn.probe() {
                debug!(conn_id = %conn.id, "probe not queued");
            }
            conn.set_last_activity(now.checked_sub(self.config.compensation).unwrap_or(now));
            let _ = conn.record_probe();
            in_batch += 1;
            stats.probed += 1;
        }

        let _ = self.sweeps.fetch_add(1, Ordering::Relaxed);
        counter!(KEEPALIVE_PROBES_TOTAL).increment(stats.probed as u64);
        if stats.evicted > 0 {
            counter!(KEEPALIVE_EVICTIONS_TOTAL).increment(stats.evicted as u64);
        }
        stats
    }

    /// Sweep until `cancel` fires.
    #[instrument(skip_all, name = "keepalive")]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.ping_interval.as_millis() as u64,
            batch = self.config.max_simultaneous_pings,
            "keep-alive scheduler started"
        );
        while !cancel.is_cancelled() {
            let started = Instant::now();
            let stats = self.sweep(&cancel).await;
            histogram!(KEEPALIVE_SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
            if stats.probed > 0 || stats.evicted > 0 {
                debug!(
                    probed = stats.probed,
                    batches = stats.batches,
                    evicted = stats.evicted,
                    "keep-alive sweep"
                );
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.sweep_period()) => {}
            }
        }
        info!("keep-alive scheduler stopped");
    }
}
