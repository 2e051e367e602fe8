//! Periodic telemetry loop
//!
//! One task, no overlapping ticks. Each tick acquires a statistics snapshot and
//! a health snapshot, then publishes statistics followed by storage. A failed
//! tick is logged and skipped; the next one runs after the recovery delay
//! instead of the full interval. Shutdown interrupts every wait and an
//! acquisition in progress, but never a publish that is already in flight.

use crate::error::{TelemetryError, TelemetryResult};
use crate::observability::{metrics, tick_span};
use crate::protocol::{DeviceIdentity, PayloadBuilder};
use crate::shutdown::{interruptible_sleep, wait_for_shutdown};
use crate::stats::{Aggregator, HealthProbe, HealthSnapshot, ProbeError, StatisticsSnapshot};
use crate::transport::mqtt::PublishPolicy;
use crate::transport::{OutboundMessage, Publisher};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub recovery_delay: Duration,
    pub window: Duration,
}

impl ScheduleSettings {
    /// Wait before the next tick
    pub fn delay_after(&self, succeeded: bool) -> Duration {
        if succeeded {
            self.interval
        } else {
            self.recovery_delay
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            interval: Duration::from_secs(900),
            recovery_delay: Duration::from_secs(60),
            window: Duration::from_secs(900),
        }
    }
}

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerPhase {
    #[default]
    Idle,
    /// Waiting between ticks
    Running,
    Acquiring,
    Publishing,
    Stopped,
}

impl fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerPhase::Idle => "idle",
            SchedulerPhase::Running => "running",
            SchedulerPhase::Acquiring => "acquiring",
            SchedulerPhase::Publishing => "publishing",
            SchedulerPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Published,
    /// Shutdown arrived before publishing; nothing was published
    Cancelled,
}

pub struct Scheduler {
    aggregator: Aggregator,
    probe: Arc<dyn HealthProbe>,
    publisher: Arc<dyn Publisher>,
    identity: DeviceIdentity,
    builder: PayloadBuilder,
    policy: PublishPolicy,
    settings: ScheduleSettings,
    phase_tx: watch::Sender<SchedulerPhase>,
}

impl Scheduler {
    pub fn new(
        aggregator: Aggregator,
        probe: Arc<dyn HealthProbe>,
        publisher: Arc<dyn Publisher>,
        identity: DeviceIdentity,
        builder: PayloadBuilder,
        policy: PublishPolicy,
        settings: ScheduleSettings,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SchedulerPhase::Idle);
        Self {
            aggregator,
            probe,
            publisher,
            identity,
            builder,
            policy,
            settings,
            phase_tx,
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        let previous = self.phase_tx.send_replace(phase);
        if previous != phase {
            debug!(from = %previous, to = %phase, "Scheduler phase changed");
        }
    }

    /// Run ticks until shutdown is requested
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            initial_delay_secs = self.settings.initial_delay.as_secs(),
            interval_secs = self.settings.interval.as_secs(),
            recovery_delay_secs = self.settings.recovery_delay.as_secs(),
            window_secs = self.settings.window.as_secs(),
            policy = ?self.aggregator.policy(),
            "Scheduler started"
        );
        self.set_phase(SchedulerPhase::Running);

        let mut delay = self.settings.initial_delay;
        let mut tick_number: u64 = 0;

        while interruptible_sleep(&mut shutdown_rx, delay).await {
            tick_number += 1;
            metrics().tick_started();
            let started = Instant::now();

            let span = tick_span!(tick = tick_number);
            let result = self.tick(&mut shutdown_rx).instrument(span).await;
            let elapsed = started.elapsed();

            let succeeded = match result {
                Ok(TickOutcome::Published) => {
                    metrics().tick_succeeded(elapsed);
                    info!(
                        tick = tick_number,
                        duration_ms = elapsed.as_millis() as u64,
                        "Telemetry tick published"
                    );
                    true
                }
                Ok(TickOutcome::Cancelled) => {
                    metrics().tick_cancelled();
                    info!(tick = tick_number, "Telemetry tick cancelled by shutdown");
                    break;
                }
                Err(e) => {
                    metrics().tick_failed(elapsed);
                    error!(
                        tick = tick_number,
                        kind = e.kind(),
                        error = %e,
                        retry_in_secs = self.settings.recovery_delay.as_secs(),
                        "Telemetry tick failed"
                    );
                    false
                }
            };

            self.set_phase(SchedulerPhase::Running);
            delay = self.settings.delay_after(succeeded);
        }

        self.set_phase(SchedulerPhase::Stopped);
        info!(ticks = tick_number, "Scheduler stopped");
    }

    /// Acquire both snapshots, then publish statistics before storage
    pub async fn tick(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> TelemetryResult<TickOutcome> {
        self.set_phase(SchedulerPhase::Acquiring);
        let (statistics, health) = tokio::select! {
            acquired = self.acquire() => acquired?,
            _ = wait_for_shutdown(shutdown_rx) => {
                debug!("Shutdown requested during acquisition");
                return Ok(TickOutcome::Cancelled);
            }
        };

        if *shutdown_rx.borrow() {
            return Ok(TickOutcome::Cancelled);
        }

        self.set_phase(SchedulerPhase::Publishing);
        let message = self
            .builder
            .build_statistics_message(&self.identity, &statistics)?;
        self.publisher
            .publish(OutboundMessage::new(message, self.policy.statistics))
            .await?;

        let message = self.builder.build_storage_message(&self.identity, &health)?;
        self.publisher
            .publish(OutboundMessage::new(message, self.policy.storage))
            .await?;

        debug!(
            total_items = statistics.total_items,
            volumes = health.ready_volumes().count(),
            "Published statistics and storage"
        );
        Ok(TickOutcome::Published)
    }

    async fn acquire(&self) -> TelemetryResult<(StatisticsSnapshot, HealthSnapshot)> {
        let statistics = self.aggregator.aggregate(self.settings.window).await?;

        // Disk enumeration can block on slow mounts
        let probe = Arc::clone(&self.probe);
        let health = tokio::task::spawn_blocking(move || HealthSnapshot::collect(probe.as_ref()))
            .await
            .map_err(|e| {
                warn!(error = %e, "Health probe task did not complete");
                TelemetryError::Probe(ProbeError::Unavailable(e.to_string()))
            })??;

        Ok((statistics, health))
    }
}
