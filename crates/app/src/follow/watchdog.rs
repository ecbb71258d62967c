//! Heartbeat monitoring for the video and telemetry links.
//!
//! Stages record a heartbeat as they make progress. The watchdog thread
//! polls them; a stalled video stage ends the current run so the supervisor
//! can restart ingest, while stale telemetry is only reported.

use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{error, info, warn};

use crate::follow::telemetry::spawn_thread;

pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
pub(crate) const VIDEO_STALE_THRESHOLD_MS: u64 = 5_000;
pub(crate) const TELEMETRY_STALE_THRESHOLD_MS: u64 = 3_000;
/// Decoder probing plus `streamon` round-trip.
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 10_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HealthComponent {
    Video,
    Telemetry,
}

impl HealthComponent {
    pub(crate) fn label(self) -> &'static str {
        match self {
            HealthComponent::Video => "video",
            HealthComponent::Telemetry => "telemetry",
        }
    }
}

/// Last heartbeat per component, milliseconds since the epoch.
pub(crate) struct PipelineHealth {
    video: AtomicU64,
    telemetry: AtomicU64,
}

impl PipelineHealth {
    pub(crate) fn new() -> Self {
        Self::starting_at(current_millis())
    }

    fn starting_at(now: u64) -> Self {
        // Heartbeats start in the future so nothing is stale during startup.
        let grace_deadline = now.saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            video: AtomicU64::new(grace_deadline),
            telemetry: AtomicU64::new(grace_deadline),
        }
    }

    pub(crate) fn beat(&self, component: HealthComponent) {
        self.beat_at(component, current_millis());
    }

    fn beat_at(&self, component: HealthComponent, now: u64) {
        match component {
            HealthComponent::Video => self.video.store(now, Ordering::Relaxed),
            HealthComponent::Telemetry => self.telemetry.store(now, Ordering::Relaxed),
        }
    }

    pub(crate) fn is_stale(&self, component: HealthComponent, now: u64) -> bool {
        let (last, threshold) = match component {
            HealthComponent::Video => (&self.video, VIDEO_STALE_THRESHOLD_MS),
            HealthComponent::Telemetry => (&self.telemetry, TELEMETRY_STALE_THRESHOLD_MS),
        };
        now.saturating_sub(last.load(Ordering::Relaxed)) > threshold
    }
}

pub(crate) struct WatchdogState {
    triggered: AtomicBool,
    reason: Mutex<Option<HealthComponent>>,
}

impl WatchdogState {
    pub(crate) fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn arm(&self, component: HealthComponent) {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(component);
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub(crate) fn reason(&self) -> Option<HealthComponent> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Poll heartbeats until `running` or `shutdown` clears. When `watch_video`
/// is set, a stalled video stage arms `state` and clears `running`.
pub(crate) fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
    watch_video: bool,
) -> io::Result<thread::JoinHandle<()>> {
    spawn_thread("follow-watchdog", move || {
        let mut telemetry_stale = false;
        while running.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            let now = current_millis();

            if watch_video && health.is_stale(HealthComponent::Video, now) {
                error!("Watchdog detected stalled video stage; requesting ingest restart");
                metrics::counter!("follow_watchdog_trips_total", "component" => "video")
                    .increment(1);
                state.arm(HealthComponent::Video);
                running.store(false, Ordering::SeqCst);
                break;
            }

            match (health.is_stale(HealthComponent::Telemetry, now), telemetry_stale) {
                (true, false) => {
                    warn!("No vehicle telemetry for over {TELEMETRY_STALE_THRESHOLD_MS} ms")
                }
                (false, true) => info!("Vehicle telemetry resumed"),
                _ => {}
            }
            telemetry_stale = health.is_stale(HealthComponent::Telemetry, now);
        }
    })
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_are_fresh_during_startup_grace() {
        let health = PipelineHealth::starting_at(1_000);
        assert!(!health.is_stale(HealthComponent::Video, 1_000 + WATCHDOG_STARTUP_GRACE_MS));
        assert!(health.is_stale(
            HealthComponent::Video,
            1_000 + WATCHDOG_STARTUP_GRACE_MS + VIDEO_STALE_THRESHOLD_MS + 1
        ));
    }

    #[test]
    fn heartbeat_resets_staleness_per_component() {
        let health = PipelineHealth::starting_at(0);
        let later = WATCHDOG_STARTUP_GRACE_MS + 60_000;
        health.beat_at(HealthComponent::Telemetry, later);
        assert!(!health.is_stale(HealthComponent::Telemetry, later + 1_000));
        assert!(health.is_stale(HealthComponent::Video, later + 1_000));
    }

    #[test]
    fn armed_state_reports_reason() {
        let state = WatchdogState::new();
        assert!(!state.is_triggered());
        state.arm(HealthComponent::Video);
        assert!(state.is_triggered());
        assert_eq!(state.reason(), Some(HealthComponent::Video));
    }
}
