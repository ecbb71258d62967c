//! Follow-loop supervisor tying together the command link, telemetry, video
//! ingest, pose input and the operator side channel.
//!
//! The command and telemetry links live for the whole run. Video ingest is
//! restarted whenever the watchdog sees it stall or the decoder exits; the
//! tracking session survives those restarts.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, never, select};
use drone_link::{Command, CommandChannel, DroneControl, TelemetryChannel, TelemetrySample};
use image::RgbImage;
use serde_json::json;
use tracing::{debug, error, info, warn};
use tracking::{ControlRequest, FrameOutcome, TrackingController, TrackingStatus};

use crate::follow::{
    FollowConfig,
    pose::PoseListener,
    side_channel::{self, Replies, Token},
    telemetry,
    watchdog::{
        HealthComponent, PipelineHealth, TELEMETRY_STALE_THRESHOLD_MS, WatchdogState,
        spawn_watchdog,
    },
};

const LOOP_TICK: Duration = Duration::from_millis(100);
/// Poses older than this describe where the subject was, not where it is.
const POSE_MAX_AGE: Duration = Duration::from_millis(500);
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Run the follow loop until `quit` or Ctrl+C, restarting video ingest on
/// recoverable faults.
pub fn run(config: FollowConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    telemetry::init_metrics(&config.instrumentation)?;
    let follow_span = tracing::info_span!(
        "follow",
        drone = %config.link.drone_addr,
        video = config.stream.is_some(),
        gated = config.tracker.gate.enabled,
    );
    let _follow_span_guard = follow_span.enter();

    let mut links = Links::open(&config)?;
    links.command.send(&Command::Handshake);
    if config.stream.is_some() {
        links.command.send(&Command::StreamOn);
    }
    info!("Follow loop running; send `quit` or press Ctrl+C to stop");

    let mut session = Session::new(&config);
    let mut attempt: u32 = 0;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match run_once(&config, &mut links, &mut session, &shutdown) {
            Ok(RunOutcome::Graceful) => break,
            Ok(RunOutcome::Restart(reason)) => {
                attempt = attempt.saturating_add(1);
                metrics::counter!("follow_restarts_total", "reason" => reason).increment(1);
                warn!("Restarting video ingest (reason: {reason}), attempt #{attempt}");
                thread::sleep(RESTART_BACKOFF);
            }
            Err(err) => {
                error!("Follow loop error: {err:?}");
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                attempt = attempt.saturating_add(1);
                thread::sleep(RESTART_BACKOFF);
            }
        }
    }

    info!(
        pending = links.command.pending(),
        last_sent = ?links.command.last_sent(),
        "Stopping follow loop"
    );
    links.command.shutdown();
    links.telemetry.shutdown();
    Ok(())
}

/// Result of a single ingest run.
enum RunOutcome {
    Graceful,
    Restart(&'static str),
}

/// Long-lived connections, opened once per process.
struct Links {
    command: CommandChannel,
    telemetry: TelemetryChannel,
    pose: PoseListener,
    tokens: Receiver<Token>,
    replies: Replies,
}

impl Links {
    fn open(config: &FollowConfig) -> Result<Self> {
        let command = CommandChannel::connect(&config.link).with_context(|| {
            format!("failed to open command link to {}", config.link.drone_addr)
        })?;
        let telemetry =
            TelemetryChannel::listen(&config.telemetry).context("failed to open telemetry link")?;
        let pose = PoseListener::bind(config.pose_bind, config.verbose)?;
        let (tokens, replies) = side_channel::open(&config.side_channel)?;
        Ok(Self {
            command,
            telemetry,
            pose,
            tokens,
            replies,
        })
    }
}

/// Tracking state that outlives ingest restarts.
struct Session {
    controller: TrackingController,
    last_frame: Option<RgbImage>,
    last_pose_seq: Option<u64>,
    jpeg_quality: u8,
    verbose: bool,
}

impl Session {
    fn new(config: &FollowConfig) -> Self {
        Self {
            controller: TrackingController::new(config.tracker.clone()),
            last_frame: None,
            last_pose_seq: None,
            jpeg_quality: config.jpeg_quality,
            verbose: config.verbose,
        }
    }

    fn on_pose(&mut self, links: &Links) {
        let Some(sample) = links.pose.take_unseen(self.last_pose_seq) else {
            return;
        };
        self.last_pose_seq = Some(sample.seq);
        if sample.received_at.elapsed() > POSE_MAX_AGE {
            debug!(seq = sample.seq, "skipping stale pose");
            return;
        }

        let outcome = self.controller.process_frame(
            self.last_frame.as_ref(),
            sample.keypoints.as_ref(),
            &links.command,
        );
        match outcome {
            FrameOutcome::Commanded(output) if !output.is_hold() => {
                debug!(
                    seq = sample.seq,
                    vertical = output.vertical,
                    longitudinal = output.longitudinal,
                    yaw = output.yaw,
                    "follow commands issued"
                );
            }
            FrameOutcome::Calibrated => info!("Subject calibrated"),
            other if self.verbose => {
                debug!(seq = sample.seq, outcome = other.label(), "pose processed")
            }
            _ => {}
        }
    }

    /// Returns `false` when the operator asked to quit.
    fn on_token(&mut self, token: Token, links: &Links) -> bool {
        match token {
            Token::Takeoff => links.command.takeoff(),
            Token::Land => links.command.land(),
            Token::StartTrack => self.controller.handle(ControlRequest::StartTrack),
            Token::StopTrack => self.controller.handle(ControlRequest::StopTrack),
            Token::Calibrate => self.controller.handle(ControlRequest::Calibrate),
            Token::RequestImage => match &self.last_frame {
                Some(frame) => match links.replies.send_image(frame, self.jpeg_quality) {
                    Ok(bytes) => info!(bytes, "Sent frame to side channel"),
                    Err(err) => warn!("Image reply failed: {err:#}"),
                },
                None => warn!("Image requested before any frame arrived"),
            },
            Token::Status => {
                let line = status_line(
                    &self.controller.status(),
                    links.telemetry.latest().as_ref(),
                    links.command.last_response().as_deref(),
                    links.command.pending(),
                );
                if let Err(err) = links.replies.send_line(&line) {
                    warn!("Status reply failed: {err}");
                }
            }
            Token::Quit => {
                info!("Quit requested from side channel");
                return false;
            }
        }
        true
    }
}

/// Execute one ingest run, returning whether to exit or restart.
fn run_once(
    config: &FollowConfig,
    links: &mut Links,
    session: &mut Session,
    shutdown: &Arc<AtomicBool>,
) -> Result<RunOutcome> {
    if shutdown.load(Ordering::SeqCst) {
        return Ok(RunOutcome::Graceful);
    }

    let stream = config
        .stream
        .as_ref()
        .map(video_ingest::spawn_stream_reader)
        .transpose()
        .context("failed to start video ingest")?;
    if let Some(stream) = &stream {
        info!(pid = stream.id(), "Video ingest started");
    }
    let frames = stream
        .as_ref()
        .map(|stream| stream.frames().clone())
        .unwrap_or_else(never);
    session.last_frame = None;

    let health = Arc::new(PipelineHealth::new());
    let running = Arc::new(AtomicBool::new(true));
    let watchdog_state = Arc::new(WatchdogState::new());
    let watchdog_handle = spawn_watchdog(
        health.clone(),
        running.clone(),
        shutdown.clone(),
        watchdog_state.clone(),
        stream.is_some(),
    )
    .context("failed to spawn watchdog thread")?;

    let telemetry_fresh = Duration::from_millis(TELEMETRY_STALE_THRESHOLD_MS);
    let pose_ready = links.pose.ready().clone();
    let mut tokens = links.tokens.clone();
    let mut frame_number: u64 = 0;
    let mut restart_reason: Option<&'static str> = None;

    while running.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed) {
        if links
            .telemetry
            .latest()
            .is_some_and(|sample| sample.age() < telemetry_fresh)
        {
            health.beat(HealthComponent::Telemetry);
        }

        let mut side_channel_closed = false;
        select! {
            recv(frames) -> message => match message {
                Ok(Ok(frame)) => {
                    health.beat(HealthComponent::Video);
                    frame_number = frame_number.wrapping_add(1);
                    if frame_number % 300 == 0 {
                        debug!(
                            frame = frame_number,
                            timestamp = frame.timestamp_ms,
                            "video heartbeat"
                        );
                    }
                    session.last_frame = frame.into_image();
                }
                Ok(Err(err)) => {
                    error!("Video ingest error: {err}");
                    restart_reason = Some("video error");
                    break;
                }
                Err(_) => {
                    error!("Video frame channel closed");
                    restart_reason = Some("video channel closed");
                    break;
                }
            },
            recv(pose_ready) -> _ => session.on_pose(links),
            recv(tokens) -> token => match token {
                Ok(token) => {
                    if !session.on_token(token, links) {
                        shutdown.store(true, Ordering::SeqCst);
                    }
                }
                Err(_) => side_channel_closed = true,
            },
            default(LOOP_TICK) => {}
        }
        if side_channel_closed {
            info!("Side channel ended; continuing without operator input");
            tokens = never();
            links.tokens = never();
        }
    }

    running.store(false, Ordering::SeqCst);
    let _ = watchdog_handle.join();
    drop(stream);

    if watchdog_state.is_triggered() {
        let reason = watchdog_state
            .reason()
            .map(|component| component.label())
            .unwrap_or("watchdog");
        return Ok(RunOutcome::Restart(reason));
    }

    if let Some(reason) = restart_reason {
        if !shutdown.load(Ordering::SeqCst) {
            return Ok(RunOutcome::Restart(reason));
        }
    }

    Ok(RunOutcome::Graceful)
}

/// One JSON line describing the session and both links.
fn status_line(
    status: &TrackingStatus,
    telemetry: Option<&TelemetrySample>,
    last_response: Option<&str>,
    pending: usize,
) -> String {
    json!({
        "mode": status.mode,
        "calibrated": status.calibrated,
        "last_similarity": status.last_similarity,
        "frames_processed": status.frames_processed,
        "telemetry": telemetry.map(TelemetrySample::fields),
        "telemetry_age_ms": telemetry.map(|sample| sample.age().as_millis() as u64),
        "last_response": last_response,
        "pending_commands": pending,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tracking::TrackingMode;

    use super::*;

    #[test]
    fn status_line_reports_session_and_links() {
        let status = TrackingStatus {
            mode: TrackingMode::Tracking,
            calibrated: true,
            last_similarity: Some(0.75),
            frames_processed: 42,
        };
        let sample = TelemetrySample::new(b"bat:87;h:120;".to_vec());
        let line = status_line(&status, Some(&sample), Some("ok"), 2);
        assert!(!line.contains('\n'));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["mode"], "tracking");
        assert_eq!(value["calibrated"], true);
        assert_eq!(value["last_similarity"], 0.75);
        assert_eq!(value["telemetry"]["bat"], "87");
        assert_eq!(value["last_response"], "ok");
        assert_eq!(value["pending_commands"], 2);
    }

    #[test]
    fn status_line_without_links() {
        let status = TrackingStatus {
            mode: TrackingMode::Idle,
            calibrated: false,
            last_similarity: None,
            frames_processed: 0,
        };
        let value: Value = serde_json::from_str(&status_line(&status, None, None, 0)).unwrap();
        assert_eq!(value["mode"], "idle");
        assert!(value["telemetry"].is_null());
        assert!(value["last_similarity"].is_null());
    }
}
