//! Per-frame follow state machine.

use drone_link::DroneControl;
use image::RgbImage;
use metrics::{counter, gauge};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    appearance::{AppearanceGate, GateConfig, GateVerdict},
    estimator::{
        ControlGains, ControlOutput, DEFAULT_WINDOW, Measurement, MotionEstimator, compute_control,
    },
    pose::{FrameGeometry, TorsoKeypoints},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    #[default]
    Idle,
    /// Capture the subject's appearance on the next usable frame, then
    /// return to the mode that was active before.
    Calibrating,
    Tracking,
}

/// Operator requests arriving from the side channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    StartTrack,
    StopTrack,
    Calibrate,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FrameOutcome {
    /// No person in the pose result.
    NoSubject,
    /// Position updated, no commands (idle, or waiting for a calibration frame).
    Observed(Measurement),
    Calibrated,
    CalibrationFailed,
    /// Appearance check rejected the subject; commands withheld.
    Suppressed { similarity: f32 },
    /// Earlier commands are still outstanding; this frame's correction is
    /// dropped instead of queued behind them.
    LinkBusy,
    Commanded(ControlOutput),
}

impl FrameOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FrameOutcome::NoSubject => "no_subject",
            FrameOutcome::Observed(_) => "observed",
            FrameOutcome::Calibrated => "calibrated",
            FrameOutcome::CalibrationFailed => "calibration_failed",
            FrameOutcome::Suppressed { .. } => "suppressed",
            FrameOutcome::LinkBusy => "link_busy",
            FrameOutcome::Commanded(_) => "commanded",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub geometry: FrameGeometry,
    pub window: usize,
    pub gains: ControlGains,
    pub gate: GateConfig,
}

impl TrackerConfig {
    pub fn new(geometry: FrameGeometry) -> Self {
        Self {
            geometry,
            window: DEFAULT_WINDOW,
            gains: ControlGains::default(),
            gate: GateConfig::default(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::new(FrameGeometry::default())
    }
}

/// Snapshot reported on `status` requests.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TrackingStatus {
    pub mode: TrackingMode,
    pub calibrated: bool,
    pub last_similarity: Option<f32>,
    pub frames_processed: u64,
}

pub struct TrackingController {
    mode: TrackingMode,
    resume: TrackingMode,
    last_similarity: Option<f32>,
    frames_processed: u64,
    estimator: MotionEstimator,
    gains: ControlGains,
    gate: AppearanceGate,
}

impl TrackingController {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            mode: TrackingMode::Idle,
            resume: TrackingMode::Idle,
            last_similarity: None,
            frames_processed: 0,
            estimator: MotionEstimator::new(config.geometry, config.window),
            gains: config.gains,
            gate: AppearanceGate::new(config.gate),
        }
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    pub fn last_similarity(&self) -> Option<f32> {
        self.last_similarity
    }

    pub fn status(&self) -> TrackingStatus {
        TrackingStatus {
            mode: self.mode,
            calibrated: self.gate.is_calibrated(),
            last_similarity: self.last_similarity,
            frames_processed: self.frames_processed,
        }
    }

    pub fn handle(&mut self, request: ControlRequest) {
        let calibrating = self.mode == TrackingMode::Calibrating;
        match request {
            ControlRequest::Calibrate if !calibrating => {
                self.resume = self.mode;
                self.mode = TrackingMode::Calibrating;
            }
            ControlRequest::Calibrate => {}
            // While calibrating, track toggles only change where we return to.
            ControlRequest::StartTrack if calibrating => self.resume = TrackingMode::Tracking,
            ControlRequest::StopTrack if calibrating => self.resume = TrackingMode::Idle,
            ControlRequest::StartTrack | ControlRequest::StopTrack => {
                let next = if request == ControlRequest::StartTrack {
                    TrackingMode::Tracking
                } else {
                    TrackingMode::Idle
                };
                if next != self.mode {
                    // Measurements from before the switch are stale.
                    self.estimator.reset();
                }
                self.mode = next;
            }
        }
        info!(?request, mode = ?self.mode, "tracking request handled");
    }

    /// Advance one frame. `frame` is only needed for calibration and
    /// appearance scoring.
    pub fn process_frame<D>(
        &mut self,
        frame: Option<&RgbImage>,
        pose: Option<&TorsoKeypoints>,
        drone: &D,
    ) -> FrameOutcome
    where
        D: DroneControl + ?Sized,
    {
        let outcome = self.step(frame, pose, drone);
        counter!("tracking_frames_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    fn step<D>(
        &mut self,
        frame: Option<&RgbImage>,
        pose: Option<&TorsoKeypoints>,
        drone: &D,
    ) -> FrameOutcome
    where
        D: DroneControl + ?Sized,
    {
        let Some(torso) = pose else {
            return FrameOutcome::NoSubject;
        };
        self.frames_processed += 1;
        let estimate = self.estimator.observe(torso);

        if self.mode == TrackingMode::Calibrating {
            let Some(frame) = frame else {
                return FrameOutcome::Observed(estimate);
            };
            self.mode = self.resume;
            return match self.gate.calibrate(frame, torso) {
                Ok(()) => {
                    self.last_similarity = None;
                    FrameOutcome::Calibrated
                }
                Err(err) => {
                    warn!(error = %err, "calibration failed, keeping previous appearance");
                    FrameOutcome::CalibrationFailed
                }
            };
        }

        if let Some(frame) = frame.filter(|_| self.gate.is_due(self.frames_processed)) {
            self.last_similarity = self.gate.score(frame, torso);
            if let Some(score) = self.last_similarity {
                gauge!("tracking_similarity").set(f64::from(score));
                debug!(similarity = score, "appearance scored");
            }
        }

        if self.mode != TrackingMode::Tracking {
            return FrameOutcome::Observed(estimate);
        }

        if let GateVerdict::Reject(similarity) = self.gate.verdict(self.last_similarity) {
            return FrameOutcome::Suppressed { similarity };
        }

        if drone.is_busy() {
            return FrameOutcome::LinkBusy;
        }

        let output = compute_control(estimate, self.estimator.geometry(), &self.gains);
        for (motion, magnitude) in output.commands() {
            drone.move_axis(motion, magnitude);
        }
        FrameOutcome::Commanded(output)
    }
}
