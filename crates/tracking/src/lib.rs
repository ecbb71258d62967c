//! Follow-me tracking: keypoints in, relative motion commands out.
//!
//! [`TrackingController`] owns the pieces for one session: a
//! [`MotionEstimator`] smoothing the torso position, an [`AppearanceGate`]
//! that re-identifies the calibrated subject, and the proportional control
//! law in [`estimator::compute_control`]. Commands are issued through
//! [`drone_link::DroneControl`] so the controller never touches sockets.

pub mod appearance;
pub mod controller;
pub mod estimator;
pub mod pose;

pub use appearance::{
    AppearanceGate, AppearanceSignature, CalibrationError, ColorHistogram, DominantColor,
    GateConfig, GateVerdict,
};
pub use controller::{
    ControlRequest, FrameOutcome, TrackerConfig, TrackingController, TrackingMode, TrackingStatus,
};
pub use estimator::{
    AxisGain, ControlGains, ControlOutput, Measurement, MeasurementWindow, MotionEstimator,
    compute_control,
};
pub use pose::{FrameGeometry, Keypoint, TorsoKeypoints};
