//! Follow-me loop: keeps the drone pointed at and at a fixed distance from
//! a calibrated subject.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `pipeline`: Supervises the links and drives the per-pose control loop.
//! - `pose`: Receives keypoints from the external pose model.
//! - `side_channel`: Operator tokens, image and status replies.
//! - `watchdog`: Health monitoring for video and telemetry.
//! - `telemetry`: Tracing, metrics and thread helpers.

/// Re-export loop settings so callers can configure runs without reaching
/// into submodules.
pub use config::{FollowArgs, FollowConfig};
/// Launch the follow loop with a ready-made configuration.
pub use pipeline::run;

mod config;
mod pipeline;
mod pose;
mod side_channel;
pub(crate) mod telemetry;
mod watchdog;
