//! Configuration parsing for the follow loop.
//!
//! This module owns translation of CLI arguments into a `FollowConfig`
//! which the links and the frame loop use without re-parsing flags.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;
use drone_link::{
    COMMAND_PORT, DEFAULT_ACK_TIMEOUT, LinkConfig, QueuePolicy, STATE_PORT, TelemetryConfig,
};
use tracking::{FrameGeometry, GateConfig, TrackerConfig};
use video_ingest::{StreamConfig, TELLO_VIDEO_URI};

/// Port the external pose model publishes keypoints to.
pub const POSE_PORT: u16 = 9000;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Where operator tokens come from and replies go to.
pub enum SideChannelSource {
    Stdin,
    /// Serial device (or any readable/writable path), newline-delimited.
    Device(PathBuf),
}

#[derive(Clone, Debug, Default)]
/// Optional instrumentation knobs.
pub struct TelemetryOptions {
    /// Serve Prometheus metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every part of the follow loop.
pub struct FollowConfig {
    pub link: LinkConfig,
    pub telemetry: TelemetryConfig,
    pub pose_bind: SocketAddr,
    /// `None` runs without video: no calibration, scoring or image replies.
    pub stream: Option<StreamConfig>,
    pub tracker: TrackerConfig,
    pub side_channel: SideChannelSource,
    pub jpeg_quality: u8,
    pub verbose: bool,
    pub instrumentation: TelemetryOptions,
}

/// CLI arguments accepted by the `follow` subcommand.
#[derive(Debug, Args)]
pub struct FollowArgs {
    /// Vehicle command address.
    #[arg(long = "drone", value_name = "ADDR", default_value_t = SocketAddr::from(([192, 168, 10, 1], COMMAND_PORT)))]
    pub drone_addr: SocketAddr,
    /// Local address for the command socket; acknowledgements arrive here.
    #[arg(long = "command-bind", value_name = "ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], COMMAND_PORT)))]
    pub command_bind: SocketAddr,
    /// Local address for vehicle state datagrams.
    #[arg(long = "telemetry-bind", value_name = "ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], STATE_PORT)))]
    pub telemetry_bind: SocketAddr,
    /// Local address the pose model sends keypoints to.
    #[arg(long = "pose-bind", value_name = "ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], POSE_PORT)))]
    pub pose_bind: SocketAddr,
    /// Video stream URI handed to ffmpeg.
    #[arg(long = "video", value_name = "URI", default_value = TELLO_VIDEO_URI)]
    pub video_uri: String,
    /// Run without video ingest.
    #[arg(long = "no-video", action = clap::ArgAction::SetTrue)]
    pub no_video: bool,
    /// Decoded frame width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 960)]
    pub width: u32,
    /// Decoded frame height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 720)]
    pub height: u32,
    /// Read operator tokens from this device instead of stdin.
    #[arg(long = "serial", value_name = "PATH")]
    pub serial: Option<PathBuf>,
    /// Idle time before a keep-alive is sent.
    #[arg(long = "keepalive-secs", value_name = "SECS", default_value_t = 10.0)]
    pub keepalive_secs: f64,
    /// Give up waiting for an acknowledgement after this long; 0 waits forever.
    #[arg(long = "ack-timeout-secs", value_name = "SECS", default_value_t = DEFAULT_ACK_TIMEOUT.as_secs_f64())]
    pub ack_timeout_secs: f64,
    /// Transmission attempts before a command is dropped.
    #[arg(long = "max-send-attempts", value_name = "N", default_value_t = 3)]
    pub max_send_attempts: u32,
    /// Appearance scores at or below this suppress commands.
    #[arg(long = "similarity-threshold", value_name = "SCORE", default_value_t = 0.4)]
    pub similarity_threshold: f32,
    /// Score appearance every N processed frames.
    #[arg(long = "score-interval", value_name = "N", default_value_t = 30)]
    pub score_interval: u64,
    /// Track without appearance re-identification.
    #[arg(long = "no-appearance-gate", action = clap::ArgAction::SetTrue)]
    pub no_appearance_gate: bool,
    /// JPEG quality for image replies (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 80)]
    pub jpeg_quality: u8,
    /// Serve Prometheus metrics on this address.
    #[arg(long = "metrics-addr", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
    /// Enable verbose logging (transport errors, per-frame outcomes).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<FollowArgs> for FollowConfig {
    type Error = anyhow::Error;

    fn try_from(args: FollowArgs) -> Result<Self> {
        if args.width == 0 || args.height == 0 {
            bail!("Frame width and height must be positive integers");
        }
        let keepalive_interval = positive_secs("--keepalive-secs", args.keepalive_secs)?;
        let ack_timeout = match args.ack_timeout_secs {
            secs if secs == 0.0 => None,
            secs => Some(positive_secs("--ack-timeout-secs", secs)?),
        };
        if args.max_send_attempts == 0 {
            bail!("--max-send-attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&args.similarity_threshold) {
            bail!("--similarity-threshold must be between 0 and 1");
        }
        if args.score_interval == 0 {
            bail!("--score-interval must be at least 1");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let link = LinkConfig {
            drone_addr: args.drone_addr,
            command_bind: args.command_bind,
            policy: QueuePolicy {
                keepalive_interval,
                ack_timeout,
                max_send_attempts: args.max_send_attempts,
            },
            verbose: args.verbose,
            ..LinkConfig::default()
        };
        let telemetry = TelemetryConfig {
            bind: args.telemetry_bind,
            verbose: args.verbose,
            ..TelemetryConfig::default()
        };
        let stream = (!args.no_video).then(|| StreamConfig {
            uri: args.video_uri,
            width: args.width,
            height: args.height,
            ..StreamConfig::default()
        });

        let mut tracker = TrackerConfig::new(FrameGeometry::new(args.width, args.height));
        tracker.gate = GateConfig {
            enabled: !args.no_appearance_gate,
            threshold: args.similarity_threshold,
            score_interval: args.score_interval,
            ..GateConfig::default()
        };

        let side_channel = match args.serial {
            Some(path) => SideChannelSource::Device(path),
            None => SideChannelSource::Stdin,
        };

        Ok(Self {
            link,
            telemetry,
            pose_bind: args.pose_bind,
            stream,
            tracker,
            side_channel,
            jpeg_quality: args.jpeg_quality,
            verbose: args.verbose,
            instrumentation: TelemetryOptions {
                metrics_addr: args.metrics_addr,
            },
        })
    }
}

fn positive_secs(flag: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        bail!("{flag} must be a positive number of seconds");
    }
    Ok(Duration::from_secs_f64(secs))
}
