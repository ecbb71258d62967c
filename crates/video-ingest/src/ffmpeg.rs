use std::{
    io::{self, Read},
    process::{Child, Command, Stdio},
    thread,
};

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use metrics::counter;
use tracing::{debug, warn};

use crate::types::{CaptureError, Frame, FrameFormat};

/// Where the vehicle pushes its H.264 elementary stream.
pub const TELLO_VIDEO_URI: &str = "udp://0.0.0.0:11111";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    /// Decoded frames buffered ahead of the consumer.
    pub queue_size: usize,
    pub program: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            uri: TELLO_VIDEO_URI.to_string(),
            width: 960,
            height: 720,
            queue_size: 2,
            program: "ffmpeg".to_string(),
        }
    }
}

impl StreamConfig {
    /// Low-latency decode to packed RGB on stdout.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-fflags")
            .arg("nobuffer+discardcorrupt")
            .arg("-flags")
            .arg("low_delay")
            .arg("-probesize")
            .arg("32")
            .arg("-analyzeduration")
            .arg("0")
            .arg("-i")
            .arg(&self.uri)
            .arg("-an")
            .arg("-vf")
            .arg(format!("scale={}:{}", self.width, self.height))
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd
    }
}

/// A running decoder. Dropping it kills the ffmpeg process, which releases
/// the UDP port and ends the reader thread.
pub struct VideoStream {
    child: Child,
    frames: Receiver<Result<Frame, CaptureError>>,
}

impl VideoStream {
    pub fn frames(&self) -> &Receiver<Result<Frame, CaptureError>> {
        &self.frames
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        if let Err(err) = self.child.kill() {
            debug!(error = %err, "decoder already exited");
        }
        let _ = self.child.wait();
    }
}

/// Spawns ffmpeg and a background thread that slices its stdout into frames.
pub fn spawn_stream_reader(config: &StreamConfig) -> Result<VideoStream, CaptureError> {
    let (tx, rx) = bounded(config.queue_size.max(1));
    let mut cmd = config.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|source| CaptureError::Spawn {
        program: config.program.clone(),
        source,
    })?;
    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill();
        return Err(CaptureError::MissingStdout);
    };
    debug!(pid = child.id(), uri = %config.uri, "video decoder started");

    let (width, height) = (config.width, config.height);
    let spawned = thread::Builder::new()
        .name("video-ingest".to_string())
        .spawn(move || {
            if let Err(err) = read_frames(stdout, width, height, &tx) {
                let _ = tx.send(Err(err));
            }
        });
    if let Err(source) = spawned {
        let _ = child.kill();
        return Err(CaptureError::Spawn {
            program: "video-ingest thread".to_string(),
            source,
        });
    }

    Ok(VideoStream { child, frames: rx })
}

fn read_frames(
    mut stdout: impl Read,
    width: u32,
    height: u32,
    tx: &Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes = width as usize * height as usize * FrameFormat::Rgb8.bytes_per_pixel();
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                counter!("video_frames_total").increment(1);
                let frame = Frame {
                    data: buffer.clone(),
                    width,
                    height,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: FrameFormat::Rgb8,
                };
                if tx.send(Ok(frame)).is_err() {
                    return Ok(());
                }
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(CaptureError::Ended);
            }
            Err(err) => {
                warn!(error = %err, "video read failed");
                return Err(CaptureError::Read(err));
            }
        }
    }
}
