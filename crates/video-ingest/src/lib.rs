//! Video ingest for the drone's camera stream.
//!
//! The vehicle sends raw H.264 over UDP once `streamon` is acknowledged;
//! [`spawn_stream_reader`] hands that to an `ffmpeg` child and yields packed
//! RGB [`Frame`]s over a small bounded channel so a slow consumer
//! backpressures the decoder instead of growing a backlog.

mod ffmpeg;
mod types;

pub use ffmpeg::{StreamConfig, TELLO_VIDEO_URI, VideoStream, spawn_stream_reader};
pub use types::{CaptureError, Frame, FrameFormat};
