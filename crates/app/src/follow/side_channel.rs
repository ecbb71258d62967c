//! Operator side channel: newline-delimited tokens in, replies out.
//!
//! Tokens arrive either plain (`takeoff`, `start_track`) or in the framed
//! uppercase form used by the ground-station firmware (`<COMMAND>TAKEOFF`,
//! `<IMAGE>REQUEST_IMAGE`). Image replies are `<IMAGE>` followed by the
//! base64 of a JPEG and a newline.

use std::{
    fs::OpenOptions,
    io::{self, BufRead, BufReader, Write},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result, anyhow};
use base64::{Engine, engine::general_purpose::STANDARD};
use crossbeam_channel::{Receiver, Sender, unbounded};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use tracing::{debug, info, warn};

use crate::follow::{config::SideChannelSource, telemetry::spawn_thread};

pub(crate) const IMAGE_PREFIX: &str = "<IMAGE>";
const COMMAND_PREFIX: &str = "<COMMAND>";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Token {
    Takeoff,
    Land,
    StartTrack,
    StopTrack,
    Calibrate,
    RequestImage,
    Status,
    Quit,
}

impl Token {
    /// Parse one line; `None` for anything unrecognised.
    pub(crate) fn parse(line: &str) -> Option<Token> {
        let line = line.trim();
        let body = line
            .strip_prefix(COMMAND_PREFIX)
            .or_else(|| line.strip_prefix(IMAGE_PREFIX))
            .unwrap_or(line)
            .trim();
        let token = match body.to_ascii_lowercase().as_str() {
            "takeoff" => Token::Takeoff,
            "land" => Token::Land,
            "start_track" => Token::StartTrack,
            "stop_track" => Token::StopTrack,
            "calibrate" => Token::Calibrate,
            "request_image" => Token::RequestImage,
            "status" => Token::Status,
            "quit" => Token::Quit,
            _ => return None,
        };
        Some(token)
    }
}

/// Reply writer for the side channel. Clones share one underlying stream.
#[derive(Clone)]
pub(crate) struct Replies {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Replies {
    pub(crate) fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    pub(crate) fn send_line(&self, line: &str) -> io::Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }

    pub(crate) fn send_image(&self, frame: &RgbImage, quality: u8) -> Result<usize> {
        let jpeg = encode_jpeg(frame, quality)?;
        let reply = image_reply(&jpeg);
        self.send_line(&reply).context("failed to write image reply")?;
        Ok(jpeg.len())
    }
}

pub(crate) fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(frame)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// `<IMAGE>` + base64(jpeg), without the trailing newline.
pub(crate) fn image_reply(jpeg: &[u8]) -> String {
    let mut reply = String::with_capacity(IMAGE_PREFIX.len() + jpeg.len().div_ceil(3) * 4);
    reply.push_str(IMAGE_PREFIX);
    STANDARD.encode_string(jpeg, &mut reply);
    reply
}

/// Open the configured source and start forwarding parsed tokens.
pub(crate) fn open(source: &SideChannelSource) -> Result<(Receiver<Token>, Replies)> {
    let (tx, rx) = unbounded();
    match source {
        SideChannelSource::Stdin => {
            spawn_reader(Box::new(BufReader::new(io::stdin())), tx, "stdin".to_string())?;
            Ok((rx, Replies::new(Box::new(io::stdout()))))
        }
        SideChannelSource::Device(path) => {
            let device = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .with_context(|| format!("failed to open side channel {}", path.display()))?;
            let reader = device
                .try_clone()
                .with_context(|| format!("failed to clone handle for {}", path.display()))?;
            spawn_reader(Box::new(BufReader::new(reader)), tx, path.display().to_string())?;
            Ok((rx, Replies::new(Box::new(device))))
        }
    }
}

fn spawn_reader(input: Box<dyn BufRead + Send>, tx: Sender<Token>, label: String) -> Result<()> {
    // Blocking reads cannot observe shutdown; the thread is left detached
    // and ends with the process.
    spawn_thread("side-channel", move || forward_tokens(input, &tx, &label))
        .context("failed to spawn side channel thread")?;
    Ok(())
}

fn forward_tokens(input: impl BufRead, tx: &Sender<Token>, label: &str) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(source = label, error = %err, "side channel read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match Token::parse(&line) {
            Some(token) => {
                debug!(source = label, ?token, "side channel token");
                if tx.send(token).is_err() {
                    return;
                }
            }
            None => warn!(
                source = label,
                line = %line.trim(),
                "discarding unrecognised side channel line"
            ),
        }
    }
    info!(source = label, "side channel closed");
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::Rgb;

    use super::*;

    #[test]
    fn parses_plain_tokens() {
        assert_eq!(Token::parse("takeoff"), Some(Token::Takeoff));
        assert_eq!(Token::parse("  start_track\r"), Some(Token::StartTrack));
        assert_eq!(Token::parse("status"), Some(Token::Status));
        assert_eq!(Token::parse("quit"), Some(Token::Quit));
    }

    #[test]
    fn parses_framed_tokens() {
        assert_eq!(Token::parse("<COMMAND>TAKEOFF"), Some(Token::Takeoff));
        assert_eq!(Token::parse("<COMMAND>STOP_TRACK"), Some(Token::StopTrack));
        assert_eq!(Token::parse("<COMMAND>CALIBRATE"), Some(Token::Calibrate));
        assert_eq!(Token::parse("<IMAGE>REQUEST_IMAGE"), Some(Token::RequestImage));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(Token::parse("fly away"), None);
        assert_eq!(Token::parse("<COMMAND>"), None);
        assert_eq!(Token::parse(""), None);
    }

    #[test]
    fn image_reply_is_prefixed_base64_jpeg() {
        let frame = RgbImage::from_pixel(16, 8, Rgb([200, 40, 10]));
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        let reply = image_reply(&jpeg);

        let payload = reply.strip_prefix(IMAGE_PREFIX).unwrap();
        assert!(!payload.contains('\n'));
        let decoded = STANDARD.decode(payload).unwrap();
        assert_eq!(decoded, jpeg);
        // JPEG SOI marker.
        assert_eq!(&decoded[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn reader_forwards_known_tokens_only() {
        let (tx, rx) = unbounded();
        let input = Cursor::new("takeoff\nnonsense\n\n<COMMAND>LAND\n");
        forward_tokens(input, &tx, "test");
        let tokens: Vec<_> = rx.try_iter().collect();
        assert_eq!(tokens, vec![Token::Takeoff, Token::Land]);
    }

    #[test]
    fn replies_are_newline_terminated() {
        #[derive(Clone, Default)]
        struct Sink(Arc<Mutex<Vec<u8>>>);
        impl Write for Sink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = Sink::default();
        let replies = Replies::new(Box::new(sink.clone()));
        replies
            .send_image(&RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])), 90)
            .unwrap();
        let written = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(written.starts_with(IMAGE_PREFIX));
        assert!(written.ends_with('\n'));
        assert_eq!(written.matches('\n').count(), 1);
    }
}
