//! Receives keypoints from the external pose model.
//!
//! The model publishes one JSON datagram per analysed frame:
//! `{"seq": 17, "keypoints": {"left_shoulder": {"x": 0.4, "y": 0.3}, ...}}`,
//! with `"keypoints": null` when nobody is in view. Only the newest result is
//! kept; a ready signal wakes the frame loop without queueing stale poses.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::Deserialize;
use tracing::{debug, warn};
use tracking::TorsoKeypoints;

use crate::follow::telemetry::spawn_thread;

const MAX_DATAGRAM: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(crate) struct PoseMessage {
    pub seq: u64,
    pub keypoints: Option<TorsoKeypoints>,
}

#[derive(Clone, Debug)]
pub(crate) struct PoseSample {
    pub seq: u64,
    pub keypoints: Option<TorsoKeypoints>,
    pub received_at: Instant,
}

type LatestPose = Arc<Mutex<Option<PoseSample>>>;

pub(crate) struct PoseListener {
    latest: LatestPose,
    ready: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PoseListener {
    pub(crate) fn bind(addr: SocketAddr, verbose: bool) -> Result<Self> {
        let socket =
            UdpSocket::bind(addr).with_context(|| format!("failed to bind pose socket on {addr}"))?;
        Self::from_socket(socket, verbose)
    }

    pub(crate) fn from_socket(socket: UdpSocket, verbose: bool) -> Result<Self> {
        socket
            .set_read_timeout(Some(POLL_INTERVAL))
            .context("failed to configure pose socket")?;
        let latest: LatestPose = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded(1);

        let handle = spawn_thread("pose-listener", {
            let latest = latest.clone();
            let shutdown = shutdown.clone();
            move || receive_loop(&socket, &latest, &ready_tx, &shutdown, verbose)
        })
        .context("failed to spawn pose listener thread")?;

        Ok(Self {
            latest,
            ready: ready_rx,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Fires at most once per batch of arrivals.
    pub(crate) fn ready(&self) -> &Receiver<()> {
        &self.ready
    }

    /// The newest sample unless its sequence number is `seen`. A restarted
    /// model may count from zero again, so any other number counts as new.
    pub(crate) fn take_unseen(&self, seen: Option<u64>) -> Option<PoseSample> {
        let guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|sample| seen != Some(sample.seq))
            .cloned()
    }
}

impl Drop for PoseListener {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub(crate) fn decode(datagram: &[u8]) -> serde_json::Result<PoseMessage> {
    serde_json::from_slice(datagram)
}

fn receive_loop(
    socket: &UdpSocket,
    latest: &LatestPose,
    ready: &Sender<()>,
    shutdown: &AtomicBool,
    verbose: bool,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while !shutdown.load(Ordering::Relaxed) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => {
                if verbose {
                    warn!(error = %err, "pose receive failed");
                } else {
                    debug!(error = %err, "pose receive failed");
                }
                thread::sleep(POLL_INTERVAL);
                continue;
            }
        };

        let message = match decode(&buf[..len]) {
            Ok(message) => message,
            Err(err) => {
                metrics::counter!("pose_messages_rejected_total").increment(1);
                debug!(error = %err, "discarding malformed pose datagram");
                continue;
            }
        };
        metrics::counter!("pose_messages_total").increment(1);
        *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(PoseSample {
            seq: message.seq,
            keypoints: message.keypoints,
            received_at: Instant::now(),
        });
        match ready.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_visible_and_absent_subjects() {
        let visible = br#"{"seq": 4, "keypoints": {
            "left_shoulder": {"x": 0.6, "y": 0.3},
            "right_shoulder": {"x": 0.4, "y": 0.3},
            "left_hip": {"x": 0.6, "y": 0.7},
            "right_hip": {"x": 0.4, "y": 0.7}}}"#;
        let message = decode(visible).unwrap();
        assert_eq!(message.seq, 4);
        assert!(message.keypoints.is_some());

        let absent = decode(br#"{"seq": 5, "keypoints": null}"#).unwrap();
        assert_eq!(absent.keypoints, None);
    }

    #[test]
    fn rejects_partial_keypoints() {
        assert!(decode(br#"{"seq": 1, "keypoints": {"left_shoulder": {"x": 0.1, "y": 0.1}}}"#).is_err());
        assert!(decode(b"not json").is_err());
    }

    #[test]
    fn listener_keeps_latest_and_signals_ready() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let listener = PoseListener::from_socket(socket, true).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        sender.send_to(br#"{"seq": 1, "keypoints": null}"#, addr).unwrap();
        listener.ready().recv_timeout(Duration::from_secs(2)).unwrap();
        let first = listener.take_unseen(None).unwrap();
        assert_eq!(first.seq, 1);
        assert!(listener.take_unseen(Some(1)).is_none());

        sender.send_to(br#"{"seq": 2, "keypoints": null}"#, addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while listener.take_unseen(Some(1)).is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(listener.take_unseen(Some(1)).map(|s| s.seq), Some(2));
    }
}
