//! Passive receiver for the vehicle's state datagrams.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{LinkError, transport::is_timeout};

/// UDP port the vehicle broadcasts state on.
pub const STATE_PORT: u16 = 8890;

const STATE_BUFFER_LEN: usize = 1024;

/// Most recent state datagram.
#[derive(Clone, Debug)]
pub struct TelemetrySample {
    pub payload: Vec<u8>,
    /// Wall-clock receive time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    received_at: Instant,
}

impl TelemetrySample {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            timestamp_ms: Utc::now().timestamp_millis(),
            received_at: Instant::now(),
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Parse `key:value;key:value;` pairs. Anything else yields an empty map.
    pub fn fields(&self) -> BTreeMap<String, String> {
        parse_state_fields(&self.text())
    }

    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

fn parse_state_fields(text: &str) -> BTreeMap<String, String> {
    text.trim()
        .split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Settings for [`TelemetryChannel`].
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub bind: SocketAddr,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub verbose: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], STATE_PORT)),
            poll_interval: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(100),
            verbose: false,
        }
    }
}

type LatestSample = Arc<Mutex<Option<TelemetrySample>>>;

/// Background receiver exposing the latest state sample.
pub struct TelemetryChannel {
    latest: LatestSample,
    shutdown: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TelemetryChannel {
    pub fn listen(config: &TelemetryConfig) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(config.bind).map_err(|source| LinkError::Bind {
            addr: config.bind,
            source,
        })?;
        info!(local = %config.bind, "telemetry link bound");
        Self::from_socket(socket, config)
    }

    pub fn from_socket(socket: UdpSocket, config: &TelemetryConfig) -> Result<Self, LinkError> {
        socket
            .set_read_timeout(Some(config.poll_interval))
            .map_err(LinkError::Configure)?;
        let local_addr = socket.local_addr().ok();
        let latest: LatestSample = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let latest = latest.clone();
            let shutdown = shutdown.clone();
            let backoff = config.retry_backoff;
            let verbose = config.verbose;
            thread::Builder::new()
                .name("drone-telemetry".into())
                .spawn(move || receive_loop(socket, latest, shutdown, backoff, verbose))
                .map_err(|source| LinkError::Spawn {
                    name: "drone-telemetry",
                    source,
                })?
        };

        Ok(Self {
            latest,
            shutdown,
            local_addr,
            handle: Some(handle),
        })
    }

    /// Most recently received sample, if any arrived yet.
    pub fn latest(&self) -> Option<TelemetrySample> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TelemetryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(
    socket: UdpSocket,
    latest: LatestSample,
    shutdown: Arc<AtomicBool>,
    backoff: Duration,
    verbose: bool,
) {
    let mut buf = [0u8; STATE_BUFFER_LEN];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, _from)) => {
                let sample = TelemetrySample::new(buf[..len].to_vec());
                *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample);
                metrics::counter!("drone_telemetry_samples_total").increment(1);
            }
            Err(err) if is_timeout(&err) => {}
            Err(err) => {
                if verbose {
                    warn!("telemetry receive failed: {err}");
                } else {
                    debug!("telemetry receive failed: {err}");
                }
                thread::sleep(backoff);
            }
        }
    }
    debug!("telemetry receiver stopped");
}
