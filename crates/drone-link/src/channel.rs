//! Acknowledgement-gated command channel.
//!
//! Two threads share a [`ChannelState`] behind a mutex:
//! - the sender pops the queue head whenever the previous command has been
//!   acknowledged, and emits keep-alives when the link goes idle;
//! - the receiver treats every inbound datagram as the acknowledgement of the
//!   command in flight and wakes the sender through a condition variable.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    LinkError,
    command::DroneControl,
    queue::{ChannelState, Dispatch, QueuePolicy, SendOutcome},
    transport::{Transport, UdpTransport},
};

/// UDP port the vehicle listens on for commands; replies come from it too.
pub const COMMAND_PORT: u16 = 8889;

const RESPONSE_BUFFER_LEN: usize = 1024;

/// Settings for [`CommandChannel`].
#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub drone_addr: SocketAddr,
    pub command_bind: SocketAddr,
    pub policy: QueuePolicy,
    /// Pause after a failed send or receive before touching the socket again.
    pub retry_backoff: Duration,
    /// Socket read timeout; bounds how long shutdown waits on the receiver.
    pub poll_interval: Duration,
    /// Surface transport errors at `warn` instead of `debug`.
    pub verbose: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            drone_addr: SocketAddr::from(([192, 168, 10, 1], COMMAND_PORT)),
            command_bind: SocketAddr::from(([0, 0, 0, 0], COMMAND_PORT)),
            policy: QueuePolicy::default(),
            retry_backoff: Duration::from_millis(100),
            poll_interval: Duration::from_millis(200),
            verbose: false,
        }
    }
}

struct Shared {
    state: Mutex<ChannelState>,
    wake: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, ChannelState>) -> MutexGuard<'a, ChannelState> {
        self.wake.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for<'a>(
        &self,
        guard: MutexGuard<'a, ChannelState>,
        timeout: Duration,
    ) -> MutexGuard<'a, ChannelState> {
        match self.wake.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Sleep for the full `backoff`; enqueue notifications do not cut it short.
    fn back_off<'a>(
        &self,
        mut guard: MutexGuard<'a, ChannelState>,
        backoff: Duration,
    ) -> MutexGuard<'a, ChannelState> {
        let deadline = Instant::now() + backoff;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.is_shutdown() {
                return guard;
            }
            guard = self.wait_for(guard, remaining);
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Handle to the running sender/receiver pair.
pub struct CommandChannel {
    shared: Arc<Shared>,
    sender: Option<thread::JoinHandle<()>>,
    receiver: Option<thread::JoinHandle<()>>,
}

impl CommandChannel {
    /// Bind the command socket and start both loops.
    pub fn connect(config: &LinkConfig) -> Result<Self, LinkError> {
        let transport = UdpTransport::bind(
            config.command_bind,
            config.drone_addr,
            config.poll_interval,
        )?;
        let local = transport.local_addr().unwrap_or(config.command_bind);
        info!(
            local = %local,
            drone = %transport.peer(),
            "command link bound"
        );
        Self::with_transport(Arc::new(transport), config)
    }

    /// Start the loops over an arbitrary transport.
    pub fn with_transport<T: Transport>(
        transport: Arc<T>,
        config: &LinkConfig,
    ) -> Result<Self, LinkError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(ChannelState::new(config.policy.clone(), Instant::now())),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let sender = {
            let shared = shared.clone();
            let transport = transport.clone();
            let backoff = config.retry_backoff;
            let verbose = config.verbose;
            spawn_named("drone-command-tx", move || {
                run_sender(&shared, transport.as_ref(), backoff, verbose)
            })?
        };

        let receiver = {
            let rx_shared = shared.clone();
            let backoff = config.retry_backoff;
            let verbose = config.verbose;
            match spawn_named("drone-command-rx", move || {
                run_receiver(&rx_shared, transport.as_ref(), backoff, verbose)
            }) {
                Ok(handle) => handle,
                Err(err) => {
                    stop(&shared);
                    let _ = sender.join();
                    return Err(err);
                }
            }
        };

        Ok(Self {
            shared,
            sender: Some(sender),
            receiver: Some(receiver),
        })
    }

    /// Append a command to the queue. Never blocks on I/O.
    pub fn enqueue(&self, command: impl Into<String>) {
        let command = command.into();
        debug!(command = %command, "enqueue");
        let mut state = self.shared.lock();
        state.push(command, Instant::now());
        drop(state);
        self.shared.wake.notify_all();
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().pending()
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.shared.lock().awaiting_ack()
    }

    pub fn last_sent(&self) -> Option<String> {
        self.shared.lock().last_sent().map(str::to_string)
    }

    /// Payload of the most recent inbound response.
    pub fn last_response(&self) -> Option<String> {
        self.shared.lock().last_response().map(str::to_string)
    }

    /// Count of inbound responses; lets callers tell a fresh `ok` from an old one.
    pub fn responses_received(&self) -> u64 {
        self.shared.lock().responses()
    }

    /// Whether the queue is drained and the last command acknowledged.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.pending() == 0 && !state.awaiting_ack()
    }

    /// Stop both loops and wait for them to exit. In-flight commands are
    /// abandoned.
    pub fn shutdown(&mut self) {
        stop(&self.shared);
        if let Some(handle) = self.sender.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DroneControl for CommandChannel {
    fn send_raw(&self, command: &str) {
        self.enqueue(command);
    }

    fn is_busy(&self) -> bool {
        !self.is_idle()
    }
}

fn stop(shared: &Shared) {
    shared.shutdown.store(true, Ordering::SeqCst);
    // Taking the lock orders the flag before any sender about to wait.
    drop(shared.lock());
    shared.wake.notify_all();
}

fn spawn_named<F>(name: &'static str, f: F) -> Result<thread::JoinHandle<()>, LinkError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|source| LinkError::Spawn { name, source })
}

fn run_sender<T: Transport + ?Sized>(
    shared: &Shared,
    transport: &T,
    backoff: Duration,
    verbose: bool,
) {
    let mut state = shared.lock();
    while !shared.is_shutdown() {
        let now = Instant::now();
        match state.next_dispatch(now) {
            Dispatch::Transmit { command, keepalive } => {
                let outcome = match transport.send(command.text.as_bytes()) {
                    Ok(()) => SendOutcome::Sent,
                    Err(err) => {
                        if verbose {
                            warn!(command = %command.text, "command send failed: {err}");
                        } else {
                            debug!(command = %command.text, "command send failed: {err}");
                        }
                        state.send_failed()
                    }
                };
                match outcome {
                    SendOutcome::Sent => {
                        if keepalive {
                            debug!("keep-alive sent");
                            metrics::counter!("drone_keepalives_total").increment(1);
                        } else {
                            debug!(
                                command = %command.text,
                                queued_for = ?now.saturating_duration_since(command.created_at),
                                "command sent"
                            );
                            metrics::counter!("drone_commands_sent_total").increment(1);
                        }
                    }
                    SendOutcome::Retry => {
                        metrics::counter!("drone_send_failures_total").increment(1);
                        state = shared.back_off(state, backoff);
                    }
                    SendOutcome::Dropped => {
                        metrics::counter!("drone_send_failures_total").increment(1);
                        metrics::counter!("drone_commands_dropped_total").increment(1);
                        error!(
                            command = %command.text,
                            attempts = command.attempts + 1,
                            "dropping command after repeated send failures"
                        );
                        state = shared.back_off(state, backoff);
                    }
                }
            }
            Dispatch::WaitUntil(deadline) => {
                let timeout = deadline.saturating_duration_since(now);
                if !timeout.is_zero() {
                    state = shared.wait_for(state, timeout);
                }
            }
            Dispatch::WaitForAck => {
                state = shared.wait(state);
            }
        }
    }
    debug!("command sender stopped");
}

fn run_receiver<T: Transport + ?Sized>(
    shared: &Shared,
    transport: &T,
    backoff: Duration,
    verbose: bool,
) {
    let mut buf = [0u8; RESPONSE_BUFFER_LEN];
    while !shared.is_shutdown() {
        match transport.recv(&mut buf) {
            Ok(Some(len)) => {
                let response = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                let mut state = shared.lock();
                let command = state.last_sent().map(str::to_string);
                let released = state.acknowledge(response.clone());
                drop(state);
                metrics::counter!("drone_acks_total").increment(1);
                if released {
                    shared.wake.notify_all();
                    debug!(command = ?command, response = %response, "acknowledged");
                } else {
                    debug!(response = %response, "response with no command in flight");
                }
            }
            Ok(None) => {}
            Err(err) => {
                if verbose {
                    warn!("command link receive failed: {err}");
                } else {
                    debug!("command link receive failed: {err}");
                }
                thread::sleep(backoff);
            }
        }
    }
    debug!("command receiver stopped");
}
