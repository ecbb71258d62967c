//! Scheduling state shared by the command sender and the acknowledgement
//! receiver.
//!
//! `ChannelState` is a plain state machine driven by explicit timestamps. The
//! threads in [`crate::channel`] own it behind a mutex; tests drive it with
//! synthetic clocks.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tracing::warn;

/// Text sent when the link has been idle for too long.
pub const KEEPALIVE_COMMAND: &str = "command";

/// Ack wait before a command counts as lost. A lost ack must not hold back
/// keep-alives past the vehicle's ~15 s silence cutoff.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(7);

/// A queued textual instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCommand {
    pub text: String,
    pub created_at: Instant,
    /// Failed transmission attempts so far.
    pub attempts: u32,
}

impl PendingCommand {
    pub fn new(text: impl Into<String>, created_at: Instant) -> Self {
        Self {
            text: text.into(),
            created_at,
            attempts: 0,
        }
    }
}

/// Timing and retry policy for the queue.
#[derive(Clone, Debug)]
pub struct QueuePolicy {
    /// Idle time after which a keep-alive is transmitted.
    pub keepalive_interval: Duration,
    /// Declare an acknowledgement lost after this long. `None` waits forever.
    pub ack_timeout: Option<Duration>,
    /// Drop a command after this many failed transmissions.
    pub max_send_attempts: u32,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            ack_timeout: Some(DEFAULT_ACK_TIMEOUT),
            max_send_attempts: 3,
        }
    }
}

/// What the sender should do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Transmit this command now. It is already marked in flight.
    Transmit {
        command: PendingCommand,
        keepalive: bool,
    },
    /// Nothing to send before `deadline` unless woken.
    WaitUntil(Instant),
    /// A command is in flight; nothing can happen until an ack arrives.
    WaitForAck,
}

/// Result of a transmission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The command went back to the head of the queue.
    Retry,
    /// The command exhausted its attempts and was discarded.
    Dropped,
}

#[derive(Clone, Debug)]
struct InFlight {
    command: PendingCommand,
    keepalive: bool,
    sent_at: Instant,
    idle_since_before: Instant,
}

/// Queue, in-flight record and idle timer of a command channel.
#[derive(Debug)]
pub struct ChannelState {
    policy: QueuePolicy,
    queue: VecDeque<PendingCommand>,
    last_sent: Option<InFlight>,
    last_ack_received: bool,
    last_keepalive_time: Instant,
    last_response: Option<String>,
    responses: u64,
}

impl ChannelState {
    /// Create an empty state whose idle timer starts at `now`.
    pub fn new(policy: QueuePolicy, now: Instant) -> Self {
        Self {
            policy,
            queue: VecDeque::new(),
            last_sent: None,
            last_ack_received: true,
            last_keepalive_time: now,
            last_response: None,
            responses: 0,
        }
    }

    pub fn push(&mut self, text: impl Into<String>, now: Instant) {
        self.queue.push_back(PendingCommand::new(text, now));
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether a transmitted command still lacks an acknowledgement.
    pub fn awaiting_ack(&self) -> bool {
        !self.last_ack_received
    }

    /// Text of the most recently transmitted command.
    pub fn last_sent(&self) -> Option<&str> {
        self.last_sent.as_ref().map(|sent| sent.command.text.as_str())
    }

    pub fn last_response(&self) -> Option<&str> {
        self.last_response.as_deref()
    }

    /// Inbound responses seen so far, stray ones included.
    pub fn responses(&self) -> u64 {
        self.responses
    }

    /// Decide the next action at `now`.
    ///
    /// A returned `Transmit` has already been popped and marked in flight; the
    /// caller must report a failed send through [`ChannelState::send_failed`]
    /// before releasing the lock guarding this state.
    pub fn next_dispatch(&mut self, now: Instant) -> Dispatch {
        if !self.last_ack_received {
            let Some(sent) = self.last_sent.as_ref() else {
                self.last_ack_received = true;
                return self.next_dispatch(now);
            };
            match self.policy.ack_timeout {
                Some(timeout) if now.saturating_duration_since(sent.sent_at) >= timeout => {
                    warn!(
                        command = %sent.command.text,
                        "no acknowledgement after {:?}; treating command as lost",
                        timeout
                    );
                    metrics::counter!("drone_ack_timeouts_total").increment(1);
                    self.last_ack_received = true;
                }
                Some(timeout) => return Dispatch::WaitUntil(sent.sent_at + timeout),
                None => return Dispatch::WaitForAck,
            }
        }

        if let Some(command) = self.queue.pop_front() {
            return self.mark_in_flight(command, false, now);
        }

        let keepalive_due = self.last_keepalive_time + self.policy.keepalive_interval;
        if now >= keepalive_due {
            let command = PendingCommand::new(KEEPALIVE_COMMAND, now);
            return self.mark_in_flight(command, true, now);
        }

        Dispatch::WaitUntil(keepalive_due)
    }

    fn mark_in_flight(
        &mut self,
        command: PendingCommand,
        keepalive: bool,
        now: Instant,
    ) -> Dispatch {
        self.last_sent = Some(InFlight {
            command: command.clone(),
            keepalive,
            sent_at: now,
            idle_since_before: self.last_keepalive_time,
        });
        self.last_ack_received = false;
        self.last_keepalive_time = now;
        Dispatch::Transmit { command, keepalive }
    }

    /// Undo the in-flight mark after a failed transmission.
    pub fn send_failed(&mut self) -> SendOutcome {
        let Some(sent) = self.last_sent.take() else {
            return SendOutcome::Dropped;
        };
        self.last_ack_received = true;
        self.last_keepalive_time = sent.idle_since_before;

        if sent.keepalive {
            // Regenerated on the next cycle because the idle timer was restored.
            return SendOutcome::Retry;
        }

        let mut command = sent.command;
        command.attempts += 1;
        if command.attempts >= self.policy.max_send_attempts {
            return SendOutcome::Dropped;
        }
        self.queue.push_front(command);
        SendOutcome::Retry
    }

    /// Record an inbound response. Returns `true` if it released the gate.
    pub fn acknowledge(&mut self, response: impl Into<String>) -> bool {
        self.last_response = Some(response.into());
        self.responses += 1;
        if self.last_ack_received {
            return false;
        }
        self.last_ack_received = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(keepalive_secs: u64) -> QueuePolicy {
        QueuePolicy {
            keepalive_interval: Duration::from_secs(keepalive_secs),
            ..QueuePolicy::default()
        }
    }

    fn transmitted(dispatch: Dispatch) -> Option<(String, bool)> {
        match dispatch {
            Dispatch::Transmit { command, keepalive } => Some((command.text, keepalive)),
            _ => None,
        }
    }

    #[test]
    fn acknowledged_commands_leave_in_fifo_order() {
        let t0 = Instant::now();
        let mut state = ChannelState::new(policy(10), t0);
        for text in ["command", "takeoff", "land"] {
            state.push(text, t0);
        }

        let mut sent = Vec::new();
        let mut now = t0;
        for _ in 0..3 {
            now += Duration::from_millis(20);
            let (text, keepalive) = transmitted(state.next_dispatch(now)).expect("transmit");
            assert!(!keepalive);
            sent.push(text);
            assert_eq!(state.next_dispatch(now), Dispatch::WaitForAck);
            assert!(state.acknowledge("ok"));
        }
        assert_eq!(sent, vec!["command", "takeoff", "land"]);
        assert_eq!(state.pending(), 0);
    }

    #[test]
    fn next_command_waits_for_acknowledgement() {
        let t0 = Instant::now();
        let strict = QueuePolicy {
            ack_timeout: None,
            ..policy(10)
        };
        let mut state = ChannelState::new(strict, t0);
        state.push("takeoff", t0);
        state.push("up 20", t0);

        assert!(transmitted(state.next_dispatch(t0)).is_some());
        for step in 1..50 {
            let now = t0 + Duration::from_millis(step * 100);
            assert_eq!(state.next_dispatch(now), Dispatch::WaitForAck);
        }
        assert!(state.awaiting_ack());
        assert_eq!(state.pending(), 1);

        state.acknowledge("ok");
        let (text, _) = transmitted(state.next_dispatch(t0 + Duration::from_secs(5))).unwrap();
        assert_eq!(text, "up 20");
    }

    #[test]
    fn stray_acknowledgement_does_not_open_a_closed_queue_twice() {
        let t0 = Instant::now();
        let mut state = ChannelState::new(policy(10), t0);
        assert!(!state.acknowledge("ok"));
        assert_eq!(state.last_response(), Some("ok"));
        assert_eq!(state.responses(), 1);
    }

    #[test]
    fn single_keepalive_after_idle_interval() {
        let t0 = Instant::now();
        let mut state = ChannelState::new(policy(10), t0);

        let mut keepalives = Vec::new();
        for step in 0..=120u64 {
            let now = t0 + Duration::from_millis(step * 100);
            if let Some((text, keepalive)) = transmitted(state.next_dispatch(now)) {
                assert!(keepalive);
                assert_eq!(text, KEEPALIVE_COMMAND);
                keepalives.push(now.duration_since(t0));
            }
        }
        assert_eq!(keepalives, vec![Duration::from_secs(10)]);
    }

    #[test]
    fn keepalive_timer_resets_on_every_transmission() {
        let t0 = Instant::now();
        let mut state = ChannelState::new(policy(10), t0);

        state.push("takeoff", t0 + Duration::from_secs(6));
        assert!(transmitted(state.next_dispatch(t0 + Duration::from_secs(6))).is_some());
        state.acknowledge("ok");

        let due = state.next_dispatch(t0 + Duration::from_secs(10));
        assert_eq!(due, Dispatch::WaitUntil(t0 + Duration::from_secs(16)));

        let (_, keepalive) = transmitted(state.next_dispatch(t0 + Duration::from_secs(16))).unwrap();
        assert!(keepalive);
        state.acknowledge("ok");
        assert_eq!(
            state.next_dispatch(t0 + Duration::from_secs(17)),
            Dispatch::WaitUntil(t0 + Duration::from_secs(26))
        );
    }

    #[test]
    fn failed_send_restores_head_then_drops() {
        let t0 = Instant::now();
        let mut state = ChannelState::new(policy(10), t0);
        state.push("takeoff", t0);
        state.push("land", t0);

        for attempt in 1..=3 {
            let (text, _) = transmitted(state.next_dispatch(t0)).unwrap();
            assert_eq!(text, "takeoff");
            let outcome = state.send_failed();
            if attempt < 3 {
                assert_eq!(outcome, SendOutcome::Retry);
                assert_eq!(state.pending(), 2);
            } else {
                assert_eq!(outcome, SendOutcome::Dropped);
                assert_eq!(state.pending(), 1);
            }
            assert!(!state.awaiting_ack());
        }

        let (text, _) = transmitted(state.next_dispatch(t0)).unwrap();
        assert_eq!(text, "land");
    }

    #[test]
    fn failed_keepalive_keeps_idle_timer() {
        let t0 = Instant::now();
        let mut state = ChannelState::new(policy(10), t0);
        let at = t0 + Duration::from_secs(10);
        assert!(transmitted(state.next_dispatch(at)).is_some());
        assert_eq!(state.send_failed(), SendOutcome::Retry);

        let (_, keepalive) = transmitted(state.next_dispatch(at + Duration::from_millis(100))).unwrap();
        assert!(keepalive);
    }

    #[test]
    fn ack_timeout_reopens_the_gate() {
        let t0 = Instant::now();
        let mut state = ChannelState::new(
            QueuePolicy {
                ack_timeout: Some(Duration::from_secs(2)),
                ..policy(10)
            },
            t0,
        );
        state.push("takeoff", t0);
        state.push("land", t0);
        assert!(transmitted(state.next_dispatch(t0)).is_some());

        assert_eq!(
            state.next_dispatch(t0 + Duration::from_secs(1)),
            Dispatch::WaitUntil(t0 + Duration::from_secs(2))
        );
        let (text, _) = transmitted(state.next_dispatch(t0 + Duration::from_secs(2))).unwrap();
        assert_eq!(text, "land");
    }

    #[test]
    fn lost_acknowledgement_does_not_silence_the_link() {
        let t0 = Instant::now();
        let mut state = ChannelState::new(QueuePolicy::default(), t0);
        state.push("up 30", t0);
        assert!(transmitted(state.next_dispatch(t0)).is_some());

        assert_eq!(
            state.next_dispatch(t0 + Duration::from_secs(1)),
            Dispatch::WaitUntil(t0 + DEFAULT_ACK_TIMEOUT)
        );
        // Gate reopens at 7 s; the keep-alive still goes out at 10 s.
        let (text, keepalive) = transmitted(state.next_dispatch(t0 + Duration::from_secs(10))).unwrap();
        assert!(keepalive);
        assert_eq!(text, KEEPALIVE_COMMAND);

        state.push("land", t0 + Duration::from_secs(11));
        assert_eq!(
            state.next_dispatch(t0 + Duration::from_secs(12)),
            Dispatch::WaitUntil(t0 + Duration::from_secs(17))
        );
        let (text, _) = transmitted(state.next_dispatch(t0 + Duration::from_secs(17))).unwrap();
        assert_eq!(text, "land");
        assert_eq!(state.pending(), 0);
    }
}
