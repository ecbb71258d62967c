//! Command and telemetry links to a Tello-class drone.
//!
//! - `command`: wire vocabulary and the [`DroneControl`] capability trait.
//! - `queue`: acknowledgement-gated queue with keep-alive scheduling.
//! - `channel`: sender/receiver threads driving the queue over UDP.
//! - `telemetry`: passive state receiver, latest sample wins.
//! - `transport`: datagram abstraction used by the channel.

use std::{io, net::SocketAddr};

use thiserror::Error;

pub mod channel;
pub mod command;
pub mod queue;
pub mod telemetry;
pub mod transport;

pub use channel::{COMMAND_PORT, CommandChannel, LinkConfig};
pub use command::{Command, DroneControl, MAX_MOTION_MAGNITUDE, Motion};
pub use queue::{
    DEFAULT_ACK_TIMEOUT, KEEPALIVE_COMMAND, PendingCommand, QueuePolicy, SendOutcome,
};
pub use telemetry::{STATE_PORT, TelemetryChannel, TelemetryConfig, TelemetrySample};
pub use transport::{Transport, UdpTransport};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to bind UDP socket on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to configure UDP socket")]
    Configure(#[source] io::Error),
    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}
