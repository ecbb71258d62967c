//! Textual command vocabulary and the capability interface used by
//! controllers.

use std::fmt;

/// Largest magnitude a controller may embed in a motion command.
pub const MAX_MOTION_MAGNITUDE: u32 = 100;

/// Direction of a single-axis relative move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Motion {
    Up,
    Down,
    Left,
    Right,
    Forward,
    Back,
    Clockwise,
    CounterClockwise,
}

impl Motion {
    /// Wire keyword for this motion.
    pub fn keyword(self) -> &'static str {
        match self {
            Motion::Up => "up",
            Motion::Down => "down",
            Motion::Left => "left",
            Motion::Right => "right",
            Motion::Forward => "forward",
            Motion::Back => "back",
            Motion::Clockwise => "cw",
            Motion::CounterClockwise => "ccw",
        }
    }
}

/// Commands understood by the vehicle's text protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Enter SDK mode. Doubles as the keep-alive.
    Handshake,
    StreamOn,
    StreamOff,
    Takeoff,
    Land,
    Emergency,
    /// Hover in place.
    Stop,
    /// Relative move in centimetres (or degrees for rotations).
    Move { motion: Motion, magnitude: u32 },
    /// Fly to `x y z` (cm) relative to the current position at `speed` cm/s.
    Go { x: i32, y: i32, z: i32, speed: u32 },
    /// Anything else, passed through verbatim.
    Raw(String),
}

impl Command {
    /// Build a move command, clamping the magnitude into `[0, 100]`.
    pub fn motion(motion: Motion, magnitude: u32) -> Self {
        Command::Move {
            motion,
            magnitude: magnitude.min(MAX_MOTION_MAGNITUDE),
        }
    }

    /// Render the command as sent on the wire.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Handshake => f.write_str("command"),
            Command::StreamOn => f.write_str("streamon"),
            Command::StreamOff => f.write_str("streamoff"),
            Command::Takeoff => f.write_str("takeoff"),
            Command::Land => f.write_str("land"),
            Command::Emergency => f.write_str("emergency"),
            Command::Stop => f.write_str("stop"),
            Command::Move { motion, magnitude } => write!(
                f,
                "{} {}",
                motion.keyword(),
                (*magnitude).min(MAX_MOTION_MAGNITUDE)
            ),
            Command::Go { x, y, z, speed } => write!(f, "go {x} {y} {z} {speed}"),
            Command::Raw(text) => f.write_str(text),
        }
    }
}

/// Capability interface for anything that can fly the vehicle.
///
/// Implementations must not block: calls are made from the per-frame control
/// loop.
pub trait DroneControl {
    /// Queue a raw textual command.
    fn send_raw(&self, command: &str);

    /// Whether earlier commands are still queued or unacknowledged. Callers
    /// with fresher intent skip sending rather than pile up behind them.
    fn is_busy(&self) -> bool {
        false
    }

    fn send(&self, command: &Command) {
        self.send_raw(&command.to_wire());
    }

    fn move_axis(&self, motion: Motion, magnitude: u32) {
        self.send(&Command::motion(motion, magnitude));
    }

    fn takeoff(&self) {
        self.send(&Command::Takeoff);
    }

    fn land(&self) {
        self.send(&Command::Land);
    }
}

impl<T: DroneControl + ?Sized> DroneControl for &T {
    fn send_raw(&self, command: &str) {
        (**self).send_raw(command);
    }

    fn is_busy(&self) -> bool {
        (**self).is_busy()
    }
}
