use std::{
    io,
    net::{SocketAddr, UdpSocket},
    time::Duration,
};

use crate::LinkError;

/// Datagram transport used by the command channel.
///
/// `recv` must return `Ok(None)` when no datagram arrived within the
/// transport's poll interval so that receive loops can observe shutdown.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, payload: &[u8]) -> io::Result<()>;
    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

/// UDP socket bound locally and aimed at the vehicle's command port.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    pub fn bind(
        local: SocketAddr,
        peer: SocketAddr,
        poll_interval: Duration,
    ) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(local).map_err(|source| LinkError::Bind {
            addr: local,
            source,
        })?;
        Self::from_socket(socket, peer, poll_interval)
    }

    pub fn from_socket(
        socket: UdpSocket,
        peer: SocketAddr,
        poll_interval: Duration,
    ) -> Result<Self, LinkError> {
        socket
            .set_read_timeout(Some(poll_interval))
            .map_err(LinkError::Configure)?;
        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        let written = self.socket.send_to(payload, self.peer)?;
        if written != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram write: {written} of {} bytes", payload.len()),
            ));
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv_from(buf) {
            Ok((len, _from)) => Ok(Some(len)),
            Err(err) if is_timeout(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
