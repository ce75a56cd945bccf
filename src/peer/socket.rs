use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::{PeerConfig, SimulationConfig};

/// This is an abstraction for non-blocking datagram I/O, introduced to facilitate mocking
///  the socket away for testing. Both methods return [io::ErrorKind::WouldBlock] instead of
///  waiting.
#[cfg_attr(test, automock)]
pub trait DatagramSocket: Send + 'static {
    fn try_send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn try_send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.send_to(buf, to)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Binds a non-blocking UDP socket with the configured OS buffer sizes
pub fn bind_socket(config: &PeerConfig) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(config.bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_send_buffer_size(config.send_buffer_size)?;
    socket.set_recv_buffer_size(config.receive_buffer_size)?;
    socket.bind(&config.bind_addr.into())?;

    let socket: UdpSocket = socket.into();
    socket.set_nonblocking(true)?;
    debug!("bound UDP socket to {:?}", socket.local_addr()?);
    Ok(socket)
}

/// Simulated bad network conditions for outgoing datagrams: loss, duplication and latency.
///  Delayed datagrams are held here until they are due.
pub(crate) struct Simulation {
    config: SimulationConfig,
    delayed: VecDeque<(Instant, SocketAddr, BytesMut)>,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Simulation {
        Simulation {
            config,
            delayed: Default::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.config.is_active()
    }

    /// Returns the points in time at which a datagram should go on the wire: none if it is
    ///  lost, two if it is duplicated
    pub fn plan(&self, now: Instant) -> Vec<Instant> {
        if self.config.loss > 0.0 && rand::random::<f64>() < self.config.loss {
            trace!("simulation: dropping datagram");
            return Vec::new();
        }

        let num_copies = if self.config.duplicates > 0.0 && rand::random::<f64>() < self.config.duplicates {
            trace!("simulation: duplicating datagram");
            2
        }
        else {
            1
        };

        (0..num_copies)
            .map(|_| now + self.config.min_latency + self.config.random_latency.mul_f64(rand::random::<f64>()))
            .collect()
    }

    pub fn delay(&mut self, due: Instant, to: SocketAddr, datagram: BytesMut) {
        // NB: random latency can reorder datagrams, which is part of the simulation
        let idx = self.delayed.partition_point(|(t, _, _)| *t <= due);
        self.delayed.insert(idx, (due, to, datagram));
    }

    /// Removes and returns all delayed datagrams that are due at `now`
    pub fn take_due(&mut self, now: Instant) -> Vec<(SocketAddr, BytesMut)> {
        let num_due = self.delayed.partition_point(|(t, _, _)| *t <= now);
        self.delayed.drain(..num_due)
            .map(|(_, to, datagram)| (to, datagram))
            .collect()
    }

    pub fn take_all(&mut self) -> Vec<(SocketAddr, BytesMut)> {
        self.delayed.drain(..)
            .map(|(_, to, datagram)| (to, datagram))
            .collect()
    }

    #[cfg(test)]
    pub fn num_delayed(&self) -> usize {
        self.delayed.len()
    }
}
