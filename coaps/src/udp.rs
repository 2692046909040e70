//! The transport socket manager
//!
//! Owns the only UDP socket and the modem behind it. Callers see `send`, `recv` and the recovery
//! operations, never the socket itself.

use std::{
    future, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::platform::Modem;

pub(crate) struct SocketManager {
    destination: SocketAddr,
    local: SocketAddr,
    release_assistance: bool,
    modem: Box<dyn Modem>,
    socket: Option<UdpSocket>,
    reopens: u64,
}

impl SocketManager {
    pub(crate) fn new(
        destination: SocketAddr,
        local: SocketAddr,
        release_assistance: bool,
        modem: Box<dyn Modem>,
    ) -> Self {
        Self {
            destination,
            local: bind_address(local, destination),
            release_assistance,
            modem,
            socket: None,
            reopens: 0,
        }
    }

    /// Create the socket and connect it to the destination
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn open(&mut self) -> io::Result<()> {
        self.socket = None;
        let socket = Socket::new(
            Domain::for_address(self.destination),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_nonblocking(true)?;
        socket.bind(&self.local.into())?;
        socket.connect(&self.destination.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        if let Err(e) = self.modem.set_release_assistance(self.release_assistance) {
            debug!("release assistance unavailable: {}", e);
        }
        debug!(local = ?socket.local_addr().ok(), destination = %self.destination, "socket open");
        self.socket = Some(socket);
        Ok(())
    }

    pub(crate) async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let sent = socket.send(datagram).await?;
        if sent != datagram.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "datagram truncated"));
        }
        Ok(())
    }

    /// Receive the next datagram; pends forever while no socket is open
    pub(crate) async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.socket {
            Some(socket) => socket.recv(buf).await,
            None => future::pending().await,
        }
    }

    /// Recreate the socket after `error`
    ///
    /// Restarts the modem first if the device lost its attachment. Returns whether a new socket
    /// is open.
    pub(crate) fn recover(&mut self, error: &io::Error) -> bool {
        let pending = self
            .socket
            .as_ref()
            .and_then(|socket| SockRef::from(socket).take_error().ok().flatten());
        warn!(%error, ?pending, "socket error, reopening");
        self.socket = None;
        self.reopens += 1;

        if !self.modem.is_attached() {
            info!("no network attachment");
            if let Err(e) = self.modem.restart() {
                warn!("modem restart failed: {}", e);
                return false;
            }
        }
        match self.open() {
            Ok(()) => true,
            Err(e) => {
                warn!("reopening socket failed: {}", e);
                false
            }
        }
    }

    /// Restart the modem unconditionally, then reopen the socket
    pub(crate) fn restart_modem(&mut self) -> io::Result<()> {
        self.socket = None;
        self.modem.restart()?;
        self.reopens += 1;
        self.open()
    }

    /// Whether the radio link is fully up
    pub(crate) fn link_ready(&self) -> bool {
        self.modem.is_ready()
    }

    pub(crate) fn reopens(&self) -> u64 {
        self.reopens
    }
}

/// Replace an unspecified local address of the wrong family
fn bind_address(local: SocketAddr, destination: SocketAddr) -> SocketAddr {
    match (local.ip(), destination.ip()) {
        (IpAddr::V4(ip), IpAddr::V6(_)) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), local.port())
        }
        (IpAddr::V6(ip), IpAddr::V4(_)) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), local.port())
        }
        _ => local,
    }
}
