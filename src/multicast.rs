//! Listens across every candidate multicast group for presence
//! announcements, validates them, and populates the shared [`Directory`]
//! (§4.4). Grounded on the teacher's socket setup (`SO_REUSEADDR` via
//! `socket2`, since std's `UdpSocket` has no portable way to set it) and
//! the interface enumeration in `net.rs`.

use crate::config::EngineConfig;
use crate::directory::Directory;
use crate::error::PortsError;
use crate::presence;
use socket2::{Domain, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Owns the listening socket and the background receive loop.
pub struct MulticastEngine {
    socket: Arc<UdpSocket>,
    local_ip: Ipv4Addr,
    running: Arc<AtomicBool>,
}

impl MulticastEngine {
    /// Bind the first available preferred port, join every candidate
    /// group (best-effort — a failed join is logged and skipped, not
    /// fatal), and start the receive loop feeding `directory`.
    pub fn start(
        config: &EngineConfig,
        local_ip: Ipv4Addr,
        directory: Arc<Directory>,
    ) -> Result<Arc<Self>, PortsError> {
        let socket = bind_preferred_port(&config.preferred_ports)?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;

        let mut joined = 0usize;
        for &group in &config.candidate_groups {
            match socket.join_multicast_v4(&group, &local_ip) {
                Ok(()) => joined += 1,
                Err(e) => tracing::debug!(group = %group, error = %e, "could not join multicast group"),
            }
        }
        if joined == 0 {
            return Err(PortsError::NoChannel);
        }
        tracing::info!(joined, total = config.candidate_groups.len(), "joined multicast groups");

        let engine = Arc::new(Self {
            socket: Arc::new(socket),
            local_ip,
            running: Arc::new(AtomicBool::new(true)),
        });
        engine.clone().spawn_receive_loop(directory);
        Ok(engine)
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    fn spawn_receive_loop(self: Arc<Self>, directory: Arc<Directory>) {
        thread::spawn(move || {
            let mut buf = vec![0u8; crate::config::PRESENCE_PAYLOAD_LEN + 16];
            while self.running.load(Ordering::Relaxed) {
                match self.socket.recv_from(&mut buf) {
                    Ok((n, _src)) => {
                        let raw = buf[..n].to_vec();
                        if let Some(parsed) = presence::parse(&raw) {
                            directory.upsert(raw, parsed);
                        }
                    }
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        tracing::error!(error = %e, "multicast receive loop lost its socket, stopping");
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for MulticastEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the first preferred port that is free. `SO_REUSEADDR` lets
/// multiple local processes share a port for multicast reception,
/// mirroring the teacher's raw-socket setup. Fails startup with
/// `NoListenPort` if none of the preferred ports is free (§4.4) — no
/// ephemeral-port fallback, since that would make discovery unreachable
/// for anyone who isn't also trying the same preferred list.
fn bind_preferred_port(preferred: &[u16]) -> Result<UdpSocket, PortsError> {
    for &port in preferred {
        if let Ok(sock) = try_bind(port) {
            return Ok(sock);
        }
    }
    Err(PortsError::NoListenPort)
}

fn try_bind(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_and_stops_without_error() {
        let config = EngineConfig::default();
        let directory = Arc::new(Directory::new(config.candidate_groups.len()));
        let engine = MulticastEngine::start(&config, Ipv4Addr::new(127, 0, 0, 1), directory).unwrap();
        assert_ne!(engine.local_port(), 0);
        engine.stop();
    }
}
