//! Channel arbitration: pick a free multicast group by silence-sensing
//! with randomized backoff and bounded attempts (§4.5). Grounded on the
//! original's `trafic_libre` helper, generalized into a bounded
//! attempt/backoff loop.

use crate::config::EngineConfig;
use crate::error::PortsError;
use crate::presence;
use rand::Rng;
use socket2::{Domain, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Join `group` on a scratch socket and listen for `window`; any
/// received datagram means the channel is not free. Mirrors the
/// source's `trafic_libre(ip, port, duree)`.
pub fn sense_silence(group: Ipv4Addr, local_ip: Ipv4Addr, port: u16, window: Duration) -> bool {
    let socket = match Socket::new(Domain::IPV4, Type::DGRAM, None) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let _ = socket.set_reuse_address(true);
    if socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into()).is_err() {
        return false;
    }
    let std_socket: UdpSocket = socket.into();
    if std_socket.join_multicast_v4(&group, &local_ip).is_err() {
        return false;
    }
    let _ = std_socket.set_read_timeout(Some(window));
    let mut buf = [0u8; 2048];
    matches!(std_socket.recv_from(&mut buf), Err(_)) // silent == recv failed/timed out
}

/// Claims ownership of a multicast address for periodic self-announcement.
pub struct ChannelArbiter {
    owned_group: Option<Ipv4Addr>,
    stop: Arc<AtomicBool>,
}

impl ChannelArbiter {
    /// Run the adoption algorithm over every candidate in order. Returns
    /// `NoChannel` if all 301 candidates are occupied.
    pub fn adopt(
        config: &EngineConfig,
        local_ip: Ipv4Addr,
        presence_port: u16,
        announce_payload: impl Fn() -> Vec<u8> + Send + Sync + 'static,
    ) -> Result<Self, PortsError> {
        let mut rng = rand::thread_rng();

        for &candidate in &config.candidate_groups {
            if !sense_silence(candidate, local_ip, presence_port, config.listen_interval) {
                continue; // channel is occupied, try the next candidate
            }

            let mut adopted = false;
            for _ in 0..config.appropriation_attempts {
                if let Ok(sock) = UdpSocket::bind((local_ip, 0)) {
                    let _ = sock.set_multicast_ttl_v4(1);
                    let _ = sock.send_to(&announce_payload(), SocketAddr::from((candidate, presence_port)));
                }
                thread::sleep(config.listen_interval / 2);
                let still_free = sense_silence(candidate, local_ip, presence_port, config.listen_interval / 2);
                if still_free {
                    adopted = true;
                    break;
                }
                let backoff = rng.gen_range(Duration::from_millis(0)..config.backoff_max);
                thread::sleep(backoff);
            }

            if adopted {
                tracing::info!(group = %candidate, "adopted multicast channel");
                let stop = Arc::new(AtomicBool::new(false));
                spawn_announcer(candidate, local_ip, presence_port, config.announce_interval, stop.clone(), announce_payload);
                return Ok(Self { owned_group: Some(candidate), stop });
            }
        }

        tracing::warn!("no free multicast channel after exhausting all candidates");
        Err(PortsError::NoChannel)
    }

    pub fn owned_group(&self) -> Option<Ipv4Addr> {
        self.owned_group
    }
}

impl Drop for ChannelArbiter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn spawn_announcer(
    group: Ipv4Addr,
    local_ip: Ipv4Addr,
    port: u16,
    interval: Duration,
    stop: Arc<AtomicBool>,
    payload: impl Fn() -> Vec<u8> + Send + Sync + 'static,
) {
    thread::spawn(move || {
        let sock = match UdpSocket::bind((local_ip, 0)) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "announcer could not bind socket");
                return;
            }
        };
        let _ = sock.set_multicast_ttl_v4(1);
        while !stop.load(Ordering::Relaxed) {
            let _ = sock.send_to(&payload(), SocketAddr::from((group, port)));
            thread::sleep(interval);
        }
    });
}

/// Build the announce payload once, reusable by both the arbiter and the
/// standalone announcer thread.
pub fn build_announce_payload(
    names: &str,
    surnames: &str,
    public_key: Option<&[u8]>,
    announced: (Ipv4Addr, u16),
) -> Vec<u8> {
    presence::build(names, surnames, public_key, announced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sense_silence_on_truly_quiet_group_returns_true() {
        let group = Ipv4Addr::new(239, 192, 250, 1);
        let quiet = sense_silence(group, Ipv4Addr::new(127, 0, 0, 1), 0, Duration::from_millis(50));
        assert!(quiet);
    }
}
