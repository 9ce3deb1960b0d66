//! Runtime configuration, passed at engine construction instead of living
//! as module-level globals (the source's `adresses_multicast` / `ports_decoutes`
//! lists are reborn here as fields of [`EngineConfig`]).

use std::net::Ipv4Addr;
use std::time::Duration;

/// The ten control ports the source tries in order, verbatim.
pub const PREFERRED_PORTS: [u16; 10] = [
    54321, 58732, 61248, 49876, 52413, 59987, 63254, 50789, 57801, 64523,
];

/// Destination port for multicast presence announcements.
pub const PRESENCE_PORT: u16 = 54321;

pub const PRESENCE_PAYLOAD_LEN: usize = 1470;
pub const DATA_PACKET_LEN: usize = 1440;
pub const DATA_HEADER_LEN: usize = 16;
pub const DATA_PAYLOAD_LEN: usize = 1431;

/// Largest blob this crate promises to reassemble in one piece (§9's
/// frame-roundtrip property exercises blobs up to this size). Bounds
/// the packet count a header is allowed to claim before any allocation
/// happens, so a header with a valid CRC but an absurd `packet_count`
/// can't be used to make a receiver allocate on a peer's say-so.
pub const MAX_BLOB_LEN: usize = 200_000;
pub const MAX_PACKET_COUNT: usize = (MAX_BLOB_LEN + DATA_PAYLOAD_LEN - 1) / DATA_PAYLOAD_LEN;

/// Build the 301 candidate multicast groups `239.192.{1,2}.{1..255}`.
pub fn candidate_multicast_addresses() -> Vec<Ipv4Addr> {
    let mut addrs = Vec::with_capacity(301);
    'outer: for third in 1u8..=2 {
        for fourth in 1u16..=255 {
            if addrs.len() >= 301 {
                break 'outer;
            }
            addrs.push(Ipv4Addr::new(239, 192, third, fourth as u8));
        }
    }
    addrs
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Candidate multicast group addresses, tried in order by the arbiter
    /// and all joined by the listener.
    pub candidate_groups: Vec<Ipv4Addr>,
    /// Preferred control/listen ports, tried in order at startup.
    pub preferred_ports: Vec<u16>,
    /// Silence-sensing window used by the channel arbiter.
    pub listen_interval: Duration,
    /// Bounded adoption attempts per candidate address.
    pub appropriation_attempts: u32,
    /// Upper bound (exclusive) of the randomized backoff between attempts.
    pub backoff_max: Duration,
    /// Cadence of the periodic self-announcement once a channel is owned.
    pub announce_interval: Duration,
    /// Per-attempt timeout while awaiting a session handshake ACK.
    pub handshake_timeout: Duration,
    /// Number of handshake attempts before giving up with `HandshakeTimeout`.
    pub handshake_retry: u32,
    /// Local names/surnames advertised in this process's presence payload.
    pub local_names: Vec<String>,
    pub local_surnames: Vec<String>,
    /// Whether sessions attempt X25519 key agreement before becoming
    /// active. Both sides of a session must agree (§4.7 KeyAgreeing);
    /// a failed exchange falls back to an unencrypted transport rather
    /// than failing the session.
    pub attempt_key_agreement: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            candidate_groups: candidate_multicast_addresses(),
            preferred_ports: PREFERRED_PORTS.to_vec(),
            listen_interval: Duration::from_millis(120),
            appropriation_attempts: 2,
            backoff_max: Duration::from_millis(80),
            announce_interval: Duration::from_millis(600),
            handshake_timeout: Duration::from_millis(500),
            handshake_retry: 3,
            local_names: Vec::new(),
            local_surnames: Vec::new(),
            attempt_key_agreement: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_set_has_301_addresses_and_no_duplicates() {
        let addrs = candidate_multicast_addresses();
        assert_eq!(addrs.len(), 301);
        let mut sorted = addrs.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 301);
        assert_eq!(addrs[0], Ipv4Addr::new(239, 192, 1, 1));
        assert_eq!(addrs[254], Ipv4Addr::new(239, 192, 1, 255));
        assert_eq!(addrs[255], Ipv4Addr::new(239, 192, 2, 1));
    }
}
