//! The 1470-byte multicast presence announcement: build, parse, CRC.
//!
//! Layout (exact offsets from the spec):
//! `names[200] | surnames[200] | key_len[2] | key[1024] | extra_info[40] | crc[4]`.

use crate::config::PRESENCE_PAYLOAD_LEN;
use std::net::Ipv4Addr;

const NAMES_OFF: usize = 0;
const NAMES_LEN: usize = 200;
const SURNAMES_OFF: usize = 200;
const SURNAMES_LEN: usize = 200;
const KEYLEN_OFF: usize = 400;
const KEY_OFF: usize = 402;
const KEY_MAX: usize = 1024;
const EXTRA_OFF: usize = 1426;
const EXTRA_LEN: usize = 40;
const CRC_OFF: usize = 1466;
const CRC_INPUT_LEN: usize = 1466;

/// A parsed presence announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresencePayload {
    pub names: String,
    pub surnames: String,
    pub public_key: Vec<u8>,
    pub announced: (Ipv4Addr, u16),
}

fn pack_padded(s: &str, len: usize) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.truncate(len);
    bytes.resize(len, 0);
    bytes
}

fn unpack_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Build the exact 1470-byte wire payload.
pub fn build(
    names: &str,
    surnames: &str,
    public_key: Option<&[u8]>,
    announced: (Ipv4Addr, u16),
) -> Vec<u8> {
    let mut buf = vec![0u8; PRESENCE_PAYLOAD_LEN];
    buf[NAMES_OFF..NAMES_OFF + NAMES_LEN].copy_from_slice(&pack_padded(names, NAMES_LEN));
    buf[SURNAMES_OFF..SURNAMES_OFF + SURNAMES_LEN].copy_from_slice(&pack_padded(surnames, SURNAMES_LEN));

    let key = public_key.unwrap_or(&[]);
    let key_len = key.len().min(KEY_MAX);
    buf[KEYLEN_OFF..KEYLEN_OFF + 2].copy_from_slice(&(key_len as u16).to_be_bytes());
    buf[KEY_OFF..KEY_OFF + key_len].copy_from_slice(&key[..key_len]);

    let (ip, port) = announced;
    buf[EXTRA_OFF..EXTRA_OFF + 4].copy_from_slice(&ip.octets());
    buf[EXTRA_OFF + 4..EXTRA_OFF + 6].copy_from_slice(&port.to_be_bytes());
    // bytes [6..40] of extra-info stay zero.

    let crc = crc32fast::hash(&buf[0..CRC_INPUT_LEN]).to_be_bytes();
    buf[CRC_OFF..CRC_OFF + 4].copy_from_slice(&crc);
    buf
}

/// Parse and CRC-validate a presence payload. Any deviation returns
/// `None` — wire corruption is a silent drop, not a propagated error.
pub fn parse(raw: &[u8]) -> Option<PresencePayload> {
    if raw.len() != PRESENCE_PAYLOAD_LEN {
        return None;
    }
    let expected_crc = crc32fast::hash(&raw[0..CRC_INPUT_LEN]).to_be_bytes();
    if raw[CRC_OFF..CRC_OFF + 4] != expected_crc {
        return None;
    }

    let names = unpack_padded(&raw[NAMES_OFF..NAMES_OFF + NAMES_LEN]);
    let surnames = unpack_padded(&raw[SURNAMES_OFF..SURNAMES_OFF + SURNAMES_LEN]);
    let key_len = u16::from_be_bytes([raw[KEYLEN_OFF], raw[KEYLEN_OFF + 1]]) as usize;
    if key_len > KEY_MAX {
        return None;
    }
    let public_key = raw[KEY_OFF..KEY_OFF + key_len].to_vec();

    let ip = Ipv4Addr::new(
        raw[EXTRA_OFF],
        raw[EXTRA_OFF + 1],
        raw[EXTRA_OFF + 2],
        raw[EXTRA_OFF + 3],
    );
    let port = u16::from_be_bytes([raw[EXTRA_OFF + 4], raw[EXTRA_OFF + 5]]);

    Some(PresencePayload {
        names,
        surnames,
        public_key,
        announced: (ip, port),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_of_build_roundtrips() {
        let key = vec![0xABu8; 300];
        let announced = (Ipv4Addr::new(192, 168, 1, 7), 54321);
        let raw = build("Jean Paul", "Dupont Martin", Some(&key), announced);
        assert_eq!(raw.len(), PRESENCE_PAYLOAD_LEN);
        let parsed = parse(&raw).expect("valid payload parses");
        assert_eq!(parsed.names, "Jean Paul");
        assert_eq!(parsed.surnames, "Dupont Martin");
        assert_eq!(parsed.public_key, key);
        assert_eq!(parsed.announced, announced);
    }

    #[test]
    fn no_key_roundtrips_to_empty_key() {
        let raw = build("A", "B", None, (Ipv4Addr::new(1, 2, 3, 4), 1));
        let parsed = parse(&raw).unwrap();
        assert!(parsed.public_key.is_empty());
    }

    #[test]
    fn oversized_names_are_truncated_not_rejected() {
        let long = "x".repeat(500);
        let raw = build(&long, "s", None, (Ipv4Addr::new(0, 0, 0, 0), 0));
        let parsed = parse(&raw).unwrap();
        assert_eq!(parsed.names.len(), 200);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let mut raw = build("a", "b", None, (Ipv4Addr::new(0, 0, 0, 0), 0));
        raw.pop();
        assert!(parse(&raw).is_none());
    }

    #[test]
    fn mutating_any_covered_byte_invalidates_crc() {
        let raw = build("a", "b", Some(b"key"), (Ipv4Addr::new(10, 0, 0, 1), 9999));
        for i in (0..CRC_INPUT_LEN).step_by(97) {
            let mut mutated = raw.clone();
            mutated[i] ^= 0xFF;
            assert!(parse(&mutated).is_none(), "byte {i} should invalidate CRC");
        }
    }
}
