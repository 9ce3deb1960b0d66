//! CRC-32 framing: fragment a byte blob into fixed-size datagrams and
//! reassemble them in order. Grounded on the original `paquets.py`
//! (`charger_octets` / `decharger_octets`), restated as a typed Rust API.

use crate::config::{DATA_HEADER_LEN, DATA_PACKET_LEN, DATA_PAYLOAD_LEN, MAX_PACKET_COUNT};
use crate::error::PortsError;

/// Keyed symmetric transform applied independently to the header and to
/// each data packet. The abstract contract from the spec: "symmetric
/// transform keyed by [a shared secret]" — see [`crate::crypto`] for the
/// concrete ChaCha20-Poly1305 realization used once a session has agreed
/// on a key.
pub trait Transform {
    fn seal(&self, plaintext: &[u8]) -> Vec<u8>;
    fn open(&self, ciphertext: &[u8]) -> Option<Vec<u8>>;
}

fn crc32(bytes: &[u8]) -> [u8; 4] {
    crc32fast::hash(bytes).to_be_bytes()
}

/// Build the 16-byte header: packet_count(5) | last_packet_length(2) |
/// content_type(1) | extra(4) | crc(4).
fn build_header(packet_count: u64, last_packet_length: u16, content_type: u8, extra: [u8; 4]) -> [u8; DATA_HEADER_LEN] {
    let mut header = [0u8; DATA_HEADER_LEN];
    header[0..5].copy_from_slice(&packet_count.to_be_bytes()[3..8]);
    header[5..7].copy_from_slice(&last_packet_length.to_be_bytes());
    header[7] = content_type;
    header[8..12].copy_from_slice(&extra);
    let crc = crc32(&header[0..12]);
    header[12..16].copy_from_slice(&crc);
    header
}

/// Build one 1440-byte data packet: seq(5) | payload(1431) | crc(4).
fn build_packet(seq: u64, payload: &[u8; DATA_PAYLOAD_LEN]) -> [u8; DATA_PACKET_LEN] {
    let mut packet = [0u8; DATA_PACKET_LEN];
    packet[0..5].copy_from_slice(&seq.to_be_bytes()[3..8]);
    packet[5..5 + DATA_PAYLOAD_LEN].copy_from_slice(payload);
    let crc = crc32(&packet[0..DATA_PACKET_LEN - 4]);
    packet[DATA_PACKET_LEN - 4..].copy_from_slice(&crc);
    packet
}

/// Fragment `blob` into `[header, p0, p1, ..., p_{N-1}]`, optionally
/// sealing the header and each packet independently under `transform`.
pub fn encode(
    blob: &[u8],
    transform: Option<&dyn Transform>,
    content_type: u8,
    extra: [u8; 4],
) -> Vec<Vec<u8>> {
    let len = blob.len();
    let packet_count = (len + DATA_PAYLOAD_LEN - 1) / DATA_PAYLOAD_LEN;
    let last_len = (len % DATA_PAYLOAD_LEN) as u16;

    let mut padded = blob.to_vec();
    let padded_len = packet_count * DATA_PAYLOAD_LEN;
    padded.resize(padded_len, 0);

    let header = build_header(packet_count as u64, last_len, content_type, extra);
    let mut out = Vec::with_capacity(packet_count + 1);
    out.push(seal(&header, transform));

    for i in 0..packet_count {
        let mut payload = [0u8; DATA_PAYLOAD_LEN];
        payload.copy_from_slice(&padded[i * DATA_PAYLOAD_LEN..(i + 1) * DATA_PAYLOAD_LEN]);
        let packet = build_packet(i as u64, &payload);
        out.push(seal(&packet, transform));
    }
    out
}

fn seal(plain: &[u8], transform: Option<&dyn Transform>) -> Vec<u8> {
    match transform {
        Some(t) => t.seal(plain),
        None => plain.to_vec(),
    }
}

fn unseal(cipher: &[u8], transform: Option<&dyn Transform>) -> Option<Vec<u8>> {
    match transform {
        Some(t) => t.open(cipher),
        None => Some(cipher.to_vec()),
    }
}

/// Unseal and validate just the header, returning how many more
/// datagrams belong to this blob. Lets a streaming receiver learn the
/// count before the rest of the packets have arrived.
pub(crate) fn peek_packet_count(header_raw: &[u8], transform: Option<&dyn Transform>) -> Result<usize, PortsError> {
    let header = unseal(header_raw, transform).ok_or(PortsError::BadCrc)?;
    if header.len() != DATA_HEADER_LEN {
        return Err(PortsError::BadSize);
    }
    let crc = crc32(&header[0..12]);
    if header[12..16] != crc {
        return Err(PortsError::BadCrc);
    }
    let mut packet_count_bytes = [0u8; 8];
    packet_count_bytes[3..8].copy_from_slice(&header[0..5]);
    let packet_count = u64::from_be_bytes(packet_count_bytes) as usize;
    if packet_count > MAX_PACKET_COUNT {
        return Err(PortsError::BadSize);
    }
    Ok(packet_count)
}

/// Reassemble a full blob from `[header, p0, p1, ...]` datagrams.
pub fn decode(datagrams: &[Vec<u8>], transform: Option<&dyn Transform>) -> Result<Vec<u8>, PortsError> {
    let header_raw = datagrams.first().ok_or(PortsError::BadSize)?;
    let header = unseal(header_raw, transform).ok_or(PortsError::BadCrc)?;
    if header.len() != DATA_HEADER_LEN {
        return Err(PortsError::BadSize);
    }
    let crc = crc32(&header[0..12]);
    if header[12..16] != crc {
        return Err(PortsError::BadCrc);
    }
    let mut packet_count_bytes = [0u8; 8];
    packet_count_bytes[3..8].copy_from_slice(&header[0..5]);
    let packet_count = u64::from_be_bytes(packet_count_bytes) as usize;
    if packet_count > MAX_PACKET_COUNT {
        return Err(PortsError::BadSize);
    }
    let last_len = u16::from_be_bytes([header[5], header[6]]) as usize;

    if datagrams.len() != packet_count + 1 {
        return Err(PortsError::BadSize);
    }

    let mut out = Vec::with_capacity(packet_count * DATA_PAYLOAD_LEN);
    for (i, raw) in datagrams[1..].iter().enumerate() {
        let packet = unseal(raw, transform).ok_or(PortsError::BadCrc)?;
        if packet.len() != DATA_PACKET_LEN {
            return Err(PortsError::BadSize);
        }
        let crc = crc32(&packet[0..DATA_PACKET_LEN - 4]);
        if packet[DATA_PACKET_LEN - 4..] != crc {
            return Err(PortsError::BadCrc);
        }
        let mut seq_bytes = [0u8; 8];
        seq_bytes[3..8].copy_from_slice(&packet[0..5]);
        let seq = u64::from_be_bytes(seq_bytes) as usize;
        if seq != i {
            return Err(PortsError::OutOfOrder);
        }
        out.extend_from_slice(&packet[5..5 + DATA_PAYLOAD_LEN]);
    }

    let final_len = if last_len > 0 {
        (packet_count - 1) * DATA_PAYLOAD_LEN + last_len
    } else {
        packet_count * DATA_PAYLOAD_LEN
    };
    out.truncate(final_len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(len: usize) {
        let blob: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        let datagrams = encode(&blob, None, 0, [0; 4]);
        let decoded = decode(&datagrams, None).expect("decode");
        assert_eq!(decoded, blob, "mismatch for len {len}");
    }

    #[test]
    fn roundtrip_various_sizes() {
        for len in [0, 1, 1430, 1431, 1432, 2862, 2863, 200_000] {
            roundtrip(len);
        }
    }

    #[test]
    fn s2_framing_scenario() {
        let len = 2 * 1431 + 1;
        let blob: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let datagrams = encode(&blob, None, 0, [0; 4]);
        assert_eq!(datagrams.len(), 4); // header + 3 packets
        let header = &datagrams[0];
        let mut pc_bytes = [0u8; 8];
        pc_bytes[3..8].copy_from_slice(&header[0..5]);
        assert_eq!(u64::from_be_bytes(pc_bytes), 3);
        assert_eq!(u16::from_be_bytes([header[5], header[6]]), 1);
        let decoded = decode(&datagrams, None).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn bit_flip_yields_bad_crc() {
        let blob = vec![7u8; 5000];
        let mut datagrams = encode(&blob, None, 0, [0; 4]);
        datagrams[1][0] ^= 0x01;
        assert!(matches!(decode(&datagrams, None), Err(PortsError::BadCrc)));
    }

    #[test]
    fn packet_swap_yields_out_of_order() {
        let blob = vec![9u8; 5000];
        let mut datagrams = encode(&blob, None, 0, [0; 4]);
        datagrams.swap(1, 2);
        assert!(matches!(decode(&datagrams, None), Err(PortsError::OutOfOrder)));
    }

    #[test]
    fn dropped_header_yields_bad_size() {
        let blob = vec![3u8; 5000];
        let datagrams = encode(&blob, None, 0, [0; 4]);
        let without_header = datagrams[1..].to_vec();
        assert!(matches!(decode(&without_header, None), Err(PortsError::BadSize)));
    }

    /// A header with a valid CRC but an absurd claimed packet count must
    /// be rejected before anyone downstream allocates on its say-so.
    #[test]
    fn oversized_packet_count_yields_bad_size() {
        let header = build_header((MAX_PACKET_COUNT as u64) + 1, 0, 0, [0; 4]);
        assert!(matches!(
            peek_packet_count(&header, None),
            Err(PortsError::BadSize)
        ));

        let datagrams = vec![header.to_vec()];
        assert!(matches!(decode(&datagrams, None), Err(PortsError::BadSize)));
    }
}
