//! Concrete realization of the spec's abstract "authenticated key
//! agreement producing a shared secret; symmetric transform keyed by it"
//! contract (§4.7 KeyAgreeing). Non-goals explicitly disclaim a formal
//! security proof — this picks ordinary, widely used primitives:
//! X25519 for key agreement, HKDF-SHA256 to derive a transform key, and
//! XChaCha20-Poly1305 (already a teacher dependency) as the transform.

use crate::codec::Transform;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// The local user's long-term identity keypair, generated once at
/// process start (§3 User — "private key present only for the local
/// user"). Advertised in presence announcements and used by directory
/// dedup; distinct from the per-session ephemeral [`KeyAgreement`] keys.
pub struct Identity {
    pub private_key: StaticSecret,
    pub public_bytes: [u8; 32],
}

impl Identity {
    pub fn generate() -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_bytes = PublicKey::from(&private_key).to_bytes();
        Self { private_key, public_bytes }
    }
}

/// One side's half of an X25519 exchange: holds the ephemeral secret
/// until [`KeyAgreement::finish`] consumes it.
pub struct KeyAgreement {
    secret: EphemeralSecret,
    pub public_bytes: [u8; 32],
}

impl KeyAgreement {
    pub fn start() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_bytes = PublicKey::from(&secret).to_bytes();
        Self { secret, public_bytes }
    }

    /// Combine with the peer's public value and derive a 32-byte
    /// ChaCha20-Poly1305 key via HKDF-SHA256 over the raw X25519 secret.
    pub fn finish(self, peer_public_bytes: &[u8; 32]) -> [u8; 32] {
        let peer_public = PublicKey::from(*peer_public_bytes);
        let shared = self.secret.diffie_hellman(&peer_public);
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(b"ports-session-transform", &mut key)
            .expect("32 bytes is a valid HKDF output length");
        key
    }
}

/// AEAD transform keyed by the derived session secret. Nonces are built
/// from a random per-session salt plus a monotonically increasing
/// counter, matching the nonce construction the teacher crate uses for
/// its own ChaCha20-Poly1305 framing (salt prefix + sequence suffix).
pub struct ChaChaTransform {
    cipher: XChaCha20Poly1305,
    salt: [u8; 16],
    counter: std::sync::atomic::AtomicU64,
}

impl ChaChaTransform {
    pub fn new(key: [u8; 32]) -> Self {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        Self {
            cipher: XChaCha20Poly1305::new(&key.into()),
            salt,
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn nonce_for(&self, counter: u64) -> [u8; 24] {
        let mut nonce = [0u8; 24];
        nonce[..16].copy_from_slice(&self.salt);
        nonce[16..24].copy_from_slice(&counter.to_be_bytes());
        nonce
    }
}

impl Transform for ChaChaTransform {
    fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let counter = self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let nonce = self.nonce_for(counter);
        let ct = self
            .cipher
            .encrypt(&nonce.into(), Payload { msg: plaintext, aad: &[] })
            .expect("encryption with a valid key does not fail");
        let mut out = Vec::with_capacity(8 + ct.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&ct);
        out
    }

    fn open(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        if ciphertext.len() < 8 {
            return None;
        }
        let counter = u64::from_be_bytes(ciphertext[0..8].try_into().ok()?);
        let nonce = self.nonce_for(counter);
        self.cipher
            .decrypt(&nonce.into(), Payload { msg: &ciphertext[8..], aad: &[] })
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_agreement_converges_on_both_sides() {
        let a = KeyAgreement::start();
        let b = KeyAgreement::start();
        let a_pub = a.public_bytes;
        let b_pub = b.public_bytes;
        let key_a = a.finish(&b_pub);
        let key_b = b.finish(&a_pub);
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn transform_roundtrips_and_rejects_tampering() {
        let key = KeyAgreement::start().finish(&KeyAgreement::start().public_bytes);
        let t = ChaChaTransform::new(key);
        let msg = b"hello session";
        let sealed = t.seal(msg);
        assert_eq!(t.open(&sealed).unwrap(), msg);

        let mut tampered = sealed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(t.open(&tampered).is_none());
    }
}
