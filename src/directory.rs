//! Bounded peer directory: the set of recently observed presence
//! announcements, deduplicated by public key or by endpoint (§4.4).

use crate::presence::PresencePayload;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub raw: Vec<u8>,
    pub parsed: PresencePayload,
    pub last_seen: Instant,
}

/// A read-only view of one directory entry, safe to hand to a consumer.
#[derive(Debug, Clone)]
pub struct DirectoryEntrySnapshot {
    pub index: usize,
    pub names: String,
    pub surnames: String,
    pub endpoint: (Ipv4Addr, u16),
    pub public_key_len: usize,
    pub last_seen_age: std::time::Duration,
}

/// Fixed-capacity slot table. Capacity equals the number of candidate
/// multicast groups, matching the source's "one entry per group" sizing.
pub struct Directory {
    slots: Mutex<Vec<Option<DirectoryEntry>>>,
}

impl Directory {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    /// Insert or update an entry per the dedup rule in §4.4. Returns the
    /// slot index used.
    pub fn upsert(&self, raw: Vec<u8>, parsed: PresencePayload) -> usize {
        let mut slots = self.slots.lock();
        let now = Instant::now();

        if !parsed.public_key.is_empty() {
            if let Some(idx) = slots.iter().position(|e| {
                e.as_ref()
                    .map(|e| !e.parsed.public_key.is_empty() && e.parsed.public_key == parsed.public_key)
                    .unwrap_or(false)
            }) {
                slots[idx] = Some(DirectoryEntry { raw, parsed, last_seen: now });
                return idx;
            }
        } else if let Some(idx) = slots.iter().position(|e| {
            e.as_ref().map(|e| e.parsed.announced == parsed.announced).unwrap_or(false)
        }) {
            slots[idx] = Some(DirectoryEntry { raw, parsed, last_seen: now });
            return idx;
        }

        if let Some(idx) = slots.iter().position(|e| e.is_none()) {
            slots[idx] = Some(DirectoryEntry { raw, parsed, last_seen: now });
            return idx;
        }

        let oldest_idx = slots
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.as_ref().map(|e| e.last_seen).unwrap_or(now))
            .map(|(i, _)| i)
            .expect("capacity > 0");
        slots[oldest_idx] = Some(DirectoryEntry { raw, parsed, last_seen: now });
        oldest_idx
    }

    pub fn get(&self, index: usize) -> Option<DirectoryEntry> {
        self.slots.lock().get(index).and_then(|e| e.clone())
    }

    /// Atomic snapshot for external readers (§5 Shared-resource policy).
    pub fn snapshot(&self) -> Vec<DirectoryEntrySnapshot> {
        let now = Instant::now();
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(index, e)| {
                e.as_ref().map(|entry| DirectoryEntrySnapshot {
                    index,
                    names: entry.parsed.names.clone(),
                    surnames: entry.parsed.surnames.clone(),
                    endpoint: entry.parsed.announced,
                    public_key_len: entry.parsed.public_key.len(),
                    last_seen_age: now.saturating_duration_since(entry.last_seen),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence;

    fn payload(names: &str, key: Option<&[u8]>, endpoint: (Ipv4Addr, u16)) -> (Vec<u8>, PresencePayload) {
        let raw = presence::build(names, "s", key, endpoint);
        let parsed = presence::parse(&raw).unwrap();
        (raw, parsed)
    }

    #[test]
    fn same_public_key_different_endpoint_shares_one_slot() {
        let dir = Directory::new(4);
        let (r1, p1) = payload("a", Some(b"key"), (Ipv4Addr::new(1, 1, 1, 1), 1));
        let (r2, p2) = payload("a", Some(b"key"), (Ipv4Addr::new(2, 2, 2, 2), 2));
        let i1 = dir.upsert(r1, p1);
        let i2 = dir.upsert(r2, p2);
        assert_eq!(i1, i2);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get(i1).unwrap().parsed.announced, (Ipv4Addr::new(2, 2, 2, 2), 2));
    }

    #[test]
    fn no_public_key_different_endpoints_take_two_slots() {
        let dir = Directory::new(4);
        let (r1, p1) = payload("a", None, (Ipv4Addr::new(1, 1, 1, 1), 1));
        let (r2, p2) = payload("b", None, (Ipv4Addr::new(2, 2, 2, 2), 2));
        dir.upsert(r1, p1);
        dir.upsert(r2, p2);
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn full_directory_evicts_oldest() {
        let dir = Directory::new(2);
        let (r1, p1) = payload("a", None, (Ipv4Addr::new(1, 1, 1, 1), 1));
        let (r2, p2) = payload("b", None, (Ipv4Addr::new(2, 2, 2, 2), 2));
        dir.upsert(r1, p1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        dir.upsert(r2, p2);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let (r3, p3) = payload("c", None, (Ipv4Addr::new(3, 3, 3, 3), 3));
        dir.upsert(r3, p3);
        assert_eq!(dir.len(), 2);
        let snap = dir.snapshot();
        assert!(snap.iter().any(|e| e.endpoint == (Ipv4Addr::new(2, 2, 2, 2), 2)));
        assert!(snap.iter().any(|e| e.endpoint == (Ipv4Addr::new(3, 3, 3, 3), 3)));
    }
}
