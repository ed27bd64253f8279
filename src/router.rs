//! The consistent-hash router (§4.3).
//!
//! The ring is a sorted set of `(hash_value, group_id)` virtual-node
//! entries. A `BTreeSet` gives us both the ordering and the tie-break the
//! spec asks for in one move: for equal `hash_value`, tuple ordering falls
//! back to lexicographic order on `group_id`, so no extra comparator is
//! needed. Reads (`owner`, `successors`) take a read lock; only
//! `add_group` takes the write lock, matching this codebase's existing
//! `parking_lot::RwLock`-guarded ring pattern.

use std::collections::BTreeSet;
use std::io::Cursor;

use parking_lot::RwLock;

pub type GroupId = String;

/// Default number of virtual nodes a group contributes to the ring.
pub const DEFAULT_MULTIPLIER: usize = 10;

#[derive(Debug)]
pub struct Router {
    ring: RwLock<BTreeSet<(u32, GroupId)>>,
    multiplier: usize,
}

impl Router {
    pub fn new(multiplier: usize) -> Self {
        Self {
            ring: RwLock::new(BTreeSet::new()),
            multiplier,
        }
    }

    fn virtual_hash(group: &str, index: usize) -> u32 {
        let token = format!("{group}{index}");
        murmur3_32(token.as_bytes())
    }

    /// Inserts `group`'s `M` virtual entries atomically with respect to
    /// other router operations. Returns `true` if `group` was newly added,
    /// `false` if it was already present (duplicate).
    pub fn add_group(&self, group: &str) -> bool {
        let mut ring = self.ring.write();
        if ring.iter().any(|(_, g)| g == group) {
            return false;
        }
        for i in 0..self.multiplier {
            let hash = Self::virtual_hash(group, i);
            ring.insert((hash, group.to_string()));
        }
        true
    }

    /// `true` iff all `M` of `group`'s virtual entries are present.
    pub fn node_exists(&self, group: &str) -> bool {
        let ring = self.ring.read();
        (0..self.multiplier).all(|i| {
            let hash = Self::virtual_hash(group, i);
            ring.contains(&(hash, group.to_string()))
        })
    }

    /// The group owning `key`: the smallest ring entry with
    /// `hash_value >= H(key)`, wrapping to the first entry if `H(key)`
    /// is past the last one. `None` if the ring is empty.
    pub fn owner(&self, key: &str) -> Option<GroupId> {
        let ring = self.ring.read();
        if ring.is_empty() {
            return None;
        }
        let hash = murmur3_32(key.as_bytes());
        // The sentinel group id "" sorts before any real group id at an
        // equal hash_value, so the lower-bound probe lands on the first
        // real entry rather than skipping past a tie.
        let probe = (hash, String::new());
        ring.range(probe..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, group)| group.clone())
    }

    /// The distinct groups that immediately follow any of `group`'s
    /// virtual entries on the ring (wrapping), excluding `group` itself.
    pub fn successors(&self, group: &str) -> std::collections::HashSet<GroupId> {
        let ring = self.ring.read();
        let mut out = std::collections::HashSet::new();
        for i in 0..self.multiplier {
            let hash = Self::virtual_hash(group, i);
            let entry = (hash, group.to_string());
            let next = ring
                .range((std::ops::Bound::Excluded(entry), std::ops::Bound::Unbounded))
                .next()
                .or_else(|| ring.iter().next());
            if let Some((_, next_group)) = next {
                if next_group != group {
                    out.insert(next_group.clone());
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }
}

/// 32-bit MurmurHash3 (x86_32 variant), unsigned, seed 0, matching the
/// hash the source's `mmh3.hash(..., signed=False)` produces.
fn murmur3_32(data: &[u8]) -> u32 {
    murmur3::murmur3_32(&mut Cursor::new(data), 0).expect("hashing an in-memory buffer never fails")
}
