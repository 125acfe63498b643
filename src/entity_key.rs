//! Stable keys for map entities, derived from the unique id the level designer gave them.
//!
//! Entity handles and indices change every time a map is loaded, but the authored id does not, so
//! every per-entity side table in the crate is keyed by a hash of that id instead.

use byteorder::{ByteOrder, LittleEndian};

/// Seed the engine uses when hashing unique entity ids.
const SEED: u32 = 0x97984357;

/// Hash of an entity's authored unique id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EntityKey(pub u32);

impl EntityKey {
    /// The key of an entity that has no authored id. Never stored in a table.
    pub const INVALID: EntityKey = EntityKey(u32::MAX);

    /// Hashes `identifier`, ignoring case.
    pub fn hash(identifier: &str) -> EntityKey {
        let lower = identifier.to_ascii_lowercase();
        EntityKey(murmur2(lower.as_bytes(), SEED))
    }

    /// Returns the key for an entity with the given id, or `INVALID` if it has none.
    pub fn from_identifier(identifier: Option<&str>) -> EntityKey {
        match identifier {
            Some(identifier) if !identifier.is_empty() => EntityKey::hash(identifier),
            _ => EntityKey::INVALID,
        }
    }

    pub fn is_valid(self) -> bool {
        self != EntityKey::INVALID
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// MurmurHash2, 32-bit.
fn murmur2(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    let mut hash = seed ^ data.len() as u32;

    let mut blocks = data.chunks_exact(4);

    for block in &mut blocks {
        let mut k = LittleEndian::read_u32(block);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        hash = hash.wrapping_mul(M);
        hash ^= k;
    }

    let tail = blocks.remainder();

    if tail.len() == 3 {
        hash ^= (tail[2] as u32) << 16;
    }

    if tail.len() >= 2 {
        hash ^= (tail[1] as u32) << 8;
    }

    if !tail.is_empty() {
        hash ^= tail[0] as u32;
        hash = hash.wrapping_mul(M);
    }

    hash ^= hash >> 13;
    hash = hash.wrapping_mul(M);
    hash ^ (hash >> 15)
}
