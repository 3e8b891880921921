//! Hash/equality contexts.
//!
//! The map never picks a hash function itself; it takes a context that can
//! hash a key to 64 bits and compare two keys. The context must be
//! deterministic for the lifetime of the map and well-distributed — no
//! cryptographic properties required.

use std::hash::{BuildHasher, Hash, Hasher};

/// The hash/equality capability a map is parameterized by.
pub trait HashContext<K: ?Sized> {
    /// 64-bit hash of `key`. Must be stable for the lifetime of the map.
    fn hash(&self, key: &K) -> u64;

    /// Key equality, consistent with `hash`.
    fn eq(&self, a: &K, b: &K) -> bool;
}

/// SeaHash-backed context for any hashable key. Deterministic across runs,
/// which also makes perfect-hash index layouts reproducible.
#[derive(Clone, Copy, Debug, Default)]
pub struct SeaContext;

impl<K: Hash + Eq> HashContext<K> for SeaContext {
    #[inline]
    fn hash(&self, key: &K) -> u64 {
        let mut h = seahash::SeaHasher::new();
        key.hash(&mut h);
        h.finish()
    }

    #[inline]
    fn eq(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

/// aHash-backed context with per-instance random seeds. Prefer this when the
/// key set may be attacker-controlled; clones share the same seeds.
#[derive(Clone, Debug, Default)]
pub struct RandomContext {
    state: ahash::RandomState,
}

impl RandomContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed seeds, for reproducible layouts.
    pub fn with_seeds(k0: u64, k1: u64, k2: u64, k3: u64) -> Self {
        Self { state: ahash::RandomState::with_seeds(k0, k1, k2, k3) }
    }
}

impl<K: Hash + Eq> HashContext<K> for RandomContext {
    #[inline]
    fn hash(&self, key: &K) -> u64 {
        self.state.hash_one(key)
    }

    #[inline]
    fn eq(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

/// SeaHash over raw bytes, for keys that are byte strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesContext;

impl<K: AsRef<[u8]> + Eq> HashContext<K> for BytesContext {
    #[inline]
    fn hash(&self, key: &K) -> u64 {
        seahash::hash(key.as_ref())
    }

    #[inline]
    fn eq(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sea_context_is_deterministic() {
        let ctx = SeaContext;
        for i in 0u64..100 {
            assert_eq!(HashContext::<u64>::hash(&ctx, &i), HashContext::<u64>::hash(&ctx, &i));
        }
        assert_ne!(
            HashContext::<u64>::hash(&ctx, &1),
            HashContext::<u64>::hash(&ctx, &2)
        );
    }

    #[test]
    fn test_bytes_context_matches_seahash() {
        let ctx = BytesContext;
        let key = b"events/jakarta-2024".to_vec();
        assert_eq!(HashContext::hash(&ctx, &key), seahash::hash(&key));
    }

    #[test]
    fn test_random_context_seeds_are_reproducible() {
        let a = RandomContext::with_seeds(1, 2, 3, 4);
        let b = RandomContext::with_seeds(1, 2, 3, 4);
        for i in 0u64..100 {
            assert_eq!(HashContext::<u64>::hash(&a, &i), HashContext::<u64>::hash(&b, &i));
        }
    }
}
