//! Hash maps and sets with randomized, DoS-resistant hashing.
//!
//! The address manager's whole purpose is to resist adversaries that control
//! many addresses, so even its auxiliary indexes use a keyed hasher seeded
//! from the injected random source rather than a predictable one.
use bitcoin_hashes::siphash24;
use std::hash::{BuildHasher, Hasher as _};

/// A `HashMap` keyed with a random `siphash24` state.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// A `HashSet` keyed with a random `siphash24` state.
pub type HashSet<K> = std::collections::HashSet<K, RandomState>;

/// Hasher using `siphash24`.
#[derive(Default)]
pub struct Hasher {
    data: Vec<u8>,
    key1: u64,
    key2: u64,
}

impl std::hash::Hasher for Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes)
    }

    fn finish(&self) -> u64 {
        siphash24::Hash::hash_with_keys(self.key1, self.key2, &self.data).as_u64()
    }
}

/// Random hasher state.
#[derive(Default, Clone)]
pub struct RandomState {
    key1: u64,
    key2: u64,
}

impl BuildHasher for RandomState {
    type Hasher = Hasher;

    fn build_hasher(&self) -> Self::Hasher {
        Hasher {
            data: Vec::new(),
            key1: self.key1,
            key2: self.key2,
        }
    }
}

impl From<&fastrand::Rng> for RandomState {
    fn from(rng: &fastrand::Rng) -> Self {
        Self {
            key1: rng.u64(..),
            key2: rng.u64(..),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hasher_is_keyed() {
        let rng = fastrand::Rng::with_seed(42);
        let a = RandomState::from(&rng);
        let b = RandomState::from(&rng);

        let mut ha = a.build_hasher();
        let mut hb = b.build_hasher();
        ha.write(b"peer");
        hb.write(b"peer");

        // Different key material yields different hashes.
        assert_ne!(ha.finish(), hb.finish());
    }
}
