//! Gather/scatter data arena.
//!
//! Gather probes need a table of in-range displacements to use as
//! indices, and scatter probes need writable memory to land in. The
//! arena provides both: two regions (32- and 64-bit index elements)
//! filled with pseudo-random values masked to stay inside the region.
//! Contents come from a fixed-seed PRNG so two runs see byte-identical
//! data and therefore identical cache behavior.

use crate::harness::MemAlign;
use crate::random::Random;

/// Fixed PRNG seed; the value itself is arbitrary but must never change.
const ARENA_SEED: u64 = 0xC0DE_5EED_0000_0001;

/// Index values stay below this, so with the largest element scale (8)
/// every access lands within the first half of a region.
const INDEX_LIMIT: u64 = 1024;

/// Region size in bytes. Largest possible access: index 1023, scale 8,
/// 64-byte element, +1 unaligned bias = 8257 bytes, comfortably inside.
const REGION_BYTES: usize = 16 * 1024;

pub struct Arena {
    region32: Vec<u32>,
    region64: Vec<u64>,
}

impl Arena {
    pub fn new() -> Arena {
        let mut rng = Random::new(ARENA_SEED);

        let region32 = (0..REGION_BYTES / 4)
            .map(|_| (u64::from(rng.next_u32()) % INDEX_LIMIT) as u32)
            .collect();
        let region64 = (0..REGION_BYTES / 8)
            .map(|_| rng.next_u64() % INDEX_LIMIT)
            .collect();

        Arena { region32, region64 }
    }

    /// Base address a probe should use for the given index size. The
    /// unaligned variant is biased by one byte, which misaligns every
    /// gathered/scattered element.
    pub fn base_ptr(&self, index_bits: u32, align: MemAlign) -> u64 {
        let base = match index_bits {
            32 => self.region32.as_ptr() as u64,
            64 => self.region64.as_ptr() as u64,
            _ => unreachable!("index elements are 32- or 64-bit"),
        };
        match align {
            MemAlign::Aligned => base,
            MemAlign::Unaligned => base + 1,
        }
    }

    #[cfg(test)]
    fn bytes32(&self) -> &[u32] {
        &self.region32
    }
}

impl Default for Arena {
    fn default() -> Arena {
        Arena::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contents_are_reproducible() {
        let a = Arena::new();
        let b = Arena::new();
        assert_eq!(a.bytes32(), b.bytes32());
        assert_eq!(a.region64, b.region64);
    }

    #[test]
    fn every_index_is_in_range() {
        let arena = Arena::new();
        assert!(arena.region32.iter().all(|v| u64::from(*v) < INDEX_LIMIT));
        assert!(arena.region64.iter().all(|v| *v < INDEX_LIMIT));
    }

    #[test]
    fn unaligned_base_is_biased_by_one() {
        let arena = Arena::new();
        let aligned = arena.base_ptr(32, MemAlign::Aligned);
        let unaligned = arena.base_ptr(32, MemAlign::Unaligned);
        assert_eq!(unaligned, aligned + 1);
    }
}
