//! Benchmark workloads: zero-padded decimal keys and the YCSB-style
//! operation mixes the command-line front-end drives.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{KeyBuf, KEY_SIZE};

/// The canonical key encoding: `n` as a zero-padded 16-byte decimal.
pub fn decimal_key(n: u64) -> KeyBuf {
    let mut key = [b'0'; KEY_SIZE];
    let digits = n.to_string();
    key[KEY_SIZE - digits.len()..].copy_from_slice(digits.as_bytes());
    key
}

/// Workload mixes. A: 50/50 update/get. B: 5/95. C: get only. L: insert
/// only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixKind {
    A,
    B,
    C,
    L,
}

/// One generated operation over a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Insert(KeyBuf),
    Update(KeyBuf),
    Search(KeyBuf),
}

/// Seeded generator of a workload mix over a uniform key range.
pub struct WorkloadGenerator {
    kind: MixKind,
    range: u64,
    rng: StdRng,
}

impl WorkloadGenerator {
    pub fn new(kind: MixKind, range: u64, seed: u64) -> WorkloadGenerator {
        WorkloadGenerator {
            kind,
            range: range.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next(&mut self) -> Operation {
        let key = decimal_key(self.rng.gen_range(0..self.range));
        let dice = self.rng.gen_range(0..100u32);
        match self.kind {
            MixKind::A => {
                if dice < 50 {
                    Operation::Update(key)
                } else {
                    Operation::Search(key)
                }
            }
            MixKind::B => {
                if dice < 5 {
                    Operation::Update(key)
                } else {
                    Operation::Search(key)
                }
            }
            MixKind::C => Operation::Search(key),
            MixKind::L => Operation::Insert(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_zero_padded_and_ordered() {
        assert_eq!(&decimal_key(1), b"0000000000000001");
        assert_eq!(&decimal_key(11), b"0000000000000011");
        assert_eq!(&decimal_key(12345678), b"0000000012345678");
        // byte order matches numeric order
        assert!(decimal_key(99) < decimal_key(100));
        assert!(decimal_key(100) < decimal_key(101));
    }

    #[test]
    fn load_mix_is_insert_only() {
        let mut gen = WorkloadGenerator::new(MixKind::L, 1000, 7);
        for _ in 0..100 {
            assert!(matches!(gen.next(), Operation::Insert(_)));
        }
    }

    #[test]
    fn read_mix_is_search_only() {
        let mut gen = WorkloadGenerator::new(MixKind::C, 1000, 7);
        for _ in 0..100 {
            assert!(matches!(gen.next(), Operation::Search(_)));
        }
    }

    #[test]
    fn mixed_workload_is_roughly_balanced() {
        let mut gen = WorkloadGenerator::new(MixKind::A, 1000, 7);
        let updates = (0..1000)
            .filter(|_| matches!(gen.next(), Operation::Update(_)))
            .count();
        assert!((300..700).contains(&updates));
    }
}
