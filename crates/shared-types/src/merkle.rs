//! # Merkle Roots
//!
//! Binary merkle over digests with canonical pairs: the left child has its
//! top bit cleared and the right child has it set before hashing, so a pair
//! cannot be reinterpreted with its children swapped. Odd levels duplicate
//! their last node.
//!
//! `IncrementalMerkle` keeps only the peaks of complete subtrees (the
//! mountain-range layout) and yields the same root as `merkle()` over every
//! appended leaf.
//!
//! ```text
//!   leaves: a b c            peaks: [ (1, ab), (0, c) ]
//!   merkle: root( ab , cc )  fold:  c -> cc -> root(ab, cc)
//! ```

use crate::primitives::Digest;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Above this many leaves the first level is hashed on the rayon pool.
pub const PARALLEL_THRESHOLD: usize = 256;

fn canonical_left(d: &Digest) -> Digest {
    let mut out = *d;
    out.0[0] &= 0x7f;
    out
}

fn canonical_right(d: &Digest) -> Digest {
    let mut out = *d;
    out.0[0] |= 0x80;
    out
}

/// Hash of a canonical (left, right) pair.
pub fn canonical_pair(left: &Digest, right: &Digest) -> Digest {
    Digest::hash_pair(&canonical_left(left), &canonical_right(right))
}

/// Merkle root of `ids`. Empty input yields the zero digest.
pub fn merkle(mut ids: Vec<Digest>) -> Digest {
    if ids.is_empty() {
        return Digest::ZERO;
    }
    while ids.len() > 1 {
        if ids.len() % 2 == 1 {
            let last = ids[ids.len() - 1];
            ids.push(last);
        }
        ids = if ids.len() >= PARALLEL_THRESHOLD {
            ids.par_chunks(2)
                .map(|p| canonical_pair(&p[0], &p[1]))
                .collect()
        } else {
            ids.chunks(2)
                .map(|p| canonical_pair(&p[0], &p[1]))
                .collect()
        };
    }
    ids[0]
}

/// Append-only merkle accumulator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalMerkle {
    node_count: u64,
    /// (level, root) of complete subtrees, highest level first.
    peaks: Vec<(u32, Digest)>,
}

impl IncrementalMerkle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    pub fn append(&mut self, digest: Digest) {
        self.node_count += 1;
        self.peaks.push((0, digest));
        while self.peaks.len() >= 2 {
            let (rl, right) = self.peaks[self.peaks.len() - 1];
            let (ll, left) = self.peaks[self.peaks.len() - 2];
            if rl != ll {
                break;
            }
            self.peaks.truncate(self.peaks.len() - 2);
            self.peaks.push((ll + 1, canonical_pair(&left, &right)));
        }
    }

    pub fn root(&self) -> Digest {
        let Some(&(mut level, mut carry)) = self.peaks.last() else {
            return Digest::ZERO;
        };
        let mut rest = self.peaks[..self.peaks.len() - 1].iter().rev().peekable();
        while let Some(&&(peak_level, peak)) = rest.peek() {
            if peak_level == level {
                carry = canonical_pair(&peak, &carry);
                rest.next();
            } else {
                carry = canonical_pair(&carry, &carry);
            }
            level += 1;
        }
        carry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Digest> {
        (0..n)
            .map(|i| Digest::hash_bytes(&(i as u64).to_le_bytes()))
            .collect()
    }

    #[test]
    fn test_empty_merkle_is_zero() {
        assert_eq!(merkle(vec![]), Digest::ZERO);
        assert_eq!(IncrementalMerkle::new().root(), Digest::ZERO);
    }

    #[test]
    fn test_single_leaf_is_root() {
        let l = leaves(1);
        assert_eq!(merkle(l.clone()), l[0]);
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let l = leaves(3);
        let expected = canonical_pair(
            &canonical_pair(&l[0], &l[1]),
            &canonical_pair(&l[2], &l[2]),
        );
        assert_eq!(merkle(l), expected);
    }

    #[test]
    fn test_incremental_matches_batch() {
        for n in [1usize, 2, 3, 5, 7, 8, 13, 300] {
            let l = leaves(n);
            let mut inc = IncrementalMerkle::new();
            for d in &l {
                inc.append(*d);
            }
            assert_eq!(inc.root(), merkle(l), "mismatch at {n} leaves");
            assert_eq!(inc.node_count(), n as u64);
        }
    }

    #[test]
    fn test_order_matters() {
        let mut l = leaves(4);
        let a = merkle(l.clone());
        l.swap(0, 1);
        assert_ne!(a, merkle(l));
    }
}
