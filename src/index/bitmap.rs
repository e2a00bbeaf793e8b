//! `IndexBits`: a bitmap over linear-IDs (§3), plus a compressed storage
//! form used at rest in the attribute store (§4.B).

use bit_vec::BitVec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBits {
    bits: BitVec,
}

impl IndexBits {
    pub fn new(capacity: usize) -> IndexBits {
        IndexBits { bits: BitVec::from_elem(capacity, false) }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    fn ensure_capacity(&mut self, at_least: usize) {
        if self.bits.len() < at_least {
            self.bits.grow(at_least - self.bits.len(), false);
        }
    }

    pub fn set(&mut self, linear_id: u32) {
        self.ensure_capacity(linear_id as usize + 1);
        self.bits.set(linear_id as usize, true);
    }

    pub fn clear(&mut self, linear_id: u32) {
        if (linear_id as usize) < self.bits.len() {
            self.bits.set(linear_id as usize, false);
        }
    }

    pub fn get(&self, linear_id: u32) -> bool {
        self.bits.get(linear_id as usize).unwrap_or(false)
    }

    pub fn population(&self) -> u64 {
        self.bits.iter().filter(|&b| b).count() as u64
    }

    /// Yield the next set bit at or after `cursor`, per `linearIter` (§3).
    pub fn linear_iter(&self, cursor: u32) -> impl Iterator<Item = u32> + '_ {
        (cursor as usize..self.bits.len()).filter_map(move |i| self.bits.get(i).filter(|&b| b).map(|_| i as u32))
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.linear_iter(0)
    }

    fn binop(&mut self, other: &IndexBits, f: impl Fn(bool, bool) -> bool) {
        let n = self.bits.len().max(other.bits.len());
        self.ensure_capacity(n);
        for i in 0..n {
            let a = self.bits.get(i).unwrap_or(false);
            let b = other.bits.get(i).unwrap_or(false);
            self.bits.set(i, f(a, b));
        }
    }

    pub fn and(&mut self, other: &IndexBits) {
        self.binop(other, |a, b| a && b);
    }

    pub fn or(&mut self, other: &IndexBits) {
        self.binop(other, |a, b| a || b);
    }

    pub fn andnot(&mut self, other: &IndexBits) {
        self.binop(other, |a, b| a && !b);
    }

    pub fn not(&mut self) {
        self.bits.negate();
    }

    pub fn copy_from(&mut self, other: &IndexBits) {
        self.bits = other.bits.clone();
    }

    /// Run-length encode: alternating run lengths starting with a (possibly
    /// zero-length) run of unset bits. Compact for the sparse or bursty
    /// membership typical of behavioral segments.
    pub fn compress(&self) -> CompressedBits {
        let mut runs = Vec::new();
        let mut current = false;
        let mut run_len: u32 = 0;
        for i in 0..self.bits.len() {
            let bit = self.bits.get(i).unwrap_or(false);
            if bit == current {
                run_len += 1;
            } else {
                runs.push(run_len);
                current = bit;
                run_len = 1;
            }
        }
        runs.push(run_len);
        CompressedBits { len: self.bits.len(), runs }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBits {
    len: usize,
    runs: Vec<u32>,
}

impl CompressedBits {
    pub fn decompress(&self) -> IndexBits {
        let mut bits = IndexBits::new(self.len);
        let mut idx = 0usize;
        let mut value = false;
        for &run in &self.runs {
            if value {
                for i in idx..idx + run as usize {
                    bits.bits.set(i, true);
                }
            }
            idx += run as usize;
            value = !value;
        }
        bits
    }

    pub fn byte_size(&self) -> usize {
        self.runs.len() * std::mem::size_of::<u32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits_from(ids: &[u32], capacity: usize) -> IndexBits {
        let mut b = IndexBits::new(capacity);
        for &id in ids {
            b.set(id);
        }
        b
    }

    #[test]
    fn population_matches_iter_count() {
        let b = bits_from(&[1, 3, 5, 100], 200);
        assert_eq!(b.population(), 4);
        assert_eq!(b.iter().count(), 4);
    }

    #[test]
    fn compress_round_trip() {
        let b = bits_from(&[1, 3, 5, 100], 200);
        let decompressed = b.compress().decompress();
        assert_eq!(b, decompressed);
    }

    #[test]
    fn segment_math_population_identity() {
        // population(A & B) + population(A | B) == population(A) + population(B)
        let a = bits_from(&[1, 2, 3, 4], 10);
        let b = bits_from(&[3, 4, 5, 6, 7, 8], 10);
        let mut and = a.clone();
        and.and(&b);
        let mut or = a.clone();
        or.or(&b);
        assert_eq!(and.population() + or.population(), a.population() + b.population());
    }

    #[test]
    fn andnot_removes_members_of_other() {
        let a = bits_from(&[1, 2, 3], 10);
        let b = bits_from(&[2], 10);
        let mut result = a.clone();
        result.andnot(&b);
        assert_eq!(result.iter().collect::<Vec<_>>(), vec![1, 3]);
    }
}
