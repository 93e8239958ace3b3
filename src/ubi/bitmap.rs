//! Fixed-capacity bitsets over PEB, LEB and volume indices.

use bitvec::vec::BitVec;

/// A bitset sized once at construction. Indices beyond the capacity read as clear and cannot be
/// set, rather than panicking.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Bitmap(BitVec);

impl Bitmap {
    /// A bitmap of `len` clear bits
    pub fn new(len: usize) -> Self {
        Self(BitVec::repeat(false, len))
    }

    /// A bitmap of `len` set bits
    pub fn full(len: usize) -> Self {
        Self(BitVec::repeat(true, len))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Is bit `index` set? Out-of-range bits are never set.
    pub fn test(&self, index: u32) -> bool {
        self.0.get(index as usize).map_or(false, |bit| *bit)
    }

    /// Store `value` in bit `index`, returning its previous value, or `None` if out of range
    pub fn replace(&mut self, index: u32, value: bool) -> Option<bool> {
        let index = index as usize;
        (index < self.0.len()).then(|| self.0.replace(index, value))
    }

    /// Set bit `index`; returns `false` if it is out of range
    pub fn set(&mut self, index: u32) -> bool {
        self.replace(index, true).is_some()
    }

    /// Clear bit `index`
    pub fn clear(&mut self, index: u32) {
        self.replace(index, false);
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        self.0.fill(false);
    }

    /// Set bit `index`, returning whether it was already set (out-of-range bits count as set,
    /// so that callers never act on them)
    pub fn test_and_set(&mut self, index: u32) -> bool {
        self.replace(index, true).unwrap_or(true)
    }

    /// Clear bit `index`, returning whether it was set
    pub fn test_and_clear(&mut self, index: u32) -> bool {
        self.replace(index, false).unwrap_or(false)
    }

    /// How many bits are set
    pub fn count(&self) -> usize {
        self.0.count_ones()
    }
}
