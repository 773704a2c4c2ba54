//! Fixed-size bitmap over chunk indices
//!
//! Backs the dirty tracker, the claimed-chunk set of the in-flight registry and
//! the copy-on-write bitmap of the iteration engine.

const WORD_BITS: u64 = 64;

/// A fixed-length bitmap of `len` bits
#[derive(Debug, Clone, Default)]
pub struct Bitmap {
    words: Vec<u64>,
    len: u64,
    ones: u64,
}

impl Bitmap {
    /// Create a bitmap with `len` cleared bits
    pub fn new(len: u64) -> Self {
        let words = len.div_ceil(WORD_BITS) as usize;
        Self {
            words: vec![0; words],
            len,
            ones: 0,
        }
    }

    /// Number of bits
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the bitmap has zero bits
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits
    pub fn count_ones(&self) -> u64 {
        self.ones
    }

    /// Test a single bit; out-of-range bits read as clear
    pub fn get(&self, bit: u64) -> bool {
        if bit >= self.len {
            return false;
        }
        self.words[(bit / WORD_BITS) as usize] & (1 << (bit % WORD_BITS)) != 0
    }

    /// Set `count` bits starting at `start`, clipped to the bitmap length
    pub fn set_range(&mut self, start: u64, count: u64) {
        let end = start.saturating_add(count).min(self.len);
        for bit in start..end {
            let word = &mut self.words[(bit / WORD_BITS) as usize];
            let mask = 1 << (bit % WORD_BITS);
            if *word & mask == 0 {
                *word |= mask;
                self.ones += 1;
            }
        }
    }

    /// Clear `count` bits starting at `start`, clipped to the bitmap length
    pub fn clear_range(&mut self, start: u64, count: u64) {
        let end = start.saturating_add(count).min(self.len);
        for bit in start..end {
            let word = &mut self.words[(bit / WORD_BITS) as usize];
            let mask = 1 << (bit % WORD_BITS);
            if *word & mask != 0 {
                *word &= !mask;
                self.ones -= 1;
            }
        }
    }

    /// Index of the first set bit in `[start, end)`
    pub fn next_set(&self, start: u64, end: u64) -> Option<u64> {
        let end = end.min(self.len);
        let mut bit = start;
        while bit < end {
            let word = self.words[(bit / WORD_BITS) as usize] >> (bit % WORD_BITS);
            if word == 0 {
                // Skip to the next word boundary
                bit = (bit / WORD_BITS + 1) * WORD_BITS;
                continue;
            }
            let found = bit + u64::from(word.trailing_zeros());
            return (found < end).then_some(found);
        }
        None
    }

    /// Whether any bit in `[start, end)` is set
    pub fn any_in(&self, start: u64, end: u64) -> bool {
        self.next_set(start, end).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        let mut bitmap = Bitmap::new(130);
        bitmap.set_range(60, 10);
        assert_eq!(bitmap.count_ones(), 10);
        assert!(bitmap.get(60));
        assert!(bitmap.get(69));
        assert!(!bitmap.get(70));

        // Setting again does not double count
        bitmap.set_range(65, 10);
        assert_eq!(bitmap.count_ones(), 15);

        bitmap.clear_range(62, 3);
        assert_eq!(bitmap.count_ones(), 12);
        assert!(!bitmap.get(63));
    }

    #[test]
    fn test_next_set_across_words() {
        let mut bitmap = Bitmap::new(300);
        bitmap.set_range(200, 1);
        assert_eq!(bitmap.next_set(0, 300), Some(200));
        assert_eq!(bitmap.next_set(201, 300), None);
        assert_eq!(bitmap.next_set(0, 200), None);
        assert!(bitmap.any_in(150, 201));
    }

    #[test]
    fn test_ranges_are_clipped() {
        let mut bitmap = Bitmap::new(8);
        bitmap.set_range(6, 100);
        assert_eq!(bitmap.count_ones(), 2);
        assert!(!bitmap.get(8));
        bitmap.clear_range(0, u64::MAX);
        assert_eq!(bitmap.count_ones(), 0);
    }
}
