/// Fixed-capacity bitset handing out small integer identifiers
///
/// A set bit marks an identifier as taken. [`BitsMap::get_zero_bit`] always
/// returns the lowest identifier that is currently free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitsMap {
    words: Vec<u64>,
    capacity: usize,
}

impl BitsMap {
    /// Creates a new map able to track `capacity` bits, all cleared
    pub fn new(capacity: usize) -> BitsMap {
        BitsMap {
            words: vec![0; (capacity + 63) / 64],
            capacity,
        }
    }

    /// Number of bits tracked by this map
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Marks `idx` as taken
    ///
    /// Returns `false` if `idx` is out of range.
    pub fn set_bit(&mut self, idx: usize) -> bool {
        if idx >= self.capacity {
            return false;
        }
        self.words[idx / 64] |= 1 << (idx % 64);
        true
    }

    /// Marks `idx` as free
    ///
    /// Returns `false` if `idx` is out of range.
    pub fn clear_bit(&mut self, idx: usize) -> bool {
        if idx >= self.capacity {
            return false;
        }
        self.words[idx / 64] &= !(1 << (idx % 64));
        true
    }

    /// Returns whether `idx` is taken, out of range bits read as cleared
    pub fn is_set(&self, idx: usize) -> bool {
        idx < self.capacity && self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Lowest cleared bit, or `None` if every bit in range is set
    pub fn get_zero_bit(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i * 64 + word.trailing_ones() as usize)
            .filter(|idx| *idx < self.capacity)
    }

    /// Clears every bit
    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::BitsMap;

    #[test]
    fn zero_bit_is_lowest_free() {
        let mut map = BitsMap::new(8);
        assert_eq!(map.get_zero_bit(), Some(0));
        map.set_bit(0);
        map.set_bit(1);
        map.set_bit(3);
        assert_eq!(map.get_zero_bit(), Some(2));
        map.set_bit(2);
        assert_eq!(map.get_zero_bit(), Some(4));
        map.clear_bit(1);
        assert_eq!(map.get_zero_bit(), Some(1));
    }

    #[test]
    fn full_map_has_no_zero_bit() {
        for capacity in [1, 63, 64, 65, 130] {
            let mut map = BitsMap::new(capacity);
            for idx in 0..capacity {
                assert!(map.set_bit(idx));
            }
            assert_eq!(map.get_zero_bit(), None, "capacity {}", capacity);
            assert!(!map.set_bit(capacity));
        }
        assert_eq!(BitsMap::new(0).get_zero_bit(), None);
    }

    #[test]
    fn set_then_clear_restores_state() {
        let mut map = BitsMap::new(100);
        map.set_bit(7);
        map.set_bit(70);
        let before = map.clone();
        map.set_bit(42);
        map.clear_bit(42);
        assert_eq!(map, before);
    }

    #[test]
    fn random_sequences_match_reference_model() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let capacity = rng.gen_range(1..200);
            let mut map = BitsMap::new(capacity);
            let mut model = vec![false; capacity];

            for _ in 0..500 {
                let idx = rng.gen_range(0..capacity);
                if rng.gen_bool(0.6) {
                    map.set_bit(idx);
                    model[idx] = true;
                } else {
                    map.clear_bit(idx);
                    model[idx] = false;
                }

                let expected = model.iter().position(|taken| !taken);
                assert_eq!(map.get_zero_bit(), expected);
                assert_eq!(map.is_set(idx), model[idx]);
            }
        }
    }
}
