//! Fixed-size bitmap.

const BITS_IN_WORD: usize = 32;

/// A fixed-size map of boolean bits.
///
/// Used for the disk's free-sector map and the physical frame map. The
/// serialized form is a sequence of little-endian 32-bit words, lowest bit
/// numbers in the lowest word, which is also the persisted free-map file
/// layout.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Bitmap {
    nbits: usize,
    words: Vec<u32>,
}

impl Bitmap {
    /// A bitmap of `nbits` bits, all clear.
    pub fn new(nbits: usize) -> Self {
        assert!(nbits > 0 && nbits % BITS_IN_WORD == 0);
        Self {
            nbits,
            words: vec![0; nbits / BITS_IN_WORD],
        }
    }

    /// Number of bits in the map.
    pub fn len(&self) -> usize {
        self.nbits
    }

    /// Whether every bit is clear.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Set bit `which`.
    pub fn mark(&mut self, which: usize) {
        assert!(which < self.nbits);
        self.words[which / BITS_IN_WORD] |= 1 << (which % BITS_IN_WORD);
    }

    /// Clear bit `which`.
    pub fn clear(&mut self, which: usize) {
        assert!(which < self.nbits);
        self.words[which / BITS_IN_WORD] &= !(1 << (which % BITS_IN_WORD));
    }

    /// Whether bit `which` is set.
    pub fn test(&self, which: usize) -> bool {
        assert!(which < self.nbits);
        self.words[which / BITS_IN_WORD] & (1 << (which % BITS_IN_WORD)) != 0
    }

    /// Find the lowest clear bit, mark it, and return its number.
    pub fn find(&mut self) -> Option<usize> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if *word != u32::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                return Some(i * BITS_IN_WORD + bit);
            }
        }
        None
    }

    /// Number of clear bits.
    pub fn count_clear(&self) -> usize {
        self.words.iter().map(|w| w.count_zeros() as usize).sum()
    }

    /// Serialized size in bytes.
    pub fn byte_len(&self) -> usize {
        self.words.len() * 4
    }

    /// Serialize to the persisted little-endian word layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Rebuild from the persisted layout. `bytes` must be exactly
    /// `nbits / 8` long.
    pub fn from_bytes(nbits: usize, bytes: &[u8]) -> Self {
        let mut map = Self::new(nbits);
        assert_eq!(bytes.len(), map.byte_len());
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            map.words[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        map
    }

    /// Print the numbers of the set bits.
    pub fn print(&self) {
        let set: Vec<String> = (0..self.nbits)
            .filter(|i| self.test(*i))
            .map(|i| i.to_string())
            .collect();
        mirage::println!("bitmap set bits: {}", set.join(" "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn find_marks_lowest_clear() {
        let mut map = Bitmap::new(64);
        assert_eq!(map.find(), Some(0));
        assert_eq!(map.find(), Some(1));
        map.clear(0);
        assert_eq!(map.find(), Some(0));
        assert_eq!(map.count_clear(), 62);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut map = Bitmap::new(32);
        for i in 0..32 {
            assert_eq!(map.find(), Some(i));
        }
        assert_eq!(map.find(), None);
        assert_eq!(map.count_clear(), 0);
    }

    proptest! {
        #[test]
        fn serialization_round_trips(marks in proptest::collection::vec(0usize..256, 0..64)) {
            let mut map = Bitmap::new(256);
            for m in marks {
                map.mark(m);
            }
            let restored = Bitmap::from_bytes(256, &map.to_bytes());
            prop_assert_eq!(restored, map);
        }
    }
}
