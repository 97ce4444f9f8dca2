//! Fixed-capacity bitset with bounds-checked access.

/// Index past the configured length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfRange;

/// Failure of a range claim or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Range extends past the configured length.
    OutOfRange,
    /// At least one bit was already in the requested state.
    Conflict,
}

/// Bitset of `len` bits stored in `WORDS` 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSet<const WORDS: usize> {
    words: [u32; WORDS],
    len: usize,
}

impl<const WORDS: usize> BitSet<WORDS> {
    /// Maximum number of bits any instance can hold.
    pub const CAPACITY: usize = WORDS * 32;

    /// Create an all-clear bitset of `len` bits. Returns `None` if `len` exceeds capacity.
    pub const fn new(len: usize) -> Option<Self> {
        if len > Self::CAPACITY {
            return None;
        }
        Some(Self {
            words: [0; WORDS],
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Result<bool, OutOfRange> {
        let (word, mask) = self.locate(index)?;
        Ok(self.words[word] & mask != 0)
    }

    /// Set a bit, returning its previous state.
    pub fn set(&mut self, index: usize) -> Result<bool, OutOfRange> {
        let (word, mask) = self.locate(index)?;
        let was = self.words[word] & mask != 0;
        self.words[word] |= mask;
        Ok(was)
    }

    /// Clear a bit, returning its previous state.
    pub fn clear(&mut self, index: usize) -> Result<bool, OutOfRange> {
        let (word, mask) = self.locate(index)?;
        let was = self.words[word] & mask != 0;
        self.words[word] &= !mask;
        Ok(was)
    }

    /// Set every bit in `first..=last`, failing without mutation if any is already set.
    pub fn claim_range(&mut self, first: usize, last: usize) -> Result<(), RangeError> {
        self.check_range(first, last, false)?;
        for index in first..=last {
            let (word, mask) = self.locate(index).map_err(|_| RangeError::OutOfRange)?;
            self.words[word] |= mask;
        }
        Ok(())
    }

    /// Clear every bit in `first..=last`, failing without mutation if any is already clear.
    pub fn release_range(&mut self, first: usize, last: usize) -> Result<(), RangeError> {
        self.check_range(first, last, true)?;
        for index in first..=last {
            let (word, mask) = self.locate(index).map_err(|_| RangeError::OutOfRange)?;
            self.words[word] &= !mask;
        }
        Ok(())
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True if no bit is set.
    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    fn check_range(&self, first: usize, last: usize, expect: bool) -> Result<(), RangeError> {
        if first > last || last >= self.len {
            return Err(RangeError::OutOfRange);
        }
        for index in first..=last {
            let bit = self.get(index).map_err(|_| RangeError::OutOfRange)?;
            if bit != expect {
                return Err(RangeError::Conflict);
            }
        }
        Ok(())
    }

    fn locate(&self, index: usize) -> Result<(usize, u32), OutOfRange> {
        if index >= self.len {
            return Err(OutOfRange);
        }
        Ok((index / 32, 1u32 << (index % 32)))
    }
}
