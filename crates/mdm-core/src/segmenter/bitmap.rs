//! Fixed-size bitmap over segment (or piece) indexes, LSB-first.

/// One bit per index; bit `i` lives in byte `i / 8` at position `i % 8`.
///
/// Serializes to/from raw bytes for control files. Only the first
/// `ceil(count/8)` bytes are significant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentBitmap {
    bytes: Vec<u8>,
}

impl SegmentBitmap {
    pub fn new(count: usize) -> Self {
        SegmentBitmap {
            bytes: vec![0u8; count.div_ceil(8)],
        }
    }

    /// Extra bytes are ignored; missing bytes read as 0.
    pub fn from_bytes(bytes: &[u8], count: usize) -> Self {
        let len = count.div_ceil(8);
        let mut b = vec![0u8; len];
        let copy = bytes.len().min(len);
        b[..copy].copy_from_slice(&bytes[..copy]);
        if count % 8 != 0 {
            if let Some(last) = b.last_mut() {
                *last &= (1u8 << (count % 8)) - 1;
            }
        }
        SegmentBitmap { bytes: b }
    }

    pub fn to_bytes(&self, count: usize) -> Vec<u8> {
        let len = count.div_ceil(8);
        self.bytes.get(..len).unwrap_or(&self.bytes).to_vec()
    }

    pub fn set(&mut self, index: usize) {
        let byte_idx = index / 8;
        if byte_idx >= self.bytes.len() {
            self.bytes.resize(byte_idx + 1, 0);
        }
        self.bytes[byte_idx] |= 1 << (index % 8);
    }

    pub fn clear(&mut self, index: usize) {
        if let Some(b) = self.bytes.get_mut(index / 8) {
            *b &= !(1 << (index % 8));
        }
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.bytes
            .get(index / 8)
            .map(|&b| (b & (1 << (index % 8))) != 0)
            .unwrap_or(false)
    }

    pub fn clear_all(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }

    /// Number of set bits among the first `count` indexes.
    pub fn count_set(&self, count: usize) -> usize {
        (0..count).filter(|&i| self.is_set(i)).count()
    }

    /// True if every index in `[0, count)` is set (vacuously true for 0).
    pub fn all_set(&self, count: usize) -> bool {
        let full_bytes = count / 8;
        if self.bytes.len() < count.div_ceil(8) {
            return false;
        }
        if self.bytes[..full_bytes].iter().any(|&b| b != 0xFF) {
            return false;
        }
        let rem = count % 8;
        rem == 0 || {
            let mask = (1u8 << rem) - 1;
            self.bytes[full_bytes] & mask == mask
        }
    }

    /// Lowest index in `[0, count)` clear in both `self` and `other`.
    pub fn first_clear_in_both(&self, other: &SegmentBitmap, count: usize) -> Option<usize> {
        (0..count).find(|&i| !self.is_set(i) && !other.is_set(i))
    }
}
