use crate::segmenter::SegmentBitmap;

/// Piece-level completion tracking for downloads whose data arrives in
/// fixed pieces from a peer layer rather than as byte ranges.
pub trait PieceStorage: std::fmt::Debug {
    fn piece_length(&self) -> u64;
    fn total_length(&self) -> u64;
    fn piece_count(&self) -> usize;
    fn has_piece(&self, index: usize) -> bool;
    fn complete_piece(&mut self, index: usize);
    fn completed_length(&self) -> u64;
    fn download_finished(&self) -> bool;
}

/// [`PieceStorage`] over a completion bitmap.
#[derive(Debug, Clone)]
pub struct BitmapPieceStorage {
    have: SegmentBitmap,
    piece_length: u64,
    total_length: u64,
}

impl BitmapPieceStorage {
    pub fn new(total_length: u64, piece_length: u64) -> Self {
        let piece_length = piece_length.max(1);
        let count = total_length.div_ceil(piece_length) as usize;
        Self {
            have: SegmentBitmap::new(count),
            piece_length,
            total_length,
        }
    }

    fn piece_size(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        (start + self.piece_length).min(self.total_length) - start
    }
}

impl PieceStorage for BitmapPieceStorage {
    fn piece_length(&self) -> u64 {
        self.piece_length
    }

    fn total_length(&self) -> u64 {
        self.total_length
    }

    fn piece_count(&self) -> usize {
        self.total_length.div_ceil(self.piece_length) as usize
    }

    fn has_piece(&self, index: usize) -> bool {
        self.have.is_set(index)
    }

    fn complete_piece(&mut self, index: usize) {
        if index < self.piece_count() {
            self.have.set(index);
        }
    }

    fn completed_length(&self) -> u64 {
        (0..self.piece_count())
            .filter(|&i| self.have.is_set(i))
            .map(|i| self.piece_size(i))
            .sum()
    }

    fn download_finished(&self) -> bool {
        self.have.all_set(self.piece_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_pieces_and_short_tail() {
        let mut p = BitmapPieceStorage::new(1000, 256);
        assert_eq!(p.piece_count(), 4);
        p.complete_piece(3);
        assert_eq!(p.completed_length(), 232);
        p.complete_piece(99);
        assert!(!p.download_finished());
        for i in 0..3 {
            p.complete_piece(i);
        }
        assert!(p.download_finished());
        assert_eq!(p.completed_length(), 1000);
    }
}
