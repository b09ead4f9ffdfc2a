use std::cmp;

/// In-progress assembly buffer for one piece.
///
/// Written ranges are kept as sorted, merged, half-open fragments so a block
/// delivered twice, or overlapping another, is only counted once.
#[derive(PartialEq, Debug, Clone)]
pub struct PieceBuffer {
    data: Vec<u8>,
    fragments: Vec<(usize, usize)>, // begin, end (exclusive)
}

impl PieceBuffer {
    pub fn new(length: usize) -> PieceBuffer {
        PieceBuffer {
            data: vec![0; length],
            fragments: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Copies as much of `bytes` as fits from `begin` on and returns how many
    /// bytes were taken.
    pub fn write(&mut self, begin: usize, bytes: &[u8]) -> usize {
        if begin >= self.data.len() || bytes.is_empty() {
            return 0;
        }
        let end = cmp::min(begin + bytes.len(), self.data.len());
        self.data[begin..end].copy_from_slice(&bytes[..end - begin]);
        self.add_fragment(begin, end);
        end - begin
    }

    fn add_fragment(&mut self, begin: usize, end: usize) {
        let idx = self.fragments.partition_point(|f| f.1 < begin);
        let mut merged = (begin, end);
        while idx < self.fragments.len() && self.fragments[idx].0 <= merged.1 {
            let f = self.fragments.remove(idx);
            merged = (cmp::min(merged.0, f.0), cmp::max(merged.1, f.1));
        }
        self.fragments.insert(idx, merged);
    }

    pub fn bytes_written(&self) -> usize {
        self.fragments.iter().map(|(b, e)| e - b).sum()
    }

    pub fn is_full(&self) -> bool {
        self.bytes_written() == self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_writes_fill_the_buffer() {
        let mut piece = PieceBuffer::new(30);
        assert_eq!(piece.write(20, &[3; 10]), 10);
        assert_eq!(piece.write(0, &[1; 10]), 10);
        assert!(!piece.is_full());
        assert_eq!(piece.write(10, &[2; 10]), 10);
        assert!(piece.is_full());
        assert_eq!(&piece.data()[9..11], &[1, 2]);
    }

    #[test]
    fn overlapping_writes_are_counted_once() {
        let mut piece = PieceBuffer::new(100);
        piece.write(0, &[0; 40]);
        piece.write(20, &[0; 40]);
        piece.write(0, &[0; 40]);
        assert_eq!(piece.bytes_written(), 60);
        piece.write(80, &[0; 10]);
        assert_eq!(piece.bytes_written(), 70);
        piece.write(55, &[0; 30]);
        assert_eq!(piece.bytes_written(), 90);
        assert!(!piece.is_full());
    }

    #[test]
    fn write_is_clamped_to_piece_end() {
        let mut piece = PieceBuffer::new(16);
        assert_eq!(piece.write(10, &[5; 20]), 6);
        assert_eq!(piece.write(16, &[5; 20]), 0);
        assert_eq!(piece.bytes_written(), 6);
    }
}
