use anyhow::{bail, Result};

/// One bit per piece, MSB first: piece 0 is the high bit of byte 0.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Bitfield {
    bytes: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    pub fn new(num_pieces: usize) -> Self {
        Bitfield {
            bytes: vec![0; byte_len(num_pieces)],
            num_pieces,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, num_pieces: usize) -> Result<Self> {
        if bytes.len() != byte_len(num_pieces) {
            bail!(
                "bitfield is {} bytes long, expected {} bytes for {} pieces",
                bytes.len(),
                byte_len(num_pieces),
                num_pieces
            );
        }
        let bitfield = Bitfield { bytes, num_pieces };
        if bitfield.spare_bits() != 0 {
            bail!("bitfield has bits set past piece {}", num_pieces.saturating_sub(1));
        }
        Ok(bitfield)
    }

    // bits of the last byte that map to no piece
    fn spare_bits(&self) -> u8 {
        let used_bits = self.num_pieces % 8;
        match self.bytes.last() {
            Some(last) if used_bits != 0 => last & (0xff >> used_bits),
            _ => 0,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn has(&self, piece_idx: usize) -> bool {
        if piece_idx >= self.num_pieces {
            return false;
        }
        self.bytes[piece_idx / 8] & (0b10000000 >> (piece_idx % 8)) != 0
    }

    pub fn set(&mut self, piece_idx: usize) {
        if piece_idx < self.num_pieces {
            self.bytes[piece_idx / 8] |= 0b10000000 >> (piece_idx % 8);
        }
    }

    pub fn count(&self) -> usize {
        (0..self.num_pieces).filter(|i| self.has(*i)).count()
    }

    // the low-order bits of the last byte map to no piece and are considered set
    pub fn is_complete(&self) -> bool {
        let Some((last, full)) = self.bytes.split_last() else {
            return true;
        };
        if full.iter().any(|b| *b != 0xff) {
            return false;
        }
        let used_bits = self.num_pieces - full.len() * 8;
        let padding = 0xffu8.checked_shr(used_bits as u32).unwrap_or(0);
        last | padding == 0xff
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_pieces).filter(|i| self.has(*i))
    }
}

pub fn byte_len(num_pieces: usize) -> usize {
    num_pieces.div_ceil(8)
}
