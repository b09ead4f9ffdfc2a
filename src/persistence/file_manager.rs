use std::cmp;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use sha1::{Digest, Sha1};
use size::Size;

use crate::bitfield::Bitfield;
use crate::metadata::metainfo::Metainfo;
use crate::persistence::piece::PieceBuffer;

/// Turns delivered blocks into verified pieces of a single backing file and
/// serves read-back of verified data. Every operation holds one lock for its
/// whole duration, so completion, hash check and disk write of a piece are
/// atomic with respect to other calls.
pub struct FileManager {
    file_path: PathBuf,
    piece_length: u64,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    inner: Mutex<Inner>,
}

struct Inner {
    file: Option<File>,
    bitfield: Bitfield,
    buffers: HashMap<u32, PieceBuffer>,
    verified: Vec<u32>,  // verified since the last drain, to announce with have
    corrupted: Vec<u32>, // failed the hash check since the last drain, to schedule again
    downloaded: u64,
    uploaded: u64,
}

impl FileManager {
    pub fn new(
        file_path: &Path,
        piece_length: u64,
        total_length: u64,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self> {
        if piece_length == 0 || total_length.div_ceil(piece_length) != piece_hashes.len() as u64 {
            bail!(
                "{} piece hashes do not describe {total_length} bytes in pieces of {piece_length} bytes",
                piece_hashes.len()
            );
        }
        if let Some(dir) = file_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(file_path)?;
        file.set_len(total_length)?;
        log::info!(
            "opened {} ({}) for {} pieces",
            file_path.display(),
            Size::from_bytes(total_length),
            piece_hashes.len()
        );
        Ok(FileManager {
            file_path: file_path.to_path_buf(),
            piece_length,
            total_length,
            inner: Mutex::new(Inner {
                file: Some(file),
                bitfield: Bitfield::new(piece_hashes.len()),
                buffers: HashMap::new(),
                verified: Vec::new(),
                corrupted: Vec::new(),
                downloaded: 0,
                uploaded: 0,
            }),
            piece_hashes,
        })
    }

    pub fn from_metainfo(base_path: &Path, metainfo: &Metainfo) -> Result<Self> {
        FileManager::new(
            &base_path.join(metainfo.name()),
            metainfo.piece_length(),
            metainfo.total_length(),
            metainfo.piece_hashes().clone(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of the piece, the last one may be shorter.
    pub fn piece_len(&self, piece_idx: u32) -> u64 {
        let begin = piece_idx as u64 * self.piece_length;
        cmp::min(self.piece_length, self.total_length.saturating_sub(begin))
    }

    /// Places `data` at `begin` in piece `piece_idx`. Whatever runs past the
    /// end of the piece continues at the head of the next one.
    pub fn submit_block(&self, piece_idx: u32, begin: u32, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let mut offset = piece_idx as u64 * self.piece_length + begin as u64;
        let mut remaining = data;
        while !remaining.is_empty() {
            if offset >= self.total_length {
                log::debug!(
                    "dropping {} bytes delivered past the end of the file",
                    remaining.len()
                );
                break;
            }
            let idx = (offset / self.piece_length) as u32;
            let offset_in_piece = (offset % self.piece_length) as usize;
            let piece_len = self.piece_len(idx) as usize;
            let taken = cmp::min(remaining.len(), piece_len - offset_in_piece);

            if inner.bitfield.has(idx as usize) {
                log::trace!("piece {idx} already verified, block discarded");
            } else {
                let piece = inner
                    .buffers
                    .entry(idx)
                    .or_insert_with(|| PieceBuffer::new(piece_len));
                piece.write(offset_in_piece, &remaining[..taken]);
                if piece.is_full() {
                    self.complete_piece(&mut inner, idx)?;
                }
            }

            offset += taken as u64;
            remaining = &remaining[taken..];
        }
        Ok(())
    }

    fn complete_piece(&self, inner: &mut Inner, piece_idx: u32) -> Result<()> {
        let Some(piece) = inner.buffers.remove(&piece_idx) else {
            return Ok(());
        };
        if Sha1::digest(piece.data()).as_slice() != self.piece_hashes[piece_idx as usize] {
            log::warn!("piece {piece_idx} failed the hash check, it will be downloaded again");
            inner.corrupted.push(piece_idx);
            return Ok(());
        }
        let offset = piece_idx as u64 * self.piece_length;
        if let Err(e) = write_at(inner.file.as_mut(), offset, piece.data()) {
            // the buffer is gone, the piece has to be fetched again
            inner.corrupted.push(piece_idx);
            return Err(e.context(format!("cannot write piece {piece_idx}")));
        }
        inner.bitfield.set(piece_idx as usize);
        inner.verified.push(piece_idx);
        inner.downloaded += piece.len() as u64;
        log::debug!("piece {piece_idx} verified and written");
        Ok(())
    }

    /// Returns the requested range only when every piece it spans is verified.
    pub fn fill_request(&self, piece_idx: u32, begin: u32, len: u32) -> Result<Option<Vec<u8>>> {
        let mut inner = self.lock();
        let start = piece_idx as u64 * self.piece_length + begin as u64;
        let end = start + len as u64;
        if len == 0 || end > self.total_length {
            return Ok(None);
        }
        let first = start / self.piece_length;
        let last = (end - 1) / self.piece_length;
        if !(first..=last).all(|i| inner.bitfield.has(i as usize)) {
            return Ok(None);
        }
        let Some(file) = inner.file.as_mut() else {
            return Ok(None);
        };
        let mut data = vec![0; len as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut data)?;
        inner.uploaded += len as u64;
        Ok(Some(data))
    }

    pub fn has_piece(&self, piece_idx: u32) -> bool {
        self.lock().bitfield.has(piece_idx as usize)
    }

    pub fn is_complete(&self) -> bool {
        self.lock().bitfield.is_complete()
    }

    pub fn bitfield(&self) -> Bitfield {
        self.lock().bitfield.clone()
    }

    /// Pieces verified since the previous call.
    pub fn take_verified(&self) -> Vec<u32> {
        std::mem::take(&mut self.lock().verified)
    }

    /// Pieces that failed the hash check since the previous call.
    pub fn take_corrupted(&self) -> Vec<u32> {
        std::mem::take(&mut self.lock().corrupted)
    }

    pub fn discard_partial(&self, piece_idx: u32) {
        if self.lock().buffers.remove(&piece_idx).is_some() {
            log::debug!("discarded partial data of piece {piece_idx}");
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.lock().downloaded
    }

    pub fn uploaded(&self) -> u64 {
        self.lock().uploaded
    }

    pub fn bytes_left(&self) -> u64 {
        let inner = self.lock();
        inner
            .bitfield
            .iter_set()
            .fold(self.total_length, |left, i| {
                left - self.piece_len(i as u32)
            })
    }

    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        if let Some(file) = inner.file.take() {
            file.sync_all()?;
            log::debug!("closed {}", self.file_path.display());
        }
        inner.buffers.clear();
        Ok(())
    }
}

fn write_at(file: Option<&mut File>, offset: u64, data: &[u8]) -> Result<()> {
    let Some(file) = file else {
        bail!("storage already closed");
    };
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use rand::Rng;

    pub fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "tatorrent-{name}-{}",
            rand::rng().random::<u64>()
        ))
    }

    pub fn hash(data: &[u8]) -> [u8; 20] {
        let mut h = [0; 20];
        h.copy_from_slice(&Sha1::digest(data));
        h
    }

    // file content where every byte is derived from its offset
    pub fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    pub fn file_manager_for(name: &str, content: &[u8], piece_length: usize) -> FileManager {
        let hashes = content.chunks(piece_length).map(hash).collect();
        FileManager::new(
            &temp_path(name),
            piece_length as u64,
            content.len() as u64,
            hashes,
        )
        .unwrap()
    }

    pub fn on_disk(fm: &FileManager) -> Vec<u8> {
        fs::read(&fm.file_path).unwrap()
    }

    #[test]
    fn correct_piece_is_written_and_announced() {
        let content = content(40);
        let fm = file_manager_for("correct", &content, 16);
        fm.submit_block(1, 0, &content[16..32]).unwrap();
        assert!(fm.has_piece(1));
        assert!(!fm.has_piece(0));
        assert_eq!(&on_disk(&fm)[16..32], &content[16..32]);
        assert_eq!(fm.take_verified(), vec![1]);
        assert_eq!(fm.take_verified(), Vec::<u32>::new());
        assert_eq!(fm.downloaded(), 16);
        assert_eq!(fm.bytes_left(), 24);
    }

    #[test]
    fn corrupted_piece_is_dropped_and_signalled() {
        let content = content(64);
        let fm = file_manager_for("corrupt", &content, 32);
        let mut bad = content[32..64].to_vec();
        bad[10] ^= 0xff;
        fm.submit_block(1, 0, &bad[..16]).unwrap();
        fm.submit_block(1, 16, &bad[16..]).unwrap();
        assert!(!fm.has_piece(1));
        assert_eq!(fm.take_corrupted(), vec![1]);
        assert!(fm.take_verified().is_empty());

        // the buffer is gone, a fresh delivery starts from scratch
        fm.submit_block(1, 0, &content[32..48]).unwrap();
        assert!(!fm.has_piece(1));
        fm.submit_block(1, 16, &content[48..64]).unwrap();
        assert!(fm.has_piece(1));
        assert_eq!(&on_disk(&fm)[32..64], &content[32..64]);
    }

    #[test]
    fn block_for_verified_piece_is_a_no_op() {
        let content = content(32);
        let fm = file_manager_for("twice", &content, 16);
        fm.submit_block(0, 0, &content[..16]).unwrap();
        assert_eq!(fm.take_verified(), vec![0]);
        fm.submit_block(0, 0, &[0; 16]).unwrap();
        assert!(fm.lock().buffers.is_empty());
        assert!(fm.take_verified().is_empty());
        assert!(fm.take_corrupted().is_empty());
        assert_eq!(&on_disk(&fm)[..16], &content[..16]);
    }

    #[test]
    fn block_straddling_a_boundary_is_split() {
        let piece_length = 32768;
        let content = content(piece_length * 2);
        let fm = file_manager_for("straddle", &content, piece_length);
        let begin = piece_length - 15384;
        fm.submit_block(0, begin as u32, &content[begin..begin + 16384])
            .unwrap();
        {
            let inner = fm.lock();
            assert_eq!(inner.buffers[&0].bytes_written(), 15384);
            assert_eq!(inner.buffers[&1].bytes_written(), 1000);
            assert_eq!(
                &inner.buffers[&0].data()[begin..],
                &content[begin..piece_length]
            );
            assert_eq!(
                &inner.buffers[&1].data()[..1000],
                &content[piece_length..piece_length + 1000]
            );
        }
        fm.submit_block(0, 0, &content[..begin]).unwrap();
        fm.submit_block(1, 1000, &content[piece_length + 1000..])
            .unwrap();
        assert!(fm.is_complete());
        assert_eq!(on_disk(&fm), content);
    }

    #[test]
    fn whole_file_in_one_misaligned_delivery() {
        let content = content(50);
        let fm = file_manager_for("full", &content, 16);
        fm.submit_block(0, 3, &content[3..]).unwrap();
        assert_eq!(fm.take_verified(), vec![1, 2, 3]);
        fm.submit_block(0, 0, &content[..3]).unwrap();
        assert!(fm.is_complete());
        assert_eq!(fm.bytes_left(), 0);
        assert_eq!(on_disk(&fm), content);
    }

    #[test]
    fn fill_request_needs_every_spanned_piece() {
        let content = content(48);
        let fm = file_manager_for("fill", &content, 16);
        fm.submit_block(0, 0, &content[..16]).unwrap();
        assert_eq!(fm.fill_request(0, 4, 8).unwrap(), Some(content[4..12].to_vec()));
        assert_eq!(fm.fill_request(0, 8, 16).unwrap(), None);
        fm.submit_block(1, 0, &content[16..32]).unwrap();
        assert_eq!(fm.fill_request(0, 8, 16).unwrap(), Some(content[8..24].to_vec()));
        assert_eq!(fm.fill_request(2, 0, 16).unwrap(), None);
        assert_eq!(fm.fill_request(1, 16, 100).unwrap(), None);
        assert_eq!(fm.uploaded(), 24);
    }

    #[test]
    fn discard_partial_drops_the_buffer() {
        let content = content(32);
        let fm = file_manager_for("discard", &content, 32);
        fm.submit_block(0, 0, &content[..16]).unwrap();
        fm.discard_partial(0);
        fm.submit_block(0, 16, &content[16..]).unwrap();
        assert!(!fm.has_piece(0));
    }

    #[test]
    fn closed_storage_refuses_writes() {
        let content = content(16);
        let fm = file_manager_for("closed", &content, 16);
        fm.close().unwrap();
        assert!(fm.submit_block(0, 0, &content).is_err());
        assert!(!fm.has_piece(0));
    }

    #[test]
    fn piece_that_cannot_be_written_is_scheduled_again() {
        let content = content(32);
        let fm = file_manager_for("unwritable", &content, 16);
        fm.submit_block(1, 0, &content[16..24]).unwrap();
        fm.close().unwrap();
        assert!(fm.submit_block(0, 0, &content[..16]).is_err());
        assert!(!fm.has_piece(0));
        assert!(fm.take_verified().is_empty());
        assert_eq!(fm.take_corrupted(), vec![0]);
    }
}
