//! The extent: one append-only, self-describing, recoverable file of blocks.
//!
//! An extent is identified by a 64-bit id stored in an extended attribute and
//! holds a sequence of checksummed blocks framed as records in a chunked
//! record log (see [`record`]). Writes land at `commit_length` and advance
//! it; readers observe `commit_length` with an atomic load and then issue
//! positional reads, so they take no lock. A single writer at a time holds
//! the append/seal lock.
//!
//! Sealing transitions the extent to read-only, optionally truncating it
//! down to an agreed commit length first. An unsealed extent that was shut
//! down uncleanly recovers on open by scanning its record log and truncating
//! the torn tail.

pub mod meta;
pub mod record;

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::block::Block;
use crate::error::Result;
use crate::{errdata, errinput};
use crate::Error;

use record::{recover_offset, RecordReader, RecordWriter};

/// One batch of blocks returned by a read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBatch {
    pub blocks: Vec<Block>,
    /// Byte offset at which each returned block's record begins.
    pub offsets: Vec<u32>,
    /// Position immediately after the last returned record.
    pub next_offset: u32,
}

#[derive(Debug)]
pub struct Extent {
    id: u64,
    path: PathBuf,
    file: File,
    writer: Mutex<RecordWriter>,
    commit_length: AtomicU32,
    sealed: AtomicBool,
}

impl Extent {
    /// Creates a new extent file with the given id.
    pub fn create(path: impl Into<PathBuf>, id: u64) -> Result<Self> {
        let path = path.into();
        let file = File::options()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        meta::ExtentMeta::new(id).write(&path)?;
        file.sync_all()?;

        let writer = RecordWriter::new(file.try_clone()?, 0);
        Ok(Self {
            id,
            path,
            file,
            writer: Mutex::new(writer),
            commit_length: AtomicU32::new(0),
            sealed: AtomicBool::new(false),
        })
    }

    /// Opens an existing extent. A sealed extent opens read-only at its file
    /// size; an unsealed one recovers by truncating to the last offset at
    /// which a complete record ends.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let extent_meta = meta::ExtentMeta::read(&path)?;

        if meta::is_sealed(&path)? {
            let file = File::open(&path)?;
            let size = file.metadata()?.len();
            if size > u32::MAX as u64 {
                return errdata!("extent file too big: {size}");
            }
            let writer = RecordWriter::new(file.try_clone()?, size);
            return Ok(Self {
                id: extent_meta.id,
                path,
                file,
                writer: Mutex::new(writer),
                commit_length: AtomicU32::new(size as u32),
                sealed: AtomicBool::new(true),
            });
        }

        let file = File::options().read(true).write(true).open(&path)?;
        let recovered = recover_offset(&file)?;
        if recovered != file.metadata()?.len() {
            tracing::warn!(
                extent = extent_meta.id,
                recovered,
                size = file.metadata()?.len(),
                "truncating torn extent tail"
            );
            file.set_len(recovered)?;
            file.sync_all()?;
        }

        let writer = RecordWriter::new(file.try_clone()?, recovered);
        Ok(Self {
            id: extent_meta.id,
            path,
            file,
            writer: Mutex::new(writer),
            commit_length: AtomicU32::new(recovered as u32),
            sealed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The durable, readable byte length. Lock-free.
    pub fn commit_length(&self) -> u32 {
        self.commit_length.load(Ordering::SeqCst)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Appends blocks at the current commit length. When `expected` is given
    /// (secondary replicas), the append is rejected unless it matches the
    /// current commit length exactly. Returns the offset of each block's
    /// record and the new commit length.
    pub fn append(&self, blocks: &[Block], expected: Option<u32>) -> Result<(Vec<u32>, u32)> {
        if blocks.is_empty() {
            return errinput!("no blocks to append");
        }

        let mut writer = self.writer.lock()?;
        if self.is_sealed() {
            return Err(Error::Sealed);
        }

        let current = self.commit_length();
        if let Some(expected) = expected {
            if expected != current {
                return Err(Error::OffsetMismatch {
                    expected,
                    actual: current,
                });
            }
        }

        for block in blocks {
            block.verify()?;
        }

        let mut offsets = Vec::with_capacity(blocks.len());
        let result = (|| {
            for block in blocks {
                let frame = block.encode()?;
                offsets.push(writer.append(&frame)? as u32);
            }
            writer.sync()?;
            if writer.offset() > u32::MAX as u64 {
                return errinput!("append overflows extent size");
            }
            Ok(writer.offset() as u32)
        })();

        match result {
            Ok(end) => {
                self.commit_length.store(end, Ordering::SeqCst);
                Ok((offsets, end))
            }
            Err(e) => {
                // Roll back to the pre-append length so the failed write
                // leaves the extent byte-identical.
                writer.truncate(current as u64)?;
                Err(e)
            }
        }
    }

    /// Reads up to `max_blocks` blocks (or until `max_bytes` of frames)
    /// starting at `offset`. Returns `EndOfExtent` or `EndOfStream` when
    /// `offset` is at or past the commit length.
    pub fn read_blocks(&self, offset: u32, max_blocks: u32, max_bytes: u32) -> Result<ReadBatch> {
        let commit = self.commit_length() as u64;
        if offset as u64 >= commit {
            return Err(self.end_signal());
        }

        let mut reader = RecordReader::new(self.file.try_clone()?, offset as u64);
        let mut blocks = Vec::new();
        let mut offsets = Vec::new();
        let mut size = 0u64;

        while reader.offset() < commit {
            let start = reader.offset();
            let result = reader
                .read_record()
                .and_then(|frame| Block::decode(&frame));
            let block = match result {
                Ok(block) => block,
                // Surface what was read intact; the next call starting at
                // the bad record reports the failure itself.
                Err(Error::ChecksumMismatch) if !blocks.is_empty() => break,
                Err(e) => return Err(e),
            };
            size += block.frame_len() as u64;
            offsets.push(start as u32);
            blocks.push(block);
            if blocks.len() as u32 >= max_blocks || size > max_bytes as u64 {
                break;
            }
        }

        Ok(ReadBatch {
            blocks,
            offsets,
            next_offset: reader.offset() as u32,
        })
    }

    /// Seals the extent at `at`, truncating down when replicas disagreed and
    /// the agreed commit length is smaller. Sealing an already-sealed extent
    /// at its commit length succeeds trivially.
    pub fn seal(&self, at: u32) -> Result<()> {
        let mut writer = self.writer.lock()?;

        if self.is_sealed() {
            return if at == self.commit_length() {
                Ok(())
            } else {
                Err(Error::Sealed)
            };
        }

        let current = self.commit_length();
        if at > current {
            return errinput!("seal at {at} is beyond commit length {current}");
        }
        if at < current {
            writer.truncate(at as u64)?;
            self.commit_length.store(at, Ordering::SeqCst);
        }

        meta::set_sealed(&self.path)?;
        self.sealed.store(true, Ordering::SeqCst);
        tracing::info!(extent = self.id, commit_length = at, "sealed extent");
        Ok(())
    }

    fn end_signal(&self) -> Error {
        if self.is_sealed() {
            Error::EndOfExtent
        } else {
            Error::EndOfStream
        }
    }
}

#[cfg(test)]
mod tests {
    use super::record::CHUNK_HEADER_SIZE;
    use super::*;
    use crate::block::SECTOR_SIZE;
    use crate::tmpfs::TempDir;

    fn test_block(byte: u8, sectors: usize) -> Block {
        Block::new(vec![byte; sectors * SECTOR_SIZE]).expect("Failed to create block")
    }

    #[test]
    fn test_single_block_round_trip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let extent = Extent::create(dir.path().join("7.ext"), 7).expect("Failed to create");

        let block = test_block(0x41, 1);
        let (offsets, commit) = extent.append(&[block.clone()], None).expect("Append failed");

        assert_eq!(offsets, vec![0]);
        // Chunk header + header sector + one sector of data.
        assert_eq!(commit, CHUNK_HEADER_SIZE as u32 + 512 + 512);
        assert_eq!(extent.commit_length(), commit);

        let batch = extent.read_blocks(0, 1, u32::MAX).expect("Read failed");
        assert_eq!(batch.blocks.len(), 1);
        assert_eq!(batch.blocks[0].data, block.data);
        assert_eq!(batch.offsets, vec![0]);
        assert_eq!(batch.next_offset, commit);
    }

    #[test]
    fn test_offset_checked_append_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let extent = Extent::create(dir.path().join("1.ext"), 1).expect("Failed to create");

        extent.append(&[test_block(1, 1)], None).unwrap();
        let commit = extent.commit_length();
        let size_before = std::fs::metadata(dir.path().join("1.ext")).unwrap().len();

        let err = extent
            .append(&[test_block(2, 1)], Some(commit - 512))
            .unwrap_err();
        assert!(matches!(err, Error::OffsetMismatch { .. }));

        // The extent is byte-identical after the reject.
        assert_eq!(extent.commit_length(), commit);
        let size_after = std::fs::metadata(dir.path().join("1.ext")).unwrap().len();
        assert_eq!(size_before, size_after);

        // A matching expected offset is accepted.
        extent
            .append(&[test_block(2, 1)], Some(commit))
            .expect("Matching append failed");
    }

    #[test]
    fn test_append_after_reopen() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("3.ext");

        let commit = {
            let extent = Extent::create(&path, 3).unwrap();
            extent.append(&[test_block(1, 2)], None).unwrap();
            extent.commit_length()
        };

        let extent = Extent::open(&path).expect("Failed to reopen");
        assert_eq!(extent.id(), 3);
        assert!(!extent.is_sealed());
        assert_eq!(extent.commit_length(), commit);

        extent.append(&[test_block(2, 1)], Some(commit)).unwrap();
        let batch = extent.read_blocks(0, 16, u32::MAX).unwrap();
        assert_eq!(batch.blocks.len(), 2);
    }

    #[test]
    fn test_crash_recovery_truncates_torn_tail() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("9.ext");

        let good_commit = {
            let extent = Extent::create(&path, 9).unwrap();
            extent.append(&[test_block(1, 1)], None).unwrap();
            let good = extent.commit_length();
            extent.append(&[test_block(2, 4)], None).unwrap();
            good
        };

        // Tear the second record's tail, as a crash mid-write would.
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(good_commit as u64 + CHUNK_HEADER_SIZE + 100)
            .unwrap();
        drop(file);

        let extent = Extent::open(&path).expect("Failed to recover");
        assert_eq!(extent.commit_length(), good_commit);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            good_commit as u64
        );

        let batch = extent.read_blocks(0, 16, u32::MAX).unwrap();
        assert_eq!(batch.blocks.len(), 1);
        assert_eq!(batch.blocks[0].data, vec![1u8; 512]);
    }

    #[test]
    fn test_seal_truncates_and_is_idempotent() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("5.ext");
        let extent = Extent::create(&path, 5).unwrap();

        extent.append(&[test_block(1, 1)], None).unwrap();
        let first_end = extent.commit_length();
        extent.append(&[test_block(2, 1)], None).unwrap();

        // Seal below the current commit length truncates down.
        extent.seal(first_end).expect("Seal failed");
        assert!(extent.is_sealed());
        assert_eq!(extent.commit_length(), first_end);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), first_end as u64);

        // Idempotent at the sealed length, Sealed otherwise.
        extent.seal(first_end).expect("Repeat seal failed");
        assert_eq!(extent.seal(0), Err(Error::Sealed));

        // Appends are rejected.
        assert_eq!(extent.append(&[test_block(3, 1)], None), Err(Error::Sealed));
    }

    #[test]
    fn test_seal_beyond_commit_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let extent = Extent::create(dir.path().join("6.ext"), 6).unwrap();
        extent.append(&[test_block(1, 1)], None).unwrap();
        assert!(extent.seal(extent.commit_length() + 512).is_err());
    }

    #[test]
    fn test_sealed_extent_reopens_read_only() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("8.ext");

        let commit = {
            let extent = Extent::create(&path, 8).unwrap();
            extent.append(&[test_block(7, 1)], None).unwrap();
            extent.seal(extent.commit_length()).unwrap();
            extent.commit_length()
        };

        let extent = Extent::open(&path).expect("Failed to reopen sealed extent");
        assert!(extent.is_sealed());
        assert_eq!(extent.commit_length(), commit);

        // Reads past the end signal EndOfExtent on a sealed extent.
        assert_eq!(
            extent.read_blocks(commit, 1, u32::MAX).unwrap_err(),
            Error::EndOfExtent
        );
    }

    #[test]
    fn test_read_at_commit_length_signals() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let extent = Extent::create(dir.path().join("2.ext"), 2).unwrap();

        assert_eq!(extent.read_blocks(0, 1, u32::MAX), Err(Error::EndOfStream));

        extent.append(&[test_block(1, 1)], None).unwrap();
        let commit = extent.commit_length();
        assert_eq!(
            extent.read_blocks(commit, 1, u32::MAX),
            Err(Error::EndOfStream)
        );

        extent.seal(commit).unwrap();
        assert_eq!(
            extent.read_blocks(commit, 1, u32::MAX),
            Err(Error::EndOfExtent)
        );
    }

    #[test]
    fn test_read_limits() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let extent = Extent::create(dir.path().join("4.ext"), 4).unwrap();

        let blocks: Vec<_> = (0..4).map(|i| test_block(i, 1)).collect();
        extent.append(&blocks, None).unwrap();

        // max_blocks caps the batch; next_offset resumes it.
        let batch = extent.read_blocks(0, 2, u32::MAX).unwrap();
        assert_eq!(batch.blocks.len(), 2);
        let rest = extent.read_blocks(batch.next_offset, 16, u32::MAX).unwrap();
        assert_eq!(rest.blocks.len(), 2);
        assert_eq!(rest.blocks[1].data, vec![3u8; 512]);

        // A tiny byte budget still yields at least one block.
        let batch = extent.read_blocks(0, 16, 1).unwrap();
        assert_eq!(batch.blocks.len(), 1);
    }

    #[test]
    fn test_concurrent_readers() {
        use std::sync::Arc;

        let dir = TempDir::new().expect("Failed to create temp dir");
        let extent =
            Arc::new(Extent::create(dir.path().join("10.ext"), 10).expect("Failed to create"));

        let blocks: Vec<_> = (0..8).map(|i| test_block(i, 1)).collect();
        extent.append(&blocks, None).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let extent = Arc::clone(&extent);
            handles.push(std::thread::spawn(move || {
                let batch = extent.read_blocks(0, 16, u32::MAX).expect("Read failed");
                assert_eq!(batch.blocks.len(), 8);
                for (i, block) in batch.blocks.iter().enumerate() {
                    assert_eq!(block.data, vec![i as u8; 512]);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("Reader panicked");
        }
    }
}
