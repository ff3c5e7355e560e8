//! Chunked record log: the physical layout of an extent file.
//!
//! All file content is framed as fixed-size physical blocks of 32 KiB, each
//! holding a sequence of chunks:
//!
//! ```text
//! +------------+----------+--------+-------------+-----------------+
//! |checksum:u32|length:u16|type:u8 | reserved[9] |     payload     |
//! +------------+----------+--------+-------------+-----------------+
//! |                16-byte header                |  length bytes   |
//! +----------------------------------------------+-----------------+
//! ```
//!
//! The checksum is Adler-32 over the type byte, the two length bytes, and
//! the payload. A logical record is one `full` chunk, or a `first` chunk
//! followed by zero or more `middle` chunks and a `last` chunk. When the
//! space left in a physical block cannot hold a chunk header, the tail is
//! zero padding and the next chunk starts at the following block boundary.
//!
//! Recovery scans records from offset zero and truncates the file to the end
//! of the last record that verifies, so a torn write never survives a
//! restart.

use std::fs::File;
use std::os::unix::fs::FileExt;

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::errdata;
use crate::Error;

/// Size of one physical log block.
pub const PHYSICAL_BLOCK_SIZE: u64 = 32 * 1024;

/// Size of a chunk header.
pub const CHUNK_HEADER_SIZE: u64 = 16;

const CHUNK_FULL: u8 = 1;
const CHUNK_FIRST: u8 = 2;
const CHUNK_MIDDLE: u8 = 3;
const CHUNK_LAST: u8 = 4;

fn chunk_checksum(chunk_type: u8, payload: &[u8]) -> u32 {
    let mut head = [0u8; 3];
    head[0] = chunk_type;
    BigEndian::write_u16(&mut head[1..], payload.len() as u16);
    let mut hasher = adler32::RollingAdler32::new();
    hasher.update_buffer(&head);
    hasher.update_buffer(payload);
    hasher.hash()
}

/// Appends logical records to an extent file, splitting them into chunks at
/// physical block boundaries.
#[derive(Debug)]
pub struct RecordWriter {
    file: File,
    offset: u64,
}

impl RecordWriter {
    pub fn new(file: File, offset: u64) -> Self {
        Self { file, offset }
    }

    /// Current end-of-log offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Appends one record; returns the offset at which its first chunk header
    /// begins.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let mut space = PHYSICAL_BLOCK_SIZE - self.offset % PHYSICAL_BLOCK_SIZE;
        if space < CHUNK_HEADER_SIZE {
            // The remainder of this physical block is padding.
            let pad = vec![0u8; space as usize];
            self.file.write_all_at(&pad, self.offset)?;
            self.offset += space;
            space = PHYSICAL_BLOCK_SIZE;
        }

        let start = self.offset;
        let mut remaining = payload;
        let mut first = true;
        loop {
            let avail = (space - CHUNK_HEADER_SIZE) as usize;
            let take = remaining.len().min(avail);
            let (fragment, rest) = remaining.split_at(take);
            let chunk_type = match (first, rest.is_empty()) {
                (true, true) => CHUNK_FULL,
                (true, false) => CHUNK_FIRST,
                (false, true) => CHUNK_LAST,
                (false, false) => CHUNK_MIDDLE,
            };

            let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE as usize + take);
            buf.resize(CHUNK_HEADER_SIZE as usize, 0);
            BigEndian::write_u32(&mut buf[..4], chunk_checksum(chunk_type, fragment));
            BigEndian::write_u16(&mut buf[4..6], take as u16);
            buf[6] = chunk_type;
            buf.extend_from_slice(fragment);

            self.file.write_all_at(&buf, self.offset)?;
            self.offset += buf.len() as u64;

            if rest.is_empty() {
                return Ok(start);
            }
            remaining = rest;
            first = false;
            space = PHYSICAL_BLOCK_SIZE;
            debug_assert_eq!(self.offset % PHYSICAL_BLOCK_SIZE, 0);
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Truncates the log back to `offset`, discarding everything after it.
    pub fn truncate(&mut self, offset: u64) -> Result<()> {
        self.file.set_len(offset)?;
        self.file.sync_all()?;
        self.offset = offset;
        Ok(())
    }
}

/// Reads logical records back out of an extent file by offset. Readers are
/// independent: each holds its own position and issues positional reads, so
/// any number can run concurrently with the single writer.
#[derive(Debug)]
pub struct RecordReader {
    file: File,
    offset: u64,
}

impl RecordReader {
    pub fn new(file: File, offset: u64) -> Self {
        Self { file, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn seek(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Skips to the next physical block boundary. Used to resume after a
    /// corrupt chunk.
    pub fn recover(&mut self) {
        self.offset = (self.offset / PHYSICAL_BLOCK_SIZE + 1) * PHYSICAL_BLOCK_SIZE;
    }

    /// Reads the record starting at the current offset and advances past it.
    pub fn read_record(&mut self) -> Result<Vec<u8>> {
        let mut record = Vec::new();
        let mut expect_continuation = false;
        loop {
            let (chunk_type, payload) = self.read_chunk()?;
            match chunk_type {
                CHUNK_FULL if !expect_continuation => return Ok(payload),
                CHUNK_FIRST if !expect_continuation => {
                    record = payload;
                    expect_continuation = true;
                }
                CHUNK_MIDDLE if expect_continuation => record.extend_from_slice(&payload),
                CHUNK_LAST if expect_continuation => {
                    record.extend_from_slice(&payload);
                    return Ok(record);
                }
                other => return errdata!("unexpected chunk type {other}"),
            }
        }
    }

    fn read_chunk(&mut self) -> Result<(u8, Vec<u8>)> {
        let space = PHYSICAL_BLOCK_SIZE - self.offset % PHYSICAL_BLOCK_SIZE;
        if space < CHUNK_HEADER_SIZE {
            self.offset += space;
        }

        let mut header = [0u8; CHUNK_HEADER_SIZE as usize];
        self.read_exact_at(&mut header, self.offset)?;

        let stored = BigEndian::read_u32(&header[..4]);
        let length = BigEndian::read_u16(&header[4..6]) as u64;
        let chunk_type = header[6];

        if !(CHUNK_FULL..=CHUNK_LAST).contains(&chunk_type) {
            return errdata!("invalid chunk type {chunk_type}");
        }
        let offset_in_block = self.offset % PHYSICAL_BLOCK_SIZE;
        if offset_in_block + CHUNK_HEADER_SIZE + length > PHYSICAL_BLOCK_SIZE {
            return errdata!("chunk crosses physical block boundary");
        }

        let mut payload = vec![0u8; length as usize];
        self.read_exact_at(&mut payload, self.offset + CHUNK_HEADER_SIZE)?;

        if chunk_checksum(chunk_type, &payload) != stored {
            return Err(Error::ChecksumMismatch);
        }

        self.offset += CHUNK_HEADER_SIZE + length;
        Ok((chunk_type, payload))
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::InvalidData("unexpected end of record log".to_string())
            } else {
                e.into()
            }
        })
    }
}

/// Scans a record log from offset zero and returns the offset just past the
/// last complete, checksum-valid record. Everything beyond is a torn tail.
pub fn recover_offset(file: &File) -> Result<u64> {
    let size = file.metadata()?.len();
    let mut reader = RecordReader::new(file.try_clone()?, 0);
    let mut good = 0u64;
    while reader.offset() < size {
        match reader.read_record() {
            Ok(_) => good = reader.offset(),
            Err(_) => break,
        }
    }
    Ok(good)
}
