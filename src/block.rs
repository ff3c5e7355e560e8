//! The block: the unit of append on an extent.
//!
//! A block carries opaque `data` whose length is a positive multiple of 512,
//! an Adler-32 checksum of that data, and up to ~500 bytes of `user_data`
//! that rides along in the header sector. On disk a block is framed as:
//!
//! ```text
//! +-----------+-------------------+----------------------+-----------+-----+
//! |checksum:u32|uvarint(block_len)|uvarint(user_data_len)| user_data |pad 0|
//! +-----------+-------------------+----------------------+-----------+-----+
//! |                       header sector, 512 bytes                        |
//! +-----------------------------------------------------------------------+
//! |                        data, block_len bytes                          |
//! +-----------------------------------------------------------------------+
//! ```
//!
//! The framed form is what gets written as one record into an extent's
//! record log.

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::{errdata, errinput};
use crate::Error;

/// Alignment unit for block data; also the size of the header sector.
pub const SECTOR_SIZE: usize = 512;

/// Adler-32 over a byte slice.
pub fn checksum(data: &[u8]) -> u32 {
    adler32::RollingAdler32::from_buffer(data).hash()
}

/// Rounds `len` up to the next multiple of [`SECTOR_SIZE`].
pub fn ceil_to_sector(len: usize) -> usize {
    len.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

fn aligned(len: usize) -> bool {
    len != 0 && len % SECTOR_SIZE == 0
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub data: Vec<u8>,
    pub checksum: u32,
    pub user_data: Vec<u8>,
}

impl Block {
    /// Creates a block over `data`, computing its checksum.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        Self::with_user_data(data, Vec::new())
    }

    /// Creates a block over `data` with attached `user_data`.
    pub fn with_user_data(data: Vec<u8>, user_data: Vec<u8>) -> Result<Self> {
        if !aligned(data.len()) {
            return errinput!("block is not aligned: {}", data.len());
        }
        let sum = checksum(&data);
        let block = Self {
            data,
            checksum: sum,
            user_data,
        };
        block.check_user_data_fits()?;
        Ok(block)
    }

    /// Verifies the stored checksum against the data.
    pub fn verify(&self) -> Result<()> {
        if !aligned(self.data.len()) {
            return errinput!("block is not aligned: {}", self.data.len());
        }
        if checksum(&self.data) != self.checksum {
            return Err(Error::ChecksumMismatch);
        }
        self.check_user_data_fits()
    }

    /// Framed length on disk: header sector plus data.
    pub fn frame_len(&self) -> u32 {
        (SECTOR_SIZE + self.data.len()) as u32
    }

    fn header_prefix_len(&self) -> usize {
        4 + uvarint_len(self.data.len() as u64) + uvarint_len(self.user_data.len() as u64)
    }

    fn check_user_data_fits(&self) -> Result<()> {
        if self.header_prefix_len() + self.user_data.len() > SECTOR_SIZE {
            return errinput!("user data is too big: {}", self.user_data.len());
        }
        Ok(())
    }

    /// Encodes the block into its framed form: header sector followed by data.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.verify()?;

        let mut buf = vec![0u8; SECTOR_SIZE + self.data.len()];
        BigEndian::write_u32(&mut buf[..4], self.checksum);
        let mut pos = 4;
        pos += put_uvarint(&mut buf[pos..], self.data.len() as u64);
        pos += put_uvarint(&mut buf[pos..], self.user_data.len() as u64);
        buf[pos..pos + self.user_data.len()].copy_from_slice(&self.user_data);
        buf[SECTOR_SIZE..].copy_from_slice(&self.data);
        Ok(buf)
    }

    /// Decodes a framed block, verifying alignment and checksum.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SECTOR_SIZE {
            return errdata!("block frame too short: {}", buf.len());
        }
        let sum = BigEndian::read_u32(&buf[..4]);
        let mut pos = 4;
        let (block_len, n) = read_uvarint(&buf[pos..SECTOR_SIZE])?;
        pos += n;
        let (user_len, n) = read_uvarint(&buf[pos..SECTOR_SIZE])?;
        pos += n;

        let block_len = block_len as usize;
        let user_len = user_len as usize;
        if pos + user_len > SECTOR_SIZE {
            return errdata!("user data is too big: {}", user_len);
        }
        if !aligned(block_len) {
            return errdata!("block is not aligned: {}", block_len);
        }
        if buf.len() < SECTOR_SIZE + block_len {
            return errdata!(
                "block frame truncated: have {}, want {}",
                buf.len(),
                SECTOR_SIZE + block_len
            );
        }

        let user_data = buf[pos..pos + user_len].to_vec();
        let data = buf[SECTOR_SIZE..SECTOR_SIZE + block_len].to_vec();
        if checksum(&data) != sum {
            return Err(Error::ChecksumMismatch);
        }

        Ok(Self {
            data,
            checksum: sum,
            user_data,
        })
    }
}

/// Writes an unsigned LEB128 varint into `buf`, returning the encoded length.
pub(crate) fn put_uvarint(buf: &mut [u8], mut x: u64) -> usize {
    let mut i = 0;
    while x >= 0x80 {
        buf[i] = (x as u8) | 0x80;
        x >>= 7;
        i += 1;
    }
    buf[i] = x as u8;
    i + 1
}

/// Reads an unsigned LEB128 varint from `buf`, returning the value and the
/// number of bytes consumed.
pub(crate) fn read_uvarint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut x = 0u64;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if shift >= 64 {
            return errdata!("varint overflows u64");
        }
        x |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok((x, i + 1));
        }
        shift += 7;
    }
    errdata!("varint truncated")
}

fn uvarint_len(mut x: u64) -> usize {
    let mut n = 1;
    while x >= 0x80 {
        x >>= 7;
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_round_trip() {
        let data = vec![0x41u8; 512];
        let block = Block::new(data.clone()).expect("Failed to create block");
        assert_eq!(block.frame_len(), 1024);

        let framed = block.encode().expect("Failed to encode block");
        assert_eq!(framed.len(), 1024);

        let decoded = Block::decode(&framed).expect("Failed to decode block");
        assert_eq!(decoded.data, data);
        assert_eq!(decoded.checksum, block.checksum);
        assert!(decoded.user_data.is_empty());
    }

    #[test]
    fn test_block_with_user_data() {
        let data = vec![7u8; 1024];
        let user_data = b"boundaries".to_vec();
        let block =
            Block::with_user_data(data.clone(), user_data.clone()).expect("Failed to create");

        let framed = block.encode().expect("Failed to encode");
        let decoded = Block::decode(&framed).expect("Failed to decode");
        assert_eq!(decoded.data, data);
        assert_eq!(decoded.user_data, user_data);
    }

    #[test]
    fn test_unaligned_block_rejected() {
        assert!(Block::new(vec![1u8; 100]).is_err());
        assert!(Block::new(Vec::new()).is_err());
    }

    #[test]
    fn test_oversized_user_data_rejected() {
        assert!(Block::with_user_data(vec![0u8; 512], vec![1u8; 509]).is_err());
        // Just below the header capacity still fits.
        assert!(Block::with_user_data(vec![0u8; 512], vec![1u8; 500]).is_ok());
    }

    #[test]
    fn test_corrupt_data_detected() {
        let block = Block::new(vec![3u8; 512]).unwrap();
        let mut framed = block.encode().unwrap();
        framed[SECTOR_SIZE + 10] ^= 0xff;
        assert_eq!(Block::decode(&framed), Err(Error::ChecksumMismatch));
    }

    #[test]
    fn test_uvarint_round_trip() {
        let mut buf = [0u8; 10];
        for &x in &[0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let n = put_uvarint(&mut buf, x);
            let (y, m) = read_uvarint(&buf[..n]).expect("Failed to read varint");
            assert_eq!(x, y);
            assert_eq!(n, m);
        }
    }
}
