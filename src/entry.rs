//! Logical write records and their packing into blocks.
//!
//! An entry is one key/value mutation plus metadata. Entries travel inside
//! blocks on the log stream: small entries are serialized back to back and
//! share a block, while a large entry occupies a block of its own. The entry
//! boundaries inside a block's data are recorded in the block's `user_data`
//! as a big-endian u32 offset list (n+1 offsets for n entries), so a block is
//! self-describing on replay.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::block::{ceil_to_sector, Block};
use crate::error::Result;
use crate::errdata;

/// Meta bit: the entry is a tombstone.
pub const BIT_DELETE: u8 = 1 << 0;
/// Meta bit: the value field holds an encoded [`ValuePointer`] into the log
/// stream rather than the value itself.
pub const BIT_VALUE_POINTER: u8 = 1 << 1;
/// Meta bit: the entry is a flush marker; its value encodes the log position
/// already subsumed by SSTs.
pub const BIT_FLUSH_MARKER: u8 = 1 << 2;

/// Entries whose serialized form reaches this size get a block of their own;
/// smaller entries are packed together.
pub const MAX_PACKED_BLOCK: usize = 16 * 1024;

/// Cap on entries sharing one block, bounded by the user_data offset list
/// fitting in the header sector.
pub const MAX_ENTRIES_PER_BLOCK: usize = 96;

const ENTRY_HEADER_SIZE: usize = 2 + 4 + 1 + 1 + 8 + 8;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub meta: u8,
    pub user_meta: u8,
    pub expires_at: u64,
    pub version: u64,
}

impl Entry {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            ..Default::default()
        }
    }

    pub fn tombstone(key: Vec<u8>) -> Self {
        Self {
            key,
            meta: BIT_DELETE,
            ..Default::default()
        }
    }

    pub fn is_delete(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }

    pub fn is_flush_marker(&self) -> bool {
        self.meta & BIT_FLUSH_MARKER != 0
    }

    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.key.len() + self.value.len()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u16::<BigEndian>(self.key.len() as u16).unwrap();
        buf.write_u32::<BigEndian>(self.value.len() as u32).unwrap();
        buf.write_u8(self.meta).unwrap();
        buf.write_u8(self.user_meta).unwrap();
        buf.write_u64::<BigEndian>(self.expires_at).unwrap();
        buf.write_u64::<BigEndian>(self.version).unwrap();
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(buf);
        let key_len = cursor.read_u16::<BigEndian>()? as usize;
        let value_len = cursor.read_u32::<BigEndian>()? as usize;
        let meta = cursor.read_u8()?;
        let user_meta = cursor.read_u8()?;
        let expires_at = cursor.read_u64::<BigEndian>()?;
        let version = cursor.read_u64::<BigEndian>()?;

        let rest = &buf[ENTRY_HEADER_SIZE..];
        if rest.len() < key_len + value_len {
            return errdata!(
                "entry truncated: have {}, want {}",
                rest.len(),
                key_len + value_len
            );
        }
        Ok(Self {
            key: rest[..key_len].to_vec(),
            value: rest[key_len..key_len + value_len].to_vec(),
            meta,
            user_meta,
            expires_at,
            version,
        })
    }
}

/// An entry read back from the log stream, annotated with where it lives.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub entry: Entry,
    pub extent_id: u64,
    /// Byte offset of the block record holding this entry.
    pub offset: u32,
    /// Original value length, kept even when the value bytes were dropped in
    /// favor of a pointer.
    pub value_len: u32,
    pub estimated_size: u64,
}

/// Reference to a large value stored in a log-stream block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValuePointer {
    pub extent_id: u64,
    pub offset: u32,
    pub len: u32,
}

impl ValuePointer {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::ENCODED_LEN];
        BigEndian::write_u64(&mut buf[..8], self.extent_id);
        BigEndian::write_u32(&mut buf[8..12], self.offset);
        BigEndian::write_u32(&mut buf[12..16], self.len);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return errdata!("value pointer truncated: {}", buf.len());
        }
        Ok(Self {
            extent_id: BigEndian::read_u64(&buf[..8]),
            offset: BigEndian::read_u32(&buf[8..12]),
            len: BigEndian::read_u32(&buf[12..16]),
        })
    }
}

/// What a memtable or SST holds for one key version: the value bytes (or an
/// encoded pointer) plus the entry metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueStruct {
    pub value: Vec<u8>,
    pub meta: u8,
    pub user_meta: u8,
    pub expires_at: u64,
}

impl ValueStruct {
    pub fn is_delete(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }

    pub fn is_pointer(&self) -> bool {
        self.meta & BIT_VALUE_POINTER != 0
    }

    pub fn encoded_len(&self) -> usize {
        2 + 8 + 4 + self.value.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.write_u8(self.meta).unwrap();
        buf.write_u8(self.user_meta).unwrap();
        buf.write_u64::<BigEndian>(self.expires_at).unwrap();
        buf.write_u32::<BigEndian>(self.value.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.value);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 14 {
            return errdata!("value struct truncated: {}", buf.len());
        }
        let meta = buf[0];
        let user_meta = buf[1];
        let expires_at = BigEndian::read_u64(&buf[2..10]);
        let value_len = BigEndian::read_u32(&buf[10..14]) as usize;
        if buf.len() < 14 + value_len {
            return errdata!("value struct value truncated");
        }
        Ok(Self {
            value: buf[14..14 + value_len].to_vec(),
            meta,
            user_meta,
            expires_at,
        })
    }
}

/// Builds the internal key `user_key ‖ (u64::MAX − version)` so that for one
/// user key, newer versions sort first.
pub fn key_with_version(user_key: &[u8], version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_key.len() + 8);
    key.extend_from_slice(user_key);
    let mut suffix = [0u8; 8];
    BigEndian::write_u64(&mut suffix, u64::MAX - version);
    key.extend_from_slice(&suffix);
    key
}

/// Splits an internal key into its user key and version.
pub fn parse_internal_key(key: &[u8]) -> Result<(&[u8], u64)> {
    if key.len() < 8 {
        return errdata!("internal key too short: {}", key.len());
    }
    let split = key.len() - 8;
    let version = u64::MAX - BigEndian::read_u64(&key[split..]);
    Ok((&key[..split], version))
}

/// Packs entries into blocks: small entries share a block, while an entry
/// whose value exceeds `value_threshold` occupies a block of its own (a value
/// pointer addresses the whole block). Returns the blocks plus, for each
/// input entry, the index of the block carrying it.
pub fn pack_entries(entries: &[Entry], value_threshold: usize) -> Result<(Vec<Block>, Vec<usize>)> {
    let mut blocks = Vec::new();
    let mut block_of = Vec::with_capacity(entries.len());

    let mut group: Vec<u8> = Vec::new();
    let mut boundaries: Vec<u32> = vec![0];

    fn finish(group: &mut Vec<u8>, boundaries: &mut Vec<u32>, blocks: &mut Vec<Block>) -> Result<()> {
        if group.is_empty() {
            return Ok(());
        }
        let mut user_data = Vec::with_capacity(boundaries.len() * 4);
        for b in boundaries.iter() {
            user_data.write_u32::<BigEndian>(*b).unwrap();
        }
        let mut data = std::mem::take(group);
        data.resize(ceil_to_sector(data.len()), 0);
        blocks.push(Block::with_user_data(data, user_data)?);
        boundaries.clear();
        boundaries.push(0);
        Ok(())
    }

    for entry in entries {
        let len = entry.encoded_len();
        if entry.value.len() > value_threshold || len >= MAX_PACKED_BLOCK {
            finish(&mut group, &mut boundaries, &mut blocks)?;
            let mut data = Vec::with_capacity(ceil_to_sector(len));
            entry.encode_into(&mut data);
            let mut user_data = Vec::with_capacity(8);
            user_data.write_u32::<BigEndian>(0).unwrap();
            user_data.write_u32::<BigEndian>(len as u32).unwrap();
            data.resize(ceil_to_sector(len), 0);
            block_of.push(blocks.len());
            blocks.push(Block::with_user_data(data, user_data)?);
            continue;
        }

        if group.len() + len > MAX_PACKED_BLOCK || boundaries.len() - 1 >= MAX_ENTRIES_PER_BLOCK {
            finish(&mut group, &mut boundaries, &mut blocks)?;
        }
        block_of.push(blocks.len());
        entry.encode_into(&mut group);
        boundaries.push(group.len() as u32);
    }
    finish(&mut group, &mut boundaries, &mut blocks)?;

    Ok((blocks, block_of))
}

/// Decodes the entries packed in a block, using the boundary list in its
/// `user_data`.
pub fn unpack_entries(block: &Block) -> Result<Vec<Entry>> {
    let boundaries = entry_boundaries(block)?;
    let mut entries = Vec::with_capacity(boundaries.len().saturating_sub(1));
    for window in boundaries.windows(2) {
        let (start, end) = (window[0] as usize, window[1] as usize);
        entries.push(Entry::decode(&block.data[start..end])?);
    }
    Ok(entries)
}

fn entry_boundaries(block: &Block) -> Result<Vec<u32>> {
    if block.user_data.is_empty() || block.user_data.len() % 4 != 0 {
        return errdata!("block has no entry boundaries");
    }
    let mut boundaries = Vec::with_capacity(block.user_data.len() / 4);
    for chunk in block.user_data.chunks_exact(4) {
        boundaries.push(BigEndian::read_u32(chunk));
    }
    for window in boundaries.windows(2) {
        if window[1] <= window[0] {
            return errdata!("entry boundaries not increasing");
        }
    }
    if let Some(&last) = boundaries.last() {
        if last as usize > block.data.len() {
            return errdata!("entry boundary past block data");
        }
    }
    Ok(boundaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value_len: usize) -> Entry {
        Entry::put(key.as_bytes().to_vec(), vec![b'v'; value_len])
    }

    #[test]
    fn test_entry_codec() {
        let e = Entry {
            key: b"hello".to_vec(),
            value: b"world".to_vec(),
            meta: BIT_DELETE,
            user_meta: 7,
            expires_at: 1243434343434,
            version: 42,
        };
        let mut buf = Vec::new();
        e.encode_into(&mut buf);
        assert_eq!(buf.len(), e.encoded_len());
        assert_eq!(Entry::decode(&buf).expect("Failed to decode"), e);
    }

    #[test]
    fn test_value_pointer_codec() {
        let vp = ValuePointer {
            extent_id: 9,
            offset: 1040,
            len: 1 << 20,
        };
        assert_eq!(ValuePointer::decode(&vp.encode()).unwrap(), vp);
    }

    #[test]
    fn test_internal_key_orders_versions_descending() {
        let k1 = key_with_version(b"key", 1);
        let k2 = key_with_version(b"key", 2);
        // Newer version sorts first.
        assert!(k2 < k1);

        let (user, version) = parse_internal_key(&k2).unwrap();
        assert_eq!(user, b"key");
        assert_eq!(version, 2);
    }

    const THRESHOLD: usize = 1024;

    #[test]
    fn test_pack_small_entries_share_a_block() {
        let entries = vec![entry("a", 2), entry("b", 2)];
        let (blocks, block_of) = pack_entries(&entries, THRESHOLD).expect("Failed to pack");
        assert_eq!(blocks.len(), 1);
        assert_eq!(block_of, vec![0, 0]);

        let unpacked = unpack_entries(&blocks[0]).expect("Failed to unpack");
        assert_eq!(unpacked, entries);
    }

    #[test]
    fn test_pack_large_entry_gets_own_block() {
        let entries = vec![entry("a", 2), entry("b", 1 << 20), entry("c", 2)];
        let (blocks, block_of) = pack_entries(&entries, THRESHOLD).expect("Failed to pack");
        assert_eq!(blocks.len(), 3);
        assert_eq!(block_of, vec![0, 1, 2]);

        let big = unpack_entries(&blocks[1]).expect("Failed to unpack");
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].value.len(), 1 << 20);
    }

    #[test]
    fn test_pack_respects_entry_cap() {
        let entries: Vec<_> = (0..MAX_ENTRIES_PER_BLOCK + 1)
            .map(|i| entry(&format!("key{i}"), 1))
            .collect();
        let (blocks, _) = pack_entries(&entries, THRESHOLD).expect("Failed to pack");
        assert_eq!(blocks.len(), 2);

        let total: usize = blocks
            .iter()
            .map(|b| unpack_entries(b).unwrap().len())
            .sum();
        assert_eq!(total, entries.len());
    }

    #[test]
    fn test_value_struct_codec() {
        let vs = ValueStruct {
            value: b"abc".to_vec(),
            meta: BIT_VALUE_POINTER,
            user_meta: 1,
            expires_at: 99,
        };
        assert_eq!(ValueStruct::decode(&vs.encode()).unwrap(), vs);
    }
}
