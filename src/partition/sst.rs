//! SST tables persisted to the row stream.
//!
//! Flushing a memtable produces one table: a run of prefix-compressed data
//! blocks written as stream blocks, then one index block as the table's
//! tail. The index records each data block's location and first key, the
//! table's key range, and its highest version; its location is what gets
//! registered with the partition manager.
//!
//! ## Data block layout (inside a stream block's data)
//!
//! ```text
//! +---------+------------------+--------------------+----------------+-----+
//! |len: u32 | entries...       | restarts: u32 * n  | restart count  | pad |
//! +---------+------------------+--------------------+----------------+-----+
//! ```
//!
//! Each entry is `shared:u16 ‖ unshared:u16 ‖ value_len:u32 ‖ key_suffix ‖
//! value`, with a restart point (no shared prefix) every 16 entries. Keys
//! are internal keys, so versions of one user key stay adjacent and newest
//! first.

use std::collections::VecDeque;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::block::{ceil_to_sector, Block};
use crate::cluster::TableInfo;
use crate::entry::{key_with_version, parse_internal_key, ValueStruct};
use crate::error::Result;
use crate::{errdata, errinput};
use crate::stream::{BlockReader, StreamClient};
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const RESTART_INTERVAL: usize = 16;

/// Target data block payload size; a block may run slightly over to fit its
/// last entry.
pub const TARGET_BLOCK_SIZE: usize = 4096;

/// How many staged data blocks ride in one stream append.
const APPEND_WAVE: usize = 8;

// --- Builder ---

struct BlockBuilder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        let shared_prefix_len = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let unshared = &key[shared_prefix_len..];

        self.buffer
            .write_u16::<BigEndian>(shared_prefix_len as u16)
            .unwrap();
        self.buffer
            .write_u16::<BigEndian>(unshared.len() as u16)
            .unwrap();
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .unwrap();
        self.buffer.extend_from_slice(unshared);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .unwrap();
        self.buffer
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(x, y)| x == y).count()
}

/// Wraps a payload into a sector-aligned stream block with a length prefix.
fn wrap_payload(payload: &[u8]) -> Result<Block> {
    let mut data = vec![0u8; ceil_to_sector(4 + payload.len())];
    BigEndian::write_u32(&mut data[..4], payload.len() as u32);
    data[4..4 + payload.len()].copy_from_slice(payload);
    Block::new(data)
}

fn unwrap_payload(block: &Block) -> Result<&[u8]> {
    if block.data.len() < 4 {
        return errdata!("table block too short");
    }
    let len = BigEndian::read_u32(&block.data[..4]) as usize;
    if 4 + len > block.data.len() {
        return errdata!("table block length {len} out of bounds");
    }
    Ok(&block.data[4..4 + len])
}

fn decode_entries(payload: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if payload.len() < 4 {
        return errdata!("data block too short");
    }
    let restart_count = BigEndian::read_u32(&payload[payload.len() - 4..]) as usize;
    let restart_bytes = restart_count * 4 + 4;
    if restart_bytes > payload.len() {
        return errdata!("data block restart array out of bounds");
    }
    let entries_end = payload.len() - restart_bytes;

    let mut entries = Vec::new();
    let mut last_key: Vec<u8> = Vec::new();
    let mut pos = 0usize;
    while pos < entries_end {
        if pos + 8 > entries_end {
            return errdata!("data block entry header out of bounds");
        }
        let shared = BigEndian::read_u16(&payload[pos..]) as usize;
        let unshared = BigEndian::read_u16(&payload[pos + 2..]) as usize;
        let value_len = BigEndian::read_u32(&payload[pos + 4..]) as usize;
        pos += 8;
        if shared > last_key.len() || pos + unshared + value_len > entries_end {
            return errdata!("data block entry out of bounds");
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&last_key[..shared]);
        key.extend_from_slice(&payload[pos..pos + unshared]);
        pos += unshared;
        let value = payload[pos..pos + value_len].to_vec();
        pos += value_len;

        last_key = key.clone();
        entries.push((key, value));
    }
    Ok(entries)
}

// --- Index ---

#[derive(Debug, Clone)]
struct IndexEntry {
    extent_id: u64,
    offset: u32,
    first_key: Vec<u8>,
}

fn encode_index(
    blocks: &[IndexEntry],
    smallest: &[u8],
    biggest: &[u8],
    entry_count: u64,
    max_version: u64,
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(blocks.len() as u32).unwrap();
    for block in blocks {
        buf.write_u64::<BigEndian>(block.extent_id).unwrap();
        buf.write_u32::<BigEndian>(block.offset).unwrap();
        buf.write_u16::<BigEndian>(block.first_key.len() as u16)
            .unwrap();
        buf.extend_from_slice(&block.first_key);
    }
    buf.write_u16::<BigEndian>(smallest.len() as u16).unwrap();
    buf.extend_from_slice(smallest);
    buf.write_u16::<BigEndian>(biggest.len() as u16).unwrap();
    buf.extend_from_slice(biggest);
    buf.write_u64::<BigEndian>(entry_count).unwrap();
    buf.write_u64::<BigEndian>(max_version).unwrap();

    let checksum = CRC32.checksum(&buf);
    buf.write_u32::<BigEndian>(checksum).unwrap();
    buf
}

struct DecodedIndex {
    blocks: Vec<IndexEntry>,
    entry_count: u64,
}

fn decode_index(payload: &[u8]) -> Result<DecodedIndex> {
    if payload.len() < 4 {
        return errdata!("index block too short");
    }
    let body = &payload[..payload.len() - 4];
    let stored = BigEndian::read_u32(&payload[payload.len() - 4..]);
    if CRC32.checksum(body) != stored {
        return Err(Error::ChecksumMismatch);
    }

    let mut pos = 0usize;
    let read_u16 = |pos: &mut usize| -> Result<usize> {
        if *pos + 2 > body.len() {
            return errdata!("index truncated");
        }
        let v = BigEndian::read_u16(&body[*pos..]) as usize;
        *pos += 2;
        Ok(v)
    };

    if body.len() < 4 {
        return errdata!("index truncated");
    }
    let count = BigEndian::read_u32(&body[pos..]) as usize;
    pos += 4;

    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        if pos + 12 > body.len() {
            return errdata!("index truncated");
        }
        let extent_id = BigEndian::read_u64(&body[pos..]);
        let offset = BigEndian::read_u32(&body[pos + 8..]);
        pos += 12;
        let key_len = read_u16(&mut pos)?;
        if pos + key_len > body.len() {
            return errdata!("index truncated");
        }
        let first_key = body[pos..pos + key_len].to_vec();
        pos += key_len;
        blocks.push(IndexEntry {
            extent_id,
            offset,
            first_key,
        });
    }

    // Key range and max version are carried in TableInfo; skip past them.
    let smallest_len = read_u16(&mut pos)?;
    pos += smallest_len;
    let biggest_len = read_u16(&mut pos)?;
    pos += biggest_len;
    if pos + 16 > body.len() {
        return errdata!("index truncated");
    }
    let entry_count = BigEndian::read_u64(&body[pos..]);

    Ok(DecodedIndex {
        blocks,
        entry_count,
    })
}

// --- Build ---

/// Flushes ordered `(internal_key, value)` entries as one table on the row
/// stream, returning the metadata to register with the partition manager.
pub async fn build_table(
    stream: &dyn StreamClient,
    entries: &[(Vec<u8>, ValueStruct)],
) -> Result<TableInfo> {
    if entries.is_empty() {
        return errinput!("refusing to build an empty table");
    }

    let mut staged: Vec<(Vec<u8>, Vec<u8>)> = Vec::new(); // (first_key, payload)
    let mut builder = BlockBuilder::new();
    let mut first_key: Option<Vec<u8>> = None;
    let mut max_version = 0u64;

    for (key, value) in entries {
        if first_key.is_none() {
            first_key = Some(key.clone());
        }
        let (_, version) = parse_internal_key(key)?;
        max_version = max_version.max(version);
        builder.add_entry(key, &value.encode());

        if builder.len() >= TARGET_BLOCK_SIZE {
            let payload = std::mem::replace(&mut builder, BlockBuilder::new()).finish();
            staged.push((first_key.take().unwrap(), payload));
        }
    }
    if !builder.is_empty() {
        let payload = builder.finish();
        staged.push((first_key.take().unwrap(), payload));
    }

    let mut index = Vec::with_capacity(staged.len());
    for wave in staged.chunks(APPEND_WAVE) {
        let blocks = wave
            .iter()
            .map(|(_, payload)| wrap_payload(payload))
            .collect::<Result<Vec<_>>>()?;
        let (extent_id, offsets, _) = stream.append(blocks).await?;
        for ((block_first_key, _), offset) in wave.iter().zip(offsets) {
            index.push(IndexEntry {
                extent_id,
                offset,
                first_key: block_first_key.clone(),
            });
        }
    }

    let (smallest, _) = parse_internal_key(&entries[0].0)?;
    let (biggest, _) = parse_internal_key(&entries[entries.len() - 1].0)?;

    let payload = encode_index(
        &index,
        smallest,
        biggest,
        entries.len() as u64,
        max_version,
    );
    let (index_extent, offsets, _) = stream.append(vec![wrap_payload(&payload)?]).await?;

    Ok(TableInfo {
        index_extent,
        index_offset: offsets[0],
        smallest: smallest.to_vec(),
        biggest: biggest.to_vec(),
        max_version,
    })
}

// --- Reader ---

/// A readable table: its index held in memory, data blocks fetched from the
/// row stream on demand.
pub struct Table {
    pub info: TableInfo,
    index: Vec<IndexEntry>,
    entry_count: u64,
    reader: Arc<dyn BlockReader>,
}

impl Table {
    pub async fn open(reader: Arc<dyn BlockReader>, info: TableInfo) -> Result<Self> {
        let block = reader
            .read_block(info.index_extent, info.index_offset)
            .await?;
        let decoded = decode_index(unwrap_payload(&block)?)?;
        Ok(Self {
            info,
            index: decoded.blocks,
            entry_count: decoded.entry_count,
            reader,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Whether `user_key` falls inside this table's key range.
    pub fn contains(&self, user_key: &[u8]) -> bool {
        self.info.smallest.as_slice() <= user_key && user_key <= self.info.biggest.as_slice()
    }

    /// Index of the data block that may hold keys at or after `seek`.
    fn seek_block(&self, seek: &[u8]) -> usize {
        self.index
            .partition_point(|entry| entry.first_key.as_slice() <= seek)
            .saturating_sub(1)
    }

    async fn block_entries(&self, index: usize) -> Result<Vec<(Vec<u8>, ValueStruct)>> {
        let entry = &self.index[index];
        let block = self.reader.read_block(entry.extent_id, entry.offset).await?;
        decode_entries(unwrap_payload(&block)?)?
            .into_iter()
            .map(|(key, value)| Ok((key, ValueStruct::decode(&value)?)))
            .collect()
    }

    /// Newest version of `user_key` at or below `max_version` (0 means
    /// unbounded).
    pub async fn get(&self, user_key: &[u8], max_version: u64) -> Result<Option<ValueStruct>> {
        let ceiling = if max_version == 0 {
            u64::MAX
        } else {
            max_version
        };
        let seek = key_with_version(user_key, ceiling);

        // The matching version usually sits in the block whose first key
        // precedes the seek key, but may spill into the next one.
        let start = self.seek_block(&seek);
        for index in start..(start + 2).min(self.index.len()) {
            let entries = self.block_entries(index).await?;
            let at = entries.partition_point(|(key, _)| key.as_slice() < seek.as_slice());
            if let Some((key, value)) = entries.get(at) {
                let (found, _) = parse_internal_key(key)?;
                if found == user_key {
                    return Ok(Some(value.clone()));
                }
                return Ok(None);
            }
            // Seek key is past this block's last entry; try the next block.
        }
        Ok(None)
    }

    /// Cursor over the table's entries starting at `start` (internal key).
    pub fn scan_from(self: &Arc<Self>, start: Vec<u8>) -> TableScanner {
        TableScanner {
            table: Arc::clone(self),
            next_block: self.seek_block(&start),
            buffered: VecDeque::new(),
            start,
            primed: false,
        }
    }
}

/// Pull-based cursor over one table, loading data blocks on demand.
pub struct TableScanner {
    table: Arc<Table>,
    next_block: usize,
    buffered: VecDeque<(Vec<u8>, ValueStruct)>,
    start: Vec<u8>,
    primed: bool,
}

impl TableScanner {
    pub async fn next(&mut self) -> Result<Option<(Vec<u8>, ValueStruct)>> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Ok(Some(item));
            }
            if self.next_block >= self.table.index.len() {
                return Ok(None);
            }
            let mut entries = self.table.block_entries(self.next_block).await?;
            self.next_block += 1;
            if !self.primed {
                self.primed = true;
                entries.retain(|(key, _)| key.as_slice() >= self.start.as_slice());
            }
            self.buffered = entries.into();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{MemStreamClient, StreamBlockReader};

    fn value(bytes: &[u8]) -> ValueStruct {
        ValueStruct {
            value: bytes.to_vec(),
            ..Default::default()
        }
    }

    async fn build_test_table(
        count: usize,
    ) -> Result<(Arc<dyn StreamClient>, Arc<Table>)> {
        let stream: Arc<dyn StreamClient> = Arc::new(MemStreamClient::new("sst").await?);

        let entries: Vec<(Vec<u8>, ValueStruct)> = (0..count)
            .map(|i| {
                (
                    key_with_version(format!("key_{i:04}").as_bytes(), 1),
                    value(format!("value_{i:04}").as_bytes()),
                )
            })
            .collect();

        let info = build_table(stream.as_ref(), &entries).await?;
        let reader = Arc::new(StreamBlockReader::new(Arc::clone(&stream)));
        let table = Arc::new(Table::open(reader, info).await?);
        Ok((stream, table))
    }

    #[tokio::test]
    async fn test_build_and_get() -> Result<()> {
        let (_stream, table) = build_test_table(500).await?;
        assert_eq!(table.entry_count(), 500);
        assert!(table.index.len() > 1, "expected multiple data blocks");

        for i in [0usize, 1, 250, 498, 499] {
            let key = format!("key_{i:04}");
            let found = table
                .get(key.as_bytes(), 0)
                .await?
                .unwrap_or_else(|| panic!("missing {key}"));
            assert_eq!(found.value, format!("value_{i:04}").as_bytes());
        }
        assert!(table.get(b"key_9999", 0).await?.is_none());
        assert!(table.get(b"absent", 0).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_key_range() -> Result<()> {
        let (_stream, table) = build_test_table(10).await?;
        assert_eq!(table.info.smallest, b"key_0000");
        assert_eq!(table.info.biggest, b"key_0009");
        assert!(table.contains(b"key_0005"));
        assert!(!table.contains(b"zzz"));
        Ok(())
    }

    #[tokio::test]
    async fn test_versions_in_table() -> Result<()> {
        let stream: Arc<dyn StreamClient> = Arc::new(MemStreamClient::new("sst").await?);

        // Two versions of one key, newest first in internal-key order.
        let entries = vec![
            (key_with_version(b"key", 7), value(b"new")),
            (key_with_version(b"key", 3), value(b"old")),
        ];
        let info = build_table(stream.as_ref(), &entries).await?;
        assert_eq!(info.max_version, 7);

        let reader = Arc::new(StreamBlockReader::new(Arc::clone(&stream)));
        let table = Table::open(reader, info).await?;

        assert_eq!(table.get(b"key", 0).await?.unwrap().value, b"new");
        assert_eq!(table.get(b"key", 5).await?.unwrap().value, b"old");
        assert_eq!(table.get(b"key", 2).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_scanner_walks_whole_table() -> Result<()> {
        let (_stream, table) = build_test_table(300).await?;

        let mut scanner = table.scan_from(key_with_version(b"key_0100", u64::MAX));
        let mut count = 0;
        let mut last: Option<Vec<u8>> = None;
        while let Some((key, _)) = scanner.next().await? {
            if let Some(prev) = &last {
                assert!(*prev < key, "scanner out of order");
            }
            last = Some(key);
            count += 1;
        }
        assert_eq!(count, 200);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_index_detected() -> Result<()> {
        let stream: Arc<dyn StreamClient> = Arc::new(MemStreamClient::new("sst").await?);
        let entries = vec![(key_with_version(b"k", 1), value(b"v"))];
        let info = build_table(stream.as_ref(), &entries).await?;

        // A checksum over garbage fails decode.
        let mut payload = encode_index(&[], b"a", b"b", 1, 1);
        let len = payload.len();
        payload[len - 5] ^= 0xff;
        assert!(decode_index(&payload).is_err());

        // The real index still opens.
        let reader = Arc::new(StreamBlockReader::new(Arc::clone(&stream)));
        assert!(Table::open(reader, info).await.is_ok());
        Ok(())
    }
}
