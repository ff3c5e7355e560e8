//! Streams: ordered sequences of extents presented as one logical
//! append-only log.
//!
//! Two capability interfaces are load-bearing here: [`StreamClient`], the
//! append/read/seal surface of one stream, and [`BlockReader`], random read
//! of a single block by `(extent_id, offset)`. Production uses
//! [`replicated::ReplicatedStream`] over extent-node services;
//! [`mem::MemStreamClient`] backs tests and embedded use.

pub mod iter;
pub mod mem;
pub mod replicated;

use std::sync::Arc;

use async_trait::async_trait;

use crate::block::Block;
use crate::entry::Entry;
use crate::error::Result;
use crate::extent::ReadBatch;

pub use iter::LogEntryIter;
pub use mem::MemStreamClient;
pub use replicated::ReplicatedStream;

/// Where an appended entry landed: the block record holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub extent_id: u64,
    pub offset: u32,
}

/// Result of appending a batch of entries.
#[derive(Debug, Clone)]
pub struct AppendedEntries {
    pub extent_id: u64,
    pub tail: u32,
    /// Per input entry, the block record it was packed into.
    pub locations: Vec<EntryLocation>,
}

/// Options for iterating a stream's entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOption {
    /// Start position; `None` reads from the stream's head.
    pub from: Option<(u64, u32)>,
    /// Replay mode returns full entries (large values reduced to pointers);
    /// otherwise gc mode returns only reclaimable sizes and pointers.
    pub replay: bool,
    /// Threshold above which a value is treated as separated.
    pub value_threshold: usize,
}

impl ReadOption {
    pub fn from_start() -> Self {
        Self {
            value_threshold: 1024,
            ..Default::default()
        }
    }

    pub fn read_from(mut self, extent_id: u64, offset: u32) -> Self {
        self.from = Some((extent_id, offset));
        self
    }

    pub fn with_replay(mut self) -> Self {
        self.replay = true;
        self
    }

    pub fn value_threshold(mut self, bytes: usize) -> Self {
        self.value_threshold = bytes;
        self
    }
}

#[async_trait]
pub trait StreamClient: Send + Sync {
    fn stream_id(&self) -> u64;

    /// Snapshot of the stream's extent list, oldest first.
    fn extent_ids(&self) -> Vec<u64>;

    /// Appends blocks to the tail extent, transparently sealing it and
    /// continuing on a fresh extent when a replica misbehaves. Returns the
    /// extent the blocks landed on, their record offsets, and the tail.
    async fn append(&self, blocks: Vec<Block>) -> Result<(u64, Vec<u32>, u32)>;

    /// Serializes and packs entries into blocks, then appends them. Entries
    /// with values above `value_threshold` get a block of their own so a
    /// value pointer can address it.
    async fn append_entries(
        &self,
        entries: &[Entry],
        value_threshold: usize,
    ) -> Result<AppendedEntries>;

    /// Reads blocks from one extent of the stream. `EndOfExtent` and
    /// `EndOfStream` signal the iterator to advance or stop.
    async fn read_extent(
        &self,
        extent_id: u64,
        offset: u32,
        max_blocks: u32,
        max_bytes: u32,
    ) -> Result<ReadBatch>;

    /// Seals the given extent at a known-good offset on every reachable
    /// replica. Used after detecting corruption at replay.
    async fn seal_tail(&self, extent_id: u64, at: u32) -> Result<()>;

    /// Drops the extent prefix before `first_to_keep`, returning the removed
    /// extent ids.
    async fn truncate(&self, first_to_keep: u64) -> Result<Vec<u64>>;
}

/// Reads one block by `(extent_id, offset)` through a stream client.
#[async_trait]
pub trait BlockReader: Send + Sync {
    async fn read_block(&self, extent_id: u64, offset: u32) -> Result<Block>;
}

/// Blanket [`BlockReader`] over any stream client.
pub struct StreamBlockReader {
    client: Arc<dyn StreamClient>,
}

impl StreamBlockReader {
    pub fn new(client: Arc<dyn StreamClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlockReader for StreamBlockReader {
    async fn read_block(&self, extent_id: u64, offset: u32) -> Result<Block> {
        let mut batch = self.client.read_extent(extent_id, offset, 1, u32::MAX).await?;
        batch
            .blocks
            .pop()
            .ok_or_else(|| crate::Error::InvalidData(format!("no block at {extent_id}:{offset}")))
    }
}
