//! Lazy iteration over a stream's entries.
//!
//! The iterator's state is `(current_extent_index, current_offset)` over a
//! snapshot of the stream's extent list. `EndOfExtent` advances to the next
//! extent at offset zero; `EndOfStream` terminates.
//!
//! Two modes exist. Replay returns full entries, with separated large
//! values reduced to their pointer (value bytes stay in the stream; the
//! pointer bit and original length are preserved). GC returns, per block,
//! just enough to decide reclamation: the pointer for a large-value block,
//! an empty entry with the block's reclaimable size otherwise.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::entry::{unpack_entries, EntryInfo, BIT_VALUE_POINTER};
use crate::error::Result;
use crate::Error;

use super::{ReadOption, StreamClient};

pub struct LogEntryIter {
    client: Arc<dyn StreamClient>,
    extent_ids: Vec<u64>,
    index: usize,
    offset: u32,
    replay: bool,
    value_threshold: usize,
    pending: VecDeque<EntryInfo>,
    done: bool,
}

const READ_MAX_BLOCKS: u32 = 32;
const READ_MAX_BYTES: u32 = 4 * 1024 * 1024;

impl LogEntryIter {
    pub fn new(client: Arc<dyn StreamClient>, opt: ReadOption) -> Result<Self> {
        let extent_ids = client.extent_ids();
        let (index, offset) = match opt.from {
            Some((extent_id, offset)) => {
                let index = extent_ids
                    .iter()
                    .position(|&id| id == extent_id)
                    .ok_or_else(|| {
                        Error::InvalidInput(format!("extent {extent_id} not in stream"))
                    })?;
                (index, offset)
            }
            None => (0, 0),
        };

        Ok(Self {
            client,
            done: index >= extent_ids.len(),
            extent_ids,
            index,
            offset,
            replay: opt.replay,
            value_threshold: opt.value_threshold,
            pending: VecDeque::new(),
        })
    }

    /// The iterator's current `(extent_id, offset)` cursor. After a failed
    /// `next_entry` this is the first position that did not read back
    /// intact.
    pub fn position(&self) -> Option<(u64, u32)> {
        self.extent_ids.get(self.index).map(|&id| (id, self.offset))
    }

    /// Returns the next entry, or `None` at the end of the stream.
    pub async fn next_entry(&mut self) -> Result<Option<EntryInfo>> {
        loop {
            if let Some(info) = self.pending.pop_front() {
                return Ok(Some(info));
            }
            if self.done {
                return Ok(None);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let extent_id = self.extent_ids[self.index];
        match self
            .client
            .read_extent(extent_id, self.offset, READ_MAX_BLOCKS, READ_MAX_BYTES)
            .await
        {
            Ok(batch) => {
                for (block, block_offset) in batch.blocks.iter().zip(&batch.offsets) {
                    self.decode_block(extent_id, *block_offset, block)?;
                }
                self.offset = batch.next_offset;
            }
            Err(Error::EndOfExtent) => {
                self.index += 1;
                self.offset = 0;
                if self.index >= self.extent_ids.len() {
                    self.done = true;
                }
            }
            Err(Error::EndOfStream) => self.done = true,
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn decode_block(
        &mut self,
        extent_id: u64,
        offset: u32,
        block: &crate::block::Block,
    ) -> Result<()> {
        let entries = unpack_entries(block)?;
        let reclaimable = block.frame_len() as u64;

        if !self.replay {
            // GC mode judges whole blocks.
            let large = entries.len() == 1 && entries[0].value.len() > self.value_threshold;
            let info = if large {
                let mut entry = entries.into_iter().next().unwrap();
                let value_len = entry.value.len() as u32;
                entry.meta |= BIT_VALUE_POINTER;
                entry.value = Vec::new();
                EntryInfo {
                    entry,
                    extent_id,
                    offset,
                    value_len,
                    estimated_size: reclaimable,
                }
            } else {
                EntryInfo {
                    entry: Default::default(),
                    extent_id,
                    offset,
                    value_len: 0,
                    estimated_size: reclaimable,
                }
            };
            self.pending.push_back(info);
            return Ok(());
        }

        for mut entry in entries {
            let value_len = entry.value.len() as u32;
            let estimated_size;
            if entry.value.len() > self.value_threshold {
                // The value stays in the stream; replay reinstates a pointer.
                entry.meta |= BIT_VALUE_POINTER;
                entry.value = Vec::new();
                estimated_size = reclaimable;
            } else {
                estimated_size = entry.encoded_len() as u64;
            }
            self.pending.push_back(EntryInfo {
                entry,
                extent_id,
                offset,
                value_len,
                estimated_size,
            });
        }
        Ok(())
    }
}
