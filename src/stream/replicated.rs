//! Production stream client over replicated extent groups.
//!
//! State is the ordered extent list plus a cached map from extent id to its
//! replication group. Appends go to the tail extent's primary; on `Sealed`,
//! `AppendFailed`, or `OffsetMismatch` the client asks the allocator to seal
//! the tail at the reconciled commit length and register a successor, then
//! retries on the fresh extent. Readers snapshot the extent list and route
//! to any replica.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::block::Block;
use crate::cluster::{ExtentAllocator, ReplicationGroup};
use crate::config::StreamConfig;
use crate::entry::{pack_entries, Entry};
use crate::error::Result;
use crate::extent::ReadBatch;
use crate::Error;

use super::{AppendedEntries, EntryLocation, StreamClient};

struct StreamState {
    extent_ids: Vec<u64>,
    groups: HashMap<u64, Arc<ReplicationGroup>>,
}

pub struct ReplicatedStream {
    stream_id: u64,
    allocator: Arc<dyn ExtentAllocator>,
    config: StreamConfig,
    state: RwLock<StreamState>,
    // One writer at a time: accepted-append order is tail-offset order is
    // byte order on disk.
    append_lock: tokio::sync::Mutex<()>,
}

impl ReplicatedStream {
    /// Registers a fresh stream with the allocator.
    pub async fn create(
        allocator: Arc<dyn ExtentAllocator>,
        config: StreamConfig,
    ) -> Result<Self> {
        let (info, extent) = allocator.create_stream().await?;
        let mut groups = HashMap::new();
        groups.insert(
            extent.extent_id,
            Arc::new(extent.group(config.rpc_timeout)),
        );
        Ok(Self {
            stream_id: info.stream_id,
            allocator,
            config,
            state: RwLock::new(StreamState {
                extent_ids: info.extent_ids,
                groups,
            }),
            append_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Opens an existing stream, resolving every extent's replica set.
    pub async fn open(
        allocator: Arc<dyn ExtentAllocator>,
        stream_id: u64,
        config: StreamConfig,
    ) -> Result<Self> {
        let info = allocator.stream_info(stream_id).await?;
        let extents = allocator.extent_info(&info.extent_ids).await?;
        let mut groups = HashMap::new();
        for (id, extent) in extents {
            groups.insert(id, Arc::new(extent.group(config.rpc_timeout)));
        }
        Ok(Self {
            stream_id,
            allocator,
            config,
            state: RwLock::new(StreamState {
                extent_ids: info.extent_ids,
                groups,
            }),
            append_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn tail_group(&self) -> Result<Arc<ReplicationGroup>> {
        let state = self.state.read()?;
        let tail = *state
            .extent_ids
            .last()
            .ok_or_else(|| Error::InvalidData("stream has no extents".to_string()))?;
        Ok(Arc::clone(&state.groups[&tail]))
    }

    async fn group(&self, extent_id: u64) -> Result<Arc<ReplicationGroup>> {
        if let Some(group) = self.state.read()?.groups.get(&extent_id) {
            return Ok(Arc::clone(group));
        }
        let mut info = self.allocator.extent_info(&[extent_id]).await?;
        let extent = info
            .remove(&extent_id)
            .ok_or_else(|| Error::InvalidInput(format!("no such extent {extent_id}")))?;
        let group = Arc::new(extent.group(self.config.rpc_timeout));
        self.state
            .write()?
            .groups
            .insert(extent_id, Arc::clone(&group));
        Ok(group)
    }

    /// Seals the current tail and installs the allocated successor.
    async fn roll_tail(&self, sealing: u64) -> Result<()> {
        let extent = self.allocator.alloc_extent(self.stream_id, sealing).await?;
        let group = Arc::new(extent.group(self.config.rpc_timeout));
        let mut state = self.state.write()?;
        state.extent_ids.push(extent.extent_id);
        state.groups.insert(extent.extent_id, group);
        tracing::info!(
            stream = self.stream_id,
            sealed = sealing,
            extent = extent.extent_id,
            "stream rolled to fresh extent"
        );
        Ok(())
    }
}

#[async_trait]
impl StreamClient for ReplicatedStream {
    fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn extent_ids(&self) -> Vec<u64> {
        self.state.read().unwrap().extent_ids.clone()
    }

    async fn append(&self, blocks: Vec<Block>) -> Result<(u64, Vec<u32>, u32)> {
        let _guard = self.append_lock.lock().await;
        let blocks = Arc::new(blocks);

        for attempt in 0..=self.config.max_append_retries {
            let group = self.tail_group()?;
            match group.append(Arc::clone(&blocks)).await {
                Ok((offsets, tail)) => return Ok((group.extent_id(), offsets, tail)),
                Err(Error::Sealed | Error::AppendFailed | Error::OffsetMismatch { .. }) => {
                    tracing::warn!(
                        stream = self.stream_id,
                        extent = group.extent_id(),
                        attempt,
                        "tail append failed, sealing and reallocating"
                    );
                    self.roll_tail(group.extent_id()).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::IO("stream append retries exhausted".to_string()))
    }

    async fn append_entries(
        &self,
        entries: &[Entry],
        value_threshold: usize,
    ) -> Result<AppendedEntries> {
        let (blocks, block_of) = pack_entries(entries, value_threshold)?;
        let (extent_id, offsets, tail) = self.append(blocks).await?;
        let locations = block_of
            .into_iter()
            .map(|index| EntryLocation {
                extent_id,
                offset: offsets[index],
            })
            .collect();
        Ok(AppendedEntries {
            extent_id,
            tail,
            locations,
        })
    }

    async fn read_extent(
        &self,
        extent_id: u64,
        offset: u32,
        max_blocks: u32,
        max_bytes: u32,
    ) -> Result<ReadBatch> {
        self.group(extent_id)
            .await?
            .read_blocks(offset, max_blocks, max_bytes)
            .await
    }

    async fn seal_tail(&self, extent_id: u64, at: u32) -> Result<()> {
        self.group(extent_id).await?.seal_at(at).await
    }

    async fn truncate(&self, first_to_keep: u64) -> Result<Vec<u64>> {
        let dropped = self
            .allocator
            .truncate(self.stream_id, first_to_keep)
            .await?;
        let mut state = self.state.write()?;
        state.extent_ids.retain(|id| !dropped.contains(id));
        for id in &dropped {
            state.groups.remove(id);
        }
        Ok(dropped)
    }
}
