//! Control-plane interfaces consumed by the core, plus in-memory
//! implementations.
//!
//! The real control plane keeps stream→extents and extent→nodes metadata in
//! a replicated consensus store; the core only ever talks to it through
//! these traits, during seal/allocate and on startup. `MemAllocator` runs
//! the same seal-reconciliation protocol over a fixed node set and is what
//! tests and embedded deployments use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::errinput;
use crate::Error;

use super::replica::ReplicationGroup;
use super::service::ExtentService;

/// Replica set for one extent.
#[derive(Clone)]
pub struct ExtentInfo {
    pub extent_id: u64,
    pub replicas: Vec<Arc<dyn ExtentService>>,
}

impl ExtentInfo {
    pub fn group(&self, rpc_timeout: Duration) -> ReplicationGroup {
        ReplicationGroup::new(self.extent_id, self.replicas.clone(), rpc_timeout)
    }
}

/// The ordered extent list of one stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub stream_id: u64,
    pub extent_ids: Vec<u64>,
}

#[async_trait]
pub trait ExtentAllocator: Send + Sync {
    /// Atomically registers a new stream with one initial extent.
    async fn create_stream(&self) -> Result<(StreamInfo, ExtentInfo)>;

    /// Looks up a stream's current extent list.
    async fn stream_info(&self, stream_id: u64) -> Result<StreamInfo>;

    /// Seals the given tail extent via commit-length reconciliation and
    /// registers a successor.
    async fn alloc_extent(&self, stream_id: u64, sealing_extent_id: u64) -> Result<ExtentInfo>;

    /// Looks up replica sets for arbitrary extents.
    async fn extent_info(&self, ids: &[u64]) -> Result<HashMap<u64, ExtentInfo>>;

    /// Drops a prefix from the stream's extent list, returning the removed
    /// extent ids so the caller can garbage-collect them.
    async fn truncate(&self, stream_id: u64, first_to_keep: u64) -> Result<Vec<u64>>;
}

/// Metadata of one flushed SST, as recorded with the partition manager.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Location of the table's index block on the row stream.
    pub index_extent: u64,
    pub index_offset: u32,
    pub smallest: Vec<u8>,
    pub biggest: Vec<u8>,
    /// Highest entry version in the table; recovery resumes versioning
    /// above it.
    pub max_version: u64,
}

#[async_trait]
pub trait PartitionManager: Send + Sync {
    /// Records a flushed table. Tables are listed back in record order.
    async fn record_table(&self, table: TableInfo) -> Result<()>;

    async fn tables(&self) -> Result<Vec<TableInfo>>;
}

/// In-memory partition manager.
#[derive(Default)]
pub struct MemPartitionManager {
    tables: RwLock<Vec<TableInfo>>,
}

impl MemPartitionManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PartitionManager for MemPartitionManager {
    async fn record_table(&self, table: TableInfo) -> Result<()> {
        self.tables.write()?.push(table);
        Ok(())
    }

    async fn tables(&self) -> Result<Vec<TableInfo>> {
        Ok(self.tables.read()?.clone())
    }
}

const REPLICATION_FACTOR: usize = 3;

struct AllocState {
    streams: HashMap<u64, Vec<u64>>,
    extent_nodes: HashMap<u64, Vec<usize>>,
    next_stream_id: u64,
    next_extent_id: u64,
}

/// Allocator over a fixed set of extent nodes. Picks up to three replicas
/// per extent, rotating through the node set.
pub struct MemAllocator {
    nodes: Vec<Arc<dyn ExtentService>>,
    rpc_timeout: Duration,
    state: Mutex<AllocState>,
}

impl MemAllocator {
    pub fn new(nodes: Vec<Arc<dyn ExtentService>>, rpc_timeout: Duration) -> Self {
        assert!(!nodes.is_empty());
        Self {
            nodes,
            rpc_timeout,
            state: Mutex::new(AllocState {
                streams: HashMap::new(),
                extent_nodes: HashMap::new(),
                next_stream_id: 1,
                next_extent_id: 1,
            }),
        }
    }

    fn pick_replicas(&self, extent_id: u64) -> Vec<usize> {
        let count = self.nodes.len().min(REPLICATION_FACTOR);
        (0..count)
            .map(|i| (extent_id as usize + i) % self.nodes.len())
            .collect()
    }

    fn info_for(&self, extent_id: u64, node_indices: &[usize]) -> ExtentInfo {
        ExtentInfo {
            extent_id,
            replicas: node_indices
                .iter()
                .map(|&i| Arc::clone(&self.nodes[i]))
                .collect(),
        }
    }

    /// Creates the extent on each chosen node and registers it.
    async fn register_extent(&self, stream_id: u64, extent_id: u64) -> Result<ExtentInfo> {
        let node_indices = self.pick_replicas(extent_id);
        let info = self.info_for(extent_id, &node_indices);
        for replica in &info.replicas {
            replica.alloc_extent(extent_id).await?;
        }

        let mut state = self.state.lock()?;
        state.extent_nodes.insert(extent_id, node_indices);
        state
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| Error::InvalidInput(format!("no such stream {stream_id}")))?
            .push(extent_id);
        Ok(info)
    }
}

#[async_trait]
impl ExtentAllocator for MemAllocator {
    async fn create_stream(&self) -> Result<(StreamInfo, ExtentInfo)> {
        let (stream_id, extent_id) = {
            let mut state = self.state.lock()?;
            let stream_id = state.next_stream_id;
            state.next_stream_id += 1;
            let extent_id = state.next_extent_id;
            state.next_extent_id += 1;
            state.streams.insert(stream_id, Vec::new());
            (stream_id, extent_id)
        };

        let info = self.register_extent(stream_id, extent_id).await?;
        tracing::info!(stream = stream_id, extent = extent_id, "created stream");
        Ok((
            StreamInfo {
                stream_id,
                extent_ids: vec![extent_id],
            },
            info,
        ))
    }

    async fn stream_info(&self, stream_id: u64) -> Result<StreamInfo> {
        let state = self.state.lock()?;
        let extent_ids = state
            .streams
            .get(&stream_id)
            .ok_or_else(|| Error::InvalidInput(format!("no such stream {stream_id}")))?
            .clone();
        Ok(StreamInfo {
            stream_id,
            extent_ids,
        })
    }

    async fn alloc_extent(&self, stream_id: u64, sealing_extent_id: u64) -> Result<ExtentInfo> {
        // The tail to seal must match what the caller believes it is.
        let sealing_nodes = {
            let state = self.state.lock()?;
            let extents = state
                .streams
                .get(&stream_id)
                .ok_or_else(|| Error::InvalidInput(format!("no such stream {stream_id}")))?;
            match extents.last() {
                Some(&tail) if tail == sealing_extent_id => {
                    state.extent_nodes[&sealing_extent_id].clone()
                }
                Some(&tail) => {
                    return errinput!("extent to seal {sealing_extent_id} is not the tail {tail}")
                }
                None => return errinput!("stream {stream_id} has no extents"),
            }
        };

        let group = self
            .info_for(sealing_extent_id, &sealing_nodes)
            .group(self.rpc_timeout);
        group.reconcile_seal().await?;

        let extent_id = {
            let mut state = self.state.lock()?;
            let id = state.next_extent_id;
            state.next_extent_id += 1;
            id
        };
        let info = self.register_extent(stream_id, extent_id).await?;
        tracing::info!(
            stream = stream_id,
            sealed = sealing_extent_id,
            extent = extent_id,
            "allocated successor extent"
        );
        Ok(info)
    }

    async fn extent_info(&self, ids: &[u64]) -> Result<HashMap<u64, ExtentInfo>> {
        let state = self.state.lock()?;
        let mut out = HashMap::with_capacity(ids.len());
        for &id in ids {
            let nodes = state
                .extent_nodes
                .get(&id)
                .ok_or_else(|| Error::InvalidInput(format!("no such extent {id}")))?;
            out.insert(id, self.info_for(id, nodes));
        }
        Ok(out)
    }

    async fn truncate(&self, stream_id: u64, first_to_keep: u64) -> Result<Vec<u64>> {
        let mut state = self.state.lock()?;
        let extents = state
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| Error::InvalidInput(format!("no such stream {stream_id}")))?;
        let keep_at = extents
            .iter()
            .position(|&id| id == first_to_keep)
            .ok_or_else(|| {
                Error::InvalidInput(format!("extent {first_to_keep} not in stream {stream_id}"))
            })?;
        let dropped: Vec<u64> = extents.drain(..keep_at).collect();
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, SECTOR_SIZE};
    use crate::cluster::service::LocalExtentService;
    use crate::tmpfs::TempDir;

    fn allocator(dirs: &[TempDir]) -> MemAllocator {
        let nodes: Vec<Arc<dyn ExtentService>> = dirs
            .iter()
            .map(|d| {
                Arc::new(LocalExtentService::open(d.path()).expect("Failed to open node"))
                    as Arc<dyn ExtentService>
            })
            .collect();
        MemAllocator::new(nodes, Duration::from_secs(1))
    }

    fn test_block(byte: u8) -> Block {
        Block::new(vec![byte; SECTOR_SIZE]).unwrap()
    }

    #[tokio::test]
    async fn test_create_stream_registers_initial_extent() -> Result<()> {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let allocator = allocator(&dirs);

        let (stream, extent) = allocator.create_stream().await?;
        assert_eq!(stream.extent_ids, vec![extent.extent_id]);
        assert_eq!(extent.replicas.len(), 3);

        let info = allocator.stream_info(stream.stream_id).await?;
        assert_eq!(info.extent_ids, stream.extent_ids);
        Ok(())
    }

    #[tokio::test]
    async fn test_alloc_extent_seals_tail_first() -> Result<()> {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let allocator = allocator(&dirs);

        let (stream, first) = allocator.create_stream().await?;
        let group = first.group(Duration::from_secs(1));
        group.append(Arc::new(vec![test_block(1)])).await?;

        let second = allocator
            .alloc_extent(stream.stream_id, first.extent_id)
            .await?;
        assert_ne!(second.extent_id, first.extent_id);

        // The old tail is sealed everywhere.
        for replica in &first.replicas {
            assert!(matches!(
                replica.append(first.extent_id, &[test_block(2)], None).await,
                Err(Error::Sealed)
            ));
        }

        let info = allocator.stream_info(stream.stream_id).await?;
        assert_eq!(info.extent_ids, vec![first.extent_id, second.extent_id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_alloc_extent_rejects_stale_tail() -> Result<()> {
        let dirs = [TempDir::new().unwrap()];
        let allocator = allocator(&dirs);

        let (stream, first) = allocator.create_stream().await?;
        let second = allocator
            .alloc_extent(stream.stream_id, first.extent_id)
            .await?;

        // Sealing the already-replaced tail again is refused.
        assert!(allocator
            .alloc_extent(stream.stream_id, first.extent_id)
            .await
            .is_err());
        // Sealing the current tail works.
        assert!(allocator
            .alloc_extent(stream.stream_id, second.extent_id)
            .await
            .is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_truncate_drops_prefix() -> Result<()> {
        let dirs = [TempDir::new().unwrap()];
        let allocator = allocator(&dirs);

        let (stream, first) = allocator.create_stream().await?;
        let second = allocator
            .alloc_extent(stream.stream_id, first.extent_id)
            .await?;
        let third = allocator
            .alloc_extent(stream.stream_id, second.extent_id)
            .await?;

        let dropped = allocator
            .truncate(stream.stream_id, third.extent_id)
            .await?;
        assert_eq!(dropped, vec![first.extent_id, second.extent_id]);

        let info = allocator.stream_info(stream.stream_id).await?;
        assert_eq!(info.extent_ids, vec![third.extent_id]);
        Ok(())
    }
}
