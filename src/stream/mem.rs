//! Single-node stream client for tests and embedded use.
//!
//! Backed by real extents in a scratch directory behind the same
//! [`StreamClient`] machinery as production, so everything above the stream
//! layer exercises the full append/seal/recover path.

use std::sync::Arc;

use async_trait::async_trait;

use crate::block::Block;
use crate::cluster::{ExtentService, LocalExtentService, MemAllocator};
use crate::config::StreamConfig;
use crate::entry::Entry;
use crate::error::Result;
use crate::extent::ReadBatch;
use crate::tmpfs::TempDir;

use super::{AppendedEntries, ReplicatedStream, StreamClient};

pub struct MemStreamClient {
    _dir: TempDir,
    inner: Arc<ReplicatedStream>,
}

impl MemStreamClient {
    /// Creates a fresh single-replica stream in a scratch directory.
    pub async fn new(name: &str) -> Result<Self> {
        let dir = TempDir::new()?;
        let node: Arc<dyn ExtentService> =
            Arc::new(LocalExtentService::open(dir.path().join(name))?);
        let config = StreamConfig::default();
        let allocator = Arc::new(MemAllocator::new(vec![node], config.rpc_timeout));
        let inner = Arc::new(ReplicatedStream::create(allocator, config).await?);
        Ok(Self { _dir: dir, inner })
    }
}

#[async_trait]
impl StreamClient for MemStreamClient {
    fn stream_id(&self) -> u64 {
        self.inner.stream_id()
    }

    fn extent_ids(&self) -> Vec<u64> {
        self.inner.extent_ids()
    }

    async fn append(&self, blocks: Vec<Block>) -> Result<(u64, Vec<u32>, u32)> {
        self.inner.append(blocks).await
    }

    async fn append_entries(
        &self,
        entries: &[Entry],
        value_threshold: usize,
    ) -> Result<AppendedEntries> {
        self.inner.append_entries(entries, value_threshold).await
    }

    async fn read_extent(
        &self,
        extent_id: u64,
        offset: u32,
        max_blocks: u32,
        max_bytes: u32,
    ) -> Result<ReadBatch> {
        self.inner
            .read_extent(extent_id, offset, max_blocks, max_bytes)
            .await
    }

    async fn seal_tail(&self, extent_id: u64, at: u32) -> Result<()> {
        self.inner.seal_tail(extent_id, at).await
    }

    async fn truncate(&self, first_to_keep: u64) -> Result<Vec<u64>> {
        self.inner.truncate(first_to_keep).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::SECTOR_SIZE;
    use crate::stream::{BlockReader, StreamBlockReader};

    fn test_block(byte: u8) -> Block {
        Block::new(vec![byte; SECTOR_SIZE]).unwrap()
    }

    #[tokio::test]
    async fn test_append_read_blocks() -> Result<()> {
        let client = MemStreamClient::new("log").await?;

        let block = test_block(0x41);
        let (extent_id, offsets, _) = client.append(vec![block.clone()]).await?;

        let batch = client.read_extent(extent_id, offsets[0], 1, u32::MAX).await?;
        assert_eq!(batch.blocks[0].data, block.data);
        Ok(())
    }

    #[tokio::test]
    async fn test_block_reader_reads_one() -> Result<()> {
        let client: Arc<dyn StreamClient> = Arc::new(MemStreamClient::new("log").await?);

        let (extent_id, offsets, _) = client
            .append(vec![test_block(1), test_block(2)])
            .await?;

        let reader = StreamBlockReader::new(Arc::clone(&client));
        let block = reader.read_block(extent_id, offsets[1]).await?;
        assert_eq!(block.data, vec![2u8; SECTOR_SIZE]);
        Ok(())
    }

    #[tokio::test]
    async fn test_truncate_splits_stream() -> Result<()> {
        let client: Arc<dyn StreamClient> = Arc::new(MemStreamClient::new("log").await?);

        // Roll the stream a couple of times.
        for byte in 0..3u8 {
            let (extent_id, _, tail) = client.append(vec![test_block(byte)]).await?;
            client.seal_tail(extent_id, tail).await?;
        }
        client.append(vec![test_block(9)]).await?;

        let extents = client.extent_ids();
        assert!(extents.len() >= 3);

        let keep = extents[extents.len() - 2];
        let dropped = client.truncate(keep).await?;
        assert_eq!(dropped, extents[..extents.len() - 2].to_vec());
        assert_eq!(client.extent_ids().first(), Some(&keep));
        Ok(())
    }
}
