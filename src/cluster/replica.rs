//! Replication group: three extent replicas behind one logical extent.
//!
//! The first replica is the primary. An append goes to the primary without
//! an expected offset, then to both secondaries in parallel with
//! `expected = start`, which makes any divergence detectable immediately: a
//! secondary that is short or ahead refuses with `OffsetMismatch`, and the
//! group reports `AppendFailed` so the stream client seals this extent and
//! moves on.
//!
//! Seal reconciliation takes the minimum commit length over the reachable
//! replicas and seals each of them there, so no reader ever sees bytes that
//! are not durable on every live replica. Replicas unreachable during the
//! seal truncate themselves when the seal reaches them later.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::block::Block;
use crate::error::Result;
use crate::extent::ReadBatch;
use crate::Error;

use super::service::ExtentService;

pub struct ReplicationGroup {
    extent_id: u64,
    replicas: Vec<Arc<dyn ExtentService>>,
    rpc_timeout: Duration,
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::IO("rpc deadline exceeded".to_string())),
    }
}

impl ReplicationGroup {
    pub fn new(extent_id: u64, replicas: Vec<Arc<dyn ExtentService>>, rpc_timeout: Duration) -> Self {
        assert!(!replicas.is_empty());
        Self {
            extent_id,
            replicas,
            rpc_timeout,
        }
    }

    pub fn extent_id(&self) -> u64 {
        self.extent_id
    }

    fn primary(&self) -> &Arc<dyn ExtentService> {
        &self.replicas[0]
    }

    /// Primary-driven replicated append. Returns the record offsets and the
    /// new commit length once every replica has acknowledged.
    pub async fn append(&self, blocks: Arc<Vec<Block>>) -> Result<(Vec<u32>, u32)> {
        let (offsets, end) = with_deadline(
            self.rpc_timeout,
            self.primary().append(self.extent_id, blocks.as_slice(), None),
        )
        .await?;
        let start = offsets[0];

        let mut acks = Vec::new();
        for replica in self.replicas.iter().skip(1) {
            let replica = Arc::clone(replica);
            let blocks = Arc::clone(&blocks);
            let extent_id = self.extent_id;
            let deadline = self.rpc_timeout;
            acks.push(tokio::spawn(async move {
                with_deadline(
                    deadline,
                    replica.append(extent_id, blocks.as_slice(), Some(start)),
                )
                .await
            }));
        }

        let mut failed = false;
        for ack in acks {
            match ack.await {
                Ok(Ok((_, secondary_end))) if secondary_end == end => {}
                Ok(Ok((_, secondary_end))) => {
                    tracing::warn!(
                        extent = self.extent_id,
                        primary_end = end,
                        secondary_end,
                        "secondary commit length diverged"
                    );
                    failed = true;
                }
                Ok(Err(e)) => {
                    tracing::warn!(extent = self.extent_id, error = %e, "secondary append failed");
                    failed = true;
                }
                Err(e) => {
                    tracing::warn!(extent = self.extent_id, error = %e, "secondary append panicked");
                    failed = true;
                }
            }
        }

        // The primary has already advanced; a missing ack is repaired by
        // sealing this extent, never by retrying in place.
        if failed {
            return Err(Error::AppendFailed);
        }
        Ok((offsets, end))
    }

    /// Reads from the primary, falling back to any replica. End-of-data
    /// signals are returned as-is; only transport-level failures fall
    /// through to the next replica.
    pub async fn read_blocks(
        &self,
        offset: u32,
        max_blocks: u32,
        max_bytes: u32,
    ) -> Result<ReadBatch> {
        let mut last_err = Error::IO("no replicas".to_string());
        for replica in &self.replicas {
            match with_deadline(
                self.rpc_timeout,
                replica.read_blocks(self.extent_id, offset, max_blocks, max_bytes),
            )
            .await
            {
                Ok(batch) => return Ok(batch),
                Err(e @ (Error::EndOfExtent | Error::EndOfStream)) => return Err(e),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Per-replica commit lengths; `None` marks an unreachable replica.
    pub async fn commit_lengths(&self) -> Vec<Option<u32>> {
        let mut handles = Vec::new();
        for replica in &self.replicas {
            let replica = Arc::clone(replica);
            let extent_id = self.extent_id;
            let deadline = self.rpc_timeout;
            handles.push(tokio::spawn(async move {
                with_deadline(deadline, replica.commit_length(extent_id)).await
            }));
        }

        let mut lengths = Vec::with_capacity(handles.len());
        for handle in handles {
            lengths.push(match handle.await {
                Ok(Ok(len)) => Some(len),
                _ => None,
            });
        }
        lengths
    }

    /// Seals every reachable replica at a known offset, in parallel. At
    /// least one replica must acknowledge.
    pub async fn seal_at(&self, at: u32) -> Result<()> {
        let mut handles = Vec::new();
        for replica in &self.replicas {
            let replica = Arc::clone(replica);
            let extent_id = self.extent_id;
            let deadline = self.rpc_timeout;
            handles.push(tokio::spawn(async move {
                with_deadline(deadline, replica.seal(extent_id, at)).await
            }));
        }
        let mut sealed = 0usize;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => sealed += 1,
                Ok(Err(e)) => {
                    tracing::warn!(extent = self.extent_id, error = %e, "replica missed seal")
                }
                Err(e) => {
                    tracing::warn!(extent = self.extent_id, error = %e, "seal task panicked")
                }
            }
        }
        if sealed == 0 {
            return Err(Error::IO("no replica acknowledged seal".to_string()));
        }
        Ok(())
    }

    /// Seal reconciliation: pick the minimum commit length over the
    /// reachable replicas and seal each of them there, in parallel. Returns
    /// the agreed commit length.
    pub async fn reconcile_seal(&self) -> Result<u32> {
        let lengths = self.commit_lengths().await;
        let agreed = lengths
            .iter()
            .flatten()
            .copied()
            .min()
            .ok_or_else(|| Error::IO("no replica reachable for seal".to_string()))?;

        let mut handles = Vec::new();
        for (index, replica) in self.replicas.iter().enumerate() {
            if lengths[index].is_none() {
                continue;
            }
            let replica = Arc::clone(replica);
            let extent_id = self.extent_id;
            let deadline = self.rpc_timeout;
            handles.push(tokio::spawn(async move {
                with_deadline(deadline, replica.seal(extent_id, agreed)).await
            }));
        }
        for handle in handles {
            if let Ok(Err(e)) = handle.await {
                // A replica that missed its seal is stale; it truncates
                // itself when the seal reaches it on re-open.
                tracing::warn!(extent = self.extent_id, error = %e, "replica missed seal");
            }
        }

        tracing::info!(extent = self.extent_id, commit_length = agreed, "sealed extent group");
        Ok(agreed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::SECTOR_SIZE;
    use crate::cluster::service::LocalExtentService;
    use crate::tmpfs::TempDir;

    fn test_block(byte: u8) -> Block {
        Block::new(vec![byte; SECTOR_SIZE]).unwrap()
    }

    async fn three_replicas(dirs: &[TempDir; 3], extent_id: u64) -> ReplicationGroup {
        let mut replicas: Vec<Arc<dyn ExtentService>> = Vec::new();
        for dir in dirs {
            let node = LocalExtentService::open(dir.path()).expect("Failed to open node");
            node.alloc_extent(extent_id).await.expect("Failed to alloc");
            replicas.push(Arc::new(node));
        }
        ReplicationGroup::new(extent_id, replicas, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_replicated_append_reaches_all() {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let group = three_replicas(&dirs, 1).await;

        let blocks = Arc::new(vec![test_block(1), test_block(2)]);
        let (offsets, end) = group.append(blocks).await.expect("Append failed");
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets[0], 0);

        // Every replica holds the same bytes at the same commit length.
        assert_eq!(group.commit_lengths().await, vec![Some(end); 3]);
        for replica in &group.replicas {
            let batch = replica.read_blocks(1, 0, 16, u32::MAX).await.unwrap();
            assert_eq!(batch.blocks.len(), 2);
            assert_eq!(batch.blocks[1].data, vec![2u8; SECTOR_SIZE]);
        }
    }

    #[tokio::test]
    async fn test_diverged_secondary_fails_append() {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let group = three_replicas(&dirs, 1).await;

        // Push one replica ahead behind the group's back.
        group.replicas[2]
            .append(1, &[test_block(9)], None)
            .await
            .unwrap();

        let err = group
            .append(Arc::new(vec![test_block(1)]))
            .await
            .unwrap_err();
        assert_eq!(err, Error::AppendFailed);
    }

    #[tokio::test]
    async fn test_seal_reconciliation_takes_minimum() {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let group = three_replicas(&dirs, 1).await;

        // Two replicas at two blocks, the laggard at one.
        let blocks = Arc::new(vec![test_block(1)]);
        group.append(blocks).await.unwrap();
        let laggard_len = group.commit_lengths().await[2].unwrap();
        group.replicas[0]
            .append(1, &[test_block(2)], None)
            .await
            .unwrap();
        group.replicas[1]
            .append(1, &[test_block(2)], None)
            .await
            .unwrap();

        let agreed = group.reconcile_seal().await.expect("Seal failed");
        assert_eq!(agreed, laggard_len);

        // All replicas end at the same length, sealed.
        assert_eq!(group.commit_lengths().await, vec![Some(agreed); 3]);
        for replica in &group.replicas {
            assert!(matches!(
                replica.append(1, &[test_block(3)], None).await,
                Err(Error::Sealed)
            ));
        }
    }

    #[tokio::test]
    async fn test_single_replica_group() {
        let dir = TempDir::new().unwrap();
        let node = LocalExtentService::open(dir.path()).unwrap();
        node.alloc_extent(5).await.unwrap();
        let group = ReplicationGroup::new(5, vec![Arc::new(node)], Duration::from_secs(1));

        let (offsets, _) = group
            .append(Arc::new(vec![test_block(1)]))
            .await
            .expect("Append failed");
        assert_eq!(offsets, vec![0]);

        let batch = group.read_blocks(0, 1, u32::MAX).await.unwrap();
        assert_eq!(batch.blocks[0].data, vec![1u8; SECTOR_SIZE]);
    }
}
