//! The extent node surface: the operations a storage node exposes for the
//! extents it hosts. `LocalExtentService` is the in-process implementation
//! over a locked store directory; a network transport would implement the
//! same trait on the client side.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::block::Block;
use crate::error::Result;
use crate::extent::{Extent, ReadBatch};
use crate::flock::FileLock;

#[async_trait]
pub trait ExtentService: Send + Sync {
    /// Creates a local extent file with the given id. Idempotent.
    async fn alloc_extent(&self, id: u64) -> Result<()>;

    /// Appends blocks to the extent. Secondaries pass `expected` to guard
    /// against divergence.
    async fn append(
        &self,
        id: u64,
        blocks: &[Block],
        expected: Option<u32>,
    ) -> Result<(Vec<u32>, u32)>;

    /// Atomic snapshot of the extent's commit length.
    async fn commit_length(&self, id: u64) -> Result<u32>;

    /// Seals the extent at the given commit length.
    async fn seal(&self, id: u64, at: u32) -> Result<()>;

    /// Reads blocks by offset.
    async fn read_blocks(
        &self,
        id: u64,
        offset: u32,
        max_blocks: u32,
        max_bytes: u32,
    ) -> Result<ReadBatch>;
}

/// An extent node serving extents from one exclusively-owned directory.
pub struct LocalExtentService {
    dir: PathBuf,
    _lock: FileLock,
    extents: RwLock<HashMap<u64, Arc<Extent>>>,
}

const LOCK_FILE: &str = "node.lock";

impl LocalExtentService {
    /// Opens (or creates) a store directory, locking it against other
    /// processes and recovering any extents found inside.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let lock = FileLock::lock(dir.join(LOCK_FILE))?;

        let mut extents = HashMap::new();
        for dirent in std::fs::read_dir(&dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ext") {
                continue;
            }
            let extent = Extent::open(&path)?;
            tracing::debug!(
                extent = extent.id(),
                commit_length = extent.commit_length(),
                sealed = extent.is_sealed(),
                "opened extent"
            );
            extents.insert(extent.id(), Arc::new(extent));
        }

        tracing::info!(dir = %dir.display(), extents = extents.len(), "extent node open");
        Ok(Self {
            dir,
            _lock: lock,
            extents: RwLock::new(extents),
        })
    }

    fn extent(&self, id: u64) -> Result<Arc<Extent>> {
        self.extents
            .read()?
            .get(&id)
            .cloned()
            .ok_or_else(|| crate::Error::InvalidInput(format!("no such extent {id}")))
    }

    fn extent_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.ext"))
    }
}

#[async_trait]
impl ExtentService for LocalExtentService {
    async fn alloc_extent(&self, id: u64) -> Result<()> {
        let mut extents = self.extents.write()?;
        if extents.contains_key(&id) {
            return Ok(());
        }
        let extent = Extent::create(self.extent_path(id), id)?;
        extents.insert(id, Arc::new(extent));
        Ok(())
    }

    async fn append(
        &self,
        id: u64,
        blocks: &[Block],
        expected: Option<u32>,
    ) -> Result<(Vec<u32>, u32)> {
        self.extent(id)?.append(blocks, expected)
    }

    async fn commit_length(&self, id: u64) -> Result<u32> {
        Ok(self.extent(id)?.commit_length())
    }

    async fn seal(&self, id: u64, at: u32) -> Result<()> {
        self.extent(id)?.seal(at)
    }

    async fn read_blocks(
        &self,
        id: u64,
        offset: u32,
        max_blocks: u32,
        max_bytes: u32,
    ) -> Result<ReadBatch> {
        self.extent(id)?.read_blocks(offset, max_blocks, max_bytes)
    }
}
