//! The range partition: an LSM over two streams.
//!
//! Writes flow through the batcher onto the **log stream** and into the
//! mutable memtable, with values above the threshold left in the log and
//! referenced by pointer. Full memtables freeze into a bounded queue and
//! flush as SSTs onto the **row stream**. Reads consult the mutable
//! memtable, then frozen memtables newest first, then tables newest first.
//!
//! On open the partition loads its registered tables and replays the tail
//! of the log stream: entries already subsumed by a flush marker are
//! discarded, the rest rebuild memtables (large values reinstated as
//! pointers). A checksum failure during replay seals the log stream at the
//! last good offset and the partition continues; writes past the corruption
//! point were never acknowledged.

mod batcher;
mod flush;
pub mod memtable;
pub mod sst;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cluster::PartitionManager;
use crate::config::PartitionConfig;
use crate::entry::{
    unpack_entries, Entry, EntryInfo, ValuePointer, ValueStruct, BIT_VALUE_POINTER,
};
use crate::error::Result;
use crate::errdata;
use crate::stream::{
    BlockReader, EntryLocation, LogEntryIter, ReadOption, StreamBlockReader, StreamClient,
};
use crate::Error;

use batcher::WriteRequest;
use memtable::{MemCursor, MemTable};
use sst::{Table, TableScanner};

pub(crate) struct PartitionCore {
    config: PartitionConfig,
    log_stream: Arc<dyn StreamClient>,
    row_stream: Arc<dyn StreamClient>,
    log_reader: Arc<dyn BlockReader>,
    row_reader: Arc<dyn BlockReader>,
    pm: Arc<dyn PartitionManager>,

    active: RwLock<Arc<MemTable>>,
    frozen: RwLock<VecDeque<Arc<MemTable>>>,
    /// Readable tables, newest first.
    tables: RwLock<Vec<Arc<Table>>>,

    version: AtomicU64,
    closed: AtomicBool,
}

impl PartitionCore {
    pub(crate) fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn active(&self) -> Arc<MemTable> {
        Arc::clone(&self.active.read().unwrap())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The mutable memtable with room for one more insert, freezing and
    /// replacing it first when the budget would overflow. Blocking on the
    /// flush queue here is the write path's backpressure.
    pub(crate) async fn memtable_with_room(
        &self,
        user_key: &[u8],
        value: &ValueStruct,
        flush_tx: &mpsc::Sender<Arc<MemTable>>,
    ) -> Result<Arc<MemTable>> {
        let active = self.active();
        let cost = memtable::estimated_size(user_key, value);
        if active.is_empty() || active.size() + cost <= self.config.max_memtable_size {
            return Ok(active);
        }

        active.freeze();
        let fresh = Arc::new(MemTable::new(self.config.max_memtable_size));
        let old = {
            let mut guard = self.active.write()?;
            std::mem::replace(&mut *guard, Arc::clone(&fresh))
        };
        self.frozen.write()?.push_back(Arc::clone(&old));
        tracing::debug!(size = old.size(), entries = old.len(), "froze memtable");

        flush_tx
            .send(old)
            .await
            .map_err(|_| Error::IO("flush queue closed".to_string()))?;
        Ok(fresh)
    }

    pub(crate) fn publish_table(&self, table: Arc<Table>) {
        self.tables.write().unwrap().insert(0, table);
    }

    pub(crate) fn remove_frozen(&self, memtable: &Arc<MemTable>) {
        self.frozen
            .write()
            .unwrap()
            .retain(|m| !Arc::ptr_eq(m, memtable));
    }

    fn flush_queue_depth(&self) -> usize {
        self.config.max_frozen_memtables.max(1)
    }
}

pub struct RangePartition {
    core: Arc<PartitionCore>,
    write_tx: RwLock<Option<mpsc::Sender<WriteRequest>>>,
    flush_tx: Mutex<Option<mpsc::Sender<Arc<MemTable>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn deleted_or_expired(value: &ValueStruct) -> bool {
    value.is_delete() || (value.expires_at != 0 && value.expires_at <= now_secs())
}

impl RangePartition {
    /// Opens a partition over its two streams, recovering memtable state
    /// from the log stream's tail.
    pub async fn open(
        config: PartitionConfig,
        row_stream: Arc<dyn StreamClient>,
        log_stream: Arc<dyn StreamClient>,
        log_reader: Arc<dyn BlockReader>,
        pm: Arc<dyn PartitionManager>,
    ) -> Result<Self> {
        let row_reader: Arc<dyn BlockReader> =
            Arc::new(StreamBlockReader::new(Arc::clone(&row_stream)));

        let core = Arc::new(PartitionCore {
            active: RwLock::new(Arc::new(MemTable::new(config.max_memtable_size))),
            frozen: RwLock::new(VecDeque::new()),
            tables: RwLock::new(Vec::new()),
            version: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            config,
            log_stream,
            row_stream,
            log_reader,
            row_reader,
            pm,
        });

        // Registered tables, newest first.
        let mut max_version = 0u64;
        {
            let infos = core.pm.tables().await?;
            let mut tables = Vec::with_capacity(infos.len());
            for info in infos.into_iter().rev() {
                max_version = max_version.max(info.max_version);
                tables.push(Arc::new(
                    Table::open(Arc::clone(&core.row_reader), info).await?,
                ));
            }
            *core.tables.write()? = tables;
        }
        core.version.store(max_version, Ordering::SeqCst);

        let (flush_tx, flush_rx) = mpsc::channel(core.flush_queue_depth());
        let flusher = tokio::spawn(flush::run_flusher(Arc::clone(&core), flush_rx));

        Self::replay_log(&core, &flush_tx).await?;

        let (write_tx, write_rx) = mpsc::channel(core.config.write_queue_depth);
        let writer = tokio::spawn(batcher::run_writer(
            Arc::clone(&core),
            write_rx,
            flush_tx.clone(),
        ));

        Ok(Self {
            core,
            write_tx: RwLock::new(Some(write_tx)),
            flush_tx: Mutex::new(Some(flush_tx)),
            writer: Mutex::new(Some(writer)),
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Replays log entries not yet subsumed by a flush marker into fresh
    /// memtables.
    async fn replay_log(
        core: &Arc<PartitionCore>,
        flush_tx: &mpsc::Sender<Arc<MemTable>>,
    ) -> Result<()> {
        let mut iter = LogEntryIter::new(
            Arc::clone(&core.log_stream),
            ReadOption::from_start()
                .with_replay()
                .value_threshold(core.config.value_threshold),
        )?;

        // Buffer the tail, dropping everything a flush marker subsumes.
        let mut buffered: Vec<EntryInfo> = Vec::new();
        loop {
            match iter.next_entry().await {
                Ok(Some(info)) if info.entry.is_flush_marker() => {
                    let marker = ValuePointer::decode(&info.entry.value)?;
                    buffered.retain(|e| {
                        (e.extent_id, e.offset) > (marker.extent_id, marker.offset)
                    });
                }
                Ok(Some(info)) => buffered.push(info),
                Ok(None) => break,
                Err(Error::ChecksumMismatch | Error::InvalidData(_)) => {
                    // Unacknowledged torn tail: cap the log at the last good
                    // offset on every replica and move on.
                    if let Some((extent_id, offset)) = iter.position() {
                        tracing::warn!(
                            extent = extent_id,
                            offset,
                            "log corruption at replay, sealing at last good offset"
                        );
                        if let Err(e) = core.log_stream.seal_tail(extent_id, offset).await {
                            tracing::warn!(extent = extent_id, error = %e, "seal after corruption failed");
                        }
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let mut replayed = 0u64;
        for info in buffered {
            let value = if info.entry.meta & BIT_VALUE_POINTER != 0 {
                // Reinstate the pointer into the log stream.
                ValueStruct {
                    value: ValuePointer {
                        extent_id: info.extent_id,
                        offset: info.offset,
                        len: info.value_len,
                    }
                    .encode(),
                    meta: info.entry.meta,
                    user_meta: info.entry.user_meta,
                    expires_at: info.entry.expires_at,
                }
            } else {
                ValueStruct {
                    value: info.entry.value.clone(),
                    meta: info.entry.meta,
                    user_meta: info.entry.user_meta,
                    expires_at: info.entry.expires_at,
                }
            };

            let memtable = core
                .memtable_with_room(&info.entry.key, &value, flush_tx)
                .await?;
            memtable.put(&info.entry.key, info.entry.version, value)?;
            memtable.set_subsumes(EntryLocation {
                extent_id: info.extent_id,
                offset: info.offset,
            });

            if info.entry.version > core.version.load(Ordering::SeqCst) {
                core.version.store(info.entry.version, Ordering::SeqCst);
            }
            replayed += 1;
        }

        if replayed > 0 {
            tracing::info!(entries = replayed, "replayed log tail");
        }
        Ok(())
    }

    /// Submits a write and waits for its batch to become durable.
    pub async fn write(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let done = self
            .submit(Entry::put(key.to_vec(), value.to_vec()))
            .await?;
        done.await.map_err(|_| Error::Closed)?
    }

    /// Submits a write without waiting. The returned channel resolves with
    /// the batch outcome; dropping it abandons the wait, not the write.
    pub async fn write_async(
        &self,
        key: &[u8],
        value: &[u8],
    ) -> Result<oneshot::Receiver<Result<()>>> {
        self.submit(Entry::put(key.to_vec(), value.to_vec())).await
    }

    /// Writes a tombstone for the key.
    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        let done = self.submit(Entry::tombstone(key.to_vec())).await?;
        done.await.map_err(|_| Error::Closed)?
    }

    async fn submit(&self, entry: Entry) -> Result<oneshot::Receiver<Result<()>>> {
        if self.core.is_closed() {
            return Err(Error::Closed);
        }
        let tx = self
            .write_tx
            .read()?
            .clone()
            .ok_or(Error::Closed)?;

        let (done_tx, done_rx) = oneshot::channel();
        tx.send(WriteRequest {
            entries: vec![entry],
            done: done_tx,
        })
        .await
        .map_err(|_| Error::Closed)?;
        Ok(done_rx)
    }

    /// Point lookup. `max_version` bounds the visible versions when
    /// non-zero.
    pub async fn get(&self, key: &[u8], max_version: u64) -> Result<Vec<u8>> {
        if self.core.is_closed() {
            return Err(Error::Closed);
        }

        if let Some(value) = self.search_memtables(key, max_version) {
            return self.resolve_value(value).await;
        }

        let tables: Vec<Arc<Table>> = self
            .core
            .tables
            .read()?
            .iter()
            .filter(|t| t.contains(key))
            .cloned()
            .collect();
        for table in tables {
            if let Some(value) = table.get(key, max_version).await? {
                return self.resolve_value(value).await;
            }
        }

        Err(Error::NotFound)
    }

    fn search_memtables(&self, key: &[u8], max_version: u64) -> Option<ValueStruct> {
        if let Some(value) = self.core.active().get(key, max_version) {
            return Some(value);
        }
        let frozen = self.core.frozen.read().unwrap();
        for memtable in frozen.iter().rev() {
            if let Some(value) = memtable.get(key, max_version) {
                return Some(value);
            }
        }
        None
    }

    async fn resolve_value(&self, value: ValueStruct) -> Result<Vec<u8>> {
        if deleted_or_expired(&value) {
            return Err(Error::NotFound);
        }
        if !value.is_pointer() {
            return Ok(value.value);
        }

        let pointer = ValuePointer::decode(&value.value)?;
        let block = self
            .core
            .log_reader
            .read_block(pointer.extent_id, pointer.offset)
            .await?;
        let mut entries = unpack_entries(&block)?;
        if entries.len() != 1 {
            return errdata!("value pointer into a shared block");
        }
        let entry = entries.pop().unwrap();
        if entry.value.len() != pointer.len as usize {
            return errdata!(
                "value length mismatch: {} vs {}",
                entry.value.len(),
                pointer.len
            );
        }
        Ok(entry.value)
    }

    /// Ordered key scan: at most `limit` live keys starting at `start`,
    /// filtered to `prefix` when non-empty.
    pub async fn range(&self, start: &[u8], prefix: &[u8], limit: usize) -> Result<Vec<Vec<u8>>> {
        if self.core.is_closed() {
            return Err(Error::Closed);
        }
        let seek = crate::entry::key_with_version(start, u64::MAX);

        // Sources in recency order: the merge lets the newest source win a
        // key, and a tombstone there hides older versions below it.
        let mut cursors: Vec<Cursor> = Vec::new();
        cursors.push(Cursor::Mem(MemCursor::new(self.core.active(), seek.clone())));
        {
            let frozen = self.core.frozen.read()?;
            for memtable in frozen.iter().rev() {
                cursors.push(Cursor::Mem(MemCursor::new(
                    Arc::clone(memtable),
                    seek.clone(),
                )));
            }
        }
        {
            let tables = self.core.tables.read()?;
            for table in tables.iter() {
                if table.info.biggest.as_slice() >= start {
                    cursors.push(Cursor::Table(table.scan_from(seek.clone())));
                }
            }
        }

        let mut heads: Vec<Option<(Vec<u8>, ValueStruct)>> = Vec::with_capacity(cursors.len());
        for cursor in &mut cursors {
            heads.push(cursor.next().await?);
        }

        let mut out: Vec<Vec<u8>> = Vec::new();
        let mut last_user: Option<Vec<u8>> = None;
        loop {
            let best = heads
                .iter()
                .enumerate()
                .filter_map(|(i, head)| head.as_ref().map(|(key, _)| (key.clone(), i)))
                .min();
            let Some((key, index)) = best else { break };
            let (_, value) = heads[index].take().unwrap();
            heads[index] = cursors[index].next().await?;

            let (user, _) = crate::entry::parse_internal_key(&key)?;
            if last_user.as_deref() == Some(user) {
                continue; // older version or older source of a seen key
            }
            last_user = Some(user.to_vec());

            if !prefix.is_empty() && !user.starts_with(prefix) {
                if user > prefix {
                    break;
                }
                continue;
            }
            if deleted_or_expired(&value) {
                continue;
            }

            out.push(user.to_vec());
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Stops admitting writes, drains in-flight batches, flushes every
    /// non-empty memtable, and waits for both background tasks.
    pub async fn close(&self) -> Result<()> {
        self.core.closed.store(true, Ordering::SeqCst);

        // Dropping the sender drains the writer.
        drop(self.write_tx.write()?.take());
        let writer = self.writer.lock()?.take();
        if let Some(handle) = writer {
            handle.await?;
        }

        let flush_tx = self.flush_tx.lock()?.take();
        if let Some(flush_tx) = flush_tx {
            let active = {
                let mut guard = self.core.active.write()?;
                let fresh = Arc::new(MemTable::new(self.core.config.max_memtable_size));
                std::mem::replace(&mut *guard, fresh)
            };
            if !active.is_empty() {
                active.freeze();
                self.core.frozen.write()?.push_back(Arc::clone(&active));
                flush_tx
                    .send(active)
                    .await
                    .map_err(|_| Error::IO("flush queue closed".to_string()))?;
            }
        }
        let flusher = self.flusher.lock()?.take();
        if let Some(handle) = flusher {
            handle.await?;
        }

        tracing::info!("partition closed");
        Ok(())
    }
}

enum Cursor {
    Mem(MemCursor),
    Table(TableScanner),
}

impl Cursor {
    async fn next(&mut self) -> Result<Option<(Vec<u8>, ValueStruct)>> {
        match self {
            Cursor::Mem(cursor) => Ok(cursor.next()),
            Cursor::Table(scanner) => scanner.next().await,
        }
    }
}
