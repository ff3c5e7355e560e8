//! The write batcher: the spine of the partition's write path.
//!
//! A bounded channel collects incoming write requests. A single writer task
//! drains up to `batch_max` requests (or `batch_max_bytes` worth of
//! entries), packs the batch into blocks, appends them to the log stream in
//! one replicated call, inserts each entry (or its value pointer) into the
//! mutable memtable, and then signals every caller in the batch with the
//! shared outcome.
//!
//! Effective write order is batch-admission order; within a batch, per-key
//! order matches arrival order because versions are assigned at admission.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::entry::{Entry, ValueStruct, BIT_VALUE_POINTER};
use crate::error::Result;
use crate::stream::EntryLocation;
use crate::Error;

use super::memtable::MemTable;
use super::PartitionCore;

pub(crate) struct WriteRequest {
    pub entries: Vec<Entry>,
    pub done: oneshot::Sender<Result<()>>,
}

fn request_bytes(request: &WriteRequest) -> usize {
    request.entries.iter().map(Entry::encoded_len).sum()
}

pub(crate) async fn run_writer(
    core: Arc<PartitionCore>,
    mut rx: mpsc::Receiver<WriteRequest>,
    flush_tx: mpsc::Sender<Arc<MemTable>>,
) {
    while let Some(first) = rx.recv().await {
        let mut bytes = request_bytes(&first);
        let mut requests = vec![first];

        // Coalesce whatever else is already queued.
        while requests.len() < core.config.batch_max && bytes < core.config.batch_max_bytes {
            match rx.try_recv() {
                Ok(request) => {
                    bytes += request_bytes(&request);
                    requests.push(request);
                }
                Err(_) => break,
            }
        }

        let result = process_batch(&core, &mut requests, &flush_tx).await;
        if let Err(e) = &result {
            tracing::warn!(batch = requests.len(), error = %e, "write batch failed");
        }
        for request in requests {
            let _ = request.done.send(result.clone());
        }
    }
    tracing::debug!("write batcher stopped");
}

async fn process_batch(
    core: &Arc<PartitionCore>,
    requests: &mut [WriteRequest],
    flush_tx: &mpsc::Sender<Arc<MemTable>>,
) -> Result<()> {
    let threshold = core.config.value_threshold;

    // Versions are assigned at admission, in arrival order.
    let mut entries: Vec<Entry> = Vec::new();
    for request in requests.iter_mut() {
        for entry in &mut request.entries {
            entry.version = core.next_version();
            entries.push(entry.clone());
        }
    }

    // One durable append for the whole batch. The stream client handles
    // seal+allocate+retry underneath; what escapes here fails the batch.
    let appended = match tokio::time::timeout(
        core.config.write_timeout,
        core.log_stream.append_entries(&entries, threshold),
    )
    .await
    {
        Ok(Ok(appended)) => appended,
        Ok(Err(e)) => return Err(Error::IO(e.to_string())),
        Err(_) => return Err(Error::IO("write batch deadline exceeded".to_string())),
    };

    for (entry, location) in entries.iter().zip(&appended.locations) {
        let value = to_value_struct(entry, *location, threshold);
        let memtable = core.memtable_with_room(&entry.key, &value, flush_tx).await?;
        memtable.put(&entry.key, entry.version, value)?;
    }

    // Everything in this memtable is covered by the log up to the batch
    // tail; the flush marker will record it.
    core.active().set_subsumes(EntryLocation {
        extent_id: appended.extent_id,
        offset: appended.tail,
    });

    Ok(())
}

/// Builds what the memtable stores for one appended entry: the value inline,
/// or a pointer at the block the stream just wrote.
pub(crate) fn to_value_struct(
    entry: &Entry,
    location: EntryLocation,
    value_threshold: usize,
) -> ValueStruct {
    if entry.value.len() > value_threshold {
        let pointer = crate::entry::ValuePointer {
            extent_id: location.extent_id,
            offset: location.offset,
            len: entry.value.len() as u32,
        };
        ValueStruct {
            value: pointer.encode(),
            meta: entry.meta | BIT_VALUE_POINTER,
            user_meta: entry.user_meta,
            expires_at: entry.expires_at,
        }
    } else {
        ValueStruct {
            value: entry.value.clone(),
            meta: entry.meta,
            user_meta: entry.user_meta,
            expires_at: entry.expires_at,
        }
    }
}
