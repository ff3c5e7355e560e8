//! Flushing frozen memtables to SSTs on the row stream.
//!
//! The flush task receives frozen memtables in freeze order, writes each as
//! one table, registers the table with the partition manager, publishes it
//! to the read path, and finally appends a flush marker to the log stream
//! recording the log position the table subsumes. Replay uses the marker to
//! skip what is already on disk.
//!
//! Flush has no deadline: a failed flush is retried (the memtable stays
//! queued), and backpressure on the frozen queue throttles writers once it
//! fills.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::entry::{Entry, ValuePointer, BIT_FLUSH_MARKER};
use crate::error::Result;

use super::memtable::MemTable;
use super::sst::{build_table, Table};
use super::PartitionCore;

/// Retries after the partition closes, before a flush is abandoned. An
/// abandoned memtable stays replayable from the log stream.
const CLOSING_RETRIES: u32 = 3;

pub(crate) async fn run_flusher(core: Arc<PartitionCore>, mut rx: mpsc::Receiver<Arc<MemTable>>) {
    while let Some(memtable) = rx.recv().await {
        let mut attempt = 0u32;
        loop {
            match flush_memtable(&core, &memtable).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    if core.is_closed() && attempt > CLOSING_RETRIES {
                        tracing::error!(
                            error = %e,
                            "abandoning flush at close; entries remain replayable from the log"
                        );
                        break;
                    }
                    tracing::warn!(attempt, error = %e, "flush failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * attempt.min(10) as u64)).await;
                }
            }
        }
    }
    tracing::debug!("flusher stopped");
}

async fn flush_memtable(core: &Arc<PartitionCore>, memtable: &Arc<MemTable>) -> Result<()> {
    if memtable.is_empty() {
        core.remove_frozen(memtable);
        return Ok(());
    }

    let entries = memtable.entries();
    let info = build_table(core.row_stream.as_ref(), &entries).await?;
    core.pm.record_table(info.clone()).await?;

    let table = Arc::new(Table::open(Arc::clone(&core.row_reader), info.clone()).await?);
    core.publish_table(table);
    core.remove_frozen(memtable);

    // The marker records the log position this table subsumes, so replay
    // can discard everything before it.
    if let Some(subsumed) = memtable.subsumes() {
        let marker = Entry {
            meta: BIT_FLUSH_MARKER,
            value: ValuePointer {
                extent_id: subsumed.extent_id,
                offset: subsumed.offset,
                len: 0,
            }
            .encode(),
            ..Default::default()
        };
        // The table is already durable and registered; a missed marker only
        // costs replay work, so it does not fail the flush.
        if let Err(e) = core
            .log_stream
            .append_entries(&[marker], core.config.value_threshold)
            .await
        {
            tracing::warn!(error = %e, "flush marker append failed");
        }
    }

    tracing::info!(
        entries = entries.len(),
        smallest = %String::from_utf8_lossy(&info.smallest),
        biggest = %String::from_utf8_lossy(&info.biggest),
        "flushed memtable to table"
    );
    Ok(())
}
