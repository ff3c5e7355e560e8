//! In-memory sorted table over a concurrent skip list.
//!
//! Keys are internal keys (`user_key ‖ inverted version`), so versions of a
//! user key sort newest first and a point lookup is a single seek. Writes go
//! through the partition's writer task only; readers are lock-free.
//!
//! The skip list is budgeted rather than arena-allocated: every insert is
//! costed conservatively at twice its key+value footprint plus per-node
//! overhead, so a memtable switch can be scheduled before the budget is
//! actually exhausted.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;

use crate::entry::{key_with_version, parse_internal_key, ValueStruct};
use crate::error::Result;
use crate::errinput;
use crate::stream::EntryLocation;

/// Estimated per-node cost beyond the stored bytes.
const ENTRY_OVERHEAD: usize = 64;

/// Conservative upper bound on what one insert costs the memtable.
pub fn estimated_size(user_key: &[u8], value: &ValueStruct) -> usize {
    2 * (ENTRY_OVERHEAD + user_key.len() + 8 + value.value.len())
}

pub struct MemTable {
    data: SkipMap<Vec<u8>, ValueStruct>,
    size: AtomicUsize,
    capacity: usize,
    frozen: AtomicBool,
    /// Log position subsuming everything in this memtable, advanced after
    /// each batch. The flush marker records it once the table is on disk.
    subsumes: Mutex<Option<EntryLocation>>,
}

impl MemTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
            capacity,
            frozen: AtomicBool::new(false),
            subsumes: Mutex::new(None),
        }
    }

    /// Inserts one key version.
    pub fn put(&self, user_key: &[u8], version: u64, value: ValueStruct) -> Result<()> {
        if self.is_frozen() {
            return errinput!("memtable is frozen");
        }
        let cost = estimated_size(user_key, &value);
        self.data.insert(key_with_version(user_key, version), value);
        self.size.fetch_add(cost, Ordering::SeqCst);
        Ok(())
    }

    /// Newest version of `user_key` at or below `max_version` (0 means
    /// unbounded).
    pub fn get(&self, user_key: &[u8], max_version: u64) -> Option<ValueStruct> {
        let ceiling = if max_version == 0 {
            u64::MAX
        } else {
            max_version
        };
        let seek = key_with_version(user_key, ceiling);
        let entry = self.data.range(seek..).next()?;
        let (found, _) = parse_internal_key(entry.key()).ok()?;
        if found == user_key {
            Some(entry.value().clone())
        } else {
            None
        }
    }

    /// First entry with internal key strictly greater than `after`, or the
    /// smallest entry when `after` is `None`. Backs lazy merge cursors.
    pub fn next_after(&self, after: Option<&[u8]>) -> Option<(Vec<u8>, ValueStruct)> {
        let entry = match after {
            Some(key) => self
                .data
                .range((Bound::Excluded(key.to_vec()), Bound::Unbounded))
                .next()?,
            None => self.data.front()?,
        };
        Some((entry.key().clone(), entry.value().clone()))
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn set_subsumes(&self, location: EntryLocation) {
        *self.subsumes.lock().unwrap() = Some(location);
    }

    pub fn subsumes(&self) -> Option<EntryLocation> {
        *self.subsumes.lock().unwrap()
    }

    /// All entries in internal-key order. Used by flush.
    pub fn entries(&self) -> Vec<(Vec<u8>, ValueStruct)> {
        self.data
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

/// Lazy cursor over one memtable, in internal-key order from a start key.
pub struct MemCursor {
    memtable: Arc<MemTable>,
    current: Option<Vec<u8>>,
    started: bool,
    start: Vec<u8>,
}

impl MemCursor {
    pub fn new(memtable: Arc<MemTable>, start_internal_key: Vec<u8>) -> Self {
        Self {
            memtable,
            current: None,
            started: false,
            start: start_internal_key,
        }
    }

    pub fn next(&mut self) -> Option<(Vec<u8>, ValueStruct)> {
        let found = if !self.started {
            self.started = true;
            let seek = self.start.clone();
            self.memtable
                .data
                .range(seek..)
                .next()
                .map(|e| (e.key().clone(), e.value().clone()))
        } else {
            self.memtable.next_after(self.current.as_deref())
        };
        if let Some((key, _)) = &found {
            self.current = Some(key.clone());
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::BIT_DELETE;

    fn value(bytes: &[u8]) -> ValueStruct {
        ValueStruct {
            value: bytes.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_put_and_get() {
        let memtable = MemTable::new(1 << 20);
        memtable.put(b"key1", 1, value(b"val1")).unwrap();
        memtable.put(b"key2", 2, value(b"val2")).unwrap();

        assert_eq!(memtable.get(b"key1", 0).unwrap().value, b"val1");
        assert_eq!(memtable.get(b"key2", 0).unwrap().value, b"val2");
        assert!(memtable.get(b"key3", 0).is_none());
    }

    #[test]
    fn test_newest_version_wins() {
        let memtable = MemTable::new(1 << 20);
        for version in 1..=5u64 {
            memtable
                .put(b"key", version, value(format!("val{version}").as_bytes()))
                .unwrap();
        }

        assert_eq!(memtable.get(b"key", 0).unwrap().value, b"val5");
        // A version ceiling reads the past.
        assert_eq!(memtable.get(b"key", 3).unwrap().value, b"val3");
        assert_eq!(memtable.get(b"key", 1).unwrap().value, b"val1");
    }

    #[test]
    fn test_tombstone_is_returned() {
        let memtable = MemTable::new(1 << 20);
        memtable.put(b"key", 1, value(b"val")).unwrap();
        memtable
            .put(
                b"key",
                2,
                ValueStruct {
                    meta: BIT_DELETE,
                    ..Default::default()
                },
            )
            .unwrap();

        // The memtable reports the tombstone; resolution happens above.
        assert!(memtable.get(b"key", 0).unwrap().is_delete());
    }

    #[test]
    fn test_size_estimator_is_conservative() {
        let memtable = MemTable::new(1 << 20);
        let mut expected = 0;
        for i in 0..100 {
            let key = format!("key{i}");
            let val = value(format!("value{i}").as_bytes());
            expected += estimated_size(key.as_bytes(), &val);
            memtable.put(key.as_bytes(), i as u64 + 1, val).unwrap();
        }
        assert_eq!(memtable.size(), expected);
        assert!(memtable.size() >= 100 * 2 * ENTRY_OVERHEAD);
    }

    #[test]
    fn test_frozen_rejects_writes() {
        let memtable = MemTable::new(1 << 20);
        memtable.put(b"key", 1, value(b"val")).unwrap();
        memtable.freeze();
        assert!(memtable.put(b"key", 2, value(b"val")).is_err());
        // Reads still work.
        assert!(memtable.get(b"key", 0).is_some());
    }

    #[test]
    fn test_cursor_walks_in_order() {
        let memtable = Arc::new(MemTable::new(1 << 20));
        for key in ["b", "a", "c"] {
            memtable.put(key.as_bytes(), 1, value(b"x")).unwrap();
        }

        let mut cursor = MemCursor::new(Arc::clone(&memtable), key_with_version(b"a", u64::MAX));
        let mut keys = Vec::new();
        while let Some((internal, _)) = cursor.next() {
            let (user, _) = parse_internal_key(&internal).unwrap();
            keys.push(user.to_vec());
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
