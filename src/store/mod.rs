use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::BlockError;

/// Opaque handle returned by `BlockStore::put`. Equal to the block's
/// `generation` ("Key: `block_id` == `generation`"), but kept as
/// a distinct type so callers can't accidentally index the store with an
/// unrelated integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub u64);

struct Entry {
    compressed: Vec<u8>,
    original_len: usize,
    refcount: u32,
    timestamps_max: Option<i64>,
}

struct Inner {
    entries: HashMap<u64, Entry>,
    retained_bytes: u64,
    watermark: i64,
}

/// In-memory, append-only, refcounted store of compressed block bytes for
/// stream/compressed ingestion modes.
///
/// `put` compresses and starts the refcount at 1 on behalf of the caller;
/// every stage that forwards a handle downstream calls `acquire` first and
/// `release` when done. A block's bytes are freed only once the refcount
/// reaches zero *and* the merger's watermark has passed the block's
/// `timestamps.max` — released too early and a slow formatter would read
/// back garbage, released only on refcount and a block behind the
/// watermark would never free.
pub struct BlockStore {
    inner: Mutex<Inner>,
    freed: Condvar,
    cap_bytes: u64,
}

impl BlockStore {
    pub fn new(cap_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                retained_bytes: 0,
                watermark: i64::MIN,
            }),
            freed: Condvar::new(),
            cap_bytes,
        }
    }

    /// Block the calling parser worker until `additional_bytes` more would
    /// fit under the cap, or `cancel` fires. This is the back-pressure path:
    /// "the parser stops calling `put`" — the store itself never blocks
    /// inside `put`.
    pub fn wait_for_capacity(&self, additional_bytes: u64, cancel: &crate::pipeline::CancellationToken) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.retained_bytes + additional_bytes > self.cap_bytes {
            if cancel.is_cancelled() {
                return false;
            }
            let (guard, _) = self
                .freed
                .wait_timeout(inner, Duration::from_millis(50))
                .unwrap();
            inner = guard;
        }
        true
    }

    /// Bytes currently retained, compressed. Callers use this (or
    /// `would_exceed`) to back off `put` under the store's capacity cap
    /// rather than the store itself blocking — the suspension lives in
    /// the reader/parser, not in the store.
    pub fn retained_bytes(&self) -> u64 {
        self.inner.lock().unwrap().retained_bytes
    }

    pub fn would_exceed(&self, additional_bytes: u64) -> bool {
        self.retained_bytes() + additional_bytes > self.cap_bytes
    }

    /// Compress `bytes` and store them under `generation`, refcount 1.
    pub fn put(
        &self,
        generation: u64,
        bytes: &[u8],
        timestamps_max: Option<i64>,
    ) -> Result<BlockHandle, BlockError> {
        let compressed = zstd::stream::encode_all(bytes, 0).map_err(|source| BlockError::Decompress {
            generation,
            source,
        })?;
        let mut inner = self.inner.lock().unwrap();
        inner.retained_bytes += compressed.len() as u64;
        inner.entries.insert(
            generation,
            Entry {
                compressed,
                original_len: bytes.len(),
                refcount: 1,
                timestamps_max,
            },
        );
        Ok(BlockHandle(generation))
    }

    /// Decompress and return a copy of a block's original bytes. Concurrent
    /// `get` calls are safe; the store only ever reads the entry.
    pub fn get(&self, handle: BlockHandle) -> Result<Vec<u8>, BlockError> {
        let inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get(&handle.0)
            .ok_or_else(|| BlockError::MalformedFrame {
                generation: handle.0,
                reason: "no such block in store".to_string(),
            })?;
        let mut out = Vec::with_capacity(entry.original_len);
        zstd::stream::copy_decode(entry.compressed.as_slice(), &mut out).map_err(|source| {
            BlockError::Decompress {
                generation: handle.0,
                source,
            }
        })?;
        Ok(out)
    }

    /// One more stage now holds this handle.
    pub fn acquire(&self, handle: BlockHandle) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&handle.0) {
            entry.refcount += 1;
        }
    }

    /// A stage is done with this handle. Frees the entry once refcount
    /// reaches zero and the watermark has passed `timestamps_max`; if the
    /// watermark arrives later, `advance_watermark` performs the free then.
    pub fn release(&self, handle: BlockHandle) {
        let mut inner = self.inner.lock().unwrap();
        let free_now = if let Some(entry) = inner.entries.get_mut(&handle.0) {
            entry.refcount = entry.refcount.saturating_sub(1);
            entry.refcount == 0 && past_watermark(entry.timestamps_max, inner.watermark)
        } else {
            false
        };
        if free_now {
            free_locked(&mut inner, handle.0);
            drop(inner);
            self.freed.notify_all();
        }
    }

    /// Advance the merger's watermark and free any zero-refcount blocks it
    /// newly clears.
    pub fn advance_watermark(&self, watermark: i64) {
        let mut inner = self.inner.lock().unwrap();
        if watermark > inner.watermark {
            inner.watermark = watermark;
        }
        let to_free: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.refcount == 0 && past_watermark(e.timestamps_max, inner.watermark))
            .map(|(gen, _)| *gen)
            .collect();
        let any_freed = !to_free.is_empty();
        for generation in to_free {
            free_locked(&mut inner, generation);
        }
        if any_freed {
            drop(inner);
            self.freed.notify_all();
        }
    }
}

fn past_watermark(timestamps_max: Option<i64>, watermark: i64) -> bool {
    match timestamps_max {
        Some(max) => watermark >= max,
        None => true,
    }
}

fn free_locked(inner: &mut Inner, generation: u64) {
    if let Some(entry) = inner.entries.remove(&generation) {
        inner.retained_bytes -= entry.compressed.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips_bytes() {
        let store = BlockStore::new(1 << 20);
        let handle = store.put(1, b"hello world", Some(10)).unwrap();
        let bytes = store.get(handle).unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[test]
    fn release_without_watermark_does_not_free() {
        let store = BlockStore::new(1 << 20);
        let handle = store.put(1, b"payload", Some(100)).unwrap();
        store.release(handle);
        assert!(store.get(handle).is_ok());
        assert!(store.retained_bytes() > 0);
    }

    #[test]
    fn release_after_watermark_frees() {
        let store = BlockStore::new(1 << 20);
        let handle = store.put(1, b"payload", Some(100)).unwrap();
        store.advance_watermark(100);
        store.release(handle);
        assert_eq!(store.retained_bytes(), 0);
        assert!(store.get(handle).is_err());
    }

    #[test]
    fn refcount_keeps_block_alive_across_multiple_holders() {
        let store = BlockStore::new(1 << 20);
        let handle = store.put(1, b"payload", Some(0)).unwrap();
        store.acquire(handle);
        store.advance_watermark(0);
        store.release(handle);
        assert!(store.get(handle).is_ok());
        store.release(handle);
        assert!(store.get(handle).is_err());
    }

    #[test]
    fn would_exceed_honors_capacity_cap() {
        let store = BlockStore::new(8);
        assert!(!store.would_exceed(4));
        store.put(1, b"12345678", None).ok();
        assert!(store.would_exceed(1));
    }
}
