//! One logical set: proxy/fault lifecycle, dirty tracking, flush.

use crate::{Result, SparseDb, StoreConfig};
use parking_lot::{Mutex, MutexGuard};
use slidingd_hll::dense::SlidingHll;
use slidingd_hll::hash::hash_key;
use slidingd_hll::serialize;
use slidingd_hll::sparse::Point;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SetConfig {
    pub precision: u8,
    pub eps: f64,
    pub in_memory: bool,
    pub window_period: u32,
    pub window_precision: u32,
}

impl SetConfig {
    pub fn from_store(config: &StoreConfig) -> Self {
        Self {
            precision: config.default_precision,
            eps: config.default_eps,
            in_memory: config.in_memory,
            window_period: config.sliding_period,
            window_precision: config.sliding_precision,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub sets: u64,
    pub page_ins: u64,
    pub page_outs: u64,
}

#[derive(Default)]
struct Counters {
    sets: AtomicU64,
    page_ins: AtomicU64,
    page_outs: AtomicU64,
}

/// Functions are thread safe. The coarse `fault_lock` covers fault-in and
/// close; the `hll` mutex covers register updates and reads only and is
/// never held across store I/O or encoding.
pub struct Set {
    name: String,
    config: SetConfig,
    db: Arc<SparseDb>,
    fault_lock: Mutex<()>,
    hll: Mutex<Option<SlidingHll>>,
    proxied: AtomicBool,
    dirty: AtomicBool,
    counters: Counters,
}

impl Set {
    pub fn new(name: String, config: SetConfig, db: Arc<SparseDb>) -> Self {
        Self {
            name,
            config,
            db,
            fault_lock: Mutex::new(()),
            hll: Mutex::new(None),
            proxied: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SetConfig {
        &self.config
    }

    pub fn is_proxied(&self) -> bool {
        self.proxied.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            sets: self.counters.sets.load(Ordering::Relaxed),
            page_ins: self.counters.page_ins.load(Ordering::Relaxed),
            page_outs: self.counters.page_outs.load(Ordering::Relaxed),
        }
    }

    /// Serializes sparse read-modify-write cycles and proxy transitions for
    /// this set.
    pub(crate) fn coarse_lock(&self) -> MutexGuard<'_, ()> {
        self.fault_lock.lock()
    }

    /// Materializes the in-memory structure if the set is proxied.
    /// On failure the set stays proxied, so the call is retry-safe.
    pub fn fault_in(&self) -> Result<()> {
        if !self.is_proxied() {
            return Ok(());
        }
        let _guard = self.fault_lock.lock();
        if !self.is_proxied() {
            return Ok(());
        }

        let hll = if self.config.in_memory {
            self.fresh()?
        } else {
            match self.db.read_dense(&self.name)? {
                Some(blob) => {
                    let hll = serialize::unserialize(&blob)?;
                    self.counters.page_ins.fetch_add(1, Ordering::Relaxed);
                    hll
                }
                // never flushed before: treat as a fresh empty structure
                None => self.fresh()?,
            }
        };

        *self.hll.lock() = Some(hll);
        self.proxied.store(false, Ordering::Release);
        Ok(())
    }

    fn fresh(&self) -> Result<SlidingHll> {
        Ok(SlidingHll::new(
            self.config.precision,
            self.config.window_period,
            self.config.window_precision,
        )?)
    }

    /// Runs `f` against the resident structure, faulting it in first.
    /// Retries if a concurrent close unmaps between the fault and the lock.
    fn with_resident<R>(&self, f: impl FnOnce(&mut SlidingHll) -> R) -> Result<R> {
        loop {
            self.fault_in()?;
            let mut guard = self.hll.lock();
            if let Some(hll) = guard.as_mut() {
                return Ok(f(hll));
            }
        }
    }

    pub fn add(&self, key: &[u8], timestamp: i64) -> Result<()> {
        // hash outside the lock; the expensive mixing must not serialize
        self.add_hash(hash_key(key), timestamp)
    }

    pub fn add_hash(&self, hash: u64, timestamp: i64) -> Result<()> {
        self.add_hashes(&[hash], timestamp)
    }

    /// Adds a batch of pre-hashed keys under a single lock acquisition.
    /// Callers bound the batch length to keep the critical section short.
    pub fn add_hashes(&self, hashes: &[u64], timestamp: i64) -> Result<()> {
        self.with_resident(|hll| {
            for &hash in hashes {
                hll.add_hash_at(hash, timestamp);
            }
        })?;
        self.counters.sets.fetch_add(hashes.len() as u64, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Replays stored points, each with its own timestamp (sparse-to-dense
    /// conversion path).
    pub fn add_points(&self, points: &[Point]) -> Result<()> {
        self.with_resident(|hll| {
            for p in points {
                hll.add_hash_at(p.hash, p.timestamp);
            }
        })?;
        self.counters.sets.fetch_add(points.len() as u64, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub fn size(&self, timestamp: i64, window: u64) -> Result<u64> {
        self.with_resident(|hll| hll.size(window, timestamp) as u64)
    }

    pub fn size_total(&self) -> Result<u64> {
        self.with_resident(|hll| hll.size_total() as u64)
    }

    /// Snapshot of effective register values over the window, for unions.
    pub fn register_vector(&self, window: u64, at: i64) -> Result<(u8, Vec<u64>)> {
        self.with_resident(|hll| {
            let values = (0..hll.num_registers())
                .map(|i| hll.register_at(i, window, at))
                .collect();
            (hll.precision(), values)
        })
    }

    /// Estimated storage footprint in bytes.
    pub fn byte_size(&self) -> u64 {
        let resident = self.hll.lock().as_ref().map(serialize::serialized_size);
        match resident {
            Some(size) => size as u64,
            None => serialize::bytes_for_precision(self.config.precision).unwrap_or(0) as u64,
        }
    }

    /// Writes the dense blob if there is anything to write. The dirty flag
    /// is cleared before encoding: a concurrent writer re-dirties and the
    /// worst case is one superfluous flush, never a lost write.
    pub fn flush(&self) -> Result<()> {
        if self.is_proxied() || self.config.in_memory {
            return Ok(());
        }
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let blob = loop {
            // size outside the register lock; SERIALIZE_SLACK absorbs
            // growth between sizing and encoding, and we retry if a burst
            // outruns it
            let Some(size) = self.hll.lock().as_ref().map(serialize::serialized_size) else {
                return Ok(());
            };
            let mut buf = vec![0; size + serialize::SERIALIZE_SLACK];
            let guard = self.hll.lock();
            let Some(hll) = guard.as_ref() else {
                return Ok(());
            };
            match serialize::serialize_into(hll, &mut buf) {
                Ok(written) => {
                    drop(guard);
                    buf.truncate(written);
                    break buf;
                }
                Err(slidingd_hll::Error::BufferOverflow) => continue,
                Err(err) => return Err(err.into()),
            }
        };

        self.db.write_dense(&self.name, &blob)?;
        tracing::debug!(set = %self.name, bytes = blob.len(), "flushed set");
        Ok(())
    }

    /// Flush and release the in-memory state. Idempotent.
    pub fn close(&self) -> Result<()> {
        let _guard = self.fault_lock.lock();
        if self.is_proxied() {
            return Ok(());
        }
        self.flush()?;
        *self.hll.lock() = None;
        self.proxied.store(true, Ordering::Release);
        self.counters.page_outs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close, then remove the set's entries from the store.
    pub fn delete(&self) -> Result<()> {
        self.close()?;
        self.db.drop_set(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            default_precision: 12,
            default_eps: 0.02,
            in_memory: false,
            sliding_period: 86400,
            sliding_precision: 60,
            data_dir: dir.path().to_path_buf(),
            memtable_memory: 8 << 20,
        }
    }

    fn new_set(name: &str, db: &Arc<SparseDb>, config: &StoreConfig) -> Set {
        Set::new(name.to_owned(), SetConfig::from_store(config), db.clone())
    }

    #[test]
    fn fault_flush_reload() {
        let dir = TempDir::new().unwrap();
        let config = store_config(&dir);
        let db = Arc::new(SparseDb::open(&config).unwrap());

        let set = new_set("s1", &db, &config);
        assert!(set.is_proxied());
        set.add(b"hey", 100).unwrap();
        set.add(b"there", 100).unwrap();
        set.add(b"person", 100).unwrap();
        assert!(!set.is_proxied());
        assert_eq!(set.size_total().unwrap(), 3);
        assert_eq!(set.counters().sets, 3);
        set.flush().unwrap();

        // a second instance pages the flushed state back in
        let set2 = new_set("s1", &db, &config);
        assert_eq!(set2.size_total().unwrap(), 3);
        assert_eq!(set2.counters().page_ins, 1);
    }

    #[test]
    fn close_is_idempotent_and_pages_out() {
        let dir = TempDir::new().unwrap();
        let config = store_config(&dir);
        let db = Arc::new(SparseDb::open(&config).unwrap());

        let set = new_set("s2", &db, &config);
        set.add(b"key", 10).unwrap();
        set.close().unwrap();
        assert!(set.is_proxied());
        set.close().unwrap();
        assert_eq!(set.counters().page_outs, 1);

        // reads fault the state back in
        assert_eq!(set.size_total().unwrap(), 1);
    }

    #[test]
    fn flush_skips_clean_proxied_and_in_memory_sets() {
        let dir = TempDir::new().unwrap();
        let config = store_config(&dir);
        let db = Arc::new(SparseDb::open(&config).unwrap());

        let set = new_set("s3", &db, &config);
        set.flush().unwrap();
        assert!(db.read_dense("s3").unwrap().is_none());

        let mut mem_config = config.clone();
        mem_config.in_memory = true;
        let mem = Set::new("m1".to_owned(), SetConfig::from_store(&mem_config), db.clone());
        mem.add(b"a", 1).unwrap();
        mem.flush().unwrap();
        assert!(db.read_dense("m1").unwrap().is_none());
    }

    #[test]
    fn delete_removes_persisted_state() {
        let dir = TempDir::new().unwrap();
        let config = store_config(&dir);
        let db = Arc::new(SparseDb::open(&config).unwrap());

        let set = new_set("s4", &db, &config);
        set.add(b"key", 10).unwrap();
        set.flush().unwrap();
        assert!(db.read_dense("s4").unwrap().is_some());
        set.delete().unwrap();
        assert!(db.read_dense("s4").unwrap().is_none());

        let set2 = new_set("s4", &db, &config);
        assert_eq!(set2.size_total().unwrap(), 0);
    }

    #[test]
    fn windowed_size_via_registers() {
        let dir = TempDir::new().unwrap();
        let config = store_config(&dir);
        let db = Arc::new(SparseDb::open(&config).unwrap());

        let set = new_set("s5", &db, &config);
        set.add(b"old", 10).unwrap();
        set.add(b"new", 100).unwrap();
        assert_eq!(set.size(100, 50).unwrap(), 1);
        assert_eq!(set.size(100, 1000).unwrap(), 2);
    }
}
