//! The set manager: name registry, request routing, sparse/dense promotion,
//! and checkpointed epoch-based vacuuming of dropped sets.

use crate::set::{Set, SetConfig};
use crate::{reconcile_precision, Error, Result, SparseAdd, SparseDb, SparseState, StoreConfig};
use parking_lot::Mutex;
use slidingd_hll::hash::hash_key;
use slidingd_hll::sparse::SPARSE_MAX_KEYS;
use slidingd_hll::{estimate, sparse};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Keys handled per inner-lock acquisition by multi-key commands, bounding
/// the critical section against concurrent readers.
pub const MULTI_OP_SIZE: usize = 32;

const MAX_SET_NAME_LEN: usize = 200;

const VACUUM_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    pub precision: Option<u8>,
    pub eps: Option<f64>,
    pub in_memory: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct SetListEntry {
    pub name: String,
    pub eps: f64,
    pub precision: u8,
    pub bytes: u64,
    pub size: u64,
}

struct SetHandle {
    set: Set,
    touched: AtomicBool,
}

impl SetHandle {
    fn new(set: Set) -> Self {
        Self {
            set,
            // creation counts as a touch for cold tracking
            touched: AtomicBool::new(true),
        }
    }
}

struct PendingDrop {
    epoch: u64,
    handle: Arc<SetHandle>,
    /// Drops remove the persisted entries; clears keep them for rediscovery.
    remove_data: bool,
}

#[derive(Default)]
struct State {
    sets: BTreeMap<String, Arc<SetHandle>>,
    pending: Vec<PendingDrop>,
}

pub struct SetManager {
    db: Arc<SparseDb>,
    config: StoreConfig,
    state: Mutex<State>,
    /// Client id -> last published epoch.
    clients: Mutex<HashMap<u64, u64>>,
    epoch: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl SetManager {
    /// Opens the store, rediscovers persisted sets, and (unless a test or
    /// embedding environment drives [`SetManager::vacuum`] itself) starts
    /// the background vacuum thread.
    pub fn new(config: StoreConfig, vacuum: bool) -> Result<Arc<Self>> {
        config.validate()?;
        let db = Arc::new(SparseDb::open(&config)?);

        let mut sets = BTreeMap::new();
        for name in db.set_names()? {
            if validate_name(&name).is_err() {
                tracing::warn!(set = %name, "skipping set with invalid name");
                continue;
            }
            let set = Set::new(name.clone(), SetConfig::from_store(&config), db.clone());
            sets.insert(name, Arc::new(SetHandle::new(set)));
        }
        if !sets.is_empty() {
            tracing::info!(count = sets.len(), "discovered persisted sets");
        }

        let manager = Arc::new(Self {
            db,
            config,
            state: Mutex::new(State { sets, pending: Vec::new() }),
            clients: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        if vacuum {
            let weak = Arc::downgrade(&manager);
            let shutdown = manager.shutdown.clone();
            std::thread::Builder::new()
                .name("vacuum".to_owned())
                .spawn(move || vacuum_loop(weak, shutdown))
                .map_err(|_| Error::Internal("failed to spawn vacuum thread"))?;
        }

        Ok(manager)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Publishes the caller's view of the current epoch. Connection handlers
    /// call this before each command so the vacuum thread knows what state
    /// they may still reference.
    pub fn client_checkpoint(&self, client: u64) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.clients.lock().insert(client, epoch);
    }

    pub fn client_leave(&self, client: u64) {
        self.clients.lock().remove(&client);
    }

    pub fn create_set(&self, name: &str, opts: CreateOptions) -> Result<()> {
        validate_name(name)?;
        let (precision, eps) = reconcile_precision(opts.precision, opts.eps, &self.config)?;

        let mut state = self.state.lock();
        if state.sets.contains_key(name) {
            return Err(Error::Exists);
        }
        if state.pending.iter().any(|p| p.handle.set.name() == name) {
            return Err(Error::DeleteInProgress);
        }

        let config = SetConfig {
            precision,
            eps,
            in_memory: opts.in_memory.unwrap_or(self.config.in_memory),
            window_period: self.config.sliding_period,
            window_precision: self.config.sliding_precision,
        };
        let set = Set::new(name.to_owned(), config, self.db.clone());
        state.sets.insert(name.to_owned(), Arc::new(SetHandle::new(set)));
        tracing::info!(set = name, "created set");
        Ok(())
    }

    /// Unregisters the set and queues it for destruction once no client
    /// checkpointed before the drop can still reference it.
    pub fn drop_set(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let handle = state.sets.remove(name).ok_or(Error::NotFound)?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        state.pending.push(PendingDrop { epoch, handle, remove_data: true });
        tracing::info!(set = name, "dropped set");
        Ok(())
    }

    /// Unmaps the in-memory state, leaving the set registered and its
    /// persisted data intact.
    pub fn unmap_set(&self, name: &str) -> Result<()> {
        self.handle(name)?.set.close()
    }

    /// Forgets a proxied set without touching its persisted data; a later
    /// create under the same name rediscovers it.
    pub fn clear_set(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let handle = state.sets.get(name).ok_or(Error::NotFound)?;
        if !handle.set.is_proxied() {
            return Err(Error::NotProxied);
        }
        // state lock is held: nothing can fault the set in concurrently
        let handle = state.sets.remove(name).ok_or(Error::NotFound)?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        state.pending.push(PendingDrop { epoch, handle, remove_data: false });
        Ok(())
    }

    pub fn flush_set(&self, name: &str) -> Result<()> {
        self.handle(name)?.set.flush()
    }

    /// Flushes every registered set, tolerating concurrent drops.
    pub fn flush_all(&self) {
        for handle in self.handles() {
            if let Err(err) = handle.set.flush() {
                tracing::warn!(set = handle.set.name(), %err, "flush failed");
            }
        }
    }

    /// Hashes and adds keys to the named set. Small sets take the sparse
    /// path, a read-modify-write against the store; the write that pushes a
    /// set past [`SPARSE_MAX_KEYS`] promotes it to dense registers.
    pub fn set_keys(&self, name: &str, keys: &[&[u8]], timestamp: i64) -> Result<()> {
        let handle = self.touch(name)?;
        let hashes: Vec<u64> = keys.iter().map(|key| hash_key(key)).collect();
        self.add_hashes(&handle.set, &hashes, timestamp)
    }

    fn add_hashes(&self, set: &Set, hashes: &[u64], timestamp: i64) -> Result<()> {
        if !set.config().in_memory {
            let outcome = {
                let _guard = set.coarse_lock();
                self.db.sparse_add(set.name(), hashes, timestamp)?
            };
            match outcome {
                SparseAdd::Size(count) if count > SPARSE_MAX_KEYS => return self.promote(set),
                SparseAdd::Size(_) => return Ok(()),
                SparseAdd::IsDense => {}
            }
        }
        for chunk in hashes.chunks(MULTI_OP_SIZE) {
            set.add_hashes(chunk, timestamp)?;
        }
        Ok(())
    }

    /// Replays the sparse point list into dense registers, persists the
    /// blob, and leaves the sentinel so the list never comes back.
    fn promote(&self, set: &Set) -> Result<()> {
        let points = {
            let _guard = set.coarse_lock();
            match self.db.sparse_state(set.name())? {
                SparseState::Points(points) => points,
                SparseState::Absent | SparseState::Dense => return Ok(()),
            }
        };
        for chunk in points.chunks(MULTI_OP_SIZE) {
            set.add_points(chunk)?;
        }
        set.flush()?;
        {
            let _guard = set.coarse_lock();
            self.db.mark_dense(set.name())?;
        }
        tracing::info!(set = set.name(), points = points.len(), "promoted sparse set to dense");
        Ok(())
    }

    /// Estimated distinct count over the trailing window ending at
    /// `timestamp`.
    pub fn set_size(&self, name: &str, timestamp: i64, window: u64) -> Result<u64> {
        let handle = self.touch(name)?;
        let set = &handle.set;
        if !set.config().in_memory {
            match self.db.sparse_state(set.name())? {
                SparseState::Absent => return Ok(0),
                SparseState::Points(points) => return Ok(sparse::size(&points, timestamp, window)),
                SparseState::Dense => {}
            }
        }
        set.size(timestamp, window)
    }

    /// Estimated distinct count over the whole retained history.
    pub fn set_size_total(&self, name: &str) -> Result<u64> {
        let handle = self.touch(name)?;
        self.size_total_of(&handle.set)
    }

    fn size_total_of(&self, set: &Set) -> Result<u64> {
        if !set.config().in_memory {
            match self.db.sparse_state(set.name())? {
                SparseState::Absent => return Ok(0),
                SparseState::Points(points) => return Ok(points.len() as u64),
                SparseState::Dense => {}
            }
        }
        set.size_total()
    }

    /// Union cardinality across sets, which must share a precision. Sparse
    /// members are promoted first: a union is answered from registers.
    pub fn union_size(&self, names: &[&str], timestamp: i64, window: u64) -> Result<u64> {
        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            handles.push(self.touch(name)?);
        }

        let mut precision = None;
        let mut merged: Vec<u64> = Vec::new();
        for handle in &handles {
            let set = &handle.set;
            if !set.config().in_memory {
                let is_sparse = {
                    let _guard = set.coarse_lock();
                    matches!(self.db.sparse_state(set.name())?, SparseState::Points(_))
                };
                if is_sparse {
                    self.promote(set)?;
                }
            }
            let (p, values) = set.register_vector(window, timestamp)?;
            match precision {
                None => {
                    precision = Some(p);
                    merged = values;
                }
                Some(q) if q != p => return Err(slidingd_hll::Error::PrecisionMismatch.into()),
                Some(_) => {
                    for (dest, value) in merged.iter_mut().zip(values) {
                        *dest = (*dest).max(value);
                    }
                }
            }
        }
        let Some(precision) = precision else {
            return Ok(0);
        };
        Ok(estimate::cardinality(precision, merged.into_iter()) as u64)
    }

    /// Self-contained snapshot of registered sets, readable without any
    /// manager lock. Set-level failures drop the entry rather than the
    /// whole listing.
    pub fn list_sets(&self, prefix: Option<&str>) -> Vec<SetListEntry> {
        let handles: Vec<Arc<SetHandle>> = {
            let state = self.state.lock();
            state
                .sets
                .iter()
                .filter(|(name, _)| prefix.map_or(true, |p| name.starts_with(p)))
                .map(|(_, handle)| handle.clone())
                .collect()
        };
        handles
            .into_iter()
            .filter_map(|handle| {
                let set = &handle.set;
                let size = match self.size_total_of(set) {
                    Ok(size) => size,
                    Err(err) => {
                        tracing::warn!(set = set.name(), %err, "skipping set in listing");
                        return None;
                    }
                };
                Some(SetListEntry {
                    name: set.name().to_owned(),
                    eps: set.config().eps,
                    precision: set.config().precision,
                    bytes: set.byte_size(),
                    size,
                })
            })
            .collect()
    }

    /// Names of sets untouched since the previous cold scan, clearing every
    /// touch flag as a side effect.
    pub fn list_cold_sets(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut cold = Vec::new();
        for (name, handle) in &state.sets {
            if !handle.touched.swap(false, Ordering::SeqCst) {
                cold.push(name.clone());
            }
        }
        cold
    }

    /// Runs a callback against a set handle. The borrow is valid only for
    /// the callback's extent; use it for metrics and counters, not for
    /// holding on to the set.
    pub fn with_set<R>(&self, name: &str, f: impl FnOnce(&Set) -> R) -> Result<R> {
        let handle = self.handle(name)?;
        Ok(f(&handle.set))
    }

    pub fn store_stats(&self) -> Result<Option<String>> {
        self.db.stats()
    }

    /// Destroys pending drops no active client could still reference: a
    /// drop is safe once every published checkpoint postdates it.
    pub fn vacuum(&self) {
        let safe_epoch = self
            .clients
            .lock()
            .values()
            .copied()
            .min()
            .unwrap_or(u64::MAX);

        let victims: Vec<PendingDrop> = {
            let mut state = self.state.lock();
            let (victims, keep) = state
                .pending
                .drain(..)
                .partition(|pending| pending.epoch < safe_epoch);
            state.pending = keep;
            victims
        };

        for victim in victims {
            let name = victim.handle.set.name().to_owned();
            if victim.remove_data {
                if let Err(err) = victim.handle.set.delete() {
                    tracing::error!(set = %name, %err, "failed to destroy dropped set");
                }
            }
            tracing::debug!(set = %name, "vacuumed set");
        }
    }

    /// Stops the vacuum thread and flushes everything once.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.flush_all();
    }

    fn handle(&self, name: &str) -> Result<Arc<SetHandle>> {
        self.state.lock().sets.get(name).cloned().ok_or(Error::NotFound)
    }

    fn touch(&self, name: &str) -> Result<Arc<SetHandle>> {
        let handle = self.handle(name)?;
        handle.touched.store(true, Ordering::SeqCst);
        Ok(handle)
    }

    fn handles(&self) -> Vec<Arc<SetHandle>> {
        self.state.lock().sets.values().cloned().collect()
    }
}

impl Drop for SetManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn vacuum_loop(manager: Weak<SetManager>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(VACUUM_POLL);
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.vacuum();
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid_chars = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if name.is_empty() || name.len() > MAX_SET_NAME_LEN || !valid_chars {
        return Err(Error::BadArgument(format!("invalid set name: {name:?}")));
    }
    Ok(())
}
