//! Embedded RocksDB adapter.
//!
//! Two logical keyspaces share the physical store: the sparse point list of
//! a set lives under the set name itself, and its dense blob lives under the
//! same name behind the `dense~` prefix. An empty sparse value means the set
//! has never been written; the one-byte `-` sentinel means it was promoted
//! to dense and the point list must not come back.

use crate::{Result, StoreConfig};
use rocksdb::{DBCompressionType, IteratorMode, Options, DB};
use slidingd_hll::sparse::{self, Point, DENSE_SENTINEL};
use std::collections::BTreeSet;

const DENSE_PREFIX: &[u8] = b"dense~";

pub enum SparseState {
    Absent,
    Points(Vec<Point>),
    Dense,
}

pub enum SparseAdd {
    /// Point count after the write.
    Size(usize),
    /// The set was already promoted; the write must go to the registers.
    IsDense,
}

pub struct SparseDb {
    db: DB,
}

impl SparseDb {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.increase_parallelism(num_cpus::get() as i32);
        options.optimize_level_style_compaction(config.memtable_memory);
        // built without compression codecs
        options.set_compression_type(DBCompressionType::None);
        let db = DB::open(&options, &config.data_dir)?;
        tracing::info!(dir = %config.data_dir.display(), "opened sparse store");
        Ok(Self { db })
    }

    fn dense_key(name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(DENSE_PREFIX.len() + name.len());
        key.extend_from_slice(DENSE_PREFIX);
        key.extend_from_slice(name.as_bytes());
        key
    }

    pub fn sparse_state(&self, name: &str) -> Result<SparseState> {
        match self.db.get(name.as_bytes())? {
            None => Ok(SparseState::Absent),
            Some(value) if value == DENSE_SENTINEL => Ok(SparseState::Dense),
            Some(value) => Ok(SparseState::Points(sparse::decode_points(&value)?)),
        }
    }

    /// Read-modify-write sparse add. Not transactional; callers serialize
    /// writers per set.
    pub fn sparse_add(&self, name: &str, hashes: &[u64], timestamp: i64) -> Result<SparseAdd> {
        let mut points = match self.sparse_state(name)? {
            SparseState::Dense => return Ok(SparseAdd::IsDense),
            SparseState::Absent => Vec::new(),
            SparseState::Points(points) => points,
        };
        let size = sparse::add(&mut points, hashes, timestamp);
        self.db.put(name.as_bytes(), sparse::encode_points(&points))?;
        Ok(SparseAdd::Size(size))
    }

    /// Replaces the point list with the promoted-to-dense sentinel.
    pub fn mark_dense(&self, name: &str) -> Result<()> {
        self.db.put(name.as_bytes(), DENSE_SENTINEL)?;
        Ok(())
    }

    pub fn read_dense(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let value = self.db.get(Self::dense_key(name))?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    pub fn write_dense(&self, name: &str, blob: &[u8]) -> Result<()> {
        self.db.put(Self::dense_key(name), blob)?;
        Ok(())
    }

    /// Removes both keyspaces' entries for a set.
    pub fn drop_set(&self, name: &str) -> Result<()> {
        self.db.delete(name.as_bytes())?;
        self.db.delete(Self::dense_key(name))?;
        Ok(())
    }

    /// Every set name present in either keyspace. Full scan; used once at
    /// startup for discovery.
    pub fn set_names(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for entry in self.db.iterator(IteratorMode::Start) {
            let (key, _) = entry?;
            let name = key.strip_prefix(DENSE_PREFIX).unwrap_or(&key);
            match std::str::from_utf8(name) {
                Ok(name) => {
                    names.insert(name.to_owned());
                }
                Err(_) => tracing::warn!(?key, "skipping non-utf8 key during discovery"),
            }
        }
        Ok(names.into_iter().collect())
    }

    pub fn stats(&self) -> Result<Option<String>> {
        Ok(self.db.property_value("rocksdb.stats")?)
    }

    pub fn compact(&self) {
        self.db.compact_range(None::<&[u8]>, None::<&[u8]>);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> SparseDb {
        let config = StoreConfig {
            default_precision: 12,
            default_eps: 0.02,
            in_memory: false,
            sliding_period: 86400,
            sliding_precision: 60,
            data_dir: dir.path().to_path_buf(),
            memtable_memory: 8 << 20,
        };
        SparseDb::open(&config).unwrap()
    }

    #[test]
    fn sparse_lifecycle() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        assert!(matches!(db.sparse_state("abc").unwrap(), SparseState::Absent));

        match db.sparse_add("abc", &[123, 456], 10).unwrap() {
            SparseAdd::Size(n) => assert_eq!(n, 2),
            SparseAdd::IsDense => panic!("fresh set must be sparse"),
        }
        match db.sparse_state("abc").unwrap() {
            SparseState::Points(points) => assert_eq!(points.len(), 2),
            _ => panic!("expected points"),
        }

        db.mark_dense("abc").unwrap();
        assert!(matches!(db.sparse_state("abc").unwrap(), SparseState::Dense));
        assert!(matches!(db.sparse_add("abc", &[789], 20).unwrap(), SparseAdd::IsDense));

        db.drop_set("abc").unwrap();
        assert!(matches!(db.sparse_state("abc").unwrap(), SparseState::Absent));
    }

    #[test]
    fn dense_blobs_live_under_their_own_prefix() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        db.sparse_add("s", &[1], 5).unwrap();
        assert!(db.read_dense("s").unwrap().is_none());

        db.write_dense("s", b"blob").unwrap();
        assert_eq!(db.read_dense("s").unwrap().as_deref(), Some(&b"blob"[..]));
        // the sparse entry is untouched
        assert!(matches!(db.sparse_state("s").unwrap(), SparseState::Points(_)));

        assert_eq!(db.set_names().unwrap(), vec!["s".to_owned()]);

        db.drop_set("s").unwrap();
        assert!(db.read_dense("s").unwrap().is_none());
        assert!(db.set_names().unwrap().is_empty());
    }
}
