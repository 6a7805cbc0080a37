use crate::hash::{self, Hash256, BUCKET_COUNT};
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

mod checkpoint;
mod prune;
pub mod record;

pub use checkpoint::{info_path, read_info, Checkpoint, INFO_SLOTS};
pub use prune::{prune, PruneStats};

use record::{Leaf, LeafRef};

/// How many inserts may accumulate before `block_finished` checkpoints.
const CHANGES_CAUSE_STORE: i32 = 50_000;

/// Offset 0 marks an empty bucket in the jumptable, so the file starts
/// with a magic instead of a record.
pub(crate) const FILE_HEADER: &[u8; 4] = b"UODB";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Record(#[from] record::RecordError),

    #[error("no valid checkpoint found in {0}")]
    NoCheckpoint(PathBuf),
}

/// The keyed hash that gates bucket walks. A seam rather than a function
/// so collision handling is testable; production uses keyed SipHash.
pub trait CheapHasher: Send + 'static {
    fn cheap_hash(&self, txid: &Hash256) -> u64;
}

/// Default production hasher.
#[derive(Default, Clone, Copy)]
pub struct SipCheapHasher;

impl CheapHasher for SipCheapHasher {
    fn cheap_hash(&self, txid: &Hash256) -> u64 {
        hash::cheap_hash(txid)
    }
}

/// Crash-consistent map from `(txid, out_index)` to a transaction's
/// location `(block_height, offset_in_block)`.
///
/// A single append-only `.db` file holds leaf and bucket records; a 4 MiB
/// in-memory jumptable maps each 20 bit shorthash to its latest bucket.
/// Consistency comes from the checkpoint ring, see [checkpoint].
pub struct UnspentOutputDatabase<H: CheapHasher = SipCheapHasher> {
    file: File,
    db_path: PathBuf,
    jumptable: Vec<u32>,
    end_of_file: u64,
    hasher: H,

    first_block_height: i32,
    last_block_height: i32,
    last_block_id: Hash256,
    is_tip: bool,
    invalid_block_hashes: Vec<Hash256>,
    changes_since_checkpoint: i32,
    changes_since_prune: i32,
    initial_bucket_size: i32,
    next_info_slot: u32,
    change_count_causes_store: i32,
}

impl UnspentOutputDatabase<SipCheapHasher> {
    /// Open (or create) the database under `basedir`, recovering to the
    /// newest verifying checkpoint.
    pub fn open(basedir: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with_hasher(basedir, SipCheapHasher)
    }
}

impl<H: CheapHasher> UnspentOutputDatabase<H> {
    pub fn open_with_hasher(basedir: impl AsRef<Path>, hasher: H) -> Result<Self, Error> {
        let basedir = basedir.as_ref();
        std::fs::create_dir_all(basedir)?;
        let db_path = basedir.join("data-1.db");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&db_path)?;
        if file.metadata()?.len() == 0 {
            file.write_all_at(FILE_HEADER, 0)?;
        }

        let mut db = UnspentOutputDatabase {
            file,
            db_path,
            jumptable: vec![0u32; BUCKET_COUNT],
            end_of_file: FILE_HEADER.len() as u64,
            hasher,
            first_block_height: -1,
            last_block_height: 0,
            last_block_id: Hash256::default(),
            is_tip: false,
            invalid_block_hashes: Vec::new(),
            changes_since_checkpoint: 0,
            changes_since_prune: 0,
            initial_bucket_size: 0,
            next_info_slot: 0,
            change_count_causes_store: CHANGES_CAUSE_STORE,
        };
        db.recover()?;
        Ok(db)
    }

    /// Pick the best checkpoint and roll the file back to it.
    fn recover(&mut self) -> Result<(), Error> {
        let file_len = self.file.metadata()?.len();
        let mut best: Option<(u32, Checkpoint)> = None;
        for slot in 0..INFO_SLOTS {
            let path = info_path(&self.db_path, slot);
            match read_info(&path) {
                Ok(Some(cp)) => {
                    if cp.position_in_file > file_len {
                        warn!("checkpoint {:?} describes a longer file, skipping", path);
                        continue;
                    }
                    let replace = match &best {
                        Some((_, b)) => cp.last_block_height > b.last_block_height,
                        None => true,
                    };
                    if replace {
                        best = Some((slot, cp));
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("checkpoint {:?} unreadable: {}", path, e),
            }
        }
        match best {
            Some((slot, cp)) => {
                info!(
                    "recovering {:?} to checkpoint at height {} ({} bytes)",
                    self.db_path, cp.last_block_height, cp.position_in_file
                );
                if file_len > cp.position_in_file {
                    self.file.set_len(cp.position_in_file)?;
                }
                self.end_of_file = cp.position_in_file;
                self.jumptable = cp.jumptable;
                self.first_block_height = cp.first_block_height;
                self.last_block_height = cp.last_block_height;
                self.last_block_id = cp.last_block_id;
                self.is_tip = cp.is_tip;
                self.invalid_block_hashes = cp.invalid_block_hashes;
                self.changes_since_prune = cp.changes_since_prune;
                self.initial_bucket_size = cp.initial_bucket_size;
                self.next_info_slot = (slot + 1) % INFO_SLOTS;
                // infos past the chosen one describe a future the file no
                // longer has
                for other in 0..INFO_SLOTS {
                    if other == slot {
                        continue;
                    }
                    let path = info_path(&self.db_path, other);
                    if let Ok(Some(other_cp)) = read_info(&path) {
                        if other_cp.last_block_height > self.last_block_height {
                            let _ = std::fs::remove_file(&path);
                        }
                    }
                }
            }
            None => {
                if file_len > FILE_HEADER.len() as u64 {
                    // data without any checkpoint is unreachable, start over
                    warn!("{:?} has no valid checkpoint, starting empty", self.db_path);
                    self.file.set_len(FILE_HEADER.len() as u64)?;
                }
                self.end_of_file = FILE_HEADER.len() as u64;
            }
        }
        Ok(())
    }

    pub fn blockheight(&self) -> i32 {
        self.last_block_height
    }

    pub fn block_id(&self) -> Hash256 {
        self.last_block_id
    }

    pub fn changes_since_prune(&self) -> i32 {
        self.changes_since_prune
    }

    #[cfg(test)]
    pub(crate) fn set_change_count_causes_store(&mut self, count: i32) {
        self.change_count_causes_store = count;
    }

    /// Append a new leaf for `(txid, out_index)`.
    pub fn insert(
        &mut self,
        txid: &Hash256,
        out_index: u32,
        block_height: i32,
        offset_in_block: i32,
    ) -> Result<(), Error> {
        let cheap = self.hasher.cheap_hash(txid);
        let short = hash::short_hash(cheap) as usize;

        let mut entries = self.load_bucket(short)?;

        let leaf = Leaf {
            txid: *txid,
            out_index,
            block_height,
            offset_in_block,
        };
        let mut bytes = Vec::with_capacity(64);
        record::write_leaf(&mut bytes, &leaf, cheap);
        let leaf_pos = self.append(&bytes)?;

        entries.insert(
            0,
            LeafRef {
                cheap_hash: cheap,
                leaf_pos,
            },
        );
        bytes.clear();
        let bucket_pos = self.end_of_file;
        record::write_bucket(&mut bytes, &entries, bucket_pos);
        self.append(&bytes)?;

        // the previous bucket record is garbage from here on; the pruner
        // collects it
        self.jumptable[short] = bucket_pos as u32;
        self.changes_since_checkpoint += 1;
        self.changes_since_prune += 1;
        Ok(())
    }

    /// The most recent value recorded for `(txid, out_index)`.
    ///
    /// The walk is gated by the 64 bit cheap hash: an entry whose cheap
    /// hash matches but whose leaf holds a different txid ends the search.
    /// Treating such a collision as absent is acceptable because the hash
    /// is keyed over the full txid.
    pub fn find(&self, txid: &Hash256, out_index: u32) -> Result<Option<(i32, i32)>, Error> {
        let cheap = self.hasher.cheap_hash(txid);
        let short = hash::short_hash(cheap) as usize;
        let entries = self.load_bucket(short)?;
        for entry in entries {
            if entry.cheap_hash != cheap {
                continue;
            }
            let leaf = self.load_leaf(entry.leaf_pos, cheap)?;
            if leaf.txid != *txid {
                return Ok(None);
            }
            if leaf.out_index == out_index {
                return Ok(Some((leaf.block_height, leaf.offset_in_block)));
            }
        }
        Ok(None)
    }

    /// Commit everything inserted since the previous call as the state of
    /// `(height, block_id)`. Checkpoints when enough changes accumulated.
    pub fn block_finished(&mut self, height: i32, block_id: &Hash256) -> Result<(), Error> {
        self.last_block_height = height;
        self.last_block_id = *block_id;
        if self.first_block_height < 0 {
            self.first_block_height = height;
        }
        if self.changes_since_checkpoint > self.change_count_causes_store {
            self.save_caches()?;
        }
        Ok(())
    }

    /// Force a checkpoint.
    pub fn save_caches(&mut self) -> Result<(), Error> {
        // the ordering is the crash guarantee: data first, then the
        // snapshot that vouches for it
        self.file.sync_data()?;
        let cp = Checkpoint {
            is_tip: self.is_tip,
            last_block_id: self.last_block_id,
            first_block_height: self.first_block_height,
            last_block_height: self.last_block_height,
            position_in_file: self.end_of_file,
            changes_since_prune: self.changes_since_prune,
            initial_bucket_size: self.initial_bucket_size,
            invalid_block_hashes: self.invalid_block_hashes.clone(),
            jumptable: self.jumptable.clone(),
        };
        let slot = self.next_info_slot;
        checkpoint::write_info(&info_path(&self.db_path, slot), &cp)?;
        self.next_info_slot = (slot + 1) % INFO_SLOTS;
        self.changes_since_checkpoint = 0;
        debug!(
            "checkpointed {:?} slot {} at height {}",
            self.db_path, slot, self.last_block_height
        );
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn append(&mut self, bytes: &[u8]) -> Result<u64, Error> {
        let pos = self.end_of_file;
        self.file.write_all_at(bytes, pos)?;
        self.end_of_file += bytes.len() as u64;
        Ok(pos)
    }

    fn load_bucket(&self, short: usize) -> Result<Vec<LeafRef>, Error> {
        let pos = self.jumptable[short];
        if pos == 0 {
            return Ok(Vec::new());
        }
        let data = read_record(&self.file, u64::from(pos), self.end_of_file)?;
        let (entries, _) = record::read_bucket(&data, u64::from(pos))?;
        Ok(entries)
    }

    fn load_leaf(&self, pos: u64, cheap_hash: u64) -> Result<Leaf, Error> {
        let data = read_record(&self.file, pos, self.end_of_file)?;
        let (leaf, _) = record::read_leaf(&data, cheap_hash)?;
        Ok(leaf)
    }
}

/// Read-only access to the records of a `.db` file, bounded by a
/// checkpoint's `position_in_file`. The pruner and the unspentdb tool
/// walk files through this.
pub struct DbFileReader {
    file: File,
    limit: u64,
}

impl DbFileReader {
    pub fn open(db_path: &Path, limit: u64) -> Result<DbFileReader, Error> {
        let file = File::open(db_path)?;
        let len = file.metadata()?.len();
        Ok(DbFileReader {
            file,
            limit: limit.min(len),
        })
    }

    pub fn bucket(&self, pos: u64) -> Result<Vec<LeafRef>, Error> {
        let data = read_record(&self.file, pos, self.limit)?;
        let (entries, _) = record::read_bucket(&data, pos)?;
        Ok(entries)
    }

    pub fn leaf(&self, pos: u64, cheap_hash: u64) -> Result<Leaf, Error> {
        let data = read_record(&self.file, pos, self.limit)?;
        let (leaf, _) = record::read_leaf(&data, cheap_hash)?;
        Ok(leaf)
    }
}

/// Read enough bytes at `pos` for one record; grows the window until the
/// record's separator is inside it.
fn read_record(file: &File, pos: u64, limit: u64) -> Result<Vec<u8>, Error> {
    if pos >= limit {
        return Err(record::RecordError::Truncated.into());
    }
    let mut window = 256usize;
    loop {
        let available = (limit - pos) as usize;
        let len = window.min(available);
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, pos)?;
        match find_separator(&buf) {
            Some(end) => {
                buf.truncate(end);
                return Ok(buf);
            }
            None if len < available => window *= 2,
            None => return Ok(buf),
        }
    }
}

/// Length of the record ending at the first separator, walking tokens.
fn find_separator(data: &[u8]) -> Option<usize> {
    let mut parser = crate::message::MessageParser::new(crate::buffer::ConstBuffer::from(data));
    loop {
        match parser.next() {
            crate::message::Token::Field { tag, .. } if tag == record::tags::SEPARATOR => {
                return Some(parser.consumed());
            }
            crate::message::Token::Field { .. } => {}
            _ => return None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    pub(crate) fn txid_nr(i: u32) -> Hash256 {
        let mut h = Hash256::default();
        h.0[..4].copy_from_slice(&i.to_le_bytes());
        h.0[12] = 0x5A;
        h
    }

    #[test]
    fn test_insert_find_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = UnspentOutputDatabase::open(dir.path()).unwrap();
        for i in 0..50u32 {
            db.insert(&txid_nr(i), i % 3, 100 + i as i32, 81).unwrap();
        }
        for i in 0..50u32 {
            let found = db.find(&txid_nr(i), i % 3).unwrap();
            assert_eq!(found, Some((100 + i as i32, 81)));
            assert_eq!(db.find(&txid_nr(i), 7).unwrap(), None);
        }
        assert_eq!(db.find(&txid_nr(999), 0).unwrap(), None);
    }

    #[test]
    fn test_newest_value_wins() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = UnspentOutputDatabase::open(dir.path()).unwrap();
        db.insert(&txid_nr(1), 0, 10, 81).unwrap();
        db.insert(&txid_nr(1), 0, 20, 95).unwrap();
        assert_eq!(db.find(&txid_nr(1), 0).unwrap(), Some((20, 95)));
    }

    #[test]
    fn test_same_txid_many_outputs() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = UnspentOutputDatabase::open(dir.path()).unwrap();
        for out in 0..10u32 {
            db.insert(&txid_nr(5), out, 42, 200 + out as i32).unwrap();
        }
        for out in 0..10u32 {
            assert_eq!(
                db.find(&txid_nr(5), out).unwrap(),
                Some((42, 200 + out as i32))
            );
        }
    }

    #[test]
    fn test_snapshot_isolation_across_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut expected = Vec::new();
        {
            let mut db = UnspentOutputDatabase::open(dir.path()).unwrap();
            for i in 0..30u32 {
                db.insert(&txid_nr(i), 0, 7, 90 + i as i32).unwrap();
                expected.push((txid_nr(i), (7, 90 + i as i32)));
            }
            db.block_finished(7, &txid_nr(1000)).unwrap();
            db.save_caches().unwrap();
            // writes after the checkpoint must vanish on recovery
            db.insert(&txid_nr(77), 0, 8, 81).unwrap();
        }
        let db = UnspentOutputDatabase::open(dir.path()).unwrap();
        assert_eq!(db.blockheight(), 7);
        assert_eq!(db.block_id(), txid_nr(1000));
        for (txid, value) in &expected {
            assert_eq!(db.find(txid, 0).unwrap(), Some(*value));
        }
        assert_eq!(db.find(&txid_nr(77), 0).unwrap(), None);
    }

    /// A hasher every key collides under.
    pub(crate) struct ColliderHasher;

    impl CheapHasher for ColliderHasher {
        fn cheap_hash(&self, _txid: &Hash256) -> u64 {
            0x4242
        }
    }

    #[test]
    fn test_cheap_hash_collision_reads_as_absent() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = UnspentOutputDatabase::open_with_hasher(dir.path(), ColliderHasher).unwrap();
        db.insert(&txid_nr(1), 0, 5, 81).unwrap();
        // same cheap hash, different txid: the walk stops at the collision
        assert_eq!(db.find(&txid_nr(2), 0).unwrap(), None);
        assert_eq!(db.find(&txid_nr(1), 0).unwrap(), Some((5, 81)));
    }

    #[test]
    fn test_checkpoint_ring_survives_corruption() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut db = UnspentOutputDatabase::open(dir.path()).unwrap();
            db.insert(&txid_nr(1), 0, 1, 81).unwrap();
            db.block_finished(1, &txid_nr(501)).unwrap();
            db.save_caches().unwrap(); // slot 0
            db.insert(&txid_nr(2), 0, 2, 81).unwrap();
            db.block_finished(2, &txid_nr(502)).unwrap();
            db.save_caches().unwrap(); // slot 1
        }
        // flip a byte inside the stored jumptable of the newest info
        let newest = info_path(&dir.path().join("data-1.db"), 1);
        let mut data = std::fs::read(&newest).unwrap();
        let target = data.len() - 10;
        data[target] ^= 0xFF;
        std::fs::write(&newest, data).unwrap();

        let db = UnspentOutputDatabase::open(dir.path()).unwrap();
        // recovery fell back to the older checkpoint and truncated
        assert_eq!(db.blockheight(), 1);
        assert_eq!(db.find(&txid_nr(1), 0).unwrap(), Some((1, 81)));
        assert_eq!(db.find(&txid_nr(2), 0).unwrap(), None);
    }

    #[test]
    fn test_no_checkpoint_starts_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut db = UnspentOutputDatabase::open(dir.path()).unwrap();
            db.insert(&txid_nr(1), 0, 1, 81).unwrap();
            // dropped without a checkpoint
        }
        let db = UnspentOutputDatabase::open(dir.path()).unwrap();
        assert_eq!(db.find(&txid_nr(1), 0).unwrap(), None);
        assert_eq!(db.blockheight(), 0);
    }

    #[test]
    fn test_threshold_checkpoints_at_block_finished() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut db = UnspentOutputDatabase::open(dir.path()).unwrap();
            db.set_change_count_causes_store(5);
            for i in 0..10u32 {
                db.insert(&txid_nr(i), 0, 3, 90 + i as i32).unwrap();
            }
            db.block_finished(3, &txid_nr(700)).unwrap();
            // threshold crossed, block_finished checkpointed on its own
        }
        let db = UnspentOutputDatabase::open(dir.path()).unwrap();
        assert_eq!(db.blockheight(), 3);
        assert_eq!(db.find(&txid_nr(9), 0).unwrap(), Some((3, 99)));
    }
}
