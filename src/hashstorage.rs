use crate::hash::{read_u32_le, Hash256};
use fxhash::FxHashMap;
use log::{info, warn};
use memmap2::Mmap;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const WIDTH: usize = 32;
const RECORD: usize = WIDTH + 4;

// A finalized file should stay comfortably under a 256MB map, and parts get
// an equal share of the whole, hence 8 parts of ~932k records each.
const PART_SPILL: usize = 932_064;
const MAX_PARTS: usize = 7;

/// Location of a hash inside a [HashStorage]: which rolling database and
/// which dense row within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId {
    pub db: u32,
    pub row: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("duplicate hash found while merging parts")]
    DuplicateHash,

    #[error("row {0} out of bounds")]
    RowOutOfBounds(u32),
}

/// Append-only dictionary assigning dense integer rows to 32 byte hashes.
///
/// Spans several rolling databases; [HashStorage::finalize] seals the
/// current one and starts the next. Appends are serialized internally.
pub struct HashStorage {
    basedir: PathBuf,
    dbs: Mutex<Vec<HashList>>,
    spill: usize,
}

impl HashStorage {
    pub fn open(basedir: impl AsRef<Path>) -> Result<HashStorage, Error> {
        Self::open_with_spill(basedir, PART_SPILL)
    }

    // The spill threshold is only lowered by tests that want to exercise
    // parts and merges with a handful of entries.
    pub(crate) fn open_with_spill(
        basedir: impl AsRef<Path>,
        spill: usize,
    ) -> Result<HashStorage, Error> {
        let basedir = basedir.as_ref().to_path_buf();
        fs::create_dir_all(&basedir)?;
        let mut dbs = Vec::new();
        let mut index = 1;
        loop {
            let base = db_base(&basedir, index);
            if !base.with_extension("db").exists() && !base.with_extension("log").exists() {
                break;
            }
            dbs.push(HashList::open(base)?);
            index += 1;
        }
        if dbs.is_empty() {
            dbs.push(HashList::open(db_base(&basedir, 1))?);
        } else if dbs.last().unwrap().is_finalized() {
            // a crash between finalize and creating the successor leaves
            // no appendable db behind
            let next = dbs.len() + 1;
            dbs.push(HashList::open(db_base(&basedir, next))?);
        }
        info!("hashstorage at {:?} opened with {} dbs", basedir, dbs.len());
        Ok(HashStorage {
            basedir,
            dbs: Mutex::new(dbs),
            spill,
        })
    }

    pub fn database_count(&self) -> usize {
        self.dbs.lock().unwrap().len()
    }

    /// Append a hash, returning its stable row id.
    pub fn append(&self, hash: &Hash256) -> Result<RowId, Error> {
        let mut dbs = self.dbs.lock().unwrap();
        let db_index = dbs.len() - 1;
        let list = dbs.last_mut().unwrap();
        let row = list.append(hash)?;
        if list.cache_len() > self.spill {
            list.stabilize()?;
        } else if list.part_count() > MAX_PARTS {
            Self::finalize_locked(&self.basedir, &mut dbs)?;
        }
        Ok(RowId {
            db: db_index as u32,
            row,
        })
    }

    /// The hash previously appended at `point`, if any.
    pub fn find(&self, point: RowId) -> Option<Hash256> {
        let dbs = self.dbs.lock().unwrap();
        dbs.get(point.db as usize)?.at(point.row)
    }

    /// Search every db, newest first.
    pub fn lookup(&self, hash: &Hash256) -> Option<RowId> {
        let dbs = self.dbs.lock().unwrap();
        for (i, list) in dbs.iter().enumerate().rev() {
            if let Some(row) = list.lookup(hash) {
                return Some(RowId { db: i as u32, row });
            }
        }
        None
    }

    /// Seal the current db into one sorted file and start a fresh db.
    pub fn finalize(&self) -> Result<(), Error> {
        let mut dbs = self.dbs.lock().unwrap();
        Self::finalize_locked(&self.basedir, &mut dbs)
    }

    fn finalize_locked(basedir: &Path, dbs: &mut Vec<HashList>) -> Result<(), Error> {
        dbs.last_mut().unwrap().finalize()?;
        let next = dbs.len() + 1;
        dbs.push(HashList::open(db_base(basedir, next))?);
        Ok(())
    }
}

fn db_base(basedir: &Path, index: usize) -> PathBuf {
    basedir.join(format!("hashlist-{:03}", index))
}

/// One rolling database: a write log, up to eight sorted parts and,
/// once finalized, a single sorted file with a reverse lookup.
struct HashList {
    file_base: PathBuf,
    next_id: u32,
    cache: FxHashMap<Hash256, u32>,
    log: Option<File>,
    parts: Vec<Part>,
    sorted: Option<Mmap>,
    reverse: Option<Mmap>,
    offsets: [u32; 256],
}

struct Part {
    sorted: Mmap,
    reverse: Mmap,
    first_row: u32,
}

impl Part {
    fn rows(&self) -> usize {
        self.sorted.len() / RECORD
    }
}

impl HashList {
    fn open(file_base: PathBuf) -> Result<HashList, Error> {
        let mut list = HashList {
            file_base,
            next_id: 0,
            cache: FxHashMap::default(),
            log: None,
            parts: Vec::new(),
            sorted: None,
            reverse: None,
            offsets: [0u32; 256],
        };
        let (part_count, have_offsets) = list.read_info()?;

        let sorted_path = list.path("db");
        if sorted_path.exists() {
            // finalized; a leftover log describes a state the db supersedes
            let log_path = list.path("log");
            if log_path.exists() {
                warn!("discarding stale log next to finalized {:?}", sorted_path);
                fs::remove_file(&log_path)?;
            }
            list.sorted = map_readonly(&sorted_path)?;
            list.reverse = map_readonly(&list.path("index"))?;
            if !have_offsets {
                info!("upgrading {:?} to have a jumptable", list.file_base);
                list.fill_offsets();
                list.write_info(0)?;
            }
            return Ok(list);
        }

        // not finalized, replay the log into the cache
        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(list.path("log"))?;
        let mut consumed = 0u64;
        let mut buf = [0u8; WIDTH];
        loop {
            match read_exact_or_eof(&mut log, &mut buf)? {
                true => {
                    list.cache.insert(Hash256(buf), list.next_id);
                    list.next_id += 1;
                    consumed += WIDTH as u64;
                }
                false => break,
            }
        }
        // a torn append leaves a partial record; drop it
        if log.metadata()?.len() != consumed {
            warn!("truncating torn write log {:?}", list.path("log"));
            log.set_len(consumed)?;
        }
        log.seek(SeekFrom::Start(consumed))?;
        list.log = Some(log);

        let mut first_row = 0u32;
        for i in 0..part_count {
            let base = list.part_base(i);
            let sorted = map_part_file(&base.with_extension("db"))?;
            let reverse = map_part_file(&base.with_extension("index"))?;
            let rows = sorted.len() / RECORD;
            list.parts.push(Part {
                sorted,
                reverse,
                first_row,
            });
            first_row += rows as u32;
        }
        // cached rows follow the part rows; next_id counted only the log
        let log_rows = list.next_id;
        list.next_id = first_row + log_rows;
        let mut remapped = FxHashMap::default();
        for (hash, row) in list.cache.drain() {
            remapped.insert(hash, row + first_row);
        }
        list.cache = remapped;
        Ok(list)
    }

    fn path(&self, ext: &str) -> PathBuf {
        self.file_base.with_extension(ext)
    }

    fn part_base(&self, index: usize) -> PathBuf {
        let mut name = self.file_base.file_name().unwrap().to_os_string();
        name.push(format!("_{:02}", index));
        self.file_base.with_file_name(name)
    }

    fn is_finalized(&self) -> bool {
        self.log.is_none()
    }

    fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn part_count(&self) -> usize {
        self.parts.len()
    }

    fn append(&mut self, hash: &Hash256) -> Result<u32, Error> {
        let id = self.next_id;
        self.next_id += 1;
        let log = self.log.as_mut().expect("append on finalized db");
        log.write_all(&hash.0)?;
        self.cache.insert(*hash, id);
        Ok(id)
    }

    fn lookup(&self, hash: &Hash256) -> Option<u32> {
        if let Some(row) = self.cache.get(hash) {
            return Some(*row);
        }
        if let Some(sorted) = &self.sorted {
            let first = usize::from(hash.partition_byte());
            let start = self.offsets[first] as usize / RECORD;
            let end = if first == 255 {
                sorted.len() / RECORD
            } else {
                self.offsets[first + 1] as usize / RECORD
            };
            if let Some(row) = binary_search(sorted, start, end, hash) {
                return Some(row);
            }
        }
        for part in &self.parts {
            if let Some(row) = binary_search(&part.sorted, 0, part.rows(), hash) {
                return Some(row);
            }
        }
        None
    }

    fn at(&self, row: u32) -> Option<Hash256> {
        if let (Some(sorted), Some(reverse)) = (&self.sorted, &self.reverse) {
            if row as usize * 4 >= reverse.len() {
                return None;
            }
            let sorted_row = read_u32_le(&reverse[row as usize * 4..]) as usize;
            return Hash256::from_slice(&sorted[sorted_row * RECORD..sorted_row * RECORD + WIDTH]);
        }
        for part in &self.parts {
            let rows = part.rows() as u32;
            if row >= part.first_row && row < part.first_row + rows {
                let rel = (row - part.first_row) as usize;
                let sorted_row = read_u32_le(&part.reverse[rel * 4..]) as usize;
                return Hash256::from_slice(
                    &part.sorted[sorted_row * RECORD..sorted_row * RECORD + WIDTH],
                );
            }
        }
        // slow path over the dirty cache
        self.cache
            .iter()
            .find(|(_, r)| **r == row)
            .map(|(hash, _)| *hash)
    }

    /// Spill the write-log map into a new sorted part, truncating the log.
    fn stabilize(&mut self) -> Result<(), Error> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let part_index = self.parts.len();
        let base = self.part_base(part_index);
        let first_row = self
            .parts
            .last()
            .map(|p| p.first_row + p.rows() as u32)
            .unwrap_or(0);

        let mut pairs: Vec<(&Hash256, u32)> = self.cache.iter().map(|(h, r)| (h, *r)).collect();
        pairs.sort_by(|a, b| a.0.cmp_reversed(b.0));

        let mut sorted_file = File::create(base.with_extension("db"))?;
        let mut reverse_rows = BTreeMap::new();
        for (pos, (hash, row)) in pairs.iter().enumerate() {
            sorted_file.write_all(&hash.0)?;
            sorted_file.write_all(&row.to_le_bytes())?;
            reverse_rows.insert(*row, pos as u32);
        }
        sorted_file.sync_all()?;
        let mut reverse_file = File::create(base.with_extension("index"))?;
        for pos in reverse_rows.values() {
            reverse_file.write_all(&pos.to_le_bytes())?;
        }
        reverse_file.sync_all()?;

        self.cache.clear();
        let log = self.log.as_mut().unwrap();
        log.set_len(0)?;
        log.seek(SeekFrom::Start(0))?;

        self.parts.push(Part {
            sorted: map_part_file(&base.with_extension("db"))?,
            reverse: map_part_file(&base.with_extension("index"))?,
            first_row,
        });
        self.write_info(self.parts.len())?;
        Ok(())
    }

    /// Merge every part into one sorted file plus one reverse lookup.
    fn finalize(&mut self) -> Result<(), Error> {
        if !self.cache.is_empty() {
            self.stabilize()?;
        }
        debug_assert!(self.sorted.is_none());

        let tmp_db = self.path("db.tmp");
        let tmp_index = self.path("index.tmp");
        {
            let mut out = File::create(&tmp_db)?;
            let mut collector = Collector::new(&self.parts)?;
            let mut reverse_rows = BTreeMap::new();
            let mut written = 0u32;
            while let Some((hash, row)) = collector.pop()? {
                out.write_all(&hash.0)?;
                out.write_all(&row.to_le_bytes())?;
                reverse_rows.insert(row, written);
                written += 1;
            }
            out.sync_all()?;
            let mut reverse = File::create(&tmp_index)?;
            for pos in reverse_rows.values() {
                reverse.write_all(&pos.to_le_bytes())?;
            }
            reverse.sync_all()?;
        }
        fs::rename(&tmp_db, self.path("db"))?;
        fs::rename(&tmp_index, self.path("index"))?;
        self.sorted = map_readonly(&self.path("db"))?;
        self.reverse = map_readonly(&self.path("index"))?;

        // only now is it safe to drop the merge inputs
        let part_count = self.parts.len();
        self.parts.clear();
        for i in 0..part_count {
            let base = self.part_base(i);
            fs::remove_file(base.with_extension("db"))?;
            fs::remove_file(base.with_extension("index"))?;
        }
        self.log = None;
        fs::remove_file(self.path("log"))?;

        self.fill_offsets();
        self.write_info(0)?;
        Ok(())
    }

    /// Compute the 256-entry jumptable over the finalized file.
    fn fill_offsets(&mut self) {
        let mut offsets = [0u32; 256];
        if let Some(sorted) = self.sorted.as_ref() {
            let mut filled = 0usize;
            let mut offset = 0usize;
            while offset < sorted.len() {
                let partition = usize::from(sorted[offset + WIDTH - 1]);
                while filled < partition {
                    filled += 1;
                    offsets[filled] = offset as u32;
                }
                offset += RECORD;
            }
            while filled < 255 {
                filled += 1;
                offsets[filled] = offset as u32;
            }
        }
        self.offsets = offsets;
    }

    fn read_info(&mut self) -> Result<(usize, bool), Error> {
        let path = self.path("info");
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, false)),
            Err(e) => return Err(e.into()),
        };
        if data.len() < 8 {
            return Ok((0, false));
        }
        self.next_id = read_u32_le(&data[0..]);
        let part_count = read_u32_le(&data[4..]) as usize;
        // older layouts stopped before the jumptable
        if data.len() < 8 + 256 * 4 {
            return Ok((part_count, false));
        }
        for i in 0..256 {
            self.offsets[i] = read_u32_le(&data[8 + i * 4..]);
        }
        Ok((part_count, true))
    }

    fn write_info(&self, part_count: usize) -> Result<(), Error> {
        let mut out = Vec::with_capacity(8 + 256 * 4);
        out.extend_from_slice(&self.next_id.to_le_bytes());
        out.extend_from_slice(&(part_count as u32).to_le_bytes());
        for offset in self.offsets.iter() {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        fs::write(self.path("info"), out)?;
        Ok(())
    }
}

fn binary_search(map: &[u8], lo: usize, hi: usize, hash: &Hash256) -> Option<u32> {
    let mut lo = lo as isize;
    let mut hi = hi as isize - 1;
    while lo <= hi {
        let mid = ((lo + hi) / 2) as usize;
        let record = &map[mid * RECORD..mid * RECORD + RECORD];
        let candidate = Hash256::from_slice(&record[..WIDTH]).unwrap();
        match candidate.cmp_reversed(hash) {
            Ordering::Less => lo = mid as isize + 1,
            Ordering::Greater => hi = mid as isize - 1,
            Ordering::Equal => return Some(read_u32_le(&record[WIDTH..])),
        }
    }
    None
}

/// K-way merge over the sorted parts: one cursor per part, the smallest
/// tip wins each round. Duplicate hashes across parts are impossible by
/// construction; seeing one means the storage is corrupt.
struct Collector<'a> {
    cursors: Vec<(usize, usize)>, // (part index, record position)
    tips: Vec<(Hash256, u32, usize)>,
    parts: &'a [Part],
}

impl<'a> Collector<'a> {
    fn new(parts: &'a [Part]) -> Result<Collector<'a>, Error> {
        let mut collector = Collector {
            cursors: (0..parts.len()).map(|i| (i, 0)).collect(),
            tips: Vec::with_capacity(parts.len()),
            parts,
        };
        for i in 0..parts.len() {
            collector.advance(i)?;
        }
        Ok(collector)
    }

    fn advance(&mut self, part_index: usize) -> Result<(), Error> {
        let pos = &mut self.cursors[part_index].1;
        let part = &self.parts[part_index];
        if *pos >= part.rows() {
            return Ok(());
        }
        let record = &part.sorted[*pos * RECORD..*pos * RECORD + RECORD];
        let hash = Hash256::from_slice(&record[..WIDTH]).unwrap();
        let row = read_u32_le(&record[WIDTH..]);
        *pos += 1;

        let insert_at = match self
            .tips
            .binary_search_by(|probe| probe.0.cmp_reversed(&hash))
        {
            Ok(_) => return Err(Error::DuplicateHash),
            Err(i) => i,
        };
        self.tips.insert(insert_at, (hash, row, part_index));
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<(Hash256, u32)>, Error> {
        if self.tips.is_empty() {
            return Ok(None);
        }
        let (hash, row, part_index) = self.tips.remove(0);
        self.advance(part_index)?;
        Ok(Some((hash, row)))
    }
}

// The maps stay valid because these files are only ever replaced through
// rename, never truncated or rewritten in place. Zero-length files cannot
// be mapped; an empty finalized db reads as None.
#[allow(unsafe_code)]
fn map_readonly(path: &Path) -> Result<Option<Mmap>, Error> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    let map = unsafe { Mmap::map(&file)? };
    Ok(Some(map))
}

fn map_part_file(path: &Path) -> Result<Mmap, Error> {
    map_readonly(path)?.ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("part file {:?} is empty", path),
        ))
    })
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;

    fn hash_nr(i: u32) -> Hash256 {
        let mut h = Hash256::default();
        h.0[0] = (i & 0xFF) as u8;
        h.0[1] = ((i >> 8) & 0xFF) as u8;
        h.0[31] = (i.wrapping_mul(37) & 0xFF) as u8;
        h
    }

    #[test]
    fn test_append_lookup_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = HashStorage::open(dir.path()).unwrap();
        let mut points = Vec::new();
        for i in 0..500 {
            let h = hash_nr(i);
            let point = storage.append(&h).unwrap();
            points.push((h, point));
        }
        for (h, point) in &points {
            assert_eq!(storage.find(*point).unwrap(), *h);
            assert_eq!(storage.lookup(h).unwrap(), *point);
        }
        assert!(storage.lookup(&hash_nr(10_000)).is_none());
    }

    #[test]
    fn test_roundtrip_across_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut points = Vec::new();
        {
            let storage = HashStorage::open(dir.path()).unwrap();
            for i in 0..100 {
                points.push((hash_nr(i), storage.append(&hash_nr(i)).unwrap()));
            }
        }
        let storage = HashStorage::open(dir.path()).unwrap();
        for (h, point) in &points {
            assert_eq!(storage.lookup(h).unwrap(), *point);
            assert_eq!(storage.find(*point).unwrap(), *h);
        }
        // rows keep counting where the log left off
        let next = storage.append(&hash_nr(4242)).unwrap();
        assert_eq!(next.row, 100);
    }

    #[test]
    fn test_roundtrip_across_parts_and_finalize() {
        let dir = tempfile::TempDir::new().unwrap();
        // tiny spill threshold forces several parts
        let storage = HashStorage::open_with_spill(dir.path(), 40).unwrap();
        let mut points = Vec::new();
        for i in 0..200 {
            points.push((hash_nr(i), storage.append(&hash_nr(i)).unwrap()));
        }
        storage.finalize().unwrap();
        assert_eq!(storage.database_count(), 2);
        for (h, point) in &points {
            assert_eq!(storage.lookup(h).unwrap(), *point, "lookup {}", h);
            assert_eq!(storage.find(*point).unwrap(), *h);
        }
        // appends continue in the fresh db
        let fresh = storage.append(&hash_nr(9999)).unwrap();
        assert_eq!(fresh, RowId { db: 1, row: 0 });
        assert_eq!(storage.lookup(&hash_nr(9999)).unwrap(), fresh);
    }

    #[test]
    fn test_finalized_file_is_sorted_without_duplicates() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = HashStorage::open_with_spill(dir.path(), 25).unwrap();
        for i in 0..120 {
            storage.append(&hash_nr(i)).unwrap();
        }
        storage.finalize().unwrap();
        drop(storage);

        let data = fs::read(dir.path().join("hashlist-001.db")).unwrap();
        assert_eq!(data.len() % RECORD, 0);
        assert_eq!(data.len() / RECORD, 120);
        let mut prev: Option<Hash256> = None;
        for record in data.chunks(RECORD) {
            let hash = Hash256::from_slice(&record[..WIDTH]).unwrap();
            if let Some(p) = prev {
                assert_eq!(p.cmp_reversed(&hash), Ordering::Less);
            }
            prev = Some(hash);
        }
    }

    #[test]
    fn test_restart_after_finalize() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut points = Vec::new();
        {
            let storage = HashStorage::open_with_spill(dir.path(), 30).unwrap();
            for i in 0..90 {
                points.push((hash_nr(i), storage.append(&hash_nr(i)).unwrap()));
            }
            storage.finalize().unwrap();
        }
        let storage = HashStorage::open(dir.path()).unwrap();
        assert_eq!(storage.database_count(), 2);
        for (h, point) in &points {
            assert_eq!(storage.lookup(h).unwrap(), *point);
            assert_eq!(storage.find(*point).unwrap(), *h);
        }
    }

    #[test]
    fn test_torn_log_truncated_on_open() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let storage = HashStorage::open(dir.path()).unwrap();
            storage.append(&hash_nr(1)).unwrap();
            storage.append(&hash_nr(2)).unwrap();
        }
        let log = dir.path().join("hashlist-001.log");
        let mut data = fs::read(&log).unwrap();
        data.extend_from_slice(&[0xAA; 10]); // a torn third append
        fs::write(&log, data).unwrap();

        let storage = HashStorage::open(dir.path()).unwrap();
        assert_eq!(storage.lookup(&hash_nr(2)).unwrap().row, 1);
        let next = storage.append(&hash_nr(3)).unwrap();
        assert_eq!(next.row, 2);
    }
}
