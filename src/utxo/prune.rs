use super::checkpoint::{self, Checkpoint};
use super::record::{self, LeafRef};
use super::{DbFileReader, Error, FILE_HEADER, INFO_SLOTS};
use crate::hash::BUCKET_COUNT;
use log::info;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// What a prune run did, for the tool's report.
#[derive(Debug, Default, Clone, Copy)]
pub struct PruneStats {
    pub leaves_kept: u64,
    pub leaves_dropped: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Compact a database file offline.
///
/// Copies only the newest leaf of every `(txid, out_index)` reachable from
/// the checkpoint's jumptable into a fresh file, then swaps the files:
/// originals become `~` backups, the whole sibling `.info` ring is removed
/// (those snapshots describe the superseded file) and one fresh checkpoint
/// is written for the compacted database.
pub fn prune(db_path: &Path, info_path: &Path) -> Result<PruneStats, Error> {
    let cp = checkpoint::read_info(info_path)?
        .ok_or_else(|| Error::NoCheckpoint(info_path.to_path_buf()))?;
    let reader = DbFileReader::open(db_path, cp.position_in_file)?;

    let new_path = db_path.with_extension("db.new");
    let mut out = File::create(&new_path)?;
    let mut out_pos: u64 = 0;
    out.write_all(FILE_HEADER)?;
    out_pos += FILE_HEADER.len() as u64;

    let mut stats = PruneStats {
        bytes_before: cp.position_in_file,
        ..PruneStats::default()
    };
    let mut new_jumptable = vec![0u32; BUCKET_COUNT];
    let mut bytes = Vec::with_capacity(4096);

    for short in 0..BUCKET_COUNT {
        let bucket_pos = cp.jumptable[short];
        if bucket_pos == 0 {
            continue;
        }
        let entries = reader.bucket(u64::from(bucket_pos))?;

        // newest first; only the first hit per (txid, out_index) is live
        let mut seen = HashSet::new();
        let mut live = Vec::with_capacity(entries.len());
        for entry in entries {
            let leaf = reader.leaf(entry.leaf_pos, entry.cheap_hash)?;
            if seen.insert((leaf.txid, leaf.out_index)) {
                live.push((entry.cheap_hash, leaf));
            } else {
                stats.leaves_dropped += 1;
            }
        }

        let mut refs = Vec::with_capacity(live.len());
        for (cheap_hash, leaf) in &live {
            bytes.clear();
            record::write_leaf(&mut bytes, leaf, *cheap_hash);
            out.write_all(&bytes)?;
            refs.push(LeafRef {
                cheap_hash: *cheap_hash,
                leaf_pos: out_pos,
            });
            out_pos += bytes.len() as u64;
            stats.leaves_kept += 1;
        }
        bytes.clear();
        record::write_bucket(&mut bytes, &refs, out_pos);
        out.write_all(&bytes)?;
        new_jumptable[short] = out_pos as u32;
        out_pos += bytes.len() as u64;
    }
    out.sync_all()?;
    stats.bytes_after = out_pos;

    // swap: back up the original, drop the stale info ring, move the new
    // file into place and give it one fresh checkpoint. Rename keeps every
    // step atomic.
    let backup = backup_path(db_path);
    fs::rename(db_path, &backup)?;
    for slot in 0..INFO_SLOTS {
        let stale = checkpoint::info_path(db_path, slot);
        if stale.exists() {
            fs::remove_file(&stale)?;
        }
    }
    fs::rename(&new_path, db_path)?;

    let fresh = Checkpoint {
        is_tip: cp.is_tip,
        last_block_id: cp.last_block_id,
        first_block_height: cp.first_block_height,
        last_block_height: cp.last_block_height,
        position_in_file: out_pos,
        changes_since_prune: 0,
        initial_bucket_size: cp.initial_bucket_size,
        invalid_block_hashes: cp.invalid_block_hashes.clone(),
        jumptable: new_jumptable,
    };
    checkpoint::write_info(&checkpoint::info_path(db_path, 0), &fresh)?;

    info!(
        "pruned {:?}: kept {} leaves, dropped {}, {} -> {} bytes",
        db_path, stats.leaves_kept, stats.leaves_dropped, stats.bytes_before, stats.bytes_after
    );
    Ok(stats)
}

fn backup_path(db_path: &Path) -> std::path::PathBuf {
    let mut name = db_path.file_name().unwrap().to_os_string();
    name.push("~");
    db_path.with_file_name(name)
}

#[cfg(test)]
mod test {
    use super::super::test::txid_nr;
    use super::super::UnspentOutputDatabase;
    use super::*;

    fn build_db(dir: &Path) -> std::path::PathBuf {
        let mut db = UnspentOutputDatabase::open(dir).unwrap();
        for i in 0..40u32 {
            db.insert(&txid_nr(i), 0, 3, 100 + i as i32).unwrap();
        }
        // supersede a few entries, the pruner must drop the old versions
        for i in 0..10u32 {
            db.insert(&txid_nr(i), 0, 4, 500 + i as i32).unwrap();
        }
        db.block_finished(4, &txid_nr(9000)).unwrap();
        db.save_caches().unwrap();
        db.db_path().to_path_buf()
    }

    fn newest_info(db_path: &Path) -> std::path::PathBuf {
        let mut best = None;
        let mut best_height = -1;
        for slot in 0..INFO_SLOTS {
            let path = checkpoint::info_path(db_path, slot);
            if let Ok(Some(cp)) = checkpoint::read_info(&path) {
                if cp.last_block_height > best_height {
                    best_height = cp.last_block_height;
                    best = Some(path);
                }
            }
        }
        best.unwrap()
    }

    #[test]
    fn test_prune_drops_superseded_and_preserves_lookups() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = build_db(dir.path());
        let stats = prune(&db_path, &newest_info(&db_path)).unwrap();
        assert_eq!(stats.leaves_kept, 40);
        assert_eq!(stats.leaves_dropped, 10);
        assert!(stats.bytes_after < stats.bytes_before);
        assert!(backup_path(&db_path).exists());

        let db = UnspentOutputDatabase::open(dir.path()).unwrap();
        assert_eq!(db.blockheight(), 4);
        for i in 0..10u32 {
            assert_eq!(db.find(&txid_nr(i), 0).unwrap(), Some((4, 500 + i as i32)));
        }
        for i in 10..40u32 {
            assert_eq!(db.find(&txid_nr(i), 0).unwrap(), Some((3, 100 + i as i32)));
        }
        assert_eq!(db.changes_since_prune(), 0);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = build_db(dir.path());
        prune(&db_path, &newest_info(&db_path)).unwrap();
        let first = checkpoint::read_info(&newest_info(&db_path)).unwrap().unwrap();
        let first_bytes = std::fs::read(&db_path).unwrap();

        prune(&db_path, &newest_info(&db_path)).unwrap();
        let second = checkpoint::read_info(&newest_info(&db_path)).unwrap().unwrap();
        let second_bytes = std::fs::read(&db_path).unwrap();

        assert_eq!(first.jumptable, second.jumptable);
        assert_eq!(first_bytes, second_bytes);
    }
}
