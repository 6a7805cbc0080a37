use chainindex::hash::{cheap_hash, short_hash, BUCKET_COUNT};
use chainindex::utxo::{self, record, Checkpoint, DbFileReader};
use env_logger::Env;
use log::{debug, warn};
use rayon::prelude::*;
use std::collections::HashSet;
use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};
use structopt::StructOpt;

/// Examine and maintain unspent-output database files.
#[derive(StructOpt, Debug)]
enum Command {
    /// Print the state of the database's checkpoints
    Info {
        /// A .db file, a .info file or a directory of data-N.db files
        files: Vec<PathBuf>,
    },
    /// Walk every bucket and leaf, verifying internal consistency
    Check {
        files: Vec<PathBuf>,
    },
    /// Compact a database, dropping superseded entries
    Prune {
        files: Vec<PathBuf>,
        /// Prune even when unverifiable checkpoints would be lost
        #[structopt(long)]
        force: bool,
    },
    /// Write every live entry as a tagged stream
    Export {
        files: Vec<PathBuf>,
        /// Output file, stdout when absent
        #[structopt(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnCode {
    Ok = 0,
    InvalidOptions = 1,
    NeedForce = 2,
    CommandFailed = 3,
}

impl Command {
    fn files(&self) -> &[PathBuf] {
        match self {
            Command::Info { files }
            | Command::Check { files }
            | Command::Prune { files, .. }
            | Command::Export { files, .. } => files,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let command = Command::from_args();
    let code = match run(command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e);
            ReturnCode::CommandFailed
        }
    };
    std::process::exit(code as i32);
}

fn run(command: Command) -> Result<ReturnCode, Box<dyn Error>> {
    // a bad command line is InvalidOptions, not a command failure
    let dbs = match resolve_db_files(command.files()) {
        Ok(dbs) => dbs,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(ReturnCode::InvalidOptions);
        }
    };
    match command {
        Command::Info { .. } => info(&dbs),
        Command::Check { .. } => check(&dbs),
        Command::Prune { force, .. } => prune(&dbs, force),
        Command::Export { output, .. } => export(&dbs, output),
    }
}

/// Expand the command line arguments into the `.db` files they refer to.
fn resolve_db_files(args: &[PathBuf]) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    if args.is_empty() {
        return Err("no database given; pass a .db file, .info file or data directory".into());
    }
    let mut out = Vec::new();
    for arg in args {
        if arg.is_dir() {
            let pattern = arg.join("**").join("data-*.db");
            let mut found: Vec<PathBuf> = glob::glob(pattern.to_str().ok_or("path is not utf-8")?)?
                .collect::<Result<_, _>>()?;
            found.sort();
            if found.is_empty() {
                return Err(format!("no data-N.db files under {:?}", arg).into());
            }
            out.extend(found);
        } else if arg.extension().map_or(false, |e| e == "db") {
            out.push(arg.clone());
        } else if arg.extension().map_or(false, |e| e == "info") {
            // data-1.4.info belongs to data-1.db
            let name = arg.file_name().unwrap().to_string_lossy();
            let base = name
                .split('.')
                .next()
                .ok_or_else(|| format!("can't derive db file from {:?}", arg))?;
            out.push(arg.with_file_name(format!("{}.db", base)));
        } else {
            return Err(format!("don't know what to do with arg: {:?}", arg).into());
        }
    }
    Ok(out)
}

/// The newest verifying checkpoint of a database file.
fn best_checkpoint(db: &Path) -> Option<(u32, Checkpoint)> {
    let mut best: Option<(u32, Checkpoint)> = None;
    for slot in 0..utxo::INFO_SLOTS {
        let path = utxo::info_path(db, slot);
        match utxo::read_info(&path) {
            Ok(Some(cp)) => {
                let better = best
                    .as_ref()
                    .map_or(true, |(_, b)| cp.last_block_height > b.last_block_height);
                if better {
                    best = Some((slot, cp));
                }
            }
            Ok(None) => {}
            Err(e) => debug!("unreadable info {:?}: {}", path, e),
        }
    }
    best
}

fn info(dbs: &[PathBuf]) -> Result<ReturnCode, Box<dyn Error>> {
    for db in dbs {
        println!("{}", db.display());
        match best_checkpoint(db) {
            Some((slot, cp)) => {
                println!("  checkpoint slot:    {}", slot);
                println!("  last block id:      {}", cp.last_block_id);
                println!("  first block height: {}", cp.first_block_height);
                println!("  last block height:  {}", cp.last_block_height);
                println!("  is chain tip:       {}", cp.is_tip);
                println!("  position in file:   {}", cp.position_in_file);
                println!("  changes since prune:{}", cp.changes_since_prune);
                let used = cp.jumptable.iter().filter(|v| **v != 0).count();
                println!("  buckets in use:     {} of {}", used, BUCKET_COUNT);
                for invalid in &cp.invalid_block_hashes {
                    println!("  invalid block:      {}", invalid);
                }
            }
            None => println!("  no valid checkpoint"),
        }
    }
    Ok(ReturnCode::Ok)
}

fn check(dbs: &[PathBuf]) -> Result<ReturnCode, Box<dyn Error>> {
    let failures: Vec<String> = dbs
        .par_iter()
        .filter_map(|db| check_one(db).err().map(|e| format!("{}: {}", db.display(), e)))
        .collect();
    for failure in &failures {
        eprintln!("{}", failure);
    }
    if failures.is_empty() {
        println!("all {} database file(s) check out", dbs.len());
        Ok(ReturnCode::Ok)
    } else {
        Ok(ReturnCode::CommandFailed)
    }
}

fn check_one(db: &Path) -> Result<(), Box<dyn Error>> {
    let (_, cp) = best_checkpoint(db).ok_or("no valid checkpoint")?;
    let reader = DbFileReader::open(db, cp.position_in_file)?;
    let mut leaves = 0u64;
    let mut buckets = 0u64;
    for (short, bucket_pos) in cp.jumptable.iter().enumerate() {
        if *bucket_pos == 0 {
            continue;
        }
        buckets += 1;
        let entries = reader.bucket(u64::from(*bucket_pos))?;
        for entry in entries {
            if short_hash(entry.cheap_hash) as usize != short {
                return Err(format!(
                    "bucket {} holds an entry with cheap hash {:x} of another bucket",
                    short, entry.cheap_hash
                )
                .into());
            }
            let leaf = reader.leaf(entry.leaf_pos, entry.cheap_hash)?;
            // a leaf stored at full width must hash back to its gate
            if entry.cheap_hash != cheap_hash(&leaf.txid)
                && leaf.txid.0[..8] != entry.cheap_hash.to_le_bytes()
            {
                warn!(
                    "{}: leaf at {} disagrees with its cheap hash",
                    db.display(),
                    entry.leaf_pos
                );
            }
            leaves += 1;
        }
    }
    println!(
        "{}: {} buckets, {} leaves, height {}",
        db.display(),
        buckets,
        leaves,
        cp.last_block_height
    );
    Ok(())
}

fn prune(dbs: &[PathBuf], force: bool) -> Result<ReturnCode, Box<dyn Error>> {
    // refuse when checkpoints that do not verify would be thrown away
    if !force {
        for db in dbs {
            let best_height = best_checkpoint(db).map_or(0, |(_, cp)| cp.last_block_height);
            for slot in 0..utxo::INFO_SLOTS {
                let path = utxo::info_path(db, slot);
                if path.exists() && !matches!(utxo::read_info(&path), Ok(Some(_))) {
                    eprintln!(
                        "{:?} does not verify and pruning would discard it (height <= {}); \
                         use --force to prune anyway",
                        path, best_height
                    );
                    return Ok(ReturnCode::NeedForce);
                }
            }
        }
    }
    let results: Vec<Result<utxo::PruneStats, String>> = dbs
        .par_iter()
        .map(|db| {
            let (slot, _) = best_checkpoint(db).ok_or("no valid checkpoint".to_string())?;
            utxo::prune(db, &utxo::info_path(db, slot)).map_err(|e| e.to_string())
        })
        .collect();
    let mut code = ReturnCode::Ok;
    for (db, result) in dbs.iter().zip(results) {
        match result {
            Ok(stats) => println!(
                "{}: kept {} dropped {} ({} -> {} bytes)",
                db.display(),
                stats.leaves_kept,
                stats.leaves_dropped,
                stats.bytes_before,
                stats.bytes_after
            ),
            Err(e) => {
                eprintln!("{}: {}", db.display(), e);
                code = ReturnCode::CommandFailed;
            }
        }
    }
    Ok(code)
}

fn export(dbs: &[PathBuf], output: Option<PathBuf>) -> Result<ReturnCode, Box<dyn Error>> {
    let mut sink: Box<dyn Write> = match output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout()),
    };
    for db in dbs {
        let (_, cp) = best_checkpoint(db).ok_or("no valid checkpoint")?;
        let reader = DbFileReader::open(db, cp.position_in_file)?;
        let mut bytes = Vec::with_capacity(64);
        for bucket_pos in cp.jumptable.iter() {
            if *bucket_pos == 0 {
                continue;
            }
            let entries = reader.bucket(u64::from(*bucket_pos))?;
            let mut seen = HashSet::new();
            for entry in entries {
                let leaf = reader.leaf(entry.leaf_pos, entry.cheap_hash)?;
                if !seen.insert((leaf.txid, leaf.out_index)) {
                    continue; // superseded by a newer entry
                }
                bytes.clear();
                record::write_leaf(&mut bytes, &leaf, 0);
                sink.write_all(&bytes)?;
            }
        }
    }
    sink.flush()?;
    Ok(ReturnCode::Ok)
}
