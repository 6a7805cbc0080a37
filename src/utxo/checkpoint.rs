use super::record::tags;
use super::Error;
use crate::buffer::ConstBuffer;
use crate::cmf::{self, ValueType};
use crate::hash::{double_sha256, read_u32_le, Hash256, BUCKET_COUNT};
use crate::message::{MessageParser, Token};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Size of the checkpoint ring per `.db` file.
pub const INFO_SLOTS: u32 = 20;

/// An atomically written snapshot of the database's jumptable plus the
/// metadata describing which prefix of the `.db` file it vouches for.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub is_tip: bool,
    pub last_block_id: Hash256,
    pub first_block_height: i32,
    pub last_block_height: i32,
    pub position_in_file: u64,
    pub changes_since_prune: i32,
    pub initial_bucket_size: i32,
    pub invalid_block_hashes: Vec<Hash256>,
    pub jumptable: Vec<u32>,
}

/// `data-1.db` keeps its checkpoints in `data-1.K.info`, K in 0..20.
pub fn info_path(db_path: &Path, slot: u32) -> PathBuf {
    let stem = db_path.file_stem().unwrap().to_string_lossy();
    db_path.with_file_name(format!("{}.{}.info", stem, slot))
}

fn jumptable_bytes(jumptable: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(jumptable.len() * 4);
    for value in jumptable {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Write a checkpoint. The caller must have synced the `.db` first; this
/// function syncs the info so a verifying info always describes durable
/// data.
pub fn write_info(path: &Path, cp: &Checkpoint) -> Result<(), Error> {
    debug_assert_eq!(cp.jumptable.len(), BUCKET_COUNT);
    let table = jumptable_bytes(&cp.jumptable);
    let checksum = double_sha256(&table);

    let mut head = Vec::with_capacity(128);
    let int = |head: &mut Vec<u8>, tag: u32, value: i64| {
        if value < 0 {
            cmf::write_token(head, tag, ValueType::NegativeNumber);
            cmf::write_var_int(head, value.unsigned_abs());
        } else {
            cmf::write_token(head, tag, ValueType::PositiveNumber);
            cmf::write_var_int(head, value as u64);
        }
    };
    cmf::write_token(
        &mut head,
        tags::IS_TIP,
        if cp.is_tip {
            ValueType::BoolTrue
        } else {
            ValueType::BoolFalse
        },
    );
    cmf::write_token(&mut head, tags::LAST_BLOCK_ID, ValueType::ByteArray);
    cmf::write_var_int(&mut head, 32);
    head.extend_from_slice(&cp.last_block_id.0);
    int(&mut head, tags::FIRST_BLOCK_HEIGHT, i64::from(cp.first_block_height));
    int(&mut head, tags::LAST_BLOCK_HEIGHT, i64::from(cp.last_block_height));
    cmf::write_token(&mut head, tags::JUMPTABLE_HASH, ValueType::ByteArray);
    cmf::write_var_int(&mut head, 32);
    head.extend_from_slice(&checksum.0);
    int(&mut head, tags::POSITION_IN_FILE, cp.position_in_file as i64);
    int(&mut head, tags::CHANGES_SINCE_PRUNE, i64::from(cp.changes_since_prune));
    int(&mut head, tags::INITIAL_BUCKET_SIZE, i64::from(cp.initial_bucket_size));
    for invalid in &cp.invalid_block_hashes {
        cmf::write_token(&mut head, tags::INVALID_BLOCK_HASH, ValueType::ByteArray);
        cmf::write_var_int(&mut head, 32);
        head.extend_from_slice(&invalid.0);
    }
    cmf::write_token(&mut head, tags::SEPARATOR, ValueType::BoolTrue);

    let mut file = fs::File::create(path)?;
    file.write_all(&head)?;
    file.write_all(&table)?;
    file.sync_all()?;
    Ok(())
}

/// Read and verify one checkpoint slot. `Ok(None)` when the slot does not
/// exist; a slot whose jumptable fails its checksum is also `None` (the
/// caller falls back to older slots).
pub fn read_info(path: &Path) -> Result<Option<Checkpoint>, Error> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut cp = Checkpoint {
        is_tip: false,
        last_block_id: Hash256::default(),
        first_block_height: -1,
        last_block_height: 0,
        position_in_file: 0,
        changes_since_prune: 0,
        initial_bucket_size: 0,
        invalid_block_hashes: Vec::new(),
        jumptable: Vec::new(),
    };
    let mut stored_hash = Hash256::default();
    let mut parser = MessageParser::new(ConstBuffer::from_vec(data.clone()));
    loop {
        match parser.next() {
            Token::Field { tag, .. } => match tag {
                tags::IS_TIP => cp.is_tip = parser.bool_data(),
                tags::LAST_BLOCK_ID => match parser.hash_data() {
                    Some(h) => cp.last_block_id = h,
                    None => return Ok(None),
                },
                tags::FIRST_BLOCK_HEIGHT => cp.first_block_height = parser.int_data() as i32,
                tags::LAST_BLOCK_HEIGHT => cp.last_block_height = parser.int_data() as i32,
                tags::JUMPTABLE_HASH => match parser.hash_data() {
                    Some(h) => stored_hash = h,
                    None => return Ok(None),
                },
                tags::POSITION_IN_FILE => cp.position_in_file = parser.int_data() as u64,
                tags::CHANGES_SINCE_PRUNE => cp.changes_since_prune = parser.int_data() as i32,
                tags::INITIAL_BUCKET_SIZE => cp.initial_bucket_size = parser.int_data() as i32,
                tags::INVALID_BLOCK_HASH => match parser.hash_data() {
                    Some(h) => cp.invalid_block_hashes.push(h),
                    None => return Ok(None),
                },
                tags::SEPARATOR => break,
                _ => return Ok(None),
            },
            _ => return Ok(None),
        }
    }
    let table_start = parser.consumed();
    let table = &data[table_start..];
    if table.len() != BUCKET_COUNT * 4 {
        return Ok(None);
    }
    if double_sha256(table) != stored_hash {
        return Ok(None);
    }
    cp.jumptable = table.chunks(4).map(read_u32_le).collect();
    Ok(Some(cp))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_info_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data-1.0.info");
        let mut jumptable = vec![0u32; BUCKET_COUNT];
        jumptable[17] = 1234;
        jumptable[BUCKET_COUNT - 1] = 99;
        let mut invalid = Hash256::default();
        invalid.0[3] = 8;
        let cp = Checkpoint {
            is_tip: true,
            last_block_id: invalid,
            first_block_height: 1,
            last_block_height: 112,
            position_in_file: 4096,
            changes_since_prune: 10,
            initial_bucket_size: 32,
            invalid_block_hashes: vec![invalid],
            jumptable,
        };
        write_info(&path, &cp).unwrap();
        let back = read_info(&path).unwrap().unwrap();
        assert!(back.is_tip);
        assert_eq!(back.last_block_height, 112);
        assert_eq!(back.first_block_height, 1);
        assert_eq!(back.position_in_file, 4096);
        assert_eq!(back.changes_since_prune, 10);
        assert_eq!(back.invalid_block_hashes, vec![invalid]);
        assert_eq!(back.jumptable[17], 1234);
        assert_eq!(back.jumptable[BUCKET_COUNT - 1], 99);
    }

    #[test]
    fn test_corrupted_table_fails_verification() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data-1.3.info");
        let cp = Checkpoint {
            is_tip: false,
            last_block_id: Hash256::default(),
            first_block_height: 0,
            last_block_height: 5,
            position_in_file: 4,
            changes_since_prune: 0,
            initial_bucket_size: 0,
            invalid_block_hashes: Vec::new(),
            jumptable: vec![0u32; BUCKET_COUNT],
        };
        write_info(&path, &cp).unwrap();
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 1;
        fs::write(&path, data).unwrap();
        assert!(read_info(&path).unwrap().is_none());
    }

    #[test]
    fn test_info_path_shape() {
        let path = info_path(Path::new("/x/data-1.db"), 7);
        assert_eq!(path, Path::new("/x/data-1.7.info"));
    }

    #[test]
    fn test_missing_slot_is_none() {
        assert!(read_info(Path::new("/nonexistent/data-1.0.info"))
            .unwrap()
            .is_none());
    }
}
