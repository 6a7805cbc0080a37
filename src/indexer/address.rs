use super::BlockSource;
use crate::api::{blockchain, tag};
use crate::hash::{Hash160, Hash256};
use crate::hashstorage::HashStorage;
use crate::message::{MessageParser, Token};
use log::{debug, error, info};
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Usage rows: which outputs ever paid to an address. The key carries the
/// hash-storage coordinates of the address, the value the output's
/// position.
const USAGE_TABLE: MultimapTableDefinition<(u32, u32), (i32, i32, u32)> =
    MultimapTableDefinition::new("address_usage");

/// Single-row metadata, most importantly the height everything below is
/// committed for.
const INTS_TABLE: TableDefinition<&str, i32> = TableDefinition::new("ints");

const LAST_KNOWN_STATE: &str = "last_known_state";

#[derive(Debug, thiserror::Error)]
pub enum AddressDbError {
    #[error(transparent)]
    Hashes(#[from] crate::hashstorage::Error),

    #[error(transparent)]
    Db(#[from] redb::Error),
}

/// One hit for an address query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressUsage {
    pub block_height: i32,
    pub offset_in_block: i32,
    pub out_index: u32,
}

struct PendingRow {
    db: u32,
    row: u32,
    usage: AddressUsage,
}

enum DirtyCmd {
    Batch(Vec<PendingRow>, i32),
    Flush(SyncSender<()>),
}

/// Maps 160 bit address hashes to the outputs that paid them.
///
/// Addresses get a dense row id from a [HashStorage]; the usage rows live
/// in a transactional redb file. Writes are batched per block and
/// committed from a worker thread so the indexing thread is not stalled
/// by the slowest store.
pub struct AddressIndexer {
    addresses: HashStorage,
    db: Arc<Database>,
    pending: Mutex<Vec<PendingRow>>,
    worker: SyncSender<DirtyCmd>,
    worker_join: Mutex<Option<JoinHandle<()>>>,
    cached_height: AtomicI32,
}

impl AddressIndexer {
    pub fn open(basedir: impl AsRef<Path>) -> Result<AddressIndexer, AddressDbError> {
        let basedir = basedir.as_ref();
        std::fs::create_dir_all(basedir).map_err(crate::hashstorage::Error::Io)?;
        let addresses = HashStorage::open(basedir)?;
        let db = Database::create(basedir.join("addresses.redb")).map_err(redb::Error::from)?;

        // make sure both tables exist before anything reads
        let txn = db.begin_write().map_err(redb::Error::from)?;
        txn.open_multimap_table(USAGE_TABLE)
            .map_err(redb::Error::from)?;
        txn.open_table(INTS_TABLE).map_err(redb::Error::from)?;
        txn.commit().map_err(redb::Error::from)?;

        let height = {
            let txn = db.begin_read().map_err(redb::Error::from)?;
            let table = txn.open_table(INTS_TABLE).map_err(redb::Error::from)?;
            table
                .get(LAST_KNOWN_STATE)
                .map_err(redb::Error::from)?
                .map(|g| g.value())
                .unwrap_or(0)
        };
        info!("address index at height {}", height);

        let db = Arc::new(db);
        let worker_db = Arc::clone(&db);
        let (send, recv) = sync_channel::<DirtyCmd>(16);
        let join = std::thread::Builder::new()
            .name("address-dirty-data".into())
            .spawn(move || {
                while let Ok(cmd) = recv.recv() {
                    match cmd {
                        DirtyCmd::Batch(rows, height) => {
                            if let Err(e) = commit_batch(&worker_db, rows, height) {
                                error!("address db commit failed: {}", e);
                                return;
                            }
                        }
                        DirtyCmd::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .expect("spawning address worker");

        Ok(AddressIndexer {
            addresses,
            db,
            pending: Mutex::new(Vec::new()),
            worker: send,
            worker_join: Mutex::new(Some(join)),
            cached_height: AtomicI32::new(height),
        })
    }

    pub fn blockheight(&self) -> i32 {
        self.cached_height.load(Ordering::Relaxed)
    }

    /// Record that `out_index` of the transaction at `(height, offset)`
    /// pays to `address`.
    pub fn insert(
        &self,
        address: &Hash160,
        out_index: u32,
        block_height: i32,
        offset_in_block: i32,
    ) -> Result<(), AddressDbError> {
        let wide = address.widen();
        let point = match self.addresses.lookup(&wide) {
            Some(point) => point,
            None => self.addresses.append(&wide)?,
        };
        self.pending.lock().unwrap().push(PendingRow {
            db: point.db,
            row: point.row,
            usage: AddressUsage {
                block_height,
                offset_in_block,
                out_index,
            },
        });
        Ok(())
    }

    /// Hand everything since the previous block to the commit worker.
    pub fn block_finished(&self, block_height: i32, _block_id: &Hash256) {
        let rows = std::mem::take(&mut *self.pending.lock().unwrap());
        if self
            .worker
            .send(DirtyCmd::Batch(rows, block_height))
            .is_err()
        {
            error!("address worker is gone, dropping block {}", block_height);
            return;
        }
        self.cached_height.store(block_height, Ordering::Relaxed);
    }

    /// Wait until every handed-off batch reached the database.
    pub fn flush(&self) {
        let (ack_send, ack_recv) = sync_channel(0);
        if self.worker.send(DirtyCmd::Flush(ack_send)).is_ok() {
            let _ = ack_recv.recv_timeout(Duration::from_secs(60));
        }
    }

    /// Every output that ever paid `address`, committed state only.
    pub fn find(&self, address: &Hash160) -> Vec<AddressUsage> {
        let point = match self.addresses.lookup(&address.widen()) {
            Some(point) => point,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        let result: Result<(), redb::Error> = (|| {
            let txn = self.db.begin_read()?;
            let table = txn.open_multimap_table(USAGE_TABLE)?;
            for guard in table.get((point.db, point.row))? {
                let (block_height, offset_in_block, out_index) = guard?.value();
                out.push(AddressUsage {
                    block_height,
                    offset_in_block,
                    out_index,
                });
            }
            Ok(())
        })();
        if let Err(e) = result {
            error!("address query failed: {}", e);
        }
        out
    }
}

impl Drop for AddressIndexer {
    fn drop(&mut self) {
        self.flush();
        // closing the channel ends the worker
        let (sink, _) = sync_channel(0);
        let _ = std::mem::replace(&mut self.worker, sink);
        if let Some(join) = self.worker_join.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

fn commit_batch(db: &Database, rows: Vec<PendingRow>, height: i32) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    {
        let mut usage = txn.open_multimap_table(USAGE_TABLE)?;
        for row in &rows {
            usage.insert(
                (row.db, row.row),
                (
                    row.usage.block_height,
                    row.usage.offset_in_block,
                    row.usage.out_index,
                ),
            )?;
        }
        let mut ints = txn.open_table(INTS_TABLE)?;
        ints.insert(LAST_KNOWN_STATE, height)?;
    }
    txn.commit()?;
    Ok(())
}

/// Consumer thread feeding the address database from block replies.
pub(super) fn spawn(source: BlockSource, db: Arc<AddressIndexer>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("address-indexer".into())
        .spawn(move || run(source, db))
        .expect("spawning address indexer thread")
}

fn run(source: BlockSource, db: Arc<AddressIndexer>) {
    while !source.stop_requested() {
        let want = db.blockheight() + 1;
        debug!("address indexer wants block {}", want);
        let message = match source.next_block(want, Duration::from_secs(30)) {
            Some(m) => m,
            None => continue,
        };
        if let Err(e) = index_block(&db, message.body()) {
            error!("address indexer giving up: {}", e);
            return;
        }
    }
}

fn index_block(
    db: &AddressIndexer,
    body: &crate::buffer::ConstBuffer,
) -> Result<(), AddressDbError> {
    let mut block_height = -1i32;
    let mut block_id = Hash256::default();
    let mut tx_offset = 0i32;
    let mut out_index = 0u32;

    let mut parser = MessageParser::new(body.clone());
    while let Token::Field { tag, .. } = parser.next() {
        match tag {
            tag::BLOCK_HEIGHT => block_height = parser.int_data() as i32,
            blockchain::BLOCK_HASH => {
                if let Some(hash) = parser.hash_data() {
                    block_id = hash;
                }
            }
            blockchain::TX_OFFSET_IN_BLOCK => tx_offset = parser.int_data() as i32,
            blockchain::TX_OUT_INDEX => out_index = parser.int_data() as u32,
            blockchain::TX_OUT_ADDRESS => {
                if parser.data_len() == 20 {
                    let ripe = Hash160::from_slice(&parser.bytes_data()).unwrap();
                    db.insert(&ripe, out_index, block_height, tx_offset)?;
                }
            }
            tag::SEPARATOR => {
                tx_offset = 0;
                out_index = 0;
            }
            _ => {}
        }
    }
    db.block_finished(block_height, &block_id);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::service;
    use crate::message::MessageBuilder;

    fn ripe(i: u8) -> Hash160 {
        let mut h = Hash160::default();
        h.0[0] = i;
        h.0[10] = 0x66;
        h
    }

    #[test]
    fn test_insert_find_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = AddressIndexer::open(dir.path()).unwrap();
        db.insert(&ripe(1), 0, 2, 81).unwrap();
        db.insert(&ripe(1), 3, 5, 400).unwrap();
        db.insert(&ripe(2), 1, 2, 81).unwrap();
        db.block_finished(5, &Hash256::default());
        db.flush();

        let mut hits = db.find(&ripe(1));
        hits.sort_by_key(|u| u.block_height);
        assert_eq!(
            hits,
            vec![
                AddressUsage {
                    block_height: 2,
                    offset_in_block: 81,
                    out_index: 0
                },
                AddressUsage {
                    block_height: 5,
                    offset_in_block: 400,
                    out_index: 3
                },
            ]
        );
        assert_eq!(db.find(&ripe(3)), Vec::new());
        assert_eq!(db.blockheight(), 5);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let db = AddressIndexer::open(dir.path()).unwrap();
            db.insert(&ripe(7), 0, 11, 81).unwrap();
            db.block_finished(11, &Hash256::default());
            db.flush();
        }
        let db = AddressIndexer::open(dir.path()).unwrap();
        assert_eq!(db.blockheight(), 11);
        assert_eq!(db.find(&ripe(7)).len(), 1);
    }

    #[test]
    fn test_index_block_reads_output_addresses() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = AddressIndexer::open(dir.path()).unwrap();

        let mut builder = MessageBuilder::new();
        builder.add_int(tag::BLOCK_HEIGHT, 3);
        builder.add_bytes(blockchain::BLOCK_HASH, &[9u8; 32]);
        builder.add_int(blockchain::TX_OFFSET_IN_BLOCK, 81);
        builder.add_int(blockchain::TX_OUT_INDEX, 0);
        builder.add_bytes(blockchain::TX_OUT_ADDRESS, &ripe(4).0);
        builder.add_bool(tag::SEPARATOR, true);
        let body = builder
            .message(service::BLOCKCHAIN, blockchain::GET_BLOCK_REPLY)
            .body()
            .clone();

        index_block(&db, &body).unwrap();
        db.flush();
        assert_eq!(db.blockheight(), 3);
        let hits = db.find(&ripe(4));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].out_index, 0);
        assert_eq!(hits[0].block_height, 3);
    }
}
