use super::BlockSource;
use crate::api::{blockchain, tag};
use crate::hash::Hash256;
use crate::message::{MessageParser, Token};
use crate::utxo::UnspentOutputDatabase;
use log::{debug, error};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Consumer thread feeding the txid database: every transaction of every
/// block, keyed `(txid, 0)`.
pub(super) fn spawn(
    source: BlockSource,
    db: Arc<Mutex<UnspentOutputDatabase>>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("tx-indexer".into())
        .spawn(move || run(source, db))
        .expect("spawning tx indexer thread")
}

fn run(source: BlockSource, db: Arc<Mutex<UnspentOutputDatabase>>) {
    while !source.stop_requested() {
        let want = db.lock().unwrap().blockheight() + 1;
        debug!("tx indexer wants block {}", want);
        // a None either means caught-up (idle until a notification wakes
        // the controller) or a timeout; both just retry
        let message = match source.next_block(want, Duration::from_secs(30)) {
            Some(m) => m,
            None => continue,
        };

        let mut db = db.lock().unwrap();
        if let Err(e) = index_block(&mut db, message.body()) {
            // a broken database is fatal for this indexer; others continue
            error!("tx indexer giving up: {}", e);
            return;
        }
    }
}

fn index_block(
    db: &mut UnspentOutputDatabase,
    body: &crate::buffer::ConstBuffer,
) -> Result<(), crate::utxo::Error> {
    let mut block_height = -1i32;
    let mut block_id = Hash256::default();
    let mut tx_offset = 0i32;
    let mut txid: Option<Hash256> = None;

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
            tag::TX_ID => txid = parser.hash_data(),
            tag::SEPARATOR => {
                if tx_offset > 0 {
                    if let Some(id) = txid {
                        db.insert(&id, 0, block_height, tx_offset)?;
                    }
                }
                tx_offset = 0;
            }
            _ => {}
        }
    }
    // the last transaction may not be followed by a separator
    if tx_offset > 0 {
        if let Some(id) = txid {
            db.insert(&id, 0, block_height, tx_offset)?;
        }
    }
    db.block_finished(block_height, &block_id)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::service;
    use crate::message::MessageBuilder;

    fn txid(i: u8) -> Hash256 {
        let mut h = Hash256::default();
        h.0[0] = i;
        h.0[16] = 0xA0;
        h
    }

    fn block_message(height: i32, txs: &[(Hash256, i32)]) -> crate::buffer::ConstBuffer {
        let mut builder = MessageBuilder::new();
        builder.add_int(tag::BLOCK_HEIGHT, i64::from(height));
        builder.add_bytes(blockchain::BLOCK_HASH, &txid(0xBB).0);
        for (id, offset) in txs {
            builder.add_int(blockchain::TX_OFFSET_IN_BLOCK, i64::from(*offset));
            builder.add_bytes(tag::TX_ID, &id.0);
            builder.add_bool(tag::SEPARATOR, true);
        }
        builder
            .message(service::BLOCKCHAIN, blockchain::GET_BLOCK_REPLY)
            .body()
            .clone()
    }

    #[test]
    fn test_index_block_inserts_every_tx() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = UnspentOutputDatabase::open(dir.path()).unwrap();
        let body = block_message(112, &[(txid(1), 81), (txid(2), 920)]);
        index_block(&mut db, &body).unwrap();

        assert_eq!(db.blockheight(), 112);
        assert_eq!(db.find(&txid(1), 0).unwrap(), Some((112, 81)));
        assert_eq!(db.find(&txid(2), 0).unwrap(), Some((112, 920)));
        assert_eq!(db.find(&txid(3), 0).unwrap(), None);
    }

    #[test]
    fn test_trailing_tx_without_separator() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = UnspentOutputDatabase::open(dir.path()).unwrap();
        let mut builder = MessageBuilder::new();
        builder.add_int(tag::BLOCK_HEIGHT, 5);
        builder.add_bytes(blockchain::BLOCK_HASH, &txid(0xBB).0);
        builder.add_int(blockchain::TX_OFFSET_IN_BLOCK, 81);
        builder.add_bytes(tag::TX_ID, &txid(9).0);
        let body = builder
            .message(service::BLOCKCHAIN, blockchain::GET_BLOCK_REPLY)
            .body()
            .clone();
        index_block(&mut db, &body).unwrap();
        assert_eq!(db.find(&txid(9), 0).unwrap(), Some((5, 81)));
    }
}
