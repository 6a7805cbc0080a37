use super::{BlockSource, COINBASE_OFFSET_LIMIT};
use crate::api::{blockchain, tag};
use crate::hash::Hash256;
use crate::message::{MessageParser, Token};
use crate::utxo::UnspentOutputDatabase;
use log::{debug, error};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Consumer thread feeding the spent-output database: every input's
/// `(prev_txid, out_index)` maps to the spending transaction's position.
pub(super) fn spawn(
    source: BlockSource,
    db: Arc<Mutex<UnspentOutputDatabase>>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("spent-indexer".into())
        .spawn(move || run(source, db))
        .expect("spawning spent indexer thread")
}

fn run(source: BlockSource, db: Arc<Mutex<UnspentOutputDatabase>>) {
    while !source.stop_requested() {
        let want = db.lock().unwrap().blockheight() + 1;
        debug!("spent indexer wants block {}", want);
        let message = match source.next_block(want, Duration::from_secs(30)) {
            Some(m) => m,
            None => continue,
        };
        let mut db = db.lock().unwrap();
        if let Err(e) = index_block(&mut db, message.body()) {
            error!("spent indexer giving up: {}", e);
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
    let mut prev_txid: Option<Hash256> = None;

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
            tag::SEPARATOR => tx_offset = 0,
            // inputs of the coinbase spend nothing
            blockchain::TX_IN_TXID if tx_offset >= COINBASE_OFFSET_LIMIT => {
                prev_txid = parser.hash_data();
            }
            blockchain::TX_IN_OUTINDEX if tx_offset >= COINBASE_OFFSET_LIMIT => {
                if let Some(prev) = prev_txid.take() {
                    db.insert(&prev, parser.int_data() as u32, block_height, tx_offset)?;
                }
            }
            _ => {}
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
        h.0[20] = 0xC3;
        h
    }

    #[test]
    fn test_coinbase_inputs_are_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = UnspentOutputDatabase::open(dir.path()).unwrap();

        let mut builder = MessageBuilder::new();
        builder.add_int(tag::BLOCK_HEIGHT, 7);
        builder.add_bytes(blockchain::BLOCK_HASH, &txid(0xAA).0);
        // the coinbase sits right after the block header
        builder.add_int(blockchain::TX_OFFSET_IN_BLOCK, 81);
        builder.add_bytes(blockchain::TX_IN_TXID, &txid(1).0);
        builder.add_int(blockchain::TX_IN_OUTINDEX, 0xFFFF_FFFF);
        builder.add_bool(tag::SEPARATOR, true);
        // an ordinary transaction spending output 2 of txid(2)
        builder.add_int(blockchain::TX_OFFSET_IN_BLOCK, 400);
        builder.add_bytes(blockchain::TX_IN_TXID, &txid(2).0);
        builder.add_int(blockchain::TX_IN_OUTINDEX, 2);
        builder.add_bool(tag::SEPARATOR, true);
        let body = builder
            .message(service::BLOCKCHAIN, blockchain::GET_BLOCK_REPLY)
            .body()
            .clone();

        index_block(&mut db, &body).unwrap();
        assert_eq!(db.blockheight(), 7);
        assert_eq!(db.find(&txid(1), 0xFFFF_FFFF).unwrap(), None);
        assert_eq!(db.find(&txid(2), 2).unwrap(), Some((7, 400)));
    }

    #[test]
    fn test_multiple_inputs_per_tx() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = UnspentOutputDatabase::open(dir.path()).unwrap();

        let mut builder = MessageBuilder::new();
        builder.add_int(tag::BLOCK_HEIGHT, 9);
        builder.add_bytes(blockchain::BLOCK_HASH, &txid(0xAB).0);
        builder.add_int(blockchain::TX_OFFSET_IN_BLOCK, 300);
        builder.add_bytes(blockchain::TX_IN_TXID, &txid(5).0);
        builder.add_int(blockchain::TX_IN_OUTINDEX, 0);
        builder.add_bytes(blockchain::TX_IN_TXID, &txid(5).0);
        builder.add_int(blockchain::TX_IN_OUTINDEX, 1);
        builder.add_bool(tag::SEPARATOR, true);
        let body = builder
            .message(service::BLOCKCHAIN, blockchain::GET_BLOCK_REPLY)
            .body()
            .clone();

        index_block(&mut db, &body).unwrap();
        assert_eq!(db.find(&txid(5), 0).unwrap(), Some((9, 300)));
        assert_eq!(db.find(&txid(5), 1).unwrap(), Some((9, 300)));
    }
}
