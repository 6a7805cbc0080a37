use crate::api::{block_notification, blockchain, header, indexer, meta, service, tag};
use crate::hash::Hash160;
use crate::message::{Message, MessageBuilder, MessageParser, Token};
use crate::net::{Connection, Remote, Server, ServerHandler};
use crate::utxo::UnspentOutputDatabase;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

mod address;
mod spent;
mod tx;

pub use address::{AddressIndexer, AddressUsage};

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error(transparent)]
    Utxo(#[from] crate::utxo::Error),

    #[error(transparent)]
    Address(#[from] address::AddressDbError),
}

/// Inputs of a transaction earlier in the block than this offset belong
/// to the coinbase and are skipped by the spent indexer.
pub(crate) const COINBASE_OFFSET_LIMIT: i32 = 90;

/// How long a GetBlock may stay unanswered before it is repeated.
const REREQUEST_AFTER: Duration = Duration::from_secs(20);

/// Which indexers to run.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub basedir: PathBuf,
    pub enable_txdb: bool,
    pub enable_addressdb: bool,
    pub enable_spentdb: bool,
}

/// A fixed vector of the heights the indexer threads currently want.
///
/// Every consumer parks a height here while it waits; the controller
/// requests min(heights) once every enabled consumer has registered.
struct TokenSet {
    heights: Vec<AtomicI32>,
}

impl TokenSet {
    fn new(size: usize) -> TokenSet {
        TokenSet {
            heights: (0..size).map(|_| AtomicI32::new(-1)).collect(),
        }
    }

    fn acquire(&self, height: i32) -> usize {
        for (i, slot) in self.heights.iter().enumerate() {
            if slot
                .compare_exchange(-1, height, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return i;
            }
        }
        // the vector is sized to the max number of indexer threads
        panic!("more indexer threads than token slots");
    }

    fn allocated(&self) -> usize {
        self.heights
            .iter()
            .filter(|h| h.load(Ordering::Acquire) != -1)
            .count()
    }

    fn min_height(&self) -> Option<i32> {
        self.heights
            .iter()
            .map(|h| h.load(Ordering::Acquire))
            .filter(|h| *h != -1)
            .min()
    }

    /// Clear every token waiting for `height`; the block request covers
    /// them, clearing avoids a duplicate request in race conditions.
    fn requesting_block(&self, height: i32) {
        for slot in self.heights.iter() {
            let _ = slot.compare_exchange(height, -1, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    fn release(&self, token: usize) {
        self.heights[token].store(-1, Ordering::Release);
    }
}

struct BlockSlot {
    next_block: Option<Message>,
    last_requested: i32,
    time_last_request: Instant,
}

struct ControllerInner {
    slot: Mutex<BlockSlot>,
    wait_for_block: Condvar,
    tokens: TokenSet,
    hub: Mutex<Option<Arc<Connection>>>,
    stop: AtomicBool,
    caught_up: AtomicBool,
    consumers: usize,
    include_txids: bool,
    include_addresses: bool,
    include_inputs: bool,
}

/// Handle the indexer threads use to pull blocks from the single Hub
/// connection.
#[derive(Clone)]
pub struct BlockSource {
    inner: Arc<ControllerInner>,
}

impl BlockSource {
    /// Block until the Hub delivered the block at `height`, the timeout
    /// passed, or the controller is shutting down.
    pub fn next_block(&self, height: i32, timeout: Duration) -> Option<Message> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().unwrap();
        let token = inner.tokens.acquire(height);
        let result = loop {
            if inner.stop.load(Ordering::Relaxed) {
                break None;
            }
            if let Some(message) = &slot.next_block {
                if block_height_of(message) == Some(height) {
                    break Some(message.clone());
                }
            }
            // while caught up, only a new-block notification restarts the
            // pump; requesting would just earn another CommandFailed
            if !inner.caught_up.load(Ordering::Relaxed)
                && inner.tokens.allocated() == inner.consumers
            {
                inner.request_block(&mut slot);
            }
            let (guard, wait) = inner
                .wait_for_block
                .wait_timeout(slot, timeout)
                .expect("controller lock poisoned");
            slot = guard;
            if wait.timed_out() {
                break None;
            }
        };
        inner.tokens.release(token);
        result
    }

    /// True once the Hub answered a GetBlock with CommandFailed, meaning
    /// the chain has no block past what we indexed.
    pub fn caught_up(&self) -> bool {
        self.inner.caught_up.load(Ordering::Relaxed)
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::Relaxed)
    }
}

impl ControllerInner {
    /// Send one GetBlock for the lowest registered height. Caller holds
    /// the slot lock; at most one request is in flight at any time.
    fn request_block(&self, slot: &mut BlockSlot) {
        let height = match self.tokens.min_height() {
            Some(h) => h,
            None => return,
        };
        if slot.last_requested == height {
            return;
        }
        let hub = self.hub.lock().unwrap();
        let hub = match hub.as_ref() {
            Some(h) => Arc::clone(h),
            None => return,
        };
        slot.last_requested = height;
        slot.time_last_request = Instant::now();
        self.tokens.requesting_block(height);

        let mut builder = MessageBuilder::new();
        builder.add_int(tag::BLOCK_HEIGHT, i64::from(height));
        if self.include_txids {
            builder.add_bool(blockchain::INCLUDE_TX_ID, true);
        }
        if self.include_addresses {
            builder.add_bool(blockchain::INCLUDE_OUTPUT_ADDRESSES, true);
        }
        if self.include_inputs {
            builder.add_bool(blockchain::INCLUDE_INPUTS, true);
        }
        builder.add_bool(blockchain::INCLUDE_OFFSET_IN_BLOCK, true);
        debug!("requesting block {}", height);
        if let Err(e) = hub.send(&builder.message(service::BLOCKCHAIN, blockchain::GET_BLOCK)) {
            warn!("failed to request block {}: {}", height, e);
        }
    }
}

/// The indexer service: one Hub connection multiplexed over up to three
/// database threads, plus the RPC server answering lookups.
pub struct Indexer {
    inner: Arc<ControllerInner>,
    txdb: Option<Arc<Mutex<UnspentOutputDatabase>>>,
    spentdb: Option<Arc<Mutex<UnspentOutputDatabase>>>,
    addressdb: Option<Arc<AddressIndexer>>,
    hub_connection: Option<Arc<Connection>>,
    server: Option<Server>,
    threads: Vec<JoinHandle<()>>,
    poll_thread: Option<JoinHandle<()>>,
    find_address_worker: Option<SyncSender<(Arc<Remote>, Message)>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl Indexer {
    pub fn new(config: &IndexerConfig) -> Result<Indexer, IndexerError> {
        let txdb = if config.enable_txdb {
            Some(Arc::new(Mutex::new(UnspentOutputDatabase::open(
                config.basedir.join("txindex"),
            )?)))
        } else {
            None
        };
        let spentdb = if config.enable_spentdb {
            Some(Arc::new(Mutex::new(UnspentOutputDatabase::open(
                config.basedir.join("spent"),
            )?)))
        } else {
            None
        };
        let addressdb = if config.enable_addressdb {
            Some(Arc::new(AddressIndexer::open(
                config.basedir.join("addresses"),
            )?))
        } else {
            None
        };
        let consumers = [config.enable_txdb, config.enable_spentdb, config.enable_addressdb]
            .iter()
            .filter(|e| **e)
            .count();
        let inner = Arc::new(ControllerInner {
            slot: Mutex::new(BlockSlot {
                next_block: None,
                last_requested: 0,
                time_last_request: Instant::now(),
            }),
            wait_for_block: Condvar::new(),
            tokens: TokenSet::new(3),
            hub: Mutex::new(None),
            stop: AtomicBool::new(false),
            caught_up: AtomicBool::new(false),
            consumers,
            include_txids: config.enable_txdb,
            include_addresses: config.enable_addressdb,
            include_inputs: config.enable_spentdb,
        });
        Ok(Indexer {
            inner,
            txdb,
            spentdb,
            addressdb,
            hub_connection: None,
            server: None,
            threads: Vec::new(),
            poll_thread: None,
            find_address_worker: None,
            worker_thread: None,
        })
    }

    pub fn block_source(&self) -> BlockSource {
        BlockSource {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Connect to the Hub, subscribe to block notifications and start the
    /// indexer threads.
    pub fn try_connect_hub(&mut self, addr: SocketAddr) -> std::io::Result<()> {
        let inner = Arc::clone(&self.inner);
        let txdb = self.txdb.clone();
        let spentdb = self.spentdb.clone();
        let addressdb = self.addressdb.clone();
        let connection = Arc::new(Connection::connect(
            addr,
            move |message| {
                hub_sent_message(&inner, &txdb, &spentdb, &addressdb, message);
            },
            || warn!("hub disconnected"),
        )?);
        connection.send(&Message::new(service::API, meta::VERSION))?;
        connection.send(&Message::new(
            service::BLOCK_NOTIFICATION,
            block_notification::SUBSCRIBE,
        ))?;
        *self.inner.hub.lock().unwrap() = Some(Arc::clone(&connection));
        self.hub_connection = Some(connection);

        let tx_height = self.txdb.as_ref().map(|db| db.lock().unwrap().blockheight());
        let spent_height = self
            .spentdb
            .as_ref()
            .map(|db| db.lock().unwrap().blockheight());
        let address_height = self.addressdb.as_ref().map(|db| db.blockheight());
        info!(
            "connection to hub established, txdb: {:?} addressdb: {:?} spentdb: {:?}",
            tx_height, address_height, spent_height
        );

        self.start_threads();
        Ok(())
    }

    fn start_threads(&mut self) {
        if !self.threads.is_empty() {
            return;
        }
        let source = self.block_source();
        if let Some(db) = &self.txdb {
            self.threads
                .push(tx::spawn(source.clone(), Arc::clone(db)));
        }
        if let Some(db) = &self.spentdb {
            self.threads
                .push(spent::spawn(source.clone(), Arc::clone(db)));
        }
        if let Some(db) = &self.addressdb {
            self.threads
                .push(address::spawn(source.clone(), Arc::clone(db)));
        }
        // re-request a block the Hub never delivered
        let inner = Arc::clone(&self.inner);
        self.poll_thread = Some(std::thread::spawn(move || loop {
            if inner.stop.load(Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(Duration::from_secs(5));
            let mut slot = inner.slot.lock().unwrap();
            if slot.last_requested != 0 && slot.time_last_request.elapsed() > REREQUEST_AFTER {
                debug!("repeating block request");
                slot.last_requested = 0;
                inner.request_block(&mut slot);
            }
        }));
    }

    /// Serve IndexerService lookups on `addr`.
    pub fn bind(&mut self, addr: SocketAddr) -> std::io::Result<()> {
        let (worker_send, worker_recv) = sync_channel::<(Arc<Remote>, Message)>(64);
        // the address db sits on slower storage, answer its lookups away
        // from the network threads
        let addressdb = self.addressdb.clone();
        let stop = Arc::clone(&self.inner);
        self.worker_thread = Some(std::thread::spawn(move || loop {
            if stop.stop.load(Ordering::Relaxed) {
                break;
            }
            match worker_recv.recv_timeout(Duration::from_millis(500)) {
                Ok((remote, message)) => {
                    if let Some(db) = &addressdb {
                        on_find_address(db, &remote, &message);
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }));

        let txdb = self.txdb.clone();
        let spentdb = self.spentdb.clone();
        let has_addressdb = self.addressdb.is_some();
        let worker = worker_send.clone();
        let handler: ServerHandler = Arc::new(move |remote, message| {
            on_incoming_message(&txdb, &spentdb, has_addressdb, &worker, remote, message);
        });
        self.server = Some(Server::bind(addr, handler)?);
        self.find_address_worker = Some(worker_send);
        Ok(())
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr())
    }

    /// Ask every thread to stop and wait for them.
    pub fn shutdown(&mut self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        self.inner.wait_for_block.notify_all();
        self.find_address_worker = None;
        self.server = None;
        *self.inner.hub.lock().unwrap() = None;
        self.hub_connection = None;
        for join in self.threads.drain(..) {
            let _ = join.join();
        }
        if let Some(join) = self.poll_thread.take() {
            let _ = join.join();
        }
        if let Some(join) = self.worker_thread.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn block_height_of(message: &Message) -> Option<i32> {
    if message.service_id != service::BLOCKCHAIN
        || message.message_id != blockchain::GET_BLOCK_REPLY
    {
        return None;
    }
    let mut parser = MessageParser::new(message.body().clone());
    while let Token::Field { tag, .. } = parser.next() {
        if tag == tag::BLOCK_HEIGHT {
            return Some(parser.int_data() as i32);
        }
    }
    None
}

fn min_enabled_height(
    txdb: &Option<Arc<Mutex<UnspentOutputDatabase>>>,
    spentdb: &Option<Arc<Mutex<UnspentOutputDatabase>>>,
    addressdb: &Option<Arc<AddressIndexer>>,
) -> Option<i32> {
    let mut height: Option<i32> = None;
    let mut fold = |h: i32| height = Some(height.map_or(h, |v| v.min(h)));
    if let Some(db) = txdb {
        fold(db.lock().unwrap().blockheight());
    }
    if let Some(db) = spentdb {
        fold(db.lock().unwrap().blockheight());
    }
    if let Some(db) = addressdb {
        fold(db.blockheight());
    }
    height
}

/// Network-thread handler for everything the Hub sends us.
fn hub_sent_message(
    inner: &Arc<ControllerInner>,
    txdb: &Option<Arc<Mutex<UnspentOutputDatabase>>>,
    spentdb: &Option<Arc<Mutex<UnspentOutputDatabase>>>,
    addressdb: &Option<Arc<AddressIndexer>>,
    message: Message,
) {
    if message.service_id == service::BLOCKCHAIN
        && message.message_id == blockchain::GET_BLOCK_REPLY
    {
        let height = block_height_of(&message).unwrap_or(-1);
        debug!("hub sent us block {}", height);
        if height % 500 == 0 {
            info!("processing block {}", height);
        }
        let mut slot = inner.slot.lock().unwrap();
        if slot.last_requested == height {
            slot.next_block = Some(message);
            slot.last_requested = 0;
            inner.wait_for_block.notify_all();
        }
    } else if message.service_id == service::API {
        if message.message_id == meta::VERSION_REPLY {
            let mut parser = MessageParser::new(message.body().clone());
            while let Token::Field { tag, .. } = parser.next() {
                if tag == tag::GENERIC_BYTE_DATA {
                    info!("hub is at version {}", parser.string_data());
                }
            }
        } else if message.message_id == meta::COMMAND_FAILED {
            let mut failed_service = -1i64;
            let mut failed_message = -1i64;
            let mut parser = MessageParser::new(message.body().clone());
            while let Token::Field { tag, .. } = parser.next() {
                match tag {
                    meta::FAILED_COMMAND_SERVICE_ID => failed_service = parser.int_data(),
                    meta::FAILED_COMMAND_ID => failed_message = parser.int_data(),
                    meta::FAILED_REASON => debug!("failed reason: {}", parser.string_data()),
                    _ => {}
                }
            }
            if failed_service == i64::from(service::BLOCKCHAIN)
                && failed_message == i64::from(blockchain::GET_BLOCK)
            {
                info!("failed to get block, assuming we are at top of chain");
                inner.caught_up.store(true, Ordering::Relaxed);
                inner.slot.lock().unwrap().last_requested = 0;
                if let Some(db) = txdb {
                    let mut db = db.lock().unwrap();
                    info!("txdb now at {}", db.blockheight());
                    if let Err(e) = db.save_caches() {
                        error!("txdb failed to save caches: {}", e);
                    }
                }
                if let Some(db) = spentdb {
                    let mut db = db.lock().unwrap();
                    info!("spentdb now at {}", db.blockheight());
                    if let Err(e) = db.save_caches() {
                        error!("spentdb failed to save caches: {}", e);
                    }
                }
                if let Some(db) = addressdb {
                    info!("addressdb now at {}", db.blockheight());
                    db.flush();
                }
                inner.wait_for_block.notify_all();
            } else {
                warn!("failure detected {}/{}", failed_service, failed_message);
            }
        }
    } else if message.service_id == service::BLOCK_NOTIFICATION
        && message.message_id == block_notification::NEW_BLOCK_ON_CHAIN
    {
        let mut parser = MessageParser::new(message.body().clone());
        while let Token::Field { tag, .. } = parser.next() {
            if tag == block_notification::BLOCK_HEIGHT {
                let announced = parser.int_data() as i32;
                let ours = match min_enabled_height(txdb, spentdb, addressdb) {
                    Some(h) => h,
                    None => return,
                };
                let was_caught_up = inner.caught_up.load(Ordering::Relaxed);
                if announced == ours + 1 || (was_caught_up && announced >= ours) {
                    inner.caught_up.store(false, Ordering::Relaxed);
                    let mut slot = inner.slot.lock().unwrap();
                    slot.last_requested = 0;
                    inner.request_block(&mut slot);
                }
            }
        }
    } else {
        debug!(
            "unhandled hub message {}/{}",
            message.service_id, message.message_id
        );
    }
}

/// Server-side dispatch of IndexerService requests.
fn on_incoming_message(
    txdb: &Option<Arc<Mutex<UnspentOutputDatabase>>>,
    spentdb: &Option<Arc<Mutex<UnspentOutputDatabase>>>,
    has_addressdb: bool,
    find_address_worker: &SyncSender<(Arc<Remote>, Message)>,
    remote: &Arc<Remote>,
    message: Message,
) {
    if message.service_id != service::INDEXER {
        return;
    }
    match message.message_id {
        indexer::GET_AVAILABLE_INDEXERS => {
            let mut builder = MessageBuilder::new();
            if txdb.is_some() {
                builder.add_bool(indexer::TXID_INDEXER, true);
            }
            if has_addressdb {
                builder.add_bool(indexer::ADDRESS_INDEXER, true);
            }
            if spentdb.is_some() {
                builder.add_bool(indexer::SPENT_OUTPUT_INDEXER, true);
            }
            let reply = with_request_headers(
                builder.message(service::INDEXER, indexer::GET_AVAILABLE_INDEXERS_REPLY),
                &message,
            );
            let _ = remote.send(&reply);
        }
        indexer::VERSION => {
            let mut builder = MessageBuilder::new();
            builder.add_string(tag::GENERIC_BYTE_DATA, env!("CARGO_PKG_VERSION"));
            let reply = with_request_headers(
                builder.message(service::INDEXER, indexer::VERSION_REPLY),
                &message,
            );
            let _ = remote.send(&reply);
        }
        indexer::FIND_TRANSACTION => {
            let txdb = match txdb {
                Some(db) => db,
                None => {
                    remote.disconnect();
                    return;
                }
            };
            let mut parser = MessageParser::new(message.body().clone());
            while let Token::Field { tag, .. } = parser.next() {
                if tag == tag::TX_ID {
                    if parser.data_len() != 32 {
                        remote.disconnect();
                        return;
                    }
                    let txid = parser.hash_data().unwrap();
                    let found = txdb.lock().unwrap().find(&txid, 0);
                    let (height, offset) = match found {
                        Ok(Some(pair)) => pair,
                        Ok(None) => (-1, -1),
                        Err(e) => {
                            error!("txdb lookup failed: {}", e);
                            (-1, -1)
                        }
                    };
                    let mut builder = MessageBuilder::new();
                    builder.add_int(tag::BLOCK_HEIGHT, i64::from(height));
                    builder.add_int(tag::OFFSET_IN_BLOCK, i64::from(offset));
                    let reply = with_request_headers(
                        builder.message(service::INDEXER, indexer::FIND_TRANSACTION_REPLY),
                        &message,
                    );
                    let _ = remote.send(&reply);
                    return; // just one item per message
                }
            }
        }
        indexer::FIND_SPENT_OUTPUT => {
            let spentdb = match spentdb {
                Some(db) => db,
                None => {
                    remote.disconnect();
                    return;
                }
            };
            let mut txid = None;
            let mut out_index = 0i64;
            let mut parser = MessageParser::new(message.body().clone());
            while let Token::Field { tag, .. } = parser.next() {
                match tag {
                    tag::TX_ID => {
                        if parser.data_len() != 32 {
                            remote.disconnect();
                            return;
                        }
                        txid = parser.hash_data();
                    }
                    indexer::OUT_INDEX => out_index = parser.int_data(),
                    _ => {}
                }
            }
            let txid = match txid {
                Some(t) if out_index >= 0 => t,
                _ => {
                    remote.disconnect();
                    return;
                }
            };
            let found = spentdb.lock().unwrap().find(&txid, out_index as u32);
            let (height, offset) = match found {
                Ok(Some(pair)) => pair,
                Ok(None) => (-1, -1),
                Err(e) => {
                    error!("spentdb lookup failed: {}", e);
                    (-1, -1)
                }
            };
            let mut builder = MessageBuilder::new();
            builder.add_int(tag::BLOCK_HEIGHT, i64::from(height));
            builder.add_int(tag::OFFSET_IN_BLOCK, i64::from(offset));
            let reply = with_request_headers(
                builder.message(service::INDEXER, indexer::FIND_SPENT_OUTPUT_REPLY),
                &message,
            );
            let _ = remote.send(&reply);
        }
        indexer::FIND_ADDRESS => {
            if !has_addressdb {
                remote.disconnect();
                return;
            }
            // answered from the worker, the address db is the slow one
            let _ = find_address_worker.send((Arc::clone(remote), message));
        }
        _ => debug!("unknown indexer request {}", message.message_id),
    }
}

fn on_find_address(db: &AddressIndexer, remote: &Remote, message: &Message) {
    let mut parser = MessageParser::new(message.body().clone());
    while let Token::Field { tag, .. } = parser.next() {
        if tag == indexer::BITCOIN_ADDRESS {
            let key = parser.bytes_data();
            let usages = match key.len() {
                20 => {
                    let ripe = Hash160::from_slice(&key).unwrap();
                    db.find(&ripe)
                }
                32 => Vec::new(), // script-hash keys have no index yet
                _ => {
                    remote.disconnect();
                    return;
                }
            };
            let mut builder = MessageBuilder::new();
            let mut last_height = -1i32;
            let mut last_offset = -1i32;
            for usage in usages {
                // repeating unchanged fields only bloats the message
                if usage.block_height != last_height {
                    builder.add_int(tag::BLOCK_HEIGHT, i64::from(usage.block_height));
                }
                last_height = usage.block_height;
                if usage.offset_in_block != last_offset {
                    builder.add_int(tag::OFFSET_IN_BLOCK, i64::from(usage.offset_in_block));
                }
                last_offset = usage.offset_in_block;
                builder.add_int(indexer::OUT_INDEX, i64::from(usage.out_index));
                builder.add_bool(tag::SEPARATOR, true);
            }
            let reply = with_request_headers(
                builder.message(service::INDEXER, indexer::FIND_ADDRESS_REPLY),
                message,
            );
            let _ = remote.send(&reply);
            return; // just one request per message
        }
    }
}

/// Copy the routing headers a requester used onto the reply.
fn with_request_headers(mut reply: Message, request: &Message) -> Message {
    for tag in [
        header::REQUEST_ID,
        header::SEARCH_REQUEST_ID,
        header::JOB_REQUEST_ID,
    ] {
        let value = request.header_int(tag);
        if value != -1 {
            reply.set_header_int(tag, value);
        }
    }
    reply
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_token_set() {
        let tokens = TokenSet::new(3);
        let a = tokens.acquire(10);
        let b = tokens.acquire(12);
        assert_eq!(tokens.allocated(), 2);
        assert_eq!(tokens.min_height(), Some(10));

        tokens.requesting_block(10);
        assert_eq!(tokens.allocated(), 1);
        assert_eq!(tokens.min_height(), Some(12));

        tokens.release(a);
        tokens.release(b);
        assert_eq!(tokens.allocated(), 0);
        assert_eq!(tokens.min_height(), None);
    }

    #[test]
    #[should_panic]
    fn test_token_set_exhaustion() {
        let tokens = TokenSet::new(1);
        let _a = tokens.acquire(1);
        let _b = tokens.acquire(2);
    }
}
