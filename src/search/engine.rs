use super::{
    filter, unpack_tx_ref_key, BlockHeader, Input, Job, JobType, Output, OutputScriptKind,
    SearchCtx, SearchError, SearchReactor, Service, ServiceUnavailable, Transaction, UtxoLookup,
};
use crate::api::{blockchain, header, indexer, live, meta, service, tag};
use crate::message::{Message, MessageBuilder, MessageParser, Token};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

/// Where the engine can push frames. Production peers are TCP
/// connections; tests plug in loopback captures.
pub trait Transport: Send + Sync {
    fn send(&self, message: &Message) -> io::Result<()>;
}

impl Transport for crate::net::Connection {
    fn send(&self, message: &Message) -> io::Result<()> {
        crate::net::Connection::send(self, message)
    }
}

struct Peer {
    transport: Box<dyn Transport>,
    services: HashSet<Service>,
}

struct SearchEntry {
    ctx: SearchCtx,
    reactor: Box<dyn SearchReactor>,
}

/// Executes [SearchCtx] job graphs against the connected Hub and indexer
/// peers, firing the reactor hooks as replies arrive.
///
/// Outgoing messages carry a `SearchRequestId` and `JobRequestId` header;
/// replies are routed back by those two and everything else is dropped
/// with a log line.
pub struct SearchEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    peers: Mutex<Vec<Peer>>,
    searches: Mutex<HashMap<i32, SearchEntry>>,
    next_request_id: AtomicI32,
    ever_seen: Mutex<HashSet<Service>>,
}

impl Default for SearchEngine {
    fn default() -> Self {
        SearchEngine::new()
    }
}

impl SearchEngine {
    pub fn new() -> SearchEngine {
        SearchEngine {
            inner: Arc::new(EngineInner {
                peers: Mutex::new(Vec::new()),
                searches: Mutex::new(HashMap::new()),
                next_request_id: AtomicI32::new(1),
                ever_seen: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Register a peer with an already known capability set. Returns the
    /// peer id for [SearchEngine::handle_message].
    pub fn add_peer(&self, transport: Box<dyn Transport>, services: HashSet<Service>) -> usize {
        let mut seen = self.inner.ever_seen.lock().unwrap();
        for s in &services {
            seen.insert(*s);
        }
        drop(seen);
        let mut peers = self.inner.peers.lock().unwrap();
        peers.push(Peer {
            transport,
            services,
        });
        peers.len() - 1
    }

    /// Connect to a Hub endpoint. Capability is granted on its version
    /// reply.
    pub fn add_hub(&self, addr: std::net::SocketAddr) -> io::Result<()> {
        self.add_remote(addr, Message::new(service::API, meta::VERSION))
    }

    /// Connect to an indexer endpoint; capabilities arrive with its
    /// available-indexers reply.
    pub fn add_indexer(&self, addr: std::net::SocketAddr) -> io::Result<()> {
        self.add_remote(
            addr,
            Message::new(service::INDEXER, indexer::GET_AVAILABLE_INDEXERS),
        )
    }

    fn add_remote(&self, addr: std::net::SocketAddr, hello: Message) -> io::Result<()> {
        let peer_id = self.add_peer(Box::new(NullTransport), HashSet::new());
        let inner = Arc::downgrade(&self.inner);
        let connection = crate::net::Connection::connect(
            addr,
            move |message| {
                if let Some(inner) = inner.upgrade() {
                    inner.handle_message(peer_id, message);
                }
            },
            move || debug!("peer {} disconnected", addr),
        )?;
        connection.send(&hello)?;
        self.inner.peers.lock().unwrap()[peer_id].transport = Box::new(connection);
        Ok(())
    }

    pub fn is_service_available(&self, wanted: Service) -> bool {
        let peers = self.inner.peers.lock().unwrap();
        peers.iter().any(|p| p.services.contains(&wanted))
    }

    /// Feed one incoming message from `peer_id` into the engine. With TCP
    /// peers this is wired to the connection's reader thread.
    pub fn handle_message(&self, peer_id: usize, message: Message) {
        self.inner.handle_message(peer_id, message);
    }

    /// Start executing a search. The reactor's hooks fire on the network
    /// dispatch thread; the returned id must eventually be passed to
    /// [SearchEngine::finish_search].
    pub fn start(
        &self,
        mut ctx: SearchCtx,
        reactor: Box<dyn SearchReactor>,
    ) -> Result<i32, ServiceUnavailable> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        ctx.request_id = request_id;
        let mut searches = self.inner.searches.lock().unwrap();
        searches.insert(request_id, SearchEntry { ctx, reactor });
        let entry = searches.get_mut(&request_id).unwrap();
        match self.inner.process_requests(entry) {
            Ok(()) => Ok(request_id),
            Err(e) => {
                let mut entry = searches.remove(&request_id).unwrap();
                entry.reactor.aborted(&mut entry.ctx, &e);
                Err(e)
            }
        }
    }

    /// Drop a search; later replies for it are logged and ignored.
    pub fn finish_search(&self, request_id: i32) {
        self.inner.searches.lock().unwrap().remove(&request_id);
    }

    #[cfg(test)]
    pub(crate) fn inspect<R>(&self, request_id: i32, f: impl FnOnce(&SearchCtx) -> R) -> Option<R> {
        self.inner
            .searches
            .lock()
            .unwrap()
            .get(&request_id)
            .map(|entry| f(&entry.ctx))
    }
}

impl EngineInner {
    fn handle_message(&self, peer_id: usize, message: Message) {
        let search_id = message.header_int(header::SEARCH_REQUEST_ID);
        if search_id > 0 {
            let mut searches = self.searches.lock().unwrap();
            let entry = match searches.get_mut(&(search_id as i32)) {
                Some(e) => e,
                None => {
                    debug!("no search matches request {}", search_id);
                    return;
                }
            };
            let result = if message.service_id == service::INDEXER {
                self.parse_message_from_indexer(entry, &message)
            } else {
                self.parse_message_from_hub(entry, &message)
            };
            if let Err(e) = result {
                warn!("service unavailable: {}", e);
                entry.reactor.aborted(&mut entry.ctx, &e);
            }
            return;
        }
        self.handle_handshake(peer_id, message);
    }

    fn handle_handshake(&self, peer_id: usize, message: Message) {
        if message.service_id == service::API && message.message_id == meta::VERSION_REPLY {
            let mut parser = MessageParser::new(message.body().clone());
            while let Token::Field { tag, .. } = parser.next() {
                if tag == tag::GENERIC_BYTE_DATA {
                    info!("upstream hub connected: {}", parser.string_data());
                }
            }
            self.grant(peer_id, &[Service::TheHub]);
        } else if message.service_id == service::INDEXER
            && message.message_id == indexer::GET_AVAILABLE_INDEXERS_REPLY
        {
            let mut services = Vec::new();
            let mut parser = MessageParser::new(message.body().clone());
            while let Token::Field { tag, .. } = parser.next() {
                match tag {
                    indexer::TXID_INDEXER => services.push(Service::IndexerTxIdDb),
                    indexer::ADDRESS_INDEXER => services.push(Service::IndexerAddressDb),
                    indexer::SPENT_OUTPUT_INDEXER => services.push(Service::IndexerSpentDb),
                    _ => {}
                }
            }
            info!("indexer offers {:?}", services);
            self.grant(peer_id, &services);
        } else {
            debug!(
                "unrouted message {}/{} from peer {}",
                message.service_id, message.message_id, peer_id
            );
        }
    }

    fn grant(&self, peer_id: usize, services: &[Service]) {
        let mut seen = self.ever_seen.lock().unwrap();
        for s in services {
            seen.insert(*s);
        }
        drop(seen);
        let mut peers = self.peers.lock().unwrap();
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.services.extend(services.iter().copied());
        }
    }

    fn send_to_service(
        &self,
        request_id: i32,
        mut message: Message,
        wanted: Service,
    ) -> Result<(), ServiceUnavailable> {
        message.set_header_int(header::SEARCH_REQUEST_ID, i64::from(request_id));
        let peers = self.peers.lock().unwrap();
        for peer in peers.iter() {
            if peer.services.contains(&wanted) {
                if let Err(e) = peer.transport.send(&message) {
                    warn!("sending to {} failed: {}", wanted, e);
                }
                return Ok(());
            }
        }
        Err(ServiceUnavailable {
            service: wanted,
            temporarily: self.ever_seen.lock().unwrap().contains(&wanted),
        })
    }

    /// Scan the job list, start everything startable, and declare the
    /// search finished once nothing is in flight anymore. A finished hook
    /// may push fresh jobs (the mempool retry does); those trigger another
    /// scan.
    fn process_requests(&self, entry: &mut SearchEntry) -> Result<(), ServiceUnavailable> {
        loop {
            self.process_requests_once(entry)?;
            let has_startable = entry
                .ctx
                .jobs
                .iter()
                .any(|j| !j.started && !j.finished && can_start(j));
            if !has_startable {
                return Ok(());
            }
        }
    }

    fn process_requests_once(&self, entry: &mut SearchEntry) -> Result<(), ServiceUnavailable> {
        let request_id = entry.ctx.request_id;
        let mut jobs_waiting = 0;
        let mut i = 0;
        while i < entry.ctx.jobs.len() {
            let job = entry.ctx.jobs[i].clone();
            i += 1;
            if job.finished || job.started {
                continue;
            }
            let job_id = i - 1;
            match self.start_job(request_id, &mut entry.ctx, job_id, &job) {
                Ok(JobOutcome::Started) => entry.ctx.jobs[job_id].started = true,
                Ok(JobOutcome::Waiting) => jobs_waiting += 1,
                Ok(JobOutcome::Expanded) => {
                    let job = &mut entry.ctx.jobs[job_id];
                    job.started = true;
                    job.finished = true;
                }
                Ok(JobOutcome::Invalid) => {
                    warn!("job {} of search {} is invalid", job_id, request_id);
                    let job = &mut entry.ctx.jobs[job_id];
                    job.started = true;
                    job.finished = true;
                }
                Err(e) => return Err(e),
            }
        }
        let jobs_in_flight = entry
            .ctx
            .jobs
            .iter()
            .filter(|j| j.started && !j.finished)
            .count();
        if jobs_in_flight == 0 {
            entry.reactor.finished(&mut entry.ctx, jobs_waiting);
        }
        Ok(())
    }

    fn start_job(
        &self,
        request_id: i32,
        ctx: &mut SearchCtx,
        job_id: usize,
        job: &Job,
    ) -> Result<JobOutcome, ServiceUnavailable> {
        let mut builder = MessageBuilder::new();
        match job.job_type {
            JobType::Unset => Ok(JobOutcome::Invalid),
            JobType::FetchUtxoUnspent | JobType::FetchUtxoDetails => {
                if job.data.len() != 32 && (job.int_data <= 0 || job.int_data2 <= 0) {
                    return Ok(JobOutcome::Invalid);
                }
                if job.data.len() == 32 {
                    builder.add_bytes(tag::TX_ID, &job.data);
                    builder.add_int(live::OUT_INDEX, i64::from(job.int_data));
                } else {
                    builder.add_int(tag::BLOCK_HEIGHT, i64::from(job.int_data));
                    builder.add_int(tag::OFFSET_IN_BLOCK, i64::from(job.int_data2));
                    builder.add_int(live::OUT_INDEX, i64::from(job.int_data3));
                }
                let message_id = if job.job_type == JobType::FetchUtxoDetails {
                    live::GET_UNSPENT_OUTPUT
                } else {
                    live::IS_UNSPENT
                };
                let mut message = builder.message(service::LIVE_TRANSACTIONS, message_id);
                message.set_header_int(header::JOB_REQUEST_ID, job_id as i64);
                self.send_to_service(request_id, message, Service::TheHub)?;
                Ok(JobOutcome::Started)
            }
            JobType::LookupTxById => {
                if job.data.len() != 32 {
                    return Ok(JobOutcome::Invalid);
                }
                debug!("starting lookup (txid) {}", job_id);
                builder.add_bytes(tag::TX_ID, &job.data);
                let mut message = builder.message(service::INDEXER, indexer::FIND_TRANSACTION);
                message.set_header_int(header::JOB_REQUEST_ID, job_id as i64);
                self.send_to_service(request_id, message, Service::IndexerTxIdDb)?;
                Ok(JobOutcome::Started)
            }
            JobType::LookupByAddress => {
                if job.data.len() != 20 && job.data.len() != 32 {
                    return Ok(JobOutcome::Invalid);
                }
                debug!("starting lookup (address) {}", job_id);
                builder.add_bytes(indexer::BITCOIN_ADDRESS, &job.data);
                let mut message = builder.message(service::INDEXER, indexer::FIND_ADDRESS);
                message.set_header_int(header::JOB_REQUEST_ID, job_id as i64);
                self.send_to_service(request_id, message, Service::IndexerAddressDb)?;
                Ok(JobOutcome::Started)
            }
            JobType::LookupSpentTx => {
                if job.data.len() != 32 || job.int_data < 0 {
                    return Ok(JobOutcome::Invalid);
                }
                debug!("starting lookup (spentTx) {}", job_id);
                builder.add_bytes(tag::TX_ID, &job.data);
                builder.add_int(indexer::OUT_INDEX, i64::from(job.int_data));
                let mut message = builder.message(service::INDEXER, indexer::FIND_SPENT_OUTPUT);
                message.set_header_int(header::JOB_REQUEST_ID, job_id as i64);
                self.send_to_service(request_id, message, Service::IndexerSpentDb)?;
                Ok(JobOutcome::Started)
            }
            JobType::FetchTx => {
                if job.int_data > 0 && job.int_data2 > 0 {
                    debug!("starting fetch TX {}", job_id);
                    builder.add_int(tag::BLOCK_HEIGHT, i64::from(job.int_data));
                    builder.add_int(blockchain::TX_OFFSET_IN_BLOCK, i64::from(job.int_data2));
                    add_include_requests(&mut builder, job.transaction_filters);
                    let mut message =
                        builder.message(service::BLOCKCHAIN, blockchain::GET_TRANSACTION);
                    message.set_header_int(header::JOB_REQUEST_ID, job_id as i64);
                    self.send_to_service(request_id, message, Service::TheHub)?;
                    Ok(JobOutcome::Started)
                } else if job.data.len() == 32 {
                    // no position yet: a lookup job resolves the txid first
                    // and feeds the position into a twin fetch job
                    debug!("expanding fetch TX {} into lookup + fetch", job_id);
                    let mut lookup = Job::new(JobType::LookupTxById);
                    lookup.data = job.data.clone();
                    lookup.next_job_id = job.next_job_id;
                    lookup.next_job_id2 = ctx.jobs.len() as i32 + 1;
                    ctx.jobs.push(lookup);
                    let mut fetch = Job::new(JobType::FetchTx);
                    fetch.transaction_filters = job.transaction_filters;
                    ctx.jobs.push(fetch);
                    // a ref registered on the original now belongs to the twin
                    if let Some(key) = ctx.tx_refs.remove(&job_id) {
                        ctx.tx_refs.insert(ctx.jobs.len() - 1, key);
                    }
                    Ok(JobOutcome::Expanded)
                } else {
                    Ok(JobOutcome::Waiting)
                }
            }
            JobType::FetchBlockHeader => {
                if job.data.len() != 32 && job.int_data == 0 {
                    return Ok(JobOutcome::Waiting);
                }
                debug!("starting fetch of block header {}", job_id);
                if job.int_data != 0 {
                    builder.add_int(tag::BLOCK_HEIGHT, i64::from(job.int_data));
                } else {
                    builder.add_bytes(blockchain::BLOCK_HASH, &job.data);
                }
                let mut message = builder.message(service::BLOCKCHAIN, blockchain::GET_BLOCK_HEADER);
                message.set_header_int(header::JOB_REQUEST_ID, job_id as i64);
                self.send_to_service(request_id, message, Service::TheHub)?;
                Ok(JobOutcome::Started)
            }
            JobType::FetchBlockOfTx => {
                if job.data.len() != 32 && job.int_data == 0 {
                    return Ok(JobOutcome::Waiting);
                }
                debug!("starting fetch of block {}", job_id);
                if job.int_data != 0 {
                    builder.add_int(tag::BLOCK_HEIGHT, i64::from(job.int_data));
                } else {
                    builder.add_bytes(blockchain::BLOCK_HASH, &job.data);
                }
                add_include_requests(&mut builder, job.transaction_filters);
                let mut message = builder.message(service::BLOCKCHAIN, blockchain::GET_BLOCK);
                message.set_header_int(header::JOB_REQUEST_ID, job_id as i64);
                self.send_to_service(request_id, message, Service::TheHub)?;
                Ok(JobOutcome::Started)
            }
            JobType::FindTxInMempool | JobType::FindAddressInMempool => {
                if job.data.len() != 32 {
                    return Ok(JobOutcome::Invalid);
                }
                debug!("starting mempool search {}", job_id);
                if job.job_type == JobType::FindTxInMempool {
                    builder.add_bytes(tag::TX_ID, &job.data);
                } else {
                    builder.add_bytes(live::BITCOIN_SCRIPT_HASHED, &job.data);
                }
                add_include_requests(&mut builder, job.transaction_filters);
                let mut message = builder.message(service::LIVE_TRANSACTIONS, live::SEARCH_MEMPOOL);
                message.set_header_int(header::JOB_REQUEST_ID, job_id as i64);
                self.send_to_service(request_id, message, Service::TheHub)?;
                Ok(JobOutcome::Started)
            }
            JobType::CustomHubMessage => {
                if job.data.is_empty() || job.int_data <= 0 || job.int_data2 <= 0 {
                    return Ok(JobOutcome::Invalid);
                }
                debug!(
                    "starting custom Hub message {} SID {} MID {}",
                    job_id, job.int_data, job.int_data2
                );
                let mut message = Message::with_body(
                    job.int_data as u32,
                    job.int_data2 as u32,
                    job.data.clone(),
                );
                message.set_header_int(header::JOB_REQUEST_ID, job_id as i64);
                self.send_to_service(request_id, message, Service::TheHub)?;
                Ok(JobOutcome::Started)
            }
        }
    }

    fn parse_message_from_hub(
        &self,
        entry: &mut SearchEntry,
        message: &Message,
    ) -> Result<(), ServiceUnavailable> {
        let job_id = message.header_int(header::JOB_REQUEST_ID);
        if job_id < 0 || job_id as usize >= entry.ctx.jobs.len() {
            debug!("hub message refers to non existing job id {}", job_id);
            return Ok(());
        }
        let job_id = job_id as usize;
        entry.ctx.jobs[job_id].finished = true;
        let job = entry.ctx.jobs[job_id].clone();
        let mut parser = MessageParser::new(message.body().clone());

        if message.service_id == service::BLOCKCHAIN {
            match message.message_id {
                blockchain::GET_TRANSACTION_REPLY => {
                    let tx = fill_tx(&mut parser, &job, job_id);
                    entry.ctx.answer.push(tx);
                    update_tx_refs(&mut entry.ctx, job_id);
                    let index = entry.ctx.answer.len() - 1;
                    entry.reactor.transaction_added(&mut entry.ctx, index);
                }
                blockchain::GET_BLOCK_HEADER_REPLY => {
                    let header = parse_block_header(&mut parser);
                    if header.height > 0 {
                        entry.ctx.block_headers.insert(header.height, header);
                    }
                }
                blockchain::GET_BLOCK_REPLY => {
                    while parser.peek_tag().is_some() {
                        let tx = fill_tx(&mut parser, &job, job_id);
                        entry.ctx.answer.push(tx);
                        let index = entry.ctx.answer.len() - 1;
                        entry.reactor.transaction_added(&mut entry.ctx, index);
                    }
                }
                _ => debug!(
                    "unknown message from hub {}/{}",
                    message.service_id, message.message_id
                ),
            }
        } else if message.service_id == service::LIVE_TRANSACTIONS {
            match message.message_id {
                live::IS_UNSPENT_REPLY | live::GET_UNSPENT_OUTPUT_REPLY => {
                    let mut lookup = UtxoLookup {
                        job_id,
                        block_height: job.int_data,
                        offset_in_block: job.int_data2,
                        out_index: job.int_data3,
                        unspent: false,
                        amount: -1,
                        output_script: Default::default(),
                    };
                    while let Token::Field { tag, .. } = parser.next() {
                        match tag {
                            tag::BLOCK_HEIGHT => lookup.block_height = parser.int_data() as i32,
                            tag::OFFSET_IN_BLOCK => {
                                lookup.offset_in_block = parser.int_data() as i32
                            }
                            live::UNSPENT_STATE => lookup.unspent = parser.bool_data(),
                            live::OUT_INDEX => lookup.out_index = parser.int_data() as i32,
                            live::AMOUNT => lookup.amount = parser.int_data(),
                            live::OUTPUT_SCRIPT => lookup.output_script = parser.bytes_data(),
                            _ => {}
                        }
                    }
                    entry.reactor.utxo_lookup(&mut entry.ctx, lookup);
                }
                live::SEND_TRANSACTION_REPLY => {
                    while let Token::Field { tag, .. } = parser.next() {
                        if tag == tag::GENERIC_BYTE_DATA {
                            let tx = Transaction {
                                txid: parser.bytes_data(),
                                job_id: job_id as i32,
                                block_height: -1,
                                offset_in_block: 0,
                                out_index: -1,
                                fees: -1,
                                ..Transaction::default()
                            };
                            entry.ctx.answer.push(tx);
                            break;
                        }
                    }
                }
                live::SEARCH_MEMPOOL_REPLY => {
                    while parser.peek_tag().is_some() {
                        let tx = fill_tx(&mut parser, &job, job_id);
                        entry.ctx.answer.push(tx);
                        update_tx_refs(&mut entry.ctx, job_id);
                        let index = entry.ctx.answer.len() - 1;
                        entry.reactor.transaction_added(&mut entry.ctx, index);
                    }
                }
                _ => {}
            }
        } else if message.service_id == service::API && message.message_id == meta::COMMAND_FAILED {
            let mut error = SearchError::default();
            while let Token::Field { tag, .. } = parser.next() {
                match tag {
                    meta::FAILED_REASON => error.error = parser.string_data(),
                    meta::FAILED_COMMAND_SERVICE_ID => error.service_id = parser.int_data() as i32,
                    meta::FAILED_COMMAND_ID => error.message_id = parser.int_data() as i32,
                    _ => {}
                }
            }
            entry.ctx.errors.insert(job_id, error);
        } else {
            debug!(
                "unknown message from hub {}/{}",
                message.service_id, message.message_id
            );
        }

        self.process_requests(entry)
    }

    fn parse_message_from_indexer(
        &self,
        entry: &mut SearchEntry,
        message: &Message,
    ) -> Result<(), ServiceUnavailable> {
        let job_id = message.header_int(header::JOB_REQUEST_ID);
        if job_id < 0 || job_id as usize >= entry.ctx.jobs.len() {
            debug!("indexer message refers to non existing job id {}", job_id);
            return Ok(());
        }
        let job_id = job_id as usize;
        entry.ctx.jobs[job_id].finished = true;
        let job = entry.ctx.jobs[job_id].clone();
        let mut parser = MessageParser::new(message.body().clone());

        match message.message_id {
            indexer::FIND_TRANSACTION_REPLY | indexer::FIND_SPENT_OUTPUT_REPLY => {
                let mut height = 0i32;
                let mut offset = 0i32;
                while let Token::Field { tag, .. } = parser.next() {
                    match tag {
                        tag::BLOCK_HEIGHT => height = parser.int_data() as i32,
                        tag::OFFSET_IN_BLOCK => offset = parser.int_data() as i32,
                        _ => {}
                    }
                }
                if height != -1 {
                    // only feed dependents when the lookup actually hit
                    update_job(&mut entry.ctx, job.next_job_id, &job.data, height, offset);
                    update_job(&mut entry.ctx, job.next_job_id2, &job.data, height, offset);
                }
                if message.message_id == indexer::FIND_TRANSACTION_REPLY {
                    entry
                        .reactor
                        .txid_resolved(&mut entry.ctx, job_id, height, offset);
                } else {
                    entry
                        .reactor
                        .spent_output_resolved(&mut entry.ctx, job_id, height, offset);
                }
            }
            indexer::FIND_ADDRESS_REPLY => {
                let mut height = -1i32;
                let mut offset = 0i32;
                while let Token::Field { tag, .. } = parser.next() {
                    match tag {
                        tag::BLOCK_HEIGHT => height = parser.int_data() as i32,
                        tag::OFFSET_IN_BLOCK => offset = parser.int_data() as i32,
                        indexer::OUT_INDEX => {
                            let out_index = parser.int_data() as i32;
                            entry.reactor.address_used_in_output(
                                &mut entry.ctx,
                                height,
                                offset,
                                out_index,
                            );
                        }
                        _ => {}
                    }
                }
            }
            _ => debug!("unknown message from indexer"),
        }

        self.process_requests(entry)
    }
}

enum JobOutcome {
    Started,
    Waiting,
    Expanded,
    Invalid,
}

/// Whether a job has the data it needs to be dispatched.
fn can_start(job: &Job) -> bool {
    match job.job_type {
        JobType::FetchTx => (job.int_data > 0 && job.int_data2 > 0) || job.data.len() == 32,
        JobType::FetchBlockHeader | JobType::FetchBlockOfTx => {
            job.data.len() == 32 || job.int_data != 0
        }
        _ => true,
    }
}

/// Placeholder transport while a real connection is being established.
struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _message: &Message) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
    }
}

fn add_include_requests(builder: &mut MessageBuilder, filters: u32) {
    if filters & filter::INPUTS != 0 {
        builder.add_bool(blockchain::INCLUDE_INPUTS, true);
    }
    builder.add_bool(blockchain::INCLUDE_TX_ID, filters & filter::TX_ID != 0);
    builder.add_bool(
        blockchain::FULL_TRANSACTION_DATA,
        filters & filter::FULL_TX_DATA != 0,
    );
    if filters & filter::OUTPUTS != 0 {
        builder.add_bool(blockchain::INCLUDE_OUTPUTS, true);
    }
    if filters & filter::OUTPUT_AMOUNTS != 0 {
        builder.add_bool(blockchain::INCLUDE_OUTPUT_AMOUNTS, true);
    }
    if filters & filter::OUTPUT_SCRIPTS != 0 {
        builder.add_bool(blockchain::INCLUDE_OUTPUT_SCRIPTS, true);
    }
    if filters & filter::OUTPUT_ADDRESSES != 0 {
        builder.add_bool(blockchain::INCLUDE_OUTPUT_ADDRESSES, true);
    }
    if filters & filter::OFFSET_IN_BLOCK != 0 {
        builder.add_bool(blockchain::INCLUDE_OFFSET_IN_BLOCK, true);
    }
}

/// Assemble one transaction from a reply, consuming tags up to the next
/// separator. The LiveTransaction and Blockchain services share most tag
/// numbers, so the shared values act as the lowest common denominator.
fn fill_tx(parser: &mut MessageParser, job: &Job, job_id: usize) -> Transaction {
    let mut tx = Transaction {
        job_id: job_id as i32,
        block_height: -1,
        offset_in_block: 0,
        out_index: -1,
        fees: -1,
        ..Transaction::default()
    };
    if job.job_type == JobType::FetchTx {
        tx.block_height = job.int_data;
        tx.offset_in_block = job.int_data2;
    }
    if job.job_type == JobType::FetchTx || job.job_type == JobType::FindTxInMempool {
        tx.txid = job.data.clone();
    }

    while let Token::Field { tag, .. } = parser.next() {
        match tag {
            tag::TX_ID => tx.txid = parser.bytes_data(),
            tag::BLOCK_HEIGHT => tx.block_height = parser.int_data() as i32,
            tag::OFFSET_IN_BLOCK => tx.offset_in_block = parser.int_data() as i32,
            tag::GENERIC_BYTE_DATA => tx.full_tx_data = parser.bytes_data(),
            blockchain::TX_IN_TXID => {
                tx.inputs.push(Input {
                    prev_txid: parser.bytes_data(),
                    ..Input::default()
                });
            }
            blockchain::TX_INPUT_SCRIPT => {
                if tx.inputs.is_empty() {
                    // the coinbase has no prev-txid tag
                    tx.inputs.push(Input::default());
                }
                tx.inputs.last_mut().unwrap().input_script = parser.bytes_data();
            }
            blockchain::TX_IN_OUTINDEX => {
                if let Some(input) = tx.inputs.last_mut() {
                    input.out_index = parser.int_data() as i32;
                }
            }
            blockchain::TX_OUT_INDEX => {
                tx.outputs.push(Output {
                    index: parser.int_data() as i16,
                    ..Output::default()
                });
            }
            blockchain::TX_OUT_AMOUNT => {
                if let Some(output) = tx.outputs.last_mut() {
                    output.amount = parser.int_data() as u64;
                }
            }
            blockchain::TX_OUTPUT_SCRIPT => {
                if let Some(output) = tx.outputs.last_mut() {
                    output.out_script = parser.bytes_data();
                    output.script_kind = OutputScriptKind::FullScript;
                }
            }
            blockchain::TX_OUT_ADDRESS => {
                if let Some(output) = tx.outputs.last_mut() {
                    output.out_script = parser.bytes_data();
                    output.script_kind = OutputScriptKind::OnlyAddress;
                }
            }
            live::TRANSACTION if job.job_type == JobType::FindTxInMempool => {
                tx.full_tx_data = parser.bytes_data();
            }
            live::FIRST_SEEN_TIME if job.job_type == JobType::FindTxInMempool => {
                tx.first_seen_time = parser.int_data() as u32;
            }
            live::MATCHING_OUT_INDEX if job.job_type == JobType::FindAddressInMempool => {
                tx.out_index = parser.int_data() as i16;
            }
            tag::SEPARATOR => break,
            _ => {}
        }
    }
    SearchCtx::fill_missing_txid(&mut tx);
    tx
}

fn parse_block_header(parser: &mut MessageParser) -> BlockHeader {
    let mut header = BlockHeader::default();
    while let Token::Field { tag, .. } = parser.next() {
        match tag {
            blockchain::BLOCK_HASH => header.hash = parser.bytes_data(),
            blockchain::CONFIRMATIONS => header.confirmations = parser.int_data() as i32,
            tag::BLOCK_HEIGHT => header.height = parser.int_data() as i32,
            blockchain::VERSION => header.version = parser.int_data() as u32,
            blockchain::MERKLE_ROOT => header.merkle_root = parser.bytes_data(),
            blockchain::TIME => header.time = parser.int_data() as u32,
            blockchain::MEDIAN_TIME => header.median_time = parser.int_data() as u32,
            blockchain::NONCE => header.nonce = parser.int_data() as u32,
            blockchain::BITS => header.bits = parser.int_data() as u32,
            blockchain::DIFFICULTY => header.difficulty = parser.double_data(),
            _ => {}
        }
    }
    header
}

/// Feed a resolved `(height, offset)` into a dependent job.
fn update_job(ctx: &mut SearchCtx, job_index: i32, data: &crate::buffer::ConstBuffer, height: i32, offset: i32) {
    if job_index == -1 {
        return;
    }
    let index = job_index as usize;
    debug_assert!(index < ctx.jobs.len());
    if let Some(job) = ctx.jobs.get_mut(index) {
        job.int_data = height;
        job.int_data2 = offset;
        job.data = data.clone();
    }
}

/// Link the transaction that just landed at the back of the answer list
/// into the answer its fetch job was registered for.
fn update_tx_refs(ctx: &mut SearchCtx, job_id: usize) {
    if let Some(key) = ctx.tx_refs.get(&job_id).copied() {
        let (tx_index, k) = unpack_tx_ref_key(key);
        debug_assert!(tx_index < ctx.answer.len());
        let newest = ctx.answer.len() - 1;
        if let Some(back_tx) = ctx.answer.get_mut(tx_index) {
            back_tx.tx_refs.insert(k, newest);
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::{tx_ref_key, ref_key_for_input, TxRef};
    use super::*;
    use std::sync::mpsc::{channel, Sender};

    /// Captures outgoing frames for the test to inspect.
    struct Capture {
        sent: Arc<Mutex<Vec<Message>>>,
    }

    impl Transport for Capture {
        fn send(&self, message: &Message) -> io::Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Finished(usize),
        TxAdded(usize),
        TxIdResolved(usize, i32, i32),
        Aborted,
    }

    struct Recorder {
        events: Sender<Event>,
    }

    impl SearchReactor for Recorder {
        fn finished(&mut self, _ctx: &mut SearchCtx, waiting: usize) {
            self.events.send(Event::Finished(waiting)).unwrap();
        }
        fn transaction_added(&mut self, _ctx: &mut SearchCtx, index: usize) {
            self.events.send(Event::TxAdded(index)).unwrap();
        }
        fn txid_resolved(&mut self, _ctx: &mut SearchCtx, job: usize, height: i32, offset: i32) {
            self.events.send(Event::TxIdResolved(job, height, offset)).unwrap();
        }
        fn aborted(&mut self, _ctx: &mut SearchCtx, _error: &ServiceUnavailable) {
            self.events.send(Event::Aborted).unwrap();
        }
    }

    fn engine_with_all_services() -> (SearchEngine, usize, Arc<Mutex<Vec<Message>>>) {
        let engine = SearchEngine::new();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let services: HashSet<Service> = [
            Service::TheHub,
            Service::IndexerTxIdDb,
            Service::IndexerAddressDb,
            Service::IndexerSpentDb,
        ]
        .iter()
        .copied()
        .collect();
        let peer = engine.add_peer(
            Box::new(Capture {
                sent: Arc::clone(&sent),
            }),
            services,
        );
        (engine, peer, sent)
    }

    fn txid_bytes(seed: u8) -> Vec<u8> {
        let mut v = vec![seed; 32];
        v[31] = seed.wrapping_add(1);
        v
    }

    fn indexer_reply(request_id: i64, job_id: i64, message_id: u32, height: i32, offset: i32) -> Message {
        let mut builder = MessageBuilder::new();
        builder.add_int(tag::BLOCK_HEIGHT, i64::from(height));
        builder.add_int(tag::OFFSET_IN_BLOCK, i64::from(offset));
        let mut reply = builder.message(service::INDEXER, message_id);
        reply.set_header_int(header::SEARCH_REQUEST_ID, request_id);
        reply.set_header_int(header::JOB_REQUEST_ID, job_id);
        reply
    }

    fn tx_reply(request_id: i64, job_id: i64, txid: &[u8]) -> Message {
        let mut builder = MessageBuilder::new();
        builder.add_bytes(tag::TX_ID, txid);
        builder.add_int(tag::BLOCK_HEIGHT, 112);
        builder.add_int(tag::OFFSET_IN_BLOCK, 81);
        let mut reply = builder.message(service::BLOCKCHAIN, blockchain::GET_TRANSACTION_REPLY);
        reply.set_header_int(header::SEARCH_REQUEST_ID, request_id);
        reply.set_header_int(header::JOB_REQUEST_ID, job_id);
        reply
    }

    #[test]
    fn test_lookup_then_fetch_finishes_exactly_once() {
        let (engine, peer, sent) = engine_with_all_services();
        let (events_tx, events) = channel();

        let mut ctx = SearchCtx::new();
        let mut lookup = Job::with_data(
            JobType::LookupTxById,
            txid_bytes(0xAB).as_slice().into(),
        );
        lookup.next_job_id = 1;
        ctx.add_job(lookup);
        ctx.add_job(Job::new(JobType::FetchTx)); // waits for the lookup
        let id = engine
            .start(ctx, Box::new(Recorder { events: events_tx }))
            .unwrap();

        // the lookup went out; the fetch is waiting for data
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(
            sent.lock().unwrap()[0].message_id,
            indexer::FIND_TRANSACTION
        );

        engine.handle_message(
            peer,
            indexer_reply(i64::from(id), 0, indexer::FIND_TRANSACTION_REPLY, 112, 81),
        );
        assert_eq!(
            events.try_recv().unwrap(),
            Event::TxIdResolved(0, 112, 81)
        );
        // the resolved position unblocked the fetch
        assert_eq!(sent.lock().unwrap().len(), 2);
        assert_eq!(
            sent.lock().unwrap()[1].message_id,
            blockchain::GET_TRANSACTION
        );

        engine.handle_message(peer, tx_reply(i64::from(id), 1, &txid_bytes(0xAB)));
        assert_eq!(events.try_recv().unwrap(), Event::TxAdded(0));
        assert_eq!(events.try_recv().unwrap(), Event::Finished(0));
        assert!(events.try_recv().is_err(), "finished fired exactly once");
        engine.finish_search(id);
    }

    #[test]
    fn test_waiting_job_counts_in_finished() {
        let (engine, peer, _sent) = engine_with_all_services();
        let (events_tx, events) = channel();

        let mut ctx = SearchCtx::new();
        ctx.add_job(Job::with_data(
            JobType::LookupTxById,
            txid_bytes(1).as_slice().into(),
        ));
        ctx.add_job(Job::new(JobType::FetchBlockHeader)); // never gets data
        let id = engine
            .start(ctx, Box::new(Recorder { events: events_tx }))
            .unwrap();

        engine.handle_message(
            peer,
            indexer_reply(i64::from(id), 0, indexer::FIND_TRANSACTION_REPLY, -1, 0),
        );
        assert_eq!(events.try_recv().unwrap(), Event::TxIdResolved(0, -1, 0));
        assert_eq!(events.try_recv().unwrap(), Event::Finished(1));
        engine.finish_search(id);
    }

    #[test]
    fn test_missing_service_aborts_with_temporarily_false() {
        let engine = SearchEngine::new();
        let (events_tx, events) = channel();
        let mut ctx = SearchCtx::new();
        ctx.add_job(Job::with_data(
            JobType::LookupTxById,
            txid_bytes(9).as_slice().into(),
        ));
        let err = engine
            .start(ctx, Box::new(Recorder { events: events_tx }))
            .unwrap_err();
        assert_eq!(err.service, Service::IndexerTxIdDb);
        assert!(!err.temporarily);
        assert_eq!(events.try_recv().unwrap(), Event::Aborted);
    }

    #[test]
    fn test_fetch_tx_by_txid_self_expands() {
        let (engine, _peer, sent) = engine_with_all_services();
        let (events_tx, _events) = channel();
        let mut ctx = SearchCtx::new();
        ctx.add_job(Job::with_data(
            JobType::FetchTx,
            txid_bytes(5).as_slice().into(),
        ));
        let id = engine
            .start(ctx, Box::new(Recorder { events: events_tx }))
            .unwrap();
        // the fetch-by-txid turned into a lookup (sent) plus a twin fetch
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_id, indexer::FIND_TRANSACTION);
        assert_eq!(sent[0].header_int(header::JOB_REQUEST_ID), 1);
        engine.finish_search(id);
    }

    #[test]
    fn test_tx_refs_link_fetched_parent() {
        let (engine, peer, _sent) = engine_with_all_services();
        let (events_tx, events) = channel();

        let parent_txid = txid_bytes(0x77);
        let mut ctx = SearchCtx::new();
        // answer 0 exists already: a transaction with one input
        let mut child = Transaction::default();
        child.inputs.push(Input {
            prev_txid: parent_txid.as_slice().into(),
            ..Input::default()
        });
        ctx.answer.push(child);
        // fetch the parent for input 0 of answer 0
        let mut fetch = Job::with_data(JobType::FetchTx, parent_txid.as_slice().into());
        fetch.int_data = 112;
        fetch.int_data2 = 300;
        let job_id = ctx.add_job(fetch);
        ctx.tx_refs.insert(job_id, tx_ref_key(0, TxRef::Input, 0));

        let id = engine
            .start(ctx, Box::new(Recorder { events: events_tx }))
            .unwrap();
        engine.handle_message(peer, tx_reply(i64::from(id), job_id as i64, &parent_txid));
        assert_eq!(events.try_recv().unwrap(), Event::TxAdded(1));
        assert_eq!(events.try_recv().unwrap(), Event::Finished(0));

        engine
            .inspect(id, |ctx| {
                // the child's input 0 now points at the fetched parent
                let link = ctx.answer[0].tx_refs[&ref_key_for_input(0)];
                assert_eq!(link, 1);
                assert_eq!(&ctx.answer[link].txid[..], parent_txid.as_slice());
            })
            .unwrap();
        engine.finish_search(id);
    }

    #[test]
    fn test_unknown_search_id_is_dropped() {
        let (engine, peer, _sent) = engine_with_all_services();
        // must not panic or do anything observable
        engine.handle_message(peer, tx_reply(424242, 0, &txid_bytes(1)));
    }
}
