use super::{bch_value, wait_for_outcome, Outcome, RestError};
use crate::address_codec::{to_cash_address, to_legacy_address, AddressType};
use crate::api::{live, service, tag};
use crate::buffer::ConstBuffer;
use crate::hash::{Hash160, Hash256};
use crate::message::MessageBuilder;
use crate::search::{
    filter, ref_key_for_input, ref_key_for_output, tx_ref_key, Job, JobType, SearchCtx,
    SearchEngine, SearchReactor, ServiceUnavailable, Transaction, TxRef, UtxoLookup,
};
use crate::txiter::{TxField, TxIterator};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::mpsc::{channel, Sender};

const DETAILS_FILTERS: u32 = filter::OFFSET_IN_BLOCK
    | filter::TX_ID
    | filter::FULL_TX_DATA
    | filter::INPUTS
    | filter::OUTPUTS
    | filter::OUTPUT_AMOUNTS
    | filter::OUTPUT_SCRIPTS;

const PARENT_FILTERS: u32 =
    filter::OFFSET_IN_BLOCK | filter::TX_ID | filter::OUTPUTS | filter::OUTPUT_AMOUNTS;

fn txid_buffer(txid: &Hash256) -> ConstBuffer {
    ConstBuffer::from_vec(txid.0.to_vec())
}

fn send_once(slot: &mut Option<Sender<Outcome>>, outcome: Outcome) {
    if let Some(sender) = slot.take() {
        let _ = sender.send(outcome);
    }
}

fn hex_txid(buffer: &ConstBuffer) -> String {
    match Hash256::from_slice(buffer) {
        Some(hash) => hash.to_string(),
        None => hex::encode(&buffer[..]),
    }
}

/// `GET /v2/transaction/details/{txid}`
pub(crate) fn transaction_details(engine: &SearchEngine, txid: Hash256) -> Outcome {
    let (sender, receiver) = channel();
    let mut ctx = SearchCtx::new();
    let mut job = Job::with_data(JobType::FetchTx, txid_buffer(&txid));
    job.transaction_filters = DETAILS_FILTERS;
    ctx.add_job(job);
    let reactor = TxDetailsSearch {
        sender: Some(sender),
        txid,
        tried_mempool: false,
        expanded: false,
    };
    let started = engine.start(ctx, Box::new(reactor));
    wait_for_outcome(engine, started, receiver)
}

/// `GET /v2/rawtransactions/getRawTransaction/{txid}`
pub(crate) fn raw_transaction(engine: &SearchEngine, txid: Hash256, verbose: bool) -> Outcome {
    if !verbose {
        let (sender, receiver) = channel();
        let mut ctx = SearchCtx::new();
        let mut job = Job::with_data(JobType::FetchTx, txid_buffer(&txid));
        job.transaction_filters = filter::TX_ID | filter::FULL_TX_DATA;
        ctx.add_job(job);
        let reactor = RawTxSearch {
            sender: Some(sender),
            tried_mempool: false,
        };
        let started = engine.start(ctx, Box::new(reactor));
        return wait_for_outcome(engine, started, receiver);
    }
    transaction_details(engine, txid)
}

struct TxDetailsSearch {
    sender: Option<Sender<Outcome>>,
    txid: Hash256,
    tried_mempool: bool,
    /// Follow-up jobs are added once, after the main transaction landed.
    expanded: bool,
}

impl SearchReactor for TxDetailsSearch {
    fn transaction_added(&mut self, ctx: &mut SearchCtx, answer_index: usize) {
        if answer_index != 0 || self.expanded {
            return;
        }
        self.expanded = true;
        let (height, inputs, output_count, coinbase) = {
            let tx = &ctx.answer[0];
            (
                tx.block_height,
                tx.inputs
                    .iter()
                    .map(|i| (i.prev_txid.clone(), i.out_index))
                    .collect::<Vec<_>>(),
                tx.outputs.len(),
                tx.is_coinbase(),
            )
        };
        // the block header supplies the confirmation count
        if height > 0 {
            let mut header = Job::new(JobType::FetchBlockHeader);
            header.int_data = height;
            ctx.add_job(header);
        }
        // parents of every input, to render input values and addresses
        if !coinbase {
            for (i, (prev_txid, _)) in inputs.iter().enumerate() {
                if prev_txid.len() != 32 {
                    continue;
                }
                let mut parent = Job::with_data(JobType::FetchTx, prev_txid.clone());
                parent.transaction_filters = PARENT_FILTERS;
                let job_id = ctx.add_job(parent);
                ctx.tx_refs
                    .insert(job_id, tx_ref_key(0, TxRef::Input, i as u32));
            }
        }
        // who spent each output
        if height > 0 {
            for out_index in 0..output_count {
                let mut fetch = Job::new(JobType::FetchTx);
                fetch.transaction_filters =
                    filter::OFFSET_IN_BLOCK | filter::TX_ID | filter::INPUTS;
                let fetch_id = ctx.jobs.len() + 1;
                let mut lookup = Job::with_data(JobType::LookupSpentTx, txid_buffer(&self.txid));
                lookup.int_data = out_index as i32;
                lookup.next_job_id = fetch_id as i32;
                ctx.add_job(lookup);
                let fetch_job = ctx.add_job(fetch);
                debug_assert_eq!(fetch_job, fetch_id);
                ctx.tx_refs
                    .insert(fetch_id, tx_ref_key(0, TxRef::Output, out_index as u32));
            }
        }
    }

    fn finished(&mut self, ctx: &mut SearchCtx, _waiting_jobs: usize) {
        if ctx.answer.is_empty() && !self.tried_mempool {
            // no blockchain hit; one more attempt against the mempool
            self.tried_mempool = true;
            let mut job = Job::with_data(JobType::FindTxInMempool, txid_buffer(&self.txid));
            job.transaction_filters = DETAILS_FILTERS;
            ctx.add_job(job);
            return;
        }
        let outcome = if ctx.answer.is_empty() {
            Err(RestError::NotFound("transaction not found".into()))
        } else {
            Ok(render_transaction(ctx, 0))
        };
        send_once(&mut self.sender, outcome);
    }

    fn aborted(&mut self, _ctx: &mut SearchCtx, error: &ServiceUnavailable) {
        send_once(&mut self.sender, Err(RestError::Unavailable(error.clone())));
    }
}

struct RawTxSearch {
    sender: Option<Sender<Outcome>>,
    tried_mempool: bool,
}

impl SearchReactor for RawTxSearch {
    fn finished(&mut self, ctx: &mut SearchCtx, _waiting_jobs: usize) {
        if ctx.answer.is_empty() && !self.tried_mempool {
            self.tried_mempool = true;
            let txid = ctx.jobs[0].data.clone();
            let mut job = Job::with_data(JobType::FindTxInMempool, txid);
            job.transaction_filters = filter::TX_ID | filter::FULL_TX_DATA;
            ctx.add_job(job);
            return;
        }
        let outcome = match ctx.answer.first() {
            Some(tx) if !tx.full_tx_data.is_empty() => {
                Ok(Value::String(hex::encode(&tx.full_tx_data[..])))
            }
            _ => Err(RestError::NotFound("transaction not found".into())),
        };
        send_once(&mut self.sender, outcome);
    }

    fn aborted(&mut self, _ctx: &mut SearchCtx, error: &ServiceUnavailable) {
        send_once(&mut self.sender, Err(RestError::Unavailable(error.clone())));
    }
}

/// `GET /v2/address/details/{addr}`
pub(crate) fn address_details(
    engine: &SearchEngine,
    address: (Hash160, AddressType),
) -> Outcome {
    let (sender, receiver) = channel();
    let mut ctx = SearchCtx::new();
    ctx.add_job(Job::with_data(
        JobType::LookupByAddress,
        ConstBuffer::from_vec(address.0 .0.to_vec()),
    ));
    let reactor = AddressDetailsSearch {
        sender: Some(sender),
        address,
        fetch_jobs: HashMap::new(),
        received: 0,
        unspent: 0,
        tx_ids: Vec::new(),
    };
    let started = engine.start(ctx, Box::new(reactor));
    wait_for_outcome(engine, started, receiver)
}

struct AddressDetailsSearch {
    sender: Option<Sender<Outcome>>,
    address: (Hash160, AddressType),
    /// FetchTx job id -> the out index we care about in its reply.
    fetch_jobs: HashMap<usize, i32>,
    received: i64,
    unspent: i64,
    tx_ids: Vec<String>,
}

impl SearchReactor for AddressDetailsSearch {
    fn address_used_in_output(
        &mut self,
        ctx: &mut SearchCtx,
        height: i32,
        offset: i32,
        out_index: i32,
    ) {
        if height <= 0 || offset <= 0 {
            return;
        }
        let mut fetch = Job::new(JobType::FetchTx);
        fetch.int_data = height;
        fetch.int_data2 = offset;
        fetch.transaction_filters = PARENT_FILTERS;
        let job_id = ctx.add_job(fetch);
        self.fetch_jobs.insert(job_id, out_index);

        let mut utxo = Job::new(JobType::FetchUtxoDetails);
        utxo.int_data = height;
        utxo.int_data2 = offset;
        utxo.int_data3 = out_index;
        ctx.add_job(utxo);
    }

    fn transaction_added(&mut self, ctx: &mut SearchCtx, answer_index: usize) {
        let tx = &ctx.answer[answer_index];
        let wanted = match self.fetch_jobs.get(&(tx.job_id as usize)) {
            Some(out) => *out,
            None => return,
        };
        if let Some(output) = tx.outputs.iter().find(|o| i32::from(o.index) == wanted) {
            self.received += output.amount as i64;
        }
        let txid = hex_txid(&tx.txid);
        if !self.tx_ids.contains(&txid) {
            self.tx_ids.push(txid);
        }
    }

    fn utxo_lookup(&mut self, _ctx: &mut SearchCtx, lookup: UtxoLookup) {
        if lookup.unspent && lookup.amount > 0 {
            self.unspent += lookup.amount;
        }
    }

    fn finished(&mut self, _ctx: &mut SearchCtx, _waiting_jobs: usize) {
        let (ripe, kind) = self.address;
        let sent = self.received - self.unspent;
        let value = json!({
            "balance": bch_value(self.unspent),
            "balanceSat": self.unspent,
            "totalReceived": bch_value(self.received),
            "totalReceivedSat": self.received,
            "totalSent": bch_value(sent),
            "totalSentSat": sent,
            "unconfirmedBalance": bch_value(0),
            "unconfirmedBalanceSat": 0,
            "transactions": self.tx_ids,
            "legacyAddress": to_legacy_address(&ripe, kind),
            "cashAddress": to_cash_address(&ripe, kind),
        });
        send_once(&mut self.sender, Ok(value));
    }

    fn aborted(&mut self, _ctx: &mut SearchCtx, error: &ServiceUnavailable) {
        send_once(&mut self.sender, Err(RestError::Unavailable(error.clone())));
    }
}

/// `GET /v2/address/utxo/{addr}`
pub(crate) fn address_utxos(engine: &SearchEngine, address: (Hash160, AddressType)) -> Outcome {
    let (sender, receiver) = channel();
    let mut ctx = SearchCtx::new();
    ctx.add_job(Job::with_data(
        JobType::LookupByAddress,
        ConstBuffer::from_vec(address.0 .0.to_vec()),
    ));
    let reactor = AddressUtxoSearch {
        sender: Some(sender),
        address,
        tx_ids: HashMap::new(),
        unspent: Vec::new(),
    };
    let started = engine.start(ctx, Box::new(reactor));
    wait_for_outcome(engine, started, receiver)
}

struct AddressUtxoSearch {
    sender: Option<Sender<Outcome>>,
    address: (Hash160, AddressType),
    /// `(height, offset)` -> txid, filled as fetches come back.
    tx_ids: HashMap<(i32, i32), String>,
    unspent: Vec<UtxoLookup>,
}

impl SearchReactor for AddressUtxoSearch {
    fn address_used_in_output(
        &mut self,
        ctx: &mut SearchCtx,
        height: i32,
        offset: i32,
        out_index: i32,
    ) {
        if height <= 0 || offset <= 0 {
            return;
        }
        let mut utxo = Job::new(JobType::FetchUtxoDetails);
        utxo.int_data = height;
        utxo.int_data2 = offset;
        utxo.int_data3 = out_index;
        ctx.add_job(utxo);

        if !self.tx_ids.contains_key(&(height, offset)) {
            self.tx_ids.insert((height, offset), String::new());
            let mut fetch = Job::new(JobType::FetchTx);
            fetch.int_data = height;
            fetch.int_data2 = offset;
            fetch.transaction_filters = filter::OFFSET_IN_BLOCK | filter::TX_ID;
            ctx.add_job(fetch);
        }
    }

    fn transaction_added(&mut self, ctx: &mut SearchCtx, answer_index: usize) {
        let tx = &ctx.answer[answer_index];
        self.tx_ids
            .insert((tx.block_height, tx.offset_in_block), hex_txid(&tx.txid));
    }

    fn utxo_lookup(&mut self, _ctx: &mut SearchCtx, lookup: UtxoLookup) {
        if lookup.unspent {
            self.unspent.push(lookup);
        }
    }

    fn finished(&mut self, _ctx: &mut SearchCtx, _waiting_jobs: usize) {
        let (ripe, kind) = self.address;
        let utxos: Vec<Value> = self
            .unspent
            .iter()
            .map(|u| {
                let mut entry = Map::new();
                if let Some(txid) = self.tx_ids.get(&(u.block_height, u.offset_in_block)) {
                    if !txid.is_empty() {
                        entry.insert("txid".into(), Value::String(txid.clone()));
                    }
                }
                entry.insert("vout".into(), u.out_index.into());
                entry.insert("amount".into(), bch_value(u.amount.max(0)));
                entry.insert("satoshis".into(), u.amount.max(0).into());
                entry.insert("height".into(), u.block_height.into());
                Value::Object(entry)
            })
            .collect();
        let value = json!({
            "utxos": utxos,
            "legacyAddress": to_legacy_address(&ripe, kind),
            "cashAddress": to_cash_address(&ripe, kind),
        });
        send_once(&mut self.sender, Ok(value));
    }

    fn aborted(&mut self, _ctx: &mut SearchCtx, error: &ServiceUnavailable) {
        send_once(&mut self.sender, Err(RestError::Unavailable(error.clone())));
    }
}

/// `POST /v2/rawtransactions/sendRawTransaction`
pub(crate) fn send_raw_transaction(engine: &SearchEngine, raw: Vec<u8>) -> Outcome {
    let (sender, receiver) = channel();
    let mut ctx = SearchCtx::new();
    let mut builder = MessageBuilder::new();
    builder.add_bytes(tag::GENERIC_BYTE_DATA, &raw);
    let mut job = Job::with_data(JobType::CustomHubMessage, builder.body());
    job.int_data = service::LIVE_TRANSACTIONS as i32;
    job.int_data2 = live::SEND_TRANSACTION as i32;
    ctx.add_job(job);
    let reactor = SendTxSearch {
        sender: Some(sender),
    };
    let started = engine.start(ctx, Box::new(reactor));
    wait_for_outcome(engine, started, receiver)
}

struct SendTxSearch {
    sender: Option<Sender<Outcome>>,
}

impl SearchReactor for SendTxSearch {
    fn finished(&mut self, ctx: &mut SearchCtx, _waiting_jobs: usize) {
        let outcome = if let Some(error) = ctx.errors.values().next() {
            let text = if error.error == "16: missing-inputs" {
                "Missing inputs".to_string()
            } else {
                error.error.clone()
            };
            Err(RestError::UserInput(text))
        } else if let Some(tx) = ctx.answer.first() {
            Ok(Value::String(hex_txid(&tx.txid)))
        } else {
            Err(RestError::Timeout)
        };
        send_once(&mut self.sender, outcome);
    }

    fn aborted(&mut self, _ctx: &mut SearchCtx, error: &ServiceUnavailable) {
        send_once(&mut self.sender, Err(RestError::Unavailable(error.clone())));
    }
}

/// Render one answer the way the details endpoints expose transactions.
fn render_transaction(ctx: &SearchCtx, index: usize) -> Value {
    let tx = &ctx.answer[index];
    let mut answer = Map::new();
    let txid = hex_txid(&tx.txid);
    answer.insert("txid".into(), Value::String(txid.clone()));
    answer.insert("hash".into(), Value::String(txid));
    answer.insert("size".into(), tx.full_tx_data.len().into());
    answer.insert("blockheight".into(), tx.block_height.into());
    if tx.block_height > 0 {
        if let Some(header) = ctx.block_headers.get(&tx.block_height) {
            answer.insert("confirmations".into(), header.confirmations.into());
            answer.insert("blockhash".into(), Value::String(hex_txid(&header.hash)));
            answer.insert("time".into(), header.time.into());
        }
        answer.insert("firstSeenTime".into(), Value::Null);
    } else {
        answer.insert("firstSeenTime".into(), tx.first_seen_time.into());
        answer.insert("time".into(), tx.first_seen_time.into());
    }

    let mut value_in = 0i64;
    let mut value_out = 0i64;
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut iter = TxIterator::new(&tx.full_tx_data);
    let mut current_input: Option<Map<String, Value>> = None;
    let mut current_output: Option<Map<String, Value>> = None;
    let mut output_value = 0u64;
    loop {
        match iter.next_field() {
            Ok(TxField::TxVersion(version)) => {
                answer.insert("version".into(), version.into());
            }
            Ok(TxField::PrevTxHash(prev)) => {
                let mut input = Map::new();
                if !prev.is_null() {
                    input.insert("txid".into(), Value::String(prev.to_string()));
                }
                current_input = Some(input);
            }
            Ok(TxField::PrevTxIndex(prev_index)) => {
                if let Some(input) = current_input.as_mut() {
                    if prev_index != u32::MAX {
                        input.insert("vout".into(), prev_index.into());
                    }
                    let n = inputs.len();
                    input.insert("n".into(), n.into());
                    // the fetched parent supplies value and addresses
                    if let Some(detail) =
                        input_detail(ctx, index, n as u32, prev_index)
                    {
                        value_in += detail.0;
                        input.insert("value".into(), detail.0.into());
                        if let Some((ripe, kind)) = detail.1 {
                            input.insert(
                                "legacyAddress".into(),
                                Value::String(to_legacy_address(&ripe, kind)),
                            );
                            input.insert(
                                "cashAddress".into(),
                                Value::String(to_cash_address(&ripe, kind)),
                            );
                        }
                    }
                }
            }
            Ok(TxField::TxInScript(script)) => {
                if let Some(mut input) = current_input.take() {
                    if tx.is_coinbase() {
                        input.insert("coinbase".into(), Value::String(hex::encode(script)));
                        input.remove("txid");
                        input.remove("vout");
                    } else {
                        input.insert("scriptSig".into(), json!({ "hex": hex::encode(script) }));
                    }
                    current_input = Some(input);
                }
            }
            Ok(TxField::Sequence(sequence)) => {
                if let Some(mut input) = current_input.take() {
                    input.insert("sequence".into(), sequence.into());
                    inputs.push(Value::Object(input));
                }
            }
            Ok(TxField::OutputValue(amount)) => {
                output_value = amount;
                let mut output = Map::new();
                output.insert("value".into(), bch_value(amount as i64));
                output.insert("n".into(), outputs.len().into());
                current_output = Some(output);
            }
            Ok(TxField::OutputScript(script)) => {
                if let Some(mut output) = current_output.take() {
                    let n = outputs.len();
                    value_out += output_value as i64;
                    let mut script_pub_key = Map::new();
                    script_pub_key.insert("hex".into(), Value::String(hex::encode(script)));
                    if let Some((ripe, kind, type_name)) = script_addresses(script) {
                        script_pub_key.insert(
                            "addresses".into(),
                            json!([to_legacy_address(&ripe, kind)]),
                        );
                        script_pub_key
                            .insert("cashAddrs".into(), json!([to_cash_address(&ripe, kind)]));
                        script_pub_key.insert("type".into(), Value::String(type_name.into()));
                    }
                    output.insert("scriptPubKey".into(), Value::Object(script_pub_key));
                    if let Some((spent_txid, spent_index, spent_height)) =
                        spender_detail(ctx, index, n as u32)
                    {
                        output.insert("spentTxId".into(), Value::String(spent_txid));
                        output.insert("spentIndex".into(), spent_index.into());
                        output.insert("spentHeight".into(), spent_height.into());
                    }
                    outputs.push(Value::Object(output));
                }
            }
            Ok(TxField::LockTime(locktime)) => {
                answer.insert("locktime".into(), locktime.into());
            }
            Ok(TxField::End) | Err(_) => break,
        }
    }
    answer.insert("vin".into(), Value::Array(inputs));
    answer.insert("vout".into(), Value::Array(outputs));
    if tx.is_coinbase() {
        answer.insert("isCoinBase".into(), Value::Bool(true));
        answer.insert("fees".into(), Value::Null);
    } else if value_in > 0 {
        answer.insert("valueIn".into(), bch_value(value_in));
        answer.insert("valueOut".into(), bch_value(value_out));
        answer.insert("fees".into(), bch_value(value_in - value_out));
    }
    Value::Object(answer)
}

/// Value and address of the output an input spends, via the fetched
/// parent transaction.
fn input_detail(
    ctx: &SearchCtx,
    answer_index: usize,
    input_index: u32,
    prev_out: u32,
) -> Option<(i64, Option<(Hash160, AddressType)>)> {
    let tx = &ctx.answer[answer_index];
    let parent_index = *tx.tx_refs.get(&ref_key_for_input(input_index))?;
    let parent: &Transaction = ctx.answer.get(parent_index)?;
    let output = parent
        .outputs
        .iter()
        .find(|o| o.index >= 0 && o.index as u32 == prev_out)?;
    let address = script_addresses(&output.out_script).map(|(r, k, _)| (r, k));
    Some((output.amount as i64, address))
}

/// Who spent output `out_index` of the rendered transaction, if a
/// spent-db lookup resolved it.
fn spender_detail(
    ctx: &SearchCtx,
    answer_index: usize,
    out_index: u32,
) -> Option<(String, i32, i32)> {
    let tx = &ctx.answer[answer_index];
    let spender_index = *tx.tx_refs.get(&ref_key_for_output(out_index))?;
    let spender = ctx.answer.get(spender_index)?;
    let spent_index = spender
        .inputs
        .iter()
        .position(|i| i.prev_txid[..] == tx.txid[..] && i.out_index == out_index as i32)
        .map(|p| p as i32)
        .unwrap_or(-1);
    Some((
        hex_txid(&spender.txid),
        spent_index,
        spender.block_height,
    ))
}

/// Extract the payment hash of the two standard script templates.
fn script_addresses(script: &[u8]) -> Option<(Hash160, AddressType, &'static str)> {
    // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    if script.len() == 25
        && script[0] == 0x76
        && script[1] == 0xA9
        && script[2] == 20
        && script[23] == 0x88
        && script[24] == 0xAC
    {
        let ripe = Hash160::from_slice(&script[3..23]).unwrap();
        return Some((ripe, AddressType::P2PKH, "pubkeyhash"));
    }
    // OP_HASH160 <20> OP_EQUAL
    if script.len() == 23 && script[0] == 0xA9 && script[1] == 20 && script[22] == 0x87 {
        let ripe = Hash160::from_slice(&script[2..22]).unwrap();
        return Some((ripe, AddressType::P2SH, "scripthash"));
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{blockchain, header, indexer};
    use crate::message::Message;
    use crate::search::{Service, Transport};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    struct Capture {
        sent: Arc<Mutex<Vec<Message>>>,
    }

    impl Transport for Capture {
        fn send(&self, message: &Message) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn wait_for_sent(sent: &Arc<Mutex<Vec<Message>>>, count: usize) -> Vec<Message> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let sent = sent.lock().unwrap();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            assert!(Instant::now() < deadline, "peer never saw {} messages", count);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn reply_headers(request: &Message, mut reply: Message) -> Message {
        reply.set_header_int(
            header::SEARCH_REQUEST_ID,
            request.header_int(header::SEARCH_REQUEST_ID),
        );
        reply.set_header_int(
            header::JOB_REQUEST_ID,
            request.header_int(header::JOB_REQUEST_ID),
        );
        reply
    }

    /// Drives a whole address/utxo search against a scripted peer: the
    /// address resolves to one coinbase output which is still unspent.
    #[test]
    fn test_address_utxo_search_flow() {
        let engine = Arc::new(SearchEngine::new());
        let sent = Arc::new(Mutex::new(Vec::new()));
        let peer = engine.add_peer(
            Box::new(Capture {
                sent: Arc::clone(&sent),
            }),
            [
                Service::TheHub,
                Service::IndexerTxIdDb,
                Service::IndexerAddressDb,
                Service::IndexerSpentDb,
            ]
            .iter()
            .copied()
            .collect(),
        );

        let worker_engine = Arc::clone(&engine);
        let ripe = Hash160([0x21; 20]);
        let worker = std::thread::spawn(move || {
            address_utxos(&worker_engine, (ripe, AddressType::P2PKH))
        });

        // the address lookup goes out first
        let messages = wait_for_sent(&sent, 1);
        assert_eq!(messages[0].message_id, indexer::FIND_ADDRESS);
        let mut builder = MessageBuilder::new();
        builder.add_int(tag::BLOCK_HEIGHT, 2);
        builder.add_int(tag::OFFSET_IN_BLOCK, 81);
        builder.add_int(indexer::OUT_INDEX, 0);
        builder.add_bool(tag::SEPARATOR, true);
        let reply = reply_headers(
            &messages[0],
            builder.message(service::INDEXER, indexer::FIND_ADDRESS_REPLY),
        );
        engine.handle_message(peer, reply);

        // that usage fans out into a utxo lookup and a txid fetch
        let messages = wait_for_sent(&sent, 3);
        for message in &messages[1..] {
            match message.message_id {
                live::GET_UNSPENT_OUTPUT => {
                    let mut builder = MessageBuilder::new();
                    builder.add_bool(live::UNSPENT_STATE, true);
                    builder.add_int(live::AMOUNT, 5_000_000_000);
                    let reply = reply_headers(
                        message,
                        builder.message(service::LIVE_TRANSACTIONS, live::GET_UNSPENT_OUTPUT_REPLY),
                    );
                    engine.handle_message(peer, reply);
                }
                blockchain::GET_TRANSACTION => {
                    let mut builder = MessageBuilder::new();
                    builder.add_bytes(tag::TX_ID, &[0x44; 32]);
                    let reply = reply_headers(
                        message,
                        builder.message(service::BLOCKCHAIN, blockchain::GET_TRANSACTION_REPLY),
                    );
                    engine.handle_message(peer, reply);
                }
                other => panic!("unexpected message id {}", other),
            }
        }

        let outcome = worker.join().unwrap().unwrap();
        let utxos = outcome["utxos"].as_array().unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0]["vout"], 0);
        assert_eq!(utxos[0]["satoshis"], 5_000_000_000i64);
        assert_eq!(utxos[0]["height"], 2);
        assert_eq!(utxos[0]["amount"].to_string(), "50.00000000");
        assert_eq!(
            outcome["cashAddress"],
            Value::String(to_cash_address(&ripe, AddressType::P2PKH))
        );
    }

    #[test]
    fn test_script_addresses() {
        let mut p2pkh = vec![0x76, 0xA9, 20];
        p2pkh.extend_from_slice(&[7u8; 20]);
        p2pkh.extend_from_slice(&[0x88, 0xAC]);
        let (ripe, kind, name) = script_addresses(&p2pkh).unwrap();
        assert_eq!(ripe, Hash160([7u8; 20]));
        assert_eq!(kind, AddressType::P2PKH);
        assert_eq!(name, "pubkeyhash");

        let mut p2sh = vec![0xA9, 20];
        p2sh.extend_from_slice(&[9u8; 20]);
        p2sh.push(0x87);
        let (ripe, kind, name) = script_addresses(&p2sh).unwrap();
        assert_eq!(ripe, Hash160([9u8; 20]));
        assert_eq!(kind, AddressType::P2SH);
        assert_eq!(name, "scripthash");

        assert!(script_addresses(&[0x6A, 0x01, 0x00]).is_none());
    }

    #[test]
    fn test_render_transaction_minimal() {
        // a one-input one-output transaction rendered without any parents
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.push(1); // one input
        raw.extend_from_slice(&[0x22; 32]);
        raw.extend_from_slice(&0u32.to_le_bytes());
        raw.push(0); // empty script sig
        raw.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        raw.push(1); // one output
        raw.extend_from_slice(&5_000_000_000u64.to_le_bytes());
        let mut p2pkh = vec![0x76, 0xA9, 20];
        p2pkh.extend_from_slice(&[7u8; 20]);
        p2pkh.extend_from_slice(&[0x88, 0xAC]);
        raw.push(p2pkh.len() as u8);
        raw.extend_from_slice(&p2pkh);
        raw.extend_from_slice(&0u32.to_le_bytes());

        let mut ctx = SearchCtx::new();
        let mut tx = Transaction::default();
        tx.block_height = 112;
        tx.offset_in_block = 120;
        tx.full_tx_data = ConstBuffer::from_vec(raw);
        tx.txid = ConstBuffer::from_vec(vec![0x33; 32]);
        ctx.answer.push(tx);

        let value = render_transaction(&ctx, 0);
        assert_eq!(value["blockheight"], 112);
        assert_eq!(value["vin"].as_array().unwrap().len(), 1);
        assert_eq!(value["vout"].as_array().unwrap().len(), 1);
        assert_eq!(value["vout"][0]["value"].to_string(), "50.00000000");
        assert_eq!(
            value["vout"][0]["scriptPubKey"]["type"],
            Value::String("pubkeyhash".into())
        );
        assert_eq!(value["version"], 1);
    }
}
