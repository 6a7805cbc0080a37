use crate::buffer::ConstBuffer;
use crate::hash::double_sha256;
use std::collections::BTreeMap;
use std::fmt;

mod engine;

pub use engine::{SearchEngine, Transport};

/// The backing services a job can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    TheHub,
    IndexerTxIdDb,
    IndexerAddressDb,
    IndexerSpentDb,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Service::TheHub => "The Hub",
            Service::IndexerTxIdDb => "TxID indexer",
            Service::IndexerAddressDb => "Addresses indexer",
            Service::IndexerSpentDb => "Spent-db indexer",
        };
        write!(f, "{}", name)
    }
}

/// The job could not be routed anywhere.
///
/// `temporarily` is true when that service has been connected at some point
/// in this process, so the outage is presumably transient rather than a
/// setup problem.
#[derive(Debug, Clone)]
pub struct ServiceUnavailable {
    pub service: Service,
    pub temporarily: bool,
}

impl fmt::Display for ServiceUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "could not find upstream service: {}", self.service)
    }
}

impl std::error::Error for ServiceUnavailable {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobType {
    #[default]
    Unset,
    LookupTxById,
    LookupByAddress,
    LookupSpentTx,
    FetchTx,
    FetchBlockHeader,
    FetchBlockOfTx,
    FetchUtxoUnspent,
    FetchUtxoDetails,
    FindTxInMempool,
    FindAddressInMempool,
    CustomHubMessage,
}

/// Flags selecting which parts of a transaction a fetch should include.
pub mod filter {
    pub const OFFSET_IN_BLOCK: u32 = 1;
    pub const INPUTS: u32 = 2;
    pub const TX_ID: u32 = 4;
    pub const FULL_TX_DATA: u32 = 8;
    pub const OUTPUTS: u32 = 0x10;
    pub const OUTPUT_AMOUNTS: u32 = 0x20;
    pub const OUTPUT_SCRIPTS: u32 = 0x40;
    pub const OUTPUT_ADDRESSES: u32 = 0x80;
}

/// One unit of work inside a [Search](SearchCtx).
///
/// Jobs reference each other by index into the job list; `next_job_id`
/// slots receive the `(height, offset)` a lookup resolves.
#[derive(Debug, Clone, Default)]
pub struct Job {
    pub job_type: JobType,
    pub started: bool,
    pub finished: bool,
    pub next_job_id: i32,
    pub next_job_id2: i32,
    pub transaction_filters: u32,
    pub int_data: i32,
    pub int_data2: i32,
    pub int_data3: i32,
    pub data: ConstBuffer,
}

impl Job {
    pub fn new(job_type: JobType) -> Job {
        Job {
            job_type,
            next_job_id: -1,
            next_job_id2: -1,
            transaction_filters: filter::OFFSET_IN_BLOCK,
            ..Job::default()
        }
    }

    pub fn with_data(job_type: JobType, data: ConstBuffer) -> Job {
        Job {
            data,
            ..Job::new(job_type)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Input {
    pub prev_txid: ConstBuffer,
    pub input_script: ConstBuffer,
    pub out_index: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputScriptKind {
    Nothing,
    FullScript,
    OnlyAddress,
}

#[derive(Debug, Clone)]
pub struct Output {
    pub amount: u64,
    pub index: i16,
    pub script_kind: OutputScriptKind,
    pub out_script: ConstBuffer,
}

impl Default for Output {
    fn default() -> Output {
        Output {
            amount: 0,
            index: -1,
            script_kind: OutputScriptKind::Nothing,
            out_script: ConstBuffer::default(),
        }
    }
}

/// A transaction as assembled from reply messages.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub block_height: i32,
    pub offset_in_block: i32,
    /// Mempool transactions have no block position; this is set instead.
    pub first_seen_time: u32,
    /// Index of the job whose reply produced this object.
    pub job_id: i32,
    /// When >= 0, the output index this transaction matched a search on.
    pub out_index: i16,
    pub fees: i64,
    pub full_tx_data: ConstBuffer,
    pub txid: ConstBuffer,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    /// Cross-links into the answer list, keyed by [ref_key_for_input] /
    /// [ref_key_for_output]. Indices rather than pointers; dereference via
    /// the owning [SearchCtx].
    pub tx_refs: BTreeMap<u32, usize>,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.block_height >= 0 && self.offset_in_block > 0 && self.offset_in_block < 90
    }
}

/// Key into [Transaction::tx_refs] for input `i`.
pub fn ref_key_for_input(i: u32) -> u32 {
    debug_assert!(i < 0x100_0000);
    0x100_0000 + i
}

/// Key into [Transaction::tx_refs] for output `i`.
pub fn ref_key_for_output(i: u32) -> u32 {
    debug_assert!(i < 0x100_0000);
    i
}

/// Which side of a transaction a fetched parent links back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxRef {
    Input,
    Output,
}

/// Pack `(answer index, side, input/output index)` into the value stored
/// in [SearchCtx::tx_refs].
pub fn tx_ref_key(orig_tx_index: usize, side: TxRef, index: u32) -> u64 {
    debug_assert!(index < 0x100_0000);
    let mut key = (orig_tx_index as u64) << 32;
    if side == TxRef::Input {
        key += 0x100_0000;
    }
    key + u64::from(index)
}

pub(crate) fn unpack_tx_ref_key(key: u64) -> (usize, u32) {
    ((key >> 32) as usize, (key & 0xFFFF_FFFF) as u32)
}

#[derive(Debug, Clone, Default)]
pub struct BlockHeader {
    pub hash: ConstBuffer,
    pub merkle_root: ConstBuffer,
    pub confirmations: i32,
    pub height: i32,
    pub version: u32,
    pub time: u32,
    pub median_time: u32,
    pub nonce: u32,
    pub bits: u32,
    pub difficulty: f64,
}

/// A CommandFailed the Hub sent for one of our jobs.
#[derive(Debug, Clone, Default)]
pub struct SearchError {
    pub service_id: i32,
    pub message_id: i32,
    pub error: String,
}

/// The mutable state of one running search: the questions and the answers.
#[derive(Default)]
pub struct SearchCtx {
    /// Set by the engine when the search starts.
    pub request_id: i32,
    pub jobs: Vec<Job>,
    pub answer: Vec<Transaction>,
    pub block_headers: BTreeMap<i32, BlockHeader>,
    pub errors: BTreeMap<usize, SearchError>,
    /// jobId of a FetchTx -> packed [tx_ref_key]. When that fetch lands
    /// the engine links the new answer back into the original one.
    pub tx_refs: BTreeMap<usize, u64>,
}

impl SearchCtx {
    pub fn new() -> SearchCtx {
        SearchCtx::default()
    }

    /// Push a job, returning its id.
    pub fn add_job(&mut self, job: Job) -> usize {
        self.jobs.push(job);
        self.jobs.len() - 1
    }

    /// The txid of an answer, computing it from the raw bytes if the reply
    /// did not carry one.
    pub(crate) fn fill_missing_txid(tx: &mut Transaction) {
        if tx.txid.is_empty() && !tx.full_tx_data.is_empty() {
            let hash = double_sha256(&tx.full_tx_data);
            tx.txid = ConstBuffer::from_vec(hash.0.to_vec());
        }
    }
}

/// Result data of a utxo lookup job, echoing the request's position.
#[derive(Debug, Clone)]
pub struct UtxoLookup {
    pub job_id: usize,
    pub block_height: i32,
    pub offset_in_block: i32,
    pub out_index: i32,
    pub unspent: bool,
    /// Set for FetchUtxoDetails on an unspent output, -1 otherwise.
    pub amount: i64,
    pub output_script: ConstBuffer,
}

/// Hooks a search implementation receives while the engine executes its
/// jobs. All callbacks run on the engine's dispatch thread, never
/// concurrently with one another; they may push further jobs through the
/// given context but must not call back into the engine.
#[allow(unused_variables)]
pub trait SearchReactor: Send {
    /// No more jobs can be started. `waiting_jobs` counts jobs that never
    /// got the data they were waiting for.
    fn finished(&mut self, ctx: &mut SearchCtx, waiting_jobs: usize) {}

    /// A transaction landed in `ctx.answer[answer_index]`.
    fn transaction_added(&mut self, ctx: &mut SearchCtx, answer_index: usize) {}

    fn txid_resolved(&mut self, ctx: &mut SearchCtx, job_id: usize, height: i32, offset: i32) {}

    fn spent_output_resolved(
        &mut self,
        ctx: &mut SearchCtx,
        job_id: usize,
        height: i32,
        offset: i32,
    ) {
    }

    fn address_used_in_output(
        &mut self,
        ctx: &mut SearchCtx,
        height: i32,
        offset: i32,
        out_index: i32,
    ) {
    }

    fn utxo_lookup(&mut self, ctx: &mut SearchCtx, lookup: UtxoLookup) {}

    fn aborted(&mut self, ctx: &mut SearchCtx, error: &ServiceUnavailable) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ref_key_packing() {
        let key = tx_ref_key(3, TxRef::Input, 7);
        let (answer, k) = unpack_tx_ref_key(key);
        assert_eq!(answer, 3);
        assert_eq!(k, ref_key_for_input(7));

        let key = tx_ref_key(9, TxRef::Output, 2);
        let (answer, k) = unpack_tx_ref_key(key);
        assert_eq!(answer, 9);
        assert_eq!(k, ref_key_for_output(2));
    }

    #[test]
    fn test_coinbase_rule() {
        let mut tx = Transaction {
            block_height: 5,
            offset_in_block: 81,
            ..Transaction::default()
        };
        assert!(tx.is_coinbase());
        tx.offset_in_block = 90;
        assert!(!tx.is_coinbase());
        tx.offset_in_block = 0;
        assert!(!tx.is_coinbase());
        tx.block_height = -1;
        assert!(!tx.is_coinbase());
    }
}
