//! Protocol numbering for the typed binary RPC.
//!
//! Every service id, message id and tag used on the wire lives here so both
//! the serving side (the indexer) and the requesting side (the search
//! engine) agree by construction.

/// Header tags. The header is a CMF stream closed by [header::END].
pub mod header {
    pub const END: u32 = 0;
    pub const SERVICE_ID: u32 = 1;
    pub const MESSAGE_ID: u32 = 2;
    pub const PING: u32 = 3;
    pub const REQUEST_ID: u32 = 11;
    pub const SEARCH_REQUEST_ID: u32 = 12;
    pub const JOB_REQUEST_ID: u32 = 13;
}

/// Service ids.
pub mod service {
    pub const API: u32 = 0;
    pub const BLOCKCHAIN: u32 = 1;
    pub const LIVE_TRANSACTIONS: u32 = 2;
    pub const BLOCK_NOTIFICATION: u32 = 3;
    pub const INDEXER: u32 = 4;
}

/// Tags shared by several services; the reply parsers use these as the
/// lowest common denominator.
pub mod tag {
    pub const SEPARATOR: u32 = 0;
    pub const GENERIC_BYTE_DATA: u32 = 1;
    pub const TX_ID: u32 = 4;
    pub const BLOCK_HEIGHT: u32 = 7;
    pub const OFFSET_IN_BLOCK: u32 = 8;
}

pub mod meta {
    pub const VERSION: u32 = 0;
    pub const VERSION_REPLY: u32 = 1;
    pub const COMMAND_FAILED: u32 = 2;

    pub const FAILED_COMMAND_SERVICE_ID: u32 = 20;
    pub const FAILED_COMMAND_ID: u32 = 21;
    pub const FAILED_REASON: u32 = 22;
}

pub mod blockchain {
    pub const GET_BLOCK_COUNT: u32 = 0;
    pub const GET_BLOCK_COUNT_REPLY: u32 = 1;
    pub const GET_BLOCK: u32 = 2;
    pub const GET_BLOCK_REPLY: u32 = 3;
    pub const GET_BLOCK_HEADER: u32 = 4;
    pub const GET_BLOCK_HEADER_REPLY: u32 = 5;
    pub const GET_TRANSACTION: u32 = 6;
    pub const GET_TRANSACTION_REPLY: u32 = 7;

    pub const BLOCK_HASH: u32 = 5;
    pub const CONFIRMATIONS: u32 = 9;
    pub const VERSION: u32 = 10;
    pub const MERKLE_ROOT: u32 = 11;
    pub const TIME: u32 = 12;
    pub const MEDIAN_TIME: u32 = 13;
    pub const NONCE: u32 = 14;
    pub const BITS: u32 = 15;
    pub const DIFFICULTY: u32 = 16;

    pub const TX_OFFSET_IN_BLOCK: u32 = 8;
    pub const TX_IN_TXID: u32 = 20;
    pub const TX_IN_OUTINDEX: u32 = 21;
    pub const TX_INPUT_SCRIPT: u32 = 22;
    pub const TX_OUT_INDEX: u32 = 23;
    pub const TX_OUT_AMOUNT: u32 = 24;
    pub const TX_OUTPUT_SCRIPT: u32 = 25;
    pub const TX_OUT_ADDRESS: u32 = 26;

    pub const INCLUDE_TX_ID: u32 = 43;
    pub const INCLUDE_OFFSET_IN_BLOCK: u32 = 44;
    pub const INCLUDE_INPUTS: u32 = 45;
    pub const INCLUDE_OUTPUTS: u32 = 46;
    pub const INCLUDE_OUTPUT_AMOUNTS: u32 = 47;
    pub const INCLUDE_OUTPUT_SCRIPTS: u32 = 48;
    pub const INCLUDE_OUTPUT_ADDRESSES: u32 = 49;
    pub const FULL_TRANSACTION_DATA: u32 = 50;
}

pub mod live {
    pub const IS_UNSPENT: u32 = 0;
    pub const IS_UNSPENT_REPLY: u32 = 1;
    pub const GET_UNSPENT_OUTPUT: u32 = 2;
    pub const GET_UNSPENT_OUTPUT_REPLY: u32 = 3;
    pub const SEND_TRANSACTION: u32 = 4;
    pub const SEND_TRANSACTION_REPLY: u32 = 5;
    pub const SEARCH_MEMPOOL: u32 = 6;
    pub const SEARCH_MEMPOOL_REPLY: u32 = 7;
    pub const GET_MEMPOOL_INFO: u32 = 8;
    pub const GET_MEMPOOL_INFO_REPLY: u32 = 9;

    // numbered past the blockchain transaction tags; replies from this
    // service run through the same transaction parser
    pub const UNSPENT_STATE: u32 = 30;
    pub const OUT_INDEX: u32 = 31;
    pub const AMOUNT: u32 = 32;
    pub const OUTPUT_SCRIPT: u32 = 33;
    pub const TRANSACTION: u32 = 34;
    pub const FIRST_SEEN_TIME: u32 = 35;
    pub const MATCHING_OUT_INDEX: u32 = 36;
    pub const BITCOIN_SCRIPT_HASHED: u32 = 37;
    pub const MEMPOOL_SIZE: u32 = 38;
    pub const MEMPOOL_BYTES: u32 = 39;
    pub const MEMPOOL_USAGE: u32 = 40;
}

pub mod block_notification {
    pub const SUBSCRIBE: u32 = 0;
    pub const NEW_BLOCK_ON_CHAIN: u32 = 2;

    pub const BLOCK_HASH: u32 = 5;
    pub const BLOCK_HEIGHT: u32 = 7;
}

pub mod indexer {
    pub const GET_AVAILABLE_INDEXERS: u32 = 0;
    pub const GET_AVAILABLE_INDEXERS_REPLY: u32 = 1;
    pub const FIND_TRANSACTION: u32 = 2;
    pub const FIND_TRANSACTION_REPLY: u32 = 3;
    pub const FIND_ADDRESS: u32 = 4;
    pub const FIND_ADDRESS_REPLY: u32 = 5;
    pub const FIND_SPENT_OUTPUT: u32 = 6;
    pub const FIND_SPENT_OUTPUT_REPLY: u32 = 7;
    pub const VERSION: u32 = 8;
    pub const VERSION_REPLY: u32 = 9;

    pub const TXID_INDEXER: u32 = 21;
    pub const ADDRESS_INDEXER: u32 = 22;
    pub const SPENT_OUTPUT_INDEXER: u32 = 23;
    pub const BITCOIN_ADDRESS: u32 = 24;
    pub const OUT_INDEX: u32 = 25;
}
