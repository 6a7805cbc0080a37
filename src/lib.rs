#![doc = include_str!("../README.md")]
// Coding conventions
#![deny(unsafe_code)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![deny(unused_must_use)]

pub mod address_codec;
pub mod api;
pub mod buffer;
pub mod cmf;
pub mod hash;
pub mod hashstorage;
pub mod indexer;
pub mod message;
pub mod net;
pub mod rest;
pub mod search;
pub mod txiter;
pub mod utxo;

// re-exporting deps
pub use bitcoin;
pub use fxhash;
pub use glob;
pub use log;
pub use structopt;

pub use hash::{Hash160, Hash256};
pub use hashstorage::HashStorage;
pub use indexer::{Indexer, IndexerConfig};
pub use message::Message;
pub use search::{SearchCtx, SearchEngine, SearchReactor};
pub use utxo::UnspentOutputDatabase;
