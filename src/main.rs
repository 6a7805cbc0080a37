use chainindex::{Indexer, IndexerConfig};
use env_logger::Env;
use log::info;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use structopt::StructOpt;

/// The indexer service: follows a Hub, maintains the transaction, address
/// and spent-output indexes and answers lookups over the binary RPC.
#[derive(StructOpt, Debug, Clone)]
struct Config {
    /// Directory the index databases live in
    #[structopt(short, long)]
    basedir: PathBuf,

    /// Hub to follow, host:port
    #[structopt(long, default_value = "127.0.0.1:1235")]
    hub: SocketAddr,

    /// Address to serve indexer lookups on
    #[structopt(long, default_value = "127.0.0.1:1234")]
    bind: SocketAddr,

    /// Disable the transaction-id index
    #[structopt(long)]
    no_txdb: bool,

    /// Enable the address index
    #[structopt(long)]
    addressdb: bool,

    /// Enable the spent-output index
    #[structopt(long)]
    spentdb: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("start");

    let config = Config::from_args();
    let indexer_config = IndexerConfig {
        basedir: config.basedir.clone(),
        enable_txdb: !config.no_txdb,
        enable_addressdb: config.addressdb,
        enable_spentdb: config.spentdb,
    };
    if !indexer_config.enable_txdb
        && !indexer_config.enable_addressdb
        && !indexer_config.enable_spentdb
    {
        return Err("all indexes are disabled, nothing to do".into());
    }

    let mut indexer = Indexer::new(&indexer_config)?;
    indexer.bind(config.bind)?;
    indexer.try_connect_hub(config.hub)?;

    // the worker threads do everything from here on
    loop {
        std::thread::park();
    }
}
