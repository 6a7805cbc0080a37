use chainindex::rest::RestService;
use chainindex::SearchEngine;
use env_logger::Env;
use log::info;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use structopt::StructOpt;

/// HTTP/JSON front end translating REST calls into searches against a Hub
/// and an indexer.
#[derive(StructOpt, Debug, Clone)]
struct Config {
    /// Address to serve HTTP on
    #[structopt(long, default_value = "127.0.0.1:3200")]
    bind: SocketAddr,

    /// Hub to query, host:port
    #[structopt(long, default_value = "127.0.0.1:1235")]
    hub: SocketAddr,

    /// Indexer to query, host:port
    #[structopt(long, default_value = "127.0.0.1:1234")]
    indexer: SocketAddr,

    /// Path prefix of all endpoints
    #[structopt(long, default_value = "/v2/")]
    prefix: String,

    /// Number of request worker threads
    #[structopt(long, default_value = "4")]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("start");

    let config = Config::from_args();
    let engine = Arc::new(SearchEngine::new());
    engine.add_hub(config.hub)?;
    engine.add_indexer(config.indexer)?;

    let _service = RestService::start(config.bind, &config.prefix, engine, config.workers)?;

    // the tiny_http workers carry the service from here on
    loop {
        std::thread::park();
    }
}
