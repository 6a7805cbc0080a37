use crate::address_codec::{self, AddressError};
use crate::hash::{Hash160, Hash256};
use crate::search::{SearchEngine, ServiceUnavailable};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

mod searches;

/// How long one HTTP request may wait for its search to complete.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a search, handed from the engine's dispatch thread back to
/// the HTTP worker that owns the socket.
pub(crate) type Outcome = Result<Value, RestError>;

#[derive(Debug)]
pub(crate) enum RestError {
    /// Bad hex, wrong length, unknown path. Client error, not logged
    /// above debug level.
    UserInput(String),
    NotFound(String),
    Unavailable(ServiceUnavailable),
    Timeout,
}

impl From<AddressError> for RestError {
    fn from(_: AddressError) -> RestError {
        RestError::UserInput("address does not parse".into())
    }
}

/// The HTTP/JSON façade: routes `/v2/` endpoints onto searches run by the
/// engine.
pub struct RestService {
    threads: Vec<JoinHandle<()>>,
    server: Arc<tiny_http::Server>,
}

impl RestService {
    pub fn start(
        addr: SocketAddr,
        prefix: &str,
        engine: Arc<SearchEngine>,
        workers: usize,
    ) -> std::io::Result<RestService> {
        let server = Arc::new(
            tiny_http::Server::http(addr)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, e))?,
        );
        info!("REST service listening on {}", addr);
        let prefix: Arc<str> = prefix.into();
        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers {
            let server = Arc::clone(&server);
            let engine = Arc::clone(&engine);
            let prefix = Arc::clone(&prefix);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("rest-worker-{}", i))
                    .spawn(move || {
                        while let Ok(request) = server.recv() {
                            handle_request(&engine, &prefix, request);
                        }
                    })?,
            );
        }
        Ok(RestService { threads, server })
    }

    pub fn shutdown(mut self) {
        self.server.unblock();
        for join in self.threads.drain(..) {
            let _ = join.join();
        }
    }
}

fn handle_request(engine: &SearchEngine, prefix: &str, mut request: tiny_http::Request) {
    let url = request.url().to_string();
    let method = request.method().clone();
    debug!("{} {}", method, url);

    let mut body = String::new();
    if request.as_reader().read_to_string(&mut body).is_err() {
        respond_error(request, 400, "could not read request body");
        return;
    }

    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (url.as_str(), None),
    };
    let route = match path.strip_prefix(prefix) {
        Some(r) => r.trim_end_matches('/'),
        None => {
            respond_error(request, 404, "no such endpoint");
            return;
        }
    };

    let is_post = method == tiny_http::Method::Post;
    let outcome = dispatch(engine, route, query, is_post, &body);
    match outcome {
        Ok(value) => respond_json(request, 200, &value),
        Err(RestError::UserInput(text)) => respond_error(request, 400, &text),
        Err(RestError::NotFound(text)) => respond_error(request, 404, &text),
        Err(RestError::Unavailable(e)) => {
            if !e.temporarily {
                warn!("REST request hit unconfigured service: {}", e);
            }
            respond_error(request, 503, &e.to_string())
        }
        Err(RestError::Timeout) => respond_error(request, 504, "upstream did not answer in time"),
    }
}

fn dispatch(
    engine: &SearchEngine,
    route: &str,
    query: Option<&str>,
    is_post: bool,
    body: &str,
) -> Outcome {
    match (route, is_post) {
        (r, false) if r.starts_with("transaction/details/") => {
            let txid = parse_txid(r.rsplit('/').next().unwrap())?;
            searches::transaction_details(engine, txid)
        }
        ("transaction/details", true) => {
            let txids = string_list(body, "txs")?;
            let mut out = Vec::with_capacity(txids.len());
            for txid in txids {
                out.push(searches::transaction_details(engine, parse_txid(&txid)?)?);
            }
            Ok(Value::Array(out))
        }
        (r, false) if r.starts_with("address/details/") => {
            let address = parse_addr(r.rsplit('/').next().unwrap())?;
            searches::address_details(engine, address)
        }
        ("address/details", true) => {
            let addresses = string_list(body, "addresses")?;
            let mut out = Vec::with_capacity(addresses.len());
            for addr in addresses {
                out.push(searches::address_details(engine, parse_addr(&addr)?)?);
            }
            Ok(Value::Array(out))
        }
        (r, false) if r.starts_with("address/utxo/") => {
            let address = parse_addr(r.rsplit('/').next().unwrap())?;
            searches::address_utxos(engine, address)
        }
        ("address/utxo", true) => {
            let addresses = string_list(body, "addresses")?;
            let mut out = Vec::with_capacity(addresses.len());
            for addr in addresses {
                out.push(searches::address_utxos(engine, parse_addr(&addr)?)?);
            }
            Ok(Value::Array(out))
        }
        (r, false) if r.starts_with("rawtransactions/getRawTransaction/") => {
            let txid = parse_txid(r.rsplit('/').next().unwrap())?;
            let verbose = query.map_or(false, |q| q.contains("verbose=true"));
            searches::raw_transaction(engine, txid, verbose)
        }
        (r, false) if r.starts_with("rawtransactions/sendRawTransaction/") => {
            let raw = parse_raw_tx(r.rsplit('/').next().unwrap())?;
            searches::send_raw_transaction(engine, raw)
        }
        ("rawtransactions/sendRawTransaction", true) => {
            let hexes = string_list(body, "hexes")?;
            let mut out = Vec::with_capacity(hexes.len());
            for hex_tx in hexes {
                out.push(searches::send_raw_transaction(engine, parse_raw_tx(&hex_tx)?)?);
            }
            Ok(Value::Array(out))
        }
        _ => Err(RestError::NotFound("no such endpoint".into())),
    }
}

fn parse_txid(input: &str) -> Result<Hash256, RestError> {
    input
        .parse()
        .map_err(|_| RestError::UserInput(format!("not a transaction id: {}", input)))
}

fn parse_addr(input: &str) -> Result<(Hash160, address_codec::AddressType), RestError> {
    Ok(address_codec::parse_address(input)?)
}

fn parse_raw_tx(input: &str) -> Result<Vec<u8>, RestError> {
    let bytes =
        hex::decode(input).map_err(|_| RestError::UserInput("transaction is not hex".into()))?;
    if bytes.len() < 60 {
        return Err(RestError::UserInput("transaction too small".into()));
    }
    Ok(bytes)
}

fn string_list(body: &str, key: &str) -> Result<Vec<String>, RestError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|_| RestError::UserInput("request body is not JSON".into()))?;
    let list = value
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| RestError::UserInput(format!("missing \"{}\" array", key)))?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| RestError::UserInput(format!("\"{}\" must hold strings", key)))
        })
        .collect()
}

fn respond_json(request: tiny_http::Request, status: u32, value: &Value) {
    let data = value.to_string();
    let response = tiny_http::Response::from_string(data)
        .with_status_code(status as u16)
        .with_header(
            tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
        );
    let _ = request.respond(response);
}

fn respond_error(request: tiny_http::Request, status: u32, text: &str) {
    respond_json(request, status, &json!({ "error": text }));
}

/// Wait for the outcome a reactor promises to deliver, cleaning the search
/// up afterwards.
pub(crate) fn wait_for_outcome(
    engine: &SearchEngine,
    started: Result<i32, ServiceUnavailable>,
    receiver: std::sync::mpsc::Receiver<Outcome>,
) -> Outcome {
    let request_id = match started {
        Ok(id) => id,
        Err(e) => return Err(RestError::Unavailable(e)),
    };
    let outcome = match receiver.recv_timeout(REQUEST_TIMEOUT) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => Err(RestError::Timeout),
        Err(RecvTimeoutError::Disconnected) => Err(RestError::Timeout),
    };
    engine.finish_search(request_id);
    outcome
}

/// BCH amount with its eight decimal places intact.
pub(crate) fn bch_value(satoshis: i64) -> Value {
    let sign = if satoshis < 0 { "-" } else { "" };
    let abs = satoshis.unsigned_abs();
    let text = format!("{}{}.{:08}", sign, abs / 100_000_000, abs % 100_000_000);
    serde_json::Number::from_string_unchecked(text).into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bch_value_has_eight_decimals() {
        assert_eq!(bch_value(5_000_000_000).to_string(), "50.00000000");
        assert_eq!(bch_value(1).to_string(), "0.00000001");
        assert_eq!(bch_value(0).to_string(), "0.00000000");
        assert_eq!(bch_value(123_456_789).to_string(), "1.23456789");
    }

    #[test]
    fn test_string_list() {
        let list = string_list(r#"{"txs": ["a", "b"]}"#, "txs").unwrap();
        assert_eq!(list, vec!["a".to_string(), "b".to_string()]);
        assert!(string_list(r#"{"txs": "a"}"#, "txs").is_err());
        assert!(string_list("not json", "txs").is_err());
    }

    #[test]
    fn test_parse_txid_rejects_bad_hex() {
        assert!(parse_txid("zz").is_err());
        assert!(
            parse_txid("000000006c02c8ea6e4ff69651f7fcde348fb9d557a06e6957b65552002a7820").is_ok()
        );
    }
}
