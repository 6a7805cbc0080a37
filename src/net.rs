use crate::message::Message;
use log::{debug, info, warn};
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// An outgoing connection with its own reader thread.
///
/// Incoming messages are handed to the callback on that thread, which is
/// the "network thread" every dispatch in this codebase runs on. Sends are
/// serialized over a shared writer and may happen from any thread.
pub struct Connection {
    writer: Arc<Mutex<TcpStream>>,
    peer: SocketAddr,
    join: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Connection {
    pub fn connect(
        addr: SocketAddr,
        on_message: impl Fn(Message) + Send + 'static,
        on_disconnect: impl Fn() + Send + 'static,
    ) -> io::Result<Connection> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let writer = Arc::new(Mutex::new(stream.try_clone()?));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_reader = Arc::clone(&stop);
        let join = std::thread::spawn(move || {
            let mut reader = BufReader::new(stream);
            loop {
                match Message::read_frame(&mut reader) {
                    Ok(Some(message)) => on_message(message),
                    Ok(None) => break,
                    Err(e) => {
                        if !stop_reader.load(Ordering::Relaxed) {
                            warn!("connection to {} broke: {}", peer, e);
                        }
                        break;
                    }
                }
            }
            debug!("reader for {} ending", peer);
            on_disconnect();
        });
        info!("connected to {}", peer);
        Ok(Connection {
            writer,
            peer,
            join: Some(join),
            stop,
        })
    }

    pub fn send(&self, message: &Message) -> io::Result<()> {
        let mut stream = self.writer.lock().unwrap();
        let mut out = BufWriter::new(&mut *stream);
        message.write_frame(&mut out)?;
        out.flush()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn close(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self
            .writer
            .lock()
            .unwrap()
            .shutdown(std::net::Shutdown::Both);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// The server side handle for one accepted peer.
pub struct Remote {
    writer: Mutex<TcpStream>,
    peer: SocketAddr,
}

impl Remote {
    pub fn send(&self, message: &Message) -> io::Result<()> {
        let mut stream = self.writer.lock().unwrap();
        let mut out = BufWriter::new(&mut *stream);
        message.write_frame(&mut out)?;
        out.flush()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn disconnect(&self) {
        let _ = self
            .writer
            .lock()
            .unwrap()
            .shutdown(std::net::Shutdown::Both);
    }
}

/// Accept loop plus one reader thread per accepted connection.
/// Handler invoked for every message a connected client sends. The remote
/// is shared so slow answers can be produced on a worker thread.
pub type ServerHandler = Arc<dyn Fn(&Arc<Remote>, Message) + Send + Sync>;

pub struct Server {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Server {
    pub fn bind(addr: SocketAddr, handler: ServerHandler) -> io::Result<Server> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_accept = Arc::clone(&stop);
        let join = std::thread::spawn(move || {
            info!("listening on {}", local_addr);
            loop {
                if stop_accept.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("client connected from {}", peer);
                        let handler = Arc::clone(&handler);
                        if let Err(e) = serve_client(stream, peer, handler) {
                            warn!("failed to start client thread: {}", e);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(Server {
            stop,
            join: Some(join),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn serve_client(stream: TcpStream, peer: SocketAddr, handler: ServerHandler) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_nonblocking(false)?;
    let reader = stream.try_clone()?;
    let remote = Arc::new(Remote {
        writer: Mutex::new(stream),
        peer,
    });
    std::thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        loop {
            match Message::read_frame(&mut reader) {
                Ok(Some(message)) => handler(&remote, message),
                Ok(None) => break,
                Err(e) => {
                    debug!("client {} went away: {}", peer, e);
                    break;
                }
            }
        }
    });
    Ok(())
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{service, tag};
    use crate::message::MessageBuilder;
    use std::sync::mpsc::channel;

    #[test]
    fn test_client_server_roundtrip() {
        let handler: ServerHandler = Arc::new(|remote: &Arc<Remote>, message: Message| {
                // echo with the message id bumped
                let mut reply = Message::with_body(
                    message.service_id,
                    message.message_id + 1,
                    message.body().clone(),
                );
                reply.set_header_int(crate::api::header::REQUEST_ID, 7);
                remote.send(&reply).unwrap();
            });
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), handler).unwrap();

        let (send, recv) = channel();
        let connection = Connection::connect(
            server.local_addr(),
            move |message| {
                send.send(message).unwrap();
            },
            || {},
        )
        .unwrap();

        let mut builder = MessageBuilder::new();
        builder.add_int(tag::BLOCK_HEIGHT, 42);
        let request = builder.message(service::BLOCKCHAIN, 2);
        connection.send(&request).unwrap();

        let reply = recv.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reply.service_id, service::BLOCKCHAIN);
        assert_eq!(reply.message_id, 3);
        assert_eq!(reply.header_int(crate::api::header::REQUEST_ID), 7);
    }
}
