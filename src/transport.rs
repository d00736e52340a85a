//! Identity-routed TCP endpoint
//!
//! One listening socket multiplexes many peers. Peers speak a small
//! multipart framing:
//!
//! ```text
//! frame := [1-byte flags] [4-byte length BE] [payload]
//! ```
//!
//! Flags bit 0 (`MORE`) marks that another frame belongs to the same
//! unit; a unit ends at the first frame with `MORE` clear and is
//! delivered atomically. A request unit is `[identity][empty
//! delimiter][payload]`; peers self-identify, and the endpoint learns
//! `identity -> connection` routing from inbound traffic. A reply unit
//! is `[identity][payload]`.
//!
//! Threading: an accept thread plus one reader thread per connection
//! feed a single channel; `recv_timeout` is the sole inbound path and
//! belongs to the dispatcher's receive loop. `send` may be called from
//! any worker; the single send-path mutex keeps the frames of one
//! reply from interleaving with another's. Replies are fire-and-forget:
//! an unknown identity or a dead peer is logged and dropped, never
//! surfaced to the caller.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

/// Frames larger than this are a protocol violation and kill the
/// offending connection.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const FLAG_MORE: u8 = 0x01;

/// One atomically-delivered multipart message from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundUnit {
    pub parts: Vec<Vec<u8>>,
}

type PeerTable = Arc<Mutex<HashMap<Vec<u8>, (u64, TcpStream)>>>;

pub struct Endpoint {
    inbound_rx: Receiver<InboundUnit>,
    /// Kept so `recv_timeout` can always distinguish "quiet" from
    /// "disconnected": the channel never closes while the endpoint
    /// lives.
    _inbound_tx: Sender<InboundUnit>,
    peers: PeerTable,
    send_lock: Mutex<()>,
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
}

impl Endpoint {
    /// Bind the listening socket and start the accept thread.
    pub fn bind(addr: &str) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = unbounded();
        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let endpoint = Arc::new(Self {
            inbound_rx: rx,
            _inbound_tx: tx.clone(),
            peers: Arc::clone(&peers),
            send_lock: Mutex::new(()),
            local_addr,
            closed: Arc::clone(&closed),
        });

        thread::Builder::new()
            .name("endpoint-accept".to_string())
            .spawn(move || accept_loop(listener, tx, peers, closed))
            .expect("spawn accept thread");

        info!(%local_addr, "endpoint listening");
        Ok(endpoint)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait up to `timeout` for the next inbound unit. `None` means
    /// the timeout elapsed with no traffic.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<InboundUnit> {
        self.inbound_rx.recv_timeout(timeout).ok()
    }

    /// Route a reply unit `[identity][payload]` to the peer that owns
    /// `identity`. Fire-and-forget: an unknown identity or a failed
    /// write is logged and the reply dropped.
    pub fn send(&self, identity: &[u8], payload: &[u8]) {
        let stream = {
            let peers = self.peers.lock().unwrap();
            match peers.get(identity) {
                Some((_, stream)) => match stream.try_clone() {
                    Ok(clone) => clone,
                    Err(e) => {
                        warn!(error = %e, "could not clone peer stream for reply");
                        return;
                    }
                },
                None => {
                    debug!(
                        identity = %String::from_utf8_lossy(identity),
                        "reply for unknown peer dropped"
                    );
                    return;
                }
            }
        };

        // Both frames of the reply go out under one lock so two
        // workers' replies never interleave on the wire.
        let _guard = self.send_lock.lock().unwrap();
        let mut writer = &stream;
        let result = write_frame(&mut writer, true, identity)
            .and_then(|_| write_frame(&mut writer, false, payload))
            .and_then(|_| writer.flush());

        if let Err(e) = result {
            debug!(
                identity = %String::from_utf8_lossy(identity),
                error = %e,
                "reply write failed, dropping peer route"
            );
            self.peers.lock().unwrap().remove(identity);
        }
    }

    /// Stop accepting new connections. Existing reader threads exit as
    /// their peers disconnect.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Poke the accept loop out of its blocking accept.
        let _ = TcpStream::connect(self.local_addr);
    }
}

fn accept_loop(
    listener: TcpListener,
    tx: Sender<InboundUnit>,
    peers: PeerTable,
    closed: Arc<AtomicBool>,
) {
    static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

    for stream in listener.incoming() {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                let peers = Arc::clone(&peers);
                let closed = Arc::clone(&closed);
                thread::Builder::new()
                    .name(format!("endpoint-reader-{}", conn_id))
                    .spawn(move || reader_loop(stream, conn_id, tx, peers, closed))
                    .expect("spawn reader thread");
            }
            Err(e) => {
                warn!(error = %e, "accept error");
            }
        }
    }
    debug!("accept loop exited");
}

fn reader_loop(
    mut stream: TcpStream,
    conn_id: u64,
    tx: Sender<InboundUnit>,
    peers: PeerTable,
    closed: Arc<AtomicBool>,
) {
    debug!(conn_id, "peer connected");
    let mut registered: Option<Vec<u8>> = None;

    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let unit = match read_unit(&mut stream) {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                debug!(conn_id, "peer disconnected");
                break;
            }
            Err(e) => {
                warn!(conn_id, error = %e, "peer read error");
                break;
            }
        };

        // The first part names the peer; learn (or refresh) the route.
        if let Some(identity) = unit.parts.first() {
            if registered.as_deref() != Some(identity.as_slice()) {
                match stream.try_clone() {
                    Ok(writer) => {
                        peers
                            .lock()
                            .unwrap()
                            .insert(identity.clone(), (conn_id, writer));
                        registered = Some(identity.clone());
                    }
                    Err(e) => warn!(conn_id, error = %e, "could not register peer route"),
                }
            }
        }

        if tx.send(unit).is_err() {
            break;
        }
    }

    // Drop the route only if it still points at this connection (a
    // reconnecting peer may have re-registered the identity already).
    if let Some(identity) = registered {
        let mut peers = peers.lock().unwrap();
        if peers.get(&identity).map(|(id, _)| *id) == Some(conn_id) {
            peers.remove(&identity);
        }
    }
}

/// Read one multipart unit. `Ok(None)` is a clean EOF at a unit
/// boundary.
fn read_unit(stream: &mut TcpStream) -> std::io::Result<Option<InboundUnit>> {
    let mut parts = Vec::new();
    loop {
        match read_frame(stream)? {
            Some((more, bytes)) => {
                parts.push(bytes);
                if !more {
                    return Ok(Some(InboundUnit { parts }));
                }
            }
            None if parts.is_empty() => return Ok(None),
            // EOF in the middle of a unit is a broken peer.
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-unit",
                ))
            }
        }
    }
}

fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Option<(bool, Vec<u8>)>> {
    let mut flags = [0u8; 1];
    match reader.read_exact(&mut flags) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(Some((flags[0] & FLAG_MORE != 0, buf)))
}

fn write_frame<W: Write>(writer: &mut W, more: bool, bytes: &[u8]) -> std::io::Result<()> {
    let flags = if more { FLAG_MORE } else { 0 };
    writer.write_all(&[flags])?;
    writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

// ============================================================================
// Client side
// ============================================================================

/// Client counterpart of the endpoint, used by the example client and
/// the integration tests.
pub struct ClientConn {
    stream: TcpStream,
    identity: Vec<u8>,
}

impl ClientConn {
    pub fn connect(addr: &str, identity: &[u8]) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self {
            stream,
            identity: identity.to_vec(),
        })
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    /// Send a request unit `[identity][empty delimiter][payload]`.
    pub fn send(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let identity = self.identity.clone();
        self.send_parts(&[identity.as_slice(), &[], payload])
    }

    /// Send a raw multipart unit (tests use this to produce malformed
    /// traffic).
    pub fn send_parts(&mut self, parts: &[&[u8]]) -> std::io::Result<()> {
        for (index, part) in parts.iter().enumerate() {
            let more = index + 1 < parts.len();
            write_frame(&mut self.stream, more, part)?;
        }
        self.stream.flush()
    }

    /// Receive one reply unit `(identity, payload)`. `Ok(None)` means
    /// the server closed the connection.
    pub fn recv(&mut self) -> std::io::Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut parts = Vec::new();
        loop {
            match read_frame(&mut self.stream)? {
                Some((more, bytes)) => {
                    parts.push(bytes);
                    if !more {
                        break;
                    }
                }
                None if parts.is_empty() => return Ok(None),
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed mid-unit",
                    ))
                }
            }
        }

        let payload = parts.pop().unwrap_or_default();
        let identity = parts.pop().unwrap_or_default();
        Ok(Some((identity, payload)))
    }

    /// Bound subsequent `recv` calls; a timeout surfaces as an
    /// `io::Error` of kind `WouldBlock`/`TimedOut`.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
}
