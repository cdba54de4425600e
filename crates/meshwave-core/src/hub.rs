//! The hub (server) endpoint: a single accept/multiplex worker, a fixed
//! peer table, and message-type routing between connected peers.
//!
//! Grounded on `examples/original_source/src/server.c`'s `server_loop`
//! (`select()` over the listen fd and every peer fd) and `handle_packet`'s
//! routing switch. The original's blocking `recv()` inside a ready `select`
//! branch assumes a peer never sends a partial frame across two `select`
//! wakeups; this rewrite instead buffers per-connection bytes and decodes
//! complete frames off the front with `wire::Frame::try_decode`, so a
//! non-blocking `mio` socket that returns a short read never desyncs the
//! stream (see `wire.rs`'s doc comment on `try_decode`).

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::discovery::Announcer;
use crate::error::HubStartError;
use crate::wire::{
    decode_file_chunk, decode_file_meta, encode_file_meta, join_nul, split_nul, Frame, MsgType,
    HEADER_LEN, MAX_NAME,
};

pub const DATA_PORT: u16 = 5557;
pub const MAX_PEERS: usize = 32;
const LISTENER_TOKEN: Token = Token(0);
const LISTEN_BACKLOG: i32 = 8;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_RETRY_BUDGET: Duration = Duration::from_millis(500);

/// A snapshot of one connected peer, for `get_peers`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub name: String,
    pub addr: String,
    pub port: u16,
}

struct PeerConn {
    token: Token,
    stream: TcpStream,
    name: String,
    addr: String,
    port: u16,
    inbuf: Vec<u8>,
}

/// Fixed-capacity peer table. Removal swaps with the tail, exactly as
/// `server.c`'s `peer_remove`; callers must not rely on iteration order.
struct PeerTable {
    entries: Vec<PeerConn>,
}

impl PeerTable {
    fn new() -> Self {
        Self { entries: Vec::with_capacity(MAX_PEERS) }
    }

    fn find_by_token(&mut self, token: Token) -> Option<&mut PeerConn> {
        self.entries.iter_mut().find(|p| p.token == token)
    }

    fn index_by_token(&self, token: Token) -> Option<usize> {
        self.entries.iter().position(|p| p.token == token)
    }

    fn find_by_name(&mut self, name: &str) -> Option<&mut PeerConn> {
        self.entries.iter_mut().find(|p| p.name == name)
    }

    fn name_of(&self, token: Token) -> String {
        self.entries
            .iter()
            .find(|p| p.token == token)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn remove(&mut self, idx: usize) -> PeerConn {
        info!(peer = %self.entries[idx].name, "hub: peer disconnected");
        self.entries.swap_remove(idx)
    }

    fn snapshot(&self) -> Vec<PeerInfo> {
        self.entries
            .iter()
            .map(|p| PeerInfo { name: p.name.clone(), addr: p.addr.clone(), port: p.port })
            .collect()
    }
}

/// `(xfer_id, sender_name, recipient_name)` established on `FILE_META`,
/// per the §9 redesign note: subsequent frames for a known transfer are
/// unicast to whichever named peer did not send them, instead of broadcast.
#[derive(Default)]
struct XferRoutes {
    by_id: HashMap<u32, (String, String)>,
}

impl XferRoutes {
    fn record(&mut self, xfer_id: u32, sender: String, recipient: String) {
        self.by_id.insert(xfer_id, (sender, recipient));
    }

    /// The other participant in transfer `xfer_id`, relative to `from`.
    fn target_for(&self, xfer_id: u32, from: &str) -> Option<String> {
        let (a, b) = self.by_id.get(&xfer_id)?;
        if a == from {
            Some(b.clone())
        } else if b == from {
            Some(a.clone())
        } else {
            None
        }
    }

    /// `FILE_ACK`/`FILE_NACK` carry no `xfer_id` (empty payload, `seq` is the
    /// chunk index) so they cannot be looked up by id. If `from` participates
    /// in exactly one route, route the reply to its other side; with zero or
    /// more than one candidate route the caller falls back to broadcast.
    fn target_for_peer(&self, from: &str) -> Option<String> {
        let mut found = None;
        for (a, b) in self.by_id.values() {
            let other = if a == from {
                Some(b)
            } else if b == from {
                Some(a)
            } else {
                None
            };
            if let Some(other) = other {
                if found.is_some() {
                    return None;
                }
                found = Some(other.clone());
            }
        }
        found
    }

    fn drop_peer(&mut self, name: &str) {
        self.by_id.retain(|_, (a, b)| a != name && b != name);
    }
}

/// The hub (server) endpoint. `start`/`stop` run the accept/multiplex worker
/// on its own thread; `get_peers`/`is_running` may be called concurrently.
pub struct Hub {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    peers: Arc<Mutex<PeerTable>>,
    announcer: Mutex<Option<Announcer>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            peers: Arc::new(Mutex::new(PeerTable::new())),
            announcer: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn get_peers(&self, max: usize) -> Vec<PeerInfo> {
        let mut all = self.peers.lock().snapshot();
        all.truncate(max);
        all
    }

    /// Bind `0.0.0.0:data_port`, start the discovery announcer on
    /// `disc_port`, and spawn the accept/multiplex worker.
    pub fn start(self: &Arc<Self>, name: &str, data_port: u16, disc_port: u16) -> Result<(), HubStartError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(HubStartError::AlreadyRunning);
        }

        let addr: SocketAddr = format!("0.0.0.0:{data_port}").parse().unwrap();

        // Built via socket2 for SO_REUSEADDR and an explicit listen backlog,
        // matching the teacher's `haven-server` listener setup.
        let mut listener = bind_listener(addr, LISTEN_BACKLOG).map_err(|source| {
            self.running.store(false, Ordering::SeqCst);
            HubStartError::Bind { addr: addr.to_string(), source }
        })?;

        let poll = Poll::new().map_err(|source| {
            self.running.store(false, Ordering::SeqCst);
            HubStartError::Bind { addr: addr.to_string(), source }
        })?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|source| {
                self.running.store(false, Ordering::SeqCst);
                HubStartError::Bind { addr: addr.to_string(), source }
            })?;

        match Announcer::start(name.to_string(), data_port, disc_port) {
            Ok(a) => *self.announcer.lock() = Some(a),
            Err(e) => warn!(error = %e, "hub: discovery announce failed to start"),
        }

        info!(%addr, name, backlog = LISTEN_BACKLOG, "hub: listening");

        let running = self.running.clone();
        let peers = self.peers.clone();
        let handle = thread::spawn(move || accept_loop(listener, poll, running, peers));
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
        }
        self.announcer.lock().take();
        info!("hub: stopped");
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the listening socket via socket2 so `SO_REUSEADDR` and the listen
/// backlog are actually applied, matching `discovery.rs`'s announce/scan
/// sockets and the teacher's `haven-server` listener setup. `mio` requires a
/// non-blocking socket, set before the hand-off to `TcpListener::from_std`.
fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn accept_loop(mut listener: TcpListener, mut poll: Poll, running: Arc<AtomicBool>, peers: Arc<Mutex<PeerTable>>) {
    let mut events = Events::with_capacity(MAX_PEERS + 1);
    let mut routes = XferRoutes::default();
    let next_token = AtomicUsize::new(1);

    while running.load(Ordering::Relaxed) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %e, "hub: poll error");
            break;
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept_new_peers(&mut listener, &poll, &peers, &next_token);
                continue;
            }

            let token = event.token();
            let mut table = peers.lock();
            let Some(idx) = table.index_by_token(token) else { continue };

            let mut scratch = [0u8; 65536];
            let mut closed = false;
            loop {
                let conn = &mut table.entries[idx];
                match conn.stream.read(&mut scratch) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => {
                        conn.inbuf.extend_from_slice(&scratch[..n]);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }

            drop(table);
            process_inbuf(&peers, &mut routes, token);

            if closed {
                remove_peer(&peers, &poll, &mut routes, token);
            }
        }
    }
}

fn accept_new_peers(
    listener: &mut TcpListener,
    poll: &Poll,
    peers: &Arc<Mutex<PeerTable>>,
    next_token: &AtomicUsize,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, addr)) => {
                let mut table = peers.lock();
                if table.entries.len() >= MAX_PEERS {
                    warn!(%addr, "hub: peer table full, rejecting connection");
                    drop(stream);
                    continue;
                }
                let token = Token(next_token.fetch_add(1, Ordering::SeqCst));
                if let Err(e) = poll.registry().register(&mut stream, token, Interest::READABLE) {
                    warn!(%addr, error = %e, "hub: failed to register new peer");
                    continue;
                }
                let name = format!("peer_{}", token.0);
                info!(%addr, %name, "hub: peer connected");
                table.entries.push(PeerConn {
                    token,
                    stream,
                    name,
                    addr: addr.ip().to_string(),
                    port: addr.port(),
                    inbuf: Vec::new(),
                });
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "hub: accept error");
                break;
            }
        }
    }
}

/// Decode and dispatch every complete frame sitting at the front of a peer's
/// inbound buffer. An unrecognised message type is logged and the frame's
/// bytes are skipped (the length field is positionally decodable regardless
/// of whether the type byte is known), matching §7's "protocol violations:
/// discard that frame, continue the session" policy.
fn process_inbuf(peers: &Arc<Mutex<PeerTable>>, routes: &mut XferRoutes, token: Token) {
    loop {
        let step = {
            let table = peers.lock();
            let Some(conn) = table.entries.iter().find(|p| p.token == token) else { return };
            peek_frame(&conn.inbuf)
        };

        match step {
            DecodeStep::NeedMore => return,
            DecodeStep::Skip(n) => {
                warn!(?token, "hub: unknown message type, discarding frame");
                let mut table = peers.lock();
                if let Some(conn) = table.find_by_token(token) {
                    conn.inbuf.drain(..n);
                }
            }
            DecodeStep::Frame(frame, consumed) => {
                {
                    let mut table = peers.lock();
                    if let Some(conn) = table.find_by_token(token) {
                        conn.inbuf.drain(..consumed);
                    }
                }
                route_frame(peers, routes, token, frame);
            }
        }
    }
}

enum DecodeStep {
    NeedMore,
    Skip(usize),
    Frame(Frame, usize),
}

fn peek_frame(buf: &[u8]) -> DecodeStep {
    if buf.len() < HEADER_LEN {
        return DecodeStep::NeedMore;
    }
    let payload_len = u16::from_be_bytes([buf[5], buf[6]]) as usize;
    let total = HEADER_LEN + payload_len;
    if buf.len() < total {
        return DecodeStep::NeedMore;
    }
    match Frame::try_decode(buf, u16::MAX as usize) {
        Ok(Some((frame, consumed))) => DecodeStep::Frame(frame, consumed),
        Ok(None) => DecodeStep::NeedMore,
        Err(_) => DecodeStep::Skip(total),
    }
}

fn route_frame(peers: &Arc<Mutex<PeerTable>>, routes: &mut XferRoutes, from: Token, frame: Frame) {
    match frame.msg_type {
        MsgType::Hello => handle_hello(peers, from, &frame.payload),
        MsgType::Chat => handle_chat(peers, from, frame.seq, &frame.payload),
        MsgType::FileMeta => handle_file_meta(peers, routes, from, frame.seq, &frame.payload),
        MsgType::FileChunk => handle_routable(peers, routes, from, frame, xfer_id_of_chunk),
        MsgType::Pause | MsgType::Resume => {
            let xfer_id = frame.seq;
            handle_routable(peers, routes, from, frame, move |_| Some(xfer_id))
        }
        MsgType::FileAck | MsgType::FileNack => handle_ack_nack(peers, routes, from, frame),
        MsgType::Bye => {
            let mut table = peers.lock();
            if let Some(idx) = table.index_by_token(from) {
                let conn = table.remove(idx);
                drop(table);
                routes.drop_peer(&conn.name);
            }
        }
    }
}

fn xfer_id_of_chunk(payload: &[u8]) -> Option<u32> {
    decode_file_chunk(payload).ok().map(|(id, _)| id)
}

fn handle_hello(peers: &Arc<Mutex<PeerTable>>, from: Token, payload: &[u8]) {
    let name = String::from_utf8_lossy(payload);
    let name: String = name.chars().take(MAX_NAME - 1).collect();
    let mut table = peers.lock();
    if let Some(conn) = table.find_by_token(from) {
        info!(token = ?from, name, "hub: peer identified");
        conn.name = name;
    }
}

fn handle_chat(peers: &Arc<Mutex<PeerTable>>, from: Token, seq: u32, payload: &[u8]) {
    let Ok((to, text)) = split_nul(payload) else { return };
    let to = String::from_utf8_lossy(to).into_owned();

    let mut table = peers.lock();
    let sender_name = table.name_of(from);
    let routed = join_nul(sender_name.as_bytes(), text);
    let frame = Frame::new(MsgType::Chat, seq, routed);

    debug!(from = %sender_name, to, bytes = text.len(), "hub: routing chat");
    if let Some(target) = table.find_by_name(&to).map(|p| p.token) {
        unicast(&mut table, target, &frame);
    } else {
        broadcast_except(&mut table, from, &frame);
    }
}

/// `FILE_META`'s leading field holds the sender-chosen recipient name; this
/// rewrites it to the actual sender's name before forwarding (mirroring
/// `CHAT`'s `recipient -> sender` rewrite) so the receiving peer's
/// `transfer::receiver::recv_meta` gets a real `sender` argument, and records
/// the `(xfer_id, sender, recipient)` route for subsequent frames.
fn handle_file_meta(peers: &Arc<Mutex<PeerTable>>, routes: &mut XferRoutes, from: Token, xfer_id: u32, payload: &[u8]) {
    let Ok(meta) = decode_file_meta(payload) else { return };
    let recipient = meta.recipient.clone();

    let mut table = peers.lock();
    let sender_name = table.name_of(from);
    routes.record(xfer_id, sender_name.clone(), recipient.clone());

    let routed_payload = encode_file_meta(&sender_name, &meta.basename, meta.total_chunks, meta.file_size);
    let frame = Frame::new(MsgType::FileMeta, xfer_id, routed_payload);

    info!(from = %sender_name, to = %recipient, xfer_id, file = %meta.basename, "hub: routing file meta");
    if let Some(target) = table.find_by_name(&recipient).map(|p| p.token) {
        unicast(&mut table, target, &frame);
    } else {
        broadcast_except(&mut table, from, &frame);
    }
}

/// Shared routing for frame kinds whose transfer id can be recovered (chunk
/// payload prefix, or `seq` for PAUSE/RESUME): unicast to the route's other
/// participant when known, else fall back to broadcast-except-sender.
fn handle_routable(
    peers: &Arc<Mutex<PeerTable>>,
    routes: &XferRoutes,
    from: Token,
    frame: Frame,
    xfer_id_of: impl Fn(&[u8]) -> Option<u32>,
) {
    let mut table = peers.lock();
    let sender_name = table.name_of(from);
    let target = xfer_id_of(&frame.payload).and_then(|id| routes.target_for(id, &sender_name));

    match target.and_then(|name| table.find_by_name(&name).map(|p| p.token)) {
        Some(token) => unicast(&mut table, token, &frame),
        None => broadcast_except(&mut table, from, &frame),
    }
}

/// `FILE_ACK`/`FILE_NACK` carry no `xfer_id`; route by peer-participation
/// heuristic (see `XferRoutes::target_for_peer`), falling back to broadcast.
fn handle_ack_nack(peers: &Arc<Mutex<PeerTable>>, routes: &XferRoutes, from: Token, frame: Frame) {
    let mut table = peers.lock();
    let sender_name = table.name_of(from);
    let target = routes.target_for_peer(&sender_name);

    match target.and_then(|name| table.find_by_name(&name).map(|p| p.token)) {
        Some(token) => unicast(&mut table, token, &frame),
        None => broadcast_except(&mut table, from, &frame),
    }
}

fn unicast(table: &mut PeerTable, target: Token, frame: &Frame) {
    if let Some(conn) = table.find_by_token(target) {
        write_frame(conn, frame);
    }
}

/// Snapshot-before-iterate: collect target tokens first so a slow peer's
/// write doesn't hold the peer-table lock across every other send.
fn broadcast_except(table: &mut PeerTable, exclude: Token, frame: &Frame) {
    let targets: Vec<Token> = table.entries.iter().filter(|p| p.token != exclude).map(|p| p.token).collect();
    for token in targets {
        if let Some(conn) = table.find_by_token(token) {
            write_frame(conn, frame);
        }
    }
}

/// Best-effort blocking-style write over a non-blocking socket: retry on
/// `WouldBlock` for up to `WRITE_RETRY_BUDGET` before giving up silently.
/// A peer that can't keep up loses this message; it does not stall routing
/// for every other peer (§5's shared-resource policy only guards the table,
/// not one peer's socket buffer).
fn write_frame(conn: &mut PeerConn, frame: &Frame) {
    let buf = frame.encode();
    let mut written = 0usize;
    let deadline = Instant::now() + WRITE_RETRY_BUDGET;
    while written < buf.len() {
        match conn.stream.write(&buf[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    warn!(peer = %conn.name, "hub: write timed out, dropping frame");
                    break;
                }
                thread::yield_now();
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(peer = %conn.name, error = %e, "hub: write failed");
                break;
            }
        }
    }
}

fn remove_peer(peers: &Arc<Mutex<PeerTable>>, poll: &Poll, routes: &mut XferRoutes, token: Token) {
    let mut table = peers.lock();
    if let Some(idx) = table.index_by_token(token) {
        let mut conn = table.remove(idx);
        let _ = poll.registry().deregister(&mut conn.stream);
        routes.drop_peer(&conn.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xfer_routes_resolve_other_participant() {
        let mut routes = XferRoutes::default();
        routes.record(7, "alice".into(), "bob".into());
        assert_eq!(routes.target_for(7, "alice"), Some("bob".to_string()));
        assert_eq!(routes.target_for(7, "bob"), Some("alice".to_string()));
        assert_eq!(routes.target_for(99, "alice"), None);
    }

    #[test]
    fn ack_nack_peer_heuristic_is_unambiguous_with_one_route() {
        let mut routes = XferRoutes::default();
        routes.record(1, "alice".into(), "bob".into());
        assert_eq!(routes.target_for_peer("bob"), Some("alice".to_string()));
        assert_eq!(routes.target_for_peer("alice"), Some("bob".to_string()));
    }

    #[test]
    fn ack_nack_peer_heuristic_bails_out_with_two_routes() {
        let mut routes = XferRoutes::default();
        routes.record(1, "alice".into(), "bob".into());
        routes.record(2, "alice".into(), "carol".into());
        assert_eq!(routes.target_for_peer("alice"), None);
    }

    #[test]
    fn drop_peer_removes_its_routes() {
        let mut routes = XferRoutes::default();
        routes.record(1, "alice".into(), "bob".into());
        routes.drop_peer("bob");
        assert_eq!(routes.target_for(1, "alice"), None);
    }
}
