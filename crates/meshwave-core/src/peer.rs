//! The peer (client) endpoint: outbound TCP session to a hub, HELLO
//! handshake, a single demultiplexing receive loop, and the outbound
//! command surface (`send_chat`, `send_file`, `pause_transfer`,
//! `resume_transfer`).
//!
//! Grounded on `examples/original_source/src/client.c`. The original's
//! `recv_loop` only demultiplexes `MSG_CHAT`; file-transfer replies are read
//! directly by `wait_for_ack` on the same fd from a different thread, a
//! genuine concurrent-read race. This rewrite's receive loop is the socket's
//! sole reader and dispatches every message type, including forwarding
//! ACK/NACK/PAUSE to whichever sender thread is currently waiting, per
//! `transfer::sender::Transport`.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ConnectError, PauseError, ResumeError, SendChatError, SendFileError};
use crate::events::{ChatEvent, EventQueue};
use crate::logging::{NullLogger, TransferLogger};
use crate::transfer::sender::{run_send, SendReply, Transport};
use crate::transfer::{receiver, TransferInfo, TransferTable, XferState};
use crate::wire::{decode_file_chunk, decode_file_meta, join_nul, split_nul, Frame, MsgType, MAX_MSG};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct Connection {
    write_stream: Mutex<TcpStream>,
    shutdown_stream: TcpStream,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

/// The peer (client) endpoint. One instance owns one outbound TCP session.
pub struct Peer {
    username: Mutex<String>,
    save_dir: PathBuf,
    events: Arc<EventQueue>,
    transfers: Arc<TransferTable>,
    logger: Arc<dyn TransferLogger>,
    connected: AtomicBool,
    conn: Mutex<Option<Arc<Connection>>>,
    /// Serializes outbound transfers on this connection to one at a time, so
    /// ACK/NACK replies (which carry no xfer_id) are unambiguous.
    send_gate: Mutex<()>,
    /// The channel the receive loop forwards ACK/NACK/PAUSE replies to,
    /// registered only while a sender thread is actively waiting.
    ack_waiter: Mutex<Option<Sender<SendReply>>>,
}

impl Peer {
    pub fn new(save_dir: PathBuf) -> Arc<Self> {
        Self::with_logger(save_dir, Arc::new(NullLogger))
    }

    pub fn with_logger(save_dir: PathBuf, logger: Arc<dyn TransferLogger>) -> Arc<Self> {
        Arc::new(Self {
            username: Mutex::new(String::new()),
            save_dir,
            events: Arc::new(EventQueue::default()),
            transfers: Arc::new(TransferTable::new()),
            logger,
            connected: AtomicBool::new(false),
            conn: Mutex::new(None),
            send_gate: Mutex::new(()),
            ack_waiter: Mutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn username(&self) -> String {
        self.username.lock().clone()
    }

    pub fn poll_event(&self) -> Option<ChatEvent> {
        self.events.poll()
    }

    pub fn transfers(&self) -> Vec<TransferInfo> {
        self.transfers.get_all()
    }

    pub fn connect(self: &Arc<Self>, addr: SocketAddr, username: &str) -> Result<(), ConnectError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(ConnectError::AlreadyConnected);
        }

        let stream = TcpStream::connect(addr).map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            ConnectError::Connect(e)
        })?;
        let write_clone = stream.try_clone().map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            ConnectError::Connect(e)
        })?;
        let shutdown_clone = stream.try_clone().map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            ConnectError::Connect(e)
        })?;

        let hello = Frame::new(MsgType::Hello, 0, username.as_bytes().to_vec());
        {
            let mut w = write_clone.try_clone().map_err(ConnectError::Hello)?;
            hello.write_to(&mut w).map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                ConnectError::Hello(e)
            })?;
        }

        *self.username.lock() = username.to_string();

        let connection = Arc::new(Connection {
            write_stream: Mutex::new(write_clone),
            shutdown_stream: shutdown_clone,
            recv_thread: Mutex::new(None),
        });

        let recv_peer = self.clone();
        let recv_stream = stream;
        let handle = thread::spawn(move || recv_peer.receive_loop(recv_stream));
        connection.recv_thread.lock().replace(handle);

        *self.conn.lock() = Some(connection);
        info!(addr = %addr, username, "peer: connected");
        Ok(())
    }

    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            let bye = Frame::new(MsgType::Bye, 0, Vec::new());
            let _ = bye.write_to(&mut *conn.write_stream.lock());
            let _ = conn.shutdown_stream.shutdown(std::net::Shutdown::Both);
            if let Some(h) = conn.recv_thread.lock().take() {
                let _ = h.join();
            }
        }
        info!("peer: disconnected");
    }

    pub fn send_chat(&self, to: &str, text: &str) -> Result<(), SendChatError> {
        let conn = self.active_connection().ok_or(SendChatError::NotConnected)?;
        if to.is_empty() {
            return Err(SendChatError::EmptyRecipient);
        }
        let payload = join_nul(to.as_bytes(), text.as_bytes());
        if payload.len() > MAX_MSG {
            return Err(SendChatError::TooLarge { len: payload.len(), max: MAX_MSG });
        }
        let frame = Frame::new(MsgType::Chat, 0, payload);
        frame
            .write_to(&mut *conn.write_stream.lock())
            .map_err(SendChatError::Io)
    }

    /// Begin sending `path` to `to`, returning the new transfer id
    /// immediately; the transfer itself runs on a detached worker thread.
    pub fn send_file(self: &Arc<Self>, path: &str, to: &str) -> Result<u32, SendFileError> {
        if !self.is_connected() {
            return Err(SendFileError::NotConnected);
        }
        let metadata = std::fs::metadata(path).map_err(|source| SendFileError::Open {
            path: path.to_string(),
            source,
        })?;
        let total_chunks = metadata.len().div_ceil(crate::wire::CHUNK_SIZE as u64) as u32;

        let handle = self
            .transfers
            .alloc_outbound(path.to_string(), to.to_string(), total_chunks)
            .ok_or(SendFileError::TableFull)?;
        let xfer_id = handle.id;

        let peer = self.clone();
        let path = path.to_string();
        thread::spawn(move || {
            let _gate = peer.send_gate.lock();
            let transport = PeerTransport { peer: &peer };
            run_send(handle, &path, &transport, peer.logger.as_ref());
        });

        Ok(xfer_id)
    }

    pub fn pause_transfer(&self, xfer_id: u32) -> Result<(), PauseError> {
        let handle = self
            .transfers
            .find(xfer_id)
            .ok_or(PauseError::UnknownTransfer(xfer_id))?;
        handle
            .pause()
            .map_err(|state| PauseError::WrongState { id: xfer_id, state })?;
        self.send_control(MsgType::Pause, xfer_id);
        Ok(())
    }

    pub fn resume_transfer(&self, xfer_id: u32) -> Result<(), ResumeError> {
        let handle = self
            .transfers
            .find(xfer_id)
            .ok_or(ResumeError::UnknownTransfer(xfer_id))?;
        handle
            .resume()
            .map_err(|state| ResumeError::WrongState { id: xfer_id, state })?;
        self.send_control(MsgType::Resume, xfer_id);
        Ok(())
    }

    fn send_control(&self, ty: MsgType, xfer_id: u32) {
        if let Some(conn) = self.active_connection() {
            let frame = Frame::new(ty, xfer_id, Vec::new());
            let _ = frame.write_to(&mut *conn.write_stream.lock());
        }
    }

    fn active_connection(&self) -> Option<Arc<Connection>> {
        self.conn.lock().clone()
    }

    /// The single receive loop: sole reader of the socket, demultiplexes
    /// every frame type.
    fn receive_loop(self: Arc<Self>, mut stream: TcpStream) {
        loop {
            let frame = match Frame::read_from(&mut stream, crate::wire::CHUNK_SIZE + 256) {
                Ok(f) => f,
                Err(e) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        warn!(error = %e, "peer: hub disconnected");
                    }
                    break;
                }
            };

            match frame.msg_type {
                MsgType::Chat => self.handle_chat(&frame.payload),
                MsgType::FileMeta => self.handle_file_meta(frame.seq, &frame.payload),
                MsgType::FileChunk => self.handle_file_chunk(frame.seq, &frame.payload),
                MsgType::FileAck => self.forward_reply(SendReply::Ack(frame.seq)),
                MsgType::FileNack => self.forward_reply(SendReply::Nack(frame.seq)),
                MsgType::Pause => self.handle_pause_resume(frame.seq, true),
                MsgType::Resume => self.handle_pause_resume(frame.seq, false),
                MsgType::Hello | MsgType::Bye => {
                    debug!("peer: unexpected message type on receive loop, ignoring");
                }
            }
        }
    }

    fn handle_chat(&self, payload: &[u8]) {
        let Ok((from, text)) = split_nul(payload) else {
            return;
        };
        let from = String::from_utf8_lossy(from).into_owned();
        let text = String::from_utf8_lossy(text).into_owned();
        info!(from = %from, "peer: chat received");
        self.events.push(ChatEvent::Chat { from, text, timestamp_ms: now_ms() });
    }

    /// `seq` carries the sender-chosen `xfer_id`. The hub rewrites META's
    /// leading field from recipient to sender before forwarding (mirroring
    /// CHAT), so `meta.recipient` here is actually the sender's name.
    fn handle_file_meta(&self, xfer_id: u32, payload: &[u8]) {
        let Ok(meta) = decode_file_meta(payload) else {
            return;
        };
        let sender_name = meta.recipient.clone();
        match receiver::recv_meta(
            &self.transfers,
            &self.save_dir,
            xfer_id,
            &sender_name,
            &meta.basename,
            meta.total_chunks,
            meta.file_size,
            self.logger.as_ref(),
        ) {
            Ok(handle) => {
                if let Some(conn) = self.active_connection() {
                    // §4.3: "An ACK MUST be sent in response to a valid META
                    // (empty seq)" — seq 0 here, not the transfer id, so this
                    // frame is never mistaken for a chunk-0 ACK/NACK by the
                    // sender's reply waiter.
                    let frame = Frame::new(MsgType::FileAck, 0, Vec::new());
                    let _ = frame.write_to(&mut *conn.write_stream.lock());
                }
                self.events.push(ChatEvent::FileProgress {
                    xfer_id,
                    done: handle.done_chunks(),
                    total: handle.total_chunks,
                });
                if handle.state() == XferState::Done {
                    self.events.push(ChatEvent::FileComplete {
                        xfer_id,
                        filename: handle.filename.clone(),
                    });
                }
            }
            Err(e) => warn!(error = %e, "peer: failed to accept incoming transfer"),
        }
    }

    fn handle_file_chunk(&self, seq: u32, payload: &[u8]) {
        let Ok((xfer_id, data)) = decode_file_chunk(payload) else {
            return;
        };
        let Some(handle) = self.transfers.find(xfer_id) else {
            return;
        };
        let outcome = receiver::recv_chunk(&handle, seq, data, self.logger.as_ref());
        let reply_type = match outcome {
            receiver::ChunkOutcome::Ack => MsgType::FileAck,
            receiver::ChunkOutcome::Nack => MsgType::FileNack,
        };
        if let Some(conn) = self.active_connection() {
            let frame = Frame::new(reply_type, seq, Vec::new());
            let _ = frame.write_to(&mut *conn.write_stream.lock());
        }

        match outcome {
            receiver::ChunkOutcome::Ack => {
                self.events.push(ChatEvent::FileProgress {
                    xfer_id,
                    done: handle.done_chunks(),
                    total: handle.total_chunks,
                });
                if handle.state() == XferState::Done {
                    self.events.push(ChatEvent::FileComplete {
                        xfer_id,
                        filename: handle.filename.clone(),
                    });
                }
            }
            receiver::ChunkOutcome::Nack => {
                if handle.state() == XferState::Error {
                    self.events.push(ChatEvent::FileError {
                        xfer_id,
                        message: "write error".to_string(),
                    });
                }
            }
        }
    }

    fn handle_pause_resume(&self, xfer_id: u32, is_pause: bool) {
        if let Some(handle) = self.transfers.find(xfer_id) {
            if is_pause {
                let _ = handle.pause();
            } else {
                let _ = handle.resume();
            }
        }
        if is_pause {
            self.forward_reply(SendReply::Pause(xfer_id));
        }
    }

    fn forward_reply(&self, reply: SendReply) {
        if let Some(tx) = self.ack_waiter.lock().clone() {
            let _ = tx.send(reply);
        }
    }
}

/// Adapts one `Peer` connection to the `Transport` trait the sender state
/// machine needs, registering this thread as the current ACK/NACK/PAUSE
/// waiter for the lifetime of the call.
struct PeerTransport<'a> {
    peer: &'a Peer,
}

impl Transport for PeerTransport<'_> {
    fn send_chunk(&self, xfer_id: u32, seq: u32, data: &[u8]) -> io::Result<()> {
        let payload = crate::wire::encode_file_chunk(xfer_id, data);
        let frame = Frame::new(MsgType::FileChunk, seq, payload);
        let conn = self
            .peer
            .active_connection()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "peer not connected"))?;
        frame.write_to(&mut *conn.write_stream.lock())
    }

    /// Registers the reply waiter *before* the frame goes out, so the
    /// receiver's META ACK can never arrive and be dropped (or linger for
    /// chunk 0's own wait) ahead of us listening for it.
    fn send_meta(&self, xfer_id: u32, payload: &[u8], timeout: Duration) -> io::Result<Option<SendReply>> {
        let frame = Frame::new(MsgType::FileMeta, xfer_id, payload.to_vec());
        let conn = self
            .peer
            .active_connection()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "peer not connected"))?;

        let (tx, rx) = bounded(1);
        *self.peer.ack_waiter.lock() = Some(tx);
        let result = frame.write_to(&mut *conn.write_stream.lock());
        if let Err(e) = result {
            *self.peer.ack_waiter.lock() = None;
            return Err(e);
        }
        let reply = rx.recv_timeout(timeout).ok();
        *self.peer.ack_waiter.lock() = None;
        Ok(reply)
    }

    fn wait_reply(&self, timeout: Duration) -> Option<SendReply> {
        let (tx, rx) = bounded(1);
        *self.peer.ack_waiter.lock() = Some(tx);
        let result = rx.recv_timeout(timeout).ok();
        *self.peer.ack_waiter.lock() = None;
        result
    }
}
