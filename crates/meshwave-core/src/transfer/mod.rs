//! Transfer table: allocation, lookup, and the shared per-transfer state
//! that the sender worker and the peer receive loop both touch.
//!
//! Grounded on `examples/original_source/src/transfer.c`'s `transfers[]` /
//! `recv_ctxs[]` parallel arrays, folded per the design ledger's
//! "pointer-aliased chunk bitmap" note into one owned `TransferHandle` per
//! transfer (bitmap and receive-file context live as long as the transfer,
//! not in a separately indexed array).

pub mod bitmap;
pub mod receiver;
pub mod sender;

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use self::bitmap::ChunkBitmap;

pub const MAX_TRANSFERS: usize = 16;
pub const XFER_TIMEOUT_S: u64 = 2;
pub const XFER_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferState {
    Idle,
    Active,
    Paused,
    Done,
    Error,
}

/// A snapshot of a transfer's public fields, for `get_all`/display use.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub id: u32,
    pub state: XferState,
    pub filename: String,
    pub peer: String,
    pub total_chunks: u32,
    pub done_chunks: u32,
}

struct RecvFile {
    file: File,
    path: PathBuf,
    received_bytes: u64,
}

/// Shared state for one transfer. The sender worker is the sole writer for
/// an outbound transfer; the peer receive loop is the sole writer for an
/// inbound one. Other readers (pause/resume calls, `get_all`) go through the
/// same mutex rather than touching fields directly.
pub struct TransferHandle {
    pub id: u32,
    pub filename: String,
    pub peer: String,
    pub total_chunks: u32,
    state: Mutex<XferState>,
    resume_cv: Condvar,
    done_chunks: AtomicU32,
    bitmap: Mutex<ChunkBitmap>,
    recv_file: Mutex<Option<RecvFile>>,
}

impl TransferHandle {
    pub fn state(&self) -> XferState {
        *self.state.lock()
    }

    pub fn done_chunks(&self) -> u32 {
        self.done_chunks.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> TransferInfo {
        TransferInfo {
            id: self.id,
            state: self.state(),
            filename: self.filename.clone(),
            peer: self.peer.clone(),
            total_chunks: self.total_chunks,
            done_chunks: self.done_chunks(),
        }
    }

    /// Pause: legal only ACTIVE -> PAUSED.
    pub fn pause(&self) -> Result<(), XferState> {
        let mut s = self.state.lock();
        if *s != XferState::Active {
            return Err(*s);
        }
        *s = XferState::Paused;
        self.resume_cv.notify_all();
        Ok(())
    }

    /// Resume: legal only PAUSED -> ACTIVE. Wakes any sender worker blocked
    /// in `wait_while_paused` (the condition-variable replacement for the
    /// original's 200ms poll).
    pub fn resume(&self) -> Result<(), XferState> {
        let mut s = self.state.lock();
        if *s != XferState::Paused {
            return Err(*s);
        }
        *s = XferState::Active;
        self.resume_cv.notify_all();
        Ok(())
    }

    /// Block the calling (sender) thread while PAUSED. Returns promptly if
    /// the transfer has moved to ERROR while paused so the sender can exit.
    fn wait_while_paused(&self) {
        let mut s = self.state.lock();
        while *s == XferState::Paused {
            self.resume_cv.wait(&mut s);
        }
    }

    fn set_state(&self, new: XferState) {
        *self.state.lock() = new;
    }

    fn mark_chunk_done(&self, seq: u32) -> bool {
        let newly = self.bitmap.lock().set(seq);
        if newly {
            self.done_chunks.fetch_add(1, Ordering::SeqCst);
        }
        newly
    }

    fn chunk_already_done(&self, seq: u32) -> bool {
        self.bitmap.lock().get(seq)
    }

    /// Create (or truncate) the receive-side output file and, if
    /// `file_size > 0`, pre-allocate it by seeking to the last byte and
    /// writing once, exactly as `transfer_recv_meta` does in the original.
    fn open_recv_file(&self, path: PathBuf, file_size: u64) -> std::io::Result<()> {
        let mut file = File::create(&path)?;
        if file_size > 0 {
            file.seek(SeekFrom::Start(file_size - 1))?;
            file.write_all(&[0u8])?;
            file.seek(SeekFrom::Start(0))?;
        }
        *self.recv_file.lock() = Some(RecvFile { file, path, received_bytes: 0 });
        Ok(())
    }

    /// Write one chunk's bytes at its deterministic offset and flush.
    /// Idempotent: writing the same `seq` twice is harmless because the
    /// offset is a pure function of `seq`; the bitmap (not this write)
    /// decides whether `done_chunks` advances.
    fn write_recv_chunk(&self, seq: u32, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self.recv_file.lock();
        let rf = guard
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no receive file open"))?;
        rf.file.seek(SeekFrom::Start(seq as u64 * crate::wire::CHUNK_SIZE as u64))?;
        rf.file.write_all(data)?;
        rf.file.flush()?;
        rf.received_bytes += data.len() as u64;
        Ok(())
    }

    /// Close the output file once the transfer is complete; returns the
    /// path it was written to.
    fn close_recv_file(&self) -> Option<PathBuf> {
        self.recv_file.lock().take().map(|rf| rf.path)
    }
}

/// Fixed-capacity table of in-flight transfers, matching `MAX_TRANSFERS`.
pub struct TransferTable {
    entries: Mutex<Vec<Arc<TransferHandle>>>,
    id_counter: AtomicU32,
}

impl TransferTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(MAX_TRANSFERS)),
            id_counter: AtomicU32::new(1),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.id_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate a transfer for an outbound send, with a freshly assigned id.
    /// `total_chunks` is already known by the time this is called: the
    /// sender opens the file and computes it before registering the
    /// transfer, so the handle never needs a mutable `total_chunks`.
    pub fn alloc_outbound(&self, filename: String, peer: String, total_chunks: u32) -> Option<Arc<TransferHandle>> {
        let id = self.next_id();
        self.insert(TransferHandle {
            id,
            filename,
            peer,
            total_chunks,
            state: Mutex::new(XferState::Idle),
            resume_cv: Condvar::new(),
            done_chunks: AtomicU32::new(0),
            bitmap: Mutex::new(ChunkBitmap::new(total_chunks)),
            recv_file: Mutex::new(None),
        })
    }

    /// Allocate a transfer for an inbound receive, adopting the sender's id
    /// verbatim so both sides agree on `xfer_id`.
    pub fn alloc_inbound(
        &self,
        xfer_id: u32,
        sender: String,
        filename: String,
        total_chunks: u32,
    ) -> Option<Arc<TransferHandle>> {
        self.insert(TransferHandle {
            id: xfer_id,
            filename,
            peer: sender,
            total_chunks,
            state: Mutex::new(XferState::Active),
            resume_cv: Condvar::new(),
            done_chunks: AtomicU32::new(0),
            bitmap: Mutex::new(ChunkBitmap::new(total_chunks)),
            recv_file: Mutex::new(None),
        })
    }

    fn insert(&self, handle: TransferHandle) -> Option<Arc<TransferHandle>> {
        let mut entries = self.entries.lock();
        if entries.len() >= MAX_TRANSFERS {
            return None;
        }
        let arc = Arc::new(handle);
        entries.push(arc.clone());
        Some(arc)
    }

    pub fn find(&self, id: u32) -> Option<Arc<TransferHandle>> {
        self.entries.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn get_all(&self) -> Vec<TransferInfo> {
        self.entries.lock().iter().map(|t| t.snapshot()).collect()
    }
}

impl Default for TransferTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_adopts_sender_chosen_id() {
        let table = TransferTable::new();
        let t = table.alloc_inbound(42, "alice".into(), "photo.jpg".into(), 4).unwrap();
        assert_eq!(t.id, 42);
        assert_eq!(table.find(42).unwrap().id, 42);
    }

    #[test]
    fn table_rejects_beyond_capacity() {
        let table = TransferTable::new();
        for _ in 0..MAX_TRANSFERS {
            assert!(table.alloc_outbound("f".into(), "p".into(), 1).is_some());
        }
        assert!(table.alloc_outbound("f".into(), "p".into(), 1).is_none());
    }

    #[test]
    fn pause_resume_state_machine() {
        let table = TransferTable::new();
        let t = table.alloc_inbound(1, "a".into(), "f".into(), 4).unwrap();
        assert_eq!(t.pause(), Ok(()));
        assert_eq!(t.state(), XferState::Paused);
        assert_eq!(t.resume(), Ok(()));
        assert_eq!(t.state(), XferState::Active);
        // Resume while already active is illegal.
        assert_eq!(t.resume(), Err(XferState::Active));
    }
}
