//! Receive-side transfer logic: META handling and per-chunk writes.
//!
//! Grounded on `transfer_recv_meta`/`transfer_recv_chunk` in
//! `examples/original_source/src/transfer.c`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};

use super::{TransferHandle, TransferTable, XferState};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};

/// Strip any path separators from a sender-supplied basename so a malicious
/// or buggy peer cannot write outside the save directory (§6: "no path
/// segments honoured").
pub fn sanitize_basename(basename: &str) -> String {
    basename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(basename)
        .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum RecvMetaError {
    #[error("transfer table is full")]
    TableFull,
    #[error("cannot create output file {path}: {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Handle an inbound `FILE_META`: allocate the transfer (adopting the
/// sender's id), create the output file under `save_dir`, and return the
/// handle. An ACK for this META is the caller's responsibility (the peer
/// receive loop sends it on `Ok`).
pub fn recv_meta(
    table: &TransferTable,
    save_dir: &Path,
    xfer_id: u32,
    sender: &str,
    basename: &str,
    total_chunks: u32,
    file_size: u64,
    logger: &dyn TransferLogger,
) -> Result<Arc<TransferHandle>, RecvMetaError> {
    let clean_name = sanitize_basename(basename);
    let handle = table
        .alloc_inbound(xfer_id, sender.to_string(), clean_name.clone(), total_chunks)
        .ok_or(RecvMetaError::TableFull)?;

    let path: PathBuf = save_dir.join(&clean_name);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    handle.open_recv_file(path.clone(), file_size).map_err(|source| {
        handle.set_state(XferState::Error);
        RecvMetaError::CreateFile { path: path.display().to_string(), source }
    })?;

    info!(xfer_id, sender, file = %clean_name, total_chunks, file_size, "transfer: receiving");
    logger.log(TransferLog {
        xfer_id,
        event: TransferEvent::Started {
            peer: sender.to_string(),
            filename: clean_name,
            total_chunks,
        },
    });

    // Zero-chunk files (boundary case: empty file) are immediately DONE.
    if total_chunks == 0 {
        handle.set_state(XferState::Done);
        handle.close_recv_file();
        logger.log(TransferLog {
            xfer_id,
            event: TransferEvent::Done { done: 0, total: 0 },
        });
    }

    Ok(handle)
}

/// Outcome of applying one inbound chunk, telling the receive loop whether
/// to reply ACK or NACK.
pub enum ChunkOutcome {
    Ack,
    Nack,
}

/// Handle an inbound `FILE_CHUNK` payload (already stripped of its
/// `xfer_id` prefix). Rejects writes while PAUSED or ERROR, matching
/// `transfer_recv_chunk`'s guard.
pub fn recv_chunk(
    handle: &TransferHandle,
    seq: u32,
    data: &[u8],
    logger: &dyn TransferLogger,
) -> ChunkOutcome {
    match handle.state() {
        XferState::Paused | XferState::Error => return ChunkOutcome::Nack,
        _ => {}
    }

    // Idempotent: a retransmit of an already-applied chunk still writes
    // (harmless, deterministic offset) but must not double-count.
    if let Err(e) = handle.write_recv_chunk(seq, data) {
        error!(xfer_id = handle.id, seq, error = %e, "transfer: write error");
        handle.set_state(XferState::Error);
        logger.log(TransferLog {
            xfer_id: handle.id,
            event: TransferEvent::Error {
                message: e.to_string(),
                done: handle.done_chunks(),
                total: handle.total_chunks,
            },
        });
        return ChunkOutcome::Nack;
    }

    let newly = handle.mark_chunk_done(seq);
    if newly {
        logger.log(TransferLog {
            xfer_id: handle.id,
            event: TransferEvent::Progress {
                done: handle.done_chunks(),
                total: handle.total_chunks,
            },
        });
    }

    if handle.done_chunks() >= handle.total_chunks {
        handle.set_state(XferState::Done);
        handle.close_recv_file();
        info!(xfer_id = handle.id, path = %handle.filename, "transfer: receive complete");
        logger.log(TransferLog {
            xfer_id: handle.id,
            event: TransferEvent::Done {
                done: handle.done_chunks(),
                total: handle.total_chunks,
            },
        });
    }

    ChunkOutcome::Ack
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogger;

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_basename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_basename("a\\b\\c.txt"), "c.txt");
        assert_eq!(sanitize_basename("plain.txt"), "plain.txt");
    }

    #[test]
    fn zero_chunk_file_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let table = TransferTable::new();
        let handle = recv_meta(&table, dir.path(), 1, "alice", "empty.bin", 0, 0, &NullLogger).unwrap();
        assert_eq!(handle.state(), XferState::Done);
    }

    #[test]
    fn chunk_write_and_completion() {
        let dir = tempfile::tempdir().unwrap();
        let table = TransferTable::new();
        let handle = recv_meta(&table, dir.path(), 1, "alice", "f.bin", 2, 20, &NullLogger).unwrap();

        assert!(matches!(recv_chunk(&handle, 0, &[1u8; 10], &NullLogger), ChunkOutcome::Ack));
        assert_eq!(handle.state(), XferState::Active);
        assert!(matches!(recv_chunk(&handle, 1, &[2u8; 10], &NullLogger), ChunkOutcome::Ack));
        assert_eq!(handle.state(), XferState::Done);

        let data = std::fs::read(dir.path().join("f.bin")).unwrap();
        assert_eq!(&data[0..10], &[1u8; 10][..]);
        assert_eq!(&data[10..20], &[2u8; 10][..]);
    }

    #[test]
    fn duplicate_chunk_does_not_double_count() {
        let dir = tempfile::tempdir().unwrap();
        let table = TransferTable::new();
        let handle = recv_meta(&table, dir.path(), 1, "alice", "f.bin", 2, 20, &NullLogger).unwrap();
        recv_chunk(&handle, 0, &[1u8; 10], &NullLogger);
        recv_chunk(&handle, 0, &[1u8; 10], &NullLogger);
        assert_eq!(handle.done_chunks(), 1);
    }

    #[test]
    fn paused_chunk_is_nacked() {
        let dir = tempfile::tempdir().unwrap();
        let table = TransferTable::new();
        let handle = recv_meta(&table, dir.path(), 1, "alice", "f.bin", 2, 20, &NullLogger).unwrap();
        handle.set_state(XferState::Paused);
        assert!(matches!(recv_chunk(&handle, 0, &[1u8; 10], &NullLogger), ChunkOutcome::Nack));
    }
}
