//! Send-side transfer logic: META then stop-and-wait CHUNK delivery.
//!
//! Grounded on `send_thread`/`wait_for_ack` in
//! `examples/original_source/src/transfer.c`. The original's socket is read
//! directly by `wait_for_ack` from the same thread that also runs a
//! separate chat-only receive loop — a genuine two-reader race on one fd.
//! This rewrite instead requires the caller to supply a `Transport`: the
//! peer endpoint's single receive loop is the only code that ever reads the
//! socket, and it forwards ACK/NACK/PAUSE replies to whichever sender is
//! currently waiting. `send_frame`/`wait_reply` on one `Transport` are never
//! called concurrently by two sender threads (the peer endpoint serializes
//! outbound transfers per connection), so a reply is always unambiguous.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::{TransferHandle, XferState, XFER_MAX_RETRIES, XFER_TIMEOUT_S};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::wire::{encode_file_meta, CHUNK_SIZE};

/// What the receive loop observed in reply to an outstanding CHUNK.
#[derive(Debug, Clone, Copy)]
pub enum SendReply {
    Ack(u32),
    Nack(u32),
    /// `seq` here carries the transfer id, per the PAUSE/RESUME wire
    /// convention documented in the design ledger.
    Pause(u32),
}

/// What a sender needs from its peer connection: send a frame, and wait for
/// the next reply routed to this transfer. Implemented by the peer endpoint.
pub trait Transport: Send + Sync {
    fn send_chunk(&self, xfer_id: u32, seq: u32, data: &[u8]) -> std::io::Result<()>;
    /// Send FILE_META and wait up to `timeout` for the receiver's META ACK.
    /// The reply waiter must be registered before the frame goes out (not
    /// after) so the ACK can never race ahead of the wait and get dropped or,
    /// worse, linger to be picked up by chunk 0's own `wait_reply`.
    fn send_meta(&self, xfer_id: u32, payload: &[u8], timeout: Duration) -> std::io::Result<Option<SendReply>>;
    fn wait_reply(&self, timeout: Duration) -> Option<SendReply>;
}

/// Run one outbound transfer to completion (DONE or ERROR), synchronously.
/// Callers spawn this on its own detached thread, matching the original's
/// one-sender-thread-per-transfer model.
pub fn run_send(
    handle: Arc<TransferHandle>,
    filepath: &str,
    transport: &dyn Transport,
    logger: &dyn TransferLogger,
) {
    let mut file = match File::open(filepath) {
        Ok(f) => f,
        Err(source) => {
            error!(xfer_id = handle.id, filepath, error = %source, "transfer: cannot open file");
            handle.set_state(XferState::Error);
            logger.log(TransferLog {
                xfer_id: handle.id,
                event: TransferEvent::Error {
                    message: source.to_string(),
                    done: 0,
                    total: handle.total_chunks,
                },
            });
            return;
        }
    };

    handle.set_state(XferState::Active);

    let basename = std::path::Path::new(filepath)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| filepath.to_string());
    let file_size = file.metadata().map(|m| m.len()).unwrap_or(0);

    // The META ACK is consumed here, before the chunk loop starts, so it can
    // never be mistaken for chunk 0's own ACK/NACK reply.
    let meta_payload = encode_file_meta(&handle.peer, &basename, handle.total_chunks, file_size);
    if let Err(e) = transport.send_meta(handle.id, &meta_payload, Duration::from_secs(XFER_TIMEOUT_S)) {
        error!(xfer_id = handle.id, error = %e, "transfer: meta send failed");
        handle.set_state(XferState::Error);
        return;
    }

    info!(
        xfer_id = handle.id, filepath, total_chunks = handle.total_chunks, peer = %handle.peer,
        "transfer: sending"
    );
    logger.log(TransferLog {
        xfer_id: handle.id,
        event: TransferEvent::Started {
            peer: handle.peer.clone(),
            filename: basename,
            total_chunks: handle.total_chunks,
        },
    });

    let mut chunk_buf = vec![0u8; CHUNK_SIZE];
    let mut failed = false;

    'outer: for seq in 0..handle.total_chunks {
        handle.wait_while_paused();
        if handle.state() == XferState::Error {
            failed = true;
            break;
        }

        // Resume case: this chunk was already acked before a prior pause.
        if handle.chunk_already_done(seq) {
            continue;
        }

        if file.seek(SeekFrom::Start(seq as u64 * CHUNK_SIZE as u64)).is_err() {
            failed = true;
            break;
        }
        let bytes_read = match read_up_to(&mut file, &mut chunk_buf) {
            Ok(n) => n,
            Err(_) => {
                failed = true;
                break;
            }
        };
        if bytes_read == 0 {
            break;
        }

        let mut retries = 0u32;
        loop {
            if transport.send_chunk(handle.id, seq, &chunk_buf[..bytes_read]).is_err() {
                handle.set_state(XferState::Error);
                failed = true;
                break 'outer;
            }

            match transport.wait_reply(Duration::from_secs(XFER_TIMEOUT_S)) {
                Some(SendReply::Ack(acked_seq)) if acked_seq == seq => {
                    handle.mark_chunk_done(seq);
                    logger.log(TransferLog {
                        xfer_id: handle.id,
                        event: TransferEvent::Progress {
                            done: handle.done_chunks(),
                            total: handle.total_chunks,
                        },
                    });
                    break;
                }
                Some(SendReply::Pause(_)) => {
                    handle.set_state(XferState::Paused);
                    logger.log(TransferLog {
                        xfer_id: handle.id,
                        event: TransferEvent::Paused {
                            done: handle.done_chunks(),
                            total: handle.total_chunks,
                        },
                    });
                    info!(xfer_id = handle.id, seq, "transfer: paused");
                    handle.wait_while_paused();
                    if handle.state() == XferState::Error {
                        failed = true;
                        break 'outer;
                    }
                    logger.log(TransferLog {
                        xfer_id: handle.id,
                        event: TransferEvent::Resumed {
                            done: handle.done_chunks(),
                            total: handle.total_chunks,
                        },
                    });
                    // Retry the same chunk after resume; don't count it
                    // against the retry budget.
                    continue;
                }
                // ACK for a stale seq, a NACK, or a timed-out wait are all
                // retryable under the same bounded budget.
                _ => {
                    retries += 1;
                    logger.log(TransferLog {
                        xfer_id: handle.id,
                        event: TransferEvent::Retry { seq, attempt: retries, max: XFER_MAX_RETRIES },
                    });
                    warn!(xfer_id = handle.id, seq, retries, "transfer: retrying chunk");
                    if retries >= XFER_MAX_RETRIES {
                        handle.set_state(XferState::Error);
                        failed = true;
                        break 'outer;
                    }
                }
            }
        }
    }

    if !failed && handle.state() != XferState::Error && handle.done_chunks() >= handle.total_chunks {
        handle.set_state(XferState::Done);
        info!(xfer_id = handle.id, "transfer: complete");
        logger.log(TransferLog {
            xfer_id: handle.id,
            event: TransferEvent::Done { done: handle.done_chunks(), total: handle.total_chunks },
        });
    } else if handle.state() != XferState::Paused {
        handle.set_state(XferState::Error);
        error!(xfer_id = handle.id, done = handle.done_chunks(), total = handle.total_chunks, "transfer: failed");
        logger.log(TransferLog {
            xfer_id: handle.id,
            event: TransferEvent::Error {
                message: "exhausted retries".to_string(),
                done: handle.done_chunks(),
                total: handle.total_chunks,
            },
        });
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
