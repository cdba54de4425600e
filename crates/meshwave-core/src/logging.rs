//! Transfer logging trait for structured, pluggable diagnostics.
//!
//! Mirrors the shape of a callback-based event notifier generalized into a
//! trait object so callers can route transfer lifecycle events through
//! `tracing`, or swap in a no-op for tests that don't care.

use std::fmt;

use crate::transfer::XferState;

#[derive(Debug, Clone)]
pub struct TransferLog {
    pub xfer_id: u32,
    pub event: TransferEvent,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    Started { peer: String, filename: String, total_chunks: u32 },
    Progress { done: u32, total: u32 },
    Retry { seq: u32, attempt: u32, max: u32 },
    Paused { done: u32, total: u32 },
    Resumed { done: u32, total: u32 },
    Done { done: u32, total: u32 },
    Error { message: String, done: u32, total: u32 },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { peer, filename, total_chunks } => {
                write!(f, "started peer={peer} file={filename} total_chunks={total_chunks}")
            }
            Self::Progress { done, total } => write!(f, "progress done={done} total={total}"),
            Self::Retry { seq, attempt, max } => {
                write!(f, "retry seq={seq} attempt={attempt}/{max}")
            }
            Self::Paused { done, total } => write!(f, "paused done={done} total={total}"),
            Self::Resumed { done, total } => write!(f, "resumed done={done} total={total}"),
            Self::Done { done, total } => write!(f, "done done={done} total={total}"),
            Self::Error { message, done, total } => {
                write!(f, "error: {message} done={done} total={total}")
            }
        }
    }
}

impl TransferEvent {
    pub fn state(&self) -> XferState {
        match self {
            Self::Started { .. } | Self::Progress { .. } | Self::Resumed { .. } => XferState::Active,
            Self::Paused { .. } => XferState::Paused,
            Self::Done { .. } => XferState::Done,
            Self::Error { .. } => XferState::Error,
            Self::Retry { .. } => XferState::Active,
        }
    }
}

/// Trait for transfer logging. Implementations can forward to `tracing` or
/// discard entirely.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that forwards to the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        match &entry.event {
            TransferEvent::Started { .. }
            | TransferEvent::Paused { .. }
            | TransferEvent::Resumed { .. }
            | TransferEvent::Done { .. }
            | TransferEvent::Error { .. } => {
                tracing::info!(xfer_id = entry.xfer_id, "{}", entry.event);
            }
            TransferEvent::Progress { .. } | TransferEvent::Retry { .. } => {
                tracing::debug!(xfer_id = entry.xfer_id, "{}", entry.event);
            }
        }
    }
}

/// No-op logger, used in tests and anywhere diagnostics aren't wanted.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
