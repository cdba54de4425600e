//! Frame header, message types, and the payload grammars that ride on them.
//!
//! The 7-byte header is `type(1) | seq(4) | payload_len(2)`, all big-endian.
//! The original source left `seq` and `payload_len` in host byte order; this
//! rewrite standardises the whole header on big-endian (see the design
//! ledger), so hub and peer builds always agree regardless of host
//! endianness.

use std::io::{self, Read, Write};

use crate::error::FrameError;

pub const HEADER_LEN: usize = 7;
/// A FILE_CHUNK payload is `xfer_id_be(4) | data`, and `payload_len` on the
/// wire is a `u16`. The original source used a flat 64 KiB (`65_536`) chunk
/// size, which makes `4 + bytes_read` overflow `u16` for every full chunk
/// (`transfer.c`'s `fhdr.payload_len = (uint16_t)(4 + bytes_read)` wraps to 4
/// whenever `bytes_read == 65_536`) and desyncs the stream. This rewrite
/// trims the chunk size so `CHUNK_SIZE + 4` always fits in a `u16`.
pub const CHUNK_SIZE: usize = 65_531;
pub const MAX_MSG: usize = 4096;
pub const MAX_NAME: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Hello = 0x01,
    Chat = 0x02,
    FileMeta = 0x03,
    FileChunk = 0x04,
    FileAck = 0x05,
    FileNack = 0x06,
    Pause = 0x07,
    Resume = 0x08,
    Bye = 0x09,
}

impl MsgType {
    pub fn from_u8(b: u8) -> Result<Self, FrameError> {
        Ok(match b {
            0x01 => MsgType::Hello,
            0x02 => MsgType::Chat,
            0x03 => MsgType::FileMeta,
            0x04 => MsgType::FileChunk,
            0x05 => MsgType::FileAck,
            0x06 => MsgType::FileNack,
            0x07 => MsgType::Pause,
            0x08 => MsgType::Resume,
            0x09 => MsgType::Bye,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

/// A decoded frame: header fields plus owned payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MsgType,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MsgType, seq: u32, payload: Vec<u8>) -> Self {
        Self { msg_type, seq, payload }
    }

    /// Encode header + payload into a single buffer ready for `write_all`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Read one frame from a blocking stream, enforcing `max_payload`.
    pub fn read_from<R: Read>(r: &mut R, max_payload: usize) -> io::Result<Frame> {
        let mut hdr = [0u8; HEADER_LEN];
        r.read_exact(&mut hdr)?;

        let msg_type = MsgType::from_u8(hdr[0])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let seq = u32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]);
        let payload_len = u16::from_be_bytes([hdr[5], hdr[6]]) as usize;

        if payload_len > max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                FrameError::PayloadTooLarge(payload_len as u16, max_payload),
            ));
        }

        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            r.read_exact(&mut payload)?;
        }

        Ok(Frame { msg_type, seq, payload })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.encode())
    }

    /// Try to decode one frame from the front of `buf`, without blocking.
    /// Returns `(frame, consumed_bytes)` or `None` if more data is needed.
    /// Used by the hub's non-blocking per-connection read buffer.
    pub fn try_decode(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let msg_type = MsgType::from_u8(buf[0])?;
        let seq = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let payload_len = u16::from_be_bytes([buf[5], buf[6]]) as usize;

        if payload_len > max_payload {
            return Err(FrameError::PayloadTooLarge(payload_len as u16, max_payload));
        }

        let total = HEADER_LEN + payload_len;
        if buf.len() < total {
            return Ok(None);
        }

        let payload = buf[HEADER_LEN..total].to_vec();
        Ok(Some((Frame { msg_type, seq, payload }, total)))
    }
}

/// Split a `recipient\0text`-shaped payload into its two parts.
pub fn split_nul(payload: &[u8]) -> Result<(&[u8], &[u8]), FrameError> {
    let pos = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(FrameError::MissingSeparator)?;
    Ok((&payload[..pos], &payload[pos + 1..]))
}

/// Build a `recipient\0text` payload.
pub fn join_nul(recipient: &[u8], text: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(recipient.len() + 1 + text.len());
    buf.extend_from_slice(recipient);
    buf.push(0);
    buf.extend_from_slice(text);
    buf
}

/// `recipient\0basename\0total_chunks_be(4)file_size_be(8)` for FILE_META,
/// with the transfer id carried as the frame's `seq`.
pub fn encode_file_meta(recipient: &str, basename: &str, total_chunks: u32, file_size: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(recipient.len() + 1 + basename.len() + 1 + 4 + 8);
    buf.extend_from_slice(recipient.as_bytes());
    buf.push(0);
    buf.extend_from_slice(basename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&total_chunks.to_be_bytes());
    buf.extend_from_slice(&file_size.to_be_bytes());
    buf
}

pub struct FileMeta {
    pub recipient: String,
    pub basename: String,
    pub total_chunks: u32,
    pub file_size: u64,
}

pub fn decode_file_meta(payload: &[u8]) -> Result<FileMeta, FrameError> {
    let (recipient, rest) = split_nul(payload)?;
    let (basename, rest) = split_nul(rest)?;
    if rest.len() < 12 {
        return Err(FrameError::Truncated);
    }
    let total_chunks = u32::from_be_bytes(rest[0..4].try_into().unwrap());
    let file_size = u64::from_be_bytes(rest[4..12].try_into().unwrap());
    Ok(FileMeta {
        recipient: String::from_utf8_lossy(recipient).into_owned(),
        basename: String::from_utf8_lossy(basename).into_owned(),
        total_chunks,
        file_size,
    })
}

/// `xfer_id_be(4)data` for FILE_CHUNK; `seq` in the header is the chunk index.
pub fn encode_file_chunk(xfer_id: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.extend_from_slice(&xfer_id.to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

pub fn decode_file_chunk(payload: &[u8]) -> Result<(u32, &[u8]), FrameError> {
    if payload.len() < 4 {
        return Err(FrameError::Truncated);
    }
    let xfer_id = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    Ok((xfer_id, &payload[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let f = Frame::new(MsgType::Chat, 42, b"bob\0hello".to_vec());
        let encoded = f.encode();
        let (decoded, consumed) = Frame::try_decode(&encoded, MAX_MSG).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.payload, b"bob\0hello");
        assert!(matches!(decoded.msg_type, MsgType::Chat));
    }

    #[test]
    fn try_decode_needs_more_data() {
        let f = Frame::new(MsgType::Chat, 1, b"a\0b".to_vec());
        let encoded = f.encode();
        assert!(Frame::try_decode(&encoded[..3], MAX_MSG).unwrap().is_none());
        assert!(Frame::try_decode(&encoded[..encoded.len() - 1], MAX_MSG)
            .unwrap()
            .is_none());
    }

    #[test]
    fn rejects_oversize_payload() {
        let mut hdr = [0u8; HEADER_LEN];
        hdr[0] = MsgType::Chat as u8;
        hdr[5..7].copy_from_slice(&(MAX_MSG as u16 + 1).to_be_bytes());
        let err = Frame::try_decode(&hdr, MAX_MSG).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge(_, _)));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = vec![0xff, 0, 0, 0, 0, 0, 0];
        buf.push(0);
        let err = Frame::try_decode(&buf, MAX_MSG).unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(0xff)));
    }

    #[test]
    fn file_meta_round_trip() {
        let payload = encode_file_meta("bob", "photo.jpg", 4, 200_000);
        let meta = decode_file_meta(&payload).unwrap();
        assert_eq!(meta.recipient, "bob");
        assert_eq!(meta.basename, "photo.jpg");
        assert_eq!(meta.total_chunks, 4);
        assert_eq!(meta.file_size, 200_000);
    }

    #[test]
    fn file_chunk_round_trip() {
        let payload = encode_file_chunk(7, b"hello world");
        let (xfer_id, data) = decode_file_chunk(&payload).unwrap();
        assert_eq!(xfer_id, 7);
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn split_nul_missing_separator() {
        assert!(matches!(split_nul(b"nosep"), Err(FrameError::MissingSeparator)));
    }
}
