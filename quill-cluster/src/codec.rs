//! Wire codec for raft messages.
//!
//! Frames are length-prefixed:
//!
//! ```text
//! +----------------+------------------+----------+------------------+
//! | frame len (u32)| sender addr      | type (u8)| fields ...       |
//! +----------------+------------------+----------+------------------+
//! ```
//!
//! Every frame leads with the sender's advertised address so a receiver
//! can reply before it has learned the cluster configuration (a node
//! being joined sees the leader's entries before it knows any
//! addresses). All integers are big-endian. Strings and byte blobs are
//! u32 length-prefixed. Entries are a u32 count followed by
//! `(term u64, index u64, kind u8, data)` tuples.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quill_core::{LogIndex, ServerId, Term};
use quill_raft::{
    AppendEntriesRequest, AppendEntriesResponse, Entry, EntryKind, InstallSnapshotRequest,
    InstallSnapshotResponse, Message, RequestVoteRequest, RequestVoteResponse,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The largest frame we will accept (a full snapshot plus headroom).
const FRAME_BYTES_MAX: u32 = 64 * 1024 * 1024;

const MSG_REQUEST_VOTE: u8 = 1;
const MSG_REQUEST_VOTE_RESP: u8 = 2;
const MSG_APPEND_ENTRIES: u8 = 3;
const MSG_APPEND_ENTRIES_RESP: u8 = 4;
const MSG_INSTALL_SNAPSHOT: u8 = 5;
const MSG_INSTALL_SNAPSHOT_RESP: u8 = 6;

const KIND_COMMAND: u8 = 0;
const KIND_CONFIGURATION: u8 = 1;
const KIND_NOOP: u8 = 2;

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame is shorter than its fields require.
    #[error("truncated frame")]
    Truncated,

    /// Unknown message or entry discriminant.
    #[error("unknown discriminant {value} for {what}")]
    UnknownDiscriminant {
        /// What was being decoded.
        what: &'static str,
        /// The unexpected value.
        value: u8,
    },

    /// The frame length exceeds the accepted maximum.
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared length.
        len: u32,
        /// Maximum accepted length.
        max: u32,
    },

    /// A string field held invalid UTF-8.
    #[error("invalid utf-8 in {what}")]
    InvalidString {
        /// Which field.
        what: &'static str,
    },

    /// The connection failed mid-frame.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes one message as a frame, stamped with the sender's advertised
/// address.
///
/// # Errors
/// Returns an error if the write fails.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    from_addr: &str,
    message: &Message,
) -> Result<(), CodecError> {
    let body = encode_message(from_addr, message);
    #[allow(clippy::cast_possible_truncation)] // bounded by FRAME_BYTES_MAX construction
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one message frame, returning the sender's advertised address
/// and the message. Returns `None` on a clean end of stream.
///
/// # Errors
/// Returns an error on I/O failure or a malformed frame.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(String, Message)>, CodecError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > FRAME_BYTES_MAX {
        return Err(CodecError::FrameTooLarge {
            len,
            max: FRAME_BYTES_MAX,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let mut data = body.as_slice();
    let from_addr = take_str(&mut data, "from_addr")?;
    let message = decode_message(&mut data)?;
    Ok(Some((from_addr, message)))
}

fn encode_message(from_addr: &str, message: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    put_string(&mut buf, from_addr);
    match message {
        Message::RequestVote(r) => {
            buf.put_u8(MSG_REQUEST_VOTE);
            buf.put_u64(r.term.get());
            put_string(&mut buf, r.candidate_id.as_str());
            put_string(&mut buf, r.to.as_str());
            buf.put_u64(r.last_log_index.get());
            buf.put_u64(r.last_log_term.get());
        }
        Message::RequestVoteResponse(r) => {
            buf.put_u8(MSG_REQUEST_VOTE_RESP);
            buf.put_u64(r.term.get());
            put_string(&mut buf, r.from.as_str());
            put_string(&mut buf, r.to.as_str());
            buf.put_u8(u8::from(r.vote_granted));
        }
        Message::AppendEntries(r) => {
            buf.put_u8(MSG_APPEND_ENTRIES);
            buf.put_u64(r.term.get());
            put_string(&mut buf, r.leader_id.as_str());
            put_string(&mut buf, r.to.as_str());
            buf.put_u64(r.prev_log_index.get());
            buf.put_u64(r.prev_log_term.get());
            buf.put_u64(r.leader_commit.get());
            put_entries(&mut buf, &r.entries);
        }
        Message::AppendEntriesResponse(r) => {
            buf.put_u8(MSG_APPEND_ENTRIES_RESP);
            buf.put_u64(r.term.get());
            put_string(&mut buf, r.from.as_str());
            put_string(&mut buf, r.to.as_str());
            buf.put_u8(u8::from(r.success));
            buf.put_u64(r.match_index.get());
        }
        Message::InstallSnapshot(r) => {
            buf.put_u8(MSG_INSTALL_SNAPSHOT);
            buf.put_u64(r.term.get());
            put_string(&mut buf, r.leader_id.as_str());
            put_string(&mut buf, r.to.as_str());
            buf.put_u64(r.last_index.get());
            buf.put_u64(r.last_term.get());
            put_bytes(&mut buf, &r.configuration);
            put_bytes(&mut buf, &r.data);
        }
        Message::InstallSnapshotResponse(r) => {
            buf.put_u8(MSG_INSTALL_SNAPSHOT_RESP);
            buf.put_u64(r.term.get());
            put_string(&mut buf, r.from.as_str());
            put_string(&mut buf, r.to.as_str());
            buf.put_u64(r.match_index.get());
        }
    }
    buf.freeze()
}

fn decode_message(data: &mut &[u8]) -> Result<Message, CodecError> {
    let kind = take_u8(data)?;
    match kind {
        MSG_REQUEST_VOTE => Ok(Message::RequestVote(RequestVoteRequest {
            term: Term::new(take_u64(data)?),
            candidate_id: take_server_id(data, "candidate_id")?,
            to: take_server_id(data, "to")?,
            last_log_index: LogIndex::new(take_u64(data)?),
            last_log_term: Term::new(take_u64(data)?),
        })),
        MSG_REQUEST_VOTE_RESP => Ok(Message::RequestVoteResponse(RequestVoteResponse {
            term: Term::new(take_u64(data)?),
            from: take_server_id(data, "from")?,
            to: take_server_id(data, "to")?,
            vote_granted: take_u8(data)? != 0,
        })),
        MSG_APPEND_ENTRIES => Ok(Message::AppendEntries(AppendEntriesRequest {
            term: Term::new(take_u64(data)?),
            leader_id: take_server_id(data, "leader_id")?,
            to: take_server_id(data, "to")?,
            prev_log_index: LogIndex::new(take_u64(data)?),
            prev_log_term: Term::new(take_u64(data)?),
            leader_commit: LogIndex::new(take_u64(data)?),
            entries: take_entries(data)?,
        })),
        MSG_APPEND_ENTRIES_RESP => Ok(Message::AppendEntriesResponse(AppendEntriesResponse {
            term: Term::new(take_u64(data)?),
            from: take_server_id(data, "from")?,
            to: take_server_id(data, "to")?,
            success: take_u8(data)? != 0,
            match_index: LogIndex::new(take_u64(data)?),
        })),
        MSG_INSTALL_SNAPSHOT => Ok(Message::InstallSnapshot(InstallSnapshotRequest {
            term: Term::new(take_u64(data)?),
            leader_id: take_server_id(data, "leader_id")?,
            to: take_server_id(data, "to")?,
            last_index: LogIndex::new(take_u64(data)?),
            last_term: Term::new(take_u64(data)?),
            configuration: take_bytes(data)?,
            data: take_bytes(data)?,
        })),
        MSG_INSTALL_SNAPSHOT_RESP => Ok(Message::InstallSnapshotResponse(
            InstallSnapshotResponse {
                term: Term::new(take_u64(data)?),
                from: take_server_id(data, "from")?,
                to: take_server_id(data, "to")?,
                match_index: LogIndex::new(take_u64(data)?),
            },
        )),
        value => Err(CodecError::UnknownDiscriminant {
            what: "message",
            value,
        }),
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    #[allow(clippy::cast_possible_truncation)] // ids and addrs are short
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    #[allow(clippy::cast_possible_truncation)] // bounded by FRAME_BYTES_MAX
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn put_entries(buf: &mut BytesMut, entries: &[Entry]) {
    #[allow(clippy::cast_possible_truncation)] // bounded by the batch limit
    buf.put_u32(entries.len() as u32);
    for entry in entries {
        buf.put_u64(entry.term.get());
        buf.put_u64(entry.index.get());
        buf.put_u8(match entry.kind {
            EntryKind::Command => KIND_COMMAND,
            EntryKind::Configuration => KIND_CONFIGURATION,
            EntryKind::Noop => KIND_NOOP,
        });
        put_bytes(buf, &entry.data);
    }
}

fn take_u8(data: &mut &[u8]) -> Result<u8, CodecError> {
    if data.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(data.get_u8())
}

fn take_u64(data: &mut &[u8]) -> Result<u64, CodecError> {
    if data.remaining() < 8 {
        return Err(CodecError::Truncated);
    }
    Ok(data.get_u64())
}

fn take_bytes(data: &mut &[u8]) -> Result<Bytes, CodecError> {
    if data.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let bytes = Bytes::copy_from_slice(&data[..len]);
    data.advance(len);
    Ok(bytes)
}

fn take_str(data: &mut &[u8], what: &'static str) -> Result<String, CodecError> {
    let bytes = take_bytes(data)?;
    std::str::from_utf8(&bytes)
        .map(str::to_string)
        .map_err(|_| CodecError::InvalidString { what })
}

fn take_server_id(data: &mut &[u8], what: &'static str) -> Result<ServerId, CodecError> {
    take_str(data, what).map(ServerId::new)
}

fn take_entries(data: &mut &[u8]) -> Result<Vec<Entry>, CodecError> {
    if data.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    let count = data.get_u32();
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let term = Term::new(take_u64(data)?);
        let index = LogIndex::new(take_u64(data)?);
        let kind = match take_u8(data)? {
            KIND_COMMAND => EntryKind::Command,
            KIND_CONFIGURATION => EntryKind::Configuration,
            KIND_NOOP => EntryKind::Noop,
            value => {
                return Err(CodecError::UnknownDiscriminant {
                    what: "entry kind",
                    value,
                })
            }
        };
        let payload = take_bytes(data)?;
        entries.push(Entry::new(term, index, kind, payload));
    }
    Ok(entries)
}
