//! Binary framing: a fixed 24-byte big-endian header followed by
//! extras, key, and value. Request encoders cover everything the client
//! sends; decoders cover everything a server can send back, including the
//! per-partition event frames. The response encoders exist for servers
//! (and test fixtures) speaking the same protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, StreamError};

pub const HEADER_LEN: usize = 24;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Ask the server to act as the stream producer for this connection.
pub const OPEN_FLAG_PRODUCER: u32 = 0x01;

pub mod opcode {
    pub const STAT: u8 = 0x10;
    pub const SASL_AUTH: u8 = 0x21;
    pub const OPEN_CONNECTION: u8 = 0x50;
    pub const STREAM_CLOSE: u8 = 0x52;
    pub const STREAM_REQUEST: u8 = 0x53;
    pub const FAILOVER_LOG: u8 = 0x54;
    pub const STREAM_END: u8 = 0x55;
    pub const SNAPSHOT_MARKER: u8 = 0x56;
    pub const MUTATION: u8 = 0x57;
    pub const DELETION: u8 = 0x58;
    pub const EXPIRATION: u8 = 0x59;
}

pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const KEY_NOT_FOUND: u16 = 0x0001;
    pub const KEY_EEXISTS: u16 = 0x0002;
    pub const NOT_MY_VBUCKET: u16 = 0x0007;
    pub const SASL_AUTH_FAILED: u16 = 0x0020;
    pub const ERANGE: u16 = 0x0022;
    pub const ROLLBACK: u16 = 0x0023;
}

const MUTATION_EXTRAS_LEN: usize = 31;
const DELETION_EXTRAS_LEN: usize = 18;
const SNAPSHOT_EXTRAS_LEN: usize = 20;
const STREAM_REQUEST_EXTRAS_LEN: usize = 48;

/// One entry of a failover log: the partition history branch (uuid) and
/// the highest sequence the branch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartVersion {
    pub uuid: u64,
    pub seq: u64,
}

/// Most recent entry first.
pub type FailoverLog = Vec<PartVersion>;

/// Decoded frame header. The u16 at offset 6 is the partition id on
/// requests and events, and the status code on responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub partition: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl FrameHeader {
    pub fn status(&self) -> u16 {
        self.partition
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Self {
        let mut buf = &raw[..];
        Self {
            magic: buf.get_u8(),
            opcode: buf.get_u8(),
            key_len: buf.get_u16(),
            extras_len: buf.get_u8(),
            data_type: buf.get_u8(),
            partition: buf.get_u16(),
            body_len: buf.get_u32(),
            opaque: buf.get_u32(),
            cas: buf.get_u64(),
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_len);
        buf.put_u8(self.extras_len);
        buf.put_u8(self.data_type);
        buf.put_u16(self.partition);
        buf.put_u32(self.body_len);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }
}

fn frame(
    magic: u8,
    op: u8,
    field: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> Bytes {
    let body_len = extras.len() + key.len() + value.len();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
    FrameHeader {
        magic,
        opcode: op,
        key_len: key.len() as u16,
        extras_len: extras.len() as u8,
        data_type: 0,
        partition: field,
        body_len: body_len as u32,
        opaque,
        cas,
    }
    .encode_into(&mut buf);
    buf.put_slice(extras);
    buf.put_slice(key);
    buf.put_slice(value);
    buf.freeze()
}

// ---- request encoders -------------------------------------------------

/// PLAIN-mechanism authentication: the bucket name doubles as the user.
pub fn sasl_auth_request(opaque: u32, user: &str, password: &str) -> Bytes {
    let mut value = Vec::with_capacity(user.len() + password.len() + 2);
    value.push(0);
    value.extend_from_slice(user.as_bytes());
    value.push(0);
    value.extend_from_slice(password.as_bytes());
    frame(
        MAGIC_REQUEST,
        opcode::SASL_AUTH,
        0,
        opaque,
        0,
        &[],
        b"PLAIN",
        &value,
    )
}

/// Name the connection and declare which side produces events.
pub fn open_connection_request(opaque: u32, name: &str, flags: u32) -> Bytes {
    let mut extras = [0u8; 8];
    extras[4..8].copy_from_slice(&flags.to_be_bytes());
    frame(
        MAGIC_REQUEST,
        opcode::OPEN_CONNECTION,
        0,
        opaque,
        0,
        &extras,
        name.as_bytes(),
        &[],
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequestParams {
    pub flags: u32,
    pub start_seq: u64,
    pub end_seq: u64,
    pub uuid: u64,
    pub snapshot_start: u64,
    pub snapshot_end: u64,
}

pub fn stream_request(
    opaque: u32,
    partition: u16,
    flags: u32,
    start_seq: u64,
    end_seq: u64,
    version: PartVersion,
) -> Bytes {
    let mut extras = BytesMut::with_capacity(STREAM_REQUEST_EXTRAS_LEN);
    extras.put_u32(flags);
    extras.put_u32(0);
    extras.put_u64(start_seq);
    extras.put_u64(end_seq);
    extras.put_u64(version.uuid);
    extras.put_u64(start_seq);
    extras.put_u64(start_seq);
    frame(
        MAGIC_REQUEST,
        opcode::STREAM_REQUEST,
        partition,
        opaque,
        0,
        &extras,
        &[],
        &[],
    )
}

pub fn stream_close_request(opaque: u32, partition: u16) -> Bytes {
    frame(
        MAGIC_REQUEST,
        opcode::STREAM_CLOSE,
        partition,
        opaque,
        0,
        &[],
        &[],
        &[],
    )
}

/// Request the sequence-number stat of one partition.
pub fn seq_stat_request(opaque: u32, partition: u16) -> Bytes {
    let key = format!("vbucket-seqno {partition}");
    frame(
        MAGIC_REQUEST,
        opcode::STAT,
        partition,
        opaque,
        0,
        &[],
        key.as_bytes(),
        &[],
    )
}

pub fn failover_log_request(opaque: u32, partition: u16) -> Bytes {
    frame(
        MAGIC_REQUEST,
        opcode::FAILOVER_LOG,
        partition,
        opaque,
        0,
        &[],
        &[],
        &[],
    )
}

// ---- response / event encoders (server side) --------------------------

pub fn status_response(op: u8, code: u16, opaque: u32) -> Bytes {
    frame(MAGIC_RESPONSE, op, code, opaque, 0, &[], &[], &[])
}

pub fn failover_log_response(op: u8, opaque: u32, log: &FailoverLog) -> Bytes {
    let mut body = BytesMut::with_capacity(log.len() * 16);
    for entry in log {
        body.put_u64(entry.uuid);
        body.put_u64(entry.seq);
    }
    frame(MAGIC_RESPONSE, op, status::SUCCESS, opaque, 0, &[], &[], &body)
}

pub fn rollback_response(opaque: u32, seq: u64) -> Bytes {
    frame(
        MAGIC_RESPONSE,
        opcode::STREAM_REQUEST,
        status::ROLLBACK,
        opaque,
        0,
        &[],
        &[],
        &seq.to_be_bytes(),
    )
}

/// One stat pair; a pair with empty key and value terminates the stat
/// stream, see [`stat_end_response`].
pub fn stat_response(opaque: u32, key: &str, value: &str) -> Bytes {
    frame(
        MAGIC_RESPONSE,
        opcode::STAT,
        status::SUCCESS,
        opaque,
        0,
        &[],
        key.as_bytes(),
        value.as_bytes(),
    )
}

pub fn stat_end_response(opaque: u32) -> Bytes {
    frame(
        MAGIC_RESPONSE,
        opcode::STAT,
        status::SUCCESS,
        opaque,
        0,
        &[],
        &[],
        &[],
    )
}

pub fn snapshot_marker_event(
    opaque: u32,
    partition: u16,
    start_seq: u64,
    end_seq: u64,
    kind: u32,
) -> Bytes {
    let mut extras = BytesMut::with_capacity(SNAPSHOT_EXTRAS_LEN);
    extras.put_u64(start_seq);
    extras.put_u64(end_seq);
    extras.put_u32(kind);
    frame(
        MAGIC_REQUEST,
        opcode::SNAPSHOT_MARKER,
        partition,
        opaque,
        0,
        &extras,
        &[],
        &[],
    )
}

pub fn mutation_event(opaque: u32, mutation: &Mutation) -> Bytes {
    let mut extras = BytesMut::with_capacity(MUTATION_EXTRAS_LEN);
    extras.put_u64(mutation.seq);
    extras.put_u64(mutation.rev_seq);
    extras.put_u32(mutation.flags);
    extras.put_u32(mutation.expiration);
    extras.put_u32(0); // lock time
    extras.put_u16(0); // metadata length
    extras.put_u8(0); // nru
    frame(
        MAGIC_REQUEST,
        opcode::MUTATION,
        mutation.partition,
        opaque,
        mutation.cas,
        &extras,
        &mutation.key,
        &mutation.value,
    )
}

pub fn deletion_event(opaque: u32, op: u8, deletion: &Deletion) -> Bytes {
    let mut extras = BytesMut::with_capacity(DELETION_EXTRAS_LEN);
    extras.put_u64(deletion.seq);
    extras.put_u64(deletion.rev_seq);
    extras.put_u16(deletion.metadata.len() as u16);
    frame(
        MAGIC_REQUEST,
        op,
        deletion.partition,
        opaque,
        0,
        &extras,
        &deletion.key,
        &deletion.metadata,
    )
}

pub fn stream_end_event(opaque: u32, partition: u16, flags: u32) -> Bytes {
    frame(
        MAGIC_REQUEST,
        opcode::STREAM_END,
        partition,
        opaque,
        0,
        &flags.to_be_bytes(),
        &[],
        &[],
    )
}

// ---- decoded payloads -------------------------------------------------

/// A document write within a partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub partition: u16,
    pub seq: u64,
    pub rev_seq: u64,
    pub flags: u32,
    pub expiration: u32,
    pub cas: u64,
    pub key: Bytes,
    pub value: Bytes,
}

/// A document removal. Deletions and expirations share this shape and
/// are equivalent to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub partition: u16,
    pub seq: u64,
    pub rev_seq: u64,
    pub key: Bytes,
    pub metadata: Bytes,
}

/// One event frame of a partition stream, in server send order.
/// `StreamEnd` is always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    SnapshotMarker {
        start_seq: u64,
        end_seq: u64,
        kind: u32,
    },
    Mutation(Mutation),
    Deletion(Deletion),
    StreamEnd {
        flags: u32,
    },
}

// ---- decoders ---------------------------------------------------------

fn need(body: &[u8], len: usize) -> Result<()> {
    if body.len() < len {
        // A body shorter than its declared layout reads as a torn
        // connection.
        return Err(StreamError::Closed);
    }
    Ok(())
}

pub fn parse_failover_log(body: &[u8]) -> Result<FailoverLog> {
    if body.len() % 16 != 0 {
        return Err(StreamError::Protocol(format!(
            "failover log body of {} bytes",
            body.len()
        )));
    }
    let mut buf = body;
    let mut log = FailoverLog::with_capacity(body.len() / 16);
    while buf.has_remaining() {
        log.push(PartVersion {
            uuid: buf.get_u64(),
            seq: buf.get_u64(),
        });
    }
    Ok(log)
}

pub fn parse_rollback_seq(body: &[u8]) -> Result<u64> {
    need(body, 8)?;
    Ok((&body[..8]).get_u64())
}

pub fn parse_stream_request(header: &FrameHeader, body: &[u8]) -> Result<StreamRequestParams> {
    if header.extras_len as usize != STREAM_REQUEST_EXTRAS_LEN {
        return Err(StreamError::Protocol("bad stream request extras".into()));
    }
    need(body, STREAM_REQUEST_EXTRAS_LEN)?;
    let mut buf = body;
    let flags = buf.get_u32();
    let _reserved = buf.get_u32();
    Ok(StreamRequestParams {
        flags,
        start_seq: buf.get_u64(),
        end_seq: buf.get_u64(),
        uuid: buf.get_u64(),
        snapshot_start: buf.get_u64(),
        snapshot_end: buf.get_u64(),
    })
}

pub fn parse_snapshot_marker(header: &FrameHeader, body: &[u8]) -> Result<StreamEvent> {
    if header.extras_len as usize != SNAPSHOT_EXTRAS_LEN {
        return Err(StreamError::Protocol("bad snapshot marker extras".into()));
    }
    need(body, SNAPSHOT_EXTRAS_LEN)?;
    let mut buf = body;
    Ok(StreamEvent::SnapshotMarker {
        start_seq: buf.get_u64(),
        end_seq: buf.get_u64(),
        kind: buf.get_u32(),
    })
}

pub fn parse_mutation(header: &FrameHeader, body: &[u8]) -> Result<StreamEvent> {
    if header.extras_len as usize != MUTATION_EXTRAS_LEN {
        return Err(StreamError::Protocol("bad mutation extras".into()));
    }
    let key_len = header.key_len as usize;
    need(body, MUTATION_EXTRAS_LEN + key_len)?;
    let mut buf = body;
    let seq = buf.get_u64();
    let rev_seq = buf.get_u64();
    let flags = buf.get_u32();
    let expiration = buf.get_u32();
    let _lock_time = buf.get_u32();
    let _metadata_len = buf.get_u16();
    let _nru = buf.get_u8();
    let key = Bytes::copy_from_slice(&buf[..key_len]);
    let value = Bytes::copy_from_slice(&buf[key_len..]);
    Ok(StreamEvent::Mutation(Mutation {
        partition: header.partition,
        seq,
        rev_seq,
        flags,
        expiration,
        cas: header.cas,
        key,
        value,
    }))
}

/// Parses both deletions and expirations; the post-header layout is
/// identical.
pub fn parse_deletion(header: &FrameHeader, body: &[u8]) -> Result<StreamEvent> {
    if header.extras_len as usize != DELETION_EXTRAS_LEN {
        return Err(StreamError::Protocol("bad deletion extras".into()));
    }
    let key_len = header.key_len as usize;
    need(body, DELETION_EXTRAS_LEN + key_len)?;
    let mut buf = body;
    let seq = buf.get_u64();
    let rev_seq = buf.get_u64();
    let _metadata_len = buf.get_u16();
    let key = Bytes::copy_from_slice(&buf[..key_len]);
    let metadata = Bytes::copy_from_slice(&buf[key_len..]);
    Ok(StreamEvent::Deletion(Deletion {
        partition: header.partition,
        seq,
        rev_seq,
        key,
        metadata,
    }))
}

pub fn parse_stream_end(header: &FrameHeader, body: &[u8]) -> Result<StreamEvent> {
    if header.extras_len < 4 {
        return Err(StreamError::Protocol("bad stream end extras".into()));
    }
    need(body, 4)?;
    Ok(StreamEvent::StreamEnd {
        flags: (&body[..4]).get_u32(),
    })
}

/// Split a stat frame body into its key/value pair; `None` is the
/// zero-body terminator.
pub fn parse_stat_pair(header: &FrameHeader, body: &[u8]) -> Result<Option<(String, String)>> {
    if body.is_empty() {
        return Ok(None);
    }
    let key_len = header.key_len as usize;
    need(body, key_len)?;
    let key = String::from_utf8_lossy(&body[..key_len]).into_owned();
    let value = String::from_utf8_lossy(&body[key_len..]).into_owned();
    Ok(Some((key, value)))
}

/// The bit-exact status mapping. `ROLLBACK` is not here: it only occurs
/// on stream requests and carries a sequence in the body.
pub fn status_error(code: u16) -> StreamError {
    match code {
        status::KEY_NOT_FOUND => StreamError::WrongPartitionVersion,
        status::ERANGE => StreamError::WrongStartSequenceNumber,
        status::KEY_EEXISTS => StreamError::StreamAlreadyExists,
        status::NOT_MY_VBUCKET => StreamError::StreamNotFound,
        status::SASL_AUTH_FAILED => StreamError::SaslAuthFailed,
        other => StreamError::Status(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(frame: &Bytes) -> (FrameHeader, Vec<u8>) {
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&frame[..HEADER_LEN]);
        (FrameHeader::decode(&header), frame[HEADER_LEN..].to_vec())
    }

    #[test]
    fn header_roundtrip() {
        let original = FrameHeader {
            magic: MAGIC_REQUEST,
            opcode: opcode::MUTATION,
            key_len: 3,
            extras_len: 31,
            data_type: 0,
            partition: 17,
            body_len: 42,
            opaque: 0xdead_beef,
            cas: 0x0102_0304_0506_0708,
        };
        let mut buf = BytesMut::new();
        original.encode_into(&mut buf);
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&buf);
        assert_eq!(FrameHeader::decode(&raw), original);
    }

    #[test]
    fn sasl_auth_frame_shape() {
        let bytes = sasl_auth_request(7, "bucket", "secret");
        let (header, body) = split(&bytes);
        assert_eq!(header.opcode, opcode::SASL_AUTH);
        assert_eq!(header.key_len, 5);
        assert_eq!(header.opaque, 7);
        assert_eq!(&body[..5], b"PLAIN");
        assert_eq!(&body[5..], b"\0bucket\0secret");
    }

    #[test]
    fn open_connection_carries_flags_and_name() {
        let bytes = open_connection_request(9, "indexer", OPEN_FLAG_PRODUCER);
        let (header, body) = split(&bytes);
        assert_eq!(header.opcode, opcode::OPEN_CONNECTION);
        assert_eq!(header.extras_len, 8);
        assert_eq!(&body[..4], &[0, 0, 0, 0]);
        assert_eq!(&body[4..8], &1u32.to_be_bytes());
        assert_eq!(&body[8..], b"indexer");
    }

    #[test]
    fn stream_request_roundtrip() {
        let version = PartVersion {
            uuid: 0xfeed_f00d,
            seq: 400,
        };
        let bytes = stream_request(3, 12, 0, 5, 99, version);
        let (header, body) = split(&bytes);
        assert_eq!(header.opcode, opcode::STREAM_REQUEST);
        assert_eq!(header.partition, 12);
        let params = parse_stream_request(&header, &body).unwrap();
        assert_eq!(
            params,
            StreamRequestParams {
                flags: 0,
                start_seq: 5,
                end_seq: 99,
                uuid: 0xfeed_f00d,
                snapshot_start: 5,
                snapshot_end: 5,
            }
        );
    }

    #[test]
    fn failover_log_roundtrip() {
        let log = vec![
            PartVersion {
                uuid: 1234,
                seq: 5678,
            },
            PartVersion { uuid: 1, seq: 0 },
        ];
        let bytes = failover_log_response(opcode::FAILOVER_LOG, 4, &log);
        let (header, body) = split(&bytes);
        assert_eq!(header.status(), status::SUCCESS);
        assert_eq!(parse_failover_log(&body).unwrap(), log);
    }

    #[test]
    fn failover_log_rejects_torn_entries() {
        assert!(parse_failover_log(&[0u8; 15]).is_err());
    }

    #[test]
    fn rollback_roundtrip() {
        let bytes = rollback_response(11, 250);
        let (header, body) = split(&bytes);
        assert_eq!(header.status(), status::ROLLBACK);
        assert_eq!(parse_rollback_seq(&body).unwrap(), 250);
    }

    #[test]
    fn short_rollback_body_reads_as_closed() {
        assert!(matches!(
            parse_rollback_seq(&[0u8; 4]),
            Err(StreamError::Closed)
        ));
    }

    #[test]
    fn mutation_roundtrip() {
        let mutation = Mutation {
            partition: 3,
            seq: 44,
            rev_seq: 2,
            flags: 0x10,
            expiration: 0,
            cas: 777,
            key: Bytes::from_static(b"doc-1"),
            value: Bytes::from_static(b"{\"x\":1}"),
        };
        let bytes = mutation_event(21, &mutation);
        let (header, body) = split(&bytes);
        let event = parse_mutation(&header, &body).unwrap();
        assert_eq!(event, StreamEvent::Mutation(mutation));
    }

    #[test]
    fn deletion_and_expiration_decode_identically() {
        let deletion = Deletion {
            partition: 3,
            seq: 45,
            rev_seq: 3,
            key: Bytes::from_static(b"doc-2"),
            metadata: Bytes::new(),
        };
        for op in [opcode::DELETION, opcode::EXPIRATION] {
            let bytes = deletion_event(22, op, &deletion);
            let (header, body) = split(&bytes);
            let event = parse_deletion(&header, &body).unwrap();
            assert_eq!(event, StreamEvent::Deletion(deletion.clone()));
        }
    }

    #[test]
    fn snapshot_marker_roundtrip() {
        let bytes = snapshot_marker_event(5, 0, 1, 10, 1);
        let (header, body) = split(&bytes);
        assert_eq!(
            parse_snapshot_marker(&header, &body).unwrap(),
            StreamEvent::SnapshotMarker {
                start_seq: 1,
                end_seq: 10,
                kind: 1,
            }
        );
    }

    #[test]
    fn stream_end_roundtrip() {
        let bytes = stream_end_event(6, 2, 0);
        let (header, body) = split(&bytes);
        assert_eq!(
            parse_stream_end(&header, &body).unwrap(),
            StreamEvent::StreamEnd { flags: 0 }
        );
    }

    #[test]
    fn stat_pair_and_terminator() {
        let bytes = stat_response(8, "vbucket-seqno 0", "123");
        let (header, body) = split(&bytes);
        assert_eq!(
            parse_stat_pair(&header, &body).unwrap(),
            Some(("vbucket-seqno 0".to_owned(), "123".to_owned()))
        );

        let bytes = stat_end_response(8);
        let (header, body) = split(&bytes);
        assert_eq!(parse_stat_pair(&header, &body).unwrap(), None);
    }

    #[test]
    fn status_mapping_is_exact() {
        assert!(matches!(
            status_error(status::KEY_NOT_FOUND),
            StreamError::WrongPartitionVersion
        ));
        assert!(matches!(
            status_error(status::ERANGE),
            StreamError::WrongStartSequenceNumber
        ));
        assert!(matches!(
            status_error(status::KEY_EEXISTS),
            StreamError::StreamAlreadyExists
        ));
        assert!(matches!(
            status_error(status::NOT_MY_VBUCKET),
            StreamError::StreamNotFound
        ));
        assert!(matches!(
            status_error(status::SASL_AUTH_FAILED),
            StreamError::SaslAuthFailed
        ));
        assert!(matches!(status_error(0x86), StreamError::Status(0x86)));
    }
}
