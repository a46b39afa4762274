//! The 16-byte frame header that fronts every Dubbo message:
//! magic (2), flags (1), status (1), invocation id (8, big-endian),
//! body length (4, big-endian).

use crate::error::{NetError, STATUS_OK};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};

pub const HEADER_SIZE: usize = 16;

pub const MAGIC: [u8; 2] = [0xda, 0xbb];

// Flag bits: 0x80 request, 0x40 two-way, 0x20 heartbeat, low five bits the
// serialization id (hessian2 = 2).
pub const FLAG_REQUEST: u8 = 0x80;
pub const FLAG_TWOWAY: u8 = 0x40;
pub const FLAG_HEARTBEAT: u8 = 0x20;
pub const SERIALIZATION_HESSIAN2: u8 = 0x02;

/// `0xc2`: a two-way hessian request.
pub const REQUEST_FLAGS: u8 = FLAG_REQUEST | FLAG_TWOWAY | SERIALIZATION_HESSIAN2;
/// `0xe2`: a heartbeat probe.
pub const HEARTBEAT_REQUEST_FLAGS: u8 = REQUEST_FLAGS | FLAG_HEARTBEAT;
/// `0x22`: a heartbeat reply.
pub const HEARTBEAT_RESPONSE_FLAGS: u8 = FLAG_HEARTBEAT | SERIALIZATION_HESSIAN2;

/// What a parsed header says the incoming frame is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    HeartbeatRequest,
    HeartbeatResponse,
    /// A correlated response; status 20 carries a payload, anything else an
    /// error string.
    Response { status: u8 },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub kind: FrameKind,
    pub invoke_id: i64,
    /// The raw id region, echoed verbatim into heartbeat replies.
    pub id_bytes: [u8; 8],
    pub body_len: usize,
}

/// Parses a 16-byte header. Bad magic, an impossible body length, a
/// non-heartbeat request, or a failed heartbeat reply are all fatal to the
/// connection.
pub(crate) fn parse_header(head: &[u8]) -> Result<Header, NetError> {
    debug_assert_eq!(head.len(), HEADER_SIZE);

    if head[0] != MAGIC[0] || head[1] != MAGIC[1] {
        return Err(NetError::protocol(format!(
            "bad magic 0x{:02x}{:02x}",
            head[0], head[1]
        )));
    }

    let flags = head[2];
    let status = head[3];
    let invoke_id = BigEndian::read_i64(&head[4..12]);
    let body_len = BigEndian::read_i32(&head[12..16]);
    if body_len < 0 {
        return Err(NetError::protocol(format!("negative body length {}", body_len)));
    }

    let kind = if flags & FLAG_HEARTBEAT != 0 {
        if flags & FLAG_REQUEST != 0 {
            FrameKind::HeartbeatRequest
        } else if status != STATUS_OK {
            return Err(NetError::protocol(format!(
                "heartbeat reply with status {}",
                status
            )));
        } else {
            FrameKind::HeartbeatResponse
        }
    } else if flags & FLAG_REQUEST != 0 {
        return Err(NetError::protocol("unexpected request frame from provider"));
    } else {
        FrameKind::Response { status }
    };

    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&head[4..12]);

    Ok(Header {
        kind,
        invoke_id,
        id_bytes,
        body_len: body_len as usize,
    })
}

/// Frames a request body: `DA BB C2 00`, the invocation id, the body length,
/// then the body itself.
pub fn encode_request(invoke_id: i64, body: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len());
    frame.put_slice(&MAGIC);
    frame.put_u8(REQUEST_FLAGS);
    frame.put_u8(0);
    frame.put_i64(invoke_id);
    frame.put_i32(body.len() as i32);
    frame.put_slice(body);
    frame
}

/// A heartbeat probe: `DA BB E2 00`, the invocation id, and no body.
pub fn encode_heartbeat_request(invoke_id: i64) -> [u8; HEADER_SIZE] {
    let mut frame = [0u8; HEADER_SIZE];
    frame[0] = MAGIC[0];
    frame[1] = MAGIC[1];
    frame[2] = HEARTBEAT_REQUEST_FLAGS;
    BigEndian::write_i64(&mut frame[4..12], invoke_id);
    frame
}

/// A heartbeat reply echoing the probe's id region, with the one-byte body
/// `N`.
pub fn encode_heartbeat_response(id_bytes: &[u8; 8]) -> [u8; HEADER_SIZE + 1] {
    let mut frame = [0u8; HEADER_SIZE + 1];
    frame[0] = MAGIC[0];
    frame[1] = MAGIC[1];
    frame[2] = HEARTBEAT_RESPONSE_FLAGS;
    frame[3] = STATUS_OK;
    frame[4..12].copy_from_slice(id_bytes);
    frame[15] = 1;
    frame[16] = b'N';
    frame
}
