//! MySQL Wire Protocol implementation, server side.
//!
//! Packet framing, the initial handshake packets and the OK / ERR / EOF
//! response payloads.
//! Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basics.html

use crate::error::{ConnectionError, SqlError};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const PROTOCOL_VERSION: u8 = 10;
pub const DEFAULT_SERVER_VERSION: &str = "5.7.0-mysql-wire-server";

/// Largest payload a single physical packet can carry.
pub const MAX_PAYLOAD_LEN: usize = 0xff_ffff;
/// Default cap on a reassembled client payload (MySQL's `max_allowed_packet`).
pub const DEFAULT_MAX_ALLOWED_PACKET: usize = 64 * 1024 * 1024;

pub const OK_HEADER: u8 = 0x00;
pub const ERR_HEADER: u8 = 0xff;
pub const EOF_HEADER: u8 = 0xfe;

// Capability flags
pub const CLIENT_LONG_PASSWORD: u32 = 1;
pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;

pub const DEFAULT_CAPABILITY: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION;

// Server status flags
pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;

/// utf8_general_ci
pub const DEFAULT_COLLATION_ID: u8 = 33;
pub const DEFAULT_CHARSET: &str = "utf8";

/// Length of the per-connection scramble.
pub const SCRAMBLE_LEN: usize = 20;
/// Kept at 0x15 for wire compatibility with existing clients, whatever the salt length.
pub const AUTH_PLUGIN_DATA_LEN: u8 = 0x15;

// Commands
pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_PING: u8 = 0x0e;

// Error codes
pub const ER_HANDSHAKE_ERROR: u16 = 1043;
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
pub const ER_NO_DB_ERROR: u16 = 1046;
pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
pub const ER_BAD_DB_ERROR: u16 = 1049;
pub const ER_UNKNOWN_ERROR: u16 = 1105;
pub const ER_NET_PACKET_TOO_LARGE: u16 = 1153;
pub const ER_NET_PACKETS_OUT_OF_ORDER: u16 = 1156;
pub const ER_MALFORMED_PACKET: u16 = 1835;

/// One physical packet as read off the wire.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub sequence_id: u8,
    pub payload: BytesMut,
}

/// One physical packet to be framed.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingPacket<'a> {
    pub sequence_id: u8,
    pub payload: &'a [u8],
}

/// Framing codec: 3-byte little-endian payload length + 1-byte sequence id.
///
/// Sequence validation and multi-packet reassembly live in
/// [`PacketIo`](crate::protocol::packet_io::PacketIo); the codec only cuts frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = RawPacket;
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let payload_len = (src[0] as usize) | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
        let sequence_id = src[3];

        let total_len = 4 + payload_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut packet = src.split_to(total_len);
        packet.advance(4);

        Ok(Some(RawPacket {
            sequence_id,
            payload: packet,
        }))
    }
}

impl Encoder<OutgoingPacket<'_>> for PacketCodec {
    type Error = ConnectionError;

    fn encode(&mut self, item: OutgoingPacket<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ConnectionError::Malformed("payload exceeds a single packet"));
        }
        dst.reserve(4 + item.payload.len());
        write_packet_header(dst, item.payload.len(), item.sequence_id);
        dst.put_slice(item.payload);
        Ok(())
    }
}

// ============================================================================
// Bounds-checked payload cursor
// ============================================================================

/// Cursor over an untrusted payload. Every read checks the remaining length
/// and fails with [`ConnectionError::Malformed`] instead of reading past the end.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, n: usize, what: &'static str) -> Result<(), ConnectionError> {
        if self.buf.remaining() < n {
            return Err(ConnectionError::Malformed(what));
        }
        Ok(())
    }

    pub fn read_u8(&mut self, what: &'static str) -> Result<u8, ConnectionError> {
        self.ensure(1, what)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16_le(&mut self, what: &'static str) -> Result<u16, ConnectionError> {
        self.ensure(2, what)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32_le(&mut self, what: &'static str) -> Result<u32, ConnectionError> {
        self.ensure(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn skip(&mut self, n: usize, what: &'static str) -> Result<(), ConnectionError> {
        self.ensure(n, what)?;
        self.buf.advance(n);
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ConnectionError> {
        self.ensure(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Reads up to the next NUL and consumes it.
    pub fn read_null_terminated(&mut self, what: &'static str) -> Result<&'a [u8], ConnectionError> {
        let pos = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(ConnectionError::Malformed(what))?;
        let (head, tail) = self.buf.split_at(pos);
        self.buf = &tail[1..];
        Ok(head)
    }

    pub fn read_lenenc_int(&mut self, what: &'static str) -> Result<u64, ConnectionError> {
        let (val, consumed) = read_lenenc_int(self.buf).ok_or(ConnectionError::Malformed(what))?;
        self.buf.advance(consumed);
        Ok(val)
    }
}

// ============================================================================
// Length-encoded integers
// ============================================================================

/// Decodes a length-encoded integer, returning the value and the bytes consumed.
pub fn read_lenenc_int(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let width = match first {
        0..=0xfa => return Some((first as u64, 1)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        // 0xfb is NULL in row data and 0xff an ERR header; neither is an integer.
        0xfb | 0xff => return None,
    };
    let bytes = buf.get(1..1 + width)?;
    let val = bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc | ((b as u64) << (8 * i)));
    Some((val, 1 + width))
}

pub fn write_lenenc_int(dst: &mut BytesMut, val: u64) {
    if val < 251 {
        dst.put_u8(val as u8);
    } else if val < 65536 {
        dst.put_u8(0xfc);
        dst.put_u16_le(val as u16);
    } else if val < 16777216 {
        dst.put_u8(0xfd);
        dst.put_u8((val & 0xff) as u8);
        dst.put_u8(((val >> 8) & 0xff) as u8);
        dst.put_u8(((val >> 16) & 0xff) as u8);
    } else {
        dst.put_u8(0xfe);
        dst.put_u64_le(val);
    }
}

fn write_packet_header(dst: &mut BytesMut, payload_len: usize, sequence_id: u8) {
    dst.put_u8((payload_len & 0xff) as u8);
    dst.put_u8(((payload_len >> 8) & 0xff) as u8);
    dst.put_u8(((payload_len >> 16) & 0xff) as u8);
    dst.put_u8(sequence_id);
}

// ============================================================================
// Handshake
// ============================================================================

/// Initial handshake greeting (server -> client), protocol version 10.
#[derive(Debug, Clone)]
pub struct HandshakeV10<'a> {
    pub server_version: &'a str,
    pub connection_id: u32,
    pub salt: &'a [u8; SCRAMBLE_LEN],
    pub capability_flags: u32,
    pub collation: u8,
    pub status_flags: u16,
}

pub fn encode_handshake_v10(h: &HandshakeV10<'_>) -> BytesMut {
    let mut payload = BytesMut::with_capacity(64 + h.server_version.len());
    payload.put_u8(PROTOCOL_VERSION);
    payload.put_slice(h.server_version.as_bytes());
    payload.put_u8(0);
    payload.put_u32_le(h.connection_id);
    payload.put_slice(&h.salt[..8]);
    payload.put_u8(0); // filler
    payload.put_u16_le((h.capability_flags & 0xffff) as u16);
    payload.put_u8(h.collation);
    payload.put_u16_le(h.status_flags);
    payload.put_u16_le(((h.capability_flags >> 16) & 0xffff) as u16);
    payload.put_u8(AUTH_PLUGIN_DATA_LEN);
    payload.put_slice(&[0u8; 10]); // reserved
    payload.put_slice(&h.salt[8..]);
    payload.put_u8(0);
    payload
}

/// Client response to the greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Client-declared flags intersected with the server's.
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
}

/// Parses a HandshakeResponse41 payload against the server's capabilities.
pub fn parse_handshake_response(
    payload: &[u8],
    server_capabilities: u32,
) -> Result<HandshakeResponse, ConnectionError> {
    let mut reader = PayloadReader::new(payload);

    let client_capabilities = reader.read_u32_le("truncated capability flags")?;
    let capability_flags = client_capabilities & server_capabilities;
    let max_packet_size = reader.read_u32_le("truncated max packet size")?;
    let character_set = reader.read_u8("truncated character set")?;
    reader.skip(23, "truncated reserved bytes")?;

    let username = reader.read_null_terminated("unterminated user name")?;
    let username = String::from_utf8_lossy(username).into_owned();

    let auth_len = reader.read_u8("missing auth response length")? as usize;
    let auth_response = reader
        .read_bytes(auth_len, "auth response exceeds payload")?
        .to_vec();

    let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && reader.remaining() > 0 {
        let db = reader.read_null_terminated("unterminated database name")?;
        Some(String::from_utf8_lossy(db).into_owned()).filter(|db| !db.is_empty())
    } else {
        None
    };

    Ok(HandshakeResponse {
        capability_flags,
        max_packet_size,
        character_set,
        username,
        auth_response,
        database,
    })
}

// ============================================================================
// Response packets
// ============================================================================

/// Outcome reported by an OK packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OkResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
}

pub fn encode_ok(capability_flags: u32, r: &OkResult) -> BytesMut {
    let mut payload = BytesMut::with_capacity(32);
    payload.put_u8(OK_HEADER);
    write_lenenc_int(&mut payload, r.affected_rows);
    write_lenenc_int(&mut payload, r.last_insert_id);

    if capability_flags & CLIENT_PROTOCOL_41 != 0 {
        payload.put_u16_le(r.status);
        payload.put_u16_le(0); // warnings
    }
    payload
}

/// Reads an OK payload back into an [`OkResult`].
pub fn decode_ok(payload: &[u8], capability_flags: u32) -> Result<OkResult, ConnectionError> {
    let mut reader = PayloadReader::new(payload);
    if reader.read_u8("empty OK packet")? != OK_HEADER {
        return Err(ConnectionError::Malformed("not an OK packet"));
    }
    let affected_rows = reader.read_lenenc_int("truncated affected rows")?;
    let last_insert_id = reader.read_lenenc_int("truncated last insert id")?;
    let status = if capability_flags & CLIENT_PROTOCOL_41 != 0 {
        let status = reader.read_u16_le("truncated status flags")?;
        reader.skip(2, "truncated warning count")?;
        status
    } else {
        0
    };
    Ok(OkResult {
        affected_rows,
        last_insert_id,
        status,
    })
}

pub fn encode_err(capability_flags: u32, e: &SqlError) -> BytesMut {
    let mut payload = BytesMut::with_capacity(16 + e.message.len());
    payload.put_u8(ERR_HEADER);
    payload.put_u16_le(e.code);

    if capability_flags & CLIENT_PROTOCOL_41 != 0 {
        payload.put_u8(b'#');
        payload.put_slice(&e.state);
    }

    payload.put_slice(e.message.as_bytes());
    payload
}

pub fn encode_eof(capability_flags: u32, status: u16) -> BytesMut {
    let mut payload = BytesMut::with_capacity(5);
    payload.put_u8(EOF_HEADER);
    if capability_flags & CLIENT_PROTOCOL_41 != 0 {
        payload.put_u16_le(0); // warnings
        payload.put_u16_le(status);
    }
    payload
}
