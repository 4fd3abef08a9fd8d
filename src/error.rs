//! Error types shared by the handshake, the packet transport and the command loop.

use crate::protocol::mysql::{
    ER_ACCESS_DENIED_ERROR, ER_BAD_DB_ERROR, ER_HANDSHAKE_ERROR, ER_MALFORMED_PACKET,
    ER_NET_PACKET_TOO_LARGE, ER_NET_PACKETS_OUT_OF_ORDER, ER_NO_DB_ERROR, ER_UNKNOWN_COM_ERROR,
    ER_UNKNOWN_ERROR,
};
use thiserror::Error;

/// A structured MySQL error: everything an ERR packet carries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("ERROR {} ({}): {}", .code, String::from_utf8_lossy(.state), .message)]
pub struct SqlError {
    pub code: u16,
    pub state: [u8; 5],
    pub message: String,
}

impl SqlError {
    /// Builds an error with the SQL state MySQL associates with `code`.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            state: sql_state_for(code),
            message: message.into(),
        }
    }

    pub fn access_denied(user: &str, host: &str, using_password: bool) -> Self {
        let using = if using_password { "YES" } else { "NO" };
        Self::new(
            ER_ACCESS_DENIED_ERROR,
            format!("Access denied for user '{user}'@'{host}' (using password: {using})"),
        )
    }

    pub fn bad_handshake() -> Self {
        Self::new(ER_HANDSHAKE_ERROR, "Bad handshake")
    }

    pub fn malformed_packet() -> Self {
        Self::new(ER_MALFORMED_PACKET, "Malformed communication packet")
    }

    pub fn unknown_command(command: u8) -> Self {
        Self::new(ER_UNKNOWN_COM_ERROR, format!("Unknown command 0x{command:02x}"))
    }

    /// Wraps an arbitrary message as `ER_UNKNOWN_ERROR`.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ER_UNKNOWN_ERROR, message)
    }

    /// Recovers the structured error behind `err`, or wraps its text as an
    /// unknown error so the ERR packet layout always holds.
    pub fn from_error(err: &anyhow::Error) -> Self {
        if let Some(sql) = err.downcast_ref::<SqlError>() {
            return sql.clone();
        }
        if let Some(conn) = err.downcast_ref::<ConnectionError>() {
            return conn.to_sql_error();
        }
        Self::unknown(err.to_string())
    }
}

fn sql_state_for(code: u16) -> [u8; 5] {
    match code {
        ER_ACCESS_DENIED_ERROR => *b"28000",
        ER_HANDSHAKE_ERROR
        | ER_UNKNOWN_COM_ERROR
        | ER_NET_PACKETS_OUT_OF_ORDER
        | ER_NET_PACKET_TOO_LARGE => *b"08S01",
        ER_NO_DB_ERROR => *b"3D000",
        ER_BAD_DB_ERROR => *b"42000",
        _ => *b"HY000",
    }
}

/// Failures that end a connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("packets out of order: expected sequence {expected}, got {actual}")]
    OutOfOrder { expected: u8, actual: u8 },
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("packet of {len} bytes exceeds the {limit}-byte limit")]
    PacketTooLarge { len: usize, limit: usize },
    #[error(transparent)]
    Sql(#[from] SqlError),
}

impl ConnectionError {
    pub fn to_sql_error(&self) -> SqlError {
        match self {
            Self::Sql(e) => e.clone(),
            Self::Malformed(_) => SqlError::malformed_packet(),
            Self::OutOfOrder { .. } => {
                SqlError::new(ER_NET_PACKETS_OUT_OF_ORDER, "Got packets out of order")
            }
            Self::PacketTooLarge { .. } => SqlError::new(
                ER_NET_PACKET_TOO_LARGE,
                "Got a packet bigger than 'max_allowed_packet' bytes",
            ),
            other => SqlError::unknown(other.to_string()),
        }
    }

    /// True when the transport itself is gone or unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Closed | Self::OutOfOrder { .. } | Self::PacketTooLarge { .. }
        )
    }
}
