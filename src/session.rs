//! Per-connection protocol state: handshake and response writing.

use crate::auth::{CredentialVerifier, generate_salt};
use crate::error::{ConnectionError, SqlError};
use crate::protocol::mysql::{
    DEFAULT_CAPABILITY, DEFAULT_CHARSET, DEFAULT_COLLATION_ID, HandshakeResponse, HandshakeV10,
    OkResult, SCRAMBLE_LEN, SERVER_STATUS_AUTOCOMMIT, encode_eof, encode_err,
    encode_handshake_v10, encode_ok, parse_handshake_response,
};
use crate::protocol::packet_io::{PacketIo, Transport};
use crate::state::{SessionHandle, SessionPhase};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    GreetingSent,
    AuthReceived,
    Accepted,
    Rejected,
}

/// One client connection, owned by its connection task.
///
/// Fields here are touched only by that task. The subset other tasks may
/// observe is published through [`SessionHandle`] under its lock.
pub struct ConnectionSession {
    io: PacketIo,
    handle: Arc<SessionHandle>,
    server_version: String,
    handshake_state: HandshakeState,
    capabilities: u32,
    status: u16,
    collation: u8,
    charset: &'static str,
    user: String,
    database: Option<String>,
    salt: [u8; SCRAMBLE_LEN],
    closed: bool,
    last_insert_id: u64,
    affected_rows: u64,
}

impl ConnectionSession {
    pub fn new<T: Transport>(
        stream: T,
        handle: Arc<SessionHandle>,
        server_version: impl Into<String>,
    ) -> Self {
        // A child token: closing the session cancels its own I/O without
        // marking the handle as killed.
        let io = PacketIo::new(stream, handle.cancellation_token().child_token());
        Self {
            io,
            handle,
            server_version: server_version.into(),
            handshake_state: HandshakeState::Start,
            // Replaced by the negotiated set once the client answers; until
            // then ERR packets use the server's own layout.
            capabilities: DEFAULT_CAPABILITY,
            status: SERVER_STATUS_AUTOCOMMIT,
            collation: DEFAULT_COLLATION_ID,
            charset: DEFAULT_CHARSET,
            user: String::new(),
            database: None,
            salt: generate_salt(),
            closed: false,
            last_insert_id: 0,
            affected_rows: 0,
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.handle.connection_id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.handle.remote_addr()
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake_state
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn collation(&self) -> u8 {
        self.collation
    }

    pub fn charset(&self) -> &str {
        self.charset
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Changes the current database and publishes it to the session handle.
    pub async fn set_database(&mut self, database: Option<String>) {
        self.handle.lock().await.database = database.clone();
        self.database = database;
    }

    pub fn salt(&self) -> &[u8; SCRAMBLE_LEN] {
        &self.salt
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn set_result(&mut self, affected_rows: u64, last_insert_id: u64) {
        self.affected_rows = affected_rows;
        self.last_insert_id = last_insert_id;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn sequence(&self) -> u8 {
        self.io.sequence()
    }

    pub fn reset_sequence(&mut self) {
        self.io.reset_sequence();
    }

    pub fn set_max_allowed_packet(&mut self, max_allowed_packet: usize) {
        self.io.set_max_payload(max_allowed_packet);
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    /// Runs the whole handshake. On `Err` the caller must close the session;
    /// the client has already been sent an ERR packet when one applies.
    pub async fn handshake(&mut self, verifier: &dyn CredentialVerifier) -> Result<(), ConnectionError> {
        self.write_initial_handshake().await?;

        let response = match self.read_handshake_response().await {
            Ok(response) => response,
            Err(e) => {
                self.handshake_state = HandshakeState::Rejected;
                if let ConnectionError::Malformed(reason) = e {
                    debug!(connection_id = self.connection_id(), reason, "malformed handshake response");
                    self.write_error_best_effort(&SqlError::bad_handshake()).await;
                }
                return Err(e);
            }
        };

        self.authenticate(&response, verifier).await
    }

    /// Start -> GreetingSent.
    pub async fn write_initial_handshake(&mut self) -> Result<(), ConnectionError> {
        debug!(connection_id = self.connection_id(), "sending initial handshake");
        let payload = encode_handshake_v10(&HandshakeV10 {
            server_version: &self.server_version,
            connection_id: self.connection_id(),
            salt: &self.salt,
            capability_flags: DEFAULT_CAPABILITY,
            collation: self.collation,
            status_flags: self.status,
        });
        self.io.write_packet(&payload).await?;
        self.handshake_state = HandshakeState::GreetingSent;
        Ok(())
    }

    /// GreetingSent -> AuthReceived. Negotiates capabilities and records the user.
    pub async fn read_handshake_response(&mut self) -> Result<HandshakeResponse, ConnectionError> {
        let payload = self.io.read_packet().await?;
        let response = parse_handshake_response(&payload, DEFAULT_CAPABILITY)?;
        debug!(
            connection_id = self.connection_id(),
            capabilities = response.capability_flags,
            max_packet_size = response.max_packet_size,
            character_set = response.character_set,
            "handshake response received"
        );

        self.capabilities = response.capability_flags;
        self.user = response.username.clone();
        self.handshake_state = HandshakeState::AuthReceived;
        Ok(response)
    }

    /// AuthReceived -> Accepted | Rejected.
    pub async fn authenticate(
        &mut self,
        response: &HandshakeResponse,
        verifier: &dyn CredentialVerifier,
    ) -> Result<(), ConnectionError> {
        if !verifier.verify(&response.username, &self.salt, &response.auth_response) {
            self.handshake_state = HandshakeState::Rejected;
            let err = SqlError::access_denied(
                &response.username,
                &self.remote_addr().to_string(),
                true,
            );
            warn!(
                connection_id = self.connection_id(),
                user = %response.username,
                remote_addr = %self.remote_addr(),
                "access denied"
            );
            self.write_error_best_effort(&err).await;
            return Err(err.into());
        }

        self.database = response.database.clone();
        {
            let mut info = self.handle.lock().await;
            info.user = Some(self.user.clone());
            info.database = self.database.clone();
            info.status_flags = self.status;
            info.phase = SessionPhase::Idle;
        }

        self.write_ok(None).await?;
        self.handshake_state = HandshakeState::Accepted;
        self.io.reset_sequence();
        Ok(())
    }

    // ========================================================================
    // Command I/O
    // ========================================================================

    pub async fn read_packet(&mut self) -> Result<Bytes, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.io.read_packet().await
    }

    /// Writes a raw payload, for dispatchers emitting their own packets.
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.closed {
            return Ok(());
        }
        self.io.write_packet(payload).await
    }

    pub async fn write_packet_batch(
        &mut self,
        acc: BytesMut,
        payload: &[u8],
        flush: bool,
    ) -> Result<BytesMut, ConnectionError> {
        if self.closed {
            return Ok(acc);
        }
        self.io.write_packet_batch(acc, payload, flush).await
    }

    /// Sends an OK packet. Without a result, reports the current status with
    /// zero affected rows and insert id.
    pub async fn write_ok(&mut self, result: Option<&OkResult>) -> Result<(), ConnectionError> {
        let synthesized;
        let result = match result {
            Some(r) => r,
            None => {
                synthesized = OkResult {
                    status: self.status,
                    ..Default::default()
                };
                &synthesized
            }
        };
        let payload = encode_ok(self.capabilities, result);
        self.write_packet(&payload).await
    }

    pub async fn write_error(&mut self, err: &SqlError) -> Result<(), ConnectionError> {
        let payload = encode_err(self.capabilities, err);
        self.write_packet(&payload).await
    }

    async fn write_error_best_effort(&mut self, err: &SqlError) {
        if let Err(e) = self.write_error(err).await {
            debug!(connection_id = self.connection_id(), error = %e, "could not deliver error packet");
        }
    }

    pub async fn write_eof(&mut self, status: u16) -> Result<(), ConnectionError> {
        let payload = encode_eof(self.capabilities, status);
        self.write_packet(&payload).await
    }

    /// Appends an EOF to `acc`, sending everything accumulated when `flush` is set.
    pub async fn write_eof_batch(
        &mut self,
        acc: BytesMut,
        status: u16,
        flush: bool,
    ) -> Result<BytesMut, ConnectionError> {
        let payload = encode_eof(self.capabilities, status);
        self.write_packet_batch(acc, &payload, flush).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub(crate) async fn begin_command(&mut self) {
        let mut info = self.handle.lock().await;
        info.phase = SessionPhase::Command;
        info.commands += 1;
        info.last_command_at = Some(Utc::now());
    }

    pub(crate) async fn finish_command(&mut self) {
        let mut info = self.handle.lock().await;
        if info.phase != SessionPhase::Closed {
            info.phase = SessionPhase::Idle;
        }
        info.status_flags = self.status;
    }

    /// Releases the transport. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.io.shutdown().await;
        self.handle.lock().await.phase = SessionPhase::Closed;
        debug!(connection_id = self.connection_id(), "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticAccounts, scramble_password};
    use crate::protocol::mysql::{
        CLIENT_CONNECT_WITH_DB, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION, ER_ACCESS_DENIED_ERROR,
        ER_HANDSHAKE_ERROR, decode_ok,
    };
    use crate::protocol::packet_io::tests::CountingStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const CLIENT_CAPS: u32 = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_CONNECT_WITH_DB;

    fn new_session(stream: impl Transport) -> ConnectionSession {
        let handle = SessionHandle::new(10001, "127.0.0.1:50000".parse().unwrap());
        ConnectionSession::new(stream, handle, "5.7.0-test")
    }

    async fn read_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        client.read_exact(&mut header).await.unwrap();
        let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();
        (header[3], payload)
    }

    async fn write_frame(client: &mut DuplexStream, seq: u8, payload: &[u8]) {
        let len = payload.len();
        client
            .write_all(&[len as u8, (len >> 8) as u8, (len >> 16) as u8, seq])
            .await
            .unwrap();
        client.write_all(payload).await.unwrap();
    }

    fn salt_from_greeting(greeting: &[u8]) -> Vec<u8> {
        let version_end = greeting.iter().position(|&b| b == 0).unwrap();
        let part1 = version_end + 1 + 4;
        let mut salt = greeting[part1..part1 + 8].to_vec();
        let part2 = part1 + 8 + 1 + 2 + 1 + 2 + 2 + 1 + 10;
        salt.extend_from_slice(&greeting[part2..part2 + 12]);
        salt
    }

    fn response(user: &str, auth: &[u8], db: Option<&str>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&CLIENT_CAPS.to_le_bytes());
        buf.extend_from_slice(&(1u32 << 24).to_le_bytes());
        buf.push(33);
        buf.extend_from_slice(&[0u8; 23]);
        buf.extend_from_slice(user.as_bytes());
        buf.push(0);
        buf.push(auth.len() as u8);
        buf.extend_from_slice(auth);
        if let Some(db) = db {
            buf.extend_from_slice(db.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[tokio::test]
    async fn test_successful_login() {
        let (server, mut client) = tokio::io::duplex(4096);
        let mut session = new_session(server);
        let accounts = StaticAccounts::new([("root", "123")]);

        let server_task = tokio::spawn(async move {
            let res = session.handshake(&accounts).await;
            (session, res)
        });

        let (seq, greeting) = read_frame(&mut client).await;
        assert_eq!(seq, 0);
        let salt = salt_from_greeting(&greeting);
        assert_eq!(salt.len(), 20);

        let auth = scramble_password(&salt, b"123");
        write_frame(&mut client, 1, &response("root", &auth, Some("shop"))).await;

        let (seq, ok) = read_frame(&mut client).await;
        assert_eq!(seq, 2);
        assert_eq!(ok[0], 0x00);
        let ok = decode_ok(&ok, CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(ok.status, SERVER_STATUS_AUTOCOMMIT);

        let (session, res) = server_task.await.unwrap();
        res.unwrap();
        assert_eq!(session.handshake_state(), HandshakeState::Accepted);
        assert_eq!(session.sequence(), 0);
        assert_eq!(session.user(), "root");
        assert_eq!(session.database(), Some("shop"));
        assert_eq!(session.capabilities(), CLIENT_CAPS);
        assert_eq!(session.collation(), DEFAULT_COLLATION_ID);
        assert_eq!(session.charset(), DEFAULT_CHARSET);
        assert_eq!(&salt[..], &session.salt()[..]);

        let info = session.handle().snapshot().await;
        assert_eq!(info.user.as_deref(), Some("root"));
        assert_eq!(info.phase, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_wrong_password_sends_access_denied() {
        let (server, mut client) = tokio::io::duplex(4096);
        let mut session = new_session(server);
        let accounts = StaticAccounts::new([("root", "123")]);

        let server_task = tokio::spawn(async move {
            let res = session.handshake(&accounts).await;
            (session, res)
        });

        let (_, greeting) = read_frame(&mut client).await;
        let auth = scramble_password(&salt_from_greeting(&greeting), b"wrong");
        write_frame(&mut client, 1, &response("root", &auth, None)).await;

        let (seq, err) = read_frame(&mut client).await;
        assert_eq!(seq, 2);
        assert_eq!(err[0], 0xff);
        assert_eq!(u16::from_le_bytes([err[1], err[2]]), ER_ACCESS_DENIED_ERROR);
        assert_eq!(&err[3..9], b"#28000");
        let message = String::from_utf8(err[9..].to_vec()).unwrap();
        assert_eq!(
            message,
            "Access denied for user 'root'@'127.0.0.1:50000' (using password: YES)"
        );

        let (session, res) = server_task.await.unwrap();
        assert!(matches!(res, Err(ConnectionError::Sql(ref e)) if e.code == ER_ACCESS_DENIED_ERROR));
        assert_eq!(session.handshake_state(), HandshakeState::Rejected);
    }

    #[tokio::test]
    async fn test_malformed_response_sends_bad_handshake() {
        let (server, mut client) = tokio::io::duplex(4096);
        let mut session = new_session(server);
        let accounts = StaticAccounts::new([("root", "123")]);

        let server_task = tokio::spawn(async move { session.handshake(&accounts).await });

        read_frame(&mut client).await;
        let mut bad = response("root", &[], None);
        bad.truncate(34); // user name without its terminator
        write_frame(&mut client, 1, &bad).await;

        let (_, err) = read_frame(&mut client).await;
        assert_eq!(u16::from_le_bytes([err[1], err[2]]), ER_HANDSHAKE_ERROR);
        assert!(matches!(
            server_task.await.unwrap(),
            Err(ConnectionError::Malformed("unterminated user name"))
        ));
    }

    #[tokio::test]
    async fn test_write_ok_synthesizes_from_status() {
        let (server, mut client) = tokio::io::duplex(4096);
        let mut session = new_session(server);
        session.set_status(0x0003);

        session.write_ok(None).await.unwrap();
        let (_, ok) = read_frame(&mut client).await;
        let ok = decode_ok(&ok, session.capabilities()).unwrap();
        assert_eq!(ok, OkResult { affected_rows: 0, last_insert_id: 0, status: 0x0003 });

        let result = OkResult { affected_rows: 5, last_insert_id: 42, status: 0x0002 };
        session.write_ok(Some(&result)).await.unwrap();
        let (seq, ok) = read_frame(&mut client).await;
        assert_eq!(seq, 1);
        assert_eq!(decode_ok(&ok, session.capabilities()).unwrap(), result);
    }

    #[tokio::test]
    async fn test_eof_batch_single_write() {
        let (server, mut client) = tokio::io::duplex(4096);
        let writes = Arc::new(AtomicUsize::new(0));
        let mut session = new_session(CountingStream { inner: server, writes: writes.clone() });

        let acc = session.write_packet_batch(BytesMut::new(), b"\x01a", false).await.unwrap();
        let acc = session.write_packet_batch(acc, b"\x01b", false).await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 0);
        assert_eq!(acc.len(), 6 + 6);

        let acc = session.write_eof_batch(acc, SERVER_STATUS_AUTOCOMMIT, true).await.unwrap();
        assert!(acc.is_empty());
        assert_eq!(writes.load(Ordering::SeqCst), 1);

        assert_eq!(read_frame(&mut client).await, (0, b"\x01a".to_vec()));
        assert_eq!(read_frame(&mut client).await, (1, b"\x01b".to_vec()));
        assert_eq!(read_frame(&mut client).await, (2, vec![0xfe, 0, 0, 0x02, 0]));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (server, mut client) = tokio::io::duplex(64);
        let mut session = new_session(server);

        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert_eq!(session.handle().snapshot().await.phase, SessionPhase::Closed);
        assert!(!session.handle().is_killed());

        // Writes after close are no-ops and the peer sees EOF.
        session.write_ok(None).await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(matches!(session.read_packet().await, Err(ConnectionError::Closed)));
    }
}
