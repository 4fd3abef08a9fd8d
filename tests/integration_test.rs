//! Integration tests for the MySQL wire server.
//!
//! Each test starts the server (and, where needed, the management API) on
//! ephemeral ports in-process and talks to it over real TCP sockets.

use mysql_wire_server::auth::scramble_password;
use mysql_wire_server::config::{AccountConfig, ApiConfig, AppConfig};
use mysql_wire_server::dispatcher::BasicDispatcher;
use mysql_wire_server::protocol::mysql::{
    CLIENT_CONNECT_WITH_DB, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION, COM_PING, COM_QUIT,
    PROTOCOL_VERSION, decode_ok,
};
use mysql_wire_server::state::AppState;
use mysql_wire_server::{api, server};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);

fn config(api_key: Option<&str>) -> AppConfig {
    AppConfig {
        accounts: vec![AccountConfig {
            user: "root".to_string(),
            password: "123".to_string(),
        }],
        api: api_key.map(|k| ApiConfig {
            api_key: Some(k.to_string()),
        }),
        ..Default::default()
    }
}

async fn start_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, state, Arc::new(BasicDispatcher)));
    addr
}

async fn start_api(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, api::router(state)).await });
    addr
}

async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    timeout(TIMEOUT, stream.read_exact(&mut header))
        .await
        .expect("timed out waiting for a packet")
        .ok()?;
    let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.ok()?;
    Some((header[3], payload))
}

async fn write_packet(stream: &mut TcpStream, seq: u8, payload: &[u8]) {
    let len = payload.len();
    stream
        .write_all(&[len as u8, (len >> 8) as u8, (len >> 16) as u8, seq])
        .await
        .unwrap();
    stream.write_all(payload).await.unwrap();
}

struct Greeting {
    connection_id: u32,
    salt: Vec<u8>,
}

fn parse_greeting(payload: &[u8]) -> Greeting {
    assert_eq!(payload[0], PROTOCOL_VERSION);
    let version_end = payload.iter().position(|&b| b == 0).unwrap();
    let id_at = version_end + 1;
    let connection_id = u32::from_le_bytes(payload[id_at..id_at + 4].try_into().unwrap());
    let part1 = id_at + 4;
    let mut salt = payload[part1..part1 + 8].to_vec();
    salt.extend_from_slice(&payload[part1 + 27..part1 + 39]);
    Greeting {
        connection_id,
        salt,
    }
}

/// Runs the client side of the handshake and returns the server's reply.
async fn login(
    addr: SocketAddr,
    user: &str,
    password: &str,
    database: Option<&str>,
) -> (TcpStream, Greeting, Vec<u8>) {
    let mut stream = timeout(TIMEOUT, TcpStream::connect(addr))
        .await
        .unwrap()
        .unwrap();
    let (seq, payload) = read_packet(&mut stream).await.unwrap();
    assert_eq!(seq, 0);
    let greeting = parse_greeting(&payload);

    let auth = scramble_password(&greeting.salt, password.as_bytes());
    let caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_CONNECT_WITH_DB;
    let mut response = Vec::new();
    response.extend_from_slice(&caps.to_le_bytes());
    response.extend_from_slice(&(16u32 << 20).to_le_bytes());
    response.push(33);
    response.extend_from_slice(&[0u8; 23]);
    response.extend_from_slice(user.as_bytes());
    response.push(0);
    response.push(auth.len() as u8);
    response.extend_from_slice(&auth);
    if let Some(db) = database {
        response.extend_from_slice(db.as_bytes());
        response.push(0);
    }
    write_packet(&mut stream, 1, &response).await;

    let (seq, reply) = read_packet(&mut stream).await.unwrap();
    assert_eq!(seq, 2);
    (stream, greeting, reply)
}

mod protocol_tests {
    use super::*;

    #[tokio::test]
    async fn test_login_and_ping() {
        let addr = start_server(AppState::new(config(None))).await;
        let (mut stream, greeting, reply) = login(addr, "root", "123", Some("shop")).await;

        assert_eq!(greeting.salt.len(), 20);
        assert_eq!(reply[0], 0x00);

        for _ in 0..2 {
            write_packet(&mut stream, 0, &[COM_PING]).await;
            let (seq, ok) = read_packet(&mut stream).await.unwrap();
            assert_eq!(seq, 1);
            decode_ok(&ok, CLIENT_PROTOCOL_41).unwrap();
        }

        write_packet(&mut stream, 0, &[COM_QUIT]).await;
        assert!(read_packet(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_wrong_password_is_denied_and_closed() {
        let addr = start_server(AppState::new(config(None))).await;
        let (mut stream, _, reply) = login(addr, "root", "456", None).await;

        assert_eq!(reply[0], 0xff);
        assert_eq!(u16::from_le_bytes([reply[1], reply[2]]), 1045);
        assert_eq!(&reply[3..9], b"#28000");
        let message = String::from_utf8_lossy(&reply[9..]).to_string();
        assert!(message.starts_with("Access denied for user 'root'@'127.0.0.1:"));
        assert!(message.ends_with("(using password: YES)"));

        assert!(read_packet(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_user_is_denied() {
        let addr = start_server(AppState::new(config(None))).await;
        let (_, _, reply) = login(addr, "admin", "123", None).await;
        assert_eq!(u16::from_le_bytes([reply[1], reply[2]]), 1045);
    }

    #[tokio::test]
    async fn test_connection_ids_are_distinct() {
        let addr = start_server(AppState::new(config(None))).await;
        let (_a, first, _) = login(addr, "root", "123", None).await;
        let (_b, second, _) = login(addr, "root", "123", None).await;

        assert_ne!(first.connection_id, second.connection_id);
        assert!(first.connection_id >= 10000);
        assert_ne!(first.salt, second.salt);
    }
}

mod api_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        let api_addr = start_api(AppState::new(config(None))).await;

        let resp = reqwest::get(format!("http://{}/health", api_addr)).await.unwrap();
        assert!(resp.status().is_success());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_connections"], 0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_without_recorder() {
        let api_addr = start_api(AppState::new(config(None))).await;
        let resp = reqwest::get(format!("http://{}/metrics", api_addr)).await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_list_and_kill_connection() {
        let state = AppState::new(config(None));
        let addr = start_server(state.clone()).await;
        let api_addr = start_api(state.clone()).await;

        let (mut stream, greeting, _) = login(addr, "root", "123", Some("shop")).await;
        let client = reqwest::Client::new();

        let body: serde_json::Value = client
            .get(format!("http://{}/connections", api_addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["active_connections"], 1);
        assert_eq!(body["connections"][0]["connection_id"], greeting.connection_id);
        assert_eq!(body["connections"][0]["user"], "root");
        assert_eq!(body["connections"][0]["database"], "shop");
        assert_eq!(body["connections"][0]["phase"], "idle");

        let resp = client
            .delete(format!("http://{}/connections/{}", api_addr, greeting.connection_id))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert!(read_packet(&mut stream).await.is_none());

        let resp = client
            .delete(format!("http://{}/connections/{}", api_addr, greeting.connection_id + 1000))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_connections_require_api_key_when_configured() {
        let api_addr = start_api(AppState::new(config(Some("test-api-key-12345")))).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("http://{}/connections", api_addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401);

        let resp = client
            .get(format!("http://{}/connections", api_addr))
            .header("X-API-Key", "test-api-key-12345")
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
    }
}
