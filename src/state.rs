use crate::auth::{CredentialVerifier, StaticAccounts};
use crate::config::AppConfig;
use crate::metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// First connection id handed out by a fresh allocator.
pub const BASE_CONNECTION_ID: u32 = 10000;

/// Process-wide source of connection ids. Each id is handed out once.
///
/// The counter is wider than the id so it never wraps back into ids
/// already issued; once `u32::MAX` has been handed out every later call
/// returns `None`.
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    next: AtomicU64,
}

impl ConnectionIdAllocator {
    pub fn new(start: u32) -> Self {
        Self {
            next: AtomicU64::new(start as u64),
        }
    }

    pub fn allocate(&self) -> Option<u32> {
        u32::try_from(self.next.fetch_add(1, Ordering::Relaxed)).ok()
    }
}

impl Default for ConnectionIdAllocator {
    fn default() -> Self {
        Self::new(BASE_CONNECTION_ID)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Handshake,
    Idle,
    Command,
    Closed,
}

/// Session fields visible outside the connection's own task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub connection_id: u32,
    pub remote_addr: String,
    pub user: Option<String>,
    pub database: Option<String>,
    pub status_flags: u16,
    pub phase: SessionPhase,
    pub commands: u64,
    pub connected_at: DateTime<Utc>,
    pub last_command_at: Option<DateTime<Utc>>,
}

/// Shared half of a connection session.
///
/// `lock()` is the per-session lock: anything outside the owning command
/// loop (admin inspection, forced close) must hold it to read or change
/// [`SessionInfo`]. Capabilities, the salt, the sequence counter and the
/// transport stay private to the command loop and are never reachable here.
#[derive(Debug)]
pub struct SessionHandle {
    connection_id: u32,
    remote_addr: SocketAddr,
    kill: CancellationToken,
    info: Mutex<SessionInfo>,
}

impl SessionHandle {
    pub fn new(connection_id: u32, remote_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            connection_id,
            remote_addr,
            kill: CancellationToken::new(),
            info: Mutex::new(SessionInfo {
                connection_id,
                remote_addr: remote_addr.to_string(),
                user: None,
                database: None,
                status_flags: 0,
                phase: SessionPhase::Handshake,
                commands: 0,
                connected_at: Utc::now(),
                last_command_at: None,
            }),
        })
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionInfo> {
        self.info.lock().await
    }

    pub async fn snapshot(&self) -> SessionInfo {
        self.lock().await.clone()
    }

    /// Forced close from another task. Pending reads and writes on the
    /// connection fail promptly and its command loop ends.
    pub async fn kill(&self) {
        let mut info = self.lock().await;
        info.phase = SessionPhase::Closed;
        self.kill.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.kill.clone()
    }
}

/// Live sessions by connection id.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<u32, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    /// Registers `handle` until the returned guard is dropped.
    pub fn register(&self, handle: Arc<SessionHandle>) -> RegistrationGuard {
        let connection_id = handle.connection_id();
        self.sessions.insert(connection_id, handle);
        metrics::record_connection_opened();
        RegistrationGuard {
            registry: self.clone(),
            connection_id,
        }
    }

    pub fn get(&self, connection_id: u32) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&connection_id).map(|h| h.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshots of every live session, ordered by connection id.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.iter().map(|h| h.value().clone()).collect();
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            infos.push(handle.snapshot().await);
        }
        infos.sort_by_key(|i| i.connection_id);
        infos
    }

    /// Returns false when no such session is live.
    pub async fn kill(&self, connection_id: u32) -> bool {
        match self.get(connection_id) {
            Some(handle) => {
                handle.kill().await;
                tracing::info!(connection_id, "connection killed");
                true
            }
            None => false,
        }
    }

    fn remove(&self, connection_id: u32) {
        self.sessions.remove(&connection_id);
    }
}

/// Removes a session from the registry when the connection task ends,
/// including when it unwinds.
pub struct RegistrationGuard {
    registry: SessionRegistry,
    connection_id: u32,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.remove(self.connection_id);
        metrics::record_connection_closed();
        tracing::debug!(connection_id = self.connection_id, "session unregistered");
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub connection_ids: Arc<ConnectionIdAllocator>,
    pub sessions: SessionRegistry,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub metrics_handle: Option<Arc<PrometheusHandle>>,
}

impl AppState {
    /// State whose accounts come from `config.accounts`.
    pub fn new(config: AppConfig) -> Self {
        let verifier = Arc::new(StaticAccounts::from_config(&config.accounts));
        Self::with_verifier(config, verifier)
    }

    pub fn with_verifier(config: AppConfig, verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self {
            config: Arc::new(config),
            connection_ids: Arc::new(ConnectionIdAllocator::default()),
            sessions: SessionRegistry::default(),
            verifier,
            metrics_handle: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(Arc::new(handle));
        self
    }
}
