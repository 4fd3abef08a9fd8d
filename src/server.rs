//! Accept loop, per-connection tasks and the command loop.

use crate::dispatcher::CommandDispatcher;
use crate::error::{ConnectionError, SqlError};
use crate::metrics;
use crate::protocol::packet_io::Transport;
use crate::session::ConnectionSession;
use crate::state::{AppState, SessionHandle};
use anyhow::Result;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, error, info, info_span, warn};

thread_local! {
    /// Backtrace of the most recent panic on this thread, taken while the
    /// panicking frames were still on the stack.
    static FAULT_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// Chains a hook in front of the current panic hook that records where each
/// panic happened. Idempotent.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = FAULT_BACKTRACE.try_with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(Backtrace::force_capture());
                }
            });
            previous(info);
        }));
    });
}

fn take_fault_backtrace() -> Option<Backtrace> {
    FAULT_BACKTRACE
        .try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut s| s.take()))
        .ok()
        .flatten()
}

/// Accepts connections forever, one task per client.
pub async fn serve<D>(listener: TcpListener, state: AppState, dispatcher: Arc<D>) -> Result<()>
where
    D: CommandDispatcher + 'static,
{
    install_panic_hook();
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "accepting MySQL connections");

    loop {
        let (socket, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "failed to accept connection");
                continue;
            }
        };
        if let Err(e) = socket.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let state = state.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            handle_connection(socket, remote_addr, state, dispatcher).await;
        });
    }
}

/// Serves one client from handshake to close.
pub async fn handle_connection<T, D>(
    stream: T,
    remote_addr: SocketAddr,
    state: AppState,
    dispatcher: Arc<D>,
) where
    T: Transport,
    D: CommandDispatcher + 'static,
{
    let Some(connection_id) = state.connection_ids.allocate() else {
        error!(%remote_addr, "connection ids exhausted, refusing connection");
        return;
    };
    let handle = SessionHandle::new(connection_id, remote_addr);
    let _registration = state.sessions.register(handle.clone());
    let span = info_span!("connection", connection_id, %remote_addr);

    async move {
        info!("accepted connection");
        let mut session = ConnectionSession::new(stream, handle, state.config.server.version.clone());
        session.set_max_allowed_packet(state.config.server.max_allowed_packet);

        match session.handshake(state.verifier.as_ref()).await {
            Ok(()) => {
                info!(user = session.user(), database = session.database(), "handshake accepted");
                run_command_loop(&mut session, dispatcher.as_ref()).await;
            }
            Err(e) => {
                if matches!(e, ConnectionError::Sql(_)) {
                    metrics::record_handshake_rejected();
                }
                info!(error = %e, "handshake failed");
                session.close().await;
            }
        }
    }
    .instrument(span)
    .await;
}

/// Runs commands until the client leaves, the session is closed, or a
/// dispatch panics. The session is always closed on return.
pub async fn run_command_loop<D: CommandDispatcher>(session: &mut ConnectionSession, dispatcher: &D) {
    install_panic_hook();
    let outcome = AssertUnwindSafe(command_loop(session, dispatcher))
        .catch_unwind()
        .await;

    if let Err(panic) = outcome {
        // The hook ran on this thread within the same poll that caught the panic.
        let backtrace = take_fault_backtrace().unwrap_or_else(Backtrace::force_capture);
        metrics::record_command_fault();
        error!(
            connection_id = session.connection_id(),
            panic = panic_message(panic.as_ref()),
            %backtrace,
            "command dispatch panicked, closing connection"
        );
    }

    session.close().await;
}

async fn command_loop<D: CommandDispatcher>(session: &mut ConnectionSession, dispatcher: &D) {
    loop {
        let payload = match session.read_packet().await {
            Ok(payload) => payload,
            Err(e @ ConnectionError::PacketTooLarge { .. }) => {
                warn!(error = %e, "client packet too large");
                if let Err(e) = session.write_error(&e.to_sql_error()).await {
                    debug!(error = %e, "could not report oversized packet");
                }
                return;
            }
            Err(e) => {
                if session.handle().is_killed() {
                    info!("connection killed");
                } else {
                    debug!(error = %e, "read ended");
                }
                return;
            }
        };

        session.begin_command().await;
        metrics::record_command();

        if let Err(err) = dispatcher.dispatch(session, payload).await {
            if let Some(conn) = err.downcast_ref::<ConnectionError>() {
                if conn.is_transport() {
                    debug!(error = %conn, "transport failed during dispatch");
                    return;
                }
            }

            let sql = SqlError::from_error(&err);
            debug!(code = sql.code, message = %sql.message, "command failed");
            if let Err(e) = session.write_error(&sql).await {
                warn!(error = %e, "could not report command error");
                return;
            }
        }

        if session.is_closed() {
            return;
        }

        session.finish_command().await;
        session.reset_sequence();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
