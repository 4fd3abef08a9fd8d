//! The seam between the command loop and whatever executes commands.

use crate::error::SqlError;
use crate::protocol::mysql::{COM_INIT_DB, COM_PING, COM_QUIT};
use crate::session::ConnectionSession;
use anyhow::Result;
use bytes::Bytes;
use std::future::Future;

/// Executes one client command.
///
/// The dispatcher owns the response: it writes zero or more packets through
/// `session`, may update its status and result counters, and may close it.
/// An `Err` that is not a transport failure is reported to the client as an
/// ERR packet and the connection stays open.
pub trait CommandDispatcher: Send + Sync {
    fn dispatch(
        &self,
        session: &mut ConnectionSession,
        payload: Bytes,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Handles the connection-level commands and refuses everything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicDispatcher;

impl CommandDispatcher for BasicDispatcher {
    async fn dispatch(&self, session: &mut ConnectionSession, payload: Bytes) -> Result<()> {
        let Some((&command, body)) = payload.split_first() else {
            return Err(SqlError::malformed_packet().into());
        };

        match command {
            COM_QUIT => {
                session.close().await;
            }
            COM_PING => {
                session.write_ok(None).await?;
            }
            COM_INIT_DB => {
                let database = String::from_utf8_lossy(body).into_owned();
                tracing::debug!(connection_id = session.connection_id(), %database, "init db");
                session.set_database(Some(database)).await;
                session.write_ok(None).await?;
            }
            other => return Err(SqlError::unknown_command(other).into()),
        }
        Ok(())
    }
}
