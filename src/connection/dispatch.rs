//! Request dispatch: routes one decoded message to the backend.

use crate::connection::handler::{Connection, ConnectionError};
use crate::engine::StatsCounter;
use crate::protocol::ProtocolMessage;
use std::sync::Arc;
use tracing::debug;

/// Bumps the matching counter, then calls the backend operation.
///
/// Query calls are bracketed by the Start and End frames; a failing backend
/// call skips the End frame and ends the connection.
pub(crate) async fn dispatch(
    conn: &mut Connection,
    msg: ProtocolMessage,
) -> Result<(), ConnectionError> {
    let backend = conn.backend().cloned().ok_or(ConnectionError::NoBackend)?;
    let context = Arc::clone(conn.context());
    let stats = context.stats();

    match msg {
        ProtocolMessage::Query(request) => {
            stats.bump(StatsCounter::Queries);
            conn.stream_start().await?;
            backend.query(conn, &request).await?;
            conn.stream_end().await?;
        }
        ProtocolMessage::Input(request) => {
            stats.bump(StatsCounter::Inputs);
            backend.input(conn, &request).await?;
        }
        ProtocolMessage::Backup(request) => {
            stats.bump(StatsCounter::Backups);
            debug!(conn = conn.id(), path = %String::from_utf8_lossy(&request.path), "Backup requested");
            backend.backup(conn, &request).await;
        }
        ProtocolMessage::Dump(request) => {
            stats.bump(StatsCounter::Dumps);
            debug!(conn = conn.id(), path = %String::from_utf8_lossy(&request.path), "Dump requested");
            backend.dump(conn, &request).await;
        }
    }

    Ok(())
}
