//! Per-connection handler.
//!
//! Drives one client through the query loop:
//!
//! ```text
//! AwaitQuery -> Dispatching -> Responding -> AwaitQuery ... -> Closed
//! ```
//!
//! Every wait (prompt flush, line read, response write) yields to the
//! runtime, so a slow or idle client never holds up anyone else.

use crate::error::ConnectionError;
use crate::loader::{IndexHandle, QueryResult};
use crate::protocol::{encode_response, Query, PROMPT};
use crate::registry::ConnectionSlot;
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Current state of a connection.
#[derive(Debug)]
enum ConnState {
    /// Prompt sent (or about to be), waiting for a line.
    AwaitQuery,
    /// Query decoded, waiting on the index.
    Dispatching(String),
    /// Writing the result of `query`.
    Responding { query: String, result: QueryResult },
    /// Terminal.
    Closed(CloseReason),
}

/// Why a connection ended.
#[derive(Debug)]
pub enum CloseReason {
    /// Client sent a control character or undecodable bytes.
    ClientQuit,
    /// Client closed its end.
    Eof,
    /// Read or write failed.
    Failed(ConnectionError),
}

/// Serve the query loop on `stream` until the client quits or the
/// connection fails.
///
/// `slot` keeps the connection in the active set and is released when
/// this returns.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    index: IndexHandle,
    slot: ConnectionSlot,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, reader);
    let mut line = Vec::with_capacity(256);
    let mut state = ConnState::AwaitQuery;

    debug!(peer = %peer, id = slot.id(), "Serving connection");

    let reason = loop {
        state = match state {
            ConnState::AwaitQuery => match await_query(&mut reader, &mut writer, &mut line).await {
                Ok(Some(Query::Lookup(query))) => ConnState::Dispatching(query),
                // Idle keep-alive
                Ok(Some(Query::Empty)) => ConnState::AwaitQuery,
                Ok(Some(Query::Terminate)) => ConnState::Closed(CloseReason::ClientQuit),
                Ok(None) => ConnState::Closed(CloseReason::Eof),
                Err(e) => ConnState::Closed(CloseReason::Failed(e)),
            },

            ConnState::Dispatching(query) => {
                let result = index.lookup(&query);
                ConnState::Responding { query, result }
            }

            ConnState::Responding { query, result } => {
                let response = encode_response(&result);
                match write_flush(&mut writer, &response).await {
                    Ok(()) => {
                        info!(
                            peer = %peer,
                            query = ?query,
                            results = result.lines.len(),
                            "Query served"
                        );
                        ConnState::AwaitQuery
                    }
                    Err(e) => ConnState::Closed(CloseReason::Failed(e)),
                }
            }

            ConnState::Closed(reason) => break reason,
        };
        trace!(peer = %peer, state = ?state, "Connection state");
    };

    // Best effort: the peer may already be gone
    if !matches!(reason, CloseReason::Failed(_)) {
        let _ = writer.shutdown().await;
    }

    match &reason {
        CloseReason::Failed(e) => debug!(peer = %peer, error = %e, "Connection closed on error"),
        _ => debug!(peer = %peer, reason = ?reason, "Connection closed"),
    }
    drop(slot);
    reason
}

/// Send the prompt and read one line.
///
/// Returns `None` at end of stream.
async fn await_query<R, W>(
    reader: &mut R,
    writer: &mut W,
    line: &mut Vec<u8>,
) -> Result<Option<Query>, ConnectionError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_flush(writer, PROMPT).await?;

    line.clear();
    let n = reader.read_until(b'\n', line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(Query::decode(line)))
}

async fn write_flush<W>(writer: &mut W, data: &[u8]) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}
