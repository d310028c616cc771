use std::{net::SocketAddr, time::Duration};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::error::{ProtocolError, SessionError};
use super::request::{parse_request, Command};
use super::KeyValueStore;

pub type ConnectionId = u64;

/// Per-connection context handed to a session when it is created.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub idle_timeout: Duration,
}

/// Runs one request line against the store and returns the response line,
/// without its terminator.
///
/// Malformed requests are logged and answered with an empty string.
pub async fn process_line(store: &KeyValueStore, line: &str) -> String {
    let command = match parse_request(line) {
        Ok(command) => command,
        Err(err) => {
            warn!(error = %err, "rejected request");
            return String::new();
        }
    };

    match command {
        Command::Get { key } => {
            let value = store.get(&key).await.unwrap_or_default();
            debug!(%key, %value, "GET");
            value
        }
        Command::Set { key, value } => {
            debug!(%key, %value, "SET");
            store.set(key, value.clone()).await;
            value
        }
    }
}

/// Like [`process_line`], for raw bytes off the wire. Lines that are not
/// UTF-8 are rejected like any other malformed request.
pub async fn process_request(store: &KeyValueStore, raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(line) => process_line(store, line).await,
        Err(_) => {
            warn!(error = %ProtocolError::InvalidUtf8, len = raw.len(), "rejected request");
            String::new()
        }
    }
}

/// Serves a TCP connection until the peer goes away or the session fails,
/// then shuts the socket down.
pub async fn handle_connection(
    mut socket: TcpStream,
    store: KeyValueStore,
    ctx: SessionContext,
) -> Result<(), SessionError> {
    debug!(conn_id = ctx.id, peer = %ctx.peer, idle_timeout = ?ctx.idle_timeout, "session started");
    let result = run_session(&mut socket, &store, ctx.idle_timeout).await;
    let _ = socket.shutdown().await;
    result
}

/// The read / process / respond loop.
///
/// Returns `Ok(())` when the peer closes its write side. Each read gets a
/// fresh `idle_timeout`; running out of it ends the session with
/// [`SessionError::Idle`].
pub async fn run_session<S>(
    stream: S,
    store: &KeyValueStore,
    idle_timeout: Duration,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::time::timeout(idle_timeout, reader.read_until(b'\n', &mut line))
            .await
            .map_err(|_| SessionError::Idle(idle_timeout))??;

        if read == 0 {
            info!("client disconnected");
            return Ok(());
        }
        if !line.ends_with(b"\n") {
            // Peer closed mid-line; an unterminated fragment is not a request.
            info!(fragment_len = line.len(), "client disconnected with a partial line");
            return Ok(());
        }

        let mut response = process_request(store, &line).await;
        response.push('\n');
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
    }
}
