//! Client-facing Unix socket: newline-delimited JSON commands in,
//! newline-delimited JSON results out.
//!
//! Each connection gets a reader (parse, hand to the relay) and a writer
//! (drain the connection's result channel). A connection may pipeline any
//! number of commands; results are written in the order they resolve.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::correlation::ClientHandle;
use crate::error::RelayError;
use crate::protocol::{encode_line, parse_submission, rejection_for, CommandResult};
use crate::service::RelayHandle;

/// How long shutdown waits for connections to flush their last results.
pub const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Bind the listener, replacing a stale socket file left by a previous run.
pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    if path.exists() {
        fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Accept connections until shutdown is signalled, then give open
/// connections [`SHUTDOWN_FLUSH_TIMEOUT`] to write their final results.
pub async fn serve_socket(
    listener: UnixListener,
    relay: RelayHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    let mut next_conn_id: u64 = 0;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        next_conn_id += 1;
                        connections.spawn(handle_connection(
                            stream,
                            next_conn_id,
                            relay.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "client socket accept failed");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);

    let open = connections.len();
    let drained = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            remaining = connections.len(),
            "client connections still busy at shutdown, aborting"
        );
        connections.shutdown().await;
    }
    tracing::debug!(connections = open, "client socket listener stopped");
}

async fn handle_connection(
    stream: UnixStream,
    conn_id: u64,
    relay: RelayHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(conn_id, "client connected");
    let (read_half, write_half) = stream.into_split();
    let (client, results) = ClientHandle::channel(conn_id);
    let writer = tokio::spawn(write_results(write_half, results, conn_id));

    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        tokio::select! {
            // The shutdown flag only ever goes to true.
            _ = shutdown.changed() => break,
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(conn_id, error = %error, "client read failed");
                    break;
                }
            },
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(error) => {
                let error =
                    RelayError::InvalidCommand(format!("line is not valid UTF-8: {error}"));
                tracing::warn!(conn_id, error = %error, "rejected malformed submission");
                client.deliver(rejection_for(&String::from_utf8_lossy(&buf), &error));
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_submission(line) {
            Ok(command) => {
                let request_id = command.request_id.clone();
                if let Err(error) = relay.submit(command, client.clone()).await {
                    client.deliver(CommandResult::failure(request_id, error.to_string()));
                    break;
                }
            }
            Err(error) => {
                tracing::warn!(conn_id, error = %error, "rejected malformed submission");
                client.deliver(rejection_for(line, &error));
            }
        }
    }

    // Pending calls keep their own clones; the writer lives until they resolve.
    drop(client);
    tracing::debug!(conn_id, "client stopped sending");
    if let Err(error) = writer.await {
        tracing::warn!(conn_id, error = %error, "client writer task failed");
    }
}

async fn write_results(
    mut writer: OwnedWriteHalf,
    mut results: mpsc::UnboundedReceiver<CommandResult>,
    conn_id: u64,
) {
    while let Some(result) = results.recv().await {
        let bytes = match encode_line(&result) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::error!(conn_id, error = %error, "failed to encode result");
                continue;
            }
        };
        if let Err(error) = writer.write_all(&bytes).await {
            tracing::warn!(
                conn_id,
                request_id = ?result.request_id,
                error = %error,
                "failed to write result, client connection lost"
            );
            break;
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!(conn_id, "client writer closed");
}
