//! Caller-side helpers: submit one command over the Unix socket and wait for
//! its result, or read the relay's diagnostics over HTTP.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::error::RelayError;
use crate::protocol::CommandResult;
use crate::relay::DEFAULT_TIMEOUT;

#[cfg(unix)]
use std::{io, path::Path};

#[cfg(unix)]
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
};

#[cfg(unix)]
use crate::protocol::{encode_line, Command};

/// Sysexits `EX_TEMPFAIL`: resubmitting later may succeed.
pub const EXIT_TEMPFAIL: i32 = 75;

const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SendOptions {
    /// How long to wait for the result once the command is written.
    pub timeout: Duration,
    /// Connection attempts before giving up. Only connecting is retried; a
    /// command that reached the relay is never resubmitted.
    pub connect_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            // Slightly longer than the relay's own timer so its timeout
            // result normally arrives first.
            timeout: DEFAULT_TIMEOUT + Duration::from_secs(5),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Submit `command` and wait for its result.
///
/// A `success: false` result is returned as `Ok`; it is the executor's (or
/// the relay's) answer, not a transport failure.
#[cfg(unix)]
pub async fn send_command(
    socket_path: &Path,
    command: &Command,
    opts: &SendOptions,
) -> Result<CommandResult, RelayError> {
    let stream = connect_with_retry(socket_path, opts).await?;
    tokio::time::timeout(opts.timeout, exchange(stream, command))
        .await
        .map_err(|_| RelayError::ClientTimeout(opts.timeout))?
}

#[cfg(unix)]
async fn connect_with_retry(
    socket_path: &Path,
    opts: &SendOptions,
) -> Result<UnixStream, RelayError> {
    let attempts = opts.connect_attempts.max(1);
    let mut attempt = 1;
    loop {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(error) if attempt < attempts => {
                tracing::warn!(
                    socket = %socket_path.display(),
                    attempt,
                    error = %error,
                    "relay socket unavailable, retrying"
                );
                tokio::time::sleep(opts.retry_delay).await;
                attempt += 1;
            }
            Err(error) => return Err(RelayError::Io(error)),
        }
    }
}

#[cfg(unix)]
async fn exchange(stream: UnixStream, command: &Command) -> Result<CommandResult, RelayError> {
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(&encode_line(command)?).await?;

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let result: CommandResult = serde_json::from_str(&line)
            .map_err(|error| RelayError::InvalidResponse(error.to_string()))?;
        // Without our own id we accept the first answer on this connection;
        // a rejection of an unreadable line carries no id either.
        let matches = match (&command.request_id, &result.request_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        };
        if matches {
            return Ok(result);
        }
        tracing::debug!(request_id = ?result.request_id, "ignoring result for another request");
    }

    Err(RelayError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "relay closed the connection before answering",
    )))
}

/// Process exit status for one `send`: 0 on success, [`EXIT_TEMPFAIL`] when
/// the executor timed out or the relay was busy or unreachable, 1 otherwise.
pub fn send_exit_code(outcome: &Result<CommandResult, RelayError>) -> i32 {
    match outcome {
        Ok(result) if result.success => 0,
        Ok(result) if result.is_timeout() => EXIT_TEMPFAIL,
        Ok(_) => 1,
        Err(error) if error.is_retryable() => EXIT_TEMPFAIL,
        Err(_) => 1,
    }
}

/// Fetch `GET {base_url}/status`.
pub async fn fetch_status(base_url: &str, api_key: Option<&str>) -> Result<Value> {
    let url = format!("{}/status", base_url.trim_end_matches('/'));
    let mut request = reqwest::Client::new().get(&url);
    if let Some(key) = api_key {
        request = request.header("x-api-key", key);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("failed to reach relay at {url}"))?
        .error_for_status()
        .context("relay status request failed")?;
    response
        .json::<Value>()
        .await
        .context("relay status response was not JSON")
}
