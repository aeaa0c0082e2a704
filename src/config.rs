use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::protocol::RequestId;
use crate::relay::RelayOptions;

pub const DEFAULT_PORT: u16 = 9876;
pub const SOCKET_ENV: &str = "COMMAND_RELAY_SOCKET";
pub const PORT_ENV: &str = "COMMAND_RELAY_PORT";

#[derive(Debug, Parser)]
#[command(name = "command-relay")]
#[command(about = "Relays commands from local clients to a polling executor and routes results back")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the relay daemon.
    Serve(ServeCommand),
    /// Submit one command and print its result.
    Send(SendCommand),
    /// Print the running relay's queue depth and pending-call count.
    Status(StatusCommand),
}

#[derive(Debug, clap::Args, Clone)]
pub struct ServeCommand {
    /// Client socket path (default: from COMMAND_RELAY_SOCKET or $SAK_HOME/browser/relay.sock)
    #[arg(long)]
    pub socket_path: Option<PathBuf>,

    /// Executor HTTP port on 127.0.0.1 (default: from COMMAND_RELAY_PORT or 9876)
    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds a command may wait for the executor before its caller gets a timeout.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Reject submissions once this many commands are waiting for pickup.
    #[arg(long)]
    pub max_queue_depth: Option<usize>,

    /// Reject submissions once this many calls are outstanding.
    #[arg(long)]
    pub max_pending: Option<usize>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit lifecycle events as JSON lines on stderr.
    #[arg(long, default_value_t = false)]
    pub json_output: bool,
}

impl ServeCommand {
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            max_queue_depth: self.max_queue_depth.filter(|max| *max > 0),
            max_pending: self.max_pending.filter(|max| *max > 0),
        }
    }

    pub fn resolved_socket_path(&self) -> PathBuf {
        resolve_socket_path(self.socket_path.clone())
    }

    pub fn resolved_port(&self) -> u16 {
        resolve_port(self.port)
    }
}

#[derive(Debug, clap::Args, Clone)]
pub struct SendCommand {
    /// Command type, e.g. navigate, click, get_tabs
    pub kind: String,

    /// JSON payload
    #[arg(long)]
    pub data: Option<String>,

    /// Correlation id (default: assigned by the relay)
    #[arg(long)]
    pub request_id: Option<String>,

    #[arg(long)]
    pub socket_path: Option<PathBuf>,

    /// Seconds to wait for the result.
    #[arg(long, default_value_t = 35)]
    pub timeout_secs: u64,

    /// Connection attempts before giving up.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
}

#[derive(Debug, clap::Args, Clone)]
pub struct StatusCommand {
    #[arg(long)]
    pub port: Option<u16>,
}

/// Toolkit home: `$SAK_HOME`, falling back to `~/.sovereign-ai`.
pub fn toolkit_home() -> PathBuf {
    std::env::var_os("SAK_HOME")
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .or_else(|| dirs::home_dir().map(|home| home.join(".sovereign-ai")))
        .unwrap_or_else(|| PathBuf::from(".sovereign-ai"))
}

pub fn resolve_socket_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| {
        std::env::var_os(SOCKET_ENV)
            .map(PathBuf::from)
            .filter(|path| !path.as_os_str().is_empty())
    })
    .unwrap_or_else(|| toolkit_home().join("browser").join("relay.sock"))
}

pub fn resolve_port(flag: Option<u16>) -> u16 {
    flag.or_else(|| {
        std::env::var(PORT_ENV)
            .ok()
            .and_then(|value| value.trim().parse().ok())
    })
    .unwrap_or(DEFAULT_PORT)
}

/// `--request-id 12` (or `1.5`) is sent as a number, anything else as a string.
pub fn parse_request_id(raw: &str) -> RequestId {
    let raw = raw.trim();
    serde_json::from_str::<serde_json::Number>(raw)
        .map(RequestId::Number)
        .unwrap_or_else(|_| RequestId::Text(raw.to_string()))
}
