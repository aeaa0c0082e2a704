use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};

use command_relay::{
    client::fetch_status,
    config::{resolve_port, Cli, Commands, SendCommand, ServeCommand, StatusCommand},
    events::init_logging,
    http_api::API_KEY_ENV,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(cmd) => {
            init_logging(Some(&cmd.log_level))?;
            run_serve(cmd).await
        }
        Commands::Send(cmd) => {
            init_logging(None)?;
            run_send(cmd).await
        }
        Commands::Status(cmd) => {
            init_logging(None)?;
            run_status(cmd).await
        }
    }
}

#[cfg(unix)]
async fn run_serve(cmd: ServeCommand) -> Result<()> {
    use command_relay::{
        events::EventEmitter,
        http_api::relay_api_router,
        relay::Relay,
        service::{relay_channel, run_relay, DEFAULT_REQUEST_CAPACITY},
        socket::{bind_socket, serve_socket},
    };
    use tokio::signal::unix::{signal, SignalKind};
    use tokio::sync::watch;

    let events = EventEmitter::new(cmd.json_output);
    let options = cmd.relay_options();
    let socket_path = cmd.resolved_socket_path();
    let port = cmd.resolved_port();

    let socket_listener = bind_socket(&socket_path)
        .with_context(|| format!("failed to bind client socket {}", socket_path.display()))?;
    let http_listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind executor API on port {port}"))?;

    let relay = Relay::new(options.clone(), events.clone());
    let (handle, requests) = relay_channel(DEFAULT_REQUEST_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay_task = tokio::spawn(run_relay(relay, requests, shutdown_rx.clone()));
    let socket_task = tokio::spawn(serve_socket(
        socket_listener,
        handle.clone(),
        shutdown_rx.clone(),
    ));

    let router = relay_api_router(handle);
    let mut http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        let served = axum::serve(http_listener, router)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(error) = served {
            tracing::error!(error = %error, "executor API server error");
        }
    });

    tracing::info!(
        socket = %socket_path.display(),
        api = %format!("http://127.0.0.1:{port}"),
        timeout_secs = options.timeout.as_secs(),
        "command relay listening"
    );
    events.emit(
        "relay_started",
        json!({
            "socket": socket_path.display().to_string(),
            "port": port,
            "timeoutMs": options.timeout.as_millis() as u64,
        }),
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl-C, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = socket_task.await;
    let _ = http_task.await;
    let relay = relay_task.await.context("relay control loop panicked")?;

    if let Err(error) = std::fs::remove_file(&socket_path) {
        tracing::debug!(error = %error, "socket file already gone");
    }
    tracing::info!(stats = ?relay.stats(), "command relay stopped");
    events.emit("relay_stopped", relay.stats());
    Ok(())
}

#[cfg(not(unix))]
async fn run_serve(_cmd: ServeCommand) -> Result<()> {
    anyhow::bail!("the command relay needs Unix domain sockets for its client interface")
}

#[cfg(unix)]
async fn run_send(cmd: SendCommand) -> Result<()> {
    use std::time::Duration;

    use command_relay::{
        client::{send_command, send_exit_code, SendOptions},
        config::{parse_request_id, resolve_socket_path},
        protocol::Command,
    };

    let payload = match cmd.data.as_deref() {
        Some(raw) => serde_json::from_str(raw).context("--data must be valid JSON")?,
        None => Value::Null,
    };
    let mut command = Command::new(cmd.kind, payload);
    command.request_id = cmd.request_id.as_deref().map(parse_request_id);

    let opts = SendOptions {
        timeout: Duration::from_secs(cmd.timeout_secs.max(1)),
        connect_attempts: cmd.retries,
        ..SendOptions::default()
    };
    let socket_path = resolve_socket_path(cmd.socket_path);
    let outcome = send_command(&socket_path, &command, &opts).await;
    let code = send_exit_code(&outcome);

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.is_timeout() {
                eprintln!(
                    "[command-relay] executor did not answer in time; \
                     resubmit with a new request id"
                );
            }
        }
        Err(error) => {
            eprintln!(
                "[command-relay] no result from relay at {}: {error}",
                socket_path.display()
            );
            if error.is_retryable() {
                eprintln!("[command-relay] relay busy or not running; try again shortly");
            }
        }
    }
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(not(unix))]
async fn run_send(_cmd: SendCommand) -> Result<()> {
    anyhow::bail!("the command relay needs Unix domain sockets for its client interface")
}

async fn run_status(cmd: StatusCommand) -> Result<()> {
    let base_url = format!("http://127.0.0.1:{}", resolve_port(cmd.port));
    let api_key = std::env::var(API_KEY_ENV).ok();
    let status = fetch_status(&base_url, api_key.as_deref()).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
