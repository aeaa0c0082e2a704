//! The relay's single control flow.
//!
//! Listeners never touch [`Relay`] directly. They send a [`RelayRequest`]
//! through a [`RelayHandle`] and `run_relay` applies requests and timer
//! expiries one at a time, so queue and table mutations never overlap.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::correlation::ClientHandle;
use crate::error::RelayError;
use crate::protocol::{Command, CommandResult};
use crate::relay::{CompletionOutcome, Relay, RelayStatus};

pub const DEFAULT_REQUEST_CAPACITY: usize = 256;

const SHUTDOWN_REASON: &str = "Relay is shutting down";

pub enum RelayRequest {
    Submit {
        command: Command,
        client: ClientHandle,
    },
    Poll {
        reply: oneshot::Sender<Option<Command>>,
    },
    Complete {
        result: CommandResult,
        reply: oneshot::Sender<CompletionOutcome>,
    },
    Status {
        reply: oneshot::Sender<RelayStatus>,
    },
}

/// Cloneable entry point into the control loop.
#[derive(Clone, Debug)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayRequest>,
}

impl RelayHandle {
    pub fn new(tx: mpsc::Sender<RelayRequest>) -> Self {
        Self { tx }
    }

    /// Hand a parsed command to the relay. The outcome, success or
    /// rejection, arrives later on the client's own handle.
    pub async fn submit(&self, command: Command, client: ClientHandle) -> Result<(), RelayError> {
        self.tx
            .send(RelayRequest::Submit { command, client })
            .await
            .map_err(|_| RelayError::ShuttingDown)
    }

    pub async fn poll(&self) -> Result<Option<Command>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RelayRequest::Poll { reply })
            .await
            .map_err(|_| RelayError::ShuttingDown)?;
        rx.await.map_err(|_| RelayError::ShuttingDown)
    }

    pub async fn complete(&self, result: CommandResult) -> Result<CompletionOutcome, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RelayRequest::Complete { result, reply })
            .await
            .map_err(|_| RelayError::ShuttingDown)?;
        rx.await.map_err(|_| RelayError::ShuttingDown)
    }

    pub async fn status(&self) -> Result<RelayStatus, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RelayRequest::Status { reply })
            .await
            .map_err(|_| RelayError::ShuttingDown)?;
        rx.await.map_err(|_| RelayError::ShuttingDown)
    }
}

pub fn relay_channel(capacity: usize) -> (RelayHandle, mpsc::Receiver<RelayRequest>) {
    let (tx, rx) = mpsc::channel(capacity);
    (RelayHandle::new(tx), rx)
}

/// Drive `relay` until shutdown is signalled or every handle is dropped.
///
/// Calls still outstanding at exit receive a failure result. The relay is
/// handed back for inspection.
pub async fn run_relay(
    mut relay: Relay,
    mut requests: mpsc::Receiver<RelayRequest>,
    mut shutdown: watch::Receiver<bool>,
) -> Relay {
    tracing::info!(
        timeout_ms = relay.options().timeout.as_millis() as u64,
        "relay control loop started"
    );

    loop {
        let next_deadline = relay.next_deadline().map(Instant::from_std);
        // Disabled branch still needs a future to construct.
        let sleep_target =
            next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            request = requests.recv() => {
                let Some(request) = request else {
                    break;
                };
                let now = Instant::now().into_std();
                relay.expire_due(now);
                handle_request(&mut relay, request, now);
            }

            _ = tokio::time::sleep_until(sleep_target), if next_deadline.is_some() => {
                relay.expire_due(Instant::now().into_std());
            }
        }
    }

    relay.fail_all(SHUTDOWN_REASON);
    tracing::info!(
        queue_depth = relay.queue_depth(),
        "relay control loop stopped"
    );
    relay
}

fn handle_request(relay: &mut Relay, request: RelayRequest, now: std::time::Instant) {
    match request {
        RelayRequest::Submit { command, client } => {
            // Rejections are delivered to the client by the relay itself.
            let _ = relay.submit(command, client, now);
        }
        RelayRequest::Poll { reply } => {
            if let Some(command) = relay.poll() {
                if let Err(Some(command)) = reply.send(Some(command)) {
                    relay.requeue(command);
                }
            } else {
                let _ = reply.send(None);
            }
        }
        RelayRequest::Complete { result, reply } => {
            let _ = reply.send(relay.complete(result, now));
        }
        RelayRequest::Status { reply } => {
            let _ = reply.send(relay.status(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::watch;

    use super::{relay_channel, run_relay};
    use crate::correlation::ClientHandle;
    use crate::events::EventEmitter;
    use crate::protocol::{Command, CommandResult, RequestId, TIMEOUT_ERROR};
    use crate::relay::{CompletionOutcome, Relay, RelayOptions};

    fn spawn_relay() -> (
        super::RelayHandle,
        watch::Sender<bool>,
        tokio::task::JoinHandle<Relay>,
    ) {
        let relay = Relay::new(RelayOptions::default(), EventEmitter::disabled());
        let (handle, rx) = relay_channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_relay(relay, rx, shutdown_rx));
        (handle, shutdown_tx, task)
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_without_any_other_traffic() {
        let (handle, _shutdown, _task) = spawn_relay();
        let (client, mut rx) = ClientHandle::channel(1);
        handle
            .submit(
                Command::new("navigate", json!({"url": "https://x"})).with_request_id(1),
                client,
            )
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(31), rx.recv())
            .await
            .expect("timeout result before the guard")
            .expect("client channel open");
        assert_eq!(result.request_id, Some(RequestId::from(1)));
        assert_eq!(result.error, Some(json!(TIMEOUT_ERROR)));

        let status = handle.status().await.unwrap();
        assert_eq!(status.pending_calls, 0);
        assert_eq!(status.stats.timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_before_deadline_wins() {
        let (handle, _shutdown, _task) = spawn_relay();
        let (client, mut rx) = ClientHandle::channel(1);
        handle
            .submit(Command::new("get_tabs", json!(null)).with_request_id(2), client)
            .await
            .unwrap();

        let polled = handle.poll().await.unwrap().expect("queued command");
        assert_eq!(polled.request_id, Some(RequestId::from(2)));
        tokio::time::sleep(Duration::from_secs(10)).await;

        let outcome = handle
            .complete(CommandResult::ok(RequestId::from(2), json!({"tabId": 7})))
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::Delivered);
        assert_eq!(rx.recv().await.unwrap().data, Some(json!({"tabId": 7})));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.status().await.unwrap().stats.timed_out, 0);
    }

    #[tokio::test]
    async fn empty_poll_returns_none() {
        let (handle, _shutdown, _task) = spawn_relay();
        assert!(handle.poll().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_fails_outstanding_calls() {
        let (handle, shutdown, task) = spawn_relay();
        let (client, mut rx) = ClientHandle::channel(1);
        handle
            .submit(Command::new("click", json!({})).with_request_id(3), client)
            .await
            .unwrap();
        // Round-trip so the submit is applied before shutting down.
        handle.status().await.unwrap();

        shutdown.send(true).unwrap();
        let relay = task.await.unwrap();
        assert_eq!(relay.pending_calls(), 0);

        let result = rx.recv().await.unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error_message().as_deref(),
            Some("Relay is shutting down")
        );
        assert!(handle.poll().await.is_err());
    }
}
