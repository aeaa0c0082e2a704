//! Relay state: the command queue, the correlation table and the counters
//! that describe them.
//!
//! A `Relay` is plain data mutated through `&mut self`. It is owned by one
//! control loop (see [`crate::service`]); nothing here locks or spawns.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::correlation::{ClientHandle, CorrelationTable};
use crate::error::RelayError;
use crate::events::EventEmitter;
use crate::protocol::{Command, CommandResult, RequestId};
use crate::queue::{CommandQueue, QueueError};
use crate::resolved::{Resolution, ResolvedLedger};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const RESOLVED_TTL: Duration = Duration::from_secs(300);
const RESOLVED_MAX_ENTRIES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    pub timeout: Duration,
    pub max_queue_depth: Option<usize>,
    pub max_pending: Option<usize>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_queue_depth: None,
            max_pending: None,
        }
    }
}

/// Lifetime counters, reported by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub submitted: u64,
    pub rejected: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub late_completions: u64,
    pub unknown_completions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub queue_depth: usize,
    pub pending_calls: usize,
    pub timeout_ms: u64,
    pub uptime_secs: u64,
    pub stats: RelayStats,
}

/// What happened to a completion posted by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Matched a pending call and was handed to its connection.
    Delivered,
    /// Matched a pending call whose connection had already closed.
    ClientGone,
    /// The call was already resolved, by timeout or by an earlier completion.
    Late(Resolution),
    /// No call with this id was ever seen (or it aged out of the ledger).
    Unknown,
}

#[derive(Debug)]
pub struct Relay {
    options: RelayOptions,
    queue: CommandQueue,
    table: CorrelationTable,
    ledger: ResolvedLedger,
    stats: RelayStats,
    started_at: Instant,
    events: EventEmitter,
}

impl Relay {
    pub fn new(options: RelayOptions, events: EventEmitter) -> Self {
        Self {
            queue: CommandQueue::new(options.max_queue_depth),
            table: CorrelationTable::new(options.max_pending),
            ledger: ResolvedLedger::new(RESOLVED_TTL, RESOLVED_MAX_ENTRIES),
            stats: RelayStats::default(),
            started_at: Instant::now(),
            options,
            events,
        }
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Admit a command: register its pending call, arm its timer and queue it.
    ///
    /// Commands without an id get a relay-generated one. On rejection the
    /// client receives its failure result here and nothing is retained.
    pub fn submit(
        &mut self,
        mut command: Command,
        client: ClientHandle,
        now: Instant,
    ) -> Result<RequestId, RelayError> {
        let request_id = command
            .request_id
            .get_or_insert_with(RequestId::generate)
            .clone();

        if let Err(error) = self.admit(command, &client, now) {
            self.stats.rejected += 1;
            tracing::warn!(
                request_id = %request_id,
                conn_id = client.conn_id(),
                error = %error,
                "rejected command"
            );
            self.events.emit(
                "command_rejected",
                json!({ "requestId": request_id, "error": error.to_string() }),
            );
            client.deliver(CommandResult::failure(
                Some(request_id),
                error.to_string(),
            ));
            return Err(error);
        }

        self.stats.submitted += 1;
        Ok(request_id)
    }

    fn admit(
        &mut self,
        command: Command,
        client: &ClientHandle,
        now: Instant,
    ) -> Result<(), RelayError> {
        let Some(request_id) = command.request_id.clone() else {
            return Err(RelayError::InvalidCommand("missing requestId".to_string()));
        };
        self.table.can_admit(&request_id)?;
        if !self.queue.has_room() {
            return Err(RelayError::QueueFull(self.queue.len()));
        }

        let kind = command.kind.clone();
        self.table
            .insert(request_id.clone(), client.clone(), now, self.options.timeout)?;
        if let Err(QueueError::Full(depth)) = self.queue.enqueue(command) {
            self.table.resolve(&request_id);
            return Err(RelayError::QueueFull(depth));
        }

        tracing::debug!(
            request_id = %request_id,
            kind = %kind,
            conn_id = client.conn_id(),
            queue_depth = self.queue.len(),
            "command queued"
        );
        self.events.emit(
            "command_queued",
            json!({
                "requestId": request_id,
                "kind": kind,
                "queueDepth": self.queue.len(),
            }),
        );
        Ok(())
    }

    /// Hand the oldest queued command to the executor, if any.
    pub fn poll(&mut self) -> Option<Command> {
        let command = self.queue.dequeue()?;
        self.stats.dispatched += 1;
        tracing::debug!(
            request_id = ?command.request_id,
            kind = %command.kind,
            queue_depth = self.queue.len(),
            "command dispatched to executor"
        );
        self.events.emit(
            "command_dispatched",
            json!({ "requestId": command.request_id, "kind": command.kind }),
        );
        Some(command)
    }

    /// Return a command whose poll response could not be handed over
    /// (the executor's request went away first).
    pub fn requeue(&mut self, command: Command) {
        self.stats.dispatched = self.stats.dispatched.saturating_sub(1);
        tracing::warn!(
            request_id = ?command.request_id,
            "poll response undeliverable, command returned to head of queue"
        );
        self.queue.requeue_front(command);
    }

    /// Route an executor result back to the waiting client.
    ///
    /// Never fails: results nobody is waiting for are counted and dropped.
    pub fn complete(&mut self, result: CommandResult, now: Instant) -> CompletionOutcome {
        let Some(request_id) = result.request_id.clone() else {
            self.stats.unknown_completions += 1;
            tracing::warn!("dropping completion without requestId");
            return CompletionOutcome::Unknown;
        };

        let Some(call) = self.table.resolve(&request_id) else {
            return self.drop_completion(&request_id, now);
        };

        self.ledger
            .record(request_id.clone(), Resolution::Completed, now);
        if result.success {
            self.stats.completed += 1;
        } else {
            self.stats.failed += 1;
        }

        let elapsed_ms = call.waited(now).as_millis() as u64;
        tracing::info!(
            request_id = %request_id,
            success = result.success,
            elapsed_ms,
            "command completed"
        );
        self.events.emit(
            "command_completed",
            json!({
                "requestId": request_id,
                "success": result.success,
                "elapsedMs": elapsed_ms,
            }),
        );

        if call.client.deliver(result) {
            CompletionOutcome::Delivered
        } else {
            CompletionOutcome::ClientGone
        }
    }

    fn drop_completion(&mut self, request_id: &RequestId, now: Instant) -> CompletionOutcome {
        let outcome = match self.ledger.lookup(request_id, now) {
            Some(resolution) => {
                self.stats.late_completions += 1;
                tracing::info!(
                    request_id = %request_id,
                    previously = ?resolution,
                    "dropping late completion"
                );
                CompletionOutcome::Late(resolution)
            }
            None => {
                self.stats.unknown_completions += 1;
                tracing::warn!(request_id = %request_id, "dropping completion for unknown request");
                CompletionOutcome::Unknown
            }
        };
        self.events.emit(
            "completion_dropped",
            json!({
                "requestId": request_id,
                "late": matches!(outcome, CompletionOutcome::Late(_)),
            }),
        );
        outcome
    }

    /// Fail every call whose deadline has passed. Returns how many fired.
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let expired = self.table.expire_due(now);
        for call in &expired {
            self.stats.timed_out += 1;
            self.ledger
                .record(call.request_id.clone(), Resolution::TimedOut, now);
            tracing::warn!(
                request_id = %call.request_id,
                conn_id = call.client.conn_id(),
                waited_ms = call.waited(now).as_millis() as u64,
                "command timed out waiting for executor"
            );
            self.events
                .emit("command_timed_out", json!({ "requestId": call.request_id }));
            call.client
                .deliver(CommandResult::timeout(call.request_id.clone()));
        }
        expired.len()
    }

    /// Fail every outstanding call with `reason`. Used on shutdown so no
    /// waiting client is left without a result.
    pub fn fail_all(&mut self, reason: &str) -> usize {
        let calls = self.table.drain();
        for call in &calls {
            call.client
                .deliver(CommandResult::failure(Some(call.request_id.clone()), reason));
        }
        if !calls.is_empty() {
            tracing::info!(count = calls.len(), "failed outstanding calls on shutdown");
        }
        calls.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.table.next_deadline()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_calls(&self) -> usize {
        self.table.len()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn status(&self, now: Instant) -> RelayStatus {
        RelayStatus {
            queue_depth: self.queue.len(),
            pending_calls: self.table.len(),
            timeout_ms: self.options.timeout.as_millis() as u64,
            uptime_secs: now.saturating_duration_since(self.started_at).as_secs(),
            stats: self.stats.clone(),
        }
    }
}
