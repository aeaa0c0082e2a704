//! Ledger of outstanding calls and their timeout deadlines.
//!
//! A `PendingCall` leaves the table exactly once, either through
//! [`CorrelationTable::resolve`] when the executor reports back or through
//! [`CorrelationTable::expire_due`] when its deadline passes. Whichever path
//! finds the entry wins; the other sees nothing.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::protocol::{CommandResult, RequestId};

/// Write side of one client connection.
///
/// Clones are held by every pending call submitted on that connection; the
/// connection's writer task drains the other end onto the socket.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<CommandResult>,
}

impl ClientHandle {
    pub fn new(conn_id: u64, tx: mpsc::UnboundedSender<CommandResult>) -> Self {
        Self { conn_id, tx }
    }

    pub fn channel(conn_id: u64) -> (Self, mpsc::UnboundedReceiver<CommandResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(conn_id, tx), rx)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Hand a result to the connection writer. Returns `false` when the
    /// connection is already gone; the result is dropped, never retried.
    pub fn deliver(&self, result: CommandResult) -> bool {
        let request_id = result.request_id.clone();
        match self.tx.send(result) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    conn_id = self.conn_id,
                    request_id = ?request_id,
                    "client connection closed before its result could be written"
                );
                false
            }
        }
    }
}

#[derive(Debug)]
pub struct PendingCall {
    pub request_id: RequestId,
    pub client: ClientHandle,
    pub submitted_at: Instant,
    deadline: Instant,
    ticket: u64,
}

impl PendingCall {
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.submitted_at)
    }
}

#[derive(Debug, Default)]
pub struct CorrelationTable {
    max_pending: Option<usize>,
    calls: HashMap<RequestId, PendingCall>,
    deadlines: BTreeMap<(Instant, u64), RequestId>,
    next_ticket: u64,
}

impl CorrelationTable {
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            max_pending,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Check that `request_id` could be registered right now.
    pub fn can_admit(&self, request_id: &RequestId) -> Result<(), RelayError> {
        if self.calls.contains_key(request_id) {
            return Err(RelayError::DuplicateRequestId(request_id.clone()));
        }
        if let Some(max) = self.max_pending {
            if self.calls.len() >= max {
                return Err(RelayError::TooManyPending(self.calls.len()));
            }
        }
        Ok(())
    }

    /// Register a call whose timer fires `timeout` after `now`.
    pub fn insert(
        &mut self,
        request_id: RequestId,
        client: ClientHandle,
        now: Instant,
        timeout: Duration,
    ) -> Result<Instant, RelayError> {
        self.can_admit(&request_id)?;

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let deadline = now + timeout;

        self.deadlines.insert((deadline, ticket), request_id.clone());
        self.calls.insert(
            request_id.clone(),
            PendingCall {
                request_id,
                client,
                submitted_at: now,
                deadline,
                ticket,
            },
        );

        debug_assert_eq!(
            self.calls.len(),
            self.deadlines.len(),
            "CorrelationTable: calls and deadlines out of sync"
        );
        Ok(deadline)
    }

    /// Take the call out of the table and cancel its timer.
    pub fn resolve(&mut self, request_id: &RequestId) -> Option<PendingCall> {
        let call = self.calls.remove(request_id)?;
        self.deadlines.remove(&(call.deadline, call.ticket));
        Some(call)
    }

    /// Remove and return every call whose deadline is at or before `now`,
    /// oldest deadline first.
    pub fn expire_due(&mut self, now: Instant) -> Vec<PendingCall> {
        let mut expired = Vec::new();
        while let Some(entry) = self.deadlines.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let request_id = entry.remove();
            if let Some(call) = self.calls.remove(&request_id) {
                expired.push(call);
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove every outstanding call, oldest deadline first.
    pub fn drain(&mut self) -> Vec<PendingCall> {
        let order = std::mem::take(&mut self.deadlines);
        order
            .into_values()
            .filter_map(|request_id| self.calls.remove(&request_id))
            .collect()
    }
}
