//! Stress tests for the command queue and the relay's bookkeeping.
//! Run with: cargo test --test stress_queue -- --ignored

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::json;

use command_relay::{
    correlation::ClientHandle,
    events::EventEmitter,
    protocol::{Command, CommandResult, RequestId},
    queue::CommandQueue,
    relay::{CompletionOutcome, Relay, RelayOptions},
};

fn cmd(id: i64) -> Command {
    Command::new("click", json!({ "n": id })).with_request_id(id)
}

#[test]
#[ignore]
fn queue_100k_items_stay_fifo() {
    let mut queue = CommandQueue::new(None);
    for i in 0..100_000 {
        queue.enqueue(cmd(i)).expect("unbounded queue accepts");
    }
    assert_eq!(queue.len(), 100_000);

    let mut expected = 0i64;
    while let Some(command) = queue.dequeue() {
        assert_eq!(command.request_id, Some(RequestId::from(expected)));
        expected += 1;
    }
    assert_eq!(expected, 100_000);
}

#[test]
#[ignore]
fn interleaved_clients_get_global_order_and_their_own_results() {
    let clients = 50;
    let per_client = 200;
    let mut relay = Relay::new(
        RelayOptions {
            timeout: Duration::from_secs(3600),
            ..RelayOptions::default()
        },
        EventEmitter::disabled(),
    );
    let now = Instant::now();

    let mut receivers = HashMap::new();
    let mut handles = Vec::new();
    for conn_id in 0..clients {
        let (handle, rx) = ClientHandle::channel(conn_id);
        handles.push(handle);
        receivers.insert(conn_id, rx);
    }

    // Round-robin across connections so arrival order interleaves.
    let mut owner = HashMap::new();
    let mut next_id = 0i64;
    for _ in 0..per_client {
        for handle in &handles {
            relay.submit(cmd(next_id), handle.clone(), now).unwrap();
            owner.insert(next_id, handle.conn_id());
            next_id += 1;
        }
    }
    assert_eq!(relay.queue_depth(), next_id as usize);
    assert_eq!(relay.pending_calls(), next_id as usize);

    let mut polled = Vec::new();
    while let Some(command) = relay.poll() {
        polled.push(command.request_id.expect("relay assigns ids"));
    }
    let expected: Vec<_> = (0..next_id).map(RequestId::from).collect();
    assert_eq!(polled, expected);

    // Answer newest first.
    for id in (0..next_id).rev() {
        let outcome = relay.complete(CommandResult::ok(RequestId::from(id), json!(id)), now);
        assert_eq!(outcome, CompletionOutcome::Delivered);
    }
    assert_eq!(relay.pending_calls(), 0);
    assert_eq!(relay.stats().completed, next_id as u64);

    for (conn_id, rx) in receivers.iter_mut() {
        let mut seen = 0;
        while let Ok(result) = rx.try_recv() {
            let id = match &result.request_id {
                Some(RequestId::Number(n)) => n.as_i64().expect("integer id"),
                other => panic!("unexpected id {other:?}"),
            };
            assert_eq!(owner[&id], *conn_id, "result {id} reached the wrong client");
            seen += 1;
        }
        assert_eq!(seen, per_client);
    }
}

#[test]
#[ignore]
fn mass_timeout_resolves_each_call_once() {
    let total = 20_000i64;
    let mut relay = Relay::new(
        RelayOptions {
            timeout: Duration::from_millis(10),
            ..RelayOptions::default()
        },
        EventEmitter::disabled(),
    );
    let (handle, mut rx) = ClientHandle::channel(1);
    let start = Instant::now();
    for i in 0..total {
        relay.submit(cmd(i), handle.clone(), start).unwrap();
    }

    let expired = relay.expire_due(start + Duration::from_secs(1));
    assert_eq!(expired, total as usize);
    assert_eq!(relay.pending_calls(), 0);

    // Late completions for all of them are dropped, never delivered.
    for i in 0..total {
        let outcome = relay.complete(
            CommandResult::ok(RequestId::from(i), json!(null)),
            start + Duration::from_secs(2),
        );
        assert!(matches!(outcome, CompletionOutcome::Late(_) | CompletionOutcome::Unknown));
    }

    let mut results = 0;
    while let Ok(result) = rx.try_recv() {
        assert!(result.is_timeout());
        results += 1;
    }
    assert_eq!(results, total);
}
