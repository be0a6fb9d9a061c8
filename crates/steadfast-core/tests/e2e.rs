// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end scenarios: a mock step target, the HTTP driver, the in-memory
//! stores and a worker driven by a manual clock.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use steadfast_core::clock::{Clock, ManualClock};
use steadfast_core::event::{Event, IncomingEvent};
use steadfast_core::function::FunctionConfig;
use steadfast_core::lifecycle::{IngestResult, Lifecycle, Scheduled};
use steadfast_core::pause::PauseStore;
use steadfast_core::error::QueueError;
use steadfast_core::run::{Run, RunStatus};
use steadfast_core::state::StateStore;
use steadfast_core::worker::{Worker, WorkerPoolConfig};
use steadfast_core::SteadfastRuntime;
use steadfast_core::id::RunId;

const SDK_HEADER: &str = "x-inngest-sdk";

struct Engine {
    lifecycle: Arc<Lifecycle>,
    clock: Arc<ManualClock>,
    worker: Worker,
}

async fn engine(function: FunctionConfig) -> Engine {
    let clock = Arc::new(ManualClock::starting_now());
    let lifecycle = SteadfastRuntime::builder()
        .clock(clock.clone())
        .functions(vec![function])
        .build()
        .unwrap()
        .assemble()
        .await
        .unwrap();
    let worker = Worker::new("e2e", lifecycle.clone(), WorkerPoolConfig::default());
    Engine {
        lifecycle,
        clock,
        worker,
    }
}

impl Engine {
    async fn send(&self, name: &str, data: Value) -> IngestResult {
        let event = Event::ingest(IncomingEvent::new(name, data), Uuid::nil(), None, self.clock.now()).unwrap();
        self.lifecycle.ingest(event).await.unwrap()
    }

    /// Tick until no item is due.
    async fn drive(&self) -> usize {
        let mut total = 0;
        for _ in 0..32 {
            let n = self.worker.tick().await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }

    async fn run(&self, run_id: RunId) -> Run {
        self.lifecycle.state().load_run(run_id).await.unwrap().unwrap()
    }

    /// Jump to the run's next queued item.
    fn skip_to_next_item(&self, run_id: RunId) {
        let next = self
            .lifecycle
            .queue()
            .items_for_run(run_id)
            .into_iter()
            .map(|i| i.earliest_at)
            .min()
            .unwrap();
        if next > self.clock.now() {
            self.clock.set(next);
        }
    }
}

fn function(server: &MockServer, cfg: Value) -> FunctionConfig {
    let mut base = json!({
        "slug": "checkout",
        "name": "Checkout",
        "triggers": [{"event": "order.created"}],
        "steps": [{"id": "step", "url": format!("{}/api/steps", server.uri())}]
    });
    if let (Some(base), Some(extra)) = (base.as_object_mut(), cfg.as_object()) {
        base.extend(extra.clone());
    }
    serde_json::from_value(base).unwrap()
}

fn sdk(status: u16, body: Value) -> ResponseTemplate {
    ResponseTemplate::new(status)
        .insert_header(SDK_HEADER, "rust:v1")
        .set_body_json(body)
}

fn started(result: &IngestResult) -> RunId {
    match result.runs.as_slice() {
        [Scheduled::Started { run_id }] => *run_id,
        other => panic!("expected one started run, got {other:?}"),
    }
}

async fn attempts_seen(server: &MockServer) -> Vec<u64> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.body_json::<Value>().unwrap()["ctx"]["attempt"].as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_simple_step_completes_after_one_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/steps"))
        .respond_with(sdk(200, json!({"opcode": "run_complete", "data": {"v": 1}})))
        .expect(1)
        .mount(&server)
        .await;

    let e = engine(function(&server, json!({}))).await;
    let run_id = started(&e.send("order.created", json!({"id": "A"})).await);
    e.drive().await;

    let run = e.run(run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!({"v": 1})));
    assert!(e.lifecycle.queue().is_empty());
}

#[tokio::test]
async fn test_infra_retries_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sdk(500, json!({"error": "boom"})))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(sdk(200, json!([{"op": "Step", "id": "charge", "data": "ok"}])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"steps": {"charge": "ok"}})))
        .respond_with(sdk(200, json!({"opcode": "run_complete", "data": "done"})))
        .mount(&server)
        .await;

    let e = engine(function(&server, json!({}))).await;
    let run_id = started(&e.send("order.created", json!({})).await);

    assert_eq!(e.drive().await, 1);
    e.skip_to_next_item(run_id);
    assert_eq!(e.drive().await, 1);
    e.skip_to_next_item(run_id);
    // Third attempt records the step, its continuation completes the run.
    assert_eq!(e.drive().await, 2);

    let run = e.run(run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!("done")));

    let state = e.lifecycle.state().load(run_id).await.unwrap();
    assert_eq!(state.stack.len(), 1);
    assert_eq!(state.stack[0].step_id, "charge");
    assert_eq!(state.stack[0].attempt, 2);
    assert_eq!(attempts_seen(&server).await, vec![0, 1, 2, 0]);
}

fn wait_for_payment() -> Value {
    json!([{
        "op": "WaitForEvent",
        "id": "wait",
        "opts": {
            "event": "order.paid",
            "if": "event.data.id == \"A\"",
            "timeout": "1h",
            "bind_as": "payment"
        }
    }])
}

#[tokio::test]
async fn test_wait_for_event_match_resumes_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sdk(200, wait_for_payment()))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"steps": {"payment": {"name": "order.paid", "data": {"id": "A"}}}})))
        .respond_with(sdk(200, json!({"opcode": "run_complete", "data": "paid"})))
        .expect(1)
        .mount(&server)
        .await;

    let e = engine(function(&server, json!({}))).await;
    let run_id = started(&e.send("order.created", json!({"id": "A"})).await);
    e.drive().await;
    assert_eq!(e.run(run_id).await.status, RunStatus::Waiting);

    assert!(e.send("order.paid", json!({"id": "B"})).await.resumed.is_empty());
    e.clock.advance(chrono::Duration::minutes(30));
    assert_eq!(e.send("order.paid", json!({"id": "A"})).await.resumed.len(), 1);
    assert!(e.send("order.paid", json!({"id": "A"})).await.resumed.is_empty());

    e.drive().await;
    let run = e.run(run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!("paid")));
    assert!(e.lifecycle.pauses().by_run(run_id).await.unwrap().is_empty());
    assert!(e.lifecycle.queue().items_for_run(run_id).is_empty());
}

#[tokio::test]
async fn test_wait_for_event_timeout_continues() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sdk(200, wait_for_payment()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"steps": {"payment": null}})))
        .respond_with(sdk(200, json!({"opcode": "run_complete", "data": "expired"})))
        .expect(1)
        .mount(&server)
        .await;

    let e = engine(function(&server, json!({}))).await;
    let run_id = started(&e.send("order.created", json!({"id": "A"})).await);
    e.drive().await;
    assert_eq!(e.run(run_id).await.status, RunStatus::Waiting);

    // Nothing is due before the timeout.
    e.clock.advance(chrono::Duration::minutes(59));
    assert_eq!(e.drive().await, 0);

    e.clock.advance(chrono::Duration::minutes(1));
    e.drive().await;
    let run = e.run(run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!("expired")));

    // A late event finds no pause.
    assert!(e.send("order.paid", json!({"id": "A"})).await.resumed.is_empty());
}

#[tokio::test]
async fn test_concurrency_limit_defers_second_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sdk(200, json!({"opcode": "run_complete", "data": null})))
        .expect(2)
        .mount(&server)
        .await;

    let e = engine(function(&server, json!({"concurrency": [{"scope": "fn", "limit": 1}]}))).await;
    let first = started(&e.send("order.created", json!({"n": 1})).await);
    let second = started(&e.send("order.created", json!({"n": 2})).await);

    let queue = e.lifecycle.queue();
    let ttl = Duration::from_secs(30);
    let leases = queue.lease_partition("worker-e2e", 16, ttl);
    assert_eq!(leases.len(), 1);
    let ids = queue.peek(&leases[0], 10).unwrap();
    assert_eq!(ids.len(), 2);

    let held = queue.lease_item(&leases[0], ids[0], ttl).unwrap();
    let key = held.concurrency[0].key.clone();
    assert_eq!(queue.in_flight(&key), 1);
    assert!(matches!(
        queue.lease_item(&leases[0], ids[1], ttl),
        Err(QueueError::ConcurrencyLimited { .. })
    ));
    assert_eq!(queue.in_flight(&key), 1);

    // Giving the first slot back lets the second run through.
    queue.nack(held.id, held.lease_token, Some(e.clock.now()), false).unwrap();
    queue.release_partition(&leases[0]);
    assert_eq!(queue.in_flight(&key), 0);

    e.clock.advance(chrono::Duration::seconds(31));
    for _ in 0..8 {
        e.worker.tick().await.unwrap();
        assert!(queue.in_flight(&key) <= 1);
        e.clock.advance(chrono::Duration::seconds(31));
    }
    assert_eq!(e.run(first).await.status, RunStatus::Completed);
    assert_eq!(e.run(second).await.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_cancel_event_cancels_run_between_steps() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sdk(200, json!([{"op": "Step", "id": "reserve", "data": 1}])))
        .expect(1)
        .mount(&server)
        .await;

    let e = engine(function(
        &server,
        json!({"cancel": [{"event": "order.cancelled", "if": "event.data.id == ctx.event.data.id"}]}),
    ))
    .await;
    let run_id = started(&e.send("order.created", json!({"id": "A"})).await);
    assert_eq!(e.worker.tick().await.unwrap(), 1);
    // The continuation is queued.
    assert_eq!(e.lifecycle.queue().items_for_run(run_id).len(), 1);

    assert!(e.send("order.cancelled", json!({"id": "B"})).await.cancelled.is_empty());
    let result = e.send("order.cancelled", json!({"id": "A"})).await;
    assert_eq!(result.cancelled, vec![run_id]);

    assert_eq!(e.run(run_id).await.status, RunStatus::Cancelled);
    assert!(e.lifecycle.pauses().by_run(run_id).await.unwrap().is_empty());
    assert!(e.lifecycle.queue().items_for_run(run_id).is_empty());
    assert_eq!(e.drive().await, 0);
}
