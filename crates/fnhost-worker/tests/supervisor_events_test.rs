// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event emission of the worker process supervisor.
//!
//! An unexpected exit must produce exactly one `WorkerError` followed by
//! exactly one `WorkerRestart`; an exit caused by `stop()` produces nothing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fnhost_worker::supervisor::RpcWorkerStrategy;
use fnhost_worker::{
    EventBus, EventKind, HostEvent, MockProcessFactory, ProcessState, Subscription,
    SupervisorConfig, WorkerContextBuilder, WorkerProcessArguments, WorkerProcessSupervisor,
};
use tokio_util::sync::CancellationToken;

fn recorder(bus: &EventBus) -> (Arc<Mutex<Vec<HostEvent>>>, Vec<Subscription>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let subs = [EventKind::WorkerError, EventKind::WorkerRestart]
        .into_iter()
        .map(|kind| {
            let events = events.clone();
            bus.subscribe(kind, move |event| events.lock().unwrap().push(event.clone()))
        })
        .collect();
    (events, subs)
}

fn supervisor(bus: &EventBus, factory: Arc<MockProcessFactory>) -> WorkerProcessSupervisor {
    let builder = WorkerContextBuilder::new(
        "python-1",
        WorkerProcessArguments {
            executable_path: "python3".to_string(),
            worker_path: Some("/workers/python/worker.py".to_string()),
            ..Default::default()
        },
        "/home/site/wwwroot",
        "http://127.0.0.1:7071",
    );
    let strategy = Arc::new(RpcWorkerStrategy::new("python", builder, bus.clone()));
    WorkerProcessSupervisor::new(
        "python-1",
        factory,
        strategy,
        SupervisorConfig {
            graceful_stop_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    )
}

async fn wait_until_stopped(sup: &WorkerProcessSupervisor) {
    for _ in 0..200 {
        if sup.state() == ProcessState::Stopped {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("supervisor did not stop, state {}", sup.state());
}

#[tokio::test]
async fn unexpected_exit_emits_error_then_restart() {
    let bus = EventBus::new();
    let (events, _subs) = recorder(&bus);
    let factory = Arc::new(MockProcessFactory::new());
    let sup = supervisor(&bus, factory.clone());

    sup.start(&CancellationToken::new()).await.unwrap();
    let process = factory.last_process().unwrap();
    process.crash_with_signal(11);
    wait_until_stopped(&sup).await;

    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 2, "events: {events:?}");

    match &events[0] {
        HostEvent::WorkerError {
            runtime,
            worker_id,
            cause,
            ..
        } => {
            assert_eq!(runtime, "python");
            assert_eq!(worker_id, "python-1");
            assert_eq!(cause.pid, Some(process.pid()));
            assert_eq!(cause.signal, Some(11));
            assert_eq!(cause.exit_code, None);
        }
        other => panic!("expected WorkerError first, got {other:?}"),
    }
    assert!(matches!(
        &events[1],
        HostEvent::WorkerRestart { runtime, worker_id, .. }
            if runtime == "python" && worker_id == "python-1"
    ));
}

#[tokio::test]
async fn exit_after_stop_emits_nothing() {
    let bus = EventBus::new();
    let (events, _subs) = recorder(&bus);
    let factory = Arc::new(MockProcessFactory::new());
    let sup = supervisor(&bus, factory.clone());
    let cancel = CancellationToken::new();

    sup.start(&cancel).await.unwrap();
    sup.stop(&cancel).await.unwrap();

    // A late exit notification from the dead process changes nothing.
    factory.last_process().unwrap().exit(1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(events.lock().unwrap().is_empty());
    assert_eq!(sup.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn each_start_gets_fresh_context() {
    let bus = EventBus::new();
    let factory = Arc::new(MockProcessFactory::new());
    let sup = supervisor(&bus, factory.clone());
    let cancel = CancellationToken::new();

    sup.start(&cancel).await.unwrap();
    sup.stop(&cancel).await.unwrap();
    sup.start(&cancel).await.unwrap();

    let contexts = factory.launched_contexts();
    assert_eq!(contexts.len(), 2);
    assert_ne!(contexts[0].request_id, contexts[1].request_id);
    assert!(
        contexts[1]
            .command_line_args()
            .contains(&"/workers/python/worker.py".to_string())
    );
}

#[tokio::test]
async fn crash_is_reported_once_per_process() {
    let bus = EventBus::new();
    let (events, _subs) = recorder(&bus);
    let factory = Arc::new(MockProcessFactory::new());
    let sup = supervisor(&bus, factory.clone());
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        sup.start(&cancel).await.unwrap();
        factory.last_process().unwrap().exit(1);
        wait_until_stopped(&sup).await;
    }

    let kinds: Vec<_> = events.lock().unwrap().iter().map(HostEvent::kind).collect();
    assert_eq!(
        kinds,
        [EventKind::WorkerError, EventKind::WorkerRestart].repeat(3)
    );
}
