// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervision of real OS processes.
//!
//! Uses `/bin/sh` as a stand-in worker executable.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fnhost_worker::{
    ChannelState, EventBus, EventKind, HostEvent, NativeProcessFactory, RpcWorkerChannelFactory,
    SupervisorConfig, WorkerChannelFactory, WorkerContextBuilder, WorkerProcessArguments,
};
use tokio_util::sync::CancellationToken;

fn sh_factory(bus: &EventBus, script: &str) -> RpcWorkerChannelFactory {
    let template = WorkerContextBuilder::new(
        "template",
        WorkerProcessArguments {
            executable_path: "sh".to_string(),
            executable_arguments: vec!["-c".to_string(), script.to_string(), "worker".to_string()],
            worker_path: None,
            worker_arguments: vec![],
        },
        std::env::temp_dir(),
        "http://127.0.0.1:7071",
    );
    RpcWorkerChannelFactory::new("sh", bus.clone(), Arc::new(NativeProcessFactory::new()), template)
        .with_supervisor_config(SupervisorConfig {
            graceful_stop_timeout: Duration::from_secs(2),
            ..Default::default()
        })
}

#[tokio::test]
async fn crashing_worker_reports_exit_code_and_stderr() {
    let bus = EventBus::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded = events.clone();
    let _sub = bus.subscribe(EventKind::WorkerError, move |event| {
        recorded.lock().unwrap().push(event.clone());
    });

    let factory = sh_factory(&bus, "sleep 0.2; echo 'fatal: cannot load function app' >&2; exit 7");
    let channel = factory.create_channel("sh-1");
    channel.start_process(&CancellationToken::new()).await.unwrap();
    let pid = channel.pid();
    assert!(pid.is_some());

    for _ in 0..200 {
        if !events.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    match &events[0] {
        HostEvent::WorkerError { worker_id, cause, .. } => {
            assert_eq!(worker_id, "sh-1");
            assert_eq!(cause.pid, pid);
            assert_eq!(cause.exit_code, Some(7));
            assert!(cause.stderr_tail.contains("cannot load function app"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn stop_terminates_long_running_worker() {
    let bus = EventBus::new();
    let errors = Arc::new(Mutex::new(0usize));
    let counter = errors.clone();
    let _sub = bus.subscribe(EventKind::WorkerError, move |_| {
        *counter.lock().unwrap() += 1;
    });

    let factory = sh_factory(&bus, "echo ready; exec sleep 30");
    let channel = factory.create_channel("sh-2");
    let cancel = CancellationToken::new();

    channel.start_process(&cancel).await.unwrap();
    assert!(channel.get_status().await.is_ok());

    let started = std::time::Instant::now();
    channel.stop_process(&cancel).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(channel.state(), ChannelState::Stopped);
    assert_eq!(channel.pid(), None);
    assert_eq!(*errors.lock().unwrap(), 0);
}

#[tokio::test]
async fn stop_kills_worker_ignoring_sigterm() {
    let bus = EventBus::new();
    let factory = sh_factory(&bus, "trap '' TERM; while true; do sleep 0.05; done")
        .with_supervisor_config(SupervisorConfig {
            graceful_stop_timeout: Duration::from_millis(300),
            ..Default::default()
        });
    let channel = factory.create_channel("sh-3");
    let cancel = CancellationToken::new();

    channel.start_process(&cancel).await.unwrap();
    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    channel.stop_process(&cancel).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(channel.state(), ChannelState::Stopped);
}
