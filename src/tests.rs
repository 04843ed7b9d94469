// Copyright 2025 Accord project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use testutil::{MockFactory, RecordingHandler, ServiceStep};

use crate::{Classified, CloseCode, Client, Code, Config, Frame};

fn config() -> Config {
    Config {
        base_url: "wss://gateway.test/".to_string(),
        ..Config::default()
    }
}

fn connect_script(factory: &MockFactory) {
    factory.push_script(vec![ServiceStep::running(vec![Frame::Connect {
        protocols: String::new(),
    }])]);
}

#[test]
fn run_exits_ok_after_a_requested_shutdown() {
    let _ = env_logger::builder().is_test(true).try_init();

    let factory = MockFactory::new();
    connect_script(&factory);
    let client = Arc::new(
        Client::new(factory.clone(), Arc::new(RecordingHandler::new()), config()).unwrap(),
    );

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let client = client.clone();
        let factory = factory.clone();
        let fired = fired.clone();
        let client_for_closure = client.clone();
        client.timer(
            Arc::new(move |_, _| {
                fired.fetch_add(1, Ordering::SeqCst);
                client_for_closure.shutdown();
                factory.force_stop();
            }),
            10,
        );
    }

    assert_eq!(client.run(), Code::Ok);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(
        factory.closes(),
        vec![(CloseCode::Normal, "Shutdown gracefully".to_string())]
    );
}

#[test]
fn run_exits_connection_when_reconnects_are_exhausted() {
    let factory = MockFactory::new();
    // No script at all: the transport never comes up and never will.
    let client =
        Client::new(factory.clone(), Arc::new(RecordingHandler::new()), config()).unwrap();
    assert_eq!(client.run(), Code::Connection);
    // The initial open plus the fresh handle built when the loss was observed.
    assert_eq!(factory.opens().len(), 2);
}

#[test]
fn interval_timers_fire_while_the_loop_runs() {
    let factory = MockFactory::new();
    connect_script(&factory);
    let client = Arc::new(
        Client::new(factory.clone(), Arc::new(RecordingHandler::new()), config()).unwrap(),
    );

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let client = client.clone();
        let factory = factory.clone();
        let fired = fired.clone();
        let client_for_closure = client.clone();
        client.timer_interval(
            Arc::new(move |_, _| {
                let n = fired.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 3 {
                    client_for_closure.shutdown();
                    factory.force_stop();
                }
            }),
            5,
            5,
            3,
        );
    }

    assert_eq!(client.run(), Code::Ok);
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

#[test]
fn classified_events_reach_a_worker_during_the_run() {
    let factory = MockFactory::new();
    factory.push_script(vec![ServiceStep::running(vec![
        Frame::Connect {
            protocols: String::new(),
        },
        Frame::Text("EVENT:hello".to_string()),
    ])]);
    let handler = RecordingHandler::with_classifier(|text| {
        text.strip_prefix("EVENT:")
            .map(|payload| Classified::with_data(42, Box::new(payload.to_string())))
    });
    let client = Arc::new(Client::new(factory.clone(), Arc::new(handler), config()).unwrap());

    let (seen_tx, seen_rx) = crossbeam_channel::bounded::<String>(1);
    {
        let client = client.clone();
        let factory = factory.clone();
        let client_for_closure = client.clone();
        client.set_event(
            42,
            Arc::new(move |data| {
                let payload = data.unwrap().downcast_ref::<String>().unwrap();
                seen_tx.send(payload.clone()).unwrap();
                client_for_closure.shutdown();
                factory.force_stop();
            }),
        );
    }

    assert_eq!(client.run(), Code::Ok);
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "hello"
    );
}

#[test]
fn from_toml_builds_a_client() {
    let factory = MockFactory::new();
    let client = Client::from_toml(
        factory,
        Arc::new(RecordingHandler::new()),
        r#"base_url = "wss://gateway.test/""#,
    );
    assert!(client.is_ok());
}

#[test]
fn from_toml_rejects_a_bad_endpoint() {
    let factory = MockFactory::new();
    let client = Client::from_toml(
        factory,
        Arc::new(RecordingHandler::new()),
        r#"base_url = "not a url""#,
    );
    assert!(client.is_err());
}
