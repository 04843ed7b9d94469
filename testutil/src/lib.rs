// Copyright 2025 Accord project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use session::{Classified, CloseCode, Frame, SessionHandler, Transport, TransportFactory};

///
/// One scripted outcome of a `Transport::service` call: the frames it delivers and whether the
/// connection is still running afterwards.
///
pub struct ServiceStep {
    pub frames: Vec<Frame>,
    pub running: bool,
}

impl ServiceStep {
    /// A healthy step delivering the given frames.
    pub fn running(frames: Vec<Frame>) -> ServiceStep {
        ServiceStep {
            frames,
            running: true,
        }
    }

    /// The connection is (or has gone) down.
    pub fn stopped() -> ServiceStep {
        ServiceStep {
            frames: Vec::new(),
            running: false,
        }
    }
}

#[derive(Default)]
struct Recording {
    opens: Vec<String>,
    closes: Vec<(CloseCode, String)>,
    sent: Vec<String>,
    waits: Vec<Duration>,
    wakes: usize,
    services: usize,
}

#[derive(Default)]
struct FactoryInner {
    // One script per `open`, consumed front to back. An open with no script gets a transport
    // that idles at its last known running state (initially stopped).
    scripts: VecDeque<Vec<ServiceStep>>,
    recording: Recording,
    fail_sends: bool,
    force_stop: bool,
}

///
/// A scripted stand-in for the real WebSocket machinery. Clones share state, so a test can keep
/// one handle for scripting and inspection while the session owns another.
///
#[derive(Clone)]
pub struct MockFactory {
    inner: Arc<Mutex<FactoryInner>>,
}

impl MockFactory {
    pub fn new() -> MockFactory {
        MockFactory {
            inner: Arc::new(Mutex::new(FactoryInner::default())),
        }
    }

    /// Queue the service script for the next `open`.
    pub fn push_script(&self, steps: Vec<ServiceStep>) {
        self.inner.lock().scripts.push_back(steps);
    }

    /// Make every subsequent `send_text` fail.
    pub fn set_send_failure(&self, fail: bool) {
        self.inner.lock().fail_sends = fail;
    }

    /// Kill whatever transport is current: every subsequent `service` reports not-running,
    /// regardless of script. Cleared by the next `open`.
    pub fn force_stop(&self) {
        self.inner.lock().force_stop = true;
    }

    pub fn opens(&self) -> Vec<String> {
        self.inner.lock().recording.opens.clone()
    }

    pub fn closes(&self) -> Vec<(CloseCode, String)> {
        self.inner.lock().recording.closes.clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.inner.lock().recording.sent.clone()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.inner.lock().recording.waits.clone()
    }

    pub fn wakes(&self) -> usize {
        self.inner.lock().recording.wakes
    }

    pub fn services(&self) -> usize {
        self.inner.lock().recording.services
    }
}

impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    fn open(&self, base_url: &str) -> MockTransport {
        let mut inner = self.inner.lock();
        inner.recording.opens.push(base_url.to_string());
        inner.force_stop = false;
        let script = inner.scripts.pop_front().unwrap_or_default();
        MockTransport {
            inner: self.inner.clone(),
            script: script.into(),
            idle_running: false,
        }
    }

    fn wake(&self) {
        self.inner.lock().recording.wakes += 1;
    }
}

pub struct MockTransport {
    inner: Arc<Mutex<FactoryInner>>,
    script: VecDeque<ServiceStep>,
    idle_running: bool,
}

impl Transport for MockTransport {
    fn service(&mut self, frames: &mut Vec<Frame>) -> bool {
        let mut inner = self.inner.lock();
        inner.recording.services += 1;
        if inner.force_stop {
            self.idle_running = false;
            return false;
        }
        drop(inner);
        match self.script.pop_front() {
            Some(step) => {
                frames.extend(step.frames);
                self.idle_running = step.running;
                step.running
            }
            None => self.idle_running,
        }
    }

    fn wait(&mut self, timeout: Duration) {
        self.inner.lock().recording.waits.push(timeout);
    }

    fn close(&mut self, code: CloseCode, reason: &str) {
        self.inner
            .lock()
            .recording
            .closes
            .push((code, reason.to_string()));
    }

    fn send_text(&mut self, text: &str) -> Result<(), String> {
        let mut inner = self.inner.lock();
        if inner.fail_sends {
            return Err("scripted send failure".to_string());
        }
        inner.recording.sent.push(text.to_string());
        Ok(())
    }
}

type Classifier = Box<dyn Fn(&str) -> Option<Classified> + Send + Sync>;

///
/// A `SessionHandler` that records every hook invocation as a readable line, with an optional
/// classifier closure for tests that exercise the event pool.
///
pub struct RecordingHandler {
    log: Arc<Mutex<Vec<String>>>,
    classify: Option<Classifier>,
}

impl RecordingHandler {
    pub fn new() -> RecordingHandler {
        RecordingHandler {
            log: Arc::new(Mutex::new(Vec::new())),
            classify: None,
        }
    }

    pub fn with_classifier(
        classify: impl Fn(&str) -> Option<Classified> + Send + Sync + 'static,
    ) -> RecordingHandler {
        RecordingHandler {
            log: Arc::new(Mutex::new(Vec::new())),
            classify: Some(Box::new(classify)),
        }
    }

    /// A shared handle onto the invocation log.
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        self.log.clone()
    }
}

impl SessionHandler for RecordingHandler {
    fn classify_text(&self, text: &str) -> Option<Classified> {
        self.classify.as_ref().and_then(|classify| classify(text))
    }

    fn on_connect(&self, protocols: &str) {
        self.log.lock().push(format!("connect:{protocols}"));
    }

    fn on_text(&self, text: &str) {
        self.log.lock().push(format!("text:{text}"));
    }

    fn on_binary(&self, data: &[u8]) {
        self.log.lock().push(format!("binary:{}", data.len()));
    }

    fn on_ping(&self, reason: &str) {
        self.log.lock().push(format!("ping:{reason}"));
    }

    fn on_pong(&self, reason: &str) {
        self.log.lock().push(format!("pong:{reason}"));
    }

    fn on_close(&self, code: CloseCode, reason: &str) {
        self.log.lock().push(format!("close:{}:{reason}", code.name()));
    }
}
