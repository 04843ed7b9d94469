// Copyright 2025 Accord project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).


mod close_code;
mod workers;

pub use crate::close_code::CloseCode;
pub use crate::workers::{EventCallback, FrameData, WorkerPool};

use std::sync::Arc;
use std::time::Duration;

use clock::Clock;
use log::{debug, error, warn};
use parking_lot::Mutex;

/// Log target for raw traffic dumps; enable with `RUST_LOG=session::wire=debug`.
const WIRE: &str = "session::wire";

///
/// Where a session is in its connection lifecycle.
///
/// `Disconnected` is both the starting state and the resting state after a transport loss;
/// `Fresh` marks a deliberate reconnect in flight; `Shutdown` is requested, never stored: it
/// saturates the reconnect budget and coerces to `Disconnecting`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Fresh,
    Connected,
    Disconnecting,
    Disconnected,
    Shutdown,
}

///
/// A decoded frame delivered by the transport during a service step.
///
#[derive(Debug)]
pub enum Frame {
    Connect { protocols: String },
    Text(String),
    Binary(Vec<u8>),
    Ping(String),
    Pong(String),
    Close { code: CloseCode, reason: String },
}

///
/// The byte-level WebSocket machinery the session drives. Implementations own one connection
/// attempt; reconnection is modeled by the factory handing out a fresh transport.
///
/// Only the I/O thread calls `service`/`wait`; `close` and `send_text` arrive under the
/// session's transport lock.
///
pub trait Transport: Send + 'static {
    /// Non-blocking service step: make progress, append any decoded frames that arrived, and
    /// report whether the connection is still running.
    fn service(&mut self, frames: &mut Vec<Frame>) -> bool;

    /// Block until socket activity or the timeout elapses.
    fn wait(&mut self, timeout: Duration);

    /// Begin a graceful close handshake.
    fn close(&mut self, code: CloseCode, reason: &str);

    fn send_text(&mut self, text: &str) -> Result<(), String>;
}

///
/// Builds transports and can interrupt a transport currently blocked in `wait` (so a state
/// change requested off the I/O thread is observed promptly).
///
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport;

    /// Construct an idle transport aimed at `base_url`.
    fn open(&self, base_url: &str) -> Self::Transport;

    /// Poke the I/O poller awake.
    fn wake(&self);
}

///
/// The classifier's verdict for a text frame: the event code to dispatch under, plus any
/// per-frame payload that should travel to the matching event callback's worker. The payload's
/// cleanup is its `Drop`, which runs on the worker once the callback returns, or right away
/// if no event callback matches the code.
///
pub struct Classified {
    pub code: i32,
    pub data: Option<FrameData>,
}

impl Classified {
    pub fn new(code: i32) -> Classified {
        Classified { code, data: None }
    }

    pub fn with_data(code: i32, data: FrameData) -> Classified {
        Classified {
            code,
            data: Some(data),
        }
    }
}

///
/// User-facing notification hooks. Every method defaults to a no-op, mirroring how a freshly
/// initialized session behaves before any callbacks are registered.
///
pub trait SessionHandler: Send + Sync + 'static {
    /// Classify a text frame into an event code. `None` means "no event": the frame is
    /// delivered to `on_text` instead of the worker pool.
    fn classify_text(&self, _text: &str) -> Option<Classified> {
        None
    }

    fn on_connect(&self, _protocols: &str) {}
    fn on_text(&self, _text: &str) {}
    fn on_binary(&self, _data: &[u8]) {}
    fn on_ping(&self, _reason: &str) {}
    fn on_pong(&self, _reason: &str) {}
    fn on_close(&self, _code: CloseCode, _reason: &str) {}
}

/// A handler with every hook left at its default.
pub struct NoopHandler;

impl SessionHandler for NoopHandler {}

///
/// Session tunables. The defaults match a conservative gateway client: five reconnect attempts,
/// a 100ms poll cadence, ten workers.
///
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub base_url: String,
    pub reconnect_threshold: u32,
    pub refresh_rate_ms: u64,
    pub workers: usize,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            base_url: String::new(),
            reconnect_threshold: 5,
            refresh_rate_ms: 100,
            workers: 10,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Reconnect {
    threshold: u32,
    attempt: u32,
}

enum TransportAction {
    Close { code: CloseCode, reason: String },
    Reset,
}

struct State {
    status: Status,
    base_url: String,
    is_running: bool,
    now_tstamp: u64,
    refresh_rate_ms: u64,
    reconnect: Reconnect,
    events: Vec<(i32, EventCallback)>,
    // Transport work requested off the I/O thread, applied in order at the top of the next
    // service tick. Keeps the transport handle single-threaded and the lock order one-way
    // (transport before state).
    pending: Vec<TransportAction>,
}

///
/// One logical connection lifecycle against a remote gateway, including reconnect bookkeeping,
/// per-frame event dispatch onto the worker pool, and the graceful-close state machine.
///
/// The session surface is infallible: transport-level failures are logged and resolved through
/// the status machine rather than surfaced to callers.
///
pub struct Session<F: TransportFactory> {
    state: Mutex<State>,
    transport: Mutex<F::Transport>,
    factory: F,
    handler: Arc<dyn SessionHandler>,
    pool: WorkerPool,
    clock: Arc<dyn Clock>,
}

impl<F: TransportFactory> Session<F> {
    pub fn new(
        factory: F,
        handler: Arc<dyn SessionHandler>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Result<Session<F>, String> {
        if config.workers == 0 {
            return Err("Worker pool size must be at least 1".to_string());
        }
        let base_url = validate_url(&config.base_url)?;
        let transport = factory.open(&base_url);
        Ok(Session {
            state: Mutex::new(State {
                status: Status::Disconnected,
                base_url,
                is_running: false,
                now_tstamp: 0,
                refresh_rate_ms: config.refresh_rate_ms,
                reconnect: Reconnect {
                    threshold: config.reconnect_threshold,
                    attempt: 0,
                },
                events: Vec::new(),
                pending: Vec::new(),
            }),
            transport: Mutex::new(transport),
            factory,
            handler,
            pool: WorkerPool::new(config.workers),
            clock,
        })
    }

    ///
    /// One service tick, driven by the I/O thread: apply any transport work requested since the
    /// last tick, step the transport, dispatch whatever frames arrived, and, if the transport
    /// stopped, run the reconnect loop until it comes back or the attempt budget is spent.
    ///
    /// Returns whether the transport is running.
    ///
    pub fn perform(&self) -> bool {
        {
            let mut state = self.state.lock();
            state.now_tstamp = self.clock.now_ms();
        }

        let (mut running, frames) = {
            let mut transport = self.transport.lock();
            self.apply_pending(&mut transport);
            let mut frames = Vec::new();
            let running = transport.service(&mut frames);
            (running, frames)
        };
        self.state.lock().is_running = running;
        self.dispatch_frames(frames);

        if !running {
            self.set_status(Status::Disconnected);
            loop {
                {
                    let mut state = self.state.lock();
                    if state.reconnect.attempt >= state.reconnect.threshold {
                        warn!(
                            "Failed all reconnect attempts ({}); giving up",
                            state.reconnect.attempt
                        );
                        state.reconnect.attempt = 0;
                        break;
                    }
                }

                let frames = {
                    let mut transport = self.transport.lock();
                    self.apply_pending(&mut transport);
                    let mut frames = Vec::new();
                    running = transport.service(&mut frames);
                    transport.wait(Duration::from_millis(1000));
                    frames
                };
                {
                    let mut state = self.state.lock();
                    state.is_running = running;
                    state.reconnect.attempt += 1;
                }
                self.dispatch_frames(frames);
                if running {
                    break;
                }
            }
        }
        running
    }

    /// Block until socket activity or the timeout; the poll cadence between service ticks.
    pub fn wait_activity(&self, timeout: Duration) {
        self.transport.lock().wait(timeout);
    }

    ///
    /// Register an event callback. Text frames the classifier maps to `code` are run on a
    /// worker with the frame's payload.
    ///
    /// The event pool is read on the hot dispatch path, so registration is only legal while
    /// the session is disconnected.
    ///
    pub fn set_event(&self, code: i32, cb: EventCallback) {
        let mut state = self.state.lock();
        assert!(
            state.status == Status::Disconnected,
            "Can't register an event on a running session"
        );
        state.events.push((code, cb));
    }

    /// Send a text frame. Failures are logged; the next service tick will surface a dead
    /// transport and drive reconnection.
    pub fn send_text(&self, text: &str) {
        debug!(target: WIRE, "send TEXT ({} bytes)", text.len());
        let mut transport = self.transport.lock();
        if let Err(e) = transport.send_text(text) {
            error!("Couldn't send websocket payload: {e}");
        }
    }

    /// Begin a graceful close with an explicit code and reason.
    pub fn close(&self, code: CloseCode, reason: &str) {
        debug!(target: WIRE, "send CLOSE {code}: {reason}");
        self.transport.lock().close(code, reason);
    }

    ///
    /// Drive the status machine. Setting `Disconnected` while the transport still runs coerces
    /// to `Disconnecting` with a graceful close; `Shutdown` additionally spends the whole
    /// reconnect budget so the session will not come back.
    ///
    pub fn set_status(&self, status: Status) {
        {
            let mut state = self.state.lock();
            Self::transition(&mut state, status);
        }
        self.factory.wake();
    }

    /// Gracefully shut the session down; terminal unless a new run is started by hand.
    pub fn shutdown(&self) {
        self.set_status(Status::Shutdown);
    }

    ///
    /// Swap the endpoint, closing the current connection gracefully if one is up. The next
    /// transport reset connects against the new URL.
    ///
    pub fn redirect(&self, base_url: &str) -> Result<(), String> {
        let validated = validate_url(base_url)?;
        {
            let mut state = self.state.lock();
            if state.is_running {
                queue_close(&mut state, CloseCode::Normal, "Redirect gracefully");
                state.status = Status::Disconnecting;
            }
            state.base_url = validated;
        }
        self.factory.wake();
        Ok(())
    }

    ///
    /// Tear the current connection down gracefully and come back up against the same endpoint.
    /// A no-op while disconnected.
    ///
    pub fn reconnect(&self) {
        {
            let mut state = self.state.lock();
            if state.status == Status::Disconnected {
                return;
            }
            state.status = Status::Fresh;
            queue_close(&mut state, CloseCode::Normal, "Reconnect gracefully");
        }
        self.factory.wake();
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running
    }

    /// The timestamp captured at the top of the current service tick, in milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.state.lock().now_tstamp
    }

    pub fn base_url(&self) -> String {
        self.state.lock().base_url.clone()
    }

    pub fn refresh_rate_ms(&self) -> u64 {
        self.state.lock().refresh_rate_ms
    }

    pub fn set_refresh_rate(&self, refresh_rate_ms: u64) {
        self.state.lock().refresh_rate_ms = refresh_rate_ms;
    }

    pub fn set_max_reconnect(&self, threshold: u32) {
        self.state.lock().reconnect.threshold = threshold;
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.state.lock().reconnect.attempt
    }

    /// Workers not currently running an event callback.
    pub fn idle_workers(&self) -> usize {
        self.pool.idle()
    }

    /// Poke the I/O poller awake, interrupting a `wait_activity` in progress.
    pub fn wake(&self) {
        self.factory.wake();
    }

    fn transition(state: &mut State, mut status: Status) {
        // A disconnect request against a live transport must shut down safely first.
        if status == Status::Disconnected && state.is_running {
            status = Status::Disconnecting;
        }
        match status {
            Status::Connected => state.reconnect.attempt = 0,
            Status::Disconnected => state.pending.push(TransportAction::Reset),
            Status::Shutdown | Status::Disconnecting => {
                if status == Status::Shutdown {
                    state.reconnect.attempt = state.reconnect.threshold;
                    status = Status::Disconnecting;
                }
                if state.is_running {
                    queue_close(state, CloseCode::Normal, "Shutdown gracefully");
                }
            }
            Status::Fresh => {}
        }
        state.status = status;
    }

    fn apply_pending(&self, transport: &mut F::Transport) {
        let actions = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending)
        };
        for action in actions {
            match action {
                TransportAction::Close { code, reason } => {
                    debug!(target: WIRE, "send CLOSE {code}: {reason}");
                    transport.close(code, &reason);
                }
                TransportAction::Reset => {
                    let base_url = self.state.lock().base_url.clone();
                    *transport = self.factory.open(&base_url);
                }
            }
        }
    }

    fn dispatch_frames(&self, frames: Vec<Frame>) {
        for frame in frames {
            match frame {
                Frame::Connect { protocols } => {
                    debug!(target: WIRE, "recv CONNECT: {protocols}");
                    self.set_status(Status::Connected);
                    self.handler.on_connect(&protocols);
                }
                Frame::Text(text) => self.dispatch_text(&text),
                Frame::Binary(data) => {
                    debug!(target: WIRE, "recv BINARY ({} bytes)", data.len());
                    self.handler.on_binary(&data);
                }
                Frame::Ping(reason) => {
                    debug!(target: WIRE, "recv PING: {reason}");
                    self.handler.on_ping(&reason);
                }
                Frame::Pong(reason) => {
                    debug!(target: WIRE, "recv PONG: {reason}");
                    self.handler.on_pong(&reason);
                }
                Frame::Close { code, reason } => {
                    debug!(target: WIRE, "recv CLOSE {code}: {reason}");
                    self.handler.on_close(code, &reason);
                }
            }
        }
    }

    fn dispatch_text(&self, text: &str) {
        debug!(target: WIRE, "recv TEXT ({} bytes)", text.len());
        if let Some(classified) = self.handler.classify_text(text) {
            let cb = {
                let state = self.state.lock();
                state
                    .events
                    .iter()
                    .find(|(code, _)| *code == classified.code)
                    .map(|(_, cb)| cb.clone())
            };
            if let Some(cb) = cb {
                // Blocks until a worker is idle: deliberate backpressure on the I/O thread.
                self.pool.dispatch(cb, classified.data);
                return;
            }
            // An event code nothing is registered for: the payload's cleanup runs now and the
            // frame falls through as plain text.
            drop(classified.data);
        }
        self.handler.on_text(text);
    }
}

fn queue_close(state: &mut State, code: CloseCode, reason: &str) {
    state.pending.push(TransportAction::Close {
        code,
        reason: reason.to_string(),
    });
}

fn validate_url(base_url: &str) -> Result<String, String> {
    url::Url::parse(base_url).map_err(|e| format!("Invalid base URL `{base_url}`: {e}"))?;
    Ok(base_url.to_string())
}
