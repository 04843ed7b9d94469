// Copyright 2025 Accord project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The concurrency substrate of a gateway bot client: a WebSocket session manager driven by a
//! single I/O-polling thread, and a pair of priority-queue-backed timer schedulers. Everything
//! above this layer (REST surface, payload codecs, command routing) is someone else's problem;
//! everything below it (byte-level framing) hides behind [`Transport`].

#[cfg(test)]
mod tests;

mod config;
mod error;

pub use crate::config::Config;
pub use crate::error::Code;
pub use clock::{Clock, FakeClock, SystemClock};
pub use priority_queue::Id;
pub use session::{
    Classified, CloseCode, EventCallback, Frame, FrameData, NoopHandler, Session, SessionConfig,
    SessionHandler, Status, Transport, TransportFactory,
};
pub use timers::{Timer, TimerCallback, TimerFlags, TimerSet, Timers, Wakeup};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

// Adapts the session's poller wakeup to the scheduler's hook, so a ctl that shortens the next
// trigger interrupts a wait_activity in progress.
struct PollerWaker<F: TransportFactory>(Arc<Session<F>>);

impl<F: TransportFactory> Wakeup for PollerWaker<F> {
    fn wake(&self) {
        self.0.wake();
    }
}

///
/// The client facade: owns the session, both timer queues, and the I/O loop that drives them.
///
/// `run` occupies the calling thread until the session shuts down or reconnection is exhausted;
/// every other method is safe to call from any thread, including from timer and event
/// callbacks.
///
pub struct Client<F: TransportFactory> {
    session: Arc<Session<F>>,
    timers: TimerSet,
    clock: Arc<dyn Clock>,
    shutdown_requested: AtomicBool,
}

impl<F: TransportFactory> Client<F> {
    pub fn new(
        factory: F,
        handler: Arc<dyn SessionHandler>,
        config: Config,
    ) -> Result<Client<F>, String> {
        Self::with_clock(factory, handler, Arc::new(SystemClock::new()), config)
    }

    /// Build against a caller-supplied clock; tests drive time explicitly through a
    /// [`FakeClock`].
    pub fn with_clock(
        factory: F,
        handler: Arc<dyn SessionHandler>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Result<Client<F>, String> {
        let session = Arc::new(Session::new(
            factory,
            handler,
            clock.clone(),
            config.session_config(),
        )?);
        let timers = TimerSet::new(clock.clone());
        timers.set_wakeup(Arc::new(PollerWaker(session.clone())));
        Ok(Client {
            session,
            timers,
            clock,
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn from_toml(
        factory: F,
        handler: Arc<dyn SessionHandler>,
        raw: &str,
    ) -> Result<Client<F>, String> {
        Self::new(factory, handler, Config::from_toml_str(raw)?)
    }

    ///
    /// The I/O loop. Each turn asks the schedulers how long the poller may sleep (clamped by
    /// the session's refresh rate), waits for socket activity, services the session, then
    /// drains both timer queues.
    ///
    /// Returns once the transport is down for good: `Ok` after a requested shutdown,
    /// `Connection` when reconnection was exhausted.
    ///
    pub fn run(&self) -> Code {
        debug!("starting I/O loop against {}", self.session.base_url());
        loop {
            let now = self.clock.now_us();
            let budget_us = (self.session.refresh_rate_ms() * 1000) as i64;
            let sleep_us = timers::next_trigger(
                &[self.timers.user.as_ref(), self.timers.internal.as_ref()],
                now,
                budget_us,
            );
            self.session
                .wait_activity(Duration::from_micros(sleep_us as u64));

            let running = self.session.perform();
            self.timers.run();
            if !running {
                break;
            }
        }
        self.timers.cleanup();

        if self.shutdown_requested.load(Ordering::SeqCst) {
            Code::Ok
        } else {
            Code::Connection
        }
    }

    /// Gracefully end the run: close the connection and spend the reconnect budget.
    pub fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.session.shutdown();
    }

    /// Tear the connection down gracefully and establish a new one.
    pub fn reconnect(&self) {
        self.session.reconnect();
    }

    pub fn session(&self) -> &Arc<Session<F>> {
        &self.session
    }

    pub fn timers(&self) -> &TimerSet {
        &self.timers
    }

    /// Register an event callback on the session. Only legal while disconnected.
    pub fn set_event(&self, code: i32, cb: EventCallback) {
        self.session.set_event(code, cb);
    }

    pub fn send_text(&self, text: &str) {
        self.session.send_text(text);
    }

    /// The timestamp captured at the top of the current service tick, in milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.session.timestamp()
    }

    // ----- user-queue timer surface -----

    /// The universal create/update entry point against the user queue.
    pub fn timer_ctl(&self, timer: &mut Timer) -> Id {
        self.timers.user.ctl(timer)
    }

    pub fn timer(&self, cb: TimerCallback, delay_ms: i64) -> Id {
        self.timers.user.one_shot(cb, None, delay_ms)
    }

    pub fn timer_interval(
        &self,
        cb: TimerCallback,
        delay_ms: i64,
        interval_ms: i64,
        repeat: i64,
    ) -> Id {
        self.timers.user.interval(cb, None, delay_ms, interval_ms, repeat)
    }

    pub fn timer_get(&self, id: Id) -> Option<Timer> {
        self.timers.user.get(id)
    }

    pub fn timer_start(&self, id: Id) -> bool {
        self.timers.user.start(id)
    }

    pub fn timer_stop(&self, id: Id) -> bool {
        self.timers.user.stop(id)
    }

    pub fn timer_cancel(&self, id: Id) -> bool {
        self.timers.user.cancel(id)
    }

    pub fn timer_delete(&self, id: Id) -> bool {
        self.timers.user.delete(id)
    }

    pub fn timer_cancel_and_delete(&self, id: Id) -> bool {
        self.timers.user.cancel_and_delete(id)
    }

    // ----- internal-queue timer surface, for the layers built on top of the core -----

    pub fn internal_timer_ctl(&self, timer: &mut Timer) -> Id {
        self.timers.internal.ctl(timer)
    }

    pub fn internal_timer(&self, cb: TimerCallback, delay_ms: i64) -> Id {
        self.timers.internal.one_shot(cb, None, delay_ms)
    }
}
