// Copyright 2025 Accord project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).


use std::any::Any;
use std::cmp::Ordering;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use clock::Clock;
use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};
use priority_queue::{Id, PriorityQueue};

/// A drain pass fires at most this many timers before yielding back to the I/O loop.
const MAX_DRAIN_ITERATIONS: u32 = 100_000;

/// A drain pass yields after spending this much wall time, checked every 32 iterations.
const MAX_DRAIN_US: i64 = 10_000;

///
/// Timer behavior bits. The numeric values are stable and part of the public surface.
///
/// `MILLISECONDS` is the zero value: delays and intervals are in milliseconds unless
/// `MICROSECONDS` is set.
///
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerFlags(u32);

impl TimerFlags {
    pub const NONE: TimerFlags = TimerFlags(0);
    /// Delay and interval are expressed in milliseconds (the default unit).
    pub const MILLISECONDS: TimerFlags = TimerFlags(0);
    /// Delay and interval are expressed in microseconds.
    pub const MICROSECONDS: TimerFlags = TimerFlags(1);
    /// Remove the entry on the next drain tick without firing it.
    pub const DELETE: TimerFlags = TimerFlags(1 << 1);
    /// Set `DELETE` automatically once `repeat` is exhausted (or the entry is canceled).
    pub const DELETE_AUTO: TimerFlags = TimerFlags(1 << 2);
    /// Re-arm relative to the previous trigger rather than the current time.
    pub const INTERVAL_FIXED: TimerFlags = TimerFlags(1 << 3);
    /// In `ctl`: copy the existing entry back to the caller instead of (or before) updating.
    pub const GET: TimerFlags = TimerFlags(1 << 4);
    /// Fire one final time with this bit visible to the callback, skipping user work.
    pub const CANCELED: TimerFlags = TimerFlags(1 << 5);

    /// The bits an entry keeps across the post-fire re-arm.
    pub const ALLOWED: TimerFlags = TimerFlags(
        Self::MICROSECONDS.0 | Self::DELETE.0 | Self::DELETE_AUTO.0 | Self::INTERVAL_FIXED.0,
    );

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: TimerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: TimerFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for TimerFlags {
    type Output = TimerFlags;

    fn bitor(self, rhs: TimerFlags) -> TimerFlags {
        TimerFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TimerFlags {
    fn bitor_assign(&mut self, rhs: TimerFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TimerFlags {
    type Output = TimerFlags;

    fn bitand(self, rhs: TimerFlags) -> TimerFlags {
        TimerFlags(self.0 & rhs.0)
    }
}

impl BitAndAssign for TimerFlags {
    fn bitand_assign(&mut self, rhs: TimerFlags) {
        self.0 &= rhs.0;
    }
}

impl std::fmt::Debug for TimerFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (TimerFlags::MICROSECONDS, "MICROSECONDS"),
            (TimerFlags::DELETE, "DELETE"),
            (TimerFlags::DELETE_AUTO, "DELETE_AUTO"),
            (TimerFlags::INTERVAL_FIXED, "INTERVAL_FIXED"),
            (TimerFlags::GET, "GET"),
            (TimerFlags::CANCELED, "CANCELED"),
        ];
        let mut set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            set.push("MILLISECONDS");
        }
        write!(f, "{}", set.join("|"))
    }
}

pub type TimerCallback = Arc<dyn Fn(&Timers, &mut Timer) + Send + Sync>;
pub type TimerData = Arc<dyn Any + Send + Sync>;

///
/// A timer entry. The callback receives a snapshot of the entry; mutations the callback makes to
/// the snapshot feed into the post-fire re-arm (unless the entry was explicitly re-`ctl`'d from
/// inside the callback, which takes precedence).
///
/// - `delay`: `-1` parks the entry with no next trigger, `0` fires as soon as possible, positive
///   values fire that many units from now.
/// - `interval`: `<= 0` means no re-arm after a fire.
/// - `repeat`: bounds the number of fires. A positive value counts down once per fire and the
///   entry stops re-arming at zero; `-1` is unbounded; `0` fires once without re-arming.
///
#[derive(Clone, Default)]
pub struct Timer {
    pub id: Id,
    pub cb: Option<TimerCallback>,
    pub data: Option<TimerData>,
    pub delay: i64,
    pub interval: i64,
    pub repeat: i64,
    pub flags: TimerFlags,
}

///
/// The heap order for trigger timestamps: negative triggers mean "parked" and sort after every
/// live trigger, tying with each other.
///
pub fn trigger_order(l: i64, r: i64) -> Ordering {
    match (l < 0, r < 0) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => l.cmp(&r),
    }
}

///
/// A hook the scheduler pokes when a `ctl` outside of any drain may have shortened the time until
/// the next trigger, so a sleeping I/O poller can re-evaluate its timeout.
///
pub trait Wakeup: Send + Sync + 'static {
    fn wake(&self);
}

struct ActiveDrain {
    thread: ThreadId,
    timer_id: Id,
    skip_update_phase: bool,
}

struct Inner {
    queue: PriorityQueue<Timer>,
    active: Option<ActiveDrain>,
}

///
/// One timer queue: a priority queue of entries plus the "active drainer" record that makes
/// callback re-entry safe.
///
/// At most one thread is ever draining. While a drain is underway, `ctl` calls from other
/// threads park on a condvar until the drain exits; the draining thread itself may re-enter any
/// ctl operation from inside a timer callback without blocking.
///
pub struct Timers {
    inner: Mutex<Inner>,
    cond: Condvar,
    clock: Arc<dyn Clock>,
    wakeup: Mutex<Option<Arc<dyn Wakeup>>>,
}

impl Timers {
    pub fn new(clock: Arc<dyn Clock>) -> Timers {
        Timers {
            inner: Mutex::new(Inner {
                queue: PriorityQueue::new(trigger_order),
                active: None,
            }),
            cond: Condvar::new(),
            clock,
            wakeup: Mutex::new(None),
        }
    }

    /// Install the I/O poller wakeup hook. May be called once wiring is complete.
    pub fn set_wakeup(&self, wakeup: Arc<dyn Wakeup>) {
        *self.wakeup.lock() = Some(wakeup);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    ///
    /// The universal create/update entry point.
    ///
    /// With `timer.id` unset, creates a new entry and returns its id. With an id, verifies the
    /// entry exists (returning `Id::NONE` otherwise), services a `GET` if requested, and
    /// otherwise recomputes the trigger from `delay` and updates the entry in place. `DELETE` or
    /// `CANCELED` in the flags force a zero trigger so the next drain observes the entry
    /// immediately.
    ///
    pub fn ctl(&self, timer: &mut Timer) -> Id {
        let mut inner = self.lock_timers();
        let id = self.ctl_no_lock(&mut inner, timer);
        self.unlock_timers(inner);
        id
    }

    /// Copy out the entry behind `id`, or None if it is not live.
    pub fn get(&self, id: Id) -> Option<Timer> {
        if id.is_none() {
            return None;
        }
        let inner = self.lock_timers();
        let found = inner.queue.get(id).map(|(_, entry)| {
            let mut copy = entry.clone();
            copy.id = id;
            copy
        });
        self.unlock_timers(inner);
        found
    }

    /// Revive a parked entry: a negative delay is raised to 0 and the trigger recomputed.
    pub fn start(&self, id: Id) -> bool {
        let mut inner = self.lock_timers();
        Self::disable_update_if_active(&mut inner, id);
        let result = match inner.queue.get(id) {
            Some((_, entry)) => {
                let mut copy = entry.clone();
                copy.id = id;
                if copy.delay < 0 {
                    copy.delay = 0;
                }
                !self.ctl_no_lock(&mut inner, &mut copy).is_none()
            }
            None => false,
        };
        self.unlock_timers(inner);
        result
    }

    /// Park an entry: its trigger becomes negative and it will not fire until restarted.
    pub fn stop(&self, id: Id) -> bool {
        let mut inner = self.lock_timers();
        Self::disable_update_if_active(&mut inner, id);
        let result = match inner.queue.get(id) {
            Some((_, entry)) => {
                let mut copy = entry.clone();
                copy.id = id;
                inner.queue.update(id, -1, copy)
            }
            None => false,
        };
        self.unlock_timers(inner);
        result
    }

    /// Fire the entry one final time with `CANCELED` set, then disable (or remove, if the entry
    /// carries `DELETE_AUTO`).
    pub fn cancel(&self, id: Id) -> bool {
        self.add_flags(id, TimerFlags::CANCELED)
    }

    /// Remove the entry on the next drain tick without firing it again.
    pub fn delete(&self, id: Id) -> bool {
        self.add_flags(id, TimerFlags::DELETE)
    }

    /// Fire the entry one final time with `CANCELED` set, then remove it.
    pub fn cancel_and_delete(&self, id: Id) -> bool {
        self.add_flags(id, TimerFlags::DELETE | TimerFlags::CANCELED)
    }

    /// A one-shot timer that removes itself after firing. `delay_ms` of 0 fires on the next
    /// drain.
    pub fn one_shot(&self, cb: TimerCallback, data: Option<TimerData>, delay_ms: i64) -> Id {
        let mut timer = Timer {
            cb: Some(cb),
            data,
            delay: delay_ms,
            flags: TimerFlags::DELETE_AUTO,
            ..Timer::default()
        };
        self.ctl(&mut timer)
    }

    /// A repeating timer that removes itself once `repeat` is exhausted (`-1` repeats forever).
    pub fn interval(
        &self,
        cb: TimerCallback,
        data: Option<TimerData>,
        delay_ms: i64,
        interval_ms: i64,
        repeat: i64,
    ) -> Id {
        let mut timer = Timer {
            cb: Some(cb),
            data,
            delay: delay_ms,
            interval: interval_ms,
            repeat,
            flags: TimerFlags::DELETE_AUTO,
            ..Timer::default()
        };
        self.ctl(&mut timer)
    }

    ///
    /// Drain: fire every due timer, bounded by `MAX_DRAIN_ITERATIONS` and `MAX_DRAIN_US` so a
    /// timer storm cannot monopolize the I/O thread. The queue lock is released around every
    /// callback; callbacks may call any ctl operation on this queue, including against the entry
    /// currently firing.
    ///
    /// Returns immediately if another drain is already underway.
    ///
    pub fn run(&self) {
        let start = self.clock.now_us();
        let mut now = start;

        let mut inner = self.inner.lock();
        if inner.active.is_some() {
            return;
        }
        inner.active = Some(ActiveDrain {
            thread: thread::current().id(),
            timer_id: Id::NONE,
            skip_update_phase: false,
        });

        for iteration in 0..MAX_DRAIN_ITERATIONS {
            // Refresh our concept of now every so often; bail once this pass has run long
            // enough that the I/O loop deserves the thread back.
            if iteration % 32 == 0 {
                now = self.clock.now_us();
                if now - start > MAX_DRAIN_US {
                    break;
                }
            }

            let Some((id, trigger, entry)) = inner.queue.peek() else {
                break;
            };
            if trigger > now || trigger < 0 {
                break;
            }
            let mut timer = entry.clone();
            timer.id = id;

            {
                let active = inner.active.as_mut().unwrap();
                active.timer_id = id;
                active.skip_update_phase = false;
            }

            if !timer.flags.contains(TimerFlags::CANCELED) {
                if timer.flags.contains(TimerFlags::DELETE) {
                    inner.queue.del(id);
                    continue;
                }
                if timer.repeat > 0 {
                    timer.repeat -= 1;
                }
            }

            if let Some(cb) = timer.cb.clone() {
                MutexGuard::unlocked(&mut inner, || cb(self, &mut timer));
            }

            // A ctl against this entry ran inside the callback: its explicit update wins over
            // our re-arm.
            let skipped = {
                let active = inner.active.as_mut().unwrap();
                std::mem::replace(&mut active.skip_update_phase, false)
            };
            if skipped {
                continue;
            }

            if (timer.repeat == 0 || timer.flags.contains(TimerFlags::CANCELED))
                && timer.flags.contains(TimerFlags::DELETE_AUTO)
            {
                timer.flags |= TimerFlags::DELETE;
            }
            if timer.flags.contains(TimerFlags::DELETE) {
                inner.queue.del(id);
                continue;
            }

            let mut next = -1;
            if timer.delay != -1
                && timer.interval >= 0
                && timer.repeat != 0
                && !timer.flags.contains(TimerFlags::CANCELED)
            {
                let base = if timer.flags.contains(TimerFlags::INTERVAL_FIXED) {
                    trigger
                } else {
                    now
                };
                next = base + Self::to_us(timer.flags, timer.interval);
            }
            timer.flags &= TimerFlags::ALLOWED;
            inner.queue.update(id, next, timer);
        }

        inner.active = None;
        self.cond.notify_all();
    }

    ///
    /// Pop every remaining entry and fire its callback exactly once with `CANCELED` set.
    ///
    pub fn cancel_all(&self) {
        let pending = self.len();
        if pending > 0 {
            debug!("canceling {pending} timer(s)");
        }
        loop {
            let popped = {
                let mut inner = self.inner.lock();
                inner.queue.pop()
            };
            let Some((id, _, mut timer)) = popped else {
                break;
            };
            timer.id = id;
            timer.flags |= TimerFlags::CANCELED;
            if let Some(cb) = timer.cb.clone() {
                cb(self, &mut timer);
            }
        }
    }

    ///
    /// Seal the queue against new entries and cancel everything still in it. The queue remains
    /// usable for reads afterwards, but nothing can be scheduled.
    ///
    pub fn cleanup(&self) {
        {
            let mut inner = self.inner.lock();
            inner.queue.set_max_capacity(0);
        }
        self.cancel_all();
    }

    fn to_us(flags: TimerFlags, value: i64) -> i64 {
        if flags.contains(TimerFlags::MICROSECONDS) {
            value
        } else {
            value * 1000
        }
    }

    fn disable_update_if_active(inner: &mut Inner, id: Id) {
        if let Some(active) = inner.active.as_mut() {
            if active.timer_id == id {
                active.skip_update_phase = true;
            }
        }
    }

    fn add_flags(&self, id: Id, flags: TimerFlags) -> bool {
        let mut inner = self.lock_timers();
        Self::disable_update_if_active(&mut inner, id);
        let result = match inner.queue.get(id) {
            Some((_, entry)) => {
                let mut copy = entry.clone();
                copy.id = id;
                copy.flags |= flags;
                inner.queue.update(id, 0, copy)
            }
            None => false,
        };
        self.unlock_timers(inner);
        result
    }

    fn ctl_no_lock(&self, inner: &mut Inner, timer: &mut Timer) -> Id {
        let input = timer.clone();

        if !input.id.is_none() {
            if inner.queue.get(input.id).is_none() {
                return Id::NONE;
            }
            if input.flags.contains(TimerFlags::GET) {
                if let Some((_, existing)) = inner.queue.get(input.id) {
                    *timer = existing.clone();
                    timer.id = input.id;
                }
                if input.flags == TimerFlags::GET {
                    return input.id;
                }
            }
        }

        let mut entry = input;
        let mut key = -1;
        if entry.delay >= 0 {
            key = self.clock.now_us() + Self::to_us(entry.flags, entry.delay);
        }
        if entry.flags.intersects(TimerFlags::DELETE | TimerFlags::CANCELED) {
            key = 0;
        }
        entry.flags &= TimerFlags::ALLOWED | TimerFlags::CANCELED;

        if entry.id.is_none() {
            let id = inner.queue.push(key, entry);
            if let Some(stored) = inner.queue.get_mut(id) {
                stored.id = id;
            }
            id
        } else {
            let id = entry.id;
            Self::disable_update_if_active(inner, id);
            if inner.queue.update(id, key, entry) {
                id
            } else {
                Id::NONE
            }
        }
    }

    ///
    /// Acquire the queue. If a drain is underway on another thread, park until it exits; the
    /// draining thread itself passes straight through, which is what makes ctl re-entry from a
    /// callback safe.
    ///
    fn lock_timers(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock();
        loop {
            let must_wait = match &inner.active {
                Some(active) => active.thread != thread::current().id(),
                None => false,
            };
            if !must_wait {
                return inner;
            }
            self.cond.wait(&mut inner);
        }
    }

    ///
    /// Release the queue. When no drain was underway, the ctl that just ran may have moved the
    /// next trigger closer, so poke the I/O poller awake.
    ///
    fn unlock_timers(&self, inner: MutexGuard<'_, Inner>) {
        let should_wake = inner.active.is_none();
        drop(inner);
        if should_wake {
            let wakeup = self.wakeup.lock().clone();
            if let Some(wakeup) = wakeup {
                wakeup.wake();
            }
        }
    }
}

///
/// The pair of queues a client drives: user-visible timers and internal bookkeeping timers.
/// They are peers with independent locks; a storm on one cannot block ctl on the other.
///
pub struct TimerSet {
    pub user: Arc<Timers>,
    pub internal: Arc<Timers>,
}

impl TimerSet {
    pub fn new(clock: Arc<dyn Clock>) -> TimerSet {
        TimerSet {
            user: Arc::new(Timers::new(clock.clone())),
            internal: Arc::new(Timers::new(clock)),
        }
    }

    pub fn set_wakeup(&self, wakeup: Arc<dyn Wakeup>) {
        self.user.set_wakeup(wakeup.clone());
        self.internal.set_wakeup(wakeup);
    }

    pub fn run(&self) {
        self.user.run();
        self.internal.run();
    }

    pub fn cleanup(&self) {
        self.user.cleanup();
        self.internal.cleanup();
    }
}

///
/// Best-effort hint for how long the I/O poller may sleep, in microseconds. Scans each queue
/// with a try-lock: a contended queue means timer state is in flux, so the caller should not
/// sleep at all (0). Parked entries (negative triggers) never shorten the sleep.
///
pub fn next_trigger(queues: &[&Timers], now: i64, mut max_time: i64) -> i64 {
    if max_time == 0 {
        return 0;
    }
    for timers in queues {
        let Some(inner) = timers.inner.try_lock() else {
            return 0;
        };
        if let Some((_, trigger, _)) = inner.queue.peek() {
            if trigger < 0 {
                continue;
            }
            if trigger <= now {
                max_time = 0;
            } else if max_time > trigger - now {
                max_time = trigger - now;
            }
        }
    }
    max_time
}
