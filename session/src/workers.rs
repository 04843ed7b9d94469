// Copyright 2025 Accord project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::any::Any;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log::error;
use parking_lot::{Condvar, Mutex};

/// Per-frame payload handed from the classifier to the event callback's worker. Dropping it is
/// its cleanup.
pub type FrameData = Box<dyn Any + Send>;

/// An event callback, invoked on a worker thread with the frame data (if any) that the
/// classifier attached.
pub type EventCallback = Arc<dyn Fn(Option<&(dyn Any + Send)>) + Send + Sync>;

struct Job {
    cb: EventCallback,
    data: Option<FrameData>,
}

struct PoolShared {
    idle: Mutex<usize>,
    cond: Condvar,
}

///
/// A fixed set of long-lived worker threads fed through a rendezvous channel.
///
/// `dispatch` blocks while every worker is busy: the I/O thread stalls rather than queueing
/// unbounded work. The idle count is decremented by the dispatcher before handing a job over
/// and incremented by the worker after it finishes, so at any quiescent moment it equals the
/// number of workers parked on the channel.
///
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    sender: Option<Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> WorkerPool {
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(0);
        let shared = Arc::new(PoolShared {
            idle: Mutex::new(0),
            cond: Condvar::new(),
        });

        let mut handles = Vec::new();
        for n in 0..size {
            let receiver = receiver.clone();
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("session-worker-{n}"))
                .spawn(move || Self::worker_loop(receiver, worker_shared));
            match spawned {
                Ok(handle) => {
                    handles.push(handle);
                    *shared.idle.lock() += 1;
                }
                Err(e) => {
                    // A short pool still makes progress; the dispatcher just blocks sooner.
                    error!("Couldn't spawn worker thread: {e}");
                }
            }
        }

        WorkerPool {
            shared,
            sender: Some(sender),
            handles,
        }
    }

    /// The number of workers that were actually spawned.
    pub fn capacity(&self) -> usize {
        self.handles.len()
    }

    /// The number of workers not currently running a job.
    pub fn idle(&self) -> usize {
        *self.shared.idle.lock()
    }

    ///
    /// Hand a job to a worker, blocking until one is idle.
    ///
    pub fn dispatch(&self, cb: EventCallback, data: Option<FrameData>) {
        {
            let mut idle = self.shared.idle.lock();
            while *idle == 0 {
                self.shared.cond.wait(&mut idle);
            }
            *idle -= 1;
        }
        let Some(sender) = &self.sender else { return };
        if sender.send(Job { cb, data }).is_err() {
            error!("Worker pool has shut down; dropping dispatch");
            let mut idle = self.shared.idle.lock();
            *idle += 1;
        }
    }

    fn worker_loop(receiver: Receiver<Job>, shared: Arc<PoolShared>) {
        while let Ok(job) = receiver.recv() {
            let Job { cb, data } = job;
            cb(data.as_deref());
            // The frame data's cleanup runs here, on the worker, before the slot frees up.
            drop(data);

            let mut idle = shared.idle.lock();
            *idle += 1;
            shared.cond.notify_one();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker's recv loop; join so no job outlives the pool.
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::WorkerPool;

    #[test]
    fn jobs_run_and_idle_recovers() {
        let pool = WorkerPool::new(4);
        assert_eq!(pool.idle(), 4);

        let (done_tx, done_rx) = mpsc::channel();
        for n in 0..8 {
            let done_tx = done_tx.clone();
            pool.dispatch(
                Arc::new(move |_| {
                    done_tx.send(n).unwrap();
                }),
                None,
            );
        }
        let mut seen: Vec<i32> = (0..8)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());

        // Workers increment idle after signalling completion; give them a moment.
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.idle() != 4 {
            assert!(Instant::now() < deadline, "idle count never recovered");
            std::thread::yield_now();
        }
    }

    #[test]
    fn dispatch_blocks_while_saturated() {
        let pool = WorkerPool::new(2);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(parking_lot::Mutex::new(release_rx));

        for _ in 0..2 {
            let release_rx = release_rx.clone();
            pool.dispatch(
                Arc::new(move |_| {
                    release_rx.lock().recv().unwrap();
                }),
                None,
            );
        }

        // Both workers are blocked; the third dispatch must stall until one is released.
        let start = Instant::now();
        let released = {
            let release_tx = release_tx.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                release_tx.send(()).unwrap();
            })
        };
        pool.dispatch(Arc::new(|_| {}), None);
        assert!(start.elapsed() >= Duration::from_millis(100));

        released.join().unwrap();
        release_tx.send(()).unwrap();
    }

    #[test]
    fn frame_data_is_dropped_on_the_worker() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        let pool = WorkerPool::new(1);
        let observed = drops.clone();
        pool.dispatch(
            Arc::new(move |data| {
                // The payload is alive during the callback.
                assert!(data.unwrap().downcast_ref::<Guard>().is_some());
                assert_eq!(observed.load(Ordering::SeqCst), 0);
                done_tx.send(()).unwrap();
            }),
            Some(Box::new(Guard(drops.clone()))),
        );

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        drop(pool);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
