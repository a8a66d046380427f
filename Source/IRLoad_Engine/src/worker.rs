//! Single-job background worker.
//!
//! One dedicated thread runs one registered unit of work per trigger. There
//! is deliberately no queue: a trigger while the job is running is ignored,
//! and the dispatcher re-arms from its request latch on the next control
//! tick. Queueing would replay stale kernel builds.

use crossbeam_channel::{unbounded, Sender};
use log::info;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnMut() + Send + 'static>;

enum WorkerMsg {
    Arm(Job),
    Run,
    Stop,
}

/// State machine: Idle -> Running -> Idle, terminal Stopped via `shutdown`.
pub struct Worker {
    tx: Sender<WorkerMsg>,
    busy: Arc<AtomicBool>,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<WorkerMsg>();
        let busy = Arc::new(AtomicBool::new(false));
        let busy_thread = busy.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                info!("IRLoad: Worker Thread Started.");
                let mut job: Option<Job> = None;
                while let Ok(msg) = rx.recv() {
                    match msg {
                        WorkerMsg::Arm(j) => job = Some(j),
                        WorkerMsg::Run => {
                            if let Some(j) = job.as_mut() {
                                j();
                            }
                            busy_thread.store(false, Ordering::Release);
                        }
                        WorkerMsg::Stop => break,
                    }
                }
                busy_thread.store(false, Ordering::Release);
                info!("IRLoad: Worker Thread Stopped.");
            })
            .expect("failed to spawn worker thread");

        Self {
            tx,
            busy,
            stopped: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Register the single unit of work. Must happen before the first
    /// `trigger`; a later call replaces the job once the thread drains it.
    pub fn arm(&self, job: impl FnMut() + Send + 'static) {
        let _ = self.tx.send(WorkerMsg::Arm(Box::new(job)));
    }

    /// Mark the worker busy and wake it to run the armed job once.
    /// Returns false (and does nothing) if a run is already in flight or the
    /// worker was shut down.
    pub fn trigger(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.tx.send(WorkerMsg::Run).is_err() {
            self.busy.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Non-blocking status query, safe from the real-time thread.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Signal the thread to exit after any in-flight job and join it.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(WorkerMsg::Stop);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn wait_idle(worker: &Worker) {
        for _ in 0..500 {
            if !worker.is_busy() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("worker never returned to idle");
    }

    #[test]
    fn runs_armed_job_once_per_trigger() {
        let worker = Worker::new("test-worker");
        let count = Arc::new(AtomicUsize::new(0));
        let count_job = count.clone();
        worker.arm(move || {
            count_job.fetch_add(1, Ordering::SeqCst);
        });

        assert!(worker.trigger());
        wait_idle(&worker);
        assert!(worker.trigger());
        wait_idle(&worker);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn trigger_while_running_is_ignored() {
        let worker = Worker::new("test-worker");
        let release = Arc::new(AtomicBool::new(false));
        let release_job = release.clone();
        let count = Arc::new(AtomicUsize::new(0));
        let count_job = count.clone();
        worker.arm(move || {
            count_job.fetch_add(1, Ordering::SeqCst);
            while !release_job.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        });

        assert!(worker.trigger());
        // Give the thread time to enter the job, then re-trigger.
        thread::sleep(Duration::from_millis(10));
        assert!(worker.is_busy());
        assert!(!worker.trigger());

        release.store(true, Ordering::SeqCst);
        wait_idle(&worker);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_joins_after_in_flight_job() {
        let worker = Worker::new("test-worker");
        let done = Arc::new(AtomicBool::new(false));
        let done_job = done.clone();
        worker.arm(move || {
            thread::sleep(Duration::from_millis(20));
            done_job.store(true, Ordering::SeqCst);
        });
        worker.trigger();
        worker.shutdown();
        assert!(done.load(Ordering::SeqCst));
        // Stopped is terminal.
        assert!(!worker.trigger());
    }

    #[test]
    fn rearming_replaces_the_job() {
        let worker = Worker::new("test-worker");
        let count = Arc::new(AtomicUsize::new(0));
        let count_job = count.clone();
        worker.arm(move || {
            count_job.fetch_add(1, Ordering::SeqCst);
        });
        let count_job = count.clone();
        worker.arm(move || {
            count_job.fetch_add(100, Ordering::SeqCst);
        });

        worker.trigger();
        wait_idle(&worker);
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }
}
