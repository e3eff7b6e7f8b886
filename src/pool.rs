//! Fixed-size pool of named worker threads.
//!
//! Jobs queue up when every worker is busy.  [`WorkerPool::shutdown`] stops
//! accepting jobs, lets the queue drain and waits up to a timeout; threads
//! still running after that are detached with a warning.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Reports on drop that the owning thread is done, unwinding included.
pub struct ExitNotice(Sender<()>);

impl ExitNotice {
    pub fn new(exited: Sender<()>) -> Self {
        Self(exited)
    }
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    exited: Receiver<()>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let (exit_tx, exited) = unbounded();
        let workers = (0..size.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                let notice = ExitNotice::new(exit_tx.clone());
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        let _notice = notice;
                        worker_loop(receiver);
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            exited,
        })
    }

    /// Queue `job`.  Returns `false` once the pool has been shut down.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Stop accepting jobs and wait up to `timeout` for queued and running
    /// ones to finish.  Returns `true` when every worker exited in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let drained = join_before(workers, &self.exited, Instant::now() + timeout);
        if !drained {
            log::warn!(
                "{} threads didn't stop after {} millis",
                self.name,
                timeout.as_millis()
            );
        }
        drained
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    for job in receiver.iter() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("worker job panicked");
        }
    }
}

/// Wait for one [`ExitNotice`] per handle on `exited`, giving up at
/// `deadline`.  Threads that reported are joined, the rest are detached.
/// Returns `true` when all of them finished.
pub fn join_before(
    handles: Vec<JoinHandle<()>>,
    exited: &Receiver<()>,
    deadline: Instant,
) -> bool {
    let mut remaining = handles.len();
    while remaining > 0 {
        match exited.recv_deadline(deadline) {
            Ok(()) => remaining -= 1,
            Err(_) => break,
        }
    }
    for handle in handles {
        if remaining == 0 || handle.is_finished() {
            let _ = handle.join();
        }
    }
    remaining == 0
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn runs_queued_jobs_before_shutting_down() {
        let pool = WorkerPool::new("test-pool", 2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let done = Arc::clone(&done);
            assert!(pool.execute(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(pool.shutdown(Duration::from_secs(5)));
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn size_bounds_concurrency() {
        let pool = WorkerPool::new("test-pool", 2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.execute(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        assert!(pool.shutdown(Duration::from_secs(5)));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn rejects_jobs_after_shutdown() {
        let pool = WorkerPool::new("test-pool", 1).unwrap();
        assert!(pool.shutdown(Duration::from_secs(1)));
        assert!(!pool.execute(|| {}));
        assert!(pool.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn shutdown_times_out_on_stuck_job() {
        let pool = WorkerPool::new("test-pool", 1).unwrap();
        pool.execute(|| thread::sleep(Duration::from_millis(500)));
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        assert!(!pool.shutdown(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn shutdown_returns_as_soon_as_last_worker_exits() {
        let pool = WorkerPool::new("test-pool", 3).unwrap();
        for _ in 0..3 {
            pool.execute(|| thread::sleep(Duration::from_millis(30)));
        }
        let started = Instant::now();
        assert!(pool.shutdown(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("test-pool", 1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        pool.execute(|| panic!("boom"));
        let counter = Arc::clone(&done);
        pool.execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(pool.shutdown(Duration::from_secs(5)));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exit_notice_is_sent_when_thread_unwinds() {
        let (exit_tx, exited) = unbounded();
        let notice = ExitNotice::new(exit_tx);
        let handle = thread::spawn(move || {
            let _notice = notice;
            panic!("boom");
        });
        assert!(join_before(
            vec![handle],
            &exited,
            Instant::now() + Duration::from_secs(5)
        ));
    }
}
