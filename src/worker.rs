//! Worker pool: a fixed pool of OS threads that runs every mutating RPC's
//! hypervisor/ZFS calls off the `tokio` event loop, fed by a shared
//! `std::sync::mpsc::Receiver` wrapped in a `Mutex` (the standard
//! multi-consumer-over-`mpsc` pattern, since `mpsc` itself is
//! single-consumer). Completion is bridged back into `tokio` via a
//! `tokio::sync::oneshot` channel per job, which is what lets the async
//! connection task that called `submit` simply `.await` the result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(size);

        for i in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("purecvisor-worker-{}", i))
                .spawn(move || loop {
                    let job = {
                        let rx = receiver.lock().unwrap();
                        rx.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        WorkerPool {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        }
    }

    /// Submits `f` to run on a worker thread. Non-blocking: returns a
    /// `oneshot::Receiver` the caller awaits for the result. `client_alive`
    /// is checked immediately before the result is sent (never before or
    /// during `f` itself, since hypervisor calls are not interruptible).
    /// If the client handle was released while the job ran, the result is
    /// silently dropped rather than delivered.
    pub fn submit<F, T>(&self, client_alive: Arc<AtomicBool>, f: F) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let result = f();
            if client_alive.load(Ordering::SeqCst) {
                let _ = tx.send(result);
            }
        });
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(sender) => sender.send(job).expect("worker pool is shut down"),
            None => panic!("submit called after worker pool shutdown"),
        }
        rx
    }

    /// Drains in-flight jobs and joins every worker thread. Dropping the
    /// sender side of the channel causes each worker's `recv()` to return
    /// `Err`, ending its loop, so the sender is taken (and dropped) before
    /// joining.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        let handles = {
            let mut handles = self.handles.lock().unwrap();
            std::mem::take(&mut *handles)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn submit_runs_job_and_delivers_result() {
        let pool = WorkerPool::new(2);
        let alive = Arc::new(AtomicBool::new(true));
        let rx = pool.submit(alive, || 2 + 2);
        assert_eq!(rx.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn result_dropped_silently_when_client_not_alive() {
        let pool = WorkerPool::new(1);
        let alive = Arc::new(AtomicBool::new(false));
        let rx = pool.submit(alive, || 42);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn many_jobs_run_concurrently_across_workers() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicU32::new(0));
        let mut receivers = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            let alive = Arc::new(AtomicBool::new(true));
            receivers.push(pool.submit(alive, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
