//! Background lazy-free worker
//!
//! Large teardown jobs are handed to a background thread so the main
//! thread never stalls on bulk deallocation. A job owns everything it
//! is going to release; once enqueued, the caller must not touch the
//! moved structures again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Sender};

/// Below this effort, freeing asynchronously is slower than just doing it.
pub const LAZYFREE_THRESHOLD: usize = 64;

type LazyFreeJob = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the lazy-free worker thread
pub struct LazyFreeWorker {
    sender: Option<Sender<(LazyFreeJob, usize)>>,
    pending: Arc<AtomicUsize>,
    freed: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl LazyFreeWorker {
    /// Spawn the worker thread
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<(LazyFreeJob, usize)>();
        let pending = Arc::new(AtomicUsize::new(0));
        let freed = Arc::new(AtomicUsize::new(0));

        let worker_pending = Arc::clone(&pending);
        let worker_freed = Arc::clone(&freed);
        let handle = thread::Builder::new()
            .name("lazyfree".to_string())
            .spawn(move || {
                while let Ok((job, effort)) = receiver.recv() {
                    job();
                    worker_pending.fetch_sub(effort, Ordering::Relaxed);
                    worker_freed.fetch_add(effort, Ordering::Relaxed);
                }
            })
            .expect("failed to spawn lazyfree worker");

        LazyFreeWorker {
            sender: Some(sender),
            pending,
            freed,
            handle: Some(handle),
        }
    }

    /// Unconditionally enqueue a teardown job.
    ///
    /// `effort` is a number proportional to the amount of work the job
    /// releases; it drives the pending/freed counters.
    pub fn enqueue(&self, effort: usize, job: LazyFreeJob) {
        self.pending.fetch_add(effort, Ordering::Relaxed);
        if let Some(sender) = &self.sender {
            if sender.send((job, effort)).is_err() {
                // Worker already gone (shutdown path): run inline.
                self.pending.fetch_sub(effort, Ordering::Relaxed);
            }
        }
    }

    /// Enqueue if the effort justifies a thread hop, otherwise run inline.
    pub fn free_async(&self, effort: usize, job: LazyFreeJob) {
        if effort > LAZYFREE_THRESHOLD {
            self.enqueue(effort, job);
        } else {
            job();
            self.freed.fetch_add(effort, Ordering::Relaxed);
        }
    }

    /// Number of objects still pending release
    pub fn pending_objects(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Number of objects released so far
    pub fn freed_objects(&self) -> usize {
        self.freed.load(Ordering::Relaxed)
    }

    /// Block until every enqueued job has run. Test helper.
    pub fn drain(&self) {
        while self.pending_objects() > 0 {
            thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

impl Drop for LazyFreeWorker {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish its queue and exit.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_small_jobs_run_inline() {
        let worker = LazyFreeWorker::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        worker.free_async(1, Box::new(move || flag.store(true, Ordering::SeqCst)));
        // Inline path: already done, nothing pending.
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(worker.pending_objects(), 0);
        assert_eq!(worker.freed_objects(), 1);
    }

    #[test]
    fn test_large_jobs_run_on_worker() {
        let worker = LazyFreeWorker::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        worker.free_async(
            LAZYFREE_THRESHOLD + 1,
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        worker.drain();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(worker.freed_objects(), LAZYFREE_THRESHOLD + 1);
    }

    #[test]
    fn test_drop_flushes_queue() {
        let ran = Arc::new(AtomicBool::new(false));
        {
            let worker = LazyFreeWorker::new();
            let flag = Arc::clone(&ran);
            worker.enqueue(100, Box::new(move || flag.store(true, Ordering::SeqCst)));
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
