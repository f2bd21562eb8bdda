//! Single-worker command serialization.
//!
//! Every state-mutating operation against the shared target (the node's
//! [`DeviceManager`](crate::manager::DeviceManager)) runs on one dedicated worker
//! thread. The executor is a two-state machine:
//!
//! ```text
//! Idle --submit--> Busy --job done (ok, error or panic)--> Idle
//! ```
//!
//! A submission while Busy fails immediately with [`DaqError::Busy`]; nothing is
//! queued. The Idle→Busy transition is a compare-and-swap, and jobs reach the worker
//! through a single-slot channel, so no lock is held across submission.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{AppResult, DaqError};

const IDLE: u8 = 0;
const BUSY: u8 = 1;

/// Unit of work executed with exclusive access to the target.
pub type Job<M> = Box<dyn FnOnce(&mut M) + Send + 'static>;

/// Observable executor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Ready for a submission
    Idle,
    /// A job is queued or running
    Busy,
}

/// Serializes jobs against one target on a dedicated worker thread.
pub struct CommandExecutor<M> {
    target: Arc<Mutex<M>>,
    state: Arc<AtomicU8>,
    sender: Option<mpsc::Sender<Job<M>>>,
    worker: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> CommandExecutor<M> {
    /// Take ownership of `target` and start the worker thread.
    pub fn new(target: M) -> AppResult<Self> {
        let target = Arc::new(Mutex::new(target));
        let state = Arc::new(AtomicU8::new(IDLE));
        let (sender, mut receiver) = mpsc::channel::<Job<M>>(1);

        let worker_target = Arc::clone(&target);
        let worker_state = Arc::clone(&state);
        let worker = std::thread::Builder::new()
            .name("command-worker".into())
            .spawn(move || {
                debug!("command worker started");
                while let Some(job) = receiver.blocking_recv() {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        let mut target = worker_target.lock();
                        job(&mut target);
                    }));
                    if outcome.is_err() {
                        error!("command panicked; worker continues");
                    }
                    worker_state.store(IDLE, Ordering::SeqCst);
                }
                debug!("command worker stopped");
            })?;

        Ok(Self {
            target,
            state,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Current state; may change as soon as it is read.
    pub fn state(&self) -> ExecutorState {
        match self.state.load(Ordering::SeqCst) {
            IDLE => ExecutorState::Idle,
            _ => ExecutorState::Busy,
        }
    }

    #[allow(missing_docs)]
    pub fn is_busy(&self) -> bool {
        self.state() == ExecutorState::Busy
    }

    /// Shared handle on the target, for read-only inspection outside jobs.
    pub fn target(&self) -> Arc<Mutex<M>> {
        Arc::clone(&self.target)
    }

    /// Run `job` against the target.
    ///
    /// With `synchronous` the job runs on the calling thread before this returns;
    /// otherwise it is handed to the worker and this returns immediately.
    ///
    /// # Errors
    /// [`DaqError::Busy`] if another job is still running.
    pub fn submit<F>(&self, job: F, synchronous: bool) -> AppResult<()>
    where
        F: FnOnce(&mut M) + Send + 'static,
    {
        self.state
            .compare_exchange(IDLE, BUSY, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| DaqError::Busy)?;

        if synchronous {
            let outcome = catch_unwind(AssertUnwindSafe(|| job(&mut self.target.lock())));
            self.state.store(IDLE, Ordering::SeqCst);
            if outcome.is_err() {
                error!("synchronous command panicked");
            }
            return Ok(());
        }

        let sent = match &self.sender {
            Some(sender) => sender.try_send(Box::new(job)).is_ok(),
            None => false,
        };
        if !sent {
            self.state.store(IDLE, Ordering::SeqCst);
            return Err(DaqError::Busy);
        }
        Ok(())
    }
}

impl<M> CommandExecutor<M> {
    /// Let the running job finish, then stop the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("command worker terminated abnormally");
            }
        }
    }
}

impl<M> Drop for CommandExecutor<M> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    fn wait_idle<M: Send + 'static>(executor: &CommandExecutor<M>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while executor.is_busy() {
            assert!(Instant::now() < deadline, "executor stayed busy");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn second_submission_is_rejected_while_busy() {
        let executor = CommandExecutor::new(Vec::<u32>::new()).unwrap();
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let (s, r) = (Arc::clone(&started), Arc::clone(&release));
        executor
            .submit(
                move |log: &mut Vec<u32>| {
                    s.wait();
                    r.wait();
                    log.push(1);
                },
                false,
            )
            .unwrap();
        started.wait();
        assert!(executor.is_busy());

        let err = executor
            .submit(|log: &mut Vec<u32>| log.push(2), false)
            .unwrap_err();
        assert!(matches!(err, DaqError::Busy));
        let err = executor.submit(|log: &mut Vec<u32>| log.push(3), true).unwrap_err();
        assert!(matches!(err, DaqError::Busy));

        release.wait();
        wait_idle(&executor);
        assert_eq!(*executor.target().lock(), vec![1]);
    }

    #[test]
    fn synchronous_jobs_run_before_returning() {
        let executor = CommandExecutor::new(0u32).unwrap();
        executor.submit(|n: &mut u32| *n += 5, true).unwrap();
        assert_eq!(*executor.target().lock(), 5);
        assert_eq!(executor.state(), ExecutorState::Idle);
    }

    #[test]
    fn panicking_job_returns_executor_to_idle() {
        let executor = CommandExecutor::new(0u32).unwrap();
        executor
            .submit(|_: &mut u32| panic!("boom"), false)
            .unwrap();
        wait_idle(&executor);
        executor.submit(|n: &mut u32| *n = 7, false).unwrap();

        let target = executor.target();
        executor.shutdown();
        assert_eq!(*target.lock(), 7);
    }
}
