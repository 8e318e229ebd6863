//! Execution Bridge: runs blocking inference on a bounded worker pool.
//!
//! Jobs are pushed onto a crossbeam channel drained by a fixed set of worker
//! threads, so one slow inference never stalls channel I/O on the runtime.
//! Each job carries its [`RequestTicket`]; if the owning channel went away
//! while the job ran, the result is discarded instead of being delivered.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use arch_types::ArchError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Identity and liveness of one logical request.
#[derive(Debug, Clone)]
pub struct RequestTicket {
    id: Uuid,
    abandoned: Arc<AtomicBool>,
}

impl RequestTicket {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Called by the channel owner when the client disconnects.
    pub fn abandon(&self) {
        if !self.abandoned.swap(true, Ordering::SeqCst) {
            debug!("[BRIDGE] Request {} abandoned", self.id);
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }
}

impl Default for RequestTicket {
    fn default() -> Self {
        Self::new()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ExecutionBridge {
    jobs: Sender<Job>,
    size: usize,
    in_flight: Arc<AtomicUsize>,
}

impl ExecutionBridge {
    /// Spawn `size` worker threads.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let (jobs, queue) = unbounded::<Job>();

        for index in 0..size {
            let queue = queue.clone();
            thread::Builder::new()
                .name(format!("arch-worker-{index}"))
                .spawn(move || worker_loop(index, queue))?;
        }
        info!("[BRIDGE] Started {size} inference workers");

        Ok(Self {
            jobs,
            size,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `job` on the pool and await its result without blocking the runtime.
    ///
    /// In-flight work is never interrupted. If `ticket` is abandoned by the
    /// time the job finishes, the result is dropped and `Abandoned` returned.
    /// A panic inside `job` becomes an `Internal` error.
    pub async fn submit<T, F>(&self, ticket: &RequestTicket, job: F) -> Result<T, ArchError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ArchError> + Send + 'static,
    {
        if ticket.is_abandoned() {
            return Err(ArchError::Abandoned);
        }

        let (result_tx, result_rx) = oneshot::channel();
        let ticket = ticket.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);

        let wrapped: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
                error!("[BRIDGE] Inference for request {} panicked", ticket.id());
                Err(ArchError::Internal("inference task panicked".to_string()))
            });
            in_flight.fetch_sub(1, Ordering::SeqCst);

            let outcome = if ticket.is_abandoned() {
                debug!(
                    "[BRIDGE] Discarding result of abandoned request {}",
                    ticket.id()
                );
                Err(ArchError::Abandoned)
            } else {
                outcome
            };
            // The awaiting stage may itself be gone during shutdown.
            let _ = result_tx.send(outcome);
        });

        if self.jobs.send(wrapped).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(ArchError::Internal("inference worker pool stopped".to_string()));
        }

        result_rx
            .await
            .map_err(|_| ArchError::Internal("inference worker dropped the request".to_string()))?
    }
}

fn worker_loop(index: usize, queue: Receiver<Job>) {
    debug!("[BRIDGE] Worker {index} started");
    while let Ok(job) = queue.recv() {
        job();
    }
    warn!("[BRIDGE] Worker {index} stopping: job queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    #[tokio::test]
    async fn test_submit_returns_job_result() {
        let bridge = ExecutionBridge::new(2).unwrap();
        let ticket = RequestTicket::new();
        let value = bridge.submit(&ticket, || Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_job_errors_propagate() {
        let bridge = ExecutionBridge::new(1).unwrap();
        let ticket = RequestTicket::new();
        let err = bridge
            .submit::<(), _>(&ticket, || Err(ArchError::invalid_input("bad")))
            .await
            .unwrap_err();
        assert_eq!(err, ArchError::invalid_input("bad"));
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let bridge = ExecutionBridge::new(1).unwrap();
        let ticket = RequestTicket::new();
        let err = bridge
            .submit::<(), _>(&ticket, || panic!("boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchError::Internal(_)));

        // Same single worker still serves the next job.
        let value = bridge.submit(&ticket, || Ok("alive")).await.unwrap();
        assert_eq!(value, "alive");
    }

    #[tokio::test]
    async fn test_abandoned_request_result_is_discarded() {
        let bridge = ExecutionBridge::new(1).unwrap();
        let ticket = RequestTicket::new();
        let finished = Arc::new(AtomicBool::new(false));

        let job_ticket = ticket.clone();
        let job_finished = finished.clone();
        let pending = bridge.submit(&ticket, move || {
            job_ticket.abandon();
            job_finished.store(true, Ordering::SeqCst);
            Ok(7)
        });

        assert_eq!(pending.await.unwrap_err(), ArchError::Abandoned);
        assert!(finished.load(Ordering::SeqCst), "in-flight work runs to completion");
    }

    #[tokio::test]
    async fn test_already_abandoned_request_never_runs() {
        let bridge = ExecutionBridge::new(1).unwrap();
        let ticket = RequestTicket::new();
        ticket.abandon();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_job = ran.clone();
        let err = bridge
            .submit(&ticket, move || {
                ran_in_job.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err, ArchError::Abandoned);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_jobs_run_in_parallel_up_to_pool_size() {
        let bridge = Arc::new(ExecutionBridge::new(2).unwrap());
        let barrier = Arc::new(Barrier::new(2));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let bridge = bridge.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                let ticket = RequestTicket::new();
                bridge
                    .submit(&ticket, move || {
                        // Deadlocks unless both jobs are on separate workers.
                        barrier.wait();
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }
}
