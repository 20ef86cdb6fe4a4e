// crates/dossier-server/src/llm/pool.rs
// Fixed pool of local model workers behind a bounded FIFO queue
//
// N workers each run one request to completion (no preemption). The
// queue admits with try_send, so a full queue fails the caller
// immediately instead of blocking. Deadlines are checked when a request
// is dequeued and raced against generation, so an expired or cancelled
// request never occupies a worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::llm::backend::CompletionBackend;
use crate::llm::types::CompletionRequest;

/// Pause before a worker resumes after containing a model panic. Keeps a
/// crash-looping backend from spinning; well under the 10 s degradation
/// bound.
const RESTART_DELAY: Duration = Duration::from_millis(250);

struct Job {
    req: CompletionRequest,
    deadline: Instant,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<String, EngineError>>,
}

/// Pool of N warm local-model workers servicing short completion
/// requests through a bounded queue of capacity Q.
pub struct LocalModelPool {
    tx: mpsc::Sender<Job>,
    workers: usize,
    queue_capacity: usize,
    model: String,
}

impl LocalModelPool {
    /// Spawn `workers` worker tasks over a queue of `queue_capacity`.
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let model = backend.model_name().to_string();

        for worker_id in 0..workers {
            let backend = backend.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, backend, rx).await;
            });
        }

        info!(workers, queue_capacity, model = %model, "Local model pool started");

        Self {
            tx,
            workers,
            queue_capacity,
            model,
        }
    }

    /// Submit a completion request.
    ///
    /// Fails immediately with `Capacity` when the queue is full. The
    /// deadline covers queue wait plus generation; expiry or
    /// cancellation yields `Cancelled` and the request never reaches
    /// (or promptly leaves) a worker.
    pub async fn complete(
        &self,
        req: CompletionRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            req,
            deadline,
            cancel: cancel.clone(),
            reply: reply_tx,
        };

        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::Capacity,
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::Model("local model pool is shut down".into())
            }
        })?;

        // The worker answers every dequeued job; the races below cover
        // cancellation and expiry while the job is still queued.
        tokio::select! {
            res = reply_rx => res.unwrap_or_else(|_| {
                Err(EngineError::Model("local model worker dropped the request".into()))
            }),
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(EngineError::Cancelled),
        }
    }

    /// Like [`complete`](Self::complete), with the single 100 ms retry
    /// the capacity policy allows before surfacing the error.
    pub async fn complete_with_retry(
        &self,
        req: CompletionRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        match self.complete(req.clone(), deadline, cancel).await {
            Err(EngineError::Capacity) => {
                debug!("Local pool full, retrying once in 100ms");
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.complete(req, deadline, cancel).await
            }
            other => other,
        }
    }

    /// Requests currently queued (not yet picked up by a worker).
    pub fn queue_depth(&self) -> usize {
        self.queue_capacity - self.tx.capacity()
    }

    /// True when the queue has no free slot.
    pub fn is_saturated(&self) -> bool {
        self.tx.capacity() == 0
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }
}

async fn worker_loop(
    worker_id: usize,
    backend: Arc<dyn CompletionBackend>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        // Hold the lock only for the dequeue so idle workers don't starve
        // each other.
        let job = {
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(job) => job,
                None => {
                    debug!(worker_id, "Queue closed, worker exiting");
                    return;
                }
            }
        };

        // Drop requests that died while queued.
        if job.cancel.is_cancelled() || Instant::now() >= job.deadline {
            let _ = job.reply.send(Err(EngineError::Cancelled));
            continue;
        }

        // Run generation on its own task so a backend panic is contained
        // to this request instead of killing the worker.
        let mut backend_call = {
            let backend = backend.clone();
            let req = job.req.clone();
            tokio::spawn(async move { backend.complete(req).await })
        };

        let mut panicked = false;
        let result = tokio::select! {
            res = &mut backend_call => match res {
                Ok(inner) => inner,
                Err(join_err) => {
                    panicked = join_err.is_panic();
                    error!(worker_id, "Model task failed: {join_err}");
                    Err(EngineError::Model(join_err.to_string()))
                }
            },
            _ = job.cancel.cancelled() => {
                debug!(worker_id, "Generation cancelled, discarding partial output");
                backend_call.abort();
                Err(EngineError::Cancelled)
            }
            _ = tokio::time::sleep_until(job.deadline) => {
                debug!(worker_id, "Deadline during generation");
                backend_call.abort();
                Err(EngineError::Cancelled)
            }
        };

        let _ = job.reply.send(result);

        if panicked {
            warn!(worker_id, "Worker restarting after model panic");
            tokio::time::sleep(RESTART_DELAY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::backend::testing::{ScriptStep, ScriptedBackend};

    fn pool_with(steps: Vec<ScriptStep>, workers: usize, queue: usize) -> LocalModelPool {
        LocalModelPool::new(Arc::new(ScriptedBackend::new(steps)), workers, queue)
    }

    fn req() -> CompletionRequest {
        CompletionRequest::new("prompt", 64, 0.0)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_complete_roundtrip() {
        let pool = pool_with(vec![ScriptStep::Reply("answer".into())], 2, 16);
        let cancel = CancellationToken::new();
        let out = pool.complete(req(), soon(), &cancel).await.unwrap();
        assert_eq!(out, "answer");
    }

    #[tokio::test]
    async fn test_requests_are_not_reordered() {
        // One worker: replies must come back in submission order.
        let pool = Arc::new(pool_with(
            vec![
                ScriptStep::Reply("first".into()),
                ScriptStep::Reply("second".into()),
                ScriptStep::Reply("third".into()),
            ],
            1,
            16,
        ));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(
                async move { pool.complete(req(), soon(), &cancel).await },
            ));
            // Give the submission a moment to enqueue so order is fixed
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let outputs: Vec<String> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|h| h.unwrap().unwrap())
            .collect();
        assert_eq!(outputs, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        // One worker stuck on a hanging job, queue of one also filled.
        let pool = pool_with(vec![ScriptStep::Hang, ScriptStep::Hang], 1, 1);
        let cancel = CancellationToken::new();

        // First job occupies the worker...
        let pool = Arc::new(pool);
        let occupier = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pool.complete(req(), Instant::now() + Duration::from_millis(300), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        // ...second fills the queue slot...
        let filler = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pool.complete(req(), Instant::now() + Duration::from_millis(300), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(pool.is_saturated());

        // ...third is rejected immediately.
        let res = pool.complete(req(), soon(), &cancel).await;
        assert!(matches!(res, Err(EngineError::Capacity)));

        // Deadline clears the stuck jobs.
        assert!(matches!(
            occupier.await.unwrap(),
            Err(EngineError::Cancelled)
        ));
        assert!(matches!(filler.await.unwrap(), Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_deadline_during_generation_cancels() {
        let pool = pool_with(vec![ScriptStep::Hang], 1, 4);
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_millis(100);

        let started = Instant::now();
        let res = pool.complete(req(), deadline, &cancel).await;
        assert!(matches!(res, Err(EngineError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancellation_token_stops_queued_and_running() {
        let pool = pool_with(vec![ScriptStep::Hang], 1, 4);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            let pool = Arc::new(pool);
            tokio::spawn(async move { pool.complete(req(), soon(), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert!(matches!(task.await.unwrap(), Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_worker_survives_model_panic() {
        let pool = pool_with(
            vec![ScriptStep::Panic, ScriptStep::Reply("recovered".into())],
            1,
            4,
        );
        let cancel = CancellationToken::new();

        let res = pool.complete(req(), soon(), &cancel).await;
        assert!(matches!(res, Err(EngineError::Model(_))));

        // Same worker must pick up the next request after restart.
        let out = pool.complete(req(), soon(), &cancel).await.unwrap();
        assert_eq!(out, "recovered");
    }

    #[tokio::test]
    async fn test_complete_with_retry_recovers_after_queue_drains() {
        let pool = pool_with(
            vec![
                ScriptStep::SlowReply(Duration::from_millis(50), "slow".into()),
                ScriptStep::Reply("fast".into()),
            ],
            1,
            1,
        );
        let pool = Arc::new(pool);
        let cancel = CancellationToken::new();

        // Occupy worker and queue.
        let slow = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.complete(req(), soon(), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.complete(req(), soon(), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Retry path: first try hits Capacity, the 100ms retry succeeds.
        let out = pool
            .complete_with_retry(req(), soon(), &cancel)
            .await
            .unwrap();
        assert_eq!(out, "[unscripted]");

        assert_eq!(slow.await.unwrap().unwrap(), "slow");
        assert_eq!(queued.await.unwrap().unwrap(), "fast");
    }

    #[tokio::test]
    async fn test_queue_depth_reporting() {
        let pool = pool_with(vec![], 1, 8);
        assert_eq!(pool.queue_depth(), 0);
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.queue_capacity(), 8);
        assert!(!pool.is_saturated());
    }
}
