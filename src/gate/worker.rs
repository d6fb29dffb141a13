//! Deferred usage consumption.
//!
//! Jobs are routed into per-user lanes so one user's consumptions apply in
//! the order they were enqueued while different users proceed in parallel.
//! Each job runs in a spawned task owned by the worker, so nothing on the
//! request side (a dropped connection, a failed response) can cancel it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::WorkerConfig;
use crate::entitlements::Action;
use crate::error::{Result, TierwiseError};

/// Drop closed lanes from the routing table once it grows past this.
const LANE_PRUNE_THRESHOLD: usize = 256;

/// One completed action waiting to be counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionJob {
    pub user_id: String,
    pub action: Action,
    pub amount: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Applies a consumption job to durable state.
#[async_trait]
pub trait ConsumptionHandler: Send + Sync {
    async fn apply(&self, job: &ConsumptionJob) -> Result<()>;
}

/// Retry and lane lifetime settings.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub lane_idle: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            lane_idle: Duration::from_secs(config.lane_idle_secs),
        }
    }
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Handle to the running consumption worker.
pub struct ConsumptionWorker {
    jobs: mpsc::UnboundedSender<ConsumptionJob>,
    shutdown_tx: mpsc::Sender<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<InFlight>,
}

impl ConsumptionWorker {
    /// Start the dispatcher. Must be called inside a Tokio runtime.
    pub fn spawn(handler: Arc<dyn ConsumptionHandler>, options: WorkerOptions) -> Self {
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let in_flight = Arc::new(InFlight::default());

        let dispatcher = Dispatcher {
            lane: LaneContext {
                handler,
                options,
                in_flight: in_flight.clone(),
            },
            lanes: HashMap::new(),
            tasks: JoinSet::new(),
        };
        let handle = tokio::spawn(dispatcher.run(jobs_rx, shutdown_rx));

        Self {
            jobs,
            shutdown_tx,
            dispatcher: Mutex::new(Some(handle)),
            in_flight,
        }
    }

    /// Queue a job. Never waits.
    pub fn enqueue(&self, job: ConsumptionJob) -> Result<()> {
        self.in_flight.start();
        if self.jobs.send(job).is_err() {
            self.in_flight.finish();
            return Err(TierwiseError::service_unavailable(
                "consumption worker is not running",
            ));
        }
        Ok(())
    }

    /// Jobs enqueued but not yet finished (applied or given up on).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Wait until every enqueued job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work, drain what is queued, and wait for the lanes.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(target: "tierwise::gate", error = %e, "Consumption dispatcher failed");
            }
        }
    }
}

struct Dispatcher {
    lane: LaneContext,
    lanes: HashMap<String, mpsc::UnboundedSender<ConsumptionJob>>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut jobs: mpsc::UnboundedReceiver<ConsumptionJob>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(target: "tierwise::gate", "Consumption worker started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!(target: "tierwise::gate", "Shutdown signal received, draining consumption lanes");
                    break;
                }
                job = jobs.recv() => match job {
                    Some(job) => self.route(job),
                    None => break,
                },
            }
            self.reap_finished_lanes();
        }

        jobs.close();
        while let Ok(job) = jobs.try_recv() {
            self.route(job);
        }
        // Lanes exit once their queue is empty and the sender is gone
        self.lanes.clear();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(target: "tierwise::gate", error = %e, "Consumption lane failed");
            }
        }

        tracing::info!(target: "tierwise::gate", "Consumption worker stopped");
    }

    fn route(&mut self, job: ConsumptionJob) {
        let job = match self.lanes.get(&job.user_id) {
            Some(lane) => match lane.send(job) {
                Ok(()) => return,
                // The lane closed after going idle
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        if self.lanes.len() >= LANE_PRUNE_THRESHOLD {
            self.lanes.retain(|_, lane| !lane.is_closed());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let user_id = job.user_id.clone();
        let _ = tx.send(job);
        self.lanes.insert(user_id.clone(), tx);
        self.tasks.spawn(self.lane.clone().run(user_id, rx));
    }

    fn reap_finished_lanes(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                tracing::error!(target: "tierwise::gate", error = %e, "Consumption lane failed");
            }
        }
    }
}

#[derive(Clone)]
struct LaneContext {
    handler: Arc<dyn ConsumptionHandler>,
    options: WorkerOptions,
    in_flight: Arc<InFlight>,
}

impl LaneContext {
    async fn run(self, user_id: String, mut rx: mpsc::UnboundedReceiver<ConsumptionJob>) {
        tracing::trace!(target: "tierwise::gate", user_id = %user_id, "Lane opened");
        loop {
            match tokio::time::timeout(self.options.lane_idle, rx.recv()).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => break,
                Err(_) => {
                    rx.close();
                    while let Ok(job) = rx.try_recv() {
                        self.process(job).await;
                    }
                    break;
                }
            }
        }
        tracing::trace!(target: "tierwise::gate", user_id = %user_id, "Lane closed");
    }

    async fn process(&self, job: ConsumptionJob) {
        let mut attempt = 1;
        loop {
            let outcome = AssertUnwindSafe(self.handler.apply(&job))
                .catch_unwind()
                .await;
            let (error, retryable) = match outcome {
                Ok(Ok(())) => {
                    tracing::debug!(
                        target: "tierwise::gate",
                        user_id = %job.user_id,
                        action = %job.action,
                        amount = job.amount,
                        attempt,
                        "Consumption applied"
                    );
                    break;
                }
                Ok(Err(e)) => {
                    let retryable = e.is_retryable();
                    (e.to_string(), retryable)
                }
                Err(_) => ("consumption handler panicked".to_string(), true),
            };

            if !retryable || attempt >= self.options.max_attempts {
                tracing::error!(
                    target: "tierwise::gate",
                    user_id = %job.user_id,
                    action = %job.action,
                    amount = job.amount,
                    attempt,
                    error = %error,
                    "Giving up on consumption"
                );
                break;
            }

            tracing::warn!(
                target: "tierwise::gate",
                user_id = %job.user_id,
                attempt,
                error = %error,
                "Consumption failed, retrying"
            );
            tokio::time::sleep(self.options.retry_backoff * attempt).await;
            attempt += 1;
        }
        self.in_flight.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex as AsyncMutex;

    fn job(user: &str, n: u32) -> ConsumptionJob {
        ConsumptionJob {
            user_id: user.to_string(),
            action: Action::Conversation,
            amount: n,
            enqueued_at: Utc::now(),
        }
    }

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            lane_idle: Duration::from_millis(20),
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: AsyncMutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl ConsumptionHandler for Recorder {
        async fn apply(&self, job: &ConsumptionJob) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.seen.lock().await.push((job.user_id.clone(), job.amount));
            Ok(())
        }
    }

    /// Fails the first `failures` attempts.
    struct Flaky {
        failures: u32,
        attempts: AtomicU32,
        retryable: bool,
    }

    #[async_trait]
    impl ConsumptionHandler for Flaky {
        async fn apply(&self, _job: &ConsumptionJob) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                if self.retryable {
                    return Err(TierwiseError::service_unavailable("disk busy"));
                }
                return Err(TierwiseError::internal("broken"));
            }
            Ok(())
        }
    }

    struct Panicky;

    #[async_trait]
    impl ConsumptionHandler for Panicky {
        async fn apply(&self, _job: &ConsumptionJob) -> Result<()> {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn test_jobs_apply_in_order_per_user() {
        let recorder = Arc::new(Recorder::default());
        let worker = ConsumptionWorker::spawn(recorder.clone(), fast_options());

        for n in 1..=5 {
            worker.enqueue(job("user_a", n)).unwrap();
            worker.enqueue(job("user_b", n * 10)).unwrap();
        }
        worker.wait_idle().await;

        let seen = recorder.seen.lock().await.clone();
        let a: Vec<u32> = seen.iter().filter(|(u, _)| u == "user_a").map(|(_, n)| *n).collect();
        let b: Vec<u32> = seen.iter().filter(|(u, _)| u == "user_b").map(|(_, n)| *n).collect();
        assert_eq!(a, vec![1, 2, 3, 4, 5]);
        assert_eq!(b, vec![10, 20, 30, 40, 50]);
        assert_eq!(worker.pending(), 0);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let flaky = Arc::new(Flaky {
            failures: 2,
            attempts: AtomicU32::new(0),
            retryable: true,
        });
        let worker = ConsumptionWorker::spawn(flaky.clone(), fast_options());

        worker.enqueue(job("user_a", 1)).unwrap();
        worker.wait_idle().await;
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let flaky = Arc::new(Flaky {
            failures: 10,
            attempts: AtomicU32::new(0),
            retryable: true,
        });
        let worker = ConsumptionWorker::spawn(flaky.clone(), fast_options());

        worker.enqueue(job("user_a", 1)).unwrap();
        worker.wait_idle().await;
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let flaky = Arc::new(Flaky {
            failures: 10,
            attempts: AtomicU32::new(0),
            retryable: false,
        });
        let worker = ConsumptionWorker::spawn(flaky.clone(), fast_options());

        worker.enqueue(job("user_a", 1)).unwrap();
        worker.wait_idle().await;
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_wedge_the_worker() {
        let worker = ConsumptionWorker::spawn(Arc::new(Panicky), fast_options());
        worker.enqueue(job("user_a", 1)).unwrap();
        worker.wait_idle().await;
        assert_eq!(worker.pending(), 0);
    }

    #[tokio::test]
    async fn test_idle_lane_reopens() {
        let recorder = Arc::new(Recorder::default());
        let worker = ConsumptionWorker::spawn(recorder.clone(), fast_options());

        worker.enqueue(job("user_a", 1)).unwrap();
        worker.wait_idle().await;
        // Let the lane time out and close
        tokio::time::sleep(Duration::from_millis(60)).await;

        worker.enqueue(job("user_a", 2)).unwrap();
        worker.wait_idle().await;
        assert_eq!(recorder.seen.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let recorder = Arc::new(Recorder::default());
        let worker = ConsumptionWorker::spawn(recorder.clone(), fast_options());

        for n in 0..10 {
            worker.enqueue(job(&format!("user_{}", n % 3), n)).unwrap();
        }
        worker.shutdown().await;

        assert_eq!(recorder.seen.lock().await.len(), 10);
        assert_eq!(worker.pending(), 0);
        assert!(worker.enqueue(job("user_a", 1)).is_err());
    }
}
