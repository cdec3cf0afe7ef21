//! Activity delivery
//!
//! Outbound delivery runs apart from the inbound request path. Handlers
//! `submit` jobs into a bounded queue; a dispatch loop hands each job to its
//! own task, and a semaphore caps how many HTTP attempts are in flight.
//! A permit is held only for the duration of one attempt, never across a
//! backoff sleep.
//!
//! Jobs taken off the queue stay pending until they finish, retries
//! included. At most `queue_capacity` jobs are pending; at that point the
//! loop stops draining the queue, it fills up, and `submit` sheds load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use super::signature::RequestSigner;
use crate::config::DeliveryConfig;
use crate::metrics::{DELIVERY_DURATION_SECONDS, observe_delivery};

/// One outbound POST of a payload to one inbox
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub inbox_url: String,
    /// Serialized activity, shared between the jobs of one fan-out
    pub payload: Arc<[u8]>,
    /// Attempts made so far
    pub attempt: u32,
    pub enqueued_at: Instant,
}

impl DeliveryJob {
    pub fn new(inbox_url: impl Into<String>, payload: Arc<[u8]>) -> Self {
        Self {
            inbox_url: inbox_url.into(),
            payload,
            attempt: 0,
            enqueued_at: Instant::now(),
        }
    }
}

/// Why a single delivery attempt failed
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Network(String),

    #[error("inbox answered HTTP {0}")]
    Status(u16),

    #[error("could not sign request: {0}")]
    Signing(String),
}

/// Sends one payload to one inbox
pub trait DeliveryTransport: Send + Sync + 'static {
    fn deliver<'a>(
        &'a self,
        inbox_url: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

/// Signed HTTP transport
pub struct HttpTransport {
    http_client: reqwest::Client,
    signer: RequestSigner,
}

impl HttpTransport {
    pub fn new(http_client: reqwest::Client, signer: RequestSigner) -> Self {
        Self {
            http_client,
            signer,
        }
    }
}

impl DeliveryTransport for HttpTransport {
    fn deliver<'a>(
        &'a self,
        inbox_url: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            let sig_headers = self
                .signer
                .sign("POST", inbox_url, Some(payload))
                .map_err(|e| DeliveryError::Signing(e.to_string()))?;

            let mut request = self
                .http_client
                .post(inbox_url)
                .header("Content-Type", "application/activity+json")
                .header("Accept", "application/activity+json")
                .header("Date", sig_headers.date)
                .header("Signature", sig_headers.signature);
            if let Some(digest) = sig_headers.digest {
                request = request.header("Digest", digest);
            }

            let response = request
                .body(payload.to_vec())
                .send()
                .await
                .map_err(|e| DeliveryError::Network(e.to_string()))?;

            if !response.status().is_success() {
                return Err(DeliveryError::Status(response.status().as_u16()));
            }
            Ok(())
        })
    }
}

/// Retry schedule for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_age: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            max_age: config.max_age(),
        }
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Delivery counters, mirrored into Prometheus
#[derive(Debug, Default)]
pub struct DeliveryStats {
    submitted: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    queue_full: AtomicU64,
    expired: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStatsSnapshot {
    pub submitted: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
    pub queue_full: u64,
    pub expired: u64,
}

impl DeliveryStats {
    fn record(&self, counter: &AtomicU64, outcome: &str) {
        counter.fetch_add(1, Ordering::Relaxed);
        observe_delivery(outcome);
    }

    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the running dispatcher
pub struct DeliveryDispatcher {
    tx: RwLock<Option<mpsc::Sender<DeliveryJob>>>,
    stats: Arc<DeliveryStats>,
    dispatch_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryDispatcher {
    /// Start the dispatch loop on the current runtime.
    pub fn spawn(config: &DeliveryConfig, transport: Arc<dyn DeliveryTransport>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(DeliveryStats::default());
        let worker = Worker {
            transport,
            policy: RetryPolicy::from_config(config),
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            max_pending: config.queue_capacity.max(config.workers).max(1),
            stats: stats.clone(),
        };

        let dispatch_loop = tokio::spawn(worker.run(rx));
        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Delivery dispatcher started"
        );

        Self {
            tx: RwLock::new(Some(tx)),
            stats,
            dispatch_loop: tokio::sync::Mutex::new(Some(dispatch_loop)),
        }
    }

    /// Enqueue a job without waiting. A full or closed queue drops it.
    pub fn submit(&self, job: DeliveryJob) {
        let guard = match self.tx.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(tx) = guard.as_ref() else {
            tracing::warn!(inbox = %job.inbox_url, "Delivery dispatcher is shut down, dropping job");
            self.stats.record(&self.stats.dropped, "dropped");
            return;
        };

        match tx.try_send(job) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(inbox = %job.inbox_url, "Delivery queue full, dropping job");
                self.stats.record(&self.stats.queue_full, "queue_full");
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::warn!(inbox = %job.inbox_url, "Delivery queue closed, dropping job");
                self.stats.record(&self.stats.dropped, "dropped");
            }
        }
    }

    pub fn submit_all(&self, jobs: impl IntoIterator<Item = DeliveryJob>) {
        for job in jobs {
            self.submit(job);
        }
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Close the queue and wait for queued and in-flight jobs to finish.
    pub async fn shutdown(&self) {
        match self.tx.write() {
            Ok(mut guard) => drop(guard.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }

        if let Some(handle) = self.dispatch_loop.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Delivery dispatch loop panicked");
            }
        }
        tracing::info!(stats = ?self.stats(), "Delivery dispatcher stopped");
    }
}

#[derive(Clone)]
struct Worker {
    transport: Arc<dyn DeliveryTransport>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    /// Jobs taken off the queue and not yet finished
    max_pending: usize,
    stats: Arc<DeliveryStats>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<DeliveryJob>) {
        let mut in_flight = JoinSet::new();

        loop {
            // Never false while `in_flight` is empty, so one branch is always live.
            let accepting = in_flight.len() < self.max_pending;
            tokio::select! {
                job = rx.recv(), if accepting => match job {
                    Some(job) => {
                        in_flight.spawn(self.clone().deliver_with_retry(job));
                    }
                    None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Delivery task panicked");
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Delivery task panicked");
            }
        }
    }

    async fn deliver_with_retry(self, mut job: DeliveryJob) {
        loop {
            job.attempt += 1;

            let result = {
                let Ok(_permit) = self.permits.acquire().await else {
                    return;
                };
                let started = Instant::now();
                let result = self.transport.deliver(&job.inbox_url, &job.payload).await;
                let label = if result.is_ok() { "success" } else { "failure" };
                DELIVERY_DURATION_SECONDS
                    .with_label_values(&[label])
                    .observe(started.elapsed().as_secs_f64());
                result
            };

            let error = match result {
                Ok(()) => {
                    tracing::debug!(inbox = %job.inbox_url, attempt = job.attempt, "Delivered");
                    self.stats.record(&self.stats.delivered, "delivered");
                    return;
                }
                Err(e) => e,
            };

            if job.attempt >= self.policy.max_attempts {
                tracing::warn!(
                    inbox = %job.inbox_url,
                    attempts = job.attempt,
                    error = %error,
                    "Delivery failed, giving up"
                );
                self.stats.record(&self.stats.dropped, "dropped");
                return;
            }

            let delay = self.policy.backoff(job.attempt);
            if job.enqueued_at.elapsed() + delay > self.policy.max_age {
                tracing::warn!(
                    inbox = %job.inbox_url,
                    attempts = job.attempt,
                    error = %error,
                    "Delivery exceeded maximum age, giving up"
                );
                self.stats.record(&self.stats.expired, "expired");
                return;
            }

            tracing::debug!(
                inbox = %job.inbox_url,
                attempt = job.attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Delivery failed, retrying"
            );
            self.stats.record(&self.stats.retried, "retried");
            tokio::time::sleep(delay).await;
        }
    }
}
