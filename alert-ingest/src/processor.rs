use std::fmt::{self, Display};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::alert::Alert;
use crate::context::RequestContext;
use crate::sinks::{AlertSink, SinkError};

const METRIC_ALERTS_PROCESSED: &str = "alert_processor_alerts_total";
const METRIC_PROCESSING_DURATION: &str = "alert_processor_duration_seconds";
const METRIC_BATCH_SIZE: &str = "alert_processor_batch_size";
const METRIC_SATURATED: &str = "alert_processor_saturated_total";
const METRIC_QUEUE_SATURATION: &str = "alert_processor_queue_saturation_percent";

#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    /// Number of worker tasks pulling from the shared queue
    pub workers: usize,
    /// Maximum number of alerts queued or in flight at once
    pub queue_depth: usize,
    /// How long a request may wait for queue slots before it is turned away
    pub submit_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_depth: 2048,
            submit_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("alert processing queue is saturated, retry later")]
    Saturated,
    #[error("alert processor is shutting down")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Sink(String),
    Unavailable(String),
    TimedOut,
    Panicked,
    Abandoned,
}

impl FailureReason {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Sink(_) => "rejected",
            Self::Unavailable(_) => "unavailable",
            Self::TimedOut => "timed_out",
            Self::Panicked => "panicked",
            Self::Abandoned => "abandoned",
        }
    }
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sink(message) => write!(f, "rejected by pipeline: {message}"),
            Self::Unavailable(message) => write!(f, "pipeline unavailable: {message}"),
            Self::TimedOut => f.write_str("processing did not finish before the request deadline"),
            Self::Panicked => f.write_str("processing failed unexpectedly"),
            Self::Abandoned => f.write_str("request was cancelled before processing started"),
        }
    }
}

/// Terminal state of one submitted alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertOutcome {
    Succeeded,
    Failed(FailureReason),
}

impl AlertOutcome {
    fn as_tag(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed(reason) => reason.as_tag(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Success,
    PartialSuccess,
    ValidationFailed,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertError {
    pub index: usize,
    pub fingerprint: String,
    pub reason: FailureReason,
}

impl Display for AlertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alert {} ({}): {}", self.index, self.fingerprint, self.reason)
    }
}

/// Aggregate result of one request's alerts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingOutcome {
    pub alerts_received: usize,
    pub alerts_processed: usize,
    pub per_alert_errors: Vec<AlertError>,
    pub status: ProcessingStatus,
}

impl ProcessingOutcome {
    /// Pair outcomes with the fingerprints of the alerts they belong to, both in
    /// submission order.
    pub fn from_outcomes(fingerprints: &[String], outcomes: Vec<AlertOutcome>) -> Self {
        let alerts_received = fingerprints.len();
        let per_alert_errors: Vec<AlertError> = outcomes
            .into_iter()
            .zip(fingerprints)
            .enumerate()
            .filter_map(|(index, (outcome, fingerprint))| match outcome {
                AlertOutcome::Succeeded => None,
                AlertOutcome::Failed(reason) => Some(AlertError {
                    index,
                    fingerprint: fingerprint.clone(),
                    reason,
                }),
            })
            .collect();
        let alerts_processed = alerts_received - per_alert_errors.len();

        let status = if alerts_processed == alerts_received {
            ProcessingStatus::Success
        } else if alerts_processed == 0 {
            ProcessingStatus::Failure
        } else {
            ProcessingStatus::PartialSuccess
        };

        Self {
            alerts_received,
            alerts_processed,
            per_alert_errors,
            status,
        }
    }

    pub fn validation_failed(alerts_received: usize) -> Self {
        Self {
            alerts_received,
            alerts_processed: 0,
            per_alert_errors: Vec::new(),
            status: ProcessingStatus::ValidationFailed,
        }
    }
}

/// Hands one queue slot back when the job holding it is dropped, whatever
/// state the job ended in.
struct QueueSlot(Arc<Semaphore>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.add_permits(1);
    }
}

struct Job {
    alert: Alert,
    ctx: RequestContext,
    result: oneshot::Sender<AlertOutcome>,
    _slot: QueueSlot,
}

/// Bounded worker pool calling the `AlertSink` once per alert.
///
/// Queue depth is bounded by a semaphore: a request reserves one slot per alert
/// up front, all or nothing, so a batch is either fully queued or rejected
/// without any alert being attempted.
pub struct AlertProcessor {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    slots: Arc<Semaphore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: ProcessorConfig,
}

impl AlertProcessor {
    /// Spawn the worker tasks, needs to be called within a tokio runtime.
    pub fn new(sink: Arc<dyn AlertSink>, config: ProcessorConfig) -> Self {
        let queue_depth = config.queue_depth.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(queue_depth);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let sink = sink.clone();
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            debug!(worker, "alert queue closed, worker exiting");
                            break;
                        };
                        run_job(sink.as_ref(), job).await;
                    }
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            slots: Arc::new(Semaphore::new(queue_depth)),
            workers: Mutex::new(workers),
            config: ProcessorConfig {
                queue_depth,
                ..config
            },
        }
    }

    /// Submit a request's alerts and wait for all of them to reach a terminal
    /// state, or for the request deadline.
    ///
    /// Outcomes are returned in submission order. Alerts still pending at the
    /// deadline are reported as timed out and the request token is cancelled;
    /// work already running is left to finish on its own.
    #[instrument(skip_all, fields(alerts = alerts.len(), request_id = %ctx.request_id))]
    pub async fn process_batch(
        &self,
        alerts: Vec<Alert>,
        ctx: &RequestContext,
    ) -> Result<Vec<AlertOutcome>, ProcessorError> {
        if alerts.is_empty() {
            return Ok(Vec::new());
        }

        let sender = self
            .sender
            .lock()
            .map_err(|_| ProcessorError::Closed)?
            .clone()
            .ok_or(ProcessorError::Closed)?;

        let wanted = alerts.len();
        metrics::histogram!(METRIC_BATCH_SIZE).record(wanted as f64);
        if wanted > self.config.queue_depth {
            metrics::counter!(METRIC_SATURATED, "cause" => "batch_too_large").increment(1);
            warn!(
                alerts = wanted,
                queue_depth = self.config.queue_depth,
                "batch larger than the processing queue"
            );
            return Err(ProcessorError::Saturated);
        }
        let wanted_permits = u32::try_from(wanted).map_err(|_| ProcessorError::Saturated)?;

        let permits = match tokio::time::timeout(
            self.config.submit_timeout,
            self.slots.clone().acquire_many_owned(wanted_permits),
        )
        .await
        {
            Ok(Ok(permits)) => permits,
            Ok(Err(_)) => return Err(ProcessorError::Closed),
            Err(_) => {
                metrics::counter!(METRIC_SATURATED, "cause" => "submit_timeout").increment(1);
                warn!(alerts = wanted, "timed out waiting for processing queue slots");
                return Err(ProcessorError::Saturated);
            }
        };
        // Each job carries its own slot from here on
        permits.forget();
        self.report_saturation();

        let started = Instant::now();
        let mut pending = Vec::with_capacity(wanted);
        for alert in alerts {
            let (result, receiver) = oneshot::channel();
            let job = Job {
                alert,
                ctx: ctx.clone(),
                result,
                _slot: QueueSlot(self.slots.clone()),
            };
            if sender.send(job).await.is_err() {
                // The job came back with the error and was dropped, releasing its slot
                warn!("alert queue closed while submitting");
            }
            pending.push(receiver);
        }
        drop(sender);

        let deadline = ctx.deadline;
        let outcomes = join_all(pending.into_iter().map(|receiver| async move {
            match tokio::time::timeout_at(deadline, receiver).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => AlertOutcome::Failed(FailureReason::Unavailable(
                    "alert processor shut down".to_string(),
                )),
                Err(_) => AlertOutcome::Failed(FailureReason::TimedOut),
            }
        }))
        .await;

        if outcomes
            .iter()
            .any(|outcome| *outcome == AlertOutcome::Failed(FailureReason::TimedOut))
        {
            ctx.cancel.cancel();
            warn!("request deadline passed with alerts still pending");
        }

        metrics::histogram!(METRIC_PROCESSING_DURATION).record(started.elapsed().as_secs_f64());
        self.report_saturation();

        Ok(outcomes)
    }

    /// Stop accepting alerts and wait for the workers to drain the queue.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };

        info!(workers = workers.len(), "draining alert processor");
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "alert worker exited abnormally");
            }
        }
    }

    fn report_saturation(&self) {
        let available = self.slots.available_permits() as f64;
        metrics::gauge!(METRIC_QUEUE_SATURATION)
            .set(1f64 - available / self.config.queue_depth as f64);
    }
}

async fn run_job(sink: &dyn AlertSink, job: Job) {
    let Job {
        alert,
        ctx,
        result,
        _slot,
    } = job;

    let outcome = if ctx.cancel.is_cancelled() {
        AlertOutcome::Failed(FailureReason::Abandoned)
    } else {
        match AssertUnwindSafe(sink.process(&ctx, &alert))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => AlertOutcome::Succeeded,
            Ok(Err(SinkError::Rejected(message))) => {
                AlertOutcome::Failed(FailureReason::Sink(message))
            }
            Ok(Err(SinkError::Unavailable(message))) => {
                AlertOutcome::Failed(FailureReason::Unavailable(message))
            }
            Err(_) => {
                error!(
                    request_id = %ctx.request_id,
                    fingerprint = alert.fingerprint,
                    "alert sink panicked"
                );
                AlertOutcome::Failed(FailureReason::Panicked)
            }
        }
    };

    metrics::counter!(METRIC_ALERTS_PROCESSED, "result" => outcome.as_tag()).increment(1);

    if result.send(outcome).is_err() {
        debug!(
            request_id = %ctx.request_id,
            fingerprint = alert.fingerprint,
            "request stopped waiting before the alert finished"
        );
    }
}
