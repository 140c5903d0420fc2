use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fxbatch_contracts::events::{
    map_object, now_utc_iso, EventWriter, ProgressObserver, ProgressUpdate,
};
use fxbatch_contracts::models::ModelRegistry;
use fxbatch_contracts::runs::{
    BatchItem, BatchReport, FailureReason, GenerationRequest, GenerationResult,
};
use serde_json::json;

use crate::decoder::{ImageFxDecoder, ResponseDecoder};
use crate::error::{TransportError, TransportErrorKind};
use crate::session::{env_f64, GenerationTransport};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// What the runner does with a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    AbortBatch,
    FailItem,
}

impl Disposition {
    pub fn for_kind(kind: TransportErrorKind) -> Self {
        match kind {
            TransportErrorKind::RateLimited | TransportErrorKind::ServerError => Disposition::Retry,
            TransportErrorKind::Unauthorized => Disposition::AbortBatch,
            TransportErrorKind::Timeout
            | TransportErrorKind::ConnectionFailed
            | TransportErrorKind::ClientError => Disposition::FailItem,
        }
    }
}

/// Bounded exponential backoff for retryable transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per item, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            factor: 2,
            max_delay: Duration::from_millis(16_000),
        }
    }
}

impl RetryPolicy {
    /// Defaults overridden by `FXBATCH_MAX_ATTEMPTS`, `FXBATCH_BACKOFF_BASE_MS`
    /// and `FXBATCH_BACKOFF_MAX_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_attempts = env_f64("FXBATCH_MAX_ATTEMPTS", 3.0, 1.0, 6.0).round() as u32;
        let base_ms = env_f64("FXBATCH_BACKOFF_BASE_MS", 1_000.0, 0.0, 60_000.0).round() as u64;
        let max_ms = env_f64("FXBATCH_BACKOFF_MAX_MS", 16_000.0, 0.0, 300_000.0).round() as u64;
        Self {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            factor: defaults.factor,
            max_delay: Duration::from_millis(max_ms.max(base_ms)),
        }
    }

    /// No waiting between attempts.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before the attempt following `attempt` (1-based). A server
    /// supplied `Retry-After` can lengthen it but never past `max_delay`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        let backoff = self
            .base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay);
        match retry_after {
            Some(hint) if hint > backoff => hint.min(self.max_delay),
            _ => backoff,
        }
    }
}

/// Batch-scoped cancellation flag, checked before each item and before each
/// retry sleep. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

enum ItemOutcome {
    Settled,
    AuthFailed,
}

/// Drives a transport over an ordered list of requests, one at a time.
///
/// Every terminal condition ends up in the returned [`BatchReport`]; `run`
/// has no error path.
pub struct BatchRunner<T> {
    transport: T,
    decoder: Box<dyn ResponseDecoder>,
    registry: ModelRegistry,
    policy: RetryPolicy,
    cancel: CancellationToken,
    observer: Option<Box<dyn ProgressObserver>>,
    events: Option<EventWriter>,
    run_id: String,
}

impl<T: GenerationTransport> BatchRunner<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            decoder: Box::new(ImageFxDecoder),
            registry: ModelRegistry::default(),
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            observer: None,
            events: None,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_decoder(mut self, decoder: impl ResponseDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Attaches a JSONL event log. The writer's run id becomes the batch's.
    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.run_id = events.run_id().to_string();
        self.events = Some(events);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn run(&self, requests: Vec<GenerationRequest>) -> BatchReport {
        let started_at = now_utc_iso();
        let total = requests.len();
        let mut items: Vec<BatchItem> = requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| BatchItem::pending(index, request))
            .collect();
        let mut refreshed = BTreeMap::new();

        tracing::info!(run_id = %self.run_id, total, "batch started");
        self.emit("batch_started", json!({ "total": total }));

        let mut aborted: Option<FailureReason> = None;
        for item in items.iter_mut() {
            if aborted.is_none() && self.cancel.is_cancelled() {
                tracing::info!(run_id = %self.run_id, index = item.index, "batch cancelled");
                aborted = Some(FailureReason::Cancelled);
            }

            if let Some(reason) = aborted {
                let message = match reason {
                    FailureReason::AuthAborted => "batch aborted after an authentication failure",
                    _ => "batch cancelled before this item started",
                };
                settle(item, GenerationResult::failure(reason, message));
            } else if let Err(err) = item.request.validate(&self.registry) {
                tracing::warn!(index = item.index, "request rejected: {err}");
                settle(
                    item,
                    GenerationResult::failure(FailureReason::InvalidRequest, err.to_string()),
                );
            } else if let ItemOutcome::AuthFailed = self.process(item, &mut refreshed) {
                aborted = Some(FailureReason::AuthAborted);
            }

            self.notify(item, total);
        }

        let report = BatchReport::new(
            self.run_id.clone(),
            started_at,
            now_utc_iso(),
            items,
            refreshed,
        );
        tracing::info!(
            run_id = %self.run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            images = report.total_images(),
            "batch finished"
        );
        self.emit(
            "batch_finished",
            json!({
                "total": report.total(),
                "succeeded": report.succeeded(),
                "failed": report.failed(),
                "total_images": report.total_images(),
            }),
        );
        report
    }

    fn process(
        &self,
        item: &mut BatchItem,
        refreshed: &mut BTreeMap<String, String>,
    ) -> ItemOutcome {
        if let Err(err) = item.submit() {
            tracing::error!(index = item.index, "{err}");
            return ItemOutcome::Settled;
        }

        loop {
            item.record_attempt();
            let attempt = item.attempts();
            let err = match self.transport.generate(&item.request) {
                Ok(raw) => {
                    refreshed.extend(raw.refreshed_cookies.clone());
                    settle(item, self.decoder.decode(&raw));
                    return ItemOutcome::Settled;
                }
                Err(err) => {
                    refreshed.extend(self.transport.take_refreshed_cookies());
                    err
                }
            };

            if err.kind() == TransportErrorKind::ClientError {
                let rejection = err
                    .body()
                    .and_then(|body| self.decoder.classify_rejection(body));
                if let Some(rejection) = rejection {
                    settle(item, GenerationResult::Failure(rejection));
                    return ItemOutcome::Settled;
                }
            }

            match Disposition::for_kind(err.kind()) {
                Disposition::AbortBatch => {
                    tracing::warn!(
                        index = item.index,
                        "authentication failed, aborting batch: {err}"
                    );
                    settle(item, GenerationResult::Failure(err.to_failure()));
                    return ItemOutcome::AuthFailed;
                }
                Disposition::FailItem => {
                    tracing::warn!(index = item.index, "item failed: {err}");
                    settle(item, GenerationResult::Failure(err.to_failure()));
                    return ItemOutcome::Settled;
                }
                Disposition::Retry if attempt >= self.policy.max_attempts => {
                    tracing::warn!(index = item.index, attempt, "giving up after retries: {err}");
                    settle(item, GenerationResult::Failure(err.to_failure()));
                    return ItemOutcome::Settled;
                }
                Disposition::Retry => {
                    let delay = self.policy.delay_for(attempt, retry_after(&err));
                    tracing::info!(
                        index = item.index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient error: {err}"
                    );
                    self.emit(
                        "item_retry",
                        json!({
                            "index": item.index,
                            "attempt": attempt,
                            "delay_ms": delay.as_millis() as u64,
                            "reason": err.failure_reason().as_str(),
                        }),
                    );
                    if !self.sleep_unless_cancelled(delay) {
                        let message = format!("batch cancelled while waiting to retry ({err})");
                        settle(item, GenerationResult::failure(FailureReason::Cancelled, message));
                        return ItemOutcome::Settled;
                    }
                }
            }
        }
    }

    /// Returns false when cancellation was signalled before or during the wait.
    fn sleep_unless_cancelled(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    fn notify(&self, item: &BatchItem, total: usize) {
        let update = ProgressUpdate {
            index: item.index,
            total,
            status: item.status(),
            images: item.images().len(),
            attempts: item.attempts(),
            error: item.failure(),
        };
        tracing::debug!(
            index = item.index,
            status = item.status().as_str(),
            images = update.images,
            "item settled"
        );
        if let Some(observer) = self.observer.as_deref() {
            observer.on_item_complete(&update);
        }
        if let Some(events) = self.events.as_ref() {
            events.on_item_complete(&update);
        }
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit(event_type, map_object(payload)) {
            tracing::warn!(path = %events.path().display(), "event write failed: {err:#}");
        }
    }
}

fn settle(item: &mut BatchItem, result: GenerationResult) {
    if let Err(err) = item.settle(result) {
        tracing::error!(index = item.index, "{err}");
    }
}

fn retry_after(err: &TransportError) -> Option<Duration> {
    match err {
        TransportError::RateLimited { retry_after, .. } => *retry_after,
        _ => None,
    }
}
