pub mod elastic;

use std::time::Duration;

use anyhow::Context;

use rusqlite::Connection;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db;
use crate::event::IndexedEvent;

pub const BULK_CHUNK: usize = 500;
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Accepted,
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("bulk request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unreadable bulk response: {0}")]
    Response(String),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One bulk round trip. Implementations return one outcome per event, in order.
#[allow(async_fn_in_trait)]
pub trait BulkBackend {
    async fn bulk(&self, index: &str, events: &[IndexedEvent]) -> Result<Vec<ItemOutcome>, IndexError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub event: IndexedEvent,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IndexReport {
    pub submitted: usize,
    /// Ids of accepted events.
    pub accepted: Vec<String>,
    pub failed: Vec<FailedEvent>,
    /// Whole-request errors, one per failed attempt.
    pub errors: Vec<String>,
    pub attempts: u32,
    pub spilled: usize,
}

pub struct BatchIndexer<B> {
    backend: B,
    policy: RetryPolicy,
}

impl<B: BulkBackend> BatchIndexer<B> {
    pub fn new(backend: B, policy: RetryPolicy) -> Self {
        BatchIndexer { backend, policy }
    }

    pub async fn submit(&self, index: &str, events: Vec<IndexedEvent>) -> IndexReport {
        let mut report = IndexReport {
            submitted: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            info!("No events to index into {}", index);
            return report;
        }

        for attempt in 0..=self.policy.max_retries {
            report.attempts = attempt + 1;

            let err = match self.backend.bulk(index, &events).await {
                Ok(outcomes) if outcomes.len() == events.len() => {
                    for (event, outcome) in events.into_iter().zip(outcomes) {
                        match outcome {
                            ItemOutcome::Accepted => report.accepted.push(event.id()),
                            ItemOutcome::Rejected(reason) => {
                                report.failed.push(FailedEvent { event, reason })
                            }
                        }
                    }
                    if report.failed.is_empty() {
                        info!("Indexed {} events into {}", report.accepted.len(), index);
                    } else {
                        warn!(
                            "Indexed {} of {} events into {}; {} rejected",
                            report.accepted.len(),
                            report.submitted,
                            index,
                            report.failed.len()
                        );
                    }
                    return report;
                }
                Ok(outcomes) => IndexError::Response(format!(
                    "expected {} items, got {}",
                    events.len(),
                    outcomes.len()
                )),
                Err(e) => e,
            };

            report.errors.push(err.to_string());
            if attempt < self.policy.max_retries {
                let backoff = self.policy.backoff(attempt);
                warn!(
                    "Bulk request to {} failed (attempt {}/{}): {}, retrying in {}ms",
                    index,
                    attempt + 1,
                    self.policy.max_retries + 1,
                    err,
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
            }
        }

        let reason = report.errors.last().cloned().unwrap_or_default();
        error!(
            "Giving up on {} events for {} after {} attempts: {}",
            events.len(),
            index,
            report.attempts,
            reason
        );
        report.failed = events
            .into_iter()
            .map(|event| FailedEvent {
                event,
                reason: reason.clone(),
            })
            .collect();
        report
    }

    /// Submit, then reconcile the spill queue: accepted events leave it,
    /// failed ones are (re)queued.
    pub async fn deliver(
        &self,
        index: &str,
        events: Vec<IndexedEvent>,
        conn: &Connection,
    ) -> anyhow::Result<IndexReport> {
        let mut report = self.submit(index, events).await;
        db::clear_spilled(conn, index, &report.accepted)?;
        report.spilled = db::spill_events(conn, index, &report.failed)?;
        if report.spilled > 0 {
            warn!("Spilled {} events for {} to the local queue", report.spilled, index);
        }
        Ok(report)
    }
}

/// Deliver `events` in bulk chunks of [`BULK_CHUNK`]. The backend is only
/// built when there is something to send; if it cannot be built the whole
/// batch goes to the spill queue before the error is returned.
pub async fn ship<B: BulkBackend>(
    connect: impl FnOnce() -> anyhow::Result<B>,
    policy: RetryPolicy,
    conn: &Connection,
    index: &str,
    events: Vec<IndexedEvent>,
) -> anyhow::Result<IndexReport> {
    let mut totals = IndexReport::default();
    if events.is_empty() {
        info!("No events to index into {}", index);
        return Ok(totals);
    }

    let backend = match connect() {
        Ok(backend) => backend,
        Err(e) => {
            let reason = format!("{:#}", e);
            let failed: Vec<FailedEvent> = events
                .into_iter()
                .map(|event| FailedEvent {
                    event,
                    reason: reason.clone(),
                })
                .collect();
            let spilled = db::spill_events(conn, index, &failed)?;
            error!("No backend for {}: {}; spilled {} events", index, reason, spilled);
            return Err(e)
                .with_context(|| format!("{} events for {} spilled to the local queue", spilled, index));
        }
    };

    let indexer = BatchIndexer::new(backend, policy);
    totals.submitted = events.len();
    let mut events = events.into_iter().peekable();
    while events.peek().is_some() {
        let chunk: Vec<IndexedEvent> = events.by_ref().take(BULK_CHUNK).collect();
        let report = indexer.deliver(index, chunk, conn).await?;
        totals.attempts += report.attempts;
        totals.accepted.extend(report.accepted);
        totals.failed.extend(report.failed);
        totals.spilled += report.spilled;
        totals.errors.extend(report.errors);
    }
    Ok(totals)
}

// ── Tests ──
