//! Per-user sync cycles and the scheduler that runs them
//!
//! A cycle resumes from the user's durable cursor, fetches new messages in
//! order, classifies and publishes each one, and only then records the
//! cursor of the last message it fully handled: published, or skipped as
//! unprocessable. Cancellation is checked between messages, so a cancelled
//! cycle still records the progress it made.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::MessageSource;
use crate::consumer::ResultPublisher;
use crate::error::{Result, TriageError};
use crate::rules::RuleEngine;
use crate::sync_state::{SyncCursor, SyncStateTracker};

/// Outcome of one sync cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub user_id: String,
    /// Messages listed as new
    pub listed: usize,
    /// Messages classified and published
    pub processed: usize,
    /// Messages that could not be fetched or normalized
    pub skipped: usize,
    pub cancelled: bool,
    pub cursor: Option<SyncCursor>,
    pub next_interval_secs: u64,
}

pub struct SyncWorker {
    source: Arc<dyn MessageSource>,
    engine: Arc<RuleEngine>,
    tracker: Arc<SyncStateTracker>,
    publisher: Arc<dyn ResultPublisher>,
    max_messages_per_cycle: usize,
}

impl SyncWorker {
    pub fn new(
        source: Arc<dyn MessageSource>,
        engine: Arc<RuleEngine>,
        tracker: Arc<SyncStateTracker>,
        publisher: Arc<dyn ResultPublisher>,
        max_messages_per_cycle: usize,
    ) -> Self {
        Self {
            source,
            engine,
            tracker,
            publisher,
            max_messages_per_cycle: max_messages_per_cycle.max(1),
        }
    }

    pub fn tracker(&self) -> &Arc<SyncStateTracker> {
        &self.tracker
    }

    /// Run one cycle for `user_id`
    ///
    /// A fetch or publish failure stops the cycle; the messages handled
    /// before it are still recorded, then the error is returned.
    pub async fn run_cycle(
        &self,
        user_id: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Result<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let cycle_started = Utc::now();
        let resume_from = self.tracker.cursor(user_id).await?;

        debug!(
            "Cycle {} for {} resuming from {:?}",
            cycle_id,
            user_id,
            resume_from.as_ref().map(|c| &c.message_id)
        );

        let ids = self
            .source
            .list_new_message_ids(user_id, resume_from.as_ref(), self.max_messages_per_cycle)
            .await?;

        let mut last_done: Option<SyncCursor> = None;
        let mut processed = 0usize;
        let mut skipped = 0usize;
        let mut cancelled = false;
        let mut failure = None;

        for id in &ids {
            if *cancel.borrow() {
                info!(
                    "Cycle {} for {} cancelled after {} messages",
                    cycle_id, user_id, processed
                );
                cancelled = true;
                break;
            }

            let email = match self.source.fetch_message(user_id, id).await {
                Ok(email) => email,
                Err(e @ (TriageError::MessageNotFound(_) | TriageError::InvalidMessageFormat(_))) => {
                    warn!("Skipping message {} for {}: {}", id, user_id, e);
                    skipped += 1;
                    // A skipped message is handled too. Its date is unknown,
                    // so keep the last known one; an older date only widens
                    // the next listing.
                    let message_date = last_done
                        .as_ref()
                        .or(resume_from.as_ref())
                        .map_or(cycle_started, |c| c.message_date);
                    last_done = Some(SyncCursor {
                        message_id: id.clone(),
                        message_date,
                    });
                    continue;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            let result = self.engine.classify(&email);
            if let Err(e) = self.publisher.publish(&result).await {
                failure = Some(e);
                break;
            }

            processed += 1;
            last_done = Some(SyncCursor {
                message_id: email.email_id,
                message_date: email.date,
            });
        }

        let state = self
            .tracker
            .record_sync_result_with_retry(
                user_id,
                (processed + skipped) as u64,
                last_done.clone(),
                Some(cycle_id),
            )
            .await?;

        if let Some(e) = failure {
            warn!(
                "Cycle {} for {} stopped after {} messages: {}",
                cycle_id, user_id, processed, e
            );
            return Err(e);
        }

        let report = CycleReport {
            cycle_id,
            user_id: user_id.to_string(),
            listed: ids.len(),
            processed,
            skipped,
            cancelled,
            cursor: state.cursor(),
            next_interval_secs: state.current_polling_interval_secs,
        };

        info!(
            "Cycle {} for {}: listed={}, processed={}, skipped={}, next poll in {}s",
            cycle_id, user_id, report.listed, processed, skipped, report.next_interval_secs
        );
        Ok(report)
    }
}

/// Totals for one user across a scheduler run
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserSummary {
    pub user_id: String,
    pub cycles: u64,
    pub messages_processed: u64,
    pub failed_cycles: u64,
}

/// Runs every user's sync loop concurrently
pub struct SyncScheduler {
    worker: Arc<SyncWorker>,
}

impl SyncScheduler {
    pub fn new(worker: Arc<SyncWorker>) -> Self {
        Self { worker }
    }

    /// Sync each user until `shutdown` flips to true, or for a single cycle
    /// when `once` is set
    ///
    /// Failed cycles are logged and retried after the user's interval.
    /// Configuration errors stop the whole run.
    pub async fn run(
        &self,
        users: Vec<String>,
        once: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<UserSummary>> {
        let mut tasks = JoinSet::new();

        for user_id in users {
            let worker = Arc::clone(&self.worker);
            let shutdown = shutdown.clone();
            tasks.spawn(async move { user_loop(worker, user_id, once, shutdown).await });
        }

        let mut summaries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => error!("Sync task failed: {}", e),
            }
        }

        summaries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(summaries)
    }
}

async fn user_loop(
    worker: Arc<SyncWorker>,
    user_id: String,
    once: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<UserSummary> {
    let mut summary = UserSummary {
        user_id: user_id.clone(),
        ..Default::default()
    };

    loop {
        if *shutdown.borrow() {
            break;
        }

        summary.cycles += 1;
        match worker.run_cycle(&user_id, &shutdown).await {
            Ok(report) => summary.messages_processed += report.processed as u64,
            Err(e) if e.is_configuration() => return Err(e),
            Err(e) => {
                summary.failed_cycles += 1;
                warn!("Sync cycle for {} failed: {}", user_id, e);
            }
        }

        if once {
            break;
        }

        let interval = match worker.tracker().get_next_poll_interval(&user_id).await {
            Ok(interval) => interval,
            Err(e) => {
                warn!("Could not read polling interval for {}: {}", user_id, e);
                worker.tracker().strategy().initial_interval()
            }
        };
        debug!("Next sync for {} in {:?}", user_id, interval);

        if wait_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }

    info!(
        "Sync loop for {} finished after {} cycles ({} messages)",
        user_id, summary.cycles, summary.messages_processed
    );
    Ok(summary)
}

/// Sleep for `interval`; returns true if shutdown was requested meanwhile
async fn wait_or_shutdown(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        changed = shutdown.changed() => {
            // a dropped sender also means stop
            changed.is_err() || *shutdown.borrow()
        }
    }
}
