use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};

use crate::dedup;
use crate::deliver::Deliverer;
use crate::generator::ContentGenerator;
use crate::models::{AttemptOutcome, FacultyProfile, NewAttempt, ScheduleStatus};
use crate::store::ScheduleStore;

/// Terminal classification of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Sent { message_id: String },
    Skipped,
    Failed { reason: String },
}

impl PipelineOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineOutcome::Sent { .. } => "sent",
            PipelineOutcome::Skipped => "skipped",
            PipelineOutcome::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The per-faculty state machine: generate, deduplicate, deliver, record the
/// outcome in the ledger, advance the schedule.
///
/// Collaborator errors never escape `process`; they become a terminal
/// `failed` outcome plus a one-day schedule retry. The terminal ledger and
/// schedule writes are the only store mutations besides the initial
/// `processing` mark.
pub struct FacultyPipeline {
    store: Arc<dyn ScheduleStore>,
    generator: Arc<dyn ContentGenerator>,
    deliverer: Arc<dyn Deliverer>,
    lookback_days: i64,
}

impl FacultyPipeline {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        generator: Arc<dyn ContentGenerator>,
        deliverer: Arc<dyn Deliverer>,
        lookback_days: i64,
    ) -> Self {
        Self {
            store,
            generator,
            deliverer,
            lookback_days,
        }
    }

    pub async fn process(&self, profile: &FacultyProfile, today: NaiveDate) -> PipelineOutcome {
        let email = profile.email.as_str();
        let started = Instant::now();
        tracing::info!(email, "processing faculty member");

        if let Err(error) = self
            .store
            .mark_status(email, ScheduleStatus::Processing)
            .await
        {
            tracing::error!(email, %error, "failed to mark schedule as processing");
            return PipelineOutcome::Failed {
                reason: error.to_string(),
            };
        }

        let digest = match self.generator.generate(profile).await {
            Ok(digest) => digest,
            Err(error) => {
                let reason = error.to_string();
                tracing::warn!(email, %error, "content generation failed");
                let mut attempt = NewAttempt::new(email, AttemptOutcome::Failed);
                attempt.error_detail = Some(reason.clone());
                attempt.elapsed_seconds = started.elapsed().as_secs_f64();
                self.record(profile, attempt, false, today).await;
                return PipelineOutcome::Failed { reason };
            }
        };

        tracing::debug!(
            email,
            tokens = digest.tokens_used,
            generation_secs = digest.elapsed_seconds,
            "digest content generated"
        );

        let fingerprint = dedup::fingerprint(&digest.content);
        let duplicate = match dedup::is_duplicate(
            self.store.as_ref(),
            email,
            &digest.content,
            self.lookback_days,
            Utc::now(),
        )
        .await
        {
            Ok(duplicate) => duplicate,
            Err(error) => {
                let reason = error.to_string();
                tracing::error!(email, %error, "duplicate lookup failed");
                let mut attempt = NewAttempt::new(email, AttemptOutcome::Failed);
                attempt.content_fingerprint = Some(fingerprint);
                attempt.error_detail = Some(reason.clone());
                attempt.elapsed_seconds = started.elapsed().as_secs_f64();
                attempt.tokens_used = digest.tokens_used;
                self.record(profile, attempt, false, today).await;
                return PipelineOutcome::Failed { reason };
            }
        };

        if duplicate {
            tracing::info!(email, "skipping duplicate digest");
            let mut attempt = NewAttempt::new(email, AttemptOutcome::SkippedDuplicate);
            attempt.content_fingerprint = Some(fingerprint);
            attempt.elapsed_seconds = started.elapsed().as_secs_f64();
            attempt.tokens_used = digest.tokens_used;
            // A duplicate is not a failure: the schedule still moves by its
            // cadence, so the same content is not re-checked every day.
            self.record(profile, attempt, true, today).await;
            return PipelineOutcome::Skipped;
        }

        match self.deliverer.deliver(profile, &digest.content).await {
            Ok(receipt) => {
                let mut attempt = NewAttempt::new(email, AttemptOutcome::Success);
                attempt.content_fingerprint = Some(fingerprint);
                attempt.markdown_path = receipt
                    .artifacts
                    .markdown
                    .as_ref()
                    .map(|p| p.display().to_string());
                attempt.html_path = receipt
                    .artifacts
                    .html
                    .as_ref()
                    .map(|p| p.display().to_string());
                attempt.faculty_folder = receipt
                    .artifacts
                    .folder
                    .as_ref()
                    .map(|p| p.display().to_string());
                attempt.elapsed_seconds = started.elapsed().as_secs_f64();
                attempt.tokens_used = digest.tokens_used;
                self.record(profile, attempt, true, today).await;
                tracing::info!(email, message_id = %receipt.message_id, "digest sent");
                PipelineOutcome::Sent {
                    message_id: receipt.message_id,
                }
            }
            Err(failure) => {
                let reason = failure.error.to_string();
                tracing::warn!(email, error = %reason, "digest delivery failed");
                let mut attempt = NewAttempt::new(email, AttemptOutcome::Failed);
                attempt.content_fingerprint = Some(fingerprint);
                attempt.error_detail = Some(reason.clone());
                attempt.markdown_path = failure
                    .artifacts
                    .markdown
                    .as_ref()
                    .map(|p| p.display().to_string());
                attempt.html_path = failure
                    .artifacts
                    .html
                    .as_ref()
                    .map(|p| p.display().to_string());
                attempt.faculty_folder = failure
                    .artifacts
                    .folder
                    .as_ref()
                    .map(|p| p.display().to_string());
                attempt.elapsed_seconds = started.elapsed().as_secs_f64();
                attempt.tokens_used = digest.tokens_used;
                self.record(profile, attempt, false, today).await;
                PipelineOutcome::Failed { reason }
            }
        }
    }

    /// Terminal write: ledger append plus schedule advance. Store failures
    /// here are logged but never crash the batch; a record left in
    /// `processing` is recovered by the staleness release on the next run.
    async fn record(
        &self,
        profile: &FacultyProfile,
        attempt: NewAttempt,
        success: bool,
        today: NaiveDate,
    ) {
        let email = profile.email.as_str();
        if let Err(error) = self.store.append_attempt(attempt).await {
            tracing::error!(email, %error, "failed to append attempt to ledger");
        }
        if let Err(error) = self
            .store
            .advance(email, profile.cadence, success, today)
            .await
        {
            tracing::error!(email, %error, "failed to advance schedule");
        }
    }
}
