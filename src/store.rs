use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::models::{
    Cadence, DueFaculty, NewAttempt, ScheduleRecord, ScheduleStatus, StatusCounters,
};

/// Persistence failure reading or writing schedule state or the ledger.
///
/// Fatal to the attempt it occurred in, never to the whole run.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt {field} value in stored row: {value}")]
    CorruptField { field: &'static str, value: String },
}

/// Durable per-faculty scheduling state plus the append-only attempt ledger.
///
/// Injected everywhere as a trait object so the Postgres store can be swapped
/// for an in-memory double in tests. Every mutation is scoped to a single
/// faculty email; implementations must make each call atomic per record and
/// must not serialize calls for different emails against each other.
///
/// Date inputs are explicit parameters so schedule arithmetic never reads the
/// wall clock inside the store.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Create a schedule for a newly seen faculty email, due tomorrow.
    /// No-op when a schedule already exists; returns whether a row was
    /// created.
    async fn initialize(
        &self,
        email: &str,
        cadence: Cadence,
        today: NaiveDate,
    ) -> Result<bool, StoreError>;

    /// Faculty whose `next_due_date` has arrived and whose status allows
    /// processing (`pending` or `failed`), joined to active profiles,
    /// earliest-due and least-retried first.
    async fn select_due(
        &self,
        as_of: NaiveDate,
        limit: Option<i64>,
    ) -> Result<Vec<DueFaculty>, StoreError>;

    /// Single-record status transition, touching `updated_at`.
    async fn mark_status(&self, email: &str, status: ScheduleStatus) -> Result<(), StoreError>;

    /// Advance a schedule after a terminal attempt.
    ///
    /// Success: `last_sent_date = today`, `next_due_date = today +
    /// cadence.days()`, status back to `pending`, retries reset. Failure:
    /// `next_due_date = today + 1`, status `failed`, `retry_count`
    /// incremented, cadence untouched. Failure never pauses a schedule.
    async fn advance(
        &self,
        email: &str,
        cadence: Cadence,
        success: bool,
        today: NaiveDate,
    ) -> Result<(), StoreError>;

    /// Return `processing` records whose `updated_at` predates `stale_before`
    /// to `pending`, so a crashed worker cannot strand them. Returns the
    /// number of released records.
    async fn release_stale_processing(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Append one row to the attempt ledger.
    async fn append_attempt(&self, attempt: NewAttempt) -> Result<(), StoreError>;

    /// Fingerprint of the most recent successful attempt for this email
    /// after `since`, if any.
    async fn latest_success_fingerprint(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError>;

    /// Current schedule row for one faculty email.
    async fn schedule_for(&self, email: &str) -> Result<Option<ScheduleRecord>, StoreError>;

    /// Aggregate counters for the status and report surfaces.
    async fn counters(&self, today: NaiveDate) -> Result<StatusCounters, StoreError>;
}

/// The date a brand-new schedule first comes due: the day after it is seeded.
pub fn first_due_date(today: NaiveDate) -> NaiveDate {
    today + Duration::days(1)
}

#[cfg(test)]
pub mod memory {
    //! In-memory `ScheduleStore` used as the test double across the crate.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::models::{AttemptOutcome, FacultyProfile};

    #[derive(Default)]
    struct Inner {
        profiles: HashMap<String, FacultyProfile>,
        schedules: HashMap<String, ScheduleRecord>,
        attempts: Vec<NewAttempt>,
    }

    #[derive(Default)]
    pub struct MemoryStore {
        inner: Mutex<Inner>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_profile(&self, profile: FacultyProfile) {
            let mut inner = self.inner.lock().unwrap();
            inner.profiles.insert(profile.email.clone(), profile);
        }

        pub fn attempts_for(&self, email: &str) -> Vec<NewAttempt> {
            let inner = self.inner.lock().unwrap();
            inner
                .attempts
                .iter()
                .filter(|attempt| attempt.faculty_email == email)
                .cloned()
                .collect()
        }

        pub fn attempt_count(&self) -> usize {
            self.inner.lock().unwrap().attempts.len()
        }
    }

    #[async_trait]
    impl ScheduleStore for MemoryStore {
        async fn initialize(
            &self,
            email: &str,
            cadence: Cadence,
            today: NaiveDate,
        ) -> Result<bool, StoreError> {
            let mut inner = self.inner.lock().unwrap();
            if inner.schedules.contains_key(email) {
                return Ok(false);
            }
            inner.schedules.insert(
                email.to_string(),
                ScheduleRecord {
                    faculty_email: email.to_string(),
                    last_sent_date: None,
                    next_due_date: first_due_date(today),
                    cadence,
                    status: ScheduleStatus::Pending,
                    retry_count: 0,
                    updated_at: Utc::now(),
                },
            );
            Ok(true)
        }

        async fn select_due(
            &self,
            as_of: NaiveDate,
            limit: Option<i64>,
        ) -> Result<Vec<DueFaculty>, StoreError> {
            let inner = self.inner.lock().unwrap();
            let mut due: Vec<DueFaculty> = inner
                .schedules
                .values()
                .filter(|schedule| {
                    schedule.next_due_date <= as_of
                        && matches!(
                            schedule.status,
                            ScheduleStatus::Pending | ScheduleStatus::Failed
                        )
                })
                .filter_map(|schedule| {
                    let profile = inner.profiles.get(&schedule.faculty_email)?;
                    if !profile.active {
                        return None;
                    }
                    Some(DueFaculty {
                        profile: profile.clone(),
                        next_due_date: schedule.next_due_date,
                        retry_count: schedule.retry_count,
                    })
                })
                .collect();
            due.sort_by(|a, b| {
                (a.next_due_date, a.retry_count).cmp(&(b.next_due_date, b.retry_count))
            });
            if let Some(limit) = limit {
                due.truncate(limit as usize);
            }
            Ok(due)
        }

        async fn mark_status(
            &self,
            email: &str,
            status: ScheduleStatus,
        ) -> Result<(), StoreError> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(schedule) = inner.schedules.get_mut(email) {
                schedule.status = status;
                schedule.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn advance(
            &self,
            email: &str,
            cadence: Cadence,
            success: bool,
            today: NaiveDate,
        ) -> Result<(), StoreError> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(schedule) = inner.schedules.get_mut(email) {
                if success {
                    schedule.last_sent_date = Some(today);
                    schedule.next_due_date = today + Duration::days(cadence.days());
                    schedule.status = ScheduleStatus::Pending;
                    schedule.retry_count = 0;
                } else {
                    schedule.next_due_date = today + Duration::days(1);
                    schedule.status = ScheduleStatus::Failed;
                    schedule.retry_count += 1;
                }
                schedule.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn release_stale_processing(
            &self,
            stale_before: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            let mut inner = self.inner.lock().unwrap();
            let mut released = 0;
            for schedule in inner.schedules.values_mut() {
                if schedule.status == ScheduleStatus::Processing
                    && schedule.updated_at < stale_before
                {
                    schedule.status = ScheduleStatus::Pending;
                    schedule.updated_at = Utc::now();
                    released += 1;
                }
            }
            Ok(released)
        }

        async fn append_attempt(&self, attempt: NewAttempt) -> Result<(), StoreError> {
            self.inner.lock().unwrap().attempts.push(attempt);
            Ok(())
        }

        async fn latest_success_fingerprint(
            &self,
            email: &str,
            since: DateTime<Utc>,
        ) -> Result<Option<String>, StoreError> {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .attempts
                .iter()
                .filter(|attempt| {
                    attempt.faculty_email == email
                        && attempt.outcome == AttemptOutcome::Success
                        && attempt.attempted_at > since
                })
                .max_by_key(|attempt| attempt.attempted_at)
                .and_then(|attempt| attempt.content_fingerprint.clone()))
        }

        async fn schedule_for(&self, email: &str) -> Result<Option<ScheduleRecord>, StoreError> {
            Ok(self.inner.lock().unwrap().schedules.get(email).cloned())
        }

        async fn counters(&self, today: NaiveDate) -> Result<StatusCounters, StoreError> {
            let inner = self.inner.lock().unwrap();
            let mut counters = StatusCounters {
                total_faculty: inner.profiles.len() as i64,
                active_faculty: inner.profiles.values().filter(|p| p.active).count() as i64,
                ..StatusCounters::default()
            };
            for schedule in inner.schedules.values() {
                let selectable = matches!(
                    schedule.status,
                    ScheduleStatus::Pending | ScheduleStatus::Failed
                );
                let active = inner
                    .profiles
                    .get(&schedule.faculty_email)
                    .is_some_and(|p| p.active);
                if selectable && active && schedule.next_due_date <= today {
                    counters.due += 1;
                }
                if schedule.status == ScheduleStatus::Pending && schedule.next_due_date < today {
                    counters.overdue += 1;
                }
                match schedule.status {
                    ScheduleStatus::Failed => counters.failed_schedules += 1,
                    ScheduleStatus::Paused => counters.paused_schedules += 1,
                    _ => {}
                }
            }
            for attempt in &inner.attempts {
                if attempt.attempted_at.date_naive() != today {
                    continue;
                }
                counters.attempts_today += 1;
                counters.tokens_today += attempt.tokens_used;
                match attempt.outcome {
                    AttemptOutcome::Success => counters.sent_today += 1,
                    AttemptOutcome::Failed => counters.failed_today += 1,
                    AttemptOutcome::SkippedDuplicate => counters.skipped_today += 1,
                }
            }
            Ok(counters)
        }
    }
}
