use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};

/// How often a faculty member wants to receive a funding digest.
///
/// The string forms are persisted and must stay bit-exact across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Weekly,
    Biweekly,
    Monthly,
    /// A single digest; an operator is expected to deactivate the profile
    /// after the first successful send.
    OneResponse,
    /// No external trigger exists yet, so this falls back to a long interval.
    OnHighConfidence,
}

impl Cadence {
    pub const ALL: [Cadence; 5] = [
        Cadence::Weekly,
        Cadence::Biweekly,
        Cadence::Monthly,
        Cadence::OneResponse,
        Cadence::OnHighConfidence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Weekly => "weekly",
            Cadence::Biweekly => "biweekly",
            Cadence::Monthly => "monthly",
            Cadence::OneResponse => "one response",
            Cadence::OnHighConfidence => "when high-confidence matches are found",
        }
    }

    /// Days added to today when a schedule advances after a successful send.
    pub fn days(&self) -> i64 {
        match self {
            Cadence::Weekly => 7,
            Cadence::Biweekly => 14,
            Cadence::Monthly => 30,
            Cadence::OneResponse => 7,
            Cadence::OnHighConfidence => 14,
        }
    }

    /// Normalize free-form roster input to a recognized cadence.
    ///
    /// Longer tokens are checked first: "biweekly" contains "weekly", so the
    /// order of checks matters. Anything unrecognized falls back to biweekly.
    pub fn normalize(raw: &str) -> Cadence {
        let value = raw.trim().to_lowercase();
        if value.is_empty() {
            return Cadence::Biweekly;
        }

        if value.contains("biweekly") || value.contains("bi-weekly") || value.contains("bi weekly")
        {
            Cadence::Biweekly
        } else if value.contains("one response") || value.contains("one-response") {
            Cadence::OneResponse
        } else if value.contains("high-confidence") || value.contains("high confidence") {
            Cadence::OnHighConfidence
        } else if value.contains("monthly") {
            Cadence::Monthly
        } else if value.contains("weekly") {
            Cadence::Weekly
        } else {
            tracing::warn!(cadence = %raw, "unrecognized cadence, defaulting to biweekly");
            Cadence::Biweekly
        }
    }
}

impl FromStr for Cadence {
    type Err = String;

    /// Strict parse of a persisted cadence string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cadence::ALL
            .into_iter()
            .find(|cadence| cadence.as_str() == s)
            .ok_or_else(|| format!("unknown cadence: {s}"))
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a schedule row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Paused,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Processing => "processing",
            ScheduleStatus::Sent => "sent",
            ScheduleStatus::Failed => "failed",
            ScheduleStatus::Paused => "paused",
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScheduleStatus::Pending),
            "processing" => Ok(ScheduleStatus::Processing),
            "sent" => Ok(ScheduleStatus::Sent),
            "failed" => Ok(ScheduleStatus::Failed),
            "paused" => Ok(ScheduleStatus::Paused),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal classification of one ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failed,
    SkippedDuplicate,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::SkippedDuplicate => "skipped_duplicate",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AttemptOutcome::Success),
            "failed" => Ok(AttemptOutcome::Failed),
            "skipped_duplicate" => Ok(AttemptOutcome::SkippedDuplicate),
            other => Err(format!("unknown attempt outcome: {other}")),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A faculty profile as upserted by roster sync. Read-only to the
/// scheduling core; `email` is the join key everywhere.
#[derive(Debug, Clone)]
pub struct FacultyProfile {
    pub email: String,
    pub research_area: String,
    pub keywords: String,
    pub eligibility_constraints: String,
    pub early_career: String,
    pub funding_types: String,
    pub award_size: String,
    pub submission_timeline: String,
    pub preferred_funding_sources: String,
    pub additional_info: String,
    pub cadence: Cadence,
    pub active: bool,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Per-faculty scheduling state.
#[derive(Debug, Clone)]
pub struct ScheduleRecord {
    pub faculty_email: String,
    pub last_sent_date: Option<NaiveDate>,
    pub next_due_date: NaiveDate,
    pub cadence: Cadence,
    pub status: ScheduleStatus,
    pub retry_count: i32,
    pub updated_at: DateTime<Utc>,
}

/// A due schedule joined to its active profile, as returned by
/// `ScheduleStore::select_due`.
#[derive(Debug, Clone)]
pub struct DueFaculty {
    pub profile: FacultyProfile,
    pub next_due_date: NaiveDate,
    pub retry_count: i32,
}

/// One ledger row to append. The ledger is append-only; rows are never
/// mutated after insert.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub faculty_email: String,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub content_fingerprint: Option<String>,
    pub error_detail: Option<String>,
    pub markdown_path: Option<String>,
    pub html_path: Option<String>,
    pub faculty_folder: Option<String>,
    pub elapsed_seconds: f64,
    pub tokens_used: i64,
}

impl NewAttempt {
    pub fn new(email: &str, outcome: AttemptOutcome) -> Self {
        Self {
            faculty_email: email.to_string(),
            attempted_at: Utc::now(),
            outcome,
            content_fingerprint: None,
            error_detail: None,
            markdown_path: None,
            html_path: None,
            faculty_folder: None,
            elapsed_seconds: 0.0,
            tokens_used: 0,
        }
    }
}

/// Aggregate counters for one dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub processed: u64,
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {}, sent {}, failed {}, skipped {}",
            self.processed, self.sent, self.failed, self.skipped
        )
    }
}

/// Counters from one roster sync pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub processed: u64,
    pub new: u64,
    pub updated: u64,
    pub errors: u64,
}

impl fmt::Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {}, new {}, updated {}, errors {}",
            self.processed, self.new, self.updated, self.errors
        )
    }
}

/// Aggregate schedule and ledger counters for the status/report surfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCounters {
    pub total_faculty: i64,
    pub active_faculty: i64,
    pub due: i64,
    pub overdue: i64,
    pub failed_schedules: i64,
    pub paused_schedules: i64,
    pub attempts_today: i64,
    pub sent_today: i64,
    pub failed_today: i64,
    pub skipped_today: i64,
    pub tokens_today: i64,
}
