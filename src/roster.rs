use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use sqlx::PgPool;

use crate::db;
use crate::models::{Cadence, FacultyProfile, SyncStats};
use crate::store::ScheduleStore;

/// One row of the exported roster CSV. The roster format itself is owned by
/// the intake form; this adapter only validates and normalizes.
#[derive(Debug, Deserialize)]
pub struct RosterRow {
    pub email: String,
    #[serde(default)]
    pub research_area: String,
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub eligibility_constraints: String,
    #[serde(default)]
    pub early_career: String,
    #[serde(default)]
    pub funding_types: String,
    #[serde(default)]
    pub award_size: String,
    #[serde(default)]
    pub submission_timeline: String,
    #[serde(default)]
    pub preferred_funding_sources: String,
    #[serde(default)]
    pub cadence: String,
    #[serde(default)]
    pub additional_info: String,
    #[serde(default)]
    pub submitted_at: String,
}

/// Validate and normalize a roster row. Rows without a plausible email are
/// dropped.
pub fn profile_from_row(row: RosterRow) -> Option<FacultyProfile> {
    let email = row.email.trim().to_lowercase();
    if !email.contains('@') {
        return None;
    }

    Some(FacultyProfile {
        email,
        research_area: row.research_area.trim().to_string(),
        keywords: row.keywords.trim().to_string(),
        eligibility_constraints: row.eligibility_constraints.trim().to_string(),
        early_career: row.early_career.trim().to_string(),
        funding_types: row.funding_types.trim().to_string(),
        award_size: row.award_size.trim().to_string(),
        submission_timeline: row.submission_timeline.trim().to_string(),
        preferred_funding_sources: row.preferred_funding_sources.trim().to_string(),
        additional_info: row.additional_info.trim().to_string(),
        cadence: Cadence::normalize(&row.cadence),
        active: true,
        submitted_at: parse_submitted_at(&row.submitted_at),
    })
}

/// Parse the intake form timestamp from the handful of formats the export
/// produces.
fn parse_submitted_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    for format in ["%m/%d/%Y %H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&datetime));
        }
    }
    for format in ["%m/%d/%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
        }
    }

    tracing::warn!(timestamp = raw, "could not parse roster timestamp");
    None
}

/// Upsert faculty profiles from a roster CSV and seed a schedule for each
/// newly seen email. Row-level problems are counted, logged, and skipped;
/// only file-level failures abort the sync.
pub async fn sync(
    pool: &PgPool,
    store: &dyn ScheduleStore,
    csv_path: &Path,
    today: NaiveDate,
) -> anyhow::Result<SyncStats> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut stats = SyncStats::default();

    for (index, result) in reader.deserialize::<RosterRow>().enumerate() {
        let row_number = index + 2;
        let row = match result {
            Ok(row) => row,
            Err(error) => {
                stats.errors += 1;
                tracing::error!(row = row_number, %error, "failed to parse roster row");
                continue;
            }
        };

        let Some(profile) = profile_from_row(row) else {
            tracing::warn!(row = row_number, "skipping roster row with invalid email");
            continue;
        };

        match db::upsert_profile(pool, &profile).await {
            Ok(is_new) => {
                if is_new {
                    store
                        .initialize(&profile.email, profile.cadence, today)
                        .await?;
                    stats.new += 1;
                    tracing::info!(email = %profile.email, cadence = %profile.cadence, "new faculty added");
                } else {
                    stats.updated += 1;
                    tracing::debug!(email = %profile.email, "faculty profile updated");
                }
                stats.processed += 1;
            }
            Err(error) => {
                stats.errors += 1;
                tracing::error!(email = %profile.email, %error, "failed to upsert faculty profile");
            }
        }
    }

    tracing::info!(%stats, "roster sync completed");
    Ok(stats)
}
