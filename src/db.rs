use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{
    Cadence, DueFaculty, FacultyProfile, NewAttempt, ScheduleRecord, ScheduleStatus,
    StatusCounters,
};
use crate::store::{first_due_date, ScheduleStore, StoreError};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed schedule store. Every mutation is a single-row statement,
/// so concurrent workers touching different emails never block each other.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_field<T: std::str::FromStr>(
    field: &'static str,
    value: String,
) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::CorruptField { field, value })
}

fn profile_from_row(row: &PgRow) -> Result<FacultyProfile, StoreError> {
    Ok(FacultyProfile {
        email: row.try_get("email")?,
        research_area: row.try_get("research_area")?,
        keywords: row.try_get("keywords")?,
        eligibility_constraints: row.try_get("eligibility_constraints")?,
        early_career: row.try_get("early_career")?,
        funding_types: row.try_get("funding_types")?,
        award_size: row.try_get("award_size")?,
        submission_timeline: row.try_get("submission_timeline")?,
        preferred_funding_sources: row.try_get("preferred_funding_sources")?,
        additional_info: row.try_get("additional_info")?,
        cadence: parse_field("cadence", row.try_get("cadence")?)?,
        active: row.try_get("active")?,
        submitted_at: row.try_get("submitted_at")?,
    })
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn initialize(
        &self,
        email: &str,
        cadence: Cadence,
        today: NaiveDate,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_schedule (faculty_email, next_due_date, cadence, status)
            VALUES ($1, $2, $3, 'pending')
            ON CONFLICT (faculty_email) DO NOTHING
            "#,
        )
        .bind(email)
        .bind(first_due_date(today))
        .bind(cadence.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn select_due(
        &self,
        as_of: NaiveDate,
        limit: Option<i64>,
    ) -> Result<Vec<DueFaculty>, StoreError> {
        let mut query = String::from(
            "SELECT f.email, f.research_area, f.keywords, f.eligibility_constraints, \
             f.early_career, f.funding_types, f.award_size, f.submission_timeline, \
             f.preferred_funding_sources, f.additional_info, f.cadence, f.active, \
             f.submitted_at, s.next_due_date, s.retry_count \
             FROM email_schedule s \
             JOIN faculty_profiles f ON f.email = s.faculty_email \
             WHERE s.next_due_date <= $1 AND f.active = TRUE \
             AND s.status IN ('pending', 'failed') \
             ORDER BY s.next_due_date ASC, s.retry_count ASC",
        );
        if limit.is_some() {
            query.push_str(" LIMIT $2");
        }

        let mut rows = sqlx::query(&query).bind(as_of);
        if let Some(limit) = limit {
            rows = rows.bind(limit);
        }

        let records = rows.fetch_all(&self.pool).await?;
        let mut due = Vec::with_capacity(records.len());
        for row in records {
            due.push(DueFaculty {
                profile: profile_from_row(&row)?,
                next_due_date: row.try_get("next_due_date")?,
                retry_count: row.try_get("retry_count")?,
            });
        }
        Ok(due)
    }

    async fn mark_status(&self, email: &str, status: ScheduleStatus) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE email_schedule SET status = $1, updated_at = now() WHERE faculty_email = $2",
        )
        .bind(status.as_str())
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn advance(
        &self,
        email: &str,
        cadence: Cadence,
        success: bool,
        today: NaiveDate,
    ) -> Result<(), StoreError> {
        if success {
            sqlx::query(
                r#"
                UPDATE email_schedule
                SET last_sent_date = $1, next_due_date = $2, status = 'pending',
                    retry_count = 0, updated_at = now()
                WHERE faculty_email = $3
                "#,
            )
            .bind(today)
            .bind(today + Duration::days(cadence.days()))
            .bind(email)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE email_schedule
                SET next_due_date = $1, status = 'failed',
                    retry_count = retry_count + 1, updated_at = now()
                WHERE faculty_email = $2
                "#,
            )
            .bind(today + Duration::days(1))
            .bind(email)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn release_stale_processing(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE email_schedule
            SET status = 'pending', updated_at = now()
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append_attempt(&self, attempt: NewAttempt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO email_history
            (id, faculty_email, attempted_at, outcome, content_fingerprint, error_detail,
             markdown_path, html_path, faculty_folder, elapsed_seconds, tokens_used)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&attempt.faculty_email)
        .bind(attempt.attempted_at)
        .bind(attempt.outcome.as_str())
        .bind(&attempt.content_fingerprint)
        .bind(&attempt.error_detail)
        .bind(&attempt.markdown_path)
        .bind(&attempt.html_path)
        .bind(&attempt.faculty_folder)
        .bind(attempt.elapsed_seconds)
        .bind(attempt.tokens_used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_success_fingerprint(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT content_fingerprint FROM email_history
            WHERE faculty_email = $1 AND outcome = 'success' AND attempted_at > $2
            ORDER BY attempted_at DESC
            LIMIT 1
            "#,
        )
        .bind(email)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("content_fingerprint")?),
            None => Ok(None),
        }
    }

    async fn schedule_for(&self, email: &str) -> Result<Option<ScheduleRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT faculty_email, last_sent_date, next_due_date, cadence, status,
                   retry_count, updated_at
            FROM email_schedule
            WHERE faculty_email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ScheduleRecord {
            faculty_email: row.try_get("faculty_email")?,
            last_sent_date: row.try_get("last_sent_date")?,
            next_due_date: row.try_get("next_due_date")?,
            cadence: parse_field("cadence", row.try_get("cadence")?)?,
            status: parse_field("status", row.try_get("status")?)?,
            retry_count: row.try_get("retry_count")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn counters(&self, today: NaiveDate) -> Result<StatusCounters, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM faculty_profiles) AS total_faculty,
                (SELECT COUNT(*) FROM faculty_profiles WHERE active) AS active_faculty,
                (SELECT COUNT(*) FROM email_schedule s
                 JOIN faculty_profiles f ON f.email = s.faculty_email
                 WHERE s.next_due_date <= $1 AND f.active
                 AND s.status IN ('pending', 'failed')) AS due,
                (SELECT COUNT(*) FROM email_schedule
                 WHERE next_due_date < $1 AND status = 'pending') AS overdue,
                (SELECT COUNT(*) FROM email_schedule WHERE status = 'failed')
                    AS failed_schedules,
                (SELECT COUNT(*) FROM email_schedule WHERE status = 'paused')
                    AS paused_schedules,
                (SELECT COUNT(*) FROM email_history WHERE attempted_at::date = $1)
                    AS attempts_today,
                (SELECT COUNT(*) FROM email_history
                 WHERE attempted_at::date = $1 AND outcome = 'success') AS sent_today,
                (SELECT COUNT(*) FROM email_history
                 WHERE attempted_at::date = $1 AND outcome = 'failed') AS failed_today,
                (SELECT COUNT(*) FROM email_history
                 WHERE attempted_at::date = $1 AND outcome = 'skipped_duplicate')
                    AS skipped_today,
                (SELECT COALESCE(SUM(tokens_used), 0)::bigint FROM email_history
                 WHERE attempted_at::date = $1) AS tokens_today
            "#,
        )
        .bind(today)
        .fetch_one(&self.pool)
        .await?;

        Ok(StatusCounters {
            total_faculty: row.try_get("total_faculty")?,
            active_faculty: row.try_get("active_faculty")?,
            due: row.try_get("due")?,
            overdue: row.try_get("overdue")?,
            failed_schedules: row.try_get("failed_schedules")?,
            paused_schedules: row.try_get("paused_schedules")?,
            attempts_today: row.try_get("attempts_today")?,
            sent_today: row.try_get("sent_today")?,
            failed_today: row.try_get("failed_today")?,
            skipped_today: row.try_get("skipped_today")?,
            tokens_today: row.try_get("tokens_today")?,
        })
    }
}

/// Insert or update one faculty profile. Returns whether the email was new.
pub async fn upsert_profile(pool: &PgPool, profile: &FacultyProfile) -> anyhow::Result<bool> {
    let existing = sqlx::query("SELECT id FROM faculty_profiles WHERE email = $1")
        .bind(&profile.email)
        .fetch_optional(pool)
        .await?;
    let is_new = existing.is_none();

    sqlx::query(
        r#"
        INSERT INTO faculty_profiles
        (id, email, research_area, keywords, eligibility_constraints, early_career,
         funding_types, award_size, submission_timeline, preferred_funding_sources,
         additional_info, cadence, active, submitted_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, TRUE, $13)
        ON CONFLICT (email) DO UPDATE
        SET research_area = EXCLUDED.research_area,
            keywords = EXCLUDED.keywords,
            eligibility_constraints = EXCLUDED.eligibility_constraints,
            early_career = EXCLUDED.early_career,
            funding_types = EXCLUDED.funding_types,
            award_size = EXCLUDED.award_size,
            submission_timeline = EXCLUDED.submission_timeline,
            preferred_funding_sources = EXCLUDED.preferred_funding_sources,
            additional_info = EXCLUDED.additional_info,
            cadence = EXCLUDED.cadence,
            submitted_at = EXCLUDED.submitted_at,
            updated_at = now()
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&profile.email)
    .bind(&profile.research_area)
    .bind(&profile.keywords)
    .bind(&profile.eligibility_constraints)
    .bind(&profile.early_career)
    .bind(&profile.funding_types)
    .bind(&profile.award_size)
    .bind(&profile.submission_timeline)
    .bind(&profile.preferred_funding_sources)
    .bind(&profile.additional_info)
    .bind(profile.cadence.as_str())
    .bind(profile.submitted_at)
    .execute(pool)
    .await?;

    Ok(is_new)
}

pub async fn fetch_profile(pool: &PgPool, email: &str) -> anyhow::Result<Option<FacultyProfile>> {
    let row = sqlx::query(
        r#"
        SELECT email, research_area, keywords, eligibility_constraints, early_career,
               funding_types, award_size, submission_timeline, preferred_funding_sources,
               additional_info, cadence, active, submitted_at
        FROM faculty_profiles
        WHERE email = $1
        "#,
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(profile_from_row(&row)?)),
        None => Ok(None),
    }
}

/// Activate or deactivate a faculty member. Deactivation pauses the schedule
/// rather than deleting it; reactivation returns it to pending.
pub async fn set_active(pool: &PgPool, email: &str, active: bool) -> anyhow::Result<bool> {
    let result = sqlx::query(
        "UPDATE faculty_profiles SET active = $1, updated_at = now() WHERE email = $2",
    )
    .bind(active)
    .bind(email)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    let status = if active {
        ScheduleStatus::Pending
    } else {
        ScheduleStatus::Paused
    };
    sqlx::query(
        "UPDATE email_schedule SET status = $1, updated_at = now() WHERE faculty_email = $2",
    )
    .bind(status.as_str())
    .bind(email)
    .execute(pool)
    .await?;

    Ok(true)
}

/// One line of the `list` admin surface.
#[derive(Debug)]
pub struct FacultyOverview {
    pub email: String,
    pub cadence: String,
    pub active: bool,
    pub next_due_date: Option<NaiveDate>,
    pub schedule_status: Option<String>,
    pub total_attempts: i64,
    pub successful_sends: i64,
}

pub async fn list_faculty(pool: &PgPool) -> anyhow::Result<Vec<FacultyOverview>> {
    let rows = sqlx::query(
        r#"
        SELECT f.email, f.cadence, f.active, s.next_due_date, s.status,
               (SELECT COUNT(*) FROM email_history h
                WHERE h.faculty_email = f.email) AS total_attempts,
               (SELECT COUNT(*) FROM email_history h
                WHERE h.faculty_email = f.email AND h.outcome = 'success')
                   AS successful_sends
        FROM faculty_profiles f
        LEFT JOIN email_schedule s ON s.faculty_email = f.email
        ORDER BY f.email
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut overviews = Vec::with_capacity(rows.len());
    for row in rows {
        overviews.push(FacultyOverview {
            email: row.try_get("email")?,
            cadence: row.try_get("cadence")?,
            active: row.try_get("active")?,
            next_due_date: row.try_get("next_due_date")?,
            schedule_status: row.try_get("status")?,
            total_attempts: row.try_get("total_attempts")?,
            successful_sends: row.try_get("successful_sends")?,
        });
    }
    Ok(overviews)
}

/// Load a few realistic rows for local development.
pub async fn seed(pool: &PgPool, today: NaiveDate) -> anyhow::Result<()> {
    let faculty = vec![
        (
            "avery.lee@mtu.edu",
            "Resilient distributed storage",
            "erasure coding, consensus, edge storage",
            Cadence::Weekly,
        ),
        (
            "jules.moreno@mtu.edu",
            "Human-robot interaction for manufacturing",
            "cobots, safety, teleoperation",
            Cadence::Biweekly,
        ),
        (
            "kiara.patel@mtu.edu",
            "Computational epidemiology",
            "disease modeling, surveillance, wastewater",
            Cadence::Monthly,
        ),
    ];

    let store = PgStore::new(pool.clone());
    for (email, research_area, keywords, cadence) in faculty {
        let profile = FacultyProfile {
            email: email.to_string(),
            research_area: research_area.to_string(),
            keywords: keywords.to_string(),
            eligibility_constraints: "No constraints".to_string(),
            early_career: "No".to_string(),
            funding_types: "General research grants".to_string(),
            award_size: "Any size".to_string(),
            submission_timeline: "Flexible timeline".to_string(),
            preferred_funding_sources: "Federal agencies (NSF, NIH, DOE)".to_string(),
            additional_info: String::new(),
            cadence,
            active: true,
            submitted_at: Some(Utc::now()),
        };
        upsert_profile(pool, &profile).await?;
        store.initialize(email, cadence, today).await?;
    }

    Ok(())
}
