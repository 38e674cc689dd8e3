use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::{DueFaculty, StatusCounters};

/// Build the markdown daily report from the store's aggregate counters and
/// the current due-set.
pub fn build_daily_report(
    date: NaiveDate,
    counters: &StatusCounters,
    due: &[DueFaculty],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Funding Digest Daily Report");
    let _ = writeln!(output, "Generated for {date}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Delivery Activity");
    let _ = writeln!(output, "- Attempts today: {}", counters.attempts_today);
    let _ = writeln!(output, "- Sent: {}", counters.sent_today);
    let _ = writeln!(output, "- Failed: {}", counters.failed_today);
    let _ = writeln!(output, "- Skipped as duplicate: {}", counters.skipped_today);
    let _ = writeln!(output, "- Generation tokens used: {}", counters.tokens_today);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Schedule Health");
    let _ = writeln!(output, "- Due: {}", counters.due);
    let _ = writeln!(output, "- Overdue: {}", counters.overdue);
    let _ = writeln!(output, "- Failed schedules: {}", counters.failed_schedules);
    let _ = writeln!(output, "- Paused schedules: {}", counters.paused_schedules);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Faculty");
    let _ = writeln!(
        output,
        "- {} total, {} active",
        counters.total_faculty, counters.active_faculty
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Due Faculty");
    if due.is_empty() {
        let _ = writeln!(output, "No faculty due for digests.");
    } else {
        for record in due.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}) due {} with {} retries",
                record.profile.email,
                record.profile.cadence,
                record.next_due_date,
                record.retry_count
            );
        }
        if due.len() > 10 {
            let _ = writeln!(output, "- ... and {} more", due.len() - 10);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::{Cadence, FacultyProfile};

    fn counters() -> StatusCounters {
        StatusCounters {
            total_faculty: 12,
            active_faculty: 10,
            due: 3,
            overdue: 1,
            failed_schedules: 2,
            paused_schedules: 1,
            attempts_today: 6,
            sent_today: 4,
            failed_today: 1,
            skipped_today: 1,
            tokens_today: 5400,
        }
    }

    fn due(email: &str, due_date: NaiveDate, retries: i32) -> DueFaculty {
        DueFaculty {
            profile: FacultyProfile {
                email: email.to_string(),
                research_area: String::new(),
                keywords: String::new(),
                eligibility_constraints: String::new(),
                early_career: String::new(),
                funding_types: String::new(),
                award_size: String::new(),
                submission_timeline: String::new(),
                preferred_funding_sources: String::new(),
                additional_info: String::new(),
                cadence: Cadence::Weekly,
                active: true,
                submitted_at: None,
            },
            next_due_date: due_date,
            retry_count: retries,
        }
    }

    #[test]
    fn report_covers_activity_schedules_and_due_faculty() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let report = build_daily_report(
            date,
            &counters(),
            &[due("a@x.edu", date, 0), due("b@x.edu", date, 2)],
        );

        assert!(report.contains("# Funding Digest Daily Report"));
        assert!(report.contains("Generated for 2026-03-14"));
        assert!(report.contains("- Sent: 4"));
        assert!(report.contains("- Skipped as duplicate: 1"));
        assert!(report.contains("- Overdue: 1"));
        assert!(report.contains("- 12 total, 10 active"));
        assert!(report.contains("- a@x.edu (weekly) due 2026-03-14 with 0 retries"));
        assert!(report.contains("- b@x.edu (weekly) due 2026-03-14 with 2 retries"));
    }

    #[test]
    fn report_notes_an_empty_due_set() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let report = build_daily_report(date, &counters(), &[]);
        assert!(report.contains("No faculty due for digests."));
    }

    #[test]
    fn report_truncates_long_due_lists() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let many: Vec<DueFaculty> = (0..13)
            .map(|i| due(&format!("f{i}@x.edu"), date - Duration::days(i), 0))
            .collect();
        let report = build_daily_report(date, &counters(), &many);
        assert!(report.contains("- ... and 3 more"));
    }
}
