//! Analysis windows and due-target enumeration, computed in the user's local
//! timezone.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunType {
    Daily,
    Weekly,
    Monthly,
}

impl RunType {
    pub const ALL: [RunType; 3] = [RunType::Daily, RunType::Weekly, RunType::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Daily => "daily",
            RunType::Weekly => "weekly",
            RunType::Monthly => "monthly",
        }
    }

    pub fn parse(value: &str) -> Option<RunType> {
        match value.trim().to_lowercase().as_str() {
            "daily" => Some(RunType::Daily),
            "weekly" => Some(RunType::Weekly),
            "monthly" => Some(RunType::Monthly),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisWindow {
    pub run_type: RunType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

impl AnalysisWindow {
    pub fn days(&self) -> i64 {
        ((self.period_end - self.period_start).num_days() + 1).max(1)
    }
}

/// Window ending at `target_day`: daily = that day, weekly = 7 days,
/// monthly = 30 days.
pub fn window_for(run_type: RunType, target_day: NaiveDate) -> AnalysisWindow {
    let period_start = match run_type {
        RunType::Daily => target_day,
        RunType::Weekly => target_day - Duration::days(6),
        RunType::Monthly => target_day - Duration::days(29),
    };
    AnalysisWindow {
        run_type,
        period_start,
        period_end: target_day,
    }
}

/// [start, end] UTC instants covering one local calendar date.
pub fn local_day_bounds(day: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_naive = day.and_time(NaiveTime::MIN);
    let end_naive = day.and_time(NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap());
    let start = match tz.from_local_datetime(&start_naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => tz.from_utc_datetime(&start_naive),
    };
    let end = match tz.from_local_datetime(&end_naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => tz.from_utc_datetime(&end_naive),
    };
    (start.with_timezone(&Utc), end.with_timezone(&Utc))
}

/// UTC instants covering a span of local dates.
pub fn local_window_bounds(window: &AnalysisWindow, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let (start, _) = local_day_bounds(window.period_start, tz);
    let (_, end) = local_day_bounds(window.period_end, tz);
    (start, end)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn monthly_due_day(year: i32, month: u32, preferred_day: u32) -> NaiveDate {
    let day = preferred_day.clamp(1, days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, 1).unwrap())
}

fn shift_month(year: i32, month: u32, delta_months: i32) -> (i32, u32) {
    let index = year * 12 + (month as i32 - 1) + delta_months;
    (index.div_euclid(12), (index.rem_euclid(12) + 1) as u32)
}

/// Due target days for a run type, oldest first.
///
/// Daily: the most recent `max_windows` days. Weekly: aligned to the
/// configured local weekday (0 = Monday). Monthly: aligned to the configured
/// day of month, clamped to month length.
pub fn candidate_due_targets(
    run_type: RunType,
    reference_day: NaiveDate,
    max_windows: u32,
    weekly_weekday: u32,
    monthly_day: u32,
) -> Vec<NaiveDate> {
    let max_windows = max_windows.clamp(1, 60) as i64;
    match run_type {
        RunType::Daily => (0..max_windows)
            .rev()
            .map(|offset| reference_day - Duration::days(offset))
            .collect(),
        RunType::Weekly => {
            let weekday = weekly_weekday.min(6) as i64;
            let ref_weekday = reference_day.weekday().num_days_from_monday() as i64;
            let latest_due = reference_day - Duration::days((ref_weekday - weekday).rem_euclid(7));
            let mut targets: Vec<NaiveDate> = (0..max_windows)
                .map(|offset| latest_due - Duration::days(7 * offset))
                .collect();
            targets.sort();
            targets.dedup();
            targets
        }
        RunType::Monthly => {
            let preferred = monthly_day.clamp(1, 31);
            let mut targets: Vec<NaiveDate> = Vec::new();
            for offset in 0..max_windows {
                let (year, month) =
                    shift_month(reference_day.year(), reference_day.month(), -(offset as i32));
                let due = monthly_due_day(year, month, preferred);
                if due <= reference_day {
                    targets.push(due);
                }
            }
            targets.sort();
            targets.dedup();
            targets
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn window_spans_match_run_type() {
        let daily = window_for(RunType::Daily, d("2026-02-20"));
        assert_eq!(daily.period_start, d("2026-02-20"));
        assert_eq!(daily.days(), 1);

        let weekly = window_for(RunType::Weekly, d("2026-02-20"));
        assert_eq!(weekly.period_start, d("2026-02-14"));
        assert_eq!(weekly.days(), 7);

        let monthly = window_for(RunType::Monthly, d("2026-02-20"));
        assert_eq!(monthly.period_start, d("2026-01-22"));
        assert_eq!(monthly.days(), 30);
    }

    #[test]
    fn daily_targets_are_the_recent_days_oldest_first() {
        let targets = candidate_due_targets(RunType::Daily, d("2026-02-20"), 3, 0, 1);
        assert_eq!(targets, vec![d("2026-02-18"), d("2026-02-19"), d("2026-02-20")]);
    }

    #[test]
    fn weekly_targets_align_to_weekday() {
        // 2026-02-20 is a Friday; weekday 0 = Monday → latest due 2026-02-16.
        let targets = candidate_due_targets(RunType::Weekly, d("2026-02-20"), 2, 0, 1);
        assert_eq!(targets, vec![d("2026-02-09"), d("2026-02-16")]);
    }

    #[test]
    fn monthly_targets_clamp_to_month_length() {
        // Preferred day 31 clamps to Feb 28 in a non-leap year.
        let targets = candidate_due_targets(RunType::Monthly, d("2025-03-05"), 2, 0, 31);
        assert_eq!(targets, vec![d("2025-02-28")]);
    }

    #[test]
    fn local_day_bounds_cover_the_whole_day() {
        let tz: Tz = "America/Edmonton".parse().unwrap();
        let (start, end) = local_day_bounds(d("2026-02-21"), tz);
        // Edmonton is UTC-7 in February.
        assert_eq!(start.to_rfc3339(), "2026-02-21T07:00:00+00:00");
        assert!(end > start);
        assert_eq!((end - start).num_seconds(), 86399);
    }
}
