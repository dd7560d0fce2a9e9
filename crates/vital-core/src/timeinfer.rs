//! Maps free-form date/time phrases to a UTC instant with a confidence tag.
//!
//! Date and time are inferred from separate cue sets, then combined; the
//! overall confidence is the weaker of the two. A time-of-day cue without an
//! explicit date pins the event to the current local day at medium
//! confidence. Early-morning messages (local hour < 4) with past-tense cues
//! are carried back to the previous local day.

use std::sync::LazyLock;

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use regex::Regex;

use crate::types::Confidence;

#[derive(Debug, Clone)]
pub struct TimeInference {
    pub event_utc: DateTime<Utc>,
    pub confidence: Confidence,
    pub reason: String,
    pub had_explicit_date: bool,
    pub had_explicit_time: bool,
}

static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap());
static SLASH_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})(?:/(\d{2,4}))?\b").unwrap());
static MONTH_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([a-z]{3,9})\s+(\d{1,2})(?:,\s*(\d{4}))?\b").unwrap());
static CLOCK_MERIDIEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([01]?\d|2[0-3]):([0-5]\d)\s*(am|pm)\b").unwrap());
static HOUR_MERIDIEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(1[0-2]|0?[1-9])\s*(am|pm)\b").unwrap());
static CLOCK_24H_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([01]?\d|2[0-3]):([0-5]\d)\b").unwrap());
static ANY_CLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([01]?\d|2[0-3]):([0-5]\d)\s*(am|pm)?\b").unwrap());

const PAST_MARKERS: &[&str] = &[
    "took", "had", "ate", "drank", "logged", "did", "went", "woke",
];
const SAME_DAY_MARKERS: &[&str] = &[
    "this morning",
    "this afternoon",
    "this evening",
    "tonight",
    "lunch",
    "dinner",
    "breakfast",
];

/// Cues that resolve the time of day to a canonical local slot. Their
/// presence also pins the date to the current local day.
const TIME_OF_DAY_CUES: &[&str] = &[
    "breakfast",
    "this morning",
    "morning",
    "lunch",
    "with lunch",
    "noon",
    "afternoon",
    "dinner",
    "with dinner",
    "evening",
    "this evening",
    "night",
    "tonight",
    "bedtime",
    "before bed",
];

fn month_number(name: &str) -> Option<u32> {
    match name {
        "jan" | "january" => Some(1),
        "feb" | "february" => Some(2),
        "mar" | "march" => Some(3),
        "apr" | "april" => Some(4),
        "may" => Some(5),
        "jun" | "june" => Some(6),
        "jul" | "july" => Some(7),
        "aug" | "august" => Some(8),
        "sep" | "sept" | "september" => Some(9),
        "oct" | "october" => Some(10),
        "nov" | "november" => Some(11),
        "dec" | "december" => Some(12),
        _ => None,
    }
}

/// Resolve a timezone name, falling back to UTC on anything unparseable.
pub fn resolve_tz(tz_name: Option<&str>) -> Tz {
    tz_name
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<Tz>().ok())
        .unwrap_or(chrono_tz::UTC)
}

fn local_reference(reference_utc: Option<DateTime<Utc>>, tz: Tz) -> DateTime<Tz> {
    reference_utc.unwrap_or_else(Utc::now).with_timezone(&tz)
}

fn has_any(text: &str, terms: &[&str]) -> bool {
    terms.iter().any(|t| text.contains(t))
}

pub fn has_explicit_clock(text: &str) -> bool {
    ANY_CLOCK_RE.is_match(text) || HOUR_MERIDIEM_RE.is_match(text)
}

pub fn has_explicit_date_token(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ISO_DATE_RE.is_match(&lowered)
        || SLASH_DATE_RE.is_match(&lowered)
        || MONTH_DATE_RE
            .captures_iter(&lowered)
            .any(|c| month_number(&c[1]).is_some())
}

fn parse_explicit_date(text: &str, ref_local: &DateTime<Tz>) -> Option<NaiveDate> {
    if let Some(c) = ISO_DATE_RE.captures(text) {
        let (y, m, d) = (c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?);
        if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
            return Some(date);
        }
    }

    if let Some(c) = SLASH_DATE_RE.captures(text) {
        let mm: u32 = c[1].parse().ok()?;
        let dd: u32 = c[2].parse().ok()?;
        let yyyy = match c.get(3) {
            Some(y) => {
                let raw: i32 = y.as_str().parse().ok()?;
                if raw < 100 {
                    raw + 2000
                } else {
                    raw
                }
            }
            None => ref_local.year(),
        };
        if let Some(date) = NaiveDate::from_ymd_opt(yyyy, mm, dd) {
            return Some(date);
        }
    }

    if let Some(c) = MONTH_DATE_RE.captures(text) {
        if let Some(month) = month_number(&c[1]) {
            let dd: u32 = c[2].parse().ok()?;
            let yyyy = match c.get(3) {
                Some(y) => y.as_str().parse().ok()?,
                None => ref_local.year(),
            };
            if let Some(date) = NaiveDate::from_ymd_opt(yyyy, month, dd) {
                return Some(date);
            }
        }
    }

    None
}

fn infer_local_date(text: &str, ref_local: &DateTime<Tz>) -> (NaiveDate, Confidence, bool) {
    if let Some(explicit) = parse_explicit_date(text, ref_local) {
        return (explicit, Confidence::High, true);
    }

    let today = ref_local.date_naive();
    if text.contains("yesterday") || text.contains("last night") {
        return (today - Duration::days(1), Confidence::Medium, false);
    }
    if text.contains("tomorrow") {
        return (today + Duration::days(1), Confidence::Medium, false);
    }

    // Early-morning past-tense disambiguation: "this morning / lunch / dinner"
    // right after midnight usually refers to the previous day.
    if ref_local.hour() < 4 {
        if has_any(text, SAME_DAY_MARKERS) && has_any(text, PAST_MARKERS) {
            return (today - Duration::days(1), Confidence::Medium, false);
        }
        // "Took my meds at 8:30pm" shortly after midnight refers to yesterday.
        if has_any(text, PAST_MARKERS) && has_explicit_clock(text) && text.contains("pm") {
            return (today - Duration::days(1), Confidence::Medium, false);
        }
    }

    if has_any(text, &["now", "right now", "just now"]) {
        return (today, Confidence::Medium, false);
    }

    // A time-of-day cue ("for breakfast", "this afternoon") pins the event to
    // the current local day, so the date is better than a bare guess. Checked
    // on the text rather than the chosen time branch so an added explicit
    // clock never lowers the combined confidence.
    if has_any(text, TIME_OF_DAY_CUES) {
        return (today, Confidence::Medium, false);
    }

    (today, Confidence::Low, false)
}

fn meridiem_hour(hour: u32, meridiem: &str) -> u32 {
    match (meridiem, hour) {
        ("pm", h) if h != 12 => h + 12,
        ("am", 12) => 0,
        (_, h) => h,
    }
}

pub fn parse_explicit_time(text: &str) -> Option<NaiveTime> {
    if let Some(c) = CLOCK_MERIDIEM_RE.captures(text) {
        let h: u32 = c[1].parse().ok()?;
        let m: u32 = c[2].parse().ok()?;
        return NaiveTime::from_hms_opt(meridiem_hour(h, &c[3]), m, 0);
    }
    if let Some(c) = HOUR_MERIDIEM_RE.captures(text) {
        let h: u32 = c[1].parse().ok()?;
        return NaiveTime::from_hms_opt(meridiem_hour(h, &c[2]), 0, 0);
    }
    if let Some(c) = CLOCK_24H_RE.captures(text) {
        let h: u32 = c[1].parse().ok()?;
        let m: u32 = c[2].parse().ok()?;
        return NaiveTime::from_hms_opt(h, m, 0);
    }
    None
}

fn infer_local_time(text: &str, ref_local: &DateTime<Tz>) -> (NaiveTime, Confidence, bool) {
    if let Some(explicit) = parse_explicit_time(text) {
        return (explicit, Confidence::High, true);
    }

    let now = ref_local.time();
    if has_any(text, &["now", "right now", "just now"]) {
        return (now, Confidence::High, false);
    }
    let canonical = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
    if has_any(text, &["breakfast", "this morning", "morning"]) {
        return (canonical(8, 0), Confidence::Medium, false);
    }
    if has_any(text, &["lunch", "with lunch", "noon"]) {
        return (canonical(12, 30), Confidence::Medium, false);
    }
    if text.contains("afternoon") {
        return (canonical(15, 0), Confidence::Medium, false);
    }
    if has_any(text, &["dinner", "with dinner", "evening", "this evening"]) {
        return (canonical(18, 30), Confidence::Medium, false);
    }
    if has_any(text, &["night", "tonight", "bedtime", "before bed", "last night"]) {
        return (canonical(22, 0), Confidence::Medium, false);
    }

    (now, Confidence::Low, false)
}

pub fn infer_event_datetime(
    text: &str,
    reference_utc: Option<DateTime<Utc>>,
    tz_name: Option<&str>,
) -> TimeInference {
    let normalized = text
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let tz = resolve_tz(tz_name);
    let ref_local = local_reference(reference_utc, tz);

    let (local_date, date_conf, had_explicit_date) = infer_local_date(&normalized, &ref_local);
    let (local_time, time_conf, had_explicit_time) = infer_local_time(&normalized, &ref_local);

    let naive = local_date.and_time(local_time);
    // Ambiguous/nonexistent local times (DST edges) resolve to the earliest
    // valid mapping, falling back to interpreting the naive value as UTC.
    let local_dt = match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => tz.from_utc_datetime(&naive),
    };

    TimeInference {
        event_utc: local_dt.with_timezone(&Utc),
        confidence: date_conf.combine(time_conf),
        reason: format!("date:{date_conf},time:{time_conf}"),
        had_explicit_date,
        had_explicit_time,
    }
}

/// Local-day bucket (YYYY-MM-DD) for the inferred event.
pub fn infer_target_date_iso(
    text: &str,
    reference_utc: Option<DateTime<Utc>>,
    tz_name: Option<&str>,
) -> String {
    let tz = resolve_tz(tz_name);
    let inferred = infer_event_datetime(text, reference_utc, tz_name);
    inferred
        .event_utc
        .with_timezone(&tz)
        .date_naive()
        .format("%Y-%m-%d")
        .to_string()
}

/// Resolve a stored time field that may be a full ISO timestamp, a local ISO
/// string, or a bare clock token, against the user's timezone and a reference.
pub fn resolve_time_field(
    value: &str,
    reference_utc: DateTime<Utc>,
    tz_name: Option<&str>,
) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    let tz = resolve_tz(tz_name);
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        if let chrono::LocalResult::Single(dt) = tz.from_local_datetime(&naive) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    // Bare clock token: resolve against the reference's local day.
    let time = parse_explicit_time(&trimmed.to_lowercase())?;
    let local_day = reference_utc.with_timezone(&tz).date_naive();
    match tz.from_local_datetime(&local_day.and_time(time)) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            Some(dt.with_timezone(&Utc))
        }
        chrono::LocalResult::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(iso: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(iso)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn breakfast_resolves_to_canonical_morning() {
        // 09:00 local in Edmonton (UTC-7 in Feb) = 16:00 UTC.
        let reference = at("2026-02-21T16:00:00Z");
        let out = infer_event_datetime(
            "I had oatmeal and coffee for breakfast",
            Some(reference),
            Some("America/Edmonton"),
        );
        // The meal cue pins both legs to medium; a confirmation notification
        // is only warranted below medium.
        assert_eq!(out.confidence, Confidence::Medium);
        assert_eq!(out.reason, "date:medium,time:medium");
        let local = out.event_utc.with_timezone(&resolve_tz(Some("America/Edmonton")));
        assert_eq!(local.hour(), 8);
        assert_eq!(local.date_naive().to_string(), "2026-02-21");
    }

    #[test]
    fn day_part_cue_pins_date_to_today_at_medium() {
        let reference = at("2026-02-21T23:00:00Z");
        let tz = Some("America/Edmonton");
        for (text, hour) in [
            ("went for a run this afternoon", 15),
            ("had a salad for lunch", 12),
            ("took magnesium before bed", 22),
        ] {
            let out = infer_event_datetime(text, Some(reference), tz);
            assert_eq!(out.confidence, Confidence::Medium, "text: {text}");
            let local = out.event_utc.with_timezone(&resolve_tz(tz));
            assert_eq!(local.hour(), hour, "text: {text}");
            assert_eq!(local.date_naive().to_string(), "2026-02-21");
        }
    }

    #[test]
    fn late_night_pm_clock_carries_back_a_day() {
        // 01:30 local on Feb 22.
        let reference = at("2026-02-22T08:30:00Z");
        let out = infer_event_datetime(
            "Took my blood pressure meds at 8:30pm",
            Some(reference),
            Some("America/Edmonton"),
        );
        let local = out.event_utc.with_timezone(&resolve_tz(Some("America/Edmonton")));
        assert_eq!(local.date_naive().to_string(), "2026-02-21");
        assert_eq!((local.hour(), local.minute()), (20, 30));
        assert_eq!(out.confidence, Confidence::Medium);
        assert!(out.had_explicit_time);
        assert!(!out.had_explicit_date);
    }

    #[test]
    fn vague_past_message_is_low_confidence() {
        let reference = at("2026-02-21T21:00:00Z");
        let out = infer_event_datetime(
            "I drank a protein shake earlier",
            Some(reference),
            Some("America/Edmonton"),
        );
        assert_eq!(out.confidence, Confidence::Low);
        assert_eq!(out.reason, "date:low,time:low");
    }

    #[test]
    fn explicit_date_and_clock_is_high() {
        let reference = at("2026-02-21T21:00:00Z");
        let out = infer_event_datetime(
            "logged lunch on 2026-02-19 at 12:15pm",
            Some(reference),
            Some("UTC"),
        );
        assert_eq!(out.confidence, Confidence::High);
        assert!(out.had_explicit_date);
        assert!(out.had_explicit_time);
        assert_eq!(out.event_utc.to_rfc3339(), "2026-02-19T12:15:00+00:00");
    }

    #[test]
    fn adding_clock_token_never_lowers_confidence() {
        let reference = at("2026-02-21T21:00:00Z");
        let tz = Some("America/Edmonton");
        let cases = [
            "I drank a protein shake earlier",
            "I had eggs for breakfast",
            "took my meds yesterday",
        ];
        for base in cases {
            let without = infer_event_datetime(base, Some(reference), tz);
            let with = infer_event_datetime(&format!("{base} at 9:15am"), Some(reference), tz);
            assert!(
                (with.confidence as u8) >= (without.confidence as u8),
                "clock token lowered confidence for: {base}"
            );
        }
    }

    #[test]
    fn just_now_is_high_time_confidence() {
        let reference = at("2026-02-21T21:00:00Z");
        let out = infer_event_datetime("bp 128/84 hr 72 just now", Some(reference), Some("UTC"));
        // date medium + time high combine to medium.
        assert_eq!(out.confidence, Confidence::Medium);
        assert_eq!(out.event_utc, reference);
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(resolve_tz(Some("Mars/Olympus")), chrono_tz::UTC);
        assert_eq!(resolve_tz(None), chrono_tz::UTC);
        assert_eq!(resolve_tz(Some("  ")), chrono_tz::UTC);
    }

    #[test]
    fn resolve_time_field_handles_all_shapes() {
        let reference = at("2026-02-21T16:00:00Z");
        let tz = Some("America/Edmonton");

        let iso = resolve_time_field("2026-02-20T10:00:00Z", reference, tz).unwrap();
        assert_eq!(iso.to_rfc3339(), "2026-02-20T10:00:00+00:00");

        let clock = resolve_time_field("8:30am", reference, tz).unwrap();
        let local = clock.with_timezone(&resolve_tz(tz));
        assert_eq!((local.hour(), local.minute()), (8, 30));
        assert_eq!(local.date_naive().to_string(), "2026-02-21");

        assert!(resolve_time_field("", reference, tz).is_none());
    }
}
