//! Deterministic metric rollups over one analysis window.

use chrono_tz::Tz;
use rusqlite::Connection;
use serde_json::{json, Value};
use vital_core::items::parse_structured_list;
use vital_store::types::UserSettings;
use vital_store::{checklist, frameworks, logs};

use crate::error::Result;
use crate::windows::{local_window_bounds, AnalysisWindow};

pub struct PeriodMetrics {
    pub metrics: Value,
    pub missing_domains: Vec<String>,
    pub risk_flags: Vec<String>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// First-to-last delta; None below two points.
fn slope(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        None
    } else {
        Some(((values[values.len() - 1] - values[0]) * 10000.0).round() / 10000.0)
    }
}

pub fn collect_period_metrics(
    conn: &Connection,
    user_id: i64,
    settings: &UserSettings,
    window: &AnalysisWindow,
    tz: Tz,
) -> Result<PeriodMetrics> {
    let (start, end) = local_window_bounds(window, tz);
    let days = window.days() as f64;

    let foods = logs::food_logs_between(conn, user_id, start, end)?;
    let hydration = logs::hydration_logs_between(conn, user_id, start, end)?;
    let vitals = logs::vitals_logs_between(conn, user_id, start, end)?;
    let exercise = logs::exercise_logs_between(conn, user_id, start, end)?;
    let fasting = logs::fasting_logs_started_between(conn, user_id, start, end)?;
    let sleep = logs::sleep_logs_overlapping(conn, user_id, start, end)?;
    let supp_logs = logs::supplement_logs_between(conn, user_id, start, end)?;
    let checklist_items = checklist::items_for_date_range(
        conn,
        user_id,
        &window.period_start.format("%Y-%m-%d").to_string(),
        &window.period_end.format("%Y-%m-%d").to_string(),
    )?;
    let active = frameworks::active_frameworks(conn, user_id)?;

    let meds = parse_structured_list(settings.medications.as_deref());
    let supps = parse_structured_list(settings.supplements.as_deref());
    let expected_med = meds.len() as i64 * window.days();
    let expected_supp = supps.len() as i64 * window.days();
    let done_med = checklist_items
        .iter()
        .filter(|i| i.item_type == "medication" && i.completed)
        .count() as i64;
    let done_supp = checklist_items
        .iter()
        .filter(|i| i.item_type == "supplement" && i.completed)
        .count() as i64;

    let calories_total: f64 = foods.iter().filter_map(|f| f.calories).sum();
    let sodium_total: f64 = foods.iter().filter_map(|f| f.sodium_mg).sum();

    let weight_points: Vec<f64> = vitals.iter().filter_map(|v| v.weight_kg).collect();
    let bp_sys_points: Vec<f64> = vitals
        .iter()
        .filter_map(|v| v.bp_systolic.map(|x| x as f64))
        .collect();
    let bp_dia_points: Vec<f64> = vitals
        .iter()
        .filter_map(|v| v.bp_diastolic.map(|x| x as f64))
        .collect();
    let hr_points: Vec<f64> = vitals
        .iter()
        .filter_map(|v| v.heart_rate.map(|x| x as f64))
        .collect();

    let sleep_durations: Vec<f64> = sleep
        .iter()
        .filter_map(|s| s.duration_minutes.map(|m| m as f64))
        .collect();
    // Daily windows report the longest sleep inside the day; longer windows
    // report the mean.
    let sleep_duration_metric = if window.days() == 1 {
        sleep_durations.iter().cloned().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        })
    } else {
        mean(&sleep_durations)
    };

    let fasting_durations: Vec<f64> = fasting
        .iter()
        .filter_map(|f| f.duration_minutes.map(|m| m as f64))
        .collect();

    let med_adherence = (expected_med > 0).then(|| {
        ((done_med as f64 / expected_med as f64) * 10000.0).round() / 10000.0
    });
    let supp_adherence = (expected_supp > 0).then(|| {
        ((done_supp as f64 / expected_supp as f64) * 10000.0).round() / 10000.0
    });

    let avg_systolic = mean(&bp_sys_points).map(round2);
    let avg_diastolic = mean(&bp_dia_points).map(round2);

    let metrics = json!({
        "window": {
            "run_type": window.run_type.as_str(),
            "period_start": window.period_start.format("%Y-%m-%d").to_string(),
            "period_end": window.period_end.format("%Y-%m-%d").to_string(),
            "days": window.days(),
            "timezone": tz.name(),
        },
        "nutrition": {
            "meal_count": foods.len(),
            "calories_total": round2(calories_total),
            "protein_g_total": round2(foods.iter().filter_map(|f| f.protein_g).sum()),
            "carbs_g_total": round2(foods.iter().filter_map(|f| f.carbs_g).sum()),
            "fat_g_total": round2(foods.iter().filter_map(|f| f.fat_g).sum()),
            "fiber_g_total": round2(foods.iter().filter_map(|f| f.fiber_g).sum()),
            "sodium_mg_total": round2(sodium_total),
            "calories_daily_avg": round2(calories_total / days),
        },
        "hydration": {
            "total_ml": round2(hydration.iter().map(|h| h.amount_ml).sum()),
            "daily_avg_ml": round2(hydration.iter().map(|h| h.amount_ml).sum::<f64>() / days),
        },
        "exercise": {
            "sessions": exercise.len(),
            "minutes_total": exercise.iter().filter_map(|e| e.duration_minutes).sum::<i64>(),
            "minutes_daily_avg": round2(
                exercise.iter().filter_map(|e| e.duration_minutes).sum::<i64>() as f64 / days
            ),
            "calories_total": round2(exercise.iter().filter_map(|e| e.calories_burned).sum()),
        },
        "sleep": {
            "entries": sleep.len(),
            "duration_avg_min": sleep_duration_metric.map(round2),
            "qualities": sleep.iter().filter_map(|s| s.quality.clone()).collect::<Vec<_>>(),
        },
        "fasting": {
            "entries": fasting.len(),
            "duration_avg_min": mean(&fasting_durations).map(round2),
        },
        "medication_adherence": {
            "expected_events": expected_med,
            "completed_events": done_med,
            "adherence_ratio": med_adherence,
        },
        "supplement_adherence": {
            "expected_events": expected_supp,
            "completed_events": done_supp,
            "adherence_ratio": supp_adherence,
            "logs_count": supp_logs.len(),
        },
        "vitals": {
            "entries": vitals.len(),
            "weight": {
                "latest_kg": weight_points.last().copied(),
                "avg_kg": mean(&weight_points).map(|v| (v * 1000.0).round() / 1000.0),
                "delta_kg": slope(&weight_points),
            },
            "blood_pressure": {
                "avg_systolic": avg_systolic,
                "avg_diastolic": avg_diastolic,
                "delta_systolic": slope(&bp_sys_points),
            },
            "heart_rate": {
                "avg_bpm": mean(&hr_points).map(round2),
                "delta_bpm": slope(&hr_points),
            },
        },
        "health_optimization_framework": {
            "active_count": active.len(),
            "active_items": active.iter().map(|row| json!({
                "id": row.id,
                "framework_type": row.framework_type,
                "classifier_label": row.classifier_label,
                "name": row.name,
                "priority_score": row.priority_score,
                "source": row.source,
            })).collect::<Vec<_>>(),
        },
    });

    let mut missing_domains = Vec::new();
    if foods.is_empty() {
        missing_domains.push("nutrition".to_string());
    }
    if hydration.is_empty() {
        missing_domains.push("hydration".to_string());
    }
    if exercise.is_empty() {
        missing_domains.push("exercise".to_string());
    }
    if vitals.is_empty() {
        missing_domains.push("vitals".to_string());
    }
    if sleep.is_empty() {
        missing_domains.push("sleep".to_string());
    }
    if active.is_empty() {
        missing_domains.push("health_framework".to_string());
    }

    let mut risk_flags = Vec::new();
    if avg_systolic.is_some_and(|v| v >= 140.0) {
        risk_flags.push("bp_elevated_systolic".to_string());
    }
    if avg_diastolic.is_some_and(|v| v >= 90.0) {
        risk_flags.push("bp_elevated_diastolic".to_string());
    }
    if sodium_total / days >= 2300.0 {
        risk_flags.push("sodium_high".to_string());
    }
    if med_adherence.is_some_and(|v| v < 0.7) {
        risk_flags.push("medication_adherence_low".to_string());
    }

    Ok(PeriodMetrics {
        metrics,
        missing_domains,
        risk_flags,
    })
}

/// Free-text notes inside the window, fed to the utility signal extractor.
pub fn collect_notes_for_signals(
    conn: &Connection,
    user_id: i64,
    window: &AnalysisWindow,
    tz: Tz,
) -> Result<Vec<String>> {
    let (start, end) = local_window_bounds(window, tz);
    let mut notes: Vec<String> = Vec::new();

    for row in logs::food_logs_between(conn, user_id, start, end)? {
        if let Some(n) = row.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            notes.push(format!("Food note: {n}"));
        }
    }
    for row in logs::vitals_logs_between(conn, user_id, start, end)? {
        if let Some(n) = row.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            notes.push(format!("Vitals note: {n}"));
        }
    }
    for row in logs::exercise_logs_between(conn, user_id, start, end)? {
        if let Some(n) = row.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            notes.push(format!("Exercise note: {n}"));
        }
    }
    for row in logs::sleep_logs_overlapping(conn, user_id, start, end)? {
        if let Some(n) = row.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            notes.push(format!("Sleep note: {n}"));
        }
    }
    for row in logs::fasting_logs_started_between(conn, user_id, start, end)? {
        if let Some(n) = row.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            notes.push(format!("Fasting note: {n}"));
        }
    }
    for row in logs::supplement_logs_between(conn, user_id, start, end)? {
        if let Some(n) = row.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            notes.push(format!("Supplement note: {n}"));
        }
    }
    for msg in vital_store::messages::user_messages_between(conn, user_id, start, end, 30)? {
        let content = msg.content.trim();
        if !content.is_empty() {
            let clipped: String = content.chars().take(400).collect();
            notes.push(format!("Chat note: {clipped}"));
        }
    }

    notes.truncate(80);
    Ok(notes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vital_store::users::{create_user, get_settings, set_settings_field};
    use vital_store::Store;

    use crate::windows::{window_for, RunType};

    #[test]
    fn metrics_flag_missing_domains_and_risks() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        set_settings_field(
            &conn,
            user.id,
            "medications",
            Some(r#"[{"name":"Candesartan","dose":"4mg","timing":"morning"}]"#),
        )
        .unwrap();
        let settings = get_settings(&conn, user.id).unwrap();

        let tz: Tz = "UTC".parse().unwrap();
        let today = Utc::now().date_naive();
        let window = window_for(RunType::Daily, today);

        // Two high BP readings, no food/hydration/exercise/sleep.
        for (sys, dia) in [(150, 95), (146, 92)] {
            logs::insert_vitals_log(
                &conn,
                &logs::NewVitalsLog {
                    user_id: user.id,
                    logged_at: Utc::now(),
                    weight_kg: None,
                    bp_systolic: Some(sys),
                    bp_diastolic: Some(dia),
                    heart_rate: None,
                    blood_glucose: None,
                    temperature_c: None,
                    spo2: None,
                    notes: None,
                },
            )
            .unwrap();
        }

        let out = collect_period_metrics(&conn, user.id, &settings, &window, tz).unwrap();
        assert!(out.missing_domains.contains(&"nutrition".to_string()));
        assert!(out.missing_domains.contains(&"sleep".to_string()));
        assert!(!out.missing_domains.contains(&"vitals".to_string()));
        assert!(out.risk_flags.contains(&"bp_elevated_systolic".to_string()));
        assert!(out.risk_flags.contains(&"bp_elevated_diastolic".to_string()));
        // One med expected for one day, zero completions → low adherence.
        assert!(out.risk_flags.contains(&"medication_adherence_low".to_string()));
        assert_eq!(out.metrics["vitals"]["entries"], 2);
        assert_eq!(out.metrics["vitals"]["blood_pressure"]["avg_systolic"], 148.0);
    }

    #[test]
    fn adherence_ratio_counts_checklist_completions() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        set_settings_field(
            &conn,
            user.id,
            "medications",
            Some(r#"[{"name":"Candesartan","dose":"","timing":""}]"#),
        )
        .unwrap();
        let settings = get_settings(&conn, user.id).unwrap();

        let today = Utc::now().date_naive();
        let day = today.format("%Y-%m-%d").to_string();
        checklist::mark_item(&conn, user.id, &day, "medication", "Candesartan", true).unwrap();

        let window = window_for(RunType::Daily, today);
        let out =
            collect_period_metrics(&conn, user.id, &settings, &window, chrono_tz::UTC).unwrap();
        assert_eq!(out.metrics["medication_adherence"]["adherence_ratio"], 1.0);
        assert!(!out.risk_flags.contains(&"medication_adherence_low".to_string()));
    }

    #[test]
    fn daily_sleep_uses_max_duration() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        let settings = get_settings(&conn, user.id).unwrap();
        let now = Utc::now();
        logs::insert_sleep_log(&conn, user.id, None, Some(now), Some(300), None, None).unwrap();
        logs::insert_sleep_log(&conn, user.id, None, Some(now), Some(480), None, None).unwrap();

        let window = window_for(RunType::Daily, now.date_naive());
        let out =
            collect_period_metrics(&conn, user.id, &settings, &window, chrono_tz::UTC).unwrap();
        assert_eq!(out.metrics["sleep"]["duration_avg_min"], 480.0);
    }
}
