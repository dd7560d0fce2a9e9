//! Bounded, prioritized system-prompt assembly with a stable-section cache.
//!
//! The stable block (base + specialist prompts, identity, profile, weighted
//! frameworks, meds/supps) is cached by a key that rolls over when the user's
//! settings, specialist config, or any framework row changes. The today
//! snapshot and all dynamic turn blocks are rebuilt every turn.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use rusqlite::Connection;
use vital_analysis::proposals::approved_guidance_block;
use vital_core::items::parse_structured_list;
use vital_core::timeinfer::resolve_tz;
use vital_core::types::IntentCategory;
use vital_core::units::{format_height, format_hydration, format_weight};
use vital_store::types::{SpecialistConfigRow, User, UserSettings};
use vital_store::{frameworks, logs, summaries};

use crate::error::Result;
use crate::specialists::{self, Overrides};
use crate::tools::health::json_or_csv_list;

const STABLE_CACHE_TTL_SECS: u64 = 300;
const STABLE_CACHE_MAX: usize = 256;
const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// Per-intent character budgets.
pub struct ContextBudget {
    pub max_total: usize,
    pub max_profile: usize,
    pub max_framework: usize,
    pub max_meds_supps: usize,
    pub max_snapshot: usize,
    pub max_daily_summary: usize,
    pub max_weekly_summary: usize,
    pub max_guidance: usize,
    pub min_section_chars: usize,
}

impl ContextBudget {
    pub fn for_intent(category: Option<IntentCategory>) -> Self {
        let is_log = category.map(|c| c.is_log()).unwrap_or(false);
        Self {
            max_total: if is_log { 13_000 } else { 18_000 },
            max_profile: 1_500,
            max_framework: 1_400,
            max_meds_supps: 1_800,
            max_snapshot: if is_log { 2_200 } else { 3_200 },
            max_daily_summary: if is_log { 1_200 } else { 1_800 },
            max_weekly_summary: if is_log { 900 } else { 1_500 },
            max_guidance: 1_600,
            min_section_chars: 220,
        }
    }
}

fn clip_block(text: &str, max_chars: usize) -> String {
    let raw = text.trim();
    if raw.chars().count() <= max_chars {
        return raw.to_string();
    }
    let keep = max_chars.saturating_sub(24).max(80);
    let clipped: String = raw.chars().take(keep).collect();
    format!("{}{}", clipped.trim_end(), TRUNCATION_MARKER)
}

fn format_item_list(raw: Option<&str>) -> String {
    let items = parse_structured_list(raw);
    if items.is_empty() {
        return "None reported.".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {}", item.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_user_profile(settings: &UserSettings) -> String {
    let mut lines = vec![format!(
        "- Preferred units: height={}, weight={}, hydration={}",
        settings.height_unit, settings.weight_unit, settings.hydration_unit
    )];
    if let Some(age) = settings.age {
        lines.push(format!("- Age: {age}"));
    }
    if let Some(sex) = &settings.sex {
        lines.push(format!("- Sex: {sex}"));
    }
    if let Some(height) = settings.height_cm {
        lines.push(format!("- Height: {}", format_height(height, &settings.height_unit)));
    }
    if let Some(weight) = settings.current_weight_kg {
        lines.push(format!(
            "- Current weight: {}",
            format_weight(weight, &settings.weight_unit)
        ));
    }
    if let Some(goal) = settings.goal_weight_kg {
        lines.push(format!(
            "- Goal weight: {}",
            format_weight(goal, &settings.weight_unit)
        ));
    }
    if let Some(level) = &settings.fitness_level {
        lines.push(format!("- Fitness level: {level}"));
    }
    let conditions = json_or_csv_list(settings.medical_conditions.as_deref());
    if !conditions.is_empty() {
        lines.push(format!("- Medical conditions: {}", conditions.join(", ")));
    }
    let goals = json_or_csv_list(settings.health_goals.as_deref());
    if !goals.is_empty() {
        lines.push(format!("- Health goals: {}", goals.join(", ")));
    }
    let prefs = json_or_csv_list(settings.dietary_preferences.as_deref());
    if !prefs.is_empty() {
        lines.push(format!("- Dietary preferences: {}", prefs.join(", ")));
    }
    lines.join("\n")
}

fn format_active_frameworks(conn: &Connection, user_id: i64) -> Result<String> {
    frameworks::ensure_default_frameworks(conn, user_id)?;
    let rows = frameworks::active_frameworks(conn, user_id)?;
    if rows.is_empty() {
        return Ok(
            "No active frameworks yet. Use Settings > Framework to activate prioritized strategies."
                .to_string(),
        );
    }

    // Weight-percent allocation within each framework type.
    let mut totals: HashMap<&str, i64> = HashMap::new();
    for row in &rows {
        *totals.entry(row.framework_type.as_str()).or_default() += row.priority_score.max(0);
    }

    let mut lines = Vec::new();
    for row in &rows {
        let total = totals.get(row.framework_type.as_str()).copied().unwrap_or(0);
        let score = row.priority_score.max(0);
        let weight_pct = if total > 0 {
            ((score as f64 / total as f64) * 100.0).round() as i64
        } else {
            0
        };
        lines.push(format!(
            "- ({score}, {weight_pct}% allocation) {} - {} [{}]",
            row.name, row.classifier_label, row.source
        ));
        if let Some(rationale) = row.rationale.as_deref().filter(|r| !r.is_empty()) {
            lines.push(format!("  - Rationale: {rationale}"));
        }
    }
    Ok(lines.join("\n"))
}

type CacheKey = (i64, String, String, String, String);

pub struct ContextBuilder {
    stable_cache: Mutex<HashMap<CacheKey, (Instant, String)>>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            stable_cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(
        conn: &Connection,
        user: &User,
        settings: &UserSettings,
        specialist_config: &SpecialistConfigRow,
        specialist: &str,
    ) -> Result<CacheKey> {
        let settings_stamp = settings
            .updated_at
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "none".to_string());
        let specialist_stamp = specialist_config
            .updated_at
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "none".to_string());
        let framework_stamp = frameworks::max_updated_at(conn, user.id)?
            .unwrap_or_else(|| "none".to_string());
        Ok((
            user.id,
            specialist.to_string(),
            settings_stamp,
            specialist_stamp,
            framework_stamp,
        ))
    }

    fn build_stable_block(
        conn: &Connection,
        user: &User,
        settings: &UserSettings,
        specialist: &str,
        overrides: &Overrides,
        budget: &ContextBudget,
    ) -> Result<String> {
        let mut blocks: Vec<String> = Vec::new();
        blocks.push(specialists::get_system_prompt(overrides).trim().to_string());
        if specialist != specialists::ORCHESTRATOR {
            if let Some(prompt) = specialists::get_specialist_prompt(specialist, overrides) {
                blocks.push(prompt.trim().to_string());
            }
        }

        let display_name = user.display_name.trim();
        let username = user.username.trim();
        if !display_name.is_empty() || !username.is_empty() {
            let mut identity = Vec::new();
            if !display_name.is_empty() {
                identity.push(format!("- Name: {display_name}"));
            }
            if !username.is_empty() && username != display_name {
                identity.push(format!("- Username: {username}"));
            }
            blocks.push(format!("## User Identity\n{}", identity.join("\n")));
        }

        blocks.push(clip_block(
            &format!("## Current User Profile\n{}", format_user_profile(settings)),
            budget.max_profile,
        ));
        blocks.push(clip_block(
            &format!(
                "## Prioritized Health Optimization Framework\n{}",
                format_active_frameworks(conn, user.id)?
            ),
            budget.max_framework,
        ));
        blocks.push(clip_block(
            &format!(
                "## Medications\n{}\n\n## Supplements\n{}",
                format_item_list(settings.medications.as_deref()),
                format_item_list(settings.supplements.as_deref())
            ),
            budget.max_meds_supps,
        ));

        Ok(blocks
            .iter()
            .map(String::as_str)
            .filter(|b| !b.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
            .trim()
            .to_string())
    }

    fn stable_block_cached(
        &self,
        conn: &Connection,
        user: &User,
        settings: &UserSettings,
        specialist_config: &SpecialistConfigRow,
        specialist: &str,
        overrides: &Overrides,
        budget: &ContextBudget,
    ) -> Result<String> {
        let key = Self::cache_key(conn, user, settings, specialist_config, specialist)?;
        {
            let cache = self.stable_cache.lock().unwrap();
            if let Some((stored_at, block)) = cache.get(&key) {
                if stored_at.elapsed().as_secs() <= STABLE_CACHE_TTL_SECS {
                    return Ok(block.clone());
                }
            }
        }

        let block = Self::build_stable_block(conn, user, settings, specialist, overrides, budget)?;
        let mut cache = self.stable_cache.lock().unwrap();
        if cache.len() >= STABLE_CACHE_MAX {
            // Evict the oldest entries down to the cap.
            let mut entries: Vec<(CacheKey, Instant)> =
                cache.iter().map(|(k, (t, _))| (k.clone(), *t)).collect();
            entries.sort_by_key(|(_, t)| *t);
            let excess = cache.len() + 1 - STABLE_CACHE_MAX;
            for (key, _) in entries.into_iter().take(excess) {
                cache.remove(&key);
            }
        }
        cache.insert(key, (Instant::now(), block.clone()));
        Ok(block)
    }

    /// Build the full system context for one turn (stable + snapshot +
    /// guidance + summaries). Dynamic turn blocks are appended by the
    /// orchestrator after this.
    pub fn build_context(
        &self,
        conn: &Connection,
        user: &User,
        settings: &UserSettings,
        specialist_config: &SpecialistConfigRow,
        specialist: &str,
        intent_category: Option<IntentCategory>,
    ) -> Result<String> {
        let budget = ContextBudget::for_intent(intent_category);
        let overrides = specialists::parse_overrides(specialist_config.specialist_overrides.as_deref());

        struct Section {
            text: String,
            required: bool,
        }
        let mut sections: Vec<Section> = Vec::new();
        let mut add = |text: String, max_chars: Option<usize>, required: bool| {
            let payload = text.trim();
            if payload.is_empty() {
                return;
            }
            let payload = match max_chars {
                Some(cap) if cap > 0 => clip_block(payload, cap),
                _ => payload.to_string(),
            };
            sections.push(Section {
                text: payload,
                required,
            });
        };

        let stable = self.stable_block_cached(
            conn,
            user,
            settings,
            specialist_config,
            specialist,
            &overrides,
            &budget,
        )?;
        add(stable, None, true);

        let snapshot = compute_today_snapshot(conn, user.id, settings)?;
        add(
            format!("## Today's Status\n{snapshot}"),
            Some(budget.max_snapshot),
            true,
        );

        let guidance = approved_guidance_block(conn, user.id, 6)?;
        add(guidance, Some(budget.max_guidance), false);

        if let Some(daily) = summaries::latest_narrative(conn, user.id, "daily")? {
            add(
                format!("## Yesterday's Summary\n{daily}"),
                Some(budget.max_daily_summary),
                false,
            );
        }
        if let Some(weekly) = summaries::latest_narrative(conn, user.id, "weekly")? {
            add(
                format!("## Last Week's Summary\n{weekly}"),
                Some(budget.max_weekly_summary),
                false,
            );
        }

        // Selection: required sections are kept (clipped to fit); optional
        // sections are included whole or dropped entirely.
        let mut selected: Vec<String> = Vec::new();
        let mut used = 0usize;
        for section in sections {
            let len = section.text.chars().count();
            let join_cost = if selected.is_empty() { 0 } else { 2 };
            if used + join_cost + len <= budget.max_total {
                used += join_cost + len;
                selected.push(section.text);
                continue;
            }
            if !section.required {
                continue;
            }
            let remaining = budget.max_total.saturating_sub(used + join_cost);
            if remaining < budget.min_section_chars {
                continue;
            }
            let trimmed = clip_block(&section.text, remaining);
            if !trimmed.is_empty() {
                used += join_cost + trimmed.chars().count();
                selected.push(trimmed);
            }
        }

        Ok(selected.join("\n\n"))
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Today's health data snapshot in the user's local day window.
pub fn compute_today_snapshot(
    conn: &Connection,
    user_id: i64,
    settings: &UserSettings,
) -> Result<String> {
    let tz = resolve_tz(settings.timezone.as_deref());
    let today = Utc::now().with_timezone(&tz).date_naive();
    let (day_start, day_end) = vital_analysis::windows::local_day_bounds(today, tz);

    let mut sections = vec![format!("Date: {}", today.format("%Y-%m-%d"))];

    let foods = logs::food_logs_between(conn, user_id, day_start, day_end)?;
    if foods.is_empty() {
        sections.push("No meals logged today.".to_string());
    } else {
        let mut meals_lines = Vec::new();
        let mut totals = [0.0f64; 6];
        for f in &foods {
            let names: Vec<String> = serde_json::from_str::<serde_json::Value>(&f.items)
                .ok()
                .and_then(|v| {
                    v.as_array().map(|arr| {
                        arr.iter()
                            .map(|i| {
                                i.get("name")
                                    .and_then(serde_json::Value::as_str)
                                    .unwrap_or_else(|| i.as_str().unwrap_or("item"))
                                    .to_string()
                            })
                            .collect()
                    })
                })
                .unwrap_or_else(|| vec![f.items.clone()]);
            let calories = f
                .calories
                .map(|c| format!("{c:.0}"))
                .unwrap_or_else(|| "?".to_string());
            meals_lines.push(format!(
                "  - {}: {} ({} cal)",
                f.meal_label.as_deref().unwrap_or("Meal"),
                names.join(", "),
                calories
            ));
            totals[0] += f.calories.unwrap_or(0.0);
            totals[1] += f.protein_g.unwrap_or(0.0);
            totals[2] += f.carbs_g.unwrap_or(0.0);
            totals[3] += f.fat_g.unwrap_or(0.0);
            totals[4] += f.fiber_g.unwrap_or(0.0);
            totals[5] += f.sodium_mg.unwrap_or(0.0);
        }
        sections.push(format!("Meals today ({}):\n{}", foods.len(), meals_lines.join("\n")));
        sections.push(format!(
            "Running totals: {:.0} cal | {:.0}g protein | {:.0}g carbs | {:.0}g fat | {:.0}g fiber | {:.0}mg sodium",
            totals[0], totals[1], totals[2], totals[3], totals[4], totals[5]
        ));
    }

    let hydration = logs::hydration_logs_between(conn, user_id, day_start, day_end)?;
    if hydration.is_empty() {
        sections.push("No hydration logged today.".to_string());
    } else {
        let total_ml: f64 = hydration.iter().map(|h| h.amount_ml).sum();
        sections.push(format!(
            "Hydration: {}",
            format_hydration(total_ml, &settings.hydration_unit)
        ));
    }

    if let Some(vitals) = logs::latest_vitals_between(conn, user_id, day_start, day_end)? {
        let mut parts = Vec::new();
        if let Some(w) = vitals.weight_kg {
            parts.push(format!("Weight: {}", format_weight(w, &settings.weight_unit)));
        }
        if let (Some(sys), Some(dia)) = (vitals.bp_systolic, vitals.bp_diastolic) {
            parts.push(format!("BP: {sys}/{dia}"));
        }
        if let Some(hr) = vitals.heart_rate {
            parts.push(format!("HR: {hr}"));
        }
        if !parts.is_empty() {
            sections.push(format!("Latest vitals: {}", parts.join(" | ")));
        }
    }

    let exercises = logs::exercise_logs_between(conn, user_id, day_start, day_end)?;
    if !exercises.is_empty() {
        let lines: Vec<String> = exercises
            .iter()
            .map(|e| {
                let minutes = e
                    .duration_minutes
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!("  - {}: {} min", e.exercise_type, minutes)
            })
            .collect();
        sections.push(format!("Exercise today:\n{}", lines.join("\n")));
    }

    let sleep_logs = logs::sleep_logs_overlapping(conn, user_id, day_start, day_end)?;
    if let Some(latest) = sleep_logs.iter().find(|s| {
        s.duration_minutes.is_some() || s.sleep_end.is_some() || s.sleep_start.is_some()
    }) {
        let mut parts = Vec::new();
        if let Some(minutes) = latest.duration_minutes {
            parts.push(format!("Duration: {}h {}m", minutes / 60, minutes % 60));
        }
        if let Some(quality) = latest.quality.as_deref() {
            parts.push(format!("Quality: {quality}"));
        }
        if let Some(start) = latest.sleep_start {
            parts.push(format!("Start: {}", start.to_rfc3339()));
        }
        if let Some(end) = latest.sleep_end {
            parts.push(format!("End: {}", end.to_rfc3339()));
        }
        if !parts.is_empty() {
            sections.push(format!("Latest sleep: {}", parts.join(" | ")));
        }
    }

    if let Some(fast) = logs::active_fast(conn, user_id)? {
        let hours = (Utc::now() - fast.fast_start).num_minutes() as f64 / 60.0;
        sections.push(format!(
            "Active fast: Started at {}, duration: {hours:.1} hours",
            fast.fast_start.to_rfc3339()
        ));
    }

    Ok(sections.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vital_store::users::{create_user, get_settings, get_specialist_config, set_settings_field};
    use vital_store::Store;

    fn setup() -> (Store, User, UserSettings, SpecialistConfigRow) {
        let store = Store::open_in_memory().unwrap();
        let (user, settings, sc) = {
            let conn = store.conn();
            let user = create_user(&conn, "robin", "Robin").unwrap();
            let settings = get_settings(&conn, user.id).unwrap();
            let sc = get_specialist_config(&conn, user.id).unwrap();
            (user, settings, sc)
        };
        (store, user, settings, sc)
    }

    #[test]
    fn context_fits_the_intent_budget() {
        let (store, user, settings, sc) = setup();
        let builder = ContextBuilder::new();
        let conn = store.conn();
        for category in [Some(IntentCategory::LogFood), Some(IntentCategory::AskNutrition), None] {
            let out = builder
                .build_context(&conn, &user, &settings, &sc, "nutritionist", category)
                .unwrap();
            let budget = ContextBudget::for_intent(category);
            assert!(out.chars().count() <= budget.max_total);
            // Required sections are always present.
            assert!(out.contains("Current User Profile"));
            assert!(out.contains("Today's Status"));
        }
    }

    #[test]
    fn stable_block_is_cached_until_settings_change() {
        let (store, user, settings, sc) = setup();
        let builder = ContextBuilder::new();
        let conn = store.conn();

        let first = builder
            .build_context(&conn, &user, &settings, &sc, "nutritionist", None)
            .unwrap();
        assert!(!first.contains("Medical conditions"));

        // Changing settings rolls the cache key, so the new value shows up.
        set_settings_field(&conn, user.id, "medical_conditions", Some(r#"["hypertension"]"#))
            .unwrap();
        let settings = get_settings(&conn, user.id).unwrap();
        let second = builder
            .build_context(&conn, &user, &settings, &sc, "nutritionist", None)
            .unwrap();
        assert!(second.contains("hypertension"));
    }

    #[test]
    fn latest_summaries_feed_the_optional_sections() {
        let (store, user, settings, sc) = setup();
        let conn = store.conn();
        summaries::insert_summary(
            &conn,
            user.id,
            "daily",
            "2026-02-20",
            "2026-02-20",
            "Protein landed on target; hydration ran low after 3pm.",
        )
        .unwrap();
        summaries::insert_summary(
            &conn,
            user.id,
            "weekly",
            "2026-02-14",
            "2026-02-20",
            "Four training sessions, sleep consistency improving.",
        )
        .unwrap();

        let builder = ContextBuilder::new();
        let out = builder
            .build_context(&conn, &user, &settings, &sc, "nutritionist", None)
            .unwrap();
        assert!(out.contains("Yesterday's Summary"));
        assert!(out.contains("hydration ran low"));
        assert!(out.contains("Last Week's Summary"));
    }

    #[test]
    fn clip_block_marks_truncation() {
        let long = "x".repeat(500);
        let clipped = clip_block(&long, 120);
        assert!(clipped.ends_with("...[truncated]"));
        assert!(clipped.chars().count() <= 120 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn snapshot_reports_meals_and_fast() {
        let (store, user, settings, _) = setup();
        let conn = store.conn();
        logs::insert_food_log(
            &conn,
            &logs::NewFoodLog {
                user_id: user.id,
                meal_template_id: None,
                logged_at: Utc::now(),
                meal_label: Some("Breakfast"),
                items_json: r#"[{"name":"oatmeal"},{"name":"coffee"}]"#,
                calories: Some(320.0),
                protein_g: Some(12.0),
                carbs_g: Some(55.0),
                fat_g: Some(6.0),
                fiber_g: Some(8.0),
                sodium_mg: Some(120.0),
                notes: None,
            },
        )
        .unwrap();
        logs::insert_fasting_start(&conn, user.id, Utc::now() - chrono::Duration::hours(14), None, None)
            .unwrap();

        let snapshot = compute_today_snapshot(&conn, user.id, &settings).unwrap();
        assert!(snapshot.contains("Breakfast: oatmeal, coffee (320 cal)"));
        assert!(snapshot.contains("Running totals: 320 cal"));
        assert!(snapshot.contains("Active fast"));
    }
}
