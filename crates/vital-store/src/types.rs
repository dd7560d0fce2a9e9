use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// RFC3339 timestamp helpers shared by the row modules.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(parse_ts)
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub role: String,
    pub token_version: i64,
    pub force_password_change: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UserSettings {
    pub user_id: i64,
    pub ai_provider: String,
    pub api_key_sealed: Option<String>,
    pub reasoning_model: Option<String>,
    pub utility_model: Option<String>,
    pub deep_thinking_model: Option<String>,
    pub age: Option<i64>,
    pub sex: Option<String>,
    pub height_cm: Option<f64>,
    pub current_weight_kg: Option<f64>,
    pub goal_weight_kg: Option<f64>,
    pub height_unit: String,
    pub weight_unit: String,
    pub hydration_unit: String,
    pub fitness_level: Option<String>,
    pub timezone: Option<String>,
    pub medical_conditions: Option<String>,
    pub dietary_preferences: Option<String>,
    pub health_goals: Option<String>,
    pub family_history: Option<String>,
    pub medications: Option<String>,
    pub supplements: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct SpecialistConfigRow {
    pub user_id: i64,
    pub active_specialist: String,
    pub specialist_overrides: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub user_id: i64,
    pub role: String,
    pub content: String,
    pub specialist_used: Option<String>,
    pub model_used: Option<String>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub has_image: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FoodLogRow {
    pub id: i64,
    pub user_id: i64,
    pub meal_template_id: Option<i64>,
    pub logged_at: DateTime<Utc>,
    pub meal_label: Option<String>,
    pub items: String,
    pub calories: Option<f64>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub sodium_mg: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HydrationLogRow {
    pub id: i64,
    pub user_id: i64,
    pub logged_at: DateTime<Utc>,
    pub amount_ml: f64,
    pub source: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VitalsLogRow {
    pub id: i64,
    pub user_id: i64,
    pub logged_at: DateTime<Utc>,
    pub weight_kg: Option<f64>,
    pub bp_systolic: Option<i64>,
    pub bp_diastolic: Option<i64>,
    pub heart_rate: Option<i64>,
    pub blood_glucose: Option<f64>,
    pub temperature_c: Option<f64>,
    pub spo2: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExerciseLogRow {
    pub id: i64,
    pub user_id: i64,
    pub logged_at: DateTime<Utc>,
    pub exercise_type: String,
    pub duration_minutes: Option<i64>,
    pub details: Option<String>,
    pub max_hr: Option<i64>,
    pub avg_hr: Option<i64>,
    pub calories_burned: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SupplementLogRow {
    pub id: i64,
    pub user_id: i64,
    pub logged_at: DateTime<Utc>,
    pub supplements: String,
    pub timing: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FastingLogRow {
    pub id: i64,
    pub user_id: i64,
    pub fast_start: DateTime<Utc>,
    pub fast_end: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub fast_type: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SleepLogRow {
    pub id: i64,
    pub user_id: i64,
    pub sleep_start: Option<DateTime<Utc>>,
    pub sleep_end: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub quality: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExercisePlanRow {
    pub id: i64,
    pub user_id: i64,
    pub target_date: String,
    pub plan_type: String,
    pub title: String,
    pub description: Option<String>,
    pub target_minutes: Option<i64>,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct MealTemplateRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub normalized_name: String,
    pub aliases: Option<String>,
    pub ingredients: Option<String>,
    pub servings: f64,
    pub calories: Option<f64>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub sodium_mg: Option<f64>,
    pub notes: Option<String>,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MealTemplateVersionRow {
    pub id: i64,
    pub meal_template_id: i64,
    pub version_number: i64,
    pub snapshot_json: String,
    pub change_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MealResponseSignalRow {
    pub id: i64,
    pub user_id: i64,
    pub meal_template_id: Option<i64>,
    pub food_log_id: Option<i64>,
    pub source_message_id: Option<i64>,
    pub energy_level: Option<i64>,
    pub gi_symptom_tags: Option<String>,
    pub gi_severity: Option<i64>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChecklistItemRow {
    pub id: i64,
    pub user_id: i64,
    pub target_date: String,
    pub item_type: String,
    pub item_name: String,
    pub completed: bool,
}

#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: i64,
    pub user_id: i64,
    pub category: String,
    pub title: String,
    pub message: String,
    pub payload: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct UserGoalRow {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub goal_type: String,
    pub target_value: Option<f64>,
    pub target_unit: Option<String>,
    pub baseline_value: Option<f64>,
    pub current_value: Option<f64>,
    pub target_date: Option<String>,
    pub status: String,
    pub priority: i64,
    pub why: Option<String>,
    pub created_by: String,
}

#[derive(Debug, Clone)]
pub struct FrameworkRow {
    pub id: i64,
    pub user_id: i64,
    pub framework_type: String,
    pub classifier_label: String,
    pub name: String,
    pub normalized_name: String,
    pub priority_score: i64,
    pub is_active: bool,
    pub source: String,
    pub rationale: Option<String>,
    pub metadata_json: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AnalysisRunRow {
    pub id: i64,
    pub user_id: i64,
    pub run_type: String,
    pub period_start: String,
    pub period_end: String,
    pub status: String,
    pub confidence: Option<f64>,
    pub used_utility_model: Option<String>,
    pub used_reasoning_model: Option<String>,
    pub used_deep_model: Option<String>,
    pub metrics_json: Option<String>,
    pub missing_data_json: Option<String>,
    pub risk_flags_json: Option<String>,
    pub synthesis_json: Option<String>,
    pub summary_markdown: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AnalysisProposalRow {
    pub id: i64,
    pub user_id: i64,
    pub analysis_run_id: i64,
    pub proposal_kind: String,
    pub status: String,
    pub title: String,
    pub rationale: String,
    pub confidence: Option<f64>,
    pub requires_approval: bool,
    pub proposal_json: String,
    pub diff_markdown: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewer_user_id: Option<i64>,
    pub review_note: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct FeedbackEntryRow {
    pub id: i64,
    pub feedback_type: String,
    pub title: String,
    pub details: Option<String>,
    pub source: String,
    pub specialist_id: Option<String>,
    pub specialist_name: Option<String>,
    pub created_by_user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Per-turn AI telemetry payload persisted at the end of a turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiTurnEvent {
    pub user_id: i64,
    pub message_id: Option<i64>,
    pub specialist_id: String,
    pub intent_category: String,
    pub first_token_latency_ms: Option<f64>,
    pub total_latency_ms: f64,
    pub utility_calls: i64,
    pub reasoning_calls: i64,
    pub deep_calls: i64,
    pub utility_tokens_in: i64,
    pub utility_tokens_out: i64,
    pub reasoning_tokens_in: i64,
    pub reasoning_tokens_out: i64,
    pub deep_tokens_in: i64,
    pub deep_tokens_out: i64,
    pub failure_count: i64,
    pub failures_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEvent {
    pub user_id: Option<i64>,
    pub request_group: String,
    pub path: String,
    pub method: String,
    pub status_code: i64,
    pub duration_ms: f64,
    pub db_query_count: i64,
    pub db_query_time_ms: f64,
}
