//! Goal sync: when a chat turn confirms or refines goals, a strict-JSON
//! extraction drives `create_goal` / `update_goal` tool calls. Saves are
//! additive and never create near-duplicate titles.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;
use vital_core::config::VitalConfig;
use vital_core::jsonx::{as_f64, as_i64, parse_loose_object};
use vital_provider::{AiProvider, ChatMessage, ChatRequest};
use vital_store::types::UserGoalRow;
use vital_store::{goals, messages};

use crate::error::Result;
use crate::scope::{ModelTier, TurnScope, UtilityBudget};
use crate::tools::{ToolContext, ToolRegistry};

const MAX_CREATES: usize = 3;
const MAX_UPDATES: usize = 5;
const VALID_GOAL_TYPES: &[&str] = &[
    "weight_loss",
    "cardiovascular",
    "fitness",
    "metabolic",
    "energy",
    "sleep",
    "habit",
    "custom",
];
const VALID_STATUSES: &[&str] = &["active", "paused", "completed", "abandoned"];

const GOAL_SYNC_EXTRACT_PROMPT: &str = r#"Extract goal create/update actions from a coaching chat turn.

Return ONLY valid JSON:
{
  "action": "none|create|update|create_or_update",
  "create_goals": [
    {
      "title": "string",
      "description": "string",
      "goal_type": "weight_loss|cardiovascular|fitness|metabolic|energy|sleep|habit|custom",
      "target_value": 0,
      "target_unit": "string",
      "baseline_value": 0,
      "target_date": "YYYY-MM-DD",
      "priority": 1,
      "why": "string"
    }
  ],
  "update_goals": [
    {
      "goal_id": 0,
      "title_match": "existing goal title fragment",
      "title": "optional new title",
      "description": "optional",
      "goal_type": "optional",
      "target_value": 0,
      "target_unit": "optional",
      "baseline_value": 0,
      "current_value": 0,
      "target_date": "YYYY-MM-DD",
      "priority": 1,
      "status": "active|paused|completed|abandoned",
      "why": "optional"
    }
  ]
}

Rules:
- If the message is only kickoff/planning text (e.g., starts with "Goal-setting kickoff:"), return action "none".
- Only create/update when the user explicitly confirms goals or asks to change/refine goals.
- Never invent goals not grounded in the user message.
- Keep create_goals/update_goals empty when unsure."#;

#[derive(Debug, Default, Clone)]
pub struct GoalSyncOutcome {
    pub goal_context: bool,
    pub save_intent: bool,
    pub attempted: bool,
    pub created: usize,
    pub updated: usize,
    pub created_titles: Vec<String>,
    pub updated_titles: Vec<String>,
}

fn normalize_key(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

pub fn looks_like_goal_turn(message: &str) -> bool {
    let t = message.trim().to_lowercase();
    if t.is_empty() {
        return false;
    }
    [
        "goal-setting kickoff:",
        "goal-refinement kickoff:",
        "goal",
        "goals",
        "target",
        "deadline",
        "timeline",
        "refine",
        "adjust",
        "by ",
        "workout",
        "hiit",
        "strength",
    ]
    .iter()
    .any(|term| t.contains(term))
}

fn goal_save_intent(message: &str) -> bool {
    let t = message.trim().to_lowercase();
    [
        "sounds good",
        "go ahead",
        "save",
        "finalize",
        "lock it in",
        "yes",
        "update to",
        "i want to target",
    ]
    .iter()
    .any(|signal| t.contains(signal))
}

fn resolve_goal_for_update<'a>(
    existing: &'a [UserGoalRow],
    goal_id: Option<i64>,
    title_match: Option<&str>,
) -> Option<&'a UserGoalRow> {
    if let Some(id) = goal_id {
        if let Some(row) = existing.iter().find(|g| g.id == id) {
            return Some(row);
        }
    }
    let match_key = normalize_key(title_match?);
    if match_key.is_empty() {
        return None;
    }
    existing.iter().find(|g| {
        let title_key = normalize_key(&g.title);
        !title_key.is_empty() && (title_key.contains(&match_key) || match_key.contains(&title_key))
    })
}

/// Run goal extraction + tool application for one turn.
#[allow(clippy::too_many_arguments)]
pub async fn apply_goal_updates(
    conn_source: &vital_store::Store,
    registry: &ToolRegistry,
    config: &VitalConfig,
    provider: &dyn AiProvider,
    user_id: i64,
    message: &str,
    reference_utc: DateTime<Utc>,
    budget: &UtilityBudget,
    scope: &mut TurnScope,
) -> Result<GoalSyncOutcome> {
    let mut summary = GoalSyncOutcome::default();
    if !looks_like_goal_turn(message) {
        return Ok(summary);
    }
    summary.goal_context = true;
    summary.save_intent = goal_save_intent(message);

    if !budget.can_call(scope, "goal_sync_extract") {
        return Ok(summary);
    }

    let (existing_payload, recent_payload) = {
        let conn = conn_source.conn();
        let existing = goals::goals_by_status(&conn, user_id, Some("active"))?;
        let existing_payload: Vec<Value> = existing
            .iter()
            .map(|g| {
                json!({
                    "goal_id": g.id,
                    "title": g.title,
                    "goal_type": g.goal_type,
                    "target_value": g.target_value,
                    "target_unit": g.target_unit,
                    "target_date": g.target_date,
                    "priority": g.priority,
                })
            })
            .collect();
        let recent: Vec<Value> = messages::recent_messages(&conn, user_id, 6)?
            .iter()
            .filter(|m| m.role == "user" || m.role == "assistant")
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| {
                let content: String = m.content.chars().take(1200).collect();
                json!({ "role": m.role, "content": content })
            })
            .collect();
        (existing_payload, recent)
    };

    let req = ChatRequest::new(
        provider.utility_model(),
        GOAL_SYNC_EXTRACT_PROMPT,
        vec![ChatMessage::user(format!(
            "Current goals JSON:\n{}\n\nRecent conversation JSON:\n{}\n\nUser message:\n{message}",
            serde_json::to_string(&existing_payload)?,
            serde_json::to_string(&recent_payload)?,
        ))],
    );
    let parsed = match provider.chat(&req).await {
        Ok(resp) => {
            scope.record_call(ModelTier::Utility, resp.tokens_in, resp.tokens_out);
            parse_loose_object(&resp.content).unwrap_or_default()
        }
        Err(e) => {
            warn!(error = %e, "goal sync extraction failed");
            scope.record_failure(ModelTier::Utility, "goal_sync_extract", &e.to_string());
            return Ok(summary);
        }
    };

    summary.attempted = true;
    let action = parsed
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("none")
        .trim()
        .to_lowercase();
    if !["create", "update", "create_or_update"].contains(&action.as_str()) {
        return Ok(summary);
    }

    let conn = conn_source.conn();
    let ctx = ToolContext::new(&conn, user_id, "orchestrator", reference_utc, config);

    if action == "create" || action == "create_or_update" {
        let existing = goals::goals_by_status(&conn, user_id, Some("active"))?;
        if let Some(rows) = parsed.get("create_goals").and_then(Value::as_array) {
            for item in rows.iter().take(MAX_CREATES) {
                let Some(obj) = item.as_object() else { continue };
                let Some(title) = obj
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                else {
                    continue;
                };
                // Additive saves: near-duplicate titles are skipped.
                if resolve_goal_for_update(&existing, None, Some(title)).is_some() {
                    continue;
                }

                let goal_type_raw = obj
                    .get("goal_type")
                    .and_then(Value::as_str)
                    .unwrap_or("custom")
                    .trim()
                    .to_lowercase();
                let goal_type = if VALID_GOAL_TYPES.contains(&goal_type_raw.as_str()) {
                    goal_type_raw
                } else {
                    "custom".to_string()
                };

                let mut payload = json!({ "title": title, "goal_type": goal_type });
                for key in ["description", "target_unit", "target_date", "why"] {
                    if let Some(v) = obj.get(key).and_then(Value::as_str).map(str::trim) {
                        if !v.is_empty() {
                            payload[key] = json!(v);
                        }
                    }
                }
                if let Some(v) = as_f64(obj.get("target_value")) {
                    payload["target_value"] = json!(v);
                }
                if let Some(v) = as_f64(obj.get("baseline_value")) {
                    payload["baseline_value"] = json!(v);
                }
                if let Some(p) = as_i64(obj.get("priority")) {
                    payload["priority"] = json!(p.clamp(1, 5));
                }

                match registry.execute("create_goal", &payload, &ctx) {
                    Ok(out) => {
                        if let Some(goal) = out.get("goal").and_then(Value::as_object) {
                            summary.created += 1;
                            summary.created_titles.push(
                                goal.get("title")
                                    .and_then(Value::as_str)
                                    .unwrap_or(title)
                                    .to_string(),
                            );
                        }
                    }
                    Err(e) => warn!(title, error = %e, "goal create tool failed"),
                }
            }
        }
    }

    if action == "update" || action == "create_or_update" {
        let refreshed = goals::goals_by_status(&conn, user_id, Some("active"))?;
        if let Some(rows) = parsed.get("update_goals").and_then(Value::as_array) {
            for item in rows.iter().take(MAX_UPDATES) {
                let Some(obj) = item.as_object() else { continue };
                let goal_id = as_i64(obj.get("goal_id"));
                let title_match = obj
                    .get("title_match")
                    .or_else(|| obj.get("title"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|t| !t.is_empty());
                let Some(target) = resolve_goal_for_update(&refreshed, goal_id, title_match) else {
                    continue;
                };

                let mut payload = json!({ "goal_id": target.id });
                let mut fields = 0;
                for key in ["title", "description", "target_unit", "target_date", "why"] {
                    if let Some(v) = obj.get(key).and_then(Value::as_str).map(str::trim) {
                        if !v.is_empty() {
                            payload[key] = json!(v);
                            fields += 1;
                        }
                    }
                }
                if let Some(raw) = obj.get("goal_type").and_then(Value::as_str) {
                    let gt = raw.trim().to_lowercase();
                    payload["goal_type"] = json!(if VALID_GOAL_TYPES.contains(&gt.as_str()) {
                        gt
                    } else {
                        "custom".to_string()
                    });
                    fields += 1;
                }
                if let Some(raw) = obj.get("status").and_then(Value::as_str) {
                    let status = raw.trim().to_lowercase();
                    if VALID_STATUSES.contains(&status.as_str()) {
                        payload["status"] = json!(status);
                        fields += 1;
                    }
                }
                for key in ["target_value", "baseline_value", "current_value"] {
                    if let Some(v) = as_f64(obj.get(key)) {
                        payload[key] = json!(v);
                        fields += 1;
                    }
                }
                if let Some(p) = as_i64(obj.get("priority")) {
                    payload["priority"] = json!(p.clamp(1, 5));
                    fields += 1;
                }
                if fields == 0 {
                    continue;
                }

                match registry.execute("update_goal", &payload, &ctx) {
                    Ok(out) => {
                        if let Some(goal) = out.get("goal").and_then(Value::as_object) {
                            summary.updated += 1;
                            summary.updated_titles.push(
                                goal.get("title")
                                    .and_then(Value::as_str)
                                    .unwrap_or(&target.title)
                                    .to_string(),
                            );
                        }
                    }
                    Err(e) => warn!(goal_id = target.id, error = %e, "goal update tool failed"),
                }
            }
        }
    }

    Ok(summary)
}

fn response_claims_goal_saved(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    let save_terms = [
        "saved",
        "save these goals",
        "i'll save",
        "let me save",
        "now save",
        "go ahead and save",
    ];
    save_terms.iter().any(|term| t.contains(term)) && t.contains("goal")
}

/// Extra chunk appended after the stream describing what was (or wasn't)
/// persisted, so the reply never overclaims goal saves.
pub fn goal_sync_followup_text(outcome: &GoalSyncOutcome, assistant_response: &str) -> Option<String> {
    if outcome.created > 0 || outcome.updated > 0 {
        let mut lines: Vec<String> = Vec::new();
        if !outcome.created_titles.is_empty() {
            lines.push(format!("Saved goals: {}.", outcome.created_titles.join(", ")));
        } else if outcome.created > 0 {
            lines.push(format!("Saved {} new goal(s).", outcome.created));
        }
        if !outcome.updated_titles.is_empty() {
            lines.push(format!("Updated goals: {}.", outcome.updated_titles.join(", ")));
        } else if outcome.updated > 0 {
            lines.push(format!("Updated {} existing goal(s).", outcome.updated));
        }
        lines.push("Return to the Goals page to review your 5-day timeline and start check-ins.".to_string());
        return Some(lines.join("\n"));
    }

    if outcome.goal_context && response_claims_goal_saved(assistant_response) {
        return Some(
            "I have not persisted goal changes yet. Confirm the exact target(s) and timeline(s), \
             and I will save them before we move on."
                .to_string(),
        );
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vital_provider::{ChatResponse, ProviderError};
    use vital_store::users::create_user;
    use vital_store::Store;

    struct GoalProvider(&'static str);

    #[async_trait]
    impl AiProvider for GoalProvider {
        fn name(&self) -> &str {
            "g"
        }
        fn reasoning_model(&self) -> &str {
            "r"
        }
        fn utility_model(&self) -> &str {
            "u"
        }
        fn deep_thinking_model(&self) -> &str {
            "d"
        }
        async fn chat(&self, req: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: self.0.to_string(),
                model: req.model.clone(),
                tokens_in: 10,
                tokens_out: 10,
            })
        }
        async fn chat_with_vision(
            &self,
            req: &ChatRequest,
            _image: &[u8],
        ) -> std::result::Result<ChatResponse, ProviderError> {
            self.chat(req).await
        }
        async fn validate_key(&self) -> std::result::Result<bool, ProviderError> {
            Ok(true)
        }
    }

    fn setup() -> (Store, i64, ToolRegistry, VitalConfig) {
        let store = Store::open_in_memory().unwrap();
        let user_id = {
            let conn = store.conn();
            create_user(&conn, "a", "A").unwrap().id
        };
        (store, user_id, ToolRegistry::with_default_tools(), VitalConfig::default())
    }

    const CREATE_ANSWER: &str = r#"{
        "action": "create",
        "create_goals": [
            {"title": "Reach 82 kg", "goal_type": "weight_loss", "target_value": 82,
             "target_unit": "kg", "baseline_value": 90, "target_date": "2026-06-01", "priority": 1}
        ],
        "update_goals": []
    }"#;

    #[tokio::test]
    async fn confirmed_goal_turn_creates_goals() {
        let (store, user_id, registry, config) = setup();
        let provider = GoalProvider(CREATE_ANSWER);
        let budget = UtilityBudget::with_limit(3);
        let mut scope = TurnScope::start(user_id);

        let out = apply_goal_updates(
            &store,
            &registry,
            &config,
            &provider,
            user_id,
            "sounds good, save the goal: reach 82 kg by June",
            Utc::now(),
            &budget,
            &mut scope,
        )
        .await
        .unwrap();
        assert!(out.goal_context);
        assert!(out.save_intent);
        assert_eq!(out.created, 1);
        assert_eq!(out.created_titles, vec!["Reach 82 kg".to_string()]);

        let conn = store.conn();
        let rows = goals::goals_by_status(&conn, user_id, Some("active")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].current_value, Some(90.0));
    }

    #[tokio::test]
    async fn near_duplicate_titles_are_not_recreated() {
        let (store, user_id, registry, config) = setup();
        {
            let conn = store.conn();
            goals::insert_goal(
                &conn,
                user_id,
                &goals::NewGoal {
                    title: "Reach 82 kg",
                    description: None,
                    goal_type: "weight_loss",
                    target_value: Some(82.0),
                    target_unit: Some("kg"),
                    baseline_value: Some(90.0),
                    target_date: None,
                    priority: 1,
                    why: None,
                },
            )
            .unwrap();
        }
        let provider = GoalProvider(CREATE_ANSWER);
        let budget = UtilityBudget::with_limit(3);
        let mut scope = TurnScope::start(user_id);
        let out = apply_goal_updates(
            &store, &registry, &config, &provider, user_id,
            "save the goal: reach 82kg", Utc::now(), &budget, &mut scope,
        )
        .await
        .unwrap();
        assert_eq!(out.created, 0);
        let conn = store.conn();
        assert_eq!(goals::goals_by_status(&conn, user_id, Some("active")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_goal_messages_skip_extraction() {
        let (store, user_id, registry, config) = setup();
        let provider = GoalProvider(CREATE_ANSWER);
        let budget = UtilityBudget::with_limit(3);
        let mut scope = TurnScope::start(user_id);
        let out = apply_goal_updates(
            &store, &registry, &config, &provider, user_id,
            "I had eggs", Utc::now(), &budget, &mut scope,
        )
        .await
        .unwrap();
        assert!(!out.goal_context);
        assert_eq!(scope.utility_calls, 0);
    }

    #[test]
    fn followup_corrects_overclaimed_saves() {
        let outcome = GoalSyncOutcome {
            goal_context: true,
            ..Default::default()
        };
        let followup = goal_sync_followup_text(&outcome, "Great, I've saved these goals for you!");
        assert!(followup.unwrap().contains("not persisted"));

        let saved = GoalSyncOutcome {
            goal_context: true,
            created: 1,
            created_titles: vec!["Reach 82 kg".to_string()],
            ..Default::default()
        };
        let followup = goal_sync_followup_text(&saved, "done").unwrap();
        assert!(followup.contains("Saved goals: Reach 82 kg."));
    }
}
