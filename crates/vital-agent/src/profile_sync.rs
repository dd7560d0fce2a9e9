//! Profile auto-sync: a strict-JSON extraction turn that may upsert
//! medications/supplements, merge list fields, and trigger a framework
//! resync. Question-only messages never pollute the profile.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;
use vital_core::config::VitalConfig;
use vital_core::items::{
    cleanup_structured_list, is_generic_medication_name, is_generic_supplement_name,
    looks_like_medication, parse_structured_list, to_structured, StructuredItem,
};
use vital_core::jsonx::{parse_loose_object, string_list};
use vital_core::types::IntentCategory;
use vital_provider::{AiProvider, ChatMessage, ChatRequest};
use vital_store::users;

use crate::error::Result;
use crate::scope::{ModelTier, TurnScope, UtilityBudget};
use crate::tools::health::json_or_csv_list;
use crate::tools::{ToolContext, ToolRegistry};

const PROFILE_EXTRACT_PROMPT: &str = r#"Extract profile updates from this health message.

Return ONLY valid JSON:
{
  "medications": [{"name": "medication name", "dose": "dose if known", "timing": "when taken if mentioned"}],
  "supplements": [{"name": "brand + product name", "dose": "dose/form if known", "timing": "when taken if mentioned"}],
  "matched_medications": ["exact names from provided medication list that user says they took"],
  "matched_supplements": ["exact names from provided supplement list that user says they took"],
  "medical_conditions": ["condition names"],
  "dietary_preferences": ["preferences/restrictions"],
  "health_goals": ["goals"],
  "family_history": ["family risk factors"]
}

Rules:
- Include only items explicitly stated by the user or clearly visible in attached image context.
- If no updates are present, return empty arrays.
- For medications/supplements: "name" is the product name without dose (e.g., "Jamieson Vitamin D3 drops"), "dose" is the amount (e.g., "1000 IU/drop, 4 drops daily"), "timing" is when taken (e.g., "morning", "with breakfast", "bedtime"). Leave dose/timing as empty string if not mentioned.
- Valid timing values: morning, evening, with breakfast, with lunch, with dinner, bedtime, twice daily, as needed, or empty string.
- If user provides a correction, return the corrected full entry.
- matched_medications and matched_supplements must only include names that exactly match provided current lists."#;

#[derive(Debug, Default)]
pub struct ProfileSyncOutcome {
    pub matched_medications: Vec<String>,
    pub matched_supplements: Vec<String>,
}

fn has_question_intent(text: &str) -> bool {
    let t = text.to_lowercase();
    [
        "?",
        "how much",
        "should i",
        "tell me about",
        "what is",
        "what are",
        "is this",
        "can i",
    ]
    .iter()
    .any(|m| t.contains(m))
}

fn has_explicit_taking_intent(text: &str) -> bool {
    let t = text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    [
        "i take",
        "i'm taking",
        "i am taking",
        "i took",
        "took my",
        "had my",
        "i use",
        "i used",
        "my medication",
        "my medications",
        "my supplement",
        "my supplements",
        "i started",
        "i am on",
        "i'm on",
        "prescribed",
        "this morning",
        "this evening",
        "just took",
        "every day",
        "daily",
    ]
    .iter()
    .any(|m| t.contains(m))
}

/// Intersect extractor output with the user's canonical name list.
pub fn known_name_matches(candidates: &[String], allowed: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in candidates {
        let key = raw.trim().to_lowercase();
        if let Some(resolved) = allowed.iter().find(|a| a.trim().to_lowercase() == key) {
            if !out.contains(resolved) {
                out.push(resolved.clone());
            }
        }
    }
    out
}

fn merged_list_json(existing: Option<&str>, incoming: Vec<String>) -> Option<String> {
    let mut merged = json_or_csv_list(existing);
    for item in incoming {
        if !merged.iter().any(|m| m.eq_ignore_ascii_case(&item)) {
            merged.push(item);
        }
    }
    (!merged.is_empty()).then(|| serde_json::to_string(&merged).unwrap_or_default())
}

/// Run the profile extraction over the combined input and apply the results
/// through the standard tools. Returns matched med/supplement names for the
/// checklist pass.
#[allow(clippy::too_many_arguments)]
pub async fn apply_profile_updates(
    store: &vital_store::Store,
    registry: &ToolRegistry,
    config: &VitalConfig,
    provider: &dyn AiProvider,
    user_id: i64,
    message: &str,
    combined_input: &str,
    category: IntentCategory,
    reference_utc: DateTime<Utc>,
    budget: &UtilityBudget,
    scope: &mut TurnScope,
) -> Result<ProfileSyncOutcome> {
    // Opportunistic cleanup of legacy generic placeholders, inside one lock
    // scope; the model call below runs with no lock held.
    let (current_med_names, current_supp_names) = {
        let conn = store.conn();
        let settings = users::get_settings(&conn, user_id)?;

        let existing_meds = parse_structured_list(settings.medications.as_deref());
        let cleaned_meds: Vec<StructuredItem> = existing_meds
            .into_iter()
            .filter(|m| !is_generic_medication_name(&m.name))
            .collect();
        let meds_json = (!cleaned_meds.is_empty())
            .then(|| serde_json::to_string(&cleaned_meds))
            .transpose()?
            .and_then(|j| cleanup_structured_list(Some(&j)));
        if meds_json != settings.medications {
            users::set_settings_field(&conn, user_id, "medications", meds_json.as_deref())?;
        }
        let existing_supps = parse_structured_list(settings.supplements.as_deref());
        let cleaned_supps: Vec<StructuredItem> = existing_supps
            .into_iter()
            .filter(|s| !is_generic_supplement_name(&s.name))
            .collect();
        let supps_json = (!cleaned_supps.is_empty())
            .then(|| serde_json::to_string(&cleaned_supps))
            .transpose()?
            .and_then(|j| cleanup_structured_list(Some(&j)));
        if supps_json != settings.supplements {
            users::set_settings_field(&conn, user_id, "supplements", supps_json.as_deref())?;
        }

        let med_names: Vec<String> = cleaned_meds.iter().map(|m| m.name.clone()).collect();
        let supp_names: Vec<String> = cleaned_supps.iter().map(|s| s.name.clone()).collect();
        (med_names, supp_names)
    };

    if !budget.can_call(scope, "profile_extract") {
        return Ok(ProfileSyncOutcome::default());
    }

    let med_list = if current_med_names.is_empty() {
        "- (none)".to_string()
    } else {
        current_med_names
            .iter()
            .map(|n| format!("- {n}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let supp_list = if current_supp_names.is_empty() {
        "- (none)".to_string()
    } else {
        current_supp_names
            .iter()
            .map(|n| format!("- {n}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let req = ChatRequest::new(
        provider.utility_model(),
        "You are a strict data extraction assistant. Return only JSON.",
        vec![ChatMessage::user(format!(
            "{PROFILE_EXTRACT_PROMPT}\n\nCurrent medication list:\n{med_list}\n\n\
             Current supplement list:\n{supp_list}\n\nMessage: {combined_input}"
        ))],
    );
    let extracted = match provider.chat(&req).await {
        Ok(resp) => {
            scope.record_call(ModelTier::Utility, resp.tokens_in, resp.tokens_out);
            parse_loose_object(&resp.content).unwrap_or_default()
        }
        Err(e) => {
            warn!(error = %e, "profile auto-sync extraction failed");
            scope.record_failure(ModelTier::Utility, "profile_extract", &e.to_string());
            return Ok(ProfileSyncOutcome::default());
        }
    };

    let matched_meds = known_name_matches(
        &string_list(extracted.get("matched_medications")),
        &current_med_names,
    );
    let matched_supps = known_name_matches(
        &string_list(extracted.get("matched_supplements")),
        &current_supp_names,
    );

    let mut med_items: Vec<StructuredItem> = extracted
        .get("medications")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(to_structured).collect())
        .unwrap_or_default();
    let mut supp_items: Vec<StructuredItem> = extracted
        .get("supplements")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(to_structured).collect())
        .unwrap_or_default();

    let conditions = string_list(extracted.get("medical_conditions"));
    let dietary = string_list(extracted.get("dietary_preferences"));
    let goals = string_list(extracted.get("health_goals"));
    let family = string_list(extracted.get("family_history"));

    // Drop generic placeholders; move likely-Rx items over to medications.
    med_items.retain(|m| !m.name.is_empty() && !is_generic_medication_name(&m.name));
    supp_items.retain(|s| !s.name.is_empty() && !is_generic_supplement_name(&s.name));
    let (moved, remaining): (Vec<StructuredItem>, Vec<StructuredItem>) = supp_items
        .into_iter()
        .partition(|s| looks_like_medication(&s.name));
    med_items.extend(moved);
    supp_items = remaining;

    // Question-only messages never create med/supp entries; only an explicit
    // supplement log keeps the extraction regardless of phrasing.
    let question_only = has_question_intent(message) && !has_explicit_taking_intent(message);
    if category != IntentCategory::LogSupplement
        && (question_only || !has_explicit_taking_intent(message))
    {
        med_items.clear();
        supp_items.clear();
    }

    if med_items.is_empty()
        && supp_items.is_empty()
        && conditions.is_empty()
        && dietary.is_empty()
        && goals.is_empty()
        && family.is_empty()
    {
        return Ok(ProfileSyncOutcome {
            matched_medications: matched_meds,
            matched_supplements: matched_supps,
        });
    }

    let conn = store.conn();
    let ctx = ToolContext::new(&conn, user_id, "orchestrator", reference_utc, config);
    for med in &med_items {
        let args = json!({ "item": {"name": med.name, "dose": med.dose, "timing": med.timing} });
        if let Err(e) = registry.execute("medication_upsert", &args, &ctx) {
            warn!(name = %med.name, error = %e, "medication upsert tool failed");
        }
    }
    for supp in &supp_items {
        let args = json!({ "item": {"name": supp.name, "dose": supp.dose, "timing": supp.timing} });
        if let Err(e) = registry.execute("supplement_upsert", &args, &ctx) {
            warn!(name = %supp.name, error = %e, "supplement upsert tool failed");
        }
    }

    let settings = users::get_settings(&conn, user_id)?;
    let mut patch = serde_json::Map::new();
    if !conditions.is_empty() {
        if let Some(json) = merged_list_json(settings.medical_conditions.as_deref(), conditions) {
            patch.insert("medical_conditions".to_string(), json!(json));
        }
    }
    if !dietary.is_empty() {
        if let Some(json) = merged_list_json(settings.dietary_preferences.as_deref(), dietary) {
            patch.insert("dietary_preferences".to_string(), json!(json));
        }
    }
    if !goals.is_empty() {
        if let Some(json) = merged_list_json(settings.health_goals.as_deref(), goals) {
            patch.insert("health_goals".to_string(), json!(json));
        }
    }
    if !family.is_empty() {
        if let Some(json) = merged_list_json(settings.family_history.as_deref(), family) {
            patch.insert("family_history".to_string(), json!(json));
        }
    }
    if !patch.is_empty() {
        if let Err(e) = registry.execute("profile_patch", &json!({ "patch": patch }), &ctx) {
            warn!(error = %e, "profile patch tool failed");
        }
    }

    if !med_items.is_empty() || !supp_items.is_empty() || !patch.is_empty() {
        if let Err(e) = registry.execute("framework_sync_from_profile", &json!({}), &ctx) {
            warn!(error = %e, "framework sync tool failed");
        }
    }

    Ok(ProfileSyncOutcome {
        matched_medications: matched_meds,
        matched_supplements: matched_supps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vital_provider::{ChatResponse, ProviderError};
    use vital_store::users::create_user;
    use vital_store::Store;

    struct ExtractProvider(&'static str);

    #[async_trait]
    impl AiProvider for ExtractProvider {
        fn name(&self) -> &str {
            "x"
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

    #[tokio::test]
    async fn taking_statement_upserts_structured_items() {
        let (store, user_id, registry, config) = setup();
        let provider = ExtractProvider(
            r#"{"medications":[{"name":"Candesartan","dose":"4mg","timing":"morning"}],
                "supplements":[{"name":"Jamieson Vitamin D3 drops","dose":"1000 IU","timing":"morning"}],
                "matched_medications":[],"matched_supplements":[],
                "medical_conditions":[],"dietary_preferences":[],"health_goals":[],"family_history":[]}"#,
        );
        let budget = UtilityBudget::with_limit(3);
        let mut scope = TurnScope::start(user_id);

        apply_profile_updates(
            &store,
            &registry,
            &config,
            &provider,
            user_id,
            "I take candesartan 4mg every morning and vitamin D3 drops",
            "I take candesartan 4mg every morning and vitamin D3 drops",
            IntentCategory::GeneralChat,
            Utc::now(),
            &budget,
            &mut scope,
        )
        .await
        .unwrap();

        let conn = store.conn();
        let settings = users::get_settings(&conn, user_id).unwrap();
        let meds = parse_structured_list(settings.medications.as_deref());
        assert_eq!(meds.len(), 1);
        assert_eq!(meds[0].name, "Candesartan");
        let supps = parse_structured_list(settings.supplements.as_deref());
        assert_eq!(supps[0].name, "Jamieson Vitamin D3 drops");
    }

    #[tokio::test]
    async fn question_only_messages_do_not_pollute_profile() {
        let (store, user_id, registry, config) = setup();
        let provider = ExtractProvider(
            r#"{"medications":[{"name":"Metformin","dose":"","timing":""}],
                "supplements":[],"matched_medications":[],"matched_supplements":[],
                "medical_conditions":[],"dietary_preferences":[],"health_goals":[],"family_history":[]}"#,
        );
        let budget = UtilityBudget::with_limit(3);
        let mut scope = TurnScope::start(user_id);

        apply_profile_updates(
            &store,
            &registry,
            &config,
            &provider,
            user_id,
            "should I take metformin?",
            "should I take metformin?",
            IntentCategory::AskMedical,
            Utc::now(),
            &budget,
            &mut scope,
        )
        .await
        .unwrap();

        let conn = store.conn();
        let settings = users::get_settings(&conn, user_id).unwrap();
        assert!(settings.medications.is_none());
    }

    #[tokio::test]
    async fn matched_names_intersect_canonical_list() {
        let (store, user_id, registry, config) = setup();
        {
            let conn = store.conn();
            users::set_settings_field(
                &conn,
                user_id,
                "medications",
                Some(r#"[{"name":"Candesartan","dose":"4mg","timing":"morning"}]"#),
            )
            .unwrap();
        }
        let provider = ExtractProvider(
            r#"{"medications":[],"supplements":[],
                "matched_medications":["candesartan","Aspirin"],"matched_supplements":[],
                "medical_conditions":[],"dietary_preferences":[],"health_goals":[],"family_history":[]}"#,
        );
        let budget = UtilityBudget::with_limit(3);
        let mut scope = TurnScope::start(user_id);
        let out = apply_profile_updates(
            &store,
            &registry,
            &config,
            &provider,
            user_id,
            "took my candesartan",
            "took my candesartan",
            IntentCategory::LogSupplement,
            Utc::now(),
            &budget,
            &mut scope,
        )
        .await
        .unwrap();
        assert_eq!(out.matched_medications, vec!["Candesartan".to_string()]);
    }
}
