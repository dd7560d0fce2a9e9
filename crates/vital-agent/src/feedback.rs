//! Auto-capture of product feedback from user messages, attributed to the
//! active specialist, with a 30-minute duplicate window.

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::warn;
use vital_core::jsonx::parse_loose_object;
use vital_provider::{AiProvider, ChatMessage, ChatRequest};
use vital_store::feedback as feedback_store;

use crate::error::Result;
use crate::scope::{ModelTier, TurnScope, UtilityBudget};

const FEEDBACK_DEDUPE_MINUTES: i64 = 30;
const MAX_ENTRIES_PER_TURN: usize = 3;

const FEEDBACK_EXTRACT_PROMPT: &str = r#"Extract product feedback items from a user message.

Return ONLY valid JSON:
{
  "entries": [
    {
      "feedback_type": "bug|enhancement|missing|other",
      "title": "short title",
      "details": "one sentence details"
    }
  ]
}

Rules:
- Only include actionable app/product feedback.
- If there is no actionable feedback, return {"entries":[]}.
- Keep title concise (<= 90 chars).
- Never include medical advice as feedback."#;

pub fn has_feedback_signal(message: &str) -> bool {
    let t = message.to_lowercase();
    [
        "bug",
        "issue",
        "error",
        "not working",
        "doesn't work",
        "doesnt work",
        "broken",
        "improve",
        "improvement",
        "enhancement",
        "feature request",
        "missing",
        "should have",
        "add a",
        "please add",
        "would be better",
        "doesn't update",
    ]
    .iter()
    .any(|s| t.contains(s))
}

/// Extract and persist feedback entries when the message carries a signal and
/// the utility budget allows the extraction call.
pub async fn capture_feedback_if_needed(
    store: &vital_store::Store,
    provider: &dyn AiProvider,
    user_id: i64,
    message: &str,
    specialist_id: &str,
    specialist_name: &str,
    budget: &UtilityBudget,
    scope: &mut TurnScope,
) -> Result<usize> {
    if !has_feedback_signal(message) {
        return Ok(0);
    }
    if !budget.can_call(scope, "feedback_extract") {
        return Ok(0);
    }

    let req = ChatRequest::new(
        provider.utility_model(),
        FEEDBACK_EXTRACT_PROMPT,
        vec![ChatMessage::user(message)],
    );
    let parsed = match provider.chat(&req).await {
        Ok(resp) => {
            scope.record_call(ModelTier::Utility, resp.tokens_in, resp.tokens_out);
            parse_loose_object(&resp.content)
        }
        Err(e) => {
            warn!(error = %e, "agent feedback extraction failed");
            scope.record_failure(ModelTier::Utility, "feedback_extract", &e.to_string());
            return Ok(0);
        }
    };
    let Some(parsed) = parsed else {
        return Ok(0);
    };
    let Some(entries) = parsed.get("entries").and_then(Value::as_array) else {
        return Ok(0);
    };

    let dedupe_after = Utc::now() - Duration::minutes(FEEDBACK_DEDUPE_MINUTES);
    let conn = store.conn();
    let mut inserted = 0;
    for raw in entries.iter().take(MAX_ENTRIES_PER_TURN) {
        let Some(obj) = raw.as_object() else { continue };
        let f_type_raw = obj
            .get("feedback_type")
            .and_then(Value::as_str)
            .unwrap_or("other")
            .trim()
            .to_lowercase();
        let f_type = if ["bug", "enhancement", "missing", "other"].contains(&f_type_raw.as_str()) {
            f_type_raw
        } else {
            "other".to_string()
        };
        let Some(title) = obj
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
        else {
            continue;
        };
        let details = obj
            .get("details")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|d| !d.is_empty());

        if feedback_store::insert_agent_feedback(
            &conn,
            user_id,
            specialist_id,
            specialist_name,
            &f_type,
            title,
            details,
            dedupe_after,
        )?
        .is_some()
        {
            inserted += 1;
        }
    }
    Ok(inserted)
}
