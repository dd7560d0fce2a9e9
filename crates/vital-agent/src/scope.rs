//! Per-turn accounting: model-call counters, token totals per tier, failure
//! log, and the write-once first-token latency stamp.
//!
//! The scope is an explicit value owned by the turn — never a task-local —
//! and is flushed into one `ai_turn_telemetry` row when the turn ends.

use std::time::Instant;

use serde::Serialize;
use tracing::info;
use vital_core::types::IntentCategory;
use vital_store::types::AiTurnEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Utility,
    Reasoning,
    DeepThinking,
}

impl ModelTier {
    fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Utility => "utility",
            ModelTier::Reasoning => "reasoning",
            ModelTier::DeepThinking => "deep_thinking",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnFailure {
    pub tier: String,
    pub operation: String,
    pub error: String,
}

#[derive(Debug)]
pub struct TurnScope {
    pub user_id: i64,
    pub specialist_id: String,
    pub intent_category: IntentCategory,
    started: Instant,
    pub utility_calls: i64,
    pub reasoning_calls: i64,
    pub deep_calls: i64,
    pub utility_tokens_in: i64,
    pub utility_tokens_out: i64,
    pub reasoning_tokens_in: i64,
    pub reasoning_tokens_out: i64,
    pub deep_tokens_in: i64,
    pub deep_tokens_out: i64,
    pub failures: Vec<TurnFailure>,
    first_token_latency_ms: Option<f64>,
}

impl TurnScope {
    pub fn start(user_id: i64) -> Self {
        Self {
            user_id,
            specialist_id: "orchestrator".to_string(),
            intent_category: IntentCategory::GeneralChat,
            started: Instant::now(),
            utility_calls: 0,
            reasoning_calls: 0,
            deep_calls: 0,
            utility_tokens_in: 0,
            utility_tokens_out: 0,
            reasoning_tokens_in: 0,
            reasoning_tokens_out: 0,
            deep_tokens_in: 0,
            deep_tokens_out: 0,
            failures: Vec::new(),
            first_token_latency_ms: None,
        }
    }

    pub fn set_intent(&mut self, specialist_id: &str, category: IntentCategory) {
        self.specialist_id = specialist_id.to_string();
        self.intent_category = category;
    }

    pub fn record_call(&mut self, tier: ModelTier, tokens_in: u32, tokens_out: u32) {
        match tier {
            ModelTier::Utility => {
                self.utility_calls += 1;
                self.utility_tokens_in += tokens_in as i64;
                self.utility_tokens_out += tokens_out as i64;
            }
            ModelTier::Reasoning => {
                self.reasoning_calls += 1;
                self.reasoning_tokens_in += tokens_in as i64;
                self.reasoning_tokens_out += tokens_out as i64;
            }
            ModelTier::DeepThinking => {
                self.deep_calls += 1;
                self.deep_tokens_in += tokens_in as i64;
                self.deep_tokens_out += tokens_out as i64;
            }
        }
    }

    /// Vision pre-analysis tokens land on the utility tier but never consume
    /// the per-turn utility call quota.
    pub fn record_vision(&mut self, tokens_in: u32, tokens_out: u32) {
        self.utility_tokens_in += tokens_in as i64;
        self.utility_tokens_out += tokens_out as i64;
    }

    pub fn record_failure(&mut self, tier: ModelTier, operation: &str, error: &str) {
        self.failures.push(TurnFailure {
            tier: tier.as_str().to_string(),
            operation: operation.to_string(),
            error: error.to_string(),
        });
    }

    /// Write-once: later stamps are ignored.
    pub fn mark_first_token(&mut self) {
        if self.first_token_latency_ms.is_none() {
            self.first_token_latency_ms = Some(self.elapsed_ms());
        }
    }

    pub fn first_token_latency_ms(&self) -> Option<f64> {
        self.first_token_latency_ms
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    pub fn into_event(self, message_id: Option<i64>) -> AiTurnEvent {
        let total_latency_ms = self.elapsed_ms();
        let failures_json = if self.failures.is_empty() {
            None
        } else {
            serde_json::to_string(&self.failures).ok()
        };
        AiTurnEvent {
            user_id: self.user_id,
            message_id,
            specialist_id: self.specialist_id,
            intent_category: self.intent_category.as_str().to_string(),
            first_token_latency_ms: self.first_token_latency_ms,
            total_latency_ms,
            utility_calls: self.utility_calls,
            reasoning_calls: self.reasoning_calls,
            deep_calls: self.deep_calls,
            utility_tokens_in: self.utility_tokens_in,
            utility_tokens_out: self.utility_tokens_out,
            reasoning_tokens_in: self.reasoning_tokens_in,
            reasoning_tokens_out: self.reasoning_tokens_out,
            deep_tokens_in: self.deep_tokens_in,
            deep_tokens_out: self.deep_tokens_out,
            failure_count: self.failures.len() as i64,
            failures_json,
        }
    }
}

/// Per-turn utility-tier call quota. Budget-aware call sites ask
/// `can_call` before spending a utility model call; the answer flips to
/// false once the scope's counter reaches the limit.
#[derive(Debug, Clone, Copy)]
pub struct UtilityBudget {
    limit: u32,
}

impl UtilityBudget {
    pub fn for_category(config: &vital_core::config::BudgetConfig, category: IntentCategory) -> Self {
        Self {
            limit: config.limit_for(category.is_log()),
        }
    }

    pub fn with_limit(limit: u32) -> Self {
        Self { limit: limit.max(1) }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn can_call(&self, scope: &TurnScope, operation: &str) -> bool {
        if (scope.utility_calls as u32) < self.limit {
            return true;
        }
        info!(
            operation,
            used = scope.utility_calls,
            limit = self.limit,
            "utility call budget exceeded; skipping"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_token_stamp_is_write_once() {
        let mut scope = TurnScope::start(1);
        scope.mark_first_token();
        let first = scope.first_token_latency_ms().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        scope.mark_first_token();
        assert_eq!(scope.first_token_latency_ms().unwrap(), first);
    }

    #[test]
    fn budget_flips_at_the_limit() {
        let mut scope = TurnScope::start(1);
        let budget = UtilityBudget::with_limit(2);
        assert!(budget.can_call(&scope, "a"));
        scope.record_call(ModelTier::Utility, 10, 5);
        assert!(budget.can_call(&scope, "b"));
        scope.record_call(ModelTier::Utility, 10, 5);
        assert!(!budget.can_call(&scope, "c"));
        // Reasoning calls never count against the utility budget.
        scope.record_call(ModelTier::Reasoning, 100, 50);
        assert_eq!(scope.utility_calls, 2);
    }

    #[test]
    fn event_carries_counters_and_failures() {
        let mut scope = TurnScope::start(7);
        scope.set_intent("nutritionist", IntentCategory::LogFood);
        scope.record_call(ModelTier::Utility, 11, 3);
        scope.record_failure(ModelTier::Utility, "log_parse:log_food", "boom");
        let event = scope.into_event(Some(42));
        assert_eq!(event.user_id, 7);
        assert_eq!(event.message_id, Some(42));
        assert_eq!(event.intent_category, "log_food");
        assert_eq!(event.utility_calls, 1);
        assert_eq!(event.failure_count, 1);
        assert!(event.failures_json.unwrap().contains("log_parse"));
    }
}
