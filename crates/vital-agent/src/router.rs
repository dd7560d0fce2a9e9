//! Intent classification: deterministic heuristic first, utility model
//! fallback second, with closed-set validation of the model's answer.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;
use vital_core::jsonx::{as_f64, parse_loose_object};
use vital_core::types::{IntentCategory, IntentResult};
use vital_provider::{AiProvider, ChatMessage, ChatRequest};

use crate::scope::{ModelTier, TurnScope};
use crate::specialists::ORCHESTRATOR;

const HEURISTIC_CONFIDENCE: f64 = 0.15;

const ROUTING_PROMPT: &str = r#"Classify this user message into ONE category and identify the best specialist.

Categories:
- log_food: User is reporting what they ate/drank
- log_vitals: User is reporting weight, BP, HR, blood glucose
- log_exercise: User is reporting a workout or activity
- log_supplement: User is reporting taking supplements/medications
- log_fasting: User is starting/ending a fast
- log_sleep: User is reporting sleep data
- log_hydration: User is reporting water/fluid intake
- intake_profile: User is setting up or updating baseline profile details (age, height, goals, meds, preferences)
- ask_nutrition: Question about diet, food choices, meal planning
- ask_exercise: Question about workouts, training
- ask_sleep: Question about sleep improvement
- ask_supplement: Question about supplements, timing, interactions
- ask_medical: Question involving symptoms, medications, health concerns
- general_chat: Greetings, motivation, general health topics

Specialists: {specialists}

Return ONLY valid JSON: {"category": "...", "specialist": "...", "confidence": 0.0-1.0}"#;

static QUESTION_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(what|how|why|when|where|can|should|could|would|is|are|do|does|did)\b").unwrap()
});
static PLANNING_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bcan\s+i\s+(?:have|eat|drink|try)\b",
        r"\bcould\s+i\s+(?:have|eat|drink|try)\b",
        r"\bshould\s+i\s+(?:have|eat|drink|try)\b",
        r"\bwould\s+it\s+be\s+ok(?:ay)?\s+(?:to|if\s+i)\s+(?:have|eat|drink|try)\b",
        r"\bis\s+it\s+ok(?:ay)?\s+(?:to|if\s+i)\s+(?:have|eat|drink|try)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

fn normalize(text: &str) -> String {
    text.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

fn looks_like_question(text: &str) -> bool {
    text.contains('?') || QUESTION_START_RE.is_match(text)
}

/// "Can I have pancakes?"-style planning questions must not be read as a
/// food log.
fn looks_like_food_planning_question(text: &str) -> bool {
    let normalized = normalize(text);
    if normalized.is_empty() || !looks_like_question(&normalized) {
        return false;
    }
    let past_log_cues = [
        "i had ",
        "i ate ",
        "i drank ",
        "my lunch was",
        "my breakfast was",
        "my dinner was",
        "just had",
        "just ate",
        "just drank",
    ];
    if contains_any(&normalized, &past_log_cues) {
        return false;
    }
    PLANNING_RES.iter().any(|re| re.is_match(&normalized))
}

/// Deterministic cascade over category cues.
pub fn heuristic_category(message: &str) -> IntentCategory {
    let text = normalize(message);
    let is_question = looks_like_question(&text);

    let intake_cues = [
        "intake",
        "profile",
        "my age",
        "my height",
        "my weight",
        "goal weight",
        "timezone",
        "medical condition",
        "health goals",
        "dietary preference",
    ];
    if contains_any(&text, &intake_cues) {
        return IntentCategory::IntakeProfile;
    }

    if contains_any(
        &text,
        &[
            "start fasting",
            "starting fast",
            "begin fast",
            "end fast",
            "broke my fast",
            "finished fasting",
            "fasting",
        ],
    ) {
        return IntentCategory::LogFasting;
    }

    let sleep_cues = ["going to bed", "went to bed", "fell asleep", "woke up", "sleep", "slept"];
    if contains_any(&text, &sleep_cues) {
        return if is_question {
            IntentCategory::AskSleep
        } else {
            IntentCategory::LogSleep
        };
    }

    let hydration_cues = [
        "drank water",
        "drink water",
        "hydration",
        "oz of water",
        "ml of water",
        "cups of water",
    ];
    if contains_any(&text, &hydration_cues) {
        return IntentCategory::LogHydration;
    }

    let exercise_cues = [
        "workout", "exercise", "training", "lifted", "strength", "hiit", "zone 2", "run", "walk",
        "cycling", "swim", "yoga",
    ];
    if contains_any(&text, &exercise_cues) {
        return if is_question {
            IntentCategory::AskExercise
        } else {
            IntentCategory::LogExercise
        };
    }

    let padded = format!(" {text} ");
    let vitals_cues = [
        "blood pressure",
        " bp ",
        "bp ",
        "heart rate",
        " hr ",
        "hr ",
        "spo2",
        "glucose",
        "weight",
    ];
    if contains_any(&padded, &vitals_cues) {
        return if is_question {
            IntentCategory::AskMedical
        } else {
            IntentCategory::LogVitals
        };
    }

    let supplement_cues = [
        "supplement",
        "supplements",
        "vitamin",
        "vitamins",
        "medication",
        "medications",
        "meds",
        "pill",
        "took my",
    ];
    if contains_any(&text, &supplement_cues) {
        return if is_question {
            IntentCategory::AskSupplement
        } else {
            IntentCategory::LogSupplement
        };
    }

    let food_log_cues = [
        "i ate",
        "i had",
        "i drank",
        "for breakfast",
        "for lunch",
        "for dinner",
        "for snack",
        "my breakfast was",
        "my lunch was",
        "my dinner was",
        "snack",
    ];
    if contains_any(&text, &food_log_cues) {
        if is_question && looks_like_food_planning_question(&text) {
            return IntentCategory::AskNutrition;
        }
        return IntentCategory::LogFood;
    }
    let food_question_cues = [
        "meal",
        "coffee",
        "protein shake",
        "nutrition",
        "diet",
        "calories",
        "macros",
    ];
    if is_question && contains_any(&text, &food_question_cues) {
        return IntentCategory::AskNutrition;
    }

    if is_question {
        if contains_any(&text, &["food", "nutrition", "diet", "calories", "macros"]) {
            return IntentCategory::AskNutrition;
        }
        if contains_any(&text, &["med", "medication", "supplement", "vitamin", "interaction"]) {
            return IntentCategory::AskSupplement;
        }
        if contains_any(&text, &["symptom", "pain", "dizzy", "headache", "pressure", "doctor"]) {
            return IntentCategory::AskMedical;
        }
    }

    IntentCategory::GeneralChat
}

fn heuristic_intent(
    message: &str,
    forced_specialist: Option<&str>,
    allowed: &[String],
) -> IntentResult {
    let category = heuristic_category(message);
    let mut specialist = forced_specialist
        .map(str::to_string)
        .unwrap_or_else(|| category.default_specialist().to_string());
    if !allowed.iter().any(|a| a == &specialist) {
        specialist = ORCHESTRATOR.to_string();
    }
    IntentResult {
        category,
        specialist,
        confidence: HEURISTIC_CONFIDENCE,
    }
}

/// Classify a message. The model path runs only when the budget allows; any
/// model failure or out-of-set answer falls back to the heuristic.
pub async fn classify_intent(
    provider: &dyn AiProvider,
    message: &str,
    user_override: Option<&str>,
    allowed_specialists: &[String],
    allow_model_call: bool,
    scope: &mut TurnScope,
) -> IntentResult {
    let forced_specialist = user_override
        .filter(|o| *o != "auto")
        .map(|o| {
            if allowed_specialists.iter().any(|a| a == o) {
                o
            } else {
                ORCHESTRATOR
            }
        });

    if !allow_model_call {
        return heuristic_intent(message, forced_specialist, allowed_specialists);
    }

    let routing_prompt = ROUTING_PROMPT.replace("{specialists}", &allowed_specialists.join(", "));
    let req = ChatRequest::new(
        provider.utility_model(),
        "You are a classification assistant. Return only valid JSON.",
        vec![ChatMessage::user(format!("{routing_prompt}\n\nMessage: {message}"))],
    );

    match provider.chat(&req).await {
        Ok(resp) => {
            scope.record_call(ModelTier::Utility, resp.tokens_in, resp.tokens_out);
            let Some(parsed) = parse_loose_object(&resp.content) else {
                scope.record_failure(ModelTier::Utility, "intent_classification", "non-JSON answer");
                return heuristic_intent(message, forced_specialist, allowed_specialists);
            };
            let category = parsed
                .get("category")
                .and_then(|v| v.as_str())
                .and_then(IntentCategory::parse)
                .unwrap_or_else(|| heuristic_category(message));
            let mut specialist = forced_specialist
                .map(str::to_string)
                .or_else(|| {
                    parsed
                        .get("specialist")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| ORCHESTRATOR.to_string());
            if !allowed_specialists.iter().any(|a| a == &specialist) {
                specialist = category.default_specialist().to_string();
            }
            if !allowed_specialists.iter().any(|a| a == &specialist) {
                specialist = ORCHESTRATOR.to_string();
            }
            IntentResult {
                category,
                specialist,
                confidence: as_f64(parsed.get("confidence")).unwrap_or(0.5).clamp(0.0, 1.0),
            }
        }
        Err(e) => {
            warn!(error = %e, "intent classification failed, using deterministic fallback");
            scope.record_failure(ModelTier::Utility, "intent_classification", &e.to_string());
            heuristic_intent(message, forced_specialist, allowed_specialists)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vital_provider::{ChatResponse, ProviderError};

    #[test]
    fn cascade_orders_fasting_before_sleep_and_food() {
        assert_eq!(heuristic_category("broke my fast at noon"), IntentCategory::LogFasting);
        assert_eq!(heuristic_category("I slept 8 hours"), IntentCategory::LogSleep);
        assert_eq!(
            heuristic_category("drank water after my walk? no wait"),
            IntentCategory::LogHydration
        );
        assert_eq!(
            heuristic_category("I had oatmeal and coffee for breakfast"),
            IntentCategory::LogFood
        );
        assert_eq!(heuristic_category("bp 128/84 hr 72 just now"), IntentCategory::LogVitals);
        assert_eq!(
            heuristic_category("Took my blood pressure meds at 8:30pm"),
            IntentCategory::LogVitals
        );
        assert_eq!(heuristic_category("hey"), IntentCategory::GeneralChat);
    }

    #[test]
    fn food_planning_questions_route_to_ask_nutrition() {
        assert_eq!(
            heuristic_category("can I have a burger for dinner?"),
            IntentCategory::AskNutrition
        );
        assert_eq!(
            heuristic_category("should i eat more protein for breakfast"),
            IntentCategory::AskNutrition
        );
        // Past-tense logging stays a log even with a question mark.
        assert_eq!(
            heuristic_category("I had a burger for dinner, ok?"),
            IntentCategory::LogFood
        );
    }

    struct JsonProvider(&'static str);

    #[async_trait]
    impl AiProvider for JsonProvider {
        fn name(&self) -> &str {
            "json"
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
        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: self.0.to_string(),
                model: req.model.clone(),
                tokens_in: 10,
                tokens_out: 5,
            })
        }
        async fn chat_with_vision(
            &self,
            req: &ChatRequest,
            _image: &[u8],
        ) -> Result<ChatResponse, ProviderError> {
            self.chat(req).await
        }
        async fn validate_key(&self) -> Result<bool, ProviderError> {
            Ok(true)
        }
    }

    fn allowed() -> Vec<String> {
        vec![
            "nutritionist".to_string(),
            "sleep_expert".to_string(),
            ORCHESTRATOR.to_string(),
        ]
    }

    #[tokio::test]
    async fn model_answer_is_validated_against_closed_sets() {
        let provider =
            JsonProvider(r#"{"category": "log_food", "specialist": "nutritionist", "confidence": 0.9}"#);
        let mut scope = TurnScope::start(1);
        let out = classify_intent(&provider, "I had eggs", None, &allowed(), true, &mut scope).await;
        assert_eq!(out.category, IntentCategory::LogFood);
        assert_eq!(out.specialist, "nutritionist");
        assert!((out.confidence - 0.9).abs() < 1e-9);
        assert_eq!(scope.utility_calls, 1);
    }

    #[tokio::test]
    async fn bogus_model_category_falls_back_to_heuristic() {
        let provider =
            JsonProvider(r#"{"category": "log_snacks", "specialist": "witch_doctor", "confidence": 0.9}"#);
        let mut scope = TurnScope::start(1);
        let out = classify_intent(
            &provider,
            "I had oatmeal for breakfast",
            None,
            &allowed(),
            true,
            &mut scope,
        )
        .await;
        assert_eq!(out.category, IntentCategory::LogFood);
        assert_eq!(out.specialist, "nutritionist");
    }

    #[tokio::test]
    async fn budget_exhaustion_skips_the_model_entirely() {
        let provider = JsonProvider(r#"{"category": "general_chat"}"#);
        let mut scope = TurnScope::start(1);
        let out = classify_intent(
            &provider,
            "I had oatmeal for breakfast",
            None,
            &allowed(),
            false,
            &mut scope,
        )
        .await;
        assert_eq!(out.category, IntentCategory::LogFood);
        assert!((out.confidence - HEURISTIC_CONFIDENCE).abs() < 1e-9);
        assert_eq!(scope.utility_calls, 0);
    }

    #[tokio::test]
    async fn forced_specialist_wins_when_allowed() {
        let provider =
            JsonProvider(r#"{"category": "log_food", "specialist": "nutritionist", "confidence": 0.8}"#);
        let mut scope = TurnScope::start(1);
        let out = classify_intent(
            &provider,
            "I had eggs",
            Some("sleep_expert"),
            &allowed(),
            true,
            &mut scope,
        )
        .await;
        assert_eq!(out.specialist, "sleep_expert");
    }
}
