use serde::{Deserialize, Serialize};

/// Closed set of intent categories the router can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    LogFood,
    LogVitals,
    LogExercise,
    LogSupplement,
    LogFasting,
    LogSleep,
    LogHydration,
    IntakeProfile,
    AskNutrition,
    AskExercise,
    AskSleep,
    AskSupplement,
    AskMedical,
    GeneralChat,
}

impl IntentCategory {
    pub const ALL: [IntentCategory; 14] = [
        IntentCategory::LogFood,
        IntentCategory::LogVitals,
        IntentCategory::LogExercise,
        IntentCategory::LogSupplement,
        IntentCategory::LogFasting,
        IntentCategory::LogSleep,
        IntentCategory::LogHydration,
        IntentCategory::IntakeProfile,
        IntentCategory::AskNutrition,
        IntentCategory::AskExercise,
        IntentCategory::AskSleep,
        IntentCategory::AskSupplement,
        IntentCategory::AskMedical,
        IntentCategory::GeneralChat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentCategory::LogFood => "log_food",
            IntentCategory::LogVitals => "log_vitals",
            IntentCategory::LogExercise => "log_exercise",
            IntentCategory::LogSupplement => "log_supplement",
            IntentCategory::LogFasting => "log_fasting",
            IntentCategory::LogSleep => "log_sleep",
            IntentCategory::LogHydration => "log_hydration",
            IntentCategory::IntakeProfile => "intake_profile",
            IntentCategory::AskNutrition => "ask_nutrition",
            IntentCategory::AskExercise => "ask_exercise",
            IntentCategory::AskSleep => "ask_sleep",
            IntentCategory::AskSupplement => "ask_supplement",
            IntentCategory::AskMedical => "ask_medical",
            IntentCategory::GeneralChat => "general_chat",
        }
    }

    pub fn parse(value: &str) -> Option<IntentCategory> {
        Self::ALL.iter().copied().find(|c| c.as_str() == value)
    }

    /// True for categories that trigger the structured log-parse/write path.
    pub fn is_log(&self) -> bool {
        self.as_str().starts_with("log_")
    }

    /// Default specialist id handling this category when the user has no override.
    pub fn default_specialist(&self) -> &'static str {
        match self {
            IntentCategory::LogFood => "nutritionist",
            IntentCategory::LogVitals => "safety_clinician",
            IntentCategory::LogExercise => "movement_coach",
            IntentCategory::LogSupplement => "supplement_auditor",
            IntentCategory::LogFasting => "nutritionist",
            IntentCategory::LogSleep => "sleep_expert",
            IntentCategory::LogHydration => "nutritionist",
            IntentCategory::IntakeProfile => "intake_coach",
            IntentCategory::AskNutrition => "nutritionist",
            IntentCategory::AskExercise => "movement_coach",
            IntentCategory::AskSleep => "sleep_expert",
            IntentCategory::AskSupplement => "supplement_auditor",
            IntentCategory::AskMedical => "safety_clinician",
            IntentCategory::GeneralChat => "orchestrator",
        }
    }
}

impl std::fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-level confidence tag shared by time inference and parse scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Confidence> {
        match value {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }

    /// Combined confidence is the weaker of the two parts.
    pub fn combine(self, other: Confidence) -> Confidence {
        if (self as u8) <= (other as u8) {
            self
        } else {
            other
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-turn response style override requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerbosityMode {
    #[default]
    Normal,
    Summarized,
    Straight,
}

impl VerbosityMode {
    /// Normalize client-supplied verbosity strings, accepting common aliases.
    pub fn parse(value: Option<&str>) -> VerbosityMode {
        let Some(raw) = value else {
            return VerbosityMode::Normal;
        };
        let norm = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "summarized" | "summary" | "summarize" => VerbosityMode::Summarized,
            "straight" | "straight_to_the_point" | "to_the_point" | "direct" => {
                VerbosityMode::Straight
            }
            _ => VerbosityMode::Normal,
        }
    }
}

/// Routing decision: category + specialist + model confidence in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub category: IntentCategory,
    pub specialist: String,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_str() {
        for cat in IntentCategory::ALL {
            assert_eq!(IntentCategory::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(IntentCategory::parse("nonsense"), None);
    }

    #[test]
    fn log_categories_are_flagged() {
        assert!(IntentCategory::LogFood.is_log());
        assert!(IntentCategory::LogSleep.is_log());
        assert!(!IntentCategory::AskNutrition.is_log());
        assert!(!IntentCategory::GeneralChat.is_log());
    }

    #[test]
    fn confidence_combines_to_minimum() {
        assert_eq!(
            Confidence::High.combine(Confidence::Low),
            Confidence::Low
        );
        assert_eq!(
            Confidence::Medium.combine(Confidence::High),
            Confidence::Medium
        );
        assert_eq!(
            Confidence::High.combine(Confidence::High),
            Confidence::High
        );
    }

    #[test]
    fn verbosity_accepts_aliases() {
        assert_eq!(VerbosityMode::parse(Some("summary")), VerbosityMode::Summarized);
        assert_eq!(
            VerbosityMode::parse(Some("straight-to-the-point")),
            VerbosityMode::Straight
        );
        assert_eq!(VerbosityMode::parse(Some("loud")), VerbosityMode::Normal);
        assert_eq!(VerbosityMode::parse(None), VerbosityMode::Normal);
    }
}
