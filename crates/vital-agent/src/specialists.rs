//! Specialist personas: default prompt bundles, per-user overrides, and the
//! enabled-id list the router validates against.

use serde_json::Value;
use vital_core::jsonx::parse_loose_json;

pub const ORCHESTRATOR: &str = "orchestrator";

/// (id, display name, persona prompt) for the built-in specialists.
pub const DEFAULT_SPECIALISTS: &[(&str, &str, &str)] = &[
    (
        "nutritionist",
        "Nutritionist",
        "You are the nutrition specialist. Focus on food quality, macros, meal \
         structure, and sustainable eating patterns. Keep portion estimates \
         realistic and flag sodium-heavy days.",
    ),
    (
        "movement_coach",
        "Movement Coach",
        "You are the movement specialist. Focus on training structure, recovery, \
         progressive overload, and Zone 2 / strength balance. Scale advice to the \
         user's fitness level.",
    ),
    (
        "sleep_expert",
        "Sleep Expert",
        "You are the sleep specialist. Focus on sleep duration, consistency, \
         wind-down routines, and circadian alignment.",
    ),
    (
        "supplement_auditor",
        "Supplement Auditor",
        "You are the supplement specialist. Focus on dosing, timing, interactions, \
         and trimming redundant products. Never invent products the user does not \
         take.",
    ),
    (
        "safety_clinician",
        "Safety Clinician",
        "You are the safety specialist. Focus on vitals trends, red flags, and \
         when to involve a clinician. You surface framework-aligned guidance and \
         defer clinical decisions to the user's care team.",
    ),
    (
        "intake_coach",
        "Intake Coach",
        "You are the intake specialist. Help the user complete their baseline \
         profile: demographics, conditions, medications, supplements, and goals.",
    ),
    (
        ORCHESTRATOR,
        "Coach",
        "",
    ),
];

const BASE_SYSTEM_PROMPT: &str = "You are a personal health coach. You track the user's \
nutrition, hydration, vitals, exercise, supplements, fasting, and sleep, and coach them \
toward their stated goals. Be concrete, cite the user's own data, and never claim an \
event was saved unless the write status says so. Surface framework-aligned guidance and \
defer clinical decisions to the user and their clinician.";

/// Parsed per-user specialist overrides.
///
/// Stored JSON shape:
/// `{"system_prompt": "...", "specialists": [{"id", "name", "prompt", "enabled"}]}`
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub system_prompt: Option<String>,
    pub specialists: Vec<SpecialistOverride>,
}

#[derive(Debug, Clone)]
pub struct SpecialistOverride {
    pub id: String,
    pub name: Option<String>,
    pub prompt: Option<String>,
    pub enabled: bool,
}

pub fn parse_overrides(raw: Option<&str>) -> Overrides {
    let Some(raw) = raw else {
        return Overrides::default();
    };
    let Some(Value::Object(map)) = parse_loose_json(raw) else {
        return Overrides::default();
    };
    let system_prompt = map
        .get("system_prompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let specialists = map
        .get("specialists")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_object)
                .filter_map(|o| {
                    let id = o.get("id")?.as_str()?.trim().to_string();
                    if id.is_empty() {
                        return None;
                    }
                    Some(SpecialistOverride {
                        id,
                        name: o
                            .get("name")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string),
                        prompt: o
                            .get("prompt")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string),
                        enabled: o.get("enabled").and_then(Value::as_bool).unwrap_or(true),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Overrides {
        system_prompt,
        specialists,
    }
}

pub fn get_system_prompt(overrides: &Overrides) -> String {
    overrides
        .system_prompt
        .clone()
        .unwrap_or_else(|| BASE_SYSTEM_PROMPT.to_string())
}

pub fn get_specialist_prompt(specialist_id: &str, overrides: &Overrides) -> Option<String> {
    if let Some(o) = overrides.specialists.iter().find(|o| o.id == specialist_id) {
        if let Some(prompt) = &o.prompt {
            return Some(prompt.clone());
        }
    }
    DEFAULT_SPECIALISTS
        .iter()
        .find(|(id, _, _)| *id == specialist_id)
        .map(|(_, _, prompt)| prompt.to_string())
        .filter(|p| !p.is_empty())
}

/// Enabled specialist ids: the default set minus explicit disables, plus any
/// enabled custom ids from the overrides. The orchestrator is always present.
pub fn enabled_specialist_ids(overrides: &Overrides) -> Vec<String> {
    let mut ids: Vec<String> = DEFAULT_SPECIALISTS
        .iter()
        .map(|(id, _, _)| id.to_string())
        .filter(|id| {
            overrides
                .specialists
                .iter()
                .find(|o| &o.id == id)
                .map(|o| o.enabled)
                .unwrap_or(true)
        })
        .collect();
    for o in &overrides.specialists {
        if o.enabled && !ids.contains(&o.id) {
            ids.push(o.id.clone());
        }
    }
    if !ids.iter().any(|id| id == ORCHESTRATOR) {
        ids.push(ORCHESTRATOR.to_string());
    }
    ids
}

pub fn resolve_specialist_name(overrides: &Overrides, specialist_id: &str) -> String {
    if let Some(o) = overrides.specialists.iter().find(|o| o.id == specialist_id) {
        if let Some(name) = &o.name {
            return name.clone();
        }
    }
    DEFAULT_SPECIALISTS
        .iter()
        .find(|(id, _, _)| *id == specialist_id)
        .map(|(_, name, _)| name.to_string())
        .unwrap_or_else(|| {
            specialist_id
                .split('_')
                .map(|part| {
                    let mut chars = part.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_overrides() {
        let overrides = parse_overrides(None);
        let ids = enabled_specialist_ids(&overrides);
        assert!(ids.contains(&"nutritionist".to_string()));
        assert!(ids.contains(&ORCHESTRATOR.to_string()));
        assert!(get_specialist_prompt("sleep_expert", &overrides)
            .unwrap()
            .contains("sleep"));
        assert!(get_specialist_prompt(ORCHESTRATOR, &overrides).is_none());
    }

    #[test]
    fn overrides_disable_and_add_specialists() {
        let raw = r#"{
            "system_prompt": "Custom base.",
            "specialists": [
                {"id": "sleep_expert", "enabled": false},
                {"id": "longevity_guru", "name": "Longevity Guru", "prompt": "Be long-term.", "enabled": true}
            ]
        }"#;
        let overrides = parse_overrides(Some(raw));
        assert_eq!(get_system_prompt(&overrides), "Custom base.");
        let ids = enabled_specialist_ids(&overrides);
        assert!(!ids.contains(&"sleep_expert".to_string()));
        assert!(ids.contains(&"longevity_guru".to_string()));
        assert_eq!(
            get_specialist_prompt("longevity_guru", &overrides).as_deref(),
            Some("Be long-term.")
        );
        assert_eq!(
            resolve_specialist_name(&overrides, "longevity_guru"),
            "Longevity Guru"
        );
    }

    #[test]
    fn unknown_specialist_names_title_case() {
        let overrides = Overrides::default();
        assert_eq!(resolve_specialist_name(&overrides, "gut_biome_coach"), "Gut Biome Coach");
    }
}
