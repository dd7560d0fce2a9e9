//! Structured goal tools. `create_goal` and `update_goal` are the only
//! AI-callable writes in the registry.

use serde_json::{json, Map, Value};
use vital_store::goals;
use vital_store::types::UserGoalRow;

use super::{arg_f64, arg_i64, arg_str, require_str, ToolContext, ToolError, ToolRegistry, ToolResult, ToolSpec};

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

fn goal_to_value(goal: &UserGoalRow) -> Value {
    // Progress toward target as a clamped percentage, when all three anchor
    // values are present.
    let progress_pct = match (goal.baseline_value, goal.target_value, goal.current_value) {
        (Some(baseline), Some(target), Some(current)) if target != baseline => {
            let pct = ((current - baseline) / (target - baseline)) * 100.0;
            Some((pct.clamp(0.0, 100.0) * 10.0).round() / 10.0)
        }
        _ => None,
    };
    json!({
        "id": goal.id,
        "title": goal.title,
        "description": goal.description,
        "goal_type": goal.goal_type,
        "target_value": goal.target_value,
        "target_unit": goal.target_unit,
        "baseline_value": goal.baseline_value,
        "current_value": goal.current_value,
        "target_date": goal.target_date,
        "status": goal.status,
        "priority": goal.priority,
        "why": goal.why,
        "created_by": goal.created_by,
        "progress_pct": progress_pct,
    })
}

fn normalize_goal_type(raw: Option<&str>) -> String {
    let t = raw.unwrap_or("custom").trim().to_lowercase();
    if VALID_GOAL_TYPES.contains(&t.as_str()) {
        t
    } else {
        "custom".to_string()
    }
}

fn tool_create_goal(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let title = require_str(args, "title")?;
    let goal_type = normalize_goal_type(arg_str(args, "goal_type"));
    let priority = arg_i64(args, "priority")?.unwrap_or(3).clamp(1, 5);

    let goal = goals::insert_goal(
        ctx.conn,
        ctx.user_id,
        &goals::NewGoal {
            title,
            description: arg_str(args, "description"),
            goal_type: &goal_type,
            target_value: arg_f64(args, "target_value")?,
            target_unit: arg_str(args, "target_unit"),
            baseline_value: arg_f64(args, "baseline_value")?,
            target_date: arg_str(args, "target_date"),
            priority,
            why: arg_str(args, "why"),
        },
    )?;
    Ok(json!({ "success": true, "goal": goal_to_value(&goal) }))
}

fn tool_update_goal(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let goal_id = arg_i64(args, "goal_id")?
        .ok_or_else(|| ToolError::Validation("`goal_id` must be an integer".to_string()))?;
    if goals::get_goal(ctx.conn, ctx.user_id, goal_id)?.is_none() {
        return Err(ToolError::NotFound(format!("Goal {goal_id} not found")));
    }

    let status = match arg_str(args, "status") {
        Some(raw) => {
            let s = raw.trim().to_lowercase();
            if !VALID_STATUSES.contains(&s.as_str()) {
                return Err(ToolError::Validation(format!(
                    "`status` must be one of {}",
                    VALID_STATUSES.join(", ")
                )));
            }
            Some(s)
        }
        None => None,
    };
    let goal_type = arg_str(args, "goal_type").map(|raw| normalize_goal_type(Some(raw)));

    let patch = goals::GoalPatch {
        title: arg_str(args, "title"),
        description: args
            .contains_key("description")
            .then(|| arg_str(args, "description")),
        goal_type: goal_type.as_deref(),
        target_value: arg_f64(args, "target_value")?,
        target_unit: args
            .contains_key("target_unit")
            .then(|| arg_str(args, "target_unit")),
        baseline_value: arg_f64(args, "baseline_value")?,
        current_value: arg_f64(args, "current_value")?,
        target_date: args
            .contains_key("target_date")
            .then(|| arg_str(args, "target_date")),
        status: status.as_deref(),
        priority: arg_i64(args, "priority")?.map(|p| p.clamp(1, 5)),
        why: args.contains_key("why").then(|| arg_str(args, "why")),
    };
    let goal = goals::update_goal(ctx.conn, ctx.user_id, goal_id, &patch)?;
    Ok(json!({ "success": true, "goal": goal_to_value(&goal) }))
}

fn tool_list_goals(args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let status_filter = arg_str(args, "status").unwrap_or("active").to_lowercase();
    let status = (status_filter != "all").then_some(status_filter.as_str());
    let rows = goals::goals_by_status(ctx.conn, ctx.user_id, status)?;
    Ok(json!({
        "goals": rows.iter().map(goal_to_value).collect::<Vec<_>>(),
        "count": rows.len(),
    }))
}

pub fn register_goal_tools(registry: &mut ToolRegistry) {
    registry.register(
        ToolSpec {
            name: "create_goal",
            description: "Create a new structured health goal for the user. Call this after the \
                          user specifies a goal with a clear target and timeline. Required: \
                          title. Recommended: goal_type, target_value, target_unit, \
                          baseline_value, target_date, priority, why.",
            required_fields: &["title"],
            read_only: false,
            allowed_specialists: None,
            tags: &["goals"],
        },
        tool_create_goal,
    );
    registry.register(
        ToolSpec {
            name: "update_goal",
            description: "Update an existing health goal. Use this when the user reports \
                          progress (update current_value), changes a target, or wants to \
                          pause/complete/abandon a goal. Required: goal_id. Include only the \
                          fields to change.",
            required_fields: &["goal_id"],
            read_only: false,
            allowed_specialists: None,
            tags: &["goals"],
        },
        tool_update_goal,
    );
    registry.register(
        ToolSpec {
            name: "list_goals",
            description: "List the user's health goals. Returns goals filtered by status \
                          (default: active). Use status='all' to see all goals.",
            required_fields: &[],
            read_only: true,
            allowed_specialists: None,
            tags: &["goals"],
        },
        tool_list_goals,
    );
}

#[cfg(test)]
mod tests {
    use super::super::testutil::test_config;
    use super::super::{ToolContext, ToolRegistry};
    use chrono::Utc;
    use serde_json::json;
    use vital_store::users::create_user;
    use vital_store::Store;

    fn setup() -> (Store, i64, ToolRegistry) {
        let store = Store::open_in_memory().unwrap();
        let user_id = {
            let conn = store.conn();
            create_user(&conn, "a", "A").unwrap().id
        };
        (store, user_id, ToolRegistry::with_default_tools())
    }

    #[test]
    fn create_then_update_then_list() {
        let (store, user_id, registry) = setup();
        let conn = store.conn();
        let ctx = ToolContext::new(&conn, user_id, "orchestrator", Utc::now(), test_config());

        let created = registry
            .execute(
                "create_goal",
                &json!({
                    "title": "Reach 82 kg",
                    "goal_type": "weight_loss",
                    "target_value": 82.0,
                    "target_unit": "kg",
                    "baseline_value": 90.0,
                    "target_date": "2026-06-01",
                    "priority": 1,
                }),
                &ctx,
            )
            .unwrap();
        let goal_id = created["goal"]["id"].as_i64().unwrap();
        assert_eq!(created["goal"]["status"], "active");
        assert_eq!(created["goal"]["progress_pct"], 0.0);

        let updated = registry
            .execute(
                "update_goal",
                &json!({ "goal_id": goal_id, "current_value": 86.0 }),
                &ctx,
            )
            .unwrap();
        assert_eq!(updated["goal"]["progress_pct"], 50.0);

        let listed = registry.execute("list_goals", &json!({}), &ctx).unwrap();
        assert_eq!(listed["count"], 1);
    }

    #[test]
    fn update_rejects_foreign_and_missing_goals() {
        let (store, user_id, registry) = setup();
        let conn = store.conn();
        let other = create_user(&conn, "b", "B").unwrap();
        let foreign = vital_store::goals::insert_goal(
            &conn,
            other.id,
            &vital_store::goals::NewGoal {
                title: "Other user's goal",
                description: None,
                goal_type: "habit",
                target_value: None,
                target_unit: None,
                baseline_value: None,
                target_date: None,
                priority: 3,
                why: None,
            },
        )
        .unwrap();

        let ctx = ToolContext::new(&conn, user_id, "orchestrator", Utc::now(), test_config());
        // User scoping is applied by the tool: another user's goal is unreachable.
        let err = registry.execute("update_goal", &json!({ "goal_id": foreign.id }), &ctx);
        assert!(err.is_err());

        let bad_status = registry.execute(
            "update_goal",
            &json!({ "goal_id": foreign.id, "status": "won" }),
            &ctx,
        );
        assert!(bad_status.is_err());
    }
}
