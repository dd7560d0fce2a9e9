//! The `time_now` tool: authoritative current date/time in the user's zone.

use serde_json::{json, Map, Value};
use vital_core::timeinfer::resolve_tz;

use super::{ToolContext, ToolRegistry, ToolResult, ToolSpec};

fn tool_time_now(_args: &Map<String, Value>, ctx: &ToolContext<'_>) -> ToolResult {
    let tz = resolve_tz(ctx.timezone().as_deref());
    let local = ctx.reference_utc.with_timezone(&tz);
    Ok(json!({
        "timezone": tz.name(),
        "utc_offset": local.format("UTC%:z").to_string(),
        "local_date": local.format("%Y-%m-%d").to_string(),
        "local_time_12h": local.format("%-I:%M %p").to_string(),
        "local_time_24h": local.format("%H:%M").to_string(),
        "iso_local": local.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "iso_utc": ctx.reference_utc.to_rfc3339(),
        "weekday": local.format("%A").to_string(),
    }))
}

pub fn register_time_tools(registry: &mut ToolRegistry) {
    registry.register(
        ToolSpec {
            name: "time_now",
            description: "Current date/time in the user's timezone for authoritative time answers.",
            required_fields: &[],
            read_only: true,
            allowed_specialists: None,
            tags: &["time", "read"],
        },
        tool_time_now,
    );
}

#[cfg(test)]
mod tests {
    use super::super::testutil::test_config;
    use super::*;
    use chrono::{DateTime, Utc};
    use vital_store::users::{create_user, set_settings_field};
    use vital_store::Store;

    #[test]
    fn time_now_reports_local_wall_clock() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let user = create_user(&conn, "a", "A").unwrap();
        set_settings_field(&conn, user.id, "timezone", Some("America/Edmonton")).unwrap();

        let reference = DateTime::parse_from_rfc3339("2026-02-21T16:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let ctx = ToolContext::new(&conn, user.id, "orchestrator", reference, test_config());
        let out = tool_time_now(&Map::new(), &ctx).unwrap();
        assert_eq!(out["timezone"], "America/Edmonton");
        assert_eq!(out["local_date"], "2026-02-21");
        assert_eq!(out["local_time_24h"], "09:00");
        assert_eq!(out["local_time_12h"], "9:00 AM");
        assert_eq!(out["weekday"], "Saturday");
    }
}
