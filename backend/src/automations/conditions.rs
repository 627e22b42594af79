// Condition evaluation: trigger-config filters checked before a run starts,
// and the field conditions evaluated by condition nodes mid-run.

use serde_json::Value;
use uuid::Uuid;

use super::context::ExecutionContext;

/// Sentinel accepted in `filter_user_id`: the subject must currently be
/// assigned to the automation's creator.
const ASSIGNED_TO_ME: &str = "__me__";

/// Decide whether an automation's trigger filters accept an event. Pure
/// function; all checks AND together and an unspecified filter is a
/// wildcard. Rejection skips this automation only.
pub fn trigger_filters_pass(
    trigger_type: &str,
    trigger_config: &Value,
    event_data: &Value,
    created_by: Option<Uuid>,
    subject_assignee: Option<Uuid>,
) -> bool {
    if !assigned_filter_passes(trigger_config, created_by, subject_assignee) {
        return false;
    }

    match trigger_type {
        "message_received" => {
            if let Some(session_filter) = non_empty_str(trigger_config, "session_id") {
                match event_data.get("session_id").and_then(|v| v.as_str()) {
                    Some(session_id) if session_id == session_filter => {}
                    _ => return false,
                }
            }
            if let Some(channel_filter) = non_empty_str(trigger_config, "channel") {
                match event_data.get("channel").and_then(|v| v.as_str()) {
                    Some(channel) if channel.eq_ignore_ascii_case(channel_filter) => {}
                    _ => return false,
                }
            }
            if let Some(keyword) = non_empty_str(trigger_config, "keyword") {
                let message = event_data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if !message.to_lowercase().contains(&keyword.to_lowercase()) {
                    return false;
                }
            }
            true
        }
        "lead_stage_changed" | "stage_change" => {
            if let Some(from_filter) = non_empty_str(trigger_config, "from_stage_id") {
                match event_data.get("old_stage_id").and_then(|v| v.as_str()) {
                    Some(old_stage) if old_stage == from_filter => {}
                    _ => return false,
                }
            }
            if let Some(to_filter) = non_empty_str(trigger_config, "to_stage_id") {
                match event_data.get("new_stage_id").and_then(|v| v.as_str()) {
                    Some(new_stage) if new_stage == to_filter => {}
                    _ => return false,
                }
            }
            true
        }
        "tag_added" | "tag_removed" => {
            if let Some(tag_filter) = non_empty_str(trigger_config, "tag_id") {
                match event_data.get("tag_id").and_then(|v| v.as_str()) {
                    Some(tag_id) if tag_id == tag_filter => {}
                    _ => return false,
                }
            }
            true
        }
        // lead_created, lead_assigned, manual, scheduled: no further checks
        _ => true,
    }
}

fn assigned_filter_passes(
    trigger_config: &Value,
    created_by: Option<Uuid>,
    subject_assignee: Option<Uuid>,
) -> bool {
    let Some(filter) = non_empty_str(trigger_config, "filter_user_id") else {
        return true;
    };

    let required = if filter == ASSIGNED_TO_ME {
        created_by
    } else {
        filter.parse().ok()
    };

    match required {
        Some(user_id) => subject_assignee == Some(user_id),
        // Unparseable filter value can never match; reject rather than run.
        None => false,
    }
}

fn non_empty_str<'a>(config: &'a Value, field: &str) -> Option<&'a str> {
    config.get(field).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

/// Evaluate a condition node's `{field, operator, value}` config against the
/// execution context (trigger snapshot + variables). Returns the branch the
/// node takes.
pub fn evaluate_field_condition(config: &Value, ctx: &ExecutionContext) -> Result<bool, String> {
    let field = config
        .get("field")
        .and_then(|v| v.as_str())
        .ok_or("condition node config is missing 'field'")?;
    let operator = config
        .get("operator")
        .and_then(|v| v.as_str())
        .unwrap_or("equals");
    let expected = config.get("value").cloned().unwrap_or(Value::Null);

    let actual = ctx.get(field);

    let result = match operator {
        "equals" | "eq" => actual.as_ref() == Some(&expected),
        "not_equals" | "ne" => actual.as_ref() != Some(&expected),
        "contains" => string_pair(&actual, &expected)
            .map(|(s, pattern)| s.to_lowercase().contains(&pattern.to_lowercase()))
            .unwrap_or(false),
        "not_contains" => string_pair(&actual, &expected)
            .map(|(s, pattern)| !s.to_lowercase().contains(&pattern.to_lowercase()))
            .unwrap_or(true),
        "starts_with" => string_pair(&actual, &expected)
            .map(|(s, pattern)| s.to_lowercase().starts_with(&pattern.to_lowercase()))
            .unwrap_or(false),
        "ends_with" => string_pair(&actual, &expected)
            .map(|(s, pattern)| s.to_lowercase().ends_with(&pattern.to_lowercase()))
            .unwrap_or(false),
        "greater_than" | "gt" => number_pair(&actual, &expected)
            .map(|(a, b)| a > b)
            .unwrap_or(false),
        "less_than" | "lt" => number_pair(&actual, &expected)
            .map(|(a, b)| a < b)
            .unwrap_or(false),
        "in" => match (&actual, expected.as_array()) {
            (Some(value), Some(list)) => list.contains(value),
            _ => false,
        },
        "is_null" | "is_empty" => matches!(actual, None | Some(Value::Null)),
        "is_not_null" | "is_not_empty" => !matches!(actual, None | Some(Value::Null)),
        other => return Err(format!("unsupported condition operator '{}'", other)),
    };

    Ok(result)
}

fn string_pair<'a>(actual: &'a Option<Value>, expected: &'a Value) -> Option<(&'a str, &'a str)> {
    match (actual.as_ref().and_then(|v| v.as_str()), expected.as_str()) {
        (Some(a), Some(b)) => Some((a, b)),
        _ => None,
    }
}

fn number_pair(actual: &Option<Value>, expected: &Value) -> Option<(f64, f64)> {
    match (actual.as_ref().and_then(|v| v.as_f64()), expected.as_f64()) {
        (Some(a), Some(b)) => Some((a, b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keyword_match_is_case_insensitive() {
        let config = json!({ "keyword": "Pricing" });
        let data = json!({ "message": "can you send me the PRICING table?" });
        assert!(trigger_filters_pass("message_received", &config, &data, None, None));

        let miss = json!({ "message": "hello there" });
        assert!(!trigger_filters_pass("message_received", &config, &miss, None, None));
    }

    #[test]
    fn test_session_filter() {
        let session = Uuid::new_v4();
        let config = json!({ "session_id": session.to_string() });

        let hit = json!({ "session_id": session.to_string(), "message": "hi" });
        assert!(trigger_filters_pass("message_received", &config, &hit, None, None));

        let other = json!({ "session_id": Uuid::new_v4().to_string(), "message": "hi" });
        assert!(!trigger_filters_pass("message_received", &config, &other, None, None));
    }

    #[test]
    fn test_stage_filters_wildcard_when_unspecified() {
        let data = json!({
            "old_stage_id": Uuid::new_v4().to_string(),
            "new_stage_id": Uuid::new_v4().to_string()
        });

        // neither specified
        assert!(trigger_filters_pass("lead_stage_changed", &json!({}), &data, None, None));
        // legacy spelling behaves identically
        assert!(trigger_filters_pass("stage_change", &json!({}), &data, None, None));
    }

    #[test]
    fn test_stage_filters_both_specified() {
        let from = Uuid::new_v4();
        let to = Uuid::new_v4();
        let config = json!({ "from_stage_id": from.to_string(), "to_stage_id": to.to_string() });

        let hit = json!({ "old_stage_id": from.to_string(), "new_stage_id": to.to_string() });
        assert!(trigger_filters_pass("lead_stage_changed", &config, &hit, None, None));

        let wrong_from = json!({
            "old_stage_id": Uuid::new_v4().to_string(),
            "new_stage_id": to.to_string()
        });
        assert!(!trigger_filters_pass("lead_stage_changed", &config, &wrong_from, None, None));
    }

    #[test]
    fn test_tag_filter_exact_match() {
        let tag = Uuid::new_v4();
        let config = json!({ "tag_id": tag.to_string() });

        let hit = json!({ "tag_id": tag.to_string() });
        assert!(trigger_filters_pass("tag_added", &config, &hit, None, None));

        let other = json!({ "tag_id": Uuid::new_v4().to_string() });
        assert!(!trigger_filters_pass("tag_added", &config, &other, None, None));
        assert!(!trigger_filters_pass("tag_removed", &config, &other, None, None));
    }

    #[test]
    fn test_assigned_to_me_filter() {
        let creator = Uuid::new_v4();
        let config = json!({ "filter_user_id": "__me__" });
        let data = json!({});

        assert!(trigger_filters_pass("lead_created", &config, &data, Some(creator), Some(creator)));
        assert!(!trigger_filters_pass(
            "lead_created",
            &config,
            &data,
            Some(creator),
            Some(Uuid::new_v4())
        ));
        assert!(!trigger_filters_pass("lead_created", &config, &data, Some(creator), None));
    }

    #[test]
    fn test_assigned_to_concrete_user_filter() {
        let user = Uuid::new_v4();
        let config = json!({ "filter_user_id": user.to_string() });
        let data = json!({});

        assert!(trigger_filters_pass("tag_added", &config, &data, None, Some(user)));
        assert!(!trigger_filters_pass("tag_added", &config, &data, None, Some(Uuid::new_v4())));
    }

    #[test]
    fn test_lead_created_has_no_extra_conditions() {
        assert!(trigger_filters_pass("lead_created", &json!({}), &json!({}), None, None));
    }

    #[test]
    fn test_field_condition_operators() {
        let mut ctx = ExecutionContext::new(json!({ "message": "Hello World", "count": 3 }));
        ctx.set_var("status", json!("open"));

        let contains = json!({ "field": "message", "operator": "contains", "value": "world" });
        assert!(evaluate_field_condition(&contains, &ctx).unwrap());

        let gt = json!({ "field": "count", "operator": "greater_than", "value": 2 });
        assert!(evaluate_field_condition(&gt, &ctx).unwrap());

        let var_eq = json!({ "field": "status", "operator": "equals", "value": "open" });
        assert!(evaluate_field_condition(&var_eq, &ctx).unwrap());

        let missing = json!({ "field": "nope", "operator": "is_null" });
        assert!(evaluate_field_condition(&missing, &ctx).unwrap());

        let bad_operator = json!({ "field": "count", "operator": "xor", "value": 1 });
        assert!(evaluate_field_condition(&bad_operator, &ctx).is_err());
    }
}
