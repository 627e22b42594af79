// Execution context: the trigger snapshot plus the mutable variable bag
// carried between node executions. Persisted back into the execution row
// after every step, never held as ambient state.

use regex::Regex;
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Immutable snapshot of the triggering event's data.
    trigger: Value,
    /// Variables written by nodes during the run.
    vars: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(trigger: Value) -> Self {
        Self {
            trigger,
            vars: Map::new(),
        }
    }

    /// Rehydrate from the `execution_data` column.
    pub fn from_snapshot(snapshot: &Value) -> Self {
        let trigger = snapshot.get("trigger").cloned().unwrap_or(Value::Null);
        let vars = snapshot
            .get("vars")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        Self { trigger, vars }
    }

    /// Serialize for the `execution_data` column.
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "trigger": self.trigger,
            "vars": self.vars,
        })
    }

    pub fn trigger(&self) -> &Value {
        &self.trigger
    }

    pub fn set_var(&mut self, key: &str, value: Value) {
        self.vars.insert(key.to_string(), value);
    }

    /// Look up a dotted path: variables shadow trigger fields.
    pub fn get(&self, path: &str) -> Option<Value> {
        if let Some(value) = self.vars.get(path) {
            return Some(value.clone());
        }
        get_nested_value(&self.trigger, path)
    }

    /// Replace `{{path}}` patterns with values from the context.
    pub fn render(&self, template: &str) -> String {
        let mut result = template.to_string();

        let re = Regex::new(r"\{\{([^}]+)\}\}").unwrap();
        for cap in re.captures_iter(template) {
            let var_path = cap[1].trim();
            if let Some(value) = self.get(var_path) {
                let replacement = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => other.to_string(),
                };
                result = result.replace(&cap[0], &replacement);
            }
        }

        result
    }

    /// Render every string inside a node config.
    pub fn render_config(&self, config: &Value) -> Value {
        match config {
            Value::String(s) => Value::String(self.render(s)),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_config(v)))
                    .collect(),
            ),
            Value::Array(arr) => Value::Array(arr.iter().map(|v| self.render_config(v)).collect()),
            _ => config.clone(),
        }
    }
}

fn get_nested_value(json: &Value, path: &str) -> Option<Value> {
    let mut current = json;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}
