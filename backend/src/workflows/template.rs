// Template resolution for step configs - {{path}} placeholders over context

use regex::Regex;

/// Result of rendering a template. Unresolved paths render as empty strings
/// and are reported so the step log can flag them; they never fail a step.
#[derive(Debug, Clone, Default)]
pub struct Rendered {
    pub text: String,
    pub unresolved: Vec<String>,
}

pub fn render(template: &str, context: &serde_json::Value) -> Rendered {
    let re = Regex::new(r"\{\{([^}]+)\}\}").unwrap();
    let mut unresolved = Vec::new();

    let text = re
        .replace_all(template, |caps: &regex::Captures| {
            let path = caps[1].trim();
            match super::conditions::lookup_path(context, path) {
                Some(value) => value_to_string(value),
                None => {
                    unresolved.push(path.to_string());
                    String::new()
                }
            }
        })
        .into_owned();

    Rendered { text, unresolved }
}

/// Render every string inside a JSON value, e.g. a webhook payload.
pub fn render_value(value: &serde_json::Value, context: &serde_json::Value) -> (serde_json::Value, Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            let rendered = render(s, context);
            (serde_json::Value::String(rendered.text), rendered.unresolved)
        }
        serde_json::Value::Object(map) => {
            let mut unresolved = Vec::new();
            let rendered = map
                .iter()
                .map(|(k, v)| {
                    let (value, mut missing) = render_value(v, context);
                    unresolved.append(&mut missing);
                    (k.clone(), value)
                })
                .collect();
            (serde_json::Value::Object(rendered), unresolved)
        }
        serde_json::Value::Array(items) => {
            let mut unresolved = Vec::new();
            let rendered = items
                .iter()
                .map(|v| {
                    let (value, mut missing) = render_value(v, context);
                    unresolved.append(&mut missing);
                    value
                })
                .collect();
            (serde_json::Value::Array(rendered), unresolved)
        }
        other => (other.clone(), Vec::new()),
    }
}

pub fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_replaces_paths() {
        let ctx = json!({"camper": {"first_name": "Riley"}, "session": "July A"});
        let rendered = render("Hi {{camper.first_name}}, see you at {{session}}!", &ctx);
        assert_eq!(rendered.text, "Hi Riley, see you at July A!");
        assert!(rendered.unresolved.is_empty());
    }

    #[test]
    fn test_missing_path_renders_empty_and_is_flagged() {
        let ctx = json!({"camper": {"first_name": "Riley"}});
        let rendered = render("Hi {{camper.nickname}}!", &ctx);
        assert_eq!(rendered.text, "Hi !");
        assert_eq!(rendered.unresolved, vec!["camper.nickname".to_string()]);
    }

    #[test]
    fn test_render_numbers_and_bools() {
        let ctx = json!({"age": 14, "paid": true});
        let rendered = render("age={{age}} paid={{paid}}", &ctx);
        assert_eq!(rendered.text, "age=14 paid=true");
    }

    #[test]
    fn test_render_value_walks_payloads() {
        let ctx = json!({"camper": {"id": "c-1"}});
        let payload = json!({
            "camper_id": "{{camper.id}}",
            "tags": ["{{camper.id}}", "static"],
            "count": 3
        });

        let (rendered, unresolved) = render_value(&payload, &ctx);
        assert_eq!(rendered["camper_id"], "c-1");
        assert_eq!(rendered["tags"][0], "c-1");
        assert_eq!(rendered["count"], 3);
        assert!(unresolved.is_empty());
    }
}
