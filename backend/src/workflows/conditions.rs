// Workflow Conditions - trigger predicates and inline step expressions

use serde::{Deserialize, Serialize};

use super::template;

/// A single condition over an event payload or execution context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Field to evaluate; supports dot notation for nested fields.
    pub field: String,
    pub operator: String,
    pub value: serde_json::Value,
}

/// Group of conditions combined with AND/OR logic. Groups nest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionGroup {
    pub logic: String,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
}

impl ConditionGroup {
    pub fn and(conditions: Vec<Condition>) -> Self {
        Self {
            logic: "AND".to_string(),
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self {
            logic: "OR".to_string(),
            conditions,
            groups: Vec::new(),
        }
    }

    /// Evaluate against a payload. Errors (unknown operators, malformed
    /// comparands) propagate so the caller can log and skip this workflow
    /// without affecting others.
    pub fn evaluate(&self, payload: &serde_json::Value) -> Result<bool, String> {
        let mut results = Vec::with_capacity(self.conditions.len() + self.groups.len());
        for condition in &self.conditions {
            results.push(condition.evaluate(payload)?);
        }
        for group in &self.groups {
            results.push(group.evaluate(payload)?);
        }

        Ok(match self.logic.to_ascii_uppercase().as_str() {
            "OR" => results.iter().any(|&r| r),
            _ => results.iter().all(|&r| r),
        })
    }
}

impl Condition {
    pub fn new(field: &str, operator: &str, value: serde_json::Value) -> Self {
        Self {
            field: field.to_string(),
            operator: operator.to_string(),
            value,
        }
    }

    pub fn equals(field: &str, value: serde_json::Value) -> Self {
        Self::new(field, "equals", value)
    }

    pub fn greater_than(field: &str, value: f64) -> Self {
        Self::new(field, "greater_than", serde_json::json!(value))
    }

    pub fn in_list(field: &str, values: Vec<serde_json::Value>) -> Self {
        Self::new(field, "in", serde_json::Value::Array(values))
    }

    fn evaluate(&self, payload: &serde_json::Value) -> Result<bool, String> {
        let field_value = lookup_path(payload, &self.field);

        match self.operator.as_str() {
            "equals" | "eq" | "==" => Ok(field_value.map(|v| v == &self.value).unwrap_or(false)),
            "not_equals" | "ne" | "!=" => {
                Ok(field_value.map(|v| v != &self.value).unwrap_or(true))
            }
            "contains" => {
                let pattern = self
                    .value
                    .as_str()
                    .ok_or_else(|| format!("'contains' needs a string value for '{}'", self.field))?;
                Ok(field_value
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_lowercase().contains(&pattern.to_lowercase()))
                    .unwrap_or(false))
            }
            "greater_than" | "gt" | ">" => self.numeric(field_value, |v, c| v > c),
            "greater_than_or_equals" | "gte" | ">=" => self.numeric(field_value, |v, c| v >= c),
            "less_than" | "lt" | "<" => self.numeric(field_value, |v, c| v < c),
            "less_than_or_equals" | "lte" | "<=" => self.numeric(field_value, |v, c| v <= c),
            "in" => {
                let list = self
                    .value
                    .as_array()
                    .ok_or_else(|| format!("'in' needs an array value for '{}'", self.field))?;
                Ok(field_value.map(|v| list.contains(v)).unwrap_or(false))
            }
            "not_in" => {
                let list = self
                    .value
                    .as_array()
                    .ok_or_else(|| format!("'not_in' needs an array value for '{}'", self.field))?;
                Ok(field_value.map(|v| !list.contains(v)).unwrap_or(true))
            }
            "is_null" => Ok(field_value.is_none() || field_value == Some(&serde_json::Value::Null)),
            "is_not_null" => {
                Ok(field_value.is_some() && field_value != Some(&serde_json::Value::Null))
            }
            other => Err(format!("unknown condition operator '{}'", other)),
        }
    }

    fn numeric<F>(&self, field_value: Option<&serde_json::Value>, cmp: F) -> Result<bool, String>
    where
        F: Fn(f64, f64) -> bool,
    {
        let comparand = self.value.as_f64().ok_or_else(|| {
            format!(
                "operator '{}' needs a numeric value for '{}'",
                self.operator, self.field
            )
        })?;
        Ok(field_value
            .and_then(|v| v.as_f64())
            .map(|v| cmp(v, comparand))
            .unwrap_or(false))
    }
}

/// Resolve a dotted path against a JSON value.
pub fn lookup_path<'a>(
    value: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Evaluate an inline step expression of the form `{{path}} OP literal`.
/// An unresolved path makes the comparison false; it never errors. This is
/// the evaluator behind `if_else` conditions and step-level gates.
pub fn evaluate_expression(expression: &str, context: &serde_json::Value) -> bool {
    // Longest operators first so ">=" is not read as ">".
    const OPERATORS: [&str; 7] = [">=", "<=", "==", "!=", ">", "<", " contains "];

    let (lhs, operator, rhs) = match OPERATORS.iter().find_map(|op| {
        expression
            .find(op)
            .map(|at| (&expression[..at], *op, &expression[at + op.len()..]))
    }) {
        Some(parts) => parts,
        None => return false,
    };

    let lhs = lhs.trim();
    let path = lhs
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(lhs);

    let left = match lookup_path(context, path) {
        Some(value) => template::value_to_string(value),
        None => return false,
    };
    let right = rhs.trim().trim_matches('"').trim_matches('\'');

    match operator.trim() {
        "==" => compare_eq(&left, right),
        "!=" => !compare_eq(&left, right),
        "contains" => left.to_lowercase().contains(&right.to_lowercase()),
        op => match (left.parse::<f64>(), right.parse::<f64>()) {
            (Ok(l), Ok(r)) => match op {
                ">" => l > r,
                "<" => l < r,
                ">=" => l >= r,
                "<=" => l <= r,
                _ => false,
            },
            _ => false,
        },
    }
}

fn compare_eq(left: &str, right: &str) -> bool {
    match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => l == r,
        _ => left == right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_group_and_or() {
        let payload = json!({"age": 14, "session": "july"});

        let both = ConditionGroup::and(vec![
            Condition::greater_than("age", 12.0),
            Condition::equals("session", json!("july")),
        ]);
        assert!(both.evaluate(&payload).unwrap());

        let either = ConditionGroup::or(vec![
            Condition::equals("session", json!("august")),
            Condition::greater_than("age", 12.0),
        ]);
        assert!(either.evaluate(&payload).unwrap());

        let neither = ConditionGroup::and(vec![
            Condition::equals("session", json!("august")),
            Condition::greater_than("age", 12.0),
        ]);
        assert!(!neither.evaluate(&payload).unwrap());
    }

    #[test]
    fn test_dotted_path_lookup() {
        let payload = json!({"camper": {"medical": {"allergies": "peanuts"}}});
        let condition = Condition::new("camper.medical.allergies", "contains", json!("peanut"));
        assert!(condition.evaluate(&payload).unwrap());
    }

    #[test]
    fn test_missing_field_is_false_not_error() {
        let payload = json!({"age": 14});
        assert!(!Condition::equals("grade", json!(8))
            .evaluate(&payload)
            .unwrap());
        assert!(!Condition::greater_than("grade", 5.0)
            .evaluate(&payload)
            .unwrap());
    }

    #[test]
    fn test_unknown_operator_is_an_error() {
        let condition = Condition::new("age", "sounds_like", json!(14));
        assert!(condition.evaluate(&json!({"age": 14})).is_err());
    }

    #[test]
    fn test_in_list() {
        let payload = json!({"session": "july"});
        let condition = Condition::in_list("session", vec![json!("june"), json!("july")]);
        assert!(condition.evaluate(&payload).unwrap());
    }

    #[test]
    fn test_nested_groups() {
        let payload = json!({"age": 9, "cabin": "pine"});
        let inner = ConditionGroup::or(vec![
            Condition::equals("cabin", json!("pine")),
            Condition::equals("cabin", json!("oak")),
        ]);
        let mut outer = ConditionGroup::and(vec![Condition::new("age", "less_than", json!(12))]);
        outer.groups.push(inner);
        assert!(outer.evaluate(&payload).unwrap());
    }

    #[test]
    fn test_expression_operators() {
        let ctx = json!({"age": 14, "name": "Riley", "balance": 120.5});

        assert!(evaluate_expression("{{age}} > 12", &ctx));
        assert!(evaluate_expression("{{age}} >= 14", &ctx));
        assert!(!evaluate_expression("{{age}} < 10", &ctx));
        assert!(evaluate_expression("{{age}} <= 14", &ctx));
        assert!(evaluate_expression("{{age}} == 14", &ctx));
        assert!(evaluate_expression("{{age}} != 15", &ctx));
        assert!(evaluate_expression("{{name}} == Riley", &ctx));
        assert!(evaluate_expression("{{name}} == \"Riley\"", &ctx));
        assert!(evaluate_expression("{{name}} contains ri", &ctx));
        assert!(evaluate_expression("{{balance}} > 100", &ctx));
    }

    #[test]
    fn test_expression_unresolved_path_is_false() {
        let ctx = json!({"age": 14});
        assert!(!evaluate_expression("{{grade}} == 8", &ctx));
        assert!(!evaluate_expression("{{grade}} != 8", &ctx));
        assert!(!evaluate_expression("{{camper.grade}} > 3", &ctx));
    }

    #[test]
    fn test_expression_dotted_path() {
        let ctx = json!({"camper": {"age": 14}});
        assert!(evaluate_expression("{{camper.age}} > 12", &ctx));
    }

    #[test]
    fn test_expression_without_operator_is_false() {
        assert!(!evaluate_expression("{{age}}", &json!({"age": 14})));
    }
}
