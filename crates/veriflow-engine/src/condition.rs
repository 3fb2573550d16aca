//! Declarative condition evaluation for `condition` steps.
//!
//! Conditions are fixed field/operator/value triples interpreted against
//! the workflow context. The interpreter is restricted to the six
//! documented operators; it never evaluates arbitrary expressions.

use std::collections::HashMap;

use veriflow_types::{ConditionOperator, WorkflowCondition};

/// Stateless evaluator for declarative workflow conditions.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Evaluate a condition against the context.
    ///
    /// A missing field makes every operator except `exists` evaluate to
    /// `false`.
    pub fn evaluate(
        condition: &WorkflowCondition,
        context: &HashMap<String, serde_json::Value>,
    ) -> bool {
        let resolved = Self::resolve(&condition.field, context);

        match condition.operator {
            ConditionOperator::Exists => resolved.is_some(),
            ConditionOperator::Equals => resolved == Some(&condition.value),
            ConditionOperator::NotEquals => {
                resolved.is_some() && resolved != Some(&condition.value)
            }
            ConditionOperator::GreaterThan => {
                Self::compare_numbers(resolved, &condition.value, |a, b| a > b)
            }
            ConditionOperator::LessThan => {
                Self::compare_numbers(resolved, &condition.value, |a, b| a < b)
            }
            ConditionOperator::Contains => Self::contains(resolved, &condition.value),
        }
    }

    /// Resolve a dot-separated field path against the context.
    fn resolve<'a>(
        field: &str,
        context: &'a HashMap<String, serde_json::Value>,
    ) -> Option<&'a serde_json::Value> {
        let mut segments = field.split('.');
        let mut current = context.get(segments.next()?)?;

        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }

        Some(current)
    }

    fn compare_numbers(
        resolved: Option<&serde_json::Value>,
        value: &serde_json::Value,
        op: fn(f64, f64) -> bool,
    ) -> bool {
        match (resolved.and_then(|v| v.as_f64()), value.as_f64()) {
            (Some(a), Some(b)) => op(a, b),
            _ => false,
        }
    }

    fn contains(resolved: Option<&serde_json::Value>, value: &serde_json::Value) -> bool {
        match resolved {
            Some(serde_json::Value::String(haystack)) => value
                .as_str()
                .map(|needle| haystack.contains(needle))
                .unwrap_or(false),
            Some(serde_json::Value::Array(items)) => items.contains(value),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> HashMap<String, serde_json::Value> {
        let mut ctx = HashMap::new();
        ctx.insert("status".to_string(), serde_json::json!("approved"));
        ctx.insert("score".to_string(), serde_json::json!(85));
        ctx.insert("tags".to_string(), serde_json::json!(["soc2", "gdpr"]));
        ctx.insert(
            "review".to_string(),
            serde_json::json!({"outcome": {"passed": true}, "count": 2}),
        );
        ctx
    }

    fn cond(field: &str, operator: ConditionOperator, value: serde_json::Value) -> WorkflowCondition {
        WorkflowCondition {
            field: field.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn test_equals() {
        let ctx = context();
        assert!(ConditionEvaluator::evaluate(
            &cond("status", ConditionOperator::Equals, serde_json::json!("approved")),
            &ctx
        ));
        assert!(!ConditionEvaluator::evaluate(
            &cond("status", ConditionOperator::Equals, serde_json::json!("rejected")),
            &ctx
        ));
    }

    #[test]
    fn test_not_equals() {
        let ctx = context();
        assert!(ConditionEvaluator::evaluate(
            &cond("status", ConditionOperator::NotEquals, serde_json::json!("rejected")),
            &ctx
        ));
        // Missing field is not "not equal" -- it is unresolvable
        assert!(!ConditionEvaluator::evaluate(
            &cond("missing", ConditionOperator::NotEquals, serde_json::json!("x")),
            &ctx
        ));
    }

    #[test]
    fn test_numeric_comparisons() {
        let ctx = context();
        assert!(ConditionEvaluator::evaluate(
            &cond("score", ConditionOperator::GreaterThan, serde_json::json!(80)),
            &ctx
        ));
        assert!(!ConditionEvaluator::evaluate(
            &cond("score", ConditionOperator::GreaterThan, serde_json::json!(90)),
            &ctx
        ));
        assert!(ConditionEvaluator::evaluate(
            &cond("score", ConditionOperator::LessThan, serde_json::json!(90)),
            &ctx
        ));
        // Non-numeric operands never compare
        assert!(!ConditionEvaluator::evaluate(
            &cond("status", ConditionOperator::GreaterThan, serde_json::json!(1)),
            &ctx
        ));
    }

    #[test]
    fn test_contains_string_and_array() {
        let ctx = context();
        assert!(ConditionEvaluator::evaluate(
            &cond("status", ConditionOperator::Contains, serde_json::json!("rov")),
            &ctx
        ));
        assert!(ConditionEvaluator::evaluate(
            &cond("tags", ConditionOperator::Contains, serde_json::json!("gdpr")),
            &ctx
        ));
        assert!(!ConditionEvaluator::evaluate(
            &cond("tags", ConditionOperator::Contains, serde_json::json!("hipaa")),
            &ctx
        ));
    }

    #[test]
    fn test_exists() {
        let ctx = context();
        assert!(ConditionEvaluator::evaluate(
            &cond("score", ConditionOperator::Exists, serde_json::Value::Null),
            &ctx
        ));
        assert!(!ConditionEvaluator::evaluate(
            &cond("missing", ConditionOperator::Exists, serde_json::Value::Null),
            &ctx
        ));
    }

    #[test]
    fn test_dot_path_resolution() {
        let ctx = context();
        assert!(ConditionEvaluator::evaluate(
            &cond(
                "review.outcome.passed",
                ConditionOperator::Equals,
                serde_json::json!(true)
            ),
            &ctx
        ));
        assert!(ConditionEvaluator::evaluate(
            &cond("review.count", ConditionOperator::LessThan, serde_json::json!(3)),
            &ctx
        ));
        assert!(!ConditionEvaluator::evaluate(
            &cond("review.outcome.missing", ConditionOperator::Exists, serde_json::Value::Null),
            &ctx
        ));
    }
}
