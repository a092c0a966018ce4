//! Parameter validation.
//!
//! Validates a proposed parameter value against declared constraints before
//! it enters the recalculation pipeline. Validation never fails as an
//! error: the outcome is structured data with every applicable failure
//! accumulated, plus non-blocking warnings for business-suspicious values.
//!
//! Custom rule expressions run through the same sandboxed evaluator as
//! formulas, with a single binding for the token `value`. A stored rule
//! string can therefore never reach anything beyond the fixed expression
//! grammar.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::cell::{CellRef, Value};
use crate::formula::eval::{evaluate, EvalError};

/// Constraint class a parameter declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// Must lie in [0, 1].
    Percentage,
    /// Must be > 0.
    Positive,
    /// Must be >= 0.
    NonNegative,
    #[default]
    Unconstrained,
}

/// A declared validation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationRule {
    Range { min: f64, max: f64 },
    Positive,
    NonNegative,
    /// Restricted expression over the token `value`, e.g. `value > 0`.
    /// Evaluated in the formula sandbox, never a general-purpose evaluator.
    Expression(String),
}

/// A model input parameter with its constraints.
///
/// Created when a model is imported; values are superseded on edit, never
/// deleted mid-session. Value history is the caller's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub reference: CellRef,
    pub current_value: f64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub kind: ParameterKind,
    pub rules: Vec<ValidationRule>,
}

impl Parameter {
    pub fn new(reference: impl Into<CellRef>, current_value: f64) -> Self {
        Self {
            reference: reference.into(),
            current_value,
            min_value: None,
            max_value: None,
            kind: ParameterKind::default(),
            rules: Vec::new(),
        }
    }

    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.min_value = Some(min);
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max_value = Some(max);
        self
    }

    pub fn with_kind(mut self, kind: ParameterKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Heuristic: names with a rate-like word usually hold fractional
    /// values, so a magnitude above 1 deserves a warning.
    fn looks_like_rate(&self) -> bool {
        const HINTS: &[&str] = &["rate", "growth", "margin", "yield", "pct", "percent"];
        let name = self.reference.as_str().to_ascii_lowercase();
        HINTS.iter().any(|hint| name.contains(hint))
    }
}

/// Structured validation outcome. Never an error; failure is an expected,
/// common result of user edits.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Check a proposed value against a parameter's constraints.
///
/// All applicable failures accumulate, in order: declared bounds, then the
/// kind constraint, then custom rules.
pub fn validate(parameter: &Parameter, proposed: f64) -> ValidationOutcome {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !proposed.is_finite() {
        errors.push("value must be a finite number".to_string());
    }

    if let Some(min) = parameter.min_value {
        if proposed < min {
            errors.push(format!("value {} is below the minimum {}", proposed, min));
        }
    }
    if let Some(max) = parameter.max_value {
        if proposed > max {
            errors.push(format!("value {} is above the maximum {}", proposed, max));
        }
    }

    match parameter.kind {
        ParameterKind::Percentage => {
            if !(0.0..=1.0).contains(&proposed) {
                errors.push(format!(
                    "percentage parameters must lie in [0, 1], got {}",
                    proposed
                ));
            }
        }
        ParameterKind::Positive => {
            if proposed <= 0.0 {
                errors.push(format!("value must be positive, got {}", proposed));
            }
        }
        ParameterKind::NonNegative => {
            if proposed < 0.0 {
                errors.push(format!("value must be non-negative, got {}", proposed));
            }
        }
        ParameterKind::Unconstrained => {}
    }

    for rule in &parameter.rules {
        match rule {
            ValidationRule::Range { min, max } => {
                if proposed < *min || proposed > *max {
                    errors.push(format!(
                        "value {} is outside the allowed range [{}, {}]",
                        proposed, min, max
                    ));
                }
            }
            ValidationRule::Positive => {
                if proposed <= 0.0 {
                    errors.push(format!("value must be positive, got {}", proposed));
                }
            }
            ValidationRule::NonNegative => {
                if proposed < 0.0 {
                    errors.push(format!("value must be non-negative, got {}", proposed));
                }
            }
            ValidationRule::Expression(source) => match eval_rule(source, proposed) {
                Ok(true) => {}
                Ok(false) => {
                    errors.push(format!("value {} rejected by rule '{}'", proposed, source));
                }
                Err(e) => {
                    errors.push(format!("rule '{}' failed to evaluate: {}", source, e));
                }
            },
        }
    }

    if errors.is_empty() && parameter.looks_like_rate() && proposed.abs() > 1.0 {
        warnings.push(format!(
            "{} set to {}, a magnitude above 100%; check the units",
            parameter.reference, proposed
        ));
    }

    ValidationOutcome {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Evaluate a custom rule in the formula sandbox with `value` bound.
fn eval_rule(source: &str, proposed: f64) -> Result<bool, EvalError> {
    let mut bindings: FxHashMap<CellRef, Value> = FxHashMap::default();
    bindings.insert(CellRef::from("value"), Value::Number(proposed));
    evaluate(source, &bindings)?.to_bool()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_bounds() {
        let param = Parameter::new("tax_pct", 0.3).with_kind(ParameterKind::Percentage);

        let outcome = validate(&param, 1.5);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("[0, 1]"));

        let outcome = validate(&param, 0.5);
        assert!(outcome.valid);
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn test_positive_and_non_negative_kinds() {
        let positive = Parameter::new("headcount", 10.0).with_kind(ParameterKind::Positive);
        assert!(!validate(&positive, 0.0).valid);
        assert!(validate(&positive, 1.0).valid);

        let non_negative = Parameter::new("cash", 0.0).with_kind(ParameterKind::NonNegative);
        assert!(validate(&non_negative, 0.0).valid);
        assert!(!validate(&non_negative, -1.0).valid);
    }

    #[test]
    fn test_failures_accumulate_in_order() {
        let param = Parameter::new("units", 5.0)
            .with_min(10.0)
            .with_kind(ParameterKind::Positive);

        let outcome = validate(&param, -5.0);
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors[0].contains("below the minimum"));
        assert!(outcome.errors[1].contains("positive"));
    }

    #[test]
    fn test_declared_bounds() {
        let param = Parameter::new("discount", 0.1).with_bounds(0.0, 0.5);
        assert!(validate(&param, 0.25).valid);
        assert!(!validate(&param, 0.75).valid);
        assert!(!validate(&param, -0.1).valid);
    }

    #[test]
    fn test_expression_rule_pass_and_fail() {
        let param = Parameter::new("spread", 0.0)
            .with_rule(ValidationRule::Expression("value > 0".to_string()));

        assert!(validate(&param, 1.0).valid);

        let outcome = validate(&param, -1.0);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("rejected by rule"));
    }

    #[test]
    fn test_expression_rule_is_sandboxed() {
        // Anything outside the formula grammar is an evaluation failure,
        // reported as a validation error - never executed, never a panic.
        let param = Parameter::new("x", 0.0)
            .with_rule(ValidationRule::Expression("SHELL('rm -rf')".to_string()));
        let outcome = validate(&param, 1.0);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("unknown function"));

        let param = Parameter::new("x", 0.0)
            .with_rule(ValidationRule::Expression("value > ".to_string()));
        let outcome = validate(&param, 1.0);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("failed to evaluate"));
    }

    #[test]
    fn test_expression_rule_unknown_name_rejected() {
        let param = Parameter::new("x", 0.0)
            .with_rule(ValidationRule::Expression("other_param > 0".to_string()));
        let outcome = validate(&param, 1.0);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("unknown reference"));
    }

    #[test]
    fn test_rate_magnitude_warning() {
        let param = Parameter::new("discount_rate", 0.1);

        let outcome = validate(&param, 1.5);
        assert!(outcome.valid);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("100%"));

        let outcome = validate(&param, 0.5);
        assert!(outcome.valid);
        assert!(outcome.warnings.is_empty());

        // Non-rate names stay quiet.
        let outcome = validate(&Parameter::new("revenue", 0.0), 1000.0);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_non_finite_value_rejected() {
        let param = Parameter::new("x", 0.0);
        assert!(!validate(&param, f64::NAN).valid);
        assert!(!validate(&param, f64::INFINITY).valid);
    }

    #[test]
    fn test_outcome_serializes() {
        let param = Parameter::new("rate", 0.1).with_kind(ParameterKind::Percentage);
        let outcome = validate(&param, 2.0);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["valid"], serde_json::json!(false));
        assert!(json["errors"].as_array().unwrap().len() == 1);
    }
}
