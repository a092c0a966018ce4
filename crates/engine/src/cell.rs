//! Cell identity and scalar values.
//!
//! A `CellRef` names one value slot in a model: a spreadsheet cell
//! (`"Sheet1!A1"`) or a named parameter (`"growth_rate"`). References are
//! opaque strings; equality is string equality. The ingestion layer that
//! populates a model is responsible for using one consistent spelling.

use serde::{Deserialize, Serialize};

use crate::formula::eval::EvalError;

/// Reference to a single cell or named parameter.
///
/// Used as graph nodes in the dependency graph and as map keys everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellRef(String);

impl CellRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CellRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CellRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Scalar type classification, carried on cells and calculation results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Number,
    Text,
    Boolean,
    Empty,
}

// =============================================================================
// Value: the scalar primitive for all cell values
// =============================================================================

/// A cell's scalar value.
///
/// Serializes untagged: numbers as JSON numbers, text as strings, booleans
/// as booleans, `Empty` as null — the shape the API layer ships to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Empty,
    Number(f64),
    Text(String),
    Boolean(bool),
}

impl Default for Value {
    fn default() -> Self {
        Value::Empty
    }
}

impl Value {
    /// Coerce to a number. Empty counts as 0, booleans as 0/1, and text is
    /// parsed; anything else is a type mismatch.
    pub fn to_number(&self) -> Result<f64, EvalError> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Empty => Ok(0.0),
            Value::Text(s) if s.is_empty() => Ok(0.0),
            Value::Text(s) => s.parse::<f64>().map_err(|_| EvalError::TypeMismatch {
                expected: "number",
                found: format!("'{}'", s),
            }),
        }
    }

    /// Coerce to a boolean. Numbers are truthy when nonzero; text must spell
    /// TRUE or FALSE (case-insensitive).
    pub fn to_bool(&self) -> Result<bool, EvalError> {
        match self {
            Value::Boolean(b) => Ok(*b),
            Value::Number(n) => Ok(*n != 0.0),
            Value::Empty => Ok(false),
            Value::Text(s) => match s.to_ascii_uppercase().as_str() {
                "TRUE" => Ok(true),
                "FALSE" => Ok(false),
                _ => Err(EvalError::TypeMismatch {
                    expected: "boolean",
                    found: format!("'{}'", s),
                }),
            },
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            Value::Text(s) => s.clone(),
            Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Empty => String::new(),
        }
    }

    /// True if this value counts as numeric for COUNT: a number, a boolean,
    /// or text that parses as a number. Empty does not count.
    pub fn is_numeric(&self) -> bool {
        match self {
            Value::Number(_) | Value::Boolean(_) => true,
            Value::Text(s) => s.parse::<f64>().is_ok(),
            Value::Empty => false,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Value::Number(_) => DataType::Number,
            Value::Text(_) => DataType::Text,
            Value::Boolean(_) => DataType::Boolean,
            Value::Empty => DataType::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }
}

// =============================================================================
// Cell
// =============================================================================

/// One value slot in a model.
///
/// A cell without a formula is a literal input. A cell with a formula is
/// derived: its value is written only by the recalculation engine, as
/// evaluation output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cell {
    pub value: Value,
    pub formula: Option<String>,
}

impl Cell {
    /// A literal input cell.
    pub fn literal(value: Value) -> Self {
        Self {
            value,
            formula: None,
        }
    }

    /// A derived cell. Its value starts Empty and is filled in by the first
    /// recalculation pass.
    pub fn with_formula(source: impl Into<String>) -> Self {
        Self {
            value: Value::Empty,
            formula: Some(source.into()),
        }
    }

    /// Classify raw ingestion input: `=...` is a formula, numeric text is a
    /// number, anything else is text.
    pub fn from_input(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::literal(Value::Empty);
        }
        if trimmed.starts_with('=') {
            return Self::with_formula(trimmed);
        }
        if let Ok(num) = trimmed.parse::<f64>() {
            return Self::literal(Value::Number(num));
        }
        Self::literal(Value::Text(trimmed.to_string()))
    }

    /// True if this cell's value is derived from a formula.
    pub fn is_derived(&self) -> bool {
        self.formula.is_some()
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_ref_equality_is_string_equality() {
        assert_eq!(CellRef::from("Sheet1!A1"), CellRef::new("Sheet1!A1"));
        assert_ne!(CellRef::from("Sheet1!A1"), CellRef::from("sheet1!a1"));
        assert_ne!(CellRef::from("A1"), CellRef::from("Sheet1!A1"));
    }

    #[test]
    fn test_value_to_number_coercions() {
        assert_eq!(Value::Number(2.5).to_number().unwrap(), 2.5);
        assert_eq!(Value::Boolean(true).to_number().unwrap(), 1.0);
        assert_eq!(Value::Empty.to_number().unwrap(), 0.0);
        assert_eq!(Value::Text("3.5".into()).to_number().unwrap(), 3.5);
        assert!(Value::Text("abc".into()).to_number().is_err());
    }

    #[test]
    fn test_value_to_bool() {
        assert!(Value::Number(1.0).to_bool().unwrap());
        assert!(!Value::Number(0.0).to_bool().unwrap());
        assert!(Value::Text("true".into()).to_bool().unwrap());
        assert!(!Value::Empty.to_bool().unwrap());
        assert!(Value::Text("maybe".into()).to_bool().is_err());
    }

    #[test]
    fn test_value_is_numeric() {
        assert!(Value::Number(0.0).is_numeric());
        assert!(Value::Boolean(false).is_numeric());
        assert!(Value::Text("42".into()).is_numeric());
        assert!(!Value::Text("n/a".into()).is_numeric());
        assert!(!Value::Empty.is_numeric());
    }

    #[test]
    fn test_cell_from_input() {
        assert!(Cell::from_input("=A1+B1").is_derived());
        assert_eq!(Cell::from_input("12.5").value, Value::Number(12.5));
        assert_eq!(Cell::from_input("hello").value, Value::Text("hello".into()));
        assert_eq!(Cell::from_input("  ").value, Value::Empty);
    }

    #[test]
    fn test_value_serializes_untagged() {
        assert_eq!(serde_json::to_string(&Value::Number(1.5)).unwrap(), "1.5");
        assert_eq!(serde_json::to_string(&Value::Boolean(true)).unwrap(), "true");
        assert_eq!(serde_json::to_string(&Value::Empty).unwrap(), "null");
        assert_eq!(
            serde_json::to_string(&Value::Text("x".into())).unwrap(),
            "\"x\""
        );
    }
}
