//! Value helpers shared by the config model and the command-line compiler.
//!
//! Values are plain `serde_json::Value`s: configs arrive as YAML/JSON and the
//! external program only ever sees their text form.

use crate::schema::spec::{ScalarType, ValueType};
use serde_json::{Number, Value};

/// `AttnBackend.auto` => `auto`; plain names pass through.
pub fn symbolic_name(s: &str) -> &str {
    s.rsplit_once('.').map(|(_, name)| name).unwrap_or(s)
}

/// Text form of a value as the external parser expects it.
///
/// Never fails: mismatched shapes (a list where a scalar is declared, an
/// object anywhere) fall back to compact JSON.
pub fn stringify(value: &Value, value_type: &ValueType) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => match value_type {
            ValueType::Enum(_) => symbolic_name(s).to_string(),
            _ => s.clone(),
        },
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Semantic equality used for the baseline diff.
///
/// `1 == 1.0`, and enum values compare by symbolic name.
pub fn values_equal(a: &Value, b: &Value, value_type: &ValueType) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::String(x), Value::String(y)) => match value_type {
            ValueType::Enum(_) => symbolic_name(x) == symbolic_name(y),
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            let elem = match value_type {
                ValueType::List(t) => ValueType::Scalar(*t),
                other => other.clone(),
            };
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y, &elem))
        }
        _ => a == b,
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Parse raw text: integer, then float, else the string itself.
pub fn parse_scalar(text: &str) -> Value {
    let t = text.trim();
    if let Ok(i) = t.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = t.parse::<f64>()
        && let Some(n) = Number::from_f64(f)
    {
        return Value::Number(n);
    }
    Value::String(text.to_string())
}

/// Parse raw text toward a declared type, falling back to `parse_scalar`.
pub fn parse_typed(text: &str, value_type: &ValueType) -> Value {
    match value_type {
        ValueType::Scalar(t) => parse_as(text, *t),
        ValueType::List(t) => {
            if text.trim().is_empty() {
                return Value::Array(vec![]);
            }
            Value::Array(text.split(',').map(|part| parse_as(part.trim(), *t)).collect())
        }
        ValueType::Enum(_) => Value::String(text.trim().to_string()),
    }
}

fn parse_as(text: &str, t: ScalarType) -> Value {
    let trimmed = text.trim();
    if trimmed == "null" {
        return Value::Null;
    }
    match t {
        ScalarType::Str => Value::String(text.to_string()),
        ScalarType::Float => match trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
            Some(n) => Value::Number(n),
            None => parse_scalar(text),
        },
        ScalarType::Bool => match trimmed.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => parse_scalar(text),
        },
        ScalarType::Int | ScalarType::Any => parse_scalar(text),
    }
}

/// Loose truthiness for flag-style fields (`null`, `false`, `0`, `""` are false).
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ANY: ValueType = ValueType::Scalar(ScalarType::Any);

    #[test]
    fn stringify_scalars() {
        assert_eq!(stringify(&json!(null), &ANY), "null");
        assert_eq!(stringify(&json!(true), &ANY), "true");
        assert_eq!(stringify(&json!(42), &ANY), "42");
        assert_eq!(stringify(&json!(0.5), &ANY), "0.5");
        assert_eq!(stringify(&json!("cosine"), &ANY), "cosine");
    }

    #[test]
    fn stringify_enum_uses_symbolic_name() {
        let ty = ValueType::Enum("AttnBackend".into());
        assert_eq!(stringify(&json!("AttnBackend.flash"), &ty), "flash");
        assert_eq!(stringify(&json!("flash"), &ty), "flash");
        // Non-enum strings keep their dots.
        assert_eq!(stringify(&json!("data.bin"), &ANY), "data.bin");
    }

    #[test]
    fn stringify_mismatched_shapes_is_best_effort() {
        let int = ValueType::Scalar(ScalarType::Int);
        assert_eq!(stringify(&json!([1, 2]), &int), "[1,2]");
        assert_eq!(stringify(&json!({"a": 1}), &int), r#"{"a":1}"#);
    }

    #[test]
    fn numeric_equality_crosses_int_and_float() {
        assert!(values_equal(&json!(1), &json!(1.0), &ANY));
        assert!(!values_equal(&json!(1), &json!(1.5), &ANY));
        assert!(!values_equal(&json!(1), &json!("1"), &ANY));
    }

    #[test]
    fn enum_equality_by_symbolic_name() {
        let ty = ValueType::Enum("AttnBackend".into());
        assert!(values_equal(&json!("AttnBackend.auto"), &json!("auto"), &ty));
        assert!(!values_equal(&json!("AttnBackend.auto"), &json!("flash"), &ty));
    }

    #[test]
    fn parse_scalar_prefers_int_then_float() {
        assert_eq!(parse_scalar("12"), json!(12));
        assert_eq!(parse_scalar("1e-4"), json!(1e-4));
        assert_eq!(parse_scalar("cosine"), json!("cosine"));
        assert_eq!(parse_scalar("nan"), json!("nan"));
    }

    #[test]
    fn parse_typed_respects_declared_type() {
        assert_eq!(parse_typed("3", &ValueType::Scalar(ScalarType::Float)), json!(3.0));
        assert_eq!(parse_typed("007", &ValueType::Scalar(ScalarType::Str)), json!("007"));
        assert_eq!(parse_typed("True", &ValueType::Scalar(ScalarType::Bool)), json!(true));
        assert_eq!(
            parse_typed("1, 2,3", &ValueType::List(ScalarType::Int)),
            json!([1, 2, 3])
        );
        assert_eq!(parse_typed("", &ValueType::List(ScalarType::Str)), json!([]));
        assert_eq!(parse_typed("null", &ValueType::Scalar(ScalarType::Int)), json!(null));
    }
}
