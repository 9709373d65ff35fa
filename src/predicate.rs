//! Predicates over decoded packet fields.
//!
//! A predicate names a field path, a comparison and an expected value, with an optional
//! bit mask and tolerance band. A packet matches when every predicate holds.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::types::{display_value, parse_int, Payload};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    #[serde(default)]
    pub variable: Option<String>,
    #[serde(default)]
    pub compare: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default, rename = "maskValue")]
    pub mask_value: Option<Value>,
    #[serde(default)]
    pub tolerance: Option<f64>,
    #[serde(default)]
    pub tolerance_plus: Option<f64>,
    #[serde(default)]
    pub tolerance_minus: Option<f64>,
}

impl Predicate {
    pub fn new(variable: &str, compare: &str, value: Value) -> Self {
        Self {
            variable: Some(variable.to_string()),
            compare: Some(compare.to_string()),
            value: Some(value),
            ..Self::default()
        }
    }

    /// Parse the `args` list of a telemetry check. `null` or `{}` means no predicates.
    pub fn list_from_value(value: &Value) -> Result<Vec<Predicate>, serde_json::Error> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Object(map) if map.is_empty() => Ok(Vec::new()),
            Value::Object(_) => Ok(vec![serde_json::from_value(value.clone())?]),
            other => serde_json::from_value(other.clone()),
        }
    }

    /// Expected value; a list contributes its first element.
    pub fn expected(&self) -> Option<&Value> {
        match self.value.as_ref()? {
            Value::Array(items) => items.first(),
            Value::Null => None,
            other => Some(other),
        }
    }

    /// Upper and lower tolerance, `tolerance` overriding the asymmetric pair.
    pub fn tolerances(&self) -> (f64, f64) {
        match self.tolerance {
            Some(tol) => (tol, tol),
            None => (
                self.tolerance_plus.unwrap_or(0.0),
                self.tolerance_minus.unwrap_or(0.0),
            ),
        }
    }
}

/// Numeric view of a field or expected value. Hex strings are accepted.
pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(f64::from(u8::from(*flag))),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<f64>()
                .ok()
                .or_else(|| parse_int(text).map(|v| v as f64))
        }
        _ => None,
    }
}

fn check_strings(actual: &Value, expected: &Value, equal: bool) -> bool {
    let expected = display_value(expected);
    match actual {
        Value::String(actual) if *actual == expected => equal,
        Value::String(actual) => {
            warn!(
                "String comparison failed, actual value:{} expected value: {}",
                actual, expected
            );
            !equal
        }
        other => {
            warn!(
                "String comparison failed, actual value:{} expected value: {}",
                other, expected
            );
            false
        }
    }
}

fn compare_numbers(compare: &str, actual: f64, expected: f64) -> Option<bool> {
    let result = match compare {
        "==" => actual == expected,
        "!=" => actual != expected,
        "<" => actual < expected,
        "<=" => actual <= expected,
        ">" => actual > expected,
        ">=" => actual >= expected,
        _ => return None,
    };
    Some(result)
}

/// Compare one field value. String comparisons are `streq`, `strneq` and `regex`;
/// everything else is numeric after an optional `&`/`|` mask.
pub fn check_value(
    actual: &Value,
    expected: &Value,
    compare: &str,
    mask: Option<&str>,
    mask_value: Option<&Value>,
) -> bool {
    match compare {
        "streq" => return check_strings(actual, expected, true),
        "strneq" => return check_strings(actual, expected, false),
        "regex" => {
            let pattern = display_value(expected);
            return match (actual, Regex::new(&pattern)) {
                (Value::String(text), Ok(re)) => {
                    if re.is_match(text) {
                        true
                    } else {
                        warn!("Regex match failed, actual value:{} regex value: {}", text, pattern);
                        false
                    }
                }
                (_, Err(e)) => {
                    error!("Invalid regex {}: {}", pattern, e);
                    false
                }
                (other, Ok(_)) => {
                    warn!("Regex match failed, actual value:{} regex value: {}", other, pattern);
                    false
                }
            };
        }
        _ => {}
    }

    if compare_numbers(compare, 0.0, 0.0).is_none() {
        error!("Invalid Comparison Value: {}", compare);
        return false;
    }

    let (Some(actual_num), Some(expected_num)) = (to_number(actual), to_number(expected)) else {
        error!(
            "Failed to convert args: {} {} {}",
            display_value(actual),
            compare,
            display_value(expected)
        );
        return false;
    };

    let lhs = match (mask, mask_value) {
        (Some(mask), Some(mask_value)) => {
            let Some(bits) = to_number(mask_value).map(|v| v as i64) else {
                error!("Failed to apply mask: invalid maskValue {}", mask_value);
                return false;
            };
            let masked = match mask {
                "&" => (actual_num as i64) & bits,
                "|" => (actual_num as i64) | bits,
                other => {
                    error!("Invalid Mask Value: {}", other);
                    return false;
                }
            };
            masked as f64
        }
        (Some(_), None) => {
            error!("Invalid comparison: mask provided without maskValue");
            return false;
        }
        (None, Some(_)) => {
            error!("Invalid comparison: maskValue provided without mask");
            return false;
        }
        (None, None) => actual_num,
    };

    compare_numbers(compare, lhs, expected_num).unwrap_or(false)
}

/// Check every predicate against one payload. Errors in the predicate itself are
/// logged only when `log_errors` is set (the first poll of a verification).
pub fn evaluate(payload: &Payload, predicates: &[Predicate], log_errors: bool) -> bool {
    let mut passed = true;

    for predicate in predicates {
        let (Some(variable), Some(expected)) = (predicate.variable.as_deref(), predicate.expected())
        else {
            if log_errors {
                if predicate.expected().is_none() {
                    error!("No expected 'value' provided in arg: {:?}.", predicate);
                } else {
                    error!("No variable provided in arg: {:?}", predicate);
                }
            }
            return false;
        };
        let compare = predicate.compare.as_deref().unwrap_or("==");

        let actual = match payload.get(variable) {
            Ok(actual) => actual,
            Err(e) => {
                error!("Failed to Evaluate {}: {}", variable, e);
                return false;
            }
        };

        let mask = predicate.mask.as_deref();
        let mask_value = predicate.mask_value.as_ref();
        let mut result = check_value(&actual, expected, compare, mask, mask_value);

        let (tol_plus, tol_minus) = predicate.tolerances();
        if !result && (tol_plus != 0.0 || tol_minus != 0.0) {
            if let Some(expected_num) = to_number(expected) {
                let upper = Value::from(expected_num + tol_plus);
                let lower = Value::from(expected_num - tol_minus);
                result = check_value(&actual, &upper, "<=", mask, mask_value)
                    && check_value(&actual, &lower, ">=", mask, mask_value);
            }
        }

        if result {
            info!(
                "PASSED Intermediate Check - {}: Actual: {}, Expected: {}, Comparison: {}, Tol: +{}, -{}",
                variable,
                display_value(&actual),
                display_value(expected),
                compare,
                tol_plus,
                tol_minus
            );
        } else {
            warn!(
                "FAILED Intermediate Check - {}: Actual: {}, Expected: {}, Comparison: {}, Tol: +{}, -{}",
                variable,
                display_value(&actual),
                display_value(expected),
                compare,
                tol_plus,
                tol_minus
            );
        }
        passed = passed && result;
    }

    passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endianness, FieldType, Primitive, TypeDef};
    use serde_json::json;
    use std::sync::Arc;

    fn payload() -> Payload {
        let def = Arc::new(
            TypeDef::builder("Hk", Endianness::Little)
                .field("usCmdCnt", FieldType::Primitive(Primitive::U16))
                .field("temp", FieldType::Primitive(Primitive::F32))
                .field("name", FieldType::Primitive(Primitive::Char).repeated(8))
                .build(),
        );
        Payload::from_value(def, &json!({"usCmdCnt": 6, "temp": 20.5, "name": "TO_LAB"})).unwrap()
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(check_value(&json!(1), &json!(1), "==", None, None));
        assert!(check_value(&json!(2), &json!("0x1"), ">", None, None));
        assert!(!check_value(&json!(2), &json!(2), "!=", None, None));
        assert!(!check_value(&json!(2), &json!(2), "~", None, None));
        assert!(!check_value(&json!("abc"), &json!(2), "==", None, None));
    }

    #[test]
    fn test_string_comparisons() {
        assert!(check_value(&json!("TO_LAB"), &json!("TO_LAB"), "streq", None, None));
        assert!(check_value(&json!("TO_LAB"), &json!("CI"), "strneq", None, None));
        assert!(!check_value(&json!(5), &json!("5"), "streq", None, None));
        assert!(check_value(&json!("No-op command"), &json!("^No-op"), "regex", None, None));
        assert!(!check_value(&json!("x"), &json!("("), "regex", None, None));
    }

    #[test]
    fn test_mask_requires_both_parts() {
        assert!(check_value(&json!(6), &json!(2), "==", Some("&"), Some(&json!("0x2"))));
        assert!(check_value(&json!(4), &json!(5), "==", Some("|"), Some(&json!(1))));
        assert!(!check_value(&json!(6), &json!(2), "==", Some("&"), None));
        assert!(!check_value(&json!(6), &json!(6), "==", None, Some(&json!(1))));
    }

    #[test]
    fn test_evaluate_all_predicates() {
        let payload = payload();
        let predicates = vec![
            Predicate::new("usCmdCnt", "==", json!(6)),
            Predicate::new("name", "streq", json!("TO_LAB")),
        ];
        assert!(evaluate(&payload, &predicates, true));

        let failing = vec![
            Predicate::new("usCmdCnt", "==", json!(6)),
            Predicate::new("usCmdCnt", ">", json!(6)),
        ];
        assert!(!evaluate(&payload, &failing, true));
    }

    #[test]
    fn test_missing_value_or_variable_fails() {
        let payload = payload();
        let no_value = Predicate {
            variable: Some("usCmdCnt".into()),
            compare: Some("==".into()),
            ..Predicate::default()
        };
        assert!(!evaluate(&payload, &[no_value], true));
        let no_variable = Predicate {
            compare: Some("==".into()),
            value: Some(json!(1)),
            ..Predicate::default()
        };
        assert!(!evaluate(&payload, &[no_variable], true));
        assert!(!evaluate(&payload, &[Predicate::new("missing", "==", json!(1))], true));
    }

    #[test]
    fn test_tolerance_widens_equality() {
        let payload = payload();
        let mut predicate = Predicate::new("temp", "==", json!(20));
        assert!(!evaluate(&payload, &[predicate.clone()], true));
        predicate.tolerance = Some(0.5);
        assert!(evaluate(&payload, &[predicate.clone()], true));

        let asymmetric = Predicate {
            tolerance: None,
            tolerance_plus: Some(1.0),
            ..predicate
        };
        assert!(evaluate(&payload, &[asymmetric], true));
    }

    #[test]
    fn test_list_value_uses_first_element() {
        let payload = payload();
        assert!(evaluate(
            &payload,
            &[Predicate::new("usCmdCnt", "==", json!([6, 7]))],
            true
        ));
    }

    #[test]
    fn test_parse_predicate_list() {
        let list = Predicate::list_from_value(&json!([
            {"variable": "a", "compare": "==", "value": 1, "maskValue": "0xF", "mask": "&"}
        ]))
        .unwrap();
        assert_eq!(list[0].mask_value, Some(json!("0xF")));
        assert!(Predicate::list_from_value(&json!({})).unwrap().is_empty());
    }
}
