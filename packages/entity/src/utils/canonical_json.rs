use serde_json::Value;
use std::collections::BTreeMap;

/// Errors that can occur while producing canonical JSON
#[derive(Debug, thiserror::Error)]
pub enum CanonicalJsonError {
    #[error("JSON nesting exceeds canonical depth limit")]
    TooDeep,

    #[error("non-integer number {0} not representable in canonical JSON")]
    InvalidNumber(f64),

    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Serialize a JSON value to Matrix canonical JSON.
///
/// Canonical JSON has object keys sorted lexicographically, no
/// insignificant whitespace, and only integer numbers. Signatures and
/// content hashes are computed over this form, so it must match what every
/// other homeserver produces byte for byte.
pub fn canonical_json(value: &Value) -> Result<String, CanonicalJsonError> {
    let canonical = canonicalize(value, 0)?;
    Ok(serde_json::to_string(&canonical)?)
}

fn canonicalize(value: &Value, depth: usize) -> Result<Value, CanonicalJsonError> {
    const MAX_DEPTH: usize = 100;
    if depth > MAX_DEPTH {
        return Err(CanonicalJsonError::TooDeep);
    }

    match value {
        Value::Object(map) => {
            // BTreeMap gives the required lexicographic key order.
            let mut sorted = BTreeMap::new();
            for (key, val) in map {
                sorted.insert(key.clone(), canonicalize(val, depth + 1)?);
            }
            Ok(Value::Object(sorted.into_iter().collect()))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(canonicalize(item, depth + 1)?);
            }
            Ok(Value::Array(out))
        }
        Value::Number(n) => {
            if n.is_f64() {
                return Err(CanonicalJsonError::InvalidNumber(n.as_f64().unwrap_or(f64::NAN)));
            }
            Ok(value.clone())
        }
        _ => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "m": [{"k": 2, "a": 3}]}});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":{"m":[{"a":3,"k":2}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn rejects_floats() {
        let value = json!({"a": 1.5});
        assert!(matches!(
            canonical_json(&value),
            Err(CanonicalJsonError::InvalidNumber(_))
        ));
    }

    #[test]
    fn identical_values_produce_identical_bytes() {
        let a = json!({"x": [1, 2], "y": "z"});
        let b = json!({"y": "z", "x": [1, 2]});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }
}
