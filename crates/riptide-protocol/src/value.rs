//! Helpers over JSON payloads: merge-patch, dotted field extraction, and the
//! value ordering shared by the server query compiler and the client's local
//! matcher.

use std::cmp::Ordering;

use serde_json::Value;

/// Apply an RFC 7396 JSON merge patch to `target`.
///
/// Object keys merge recursively; a null-valued key erases the corresponding
/// key; any non-object patch replaces the target wholesale.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            let Value::Object(fields) = target else {
                return;
            };
            for (key, patch_value) in entries {
                if patch_value.is_null() {
                    fields.remove(key);
                } else if let Some(existing) = fields.get_mut(key) {
                    merge_patch(existing, patch_value);
                } else {
                    fields.insert(key.clone(), patch_value.clone());
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Extract a dotted field (`a.b.c`) from a JSON value, descending through
/// nested objects. Returns `None` when any step is absent or not an object.
pub fn extract_field<'a>(data: &'a Value, field: &str) -> Option<&'a Value> {
    let mut current = data;
    for part in field.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Total order over JSON values, mirroring SQLite's JSON comparison closely
/// enough for filter evaluation: null < booleans < numbers < strings <
/// arrays < objects. Within a type, natural order; across numeric
/// representations, f64 comparison.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(left), Value::Bool(right)) => left.cmp(right),
        (Value::Number(left), Value::Number(right)) => {
            let left = left.as_f64().unwrap_or(f64::NAN);
            let right = right.as_f64().unwrap_or(f64::NAN);
            left.partial_cmp(&right).unwrap_or(Ordering::Equal)
        }
        (Value::String(left), Value::String(right)) => left.cmp(right),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_merges_and_erases() {
        let mut doc = json!({"name": "a", "value": 1, "nested": {"x": 1, "y": 2}});
        merge_patch(
            &mut doc,
            &json!({"value": 2, "nested": {"y": null, "z": 3}, "extra": true}),
        );
        assert_eq!(
            doc,
            json!({"name": "a", "value": 2, "nested": {"x": 1, "z": 3}, "extra": true})
        );
    }

    #[test]
    fn merge_patch_replaces_non_object_targets() {
        let mut doc = json!([1, 2, 3]);
        merge_patch(&mut doc, &json!({"a": 1}));
        assert_eq!(doc, json!({"a": 1}));

        let mut doc = json!({"a": 1});
        merge_patch(&mut doc, &json!("scalar"));
        assert_eq!(doc, json!("scalar"));
    }

    #[test]
    fn extract_field_descends_dotted_paths() {
        let doc = json!({"a": {"b": {"c": 7}}, "top": "x"});
        assert_eq!(extract_field(&doc, "a.b.c"), Some(&json!(7)));
        assert_eq!(extract_field(&doc, "top"), Some(&json!("x")));
        assert_eq!(extract_field(&doc, "a.missing"), None);
        assert_eq!(extract_field(&doc, "top.deeper"), None);
    }

    #[test]
    fn compare_values_orders_across_types() {
        assert_eq!(compare_values(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(compare_values(&json!(true), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!("10"), &json!("2")), Ordering::Less);
        assert_eq!(compare_values(&json!(5), &json!("a")), Ordering::Less);
        assert_eq!(compare_values(&json!(3.5), &json!(3.5)), Ordering::Equal);
    }
}
