//! Document model: JSON objects with an `_id`, equality filters, and the
//! canonical encodings used for keys and digests.

use serde_json::{Map, Value};

/// A stored document. Field order is preserved (`serde_json/preserve_order`).
pub type Document = Map<String, Value>;

/// Name of the identity field.
pub const ID_FIELD: &str = "_id";

/// Build a [`Document`] from an object literal.
///
/// ```
/// use swapguard_store::doc;
///
/// let d = doc! { "_id": 1, "a": 2 };
/// assert_eq!(d.len(), 2);
/// ```
#[macro_export]
macro_rules! doc {
    ($($body:tt)*) => {
        match $crate::serde_json::json!({ $($body)* }) {
            $crate::serde_json::Value::Object(map) => map,
            _ => unreachable!("object literal always produces an object"),
        }
    };
}

/// Compare two JSON values, treating numbers by value (`1 == 1.0`).
///
/// Objects compare field-by-field regardless of field order.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            if let (Some(l), Some(r)) = (l.as_i64(), r.as_i64()) {
                l == r
            } else {
                match (l.as_f64(), r.as_f64()) {
                    (Some(l), Some(r)) => l == r,
                    _ => false,
                }
            }
        }
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(l), Value::Object(r)) => documents_equal(l, r),
        _ => left == right,
    }
}

/// Field-order-insensitive document equality.
pub fn documents_equal(left: &Document, right: &Document) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .all(|(key, value)| right.get(key).is_some_and(|other| values_equal(value, other)))
}

/// True when every field of `filter` is present in `document` with an equal
/// value. An empty filter matches everything.
pub fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| {
        document
            .get(key)
            .is_some_and(|actual| values_equal(actual, expected))
    })
}

/// Apply a `$set`-style partial update. Returns true if any field changed.
///
/// `_id` is never modified.
pub fn apply_set(document: &mut Document, fields: &Document) -> bool {
    let mut changed = false;
    for (key, value) in fields {
        if key == ID_FIELD {
            continue;
        }
        let differs = document
            .get(key)
            .is_none_or(|current| !values_equal(current, value));
        if differs {
            document.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// Replace a document's body while keeping its `_id` first.
pub fn replace_body(id: &Value, replacement: &Document) -> Document {
    let mut out = Document::new();
    out.insert(ID_FIELD.to_owned(), id.clone());
    for (key, value) in replacement {
        if key != ID_FIELD {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Keep only the fields listed with a truthy value in `projection`.
///
/// `_id` is kept unless projected out with `0`/`false`.
pub fn project(document: &Document, projection: &Document) -> Document {
    let keep_id = projection.get(ID_FIELD).is_none_or(is_truthy);
    let mut out = Document::new();
    if keep_id {
        if let Some(id) = document.get(ID_FIELD) {
            out.insert(ID_FIELD.to_owned(), id.clone());
        }
    }
    for (key, flag) in projection {
        if key == ID_FIELD || !is_truthy(flag) {
            continue;
        }
        if let Some(value) = document.get(key) {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::Null => false,
        _ => true,
    }
}

/// Canonical JSON text: object keys sorted recursively, integral floats
/// folded to integers. Used for `_id` keys and continuity digests.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                out.push_str(&(f as i64).to_string());
            }
            _ => out.push_str(&n.to_string()),
        },
        other => out.push_str(&other.to_string()),
    }
}

/// Storage key for an `_id` value.
pub fn id_key(id: &Value) -> String {
    canonical_json(id)
}

/// Generate an ObjectId-shaped identifier (24 hex characters).
pub fn generate_object_id() -> Value {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let bytes: [u8; 12] = rand::random();
    let mut out = String::with_capacity(24);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0F)]));
    }
    Value::String(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::doc;

    #[test]
    fn numbers_compare_by_value() {
        assert!(values_equal(&json!(2), &json!(2.0)));
        assert!(!values_equal(&json!(2), &json!(3)));
        assert!(!values_equal(&json!(2), &json!("2")));
    }

    #[test]
    fn document_equality_ignores_field_order() {
        let left = doc! { "_id": 1, "a": 2 };
        let right = doc! { "a": 2, "_id": 1 };
        assert!(documents_equal(&left, &right));
        assert!(!documents_equal(&left, &doc! { "_id": 1 }));
    }

    #[test]
    fn filter_requires_every_field() {
        let d = doc! { "_id": 1, "a": 2, "runB": true };
        assert!(matches_filter(&d, &doc! {}));
        assert!(matches_filter(&d, &doc! { "a": 2 }));
        assert!(matches_filter(&d, &doc! { "a": 2, "runB": true }));
        assert!(!matches_filter(&d, &doc! { "a": 1 }));
        assert!(!matches_filter(&d, &doc! { "missing": 1 }));
    }

    #[test]
    fn set_reports_changes_and_protects_id() {
        let mut d = doc! { "_id": 1, "a": 1 };
        assert!(apply_set(&mut d, &doc! { "a": 2, "_id": 9 }));
        assert_eq!(d, doc! { "_id": 1, "a": 2 });
        assert!(!apply_set(&mut d, &doc! { "a": 2 }));
    }

    #[test]
    fn replacement_keeps_id() {
        let replaced = replace_body(&json!(1), &doc! { "a": 1, "_id": 7 });
        assert_eq!(replaced, doc! { "_id": 1, "a": 1 });
    }

    #[test]
    fn projection_keeps_id_by_default() {
        let d = doc! { "_id": 1, "a": 2, "b": 3 };
        assert_eq!(project(&d, &doc! { "a": 1 }), doc! { "_id": 1, "a": 2 });
        assert_eq!(project(&d, &doc! { "a": 1, "_id": 0 }), doc! { "a": 2 });
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({ "b": 1, "a": { "z": 2.0, "y": [1, 2] } });
        assert_eq!(canonical_json(&value), r#"{"a":{"y":[1,2],"z":2},"b":1}"#);
    }

    #[test]
    fn object_ids_are_hex() {
        let id = generate_object_id();
        let text = id.as_str().expect("generated id is a string");
        assert_eq!(text.len(), 24);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
