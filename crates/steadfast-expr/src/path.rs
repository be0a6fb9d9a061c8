// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dotted ident path resolution, e.g. `event.data.items[0].id`.

use serde_json::Value;

/// Resolve a dotted path with optional numeric `[n]` indices against a JSON value.
///
/// Returns `None` when any segment is missing.
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        let (field, indices) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !field.is_empty() {
            current = current.as_object()?.get(field)?;
        }
        for index in indices.split('[').filter(|s| !s.is_empty()) {
            let index = index.strip_suffix(']')?;
            let i: usize = index.parse().ok()?;
            current = current.as_array()?.get(i)?;
        }
    }
    Some(current)
}

/// Like [`resolve`] but maps a missing path to `null`, matching evaluator semantics.
pub fn resolve_or_null(root: &Value, path: &str) -> Value {
    resolve(root, path).cloned().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_nested() {
        let v = json!({"event": {"data": {"items": [{"id": 7}, {"id": 8}]}}});
        assert_eq!(resolve(&v, "event.data.items[1].id"), Some(&json!(8)));
        assert_eq!(resolve(&v, "event.data.items[2].id"), None);
        assert_eq!(resolve(&v, "event.missing"), None);
        assert_eq!(resolve_or_null(&v, "event.missing"), Value::Null);
    }

    #[test]
    fn test_resolve_nested_indices() {
        let v = json!({"m": [[1, 2], [3, 4]]});
        assert_eq!(resolve(&v, "m[1][0]"), Some(&json!(3)));
    }
}
