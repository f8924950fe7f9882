//! JSON deep merge for configuration updates.

use serde_json::{Map, Value};

use crate::core::types::ItemDiff;

pub const DEFAULT_RATIONALE: &str = "Optimization based on project analysis";

/// Merge `update` into `base`: objects merge recursively, arrays take the
/// order-preserving union (elements already in `base` are not appended again),
/// anything else is replaced by the update.
///
/// Merging a value into itself yields the same value, so re-proposing an
/// applied config produces no change.
pub fn deep_merge(base: &Value, update: &Value) -> Value {
    match (base, update) {
        (Value::Object(left), Value::Object(right)) => {
            let mut merged: Map<String, Value> = left.clone();
            for (key, value) in right {
                let next = match left.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (Value::Array(left), Value::Array(right)) => {
            let mut merged = left.clone();
            for item in right {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Value::Array(merged)
        }
        (_, other) => other.clone(),
    }
}

/// One diff per top-level key of `update` whose merged value differs from `base`.
///
/// `rationale_for` supplies a per-key reason; keys without one get [`DEFAULT_RATIONALE`].
pub fn diff_keys(
    base: &Value,
    merged: &Value,
    update: &Value,
    rationale_for: impl Fn(&str) -> Option<String>,
) -> Vec<ItemDiff> {
    let Value::Object(update) = update else {
        return Vec::new();
    };
    update
        .keys()
        .filter_map(|key| {
            let old_value = base.get(key).cloned();
            let new_value = merged.get(key).cloned();
            if old_value == new_value {
                return None;
            }
            Some(ItemDiff {
                path: key.clone(),
                old_value,
                new_value,
                rationale: rationale_for(key).unwrap_or_else(|| DEFAULT_RATIONALE.to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn objects_merge_recursively_and_arrays_union() {
        let base = json!({"rules": {"semi": "error"}, "extends": ["a"], "root": true});
        let update = json!({"rules": {"quotes": "single"}, "extends": ["b"], "root": false});
        assert_eq!(
            deep_merge(&base, &update),
            json!({
                "rules": {"semi": "error", "quotes": "single"},
                "extends": ["a", "b"],
                "root": false
            })
        );
    }

    #[test]
    fn arrays_skip_elements_already_present() {
        let base = json!({"extends": ["prettier"], "plugins": ["react", "import"]});
        let update = json!({"extends": ["prettier"], "plugins": ["import", "jsx-a11y", "jsx-a11y"]});
        assert_eq!(
            deep_merge(&base, &update),
            json!({"extends": ["prettier"], "plugins": ["react", "import", "jsx-a11y"]})
        );
    }

    #[test]
    fn merging_current_value_is_a_no_op() {
        let base = json!({
            "extends": ["eslint:recommended", "prettier"],
            "rules": {"semi": ["error", "always"]},
            "overrides": [{"files": ["*.ts"], "rules": {"no-var": "error"}}]
        });
        let merged = deep_merge(&base, &base);
        assert_eq!(merged, base);
        assert!(diff_keys(&base, &merged, &base, |_| None).is_empty());
    }

    #[test]
    fn diffs_skip_unchanged_keys() {
        let base = json!({"strict": true, "target": "es2017"});
        let update = json!({"strict": true, "target": "es2022"});
        let merged = deep_merge(&base, &update);
        let diffs = diff_keys(&base, &merged, &update, |_| None);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "target");
        assert_eq!(diffs[0].old_value, Some(json!("es2017")));
        assert_eq!(diffs[0].rationale, DEFAULT_RATIONALE);
    }

    #[test]
    fn new_keys_have_no_old_value() {
        let base = json!({});
        let update = json!({"testEnvironment": "node"});
        let merged = deep_merge(&base, &update);
        let diffs = diff_keys(&base, &merged, &update, |k| Some(format!("set {k}")));
        assert_eq!(diffs[0].old_value, None);
        assert_eq!(diffs[0].rationale, "set testEnvironment");
    }
}
