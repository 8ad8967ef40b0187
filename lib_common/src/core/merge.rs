//! # State Merger
//!
//! Folds a partial update tree into the consolidated state tree.
//!
//! Rules, applied per key of the modifier:
//! - a non-empty JSON object is merged recursively into whatever object sits at
//!   that key in the base (a missing or non-object base value counts as `{}`);
//! - anything else (scalar, `null`, array, empty object) replaces the base value
//!   wholesale. Arrays are atomic and never merged element-wise.
//!
//! The merger takes the base by value and returns the merged tree, so callers
//! never observe a half-applied merge through a shared reference.

use serde_json::{Map, Value};

/// A JSON object, the shape of both the consolidated state and every update.
pub type Tree = Map<String, Value>;

/// Merges `modifier` into `base` and returns the resulting tree.
///
/// `None` or an empty modifier returns `base` unchanged.
pub fn deep_merge(mut base: Tree, modifier: Option<Tree>) -> Tree {
    let Some(modifier) = modifier else {
        return base;
    };

    for (key, value) in modifier {
        match value {
            Value::Object(inner) if !inner.is_empty() => {
                let existing = match base.remove(&key) {
                    Some(Value::Object(existing)) => existing,
                    _ => Tree::new(),
                };
                base.insert(key, Value::Object(deep_merge(existing, Some(inner))));
            }
            other => {
                base.insert(key, other);
            }
        }
    }

    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(value: Value) -> Tree {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn absent_modifier_returns_base() {
        let base = tree(json!({"a": {"x": 1}}));
        assert_eq!(deep_merge(base.clone(), None), base);
        assert_eq!(deep_merge(base.clone(), Some(Tree::new())), base);
    }

    #[test]
    fn nested_leaf_overwrite_keeps_siblings() {
        let merged = deep_merge(tree(json!({"a": {"x": 1, "y": 2}})), Some(tree(json!({"a": {"y": 3}}))));
        assert_eq!(Value::Object(merged), json!({"a": {"x": 1, "y": 3}}));
    }

    #[test]
    fn array_replaces_object_wholesale() {
        let merged = deep_merge(tree(json!({"a": {"x": 1}})), Some(tree(json!({"a": [1, 2]}))));
        assert_eq!(Value::Object(merged), json!({"a": [1, 2]}));
    }

    #[test]
    fn arrays_are_not_merged_element_wise() {
        let merged = deep_merge(tree(json!({"a": [1, 2, 3]})), Some(tree(json!({"a": [9]}))));
        assert_eq!(Value::Object(merged), json!({"a": [9]}));
    }

    #[test]
    fn object_replaces_scalar() {
        let merged = deep_merge(tree(json!({"a": 5})), Some(tree(json!({"a": {"b": 1}}))));
        assert_eq!(Value::Object(merged), json!({"a": {"b": 1}}));
    }

    #[test]
    fn null_and_empty_object_replace() {
        let merged = deep_merge(
            tree(json!({"a": {"x": 1}, "b": {"y": 2}})),
            Some(tree(json!({"a": null, "b": {}}))),
        );
        assert_eq!(Value::Object(merged), json!({"a": null, "b": {}}));
    }

    #[test]
    fn object_into_missing_key_is_created() {
        let merged = deep_merge(Tree::new(), Some(tree(json!({"TimingData": {"Lines": {"1": {"Position": "1"}}}}))));
        assert_eq!(Value::Object(merged), json!({"TimingData": {"Lines": {"1": {"Position": "1"}}}}));
    }

    #[test]
    fn merge_is_idempotent_on_repetition() {
        let base = tree(json!({"a": {"x": 1, "l": [1]}, "keep": true}));
        let modifier = tree(json!({"a": {"x": 2, "n": {"deep": [3, 4]}, "e": {}}, "z": null}));

        let once = deep_merge(base.clone(), Some(modifier.clone()));
        let twice = deep_merge(once.clone(), Some(modifier));
        assert_eq!(once, twice);
    }

    #[test]
    fn keys_absent_from_modifier_survive_at_every_depth() {
        let base = tree(json!({
            "SessionInfo": {"Name": "Race", "Meeting": {"Name": "Bahrain", "Country": {"Code": "BRN"}}},
            "LapCount": {"CurrentLap": 10, "TotalLaps": 57},
            "WeatherData": {"AirTemp": "20.1"}
        }));
        let modifier = tree(json!({
            "SessionInfo": {"Meeting": {"Country": {"Name": "Bahrain"}}},
            "LapCount": {"CurrentLap": 11}
        }));

        let merged = Value::Object(deep_merge(base, Some(modifier)));
        assert_eq!(merged["SessionInfo"]["Name"], "Race");
        assert_eq!(merged["SessionInfo"]["Meeting"]["Name"], "Bahrain");
        assert_eq!(merged["SessionInfo"]["Meeting"]["Country"]["Code"], "BRN");
        assert_eq!(merged["SessionInfo"]["Meeting"]["Country"]["Name"], "Bahrain");
        assert_eq!(merged["LapCount"], json!({"CurrentLap": 11, "TotalLaps": 57}));
        assert_eq!(merged["WeatherData"], json!({"AirTemp": "20.1"}));
    }

    #[test]
    fn last_write_wins_across_sequences() {
        let mut state = Tree::new();
        for lap in 1..=3 {
            state = deep_merge(state, Some(tree(json!({"LapCount": {"CurrentLap": lap}}))));
        }
        assert_eq!(Value::Object(state), json!({"LapCount": {"CurrentLap": 3}}));
    }
}
