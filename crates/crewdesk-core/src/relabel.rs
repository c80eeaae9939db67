//! Deep identifier substitution over untyped JSON payloads.
//!
//! Identifiers show up both as values (`"department_id": "d1"`) and as map keys
//! (`"leave_balances": {"lt1": 12}`), so both positions are rewritten.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Return a copy of `value` with every occurrence of `old_id` replaced by `new_id`,
/// whether it appears as a string value or as an object key.
#[must_use]
pub fn relabel(value: &Value, old_id: &str, new_id: &str) -> Value {
    let mut relabeled = value.clone();
    relabel_in_place(&mut relabeled, old_id, new_id);
    relabeled
}

/// Rewrite `value` in place and return the number of positions that changed.
///
/// Object key order is preserved. If an object holds both `old_id` and `new_id` as
/// keys, the entry that comes later in the object wins.
pub fn relabel_in_place(value: &mut Value, old_id: &str, new_id: &str) -> usize {
    if old_id == new_id {
        return 0;
    }

    match value {
        Value::String(current) if current.as_str() == old_id => {
            new_id.clone_into(current);
            1
        }
        Value::Array(items) => {
            items.iter_mut().map(|item| relabel_in_place(item, old_id, new_id)).sum()
        }
        Value::Object(map) => relabel_object(map, old_id, new_id),
        _ => 0,
    }
}

fn relabel_object(map: &mut Map<String, Value>, old_id: &str, new_id: &str) -> usize {
    if !map.contains_key(old_id) {
        return map.values_mut().map(|nested| relabel_in_place(nested, old_id, new_id)).sum();
    }

    let mut changed = 0;
    let entries = std::mem::take(map);
    for (key, mut nested) in entries {
        changed += relabel_in_place(&mut nested, old_id, new_id);
        if key == old_id {
            changed += 1;
            map.insert(new_id.to_string(), nested);
        } else {
            map.insert(key, nested);
        }
    }
    changed
}

/// A set of substitutions applied together: every position is looked up against the
/// original ids and rewritten at most once, so chains (`a -> b`, `b -> c`) and swaps
/// do not feed into each other.
#[derive(Debug, Clone, Default)]
pub struct IdMap {
    ids: HashMap<String, String>,
    rewrites: HashMap<String, usize>,
}

impl IdMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `old_id` to `new_id`. Identity pairs are ignored; a later pair for the same
    /// `old_id` replaces the earlier one.
    pub fn insert(&mut self, old_id: impl Into<String>, new_id: impl Into<String>) {
        let (old_id, new_id) = (old_id.into(), new_id.into());
        if old_id != new_id {
            self.ids.insert(old_id, new_id);
        }
    }

    #[must_use]
    pub fn get(&self, old_id: &str) -> Option<&str> {
        self.ids.get(old_id).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Rewrite every mapped id in `value`; returns the number of positions changed.
    pub fn apply(&mut self, value: &mut Value) -> usize {
        if self.ids.is_empty() {
            return 0;
        }
        substitute(value, &self.ids, &mut self.rewrites)
    }

    /// Positions rewritten so far on behalf of `old_id`.
    #[must_use]
    pub fn rewrites(&self, old_id: &str) -> usize {
        self.rewrites.get(old_id).copied().unwrap_or(0)
    }
}

fn substitute(
    value: &mut Value,
    ids: &HashMap<String, String>,
    tally: &mut HashMap<String, usize>,
) -> usize {
    match value {
        Value::String(current) => {
            let Some(new_id) = ids.get(current.as_str()) else {
                return 0;
            };
            *tally.entry(current.clone()).or_default() += 1;
            new_id.clone_into(current);
            1
        }
        Value::Array(items) => items.iter_mut().map(|item| substitute(item, ids, tally)).sum(),
        Value::Object(map) => {
            if !map.keys().any(|key| ids.contains_key(key)) {
                return map.values_mut().map(|nested| substitute(nested, ids, tally)).sum();
            }
            let mut changed = 0;
            for (key, mut nested) in std::mem::take(map) {
                changed += substitute(&mut nested, ids, tally);
                match ids.get(&key) {
                    Some(new_id) => {
                        changed += 1;
                        map.insert(new_id.clone(), nested);
                        *tally.entry(key).or_default() += 1;
                    }
                    None => {
                        map.insert(key, nested);
                    }
                }
            }
            changed
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn occurrences(value: &Value, needle: &str) -> usize {
        match value {
            Value::String(current) => usize::from(current == needle),
            Value::Array(items) => items.iter().map(|item| occurrences(item, needle)).sum(),
            Value::Object(map) => map
                .iter()
                .map(|(key, nested)| usize::from(key == needle) + occurrences(nested, needle))
                .sum(),
            _ => 0,
        }
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            prop::sample::select(vec!["old", "new", "other"])
                .prop_map(|text| Value::String(text.to_string())),
        ];
        leaf.prop_recursive(4, 48, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::vec((prop::sample::select(vec!["old", "k1", "k2"]), inner), 0..4)
                    .prop_map(|entries| {
                        Value::Object(
                            entries.into_iter().map(|(key, nested)| (key.to_string(), nested)).collect(),
                        )
                    }),
            ]
        })
    }

    #[test]
    fn rewrites_values_keys_and_nested_lists() {
        let payload = json!({
            "id": "s1",
            "supervisor_id": "old",
            "qualification_ids": ["q1", "old", "q2"],
            "leave_balances": { "old": 12, "lt2": 3 },
            "grid": { "old": { "2024-05-01": "old" } },
            "hours": 42,
            "active": true
        });

        let relabeled = relabel(&payload, "old", "new");

        assert_eq!(
            relabeled,
            json!({
                "id": "s1",
                "supervisor_id": "new",
                "qualification_ids": ["q1", "new", "q2"],
                "leave_balances": { "new": 12, "lt2": 3 },
                "grid": { "new": { "2024-05-01": "new" } },
                "hours": 42,
                "active": true
            })
        );
        assert_eq!(payload["supervisor_id"], "old");
    }

    #[test]
    fn key_rename_preserves_entry_order() {
        let mut payload = json!({ "first": 1, "old": 2, "last": 3 });
        let changed = relabel_in_place(&mut payload, "old", "new");

        assert_eq!(changed, 1);
        let keys: Vec<&str> = payload
            .as_object()
            .map(|map| map.keys().map(String::as_str).collect())
            .unwrap_or_default();
        assert_eq!(keys, vec!["first", "new", "last"]);
    }

    #[test]
    fn non_string_scalars_and_substrings_are_untouched() {
        let payload = json!({ "n": 7, "b": false, "nothing": null, "prefix": "old-ish", "text": "bold" });
        let mut relabeled = payload.clone();
        assert_eq!(relabel_in_place(&mut relabeled, "old", "new"), 0);
        assert_eq!(relabeled, payload);
    }

    #[test]
    fn identical_ids_are_a_no_op() {
        let mut payload = json!(["same", { "same": "same" }]);
        assert_eq!(relabel_in_place(&mut payload, "same", "same"), 0);
        assert_eq!(payload, json!(["same", { "same": "same" }]));
    }

    #[test]
    fn id_map_applies_chained_ids_once() {
        let mut ids = IdMap::new();
        ids.insert("role-1", "role-2");
        ids.insert("role-2", "role-3");
        let mut payload = json!({
            "role_ids": ["role-1", "role-2"],
            "pay_bands": { "role-1": "A", "role-2": "B" }
        });

        assert_eq!(ids.apply(&mut payload), 4);
        assert_eq!(
            payload,
            json!({
                "role_ids": ["role-2", "role-3"],
                "pay_bands": { "role-2": "A", "role-3": "B" }
            })
        );
        assert_eq!(ids.rewrites("role-1"), 2);
        assert_eq!(ids.rewrites("role-2"), 2);
    }

    #[test]
    fn id_map_swaps_values_and_keys() {
        let mut ids = IdMap::new();
        ids.insert("a", "b");
        ids.insert("b", "a");
        ids.insert("same", "same");
        let mut payload = json!({ "a": "b", "b": ["a", "same"] });

        assert_eq!(ids.apply(&mut payload), 4);
        assert_eq!(payload, json!({ "b": "a", "a": ["b", "same"] }));
        assert_eq!(ids.get("same"), None);
    }

    proptest! {
        #[test]
        fn property_relabel_replaces_every_occurrence(value in arb_value()) {
            let before_old = occurrences(&value, "old");
            let before_new = occurrences(&value, "new");

            let mut relabeled = value.clone();
            let changed = relabel_in_place(&mut relabeled, "old", "new");

            prop_assert_eq!(changed, before_old);
            prop_assert_eq!(occurrences(&relabeled, "old"), 0);
            prop_assert_eq!(occurrences(&relabeled, "new"), before_new + before_old);
        }

        #[test]
        fn property_single_entry_id_map_matches_relabel(value in arb_value()) {
            let mut ids = IdMap::new();
            ids.insert("old", "new");
            let mut mapped = value.clone();
            let changed = ids.apply(&mut mapped);

            prop_assert_eq!(changed, occurrences(&value, "old"));
            prop_assert_eq!(mapped, relabel(&value, "old", "new"));
        }

        #[test]
        fn property_relabel_is_idempotent(value in arb_value()) {
            let once = relabel(&value, "old", "new");
            let twice = relabel(&once, "old", "new");
            prop_assert_eq!(once, twice);
        }
    }
}
