//! Property-based tests for output projection.

use funcworker::runtime::{OutputProjection, RETURN_BINDING_NAME};
use funcworker::value::{Record, Value};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Binding names as a host would declare them
fn arb_binding_name() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-zA-Z0-9]{0,8}").unwrap()
}

/// Result fields: each name either carries a string or is explicitly null
fn arb_fields() -> impl Strategy<Value = BTreeMap<String, Option<String>>> {
    prop::collection::btree_map(arb_binding_name(), prop::option::of("[a-z]{0,6}"), 0..6)
}

/// Outputs already written through the side channel
fn arb_side_outputs() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(arb_binding_name(), "[a-z]{1,6}", 0..3)
}

fn record_from(fields: &BTreeMap<String, Option<String>>) -> Value {
    let record = fields.iter().fold(Record::new(), |record, (name, value)| match value {
        Some(v) => record.with(name.clone(), v.clone()),
        None => record.with(name.clone(), Value::Null),
    });
    Value::object(record)
}

fn to_outputs(side: &BTreeMap<String, String>) -> BTreeMap<String, Value> {
    side.iter().map(|(k, v)| (k.clone(), Value::from(v.clone()))).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: without output bindings the output map is never touched and
    /// the result is left for the caller.
    #[test]
    fn prop_none_never_mutates_outputs(fields in arb_fields(), side in arb_side_outputs()) {
        let mut result = Some(record_from(&fields));
        let mut outputs = to_outputs(&side);
        let before = outputs.clone();

        OutputProjection::None.apply(&mut result, &mut outputs);

        prop_assert_eq!(outputs, before);
        prop_assert!(result.is_some());
    }

    /// Property: `$return` receives the whole value and nothing is left over.
    #[test]
    fn prop_return_only_moves_the_whole_result(text in "[a-z]{0,12}", side in arb_side_outputs()) {
        let mut result = Some(Value::from(text.clone()));
        let mut outputs = to_outputs(&side);

        OutputProjection::ReturnOnly.apply(&mut result, &mut outputs);

        prop_assert!(result.is_none());
        prop_assert_eq!(outputs.get(RETURN_BINDING_NAME), Some(&Value::from(text)));
        for (name, value) in &side {
            prop_assert_eq!(outputs.get(name), Some(&Value::from(value.clone())));
        }
    }

    /// Property: exactly the declared names with a non-null field on the
    /// result appear, each with that field's value; undeclared fields never do.
    #[test]
    fn prop_named_properties_project_declared_non_null_fields(
        fields in arb_fields(),
        extra in prop::collection::btree_set(arb_binding_name(), 0..4),
        pick in prop::collection::vec(any::<bool>(), 6),
    ) {
        let declared: BTreeSet<String> = fields
            .keys()
            .zip(pick.iter().cycle())
            .filter(|(_, keep)| **keep)
            .map(|(name, _)| name.clone())
            .chain(extra.iter().cloned())
            .collect();
        prop_assume!(!declared.is_empty());
        let projection = OutputProjection::resolve("f", &declared.iter().map(String::as_str).collect::<Vec<_>>())
            .unwrap();

        let mut result = Some(record_from(&fields));
        let mut outputs = BTreeMap::new();
        projection.apply(&mut result, &mut outputs);

        prop_assert!(result.is_none());
        let expected: BTreeMap<String, Value> = declared
            .iter()
            .filter_map(|name| match fields.get(name) {
                Some(Some(v)) => Some((name.clone(), Value::from(v.clone()))),
                _ => None,
            })
            .collect();
        prop_assert_eq!(outputs, expected);
    }

    /// Property: `$return` next to any other output binding is rejected at load.
    #[test]
    fn prop_return_with_other_bindings_is_ambiguous(
        others in prop::collection::btree_set(arb_binding_name(), 1..4),
    ) {
        let mut names: Vec<&str> = others.iter().map(String::as_str).collect();
        names.push(RETURN_BINDING_NAME);
        prop_assert!(OutputProjection::resolve("f", &names).is_err());
    }
}

#[test]
fn named_properties_on_json_results() {
    let projection = OutputProjection::resolve("f", &["body", "queue", "missing"]).unwrap();
    let mut result = Some(Value::Json(serde_json::json!({"body": "ok", "queue": {"id": 1}, "missing": null})));
    let mut outputs = BTreeMap::new();

    projection.apply(&mut result, &mut outputs);

    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs.get("body"), Some(&Value::Json(serde_json::json!("ok"))));
    assert_eq!(outputs.get("queue"), Some(&Value::Json(serde_json::json!({"id": 1}))));
}

#[test]
fn named_properties_on_scalar_result_emit_nothing() {
    let projection = OutputProjection::resolve("f", &["a"]).unwrap();
    let mut result = Some(Value::from("plain"));
    let mut outputs = BTreeMap::new();

    projection.apply(&mut result, &mut outputs);

    assert!(outputs.is_empty());
    assert!(result.is_none());
}

#[test]
fn projection_overrides_side_channel_output_with_the_same_name() {
    let projection = OutputProjection::resolve("f", &["queue"]).unwrap();
    let mut result = Some(Value::object(Record::new().with("queue", "projected")));
    let mut outputs = BTreeMap::from([("queue".to_string(), Value::from("side"))]);

    projection.apply(&mut result, &mut outputs);

    assert_eq!(outputs.get("queue"), Some(&Value::from("projected")));
}
