//! Mapping of a function's return value onto its output bindings.

use crate::errors::LoadError;
use crate::value::Value;
use std::collections::BTreeMap;

/// Binding name that receives the whole return value.
pub const RETURN_BINDING_NAME: &str = "$return";

/// How a function's return value maps to output bindings. Decided once at
/// load time and reused for every invocation of that function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputProjection {
    /// No output bindings. The return value stays the invocation result.
    None,
    /// A single `$return` binding receives the whole return value.
    ReturnOnly,
    /// Each named binding receives the same-named field of the return value.
    NamedProperties(Vec<String>),
}

impl OutputProjection {
    pub fn resolve(function_name: &str, output_bindings: &[&str]) -> Result<Self, LoadError> {
        let has_return = output_bindings.contains(&RETURN_BINDING_NAME);
        match (has_return, output_bindings.len()) {
            (_, 0) => Ok(OutputProjection::None),
            (true, 1) => Ok(OutputProjection::ReturnOnly),
            (true, n) => Err(LoadError::AmbiguousReturnBinding {
                name: function_name.to_string(),
                others: n - 1,
            }),
            (false, _) => Ok(OutputProjection::NamedProperties(
                output_bindings.iter().map(|name| name.to_string()).collect(),
            )),
        }
    }

    /// Apply to a completed invocation.
    ///
    /// `ReturnOnly` always yields a `$return` entry, null when the function
    /// returned nothing.
    /// Values in `outputs` that were already set through the side channel are
    /// replaced when the projection produces the same name. Named properties
    /// that are missing or null on the result are skipped.
    pub fn apply(&self, result: &mut Option<Value>, outputs: &mut BTreeMap<String, Value>) {
        match self {
            OutputProjection::None => {}
            OutputProjection::ReturnOnly => {
                // the binding is reported even without a value, carrying no data
                let value = result.take().unwrap_or_default();
                outputs.insert(RETURN_BINDING_NAME.to_string(), value);
            }
            OutputProjection::NamedProperties(names) => {
                let Some(value) = result.take() else {
                    return;
                };
                for name in names {
                    if let Some(field) = value.field(name)
                        && !field.is_null()
                    {
                        outputs.insert(name.clone(), field);
                    }
                }
            }
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, OutputProjection::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Record;

    #[test]
    fn resolve_picks_strategy_from_binding_names() {
        assert_eq!(OutputProjection::resolve("f", &[]).unwrap(), OutputProjection::None);
        assert_eq!(OutputProjection::resolve("f", &["$return"]).unwrap(), OutputProjection::ReturnOnly);
        assert_eq!(
            OutputProjection::resolve("f", &["queue", "blob"]).unwrap(),
            OutputProjection::NamedProperties(vec!["queue".into(), "blob".into()])
        );
    }

    #[test]
    fn return_mixed_with_named_outputs_is_rejected() {
        let err = OutputProjection::resolve("f", &["$return", "queue"]).unwrap_err();
        assert_eq!(
            err,
            LoadError::AmbiguousReturnBinding {
                name: "f".into(),
                others: 1
            }
        );
    }

    #[test]
    fn none_keeps_result() {
        let mut result = Some(Value::from("hi"));
        let mut outputs = BTreeMap::new();
        OutputProjection::None.apply(&mut result, &mut outputs);
        assert_eq!(result, Some(Value::from("hi")));
        assert!(outputs.is_empty());
    }

    #[test]
    fn return_only_without_result_emits_null_return() {
        let mut result = None;
        let mut outputs = BTreeMap::new();
        OutputProjection::ReturnOnly.apply(&mut result, &mut outputs);
        assert_eq!(outputs.get(RETURN_BINDING_NAME), Some(&Value::Null));
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn named_properties_skip_null_and_missing() {
        let rec = Record::new().with("queue", "msg").with("blob", Value::Null);
        let mut result = Some(Value::object(rec));
        let mut outputs = BTreeMap::new();
        OutputProjection::NamedProperties(vec!["queue".into(), "blob".into(), "table".into()])
            .apply(&mut result, &mut outputs);
        assert!(result.is_none());
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs.get("queue"), Some(&Value::from("msg")));
    }
}
