//! Model binding: resolve every declared parameter to a value.

use super::context::FunctionContext;
use super::converters::{ConversionResult, ConverterContext};
use super::definition::BoxedArg;
use crate::errors::{BindingError, InvocationError, ParameterFailure};
use std::any::Any;
use std::fmt;

/// Bound parameter values in declaration order. `None` marks a parameter
/// whose source was absent.
#[derive(Default)]
pub struct FunctionArguments {
    values: Vec<(String, Option<BoxedArg>)>,
}

impl FunctionArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Option<BoxedArg>) {
        self.values.push((name.into(), value));
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(name, _)| name.as_str())
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.position(name).is_some_and(|i| self.values[i].1.is_some())
    }

    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        let i = self.position(name)?;
        self.values[i].1.as_ref()?.downcast_ref::<T>()
    }

    pub fn get_at<T: Any>(&self, index: usize) -> Option<&T> {
        self.values.get(index)?.1.as_ref()?.downcast_ref::<T>()
    }

    /// Move a value out. Leaves the slot untouched when `T` does not match.
    pub fn take<T: Any>(&mut self, name: &str) -> Option<T> {
        let i = self.position(name)?;
        let slot = &mut self.values[i].1;
        match slot.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(original) => {
                *slot = Some(original);
                None
            }
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.values
            .iter()
            .position(|(n, _)| n == name)
            .or_else(|| self.values.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)))
    }
}

impl fmt::Debug for FunctionArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.iter().map(|(name, v)| (name, v.is_some())))
            .finish()
    }
}

impl FunctionContext {
    /// Bind every declared parameter through the converter chain.
    ///
    /// Allowed once per invocation. All parameters are attempted and every
    /// failure is reported in a single [`BindingError`].
    pub async fn bind_input(&mut self) -> Result<FunctionArguments, InvocationError> {
        if self.bound {
            return Err(InvocationError::DuplicateBinding);
        }
        self.bound = true;
        self.checkpoint()?;

        let definition = self.definition().clone();
        let converters = self.converters.clone();
        let mut arguments = FunctionArguments::new();
        let mut failures = Vec::new();

        for parameter in &definition.parameters {
            let source = self.binding_source(&parameter.name);
            let context = ConverterContext {
                parameter,
                source,
                function_name: &definition.name,
                invocation_id: self.invocation_id(),
                cancellation: self.cancellation_token(),
            };
            let outcome = converters.convert(&context).await;

            match (outcome, source) {
                (ConversionResult::Succeeded(value), _) => arguments.push(parameter.name.clone(), Some(value)),
                (_, None) => arguments.push(parameter.name.clone(), None),
                (ConversionResult::Failed(reason), Some(data)) => failures.push(ParameterFailure {
                    parameter: parameter.name.clone(),
                    target_type: parameter.param_type.name(),
                    source_type: data.type_name(),
                    reason,
                }),
                (ConversionResult::Unhandled, Some(data)) => failures.push(ParameterFailure {
                    parameter: parameter.name.clone(),
                    target_type: parameter.param_type.name(),
                    source_type: data.type_name(),
                    reason: "no converter was able to convert the value".to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            crate::invocation_warn!(self, failed = failures.len(), "input binding failed");
            return Err(BindingError {
                function_name: definition.name.clone(),
                failures,
            }
            .into());
        }

        crate::invocation_debug!(self, parameters = arguments.len(), "input bound");
        Ok(arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_leaves_mismatched_values_in_place() {
        let mut args = FunctionArguments::new();
        args.push("count", Some(Box::new(5i64)));
        args.push("missing", None);
        assert_eq!(args.take::<String>("count"), None);
        assert_eq!(args.get::<i64>("COUNT"), Some(&5));
        assert_eq!(args.take::<i64>("count"), Some(5));
        assert!(!args.is_bound("count"));
        assert!(!args.is_bound("missing"));
        assert_eq!(args.names().collect::<Vec<_>>(), vec!["count", "missing"]);
    }
}
