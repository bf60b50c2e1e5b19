//! Input converters: turn raw [`TypedData`] into parameter values.
//!
//! Converters are consulted in a fixed order for each parameter:
//!
//! 1. The converter named by the binding's `converter` property.
//! 2. Converters listed in the binding's `advertised_converters` property.
//! 3. Every registered converter in registration order, unless the binding
//!    sets `allow_converter_fallback` to `false`.
//!
//! The first result that is not [`ConversionResult::Unhandled`] wins.

use super::definition::{BoxedArg, FunctionParameter, ParamType};
use crate::protocol::TypedData;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Binding property naming a converter to try first.
pub const CONVERTER_PROPERTY: &str = "converter";
/// Binding property listing converters (comma separated) the binding advertises.
pub const ADVERTISED_CONVERTERS_PROPERTY: &str = "advertised_converters";
/// Binding property that disables the registry fallback when set to `false`.
pub const ALLOW_FALLBACK_PROPERTY: &str = "allow_converter_fallback";

/// Outcome of one conversion attempt.
pub enum ConversionResult {
    Succeeded(BoxedArg),
    /// The converter does not apply to this source/target pair.
    Unhandled,
    /// The converter applies but the payload is invalid.
    Failed(String),
}

impl ConversionResult {
    pub fn success<T: Send + 'static>(value: T) -> Self {
        ConversionResult::Succeeded(Box::new(value))
    }

    pub fn is_unhandled(&self) -> bool {
        matches!(self, ConversionResult::Unhandled)
    }
}

impl fmt::Debug for ConversionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionResult::Succeeded(_) => f.write_str("Succeeded(..)"),
            ConversionResult::Unhandled => f.write_str("Unhandled"),
            ConversionResult::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// Everything a converter may inspect for one parameter.
pub struct ConverterContext<'a> {
    pub parameter: &'a FunctionParameter,
    pub source: Option<&'a TypedData>,
    pub function_name: &'a str,
    pub invocation_id: &'a str,
    pub cancellation: &'a CancellationToken,
}

impl ConverterContext<'_> {
    pub fn target(&self) -> ParamType {
        self.parameter.param_type
    }

    fn property(&self, key: &str) -> Option<&str> {
        self.parameter
            .properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult;
}

/// Ordered, immutable set of converters.
#[derive(Clone)]
pub struct ConverterRegistry {
    converters: Vec<Arc<dyn Converter>>,
}

#[derive(Default)]
pub struct ConverterRegistryBuilder {
    converters: Vec<Arc<dyn Converter>>,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        ConverterRegistry::builder().with_defaults().build()
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.converters.iter().map(|c| c.name())).finish()
    }
}

impl ConverterRegistry {
    pub fn builder() -> ConverterRegistryBuilder {
        ConverterRegistryBuilder::default()
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Converter>> {
        self.converters.iter().find(|c| c.name().eq_ignore_ascii_case(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.converters.iter().map(|c| c.name()).collect()
    }

    /// Run the converter chain for one parameter.
    pub async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        let mut tried: Vec<&str> = Vec::new();

        let explicit = context.property(CONVERTER_PROPERTY).into_iter();
        let advertised = context
            .property(ADVERTISED_CONVERTERS_PROPERTY)
            .into_iter()
            .flat_map(|list| list.split(','))
            .map(str::trim)
            .filter(|name| !name.is_empty());

        for name in explicit.chain(advertised) {
            if tried.iter().any(|t| t.eq_ignore_ascii_case(name)) {
                continue;
            }
            tried.push(name);
            let Some(converter) = self.find(name) else {
                tracing::warn!(
                    target: "funcworker::runtime::converters",
                    converter = %name,
                    parameter = %context.parameter.name,
                    "binding names a converter that is not registered"
                );
                continue;
            };
            let result = converter.convert(context).await;
            if !result.is_unhandled() {
                log_outcome(context, converter.name(), &result);
                return result;
            }
        }

        let allow_fallback = context
            .property(ALLOW_FALLBACK_PROPERTY)
            .is_none_or(|v| !v.eq_ignore_ascii_case("false"));
        if !allow_fallback {
            return ConversionResult::Unhandled;
        }

        for converter in &self.converters {
            if tried.iter().any(|t| t.eq_ignore_ascii_case(converter.name())) {
                continue;
            }
            let result = converter.convert(context).await;
            if !result.is_unhandled() {
                log_outcome(context, converter.name(), &result);
                return result;
            }
        }
        ConversionResult::Unhandled
    }
}

fn log_outcome(context: &ConverterContext<'_>, converter: &str, result: &ConversionResult) {
    tracing::trace!(
        target: "funcworker::runtime::converters",
        invocation_id = %context.invocation_id,
        parameter = %context.parameter.name,
        converter = %converter,
        outcome = ?result,
        "converter produced a result"
    );
}

impl ConverterRegistryBuilder {
    /// Append the built-in converters in their canonical order.
    pub fn with_defaults(self) -> Self {
        self.register(CancellationTokenConverter)
            .register(TypeConverter)
            .register(DateTimeConverter)
            .register(StringToBytesConverter)
            .register(JsonConverter)
            .register(CollectionConverter)
    }

    pub fn register(mut self, converter: impl Converter + 'static) -> Self {
        self.converters.push(Arc::new(converter));
        self
    }

    pub fn build(self) -> ConverterRegistry {
        ConverterRegistry {
            converters: self.converters,
        }
    }
}

// ============================================================================
// Built-in converters
// ============================================================================

/// Binds the invocation's cancellation token to `CancellationToken` parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancellationTokenConverter;

#[async_trait]
impl Converter for CancellationTokenConverter {
    fn name(&self) -> &str {
        "CancellationToken"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        if context.target().is::<CancellationToken>() {
            ConversionResult::success(context.cancellation.clone())
        } else {
            ConversionResult::Unhandled
        }
    }
}

/// Passes payloads through when the target is their natural Rust shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeConverter;

#[async_trait]
impl Converter for TypeConverter {
    fn name(&self) -> &str {
        "Type"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        let Some(source) = context.source else {
            return ConversionResult::Unhandled;
        };
        let target = context.target();
        if target.is::<TypedData>() {
            return ConversionResult::success(source.clone());
        }
        match source {
            TypedData::String(s) | TypedData::Json(s) if target.is::<String>() => ConversionResult::success(s.clone()),
            TypedData::Bytes(b) if target.is::<Vec<u8>>() => ConversionResult::success(b.clone()),
            TypedData::Int(i) if target.is::<i64>() => ConversionResult::success(*i),
            TypedData::Double(d) if target.is::<f64>() => ConversionResult::success(*d),
            TypedData::CollectionString(v) if target.is::<Vec<String>>() => ConversionResult::success(v.clone()),
            TypedData::CollectionBytes(v) if target.is::<Vec<Vec<u8>>>() => ConversionResult::success(v.clone()),
            TypedData::CollectionDouble(v) if target.is::<Vec<f64>>() => ConversionResult::success(v.clone()),
            TypedData::CollectionSint64(v) if target.is::<Vec<i64>>() => ConversionResult::success(v.clone()),
            _ => ConversionResult::Unhandled,
        }
    }
}

/// Parses RFC 3339 timestamps into `chrono` date-times.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateTimeConverter;

#[async_trait]
impl Converter for DateTimeConverter {
    fn name(&self) -> &str {
        "DateTime"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        let target = context.target();
        if !target.is::<DateTime<Utc>>() && !target.is::<DateTime<FixedOffset>>() {
            return ConversionResult::Unhandled;
        }
        let text = match context.source {
            Some(TypedData::String(s)) => Cow::Borrowed(s.as_str()),
            Some(TypedData::Json(s)) => match serde_json::from_str::<String>(s) {
                Ok(unquoted) => Cow::Owned(unquoted),
                Err(_) => return ConversionResult::Unhandled,
            },
            _ => return ConversionResult::Unhandled,
        };
        // Unparseable text is left to the JSON converter, which reports the error.
        match DateTime::parse_from_rfc3339(text.trim()) {
            Ok(parsed) if target.is::<DateTime<Utc>>() => ConversionResult::success(parsed.with_timezone(&Utc)),
            Ok(parsed) => ConversionResult::success(parsed),
            Err(_) => ConversionResult::Unhandled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StringToBytesConverter;

#[async_trait]
impl Converter for StringToBytesConverter {
    fn name(&self) -> &str {
        "StringToBytes"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        match context.source {
            Some(TypedData::String(s)) if context.target().is::<Vec<u8>>() => {
                ConversionResult::success(s.as_bytes().to_vec())
            }
            _ => ConversionResult::Unhandled,
        }
    }
}

/// Parses integral primitives from text and deserializes JSON into
/// structured or primitive targets. Never handles `String` targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

#[async_trait]
impl Converter for JsonConverter {
    fn name(&self) -> &str {
        "Json"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        let target = context.target();
        if target.is::<String>() {
            return ConversionResult::Unhandled;
        }
        let Some(bytes) = context.source.and_then(payload_bytes) else {
            return ConversionResult::Unhandled;
        };

        if let Ok(text) = std::str::from_utf8(&bytes)
            && let Some(value) = parse_integral(target, text)
        {
            return ConversionResult::Succeeded(value);
        }

        match target.decode_json(&bytes).or_else(|| decode_primitive(target, &bytes)) {
            Some(Ok(value)) => ConversionResult::Succeeded(value),
            Some(Err(e)) => ConversionResult::Failed(e.to_string()),
            None => ConversionResult::Unhandled,
        }
    }
}

fn payload_bytes(source: &TypedData) -> Option<Cow<'_, [u8]>> {
    match source {
        TypedData::String(s) | TypedData::Json(s) => Some(Cow::Borrowed(s.as_bytes())),
        TypedData::Bytes(b) => Some(Cow::Borrowed(b.as_slice())),
        TypedData::Int(i) => Some(Cow::Owned(i.to_string().into_bytes())),
        TypedData::Double(d) => Some(Cow::Owned(d.to_string().into_bytes())),
        _ => None,
    }
}

fn parse_integral(target: ParamType, text: &str) -> Option<BoxedArg> {
    macro_rules! integral {
        ($($t:ty),*) => {
            $(
                if target.is::<$t>() {
                    return text.trim().parse::<$t>().ok().map(|v| Box::new(v) as BoxedArg);
                }
            )*
        };
    }
    integral!(i64, i32, i16, i8, u64, u32, u16, u8, isize, usize);
    None
}

fn decode_primitive(target: ParamType, bytes: &[u8]) -> Option<serde_json::Result<BoxedArg>> {
    macro_rules! primitive {
        ($($t:ty),*) => {
            $(
                if target.is::<$t>() {
                    return Some(serde_json::from_slice::<$t>(bytes).map(|v| Box::new(v) as BoxedArg));
                }
            )*
        };
    }
    primitive!(
        i64,
        i32,
        i16,
        i8,
        u64,
        u32,
        u16,
        u8,
        isize,
        usize,
        f64,
        f32,
        bool,
        serde_json::Value,
        DateTime<Utc>,
        DateTime<FixedOffset>
    );
    None
}

/// Element-wise conversion of collection payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionConverter;

#[async_trait]
impl Converter for CollectionConverter {
    fn name(&self) -> &str {
        "Collection"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        let target = context.target();
        match context.source {
            Some(TypedData::CollectionBytes(items)) if target.is::<Vec<String>>() => {
                match items.iter().map(|b| String::from_utf8(b.clone())).collect::<Result<Vec<_>, _>>() {
                    Ok(strings) => ConversionResult::success(strings),
                    Err(e) => ConversionResult::Failed(e.to_string()),
                }
            }
            Some(TypedData::CollectionString(items)) if target.is::<Vec<Vec<u8>>>() => {
                ConversionResult::success(items.iter().map(|s| s.as_bytes().to_vec()).collect::<Vec<_>>())
            }
            Some(TypedData::CollectionSint64(items)) if target.is::<Vec<i32>>() => {
                match items.iter().map(|i| i32::try_from(*i)).collect::<Result<Vec<_>, _>>() {
                    Ok(ints) => ConversionResult::success(ints),
                    Err(e) => ConversionResult::Failed(e.to_string()),
                }
            }
            Some(TypedData::CollectionSint64(items)) if target.is::<Vec<f64>>() => {
                ConversionResult::success(items.iter().map(|i| *i as f64).collect::<Vec<_>>())
            }
            Some(TypedData::CollectionDouble(items)) if target.is::<Vec<f32>>() => {
                ConversionResult::success(items.iter().map(|d| *d as f32).collect::<Vec<_>>())
            }
            _ => ConversionResult::Unhandled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn param(param_type: ParamType) -> FunctionParameter {
        FunctionParameter {
            name: "p".into(),
            param_type,
            properties: BTreeMap::new(),
        }
    }

    async fn run(
        registry: &ConverterRegistry,
        parameter: &FunctionParameter,
        source: Option<TypedData>,
    ) -> ConversionResult {
        let token = CancellationToken::new();
        let context = ConverterContext {
            parameter,
            source: source.as_ref(),
            function_name: "f",
            invocation_id: "i",
            cancellation: &token,
        };
        registry.convert(&context).await
    }

    struct Fixed(&'static str, i64);

    #[async_trait]
    impl Converter for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn convert(&self, _context: &ConverterContext<'_>) -> ConversionResult {
            ConversionResult::success(self.1)
        }
    }

    #[tokio::test]
    async fn integral_text_parses() {
        let registry = ConverterRegistry::default();
        let result = run(&registry, &param(ParamType::of::<i32>()), Some(TypedData::String(" 42 ".into()))).await;
        match result {
            ConversionResult::Succeeded(v) => assert_eq!(*v.downcast::<i32>().unwrap(), 42),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_never_handles_string_targets() {
        let token = CancellationToken::new();
        let parameter = param(ParamType::of::<String>());
        let source = TypedData::Bytes(vec![1, 2]);
        let context = ConverterContext {
            parameter: &parameter,
            source: Some(&source),
            function_name: "f",
            invocation_id: "i",
            cancellation: &token,
        };
        assert!(JsonConverter.convert(&context).await.is_unhandled());
    }

    #[tokio::test]
    async fn datetime_parses_rfc3339() {
        let registry = ConverterRegistry::default();
        let result = run(
            &registry,
            &param(ParamType::of::<DateTime<Utc>>()),
            Some(TypedData::String("2024-05-01T10:00:00+02:00".into())),
        )
        .await;
        match result {
            ConversionResult::Succeeded(v) => {
                let dt = *v.downcast::<DateTime<Utc>>().unwrap();
                assert_eq!(dt.to_rfc3339(), "2024-05-01T08:00:00+00:00");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn explicit_converter_runs_first() {
        let registry = ConverterRegistry::builder().with_defaults().register(Fixed("Magic", 99)).build();
        let mut parameter = param(ParamType::of::<i64>());
        parameter.properties.insert(CONVERTER_PROPERTY.into(), "magic".into());
        match run(&registry, &parameter, Some(TypedData::Int(1))).await {
            ConversionResult::Succeeded(v) => assert_eq!(*v.downcast::<i64>().unwrap(), 99),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabling_fallback_leaves_parameter_unhandled() {
        let registry = ConverterRegistry::default();
        let mut parameter = param(ParamType::of::<i64>());
        parameter.properties.insert(ALLOW_FALLBACK_PROPERTY.into(), "false".into());
        assert!(run(&registry, &parameter, Some(TypedData::Int(1))).await.is_unhandled());
    }

    #[tokio::test]
    async fn advertised_converters_precede_registry_order() {
        let registry = ConverterRegistry::builder()
            .register(Fixed("First", 1))
            .register(Fixed("Second", 2))
            .build();
        let mut parameter = param(ParamType::of::<i64>());
        parameter
            .properties
            .insert(ADVERTISED_CONVERTERS_PROPERTY.into(), "Unknown, Second".into());
        match run(&registry, &parameter, None).await {
            ConversionResult::Succeeded(v) => assert_eq!(*v.downcast::<i64>().unwrap(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn collection_narrowing_reports_overflow() {
        let registry = ConverterRegistry::default();
        let result = run(
            &registry,
            &param(ParamType::of::<Vec<i32>>()),
            Some(TypedData::CollectionSint64(vec![1, i64::MAX])),
        )
        .await;
        assert!(matches!(result, ConversionResult::Failed(_)));
    }
}
