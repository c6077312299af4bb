//! Value codec: typed conversion between host values and script values.
//!
//! `decode` never panics and never raises; it returns `None` for "not
//! convertible" so call sites can build positional type-mismatch errors
//! with the attempted and expected type names. `encode` is infallible by
//! contract: host values that cannot be represented script-side encode as
//! nil, because many encode sites have no way to propagate a failure.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Position, ScriptError, ScriptResult};
use crate::value::ScriptValue;

/// Bidirectional conversion between one host type and the script value
/// model. Implemented for primitives, optionals, arrays, and string-keyed
/// maps; bridged accessors declare their concrete type once through this
/// trait so dispatch thunks know which specialization to call.
pub trait ScriptConvert: Sized {
    /// Script-facing name of this type, used in mismatch diagnostics.
    fn type_name() -> String;

    fn encode(&self) -> ScriptValue;

    /// Returns `None` when `value` is not convertible to `Self`.
    fn decode(value: &ScriptValue) -> Option<Self>;

    /// Decode with a positional type-mismatch error on failure.
    fn decode_at(value: &ScriptValue, position: Position) -> ScriptResult<Self> {
        Self::decode(value).ok_or_else(|| {
            ScriptError::mismatch(Self::type_name(), value.type_name(), position)
        })
    }
}

impl ScriptConvert for bool {
    fn type_name() -> String {
        "boolean".into()
    }

    fn encode(&self) -> ScriptValue {
        ScriptValue::Bool(*self)
    }

    fn decode(value: &ScriptValue) -> Option<Self> {
        value.as_bool()
    }
}

macro_rules! convert_integer {
    ($($ty:ty),+) => {$(
        impl ScriptConvert for $ty {
            fn type_name() -> String {
                "integer".into()
            }

            fn encode(&self) -> ScriptValue {
                // Out-of-range values (u64-sized usize, in theory) have no
                // script representation and encode as nil.
                i64::try_from(*self).map_or(ScriptValue::Nil, ScriptValue::Integer)
            }

            fn decode(value: &ScriptValue) -> Option<Self> {
                value.as_integer().and_then(|i| <$ty>::try_from(i).ok())
            }
        }
    )+};
}

convert_integer!(i8, i16, i32, i64, isize, u8, u16, u32, usize);

impl ScriptConvert for f64 {
    fn type_name() -> String {
        "number".into()
    }

    fn encode(&self) -> ScriptValue {
        ScriptValue::Number(*self)
    }

    fn decode(value: &ScriptValue) -> Option<Self> {
        value.as_number()
    }
}

impl ScriptConvert for f32 {
    fn type_name() -> String {
        "number".into()
    }

    fn encode(&self) -> ScriptValue {
        ScriptValue::Number(f64::from(*self))
    }

    fn decode(value: &ScriptValue) -> Option<Self> {
        value.as_number().map(|n| n as f32)
    }
}

impl ScriptConvert for String {
    fn type_name() -> String {
        "string".into()
    }

    fn encode(&self) -> ScriptValue {
        ScriptValue::String(self.clone())
    }

    fn decode(value: &ScriptValue) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

/// Identity conversion, for call sites that want the raw tagged value.
impl ScriptConvert for ScriptValue {
    fn type_name() -> String {
        "value".into()
    }

    fn encode(&self) -> ScriptValue {
        self.clone()
    }

    fn decode(value: &ScriptValue) -> Option<Self> {
        Some(value.clone())
    }
}

/// Absence encodes as nil; presence recurses into the wrapped type.
/// Nested optionals collapse to the innermost presence or absence: extra
/// levels of optionality carry no script-visible meaning.
impl<T: ScriptConvert> ScriptConvert for Option<T> {
    fn type_name() -> String {
        format!("optional {}", T::type_name())
    }

    fn encode(&self) -> ScriptValue {
        match self {
            Some(inner) => inner.encode(),
            None => ScriptValue::Nil,
        }
    }

    fn decode(value: &ScriptValue) -> Option<Self> {
        if value.is_nil() {
            Some(None)
        } else {
            T::decode(value).map(Some)
        }
    }
}

impl<T: ScriptConvert> ScriptConvert for Vec<T> {
    fn type_name() -> String {
        format!("array of {}", T::type_name())
    }

    fn encode(&self) -> ScriptValue {
        ScriptValue::Array(self.iter().map(ScriptConvert::encode).collect())
    }

    fn decode(value: &ScriptValue) -> Option<Self> {
        value.as_array()?.iter().map(T::decode).collect()
    }
}

impl<T: ScriptConvert> ScriptConvert for BTreeMap<String, T> {
    fn type_name() -> String {
        format!("map of {}", T::type_name())
    }

    fn encode(&self) -> ScriptValue {
        ScriptValue::Map(
            self.iter()
                .map(|(key, value)| (key.clone(), value.encode()))
                .collect(),
        )
    }

    fn decode(value: &ScriptValue) -> Option<Self> {
        value
            .as_map()?
            .iter()
            .map(|(key, value)| T::decode(value).map(|v| (key.clone(), v)))
            .collect()
    }
}

impl<T: ScriptConvert> ScriptConvert for HashMap<String, T> {
    fn type_name() -> String {
        format!("map of {}", T::type_name())
    }

    fn encode(&self) -> ScriptValue {
        ScriptValue::Map(
            self.iter()
                .map(|(key, value)| (key.clone(), value.encode()))
                .collect(),
        )
    }

    fn decode(value: &ScriptValue) -> Option<Self> {
        value
            .as_map()?
            .iter()
            .map(|(key, value)| T::decode(value).map(|v| (key.clone(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: ScriptConvert + PartialEq + std::fmt::Debug + Clone>(value: T) {
        let encoded = value.encode();
        assert_eq!(T::decode(&encoded), Some(value));
    }

    #[test]
    fn primitives_roundtrip() {
        roundtrip(true);
        roundtrip(false);
        roundtrip(42i64);
        roundtrip(-7i32);
        roundtrip(255u8);
        roundtrip(1.5f64);
        roundtrip(String::from("hello"));
        roundtrip(String::from("embedded\0nul"));
    }

    #[test]
    fn containers_roundtrip() {
        roundtrip(vec![1i64, 2, 3]);
        roundtrip(vec![Some(1i64), None, Some(3)]);
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1i64);
        map.insert("b".to_string(), 2i64);
        roundtrip(map);
    }

    #[test]
    fn integer_decode_rejects_fractional() {
        assert_eq!(i64::decode(&ScriptValue::Number(2.5)), None);
        assert_eq!(i64::decode(&ScriptValue::Number(2.0)), Some(2));
    }

    #[test]
    fn narrow_integer_decode_rejects_overflow() {
        assert_eq!(i8::decode(&ScriptValue::Integer(300)), None);
        assert_eq!(u8::decode(&ScriptValue::Integer(-1)), None);
        assert_eq!(u8::decode(&ScriptValue::Integer(200)), Some(200));
    }

    #[test]
    fn nested_optionals_collapse() {
        let present: Option<Option<Option<i64>>> = Some(Some(Some(9)));
        assert_eq!(present.encode(), ScriptValue::Integer(9));

        let absent_inner: Option<Option<Option<i64>>> = Some(Some(None));
        assert_eq!(absent_inner.encode(), ScriptValue::Nil);

        let absent_outer: Option<Option<Option<i64>>> = None;
        assert_eq!(absent_outer.encode(), ScriptValue::Nil);

        // Decoding nil lands on the outermost absence.
        assert_eq!(
            <Option<Option<i64>>>::decode(&ScriptValue::Nil),
            Some(None)
        );
    }

    #[test]
    fn decode_at_reports_position() {
        let err = i64::decode_at(
            &ScriptValue::String("x".into()),
            Position::Argument { index: 1, name: None },
        )
        .unwrap_err();
        match err {
            ScriptError::TypeMismatch { expected, actual, .. } => {
                assert_eq!(expected, "integer");
                assert_eq!(actual, "string");
            }
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn mixed_array_does_not_decode_as_homogeneous() {
        let mixed = ScriptValue::array(vec![
            ScriptValue::Integer(1),
            ScriptValue::String("two".into()),
        ]);
        assert_eq!(<Vec<i64>>::decode(&mixed), None);
    }
}
