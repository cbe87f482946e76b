//! Conversion between the value universe and the protobuf property model
//! used on the monitor wire.
//!
//! Unknowns, secrets, assets and archives have no protobuf representation of
//! their own; they travel as specially-shaped values carrying well-known
//! signature constants. The constants are part of the externally specified
//! protocol and must not change.
//!

use std::collections::BTreeMap;

use prost_types::value::Kind;
use prost_types::{ListValue, Struct, Value as PbValue};

use crate::diag::{Diagnostic, Diagnostics};
use crate::value::{Archive, Asset, Value};

/// Field holding the signature of a specially-shaped property object.
pub const SIG_KEY: &str = "4dabf18193072939515e22adb298388d";
/// Signature of asset-shaped objects.
pub const ASSET_SIG: &str = "c44067f5952c0a294b673a41bacd8c17";
/// Signature of archive-shaped objects.
pub const ARCHIVE_SIG: &str = "0def7320c3a5731c473e5ecbe6d01bc7";
/// Signature of secret-shaped objects.
pub const SECRET_SIG: &str = "1b47061264138c4ac30d75fd1eb44270";
/// Sentinel standing in for a value that is not yet known.
pub const UNKNOWN_VALUE: &str = "04da6b54-80e4-46f7-96ec-b56ff0331ba9";

fn pb(kind: Kind) -> PbValue {
    PbValue { kind: Some(kind) }
}

fn pb_string(s: impl Into<String>) -> PbValue {
    pb(Kind::StringValue(s.into()))
}

fn sig_struct(sig: &str, extra: impl IntoIterator<Item = (String, PbValue)>) -> PbValue {
    let mut fields = BTreeMap::from([(SIG_KEY.to_string(), pb_string(sig))]);
    fields.extend(extra);
    pb(Kind::StructValue(Struct { fields }))
}

/// Marshal one value. `Ok(None)` means the value must be dropped from its
/// container (an unknown while unknowns are not kept).
///
pub fn marshal_value(v: &Value, keep_unknowns: bool) -> Result<Option<PbValue>, Diagnostics> {
    match v {
        Value::Null => Ok(Some(pb(Kind::NullValue(0)))),
        Value::Unknown => {
            if keep_unknowns {
                Ok(Some(pb_string(UNKNOWN_VALUE)))
            } else {
                Ok(None)
            }
        }
        Value::Secret(inner) => {
            let inner = match marshal_value(inner, keep_unknowns)? {
                Some(inner) => inner,
                None => return Ok(None),
            };
            Ok(Some(sig_struct(SECRET_SIG, [("value".to_string(), inner)])))
        }
        Value::Bool(b) => Ok(Some(pb(Kind::BoolValue(*b)))),
        Value::Number(n) => Ok(Some(pb(Kind::NumberValue(*n)))),
        Value::String(s) => Ok(Some(pb_string(s.clone()))),
        Value::List(xs) => {
            let mut values = Vec::with_capacity(xs.len());
            for x in xs {
                if x.is_null() {
                    continue;
                }
                if let Some(m) = marshal_value(x, keep_unknowns)? {
                    values.push(m);
                }
            }
            Ok(Some(pb(Kind::ListValue(ListValue { values }))))
        }
        Value::Object(m) => {
            let mut fields = BTreeMap::new();
            for (k, x) in m {
                if x.is_null() {
                    continue;
                }
                if let Some(m) = marshal_value(x, keep_unknowns)? {
                    fields.insert(k.clone(), m);
                }
            }
            Ok(Some(pb(Kind::StructValue(Struct { fields }))))
        }
        Value::Asset(Asset::Path(p)) => Ok(Some(sig_struct(
            ASSET_SIG,
            [("path".to_string(), pb_string(p.clone()))],
        ))),
        Value::Asset(Asset::Text(t)) => Ok(Some(sig_struct(
            ASSET_SIG,
            [("text".to_string(), pb_string(t.clone()))],
        ))),
        Value::Archive(Archive::Path(p)) => Ok(Some(sig_struct(
            ARCHIVE_SIG,
            [("path".to_string(), pb_string(p.clone()))],
        ))),
        Value::Func(_) => Err(Diagnostic::error("can not marshal a function value").into()),
    }
}

/// Marshal an object-shaped value into a property struct; null entries are
/// skipped, unknown entries are kept iff `keep_unknowns`.
///
pub fn marshal_struct(v: &Value, keep_unknowns: bool) -> Result<Struct, Diagnostics> {
    let (v, _) = v.clone().unmark();
    let m = match v {
        Value::Object(m) => m,
        other => {
            return Err(Diagnostic::error(format!(
                "expected an object to marshal, got {}",
                other.type_name()
            ))
            .into())
        }
    };

    let mut fields = BTreeMap::new();
    for (k, x) in &m {
        if x.is_null() {
            continue;
        }
        if let Some(mv) = marshal_value(x, keep_unknowns)? {
            fields.insert(k.clone(), mv);
        }
    }
    Ok(Struct { fields })
}

/// Unmarshal one wire value back into the value universe. Computed wire
/// values become unknown.
///
pub fn unmarshal_value(v: &PbValue) -> Value {
    let kind = match &v.kind {
        Some(kind) => kind,
        None => return Value::Null,
    };
    match kind {
        Kind::NullValue(_) => Value::Null,
        Kind::NumberValue(n) => Value::Number(*n),
        Kind::BoolValue(b) => Value::Bool(*b),
        Kind::StringValue(s) => {
            if s == UNKNOWN_VALUE {
                Value::Unknown
            } else {
                Value::String(s.clone())
            }
        }
        Kind::ListValue(l) => Value::List(l.values.iter().map(unmarshal_value).collect()),
        Kind::StructValue(s) => unmarshal_sig_struct(s),
    }
}

fn field_string(s: &Struct, key: &str) -> Option<String> {
    match s.fields.get(key)?.kind.as_ref()? {
        Kind::StringValue(v) => Some(v.clone()),
        _ => None,
    }
}

fn unmarshal_sig_struct(s: &Struct) -> Value {
    match field_string(s, SIG_KEY).as_deref() {
        Some(SECRET_SIG) => {
            let inner = s
                .fields
                .get("value")
                .map(unmarshal_value)
                .unwrap_or(Value::Null);
            inner.mark_secret()
        }
        Some(ASSET_SIG) => {
            if let Some(path) = field_string(s, "path") {
                Value::Asset(Asset::Path(path))
            } else {
                Value::Asset(Asset::Text(field_string(s, "text").unwrap_or_default()))
            }
        }
        Some(ARCHIVE_SIG) => {
            Value::Archive(Archive::Path(field_string(s, "path").unwrap_or_default()))
        }
        _ => Value::Object(
            s.fields
                .iter()
                .map(|(k, v)| (k.clone(), unmarshal_value(v)))
                .collect(),
        ),
    }
}

/// Unmarshal a property struct into an object value.
///
pub fn unmarshal_struct(s: &Struct) -> Value {
    Value::Object(
        s.fields
            .iter()
            .map(|(k, v)| (k.clone(), unmarshal_value(v)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Value::Bool(true))]
    #[case(Value::Number(42.5))]
    #[case(Value::string("hello"))]
    #[case(Value::List(vec![Value::Number(1.0), Value::string("two")]))]
    #[case(Value::object([
        ("a".to_string(), Value::Number(1.0)),
        ("b".to_string(), Value::List(vec![Value::Bool(false)])),
    ]))]
    #[case(Value::Asset(Asset::Path("dist/site.zip".to_string())))]
    #[case(Value::Archive(Archive::Path("dist".to_string())))]
    fn test_roundtrip_known_values(#[case] v: Value) {
        let m = marshal_value(&v, false).unwrap().unwrap();
        assert_eq!(unmarshal_value(&m), v);
    }

    #[test]
    fn test_secret_wire_shape() {
        let v = Value::string("hush").mark_secret();
        let m = marshal_value(&v, false).unwrap().unwrap();

        match m.kind.as_ref().unwrap() {
            Kind::StructValue(s) => {
                assert_eq!(field_string(s, SIG_KEY).as_deref(), Some(SECRET_SIG));
            }
            other => panic!("secret marshalled to {other:?}"),
        }

        assert_eq!(unmarshal_value(&m), v);
    }

    #[test]
    fn test_unknowns_dropped_or_kept() {
        assert!(marshal_value(&Value::Unknown, false).unwrap().is_none());

        let kept = marshal_value(&Value::Unknown, true).unwrap().unwrap();
        assert_eq!(unmarshal_value(&kept), Value::Unknown);
    }

    #[test]
    fn test_containers_skip_nulls() {
        let v = Value::List(vec![Value::Null, Value::Number(1.0)]);
        let m = marshal_value(&v, false).unwrap().unwrap();
        assert_eq!(unmarshal_value(&m), Value::List(vec![Value::Number(1.0)]));

        let v = Value::object([
            ("keep".to_string(), Value::Bool(true)),
            ("drop".to_string(), Value::Null),
        ]);
        let s = marshal_struct(&v, false).unwrap();
        assert!(s.fields.contains_key("keep"));
        assert!(!s.fields.contains_key("drop"));
    }

    #[test]
    fn test_function_values_do_not_marshal() {
        let v = Value::Func(crate::value::ScriptFunc {
            params: vec![],
            body: "1".to_string(),
        });
        assert!(marshal_value(&v, false).is_err());
    }

    #[test]
    fn test_marshal_struct_rejects_non_objects() {
        assert!(marshal_struct(&Value::Number(3.0), false).is_err());
    }
}
