//! The dynamic value universe the evaluator operates on.
//!
//! Values span the JSON-ish scalars and containers plus three capsule kinds
//! (assets, archives and script callables) and two cross-cutting marks:
//! a value may be *unknown* (its concrete form is not settled yet, typical
//! during a dry run) and it may carry a *secret* mark that survives any
//! derivation.
//!

use std::collections::BTreeMap;
use std::fmt;

/// An asset capsule, either backed by a file on disk or by literal text.
///
#[derive(Clone, Debug, PartialEq)]
pub enum Asset {
    Path(String),
    Text(String),
}

/// An archive capsule. Only path-backed archives appear on this side of the
/// wire; the provider materializes them.
///
#[derive(Clone, Debug, PartialEq)]
pub enum Archive {
    Path(String),
}

/// A callable produced by the `func(...)` builtin: parameter names plus a
/// script body run by the embedded script engine on each call.
///
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptFunc {
    pub params: Vec<String>,
    pub body: String,
}

/// A dynamically-typed value.
///
/// `Secret` is a wrapper, not a type: `Secret(v)` is `v` with the secret
/// mark set. Lists, sets and tuples collapse into `List`; maps and objects
/// collapse into `Object` (the distinction only matters to the provider
/// schema, which is consulted separately).
///
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Unknown,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Asset(Asset),
    Archive(Archive),
    Func(ScriptFunc),
    Secret(Box<Value>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn object(entries: impl IntoIterator<Item = (String, Value)>) -> Value {
        Value::Object(entries.into_iter().collect())
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    /// True if the value, once unwrapped from any secret mark, is unknown.
    ///
    pub fn is_unknown(&self) -> bool {
        match self {
            Value::Unknown => true,
            Value::Secret(inner) => inner.is_unknown(),
            _ => false,
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, Value::Secret(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Strip the secret mark, reporting whether one was present.
    ///
    pub fn unmark(self) -> (Value, bool) {
        match self {
            Value::Secret(inner) => (inner.unmark().0, true),
            v => (v, false),
        }
    }

    /// Apply the secret mark. Idempotent.
    ///
    pub fn mark_secret(self) -> Value {
        match self {
            v @ Value::Secret(_) => v,
            v => Value::Secret(Box::new(v)),
        }
    }

    /// Re-apply the secret mark iff `secret` is set.
    ///
    pub fn restore_mark(self, secret: bool) -> Value {
        if secret {
            self.mark_secret()
        } else {
            self
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Secret(inner) => inner.as_str(),
            _ => None,
        }
    }

    /// A short name for diagnostics.
    ///
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Unknown => "unknown",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Object(_) => "object",
            Value::Asset(_) => "asset",
            Value::Archive(_) => "archive",
            Value::Func(_) => "function",
            Value::Secret(inner) => inner.type_name(),
        }
    }

    /// Convert a decoded JSON document (a configuration value) into the
    /// value universe.
    ///
    pub fn from_json(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(xs) => {
                Value::List(xs.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(m) => Value::Object(
                m.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Unknown => write!(f, "<unknown>"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{s}"),
            Value::List(xs) => {
                write!(f, "[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, "]")
            }
            Value::Object(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} = {v}")?;
                }
                write!(f, "}}")
            }
            Value::Asset(Asset::Path(p)) => write!(f, "asset({p})"),
            Value::Asset(Asset::Text(_)) => write!(f, "asset(<text>)"),
            Value::Archive(Archive::Path(p)) => write!(f, "archive({p})"),
            Value::Func(fun) => write!(f, "func({})", fun.params.join(", ")),
            Value::Secret(_) => write!(f, "<secret>"),
        }
    }
}

/// Render a number the way the template engine does: integral values print
/// without a fractional part.
///
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_mark_roundtrip() {
        let v = Value::string("hush").mark_secret();
        assert!(v.is_secret());

        // Idempotent
        //
        let v = v.mark_secret();
        let (inner, was_secret) = v.unmark();
        assert!(was_secret);
        assert_eq!(inner, Value::string("hush"));
    }

    #[test]
    fn test_unknown_under_mark() {
        let v = Value::Unknown.mark_secret();
        assert!(v.is_unknown());
        assert!(v.is_secret());
    }

    #[test]
    fn test_from_json() {
        let json: serde_json::Value = serde_json::from_str(r#"{"a": [1, "x", true, null]}"#).unwrap();
        let v = Value::from_json(json);
        assert_eq!(
            v,
            Value::object([(
                "a".to_string(),
                Value::List(vec![
                    Value::Number(1.0),
                    Value::string("x"),
                    Value::Bool(true),
                    Value::Null,
                ]),
            )])
        );
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-2.0), "-2");
        assert_eq!(format_number(1.5), "1.5");
    }
}
