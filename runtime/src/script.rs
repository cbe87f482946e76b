//! Bridge to the embedded script engine backing the `eval` and `func`
//! builtins.
//!
//! Script values convert both ways against the value universe; capsule
//! values (assets, archives, callables) ride through scripts opaquely inside
//! a wrapper object and come back out unchanged.
//!

use rhai::{Dynamic, Engine};

use crate::diag::{Diagnostic, Diagnostics};
use crate::value::{ScriptFunc, Value};

fn err(msg: impl Into<String>) -> Diagnostics {
    Diagnostic::error(msg).into()
}

/// Opaque carrier for values the script engine has no native shape for.
///
#[derive(Clone)]
struct CapsuleObj {
    value: Value,
}

/// Compile and run a single-expression script, converting the result.
///
pub fn eval_script(src: &str) -> Result<Value, Diagnostics> {
    let engine = Engine::new();
    let result = engine
        .eval_expression::<Dynamic>(src)
        .map_err(|e| err(format!("script error: {e}")))?;
    dynamic_to_value(result)
}

/// Call a `func(...)`-produced callable: bind positional arguments to the
/// declared parameter names, expose the full argument list as `argv`, then
/// run the body.
///
/// Unknown arguments short-circuit to an unknown result; secret-marked
/// arguments make the result secret-marked.
///
pub fn call_func(f: &ScriptFunc, args: &[Value]) -> Result<Value, Diagnostics> {
    let secret = args.iter().any(Value::is_secret);
    if args.iter().any(Value::is_unknown) {
        return Ok(Value::Unknown.restore_mark(secret));
    }
    let stripped: Vec<Value> = args.iter().map(|a| a.clone().unmark().0).collect();

    let engine = Engine::new();
    let mut scope = rhai::Scope::new();

    for (i, param) in f.params.iter().enumerate() {
        let d = match stripped.get(i) {
            Some(v) => value_to_dynamic(v)?,
            None => Dynamic::UNIT,
        };
        scope.push_dynamic(param.clone(), d);
    }

    let argv: rhai::Array = stripped
        .iter()
        .map(value_to_dynamic)
        .collect::<Result<_, _>>()?;
    scope.push_dynamic("argv", Dynamic::from(argv));

    let result = engine
        .eval_with_scope::<Dynamic>(&mut scope, &f.body)
        .map_err(|e| err(format!("script error: {e}")))?;

    Ok(dynamic_to_value(result)?.restore_mark(secret))
}

fn value_to_dynamic(v: &Value) -> Result<Dynamic, Diagnostics> {
    match v {
        Value::Null => Ok(Dynamic::UNIT),
        Value::Unknown => Err(err("unexpected unknown value in script")),
        Value::Bool(b) => Ok((*b).into()),
        Value::Number(n) => Ok((*n).into()),
        Value::String(s) => Ok(s.clone().into()),
        Value::List(xs) => {
            let arr: rhai::Array = xs.iter().map(value_to_dynamic).collect::<Result<_, _>>()?;
            Ok(Dynamic::from(arr))
        }
        Value::Object(m) => {
            let mut map = rhai::Map::new();
            for (k, x) in m {
                map.insert(k.as_str().into(), value_to_dynamic(x)?);
            }
            Ok(Dynamic::from(map))
        }
        Value::Secret(inner) => value_to_dynamic(inner),
        capsule => Ok(Dynamic::from(CapsuleObj {
            value: capsule.clone(),
        })),
    }
}

fn dynamic_to_value(d: Dynamic) -> Result<Value, Diagnostics> {
    if d.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = d.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = d.as_int() {
        return Ok(Value::Number(i as f64));
    }
    if let Ok(f) = d.as_float() {
        return Ok(Value::Number(f));
    }
    if let Ok(c) = d.as_char() {
        return Ok(Value::String(c.to_string()));
    }
    if let Ok(s) = d.clone().into_string() {
        return Ok(Value::String(s));
    }
    if let Some(capsule) = d.clone().try_cast::<CapsuleObj>() {
        return Ok(capsule.value);
    }
    if let Some(arr) = d.clone().try_cast::<rhai::Array>() {
        let mut out = Vec::with_capacity(arr.len());
        for e in arr {
            out.push(dynamic_to_value(e)?);
        }
        return Ok(Value::List(out));
    }
    if let Some(map) = d.clone().try_cast::<rhai::Map>() {
        let mut out = std::collections::BTreeMap::new();
        for (k, e) in map {
            out.insert(k.to_string(), dynamic_to_value(e)?);
        }
        return Ok(Value::Object(out));
    }
    if let Some(blob) = d.clone().try_cast::<rhai::Blob>() {
        return Ok(Value::List(
            blob.into_iter().map(|b| Value::Number(b as f64)).collect(),
        ));
    }
    if d.clone().try_cast::<rhai::FnPtr>().is_some() {
        // Script-side closures do not cross back into the value universe.
        return Ok(Value::Null);
    }

    Err(err(format!(
        "unexpected script value of type {}",
        d.type_name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Asset;

    #[test]
    fn test_eval_expression() {
        assert_eq!(eval_script("21 * 2").unwrap(), Value::Number(42.0));
        assert_eq!(
            eval_script("\"ab\" + \"cd\"").unwrap(),
            Value::string("abcd")
        );
        assert!(eval_script("][").is_err());
    }

    #[test]
    fn test_call_func_binds_params_and_argv() {
        let f = ScriptFunc {
            params: vec!["a".to_string(), "b".to_string()],
            body: "a + b + argv.len()".to_string(),
        };
        let out = call_func(&f, &[Value::Number(1.0), Value::Number(2.0)]).unwrap();
        assert_eq!(out, Value::Number(5.0));
    }

    #[test]
    fn test_call_func_unknown_short_circuits() {
        let f = ScriptFunc {
            params: vec!["a".to_string()],
            body: "a".to_string(),
        };
        assert_eq!(call_func(&f, &[Value::Unknown]).unwrap(), Value::Unknown);
    }

    #[test]
    fn test_call_func_keeps_secret_mark() {
        let f = ScriptFunc {
            params: vec!["a".to_string()],
            body: "a * 2".to_string(),
        };
        let out = call_func(&f, &[Value::Number(3.0).mark_secret()]).unwrap();
        assert!(out.is_secret());
        assert_eq!(out.unmark().0, Value::Number(6.0));
    }

    #[test]
    fn test_capsules_roundtrip_opaquely() {
        let f = ScriptFunc {
            params: vec!["a".to_string()],
            body: "a".to_string(),
        };
        let asset = Value::Asset(Asset::Path("site/index.html".to_string()));
        assert_eq!(call_func(&f, &[asset.clone()]).unwrap(), asset);
    }

    #[test]
    fn test_containers_convert() {
        let f = ScriptFunc {
            params: vec![],
            body: "#{ a: [1, 2.5, true, \"x\"] }".to_string(),
        };
        let out = call_func(&f, &[]).unwrap();
        assert_eq!(
            out,
            Value::object([(
                "a".to_string(),
                Value::List(vec![
                    Value::Number(1.0),
                    Value::Number(2.5),
                    Value::Bool(true),
                    Value::string("x"),
                ]),
            )])
        );
    }
}
