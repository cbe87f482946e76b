//! Provider function invocation.
//!
//! `invoke(token, args, options?)` is dynamically typed: the schema of the
//! named function is consulted at call time. Arguments are checked against
//! the declared args type with relaxed object conformance, marshalled with
//! unknowns dropped, and the response is unmarshalled with declared output
//! properties null-filled.
//!

use std::collections::BTreeMap;

use intendant_proto::InvokeRequest;

use crate::diag::{Diagnostic, Diagnostics};
use crate::eval::{EvalResult, Evaluator};
use crate::marshal::{marshal_struct, unmarshal_struct};
use crate::schema::{decompose_token, SchemaType};
use crate::value::Value;

fn err(msg: impl Into<String>) -> Diagnostics {
    Diagnostic::error(msg).into()
}

pub async fn invoke(ev: &Evaluator<'_>, args: Vec<Value>) -> EvalResult {
    if args.len() < 2 || args.len() > 3 {
        return Err(err(
            "invoke expects a function token, an arguments object, and optional options",
        ));
    }

    let mut args = args.into_iter();
    let (token, token_secret) = match args.next() {
        Some(v) => v.unmark(),
        None => return Err(err("missing function token")),
    };
    let (call_args, args_secret) = match args.next() {
        Some(v) => v.unmark(),
        None => return Err(err("missing invoke arguments")),
    };
    // Options (parent/provider selection) are accepted but not implemented.
    let _options = args.next();

    let secret = token_secret || args_secret;
    if token.is_unknown() {
        return Ok(Value::Unknown.restore_mark(secret));
    }
    let token = match token {
        Value::String(s) => s,
        other => {
            return Err(err(format!(
                "invoke function token must be a string, got {}",
                other.type_name()
            )))
        }
    };

    let (pkg_name, _, _) = decompose_token(&token).map_err(|e| err(e.to_string()))?;
    let schema = ev
        .ctx
        .schemas
        .ensure(pkg_name)
        .map_err(|e| err(e.to_string()))?;
    let function = schema.function(&token).map_err(|e| err(e.to_string()))?;

    // Relaxed assignability check of the provided arguments.
    //
    let mut problems = Vec::new();
    check_assignability(&function.args_type, &value_type(&call_args), "", &mut problems);
    if !problems.is_empty() {
        return Err(Diagnostic::error(format!("invalid arguments to {token}"))
            .with_detail(problems.join("; "))
            .into());
    }

    let rpc_args = match &call_args {
        Value::Null => Default::default(),
        other => marshal_struct(other, false)?,
    };

    let resp = ev
        .ctx
        .monitor
        .invoke(InvokeRequest {
            tok: function.token.clone(),
            args: Some(rpc_args),
            provider: String::new(),
        })
        .await
        .map_err(|e| err(e.to_string()))?;

    if !resp.failures.is_empty() {
        let reasons: Vec<String> = resp
            .failures
            .iter()
            .map(|f| format!("failed to invoke {token}: {} ({})", f.reason, f.property))
            .collect();
        return Err(err(reasons.join("; ")));
    }

    let mut ret = match resp.r#return.as_ref().map(unmarshal_struct) {
        Some(Value::Object(m)) => m,
        _ => BTreeMap::new(),
    };
    for prop in &function.outputs {
        ret.entry(prop.clone()).or_insert(Value::Null);
    }

    Ok(Value::Object(ret).restore_mark(secret))
}

/// The static type of a value, for assignability checking.
///
pub fn value_type(v: &Value) -> SchemaType {
    match v {
        Value::Null | Value::Unknown | Value::Func(_) => SchemaType::Dynamic,
        Value::Bool(_) => SchemaType::Bool,
        Value::Number(_) => SchemaType::Number,
        Value::String(_) => SchemaType::String,
        Value::Asset(_) => SchemaType::Asset,
        Value::Archive(_) => SchemaType::Archive,
        Value::List(_) => SchemaType::List(Box::new(SchemaType::Dynamic)),
        Value::Object(m) => SchemaType::Object(
            m.iter().map(|(k, x)| (k.clone(), value_type(x))).collect(),
        ),
        Value::Secret(inner) => value_type(inner),
    }
}

/// Relaxed assignability: anything converts to or from the dynamic type;
/// objects conform attribute by attribute.
///
pub fn check_assignability(dst: &SchemaType, src: &SchemaType, path: &str, out: &mut Vec<String>) {
    match (dst, src) {
        (SchemaType::Dynamic, _) | (_, SchemaType::Dynamic) => {}
        (SchemaType::Object(dst_attrs), SchemaType::Object(src_attrs)) => {
            for (name, src_attr) in src_attrs {
                let sub_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{path}.{name}")
                };
                match dst_attrs.get(name) {
                    Some(dst_attr) => check_assignability(dst_attr, src_attr, &sub_path, out),
                    None => out.push(format!("unsupported attribute \"{sub_path}\"")),
                }
            }
        }
        (SchemaType::List(d), SchemaType::List(s)) => check_assignability(d, s, path, out),
        (SchemaType::Map(d), SchemaType::Map(s)) => check_assignability(d, s, path, out),
        _ => {
            if dst != src {
                let at = if path.is_empty() {
                    String::new()
                } else {
                    format!(" at \"{path}\"")
                };
                out.push(format!(
                    "can not assign {} to {}{at}",
                    src.display_name(),
                    dst.display_name()
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(attrs: &[(&str, SchemaType)]) -> SchemaType {
        SchemaType::Object(
            attrs
                .iter()
                .map(|(k, t)| (k.to_string(), t.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_assignability_relaxed_objects() {
        let dst = obj(&[
            ("name", SchemaType::String),
            ("count", SchemaType::Number),
        ]);

        // Subset of attributes conforms.
        //
        let src = obj(&[("name", SchemaType::String)]);
        let mut problems = Vec::new();
        check_assignability(&dst, &src, "", &mut problems);
        assert!(problems.is_empty());

        // Extra attribute does not.
        //
        let src = obj(&[("nope", SchemaType::String)]);
        let mut problems = Vec::new();
        check_assignability(&dst, &src, "", &mut problems);
        assert_eq!(problems, vec!["unsupported attribute \"nope\"".to_string()]);

        // Type clash surfaces with its path.
        //
        let src = obj(&[("count", SchemaType::String)]);
        let mut problems = Vec::new();
        check_assignability(&dst, &src, "", &mut problems);
        assert_eq!(
            problems,
            vec!["can not assign string to number at \"count\"".to_string()]
        );
    }

    #[test]
    fn test_assignability_dynamic_passes() {
        let mut problems = Vec::new();
        check_assignability(&SchemaType::String, &SchemaType::Dynamic, "", &mut problems);
        check_assignability(&SchemaType::Dynamic, &SchemaType::Number, "", &mut problems);
        assert!(problems.is_empty());
    }

    #[test]
    fn test_value_type() {
        let v = Value::object([("a".to_string(), Value::Number(1.0).mark_secret())]);
        assert_eq!(
            value_type(&v),
            SchemaType::Object(std::collections::BTreeMap::from([(
                "a".to_string(),
                SchemaType::Number
            )]))
        );
    }
}
