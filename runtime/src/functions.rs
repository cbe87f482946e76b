//! The builtin function library available to every expression.
//!
//! | name        | semantics                                              |
//! |-------------|--------------------------------------------------------|
//! | `fileAsset` | path-backed asset capsule                              |
//! | `mimeType`  | MIME type by file extension                            |
//! | `readDir`   | directory entry names                                  |
//! | `eval`      | run a single-expression script                         |
//! | `func`      | build a script-backed callable                         |
//! | `invoke`    | call a provider function through the monitor           |
//!
//! Builtins follow the universal marks discipline: unknown arguments
//! produce unknown results, secret-marked arguments produce secret-marked
//! results. `invoke` handles its own arguments (it needs the raw shapes).
//!

use crate::diag::{Diagnostic, Diagnostics};
use crate::eval::{EvalResult, Evaluator};
use crate::invoke;
use crate::script;
use crate::value::{Asset, ScriptFunc, Value};

const BUILTINS: &[&str] = &["fileAsset", "mimeType", "readDir", "eval", "func", "invoke"];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn err(msg: impl Into<String>) -> Diagnostics {
    Diagnostic::error(msg).into()
}

pub async fn call_builtin(ev: &Evaluator<'_>, name: &str, args: Vec<Value>) -> EvalResult {
    if name == "invoke" {
        return invoke::invoke(ev, args).await;
    }

    let secret = args.iter().any(Value::is_secret);
    if args.iter().any(Value::is_unknown) {
        return Ok(Value::Unknown.restore_mark(secret));
    }
    let args: Vec<Value> = args.into_iter().map(|a| a.unmark().0).collect();

    let out = match name {
        "fileAsset" => file_asset(&args)?,
        "mimeType" => mime_type(&args)?,
        "readDir" => read_dir(&args)?,
        "eval" => eval_src(&args)?,
        "func" => make_func(&args)?,
        other => return Err(err(format!("call to unknown function \"{other}\""))),
    };
    Ok(out.restore_mark(secret))
}

fn one_string_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a str, Diagnostics> {
    match args {
        [Value::String(s)] => Ok(s),
        _ => Err(err(format!("{name} expects a single string argument"))),
    }
}

fn file_asset(args: &[Value]) -> EvalResult {
    let path = one_string_arg("fileAsset", args)?;
    Ok(Value::Asset(Asset::Path(path.to_owned())))
}

fn mime_type(args: &[Value]) -> EvalResult {
    let filename = one_string_arg("mimeType", args)?;
    let mime = mime_guess::from_path(filename)
        .first_raw()
        .unwrap_or_default();
    Ok(Value::string(mime))
}

fn read_dir(args: &[Value]) -> EvalResult {
    let path = one_string_arg("readDir", args)?;
    let entries =
        std::fs::read_dir(path).map_err(|e| err(format!("can not read directory {path}: {e}")))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| err(format!("can not read directory {path}: {e}")))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(Value::List(names.into_iter().map(Value::String).collect()))
}

fn eval_src(args: &[Value]) -> EvalResult {
    let src = one_string_arg("eval", args)?;
    script::eval_script(src)
}

/// `func(name..., body)`: every argument is a string; the last is the script
/// body, the preceding ones are parameter names.
///
fn make_func(args: &[Value]) -> EvalResult {
    if args.is_empty() {
        return Err(err("func expects parameter names followed by a body"));
    }
    let mut strings = Vec::with_capacity(args.len());
    for a in args {
        match a {
            Value::String(s) => strings.push(s.clone()),
            other => {
                return Err(err(format!(
                    "func arguments must be strings, got {}",
                    other.type_name()
                )))
            }
        }
    }
    let body = strings.pop().unwrap_or_default();
    Ok(Value::Func(ScriptFunc {
        params: strings,
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use std::io::Write;

    async fn call(name: &str, args: Vec<Value>) -> EvalResult {
        let ctx = test_context();
        let ev = Evaluator::new(&ctx);
        call_builtin(&ev, name, args).await
    }

    #[tokio::test]
    async fn test_file_asset() {
        let v = call("fileAsset", vec![Value::string("site/index.html")])
            .await
            .unwrap();
        assert_eq!(v, Value::Asset(Asset::Path("site/index.html".to_string())));
    }

    #[tokio::test]
    async fn test_mime_type() {
        assert_eq!(
            call("mimeType", vec![Value::string("page.html")]).await.unwrap(),
            Value::string("text/html")
        );
        assert_eq!(
            call("mimeType", vec![Value::string("noext")]).await.unwrap(),
            Value::string("")
        );
    }

    #[tokio::test]
    async fn test_read_dir_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.txt", "a.txt", "c.txt"] {
            let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
            f.write_all(b"x").unwrap();
        }

        let v = call(
            "readDir",
            vec![Value::string(dir.path().to_string_lossy().into_owned())],
        )
        .await
        .unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::string("a.txt"),
                Value::string("b.txt"),
                Value::string("c.txt"),
            ])
        );
    }

    #[tokio::test]
    async fn test_eval_and_func() {
        assert_eq!(
            call("eval", vec![Value::string("6 * 7")]).await.unwrap(),
            Value::Number(42.0)
        );

        let f = call(
            "func",
            vec![
                Value::string("a"),
                Value::string("b"),
                Value::string("a + b"),
            ],
        )
        .await
        .unwrap();
        match f {
            Value::Func(f) => {
                assert_eq!(f.params, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(f.body, "a + b");
            }
            other => panic!("func returned {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_and_secret_discipline() {
        assert_eq!(
            call("mimeType", vec![Value::Unknown]).await.unwrap(),
            Value::Unknown
        );

        let v = call("mimeType", vec![Value::string("a.json").mark_secret()])
            .await
            .unwrap();
        assert!(v.is_secret());
        assert_eq!(v.unmark().0, Value::string("application/json"));
    }
}
