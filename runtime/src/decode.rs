//! Schema-driven decoding of resource bodies.
//!
//! A resource body is an HCL attribute/block tree; the resource's decoding
//! spec says which names are typed attributes, which are nested blocks,
//! repeatable blocks or labelled block maps. Decoding evaluates every
//! attribute expression in the given scope and assembles one object value
//! with every spec-declared property present (null when absent).
//!

use std::collections::{BTreeMap, BTreeSet};

use futures::future::BoxFuture;
use futures::FutureExt;
use hcl::structure::{Body, Structure};

use crate::diag::{Diagnostic, Diagnostics};
use crate::eval::{self, Evaluator, Scope};
use crate::schema::{ObjectSpec, PropDecode};
use crate::value::Value;

/// Decode `body` against `spec`, evaluating in `scope`. Top-level blocks
/// named in `skip_blocks` are ignored (the resource options block lives in
/// the same body as the inputs).
///
pub(crate) fn decode_body<'a, 'c: 'a>(
    ev: &'a Evaluator<'c>,
    body: &'a Body,
    spec: &'a ObjectSpec,
    scope: &'a Scope,
    skip_blocks: &'a [&'a str],
) -> BoxFuture<'a, Result<Value, Diagnostics>> {
    async move {
        let mut diags = Diagnostics::new();
        let mut out = BTreeMap::new();

        for (name, prop) in spec {
            let decoded = match prop {
                PropDecode::Attr { required, .. } => {
                    match find_attr(body, name) {
                        Some(expr) => match ev.eval(expr, scope).await {
                            Ok(v) => v,
                            Err(e) => {
                                diags.extend(e);
                                Value::Null
                            }
                        },
                        None => {
                            if *required {
                                diags.push(Diagnostic::error(format!(
                                    "missing required argument \"{name}\""
                                )));
                            }
                            Value::Null
                        }
                    }
                }
                PropDecode::Block { spec, required } => {
                    let mut blocks = find_blocks(body, name);
                    match blocks.next() {
                        Some(block) => {
                            match decode_body(ev, &block.body, spec, scope, &[]).await {
                                Ok(v) => v,
                                Err(e) => {
                                    diags.extend(e);
                                    Value::Null
                                }
                            }
                        }
                        None => {
                            if *required {
                                diags.push(Diagnostic::error(format!(
                                    "missing required block \"{name}\""
                                )));
                            }
                            Value::Null
                        }
                    }
                }
                PropDecode::BlockList { spec, min_one } => {
                    let mut items = Vec::new();
                    for block in find_blocks(body, name) {
                        match decode_body(ev, &block.body, spec, scope, &[]).await {
                            Ok(v) => items.push(v),
                            Err(e) => diags.extend(e),
                        }
                    }
                    if items.is_empty() && *min_one {
                        diags.push(Diagnostic::error(format!(
                            "at least one \"{name}\" block is required"
                        )));
                    }
                    Value::List(items)
                }
                PropDecode::BlockMap { spec } => {
                    let mut entries = BTreeMap::new();
                    for block in find_blocks(body, name) {
                        let key = match block.labels.first() {
                            Some(label) if block.labels.len() == 1 => label.as_str().to_owned(),
                            _ => {
                                diags.push(Diagnostic::error(format!(
                                    "\"{name}\" blocks require exactly one key label"
                                )));
                                continue;
                            }
                        };
                        if entries.contains_key(&key) {
                            diags.push(Diagnostic::error(format!(
                                "duplicate \"{name}\" block for key \"{key}\""
                            )));
                            continue;
                        }
                        match decode_body(ev, &block.body, spec, scope, &[]).await {
                            Ok(v) => {
                                entries.insert(key, v);
                            }
                            Err(e) => diags.extend(e),
                        }
                    }
                    Value::Object(entries)
                }
            };
            out.insert(name.to_string(), decoded);
        }

        // Anything in the body that the spec does not declare is an error.
        //
        for structure in body.iter() {
            match structure {
                Structure::Attribute(attr) => {
                    let name = attr.key.as_str();
                    if !matches!(spec.get(name), Some(PropDecode::Attr { .. })) {
                        diags.push(Diagnostic::error(format!("unsupported argument \"{name}\"")));
                    }
                }
                Structure::Block(block) => {
                    let name = block.identifier.as_str();
                    if skip_blocks.contains(&name) {
                        continue;
                    }
                    let known = matches!(
                        spec.get(name),
                        Some(PropDecode::Block { .. })
                            | Some(PropDecode::BlockList { .. })
                            | Some(PropDecode::BlockMap { .. })
                    );
                    if !known {
                        diags.push(Diagnostic::error(format!("unsupported block \"{name}\"")));
                    }
                }
            }
        }

        if diags.has_errors() {
            Err(diags)
        } else {
            Ok(Value::Object(out))
        }
    }
    .boxed()
}

fn find_attr<'b>(body: &'b Body, name: &str) -> Option<&'b hcl::expr::Expression> {
    body.iter().find_map(|s| match s {
        Structure::Attribute(attr) if attr.key.as_str() == name => Some(&attr.expr),
        _ => None,
    })
}

fn find_blocks<'b>(body: &'b Body, name: &'b str) -> impl Iterator<Item = &'b hcl::structure::Block> {
    body.iter().filter_map(move |s| match s {
        Structure::Block(block) if block.identifier.as_str() == name => Some(block),
        _ => None,
    })
}

/// Per-property dependency discovery over a resource body: the root
/// references of each top-level attribute, and of every expression inside
/// each top-level block, keyed by the attribute/block-type name. Blocks
/// named in `skip_blocks` are ignored.
///
pub(crate) fn body_dependencies(
    body: &Body,
    skip_blocks: &[&str],
) -> BTreeMap<String, BTreeSet<String>> {
    let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for structure in body.iter() {
        match structure {
            Structure::Attribute(attr) => {
                let mut refs = BTreeSet::new();
                eval::expr_refs(&attr.expr, &mut Vec::new(), &mut refs);
                out.entry(attr.key.as_str().to_owned()).or_default().extend(refs);
            }
            Structure::Block(block) => {
                let name = block.identifier.as_str();
                if skip_blocks.contains(&name) {
                    continue;
                }
                let mut refs = BTreeSet::new();
                eval::body_refs(&block.body, &mut refs);
                out.entry(name.to_owned()).or_default().extend(refs);
            }
        }
    }
    out
}
