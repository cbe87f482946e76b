//! The per-resource registration protocol.
//!
//! A resource evaluator resolves its parent, builds its scope, assembles
//! dependency URN lists, expands the `range` option, fans out one worker
//! per iteration, and joins the results into the node's output value. Every
//! path settles the node's awaitable exactly once.
//!

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, trace};

use intendant_proto::register_resource_request::PropertyDependencies;
use intendant_proto::{
    RegisterResourceOutputsRequest, RegisterResourceRequest, RegisterResourceResponse,
};

use crate::awaitable::AwaitState;
use crate::context::ProgramContext;
use crate::decode::decode_body;
use crate::diag::{Diagnostic, Diagnostics};
use crate::eval::{Evaluator, Scope};
use crate::marshal::{marshal_struct, unmarshal_struct};
use crate::node::{dependency_scope, AwaitOutcome, DepScope, Node, NodeKind, NodeResult, ResourceDecl};
use crate::value::Value;

fn error(msg: impl Into<String>) -> Diagnostics {
    Diagnostic::error(msg).into()
}

fn rejected(diagnostics: Diagnostics) -> (AwaitState, NodeResult) {
    (
        AwaitState::Rejected,
        NodeResult {
            diagnostics,
            ..NodeResult::default()
        },
    )
}

fn canceled() -> (AwaitState, NodeResult) {
    (AwaitState::Canceled, NodeResult::default())
}

#[tracing::instrument(skip_all, fields(name = %node.name))]
pub(crate) async fn register(node: &Arc<Node>, ctx: &Arc<ProgramContext>) {
    let (state, result) = register_inner(node, ctx).await;
    node.fulfill_with(state, result);
}

enum WorkerOut {
    Done(RegisterResourceResponse),
    Failed(Diagnostics),
    Canceled,
}

async fn register_inner(node: &Arc<Node>, ctx: &Arc<ProgramContext>) -> (AwaitState, NodeResult) {
    let decl = match &node.kind {
        NodeKind::Resource(decl) => decl,
        _ => return rejected(error("internal: register on a non-resource node")),
    };
    let is_stack = Arc::ptr_eq(node, &ctx.stack);

    // 1. Parent resolution: explicit parent, or the root stack.
    //
    let mut parent_urn = String::new();
    if !is_stack {
        let parent = match &decl.options.parent {
            Some(name) => match ctx.nodes.get(name) {
                Some(p) => Arc::clone(p),
                None => return rejected(error(format!("unknown resource \"{name}\""))),
            },
            None => Arc::clone(&ctx.stack),
        };
        match parent.await_value(ctx).await {
            AwaitOutcome::Canceled => return canceled(),
            AwaitOutcome::Failed => {
                return rejected(error(format!(
                    "parent resource \"{}\" failed to register",
                    parent.name
                )))
            }
            AwaitOutcome::Value(_) => match parent.urns().first() {
                Some(urn) => parent_urn = urn.clone(),
                None => {
                    return rejected(error(format!(
                        "parent resource \"{}\" has no URN",
                        parent.name
                    )))
                }
            },
        }
    }

    // 2. Scope build from dependency values.
    //
    let prepared = node.prepared();
    let scope = match dependency_scope(&prepared.deps, ctx).await {
        DepScope::Ok(scope) => scope,
        DepScope::Canceled => return canceled(),
    };

    // 3. Dependency URN lists: per-property, and the aggregate sorted
    //    resource-level list.
    //
    let mut rpc_property_deps: HashMap<String, PropertyDependencies> = HashMap::new();
    for (prop, dep_names) in &prepared.property_deps {
        let mut urns: Vec<String> = dep_names
            .iter()
            .filter_map(|n| ctx.nodes.get(n))
            .flat_map(|n| n.urns())
            .collect();
        urns.sort();
        urns.dedup();
        rpc_property_deps.insert(prop.clone(), PropertyDependencies { urns });
    }
    let mut rpc_deps: Vec<String> = prepared
        .resource_deps
        .iter()
        .filter_map(|n| ctx.nodes.get(n))
        .flat_map(|n| n.urns())
        .collect();
    rpc_deps.sort();
    rpc_deps.dedup();

    // 4. Range expansion.
    //
    let ev = Evaluator::new(ctx);
    let mut iterations: Option<Vec<(Value, Value)>> = None;
    if let Some(range_expr) = &decl.options.range {
        let range = match ev.eval(range_expr, &scope).await {
            Ok(v) => v.unmark().0,
            Err(diags) => return rejected(diags),
        };
        iterations = Some(match range {
            Value::Number(n) if n >= 0.0 && n.is_finite() => (0..n.trunc() as usize)
                .map(|i| (Value::Number(i as f64), Value::Number(i as f64)))
                .collect(),
            Value::List(xs) => xs
                .into_iter()
                .enumerate()
                .map(|(i, x)| (Value::Number(i as f64), x))
                .collect(),
            Value::Object(m) => m.into_iter().map(|(k, v)| (Value::String(k), v)).collect(),
            Value::Unknown => {
                // Degrade to a single placeholder iteration.
                debug!("range for \"{}\" is unknown, registering one placeholder", node.name);
                vec![(Value::Unknown, Value::Unknown)]
            }
            _ => {
                return rejected(
                    Diagnostic::error("invalid type for range expression")
                        .with_detail("range expressions must be numbers, lists, or maps")
                        .in_file(&decl.file)
                        .into(),
                )
            }
        });
    }

    // 5. Parallel fan-out, one worker per iteration.
    //
    let has_range = iterations.is_some();
    let iterations: Vec<(usize, Option<(Value, Value)>)> = match iterations {
        None => vec![(0, None)],
        Some(kvs) => kvs
            .into_iter()
            .enumerate()
            .map(|(i, kv)| (i, Some(kv)))
            .collect(),
    };

    trace!("register({}): {} iteration(s)", node.name, iterations.len());

    let mut handles = Vec::with_capacity(iterations.len());
    for (idx, kv) in iterations {
        let ctx = Arc::clone(ctx);
        let node = Arc::clone(node);
        let scope = scope.clone();
        let parent_urn = parent_urn.clone();
        let rpc_deps = rpc_deps.clone();
        let rpc_property_deps = rpc_property_deps.clone();
        handles.push(tokio::spawn(async move {
            register_one(&ctx, &node, scope, idx, kv, parent_urn, rpc_deps, rpc_property_deps).await
        }));
    }

    // 6. Join in iteration order and assemble outputs.
    //
    let mut state = AwaitState::Resolved;
    let mut diagnostics = Diagnostics::new();
    let mut urns = Vec::new();
    let mut ids = Vec::new();
    let mut outputs = Vec::new();

    for handle in handles {
        let out = match handle.await {
            Ok(out) => out,
            Err(_) => WorkerOut::Failed(error("registration worker panicked")),
        };
        match out {
            WorkerOut::Canceled => return canceled(),
            WorkerOut::Failed(d) => {
                diagnostics.extend(d);
                state = AwaitState::Rejected;
            }
            WorkerOut::Done(resp) => {
                let mut props = match resp.object.as_ref().map(unmarshal_struct) {
                    Some(Value::Object(m)) => m,
                    _ => BTreeMap::new(),
                };

                props.insert("urn".to_string(), Value::String(resp.urn.clone()));
                if decl.custom {
                    if !resp.id.is_empty() || !ctx.info.dry_run {
                        props.insert("id".to_string(), Value::String(resp.id.clone()));
                    } else {
                        props.insert("id".to_string(), Value::Unknown);
                    }
                }

                // Schema-declared outputs absent from the response get
                // filled: unknown during a dry run, null otherwise.
                //
                if let Some(schema) = &decl.schema {
                    for prop in &schema.outputs {
                        props.entry(prop.clone()).or_insert(if ctx.info.dry_run {
                            Value::Unknown
                        } else {
                            Value::Null
                        });
                    }
                }

                urns.push(resp.urn);
                ids.push(resp.id);
                outputs.push(Value::Object(props));
            }
        }
    }

    // 7. Aggregate output: a single object without range, the ordered list
    //    of objects with it.
    //
    let value = if has_range {
        Value::List(outputs)
    } else {
        outputs.into_iter().next().unwrap_or(Value::Null)
    };

    (
        state,
        NodeResult {
            value,
            urns,
            ids,
            diagnostics,
        },
    )
}

#[allow(clippy::too_many_arguments)]
async fn register_one(
    ctx: &Arc<ProgramContext>,
    node: &Arc<Node>,
    scope: Scope,
    idx: usize,
    kv: Option<(Value, Value)>,
    parent_urn: String,
    rpc_deps: Vec<String>,
    rpc_property_deps: HashMap<String, PropertyDependencies>,
) -> WorkerOut {
    let decl: &ResourceDecl = match &node.kind {
        NodeKind::Resource(decl) => decl,
        _ => return WorkerOut::Failed(error("internal: register on a non-resource node")),
    };

    // a. Child scope with the iteration exposed as `range`, and the
    //    instance name suffixed with the iteration index.
    //
    let mut scope = scope;
    let mut name = node.name.clone();
    if let Some((key, value)) = kv {
        scope.set_var(
            "range",
            Value::object([("key".to_string(), key), ("value".to_string(), value)]),
        );
        name = format!("{name}-{idx}");
    }

    // b. Decode the body against the schema's decoding spec.
    //
    let ev = Evaluator::new(ctx);
    let inputs = match &decl.schema {
        Some(schema) => {
            match decode_body(&ev, &decl.body, &schema.spec, &scope, &["options"]).await {
                Ok(v) => v,
                Err(diags) => return WorkerOut::Failed(diags),
            }
        }
        None => Value::Object(BTreeMap::new()),
    };

    // c. Marshal; unknowns survive only during a dry run.
    //
    let object = match marshal_struct(&inputs, ctx.info.dry_run) {
        Ok(s) => s,
        Err(diags) => return WorkerOut::Failed(diags),
    };

    if ctx.cancel.is_cancelled() {
        return WorkerOut::Canceled;
    }

    // d. Register with the monitor.
    //
    let req = RegisterResourceRequest {
        r#type: decl.token.clone(),
        name,
        parent: parent_urn,
        custom: decl.custom,
        object: Some(object),
        protect: false,
        dependencies: rpc_deps,
        provider: String::new(),
        property_dependencies: rpc_property_deps,
    };
    match ctx.monitor.register_resource(req).await {
        Ok(resp) => WorkerOut::Done(resp),
        Err(e) => WorkerOut::Failed(error(e.to_string())),
    }
}

/// Report the final stack outputs. Skipped when the stack itself never
/// resolved (a cancelled or failed run).
///
pub(crate) async fn register_stack_outputs(
    ctx: &Arc<ProgramContext>,
    outputs: BTreeMap<String, Value>,
) -> Diagnostics {
    if !ctx.stack.awaitable.wait_ok(&ctx.cancel).await {
        return Diagnostics::new();
    }
    let urn = match ctx.stack.urns().first() {
        Some(urn) => urn.clone(),
        None => return Diagnostics::new(),
    };

    let marshalled = match marshal_struct(&Value::Object(outputs), ctx.info.dry_run) {
        Ok(s) => s,
        Err(diags) => return diags,
    };

    match ctx
        .monitor
        .register_resource_outputs(RegisterResourceOutputsRequest {
            urn,
            outputs: Some(marshalled),
        })
        .await
    {
        Ok(()) => Diagnostics::new(),
        Err(e) => error(e.to_string()),
    }
}
