//! The dataflow node: one per top-level declaration.
//!
//! Config variables, locals and resources share one lifecycle — `prepare`
//! discovers static dependencies sequentially, `evaluate` runs concurrently
//! (one task per node) and settles the node's awaitable exactly once, and
//! `await_value` is how other nodes consume the result. Outputs are
//! node-like but carry no awaitable: they run strictly after the graph has
//! settled.
//!

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock, RwLock};

use hcl::expr::Expression;
use hcl::structure::Body;
use tracing::trace;

use crate::awaitable::{AwaitState, Awaitable};
use crate::context::ProgramContext;
use crate::decode;
use crate::diag::{Diagnostic, Diagnostics};
use crate::eval::{self, Evaluator, Scope};
use crate::resource;
use crate::schema::ResourceSchema;
use crate::value::Value;

/// The root stack's type token on the wire.
pub const STACK_TYPE: &str = "pulumi:pulumi:Stack";

#[derive(Debug)]
pub struct ConfigDecl {
    pub type_label: String,
    pub default: Option<Expression>,
    pub file: String,
}

#[derive(Debug)]
pub struct LocalDecl {
    pub expr: Expression,
    pub file: String,
}

#[derive(Debug, Default)]
pub struct ResourceOptions {
    pub range: Option<Expression>,
    pub parent: Option<String>,
}

#[derive(Debug)]
pub struct ResourceDecl {
    /// Canonical type token.
    pub token: String,
    pub custom: bool,
    pub schema: Option<Arc<ResourceSchema>>,
    pub options: ResourceOptions,
    /// The declared body; input properties plus the options block.
    pub body: Body,
    pub file: String,
}

#[derive(Debug)]
pub enum NodeKind {
    Config(ConfigDecl),
    Local(LocalDecl),
    Resource(ResourceDecl),
}

/// Dependency information computed by `prepare`.
///
#[derive(Debug, Default, Clone)]
pub struct Prepared {
    /// Names of every node this node depends on, sorted.
    pub deps: Vec<String>,
    /// The subset of `deps` that are resources.
    pub resource_deps: Vec<String>,
    /// Per top-level property: the resource dependencies referenced from it.
    pub property_deps: BTreeMap<String, Vec<String>>,
}

/// What a settled node holds.
///
#[derive(Debug, Default)]
pub struct NodeResult {
    pub value: Value,
    pub urns: Vec<String>,
    pub ids: Vec<String>,
    pub diagnostics: Diagnostics,
}

pub struct Node {
    pub name: String,
    /// Declaration order, used for deterministic preparation.
    pub order: usize,
    pub kind: NodeKind,
    pub awaitable: Awaitable,
    prepared: RwLock<Prepared>,
    result: OnceLock<NodeResult>,
}

/// Outcome of awaiting another node.
///
pub enum AwaitOutcome {
    Value(Value),
    Failed,
    Canceled,
}

impl Node {
    pub fn new(name: impl Into<String>, order: usize, kind: NodeKind) -> Self {
        Node {
            name: name.into(),
            order,
            kind,
            awaitable: Awaitable::new(),
            prepared: RwLock::new(Prepared::default()),
            result: OnceLock::new(),
        }
    }

    /// The synthesized root stack resource: no schema, no body; registering
    /// it only exists to produce the parent URN for everything else.
    ///
    pub fn stack(name: String) -> Self {
        Node::new(
            name,
            usize::MAX,
            NodeKind::Resource(ResourceDecl {
                token: STACK_TYPE.to_string(),
                custom: false,
                schema: None,
                options: ResourceOptions::default(),
                body: Body::default(),
                file: String::new(),
            }),
        )
    }

    pub fn is_resource(&self) -> bool {
        matches!(self.kind, NodeKind::Resource(_))
    }

    pub fn prepared(&self) -> Prepared {
        self.prepared.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn result(&self) -> Option<&NodeResult> {
        self.result.get()
    }

    pub fn urns(&self) -> Vec<String> {
        self.result.get().map(|r| r.urns.clone()).unwrap_or_default()
    }

    /// Compute this node's static dependencies. Unknown references are
    /// diagnostics, not panics.
    ///
    pub fn prepare(&self, nodes: &BTreeMap<String, Arc<Node>>) -> Diagnostics {
        trace!("prepare({})", self.name);

        let mut diags = Diagnostics::new();
        let mut refs = BTreeSet::new();
        let mut property_refs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let file = self.file().to_owned();

        match &self.kind {
            NodeKind::Config(decl) => {
                if let Some(default) = &decl.default {
                    eval::expr_refs(default, &mut Vec::new(), &mut refs);
                }
            }
            NodeKind::Local(decl) => {
                eval::expr_refs(&decl.expr, &mut Vec::new(), &mut refs);
            }
            NodeKind::Resource(decl) => {
                property_refs = decode::body_dependencies(&decl.body, &["options"]);
                for names in property_refs.values() {
                    refs.extend(names.iter().cloned());
                }
                if let Some(range) = &decl.options.range {
                    eval::expr_refs(range, &mut Vec::new(), &mut refs);
                }
                if let Some(parent) = &decl.options.parent {
                    match nodes.get(parent) {
                        None => diags.push(
                            Diagnostic::error(format!("unknown resource \"{parent}\""))
                                .in_file(&file),
                        ),
                        Some(p) if !p.is_resource() => diags.push(
                            Diagnostic::error(format!(
                                "parent \"{parent}\" is not a resource"
                            ))
                            .in_file(&file),
                        ),
                        Some(p) if p.has_range() => diags.push(
                            Diagnostic::error(format!(
                                "parent \"{parent}\" is replicated and can not be a parent"
                            ))
                            .in_file(&file),
                        ),
                        Some(_) => {}
                    }
                }
            }
        }

        let mut deps = Vec::new();
        let mut resource_deps = Vec::new();
        for name in &refs {
            match nodes.get(name) {
                Some(dep) => {
                    deps.push(name.clone());
                    if dep.is_resource() {
                        resource_deps.push(name.clone());
                    }
                }
                None => diags.push(
                    Diagnostic::error(format!("unknown resource \"{name}\"")).in_file(&file),
                ),
            }
        }

        let property_deps = property_refs
            .into_iter()
            .map(|(prop, names)| {
                let resource_names: Vec<String> = names
                    .into_iter()
                    .filter(|n| nodes.get(n).map(|d| d.is_resource()).unwrap_or(false))
                    .collect();
                (prop, resource_names)
            })
            .filter(|(_, names)| !names.is_empty())
            .collect();

        let mut prepared = self.prepared.write().unwrap_or_else(|e| e.into_inner());
        *prepared = Prepared {
            deps,
            resource_deps,
            property_deps,
        };
        diags
    }

    pub fn has_range(&self) -> bool {
        match &self.kind {
            NodeKind::Resource(decl) => decl.options.range.is_some(),
            _ => false,
        }
    }

    fn file(&self) -> &str {
        match &self.kind {
            NodeKind::Config(d) => &d.file,
            NodeKind::Local(d) => &d.file,
            NodeKind::Resource(d) => &d.file,
        }
    }

    /// Settle the node: store the result, then flip the awaitable. Both the
    /// store and the transition are single-shot.
    ///
    pub(crate) fn fulfill_with(&self, state: AwaitState, result: NodeResult) {
        let _ = self.result.set(result);
        self.awaitable.fulfill(state);
    }

    /// Run this node to completion. Always settles the awaitable.
    ///
    pub async fn evaluate(node: &Arc<Node>, ctx: &Arc<ProgramContext>) {
        trace!("evaluate({})", node.name);

        if ctx.cancel.is_cancelled() {
            node.fulfill_with(AwaitState::Canceled, NodeResult::default());
            return;
        }

        match &node.kind {
            NodeKind::Config(decl) => node.evaluate_config(ctx, decl).await,
            NodeKind::Local(decl) => node.evaluate_local(ctx, decl).await,
            NodeKind::Resource(_) => resource::register(node, ctx).await,
        }
    }

    async fn evaluate_config(&self, ctx: &Arc<ProgramContext>, decl: &ConfigDecl) {
        let scope = match dependency_scope(&self.prepared().deps, ctx).await {
            DepScope::Ok(scope) => scope,
            DepScope::Canceled => {
                self.fulfill_with(AwaitState::Canceled, NodeResult::default());
                return;
            }
        };

        let outcome = if let Some(raw) = ctx.config_value(&self.name) {
            // Configuration values are JSON documents; values that do not
            // decode are taken verbatim as strings.
            //
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(json) => Ok(Value::from_json(json)),
                Err(_) => Ok(Value::String(raw.clone())),
            }
        } else if let Some(default) = &decl.default {
            let ev = Evaluator::new(ctx);
            ev.eval(default, &scope).await
        } else {
            Err(Diagnostics::from(
                Diagnostic::error(format!(
                    "missing required config variable {}",
                    self.name
                ))
                .in_file(&decl.file),
            ))
        };

        match outcome {
            Ok(value) => self.fulfill_with(
                AwaitState::Resolved,
                NodeResult {
                    value,
                    ..NodeResult::default()
                },
            ),
            Err(diagnostics) => self.fulfill_with(
                AwaitState::Rejected,
                NodeResult {
                    diagnostics,
                    ..NodeResult::default()
                },
            ),
        }
    }

    async fn evaluate_local(&self, ctx: &Arc<ProgramContext>, decl: &LocalDecl) {
        let scope = match dependency_scope(&self.prepared().deps, ctx).await {
            DepScope::Ok(scope) => scope,
            DepScope::Canceled => {
                self.fulfill_with(AwaitState::Canceled, NodeResult::default());
                return;
            }
        };

        let ev = Evaluator::new(ctx);
        match ev.eval(&decl.expr, &scope).await {
            Ok(value) => self.fulfill_with(
                AwaitState::Resolved,
                NodeResult {
                    value,
                    ..NodeResult::default()
                },
            ),
            Err(diagnostics) => self.fulfill_with(
                AwaitState::Rejected,
                NodeResult {
                    diagnostics,
                    ..NodeResult::default()
                },
            ),
        }
    }

    /// Block until this node settles (or the run is cancelled) and report
    /// the outcome.
    ///
    pub async fn await_value(&self, ctx: &ProgramContext) -> AwaitOutcome {
        match self.awaitable.wait(&ctx.cancel).await {
            None | Some(AwaitState::Canceled) | Some(AwaitState::Pending) => AwaitOutcome::Canceled,
            Some(AwaitState::Rejected) => AwaitOutcome::Failed,
            Some(AwaitState::Resolved) => AwaitOutcome::Value(
                self.result
                    .get()
                    .map(|r| r.value.clone())
                    .unwrap_or(Value::Null),
            ),
        }
    }
}

pub(crate) enum DepScope {
    Ok(Scope),
    Canceled,
}

/// Build the evaluation scope from dependency values: plain values become
/// variables; callable capsules become scope functions under the node's
/// name. A failed dependency contributes nothing (the expression then fails
/// to bind with its own diagnostic); a cancelled one cancels the caller.
///
pub(crate) async fn dependency_scope(deps: &[String], ctx: &ProgramContext) -> DepScope {
    let mut scope = Scope::new();
    for name in deps {
        let dep = match ctx.nodes.get(name) {
            Some(dep) => dep,
            None => continue,
        };
        match dep.await_value(ctx).await {
            AwaitOutcome::Canceled => return DepScope::Canceled,
            AwaitOutcome::Failed => {}
            AwaitOutcome::Value(Value::Func(f)) => scope.set_func(name.clone(), f),
            AwaitOutcome::Value(v) => scope.set_var(name.clone(), v),
        }
    }
    DepScope::Ok(scope)
}

/// A stack output: evaluated on the driver task after every node settled
/// and reported to the monitor.
///
pub struct OutputNode {
    pub name: String,
    pub expr: Expression,
    pub file: String,
    deps: RwLock<Vec<String>>,
}

impl OutputNode {
    pub fn new(name: impl Into<String>, expr: Expression, file: impl Into<String>) -> Self {
        OutputNode {
            name: name.into(),
            expr,
            file: file.into(),
            deps: RwLock::new(Vec::new()),
        }
    }

    pub fn prepare(&self, nodes: &BTreeMap<String, Arc<Node>>) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let mut refs = BTreeSet::new();
        eval::expr_refs(&self.expr, &mut Vec::new(), &mut refs);

        let mut deps = Vec::new();
        for name in &refs {
            if nodes.contains_key(name) {
                deps.push(name.clone());
            } else {
                diags.push(
                    Diagnostic::error(format!("unknown resource \"{name}\"")).in_file(&self.file),
                );
            }
        }
        *self.deps.write().unwrap_or_else(|e| e.into_inner()) = deps;
        diags
    }

    /// A failed or cancelled dependency degrades the output to unknown
    /// rather than failing the whole run a second time.
    ///
    pub async fn evaluate(&self, ctx: &Arc<ProgramContext>) -> (Value, Diagnostics) {
        if ctx.cancel.is_cancelled() {
            return (Value::Unknown, Diagnostics::new());
        }

        let deps = self.deps.read().unwrap_or_else(|e| e.into_inner()).clone();
        let scope = match dependency_scope(&deps, ctx).await {
            DepScope::Ok(scope) => scope,
            DepScope::Canceled => return (Value::Unknown, Diagnostics::new()),
        };
        for name in &deps {
            if scope.var(name).is_none() && scope.func(name).is_none() {
                // A dependency settled without a value.
                return (Value::Unknown, Diagnostics::new());
            }
        }

        let ev = Evaluator::new(ctx);
        match ev.eval(&self.expr, &scope).await {
            Ok(v) => (v, Diagnostics::new()),
            Err(diags) => (Value::Unknown, diags),
        }
    }
}
