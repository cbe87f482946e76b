//! The program driver.
//!
//! Phases, in order: parse + bind every source file; prepare every node and
//! output sequentially in declaration order (the dependency graph must be
//! fully known before anything evaluates); detect cycles; abort if anything
//! up to here errored. Then register the root stack, fan out one evaluator
//! task per node, wait for the graph to settle, evaluate the outputs and
//! report them to the monitor.
//!

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, trace};

use intendant_proto::engine_client::EngineClient;

use crate::awaitable::AwaitState;
use crate::binder;
use crate::context::{ProgramContext, RunInfo};
use crate::diag::{Diagnostic, Diagnostics};
use crate::monitor::{GrpcMonitor, ResourceMonitor};
use crate::node::{Node, NodeKind};
use crate::resource;
use crate::schema::SchemaCache;

/// Execute a program against the monitor named in `info`. Returns the
/// parsed file map (for diagnostic rendering) and every diagnostic the run
/// produced.
///
pub async fn run(
    cancel: CancellationToken,
    sources: BTreeMap<String, String>,
    info: RunInfo,
) -> (BTreeMap<String, String>, Diagnostics) {
    if let Some(diags) = validate(&info) {
        return (BTreeMap::new(), diags);
    }

    let monitor = match GrpcMonitor::connect(&info.monitor_addr).await {
        Ok(monitor) => Arc::new(monitor),
        Err(e) => return (BTreeMap::new(), Diagnostic::error(e.to_string()).into()),
    };

    let engine_endpoint = if info.engine_addr.starts_with("http") {
        info.engine_addr.clone()
    } else {
        format!("http://{}", info.engine_addr)
    };
    let engine = match EngineClient::<Channel>::connect(engine_endpoint).await {
        Ok(engine) => Some(engine),
        Err(e) => {
            return (
                BTreeMap::new(),
                Diagnostic::error(format!("connecting to engine over RPC: {e}")).into(),
            )
        }
    };

    run_inner(cancel, sources, info, monitor, engine, SchemaCache::new()).await
}

/// Like `run`, but with an injected monitor and schema directory. This is
/// the entry point tests drive.
///
pub async fn run_with_monitor(
    cancel: CancellationToken,
    sources: BTreeMap<String, String>,
    info: RunInfo,
    monitor: Arc<dyn ResourceMonitor>,
    schemas: SchemaCache,
) -> (BTreeMap<String, String>, Diagnostics) {
    if let Some(diags) = validate(&info) {
        return (BTreeMap::new(), diags);
    }
    run_inner(cancel, sources, info, monitor, None, schemas).await
}

fn validate(info: &RunInfo) -> Option<Diagnostics> {
    if info.project.is_empty() {
        return Some(Diagnostic::error("missing project name").into());
    }
    if info.stack.is_empty() {
        return Some(Diagnostic::error("missing stack name").into());
    }
    if info.monitor_addr.is_empty() {
        return Some(Diagnostic::error("missing resource monitor RPC address").into());
    }
    if info.engine_addr.is_empty() {
        return Some(Diagnostic::error("missing engine RPC address").into());
    }
    None
}

#[tracing::instrument(skip_all, fields(project = %info.project, stack = %info.stack))]
async fn run_inner(
    cancel: CancellationToken,
    sources: BTreeMap<String, String>,
    info: RunInfo,
    monitor: Arc<dyn ResourceMonitor>,
    engine: Option<EngineClient<Channel>>,
    schemas: SchemaCache,
) -> (BTreeMap<String, String>, Diagnostics) {
    trace!("run starting");

    let (bound, mut diags) = binder::bind(&sources, &schemas);

    // Prepare sequentially in declaration order: the dependency graph must
    // be complete before any node evaluates.
    //
    for name in &bound.node_order {
        if let Some(node) = bound.nodes.get(name) {
            diags.extend(node.prepare(&bound.nodes));
        }
    }
    for output in &bound.outputs {
        diags.extend(output.prepare(&bound.nodes));
    }

    diags.extend(detect_cycles(&bound.nodes, &bound.node_order));

    if diags.has_errors() {
        return (bound.files, diags);
    }

    let files = bound.files;
    let node_order = bound.node_order;

    let mut ctx = ProgramContext::new(cancel, info, monitor, schemas);
    ctx.engine = engine;
    ctx.nodes = bound.nodes;
    ctx.outputs = bound.outputs;
    let ctx = Arc::new(ctx);

    // The root stack registers first so its URN is available as the default
    // parent for everything else.
    //
    Node::evaluate(&ctx.stack, &ctx).await;

    // Fan out: one evaluator task per node, coordinated only through
    // awaitables.
    //
    let mut handles = Vec::with_capacity(ctx.nodes.len());
    for node in ctx.nodes.values() {
        let node = Arc::clone(node);
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            Node::evaluate(&node, &ctx).await;
        }));
    }
    for handle in handles {
        if handle.await.is_err() {
            diags.push(Diagnostic::error("node evaluator panicked"));
        }
    }
    debug!("all nodes settled");

    // Collect per-node diagnostics in declaration order.
    //
    if ctx.stack.awaitable.state() == AwaitState::Rejected {
        if let Some(r) = ctx.stack.result() {
            diags.extend(r.diagnostics.clone());
        }
    }
    for name in &node_order {
        let node = match ctx.nodes.get(name) {
            Some(node) => node,
            None => continue,
        };
        if node.awaitable.state() == AwaitState::Rejected {
            if let Some(r) = node.result() {
                diags.extend(r.diagnostics.clone());
            }
        }
    }

    // Outputs run strictly after every node settled.
    //
    let mut stack_outputs = BTreeMap::new();
    for output in &ctx.outputs {
        let (value, output_diags) = output.evaluate(&ctx).await;
        diags.extend(output_diags);
        stack_outputs.insert(output.name.clone(), value);
    }
    diags.extend(resource::register_stack_outputs(&ctx, stack_outputs).await);

    (files, diags)
}

/// A cycle in the dependency graph would deadlock the evaluators; find any
/// with a depth-first walk and report them as diagnostics instead.
///
fn detect_cycles(nodes: &BTreeMap<String, Arc<Node>>, order: &[String]) -> Diagnostics {
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    let mut colors: BTreeMap<String, u8> = BTreeMap::new();
    let mut diags = Diagnostics::new();
    let mut path = Vec::new();

    for name in order {
        visit(name, nodes, &mut colors, &mut path, &mut diags);
    }
    return diags;

    fn visit(
        name: &str,
        nodes: &BTreeMap<String, Arc<Node>>,
        colors: &mut BTreeMap<String, u8>,
        path: &mut Vec<String>,
        diags: &mut Diagnostics,
    ) {
        match colors.get(name).copied() {
            Some(BLACK) => return,
            Some(GRAY) => {
                let start = path.iter().position(|p| p == name).unwrap_or(0);
                let cycle = path[start..].join(" -> ");
                diags.push(Diagnostic::error(format!(
                    "dependency cycle detected: {cycle} -> {name}"
                )));
                return;
            }
            _ => {}
        }

        colors.insert(name.to_owned(), GRAY);
        path.push(name.to_owned());

        if let Some(node) = nodes.get(name) {
            let mut edges = node.prepared().deps;
            if let NodeKind::Resource(decl) = &node.kind {
                if let Some(parent) = &decl.options.parent {
                    edges.push(parent.clone());
                }
            }
            for dep in edges {
                visit(&dep, nodes, colors, path, diags);
            }
        }

        path.pop();
        colors.insert(name.to_owned(), BLACK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_run_info_fields() {
        let info = RunInfo {
            project: String::new(),
            stack: "dev".to_string(),
            monitor_addr: "a".to_string(),
            engine_addr: "b".to_string(),
            ..RunInfo::default()
        };
        let (files, diags) = run(CancellationToken::new(), BTreeMap::new(), info).await;
        assert!(files.is_empty());
        assert!(diags.has_errors());
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn test_detect_cycles_reports_once() {
        use crate::node::{LocalDecl, NodeKind};

        // a -> b -> a, built by hand.
        //
        fn local(name: &str, order: usize, expr_src: &str) -> Arc<Node> {
            let body = hcl::parse(&format!("x = {expr_src}\n")).unwrap();
            let expr = body
                .iter()
                .find_map(|s| match s {
                    hcl::structure::Structure::Attribute(a) => Some(a.expr.clone()),
                    _ => None,
                })
                .unwrap();
            Arc::new(Node::new(
                name,
                order,
                NodeKind::Local(LocalDecl {
                    expr,
                    file: "main.pp".to_string(),
                }),
            ))
        }

        let a = local("a", 0, "b");
        let b = local("b", 1, "a");
        let nodes = BTreeMap::from([("a".to_string(), a), ("b".to_string(), b)]);
        for n in nodes.values() {
            n.prepare(&nodes);
        }

        let diags = detect_cycles(&nodes, &["a".to_string(), "b".to_string()]);
        assert!(diags.has_errors());
        assert_eq!(diags.len(), 1);
        assert!(diags.iter().next().unwrap().summary.contains("cycle"));
    }
}
