//! Parsing and binding of program sources.
//!
//! Each `.pp` file parses to a structured body; the top level declares
//! nodes: `config` blocks for configuration variables, `resource` blocks,
//! `outputs` blocks, `package` blocks (eager schema loads) and plain
//! attributes for locals. Declarations keep their source order, names are
//! globally unique, and `range` is reserved.
//!

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hcl::expr::Expression;
use hcl::structure::{Block, Body, Structure};
use tracing::trace;

use crate::diag::{Diagnostic, Diagnostics};
use crate::node::{
    ConfigDecl, LocalDecl, Node, NodeKind, OutputNode, ResourceDecl, ResourceOptions,
};
use crate::schema::{decompose_token, SchemaCache};

/// Everything binding produced: the node table, the declaration order, the
/// outputs, and the parsed file map (kept for diagnostic rendering).
///
#[derive(Default)]
pub(crate) struct Bound {
    pub nodes: BTreeMap<String, Arc<Node>>,
    pub node_order: Vec<String>,
    pub outputs: Vec<OutputNode>,
    pub files: BTreeMap<String, String>,
}

pub(crate) fn bind(sources: &BTreeMap<String, String>, schemas: &SchemaCache) -> (Bound, Diagnostics) {
    let mut bound = Bound::default();
    let mut diags = Diagnostics::new();
    let mut order = 0usize;
    let mut bodies = Vec::new();

    for (path, src) in sources {
        bound.files.insert(path.clone(), src.clone());
        let body = match hcl::parse(src) {
            Ok(body) => body,
            Err(e) => {
                diags.push(Diagnostic::error(format!("parse error: {e}")).in_file(path));
                continue;
            }
        };
        declare_file(path, &body, &mut bound, &mut order, schemas, &mut diags);
        bodies.push(body);
    }

    // Discover invoked packages so their schemas are cached before any
    // evaluator needs them.
    //
    let mut packages = BTreeSet::new();
    for body in &bodies {
        body_invoke_tokens(body, &mut packages);
    }
    for pkg in packages {
        if let Err(e) = schemas.ensure(&pkg) {
            diags.push(Diagnostic::error(e.to_string()));
        }
    }

    (bound, diags)
}

fn declare_file(
    path: &str,
    body: &Body,
    bound: &mut Bound,
    order: &mut usize,
    schemas: &SchemaCache,
    diags: &mut Diagnostics,
) {
    trace!("declare_file({path})");

    for structure in body.iter() {
        match structure {
            Structure::Attribute(attr) => {
                let name = attr.key.as_str();
                if !check_name(name, "node", path, bound, diags) {
                    continue;
                }
                declare(
                    bound,
                    order,
                    name,
                    NodeKind::Local(LocalDecl {
                        expr: attr.expr.clone(),
                        file: path.to_owned(),
                    }),
                );
            }
            Structure::Block(block) => match block.identifier.as_str() {
                "config" => declare_config_block(path, block, bound, order, diags),
                "package" => declare_package_block(path, block, schemas, diags),
                "resource" => declare_resource_block(path, block, bound, order, schemas, diags),
                "outputs" => declare_outputs_block(path, block, bound, diags),
                other => {
                    diags.push(
                        Diagnostic::error(format!("unexpected block \"{other}\"")).in_file(path),
                    );
                }
            },
        }
    }
}

fn declare(bound: &mut Bound, order: &mut usize, name: &str, kind: NodeKind) {
    let node = Arc::new(Node::new(name, *order, kind));
    *order += 1;
    bound.nodes.insert(name.to_owned(), node);
    bound.node_order.push(name.to_owned());
}

/// Reject the reserved name and duplicates; the diagnostic points at the
/// second declaration.
///
fn check_name(
    name: &str,
    what: &str,
    path: &str,
    bound: &Bound,
    diags: &mut Diagnostics,
) -> bool {
    if name == "range" {
        diags.push(
            Diagnostic::error(format!("{what} may not be named \"range\"")).in_file(path),
        );
        return false;
    }
    if bound.nodes.contains_key(name) {
        diags.push(Diagnostic::error(format!("duplicate {what} \"{name}\"")).in_file(path));
        return false;
    }
    true
}

/// `config { <type> "<name>" { default = ... } ... }`
///
fn declare_config_block(
    path: &str,
    block: &Block,
    bound: &mut Bound,
    order: &mut usize,
    diags: &mut Diagnostics,
) {
    if !block.labels.is_empty() {
        diags.push(Diagnostic::error("config blocks may not have labels").in_file(path));
        return;
    }

    for structure in block.body.iter() {
        let var = match structure {
            Structure::Block(var) => var,
            Structure::Attribute(attr) => {
                diags.push(
                    Diagnostic::error(format!(
                        "unexpected attribute \"{}\" in config block",
                        attr.key.as_str()
                    ))
                    .in_file(path),
                );
                continue;
            }
        };

        let type_label = var.identifier.as_str().to_owned();
        let name = match var.labels.as_slice() {
            [label] => label.as_str().to_owned(),
            _ => {
                diags.push(
                    Diagnostic::error("config variables require exactly one name label")
                        .in_file(path),
                );
                continue;
            }
        };
        if !check_name(&name, "config variable", path, bound, diags) {
            continue;
        }

        let mut default = None;
        for s in var.body.iter() {
            match s {
                Structure::Attribute(attr) if attr.key.as_str() == "default" => {
                    default = Some(attr.expr.clone());
                }
                Structure::Attribute(attr) => {
                    diags.push(
                        Diagnostic::error(format!(
                            "unsupported config attribute \"{}\"",
                            attr.key.as_str()
                        ))
                        .in_file(path),
                    );
                }
                Structure::Block(b) => {
                    diags.push(
                        Diagnostic::error(format!(
                            "unexpected block \"{}\" in config variable",
                            b.identifier.as_str()
                        ))
                        .in_file(path),
                    );
                }
            }
        }

        declare(
            bound,
            order,
            &name,
            NodeKind::Config(ConfigDecl {
                type_label,
                default,
                file: path.to_owned(),
            }),
        );
    }
}

/// `package "<name>" { }` eagerly loads the named provider schema.
///
fn declare_package_block(path: &str, block: &Block, schemas: &SchemaCache, diags: &mut Diagnostics) {
    let name = match block.labels.first() {
        Some(label) => label.as_str().to_owned(),
        None => {
            diags.push(Diagnostic::error("package blocks require a name label").in_file(path));
            return;
        }
    };
    if let Err(e) = schemas.ensure(&name) {
        diags.push(Diagnostic::error(e.to_string()).in_file(path));
    }
}

/// `resource "<name>" "<token>" { options { ... } <inputs> }`
///
fn declare_resource_block(
    path: &str,
    block: &Block,
    bound: &mut Bound,
    order: &mut usize,
    schemas: &SchemaCache,
    diags: &mut Diagnostics,
) {
    let (name, token) = match block.labels.as_slice() {
        [name, token] => (name.as_str().to_owned(), token.as_str().to_owned()),
        _ => {
            diags.push(
                Diagnostic::error("resource blocks require a name label and a type label")
                    .in_file(path),
            );
            return;
        }
    };
    if !check_name(&name, "resource", path, bound, diags) {
        return;
    }

    let pkg_name = match decompose_token(&token) {
        Ok((pkg, _, _)) => pkg.to_owned(),
        Err(e) => {
            diags.push(Diagnostic::error(e.to_string()).in_file(path));
            return;
        }
    };
    let schema = match schemas.ensure(&pkg_name) {
        Ok(schema) => schema,
        Err(e) => {
            diags.push(Diagnostic::error(e.to_string()).in_file(path));
            return;
        }
    };
    let resource_schema = match schema.resource(&token) {
        Ok(r) => r,
        Err(e) => {
            diags.push(Diagnostic::error(e.to_string()).in_file(path));
            return;
        }
    };

    let options = parse_resource_options(path, &block.body, diags);

    declare(
        bound,
        order,
        &name,
        NodeKind::Resource(ResourceDecl {
            token: resource_schema.token.clone(),
            custom: true,
            schema: Some(resource_schema),
            options,
            body: block.body.clone(),
            file: path.to_owned(),
        }),
    );
}

fn parse_resource_options(path: &str, body: &Body, diags: &mut Diagnostics) -> ResourceOptions {
    let mut options = ResourceOptions::default();
    let mut seen = false;

    for structure in body.iter() {
        let block = match structure {
            Structure::Block(block) if block.identifier.as_str() == "options" => block,
            _ => continue,
        };
        if seen {
            diags.push(Diagnostic::error("duplicate options block").in_file(path));
            continue;
        }
        seen = true;

        for s in block.body.iter() {
            match s {
                Structure::Attribute(attr) => match attr.key.as_str() {
                    "range" => options.range = Some(attr.expr.clone()),
                    "parent" => match &attr.expr {
                        Expression::String(s) => options.parent = Some(s.clone()),
                        _ => {
                            diags.push(
                                Diagnostic::error("the parent option must be a literal string")
                                    .in_file(path),
                            );
                        }
                    },
                    other => {
                        diags.push(
                            Diagnostic::error(format!("unsupported resource option \"{other}\""))
                                .in_file(path),
                        );
                    }
                },
                Structure::Block(b) => {
                    diags.push(
                        Diagnostic::error(format!(
                            "unexpected block \"{}\" in options",
                            b.identifier.as_str()
                        ))
                        .in_file(path),
                    );
                }
            }
        }
    }
    options
}

/// `outputs { <name> = <expr> ... }`
///
fn declare_outputs_block(path: &str, block: &Block, bound: &mut Bound, diags: &mut Diagnostics) {
    if !block.labels.is_empty() {
        diags.push(Diagnostic::error("outputs blocks may not have labels").in_file(path));
        return;
    }

    for structure in block.body.iter() {
        match structure {
            Structure::Attribute(attr) => {
                let name = attr.key.as_str();
                if bound.outputs.iter().any(|o| o.name == name) {
                    diags.push(
                        Diagnostic::error(format!("duplicate output \"{name}\"")).in_file(path),
                    );
                    continue;
                }
                bound
                    .outputs
                    .push(OutputNode::new(name, attr.expr.clone(), path));
            }
            Structure::Block(b) => {
                diags.push(
                    Diagnostic::error(format!(
                        "unexpected block \"{}\" in outputs",
                        b.identifier.as_str()
                    ))
                    .in_file(path),
                );
            }
        }
    }
}

// ----- Invoked-package discovery

fn body_invoke_tokens(body: &Body, out: &mut BTreeSet<String>) {
    for structure in body.iter() {
        match structure {
            Structure::Attribute(attr) => expr_invoke_tokens(&attr.expr, out),
            Structure::Block(block) => body_invoke_tokens(&block.body, out),
        }
    }
}

/// Find `invoke("<literal>", ...)` calls and record the package component of
/// the literal token.
///
fn expr_invoke_tokens(expr: &Expression, out: &mut BTreeSet<String>) {
    use hcl::expr::{ObjectKey, Operation, TraversalOperator};

    match expr {
        Expression::FuncCall(call) => {
            if call.name.namespace.is_empty() && call.name.name.as_str() == "invoke" {
                if let Some(Expression::String(token)) = call.args.first() {
                    if let Ok((pkg, _, _)) = decompose_token(token) {
                        out.insert(pkg.to_owned());
                    }
                }
            }
            for a in &call.args {
                expr_invoke_tokens(a, out);
            }
        }
        Expression::Array(xs) => {
            for x in xs {
                expr_invoke_tokens(x, out);
            }
        }
        Expression::Object(entries) => {
            for (key, value) in entries.iter() {
                if let ObjectKey::Expression(e) = key {
                    expr_invoke_tokens(e, out);
                }
                expr_invoke_tokens(value, out);
            }
        }
        Expression::Parenthesis(inner) => expr_invoke_tokens(inner, out),
        Expression::Conditional(c) => {
            expr_invoke_tokens(&c.cond_expr, out);
            expr_invoke_tokens(&c.true_expr, out);
            expr_invoke_tokens(&c.false_expr, out);
        }
        Expression::Operation(op) => match &**op {
            Operation::Unary(u) => expr_invoke_tokens(&u.expr, out),
            Operation::Binary(b) => {
                expr_invoke_tokens(&b.lhs_expr, out);
                expr_invoke_tokens(&b.rhs_expr, out);
            }
        },
        Expression::ForExpr(f) => {
            expr_invoke_tokens(&f.collection_expr, out);
            if let Some(k) = &f.key_expr {
                expr_invoke_tokens(k, out);
            }
            expr_invoke_tokens(&f.value_expr, out);
            if let Some(c) = &f.cond_expr {
                expr_invoke_tokens(c, out);
            }
        }
        Expression::Traversal(t) => {
            expr_invoke_tokens(&t.expr, out);
            for op in &t.operators {
                if let TraversalOperator::Index(e) = op {
                    expr_invoke_tokens(e, out);
                }
            }
        }
        _ => {}
    }
}
