//! Tree-walking expression evaluator.
//!
//! Expressions come out of the parser as structured syntax; evaluation walks
//! that tree against a `Scope` of variables and scope functions. Two rules
//! cut across every form: an unknown operand makes the derivation unknown,
//! and a secret-marked operand makes the result secret-marked.
//!
//! Evaluation is async because function calls may reach the provider
//! (`invoke`); recursion goes through one boxing point.
//!

use std::collections::{BTreeMap, BTreeSet};

use futures::future::BoxFuture;
use futures::FutureExt;
use hcl::expr::{
    BinaryOp, BinaryOperator, Conditional, Expression, ForExpr, FuncCall, ObjectKey, Operation,
    TemplateExpr, Traversal, TraversalOperator, UnaryOp, UnaryOperator,
};
use hcl::structure::{Body, Structure};
use hcl::template::{Directive, Element, Template};

use crate::context::ProgramContext;
use crate::diag::{Diagnostic, Diagnostics};
use crate::functions;
use crate::script;
use crate::value::{format_number, ScriptFunc, Value};

pub type EvalResult = Result<Value, Diagnostics>;

fn err(msg: impl Into<String>) -> Diagnostics {
    Diagnostic::error(msg).into()
}

/// Variables and scope functions an expression evaluates against. Child
/// scopes (range iterations, for-expressions) are cheap clones.
///
#[derive(Clone, Debug, Default)]
pub struct Scope {
    vars: BTreeMap<String, Value>,
    funcs: BTreeMap<String, ScriptFunc>,
}

impl Scope {
    pub fn new() -> Self {
        Scope::default()
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn func(&self, name: &str) -> Option<&ScriptFunc> {
        self.funcs.get(name)
    }

    pub fn set_var(&mut self, name: impl Into<String>, v: Value) {
        self.vars.insert(name.into(), v);
    }

    pub fn set_func(&mut self, name: impl Into<String>, f: ScriptFunc) {
        self.funcs.insert(name.into(), f);
    }

    pub fn child(&self) -> Scope {
        self.clone()
    }
}

pub struct Evaluator<'c> {
    pub ctx: &'c ProgramContext,
}

impl<'c> Evaluator<'c> {
    pub fn new(ctx: &'c ProgramContext) -> Self {
        Evaluator { ctx }
    }

    pub fn eval<'a>(&'a self, expr: &'a Expression, scope: &'a Scope) -> BoxFuture<'a, EvalResult>
    where
        'c: 'a,
    {
        async move {
            match expr {
                Expression::Null => Ok(Value::Null),
                Expression::Bool(b) => Ok(Value::Bool(*b)),
                Expression::Number(n) => Ok(Value::Number(n.as_f64().unwrap_or_default())),
                Expression::String(s) => Ok(Value::String(s.clone())),
                Expression::Array(xs) => {
                    let mut out = Vec::with_capacity(xs.len());
                    for x in xs {
                        out.push(self.eval(x, scope).await?);
                    }
                    Ok(Value::List(out))
                }
                Expression::Object(entries) => {
                    let mut out = BTreeMap::new();
                    for (key, value_expr) in entries.iter() {
                        let key = match key {
                            ObjectKey::Identifier(id) => id.as_str().to_owned(),
                            ObjectKey::Expression(e) => {
                                let (k, secret) = self.eval(e, scope).await?.unmark();
                                if k.is_unknown() {
                                    return Ok(Value::Unknown.restore_mark(secret));
                                }
                                match k {
                                    Value::String(s) => s,
                                    Value::Number(n) => format_number(n),
                                    other => {
                                        return Err(err(format!(
                                            "object keys must be strings, not {}",
                                            other.type_name()
                                        )))
                                    }
                                }
                            }
                            _ => return Err(err("unsupported object key form")),
                        };
                        let v = self.eval(value_expr, scope).await?;
                        out.insert(key, v);
                    }
                    Ok(Value::Object(out))
                }
                Expression::TemplateExpr(t) => self.eval_template_expr(t, scope).await,
                Expression::Variable(v) => {
                    let name = v.as_str();
                    match scope.var(name) {
                        Some(val) => Ok(val.clone()),
                        None => Err(err(format!("unknown variable \"{name}\""))),
                    }
                }
                Expression::Traversal(t) => self.eval_traversal(t, scope).await,
                Expression::FuncCall(call) => self.eval_func_call(call, scope).await,
                Expression::Parenthesis(inner) => self.eval(inner, scope).await,
                Expression::Conditional(c) => self.eval_conditional(c, scope).await,
                Expression::Operation(op) => match &**op {
                    Operation::Unary(u) => self.eval_unary(u, scope).await,
                    Operation::Binary(b) => self.eval_binary(b, scope).await,
                },
                Expression::ForExpr(f) => self.eval_for(f, scope).await,
                _ => Err(err("unsupported expression form")),
            }
        }
        .boxed()
    }

    async fn eval_template_expr(&self, t: &TemplateExpr, scope: &Scope) -> EvalResult {
        let template =
            Template::from_expr(t).map_err(|e| err(format!("invalid string template: {e}")))?;

        // A template that is exactly one interpolation yields the value
        // itself, not its string rendering.
        //
        if let [Element::Interpolation(i)] = template.elements() {
            return self.eval(&i.expr, scope).await;
        }

        let mut secret = false;
        match self.render_template(&template, scope, &mut secret).await? {
            Some(s) => Ok(Value::String(s).restore_mark(secret)),
            None => Ok(Value::Unknown.restore_mark(secret)),
        }
    }

    /// Render a template to text. `Ok(None)` means an unknown leaked into
    /// the rendering, making the whole string unknown.
    ///
    fn render_template<'a>(
        &'a self,
        template: &'a Template,
        scope: &'a Scope,
        secret: &'a mut bool,
    ) -> BoxFuture<'a, Result<Option<String>, Diagnostics>>
    where
        'c: 'a,
    {
        async move {
            let mut out = String::new();
            let mut unknown = false;

            for element in template.elements() {
                match element {
                    Element::Literal(s) => out.push_str(s),
                    Element::Interpolation(i) => {
                        let (v, vs) = self.eval(&i.expr, scope).await?.unmark();
                        *secret |= vs;
                        if v.is_unknown() {
                            unknown = true;
                            continue;
                        }
                        out.push_str(&template_display(&v)?);
                    }
                    Element::Directive(Directive::If(d)) => {
                        let (cond, cs) = self.eval(&d.cond_expr, scope).await?.unmark();
                        *secret |= cs;
                        if cond.is_unknown() {
                            unknown = true;
                            continue;
                        }
                        let rendered = match cond {
                            Value::Bool(true) => {
                                self.render_template(&d.true_template, scope, secret).await?
                            }
                            Value::Bool(false) => match &d.false_template {
                                Some(t) => self.render_template(t, scope, secret).await?,
                                None => Some(String::new()),
                            },
                            other => {
                                return Err(err(format!(
                                    "if directive requires a bool, got {}",
                                    other.type_name()
                                )))
                            }
                        };
                        match rendered {
                            Some(s) => out.push_str(&s),
                            None => unknown = true,
                        }
                    }
                    Element::Directive(Directive::For(d)) => {
                        let (coll, cs) = self.eval(&d.collection_expr, scope).await?.unmark();
                        *secret |= cs;
                        if coll.is_unknown() {
                            unknown = true;
                            continue;
                        }
                        for (k, v) in iterate_value(coll)? {
                            let mut child = scope.child();
                            if let Some(kv) = &d.key_var {
                                child.set_var(kv.as_str(), k);
                            }
                            child.set_var(d.value_var.as_str(), v);
                            match self.render_template(&d.template, &child, secret).await? {
                                Some(s) => out.push_str(&s),
                                None => unknown = true,
                            }
                        }
                    }
                }
            }

            Ok(if unknown { None } else { Some(out) })
        }
        .boxed()
    }

    async fn eval_traversal(&self, t: &Traversal, scope: &Scope) -> EvalResult {
        let base = self.eval(&t.expr, scope).await?;
        self.apply_operators(base, &t.operators, scope).await
    }

    fn apply_operators<'a>(
        &'a self,
        base: Value,
        operators: &'a [TraversalOperator],
        scope: &'a Scope,
    ) -> BoxFuture<'a, EvalResult>
    where
        'c: 'a,
    {
        async move {
            let mut current = base;
            for (i, op) in operators.iter().enumerate() {
                match op {
                    TraversalOperator::AttrSplat | TraversalOperator::FullSplat => {
                        let rest = &operators[i + 1..];
                        let (v, secret) = current.unmark();
                        if v.is_unknown() {
                            return Ok(Value::Unknown.restore_mark(secret));
                        }
                        let elements = match v {
                            Value::List(xs) => xs,
                            Value::Null => Vec::new(),
                            other => vec![other],
                        };
                        let mut out = Vec::with_capacity(elements.len());
                        for e in elements {
                            out.push(self.apply_operators(e, rest, scope).await?);
                        }
                        return Ok(Value::List(out).restore_mark(secret));
                    }
                    TraversalOperator::GetAttr(name) => {
                        current = attr_access(current, name.as_str())?;
                    }
                    TraversalOperator::Index(idx_expr) => {
                        let idx = self.eval(idx_expr, scope).await?;
                        current = index_value(current, idx)?;
                    }
                    TraversalOperator::LegacyIndex(i) => {
                        current = index_value(current, Value::Number(*i as f64))?;
                    }
                    _ => return Err(err("unsupported traversal operator")),
                }
            }
            Ok(current)
        }
        .boxed()
    }

    async fn eval_func_call(&self, call: &FuncCall, scope: &Scope) -> EvalResult {
        let name = if call.name.namespace.is_empty() {
            call.name.name.as_str().to_owned()
        } else {
            let mut parts: Vec<&str> = call.name.namespace.iter().map(|n| n.as_str()).collect();
            parts.push(call.name.name.as_str());
            return Err(err(format!(
                "call to unknown function \"{}\"",
                parts.join("::")
            )));
        };

        let mut args = Vec::with_capacity(call.args.len());
        for a in &call.args {
            args.push(self.eval(a, scope).await?);
        }

        if call.expand_final {
            let last = match args.pop() {
                Some(last) => last,
                None => return Err(err("argument expansion requires at least one argument")),
            };
            let (last, secret) = last.unmark();
            match last {
                Value::List(xs) => args.extend(xs.into_iter().map(|x| x.restore_mark(secret))),
                Value::Unknown => return Ok(Value::Unknown.restore_mark(secret)),
                other => {
                    return Err(err(format!(
                        "only a list can be expanded into arguments, got {}",
                        other.type_name()
                    )))
                }
            }
        }

        if functions::is_builtin(&name) {
            return functions::call_builtin(self, &name, args).await;
        }
        if let Some(f) = scope.func(&name) {
            return script::call_func(f, &args);
        }
        Err(err(format!("call to unknown function \"{name}\"")))
    }

    async fn eval_conditional(&self, c: &Conditional, scope: &Scope) -> EvalResult {
        let (cond, secret) = self.eval(&c.cond_expr, scope).await?.unmark();
        if cond.is_unknown() {
            return Ok(Value::Unknown.restore_mark(secret));
        }
        let branch = match cond {
            Value::Bool(true) => self.eval(&c.true_expr, scope).await?,
            Value::Bool(false) => self.eval(&c.false_expr, scope).await?,
            other => {
                return Err(err(format!(
                    "conditional expression requires a bool, got {}",
                    other.type_name()
                )))
            }
        };
        Ok(branch.restore_mark(secret))
    }

    async fn eval_unary(&self, u: &UnaryOp, scope: &Scope) -> EvalResult {
        let (v, secret) = self.eval(&u.expr, scope).await?.unmark();
        if v.is_unknown() {
            return Ok(Value::Unknown.restore_mark(secret));
        }
        let out = match (&u.operator, &v) {
            (UnaryOperator::Neg, Value::Number(n)) => Value::Number(-n),
            (UnaryOperator::Not, Value::Bool(b)) => Value::Bool(!b),
            (op, v) => {
                return Err(err(format!(
                    "invalid operand for {op:?}: {}",
                    v.type_name()
                )))
            }
        };
        Ok(out.restore_mark(secret))
    }

    async fn eval_binary(&self, b: &BinaryOp, scope: &Scope) -> EvalResult {
        let (lhs, ls) = self.eval(&b.lhs_expr, scope).await?.unmark();
        let (rhs, rs) = self.eval(&b.rhs_expr, scope).await?.unmark();
        let secret = ls || rs;
        if lhs.is_unknown() || rhs.is_unknown() {
            return Ok(Value::Unknown.restore_mark(secret));
        }

        use BinaryOperator::*;
        let out = match &b.operator {
            Eq => Value::Bool(lhs == rhs),
            NotEq => Value::Bool(lhs != rhs),
            And | Or => match (&lhs, &rhs) {
                (Value::Bool(a), Value::Bool(c)) => match &b.operator {
                    And => Value::Bool(*a && *c),
                    _ => Value::Bool(*a || *c),
                },
                _ => {
                    return Err(err(format!(
                        "logical operators require bools, got {} and {}",
                        lhs.type_name(),
                        rhs.type_name()
                    )))
                }
            },
            Plus | Minus | Mul | Div | Mod | Less | LessEq | Greater | GreaterEq => {
                match (&lhs, &rhs) {
                    (Value::Number(a), Value::Number(c)) => match &b.operator {
                        Plus => Value::Number(a + c),
                        Minus => Value::Number(a - c),
                        Mul => Value::Number(a * c),
                        Div => {
                            if *c == 0.0 {
                                return Err(err("division by zero"));
                            }
                            Value::Number(a / c)
                        }
                        Mod => {
                            if *c == 0.0 {
                                return Err(err("division by zero"));
                            }
                            Value::Number(a % c)
                        }
                        Less => Value::Bool(a < c),
                        LessEq => Value::Bool(a <= c),
                        Greater => Value::Bool(a > c),
                        _ => Value::Bool(a >= c),
                    },
                    _ => {
                        return Err(err(format!(
                            "arithmetic operators require numbers, got {} and {}",
                            lhs.type_name(),
                            rhs.type_name()
                        )))
                    }
                }
            }
        };
        Ok(out.restore_mark(secret))
    }

    async fn eval_for(&self, f: &ForExpr, scope: &Scope) -> EvalResult {
        let (coll, mut secret) = self.eval(&f.collection_expr, scope).await?.unmark();
        if coll.is_unknown() {
            return Ok(Value::Unknown.restore_mark(secret));
        }
        let entries = iterate_value(coll)?;

        // Object form when a key expression is present, list form otherwise.
        //
        if let Some(key_expr) = &f.key_expr {
            let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            let mut flat: BTreeMap<String, Value> = BTreeMap::new();
            for (k, v) in entries {
                let mut child = scope.child();
                if let Some(kv) = &f.key_var {
                    child.set_var(kv.as_str(), k);
                }
                child.set_var(f.value_var.as_str(), v);

                match self.eval_for_cond(f, &child, &mut secret).await? {
                    Some(true) => {}
                    Some(false) => continue,
                    None => return Ok(Value::Unknown.restore_mark(secret)),
                }

                let (key, ks) = self.eval(key_expr, &child).await?.unmark();
                secret |= ks;
                if key.is_unknown() {
                    return Ok(Value::Unknown.restore_mark(secret));
                }
                let key = match key {
                    Value::String(s) => s,
                    other => {
                        return Err(err(format!(
                            "object keys must be strings, not {}",
                            other.type_name()
                        )))
                    }
                };
                let value = self.eval(&f.value_expr, &child).await?;
                if f.grouping {
                    grouped.entry(key).or_default().push(value);
                } else if flat.insert(key.clone(), value).is_some() {
                    return Err(err(format!("duplicate object key \"{key}\"")));
                }
            }
            let out = if f.grouping {
                Value::Object(grouped.into_iter().map(|(k, v)| (k, Value::List(v))).collect())
            } else {
                Value::Object(flat)
            };
            Ok(out.restore_mark(secret))
        } else {
            let mut out = Vec::new();
            for (k, v) in entries {
                let mut child = scope.child();
                if let Some(kv) = &f.key_var {
                    child.set_var(kv.as_str(), k);
                }
                child.set_var(f.value_var.as_str(), v);

                match self.eval_for_cond(f, &child, &mut secret).await? {
                    Some(true) => {}
                    Some(false) => continue,
                    None => return Ok(Value::Unknown.restore_mark(secret)),
                }

                out.push(self.eval(&f.value_expr, &child).await?);
            }
            Ok(Value::List(out).restore_mark(secret))
        }
    }

    /// Evaluate a for-expression condition: `None` means the condition is
    /// unknown and absorbs the whole expression.
    ///
    async fn eval_for_cond(
        &self,
        f: &ForExpr,
        scope: &Scope,
        secret: &mut bool,
    ) -> Result<Option<bool>, Diagnostics> {
        let cond_expr = match &f.cond_expr {
            Some(c) => c,
            None => return Ok(Some(true)),
        };
        let (c, cs) = self.eval(cond_expr, scope).await?.unmark();
        *secret |= cs;
        if c.is_unknown() {
            return Ok(None);
        }
        match c {
            Value::Bool(b) => Ok(Some(b)),
            other => Err(err(format!(
                "for-expression condition requires a bool, got {}",
                other.type_name()
            ))),
        }
    }
}

fn attr_access(v: Value, name: &str) -> EvalResult {
    let (v, secret) = v.unmark();
    if v.is_unknown() {
        return Ok(Value::Unknown.restore_mark(secret));
    }
    match v {
        Value::Object(mut m) => match m.remove(name) {
            Some(attr) => Ok(attr.restore_mark(secret)),
            None => Err(err(format!("object has no attribute \"{name}\""))),
        },
        other => Err(err(format!(
            "can not access attribute \"{name}\" on a {}",
            other.type_name()
        ))),
    }
}

fn index_value(v: Value, idx: Value) -> EvalResult {
    let (v, vs) = v.unmark();
    let (idx, is) = idx.unmark();
    let secret = vs || is;
    if v.is_unknown() || idx.is_unknown() {
        return Ok(Value::Unknown.restore_mark(secret));
    }
    match (v, idx) {
        (Value::List(mut xs), Value::Number(n)) => {
            if n < 0.0 || n.fract() != 0.0 {
                return Err(err(format!("invalid list index {}", format_number(n))));
            }
            let i = n as usize;
            if i >= xs.len() {
                return Err(err(format!("list index {i} out of range")));
            }
            Ok(xs.swap_remove(i).restore_mark(secret))
        }
        (Value::Object(mut m), Value::String(k)) => match m.remove(&k) {
            Some(attr) => Ok(attr.restore_mark(secret)),
            None => Err(err(format!("object has no attribute \"{k}\""))),
        },
        (v, idx) => Err(err(format!(
            "can not index a {} with a {}",
            v.type_name(),
            idx.type_name()
        ))),
    }
}

fn iterate_value(v: Value) -> Result<Vec<(Value, Value)>, Diagnostics> {
    match v {
        Value::List(xs) => Ok(xs
            .into_iter()
            .enumerate()
            .map(|(i, x)| (Value::Number(i as f64), x))
            .collect()),
        Value::Object(m) => Ok(m.into_iter().map(|(k, v)| (Value::String(k), v)).collect()),
        other => Err(err(format!("can not iterate over a {}", other.type_name()))),
    }
}

fn template_display(v: &Value) -> Result<String, Diagnostics> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(format_number(*n)),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(err(format!(
            "can not render a {} inside a string template",
            other.type_name()
        ))),
    }
}

// ----- Static reference discovery (used by `prepare`)

/// Collect the root names an expression refers to: variable roots plus the
/// names of function calls that do not resolve to builtins. `range` and
/// locally-bound for-expression variables are excluded.
///
pub(crate) fn expr_refs(expr: &Expression, bound: &mut Vec<String>, out: &mut BTreeSet<String>) {
    match expr {
        Expression::Variable(v) => {
            record_ref(v.as_str(), bound, out);
        }
        Expression::Array(xs) => {
            for x in xs {
                expr_refs(x, bound, out);
            }
        }
        Expression::Object(entries) => {
            for (key, value) in entries.iter() {
                if let ObjectKey::Expression(e) = key {
                    expr_refs(e, bound, out);
                }
                expr_refs(value, bound, out);
            }
        }
        Expression::TemplateExpr(t) => {
            if let Ok(template) = Template::from_expr(t) {
                template_refs(&template, bound, out);
            }
        }
        Expression::Traversal(t) => {
            expr_refs(&t.expr, bound, out);
            for op in &t.operators {
                if let TraversalOperator::Index(e) = op {
                    expr_refs(e, bound, out);
                }
            }
        }
        Expression::FuncCall(call) => {
            if call.name.namespace.is_empty() {
                let name = call.name.name.as_str();
                if !functions::is_builtin(name) {
                    record_ref(name, bound, out);
                }
            }
            for a in &call.args {
                expr_refs(a, bound, out);
            }
        }
        Expression::Parenthesis(inner) => expr_refs(inner, bound, out),
        Expression::Conditional(c) => {
            expr_refs(&c.cond_expr, bound, out);
            expr_refs(&c.true_expr, bound, out);
            expr_refs(&c.false_expr, bound, out);
        }
        Expression::Operation(op) => match &**op {
            Operation::Unary(u) => expr_refs(&u.expr, bound, out),
            Operation::Binary(b) => {
                expr_refs(&b.lhs_expr, bound, out);
                expr_refs(&b.rhs_expr, bound, out);
            }
        },
        Expression::ForExpr(f) => {
            expr_refs(&f.collection_expr, bound, out);
            let depth = bound.len();
            if let Some(kv) = &f.key_var {
                bound.push(kv.as_str().to_owned());
            }
            bound.push(f.value_var.as_str().to_owned());
            if let Some(k) = &f.key_expr {
                expr_refs(k, bound, out);
            }
            expr_refs(&f.value_expr, bound, out);
            if let Some(c) = &f.cond_expr {
                expr_refs(c, bound, out);
            }
            bound.truncate(depth);
        }
        _ => {}
    }
}

fn template_refs(template: &Template, bound: &mut Vec<String>, out: &mut BTreeSet<String>) {
    for element in template.elements() {
        match element {
            Element::Literal(_) => {}
            Element::Interpolation(i) => expr_refs(&i.expr, bound, out),
            Element::Directive(Directive::If(d)) => {
                expr_refs(&d.cond_expr, bound, out);
                template_refs(&d.true_template, bound, out);
                if let Some(t) = &d.false_template {
                    template_refs(t, bound, out);
                }
            }
            Element::Directive(Directive::For(d)) => {
                expr_refs(&d.collection_expr, bound, out);
                let depth = bound.len();
                if let Some(kv) = &d.key_var {
                    bound.push(kv.as_str().to_owned());
                }
                bound.push(d.value_var.as_str().to_owned());
                template_refs(&d.template, bound, out);
                bound.truncate(depth);
            }
        }
    }
}

fn record_ref(name: &str, bound: &[String], out: &mut BTreeSet<String>) {
    if name != "range" && !bound.iter().any(|b| b == name) {
        out.insert(name.to_owned());
    }
}

/// Collect the root references of every expression inside a body,
/// recursively through nested blocks.
///
pub(crate) fn body_refs(body: &Body, out: &mut BTreeSet<String>) {
    for structure in body.iter() {
        match structure {
            Structure::Attribute(attr) => {
                let mut bound = Vec::new();
                expr_refs(&attr.expr, &mut bound, out);
            }
            Structure::Block(block) => body_refs(&block.body, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    pub(crate) fn parse_expr(src: &str) -> Expression {
        let body = hcl::parse(&format!("x = {src}\n")).expect("parse");
        for structure in body.iter() {
            if let Structure::Attribute(attr) = structure {
                return attr.expr.clone();
            }
        }
        panic!("no attribute parsed");
    }

    async fn eval_str(src: &str, scope: &Scope) -> EvalResult {
        let ctx = test_context();
        let ev = Evaluator::new(&ctx);
        let expr = parse_expr(src);
        ev.eval(&expr, scope).await
    }

    #[tokio::test]
    async fn test_literals_and_operators() {
        let scope = Scope::new();
        assert_eq!(eval_str("1 + 2 * 3", &scope).await.unwrap(), Value::Number(7.0));
        assert_eq!(
            eval_str("\"a\" == \"a\"", &scope).await.unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_str("true ? 1 : 2", &scope).await.unwrap(),
            Value::Number(1.0)
        );
        assert_eq!(eval_str("!false", &scope).await.unwrap(), Value::Bool(true));
        assert_eq!(eval_str("-(3)", &scope).await.unwrap(), Value::Number(-3.0));
        assert!(eval_str("1 / 0", &scope).await.is_err());
    }

    #[tokio::test]
    async fn test_string_interpolation() {
        let mut scope = Scope::new();
        scope.set_var("name", Value::string("world"));
        assert_eq!(
            eval_str("\"hello, ${name}\"", &scope).await.unwrap(),
            Value::string("hello, world")
        );

        // A lone interpolation passes the value through untouched.
        //
        scope.set_var("xs", Value::List(vec![Value::Number(1.0)]));
        assert_eq!(
            eval_str("\"${xs}\"", &scope).await.unwrap(),
            Value::List(vec![Value::Number(1.0)])
        );
    }

    #[tokio::test]
    async fn test_traversal_and_index() {
        let mut scope = Scope::new();
        scope.set_var(
            "obj",
            Value::object([(
                "inner".to_string(),
                Value::List(vec![Value::Number(10.0), Value::Number(20.0)]),
            )]),
        );
        assert_eq!(
            eval_str("obj.inner[1]", &scope).await.unwrap(),
            Value::Number(20.0)
        );
        assert!(eval_str("obj.missing", &scope).await.is_err());
        assert!(eval_str("obj.inner[5]", &scope).await.is_err());
    }

    #[tokio::test]
    async fn test_splat() {
        let mut scope = Scope::new();
        scope.set_var(
            "xs",
            Value::List(vec![
                Value::object([("id".to_string(), Value::Number(1.0))]),
                Value::object([("id".to_string(), Value::Number(2.0))]),
            ]),
        );
        assert_eq!(
            eval_str("xs.*.id", &scope).await.unwrap(),
            Value::List(vec![Value::Number(1.0), Value::Number(2.0)])
        );
        assert_eq!(
            eval_str("xs[*].id", &scope).await.unwrap(),
            Value::List(vec![Value::Number(1.0), Value::Number(2.0)])
        );
    }

    #[tokio::test]
    async fn test_for_expressions() {
        let mut scope = Scope::new();
        scope.set_var(
            "xs",
            Value::List(vec![
                Value::Number(1.0),
                Value::Number(2.0),
                Value::Number(3.0),
            ]),
        );
        assert_eq!(
            eval_str("[for x in xs : x * 2]", &scope).await.unwrap(),
            Value::List(vec![
                Value::Number(2.0),
                Value::Number(4.0),
                Value::Number(6.0)
            ])
        );
        assert_eq!(
            eval_str("[for x in xs : x if x > 1]", &scope).await.unwrap(),
            Value::List(vec![Value::Number(2.0), Value::Number(3.0)])
        );
        assert_eq!(
            eval_str("{for i, x in xs : \"k${i}\" => x}", &scope)
                .await
                .unwrap(),
            Value::object([
                ("k0".to_string(), Value::Number(1.0)),
                ("k1".to_string(), Value::Number(2.0)),
                ("k2".to_string(), Value::Number(3.0)),
            ])
        );
    }

    #[tokio::test]
    async fn test_unknown_is_absorbing() {
        let mut scope = Scope::new();
        scope.set_var("u", Value::Unknown);
        assert_eq!(eval_str("u + 1", &scope).await.unwrap(), Value::Unknown);
        assert_eq!(
            eval_str("\"v=${u}\"", &scope).await.unwrap(),
            Value::Unknown
        );
        assert_eq!(eval_str("u ? 1 : 2", &scope).await.unwrap(), Value::Unknown);
        assert_eq!(eval_str("u == 4", &scope).await.unwrap(), Value::Unknown);
        assert_eq!(
            eval_str("[for x in u : x]", &scope).await.unwrap(),
            Value::Unknown
        );
    }

    #[tokio::test]
    async fn test_secret_propagates() {
        let mut scope = Scope::new();
        scope.set_var("s", Value::Number(4.0).mark_secret());

        let v = eval_str("s + 1", &scope).await.unwrap();
        assert!(v.is_secret());
        assert_eq!(v.unmark().0, Value::Number(5.0));

        let v = eval_str("\"n=${s}\"", &scope).await.unwrap();
        assert!(v.is_secret());
        assert_eq!(v.unmark().0, Value::string("n=4"));
    }

    #[tokio::test]
    async fn test_unknown_variable_is_a_diagnostic() {
        let scope = Scope::new();
        let e = eval_str("nope + 1", &scope).await.unwrap_err();
        assert!(e.has_errors());
    }

    #[test]
    fn test_expr_refs() {
        let expr = parse_expr("\"${a.id} ${b[c]}\"");
        let mut out = BTreeSet::new();
        expr_refs(&expr, &mut Vec::new(), &mut out);
        assert_eq!(
            out,
            BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );

        // Calls that are not builtins count as references; range and bound
        // for-variables do not.
        //
        let expr = parse_expr("[for x in items : makeName(x, range.value)]");
        let mut out = BTreeSet::new();
        expr_refs(&expr, &mut Vec::new(), &mut out);
        assert_eq!(
            out,
            BTreeSet::from(["items".to_string(), "makeName".to_string()])
        );

        // Builtins are not references.
        //
        let expr = parse_expr("mimeType(file)");
        let mut out = BTreeSet::new();
        expr_refs(&expr, &mut Vec::new(), &mut out);
        assert_eq!(out, BTreeSet::from(["file".to_string()]));
    }
}
