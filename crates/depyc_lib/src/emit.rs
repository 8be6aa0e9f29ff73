//! Source rendering. Four-space indentation, minimal parentheses, `elif` for an `else`
//! holding a single `if`, and a fixed comment form for anything unreconstructed.

use std::fmt::Write as _;

use crate::ast::{
    BoolOp, CompKind, Expr, Generator, Keyword, Param, ParamList, Stmt, UnaryOp, PREC_AND, PREC_ATOM, PREC_AWAIT,
    PREC_CMP, PREC_IFEXP, PREC_LAMBDA, PREC_NOT, PREC_OR, PREC_POWER, PREC_UNARY,
};
use crate::marshal::{str_repr, Value};

const INDENT: &str = "    ";

/// Marker comment text, shared with the report's counting.
pub const MARKER: &str = "# unreconstructed:";

/// Renders a statement tree as source text.
pub struct Emitter {
    markers: bool,
    out: String,
    real: usize,
}

impl Emitter {
    pub fn new(markers: bool) -> Self {
        Emitter { markers, out: String::new(), real: 0 }
    }

    pub fn module(mut self, body: &[Stmt]) -> String {
        for s in body {
            self.stmt(s, 0);
        }
        self.out
    }

    fn line(&mut self, depth: usize, text: &str) {
        for _ in 0..depth {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn code_line(&mut self, depth: usize, text: &str, s: &Stmt) {
        self.real += 1;
        match self.trailing_marker(s) {
            Some(m) => self.line(depth, &format!("{text}  {m}")),
            None => self.line(depth, text),
        }
    }

    fn marker(&mut self, depth: usize, what: &str) {
        if self.markers {
            self.line(depth, &format!("{MARKER} {what}"));
        }
    }

    fn trailing_marker(&self, s: &Stmt) -> Option<String> {
        if !self.markers {
            return None;
        }
        let mut found = None;
        for e in s.exprs() {
            e.walk(&mut |x| {
                if let Expr::Unreconstructed { op, line } = x {
                    found.get_or_insert_with(|| marker_text(op, *line));
                }
            });
        }
        found.map(|t| format!("{MARKER} {t}"))
    }

    fn body(&mut self, stmts: &[Stmt], depth: usize) {
        let before = self.real;
        for s in stmts {
            self.stmt(s, depth);
        }
        if self.real == before {
            self.real += 1;
            self.line(depth, "pass");
        }
    }

    fn stmt(&mut self, s: &Stmt, depth: usize) {
        match s {
            Stmt::FunctionDef(f) => {
                for d in &f.decorators {
                    self.code_line(depth, &format!("@{}", expr(d)), s);
                }
                let kw = if f.is_async { "async def" } else { "def" };
                let ret = f.returns.as_ref().map(|r| format!(" -> {}", expr(r))).unwrap_or_default();
                self.code_line(depth, &format!("{kw} {}({}){ret}:", f.name, params(&f.params, true)), s);
                self.body(&f.body, depth + 1);
            }
            Stmt::ClassDef(c) => {
                for d in &c.decorators {
                    self.code_line(depth, &format!("@{}", expr(d)), s);
                }
                let mut args: Vec<String> = c.bases.iter().map(arg).collect();
                args.extend(c.keywords.iter().map(keyword));
                let head = if args.is_empty() {
                    format!("class {}:", c.name)
                } else {
                    format!("class {}({}):", c.name, args.join(", "))
                };
                self.code_line(depth, &head, s);
                self.body(&c.body, depth + 1);
            }
            Stmt::If { test, body, orelse } => {
                self.code_line(depth, &format!("if {}:", expr(test)), s);
                self.body(body, depth + 1);
                self.orelse(orelse, depth);
            }
            Stmt::While { test, body, orelse } => {
                self.code_line(depth, &format!("while {}:", expr(test)), s);
                self.body(body, depth + 1);
                if !orelse.is_empty() {
                    self.line(depth, "else:");
                    self.body(orelse, depth + 1);
                }
            }
            Stmt::For { target, iter, body, orelse, is_async } => {
                let kw = if *is_async { "async for" } else { "for" };
                self.code_line(depth, &format!("{kw} {} in {}:", target_list(target), top_level(iter)), s);
                self.body(body, depth + 1);
                if !orelse.is_empty() {
                    self.line(depth, "else:");
                    self.body(orelse, depth + 1);
                }
            }
            Stmt::Try { body, handlers, orelse, finalbody } => {
                if handlers.is_empty() && finalbody.is_empty() {
                    for s in body.iter().chain(orelse) {
                        self.stmt(s, depth);
                    }
                    return;
                }
                self.code_line(depth, "try:", s);
                self.body(body, depth + 1);
                for h in handlers {
                    let head = match (&h.typ, &h.name) {
                        (None, _) => "except:".to_string(),
                        (Some(t), None) => format!("except {}:", expr(t)),
                        (Some(t), Some(n)) => format!("except {} as {n}:", expr(t)),
                    };
                    self.line(depth, &head);
                    self.body(&h.body, depth + 1);
                }
                if !orelse.is_empty() && !handlers.is_empty() {
                    self.line(depth, "else:");
                    self.body(orelse, depth + 1);
                }
                if !finalbody.is_empty() {
                    self.line(depth, "finally:");
                    self.body(finalbody, depth + 1);
                }
            }
            Stmt::With { items, body, is_async } => {
                let parts: Vec<String> = items
                    .iter()
                    .map(|i| match &i.target {
                        Some(t) => format!("{} as {}", expr(&i.context), target_list(t)),
                        None => expr(&i.context),
                    })
                    .collect();
                let kw = if *is_async { "async with" } else { "with" };
                self.code_line(depth, &format!("{kw} {}:", parts.join(", ")), s);
                self.body(body, depth + 1);
            }
            Stmt::Assign { targets, value } => {
                let mut text: String = targets.iter().map(|t| format!("{} = ", target_list(t))).collect();
                text.push_str(&top_level(value));
                self.code_line(depth, &text, s);
            }
            Stmt::AugAssign { target, op, value } => {
                self.code_line(depth, &format!("{} {}= {}", expr(target), op.symbol(), top_level(value)), s);
            }
            Stmt::AnnAssign { target, annotation, value } => {
                let text = match value {
                    Some(v) => format!("{}: {} = {}", expr(target), expr(annotation), top_level(v)),
                    None => format!("{}: {}", expr(target), expr(annotation)),
                };
                self.code_line(depth, &text, s);
            }
            Stmt::Return(None) => self.code_line(depth, "return", s),
            Stmt::Return(Some(v)) => self.code_line(depth, &format!("return {}", top_level(v)), s),
            Stmt::Raise { exc, cause } => {
                let text = match (exc, cause) {
                    (None, _) => "raise".to_string(),
                    (Some(e), None) => format!("raise {}", expr(e)),
                    (Some(e), Some(c)) => format!("raise {} from {}", expr(e), expr(c)),
                };
                self.code_line(depth, &text, s);
            }
            Stmt::Expr(Expr::Const(Value::Str(doc))) => self.code_line(depth, &docstring(doc), s),
            Stmt::Expr(e) => self.code_line(depth, &top_level(e), s),
            Stmt::Pass => self.code_line(depth, "pass", s),
            Stmt::Break => self.code_line(depth, "break", s),
            Stmt::Continue => self.code_line(depth, "continue", s),
            Stmt::Delete(targets) => {
                let names: Vec<String> = targets.iter().map(expr).collect();
                self.code_line(depth, &format!("del {}", names.join(", ")), s);
            }
            Stmt::Global(names) => self.code_line(depth, &format!("global {}", names.join(", ")), s),
            Stmt::Nonlocal(names) => self.code_line(depth, &format!("nonlocal {}", names.join(", ")), s),
            Stmt::Assert { test, msg } => {
                let text = match msg {
                    Some(m) => format!("assert {}, {}", expr(test), expr(m)),
                    None => format!("assert {}", expr(test)),
                };
                self.code_line(depth, &text, s);
            }
            Stmt::Import(aliases) => {
                let parts: Vec<String> = aliases.iter().map(alias).collect();
                self.code_line(depth, &format!("import {}", parts.join(", ")), s);
            }
            Stmt::ImportFrom { module, names, level } => {
                let parts: Vec<String> = names.iter().map(alias).collect();
                let from = format!("{}{module}", ".".repeat(*level as usize));
                self.code_line(depth, &format!("from {from} import {}", parts.join(", ")), s);
            }
            Stmt::Unreconstructed { op, line } => self.marker(depth, &marker_text(op, *line)),
            Stmt::RawBlock { label, body } => {
                self.marker(depth, &format!("block L{label}"));
                for s in body {
                    self.stmt(s, depth);
                }
            }
            Stmt::Goto { target, cond: None } => self.marker(depth, &format!("goto L{target}")),
            Stmt::Goto { target, cond: Some(c) } => self.marker(depth, &format!("if {} goto L{target}", expr(c))),
            Stmt::Declaration { text, .. } => {
                for l in text.lines() {
                    self.line(depth, l);
                }
                self.real += 1;
            }
            Stmt::WithEnter { context, .. } => self.marker(depth, &format!("with-enter {}", expr(context))),
            Stmt::WithExit => self.marker(depth, "with-exit"),
            Stmt::PopExcept => self.marker(depth, "POP_EXCEPT"),
            Stmt::Reraise => self.code_line(depth, "raise", s),
            Stmt::BindException(n) => self.marker(depth, &format!("bind exception to {n}")),
            Stmt::CompAppend { .. } => self.marker(depth, "LIST_APPEND"),
        }
    }

    fn orelse(&mut self, orelse: &[Stmt], depth: usize) {
        match orelse {
            [] => {}
            [elif @ Stmt::If { test, body, orelse }] => {
                self.code_line(depth, &format!("elif {}:", expr(test)), elif);
                self.body(body, depth + 1);
                self.orelse(orelse, depth);
            }
            _ => {
                self.line(depth, "else:");
                self.body(orelse, depth + 1);
            }
        }
    }
}

/// Render a module body.
pub fn emit(body: &[Stmt], markers: bool) -> String {
    Emitter::new(markers).module(body)
}

fn marker_text(op: &str, line: Option<u32>) -> String {
    match line {
        Some(l) => format!("{op} (line {l})"),
        None => op.to_string(),
    }
}

fn alias(a: &crate::ast::Alias) -> String {
    match &a.asname {
        Some(n) => format!("{} as {n}", a.name),
        None => a.name.clone(),
    }
}

fn docstring(doc: &str) -> String {
    let plain = doc.contains('\n')
        && !doc.contains("\"\"\"")
        && !doc.contains('\\')
        && !doc.ends_with('"')
        && doc.chars().all(|c| c == '\n' || c == '\t' || !c.is_control());
    if plain {
        format!("\"\"\"{doc}\"\"\"")
    } else {
        str_repr(doc)
    }
}

fn param(p: &Param, annotated: bool) -> String {
    let mut out = p.name.clone();
    let ann = p.annotation.as_ref().filter(|_| annotated);
    if let Some(a) = ann {
        let _ = write!(out, ": {}", expr(a));
    }
    if let Some(d) = &p.default {
        if ann.is_some() {
            let _ = write!(out, " = {}", expr(d));
        } else {
            let _ = write!(out, "={}", expr(d));
        }
    }
    out
}

/// Parameter list text, without the surrounding parentheses.
pub fn params(p: &ParamList, annotated: bool) -> String {
    let mut parts: Vec<String> = p.posonly.iter().map(|x| param(x, annotated)).collect();
    if !p.posonly.is_empty() {
        parts.push("/".into());
    }
    parts.extend(p.args.iter().map(|x| param(x, annotated)));
    match &p.vararg {
        Some(v) => parts.push(format!("*{}", param(v, annotated))),
        None if !p.kwonly.is_empty() => parts.push("*".into()),
        None => {}
    }
    parts.extend(p.kwonly.iter().map(|x| param(x, annotated)));
    if let Some(k) = &p.kwarg {
        parts.push(format!("**{}", param(k, annotated)));
    }
    parts.join(", ")
}

/// Expression at statement level: bare tuples and yields need no parentheses.
fn top_level(e: &Expr) -> String {
    match e {
        Expr::Tuple(items) if !items.is_empty() => target_list(e),
        Expr::Yield(v) => match v {
            Some(v) => format!("yield {}", top_level(v)),
            None => "yield".into(),
        },
        Expr::YieldFrom(v) => format!("yield from {}", expr(v)),
        _ => expr(e),
    }
}

/// Assignment or loop target: an outer tuple is written without parentheses.
fn target_list(e: &Expr) -> String {
    match e {
        Expr::Tuple(items) if items.len() == 1 => format!("{},", expr(&items[0])),
        Expr::Tuple(items) if !items.is_empty() => items.iter().map(expr).collect::<Vec<_>>().join(", "),
        _ => expr(e),
    }
}

/// Render one expression.
pub fn expr(e: &Expr) -> String {
    let mut out = String::new();
    write_expr(&mut out, e);
    out
}

fn paren(e: &Expr, wrap: bool) -> String {
    if wrap {
        format!("({})", expr(e))
    } else {
        expr(e)
    }
}

fn arg(e: &Expr) -> String {
    match e {
        Expr::Starred(v) => format!("*{}", paren(v, v.precedence() < PREC_UNARY)),
        _ => paren(e, e.precedence() <= PREC_LAMBDA),
    }
}

fn keyword(k: &Keyword) -> String {
    match &k.arg {
        Some(a) => format!("{a}={}", paren(&k.value, k.value.precedence() <= PREC_LAMBDA)),
        None => format!("**{}", paren(&k.value, k.value.precedence() < PREC_UNARY)),
    }
}

fn generators(out: &mut String, gens: &[Generator]) {
    for g in gens {
        out.push_str(if g.is_async { " async for " } else { " for " });
        out.push_str(&target_list(&g.target));
        out.push_str(" in ");
        out.push_str(&paren(&g.iter, g.iter.precedence() <= PREC_IFEXP));
        for c in &g.ifs {
            out.push_str(" if ");
            out.push_str(&paren(c, c.precedence() <= PREC_IFEXP));
        }
    }
}

fn comprehension(kind: CompKind, elt: &Expr, value: Option<&Expr>, gens: &[Generator]) -> String {
    let mut inner = match (kind, value) {
        (CompKind::Dict, Some(v)) => {
            format!("{}: {}", paren(elt, elt.precedence() <= PREC_IFEXP), paren(v, v.precedence() <= PREC_LAMBDA))
        }
        _ => paren(elt, elt.precedence() <= PREC_LAMBDA),
    };
    generators(&mut inner, gens);
    match kind {
        CompKind::List => format!("[{inner}]"),
        CompKind::Set | CompKind::Dict => format!("{{{inner}}}"),
        CompKind::Generator => format!("({inner})"),
    }
}

fn escape_fstring_literal(s: &str, quote: char, out: &mut String) {
    for c in s.chars() {
        match c {
            '{' => out.push_str("{{"),
            '}' => out.push_str("}}"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
}

fn fstring_field(value: &Expr, conversion: Option<char>, spec: Option<&Expr>, quote: char, out: &mut String) {
    let text = paren(value, value.precedence() <= PREC_LAMBDA);
    out.push('{');
    if text.starts_with('{') {
        out.push(' ');
    }
    out.push_str(&text);
    if let Some(c) = conversion {
        out.push('!');
        out.push(c);
    }
    if let Some(spec) = spec {
        out.push(':');
        match spec {
            Expr::Const(Value::Str(s)) => escape_fstring_literal(s, quote, out),
            Expr::JoinedStr(parts) => fstring_parts(parts, quote, out),
            other => fstring_field(other, None, None, quote, out),
        }
    }
    out.push('}');
}

fn fstring_parts(parts: &[Expr], quote: char, out: &mut String) {
    for p in parts {
        match p {
            Expr::Const(Value::Str(s)) => escape_fstring_literal(s, quote, out),
            Expr::FormattedValue { value, conversion, spec } => {
                fstring_field(value, *conversion, spec.as_deref(), quote, out)
            }
            other => fstring_field(other, None, None, quote, out),
        }
    }
}

fn fstring(parts: &[Expr]) -> String {
    // Older grammars forbid reusing the outer quote inside replacement fields.
    let mut fields = String::new();
    for p in parts {
        match p {
            Expr::Const(Value::Str(_)) => {}
            Expr::FormattedValue { value, spec, .. } => {
                fields.push_str(&expr(value));
                if let Some(spec) = spec.as_deref().filter(|s| !matches!(s, Expr::Const(Value::Str(_)))) {
                    fields.push_str(&expr(spec));
                }
            }
            other => fields.push_str(&expr(other)),
        }
    }
    let quote = if fields.contains('\'') && !fields.contains('"') { '"' } else { '\'' };
    let mut out = format!("f{quote}");
    fstring_parts(parts, quote, &mut out);
    out.push(quote);
    out
}

fn write_expr(out: &mut String, e: &Expr) {
    match e {
        Expr::Name(n) => out.push_str(n),
        Expr::Const(v) => {
            let _ = write!(out, "{v}");
        }
        Expr::Attribute { value, attr } => {
            let wrap = value.precedence() < PREC_ATOM || matches!(**value, Expr::Const(Value::Int(_)));
            let _ = write!(out, "{}.{attr}", paren(value, wrap));
        }
        Expr::Subscript { value, slice } => {
            let index = match &**slice {
                Expr::Tuple(items) if !items.is_empty() => target_list(slice),
                other => expr(other),
            };
            let _ = write!(out, "{}[{index}]", paren(value, value.precedence() < PREC_ATOM));
        }
        Expr::Slice { lower, upper, step } => {
            if let Some(l) = lower {
                out.push_str(&expr(l));
            }
            out.push(':');
            if let Some(u) = upper {
                out.push_str(&expr(u));
            }
            if let Some(s) = step {
                out.push(':');
                out.push_str(&expr(s));
            }
        }
        Expr::BinOp { left, op, right } | Expr::Inplace { left, op, right } => {
            let p = op.precedence();
            let (lw, rw) = if p == PREC_POWER {
                (left.precedence() <= p, right.precedence() < PREC_UNARY)
            } else {
                (left.precedence() < p, right.precedence() <= p)
            };
            let _ = write!(out, "{} {} {}", paren(left, lw), op.symbol(), paren(right, rw));
        }
        Expr::UnaryOp { op: UnaryOp::Not, operand } => {
            let _ = write!(out, "not {}", paren(operand, operand.precedence() < PREC_NOT));
        }
        Expr::UnaryOp { op, operand } => {
            let sym = match op {
                UnaryOp::Neg => "-",
                UnaryOp::Pos => "+",
                _ => "~",
            };
            let _ = write!(out, "{sym}{}", paren(operand, operand.precedence() < PREC_UNARY));
        }
        Expr::BoolOp { op, values } => {
            let sep = if *op == BoolOp::And { " and " } else { " or " };
            let own = if *op == BoolOp::And { PREC_AND } else { PREC_OR };
            let parts: Vec<String> = values.iter().map(|v| paren(v, v.precedence() <= own)).collect();
            out.push_str(&parts.join(sep));
        }
        Expr::Compare { left, ops } => {
            out.push_str(&paren(left, left.precedence() <= PREC_CMP));
            for (op, right) in ops {
                let _ = write!(out, " {} {}", op.symbol(), paren(right, right.precedence() <= PREC_CMP));
            }
        }
        Expr::Call { func, args, keywords } => {
            out.push_str(&paren(func, func.precedence() < PREC_ATOM));
            out.push('(');
            match (args.as_slice(), keywords.is_empty()) {
                ([Expr::Comprehension { kind: CompKind::Generator, elt, value, generators: g }], true) => {
                    let genexp = comprehension(CompKind::Generator, elt, value.as_deref(), g);
                    out.push_str(&genexp[1..genexp.len() - 1]);
                }
                _ => {
                    let mut parts: Vec<String> = args.iter().map(arg).collect();
                    parts.extend(keywords.iter().map(keyword));
                    out.push_str(&parts.join(", "));
                }
            }
            out.push(')');
        }
        Expr::Tuple(items) => match items.len() {
            0 => out.push_str("()"),
            1 => {
                let _ = write!(out, "({},)", arg(&items[0]));
            }
            _ => {
                let parts: Vec<String> = items.iter().map(arg).collect();
                let _ = write!(out, "({})", parts.join(", "));
            }
        },
        Expr::List(items) => {
            let parts: Vec<String> = items.iter().map(arg).collect();
            let _ = write!(out, "[{}]", parts.join(", "));
        }
        Expr::Set(items) if items.is_empty() => out.push_str("set()"),
        Expr::Set(items) => {
            let parts: Vec<String> = items.iter().map(arg).collect();
            let _ = write!(out, "{{{}}}", parts.join(", "));
        }
        Expr::Dict(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|(k, v)| match k {
                    Some(k) => format!("{}: {}", paren(k, k.precedence() <= PREC_LAMBDA), arg(v)),
                    None => format!("**{}", paren(v, v.precedence() < PREC_UNARY)),
                })
                .collect();
            let _ = write!(out, "{{{}}}", parts.join(", "));
        }
        Expr::Starred(v) => {
            let _ = write!(out, "*{}", paren(v, v.precedence() < PREC_UNARY));
        }
        Expr::IfExp { test, body, orelse } => {
            let _ = write!(
                out,
                "{} if {} else {}",
                paren(body, body.precedence() <= PREC_IFEXP),
                paren(test, test.precedence() <= PREC_IFEXP),
                paren(orelse, orelse.precedence() < PREC_IFEXP)
            );
        }
        Expr::Lambda { params: p, body } => {
            let ps = params(p, false);
            if ps.is_empty() {
                let _ = write!(out, "lambda: {}", expr(body));
            } else {
                let _ = write!(out, "lambda {ps}: {}", expr(body));
            }
        }
        Expr::Comprehension { kind, elt, value, generators: g } => {
            out.push_str(&comprehension(*kind, elt, value.as_deref(), g));
        }
        Expr::JoinedStr(parts) => out.push_str(&fstring(parts)),
        Expr::FormattedValue { .. } => out.push_str(&fstring(std::slice::from_ref(e))),
        Expr::Yield(_) | Expr::YieldFrom(_) => {
            let _ = write!(out, "({})", top_level(e));
        }
        Expr::Await(v) => {
            let _ = write!(out, "await {}", paren(v, v.precedence() < PREC_AWAIT));
        }
        Expr::Unreconstructed { .. } => out.push_str("__unreconstructed__"),
        // Stack placeholders only get here when structuring gave up around them.
        Expr::Null => out.push_str("None"),
        Expr::Function(fv) => out.push_str(&fv.name),
        Expr::BuildClass => out.push_str("__build_class__"),
        Expr::Iter(v) => {
            let _ = write!(out, "iter({})", expr(v));
        }
        Expr::ForItem => out.push_str("__item__"),
        Expr::Exception => out.push_str("__exception__"),
        Expr::ExcMatch(v) | Expr::WithExit(v) | Expr::WithValue(v) | Expr::WithEnterFn(v) => write_expr(out, v),
        Expr::Import { module, .. } => {
            let _ = write!(out, "__import__({})", str_repr(module));
        }
        Expr::ImportFrom { module, name, .. } => {
            let _ = write!(out, "__import__({}).{name}", str_repr(module));
        }
        Expr::UnpackSlot { .. } => out.push('_'),
        Expr::SavedLocal(n) => out.push_str(n),
        Expr::KwNames(names) => {
            let parts: Vec<String> = names.iter().map(|n| str_repr(n)).collect();
            let _ = write!(out, "({})", parts.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, CmpOp, ExceptHandler};

    fn n(s: &str) -> Expr {
        Expr::name(s)
    }

    fn int(v: i64) -> Expr {
        Expr::Const(Value::Int(v))
    }

    fn bin(l: Expr, op: BinOp, r: Expr) -> Expr {
        Expr::BinOp { left: Box::new(l), op, right: Box::new(r) }
    }

    #[test]
    fn precedence_parentheses() {
        assert_eq!(expr(&bin(bin(n("a"), BinOp::Add, n("b")), BinOp::Mul, n("c"))), "(a + b) * c");
        assert_eq!(expr(&bin(n("a"), BinOp::Sub, bin(n("b"), BinOp::Sub, n("c")))), "a - (b - c)");
        assert_eq!(expr(&bin(n("a"), BinOp::Pow, bin(n("b"), BinOp::Pow, n("c")))), "a ** b ** c");
        assert_eq!(expr(&bin(int(-1), BinOp::Pow, int(2))), "(-1) ** 2");
        let neg = Expr::UnaryOp { op: UnaryOp::Neg, operand: Box::new(bin(n("x"), BinOp::Pow, int(2))) };
        assert_eq!(expr(&neg), "-x ** 2");
        assert_eq!(expr(&Expr::attr(int(1), "real")), "(1).real");
    }

    #[test]
    fn not_and_comparisons() {
        let cmp = Expr::Compare { left: Box::new(n("a")), ops: vec![(CmpOp::Lt, n("b")), (CmpOp::LtE, n("c"))] };
        assert_eq!(expr(&Expr::not(cmp.clone())), "not a < b <= c");
        let or = Expr::BoolOp { op: BoolOp::Or, values: vec![n("x"), n("y")] };
        let and = Expr::BoolOp { op: BoolOp::And, values: vec![or, cmp] };
        assert_eq!(expr(&and), "(x or y) and a < b <= c");
    }

    #[test]
    fn fstrings() {
        let f = Expr::JoinedStr(vec![
            Expr::Const(Value::Str("x={".into())),
            Expr::FormattedValue {
                value: Box::new(n("x")),
                conversion: Some('r'),
                spec: Some(Box::new(Expr::Const(Value::Str(">10".into())))),
            },
        ]);
        assert_eq!(expr(&f), "f'x={{{x!r:>10}'");
        let d = Expr::FormattedValue {
            value: Box::new(Expr::Subscript { value: Box::new(n("d")), slice: Box::new(Expr::Const(Value::Str("k".into()))) }),
            conversion: None,
            spec: None,
        };
        assert_eq!(expr(&d), "f\"{d['k']}\"");
    }

    #[test]
    fn sole_generator_argument_drops_its_parentheses() {
        let g = Expr::Comprehension {
            kind: CompKind::Generator,
            elt: Box::new(n("x")),
            value: None,
            generators: vec![Generator { target: n("x"), iter: n("xs"), ifs: vec![], is_async: false }],
        };
        assert_eq!(expr(&Expr::call(n("sum"), vec![g])), "sum(x for x in xs)");
    }

    #[test]
    fn elif_chain() {
        let body = vec![Stmt::If {
            test: n("a"),
            body: vec![Stmt::Pass],
            orelse: vec![Stmt::If {
                test: n("b"),
                body: vec![Stmt::Break],
                orelse: vec![Stmt::Continue],
            }],
        }];
        assert_eq!(emit(&body, true), "if a:\n    pass\nelif b:\n    break\nelse:\n    continue\n");
    }

    #[test]
    fn try_except_as() {
        let body = vec![Stmt::Try {
            body: vec![Stmt::Expr(Expr::call(n("f"), vec![]))],
            handlers: vec![
                ExceptHandler { typ: Some(n("KeyError")), name: Some("e".into()), body: vec![] },
                ExceptHandler { typ: None, name: None, body: vec![Stmt::Reraise] },
            ],
            orelse: vec![],
            finalbody: vec![Stmt::Expr(Expr::call(n("g"), vec![]))],
        }];
        assert_eq!(
            emit(&body, true),
            "try:\n    f()\nexcept KeyError as e:\n    pass\nexcept:\n    raise\nfinally:\n    g()\n"
        );
    }

    #[test]
    fn markers_can_be_turned_off() {
        let body = vec![
            Stmt::Unreconstructed { op: "<254>".into(), line: Some(3) },
            Stmt::Assign { targets: vec![Expr::Tuple(vec![n("a"), n("b")])], value: Expr::Tuple(vec![n("b"), n("a")]) },
        ];
        assert_eq!(emit(&body, true), "# unreconstructed: <254> (line 3)\na, b = b, a\n");
        assert_eq!(emit(&body, false), "a, b = b, a\n");
    }

    #[test]
    fn signatures() {
        let p = |name: &str, default: Option<Expr>| Param { name: name.into(), default, annotation: None };
        let list = ParamList {
            posonly: vec![p("a", None)],
            args: vec![p("b", Some(int(1)))],
            vararg: None,
            kwonly: vec![p("c", None)],
            kwarg: Some(p("kw", None)),
        };
        assert_eq!(params(&list, true), "a, /, b=1, *, c, **kw");
    }
}
