//! Expression and statement trees shared by the translator, reconstructor, fixer and emitter.
//!
//! `Expr` doubles as the symbolic evaluation-stack value: a handful of variants (marked
//! "stack only") exist solely while simulating the stack and are folded away by the
//! reconstructor before the tree reaches the emitter.

use serde::Serialize;

use crate::marshal::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    MatMul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
}

impl BinOp {
    /// `BINARY_OP` operand order (`NB_*` constants).
    const NB_ORDER: [BinOp; 13] = [
        BinOp::Add,
        BinOp::BitAnd,
        BinOp::FloorDiv,
        BinOp::LShift,
        BinOp::MatMul,
        BinOp::Mul,
        BinOp::Mod,
        BinOp::BitOr,
        BinOp::Pow,
        BinOp::RShift,
        BinOp::Sub,
        BinOp::TrueDiv,
        BinOp::BitXor,
    ];

    /// Decode a `BINARY_OP` argument into the operator and whether it is in-place.
    pub fn from_nb(arg: u32) -> Option<(BinOp, bool)> {
        let idx = arg as usize;
        if idx < 13 {
            Some((Self::NB_ORDER[idx], false))
        } else if idx < 26 {
            Some((Self::NB_ORDER[idx - 13], true))
        } else {
            None
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::MatMul => "@",
            BinOp::TrueDiv => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::LShift => "<<",
            BinOp::RShift => ">>",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
        }
    }

    pub fn precedence(self) -> u8 {
        match self {
            BinOp::BitOr => PREC_BITOR,
            BinOp::BitXor => PREC_BITXOR,
            BinOp::BitAnd => PREC_BITAND,
            BinOp::LShift | BinOp::RShift => PREC_SHIFT,
            BinOp::Add | BinOp::Sub => PREC_ARITH,
            BinOp::Mul | BinOp::MatMul | BinOp::TrueDiv | BinOp::FloorDiv | BinOp::Mod => PREC_TERM,
            BinOp::Pow => PREC_POWER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Lt,
    LtE,
    Eq,
    NotEq,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CmpOp {
    /// `COMPARE_OP` table index (`<`, `<=`, `==`, `!=`, `>`, `>=`).
    pub fn from_index(idx: u32) -> Option<CmpOp> {
        Some(match idx {
            0 => CmpOp::Lt,
            1 => CmpOp::LtE,
            2 => CmpOp::Eq,
            3 => CmpOp::NotEq,
            4 => CmpOp::Gt,
            5 => CmpOp::GtE,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::LtE => "<=",
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Gt => ">",
            CmpOp::GtE => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
        }
    }

    pub fn from_symbol(s: &str) -> Option<CmpOp> {
        Some(match s {
            "<" => CmpOp::Lt,
            "<=" => CmpOp::LtE,
            "==" => CmpOp::Eq,
            "!=" => CmpOp::NotEq,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::GtE,
            "in" => CmpOp::In,
            "not in" => CmpOp::NotIn,
            "is" => CmpOp::Is,
            "is not" => CmpOp::IsNot,
            _ => return None,
        })
    }

    pub fn negate(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::GtE,
            CmpOp::LtE => CmpOp::Gt,
            CmpOp::Eq => CmpOp::NotEq,
            CmpOp::NotEq => CmpOp::Eq,
            CmpOp::Gt => CmpOp::LtE,
            CmpOp::GtE => CmpOp::Lt,
            CmpOp::In => CmpOp::NotIn,
            CmpOp::NotIn => CmpOp::In,
            CmpOp::Is => CmpOp::IsNot,
            CmpOp::IsNot => CmpOp::Is,
        }
    }
}

pub const PREC_LAMBDA: u8 = 1;
pub const PREC_IFEXP: u8 = 2;
pub const PREC_OR: u8 = 3;
pub const PREC_AND: u8 = 4;
pub const PREC_NOT: u8 = 5;
pub const PREC_CMP: u8 = 6;
pub const PREC_BITOR: u8 = 7;
pub const PREC_BITXOR: u8 = 8;
pub const PREC_BITAND: u8 = 9;
pub const PREC_SHIFT: u8 = 10;
pub const PREC_ARITH: u8 = 11;
pub const PREC_TERM: u8 = 12;
pub const PREC_UNARY: u8 = 13;
pub const PREC_POWER: u8 = 14;
pub const PREC_AWAIT: u8 = 15;
pub const PREC_ATOM: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generator {
    pub target: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    /// `None` for `**mapping`.
    pub arg: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
    pub annotation: Option<Expr>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamList {
    pub posonly: Vec<Param>,
    pub args: Vec<Param>,
    pub vararg: Option<Param>,
    pub kwonly: Vec<Param>,
    pub kwarg: Option<Param>,
}

impl ParamList {
    pub fn is_empty(&self) -> bool {
        self.posonly.is_empty()
            && self.args.is_empty()
            && self.vararg.is_none()
            && self.kwonly.is_empty()
            && self.kwarg.is_none()
    }
}

/// The value produced by `MAKE_FUNCTION` before it is bound to a name.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionValue {
    /// Index of the nested code object in the flattened code tree.
    pub code: usize,
    pub name: String,
    pub defaults: Vec<Expr>,
    pub kw_defaults: Vec<(String, Expr)>,
    pub annotations: Vec<(String, Expr)>,
    pub has_closure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Name(String),
    Const(Value),
    Attribute { value: Box<Expr>, attr: String },
    Subscript { value: Box<Expr>, slice: Box<Expr> },
    Slice { lower: Option<Box<Expr>>, upper: Option<Box<Expr>>, step: Option<Box<Expr>> },
    BinOp { left: Box<Expr>, op: BinOp, right: Box<Expr> },
    UnaryOp { op: UnaryOp, operand: Box<Expr> },
    BoolOp { op: BoolOp, values: Vec<Expr> },
    Compare { left: Box<Expr>, ops: Vec<(CmpOp, Expr)> },
    Call { func: Box<Expr>, args: Vec<Expr>, keywords: Vec<Keyword> },
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Set(Vec<Expr>),
    /// `None` key marks a `**mapping` entry.
    Dict(Vec<(Option<Expr>, Expr)>),
    Starred(Box<Expr>),
    IfExp { test: Box<Expr>, body: Box<Expr>, orelse: Box<Expr> },
    Lambda { params: Box<ParamList>, body: Box<Expr> },
    Comprehension { kind: CompKind, elt: Box<Expr>, value: Option<Box<Expr>>, generators: Vec<Generator> },
    JoinedStr(Vec<Expr>),
    FormattedValue { value: Box<Expr>, conversion: Option<char>, spec: Option<Box<Expr>> },
    Yield(Option<Box<Expr>>),
    YieldFrom(Box<Expr>),
    Await(Box<Expr>),
    /// Logic that could not be rebuilt, rendered with a marker comment.
    Unreconstructed { op: String, line: Option<u32> },

    // Stack only.
    Null,
    Function(Box<FunctionValue>),
    BuildClass,
    Iter(Box<Expr>),
    ForItem,
    Exception,
    ExcMatch(Box<Expr>),
    WithExit(Box<Expr>),
    WithValue(Box<Expr>),
    WithEnterFn(Box<Expr>),
    Import { module: String, fromlist: Option<Vec<String>>, level: u32 },
    ImportFrom { module: String, name: String, level: u32 },
    UnpackSlot { group: usize, index: usize },
    SavedLocal(String),
    KwNames(Vec<String>),
    Inplace { left: Box<Expr>, op: BinOp, right: Box<Expr> },
}

impl Expr {
    pub fn name(s: impl Into<String>) -> Expr {
        Expr::Name(s.into())
    }

    pub fn none() -> Expr {
        Expr::Const(Value::None)
    }

    pub fn is_none_const(&self) -> bool {
        matches!(self, Expr::Const(Value::None))
    }

    pub fn attr(value: Expr, attr: impl Into<String>) -> Expr {
        Expr::Attribute { value: Box::new(value), attr: attr.into() }
    }

    pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call { func: Box::new(func), args, keywords: Vec::new() }
    }

    pub fn not(e: Expr) -> Expr {
        match e {
            Expr::UnaryOp { op: UnaryOp::Not, operand } => *operand,
            Expr::Compare { left, mut ops } if ops.len() == 1 => {
                let (op, right) = ops.remove(0);
                match op {
                    CmpOp::In | CmpOp::NotIn | CmpOp::Is | CmpOp::IsNot => {
                        Expr::Compare { left, ops: vec![(op.negate(), right)] }
                    }
                    _ => Expr::UnaryOp {
                        op: UnaryOp::Not,
                        operand: Box::new(Expr::Compare { left, ops: vec![(op, right)] }),
                    },
                }
            }
            other => Expr::UnaryOp { op: UnaryOp::Not, operand: Box::new(other) },
        }
    }

    /// Placeholders that never reach the emitter as themselves.
    pub fn is_stack_only(&self) -> bool {
        matches!(
            self,
            Expr::Null
                | Expr::BuildClass
                | Expr::ForItem
                | Expr::Exception
                | Expr::ExcMatch(_)
                | Expr::WithExit(_)
                | Expr::WithValue(_)
                | Expr::WithEnterFn(_)
                | Expr::UnpackSlot { .. }
                | Expr::SavedLocal(_)
                | Expr::KwNames(_)
        )
    }

    pub fn precedence(&self) -> u8 {
        match self {
            Expr::Lambda { .. } => PREC_LAMBDA,
            Expr::IfExp { .. } => PREC_IFEXP,
            Expr::BoolOp { op: BoolOp::Or, .. } => PREC_OR,
            Expr::BoolOp { op: BoolOp::And, .. } => PREC_AND,
            Expr::UnaryOp { op: UnaryOp::Not, .. } => PREC_NOT,
            Expr::Compare { .. } => PREC_CMP,
            Expr::BinOp { op, .. } | Expr::Inplace { op, .. } => op.precedence(),
            Expr::UnaryOp { .. } => PREC_UNARY,
            Expr::Await(_) => PREC_AWAIT,
            Expr::Yield(_) | Expr::YieldFrom(_) => 0,
            Expr::Const(Value::Int(v)) if *v < 0 => PREC_UNARY,
            Expr::Const(Value::Float(v)) if *v < 0.0 => PREC_UNARY,
            Expr::Const(Value::Complex(..)) => PREC_ARITH,
            _ => PREC_ATOM,
        }
    }

    /// Visit every sub-expression, this one included, depth first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Attribute { value, .. } => value.walk(f),
            Expr::Subscript { value, slice } => {
                value.walk(f);
                slice.walk(f);
            }
            Expr::Slice { lower, upper, step } => {
                for e in [lower, upper, step].into_iter().flatten() {
                    e.walk(f);
                }
            }
            Expr::BinOp { left, right, .. } | Expr::Inplace { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::UnaryOp { operand, .. } => operand.walk(f),
            Expr::BoolOp { values, .. } | Expr::Tuple(values) | Expr::List(values) | Expr::Set(values) => {
                for v in values {
                    v.walk(f);
                }
            }
            Expr::JoinedStr(values) => {
                for v in values {
                    v.walk(f);
                }
            }
            Expr::Compare { left, ops } => {
                left.walk(f);
                for (_, e) in ops {
                    e.walk(f);
                }
            }
            Expr::Call { func, args, keywords } => {
                func.walk(f);
                for a in args {
                    a.walk(f);
                }
                for k in keywords {
                    k.value.walk(f);
                }
            }
            Expr::Dict(items) => {
                for (k, v) in items {
                    if let Some(k) = k {
                        k.walk(f);
                    }
                    v.walk(f);
                }
            }
            Expr::Starred(e)
            | Expr::YieldFrom(e)
            | Expr::Await(e)
            | Expr::Iter(e)
            | Expr::ExcMatch(e)
            | Expr::WithExit(e)
            | Expr::WithValue(e)
            | Expr::WithEnterFn(e) => e.walk(f),
            Expr::Yield(e) => {
                if let Some(e) = e {
                    e.walk(f);
                }
            }
            Expr::IfExp { test, body, orelse } => {
                test.walk(f);
                body.walk(f);
                orelse.walk(f);
            }
            Expr::Lambda { params, body } => {
                for p in params_defaults(params) {
                    p.walk(f);
                }
                body.walk(f);
            }
            Expr::Comprehension { elt, value, generators, .. } => {
                elt.walk(f);
                if let Some(v) = value {
                    v.walk(f);
                }
                for g in generators {
                    g.target.walk(f);
                    g.iter.walk(f);
                    for c in &g.ifs {
                        c.walk(f);
                    }
                }
            }
            Expr::FormattedValue { value, spec, .. } => {
                value.walk(f);
                if let Some(s) = spec {
                    s.walk(f);
                }
            }
            Expr::Function(func) => {
                for d in &func.defaults {
                    d.walk(f);
                }
                for (_, d) in &func.kw_defaults {
                    d.walk(f);
                }
            }
            Expr::Name(_)
            | Expr::Const(_)
            | Expr::Unreconstructed { .. }
            | Expr::Null
            | Expr::BuildClass
            | Expr::ForItem
            | Expr::Exception
            | Expr::Import { .. }
            | Expr::ImportFrom { .. }
            | Expr::UnpackSlot { .. }
            | Expr::SavedLocal(_)
            | Expr::KwNames(_) => {}
        }
    }
}

impl Expr {
    /// Rewrite every sub-expression bottom-up: children first, then `self`.
    pub fn visit_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        match self {
            Expr::Attribute { value, .. } => value.visit_mut(f),
            Expr::Subscript { value, slice } => {
                value.visit_mut(f);
                slice.visit_mut(f);
            }
            Expr::Slice { lower, upper, step } => {
                for e in [lower, upper, step].into_iter().flatten() {
                    e.visit_mut(f);
                }
            }
            Expr::BinOp { left, right, .. } | Expr::Inplace { left, right, .. } => {
                left.visit_mut(f);
                right.visit_mut(f);
            }
            Expr::UnaryOp { operand, .. } => operand.visit_mut(f),
            Expr::BoolOp { values, .. }
            | Expr::Tuple(values)
            | Expr::List(values)
            | Expr::Set(values)
            | Expr::JoinedStr(values) => {
                for v in values {
                    v.visit_mut(f);
                }
            }
            Expr::Compare { left, ops } => {
                left.visit_mut(f);
                for (_, e) in ops {
                    e.visit_mut(f);
                }
            }
            Expr::Call { func, args, keywords } => {
                func.visit_mut(f);
                for a in args {
                    a.visit_mut(f);
                }
                for k in keywords {
                    k.value.visit_mut(f);
                }
            }
            Expr::Dict(items) => {
                for (k, v) in items {
                    if let Some(k) = k {
                        k.visit_mut(f);
                    }
                    v.visit_mut(f);
                }
            }
            Expr::Starred(e)
            | Expr::YieldFrom(e)
            | Expr::Await(e)
            | Expr::Iter(e)
            | Expr::ExcMatch(e)
            | Expr::WithExit(e)
            | Expr::WithValue(e)
            | Expr::WithEnterFn(e) => e.visit_mut(f),
            Expr::Yield(Some(e)) => e.visit_mut(f),
            Expr::IfExp { test, body, orelse } => {
                test.visit_mut(f);
                body.visit_mut(f);
                orelse.visit_mut(f);
            }
            Expr::Lambda { params, body } => {
                for p in params.posonly.iter_mut().chain(params.args.iter_mut()).chain(params.kwonly.iter_mut()) {
                    if let Some(d) = &mut p.default {
                        d.visit_mut(f);
                    }
                }
                body.visit_mut(f);
            }
            Expr::Comprehension { elt, value, generators, .. } => {
                elt.visit_mut(f);
                if let Some(v) = value {
                    v.visit_mut(f);
                }
                for g in generators {
                    g.target.visit_mut(f);
                    g.iter.visit_mut(f);
                    for c in &mut g.ifs {
                        c.visit_mut(f);
                    }
                }
            }
            Expr::FormattedValue { value, spec, .. } => {
                value.visit_mut(f);
                if let Some(s) = spec {
                    s.visit_mut(f);
                }
            }
            Expr::Function(func) => {
                for d in &mut func.defaults {
                    d.visit_mut(f);
                }
                for (_, d) in &mut func.kw_defaults {
                    d.visit_mut(f);
                }
                for (_, d) in &mut func.annotations {
                    d.visit_mut(f);
                }
            }
            _ => {}
        }
        f(self);
    }

    /// True if any sub-expression satisfies `pred`.
    pub fn any(&self, pred: &dyn Fn(&Expr) -> bool) -> bool {
        let mut hit = false;
        self.walk(&mut |e| {
            if !hit && pred(e) {
                hit = true;
            }
        });
        hit
    }
}

fn params_defaults(p: &ParamList) -> impl Iterator<Item = &Expr> {
    p.posonly
        .iter()
        .chain(p.args.iter())
        .chain(p.kwonly.iter())
        .filter_map(|p| p.default.as_ref())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub name: String,
    pub asname: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    pub typ: Option<Expr>,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithItem {
    pub context: Expr,
    pub target: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: ParamList,
    pub body: Vec<Stmt>,
    pub decorators: Vec<Expr>,
    pub returns: Option<Expr>,
    pub is_async: bool,
    /// Index of the code object in the flattened code tree.
    pub code: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub name: String,
    pub bases: Vec<Expr>,
    pub keywords: Vec<Keyword>,
    pub body: Vec<Stmt>,
    pub decorators: Vec<Expr>,
    pub code: usize,
}

/// Reconstructed statements. Each node owns its children; the tree has no sharing.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    FunctionDef(Box<FunctionDef>),
    ClassDef(Box<ClassDef>),
    If { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    While { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    For { target: Expr, iter: Expr, body: Vec<Stmt>, orelse: Vec<Stmt>, is_async: bool },
    Try { body: Vec<Stmt>, handlers: Vec<ExceptHandler>, orelse: Vec<Stmt>, finalbody: Vec<Stmt> },
    With { items: Vec<WithItem>, body: Vec<Stmt>, is_async: bool },
    Assign { targets: Vec<Expr>, value: Expr },
    AugAssign { target: Expr, op: BinOp, value: Expr },
    AnnAssign { target: Expr, annotation: Expr, value: Option<Expr> },
    Return(Option<Expr>),
    Raise { exc: Option<Expr>, cause: Option<Expr> },
    Expr(Expr),
    Pass,
    Break,
    Continue,
    Delete(Vec<Expr>),
    Global(Vec<String>),
    Nonlocal(Vec<String>),
    Assert { test: Expr, msg: Option<Expr> },
    Import(Vec<Alias>),
    ImportFrom { module: String, names: Vec<Alias>, level: u32 },
    /// An instruction that could not be reconstructed.
    Unreconstructed { op: String, line: Option<u32> },
    /// Fallback for control flow that matches no structured pattern.
    RawBlock { label: u32, body: Vec<Stmt> },
    Goto { target: u32, cond: Option<Expr> },
    /// Declaration text supplied by an enrichment collaborator.
    Declaration { name: String, text: String },

    // Translator markers, consumed by the reconstructor.
    WithEnter { context: Expr, target: Option<Expr>, is_async: bool },
    WithExit,
    PopExcept,
    Reraise,
    BindException(String),
    CompAppend { depth: u32, value: Expr, key: Option<Expr> },
}

impl Stmt {
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            Stmt::WithEnter { .. }
                | Stmt::WithExit
                | Stmt::PopExcept
                | Stmt::Reraise
                | Stmt::BindException(_)
                | Stmt::CompAppend { .. }
        )
    }

    /// True when control never falls off the end of this statement.
    pub fn is_terminal(&self) -> bool {
        match self {
            Stmt::Return(_) | Stmt::Raise { .. } | Stmt::Break | Stmt::Continue | Stmt::Reraise => true,
            Stmt::Goto { cond: None, .. } => true,
            Stmt::If { body, orelse, .. } => {
                !orelse.is_empty()
                    && body.last().is_some_and(Stmt::is_terminal)
                    && orelse.last().is_some_and(Stmt::is_terminal)
            }
            _ => false,
        }
    }

    /// Child statement lists, for passes that recurse through the tree.
    pub fn bodies_mut(&mut self) -> Vec<&mut Vec<Stmt>> {
        match self {
            Stmt::FunctionDef(f) => vec![&mut f.body],
            Stmt::ClassDef(c) => vec![&mut c.body],
            Stmt::If { body, orelse, .. } | Stmt::While { body, orelse, .. } | Stmt::For { body, orelse, .. } => {
                vec![body, orelse]
            }
            Stmt::Try { body, handlers, orelse, finalbody } => {
                let mut out = vec![body];
                for h in handlers.iter_mut() {
                    out.push(&mut h.body);
                }
                out.push(orelse);
                out.push(finalbody);
                out
            }
            Stmt::With { body, .. } | Stmt::RawBlock { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }

    pub fn bodies(&self) -> Vec<&Vec<Stmt>> {
        match self {
            Stmt::FunctionDef(f) => vec![&f.body],
            Stmt::ClassDef(c) => vec![&c.body],
            Stmt::If { body, orelse, .. } | Stmt::While { body, orelse, .. } | Stmt::For { body, orelse, .. } => {
                vec![body, orelse]
            }
            Stmt::Try { body, handlers, orelse, finalbody } => {
                let mut out = vec![body];
                for h in handlers {
                    out.push(&h.body);
                }
                out.push(orelse);
                out.push(finalbody);
                out
            }
            Stmt::With { body, .. } | Stmt::RawBlock { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }

    /// Expressions held directly by this statement (not by nested bodies).
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Stmt::FunctionDef(f) => {
                let mut out: Vec<&Expr> = f.decorators.iter().collect();
                out.extend(params_defaults(&f.params));
                out
            }
            Stmt::ClassDef(c) => {
                let mut out: Vec<&Expr> = c.decorators.iter().collect();
                out.extend(c.bases.iter());
                out.extend(c.keywords.iter().map(|k| &k.value));
                out
            }
            Stmt::If { test, .. } | Stmt::While { test, .. } => vec![test],
            Stmt::For { target, iter, .. } => vec![target, iter],
            Stmt::Try { handlers, .. } => handlers.iter().filter_map(|h| h.typ.as_ref()).collect(),
            Stmt::With { items, .. } => {
                let mut out = Vec::new();
                for i in items {
                    out.push(&i.context);
                    if let Some(t) = &i.target {
                        out.push(t);
                    }
                }
                out
            }
            Stmt::Assign { targets, value } => {
                let mut out: Vec<&Expr> = targets.iter().collect();
                out.push(value);
                out
            }
            Stmt::AugAssign { target, value, .. } => vec![target, value],
            Stmt::AnnAssign { target, annotation, value } => {
                let mut out = vec![target, annotation];
                if let Some(v) = value {
                    out.push(v);
                }
                out
            }
            Stmt::Return(Some(e)) | Stmt::Expr(e) => vec![e],
            Stmt::Raise { exc, cause } => exc.iter().chain(cause.iter()).collect(),
            Stmt::Delete(targets) => targets.iter().collect(),
            Stmt::Assert { test, msg } => std::iter::once(test).chain(msg.iter()).collect(),
            Stmt::Goto { cond: Some(c), .. } => vec![c],
            Stmt::WithEnter { context, target, .. } => std::iter::once(context).chain(target.iter()).collect(),
            Stmt::CompAppend { value, key, .. } => std::iter::once(value).chain(key.iter()).collect(),
            _ => Vec::new(),
        }
    }
}

impl Stmt {
    pub fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Stmt::FunctionDef(f) => {
                let FunctionDef { decorators, params, returns, .. } = &mut **f;
                let mut out: Vec<&mut Expr> = decorators.iter_mut().collect();
                for p in params.posonly.iter_mut().chain(params.args.iter_mut()).chain(params.kwonly.iter_mut()) {
                    if let Some(d) = &mut p.default {
                        out.push(d);
                    }
                }
                out.extend(returns.iter_mut());
                out
            }
            Stmt::ClassDef(c) => {
                let ClassDef { decorators, bases, keywords, .. } = &mut **c;
                let mut out: Vec<&mut Expr> = decorators.iter_mut().collect();
                out.extend(bases.iter_mut());
                out.extend(keywords.iter_mut().map(|k| &mut k.value));
                out
            }
            Stmt::If { test, .. } | Stmt::While { test, .. } => vec![test],
            Stmt::For { target, iter, .. } => vec![target, iter],
            Stmt::Try { handlers, .. } => handlers.iter_mut().filter_map(|h| h.typ.as_mut()).collect(),
            Stmt::With { items, .. } => {
                let mut out = Vec::new();
                for i in items {
                    out.push(&mut i.context);
                    if let Some(t) = &mut i.target {
                        out.push(t);
                    }
                }
                out
            }
            Stmt::Assign { targets, value } => {
                let mut out: Vec<&mut Expr> = targets.iter_mut().collect();
                out.push(value);
                out
            }
            Stmt::AugAssign { target, value, .. } => vec![target, value],
            Stmt::AnnAssign { target, annotation, value } => {
                let mut out = vec![target, annotation];
                if let Some(v) = value {
                    out.push(v);
                }
                out
            }
            Stmt::Return(Some(e)) | Stmt::Expr(e) => vec![e],
            Stmt::Raise { exc, cause } => exc.iter_mut().chain(cause.iter_mut()).collect(),
            Stmt::Delete(targets) => targets.iter_mut().collect(),
            Stmt::Assert { test, msg } => std::iter::once(test).chain(msg.iter_mut()).collect(),
            Stmt::Goto { cond: Some(c), .. } => vec![c],
            Stmt::WithEnter { context, target, .. } => std::iter::once(context).chain(target.iter_mut()).collect(),
            Stmt::CompAppend { value, key, .. } => std::iter::once(value).chain(key.iter_mut()).collect(),
            _ => Vec::new(),
        }
    }
}

/// Apply `f` to every statement list in the tree, innermost first.
pub fn visit_bodies_mut(body: &mut Vec<Stmt>, f: &mut dyn FnMut(&mut Vec<Stmt>)) {
    for s in body.iter_mut() {
        for b in s.bodies_mut() {
            visit_bodies_mut(b, f);
        }
    }
    f(body);
}

/// Apply `f` to every expression in the tree, including nested bodies.
pub fn visit_exprs_mut(body: &mut [Stmt], f: &mut dyn FnMut(&mut Expr)) {
    for s in body.iter_mut() {
        for e in s.exprs_mut() {
            e.visit_mut(f);
        }
        for b in s.bodies_mut() {
            visit_exprs_mut(b, f);
        }
    }
}

/// Root of the reconstructed tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub body: Vec<Stmt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_op_args() {
        assert_eq!(BinOp::from_nb(0), Some((BinOp::Add, false)));
        assert_eq!(BinOp::from_nb(10), Some((BinOp::Sub, false)));
        assert_eq!(BinOp::from_nb(13), Some((BinOp::Add, true)));
        assert_eq!(BinOp::from_nb(25), Some((BinOp::BitXor, true)));
        assert_eq!(BinOp::from_nb(26), None);
    }

    #[test]
    fn negation_folds() {
        let x = Expr::name("x");
        assert_eq!(Expr::not(Expr::not(x.clone())), x);
        let is_none = Expr::Compare { left: Box::new(x.clone()), ops: vec![(CmpOp::Is, Expr::none())] };
        assert_eq!(
            Expr::not(is_none),
            Expr::Compare { left: Box::new(x), ops: vec![(CmpOp::IsNot, Expr::none())] }
        );
    }
}
