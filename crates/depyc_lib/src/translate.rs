//! Stack-simulating translator: one basic block of instructions to statements plus the
//! evaluation stack left at its exit.

use std::sync::Arc;

use tracing::trace;

use crate::ast::{
    Alias, BoolOp, ClassDef, CmpOp, Expr, FunctionDef, FunctionValue, Keyword, Param, ParamList, Stmt, UnaryOp,
};
use crate::disasm::{Argval, Instruction};
use crate::error::Diagnostic;
use crate::marshal::{CodeFlags, CodeObject, Value};
use crate::opcodes::Op;
use crate::scope::CodeTree;
use crate::version::PyVersion;

/// How control leaves a translated block.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit {
    Fallthrough,
    Jump(u32),
    /// `keep`: the tested value stays on the stack along the jump (`JUMP_IF_*_OR_POP`).
    Branch { cond: Expr, jump_if_true: bool, target: u32, keep: bool },
    ForIter { target: u32 },
    Return,
    Raise,
}

#[derive(Debug, Clone)]
pub struct BlockOutput {
    pub stmts: Vec<Stmt>,
    pub stack: Vec<Expr>,
    pub exit: Exit,
}

#[derive(Debug, Clone)]
struct UnpackGroup {
    value: Expr,
    targets: Vec<Option<Expr>>,
    star: Option<usize>,
    parent: Option<(usize, usize)>,
}

pub struct Translator<'a> {
    pub code: &'a CodeObject,
    pub version: PyVersion,
    tree: &'a CodeTree,
    node: usize,
    diagnostics: Vec<Diagnostic>,
    groups: Vec<UnpackGroup>,
    kw_names: Option<Vec<String>>,
    stack: Vec<Expr>,
    /// Depth below which the stack is unknown after an untranslatable instruction.
    gap: Option<usize>,
    /// Stack depth of a value just stored and still duplicated on the stack.
    chain: Option<usize>,
    temps: usize,
}

fn poison(ins: &Instruction) -> Expr {
    Expr::Unreconstructed { op: ins.opname.clone(), line: ins.line }
}

fn is_poison(e: &Expr) -> bool {
    e.any(&|x| matches!(x, Expr::Unreconstructed { .. }))
}

/// Values that only exist on the simulated stack and never become statements.
fn is_placeholder(e: &Expr) -> bool {
    e.is_stack_only()
        || matches!(
            e,
            Expr::Iter(_) | Expr::Import { .. } | Expr::ImportFrom { .. } | Expr::Function(_) | Expr::Unreconstructed { .. }
        )
}

fn const_expr(v: &Value) -> Expr {
    Expr::Const(v.clone())
}

fn tuple_items(e: Expr) -> Vec<Expr> {
    match e {
        Expr::Tuple(items) | Expr::List(items) => items,
        Expr::Const(Value::Tuple(vs)) => vs.iter().map(const_expr).collect(),
        other => vec![Expr::Starred(Box::new(other))],
    }
}

fn string_items(e: &Expr) -> Vec<String> {
    match e {
        Expr::Const(Value::Tuple(vs)) => vs.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    }
}

impl<'a> Translator<'a> {
    pub fn new(tree: &'a CodeTree, node: usize, version: PyVersion) -> Translator<'a> {
        Translator {
            code: &tree.nodes[node].code,
            version,
            tree,
            node,
            diagnostics: Vec::new(),
            groups: Vec::new(),
            kw_names: None,
            stack: Vec::new(),
            gap: None,
            chain: None,
            temps: 0,
        }
    }

    /// A synthetic temporary name; renamed by the fixer.
    pub fn fresh_temp(&mut self) -> String {
        let name = format!("$t{}", self.temps);
        self.temps += 1;
        name
    }

    pub fn diagnose(&mut self, d: Diagnostic) {
        self.diagnostics.push(d);
    }

    /// Diagnostics collected so far, without the duplicates repeated translation produces.
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        let mut out: Vec<Diagnostic> = Vec::new();
        for d in self.diagnostics.drain(..) {
            if !out.contains(&d) {
                out.push(d);
            }
        }
        out
    }

    pub fn translate(&mut self, instrs: &[Instruction], stack: Vec<Expr>) -> BlockOutput {
        self.stack = stack;
        self.gap = None;
        self.chain = None;
        let mut out = Vec::new();
        let mut exit = Exit::Fallthrough;
        let mut i = 0;
        while i < instrs.len() {
            if let Some(used) = self.parallel_assign(&instrs[i..], &mut out) {
                i += used;
                continue;
            }
            let ins = &instrs[i];
            trace!(offset = ins.offset, op = %ins.opname, depth = self.stack.len(), "translate");
            if let Some(e) = self.step(ins, &mut out) {
                exit = e;
            }
            i += 1;
        }
        BlockOutput { stmts: out, stack: std::mem::take(&mut self.stack), exit }
    }

    fn pop(&mut self, ins: &Instruction) -> Expr {
        if let Some(g) = self.gap {
            if self.stack.len() <= g {
                self.stack.pop();
                self.gap = Some(self.stack.len());
                return poison(ins);
            }
        }
        self.stack.pop().unwrap_or_else(|| poison(ins))
    }

    fn pop_n(&mut self, n: usize, ins: &Instruction) -> Vec<Expr> {
        let mut out: Vec<Expr> = (0..n).map(|_| self.pop(ins)).collect();
        out.reverse();
        out
    }

    fn push(&mut self, e: Expr) {
        self.stack.push(e);
    }

    /// `n`-th item from the top, 1-based.
    fn peek(&self, n: usize, ins: &Instruction) -> Expr {
        match self.stack.len().checked_sub(n) {
            Some(i) if self.gap.is_none_or(|g| i >= g) => self.stack[i].clone(),
            _ => poison(ins),
        }
    }

    fn emit(&mut self, out: &mut Vec<Stmt>, stmt: Stmt, ins: &Instruction) {
        let poisoned = stmt.exprs().into_iter().any(is_poison);
        if !poisoned && !matches!(stmt, Stmt::Unreconstructed { .. }) {
            out.push(stmt);
            return;
        }
        if let Some(Stmt::Unreconstructed { line, .. }) = out.last() {
            if *line == ins.line {
                return;
            }
        }
        out.push(match stmt {
            s @ Stmt::Unreconstructed { .. } => s,
            _ => Stmt::Unreconstructed { op: ins.opname.clone(), line: ins.line },
        });
    }

    fn unknown(&mut self, ins: &Instruction, out: &mut Vec<Stmt>) {
        if ins.op != Op::VersionSpecific {
            self.diagnostics.push(Diagnostic::UnknownOpcode {
                scope: self.code.qualname.clone(),
                opname: ins.opname.clone(),
                offset: ins.offset,
            });
        }
        let depth = self.stack.len();
        self.gap = Some(self.gap.map_or(depth, |g| g.min(depth)));
        self.emit(out, Stmt::Unreconstructed { op: ins.opname.clone(), line: ins.line }, ins);
    }

    fn const_at(&self, ins: &Instruction) -> Value {
        match ins.argval {
            Argval::Const(i) => self.code.consts.get(i).cloned().unwrap_or(Value::None),
            _ => Value::None,
        }
    }

    fn name(ins: &Instruction) -> String {
        ins.name_arg().unwrap_or("_").to_string()
    }

    fn step(&mut self, ins: &Instruction, out: &mut Vec<Stmt>) -> Option<Exit> {
        let chain = self.chain.take();
        let v = self.version;
        match ins.op {
            op if op.is_bookkeeping() => {}
            Op::PopBlock | Op::SetupFinally | Op::SetupAsyncWith => {}

            Op::PopTop => {
                let value = self.pop(ins);
                self.discard(value, ins, out);
            }
            Op::PushNull | Op::LoadLocals => self.push(Expr::Null),
            Op::RotTwo => self.rotate(2),
            Op::RotThree => self.rotate(3),
            Op::RotFour => self.rotate(4),
            Op::RotN => self.rotate(ins.arg as usize),
            Op::DupTop => {
                let top = self.peek(1, ins);
                self.push(top);
            }
            Op::DupTopTwo => {
                let a = self.peek(2, ins);
                let b = self.peek(1, ins);
                self.push(a);
                self.push(b);
            }
            Op::Copy => {
                let e = self.peek(ins.arg as usize, ins);
                self.push(e);
            }
            Op::Swap => {
                let n = ins.arg as usize;
                let len = self.stack.len();
                if n >= 2 && n <= len {
                    self.stack.swap(len - 1, len - n);
                }
            }

            Op::LoadConst => {
                let c = self.const_at(ins);
                self.push(Expr::Const(c));
            }
            Op::LoadSmallInt => self.push(Expr::Const(Value::Int(ins.arg as i64))),
            Op::LoadCommonConstant => {
                let name = match ins.arg {
                    0 => "AssertionError",
                    1 => "NotImplementedError",
                    2 => "tuple",
                    3 => "all",
                    _ => "any",
                };
                self.push(Expr::name(name));
            }
            Op::LoadAssertionError => self.push(Expr::name("AssertionError")),
            Op::LoadBuildClass => self.push(Expr::BuildClass),
            Op::LoadName | Op::LoadFast | Op::LoadDeref | Op::LoadClosure => self.push(Expr::name(Self::name(ins))),
            Op::LoadFromDictOrDeref | Op::LoadFromDictOrGlobals => {
                self.pop(ins);
                self.push(Expr::name(Self::name(ins)));
            }
            Op::LoadFastAndClear => self.push(Expr::SavedLocal(Self::name(ins))),
            Op::LoadFastLoadFast => {
                if let Argval::NamePair(a, b) = &ins.argval {
                    self.push(Expr::name(a.clone()));
                    self.push(Expr::name(b.clone()));
                }
            }
            Op::LoadGlobal => {
                let g = Expr::name(Self::name(ins));
                self.push_maybe_null(g, ins);
            }
            Op::LoadAttr | Op::LoadMethod => {
                let obj = self.pop(ins);
                let attr = Expr::attr(obj, Self::name(ins));
                if ins.op == Op::LoadMethod {
                    self.push(Expr::Null);
                    self.push(attr);
                } else {
                    self.push_maybe_null(attr, ins);
                }
            }
            Op::LoadSuperAttr => {
                let slf = self.pop(ins);
                let cls = self.pop(ins);
                let sup = self.pop(ins);
                // Bit 1 marks the explicit two-argument form.
                let args = if ins.arg & 2 != 0 { vec![cls, slf] } else { Vec::new() };
                let attr = Expr::attr(Expr::call(sup, args), Self::name(ins));
                self.push_maybe_null(attr, ins);
            }
            Op::LoadSpecial => {
                let obj = self.pop(ins);
                let f = match ins.arg {
                    1 | 3 => Expr::WithExit(Box::new(obj)),
                    _ => Expr::WithEnterFn(Box::new(obj)),
                };
                self.push(f);
                self.push(Expr::Null);
            }

            Op::StoreName | Op::StoreFast | Op::StoreGlobal | Op::StoreDeref => {
                let value = self.pop(ins);
                self.store(Expr::name(Self::name(ins)), value, chain, ins, out);
            }
            Op::StoreFastLoadFast => {
                if let Argval::NamePair(a, b) = ins.argval.clone() {
                    let value = self.pop(ins);
                    self.store(Expr::name(a), value, chain, ins, out);
                    self.push(Expr::name(b));
                }
            }
            Op::StoreFastStoreFast => {
                if let Argval::NamePair(a, b) = ins.argval.clone() {
                    let first = self.pop(ins);
                    self.store(Expr::name(a), first, None, ins, out);
                    let second = self.pop(ins);
                    self.store(Expr::name(b), second, None, ins, out);
                }
            }
            Op::StoreAttr => {
                let obj = self.pop(ins);
                let value = self.pop(ins);
                self.store(Expr::attr(obj, Self::name(ins)), value, chain, ins, out);
            }
            Op::StoreSubscr => {
                let key = self.pop(ins);
                let obj = self.pop(ins);
                let value = self.pop(ins);
                let target = Expr::Subscript { value: Box::new(obj), slice: Box::new(key) };
                self.store(target, value, chain, ins, out);
            }
            Op::StoreSlice => {
                let upper = self.pop(ins);
                let lower = self.pop(ins);
                let obj = self.pop(ins);
                let value = self.pop(ins);
                let target = Expr::Subscript { value: Box::new(obj), slice: Box::new(slice_of(lower, upper, None)) };
                self.store(target, value, chain, ins, out);
            }
            Op::DeleteName | Op::DeleteFast | Op::DeleteGlobal | Op::DeleteDeref => {
                self.emit(out, Stmt::Delete(vec![Expr::name(Self::name(ins))]), ins);
            }
            Op::DeleteAttr => {
                let obj = self.pop(ins);
                self.emit(out, Stmt::Delete(vec![Expr::attr(obj, Self::name(ins))]), ins);
            }
            Op::DeleteSubscr => {
                let key = self.pop(ins);
                let obj = self.pop(ins);
                let target = Expr::Subscript { value: Box::new(obj), slice: Box::new(key) };
                self.emit(out, Stmt::Delete(vec![target]), ins);
            }

            Op::UnaryPositive | Op::UnaryNegative | Op::UnaryInvert => {
                let operand = self.pop(ins);
                let op = match ins.op {
                    Op::UnaryPositive => UnaryOp::Pos,
                    Op::UnaryNegative => UnaryOp::Neg,
                    _ => UnaryOp::Invert,
                };
                self.push(Expr::UnaryOp { op, operand: Box::new(operand) });
            }
            Op::UnaryNot => {
                let operand = self.pop(ins);
                self.push(Expr::not(operand));
            }
            Op::ToBool => {}
            Op::BinaryOp => {
                let right = self.pop(ins);
                let left = self.pop(ins);
                let e = match ins.argval {
                    Argval::Subscr => Expr::Subscript { value: Box::new(left), slice: Box::new(right) },
                    Argval::Binary(op, true) => Expr::Inplace { left: Box::new(left), op, right: Box::new(right) },
                    Argval::Binary(op, false) => Expr::BinOp { left: Box::new(left), op, right: Box::new(right) },
                    _ => poison(ins),
                };
                self.push(e);
            }
            Op::Binary(op) => {
                let right = self.pop(ins);
                let left = self.pop(ins);
                self.push(Expr::BinOp { left: Box::new(left), op, right: Box::new(right) });
            }
            Op::Inplace(op) => {
                let right = self.pop(ins);
                let left = self.pop(ins);
                self.push(Expr::Inplace { left: Box::new(left), op, right: Box::new(right) });
            }
            Op::BinarySubscr => {
                let key = self.pop(ins);
                let obj = self.pop(ins);
                self.push(Expr::Subscript { value: Box::new(obj), slice: Box::new(key) });
            }
            Op::BinarySlice => {
                let upper = self.pop(ins);
                let lower = self.pop(ins);
                let obj = self.pop(ins);
                self.push(Expr::Subscript { value: Box::new(obj), slice: Box::new(slice_of(lower, upper, None)) });
            }
            Op::BuildSlice => {
                let step = if ins.arg == 3 { Some(self.pop(ins)) } else { None };
                let upper = self.pop(ins);
                let lower = self.pop(ins);
                self.push(slice_of(lower, upper, step));
            }
            Op::CompareOp | Op::IsOp | Op::ContainsOp => {
                let right = self.pop(ins);
                let left = self.pop(ins);
                let op = match ins.argval {
                    Argval::Compare(c) => c,
                    _ => CmpOp::Eq,
                };
                self.push(Expr::Compare { left: Box::new(left), ops: vec![(op, right)] });
            }

            Op::BuildTuple => {
                let items = self.pop_n(ins.arg as usize, ins);
                self.push(Expr::Tuple(items));
            }
            Op::BuildList => {
                let items = self.pop_n(ins.arg as usize, ins);
                self.push(Expr::List(items));
            }
            Op::BuildSet => {
                let items = self.pop_n(ins.arg as usize, ins);
                self.push(Expr::Set(items));
            }
            Op::BuildMap => {
                let flat = self.pop_n(ins.arg as usize * 2, ins);
                let mut entries = Vec::new();
                let mut it = flat.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    entries.push((Some(k), v));
                }
                self.push(Expr::Dict(entries));
            }
            Op::BuildConstKeyMap => {
                let keys = self.pop(ins);
                let values = self.pop_n(ins.arg as usize, ins);
                let keys: Vec<Expr> = match keys {
                    Expr::Const(Value::Tuple(ks)) => ks.iter().map(const_expr).collect(),
                    Expr::Tuple(ks) => ks,
                    _ => vec![poison(ins); values.len()],
                };
                self.push(Expr::Dict(keys.into_iter().map(Some).zip(values).collect()));
            }
            Op::BuildString => {
                let parts = self.pop_n(ins.arg as usize, ins);
                let mut flat = Vec::new();
                for p in parts {
                    match p {
                        Expr::JoinedStr(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                self.push(Expr::JoinedStr(flat));
            }
            Op::ListToTuple => {
                let list = self.pop(ins);
                self.push(match list {
                    Expr::List(items) => Expr::Tuple(items),
                    other => Expr::call(Expr::name("tuple"), vec![other]),
                });
            }
            Op::ListExtend | Op::SetUpdate => {
                let iterable = self.pop(ins);
                let at = self.stack.len().checked_sub(ins.arg as usize);
                if let Some(Expr::List(items) | Expr::Set(items)) = at.and_then(|i| self.stack.get_mut(i)) {
                    match iterable {
                        Expr::Const(Value::Tuple(vs) | Value::FrozenSet(vs)) => items.extend(vs.iter().map(const_expr)),
                        other => items.push(Expr::Starred(Box::new(other))),
                    }
                } else {
                    self.unknown(ins, out);
                }
            }
            Op::DictUpdate | Op::DictMerge => {
                let mapping = self.pop(ins);
                let at = self.stack.len().checked_sub(ins.arg as usize);
                if let Some(Expr::Dict(entries)) = at.and_then(|i| self.stack.get_mut(i)) {
                    match mapping {
                        Expr::Dict(more) => entries.extend(more),
                        other => entries.push((None, other)),
                    }
                } else {
                    self.unknown(ins, out);
                }
            }
            Op::ListAppend | Op::SetAdd | Op::MapAdd => {
                let (key, value) = if ins.op == Op::MapAdd {
                    let value = self.pop(ins);
                    (Some(self.pop(ins)), value)
                } else {
                    (None, self.pop(ins))
                };
                let depth = ins.arg;
                let at = self.stack.len().checked_sub(depth as usize);
                match (at.and_then(|i| self.stack.get_mut(i)), key) {
                    (Some(Expr::List(items) | Expr::Set(items)), None) if depth == 1 => items.push(value),
                    (_, key) => self.emit(out, Stmt::CompAppend { depth, value, key }, ins),
                }
            }
            Op::FormatValue => {
                let spec = if ins.arg & 0x04 != 0 { Some(Box::new(self.pop(ins))) } else { None };
                let value = self.pop(ins);
                let conversion = match ins.arg & 0x03 {
                    1 => Some('s'),
                    2 => Some('r'),
                    3 => Some('a'),
                    _ => None,
                };
                self.push(Expr::FormattedValue { value: Box::new(value), conversion, spec });
            }
            Op::ConvertValue => {
                let value = self.pop(ins);
                let conversion = match ins.arg {
                    1 => Some('s'),
                    2 => Some('r'),
                    3 => Some('a'),
                    _ => None,
                };
                self.push(Expr::FormattedValue { value: Box::new(value), conversion, spec: None });
            }
            Op::FormatSimple => {
                let value = self.pop(ins);
                self.push(match value {
                    fv @ Expr::FormattedValue { .. } => fv,
                    other => Expr::FormattedValue { value: Box::new(other), conversion: None, spec: None },
                });
            }
            Op::FormatWithSpec => {
                let spec = self.pop(ins);
                let value = self.pop(ins);
                self.push(match value {
                    Expr::FormattedValue { value, conversion, spec: None } => {
                        Expr::FormattedValue { value, conversion, spec: Some(Box::new(spec)) }
                    }
                    other => Expr::FormattedValue { value: Box::new(other), conversion: None, spec: Some(Box::new(spec)) },
                });
            }
            Op::UnpackSequence => {
                let value = self.pop(ins);
                self.unpack(value, ins.arg as usize, None);
            }
            Op::UnpackEx => {
                let value = self.pop(ins);
                let before = (ins.arg & 0xff) as usize;
                let after = (ins.arg >> 8) as usize;
                self.unpack(value, before + 1 + after, Some(before));
            }

            Op::KwNames => {
                self.kw_names = Some(string_items(&Expr::Const(self.const_at(ins))));
            }
            Op::Call | Op::CallMethod => {
                let kwnames = self.kw_names.take().unwrap_or_default();
                self.call(ins, ins.arg as usize, kwnames, true, out);
            }
            Op::CallKw => {
                let names = self.pop(ins);
                self.call(ins, ins.arg as usize, string_items(&names), true, out);
            }
            Op::CallFunction => self.call(ins, ins.arg as usize, Vec::new(), false, out),
            Op::CallFunctionKw => {
                let names = self.pop(ins);
                self.call(ins, ins.arg as usize, string_items(&names), false, out);
            }
            Op::CallFunctionEx => {
                let kwargs = if ins.arg & 1 != 0 || v >= PyVersion::V3_14 { Some(self.pop(ins)) } else { None };
                let args = self.pop(ins);
                let mut func = self.pop(ins);
                if matches!(func, Expr::Null) {
                    func = self.pop(ins);
                } else if v >= PyVersion::V3_11 && matches!(self.stack.last(), Some(Expr::Null)) {
                    self.stack.pop();
                }
                let args = tuple_items(args);
                let mut keywords = Vec::new();
                if let Some(kw) = kwargs {
                    match kw {
                        Expr::Null => {}
                        Expr::Dict(entries) => {
                            for (k, value) in entries {
                                let arg = match k {
                                    Some(Expr::Const(Value::Str(s))) => Some(s),
                                    _ => None,
                                };
                                keywords.push(Keyword { arg, value });
                            }
                        }
                        other => keywords.push(Keyword { arg: None, value: other }),
                    }
                }
                self.push(Expr::Call { func: Box::new(func), args, keywords });
            }
            Op::CallIntrinsic1 => {
                let value = self.pop(ins);
                match ins.arg {
                    1 => {
                        self.emit(out, Stmt::Expr(value), ins);
                        self.push(Expr::Null);
                    }
                    2 => {
                        if let Expr::Import { module, level, .. } = value {
                            let names = vec![Alias { name: "*".into(), asname: None }];
                            self.emit(out, Stmt::ImportFrom { module, names, level }, ins);
                        }
                        self.push(Expr::Null);
                    }
                    3 | 4 => self.push(value),
                    5 => self.push(Expr::UnaryOp { op: UnaryOp::Pos, operand: Box::new(value) }),
                    6 => self.push(match value {
                        Expr::List(items) => Expr::Tuple(items),
                        other => Expr::call(Expr::name("tuple"), vec![other]),
                    }),
                    _ => {
                        self.push(value);
                        self.unknown(ins, out);
                    }
                }
            }
            Op::CallIntrinsic2 => self.unknown(ins, out),
            Op::MakeFunction => self.make_function(ins),
            Op::SetFunctionAttribute => {
                let func = self.pop(ins);
                let value = self.pop(ins);
                match func {
                    Expr::Function(mut fv) => {
                        match ins.arg {
                            0x01 => fv.defaults = tuple_items(value),
                            0x02 => fv.kw_defaults = kw_defaults_of(value),
                            0x04 => fv.annotations = annotations_of(value),
                            0x08 => fv.has_closure = true,
                            _ => {}
                        }
                        self.push(Expr::Function(fv));
                    }
                    other => self.push(other),
                }
            }

            Op::ReturnValue => {
                let value = self.pop(ins);
                self.emit(out, Stmt::Return(Some(value)), ins);
                return Some(Exit::Return);
            }
            Op::ReturnConst => {
                let c = self.const_at(ins);
                self.emit(out, Stmt::Return(Some(Expr::Const(c))), ins);
                return Some(Exit::Return);
            }
            Op::ReturnGenerator => self.push(Expr::Null),
            Op::YieldValue => {
                let value = self.pop(ins);
                let y = if value.is_none_const() { Expr::Yield(None) } else { Expr::Yield(Some(Box::new(value))) };
                self.push(y);
            }
            Op::YieldFrom => {
                self.pop(ins);
                let source = self.pop(ins);
                self.push(match source {
                    Expr::Iter(x) => Expr::YieldFrom(x),
                    other => other,
                });
            }
            Op::GetYieldFromIter => {
                let x = self.pop(ins);
                self.push(match x {
                    Expr::Await(_) | Expr::YieldFrom(_) => x,
                    other => Expr::YieldFrom(Box::new(other)),
                });
            }
            Op::GetAwaitable => {
                let x = self.pop(ins);
                self.push(match x {
                    Expr::Null | Expr::ForItem | Expr::Await(_) => x,
                    other => Expr::Await(Box::new(other)),
                });
            }
            Op::Send | Op::EndSend | Op::CleanupThrow => {}
            Op::GetAiter | Op::GetIter => {
                let x = self.pop(ins);
                self.push(match x {
                    Expr::Iter(_) => x,
                    other => Expr::Iter(Box::new(other)),
                });
            }
            Op::GetAnext => self.push(Expr::ForItem),
            Op::EndAsyncFor => {}
            Op::RaiseVarargs => {
                let (exc, cause) = match ins.arg {
                    0 => (None, None),
                    1 => (Some(self.pop(ins)), None),
                    _ => {
                        let cause = self.pop(ins);
                        (Some(self.pop(ins)), Some(cause))
                    }
                };
                self.emit(out, Stmt::Raise { exc, cause }, ins);
                return Some(Exit::Raise);
            }
            Op::Reraise => {
                out.push(Stmt::Reraise);
                return Some(Exit::Raise);
            }

            Op::JumpForward | Op::JumpBackward | Op::JumpBackwardNoInterrupt | Op::JumpAbsolute => {
                return ins.target().map(Exit::Jump);
            }
            Op::PopJumpIfFalse | Op::PopJumpIfTrue => {
                let cond = self.pop(ins);
                let target = ins.target()?;
                return Some(Exit::Branch { cond, jump_if_true: ins.op == Op::PopJumpIfTrue, target, keep: false });
            }
            Op::PopJumpIfNone | Op::PopJumpIfNotNone => {
                let value = self.pop(ins);
                let op = if ins.op == Op::PopJumpIfNone { CmpOp::Is } else { CmpOp::IsNot };
                let cond = Expr::Compare { left: Box::new(value), ops: vec![(op, Expr::none())] };
                let target = ins.target()?;
                return Some(Exit::Branch { cond, jump_if_true: true, target, keep: false });
            }
            Op::JumpIfFalseOrPop | Op::JumpIfTrueOrPop => {
                let cond = self.pop(ins);
                let target = ins.target()?;
                return Some(Exit::Branch { cond, jump_if_true: ins.op == Op::JumpIfTrueOrPop, target, keep: true });
            }
            Op::JumpIfNotExcMatch => {
                let typ = self.pop(ins);
                self.pop(ins);
                let target = ins.target()?;
                return Some(Exit::Branch {
                    cond: Expr::ExcMatch(Box::new(typ)),
                    jump_if_true: false,
                    target,
                    keep: false,
                });
            }
            Op::ForIter => return ins.target().map(|target| Exit::ForIter { target }),
            // Loop exits are unwound by the reconstructor.
            Op::EndFor | Op::PopIter => {}

            Op::SetupWith | Op::BeforeWith | Op::BeforeAsyncWith => {
                let ctx = self.pop(ins);
                self.push(Expr::WithExit(Box::new(ctx.clone())));
                self.push(Expr::WithValue(Box::new(ctx)));
            }
            Op::WithExceptStart => self.push(Expr::Null),
            Op::PushExcInfo => self.push(Expr::Exception),
            Op::PopExcept => {
                let limit = if v == PyVersion::V3_10 { 3 } else { 1 };
                for _ in 0..limit {
                    if matches!(self.stack.last(), Some(Expr::Exception)) {
                        self.stack.pop();
                    }
                }
                out.push(Stmt::PopExcept);
            }
            Op::CheckExcMatch => {
                let typ = self.pop(ins);
                self.push(Expr::ExcMatch(Box::new(typ)));
            }
            Op::CheckEgMatch => {
                self.pop(ins);
                self.unknown(ins, out);
                self.push(poison(ins));
            }

            Op::ImportName => {
                let fromlist = self.pop(ins);
                let level = self.pop(ins);
                let level = match level {
                    Expr::Const(Value::Int(l)) => l.max(0) as u32,
                    _ => 0,
                };
                let fromlist = match fromlist {
                    Expr::Const(Value::Tuple(_)) => Some(string_items(&fromlist)),
                    _ => None,
                };
                self.push(Expr::Import { module: Self::name(ins), fromlist, level });
            }
            Op::ImportFrom => {
                let source = self.peek(1, ins);
                match source {
                    Expr::Import { module, fromlist: Some(_), level } => {
                        self.push(Expr::ImportFrom { module, name: Self::name(ins), level })
                    }
                    // `import a.b as c` walks the submodule chain.
                    imp @ Expr::Import { fromlist: None, .. } => self.push(imp),
                    other => self.push(Expr::attr(other, Self::name(ins))),
                }
            }
            Op::ImportStar => {
                if let Expr::Import { module, level, .. } = self.pop(ins) {
                    let names = vec![Alias { name: "*".into(), asname: None }];
                    self.emit(out, Stmt::ImportFrom { module, names, level }, ins);
                }
            }
            Op::PrintExpr => {
                let value = self.pop(ins);
                self.emit(out, Stmt::Expr(value), ins);
            }

            Op::VersionSpecific => self.unknown(ins, out),
            _ => self.unknown(ins, out),
        }
        None
    }

    fn push_maybe_null(&mut self, value: Expr, ins: &Instruction) {
        if !ins.pushes_null(self.version) {
            self.push(value);
        } else if self.version >= PyVersion::V3_13 {
            self.push(value);
            self.push(Expr::Null);
        } else {
            self.push(Expr::Null);
            self.push(value);
        }
    }

    /// `ROT_n`: top of stack moves down to position `n`.
    fn rotate(&mut self, n: usize) {
        let len = self.stack.len();
        if n >= 2 && n <= len {
            let top = self.stack.remove(len - 1);
            self.stack.insert(len - n, top);
        }
    }

    fn discard(&mut self, value: Expr, ins: &Instruction, out: &mut Vec<Stmt>) {
        match value {
            Expr::WithValue(ctx) => {
                self.emit(out, Stmt::WithEnter { context: *ctx, target: None, is_async: false }, ins);
            }
            Expr::Await(inner) if matches!(*inner, Expr::WithValue(_)) => {
                if let Expr::WithValue(ctx) = *inner {
                    self.emit(out, Stmt::WithEnter { context: *ctx, target: None, is_async: true }, ins);
                }
            }
            Expr::Unreconstructed { .. } => self.emit(out, Stmt::Expr(value), ins),
            e if is_placeholder(&e) => {}
            e => self.emit(out, Stmt::Expr(e), ins),
        }
    }

    fn unpack(&mut self, value: Expr, n: usize, star: Option<usize>) {
        let parent = match &value {
            Expr::UnpackSlot { group, index } => Some((*group, *index)),
            _ => None,
        };
        let group = self.groups.len();
        self.groups.push(UnpackGroup { value, targets: vec![None; n], star, parent });
        for index in (0..n).rev() {
            self.push(Expr::UnpackSlot { group, index });
        }
    }

    /// Record `target` into an unpack group; returns the finished assignment if complete.
    fn fill_slot(&mut self, group: usize, index: usize, target: Expr) -> Option<Stmt> {
        let g = self.groups.get_mut(group)?;
        let target = if g.star == Some(index) { Expr::Starred(Box::new(target)) } else { target };
        *g.targets.get_mut(index)? = Some(target);
        if g.targets.iter().any(Option::is_none) {
            return None;
        }
        let tuple = Expr::Tuple(g.targets.iter().flatten().cloned().collect());
        let parent = g.parent;
        let value = g.value.clone();
        match parent {
            Some((pg, pi)) => self.fill_slot(pg, pi, tuple),
            None => Some(Stmt::Assign { targets: vec![tuple], value }),
        }
    }

    fn store(&mut self, target: Expr, value: Expr, chain: Option<usize>, ins: &Instruction, out: &mut Vec<Stmt>) {
        if let Some(slot) = chain {
            if slot == self.stack.len() + 1 {
                if let Some(Stmt::Assign { targets, value: prev }) = out.last_mut() {
                    if *prev == value {
                        targets.push(target);
                        self.arm_chain(&value);
                        return;
                    }
                }
            }
        }
        let stmt = match value {
            Expr::SavedLocal(_) | Expr::Null => return,
            Expr::UnpackSlot { group, index } => match self.fill_slot(group, index, target) {
                Some(s) => s,
                None => return,
            },
            Expr::Exception => match target {
                Expr::Name(n) => Stmt::BindException(n),
                _ => return,
            },
            Expr::WithValue(ctx) => Stmt::WithEnter { context: *ctx, target: Some(target), is_async: false },
            Expr::Await(inner) if matches!(*inner, Expr::WithValue(_)) => match *inner {
                Expr::WithValue(ctx) => Stmt::WithEnter { context: *ctx, target: Some(target), is_async: true },
                other => Stmt::Assign { targets: vec![target], value: Expr::Await(Box::new(other)) },
            },
            Expr::Import { module, fromlist: None, level } => {
                let first = module.split('.').next().unwrap_or(&module).to_string();
                let asname = match &target {
                    Expr::Name(n) if *n == first => None,
                    Expr::Name(n) => Some(n.clone()),
                    _ => None,
                };
                if level > 0 {
                    Stmt::ImportFrom { module: String::new(), names: vec![Alias { name: module, asname }], level }
                } else {
                    Stmt::Import(vec![Alias { name: module, asname }])
                }
            }
            Expr::ImportFrom { module, name, level } => {
                let asname = match &target {
                    Expr::Name(n) if *n == name => None,
                    Expr::Name(n) => Some(n.clone()),
                    _ => None,
                };
                Stmt::ImportFrom { module, names: vec![Alias { name, asname }], level }
            }
            Expr::Inplace { left, op, right } => {
                if *left == target {
                    Stmt::AugAssign { target, op, value: *right }
                } else {
                    Stmt::Assign { targets: vec![target], value: Expr::BinOp { left, op, right } }
                }
            }
            value => match self.definition(&target, value) {
                Ok(def) => def,
                Err(value) => {
                    let stmt = Stmt::Assign { targets: vec![target], value: value.clone() };
                    self.emit(out, stmt, ins);
                    self.arm_chain(&value);
                    return;
                }
            },
        };
        self.emit(out, stmt, ins);
    }

    fn arm_chain(&mut self, value: &Expr) {
        if self.stack.last() == Some(value) {
            self.chain = Some(self.stack.len());
        }
    }

    /// `def`/`class` statements: a function value or class build, possibly decorated,
    /// stored under its own name.
    fn definition(&self, target: &Expr, value: Expr) -> Result<Stmt, Expr> {
        let Expr::Name(name) = target else { return Err(value) };
        let mut decorators = Vec::new();
        let mut cur = &value;
        loop {
            match cur {
                Expr::Call { func, args, keywords } if args.len() == 1 && keywords.is_empty() => {
                    if matches!(**func, Expr::BuildClass) {
                        break;
                    }
                    decorators.push((**func).clone());
                    cur = &args[0];
                }
                _ => break,
            }
        }
        match cur {
            Expr::Function(fv) if fv.name == *name && !self.is_anonymous(fv.code) => {
                let code = &self.tree.nodes[fv.code].code;
                Ok(Stmt::FunctionDef(Box::new(FunctionDef {
                    name: name.clone(),
                    params: params_for(code, fv),
                    body: Vec::new(),
                    decorators,
                    returns: fv.annotations.iter().find(|(n, _)| n == "return").map(|(_, e)| e.clone()),
                    is_async: code.flags.has(CodeFlags::COROUTINE) || code.flags.has(CodeFlags::ASYNC_GENERATOR),
                    code: fv.code,
                })))
            }
            Expr::Call { func, args, keywords } if matches!(**func, Expr::BuildClass) => {
                let (Some(Expr::Function(fv)), Some(Expr::Const(Value::Str(cls)))) = (args.first(), args.get(1)) else {
                    return Err(value);
                };
                if cls != name {
                    return Err(value);
                }
                Ok(Stmt::ClassDef(Box::new(ClassDef {
                    name: name.clone(),
                    bases: args[2..].to_vec(),
                    keywords: keywords.clone(),
                    body: Vec::new(),
                    decorators,
                    code: fv.code,
                })))
            }
            _ => Err(value),
        }
    }

    fn is_anonymous(&self, node: usize) -> bool {
        let code = &self.tree.nodes[node].code;
        code.is_lambda() || code.is_comprehension()
    }

    fn call(&mut self, ins: &Instruction, argc: usize, kwnames: Vec<String>, two_slots: bool, out: &mut Vec<Stmt>) {
        let mut args = self.pop_n(argc, ins);
        let func = if two_slots {
            let b = self.pop(ins);
            let a = self.pop(ins);
            match (a, b) {
                (Expr::Null, f) | (f, Expr::Null) => f,
                (f, slf) => {
                    args.insert(0, slf);
                    f
                }
            }
        } else {
            self.pop(ins)
        };
        if matches!(func, Expr::WithExit(_)) {
            // A value carried under the exit call is a return leaving from inside the block.
            let carried = self.stack.last().is_some_and(|e| !is_placeholder(e));
            if !carried {
                out.push(Stmt::WithExit);
            }
            self.push(Expr::Null);
            return;
        }
        if let Expr::WithEnterFn(ctx) = func {
            self.push(Expr::WithValue(ctx));
            return;
        }
        let split = args.len().saturating_sub(kwnames.len());
        let kwvalues = args.split_off(split);
        let keywords =
            kwnames.into_iter().zip(kwvalues).map(|(arg, value)| Keyword { arg: Some(arg), value }).collect();
        self.push(Expr::Call { func: Box::new(func), args, keywords });
    }

    fn make_function(&mut self, ins: &Instruction) {
        let flags = if self.version >= PyVersion::V3_13 { 0 } else { ins.arg };
        if self.version == PyVersion::V3_10 {
            self.pop(ins);
        }
        let code = self.pop(ins);
        let mut fv = match self.function_value(&code) {
            Some(fv) => fv,
            None => {
                self.push(poison(ins));
                return;
            }
        };
        if flags & 0x08 != 0 {
            self.pop(ins);
            fv.has_closure = true;
        }
        if flags & 0x04 != 0 {
            let a = self.pop(ins);
            fv.annotations = annotations_of(a);
        }
        if flags & 0x02 != 0 {
            let k = self.pop(ins);
            fv.kw_defaults = kw_defaults_of(k);
        }
        if flags & 0x01 != 0 {
            let d = self.pop(ins);
            fv.defaults = tuple_items(d);
        }
        self.push(Expr::Function(Box::new(fv)));
    }

    fn function_value(&self, code: &Expr) -> Option<FunctionValue> {
        let Expr::Const(Value::Code(c)) = code else { return None };
        let node = self.tree.nodes[self.node].children.iter().copied().find(|&ch| Arc::ptr_eq(&self.tree.nodes[ch].code, c))?;
        Some(FunctionValue {
            code: node,
            name: c.name.clone(),
            defaults: Vec::new(),
            kw_defaults: Vec::new(),
            annotations: Vec::new(),
            has_closure: false,
        })
    }

    /// `a, b = b, a`: a rotation directly followed by as many plain stores, or (3.11+, where
    /// the rotation is folded into the store order) a store run whose deeper values read a
    /// name an earlier store of the run overwrites.
    fn parallel_assign(&mut self, rest: &[Instruction], out: &mut Vec<Stmt>) -> Option<usize> {
        let mut depth = 0usize;
        let mut j = 0;
        while let Some(ins) = rest.get(j) {
            let d = match ins.op {
                Op::RotTwo => 2,
                Op::RotThree => 3,
                Op::RotFour => 4,
                Op::RotN | Op::Swap => ins.arg as usize,
                _ => break,
            };
            depth = depth.max(d);
            j += 1;
        }
        if depth < 2 {
            return self.stale_stores(rest, out);
        }
        let (targets, k) = store_run(rest, j, depth)?;
        if targets.len() != depth || self.stack.len() < depth {
            return None;
        }
        let from = self.stack.len() - depth;
        if self.gap.is_some_and(|g| from < g) || self.stack[from..].iter().any(is_placeholder) {
            return None;
        }
        let values = self.stack.split_off(from);
        let ins = &rest[k - 1];
        self.emit(out, Stmt::Assign { targets: vec![Expr::Tuple(targets)], value: Expr::Tuple(values) }, ins);
        Some(k)
    }

    fn stale_stores(&mut self, rest: &[Instruction], out: &mut Vec<Stmt>) -> Option<usize> {
        let (mut targets, k) = store_run(rest, 0, self.stack.len())?;
        let n = targets.len();
        if n < 2 || self.stack.len() < n {
            return None;
        }
        let from = self.stack.len() - n;
        if self.gap.is_some_and(|g| from < g) || self.stack[from..].iter().any(is_placeholder) {
            return None;
        }
        // The i-th store pops `popped(i)`.
        let popped = |i: usize| &self.stack[self.stack.len() - 1 - i];
        let stale = (0..n).any(|i| {
            let Expr::Name(stored) = &targets[i] else { return false };
            (i + 1..n).any(|j| {
                popped(j) != popped(i) && popped(j).any(&|e| matches!(e, Expr::Name(x) if x == stored))
            })
        });
        if !stale {
            return None;
        }
        let values = self.stack.split_off(from);
        targets.reverse();
        let ins = &rest[k - 1];
        self.emit(out, Stmt::Assign { targets: vec![Expr::Tuple(targets)], value: Expr::Tuple(values) }, ins);
        Some(k)
    }
}

/// Plain name stores from `rest[from..]`, at most `limit` targets, and the index after them.
fn store_run(rest: &[Instruction], from: usize, limit: usize) -> Option<(Vec<Expr>, usize)> {
    let mut targets = Vec::new();
    let mut k = from;
    while targets.len() < limit {
        let Some(ins) = rest.get(k) else { break };
        match (&ins.op, &ins.argval) {
            (Op::StoreName | Op::StoreFast | Op::StoreGlobal | Op::StoreDeref, Argval::Name(n)) => {
                targets.push(Expr::name(n.clone()))
            }
            (Op::StoreFastStoreFast, Argval::NamePair(a, b)) if targets.len() + 2 <= limit => {
                targets.push(Expr::name(a.clone()));
                targets.push(Expr::name(b.clone()));
            }
            _ => break,
        }
        k += 1;
    }
    Some((targets, k))
}

fn slice_of(lower: Expr, upper: Expr, step: Option<Expr>) -> Expr {
    let opt = |e: Expr| if e.is_none_const() { None } else { Some(Box::new(e)) };
    Expr::Slice { lower: opt(lower), upper: opt(upper), step: step.and_then(opt) }
}

fn annotations_of(e: Expr) -> Vec<(String, Expr)> {
    match e {
        Expr::Dict(entries) => entries
            .into_iter()
            .filter_map(|(k, v)| match k {
                Some(Expr::Const(Value::Str(s))) => Some((s, v)),
                _ => None,
            })
            .collect(),
        other => {
            let items = tuple_items(other);
            items
                .chunks(2)
                .filter_map(|pair| match pair {
                    [Expr::Const(Value::Str(s)), v] => Some((s.clone(), v.clone())),
                    _ => None,
                })
                .collect()
        }
    }
}

fn kw_defaults_of(e: Expr) -> Vec<(String, Expr)> {
    match e {
        Expr::Dict(entries) => entries
            .into_iter()
            .filter_map(|(k, v)| match k {
                Some(Expr::Const(Value::Str(s))) => Some((s, v)),
                _ => None,
            })
            .collect(),
        Expr::Const(Value::Dict(entries)) => entries
            .iter()
            .filter_map(|(k, v)| k.as_str().map(|s| (s.to_string(), const_expr(v))))
            .collect(),
        _ => Vec::new(),
    }
}

/// Signature of a nested code object with the defaults and annotations its
/// `MAKE_FUNCTION` supplied.
pub fn params_for(code: &CodeObject, fv: &FunctionValue) -> ParamList {
    let p = code.parameters();
    let ann = |n: &str| fv.annotations.iter().find(|(a, _)| a == n).map(|(_, e)| e.clone());
    let param = |n: &String| Param { name: n.clone(), default: None, annotation: ann(n) };
    let mut list = ParamList {
        posonly: p.posonly.iter().map(param).collect(),
        args: p.args.iter().map(param).collect(),
        vararg: p.vararg.as_ref().map(param),
        kwonly: p.kwonly.iter().map(param).collect(),
        kwarg: p.kwarg.as_ref().map(param),
    };
    let positional = list.posonly.len() + list.args.len();
    let first_default = positional.saturating_sub(fv.defaults.len());
    for (i, d) in fv.defaults.iter().enumerate() {
        let idx = first_default + i;
        let slot = if idx < list.posonly.len() {
            list.posonly.get_mut(idx)
        } else {
            list.args.get_mut(idx - list.posonly.len())
        };
        if let Some(s) = slot {
            s.default = Some(d.clone());
        }
    }
    for p in &mut list.kwonly {
        p.default = fv.kw_defaults.iter().find(|(n, _)| *n == p.name).map(|(_, e)| e.clone());
    }
    list
}

/// `a and b` / `a or b` with nested operands of the same kind flattened.
pub fn bool_op(op: BoolOp, left: Expr, right: Expr) -> Expr {
    let mut values = Vec::new();
    for e in [left, right] {
        match e {
            Expr::BoolOp { op: inner, values: vs } if inner == op => values.extend(vs),
            other => values.push(other),
        }
    }
    Expr::BoolOp { op, values }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinOp;
    use crate::disasm::{disassemble, tests::asm};
    use crate::opcodes::Registry;

    fn run(version: PyVersion, code: CodeObject) -> (Vec<Stmt>, Vec<Expr>, Exit, Vec<Diagnostic>) {
        let tree = CodeTree::build(Arc::new(code));
        let reg = Registry::new();
        let dis = disassemble(&tree.nodes[0].code, version, reg.table(version)).unwrap();
        let mut t = Translator::new(&tree, 0, version);
        let out = t.translate(&dis.instrs, Vec::new());
        (out.stmts, out.stack, out.exit, t.take_diagnostics())
    }

    fn module(version: PyVersion, ops: &[(&str, u32)], consts: Vec<Value>, names: &[&str]) -> CodeObject {
        let mut code = CodeObject::empty("<module>");
        code.code = asm(version, ops);
        code.consts = consts;
        code.names = names.iter().map(|s| s.to_string()).collect();
        code
    }

    fn assign(name: &str, value: Expr) -> Stmt {
        Stmt::Assign { targets: vec![Expr::name(name)], value }
    }

    #[test]
    fn call_with_keywords_312() {
        let v = PyVersion::V3_12;
        let code = module(
            v,
            &[
                ("PUSH_NULL", 0),
                ("LOAD_NAME", 0),
                ("LOAD_CONST", 0),
                ("LOAD_CONST", 1),
                ("KW_NAMES", 2),
                ("CALL", 2),
                ("STORE_NAME", 1),
            ],
            vec![Value::Int(1), Value::Int(2), Value::Tuple(vec![Value::Str("k".into())])],
            &["f", "x"],
        );
        let (stmts, stack, _, _) = run(v, code);
        assert!(stack.is_empty());
        assert_eq!(
            stmts,
            vec![assign(
                "x",
                Expr::Call {
                    func: Box::new(Expr::name("f")),
                    args: vec![Expr::Const(Value::Int(1))],
                    keywords: vec![Keyword { arg: Some("k".into()), value: Expr::Const(Value::Int(2)) }],
                }
            )]
        );
    }

    #[test]
    fn method_call_310() {
        let v = PyVersion::V3_10;
        let code = module(
            v,
            &[("LOAD_NAME", 0), ("LOAD_METHOD", 1), ("CALL_METHOD", 0), ("POP_TOP", 0)],
            vec![],
            &["o", "m"],
        );
        let (stmts, _, _, _) = run(v, code);
        assert_eq!(stmts, vec![Stmt::Expr(Expr::call(Expr::attr(Expr::name("o"), "m"), vec![]))]);
    }

    #[test]
    fn swap_then_stores_is_parallel_assignment() {
        let v = PyVersion::V3_12;
        let code = module(
            v,
            &[("LOAD_NAME", 1), ("LOAD_NAME", 0), ("SWAP", 2), ("STORE_NAME", 0), ("STORE_NAME", 1)],
            vec![],
            &["a", "b"],
        );
        let (stmts, _, _, _) = run(v, code);
        assert_eq!(
            stmts,
            vec![Stmt::Assign {
                targets: vec![Expr::Tuple(vec![Expr::name("a"), Expr::name("b")])],
                value: Expr::Tuple(vec![Expr::name("b"), Expr::name("a")]),
            }]
        );
    }

    fn swapped(a: &str, b: &str) -> Vec<Stmt> {
        vec![Stmt::Assign {
            targets: vec![Expr::Tuple(vec![Expr::name(a), Expr::name(b)])],
            value: Expr::Tuple(vec![Expr::name(b), Expr::name(a)]),
        }]
    }

    #[test]
    fn swap_folded_into_store_order_311() {
        let v = PyVersion::V3_11;
        let code = module(
            v,
            &[("LOAD_NAME", 1), ("LOAD_NAME", 0), ("STORE_NAME", 1), ("STORE_NAME", 0)],
            vec![],
            &["a", "b"],
        );
        let (stmts, stack, _, _) = run(v, code);
        assert!(stack.is_empty());
        assert_eq!(stmts, swapped("a", "b"));
    }

    #[test]
    fn swap_with_superinstructions_313() {
        let v = PyVersion::V3_13;
        let mut code = module(v, &[("LOAD_FAST_LOAD_FAST", 0x10), ("STORE_FAST_STORE_FAST", 0x10)], vec![], &[]);
        code.fast_names = vec!["a".into(), "b".into()];
        let (stmts, _, _, _) = run(v, code);
        assert_eq!(stmts, swapped("a", "b"));
    }

    #[test]
    fn independent_stores_stay_sequential() {
        let v = PyVersion::V3_12;
        let code = module(
            v,
            &[("LOAD_NAME", 2), ("LOAD_NAME", 3), ("STORE_NAME", 1), ("STORE_NAME", 0)],
            vec![],
            &["a", "b", "x", "y"],
        );
        let (stmts, _, _, _) = run(v, code);
        assert_eq!(stmts, vec![assign("b", Expr::name("y")), assign("a", Expr::name("x"))]);
    }

    #[test]
    fn zero_argument_super_312() {
        let v = PyVersion::V3_12;
        let mut code = module(
            v,
            &[
                ("LOAD_GLOBAL", 0),
                ("LOAD_DEREF", 0),
                ("LOAD_FAST", 0),
                ("LOAD_SUPER_ATTR", (1 << 2) | 1),
                ("CALL", 0),
                ("POP_TOP", 0),
                ("LOAD_GLOBAL", 0),
                ("LOAD_GLOBAL", 4),
                ("LOAD_FAST", 0),
                ("LOAD_SUPER_ATTR", (1 << 2) | 3),
                ("CALL", 0),
                ("POP_TOP", 0),
            ],
            vec![],
            &["super", "m", "K"],
        );
        code.fast_names = vec!["self".into(), "__class__".into()];
        code.deref_names = vec!["__class__".into()];
        let (stmts, _, _, _) = run(v, code);
        let method = |args: Vec<Expr>| Stmt::Expr(Expr::call(Expr::attr(Expr::call(Expr::name("super"), args), "m"), vec![]));
        assert_eq!(stmts, vec![method(vec![]), method(vec![Expr::name("K"), Expr::name("self")])]);
    }

    fn with_body(tail: &[(&'static str, u32)]) -> Vec<(&'static str, u32)> {
        let mut ops = vec![("LOAD_NAME", 0), ("BEFORE_WITH", 0), ("POP_TOP", 0), ("PUSH_NULL", 0), ("LOAD_NAME", 1), ("CALL", 0)];
        ops.extend_from_slice(tail);
        ops
    }

    #[test]
    fn with_exit_before_a_later_return_312() {
        // with cm: f()
        // return y
        let v = PyVersion::V3_12;
        let ops = with_body(&[
            ("POP_TOP", 0),
            ("LOAD_CONST", 0),
            ("LOAD_CONST", 0),
            ("LOAD_CONST", 0),
            ("CALL", 2),
            ("POP_TOP", 0),
            ("LOAD_NAME", 2),
            ("RETURN_VALUE", 0),
        ]);
        let (stmts, _, exit, _) = run(v, module(v, &ops, vec![Value::None], &["cm", "f", "y"]));
        assert_eq!(exit, Exit::Return);
        assert_eq!(
            stmts,
            vec![
                Stmt::WithEnter { context: Expr::name("cm"), target: None, is_async: false },
                Stmt::Expr(Expr::call(Expr::name("f"), vec![])),
                Stmt::WithExit,
                Stmt::Return(Some(Expr::name("y"))),
            ]
        );
    }

    #[test]
    fn return_carried_through_with_exit_312() {
        // with cm: return f()
        let v = PyVersion::V3_12;
        let ops = with_body(&[
            ("SWAP", 2),
            ("LOAD_CONST", 0),
            ("LOAD_CONST", 0),
            ("LOAD_CONST", 0),
            ("CALL", 2),
            ("POP_TOP", 0),
            ("RETURN_VALUE", 0),
        ]);
        let (stmts, _, _, _) = run(v, module(v, &ops, vec![Value::None], &["cm", "f"]));
        assert_eq!(
            stmts,
            vec![
                Stmt::WithEnter { context: Expr::name("cm"), target: None, is_async: false },
                Stmt::Return(Some(Expr::call(Expr::name("f"), vec![]))),
            ]
        );
    }

    #[test]
    fn unpack_and_augmented_assignment() {
        let v = PyVersion::V3_12;
        let code = module(
            v,
            &[
                ("LOAD_NAME", 2),
                ("UNPACK_SEQUENCE", 2),
                ("STORE_NAME", 0),
                ("STORE_NAME", 1),
                ("LOAD_NAME", 0),
                ("LOAD_CONST", 0),
                ("BINARY_OP", 13),
                ("STORE_NAME", 0),
            ],
            vec![Value::Int(1)],
            &["a", "b", "pair"],
        );
        let (stmts, _, _, _) = run(v, code);
        assert_eq!(
            stmts,
            vec![
                Stmt::Assign {
                    targets: vec![Expr::Tuple(vec![Expr::name("a"), Expr::name("b")])],
                    value: Expr::name("pair"),
                },
                Stmt::AugAssign { target: Expr::name("a"), op: BinOp::Add, value: Expr::Const(Value::Int(1)) },
            ]
        );
    }

    #[test]
    fn chained_assignment_shares_value() {
        let v = PyVersion::V3_12;
        let code = module(
            v,
            &[("PUSH_NULL", 0), ("LOAD_NAME", 0), ("CALL", 0), ("COPY", 1), ("STORE_NAME", 1), ("STORE_NAME", 2)],
            vec![],
            &["f", "a", "b"],
        );
        let (stmts, _, _, _) = run(v, code);
        assert_eq!(
            stmts,
            vec![Stmt::Assign {
                targets: vec![Expr::name("a"), Expr::name("b")],
                value: Expr::call(Expr::name("f"), vec![]),
            }]
        );
    }

    #[test]
    fn imports() {
        let v = PyVersion::V3_12;
        let code = module(
            v,
            &[
                ("LOAD_CONST", 0),
                ("LOAD_CONST", 1),
                ("IMPORT_NAME", 0),
                ("STORE_NAME", 1),
                ("LOAD_CONST", 0),
                ("LOAD_CONST", 2),
                ("IMPORT_NAME", 2),
                ("IMPORT_FROM", 3),
                ("STORE_NAME", 4),
                ("POP_TOP", 0),
            ],
            vec![Value::Int(0), Value::None, Value::Tuple(vec![Value::Str("path".into())])],
            &["numpy", "np", "os", "path", "p"],
        );
        let (stmts, stack, _, _) = run(v, code);
        assert!(stack.is_empty());
        assert_eq!(
            stmts,
            vec![
                Stmt::Import(vec![Alias { name: "numpy".into(), asname: Some("np".into()) }]),
                Stmt::ImportFrom {
                    module: "os".into(),
                    names: vec![Alias { name: "path".into(), asname: Some("p".into()) }],
                    level: 0
                },
            ]
        );
    }

    #[test]
    fn unknown_opcode_poisons_dependent_store_once() {
        let v = PyVersion::V3_12;
        let mut code = CodeObject::empty("<module>");
        let mut bytes = asm(v, &[("LOAD_NAME", 0)]);
        bytes.extend([254, 0]);
        bytes.extend(asm(v, &[("STORE_NAME", 1), ("LOAD_CONST", 0), ("STORE_NAME", 2)]));
        code.code = bytes;
        code.consts = vec![Value::Int(1)];
        code.names = vec!["a".into(), "x".into(), "y".into()];
        let (stmts, _, _, _) = run(v, code);
        assert_eq!(
            stmts,
            vec![
                Stmt::Unreconstructed { op: "<254>".into(), line: None },
                assign("y", Expr::Const(Value::Int(1))),
            ]
        );
    }

    #[test]
    fn branch_exit() {
        let v = PyVersion::V3_12;
        let code = module(
            v,
            &[("LOAD_NAME", 0), ("POP_JUMP_IF_FALSE", 1), ("NOP", 0), ("RETURN_CONST", 0)],
            vec![Value::None],
            &["c"],
        );
        let tree = CodeTree::build(Arc::new(code));
        let reg = Registry::new();
        let dis = disassemble(&tree.nodes[0].code, v, reg.table(v)).unwrap();
        let mut t = Translator::new(&tree, 0, v);
        let out = t.translate(&dis.instrs[..2], Vec::new());
        assert_eq!(out.exit, Exit::Branch { cond: Expr::name("c"), jump_if_true: false, target: 6, keep: false });
    }
}
