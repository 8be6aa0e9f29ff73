//! Disassembler: raw code bytes to resolved instructions, line numbers, exception regions
//! and the basic-block graph the reconstructor walks.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, trace};

use crate::ast::{BinOp, CmpOp};
use crate::error::{DecompileError, Diagnostic};
use crate::marshal::{CodeObject, Reader, Value};
use crate::opcodes::{JumpKind, Op, OpcodeTable, UnknownOpcode};
use crate::version::PyVersion;

/// An instruction argument resolved against the owning code object.
#[derive(Debug, Clone, PartialEq)]
pub enum Argval {
    /// Raw numeric argument (counts, flags, depths).
    Raw(u32),
    Const(usize),
    Name(String),
    NamePair(String, String),
    Jump(u32),
    Compare(CmpOp),
    Binary(BinOp, bool),
    Subscr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Offset of the first `EXTENDED_ARG` prefix, or of the instruction itself.
    pub offset: u32,
    pub op: Op,
    pub opname: String,
    pub arg: u32,
    pub argval: Argval,
    pub line: Option<u32>,
}

impl Instruction {
    pub fn target(&self) -> Option<u32> {
        match self.argval {
            Argval::Jump(t) => Some(t),
            _ => None,
        }
    }

    pub fn name_arg(&self) -> Option<&str> {
        match &self.argval {
            Argval::Name(n) => Some(n),
            _ => None,
        }
    }

    /// `LOAD_GLOBAL`/`LOAD_ATTR` low bit: also push `NULL` or the bound method.
    pub fn pushes_null(&self, version: PyVersion) -> bool {
        match self.op {
            Op::LoadGlobal => version >= PyVersion::V3_11 && self.arg & 1 != 0,
            Op::LoadAttr => version >= PyVersion::V3_12 && self.arg & 1 != 0,
            Op::LoadSuperAttr => self.arg & 1 != 0,
            _ => false,
        }
    }

    fn argrepr(&self, code: &CodeObject) -> String {
        match &self.argval {
            Argval::Raw(_) => String::new(),
            Argval::Const(i) => code.consts.get(*i).map(|v| v.to_string()).unwrap_or_default(),
            Argval::Name(n) => n.clone(),
            Argval::NamePair(a, b) => format!("{a}, {b}"),
            Argval::Jump(t) => format!("to {t}"),
            Argval::Compare(c) => c.symbol().to_string(),
            Argval::Binary(op, true) => format!("{}=", op.symbol()),
            Argval::Binary(op, false) => op.symbol().to_string(),
            Argval::Subscr => "[]".into(),
        }
    }
}

/// What a protected region's handler implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// `try`/`except`/`finally`.
    Try,
    /// `with` exit handling.
    With,
    /// The `StopAsyncIteration` catch of `async for`.
    AsyncFor,
    /// Compiler-generated cleanup (exception variables, generators, `await`).
    Cleanup,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionEntry {
    pub start: u32,
    /// Exclusive.
    pub end: u32,
    pub target: u32,
    pub depth: u32,
    pub lasti: bool,
    pub kind: HandlerKind,
}

impl ExceptionEntry {
    pub fn contains(&self, offset: u32) -> bool {
        (self.start..self.end).contains(&offset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disassembly {
    pub version: PyVersion,
    pub instrs: Vec<Instruction>,
    pub exceptions: Vec<ExceptionEntry>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Disassembly {
    pub fn index_of(&self, offset: u32) -> Option<usize> {
        self.instrs.binary_search_by_key(&offset, |i| i.offset).ok()
    }
}

struct RawInstr {
    offset: u32,
    /// Offset of the opcode itself, past any `EXTENDED_ARG`.
    at: u32,
    name: String,
    op: Op,
    jump: JumpKind,
    arg: u32,
}

/// Decode one code object.
pub fn disassemble(code: &CodeObject, version: PyVersion, table: &OpcodeTable) -> Result<Disassembly, DecompileError> {
    let mut diagnostics = Vec::new();
    let raw = decode(code, version, table, &mut diagnostics)?;
    let offsets: HashSet<u32> = raw.iter().map(|r| r.offset).collect();
    let spans = line_spans(code, version);

    let mut instrs = Vec::with_capacity(raw.len());
    for (i, r) in raw.iter().enumerate() {
        let next = raw.get(i + 1).map(|n| n.offset).unwrap_or(code.code.len() as u32);
        let target = match r.jump {
            JumpKind::None => None,
            kind => {
                let t = jump_target(kind, r.arg, next).filter(|t| offsets.contains(t));
                match t {
                    Some(t) => Some(t),
                    None => {
                        return Err(DecompileError::InvalidJumpTarget {
                            code: code.qualname.clone(),
                            offset: r.offset,
                            target: jump_target(kind, r.arg, next).unwrap_or(0),
                        });
                    }
                }
            }
        };
        let argval = match target {
            Some(t) => Argval::Jump(t),
            None => resolve_argval(code, version, r)?,
        };
        instrs.push(Instruction {
            offset: r.offset,
            op: r.op,
            opname: r.name.clone(),
            arg: r.arg,
            argval,
            line: line_at(&spans, r.at),
        });
    }

    let table_entries = (version >= PyVersion::V3_11).then(|| {
        parse_exception_table(&code.exceptiontable)
            .into_iter()
            .map(|(start, end, target, depth, lasti)| ExceptionEntry {
                start,
                end,
                target,
                depth,
                lasti,
                kind: HandlerKind::Cleanup,
            })
            .collect()
    });
    let dis = finish(code, version, instrs, table_entries, diagnostics)?;
    debug!(code = %code.qualname, instrs = dis.instrs.len(), handlers = dis.exceptions.len(), "disassembled");
    Ok(dis)
}

/// Shared tail of binary and text-dump decoding: validate handler targets, synthesize
/// 3.10 regions when no table is given, classify handlers and fold `await` loops.
pub(crate) fn finish(
    code: &CodeObject,
    version: PyVersion,
    instrs: Vec<Instruction>,
    table: Option<Vec<ExceptionEntry>>,
    diagnostics: Vec<Diagnostic>,
) -> Result<Disassembly, DecompileError> {
    let end = instrs.last().map(|i| i.offset + 2).unwrap_or(0);
    let mut exceptions = match table {
        Some(entries) => entries,
        None => synthesize_exception_table(&instrs, end),
    };
    let offsets: HashSet<u32> = instrs.iter().map(|i| i.offset).collect();
    for e in &exceptions {
        if !offsets.contains(&e.target) {
            return Err(DecompileError::InvalidJumpTarget { code: code.qualname.clone(), offset: e.start, target: e.target });
        }
    }
    classify_handlers(&instrs, &mut exceptions, version);

    let mut dis = Disassembly { version, instrs, exceptions, diagnostics };
    fold_await_loops(code, &mut dis);
    Ok(dis)
}

fn decode(
    code: &CodeObject,
    version: PyVersion,
    table: &OpcodeTable,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Vec<RawInstr>, DecompileError> {
    if code.code.len() % 2 != 0 {
        return Err(DecompileError::malformed(0, format!("{}: odd bytecode length {}", code.qualname, code.code.len())));
    }
    let mut r = Reader::new(&code.code);
    let mut out = Vec::new();
    let mut ext: u32 = 0;
    let mut prefix_at: Option<u32> = None;
    while r.pos() < code.code.len() {
        let at = r.pos() as u32;
        let opcode = r.get_u8()?;
        let arg = ext << 8 | r.get_u8()? as u32;
        if version >= PyVersion::V3_11 && opcode == 0 {
            continue;
        }
        let (name, op, jump) = match table.lookup(opcode) {
            Ok(info) => (info.name.to_string(), info.op, info.jump),
            Err(UnknownOpcode(raw)) => {
                let name = format!("<{raw}>");
                diagnostics.push(Diagnostic::UnknownOpcode { scope: code.qualname.clone(), opname: name.clone(), offset: at });
                (name, Op::VersionSpecific, JumpKind::None)
            }
        };
        if op == Op::ExtendedArg {
            ext = arg;
            prefix_at.get_or_insert(at);
            continue;
        }
        ext = 0;
        let offset = prefix_at.take().unwrap_or(at);
        trace!(offset, name = %name, arg, "decode");
        out.push(RawInstr { offset, at, name, op, jump, arg });
    }
    Ok(out)
}

fn jump_target(kind: JumpKind, arg: u32, next: u32) -> Option<u32> {
    match kind {
        JumpKind::None => None,
        JumpKind::Absolute => Some(arg * 2),
        JumpKind::Forward => Some(next + arg * 2),
        JumpKind::Backward => next.checked_sub(arg * 2),
    }
}

fn resolve_argval(code: &CodeObject, version: PyVersion, r: &RawInstr) -> Result<Argval, DecompileError> {
    let name_at = |table: &[String], idx: u32, what: &str| -> Result<String, DecompileError> {
        table.get(idx as usize).cloned().ok_or_else(|| {
            DecompileError::malformed(
                r.at as usize,
                format!("{}: {what} index {idx} out of range at {}", code.qualname, r.offset),
            )
        })
    };
    let deref_names = if version.has_localsplus() { &code.fast_names } else { &code.deref_names };
    let arg = r.arg;
    Ok(match r.op {
        Op::LoadConst | Op::ReturnConst | Op::KwNames => {
            if arg as usize >= code.consts.len() {
                return Err(DecompileError::malformed(
                    r.at as usize,
                    format!("{}: constant index {arg} out of range", code.qualname),
                ));
            }
            Argval::Const(arg as usize)
        }
        Op::LoadGlobal if version >= PyVersion::V3_11 => Argval::Name(name_at(&code.names, arg >> 1, "name")?),
        Op::LoadAttr if version >= PyVersion::V3_12 => Argval::Name(name_at(&code.names, arg >> 1, "name")?),
        Op::LoadSuperAttr => Argval::Name(name_at(&code.names, arg >> 2, "name")?),
        Op::LoadName
        | Op::StoreName
        | Op::DeleteName
        | Op::LoadGlobal
        | Op::StoreGlobal
        | Op::DeleteGlobal
        | Op::LoadAttr
        | Op::LoadMethod
        | Op::StoreAttr
        | Op::DeleteAttr
        | Op::ImportName
        | Op::ImportFrom
        | Op::LoadFromDictOrGlobals => Argval::Name(name_at(&code.names, arg, "name")?),
        Op::LoadFast | Op::StoreFast | Op::DeleteFast | Op::LoadFastAndClear => {
            Argval::Name(name_at(&code.fast_names, arg, "local")?)
        }
        Op::LoadDeref | Op::StoreDeref | Op::DeleteDeref | Op::LoadClosure | Op::LoadFromDictOrDeref | Op::MakeCell => {
            Argval::Name(name_at(deref_names, arg, "cell")?)
        }
        Op::LoadFastLoadFast | Op::StoreFastLoadFast | Op::StoreFastStoreFast => Argval::NamePair(
            name_at(&code.fast_names, arg >> 4, "local")?,
            name_at(&code.fast_names, arg & 15, "local")?,
        ),
        Op::CompareOp => {
            let idx = match version {
                PyVersion::V3_10 | PyVersion::V3_11 => arg,
                PyVersion::V3_12 => arg >> 4,
                _ => arg >> 5,
            };
            CmpOp::from_index(idx).map(Argval::Compare).unwrap_or(Argval::Raw(arg))
        }
        Op::IsOp => Argval::Compare(if arg == 1 { CmpOp::IsNot } else { CmpOp::Is }),
        Op::ContainsOp => Argval::Compare(if arg == 1 { CmpOp::NotIn } else { CmpOp::In }),
        Op::BinaryOp if version >= PyVersion::V3_14 && arg == 26 => Argval::Subscr,
        Op::BinaryOp => match BinOp::from_nb(arg) {
            Some((op, inplace)) => Argval::Binary(op, inplace),
            None => Argval::Raw(arg),
        },
        Op::Binary(op) => Argval::Binary(op, false),
        Op::Inplace(op) => Argval::Binary(op, true),
        _ => Argval::Raw(arg),
    })
}

struct LineSpan {
    start: u32,
    end: u32,
    line: Option<u32>,
}

fn line_at(spans: &[LineSpan], offset: u32) -> Option<u32> {
    spans.iter().find(|s| (s.start..s.end).contains(&offset)).and_then(|s| s.line)
}

fn line_spans(code: &CodeObject, version: PyVersion) -> Vec<LineSpan> {
    if version >= PyVersion::V3_11 {
        location_spans(code)
    } else {
        legacy_line_spans(code)
    }
}

// 3.10: (byte delta, signed line delta) pairs; -128 marks "no line".
fn legacy_line_spans(code: &CodeObject) -> Vec<LineSpan> {
    let mut out = Vec::new();
    let mut line = code.firstlineno as i64;
    let mut addr = 0u32;
    for pair in code.linetable.chunks_exact(2) {
        let sdelta = pair[0] as u32;
        let ldelta = pair[1] as i8;
        let start = addr;
        addr += sdelta;
        let this = if ldelta == -128 {
            None
        } else {
            line += ldelta as i64;
            u32::try_from(line).ok()
        };
        if sdelta > 0 {
            out.push(LineSpan { start, end: addr, line: this });
        }
    }
    out
}

fn read_varint(r: &mut Reader<'_>) -> Option<u32> {
    let mut b = r.get_u8().ok()?;
    let mut val = (b & 63) as u32;
    let mut shift = 0;
    while b & 64 != 0 {
        b = r.get_u8().ok()?;
        shift += 6;
        val |= ((b & 63) as u32) << shift;
    }
    Some(val)
}

fn read_svarint(r: &mut Reader<'_>) -> Option<i64> {
    let v = read_varint(r)? as i64;
    Some(if v & 1 != 0 { -(v >> 1) } else { v >> 1 })
}

// 3.11+ location table.
fn location_spans(code: &CodeObject) -> Vec<LineSpan> {
    let mut out = Vec::new();
    let mut r = Reader::new(&code.linetable);
    let mut line = code.firstlineno as i64;
    let mut addr = 0u32;
    while let Ok(first) = r.get_u8() {
        if first & 0x80 == 0 {
            break;
        }
        let kind = (first >> 3) & 15;
        let end = addr + ((first & 7) as u32 + 1) * 2;
        let this = match kind {
            15 => None,
            14 => {
                let Some(delta) = read_svarint(&mut r) else { break };
                line += delta;
                for _ in 0..3 {
                    if read_varint(&mut r).is_none() {
                        break;
                    }
                }
                u32::try_from(line).ok()
            }
            13 => {
                let Some(delta) = read_svarint(&mut r) else { break };
                line += delta;
                u32::try_from(line).ok()
            }
            10..=12 => {
                line += (kind - 10) as i64;
                if r.get_bytes(2).is_err() {
                    break;
                }
                u32::try_from(line).ok()
            }
            _ => {
                if r.get_u8().is_err() {
                    break;
                }
                u32::try_from(line).ok()
            }
        };
        out.push(LineSpan { start: addr, end, line: this });
        addr = end;
    }
    out
}

fn read_varint_be(r: &mut Reader<'_>) -> Option<u32> {
    let mut b = r.get_u8().ok()?;
    let mut val = (b & 63) as u32;
    while b & 64 != 0 {
        b = r.get_u8().ok()?;
        val = (val << 6) | (b & 63) as u32;
    }
    Some(val)
}

/// Parse a 3.11+ exception table into `(start, end, target, depth, lasti)`.
pub fn parse_exception_table(bytes: &[u8]) -> Vec<(u32, u32, u32, u32, bool)> {
    let mut r = Reader::new(bytes);
    let mut out = Vec::new();
    loop {
        let Some(start) = read_varint_be(&mut r) else { break };
        let (Some(len), Some(target), Some(dl)) = (read_varint_be(&mut r), read_varint_be(&mut r), read_varint_be(&mut r))
        else {
            break;
        };
        out.push((start * 2, (start + len) * 2, target * 2, dl >> 1, dl & 1 != 0));
    }
    out
}

/// 3.10 has no exception table: replay the static block stack pushed by `SETUP_*` and
/// popped by `POP_BLOCK` along every path, then group instructions by innermost handler.
fn synthesize_exception_table(instrs: &[Instruction], code_len: u32) -> Vec<ExceptionEntry> {
    let index: HashMap<u32, usize> = instrs.iter().enumerate().map(|(i, ins)| (ins.offset, i)).collect();
    let mut state: Vec<Option<Vec<(u32, Op)>>> = vec![None; instrs.len()];
    let mut work = vec![0usize];
    if !instrs.is_empty() {
        state[0] = Some(Vec::new());
    }
    while let Some(i) = work.pop() {
        let Some(stack) = state[i].clone() else { continue };
        let ins = &instrs[i];
        let mut after = stack.clone();
        let mut succs: Vec<(usize, Vec<(u32, Op)>)> = Vec::new();
        match ins.op {
            Op::SetupFinally | Op::SetupWith | Op::SetupAsyncWith => {
                if let Some(t) = ins.target() {
                    after.push((t, ins.op));
                    if let Some(&ti) = index.get(&t) {
                        succs.push((ti, stack.clone()));
                    }
                }
            }
            Op::PopBlock => {
                after.pop();
            }
            _ => {}
        }
        let falls = !ins.op.is_terminal();
        if let Some(t) = ins.target() {
            if ins.op.is_conditional_jump() || ins.op.is_unconditional_jump() {
                if let Some(&ti) = index.get(&t) {
                    succs.push((ti, after.clone()));
                }
            }
        }
        if falls && i + 1 < instrs.len() {
            succs.push((i + 1, after));
        }
        for (j, s) in succs {
            if state[j].is_none() {
                state[j] = Some(s);
                work.push(j);
            }
        }
    }

    let mut out: Vec<ExceptionEntry> = Vec::new();
    for (i, ins) in instrs.iter().enumerate() {
        let inner = state[i].as_ref().and_then(|s| s.last().copied());
        let end = instrs.get(i + 1).map(|n| n.offset).unwrap_or(code_len);
        match (inner, out.last_mut()) {
            (Some((target, _)), Some(last)) if last.target == target && last.end == ins.offset => last.end = end,
            (Some((target, setup)), _) => out.push(ExceptionEntry {
                start: ins.offset,
                end,
                target,
                depth: 0,
                lasti: false,
                kind: if setup == Op::SetupFinally { HandlerKind::Try } else { HandlerKind::With },
            }),
            (None, _) => {}
        }
    }
    out
}

fn classify_handlers(instrs: &[Instruction], entries: &mut [ExceptionEntry], version: PyVersion) {
    let index: HashMap<u32, usize> = instrs.iter().enumerate().map(|(i, ins)| (ins.offset, i)).collect();
    for e in entries.iter_mut() {
        let Some(&ti) = index.get(&e.target) else { continue };
        let first = instrs[ti].op;
        let second = instrs.get(ti + 1).map(|i| i.op);
        if first == Op::EndAsyncFor {
            e.kind = HandlerKind::AsyncFor;
            continue;
        }
        if version == PyVersion::V3_10 {
            continue;
        }
        e.kind = match (first, second) {
            (Op::PushExcInfo, Some(Op::WithExceptStart)) => HandlerKind::With,
            (Op::PushExcInfo, _) if !e.lasti => HandlerKind::Try,
            _ => HandlerKind::Cleanup,
        };
    }
}

/// Collapse the `LOAD_CONST None; SEND ...; END_SEND` delegation loop of `await` and
/// `yield from` so the awaited value simply stays on the stack.
fn fold_await_loops(code: &CodeObject, dis: &mut Disassembly) {
    let mut removed: HashSet<usize> = HashSet::new();
    for (i, ins) in dis.instrs.iter().enumerate() {
        if ins.op != Op::Send || i == 0 {
            continue;
        }
        let prev = &dis.instrs[i - 1];
        let loads_none = prev.op == Op::LoadConst
            && matches!(prev.argval, Argval::Const(c) if code.consts.get(c) == Some(&Value::None));
        let Some(target) = ins.target() else { continue };
        let Some(ti) = dis.index_of(target) else { continue };
        if !loads_none || ti <= i {
            continue;
        }
        removed.extend(i - 1..ti);
        if dis.instrs[ti].op == Op::EndSend {
            removed.insert(ti);
        }
    }
    if removed.is_empty() {
        return;
    }

    let old = std::mem::take(&mut dis.instrs);
    let surviving_after = |offset: u32| -> Option<u32> {
        old.iter()
            .enumerate()
            .find(|(j, ins)| ins.offset >= offset && !removed.contains(j))
            .map(|(_, ins)| ins.offset)
    };
    let removed_offsets: HashSet<u32> = removed.iter().map(|&j| old[j].offset).collect();

    let mut kept = Vec::with_capacity(old.len() - removed.len());
    for (j, ins) in old.iter().enumerate() {
        if removed.contains(&j) {
            continue;
        }
        let mut ins = ins.clone();
        if let Argval::Jump(t) = ins.argval {
            if removed_offsets.contains(&t) {
                if let Some(snap) = surviving_after(t) {
                    ins.argval = Argval::Jump(snap);
                }
            }
        }
        kept.push(ins);
    }
    let end = kept.last().map(|i| i.offset + 2).unwrap_or(0);
    let mut entries = Vec::new();
    for mut e in std::mem::take(&mut dis.exceptions) {
        if removed_offsets.contains(&e.target) {
            continue;
        }
        e.start = surviving_after(e.start).unwrap_or(end);
        e.end = surviving_after(e.end).unwrap_or(end);
        if e.start < e.end {
            entries.push(e);
        }
    }
    trace!(code = %code.qualname, folded = removed.len(), "await loops folded");
    dis.instrs = kept;
    dis.exceptions = entries;
}

/// How control leaves a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Return,
    Raise,
    Fallthrough(usize),
    Jump(usize),
    Branch { target: usize, next: usize },
    /// Falls off the end of the code object.
    End,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub start: u32,
    pub instrs: Vec<Instruction>,
    pub succs: Vec<usize>,
    pub preds: Vec<usize>,
    /// Innermost exception entry covering the block.
    pub handler: Option<usize>,
    /// Block the handler entry jumps to.
    pub exc_succ: Option<usize>,
    pub exc_preds: Vec<usize>,
    pub terminator: Terminator,
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    pub exceptions: Vec<ExceptionEntry>,
    by_offset: HashMap<u32, usize>,
    idom: Vec<Option<usize>>,
}

pub fn build_cfg(dis: &Disassembly) -> Cfg {
    let instrs = &dis.instrs;
    let mut leaders: BTreeSet<u32> = BTreeSet::new();
    if let Some(first) = instrs.first() {
        leaders.insert(first.offset);
    }
    for (idx, ins) in instrs.iter().enumerate() {
        let branches = ins.op.is_conditional_jump() || ins.op.is_unconditional_jump();
        if branches {
            if let Some(t) = ins.target() {
                leaders.insert(t);
            }
        }
        if branches || ins.op.is_terminal() {
            if let Some(next) = instrs.get(idx + 1) {
                leaders.insert(next.offset);
            }
        }
    }
    let known: HashSet<u32> = instrs.iter().map(|i| i.offset).collect();
    for e in &dis.exceptions {
        for o in [e.start, e.end, e.target] {
            if known.contains(&o) {
                leaders.insert(o);
            }
        }
    }

    let mut by_offset: HashMap<u32, usize> = HashMap::new();
    let mut blocks: Vec<BasicBlock> = Vec::new();
    for (bi, &pc) in leaders.iter().enumerate() {
        by_offset.insert(pc, bi);
        blocks.push(BasicBlock {
            start: pc,
            instrs: Vec::new(),
            succs: Vec::new(),
            preds: Vec::new(),
            handler: None,
            exc_succ: None,
            exc_preds: Vec::new(),
            terminator: Terminator::End,
        });
    }
    let mut current = 0usize;
    for ins in instrs.iter().cloned() {
        if let Some(&bi) = by_offset.get(&ins.offset) {
            current = bi;
        }
        if let Some(b) = blocks.get_mut(current) {
            b.instrs.push(ins);
        }
    }

    let n = blocks.len();
    for bi in 0..n {
        let next = (bi + 1 < n).then_some(bi + 1);
        let term = match blocks[bi].instrs.last() {
            None => next.map(Terminator::Fallthrough).unwrap_or(Terminator::End),
            Some(last) => {
                let target = last.target().and_then(|t| by_offset.get(&t).copied());
                match last.op {
                    Op::ReturnValue | Op::ReturnConst => Terminator::Return,
                    Op::RaiseVarargs | Op::Reraise => Terminator::Raise,
                    op if op.is_unconditional_jump() => target.map(Terminator::Jump).unwrap_or(Terminator::End),
                    op if op.is_conditional_jump() => match (target, next) {
                        (Some(target), Some(next)) => Terminator::Branch { target, next },
                        (Some(target), None) => Terminator::Jump(target),
                        (None, Some(next)) => Terminator::Fallthrough(next),
                        (None, None) => Terminator::End,
                    },
                    _ => next.map(Terminator::Fallthrough).unwrap_or(Terminator::End),
                }
            }
        };
        blocks[bi].terminator = term;
        blocks[bi].succs = match term {
            Terminator::Fallthrough(s) | Terminator::Jump(s) => vec![s],
            Terminator::Branch { target, next } if target == next => vec![next],
            Terminator::Branch { target, next } => vec![next, target],
            _ => Vec::new(),
        };
        let start = blocks[bi].start;
        if let Some(ei) = dis.exceptions.iter().position(|e| e.contains(start)) {
            blocks[bi].handler = Some(ei);
            blocks[bi].exc_succ = by_offset.get(&dis.exceptions[ei].target).copied();
        }
    }
    for bi in 0..n {
        for s in blocks[bi].succs.clone() {
            blocks[s].preds.push(bi);
        }
        if let Some(h) = blocks[bi].exc_succ {
            blocks[h].exc_preds.push(bi);
        }
    }

    let mut cfg = Cfg { blocks, exceptions: dis.exceptions.clone(), by_offset, idom: Vec::new() };
    cfg.idom = cfg.compute_dominators();
    cfg
}

impl Cfg {
    pub fn block_at(&self, offset: u32) -> Option<usize> {
        self.by_offset.get(&offset).copied()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn all_succs(&self, b: usize) -> impl Iterator<Item = usize> + '_ {
        self.blocks[b].succs.iter().copied().chain(self.blocks[b].exc_succ)
    }

    // Cooper, Harvey & Kennedy over normal and exception edges.
    fn compute_dominators(&self) -> Vec<Option<usize>> {
        let n = self.blocks.len();
        let mut idom = vec![None; n];
        if n == 0 {
            return idom;
        }
        let mut order = Vec::with_capacity(n);
        let mut seen = vec![false; n];
        let mut stack = vec![(0usize, false)];
        while let Some((b, done)) = stack.pop() {
            if done {
                order.push(b);
                continue;
            }
            if seen[b] {
                continue;
            }
            seen[b] = true;
            stack.push((b, true));
            let succs: Vec<usize> = self.all_succs(b).collect();
            for s in succs.into_iter().rev() {
                if !seen[s] {
                    stack.push((s, false));
                }
            }
        }
        order.reverse();
        let mut rpo = vec![usize::MAX; n];
        for (i, &b) in order.iter().enumerate() {
            rpo[b] = i;
        }

        idom[0] = Some(0);
        let mut changed = true;
        while changed {
            changed = false;
            for &b in order.iter().skip(1) {
                let preds = self.blocks[b].preds.iter().chain(self.blocks[b].exc_preds.iter()).copied();
                let mut new: Option<usize> = None;
                for p in preds {
                    if idom[p].is_none() {
                        continue;
                    }
                    new = Some(match new {
                        None => p,
                        Some(cur) => {
                            let (mut a, mut c) = (p, cur);
                            while a != c {
                                while rpo[a] > rpo[c] {
                                    a = idom[a].unwrap_or(0);
                                }
                                while rpo[c] > rpo[a] {
                                    c = idom[c].unwrap_or(0);
                                }
                            }
                            a
                        }
                    });
                }
                if new.is_some() && idom[b] != new {
                    idom[b] = new;
                    changed = true;
                }
            }
        }
        idom
    }

    pub fn idom(&self, b: usize) -> Option<usize> {
        self.idom.get(b).copied().flatten().filter(|&d| d != b)
    }

    pub fn dominates(&self, a: usize, b: usize) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(d) => cur = d,
                None => return false,
            }
        }
    }

    /// Normal edges `from -> to` whose target dominates the source.
    pub fn back_edges(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (b, block) in self.blocks.iter().enumerate() {
            for &s in &block.succs {
                if s <= b && self.dominates(s, b) {
                    out.push((b, s));
                }
            }
        }
        out
    }

    /// Blocks nothing flows into, counting exception edges.
    pub fn entry_blocks(&self) -> Vec<usize> {
        (0..self.blocks.len())
            .filter(|&b| b == 0 || (self.blocks[b].preds.is_empty() && self.blocks[b].exc_preds.is_empty()))
            .collect()
    }

    /// Blocks reachable from `from` over normal edges only.
    pub fn reachable(&self, from: &[usize]) -> Vec<bool> {
        let mut seen = vec![false; self.blocks.len()];
        let mut work: Vec<usize> = from.to_vec();
        while let Some(b) = work.pop() {
            if b >= seen.len() || seen[b] {
                continue;
            }
            seen[b] = true;
            work.extend(self.blocks[b].succs.iter().copied());
        }
        seen
    }
}

/// Plain-text listing of one code object.
pub fn render_listing(code: &CodeObject, dis: &Disassembly) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "code {} (args={}, locals={}, line={}, flags=0x{:08x})\n",
        code.qualname,
        code.argcount,
        code.varnames.len(),
        code.firstlineno,
        code.flags.0
    ));
    out.push_str("bytecode:\n");
    let targets: HashSet<u32> = dis.instrs.iter().filter_map(Instruction::target).collect();
    let mut last_line = None;
    for ins in &dis.instrs {
        let line = if ins.line != last_line && ins.line.is_some() {
            last_line = ins.line;
            ins.line.map(|l| l.to_string()).unwrap_or_default()
        } else {
            String::new()
        };
        let mark = if targets.contains(&ins.offset) { ">>" } else { "  " };
        out.push_str(&format!("{line:>5} {mark} {:05} {:<18}", ins.offset, ins.opname));
        match ins.argval {
            Argval::Raw(0) => {}
            Argval::Raw(v) => out.push_str(&format!("       {v}")),
            _ => out.push_str(&format!("       {} ({})", ins.arg, ins.argrepr(code))),
        }
        out.push('\n');
    }
    if !dis.exceptions.is_empty() {
        out.push_str("exception table:\n");
        for e in &dis.exceptions {
            out.push_str(&format!(
                "  {:05} to {:05} -> {:05} [{}]{}\n",
                e.start,
                e.end,
                e.target,
                e.depth,
                if e.lasti { " lasti" } else { "" }
            ));
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::opcodes::Registry;

    /// Assemble `(opname, arg)` pairs, inserting `EXTENDED_ARG` for wide arguments.
    pub(crate) fn asm(version: PyVersion, ops: &[(&str, u32)]) -> Vec<u8> {
        let reg = Registry::new();
        let table = reg.table(version);
        let mut out = Vec::new();
        for &(name, arg) in ops {
            let code = table.opcode(name).unwrap_or_else(|| panic!("no opcode {name} in {version}"));
            if arg > 0xff {
                out.push(table.opcode("EXTENDED_ARG").unwrap());
                out.push((arg >> 8) as u8);
            }
            out.push(code);
            out.push((arg & 0xff) as u8);
        }
        out
    }

    fn code_with(version: PyVersion, ops: &[(&str, u32)]) -> CodeObject {
        let mut code = CodeObject::empty("f");
        code.code = asm(version, ops);
        code.consts = vec![Value::None, Value::Int(1)];
        code.names = vec!["x".into(), "y".into()];
        code.varnames = vec!["a".into(), "b".into()];
        code.fast_names = code.varnames.clone();
        code
    }

    fn dis(version: PyVersion, code: &CodeObject) -> Result<Disassembly, DecompileError> {
        let reg = Registry::new();
        disassemble(code, version, reg.table(version))
    }

    #[test]
    fn extended_arg_folds_into_next() {
        let mut code = code_with(PyVersion::V3_12, &[("LOAD_CONST", 300), ("RETURN_VALUE", 0)]);
        code.consts = vec![Value::None; 301];
        let d = dis(PyVersion::V3_12, &code).unwrap();
        assert_eq!(d.instrs.len(), 2);
        assert_eq!(d.instrs[0].offset, 0);
        assert_eq!(d.instrs[0].argval, Argval::Const(300));
        assert_eq!(d.instrs[1].offset, 4);
    }

    #[test]
    fn relative_and_absolute_jumps() {
        let v = PyVersion::V3_12;
        let code = code_with(
            v,
            &[("LOAD_NAME", 0), ("POP_JUMP_IF_FALSE", 1), ("LOAD_CONST", 1), ("RETURN_CONST", 0)],
        );
        let d = dis(v, &code).unwrap();
        assert_eq!(d.instrs[1].argval, Argval::Jump(6));

        let v = PyVersion::V3_10;
        let code = code_with(v, &[("LOAD_NAME", 0), ("POP_JUMP_IF_FALSE", 3), ("NOP", 0), ("LOAD_CONST", 0)]);
        let d = dis(v, &code).unwrap();
        assert_eq!(d.instrs[1].argval, Argval::Jump(6));
    }

    #[test]
    fn jump_into_the_middle_is_rejected() {
        let v = PyVersion::V3_12;
        let mut code = code_with(v, &[("JUMP_FORWARD", 1), ("LOAD_CONST", 300), ("RETURN_VALUE", 0)]);
        code.consts = vec![Value::None; 301];
        match dis(v, &code) {
            Err(DecompileError::InvalidJumpTarget { offset, target, .. }) => {
                assert_eq!(offset, 0);
                assert_eq!(target, 4);
            }
            other => panic!("expected invalid jump, got {other:?}"),
        }
    }

    #[test]
    fn caches_are_skipped() {
        let v = PyVersion::V3_12;
        let mut code = code_with(v, &[("LOAD_GLOBAL", 1), ("RETURN_VALUE", 0)]);
        // two inline cache units after LOAD_GLOBAL
        code.code.splice(2..2, [0u8, 0, 0, 0]);
        let d = dis(v, &code).unwrap();
        assert_eq!(d.instrs.len(), 2);
        assert_eq!(d.instrs[0].argval, Argval::Name("x".into()));
        assert!(d.instrs[0].pushes_null(v));
        assert_eq!(d.instrs[1].offset, 6);
    }

    #[test]
    fn compare_encodings() {
        for (v, arg) in [(PyVersion::V3_11, 2u32), (PyVersion::V3_12, 2 << 4), (PyVersion::V3_13, 2 << 5)] {
            let code = code_with(v, &[("COMPARE_OP", arg)]);
            let d = dis(v, &code).unwrap();
            assert_eq!(d.instrs[0].argval, Argval::Compare(CmpOp::Eq), "{v}");
        }
    }

    #[test]
    fn unknown_opcode_is_soft() {
        let v = PyVersion::V3_12;
        let mut code = code_with(v, &[("NOP", 0)]);
        code.code = vec![0xfe, 0x00];
        let d = dis(v, &code).unwrap();
        assert_eq!(d.instrs[0].op, Op::VersionSpecific);
        assert_eq!(d.diagnostics.len(), 1);
    }

    #[test]
    fn legacy_line_table() {
        let mut code = code_with(PyVersion::V3_10, &[("NOP", 0), ("NOP", 0), ("NOP", 0)]);
        code.firstlineno = 5;
        // 2 bytes at line 5, 4 bytes at line 7
        code.linetable = vec![2, 0, 4, 2];
        let d = dis(PyVersion::V3_10, &code).unwrap();
        let lines: Vec<_> = d.instrs.iter().map(|i| i.line).collect();
        assert_eq!(lines, vec![Some(5), Some(7), Some(7)]);
    }

    #[test]
    fn location_table() {
        let v = PyVersion::V3_11;
        let mut code = code_with(v, &[("NOP", 0), ("NOP", 0), ("NOP", 0)]);
        code.firstlineno = 1;
        // one-line form (+1, 1 unit), no-location (1 unit), long form with svarint +4
        code.linetable = vec![0x80 | (11 << 3), 0, 0, 0x80 | (15 << 3), 0x80 | (13 << 3), 8];
        let d = dis(v, &code).unwrap();
        let lines: Vec<_> = d.instrs.iter().map(|i| i.line).collect();
        assert_eq!(lines, vec![Some(2), None, Some(6)]);
    }

    #[test]
    fn exception_table_varints() {
        // start 2, length 3, target 10, depth 1 lasti
        let entries = parse_exception_table(&[0x80 | 2, 3, 10, 3]);
        assert_eq!(entries, vec![(4, 10, 20, 1, true)]);
        // two-chunk start value: (1 << 6) | 1
        let entries = parse_exception_table(&[0x80 | 0x40 | 1, 1, 1, 1, 0]);
        assert_eq!(entries, vec![(130, 132, 2, 0, false)]);
    }

    #[test]
    fn legacy_try_regions_are_synthesized() {
        let v = PyVersion::V3_10;
        let code = code_with(
            v,
            &[
                ("SETUP_FINALLY", 2),   // 0 -> handler at 6
                ("POP_BLOCK", 0),       // 2
                ("JUMP_FORWARD", 2),    // 4 -> 10
                ("POP_TOP", 0),         // 6
                ("POP_EXCEPT", 0),      // 8
                ("LOAD_CONST", 0),      // 10
                ("RETURN_VALUE", 0),    // 12
            ],
        );
        let d = dis(v, &code).unwrap();
        assert_eq!(d.exceptions.len(), 1);
        let e = &d.exceptions[0];
        assert_eq!((e.start, e.end, e.target, e.kind), (2, 4, 6, HandlerKind::Try));
    }

    #[test]
    fn await_loop_is_folded() {
        let v = PyVersion::V3_12;
        let code = code_with(
            v,
            &[
                ("LOAD_NAME", 0),                   // 0
                ("GET_AWAITABLE", 0),               // 2
                ("LOAD_CONST", 0),                  // 4
                ("SEND", 3),                        // 6 -> 14
                ("YIELD_VALUE", 2),                 // 8
                ("RESUME", 3),                      // 10
                ("JUMP_BACKWARD_NO_INTERRUPT", 4),  // 12 -> 6
                ("END_SEND", 0),                    // 14
                ("RETURN_VALUE", 0),                // 16
            ],
        );
        let d = dis(v, &code).unwrap();
        let names: Vec<_> = d.instrs.iter().map(|i| i.opname.as_str()).collect();
        assert_eq!(names, vec!["LOAD_NAME", "GET_AWAITABLE", "RETURN_VALUE"]);
    }

    #[test]
    fn loop_has_back_edge_and_single_entry() {
        let v = PyVersion::V3_12;
        let code = code_with(
            v,
            &[
                ("LOAD_NAME", 0),           // 0
                ("GET_ITER", 0),            // 2
                ("FOR_ITER", 2),            // 4 -> 10
                ("STORE_NAME", 1),          // 6
                ("JUMP_BACKWARD", 3),       // 8 -> 4
                ("END_FOR", 0),             // 10
                ("RETURN_CONST", 0),        // 12
            ],
        );
        let d = dis(v, &code).unwrap();
        let cfg = build_cfg(&d);
        assert_eq!(cfg.len(), 4);
        assert_eq!(cfg.back_edges(), vec![(2, 1)]);
        assert_eq!(cfg.entry_blocks(), vec![0]);
        assert!(matches!(cfg.blocks[1].terminator, Terminator::Branch { target: 3, next: 2 }));
        assert!(cfg.dominates(1, 3));
    }

    #[test]
    fn listing_marks_targets() {
        let v = PyVersion::V3_12;
        let code = code_with(v, &[("LOAD_NAME", 0), ("POP_JUMP_IF_FALSE", 0), ("RETURN_CONST", 0)]);
        let d = dis(v, &code).unwrap();
        let text = render_listing(&code, &d);
        assert!(text.contains(">> 00004 RETURN_CONST"), "{text}");
        assert!(text.contains("00000 LOAD_NAME                0 (x)"), "{text}");
    }
}
