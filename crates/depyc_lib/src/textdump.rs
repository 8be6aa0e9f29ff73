//! Raw text disassembly input: the `dis` module's listing format, consumed directly as
//! instruction sequences without going through the container reader.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::ast::{BinOp, CmpOp};
use crate::disasm::{self, Argval, Disassembly, ExceptionEntry, HandlerKind, Instruction};
use crate::error::{DecompileError, Diagnostic};
use crate::marshal::{CodeFlags, CodeObject, Value};
use crate::opcodes::{classify, JumpKind, Op};
use crate::version::PyVersion;

/// A parsed dump: the synthetic root code object plus the decoded instructions of every
/// code object reachable from it.
#[derive(Debug)]
pub struct Dump {
    pub version: PyVersion,
    pub root: Arc<CodeObject>,
    disassemblies: HashMap<usize, Disassembly>,
}

impl Dump {
    pub fn disassembly_for(&self, code: &Arc<CodeObject>) -> Option<&Disassembly> {
        self.disassemblies.get(&(Arc::as_ptr(code) as usize))
    }
}

/// Operand as written in the dump, before offsets are known.
#[derive(Debug, Clone)]
enum Operand {
    Jump(JumpRef),
    Const(String),
    Other(String),
}

#[derive(Debug, Clone)]
enum JumpRef {
    Offset(u32),
    Label(String),
}

#[derive(Debug, Clone)]
struct DumpInstr {
    source_line: usize,
    offset: Option<u32>,
    labels: Vec<String>,
    line: Option<u32>,
    name: String,
    arg: u32,
    operand: Operand,
}

#[derive(Debug, Clone)]
struct RawEntry {
    source_line: usize,
    start: JumpRef,
    end: JumpRef,
    inclusive_end: bool,
    target: JumpRef,
    depth: u32,
    lasti: bool,
}

#[derive(Debug, Clone, Default)]
struct Section {
    name: String,
    key: String,
    firstlineno: u32,
    filename: String,
    instrs: Vec<DumpInstr>,
    entries: Vec<RawEntry>,
}

pub fn parse_dump(text: &str, version: PyVersion) -> Result<Dump, DecompileError> {
    let sections = split_sections(text)?;
    if sections.iter().all(|s| s.instrs.is_empty()) {
        return Err(DecompileError::MalformedDump { line: 1, reason: "no instructions found".into() });
    }
    let mut builder = Builder { version, sections, built: HashMap::new(), disassemblies: HashMap::new() };
    let root = builder.build(0)?;
    debug!(sections = builder.sections.len(), version = %version, "text dump parsed");
    Ok(Dump { version, root, disassemblies: builder.disassemblies })
}

fn split_sections(text: &str) -> Result<Vec<Section>, DecompileError> {
    let mut sections = vec![Section { name: "<module>".into(), key: "<module>".into(), firstlineno: 1, ..Default::default() }];
    let mut in_table = false;
    let mut pending_labels: Vec<String> = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let lineno = i + 1;
        let line = raw.trim_end();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("Disassembly of ") {
            let (name, key, firstlineno, filename) = parse_code_header(rest)
                .ok_or_else(|| DecompileError::MalformedDump { line: lineno, reason: format!("bad section header {trimmed:?}") })?;
            sections.push(Section { name, key, firstlineno, filename, ..Default::default() });
            in_table = false;
            pending_labels.clear();
            continue;
        }
        if trimmed.starts_with("ExceptionTable:") {
            in_table = true;
            continue;
        }
        let Some(current) = sections.last_mut() else { continue };
        if in_table {
            if let Some(entry) = parse_table_entry(trimmed, lineno) {
                current.entries.push(entry);
                continue;
            }
            in_table = false;
        }
        match parse_instr_line(trimmed, lineno)? {
            ParsedLine::Label(l) => pending_labels.push(l),
            ParsedLine::Instr(mut ins) => {
                ins.labels.splice(0..0, pending_labels.drain(..));
                current.instrs.push(ins);
            }
        }
    }
    for s in &mut sections {
        resolve_number_columns(s);
    }
    if sections.len() > 1 && sections[0].instrs.is_empty() {
        sections.remove(0);
    }
    Ok(sections)
}

/// `<code object NAME at 0xADDR, file "FILE", line N>:`
fn parse_code_header(rest: &str) -> Option<(String, String, u32, String)> {
    let body = rest.trim_end_matches(':').trim();
    let body = body.strip_prefix("<code object ")?.strip_suffix('>')?;
    let (name, tail) = match body.find(" at ") {
        Some(pos) => (&body[..pos], &body[pos + 4..]),
        None => (body.split(',').next()?, ""),
    };
    let addr = tail.split(',').next().unwrap_or("").trim();
    let filename = tail
        .split("file \"")
        .nth(1)
        .and_then(|f| f.split('"').next())
        .unwrap_or("<dump>")
        .to_string();
    let firstlineno = tail
        .rsplit("line ")
        .next()
        .and_then(|l| l.trim().parse().ok())
        .unwrap_or(1);
    let key = if addr.is_empty() { name.to_string() } else { addr.to_string() };
    Some((name.to_string(), key, firstlineno, filename))
}

fn code_ref_key(argrepr: &str) -> Option<String> {
    let body = argrepr.strip_prefix("<code object ")?;
    let body = body.strip_suffix('>').unwrap_or(body);
    Some(match body.find(" at ") {
        Some(pos) => body[pos + 4..].split(',').next().unwrap_or("").trim().to_string(),
        None => body.split(',').next().unwrap_or(body).trim().to_string(),
    })
}

fn parse_ref(tok: &str) -> Option<JumpRef> {
    let tok = tok.trim();
    if let Some(l) = tok.strip_prefix('L') {
        if !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()) {
            return Some(JumpRef::Label(tok.to_string()));
        }
    }
    tok.parse().ok().map(JumpRef::Offset)
}

/// `A to B -> C [depth] lasti`
fn parse_table_entry(s: &str, lineno: usize) -> Option<RawEntry> {
    let (range, rest) = s.split_once("->")?;
    let (a, b) = range.split_once(" to ")?;
    let rest = rest.trim();
    let (target, tail) = rest.split_once('[')?;
    let (depth, flags) = tail.split_once(']')?;
    let end = parse_ref(b)?;
    Some(RawEntry {
        source_line: lineno,
        start: parse_ref(a)?,
        inclusive_end: matches!(end, JumpRef::Offset(_)),
        end,
        target: parse_ref(target)?,
        depth: depth.trim().parse().ok()?,
        lasti: flags.contains("lasti"),
    })
}

enum ParsedLine {
    Label(String),
    Instr(DumpInstr),
}

fn is_opname(tok: &str) -> bool {
    tok.len() > 1
        && tok.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && tok.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn parse_instr_line(s: &str, lineno: usize) -> Result<ParsedLine, DecompileError> {
    let mut numbers: Vec<u32> = Vec::new();
    let mut labels: Vec<String> = Vec::new();
    let mut rest = s;
    loop {
        rest = rest.trim_start();
        let tok_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let tok = &rest[..tok_end];
        if tok.is_empty() {
            return match labels.pop() {
                Some(l) if numbers.is_empty() => Ok(ParsedLine::Label(l)),
                _ => Err(DecompileError::MalformedDump { line: lineno, reason: format!("no operation name in {s:?}") }),
            };
        }
        if is_opname(tok) {
            break;
        }
        if tok == ">>" || tok == "-->" {
        } else if let Some(l) = tok.strip_suffix(':') {
            labels.push(l.to_string());
        } else if let Ok(n) = tok.parse::<u32>() {
            numbers.push(n);
        } else if tok.starts_with('[') || tok == "--" {
            // 3.13 `show_positions` columns and missing line markers
        } else {
            return Err(DecompileError::MalformedDump { line: lineno, reason: format!("unexpected token {tok:?}") });
        }
        rest = &rest[tok_end..];
    }

    let rest = rest.trim_start();
    let name_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let name = rest[..name_end].to_string();
    let mut tail = rest[name_end..].trim();
    let mut arg = 0u32;
    let arg_end = tail.find(char::is_whitespace).unwrap_or(tail.len());
    if let Ok(n) = tail[..arg_end].parse::<u32>() {
        arg = n;
        tail = tail[arg_end..].trim();
    }
    let argrepr = tail.strip_prefix('(').and_then(|t| t.strip_suffix(')')).unwrap_or(tail).to_string();

    let (op, jump) = classify(&name, PyVersion::V3_12);
    let operand = if jump != JumpKind::None || op == Op::ForIter || op == Op::Send {
        match argrepr.strip_prefix("to ").and_then(parse_ref) {
            Some(r) => Operand::Jump(r),
            None => Operand::Other(argrepr),
        }
    } else if matches!(op, Op::LoadConst | Op::ReturnConst | Op::KwNames) {
        Operand::Const(argrepr)
    } else {
        Operand::Other(argrepr)
    };

    // (line, offset) are told apart once the whole section is known.
    let mut ins = DumpInstr { source_line: lineno, offset: None, labels, line: None, name, arg, operand };
    match numbers.as_slice() {
        [] => {}
        [one] => ins.offset = Some(*one),
        [line, offset, ..] => {
            ins.line = Some(*line);
            ins.offset = Some(*offset);
        }
    }
    // A lone number is provisionally an offset; `resolve_number_columns` may demote it.
    if numbers.len() == 1 {
        ins.line = Some(u32::MAX);
    }
    Ok(ParsedLine::Instr(ins))
}

/// A lone number is an offset only when every instruction carries one and they ascend in
/// code units; otherwise the dump has no offset column and the number is a line.
fn resolve_number_columns(s: &mut Section) {
    let has_offsets = s.instrs.iter().all(|i| i.offset.is_some_and(|o| o % 2 == 0))
        && s.instrs.windows(2).all(|w| w[0].offset < w[1].offset);
    let mut last_line = None;
    for ins in &mut s.instrs {
        if ins.line == Some(u32::MAX) {
            if has_offsets {
                ins.line = None;
            } else {
                ins.line = ins.offset.take();
            }
        }
        if !has_offsets {
            ins.offset = None;
        }
        match ins.line {
            Some(l) => last_line = Some(l),
            None => ins.line = last_line,
        }
    }
}

struct Builder {
    version: PyVersion,
    sections: Vec<Section>,
    built: HashMap<String, Arc<CodeObject>>,
    disassemblies: HashMap<usize, Disassembly>,
}

impl Builder {
    fn build(&mut self, idx: usize) -> Result<Arc<CodeObject>, DecompileError> {
        let section = self.sections[idx].clone();
        if let Some(done) = self.built.get(&section.key) {
            return Ok(done.clone());
        }

        let mut offsets = Vec::with_capacity(section.instrs.len());
        let mut labels: HashMap<String, u32> = HashMap::new();
        for (i, ins) in section.instrs.iter().enumerate() {
            let off = ins.offset.unwrap_or(i as u32 * 2);
            offsets.push(off);
            for l in &ins.labels {
                labels.insert(l.clone(), off);
            }
        }
        let resolve = |r: &JumpRef, line: usize| -> Result<u32, DecompileError> {
            match r {
                JumpRef::Offset(o) => Ok(*o),
                JumpRef::Label(l) => labels
                    .get(l)
                    .copied()
                    .ok_or_else(|| DecompileError::MalformedDump { line, reason: format!("unknown label {l}") }),
            }
        };

        let mut code = CodeObject::empty(&section.name);
        code.filename = section.filename.clone();
        code.firstlineno = section.firstlineno;
        let mut names = Interner::default();
        let mut fast = Interner::default();

        let mut instrs = Vec::with_capacity(section.instrs.len());
        let mut diagnostics = Vec::new();
        for (i, d) in section.instrs.iter().enumerate() {
            let (op, _) = classify(&d.name, self.version);
            if op == Op::VersionSpecific {
                diagnostics.push(Diagnostic::UnknownOpcode {
                    scope: section.name.clone(),
                    opname: d.name.clone(),
                    offset: offsets[i],
                });
            }
            let argval = match &d.operand {
                Operand::Jump(r) => Argval::Jump(resolve(r, d.source_line)?),
                Operand::Const(text) => {
                    let value = match code_ref_key(text) {
                        Some(key) => {
                            let child = self
                                .sections
                                .iter()
                                .position(|s| s.key == key || s.name == key)
                                .ok_or_else(|| DecompileError::MalformedDump {
                                    line: d.source_line,
                                    reason: format!("no disassembly section for {text}"),
                                })?;
                            Value::Code(self.build(child)?)
                        }
                        None => parse_literal(text).unwrap_or_else(|| Value::Long(text.clone())),
                    };
                    code.consts.push(value);
                    Argval::Const(code.consts.len() - 1)
                }
                Operand::Other(text) => operand_argval(op, d.arg, text, self.version, &mut names, &mut fast),
            };
            instrs.push(Instruction {
                offset: offsets[i],
                op,
                opname: d.name.clone(),
                arg: d.arg,
                argval,
                line: d.line,
            });
        }
        let known: std::collections::HashSet<u32> = offsets.iter().copied().collect();
        for ins in &instrs {
            if let Some(t) = ins.target() {
                if !known.contains(&t) {
                    return Err(DecompileError::InvalidJumpTarget { code: section.name.clone(), offset: ins.offset, target: t });
                }
            }
        }

        let table = if section.entries.is_empty() && self.version == PyVersion::V3_10 {
            None
        } else {
            let mut entries = Vec::with_capacity(section.entries.len());
            for e in &section.entries {
                let mut end = resolve(&e.end, e.source_line)?;
                if e.inclusive_end {
                    end += 2;
                }
                entries.push(ExceptionEntry {
                    start: resolve(&e.start, e.source_line)?,
                    end,
                    target: resolve(&e.target, e.source_line)?,
                    depth: e.depth,
                    lasti: e.lasti,
                    kind: HandlerKind::Cleanup,
                });
            }
            Some(entries)
        };

        code.names = names.items;
        infer_locals(&mut code, &instrs, fast.items, idx == 0);
        let dis = disasm::finish(&code, self.version, instrs, table, diagnostics)?;
        infer_flags(&mut code, &dis, idx == 0);

        let code = Arc::new(code);
        self.disassemblies.insert(Arc::as_ptr(&code) as usize, dis);
        self.built.insert(section.key.clone(), code.clone());
        Ok(code)
    }
}

#[derive(Default)]
struct Interner {
    items: Vec<String>,
}

impl Interner {
    fn add(&mut self, s: &str) -> String {
        if !self.items.iter().any(|i| i == s) {
            self.items.push(s.to_string());
        }
        s.to_string()
    }
}

fn operand_argval(op: Op, arg: u32, text: &str, version: PyVersion, names: &mut Interner, fast: &mut Interner) -> Argval {
    let strip_null = |t: &str| -> String {
        let t = t.trim();
        let t = t.strip_prefix("NULL|self + ").or_else(|| t.strip_prefix("NULL + ")).unwrap_or(t);
        let t = t.strip_suffix(" + NULL|self").or_else(|| t.strip_suffix(" + NULL")).unwrap_or(t);
        t.to_string()
    };
    match op {
        Op::LoadGlobal | Op::LoadAttr | Op::LoadMethod => Argval::Name(names.add(&strip_null(text))),
        Op::LoadSuperAttr => {
            let t = strip_null(text);
            let name = t.rsplit('.').next().unwrap_or(&t).to_string();
            Argval::Name(names.add(&name))
        }
        Op::LoadName
        | Op::StoreName
        | Op::DeleteName
        | Op::StoreGlobal
        | Op::DeleteGlobal
        | Op::StoreAttr
        | Op::DeleteAttr
        | Op::ImportName
        | Op::ImportFrom
        | Op::LoadFromDictOrGlobals => Argval::Name(names.add(text.trim())),
        Op::LoadFast | Op::StoreFast | Op::DeleteFast | Op::LoadFastAndClear => Argval::Name(fast.add(text.trim())),
        Op::LoadDeref | Op::StoreDeref | Op::DeleteDeref | Op::LoadClosure | Op::LoadFromDictOrDeref | Op::MakeCell => {
            Argval::Name(text.trim().to_string())
        }
        Op::LoadFastLoadFast | Op::StoreFastLoadFast | Op::StoreFastStoreFast => {
            let (a, b) = text.split_once(',').unwrap_or((text, ""));
            Argval::NamePair(fast.add(a.trim()), fast.add(b.trim()))
        }
        Op::CompareOp => {
            let t = text.trim();
            let t = t.strip_prefix("bool(").and_then(|x| x.strip_suffix(')')).unwrap_or(t);
            CmpOp::from_symbol(t).map(Argval::Compare).unwrap_or(Argval::Raw(arg))
        }
        Op::IsOp => Argval::Compare(if arg == 1 { CmpOp::IsNot } else { CmpOp::Is }),
        Op::ContainsOp => Argval::Compare(if arg == 1 { CmpOp::NotIn } else { CmpOp::In }),
        Op::BinaryOp if version >= PyVersion::V3_14 && arg == 26 => Argval::Subscr,
        Op::BinaryOp => match BinOp::from_nb(arg) {
            Some((b, inplace)) => Argval::Binary(b, inplace),
            None => Argval::Raw(arg),
        },
        Op::Binary(b) => Argval::Binary(b, false),
        Op::Inplace(b) => Argval::Binary(b, true),
        _ => Argval::Raw(arg),
    }
}

/// Dumps carry no signature: parameters are the fast locals read before any store,
/// in order of first use.
fn infer_locals(code: &mut CodeObject, instrs: &[Instruction], fast: Vec<String>, is_module: bool) {
    let mut first_is_load: Vec<(String, bool)> = Vec::new();
    let mut touch = |name: &str, load: bool| {
        if !first_is_load.iter().any(|(n, _)| n == name) {
            first_is_load.push((name.to_string(), load));
        }
    };
    let mut cells: Vec<String> = Vec::new();
    let mut closures: Vec<String> = Vec::new();
    let mut deref_first: Vec<(String, bool)> = Vec::new();
    for ins in instrs {
        match (&ins.op, &ins.argval) {
            (Op::LoadFast, Argval::Name(n)) => touch(n, true),
            (Op::StoreFast | Op::DeleteFast | Op::LoadFastAndClear, Argval::Name(n)) => touch(n, false),
            (Op::LoadFastLoadFast, Argval::NamePair(a, b)) => {
                touch(a, true);
                touch(b, true);
            }
            (Op::StoreFastLoadFast, Argval::NamePair(a, b)) => {
                touch(a, false);
                touch(b, true);
            }
            (Op::StoreFastStoreFast, Argval::NamePair(a, b)) => {
                touch(a, false);
                touch(b, false);
            }
            (Op::MakeCell, Argval::Name(n)) => cells.push(n.clone()),
            (Op::LoadClosure, Argval::Name(n)) => closures.push(n.clone()),
            (Op::LoadDeref | Op::StoreDeref | Op::DeleteDeref | Op::LoadFromDictOrDeref, Argval::Name(n)) => {
                if !deref_first.iter().any(|(d, _)| d == n) {
                    deref_first.push((n.clone(), matches!(ins.op, Op::LoadDeref | Op::LoadFromDictOrDeref)));
                }
            }
            _ => {}
        }
    }
    // Class bodies run in a namespace dict and never touch fast locals for their own names.
    let namespace = instrs.iter().any(|i| matches!(i.op, Op::StoreName | Op::LoadLocals));
    if is_module || namespace {
        code.varnames = fast;
        code.fast_names = code.varnames.clone();
        code.cellvars = cells;
        for (n, _) in deref_first {
            if !code.cellvars.contains(&n) && !code.freevars.contains(&n) {
                code.freevars.push(n);
            }
        }
        code.deref_names = code.cellvars.iter().chain(code.freevars.iter()).cloned().collect();
        return;
    }
    let mut params: Vec<String> = first_is_load.iter().filter(|(_, l)| *l).map(|(n, _)| n.clone()).collect();
    for (n, load) in &deref_first {
        if *load && cells.contains(n) && !params.contains(n) {
            params.push(n.clone());
        }
    }
    let mut varnames = params.clone();
    for n in fast.iter().chain(cells.iter()) {
        if !varnames.contains(n) {
            varnames.push(n.clone());
        }
    }
    for (n, load) in &deref_first {
        let is_cell = cells.contains(n) || closures.contains(n) || !*load;
        if is_cell {
            if !code.cellvars.contains(n) {
                code.cellvars.push(n.clone());
            }
        } else if !code.freevars.contains(n) {
            code.freevars.push(n.clone());
        }
    }
    for n in closures {
        if !code.cellvars.contains(&n) && !code.freevars.contains(&n) {
            code.cellvars.push(n);
        }
    }
    code.argcount = params.len() as u32;
    code.varnames = varnames;
    code.fast_names = code.varnames.clone();
    code.deref_names = code.cellvars.iter().chain(code.freevars.iter()).cloned().collect();
    code.flags = CodeFlags(CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS);
}

fn infer_flags(code: &mut CodeObject, dis: &Disassembly, is_module: bool) {
    if is_module || code.flags.0 == 0 {
        return;
    }
    let has = |ops: &[Op]| dis.instrs.iter().any(|i| ops.contains(&i.op));
    let yields = has(&[Op::YieldValue, Op::YieldFrom, Op::GetYieldFromIter]);
    let awaits = has(&[Op::GetAwaitable, Op::BeforeAsyncWith, Op::GetAiter, Op::GetAnext]);
    code.flags.0 |= match (yields, awaits) {
        (true, true) => CodeFlags::ASYNC_GENERATOR,
        (false, true) => CodeFlags::COROUTINE,
        (true, false) => CodeFlags::GENERATOR,
        (false, false) => 0,
    };
}

/// Parse a Python literal as printed by `repr`.
pub fn parse_literal(text: &str) -> Option<Value> {
    let mut p = LiteralParser { s: text.trim().as_bytes(), pos: 0 };
    let v = p.value()?;
    p.skip_ws();
    (p.pos == p.s.len()).then_some(v)
}

struct LiteralParser<'a> {
    s: &'a [u8],
    pos: usize,
}

impl LiteralParser<'_> {
    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c == b' ') {
            self.pos += 1;
        }
    }

    fn eat(&mut self, lit: &str) -> bool {
        if self.s[self.pos..].starts_with(lit.as_bytes()) {
            self.pos += lit.len();
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_ws();
        for (word, v) in [
            ("None", Value::None),
            ("True", Value::Bool(true)),
            ("False", Value::Bool(false)),
            ("Ellipsis", Value::Ellipsis),
            ("...", Value::Ellipsis),
        ] {
            if self.eat(word) {
                return Some(v);
            }
        }
        if self.eat("frozenset({") {
            let (items, _) = self.items(b'}')?;
            return self.eat(")").then_some(Value::FrozenSet(items));
        }
        if self.eat("frozenset()") {
            return Some(Value::FrozenSet(Vec::new()));
        }
        match self.peek()? {
            b'(' => {
                self.pos += 1;
                let (mut items, trailing_comma) = self.items(b')')?;
                // `(1+2j)` is a parenthesized complex, not a tuple
                if items.len() == 1 && !trailing_comma {
                    return items.pop();
                }
                Some(Value::Tuple(items))
            }
            b'[' => {
                self.pos += 1;
                Some(Value::List(self.items(b']')?.0))
            }
            b'\'' | b'"' => self.string(false).map(Value::Str),
            b'b' if matches!(self.s.get(self.pos + 1), Some(b'\'' | b'"')) => {
                self.pos += 1;
                self.string(true).map(|s| Value::Bytes(s.chars().map(|c| c as u32 as u8).collect()))
            }
            b'-' | b'0'..=b'9' => self.number(),
            _ => None,
        }
    }

    fn items(&mut self, close: u8) -> Option<(Vec<Value>, bool)> {
        let mut out = Vec::new();
        let mut trailing_comma = false;
        loop {
            self.skip_ws();
            if self.peek()? == close {
                self.pos += 1;
                return Some((out, trailing_comma));
            }
            out.push(self.value()?);
            self.skip_ws();
            trailing_comma = false;
            match self.peek()? {
                b',' => {
                    self.pos += 1;
                    trailing_comma = true;
                }
                c if c == close => {}
                _ => return None,
            }
        }
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'.' || c == b'-' || c == b'+' || c == b'_')
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.s[start..self.pos]).ok()?;
        if let Some(im) = text.strip_suffix('j') {
            let split = im.char_indices().skip(1).filter(|(_, c)| *c == '+' || *c == '-').last();
            return match split {
                Some((at, _)) if !im[..at].ends_with('e') => {
                    Some(Value::Complex(im[..at].parse().ok()?, im[at..].parse().ok()?))
                }
                _ => im.parse::<f64>().ok().map(|v| Value::Complex(0.0, v)),
            };
        }
        if let Ok(v) = text.parse::<i64>() {
            return Some(Value::Int(v));
        }
        if text.chars().all(|c| c.is_ascii_digit() || c == '-') {
            return Some(Value::Long(text.to_string()));
        }
        text.parse::<f64>().ok().map(Value::Float)
    }

    fn string(&mut self, bytes: bool) -> Option<String> {
        let quote = self.peek()?;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let c = self.peek()?;
            self.pos += 1;
            if c == quote {
                return Some(out);
            }
            if c != b'\\' {
                if c < 0x80 {
                    out.push(c as char);
                } else {
                    // multi-byte UTF-8 sequence
                    let start = self.pos - 1;
                    let mut end = self.pos;
                    while self.s.get(end).is_some_and(|b| b & 0xc0 == 0x80) {
                        end += 1;
                    }
                    out.push_str(std::str::from_utf8(&self.s[start..end]).ok()?);
                    self.pos = end;
                }
                continue;
            }
            let e = self.peek()?;
            self.pos += 1;
            match e {
                b'n' => out.push('\n'),
                b't' => out.push('\t'),
                b'r' => out.push('\r'),
                b'0' => out.push('\0'),
                b'\\' | b'\'' | b'"' => out.push(e as char),
                b'x' => out.push(char::from_u32(self.hex(2)?)?),
                b'u' if !bytes => out.push(char::from_u32(self.hex(4)?)?),
                b'U' if !bytes => out.push(char::from_u32(self.hex(8)?)?),
                other => {
                    out.push('\\');
                    out.push(other as char);
                }
            }
        }
    }

    fn hex(&mut self, n: usize) -> Option<u32> {
        let digits = std::str::from_utf8(self.s.get(self.pos..self.pos + n)?).ok()?;
        self.pos += n;
        u32::from_str_radix(digits, 16).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_312: &str = r#"
  0           0 RESUME                   0

  1           2 LOAD_CONST               0 (<code object f at 0x7f01, file "t.py", line 1>)
              4 MAKE_FUNCTION            0
              6 STORE_NAME               0 (f)
              8 RETURN_CONST             1 (None)

Disassembly of <code object f at 0x7f01, file "t.py", line 1>:
  1           0 RESUME                   0

  2           2 LOAD_FAST                0 (a)
              4 POP_JUMP_IF_FALSE        2 (to 10)
              6 LOAD_CONST               1 ('yes')
              8 RETURN_VALUE
        >>   10 LOAD_FAST                1 (b)
             12 RETURN_VALUE
"#;

    #[test]
    fn sections_and_params() {
        let dump = parse_dump(LISTING_312, PyVersion::V3_12).unwrap();
        assert_eq!(dump.root.name, "<module>");
        let f = dump.root.nested().next().unwrap().clone();
        assert_eq!(f.name, "f");
        assert_eq!(f.firstlineno, 1);
        assert_eq!(f.argcount, 2);
        assert_eq!(f.varnames, vec!["a".to_string(), "b".to_string()]);
        let dis = dump.disassembly_for(&f).unwrap();
        assert_eq!(dis.instrs[2].argval, Argval::Jump(10));
        assert_eq!(dis.instrs[3].line, Some(2));
        assert_eq!(f.consts[0], Value::Str("yes".into()));
    }

    #[test]
    fn labels_without_offsets() {
        let text = "  1           LOAD_NAME                0 (x)\n              POP_JUMP_IF_FALSE        2 (to L1)\n              LOAD_CONST               0 (1)\n              RETURN_VALUE\n  2   L1:     RETURN_CONST             1 (None)\n";
        let dump = parse_dump(text, PyVersion::V3_13).unwrap();
        let dis = dump.disassembly_for(&dump.root).unwrap();
        assert_eq!(dis.instrs.len(), 5);
        assert_eq!(dis.instrs[1].argval, Argval::Jump(8));
        assert_eq!(dis.instrs[4].line, Some(2));
    }

    #[test]
    fn exception_table_section() {
        let text = "\
  1           0 NOP
  2           2 LOAD_NAME                0 (x)
              4 POP_TOP
              6 RETURN_CONST             0 (None)
        >>    8 PUSH_EXC_INFO
             10 POP_TOP
             12 POP_EXCEPT
             14 RETURN_CONST             0 (None)
ExceptionTable:
  2 to 4 -> 8 [0]
";
        let dump = parse_dump(text, PyVersion::V3_12).unwrap();
        let dis = dump.disassembly_for(&dump.root).unwrap();
        assert_eq!(dis.exceptions.len(), 1);
        let e = &dis.exceptions[0];
        assert_eq!((e.start, e.end, e.target, e.kind), (2, 6, 8, HandlerKind::Try));
    }

    #[test]
    fn garbage_is_malformed() {
        match parse_dump("  1    0 LOAD_CONST 0 (1)\n  what is this\n", PyVersion::V3_12) {
            Err(DecompileError::MalformedDump { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed dump, got {other:?}"),
        }
    }

    #[test]
    fn literals() {
        assert_eq!(parse_literal("None"), Some(Value::None));
        assert_eq!(parse_literal("-3"), Some(Value::Int(-3)));
        assert_eq!(parse_literal("2.5"), Some(Value::Float(2.5)));
        assert_eq!(parse_literal("'a\\'b'"), Some(Value::Str("a'b".into())));
        assert_eq!(
            parse_literal("('a', 1)"),
            Some(Value::Tuple(vec![Value::Str("a".into()), Value::Int(1)]))
        );
        assert_eq!(parse_literal("(1,)"), Some(Value::Tuple(vec![Value::Int(1)])));
        assert_eq!(parse_literal("b'\\x00'"), Some(Value::Bytes(vec![0])));
        assert_eq!(parse_literal("frozenset({1, 2})"), Some(Value::FrozenSet(vec![Value::Int(1), Value::Int(2)])));
        assert_eq!(parse_literal("(1+2j)"), Some(Value::Complex(1.0, 2.0)));
        assert_eq!(parse_literal("what"), None);
    }
}
