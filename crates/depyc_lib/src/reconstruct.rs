//! Control-flow structuring. Blocks are walked in layout order; branch, loop and handler
//! shapes become `if`/`while`/`for`/`try`/`with`, and anything unmatched degrades to a
//! labelled goto instead of failing the scope.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, trace};

use crate::ast::{
    visit_bodies_mut, BoolOp, CompKind, ExceptHandler, Expr, FunctionValue, Generator, Stmt, WithItem,
};
use crate::disasm::{build_cfg, Argval, Cfg, Disassembly, HandlerKind, Instruction, Terminator};
use crate::error::Diagnostic;
use crate::marshal::{CodeFlags, CodeObject, Value};
use crate::opcodes::Op;
use crate::scope::{CodeTree, ScopeMap};
use crate::translate::{bool_op, params_for, Exit, Translator};
use crate::version::PyVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionExit {
    /// Ran off the end of the region.
    Fall,
    /// Left through a jump to a block at or past the region end.
    Jump(usize),
    /// Every path returned, raised or transferred loop control.
    Done,
}

struct Region {
    stmts: Vec<Stmt>,
    stack: Vec<Expr>,
    exit: RegionExit,
}

enum Next {
    At(usize),
    Leave(RegionExit),
}

struct LoopCtx {
    header: usize,
    continues: Vec<usize>,
    breaks: Vec<usize>,
    /// Blocks that repeat the code after the loop instead of jumping to it.
    copies: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct TryInfo {
    /// First block of the protected body.
    start: usize,
    /// One past the last protected block.
    end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    For,
    AsyncFor { follow: usize },
    While { last: usize },
}

/// Statements of one code object plus what went wrong while structuring it.
#[derive(Debug, Clone)]
pub struct Structured {
    pub body: Vec<Stmt>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Structure one code object's disassembly into statements.
pub fn structure(tree: &CodeTree, node: usize, dis: &Disassembly) -> Structured {
    let cfg = build_cfg(dis);
    let mut seeds: BTreeSet<usize> = BTreeSet::new();
    let mut result = None;
    // Goto targets discovered late are seeded so the next pass labels them.
    for _ in 0..3 {
        let mut r = Reconstructor::new(tree, node, dis.version, &cfg, seeds.clone());
        let body = r.run();
        let fresh: Vec<usize> = r.gotos.difference(&seeds).copied().collect();
        let mut diagnostics = r.tr.take_diagnostics();
        diagnostics.extend(r.diagnostics.drain(..));
        result = Some(Structured { body, diagnostics });
        if fresh.is_empty() {
            break;
        }
        seeds.extend(fresh);
    }
    let mut out = result.unwrap_or(Structured { body: Vec::new(), diagnostics: Vec::new() });
    tidy(&mut out.body);
    debug!(code = %tree.nodes[node].code.qualname, stmts = out.body.len(), "structured");
    out
}

struct Reconstructor<'a> {
    cfg: &'a Cfg,
    tr: Translator<'a>,
    version: PyVersion,
    scope: String,
    live: Vec<bool>,
    emitted: Vec<bool>,
    skip: HashMap<usize, usize>,
    loops: Vec<LoopCtx>,
    back_edges: HashMap<usize, Vec<usize>>,
    merged_headers: HashSet<usize>,
    tries: HashMap<usize, TryInfo>,
    consumed: HashSet<usize>,
    /// Joins laid out between a try body and its handler, innermost last.
    try_joins: Vec<usize>,
    seeds: BTreeSet<usize>,
    gotos: BTreeSet<usize>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Reconstructor<'a> {
    fn new(tree: &'a CodeTree, node: usize, version: PyVersion, cfg: &'a Cfg, seeds: BTreeSet<usize>) -> Self {
        let mut roots = vec![0];
        for e in &cfg.exceptions {
            if matches!(e.kind, HandlerKind::Try | HandlerKind::AsyncFor) {
                if let Some(b) = cfg.block_at(e.target) {
                    roots.push(b);
                }
            }
        }
        let live = if cfg.is_empty() { Vec::new() } else { cfg.reachable(&roots) };
        let mut back_edges: HashMap<usize, Vec<usize>> = HashMap::new();
        for (from, to) in cfg.back_edges() {
            back_edges.entry(to).or_default().push(from);
        }
        let mut r = Reconstructor {
            cfg,
            tr: Translator::new(tree, node, version),
            version,
            scope: tree.nodes[node].code.qualname.clone(),
            emitted: vec![false; cfg.len()],
            live,
            skip: HashMap::new(),
            loops: Vec::new(),
            back_edges,
            merged_headers: HashSet::new(),
            tries: HashMap::new(),
            consumed: HashSet::new(),
            try_joins: Vec::new(),
            seeds,
            gotos: BTreeSet::new(),
            diagnostics: Vec::new(),
        };
        r.tries = r.find_tries();
        r
    }

    fn run(&mut self) -> Vec<Stmt> {
        if self.cfg.is_empty() {
            return Vec::new();
        }
        let n = self.cfg.len();
        self.region(0, n, Vec::new()).stmts
    }

    fn offset(&self, b: usize) -> u32 {
        self.cfg.blocks.get(b).map_or(0, |blk| blk.start)
    }

    fn goto(&mut self, stmts: &mut Vec<Stmt>, target: usize, cond: Option<Expr>) {
        let offset = self.offset(target);
        trace!(scope = %self.scope, offset, "unstructured jump");
        self.diagnostics.push(Diagnostic::UnrecognizedControlPattern { scope: self.scope.clone(), offset });
        self.gotos.insert(target);
        stmts.push(Stmt::Goto { target: offset, cond });
    }

    fn block(&mut self, b: usize, stack: Vec<Expr>) -> crate::translate::BlockOutput {
        let cfg = self.cfg;
        let instrs = &cfg.blocks[b].instrs;
        let skip = self.skip.get(&b).copied().unwrap_or(0).min(instrs.len());
        self.tr.translate(&instrs[skip..], stack)
    }

    fn first_op(&self, b: usize) -> Option<Op> {
        let instrs = &self.cfg.blocks.get(b)?.instrs;
        let skip = self.skip.get(&b).copied().unwrap_or(0);
        instrs.get(skip).map(|i| i.op)
    }

    fn region(&mut self, start: usize, end: usize, mut stack: Vec<Expr>) -> Region {
        let end = end.min(self.cfg.len());
        let mut stmts = Vec::new();
        let mut cur = start;
        while cur < end {
            if !self.live[cur] {
                cur += 1;
                continue;
            }
            if self.emitted[cur] {
                self.goto(&mut stmts, cur, None);
                return Region { stmts, stack, exit: RegionExit::Done };
            }
            if self.loops.last().is_some_and(|l| l.copies.contains(&cur)) {
                self.emitted[cur] = true;
                stmts.push(Stmt::Break);
                return Region { stmts, stack, exit: RegionExit::Done };
            }
            let next = match self.structured(cur, end, &mut stmts, &mut stack) {
                Some(n) => n,
                None => self.plain(cur, end, &mut stmts, &mut stack),
            };
            match next {
                Next::At(n) if n > end => return Region { stmts, stack, exit: RegionExit::Jump(n) },
                Next::At(n) => cur = n,
                Next::Leave(exit) => return Region { stmts, stack, exit },
            }
        }
        Region { stmts, stack, exit: RegionExit::Fall }
    }

    fn plain(&mut self, cur: usize, end: usize, stmts: &mut Vec<Stmt>, stack: &mut Vec<Expr>) -> Next {
        self.emitted[cur] = true;
        let out = self.block(cur, std::mem::take(stack));
        *stack = out.stack;
        if self.seeds.contains(&cur) {
            stmts.push(Stmt::RawBlock { label: self.offset(cur), body: out.stmts });
        } else {
            stmts.extend(out.stmts);
        }
        match out.exit {
            Exit::Fallthrough => match self.cfg.blocks[cur].terminator {
                Terminator::End => Next::Leave(RegionExit::Fall),
                _ => Next::At(cur + 1),
            },
            Exit::Return | Exit::Raise => Next::Leave(RegionExit::Done),
            Exit::Jump(off) => self.jump(stmts, cur, off, end),
            Exit::Branch { cond, jump_if_true, target, keep } => {
                self.branch(stmts, stack, cur, end, cond, jump_if_true, target, keep)
            }
            Exit::ForIter { target } => {
                let t = self.cfg.block_at(target).unwrap_or(cur + 1);
                self.goto(stmts, t, None);
                Next::Leave(RegionExit::Done)
            }
        }
    }

    /// Block a jump lands on once chains of bare unconditional jumps are followed.
    fn resolve_trampoline(&self, b: usize) -> usize {
        let mut cur = b;
        for _ in 0..4 {
            let Some(blk) = self.cfg.blocks.get(cur) else { break };
            let skip = self.skip.get(&cur).copied().unwrap_or(0);
            let real: Vec<_> = blk.instrs.iter().skip(skip).filter(|i| !i.op.is_bookkeeping()).collect();
            match (real.as_slice(), blk.terminator) {
                ([only], Terminator::Jump(t)) if only.op.is_unconditional_jump() => cur = t,
                _ => break,
            }
        }
        cur
    }

    /// The instructions run from `from` in block `b` through fallthroughs up to a return.
    fn exit_signature(&self, b: usize, from: usize) -> Option<Vec<(Op, Argval)>> {
        let mut sig = Vec::new();
        let mut cur = b;
        let mut from = from;
        for _ in 0..8 {
            let blk = self.cfg.blocks.get(cur)?;
            sig.extend(tail_signature(blk.instrs.get(from..)?));
            match blk.terminator {
                Terminator::Return => return Some(sig),
                Terminator::Fallthrough(n) => cur = n,
                _ => return None,
            }
            from = 0;
        }
        None
    }

    /// Returning blocks inside a loop that repeat its exit code: the compiler inlines
    /// short exits in place of the `break` jump.
    fn exit_copies(&self, body: std::ops::Range<usize>, follow: usize, follow_skip: usize, pops_iter: bool) -> Vec<usize> {
        let Some(exit) = self.exit_signature(follow, follow_skip) else { return Vec::new() };
        body.filter(|&b| self.live[b] && self.cfg.blocks[b].terminator == Terminator::Return)
            .filter(|&b| {
                let Some(mut sig) = self.exit_signature(b, 0) else { return false };
                if pops_iter {
                    if sig.first().map(|s| s.0) != Some(Op::PopTop) {
                        return false;
                    }
                    sig.remove(0);
                }
                sig == exit
            })
            .collect()
    }

    fn loop_control(&self, t: usize) -> Option<Stmt> {
        let ctx = self.loops.last()?;
        let resolved = self.resolve_trampoline(t);
        if ctx.continues.contains(&t) || ctx.continues.contains(&resolved) {
            Some(Stmt::Continue)
        } else if ctx.breaks.contains(&t) || ctx.breaks.contains(&resolved) {
            Some(Stmt::Break)
        } else {
            None
        }
    }

    fn jump(&mut self, stmts: &mut Vec<Stmt>, cur: usize, off: u32, end: usize) -> Next {
        let Some(t) = self.cfg.block_at(off) else {
            stmts.push(Stmt::Goto { target: off, cond: None });
            return Next::Leave(RegionExit::Done);
        };
        if let Some(ctrl) = self.loop_control(t) {
            stmts.push(ctrl);
            return Next::Leave(RegionExit::Done);
        }
        if t >= end {
            return Next::Leave(RegionExit::Jump(t));
        }
        if t < cur && self.try_joins.last().is_some_and(|&j| j == t || j == self.resolve_trampoline(t)) {
            return Next::Leave(RegionExit::Jump(t));
        }
        if t > cur && (cur + 1..t).all(|b| !self.live[b] || self.emitted[b]) {
            return Next::At(t);
        }
        self.goto(stmts, t, None);
        Next::Leave(RegionExit::Done)
    }

    #[allow(clippy::too_many_arguments)]
    fn branch(
        &mut self,
        stmts: &mut Vec<Stmt>,
        stack: &mut Vec<Expr>,
        cur: usize,
        end: usize,
        cond: Expr,
        jump_if_true: bool,
        target: u32,
        keep: bool,
    ) -> Next {
        let next = cur + 1;
        let Some(t) = self.cfg.block_at(target) else {
            stmts.push(Stmt::Goto { target, cond: Some(cond) });
            return Next::At(next);
        };
        let copied = !keep && stack.last() == Some(&cond) && self.first_op(next) == Some(Op::PopTop) && t > next;
        if keep || copied {
            if !jump_if_true {
                if let Some(n) = self.compare_chain_value(stack, next, end, &cond, t, copied) {
                    return n;
                }
            }
            return self.bool_join(stmts, stack, next, end, cond, jump_if_true, t, copied);
        }
        if let Some(n) = self.mixed_bool_value(stmts, stack, next, end, &cond, jump_if_true, t) {
            return n;
        }
        let jump_cond = if jump_if_true { cond.clone() } else { Expr::not(cond.clone()) };
        if let Some(ctrl) = self.loop_control(t) {
            if ctrl == Stmt::Continue {
                let rest = self.region(next, end, stack.clone());
                *stack = rest.stack;
                if rest.exit == RegionExit::Done {
                    stmts.push(Stmt::If { test: Expr::not(jump_cond), body: rest.stmts, orelse: Vec::new() });
                    return Next::Leave(RegionExit::Done);
                }
                stmts.push(Stmt::If { test: jump_cond, body: vec![Stmt::Continue], orelse: Vec::new() });
                stmts.extend(rest.stmts);
                return Next::Leave(rest.exit);
            }
            stmts.push(Stmt::If { test: jump_cond, body: vec![ctrl], orelse: Vec::new() });
            return Next::At(next);
        }
        let (test, body, els) = self.condition_chain(cur, cond, jump_if_true, t, stack);
        self.if_stmt(stmts, stack, end, test, body, els)
    }

    /// `a and b` / `a or b` used as a value: the right operand leaves one value and
    /// control rejoins at the jump target.
    #[allow(clippy::too_many_arguments)]
    fn bool_join(
        &mut self,
        stmts: &mut Vec<Stmt>,
        stack: &mut Vec<Expr>,
        next: usize,
        end: usize,
        cond: Expr,
        jump_if_true: bool,
        t: usize,
        copied: bool,
    ) -> Next {
        if copied {
            stack.pop();
            *self.skip.entry(next).or_insert(0) += 1;
        }
        let rhs = self.region(next, t.min(end), stack.clone());
        let joins = matches!(rhs.exit, RegionExit::Fall) || rhs.exit == RegionExit::Jump(t);
        if rhs.stmts.is_empty() && joins && rhs.stack.len() == stack.len() + 1 {
            let mut rstack = rhs.stack;
            let value = rstack.pop().unwrap_or_else(Expr::none);
            let op = if jump_if_true { BoolOp::Or } else { BoolOp::And };
            stack.push(bool_op(op, cond, value));
            return Next::At(t);
        }
        let test = if jump_if_true { Expr::not(cond) } else { cond };
        stmts.push(Stmt::If { test, body: rhs.stmts, orelse: Vec::new() });
        *stack = rhs.stack;
        match rhs.exit {
            RegionExit::Done => Next::At(t),
            RegionExit::Jump(j) => Next::At(j),
            RegionExit::Fall => Next::At(t),
        }
    }

    /// `a and b or c` on 3.10/3.11: the left group pops its tests and jumps straight to
    /// the right operand, while its last test keeps the value for the join.
    #[allow(clippy::too_many_arguments)]
    fn mixed_bool_value(
        &mut self,
        stmts: &mut Vec<Stmt>,
        stack: &mut Vec<Expr>,
        next: usize,
        end: usize,
        cond: &Expr,
        jump_if_true: bool,
        t: usize,
    ) -> Option<Next> {
        if t <= next || t >= end {
            return None;
        }
        let mut operands = vec![cond.clone()];
        let mut join = None;
        for b in next..t {
            if !self.live[b] || self.emitted[b] || self.cfg.blocks[b].preds != [b - 1] {
                return None;
            }
            let out = self.block(b, stack.clone());
            let Exit::Branch { cond, jump_if_true: jit, target, keep } = out.exit else { return None };
            if !out.stmts.is_empty() || out.stack != *stack {
                return None;
            }
            let tb = self.cfg.block_at(target)?;
            if b + 1 < t {
                if keep || jit != jump_if_true || tb != t {
                    return None;
                }
            } else if !keep || jit == jump_if_true || tb <= t {
                return None;
            } else {
                join = Some(tb);
            }
            operands.push(cond);
        }
        let j = join?;
        for b in next..t {
            self.emitted[b] = true;
        }
        let rhs = self.region(t, j.min(end), stack.clone());
        stmts.extend(rhs.stmts);
        let mut rstack = rhs.stack;
        let value = if rstack.len() == stack.len() + 1 {
            rstack.pop().unwrap_or_else(Expr::none)
        } else {
            Expr::Unreconstructed { op: "JUMP_IF_OR_POP".into(), line: None }
        };
        let (inner, outer) = if jump_if_true { (BoolOp::Or, BoolOp::And) } else { (BoolOp::And, BoolOp::Or) };
        let left = operands.into_iter().reduce(|a, b| bool_op(inner, a, b)).unwrap_or_else(Expr::none);
        stack.push(bool_op(outer, left, value));
        Some(self.after(j, end))
    }

    /// `a < b < c` as a value. Each link leaves its right operand under the result and
    /// every early exit lands on a cleanup block that swaps it out and pops it.
    fn compare_chain_value(
        &mut self,
        stack: &mut Vec<Expr>,
        next: usize,
        end: usize,
        cond: &Expr,
        t: usize,
        copied: bool,
    ) -> Option<Next> {
        let Expr::Compare { ops, .. } = cond else { return None };
        let mut middle = ops.last()?.1.clone();
        let mut base = stack.clone();
        if copied {
            base.pop();
        }
        if base.last() != Some(&middle) || t >= end {
            return None;
        }
        base.pop();
        let cfg = self.cfg;
        let cleanup = cfg.blocks.get(t)?;
        let real: Vec<usize> =
            (0..cleanup.instrs.len()).filter(|&i| !cleanup.instrs[i].op.is_bookkeeping()).collect();
        let swaps = |i: usize| cleanup.instrs[i].op == Op::RotTwo || (cleanup.instrs[i].op == Op::Swap && cleanup.instrs[i].arg == 2);
        if real.len() < 2 || !swaps(real[0]) || cleanup.instrs[real[1]].op != Op::PopTop {
            return None;
        }
        let cleanup_skip = real[1] + 1;
        let cleanup_rest = tail_signature(&cleanup.instrs[cleanup_skip..]);
        let cleanup_term = cleanup.terminator;

        let mut merged = cond.clone();
        let mut links = Vec::new();
        let mut b = next;
        loop {
            if b >= t || !self.live[b] || self.emitted[b] || cfg.blocks[b].preds.len() != 1 {
                return None;
            }
            let blk = &cfg.blocks[b];
            let mut from = 0;
            if copied {
                from = blk.instrs.iter().position(|i| !i.op.is_bookkeeping())?;
                if blk.instrs[from].op != Op::PopTop {
                    return None;
                }
                from += 1;
            }
            let cmp = from + blk.instrs[from..].iter().position(|i| matches!(i.op, Op::CompareOp | Op::IsOp | Op::ContainsOp))?;
            let mut link_stack = base.clone();
            link_stack.push(middle.clone());
            let out = self.tr.translate(&blk.instrs[from..=cmp], link_stack);
            if !out.stmts.is_empty() || out.exit != Exit::Fallthrough {
                return None;
            }
            let mut rest_stack = out.stack;
            let Some(Expr::Compare { left, ops: more }) = rest_stack.pop() else { return None };
            if *left != middle || more.len() != 1 {
                return None;
            }
            let right = more[0].1.clone();
            if let Expr::Compare { ops, .. } = &mut merged {
                ops.extend(more);
            }
            links.push(b);
            let rest: Vec<&Instruction> =
                blk.instrs[cmp + 1..].iter().filter(|i| !i.op.is_bookkeeping() && i.op != Op::ToBool).collect();
            let to_cleanup = |i: &Instruction| i.target().and_then(|o| cfg.block_at(o)) == Some(t);
            let intermediate = match rest.as_slice() {
                [c, j] => c.op == Op::Copy && c.arg == 1 && j.op == Op::PopJumpIfFalse && to_cleanup(j),
                [j] => j.op == Op::JumpIfFalseOrPop && to_cleanup(j),
                _ => false,
            };
            if intermediate {
                if rest_stack.len() != base.len() + 1 || rest_stack.last() != Some(&right) {
                    return None;
                }
                middle = right;
                b += 1;
                continue;
            }
            if rest_stack != base {
                return None;
            }
            let own = tail_signature(&blk.instrs[cmp + 1..]);
            let same_tail = match (blk.terminator, cleanup_term) {
                (Terminator::Return, Terminator::Return) | (Terminator::Raise, Terminator::Raise) => own == cleanup_rest,
                (Terminator::Jump(x), Terminator::Fallthrough(y) | Terminator::Jump(y)) => {
                    x == y && cleanup_rest.is_empty() && own.len() == 1 && own[0].0.is_unconditional_jump()
                }
                (Terminator::Fallthrough(x), Terminator::Fallthrough(y)) => x == y && own.is_empty() && cleanup_rest.is_empty(),
                _ => false,
            };
            if !same_tail {
                return None;
            }
            break;
        }
        for b in links {
            self.emitted[b] = true;
        }
        self.skip.insert(t, cleanup_skip);
        *stack = base;
        stack.push(merged);
        Some(Next::At(t))
    }

    /// Where a compare-chain cleanup block (`POP_TOP` then jump) leads.
    fn cleanup_target(&self, b: usize) -> Option<usize> {
        let blk = self.cfg.blocks.get(b)?;
        let real: Vec<Op> = blk.instrs.iter().map(|i| i.op).filter(|op| !op.is_bookkeeping()).collect();
        match (real.as_slice(), blk.terminator) {
            ([Op::PopTop], Terminator::Fallthrough(x)) => Some(x),
            ([Op::PopTop, j], Terminator::Jump(x)) if j.is_unconditional_jump() => Some(x),
            _ => None,
        }
    }

    /// Fold `a < b < c`: each link leaves its right operand on the stack and bails out
    /// through a cleanup block that pops it.
    fn merge_compare_chain(
        &mut self,
        mut last: usize,
        mut cond: Expr,
        jump_if_true: bool,
        mut target: usize,
        stack: &mut Vec<Expr>,
    ) -> (usize, Expr, usize) {
        loop {
            let Expr::Compare { ops, .. } = &cond else { break };
            let Some((_, right)) = ops.last() else { break };
            if stack.last() != Some(right) {
                break;
            }
            let Some(exit) = self.cleanup_target(target) else { break };
            let nb = last + 1;
            if nb >= self.cfg.len() || !self.live[nb] || self.emitted[nb] {
                break;
            }
            let out = self.block(nb, stack.clone());
            let Exit::Branch { cond: c2, jump_if_true: j2, target: t2, keep: false } = out.exit else { break };
            let Expr::Compare { left: l2, ops: ops2 } = c2 else { break };
            if !out.stmts.is_empty() || j2 != jump_if_true || Some(&*l2) != Some(right) {
                break;
            }
            let Some(tb) = self.cfg.block_at(t2) else { break };
            if tb != exit && tb != target {
                break;
            }
            self.live[target] = false;
            self.emitted[nb] = true;
            if let Expr::Compare { ops, .. } = &mut cond {
                ops.extend(ops2);
            }
            *stack = out.stack;
            target = exit;
            last = nb;
        }
        (last, cond, target)
    }

    /// Gather consecutive condition-only blocks and fold them into one test.
    /// Returns the test (true enters the body), the body block and the else block.
    fn condition_chain(
        &mut self,
        cur: usize,
        cond: Expr,
        jump_if_true: bool,
        t: usize,
        stack: &mut Vec<Expr>,
    ) -> (Expr, usize, usize) {
        let (last, cond, t) = self.merge_compare_chain(cur, cond, jump_if_true, t, stack);
        let fall = |cond: Expr, jit: bool| if jit { Expr::not(cond) } else { cond };
        let mut links: Vec<(Expr, usize)> = vec![(fall(cond, jump_if_true), t)];
        let mut members = vec![last];
        let mut b = last + 1;
        while b < self.cfg.len() && self.live[b] && !self.emitted[b] {
            if self.cfg.blocks[b].preds != [b - 1] || self.back_edges.contains_key(&b) || self.try_starts_at(b) {
                break;
            }
            let out = self.block(b, stack.clone());
            let Exit::Branch { cond, jump_if_true, target, keep: false } = out.exit else { break };
            if !out.stmts.is_empty() {
                break;
            }
            let Some(tb) = self.cfg.block_at(target) else { break };
            if tb <= b || self.loop_control(tb).is_some() {
                break;
            }
            let mut probe_stack = out.stack;
            let (lb, cond, tb) = if probe_stack.len() == stack.len() + 1 {
                self.merge_compare_chain(b, cond, jump_if_true, tb, &mut probe_stack)
            } else {
                (b, cond, tb)
            };
            if probe_stack != *stack {
                break;
            }
            links.push((fall(cond, jump_if_true), tb));
            members.push(lb);
            b = lb + 1;
        }
        for k in (0..links.len()).rev() {
            let body = members[k] + 1;
            let els = links[k].1;
            let ok = (0..k).all(|i| {
                let tg = links[i].1;
                tg == body || tg == els || members[i + 1..=k].iter().any(|&m| self.link_start(m, &members) == tg)
            });
            if !ok {
                continue;
            }
            for &m in &members[1..=k] {
                for blk in self.link_start(m, &members)..=m {
                    self.emitted[blk] = true;
                }
            }
            let test = self.chain_expr(&links[..=k], &members[..=k], body, els);
            return (test, body, els);
        }
        (links[0].0.clone(), members[0] + 1, links[0].1)
    }

    /// First block of the chain link ending at `m` (links can span a folded compare chain).
    fn link_start(&self, m: usize, members: &[usize]) -> usize {
        match members.iter().position(|&x| x == m) {
            Some(0) | None => m,
            Some(i) => members[i - 1] + 1,
        }
    }

    fn chain_expr(&self, links: &[(Expr, usize)], members: &[usize], body: usize, els: usize) -> Expr {
        let k = links.len() - 1;
        let mut reach: Vec<Reach> = vec![Reach::False; links.len()];
        for i in (0..=k).rev() {
            let on_fall = if i == k { Reach::True } else { reach[i + 1].clone() };
            let tg = links[i].1;
            let on_jump = if tg == body {
                Reach::True
            } else if tg == els {
                Reach::False
            } else {
                match (i + 1..=k).find(|&j| self.link_start(members[j], members) == tg) {
                    Some(j) => reach[j].clone(),
                    None => Reach::False,
                }
            };
            reach[i] = ite(links[i].0.clone(), on_fall, on_jump);
        }
        match reach.swap_remove(0) {
            Reach::E(e) => e,
            Reach::True => Expr::Const(Value::Bool(true)),
            Reach::False => Expr::Const(Value::Bool(false)),
        }
    }

    fn if_stmt(
        &mut self,
        stmts: &mut Vec<Stmt>,
        stack: &mut Vec<Expr>,
        end: usize,
        test: Expr,
        body: usize,
        els: usize,
    ) -> Next {
        if els < body {
            self.goto(stmts, els, Some(Expr::not(test)));
            return Next::At(body);
        }
        if els == body {
            stmts.push(Stmt::If { test, body: Vec::new(), orelse: Vec::new() });
            return Next::At(body);
        }
        if els >= end {
            let then = self.region(body, end, stack.clone());
            *stack = then.stack;
            stmts.push(Stmt::If { test, body: then.stmts, orelse: Vec::new() });
            return match then.exit {
                _ if els == end => Next::Leave(RegionExit::Fall),
                RegionExit::Done => Next::Leave(RegionExit::Jump(els)),
                exit => Next::Leave(exit),
            };
        }
        let then = self.region(body, els, stack.clone());
        let then_exit = then.exit;
        match then_exit {
            RegionExit::Jump(j) if j > els => {
                let else_end = j.min(end);
                let other = self.region(els, else_end, stack.clone());
                self.join(stmts, stack, test, then, other);
                if j >= end {
                    Next::Leave(if j == end { RegionExit::Fall } else { RegionExit::Jump(j) })
                } else {
                    Next::At(j)
                }
            }
            _ => {
                let grew = then.stack.len() > stack.len();
                // A then-arm that leaves for an earlier try join does not flow into `els`.
                let rejoins = then.exit == RegionExit::Fall || then.exit == RegionExit::Jump(els);
                if grew && rejoins {
                    // Value produced on one side only: rejoin by spilling.
                    let mut then = then;
                    let tmp = self.tr.fresh_temp();
                    if let Some(v) = then.stack.pop() {
                        then.stmts.push(Stmt::Assign { targets: vec![Expr::name(tmp.clone())], value: v });
                    }
                    stmts.push(Stmt::If { test, body: then.stmts, orelse: Vec::new() });
                    stack.push(Expr::name(tmp));
                } else if then.exit == RegionExit::Done && ends_in_implicit_return(&then.stmts) {
                    // The compiler copies a trailing `return None` into both arms.
                    let other = self.region(els, end, stack.clone());
                    if other.exit == RegionExit::Done {
                        stmts.push(Stmt::If { test, body: then.stmts, orelse: other.stmts });
                    } else {
                        stmts.push(Stmt::If { test, body: then.stmts, orelse: Vec::new() });
                        stmts.extend(other.stmts);
                        *stack = other.stack;
                    }
                    return Next::Leave(other.exit);
                } else {
                    if rejoins {
                        *stack = then.stack;
                    }
                    stmts.push(Stmt::If { test, body: then.stmts, orelse: Vec::new() });
                }
                Next::At(els)
            }
        }
    }

    /// Combine the two arms of an if/else, producing a conditional expression when
    /// both arms only computed one value each.
    fn join(&mut self, stmts: &mut Vec<Stmt>, stack: &mut Vec<Expr>, test: Expr, mut then: Region, mut other: Region) {
        let base = stack.len();
        let valued = |r: &Region| r.exit != RegionExit::Done && r.stack.len() == base + 1;
        if valued(&then) && valued(&other) {
            let a = then.stack.pop().unwrap_or_else(Expr::none);
            let b = other.stack.pop().unwrap_or_else(Expr::none);
            if then.stmts.is_empty() && other.stmts.is_empty() {
                stack.push(Expr::IfExp { test: Box::new(test), body: Box::new(a), orelse: Box::new(b) });
                return;
            }
            let tmp = self.tr.fresh_temp();
            then.stmts.push(Stmt::Assign { targets: vec![Expr::name(tmp.clone())], value: a });
            other.stmts.push(Stmt::Assign { targets: vec![Expr::name(tmp.clone())], value: b });
            stmts.push(Stmt::If { test, body: then.stmts, orelse: other.stmts });
            stack.push(Expr::name(tmp));
            return;
        }
        if then.exit != RegionExit::Done {
            *stack = then.stack;
        } else if other.exit != RegionExit::Done {
            *stack = other.stack;
        }
        stmts.push(Stmt::If { test, body: then.stmts, orelse: other.stmts });
    }

    // Loops.

    fn active_header(&self, b: usize) -> bool {
        self.loops.iter().any(|l| l.header == b) || self.merged_headers.contains(&b)
    }

    fn async_for_follow(&self, cur: usize) -> Option<usize> {
        for b in [cur, cur + 1] {
            let blk = self.cfg.blocks.get(b)?;
            if let Some(ei) = blk.handler {
                let e = &self.cfg.exceptions[ei];
                if e.kind == HandlerKind::AsyncFor && blk.instrs.iter().any(|i| i.op == Op::GetAnext) {
                    return self.cfg.block_at(e.target);
                }
            }
        }
        None
    }

    fn loop_at(&self, cur: usize, end: usize) -> Option<(LoopKind, usize)> {
        if self.active_header(cur) {
            return None;
        }
        let blk = &self.cfg.blocks[cur];
        if blk.instrs.last().map(|i| i.op) == Some(Op::ForIter) {
            let x = blk.instrs.last().and_then(|i| i.target()).and_then(|t| self.cfg.block_at(t))?;
            return (x <= end).then_some((LoopKind::For, x.saturating_sub(1)));
        }
        let sources = self.back_edges.get(&cur)?;
        if let Some(follow) = self.async_for_follow(cur) {
            return (follow <= end && follow > cur).then_some((LoopKind::AsyncFor { follow }, follow - 1));
        }
        let mut last = sources.iter().copied().max()?;
        loop {
            let grown = self
                .back_edges
                .iter()
                .filter(|(t, _)| (cur..=last).contains(*t))
                .flat_map(|(_, s)| s.iter().copied())
                .filter(|&s| s > last)
                .max();
            match grown {
                Some(s) => last = s,
                None => break,
            }
        }
        (last < end).then_some((LoopKind::While { last }, last))
    }

    fn for_exit_skip(&self, x: usize) -> usize {
        let Some(blk) = self.cfg.blocks.get(x) else { return 0 };
        let mut n = 0;
        for (i, ins) in blk.instrs.iter().enumerate() {
            match ins.op {
                Op::EndFor | Op::PopIter => n = i + 1,
                Op::PopTop if self.version == PyVersion::V3_13 && i > 0 && blk.instrs[i - 1].op == Op::EndFor => {
                    n = i + 1
                }
                _ => break,
            }
        }
        n
    }

    fn for_loop(&mut self, cur: usize, end: usize, stmts: &mut Vec<Stmt>, stack: &mut Vec<Expr>) -> Next {
        self.emitted[cur] = true;
        let cfg = self.cfg;
        let instrs = &cfg.blocks[cur].instrs;
        let skip = self.skip.get(&cur).copied().unwrap_or(0).min(instrs.len());
        let Some((for_iter, prefix)) = instrs[skip..].split_last() else { return Next::At(cur + 1) };
        let out = self.tr.translate(prefix, std::mem::take(stack));
        stmts.extend(out.stmts);
        *stack = out.stack;
        let x = for_iter.target().and_then(|t| cfg.block_at(t)).unwrap_or(cur + 1);
        let iter = stack.pop().unwrap_or(Expr::Unreconstructed { op: for_iter.opname.clone(), line: for_iter.line });

        let skip_x = self.for_exit_skip(x);
        if skip_x > 0 {
            self.skip.insert(x, skip_x);
        }
        let x2 = if skip_x > 0 && skip_x >= cfg.blocks.get(x).map_or(0, |b| b.instrs.len()) { x + 1 } else { x };
        let mut breaks = vec![x, x2];
        breaks.extend([self.resolve_trampoline(x), self.resolve_trampoline(x2)]);
        // A `break` that skips past the exit block means a `for ... else`.
        let else_end = (cur + 1..x)
            .filter(|&b| self.live[b])
            .flat_map(|b| cfg.blocks[b].succs.iter().copied())
            .filter(|&t| t > x2)
            .min();
        let copies = match else_end {
            Some(e) => {
                breaks.push(e);
                Vec::new()
            }
            None => self.exit_copies(cur + 1..x, x, skip_x, true),
        };
        self.loops.push(LoopCtx { header: cur, continues: vec![cur], breaks, copies });
        let mut body_stack = stack.clone();
        body_stack.push(iter.clone());
        body_stack.push(Expr::ForItem);
        let body = self.region(cur + 1, x, body_stack);
        self.loops.pop();

        let (target, mut body_stmts) = take_loop_target(body.stmts, &for_iter.opname, for_iter.line);
        strip_trailing_continue(&mut body_stmts);
        let iter_expr = match iter {
            Expr::Iter(inner) => *inner,
            other => other,
        };
        let mut orelse = Vec::new();
        let mut follow = x;
        if let Some(e) = else_end {
            let r = self.region(x, e.min(end), stack.clone());
            orelse = r.stmts;
            follow = e;
        }

        if orelse.is_empty() {
            if let Some(Expr::List(v) | Expr::Set(v)) = stack.last() {
                if v.is_empty() {
                    let kind = if matches!(stack.last(), Some(Expr::List(_))) { CompKind::List } else { CompKind::Set };
                    if let Some(comp) = build_comprehension(kind, target.clone(), iter_expr.clone(), false, &body_stmts) {
                        if let Some(top) = stack.last_mut() {
                            *top = comp;
                        }
                        return self.after(follow, end);
                    }
                }
            }
            if let Some(Expr::Dict(v)) = stack.last() {
                if v.is_empty() {
                    if let Some(comp) = build_comprehension(CompKind::Dict, target.clone(), iter_expr.clone(), false, &body_stmts) {
                        if let Some(top) = stack.last_mut() {
                            *top = comp;
                        }
                        return self.after(follow, end);
                    }
                }
            }
        }
        stmts.push(Stmt::For { target, iter: iter_expr, body: body_stmts, orelse, is_async: false });
        self.after(follow, end)
    }

    fn after(&self, follow: usize, end: usize) -> Next {
        if follow >= end {
            Next::Leave(if follow == end { RegionExit::Fall } else { RegionExit::Jump(follow) })
        } else {
            Next::At(follow)
        }
    }

    fn async_for_loop(&mut self, cur: usize, follow: usize, end: usize, stmts: &mut Vec<Stmt>, stack: &mut Vec<Expr>) -> Next {
        let mut breaks = vec![follow];
        let follow_ops: Vec<Op> = self.cfg.blocks[follow].instrs.iter().map(|i| i.op).collect();
        if follow_ops == [Op::EndAsyncFor] {
            breaks.push(follow + 1);
        } else {
            self.skip.insert(follow, 1);
        }
        self.loops.push(LoopCtx { header: cur, continues: vec![cur], breaks, copies: Vec::new() });
        let body = self.region(cur, follow, stack.clone());
        self.loops.pop();
        let (target, mut body_stmts) = take_loop_target(body.stmts, "GET_ANEXT", None);
        strip_trailing_continue(&mut body_stmts);
        let iter = match stack.pop() {
            Some(Expr::Iter(inner)) => *inner,
            Some(other) => other,
            None => Expr::Unreconstructed { op: "GET_AITER".into(), line: None },
        };
        stmts.push(Stmt::For { target, iter, body: body_stmts, orelse: Vec::new(), is_async: true });
        self.emitted[follow] = self.emitted[follow] || follow_ops == [Op::EndAsyncFor];
        let next = if follow_ops == [Op::EndAsyncFor] { follow + 1 } else { follow };
        self.after(next, end)
    }

    fn while_loop(&mut self, cur: usize, last: usize, end: usize, stmts: &mut Vec<Stmt>, stack: &mut Vec<Expr>) -> Next {
        let follow = last + 1;
        let mut continues = vec![cur];
        for (&t, sources) in &self.back_edges {
            if t > cur && t <= last && sources.iter().all(|&s| s == last) {
                continues.push(t);
            }
        }
        for &t in &continues[1..] {
            self.merged_headers.insert(t);
        }
        let breaks = vec![follow, self.resolve_trampoline(follow)];
        let copies = self.exit_copies(cur + 1..follow, follow, 0, false);
        self.loops.push(LoopCtx { header: cur, continues, breaks, copies });
        let body = self.region(cur, follow, stack.clone());
        self.loops.pop();
        let mut b = body.stmts;
        if body.exit != RegionExit::Done {
            b.push(Stmt::Break);
        }
        if let [.., Stmt::If { test, body: ib, orelse }, Stmt::Break] = b.as_slice() {
            if ib.as_slice() == [Stmt::Continue] && orelse.is_empty() {
                let test = Expr::not(test.clone());
                b.truncate(b.len() - 2);
                b.push(Stmt::If { test, body: vec![Stmt::Break], orelse: Vec::new() });
            }
        }
        strip_trailing_continue(&mut b);
        let mut test = Expr::Const(Value::Bool(true));
        // A bottom-tested loop keeps `while True` here; the guard pass folds it later.
        let bottom_tested = b.len() > 1 && b.last().is_some_and(is_break_if);
        if !bottom_tested && b.first().is_some_and(is_break_if) {
            if let Stmt::If { test: t, .. } = b.remove(0) {
                test = Expr::not(t);
            }
        }
        stmts.push(Stmt::While { test, body: b, orelse: Vec::new() });
        self.after(follow, end)
    }

    // Exception handling.

    fn find_tries(&self) -> HashMap<usize, TryInfo> {
        let cfg = self.cfg;
        let mut protected: HashMap<usize, Vec<usize>> = HashMap::new();
        for (b, blk) in cfg.blocks.iter().enumerate() {
            if !self.live[b] {
                continue;
            }
            // An exception that escapes a handler moves on to whatever covers the handler,
            // so a block also belongs to every try its handler chain reaches.
            let mut seen = HashSet::new();
            let mut entry = blk.handler;
            while let Some(ei) = entry {
                let e = &cfg.exceptions[ei];
                let Some(h) = cfg.block_at(e.target) else { break };
                if !seen.insert(h) {
                    break;
                }
                if e.kind == HandlerKind::Try {
                    protected.entry(h).or_default().push(b);
                }
                entry = cfg.blocks[h].handler;
            }
        }
        let mut out: HashMap<usize, TryInfo> = HashMap::new();
        let mut handlers: Vec<usize> = protected.keys().copied().collect();
        // Inner handlers sit at higher block indices than the body they protect is entered
        // from, so resolve starts from the innermost (latest) outward.
        handlers.sort_unstable_by(|a, b| b.cmp(a));
        for _ in 0..2 {
            for &h in &handlers {
                let blocks = &protected[&h];
                let lo = blocks.iter().copied().min().unwrap_or(h);
                let hi = blocks.iter().copied().max().unwrap_or(h);
                let mut start = lo;
                for (&inner, info) in &out {
                    if inner != h && (lo..=hi).contains(&inner) {
                        start = start.min(info.start);
                    }
                }
                out.insert(h, TryInfo { start, end: hi + 1 });
            }
        }
        out
    }

    fn try_starts_at(&self, b: usize) -> bool {
        self.tries.iter().any(|(h, t)| t.start == b && !self.consumed.contains(h))
    }

    fn try_at(&self, cur: usize) -> Option<usize> {
        self.tries
            .iter()
            .filter(|(h, t)| t.start == cur && !self.consumed.contains(*h))
            .max_by_key(|(h, t)| (t.end, usize::MAX - **h))
            .map(|(h, _)| *h)
    }

    fn structured(&mut self, cur: usize, end: usize, stmts: &mut Vec<Stmt>, stack: &mut Vec<Expr>) -> Option<Next> {
        let try_h = self.try_at(cur).filter(|h| *h < end);
        let lp = self.loop_at(cur, end);
        let try_first = match (try_h, lp) {
            (Some(h), Some((_, last))) => last < self.tries[&h].end,
            (Some(_), None) => true,
            _ => false,
        };
        if try_first {
            return try_h.map(|h| self.try_stmt(cur, h, end, stmts, stack));
        }
        match lp? {
            (LoopKind::For, _) => Some(self.for_loop(cur, end, stmts, stack)),
            (LoopKind::AsyncFor { follow }, _) => Some(self.async_for_loop(cur, follow, end, stmts, stack)),
            (LoopKind::While { last }, _) => Some(self.while_loop(cur, last, end, stmts, stack)),
        }
    }

    fn handler_stack(&self, stack: &[Expr]) -> Vec<Expr> {
        let mut s = stack.to_vec();
        let n = if self.version == PyVersion::V3_10 { 6 } else { 1 };
        s.extend(std::iter::repeat_n(Expr::Exception, n));
        s
    }

    /// One past the last block only reachable through handler `h`.
    fn dominated_end(&self, h: usize, end: usize) -> usize {
        (h..end).filter(|&b| self.live[b] && self.cfg.dominates(h, b)).max().map_or(h + 1, |b| b + 1)
    }

    /// The one block outside the handler that every handler path continues at.
    fn handler_join(&self, h: usize, hset_end: usize) -> Option<usize> {
        let mut outside = BTreeSet::new();
        for b in (h..hset_end).filter(|&b| self.live[b] && self.cfg.dominates(h, b)) {
            for &s in &self.cfg.blocks[b].succs {
                if !(h..hset_end).contains(&s) || !self.cfg.dominates(h, s) {
                    outside.insert(s);
                }
            }
        }
        if outside.len() == 1 { outside.into_iter().next() } else { None }
    }

    fn try_stmt(&mut self, cur: usize, h: usize, end: usize, stmts: &mut Vec<Stmt>, stack: &mut Vec<Expr>) -> Next {
        self.consumed.insert(h);
        let info = self.tries[&h];
        trace!(scope = %self.scope, start = self.offset(cur), handler = self.offset(h), "try");
        let hset_end = self.dominated_end(h, end);
        // 3.12+ lays the code after the statement out before the handler, which jumps back to it.
        let early = self.handler_join(h, hset_end).filter(|&j| j >= info.end && j < h);
        let body = self.region(cur, info.end.min(h), stack.clone());
        let mut body_stmts = body.stmts;
        let mut orelse = Vec::new();
        let mut exit = body.exit;
        let mut after_stack = body.stack.clone();
        if body.exit == RegionExit::Fall && info.end < h {
            let els = self.region(info.end, early.unwrap_or(h), body.stack.clone());
            orelse = els.stmts;
            exit = els.exit;
            after_stack = els.stack;
        }
        if body.stack.len() > stack.len() && !orelse.is_empty() {
            body_stmts.push(orelse.remove(0));
        }
        let join = match exit {
            RegionExit::Jump(j) => Some(j),
            _ => None,
        };
        let hend = match join {
            Some(j) if j > h => j.min(end),
            _ => hset_end,
        };
        if let Some(j) = early {
            self.try_joins.push(j);
        }
        let handler = self.region(h, hend, self.handler_stack(stack));
        if early.is_some() {
            self.try_joins.pop();
        }
        let finally = is_finally(&handler.stmts);
        let mut next = match join {
            Some(j) if j > h => j,
            _ => hend,
        };
        match (handler.exit, join) {
            (RegionExit::Jump(k), Some(j)) if k > j && j > h && j < end => {
                let dup = self.exit_signature(j, 0);
                if dup.is_none() || dup != self.exit_signature(k, 0) {
                    // 3.10 places `else` after the handlers.
                    let els = self.region(j, k.min(end), after_stack.clone());
                    orelse.extend(els.stmts);
                    next = k;
                }
            }
            (RegionExit::Jump(k), None) if early.is_none() => next = k,
            _ => {}
        }
        // Code between the body and the handler that runs once the statement is done: the
        // early join, or the normal-path copy of a `finally` body that 3.11 jumps back to.
        let mut after = Vec::new();
        let trailing = early.or(join.filter(|&j| finally && j >= info.end && j < h));
        if let Some(j) = trailing {
            let rest = self.region(j, h, after_stack.clone());
            if let RegionExit::Jump(x) = rest.exit {
                next = x;
            }
            after = rest.stmts;
            after_stack = rest.stack;
            if finally {
                body_stmts.append(&mut after);
            }
        }
        if exit != RegionExit::Done || handler.exit != RegionExit::Done || trailing.is_some() {
            *stack = after_stack;
        }
        stmts.extend(build_try(body_stmts, handler.stmts, orelse));
        stmts.extend(after);
        self.after(next, end)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Reach {
    True,
    False,
    E(Expr),
}

fn split_last_operand(op: BoolOp, e: &Expr, suffix: &Expr) -> Option<Expr> {
    let Expr::BoolOp { op: inner, values } = e else { return None };
    if *inner != op || values.last() != Some(suffix) || values.len() < 2 {
        return None;
    }
    let head = &values[..values.len() - 1];
    Some(if head.len() == 1 { head[0].clone() } else { Expr::BoolOp { op, values: head.to_vec() } })
}

/// `a if t else b` over branch outcomes, simplified to boolean operators where possible.
fn ite(t: Expr, a: Reach, b: Reach) -> Reach {
    use Reach::*;
    match (a, b) {
        (True, True) => True,
        (False, False) => False,
        (True, False) => E(t),
        (False, True) => E(Expr::not(t)),
        (E(a), False) => E(bool_op(BoolOp::And, t, a)),
        (True, E(b)) => E(bool_op(BoolOp::Or, t, b)),
        (E(a), True) => E(bool_op(BoolOp::Or, Expr::not(t), a)),
        (False, E(b)) => E(bool_op(BoolOp::And, Expr::not(t), b)),
        (E(a), E(b)) => {
            if let Some(x) = split_last_operand(BoolOp::And, &a, &b) {
                E(bool_op(BoolOp::And, bool_op(BoolOp::Or, Expr::not(t), x), b))
            } else if let Some(x) = split_last_operand(BoolOp::Or, &a, &b) {
                E(bool_op(BoolOp::Or, bool_op(BoolOp::And, t, x), b))
            } else if let Some(x) = split_last_operand(BoolOp::And, &b, &a) {
                E(bool_op(BoolOp::And, bool_op(BoolOp::Or, t, x), a))
            } else if let Some(x) = split_last_operand(BoolOp::Or, &b, &a) {
                E(bool_op(BoolOp::Or, bool_op(BoolOp::And, Expr::not(t), x), a))
            } else {
                E(Expr::IfExp { test: Box::new(t), body: Box::new(a), orelse: Box::new(b) })
            }
        }
    }
}

fn is_break_if(s: &Stmt) -> bool {
    matches!(s, Stmt::If { body, orelse, .. } if body.as_slice() == [Stmt::Break] && orelse.is_empty())
}

fn ends_in_implicit_return(body: &[Stmt]) -> bool {
    match body.last() {
        Some(Stmt::Return(None)) => true,
        Some(Stmt::Return(Some(e))) => e.is_none_const(),
        _ => false,
    }
}

fn is_for_item(e: &Expr) -> bool {
    match e {
        Expr::ForItem => true,
        Expr::Await(inner) => matches!(**inner, Expr::ForItem),
        _ => false,
    }
}

/// Pull the loop variable out of the first store of the iteration value.
fn take_loop_target(mut body: Vec<Stmt>, op: &str, line: Option<u32>) -> (Expr, Vec<Stmt>) {
    let pos = body.iter().position(|s| matches!(s, Stmt::Assign { value, targets } if targets.len() == 1 && is_for_item(value)));
    if let Some(i) = pos {
        if let Stmt::Assign { mut targets, .. } = body.remove(i) {
            if let Some(t) = targets.pop() {
                return (t, body);
            }
        }
    }
    (Expr::Unreconstructed { op: op.to_string(), line }, body)
}

fn strip_trailing_continue(body: &mut Vec<Stmt>) {
    match body.last_mut() {
        Some(Stmt::Continue) => {
            body.pop();
        }
        Some(Stmt::If { body: b, orelse, .. }) => {
            strip_trailing_continue(b);
            strip_trailing_continue(orelse);
        }
        _ => {}
    }
}

/// Comprehension from a loop whose body only filters, nests and appends.
fn build_comprehension(kind: CompKind, target: Expr, iter: Expr, is_async: bool, body: &[Stmt]) -> Option<Expr> {
    let mut gens = vec![Generator { target, iter, ifs: Vec::new(), is_async }];
    let (elt, value) = comp_leaf(body, &mut gens, kind)?;
    Some(Expr::Comprehension { kind, elt: Box::new(elt), value: value.map(Box::new), generators: gens })
}

fn comp_leaf(body: &[Stmt], gens: &mut Vec<Generator>, kind: CompKind) -> Option<(Expr, Option<Expr>)> {
    match body {
        [Stmt::CompAppend { value, key: Some(k), .. }] if kind == CompKind::Dict => Some((k.clone(), Some(value.clone()))),
        [Stmt::CompAppend { value, key: None, .. }] if kind != CompKind::Dict => Some((value.clone(), None)),
        [Stmt::Expr(Expr::Yield(Some(v)))] if kind == CompKind::Generator => Some(((**v).clone(), None)),
        [Stmt::If { test, body, orelse }] if orelse.is_empty() => {
            gens.last_mut()?.ifs.push(test.clone());
            comp_leaf(body, gens, kind)
        }
        [Stmt::If { test, body: b, orelse }, rest @ ..] if orelse.is_empty() && b.as_slice() == [Stmt::Continue] => {
            gens.last_mut()?.ifs.push(Expr::not(test.clone()));
            comp_leaf(rest, gens, kind)
        }
        [Stmt::For { target, iter, body, orelse, is_async }] if orelse.is_empty() => {
            gens.push(Generator { target: target.clone(), iter: iter.clone(), ifs: Vec::new(), is_async: *is_async });
            comp_leaf(body, gens, kind)
        }
        _ => None,
    }
}

fn contains_pop_except(body: &[Stmt]) -> bool {
    body.iter().any(|s| {
        matches!(s, Stmt::PopExcept) || (!matches!(s, Stmt::Try { .. }) && s.bodies().into_iter().any(|b| contains_pop_except(b)))
    })
}

fn is_exc_match_if(s: &Stmt) -> bool {
    matches!(s, Stmt::If { test: Expr::ExcMatch(_), .. })
}

/// Instructions that matter when two block tails are compared.
fn tail_signature(instrs: &[Instruction]) -> Vec<(Op, Argval)> {
    instrs
        .iter()
        .filter(|i| !i.op.is_bookkeeping() && !matches!(i.op, Op::PopBlock | Op::ToBool))
        .map(|i| (i.op, i.argval.clone()))
        .collect()
}

/// Remove the normal-path copy of a `finally` body: at the end, and ahead of each return.
fn strip_finally_copy(body: &mut Vec<Stmt>, fin: &[Stmt]) {
    if fin.is_empty() {
        return;
    }
    if body.ends_with(fin) {
        body.truncate(body.len() - fin.len());
        return;
    }
    let mut i = 0;
    while i < body.len() {
        if matches!(body[i], Stmt::Return(_)) && i >= fin.len() && body[i - fin.len()..i] == *fin {
            body.drain(i - fin.len()..i);
            i -= fin.len();
        }
        for b in body[i].bodies_mut() {
            strip_finally_copy_returns(b, fin);
        }
        i += 1;
    }
}

fn strip_finally_copy_returns(body: &mut Vec<Stmt>, fin: &[Stmt]) {
    let mut i = 0;
    while i < body.len() {
        if matches!(body[i], Stmt::Return(_)) && i >= fin.len() && body[i - fin.len()..i] == *fin {
            body.drain(i - fin.len()..i);
            i -= fin.len();
        }
        if !matches!(body[i], Stmt::FunctionDef(_) | Stmt::ClassDef(_)) {
            for b in body[i].bodies_mut() {
                strip_finally_copy_returns(b, fin);
            }
        }
        i += 1;
    }
}

fn is_finally(handler: &[Stmt]) -> bool {
    matches!(handler.last(), Some(Stmt::Reraise))
        && !contains_pop_except(handler)
        && !handler.first().is_some_and(is_exc_match_if)
}

/// Where the code after the statement starts in a `finally` body whose last statement
/// is a try/except: the compiler emitted the normal-path `finally` copy right after it.
fn finally_copy_split(body: &[Stmt], fin: &[Stmt]) -> Option<usize> {
    (1..body.len()).find(|&p| {
        matches!(body[p - 1], Stmt::Try { .. })
            && body[p..].starts_with(fin)
            && body.len() > p + fin.len()
            && body.last().is_some_and(Stmt::is_terminal)
    })
}

/// Drop the normal-path copies of `fin` and return whatever the compiler laid out after
/// the copy, which belongs after the whole statement.
fn strip_normal_finally(body: &mut Vec<Stmt>, orelse: &mut Vec<Stmt>, fin: &[Stmt]) -> Vec<Stmt> {
    if fin.is_empty() {
        return Vec::new();
    }
    if orelse.starts_with(fin) {
        let after = orelse.split_off(fin.len());
        orelse.clear();
        strip_finally_copy_returns(body, fin);
        return after;
    }
    if !orelse.is_empty() {
        strip_finally_copy(orelse, fin);
        strip_finally_copy_returns(body, fin);
        return Vec::new();
    }
    if let Some(p) = finally_copy_split(body, fin) {
        let after = body.split_off(p + fin.len());
        body.truncate(p);
        strip_finally_copy_returns(body, fin);
        return after;
    }
    strip_finally_copy(body, fin);
    Vec::new()
}

fn build_try(mut body: Vec<Stmt>, handler: Vec<Stmt>, mut orelse: Vec<Stmt>) -> Vec<Stmt> {
    if is_finally(&handler) {
        let mut fin = handler;
        fin.pop();
        let mut after = strip_normal_finally(&mut body, &mut orelse, &fin);
        body.append(&mut orelse);
        if let [Stmt::Try { finalbody, handlers, .. }] = body.as_mut_slice() {
            if finalbody.is_empty() && !handlers.is_empty() {
                *finalbody = fin;
                body.append(&mut after);
                return body;
            }
        }
        let mut out = vec![Stmt::Try { body, handlers: Vec::new(), orelse: Vec::new(), finalbody: fin }];
        out.append(&mut after);
        return out;
    }
    let handlers = parse_clauses(handler);
    if handlers.is_empty() {
        body.append(&mut orelse);
    }
    vec![Stmt::Try { body, handlers, orelse, finalbody: Vec::new() }]
}

/// Split a handler into `except` clauses. Each type test either nests the next one in
/// its `else` or, when its body left for a join, is followed by it.
fn parse_clauses(mut stmts: Vec<Stmt>) -> Vec<ExceptHandler> {
    let mut out = Vec::new();
    loop {
        if !stmts.first().is_some_and(is_exc_match_if) {
            if !stmts.is_empty() && stmts.as_slice() != [Stmt::Reraise] {
                out.push(clause(None, stmts));
            }
            return out;
        }
        let Stmt::If { test: Expr::ExcMatch(typ), body, mut orelse } = stmts.remove(0) else { return out };
        out.push(clause(Some(*typ), body));
        orelse.append(&mut stmts);
        stmts = orelse;
    }
}

fn clause(typ: Option<Expr>, mut body: Vec<Stmt>) -> ExceptHandler {
    let name = match body.first() {
        Some(Stmt::BindException(n)) => Some(n.clone()),
        _ => None,
    };
    if name.is_some() {
        body.remove(0);
    }
    scrub_handler(&mut body, name.as_deref());
    ExceptHandler { typ, name, body }
}

fn is_name_reset(a: &Stmt, b: &Stmt, name: &str) -> bool {
    matches!(a, Stmt::Assign { targets, value } if value.is_none_const() && targets.as_slice() == [Expr::name(name)])
        && matches!(b, Stmt::Delete(t) if t.as_slice() == [Expr::name(name)])
}

/// Drop `POP_EXCEPT` markers and the `name = None; del name` unbinding of `except ... as name`.
fn scrub_handler(body: &mut Vec<Stmt>, name: Option<&str>) {
    let mut out = Vec::with_capacity(body.len());
    let mut it = std::mem::take(body).into_iter().peekable();
    while let Some(mut s) = it.next() {
        if s == Stmt::PopExcept {
            continue;
        }
        if let Some(n) = name {
            if it.peek().is_some_and(|next| is_name_reset(&s, next, n)) {
                it.next();
                continue;
            }
            if is_unbind_try(&s, n) {
                if let Stmt::Try { body: mut inner, .. } = s {
                    scrub_handler(&mut inner, name);
                    out.extend(inner);
                }
                continue;
            }
        }
        if !matches!(s, Stmt::FunctionDef(_) | Stmt::ClassDef(_)) {
            for b in s.bodies_mut() {
                scrub_handler(b, name);
            }
        }
        out.push(s);
    }
    *body = out;
}

/// 3.10 wraps an `except ... as n` body in `try: ... finally: n = None; del n`.
fn is_unbind_try(s: &Stmt, name: &str) -> bool {
    match s {
        Stmt::Try { handlers, orelse, finalbody, .. } => {
            handlers.is_empty() && orelse.is_empty() && finalbody.len() == 2 && is_name_reset(&finalbody[0], &finalbody[1], name)
        }
        _ => false,
    }
}

// Cleanup passes run over each structured body.

/// Post-structuring rewrites: `with` folding, marker removal and statement idioms.
pub fn tidy(body: &mut Vec<Stmt>) {
    visit_bodies_mut(body, &mut fold_with);
    visit_bodies_mut(body, &mut strip_markers);
    visit_bodies_mut(body, &mut hoist_common_tail);
    visit_bodies_mut(body, &mut fold_while_guard);
    visit_bodies_mut(body, &mut merge_nested_if);
    visit_bodies_mut(body, &mut rewrite_assert);
    visit_bodies_mut(body, &mut rewrite_annotations);
}

fn fold_with(body: &mut Vec<Stmt>) {
    loop {
        let Some(j) = body.iter().position(|s| *s == Stmt::WithExit) else { break };
        let Some(i) = body[..j].iter().rposition(|s| matches!(s, Stmt::WithEnter { .. })) else {
            body.remove(j);
            continue;
        };
        let mut inner: Vec<Stmt> = body.drain(i + 1..=j).collect();
        inner.pop();
        let enter = std::mem::replace(&mut body[i], Stmt::Pass);
        body[i] = with_stmt(enter, inner);
    }
    while let Some(i) = body.iter().rposition(|s| matches!(s, Stmt::WithEnter { .. })) {
        let inner: Vec<Stmt> = body.drain(i + 1..).collect();
        let enter = std::mem::replace(&mut body[i], Stmt::Pass);
        body[i] = with_stmt(enter, inner);
    }
}

fn with_stmt(enter: Stmt, body: Vec<Stmt>) -> Stmt {
    match enter {
        Stmt::WithEnter { context, target, is_async } => {
            Stmt::With { items: vec![WithItem { context, target }], body, is_async }
        }
        other => other,
    }
}

fn strip_markers(body: &mut Vec<Stmt>) {
    let old = std::mem::take(body);
    for s in old {
        match s {
            Stmt::WithExit | Stmt::PopExcept | Stmt::BindException(_) => {}
            Stmt::Reraise => body.push(Stmt::Raise { exc: None, cause: None }),
            Stmt::CompAppend { .. } => body.push(Stmt::Unreconstructed { op: "LIST_APPEND".into(), line: None }),
            other => body.push(other),
        }
    }
}

/// Length of the shared suffix of `a` and `b` when it ends in a jump out.
fn common_tail(a: &[Stmt], b: &[Stmt]) -> usize {
    if !a.last().is_some_and(Stmt::is_terminal) {
        return 0;
    }
    a.iter().rev().zip(b.iter().rev()).take_while(|(x, y)| x == y).count()
}

/// The compiler copies a short exit (a return and the statements leading to it) into
/// every branch that reaches it. Pull such a shared tail back out behind the statement.
fn hoist_common_tail(body: &mut Vec<Stmt>) {
    let mut i = body.len();
    while i > 0 {
        i -= 1;
        if let Stmt::If { body: b, orelse, .. } = &body[i] {
            if orelse.is_empty() {
                // `if c: ...; return x` followed by `...; return x` is an if/else.
                let n = common_tail(b, &body[i + 1..]);
                let guard = n == 1 && ends_in_implicit_return(b);
                if n > 0 && n < b.len() && !guard {
                    let tail = body.split_off(body.len() - n);
                    let rest: Vec<Stmt> = body.drain(i + 1..).collect();
                    if let Stmt::If { body: b, orelse, .. } = &mut body[i] {
                        b.truncate(b.len() - n);
                        *orelse = rest;
                    }
                    body.extend(tail);
                }
                continue;
            }
        }
        let tail = match &mut body[i] {
            Stmt::If { body: b, orelse, .. } => {
                let n = common_tail(b, orelse);
                if n == 0 || n == b.len() {
                    continue;
                }
                b.truncate(b.len() - n);
                orelse.split_off(orelse.len() - n)
            }
            Stmt::Try { handlers, orelse, finalbody, .. } if finalbody.is_empty() && !handlers.is_empty() => {
                let mut n = usize::MAX;
                for h in handlers.iter() {
                    if h.body.last() == orelse.last() {
                        n = n.min(common_tail(orelse, &h.body));
                    } else if !h.body.last().is_some_and(Stmt::is_terminal) {
                        n = 0;
                    }
                }
                if n == 0 || n == usize::MAX {
                    continue;
                }
                for h in handlers.iter_mut() {
                    if h.body.ends_with(&orelse[orelse.len() - n..]) {
                        h.body.truncate(h.body.len() - n);
                    }
                }
                orelse.split_off(orelse.len() - n)
            }
            _ => continue,
        };
        body.splice(i + 1..i + 1, tail);
    }
}

/// `if c: while True: ...; if not c: break` is the rotated form of `while c:`.
fn fold_while_guard(body: &mut Vec<Stmt>) {
    for s in body.iter_mut() {
        let Stmt::If { test, body: ib, orelse } = s else { continue };
        if !orelse.is_empty() || ib.len() != 1 {
            continue;
        }
        let Stmt::While { test: wt, body: wb, orelse: wo } = &ib[0] else { continue };
        if *wt != Expr::Const(Value::Bool(true)) || !wo.is_empty() {
            continue;
        }
        let Some(Stmt::If { test: bt, body: bb, orelse: bo }) = wb.last() else { continue };
        if bb.as_slice() != [Stmt::Break] || !bo.is_empty() || Expr::not(bt.clone()) != *test {
            continue;
        }
        let mut new_body = wb.clone();
        new_body.pop();
        *s = Stmt::While { test: test.clone(), body: new_body, orelse: Vec::new() };
    }
}

fn merge_nested_if(body: &mut Vec<Stmt>) {
    for s in body.iter_mut() {
        let Stmt::If { test, body: ib, orelse } = s else { continue };
        if !orelse.is_empty() || ib.len() != 1 {
            continue;
        }
        if let Stmt::If { test: t2, body: b2, orelse: o2 } = &ib[0] {
            if o2.is_empty() && !b2.is_empty() {
                let merged = bool_op(BoolOp::And, test.clone(), t2.clone());
                *s = Stmt::If { test: merged, body: b2.clone(), orelse: Vec::new() };
            }
        }
    }
}

fn assertion_message(exc: &Expr) -> Option<Option<Expr>> {
    match exc {
        Expr::Name(n) if n == "AssertionError" => Some(None),
        Expr::Call { func, args, keywords } if keywords.is_empty() && args.len() == 1 => match &**func {
            Expr::Name(n) if n == "AssertionError" => Some(Some(args[0].clone())),
            _ => None,
        },
        _ => None,
    }
}

fn rewrite_assert(body: &mut Vec<Stmt>) {
    for s in body.iter_mut() {
        let Stmt::If { test, body: ib, orelse } = s else { continue };
        if !orelse.is_empty() {
            continue;
        }
        if let [Stmt::Raise { exc: Some(exc), cause: None }] = ib.as_slice() {
            if let Some(msg) = assertion_message(exc) {
                *s = Stmt::Assert { test: Expr::not(test.clone()), msg };
            }
        }
    }
}

fn annotation_target(target: &Expr) -> Option<String> {
    let Expr::Subscript { value, slice } = target else { return None };
    match (&**value, &**slice) {
        (Expr::Name(n), Expr::Const(Value::Str(key))) if n == "__annotations__" => Some(key.clone()),
        _ => None,
    }
}

/// `x = v; __annotations__['x'] = T` back to `x: T = v`.
fn rewrite_annotations(body: &mut Vec<Stmt>) {
    let old = std::mem::take(body);
    for s in old {
        if let Stmt::Assign { targets, value } = &s {
            if let [t] = targets.as_slice() {
                if let Some(name) = annotation_target(t) {
                    let prev_value = match body.last() {
                        Some(Stmt::Assign { targets, value }) if targets.as_slice() == [Expr::name(name.clone())] => {
                            Some(value.clone())
                        }
                        _ => None,
                    };
                    if prev_value.is_some() {
                        body.pop();
                    }
                    body.push(Stmt::AnnAssign { target: Expr::name(name), annotation: value.clone(), value: prev_value });
                    continue;
                }
            }
        }
        body.push(s);
    }
}

/// Drop an implicit `return None` from the tail positions of a body.
pub fn strip_tail_return(body: &mut Vec<Stmt>) {
    match body.last_mut() {
        Some(Stmt::Return(None)) => {
            body.pop();
        }
        Some(Stmt::Return(Some(e))) if e.is_none_const() => {
            body.pop();
        }
        Some(Stmt::If { body: b, orelse, .. }) => {
            strip_tail_return(b);
            strip_tail_return(orelse);
        }
        Some(Stmt::Try { body: b, handlers, orelse, .. }) => {
            if orelse.is_empty() {
                strip_tail_return(b);
            } else {
                strip_tail_return(orelse);
            }
            for h in handlers {
                strip_tail_return(&mut h.body);
            }
        }
        Some(Stmt::With { body: b, .. }) => strip_tail_return(b),
        _ => {}
    }
}

// Assembly of the per-code-object bodies into one tree.

const CLASS_PREAMBLE: &[&str] =
    &["__module__", "__qualname__", "__firstlineno__", "__static_attributes__", "__classcell__", "__classdictcell__"];

/// Splices nested code objects into their definitions: function and class bodies,
/// lambdas and comprehensions.
pub struct Assembler<'t> {
    tree: &'t CodeTree,
    scopes: &'t ScopeMap,
    version: PyVersion,
    bodies: Vec<Option<Vec<Stmt>>>,
}

impl<'t> Assembler<'t> {
    /// `bodies[n]` is the structured body of node `n`, `None` where structuring failed.
    pub fn new(tree: &'t CodeTree, scopes: &'t ScopeMap, version: PyVersion, bodies: Vec<Option<Vec<Stmt>>>) -> Self {
        Assembler { tree, scopes, version, bodies }
    }

    pub fn assemble(mut self) -> Vec<Stmt> {
        let mut body = self.take(0);
        self.fill(&mut body);
        doc_assignment_to_docstring(&mut body);
        strip_tail_return(&mut body);
        body
    }

    fn take(&mut self, n: usize) -> Vec<Stmt> {
        match self.bodies.get_mut(n).and_then(Option::take) {
            Some(b) => b,
            None => vec![Stmt::Unreconstructed { op: "<error>".into(), line: None }],
        }
    }

    fn code(&self, n: usize) -> &'t CodeObject {
        &self.tree.nodes[n].code
    }

    fn fill(&mut self, body: &mut [Stmt]) {
        for s in body.iter_mut() {
            match s {
                Stmt::FunctionDef(f) => f.body = self.function_body(f.code),
                Stmt::ClassDef(c) => c.body = self.class_body(c.code),
                _ => {}
            }
            for e in s.exprs_mut() {
                self.lift(e);
            }
            if !matches!(s, Stmt::FunctionDef(_) | Stmt::ClassDef(_)) {
                for b in s.bodies_mut() {
                    self.fill(b);
                }
            }
        }
    }

    fn lift(&mut self, e: &mut Expr) {
        e.visit_mut(&mut |x| self.lift_one(x));
    }

    fn lift_one(&mut self, e: &mut Expr) {
        match e {
            Expr::Function(fv) if self.code(fv.code).is_lambda() => {
                let fv = (**fv).clone();
                *e = self.lambda(&fv);
            }
            Expr::Call { func, args, keywords } if keywords.is_empty() && args.len() == 1 => {
                let Expr::Function(fv) = &**func else { return };
                if !self.code(fv.code).is_comprehension() {
                    return;
                }
                let fv = (**fv).clone();
                let arg = args.remove(0);
                match self.comprehension(&fv, arg.clone()) {
                    Some(c) => *e = c,
                    None => *args = vec![arg],
                }
            }
            _ => {}
        }
    }

    fn lambda(&mut self, fv: &FunctionValue) -> Expr {
        let code = self.code(fv.code);
        let params = params_for(code, fv);
        let body = self.take(fv.code);
        let mut value = match body.as_slice() {
            [Stmt::Return(Some(v))] => v.clone(),
            [Stmt::Expr(y @ Expr::Yield(_)), Stmt::Return(_)] => y.clone(),
            _ => Expr::Unreconstructed { op: "<lambda>".into(), line: Some(code.firstlineno) },
        };
        self.lift(&mut value);
        Expr::Lambda { params: Box::new(params), body: Box::new(value) }
    }

    fn comprehension(&mut self, fv: &FunctionValue, arg: Expr) -> Option<Expr> {
        let code = self.code(fv.code);
        let iter = match arg {
            Expr::Iter(inner) => *inner,
            other => other,
        };
        let mut body = self.bodies.get(fv.code)?.clone()?;
        strip_tail_return(&mut body);
        let mut comp = match body.as_slice() {
            [Stmt::Return(Some(c @ Expr::Comprehension { .. }))] => c.clone(),
            [Stmt::For { target, iter, body, orelse, is_async }] if orelse.is_empty() && code.name == "<genexpr>" => {
                build_comprehension(CompKind::Generator, target.clone(), iter.clone(), *is_async, body)?
            }
            _ => return None,
        };
        self.take(fv.code);
        comp.visit_mut(&mut |x| {
            if matches!(x, Expr::Name(n) if n == ".0") {
                *x = iter.clone();
            }
        });
        self.lift(&mut comp);
        Some(comp)
    }

    fn has_docstring(&self, code: &CodeObject) -> Option<String> {
        let first = code.consts.first()?.as_str()?;
        if self.version >= PyVersion::V3_14 && !code.flags.has(CodeFlags::HAS_DOCSTRING) {
            return None;
        }
        Some(first.to_string())
    }

    fn function_body(&mut self, n: usize) -> Vec<Stmt> {
        let mut body = self.take(n);
        self.fill(&mut body);
        strip_tail_return(&mut body);
        let mut head = Vec::new();
        if let Some(doc) = self.has_docstring(self.code(n)) {
            head.push(Stmt::Expr(Expr::Const(Value::Str(doc))));
        }
        if let Some(scope) = self.scopes.get(n) {
            if !scope.declared_global.is_empty() {
                head.push(Stmt::Global(scope.declared_global.iter().cloned().collect()));
            }
            if !scope.declared_nonlocal.is_empty() {
                head.push(Stmt::Nonlocal(scope.declared_nonlocal.iter().cloned().collect()));
            }
        }
        head.append(&mut body);
        head
    }

    fn class_body(&mut self, n: usize) -> Vec<Stmt> {
        let mut body = self.take(n);
        self.fill(&mut body);
        body.retain(|s| match s {
            Stmt::Assign { targets, .. } => {
                !matches!(targets.as_slice(), [Expr::Name(t)] if CLASS_PREAMBLE.contains(&t.as_str()))
            }
            _ => true,
        });
        if matches!(body.last(), Some(Stmt::Return(_))) {
            body.pop();
        }
        doc_assignment_to_docstring(&mut body);
        body
    }
}

fn doc_assignment_to_docstring(body: &mut [Stmt]) {
    if let Some(first) = body.first_mut() {
        if let Stmt::Assign { targets, value: value @ Expr::Const(Value::Str(_)) } = first {
            if targets.as_slice() == [Expr::name("__doc__")] {
                *first = Stmt::Expr(value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ast::CmpOp;
    use crate::disasm::{disassemble, tests::asm};
    use crate::opcodes::Registry;

    fn structured(version: PyVersion, ops: &[(&str, u32)], consts: Vec<Value>, names: &[&str]) -> Structured {
        structured_with_table(version, ops, &[], consts, names)
    }

    /// `table` holds 3.11+ exception entries as `(start, len, target, depth, lasti)` in
    /// instruction units.
    fn structured_with_table(
        version: PyVersion,
        ops: &[(&str, u32)],
        table: &[(u8, u8, u8, u8, bool)],
        consts: Vec<Value>,
        names: &[&str],
    ) -> Structured {
        let mut code = CodeObject::empty("<module>");
        code.code = asm(version, ops);
        for &(start, len, target, depth, lasti) in table {
            code.exceptiontable.extend([0x80 | start, len, target, depth << 1 | u8::from(lasti)]);
        }
        code.consts = consts;
        code.names = names.iter().map(|s| s.to_string()).collect();
        let tree = CodeTree::build(Arc::new(code));
        let reg = Registry::new();
        let dis = disassemble(&tree.nodes[0].code, version, reg.table(version)).unwrap();
        structure(&tree, 0, &dis)
    }

    fn call(name: &str) -> Stmt {
        Stmt::Expr(Expr::call(Expr::name(name), vec![]))
    }

    #[test]
    fn if_else_312() {
        // if c: a() else: b()
        let s = structured(
            PyVersion::V3_12,
            &[
                ("LOAD_NAME", 0),
                ("POP_JUMP_IF_FALSE", 5),
                ("PUSH_NULL", 0),
                ("LOAD_NAME", 1),
                ("CALL", 0),
                ("POP_TOP", 0),
                ("RETURN_CONST", 0),
                ("PUSH_NULL", 0),
                ("LOAD_NAME", 2),
                ("CALL", 0),
                ("POP_TOP", 0),
                ("RETURN_CONST", 0),
            ],
            vec![Value::None],
            &["c", "a", "b"],
        );
        let mut body = s.body;
        strip_tail_return(&mut body);
        assert_eq!(body, vec![Stmt::If { test: Expr::name("c"), body: vec![call("a")], orelse: vec![call("b")] }]);
        assert!(s.diagnostics.is_empty());
    }

    #[test]
    fn and_condition_chain() {
        // if a and b: x()
        let s = structured(
            PyVersion::V3_12,
            &[
                ("LOAD_NAME", 0),
                ("POP_JUMP_IF_FALSE", 6),
                ("LOAD_NAME", 1),
                ("POP_JUMP_IF_FALSE", 4),
                ("PUSH_NULL", 0),
                ("LOAD_NAME", 2),
                ("CALL", 0),
                ("POP_TOP", 0),
                ("RETURN_CONST", 0),
            ],
            vec![Value::None],
            &["a", "b", "x"],
        );
        let mut body = s.body;
        strip_tail_return(&mut body);
        assert_eq!(
            body,
            vec![Stmt::If {
                test: Expr::BoolOp { op: BoolOp::And, values: vec![Expr::name("a"), Expr::name("b")] },
                body: vec![call("x")],
                orelse: vec![],
            }]
        );
    }

    #[test]
    fn while_loop_with_break_312() {
        // while x: if y: break; f()
        let s = structured(
            PyVersion::V3_12,
            &[
                ("LOAD_NAME", 0),
                ("POP_JUMP_IF_FALSE", 10),
                ("LOAD_NAME", 1),
                ("POP_JUMP_IF_FALSE", 1),
                ("JUMP_FORWARD", 7),
                ("PUSH_NULL", 0),
                ("LOAD_NAME", 2),
                ("CALL", 0),
                ("POP_TOP", 0),
                ("LOAD_NAME", 0),
                ("POP_JUMP_IF_FALSE", 1),
                ("JUMP_BACKWARD", 10),
                ("RETURN_CONST", 0),
            ],
            vec![Value::None],
            &["x", "y", "f"],
        );
        let mut body = s.body;
        strip_tail_return(&mut body);
        assert_eq!(
            body,
            vec![Stmt::While {
                test: Expr::name("x"),
                body: vec![
                    Stmt::If { test: Expr::name("y"), body: vec![Stmt::Break], orelse: vec![] },
                    call("f"),
                ],
                orelse: vec![],
            }]
        );
    }

    #[test]
    fn for_loop_312() {
        // for i in xs: f(i)
        let s = structured(
            PyVersion::V3_12,
            &[
                ("LOAD_NAME", 0),
                ("GET_ITER", 0),
                ("FOR_ITER", 7),
                ("STORE_NAME", 1),
                ("PUSH_NULL", 0),
                ("LOAD_NAME", 2),
                ("LOAD_NAME", 1),
                ("CALL", 1),
                ("POP_TOP", 0),
                ("JUMP_BACKWARD", 8),
                ("END_FOR", 0),
                ("RETURN_CONST", 0),
            ],
            vec![Value::None],
            &["xs", "i", "f"],
        );
        let mut body = s.body;
        strip_tail_return(&mut body);
        assert_eq!(
            body,
            vec![Stmt::For {
                target: Expr::name("i"),
                iter: Expr::name("xs"),
                body: vec![Stmt::Expr(Expr::call(Expr::name("f"), vec![Expr::name("i")]))],
                orelse: vec![],
                is_async: false,
            }]
        );
    }

    #[test]
    fn ternary_value() {
        // x = a if c else b
        let s = structured(
            PyVersion::V3_12,
            &[
                ("LOAD_NAME", 0),
                ("POP_JUMP_IF_FALSE", 2),
                ("LOAD_NAME", 1),
                ("JUMP_FORWARD", 1),
                ("LOAD_NAME", 2),
                ("STORE_NAME", 3),
                ("RETURN_CONST", 0),
            ],
            vec![Value::None],
            &["c", "a", "b", "x"],
        );
        assert_eq!(
            s.body[0],
            Stmt::Assign {
                targets: vec![Expr::name("x")],
                value: Expr::IfExp {
                    test: Box::new(Expr::name("c")),
                    body: Box::new(Expr::name("a")),
                    orelse: Box::new(Expr::name("b")),
                },
            }
        );
    }

    #[test]
    fn or_value_with_copy() {
        // x = a or b
        let s = structured(
            PyVersion::V3_12,
            &[
                ("LOAD_NAME", 0),
                ("COPY", 1),
                ("POP_JUMP_IF_TRUE", 2),
                ("POP_TOP", 0),
                ("LOAD_NAME", 1),
                ("STORE_NAME", 2),
                ("RETURN_CONST", 0),
            ],
            vec![Value::None],
            &["a", "b", "x"],
        );
        assert_eq!(
            s.body[0],
            Stmt::Assign {
                targets: vec![Expr::name("x")],
                value: Expr::BoolOp { op: BoolOp::Or, values: vec![Expr::name("a"), Expr::name("b")] },
            }
        );
    }

    #[test]
    fn compare_chain_in_condition() {
        // if a < b < c: f()
        let s = structured(
            PyVersion::V3_12,
            &[
                ("LOAD_NAME", 0),
                ("LOAD_NAME", 1),
                ("SWAP", 2),
                ("COPY", 2),
                ("COMPARE_OP", 2),
                ("POP_JUMP_IF_FALSE", 8),
                ("LOAD_NAME", 2),
                ("COMPARE_OP", 2),
                ("POP_JUMP_IF_FALSE", 6),
                ("PUSH_NULL", 0),
                ("LOAD_NAME", 3),
                ("CALL", 0),
                ("POP_TOP", 0),
                ("RETURN_CONST", 0),
                ("POP_TOP", 0),
                ("RETURN_CONST", 0),
            ],
            vec![Value::None],
            &["a", "b", "c", "f"],
        );
        let mut body = s.body;
        strip_tail_return(&mut body);
        let lt = Expr::Compare {
            left: Box::new(Expr::name("a")),
            ops: vec![(CmpOp::Lt, Expr::name("b")), (CmpOp::Lt, Expr::name("c"))],
        };
        assert_eq!(body, vec![Stmt::If { test: lt, body: vec![call("f")], orelse: vec![] }]);
    }

    #[test]
    fn with_markers_fold() {
        let mut body = vec![
            Stmt::WithEnter { context: Expr::name("cm"), target: Some(Expr::name("f")), is_async: false },
            call("g"),
            Stmt::WithExit,
            call("h"),
        ];
        tidy(&mut body);
        assert_eq!(
            body,
            vec![
                Stmt::With {
                    items: vec![WithItem { context: Expr::name("cm"), target: Some(Expr::name("f")) }],
                    body: vec![call("g")],
                    is_async: false,
                },
                call("h"),
            ]
        );
    }

    #[test]
    fn handler_clauses() {
        let handler = vec![Stmt::If {
            test: Expr::ExcMatch(Box::new(Expr::name("KeyError"))),
            body: vec![
                Stmt::BindException("e".into()),
                call("log"),
                Stmt::PopExcept,
                Stmt::Assign { targets: vec![Expr::name("e")], value: Expr::none() },
                Stmt::Delete(vec![Expr::name("e")]),
            ],
            orelse: vec![Stmt::If {
                test: Expr::ExcMatch(Box::new(Expr::name("ValueError"))),
                body: vec![call("other"), Stmt::PopExcept],
                orelse: vec![Stmt::Reraise],
            }],
        }];
        let clauses = parse_clauses(handler);
        assert_eq!(
            clauses,
            vec![
                ExceptHandler { typ: Some(Expr::name("KeyError")), name: Some("e".into()), body: vec![call("log")] },
                ExceptHandler { typ: Some(Expr::name("ValueError")), name: None, body: vec![call("other")] },
            ]
        );
    }

    #[test]
    fn finally_copy_is_stripped() {
        let t = build_try(vec![call("a"), call("cleanup")], vec![call("cleanup"), Stmt::Reraise], vec![]);
        assert_eq!(t, vec![Stmt::Try { body: vec![call("a")], handlers: vec![], orelse: vec![], finalbody: vec![call("cleanup")] }]);
    }

    #[test]
    fn compare_chain_as_value_312() {
        // x = 0 < a < 10
        let s = structured(
            PyVersion::V3_12,
            &[
                ("LOAD_CONST", 1),
                ("LOAD_NAME", 0),
                ("SWAP", 2),
                ("COPY", 2),
                ("COMPARE_OP", 2),
                ("COPY", 1),
                ("POP_JUMP_IF_FALSE", 4),
                ("POP_TOP", 0),
                ("LOAD_CONST", 2),
                ("COMPARE_OP", 2),
                ("JUMP_FORWARD", 2),
                ("SWAP", 2),
                ("POP_TOP", 0),
                ("STORE_NAME", 1),
                ("RETURN_CONST", 0),
            ],
            vec![Value::None, Value::Int(0), Value::Int(10)],
            &["a", "x"],
        );
        let chain = Expr::Compare {
            left: Box::new(Expr::Const(Value::Int(0))),
            ops: vec![(CmpOp::Lt, Expr::name("a")), (CmpOp::Lt, Expr::Const(Value::Int(10)))],
        };
        assert_eq!(s.body[0], Stmt::Assign { targets: vec![Expr::name("x")], value: chain });
        assert!(s.diagnostics.is_empty());
    }

    #[test]
    fn compare_chain_returned_310() {
        // return 0 < a < 10, inside a function body
        let s = structured(
            PyVersion::V3_10,
            &[
                ("LOAD_CONST", 1),
                ("LOAD_NAME", 0),
                ("DUP_TOP", 0),
                ("ROT_THREE", 0),
                ("COMPARE_OP", 0),
                ("JUMP_IF_FALSE_OR_POP", 9),
                ("LOAD_CONST", 2),
                ("COMPARE_OP", 0),
                ("RETURN_VALUE", 0),
                ("ROT_TWO", 0),
                ("POP_TOP", 0),
                ("RETURN_VALUE", 0),
            ],
            vec![Value::None, Value::Int(0), Value::Int(10)],
            &["a"],
        );
        let chain = Expr::Compare {
            left: Box::new(Expr::Const(Value::Int(0))),
            ops: vec![(CmpOp::Lt, Expr::name("a")), (CmpOp::Lt, Expr::Const(Value::Int(10)))],
        };
        assert_eq!(s.body, vec![Stmt::Return(Some(chain))]);
    }

    #[test]
    fn and_or_value_311() {
        // c = a and b or 3
        let s = structured(
            PyVersion::V3_11,
            &[
                ("LOAD_NAME", 0),
                ("POP_JUMP_FORWARD_IF_FALSE", 2),
                ("LOAD_NAME", 1),
                ("JUMP_IF_TRUE_OR_POP", 1),
                ("LOAD_CONST", 1),
                ("STORE_NAME", 2),
                ("LOAD_CONST", 0),
                ("RETURN_VALUE", 0),
            ],
            vec![Value::None, Value::Int(3)],
            &["a", "b", "c"],
        );
        let and = Expr::BoolOp { op: BoolOp::And, values: vec![Expr::name("a"), Expr::name("b")] };
        let value = Expr::BoolOp { op: BoolOp::Or, values: vec![and, Expr::Const(Value::Int(3))] };
        assert_eq!(s.body[0], Stmt::Assign { targets: vec![Expr::name("c")], value });
        assert!(s.diagnostics.is_empty());
    }

    #[test]
    fn inlined_loop_exit_becomes_break_312() {
        // while n: if y: break; f()
        // with the exit `return None` copied in place of the break jump
        let s = structured(
            PyVersion::V3_12,
            &[
                ("LOAD_NAME", 0),
                ("POP_JUMP_IF_FALSE", 10),
                ("LOAD_NAME", 1),
                ("POP_JUMP_IF_FALSE", 1),
                ("RETURN_CONST", 0),
                ("PUSH_NULL", 0),
                ("LOAD_NAME", 2),
                ("CALL", 0),
                ("POP_TOP", 0),
                ("LOAD_NAME", 0),
                ("POP_JUMP_IF_FALSE", 1),
                ("JUMP_BACKWARD", 10),
                ("RETURN_CONST", 0),
            ],
            vec![Value::None],
            &["n", "y", "f"],
        );
        let mut body = s.body;
        strip_tail_return(&mut body);
        assert_eq!(
            body,
            vec![Stmt::While {
                test: Expr::name("n"),
                body: vec![Stmt::If { test: Expr::name("y"), body: vec![Stmt::Break], orelse: vec![] }, call("f")],
                orelse: vec![],
            }]
        );
    }

    #[test]
    fn handler_jumping_back_to_the_join_313() {
        // try: a()
        // except E: b()
        // x()
        let s = structured_with_table(
            PyVersion::V3_13,
            &[
                ("RESUME", 0),
                ("LOAD_NAME", 0),
                ("PUSH_NULL", 0),
                ("CALL", 0),
                ("POP_TOP", 0),
                ("LOAD_NAME", 3),
                ("PUSH_NULL", 0),
                ("CALL", 0),
                ("POP_TOP", 0),
                ("RETURN_CONST", 0),
                ("PUSH_EXC_INFO", 0),
                ("LOAD_NAME", 1),
                ("CHECK_EXC_MATCH", 0),
                ("POP_JUMP_IF_FALSE", 7),
                ("POP_TOP", 0),
                ("LOAD_NAME", 2),
                ("PUSH_NULL", 0),
                ("CALL", 0),
                ("POP_TOP", 0),
                ("POP_EXCEPT", 0),
                ("JUMP_BACKWARD_NO_INTERRUPT", 16),
                ("RERAISE", 0),
                ("COPY", 3),
                ("POP_EXCEPT", 0),
                ("RERAISE", 1),
            ],
            &[(1, 4, 10, 0, false), (10, 9, 22, 1, true), (21, 1, 22, 1, true)],
            vec![Value::None],
            &["a", "E", "b", "x"],
        );
        let mut body = s.body;
        strip_tail_return(&mut body);
        assert_eq!(
            body,
            vec![
                Stmt::Try {
                    body: vec![call("a")],
                    handlers: vec![ExceptHandler { typ: Some(Expr::name("E")), name: None, body: vec![call("b")] }],
                    orelse: vec![],
                    finalbody: vec![],
                },
                call("x"),
            ]
        );
        assert!(s.diagnostics.is_empty());
    }

    #[test]
    fn return_after_with_stays_outside() {
        let mut body = vec![
            Stmt::WithEnter { context: Expr::name("cm"), target: None, is_async: false },
            call("f"),
            Stmt::WithExit,
            Stmt::Return(Some(Expr::name("y"))),
        ];
        tidy(&mut body);
        assert_eq!(
            body,
            vec![
                Stmt::With { items: vec![WithItem { context: Expr::name("cm"), target: None }], body: vec![call("f")], is_async: false },
                Stmt::Return(Some(Expr::name("y"))),
            ]
        );
    }

    #[test]
    fn copied_join_is_hoisted_out_of_both_arms() {
        let ret = || Stmt::Return(Some(Expr::name("x")));
        let assign = |v: i64| Stmt::Assign { targets: vec![Expr::name("x")], value: Expr::Const(Value::Int(v)) };
        let mut body = vec![Stmt::If { test: Expr::name("c"), body: vec![assign(1), ret()], orelse: vec![assign(2), ret()] }];
        tidy(&mut body);
        assert_eq!(body, vec![Stmt::If { test: Expr::name("c"), body: vec![assign(1)], orelse: vec![assign(2)] }, ret()]);

        // The same join after an arm that returns early.
        let mut body = vec![Stmt::If { test: Expr::name("c"), body: vec![assign(1), ret()], orelse: vec![] }, assign(2), ret()];
        tidy(&mut body);
        assert_eq!(body, vec![Stmt::If { test: Expr::name("c"), body: vec![assign(1)], orelse: vec![assign(2)] }, ret()]);
    }

    #[test]
    fn guard_clause_keeps_its_return() {
        let none = || Stmt::Return(Some(Expr::none()));
        let mut body = vec![Stmt::If { test: Expr::name("c"), body: vec![call("log"), none()], orelse: vec![] }, call("run"), none()];
        let before = body.clone();
        tidy(&mut body);
        assert_eq!(body, before);
    }

    #[test]
    fn copied_join_is_hoisted_out_of_try() {
        let none = || Stmt::Return(Some(Expr::none()));
        let mut body = vec![Stmt::Try {
            body: vec![call("a")],
            handlers: vec![ExceptHandler { typ: Some(Expr::name("E")), name: None, body: vec![call("b"), call("x"), none()] }],
            orelse: vec![call("c"), call("x"), none()],
            finalbody: vec![],
        }];
        tidy(&mut body);
        assert_eq!(
            body,
            vec![
                Stmt::Try {
                    body: vec![call("a")],
                    handlers: vec![ExceptHandler { typ: Some(Expr::name("E")), name: None, body: vec![call("b")] }],
                    orelse: vec![call("c")],
                    finalbody: vec![],
                },
                call("x"),
                none(),
            ]
        );
    }

    #[test]
    fn clauses_laid_out_one_after_another() {
        let handler = vec![
            Stmt::If {
                test: Expr::ExcMatch(Box::new(Expr::name("ValueError"))),
                body: vec![Stmt::BindException("e".into()), call("log"), Stmt::PopExcept],
                orelse: vec![],
            },
            Stmt::If { test: Expr::ExcMatch(Box::new(Expr::name("KeyError"))), body: vec![call("other"), Stmt::PopExcept], orelse: vec![] },
            Stmt::Reraise,
        ];
        assert_eq!(
            parse_clauses(handler),
            vec![
                ExceptHandler { typ: Some(Expr::name("ValueError")), name: Some("e".into()), body: vec![call("log")] },
                ExceptHandler { typ: Some(Expr::name("KeyError")), name: None, body: vec![call("other")] },
            ]
        );
    }

    #[test]
    fn finally_around_try_except_with_code_after() {
        // try: (try: a() except E: b()) finally: done()
        // x()
        let inner = Stmt::Try {
            body: vec![call("a")],
            handlers: vec![ExceptHandler { typ: Some(Expr::name("E")), name: None, body: vec![call("b")] }],
            orelse: vec![],
            finalbody: vec![],
        };
        let none = || Stmt::Return(Some(Expr::none()));
        let out = build_try(vec![inner.clone(), call("done"), call("x"), none()], vec![call("done"), Stmt::Reraise], vec![]);
        let Stmt::Try { body, handlers, orelse, .. } = inner else { unreachable!() };
        assert_eq!(out, vec![Stmt::Try { body, handlers, orelse, finalbody: vec![call("done")] }, call("x"), none()]);
    }

    #[test]
    fn finally_copy_ahead_of_code_after() {
        // 3.12 runs the normal-path copy and then falls into the following code.
        let out = build_try(vec![call("a")], vec![call("done"), Stmt::Reraise], vec![call("done"), call("x")]);
        assert_eq!(
            out,
            vec![Stmt::Try { body: vec![call("a")], handlers: vec![], orelse: vec![], finalbody: vec![call("done")] }, call("x")]
        );
    }

    #[test]
    fn implicit_return_dropped_inside_finally() {
        let mut body = vec![Stmt::Try {
            body: vec![call("a"), Stmt::Return(Some(Expr::none()))],
            handlers: vec![],
            orelse: vec![],
            finalbody: vec![call("done")],
        }];
        strip_tail_return(&mut body);
        assert_eq!(body, vec![Stmt::Try { body: vec![call("a")], handlers: vec![], orelse: vec![], finalbody: vec![call("done")] }]);
    }
}
