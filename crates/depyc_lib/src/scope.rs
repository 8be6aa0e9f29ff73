//! Name classification and the closure map linking free variables to the cell that owns them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::disasm::{Argval, Disassembly};
use crate::error::Diagnostic;
use crate::marshal::{CodeFlags, CodeObject, Parameters, Value};
use crate::opcodes::Op;

/// One code object in the flattened tree.
#[derive(Debug, Clone)]
pub struct CodeNode {
    pub code: Arc<CodeObject>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Constant-pool index of each nested code object, mapped to its node.
    pub const_children: HashMap<usize, usize>,
}

/// Code objects in preorder; a parent always precedes its children.
#[derive(Debug, Clone)]
pub struct CodeTree {
    pub nodes: Vec<CodeNode>,
}

impl CodeTree {
    pub fn build(root: Arc<CodeObject>) -> CodeTree {
        let mut tree = CodeTree { nodes: Vec::new() };
        tree.push(root, None);
        tree
    }

    fn push(&mut self, code: Arc<CodeObject>, parent: Option<usize>) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(CodeNode { code: code.clone(), parent, children: Vec::new(), const_children: HashMap::new() });
        for (ci, c) in code.consts.iter().enumerate() {
            if let Value::Code(child) = c {
                let cidx = self.push(child.clone(), Some(idx));
                self.nodes[idx].children.push(cidx);
                self.nodes[idx].const_children.insert(ci, cidx);
            }
        }
        idx
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn child_for_const(&self, node: usize, const_idx: usize) -> Option<usize> {
        self.nodes.get(node)?.const_children.get(&const_idx).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Binding {
    Local,
    Cell,
    Free,
    Global,
    Builtin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScopeKind {
    Module,
    Class,
    Function,
}

/// The cell a free variable reads through: owning node and slot in its `cellvars`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellRef {
    pub owner: usize,
    pub slot: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeInfo {
    pub kind: ScopeKind,
    pub params: Parameters,
    pub bindings: BTreeMap<String, Binding>,
    /// Names assigned through `STORE_GLOBAL` from a non-module scope.
    pub declared_global: BTreeSet<String>,
    /// Free variables this scope assigns to.
    pub declared_nonlocal: BTreeSet<String>,
    pub closure: BTreeMap<String, CellRef>,
}

/// Frozen result of scope analysis, shared read-only by the per-scope workers.
#[derive(Debug, Clone, Default)]
pub struct ScopeMap {
    pub scopes: Vec<ScopeInfo>,
    pub unresolved_globals: BTreeSet<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ScopeMap {
    pub fn get(&self, node: usize) -> Option<&ScopeInfo> {
        self.scopes.get(node)
    }
}

const BUILTINS: &[&str] = &[
    "__build_class__", "__import__", "__name__", "__file__", "__doc__", "abs", "aiter", "all", "anext", "any",
    "ascii", "bin", "bool", "breakpoint", "bytearray", "bytes", "callable", "chr", "classmethod", "compile",
    "complex", "delattr", "dict", "dir", "divmod", "enumerate", "eval", "exec", "filter", "float", "format",
    "frozenset", "getattr", "globals", "hasattr", "hash", "help", "hex", "id", "input", "int", "isinstance",
    "issubclass", "iter", "len", "list", "locals", "map", "max", "memoryview", "min", "next", "object", "oct",
    "open", "ord", "pow", "print", "property", "range", "repr", "reversed", "round", "set", "setattr", "slice",
    "sorted", "staticmethod", "str", "sum", "super", "tuple", "type", "vars", "zip", "NotImplemented",
    "Ellipsis", "BaseException", "Exception", "ArithmeticError", "AssertionError", "AttributeError",
    "EOFError", "ImportError", "ModuleNotFoundError", "IndexError", "KeyError", "KeyboardInterrupt",
    "LookupError", "MemoryError", "NameError", "NotImplementedError", "OSError", "IOError", "OverflowError",
    "RecursionError", "RuntimeError", "StopIteration", "StopAsyncIteration", "SyntaxError", "SystemExit",
    "TypeError", "UnboundLocalError", "UnicodeError", "UnicodeDecodeError", "UnicodeEncodeError",
    "ValueError", "ZeroDivisionError", "FileNotFoundError", "FileExistsError", "PermissionError",
    "TimeoutError", "ConnectionError", "BrokenPipeError", "ExceptionGroup", "BaseExceptionGroup", "Warning",
    "UserWarning", "DeprecationWarning", "RuntimeWarning", "GeneratorExit",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn kind_of(node: usize, code: &CodeObject) -> ScopeKind {
    if node == 0 {
        ScopeKind::Module
    } else if code.flags.has(CodeFlags::OPTIMIZED) {
        ScopeKind::Function
    } else {
        ScopeKind::Class
    }
}

/// Classify every name operand, parents before children. `disassemblies[i]` is `None`
/// for a scope that failed to decode; it still gets a closure map from its code object.
pub fn analyze(tree: &CodeTree, disassemblies: &[Option<&Disassembly>]) -> ScopeMap {
    let mut map = ScopeMap::default();
    let mut module_defined: BTreeSet<String> = BTreeSet::new();
    let mut loaded_globals: BTreeSet<String> = BTreeSet::new();

    for (idx, node) in tree.nodes.iter().enumerate() {
        let code = &node.code;
        let kind = kind_of(idx, code);
        let mut info = ScopeInfo {
            kind,
            params: code.parameters(),
            bindings: BTreeMap::new(),
            declared_global: BTreeSet::new(),
            declared_nonlocal: BTreeSet::new(),
            closure: BTreeMap::new(),
        };
        for p in info.params.names() {
            info.bindings.insert(p.clone(), if code.cellvars.contains(p) { Binding::Cell } else { Binding::Local });
        }

        for free in &code.freevars {
            match resolve_free(tree, idx, free) {
                Some(cell) => {
                    info.closure.insert(free.clone(), cell);
                    info.bindings.insert(free.clone(), Binding::Free);
                }
                None => {
                    let d = Diagnostic::UnresolvedBinding { scope: code.qualname.clone(), name: free.clone() };
                    warn!(scope = %code.qualname, name = %free, "free variable has no enclosing cell, treating as global");
                    map.diagnostics.push(d);
                    info.bindings.insert(free.clone(), Binding::Global);
                }
            }
        }

        let Some(dis) = disassemblies.get(idx).copied().flatten() else {
            map.scopes.push(info);
            continue;
        };
        let mut class_stored: BTreeSet<String> = BTreeSet::new();
        for ins in &dis.instrs {
            let names: Vec<&str> = match &ins.argval {
                Argval::Name(n) => vec![n.as_str()],
                Argval::NamePair(a, b) => vec![a.as_str(), b.as_str()],
                _ => continue,
            };
            for name in names {
                match ins.op {
                    Op::LoadFast
                    | Op::StoreFast
                    | Op::DeleteFast
                    | Op::LoadFastAndClear
                    | Op::LoadFastLoadFast
                    | Op::StoreFastLoadFast
                    | Op::StoreFastStoreFast => {
                        info.bindings.entry(name.to_string()).or_insert(Binding::Local);
                    }
                    Op::LoadDeref
                    | Op::StoreDeref
                    | Op::DeleteDeref
                    | Op::LoadClosure
                    | Op::MakeCell
                    | Op::LoadFromDictOrDeref => {
                        if code.cellvars.iter().any(|c| c == name) {
                            info.bindings.insert(name.to_string(), Binding::Cell);
                        } else if code.freevars.iter().any(|c| c == name) {
                            if matches!(ins.op, Op::StoreDeref | Op::DeleteDeref) {
                                info.declared_nonlocal.insert(name.to_string());
                            }
                        } else if !info.bindings.contains_key(name) {
                            let d = Diagnostic::UnresolvedBinding { scope: code.qualname.clone(), name: name.to_string() };
                            warn!(scope = %code.qualname, name, "cell reference outside cell and free lists");
                            map.diagnostics.push(d);
                            info.bindings.insert(name.to_string(), Binding::Global);
                        }
                    }
                    Op::StoreGlobal | Op::DeleteGlobal => {
                        info.bindings.insert(name.to_string(), Binding::Global);
                        if kind == ScopeKind::Module {
                            module_defined.insert(name.to_string());
                        } else {
                            info.declared_global.insert(name.to_string());
                            module_defined.insert(name.to_string());
                        }
                    }
                    Op::LoadGlobal => {
                        let b = if is_builtin(name) { Binding::Builtin } else { Binding::Global };
                        info.bindings.entry(name.to_string()).or_insert(b);
                        loaded_globals.insert(name.to_string());
                    }
                    Op::StoreName | Op::DeleteName if kind != ScopeKind::Function => {
                        match kind {
                            ScopeKind::Module => {
                                module_defined.insert(name.to_string());
                                info.bindings.insert(name.to_string(), Binding::Global);
                            }
                            _ => {
                                class_stored.insert(name.to_string());
                                info.bindings.insert(name.to_string(), Binding::Local);
                            }
                        }
                    }
                    Op::LoadName | Op::LoadFromDictOrGlobals => {
                        if kind == ScopeKind::Class && class_stored.contains(name) {
                            continue;
                        }
                        let b = if is_builtin(name) { Binding::Builtin } else { Binding::Global };
                        info.bindings.entry(name.to_string()).or_insert(b);
                        loaded_globals.insert(name.to_string());
                    }
                    _ => {}
                }
            }
        }
        debug!(scope = %code.qualname, names = info.bindings.len(), cells = info.closure.len(), "scope analyzed");
        map.scopes.push(info);
    }

    map.unresolved_globals = loaded_globals
        .into_iter()
        .filter(|n| !module_defined.contains(n) && !is_builtin(n))
        .collect();
    map
}

/// Walk outward from `node`'s parent: a cell ends the search, a free variable of the
/// same name passes it on to the next enclosing scope.
fn resolve_free(tree: &CodeTree, node: usize, name: &str) -> Option<CellRef> {
    let mut cur = tree.nodes[node].parent;
    while let Some(p) = cur {
        let code = &tree.nodes[p].code;
        if let Some(slot) = code.cellvars.iter().position(|c| c == name) {
            return Some(CellRef { owner: p, slot });
        }
        if !code.freevars.iter().any(|f| f == name) {
            return None;
        }
        cur = tree.nodes[p].parent;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::{disassemble, tests::asm};
    use crate::opcodes::Registry;
    use crate::version::PyVersion;

    const V: PyVersion = PyVersion::V3_12;

    fn function(name: &str, ops: &[(&str, u32)]) -> CodeObject {
        let mut code = CodeObject::empty(name);
        code.flags = CodeFlags(CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS);
        code.code = asm(V, ops);
        code.consts = vec![Value::None];
        code
    }

    fn analyze_tree(root: CodeObject) -> (CodeTree, ScopeMap) {
        let tree = CodeTree::build(Arc::new(root));
        let reg = Registry::new();
        let dis: Vec<Disassembly> =
            tree.nodes.iter().map(|n| disassemble(&n.code, V, reg.table(V)).unwrap()).collect();
        let refs: Vec<Option<&Disassembly>> = dis.iter().map(Some).collect();
        let map = analyze(&tree, &refs);
        (tree, map)
    }

    /// `def outer(): x = 1; def inner(): return x`
    fn closure_module(inner_free: &str) -> CodeObject {
        let mut inner = function("inner", &[("LOAD_DEREF", 0), ("RETURN_VALUE", 0)]);
        inner.freevars = vec![inner_free.into()];
        inner.fast_names = inner.freevars.clone();
        inner.deref_names = inner.freevars.clone();

        let mut outer = function(
            "outer",
            &[("MAKE_CELL", 0), ("LOAD_CONST", 1), ("STORE_DEREF", 0), ("LOAD_CLOSURE", 0), ("RETURN_CONST", 0)],
        );
        outer.consts = vec![Value::None, Value::Int(1), Value::Code(Arc::new(inner))];
        outer.cellvars = vec!["x".into()];
        outer.fast_names = outer.cellvars.clone();
        outer.deref_names = outer.cellvars.clone();

        let mut module = CodeObject::empty("<module>");
        module.code = asm(V, &[("LOAD_GLOBAL", 0), ("STORE_NAME", 1), ("RETURN_CONST", 0)]);
        module.consts = vec![Value::None, Value::Code(Arc::new(outer))];
        module.names = vec!["helper".into(), "outer".into()];
        module
    }

    #[test]
    fn tree_is_preorder() {
        let (tree, _) = analyze_tree(closure_module("x"));
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.nodes[1].code.name, "outer");
        assert_eq!(tree.nodes[2].parent, Some(1));
        assert_eq!(tree.child_for_const(0, 1), Some(1));
        assert_eq!(tree.child_for_const(1, 2), Some(2));
    }

    #[test]
    fn free_variable_resolves_to_enclosing_cell() {
        let (_, map) = analyze_tree(closure_module("x"));
        let inner = map.get(2).unwrap();
        assert_eq!(inner.closure.get("x"), Some(&CellRef { owner: 1, slot: 0 }));
        assert_eq!(inner.bindings.get("x"), Some(&Binding::Free));
        assert_eq!(map.get(1).unwrap().bindings.get("x"), Some(&Binding::Cell));
        assert!(map.diagnostics.is_empty());
    }

    #[test]
    fn unresolved_free_variable_falls_back_with_diagnostic() {
        let (_, map) = analyze_tree(closure_module("y"));
        let inner = map.get(2).unwrap();
        assert!(inner.closure.is_empty());
        assert_eq!(inner.bindings.get("y"), Some(&Binding::Global));
        assert_eq!(
            map.diagnostics,
            vec![Diagnostic::UnresolvedBinding { scope: "inner".into(), name: "y".into() }]
        );
    }

    #[test]
    fn unresolved_globals_exclude_module_names_and_builtins() {
        let (_, map) = analyze_tree(closure_module("x"));
        assert_eq!(map.unresolved_globals.iter().collect::<Vec<_>>(), vec!["helper"]);
        assert_eq!(map.get(0).unwrap().kind, ScopeKind::Module);
        assert_eq!(map.get(1).unwrap().kind, ScopeKind::Function);
    }
}
