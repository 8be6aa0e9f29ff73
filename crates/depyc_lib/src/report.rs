//! Read-only views handed to the enrichment, import-inference and quality collaborators.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::ast::{Expr, Stmt};
use crate::error::Diagnostic;
use crate::version::PyVersion;

/// Fidelity tallies for one decompiled container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecompileReport {
    pub version: PyVersion,
    pub lines: usize,
    pub functions: usize,
    pub classes: usize,
    /// Unreconstructed markers, raw blocks and gotos left in the tree.
    pub unreconstructed: usize,
    pub total_nodes: usize,
    /// Global names with no binding anywhere in the module and no builtin meaning.
    pub unresolved_globals: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Default)]
struct Tally {
    functions: usize,
    classes: usize,
    unreconstructed: usize,
    nodes: usize,
}

impl Tally {
    fn stmts(&mut self, body: &[Stmt]) {
        for s in body {
            self.nodes += 1;
            match s {
                Stmt::FunctionDef(_) => self.functions += 1,
                Stmt::ClassDef(_) => self.classes += 1,
                Stmt::Unreconstructed { .. } | Stmt::RawBlock { .. } | Stmt::Goto { .. } => self.unreconstructed += 1,
                _ => {}
            }
            for e in s.exprs() {
                self.expr(e);
            }
            for b in s.bodies() {
                self.stmts(b);
            }
        }
    }

    fn expr(&mut self, e: &Expr) {
        e.walk(&mut |x| {
            self.nodes += 1;
            match x {
                Expr::Unreconstructed { .. } => self.unreconstructed += 1,
                Expr::Lambda { .. } => self.functions += 1,
                _ => {}
            }
        });
    }
}

impl DecompileReport {
    pub fn build(
        version: PyVersion,
        body: &[Stmt],
        source: &str,
        unresolved: &BTreeSet<String>,
        diagnostics: Vec<Diagnostic>,
    ) -> Self {
        let mut t = Tally::default();
        t.stmts(body);
        DecompileReport {
            version,
            lines: source.lines().count(),
            functions: t.functions,
            classes: t.classes,
            unreconstructed: t.unreconstructed,
            total_nodes: t.nodes,
            unresolved_globals: unresolved.iter().cloned().collect(),
            diagnostics,
        }
    }
}

fn defined_at_module(body: &[Stmt]) -> BTreeSet<&str> {
    let mut out = BTreeSet::new();
    for s in body {
        match s {
            Stmt::FunctionDef(f) => {
                out.insert(f.name.as_str());
            }
            Stmt::ClassDef(c) => {
                out.insert(c.name.as_str());
            }
            Stmt::Assign { targets, .. } => {
                for t in targets {
                    if let Expr::Name(n) = t {
                        out.insert(n.as_str());
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Insert collaborator-supplied declarations after the module's imports. Names the
/// module already binds are left alone.
pub fn insert_declarations(body: &mut Vec<Stmt>, declarations: &BTreeMap<String, String>) {
    if declarations.is_empty() {
        return;
    }
    let defined: BTreeSet<String> = defined_at_module(body).into_iter().map(str::to_string).collect();
    let at = body.iter().take_while(|s| matches!(s, Stmt::Import(_) | Stmt::ImportFrom { .. })).count();
    let decls: Vec<Stmt> = declarations
        .iter()
        .filter(|(name, _)| !defined.contains(*name))
        .map(|(name, text)| Stmt::Declaration { name: name.clone(), text: text.clone() })
        .collect();
    body.splice(at..at, decls);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Alias;

    #[test]
    fn counts_markers_and_definitions() {
        let body = vec![
            Stmt::Unreconstructed { op: "<254>".into(), line: Some(1) },
            Stmt::Assign { targets: vec![Expr::name("f")], value: Expr::Lambda { params: Box::default(), body: Box::new(Expr::none()) } },
        ];
        let r = DecompileReport::build(PyVersion::V3_12, &body, "a\nb\n", &BTreeSet::new(), vec![]);
        assert_eq!(r.unreconstructed, 1);
        assert_eq!(r.functions, 1);
        assert_eq!(r.lines, 2);
        assert_eq!(r.total_nodes, 2 + 3);
    }

    #[test]
    fn declarations_follow_imports_and_skip_bound_names() {
        let mut body = vec![
            Stmt::Import(vec![Alias { name: "ctypes".into(), asname: None }]),
            Stmt::Assign { targets: vec![Expr::name("POINT")], value: Expr::none() },
        ];
        let decls = BTreeMap::from([
            ("POINT".to_string(), "class POINT: ...".to_string()),
            ("RECT".to_string(), "class RECT: ...".to_string()),
        ]);
        insert_declarations(&mut body, &decls);
        assert_eq!(body.len(), 3);
        assert_eq!(body[1], Stmt::Declaration { name: "RECT".into(), text: "class RECT: ...".into() });
    }
}
