//! The last corrective passes before emission: synthetic temporaries get real names,
//! module statements are grouped, and sibling definitions are ordered so that every
//! load-time reference between them points backwards.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::ast::{visit_bodies_mut, visit_exprs_mut, Expr, Stmt};

/// Run every fixer pass over a module body.
pub fn fix(body: &mut Vec<Stmt>) {
    rename_temporaries(body);
    merge_imports(body);
    layout(body);
    visit_bodies_mut(body, &mut order_definition_runs);
}

fn collect_names(body: &[Stmt], out: &mut BTreeSet<String>) {
    for s in body {
        for e in s.exprs() {
            e.walk(&mut |x| {
                if let Expr::Name(n) = x {
                    out.insert(n.clone());
                }
            });
        }
        match s {
            Stmt::FunctionDef(f) => {
                out.insert(f.name.clone());
            }
            Stmt::ClassDef(c) => {
                out.insert(c.name.clone());
            }
            _ => {}
        }
        for b in s.bodies() {
            collect_names(b, out);
        }
    }
}

fn is_synthetic(name: &str) -> bool {
    name.starts_with('$') || name.starts_with('.')
}

/// Give stack temporaries (`$t0`) and leftover implicit arguments (`.0`) stable names
/// that cannot collide with anything the program already uses.
pub fn rename_temporaries(body: &mut [Stmt]) {
    let mut names = BTreeSet::new();
    collect_names(body, &mut names);
    let mut mapping: BTreeMap<String, String> = BTreeMap::new();
    let mut next = 0usize;
    for old in names.iter().filter(|n| is_synthetic(n)) {
        let mut candidate = format!("_t{next}");
        while names.contains(&candidate) || mapping.values().any(|v| *v == candidate) {
            next += 1;
            candidate = format!("_t{next}");
        }
        next += 1;
        mapping.insert(old.clone(), candidate);
    }
    if mapping.is_empty() {
        return;
    }
    debug!(count = mapping.len(), "renaming temporaries");
    visit_exprs_mut(body, &mut |e| {
        if let Expr::Name(n) = e {
            if let Some(new) = mapping.get(n) {
                *n = new.clone();
            }
        }
    });
}

/// Fold `from m import a` directly followed by `from m import b`.
pub fn merge_imports(body: &mut Vec<Stmt>) {
    let old = std::mem::take(body);
    for s in old {
        if let (
            Some(Stmt::ImportFrom { module: m1, names: n1, level: l1 }),
            Stmt::ImportFrom { module: m2, names: n2, level: l2 },
        ) = (body.last_mut(), &s)
        {
            let star = n1.iter().chain(n2.iter()).any(|a| a.name == "*");
            if m1 == m2 && l1 == l2 && !star {
                n1.extend(n2.iter().cloned());
                continue;
            }
        }
        body.push(s);
    }
}

fn is_import(s: &Stmt) -> bool {
    matches!(s, Stmt::Import(_) | Stmt::ImportFrom { .. })
}

fn is_definition(s: &Stmt) -> bool {
    matches!(s, Stmt::FunctionDef(_) | Stmt::ClassDef(_))
}

fn definition_name(s: &Stmt) -> Option<&str> {
    match s {
        Stmt::FunctionDef(f) => Some(&f.name),
        Stmt::ClassDef(c) => Some(&c.name),
        _ => None,
    }
}

fn names_in(e: &Expr, out: &mut BTreeSet<String>) {
    e.walk(&mut |x| {
        if let Expr::Name(n) = x {
            out.insert(n.clone());
        }
    });
}

/// Names a definition needs while it is being executed: decorators, defaults, bases,
/// and for classes everything the class body evaluates directly.
fn load_time_refs(s: &Stmt, out: &mut BTreeSet<String>) {
    for e in s.exprs() {
        names_in(e, out);
    }
    match s {
        Stmt::FunctionDef(f) => {
            if let Some(r) = &f.returns {
                names_in(r, out);
            }
        }
        Stmt::ClassDef(c) => {
            for inner in &c.body {
                if is_definition(inner) {
                    load_time_refs(inner, out);
                } else {
                    for e in inner.exprs() {
                        names_in(e, out);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Module layout: imports, then definitions in dependency order, then everything else.
/// Each group keeps its relative order.
pub fn layout(body: &mut Vec<Stmt>) {
    let old = std::mem::take(body);
    let (imports, rest): (Vec<Stmt>, Vec<Stmt>) = old.into_iter().partition(is_import);
    let (defs, rest): (Vec<Stmt>, Vec<Stmt>) = rest.into_iter().partition(is_definition);
    body.extend(imports);
    body.extend(order_definitions(defs));
    body.extend(rest);
}

/// Reorder each maximal run of adjacent definitions inside a body.
fn order_definition_runs(body: &mut Vec<Stmt>) {
    let mut i = 0;
    while i < body.len() {
        if !is_definition(&body[i]) {
            i += 1;
            continue;
        }
        let j = (i..body.len()).find(|&k| !is_definition(&body[k])).unwrap_or(body.len());
        if j - i > 1 {
            let run: Vec<Stmt> = body.drain(i..j).collect();
            let ordered = order_definitions(run);
            body.splice(i..i, ordered);
        }
        i = j;
    }
}

/// Topological order over load-time references. Members of a reference cycle stay in
/// their original relative order; ties go to the earlier definition.
pub fn order_definitions(defs: Vec<Stmt>) -> Vec<Stmt> {
    let n = defs.len();
    if n < 2 {
        return defs;
    }
    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (i, d) in defs.iter().enumerate() {
        if let Some(name) = definition_name(d) {
            // Rebinding a name: later definitions win, as at runtime.
            index_of.insert(name, i);
        }
    }
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, d) in defs.iter().enumerate() {
        let mut refs = BTreeSet::new();
        load_time_refs(d, &mut refs);
        for r in refs {
            if let Some(&j) = index_of.get(r.as_str()) {
                if j != i {
                    deps[i].push(j);
                }
            }
        }
    }

    let comp = strongly_connected(&deps);
    let ncomp = comp.iter().copied().max().map_or(0, |m| m + 1);
    let mut comp_min = vec![usize::MAX; ncomp];
    for (i, &c) in comp.iter().enumerate() {
        comp_min[c] = comp_min[c].min(i);
    }
    let mut indegree = vec![0usize; ncomp];
    let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); ncomp];
    for (i, ds) in deps.iter().enumerate() {
        for &j in ds {
            let (from, to) = (comp[j], comp[i]);
            if from != to && edges[from].insert(to) {
                indegree[to] += 1;
            }
        }
    }
    // Kahn's algorithm keyed by each component's first original index.
    let mut ready: BTreeSet<(usize, usize)> =
        (0..ncomp).filter(|&c| indegree[c] == 0).map(|c| (comp_min[c], c)).collect();
    let mut order = Vec::with_capacity(n);
    while let Some((_, c)) = ready.pop_first() {
        order.extend((0..n).filter(|&i| comp[i] == c));
        for &to in &edges[c] {
            indegree[to] -= 1;
            if indegree[to] == 0 {
                ready.insert((comp_min[to], to));
            }
        }
    }

    let mut slots: Vec<Option<Stmt>> = defs.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

/// Tarjan's algorithm; returns a component id per node.
fn strongly_connected(deps: &[Vec<usize>]) -> Vec<usize> {
    struct State<'g> {
        deps: &'g [Vec<usize>],
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        comp: Vec<usize>,
        next_index: usize,
        next_comp: usize,
    }

    fn visit(s: &mut State<'_>, v: usize) {
        s.index[v] = Some(s.next_index);
        s.low[v] = s.next_index;
        s.next_index += 1;
        s.stack.push(v);
        s.on_stack[v] = true;
        for &w in &s.deps[v] {
            match s.index[w] {
                None => {
                    visit(s, w);
                    s.low[v] = s.low[v].min(s.low[w]);
                }
                Some(iw) if s.on_stack[w] => s.low[v] = s.low[v].min(iw),
                Some(_) => {}
            }
        }
        if Some(s.low[v]) == s.index[v] {
            while let Some(w) = s.stack.pop() {
                s.on_stack[w] = false;
                s.comp[w] = s.next_comp;
                if w == v {
                    break;
                }
            }
            s.next_comp += 1;
        }
    }

    let n = deps.len();
    let mut s = State {
        deps,
        index: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        comp: vec![0; n],
        next_index: 0,
        next_comp: 0,
    };
    for v in 0..n {
        if s.index[v].is_none() {
            visit(&mut s, v);
        }
    }
    s.comp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Alias, ClassDef, FunctionDef, ParamList};

    fn class(name: &str, bases: &[&str]) -> Stmt {
        Stmt::ClassDef(Box::new(ClassDef {
            name: name.into(),
            bases: bases.iter().map(|b| Expr::name(*b)).collect(),
            keywords: vec![],
            body: vec![Stmt::Pass],
            decorators: vec![],
            code: 0,
        }))
    }

    fn func(name: &str, decorators: &[&str], body: Vec<Stmt>) -> Stmt {
        Stmt::FunctionDef(Box::new(FunctionDef {
            name: name.into(),
            params: ParamList::default(),
            body,
            decorators: decorators.iter().map(|d| Expr::name(*d)).collect(),
            returns: None,
            is_async: false,
            code: 0,
        }))
    }

    fn names(body: &[Stmt]) -> Vec<&str> {
        body.iter().filter_map(definition_name).collect()
    }

    #[test]
    fn base_class_moves_before_subclass() {
        let ordered = order_definitions(vec![class("B", &["A"]), class("A", &[]), class("C", &[])]);
        assert_eq!(names(&ordered), ["A", "B", "C"]);
    }

    #[test]
    fn function_body_references_do_not_reorder() {
        let call_g = Stmt::Expr(Expr::call(Expr::name("g"), vec![]));
        let ordered = order_definitions(vec![func("f", &[], vec![call_g]), func("g", &[], vec![])]);
        assert_eq!(names(&ordered), ["f", "g"]);
    }

    #[test]
    fn cycles_keep_definition_order() {
        let ordered = order_definitions(vec![class("X", &["Y"]), class("Y", &["X"]), func("deco", &[], vec![])]);
        assert_eq!(names(&ordered), ["X", "Y", "deco"]);
    }

    #[test]
    fn reordering_is_idempotent() {
        let input = vec![func("f", &["deco"], vec![]), class("B", &["A"]), func("deco", &[], vec![]), class("A", &[])];
        let once = order_definitions(input);
        let twice = order_definitions(once.clone());
        assert_eq!(once, twice);
        assert_eq!(names(&once), ["deco", "f", "A", "B"]);
    }

    #[test]
    fn layout_groups_imports_first() {
        let mut body = vec![
            Stmt::Assign { targets: vec![Expr::name("x")], value: Expr::Const(crate::marshal::Value::Int(1)) },
            Stmt::Import(vec![Alias { name: "os".into(), asname: None }]),
            func("f", &[], vec![]),
        ];
        layout(&mut body);
        assert!(matches!(body[0], Stmt::Import(_)));
        assert!(matches!(body[1], Stmt::FunctionDef(_)));
        assert!(matches!(body[2], Stmt::Assign { .. }));
    }

    #[test]
    fn temporaries_avoid_existing_names() {
        let mut body = vec![
            Stmt::Assign { targets: vec![Expr::name("_t0")], value: Expr::name("$t0") },
            Stmt::Expr(Expr::name("$t1")),
        ];
        rename_temporaries(&mut body);
        assert_eq!(body[0], Stmt::Assign { targets: vec![Expr::name("_t0")], value: Expr::name("_t1") });
        assert_eq!(body[1], Stmt::Expr(Expr::name("_t2")));
    }

    #[test]
    fn adjacent_from_imports_merge() {
        let from = |n: &str| Stmt::ImportFrom {
            module: "os".into(),
            names: vec![Alias { name: n.into(), asname: None }],
            level: 0,
        };
        let mut body = vec![from("path"), from("sep")];
        merge_imports(&mut body);
        assert_eq!(body.len(), 1);
    }
}
