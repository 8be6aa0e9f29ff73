//! Python bytecode decompiler for CPython 3.10 through 3.14.
//!
//! The pipeline runs container reader → disassembler → scope analysis → translator →
//! reconstructor → fixer → emitter. Independent code objects are disassembled and
//! structured in parallel.

use std::collections::{BTreeMap, HashSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod ast;
pub mod disasm;
pub mod emit;
pub mod error;
pub mod fixer;
pub mod marshal;
pub mod opcodes;
pub mod reconstruct;
pub mod report;
pub mod scope;
pub mod textdump;
pub mod translate;
pub mod version;

pub use error::{DecompileError, Diagnostic};
pub use report::DecompileReport;
pub use version::PyVersion;

use disasm::Disassembly;
use opcodes::Registry;
use reconstruct::{structure, Assembler, Structured};
use scope::CodeTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Pseudo,
    Disasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionSelect {
    Auto,
    Fixed(PyVersion),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputKind {
    Auto,
    Container,
    TextDump,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
    pub version: VersionSelect,
    /// Accept an unknown magic number and decode with the closest known table.
    pub force: bool,
    pub input: InputKind,
    /// Emit `# unreconstructed:` comments.
    pub markers: bool,
    pub parallel: bool,
    /// Declarations to insert at module scope, keyed by the name they define.
    pub declarations: BTreeMap<String, String>,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: DecompileMode::Pseudo,
            version: VersionSelect::Auto,
            force: false,
            input: InputKind::Auto,
            markers: true,
            parallel: true,
            declarations: BTreeMap::new(),
        }
    }
}

impl DecompileOptions {
    fn requested_version(&self) -> Option<PyVersion> {
        match self.version {
            VersionSelect::Auto => None,
            VersionSelect::Fixed(v) => Some(v),
        }
    }
}

/// Source text plus the collaborator report.
#[derive(Debug, Clone)]
pub struct Decompiled {
    pub source: String,
    pub report: DecompileReport,
}

/// Version used for text dumps, which carry no header.
pub const DEFAULT_DUMP_VERSION: PyVersion = PyVersion::V3_12;

fn looks_like_container(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[2..4] == b"\r\n"
}

fn resolve_input(bytes: &[u8], options: &DecompileOptions) -> InputKind {
    match options.input {
        InputKind::Auto if looks_like_container(bytes) => InputKind::Container,
        InputKind::Auto if std::str::from_utf8(bytes).is_ok() => InputKind::TextDump,
        InputKind::Auto => InputKind::Container,
        other => other,
    }
}

fn map_maybe_par<T, F>(parallel: bool, n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if parallel {
        (0..n).into_par_iter().map(f).collect()
    } else {
        (0..n).map(f).collect()
    }
}

fn push_unique(out: &mut Vec<Diagnostic>, seen: &mut HashSet<Diagnostic>, items: impl IntoIterator<Item = Diagnostic>) {
    for d in items {
        if seen.insert(d.clone()) {
            out.push(d);
        }
    }
}

/// Everything after disassembly. `dis[0]` must be present; a missing nested entry
/// becomes a stub body.
fn pipeline(
    tree: &CodeTree,
    version: PyVersion,
    dis: &[Option<&Disassembly>],
    options: &DecompileOptions,
) -> Decompiled {
    let scopes = scope::analyze(tree, dis);

    let structured: Vec<Option<Structured>> =
        map_maybe_par(options.parallel, tree.len(), |n| dis[n].map(|d| structure(tree, n, d)));

    let mut diagnostics = Vec::new();
    let mut seen = HashSet::new();
    for d in dis.iter().flatten() {
        push_unique(&mut diagnostics, &mut seen, d.diagnostics.iter().cloned());
    }
    push_unique(&mut diagnostics, &mut seen, scopes.diagnostics.iter().cloned());
    let bodies: Vec<Option<Vec<ast::Stmt>>> = structured
        .into_iter()
        .map(|s| {
            s.map(|s| {
                push_unique(&mut diagnostics, &mut seen, s.diagnostics);
                s.body
            })
        })
        .collect();
    for d in &diagnostics {
        warn!("{d}");
    }

    let mut body = Assembler::new(tree, &scopes, version, bodies).assemble();
    fixer::fix(&mut body);
    report::insert_declarations(&mut body, &options.declarations);
    let source = emit::emit(&body, options.markers);
    let report = DecompileReport::build(version, &body, &source, &scopes.unresolved_globals, diagnostics);
    info!(
        version = %version,
        lines = report.lines,
        unreconstructed = report.unreconstructed,
        "decompiled"
    );
    Decompiled { source, report }
}

fn disassemble_tree(tree: &CodeTree, version: PyVersion, parallel: bool) -> Vec<Result<Disassembly, DecompileError>> {
    let registry = Registry::new();
    let table = registry.table(version);
    map_maybe_par(parallel, tree.len(), |n| disasm::disassemble(&tree.nodes[n].code, version, table))
}

fn decompile_container(bytes: &[u8], options: &DecompileOptions) -> Result<Decompiled, DecompileError> {
    let pyc = marshal::read_pyc(bytes, options.requested_version(), options.force)?;
    let tree = CodeTree::build(pyc.code);
    debug!(code_objects = tree.len(), version = %pyc.version, "code tree");
    let results = disassemble_tree(&tree, pyc.version, options.parallel);
    let mut dis = Vec::with_capacity(results.len());
    for (n, r) in results.iter().enumerate() {
        match r {
            Ok(d) => dis.push(Some(d)),
            Err(e) if n == 0 => return Err(e.clone()),
            Err(e) => {
                warn!(code = %tree.nodes[n].code.qualname, "nested code object left unreconstructed: {e}");
                dis.push(None);
            }
        }
    }
    Ok(pipeline(&tree, pyc.version, &dis, options))
}

fn decompile_dump(text: &str, options: &DecompileOptions) -> Result<Decompiled, DecompileError> {
    let version = options.requested_version().unwrap_or(DEFAULT_DUMP_VERSION);
    let dump = textdump::parse_dump(text, version)?;
    let tree = CodeTree::build(dump.root.clone());
    let dis: Vec<Option<&Disassembly>> = tree.nodes.iter().map(|n| dump.disassembly_for(&n.code)).collect();
    if dis.first().is_none_or(Option::is_none) {
        return Err(DecompileError::MalformedDump { line: 1, reason: "no top-level code section".into() });
    }
    Ok(pipeline(&tree, version, &dis, options))
}

/// Decompile and return the source together with its report.
pub fn decompile_full(bytes: &[u8], options: &DecompileOptions) -> Result<Decompiled, DecompileError> {
    match resolve_input(bytes, options) {
        InputKind::TextDump => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| DecompileError::MalformedDump { line: 1, reason: e.to_string() })?;
            decompile_dump(text, options)
        }
        _ => decompile_container(bytes, options),
    }
}

/// Decompile a raw `dis`-style listing.
pub fn decompile_text(dump: &str, options: &DecompileOptions) -> Result<String, DecompileError> {
    decompile_dump(dump, options).map(|d| d.source)
}

/// Instruction listing of every code object in a container.
pub fn disassemble_with_options(bytes: &[u8], options: &DecompileOptions) -> Result<String, DecompileError> {
    let pyc = marshal::read_pyc(bytes, options.requested_version(), options.force)?;
    let tree = CodeTree::build(pyc.code);
    let results = disassemble_tree(&tree, pyc.version, options.parallel);
    let mut out = String::new();
    for (node, r) in tree.nodes.iter().zip(results) {
        if !out.is_empty() {
            out.push('\n');
        }
        match r {
            Ok(d) => out.push_str(&disasm::render_listing(&node.code, &d)),
            Err(e) => out.push_str(&format!("code {}: {e}\n", node.code.qualname)),
        }
    }
    Ok(out)
}

pub fn disassemble(bytes: &[u8]) -> Result<String, DecompileError> {
    disassemble_with_options(bytes, &DecompileOptions::default())
}

pub fn decompile_with_mode(bytes: &[u8], mode: DecompileMode) -> Result<String, DecompileError> {
    decompile_with_options(bytes, &DecompileOptions { mode, ..DecompileOptions::default() })
}

pub fn decompile_with_options(bytes: &[u8], options: &DecompileOptions) -> Result<String, DecompileError> {
    match options.mode {
        DecompileMode::Disasm => disassemble_with_options(bytes, options),
        DecompileMode::Pseudo => decompile_full(bytes, options).map(|d| d.source),
    }
}

pub fn decompile(bytes: &[u8]) -> Result<String, DecompileError> {
    decompile_with_options(bytes, &DecompileOptions::default())
}
