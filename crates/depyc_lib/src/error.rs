use serde::Serialize;
use thiserror::Error;

/// Structural failures. They abort the code object they occur in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecompileError {
    #[error("malformed container at offset {offset}: {reason}")]
    MalformedContainer { offset: usize, reason: String },

    #[error("truncated input at offset {offset} (needed {needed} more bytes)")]
    TruncatedInput { offset: usize, needed: usize },

    #[error("unsupported bytecode version (magic {magic}); pass --force to use the closest known table")]
    UnsupportedVersion { magic: u16 },

    #[error("invalid jump target in {code}: instruction at {offset} jumps to {target}")]
    InvalidJumpTarget { code: String, offset: u32, target: u32 },

    #[error("malformed disassembly dump at line {line}: {reason}")]
    MalformedDump { line: usize, reason: String },
}

impl DecompileError {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        DecompileError::MalformedContainer { offset, reason: reason.into() }
    }
}

/// Soft failures. They degrade the output locally and are collected in the report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error, Serialize)]
pub enum Diagnostic {
    #[error("unresolved binding `{name}` in {scope}; treated as global")]
    UnresolvedBinding { scope: String, name: String },

    #[error("unrecognized control pattern in {scope} at offset {offset}")]
    UnrecognizedControlPattern { scope: String, offset: u32 },

    #[error("unknown opcode {opname} in {scope} at offset {offset}")]
    UnknownOpcode { scope: String, opname: String, offset: u32 },
}
