#![allow(dead_code)]

use depyc_lib::PyVersion;
use depyc_lib::opcodes::Registry;

pub const LOCAL: u8 = 0x20;
pub const CELL: u8 = 0x40;
pub const FREE: u8 = 0x80;

pub enum Const {
    None,
    Int(i32),
    Str(&'static str),
    Code(Code),
}

/// A code object in the 3.11+ layout.
pub struct Code {
    pub name: &'static str,
    pub argcount: u32,
    pub flags: u32,
    pub code: Vec<u8>,
    pub consts: Vec<Const>,
    pub names: Vec<&'static str>,
    pub locals: Vec<(&'static str, u8)>,
}

impl Code {
    pub fn module(code: Vec<u8>, consts: Vec<Const>, names: &[&'static str]) -> Code {
        Code { name: "<module>", argcount: 0, flags: 0, code, consts, names: names.to_vec(), locals: Vec::new() }
    }

    pub fn function(name: &'static str, code: Vec<u8>, consts: Vec<Const>, locals: &[(&'static str, u8)]) -> Code {
        // OPTIMIZED | NEWLOCALS
        Code { name, argcount: 0, flags: 0x3, code, consts, names: Vec::new(), locals: locals.to_vec() }
    }
}

/// Assemble `(opname, arg)` pairs for `version`. No inline caches are emitted.
pub fn asm(version: PyVersion, ops: &[(&str, u32)]) -> Vec<u8> {
    let reg = Registry::new();
    let table = reg.table(version);
    let mut out = Vec::new();
    for &(name, arg) in ops {
        let code = table.opcode(name).unwrap_or_else(|| panic!("no opcode {name} in {version}"));
        out.push(code);
        out.push(arg as u8);
    }
    out
}

fn u32_le(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn str_obj(out: &mut Vec<u8>, s: &str) {
    out.push(b'u');
    u32_le(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn bytes_obj(out: &mut Vec<u8>, b: &[u8]) {
    out.push(b's');
    u32_le(out, b.len() as u32);
    out.extend_from_slice(b);
}

fn names_obj(out: &mut Vec<u8>, names: &[&str]) {
    out.push(b'(');
    u32_le(out, names.len() as u32);
    for n in names {
        str_obj(out, n);
    }
}

fn const_obj(out: &mut Vec<u8>, c: &Const) {
    match c {
        Const::None => out.push(b'N'),
        Const::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(&i.to_le_bytes());
        }
        Const::Str(s) => str_obj(out, s),
        Const::Code(code) => code_obj(out, code),
    }
}

fn code_obj(out: &mut Vec<u8>, c: &Code) {
    out.push(b'c');
    u32_le(out, c.argcount);
    u32_le(out, 0);
    u32_le(out, 0);
    u32_le(out, 8);
    u32_le(out, c.flags);
    bytes_obj(out, &c.code);
    out.push(b'(');
    u32_le(out, c.consts.len() as u32);
    for k in &c.consts {
        const_obj(out, k);
    }
    names_obj(out, &c.names);
    let plus: Vec<&str> = c.locals.iter().map(|(n, _)| *n).collect();
    names_obj(out, &plus);
    let kinds: Vec<u8> = c.locals.iter().map(|(_, k)| *k).collect();
    bytes_obj(out, &kinds);
    str_obj(out, "t.py");
    str_obj(out, c.name);
    str_obj(out, c.name);
    u32_le(out, 1);
    bytes_obj(out, &[]);
    bytes_obj(out, &[]);
}

/// A complete container with a timestamp header.
pub fn pyc_with_magic(magic: u16, root: &Code) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&magic.to_le_bytes());
    out.extend_from_slice(b"\r\n");
    u32_le(&mut out, 0);
    u32_le(&mut out, 0);
    u32_le(&mut out, 0);
    code_obj(&mut out, root);
    out
}

pub fn pyc(version: PyVersion, root: &Code) -> Vec<u8> {
    pyc_with_magic(version.magic(), root)
}
