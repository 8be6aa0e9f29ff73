use std::fmt;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::DecompileError;
use crate::version::PyVersion;

pub const HEADER_LEN: usize = 16;

const FLAG_REF: u8 = 0x80;

const TYPE_NULL: u8 = b'0';
const TYPE_NONE: u8 = b'N';
const TYPE_FALSE: u8 = b'F';
const TYPE_TRUE: u8 = b'T';
const TYPE_STOPITER: u8 = b'S';
const TYPE_ELLIPSIS: u8 = b'.';
const TYPE_INT: u8 = b'i';
const TYPE_INT64: u8 = b'I';
const TYPE_FLOAT: u8 = b'f';
const TYPE_BINARY_FLOAT: u8 = b'g';
const TYPE_COMPLEX: u8 = b'x';
const TYPE_BINARY_COMPLEX: u8 = b'y';
const TYPE_LONG: u8 = b'l';
const TYPE_STRING: u8 = b's';
const TYPE_INTERNED: u8 = b't';
const TYPE_REF: u8 = b'r';
const TYPE_TUPLE: u8 = b'(';
const TYPE_LIST: u8 = b'[';
const TYPE_DICT: u8 = b'{';
const TYPE_CODE: u8 = b'c';
const TYPE_UNICODE: u8 = b'u';
const TYPE_SET: u8 = b'<';
const TYPE_FROZENSET: u8 = b'>';
const TYPE_ASCII: u8 = b'a';
const TYPE_ASCII_INTERNED: u8 = b'A';
const TYPE_SMALL_TUPLE: u8 = b')';
const TYPE_SHORT_ASCII: u8 = b'z';
const TYPE_SHORT_ASCII_INTERNED: u8 = b'Z';
const TYPE_SLICE: u8 = b':';

// localsplus kinds (3.11+)
const CO_FAST_LOCAL: u8 = 0x20;
const CO_FAST_CELL: u8 = 0x40;
const CO_FAST_FREE: u8 = 0x80;

/// A decoded marshal object.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    None,
    Bool(bool),
    StopIteration,
    Ellipsis,
    Int(i64),
    /// Integers wider than 64 bits, kept as decimal text.
    Long(String),
    Float(f64),
    Complex(f64, f64),
    Bytes(Vec<u8>),
    Str(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Slice(Box<Value>, Box<Value>, Box<Value>),
    Code(Arc<CodeObject>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<&Arc<CodeObject>> {
        match self {
            Value::Code(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "<NULL>"),
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::StopIteration => write!(f, "StopIteration"),
            Value::Ellipsis => write!(f, "..."),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(s) => write!(f, "{s}"),
            Value::Float(v) => write!(f, "{}", float_repr(*v)),
            Value::Complex(re, im) => {
                if *re == 0.0 && re.is_sign_positive() {
                    write!(f, "{}j", complex_part(*im))
                } else {
                    let sign = if *im < 0.0 || (*im == 0.0 && im.is_sign_negative()) { '-' } else { '+' };
                    write!(f, "({}{sign}{}j)", complex_part(*re), complex_part(im.abs()))
                }
            }
            Value::Bytes(b) => write!(f, "{}", bytes_repr(b)),
            Value::Str(s) => write!(f, "{}", str_repr(s)),
            Value::Tuple(items) => {
                if items.len() == 1 {
                    write!(f, "({},)", items[0])
                } else {
                    write!(f, "({})", join(items))
                }
            }
            Value::List(items) => write!(f, "[{}]", join(items)),
            Value::Dict(items) => {
                let parts: Vec<String> = items.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Value::Set(items) if items.is_empty() => write!(f, "set()"),
            Value::Set(items) => write!(f, "{{{}}}", join(items)),
            Value::FrozenSet(items) if items.is_empty() => write!(f, "frozenset()"),
            Value::FrozenSet(items) => write!(f, "frozenset({{{}}})", join(items)),
            Value::Slice(a, b, c) => write!(f, "slice({a}, {b}, {c})"),
            Value::Code(c) => write!(f, "<code object {}>", c.name),
        }
    }
}

fn join(items: &[Value]) -> String {
    items.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
}

/// Python-style `repr` of a float.
pub fn float_repr(v: f64) -> String {
    if v.is_nan() {
        return "float('nan')".into();
    }
    if v.is_infinite() {
        return if v > 0.0 { "float('inf')".into() } else { "float('-inf')".into() };
    }
    float_repr_bare(v)
}

fn complex_part(v: f64) -> String {
    let s = float_repr_bare(v);
    match s.strip_suffix(".0") {
        Some(t) => t.to_string(),
        None => s,
    }
}

fn float_repr_bare(v: f64) -> String {
    if v.is_nan() {
        return "nan".into();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let s = format!("{v:?}");
    match s.find('e') {
        Some(pos) => {
            let (mantissa, exp) = s.split_at(pos);
            let exp = &exp[1..];
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            let mantissa = mantissa.strip_suffix(".0").unwrap_or(mantissa);
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => s,
    }
}

pub fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

pub fn bytes_repr(b: &[u8]) -> String {
    let quote = if b.contains(&b'\'') && !b.contains(&b'"') { b'"' } else { b'\'' };
    let mut out = String::from("b");
    out.push(quote as char);
    for &c in b {
        match c {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c as char);
            }
            0x20..=0x7e => out.push(c as char),
            c => out.push_str(&format!("\\x{c:02x}")),
        }
    }
    out.push(quote as char);
    out
}

/// `co_flags` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CodeFlags(pub u32);

impl CodeFlags {
    pub const OPTIMIZED: u32 = 0x0001;
    pub const NEWLOCALS: u32 = 0x0002;
    pub const VARARGS: u32 = 0x0004;
    pub const VARKEYWORDS: u32 = 0x0008;
    pub const NESTED: u32 = 0x0010;
    pub const GENERATOR: u32 = 0x0020;
    pub const COROUTINE: u32 = 0x0080;
    pub const ITERABLE_COROUTINE: u32 = 0x0100;
    pub const ASYNC_GENERATOR: u32 = 0x0200;
    pub const HAS_DOCSTRING: u32 = 0x4000000;

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn is_generator(self) -> bool {
        self.has(Self::GENERATOR) || self.has(Self::ASYNC_GENERATOR)
    }

    pub fn is_coroutine(self) -> bool {
        self.has(Self::COROUTINE) || self.has(Self::ASYNC_GENERATOR) || self.has(Self::ITERABLE_COROUTINE)
    }
}

/// Parameter descriptors recovered from the argument counts, flags and local names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Parameters {
    pub posonly: Vec<String>,
    pub args: Vec<String>,
    pub kwonly: Vec<String>,
    pub vararg: Option<String>,
    pub kwarg: Option<String>,
}

impl Parameters {
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.posonly
            .iter()
            .chain(self.args.iter())
            .chain(self.kwonly.iter())
            .chain(self.vararg.iter())
            .chain(self.kwarg.iter())
    }
}

/// One compiled unit: module, class body, function, lambda or comprehension.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    pub name: String,
    pub qualname: String,
    pub filename: String,
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    pub stacksize: u32,
    pub flags: CodeFlags,
    pub firstlineno: u32,
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
    /// Index space of `LOAD_FAST`-family operands.
    pub fast_names: Vec<String>,
    /// Index space of `LOAD_DEREF`-family operands.
    pub deref_names: Vec<String>,
    pub linetable: Vec<u8>,
    pub exceptiontable: Vec<u8>,
}

impl CodeObject {
    /// An empty code object; used for text dumps and in tests.
    pub fn empty(name: &str) -> CodeObject {
        CodeObject {
            name: name.to_string(),
            qualname: name.to_string(),
            filename: "<unknown>".into(),
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            stacksize: 0,
            flags: CodeFlags::default(),
            firstlineno: 1,
            code: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            fast_names: Vec::new(),
            deref_names: Vec::new(),
            linetable: Vec::new(),
            exceptiontable: Vec::new(),
        }
    }

    pub fn parameters(&self) -> Parameters {
        let mut it = self.varnames.iter().cloned();
        let mut p = Parameters::default();
        let positional = self.argcount as usize;
        let posonly = (self.posonlyargcount as usize).min(positional);
        p.posonly = it.by_ref().take(posonly).collect();
        p.args = it.by_ref().take(positional - posonly).collect();
        p.kwonly = it.by_ref().take(self.kwonlyargcount as usize).collect();
        if self.flags.has(CodeFlags::VARARGS) {
            p.vararg = it.next();
        }
        if self.flags.has(CodeFlags::VARKEYWORDS) {
            p.kwarg = it.next();
        }
        p
    }

    pub fn nested(&self) -> impl Iterator<Item = &Arc<CodeObject>> {
        self.consts.iter().filter_map(Value::as_code)
    }

    pub fn is_comprehension(&self) -> bool {
        matches!(self.name.as_str(), "<listcomp>" | "<setcomp>" | "<dictcomp>" | "<genexpr>")
    }

    pub fn is_lambda(&self) -> bool {
        self.name == "<lambda>"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SourceStamp {
    Timestamp { mtime: u32, size: u32 },
    Hash { hash: [u8; 8], check_source: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PycHeader {
    pub magic: u16,
    pub flags: u32,
    pub stamp: SourceStamp,
}

#[derive(Debug, Clone)]
pub struct PycFile {
    pub header: PycHeader,
    pub version: PyVersion,
    pub code: Arc<CodeObject>,
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn need(&self, n: usize) -> Result<(), DecompileError> {
        if self.remaining() < n {
            return Err(DecompileError::TruncatedInput { offset: self.pos, needed: n - self.remaining() });
        }
        Ok(())
    }

    pub(crate) fn get_u8(&mut self) -> Result<u8, DecompileError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub(crate) fn get_u16(&mut self) -> Result<u16, DecompileError> {
        self.need(2)?;
        let v = LittleEndian::read_u16(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(v)
    }

    pub(crate) fn get_u32(&mut self) -> Result<u32, DecompileError> {
        self.need(4)?;
        let v = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    fn get_i32(&mut self) -> Result<i32, DecompileError> {
        self.need(4)?;
        let v = LittleEndian::read_i32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    fn get_i64(&mut self) -> Result<i64, DecompileError> {
        self.need(8)?;
        let v = LittleEndian::read_i64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    fn get_f64(&mut self) -> Result<f64, DecompileError> {
        self.need(8)?;
        let v = LittleEndian::read_f64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    pub(crate) fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], DecompileError> {
        self.need(n)?;
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
}

/// Parse the 16-byte container header.
pub fn read_header(bytes: &[u8]) -> Result<PycHeader, DecompileError> {
    let mut r = Reader::new(bytes);
    let magic = r.get_u16()?;
    if r.get_bytes(2)? != b"\r\n" {
        return Err(DecompileError::malformed(2, "missing \\r\\n after magic number"));
    }
    let flags = r.get_u32()?;
    let stamp = if flags & 0x1 != 0 {
        let mut hash = [0u8; 8];
        hash.copy_from_slice(r.get_bytes(8)?);
        SourceStamp::Hash { hash, check_source: flags & 0x2 != 0 }
    } else {
        SourceStamp::Timestamp { mtime: r.get_u32()?, size: r.get_u32()? }
    };
    Ok(PycHeader { magic, flags, stamp })
}

/// Resolve the opcode-table version for a header, honouring an explicit override.
pub fn resolve_version(magic: u16, requested: Option<PyVersion>, force: bool) -> Result<PyVersion, DecompileError> {
    let detected = PyVersion::from_magic(magic);
    match (requested, detected) {
        (Some(req), Some(det)) if req != det => {
            warn!(magic, detected = %det, requested = %req, "version override does not match container header");
            Ok(req)
        }
        (Some(req), _) => Ok(req),
        (None, Some(det)) => Ok(det),
        (None, None) if force => {
            let v = PyVersion::closest_to_magic(magic);
            warn!(magic, using = %v, "unknown magic number; forcing closest known version");
            Ok(v)
        }
        (None, None) => Err(DecompileError::UnsupportedVersion { magic }),
    }
}

/// Parse a complete container: header plus the marshalled root code object.
pub fn read_pyc(bytes: &[u8], requested: Option<PyVersion>, force: bool) -> Result<PycFile, DecompileError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecompileError::TruncatedInput { offset: bytes.len(), needed: HEADER_LEN - bytes.len() });
    }
    let header = read_header(bytes)?;
    let version = resolve_version(header.magic, requested, force)?;
    debug!(magic = header.magic, version = %version, "container header");

    let mut un = Unmarshaller::new(&bytes[HEADER_LEN..], version);
    un.base = HEADER_LEN;
    let root = un.read_object()?;
    match root {
        Value::Code(code) => Ok(PycFile { header, version, code }),
        other => Err(DecompileError::malformed(HEADER_LEN, format!("root object is not a code object: {other}"))),
    }
}

/// Decode one marshalled object without a container header.
pub fn loads(bytes: &[u8], version: PyVersion) -> Result<Value, DecompileError> {
    Unmarshaller::new(bytes, version).read_object()
}

struct Unmarshaller<'a> {
    r: Reader<'a>,
    version: PyVersion,
    // Slots are reserved before decoding and filled after, so indices follow write order.
    refs: Vec<Option<Value>>,
    base: usize,
    depth: usize,
}

const MAX_DEPTH: usize = 2000;

impl<'a> Unmarshaller<'a> {
    fn new(buf: &'a [u8], version: PyVersion) -> Self {
        Self { r: Reader::new(buf), version, refs: Vec::new(), base: 0, depth: 0 }
    }

    fn offset(&self) -> usize {
        self.base + self.r.pos()
    }

    fn read_object(&mut self) -> Result<Value, DecompileError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(DecompileError::malformed(self.offset(), "object nesting too deep"));
        }
        let res = self.read_object_inner();
        self.depth -= 1;
        res
    }

    fn read_object_inner(&mut self) -> Result<Value, DecompileError> {
        let at = self.offset();
        let code = self.r.get_u8()?;
        let flag = code & FLAG_REF != 0;
        let tag = code & !FLAG_REF;

        let slot = if flag {
            self.refs.push(None);
            Some(self.refs.len() - 1)
        } else {
            None
        };

        let value = match tag {
            TYPE_NULL => Value::Null,
            TYPE_NONE => Value::None,
            TYPE_FALSE => Value::Bool(false),
            TYPE_TRUE => Value::Bool(true),
            TYPE_STOPITER => Value::StopIteration,
            TYPE_ELLIPSIS => Value::Ellipsis,
            TYPE_INT => Value::Int(self.r.get_i32()? as i64),
            TYPE_INT64 => Value::Int(self.r.get_i64()?),
            TYPE_LONG => self.read_long()?,
            TYPE_FLOAT => Value::Float(self.read_text_float()?),
            TYPE_BINARY_FLOAT => Value::Float(self.r.get_f64()?),
            TYPE_COMPLEX => {
                let re = self.read_text_float()?;
                let im = self.read_text_float()?;
                Value::Complex(re, im)
            }
            TYPE_BINARY_COMPLEX => {
                let re = self.r.get_f64()?;
                let im = self.r.get_f64()?;
                Value::Complex(re, im)
            }
            TYPE_STRING => {
                let n = self.r.get_u32()? as usize;
                Value::Bytes(self.r.get_bytes(n)?.to_vec())
            }
            TYPE_UNICODE | TYPE_INTERNED | TYPE_ASCII | TYPE_ASCII_INTERNED => {
                let n = self.r.get_u32()? as usize;
                Value::Str(String::from_utf8_lossy(self.r.get_bytes(n)?).into_owned())
            }
            TYPE_SHORT_ASCII | TYPE_SHORT_ASCII_INTERNED => {
                let n = self.r.get_u8()? as usize;
                Value::Str(String::from_utf8_lossy(self.r.get_bytes(n)?).into_owned())
            }
            TYPE_SMALL_TUPLE => {
                let n = self.r.get_u8()? as usize;
                Value::Tuple(self.read_seq(n)?)
            }
            TYPE_TUPLE => {
                let n = self.read_len()?;
                Value::Tuple(self.read_seq(n)?)
            }
            TYPE_LIST => {
                let n = self.read_len()?;
                Value::List(self.read_seq(n)?)
            }
            TYPE_SET => {
                let n = self.read_len()?;
                Value::Set(self.read_seq(n)?)
            }
            TYPE_FROZENSET => {
                let n = self.read_len()?;
                Value::FrozenSet(self.read_seq(n)?)
            }
            TYPE_DICT => {
                let mut items = Vec::new();
                loop {
                    let k = self.read_object()?;
                    if k == Value::Null {
                        break;
                    }
                    let v = self.read_object()?;
                    items.push((k, v));
                }
                Value::Dict(items)
            }
            TYPE_SLICE if self.version >= PyVersion::V3_14 => {
                let a = self.read_object()?;
                let b = self.read_object()?;
                let c = self.read_object()?;
                Value::Slice(Box::new(a), Box::new(b), Box::new(c))
            }
            TYPE_REF => {
                let idx = self.r.get_u32()? as usize;
                return match self.refs.get(idx) {
                    Some(Some(v)) => Ok(v.clone()),
                    Some(None) => Err(DecompileError::malformed(at, format!("reference {idx} to an object still being decoded"))),
                    None => Err(DecompileError::malformed(at, format!("reference {idx} out of range ({} known)", self.refs.len()))),
                };
            }
            TYPE_CODE => Value::Code(Arc::new(self.read_code()?)),
            other => {
                return Err(DecompileError::malformed(at, format!("unknown marshal tag {:?} (0x{other:02x})", other as char)));
            }
        };

        if let Some(slot) = slot {
            self.refs[slot] = Some(value.clone());
        }
        trace!(offset = at, tag = %(tag as char), "object");
        Ok(value)
    }

    fn read_len(&mut self) -> Result<usize, DecompileError> {
        let at = self.offset();
        let n = self.r.get_u32()? as usize;
        if n > self.r.remaining() {
            return Err(DecompileError::malformed(at, format!("sequence length {n} exceeds remaining input")));
        }
        Ok(n)
    }

    fn read_seq(&mut self, n: usize) -> Result<Vec<Value>, DecompileError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_object()?);
        }
        Ok(out)
    }

    fn read_text_float(&mut self) -> Result<f64, DecompileError> {
        let at = self.offset();
        let n = self.r.get_u8()? as usize;
        let text = String::from_utf8_lossy(self.r.get_bytes(n)?).into_owned();
        text.trim()
            .parse::<f64>()
            .map_err(|_| DecompileError::malformed(at, format!("bad float literal {text:?}")))
    }

    fn read_long(&mut self) -> Result<Value, DecompileError> {
        let at = self.offset();
        let n = self.r.get_i32()?;
        let count = n.unsigned_abs() as usize;
        let mut digits = Vec::with_capacity(count);
        for _ in 0..count {
            let d = self.r.get_u16()?;
            if d >= 1 << 15 {
                return Err(DecompileError::malformed(at, "long digit out of range"));
            }
            digits.push(d);
        }
        Ok(long_from_digits(&digits, n < 0))
    }

    fn read_names(&mut self, what: &str) -> Result<Vec<String>, DecompileError> {
        let at = self.offset();
        match self.read_object()? {
            Value::Tuple(items) | Value::List(items) => items
                .into_iter()
                .map(|v| match v {
                    Value::Str(s) => Ok(s),
                    other => Err(DecompileError::malformed(at, format!("{what} entry is not a string: {other}"))),
                })
                .collect(),
            other => Err(DecompileError::malformed(at, format!("{what} is not a tuple: {other}"))),
        }
    }

    fn read_string(&mut self, what: &str) -> Result<String, DecompileError> {
        let at = self.offset();
        match self.read_object()? {
            Value::Str(s) => Ok(s),
            other => Err(DecompileError::malformed(at, format!("{what} is not a string: {other}"))),
        }
    }

    fn read_bytes(&mut self, what: &str) -> Result<Vec<u8>, DecompileError> {
        let at = self.offset();
        match self.read_object()? {
            Value::Bytes(b) => Ok(b),
            other => Err(DecompileError::malformed(at, format!("{what} is not bytes: {other}"))),
        }
    }

    fn read_code(&mut self) -> Result<CodeObject, DecompileError> {
        let argcount = self.r.get_u32()?;
        let posonlyargcount = self.r.get_u32()?;
        let kwonlyargcount = self.r.get_u32()?;
        if !self.version.has_localsplus() {
            let _nlocals = self.r.get_u32()?;
        }
        let stacksize = self.r.get_u32()?;
        let flags = CodeFlags(self.r.get_u32()?);
        let code = self.read_bytes("co_code")?;
        let consts_at = self.offset();
        let consts = match self.read_object()? {
            Value::Tuple(items) | Value::List(items) => items,
            other => return Err(DecompileError::malformed(consts_at, format!("co_consts is not a tuple: {other}"))),
        };
        let names = self.read_names("co_names")?;

        let (varnames, cellvars, freevars, fast_names, deref_names) = if self.version.has_localsplus() {
            let plus = self.read_names("co_localsplusnames")?;
            let kinds = self.read_bytes("co_localspluskinds")?;
            if kinds.len() != plus.len() {
                return Err(DecompileError::malformed(
                    self.offset(),
                    format!("{} localsplus names but {} kinds", plus.len(), kinds.len()),
                ));
            }
            let pick = |bit: u8| -> Vec<String> {
                plus.iter().zip(kinds.iter()).filter(|(_, k)| *k & bit != 0).map(|(n, _)| n.clone()).collect()
            };
            let varnames = pick(CO_FAST_LOCAL);
            let cellvars = pick(CO_FAST_CELL);
            let freevars = pick(CO_FAST_FREE);
            (varnames, cellvars, freevars, plus.clone(), plus)
        } else {
            let varnames = self.read_names("co_varnames")?;
            let freevars = self.read_names("co_freevars")?;
            let cellvars = self.read_names("co_cellvars")?;
            let deref: Vec<String> = cellvars.iter().chain(freevars.iter()).cloned().collect();
            (varnames.clone(), cellvars, freevars, varnames, deref)
        };

        let filename = self.read_string("co_filename")?;
        let name = self.read_string("co_name")?;
        let qualname = if self.version.has_localsplus() { self.read_string("co_qualname")? } else { name.clone() };
        let firstlineno = self.r.get_u32()?;
        let linetable = self.read_bytes("co_linetable")?;
        let exceptiontable = if self.version.has_localsplus() { self.read_bytes("co_exceptiontable")? } else { Vec::new() };

        debug!(code = %qualname, consts = consts.len(), bytes = code.len(), "code object");
        Ok(CodeObject {
            name,
            qualname,
            filename,
            argcount,
            posonlyargcount,
            kwonlyargcount,
            stacksize,
            flags,
            firstlineno,
            code,
            consts,
            names,
            varnames,
            cellvars,
            freevars,
            fast_names,
            deref_names,
            linetable,
            exceptiontable,
        })
    }
}

/// Build an integer from base-2^15 digits, least significant first.
fn long_from_digits(digits: &[u16], negative: bool) -> Value {
    let mut acc: i128 = 0;
    let mut fits = digits.len() <= 8;
    if fits {
        for d in digits.iter().rev() {
            acc = (acc << 15) | *d as i128;
        }
        if negative {
            acc = -acc;
        }
        fits = i64::try_from(acc).is_ok();
    }
    if fits {
        return Value::Int(acc as i64);
    }

    // Schoolbook conversion to base 10^4.
    let mut mag: Vec<u32> = digits.iter().rev().map(|d| *d as u32).collect();
    let mut chunks: Vec<u32> = Vec::new();
    while mag.iter().any(|d| *d != 0) {
        let mut rem: u32 = 0;
        for d in mag.iter_mut() {
            let cur = (rem << 15) | *d;
            *d = cur / 10_000;
            rem = cur % 10_000;
        }
        chunks.push(rem);
        while mag.first() == Some(&0) {
            mag.remove(0);
        }
    }
    let mut text = String::new();
    if negative {
        text.push('-');
    }
    match chunks.split_last() {
        Some((top, rest)) => {
            text.push_str(&top.to_string());
            for c in rest.iter().rev() {
                text.push_str(&format!("{c:04}"));
            }
        }
        None => text.push('0'),
    }
    Value::Long(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_tags() {
        assert_eq!(loads(b"N", PyVersion::V3_12), Ok(Value::None));
        assert_eq!(loads(b"T", PyVersion::V3_12), Ok(Value::Bool(true)));
        assert_eq!(loads(b"i\xff\xff\xff\xff", PyVersion::V3_12), Ok(Value::Int(-1)));
        assert_eq!(loads(b"z\x02hi", PyVersion::V3_12), Ok(Value::Str("hi".into())));
        assert_eq!(loads(b"f\x032.5", PyVersion::V3_12), Ok(Value::Float(2.5)));
    }

    #[test]
    fn long_digits() {
        // 2**15 + 1 == digits [1, 1]
        assert_eq!(loads(b"l\x02\x00\x00\x00\x01\x00\x01\x00", PyVersion::V3_11), Ok(Value::Int(32769)));
        assert_eq!(loads(b"l\xfe\xff\xff\xff\x01\x00\x01\x00", PyVersion::V3_11), Ok(Value::Int(-32769)));
        let huge = long_from_digits(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 1], false);
        // 2**135
        assert_eq!(huge, Value::Long("43556142965880123323311949751266331066368".into()));
    }

    #[test]
    fn refs_are_shared() {
        // (ref'd 'ab', r0)
        let data = b")\x02\xdaab\x72\x00\x00\x00\x00";
        assert_eq!(
            loads(data, PyVersion::V3_12),
            Ok(Value::Tuple(vec![Value::Str("ab".into()), Value::Str("ab".into())]))
        );
    }

    #[test]
    fn dangling_ref_is_malformed() {
        let err = loads(b"r\x05\x00\x00\x00", PyVersion::V3_12).unwrap_err();
        assert!(matches!(err, DecompileError::MalformedContainer { .. }));
    }

    #[test]
    fn truncated_and_unknown_tag() {
        assert!(matches!(loads(b"i\x01\x00", PyVersion::V3_12), Err(DecompileError::TruncatedInput { .. })));
        assert!(matches!(loads(b"!", PyVersion::V3_12), Err(DecompileError::MalformedContainer { .. })));
    }

    #[test]
    fn unknown_magic_needs_force() {
        assert_eq!(resolve_version(4000, None, false), Err(DecompileError::UnsupportedVersion { magic: 4000 }));
        assert_eq!(resolve_version(4000, None, true), Ok(PyVersion::V3_14));
        assert_eq!(resolve_version(3439, None, false), Ok(PyVersion::V3_10));
        assert_eq!(resolve_version(3439, Some(PyVersion::V3_11), false), Ok(PyVersion::V3_11));
    }

    #[test]
    fn reprs() {
        assert_eq!(Value::Str("it's".into()).to_string(), "\"it's\"");
        assert_eq!(Value::Str("a\nb".into()).to_string(), "'a\\nb'");
        assert_eq!(Value::Bytes(b"\x00a".to_vec()).to_string(), "b'\\x00a'");
        assert_eq!(Value::Float(1e100).to_string(), "1e+100");
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
        assert_eq!(Value::Tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(Value::Complex(0.0, 2.0).to_string(), "2j");
    }
}
