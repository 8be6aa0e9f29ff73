//! Opcode Table Registry: per-version raw opcode → canonical operation.

use std::collections::HashMap;

use serde::Serialize;

use crate::ast::BinOp;
use crate::version::PyVersion;

/// Canonical, version-independent operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Op {
    // Bookkeeping; no stack effect.
    Nop,
    Cache,
    Resume,
    ExtendedArg,
    Precall,
    CopyFreeVars,
    MakeCell,
    NotTaken,
    GenStart,

    PopTop,
    PushNull,
    RotTwo,
    RotThree,
    RotFour,
    RotN,
    DupTop,
    DupTopTwo,
    Copy,
    Swap,

    LoadConst,
    LoadSmallInt,
    LoadCommonConstant,
    LoadName,
    LoadGlobal,
    LoadFast,
    LoadFastAndClear,
    LoadFastLoadFast,
    LoadDeref,
    LoadClosure,
    LoadFromDictOrDeref,
    LoadFromDictOrGlobals,
    LoadLocals,
    LoadAttr,
    LoadMethod,
    LoadSuperAttr,
    LoadAssertionError,
    LoadBuildClass,
    LoadSpecial,

    StoreName,
    StoreGlobal,
    StoreFast,
    StoreFastLoadFast,
    StoreFastStoreFast,
    StoreDeref,
    StoreAttr,
    StoreSubscr,
    StoreSlice,
    DeleteName,
    DeleteGlobal,
    DeleteFast,
    DeleteDeref,
    DeleteAttr,
    DeleteSubscr,

    UnaryPositive,
    UnaryNegative,
    UnaryNot,
    UnaryInvert,
    ToBool,
    /// 3.11+ `BINARY_OP`; the operator comes from the argument.
    BinaryOp,
    /// 3.10 fixed binary operator.
    Binary(BinOp),
    /// 3.10 fixed in-place operator.
    Inplace(BinOp),
    BinarySubscr,
    BinarySlice,
    BuildSlice,
    CompareOp,
    IsOp,
    ContainsOp,

    BuildTuple,
    BuildList,
    BuildSet,
    BuildMap,
    BuildConstKeyMap,
    BuildString,
    ListToTuple,
    ListExtend,
    SetUpdate,
    DictUpdate,
    DictMerge,
    ListAppend,
    SetAdd,
    MapAdd,
    FormatValue,
    FormatSimple,
    FormatWithSpec,
    ConvertValue,
    UnpackSequence,
    UnpackEx,

    Call,
    CallKw,
    KwNames,
    CallFunction,
    CallFunctionKw,
    CallFunctionEx,
    CallMethod,
    CallIntrinsic1,
    CallIntrinsic2,
    MakeFunction,
    SetFunctionAttribute,

    ReturnValue,
    ReturnConst,
    ReturnGenerator,
    YieldValue,
    YieldFrom,
    GetYieldFromIter,
    Send,
    EndSend,
    GetAwaitable,
    GetAiter,
    GetAnext,
    EndAsyncFor,
    CleanupThrow,
    RaiseVarargs,
    Reraise,

    JumpForward,
    JumpBackward,
    JumpBackwardNoInterrupt,
    JumpAbsolute,
    PopJumpIfFalse,
    PopJumpIfTrue,
    PopJumpIfNone,
    PopJumpIfNotNone,
    JumpIfFalseOrPop,
    JumpIfTrueOrPop,
    JumpIfNotExcMatch,

    GetIter,
    ForIter,
    EndFor,
    PopIter,

    SetupFinally,
    SetupWith,
    SetupAsyncWith,
    PopBlock,
    PopExcept,
    PushExcInfo,
    CheckExcMatch,
    CheckEgMatch,
    WithExceptStart,
    BeforeWith,
    BeforeAsyncWith,

    ImportName,
    ImportFrom,
    ImportStar,
    SetupAnnotations,
    PrintExpr,

    /// Opcode with no canonical analog (pattern matching, interpreter internals).
    VersionSpecific,
}

/// How an instruction's argument encodes a jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JumpKind {
    None,
    /// Relative to the next instruction (after inline caches).
    Forward,
    Backward,
    /// Absolute instruction index (3.10).
    Absolute,
}

impl Op {
    /// Instructions that never fall through to the next one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Op::ReturnValue
                | Op::ReturnConst
                | Op::RaiseVarargs
                | Op::Reraise
                | Op::JumpForward
                | Op::JumpBackward
                | Op::JumpBackwardNoInterrupt
                | Op::JumpAbsolute
        )
    }

    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Op::PopJumpIfFalse
                | Op::PopJumpIfTrue
                | Op::PopJumpIfNone
                | Op::PopJumpIfNotNone
                | Op::JumpIfFalseOrPop
                | Op::JumpIfTrueOrPop
                | Op::JumpIfNotExcMatch
                | Op::ForIter
        )
    }

    pub fn is_unconditional_jump(self) -> bool {
        matches!(self, Op::JumpForward | Op::JumpBackward | Op::JumpBackwardNoInterrupt | Op::JumpAbsolute)
    }

    /// Ops the translator drops without touching the stack.
    pub fn is_bookkeeping(self) -> bool {
        matches!(
            self,
            Op::Nop
                | Op::Cache
                | Op::Resume
                | Op::ExtendedArg
                | Op::Precall
                | Op::CopyFreeVars
                | Op::MakeCell
                | Op::NotTaken
                | Op::GenStart
                | Op::SetupAnnotations
        )
    }
}

/// Map an opcode name (specialised variants included) to its canonical kind and jump encoding.
pub fn classify(name: &str, version: PyVersion) -> (Op, JumpKind) {
    use JumpKind as J;
    let rel_or_abs = if version == PyVersion::V3_10 { J::Absolute } else { J::Forward };
    let base = normalize_name(name);
    let op = match base {
        "NOP" => Op::Nop,
        "CACHE" => Op::Cache,
        "RESUME" => Op::Resume,
        "EXTENDED_ARG" => Op::ExtendedArg,
        "PRECALL" => Op::Precall,
        "COPY_FREE_VARS" => Op::CopyFreeVars,
        "MAKE_CELL" => Op::MakeCell,
        "NOT_TAKEN" => Op::NotTaken,
        "GEN_START" => Op::GenStart,
        "POP_TOP" => Op::PopTop,
        "PUSH_NULL" => Op::PushNull,
        "ROT_TWO" => Op::RotTwo,
        "ROT_THREE" => Op::RotThree,
        "ROT_FOUR" => Op::RotFour,
        "ROT_N" => Op::RotN,
        "DUP_TOP" => Op::DupTop,
        "DUP_TOP_TWO" => Op::DupTopTwo,
        "COPY" => Op::Copy,
        "SWAP" => Op::Swap,
        "LOAD_CONST" => Op::LoadConst,
        "LOAD_SMALL_INT" => Op::LoadSmallInt,
        "LOAD_COMMON_CONSTANT" => Op::LoadCommonConstant,
        "LOAD_NAME" => Op::LoadName,
        "LOAD_GLOBAL" => Op::LoadGlobal,
        "LOAD_FAST" | "LOAD_FAST_CHECK" | "LOAD_FAST_BORROW" => Op::LoadFast,
        "LOAD_FAST_AND_CLEAR" => Op::LoadFastAndClear,
        "LOAD_FAST_LOAD_FAST" | "LOAD_FAST_BORROW_LOAD_FAST_BORROW" => Op::LoadFastLoadFast,
        "LOAD_DEREF" | "LOAD_CLASSDEREF" => Op::LoadDeref,
        "LOAD_CLOSURE" => Op::LoadClosure,
        "LOAD_FROM_DICT_OR_DEREF" => Op::LoadFromDictOrDeref,
        "LOAD_FROM_DICT_OR_GLOBALS" => Op::LoadFromDictOrGlobals,
        "LOAD_LOCALS" => Op::LoadLocals,
        "LOAD_ATTR" => Op::LoadAttr,
        "LOAD_METHOD" => Op::LoadMethod,
        "LOAD_SUPER_ATTR" => Op::LoadSuperAttr,
        "LOAD_ASSERTION_ERROR" => Op::LoadAssertionError,
        "LOAD_BUILD_CLASS" => Op::LoadBuildClass,
        "LOAD_SPECIAL" => Op::LoadSpecial,
        "STORE_NAME" => Op::StoreName,
        "STORE_GLOBAL" => Op::StoreGlobal,
        "STORE_FAST" => Op::StoreFast,
        "STORE_FAST_LOAD_FAST" => Op::StoreFastLoadFast,
        "STORE_FAST_STORE_FAST" => Op::StoreFastStoreFast,
        "STORE_DEREF" => Op::StoreDeref,
        "STORE_ATTR" => Op::StoreAttr,
        "STORE_SUBSCR" => Op::StoreSubscr,
        "STORE_SLICE" => Op::StoreSlice,
        "DELETE_NAME" => Op::DeleteName,
        "DELETE_GLOBAL" => Op::DeleteGlobal,
        "DELETE_FAST" => Op::DeleteFast,
        "DELETE_DEREF" => Op::DeleteDeref,
        "DELETE_ATTR" => Op::DeleteAttr,
        "DELETE_SUBSCR" => Op::DeleteSubscr,
        "UNARY_POSITIVE" => Op::UnaryPositive,
        "UNARY_NEGATIVE" => Op::UnaryNegative,
        "UNARY_NOT" => Op::UnaryNot,
        "UNARY_INVERT" => Op::UnaryInvert,
        "TO_BOOL" => Op::ToBool,
        "BINARY_OP" => Op::BinaryOp,
        "BINARY_SUBSCR" => Op::BinarySubscr,
        "BINARY_SLICE" => Op::BinarySlice,
        "BUILD_SLICE" => Op::BuildSlice,
        "COMPARE_OP" => Op::CompareOp,
        "IS_OP" => Op::IsOp,
        "CONTAINS_OP" => Op::ContainsOp,
        "BUILD_TUPLE" => Op::BuildTuple,
        "BUILD_LIST" => Op::BuildList,
        "BUILD_SET" => Op::BuildSet,
        "BUILD_MAP" => Op::BuildMap,
        "BUILD_CONST_KEY_MAP" => Op::BuildConstKeyMap,
        "BUILD_STRING" => Op::BuildString,
        "LIST_TO_TUPLE" => Op::ListToTuple,
        "LIST_EXTEND" => Op::ListExtend,
        "SET_UPDATE" => Op::SetUpdate,
        "DICT_UPDATE" => Op::DictUpdate,
        "DICT_MERGE" => Op::DictMerge,
        "LIST_APPEND" => Op::ListAppend,
        "SET_ADD" => Op::SetAdd,
        "MAP_ADD" => Op::MapAdd,
        "FORMAT_VALUE" => Op::FormatValue,
        "FORMAT_SIMPLE" => Op::FormatSimple,
        "FORMAT_WITH_SPEC" => Op::FormatWithSpec,
        "CONVERT_VALUE" => Op::ConvertValue,
        "UNPACK_SEQUENCE" => Op::UnpackSequence,
        "UNPACK_EX" => Op::UnpackEx,
        "CALL" => Op::Call,
        "CALL_KW" => Op::CallKw,
        "KW_NAMES" => Op::KwNames,
        "CALL_FUNCTION" => Op::CallFunction,
        "CALL_FUNCTION_KW" => Op::CallFunctionKw,
        "CALL_FUNCTION_EX" => Op::CallFunctionEx,
        "CALL_METHOD" => Op::CallMethod,
        "CALL_INTRINSIC_1" => Op::CallIntrinsic1,
        "CALL_INTRINSIC_2" => Op::CallIntrinsic2,
        "MAKE_FUNCTION" => Op::MakeFunction,
        "SET_FUNCTION_ATTRIBUTE" => Op::SetFunctionAttribute,
        "RETURN_VALUE" => Op::ReturnValue,
        "RETURN_CONST" => Op::ReturnConst,
        "RETURN_GENERATOR" => Op::ReturnGenerator,
        "YIELD_VALUE" => Op::YieldValue,
        "YIELD_FROM" => Op::YieldFrom,
        "GET_YIELD_FROM_ITER" => Op::GetYieldFromIter,
        "SEND" => Op::Send,
        "END_SEND" => Op::EndSend,
        "GET_AWAITABLE" => Op::GetAwaitable,
        "GET_AITER" => Op::GetAiter,
        "GET_ANEXT" => Op::GetAnext,
        "END_ASYNC_FOR" => Op::EndAsyncFor,
        "CLEANUP_THROW" => Op::CleanupThrow,
        "RAISE_VARARGS" => Op::RaiseVarargs,
        "RERAISE" => Op::Reraise,
        "JUMP_FORWARD" => Op::JumpForward,
        "JUMP_BACKWARD" => Op::JumpBackward,
        "JUMP_BACKWARD_NO_INTERRUPT" => Op::JumpBackwardNoInterrupt,
        "JUMP_ABSOLUTE" => Op::JumpAbsolute,
        "JUMP" | "JUMP_NO_INTERRUPT" => Op::JumpForward,
        "POP_JUMP_IF_FALSE" | "POP_JUMP_FORWARD_IF_FALSE" | "POP_JUMP_BACKWARD_IF_FALSE" => Op::PopJumpIfFalse,
        "POP_JUMP_IF_TRUE" | "POP_JUMP_FORWARD_IF_TRUE" | "POP_JUMP_BACKWARD_IF_TRUE" => Op::PopJumpIfTrue,
        "POP_JUMP_IF_NONE" | "POP_JUMP_FORWARD_IF_NONE" | "POP_JUMP_BACKWARD_IF_NONE" => Op::PopJumpIfNone,
        "POP_JUMP_IF_NOT_NONE" | "POP_JUMP_FORWARD_IF_NOT_NONE" | "POP_JUMP_BACKWARD_IF_NOT_NONE" => {
            Op::PopJumpIfNotNone
        }
        "JUMP_IF_FALSE_OR_POP" => Op::JumpIfFalseOrPop,
        "JUMP_IF_TRUE_OR_POP" => Op::JumpIfTrueOrPop,
        "JUMP_IF_NOT_EXC_MATCH" => Op::JumpIfNotExcMatch,
        "GET_ITER" => Op::GetIter,
        "FOR_ITER" => Op::ForIter,
        "END_FOR" => Op::EndFor,
        "POP_ITER" => Op::PopIter,
        "SETUP_FINALLY" => Op::SetupFinally,
        "SETUP_WITH" => Op::SetupWith,
        "SETUP_ASYNC_WITH" => Op::SetupAsyncWith,
        "POP_BLOCK" => Op::PopBlock,
        "POP_EXCEPT" => Op::PopExcept,
        "PUSH_EXC_INFO" => Op::PushExcInfo,
        "CHECK_EXC_MATCH" => Op::CheckExcMatch,
        "CHECK_EG_MATCH" => Op::CheckEgMatch,
        "WITH_EXCEPT_START" => Op::WithExceptStart,
        "BEFORE_WITH" => Op::BeforeWith,
        "BEFORE_ASYNC_WITH" => Op::BeforeAsyncWith,
        "IMPORT_NAME" => Op::ImportName,
        "IMPORT_FROM" => Op::ImportFrom,
        "IMPORT_STAR" => Op::ImportStar,
        "SETUP_ANNOTATIONS" => Op::SetupAnnotations,
        "PRINT_EXPR" => Op::PrintExpr,
        "BINARY_POWER" => Op::Binary(BinOp::Pow),
        "BINARY_MULTIPLY" => Op::Binary(BinOp::Mul),
        "BINARY_MATRIX_MULTIPLY" => Op::Binary(BinOp::MatMul),
        "BINARY_FLOOR_DIVIDE" => Op::Binary(BinOp::FloorDiv),
        "BINARY_TRUE_DIVIDE" => Op::Binary(BinOp::TrueDiv),
        "BINARY_MODULO" => Op::Binary(BinOp::Mod),
        "BINARY_ADD" => Op::Binary(BinOp::Add),
        "BINARY_SUBTRACT" => Op::Binary(BinOp::Sub),
        "BINARY_LSHIFT" => Op::Binary(BinOp::LShift),
        "BINARY_RSHIFT" => Op::Binary(BinOp::RShift),
        "BINARY_AND" => Op::Binary(BinOp::BitAnd),
        "BINARY_XOR" => Op::Binary(BinOp::BitXor),
        "BINARY_OR" => Op::Binary(BinOp::BitOr),
        "INPLACE_POWER" => Op::Inplace(BinOp::Pow),
        "INPLACE_MULTIPLY" => Op::Inplace(BinOp::Mul),
        "INPLACE_MATRIX_MULTIPLY" => Op::Inplace(BinOp::MatMul),
        "INPLACE_FLOOR_DIVIDE" => Op::Inplace(BinOp::FloorDiv),
        "INPLACE_TRUE_DIVIDE" => Op::Inplace(BinOp::TrueDiv),
        "INPLACE_MODULO" => Op::Inplace(BinOp::Mod),
        "INPLACE_ADD" => Op::Inplace(BinOp::Add),
        "INPLACE_SUBTRACT" => Op::Inplace(BinOp::Sub),
        "INPLACE_LSHIFT" => Op::Inplace(BinOp::LShift),
        "INPLACE_RSHIFT" => Op::Inplace(BinOp::RShift),
        "INPLACE_AND" => Op::Inplace(BinOp::BitAnd),
        "INPLACE_XOR" => Op::Inplace(BinOp::BitXor),
        "INPLACE_OR" => Op::Inplace(BinOp::BitOr),
        _ => Op::VersionSpecific,
    };

    let jump = match (op, base) {
        (_, n) if n.starts_with("POP_JUMP_BACKWARD") => J::Backward,
        (Op::JumpBackward | Op::JumpBackwardNoInterrupt, _) => J::Backward,
        (Op::JumpAbsolute, _) => J::Absolute,
        (Op::PopJumpIfFalse | Op::PopJumpIfTrue | Op::PopJumpIfNone | Op::PopJumpIfNotNone, _) => rel_or_abs,
        (Op::JumpIfFalseOrPop | Op::JumpIfTrueOrPop | Op::JumpIfNotExcMatch, _) => rel_or_abs,
        (
            Op::JumpForward
            | Op::ForIter
            | Op::Send
            | Op::SetupFinally
            | Op::SetupWith
            | Op::SetupAsyncWith,
            _,
        ) => J::Forward,
        _ => J::None,
    };
    (op, jump)
}

/// Strip adaptive specialisations down to their generic family name.
pub fn normalize_name(name: &str) -> &str {
    const FAMILIES: &[&str] = &[
        "BINARY_OP",
        "BINARY_SUBSCR",
        "CALL_KW",
        "CALL",
        "COMPARE_OP",
        "CONTAINS_OP",
        "FOR_ITER",
        "LOAD_ATTR",
        "LOAD_CONST",
        "LOAD_GLOBAL",
        "LOAD_SUPER_ATTR",
        "SEND",
        "STORE_ATTR",
        "STORE_SUBSCR",
        "TO_BOOL",
        "UNPACK_SEQUENCE",
        "JUMP_BACKWARD",
        "RESUME",
    ];
    // Exact names that merely share a family prefix.
    const GENERIC: &[&str] = &[
        "CALL_FUNCTION",
        "CALL_FUNCTION_KW",
        "CALL_FUNCTION_EX",
        "CALL_METHOD",
        "CALL_INTRINSIC_1",
        "CALL_INTRINSIC_2",
        "JUMP_BACKWARD_NO_INTERRUPT",
        "LOAD_CONST_KEY_MAP",
    ];
    let name = name.strip_prefix("INSTRUMENTED_").unwrap_or(name);
    if GENERIC.contains(&name) {
        return name;
    }
    for fam in FAMILIES {
        if let Some(rest) = name.strip_prefix(fam) {
            if rest.is_empty() || rest.starts_with('_') {
                return fam;
            }
        }
    }
    name
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpInfo {
    pub code: u8,
    pub name: &'static str,
    pub op: Op,
    pub jump: JumpKind,
}

/// A raw opcode value absent from the table for the selected version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownOpcode(pub u8);

#[derive(Debug, Clone)]
pub struct OpcodeTable {
    pub version: PyVersion,
    by_code: Vec<Option<OpInfo>>,
    by_name: HashMap<&'static str, u8>,
}

impl OpcodeTable {
    fn build(version: PyVersion, raw: &[(u8, &'static str)]) -> Self {
        let mut by_code = vec![None; 256];
        let mut by_name = HashMap::new();
        for &(code, name) in raw {
            let (op, jump) = classify(name, version);
            by_code[code as usize] = Some(OpInfo { code, name, op, jump });
            by_name.entry(name).or_insert(code);
        }
        Self { version, by_code, by_name }
    }

    pub fn lookup(&self, raw: u8) -> Result<OpInfo, UnknownOpcode> {
        self.by_code[raw as usize].ok_or(UnknownOpcode(raw))
    }

    pub fn opcode(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_code.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All supported tables, built once and passed to the disassembler explicitly.
#[derive(Debug, Clone)]
pub struct Registry {
    tables: Vec<OpcodeTable>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let tables = PyVersion::ALL
            .iter()
            .map(|&v| OpcodeTable::build(v, raw_table(v)))
            .collect();
        Self { tables }
    }

    pub fn table(&self, version: PyVersion) -> &OpcodeTable {
        let idx = PyVersion::ALL.iter().position(|v| *v == version).unwrap_or(0);
        &self.tables[idx]
    }

    pub fn lookup(&self, version: PyVersion, raw: u8) -> Result<OpInfo, UnknownOpcode> {
        self.table(version).lookup(raw)
    }
}

fn raw_table(version: PyVersion) -> &'static [(u8, &'static str)] {
    match version {
        PyVersion::V3_10 => OPCODES_310,
        PyVersion::V3_11 => OPCODES_311,
        PyVersion::V3_12 => OPCODES_312,
        PyVersion::V3_13 => OPCODES_313,
        PyVersion::V3_14 => OPCODES_314,
    }
}

static OPCODES_310: &[(u8, &str)] = &[
    (1, "POP_TOP"), (2, "ROT_TWO"), (3, "ROT_THREE"), (4, "DUP_TOP"), (5, "DUP_TOP_TWO"),
    (6, "ROT_FOUR"), (9, "NOP"), (10, "UNARY_POSITIVE"), (11, "UNARY_NEGATIVE"), (12, "UNARY_NOT"),
    (15, "UNARY_INVERT"), (16, "BINARY_MATRIX_MULTIPLY"), (17, "INPLACE_MATRIX_MULTIPLY"),
    (19, "BINARY_POWER"), (20, "BINARY_MULTIPLY"), (22, "BINARY_MODULO"), (23, "BINARY_ADD"),
    (24, "BINARY_SUBTRACT"), (25, "BINARY_SUBSCR"), (26, "BINARY_FLOOR_DIVIDE"),
    (27, "BINARY_TRUE_DIVIDE"), (28, "INPLACE_FLOOR_DIVIDE"), (29, "INPLACE_TRUE_DIVIDE"),
    (30, "GET_LEN"), (31, "MATCH_MAPPING"), (32, "MATCH_SEQUENCE"), (33, "MATCH_KEYS"),
    (34, "COPY_DICT_WITHOUT_KEYS"), (49, "WITH_EXCEPT_START"), (50, "GET_AITER"),
    (51, "GET_ANEXT"), (52, "BEFORE_ASYNC_WITH"), (54, "END_ASYNC_FOR"), (55, "INPLACE_ADD"),
    (56, "INPLACE_SUBTRACT"), (57, "INPLACE_MULTIPLY"), (59, "INPLACE_MODULO"),
    (60, "STORE_SUBSCR"), (61, "DELETE_SUBSCR"), (62, "BINARY_LSHIFT"), (63, "BINARY_RSHIFT"),
    (64, "BINARY_AND"), (65, "BINARY_XOR"), (66, "BINARY_OR"), (67, "INPLACE_POWER"),
    (68, "GET_ITER"), (69, "GET_YIELD_FROM_ITER"), (70, "PRINT_EXPR"), (71, "LOAD_BUILD_CLASS"),
    (72, "YIELD_FROM"), (73, "GET_AWAITABLE"), (74, "LOAD_ASSERTION_ERROR"),
    (75, "INPLACE_LSHIFT"), (76, "INPLACE_RSHIFT"), (77, "INPLACE_AND"), (78, "INPLACE_XOR"),
    (79, "INPLACE_OR"), (82, "LIST_TO_TUPLE"), (83, "RETURN_VALUE"), (84, "IMPORT_STAR"),
    (85, "SETUP_ANNOTATIONS"), (86, "YIELD_VALUE"), (87, "POP_BLOCK"), (89, "POP_EXCEPT"),
    (90, "STORE_NAME"), (91, "DELETE_NAME"), (92, "UNPACK_SEQUENCE"), (93, "FOR_ITER"),
    (94, "UNPACK_EX"), (95, "STORE_ATTR"), (96, "DELETE_ATTR"), (97, "STORE_GLOBAL"),
    (98, "DELETE_GLOBAL"), (99, "ROT_N"), (100, "LOAD_CONST"), (101, "LOAD_NAME"),
    (102, "BUILD_TUPLE"), (103, "BUILD_LIST"), (104, "BUILD_SET"), (105, "BUILD_MAP"),
    (106, "LOAD_ATTR"), (107, "COMPARE_OP"), (108, "IMPORT_NAME"), (109, "IMPORT_FROM"),
    (110, "JUMP_FORWARD"), (111, "JUMP_IF_FALSE_OR_POP"), (112, "JUMP_IF_TRUE_OR_POP"),
    (113, "JUMP_ABSOLUTE"), (114, "POP_JUMP_IF_FALSE"), (115, "POP_JUMP_IF_TRUE"),
    (116, "LOAD_GLOBAL"), (117, "IS_OP"), (118, "CONTAINS_OP"), (119, "RERAISE"),
    (121, "JUMP_IF_NOT_EXC_MATCH"), (122, "SETUP_FINALLY"), (124, "LOAD_FAST"),
    (125, "STORE_FAST"), (126, "DELETE_FAST"), (129, "GEN_START"), (130, "RAISE_VARARGS"),
    (131, "CALL_FUNCTION"), (132, "MAKE_FUNCTION"), (133, "BUILD_SLICE"), (135, "LOAD_CLOSURE"),
    (136, "LOAD_DEREF"), (137, "STORE_DEREF"), (138, "DELETE_DEREF"), (141, "CALL_FUNCTION_KW"),
    (142, "CALL_FUNCTION_EX"), (143, "SETUP_WITH"), (144, "EXTENDED_ARG"), (145, "LIST_APPEND"),
    (146, "SET_ADD"), (147, "MAP_ADD"), (148, "LOAD_CLASSDEREF"), (152, "MATCH_CLASS"),
    (154, "SETUP_ASYNC_WITH"), (155, "FORMAT_VALUE"), (156, "BUILD_CONST_KEY_MAP"),
    (157, "BUILD_STRING"), (160, "LOAD_METHOD"), (161, "CALL_METHOD"), (162, "LIST_EXTEND"),
    (163, "SET_UPDATE"), (164, "DICT_MERGE"), (165, "DICT_UPDATE"),
];

static OPCODES_311: &[(u8, &str)] = &[
    (0, "CACHE"), (1, "POP_TOP"), (2, "PUSH_NULL"), (9, "NOP"), (10, "UNARY_POSITIVE"),
    (11, "UNARY_NEGATIVE"), (12, "UNARY_NOT"), (15, "UNARY_INVERT"), (25, "BINARY_SUBSCR"),
    (30, "GET_LEN"), (31, "MATCH_MAPPING"), (32, "MATCH_SEQUENCE"), (33, "MATCH_KEYS"),
    (35, "PUSH_EXC_INFO"), (36, "CHECK_EXC_MATCH"), (37, "CHECK_EG_MATCH"),
    (49, "WITH_EXCEPT_START"), (50, "GET_AITER"), (51, "GET_ANEXT"), (52, "BEFORE_ASYNC_WITH"),
    (53, "BEFORE_WITH"), (54, "END_ASYNC_FOR"), (60, "STORE_SUBSCR"), (61, "DELETE_SUBSCR"),
    (68, "GET_ITER"), (69, "GET_YIELD_FROM_ITER"), (70, "PRINT_EXPR"), (71, "LOAD_BUILD_CLASS"),
    (74, "LOAD_ASSERTION_ERROR"), (75, "RETURN_GENERATOR"), (82, "LIST_TO_TUPLE"),
    (83, "RETURN_VALUE"), (84, "IMPORT_STAR"), (85, "SETUP_ANNOTATIONS"), (86, "YIELD_VALUE"),
    (87, "ASYNC_GEN_WRAP"), (88, "PREP_RERAISE_STAR"), (89, "POP_EXCEPT"), (90, "STORE_NAME"),
    (91, "DELETE_NAME"), (92, "UNPACK_SEQUENCE"), (93, "FOR_ITER"), (94, "UNPACK_EX"),
    (95, "STORE_ATTR"), (96, "DELETE_ATTR"), (97, "STORE_GLOBAL"), (98, "DELETE_GLOBAL"),
    (99, "SWAP"), (100, "LOAD_CONST"), (101, "LOAD_NAME"), (102, "BUILD_TUPLE"),
    (103, "BUILD_LIST"), (104, "BUILD_SET"), (105, "BUILD_MAP"), (106, "LOAD_ATTR"),
    (107, "COMPARE_OP"), (108, "IMPORT_NAME"), (109, "IMPORT_FROM"), (110, "JUMP_FORWARD"),
    (111, "JUMP_IF_FALSE_OR_POP"), (112, "JUMP_IF_TRUE_OR_POP"),
    (114, "POP_JUMP_FORWARD_IF_FALSE"), (115, "POP_JUMP_FORWARD_IF_TRUE"), (116, "LOAD_GLOBAL"),
    (117, "IS_OP"), (118, "CONTAINS_OP"), (119, "RERAISE"), (120, "COPY"), (122, "BINARY_OP"),
    (123, "SEND"), (124, "LOAD_FAST"), (125, "STORE_FAST"), (126, "DELETE_FAST"),
    (128, "POP_JUMP_FORWARD_IF_NOT_NONE"), (129, "POP_JUMP_FORWARD_IF_NONE"),
    (130, "RAISE_VARARGS"), (131, "GET_AWAITABLE"), (132, "MAKE_FUNCTION"), (133, "BUILD_SLICE"),
    (134, "JUMP_BACKWARD_NO_INTERRUPT"), (135, "MAKE_CELL"), (136, "LOAD_CLOSURE"),
    (137, "LOAD_DEREF"), (138, "STORE_DEREF"), (139, "DELETE_DEREF"), (140, "JUMP_BACKWARD"),
    (142, "CALL_FUNCTION_EX"), (144, "EXTENDED_ARG"), (145, "LIST_APPEND"), (146, "SET_ADD"),
    (147, "MAP_ADD"), (148, "LOAD_CLASSDEREF"), (149, "COPY_FREE_VARS"), (151, "RESUME"),
    (152, "MATCH_CLASS"), (155, "FORMAT_VALUE"), (156, "BUILD_CONST_KEY_MAP"),
    (157, "BUILD_STRING"), (160, "LOAD_METHOD"), (162, "LIST_EXTEND"), (163, "SET_UPDATE"),
    (164, "DICT_MERGE"), (165, "DICT_UPDATE"), (166, "PRECALL"), (171, "CALL"), (172, "KW_NAMES"),
    (173, "POP_JUMP_BACKWARD_IF_NOT_NONE"), (174, "POP_JUMP_BACKWARD_IF_NONE"),
    (175, "POP_JUMP_BACKWARD_IF_FALSE"), (176, "POP_JUMP_BACKWARD_IF_TRUE"),
];

static OPCODES_312: &[(u8, &str)] = &[
    (0, "CACHE"), (1, "POP_TOP"), (2, "PUSH_NULL"), (3, "INTERPRETER_EXIT"), (4, "END_FOR"),
    (5, "END_SEND"), (9, "NOP"), (11, "UNARY_NEGATIVE"), (12, "UNARY_NOT"), (15, "UNARY_INVERT"),
    (17, "RESERVED"), (25, "BINARY_SUBSCR"), (26, "BINARY_SLICE"), (27, "STORE_SLICE"),
    (30, "GET_LEN"), (31, "MATCH_MAPPING"), (32, "MATCH_SEQUENCE"), (33, "MATCH_KEYS"),
    (35, "PUSH_EXC_INFO"), (36, "CHECK_EXC_MATCH"), (37, "CHECK_EG_MATCH"),
    (49, "WITH_EXCEPT_START"), (50, "GET_AITER"), (51, "GET_ANEXT"), (52, "BEFORE_ASYNC_WITH"),
    (53, "BEFORE_WITH"), (54, "END_ASYNC_FOR"), (55, "CLEANUP_THROW"), (60, "STORE_SUBSCR"),
    (61, "DELETE_SUBSCR"), (68, "GET_ITER"), (69, "GET_YIELD_FROM_ITER"),
    (71, "LOAD_BUILD_CLASS"), (74, "LOAD_ASSERTION_ERROR"), (75, "RETURN_GENERATOR"),
    (83, "RETURN_VALUE"), (85, "SETUP_ANNOTATIONS"), (87, "LOAD_LOCALS"), (89, "POP_EXCEPT"),
    (90, "STORE_NAME"), (91, "DELETE_NAME"), (92, "UNPACK_SEQUENCE"), (93, "FOR_ITER"),
    (94, "UNPACK_EX"), (95, "STORE_ATTR"), (96, "DELETE_ATTR"), (97, "STORE_GLOBAL"),
    (98, "DELETE_GLOBAL"), (99, "SWAP"), (100, "LOAD_CONST"), (101, "LOAD_NAME"),
    (102, "BUILD_TUPLE"), (103, "BUILD_LIST"), (104, "BUILD_SET"), (105, "BUILD_MAP"),
    (106, "LOAD_ATTR"), (107, "COMPARE_OP"), (108, "IMPORT_NAME"), (109, "IMPORT_FROM"),
    (110, "JUMP_FORWARD"), (114, "POP_JUMP_IF_FALSE"), (115, "POP_JUMP_IF_TRUE"),
    (116, "LOAD_GLOBAL"), (117, "IS_OP"), (118, "CONTAINS_OP"), (119, "RERAISE"), (120, "COPY"),
    (121, "RETURN_CONST"), (122, "BINARY_OP"), (123, "SEND"), (124, "LOAD_FAST"),
    (125, "STORE_FAST"), (126, "DELETE_FAST"), (127, "LOAD_FAST_CHECK"),
    (128, "POP_JUMP_IF_NOT_NONE"), (129, "POP_JUMP_IF_NONE"), (130, "RAISE_VARARGS"),
    (131, "GET_AWAITABLE"), (132, "MAKE_FUNCTION"), (133, "BUILD_SLICE"),
    (134, "JUMP_BACKWARD_NO_INTERRUPT"), (135, "MAKE_CELL"), (136, "LOAD_CLOSURE"),
    (137, "LOAD_DEREF"), (138, "STORE_DEREF"), (139, "DELETE_DEREF"), (140, "JUMP_BACKWARD"),
    (141, "LOAD_SUPER_ATTR"), (142, "CALL_FUNCTION_EX"), (143, "LOAD_FAST_AND_CLEAR"),
    (144, "EXTENDED_ARG"), (145, "LIST_APPEND"), (146, "SET_ADD"), (147, "MAP_ADD"),
    (149, "COPY_FREE_VARS"), (150, "YIELD_VALUE"), (151, "RESUME"), (152, "MATCH_CLASS"),
    (155, "FORMAT_VALUE"), (156, "BUILD_CONST_KEY_MAP"), (157, "BUILD_STRING"),
    (162, "LIST_EXTEND"), (163, "SET_UPDATE"), (164, "DICT_MERGE"), (165, "DICT_UPDATE"),
    (171, "CALL"), (172, "KW_NAMES"), (173, "CALL_INTRINSIC_1"), (174, "CALL_INTRINSIC_2"),
    (175, "LOAD_FROM_DICT_OR_GLOBALS"), (176, "LOAD_FROM_DICT_OR_DEREF"),
];

// 3.13 renumbered the whole table alphabetically.
static OPCODES_313: &[(u8, &str)] = &[
    (0, "CACHE"), (1, "BEFORE_ASYNC_WITH"), (2, "BEFORE_WITH"),
    (3, "BINARY_OP_INPLACE_ADD_UNICODE"), (4, "BINARY_SLICE"), (5, "BINARY_SUBSCR"),
    (6, "CHECK_EG_MATCH"), (7, "CHECK_EXC_MATCH"), (8, "CLEANUP_THROW"), (9, "DELETE_SUBSCR"),
    (10, "END_ASYNC_FOR"), (11, "END_FOR"), (12, "END_SEND"), (13, "EXIT_INIT_CHECK"),
    (14, "FORMAT_SIMPLE"), (15, "FORMAT_WITH_SPEC"), (16, "GET_AITER"), (17, "RESERVED"),
    (18, "GET_ANEXT"), (19, "GET_ITER"), (20, "GET_LEN"), (21, "GET_YIELD_FROM_ITER"),
    (22, "INTERPRETER_EXIT"), (23, "LOAD_ASSERTION_ERROR"), (24, "LOAD_BUILD_CLASS"),
    (25, "LOAD_LOCALS"), (26, "MAKE_FUNCTION"), (27, "MATCH_KEYS"), (28, "MATCH_MAPPING"),
    (29, "MATCH_SEQUENCE"), (30, "NOP"), (31, "POP_EXCEPT"), (32, "POP_TOP"),
    (33, "PUSH_EXC_INFO"), (34, "PUSH_NULL"), (35, "RETURN_GENERATOR"), (36, "RETURN_VALUE"),
    (37, "SETUP_ANNOTATIONS"), (38, "STORE_SLICE"), (39, "STORE_SUBSCR"), (40, "TO_BOOL"),
    (41, "UNARY_INVERT"), (42, "UNARY_NEGATIVE"), (43, "UNARY_NOT"), (44, "WITH_EXCEPT_START"),
    (45, "BINARY_OP"), (46, "BUILD_CONST_KEY_MAP"), (47, "BUILD_LIST"), (48, "BUILD_MAP"),
    (49, "BUILD_SET"), (50, "BUILD_SLICE"), (51, "BUILD_STRING"), (52, "BUILD_TUPLE"),
    (53, "CALL"), (54, "CALL_FUNCTION_EX"), (55, "CALL_INTRINSIC_1"), (56, "CALL_INTRINSIC_2"),
    (57, "CALL_KW"), (58, "COMPARE_OP"), (59, "CONTAINS_OP"), (60, "CONVERT_VALUE"),
    (61, "COPY"), (62, "COPY_FREE_VARS"), (63, "DELETE_ATTR"), (64, "DELETE_DEREF"),
    (65, "DELETE_FAST"), (66, "DELETE_GLOBAL"), (67, "DELETE_NAME"), (68, "DICT_MERGE"),
    (69, "DICT_UPDATE"), (70, "ENTER_EXECUTOR"), (71, "EXTENDED_ARG"), (72, "FOR_ITER"),
    (73, "GET_AWAITABLE"), (74, "IMPORT_FROM"), (75, "IMPORT_NAME"), (76, "IS_OP"),
    (77, "JUMP_BACKWARD"), (78, "JUMP_BACKWARD_NO_INTERRUPT"), (79, "JUMP_FORWARD"),
    (80, "LIST_APPEND"), (81, "LIST_EXTEND"), (82, "LOAD_ATTR"), (83, "LOAD_CONST"),
    (84, "LOAD_DEREF"), (85, "LOAD_FAST"), (86, "LOAD_FAST_AND_CLEAR"), (87, "LOAD_FAST_CHECK"),
    (88, "LOAD_FAST_LOAD_FAST"), (89, "LOAD_FROM_DICT_OR_DEREF"),
    (90, "LOAD_FROM_DICT_OR_GLOBALS"), (91, "LOAD_GLOBAL"), (92, "LOAD_NAME"),
    (93, "LOAD_SUPER_ATTR"), (94, "MAKE_CELL"), (95, "MAP_ADD"), (96, "MATCH_CLASS"),
    (97, "POP_JUMP_IF_FALSE"), (98, "POP_JUMP_IF_NONE"), (99, "POP_JUMP_IF_NOT_NONE"),
    (100, "POP_JUMP_IF_TRUE"), (101, "RAISE_VARARGS"), (102, "RERAISE"), (103, "RETURN_CONST"),
    (104, "SEND"), (105, "SET_ADD"), (106, "SET_FUNCTION_ATTRIBUTE"), (107, "SET_UPDATE"),
    (108, "STORE_ATTR"), (109, "STORE_DEREF"), (110, "STORE_FAST"), (111, "STORE_FAST_LOAD_FAST"),
    (112, "STORE_FAST_STORE_FAST"), (113, "STORE_GLOBAL"), (114, "STORE_NAME"), (115, "SWAP"),
    (116, "UNPACK_EX"), (117, "UNPACK_SEQUENCE"), (118, "YIELD_VALUE"), (149, "RESUME"),
];

static OPCODES_314: &[(u8, &str)] = &[
    (0, "CACHE"), (1, "BINARY_SLICE"), (2, "BUILD_TEMPLATE"), (3, "BINARY_OP_INPLACE_ADD_UNICODE"),
    (4, "CALL_FUNCTION_EX"), (5, "CHECK_EG_MATCH"), (6, "CHECK_EXC_MATCH"), (7, "CLEANUP_THROW"),
    (8, "DELETE_SUBSCR"), (9, "END_FOR"), (10, "END_SEND"), (11, "EXIT_INIT_CHECK"),
    (12, "FORMAT_SIMPLE"), (13, "FORMAT_WITH_SPEC"), (14, "GET_AITER"), (15, "GET_ANEXT"),
    (16, "GET_ITER"), (17, "RESERVED"), (18, "GET_LEN"), (19, "GET_YIELD_FROM_ITER"),
    (20, "INTERPRETER_EXIT"), (21, "LOAD_BUILD_CLASS"), (22, "LOAD_LOCALS"),
    (23, "MAKE_FUNCTION"), (24, "MATCH_KEYS"), (25, "MATCH_MAPPING"), (26, "MATCH_SEQUENCE"),
    (27, "NOP"), (28, "NOT_TAKEN"), (29, "POP_EXCEPT"), (30, "POP_ITER"), (31, "POP_TOP"),
    (32, "PUSH_EXC_INFO"), (33, "PUSH_NULL"), (34, "RETURN_GENERATOR"), (35, "RETURN_VALUE"),
    (36, "SETUP_ANNOTATIONS"), (37, "STORE_SLICE"), (38, "STORE_SUBSCR"), (39, "TO_BOOL"),
    (40, "UNARY_INVERT"), (41, "UNARY_NEGATIVE"), (42, "UNARY_NOT"), (43, "WITH_EXCEPT_START"),
    (44, "BINARY_OP"), (45, "BUILD_INTERPOLATION"), (46, "BUILD_LIST"), (47, "BUILD_MAP"),
    (48, "BUILD_SET"), (49, "BUILD_SLICE"), (50, "BUILD_STRING"), (51, "BUILD_TUPLE"),
    (52, "CALL"), (53, "CALL_INTRINSIC_1"), (54, "CALL_INTRINSIC_2"), (55, "CALL_KW"),
    (56, "COMPARE_OP"), (57, "CONTAINS_OP"), (58, "CONVERT_VALUE"), (59, "COPY"),
    (60, "COPY_FREE_VARS"), (61, "DELETE_ATTR"), (62, "DELETE_DEREF"), (63, "DELETE_FAST"),
    (64, "DELETE_GLOBAL"), (65, "DELETE_NAME"), (66, "DICT_MERGE"), (67, "DICT_UPDATE"),
    (68, "END_ASYNC_FOR"), (69, "EXTENDED_ARG"), (70, "FOR_ITER"), (71, "GET_AWAITABLE"),
    (72, "IMPORT_FROM"), (73, "IMPORT_NAME"), (74, "IS_OP"), (75, "JUMP_BACKWARD"),
    (76, "JUMP_BACKWARD_NO_INTERRUPT"), (77, "JUMP_FORWARD"), (78, "LIST_APPEND"),
    (79, "LIST_EXTEND"), (80, "LOAD_ATTR"), (81, "LOAD_COMMON_CONSTANT"), (82, "LOAD_CONST"),
    (83, "LOAD_DEREF"), (84, "LOAD_FAST"), (85, "LOAD_FAST_AND_CLEAR"), (86, "LOAD_FAST_BORROW"),
    (87, "LOAD_FAST_BORROW_LOAD_FAST_BORROW"), (88, "LOAD_FAST_CHECK"), (89, "LOAD_FAST_LOAD_FAST"),
    (90, "LOAD_FROM_DICT_OR_DEREF"), (91, "LOAD_FROM_DICT_OR_GLOBALS"), (92, "LOAD_GLOBAL"),
    (93, "LOAD_NAME"), (94, "LOAD_SMALL_INT"), (95, "LOAD_SPECIAL"), (96, "LOAD_SUPER_ATTR"),
    (97, "MAKE_CELL"), (98, "MAP_ADD"), (99, "MATCH_CLASS"), (100, "POP_JUMP_IF_FALSE"),
    (101, "POP_JUMP_IF_NONE"), (102, "POP_JUMP_IF_NOT_NONE"), (103, "POP_JUMP_IF_TRUE"),
    (104, "RAISE_VARARGS"), (105, "RERAISE"), (106, "SEND"), (107, "SET_ADD"),
    (108, "SET_FUNCTION_ATTRIBUTE"), (109, "SET_UPDATE"), (110, "STORE_ATTR"),
    (111, "STORE_DEREF"), (112, "STORE_FAST"), (113, "STORE_FAST_LOAD_FAST"),
    (114, "STORE_FAST_STORE_FAST"), (115, "STORE_GLOBAL"), (116, "STORE_NAME"), (117, "SWAP"),
    (118, "UNPACK_EX"), (119, "UNPACK_SEQUENCE"), (120, "YIELD_VALUE"), (128, "RESUME"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_version_has_core_ops() {
        let reg = Registry::new();
        for v in PyVersion::ALL {
            let t = reg.table(v);
            for name in ["LOAD_CONST", "STORE_NAME", "RETURN_VALUE", "FOR_ITER", "GET_ITER", "EXTENDED_ARG"] {
                let code = t.opcode(name).unwrap_or_else(|| panic!("{name} missing for {v}"));
                assert_eq!(t.lookup(code).map(|i| i.name), Ok(name));
            }
        }
    }

    #[test]
    fn tables_differ_between_versions() {
        let reg = Registry::new();
        assert_eq!(reg.lookup(PyVersion::V3_10, 83).map(|i| i.op), Ok(Op::ReturnValue));
        assert_eq!(reg.lookup(PyVersion::V3_13, 36).map(|i| i.op), Ok(Op::ReturnValue));
        assert_eq!(reg.lookup(PyVersion::V3_14, 35).map(|i| i.op), Ok(Op::ReturnValue));
        assert_eq!(reg.lookup(PyVersion::V3_10, 23).map(|i| i.op), Ok(Op::Binary(BinOp::Add)));
        assert_eq!(reg.lookup(PyVersion::V3_12, 200), Err(UnknownOpcode(200)));
    }

    #[test]
    fn jump_encodings() {
        let reg = Registry::new();
        let jf = |v: PyVersion, name: &str| {
            let t = reg.table(v);
            t.lookup(t.opcode(name).unwrap_or(255)).map(|i| i.jump)
        };
        assert_eq!(jf(PyVersion::V3_10, "POP_JUMP_IF_FALSE"), Ok(JumpKind::Absolute));
        assert_eq!(jf(PyVersion::V3_10, "JUMP_FORWARD"), Ok(JumpKind::Forward));
        assert_eq!(jf(PyVersion::V3_11, "POP_JUMP_BACKWARD_IF_TRUE"), Ok(JumpKind::Backward));
        assert_eq!(jf(PyVersion::V3_12, "POP_JUMP_IF_FALSE"), Ok(JumpKind::Forward));
        assert_eq!(jf(PyVersion::V3_14, "JUMP_BACKWARD"), Ok(JumpKind::Backward));
    }

    #[test]
    fn specialised_names_normalise() {
        assert_eq!(normalize_name("LOAD_ATTR_INSTANCE_VALUE"), "LOAD_ATTR");
        assert_eq!(normalize_name("BINARY_OP_ADD_INT"), "BINARY_OP");
        assert_eq!(normalize_name("CALL_PY_EXACT_ARGS"), "CALL");
        assert_eq!(normalize_name("CALL_KW_PY"), "CALL_KW");
        assert_eq!(normalize_name("CALL_FUNCTION_EX"), "CALL_FUNCTION_EX");
        assert_eq!(normalize_name("INSTRUMENTED_FOR_ITER"), "FOR_ITER");
        assert_eq!(normalize_name("FOR_ITER_LIST"), "FOR_ITER");
        assert_eq!(classify("LOAD_GLOBAL_BUILTIN", PyVersion::V3_12).0, Op::LoadGlobal);
        assert_eq!(classify("MATCH_CLASS", PyVersion::V3_12).0, Op::VersionSpecific);
    }

    #[test]
    fn operations_serialize() {
        fn serializable<T: Serialize>(_: &T) {}
        serializable(&Op::Binary(BinOp::Add));
        serializable(&Op::Inplace(BinOp::Pow));
    }
}
