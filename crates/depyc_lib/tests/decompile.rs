mod common;

use common::{asm, pyc, pyc_with_magic, Code, Const, CELL, FREE, LOCAL};
use depyc_lib::emit::MARKER;
use depyc_lib::{
    decompile, decompile_full, decompile_text, decompile_with_options, disassemble, DecompileError, DecompileMode,
    DecompileOptions, Diagnostic, PyVersion, VersionSelect,
};

const V: PyVersion = PyVersion::V3_12;

fn call(name_idx: u32) -> [(&'static str, u32); 4] {
    [("PUSH_NULL", 0), ("LOAD_NAME", name_idx), ("CALL", 0), ("POP_TOP", 0)]
}

fn module(ops: &[(&str, u32)], consts: Vec<Const>, names: &[&'static str]) -> Vec<u8> {
    pyc(V, &Code::module(asm(V, ops), consts, names))
}

fn source(bytes: &[u8]) -> String {
    decompile(bytes).unwrap()
}

mod control_flow {
    use super::*;

    #[test]
    fn if_else_at_module_level() {
        let mut ops = vec![("RESUME", 0), ("LOAD_NAME", 0), ("POP_JUMP_IF_FALSE", 5)];
        ops.extend(call(1));
        ops.push(("RETURN_CONST", 0));
        ops.extend(call(2));
        ops.push(("RETURN_CONST", 0));
        let bytes = module(&ops, vec![Const::None], &["c", "a", "b"]);
        assert_eq!(source(&bytes), "if c:\n    a()\nelse:\n    b()\n");
    }

    #[test]
    fn branches_assign_then_join() {
        let ops = [
            ("RESUME", 0),
            ("LOAD_NAME", 0),
            ("POP_JUMP_IF_FALSE", 3),
            ("LOAD_CONST", 0),
            ("STORE_NAME", 1),
            ("JUMP_FORWARD", 2),
            ("LOAD_CONST", 1),
            ("STORE_NAME", 1),
            ("PUSH_NULL", 0),
            ("LOAD_NAME", 2),
            ("LOAD_NAME", 1),
            ("CALL", 1),
            ("POP_TOP", 0),
            ("RETURN_CONST", 2),
        ];
        let bytes = module(&ops, vec![Const::Int(1), Const::Int(2), Const::None], &["c", "x", "print"]);
        assert_eq!(source(&bytes), "if c:\n    x = 1\nelse:\n    x = 2\nprint(x)\n");
    }

    #[test]
    fn else_holding_a_single_if_becomes_elif() {
        let mut ops = vec![("RESUME", 0), ("LOAD_NAME", 0), ("POP_JUMP_IF_FALSE", 5)];
        ops.extend(call(2));
        ops.push(("RETURN_CONST", 0));
        ops.extend([("LOAD_NAME", 1), ("POP_JUMP_IF_FALSE", 5)]);
        ops.extend(call(3));
        ops.push(("RETURN_CONST", 0));
        ops.extend(call(4));
        ops.push(("RETURN_CONST", 0));
        let bytes = module(&ops, vec![Const::None], &["a", "b", "x", "y", "z"]);
        assert_eq!(source(&bytes), "if a:\n    x()\nelif b:\n    y()\nelse:\n    z()\n");
    }

    #[test]
    fn while_loop_with_break() {
        let ops = [
            ("RESUME", 0),
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
        ];
        let bytes = module(&ops, vec![Const::None], &["x", "y", "f"]);
        assert_eq!(source(&bytes), "while x:\n    if y:\n        break\n    f()\n");
    }
}

mod scopes {
    use super::*;

    #[test]
    fn nonlocal_closure_resolves_through_cells() {
        // def outer():
        //     x = 0
        //     def inc():
        //         nonlocal x
        //         x = x + 1
        //     return inc
        let inc = Code::function(
            "inc",
            asm(
                V,
                &[
                    ("COPY_FREE_VARS", 1),
                    ("RESUME", 0),
                    ("LOAD_DEREF", 0),
                    ("LOAD_CONST", 1),
                    ("BINARY_OP", 0),
                    ("STORE_DEREF", 0),
                    ("RETURN_CONST", 0),
                ],
            ),
            vec![Const::None, Const::Int(1)],
            &[("x", FREE)],
        );
        let outer = Code::function(
            "outer",
            asm(
                V,
                &[
                    ("MAKE_CELL", 1),
                    ("RESUME", 0),
                    ("LOAD_CONST", 1),
                    ("STORE_DEREF", 1),
                    ("LOAD_CLOSURE", 1),
                    ("BUILD_TUPLE", 1),
                    ("LOAD_CONST", 2),
                    ("MAKE_FUNCTION", 8),
                    ("STORE_FAST", 0),
                    ("LOAD_FAST", 0),
                    ("RETURN_VALUE", 0),
                ],
            ),
            vec![Const::None, Const::Int(0), Const::Code(inc)],
            &[("inc", LOCAL), ("x", CELL)],
        );
        let bytes = module(
            &[("RESUME", 0), ("LOAD_CONST", 0), ("MAKE_FUNCTION", 0), ("STORE_NAME", 0), ("RETURN_CONST", 1)],
            vec![Const::Code(outer), Const::None],
            &["outer"],
        );
        let out = decompile_full(&bytes, &DecompileOptions::default()).unwrap();
        assert!(out.source.contains("def outer():\n    x = 0\n"), "{}", out.source);
        assert!(out.source.contains("    def inc():\n        nonlocal x\n        x = x + 1\n"), "{}", out.source);
        assert!(out.source.contains("    return inc\n"), "{}", out.source);
        assert!(!out.report.diagnostics.iter().any(|d| matches!(d, Diagnostic::UnresolvedBinding { .. })));
        assert_eq!(out.report.functions, 2);
    }

    #[test]
    fn function_assigning_a_global_declares_it() {
        let mut f = Code::function(
            "f",
            asm(V, &[("RESUME", 0), ("LOAD_CONST", 1), ("STORE_GLOBAL", 0), ("RETURN_CONST", 0)]),
            vec![Const::None, Const::Int(1)],
            &[],
        );
        f.names = vec!["counter"];
        let bytes = module(
            &[("RESUME", 0), ("LOAD_CONST", 0), ("MAKE_FUNCTION", 0), ("STORE_NAME", 0), ("RETURN_CONST", 1)],
            vec![Const::Code(f), Const::None],
            &["f"],
        );
        assert_eq!(source(&bytes), "def f():\n    global counter\n    counter = 1\n");
    }
}

mod failures {
    use super::*;

    #[test]
    fn unknown_opcode_leaves_exactly_one_marker() {
        let mut code = asm(V, &[("RESUME", 0), ("LOAD_NAME", 0)]);
        code.extend([254, 0]);
        code.extend(asm(V, &[("STORE_NAME", 1), ("LOAD_CONST", 0), ("STORE_NAME", 2), ("RETURN_CONST", 1)]));
        let bytes = pyc(V, &Code::module(code, vec![Const::Int(1), Const::None], &["a", "x", "y"]));

        let out = decompile_full(&bytes, &DecompileOptions::default()).unwrap();
        assert_eq!(out.source.lines().filter(|l| l.trim_start().starts_with(MARKER)).count(), 1, "{}", out.source);
        assert!(out.source.contains("y = 1"));
        assert_eq!(out.report.unreconstructed, 1);
        assert!(out.report.diagnostics.iter().any(|d| matches!(d, Diagnostic::UnknownOpcode { opname, .. } if opname == "<254>")));

        let quiet = DecompileOptions { markers: false, ..DecompileOptions::default() };
        assert!(!decompile_with_options(&bytes, &quiet).unwrap().contains(MARKER));
    }

    #[test]
    fn unsupported_magic_is_rejected_unless_forced() {
        // 3760 is past every known range; the closest table is 3.14
        let v = PyVersion::V3_14;
        let root = Code::module(asm(v, &[("RESUME", 0), ("LOAD_CONST", 0), ("RETURN_VALUE", 0)]), vec![Const::None], &[]);
        let bytes = pyc_with_magic(3760, &root);
        assert_eq!(decompile(&bytes), Err(DecompileError::UnsupportedVersion { magic: 3760 }));

        let forced = DecompileOptions { force: true, ..DecompileOptions::default() };
        assert!(decompile_with_options(&bytes, &forced).is_ok());

        let pinned = DecompileOptions { version: VersionSelect::Fixed(v), ..DecompileOptions::default() };
        assert!(decompile_with_options(&bytes, &pinned).is_ok());
    }

    #[test]
    fn truncated_container() {
        assert!(matches!(decompile(&[0xcb, 0x0d, b'\r', b'\n']), Err(DecompileError::TruncatedInput { .. })));
    }

    #[test]
    fn broken_nested_code_becomes_a_stub() {
        let mut broken = Code::function("broken", asm(V, &[("RESUME", 0), ("RETURN_CONST", 0)]), vec![Const::None], &[]);
        broken.code.push(0);
        let bytes = module(
            &[
                ("RESUME", 0),
                ("LOAD_CONST", 0),
                ("MAKE_FUNCTION", 0),
                ("STORE_NAME", 0),
                ("LOAD_CONST", 1),
                ("STORE_NAME", 1),
                ("RETURN_CONST", 2),
            ],
            vec![Const::Code(broken), Const::Int(7), Const::None],
            &["broken", "after"],
        );
        let out = source(&bytes);
        assert!(out.contains("def broken():\n"), "{out}");
        assert!(out.contains(&format!("{MARKER} <error>")), "{out}");
        assert!(out.contains("after = 7\n"), "{out}");
    }
}

mod options {
    use super::*;

    #[test]
    fn declarations_are_inserted_once() {
        let bytes = module(
            &[("RESUME", 0), ("LOAD_CONST", 0), ("STORE_NAME", 0), ("RETURN_CONST", 1)],
            vec![Const::Int(1), Const::None],
            &["y"],
        );
        let mut options = DecompileOptions::default();
        options.declarations.insert("POINT".into(), "class POINT(Structure):\n    pass".into());
        options.declarations.insert("y".into(), "y = 0".into());
        let out = decompile_with_options(&bytes, &options).unwrap();
        assert_eq!(out.matches("class POINT").count(), 1);
        assert!(!out.contains("y = 0"));
        assert!(out.contains("y = 1"));
    }

    #[test]
    fn sequential_and_parallel_agree() {
        let mut ops = vec![("RESUME", 0), ("LOAD_NAME", 0), ("POP_JUMP_IF_FALSE", 5)];
        ops.extend(call(1));
        ops.push(("RETURN_CONST", 0));
        ops.extend(call(2));
        ops.push(("RETURN_CONST", 0));
        let bytes = module(&ops, vec![Const::None], &["c", "a", "b"]);
        let seq = DecompileOptions { parallel: false, ..DecompileOptions::default() };
        assert_eq!(decompile_with_options(&bytes, &seq).unwrap(), source(&bytes));
    }

    #[test]
    fn disassembly_lists_every_code_object() {
        let f = Code::function("f", asm(V, &[("RESUME", 0), ("RETURN_CONST", 0)]), vec![Const::None], &[]);
        let bytes = module(
            &[("RESUME", 0), ("LOAD_CONST", 0), ("MAKE_FUNCTION", 0), ("STORE_NAME", 0), ("RETURN_CONST", 1)],
            vec![Const::Code(f), Const::None],
            &["f"],
        );
        let listing = disassemble(&bytes).unwrap();
        assert!(listing.contains("MAKE_FUNCTION"));
        assert_eq!(listing.matches("RESUME").count(), 2);
        assert_eq!(decompile_with_options(&bytes, &DecompileOptions { mode: DecompileMode::Disasm, ..Default::default() }).unwrap(), listing);
    }
}

mod text_dump {
    use super::*;

    const LISTING: &str = "\
  0           0 RESUME                   0

  1           2 LOAD_CONST               0 (<code object f at 0x7f01, file \"t.py\", line 1>)
              4 MAKE_FUNCTION            0
              6 STORE_NAME               0 (f)
              8 RETURN_CONST             1 (None)

Disassembly of <code object f at 0x7f01, file \"t.py\", line 1>:
  1           0 RESUME                   0

  2           2 LOAD_FAST                0 (a)
              4 POP_JUMP_IF_FALSE        2 (to 10)
              6 LOAD_CONST               1 ('yes')
              8 RETURN_VALUE
        >>   10 LOAD_FAST                1 (b)
             12 RETURN_VALUE
";

    #[test]
    fn text_dump_input() {
        let out = decompile_text(LISTING, &DecompileOptions::default()).unwrap();
        assert!(out.starts_with("def f(a, b):\n"), "{out}");
        assert!(out.contains("return 'yes'"), "{out}");
        assert!(out.contains("return b\n"), "{out}");
        // auto-detected from bytes as well
        assert_eq!(decompile(LISTING.as_bytes()).unwrap(), out);
    }

    #[test]
    fn text_dump_bare_except() {
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
        let out = decompile_text(text, &DecompileOptions::default()).unwrap();
        assert!(out.contains("try:\n    x\nexcept:\n"), "{out}");
    }
}
