//! Containers written by `py_compile` from the sources next to them in `tests/data/`.

use depyc_lib::emit::MARKER;
use depyc_lib::{decompile_full, disassemble, DecompileOptions, Decompiled, PyVersion};

macro_rules! fixture {
    ($name:literal, $tag:literal) => {
        include_bytes!(concat!("data/", $name, "_", $tag, ".pyc")).as_slice()
    };
}

macro_rules! per_version {
    ($name:literal) => {
        [
            (PyVersion::V3_10, fixture!($name, "310")),
            (PyVersion::V3_11, fixture!($name, "311")),
            (PyVersion::V3_12, fixture!($name, "312")),
            (PyVersion::V3_13, fixture!($name, "313")),
        ]
    };
}

fn run(version: PyVersion, bytes: &[u8]) -> Decompiled {
    let out = decompile_full(bytes, &DecompileOptions::default())
        .unwrap_or_else(|e| panic!("{version}: {e}"));
    assert_eq!(out.report.version, version);
    out
}

fn assert_lines(version: PyVersion, source: &str, lines: &[&str]) {
    for line in lines {
        assert!(source.lines().any(|l| l == *line), "{version}: missing {line:?} in\n{source}");
    }
    assert!(!source.contains(MARKER), "{version}:\n{source}");
}

#[test]
fn branches_join_before_the_call() {
    for (version, bytes) in per_version!("branches") {
        let out = run(version, bytes);
        assert_eq!(out.source, "if c:\n    x = 1\nelse:\n    x = 2\nprint(x)\n", "{version}");
        assert_eq!(out.report.unreconstructed, 0, "{version}");
    }
}

#[test]
fn for_loop_over_range() {
    for (version, bytes) in per_version!("loop") {
        let out = run(version, bytes);
        assert_lines(version, &out.source, &["for i in range(3):"]);
        assert!(out.source.lines().any(|l| l.trim() == "print(i)"), "{version}:\n{}", out.source);
    }
}

#[test]
fn except_clause_then_code_after() {
    for (version, bytes) in per_version!("handlers") {
        let out = run(version, bytes);
        assert_lines(version, &out.source, &["try:", "    a()", "except ValueError:", "    b()", "x()"]);
    }
}

#[test]
fn function_and_class_bodies() {
    for (version, bytes) in per_version!("functions") {
        let out = run(version, bytes);
        assert_lines(
            version,
            &out.source,
            &["def add(a, b=1):", "    return a + b", "class Point:", "    def norm(self):"],
        );
        assert_eq!(out.report.functions, 2, "{version}");
        assert_eq!(out.report.classes, 1, "{version}");
    }
}

#[test]
fn listing_names_every_code_object() {
    for (version, bytes) in per_version!("functions") {
        let listing = disassemble(bytes).unwrap_or_else(|e| panic!("{version}: {e}"));
        for name in ["<module>", "add", "Point", "norm"] {
            assert!(listing.contains(name), "{version}: {name} missing from\n{listing}");
        }
    }
}
