//! Merger identities and collision detection.

mod common;

use common::{link_plain, run_plain};
use kiln_types::TypeId;
use kiln_vm::{parse_source, Generator, Intermediate, MergeError, Operand};

fn trivial_module(main_value: i32) -> Intermediate {
    let mut gen = Generator::new("trivial");
    let main = gen.declare_method("main").unwrap();
    let sig = gen.make_signature(TypeId::I32, &[]).unwrap();
    let mut w = gen.define_method(main, sig).unwrap();
    w.write_retv(Operand::constant(main_value)).unwrap();
    gen.finish_method(w).unwrap();
    gen.finalize().unwrap()
}

#[test]
fn empty_is_the_merge_identity() {
    let x = trivial_module(3);
    let empty = Intermediate::empty();

    let left = empty.merge(&x).unwrap();
    let right = x.merge(&empty).unwrap();
    assert_eq!(left.bytes(), x.bytes());
    assert_eq!(right.bytes(), x.bytes());
}

#[test]
fn disjoint_merge_commutes_observably() {
    let a = parse_source(
        "a.kln",
        r#"
method Alpha returns i32
    retv 11
end
"#,
    )
    .unwrap();
    let b = parse_source(
        "b.kln",
        r#"
method Beta returns i32
    retv 22
end

method main returns i32
    call Alpha
    dump {^}
    call Beta
    dump {^}
    retv 0
end
"#,
    )
    .unwrap();

    let ab = link_plain(&a.merge(&b).unwrap());
    let ba = link_plain(&b.merge(&a).unwrap());
    assert_eq!(run_plain(&ab), run_plain(&ba));
}

#[test]
fn merge_is_usable_repeatedly() {
    // Three-way merge with shared type declarations deduplicates the type.
    let a = parse_source(
        "a.kln",
        r#"
struct Point
    i32 x
    i32 y
end

method MakeOrigin returns i32
    retv 0
end
"#,
    )
    .unwrap();
    let b = parse_source(
        "b.kln",
        r#"
method main returns i32
    stack
        0: Point
    end
    set {0}.Point:x 4
    set {0}.Point:y 5
    dump {0}
    retv 0
end
"#,
    )
    .unwrap();
    let merged = a.merge(&b).unwrap();
    let assembly = link_plain(&merged);
    let (code, output) = run_plain(&assembly);
    assert_eq!(code, 0);
    assert_eq!(output, "Point{ x = i32(4), y = i32(5) }\n");
}

#[test]
fn type_redefinition_collides() {
    let a = parse_source("a.kln", "struct T\n\ti32 x\nend\n").unwrap();
    let b = parse_source("b.kln", "struct T\n\tf32 y\nend\n").unwrap();
    let err = a.merge(&b).unwrap_err();
    assert!(matches!(err, MergeError::TypeRedefinition { name, .. } if name == "T"));
}

#[test]
fn duplicate_type_declarations_merge_quietly() {
    // Declaration-only types collapse; one body wins.
    let a = parse_source(
        "a.kln",
        r#"
struct T
    i32 x
end
"#,
    )
    .unwrap();
    let b = parse_source(
        "b.kln",
        r#"
method main returns i32
    stack
        0: T*
    end
    set {0} null
    retv 0
end
"#,
    )
    .unwrap();
    let merged = a.merge(&b).unwrap();
    let (code, _) = run_plain(&link_plain(&merged));
    assert_eq!(code, 0);
}

#[test]
fn method_redefinition_collides() {
    let a = parse_source("a.kln", "method F returns i32\n\tretv 1\nend\n").unwrap();
    let b = parse_source("b.kln", "method F returns i32\n\tretv 2\nend\n").unwrap();
    let err = a.merge(&b).unwrap_err();
    assert!(matches!(err, MergeError::MethodRedefinition { name, .. } if name == "F"));
}

#[test]
fn global_redefinition_collides() {
    let a = parse_source("a.kln", "global\n\ti32 g init 1 end\nend\n").unwrap();
    let b = parse_source("b.kln", "global\n\ti32 g init 2 end\nend\n").unwrap();
    let err = a.merge(&b).unwrap_err();
    assert!(matches!(err, MergeError::GlobalRedefinition { name } if name == "g"));
}

#[test]
fn identifier_kind_collision_is_detected() {
    let a = parse_source("a.kln", "struct Thing\n\ti32 x\nend\n").unwrap();
    let b = parse_source("b.kln", "method Thing returns i32\n\tretv 0\nend\n").unwrap();
    let err = a.merge(&b).unwrap_err();
    assert!(matches!(err, MergeError::IdentifierTypeMismatch { name } if name == "Thing"));
}

#[test]
fn merged_generated_types_deduplicate() {
    let a = parse_source(
        "a.kln",
        r#"
method UseA returns i32
    stack
        0: i32*
        1: i32[3]
    end
    retv 0
end
"#,
    )
    .unwrap();
    let b = parse_source(
        "b.kln",
        r#"
method main returns i32
    stack
        0: i32*
        1: i32[3]
    end
    retv 0
end
"#,
    )
    .unwrap();
    let merged = a.merge(&b).unwrap();
    let assembly = link_plain(&merged);
    let data = assembly.data().unwrap();
    let pointer_count = data
        .module
        .types
        .iter()
        .filter(|ty| !ty.is_base() && ty.is_pointer())
        .count();
    let array_count = data.module.types.iter().filter(|ty| ty.is_array()).count();
    assert_eq!(pointer_count, 1);
    assert_eq!(array_count, 1);
}

#[test]
fn incompatible_blobs_are_rejected() {
    let err = Intermediate::from_bytes(vec![1, 2, 3]);
    assert!(err.is_none());

    let x = trivial_module(0);
    let mut tampered = x.bytes().to_vec();
    // Flip a version byte behind the magic.
    tampered[5] ^= 0xFF;
    let tampered = Intermediate::from_bytes(tampered).unwrap();
    let err = x.merge(&tampered).unwrap_err();
    assert!(matches!(err, MergeError::IncompatibleIntermediate));
}
