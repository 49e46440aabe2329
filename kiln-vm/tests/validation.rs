//! Link-time validation: every ill-typed operand pair and malformed
//! reference must be caught with a typed error before anything executes.

mod common;

use kiln_types::TypeId;
use kiln_vm::{parse_source, LinkError, Runtime};
use test_case::test_case;

fn link_err(source: &str) -> LinkError {
    let intermediate = parse_source("validation.kln", source).unwrap();
    kiln_vm::link(&intermediate, &Runtime::new()).unwrap_err()
}

fn method_with_stack(stack: &str, body: &str) -> String {
    format!(
        "method main returns i32\n\tstack\n{stack}\tend\n{body}\tretv 0\nend\n"
    )
}

#[test_case("add", "0: i32\n\t\t1: f32\n" ; "add int float")]
#[test_case("sub", "0: u32\n\t\t1: i32\n" ; "sub unsigned signed")]
#[test_case("mul", "0: i16\n\t\t1: i32\n" ; "mul narrowing")]
#[test_case("div", "0: u8\n\t\t1: i8\n" ; "div sign mix")]
#[test_case("mod", "0: f32\n\t\t1: f64\n" ; "mod narrowing float")]
fn arithmetic_pairs_outside_the_table_fail(op: &str, stack: &str) {
    let source = method_with_stack(
        &format!("\t\t{stack}"),
        &format!("\t{op} {{0}} {{1}}\n"),
    );
    assert!(matches!(
        link_err(&source),
        LinkError::InvalidArithmeticExpression { .. }
    ));
}

#[test_case("lsh" ; "shift left")]
#[test_case("and" ; "bitwise and")]
fn integral_ops_reject_floats(op: &str) {
    let source = method_with_stack(
        "\t\t0: f32\n\t\t1: i32\n",
        &format!("\t{op} {{0}} {{1}}\n"),
    );
    assert!(matches!(
        link_err(&source),
        LinkError::InvalidArithmeticExpression { .. }
    ));
}

#[test]
fn set_rejects_narrowing() {
    let source = method_with_stack("\t\t0: i32\n\t\t1: i64\n", "\tset {0} {1}\n");
    assert!(matches!(
        link_err(&source),
        LinkError::InvalidImplicitConversion { .. }
    ));
}

#[test]
fn comparison_rejects_signed_u64_mix() {
    let source = method_with_stack("\t\t0: i32\n\t\t1: u64\n", "\tcmp {0} {1}\n");
    assert!(matches!(
        link_err(&source),
        LinkError::InvalidComparisonExpression { .. }
    ));
}

#[test]
fn neg_rejects_unsigned() {
    let source = method_with_stack("\t\t0: u32\n", "\tneg {0}\n");
    assert!(matches!(
        link_err(&source),
        LinkError::InvalidArithmeticExpression { .. }
    ));
}

#[test]
fn pointer_ops_require_a_pointer() {
    let source = method_with_stack("\t\t0: i32\n", "\tpadd {0} 1\n");
    assert!(matches!(
        link_err(&source),
        LinkError::InvalidPointerExpression { .. }
    ));
}

#[test]
fn pointer_offset_must_be_integral() {
    let source = method_with_stack("\t\t0: i32*\n\t\t1: f32\n", "\tpadd {0} {1}\n");
    assert!(matches!(
        link_err(&source),
        LinkError::InvalidPointerOffsetExpression { .. }
    ));
}

#[test]
fn pdif_requires_matching_pointees() {
    let source = method_with_stack("\t\t0: i32*\n\t\t1: f32*\n", "\tpdif {0} {1}\n");
    assert!(matches!(
        link_err(&source),
        LinkError::InvalidPointerExpression { .. }
    ));
}

#[test]
fn switch_selector_must_be_integral() {
    let source = method_with_stack("\t\t0: f64\n", "\tsw {0}\n");
    assert!(matches!(link_err(&source), LinkError::InvalidSwitchType { .. }));
}

#[test]
fn call_argument_count_is_checked() {
    let source = r#"
method Two returns i32
    parameters
        0: i32
        1: i32
    end
    retv (0)
end

method main returns i32
    call Two 1
    retv 0
end
"#;
    assert!(matches!(
        link_err(source),
        LinkError::ArgumentCountMismatch {
            provided: 1,
            expected: 2,
            ..
        }
    ));
}

#[test]
fn call_argument_types_are_checked() {
    let source = r#"
method TakesInt returns i32
    parameters
        0: i32
    end
    retv (0)
end

method main returns i32
    call TakesInt 1.5
    retv 0
end
"#;
    assert!(matches!(
        link_err(source),
        LinkError::InvalidImplicitConversion { .. }
    ));
}

#[test]
fn callv_requires_a_signature_type() {
    let source = method_with_stack("\t\t0: i32*\n", "\tcallv {0}\n");
    assert!(matches!(
        link_err(&source),
        LinkError::NonSignatureTypeInvoke { .. }
    ));
}

#[test]
fn return_slot_requires_a_value() {
    let source = method_with_stack("\t\t0: i32\n", "\tnoop\n\tset {0} {^}\n");
    assert!(matches!(
        link_err(&source),
        LinkError::InvalidReturnAddress { .. }
    ));
}

#[test]
fn array_subscript_is_bounds_checked() {
    let source = method_with_stack("\t\t0: i32[4]\n\t\t1: i32\n", "\tset {1} {0}[4]\n");
    assert!(matches!(
        link_err(&source),
        LinkError::ArrayIndexOutOfRange {
            index: 4,
            length: 4,
            ..
        }
    ));
}

#[test]
fn field_modifiers_must_match_pointer_depth() {
    let source = r#"
struct S
    i32 x
end

method main returns i32
    stack
        0: S*
        1: i32
    end
    set {0} null
    set {1} {0}.S:x
    retv 0
end
"#;
    assert!(matches!(
        link_err(source),
        LinkError::InvalidOffsetModifier { .. }
    ));
}

#[test]
fn arrow_requires_a_pointer() {
    let source = r#"
struct S
    i32 x
end

method main returns i32
    stack
        0: S
        1: i32
    end
    set {1} {0}->S:x
    retv 0
end
"#;
    assert!(matches!(
        link_err(source),
        LinkError::InvalidOffsetModifier { .. }
    ));
}

#[test]
fn field_chain_root_must_match() {
    let source = r#"
struct S
    i32 x
end

struct T
    i32 y
end

method main returns i32
    stack
        0: S
        1: i32
    end
    set {1} {0}.T:y
    retv 0
end
"#;
    assert!(matches!(
        link_err(source),
        LinkError::FieldParentTypeMismatch { .. }
    ));
}

#[test]
fn unknown_field_names_fail() {
    let source = r#"
struct S
    i32 x
end

method main returns i32
    stack
        0: S
        1: i32
    end
    set {1} {0}.S:missing
    retv 0
end
"#;
    assert!(matches!(
        link_err(source),
        LinkError::UndefinedTypeField { type_name, field } if type_name == "S" && field == "missing"
    ));
}

#[test]
fn dereference_requires_a_typed_pointer() {
    let not_pointer = method_with_stack("\t\t0: i32\n\t\t1: i32\n", "\tset {1} *{0}\n");
    assert!(matches!(
        link_err(&not_pointer),
        LinkError::InvalidPointerDereference { .. }
    ));

    let vptr = method_with_stack("\t\t0: vptr\n\t\t1: i32\n", "\tset {1} *{0}\n");
    assert!(matches!(
        link_err(&vptr),
        LinkError::AbstractPointerDereference { .. }
    ));
}

#[test]
fn constants_are_not_write_targets() {
    let set = r#"
constant
    i32 limit init 3 end
end

method main returns i32
    set limit 5
    retv 0
end
"#;
    assert!(matches!(
        link_err(set),
        LinkError::ConstantWrite { name, .. } if name == "limit"
    ));

    let arith = r#"
constant
    i32 limit init 3 end
end

method main returns i32
    add limit 1
    retv 0
end
"#;
    assert!(matches!(
        link_err(arith),
        LinkError::ConstantWrite { name, .. } if name == "limit"
    ));

    let unary = r#"
constant
    i32 limit init 3 end
end

method main returns i32
    not limit
    retv 0
end
"#;
    assert!(matches!(
        link_err(unary),
        LinkError::ConstantWrite { name, .. } if name == "limit"
    ));

    // Field and subscript destinations rooted in a constant are writes too.
    let field = r#"
struct Pair
    i32 first
    i32 second
end

constant
    Pair pair init 1 2 end
end

method main returns i32
    set pair.Pair:first 9
    retv 0
end
"#;
    assert!(matches!(
        link_err(field),
        LinkError::ConstantWrite { name, .. } if name == "pair"
    ));
}

#[test]
fn constants_remain_readable() {
    let source = r#"
constant
    i32 limit init 3 end
end

method main returns i32
    stack
        0: i32
    end
    set {0} limit
    add {0} limit
    retv 0
end
"#;
    let intermediate = parse_source("read.kln", source).unwrap();
    assert!(kiln_vm::link(&intermediate, &Runtime::new()).is_ok());
}

#[test]
fn undefined_global_reference_fails() {
    let source = "method main returns i32\n\tdump missing\n\tretv 0\nend\n";
    assert!(matches!(
        link_err(source),
        LinkError::UndefinedGlobal { name, .. } if name == "missing"
    ));
}

#[test]
fn zero_sized_struct_is_rejected() {
    let source = r#"
struct Empty
end

method main returns i32
    stack
        0: Empty
    end
    retv 0
end
"#;
    assert!(matches!(
        link_err(source),
        LinkError::TypeSizeZero { name, .. } if name == "Empty"
    ));
}

#[test]
fn undefined_value_type_is_rejected() {
    let source = r#"
method main returns i32
    stack
        0: Opaque
    end
    retv 0
end
"#;
    assert!(matches!(
        link_err(source),
        LinkError::UndefinedType { name, .. } if name == "Opaque"
    ));
}

#[test]
fn conv_has_no_pointer_entries() {
    let source = method_with_stack("\t\t0: i32*\n\t\t1: i32\n", "\tconv {0} {1}\n");
    assert!(matches!(
        link_err(&source),
        LinkError::InvalidExplicitConversion { .. }
    ));
}

#[test]
fn link_is_deterministic() {
    let source = r#"
method Helper returns i32
    parameters
        0: i32
    end
    mul (0) 3
    retv (0)
end

method main returns i32
    call Helper 7
    dump {^}
    retv 0
end
"#;
    let intermediate = parse_source("det.kln", source).unwrap();
    let runtime = Runtime::new();
    let first = kiln_vm::link(&intermediate, &runtime).unwrap();
    let second = kiln_vm::link(&intermediate, &runtime).unwrap();
    assert_eq!(first.bytes(), second.bytes());
}

#[test]
fn every_base_type_has_its_table_size() {
    // Mirrors the documented base-type layout.
    let expected = [1usize, 1, 2, 2, 4, 4, 8, 8, 4, 8, 8, 0];
    for (i, expected) in expected.into_iter().enumerate() {
        assert_eq!(TypeId::new(i as u32).base_size(), expected);
    }
}
