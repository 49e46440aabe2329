//! End-to-end scenarios: build, link, execute, check the dump trace.

mod common;

use common::{link_plain, run_plain};
use kiln_types::TypeId;
use kiln_vm::{parse_source, Generator, Init, LinkError, Operand, Runtime};

#[test]
fn multiplication() {
    let mut gen = Generator::new("s1");

    let mul = gen.declare_method("Mul").unwrap();
    let mul_sig = gen
        .make_signature(TypeId::I32, &[TypeId::I32, TypeId::I32])
        .unwrap();
    let mut w = gen.define_method(mul, mul_sig).unwrap();
    w.write_mul(Operand::param(0), Operand::param(1)).unwrap();
    w.write_retv(Operand::param(0)).unwrap();
    gen.finish_method(w).unwrap();

    let main = gen.declare_method("main").unwrap();
    let main_sig = gen.make_signature(TypeId::I32, &[]).unwrap();
    let mut w = gen.define_method(main, main_sig).unwrap();
    w.set_stack(&[TypeId::I32, TypeId::I32, TypeId::I32]).unwrap();
    w.write_set(Operand::stack(0), Operand::constant(4i32)).unwrap();
    w.write_set(Operand::stack(1), Operand::constant(5i32)).unwrap();
    w.write_call(mul, &[Operand::stack(0), Operand::stack(1)]).unwrap();
    w.write_set(Operand::stack(2), Operand::ret_val()).unwrap();
    w.write_dump(Operand::stack(2)).unwrap();
    w.write_retv(Operand::constant(0i32)).unwrap();
    gen.finish_method(w).unwrap();

    let assembly = link_plain(&gen.finalize().unwrap());
    let (code, output) = run_plain(&assembly);
    assert_eq!(code, 0);
    assert!(output.contains("(20)"), "{output}");
}

#[test]
fn conditional() {
    let source = r#"
method main returns i32
    stack
        0: i32
    end
    set {0} 10
    bgt greater {0} 5
    dump 0
    br done
greater:
    dump 1
done:
    retv 0
end
"#;
    let intermediate = parse_source("s2.kln", source).unwrap();
    let assembly = link_plain(&intermediate);
    let (code, output) = run_plain(&assembly);
    assert_eq!(code, 0);
    assert_eq!(output, "i32(1)\n");
}

#[test]
fn pointer_walk() {
    let source = r#"
global
    i32[5] numbers init 1 2 3 4 0 end
end

method main returns i32
    stack
        0: i32*
        1: i32
    end
    set {1} 0
    set {0} &numbers[0]
loop:
    bze done *{0}
    add {1} *{0}
    padd {0} 1
    br loop
done:
    dump {1}
    retv 0
end
"#;
    let intermediate = parse_source("s3.kln", source).unwrap();
    let assembly = link_plain(&intermediate);
    let (code, output) = run_plain(&assembly);
    assert_eq!(code, 0);
    assert_eq!(output, "i32(10)\n");
}

#[test]
fn pointer_arithmetic_identities() {
    // (p + 3) - p == 3 in elements, and the pointee size is visible
    // through a subscripted size-of.
    let source = r#"
global
    i32[4] numbers init 1 2 3 4 end
end

method main returns i32
    stack
        0: i32*
        1: i32*
    end
    set {0} &numbers[0]
    set {1} {0}
    padd {1} 3
    pdif {1} {0}
    dump {^}
    dump !{0}[0]
    retv 0
end
"#;
    let intermediate = parse_source("s3b.kln", source).unwrap();
    let assembly = link_plain(&intermediate);
    let (code, output) = run_plain(&assembly);
    assert_eq!(code, 0);
    assert_eq!(output, "i64(3)\nu64(4)\n");
}

#[test]
fn union_fields_overlap() {
    let source = r#"
union U
    i32 a
    f32 b
end

method main returns i32
    stack
        0: U
    end
    set {0}.U:a 0x40490FDB
    dump {0}.U:b
    retv 0
end
"#;
    let intermediate = parse_source("s4.kln", source).unwrap();
    let assembly = link_plain(&intermediate);

    // Offsets overlap at zero and the union is as wide as its widest field.
    let data = assembly.data().unwrap();
    let union_ty = data
        .module
        .types
        .iter()
        .find(|ty| {
            data.module
                .names
                .name_or(ty.name, "")
                .eq("U")
        })
        .unwrap();
    assert_eq!(union_ty.total_size, 4);
    assert!(union_ty.fields.iter().all(|f| f.offset == 0));

    let (code, output) = run_plain(&assembly);
    assert_eq!(code, 0);
    assert!(output.starts_with("f32(3.1415927)"), "{output}");
}

#[test]
fn merge_resolves_forward_declaration() {
    // Intermediate A declares Add and calls it; B supplies the body.
    let mut gen = Generator::new("a");
    let add = gen.declare_method("Add").unwrap();
    let main = gen.declare_method("main").unwrap();
    let main_sig = gen.make_signature(TypeId::I32, &[]).unwrap();
    let mut w = gen.define_method(main, main_sig).unwrap();
    w.write_call(
        add,
        &[Operand::constant(20i32), Operand::constant(15i32)],
    )
    .unwrap();
    w.write_dump(Operand::ret_val()).unwrap();
    w.write_retv(Operand::constant(0i32)).unwrap();
    gen.finish_method(w).unwrap();
    let a = gen.finalize().unwrap();

    let b = parse_source(
        "b.kln",
        r#"
method Add returns i32
    parameters
        0: i32
        1: i32
    end
    add (0) (1)
    retv (0)
end
"#,
    )
    .unwrap();

    let merged = a.merge(&b).unwrap();
    let assembly = link_plain(&merged);
    let (code, output) = run_plain(&assembly);
    assert_eq!(code, 0);
    assert_eq!(output, "i32(35)\n");

    // Linking A alone leaves Add undefined.
    let err = kiln_vm::link(&a, &Runtime::new()).unwrap_err();
    assert!(matches!(err, LinkError::UndefinedMethod { name, .. } if name == "Add"));
}

#[test]
fn cyclic_type_is_rejected_but_pointer_cycle_links() {
    let cyclic = parse_source(
        "s6a.kln",
        r#"
struct S
    S field
end

method main returns i32
    retv 0
end
"#,
    )
    .unwrap();
    let err = kiln_vm::link(&cyclic, &Runtime::new()).unwrap_err();
    assert!(matches!(err, LinkError::RecursiveTypeDefinition { .. }));

    let linked = parse_source(
        "s6b.kln",
        r#"
struct S
    S* next
    i32 value
end

method main returns i32
    stack
        0: S
    end
    set {0}.S:value 7
    set {0}.S:next null
    dump {0}.S:value
    retv 0
end
"#,
    )
    .unwrap();
    let assembly = link_plain(&linked);
    let (code, output) = run_plain(&assembly);
    assert_eq!(code, 0);
    assert_eq!(output, "i32(7)\n");
}

#[test]
fn switch_dispatch() {
    let source = r#"
method main returns i32
    stack
        0: i32
    end
    set {0} 2
    sw {0} case0 case1 case2
    dump -1
    retv 1
case0:
    dump 100
    retv 0
case1:
    dump 101
    retv 0
case2:
    dump 102
    retv 0
end
"#;
    let intermediate = parse_source("sw.kln", source).unwrap();
    let assembly = link_plain(&intermediate);
    let (code, output) = run_plain(&assembly);
    assert_eq!(code, 0);
    assert_eq!(output, "i32(102)\n");
}

#[test]
fn method_pointer_constant_and_callv() {
    let source = r#"
method Twice returns i32
    parameters
        0: i32
    end
    mul (0) 2
    retv (0)
end

constant
    i32(i32) fn init Twice end
end

method main returns i32
    callv fn 21
    dump {^}
    retv 0
end
"#;
    let intermediate = parse_source("callv.kln", source).unwrap();
    let assembly = link_plain(&intermediate);
    let (code, output) = run_plain(&assembly);
    assert_eq!(code, 0);
    assert_eq!(output, "i32(42)\n");
}

#[test]
fn aggregate_dump_and_global_initializers() {
    let source = r#"
struct Pair
    i32 first
    f64 second
end

global
    Pair pair init 3 2.5 end
end

method main returns i32
    dump pair
    retv 0
end
"#;
    let intermediate = parse_source("agg.kln", source).unwrap();
    let assembly = link_plain(&intermediate);
    let (code, output) = run_plain(&assembly);
    assert_eq!(code, 0);
    assert_eq!(output, "Pair{ first = i32(3), second = f64(2.5) }\n");
}

#[test]
fn global_initializer_converts_literals() {
    let source = r#"
constant
    f32 ratio init 3 end
end

method main returns i32
    dump ratio
    retv 0
end
"#;
    let intermediate = parse_source("conv.kln", source).unwrap();
    let assembly = link_plain(&intermediate);
    let (_, output) = run_plain(&assembly);
    assert_eq!(output, "f32(3)\n");
}

#[test]
fn struct_init_list_overflow_is_rejected() {
    let source = r#"
global
    i32[2] pair init 1 2 3 end
end

method main returns i32
    retv 0
end
"#;
    let intermediate = parse_source("ovf.kln", source).unwrap();
    let err = kiln_vm::link(&intermediate, &Runtime::new()).unwrap_err();
    assert!(matches!(err, LinkError::GlobalInitializerOverflow { .. }));
}

#[test]
fn global_inits_distinguish_methods() {
    // A function-pointer global without an initializer must be rejected.
    let source = r#"
method Id returns i32
    parameters
        0: i32
    end
    retv (0)
end

global
    i32(i32) fn
end

method main returns i32
    retv 0
end
"#;
    let intermediate = parse_source("uninit.kln", source).unwrap();
    let err = kiln_vm::link(&intermediate, &Runtime::new()).unwrap_err();
    assert!(matches!(err, LinkError::UninitializedMethodPointer { .. }));

    let init = Init::from(5i32);
    assert!(matches!(init, Init::Value(_)));
}
