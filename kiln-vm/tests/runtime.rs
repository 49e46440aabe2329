//! Runtime limits, external calls and the runtime hash guard.

mod common;

use common::{link_plain, run_on};
use kiln_types::TypeId;
use kiln_vm::{
    parse_source, ExternalCall, Library, NativeDecl, Runtime, RuntimeError, RuntimeParams,
    StringSink,
};

#[test]
fn oversized_locals_overflow_before_executing() {
    let source = r#"
method main returns i32
    stack
        0: i32[100000]
    end
    dump 1
    retv 0
end
"#;
    let intermediate = parse_source("overflow.kln", source).unwrap();
    let assembly = link_plain(&intermediate);

    let params = RuntimeParams {
        max_stack_size: 1 << 12,
        min_stack_size: 1 << 8,
        max_callstack_depth: 64,
    };
    let mut sink = StringSink::default();
    let err = Runtime::new()
        .execute_with_sink(&assembly, params, &mut sink)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::StackOverflow { .. }));
    // Nothing ran; the frame never fit.
    assert!(sink.output.is_empty());
}

#[test]
fn unbounded_recursion_hits_the_callstack_limit() {
    let source = r#"
method Spin
    call Spin
    ret
end

method main returns i32
    call Spin
    retv 0
end
"#;
    let intermediate = parse_source("recurse.kln", source).unwrap();
    let assembly = link_plain(&intermediate);

    let params = RuntimeParams {
        max_callstack_depth: 32,
        ..RuntimeParams::default()
    };
    let err = Runtime::new()
        .execute_with_sink(&assembly, params, &mut StringSink::default())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::CallstackLimit { max_depth: 32 }));
}

#[test]
fn impossible_stack_bounds_fail_allocation() {
    let source = "method main returns i32\n\tretv 0\nend\n";
    let intermediate = parse_source("alloc.kln", source).unwrap();
    let assembly = link_plain(&intermediate);

    let params = RuntimeParams {
        max_stack_size: 1 << 4,
        min_stack_size: 1 << 10,
        max_callstack_depth: 8,
    };
    let err = Runtime::new()
        .execute_with_sink(&assembly, params, &mut StringSink::default())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::StackAllocationFailure));
}

#[test]
fn missing_entry_point_is_reported() {
    let source = "method NotMain returns i32\n\tretv 0\nend\n";
    let intermediate = parse_source("nomain.kln", source).unwrap();
    let assembly = link_plain(&intermediate);
    let err = Runtime::new()
        .execute_with_sink(&assembly, RuntimeParams::default(), &mut StringSink::default())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::EntrypointNotFound));
}

fn square_thunk(ret: &mut [u8], params: &[u8]) {
    let v = i32::from_le_bytes(params[..4].try_into().unwrap());
    ret[..4].copy_from_slice(&(v * v).to_le_bytes());
}

fn host_runtime() -> Runtime {
    Runtime::from_libraries(vec![Library::new("host_math").with(ExternalCall::bind(
        "Square",
        NativeDecl::of(TypeId::I32),
        [NativeDecl::of(TypeId::I32)],
        square_thunk,
    ))])
}

#[test]
fn external_calls_dispatch_through_the_host_thunk() {
    let source = r#"
method main returns i32
    call Square 6
    dump {^}
    retv 0
end
"#;
    let intermediate = parse_source("extern.kln", source).unwrap();
    let runtime = host_runtime();
    let assembly = kiln_vm::link(&intermediate, &runtime).unwrap();
    let (code, output) = run_on(&runtime, &assembly);
    assert_eq!(code, 0);
    assert_eq!(output, "i32(36)\n");
}

#[test]
fn runtime_hash_guards_against_surface_swaps() {
    let source = r#"
method main returns i32
    call Square 6
    dump {^}
    retv 0
end
"#;
    let intermediate = parse_source("extern.kln", source).unwrap();
    let runtime = host_runtime();
    let assembly = kiln_vm::link(&intermediate, &runtime).unwrap();

    // Executing against a different binding surface must fail fast.
    let err = Runtime::new()
        .execute_with_sink(&assembly, RuntimeParams::default(), &mut StringSink::default())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::RuntimeHashMismatch));
}

#[test]
fn external_methods_return_through_the_return_slot() {
    // Chain an external result through arithmetic.
    let source = r#"
method main returns i32
    stack
        0: i32
    end
    call Square 5
    set {0} {^}
    add {0} 100
    dump {0}
    retv 0
end
"#;
    let intermediate = parse_source("extern2.kln", source).unwrap();
    let runtime = host_runtime();
    let assembly = kiln_vm::link(&intermediate, &runtime).unwrap();
    let (_, output) = run_on(&runtime, &assembly);
    assert_eq!(output, "i32(125)\n");
}
