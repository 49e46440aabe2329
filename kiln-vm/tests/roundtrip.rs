//! Assembly -> IL text -> parser -> merge(empty) -> linker -> assembly
//! preserves observable behavior.

mod common;

use common::{link_plain, run_plain};
use kiln_vm::{parse_source, translator, Assembly, Intermediate};

fn round_trip(assembly: &Assembly) -> Assembly {
    let text = translator::translate_il(assembly).expect("translate");
    let reparsed = parse_source("roundtrip.kln", &text).expect("reparse");
    let merged = Intermediate::empty().merge(&reparsed).expect("merge");
    link_plain(&merged)
}

fn assert_round_trips(source: &str) {
    let intermediate = parse_source("original.kln", source).unwrap();
    let assembly = link_plain(&intermediate);
    let expected = run_plain(&assembly);
    let again = round_trip(&assembly);
    assert_eq!(run_plain(&again), expected);
    // A second trip through the translator is a fixed point.
    let text_a = translator::translate_il(&assembly).unwrap();
    let text_b = translator::translate_il(&again).unwrap();
    assert_eq!(text_a, text_b);
}

#[test]
fn arithmetic_and_calls_round_trip() {
    assert_round_trips(
        r#"
method Mul returns i32
    parameters
        0: i32
        1: i32
    end
    mul (0) (1)
    retv (0)
end

method main returns i32
    stack
        0: i32
        1: i32
        2: i32
    end
    set {0} 4
    set {1} 5
    call Mul {0} {1}
    set {2} {^}
    dump {2}
    retv 0
end
"#,
    );
}

#[test]
fn control_flow_round_trips() {
    assert_round_trips(
        r#"
method main returns i32
    stack
        0: i32
        1: i32
    end
    set {0} 0
    set {1} 0
again:
    add {1} {0}
    add {0} 1
    blt again {0} 10
    dump {1}
    sw {0} finish finish
    retv 1
finish:
    retv 0
end
"#,
    );
}

#[test]
fn structs_pointers_and_globals_round_trip() {
    assert_round_trips(
        r#"
struct Vec2
    i32 x
    i32 y
end

global
    Vec2 origin init 3 4 end
    i32[3] table init 7 8 9 end
end

method main returns i32
    stack
        0: i32*
        1: i32
    end
    set {0} &table[1]
    set {1} *{0}
    add {1} origin.Vec2:x
    dump {1}
    dump origin
    retv 0
end
"#,
    );
}

#[test]
fn method_pointer_constants_round_trip() {
    assert_round_trips(
        r#"
method Inc returns i32
    parameters
        0: i32
    end
    add (0) 1
    retv (0)
end

constant
    i32(i32) bump init Inc end
end

method main returns i32
    callv bump 41
    dump {^}
    retv 0
end
"#,
    );
}

#[test]
fn unions_round_trip() {
    assert_round_trips(
        r#"
union Bits
    i32 word
    f32 real
end

method main returns i32
    stack
        0: Bits
    end
    set {0}.Bits:word 0x40490FDB
    dump {0}.Bits:real
    retv 0
end
"#,
    );
}
