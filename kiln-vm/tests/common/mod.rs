//! Helpers shared by the integration tests.

#![allow(dead_code)]

use kiln_vm::{Assembly, Intermediate, Runtime, RuntimeParams, StringSink};

/// Links an intermediate against an empty runtime surface.
pub fn link_plain(intermediate: &Intermediate) -> Assembly {
    kiln_vm::link(intermediate, &Runtime::new()).expect("link")
}

/// Executes an assembly on an empty runtime surface, capturing dump output.
pub fn run_plain(assembly: &Assembly) -> (i32, String) {
    run_on(&Runtime::new(), assembly)
}

/// Executes an assembly on `runtime`, capturing dump output.
pub fn run_on(runtime: &Runtime, assembly: &Assembly) -> (i32, String) {
    let mut sink = StringSink::default();
    let code = runtime
        .execute_with_sink(assembly, RuntimeParams::default(), &mut sink)
        .expect("execute");
    (code, sink.output)
}
