//! Toolchain of the Kiln IL: programmatic generation and text parsing of
//! intermediates, merging, linking against a runtime binding surface,
//! bytecode interpretation, and re-emission as IL or C source.
//!
//! The pipeline, leaves first:
//!
//! ```text
//! Generator / parse_source -> Intermediate -> (merge) -> link -> Assembly
//!                                                     Runtime::execute -> i32
//! ```
//!
//! Every phase is a pure function of its inputs; an error aborts the phase
//! without producing a partial result.

#![warn(missing_docs)]

pub mod database;
pub mod literals;
pub mod module;
pub mod translator;

mod assembly;
mod error;
mod generator;
mod intermediate;
mod interpreter;
mod linker;
mod merger;
mod parser;
mod runtime;
mod serial;

pub use assembly::{Assembly, AssemblyData};
pub use error::{Error, GeneratorError, LinkError, MergeError, ParseError, Result, RuntimeError};
pub use generator::{Constant, Generator, Init, MethodWriter, Operand, TypeWriter};
pub use intermediate::Intermediate;
pub use interpreter::{DumpSink, StdoutSink, StringSink};
pub use linker::link;
pub use parser::parse_source;
pub use runtime::{ExternalCall, HostThunk, Library, NativeDecl, Runtime, RuntimeParams};

// Re-exported so generated modules can be inspected and driven without an
// extra dependency edge.
pub use kiln_asm as asm;
pub use kiln_types as types;
