//! Runtime binding surface: host libraries with external calls, and the
//! runtime hash the linker bakes into method-pointer constants.
//!
//! Loading real shared objects is the host's concern; a [`Library`] here is
//! a table of symbol names with native signature descriptors and forward
//! thunks. The thunk receives the packed parameter area and the return slot
//! and is responsible for decoding its native signature.

use std::collections::HashMap;

use kiln_types::bytes::fnv;
use kiln_types::{ToolchainVersion, TypeId, WORD_SIZE};
use tracing::debug;

use crate::assembly::Assembly;
use crate::error::RuntimeError;
use crate::interpreter::{DumpSink, Interpreter, StdoutSink};

/// Native scalar (or pointer-to-scalar) type of an external signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeDecl {
    /// Base scalar type, or `void`.
    pub base: TypeId,
    /// Pointer indirections applied to the base.
    pub indirection: u8,
}

impl NativeDecl {
    /// A plain scalar.
    pub const fn of(base: TypeId) -> Self {
        Self {
            base,
            indirection: 0,
        }
    }

    /// `void` return.
    pub const fn void() -> Self {
        Self::of(TypeId::VOID)
    }

    /// Pointer to `base`.
    pub const fn ptr(base: TypeId) -> Self {
        Self {
            base,
            indirection: 1,
        }
    }

    /// Packed byte size in the parameter area.
    pub const fn size(&self) -> usize {
        if self.indirection > 0 {
            WORD_SIZE
        } else {
            self.base.base_size()
        }
    }
}

/// Host function invoked for an external call. Receives the return slot and
/// the packed parameter area (declaration order, no padding).
pub type HostThunk = fn(ret: &mut [u8], params: &[u8]);

/// One externally callable symbol.
#[derive(Debug, Clone)]
pub struct ExternalCall {
    /// Symbol name methods bind against.
    pub name: String,
    /// Native return type.
    pub return_type: NativeDecl,
    /// Native parameter types in declaration order.
    pub parameters: Vec<NativeDecl>,
    /// Total packed parameter bytes.
    pub parameters_size: usize,
    /// Forward thunk decoding the parameter area.
    pub thunk: HostThunk,
}

impl ExternalCall {
    /// Binds a symbol with its native signature and thunk.
    pub fn bind(
        name: impl Into<String>,
        return_type: NativeDecl,
        parameters: impl Into<Vec<NativeDecl>>,
        thunk: HostThunk,
    ) -> Self {
        let parameters = parameters.into();
        let parameters_size = parameters.iter().map(NativeDecl::size).sum();
        Self {
            name: name.into(),
            return_type,
            parameters,
            parameters_size,
            thunk,
        }
    }
}

/// A named table of external calls.
#[derive(Debug, Clone)]
pub struct Library {
    /// Library name, folded into the runtime hash.
    pub name: String,
    /// Calls exposed by the library.
    pub calls: Vec<ExternalCall>,
}

impl Library {
    /// Empty library.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Vec::new(),
        }
    }

    /// Adds a call; builder style.
    pub fn with(mut self, call: ExternalCall) -> Self {
        self.calls.push(call);
        self
    }
}

/// Tunables of one execution.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeParams {
    /// Upper bound of the runtime stack allocation.
    pub max_stack_size: usize,
    /// Lower bound of the runtime stack allocation.
    pub min_stack_size: usize,
    /// Maximum simultaneous non-external call depth.
    pub max_callstack_depth: usize,
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            max_stack_size: 1 << 20,
            min_stack_size: 1 << 15,
            max_callstack_depth: 1024,
        }
    }
}

/// The runtime surface an assembly is linked against and executed on.
///
/// The hash mixes the toolchain version with every library and symbol
/// binding. Its only job is to make an assembly linked against a different
/// surface fail fast; it has no security value.
#[derive(Debug, Clone, Default)]
pub struct Runtime {
    libraries: Vec<Library>,
    lookup: HashMap<String, (u32, u32)>,
    hash: u64,
}

impl Runtime {
    /// Runtime with no external surface.
    pub fn new() -> Self {
        Self::from_libraries(Vec::new())
    }

    /// Runtime exposing `libraries`.
    pub fn from_libraries(libraries: Vec<Library>) -> Self {
        let mut lookup = HashMap::new();
        let mut hash = fnv::append(fnv::offset(), &ToolchainVersion::current().to_bytes());
        for (lib_index, lib) in libraries.iter().enumerate() {
            hash = fnv::append_str(hash, &lib.name);
            for (call_index, call) in lib.calls.iter().enumerate() {
                hash = fnv::append_str(hash, &call.name);
                hash = fnv::append_u64(
                    hash,
                    (call.return_type.base.raw() as u64) << 8 | call.return_type.indirection as u64,
                );
                for param in &call.parameters {
                    hash = fnv::append_u64(
                        hash,
                        (param.base.raw() as u64) << 8 | param.indirection as u64,
                    );
                }
                lookup
                    .entry(call.name.clone())
                    .or_insert((lib_index as u32, call_index as u32));
            }
        }
        debug!(libraries = libraries.len(), hash, "runtime surface built");
        Self {
            libraries,
            lookup,
            hash,
        }
    }

    /// Hash of this binding surface.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The bound libraries.
    pub fn libraries(&self) -> &[Library] {
        &self.libraries
    }

    /// Finds a call by symbol name.
    pub fn find_call(&self, name: &str) -> Option<(u32, u32, &ExternalCall)> {
        let &(lib, call) = self.lookup.get(name)?;
        Some((
            lib,
            call,
            &self.libraries[lib as usize].calls[call as usize],
        ))
    }

    /// The call behind a `(library, call)` pair.
    pub fn call(&self, lib: u32, call: u32) -> Option<&ExternalCall> {
        self.libraries
            .get(lib as usize)
            .and_then(|l| l.calls.get(call as usize))
    }

    /// Executes a linked assembly, dumping to stdout. Returns the entry
    /// method's `i32`.
    pub fn execute(
        &self,
        assembly: &Assembly,
        params: RuntimeParams,
    ) -> Result<i32, RuntimeError> {
        self.execute_with_sink(assembly, params, &mut StdoutSink)
    }

    /// Executes a linked assembly with a custom `dump` sink.
    pub fn execute_with_sink(
        &self,
        assembly: &Assembly,
        params: RuntimeParams,
        sink: &mut dyn DumpSink,
    ) -> Result<i32, RuntimeError> {
        if !assembly.is_valid() {
            return Err(RuntimeError::InvalidAssembly);
        }
        if !assembly.is_compatible() {
            return Err(RuntimeError::IncompatibleAssembly);
        }

        // The interpreter runs against its own immutable copy of the
        // assembly bytes; page-level write protection is the host's concern.
        let image = Assembly::from_bytes(assembly.bytes().to_vec())
            .ok_or(RuntimeError::InvalidAssembly)?;
        let data = image.decode().map_err(|_| RuntimeError::InvalidAssembly)?;

        if data.runtime_hash != self.hash {
            return Err(RuntimeError::RuntimeHashMismatch);
        }
        if !data.main.is_valid() || data.main.index() >= data.module.methods.len() {
            return Err(RuntimeError::EntrypointNotFound);
        }

        Interpreter::new(&data, self, params, sink)?.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_thunk(_ret: &mut [u8], _params: &[u8]) {}

    #[test]
    fn hash_depends_on_surface() {
        let empty = Runtime::new();
        let lib = Library::new("math").with(ExternalCall::bind(
            "Square",
            NativeDecl::of(TypeId::I32),
            [NativeDecl::of(TypeId::I32)],
            nop_thunk,
        ));
        let with_lib = Runtime::from_libraries(vec![lib.clone()]);
        assert_ne!(empty.hash(), with_lib.hash());

        let again = Runtime::from_libraries(vec![lib]);
        assert_eq!(with_lib.hash(), again.hash());
    }

    #[test]
    fn call_lookup() {
        let lib = Library::new("io").with(ExternalCall::bind(
            "PutChar",
            NativeDecl::void(),
            [NativeDecl::of(TypeId::I32)],
            nop_thunk,
        ));
        let runtime = Runtime::from_libraries(vec![lib]);
        let (lib, call, info) = runtime.find_call("PutChar").unwrap();
        assert_eq!((lib, call), (0, 0));
        assert_eq!(info.parameters_size, 4);
        assert!(runtime.find_call("Missing").is_none());
    }
}
