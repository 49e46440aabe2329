//! Fully linked, executable module form.

use kiln_types::{MethodId, ToolchainVersion};

use crate::module::ModuleData;
use crate::serial::{self, CorruptBlob, ASSEMBLY_MAGIC};

/// Decoded view of a linked assembly: the resolved module tables plus the
/// entry point and the runtime hash recorded at link time.
#[derive(Debug, Clone)]
pub struct AssemblyData {
    /// Resolved tables; every size, field offset and stack offset is final.
    pub module: ModuleData,
    /// Entry point, invalid when no `main` was defined.
    pub main: MethodId,
    /// Hash of the runtime binding surface used at link time.
    pub runtime_hash: u64,
}

/// A linked assembly blob.
///
/// The executing interpreter copies these bytes into its own immutable
/// buffer, so an `Assembly` can be reused and shared freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembly {
    content: Vec<u8>,
}

impl Assembly {
    /// Wraps a serialized assembly after validating magic and footer.
    /// Returns `None` when the bytes are not an assembly.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        serial::validate_header(&bytes, ASSEMBLY_MAGIC).then_some(Self { content: bytes })
    }

    pub(crate) fn from_data(data: &AssemblyData) -> Self {
        Self {
            content: serial::write_assembly(&data.module, data.main, data.runtime_hash),
        }
    }

    /// Whether the container holds a well-formed assembly.
    pub fn is_valid(&self) -> bool {
        serial::validate_header(&self.content, ASSEMBLY_MAGIC)
    }

    /// Version stamped into the blob.
    pub fn version(&self) -> ToolchainVersion {
        serial::read_version(&self.content)
    }

    /// Whether the blob was produced by this build of the toolchain.
    pub fn is_compatible(&self) -> bool {
        self.version().is_compatible()
    }

    /// The serialized bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.content
    }

    /// Decodes the assembly tables, for the interpreter and the
    /// translators.
    pub fn data(&self) -> Result<AssemblyData, crate::RuntimeError> {
        self.decode().map_err(|_| crate::RuntimeError::InvalidAssembly)
    }

    pub(crate) fn decode(&self) -> Result<AssemblyData, CorruptBlob> {
        let (module, main, runtime_hash) = serial::read_assembly(&self.content)?;
        Ok(AssemblyData {
            module,
            main,
            runtime_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data = AssemblyData {
            module: ModuleData::new(),
            main: MethodId::INVALID,
            runtime_hash: 0x1234_5678_9ABC_DEF0,
        };
        let assembly = Assembly::from_data(&data);
        assert!(assembly.is_valid());
        assert!(assembly.is_compatible());
        let decoded = assembly.data().unwrap();
        assert_eq!(decoded.runtime_hash, data.runtime_hash);
        assert_eq!(decoded.main, MethodId::INVALID);
    }

    #[test]
    fn intermediate_bytes_are_not_an_assembly() {
        let bytes = serial::write_intermediate(&ModuleData::new());
        assert!(Assembly::from_bytes(bytes).is_none());
    }
}
