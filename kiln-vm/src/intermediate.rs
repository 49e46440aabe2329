//! Serialized, still-mergeable module form.

use kiln_types::ToolchainVersion;

use crate::module::ModuleData;
use crate::serial::{self, CorruptBlob, INTERMEDIATE_MAGIC};

/// A serialized module: declarations and definitions with unresolved sizes,
/// suitable for merging and linking.
///
/// The byte layout is `[magic | version | payload | footer]`; see
/// [`crate::serial`]. An empty intermediate is the identity of merging.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Intermediate {
    content: Vec<u8>,
}

impl Intermediate {
    /// The empty intermediate.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wraps a serialized module after validating magic and footer. Returns
    /// `None` when the bytes are not an intermediate.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        serial::validate_header(&bytes, INTERMEDIATE_MAGIC).then_some(Self { content: bytes })
    }

    pub(crate) fn from_module(data: &ModuleData) -> Self {
        Self {
            content: serial::write_intermediate(data),
        }
    }

    /// Whether the container holds a well-formed intermediate.
    pub fn is_valid(&self) -> bool {
        serial::validate_header(&self.content, INTERMEDIATE_MAGIC)
    }

    /// Whether the container is the empty intermediate.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Version stamped into the blob, or the default for invalid content.
    pub fn version(&self) -> ToolchainVersion {
        if self.content.len() >= serial::PAYLOAD_OFFSET {
            serial::read_version(&self.content)
        } else {
            ToolchainVersion::default()
        }
    }

    /// Whether the blob was produced by this build of the toolchain.
    pub fn is_compatible(&self) -> bool {
        self.version().is_compatible()
    }

    /// The serialized bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.content
    }

    pub(crate) fn module_data(&self) -> Result<ModuleData, CorruptBlob> {
        serial::read_intermediate(&self.content)
    }

    /// Merges `other` into this intermediate; see [`crate::merger`].
    pub fn merge(&self, other: &Intermediate) -> Result<Intermediate, crate::MergeError> {
        crate::merger::merge(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_invalid_but_usable() {
        let empty = Intermediate::empty();
        assert!(empty.is_empty());
        assert!(!empty.is_valid());
    }

    #[test]
    fn from_bytes_checks_the_header() {
        assert!(Intermediate::from_bytes(b"garbage".to_vec()).is_none());
        let bytes = serial::write_intermediate(&ModuleData::new());
        let loaded = Intermediate::from_bytes(bytes).unwrap();
        assert!(loaded.is_valid());
        assert!(loaded.is_compatible());
    }
}
