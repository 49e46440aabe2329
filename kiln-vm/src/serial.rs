//! Binary serialization of modules and assemblies.
//!
//! Both serialized forms share the same wrapping:
//!
//! ```text
//! [ magic:4 | version:8 | payload | footer magic:4 ]
//! ```
//!
//! The payload begins with a table of contents of `(offset, len)` pairs,
//! relative to the payload start, one per section; nothing in the blob is an
//! absolute pointer, so the whole thing is relocatable in memory. Sections
//! hold their tables as length-prefixed little-endian records.

use kiln_asm::Writer;
use kiln_types::{MetaId, MethodId, NameId, SignatureId, ToolchainVersion, TypeId};

use crate::database::{Lookup, MetaTable, NameTable};
use crate::module::{
    DataTable, Field, FieldAddress, FieldOffset, Generated, Meta, MethodDef, MethodFlags,
    ModuleData, SignatureDef, StackVar, TypeDef, TypeFlags,
};

/// Magic of a serialized intermediate.
pub const INTERMEDIATE_MAGIC: [u8; 4] = *b"KIMD";
/// Magic of a serialized assembly.
pub const ASSEMBLY_MAGIC: [u8; 4] = *b"KASM";
/// Trailing magic of both forms.
pub const FOOTER_MAGIC: [u8; 4] = *b"KEND";

/// Byte offset of the payload behind magic and version.
pub const PAYLOAD_OFFSET: usize = 4 + ToolchainVersion::LEN;

const MODULE_SECTIONS: usize = 8;

/// The blob is structurally broken; loaders surface this as the invalid
/// intermediate/assembly error of their phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptBlob;

type ReadResult<T> = Result<T, CorruptBlob>;

/// Validates magic, version length and footer of a serialized blob.
pub fn validate_header(bytes: &[u8], magic: [u8; 4]) -> bool {
    bytes.len() >= PAYLOAD_OFFSET + FOOTER_MAGIC.len()
        && bytes[..4] == magic
        && bytes[bytes.len() - 4..] == FOOTER_MAGIC
}

/// Reads the version word of a validated blob.
pub fn read_version(bytes: &[u8]) -> ToolchainVersion {
    let mut buf = [0u8; ToolchainVersion::LEN];
    buf.copy_from_slice(&bytes[4..PAYLOAD_OFFSET]);
    ToolchainVersion::from_bytes(buf)
}

/// Bounds-checked little-endian reader over untrusted bytes.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> ReadResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CorruptBlob)?;
        let slice = self.bytes.get(self.pos..end).ok_or(CorruptBlob)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> ReadResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> ReadResult<u32> {
        Ok(kiln_types::bytes::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> ReadResult<u64> {
        Ok(kiln_types::bytes::read_u64(self.take(8)?))
    }

    fn size(&mut self) -> ReadResult<usize> {
        Ok(self.u64()? as usize)
    }

    fn count(&mut self) -> ReadResult<usize> {
        let count = self.u32()? as usize;
        // A count can never exceed the remaining bytes; rejects absurd
        // lengths before any allocation.
        if count > self.bytes.len() - self.pos {
            return Err(CorruptBlob);
        }
        Ok(count)
    }

    fn str(&mut self) -> ReadResult<&'a str> {
        let len = self.count()?;
        core::str::from_utf8(self.take(len)?).map_err(|_| CorruptBlob)
    }
}

fn write_str(w: &mut Writer, value: &str) {
    w.u32(value.len() as u32);
    w.bytes(value.as_bytes());
}

fn write_meta(w: &mut Writer, meta: Meta) {
    w.u32(meta.index.raw());
    w.u32(meta.line);
}

fn read_meta(r: &mut ByteReader<'_>) -> ReadResult<Meta> {
    Ok(Meta {
        index: MetaId::new(r.u32()?),
        line: r.u32()?,
    })
}

fn write_field(w: &mut Writer, field: &Field) {
    w.u32(field.name.raw());
    w.u32(field.ty.raw());
    w.u64(field.offset as u64);
}

fn read_field(r: &mut ByteReader<'_>) -> ReadResult<Field> {
    Ok(Field {
        name: NameId::new(r.u32()?),
        ty: TypeId::new(r.u32()?),
        offset: r.size()?,
    })
}

fn write_stackvar(w: &mut Writer, var: &StackVar) {
    w.u32(var.ty.raw());
    w.u64(var.offset as u64);
}

fn read_stackvar(r: &mut ByteReader<'_>) -> ReadResult<StackVar> {
    Ok(StackVar {
        ty: TypeId::new(r.u32()?),
        offset: r.size()?,
    })
}

fn write_types(w: &mut Writer, types: &[TypeDef]) {
    w.u32(types.len() as u32);
    for ty in types {
        w.u32(ty.name.raw());
        w.u32(ty.index.raw());
        w.u32(ty.flags.bits());
        match ty.generated {
            None => w.u8(0),
            Some(Generated::Pointer {
                pointee,
                pointee_size,
            }) => {
                w.u8(1);
                w.u32(pointee.raw());
                w.u64(pointee_size as u64);
            }
            Some(Generated::Array { elem, len }) => {
                w.u8(2);
                w.u32(elem.raw());
                w.u64(len as u64);
            }
            Some(Generated::Signature(sig)) => {
                w.u8(3);
                w.u32(sig.raw());
            }
        }
        w.u32(ty.fields.len() as u32);
        for field in &ty.fields {
            write_field(w, field);
        }
        w.u64(ty.total_size as u64);
        w.u32(ty.pointer_type.raw());
        write_meta(w, ty.meta);
    }
}

fn read_types(r: &mut ByteReader<'_>) -> ReadResult<Vec<TypeDef>> {
    let count = r.count()?;
    let mut types = Vec::with_capacity(count);
    for _ in 0..count {
        let name = NameId::new(r.u32()?);
        let index = TypeId::new(r.u32()?);
        let flags = TypeFlags::from_bits_retain(r.u32()?);
        let generated = match r.u8()? {
            0 => None,
            1 => Some(Generated::Pointer {
                pointee: TypeId::new(r.u32()?),
                pointee_size: r.size()?,
            }),
            2 => Some(Generated::Array {
                elem: TypeId::new(r.u32()?),
                len: r.size()?,
            }),
            3 => Some(Generated::Signature(SignatureId::new(r.u32()?))),
            _ => return Err(CorruptBlob),
        };
        let field_count = r.count()?;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(read_field(r)?);
        }
        let total_size = r.size()?;
        let pointer_type = TypeId::new(r.u32()?);
        let meta = read_meta(r)?;
        types.push(TypeDef {
            name,
            index,
            flags,
            generated,
            fields,
            total_size,
            pointer_type,
            array_types: Default::default(),
            meta,
        });
    }
    Ok(types)
}

fn write_methods(w: &mut Writer, methods: &[MethodDef]) {
    w.u32(methods.len() as u32);
    for method in methods {
        w.u32(method.name.raw());
        w.u32(method.index.raw());
        w.u32(method.flags.bits());
        w.u32(method.signature.raw());
        w.u32(method.bytecode.len() as u32);
        w.bytes(&method.bytecode);
        w.u32(method.labels.len() as u32);
        for &label in &method.labels {
            w.u32(label);
        }
        w.u32(method.stackvars.len() as u32);
        for var in &method.stackvars {
            write_stackvar(w, var);
        }
        w.u64(method.stack_size as u64);
        w.u32(method.calls.len() as u32);
        for &call in &method.calls {
            w.u32(call.raw());
        }
        write_meta(w, method.meta);
    }
}

fn read_methods(r: &mut ByteReader<'_>) -> ReadResult<Vec<MethodDef>> {
    let count = r.count()?;
    let mut methods = Vec::with_capacity(count);
    for _ in 0..count {
        let name = NameId::new(r.u32()?);
        let index = MethodId::new(r.u32()?);
        let flags = MethodFlags::from_bits_retain(r.u32()?);
        let signature = SignatureId::new(r.u32()?);
        let bytecode_len = r.count()?;
        let bytecode = r.take(bytecode_len)?.to_vec();
        let label_count = r.count()?;
        let mut labels = Vec::with_capacity(label_count);
        for _ in 0..label_count {
            labels.push(r.u32()?);
        }
        let stackvar_count = r.count()?;
        let mut stackvars = Vec::with_capacity(stackvar_count);
        for _ in 0..stackvar_count {
            stackvars.push(read_stackvar(r)?);
        }
        let stack_size = r.size()?;
        let call_count = r.count()?;
        let mut calls = Vec::with_capacity(call_count);
        for _ in 0..call_count {
            calls.push(MethodId::new(r.u32()?));
        }
        let meta = read_meta(r)?;
        methods.push(MethodDef {
            name,
            index,
            flags,
            signature,
            bytecode,
            labels,
            stackvars,
            stack_size,
            calls,
            meta,
        });
    }
    Ok(methods)
}

fn write_signatures(w: &mut Writer, signatures: &[SignatureDef]) {
    w.u32(signatures.len() as u32);
    for sig in signatures {
        w.u32(sig.index.raw());
        w.u32(sig.return_type.raw());
        w.u32(sig.parameters.len() as u32);
        for param in &sig.parameters {
            write_stackvar(w, param);
        }
        w.u64(sig.parameters_size as u64);
    }
}

fn read_signatures(r: &mut ByteReader<'_>) -> ReadResult<Vec<SignatureDef>> {
    let count = r.count()?;
    let mut signatures = Vec::with_capacity(count);
    for _ in 0..count {
        let index = SignatureId::new(r.u32()?);
        let return_type = TypeId::new(r.u32()?);
        let param_count = r.count()?;
        let mut parameters = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            parameters.push(read_stackvar(r)?);
        }
        let parameters_size = r.size()?;
        signatures.push(SignatureDef {
            index,
            return_type,
            parameters,
            parameters_size,
            signature_type: TypeId::INVALID,
        });
    }
    Ok(signatures)
}

fn write_offsets(w: &mut Writer, offsets: &[FieldOffset]) {
    w.u32(offsets.len() as u32);
    for offset in offsets {
        w.u32(offset.address.root.raw());
        w.u32(offset.address.fields.len() as u32);
        for &field in &offset.address.fields {
            w.u32(field.raw());
        }
        w.u32(offset.ty.raw());
        w.u64(offset.offset as u64);
    }
}

fn read_offsets(r: &mut ByteReader<'_>) -> ReadResult<Vec<FieldOffset>> {
    let count = r.count()?;
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..count {
        let root = TypeId::new(r.u32()?);
        let field_count = r.count()?;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(NameId::new(r.u32()?));
        }
        let ty = TypeId::new(r.u32()?);
        let offset = r.size()?;
        offsets.push(FieldOffset {
            address: FieldAddress { root, fields },
            ty,
            offset,
        });
    }
    Ok(offsets)
}

fn write_data_table(w: &mut Writer, table: &DataTable) {
    w.u32(table.entries.len() as u32);
    for entry in &table.entries {
        write_field(w, entry);
    }
    w.u32(table.data.len() as u32);
    w.bytes(&table.data);
}

fn read_data_table(r: &mut ByteReader<'_>) -> ReadResult<DataTable> {
    let entry_count = r.count()?;
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        entries.push(read_field(r)?);
    }
    let data_len = r.count()?;
    let data = r.take(data_len)?.to_vec();
    Ok(DataTable { entries, data })
}

fn write_names(w: &mut Writer, names: &NameTable) {
    w.u32(names.len() as u32);
    for (id, name) in names.iter() {
        write_str(w, name);
        match names.lookup(id) {
            Lookup::Type(ty) => {
                w.u8(0);
                w.u32(ty.raw());
            }
            Lookup::Method(method) => {
                w.u8(1);
                w.u32(method.raw());
            }
            Lookup::Global(index) => {
                w.u8(2);
                w.u32(index);
            }
            Lookup::Constant(index) => {
                w.u8(3);
                w.u32(index);
            }
            Lookup::Identifier => {
                w.u8(4);
                w.u32(kiln_types::INVALID_INDEX);
            }
        }
    }
}

fn read_names(r: &mut ByteReader<'_>) -> ReadResult<NameTable> {
    let count = r.count()?;
    let mut names = NameTable::new();
    for _ in 0..count {
        let name = r.str()?;
        let tag = r.u8()?;
        let index = r.u32()?;
        let lookup = match tag {
            0 => Lookup::Type(TypeId::new(index)),
            1 => Lookup::Method(MethodId::new(index)),
            2 => Lookup::Global(index),
            3 => Lookup::Constant(index),
            4 => Lookup::Identifier,
            _ => return Err(CorruptBlob),
        };
        names.intern_with(name, lookup);
    }
    Ok(names)
}

fn write_metas(w: &mut Writer, metas: &MetaTable) {
    w.u32(metas.len() as u32);
    for value in metas.iter() {
        write_str(w, value);
    }
}

fn read_metas(r: &mut ByteReader<'_>) -> ReadResult<MetaTable> {
    let count = r.count()?;
    let mut metas = MetaTable::new();
    for _ in 0..count {
        let value = r.str()?;
        metas.intern(value);
    }
    Ok(metas)
}

fn module_sections(data: &ModuleData) -> [Vec<u8>; MODULE_SECTIONS] {
    let mut sections: [Vec<u8>; MODULE_SECTIONS] = Default::default();
    let mut w = Writer::new();
    write_types(&mut w, &data.types);
    sections[0] = core::mem::take(&mut w).into_bytes();
    write_methods(&mut w, &data.methods);
    sections[1] = core::mem::take(&mut w).into_bytes();
    write_signatures(&mut w, &data.signatures);
    sections[2] = core::mem::take(&mut w).into_bytes();
    write_offsets(&mut w, &data.offsets);
    sections[3] = core::mem::take(&mut w).into_bytes();
    write_data_table(&mut w, &data.globals);
    sections[4] = core::mem::take(&mut w).into_bytes();
    write_data_table(&mut w, &data.constants);
    sections[5] = core::mem::take(&mut w).into_bytes();
    write_names(&mut w, &data.names);
    sections[6] = core::mem::take(&mut w).into_bytes();
    write_metas(&mut w, &data.metas);
    sections[7] = core::mem::take(&mut w).into_bytes();
    sections
}

fn write_blob(magic: [u8; 4], sections: &[Vec<u8>], trailer: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.bytes(&magic);
    w.bytes(&ToolchainVersion::current().to_bytes());

    // Table of contents: (offset, len) pairs relative to the payload start.
    let toc_len = sections.len() * 8 + trailer.len();
    let mut offset = toc_len;
    for section in sections {
        w.u32(offset as u32);
        w.u32(section.len() as u32);
        offset += section.len();
    }
    w.bytes(trailer);
    for section in sections {
        w.bytes(section);
    }
    w.bytes(&FOOTER_MAGIC);
    w.into_bytes()
}

fn payload(bytes: &[u8]) -> &[u8] {
    &bytes[PAYLOAD_OFFSET..bytes.len() - FOOTER_MAGIC.len()]
}

fn read_module_payload(
    payload: &[u8],
    toc_extra: usize,
) -> ReadResult<(ModuleData, ByteReader<'_>)> {
    let mut toc = ByteReader::new(payload);
    let mut readers = Vec::with_capacity(MODULE_SECTIONS);
    for _ in 0..MODULE_SECTIONS {
        let offset = toc.u32()? as usize;
        let len = toc.u32()? as usize;
        let end = offset.checked_add(len).ok_or(CorruptBlob)?;
        let section = payload.get(offset..end).ok_or(CorruptBlob)?;
        readers.push(ByteReader::new(section));
    }
    let trailer_start = MODULE_SECTIONS * 8;
    let trailer = payload
        .get(trailer_start..trailer_start + toc_extra)
        .ok_or(CorruptBlob)?;

    let mut iter = readers.into_iter();
    let mut next = move || iter.next().expect("section count is fixed");
    let mut data = ModuleData {
        types: read_types(&mut next())?,
        methods: read_methods(&mut next())?,
        signatures: read_signatures(&mut next())?,
        offsets: read_offsets(&mut next())?,
        globals: read_data_table(&mut next())?,
        constants: read_data_table(&mut next())?,
        names: read_names(&mut next())?,
        metas: read_metas(&mut next())?,
        signature_lookup: Default::default(),
        offset_lookup: Default::default(),
    };
    data.restore_lookup_tables();
    data.restore_generated_types();
    Ok((data, ByteReader::new(trailer)))
}

/// Serializes a module into intermediate form.
pub fn write_intermediate(data: &ModuleData) -> Vec<u8> {
    let sections = module_sections(data);
    write_blob(INTERMEDIATE_MAGIC, &sections, &[])
}

/// Deserializes an intermediate blob. The header must have been validated.
pub fn read_intermediate(bytes: &[u8]) -> ReadResult<ModuleData> {
    let (data, _) = read_module_payload(payload(bytes), 0)?;
    Ok(data)
}

/// Serializes a linked module with its entry point and runtime hash into
/// assembly form.
pub fn write_assembly(data: &ModuleData, main: MethodId, runtime_hash: u64) -> Vec<u8> {
    let sections = module_sections(data);
    let mut trailer = Writer::new();
    trailer.u32(main.raw());
    trailer.u64(runtime_hash);
    write_blob(ASSEMBLY_MAGIC, &sections, trailer.as_slice())
}

/// Deserializes an assembly blob. The header must have been validated.
pub fn read_assembly(bytes: &[u8]) -> ReadResult<(ModuleData, MethodId, u64)> {
    let (data, mut trailer) = read_module_payload(payload(bytes), 12)?;
    let main = MethodId::new(trailer.u32()?);
    let runtime_hash = trailer.u64()?;
    Ok((data, main, runtime_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleData;

    #[test]
    fn header_validation() {
        let data = ModuleData::new();
        let bytes = write_intermediate(&data);
        assert!(validate_header(&bytes, INTERMEDIATE_MAGIC));
        assert!(!validate_header(&bytes, ASSEMBLY_MAGIC));
        assert!(read_version(&bytes).is_compatible());

        let mut truncated = bytes.clone();
        truncated.pop();
        assert!(!validate_header(&truncated, INTERMEDIATE_MAGIC));

        let mut bad_footer = bytes;
        let len = bad_footer.len();
        bad_footer[len - 1] ^= 0xFF;
        assert!(!validate_header(&bad_footer, INTERMEDIATE_MAGIC));
    }

    #[test]
    fn module_round_trip() {
        let mut data = ModuleData::new();
        let ptr = data.pointer_to(kiln_types::TypeId::I32);
        let sig = data.make_signature(
            kiln_types::TypeId::I32,
            vec![StackVar::new(kiln_types::TypeId::I32)],
        );
        data.signature_type_of(sig);

        let bytes = write_intermediate(&data);
        let restored = read_intermediate(&bytes).unwrap();
        assert_eq!(restored.types.len(), data.types.len());
        assert_eq!(restored.signatures.len(), data.signatures.len());
        // Caches rebuilt on load.
        assert_eq!(restored.types[kiln_types::TypeId::I32.index()].pointer_type, ptr);
        assert!(restored.signatures[sig.index()].signature_type.is_valid());
    }

    #[test]
    fn serialization_is_deterministic() {
        let mut data = ModuleData::new();
        data.pointer_to(kiln_types::TypeId::F64);
        let a = write_intermediate(&data);
        let b = write_intermediate(&data);
        assert_eq!(a, b);
    }

    #[test]
    fn corrupt_payload_is_rejected() {
        let data = ModuleData::new();
        let mut bytes = write_intermediate(&data);
        // Break a section offset inside the table of contents.
        bytes[PAYLOAD_OFFSET] = 0xFF;
        bytes[PAYLOAD_OFFSET + 1] = 0xFF;
        assert!(read_intermediate(&bytes).is_err());
    }
}
