//! Merging of two intermediates.
//!
//! The right-hand module is folded into the left-hand one through dense
//! remap tables, one per index space, initialized to the identity. Type and
//! method definitions merge under an at-most-one-body rule; generated types,
//! signatures and field offsets are re-deduplicated against the left side;
//! global data blocks are relocated; and every imported bytecode body is
//! walked once to translate its embedded call indices, global identifiers
//! and offset indices.

use kiln_asm::Opcode;
use kiln_types::{
    AddressHeader, AddressKind, AddressModifier, MetaId, MethodId, NameId, OffsetId, RawIndex,
    SignatureId, TypeId,
};
use tracing::debug_span;

use crate::database::Lookup;
use crate::error::MergeError;
use crate::module::{DataTable, ModuleData, TypeFlags};
use crate::Intermediate;

pub(crate) fn merge(lhs: &Intermediate, rhs: &Intermediate) -> Result<Intermediate, MergeError> {
    // The empty intermediate is the merge identity.
    if rhs.is_empty() {
        return Ok(lhs.clone());
    }
    if lhs.is_empty() {
        return Ok(rhs.clone());
    }
    for side in [lhs, rhs] {
        if !side.is_valid() {
            return Err(MergeError::InvalidIntermediate);
        }
        if !side.is_compatible() {
            return Err(MergeError::IncompatibleIntermediate);
        }
    }

    let span = debug_span!("merge");
    let _enter = span.enter();

    let dst = lhs
        .module_data()
        .map_err(|_| MergeError::InvalidIntermediate)?;
    let src = rhs
        .module_data()
        .map_err(|_| MergeError::InvalidIntermediate)?;

    let merged = Merger::new(dst, src).run()?;
    Ok(Intermediate::from_module(&merged))
}

struct Merger {
    dst: ModuleData,
    src: ModuleData,
    types: Vec<TypeId>,
    methods: Vec<MethodId>,
    signatures: Vec<SignatureId>,
    signature_merged: Vec<bool>,
    offsets: Vec<OffsetId>,
    names: Vec<NameId>,
    metas: Vec<MetaId>,
}

impl Merger {
    fn new(dst: ModuleData, src: ModuleData) -> Self {
        let types = (0..src.types.len() as RawIndex).map(TypeId::new).collect();
        let methods = (0..src.methods.len() as RawIndex).map(MethodId::new).collect();
        let signatures = (0..src.signatures.len() as RawIndex)
            .map(SignatureId::new)
            .collect();
        let signature_merged = vec![false; src.signatures.len()];
        let offsets = (0..src.offsets.len() as RawIndex).map(OffsetId::new).collect();
        Self {
            names: Vec::new(),
            metas: Vec::new(),
            types,
            methods,
            signatures,
            signature_merged,
            offsets,
            dst,
            src,
        }
    }

    fn run(mut self) -> Result<ModuleData, MergeError> {
        self.intern_names();
        self.intern_metas();
        self.merge_named_types()?;
        self.merge_generated_types()?;
        self.merge_remaining_signatures()?;
        self.merge_offsets()?;
        self.merge_data_tables()?;
        self.merge_methods()?;
        Ok(self.dst)
    }

    fn intern_names(&mut self) {
        self.names = Vec::with_capacity(self.src.names.len());
        for i in 0..self.src.names.len() {
            let id = NameId::new(i as RawIndex);
            let name = self.src.names.name(id);
            let translated = self.dst.names.intern(name);
            self.names.push(translated);
        }
    }

    fn intern_metas(&mut self) {
        self.metas = Vec::with_capacity(self.src.metas.len());
        for value in self.src.metas.iter().map(str::to_owned).collect::<Vec<_>>() {
            self.metas.push(self.dst.metas.intern(&value));
        }
    }

    fn rename(&self, name: &mut NameId) -> Result<(), MergeError> {
        let translated = *self
            .names
            .get(name.index())
            .ok_or(MergeError::IndexOutOfRange)?;
        *name = translated;
        Ok(())
    }

    fn translate_type(&self, ty: &mut TypeId) -> Result<(), MergeError> {
        let translated = *self
            .types
            .get(ty.index())
            .ok_or(MergeError::IndexOutOfRange)?;
        *ty = translated;
        Ok(())
    }

    fn translate_method(&self, method: &mut MethodId) -> Result<(), MergeError> {
        let translated = *self
            .methods
            .get(method.index())
            .ok_or(MergeError::IndexOutOfRange)?;
        *method = translated;
        Ok(())
    }

    fn translate_signature(&self, sig: &mut SignatureId) -> Result<(), MergeError> {
        let translated = *self
            .signatures
            .get(sig.index())
            .ok_or(MergeError::IndexOutOfRange)?;
        *sig = translated;
        Ok(())
    }

    fn translate_offset(&self, offset: &mut OffsetId) -> Result<(), MergeError> {
        let translated = *self
            .offsets
            .get(offset.index())
            .ok_or(MergeError::IndexOutOfRange)?;
        *offset = translated;
        Ok(())
    }

    fn translate_meta(&self, meta: &mut MetaId) -> Result<(), MergeError> {
        if !meta.is_valid() {
            return Ok(());
        }
        let translated = *self
            .metas
            .get(meta.index())
            .ok_or(MergeError::IndexOutOfRange)?;
        *meta = translated;
        Ok(())
    }

    fn merge_named_types(&mut self) -> Result<(), MergeError> {
        let mut adopted = Vec::new();
        let mut next_index = self.dst.types.len() as RawIndex;

        // Pass 1: resolve every named type to a destination index.
        for i in 0..self.src.types.len() {
            let src_ty = &self.src.types[i];
            if src_ty.is_base() || src_ty.is_generated() {
                continue;
            }
            let old_index = src_ty.index;
            let src_defined = src_ty.is_defined();
            let name = self.names[src_ty.name.index()];

            match self.dst.names.lookup(name) {
                Lookup::Type(existing) => {
                    let dst_ty = &self.dst.types[existing.index()];
                    if dst_ty.is_defined() && src_defined {
                        return Err(MergeError::TypeRedefinition {
                            name: self.dst.names.name(name).to_owned(),
                            lhs_meta: self.dst.type_meta(existing),
                            rhs_meta: self.src.type_meta(old_index),
                        });
                    }
                    let (index, name) = (existing, dst_ty.name);
                    let src_ty = &mut self.src.types[i];
                    src_ty.index = index;
                    src_ty.name = name;
                }
                Lookup::Identifier => {
                    let index = TypeId::new(next_index);
                    next_index += 1;
                    let src_ty = &mut self.src.types[i];
                    src_ty.index = index;
                    src_ty.name = name;
                    self.dst.names.bind(name, Lookup::Type(index));
                }
                _ => {
                    return Err(MergeError::IdentifierTypeMismatch {
                        name: self.dst.names.name(name).to_owned(),
                    })
                }
            }
            self.types[old_index.index()] = self.src.types[i].index;
        }

        // Pass 2: move bodies across, folding a definition into an existing
        // declaration when one side has the body.
        for i in 0..self.src.types.len() {
            let src_ty = &self.src.types[i];
            if src_ty.is_base() || src_ty.is_generated() {
                continue;
            }
            if src_ty.index.index() == self.dst.types.len() {
                let mut ty = self.src.types[i].clone();
                ty.pointer_type = TypeId::INVALID;
                ty.array_types.clear();
                self.translate_meta(&mut ty.meta.index)?;
                if ty.is_defined() {
                    adopted.push(ty.index);
                }
                self.dst.types.push(ty);
            } else {
                if src_ty.index.index() >= self.dst.types.len() {
                    return Err(MergeError::IndexOutOfRange);
                }
                let dst_defined = self.dst.types[src_ty.index.index()].is_defined();
                if !dst_defined && src_ty.is_defined() {
                    adopted.push(src_ty.index);
                    let src_ty = self.src.types[i].clone();
                    let mut meta = src_ty.meta;
                    self.translate_meta(&mut meta.index)?;
                    let dst_ty = &mut self.dst.types[src_ty.index.index()];
                    // Keep the pointer and array caches of the declaration.
                    dst_ty.fields = src_ty.fields;
                    dst_ty.flags |= src_ty.flags & (TypeFlags::DEFINED | TypeFlags::UNION);
                    dst_ty.meta = meta;
                }
            }
        }

        // Translate the adopted bodies into the destination index space.
        for index in adopted {
            let mut fields = core::mem::take(&mut self.dst.types[index.index()].fields);
            for field in &mut fields {
                self.rename(&mut field.name)?;
                self.translate_type(&mut field.ty)?;
            }
            self.dst.types[index.index()].fields = fields;
        }
        Ok(())
    }

    fn merge_signature_at(&mut self, index: SignatureId) -> Result<SignatureId, MergeError> {
        if self.signature_merged[index.index()] {
            return Ok(self.signatures[index.index()]);
        }
        let mut sig = self.src.signatures[index.index()].clone();
        self.translate_type(&mut sig.return_type)?;
        for param in &mut sig.parameters {
            self.translate_type(&mut param.ty)?;
        }
        sig.signature_type = TypeId::INVALID;

        let key = sig.key();
        let translated = match self.dst.signature_lookup.get(&key) {
            Some(&existing) => existing,
            None => {
                let new_index = SignatureId::new(self.dst.signatures.len() as RawIndex);
                sig.index = new_index;
                self.dst.signatures.push(sig);
                self.dst.signature_lookup.insert(key, new_index);
                new_index
            }
        };
        self.signatures[index.index()] = translated;
        self.signature_merged[index.index()] = true;
        Ok(translated)
    }

    fn merge_generated_types(&mut self) -> Result<(), MergeError> {
        use crate::module::Generated;

        let mut next_index = self.dst.types.len() as RawIndex;
        for i in 0..self.src.types.len() {
            let src_ty = &self.src.types[i];
            if src_ty.is_base() || !src_ty.is_generated() {
                continue;
            }
            let old_index = src_ty.index;
            match src_ty.generated.ok_or(MergeError::IndexOutOfRange)? {
                Generated::Pointer { mut pointee, .. } => {
                    self.translate_type(&mut pointee)?;
                    let cached = self.dst.types[pointee.index()].pointer_type;
                    if cached.is_valid() {
                        self.types[old_index.index()] = cached;
                    } else {
                        let index = TypeId::new(next_index);
                        next_index += 1;
                        let mut ty = self.src.types[i].clone();
                        ty.index = index;
                        ty.generated = Some(Generated::Pointer {
                            pointee,
                            pointee_size: 0,
                        });
                        ty.pointer_type = TypeId::INVALID;
                        ty.array_types.clear();
                        self.dst.types.push(ty);
                        self.dst.types[pointee.index()].pointer_type = index;
                        self.types[old_index.index()] = index;
                    }
                }
                Generated::Array { mut elem, len } => {
                    self.translate_type(&mut elem)?;
                    if let Some(&cached) = self.dst.types[elem.index()].array_types.get(&len) {
                        self.types[old_index.index()] = cached;
                    } else {
                        let index = TypeId::new(next_index);
                        next_index += 1;
                        let mut ty = self.src.types[i].clone();
                        ty.index = index;
                        ty.generated = Some(Generated::Array { elem, len });
                        ty.pointer_type = TypeId::INVALID;
                        ty.array_types.clear();
                        self.dst.types.push(ty);
                        self.dst.types[elem.index()].array_types.insert(len, index);
                        self.types[old_index.index()] = index;
                    }
                }
                Generated::Signature(sig) => {
                    let translated_sig = self.merge_signature_at(sig)?;
                    let cached = self.dst.signatures[translated_sig.index()].signature_type;
                    if cached.is_valid() {
                        self.types[old_index.index()] = cached;
                    } else {
                        let index = TypeId::new(next_index);
                        next_index += 1;
                        let mut ty = self.src.types[i].clone();
                        ty.index = index;
                        ty.generated = Some(Generated::Signature(translated_sig));
                        ty.pointer_type = TypeId::INVALID;
                        ty.array_types.clear();
                        self.dst.types.push(ty);
                        self.dst.signatures[translated_sig.index()].signature_type = index;
                        self.types[old_index.index()] = index;
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_remaining_signatures(&mut self) -> Result<(), MergeError> {
        for i in 0..self.src.signatures.len() {
            self.merge_signature_at(SignatureId::new(i as RawIndex))?;
        }
        Ok(())
    }

    fn merge_offsets(&mut self) -> Result<(), MergeError> {
        for i in 0..self.src.offsets.len() {
            let mut offset = self.src.offsets[i].clone();
            self.translate_type(&mut offset.address.root)?;
            for field in &mut offset.address.fields {
                self.rename(field)?;
            }
            let key = offset.address.key();
            let translated = match self.dst.offset_lookup.get(&key) {
                Some(&existing) => existing,
                None => {
                    let index = OffsetId::new(self.dst.offsets.len() as RawIndex);
                    self.dst.offsets.push(offset);
                    self.dst.offset_lookup.insert(key, index);
                    index
                }
            };
            self.offsets[i] = translated;
        }
        Ok(())
    }

    fn merge_data_table(&mut self, constant: bool) -> Result<(), MergeError> {
        let mut src_table = core::mem::take(if constant {
            &mut self.src.constants
        } else {
            &mut self.src.globals
        });
        let base_offset = if constant {
            self.dst.constants.data.len()
        } else {
            self.dst.globals.data.len()
        };

        for entry in &mut src_table.entries {
            let name = *self
                .names
                .get(entry.name.index())
                .ok_or(MergeError::IndexOutOfRange)?;
            match self.dst.names.lookup(name) {
                Lookup::Identifier => {}
                Lookup::Global(_) | Lookup::Constant(_) => {
                    return Err(MergeError::GlobalRedefinition {
                        name: self.dst.names.name(name).to_owned(),
                    })
                }
                _ => {
                    return Err(MergeError::IdentifierTypeMismatch {
                        name: self.dst.names.name(name).to_owned(),
                    })
                }
            }

            // Rename identifiers embedded in the initializer block.
            translate_initializer(&mut src_table.data, entry.offset, &self.names)?;

            entry.name = name;
            self.translate_type(&mut entry.ty)?;
            entry.offset += base_offset;

            let dst_table: &mut DataTable = if constant {
                &mut self.dst.constants
            } else {
                &mut self.dst.globals
            };
            let index = dst_table.entries.len() as RawIndex;
            dst_table.entries.push(*entry);
            self.dst.names.bind(
                name,
                if constant {
                    Lookup::Constant(index)
                } else {
                    Lookup::Global(index)
                },
            );
        }

        let dst_table: &mut DataTable = if constant {
            &mut self.dst.constants
        } else {
            &mut self.dst.globals
        };
        dst_table.data.extend_from_slice(&src_table.data);
        Ok(())
    }

    fn merge_data_tables(&mut self) -> Result<(), MergeError> {
        self.merge_data_table(false)?;
        self.merge_data_table(true)
    }

    fn merge_methods(&mut self) -> Result<(), MergeError> {
        let mut adopted = Vec::new();
        let mut next_index = self.dst.methods.len() as RawIndex;

        for i in 0..self.src.methods.len() {
            let src_method = &self.src.methods[i];
            let old_index = src_method.index;
            let src_defined = src_method.is_defined();
            let name = self.names[src_method.name.index()];

            match self.dst.names.lookup(name) {
                Lookup::Method(existing) => {
                    let dst_method = self.dst.method(existing);
                    if dst_method.is_defined() && src_defined {
                        return Err(MergeError::MethodRedefinition {
                            name: self.dst.names.name(name).to_owned(),
                            lhs_meta: self.dst.method_meta(existing),
                            rhs_meta: self.src.method_meta(old_index),
                        });
                    }
                    let name = dst_method.name;
                    let src_method = &mut self.src.methods[i];
                    src_method.index = existing;
                    src_method.name = name;
                }
                Lookup::Identifier => {
                    let index = MethodId::new(next_index);
                    next_index += 1;
                    let src_method = &mut self.src.methods[i];
                    src_method.index = index;
                    src_method.name = name;
                    self.dst.names.bind(name, Lookup::Method(index));
                }
                _ => {
                    return Err(MergeError::IdentifierTypeMismatch {
                        name: self.dst.names.name(name).to_owned(),
                    })
                }
            }
            self.methods[old_index.index()] = self.src.methods[i].index;
        }

        for i in 0..self.src.methods.len() {
            let src_method = &self.src.methods[i];
            if src_method.index.index() == self.dst.methods.len() {
                if src_method.is_defined() {
                    adopted.push(src_method.index);
                }
                let mut method = self.src.methods[i].clone();
                self.translate_meta(&mut method.meta.index)?;
                self.dst.methods.push(method);
            } else {
                if src_method.index.index() >= self.dst.methods.len() {
                    return Err(MergeError::IndexOutOfRange);
                }
                let dst_defined = self.dst.methods[src_method.index.index()].is_defined();
                if !dst_defined && src_method.is_defined() {
                    adopted.push(src_method.index);
                    let mut method = self.src.methods[i].clone();
                    self.translate_meta(&mut method.meta.index)?;
                    self.dst.methods[src_method.index.index()] = method;
                }
            }
        }

        for index in adopted {
            let placeholder = crate::module::MethodDef::declared(NameId::INVALID, MethodId::INVALID);
            let mut method = core::mem::replace(&mut self.dst.methods[index.index()], placeholder);
            for var in &mut method.stackvars {
                self.translate_type(&mut var.ty)?;
            }
            for call in &mut method.calls {
                self.translate_method(call)?;
            }
            self.translate_signature(&mut method.signature)?;
            if !method.is_external() {
                self.translate_bytecode(&mut method.bytecode)?;
            }
            self.dst.methods[index.index()] = method;
        }
        Ok(())
    }

    /// Walks one imported body, translating every embedded method-call
    /// index, global identifier and offset index in place.
    fn translate_bytecode(&self, code: &mut [u8]) -> Result<(), MergeError> {
        let mut pos = 0;
        while pos < code.len() {
            let op = Opcode::from_u8(code[pos]).ok_or(MergeError::InvalidIntermediate)?;
            pos += 1;
            match op {
                Opcode::Noop | Opcode::Ret => {}
                Opcode::Set
                | Opcode::Conv
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Add
                | Opcode::Sub
                | Opcode::Lsh
                | Opcode::Rsh
                | Opcode::And
                | Opcode::Xor
                | Opcode::Or
                | Opcode::Padd
                | Opcode::Psub
                | Opcode::Cmp
                | Opcode::Ceq
                | Opcode::Cne
                | Opcode::Cgt
                | Opcode::Cge
                | Opcode::Clt
                | Opcode::Cle => {
                    pos += 1;
                    pos = self.translate_address(code, pos)?;
                    pos = self.translate_address(code, pos)?;
                }
                Opcode::Not | Opcode::Neg | Opcode::Cze | Opcode::Cnz | Opcode::Retv => {
                    pos += 1;
                    pos = self.translate_address(code, pos)?;
                }
                Opcode::Pdif => {
                    pos = self.translate_address(code, pos)?;
                    pos = self.translate_address(code, pos)?;
                }
                Opcode::Dump => {
                    pos = self.translate_address(code, pos)?;
                }
                Opcode::Br => {
                    pos += 4;
                }
                Opcode::Beq
                | Opcode::Bne
                | Opcode::Bgt
                | Opcode::Bge
                | Opcode::Blt
                | Opcode::Ble => {
                    pos += 5;
                    pos = self.translate_address(code, pos)?;
                    pos = self.translate_address(code, pos)?;
                }
                Opcode::Bze | Opcode::Bnz => {
                    pos += 5;
                    pos = self.translate_address(code, pos)?;
                }
                Opcode::Sw => {
                    pos = self.translate_address(code, pos)?;
                    let count =
                        kiln_types::bytes::read_u32(code.get(pos..).ok_or(MergeError::IndexOutOfRange)?);
                    pos += 4 + count as usize * 4;
                }
                Opcode::Call => {
                    let slice = code.get_mut(pos..).ok_or(MergeError::IndexOutOfRange)?;
                    let mut method = MethodId::new(kiln_types::bytes::read_u32(slice));
                    self.translate_method(&mut method)?;
                    kiln_types::bytes::write_u32(slice, method.raw());
                    pos += 4;
                    let argc = *code.get(pos).ok_or(MergeError::IndexOutOfRange)? as usize;
                    pos += 1;
                    for _ in 0..argc {
                        pos += 1;
                        pos = self.translate_address(code, pos)?;
                    }
                }
                Opcode::Callv => {
                    pos = self.translate_address(code, pos)?;
                    let argc = *code.get(pos).ok_or(MergeError::IndexOutOfRange)? as usize;
                    pos += 1;
                    for _ in 0..argc {
                        pos += 1;
                        pos = self.translate_address(code, pos)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn translate_address(&self, code: &mut [u8], pos: usize) -> Result<usize, MergeError> {
        let slice = code.get_mut(pos..).ok_or(MergeError::IndexOutOfRange)?;
        if slice.len() < 4 {
            return Err(MergeError::IndexOutOfRange);
        }
        let mut header = AddressHeader::from_bits(kiln_types::bytes::read_u32(slice));

        if header.kind() == AddressKind::Constant {
            // Header + inline literal bytes of the base type.
            let ty = TypeId::new(header.index());
            return Ok(pos + 4 + ty.base_size());
        }

        if header.kind() == AddressKind::Global {
            let mut name = NameId::new(header.index());
            self.rename(&mut name)?;
            if name.raw() >= AddressHeader::INDEX_MAX {
                return Err(MergeError::IndexOutOfRange);
            }
            header.set_index(name.raw());
            kiln_types::bytes::write_u32(slice, header.bits());
        }

        match header.modifier() {
            AddressModifier::DirectField | AddressModifier::IndirectField => {
                let payload = slice.get_mut(4..).ok_or(MergeError::IndexOutOfRange)?;
                if payload.len() < 8 {
                    return Err(MergeError::IndexOutOfRange);
                }
                let mut offset = OffsetId::new(kiln_types::bytes::read_u64(payload) as RawIndex);
                self.translate_offset(&mut offset)?;
                kiln_types::bytes::write_u64(payload, offset.raw() as u64);
            }
            AddressModifier::None | AddressModifier::Subscript => {}
        }
        Ok(pos + 12)
    }
}

fn translate_initializer(
    data: &mut [u8],
    offset: usize,
    names: &[NameId],
) -> Result<(), MergeError> {
    let mut pos = offset;
    let count = kiln_types::bytes::read_u16(data.get(pos..).ok_or(MergeError::IndexOutOfRange)?);
    pos += 2;
    for _ in 0..count {
        let tag = TypeId::new(*data.get(pos).ok_or(MergeError::IndexOutOfRange)? as u32);
        pos += 1;
        if tag == TypeId::VOID {
            let slice = data.get_mut(pos..).ok_or(MergeError::IndexOutOfRange)?;
            if slice.len() < 4 {
                return Err(MergeError::IndexOutOfRange);
            }
            let name = NameId::new(kiln_types::bytes::read_u32(slice));
            if name.is_valid() {
                let translated = *names.get(name.index()).ok_or(MergeError::IndexOutOfRange)?;
                kiln_types::bytes::write_u32(slice, translated.raw());
            }
            pos += 4;
        } else {
            pos += tag.base_size();
        }
    }
    Ok(())
}
