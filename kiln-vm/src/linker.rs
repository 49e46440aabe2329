//! Resolution of a merged intermediate into an executable assembly.
//!
//! Stages run in a fixed order: external binding, type resolution (with
//! cycle detection), signature layout, field-offset resolution, data table
//! layout, and a per-method pass that assigns stack offsets, type-checks
//! every instruction against the declarative subcode tables, selects the
//! final subcodes, and rewrites global-name operands into resolved data
//! table indices.

use kiln_asm::{
    compare_subcode, conv_subcode, implicit_subcode, integral_subcode, neg_subcode, not_subcode,
    pointer_offset_subcode, test_subcode, Opcode, Subcode, SET_COPY_SUBCODE,
};
use kiln_types::{
    AddressHeader, AddressKind, AddressModifier, AddressPrefix, GlobalId, MethodId, NameId,
    OffsetId, RawIndex, SourceMeta, TypeId, WORD_SIZE,
};
use tracing::{debug, debug_span};

use crate::assembly::{Assembly, AssemblyData};
use crate::database::Lookup;
use crate::error::LinkError;
use crate::module::{DataTable, Generated, MethodFlags, ModuleData, TypeFlags};
use crate::runtime::{NativeDecl, Runtime};
use crate::Intermediate;

/// Links `intermediate` against `runtime`, producing an executable
/// assembly.
pub fn link(intermediate: &Intermediate, runtime: &Runtime) -> Result<Assembly, LinkError> {
    if !intermediate.is_valid() {
        return Err(LinkError::InvalidIntermediate);
    }
    if !intermediate.is_compatible() {
        return Err(LinkError::IncompatibleIntermediate);
    }
    let span = debug_span!("link");
    let _enter = span.enter();

    let data = intermediate
        .module_data()
        .map_err(|_| LinkError::InvalidIntermediate)?;

    let mut linker = Linker {
        data,
        runtime,
        runtime_hash: runtime.hash(),
    };
    linker.bind_externals()?;
    linker.resolve_types()?;
    linker.resolve_signatures();
    linker.resolve_offsets()?;
    linker.layout_data_tables()?;
    linker.resolve_methods()?;

    let main = match linker.data.names.find("main") {
        Some(id) => match linker.data.names.lookup(id) {
            Lookup::Method(method) if linker.data.methods[method.index()].is_defined() => method,
            _ => MethodId::INVALID,
        },
        None => MethodId::INVALID,
    };

    debug!(
        types = linker.data.types.len(),
        methods = linker.data.methods.len(),
        main = ?main,
        "link complete"
    );
    Ok(Assembly::from_data(&AssemblyData {
        module: linker.data,
        main,
        runtime_hash: linker.runtime_hash,
    }))
}

struct Linker<'r> {
    data: ModuleData,
    runtime: &'r Runtime,
    runtime_hash: u64,
}

impl Linker<'_> {
    fn type_error_name(&self, id: TypeId) -> String {
        self.data.type_name(id)
    }

    fn native_type(&mut self, decl: &NativeDecl) -> TypeId {
        let mut ty = decl.base;
        for _ in 0..decl.indirection {
            ty = self.data.pointer_to(ty);
        }
        ty
    }

    /// Binds declared-but-undefined methods against the runtime surface.
    fn bind_externals(&mut self) -> Result<(), LinkError> {
        for i in 0..self.data.methods.len() {
            if self.data.methods[i].is_defined() {
                continue;
            }
            let name = self.data.names.name(self.data.methods[i].name).to_owned();
            let Some((lib, call, info)) = self.runtime.find_call(&name) else {
                continue;
            };
            let return_decl = info.return_type;
            let param_decls = info.parameters.clone();

            let return_type = self.native_type(&return_decl);
            let params = param_decls
                .iter()
                .map(|decl| self.native_type(decl))
                .map(crate::module::StackVar::new)
                .collect();
            let signature = self.data.make_signature(return_type, params);

            let method = &mut self.data.methods[i];
            method.flags |= MethodFlags::DEFINED | MethodFlags::EXTERNAL;
            method.signature = signature;
            let mut w = kiln_asm::Writer::new();
            w.u32(lib);
            w.u32(call);
            method.bytecode = w.into_bytes();
            debug!(method = %name, lib, call, "bound external method");
        }
        Ok(())
    }

    /// Resolves sizes and field offsets of every type. Pointer edges do not
    /// recurse, which is what permits `struct S { S* next; }`.
    fn resolve_types(&mut self) -> Result<(), LinkError> {
        for i in 0..self.data.types.len() {
            self.resolve_type(TypeId::new(i as RawIndex))?;
        }
        // Pointer sizes become available only once every pointee is
        // resolved.
        for i in 0..self.data.types.len() {
            if let Some(Generated::Pointer { pointee, .. }) = self.data.types[i].generated {
                let size = self.data.types[pointee.index()].total_size;
                if let Some(Generated::Pointer { pointee_size, .. }) =
                    &mut self.data.types[i].generated
                {
                    *pointee_size = size;
                }
            }
        }
        Ok(())
    }

    fn resolve_type(&mut self, id: TypeId) -> Result<(), LinkError> {
        let ty = &self.data.types[id.index()];
        if ty.is_resolved() {
            return Ok(());
        }
        if ty.flags.contains(TypeFlags::RESOLVING) {
            return Err(LinkError::RecursiveTypeDefinition {
                name: self.type_error_name(id),
                meta: self.data.type_meta(id),
            });
        }
        if !ty.is_defined() {
            return Err(LinkError::UndefinedType {
                name: self.type_error_name(id),
                meta: self.data.type_meta(id),
            });
        }
        self.data.types[id.index()].flags |= TypeFlags::RESOLVING;

        let total_size = match self.data.types[id.index()].generated {
            Some(Generated::Pointer { .. }) | Some(Generated::Signature(_)) => WORD_SIZE,
            Some(Generated::Array { elem, len }) => {
                self.resolve_type(elem)?;
                let elem_size = self.data.types[elem.index()].total_size;
                if elem_size == 0 {
                    return Err(LinkError::TypeSizeZero {
                        name: self.type_error_name(elem),
                        meta: self.data.type_meta(elem),
                    });
                }
                elem_size * len
            }
            None => {
                let is_union = self.data.types[id.index()].is_union();
                let field_count = self.data.types[id.index()].fields.len();
                let mut size = 0usize;
                for f in 0..field_count {
                    let field_ty = self.data.types[id.index()].fields[f].ty;
                    self.resolve_type(field_ty)?;
                    let field_size = self.data.types[field_ty.index()].total_size;
                    let field = &mut self.data.types[id.index()].fields[f];
                    if is_union {
                        field.offset = 0;
                        size = size.max(field_size);
                    } else {
                        field.offset = size;
                        size += field_size;
                    }
                }
                if size == 0 {
                    return Err(LinkError::TypeSizeZero {
                        name: self.type_error_name(id),
                        meta: self.data.type_meta(id),
                    });
                }
                size
            }
        };

        let ty = &mut self.data.types[id.index()];
        ty.total_size = total_size;
        ty.flags.remove(TypeFlags::RESOLVING);
        ty.flags |= TypeFlags::RESOLVED;
        Ok(())
    }

    /// Assigns packed parameter offsets and total sizes.
    fn resolve_signatures(&mut self) {
        for i in 0..self.data.signatures.len() {
            let param_count = self.data.signatures[i].parameters.len();
            let mut offset = 0usize;
            for p in 0..param_count {
                let ty = self.data.signatures[i].parameters[p].ty;
                let size = self.data.types[ty.index()].total_size;
                self.data.signatures[i].parameters[p].offset = offset;
                offset += size;
            }
            self.data.signatures[i].parameters_size = offset;
        }
    }

    /// Resolves each field-name chain to a resulting type and byte offset.
    fn resolve_offsets(&mut self) -> Result<(), LinkError> {
        for i in 0..self.data.offsets.len() {
            let address = self.data.offsets[i].address.clone();
            let mut current = address.root;
            let mut offset = 0usize;
            for &field_name in &address.fields {
                let ty = &self.data.types[current.index()];
                let field = ty.fields.iter().find(|f| f.name == field_name).ok_or_else(
                    || LinkError::UndefinedTypeField {
                        type_name: self.type_error_name(current),
                        field: self.data.names.name_or(field_name, "<unknown>").to_owned(),
                    },
                )?;
                offset += field.offset;
                current = field.ty;
            }
            let entry = &mut self.data.offsets[i];
            entry.ty = current;
            entry.offset = offset;
        }
        Ok(())
    }

    /// Enumerates the scalar slots of a resolved type in initializer order.
    fn scalar_slots(&self, ty: TypeId, base: usize, out: &mut Vec<(TypeId, usize)>) {
        let def = &self.data.types[ty.index()];
        match def.generated {
            Some(Generated::Array { elem, len }) => {
                let elem_size = self.data.types[elem.index()].total_size;
                for i in 0..len {
                    self.scalar_slots(elem, base + i * elem_size, out);
                }
            }
            Some(Generated::Pointer { .. }) | Some(Generated::Signature(_)) => {
                out.push((ty, base));
            }
            None if def.is_base() => out.push((ty, base)),
            None => {
                for field in &def.fields {
                    self.scalar_slots(field.ty, base + field.offset, out);
                }
            }
        }
    }

    fn layout_data_tables(&mut self) -> Result<(), LinkError> {
        let globals = core::mem::take(&mut self.data.globals);
        self.data.globals = self.layout_data_table(globals)?;
        let constants = core::mem::take(&mut self.data.constants);
        self.data.constants = self.layout_data_table(constants)?;
        Ok(())
    }

    /// Replaces the encoded initializer stream of a data table with the
    /// final laid-out value block. Method-pointer initializers become
    /// `method XOR runtime_hash`, so a null handle can only ever be zero and
    /// stray reinterpretation against another surface is improbable.
    fn layout_data_table(&mut self, table: DataTable) -> Result<DataTable, LinkError> {
        let mut out = DataTable::default();
        for entry in &table.entries {
            let name = self.data.names.name(entry.name).to_owned();
            let size = self.data.types[entry.ty.index()].total_size;
            let out_offset = out.data.len();
            out.data.resize(out_offset + size, 0);

            let mut slots = Vec::new();
            self.scalar_slots(entry.ty, out_offset, &mut slots);
            let mut next_slot = 0usize;

            let mut reader = kiln_asm::Reader::new(&table.data);
            reader.jump(entry.offset);
            let count = reader.u16() as usize;
            for _ in 0..count {
                let (slot_ty, slot_offset) = *slots.get(next_slot).ok_or_else(|| {
                    LinkError::GlobalInitializerOverflow { name: name.clone() }
                })?;
                next_slot += 1;
                let slot_def = &self.data.types[slot_ty.index()];
                let slot_is_signature = slot_def.is_signature();
                let slot_size = slot_def.total_size;

                let tag = TypeId::new(reader.u8() as u32);
                if tag == TypeId::VOID {
                    // Method-pointer initializer by name.
                    let method_name = NameId::new(reader.u32());
                    if !slot_is_signature {
                        return Err(LinkError::InvalidMethodInitializer { name: name.clone() });
                    }
                    let handle = if method_name.is_valid() {
                        let method = match self
                            .data
                            .names
                            .is_valid(method_name)
                            .then(|| self.data.names.lookup(method_name))
                        {
                            Some(Lookup::Method(method)) => method,
                            _ => {
                                return Err(LinkError::UndefinedMethodInitializer {
                                    name: name.clone(),
                                    method: self
                                        .data
                                        .names
                                        .name_or(method_name, "<unknown>")
                                        .to_owned(),
                                })
                            }
                        };
                        if !self.data.methods[method.index()].is_defined() {
                            return Err(LinkError::UndefinedMethodInitializer {
                                name: name.clone(),
                                method: self.data.names.name_or(method_name, "<unknown>").to_owned(),
                            });
                        }
                        let Some(Generated::Signature(slot_sig)) = slot_def.generated else {
                            return Err(LinkError::InvalidMethodInitializer { name: name.clone() });
                        };
                        if self.data.methods[method.index()].signature != slot_sig {
                            return Err(LinkError::InvalidMethodInitializer { name: name.clone() });
                        }
                        method.raw() as u64 ^ self.runtime_hash
                    } else {
                        0
                    };
                    kiln_types::bytes::write_u64(&mut out.data[slot_offset..], handle);
                } else {
                    let literal = reader.bytes(tag.base_size());
                    let slot_is_pointer = self.data.types[slot_ty.index()].is_pointer();
                    if slot_is_signature {
                        // Only `null` may initialize a method pointer from a
                        // literal.
                        if tag != TypeId::VPTR || literal.iter().any(|&b| b != 0) {
                            return Err(LinkError::InvalidMethodInitializer { name: name.clone() });
                        }
                        kiln_types::bytes::write_u64(&mut out.data[slot_offset..], 0);
                    } else if slot_is_pointer && slot_ty != TypeId::VPTR {
                        // Typed pointer slots only take `null`.
                        if tag != TypeId::VPTR {
                            return Err(LinkError::GlobalInitializerOverflow {
                                name: name.clone(),
                            });
                        }
                        let raw = kiln_types::bytes::read_u64(literal);
                        kiln_types::bytes::write_u64(&mut out.data[slot_offset..], raw);
                    } else {
                        write_converted_literal(
                            &mut out.data[slot_offset..slot_offset + slot_size],
                            slot_ty,
                            tag,
                            literal,
                        )
                        .map_err(|_| LinkError::GlobalInitializerOverflow { name: name.clone() })?;
                    }
                }
            }

            // Every method-pointer slot must have been covered.
            for &(slot_ty, _) in &slots[next_slot..] {
                if self.data.types[slot_ty.index()].is_signature() {
                    return Err(LinkError::UninitializedMethodPointer { name: name.clone() });
                }
            }

            out.entries.push(crate::module::Field {
                name: entry.name,
                ty: entry.ty,
                offset: out_offset,
            });
        }
        Ok(out)
    }

    fn resolve_methods(&mut self) -> Result<(), LinkError> {
        for i in 0..self.data.methods.len() {
            let method = &self.data.methods[i];
            if !method.is_defined() {
                // Never referenced declarations are dropped silently; call
                // sites referencing them fail below.
                continue;
            }
            if method.is_external() {
                continue;
            }

            // Stack layout: locals packed in declaration order, frame
            // rounded up to the machine word.
            let stackvar_count = self.data.methods[i].stackvars.len();
            let mut offset = 0usize;
            for v in 0..stackvar_count {
                let ty = self.data.methods[i].stackvars[v].ty;
                let size = self.data.types[ty.index()].total_size;
                self.data.methods[i].stackvars[v].offset = offset;
                offset += size;
            }
            self.data.methods[i].stack_size = kiln_types::bytes::align_up(offset, WORD_SIZE);

            let mut bytecode = core::mem::take(&mut self.data.methods[i].bytecode);
            let index = MethodId::new(i as RawIndex);
            let result = self.check_method(index, &mut bytecode);
            self.data.methods[i].bytecode = bytecode;
            result?;
            self.data.methods[i].flags |= MethodFlags::RESOLVED;
        }
        Ok(())
    }

    fn method_source(&self, method: MethodId) -> SourceMeta {
        self.data.method_meta(method)
    }

    /// Walks one body: validates every instruction, selects subcodes and
    /// resolves global operands.
    fn check_method(&mut self, index: MethodId, code: &mut [u8]) -> Result<(), LinkError> {
        let meta = self.method_source(index);
        let signature = self.data.methods[index.index()].signature;
        let return_type = self.data.signatures[signature.index()].return_type;
        let code_len = code.len();

        // Type of the value the previous instruction left in the return
        // slot, if any.
        let mut prev_value: Option<TypeId> = None;

        let mut pos = 0usize;
        while pos < code_len {
            let op = Opcode::from_u8(code[pos]).ok_or(LinkError::InvalidIntermediate)?;
            pos += 1;
            let value = match op {
                Opcode::Noop => None,
                Opcode::Set => {
                    let sub_at = pos;
                    pos += 1;
                    let (lhs, next) = self.operand(index, code, pos, prev_value, true, &meta)?;
                    let (rhs, next) = self.operand(index, code, next, prev_value, false, &meta)?;
                    pos = next;
                    let sub = self
                        .assign_set_subcode(lhs, rhs)
                        .ok_or_else(|| LinkError::InvalidImplicitConversion { meta: meta.clone() })?;
                    code[sub_at] = sub.0;
                    None
                }
                Opcode::Conv => {
                    let sub_at = pos;
                    pos += 1;
                    let (lhs, next) = self.operand(index, code, pos, prev_value, true, &meta)?;
                    let (rhs, next) = self.operand(index, code, next, prev_value, false, &meta)?;
                    pos = next;
                    let sub = conv_subcode(lhs, rhs)
                        .ok_or_else(|| LinkError::InvalidExplicitConversion { meta: meta.clone() })?;
                    code[sub_at] = sub.0;
                    None
                }
                Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Add
                | Opcode::Sub => {
                    let sub_at = pos;
                    pos += 1;
                    let (lhs, next) = self.operand(index, code, pos, prev_value, true, &meta)?;
                    let (rhs, next) = self.operand(index, code, next, prev_value, false, &meta)?;
                    pos = next;
                    let sub = implicit_subcode(lhs, rhs).ok_or_else(|| {
                        LinkError::InvalidArithmeticExpression { meta: meta.clone() }
                    })?;
                    code[sub_at] = sub.0;
                    None
                }
                Opcode::Lsh | Opcode::Rsh | Opcode::And | Opcode::Xor | Opcode::Or => {
                    let sub_at = pos;
                    pos += 1;
                    let (lhs, next) = self.operand(index, code, pos, prev_value, true, &meta)?;
                    let (rhs, next) = self.operand(index, code, next, prev_value, false, &meta)?;
                    pos = next;
                    let sub = integral_subcode(lhs, rhs).ok_or_else(|| {
                        LinkError::InvalidArithmeticExpression { meta: meta.clone() }
                    })?;
                    code[sub_at] = sub.0;
                    None
                }
                Opcode::Not | Opcode::Neg => {
                    let sub_at = pos;
                    pos += 1;
                    let (ty, next) = self.operand(index, code, pos, prev_value, true, &meta)?;
                    pos = next;
                    let sub = if op == Opcode::Not {
                        not_subcode(ty)
                    } else {
                        neg_subcode(ty)
                    }
                    .ok_or_else(|| LinkError::InvalidArithmeticExpression { meta: meta.clone() })?;
                    code[sub_at] = sub.0;
                    None
                }
                Opcode::Padd | Opcode::Psub => {
                    let sub_at = pos;
                    pos += 1;
                    let (lhs, next) = self.operand(index, code, pos, prev_value, true, &meta)?;
                    let (rhs, next) = self.operand(index, code, next, prev_value, false, &meta)?;
                    pos = next;
                    if !matches!(
                        self.data.types[lhs.index()].generated,
                        Some(Generated::Pointer { .. })
                    ) || lhs == TypeId::VPTR
                    {
                        return Err(LinkError::InvalidPointerExpression { meta: meta.clone() });
                    }
                    let sub = pointer_offset_subcode(rhs).ok_or_else(|| {
                        LinkError::InvalidPointerOffsetExpression { meta: meta.clone() }
                    })?;
                    code[sub_at] = sub.0;
                    None
                }
                Opcode::Pdif => {
                    let (lhs, next) = self.operand(index, code, pos, prev_value, false, &meta)?;
                    let (rhs, next) = self.operand(index, code, next, prev_value, false, &meta)?;
                    pos = next;
                    let lhs_pointee = self.data.types[lhs.index()].pointee();
                    let rhs_pointee = self.data.types[rhs.index()].pointee();
                    match (lhs_pointee, rhs_pointee) {
                        (Some(a), Some(b)) if a == b && lhs != TypeId::VPTR => {}
                        _ => {
                            return Err(LinkError::InvalidPointerExpression { meta: meta.clone() })
                        }
                    }
                    Some(TypeId::OFFSET)
                }
                Opcode::Cmp
                | Opcode::Ceq
                | Opcode::Cne
                | Opcode::Cgt
                | Opcode::Cge
                | Opcode::Clt
                | Opcode::Cle => {
                    let sub_at = pos;
                    pos += 1;
                    let (lhs, next) = self.operand(index, code, pos, prev_value, false, &meta)?;
                    let (rhs, next) = self.operand(index, code, next, prev_value, false, &meta)?;
                    pos = next;
                    let (sub, _) = compare_subcode(lhs, rhs).ok_or_else(|| {
                        LinkError::InvalidComparisonExpression { meta: meta.clone() }
                    })?;
                    code[sub_at] = sub.0;
                    Some(TypeId::I32)
                }
                Opcode::Cze | Opcode::Cnz => {
                    let sub_at = pos;
                    pos += 1;
                    let (ty, next) = self.operand(index, code, pos, prev_value, false, &meta)?;
                    pos = next;
                    let sub = test_subcode(ty).ok_or_else(|| {
                        LinkError::InvalidComparisonExpression { meta: meta.clone() }
                    })?;
                    code[sub_at] = sub.0;
                    Some(TypeId::I32)
                }
                Opcode::Br => {
                    self.check_branch_target(code, pos, code_len)?;
                    pos += 4;
                    None
                }
                Opcode::Beq
                | Opcode::Bne
                | Opcode::Bgt
                | Opcode::Bge
                | Opcode::Blt
                | Opcode::Ble => {
                    self.check_branch_target(code, pos, code_len)?;
                    pos += 4;
                    let sub_at = pos;
                    pos += 1;
                    let (lhs, next) = self.operand(index, code, pos, prev_value, false, &meta)?;
                    let (rhs, next) = self.operand(index, code, next, prev_value, false, &meta)?;
                    pos = next;
                    let (sub, _) = compare_subcode(lhs, rhs).ok_or_else(|| {
                        LinkError::InvalidComparisonExpression { meta: meta.clone() }
                    })?;
                    code[sub_at] = sub.0;
                    None
                }
                Opcode::Bze | Opcode::Bnz => {
                    self.check_branch_target(code, pos, code_len)?;
                    pos += 4;
                    let sub_at = pos;
                    pos += 1;
                    let (ty, next) = self.operand(index, code, pos, prev_value, false, &meta)?;
                    pos = next;
                    let sub = test_subcode(ty).ok_or_else(|| {
                        LinkError::InvalidComparisonExpression { meta: meta.clone() }
                    })?;
                    code[sub_at] = sub.0;
                    None
                }
                Opcode::Sw => {
                    let (selector, next) = self.operand(index, code, pos, prev_value, false, &meta)?;
                    pos = next;
                    if !selector.is_integral() {
                        return Err(LinkError::InvalidSwitchType { meta: meta.clone() });
                    }
                    let count = kiln_types::bytes::read_u32(&code[pos..]) as usize;
                    pos += 4;
                    for _ in 0..count {
                        self.check_branch_target(code, pos, code_len)?;
                        pos += 4;
                    }
                    None
                }
                Opcode::Call => {
                    let target = MethodId::new(kiln_types::bytes::read_u32(&code[pos..]));
                    pos += 4;
                    let argc = code[pos] as usize;
                    pos += 1;
                    let target_sig = self.callee_signature(target, &meta)?;
                    let expected = self.data.signatures[target_sig.index()].parameters.len();
                    if argc != expected {
                        return Err(LinkError::ArgumentCountMismatch {
                            provided: argc,
                            expected,
                            meta: meta.clone(),
                        });
                    }
                    pos = self.check_arguments(index, code, pos, argc, target_sig, prev_value, &meta)?;
                    let ret = self.data.signatures[target_sig.index()].return_type;
                    (ret != TypeId::VOID).then_some(ret)
                }
                Opcode::Callv => {
                    let (pointer, next) = self.operand(index, code, pos, prev_value, false, &meta)?;
                    pos = next;
                    let argc = code[pos] as usize;
                    pos += 1;
                    let Some(Generated::Signature(target_sig)) =
                        self.data.types[pointer.index()].generated
                    else {
                        return Err(LinkError::NonSignatureTypeInvoke { meta: meta.clone() });
                    };
                    let expected = self.data.signatures[target_sig.index()].parameters.len();
                    if argc != expected {
                        return Err(LinkError::ArgumentCountMismatch {
                            provided: argc,
                            expected,
                            meta: meta.clone(),
                        });
                    }
                    pos = self.check_arguments(index, code, pos, argc, target_sig, prev_value, &meta)?;
                    let ret = self.data.signatures[target_sig.index()].return_type;
                    (ret != TypeId::VOID).then_some(ret)
                }
                Opcode::Ret => {
                    if return_type != TypeId::VOID {
                        return Err(LinkError::InvalidReturnAddress { meta: meta.clone() });
                    }
                    None
                }
                Opcode::Retv => {
                    let sub_at = pos;
                    pos += 1;
                    let (value, next) = self.operand(index, code, pos, prev_value, false, &meta)?;
                    pos = next;
                    let sub = self.assign_set_subcode(return_type, value).ok_or_else(|| {
                        LinkError::InvalidImplicitConversion { meta: meta.clone() }
                    })?;
                    code[sub_at] = sub.0;
                    None
                }
                Opcode::Dump => {
                    let (_, next) = self.operand(index, code, pos, prev_value, false, &meta)?;
                    pos = next;
                    None
                }
            };
            prev_value = value;
        }
        Ok(())
    }

    fn check_branch_target(
        &self,
        code: &[u8],
        pos: usize,
        code_len: usize,
    ) -> Result<(), LinkError> {
        let target = kiln_types::bytes::read_u32(&code[pos..]) as usize;
        if target > code_len {
            return Err(LinkError::InvalidIntermediate);
        }
        Ok(())
    }

    fn callee_signature(
        &self,
        target: MethodId,
        meta: &SourceMeta,
    ) -> Result<kiln_types::SignatureId, LinkError> {
        let method = self
            .data
            .methods
            .get(target.index())
            .ok_or(LinkError::InvalidIntermediate)?;
        if !method.is_defined() {
            return Err(LinkError::UndefinedMethod {
                name: self.data.names.name_or(method.name, "<unknown>").to_owned(),
                meta: meta.clone(),
            });
        }
        Ok(method.signature)
    }

    #[allow(clippy::too_many_arguments)]
    fn check_arguments(
        &mut self,
        index: MethodId,
        code: &mut [u8],
        mut pos: usize,
        argc: usize,
        target_sig: kiln_types::SignatureId,
        prev_value: Option<TypeId>,
        meta: &SourceMeta,
    ) -> Result<usize, LinkError> {
        for arg in 0..argc {
            let param_ty = self.data.signatures[target_sig.index()].parameters[arg].ty;
            let sub_at = pos;
            pos += 1;
            let (arg_ty, next) = self.operand(index, code, pos, prev_value, false, meta)?;
            pos = next;
            let sub = self.assign_set_subcode(param_ty, arg_ty).ok_or_else(|| {
                LinkError::InvalidImplicitConversion { meta: meta.clone() }
            })?;
            code[sub_at] = sub.0;
        }
        Ok(pos)
    }

    /// Subcode of `set`-style assignment: the implicit conversion table,
    /// or the raw-copy subcode for equal (or pointer-compatible) types.
    fn assign_set_subcode(&self, lhs: TypeId, rhs: TypeId) -> Option<Subcode> {
        if let Some(sub) = implicit_subcode(lhs, rhs) {
            return Some(sub);
        }
        if lhs == rhs {
            return Some(SET_COPY_SUBCODE);
        }
        let lhs_def = &self.data.types[lhs.index()];
        let rhs_def = &self.data.types[rhs.index()];
        let lhs_ptr = lhs_def.is_pointer() || lhs_def.is_signature();
        let rhs_ptr = rhs_def.is_pointer() || rhs_def.is_signature();
        // Pointer values interconvert with the untyped pointer.
        if lhs_ptr && rhs_ptr && (lhs == TypeId::VPTR || rhs == TypeId::VPTR) {
            return Some(SET_COPY_SUBCODE);
        }
        None
    }

    /// Resolves the final type of one encoded operand, rewriting global
    /// name references into data table indices. `is_write` marks a
    /// destination position, where constants are rejected. Returns the type
    /// and the position after the operand.
    fn operand(
        &mut self,
        method: MethodId,
        code: &mut [u8],
        pos: usize,
        prev_value: Option<TypeId>,
        is_write: bool,
        meta: &SourceMeta,
    ) -> Result<(TypeId, usize), LinkError> {
        let slice = code.get_mut(pos..).ok_or(LinkError::InvalidIntermediate)?;
        if slice.len() < 4 {
            return Err(LinkError::InvalidIntermediate);
        }
        let mut header = AddressHeader::from_bits(kiln_types::bytes::read_u32(slice));

        let mut ty;
        let next;
        match header.kind() {
            AddressKind::Constant => {
                ty = TypeId::new(header.index());
                if !ty.is_base() || ty == TypeId::VOID {
                    return Err(LinkError::InvalidIntermediate);
                }
                if is_write {
                    return Err(LinkError::ConstantWrite {
                        name: self.data.type_name(ty),
                        meta: meta.clone(),
                    });
                }
                return Ok((ty, pos + 4 + ty.base_size()));
            }
            AddressKind::StackVar => {
                if header.index() == AddressHeader::INDEX_MAX {
                    ty = prev_value
                        .ok_or_else(|| LinkError::InvalidReturnAddress { meta: meta.clone() })?;
                } else {
                    let vars = &self.data.methods[method.index()].stackvars;
                    let var = vars
                        .get(header.index() as usize)
                        .ok_or(LinkError::InvalidIntermediate)?;
                    ty = var.ty;
                }
                next = pos + 12;
            }
            AddressKind::Parameter => {
                let signature = self.data.methods[method.index()].signature;
                let params = &self.data.signatures[signature.index()].parameters;
                let param = params
                    .get(header.index() as usize)
                    .ok_or(LinkError::InvalidIntermediate)?;
                ty = param.ty;
                next = pos + 12;
            }
            AddressKind::Global => {
                let name = NameId::new(header.index());
                if !self.data.names.is_valid(name) {
                    return Err(LinkError::InvalidIntermediate);
                }
                let (global, entry_ty) = match self.data.names.lookup(name) {
                    Lookup::Global(entry) => (
                        GlobalId::entry(entry, false),
                        self.data.globals.entries[entry as usize].ty,
                    ),
                    Lookup::Constant(entry) => {
                        if is_write {
                            return Err(LinkError::ConstantWrite {
                                name: self.data.names.name(name).to_owned(),
                                meta: meta.clone(),
                            });
                        }
                        (
                            GlobalId::entry(entry, true),
                            self.data.constants.entries[entry as usize].ty,
                        )
                    }
                    _ => {
                        return Err(LinkError::UndefinedGlobal {
                            name: self.data.names.name(name).to_owned(),
                            meta: meta.clone(),
                        })
                    }
                };
                header.set_index(global.raw());
                kiln_types::bytes::write_u32(slice, header.bits());
                ty = entry_ty;
                next = pos + 12;
            }
        }

        // Modifier, applied before the prefix.
        match header.modifier() {
            AddressModifier::None => {}
            AddressModifier::DirectField | AddressModifier::IndirectField => {
                let payload = kiln_types::bytes::read_u64(&code[pos + 4..]);
                let offset = self
                    .data
                    .offsets
                    .get(OffsetId::new(payload as RawIndex).index())
                    .ok_or(LinkError::InvalidIntermediate)?;
                let indirect = header.modifier() == AddressModifier::IndirectField;
                let base = if indirect {
                    if ty == TypeId::VPTR {
                        return Err(LinkError::AbstractPointerDereference { meta: meta.clone() });
                    }
                    self.data.types[ty.index()]
                        .pointee()
                        .ok_or_else(|| LinkError::InvalidOffsetModifier { meta: meta.clone() })?
                } else {
                    if self.data.types[ty.index()].is_pointer() {
                        return Err(LinkError::InvalidOffsetModifier { meta: meta.clone() });
                    }
                    ty
                };
                if self.data.types[base.index()].fields.is_empty() {
                    return Err(LinkError::InvalidFieldDereference { meta: meta.clone() });
                }
                if offset.address.root != base {
                    return Err(LinkError::FieldParentTypeMismatch { meta: meta.clone() });
                }
                ty = offset.ty;
            }
            AddressModifier::Subscript => {
                let payload = kiln_types::bytes::read_i64(&code[pos + 4..]);
                let def = &self.data.types[ty.index()];
                match def.generated {
                    Some(Generated::Pointer { pointee, .. }) => {
                        if ty == TypeId::VPTR {
                            return Err(LinkError::AbstractPointerDereference {
                                meta: meta.clone(),
                            });
                        }
                        ty = pointee;
                    }
                    Some(Generated::Array { elem, len }) => {
                        if payload < 0 || payload as usize >= len {
                            return Err(LinkError::ArrayIndexOutOfRange {
                                index: payload,
                                length: len,
                                meta: meta.clone(),
                            });
                        }
                        ty = elem;
                    }
                    _ => return Err(LinkError::InvalidOffsetModifier { meta: meta.clone() }),
                }
            }
        }

        // Prefix, applied last.
        match header.prefix() {
            AddressPrefix::None => {}
            AddressPrefix::Indirection => {
                if ty == TypeId::VPTR {
                    return Err(LinkError::AbstractPointerDereference { meta: meta.clone() });
                }
                ty = self.data.types[ty.index()]
                    .pointee()
                    .ok_or_else(|| LinkError::InvalidPointerDereference { meta: meta.clone() })?;
            }
            AddressPrefix::AddressOf => {
                // The result lives in a per-instruction scratch cell and
                // cannot be a destination.
                if is_write {
                    return Err(LinkError::InvalidPointerExpression { meta: meta.clone() });
                }
                let cached = self.data.types[ty.index()].pointer_type;
                ty = if cached.is_valid() { cached } else { TypeId::VPTR };
            }
            AddressPrefix::SizeOf => {
                if is_write {
                    return Err(LinkError::InvalidPointerExpression { meta: meta.clone() });
                }
                ty = TypeId::WORD;
            }
        }

        Ok((ty, next))
    }
}

/// Scalar value decoded from an initializer literal.
enum ScalarValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Pointer(u64),
}

fn decode_literal(tag: TypeId, bytes: &[u8]) -> Result<ScalarValue, ()> {
    use kiln_types::bytes::{read_u16, read_u32, read_u64};
    Ok(match tag {
        TypeId::I8 => ScalarValue::Signed(bytes[0] as i8 as i64),
        TypeId::U8 => ScalarValue::Unsigned(bytes[0] as u64),
        TypeId::I16 => ScalarValue::Signed(read_u16(bytes) as i16 as i64),
        TypeId::U16 => ScalarValue::Unsigned(read_u16(bytes) as u64),
        TypeId::I32 => ScalarValue::Signed(read_u32(bytes) as i32 as i64),
        TypeId::U32 => ScalarValue::Unsigned(read_u32(bytes) as u64),
        TypeId::I64 => ScalarValue::Signed(read_u64(bytes) as i64),
        TypeId::U64 => ScalarValue::Unsigned(read_u64(bytes)),
        TypeId::F32 => ScalarValue::Float(f32::from_bits(read_u32(bytes)) as f64),
        TypeId::F64 => ScalarValue::Float(f64::from_bits(read_u64(bytes))),
        TypeId::VPTR => ScalarValue::Pointer(read_u64(bytes)),
        _ => return Err(()),
    })
}

/// Converts one initializer literal into a scalar slot, with plain numeric
/// cast semantics.
fn write_converted_literal(
    out: &mut [u8],
    slot: TypeId,
    tag: TypeId,
    literal: &[u8],
) -> Result<(), ()> {
    use kiln_types::bytes::{write_u16, write_u32, write_u64};

    let value = decode_literal(tag, literal)?;
    if slot == TypeId::VPTR {
        return match value {
            ScalarValue::Pointer(raw) => {
                write_u64(out, raw);
                Ok(())
            }
            _ => Err(()),
        };
    }
    if !slot.is_arithmetic() {
        return Err(());
    }
    let (signed, unsigned, float) = match value {
        ScalarValue::Signed(v) => (v, v as u64, v as f64),
        ScalarValue::Unsigned(v) => (v as i64, v, v as f64),
        ScalarValue::Float(v) => (v as i64, v as u64, v),
        ScalarValue::Pointer(_) => return Err(()),
    };
    match slot {
        TypeId::I8 => out[0] = signed as i8 as u8,
        TypeId::U8 => out[0] = unsigned as u8,
        TypeId::I16 => write_u16(out, signed as i16 as u16),
        TypeId::U16 => write_u16(out, unsigned as u16),
        TypeId::I32 => write_u32(out, signed as i32 as u32),
        TypeId::U32 => write_u32(out, unsigned as u32),
        TypeId::I64 => write_u64(out, signed as u64),
        TypeId::U64 => write_u64(out, unsigned),
        TypeId::F32 => write_u32(out, (float as f32).to_bits()),
        TypeId::F64 => write_u64(out, float.to_bits()),
        _ => return Err(()),
    }
    Ok(())
}
