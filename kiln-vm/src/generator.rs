//! Programmatic construction of intermediates.
//!
//! A [`Generator`] owns the module being built; [`TypeWriter`] and
//! [`MethodWriter`] are detached builders handed back to the generator when
//! finished, so the generator stays usable while a body is being written
//! (the parser interleaves type lookups with field and instruction writes).

use std::collections::{HashMap, HashSet};

use kiln_asm::{Opcode, Subcode, Writer};
use kiln_types::{
    AddressHeader, AddressKind, AddressModifier, AddressPrefix, LabelId, MethodId, NameId,
    OffsetId, RawIndex, SignatureId, SourceMeta, TypeId,
};
use tracing::debug;

use crate::error::GeneratorError;
use crate::database::Lookup;
use crate::module::{
    Field, FieldAddress, Meta, MethodFlags, ModuleData, StackVar, TypeFlags,
};
use crate::Intermediate;

/// A typed literal value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    /// `i8` literal.
    I8(i8),
    /// `u8` literal.
    U8(u8),
    /// `i16` literal.
    I16(i16),
    /// `u16` literal.
    U16(u16),
    /// `i32` literal.
    I32(i32),
    /// `u32` literal.
    U32(u32),
    /// `i64` literal.
    I64(i64),
    /// `u64` literal.
    U64(u64),
    /// `f32` literal.
    F32(f32),
    /// `f64` literal.
    F64(f64),
    /// The null pointer.
    Null,
}

impl Constant {
    /// Base type of the literal.
    pub fn type_id(&self) -> TypeId {
        match self {
            Self::I8(_) => TypeId::I8,
            Self::U8(_) => TypeId::U8,
            Self::I16(_) => TypeId::I16,
            Self::U16(_) => TypeId::U16,
            Self::I32(_) => TypeId::I32,
            Self::U32(_) => TypeId::U32,
            Self::I64(_) => TypeId::I64,
            Self::U64(_) => TypeId::U64,
            Self::F32(_) => TypeId::F32,
            Self::F64(_) => TypeId::F64,
            Self::Null => TypeId::VPTR,
        }
    }

    pub(crate) fn write(&self, w: &mut Writer) {
        match *self {
            Self::I8(v) => w.u8(v as u8),
            Self::U8(v) => w.u8(v),
            Self::I16(v) => w.u16(v as u16),
            Self::U16(v) => w.u16(v),
            Self::I32(v) => w.u32(v as u32),
            Self::U32(v) => w.u32(v),
            Self::I64(v) => w.u64(v as u64),
            Self::U64(v) => w.u64(v),
            Self::F32(v) => w.u32(v.to_bits()),
            Self::F64(v) => w.u64(v.to_bits()),
            Self::Null => w.u64(0),
        }
    }
}

macro_rules! constant_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(impl From<$ty> for Constant {
            fn from(value: $ty) -> Self {
                Self::$variant(value)
            }
        })+
    };
}

constant_from! {
    i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32, u32 => U32,
    i64 => I64, u64 => U64, f32 => F32, f64 => F64,
}

/// One element of a global initializer list. Aggregates are initialized by a
/// flat sequence of values; signature-typed slots take a method name or
/// `null` (a [`Constant::Null`] value).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// A literal value.
    Value(Constant),
    /// A method-pointer initializer, by interned method name.
    Method(NameId),
}

impl<T: Into<Constant>> From<T> for Init {
    fn from(value: T) -> Self {
        Self::Value(value.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OperandPayload {
    None,
    Field(OffsetId),
    Subscript(i64),
    Constant(Constant),
}

/// An instruction operand: a base location with optional prefix and
/// modifier, or an inline constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Operand {
    header: AddressHeader,
    payload: OperandPayload,
}

impl Operand {
    fn base(kind: AddressKind, index: RawIndex) -> Self {
        Self {
            header: AddressHeader::new(kind, AddressPrefix::None, AddressModifier::None, index),
            payload: OperandPayload::None,
        }
    }

    /// Stack variable `index` of the current frame.
    pub fn stack(index: u32) -> Self {
        Self::base(AddressKind::StackVar, index)
    }

    /// Parameter `index` of the current frame.
    pub fn param(index: u32) -> Self {
        Self::base(AddressKind::Parameter, index)
    }

    /// The return-value slot `{^}` of the current frame.
    pub fn ret_val() -> Self {
        Self::base(AddressKind::StackVar, AddressHeader::INDEX_MAX)
    }

    /// A global or constant, by interned name. The linker resolves the name
    /// to a data table entry.
    pub fn global(name: NameId) -> Self {
        Self::base(AddressKind::Global, name.raw())
    }

    /// An inline constant.
    pub fn constant(value: impl Into<Constant>) -> Self {
        let value = value.into();
        Self {
            header: AddressHeader::constant(value.type_id()),
            payload: OperandPayload::Constant(value),
        }
    }

    /// The null pointer constant.
    pub fn null() -> Self {
        Self::constant(Constant::Null)
    }

    /// `*self`: dereference.
    pub fn deref(mut self) -> Self {
        self.header.set_prefix(AddressPrefix::Indirection);
        self
    }

    /// `&self`: address-of.
    pub fn address_of(mut self) -> Self {
        self.header.set_prefix(AddressPrefix::AddressOf);
        self
    }

    /// `!self`: size-of.
    pub fn size_of(mut self) -> Self {
        self.header.set_prefix(AddressPrefix::SizeOf);
        self
    }

    /// `self.field` access through a precomputed offset entry.
    pub fn field(mut self, offset: OffsetId) -> Self {
        self.header.set_modifier(AddressModifier::DirectField);
        self.payload = OperandPayload::Field(offset);
        self
    }

    /// `self->field` access through a precomputed offset entry.
    pub fn arrow(mut self, offset: OffsetId) -> Self {
        self.header.set_modifier(AddressModifier::IndirectField);
        self.payload = OperandPayload::Field(offset);
        self
    }

    /// `self[index]` subscript.
    pub fn at(mut self, index: i64) -> Self {
        self.header.set_modifier(AddressModifier::Subscript);
        self.payload = OperandPayload::Subscript(index);
        self
    }

    fn is_constant(&self) -> bool {
        matches!(self.header.kind(), AddressKind::Constant)
    }
}

impl<T: Into<Constant>> From<T> for Operand {
    fn from(value: T) -> Self {
        Self::constant(value)
    }
}

/// Builder of one struct or union body.
#[derive(Debug)]
pub struct TypeWriter {
    index: TypeId,
    fields: Vec<Field>,
    seen: HashSet<NameId>,
}

impl TypeWriter {
    /// The type being defined.
    pub fn type_id(&self) -> TypeId {
        self.index
    }

    /// Appends a field. Offsets are assigned by the linker.
    pub fn declare_field(
        &mut self,
        gen: &mut Generator,
        ty: TypeId,
        name: &str,
    ) -> Result<(), GeneratorError> {
        if ty == TypeId::VOID {
            return Err(GeneratorError::InvalidVoidType {
                meta: gen.source_meta(),
            });
        }
        let name = gen.make_identifier(name)?;
        if !self.seen.insert(name) {
            return Err(GeneratorError::FieldRedefinition {
                name: gen.data.names.name(name).to_owned(),
                meta: gen.source_meta(),
            });
        }
        self.fields.push(Field {
            name,
            ty,
            offset: 0,
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum LabelState {
    Pending(Vec<usize>),
    Written(u32),
}

/// Builder of one method body. Emits the little-endian instruction stream,
/// maintains the stack layout and back-patches forward label references.
#[derive(Debug)]
pub struct MethodWriter {
    index: MethodId,
    signature: SignatureId,
    return_type: TypeId,
    param_count: usize,
    stackvars: Vec<TypeId>,
    code: Writer,
    labels: Vec<LabelState>,
    label_names: HashMap<String, LabelId>,
    calls: Vec<MethodId>,
    last_op: Option<Opcode>,
    cursor: SourceMeta,
}

impl MethodWriter {
    /// The method being defined.
    pub fn method_id(&self) -> MethodId {
        self.index
    }

    /// Updates the location reported by subsequent failures.
    pub fn set_location(&mut self, cursor: SourceMeta) {
        self.cursor = cursor;
    }

    fn meta(&self) -> SourceMeta {
        self.cursor.clone()
    }

    /// Replaces the stack layout. Only valid before any instruction.
    pub fn set_stack(&mut self, types: &[TypeId]) -> Result<(), GeneratorError> {
        self.stackvars.clear();
        self.push_stack(types)
    }

    /// Appends stack variables to the layout.
    pub fn push_stack(&mut self, types: &[TypeId]) -> Result<(), GeneratorError> {
        for &ty in types {
            if ty == TypeId::VOID {
                return Err(GeneratorError::InvalidVoidType { meta: self.meta() });
            }
            self.stackvars.push(ty);
        }
        if self.stackvars.len() >= AddressHeader::INDEX_MAX as usize {
            return Err(GeneratorError::StackIndexOutOfRange {
                index: self.stackvars.len() as u32,
                meta: self.meta(),
            });
        }
        Ok(())
    }

    /// Declares (or finds) a label by name; the position is supplied later
    /// by [`MethodWriter::write_label`].
    pub fn declare_label(&mut self, name: &str) -> LabelId {
        if let Some(&label) = self.label_names.get(name) {
            return label;
        }
        let label = LabelId::new(self.labels.len() as RawIndex);
        self.labels.push(LabelState::Pending(Vec::new()));
        self.label_names.insert(name.to_owned(), label);
        label
    }

    /// Pins a declared label to the current bytecode position and resolves
    /// every forward reference recorded for it.
    pub fn write_label(&mut self, label: LabelId) -> Result<(), GeneratorError> {
        let offset = self.code.len() as u32;
        match core::mem::replace(&mut self.labels[label.index()], LabelState::Written(offset)) {
            LabelState::Pending(sites) => {
                for site in sites {
                    self.code.patch_u32(site, offset);
                }
                Ok(())
            }
            LabelState::Written(_) => Err(GeneratorError::LabelRedefinition { meta: self.meta() }),
        }
    }

    fn emit_label_ref(&mut self, label: LabelId) {
        match &mut self.labels[label.index()] {
            LabelState::Written(offset) => {
                let offset = *offset;
                self.code.u32(offset);
            }
            LabelState::Pending(sites) => {
                sites.push(self.code.len());
                self.code.u32(u32::MAX);
            }
        }
    }

    fn emit_operand(&mut self, op: &Operand, writable: bool) -> Result<(), GeneratorError> {
        match op.header.kind() {
            AddressKind::Constant => {
                if writable {
                    return Err(GeneratorError::InvalidConstant { meta: self.meta() });
                }
                self.code.header(op.header);
                match op.payload {
                    OperandPayload::Constant(value) => value.write(&mut self.code),
                    _ => return Err(GeneratorError::InvalidConstant { meta: self.meta() }),
                }
                return Ok(());
            }
            AddressKind::StackVar => {
                let index = op.header.index();
                if index != AddressHeader::INDEX_MAX && index as usize >= self.stackvars.len() {
                    return Err(GeneratorError::StackIndexOutOfRange {
                        index,
                        meta: self.meta(),
                    });
                }
            }
            AddressKind::Parameter => {
                let index = op.header.index();
                if index as usize >= self.param_count {
                    return Err(GeneratorError::ParamIndexOutOfRange {
                        index,
                        meta: self.meta(),
                    });
                }
            }
            AddressKind::Global => {}
        }
        self.code.header(op.header);
        match op.payload {
            OperandPayload::None => self.code.u64(0),
            OperandPayload::Field(offset) => self.code.u64(offset.raw() as u64),
            OperandPayload::Subscript(index) => self.code.i64(index),
            OperandPayload::Constant(_) => {
                return Err(GeneratorError::InvalidConstant { meta: self.meta() })
            }
        }
        Ok(())
    }

    fn begin(&mut self, op: Opcode) {
        self.code.opcode(op);
        self.last_op = Some(op);
    }

    fn write_binary(
        &mut self,
        op: Opcode,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), GeneratorError> {
        self.begin(op);
        self.code.subcode(Subcode::PLACEHOLDER);
        self.emit_operand(&lhs, true)?;
        self.emit_operand(&rhs, false)
    }

    fn write_compare(
        &mut self,
        op: Opcode,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), GeneratorError> {
        self.begin(op);
        self.code.subcode(Subcode::PLACEHOLDER);
        self.emit_operand(&lhs, false)?;
        self.emit_operand(&rhs, false)
    }

    fn write_unary(&mut self, op: Opcode, target: Operand) -> Result<(), GeneratorError> {
        self.begin(op);
        self.code.subcode(Subcode::PLACEHOLDER);
        self.emit_operand(&target, true)
    }

    /// `noop`
    pub fn write_noop(&mut self) {
        self.begin(Opcode::Noop);
    }

    /// `set lhs rhs`
    pub fn write_set(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Set, lhs, rhs)
    }

    /// `conv lhs rhs`
    pub fn write_conv(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Conv, lhs, rhs)
    }

    /// `not target`
    pub fn write_not(&mut self, target: Operand) -> Result<(), GeneratorError> {
        self.write_unary(Opcode::Not, target)
    }

    /// `neg target`
    pub fn write_neg(&mut self, target: Operand) -> Result<(), GeneratorError> {
        self.write_unary(Opcode::Neg, target)
    }

    /// `mul lhs rhs`
    pub fn write_mul(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Mul, lhs, rhs)
    }

    /// `div lhs rhs`
    pub fn write_div(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Div, lhs, rhs)
    }

    /// `mod lhs rhs`
    pub fn write_mod(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Mod, lhs, rhs)
    }

    /// `add lhs rhs`
    pub fn write_add(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Add, lhs, rhs)
    }

    /// `sub lhs rhs`
    pub fn write_sub(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Sub, lhs, rhs)
    }

    /// `lsh lhs rhs`
    pub fn write_lsh(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Lsh, lhs, rhs)
    }

    /// `rsh lhs rhs`
    pub fn write_rsh(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Rsh, lhs, rhs)
    }

    /// `and lhs rhs`
    pub fn write_and(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::And, lhs, rhs)
    }

    /// `xor lhs rhs`
    pub fn write_xor(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Xor, lhs, rhs)
    }

    /// `or lhs rhs`
    pub fn write_or(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Or, lhs, rhs)
    }

    /// `padd lhs rhs`
    pub fn write_padd(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Padd, lhs, rhs)
    }

    /// `psub lhs rhs`
    pub fn write_psub(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_binary(Opcode::Psub, lhs, rhs)
    }

    /// `pdif lhs rhs`; the element distance lands in the return slot.
    pub fn write_pdif(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.begin(Opcode::Pdif);
        self.emit_operand(&lhs, false)?;
        self.emit_operand(&rhs, false)
    }

    /// `cmp lhs rhs`; -1/0/1 lands in the return slot.
    pub fn write_cmp(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_compare(Opcode::Cmp, lhs, rhs)
    }

    /// `ceq lhs rhs`
    pub fn write_ceq(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_compare(Opcode::Ceq, lhs, rhs)
    }

    /// `cne lhs rhs`
    pub fn write_cne(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_compare(Opcode::Cne, lhs, rhs)
    }

    /// `cgt lhs rhs`
    pub fn write_cgt(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_compare(Opcode::Cgt, lhs, rhs)
    }

    /// `cge lhs rhs`
    pub fn write_cge(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_compare(Opcode::Cge, lhs, rhs)
    }

    /// `clt lhs rhs`
    pub fn write_clt(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_compare(Opcode::Clt, lhs, rhs)
    }

    /// `cle lhs rhs`
    pub fn write_cle(&mut self, lhs: Operand, rhs: Operand) -> Result<(), GeneratorError> {
        self.write_compare(Opcode::Cle, lhs, rhs)
    }

    /// `cze target`
    pub fn write_cze(&mut self, target: Operand) -> Result<(), GeneratorError> {
        self.begin(Opcode::Cze);
        self.code.subcode(Subcode::PLACEHOLDER);
        self.emit_operand(&target, false)
    }

    /// `cnz target`
    pub fn write_cnz(&mut self, target: Operand) -> Result<(), GeneratorError> {
        self.begin(Opcode::Cnz);
        self.code.subcode(Subcode::PLACEHOLDER);
        self.emit_operand(&target, false)
    }

    /// `br label`
    pub fn write_br(&mut self, label: LabelId) {
        self.begin(Opcode::Br);
        self.emit_label_ref(label);
    }

    fn write_branch2(
        &mut self,
        op: Opcode,
        label: LabelId,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), GeneratorError> {
        self.begin(op);
        self.emit_label_ref(label);
        self.code.subcode(Subcode::PLACEHOLDER);
        self.emit_operand(&lhs, false)?;
        self.emit_operand(&rhs, false)
    }

    fn write_branch1(
        &mut self,
        op: Opcode,
        label: LabelId,
        target: Operand,
    ) -> Result<(), GeneratorError> {
        self.begin(op);
        self.emit_label_ref(label);
        self.code.subcode(Subcode::PLACEHOLDER);
        self.emit_operand(&target, false)
    }

    /// `beq label lhs rhs`
    pub fn write_beq(
        &mut self,
        label: LabelId,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), GeneratorError> {
        self.write_branch2(Opcode::Beq, label, lhs, rhs)
    }

    /// `bne label lhs rhs`
    pub fn write_bne(
        &mut self,
        label: LabelId,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), GeneratorError> {
        self.write_branch2(Opcode::Bne, label, lhs, rhs)
    }

    /// `bgt label lhs rhs`
    pub fn write_bgt(
        &mut self,
        label: LabelId,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), GeneratorError> {
        self.write_branch2(Opcode::Bgt, label, lhs, rhs)
    }

    /// `bge label lhs rhs`
    pub fn write_bge(
        &mut self,
        label: LabelId,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), GeneratorError> {
        self.write_branch2(Opcode::Bge, label, lhs, rhs)
    }

    /// `blt label lhs rhs`
    pub fn write_blt(
        &mut self,
        label: LabelId,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), GeneratorError> {
        self.write_branch2(Opcode::Blt, label, lhs, rhs)
    }

    /// `ble label lhs rhs`
    pub fn write_ble(
        &mut self,
        label: LabelId,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), GeneratorError> {
        self.write_branch2(Opcode::Ble, label, lhs, rhs)
    }

    /// `bze label target`
    pub fn write_bze(&mut self, label: LabelId, target: Operand) -> Result<(), GeneratorError> {
        self.write_branch1(Opcode::Bze, label, target)
    }

    /// `bnz label target`
    pub fn write_bnz(&mut self, label: LabelId, target: Operand) -> Result<(), GeneratorError> {
        self.write_branch1(Opcode::Bnz, label, target)
    }

    /// `sw selector labels...`
    pub fn write_sw(
        &mut self,
        selector: Operand,
        labels: &[LabelId],
    ) -> Result<(), GeneratorError> {
        self.begin(Opcode::Sw);
        self.emit_operand(&selector, false)?;
        self.code.u32(labels.len() as u32);
        for &label in labels {
            self.emit_label_ref(label);
        }
        Ok(())
    }

    /// `call method args...`
    pub fn write_call(
        &mut self,
        method: MethodId,
        args: &[Operand],
    ) -> Result<(), GeneratorError> {
        if args.len() > u8::MAX as usize {
            return Err(GeneratorError::ParameterOverflow { meta: self.meta() });
        }
        self.begin(Opcode::Call);
        self.code.u32(method.raw());
        self.code.u8(args.len() as u8);
        for arg in args {
            self.code.subcode(Subcode::PLACEHOLDER);
            self.emit_operand(arg, false)?;
        }
        if !self.calls.contains(&method) {
            self.calls.push(method);
        }
        Ok(())
    }

    /// `callv pointer args...`
    pub fn write_callv(
        &mut self,
        pointer: Operand,
        args: &[Operand],
    ) -> Result<(), GeneratorError> {
        if args.len() > u8::MAX as usize {
            return Err(GeneratorError::ParameterOverflow { meta: self.meta() });
        }
        self.begin(Opcode::Callv);
        self.emit_operand(&pointer, false)?;
        self.code.u8(args.len() as u8);
        for arg in args {
            self.code.subcode(Subcode::PLACEHOLDER);
            self.emit_operand(arg, false)?;
        }
        Ok(())
    }

    /// `ret`
    pub fn write_ret(&mut self) -> Result<(), GeneratorError> {
        if self.return_type != TypeId::VOID {
            return Err(GeneratorError::InvalidReturnValue { meta: self.meta() });
        }
        self.begin(Opcode::Ret);
        Ok(())
    }

    /// `retv value`
    pub fn write_retv(&mut self, value: Operand) -> Result<(), GeneratorError> {
        if self.return_type == TypeId::VOID {
            return Err(GeneratorError::InvalidReturnValue { meta: self.meta() });
        }
        self.begin(Opcode::Retv);
        self.code.subcode(Subcode::PLACEHOLDER);
        self.emit_operand(&value, false)
    }

    /// `dump target`
    pub fn write_dump(&mut self, target: Operand) -> Result<(), GeneratorError> {
        self.begin(Opcode::Dump);
        self.emit_operand(&target, false)
    }
}

/// Imperative builder of an [`Intermediate`]. Single-use: [`Generator::finalize`]
/// consumes the generator and emits the serialized module.
#[derive(Debug)]
pub struct Generator {
    data: ModuleData,
    meta: Meta,
}

impl Generator {
    /// Generator for a module; `module_name` becomes the default source
    /// meta of everything declared through it.
    pub fn new(module_name: &str) -> Self {
        let mut data = ModuleData::new();
        let meta = Meta {
            index: data.metas.intern(module_name),
            line: 0,
        };
        Self { data, meta }
    }

    /// Points the location cursor at a source file.
    pub fn set_source(&mut self, file: &str) {
        self.meta.index = self.data.metas.intern(file);
        self.meta.line = 0;
    }

    /// Moves the location cursor to a line.
    pub fn set_line(&mut self, line: u32) {
        self.meta.line = line;
    }

    pub(crate) fn source_meta(&self) -> SourceMeta {
        self.data.resolve_meta(self.meta)
    }

    fn is_identifier(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// Interns an identifier, validating its spelling.
    pub fn make_identifier(&mut self, name: &str) -> Result<NameId, GeneratorError> {
        if !Self::is_identifier(name) {
            return Err(GeneratorError::InvalidIdentifier {
                name: name.to_owned(),
                meta: self.source_meta(),
            });
        }
        Ok(self.data.names.intern(name))
    }

    /// Declares a type by name, returning its index. Idempotent; the body
    /// may be supplied later (or by another module before linking).
    pub fn declare_type(&mut self, name: &str) -> Result<TypeId, GeneratorError> {
        let id = self.make_identifier(name)?;
        match self.data.names.lookup(id) {
            Lookup::Type(ty) => Ok(ty),
            Lookup::Identifier => {
                let index = TypeId::new(self.data.types.len() as RawIndex);
                let mut def = crate::module::TypeDef::declared(id, index);
                def.meta = self.meta;
                self.data.types.push(def);
                self.data.names.bind(id, Lookup::Type(index));
                Ok(index)
            }
            _ => Err(GeneratorError::IdentifierTypeMismatch {
                name: name.to_owned(),
                meta: self.source_meta(),
            }),
        }
    }

    /// Begins the body of a declared type. A second body fails with
    /// [`GeneratorError::TypeRedefinition`].
    pub fn define_type(
        &mut self,
        index: TypeId,
        is_union: bool,
    ) -> Result<TypeWriter, GeneratorError> {
        if index.index() >= self.data.types.len() {
            return Err(GeneratorError::IndexOutOfRange {
                meta: self.source_meta(),
            });
        }
        let meta = self.meta;
        let ty = &mut self.data.types[index.index()];
        if ty.is_base() || ty.is_generated() || ty.is_defined() {
            let name = self.data.names.name_or(ty.name, "<anonymous>").to_owned();
            return Err(GeneratorError::TypeRedefinition {
                name,
                meta: self.source_meta(),
            });
        }
        ty.flags |= TypeFlags::DEFINED;
        if is_union {
            ty.flags |= TypeFlags::UNION;
        }
        ty.meta = meta;
        Ok(TypeWriter {
            index,
            fields: Vec::new(),
            seen: HashSet::new(),
        })
    }

    /// Declares and defines a type in one step; convenience over
    /// [`Generator::declare_type`] + [`Generator::define_type`].
    pub fn define_type_by_name(
        &mut self,
        name: &str,
        is_union: bool,
    ) -> Result<TypeWriter, GeneratorError> {
        let index = self.declare_type(name)?;
        self.define_type(index, is_union)
    }

    /// Installs a finished type body.
    pub fn finish_type(&mut self, writer: TypeWriter) -> Result<(), GeneratorError> {
        let ty = &mut self.data.types[writer.index.index()];
        ty.fields = writer.fields;
        debug!(type_id = ?writer.index, fields = ty.fields.len(), "type defined");
        Ok(())
    }

    /// Pointer type of `base`, deduplicated.
    pub fn declare_pointer_type(&mut self, base: TypeId) -> Result<TypeId, GeneratorError> {
        if base.index() >= self.data.types.len() {
            return Err(GeneratorError::IndexOutOfRange {
                meta: self.source_meta(),
            });
        }
        Ok(self.data.pointer_to(base))
    }

    /// Array type of `base` with `len` elements, deduplicated.
    pub fn declare_array_type(
        &mut self,
        base: TypeId,
        len: usize,
    ) -> Result<TypeId, GeneratorError> {
        if base.index() >= self.data.types.len() {
            return Err(GeneratorError::IndexOutOfRange {
                meta: self.source_meta(),
            });
        }
        if base == TypeId::VOID {
            return Err(GeneratorError::InvalidVoidType {
                meta: self.source_meta(),
            });
        }
        if len == 0 {
            return Err(GeneratorError::ArrayLengthZero {
                meta: self.source_meta(),
            });
        }
        Ok(self.data.array_of(base, len))
    }

    /// Function-pointer type of `signature`, deduplicated.
    pub fn declare_signature_type(
        &mut self,
        signature: SignatureId,
    ) -> Result<TypeId, GeneratorError> {
        if signature.index() >= self.data.signatures.len() {
            return Err(GeneratorError::IndexOutOfRange {
                meta: self.source_meta(),
            });
        }
        Ok(self.data.signature_type_of(signature))
    }

    /// Signature of `return_type` and `params`, structurally deduplicated.
    pub fn make_signature(
        &mut self,
        return_type: TypeId,
        params: &[TypeId],
    ) -> Result<SignatureId, GeneratorError> {
        if params.len() > u8::MAX as usize {
            return Err(GeneratorError::ParameterOverflow {
                meta: self.source_meta(),
            });
        }
        for &param in params {
            if param == TypeId::VOID {
                return Err(GeneratorError::InvalidVoidType {
                    meta: self.source_meta(),
                });
            }
        }
        let params = params.iter().map(|&ty| StackVar::new(ty)).collect();
        Ok(self.data.make_signature(return_type, params))
    }

    /// Field offset entry for a chain of field names rooted at
    /// `root_type`, structurally deduplicated.
    pub fn make_offset(
        &mut self,
        root_type: TypeId,
        fields: &[NameId],
    ) -> Result<OffsetId, GeneratorError> {
        if root_type.index() >= self.data.types.len() {
            return Err(GeneratorError::IndexOutOfRange {
                meta: self.source_meta(),
            });
        }
        Ok(self.data.make_offset(FieldAddress {
            root: root_type,
            fields: fields.to_vec(),
        }))
    }

    /// Declares a method by name, returning its index. Idempotent.
    pub fn declare_method(&mut self, name: &str) -> Result<MethodId, GeneratorError> {
        let id = self.make_identifier(name)?;
        match self.data.names.lookup(id) {
            Lookup::Method(method) => Ok(method),
            Lookup::Identifier => {
                let index = MethodId::new(self.data.methods.len() as RawIndex);
                let mut def = crate::module::MethodDef::declared(id, index);
                def.meta = self.meta;
                self.data.methods.push(def);
                self.data.names.bind(id, Lookup::Method(index));
                Ok(index)
            }
            _ => Err(GeneratorError::IdentifierTypeMismatch {
                name: name.to_owned(),
                meta: self.source_meta(),
            }),
        }
    }

    /// Begins the body of a declared method. A second body fails with
    /// [`GeneratorError::MethodRedefinition`].
    pub fn define_method(
        &mut self,
        index: MethodId,
        signature: SignatureId,
    ) -> Result<MethodWriter, GeneratorError> {
        if index.index() >= self.data.methods.len() {
            return Err(GeneratorError::IndexOutOfRange {
                meta: self.source_meta(),
            });
        }
        if signature.index() >= self.data.signatures.len() {
            return Err(GeneratorError::IndexOutOfRange {
                meta: self.source_meta(),
            });
        }
        let meta = self.meta;
        let cursor = self.source_meta();
        let sig = &self.data.signatures[signature.index()];
        let return_type = sig.return_type;
        let param_count = sig.parameters.len();
        let method = &mut self.data.methods[index.index()];
        if method.is_defined() {
            let name = self.data.names.name(method.name).to_owned();
            return Err(GeneratorError::MethodRedefinition {
                name,
                meta: self.data.resolve_meta(meta),
            });
        }
        method.flags |= MethodFlags::DEFINED;
        method.signature = signature;
        method.meta = meta;
        Ok(MethodWriter {
            index,
            signature,
            return_type,
            param_count,
            stackvars: Vec::new(),
            code: Writer::new(),
            labels: Vec::new(),
            label_names: HashMap::new(),
            calls: Vec::new(),
            last_op: None,
            cursor,
        })
    }

    /// Installs a finished method body: checks every declared label was
    /// written and that control cannot fall off the end of a
    /// value-returning body (a void body gets an implicit trailing `ret`).
    pub fn finish_method(&mut self, mut writer: MethodWriter) -> Result<(), GeneratorError> {
        let name = self.data.names.name(self.data.methods[writer.index.index()].name).to_owned();
        let mut labels = Vec::with_capacity(writer.labels.len());
        for state in &writer.labels {
            match state {
                LabelState::Written(offset) => labels.push(*offset),
                LabelState::Pending(_) => {
                    return Err(GeneratorError::LabelUndefined {
                        name: name.clone(),
                        meta: writer.meta(),
                    })
                }
            }
        }
        let terminated = matches!(
            writer.last_op,
            Some(Opcode::Ret | Opcode::Retv | Opcode::Br)
        );
        if !terminated {
            if writer.return_type != TypeId::VOID {
                return Err(GeneratorError::MissingReturnValue {
                    name,
                    meta: writer.meta(),
                });
            }
            writer.begin(Opcode::Ret);
        }

        debug!(
            method = %name,
            bytes = writer.code.len(),
            stackvars = writer.stackvars.len(),
            "method defined"
        );
        let method = &mut self.data.methods[writer.index.index()];
        method.signature = writer.signature;
        method.bytecode = writer.code.into_bytes();
        method.labels = labels;
        method.stackvars = writer.stackvars.into_iter().map(StackVar::new).collect();
        method.calls = writer.calls;
        Ok(())
    }

    /// Defines a global or constant with a flat initializer list.
    pub fn define_global(
        &mut self,
        name: &str,
        is_constant: bool,
        ty: TypeId,
        inits: &[Init],
    ) -> Result<(), GeneratorError> {
        if ty.index() >= self.data.types.len() {
            return Err(GeneratorError::IndexOutOfRange {
                meta: self.source_meta(),
            });
        }
        if ty == TypeId::VOID {
            return Err(GeneratorError::InvalidVoidType {
                meta: self.source_meta(),
            });
        }
        if inits.len() > u16::MAX as usize {
            return Err(GeneratorError::InitializerOverflow {
                name: name.to_owned(),
                meta: self.source_meta(),
            });
        }
        let id = self.make_identifier(name)?;
        match self.data.names.lookup(id) {
            Lookup::Identifier => {}
            Lookup::Global(_) | Lookup::Constant(_) => {
                return Err(GeneratorError::GlobalRedefinition {
                    name: name.to_owned(),
                    meta: self.source_meta(),
                })
            }
            _ => {
                return Err(GeneratorError::IdentifierTypeMismatch {
                    name: name.to_owned(),
                    meta: self.source_meta(),
                })
            }
        }

        let table = if is_constant {
            &mut self.data.constants
        } else {
            &mut self.data.globals
        };
        let entry_index = table.entries.len() as RawIndex;
        let offset = table.data.len();
        let mut w = Writer::new();
        w.u16(inits.len() as u16);
        for init in inits {
            match init {
                Init::Value(value) => {
                    w.u8(value.type_id().raw() as u8);
                    value.write(&mut w);
                }
                Init::Method(method_name) => {
                    w.u8(TypeId::VOID.raw() as u8);
                    w.u32(method_name.raw());
                }
            }
        }
        table.data.extend_from_slice(w.as_slice());
        table.entries.push(Field {
            name: id,
            ty,
            offset,
        });
        let lookup = if is_constant {
            Lookup::Constant(entry_index)
        } else {
            Lookup::Global(entry_index)
        };
        self.data.names.bind(id, lookup);
        Ok(())
    }

    /// Finishes generation and serializes the module.
    pub fn finalize(self) -> Result<Intermediate, GeneratorError> {
        debug!(
            types = self.data.types.len(),
            methods = self.data.methods.len(),
            signatures = self.data.signatures.len(),
            "module finalized"
        );
        Ok(Intermediate::from_module(&self.data))
    }

    pub(crate) fn data(&self) -> &ModuleData {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_type_is_idempotent() {
        let mut gen = Generator::new("test");
        let a = gen.declare_type("Vec2").unwrap();
        let b = gen.declare_type("Vec2").unwrap();
        assert_eq!(a, b);
        assert_eq!(gen.declare_type("i32").unwrap(), TypeId::I32);
        assert_eq!(gen.declare_type("word").unwrap(), TypeId::U64);
    }

    #[test]
    fn double_definition_fails() {
        let mut gen = Generator::new("test");
        let ty = gen.declare_type("Vec2").unwrap();
        let writer = gen.define_type(ty, false).unwrap();
        gen.finish_type(writer).unwrap();
        assert!(matches!(
            gen.define_type(ty, false),
            Err(GeneratorError::TypeRedefinition { .. })
        ));
    }

    #[test]
    fn kind_collisions_are_rejected() {
        let mut gen = Generator::new("test");
        gen.declare_method("Thing").unwrap();
        assert!(matches!(
            gen.declare_type("Thing"),
            Err(GeneratorError::IdentifierTypeMismatch { .. })
        ));
        assert!(matches!(
            gen.define_global("Thing", false, TypeId::I32, &[]),
            Err(GeneratorError::IdentifierTypeMismatch { .. })
        ));
    }

    #[test]
    fn zero_length_arrays_are_rejected() {
        let mut gen = Generator::new("test");
        assert!(matches!(
            gen.declare_array_type(TypeId::I32, 0),
            Err(GeneratorError::ArrayLengthZero { .. })
        ));
    }

    #[test]
    fn labels_back_patch() {
        let mut gen = Generator::new("test");
        let m = gen.declare_method("loop_forever").unwrap();
        let sig = gen.make_signature(TypeId::VOID, &[]).unwrap();
        let mut w = gen.define_method(m, sig).unwrap();
        let top = w.declare_label("top");
        w.write_br(top);
        w.write_label(top).unwrap();
        w.write_noop();
        w.write_br(top);
        gen.finish_method(w).unwrap();

        let method = gen.data().method(m);
        // Forward reference patched to the label position.
        let target = kiln_types::bytes::read_u32(&method.bytecode[1..]);
        assert_eq!(target as usize, 5);
        assert_eq!(method.labels, vec![5]);
    }

    #[test]
    fn writing_a_label_twice_fails() {
        let mut gen = Generator::new("test");
        let m = gen.declare_method("m").unwrap();
        let sig = gen.make_signature(TypeId::VOID, &[]).unwrap();
        let mut w = gen.define_method(m, sig).unwrap();
        let label = w.declare_label("l");
        w.write_label(label).unwrap();
        assert!(matches!(
            w.write_label(label),
            Err(GeneratorError::LabelRedefinition { .. })
        ));
    }

    #[test]
    fn unwritten_label_fails_at_finish() {
        let mut gen = Generator::new("test");
        let m = gen.declare_method("m").unwrap();
        let sig = gen.make_signature(TypeId::VOID, &[]).unwrap();
        let mut w = gen.define_method(m, sig).unwrap();
        let label = w.declare_label("nowhere");
        w.write_br(label);
        assert!(matches!(
            gen.finish_method(w),
            Err(GeneratorError::LabelUndefined { .. })
        ));
    }

    #[test]
    fn missing_return_value_fails_at_finish() {
        let mut gen = Generator::new("test");
        let m = gen.declare_method("answer").unwrap();
        let sig = gen.make_signature(TypeId::I32, &[]).unwrap();
        let mut w = gen.define_method(m, sig).unwrap();
        w.write_noop();
        assert!(matches!(
            gen.finish_method(w),
            Err(GeneratorError::MissingReturnValue { .. })
        ));
    }

    #[test]
    fn stack_and_param_indices_are_checked() {
        let mut gen = Generator::new("test");
        let m = gen.declare_method("m").unwrap();
        let sig = gen.make_signature(TypeId::VOID, &[TypeId::I32]).unwrap();
        let mut w = gen.define_method(m, sig).unwrap();
        w.set_stack(&[TypeId::I32]).unwrap();
        assert!(w.write_set(Operand::stack(0), Operand::param(0)).is_ok());
        assert!(matches!(
            w.write_set(Operand::stack(1), Operand::param(0)),
            Err(GeneratorError::StackIndexOutOfRange { index: 1, .. })
        ));
        assert!(matches!(
            w.write_set(Operand::stack(0), Operand::param(1)),
            Err(GeneratorError::ParamIndexOutOfRange { index: 1, .. })
        ));
    }

    #[test]
    fn constants_cannot_be_written() {
        let mut gen = Generator::new("test");
        let m = gen.declare_method("m").unwrap();
        let sig = gen.make_signature(TypeId::VOID, &[]).unwrap();
        let mut w = gen.define_method(m, sig).unwrap();
        assert!(matches!(
            w.write_set(Operand::constant(1i32), Operand::constant(2i32)),
            Err(GeneratorError::InvalidConstant { .. })
        ));
    }

    #[test]
    fn ret_in_value_method_fails() {
        let mut gen = Generator::new("test");
        let m = gen.declare_method("m").unwrap();
        let sig = gen.make_signature(TypeId::I32, &[]).unwrap();
        let mut w = gen.define_method(m, sig).unwrap();
        assert!(matches!(
            w.write_ret(),
            Err(GeneratorError::InvalidReturnValue { .. })
        ));
        w.write_retv(Operand::constant(0i32)).unwrap();
        gen.finish_method(w).unwrap();
    }

    #[test]
    fn globals_encode_flat_initializers() {
        let mut gen = Generator::new("test");
        let arr = gen.declare_array_type(TypeId::I32, 2).unwrap();
        gen.define_global(
            "pair",
            true,
            arr,
            &[Init::from(1i32), Init::from(2i32)],
        )
        .unwrap();
        let table = &gen.data().constants;
        assert_eq!(table.entries.len(), 1);
        // u16 count + 2 * (tag + 4 bytes)
        assert_eq!(table.data.len(), 2 + 2 * 5);
        assert!(matches!(
            gen.define_global("pair", true, arr, &[]),
            Err(GeneratorError::GlobalRedefinition { .. })
        ));
    }
}
