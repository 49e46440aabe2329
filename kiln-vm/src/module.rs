//! In-memory module data model shared by the generator, merger and linker.
//!
//! Cross-entity references are indices, never pointers; every table is owned
//! by the enclosing [`ModuleData`]. The same model serves the mergeable
//! intermediate form (sizes and offsets unresolved) and, after the linker has
//! run, the executable assembly form.

use std::collections::BTreeMap;
use std::collections::HashMap;

use bitflags::bitflags;
use itertools::Itertools;
use kiln_types::{
    BaseType, MetaId, MethodId, NameId, OffsetId, RawIndex, SignatureId, SourceMeta, TypeId,
};

use crate::database::{Lookup, MetaTable, NameTable};

bitflags! {
    /// State of a type definition. The low bits describe what the type is;
    /// the high bits track definition and link-time resolution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u32 {
        /// Fields overlap at offset zero.
        const UNION = 1 << 0;
        /// Declared by the host, body unknown to the toolchain.
        const EXTERNAL = 1 << 1;
        /// Generated pointer type.
        const POINTER = 1 << 8;
        /// Generated fixed-length array type.
        const ARRAY = 1 << 9;
        /// Generated function-pointer type.
        const SIGNATURE = 1 << 10;
        /// A body has been supplied.
        const DEFINED = 1 << 24;
        /// Resolution in progress (cycle detection).
        const RESOLVING = 1 << 25;
        /// Size and field offsets are final.
        const RESOLVED = 1 << 26;
    }
}

impl TypeFlags {
    /// Any of the generated kinds.
    pub const GENERATED: Self = Self::POINTER.union(Self::ARRAY).union(Self::SIGNATURE);
}

bitflags! {
    /// State of a method definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MethodFlags: u32 {
        /// Dispatches into a host library instead of bytecode.
        const EXTERNAL = 1 << 1;
        /// A body has been supplied.
        const DEFINED = 1 << 24;
        /// Link-time validation has run.
        const RESOLVED = 1 << 26;
    }
}

/// Source metadata reference carried by types and methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    /// Interned file name, invalid when the front-end supplied none.
    pub index: MetaId,
    /// 1-based line number.
    pub line: u32,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            index: MetaId::INVALID,
            line: 0,
        }
    }
}

/// Payload of a generated type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generated {
    /// Pointer to `pointee`; `pointee_size` is filled in by the linker and
    /// used for pointer arithmetic.
    Pointer {
        /// Pointed-to type.
        pointee: TypeId,
        /// Resolved size of the pointee in bytes.
        pointee_size: usize,
    },
    /// Fixed-length array.
    Array {
        /// Element type.
        elem: TypeId,
        /// Element count, never zero.
        len: usize,
    },
    /// Function pointer of a signature.
    Signature(SignatureId),
}

/// A named, typed slot at a byte offset; struct fields and data table
/// entries share this shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Field name.
    pub name: NameId,
    /// Field type.
    pub ty: TypeId,
    /// Byte offset from the front of the enclosing aggregate or data block.
    pub offset: usize,
}

/// A typed stack slot (local variable or parameter) at a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackVar {
    /// Slot type.
    pub ty: TypeId,
    /// Byte offset from the front of the locals or parameter area.
    pub offset: usize,
}

impl StackVar {
    /// Slot of `ty` with an offset the linker still has to assign.
    pub fn new(ty: TypeId) -> Self {
        Self { ty, offset: 0 }
    }
}

/// A type definition or declaration.
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// Interned name; invalid for generated types.
    pub name: NameId,
    /// Own index.
    pub index: TypeId,
    /// Kind and state flags.
    pub flags: TypeFlags,
    /// Generated payload, present iff one of the generated flags is set.
    pub generated: Option<Generated>,
    /// Declared fields, offsets assigned by the linker.
    pub fields: Vec<Field>,
    /// Total byte size, resolved by the linker.
    pub total_size: usize,
    /// Cached pointer-to-this type index.
    pub pointer_type: TypeId,
    /// Cached array types of this element type, per length.
    pub array_types: BTreeMap<usize, TypeId>,
    /// Declaration site.
    pub meta: Meta,
}

impl TypeDef {
    /// Named, not-yet-defined type.
    pub fn declared(name: NameId, index: TypeId) -> Self {
        Self {
            name,
            index,
            flags: TypeFlags::empty(),
            generated: None,
            fields: Vec::new(),
            total_size: 0,
            pointer_type: TypeId::INVALID,
            array_types: BTreeMap::new(),
            meta: Meta::default(),
        }
    }

    /// Entry for one of the built-in base types.
    pub fn base(name: NameId, base: BaseType) -> Self {
        let mut def = Self::declared(name, base.type_id());
        def.flags = TypeFlags::DEFINED | TypeFlags::RESOLVED;
        def.total_size = base.size();
        if base == BaseType::Void {
            // `void*` degenerates to the untyped pointer.
            def.pointer_type = TypeId::VPTR;
        }
        if base == BaseType::VPtr {
            def.generated = Some(Generated::Pointer {
                pointee: TypeId::VOID,
                pointee_size: 0,
            });
        }
        def
    }

    /// Generated pointer to `pointee`.
    pub fn pointer(index: TypeId, pointee: TypeId) -> Self {
        let mut def = Self::declared(NameId::INVALID, index);
        def.flags = TypeFlags::POINTER | TypeFlags::DEFINED;
        def.generated = Some(Generated::Pointer {
            pointee,
            pointee_size: 0,
        });
        def
    }

    /// Generated array of `len` elements.
    pub fn array(index: TypeId, elem: TypeId, len: usize) -> Self {
        let mut def = Self::declared(NameId::INVALID, index);
        def.flags = TypeFlags::ARRAY | TypeFlags::DEFINED;
        def.generated = Some(Generated::Array { elem, len });
        def
    }

    /// Generated function-pointer type of `signature`.
    pub fn signature(index: TypeId, signature: SignatureId) -> Self {
        let mut def = Self::declared(NameId::INVALID, index);
        def.flags = TypeFlags::SIGNATURE | TypeFlags::DEFINED;
        def.generated = Some(Generated::Signature(signature));
        def
    }

    /// Whether this is one of the base types.
    pub fn is_base(&self) -> bool {
        self.index.is_base()
    }

    /// Integral base type.
    pub fn is_integral(&self) -> bool {
        self.index.is_integral()
    }

    /// Floating-point base type.
    pub fn is_float(&self) -> bool {
        self.index.is_float()
    }

    /// Arithmetic base type.
    pub fn is_arithmetic(&self) -> bool {
        self.index.is_arithmetic()
    }

    /// Generated pointer type, or `vptr`.
    pub fn is_pointer(&self) -> bool {
        self.flags.contains(TypeFlags::POINTER) || self.index == TypeId::VPTR
    }

    /// Generated array type.
    pub fn is_array(&self) -> bool {
        self.flags.contains(TypeFlags::ARRAY)
    }

    /// Generated function-pointer type.
    pub fn is_signature(&self) -> bool {
        self.flags.contains(TypeFlags::SIGNATURE)
    }

    /// Any generated kind.
    pub fn is_generated(&self) -> bool {
        self.flags.intersects(TypeFlags::GENERATED)
    }

    /// User-declared struct or union.
    pub fn is_struct(&self) -> bool {
        !self.is_arithmetic() && !self.is_generated() && !self.is_base()
    }

    /// Union layout.
    pub fn is_union(&self) -> bool {
        self.flags.contains(TypeFlags::UNION)
    }

    /// Whether a body has been supplied.
    pub fn is_defined(&self) -> bool {
        self.flags.contains(TypeFlags::DEFINED)
    }

    /// Whether link-time resolution has completed.
    pub fn is_resolved(&self) -> bool {
        self.flags.contains(TypeFlags::RESOLVED)
    }

    /// Pointee of a pointer type.
    pub fn pointee(&self) -> Option<TypeId> {
        match self.generated {
            Some(Generated::Pointer { pointee, .. }) => Some(pointee),
            _ => None,
        }
    }
}

/// A signature: return type plus parameter layout.
#[derive(Debug, Clone)]
pub struct SignatureDef {
    /// Own index.
    pub index: SignatureId,
    /// Return type, `void` for none.
    pub return_type: TypeId,
    /// Parameters; offsets assigned by the linker.
    pub parameters: Vec<StackVar>,
    /// Total parameter bytes, assigned by the linker.
    pub parameters_size: usize,
    /// Cached function-pointer type of this signature.
    pub signature_type: TypeId,
}

impl SignatureDef {
    /// New signature; deduplication happens at the [`ModuleData`] level.
    pub fn new(index: SignatureId, return_type: TypeId, parameters: Vec<StackVar>) -> Self {
        Self {
            index,
            return_type,
            parameters,
            parameters_size: 0,
            signature_type: TypeId::INVALID,
        }
    }

    /// Whether the signature returns a value.
    pub fn has_return_value(&self) -> bool {
        self.return_type != TypeId::VOID
    }

    /// Structural dedup key.
    pub fn key(&self) -> Vec<RawIndex> {
        let mut key = Vec::with_capacity(self.parameters.len() + 1);
        key.push(self.return_type.raw());
        key.extend(self.parameters.iter().map(|p| p.ty.raw()));
        key
    }
}

/// A field-name chain rooted at a type, the intermediate form of a field
/// access path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAddress {
    /// Type the chain starts from.
    pub root: TypeId,
    /// Field names walked in order.
    pub fields: Vec<NameId>,
}

impl FieldAddress {
    /// Structural dedup key.
    pub fn key(&self) -> Vec<RawIndex> {
        let mut key = Vec::with_capacity(self.fields.len() + 1);
        key.push(self.root.raw());
        key.extend(self.fields.iter().map(|f| f.raw()));
        key
    }
}

/// A field address resolved to a resulting type and byte offset.
#[derive(Debug, Clone)]
pub struct FieldOffset {
    /// The unresolved chain.
    pub address: FieldAddress,
    /// Resulting field type, resolved by the linker.
    pub ty: TypeId,
    /// Byte offset from the root type, resolved by the linker.
    pub offset: usize,
}

/// A method definition or declaration.
#[derive(Debug, Clone)]
pub struct MethodDef {
    /// Interned name.
    pub name: NameId,
    /// Own index.
    pub index: MethodId,
    /// Kind and state flags.
    pub flags: MethodFlags,
    /// Signature index.
    pub signature: SignatureId,
    /// Instruction stream. For an external method this is exactly the
    /// `(library, call)` pair written by the linker.
    pub bytecode: Vec<u8>,
    /// Label positions as byte offsets into the bytecode.
    pub labels: Vec<u32>,
    /// Local stack variables; offsets assigned by the linker.
    pub stackvars: Vec<StackVar>,
    /// Total bytes of the locals area, assigned by the linker.
    pub stack_size: usize,
    /// Methods this body calls, kept for link-time validation.
    pub calls: Vec<MethodId>,
    /// Declaration site.
    pub meta: Meta,
}

impl MethodDef {
    /// Named, not-yet-defined method.
    pub fn declared(name: NameId, index: MethodId) -> Self {
        Self {
            name,
            index,
            flags: MethodFlags::empty(),
            signature: SignatureId::INVALID,
            bytecode: Vec::new(),
            labels: Vec::new(),
            stackvars: Vec::new(),
            stack_size: 0,
            calls: Vec::new(),
            meta: Meta::default(),
        }
    }

    /// Whether this method dispatches into a host library.
    pub fn is_external(&self) -> bool {
        self.flags.contains(MethodFlags::EXTERNAL)
    }

    /// Whether a body has been supplied.
    pub fn is_defined(&self) -> bool {
        self.flags.contains(MethodFlags::DEFINED)
    }
}

/// Data table of either globals or constants: entries plus one contiguous
/// initializer byte block.
///
/// Initializer encoding per entry, starting at the entry's offset:
/// `u16 count`, then `count` times a `u8` base-type tag followed by the
/// literal bytes; a `void` tag introduces a `NameId` naming a method (or the
/// invalid id for `null`) destined for a signature-typed slot.
#[derive(Debug, Default, Clone)]
pub struct DataTable {
    /// Entry descriptors; offsets point into `data`.
    pub entries: Vec<Field>,
    /// Packed initializer data.
    pub data: Vec<u8>,
}

/// The complete in-memory module.
#[derive(Debug, Clone)]
pub struct ModuleData {
    /// Type table; indices `0..12` are the base types.
    pub types: Vec<TypeDef>,
    /// Method table.
    pub methods: Vec<MethodDef>,
    /// Signature table.
    pub signatures: Vec<SignatureDef>,
    /// Field offset table.
    pub offsets: Vec<FieldOffset>,
    /// Mutable global data.
    pub globals: DataTable,
    /// Immutable constant data.
    pub constants: DataTable,
    /// Identifier database.
    pub names: NameTable,
    /// Metadata string table.
    pub metas: MetaTable,

    /// Structural lookup of signatures, rebuilt after deserialization.
    pub signature_lookup: HashMap<Vec<RawIndex>, SignatureId>,
    /// Structural lookup of field offsets, rebuilt after deserialization.
    pub offset_lookup: HashMap<Vec<RawIndex>, OffsetId>,
}

impl Default for ModuleData {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleData {
    /// Module with the base types and their aliases installed.
    pub fn new() -> Self {
        let mut data = Self {
            types: Vec::with_capacity(BaseType::COUNT),
            methods: Vec::new(),
            signatures: Vec::new(),
            offsets: Vec::new(),
            globals: DataTable::default(),
            constants: DataTable::default(),
            names: NameTable::new(),
            metas: MetaTable::new(),
            signature_lookup: HashMap::new(),
            offset_lookup: HashMap::new(),
        };
        data.initialize_base_types();
        data
    }

    fn initialize_base_types(&mut self) {
        use strum::IntoEnumIterator;
        for base in BaseType::iter() {
            let name = self
                .names
                .intern_with(&base.to_string(), Lookup::Type(base.type_id()));
            self.types.push(TypeDef::base(name, base));
        }
        for (alias, base) in BaseType::ALIASES {
            self.names.intern_with(alias, Lookup::Type(base.type_id()));
        }
    }

    /// Type table entry.
    pub fn ty(&self, id: TypeId) -> &TypeDef {
        &self.types[id.index()]
    }

    /// Mutable type table entry.
    pub fn ty_mut(&mut self, id: TypeId) -> &mut TypeDef {
        &mut self.types[id.index()]
    }

    /// Method table entry.
    pub fn method(&self, id: MethodId) -> &MethodDef {
        &self.methods[id.index()]
    }

    /// Mutable method table entry.
    pub fn method_mut(&mut self, id: MethodId) -> &mut MethodDef {
        &mut self.methods[id.index()]
    }

    /// Signature table entry.
    pub fn signature(&self, id: SignatureId) -> &SignatureDef {
        &self.signatures[id.index()]
    }

    /// Field offset table entry.
    pub fn offset(&self, id: OffsetId) -> &FieldOffset {
        &self.offsets[id.index()]
    }

    /// Pointer type of `base`, creating and caching it on first use.
    pub fn pointer_to(&mut self, base: TypeId) -> TypeId {
        let cached = self.types[base.index()].pointer_type;
        if cached.is_valid() {
            return cached;
        }
        let index = TypeId::new(self.types.len() as RawIndex);
        self.types.push(TypeDef::pointer(index, base));
        self.types[base.index()].pointer_type = index;
        index
    }

    /// Array type of `elem` with `len` elements, creating and caching it on
    /// first use. Zero lengths are rejected by the generator before this.
    pub fn array_of(&mut self, elem: TypeId, len: usize) -> TypeId {
        if let Some(&cached) = self.types[elem.index()].array_types.get(&len) {
            return cached;
        }
        let index = TypeId::new(self.types.len() as RawIndex);
        self.types.push(TypeDef::array(index, elem, len));
        self.types[elem.index()].array_types.insert(len, index);
        index
    }

    /// Function-pointer type of `signature`, creating and caching it on
    /// first use.
    pub fn signature_type_of(&mut self, signature: SignatureId) -> TypeId {
        let cached = self.signatures[signature.index()].signature_type;
        if cached.is_valid() {
            return cached;
        }
        let index = TypeId::new(self.types.len() as RawIndex);
        self.types.push(TypeDef::signature(index, signature));
        self.signatures[signature.index()].signature_type = index;
        index
    }

    /// Signature with the given shape, structurally deduplicated.
    pub fn make_signature(&mut self, return_type: TypeId, parameters: Vec<StackVar>) -> SignatureId {
        let candidate = SignatureDef::new(SignatureId::INVALID, return_type, parameters);
        let key = candidate.key();
        if let Some(&existing) = self.signature_lookup.get(&key) {
            return existing;
        }
        let index = SignatureId::new(self.signatures.len() as RawIndex);
        let mut def = candidate;
        def.index = index;
        self.signatures.push(def);
        self.signature_lookup.insert(key, index);
        index
    }

    /// Field offset entry for a chain, structurally deduplicated.
    pub fn make_offset(&mut self, address: FieldAddress) -> OffsetId {
        let key = address.key();
        if let Some(&existing) = self.offset_lookup.get(&key) {
            return existing;
        }
        let index = OffsetId::new(self.offsets.len() as RawIndex);
        self.offsets.push(FieldOffset {
            address,
            ty: TypeId::INVALID,
            offset: 0,
        });
        self.offset_lookup.insert(key, index);
        index
    }

    /// Rebuilds the structural lookup maps after deserialization.
    pub fn restore_lookup_tables(&mut self) {
        self.signature_lookup = self
            .signatures
            .iter()
            .map(|sig| (sig.key(), sig.index))
            .collect();
        self.offset_lookup = self
            .offsets
            .iter()
            .enumerate()
            .map(|(i, off)| (off.address.key(), OffsetId::new(i as RawIndex)))
            .collect();
    }

    /// Rebuilds the generated-type caches after deserialization.
    pub fn restore_generated_types(&mut self) {
        for i in 0..self.types.len() {
            let index = self.types[i].index;
            match self.types[i].generated {
                Some(Generated::Pointer { pointee, .. }) if !self.types[i].is_base() => {
                    self.types[pointee.index()].pointer_type = index;
                }
                Some(Generated::Array { elem, len }) => {
                    self.types[elem.index()].array_types.insert(len, index);
                }
                Some(Generated::Signature(sig)) => {
                    self.signatures[sig.index()].signature_type = index;
                }
                _ => {}
            }
        }
    }

    /// Source meta of a type, for diagnostics.
    pub fn type_meta(&self, id: TypeId) -> SourceMeta {
        self.resolve_meta(self.ty(id).meta)
    }

    /// Source meta of a method, for diagnostics.
    pub fn method_meta(&self, id: MethodId) -> SourceMeta {
        self.resolve_meta(self.method(id).meta)
    }

    /// Turns a [`Meta`] reference into an owned [`SourceMeta`].
    pub fn resolve_meta(&self, meta: Meta) -> SourceMeta {
        SourceMeta {
            file: self.metas.get(meta.index).map(str::to_owned),
            line: meta.line,
        }
    }

    /// Human-readable name of a type; generated types get a structural
    /// rendering (`i32*`, `i32[4]`, `i32(i32,i32)`).
    pub fn type_name(&self, id: TypeId) -> String {
        let ty = self.ty(id);
        match ty.generated {
            Some(Generated::Pointer { pointee, .. }) if !ty.is_base() => {
                format!("{}*", self.type_name(pointee))
            }
            Some(Generated::Array { elem, len }) => {
                format!("{}[{len}]", self.type_name(elem))
            }
            Some(Generated::Signature(sig)) => {
                let sig = self.signature(sig);
                let params = sig.parameters.iter().map(|p| self.type_name(p.ty)).join(",");
                format!("{}({params})", self.type_name(sig.return_type))
            }
            _ => self.names.name_or(ty.name, "<anonymous>").to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_module_has_base_types() {
        let data = ModuleData::new();
        assert_eq!(data.types.len(), BaseType::COUNT);
        assert_eq!(data.ty(TypeId::I32).total_size, 4);
        assert_eq!(data.ty(TypeId::VOID).total_size, 0);
        assert_eq!(data.names.find("i32"), Some(data.ty(TypeId::I32).name));
        // Aliases resolve to base types without new entries.
        let word = data.names.find("word").unwrap();
        assert_eq!(data.names.lookup(word), Lookup::Type(TypeId::U64));
    }

    #[test]
    fn generated_types_deduplicate() {
        let mut data = ModuleData::new();
        let p1 = data.pointer_to(TypeId::I32);
        let p2 = data.pointer_to(TypeId::I32);
        assert_eq!(p1, p2);

        let a1 = data.array_of(TypeId::I32, 4);
        let a2 = data.array_of(TypeId::I32, 4);
        let a3 = data.array_of(TypeId::I32, 5);
        assert_eq!(a1, a2);
        assert_ne!(a1, a3);

        let sig = data.make_signature(TypeId::I32, vec![StackVar::new(TypeId::I32)]);
        let s1 = data.signature_type_of(sig);
        let s2 = data.signature_type_of(sig);
        assert_eq!(s1, s2);
    }

    #[test]
    fn signatures_deduplicate_structurally() {
        let mut data = ModuleData::new();
        let a = data.make_signature(
            TypeId::I32,
            vec![StackVar::new(TypeId::I32), StackVar::new(TypeId::I32)],
        );
        let b = data.make_signature(
            TypeId::I32,
            vec![StackVar::new(TypeId::I32), StackVar::new(TypeId::I32)],
        );
        let c = data.make_signature(TypeId::VOID, vec![]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn offsets_deduplicate_structurally() {
        let mut data = ModuleData::new();
        let root = TypeId::new(12);
        let field = NameId::new(3);
        let a = data.make_offset(FieldAddress {
            root,
            fields: vec![field],
        });
        let b = data.make_offset(FieldAddress {
            root,
            fields: vec![field],
        });
        assert_eq!(a, b);
        assert_eq!(data.offsets.len(), 1);
    }

    #[test]
    fn lookup_restore_round_trips() {
        let mut data = ModuleData::new();
        let sig = data.make_signature(TypeId::I64, vec![StackVar::new(TypeId::F32)]);
        data.signature_lookup.clear();
        data.restore_lookup_tables();
        assert_eq!(
            data.make_signature(TypeId::I64, vec![StackVar::new(TypeId::F32)]),
            sig
        );
    }

    #[test]
    fn structural_type_names() {
        let mut data = ModuleData::new();
        let ptr = data.pointer_to(TypeId::I32);
        let arr = data.array_of(TypeId::F64, 3);
        let sig = data.make_signature(TypeId::VOID, vec![StackVar::new(TypeId::U8)]);
        let sig_ty = data.signature_type_of(sig);
        assert_eq!(data.type_name(ptr), "i32*");
        assert_eq!(data.type_name(arr), "f64[3]");
        assert_eq!(data.type_name(sig_ty), "void(u8)");
        assert_eq!(data.type_name(TypeId::VPTR), "vptr");
    }
}
