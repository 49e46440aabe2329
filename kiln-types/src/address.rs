use crate::{RawIndex, TypeId};

/// Where an address resolves its base location from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AddressKind {
    /// A stack variable of the current frame (the all-ones index is the
    /// return-value slot).
    StackVar = 0,
    /// A parameter of the current frame.
    Parameter = 1,
    /// A global or constant data table entry.
    Global = 2,
    /// An inline constant; the index field holds the literal's base type.
    Constant = 3,
}

/// Operator applied after base + modifier resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AddressPrefix {
    /// No prefix.
    None = 0,
    /// `*x` pointer indirection.
    Indirection = 1,
    /// `&x` address-of.
    AddressOf = 2,
    /// `!x` size-of.
    SizeOf = 3,
}

/// Access path applied to the base location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AddressModifier {
    /// No modifier.
    None = 0,
    /// `.field`, the payload holds an offset index.
    DirectField = 1,
    /// `->field`, the payload holds an offset index.
    IndirectField = 2,
    /// `[n]`, the payload holds a signed element offset.
    Subscript = 3,
}

/// Packed 32-bit address header.
///
/// Bit layout, from the most significant bit down:
///
/// ```text
/// | kind:2 | prefix:2 | modifier:2 | index:26 |
/// ```
///
/// The all-ones index denotes the return-value slot of the current frame.
/// Constant addresses reuse the index field for the literal's base type and
/// inline the literal bytes after the header in the bytecode stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AddressHeader(u32);

static_assertions::assert_eq_size!(AddressHeader, u32);

impl AddressHeader {
    /// Bits available for the index field.
    pub const INDEX_BITS: u32 = 26;

    /// Largest encodable index; doubles as the return-value slot marker.
    pub const INDEX_MAX: RawIndex = (1 << Self::INDEX_BITS) - 1;

    const FLAG_MASK: u32 = 0b11;
    const KIND_SHIFT: u32 = 30;
    const PREFIX_SHIFT: u32 = 28;
    const MODIFIER_SHIFT: u32 = 26;

    /// Packs the four fields into a header.
    pub const fn new(
        kind: AddressKind,
        prefix: AddressPrefix,
        modifier: AddressModifier,
        index: RawIndex,
    ) -> Self {
        let mut value = index & Self::INDEX_MAX;
        value |= (kind as u32 & Self::FLAG_MASK) << Self::KIND_SHIFT;
        value |= (prefix as u32 & Self::FLAG_MASK) << Self::PREFIX_SHIFT;
        value |= (modifier as u32 & Self::FLAG_MASK) << Self::MODIFIER_SHIFT;
        Self(value)
    }

    /// Header of an inline constant of base type `ty`.
    pub const fn constant(ty: TypeId) -> Self {
        Self::new(
            AddressKind::Constant,
            AddressPrefix::None,
            AddressModifier::None,
            ty.raw(),
        )
    }

    /// Header from its raw bit representation.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Address kind field.
    pub const fn kind(self) -> AddressKind {
        match (self.0 >> Self::KIND_SHIFT) & Self::FLAG_MASK {
            0 => AddressKind::StackVar,
            1 => AddressKind::Parameter,
            2 => AddressKind::Global,
            _ => AddressKind::Constant,
        }
    }

    /// Prefix operator field.
    pub const fn prefix(self) -> AddressPrefix {
        match (self.0 >> Self::PREFIX_SHIFT) & Self::FLAG_MASK {
            0 => AddressPrefix::None,
            1 => AddressPrefix::Indirection,
            2 => AddressPrefix::AddressOf,
            _ => AddressPrefix::SizeOf,
        }
    }

    /// Modifier field.
    pub const fn modifier(self) -> AddressModifier {
        match (self.0 >> Self::MODIFIER_SHIFT) & Self::FLAG_MASK {
            0 => AddressModifier::None,
            1 => AddressModifier::DirectField,
            2 => AddressModifier::IndirectField,
            _ => AddressModifier::Subscript,
        }
    }

    /// Index field.
    pub const fn index(self) -> RawIndex {
        self.0 & Self::INDEX_MAX
    }

    /// Whether the index denotes the return-value slot.
    pub const fn is_return_slot(self) -> bool {
        matches!(self.kind(), AddressKind::StackVar) && self.index() == Self::INDEX_MAX
    }

    /// Replaces the kind field.
    pub fn set_kind(&mut self, kind: AddressKind) {
        self.0 &= !(Self::FLAG_MASK << Self::KIND_SHIFT);
        self.0 |= (kind as u32 & Self::FLAG_MASK) << Self::KIND_SHIFT;
    }

    /// Replaces the prefix field.
    pub fn set_prefix(&mut self, prefix: AddressPrefix) {
        self.0 &= !(Self::FLAG_MASK << Self::PREFIX_SHIFT);
        self.0 |= (prefix as u32 & Self::FLAG_MASK) << Self::PREFIX_SHIFT;
    }

    /// Replaces the modifier field.
    pub fn set_modifier(&mut self, modifier: AddressModifier) {
        self.0 &= !(Self::FLAG_MASK << Self::MODIFIER_SHIFT);
        self.0 |= (modifier as u32 & Self::FLAG_MASK) << Self::MODIFIER_SHIFT;
    }

    /// Replaces the index field.
    pub fn set_index(&mut self, index: RawIndex) {
        self.0 &= !Self::INDEX_MAX;
        self.0 |= index & Self::INDEX_MAX;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [AddressKind; 4] = [
        AddressKind::StackVar,
        AddressKind::Parameter,
        AddressKind::Global,
        AddressKind::Constant,
    ];
    const PREFIXES: [AddressPrefix; 4] = [
        AddressPrefix::None,
        AddressPrefix::Indirection,
        AddressPrefix::AddressOf,
        AddressPrefix::SizeOf,
    ];
    const MODIFIERS: [AddressModifier; 4] = [
        AddressModifier::None,
        AddressModifier::DirectField,
        AddressModifier::IndirectField,
        AddressModifier::Subscript,
    ];

    #[test]
    fn encode_decode_all_field_combinations() {
        for kind in KINDS {
            for prefix in PREFIXES {
                for modifier in MODIFIERS {
                    for index in [0, 1, 0x155_5555, AddressHeader::INDEX_MAX - 1] {
                        let header = AddressHeader::new(kind, prefix, modifier, index);
                        assert_eq!(header.kind(), kind);
                        assert_eq!(header.prefix(), prefix);
                        assert_eq!(header.modifier(), modifier);
                        assert_eq!(header.index(), index);
                    }
                }
            }
        }
    }

    #[test]
    fn index_does_not_bleed_into_flags() {
        let header = AddressHeader::new(
            AddressKind::StackVar,
            AddressPrefix::None,
            AddressModifier::None,
            RawIndex::MAX,
        );
        assert_eq!(header.index(), AddressHeader::INDEX_MAX);
        assert_eq!(header.kind(), AddressKind::StackVar);
        assert!(header.is_return_slot());
    }

    #[test]
    fn setters_replace_single_fields() {
        let mut header = AddressHeader::new(
            AddressKind::Global,
            AddressPrefix::AddressOf,
            AddressModifier::Subscript,
            42,
        );
        header.set_index(7);
        header.set_prefix(AddressPrefix::None);
        assert_eq!(header.kind(), AddressKind::Global);
        assert_eq!(header.prefix(), AddressPrefix::None);
        assert_eq!(header.modifier(), AddressModifier::Subscript);
        assert_eq!(header.index(), 7);
    }

    #[test]
    fn constant_header_stores_base_type() {
        let header = AddressHeader::constant(TypeId::F32);
        assert_eq!(header.kind(), AddressKind::Constant);
        assert_eq!(header.index(), TypeId::F32.raw());
    }
}
