use crate::{TypeId, WORD_SIZE};

/// The built-in scalar types plus `void`, in table order. The discriminant of
/// each variant equals its [`TypeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum BaseType {
    /// 8-bit signed integer.
    I8 = 0,
    /// 8-bit unsigned integer.
    U8 = 1,
    /// 16-bit signed integer.
    I16 = 2,
    /// 16-bit unsigned integer.
    U16 = 3,
    /// 32-bit signed integer.
    I32 = 4,
    /// 32-bit unsigned integer.
    U32 = 5,
    /// 64-bit signed integer.
    I64 = 6,
    /// 64-bit unsigned integer.
    U64 = 7,
    /// 32-bit IEEE 754 float.
    F32 = 8,
    /// 64-bit IEEE 754 float.
    F64 = 9,
    /// Untyped pointer.
    VPtr = 10,
    /// The unit of absent values; zero-sized.
    Void = 11,
}

impl BaseType {
    /// Number of base types, including `void`.
    pub const COUNT: usize = 12;

    /// Byte sizes in table order.
    pub const SIZES: [usize; Self::COUNT] = [1, 1, 2, 2, 4, 4, 8, 8, 4, 8, WORD_SIZE, 0];

    /// Aliases resolving to base types: `word` and `offset` of the 64-bit
    /// machine model.
    pub const ALIASES: [(&'static str, BaseType); 2] =
        [("word", BaseType::U64), ("offset", BaseType::I64)];

    /// The base type behind `type_id`, if it is one.
    pub const fn from_type(type_id: TypeId) -> Option<Self> {
        Self::from_raw(type_id.raw())
    }

    const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::I8),
            1 => Some(Self::U8),
            2 => Some(Self::I16),
            3 => Some(Self::U16),
            4 => Some(Self::I32),
            5 => Some(Self::U32),
            6 => Some(Self::I64),
            7 => Some(Self::U64),
            8 => Some(Self::F32),
            9 => Some(Self::F64),
            10 => Some(Self::VPtr),
            11 => Some(Self::Void),
            _ => None,
        }
    }

    /// The type index of this base type.
    pub const fn type_id(self) -> TypeId {
        TypeId::new(self as u32)
    }

    /// Byte size of this base type.
    pub const fn size(self) -> usize {
        Self::SIZES[self as usize]
    }
}

impl TypeId {
    /// `i8`
    pub const I8: TypeId = TypeId::new(0);
    /// `u8`
    pub const U8: TypeId = TypeId::new(1);
    /// `i16`
    pub const I16: TypeId = TypeId::new(2);
    /// `u16`
    pub const U16: TypeId = TypeId::new(3);
    /// `i32`
    pub const I32: TypeId = TypeId::new(4);
    /// `u32`
    pub const U32: TypeId = TypeId::new(5);
    /// `i64`
    pub const I64: TypeId = TypeId::new(6);
    /// `u64`
    pub const U64: TypeId = TypeId::new(7);
    /// `f32`
    pub const F32: TypeId = TypeId::new(8);
    /// `f64`
    pub const F64: TypeId = TypeId::new(9);
    /// `vptr`
    pub const VPTR: TypeId = TypeId::new(10);
    /// `void`
    pub const VOID: TypeId = TypeId::new(11);

    /// Alias of the unsigned machine word.
    pub const WORD: TypeId = Self::U64;
    /// Alias of the signed machine word.
    pub const OFFSET: TypeId = Self::I64;

    /// Whether this index denotes one of the base types.
    pub const fn is_base(self) -> bool {
        (self.raw() as usize) < BaseType::COUNT
    }

    /// Integer types sit below `f32` in the table.
    pub const fn is_integral(self) -> bool {
        self.raw() < Self::F32.raw()
    }

    /// Unsigned integer types occupy the odd base indices.
    pub const fn is_unsigned(self) -> bool {
        self.is_integral() && self.raw() & 1 == 1
    }

    /// `f32` or `f64`.
    pub const fn is_float(self) -> bool {
        self.raw() == Self::F32.raw() || self.raw() == Self::F64.raw()
    }

    /// Anything numeric: integral or floating point.
    pub const fn is_arithmetic(self) -> bool {
        self.raw() <= Self::F64.raw()
    }

    /// Byte size if this is a base type, 0 otherwise.
    pub const fn base_size(self) -> usize {
        if self.is_base() {
            BaseType::SIZES[self.raw() as usize]
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn base_type_sizes() {
        let expected = [1, 1, 2, 2, 4, 4, 8, 8, 4, 8, WORD_SIZE, 0];
        for (base, size) in BaseType::iter().zip(expected) {
            assert_eq!(base.size(), size, "{base}");
            assert_eq!(base.type_id().base_size(), size);
        }
    }

    #[test]
    fn classification_follows_table_order() {
        for base in BaseType::iter() {
            let id = base.type_id();
            assert_eq!(id.is_integral(), (base as u8) < BaseType::F32 as u8);
            assert_eq!(
                id.is_unsigned(),
                id.is_integral() && (base as u8) % 2 == 1,
                "{base}"
            );
            assert_eq!(
                id.is_arithmetic(),
                (base as u8) <= BaseType::F64 as u8
            );
        }
        assert!(!TypeId::VPTR.is_arithmetic());
        assert!(!TypeId::VOID.is_arithmetic());
    }

    #[test]
    fn names_match_source_syntax() {
        assert_eq!(BaseType::I8.to_string(), "i8");
        assert_eq!(BaseType::VPtr.to_string(), "vptr");
        assert_eq!(BaseType::Void.to_string(), "void");
    }
}
