use core::fmt;

use crate::{RawIndex, INVALID_INDEX};

macro_rules! index_newtype {
    ($($(#[$attr:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            #[repr(transparent)]
            pub struct $name(RawIndex);

            impl $name {
                /// Sentinel index, equal to all-ones.
                pub const INVALID: Self = Self(INVALID_INDEX);

                /// Wraps a raw index.
                pub const fn new(raw: RawIndex) -> Self {
                    Self(raw)
                }

                /// Raw index value.
                pub const fn raw(self) -> RawIndex {
                    self.0
                }

                /// Whether this index is not the sentinel.
                pub const fn is_valid(self) -> bool {
                    self.0 != INVALID_INDEX
                }

                /// Index as a table subscript.
                pub const fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl From<usize> for $name {
                fn from(value: usize) -> Self {
                    Self(value as RawIndex)
                }
            }

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    if self.is_valid() {
                        write!(f, concat!(stringify!($name), "({})"), self.0)
                    } else {
                        write!(f, concat!(stringify!($name), "(invalid)"))
                    }
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    fmt::Display::fmt(&self.0, f)
                }
            }
        )+
    };
}

index_newtype! {
    /// Index into the type table. Values `0..12` are the base types.
    TypeId,
    /// Index into the method table.
    MethodId,
    /// Index into the signature table.
    SignatureId,
    /// Index into the interned name database.
    NameId,
    /// Index into a method writer's label table.
    LabelId,
    /// Index into the field offset table.
    OffsetId,
    /// Index into a data table. Bit 25 distinguishes constants from globals.
    GlobalId,
    /// Index into the metadata string table.
    MetaId,
}

impl GlobalId {
    /// Flag bit marking an index into the constant table rather than the
    /// global table. Sits right below the 26-bit address index range.
    pub const CONSTANT_FLAG: RawIndex = 1 << 25;

    const TABLE_MASK: RawIndex = Self::CONSTANT_FLAG - 1;

    /// Entry `index` of the global or constant data table.
    pub const fn entry(index: RawIndex, constant: bool) -> Self {
        if constant {
            Self::new(index | Self::CONSTANT_FLAG)
        } else {
            Self::new(index)
        }
    }

    /// Whether the constant flag is set.
    pub const fn is_constant(self) -> bool {
        self.raw() & Self::CONSTANT_FLAG != 0
    }

    /// Table subscript with the constant flag stripped.
    pub const fn table_index(self) -> usize {
        (self.raw() & Self::TABLE_MASK) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sentinel_is_all_ones() {
        assert_eq!(TypeId::INVALID.raw(), RawIndex::MAX);
        assert!(!MethodId::INVALID.is_valid());
        assert!(NameId::new(0).is_valid());
    }

    #[test]
    fn global_constant_flag_round_trip() {
        let global = GlobalId::entry(7, false);
        let constant = GlobalId::entry(7, true);
        assert!(!global.is_constant());
        assert!(constant.is_constant());
        assert_eq!(global.table_index(), 7);
        assert_eq!(constant.table_index(), 7);
        assert_ne!(global, constant);
    }
}
