use core::fmt;

use kiln_types::TypeId;

/// Typed variant selector following an opcode byte. The value indexes one
/// entry of the declarative table the opcode draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Subcode(pub u8);

impl Subcode {
    /// Placeholder written by the generator; the linker replaces it.
    pub const PLACEHOLDER: Self = Self(u8::MAX);

    /// Table index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Subcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// `set` subcode for a raw copy between equal non-arithmetic types; sits
/// right after the arithmetic pair table.
pub const SET_COPY_SUBCODE: Subcode = Subcode(ARITH_PAIRS.len() as u8);

macro_rules! pair_table {
    ($(($sub:literal, $lk:ident, $lt:ty, $rk:ident, $rt:ty)),+ $(,)?) => {
        &[$((TypeId::$lk, TypeId::$rk)),+]
    };
}

macro_rules! compare_table {
    ($(($sub:literal, $lk:ident, $lt:ty, $rk:ident, $rt:ty, $ck:ident, $ct:ty)),+ $(,)?) => {
        &[$((TypeId::$lk, TypeId::$rk, TypeId::$ck)),+]
    };
}

macro_rules! unary_table {
    ($(($sub:literal, $k:ident, $t:ty)),+ $(,)?) => {
        &[$(TypeId::$k),+]
    };
}

/// Implicit (widening) conversion pairs `(lhs, rhs)`; position is the subcode.
pub const ARITH_PAIRS: &[(TypeId, TypeId)] = crate::with_arith_pairs!(pair_table);

/// Integral pairs for the bitwise and shift opcodes.
pub const INTEGRAL_PAIRS: &[(TypeId, TypeId)] = crate::with_integral_pairs!(pair_table);

/// Explicit conversion pairs `(dst, src)`.
pub const CONV_PAIRS: &[(TypeId, TypeId)] = crate::with_conv_pairs!(pair_table);

/// Comparison pairs `(lhs, rhs, common)`.
pub const COMPARE_PAIRS: &[(TypeId, TypeId, TypeId)] =
    crate::with_compare_pairs!(compare_table);

/// Operand types of `not`.
pub const NOT_TYPES: &[TypeId] = crate::with_not_types!(unary_table);

/// Operand types of `neg`.
pub const NEG_TYPES: &[TypeId] = crate::with_neg_types!(unary_table);

/// Operand types of `cze`/`cnz`.
pub const TEST_TYPES: &[TypeId] = crate::with_test_types!(unary_table);

/// Right-hand operand types of `padd`/`psub`.
pub const POINTER_OFFSET_TYPES: &[TypeId] = crate::with_pointer_offset_types!(unary_table);

fn position_of(table: &[(TypeId, TypeId)], lhs: TypeId, rhs: TypeId) -> Option<Subcode> {
    table
        .iter()
        .position(|&(l, r)| l == lhs && r == rhs)
        .map(|sub| Subcode(sub as u8))
}

fn position_of_unary(table: &[TypeId], ty: TypeId) -> Option<Subcode> {
    table.iter().position(|&t| t == ty).map(|sub| Subcode(sub as u8))
}

/// Subcode of an implicit conversion of `rhs` into `lhs`, used by `set`,
/// argument passing, `retv` and the binary arithmetic opcodes.
pub fn implicit_subcode(lhs: TypeId, rhs: TypeId) -> Option<Subcode> {
    position_of(ARITH_PAIRS, lhs, rhs)
}

/// Subcode of an explicit conversion from `src` into `dst`.
pub fn conv_subcode(dst: TypeId, src: TypeId) -> Option<Subcode> {
    position_of(CONV_PAIRS, dst, src)
}

/// Subcode and common comparison type of a comparison between `lhs` and
/// `rhs`.
pub fn compare_subcode(lhs: TypeId, rhs: TypeId) -> Option<(Subcode, TypeId)> {
    COMPARE_PAIRS
        .iter()
        .position(|&(l, r, _)| l == lhs && r == rhs)
        .map(|sub| (Subcode(sub as u8), COMPARE_PAIRS[sub].2))
}

/// Subcode of a bitwise or shift operation between integral operands.
pub fn integral_subcode(lhs: TypeId, rhs: TypeId) -> Option<Subcode> {
    position_of(INTEGRAL_PAIRS, lhs, rhs)
}

/// Subcode of `not` for operand type `ty`.
pub fn not_subcode(ty: TypeId) -> Option<Subcode> {
    position_of_unary(NOT_TYPES, ty)
}

/// Subcode of `neg` for operand type `ty`.
pub fn neg_subcode(ty: TypeId) -> Option<Subcode> {
    position_of_unary(NEG_TYPES, ty)
}

/// Subcode of a zero test for operand type `ty`.
pub fn test_subcode(ty: TypeId) -> Option<Subcode> {
    position_of_unary(TEST_TYPES, ty)
}

/// Subcode of a pointer offset operation for integral right-hand type `ty`.
pub fn pointer_offset_subcode(ty: TypeId) -> Option<Subcode> {
    position_of_unary(POINTER_OFFSET_TYPES, ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_sizes() {
        assert_eq!(ARITH_PAIRS.len(), 45);
        assert_eq!(INTEGRAL_PAIRS.len(), 26);
        assert_eq!(CONV_PAIRS.len(), 100);
        assert_eq!(COMPARE_PAIRS.len(), 92);
        assert_eq!(NOT_TYPES.len(), 8);
        assert_eq!(NEG_TYPES.len(), 6);
        assert_eq!(TEST_TYPES.len(), 10);
        assert_eq!(POINTER_OFFSET_TYPES.len(), 8);
        assert_eq!(SET_COPY_SUBCODE, Subcode(45));
    }

    #[test]
    fn integral_table_is_arith_prefix() {
        assert_eq!(&ARITH_PAIRS[..INTEGRAL_PAIRS.len()], INTEGRAL_PAIRS);
        assert!(INTEGRAL_PAIRS
            .iter()
            .all(|&(l, r)| l.is_integral() && r.is_integral()));
    }

    #[test]
    fn arith_pairs_widen_only() {
        for &(lhs, rhs) in ARITH_PAIRS {
            assert!(lhs.is_arithmetic() && rhs.is_arithmetic());
            if lhs.is_integral() && rhs.is_integral() {
                assert!(lhs.base_size() >= rhs.base_size(), "{lhs:?} <- {rhs:?}");
                if lhs.is_unsigned() {
                    assert!(rhs.is_unsigned(), "{lhs:?} <- {rhs:?}");
                }
            }
            if rhs.is_float() {
                assert!(lhs.is_float());
            }
        }
    }

    #[test]
    fn conv_covers_every_pair() {
        for dst in 0..10u32 {
            for src in 0..10u32 {
                let sub = conv_subcode(TypeId::new(dst), TypeId::new(src)).unwrap();
                assert_eq!(sub.index(), (dst * 10 + src) as usize);
            }
        }
    }

    #[test]
    fn compare_rejects_signed_u64_mixes() {
        for signed in [TypeId::I8, TypeId::I16, TypeId::I32, TypeId::I64] {
            assert!(compare_subcode(signed, TypeId::U64).is_none());
            assert!(compare_subcode(TypeId::U64, signed).is_none());
        }
        let (_, common) = compare_subcode(TypeId::I32, TypeId::U32).unwrap();
        assert_eq!(common, TypeId::I64);
        let (_, common) = compare_subcode(TypeId::U32, TypeId::U32).unwrap();
        assert_eq!(common, TypeId::U32);
        let (_, common) = compare_subcode(TypeId::U64, TypeId::U32).unwrap();
        assert_eq!(common, TypeId::U64);
        let (_, common) = compare_subcode(TypeId::F32, TypeId::I64).unwrap();
        assert_eq!(common, TypeId::F32);
    }

    use rstest::rstest;

    #[rstest]
    #[case(TypeId::I32, TypeId::I32, Some(11))]
    #[case(TypeId::F64, TypeId::F64, Some(44))]
    #[case(TypeId::I64, TypeId::U32, Some(20))]
    #[case(TypeId::F32, TypeId::U64, Some(33))]
    #[case(TypeId::U32, TypeId::I32, None)]
    #[case(TypeId::I8, TypeId::I16, None)]
    fn anchored_implicit_subcodes(
        #[case] lhs: TypeId,
        #[case] rhs: TypeId,
        #[case] expected: Option<u8>,
    ) {
        // Subcode values are part of the serialized format; the tables must
        // never be reordered.
        assert_eq!(implicit_subcode(lhs, rhs), expected.map(Subcode));
    }

    #[test]
    fn anchored_compare_and_conv_subcodes() {
        assert_eq!(compare_subcode(TypeId::I8, TypeId::U32).unwrap().0, Subcode(5));
        assert_eq!(compare_subcode(TypeId::U64, TypeId::U8).unwrap().0, Subcode(66));
        assert_eq!(compare_subcode(TypeId::F32, TypeId::F64).unwrap().0, Subcode(81));
        assert_eq!(conv_subcode(TypeId::U8, TypeId::F64), Some(Subcode(19)));
    }

    #[test]
    fn pointer_offset_order_matches_integral_ranks() {
        for (sub, ty) in POINTER_OFFSET_TYPES.iter().enumerate() {
            assert_eq!(pointer_offset_subcode(*ty), Some(Subcode(sub as u8)));
        }
    }
}
