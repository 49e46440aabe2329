use core::fmt;

/// One byte opcode of the Kiln IL.
///
/// Binary arithmetic, comparison and conversion opcodes are followed by a
/// [`Subcode`](crate::Subcode) selecting the typed variant; see the operand
/// layout table in the module documentation of [`crate::cursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Opcode {
    /// No operation.
    Noop = 0x00,
    /// Assign with implicit conversion, or raw copy for equal aggregates.
    Set = 0x01,
    /// Assign with explicit conversion.
    Conv = 0x02,
    /// Bitwise complement, in place.
    Not = 0x03,
    /// Arithmetic negation, in place.
    Neg = 0x04,
    /// Multiply into lhs.
    Mul = 0x05,
    /// Divide into lhs.
    Div = 0x06,
    /// Remainder into lhs.
    Mod = 0x07,
    /// Add into lhs.
    Add = 0x08,
    /// Subtract into lhs.
    Sub = 0x09,
    /// Shift left into lhs.
    Lsh = 0x0A,
    /// Shift right into lhs.
    Rsh = 0x0B,
    /// Bitwise and into lhs.
    And = 0x0C,
    /// Bitwise xor into lhs.
    Xor = 0x0D,
    /// Bitwise or into lhs.
    Or = 0x0E,
    /// Pointer plus integral element offset.
    Padd = 0x0F,
    /// Pointer minus integral element offset.
    Psub = 0x10,
    /// Pointer difference in elements; result goes to the return slot.
    Pdif = 0x11,
    /// Three-way compare (-1/0/1) into the return slot.
    Cmp = 0x12,
    /// Equality test into the return slot.
    Ceq = 0x13,
    /// Inequality test into the return slot.
    Cne = 0x14,
    /// Greater-than test into the return slot.
    Cgt = 0x15,
    /// Greater-or-equal test into the return slot.
    Cge = 0x16,
    /// Less-than test into the return slot.
    Clt = 0x17,
    /// Less-or-equal test into the return slot.
    Cle = 0x18,
    /// Zero test into the return slot.
    Cze = 0x19,
    /// Non-zero test into the return slot.
    Cnz = 0x1A,
    /// Unconditional branch.
    Br = 0x1B,
    /// Branch if equal.
    Beq = 0x1C,
    /// Branch if not equal.
    Bne = 0x1D,
    /// Branch if greater.
    Bgt = 0x1E,
    /// Branch if greater or equal.
    Bge = 0x1F,
    /// Branch if less.
    Blt = 0x20,
    /// Branch if less or equal.
    Ble = 0x21,
    /// Branch if zero.
    Bze = 0x22,
    /// Branch if not zero.
    Bnz = 0x23,
    /// Switch on an integral selector over a label table.
    Sw = 0x24,
    /// Direct call by method index.
    Call = 0x25,
    /// Indirect call through a method pointer.
    Callv = 0x26,
    /// Return from a void method.
    Ret = 0x27,
    /// Return a value.
    Retv = 0x28,
    /// Print the value of an address.
    Dump = 0x29,
}

impl Opcode {
    /// Decodes an opcode byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        if byte <= Self::Dump as u8 {
            // Discriminants are dense from 0.
            Some(unsafe { core::mem::transmute::<u8, Opcode>(byte) })
        } else {
            None
        }
    }

    /// Whether this is one of the comparison opcodes writing the return slot.
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Cmp
                | Self::Ceq
                | Self::Cne
                | Self::Cgt
                | Self::Cge
                | Self::Clt
                | Self::Cle
                | Self::Cze
                | Self::Cnz
        )
    }

    /// Whether this is a conditional branch.
    pub const fn is_conditional_branch(self) -> bool {
        matches!(
            self,
            Self::Beq
                | Self::Bne
                | Self::Bgt
                | Self::Bge
                | Self::Blt
                | Self::Ble
                | Self::Bze
                | Self::Bnz
        )
    }

    /// Whether this opcode never falls through to the next instruction.
    pub const fn is_terminator(self) -> bool {
        matches!(self, Self::Br | Self::Ret | Self::Retv)
    }
}

/// Parses the textual mnemonic of an opcode.
impl core::str::FromStr for Opcode {
    type Err = UnknownOpcode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Opcode::*;
        Ok(match s {
            "noop" => Noop,
            "set" => Set,
            "conv" => Conv,
            "not" => Not,
            "neg" => Neg,
            "mul" => Mul,
            "div" => Div,
            "mod" => Mod,
            "add" => Add,
            "sub" => Sub,
            "lsh" => Lsh,
            "rsh" => Rsh,
            "and" => And,
            "xor" => Xor,
            "or" => Or,
            "padd" => Padd,
            "psub" => Psub,
            "pdif" => Pdif,
            "cmp" => Cmp,
            "ceq" => Ceq,
            "cne" => Cne,
            "cgt" => Cgt,
            "cge" => Cge,
            "clt" => Clt,
            "cle" => Cle,
            "cze" => Cze,
            "cnz" => Cnz,
            "br" => Br,
            "beq" => Beq,
            "bne" => Bne,
            "bgt" => Bgt,
            "bge" => Bge,
            "blt" => Blt,
            "ble" => Ble,
            "bze" => Bze,
            "bnz" => Bnz,
            "sw" => Sw,
            "call" => Call,
            "callv" => Callv,
            "ret" => Ret,
            "retv" => Retv,
            "dump" => Dump,
            _ => return Err(UnknownOpcode),
        })
    }
}

/// The string is not an opcode mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownOpcode;

impl fmt::Display for UnknownOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown opcode mnemonic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn byte_round_trip() {
        for op in Opcode::iter() {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(Opcode::Dump as u8 + 1), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn mnemonic_round_trip() {
        for op in Opcode::iter() {
            let text = op.to_string();
            assert_eq!(text.parse::<Opcode>(), Ok(op), "{text}");
        }
        assert!("frobnicate".parse::<Opcode>().is_err());
    }

    #[test]
    fn classification() {
        assert!(Opcode::Cmp.is_comparison());
        assert!(Opcode::Cnz.is_comparison());
        assert!(!Opcode::Set.is_comparison());
        assert!(Opcode::Bze.is_conditional_branch());
        assert!(!Opcode::Br.is_conditional_branch());
        assert!(Opcode::Br.is_terminator());
        assert!(Opcode::Retv.is_terminator());
        assert!(!Opcode::Sw.is_terminator());
    }
}
