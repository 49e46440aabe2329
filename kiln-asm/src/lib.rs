//! Opcode and subcode definitions of the Kiln IL, the declarative scalar
//! operand tables shared by the linker and the interpreter, and the
//! little-endian bytecode cursors every stage reads and writes through.

#![warn(missing_docs)]

mod cursor;
mod opcode;
mod subcode;
mod tables;

pub use cursor::{Reader, Writer};
pub use opcode::Opcode;
pub use subcode::{
    compare_subcode, conv_subcode, implicit_subcode, integral_subcode, neg_subcode,
    not_subcode, pointer_offset_subcode, test_subcode, Subcode, ARITH_PAIRS, COMPARE_PAIRS,
    CONV_PAIRS, INTEGRAL_PAIRS, NEG_TYPES, NOT_TYPES, POINTER_OFFSET_TYPES,
    SET_COPY_SUBCODE, TEST_TYPES,
};
