//! Bytecode interpreter.
//!
//! Data lives in one flat address space: a null guard, the constant block,
//! the global block, then the runtime stack. Pointer values are 64-bit byte
//! offsets into this space, which gives pointer arithmetic and `&`/`*`
//! well-defined meaning without host pointers.
//!
//! Frame layout on the data stack, growing upward:
//!
//! ```text
//! [ caller return slot ][ saved frame ][ parameters ][ locals ]
//! ```
//!
//! The saved frame record occupies a fixed footprint on the data stack (so
//! overflow accounting is exact) and is mirrored on a frame vector. The two
//! scratch cells back `&x` and `!x`; each instruction reads at most two
//! addresses, one per side.

use kiln_types::{
    AddressHeader, AddressKind, AddressModifier, AddressPrefix, GlobalId, MethodId, TypeId,
    WORD_SIZE,
};
use tracing::{debug, trace};

use crate::assembly::AssemblyData;
use crate::error::RuntimeError;
use crate::module::Generated;
use crate::runtime::{Runtime, RuntimeParams};

/// Receiver of `dump` output.
pub trait DumpSink {
    /// Called once per `dump` instruction with the rendered line.
    fn dump(&mut self, text: &str);
}

/// Dumps to standard output.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl DumpSink for StdoutSink {
    fn dump(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Collects dump lines into a string, one per line.
#[derive(Debug, Default)]
pub struct StringSink {
    /// Accumulated output.
    pub output: String,
}

impl DumpSink for StringSink {
    fn dump(&mut self, text: &str) {
        self.output.push_str(text);
        self.output.push('\n');
    }
}

/// Where an operand's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Place {
    /// Offset into the flat data memory.
    Mem(usize),
    /// Offset into the current method's bytecode (inline constant).
    Imm(usize),
    /// One of the two per-instruction scratch cells.
    Scratch(usize),
}

/// A resolved operand: its final type and location.
#[derive(Debug, Clone, Copy)]
struct Loc {
    ty: TypeId,
    place: Place,
}

/// Saved execution state of one frame.
#[derive(Debug, Clone, Copy)]
struct Frame {
    /// Byte offset of the next instruction, `usize::MAX` for the root.
    iptr: usize,
    method: MethodId,
    return_offset: usize,
    frame_offset: usize,
    param_offset: usize,
    stack_offset: usize,
    stack_end: usize,
}

impl Frame {
    /// Footprint reserved on the data stack for a saved frame.
    const BYTES: usize = 7 * WORD_SIZE;

    const ROOT: Frame = Frame {
        iptr: usize::MAX,
        method: MethodId::INVALID,
        return_offset: 0,
        frame_offset: 0,
        param_offset: 0,
        stack_offset: 0,
        stack_end: 0,
    };

    fn is_root(&self) -> bool {
        self.iptr == usize::MAX
    }
}

trait MemScalar: Copy {
    const SIZE: usize;
    fn load(bytes: &[u8]) -> Self;
    fn store(self, out: &mut [u8]);
}

macro_rules! mem_scalar {
    ($($ty:ty),+) => {
        $(impl MemScalar for $ty {
            const SIZE: usize = core::mem::size_of::<$ty>();
            fn load(bytes: &[u8]) -> Self {
                let mut buf = [0u8; Self::SIZE];
                buf.copy_from_slice(&bytes[..Self::SIZE]);
                Self::from_le_bytes(buf)
            }
            fn store(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }
        })+
    };
}

mem_scalar!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// Arithmetic with the wrapping two's-complement semantics of the VM.
/// Integer division by zero traps the host, like the hardware trap of a
/// native build.
trait VmNum: Copy {
    fn vm_add(self, o: Self) -> Self;
    fn vm_sub(self, o: Self) -> Self;
    fn vm_mul(self, o: Self) -> Self;
    fn vm_div(self, o: Self) -> Self;
    fn vm_rem(self, o: Self) -> Self;
    fn vm_neg(self) -> Self;
}

macro_rules! vm_num_int {
    ($($ty:ty),+) => {
        $(impl VmNum for $ty {
            fn vm_add(self, o: Self) -> Self { self.wrapping_add(o) }
            fn vm_sub(self, o: Self) -> Self { self.wrapping_sub(o) }
            fn vm_mul(self, o: Self) -> Self { self.wrapping_mul(o) }
            fn vm_div(self, o: Self) -> Self { self.wrapping_div(o) }
            fn vm_rem(self, o: Self) -> Self { self.wrapping_rem(o) }
            fn vm_neg(self) -> Self { self.wrapping_neg() }
        })+
    };
}

macro_rules! vm_num_float {
    ($($ty:ty),+) => {
        $(impl VmNum for $ty {
            fn vm_add(self, o: Self) -> Self { self + o }
            fn vm_sub(self, o: Self) -> Self { self - o }
            fn vm_mul(self, o: Self) -> Self { self * o }
            fn vm_div(self, o: Self) -> Self { self / o }
            fn vm_rem(self, o: Self) -> Self { self % o }
            fn vm_neg(self) -> Self { -self }
        })+
    };
}

vm_num_int!(i8, u8, i16, u16, i32, u32, i64, u64);
vm_num_float!(f32, f64);

trait VmInt: Copy {
    fn vm_shl(self, o: Self) -> Self;
    fn vm_shr(self, o: Self) -> Self;
    fn vm_and(self, o: Self) -> Self;
    fn vm_xor(self, o: Self) -> Self;
    fn vm_or(self, o: Self) -> Self;
}

macro_rules! vm_int {
    ($($ty:ty),+) => {
        $(impl VmInt for $ty {
            fn vm_shl(self, o: Self) -> Self { self.wrapping_shl(o as u32) }
            fn vm_shr(self, o: Self) -> Self { self.wrapping_shr(o as u32) }
            fn vm_and(self, o: Self) -> Self { self & o }
            fn vm_xor(self, o: Self) -> Self { self ^ o }
            fn vm_or(self, o: Self) -> Self { self | o }
        })+
    };
}

vm_int!(i8, u8, i16, u16, i32, u32, i64, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithKind {
    Mul,
    Div,
    Mod,
    Add,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntKind {
    Lsh,
    Rsh,
    And,
    Xor,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareKind {
    Cmp,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Offset of the first addressable byte; flat address zero stays unmapped
/// so a null pointer can never alias real data.
const NULL_GUARD: usize = WORD_SIZE;

pub(crate) struct Interpreter<'a> {
    data: &'a AssemblyData,
    runtime: &'a Runtime,
    params: RuntimeParams,
    sink: &'a mut dyn DumpSink,

    memory: Vec<u8>,
    constants_base: usize,
    globals_base: usize,
    stack_base: usize,
    stack_capacity: usize,
    stack_size: usize,

    frames: Vec<Frame>,
    sf: Frame,
    callstack_depth: usize,

    /// Type and flat address of the value currently in the return slot.
    ret_value: Option<Loc>,
    scratch: [[u8; WORD_SIZE]; 2],
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(
        data: &'a AssemblyData,
        runtime: &'a Runtime,
        params: RuntimeParams,
        sink: &'a mut dyn DumpSink,
    ) -> Result<Self, RuntimeError> {
        // Largest power of two within the configured bounds.
        let mut stack_capacity = 0usize;
        let mut probe = 1usize;
        while probe <= params.max_stack_size {
            stack_capacity = probe;
            match probe.checked_mul(2) {
                Some(next) => probe = next,
                None => break,
            }
        }
        if stack_capacity < params.min_stack_size || stack_capacity == 0 {
            return Err(RuntimeError::StackAllocationFailure);
        }

        let constants_base = NULL_GUARD;
        let globals_base = constants_base + data.module.constants.data.len();
        let stack_base = globals_base + data.module.globals.data.len();
        let mut memory = vec![0u8; stack_base + stack_capacity];
        memory[constants_base..globals_base].copy_from_slice(&data.module.constants.data);
        memory[globals_base..stack_base].copy_from_slice(&data.module.globals.data);

        debug!(
            stack_capacity,
            constants = data.module.constants.data.len(),
            globals = data.module.globals.data.len(),
            "interpreter memory initialized"
        );

        Ok(Self {
            data,
            runtime,
            params,
            sink,
            memory,
            constants_base,
            globals_base,
            stack_base,
            stack_capacity,
            stack_size: 0,
            frames: Vec::new(),
            sf: Frame::ROOT,
            callstack_depth: 0,
            ret_value: None,
            scratch: [[0; WORD_SIZE]; 2],
        })
    }

    pub(crate) fn run(mut self) -> Result<i32, RuntimeError> {
        let main = self.data.main;
        self.push_stack_frame(main)?;

        while !self.sf.is_root() {
            self.step()?;
        }

        debug_assert!(self.stack_size >= core::mem::size_of::<i32>());
        debug_assert_eq!(self.callstack_depth, 0);
        Ok(i32::load(&self.memory[self.stack_base..]))
    }

    fn code(&self) -> &[u8] {
        &self.data.module.methods[self.sf.method.index()].bytecode
    }

    fn read_u8(&mut self) -> u8 {
        let byte = self.code()[self.sf.iptr];
        self.sf.iptr += 1;
        byte
    }

    fn read_u32(&mut self) -> u32 {
        let value = kiln_types::bytes::read_u32(&self.code()[self.sf.iptr..]);
        self.sf.iptr += 4;
        value
    }

    fn read_i64(&mut self) -> i64 {
        let value = kiln_types::bytes::read_i64(&self.code()[self.sf.iptr..]);
        self.sf.iptr += 8;
        value
    }

    fn read_subcode(&mut self) -> usize {
        self.read_u8() as usize
    }

    fn ty(&self, id: TypeId) -> &crate::module::TypeDef {
        &self.data.module.types[id.index()]
    }

    fn read_scalar<T: MemScalar>(&self, loc: Loc) -> T {
        match loc.place {
            Place::Mem(offset) => T::load(&self.memory[offset..]),
            Place::Imm(offset) => T::load(&self.code()[offset..]),
            Place::Scratch(cell) => T::load(&self.scratch[cell]),
        }
    }

    fn write_scalar<T: MemScalar>(&mut self, loc: Loc, value: T) {
        match loc.place {
            Place::Mem(offset) => {
                // The linker rejects constant-table destinations, so a
                // memory write never lands below the globals block.
                debug_assert!(offset >= self.globals_base, "write into the constant block");
                value.store(&mut self.memory[offset..]);
            }
            // Inline literals and the scratch cells are never destinations;
            // the generator and linker both reject them in write positions.
            Place::Imm(_) | Place::Scratch(_) => unreachable!("write to read-only operand"),
        }
    }

    fn pointer_value(&self, loc: Loc) -> usize {
        self.read_scalar::<u64>(loc) as usize
    }

    /// Decodes the next operand of the instruction stream into its final
    /// type and location.
    fn read_operand(&mut self, is_rhs: bool) -> Loc {
        let header = AddressHeader::from_bits(self.read_u32());

        let mut loc = match header.kind() {
            AddressKind::Constant => {
                let ty = TypeId::new(header.index());
                let place = Place::Imm(self.sf.iptr);
                self.sf.iptr += ty.base_size();
                // Inline constants take no payload, modifier or prefix.
                return Loc { ty, place };
            }
            AddressKind::StackVar => {
                if header.index() == AddressHeader::INDEX_MAX {
                    self.ret_value.expect("return slot read validated by linker")
                } else {
                    let method = &self.data.module.methods[self.sf.method.index()];
                    let var = method.stackvars[header.index() as usize];
                    Loc {
                        ty: var.ty,
                        place: Place::Mem(self.stack_base + self.sf.stack_offset + var.offset),
                    }
                }
            }
            AddressKind::Parameter => {
                let method = &self.data.module.methods[self.sf.method.index()];
                let sig = &self.data.module.signatures[method.signature.index()];
                let param = sig.parameters[header.index() as usize];
                Loc {
                    ty: param.ty,
                    place: Place::Mem(self.stack_base + self.sf.param_offset + param.offset),
                }
            }
            AddressKind::Global => {
                let global = GlobalId::new(header.index());
                let (table, base) = if global.is_constant() {
                    (&self.data.module.constants, self.constants_base)
                } else {
                    (&self.data.module.globals, self.globals_base)
                };
                let entry = table.entries[global.table_index()];
                Loc {
                    ty: entry.ty,
                    place: Place::Mem(base + entry.offset),
                }
            }
        };

        match header.modifier() {
            AddressModifier::None => {
                self.sf.iptr += 8;
            }
            AddressModifier::DirectField => {
                let payload = self.read_i64() as usize;
                let field = &self.data.module.offsets[payload];
                let Place::Mem(offset) = loc.place else {
                    unreachable!("field access on non-memory operand");
                };
                loc = Loc {
                    ty: field.ty,
                    place: Place::Mem(offset + field.offset),
                };
            }
            AddressModifier::IndirectField => {
                let payload = self.read_i64() as usize;
                let field = &self.data.module.offsets[payload];
                let base = self.pointer_value(loc);
                loc = Loc {
                    ty: field.ty,
                    place: Place::Mem(base + field.offset),
                };
            }
            AddressModifier::Subscript => {
                let index = self.read_i64();
                match self.ty(loc.ty).generated {
                    Some(Generated::Pointer {
                        pointee,
                        pointee_size,
                    }) => {
                        let base = self.pointer_value(loc);
                        let offset = (pointee_size as i64).wrapping_mul(index);
                        loc = Loc {
                            ty: pointee,
                            place: Place::Mem(base.wrapping_add(offset as usize)),
                        };
                    }
                    Some(Generated::Array { elem, .. }) => {
                        let elem_size = self.ty(elem).total_size;
                        let Place::Mem(offset) = loc.place else {
                            unreachable!("subscript on non-memory operand");
                        };
                        let delta = (elem_size as i64).wrapping_mul(index);
                        loc = Loc {
                            ty: elem,
                            place: Place::Mem(offset.wrapping_add(delta as usize)),
                        };
                    }
                    _ => unreachable!("subscript base validated by linker"),
                }
            }
        }

        match header.prefix() {
            AddressPrefix::None => {}
            AddressPrefix::Indirection => {
                let pointee = match self.ty(loc.ty).generated {
                    Some(Generated::Pointer { pointee, .. }) => pointee,
                    _ => unreachable!("indirection base validated by linker"),
                };
                let target = self.pointer_value(loc);
                loc = Loc {
                    ty: pointee,
                    place: Place::Mem(target),
                };
            }
            AddressPrefix::AddressOf => {
                let Place::Mem(offset) = loc.place else {
                    unreachable!("address of non-memory operand");
                };
                let cell = is_rhs as usize;
                (offset as u64).store(&mut self.scratch[cell]);
                let pointer_type = self.ty(loc.ty).pointer_type;
                loc = Loc {
                    ty: if pointer_type.is_valid() {
                        pointer_type
                    } else {
                        TypeId::VPTR
                    },
                    place: Place::Scratch(cell),
                };
            }
            AddressPrefix::SizeOf => {
                let cell = is_rhs as usize;
                (self.ty(loc.ty).total_size as u64).store(&mut self.scratch[cell]);
                loc = Loc {
                    ty: TypeId::WORD,
                    place: Place::Scratch(cell),
                };
            }
        }

        loc
    }

    fn step(&mut self) -> Result<(), RuntimeError> {
        use kiln_asm::Opcode;

        let op = Opcode::from_u8(self.read_u8()).expect("opcode validated by linker");
        trace!(?op, iptr = self.sf.iptr, "step");
        match op {
            Opcode::Noop => {}
            Opcode::Set => {
                let sub = self.read_subcode();
                let lhs = self.read_operand(false);
                let rhs = self.read_operand(true);
                self.exec_set(sub, lhs, rhs);
            }
            Opcode::Conv => {
                let sub = self.read_subcode();
                let lhs = self.read_operand(false);
                let rhs = self.read_operand(true);
                self.exec_conv(sub, lhs, rhs);
            }
            Opcode::Not => {
                let sub = self.read_subcode();
                let target = self.read_operand(false);
                self.exec_not(sub, target);
            }
            Opcode::Neg => {
                let sub = self.read_subcode();
                let target = self.read_operand(false);
                self.exec_neg(sub, target);
            }
            Opcode::Mul => self.arith(ArithKind::Mul),
            Opcode::Div => self.arith(ArithKind::Div),
            Opcode::Mod => self.arith(ArithKind::Mod),
            Opcode::Add => self.arith(ArithKind::Add),
            Opcode::Sub => self.arith(ArithKind::Sub),
            Opcode::Lsh => self.integral(IntKind::Lsh),
            Opcode::Rsh => self.integral(IntKind::Rsh),
            Opcode::And => self.integral(IntKind::And),
            Opcode::Xor => self.integral(IntKind::Xor),
            Opcode::Or => self.integral(IntKind::Or),
            Opcode::Padd => self.pointer_offset(false),
            Opcode::Psub => self.pointer_offset(true),
            Opcode::Pdif => {
                let lhs = self.read_operand(false);
                let rhs = self.read_operand(true);
                let pointee_size = match self.ty(lhs.ty).generated {
                    Some(Generated::Pointer { pointee_size, .. }) => pointee_size as i64,
                    _ => unreachable!("pdif operand validated by linker"),
                };
                let l = self.pointer_value(lhs) as i64;
                let r = self.pointer_value(rhs) as i64;
                let diff = (l.wrapping_sub(r)) / pointee_size;
                let slot = self.push_return_value(TypeId::OFFSET)?;
                self.write_scalar(slot, diff);
            }
            Opcode::Cmp => self.compare(CompareKind::Cmp)?,
            Opcode::Ceq => self.compare(CompareKind::Eq)?,
            Opcode::Cne => self.compare(CompareKind::Ne)?,
            Opcode::Cgt => self.compare(CompareKind::Gt)?,
            Opcode::Cge => self.compare(CompareKind::Ge)?,
            Opcode::Clt => self.compare(CompareKind::Lt)?,
            Opcode::Cle => self.compare(CompareKind::Le)?,
            Opcode::Cze => self.zero_test(true)?,
            Opcode::Cnz => self.zero_test(false)?,
            Opcode::Br => {
                let target = self.read_u32() as usize;
                self.jump(target);
            }
            Opcode::Beq => self.branch_compare(CompareKind::Eq),
            Opcode::Bne => self.branch_compare(CompareKind::Ne),
            Opcode::Bgt => self.branch_compare(CompareKind::Gt),
            Opcode::Bge => self.branch_compare(CompareKind::Ge),
            Opcode::Blt => self.branch_compare(CompareKind::Lt),
            Opcode::Ble => self.branch_compare(CompareKind::Le),
            Opcode::Bze => self.branch_test(true),
            Opcode::Bnz => self.branch_test(false),
            Opcode::Sw => {
                let selector = self.read_operand(false);
                let index = self.read_selector(selector);
                let count = self.read_u32() as usize;
                let table_at = self.sf.iptr;
                self.sf.iptr += count * 4;
                if (index as usize) < count {
                    let target = kiln_types::bytes::read_u32(
                        &self.code()[table_at + index as usize * 4..],
                    ) as usize;
                    self.jump(target);
                }
            }
            Opcode::Call => {
                let method = MethodId::new(self.read_u32());
                self.push_stack_frame(method)?;
            }
            Opcode::Callv => {
                let pointer = self.read_operand(false);
                let handle = self.read_scalar::<u64>(pointer);
                debug_assert_ne!(handle, 0, "null method pointer");
                let method = MethodId::new((handle ^ self.data.runtime_hash) as u32);
                self.push_stack_frame(method)?;
            }
            Opcode::Ret => {
                self.pop_stack_frame();
            }
            Opcode::Retv => {
                let sub = self.read_subcode();
                let value = self.read_operand(true);
                let method = &self.data.module.methods[self.sf.method.index()];
                let sig = &self.data.module.signatures[method.signature.index()];
                let slot = Loc {
                    ty: sig.return_type,
                    place: Place::Mem(self.stack_base + self.sf.return_offset),
                };
                self.exec_set(sub, slot, value);
                self.ret_value = Some(slot);
                self.pop_stack_frame();
            }
            Opcode::Dump => {
                let target = self.read_operand(true);
                let mut text = String::new();
                self.render(target, &mut text);
                self.sink.dump(&text);
            }
        }
        Ok(())
    }

    fn arith(&mut self, kind: ArithKind) {
        let sub = self.read_subcode();
        let lhs = self.read_operand(false);
        let rhs = self.read_operand(true);
        macro_rules! arms {
            ($(($n:literal, $lk:ident, $lt:ty, $rk:ident, $rt:ty)),+ $(,)?) => {
                match sub {
                    $($n => {
                        let r = self.read_scalar::<$rt>(rhs) as $lt;
                        let l = self.read_scalar::<$lt>(lhs);
                        let v = match kind {
                            ArithKind::Mul => l.vm_mul(r),
                            ArithKind::Div => l.vm_div(r),
                            ArithKind::Mod => l.vm_rem(r),
                            ArithKind::Add => l.vm_add(r),
                            ArithKind::Sub => l.vm_sub(r),
                        };
                        self.write_scalar::<$lt>(lhs, v);
                    })+
                    _ => unreachable!("subcode validated by linker"),
                }
            };
        }
        kiln_asm::with_arith_pairs!(arms);
    }

    fn integral(&mut self, kind: IntKind) {
        let sub = self.read_subcode();
        let lhs = self.read_operand(false);
        let rhs = self.read_operand(true);
        macro_rules! arms {
            ($(($n:literal, $lk:ident, $lt:ty, $rk:ident, $rt:ty)),+ $(,)?) => {
                match sub {
                    $($n => {
                        let r = self.read_scalar::<$rt>(rhs) as $lt;
                        let l = self.read_scalar::<$lt>(lhs);
                        let v = match kind {
                            IntKind::Lsh => l.vm_shl(r),
                            IntKind::Rsh => l.vm_shr(r),
                            IntKind::And => l.vm_and(r),
                            IntKind::Xor => l.vm_xor(r),
                            IntKind::Or => l.vm_or(r),
                        };
                        self.write_scalar::<$lt>(lhs, v);
                    })+
                    _ => unreachable!("subcode validated by linker"),
                }
            };
        }
        kiln_asm::with_integral_pairs!(arms);
    }

    fn exec_not(&mut self, sub: usize, target: Loc) {
        macro_rules! arms {
            ($(($n:literal, $k:ident, $t:ty)),+ $(,)?) => {
                match sub {
                    $($n => {
                        let v = self.read_scalar::<$t>(target);
                        self.write_scalar::<$t>(target, !v);
                    })+
                    _ => unreachable!("subcode validated by linker"),
                }
            };
        }
        kiln_asm::with_not_types!(arms);
    }

    fn exec_neg(&mut self, sub: usize, target: Loc) {
        macro_rules! arms {
            ($(($n:literal, $k:ident, $t:ty)),+ $(,)?) => {
                match sub {
                    $($n => {
                        let v = self.read_scalar::<$t>(target);
                        self.write_scalar::<$t>(target, v.vm_neg());
                    })+
                    _ => unreachable!("subcode validated by linker"),
                }
            };
        }
        kiln_asm::with_neg_types!(arms);
    }

    /// `set` and argument passing: the implicit conversion table plus the
    /// raw copy subcode.
    fn exec_set(&mut self, sub: usize, lhs: Loc, rhs: Loc) {
        if sub == kiln_asm::SET_COPY_SUBCODE.index() {
            let size = self.ty(rhs.ty).total_size;
            self.copy_bytes(lhs, rhs, size);
            return;
        }
        macro_rules! arms {
            ($(($n:literal, $lk:ident, $lt:ty, $rk:ident, $rt:ty)),+ $(,)?) => {
                match sub {
                    $($n => {
                        let v = self.read_scalar::<$rt>(rhs) as $lt;
                        self.write_scalar::<$lt>(lhs, v);
                    })+
                    _ => unreachable!("subcode validated by linker"),
                }
            };
        }
        kiln_asm::with_arith_pairs!(arms);
    }

    fn exec_conv(&mut self, sub: usize, lhs: Loc, rhs: Loc) {
        macro_rules! arms {
            ($(($n:literal, $lk:ident, $lt:ty, $rk:ident, $rt:ty)),+ $(,)?) => {
                match sub {
                    $($n => {
                        let v = self.read_scalar::<$rt>(rhs) as $lt;
                        self.write_scalar::<$lt>(lhs, v);
                    })+
                    _ => unreachable!("subcode validated by linker"),
                }
            };
        }
        kiln_asm::with_conv_pairs!(arms);
    }

    fn copy_bytes(&mut self, lhs: Loc, rhs: Loc, size: usize) {
        let Place::Mem(dst) = lhs.place else {
            unreachable!("copy target validated by linker");
        };
        debug_assert!(dst >= self.globals_base, "write into the constant block");
        match rhs.place {
            Place::Mem(src) => self.memory.copy_within(src..src + size, dst),
            Place::Imm(src) => {
                let bytes = self.code()[src..src + size].to_vec();
                self.memory[dst..dst + size].copy_from_slice(&bytes);
            }
            Place::Scratch(cell) => {
                let bytes = self.scratch[cell];
                self.memory[dst..dst + size].copy_from_slice(&bytes[..size]);
            }
        }
    }

    fn pointer_offset(&mut self, subtract: bool) {
        let sub = self.read_subcode();
        let lhs = self.read_operand(false);
        let rhs = self.read_operand(true);
        let pointee_size = match self.ty(lhs.ty).generated {
            Some(Generated::Pointer { pointee_size, .. }) => pointee_size as u64,
            _ => unreachable!("pointer operand validated by linker"),
        };
        macro_rules! arms {
            ($(($n:literal, $k:ident, $t:ty)),+ $(,)?) => {
                match sub {
                    $($n => self.read_scalar::<$t>(rhs) as i64,)+
                    _ => unreachable!("subcode validated by linker"),
                }
            };
        }
        let elements = kiln_asm::with_pointer_offset_types!(arms);
        let delta = pointee_size.wrapping_mul(elements as u64);
        let pointer = self.read_scalar::<u64>(lhs);
        let moved = if subtract {
            pointer.wrapping_sub(delta)
        } else {
            pointer.wrapping_add(delta)
        };
        self.write_scalar(lhs, moved);
    }

    fn eval_compare(&mut self, kind: CompareKind, sub: usize, lhs: Loc, rhs: Loc) -> i32 {
        macro_rules! arms {
            ($(($n:literal, $lk:ident, $lt:ty, $rk:ident, $rt:ty, $ck:ident, $ct:ty)),+ $(,)?) => {
                match sub {
                    $($n => {
                        let l = self.read_scalar::<$lt>(lhs) as $ct;
                        let r = self.read_scalar::<$rt>(rhs) as $ct;
                        match kind {
                            CompareKind::Cmp => {
                                if l < r {
                                    -1
                                } else if l > r {
                                    1
                                } else {
                                    0
                                }
                            }
                            CompareKind::Eq => (l == r) as i32,
                            CompareKind::Ne => (l != r) as i32,
                            CompareKind::Gt => (l > r) as i32,
                            CompareKind::Ge => (l >= r) as i32,
                            CompareKind::Lt => (l < r) as i32,
                            CompareKind::Le => (l <= r) as i32,
                        }
                    })+
                    _ => unreachable!("subcode validated by linker"),
                }
            };
        }
        kiln_asm::with_compare_pairs!(arms)
    }

    fn eval_test(&mut self, zero: bool, sub: usize, target: Loc) -> i32 {
        macro_rules! arms {
            ($(($n:literal, $k:ident, $t:ty)),+ $(,)?) => {
                match sub {
                    $($n => {
                        let v = self.read_scalar::<$t>(target);
                        let nonzero = v != (0 as $t);
                        if zero { (!nonzero) as i32 } else { nonzero as i32 }
                    })+
                    _ => unreachable!("subcode validated by linker"),
                }
            };
        }
        kiln_asm::with_test_types!(arms)
    }

    fn compare(&mut self, kind: CompareKind) -> Result<(), RuntimeError> {
        let sub = self.read_subcode();
        let lhs = self.read_operand(false);
        let rhs = self.read_operand(true);
        let result = self.eval_compare(kind, sub, lhs, rhs);
        let slot = self.push_return_value(TypeId::I32)?;
        self.write_scalar(slot, result);
        Ok(())
    }

    fn zero_test(&mut self, zero: bool) -> Result<(), RuntimeError> {
        let sub = self.read_subcode();
        let target = self.read_operand(true);
        let result = self.eval_test(zero, sub, target);
        let slot = self.push_return_value(TypeId::I32)?;
        self.write_scalar(slot, result);
        Ok(())
    }

    fn branch_compare(&mut self, kind: CompareKind) {
        let target = self.read_u32() as usize;
        let sub = self.read_subcode();
        let lhs = self.read_operand(false);
        let rhs = self.read_operand(true);
        if self.eval_compare(kind, sub, lhs, rhs) != 0 {
            self.jump(target);
        }
    }

    fn branch_test(&mut self, zero: bool) {
        let target = self.read_u32() as usize;
        let sub = self.read_subcode();
        let operand = self.read_operand(true);
        if self.eval_test(zero, sub, operand) != 0 {
            self.jump(target);
        }
    }

    fn read_selector(&mut self, selector: Loc) -> u32 {
        match selector.ty {
            TypeId::I8 => self.read_scalar::<i8>(selector) as u32,
            TypeId::U8 => self.read_scalar::<u8>(selector) as u32,
            TypeId::I16 => self.read_scalar::<i16>(selector) as u32,
            TypeId::U16 => self.read_scalar::<u16>(selector) as u32,
            TypeId::I32 => self.read_scalar::<i32>(selector) as u32,
            TypeId::U32 => self.read_scalar::<u32>(selector),
            TypeId::I64 => self.read_scalar::<i64>(selector) as u32,
            TypeId::U64 => self.read_scalar::<u64>(selector) as u32,
            _ => unreachable!("selector type validated by linker"),
        }
    }

    fn jump(&mut self, target: usize) {
        self.sf.iptr = target;
        self.clear_return_value();
    }

    fn push_return_value(&mut self, ty: TypeId) -> Result<Loc, RuntimeError> {
        self.stack_size = self.sf.stack_end;
        let size = self.ty(ty).total_size;
        self.push_stack_bytes(size)?;
        let loc = Loc {
            ty,
            place: Place::Mem(self.stack_base + self.sf.stack_end),
        };
        self.ret_value = Some(loc);
        Ok(loc)
    }

    fn clear_return_value(&mut self) {
        self.stack_size = self.sf.stack_end;
        self.ret_value = None;
    }

    fn push_stack_bytes(&mut self, len: usize) -> Result<(), RuntimeError> {
        let target = self.stack_size + len;
        if target > self.stack_capacity {
            return Err(RuntimeError::StackOverflow {
                size: target,
                capacity: self.stack_capacity,
            });
        }
        self.stack_size = target;
        Ok(())
    }

    /// Pushes a frame for `method` and transfers control (or, for an
    /// external method, invokes the host thunk in place).
    fn push_stack_frame(&mut self, method_id: MethodId) -> Result<(), RuntimeError> {
        let data = self.data;
        let method = &data.module.methods[method_id.index()];
        let signature = &data.module.signatures[method.signature.index()];
        let is_external = method.is_external();
        let return_type = signature.return_type;
        let has_return = signature.has_return_value();
        let return_size = self.ty(return_type).total_size;
        let parameters_size = signature.parameters_size;
        let parameters = signature.parameters.clone();
        let method_stack_size = method.stack_size;

        // Grow (or reuse) the return slot above the caller's frame.
        let return_offset = self.sf.stack_end;
        let current_return_size = self.stack_size - self.sf.stack_end;
        if has_return && return_size > current_return_size {
            self.push_stack_bytes(return_size - current_return_size)?;
        }

        let frame_offset = self.stack_size;
        if !is_external {
            self.push_stack_bytes(Frame::BYTES)?;
        }

        let param_offset = self.stack_size;
        self.push_stack_bytes(parameters_size)?;

        // Argument values are evaluated in the caller's frame.
        if !self.sf.is_root() {
            let _argc = self.read_u8();
            for param in &parameters {
                let sub = self.read_subcode();
                let src = self.read_operand(true);
                let dst = Loc {
                    ty: param.ty,
                    place: Place::Mem(self.stack_base + param_offset + param.offset),
                };
                self.exec_set(sub, dst, src);
            }
        }

        if is_external {
            let runtime = self.runtime;
            let mut reader = kiln_asm::Reader::new(&method.bytecode);
            let lib = reader.u32();
            let call_index = reader.u32();
            let call = runtime
                .call(lib, call_index)
                .expect("external binding recorded by linker");
            trace!(symbol = %call.name, "external call");

            let param_at = self.stack_base + param_offset;
            let return_at = self.stack_base + return_offset;
            let (head, tail) = self.memory.split_at_mut(param_at);
            let params = &tail[..parameters_size];
            let ret = &mut head[return_at..return_at + return_size];
            (call.thunk)(ret, params);

            self.ret_value = has_return.then_some(Loc {
                ty: return_type,
                place: Place::Mem(return_at),
            });
            self.stack_size = frame_offset;
            return Ok(());
        }

        self.callstack_depth += 1;
        if self.callstack_depth > self.params.max_callstack_depth {
            return Err(RuntimeError::CallstackLimit {
                max_depth: self.params.max_callstack_depth,
            });
        }

        let stack_offset = self.stack_size;
        self.push_stack_bytes(method_stack_size)?;

        // The saved frame occupies its reserved bytes on the data stack and
        // is mirrored on the frame vector.
        self.frames.push(self.sf);
        self.sf = Frame {
            iptr: 0,
            method: method_id,
            return_offset,
            frame_offset,
            param_offset,
            stack_offset,
            stack_end: self.stack_size,
        };
        self.ret_value = None;
        Ok(())
    }

    fn pop_stack_frame(&mut self) {
        self.sf = self.frames.pop().expect("frame stack underflow");
        self.callstack_depth -= 1;
    }

    fn render(&self, loc: Loc, out: &mut String) {
        use core::fmt::Write;

        let def = self.ty(loc.ty);
        let name = self.data.module.type_name(loc.ty);
        match loc.ty {
            TypeId::I8 => {
                let _ = write!(out, "{name}({})", self.read_scalar::<i8>(loc));
            }
            TypeId::U8 => {
                let _ = write!(out, "{name}({})", self.read_scalar::<u8>(loc));
            }
            TypeId::I16 => {
                let _ = write!(out, "{name}({})", self.read_scalar::<i16>(loc));
            }
            TypeId::U16 => {
                let _ = write!(out, "{name}({})", self.read_scalar::<u16>(loc));
            }
            TypeId::I32 => {
                let _ = write!(out, "{name}({})", self.read_scalar::<i32>(loc));
            }
            TypeId::U32 => {
                let _ = write!(out, "{name}({})", self.read_scalar::<u32>(loc));
            }
            TypeId::I64 => {
                let _ = write!(out, "{name}({})", self.read_scalar::<i64>(loc));
            }
            TypeId::U64 => {
                let _ = write!(out, "{name}({})", self.read_scalar::<u64>(loc));
            }
            TypeId::F32 => {
                let _ = write!(out, "{name}({})", self.read_scalar::<f32>(loc));
            }
            TypeId::F64 => {
                let _ = write!(out, "{name}({})", self.read_scalar::<f64>(loc));
            }
            _ => {
                if def.is_pointer() || def.is_signature() {
                    let _ = write!(out, "{name}(0x{:X})", self.read_scalar::<u64>(loc));
                } else if let Some(Generated::Array { elem, len }) = def.generated {
                    let elem_size = self.ty(elem).total_size;
                    let Place::Mem(base) = loc.place else {
                        unreachable!("aggregate dump of non-memory operand");
                    };
                    out.push_str(&name);
                    out.push('{');
                    for i in 0..len {
                        out.push_str(if i == 0 { " " } else { ", " });
                        self.render(
                            Loc {
                                ty: elem,
                                place: Place::Mem(base + i * elem_size),
                            },
                            out,
                        );
                    }
                    out.push_str(" }");
                } else if !def.fields.is_empty() {
                    let Place::Mem(base) = loc.place else {
                        unreachable!("aggregate dump of non-memory operand");
                    };
                    let fields = def.fields.clone();
                    out.push_str(&name);
                    out.push('{');
                    for (i, field) in fields.iter().enumerate() {
                        out.push_str(if i == 0 { " " } else { ", " });
                        let _ = write!(
                            out,
                            "{} = ",
                            self.data.module.names.name_or(field.name, "<field>")
                        );
                        self.render(
                            Loc {
                                ty: field.ty,
                                place: Place::Mem(base + field.offset),
                            },
                            out,
                        );
                    }
                    out.push_str(" }");
                } else {
                    out.push_str("(?)");
                }
            }
        }
    }
}

static_assertions::const_assert_eq!(Frame::BYTES, 56);
