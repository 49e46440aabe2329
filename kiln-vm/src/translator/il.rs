//! Re-emission of a linked assembly as parseable IL text.

use std::collections::HashMap;
use std::fmt::Write;

use kiln_asm::{Opcode, Reader};
use kiln_types::{
    AddressHeader, AddressKind, AddressModifier, AddressPrefix, GlobalId, MethodId, OffsetId,
    TypeId,
};

use crate::assembly::{Assembly, AssemblyData};
use crate::error::RuntimeError;
use crate::module::{DataTable, Generated, MethodDef};

/// Renders a linked assembly back into IL text that the parser accepts.
pub fn translate_il(assembly: &Assembly) -> Result<String, RuntimeError> {
    if !assembly.is_valid() {
        return Err(RuntimeError::InvalidAssembly);
    }
    if !assembly.is_compatible() {
        return Err(RuntimeError::IncompatibleAssembly);
    }
    let data = assembly.data()?;
    let mut out = String::new();
    write_types(&data, &mut out);
    write_data_table(&data, &data.module.constants, true, &mut out);
    write_data_table(&data, &data.module.globals, false, &mut out);
    write_methods(&data, &mut out);
    Ok(out)
}

fn type_name(data: &AssemblyData, ty: TypeId) -> String {
    data.module.type_name(ty)
}

fn write_types(data: &AssemblyData, out: &mut String) {
    for ty in &data.module.types {
        if ty.is_base() || ty.is_generated() {
            continue;
        }
        let _ = writeln!(
            out,
            "{} {}",
            if ty.is_union() { "union" } else { "struct" },
            data.module.names.name_or(ty.name, "<anonymous>")
        );
        for field in &ty.fields {
            let _ = writeln!(
                out,
                "\t{} {}",
                type_name(data, field.ty),
                data.module.names.name_or(field.name, "<field>")
            );
        }
        out.push_str("end\n\n");
    }
}

fn write_literal(out: &mut String, ty: TypeId, bytes: &[u8]) {
    use kiln_types::bytes::{read_u16, read_u32, read_u64};
    let _ = match ty {
        TypeId::I8 => write!(out, "{}i8", bytes[0] as i8),
        TypeId::U8 => write!(out, "{}u8", bytes[0]),
        TypeId::I16 => write!(out, "{}i16", read_u16(bytes) as i16),
        TypeId::U16 => write!(out, "{}u16", read_u16(bytes)),
        TypeId::I32 => write!(out, "{}i32", read_u32(bytes) as i32),
        TypeId::U32 => write!(out, "{}u32", read_u32(bytes)),
        TypeId::I64 => write!(out, "{}i64", read_u64(bytes) as i64),
        TypeId::U64 => write!(out, "{}u64", read_u64(bytes)),
        TypeId::F32 => write!(out, "{}f32", f32::from_bits(read_u32(bytes))),
        TypeId::F64 => write!(out, "{}f64", f64::from_bits(read_u64(bytes))),
        _ => write!(out, "null"),
    };
}

/// Emits the laid-out value of one data entry as a flat `init` sequence.
fn write_value(data: &AssemblyData, ty: TypeId, bytes: &[u8], offset: usize, out: &mut String) {
    let def = &data.module.types[ty.index()];
    match def.generated {
        Some(Generated::Signature(_)) => {
            let handle = kiln_types::bytes::read_u64(&bytes[offset..]);
            if handle == 0 {
                out.push_str("null");
            } else {
                let method = MethodId::new((handle ^ data.runtime_hash) as u32);
                let name = data
                    .module
                    .methods
                    .get(method.index())
                    .map(|m| data.module.names.name_or(m.name, "<method>"))
                    .unwrap_or("<method>");
                out.push_str(name);
            }
        }
        Some(Generated::Pointer { .. }) => {
            // Only null pointer values survive serialization; flat addresses
            // would be meaningless in a fresh image.
            out.push_str("null");
        }
        Some(Generated::Array { elem, len }) => {
            let elem_size = data.module.types[elem.index()].total_size;
            for i in 0..len {
                if i != 0 {
                    out.push(' ');
                }
                write_value(data, elem, bytes, offset + i * elem_size, out);
            }
        }
        None if def.is_base() => write_literal(out, ty, &bytes[offset..]),
        None => {
            for (i, field) in def.fields.iter().enumerate() {
                if i != 0 {
                    out.push(' ');
                }
                write_value(data, field.ty, bytes, offset + field.offset, out);
            }
        }
    }
}

fn write_data_table(data: &AssemblyData, table: &DataTable, constant: bool, out: &mut String) {
    if table.entries.is_empty() {
        return;
    }
    out.push_str(if constant { "constant\n" } else { "global\n" });
    for entry in &table.entries {
        let _ = write!(
            out,
            "\t{} {} init ",
            type_name(data, entry.ty),
            data.module.names.name_or(entry.name, "<global>")
        );
        write_value(data, entry.ty, &table.data, entry.offset, out);
        out.push_str(" end\n");
    }
    out.push_str("end\n\n");
}

struct MethodPrinter<'a> {
    data: &'a AssemblyData,
    method: &'a MethodDef,
    /// Bytecode offset to label number, numbered in offset order.
    labels: HashMap<u32, usize>,
}

fn write_methods(data: &AssemblyData, out: &mut String) {
    for method in &data.module.methods {
        if method.is_external() || !method.is_defined() {
            continue;
        }
        let signature = &data.module.signatures[method.signature.index()];
        let _ = write!(
            out,
            "method {}",
            data.module.names.name_or(method.name, "<method>")
        );
        if signature.has_return_value() {
            let _ = write!(out, " returns {}", type_name(data, signature.return_type));
        }
        if signature.parameters.is_empty() {
            out.push('\n');
        } else {
            out.push_str(" parameters\n");
            for (i, param) in signature.parameters.iter().enumerate() {
                let _ = writeln!(out, "\t\t{i}: {}", type_name(data, param.ty));
            }
            out.push_str("\tend\n\n");
        }

        if !method.stackvars.is_empty() {
            out.push_str("\tstack\n");
            for (i, var) in method.stackvars.iter().enumerate() {
                let _ = writeln!(out, "\t\t{i}: {}", type_name(data, var.ty));
            }
            out.push_str("\tend\n\n");
        }

        let mut offsets: Vec<u32> = method.labels.clone();
        offsets.sort_unstable();
        offsets.dedup();
        let labels = offsets
            .iter()
            .enumerate()
            .map(|(i, &offset)| (offset, i))
            .collect();

        let printer = MethodPrinter {
            data,
            method,
            labels,
        };
        printer.write_body(out);
        out.push_str("end\n\n");
    }
}

impl MethodPrinter<'_> {
    fn write_body(&self, out: &mut String) {
        let code = &self.method.bytecode;
        let mut reader = Reader::new(code);
        loop {
            if let Some(&label) = self.labels.get(&(reader.pos() as u32)) {
                let _ = writeln!(out, "label_{label}:");
            }
            if reader.is_at_end() {
                break;
            }
            let op = reader.opcode().expect("opcode validated by linker");
            let _ = write!(out, "\t{op}");
            match op {
                Opcode::Noop | Opcode::Ret => {}
                Opcode::Dump => self.write_address(&mut reader, out),
                Opcode::Pdif => {
                    self.write_address(&mut reader, out);
                    self.write_address(&mut reader, out);
                }
                Opcode::Not | Opcode::Neg | Opcode::Cze | Opcode::Cnz | Opcode::Retv => {
                    reader.subcode();
                    self.write_address(&mut reader, out);
                }
                Opcode::Set
                | Opcode::Conv
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Add
                | Opcode::Sub
                | Opcode::Lsh
                | Opcode::Rsh
                | Opcode::And
                | Opcode::Xor
                | Opcode::Or
                | Opcode::Padd
                | Opcode::Psub
                | Opcode::Cmp
                | Opcode::Ceq
                | Opcode::Cne
                | Opcode::Cgt
                | Opcode::Cge
                | Opcode::Clt
                | Opcode::Cle => {
                    reader.subcode();
                    self.write_address(&mut reader, out);
                    self.write_address(&mut reader, out);
                }
                Opcode::Br => self.write_label_ref(&mut reader, out),
                Opcode::Bze | Opcode::Bnz => {
                    self.write_label_ref(&mut reader, out);
                    reader.subcode();
                    self.write_address(&mut reader, out);
                }
                Opcode::Beq
                | Opcode::Bne
                | Opcode::Bgt
                | Opcode::Bge
                | Opcode::Blt
                | Opcode::Ble => {
                    self.write_label_ref(&mut reader, out);
                    reader.subcode();
                    self.write_address(&mut reader, out);
                    self.write_address(&mut reader, out);
                }
                Opcode::Sw => {
                    self.write_address(&mut reader, out);
                    let count = reader.u32();
                    for _ in 0..count {
                        self.write_label_ref(&mut reader, out);
                    }
                }
                Opcode::Call => {
                    let method = MethodId::new(reader.u32());
                    let name = self
                        .data
                        .module
                        .names
                        .name_or(self.data.module.methods[method.index()].name, "<method>");
                    let _ = write!(out, " {name}");
                    let argc = reader.u8();
                    for _ in 0..argc {
                        reader.subcode();
                        self.write_address(&mut reader, out);
                    }
                }
                Opcode::Callv => {
                    self.write_address(&mut reader, out);
                    let argc = reader.u8();
                    for _ in 0..argc {
                        reader.subcode();
                        self.write_address(&mut reader, out);
                    }
                }
            }
            out.push('\n');
        }
    }

    fn write_label_ref(&self, reader: &mut Reader<'_>, out: &mut String) {
        let target = reader.u32();
        let label = self.labels.get(&target).expect("branch into a label position");
        let _ = write!(out, " label_{label}");
    }

    fn write_address(&self, reader: &mut Reader<'_>, out: &mut String) {
        let header = AddressHeader::from_bits(reader.u32());
        out.push(' ');
        match header.prefix() {
            AddressPrefix::None => {}
            AddressPrefix::Indirection => out.push('*'),
            AddressPrefix::AddressOf => out.push('&'),
            AddressPrefix::SizeOf => out.push('!'),
        }

        match header.kind() {
            AddressKind::Constant => {
                let ty = TypeId::new(header.index());
                let bytes = reader.bytes(ty.base_size());
                write_literal(out, ty, bytes);
                return;
            }
            AddressKind::StackVar => {
                if header.index() == AddressHeader::INDEX_MAX {
                    out.push_str("{^}");
                } else {
                    let _ = write!(out, "{{{}}}", header.index());
                }
            }
            AddressKind::Parameter => {
                let _ = write!(out, "({})", header.index());
            }
            AddressKind::Global => {
                let global = GlobalId::new(header.index());
                let table = if global.is_constant() {
                    &self.data.module.constants
                } else {
                    &self.data.module.globals
                };
                let name = table.entries[global.table_index()].name;
                out.push_str(self.data.module.names.name_or(name, "<global>"));
            }
        }

        match header.modifier() {
            AddressModifier::None => {
                reader.skip(8);
            }
            AddressModifier::DirectField | AddressModifier::IndirectField => {
                let indirect = header.modifier() == AddressModifier::IndirectField;
                let offset = OffsetId::new(reader.u64() as u32);
                out.push_str(if indirect { "->" } else { "." });
                self.write_offset(offset, out);
            }
            AddressModifier::Subscript => {
                let index = reader.i64();
                let _ = write!(out, "[{index}]");
            }
        }
    }

    fn write_offset(&self, offset: OffsetId, out: &mut String) {
        let entry = &self.data.module.offsets[offset.index()];
        out.push_str(&type_name(self.data, entry.address.root));
        for (i, &field) in entry.address.fields.iter().enumerate() {
            out.push(if i == 0 { ':' } else { '.' });
            out.push_str(self.data.module.names.name_or(field, "<field>"));
        }
    }
}
