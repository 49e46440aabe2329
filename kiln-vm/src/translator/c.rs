//! Re-emission of a linked assembly as C source.
//!
//! The load-bearing contracts here are the deterministic name mangling and
//! the constant emission; the statement emitter maps each instruction onto
//! one C statement and leans on C's own implicit arithmetic conversions,
//! which the subcode tables were modelled on in the first place.

use std::collections::HashSet;
use std::fmt::Write;

use itertools::Itertools;
use kiln_asm::{Opcode, Reader};
use kiln_types::{
    AddressHeader, AddressKind, AddressModifier, AddressPrefix, GlobalId, MethodId, NameId,
    OffsetId, TypeId,
};

use crate::assembly::{Assembly, AssemblyData};
use crate::error::RuntimeError;
use crate::module::{Generated, MethodDef, ModuleData};

/// C spelling of a type. Named types mangle to `kt_<name>`, generated types
/// mangle structurally.
pub fn mangle_type(module: &ModuleData, ty: TypeId) -> String {
    const BASE: [&str; 12] = [
        "int8_t", "uint8_t", "int16_t", "uint16_t", "int32_t", "uint32_t", "int64_t",
        "uint64_t", "float", "double", "void*", "void",
    ];
    if ty.is_base() {
        return BASE[ty.index()].to_owned();
    }
    let def = &module.types[ty.index()];
    match def.generated {
        Some(Generated::Pointer { pointee, .. }) => format!("{}*", mangle_type(module, pointee)),
        Some(Generated::Array { elem, len }) => {
            format!("{}[{len}]", mangle_type(module, elem))
        }
        Some(Generated::Signature(_)) => "void*".to_owned(),
        None => format!("kt_{}", module.names.name_or(def.name, "anon")),
    }
}

/// C spelling of a method: `km_<name>`.
pub fn mangle_method(module: &ModuleData, method: MethodId) -> String {
    format!(
        "km_{}",
        module.names.name_or(module.methods[method.index()].name, "anon")
    )
}

/// C spelling of a global (`kg_<name>`) or constant (`kc_<name>`).
pub fn mangle_global(module: &ModuleData, name: NameId, constant: bool) -> String {
    format!(
        "{}{}",
        if constant { "kc_" } else { "kg_" },
        module.names.name_or(name, "anon")
    )
}

/// A C declarator for `ident` of type `ty`; arrays and function pointers
/// need the identifier woven into the type spelling.
fn declarator(module: &ModuleData, ty: TypeId, ident: &str) -> String {
    let def = &module.types[ty.index()];
    match def.generated {
        Some(Generated::Array { elem, len }) => {
            declarator(module, elem, &format!("{ident}[{len}]"))
        }
        Some(Generated::Signature(sig)) => {
            let sig = &module.signatures[sig.index()];
            let params = sig
                .parameters
                .iter()
                .map(|p| mangle_type(module, p.ty))
                .join(", ");
            format!(
                "{} (*{ident})({params})",
                mangle_type(module, sig.return_type)
            )
        }
        _ => format!("{} {ident}", mangle_type(module, ty)),
    }
}

/// Renders a linked assembly as a single C translation unit.
pub fn translate_c(assembly: &Assembly) -> Result<String, RuntimeError> {
    if !assembly.is_valid() {
        return Err(RuntimeError::InvalidAssembly);
    }
    if !assembly.is_compatible() {
        return Err(RuntimeError::IncompatibleAssembly);
    }
    let data = assembly.data()?;
    let module = &data.module;
    let mut out = String::new();

    out.push_str("#include <stdint.h>\n#include <stdio.h>\n#include <string.h>\n\n");

    // Forward declarations, then definitions in containment order.
    for ty in &module.types {
        if ty.is_struct() && ty.is_defined() {
            let keyword = if ty.is_union() { "union" } else { "struct" };
            let name = mangle_type(module, ty.index);
            let _ = writeln!(out, "typedef {keyword} {name} {name};");
        }
    }
    out.push('\n');

    let mut emitted = HashSet::new();
    for ty in &module.types {
        if ty.is_struct() && ty.is_defined() {
            write_struct_definition(module, ty.index, &mut emitted, &mut out);
        }
    }

    write_c_data(&data, true, &mut out);
    write_c_data(&data, false, &mut out);

    for method in &module.methods {
        if method.is_external() || !method.is_defined() {
            continue;
        }
        let _ = writeln!(out, "{};", method_heading(module, method));
    }
    out.push('\n');

    for method in &module.methods {
        if method.is_external() || !method.is_defined() {
            continue;
        }
        write_c_method(&data, method, &mut out);
    }
    Ok(out)
}

fn write_struct_definition(
    module: &ModuleData,
    ty: TypeId,
    emitted: &mut HashSet<TypeId>,
    out: &mut String,
) {
    if !emitted.insert(ty) {
        return;
    }
    let def = &module.types[ty.index()];
    // Value-contained aggregates must be complete first.
    for field in &def.fields {
        let mut inner = field.ty;
        while let Some(Generated::Array { elem, .. }) = module.types[inner.index()].generated {
            inner = elem;
        }
        if module.types[inner.index()].is_struct() {
            write_struct_definition(module, inner, emitted, out);
        }
    }
    let keyword = if def.is_union() { "union" } else { "struct" };
    let _ = writeln!(out, "{keyword} {} {{", mangle_type(module, ty));
    for field in &def.fields {
        let ident = module.names.name_or(field.name, "field").to_owned();
        let _ = writeln!(out, "    {};", declarator(module, field.ty, &ident));
    }
    out.push_str("};\n\n");
}

fn write_c_scalar(module: &ModuleData, ty: TypeId, bytes: &[u8], out: &mut String) {
    use kiln_types::bytes::{read_u16, read_u32, read_u64};
    let _ = match ty {
        TypeId::I8 => write!(out, "{}", bytes[0] as i8),
        TypeId::U8 => write!(out, "{}u", bytes[0]),
        TypeId::I16 => write!(out, "{}", read_u16(bytes) as i16),
        TypeId::U16 => write!(out, "{}u", read_u16(bytes)),
        TypeId::I32 => write!(out, "{}", read_u32(bytes) as i32),
        TypeId::U32 => write!(out, "{}u", read_u32(bytes)),
        TypeId::I64 => write!(out, "{}ll", read_u64(bytes) as i64),
        TypeId::U64 => write!(out, "{}ull", read_u64(bytes)),
        TypeId::F32 => write!(out, "{}f", f32::from_bits(read_u32(bytes))),
        TypeId::F64 => write!(out, "{}", f64::from_bits(read_u64(bytes))),
        _ => write!(out, "0"),
    };
}

/// Brace initializer of one laid-out value.
fn write_c_value(data: &AssemblyData, ty: TypeId, bytes: &[u8], offset: usize, out: &mut String) {
    let module = &data.module;
    let def = &module.types[ty.index()];
    match def.generated {
        Some(Generated::Signature(_)) => {
            let handle = kiln_types::bytes::read_u64(&bytes[offset..]);
            if handle == 0 {
                out.push_str("0");
            } else {
                let method = MethodId::new((handle ^ data.runtime_hash) as u32);
                out.push_str(&mangle_method(module, method));
            }
        }
        Some(Generated::Pointer { .. }) => out.push_str("0"),
        Some(Generated::Array { elem, len }) => {
            let elem_size = module.types[elem.index()].total_size;
            out.push('{');
            for i in 0..len {
                if i != 0 {
                    out.push_str(", ");
                }
                write_c_value(data, elem, bytes, offset + i * elem_size, out);
            }
            out.push('}');
        }
        None if def.is_base() => write_c_scalar(module, ty, &bytes[offset..], out),
        None => {
            out.push('{');
            for (i, field) in def.fields.iter().enumerate() {
                if i != 0 {
                    out.push_str(", ");
                }
                write_c_value(data, field.ty, bytes, offset + field.offset, out);
            }
            out.push('}');
        }
    }
}

fn write_c_data(data: &AssemblyData, constant: bool, out: &mut String) {
    let module = &data.module;
    let table = if constant {
        &module.constants
    } else {
        &module.globals
    };
    for entry in &table.entries {
        let ident = mangle_global(module, entry.name, constant);
        let qualifier = if constant { "static const " } else { "static " };
        let _ = write!(out, "{qualifier}{} = ", declarator(module, entry.ty, &ident));
        write_c_value(data, entry.ty, &table.data, entry.offset, out);
        out.push_str(";\n");
    }
    if !table.entries.is_empty() {
        out.push('\n');
    }
}

fn method_heading(module: &ModuleData, method: &MethodDef) -> String {
    let sig = &module.signatures[method.signature.index()];
    let params = if sig.parameters.is_empty() {
        "void".to_owned()
    } else {
        sig.parameters
            .iter()
            .enumerate()
            .map(|(i, p)| declarator(module, p.ty, &format!("p{i}")))
            .join(", ")
    };
    format!(
        "static {} {}({params})",
        mangle_type(module, sig.return_type),
        mangle_method(module, method.index)
    )
}

/// Scalar C temp backing the return slot after a value-producing
/// instruction.
fn rv_name(module: &ModuleData, ty: TypeId) -> Option<String> {
    if ty.is_arithmetic() {
        let mangled = mangle_type(module, ty);
        Some(format!("rv_{}", mangled.trim_end_matches("_t")))
    } else {
        None
    }
}

struct CBody<'a> {
    data: &'a AssemblyData,
    method: &'a MethodDef,
    rv: Option<String>,
}

fn write_c_method(data: &AssemblyData, method: &MethodDef, out: &mut String) {
    let module = &data.module;
    let _ = writeln!(out, "{} {{", method_heading(module, method));

    for (i, var) in method.stackvars.iter().enumerate() {
        let _ = writeln!(out, "    {};", declarator(module, var.ty, &format!("s{i}")));
    }

    // Return-slot temps used by this body.
    let mut rv_types = Vec::new();
    collect_rv_types(data, method, &mut rv_types);
    for ty in &rv_types {
        if let Some(name) = rv_name(module, *ty) {
            let _ = writeln!(out, "    {};", declarator(module, *ty, &name));
        }
    }

    let mut body = CBody {
        data,
        method,
        rv: None,
    };
    body.write(out);
    out.push_str("}\n\n");
}

/// Pre-scan collecting the scalar types the return slot takes in a body.
fn collect_rv_types(data: &AssemblyData, method: &MethodDef, out: &mut Vec<TypeId>) {
    let module = &data.module;
    let mut push = |ty: TypeId| {
        if ty.is_arithmetic() && !out.contains(&ty) {
            out.push(ty);
        }
    };
    let mut reader = Reader::new(&method.bytecode);
    while !reader.is_at_end() {
        let op = reader.opcode().expect("opcode validated by linker");
        match op {
            Opcode::Cmp
            | Opcode::Ceq
            | Opcode::Cne
            | Opcode::Cgt
            | Opcode::Cge
            | Opcode::Clt
            | Opcode::Cle => {
                push(TypeId::I32);
                reader.subcode();
                skip_address(&mut reader);
                skip_address(&mut reader);
            }
            Opcode::Cze | Opcode::Cnz => {
                push(TypeId::I32);
                reader.subcode();
                skip_address(&mut reader);
            }
            Opcode::Pdif => {
                push(TypeId::OFFSET);
                skip_address(&mut reader);
                skip_address(&mut reader);
            }
            Opcode::Call => {
                let target = MethodId::new(reader.u32());
                let sig = module.methods[target.index()].signature;
                push(module.signatures[sig.index()].return_type);
                let argc = reader.u8();
                for _ in 0..argc {
                    reader.subcode();
                    skip_address(&mut reader);
                }
            }
            Opcode::Callv => {
                skip_address(&mut reader);
                let argc = reader.u8();
                for _ in 0..argc {
                    reader.subcode();
                    skip_address(&mut reader);
                }
            }
            _ => skip_operands(&mut reader, op),
        }
    }
}

fn skip_address(reader: &mut Reader<'_>) {
    let header = AddressHeader::from_bits(reader.u32());
    if header.kind() == AddressKind::Constant {
        reader.skip(TypeId::new(header.index()).base_size());
    } else {
        reader.skip(8);
    }
}

fn skip_operands(reader: &mut Reader<'_>, op: Opcode) {
    match op {
        Opcode::Noop | Opcode::Ret => {}
        Opcode::Dump => skip_address(reader),
        Opcode::Not | Opcode::Neg | Opcode::Retv => {
            reader.subcode();
            skip_address(reader);
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
        | Opcode::Psub => {
            reader.subcode();
            skip_address(reader);
            skip_address(reader);
        }
        Opcode::Br => {
            reader.u32();
        }
        Opcode::Beq | Opcode::Bne | Opcode::Bgt | Opcode::Bge | Opcode::Blt | Opcode::Ble => {
            reader.u32();
            reader.subcode();
            skip_address(reader);
            skip_address(reader);
        }
        Opcode::Bze | Opcode::Bnz => {
            reader.u32();
            reader.subcode();
            skip_address(reader);
        }
        Opcode::Sw => {
            skip_address(reader);
            let count = reader.u32();
            reader.skip(count as usize * 4);
        }
        _ => unreachable!("handled by caller"),
    }
}

impl CBody<'_> {
    fn module(&self) -> &ModuleData {
        &self.data.module
    }

    fn write(&mut self, out: &mut String) {
        let mut labels: Vec<u32> = self.method.labels.clone();
        labels.sort_unstable();
        labels.dedup();

        let code = &self.method.bytecode;
        let mut reader = Reader::new(code);
        loop {
            if labels.binary_search(&(reader.pos() as u32)).is_ok() {
                let _ = writeln!(out, "l_{}:;", reader.pos());
            }
            if reader.is_at_end() {
                break;
            }
            let op = reader.opcode().expect("opcode validated by linker");
            out.push_str("    ");
            self.write_statement(op, &mut reader, out);
            out.push('\n');
        }
    }

    fn write_statement(&mut self, op: Opcode, reader: &mut Reader<'_>, out: &mut String) {
        match op {
            Opcode::Noop => out.push(';'),
            Opcode::Set => {
                reader.subcode();
                let lhs = self.address(reader);
                let rhs = self.address(reader);
                let _ = write!(out, "{lhs} = {rhs};");
                self.rv = None;
            }
            Opcode::Conv => {
                let sub = reader.subcode();
                let lhs = self.address(reader);
                let rhs = self.address(reader);
                let dst = kiln_asm::CONV_PAIRS[sub.index()].0;
                let _ = write!(out, "{lhs} = ({}){rhs};", mangle_type(self.module(), dst));
                self.rv = None;
            }
            Opcode::Not => {
                reader.subcode();
                let target = self.address(reader);
                let _ = write!(out, "{target} = ~{target};");
                self.rv = None;
            }
            Opcode::Neg => {
                reader.subcode();
                let target = self.address(reader);
                let _ = write!(out, "{target} = -{target};");
                self.rv = None;
            }
            Opcode::Mul
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
            | Opcode::Psub => {
                reader.subcode();
                let lhs = self.address(reader);
                let rhs = self.address(reader);
                let symbol = match op {
                    Opcode::Mul => "*=",
                    Opcode::Div => "/=",
                    Opcode::Mod => "%=",
                    Opcode::Add | Opcode::Padd => "+=",
                    Opcode::Sub | Opcode::Psub => "-=",
                    Opcode::Lsh => "<<=",
                    Opcode::Rsh => ">>=",
                    Opcode::And => "&=",
                    Opcode::Xor => "^=",
                    _ => "|=",
                };
                let _ = write!(out, "{lhs} {symbol} {rhs};");
                self.rv = None;
            }
            Opcode::Pdif => {
                let lhs = self.address(reader);
                let rhs = self.address(reader);
                let rv = rv_name(self.module(), TypeId::OFFSET).expect("offset rv");
                let _ = write!(out, "{rv} = {lhs} - {rhs};");
                self.rv = Some(rv);
            }
            Opcode::Cmp => {
                reader.subcode();
                let lhs = self.address(reader);
                let rhs = self.address(reader);
                let rv = rv_name(self.module(), TypeId::I32).expect("i32 rv");
                let _ = write!(
                    out,
                    "{rv} = ({lhs} < {rhs}) ? -1 : ({lhs} > {rhs}) ? 1 : 0;"
                );
                self.rv = Some(rv);
            }
            Opcode::Ceq | Opcode::Cne | Opcode::Cgt | Opcode::Cge | Opcode::Clt | Opcode::Cle => {
                reader.subcode();
                let lhs = self.address(reader);
                let rhs = self.address(reader);
                let symbol = match op {
                    Opcode::Ceq => "==",
                    Opcode::Cne => "!=",
                    Opcode::Cgt => ">",
                    Opcode::Cge => ">=",
                    Opcode::Clt => "<",
                    _ => "<=",
                };
                let rv = rv_name(self.module(), TypeId::I32).expect("i32 rv");
                let _ = write!(out, "{rv} = {lhs} {symbol} {rhs};");
                self.rv = Some(rv);
            }
            Opcode::Cze | Opcode::Cnz => {
                reader.subcode();
                let target = self.address(reader);
                let rv = rv_name(self.module(), TypeId::I32).expect("i32 rv");
                let bang = if op == Opcode::Cze { "!" } else { "!!" };
                let _ = write!(out, "{rv} = {bang}{target};");
                self.rv = Some(rv);
            }
            Opcode::Br => {
                let target = reader.u32();
                let _ = write!(out, "goto l_{target};");
                self.rv = None;
            }
            Opcode::Beq | Opcode::Bne | Opcode::Bgt | Opcode::Bge | Opcode::Blt | Opcode::Ble => {
                let target = reader.u32();
                reader.subcode();
                let lhs = self.address(reader);
                let rhs = self.address(reader);
                let symbol = match op {
                    Opcode::Beq => "==",
                    Opcode::Bne => "!=",
                    Opcode::Bgt => ">",
                    Opcode::Bge => ">=",
                    Opcode::Blt => "<",
                    _ => "<=",
                };
                let _ = write!(out, "if ({lhs} {symbol} {rhs}) goto l_{target};");
                self.rv = None;
            }
            Opcode::Bze | Opcode::Bnz => {
                let target = reader.u32();
                reader.subcode();
                let operand = self.address(reader);
                let bang = if op == Opcode::Bze { "!" } else { "" };
                let _ = write!(out, "if ({bang}{operand}) goto l_{target};");
                self.rv = None;
            }
            Opcode::Sw => {
                let selector = self.address(reader);
                let count = reader.u32();
                let _ = write!(out, "switch ((uint32_t){selector}) {{ ");
                for case in 0..count {
                    let target = reader.u32();
                    let _ = write!(out, "case {case}u: goto l_{target}; ");
                }
                out.push('}');
                self.rv = None;
            }
            Opcode::Call => {
                let target = MethodId::new(reader.u32());
                let argc = reader.u8();
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    reader.subcode();
                    args.push(self.address(reader));
                }
                let sig = self.module().methods[target.index()].signature;
                let ret = self.module().signatures[sig.index()].return_type;
                let callee = mangle_method(self.module(), target);
                let call = format!("{callee}({})", args.join(", "));
                match rv_name(self.module(), ret) {
                    Some(rv) => {
                        let _ = write!(out, "{rv} = {call};");
                        self.rv = Some(rv);
                    }
                    None => {
                        let _ = write!(out, "{call};");
                        self.rv = None;
                    }
                }
            }
            Opcode::Callv => {
                let pointer = self.address(reader);
                let argc = reader.u8();
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    reader.subcode();
                    args.push(self.address(reader));
                }
                let _ = write!(out, "({pointer})({});", args.join(", "));
                self.rv = None;
            }
            Opcode::Ret => {
                out.push_str("return;");
            }
            Opcode::Retv => {
                reader.subcode();
                let value = self.address(reader);
                let _ = write!(out, "return {value};");
            }
            Opcode::Dump => {
                let target = self.address(reader);
                let _ = write!(out, "printf(\"(%lld)\\n\", (long long){target});");
                self.rv = None;
            }
        }
    }

    /// Renders one encoded operand as a C expression.
    fn address(&mut self, reader: &mut Reader<'_>) -> String {
        let module = self.module();
        let header = AddressHeader::from_bits(reader.u32());

        if header.kind() == AddressKind::Constant {
            let ty = TypeId::new(header.index());
            let bytes = reader.bytes(ty.base_size());
            let mut text = String::new();
            write_c_scalar(module, ty, bytes, &mut text);
            return text;
        }

        let mut expr = match header.kind() {
            AddressKind::StackVar => {
                if header.index() == AddressHeader::INDEX_MAX {
                    self.rv.clone().unwrap_or_else(|| "rv_int32".to_owned())
                } else {
                    format!("s{}", header.index())
                }
            }
            AddressKind::Parameter => format!("p{}", header.index()),
            AddressKind::Global => {
                let global = GlobalId::new(header.index());
                let table = if global.is_constant() {
                    &module.constants
                } else {
                    &module.globals
                };
                let name = table.entries[global.table_index()].name;
                mangle_global(module, name, global.is_constant())
            }
            AddressKind::Constant => unreachable!(),
        };

        match header.modifier() {
            AddressModifier::None => reader.skip(8),
            AddressModifier::DirectField | AddressModifier::IndirectField => {
                let offset = OffsetId::new(reader.u64() as u32);
                let entry = &module.offsets[offset.index()];
                let mut joiner = if header.modifier() == AddressModifier::IndirectField {
                    "->"
                } else {
                    "."
                };
                for &field in &entry.address.fields {
                    expr.push_str(joiner);
                    expr.push_str(module.names.name_or(field, "field"));
                    joiner = ".";
                }
            }
            AddressModifier::Subscript => {
                let index = reader.i64();
                expr = format!("{expr}[{index}]");
            }
        }

        match header.prefix() {
            AddressPrefix::None => expr,
            AddressPrefix::Indirection => format!("(*{expr})"),
            AddressPrefix::AddressOf => format!("(&{expr})"),
            AddressPrefix::SizeOf => format!("sizeof({expr})"),
        }
    }
}
