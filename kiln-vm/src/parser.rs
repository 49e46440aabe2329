//! Text front-end: tokenizes IL source and drives the generator.
//!
//! The parser is a thin shell over [`Generator`]; all structural checks
//! live there. What the parser adds is the token grammar, named stack
//! variables and parameters, numbered declarations, and label syntax.

use std::collections::HashMap;

use kiln_asm::Opcode;
use kiln_types::{LabelId, SourceMeta, TypeId};
use tracing::debug_span;

use crate::error::ParseError;
use crate::generator::{Constant, Generator, Init, MethodWriter, Operand, TypeWriter};
use crate::literals;
use crate::Intermediate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Identifier,
    Literal,
    KwStruct,
    KwUnion,
    KwMethod,
    KwEnd,
    KwReturns,
    KwParameters,
    KwStack,
    KwGlobal,
    KwConstant,
    KwInit,
    KwNull,
    Op(Opcode),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Arrow,
    Star,
    Amp,
    Bang,
    Caret,
    Colon,
    Comma,
    Period,
    Eof,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: TokenKind,
    text: &'a str,
    line: u32,
}

fn keyword(text: &str) -> Option<TokenKind> {
    Some(match text {
        "struct" => TokenKind::KwStruct,
        "union" => TokenKind::KwUnion,
        "method" => TokenKind::KwMethod,
        "end" => TokenKind::KwEnd,
        "returns" => TokenKind::KwReturns,
        "parameters" => TokenKind::KwParameters,
        "stack" => TokenKind::KwStack,
        "global" => TokenKind::KwGlobal,
        "constant" => TokenKind::KwConstant,
        "init" => TokenKind::KwInit,
        "null" => TokenKind::KwNull,
        _ => return Some(TokenKind::Op(text.parse().ok()?)),
    })
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_literal_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-'
}

fn tokenize<'a>(file: &str, source: &'a str) -> Result<Vec<Token<'a>>, ParseError> {
    let meta = |line| SourceMeta::new(file, line);
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut line = 1u32;
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            ' ' | '\r' | '\t' | '\x0b' => i += 1,
            '/' => {
                match bytes.get(i + 1).map(|&b| b as char) {
                    Some('/') => {
                        while i < bytes.len() && bytes[i] != b'\n' {
                            i += 1;
                        }
                    }
                    Some('*') => {
                        i += 2;
                        loop {
                            if i + 1 >= bytes.len() {
                                return Err(ParseError::UnterminatedComment { meta: meta(line) });
                            }
                            if bytes[i] == b'\n' {
                                line += 1;
                            }
                            if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                                i += 2;
                                break;
                            }
                            i += 1;
                        }
                    }
                    _ => {
                        return Err(ParseError::UnexpectedCharacter {
                            found: '/',
                            meta: meta(line),
                        })
                    }
                }
            }
            _ if is_identifier_start(c) => {
                let start = i;
                while i < bytes.len() && is_identifier_char(bytes[i] as char) {
                    i += 1;
                }
                let text = &source[start..i];
                let kind = keyword(text).unwrap_or(TokenKind::Identifier);
                tokens.push(Token { kind, text, line });
            }
            '-' if bytes.get(i + 1) == Some(&b'>') => {
                tokens.push(Token {
                    kind: TokenKind::Arrow,
                    text: &source[i..i + 2],
                    line,
                });
                i += 2;
            }
            _ if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < bytes.len() && is_literal_char(bytes[i] as char) {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Literal,
                    text: &source[start..i],
                    line,
                });
            }
            _ => {
                let kind = match c {
                    '{' => TokenKind::LBrace,
                    '}' => TokenKind::RBrace,
                    '[' => TokenKind::LBracket,
                    ']' => TokenKind::RBracket,
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    '*' => TokenKind::Star,
                    '&' => TokenKind::Amp,
                    '!' => TokenKind::Bang,
                    '^' => TokenKind::Caret,
                    ':' => TokenKind::Colon,
                    ',' => TokenKind::Comma,
                    '.' => TokenKind::Period,
                    _ => {
                        return Err(ParseError::UnexpectedCharacter {
                            found: c,
                            meta: meta(line),
                        })
                    }
                };
                tokens.push(Token {
                    kind,
                    text: &source[i..i + 1],
                    line,
                });
                i += 1;
            }
        }
    }
    tokens.push(Token {
        kind: TokenKind::Eof,
        text: "",
        line,
    });
    Ok(tokens)
}

#[derive(Default)]
struct VariableLookup {
    names: HashMap<String, u32>,
    indices: HashMap<u32, u32>,
    count: u32,
}

impl VariableLookup {
    fn clear(&mut self) {
        self.names.clear();
        self.indices.clear();
        self.count = 0;
    }
}

struct Parser<'a> {
    gen: Generator,
    file: String,
    tokens: Vec<Token<'a>>,
    pos: usize,
    current_type: Option<TypeWriter>,
    current_method: Option<MethodWriter>,
    stack_vars: VariableLookup,
    parameters: VariableLookup,
}

/// Parses IL text into an intermediate. `file_name` is recorded as the
/// source meta of everything declared.
pub fn parse_source(file_name: &str, source: &str) -> Result<Intermediate, ParseError> {
    let span = debug_span!("parse", file = file_name);
    let _enter = span.enter();

    let tokens = tokenize(file_name, source)?;
    let mut parser = Parser {
        gen: Generator::new(file_name),
        file: file_name.to_owned(),
        tokens,
        pos: 0,
        current_type: None,
        current_method: None,
        stack_vars: VariableLookup::default(),
        parameters: VariableLookup::default(),
    };
    parser.evaluate()?;
    Ok(parser.gen.finalize()?)
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Token<'a> {
        self.tokens[self.pos]
    }

    fn peek2(&self) -> Option<Token<'a>> {
        self.tokens.get(self.pos + 1).copied()
    }

    fn next(&mut self) -> Token<'a> {
        let token = self.tokens[self.pos];
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn meta(&self, line: u32) -> SourceMeta {
        SourceMeta::new(&self.file, line)
    }

    fn sync_location(&mut self, line: u32) {
        self.gen.set_line(line);
        if let Some(writer) = &mut self.current_method {
            writer.set_location(SourceMeta::new(&self.file, line));
        }
    }

    fn unexpected(&self, token: Token<'a>) -> ParseError {
        if token.kind == TokenKind::Eof {
            ParseError::UnexpectedEof {
                meta: self.meta(token.line),
            }
        } else {
            ParseError::UnexpectedExpression {
                found: token.text.to_owned(),
                meta: self.meta(token.line),
            }
        }
    }

    fn expect_identifier(&mut self) -> Result<Token<'a>, ParseError> {
        let token = self.next();
        if token.kind != TokenKind::Identifier {
            return Err(self.unexpected(token));
        }
        Ok(token)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token<'a>, ParseError> {
        let token = self.next();
        if token.kind != kind {
            return Err(self.unexpected(token));
        }
        Ok(token)
    }

    fn evaluate(&mut self) -> Result<(), ParseError> {
        loop {
            let token = self.peek();
            if self.current_type.is_some() {
                match token.kind {
                    TokenKind::Identifier => self.parse_field()?,
                    TokenKind::KwEnd => {
                        self.next();
                        let writer = self.current_type.take().expect("open type scope");
                        self.gen.finish_type(writer)?;
                    }
                    _ => return Err(self.unexpected(token)),
                }
                continue;
            }
            if self.current_method.is_some() {
                match token.kind {
                    TokenKind::KwStack => {
                        self.next();
                        self.parse_stack()?;
                    }
                    TokenKind::Op(op) => {
                        self.next();
                        self.sync_location(token.line);
                        self.parse_instruction(op)?;
                    }
                    TokenKind::Identifier
                        if self.peek2().map(|t| t.kind) == Some(TokenKind::Colon) =>
                    {
                        let name = self.next().text.to_owned();
                        self.next();
                        let writer = self.current_method.as_mut().expect("open method scope");
                        let label = writer.declare_label(&name);
                        writer.write_label(label)?;
                    }
                    TokenKind::KwEnd => {
                        self.next();
                        let writer = self.current_method.take().expect("open method scope");
                        self.gen.finish_method(writer)?;
                        self.stack_vars.clear();
                        self.parameters.clear();
                    }
                    _ => return Err(self.unexpected(token)),
                }
                continue;
            }
            match token.kind {
                TokenKind::Eof => return Ok(()),
                TokenKind::KwGlobal => {
                    self.next();
                    self.parse_globals(false)?;
                }
                TokenKind::KwConstant => {
                    self.next();
                    self.parse_globals(true)?;
                }
                TokenKind::KwStruct => {
                    self.next();
                    self.begin_object(false)?;
                }
                TokenKind::KwUnion => {
                    self.next();
                    self.begin_object(true)?;
                }
                TokenKind::KwMethod => {
                    self.next();
                    self.begin_method()?;
                }
                TokenKind::KwEnd => {
                    return Err(ParseError::UnexpectedEnd {
                        meta: self.meta(token.line),
                    })
                }
                _ => return Err(self.unexpected(token)),
            }
        }
    }

    fn begin_object(&mut self, is_union: bool) -> Result<(), ParseError> {
        let name = self.expect_identifier()?;
        let line = name.line;
        let text = name.text.to_owned();
        self.sync_location(line);
        let index = self.gen.declare_type(&text)?;
        let writer = self.gen.define_type(index, is_union)?;
        self.current_type = Some(writer);
        Ok(())
    }

    fn parse_field(&mut self) -> Result<(), ParseError> {
        let field_type = self.parse_typename()?;
        let name = self.expect_identifier()?;
        let line = name.line;
        let text = name.text.to_owned();
        self.sync_location(line);
        let mut writer = self.current_type.take().expect("open type scope");
        let result = writer.declare_field(&mut self.gen, field_type, &text);
        self.current_type = Some(writer);
        Ok(result?)
    }

    fn begin_method(&mut self) -> Result<(), ParseError> {
        let name = self.expect_identifier()?;
        let line = name.line;
        let text = name.text.to_owned();
        self.sync_location(line);
        let index = self.gen.declare_method(&text)?;

        let mut return_type = TypeId::VOID;
        if self.peek().kind == TokenKind::KwReturns {
            self.next();
            return_type = self.parse_typename()?;
        }

        let mut params = Vec::new();
        if self.peek().kind == TokenKind::KwParameters {
            self.next();
            loop {
                match self.peek().kind {
                    TokenKind::Identifier | TokenKind::Literal => {
                        params.push(self.parse_variable(true)?);
                    }
                    TokenKind::KwEnd => {
                        self.next();
                        break;
                    }
                    _ => {
                        let token = self.peek();
                        return Err(self.unexpected(token));
                    }
                }
            }
        }

        let signature = self.gen.make_signature(return_type, &params)?;
        let writer = self.gen.define_method(index, signature)?;
        self.current_method = Some(writer);
        Ok(())
    }

    fn parse_stack(&mut self) -> Result<(), ParseError> {
        let mut types = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::Identifier | TokenKind::Literal => {
                    types.push(self.parse_variable(false)?);
                }
                TokenKind::KwEnd => {
                    self.next();
                    break;
                }
                _ => {
                    let token = self.peek();
                    return Err(self.unexpected(token));
                }
            }
        }
        if !types.is_empty() {
            let writer = self.current_method.as_mut().expect("open method scope");
            writer.push_stack(&types)?;
        }
        Ok(())
    }

    /// One stack or parameter declaration: `TYPE NAME` or `INDEX ':' TYPE`.
    fn parse_variable(&mut self, is_parameter: bool) -> Result<TypeId, ParseError> {
        let token = self.peek();
        match token.kind {
            TokenKind::Identifier => {
                let ty = self.parse_typename()?;
                let name = self.expect_identifier()?;
                let line = name.line;
                let text = name.text.to_owned();
                let lookup = if is_parameter {
                    &mut self.parameters
                } else {
                    &mut self.stack_vars
                };
                if lookup.names.contains_key(&text) {
                    return Err(ParseError::DuplicateLocalName {
                        name: text,
                        meta: SourceMeta::new(&self.file, line),
                    });
                }
                let ordinal = lookup.count;
                lookup.count += 1;
                lookup.names.insert(text, ordinal);
                Ok(ty)
            }
            TokenKind::Literal => {
                let token = self.next();
                let line = token.line;
                let index = literals::parse_u64(token.text).ok_or_else(|| {
                    ParseError::LiteralParseFailure {
                        found: token.text.to_owned(),
                        meta: self.meta(line),
                    }
                })?;
                if index >= kiln_types::AddressHeader::INDEX_MAX as u64 {
                    return Err(ParseError::StackIndexOverflow { meta: self.meta(line) });
                }
                let index = index as u32;
                self.expect(TokenKind::Colon)?;
                let ty = self.parse_typename()?;
                let lookup = if is_parameter {
                    &mut self.parameters
                } else {
                    &mut self.stack_vars
                };
                if lookup.indices.contains_key(&index) {
                    return Err(if is_parameter {
                        ParseError::DuplicateParamIndex {
                            index,
                            meta: SourceMeta::new(&self.file, line),
                        }
                    } else {
                        ParseError::DuplicateStackIndex {
                            index,
                            meta: SourceMeta::new(&self.file, line),
                        }
                    });
                }
                let ordinal = lookup.count;
                lookup.count += 1;
                lookup.indices.insert(index, ordinal);
                Ok(ty)
            }
            _ => Err(self.unexpected(token)),
        }
    }

    fn parse_globals(&mut self, is_constant: bool) -> Result<(), ParseError> {
        loop {
            match self.peek().kind {
                TokenKind::Identifier => {
                    let ty = self.parse_typename()?;
                    let name = self.expect_identifier()?;
                    let line = name.line;
                    let text = name.text.to_owned();
                    self.sync_location(line);
                    let mut inits = Vec::new();
                    if self.peek().kind == TokenKind::KwInit {
                        self.next();
                        loop {
                            let token = self.peek();
                            match token.kind {
                                TokenKind::KwEnd => {
                                    self.next();
                                    break;
                                }
                                TokenKind::KwNull => {
                                    self.next();
                                    inits.push(Init::Value(Constant::Null));
                                }
                                TokenKind::Literal => {
                                    let token = self.next();
                                    let line = token.line;
                                    let value = literals::parse_literal(token.text).ok_or_else(
                                        || ParseError::LiteralParseFailure {
                                            found: token.text.to_owned(),
                                            meta: self.meta(line),
                                        },
                                    )?;
                                    inits.push(Init::Value(value));
                                }
                                TokenKind::Identifier => {
                                    let token = self.next();
                                    let text = token.text.to_owned();
                                    let method = self.gen.make_identifier(&text)?;
                                    inits.push(Init::Method(method));
                                }
                                _ => return Err(self.unexpected(token)),
                            }
                        }
                    }
                    self.gen.define_global(&text, is_constant, ty, &inits)?;
                }
                TokenKind::KwEnd => {
                    self.next();
                    return Ok(());
                }
                _ => {
                    let token = self.peek();
                    return Err(self.unexpected(token));
                }
            }
        }
    }

    /// `NAME ('*' | '[' INT ']' | '(' typename,* ')')*`
    fn parse_typename(&mut self) -> Result<TypeId, ParseError> {
        let name = self.expect_identifier()?;
        let line = name.line;
        let text = name.text.to_owned();
        self.sync_location(line);
        let mut index = self.gen.declare_type(&text)?;
        loop {
            match self.peek().kind {
                TokenKind::Star => {
                    self.next();
                    index = self.gen.declare_pointer_type(index)?;
                }
                TokenKind::LBracket => {
                    self.next();
                    let token = self.next();
                    if token.kind != TokenKind::Literal {
                        return Err(self.unexpected(token));
                    }
                    let line = token.line;
                    let len = literals::parse_u64(token.text).ok_or_else(|| {
                        ParseError::LiteralParseFailure {
                            found: token.text.to_owned(),
                            meta: self.meta(line),
                        }
                    })?;
                    if len > u32::MAX as u64 {
                        return Err(ParseError::ArraySizeOverflow { meta: self.meta(line) });
                    }
                    self.expect(TokenKind::RBracket)?;
                    index = self.gen.declare_array_type(index, len as usize)?;
                }
                TokenKind::LParen => {
                    self.next();
                    let mut params = Vec::new();
                    if self.peek().kind == TokenKind::RParen {
                        self.next();
                    } else {
                        loop {
                            params.push(self.parse_typename()?);
                            let token = self.next();
                            match token.kind {
                                TokenKind::Comma => continue,
                                TokenKind::RParen => break,
                                _ => return Err(self.unexpected(token)),
                            }
                        }
                    }
                    let signature = self.gen.make_signature(index, &params)?;
                    index = self.gen.declare_signature_type(signature)?;
                }
                _ => return Ok(index),
            }
        }
    }

    fn parse_index(&mut self) -> Result<(u32, u32), ParseError> {
        let token = self.next();
        if token.kind != TokenKind::Literal {
            return Err(self.unexpected(token));
        }
        let line = token.line;
        let value = literals::parse_u64(token.text).ok_or_else(|| {
            ParseError::LiteralParseFailure {
                found: token.text.to_owned(),
                meta: self.meta(line),
            }
        })?;
        if value >= kiln_types::AddressHeader::INDEX_MAX as u64 {
            return Err(ParseError::StackIndexOverflow { meta: self.meta(line) });
        }
        Ok((value as u32, line))
    }

    /// `prefix? basic modifier?`
    fn parse_address(&mut self) -> Result<Operand, ParseError> {
        let token = self.peek();
        self.sync_location(token.line);

        match token.kind {
            TokenKind::KwNull => {
                self.next();
                return Ok(Operand::null());
            }
            TokenKind::Literal => {
                let token = self.next();
                let line = token.line;
                let value = literals::parse_literal(token.text).ok_or_else(|| {
                    ParseError::LiteralParseFailure {
                        found: token.text.to_owned(),
                        meta: self.meta(line),
                    }
                })?;
                return Ok(Operand::constant(value));
            }
            _ => {}
        }

        let mut prefix = None;
        match self.peek().kind {
            TokenKind::Star | TokenKind::Amp | TokenKind::Bang => {
                prefix = Some(self.next().kind);
            }
            _ => {}
        }

        let token = self.next();
        let mut operand = match token.kind {
            TokenKind::Literal => {
                return Err(ParseError::UnexpectedLiteral {
                    meta: self.meta(token.line),
                })
            }
            TokenKind::Identifier => {
                let text = token.text.to_owned();
                if let Some(&ordinal) = self.stack_vars.names.get(&text) {
                    Operand::stack(ordinal)
                } else if let Some(&ordinal) = self.parameters.names.get(&text) {
                    Operand::param(ordinal)
                } else {
                    Operand::global(self.gen.make_identifier(&text)?)
                }
            }
            TokenKind::LBrace => {
                if self.peek().kind == TokenKind::Caret {
                    self.next();
                    self.expect(TokenKind::RBrace)?;
                    Operand::ret_val()
                } else {
                    let (index, line) = self.parse_index()?;
                    let ordinal = *self.stack_vars.indices.get(&index).ok_or(
                        ParseError::UndefinedStackIndex {
                            index,
                            meta: SourceMeta::new(&self.file, line),
                        },
                    )?;
                    self.expect(TokenKind::RBrace)?;
                    Operand::stack(ordinal)
                }
            }
            TokenKind::LParen => {
                let (index, line) = self.parse_index()?;
                let ordinal = *self.parameters.indices.get(&index).ok_or(
                    ParseError::UndefinedParamIndex {
                        index,
                        meta: SourceMeta::new(&self.file, line),
                    },
                )?;
                self.expect(TokenKind::RParen)?;
                Operand::param(ordinal)
            }
            _ => return Err(self.unexpected(token)),
        };

        // Modifier.
        match self.peek().kind {
            TokenKind::Period | TokenKind::Arrow => {
                let indirect = self.next().kind == TokenKind::Arrow;
                let root = self.expect_identifier()?;
                let root_text = root.text.to_owned();
                let root_type = self.gen.declare_type(&root_text)?;
                self.expect(TokenKind::Colon)?;
                let mut fields = Vec::new();
                loop {
                    let field = self.expect_identifier()?;
                    let field_text = field.text.to_owned();
                    fields.push(self.gen.make_identifier(&field_text)?);
                    if self.peek().kind == TokenKind::Period {
                        self.next();
                    } else {
                        break;
                    }
                }
                let offset = self.gen.make_offset(root_type, &fields)?;
                operand = if indirect {
                    operand.arrow(offset)
                } else {
                    operand.field(offset)
                };
            }
            TokenKind::LBracket => {
                self.next();
                let token = self.next();
                if token.kind != TokenKind::Literal {
                    return Err(self.unexpected(token));
                }
                let line = token.line;
                let value = literals::parse_literal(token.text).ok_or_else(|| {
                    ParseError::LiteralParseFailure {
                        found: token.text.to_owned(),
                        meta: self.meta(line),
                    }
                })?;
                let index = match value {
                    Constant::I32(v) => v as i64,
                    Constant::I64(v) => v,
                    Constant::U64(v) => v as i64,
                    _ => {
                        return Err(ParseError::LiteralParseFailure {
                            found: token.text.to_owned(),
                            meta: self.meta(line),
                        })
                    }
                };
                self.expect(TokenKind::RBracket)?;
                operand = operand.at(index);
            }
            _ => {}
        }

        Ok(match prefix {
            Some(TokenKind::Star) => operand.deref(),
            Some(TokenKind::Amp) => operand.address_of(),
            Some(TokenKind::Bang) => operand.size_of(),
            _ => operand,
        })
    }

    fn parse_label(&mut self) -> Result<LabelId, ParseError> {
        let name = self.expect_identifier()?;
        let text = name.text.to_owned();
        let writer = self.current_method.as_mut().expect("open method scope");
        Ok(writer.declare_label(&text))
    }

    /// Whether the next token starts a call argument (rather than the next
    /// instruction or a label definition).
    fn starts_argument(&self) -> bool {
        match self.peek().kind {
            TokenKind::Literal
            | TokenKind::KwNull
            | TokenKind::LBrace
            | TokenKind::LParen
            | TokenKind::Star
            | TokenKind::Amp
            | TokenKind::Bang => true,
            TokenKind::Identifier => self.peek2().map(|t| t.kind) != Some(TokenKind::Colon),
            _ => false,
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Operand>, ParseError> {
        let mut args = Vec::new();
        while self.starts_argument() {
            args.push(self.parse_address()?);
        }
        Ok(args)
    }

    fn parse_instruction(&mut self, op: Opcode) -> Result<(), ParseError> {
        macro_rules! writer {
            () => {
                self.current_method.as_mut().expect("open method scope")
            };
        }
        match op {
            Opcode::Noop => writer!().write_noop(),
            Opcode::Set => {
                let lhs = self.parse_address()?;
                let rhs = self.parse_address()?;
                writer!().write_set(lhs, rhs)?;
            }
            Opcode::Conv => {
                let lhs = self.parse_address()?;
                let rhs = self.parse_address()?;
                writer!().write_conv(lhs, rhs)?;
            }
            Opcode::Not => {
                let target = self.parse_address()?;
                writer!().write_not(target)?;
            }
            Opcode::Neg => {
                let target = self.parse_address()?;
                writer!().write_neg(target)?;
            }
            Opcode::Mul => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_mul(lhs, rhs)?;
            }
            Opcode::Div => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_div(lhs, rhs)?;
            }
            Opcode::Mod => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_mod(lhs, rhs)?;
            }
            Opcode::Add => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_add(lhs, rhs)?;
            }
            Opcode::Sub => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_sub(lhs, rhs)?;
            }
            Opcode::Lsh => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_lsh(lhs, rhs)?;
            }
            Opcode::Rsh => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_rsh(lhs, rhs)?;
            }
            Opcode::And => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_and(lhs, rhs)?;
            }
            Opcode::Xor => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_xor(lhs, rhs)?;
            }
            Opcode::Or => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_or(lhs, rhs)?;
            }
            Opcode::Padd => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_padd(lhs, rhs)?;
            }
            Opcode::Psub => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_psub(lhs, rhs)?;
            }
            Opcode::Pdif => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_pdif(lhs, rhs)?;
            }
            Opcode::Cmp => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_cmp(lhs, rhs)?;
            }
            Opcode::Ceq => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_ceq(lhs, rhs)?;
            }
            Opcode::Cne => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_cne(lhs, rhs)?;
            }
            Opcode::Cgt => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_cgt(lhs, rhs)?;
            }
            Opcode::Cge => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_cge(lhs, rhs)?;
            }
            Opcode::Clt => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_clt(lhs, rhs)?;
            }
            Opcode::Cle => {
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_cle(lhs, rhs)?;
            }
            Opcode::Cze => {
                let target = self.parse_address()?;
                writer!().write_cze(target)?;
            }
            Opcode::Cnz => {
                let target = self.parse_address()?;
                writer!().write_cnz(target)?;
            }
            Opcode::Br => {
                let label = self.parse_label()?;
                writer!().write_br(label);
            }
            Opcode::Beq => {
                let label = self.parse_label()?;
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_beq(label, lhs, rhs)?;
            }
            Opcode::Bne => {
                let label = self.parse_label()?;
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_bne(label, lhs, rhs)?;
            }
            Opcode::Bgt => {
                let label = self.parse_label()?;
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_bgt(label, lhs, rhs)?;
            }
            Opcode::Bge => {
                let label = self.parse_label()?;
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_bge(label, lhs, rhs)?;
            }
            Opcode::Blt => {
                let label = self.parse_label()?;
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_blt(label, lhs, rhs)?;
            }
            Opcode::Ble => {
                let label = self.parse_label()?;
                let (lhs, rhs) = (self.parse_address()?, self.parse_address()?);
                writer!().write_ble(label, lhs, rhs)?;
            }
            Opcode::Bze => {
                let label = self.parse_label()?;
                let target = self.parse_address()?;
                writer!().write_bze(label, target)?;
            }
            Opcode::Bnz => {
                let label = self.parse_label()?;
                let target = self.parse_address()?;
                writer!().write_bnz(label, target)?;
            }
            Opcode::Sw => {
                let selector = self.parse_address()?;
                let mut labels = Vec::new();
                while self.peek().kind == TokenKind::Identifier
                    && self.peek2().map(|t| t.kind) != Some(TokenKind::Colon)
                {
                    labels.push(self.parse_label()?);
                }
                writer!().write_sw(selector, &labels)?;
            }
            Opcode::Call => {
                let name = self.expect_identifier()?;
                let text = name.text.to_owned();
                let method = self.gen.declare_method(&text)?;
                let args = self.parse_arguments()?;
                writer!().write_call(method, &args)?;
            }
            Opcode::Callv => {
                let pointer = self.parse_address()?;
                let args = self.parse_arguments()?;
                writer!().write_callv(pointer, &args)?;
            }
            Opcode::Ret => writer!().write_ret()?,
            Opcode::Retv => {
                let value = self.parse_address()?;
                writer!().write_retv(value)?;
            }
            Opcode::Dump => {
                let target = self.parse_address()?;
                writer!().write_dump(target)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_rejects_stray_characters() {
        let err = parse_source("t.kln", "method main\n\t@\nend\n").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedCharacter { found: '@', .. }));
    }

    #[test]
    fn unterminated_comment_is_fatal() {
        let err = parse_source("t.kln", "/* never closed").unwrap_err();
        assert!(matches!(err, ParseError::UnterminatedComment { .. }));
    }

    #[test]
    fn comments_are_skipped() {
        let source = "// line comment\n/* block\ncomment */\nmethod main returns i32\n\tretv 0 // trailing\nend\n";
        assert!(parse_source("t.kln", source).is_ok());
    }

    #[test]
    fn end_without_scope_fails() {
        let err = parse_source("t.kln", "end\n").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEnd { .. }));
    }

    #[test]
    fn eof_inside_method_fails() {
        let err = parse_source("t.kln", "method main returns i32\n\tretv 0\n").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof { .. }));
    }

    #[test]
    fn duplicate_named_locals_fail() {
        let source = "method main returns i32\n\tstack\n\t\ti32 x\n\t\ti32 x\n\tend\n\tretv 0\nend\n";
        let err = parse_source("t.kln", source).unwrap_err();
        assert!(matches!(err, ParseError::DuplicateLocalName { name, .. } if name == "x"));
    }

    #[test]
    fn duplicate_numbered_locals_fail() {
        let source = "method main returns i32\n\tstack\n\t\t0: i32\n\t\t0: i32\n\tend\n\tretv 0\nend\n";
        let err = parse_source("t.kln", source).unwrap_err();
        assert!(matches!(err, ParseError::DuplicateStackIndex { index: 0, .. }));
    }

    #[test]
    fn undefined_stack_index_fails() {
        let source = "method main returns i32\n\tdump {3}\n\tretv 0\nend\n";
        let err = parse_source("t.kln", source).unwrap_err();
        assert!(matches!(err, ParseError::UndefinedStackIndex { index: 3, .. }));
    }

    #[test]
    fn named_locals_resolve_in_addresses() {
        let source = r#"
method main returns i32
    stack
        i32 total
        i32 step
    end
    set total 0
    set step 3
    add total step
    retv total
end
"#;
        let intermediate = parse_source("t.kln", source).unwrap();
        assert!(intermediate.is_valid());
    }

    #[test]
    fn bad_literals_are_reported() {
        let source = "method main returns i32\n\tretv 12xyz\nend\n";
        let err = parse_source("t.kln", source).unwrap_err();
        assert!(matches!(err, ParseError::LiteralParseFailure { found, .. } if found == "12xyz"));
    }

    #[test]
    fn generator_errors_surface_through_the_parser() {
        let source = "struct S\n\ti32 x\nend\n\nstruct S\n\ti32 y\nend\n";
        let err = parse_source("t.kln", source).unwrap_err();
        assert_eq!(err.code(), 0x1202);
    }
}
