//! Error taxonomy of the toolchain. One enum per phase; every variant maps
//! to a stable numeric code grouped by phase block (generator 0x1xxx, parser
//! 0x2xxx, merger 0x3xxx, linker 0x4xxx, runtime 0x5xxx). Errors abort their
//! phase immediately; no partial intermediates or assemblies are ever
//! returned.

use kiln_types::SourceMeta;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Any toolchain error.
#[derive(Debug, Error)]
pub enum Error {
    /// Error raised while generating an intermediate.
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    /// Error raised while parsing IL text.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Error raised while merging intermediates.
    #[error(transparent)]
    Merge(#[from] MergeError),
    /// Error raised while linking.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Error raised while executing an assembly.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl Error {
    /// Stable numeric code of the underlying error.
    pub fn code(&self) -> u32 {
        match self {
            Self::Generator(e) => e.code(),
            Self::Parse(e) => e.code(),
            Self::Merge(e) => e.code(),
            Self::Link(e) => e.code(),
            Self::Runtime(e) => e.code(),
        }
    }
}

/// Structural errors raised by the generator while a module is being built.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// An identifier is empty or contains characters outside the identifier
    /// grammar.
    #[error("{meta}: invalid identifier '{name}'")]
    InvalidIdentifier {
        /// Offending identifier.
        name: String,
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A signature exceeds the supported parameter count.
    #[error("{meta}: parameter list exceeds supported maximum length")]
    ParameterOverflow {
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A global initializer holds more literals than its type can absorb.
    #[error("{meta}: initializer overflow for global '{name}'")]
    InitializerOverflow {
        /// Global being initialized.
        name: String,
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// An index passed into the generator API is outside its table.
    #[error("{meta}: index out of range")]
    IndexOutOfRange {
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// Arrays of length zero cannot be declared.
    #[error("{meta}: array length must not be zero")]
    ArrayLengthZero {
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A name is already bound to a different kind of entity.
    #[error("{meta}: identifier '{name}' is already bound to a different kind of definition")]
    IdentifierTypeMismatch {
        /// Conflicting identifier.
        name: String,
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// `void` used where a sized type is required.
    #[error("{meta}: void type is not valid here")]
    InvalidVoidType {
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A second body supplied for an already defined type.
    #[error("{meta}: type '{name}' has already been defined")]
    TypeRedefinition {
        /// Type name.
        name: String,
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A second body supplied for an already defined method.
    #[error("{meta}: method '{name}' has already been defined")]
    MethodRedefinition {
        /// Method name.
        name: String,
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A global or constant name defined twice.
    #[error("{meta}: global '{name}' has already been defined")]
    GlobalRedefinition {
        /// Global name.
        name: String,
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A field name used twice within one type.
    #[error("{meta}: field '{name}' has already been declared")]
    FieldRedefinition {
        /// Field name.
        name: String,
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A label written twice within one method.
    #[error("{meta}: label has already been written")]
    LabelRedefinition {
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A declared label never written when the method was finished.
    #[error("{meta}: method '{name}' leaves a declared label unwritten")]
    LabelUndefined {
        /// Method name.
        name: String,
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// The return-value operand used where no return value exists.
    #[error("{meta}: invalid use of the return-value address")]
    InvalidReturnValue {
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A stack variable index outside the declared stack layout.
    #[error("{meta}: stack index {index} out of range")]
    StackIndexOutOfRange {
        /// Offending index.
        index: u32,
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A parameter index outside the method signature.
    #[error("{meta}: parameter index {index} out of range")]
    ParamIndexOutOfRange {
        /// Offending index.
        index: u32,
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A literal constant of a type that cannot be encoded inline.
    #[error("{meta}: invalid constant")]
    InvalidConstant {
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
    /// A value-returning method whose body can fall off the end.
    #[error("{meta}: method '{name}' is missing a return value")]
    MissingReturnValue {
        /// Method name.
        name: String,
        /// Location cursor at the point of failure.
        meta: SourceMeta,
    },
}

impl GeneratorError {
    /// Stable numeric code.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidIdentifier { .. } => 0x1100,
            Self::ParameterOverflow { .. } => 0x1101,
            Self::InitializerOverflow { .. } => 0x1102,
            Self::IndexOutOfRange { .. } => 0x1103,
            Self::ArrayLengthZero { .. } => 0x1104,
            Self::IdentifierTypeMismatch { .. } => 0x1200,
            Self::InvalidVoidType { .. } => 0x1201,
            Self::TypeRedefinition { .. } => 0x1202,
            Self::MethodRedefinition { .. } => 0x1203,
            Self::GlobalRedefinition { .. } => 0x1204,
            Self::FieldRedefinition { .. } => 0x1205,
            Self::LabelRedefinition { .. } => 0x1207,
            Self::LabelUndefined { .. } => 0x1208,
            Self::InvalidReturnValue { .. } => 0x1300,
            Self::StackIndexOutOfRange { .. } => 0x1301,
            Self::ParamIndexOutOfRange { .. } => 0x1302,
            Self::InvalidConstant { .. } => 0x1303,
            Self::MissingReturnValue { .. } => 0x1304,
        }
    }
}

/// Errors raised while tokenizing or evaluating IL text.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A token that does not fit the current grammar position.
    #[error("{meta}: unexpected expression '{found}'")]
    UnexpectedExpression {
        /// Offending token text.
        found: String,
        /// Source location.
        meta: SourceMeta,
    },
    /// A character outside the token grammar.
    #[error("{meta}: unexpected '{found}' character")]
    UnexpectedCharacter {
        /// Offending character.
        found: char,
        /// Source location.
        meta: SourceMeta,
    },
    /// Input ended inside an open scope.
    #[error("{meta}: unexpected end of file")]
    UnexpectedEof {
        /// Source location.
        meta: SourceMeta,
    },
    /// A `/*` comment left open at end of input.
    #[error("{meta}: comment unclosed at end of file")]
    UnterminatedComment {
        /// Source location.
        meta: SourceMeta,
    },
    /// A multi-character punctuation sequence left incomplete.
    #[error("{meta}: unterminated '{found}' character")]
    UnterminatedCharacter {
        /// Offending character.
        found: char,
        /// Source location.
        meta: SourceMeta,
    },
    /// `end` with no open scope.
    #[error("{meta}: unexpected end of scope")]
    UnexpectedEnd {
        /// Source location.
        meta: SourceMeta,
    },
    /// A literal token that does not parse as a number.
    #[error("{meta}: failed to parse literal '{found}'")]
    LiteralParseFailure {
        /// Offending token text.
        found: String,
        /// Source location.
        meta: SourceMeta,
    },
    /// An array length beyond the supported range.
    #[error("{meta}: array size exceeds supported maximum value")]
    ArraySizeOverflow {
        /// Source location.
        meta: SourceMeta,
    },
    /// A stack or parameter index beyond the address index range.
    #[error("{meta}: index exceeds supported maximum value")]
    StackIndexOverflow {
        /// Source location.
        meta: SourceMeta,
    },
    /// `{i}` referring to an undeclared stack slot.
    #[error("{meta}: undefined stack index {index}")]
    UndefinedStackIndex {
        /// Offending index.
        index: u32,
        /// Source location.
        meta: SourceMeta,
    },
    /// A numbered stack declaration repeated.
    #[error("{meta}: stack index {index} has already been defined")]
    DuplicateStackIndex {
        /// Offending index.
        index: u32,
        /// Source location.
        meta: SourceMeta,
    },
    /// `(i)` referring to an undeclared parameter.
    #[error("{meta}: undefined parameter index {index}")]
    UndefinedParamIndex {
        /// Offending index.
        index: u32,
        /// Source location.
        meta: SourceMeta,
    },
    /// A numbered parameter declaration repeated.
    #[error("{meta}: parameter index {index} has already been defined")]
    DuplicateParamIndex {
        /// Offending index.
        index: u32,
        /// Source location.
        meta: SourceMeta,
    },
    /// A named local or parameter declared twice.
    #[error("{meta}: variable '{name}' has already been defined")]
    DuplicateLocalName {
        /// Offending name.
        name: String,
        /// Source location.
        meta: SourceMeta,
    },
    /// A literal in a position that takes no literal.
    #[error("{meta}: literal is not valid here")]
    UnexpectedLiteral {
        /// Source location.
        meta: SourceMeta,
    },
    /// Failure in the generator the parser drives.
    #[error(transparent)]
    Generator(#[from] GeneratorError),
}

impl ParseError {
    /// Stable numeric code.
    pub fn code(&self) -> u32 {
        match self {
            Self::UnexpectedExpression { .. } => 0x2100,
            Self::UnexpectedCharacter { .. } => 0x2101,
            Self::UnexpectedEof { .. } => 0x2102,
            Self::UnterminatedComment { .. } => 0x2103,
            Self::UnterminatedCharacter { .. } => 0x2104,
            Self::UnexpectedEnd { .. } => 0x2105,
            Self::LiteralParseFailure { .. } => 0x2106,
            Self::ArraySizeOverflow { .. } => 0x2107,
            Self::StackIndexOverflow { .. } => 0x2108,
            Self::UndefinedStackIndex { .. } => 0x2109,
            Self::DuplicateStackIndex { .. } => 0x210A,
            Self::UndefinedParamIndex { .. } => 0x210B,
            Self::DuplicateParamIndex { .. } => 0x210C,
            Self::DuplicateLocalName { .. } => 0x210D,
            Self::UnexpectedLiteral { .. } => 0x210E,
            Self::Generator(e) => e.code(),
        }
    }
}

/// Errors raised while merging two intermediates.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The byte blob is not an intermediate (bad magic or footer).
    #[error("attempted to merge an invalid intermediate")]
    InvalidIntermediate,
    /// The intermediate was produced by a different toolchain version.
    #[error("attempted to merge an intermediate built by an incompatible toolchain")]
    IncompatibleIntermediate,
    /// An index in the right-hand intermediate is outside its tables.
    #[error("index out of range while merging")]
    IndexOutOfRange,
    /// Both sides define a body for the same type name.
    #[error("type '{name}' ({lhs_meta}) has already been defined (see {rhs_meta})")]
    TypeRedefinition {
        /// Type name.
        name: String,
        /// Definition already present.
        lhs_meta: SourceMeta,
        /// Colliding definition.
        rhs_meta: SourceMeta,
    },
    /// Both sides define a body for the same method name.
    #[error("method '{name}' ({lhs_meta}) has already been defined (see {rhs_meta})")]
    MethodRedefinition {
        /// Method name.
        name: String,
        /// Definition already present.
        lhs_meta: SourceMeta,
        /// Colliding definition.
        rhs_meta: SourceMeta,
    },
    /// Both sides define the same global or constant name.
    #[error("global '{name}' has already been defined")]
    GlobalRedefinition {
        /// Global name.
        name: String,
    },
    /// A name is bound to different entity kinds on the two sides.
    #[error("definition of '{name}' collides with a previous definition of a different kind")]
    IdentifierTypeMismatch {
        /// Conflicting identifier.
        name: String,
    },
}

impl MergeError {
    /// Stable numeric code.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidIntermediate => 0x3000,
            Self::IncompatibleIntermediate => 0x3001,
            Self::IndexOutOfRange => 0x3100,
            Self::TypeRedefinition { .. } => 0x3101,
            Self::MethodRedefinition { .. } => 0x3102,
            Self::GlobalRedefinition { .. } => 0x3103,
            Self::IdentifierTypeMismatch { .. } => 0x3104,
        }
    }
}

/// Errors raised while resolving and type-checking an intermediate.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The byte blob is not an intermediate.
    #[error("attempted to link an invalid intermediate")]
    InvalidIntermediate,
    /// The intermediate was produced by a different toolchain version.
    #[error("attempted to link an intermediate built by an incompatible toolchain")]
    IncompatibleIntermediate,
    /// A type contains itself by value.
    #[error("{meta}: type '{name}' recursively contains itself")]
    RecursiveTypeDefinition {
        /// Type name.
        name: String,
        /// Declaration site.
        meta: SourceMeta,
    },
    /// A type was declared but never defined.
    #[error("{meta}: undefined type '{name}'")]
    UndefinedType {
        /// Type name.
        name: String,
        /// Declaration site.
        meta: SourceMeta,
    },
    /// A method was referenced but never defined or bound.
    #[error("{meta}: undefined method '{name}'")]
    UndefinedMethod {
        /// Method name.
        name: String,
        /// Reference site.
        meta: SourceMeta,
    },
    /// A global name was referenced but never defined.
    #[error("{meta}: undefined global '{name}'")]
    UndefinedGlobal {
        /// Global name.
        name: String,
        /// Reference site.
        meta: SourceMeta,
    },
    /// A resolved type ended up with zero size.
    #[error("{meta}: type '{name}' has zero size")]
    TypeSizeZero {
        /// Type name.
        name: String,
        /// Declaration site.
        meta: SourceMeta,
    },
    /// A function-pointer global without an initializer.
    #[error("global '{name}' of signature type requires a method initializer")]
    UninitializedMethodPointer {
        /// Global name.
        name: String,
    },
    /// A method initializer naming an unknown method.
    #[error("initializer of global '{name}' names undefined method '{method}'")]
    UndefinedMethodInitializer {
        /// Global name.
        name: String,
        /// Missing method.
        method: String,
    },
    /// A method initializer whose signature does not match the pointer type.
    #[error("initializer of global '{name}' has a mismatched signature")]
    InvalidMethodInitializer {
        /// Global name.
        name: String,
    },
    /// More initializer literals than the global's type can absorb.
    #[error("initializer of global '{name}' overflows its type")]
    GlobalInitializerOverflow {
        /// Global name.
        name: String,
    },
    /// A field chain naming an unknown field.
    #[error("type '{type_name}' has no field '{field}'")]
    UndefinedTypeField {
        /// Type searched.
        type_name: String,
        /// Missing field.
        field: String,
    },
    /// No implicit conversion between the operand types.
    #[error("{meta}: no implicit conversion between the operand types")]
    InvalidImplicitConversion {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// No explicit conversion between the operand types.
    #[error("{meta}: no explicit conversion between the operand types")]
    InvalidExplicitConversion {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// Arithmetic between types without a permitted pair entry.
    #[error("{meta}: invalid arithmetic expression")]
    InvalidArithmeticExpression {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// Comparison between types without a common comparison type.
    #[error("{meta}: invalid comparison expression")]
    InvalidComparisonExpression {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// Pointer arithmetic on a non-pointer, or `pdif` on mismatched
    /// pointees.
    #[error("{meta}: invalid pointer expression")]
    InvalidPointerExpression {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// `padd`/`psub` with a non-integral right-hand side.
    #[error("{meta}: invalid pointer offset expression")]
    InvalidPointerOffsetExpression {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// `sw` on a non-integral selector.
    #[error("{meta}: switch selector must be integral")]
    InvalidSwitchType {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// Call argument count differs from the signature.
    #[error("{meta}: call passes {provided} arguments, signature expects {expected}")]
    ArgumentCountMismatch {
        /// Arguments at the call site.
        provided: usize,
        /// Parameters of the signature.
        expected: usize,
        /// Instruction site.
        meta: SourceMeta,
    },
    /// `callv` through a non-signature type.
    #[error("{meta}: indirect call through a non-signature type")]
    NonSignatureTypeInvoke {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// `{^}` where the previous instruction produced no value.
    #[error("{meta}: return-value address is not valid here")]
    InvalidReturnAddress {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// Subscript outside a fixed array's bounds.
    #[error("{meta}: array index {index} out of range (length {length})")]
    ArrayIndexOutOfRange {
        /// Offending index.
        index: i64,
        /// Array length.
        length: usize,
        /// Instruction site.
        meta: SourceMeta,
    },
    /// `.` across a pointer or `->` without one.
    #[error("{meta}: field modifier does not match the pointer depth of its base")]
    InvalidOffsetModifier {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// A field chain rooted in a type the base address does not have.
    #[error("{meta}: field chain root does not match the addressed type")]
    FieldParentTypeMismatch {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// `*` applied to a non-pointer.
    #[error("{meta}: dereference of a non-pointer")]
    InvalidPointerDereference {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// `*` applied to an untyped `vptr`.
    #[error("{meta}: dereference of an untyped pointer")]
    AbstractPointerDereference {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// A field modifier on something that has no fields.
    #[error("{meta}: field access on a type without fields")]
    InvalidFieldDereference {
        /// Instruction site.
        meta: SourceMeta,
    },
    /// A write targeting a constant: a `constant` table entry or an inline
    /// literal in a destination position.
    #[error("{meta}: constant '{name}' is not writable")]
    ConstantWrite {
        /// Constant name, or the literal's type for inline constants.
        name: String,
        /// Instruction site.
        meta: SourceMeta,
    },
}

impl LinkError {
    /// Stable numeric code.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidIntermediate => 0x4000,
            Self::IncompatibleIntermediate => 0x4001,
            Self::RecursiveTypeDefinition { .. } => 0x4100,
            Self::UndefinedType { .. } => 0x4101,
            Self::UndefinedMethod { .. } => 0x4102,
            Self::UndefinedGlobal { .. } => 0x4103,
            Self::TypeSizeZero { .. } => 0x4104,
            Self::UninitializedMethodPointer { .. } => 0x4200,
            Self::UndefinedMethodInitializer { .. } => 0x4201,
            Self::InvalidMethodInitializer { .. } => 0x4202,
            Self::GlobalInitializerOverflow { .. } => 0x4203,
            Self::UndefinedTypeField { .. } => 0x4204,
            Self::InvalidImplicitConversion { .. } => 0x4300,
            Self::InvalidExplicitConversion { .. } => 0x4301,
            Self::InvalidArithmeticExpression { .. } => 0x4302,
            Self::InvalidComparisonExpression { .. } => 0x4303,
            Self::InvalidPointerExpression { .. } => 0x4304,
            Self::InvalidPointerOffsetExpression { .. } => 0x4305,
            Self::InvalidSwitchType { .. } => 0x4306,
            Self::ArgumentCountMismatch { .. } => 0x4307,
            Self::NonSignatureTypeInvoke { .. } => 0x4308,
            Self::InvalidReturnAddress { .. } => 0x4309,
            Self::ArrayIndexOutOfRange { .. } => 0x430A,
            Self::InvalidOffsetModifier { .. } => 0x430B,
            Self::FieldParentTypeMismatch { .. } => 0x430C,
            Self::InvalidPointerDereference { .. } => 0x430D,
            Self::AbstractPointerDereference { .. } => 0x430E,
            Self::InvalidFieldDereference { .. } => 0x430F,
            Self::ConstantWrite { .. } => 0x4310,
        }
    }
}

/// Errors raised while preparing or executing an assembly.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The byte blob is not an assembly.
    #[error("attempted to execute an invalid assembly")]
    InvalidAssembly,
    /// The assembly was produced by a different toolchain version.
    #[error("attempted to execute an assembly built by an incompatible toolchain")]
    IncompatibleAssembly,
    /// The assembly carries no `main` method.
    #[error("failed to find main entrypoint in assembly")]
    EntrypointNotFound,
    /// No stack allocation within the configured bounds succeeded.
    #[error("failed to allocate sufficient memory for the runtime stack")]
    StackAllocationFailure,
    /// A frame push exceeded the runtime stack.
    #[error("runtime stack overflow ({size}/{capacity})")]
    StackOverflow {
        /// Bytes the push would have needed.
        size: usize,
        /// Stack capacity.
        capacity: usize,
    },
    /// Call depth exceeded the configured limit.
    #[error("maximum callstack depth of {max_depth} exceeded")]
    CallstackLimit {
        /// Configured depth limit.
        max_depth: usize,
    },
    /// The assembly was linked against a different runtime surface.
    #[error("runtime hash value mismatch")]
    RuntimeHashMismatch,
}

impl RuntimeError {
    /// Stable numeric code.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidAssembly => 0x5000,
            Self::IncompatibleAssembly => 0x5001,
            Self::EntrypointNotFound => 0x5002,
            Self::StackAllocationFailure => 0x5003,
            Self::StackOverflow { .. } => 0x5004,
            Self::CallstackLimit { .. } => 0x5005,
            Self::RuntimeHashMismatch => 0x5006,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_sit_in_their_phase_blocks() {
        let meta = SourceMeta::default();
        assert_eq!(
            GeneratorError::ArrayLengthZero { meta: meta.clone() }.code(),
            0x1104
        );
        assert_eq!(ParseError::UnexpectedEof { meta: meta.clone() }.code(), 0x2102);
        assert_eq!(MergeError::IndexOutOfRange.code(), 0x3100);
        assert_eq!(LinkError::RecursiveTypeDefinition { name: "S".into(), meta }.code(), 0x4100);
        assert_eq!(
            RuntimeError::StackOverflow { size: 2, capacity: 1 }.code(),
            0x5004
        );
    }

    #[test]
    fn parser_wraps_generator_codes() {
        let err = ParseError::from(GeneratorError::ParameterOverflow {
            meta: SourceMeta::default(),
        });
        assert_eq!(err.code(), 0x1101);
    }
}
