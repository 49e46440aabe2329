// Declarative scalar operand tables. Every `(subcode, lhs, rhs)` entry below
// is the single source both the linker (subcode assignment and operand
// validation) and the interpreter (typed dispatch) are generated from.
// Table order is load-bearing: an entry's position IS its subcode.

/// Binary arithmetic pairs: `rhs` converts implicitly (widening only) into
/// `lhs`, which is also the result type. Drives `mul div mod add sub` and,
/// together with the trailing raw-copy subcode, `set`.
#[macro_export]
macro_rules! with_arith_pairs {
    ($cb:ident) => { $cb! {
        (0, I8, i8, I8, i8),
        (1, U8, u8, U8, u8),
        (2, I16, i16, I8, i8),
        (3, I16, i16, U8, u8),
        (4, I16, i16, I16, i16),
        (5, U16, u16, U8, u8),
        (6, U16, u16, U16, u16),
        (7, I32, i32, I8, i8),
        (8, I32, i32, U8, u8),
        (9, I32, i32, I16, i16),
        (10, I32, i32, U16, u16),
        (11, I32, i32, I32, i32),
        (12, U32, u32, U8, u8),
        (13, U32, u32, U16, u16),
        (14, U32, u32, U32, u32),
        (15, I64, i64, I8, i8),
        (16, I64, i64, U8, u8),
        (17, I64, i64, I16, i16),
        (18, I64, i64, U16, u16),
        (19, I64, i64, I32, i32),
        (20, I64, i64, U32, u32),
        (21, I64, i64, I64, i64),
        (22, U64, u64, U8, u8),
        (23, U64, u64, U16, u16),
        (24, U64, u64, U32, u32),
        (25, U64, u64, U64, u64),
        (26, F32, f32, I8, i8),
        (27, F32, f32, U8, u8),
        (28, F32, f32, I16, i16),
        (29, F32, f32, U16, u16),
        (30, F32, f32, I32, i32),
        (31, F32, f32, U32, u32),
        (32, F32, f32, I64, i64),
        (33, F32, f32, U64, u64),
        (34, F32, f32, F32, f32),
        (35, F64, f64, I8, i8),
        (36, F64, f64, U8, u8),
        (37, F64, f64, I16, i16),
        (38, F64, f64, U16, u16),
        (39, F64, f64, I32, i32),
        (40, F64, f64, U32, u32),
        (41, F64, f64, I64, i64),
        (42, F64, f64, U64, u64),
        (43, F64, f64, F32, f32),
        (44, F64, f64, F64, f64),
    } };
}

/// Integral pairs, the integral prefix of the arithmetic table. Drives
/// `lsh rsh and xor or`.
#[macro_export]
macro_rules! with_integral_pairs {
    ($cb:ident) => { $cb! {
        (0, I8, i8, I8, i8),
        (1, U8, u8, U8, u8),
        (2, I16, i16, I8, i8),
        (3, I16, i16, U8, u8),
        (4, I16, i16, I16, i16),
        (5, U16, u16, U8, u8),
        (6, U16, u16, U16, u16),
        (7, I32, i32, I8, i8),
        (8, I32, i32, U8, u8),
        (9, I32, i32, I16, i16),
        (10, I32, i32, U16, u16),
        (11, I32, i32, I32, i32),
        (12, U32, u32, U8, u8),
        (13, U32, u32, U16, u16),
        (14, U32, u32, U32, u32),
        (15, I64, i64, I8, i8),
        (16, I64, i64, U8, u8),
        (17, I64, i64, I16, i16),
        (18, I64, i64, U16, u16),
        (19, I64, i64, I32, i32),
        (20, I64, i64, U32, u32),
        (21, I64, i64, I64, i64),
        (22, U64, u64, U8, u8),
        (23, U64, u64, U16, u16),
        (24, U64, u64, U32, u32),
        (25, U64, u64, U64, u64),
    } };
}

/// Explicit conversions: every destination/source pair, destination-major.
/// Drives `conv`.
#[macro_export]
macro_rules! with_conv_pairs {
    ($cb:ident) => { $cb! {
        (0, I8, i8, I8, i8),
        (1, I8, i8, U8, u8),
        (2, I8, i8, I16, i16),
        (3, I8, i8, U16, u16),
        (4, I8, i8, I32, i32),
        (5, I8, i8, U32, u32),
        (6, I8, i8, I64, i64),
        (7, I8, i8, U64, u64),
        (8, I8, i8, F32, f32),
        (9, I8, i8, F64, f64),
        (10, U8, u8, I8, i8),
        (11, U8, u8, U8, u8),
        (12, U8, u8, I16, i16),
        (13, U8, u8, U16, u16),
        (14, U8, u8, I32, i32),
        (15, U8, u8, U32, u32),
        (16, U8, u8, I64, i64),
        (17, U8, u8, U64, u64),
        (18, U8, u8, F32, f32),
        (19, U8, u8, F64, f64),
        (20, I16, i16, I8, i8),
        (21, I16, i16, U8, u8),
        (22, I16, i16, I16, i16),
        (23, I16, i16, U16, u16),
        (24, I16, i16, I32, i32),
        (25, I16, i16, U32, u32),
        (26, I16, i16, I64, i64),
        (27, I16, i16, U64, u64),
        (28, I16, i16, F32, f32),
        (29, I16, i16, F64, f64),
        (30, U16, u16, I8, i8),
        (31, U16, u16, U8, u8),
        (32, U16, u16, I16, i16),
        (33, U16, u16, U16, u16),
        (34, U16, u16, I32, i32),
        (35, U16, u16, U32, u32),
        (36, U16, u16, I64, i64),
        (37, U16, u16, U64, u64),
        (38, U16, u16, F32, f32),
        (39, U16, u16, F64, f64),
        (40, I32, i32, I8, i8),
        (41, I32, i32, U8, u8),
        (42, I32, i32, I16, i16),
        (43, I32, i32, U16, u16),
        (44, I32, i32, I32, i32),
        (45, I32, i32, U32, u32),
        (46, I32, i32, I64, i64),
        (47, I32, i32, U64, u64),
        (48, I32, i32, F32, f32),
        (49, I32, i32, F64, f64),
        (50, U32, u32, I8, i8),
        (51, U32, u32, U8, u8),
        (52, U32, u32, I16, i16),
        (53, U32, u32, U16, u16),
        (54, U32, u32, I32, i32),
        (55, U32, u32, U32, u32),
        (56, U32, u32, I64, i64),
        (57, U32, u32, U64, u64),
        (58, U32, u32, F32, f32),
        (59, U32, u32, F64, f64),
        (60, I64, i64, I8, i8),
        (61, I64, i64, U8, u8),
        (62, I64, i64, I16, i16),
        (63, I64, i64, U16, u16),
        (64, I64, i64, I32, i32),
        (65, I64, i64, U32, u32),
        (66, I64, i64, I64, i64),
        (67, I64, i64, U64, u64),
        (68, I64, i64, F32, f32),
        (69, I64, i64, F64, f64),
        (70, U64, u64, I8, i8),
        (71, U64, u64, U8, u8),
        (72, U64, u64, I16, i16),
        (73, U64, u64, U16, u16),
        (74, U64, u64, I32, i32),
        (75, U64, u64, U32, u32),
        (76, U64, u64, I64, i64),
        (77, U64, u64, U64, u64),
        (78, U64, u64, F32, f32),
        (79, U64, u64, F64, f64),
        (80, F32, f32, I8, i8),
        (81, F32, f32, U8, u8),
        (82, F32, f32, I16, i16),
        (83, F32, f32, U16, u16),
        (84, F32, f32, I32, i32),
        (85, F32, f32, U32, u32),
        (86, F32, f32, I64, i64),
        (87, F32, f32, U64, u64),
        (88, F32, f32, F32, f32),
        (89, F32, f32, F64, f64),
        (90, F64, f64, I8, i8),
        (91, F64, f64, U8, u8),
        (92, F64, f64, I16, i16),
        (93, F64, f64, U16, u16),
        (94, F64, f64, I32, i32),
        (95, F64, f64, U32, u32),
        (96, F64, f64, I64, i64),
        (97, F64, f64, U64, u64),
        (98, F64, f64, F32, f32),
        (99, F64, f64, F64, f64),
    } };
}

/// Comparison pairs with their common comparison type. Signed integral
/// against `u64` has no sign-preserving common type and is absent. Drives
/// `cmp ceq cne cgt cge clt cle` and the conditional branches.
#[macro_export]
macro_rules! with_compare_pairs {
    ($cb:ident) => { $cb! {
        (0, I8, i8, I8, i8, I32, i32),
        (1, I8, i8, U8, u8, I32, i32),
        (2, I8, i8, I16, i16, I32, i32),
        (3, I8, i8, U16, u16, I32, i32),
        (4, I8, i8, I32, i32, I32, i32),
        (5, I8, i8, U32, u32, I64, i64),
        (6, I8, i8, I64, i64, I64, i64),
        (7, I8, i8, F32, f32, F32, f32),
        (8, I8, i8, F64, f64, F64, f64),
        (9, U8, u8, I8, i8, I32, i32),
        (10, U8, u8, U8, u8, I32, i32),
        (11, U8, u8, I16, i16, I32, i32),
        (12, U8, u8, U16, u16, I32, i32),
        (13, U8, u8, I32, i32, I32, i32),
        (14, U8, u8, U32, u32, I64, i64),
        (15, U8, u8, I64, i64, I64, i64),
        (16, U8, u8, U64, u64, U64, u64),
        (17, U8, u8, F32, f32, F32, f32),
        (18, U8, u8, F64, f64, F64, f64),
        (19, I16, i16, I8, i8, I32, i32),
        (20, I16, i16, U8, u8, I32, i32),
        (21, I16, i16, I16, i16, I32, i32),
        (22, I16, i16, U16, u16, I32, i32),
        (23, I16, i16, I32, i32, I32, i32),
        (24, I16, i16, U32, u32, I64, i64),
        (25, I16, i16, I64, i64, I64, i64),
        (26, I16, i16, F32, f32, F32, f32),
        (27, I16, i16, F64, f64, F64, f64),
        (28, U16, u16, I8, i8, I32, i32),
        (29, U16, u16, U8, u8, I32, i32),
        (30, U16, u16, I16, i16, I32, i32),
        (31, U16, u16, U16, u16, I32, i32),
        (32, U16, u16, I32, i32, I32, i32),
        (33, U16, u16, U32, u32, I64, i64),
        (34, U16, u16, I64, i64, I64, i64),
        (35, U16, u16, U64, u64, U64, u64),
        (36, U16, u16, F32, f32, F32, f32),
        (37, U16, u16, F64, f64, F64, f64),
        (38, I32, i32, I8, i8, I32, i32),
        (39, I32, i32, U8, u8, I32, i32),
        (40, I32, i32, I16, i16, I32, i32),
        (41, I32, i32, U16, u16, I32, i32),
        (42, I32, i32, I32, i32, I32, i32),
        (43, I32, i32, U32, u32, I64, i64),
        (44, I32, i32, I64, i64, I64, i64),
        (45, I32, i32, F32, f32, F32, f32),
        (46, I32, i32, F64, f64, F64, f64),
        (47, U32, u32, I8, i8, I64, i64),
        (48, U32, u32, U8, u8, I64, i64),
        (49, U32, u32, I16, i16, I64, i64),
        (50, U32, u32, U16, u16, I64, i64),
        (51, U32, u32, I32, i32, I64, i64),
        (52, U32, u32, U32, u32, U32, u32),
        (53, U32, u32, I64, i64, I64, i64),
        (54, U32, u32, U64, u64, U64, u64),
        (55, U32, u32, F32, f32, F32, f32),
        (56, U32, u32, F64, f64, F64, f64),
        (57, I64, i64, I8, i8, I64, i64),
        (58, I64, i64, U8, u8, I64, i64),
        (59, I64, i64, I16, i16, I64, i64),
        (60, I64, i64, U16, u16, I64, i64),
        (61, I64, i64, I32, i32, I64, i64),
        (62, I64, i64, U32, u32, I64, i64),
        (63, I64, i64, I64, i64, I64, i64),
        (64, I64, i64, F32, f32, F32, f32),
        (65, I64, i64, F64, f64, F64, f64),
        (66, U64, u64, U8, u8, U64, u64),
        (67, U64, u64, U16, u16, U64, u64),
        (68, U64, u64, U32, u32, U64, u64),
        (69, U64, u64, U64, u64, U64, u64),
        (70, U64, u64, F32, f32, F32, f32),
        (71, U64, u64, F64, f64, F64, f64),
        (72, F32, f32, I8, i8, F32, f32),
        (73, F32, f32, U8, u8, F32, f32),
        (74, F32, f32, I16, i16, F32, f32),
        (75, F32, f32, U16, u16, F32, f32),
        (76, F32, f32, I32, i32, F32, f32),
        (77, F32, f32, U32, u32, F32, f32),
        (78, F32, f32, I64, i64, F32, f32),
        (79, F32, f32, U64, u64, F32, f32),
        (80, F32, f32, F32, f32, F32, f32),
        (81, F32, f32, F64, f64, F64, f64),
        (82, F64, f64, I8, i8, F64, f64),
        (83, F64, f64, U8, u8, F64, f64),
        (84, F64, f64, I16, i16, F64, f64),
        (85, F64, f64, U16, u16, F64, f64),
        (86, F64, f64, I32, i32, F64, f64),
        (87, F64, f64, U32, u32, F64, f64),
        (88, F64, f64, I64, i64, F64, f64),
        (89, F64, f64, U64, u64, F64, f64),
        (90, F64, f64, F32, f32, F64, f64),
        (91, F64, f64, F64, f64, F64, f64),
    } };
}

/// Operand types of `not`: the integral types.
#[macro_export]
macro_rules! with_not_types {
    ($cb:ident) => { $cb! {
        (0, I8, i8),
        (1, U8, u8),
        (2, I16, i16),
        (3, U16, u16),
        (4, I32, i32),
        (5, U32, u32),
        (6, I64, i64),
        (7, U64, u64),
    } };
}

/// Operand types of `neg`: everything that can carry a sign.
#[macro_export]
macro_rules! with_neg_types {
    ($cb:ident) => { $cb! {
        (0, I8, i8),
        (1, I16, i16),
        (2, I32, i32),
        (3, I64, i64),
        (4, F32, f32),
        (5, F64, f64),
    } };
}

/// Operand types of the zero tests `cze`/`cnz` (and `bze`/`bnz`).
#[macro_export]
macro_rules! with_test_types {
    ($cb:ident) => { $cb! {
        (0, I8, i8),
        (1, U8, u8),
        (2, I16, i16),
        (3, U16, u16),
        (4, I32, i32),
        (5, U32, u32),
        (6, I64, i64),
        (7, U64, u64),
        (8, F32, f32),
        (9, F64, f64),
    } };
}

/// Right-hand integral operand of `padd`/`psub`.
#[macro_export]
macro_rules! with_pointer_offset_types {
    ($cb:ident) => { $cb! {
        (0, I8, i8),
        (1, U8, u8),
        (2, I16, i16),
        (3, U16, u16),
        (4, I32, i32),
        (5, U32, u32),
        (6, I64, i64),
        (7, U64, u64),
    } };
}
