//! Translators re-emitting a linked assembly as source text.

mod c;
mod il;

pub use c::{mangle_global, mangle_method, mangle_type, translate_c};
pub use il::translate_il;
