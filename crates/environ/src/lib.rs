//! Encoded metadata formats attached to a compiled method.
//!
//! Everything in this crate is a plain data format: the compressed byte
//! stream the debug information is written in, register/stack locations,
//! oop maps, pc descriptors, scope values, relocations, dependencies and the
//! exception tables. Readers borrow the encoded bytes and never copy them.
//! The matching builders, used by a compiler backend when it finalizes a
//! method, live behind the `compile` feature.

#![deny(missing_docs)]

mod compressed_stream;
mod debug_info;
mod dependencies;
mod handler_table;
mod implicit_exception_table;
mod oop_map;
mod pc_desc;
mod relocation;
mod vmreg;

pub use crate::compressed_stream::*;
pub use crate::debug_info::*;
pub use crate::dependencies::*;
pub use crate::handler_table::*;
pub use crate::implicit_exception_table::*;
pub use crate::oop_map::*;
pub use crate::pc_desc::*;
pub use crate::relocation::*;
pub use crate::vmreg::*;
pub use object;

#[cfg(feature = "compile")]
mod compile;
#[cfg(feature = "compile")]
pub use crate::compile::*;

/// Bytecode index used by scopes describing the method entry.
pub const INVOCATION_ENTRY_BCI: i32 = -1;

/// Decode offset meaning "nothing here" in every encoded table.
///
/// Offset zero of each debug-information stream is reserved so that a
/// back-reference of `0` can encode an absent value.
pub const SERIALIZED_NULL: i32 = 0;
