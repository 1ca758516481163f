//! Builders a compiler backend uses to produce the encoded tables of a
//! compiled method.

mod debug_info;
mod oop_map;
mod relocations;
mod tables;

pub use self::debug_info::*;
pub use self::oop_map::*;
pub use self::relocations::*;
pub use self::tables::*;
