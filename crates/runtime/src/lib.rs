//! Runtime state of compiled methods.
//!
//! An [`NMethod`] is a block of generated code plus the encoded tables from
//! `codemeta_environ` that describe it. This crate owns everything that
//! changes after the code is published: the pc descriptor lookup cache,
//! lazily decoded scopes, the exception cache, patchable call sites, the
//! entry barrier, the lifecycle state machine, the per-cycle unloading
//! decision and the collector's oops-do claim protocol. The process-wide
//! pieces (registry, cycle counters, locks, stubs) live in [`CodeCache`],
//! which every operation receives explicitly.

#![deny(missing_docs)]

mod code_cache;
mod config;
mod entry_barrier;
mod exception_cache;
mod frame;
mod inline_cache;
mod lifecycle;
mod metaspace;
mod nmethod;
mod oop_map_do;
mod oops_do_mark;
mod pc_desc_cache;
mod safepoint;
mod scope_desc;
mod unloading;

pub use crate::code_cache::*;
pub use crate::config::Tunables;
pub use crate::entry_barrier::EntryBarrier;
pub use crate::exception_cache::ExceptionCache;
pub use crate::frame::*;
pub use crate::inline_cache::*;
pub use crate::lifecycle::{NMethodMirror, NMethodState};
pub use crate::metaspace::*;
pub use crate::nmethod::*;
pub use crate::oop_map_do::*;
pub use crate::oops_do_mark::{OopsDoMarkState, OopsDoProcessor};
pub use crate::pc_desc_cache::{PC_DESC_CACHE_SIZE, PcDescContainer};
pub use crate::safepoint::*;
pub use crate::scope_desc::*;
pub use crate::unloading::*;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
