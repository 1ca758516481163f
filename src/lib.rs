//! Metadata of JIT-compiled methods.
//!
//! A compiler backend finalizing a method hands its instructions and the
//! tables describing them to a [`CodeCache`](runtime::CodeCache), getting
//! back an [`NMethod`](runtime::NMethod). The runtime then answers the
//! questions stack walkers, the exception dispatcher, the deoptimizer and
//! the collector ask about that code:
//!
//! * which bytecode position and inlined scopes a pc belongs to
//!   ([`NMethod::find_pc_desc`](runtime::NMethod::find_pc_desc),
//!   [`NMethod::scope_desc_at`](runtime::NMethod::scope_desc_at));
//! * where the live references of a frame are
//!   ([`NMethod::frame_oops_do`](runtime::NMethod::frame_oops_do));
//! * where an exception thrown at a pc continues
//!   ([`NMethod::handler_for_exception_and_pc`](runtime::NMethod::handler_for_exception_and_pc));
//! * whether the code may still be entered, and whether it dies in the
//!   current unloading cycle.
//!
//! The encoded formats and the builders that produce them live in
//! [`environ`]; the mutable runtime state lives in [`runtime`].

#![deny(missing_docs)]

pub use codemeta_environ as environ;
pub use codemeta_runtime as runtime;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
