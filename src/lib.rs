//! Model-code generator for declaratively specified process models.
//!
//! The library side re-exports the generation pipeline and the bundled
//! models; the `modelgen` binary wraps both in a command line interface.

pub use modelgen_core;
pub use modelgen_models;

pub mod discovery;

#[cfg(feature = "python")]
mod python;
