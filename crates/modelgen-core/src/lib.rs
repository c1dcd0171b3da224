//! Model-code generation and adaptive explicit integration for declaratively
//! specified process models.
//!
//! A [`ModelDefinition`](manifest::ModelDefinition) is compiled by
//! [`codegen`] into a self-contained C unit, kept current on disk by
//! [`UnitDriver`](driver::UnitDriver), or executed directly by the
//! [`runtime`] with the [`solver`].

pub mod codegen;
pub mod config;
pub mod driver;
pub mod integration;
pub mod manifest;
pub mod method;
pub mod runtime;
pub mod schema;
pub mod solver;
pub mod toolchain;

pub mod errors;
