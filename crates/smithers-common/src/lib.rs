//! Shared domain types and error taxonomy for the Smithers orchestration engine.
//!
//! This crate carries no execution logic — it is the vocabulary the rest of the
//! workspace (`smithers-runtime`, the root `smithers` crate) shares, so that a
//! `Phase` row produced by the reconciler and a `Phase` row read back by a CLI
//! command are the same type.

pub mod errors;
pub mod model;

pub use errors::SmithersError;
