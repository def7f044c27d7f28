//! Engine library for Smithers: embedded store, reactive query layer, reconciler,
//! phase state machine, the RalphLoop driver and the SuperSmithers self-rewriting
//! observer.
//!
//! This crate has no network surface and no `[[bin]]`; everything here is called
//! in-process by the integrating binary (the root `smithers` crate).

pub mod interfaces;
pub mod phase_registry;
pub mod ralph;
pub mod reactive;
pub mod reconciler;
pub mod store;
pub mod supersmithers;

pub use smithers_common::{errors, model};
