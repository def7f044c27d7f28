pub mod component;
pub mod config;
pub mod hooks;
pub mod logging;

pub use smithers_common::{errors, model};
pub use smithers_runtime::{interfaces, phase_registry, ralph, reactive, reconciler, store, supersmithers};
