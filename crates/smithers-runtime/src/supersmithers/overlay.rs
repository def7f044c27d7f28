//! Registry-of-factories substitution for dynamic module loading: since Rust
//! has no runtime module loader, an overlay is a compiled artifact registered
//! under its `version_id` ahead of time by the integrating binary; the
//! reconciler looks it up by id instead of importing source at runtime.

use std::collections::HashMap;
use std::sync::Mutex;

use smithers_common::errors::OverlayLoadError;

use crate::reconciler::Node;

/// What a registered overlay factory needs to build its replacement subtree.
pub struct OverlayContext {
    pub module_hash: String,
    pub version_id: String,
}

type Factory = Box<dyn Fn(&OverlayContext) -> Node + Send + Sync>;

/// Maps `version_id -> factory`. The `newCode` persisted to the VCS (see
/// `vcs.rs`) is the human-readable record of what was swapped in; this
/// registry is what the reconciler actually calls on mount.
#[derive(Default)]
pub struct OverlayRegistry {
    factories: Mutex<HashMap<String, Factory>>,
}

impl OverlayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, version_id: impl Into<String>, factory: impl Fn(&OverlayContext) -> Node + Send + Sync + 'static) {
        self.factories
            .lock()
            .expect("overlay registry mutex poisoned")
            .insert(version_id.into(), Box::new(factory));
    }

    pub fn is_registered(&self, version_id: &str) -> bool {
        self.factories.lock().expect("overlay registry mutex poisoned").contains_key(version_id)
    }

    /// Resolves and invokes the factory for `version_id`. Spec §7: a failed
    /// lookup clears the `ActiveOverride` (handled by the caller) and surfaces
    /// this error via SuperSmithers' `on_error` callback.
    pub fn resolve(&self, module_hash: &str, version_id: &str) -> Result<Node, OverlayLoadError> {
        let factories = self.factories.lock().expect("overlay registry mutex poisoned");
        let factory = factories.get(version_id).ok_or_else(|| OverlayLoadError {
            version_id: version_id.to_string(),
            message: "no factory registered for this version_id".to_string(),
        })?;
        let ctx = OverlayContext {
            module_hash: module_hash.to_string(),
            version_id: version_id.to_string(),
        };
        Ok(factory(&ctx))
    }
}
