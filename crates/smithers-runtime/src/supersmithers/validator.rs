//! Enforces the overlay-code constraints before a rewrite is activated.
//! Violations surface as a `RewriteValidationError` carrying a stable rule id
//! so the rewriter can be re-prompted with a precise error list.

use sha2::{Digest, Sha256};
use smithers_common::errors::{RewriteValidationError, ValidationRule};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
pub const DEFAULT_SIZE_CEILING_BYTES: usize = 64 * 1024;

/// Substrings that indicate the overlay steps outside its sanctioned API
/// surface. A real validator would type-check against the registered factory
/// signature; this heuristic scan is the practical stand-in a pure-data
/// "code" string admits.
const FORBIDDEN_GLOBALS: &[&str] = &["std::process::Command", "std::env::", "unsafe "];
const NON_SEND_MARKERS: &[&str] = &["Rc<", "RefCell<", "Cell<"];

/// Marker every overlay must define; the registry resolves a factory under
/// this name for the proposed `version_id` — parsing is realised as "the
/// overlay registry can resolve a factory for the proposed version_id".
pub const FACTORY_MARKER: &str = "fn overlay_factory";

pub fn sha256_hex(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// Runs every rule in order, returning the first violation. `code` is
/// the proposed overlay source; `expected_module_hash` ties the proposal back
/// to the scope being rewritten.
pub fn validate(code: &str, expected_module_hash: &str, max_size: usize) -> Result<(), RewriteValidationError> {
    if code.contains("\"./") || code.contains("\"../") || code.contains("'./") || code.contains("'../") {
        return Err(RewriteValidationError::new(
            ValidationRule::NoRelativeImports,
            "overlay references a relative, non-registered path",
        ));
    }

    for marker in FORBIDDEN_GLOBALS {
        if code.contains(marker) {
            return Err(RewriteValidationError::new(
                ValidationRule::NoForeignGlobals,
                format!("overlay references disallowed identifier '{marker}'"),
            ));
        }
    }

    if !code.contains(FACTORY_MARKER) {
        return Err(RewriteValidationError::new(
            ValidationRule::MustRegisterFactory,
            format!("overlay must define `{FACTORY_MARKER}`"),
        ));
    }

    for marker in NON_SEND_MARKERS {
        if code.contains(marker) {
            return Err(RewriteValidationError::new(
                ValidationRule::MustBeSend,
                format!("overlay captures non-Send state via '{marker}'"),
            ));
        }
    }

    if code.len() > max_size {
        return Err(RewriteValidationError::new(
            ValidationRule::SizeCeiling,
            format!("overlay is {} bytes, ceiling is {max_size}", code.len()),
        ));
    }

    let marker = format!("module_hash: {expected_module_hash}");
    if !code.contains(&marker) {
        return Err(RewriteValidationError::new(
            ValidationRule::HashMismatch,
            format!("overlay does not declare `{marker}`"),
        ));
    }

    Ok(())
}
