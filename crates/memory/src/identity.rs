use sha2::{Digest, Sha256};

use crate::error::{ContextdError, Result};

/// Validate a 64-character lowercase-hex owner identifier (SHA-256 of an
/// external principal name). Empty identifiers are rejected at the boundary
/// so a missing owner can never silently scope to an empty-string tenant.
pub fn validate_owner_id(owner_id: &str) -> Result<()> {
    if owner_id.is_empty() {
        return Err(ContextdError::invalid("owner_id must not be empty"));
    }
    let is_lowercase_hex = owner_id.len() == 64
        && owner_id
            .bytes()
            .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
    if !is_lowercase_hex {
        return Err(ContextdError::invalid(
            "owner_id must be a 64-character lowercase hex string",
        ));
    }
    Ok(())
}

/// Derive an owner id the way an upstream caller is expected to: SHA-256 of
/// the external principal name, lowercase hex. Exposed for test fixtures and
/// for callers that receive a raw principal instead of a pre-hashed id.
pub fn derive_owner_id(principal: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(principal.as_bytes());
    format!("{:x}", hasher.finalize())
}
