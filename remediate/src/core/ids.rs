//! Deterministic identifiers.
//!
//! Orchestration never draws random ids: every id is derived from content that
//! is already part of the durable state, so a replayed workflow reproduces the
//! same ids.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `material`, truncated to `len` characters.
pub fn content_id(material: &str, len: usize) -> String {
    let digest = Sha256::digest(material.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(len.min(encoded.len()));
    encoded
}

/// Workflow id for a subject locator (e.g. `fix:src/app.ts`).
pub fn workflow_id(locator: &str) -> String {
    format!("wf-{}", content_id(locator, 12))
}

/// Gate id for the gate opened in `iteration` of `workflow_id`.
pub fn gate_id(workflow_id: &str, iteration: u32) -> String {
    format!("{workflow_id}-{iteration}-gate")
}

/// Validate an id before it is used as a path component.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_ids_are_stable_and_distinct() {
        let a = workflow_id("fix:src/a.ts");
        assert_eq!(a, workflow_id("fix:src/a.ts"));
        assert_ne!(a, workflow_id("fix:src/b.ts"));
        assert_eq!(a.len(), "wf-".len() + 12);
        assert!(is_safe_id(&a));
    }

    #[test]
    fn gate_ids_embed_iteration() {
        assert_eq!(gate_id("wf-1", 3), "wf-1-3-gate");
    }

    #[test]
    fn unsafe_ids_are_rejected() {
        assert!(!is_safe_id(""));
        assert!(!is_safe_id("../etc"));
        assert!(!is_safe_id("a/b"));
    }
}
