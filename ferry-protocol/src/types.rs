//! Opaque identifiers shared across all ferry crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier for a stored file blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Generate a fresh random upload ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier a transport resolves to a network endpoint.
///
/// Opaque to the coordinator; supplied by the caller (typically another
/// user's ID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier for one directional transfer attempt between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh random session ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = UploadId::generate();
        let b = UploadId::generate();
        assert_ne!(a, b);

        let s1 = SessionId::generate();
        let s2 = SessionId::generate();
        assert_ne!(s1, s2);
    }

    #[test]
    fn ids_display_as_inner_string() {
        let id = PeerId("peer-42".to_string());
        assert_eq!(id.to_string(), "peer-42");
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = UploadId("abc".to_string());
        let encoded: Vec<u8> = postcard::to_allocvec(&id).unwrap();
        let decoded: UploadId = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(id, decoded);
    }
}
