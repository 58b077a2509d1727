//! Core identifier types
//!
//! This module provides unique identifiers used throughout the proxy.

use uuid::Uuid;

/// Unique identifier for frontend connections
///
/// Generated once per accepted connection and carried through every log
/// line the session emits, so concurrent sessions can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a new unique client ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_unique() {
        let id1 = ClientId::new();
        let id2 = ClientId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_display() {
        let client_id = ClientId::new();
        assert!(!format!("{}", client_id).is_empty());
        assert_eq!(format!("{}", client_id), client_id.as_uuid().to_string());
    }
}
