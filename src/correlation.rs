use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque token linking a response to its originating request.
///
/// Correlation ids are carried *in-band* inside envelopes and are opaque to
/// the broker. Generated ids are UUID v4 (122 bits of entropy), collision
/// resistant across any set of requests a single client has in flight.
///
/// Matching is byte-exact, case-sensitive equality. `Eq` and `Hash` follow
/// the same rule, so a pending-request map keyed by `CorrelationId` performs
/// the matching directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new unique correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the correlation id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn generate_is_unique() {
        // ---
        let id1 = CorrelationId::generate();
        let id2 = CorrelationId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn matching_is_byte_exact() {
        // ---
        let id = CorrelationId::from("AbC-123");
        assert_eq!(id, CorrelationId::from("AbC-123"));
        // Case sensitive.
        assert_ne!(id, CorrelationId::from("abc-123"));
    }

    #[test]
    fn generated_format_is_uuid() {
        // ---
        let id = CorrelationId::generate();
        assert_eq!(id.to_string().len(), 36);
    }
}
