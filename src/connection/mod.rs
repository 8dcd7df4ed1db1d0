use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Session contract the transaction engine requires from its owner.
///
/// The engine reads the autocommit flag at `begin` time to pick the id
/// parity, and forwards the opaque original properties to the distributed
/// validator untouched.
pub trait Session: Send + Sync {
    fn is_auto_commit(&self) -> bool;

    /// Short name of the owning database.
    fn database_short_name(&self) -> &str;

    /// Opaque connection properties forwarded to the validator.
    fn original_properties(&self) -> serde_json::Value;
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A database session handle.
///
/// Owns at most one active transaction at a time; the caller serializes
/// operations within a session.
pub struct DatabaseSession {
    id: u64,
    database: String,
    auto_commit: AtomicBool,
    properties: serde_json::Value,
}

impl DatabaseSession {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            database: database.into(),
            auto_commit: AtomicBool::new(true),
            properties: serde_json::Value::Null,
        }
    }

    /// Builder-style autocommit toggle.
    pub fn auto_commit(self, enabled: bool) -> Self {
        self.auto_commit.store(enabled, Ordering::SeqCst);
        self
    }

    /// Builder-style connection properties.
    pub fn properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_auto_commit(&self, enabled: bool) {
        self.auto_commit.store(enabled, Ordering::SeqCst);
    }
}

impl Session for DatabaseSession {
    fn is_auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::SeqCst)
    }

    fn database_short_name(&self) -> &str {
        &self.database
    }

    fn original_properties(&self) -> serde_json::Value {
        self.properties.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = DatabaseSession::new("db");
        let b = DatabaseSession::new("db");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_auto_commit_toggle() {
        let session = DatabaseSession::new("db").auto_commit(false);
        assert!(!session.is_auto_commit());
        session.set_auto_commit(true);
        assert!(session.is_auto_commit());
    }
}
