// ============================================================================
// Cluster Coordination
// ============================================================================

pub mod status_table;
pub mod validator;

pub use status_table::{LocalTransactionStatusTable, TransactionStatusTable};
pub use validator::{
    NoopTransactionValidator, TransactionValidator, ValidationRequest, ValidationWorker,
};

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;

static CLUSTER_MODE: AtomicBool = AtomicBool::new(false);

/// Process-wide cluster flag. Non-autocommit transactions begun while this
/// is on participate in distributed commit and receive odd ids.
pub fn is_cluster_mode() -> bool {
    CLUSTER_MODE.load(Ordering::SeqCst)
}

pub fn set_cluster_mode(enabled: bool) {
    CLUSTER_MODE.store(enabled, Ordering::SeqCst);
}

const DEFAULT_HOST_AND_PORT: &str = "127.0.0.1:5210";

lazy_static! {
    static ref HOST_AND_PORT: RwLock<String> = RwLock::new(DEFAULT_HOST_AND_PORT.to_string());
}

/// Address under which this node is known to the status table.
pub fn host_and_port() -> String {
    HOST_AND_PORT
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .clone()
}

pub fn set_host_and_port(address: impl Into<String>) {
    let mut guard = HOST_AND_PORT.write().unwrap_or_else(|err| err.into_inner());
    *guard = address.into();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_and_port_default_and_override() {
        assert!(!host_and_port().is_empty());
        set_host_and_port("10.0.0.1:9000");
        assert_eq!(host_and_port(), "10.0.0.1:9000");
        set_host_and_port(DEFAULT_HOST_AND_PORT);
    }
}
