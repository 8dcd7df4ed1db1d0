use std::collections::HashMap;
use std::sync::RwLock;

use log::debug;

use crate::connection::Session;
use crate::core::{DbError, Result};
use crate::transaction::LocalTransaction;

/// The distributed transaction status table's call contract. Its own
/// replication/consensus mechanism is external to this crate.
pub trait TransactionStatusTable: Send + Sync {
    /// Record a distributed commit decision.
    fn commit(&self, t: &LocalTransaction, all_local_transaction_names: &str) -> Result<()>;

    /// Whether `transaction_id`'s writes should be visible to `current`.
    fn is_valid(
        &self,
        session: &dyn Session,
        host_and_port: &str,
        transaction_id: u32,
        current: &LocalTransaction,
    ) -> bool;

    /// Whether a commit decision has been recorded for `transaction_id`.
    fn is_committed(&self, transaction_id: u32) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub commit_timestamp: u32,
    pub all_local_transaction_names: String,
}

/// Single-node status table keeping commit decisions in memory. The real
/// cluster-backed table lives outside this crate; this one backs local
/// deployments and tests.
#[derive(Default)]
pub struct LocalTransactionStatusTable {
    records: RwLock<HashMap<u32, CommitRecord>>,
}

impl LocalTransactionStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, transaction_id: u32) -> Option<CommitRecord> {
        self.records
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(&transaction_id)
            .cloned()
    }
}

impl TransactionStatusTable for LocalTransactionStatusTable {
    fn commit(&self, t: &LocalTransaction, all_local_transaction_names: &str) -> Result<()> {
        let commit_timestamp = t.commit_timestamp().ok_or_else(|| {
            DbError::IllegalState(format!(
                "Transaction {} has no commit timestamp",
                t.id()
            ))
        })?;
        debug!(
            "recording commit of transaction {} at timestamp {}",
            t.id(),
            commit_timestamp
        );
        let mut records = self.records.write()?;
        records.insert(
            t.id(),
            CommitRecord {
                commit_timestamp,
                all_local_transaction_names: all_local_transaction_names.to_string(),
            },
        );
        Ok(())
    }

    fn is_valid(
        &self,
        _session: &dyn Session,
        _host_and_port: &str,
        transaction_id: u32,
        current: &LocalTransaction,
    ) -> bool {
        // a transaction always sees its own writes
        transaction_id == current.id() || self.is_committed(transaction_id)
    }

    fn is_committed(&self, transaction_id: u32) -> bool {
        self.records
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .contains_key(&transaction_id)
    }
}
