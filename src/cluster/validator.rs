use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::debug;
use tracing::{Level, event, info_span};

use crate::cluster::status_table::TransactionStatusTable;
use crate::core::{DbError, Result};
use crate::transaction::TransactionEngine;

/// Asynchronous validation request for a distributed transaction. Carries
/// everything the validator needs to resolve the transaction later,
/// including a handle back to the engine whose undo entries it must purge.
pub struct ValidationRequest {
    pub database: String,
    pub engine: Arc<TransactionEngine>,
    pub transaction_id: u32,
    pub properties: serde_json::Value,
    pub all_local_transaction_names: String,
}

/// The external validator's call contract: a non-blocking hand-off. The
/// commit path never waits for the outcome; resolution arrives out-of-band
/// as a `commit_after_validate` (or an operator-driven rollback).
pub trait TransactionValidator: Send + Sync {
    fn enqueue(&self, request: ValidationRequest);
}

/// Drops every request. Local-only deployments use this; distributed undo
/// entries then persist until an explicit `commit_after_validate`.
pub struct NoopTransactionValidator;

impl TransactionValidator for NoopTransactionValidator {
    fn enqueue(&self, request: ValidationRequest) {
        debug!(
            "no validator configured, dropping request for transaction {}",
            request.transaction_id
        );
    }
}

enum WorkerMessage {
    Validate(ValidationRequest),
    Shutdown,
}

/// Background worker resolving distributed transactions against a status
/// table. Requests are processed in order on a dedicated thread; `stop`
/// drains the queue and joins the thread.
pub struct ValidationWorker {
    sender: Sender<WorkerMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ValidationWorker {
    pub fn start(status_table: Arc<dyn TransactionStatusTable>) -> Result<Self> {
        let (sender, receiver) = channel();
        let handle = std::thread::Builder::new()
            .name("transaction-validator".to_string())
            .spawn(move || {
                let span = info_span!("transaction_validator");
                let _entered = span.enter();
                while let Ok(message) = receiver.recv() {
                    match message {
                        WorkerMessage::Shutdown => break,
                        WorkerMessage::Validate(request) => {
                            Self::validate(status_table.as_ref(), request);
                        }
                    }
                }
            })
            .map_err(|err| DbError::IoError(format!("failed to spawn validator: {}", err)))?;
        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn validate(status_table: &dyn TransactionStatusTable, request: ValidationRequest) {
        event!(
            Level::DEBUG,
            transaction_id = request.transaction_id,
            database = %request.database,
            "validating distributed transaction"
        );
        if status_table.is_committed(request.transaction_id) {
            if let Err(err) = request.engine.commit_after_validate(request.transaction_id) {
                event!(
                    Level::WARN,
                    transaction_id = request.transaction_id,
                    error = %err,
                    "deferred undo purge failed"
                );
            }
        } else {
            // no commit decision yet; the entries stay until one arrives
            event!(
                Level::WARN,
                transaction_id = request.transaction_id,
                "no commit decision recorded, leaving undo entries in place"
            );
        }
    }

    /// Process everything already queued, then stop the worker thread.
    pub fn stop(&self) -> Result<()> {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        let handle = self.handle.lock()?.take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| DbError::IllegalState("validation worker panicked".to_string()))?;
        }
        Ok(())
    }
}

impl TransactionValidator for ValidationWorker {
    fn enqueue(&self, request: ValidationRequest) {
        if self.sender.send(WorkerMessage::Validate(request)).is_err() {
            debug!("validation worker already stopped, dropping request");
        }
    }
}

impl Drop for ValidationWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
    }
}
