//! Transactions
//!
//! A transaction is a branch named after its id holding a tentative change.
//! The table tracks each id's lifecycle:
//!
//! ```text
//! INITIALIZING -> ACTIVE -> COMPLETE -> CLEANED (removed by the sweeper)
//!              \-> FAILED -------------^
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{CmeError, Result};
use crate::types::{ChangeRecord, ObjectType, validate_branch_name, validate_name};

/// Attempts at drawing an unused random id before giving up.
const ID_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Initializing,
    Active,
    Complete,
    Failed,
    Cleaned,
}

impl TransactionStatus {
    /// Whether the sweeper may reap the transaction.
    pub fn is_finished(self) -> bool {
        matches!(self, TransactionStatus::Complete | TransactionStatus::Failed)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Initializing => "INITIALIZING",
            TransactionStatus::Active => "ACTIVE",
            TransactionStatus::Complete => "COMPLETE",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Cleaned => "CLEANED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub status: TransactionStatus,
    pub object_type: ObjectType,
}

impl Transaction {
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            status: TransactionStatus::Initializing,
            object_type,
        }
    }
}

/// In-memory table of live transactions, shared by the engine, the HTTP
/// front end and the reconciler.
#[derive(Debug, Default)]
pub struct TransactionTable {
    entries: RwLock<HashMap<String, Transaction>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` unless it is already present.
    pub async fn try_insert(&self, id: &str, transaction: Transaction) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(id) {
            return false;
        }
        entries.insert(id.to_string(), transaction);
        true
    }

    /// Draw ids from `generate` until one is free and claim it.
    pub async fn reserve<G>(&self, object_type: ObjectType, attempts: usize, mut generate: G) -> Result<String>
    where
        G: FnMut() -> String,
    {
        let mut entries = self.entries.write().await;
        for _ in 0..attempts {
            let id = generate();
            if !entries.contains_key(&id) {
                entries.insert(id.clone(), Transaction::new(object_type));
                return Ok(id);
            }
            tracing::debug!("Transaction id {} already taken", id);
        }
        Err(CmeError::IdCollision)
    }

    pub async fn get(&self, id: &str) -> Option<Transaction> {
        self.entries.read().await.get(id).copied()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Returns false if `id` is unknown.
    pub async fn set_status(&self, id: &str, status: TransactionStatus) -> bool {
        match self.entries.write().await.get_mut(id) {
            Some(t) => {
                t.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &str) -> Option<Transaction> {
        self.entries.write().await.remove(id)
    }

    /// Copy of every entry, for scans that must not hold the table.
    pub async fn snapshot(&self) -> Vec<(String, Transaction)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, t)| (id.clone(), *t))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn new_transaction_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Engine {
    /// Open a transaction: claim an id (the record's own, or a fresh random
    /// one), create a branch named after it and commit the record's files
    /// there. Returns the transaction id.
    pub async fn begin_transaction(&self, record: &ChangeRecord, message: &str) -> Result<String> {
        self.check_open()?;
        let object_type = record.object_type;

        let id = match record.transaction_id.as_deref().filter(|s| !s.is_empty()) {
            Some(id) => {
                validate_name(id)?;
                validate_branch_name(id)?;
                if !self
                    .transactions()
                    .try_insert(id, Transaction::new(object_type))
                    .await
                {
                    return Err(CmeError::TransactionConflict(id.to_string()));
                }
                id.to_string()
            }
            None => {
                self.transactions()
                    .reserve(object_type, ID_ATTEMPTS, new_transaction_id)
                    .await?
            }
        };

        match self.open_branch(record, message, &id).await {
            Ok(commit) => {
                self.transactions()
                    .set_status(&id, TransactionStatus::Active)
                    .await;
                tracing::info!("Transaction {} on {} active at {:?}", id, object_type, commit);
                Ok(id)
            }
            Err(e) => {
                self.transactions()
                    .set_status(&id, TransactionStatus::Failed)
                    .await;
                tracing::warn!("Transaction {} on {} failed: {}", id, object_type, e);
                Err(e)
            }
        }
    }

    async fn open_branch(&self, record: &ChangeRecord, message: &str, id: &str) -> Result<String> {
        {
            let lock = self.repos().lock(record.object_type).await;
            self.repos().ensure_repo(&lock).await?;
            self.repos().restore(&lock).await?;
            if let Err(e) = self.repos().create_branch(&lock, id).await {
                tracing::warn!("Creating branch {}: {}", id, e);
                return Err(CmeError::TransactionBranch(id.to_string()));
            }
        }

        let mut record = record.clone();
        record.transaction_id = Some(id.to_string());
        self.version_object(&record, message, Some(id)).await
    }

    /// Mark the record's transaction COMPLETE and notify commit listeners.
    pub async fn finalize_transaction(&self, record: &ChangeRecord) -> Result<()> {
        self.finalize_transaction_with(record, TransactionStatus::Complete)
            .await
    }

    /// Mark the record's transaction with `status` and notify commit
    /// listeners. Listeners fire even for an unknown id, which is then
    /// reported as [`CmeError::UnknownTransaction`].
    pub async fn finalize_transaction_with(
        &self,
        record: &ChangeRecord,
        status: TransactionStatus,
    ) -> Result<()> {
        self.check_open()?;
        let id = record.transaction_id.clone().unwrap_or_default();
        let known = self.transactions().set_status(&id, status).await;
        if known {
            tracing::info!("Transaction {} on {} is {}", id, record.object_type, status);
        }

        self.notify_commit(record).await;

        if !known {
            return Err(CmeError::UnknownTransaction(id));
        }
        Ok(())
    }

    /// Current status of a transaction, if known.
    pub async fn transaction_status(&self, id: &str) -> Option<TransactionStatus> {
        self.transactions().get(id).await.map(|t| t.status)
    }
}
