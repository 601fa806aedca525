//! The change management engine
//!
//! Owns the storage root, the per-type repositories, the transaction table
//! and the listener registries. Operations are spread over sibling modules
//! as further `impl Engine` blocks.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::EngineConfig;
use crate::error::{CmeError, Result};
use crate::hooks::{ChangeListener, ListenerRegistry};
use crate::repo::{RepoManager, ensure_root};
use crate::runner::CommandRunner;
use crate::transaction::TransactionTable;
use crate::types::{ChangeRecord, ObjectType};

pub struct Engine {
    config: EngineConfig,
    repos: RepoManager,
    transactions: Arc<TransactionTable>,
    commit_listeners: ListenerRegistry,
    pack_listeners: ListenerRegistry,
    closed: AtomicBool,
}

impl Engine {
    /// Validate the configuration and create the storage root if missing.
    /// Repositories themselves are created lazily on first use.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_transactions(config, Arc::new(TransactionTable::new()))
    }

    /// Like [`Engine::new`] but sharing an existing transaction table.
    pub fn with_transactions(
        config: EngineConfig,
        transactions: Arc<TransactionTable>,
    ) -> Result<Self> {
        config.validate()?;
        ensure_root(&config.repo_path)?;

        let runner = CommandRunner::new(&config.bin_path);
        tracing::info!(
            "Change management engine rooted at {:?} using {:?}",
            config.repo_path,
            config.bin_path
        );

        Ok(Self {
            repos: RepoManager::new(&config.repo_path, runner),
            config,
            transactions,
            commit_listeners: ListenerRegistry::new("commit"),
            pack_listeners: ListenerRegistry::new("pack-received"),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repos(&self) -> &RepoManager {
        &self.repos
    }

    pub fn transactions(&self) -> &Arc<TransactionTable> {
        &self.transactions
    }

    /// Refuse every further operation with [`CmeError::NotInitialized`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Change management engine closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CmeError::NotInitialized);
        }
        Ok(())
    }

    /// Create and initialize the type's repository if needed.
    pub async fn ensure_repo(&self, object_type: ObjectType) -> Result<PathBuf> {
        self.check_open()?;
        let lock = self.repos.lock(object_type).await;
        self.repos.ensure_repo(&lock).await
    }

    /// Directory of the type's repository; [`CmeError::NoRepo`] if absent.
    pub fn repo_dir(&self, object_type: ObjectType) -> Result<PathBuf> {
        self.check_open()?;
        self.repos.repo_dir(object_type)
    }

    /// Discard uncommitted changes. A repository that does not exist yet has
    /// nothing to reset.
    pub async fn reset(&self, object_type: ObjectType) -> Result<()> {
        self.check_open()?;
        let lock = self.repos.lock(object_type).await;
        if !self.repos.is_initialized(object_type).await {
            tracing::debug!("No {} repository to reset", object_type);
            return Ok(());
        }
        self.repos.reset(&lock).await
    }

    /// Id of the newest commit on master.
    pub async fn latest_commit_id(&self, object_type: ObjectType) -> Result<String> {
        self.check_open()?;
        let lock = self.repos.lock(object_type).await;
        self.repos.repo_dir(object_type)?;
        self.repos
            .git(&lock, &["rev-parse", "refs/heads/master"])
            .await
            .map(|s| s.trim().to_string())
    }

    /// Branches other than master in the type's repository.
    pub async fn branches(&self, object_type: ObjectType) -> Result<Vec<String>> {
        self.check_open()?;
        let lock = self.repos.lock(object_type).await;
        self.repos.repo_dir(object_type)?;
        self.repos.branches(&lock).await
    }

    pub async fn has_branch(&self, object_type: ObjectType, branch: &str) -> Result<bool> {
        Ok(self.branches(object_type).await?.iter().any(|b| b == branch))
    }

    /// Register a listener fired when a transaction on `object_type` is
    /// finalized.
    pub fn register_commit_listener(
        &self,
        object_type: ObjectType,
        listener: Arc<dyn ChangeListener>,
    ) {
        self.commit_listeners.register(object_type, listener);
    }

    /// Register a listener fired after a pack is received over HTTP for
    /// `object_type`.
    pub fn register_pack_listener(&self, object_type: ObjectType, listener: Arc<dyn ChangeListener>) {
        self.pack_listeners.register(object_type, listener);
    }

    pub(crate) async fn notify_commit(&self, record: &ChangeRecord) {
        self.commit_listeners.broadcast(record).await;
    }

    /// Fan a received-pack event out to the registered listeners. Returns once
    /// every listener has finished.
    pub async fn notify_pack_received(&self, record: &ChangeRecord) {
        self.pack_listeners.broadcast(record).await;
    }
}
