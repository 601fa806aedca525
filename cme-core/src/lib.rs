//! Change Management Engine core
//!
//! Versioned storage for devices, policies, queries, reports and the
//! ontology, each kept in its own git repository below a storage root:
//! - Object versioning with per-object history, diff and metadata
//! - Transactions staged on branches and finalized by replication
//! - Pull/push replication against upstream nodes
//! - Listener fan-out for commits and received packs
//! - Background reconciliation of branches and transactions

pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod meta;
pub mod ontology;
pub mod reconciler;
pub mod repo;
pub mod runner;
pub mod transaction;
pub mod types;
pub mod versioning;

pub use config::{Config, EngineConfig, ReconcilerConfig};
pub use engine::Engine;
pub use error::{CmeError, Result};
pub use hooks::{ChangeListener, ListenerRegistry, listener_fn};
pub use meta::Metadata;
pub use reconciler::{CleanReport, Reconciler, ReconcilerHandle};
pub use repo::{MASTER, RepoLock, RepoManager};
pub use runner::{CommandOutput, CommandRunner};
pub use transaction::{Transaction, TransactionStatus, TransactionTable};
pub use types::{
    Author, ChangeRecord, LogEntry, ObjectContent, ObjectType, Upstream, UpstreamNode,
};
pub use versioning::{DEFAULT_MESSAGE, push_url};
