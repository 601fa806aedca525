//! Background reconciliation
//!
//! Three periodic loops keep repositories and the transaction table in step:
//! - device poller: placeholder hook for device health checks
//! - sweeper: reaps finished transactions and their branches
//! - cleaner: mark-and-sweep between branches and table entries

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ReconcilerConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::transaction::TransactionStatus;
use crate::types::ObjectType;

/// What one cleaner pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    /// Table entries dropped because their branch is gone
    pub pruned: Vec<String>,
    /// Branches deleted because no table entry claims them
    pub collected: Vec<String>,
}

impl Engine {
    /// Device poller tick.
    pub async fn poll_devices(&self) {
        tracing::debug!(target: "cme::poller", "Polling devices");
    }

    /// Reap every COMPLETE or FAILED transaction: delete its branch and drop
    /// it from the table. Returns the reaped ids.
    pub async fn sweep_finished(&self) -> Vec<String> {
        if self.is_closed() {
            return Vec::new();
        }
        let mut reaped = Vec::new();
        for (id, transaction) in self.transactions().snapshot().await {
            if !transaction.status.is_finished() {
                continue;
            }
            if transaction.status == TransactionStatus::Failed {
                tracing::warn!(
                    target: "cme::sweeper",
                    "Reaping failed transaction {} on {}",
                    id,
                    transaction.object_type
                );
            } else {
                tracing::debug!(
                    target: "cme::sweeper",
                    "Reaping transaction {} on {}",
                    id,
                    transaction.object_type
                );
            }
            self.transactions()
                .set_status(&id, TransactionStatus::Cleaned)
                .await;

            {
                let lock = self.repos().lock(transaction.object_type).await;
                if self.repos().is_initialized(transaction.object_type).await {
                    let deleted: Result<()> = async {
                        self.repos().restore(&lock).await?;
                        self.repos().delete_branch(&lock, &id).await
                    }
                    .await;
                    if let Err(e) = deleted {
                        tracing::warn!(
                            target: "cme::sweeper",
                            "Deleting branch {}: {}",
                            id,
                            e
                        );
                    }
                }
            }

            self.transactions().remove(&id).await;
            reaped.push(id);
        }
        reaped
    }

    /// One mark-and-sweep pass over every initialized repository.
    pub async fn clean_branches(&self) -> CleanReport {
        let mut report = CleanReport::default();
        if self.is_closed() {
            return report;
        }
        for object_type in ObjectType::ALL {
            if !self.repos().is_initialized(object_type).await {
                continue;
            }
            if let Err(e) = self.clean_repository(object_type, &mut report).await {
                tracing::warn!(target: "cme::cleaner", "Cleaning {}: {}", object_type, e);
            }
        }
        report
    }

    async fn clean_repository(
        &self,
        object_type: ObjectType,
        report: &mut CleanReport,
    ) -> Result<()> {
        let lock = self.repos().lock(object_type).await;
        let branches = self.repos().branches(&lock).await?;

        // Entries whose branch has vanished. INITIALIZING entries may not
        // have created theirs yet.
        for (id, transaction) in self.transactions().snapshot().await {
            if transaction.object_type != object_type
                || transaction.status == TransactionStatus::Initializing
                || branches.contains(&id)
            {
                continue;
            }
            tracing::debug!(target: "cme::cleaner", "Pruning dead transaction {}", id);
            self.transactions().remove(&id).await;
            report.pruned.push(id);
        }

        let orphans: Vec<&String> = {
            let mut orphans = Vec::new();
            for branch in &branches {
                if !self.transactions().contains(branch).await {
                    orphans.push(branch);
                }
            }
            orphans
        };
        if orphans.is_empty() {
            return Ok(());
        }

        self.repos().restore(&lock).await?;
        for branch in orphans {
            tracing::debug!(
                target: "cme::cleaner",
                "Deleting orphan branch {} in {}",
                branch,
                object_type
            );
            self.repos().delete_branch(&lock, branch).await?;
            report.collected.push(branch.clone());
        }
        Ok(())
    }
}

/// Spawns the background loops.
pub struct Reconciler {
    engine: Arc<Engine>,
    config: ReconcilerConfig,
}

/// Running loops; stop them with [`ReconcilerHandle::shutdown`].
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Reconciler {
    pub fn new(engine: Arc<Engine>, config: ReconcilerConfig) -> Self {
        Self { engine, config }
    }

    pub fn start(self) -> ReconcilerHandle {
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(3);

        let engine = Arc::clone(&self.engine);
        tasks.push(spawn_periodic(
            "cme::poller",
            self.config.device_poll_interval(),
            rx.clone(),
            move || {
                let engine = Arc::clone(&engine);
                async move { engine.poll_devices().await }
            },
        ));

        let engine = Arc::clone(&self.engine);
        tasks.push(spawn_periodic(
            "cme::cleaner",
            self.config.clean_interval(),
            rx.clone(),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    let report = engine.clean_branches().await;
                    if report != CleanReport::default() {
                        tracing::info!(
                            target: "cme::cleaner",
                            "Pruned {} transaction(s), deleted {} branch(es)",
                            report.pruned.len(),
                            report.collected.len()
                        );
                    }
                }
            },
        ));

        let engine = Arc::clone(&self.engine);
        tasks.push(spawn_periodic(
            "cme::sweeper",
            self.config.sweep_interval(),
            rx,
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    let reaped = engine.sweep_finished().await;
                    if !reaped.is_empty() {
                        tracing::info!(target: "cme::sweeper", "Reaped {} transaction(s)", reaped.len());
                    }
                }
            },
        ));

        tracing::info!(
            "Reconciler started (poll {:?}, clean {:?}, sweep {:?})",
            self.config.device_poll_interval(),
            self.config.clean_interval(),
            self.config.sweep_interval()
        );
        ReconcilerHandle { shutdown, tasks }
    }
}

impl ReconcilerHandle {
    /// Signal every loop to stop and wait for them to exit. A pass already
    /// running is allowed to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Reconciler task ended abnormally: {}", e);
            }
        }
        tracing::info!("Reconciler stopped");
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the first pass runs one period in.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::debug!("{} loop exiting", name);
    })
}
