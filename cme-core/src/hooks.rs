//! Change listeners
//!
//! Two registries hang off the engine:
//! - commit: fired when a transaction is finalized
//! - pack-received: fired after a push arrives over smart HTTP
//!
//! A broadcast runs every listener registered for the record's type on its
//! own task and waits for all of them. A listener that panics is logged and
//! does not disturb the others.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::{Arc, RwLock};

use crate::types::{ChangeRecord, ObjectType};

/// Something that wants to hear about changes to one object type.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_change(&self, record: &ChangeRecord);
}

/// Adapter turning a plain closure into a [`ChangeListener`].
pub struct FnListener<F>(F);

#[async_trait]
impl<F> ChangeListener for FnListener<F>
where
    F: Fn(&ChangeRecord) + Send + Sync,
{
    async fn on_change(&self, record: &ChangeRecord) {
        (self.0)(record)
    }
}

/// Wrap a synchronous closure as a listener.
pub fn listener_fn<F>(f: F) -> Arc<dyn ChangeListener>
where
    F: Fn(&ChangeRecord) + Send + Sync + 'static,
{
    Arc::new(FnListener(f))
}

/// Listeners keyed by object type, in registration order.
pub struct ListenerRegistry {
    name: &'static str,
    listeners: RwLock<Vec<(ObjectType, Arc<dyn ChangeListener>)>>,
}

impl ListenerRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, object_type: ObjectType, listener: Arc<dyn ChangeListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push((object_type, listener));
        tracing::debug!("Registered {} listener for {}", self.name, object_type);
    }

    /// Number of listeners registered for `object_type`.
    pub fn count(&self, object_type: ObjectType) -> usize {
        self.matching(object_type).len()
    }

    fn matching(&self, object_type: ObjectType) -> Vec<Arc<dyn ChangeListener>> {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners
            .iter()
            .filter(|(t, _)| *t == object_type)
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    /// Run every listener for the record's type concurrently and wait for
    /// all of them. Returns how many completed without panicking.
    pub async fn broadcast(&self, record: &ChangeRecord) -> usize {
        let listeners = self.matching(record.object_type);
        if listeners.is_empty() {
            return 0;
        }
        tracing::debug!(
            "Notifying {} {} listener(s) for {}",
            listeners.len(),
            self.name,
            record.object_type
        );

        let tasks = listeners.into_iter().map(|listener| {
            let record = record.clone();
            tokio::spawn(async move { listener.on_change(&record).await })
        });

        let mut completed = 0;
        for result in join_all(tasks).await {
            match result {
                Ok(()) => completed += 1,
                Err(e) if e.is_panic() => {
                    tracing::error!(
                        "A {} listener for {} panicked",
                        self.name,
                        record.object_type
                    );
                }
                Err(e) => {
                    tracing::warn!("A {} listener was cancelled: {}", self.name, e);
                }
            }
        }
        completed
    }
}
