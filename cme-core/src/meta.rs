//! Device metadata
//!
//! A flat string map per device stored as JSON at
//! `DEVICE/<device>/meta/meta.db` and versioned like everything else.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::engine::Engine;
use crate::error::{CmeError, Result};
use crate::repo::RepoLock;
use crate::types::{ObjectType, validate_object_name};

pub type Metadata = BTreeMap<String, String>;

const META_DIR: &str = "meta";
const META_FILE: &str = "meta.db";
const META_MESSAGE: &str = "updated metadata";

fn meta_rel(device: &str) -> String {
    format!("{}/{}/{}", device, META_DIR, META_FILE)
}

impl Engine {
    /// The whole metadata map of a device, created empty if absent.
    pub async fn load_meta(&self, device: &str) -> Result<Metadata> {
        self.check_open()?;
        validate_object_name(device)?;
        let lock = self.repos().lock(ObjectType::Device).await;
        self.repos().ensure_repo(&lock).await?;
        self.repos().restore(&lock).await?;
        self.load_meta_locked(&lock, device).await
    }

    /// One metadata value.
    pub async fn get_meta(&self, device: &str, key: &str) -> Result<String> {
        let meta = self.load_meta(device).await?;
        meta.get(key)
            .cloned()
            .ok_or_else(|| CmeError::MetaKeyNotFound(key.to_string()))
    }

    /// Set one key and commit if the value changed.
    pub async fn version_meta(&self, device: &str, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.update_meta(device, move |meta| {
            meta.insert(key, value);
        })
        .await
    }

    /// Replace the whole map of a device.
    pub async fn save_meta(&self, device: &str, meta: Metadata) -> Result<()> {
        self.update_meta(device, move |current| *current = meta).await
    }

    /// Remove one key and commit if it was present.
    pub async fn delete_meta(&self, device: &str, key: &str) -> Result<()> {
        self.update_meta(device, |meta| {
            meta.remove(key);
        })
        .await
    }

    async fn update_meta<F>(&self, device: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Metadata),
    {
        self.check_open()?;
        validate_object_name(device)?;
        let lock = self.repos().lock(ObjectType::Device).await;
        self.repos().ensure_repo(&lock).await?;
        self.repos().restore(&lock).await?;

        let result: Result<Option<String>> = async {
            let mut meta = self.load_meta_locked(&lock, device).await?;
            mutate(&mut meta);
            self.save_meta_locked(&lock, device, &meta).await?;
            self.repos()
                .git(&lock, &["add", "--", &meta_rel(device)])
                .await?;
            self.repos().commit_if_dirty(&lock, META_MESSAGE, None).await
        }
        .await;

        match result {
            Ok(id) => {
                if let Some(id) = id {
                    tracing::debug!("Metadata of {} committed as {}", device, id);
                }
                Ok(())
            }
            Err(e) => {
                self.repos().restore_quietly(&lock).await;
                Err(e)
            }
        }
    }

    fn meta_path(&self, device: &str) -> Result<PathBuf> {
        let dir = self.repos().repo_dir(ObjectType::Device)?;
        Ok(dir.join(device).join(META_DIR).join(META_FILE))
    }

    async fn load_meta_locked(&self, lock: &RepoLock, device: &str) -> Result<Metadata> {
        let path = self.meta_path(device)?;
        if !path.exists() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, "{}").await?;
            self.repos()
                .git(lock, &["add", "--", &meta_rel(device)])
                .await?;
            self.repos().commit_if_dirty(lock, META_MESSAGE, None).await?;
            return Ok(Metadata::new());
        }

        let text = tokio::fs::read_to_string(&path).await?;
        if text.trim().is_empty() {
            return Ok(Metadata::new());
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn save_meta_locked(&self, _lock: &RepoLock, device: &str, meta: &Metadata) -> Result<()> {
        let path = self.meta_path(device)?;
        let text = serde_json::to_string_pretty(meta)?;
        tokio::fs::write(&path, text).await?;
        Ok(())
    }
}
