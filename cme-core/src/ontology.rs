//! Ontology document
//!
//! A single text blob at `ONTOLOGY/ontology`.

use crate::engine::Engine;
use crate::error::Result;
use crate::types::{Author, ObjectType};

const ONTOLOGY_FILE: &str = "ontology";

impl Engine {
    /// Current ontology text; an empty document is created and committed on
    /// first access.
    pub async fn load_ontology(&self) -> Result<String> {
        self.check_open()?;
        let lock = self.repos().lock(ObjectType::Ontology).await;
        let dir = self.repos().ensure_repo(&lock).await?;
        self.repos().restore(&lock).await?;

        let path = dir.join(ONTOLOGY_FILE);
        if path.exists() {
            return Ok(tokio::fs::read_to_string(&path).await?);
        }

        let created: Result<Option<String>> = async {
            tokio::fs::write(&path, "").await?;
            self.repos()
                .git(&lock, &["add", "--", ONTOLOGY_FILE])
                .await?;
            self.repos()
                .commit_if_dirty(&lock, "Created ontology", None)
                .await
        }
        .await;
        if let Err(e) = created {
            self.repos().restore_quietly(&lock).await;
            return Err(e);
        }
        Ok(String::new())
    }

    /// Replace the ontology text. Returns the commit id, or an empty string
    /// when the text was unchanged.
    pub async fn save_ontology(&self, text: &str, author: &Author) -> Result<String> {
        self.check_open()?;
        let lock = self.repos().lock(ObjectType::Ontology).await;
        let dir = self.repos().ensure_repo(&lock).await?;
        self.repos().restore(&lock).await?;

        let saved: Result<Option<String>> = async {
            tokio::fs::write(dir.join(ONTOLOGY_FILE), text).await?;
            self.repos()
                .git(&lock, &["add", "--", ONTOLOGY_FILE])
                .await?;
            self.repos()
                .commit_if_dirty(&lock, "Updated ontology", Some(author))
                .await
        }
        .await;
        match saved {
            Ok(id) => Ok(id.unwrap_or_default()),
            Err(e) => {
                self.repos().restore_quietly(&lock).await;
                Err(e)
            }
        }
    }
}
