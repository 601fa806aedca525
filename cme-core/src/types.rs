//! Data model shared by every engine component

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{CmeError, Result};

/// Committer identity configured in every repository.
pub const ENGINE_NAME: &str = "Change Management Engine";
pub const ENGINE_EMAIL: &str = "ignore@ignore";

/// Category of versioned object. Each type owns one independent repository
/// rooted at `<root>/<TYPE>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectType {
    /// A device
    Device,
    /// A policy
    Policy,
    /// A report definition
    Query,
    /// The results of running a report
    Report,
    /// Ontology stub later combined with policy
    Ontology,
}

impl ObjectType {
    pub const ALL: [ObjectType; 5] = [
        ObjectType::Device,
        ObjectType::Policy,
        ObjectType::Query,
        ObjectType::Report,
        ObjectType::Ontology,
    ];

    /// Directory name of the type's repository.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Device => "DEVICE",
            ObjectType::Policy => "POLICY",
            ObjectType::Query => "QUERY",
            ObjectType::Report => "REPORT",
            ObjectType::Ontology => "ONTOLOGY",
        }
    }

    /// Lowercase name used in HTTP paths (`/device/cme/...`).
    pub fn url_segment(&self) -> &'static str {
        match self {
            ObjectType::Device => "device",
            ObjectType::Policy => "policy",
            ObjectType::Query => "query",
            ObjectType::Report => "report",
            ObjectType::Ontology => "ontology",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = CmeError;

    fn from_str(s: &str) -> Result<Self> {
        ObjectType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CmeError::generic(format!("Unknown object type: {}", s)))
    }
}

/// Identity attached to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
    pub when: DateTime<Utc>,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            when: Utc::now(),
        }
    }

    /// `Name <email>` as accepted by `--author`.
    pub fn signature(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }
}

impl Default for Author {
    fn default() -> Self {
        Author::new(ENGINE_NAME, ENGINE_EMAIL)
    }
}

/// A named object: a set of named byte payloads written and committed together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectContent {
    pub object: String,
    #[serde(with = "base64_files")]
    pub files: BTreeMap<String, Vec<u8>>,
}

impl ObjectContent {
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            files: BTreeMap::new(),
        }
    }

    /// Builder-style helper to add one file.
    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), data.into());
        self
    }
}

/// Payloads travel as standard base64 so arbitrary bytes survive JSON.
mod base64_files {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        files: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&String, String> = files
            .iter()
            .map(|(name, data)| (name, STANDARD.encode(data)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, data)| {
                STANDARD
                    .decode(data.as_bytes())
                    .map(|bytes| (name, bytes))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

/// One commit as reported by the backend log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub id: String,
    pub message: String,
    pub author: String,
    pub author_email: String,
    pub committer: String,
    pub committer_email: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::<{}> Author: {} <{}> Signed off by: {} <{}> {}",
            self.time.to_rfc3339(),
            self.id,
            self.author,
            self.author_email,
            self.committer,
            self.committer_email,
            self.message
        )
    }
}

/// The unit of work passed into versioning operations and listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub object_type: ObjectType,
    pub content: ObjectContent,
    pub author: Author,
    /// Commit produced by the change; empty when nothing changed.
    pub commit_id: String,
    pub transaction_id: Option<String>,
    pub src_node: Option<String>,
    pub log: Option<LogEntry>,
}

impl ChangeRecord {
    pub fn new(object_type: ObjectType, content: ObjectContent, author: Author) -> Self {
        Self {
            object_type,
            content,
            author,
            commit_id: String::new(),
            transaction_id: None,
            src_node: None,
            log: None,
        }
    }

    /// A record that only identifies a type, as produced by an inbound push.
    pub fn for_type(object_type: ObjectType) -> Self {
        Self::new(object_type, ObjectContent::default(), Author::default())
    }

    pub fn with_transaction(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn with_src_node(mut self, node: impl Into<String>) -> Self {
        self.src_node = Some(node.into());
        self
    }
}

/// A replication peer this node pushes to and pulls from.
pub trait Upstream: Send + Sync {
    /// Host (ip or ip:port) of the peer.
    fn host(&self) -> &str;
    /// Transaction to finalize on the peer once the push lands.
    fn transaction(&self) -> Option<&str>;
}

/// Plain [`Upstream`] implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamNode {
    pub host: String,
    pub transaction: Option<String>,
}

impl UpstreamNode {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            transaction: None,
        }
    }
}

impl Upstream for UpstreamNode {
    fn host(&self) -> &str {
        &self.host
    }

    fn transaction(&self) -> Option<&str> {
        self.transaction.as_deref()
    }
}

/// Object and file names become single path components inside a repository.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(CmeError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Branch names and transaction ids must be valid branch refs, following
/// `git check-ref-format --branch`, and must never read as an option.
pub(crate) fn validate_branch_name(name: &str) -> Result<()> {
    let bad_char = |c: char| c.is_ascii_control() || " ~^:?*[\\".contains(c);
    let bad = name.is_empty()
        || name == "@"
        || name.starts_with('-')
        || name.starts_with('/')
        || name.ends_with('/')
        || name.ends_with('.')
        || name.ends_with(".lock")
        || name.contains("..")
        || name.contains("//")
        || name.contains("@{")
        || name.contains(bad_char)
        || name.split('/').any(|part| part.starts_with('.') || part.ends_with(".lock"));
    if bad {
        return Err(CmeError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Revisions handed to `diff` must not read as options.
pub(crate) fn validate_revision(rev: &str) -> Result<()> {
    if rev.is_empty() || rev.starts_with('-') || rev.contains(char::is_whitespace) {
        return Err(CmeError::InvalidName(rev.to_string()));
    }
    Ok(())
}

/// `README` is seeded at the repository root and never listed as an object.
pub(crate) fn validate_object_name(name: &str) -> Result<()> {
    validate_name(name)?;
    if name == "README" {
        return Err(CmeError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_names() {
        assert_eq!(ObjectType::Device.to_string(), "DEVICE");
        assert_eq!(ObjectType::Policy.url_segment(), "policy");
        assert_eq!("report".parse::<ObjectType>().unwrap(), ObjectType::Report);
        assert_eq!("ONTOLOGY".parse::<ObjectType>().unwrap(), ObjectType::Ontology);
        assert!("NONE".parse::<ObjectType>().is_err());
    }

    #[test]
    fn test_content_json_roundtrip_binary() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let content = ObjectContent::new("sw1")
            .with_file("blob.bin", payload.clone())
            .with_file("url", b"http://host/a%20b?x=1&y=%zz".to_vec());

        let json = serde_json::to_string(&content).unwrap();
        let back: ObjectContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
        assert_eq!(back.files["blob.bin"], payload);
    }

    #[test]
    fn test_content_rejects_bad_base64() {
        let json = r#"{"object":"sw1","files":{"a":"not base64!"}}"#;
        assert!(serde_json::from_str::<ObjectContent>(json).is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("sw1").is_ok());
        assert!(validate_name("config.txt").is_ok());
        for bad in ["", ".git", "..", "a/b"] {
            assert!(matches!(validate_name(bad), Err(CmeError::InvalidName(_))), "{}", bad);
        }
        assert!(validate_name("README").is_ok());
        assert!(validate_object_name("README").is_err());
    }

    #[test]
    fn test_validate_branch_name() {
        for good in ["master", "abc123", "feature/x", "0f3a9c", "v1.2"] {
            assert!(validate_branch_name(good).is_ok(), "{}", good);
        }
        for bad in [
            "", "-x", "--orphan=sneaky", "a..b", "a b", "a~1", "x^", "a:b", "a?", "a*", "a[b",
            "a\\b", "/a", "a/", "a//b", "a.", "a.lock", ".hidden", "x/.y", "@", "a@{1}",
        ] {
            assert!(
                matches!(validate_branch_name(bad), Err(CmeError::InvalidName(_))),
                "{:?}",
                bad
            );
        }
    }

    #[test]
    fn test_validate_revision() {
        assert!(validate_revision("HEAD~1").is_ok());
        assert!(validate_revision("deadbeef").is_ok());
        assert!(validate_revision("--output=/tmp/x").is_err());
        assert!(validate_revision("-p").is_err());
        assert!(validate_revision("").is_err());
    }

    #[test]
    fn test_author_signature() {
        let author = Author::new("Larry Bird", "tootall@celtics.net");
        assert_eq!(author.signature(), "Larry Bird <tootall@celtics.net>");
        assert_eq!(Author::default().name, ENGINE_NAME);
    }
}
