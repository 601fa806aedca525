//! Object versioning
//!
//! Objects live at `<TYPE>/<object>/data/<file>` (or `raw/` for raw
//! payloads). Every operation locks the type's repository, starts from a
//! clean master, and leaves master checked out again whether it succeeds or
//! not.

use std::collections::BTreeMap;
use std::path::Path;

use crate::engine::Engine;
use crate::error::{CmeError, Result};
use crate::repo::{MASTER, RepoLock};
use crate::types::{
    Author, ChangeRecord, LogEntry, ObjectContent, ObjectType, Upstream, validate_branch_name,
    validate_name, validate_object_name, validate_revision,
};

/// Commit message used when the caller supplies none.
pub const DEFAULT_MESSAGE: &str = "Automatically added by Change Management Engine";

/// `git log` format; fields are separated by the ASCII unit separator so
/// subjects and names may contain anything else.
const LOG_FORMAT: &str = "--pretty=format:%ct%x1f%H%x1f%s%x1f%an%x1f%ae%x1f%cn%x1f%ce";

/// Subdirectory of an object holding its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Area {
    Data,
    Raw,
}

impl Area {
    fn dir(self) -> &'static str {
        match self {
            Area::Data => "data",
            Area::Raw => "raw",
        }
    }
}

impl Engine {
    /// Write the record's files under `<object>/data/` and commit them on
    /// `branch` (master when `None`). Returns the new commit id, or an empty
    /// string if the files matched what was already committed.
    pub async fn version_object(
        &self,
        record: &ChangeRecord,
        message: &str,
        branch: Option<&str>,
    ) -> Result<String> {
        self.version_files(record, message, branch, Area::Data).await
    }

    /// Like [`Engine::version_object`] but stores under `<object>/raw/`.
    pub async fn version_raw(
        &self,
        record: &ChangeRecord,
        message: &str,
        branch: Option<&str>,
    ) -> Result<String> {
        self.version_files(record, message, branch, Area::Raw).await
    }

    async fn version_files(
        &self,
        record: &ChangeRecord,
        message: &str,
        branch: Option<&str>,
        area: Area,
    ) -> Result<String> {
        self.check_open()?;
        validate_object_name(&record.content.object)?;
        for name in record.content.files.keys() {
            validate_name(name)?;
        }
        let message = if message.is_empty() { DEFAULT_MESSAGE } else { message };
        let branch = branch.unwrap_or(MASTER);
        validate_branch_name(branch)?;

        let lock = self.repos().lock(record.object_type).await;
        self.repos().ensure_repo(&lock).await?;

        match self.write_and_commit(&lock, record, message, branch, area).await {
            Ok(Some(id)) => {
                if let Err(e) = self.repos().checkout(&lock, MASTER).await {
                    self.repos().restore_quietly(&lock).await;
                    return Err(e);
                }
                tracing::debug!(
                    "Versioned {} {} on {}: {}",
                    record.object_type,
                    record.content.object,
                    branch,
                    id
                );
                Ok(id)
            }
            Ok(None) => {
                tracing::debug!(
                    "{} {} unchanged, nothing committed",
                    record.object_type,
                    record.content.object
                );
                self.repos().restore(&lock).await?;
                Ok(String::new())
            }
            Err(e) => {
                self.repos().restore_quietly(&lock).await;
                Err(e)
            }
        }
    }

    async fn write_and_commit(
        &self,
        lock: &RepoLock,
        record: &ChangeRecord,
        message: &str,
        branch: &str,
        area: Area,
    ) -> Result<Option<String>> {
        let repos = self.repos();
        repos.reset(lock).await?;
        repos.checkout(lock, branch).await?;

        let object = &record.content.object;
        let dir = repos.repo_dir(record.object_type)?;
        let area_dir = dir.join(object).join(area.dir());
        tokio::fs::create_dir_all(&area_dir).await?;

        for (name, data) in &record.content.files {
            tokio::fs::write(area_dir.join(name), data).await?;
            let rel = format!("{}/{}/{}", object, area.dir(), name);
            repos.git(lock, &["add", "--", &rel]).await?;
        }

        repos
            .commit_if_dirty(lock, message, Some(&record.author))
            .await
    }

    /// Current files of an object plus the newest commit touching it.
    pub async fn get_object(&self, object_type: ObjectType, name: &str) -> Result<ChangeRecord> {
        self.read_files(object_type, name, Area::Data).await
    }

    /// Current raw files of an object.
    pub async fn get_raw_object(
        &self,
        object_type: ObjectType,
        name: &str,
    ) -> Result<ChangeRecord> {
        self.read_files(object_type, name, Area::Raw).await
    }

    async fn read_files(&self, object_type: ObjectType, name: &str, area: Area) -> Result<ChangeRecord> {
        self.check_open()?;
        validate_object_name(name)?;
        let lock = self.repos().lock(object_type).await;
        let dir = self.repos().repo_dir(object_type)?;
        self.repos().restore(&lock).await?;

        let area_dir = dir.join(name).join(area.dir());
        if !area_dir.is_dir() {
            return Err(CmeError::ObjectNotFound(name.to_string()));
        }
        let latest = self
            .log_locked(&lock, name, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CmeError::ObjectNotFound(name.to_string()))?;

        let mut files = BTreeMap::new();
        collect_files(&area_dir, &mut files)?;

        let author = Author {
            name: latest.author.clone(),
            email: latest.author_email.clone(),
            when: latest.time,
        };
        let content = ObjectContent {
            object: name.to_string(),
            files,
        };
        let mut record = ChangeRecord::new(object_type, content, author);
        record.commit_id = latest.id.clone();
        record.log = Some(latest);
        Ok(record)
    }

    /// Delete an object and commit the removal.
    pub async fn remove_object(
        &self,
        object_type: ObjectType,
        name: &str,
        author: &Author,
    ) -> Result<String> {
        self.check_open()?;
        validate_object_name(name)?;
        let message = format!("Removing {} from repository", name);
        self.commit_tree_change(object_type, &["rm", "-r", "-q", "--", name], &message, author)
            .await
    }

    /// Move an object to a new name and commit the move.
    pub async fn rename_object(
        &self,
        object_type: ObjectType,
        old_name: &str,
        new_name: &str,
        author: &Author,
    ) -> Result<String> {
        self.check_open()?;
        validate_object_name(old_name)?;
        validate_object_name(new_name)?;
        let message = format!("Moving {} to {} in the repository", old_name, new_name);
        self.commit_tree_change(object_type, &["mv", "--", old_name, new_name], &message, author)
            .await
    }

    async fn commit_tree_change(
        &self,
        object_type: ObjectType,
        args: &[&str],
        message: &str,
        author: &Author,
    ) -> Result<String> {
        let lock = self.repos().lock(object_type).await;
        self.repos().repo_dir(object_type)?;
        self.repos().restore(&lock).await?;

        let result: Result<String> = async {
            self.repos().git(&lock, args).await?;
            self.repos().commit(&lock, message, Some(author)).await
        }
        .await;
        if result.is_err() {
            self.repos().restore_quietly(&lock).await;
        }
        result
    }

    /// Names of every top-level entry on master except dotfiles and the
    /// README, sorted.
    pub async fn list_objects(&self, object_type: ObjectType) -> Result<Vec<String>> {
        self.check_open()?;
        let lock = self.repos().lock(object_type).await;
        let dir = self.repos().repo_dir(object_type)?;
        self.repos().restore(&lock).await?;

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name == "README" {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// History of `path` (the whole repository when empty), newest first.
    /// `limit` of zero means unlimited.
    pub async fn log(&self, object_type: ObjectType, path: &str, limit: usize) -> Result<Vec<LogEntry>> {
        self.check_open()?;
        let lock = self.repos().lock(object_type).await;
        self.repos().repo_dir(object_type)?;
        self.repos().restore(&lock).await?;
        self.log_locked(&lock, path, limit).await
    }

    pub(crate) async fn log_locked(
        &self,
        lock: &RepoLock,
        path: &str,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let limit_arg = format!("-{}", limit);
        let mut args = vec!["log", LOG_FORMAT];
        if limit > 0 {
            args.push(&limit_arg);
        }
        if !path.is_empty() {
            args.push("--");
            args.push(path);
        }
        let out = self.repos().git(lock, &args).await?;
        parse_log(&out)
    }

    /// Textual diff of `path` against zero, one or two revisions.
    pub async fn diff(&self, object_type: ObjectType, path: &str, revisions: &[&str]) -> Result<String> {
        self.check_open()?;
        if revisions.len() > 2 {
            return Err(CmeError::generic("Too many revisions to diff"));
        }
        for rev in revisions {
            validate_revision(rev)?;
        }
        let lock = self.repos().lock(object_type).await;
        self.repos().repo_dir(object_type)?;

        let mut commits = Vec::with_capacity(revisions.len());
        for rev in revisions {
            let commitish = format!("{}^{{commit}}", rev);
            let out = self
                .repos()
                .git_captured(&lock, &["rev-parse", "--verify", "-q", "--end-of-options", &commitish])
                .await?;
            if !out.success() {
                return Err(CmeError::InvalidName(rev.to_string()));
            }
            commits.push(out.stdout.trim().to_string());
        }

        let mut args = vec!["diff"];
        args.extend(commits.iter().map(String::as_str));
        if !path.is_empty() {
            args.push("--");
            args.push(path);
        }
        self.repos().git(&lock, &args).await
    }

    /// Merge master of the upstream's repository into local master.
    pub async fn pull(&self, object_type: ObjectType, upstream: &dyn Upstream) -> Result<()> {
        self.check_open()?;
        let lock = self.repos().lock(object_type).await;
        self.repos().ensure_repo(&lock).await?;
        self.pull_locked(&lock, upstream).await
    }

    /// Pull from the upstream, then push local master to it. The push URL
    /// names this node and the upstream's transaction when present so the
    /// receiving side can finalize it.
    pub async fn push(
        &self,
        object_type: ObjectType,
        upstream: &dyn Upstream,
        src_node: Option<&str>,
    ) -> Result<()> {
        self.check_open()?;
        let lock = self.repos().lock(object_type).await;
        self.repos().ensure_repo(&lock).await?;
        self.pull_locked(&lock, upstream).await?;

        let url = push_url(object_type, upstream.host(), src_node, upstream.transaction());
        tracing::info!("Pushing {} to {}", object_type, url);
        let out = self
            .repos()
            .git_captured(
                &lock,
                &["-c", "http.sslVerify=true", "push", "-q", &url, "master:master"],
            )
            .await?;
        if !out.success() {
            tracing::warn!("Push of {} to {} failed: {}", object_type, url, out.stderr.trim());
            return Err(CmeError::Communication {
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    async fn pull_locked(&self, lock: &RepoLock, upstream: &dyn Upstream) -> Result<()> {
        let object_type = lock.object_type();
        self.repos().restore(lock).await?;

        let url = push_url(object_type, upstream.host(), None, None);
        let verify = format!("http.sslVerify={}", self.config().pull_ssl_verify);
        tracing::info!("Pulling {} from {}", object_type, url);
        let out = self
            .repos()
            .git_captured(
                lock,
                &["-c", &verify, "pull", "-q", "--no-rebase", "--no-edit", &url, MASTER],
            )
            .await?;
        if !out.success() {
            tracing::warn!("Pull of {} from {} failed: {}", object_type, url, out.stderr.trim());
            self.repos().restore_quietly(lock).await;
            return Err(CmeError::Communication {
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        Ok(())
    }
}

/// `https://<host>/<type>/cme[/src=<node>][/trans=<id>]`
pub fn push_url(
    object_type: ObjectType,
    host: &str,
    src_node: Option<&str>,
    transaction: Option<&str>,
) -> String {
    let mut url = format!("https://{}/{}/cme", host, object_type.url_segment());
    if let Some(node) = src_node.filter(|s| !s.is_empty()) {
        url.push_str("/src=");
        url.push_str(node);
    }
    if let Some(id) = transaction.filter(|s| !s.is_empty()) {
        url.push_str("/trans=");
        url.push_str(id);
    }
    url
}

fn parse_log(out: &str) -> Result<Vec<LogEntry>> {
    out.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_log_line)
        .collect()
}

fn parse_log_line(line: &str) -> Result<LogEntry> {
    let fields: Vec<&str> = line.split('\x1f').collect();
    let [time, id, message, author, author_email, committer, committer_email] = fields[..] else {
        return Err(CmeError::generic(format!("Malformed log line: {:?}", line)));
    };
    let secs: i64 = time
        .parse()
        .map_err(|_| CmeError::generic(format!("Malformed commit time: {:?}", time)))?;
    let time = chrono::DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CmeError::generic(format!("Commit time out of range: {}", secs)))?;
    Ok(LogEntry {
        time,
        id: id.to_string(),
        message: message.to_string(),
        author: author.to_string(),
        author_email: author_email.to_string(),
        committer: committer.to_string(),
        committer_email: committer_email.to_string(),
    })
}

/// Read every regular file below `dir`, keyed by base file name.
fn collect_files(dir: &Path, files: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, files)?;
        } else {
            let name = entry.file_name().to_string_lossy().into_owned();
            files.insert(name, std::fs::read(&path)?);
        }
    }
    Ok(())
}
