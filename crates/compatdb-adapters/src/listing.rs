use std::sync::Arc;

use async_trait::async_trait;
use compatdb_core::{archive_precedes, sort_archives};
use compatdb_storage::{FetchError, HttpFetch};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ListError {
    #[error("listing request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("decoding repository tree: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no archives under {prefix:?} ending in {suffix:?}")]
    NoArchives { prefix: String, suffix: String },
}

/// Enumerates every file path currently published by the remote repository.
#[async_trait]
pub trait RemoteLister: Send + Sync {
    async fn list_paths(&self) -> Result<Vec<String>, ListError>;
}

#[derive(Debug, Deserialize)]
struct GitTree {
    tree: Vec<GitTreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct GitTreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Lists a branch through the recursive git-trees endpoint of the GitHub API.
pub struct GitHubTreeLister {
    http: Arc<dyn HttpFetch>,
    api_base: String,
    owner: String,
    repo: String,
    branch: String,
}

impl GitHubTreeLister {
    pub fn new(
        http: Arc<dyn HttpFetch>,
        api_base: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    pub fn tree_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/git/trees/{}?recursive=1",
            self.api_base.trim_end_matches('/'),
            self.owner,
            self.repo,
            self.branch
        )
    }
}

#[async_trait]
impl RemoteLister for GitHubTreeLister {
    async fn list_paths(&self) -> Result<Vec<String>, ListError> {
        let url = self.tree_url();
        let response = self.http.get_bytes(&url).await?;
        let tree: GitTree = serde_json::from_slice(&response.body)?;
        if tree.truncated {
            warn!(url = %url, "repository tree listing was truncated");
        }
        let paths: Vec<String> = tree
            .tree
            .into_iter()
            .filter(|entry| entry.kind == "blob")
            .map(|entry| entry.path)
            .collect();
        debug!(count = paths.len(), "listed repository blobs");
        Ok(paths)
    }
}

/// Outcome of choosing the next archive to ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Next(String),
    Unchanged,
}

/// Filters the remote listing down to report archives and decides what to ingest next.
#[derive(Debug, Clone)]
pub struct ArchiveSelector {
    prefix: String,
    suffix: String,
    baseline_archive: String,
}

impl ArchiveSelector {
    pub fn new(
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        baseline_archive: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            baseline_archive: baseline_archive.into(),
        }
    }

    pub fn baseline_archive(&self) -> &str {
        &self.baseline_archive
    }

    /// Report archives from `paths`, oldest first.
    pub fn archives(&self, paths: Vec<String>) -> Vec<String> {
        let matching = paths
            .into_iter()
            .filter(|p| p.starts_with(&self.prefix) && p.ends_with(&self.suffix))
            .collect();
        sort_archives(matching)
    }

    /// Candidate archives for a checkpoint.
    ///
    /// An empty checkpoint yields the whole sorted listing. A checkpoint older
    /// than the baseline yields only the baseline archive. Anything else yields
    /// only the newest archive, since every published archive is cumulative.
    pub fn candidates(&self, sorted: &[String], last_processed: &str) -> Vec<String> {
        let Some(newest) = sorted.last() else {
            return Vec::new();
        };
        if last_processed.is_empty() {
            return sorted.to_vec();
        }
        if archive_precedes(last_processed, &self.baseline_archive) {
            return vec![self.baseline_archive.clone()];
        }
        vec![newest.clone()]
    }

    /// First candidate strictly newer than the checkpoint, or `Unchanged`.
    pub fn choose(&self, candidates: &[String], last_processed: &str) -> Selection {
        if last_processed.is_empty() {
            return candidates
                .first()
                .map_or(Selection::Unchanged, |c| Selection::Next(c.clone()));
        }
        candidates
            .iter()
            .find(|candidate| archive_precedes(last_processed, candidate))
            .map_or(Selection::Unchanged, |c| Selection::Next(c.clone()))
    }

    pub async fn next_archive(
        &self,
        lister: &dyn RemoteLister,
        last_processed: &str,
    ) -> Result<Selection, ListError> {
        let archives = self.archives(lister.list_paths().await?);
        if archives.is_empty() {
            return Err(ListError::NoArchives {
                prefix: self.prefix.clone(),
                suffix: self.suffix.clone(),
            });
        }
        let candidates = self.candidates(&archives, last_processed);
        let selection = self.choose(&candidates, last_processed);
        info!(
            last_processed,
            available = archives.len(),
            selection = ?selection,
            "archive selection"
        );
        Ok(selection)
    }
}
