//! Remote poller.
//!
//! Fetches the live branch/tag picture of an application's repository. The
//! [`GitPoller`] keeps one bare cache repository per application under the
//! workspace and runs a pruning fetch against it each poll, so refs deleted
//! upstream disappear from the cache and surface as deletions during
//! reconciliation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use git2::{AutotagOption, Cred, CredentialType, FetchOptions, FetchPrune, RemoteCallbacks, Repository};

use crate::errors::PollError;
use crate::monitor::classify::is_active;
use crate::store::models::{Application, ObservedRemote, RefKind};

/// Source of observed remote state. The production implementation talks to
/// git; tests substitute scripted snapshots.
#[async_trait]
pub trait RemotePoller: Send + Sync {
    /// List the repository's current branch and tag refs. With
    /// `active_only`, tags older than the activity threshold are omitted;
    /// branches are always returned so staleness can be classified.
    async fn list_remote_refs(
        &self,
        application: &Application,
        active_only: bool,
    ) -> Result<Vec<ObservedRemote>, PollError>;
}

/// Polls git repositories through per-application bare cache repos.
pub struct GitPoller {
    refs_dir: PathBuf,
    activity_threshold: Duration,
}

impl GitPoller {
    pub fn new(refs_dir: PathBuf, activity_threshold: Duration) -> Self {
        Self {
            refs_dir,
            activity_threshold,
        }
    }

    fn cache_path(&self, application_id: i64) -> PathBuf {
        self.refs_dir.join(format!("app-{application_id}.git"))
    }
}

#[async_trait]
impl RemotePoller for GitPoller {
    async fn list_remote_refs(
        &self,
        application: &Application,
        active_only: bool,
    ) -> Result<Vec<ObservedRemote>, PollError> {
        let cache_path = self.cache_path(application.id);
        let repository = application.repository.clone();
        let threshold = self.activity_threshold;

        // libgit2 is synchronous; keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            fetch_refs(&cache_path, &repository, active_only, threshold)
        })
        .await
        .map_err(|e| PollError::Aborted(format!("Poll task panicked: {e}")))?
    }
}

fn fetch_refs(
    cache_path: &Path,
    repository: &str,
    active_only: bool,
    threshold: Duration,
) -> Result<Vec<ObservedRemote>, PollError> {
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| PollError::Cache {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let fetch_err = |source: git2::Error| PollError::Fetch {
        repository: repository.to_string(),
        source,
    };

    let repo = match Repository::open_bare(cache_path) {
        Ok(repo) => repo,
        Err(_) => Repository::init_bare(cache_path).map_err(fetch_err)?,
    };

    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(|_url, username_from_url, allowed| {
        if allowed.contains(CredentialType::SSH_KEY) {
            Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
        } else {
            Cred::default()
        }
    });

    let mut options = FetchOptions::new();
    options
        .remote_callbacks(callbacks)
        .prune(FetchPrune::On)
        .download_tags(AutotagOption::None);

    // Anonymous remote so a repository URL change takes effect on the
    // next poll without touching cached remote config.
    let mut remote = repo.remote_anonymous(repository).map_err(fetch_err)?;
    remote
        .fetch(
            &["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"],
            Some(&mut options),
            None,
        )
        .map_err(fetch_err)?;
    drop(remote);

    let now = Utc::now();
    let mut observed = Vec::new();
    let references = repo.references().map_err(fetch_err)?;
    for reference in references.flatten() {
        let kind = if reference.is_branch() {
            RefKind::Branch
        } else if reference.is_tag() {
            RefKind::Tag
        } else {
            continue;
        };
        let Some(name) = reference.shorthand().map(str::to_string) else {
            continue;
        };
        // Annotated tags peel through to the tagged commit.
        let Ok(commit) = reference.peel_to_commit() else {
            continue;
        };
        let age = DateTime::from_timestamp(commit.time().seconds(), 0);

        if active_only && kind == RefKind::Tag && !is_active(age, now, threshold) {
            continue;
        }

        observed.push(ObservedRemote {
            remote: name,
            kind,
            sha: commit.id().to_string(),
            age,
            seen: now,
        });
    }

    Ok(observed)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use git2::Signature;
    use std::fs;
    use tempfile::tempdir;

    fn setup_source_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        (dir, repo)
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) -> String {
        commit_file_at(dir, name, content, msg, Utc::now())
    }

    fn commit_file_at(
        dir: &Path,
        name: &str,
        content: &str,
        msg: &str,
        when: DateTime<Utc>,
    ) -> String {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let time = git2::Time::new(when.timestamp(), 0);
        let sig = Signature::new("test", "test@test.com", &time).unwrap();
        let commit_id = if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap()
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap()
        };
        commit_id.to_string()
    }

    fn sample_application(repository: &str) -> Application {
        Application {
            id: 1,
            name: "demo".to_string(),
            label: Some("Demo".to_string()),
            repository: repository.to_string(),
            credentials_id: None,
            auto_build: true,
            created_at: Utc::now(),
        }
    }

    fn poller(workspace: &Path) -> GitPoller {
        GitPoller::new(workspace.join("refs"), Duration::days(7))
    }

    #[tokio::test]
    async fn test_lists_branches_with_sha_and_age() {
        let (source, _repo) = setup_source_repo();
        let when = Utc.with_ymd_and_hms(2026, 8, 20, 12, 0, 0).unwrap();
        let sha = commit_file_at(source.path(), "a.txt", "hello", "init", when);

        let workspace = tempdir().unwrap();
        let poller = poller(workspace.path());
        let app = sample_application(source.path().to_str().unwrap());

        let refs = poller.list_remote_refs(&app, false).await.unwrap();
        assert_eq!(refs.len(), 1);
        let main = &refs[0];
        assert_eq!(main.kind, RefKind::Branch);
        assert_eq!(main.sha, sha);
        assert_eq!(main.age.unwrap(), when);
    }

    #[tokio::test]
    async fn test_lists_tags_and_multiple_branches() {
        let (source, repo) = setup_source_repo();
        commit_file(source.path(), "a.txt", "hello", "init");
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("feature-x", &head, false).unwrap();
        repo.tag_lightweight("v1.0", head.as_object(), false).unwrap();

        let workspace = tempdir().unwrap();
        let poller = poller(workspace.path());
        let app = sample_application(source.path().to_str().unwrap());

        let mut refs = poller.list_remote_refs(&app, false).await.unwrap();
        refs.sort_by(|a, b| a.remote.cmp(&b.remote));
        let names: Vec<(&str, RefKind)> = refs
            .iter()
            .map(|r| (r.remote.as_str(), r.kind))
            .collect();
        assert!(names.contains(&("feature-x", RefKind::Branch)));
        assert!(names.contains(&("v1.0", RefKind::Tag)));
    }

    #[tokio::test]
    async fn test_pruning_fetch_drops_deleted_branches() {
        let (source, repo) = setup_source_repo();
        commit_file(source.path(), "a.txt", "hello", "init");
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("short-lived", &head, false).unwrap();

        let workspace = tempdir().unwrap();
        let poller = poller(workspace.path());
        let app = sample_application(source.path().to_str().unwrap());

        let refs = poller.list_remote_refs(&app, false).await.unwrap();
        assert!(refs.iter().any(|r| r.remote == "short-lived"));

        repo.find_branch("short-lived", git2::BranchType::Local)
            .unwrap()
            .delete()
            .unwrap();

        let refs = poller.list_remote_refs(&app, false).await.unwrap();
        assert!(!refs.iter().any(|r| r.remote == "short-lived"));
    }

    #[tokio::test]
    async fn test_active_only_omits_stale_tags_but_keeps_stale_branches() {
        let (source, repo) = setup_source_repo();
        let old = Utc::now() - Duration::days(30);
        commit_file_at(source.path(), "a.txt", "hello", "init", old);
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.tag_lightweight("v0.1", head.as_object(), false).unwrap();

        let workspace = tempdir().unwrap();
        let poller = poller(workspace.path());
        let app = sample_application(source.path().to_str().unwrap());

        let refs = poller.list_remote_refs(&app, true).await.unwrap();
        assert!(refs.iter().any(|r| r.kind == RefKind::Branch));
        assert!(!refs.iter().any(|r| r.kind == RefKind::Tag));
    }

    #[tokio::test]
    async fn test_fetch_failure_names_the_repository() {
        let workspace = tempdir().unwrap();
        let poller = poller(workspace.path());
        let app = sample_application("/nonexistent/repo/path");

        let err = poller.list_remote_refs(&app, false).await.unwrap_err();
        match err {
            PollError::Fetch { repository, .. } => {
                assert_eq!(repository, "/nonexistent/repo/path")
            }
            other => panic!("Expected Fetch error, got {other:?}"),
        }
    }
}
