//! Keeps the firmware working copy in step with its upstream.
//!
//! The upstream is contacted at most once per day. A failed pull is never
//! fatal: the run continues with whatever is checked out locally.

use std::path::PathBuf;

use chrono::NaiveDate;
use git2::{
    build::CheckoutBuilder, Cred, CredentialType, ErrorCode, FetchOptions, RemoteCallbacks,
    Repository,
};
use log::{debug, info, warn};
use thiserror::Error;

use crate::{session::SessionState, Settings};

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("local branch `{branch}` has diverged from `{remote}`, pull it manually")]
    Diverged { remote: String, branch: String },

    #[error("working copy is on `{current}`, not `{branch}`")]
    OffBranch { branch: String, current: String },

    #[error("local changes in the working copy would be overwritten by `{branch}`")]
    LocalChanges { branch: String },
}

/// The remote side of the working copy.
pub trait Upstream {
    /// Fetch the upstream branch and integrate it into the working copy.
    fn pull(&self) -> Result<(), SyncError>;
}

/// What happened during synchronization.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Already synchronized today, the upstream was not contacted.
    Current,
    /// Pulled successfully, the firmware must be rebuilt.
    Updated,
    /// The pull failed, the working copy is unchanged.
    Stale(SyncError),
}
impl SyncOutcome {
    pub fn rebuild_required(&self) -> bool {
        matches!(self, SyncOutcome::Updated)
    }
}

/// Pull unless already done today. Only a successful pull moves the session
/// date forward.
pub fn sync_repository(
    upstream: &dyn Upstream,
    session: &mut SessionState,
    today: NaiveDate,
) -> SyncOutcome {
    if session.synced_on(today) {
        debug!("already synchronized on {}", today);
        return SyncOutcome::Current;
    }

    match upstream.pull() {
        Ok(()) => {
            info!("repository synchronized, last sync was {}", session.last_sync_date);
            session.last_sync_date = today;
            SyncOutcome::Updated
        }
        Err(err) => {
            warn!("repository not updated: {}", err);
            SyncOutcome::Stale(err)
        }
    }
}

/// Pulls with `libgit2`: fetch, then fast-forward the local branch.
///
/// The branch must be checked out. Uncommitted edits are kept, unless the
/// incoming changes touch the same files, in which case nothing is updated.
///
/// SSH remotes authenticate through the SSH agent, HTTPS remotes through the
/// credential helper configured in git.
#[derive(Debug, Clone)]
pub struct GitUpstream {
    path: PathBuf,
    remote: String,
    branch: String,
}
impl GitUpstream {
    pub fn new(settings: &Settings) -> Self {
        GitUpstream {
            path: settings.repo_path.clone(),
            remote: settings.remote.clone(),
            branch: settings.branch.clone(),
        }
    }
}
impl Upstream for GitUpstream {
    fn pull(&self) -> Result<(), SyncError> {
        let repo = Repository::open(&self.path)?;
        let refname = format!("refs/heads/{}", self.branch);
        let head = repo.head()?;
        if head.name() != Some(refname.as_str()) {
            return Err(SyncError::OffBranch {
                branch: self.branch.clone(),
                current: head.shorthand().unwrap_or("HEAD").to_owned(),
            });
        }

        let mut remote = repo.find_remote(&self.remote)?;

        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|url, username, allowed| {
            if allowed.contains(CredentialType::SSH_KEY) {
                Cred::ssh_key_from_agent(username.unwrap_or("git"))
            } else if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                let config = git2::Config::open_default()?;
                Cred::credential_helper(&config, url, username)
            } else {
                Cred::default()
            }
        });
        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);

        debug!("fetching {}/{}", self.remote, self.branch);
        remote.fetch(&[self.branch.as_str()], Some(&mut options), None)?;

        let fetch_head = repo.find_reference("FETCH_HEAD")?;
        let fetched = repo.reference_to_annotated_commit(&fetch_head)?;
        let (analysis, _) = repo.merge_analysis(&[&fetched])?;

        if analysis.is_up_to_date() {
            debug!("no upstream changes");
            return Ok(());
        }
        if !analysis.is_fast_forward() {
            return Err(SyncError::Diverged {
                remote: self.remote.clone(),
                branch: self.branch.clone(),
            });
        }

        // A safe checkout fails before touching anything when a local edit is
        // in the way, so the branch only moves once the files are updated.
        let target = repo.find_commit(fetched.id())?;
        repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().safe()))
            .map_err(|err| match err.code() {
                ErrorCode::Conflict => SyncError::LocalChanges {
                    branch: self.branch.clone(),
                },
                _ => SyncError::Git(err),
            })?;
        let mut reference = repo.find_reference(&refname)?;
        reference.set_target(fetched.id(), "mosprov: fast-forward")?;
        info!("fast-forwarded {} to {}", self.branch, fetched.id());
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
struct FakeUpstream {
    fail: bool,
    pulls: std::cell::Cell<usize>,
}
#[cfg(test)]
impl FakeUpstream {
    fn new(fail: bool) -> Self {
        FakeUpstream {
            fail,
            pulls: std::cell::Cell::new(0),
        }
    }
}
#[cfg(test)]
impl Upstream for FakeUpstream {
    fn pull(&self) -> Result<(), SyncError> {
        self.pulls.set(self.pulls.get() + 1);
        if self.fail {
            Err(git2::Error::from_str("failed to resolve address for github.com").into())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
}

#[test]
fn synced_today_skips_the_network() {
    let upstream = FakeUpstream::new(false);
    let mut session = SessionState {
        last_sync_date: day(15),
    };
    let outcome = sync_repository(&upstream, &mut session, day(15));
    assert!(matches!(outcome, SyncOutcome::Current));
    assert!(!outcome.rebuild_required());
    assert_eq!(upstream.pulls.get(), 0);
    assert_eq!(session.last_sync_date, day(15));
}

#[test]
fn stale_copy_is_pulled() {
    let upstream = FakeUpstream::new(false);
    let mut session = SessionState {
        last_sync_date: day(14),
    };
    let outcome = sync_repository(&upstream, &mut session, day(15));
    assert!(outcome.rebuild_required());
    assert_eq!(upstream.pulls.get(), 1);
    assert_eq!(session.last_sync_date, day(15));
}

#[test]
fn failed_pull_keeps_the_date() {
    let upstream = FakeUpstream::new(true);
    let mut session = SessionState::never_synced();
    let outcome = sync_repository(&upstream, &mut session, day(15));
    assert!(matches!(outcome, SyncOutcome::Stale(SyncError::Git(_))));
    assert!(!outcome.rebuild_required());
    assert_eq!(session, SessionState::never_synced());
}

#[test]
fn missing_repository_is_a_sync_error() {
    let dir = tempfile::tempdir().unwrap();
    let settings = crate::SettingsBuilder::new()
        .repo_path(dir.path().join("absent"))
        .finalize();
    assert!(GitUpstream::new(&settings).pull().is_err());
}

#[cfg(test)]
fn commit(repo: &Repository, file: &str, content: &str, message: &str) {
    use std::{fs, path::Path};

    let workdir = repo.workdir().unwrap().to_path_buf();
    fs::write(workdir.join(file), content).unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new(file)).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let signature = git2::Signature::now("mosprov", "mosprov@example.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .unwrap();
}

/// An origin holding `mos.yml` and `local.c`, and a clone of it.
#[cfg(test)]
struct Checkout {
    _dir: tempfile::TempDir,
    origin: Repository,
    clone: Repository,
    upstream: GitUpstream,
}
#[cfg(test)]
impl Checkout {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let origin_path = dir.path().join("origin");
        let origin = Repository::init(&origin_path).unwrap();
        commit(&origin, "mos.yml", "version: 1\n", "initial");
        commit(&origin, "local.c", "int x = 0;\n", "sources");
        let branch = origin.head().unwrap().shorthand().unwrap().to_owned();

        let clone_path = dir.path().join("clone");
        let clone = Repository::clone(origin_path.to_str().unwrap(), &clone_path).unwrap();

        let settings = crate::SettingsBuilder::new()
            .repo_path(&clone_path)
            .upstream("origin", branch.as_str())
            .finalize();
        Checkout {
            _dir: dir,
            origin,
            clone,
            upstream: GitUpstream::new(&settings),
        }
    }

    fn read(&self, file: &str) -> String {
        std::fs::read_to_string(self.clone.workdir().unwrap().join(file)).unwrap()
    }

    fn write(&self, file: &str, content: &str) {
        std::fs::write(self.clone.workdir().unwrap().join(file), content).unwrap();
    }

    fn head(&self) -> git2::Oid {
        self.clone.head().unwrap().target().unwrap()
    }
}

#[test]
fn fast_forwards_from_a_local_remote() {
    let checkout = Checkout::new();
    commit(&checkout.origin, "mos.yml", "version: 2\n", "bump");

    checkout.upstream.pull().unwrap();
    assert_eq!(checkout.read("mos.yml"), "version: 2\n");
    assert_eq!(checkout.head(), checkout.origin.head().unwrap().target().unwrap());
}

#[test]
fn uncommitted_edits_survive_the_pull() {
    let checkout = Checkout::new();
    checkout.write("local.c", "int x = 42; // WIP\n");
    commit(&checkout.origin, "mos.yml", "version: 2\n", "bump");

    checkout.upstream.pull().unwrap();
    assert_eq!(checkout.read("mos.yml"), "version: 2\n");
    assert_eq!(checkout.read("local.c"), "int x = 42; // WIP\n");
}

#[test]
fn conflicting_edit_stops_the_pull() {
    let checkout = Checkout::new();
    let before = checkout.head();
    checkout.write("mos.yml", "version: local\n");
    commit(&checkout.origin, "mos.yml", "version: 2\n", "bump");

    match checkout.upstream.pull() {
        Err(SyncError::LocalChanges { .. }) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(checkout.read("mos.yml"), "version: local\n");
    assert_eq!(checkout.head(), before);
}

#[test]
fn other_branch_checked_out_is_refused() {
    let checkout = Checkout::new();
    let tip = checkout.clone.head().unwrap().peel_to_commit().unwrap();
    checkout.clone.branch("feature", &tip, false).unwrap();
    checkout.clone.set_head("refs/heads/feature").unwrap();
    commit(&checkout.origin, "mos.yml", "version: 2\n", "bump");

    match checkout.upstream.pull() {
        Err(SyncError::OffBranch { current, .. }) => assert_eq!(current, "feature"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(checkout.read("mos.yml"), "version: 1\n");
}
