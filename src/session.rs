//! Run metadata kept between invocations.
//!
//! The only thing remembered is the day the firmware repository was last
//! synchronized, so the network is hit at most once a day.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub last_sync_date: NaiveDate,
}
impl SessionState {
    /// State of a machine that never synchronized, dated `0001-01-01`.
    pub fn never_synced() -> Self {
        SessionState {
            last_sync_date: NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN),
        }
    }

    pub fn synced_on(&self, day: NaiveDate) -> bool {
        self.last_sync_date == day
    }
}
impl Default for SessionState {
    fn default() -> Self {
        Self::never_synced()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot access session file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("session file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Loads and saves [`SessionState`] as a small JSON document.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}
impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SessionStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state.
    ///
    /// A missing or unreadable file never fails the caller: the state falls
    /// back to [`SessionState::never_synced`], which is written back right
    /// away so the next run finds a valid file.
    pub fn load(&self) -> SessionState {
        match self.read() {
            Ok(state) => {
                debug!("session loaded from {}: {:?}", self.path.display(), state);
                state
            }
            Err(err) => {
                match &err {
                    SessionError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                        debug!("no session at {}, starting fresh", self.path.display())
                    }
                    _ => warn!("{}, starting fresh", err),
                }
                let state = SessionState::never_synced();
                if let Err(err) = self.save(&state) {
                    warn!("{}", err);
                }
                state
            }
        }
    }

    pub fn save(&self, state: &SessionState) -> Result<(), SessionError> {
        let io_error = |source| SessionError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(io_error)?;
            }
        }
        let document = serde_json::to_string_pretty(state).map_err(|source| {
            SessionError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;
        fs::write(&self.path, document).map_err(io_error)?;
        debug!("session saved to {}: {:?}", self.path.display(), state);
        Ok(())
    }

    fn read(&self) -> Result<SessionState, SessionError> {
        let document = fs::read_to_string(&self.path).map_err(|source| SessionError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&document).map_err(|source| SessionError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("session.json"));
    let state = SessionState {
        last_sync_date: NaiveDate::from_ymd_opt(2026, 10, 15).unwrap(),
    };
    store.save(&state).unwrap();
    assert_eq!(store.load(), state);
}

#[test]
fn missing_file_falls_back_and_writes_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("session.json");
    let store = SessionStore::new(&path);
    assert_eq!(store.load(), SessionState::never_synced());
    assert!(path.is_file());
    assert_eq!(store.load(), SessionState::never_synced());
}

#[test]
fn corrupt_file_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    fs::write(&path, "\u{80}\u{3}pickle").unwrap();
    let store = SessionStore::new(&path);
    assert_eq!(store.load(), SessionState::never_synced());
    let rewritten = fs::read_to_string(&path).unwrap();
    assert!(rewritten.contains("0001-01-01"));
}

#[test]
fn sentinel_date() {
    let state = SessionState::never_synced();
    assert_eq!(state.last_sync_date.to_string(), "0001-01-01");
    assert!(!state.synced_on(NaiveDate::from_ymd_opt(2026, 10, 15).unwrap()));
}
