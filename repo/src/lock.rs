//! Repository locks: a small object announcing
//! that an operation is in progress, refreshed periodically and removed
//! on completion.

use std::sync::Arc;

use backup_castore::backend::{Backend, Kind};
use backup_castore::id::Id;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};

/// Locks older than this are considered stale and may be ignored /
/// removed, regardless of whether their owning process still exists.
pub const STALE_AFTER: chrono::Duration = chrono::Duration::minutes(30);

/// How often a held lock's timestamp is refreshed while the owning
/// operation runs.
pub const REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Delay before re-listing lock objects after creating one's own, to
/// detect a race against a concurrent locker.
pub const RACE_CHECK_DELAY: std::time::Duration = std::time::Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub time: DateTime<Local>,
    pub exclusive: bool,
    pub hostname: String,
    pub username: String,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl LockFile {
    fn new(exclusive: bool, hostname: String, username: String) -> Self {
        let (uid, gid) = local_ids();
        Self {
            time: Local::now(),
            exclusive,
            hostname,
            username,
            pid: std::process::id(),
            uid,
            gid,
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("lock serializes infallibly")
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// A lock is stale if it's older than [`STALE_AFTER`], or if it
    /// claims a pid on this same host that no longer exists.
    pub fn is_stale(&self, local_hostname: &str) -> bool {
        let age = Utc::now().signed_duration_since(self.time.with_timezone(&Utc));
        if age > STALE_AFTER {
            return true;
        }
        if self.hostname == local_hostname && !process_exists(self.pid) {
            return true;
        }
        false
    }

    pub fn describe(&self) -> String {
        format!(
            "{}@{} (pid {}, {})",
            self.username,
            self.hostname,
            self.pid,
            if self.exclusive {
                "exclusive"
            } else {
                "shared"
            }
        )
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    // Signal 0 performs no action but still validates pid existence and
    // permissions, the standard `kill(2)` idiom for a liveness check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    true
}

/// The real uid/gid of the running process, for the lock's record of
/// who's holding it.
#[cfg(unix)]
pub(crate) fn local_ids() -> (u32, u32) {
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(not(unix))]
pub(crate) fn local_ids() -> (u32, u32) {
    (0, 0)
}

/// A held lock: exists to keep the lock object alive in the backend
/// until `unlock` is called or the guard is dropped (best-effort;
/// callers that need a guaranteed release should call `unlock`
/// explicitly rather than relying on `Drop`, since that can't `.await`).
pub struct LockGuard {
    id: Id,
    name: String,
}

/// Acquires a lock, honoring the non-exclusive/exclusive coexistence
/// rule: any number of non-exclusive locks may coexist; an
/// exclusive lock requires that no other lock (of either kind) is
/// present. After creating its own lock object, the locker re-lists
/// after [`RACE_CHECK_DELAY`] to catch a lock created concurrently by
/// another process.
#[instrument(skip(backend), fields(exclusive))]
pub async fn lock(
    backend: &dyn Backend,
    exclusive: bool,
    hostname: &str,
    username: &str,
) -> Result<LockGuard> {
    check_conflicts(backend, exclusive, hostname).await?;

    let lock_file = LockFile::new(exclusive, hostname.to_string(), username.to_string());
    let bytes = lock_file.to_json();
    let id = Id::of(&bytes);
    let name = id.to_hex();
    backend
        .save(Kind::Lock, &name, &bytes)
        .await
        .map_err(Error::Castore)?;

    tokio::time::sleep(RACE_CHECK_DELAY).await;

    if let Err(e) = check_conflicts_excluding(backend, exclusive, hostname, &name).await {
        backend.remove(Kind::Lock, &name).await.ok();
        return Err(e);
    }

    debug!(lock = %name, "acquired lock");
    Ok(LockGuard { id, name })
}

async fn check_conflicts(backend: &dyn Backend, exclusive: bool, hostname: &str) -> Result<()> {
    check_conflicts_excluding(backend, exclusive, hostname, "").await
}

async fn check_conflicts_excluding(
    backend: &dyn Backend,
    exclusive: bool,
    hostname: &str,
    excluding: &str,
) -> Result<()> {
    use futures::TryStreamExt;

    let names: Vec<String> = backend
        .list(Kind::Lock)
        .await
        .map_err(Error::Castore)?
        .try_collect()
        .await
        .map_err(Error::Castore)?;

    for name in names {
        if name == excluding {
            continue;
        }
        let bytes = match backend.load(Kind::Lock, &name, None, None).await {
            Ok(b) => b,
            Err(_) => continue,
        };
        let Ok(other) = LockFile::from_json(&bytes) else {
            continue;
        };
        if other.is_stale(hostname) {
            warn!(lock = %name, holder = %other.describe(), "ignoring stale lock");
            continue;
        }
        if exclusive || other.exclusive {
            return Err(Error::Locked {
                holder: other.describe(),
            });
        }
    }
    Ok(())
}

/// Refreshes a held lock's timestamp by rewriting it under the same
/// name's id-derived content... in practice the lock's id is its own
/// content hash, so a refresh must delete and recreate under a new name
/// with an updated timestamp.
pub async fn refresh(backend: &dyn Backend, guard: &mut LockGuard, hostname: &str, username: &str, exclusive: bool) -> Result<()> {
    let lock_file = LockFile::new(exclusive, hostname.to_string(), username.to_string());
    let bytes = lock_file.to_json();
    let id = Id::of(&bytes);
    let new_name = id.to_hex();
    if new_name == guard.name {
        return Ok(());
    }
    backend
        .save(Kind::Lock, &new_name, &bytes)
        .await
        .map_err(Error::Castore)?;
    backend.remove(Kind::Lock, &guard.name).await.ok();
    guard.id = id;
    guard.name = new_name;
    Ok(())
}

pub async fn unlock(backend: &dyn Backend, guard: LockGuard) -> Result<()> {
    backend
        .remove(Kind::Lock, &guard.name)
        .await
        .map_err(Error::Castore)?;
    debug!(lock = %guard.name, "released lock");
    Ok(())
}

impl LockGuard {
    pub fn id(&self) -> Id {
        self.id
    }
}

/// Spawns a background task that refreshes `guard` every
/// [`REFRESH_INTERVAL`] until `cancel` fires, well inside the
/// [`STALE_AFTER`] window other lockers use to decide a lock is
/// abandoned. Returns the guard once the loop stops, so the caller can
/// still `unlock` it.
pub fn spawn_refresh_loop(
    backend: Arc<dyn Backend>,
    mut guard: LockGuard,
    hostname: String,
    username: String,
    exclusive: bool,
    cancel: crate::tree::CancelToken,
) -> tokio::task::JoinHandle<LockGuard> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {
                    if let Err(e) = refresh(backend.as_ref(), &mut guard, &hostname, &username, exclusive).await {
                        warn!(error = %e, "lock refresh failed");
                    }
                }
                _ = wait_for_cancel(&cancel) => break,
            }
        }
        guard
    })
}

async fn wait_for_cancel(cancel: &crate::tree::CancelToken) {
    while !cancel.is_canceled() {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}
