use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use hpo_core::fsutil::ensure_dir;
use hpo_core::{HpoError, Result};

use crate::config::RepositoryConfig;

/// Exclusive lock on one location of an on-disk repository, held as a
/// `create_new` lock file and released on drop.
#[derive(Debug)]
pub struct LocationLock {
    path: PathBuf,
    payload: Vec<u8>,
}

impl LocationLock {
    /// Takes the lock at `path`, retrying with doubling backoff while another
    /// writer holds it. Gives up with `ConcurrentWriteConflict` after
    /// `lock_retries` attempts.
    pub fn acquire(path: &Path, config: &RepositoryConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let attempts = config.lock_retries.max(1);
        let mut backoff = config.backoff();
        for attempt in 1..=attempts {
            match try_create(path) {
                Ok(lock) => return Ok(lock),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if remove_if_stale(path, config) {
                        continue;
                    }
                    if attempt == attempts {
                        break;
                    }
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(config.max_backoff());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(HpoError::ConcurrentWriteConflict(format!(
            "{} still held after {} attempts",
            path.display(),
            attempts
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocationLock {
    fn drop(&mut self) {
        // A lock reclaimed as stale may belong to another writer by now.
        take_if_unchanged(&self.path, &self.payload);
    }
}

fn try_create(path: &Path) -> std::io::Result<LocationLock> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let payload = format!(
        "{{\"pid\":{},\"token\":{},\"acquired_at\":\"{}\"}}\n",
        std::process::id(),
        NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        Utc::now().to_rfc3339()
    )
    .into_bytes();
    let _ = file.write_all(&payload);
    let _ = file.sync_all();
    Ok(LocationLock {
        path: path.to_path_buf(),
        payload,
    })
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// A lock file older than `stale_lock_secs` belongs to a writer that died
/// without releasing it.
fn remove_if_stale(path: &Path, config: &RepositoryConfig) -> bool {
    let Ok(judged) = fs::read(path) else {
        return false;
    };
    let Some(age) = lock_age(path) else {
        return false;
    };
    if age < config.stale_after() {
        return false;
    }
    if !take_if_unchanged(path, &judged) {
        return false;
    }
    if !config.silence_warnings {
        tracing::warn!(
            lock = %path.display(),
            age_secs = age.as_secs(),
            "removed stale location lock"
        );
    }
    true
}

/// Removes the lock file at `path` only if it still holds `expected`.
///
/// The file is first renamed to a private tombstone so no other writer can
/// create or remove it while its content is compared. A lock that changed
/// hands in the meantime is linked back in place, which fails instead of
/// clobbering a lock created since the rename.
fn take_if_unchanged(path: &Path, expected: &[u8]) -> bool {
    let tombstone = tombstone_path(path);
    if fs::rename(path, &tombstone).is_err() {
        return false;
    }
    let unchanged = fs::read(&tombstone).is_ok_and(|found| found == expected);
    if !unchanged {
        if let Err(err) = fs::hard_link(&tombstone, path) {
            tracing::warn!(
                lock = %path.display(),
                error = %err,
                "could not put back a location lock taken by another writer"
            );
        }
    }
    let _ = fs::remove_file(&tombstone);
    unchanged
}

fn tombstone_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.stale-{}-{}",
        name.trim_start_matches('.'),
        std::process::id(),
        NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> RepositoryConfig {
        RepositoryConfig {
            lock_retries: 3,
            lock_backoff_ms: 1,
            lock_max_backoff_ms: 2,
            ..RepositoryConfig::default()
        }
    }

    #[test]
    fn second_acquire_conflicts_until_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(".trial_0.lock");
        let first = LocationLock::acquire(&path, &quick()).expect("first");
        assert!(path.exists());
        let err = LocationLock::acquire(&path, &quick()).expect_err("held");
        assert!(err.is_retryable());

        drop(first);
        assert!(!path.exists());
        let again = LocationLock::acquire(&path, &quick()).expect("after release");
        assert_eq!(again.path(), path.as_path());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".round.lock");
        fs::write(&path, "{}").expect("leftover lock");
        let config = RepositoryConfig {
            stale_lock_secs: 0,
            silence_warnings: true,
            ..quick()
        };
        let lock = LocationLock::acquire(&path, &config).expect("reclaimed");
        let payload = fs::read_to_string(lock.path()).expect("read");
        assert!(payload.contains(&format!("\"pid\":{}", std::process::id())));
    }

    #[test]
    fn waiter_gets_the_lock_once_released() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".client.lock");
        let held = LocationLock::acquire(&path, &quick()).expect("held");
        let patient = RepositoryConfig {
            lock_retries: 500,
            ..quick()
        };
        thread::scope(|s| {
            let waiter = s.spawn(|| LocationLock::acquire(&path, &patient).map(|_| ()));
            thread::sleep(Duration::from_millis(20));
            drop(held);
            waiter.join().expect("join").expect("acquired after release");
        });
    }

    #[test]
    fn fresh_lock_survives_a_late_stale_reclaim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".trial_0.lock");
        fs::write(&path, "{\"pid\":1}\n").expect("leftover lock");
        // Another writer judged this content stale, then the lock changed hands.
        let judged = fs::read(&path).expect("judged");
        fs::remove_file(&path).expect("reclaimed by a third writer");
        let fresh = LocationLock::acquire(&path, &quick()).expect("fresh");

        assert!(!take_if_unchanged(&path, &judged));
        let payload = fs::read_to_string(&path).expect("still there");
        assert!(payload.contains(&format!("\"pid\":{}", std::process::id())));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("list")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "{leftovers:?}");

        drop(fresh);
        assert!(!path.exists());
    }

    #[test]
    fn dropping_a_reclaimed_lock_keeps_the_new_holder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".round.lock");
        let slow = LocationLock::acquire(&path, &quick()).expect("slow writer");
        let config = RepositoryConfig {
            stale_lock_secs: 0,
            silence_warnings: true,
            ..quick()
        };
        let fresh = LocationLock::acquire(&path, &config).expect("reclaimed");
        let held = fs::read(&path).expect("read");

        drop(slow);
        assert_eq!(fs::read(&path).expect("still held"), held);
        drop(fresh);
        assert!(!path.exists());
    }
}
