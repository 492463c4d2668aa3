//! Cross-process atomic read-modify-write of JSON state files.
//!
//! The orchestrator may be launched multiple times against the same project (one process per
//! browser tab). All mutation of shared JSON goes through [`LockedJsonStore::update`],
//! guaranteeing no lost updates and no torn files.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tayfa_types::{EngineError, Result};
use tracing::{debug, warn};

const DEFAULT_LOCK_DEADLINE: Duration = Duration::from_secs(10);
const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    pub deadline: Duration,
    pub poll_interval: Duration,
    pub stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_LOCK_DEADLINE,
            poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
            stale_after: DEFAULT_LOCK_STALE_AFTER,
        }
    }
}

/// Holds the side-car `<path>.lock` file for the lifetime of a critical section. Dropping it
/// releases the lock; removal is best-effort (a holder that crashes leaves a stale lock file,
/// which a later contender is permitted to break after `stale_after`).
struct LockGuard {
    lock_path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.lock_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.lock_path.display(), %err, "failed to release lock file");
            }
        }
    }
}

async fn acquire_lock(path: &Path, settings: LockSettings) -> Result<LockGuard> {
    let lock_path = lock_path_for(path);
    let start = Instant::now();
    let mut broke_stale_once = false;

    loop {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
        {
            Ok(_) => {
                return Ok(LockGuard { lock_path });
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if !broke_stale_once {
                    if let Ok(metadata) = tokio::fs::metadata(&lock_path).await {
                        if let Ok(modified) = metadata.modified() {
                            if is_stale(modified, settings.stale_after) {
                                debug!(path = %lock_path.display(), "breaking stale lock file");
                                let _ = tokio::fs::remove_file(&lock_path).await;
                                broke_stale_once = true;
                                continue;
                            }
                        }
                    }
                }
                if start.elapsed() >= settings.deadline {
                    return Err(EngineError::LockTimeout(path.display().to_string()));
                }
                tokio::time::sleep(settings.poll_interval).await;
            }
            Err(err) => {
                return Err(EngineError::LockTimeout(format!(
                    "{}: {err}",
                    path.display()
                )));
            }
        }
    }
}

fn is_stale(modified: SystemTime, stale_after: Duration) -> bool {
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age >= stale_after)
        .unwrap_or(false)
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(".lock");
    PathBuf::from(os_string)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(".tmp");
    PathBuf::from(os_string)
}

/// Atomically replaces `path`'s contents with `bytes`: write to `path.tmp`, then rename over
/// the destination. On rename failure the destination is unlinked first (Windows cannot
/// rename over an existing file).
async fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::Unknown(format!("create_dir_all {}: {e}", parent.display())))?;
    }
    let tmp = tmp_path_for(path);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| EngineError::Unknown(format!("write {}: {e}", tmp.display())))?;

    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        debug!(%err, "rename over existing file failed, unlinking destination first");
        let _ = tokio::fs::remove_file(path).await;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| EngineError::Unknown(format!("rename {}: {e}", path.display())))?;
    }
    Ok(())
}

/// The locked JSON store. Cheap to clone; holds no state beyond lock timing configuration.
#[derive(Debug, Clone, Default)]
pub struct LockedJsonStore {
    settings: LockSettings,
}

impl LockedJsonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: LockSettings) -> Self {
        Self { settings }
    }

    /// Reads and parses `path` as JSON, returning `default` if the file is missing or its
    /// contents are not valid JSON. Acquires the lock for the duration of the read so a
    /// concurrent `update` never observes a torn file.
    pub async fn read<T>(&self, path: &Path, default: T) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let _guard = acquire_lock(path, self.settings).await?;
        Ok(read_or_default(path, default).await)
    }

    /// Atomically replaces `path`'s contents with the JSON serialization of `value`.
    pub async fn write<T>(&self, path: &Path, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let _guard = acquire_lock(path, self.settings).await?;
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| EngineError::Unknown(format!("serialize {}: {e}", path.display())))?;
        atomic_write_bytes(path, &bytes).await
    }

    /// Acquires an exclusive lock, reads the current value (or `default`), applies `mutator`,
    /// writes the result atomically, and releases the lock — the entire read-modify-write is
    /// one critical section.
    pub async fn update<T, F>(&self, path: &Path, default: T, mutator: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        let _guard = acquire_lock(path, self.settings).await?;
        let current = read_or_default(path, default).await;
        let updated = mutator(current);
        let bytes = serde_json::to_vec_pretty(&updated)
            .map_err(|e| EngineError::Unknown(format!("serialize {}: {e}", path.display())))?;
        atomic_write_bytes(path, &bytes).await?;
        Ok(updated)
    }
}

/// Atomically replaces `path`'s contents with arbitrary bytes (e.g. an agent's markdown
/// memory file), using the same tmp-then-rename primitive as the JSON store. Callers that
/// need this for non-JSON files still go through the tmp+rename guarantee without taking a
/// side-car lock, since those files are only ever written by the single in-flight run for
/// that agent.
pub async fn atomic_write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    atomic_write_bytes(path, bytes).await
}

async fn read_or_default<T: DeserializeOwned>(path: &Path, default: T) -> T {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
    struct Counter {
        value: u64,
    }

    #[tokio::test]
    async fn read_returns_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = LockedJsonStore::new();
        let value: Counter = store.read(&path, Counter::default()).await.unwrap();
        assert_eq!(value, Counter::default());
    }

    #[tokio::test]
    async fn read_returns_default_on_corrupt_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let store = LockedJsonStore::new();
        let value: Counter = store.read(&path, Counter::default()).await.unwrap();
        assert_eq!(value, Counter::default());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = LockedJsonStore::new();
        store.write(&path, &Counter { value: 7 }).await.unwrap();
        let value: Counter = store.read(&path, Counter::default()).await.unwrap();
        assert_eq!(value, Counter { value: 7 });
        assert!(!lock_path_for(&path).exists());
    }

    #[tokio::test]
    async fn update_applies_mutator_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = LockedJsonStore::new();
        store
            .update(&path, Counter::default(), |c| Counter {
                value: c.value + 1,
            })
            .await
            .unwrap();
        let value: Counter = store.read(&path, Counter::default()).await.unwrap();
        assert_eq!(value.value, 1);
    }

    #[tokio::test]
    async fn concurrent_updates_never_lose_a_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Arc::new(LockedJsonStore::new());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(&path, Counter::default(), |c| Counter {
                        value: c.value + 1,
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let value: Counter = store.read(&path, Counter::default()).await.unwrap();
        assert_eq!(value.value, 20);
    }

    #[tokio::test]
    async fn stale_lock_is_broken_and_acquired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let lock = lock_path_for(&path);
        tokio::fs::write(&lock, b"").await.unwrap();

        let settings = LockSettings {
            deadline: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            stale_after: Duration::from_millis(0),
        };
        let store = LockedJsonStore::with_settings(settings);
        store.write(&path, &Counter { value: 1 }).await.unwrap();
        let value: Counter = store.read(&path, Counter::default()).await.unwrap();
        assert_eq!(value.value, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_lock_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let lock = lock_path_for(&path);
        tokio::fs::write(&lock, b"").await.unwrap();

        let settings = LockSettings {
            deadline: Duration::from_millis(80),
            poll_interval: Duration::from_millis(10),
            stale_after: Duration::from_secs(60),
        };
        let store = LockedJsonStore::with_settings(settings);
        let err = store
            .write(&path, &Counter { value: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout(_)));
    }
}
