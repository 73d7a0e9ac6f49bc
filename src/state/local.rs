//! Filesystem state backend.
//!
//! A state directory (`.halldyll` beside the declaration file unless
//! `state.path` says otherwise) holds `state.json` and, while a pass runs,
//! `state.lock`. The lock file is created with `create_new`, so two
//! processes cannot both win it.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, ensure_owned};
use super::store::StateStore;
use super::types::StateSnapshot;

/// Directory created beside the declaration file.
pub const STATE_DIR: &str = ".halldyll";

const SNAPSHOT_NAME: &str = "state.json";
const LOCK_NAME: &str = "state.lock";

/// State kept in a local directory.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    dir: PathBuf,
}

fn lock_failed(action: &str, err: &std::io::Error) -> StateError {
    StateError::LockFailed {
        message: format!("cannot {action} lock file: {err}"),
    }
}

impl LocalStateStore {
    /// Uses `dir` as the state directory; it is created on first write.
    #[must_use]
    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolves the state directory for a declaration file.
    ///
    /// `custom` is taken relative to the file's directory; without it the
    /// directory is [`STATE_DIR`].
    #[must_use]
    pub fn beside(config_file: &Path, custom: Option<&Path>) -> Self {
        let root = config_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        Self::with_base_dir(root.join(custom.unwrap_or_else(|| Path::new(STATE_DIR))))
    }

    /// The state directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of `state.json`.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_NAME)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_NAME)
    }

    async fn prepare_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            StateError::storage(format!("cannot create {}: {e}", self.dir.display())).into()
        })
    }

    /// Writes `bytes` to `<path>.tmp`, fsyncs, then renames over `path`.
    async fn replace_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        let mut file = fs::File::create(&staging).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&staging, path).await
    }

    async fn current_lock(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(self.lock_path()).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StateError::corrupted(format!("unreadable lock file: {e}")).into()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(lock_failed("read", &e).into()),
        }
    }

    async fn write_new_lock(&self, lock: &LockInfo) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(lock).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path())
            .await?;
        file.write_all(&body).await?;
        file.sync_all().await
    }

    async fn remove_lock(&self) -> Result<()> {
        match fs::remove_file(self.lock_path()).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(lock_failed("remove", &e).into()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let path = self.state_path();
        match fs::read_to_string(&path).await {
            Ok(raw) => {
                info!("Loading state from {}", path.display());
                StateSnapshot::from_json(&raw).map(Some)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state at {}", path.display());
                Ok(None)
            }
            Err(e) => Err(StateError::storage(format!("cannot read {}: {e}", path.display())).into()),
        }
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        self.prepare_dir().await?;

        let path = self.state_path();
        let json = state.to_json()?;
        Self::replace_file(&path, json.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("cannot write {}: {e}", path.display())))?;

        info!("Saved state serial {} to {}", state.serial, path.display());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let path = self.state_path();
        match fs::remove_file(&path).await {
            Ok(()) => info!("Removed {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::storage(format!("cannot remove {}: {e}", path.display())).into()),
        }

        self.remove_lock().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(self.state_path()).await.unwrap_or(false))
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.prepare_dir().await?;
        let lock = LockInfo::new(holder);

        // Second round only happens after an expired lock was cleared.
        for _ in 0..2 {
            let err = match self.write_new_lock(&lock).await {
                Ok(()) => {
                    info!("Locked state as {} ({}s expiry)", lock.holder, LOCK_EXPIRY_SECS);
                    return Ok(lock);
                }
                Err(err) => err,
            };

            if err.kind() != ErrorKind::AlreadyExists {
                return Err(lock_failed("create", &err).into());
            }

            match self.current_lock().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }
                    .into());
                }
                Some(existing) => {
                    warn!("Taking over expired lock of {}", existing.holder);
                    self.remove_lock().await?;
                }
                None => {}
            }
        }

        Err(StateError::LockFailed {
            message: String::from("lock file reappeared while taking over an expired lock"),
        }
        .into())
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.current_lock().await? {
            Some(existing) if existing.is_owned_by(lock_id) => {
                self.remove_lock().await?;
                info!("Unlocked state ({lock_id})");
            }
            Some(existing) => debug!("Lock {lock_id} no longer held; current is {}", existing.lock_id),
            None => {}
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock = ensure_owned(self.current_lock().await?, lock_id)?;
        lock.refresh();

        let body = serde_json::to_vec_pretty(&lock)
            .map_err(|e| StateError::serialization(format!("lock: {e}")))?;
        Self::replace_file(&self.lock_path(), &body)
            .await
            .map_err(|e| lock_failed("rewrite", &e))?;

        debug!("Renewed lock {lock_id} until {}", lock.expires_at.to_rfc3339());
        Ok(lock)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.current_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InfraError;
    use crate::state::ResourceRecord;
    use tempfile::TempDir;

    fn store() -> (LocalStateStore, TempDir) {
        let tmp = TempDir::new().expect("tempdir");
        (LocalStateStore::with_base_dir(tmp.path().join("nested").join("state")), tmp)
    }

    #[tokio::test]
    async fn test_snapshot_survives_a_save() {
        let (store, _tmp) = store();
        let mut state = StateSnapshot::new("web-stack", "dev");
        state.upsert(ResourceRecord::new("network", "vpc", "vpc-1"));

        store.save(&state).await.expect("save");

        assert!(store.exists().await.expect("exists"));
        assert_eq!(store.load().await.expect("load"), Some(state));
        assert!(!store.state_path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_directory_means_no_state() {
        let (store, _tmp) = store();

        assert_eq!(store.load().await.expect("load"), None);
        assert!(!store.exists().await.expect("exists"));
        assert_eq!(store.get_lock_info().await.expect("lock"), None);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_rejected() {
        let (store, _tmp) = store();
        store.prepare_dir().await.expect("dir");
        std::fs::write(store.state_path(), r#"{"version": 1, "records": 5}"#).expect("write");

        let err = store.load().await.expect_err("corrupt state");
        assert!(err.is_state_corrupt());
    }

    #[tokio::test]
    async fn test_lock_round_trip() {
        let (store, _tmp) = store();

        let lock = store.acquire_lock("ci").await.expect("lock");
        assert!(store.is_locked().await.expect("locked"));

        store.release_lock(&lock.lock_id).await.expect("unlock");
        assert!(!store.is_locked().await.expect("locked"));
        assert!(!store.dir().join(LOCK_NAME).exists());
    }

    #[tokio::test]
    async fn test_second_writer_is_refused() {
        let (store, _tmp) = store();
        let _held = store.acquire_lock("first").await.expect("lock");

        let refused = store.acquire_lock("second").await;
        assert!(matches!(
            refused,
            Err(InfraError::State(StateError::LockedByOther { ref holder, .. })) if holder == "first"
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _tmp) = store();
        store.prepare_dir().await.expect("dir");

        let mut stale = LockInfo::new("crashed");
        stale.expires_at = chrono::Utc::now() - chrono::TimeDelta::seconds(5);
        store.write_new_lock(&stale).await.expect("stale lock");

        let lock = store.acquire_lock("fresh").await.expect("takeover");
        assert_eq!(lock.holder, "fresh");
        assert_eq!(
            store.get_lock_info().await.expect("lock").map(|l| l.lock_id),
            Some(lock.lock_id)
        );
    }

    #[tokio::test]
    async fn test_refresh_extends_only_the_owned_lock() {
        let (store, _tmp) = store();
        let mut lock = store.acquire_lock("owner").await.expect("lock");
        lock.expires_at = chrono::Utc::now() + chrono::TimeDelta::seconds(2);
        std::fs::write(store.dir().join(LOCK_NAME), serde_json::to_vec(&lock).expect("json")).expect("shorten");

        let renewed = store.refresh_lock(&lock.lock_id).await.expect("refresh");
        assert!(renewed.expires_at > lock.expires_at);
        assert_eq!(store.get_lock_info().await.expect("lock"), Some(renewed));
        assert!(!store.dir().join("state.lock.tmp").exists());

        let refused = store.refresh_lock("not-the-owner").await;
        assert!(matches!(
            refused,
            Err(InfraError::State(StateError::LockedByOther { ref holder, .. })) if holder == "owner"
        ));

        store.release_lock(&lock.lock_id).await.expect("unlock");
        let gone = store.refresh_lock(&lock.lock_id).await;
        assert!(matches!(gone, Err(InfraError::State(StateError::LockFailed { .. }))));
    }

    #[tokio::test]
    async fn test_foreign_release_keeps_lock() {
        let (store, _tmp) = store();
        let _held = store.acquire_lock("owner").await.expect("lock");

        store.release_lock("not-the-owner").await.expect("no-op");
        assert!(store.is_locked().await.expect("locked"));
    }

    #[test]
    fn test_beside_resolves_against_config_dir() {
        let config = Path::new("/srv/stack/halldyll.infra.yaml");
        assert_eq!(
            LocalStateStore::beside(config, None).dir(),
            Path::new("/srv/stack/.halldyll")
        );
        assert_eq!(
            LocalStateStore::beside(config, Some(Path::new("state/dev"))).dir(),
            Path::new("/srv/stack/state/dev")
        );
        assert_eq!(
            LocalStateStore::beside(Path::new("halldyll.infra.yaml"), None).dir(),
            Path::new("./.halldyll")
        );
    }
}
