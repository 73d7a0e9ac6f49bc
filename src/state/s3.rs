//! S3 state backend.
//!
//! The snapshot and the lock are two objects under one key prefix. The lock
//! object is written with `If-None-Match: *`, which S3 turns into an atomic
//! create.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, ensure_owned};
use super::store::StateStore;
use super::types::StateSnapshot;

/// Objects kept under the prefix.
#[derive(Debug, Clone, Copy)]
enum Object {
    Snapshot,
    Lock,
}

impl Object {
    const fn file_name(self) -> &'static str {
        match self {
            Self::Snapshot => "state.json",
            Self::Lock => "state.lock",
        }
    }
}

/// State kept in an S3 (or S3-compatible) bucket.
#[derive(Debug, Clone)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3StateStore {
    /// Connects with the default AWS credential chain.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_owned()));
        }

        Self::with_client(Client::new(&loader.load().await), bucket, prefix)
    }

    /// Uses an already configured client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_owned(),
            prefix: key_prefix(prefix),
        }
    }

    fn key(&self, object: Object) -> String {
        format!("{}{}", self.prefix, object.file_name())
    }

    fn location(&self, object: Object) -> String {
        format!("s3://{}/{}", self.bucket, self.key(object))
    }

    async fn fetch(&self, object: Object) -> Result<Option<String>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(object))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let err = err.into_service_error();
                return if err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("get {}: {err}", self.location(object))).into())
                };
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StateError::s3(format!("read {}: {e}", self.location(object))))?
            .into_bytes();

        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| StateError::corrupted(format!("{} is not UTF-8: {e}", self.location(object))).into())
    }

    async fn upload(&self, object: Object, body: String) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(object))
            .content_type("application/json")
            .body(ByteStream::from(body.into_bytes()))
            .send()
            .await
            .map_err(|e| StateError::s3(format!("put {}: {e}", self.location(object))))?;
        Ok(())
    }

    /// Creates the object unless it exists; `false` means someone else won.
    async fn create(&self, object: Object, body: String) -> Result<bool> {
        let outcome = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(object))
            .if_none_match("*")
            .content_type("application/json")
            .body(ByteStream::from(body.into_bytes()))
            .send()
            .await;

        match outcome {
            Ok(_) => Ok(true),
            Err(err) if err.raw_response().is_some_and(|r| r.status().as_u16() == 412) => Ok(false),
            Err(err) => Err(StateError::LockFailed {
                message: format!("conditional put {}: {err}", self.location(object)),
            }
            .into()),
        }
    }

    async fn remove(&self, object: Object) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(object))
            .send()
            .await
            .map_err(|e| StateError::s3(format!("delete {}: {e}", self.location(object))))?;
        Ok(())
    }

    async fn current_lock(&self) -> Result<Option<LockInfo>> {
        self.fetch(Object::Lock).await?.as_deref().map(decode_lock).transpose()
    }
}

/// `None`, `""` and `"/"` mean the bucket root; anything else ends in `/`.
fn key_prefix(prefix: Option<&str>) -> String {
    match prefix.map(|p| p.trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{p}/"),
        _ => String::new(),
    }
}

fn decode_lock(raw: &str) -> Result<LockInfo> {
    serde_json::from_str(raw).map_err(|e| StateError::corrupted(format!("unreadable lock object: {e}")).into())
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        debug!("Loading state from {}", self.location(Object::Snapshot));

        match self.fetch(Object::Snapshot).await? {
            Some(raw) => {
                let state = StateSnapshot::from_json(&raw)?;
                info!("Loaded {}/{} state serial {}", state.project, state.environment, state.serial);
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        self.upload(Object::Snapshot, state.to_json()?).await?;
        info!("Saved state serial {} to {}", state.serial, self.location(Object::Snapshot));
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.remove(Object::Snapshot).await?;
        self.remove(Object::Lock).await?;
        info!("Removed {}", self.location(Object::Snapshot));
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(Object::Snapshot))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("head {}: {err}", self.location(Object::Snapshot))).into())
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock = LockInfo::new(holder);
        let body = serde_json::to_string_pretty(&lock)
            .map_err(|e| StateError::serialization(format!("lock: {e}")))?;

        // Second round only happens after an expired lock was cleared.
        for _ in 0..2 {
            if self.create(Object::Lock, body.clone()).await? {
                info!("Locked state as {} ({}s expiry)", lock.holder, LOCK_EXPIRY_SECS);
                return Ok(lock);
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
                    self.remove(Object::Lock).await?;
                }
                None => {}
            }
        }

        Err(StateError::LockFailed {
            message: String::from("lock object reappeared while taking over an expired lock"),
        }
        .into())
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.current_lock().await? {
            Some(existing) if existing.is_owned_by(lock_id) => {
                self.remove(Object::Lock).await?;
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

        let body = serde_json::to_string_pretty(&lock)
            .map_err(|e| StateError::serialization(format!("lock: {e}")))?;
        self.upload(Object::Lock, body).await?;

        debug!("Renewed lock {lock_id} until {}", lock.expires_at.to_rfc3339());
        Ok(lock)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.current_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_store(prefix: Option<&str>) -> S3StateStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("eu-west-1"))
            .build();
        S3StateStore::with_client(Client::from_conf(config), "infra-state", prefix)
    }

    #[test]
    fn test_key_prefix() {
        assert_eq!(key_prefix(None), "");
        assert_eq!(key_prefix(Some("")), "");
        assert_eq!(key_prefix(Some("/")), "");
        assert_eq!(key_prefix(Some("web-stack/prod")), "web-stack/prod/");
        assert_eq!(key_prefix(Some("/web-stack/prod/")), "web-stack/prod/");
    }

    #[test]
    fn test_object_locations() {
        let store = offline_store(Some("/web-stack/"));
        assert_eq!(store.key(Object::Snapshot), "web-stack/state.json");
        assert_eq!(store.location(Object::Lock), "s3://infra-state/web-stack/state.lock");
        assert_eq!(store.backend_type(), "s3");
    }

    #[test]
    fn test_decode_lock() {
        assert!(decode_lock("{").is_err_and(|e| e.is_state_corrupt()));

        let lock = LockInfo::new("ci");
        let raw = serde_json::to_string(&lock).expect("serialize");
        assert_eq!(decode_lock(&raw).expect("decode"), lock);
    }
}
