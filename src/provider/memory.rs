//! In-process simulated cloud.
//!
//! `MemoryProvider` keeps resources in a map, hands out sequential ids, and
//! echoes attributes back as outputs next to a computed `arn` and
//! `dns_name`. Failures and latency can be scripted, which makes it the
//! adapter of choice for dry runs and tests.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ProviderError;

use super::adapter::{
    Attributes, CreateOutcome, ProviderOperation, ProviderResult, ResourceProvider,
};

/// A resource held by the simulated cloud.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredResource {
    /// Resource type tag.
    pub resource_type: String,
    /// Current attributes.
    pub attributes: Attributes,
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCall {
    /// Operation performed.
    pub operation: ProviderOperation,
    /// Resource type tag.
    pub resource_type: String,
    /// Target id for update and delete.
    pub external_id: Option<String>,
    /// Attributes sent with create and update.
    pub attributes: Option<Attributes>,
}

/// A scripted failure.
#[derive(Debug, Clone)]
struct FailureRule {
    operation: Option<ProviderOperation>,
    resource_type: String,
    error: ProviderError,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, StoredResource>,
    calls: Vec<ProviderCall>,
    failures: Vec<FailureRule>,
    next_id: u64,
}

/// Simulated cloud provider.
#[derive(Debug)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    latency: Duration,
    abortable: bool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when a call ends or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryProvider {
    /// Creates an empty simulated cloud.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            latency: Duration::ZERO,
            abortable: true,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Adds a fixed delay to every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sets whether in-flight calls may be aborted.
    #[must_use]
    pub const fn with_abort_support(mut self, abortable: bool) -> Self {
        self.abortable = abortable;
        self
    }

    /// Fails every call on `resource_type` with `error`.
    pub fn fail_always(&self, resource_type: &str, error: ProviderError) {
        self.push_rule(None, resource_type, error, None);
    }

    /// Fails the next `times` calls of `operation` on `resource_type`.
    pub fn fail_times(&self, operation: ProviderOperation, resource_type: &str, error: ProviderError, times: u32) {
        self.push_rule(Some(operation), resource_type, error, Some(times));
    }

    fn push_rule(
        &self,
        operation: Option<ProviderOperation>,
        resource_type: &str,
        error: ProviderError,
        remaining: Option<u32>,
    ) {
        self.lock().failures.push(FailureRule {
            operation,
            resource_type: resource_type.to_string(),
            error,
            remaining,
        });
    }

    /// Inserts a resource directly, as if created out of band.
    pub fn seed(&self, external_id: &str, resource_type: &str, attributes: Attributes) {
        self.lock().resources.insert(
            external_id.to_string(),
            StoredResource {
                resource_type: resource_type.to_string(),
                attributes,
            },
        );
    }

    /// Returns a copy of every stored resource keyed by id.
    #[must_use]
    pub fn resources(&self) -> BTreeMap<String, StoredResource> {
        self.lock().resources.clone()
    }

    /// Returns every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Returns the highest number of concurrent calls observed.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned map is still consistent; every mutation is a single insert or remove
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Records the call, then waits out the configured latency.
    async fn enter(&self, call: ProviderCall) -> ProviderResult<InFlight<'_>> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let scripted = {
            let mut inner = self.lock();
            let failure = take_failure(&mut inner.failures, call.operation, &call.resource_type);
            inner.calls.push(call);
            failure
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match scripted {
            Some(error) => Err(error),
            None => Ok(guard),
        }
    }
}

fn take_failure(
    rules: &mut Vec<FailureRule>,
    operation: ProviderOperation,
    resource_type: &str,
) -> Option<ProviderError> {
    let index = rules.iter().position(|rule| {
        rule.resource_type == resource_type && rule.operation.is_none_or(|op| op == operation)
    })?;

    let rule = &mut rules[index];
    let error = rule.error.clone();
    let exhausted = match rule.remaining.as_mut() {
        Some(n) => {
            *n = n.saturating_sub(1);
            *n == 0
        }
        None => false,
    };
    if exhausted {
        rules.remove(index);
    }
    Some(error)
}

#[async_trait]
impl ResourceProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_abort(&self) -> bool {
        self.abortable
    }

    async fn create(&self, resource_type: &str, attributes: &Attributes) -> ProviderResult<CreateOutcome> {
        let _guard = self
            .enter(ProviderCall {
                operation: ProviderOperation::Create,
                resource_type: resource_type.to_string(),
                external_id: None,
                attributes: Some(attributes.clone()),
            })
            .await?;

        let mut inner = self.lock();
        inner.next_id += 1;
        let external_id = format!("{resource_type}-{:04}", inner.next_id);

        inner.resources.insert(
            external_id.clone(),
            StoredResource {
                resource_type: resource_type.to_string(),
                attributes: attributes.clone(),
            },
        );
        debug!("memory: created {external_id}");

        let outputs = computed_outputs(resource_type, &external_id, attributes);
        Ok(CreateOutcome { external_id, outputs })
    }

    async fn update(
        &self,
        resource_type: &str,
        external_id: &str,
        attributes: &Attributes,
        changed: &[String],
    ) -> ProviderResult<Attributes> {
        let _guard = self
            .enter(ProviderCall {
                operation: ProviderOperation::Update,
                resource_type: resource_type.to_string(),
                external_id: Some(external_id.to_string()),
                attributes: Some(attributes.clone()),
            })
            .await?;

        let mut inner = self.lock();
        let Some(stored) = inner.resources.get_mut(external_id) else {
            return Err(ProviderError::NotFound {
                external_id: external_id.to_string(),
            });
        };
        stored.attributes.clone_from(attributes);
        trace!("memory: updated {external_id} ({} changed)", changed.len());

        Ok(computed_outputs(resource_type, external_id, attributes))
    }

    async fn delete(&self, resource_type: &str, external_id: &str) -> ProviderResult<()> {
        let _guard = self
            .enter(ProviderCall {
                operation: ProviderOperation::Delete,
                resource_type: resource_type.to_string(),
                external_id: Some(external_id.to_string()),
                attributes: None,
            })
            .await?;

        if self.lock().resources.remove(external_id).is_none() {
            return Err(ProviderError::NotFound {
                external_id: external_id.to_string(),
            });
        }
        debug!("memory: deleted {external_id}");
        Ok(())
    }
}

/// Echoed attributes plus the values a cloud would compute.
fn computed_outputs(resource_type: &str, external_id: &str, attributes: &Attributes) -> Attributes {
    let mut outputs = attributes.clone();
    outputs.insert(
        String::from("arn"),
        serde_json::Value::String(format!("arn:memory:{resource_type}/{external_id}")),
    );
    outputs.insert(
        String::from("dns_name"),
        serde_json::Value::String(format!("{}.memory.internal", external_id.replace('_', "-"))),
    );
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> Attributes {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let provider = MemoryProvider::new();

        let created = provider
            .create("vpc", &attrs(&[("cidr", json!("10.0.0.0/16"))]))
            .await
            .expect("create");
        assert_eq!(created.external_id, "vpc-0001");
        assert_eq!(created.outputs["cidr"], json!("10.0.0.0/16"));
        assert_eq!(created.outputs["arn"], json!("arn:memory:vpc/vpc-0001"));
        assert_eq!(created.outputs["dns_name"], json!("vpc-0001.memory.internal"));

        let outputs = provider
            .update(
                "vpc",
                &created.external_id,
                &attrs(&[("cidr", json!("10.1.0.0/16"))]),
                &[String::from("cidr")],
            )
            .await
            .expect("update");
        assert_eq!(outputs["cidr"], json!("10.1.0.0/16"));

        provider.delete("vpc", &created.external_id).await.expect("delete");
        assert!(provider.resources().is_empty());
        assert_eq!(provider.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let provider = MemoryProvider::new();
        let err = provider.delete("vpc", "vpc-9999").await.expect_err("missing");
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let provider = MemoryProvider::new();
        provider.fail_times(ProviderOperation::Create, "vpc", ProviderError::network("reset"), 2);
        provider.fail_always("bucket", ProviderError::api(400, "bad name"));

        assert!(provider.create("vpc", &Attributes::new()).await.is_err());
        assert!(provider.create("vpc", &Attributes::new()).await.is_err());
        assert!(provider.create("vpc", &Attributes::new()).await.is_ok());

        for _ in 0..3 {
            assert_eq!(
                provider.create("bucket", &Attributes::new()).await,
                Err(ProviderError::api(400, "bad name"))
            );
        }
    }

    #[tokio::test]
    async fn test_seeded_resources_can_be_deleted() {
        let provider = MemoryProvider::new();
        provider.seed("legacy-1", "vpc", Attributes::new());

        provider.delete("vpc", "legacy-1").await.expect("delete seeded");
        assert_eq!(provider.calls()[0].operation, ProviderOperation::Delete);
    }
}
