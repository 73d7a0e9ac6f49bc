//! Plan executor.
//!
//! Steps run as a dataflow: a step is dispatched once every plan-order
//! predecessor has succeeded, up to a concurrency limit. A failed step
//! skips everything downstream of it and leaves unrelated branches alone.
//! References are resolved right before dispatch, from the outputs of
//! steps that already succeeded or from the records the pass started with.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::{ExecuteError, InfraError, ProviderError, Result};
use crate::graph::{Reference, substitute};
use crate::provider::{Attributes, CreateOutcome, ProviderRegistry, ProviderResult, ResourceProvider};
use crate::state::{ResourceRecord, StateSnapshot, StateStore};

use super::plan::{ActionType, ExecutionPlan, PlanStep};

/// Executor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum number of provider calls in flight.
    pub concurrency: usize,
    /// Retries for transient errors.
    pub max_retries: u32,
    /// First backoff delay.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl From<&ExecutionConfig> for ExecutorConfig {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl ExecutorConfig {
    /// Delay before retry number `attempt` (1-based).
    fn backoff(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let max = self.max_backoff;
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self.initial_backoff.saturating_mul(1u32 << exponent).min(max);

        let spread = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(fastrand::u64(0..=spread));
        let delay = base.saturating_add(jitter);

        match retry_after_secs {
            Some(secs) => delay.max(Duration::from_secs(secs)).min(max),
            None => delay.min(max),
        }
    }
}

/// Cooperative cancellation shared between the caller and the executor.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Final status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// The provider call succeeded.
    Succeeded,
    /// The provider call failed or could not be prepared.
    Failed,
    /// The step never ran.
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one plan step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    /// Position in the plan.
    pub index: usize,
    /// Action performed.
    pub action: ActionType,
    /// Resource name.
    pub name: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Final status.
    pub status: StepStatus,
    /// Failure or skip cause.
    pub error: Option<String>,
    /// Provider calls made.
    pub attempts: u32,
    /// Resulting record for a successful create or update.
    pub record: Option<ResourceRecord>,
}

impl StepResult {
    fn new(index: usize, step: &PlanStep, status: StepStatus) -> Self {
        Self {
            index,
            action: step.action,
            name: step.name.clone(),
            resource_type: step.resource_type.clone(),
            status,
            error: None,
            attempts: 0,
            record: None,
        }
    }

    fn failed(index: usize, step: &PlanStep, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            attempts,
            ..Self::new(index, step, StepStatus::Failed)
        }
    }

    fn skipped(index: usize, step: &PlanStep, cause: impl Into<String>) -> Self {
        Self {
            error: Some(cause.into()),
            ..Self::new(index, step, StepStatus::Skipped)
        }
    }
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// One result per step, in plan order.
    pub results: Vec<StepResult>,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Whether cancellation was requested during the run.
    pub cancelled: bool,
}

impl ExecutionReport {
    fn count(&self, status: StepStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Number of succeeded steps.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(StepStatus::Succeeded)
    }

    /// Number of failed steps.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    /// Number of skipped steps.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    /// Returns true if every step succeeded.
    #[must_use]
    pub fn all_successful(&self) -> bool {
        self.results.iter().all(|r| r.status == StepStatus::Succeeded)
    }

    /// Status of the last step touching `name`.
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<StepStatus> {
        self.results.iter().rev().find(|r| r.name == name).map(|r| r.status)
    }

    /// Wall-clock duration of the run.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// What a provider call produced.
enum Applied {
    Created(CreateOutcome),
    Updated(Attributes),
    Deleted,
}

/// Why a reference could not be resolved.
enum Unresolved {
    /// The target has a step that has not succeeded.
    NotApplied(String),
    /// The target exists but lacks the attribute.
    Missing(String),
}

/// Work handed to a worker task.
struct Dispatch {
    index: usize,
    step: PlanStep,
    attributes: Attributes,
    provider: Arc<dyn ResourceProvider>,
}

/// Outcome of preparing a ready step.
enum Prepared {
    /// Hand the step to a worker.
    Ready(Dispatch),
    /// The step failed before reaching the provider.
    Failed(StepResult),
    /// The step exposed an ordering bug; stop dispatching.
    Fatal(StepResult, InfraError),
}

/// Coordinator bookkeeping for one run.
struct Run<'p> {
    plan: &'p ExecutionPlan,
    slots: Vec<Option<StepResult>>,
    waiting_on: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
    /// Plan index of the create or update step for each name.
    provisioning: HashMap<&'p str, usize>,
    /// Records produced by succeeded steps in this run.
    produced: HashMap<String, ResourceRecord>,
}

impl<'p> Run<'p> {
    fn new(plan: &'p ExecutionPlan) -> Self {
        let n = plan.steps.len();
        let mut dependents = vec![Vec::new(); n];
        let mut waiting_on = vec![0; n];
        let mut provisioning = HashMap::new();

        for (i, step) in plan.steps.iter().enumerate() {
            waiting_on[i] = step.dependencies.len();
            for &dep in &step.dependencies {
                if dep < n {
                    dependents[dep].push(i);
                }
            }
            if step.action != ActionType::Delete {
                provisioning.insert(step.name.as_str(), i);
            }
        }

        let ready = (0..n).filter(|&i| waiting_on[i] == 0).collect();

        Self {
            plan,
            slots: vec![None; n],
            waiting_on,
            dependents,
            ready,
            provisioning,
            produced: HashMap::new(),
        }
    }

    /// Stores a result and releases or skips dependents.
    fn complete(&mut self, result: StepResult) {
        let index = result.index;
        let status = result.status;

        if status == StepStatus::Succeeded {
            if let Some(record) = &result.record {
                self.produced.insert(record.name.clone(), record.clone());
            }
        }
        self.slots[index] = Some(result);

        if status == StepStatus::Succeeded {
            for &dependent in &self.dependents[index] {
                self.waiting_on[dependent] = self.waiting_on[dependent].saturating_sub(1);
                if self.waiting_on[dependent] == 0 && self.slots[dependent].is_none() {
                    self.ready.insert(dependent);
                }
            }
        } else {
            self.skip_downstream(index);
        }
    }

    fn skip_downstream(&mut self, root: usize) {
        let mut queue = vec![root];

        while let Some(index) = queue.pop() {
            let cause = {
                let step = &self.plan.steps[index];
                let status = self.slots[index].as_ref().map_or(StepStatus::Skipped, |r| r.status);
                format!("dependency {} {} was {status}", step.action, step.name)
            };

            for &dependent in &self.dependents[index] {
                if self.slots[dependent].is_none() {
                    let step = &self.plan.steps[dependent];
                    debug!("Skipping {}: {cause}", step.description());
                    self.ready.remove(&dependent);
                    self.slots[dependent] = Some(StepResult::skipped(dependent, step, cause.clone()));
                    queue.push(dependent);
                }
            }
        }
    }

    /// Resolves `ref(...)` expressions in a step's attributes.
    fn resolve(
        &self,
        step: &PlanStep,
        prior: &StateSnapshot,
    ) -> std::result::Result<Attributes, Unresolved> {
        let mut lookup = |reference: &Reference| -> std::result::Result<serde_json::Value, Unresolved> {
            let record = if self.provisioning.contains_key(reference.target.as_str()) {
                self.produced
                    .get(&reference.target)
                    .ok_or_else(|| Unresolved::NotApplied(reference.target.clone()))?
            } else {
                prior.get(&reference.target).ok_or_else(|| {
                    Unresolved::Missing(format!("no recorded resource '{}' for {reference}", reference.target))
                })?
            };

            record
                .output(&reference.attribute)
                .ok_or_else(|| Unresolved::Missing(format!("'{}' has no attribute '{}'", reference.target, reference.attribute)))
        };

        step.attributes
            .iter()
            .map(|(key, value)| Ok((key.clone(), substitute(value, &mut lookup)?)))
            .collect()
    }
}

/// Executor for execution plans.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    providers: ProviderRegistry,
    config: ExecutorConfig,
    cancel: CancelSignal,
}

impl PlanExecutor {
    /// Creates an executor with default tuning.
    #[must_use]
    pub fn new(providers: ProviderRegistry) -> Self {
        Self {
            providers,
            config: ExecutorConfig::default(),
            cancel: CancelSignal::new(),
        }
    }

    /// Sets the executor tuning.
    #[must_use]
    pub const fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses an externally owned cancellation signal.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns a handle that cancels this executor.
    #[must_use]
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Returns the provider registry.
    #[must_use]
    pub const fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Executes a plan and persists the resulting state.
    ///
    /// Step failures are reported, not returned. The snapshot is saved
    /// through `store` before this returns, including when steps failed.
    ///
    /// # Errors
    ///
    /// Returns `ExecuteError::DependencyOrder` if a step referenced a
    /// resource whose step had not succeeded (after draining in-flight
    /// work and saving), or a state error if saving fails.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        state: &mut StateSnapshot,
        store: &dyn StateStore,
    ) -> Result<ExecutionReport> {
        let started_at = Utc::now();
        info!(
            "Executing {} steps (concurrency {})",
            plan.steps.len(),
            self.config.concurrency
        );

        let prior = state.clone();
        let mut run = Run::new(plan);
        let mut workers: JoinSet<StepResult> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut fatal: Option<InfraError> = None;

        loop {
            while fatal.is_none() && !self.cancel.is_cancelled() && workers.len() < self.config.concurrency.max(1) {
                let Some(index) = run.ready.pop_first() else {
                    break;
                };

                match self.prepare(&run, index, &prior) {
                    Prepared::Ready(dispatch) => {
                        debug!("Dispatching {}", dispatch.step.description());
                        let handle = workers.spawn(run_step(dispatch, self.config, self.cancel.clone()));
                        running.insert(handle.id(), index);
                    }
                    Prepared::Failed(result) => {
                        warn!(
                            "{} {}: {}",
                            result.action,
                            result.name,
                            result.error.as_deref().unwrap_or("failed")
                        );
                        run.complete(result);
                    }
                    Prepared::Fatal(result, err) => {
                        error!("{err}");
                        run.complete(result);
                        fatal = Some(err);
                    }
                }
            }

            let Some(joined) = workers.join_next_with_id().await else {
                break;
            };

            match joined {
                Ok((id, result)) => {
                    running.remove(&id);
                    match result.status {
                        StepStatus::Succeeded => info!("{} {}: succeeded", result.action, result.name),
                        _ => warn!(
                            "{} {}: {}",
                            result.action,
                            result.name,
                            result.error.as_deref().unwrap_or("failed")
                        ),
                    }
                    run.complete(result);
                }
                Err(join_err) => match running.remove(&join_err.id()) {
                    Some(index) => {
                        let step = &plan.steps[index];
                        error!("Worker for {} panicked: {join_err}", step.description());
                        run.complete(StepResult::failed(index, step, 1, format!("worker failed: {join_err}")));
                    }
                    None => {
                        fatal.get_or_insert_with(|| InfraError::internal(format!("untracked worker failed: {join_err}")));
                    }
                },
            }
        }

        let cancelled = self.cancel.is_cancelled();
        let results: Vec<StepResult> = run
            .slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    let cause = if cancelled { "cancelled" } else { "halted" };
                    StepResult::skipped(i, &plan.steps[i], cause)
                })
            })
            .collect();

        for result in results.iter().filter(|r| r.status == StepStatus::Succeeded) {
            match (result.action, &result.record) {
                (ActionType::Delete, _) => {
                    state.remove(&result.name);
                }
                (_, Some(record)) => state.upsert(record.clone()),
                (_, None) => {}
            }
        }
        state.touch();
        store.save(state).await?;

        let report = ExecutionReport {
            results,
            started_at,
            finished_at: Utc::now(),
            cancelled,
        };

        info!(
            "Execution finished: {} succeeded, {} failed, {} skipped",
            report.succeeded(),
            report.failed(),
            report.skipped()
        );

        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Resolves a ready step into worker input.
    fn prepare(&self, run: &Run<'_>, index: usize, prior: &StateSnapshot) -> Prepared {
        let step = &run.plan.steps[index];
        let fail = |message: String| Prepared::Failed(StepResult::failed(index, step, 0, message));

        let provider = match self.providers.resolve(&step.resource_type) {
            Ok(provider) => provider,
            Err(e) => return fail(e.to_string()),
        };

        if step.action != ActionType::Create && step.external_id.is_none() {
            return fail(format!("{} has no recorded external id", step.description()));
        }

        match run.resolve(step, prior) {
            Ok(attributes) => Prepared::Ready(Dispatch {
                index,
                step: step.clone(),
                attributes,
                provider,
            }),
            Err(Unresolved::Missing(message)) => fail(message),
            Err(Unresolved::NotApplied(target)) => {
                let err = ExecuteError::DependencyOrder {
                    step: step.name.clone(),
                    target,
                };
                Prepared::Fatal(StepResult::failed(index, step, 0, err.to_string()), err.into())
            }
        }
    }
}

/// Runs one step with retries.
async fn run_step(dispatch: Dispatch, config: ExecutorConfig, cancel: CancelSignal) -> StepResult {
    let Dispatch {
        index,
        step,
        attributes,
        provider,
    } = dispatch;
    let abortable = provider.supports_abort();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let call = call_provider(provider.as_ref(), &step, &attributes);

        let outcome = if abortable {
            tokio::select! {
                outcome = call => outcome,
                () = cancel.cancelled() => {
                    return StepResult::failed(index, &step, attempts, "aborted");
                }
            }
        } else {
            call.await
        };

        let error = match outcome {
            Ok(applied) => return succeeded(index, &step, attributes, applied, attempts),
            Err(ProviderError::NotFound { .. }) if step.action == ActionType::Delete => {
                debug!("{} was already gone", step.description());
                return succeeded(index, &step, attributes, Applied::Deleted, attempts);
            }
            Err(e) => e,
        };

        if !error.is_transient() || attempts > config.max_retries {
            return StepResult::failed(index, &step, attempts, error.to_string());
        }

        let delay = config.backoff(attempts, error.retry_after_secs());
        warn!(
            "{} attempt {attempts} failed ({error}), retrying in {}ms",
            step.description(),
            delay.as_millis()
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                return StepResult::failed(index, &step, attempts, format!("cancelled during retry: {error}"));
            }
        }
    }
}

async fn call_provider(
    provider: &dyn ResourceProvider,
    step: &PlanStep,
    attributes: &Attributes,
) -> ProviderResult<Applied> {
    let external_id = step.external_id.as_deref().unwrap_or_default();

    match step.action {
        ActionType::Create => provider
            .create(&step.resource_type, attributes)
            .await
            .map(Applied::Created),
        ActionType::Update => {
            let changed: Vec<String> = step.changes.iter().map(|c| c.key.clone()).collect();
            provider
                .update(&step.resource_type, external_id, attributes, &changed)
                .await
                .map(Applied::Updated)
        }
        ActionType::Delete => provider
            .delete(&step.resource_type, external_id)
            .await
            .map(|()| Applied::Deleted),
    }
}

fn succeeded(index: usize, step: &PlanStep, attributes: Attributes, applied: Applied, attempts: u32) -> StepResult {
    let record = match applied {
        Applied::Created(outcome) => Some((outcome.external_id, outcome.outputs)),
        Applied::Updated(outputs) => Some((step.external_id.clone().unwrap_or_default(), outputs)),
        Applied::Deleted => None,
    }
    .map(|(external_id, outputs)| {
        let mut record = ResourceRecord::new(&step.name, &step.resource_type, &external_id);
        record.attributes = attributes;
        record.outputs = outputs;
        record.dependencies.clone_from(&step.depends_on);
        record
    });

    StepResult {
        attempts,
        record,
        ..StepResult::new(index, step, StepStatus::Succeeded)
    }
}
