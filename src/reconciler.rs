//! Reconciler driving one pass from declarations to persisted state.
//!
//! A pass runs under the single-writer state lock: load the snapshot,
//! build the graph, diff, plan, and (for apply and destroy) execute, then
//! resolve the stack outputs. The lock is renewed while the pass runs,
//! every save checks it is still held, and it is released on every exit
//! path.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, InfraConfig};
use crate::error::{ExecuteError, PlanError, Result};
use crate::graph::{GraphBuilder, Reference, ResourceGraph, substitute};
use crate::planner::{
    CancelSignal, DiffEngine, DiffResult, ExecutionPlan, ExecutionReport, ExecutorConfig, PlanExecutor,
    Planner, SchemaRegistry,
};
use crate::provider::ProviderRegistry;
use crate::state::{
    HistoryEntry, LOCK_RENEW_SECS, LockedStore, Operation, StateSnapshot, StateStore, generate_holder_id,
};

/// What a pass does after planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Plan,
    Apply,
    PlanDestroy,
    Destroy,
}

impl Mode {
    const fn tears_down(self) -> bool {
        matches!(self, Self::PlanDestroy | Self::Destroy)
    }

    const fn executes(self) -> bool {
        matches!(self, Self::Apply | Self::Destroy)
    }
}

/// Reconciler for one project and environment.
pub struct Reconciler<'a, S: StateStore> {
    /// Configuration.
    config: &'a InfraConfig,
    /// State store.
    state_store: &'a S,
    /// Provider adapters.
    providers: ProviderRegistry,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Planner.
    planner: Planner,
    /// Executor tuning.
    executor_config: ExecutorConfig,
    /// Cancellation shared with the executor.
    cancel: CancelSignal,
    /// Lock holder identity.
    holder: String,
    /// Fingerprint the plan must still have when it is executed.
    expected_plan: Option<String>,
    /// Interval between lock renewals.
    lock_renewal: Duration,
}

/// Result of a reconciliation pass.
#[derive(Debug, serde::Serialize)]
pub struct ReconciliationResult {
    /// Per-resource classification.
    pub diff: DiffResult,
    /// The ordered plan.
    pub plan: ExecutionPlan,
    /// Execution outcome, absent for plan-only passes.
    pub report: Option<ExecutionReport>,
    /// Whether the declarations differ from the last fully applied ones.
    pub config_changed: bool,
    /// Stack outputs as recorded after the pass.
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl ReconciliationResult {
    /// Returns true if nothing failed.
    #[must_use]
    pub fn success(&self) -> bool {
        self.report.as_ref().is_none_or(ExecutionReport::all_successful)
    }
}

impl<'a, S: StateStore> Reconciler<'a, S> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(config: &'a InfraConfig, state_store: &'a S, providers: ProviderRegistry) -> Self {
        Self {
            config,
            state_store,
            providers,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(SchemaRegistry::from_config(&config.schemas)),
            planner: Planner::new(),
            executor_config: ExecutorConfig::from(&config.execution),
            cancel: CancelSignal::new(),
            holder: generate_holder_id(),
            expected_plan: None,
            lock_renewal: Duration::from_secs(LOCK_RENEW_SECS),
        }
    }

    /// Overrides the executor tuning taken from the configuration.
    #[must_use]
    pub const fn with_executor_config(mut self, executor_config: ExecutorConfig) -> Self {
        self.executor_config = executor_config;
        self
    }

    /// Uses an externally owned cancellation signal.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the lock holder identity.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Refuses to execute unless the plan computed under the lock has
    /// `fingerprint`, the one the operator reviewed.
    #[must_use]
    pub fn with_expected_plan(mut self, fingerprint: impl Into<String>) -> Self {
        self.expected_plan = Some(fingerprint.into());
        self
    }

    /// Renews the lock every `every` instead of every [`LOCK_RENEW_SECS`].
    #[must_use]
    pub fn with_lock_renewal(mut self, every: Duration) -> Self {
        self.lock_renewal = every.max(Duration::from_millis(1));
        self
    }

    /// Computes the plan without side effects.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere, state cannot be
    /// loaded, or the graph or plan is invalid.
    pub async fn plan(&self) -> Result<ReconciliationResult> {
        self.run(Mode::Plan).await
    }

    /// Computes the destroy plan without side effects.
    ///
    /// # Errors
    ///
    /// Same as [`Reconciler::plan`].
    pub async fn plan_destroy(&self) -> Result<ReconciliationResult> {
        self.run(Mode::PlanDestroy).await
    }

    /// Applies the declarations.
    ///
    /// Step failures are reported in the result; state is saved either way.
    ///
    /// # Errors
    ///
    /// Returns an error on any pre-execution failure, a missing provider,
    /// a plan that no longer matches the expected fingerprint, an execution
    /// ordering fault, a lost lock, or a state save failure.
    pub async fn apply(&self) -> Result<ReconciliationResult> {
        self.run(Mode::Apply).await
    }

    /// Deletes every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Same as [`Reconciler::apply`].
    pub async fn destroy(&self) -> Result<ReconciliationResult> {
        self.run(Mode::Destroy).await
    }

    async fn run(&self, mode: Mode) -> Result<ReconciliationResult> {
        let lock = self.state_store.acquire_lock(&self.holder).await?;
        debug!("Acquired state lock {}", lock.lock_id);
        let store = LockedStore::new(self.state_store, &lock);

        let pass = self.run_locked(mode, &store);
        tokio::pin!(pass);
        let mut renewal = interval_at(Instant::now() + self.lock_renewal, self.lock_renewal);

        let result = loop {
            tokio::select! {
                result = &mut pass => break result,
                _ = renewal.tick() => match store.renew().await {
                    Ok(renewed) => debug!("Renewed state lock until {}", renewed.expires_at.to_rfc3339()),
                    Err(e) => warn!("Failed to renew state lock {}: {e}", store.lock_id()),
                },
            }
        };

        if let Err(e) = self.state_store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }

        result
    }

    async fn run_locked(&self, mode: Mode, store: &LockedStore<'_, S>) -> Result<ReconciliationResult> {
        let project = &self.config.project;
        info!("Reconciling {}/{} ({mode:?})", project.name, project.environment);

        let mut state = store
            .load()
            .await?
            .unwrap_or_else(|| StateSnapshot::new(&project.name, &project.environment));

        let (graph, config_hash) = if mode.tears_down() {
            (ResourceGraph::empty(), String::new())
        } else {
            (
                GraphBuilder::new().build(&self.config.resources)?,
                self.hasher.hash_declarations(&self.config.resources),
            )
        };
        let config_changed = state.config_hash != config_hash;

        let diff = self.diff_engine.compute(&graph, Some(&state))?;
        info!("Diff: {}", diff.summary());

        let plan = self.planner.plan(&diff, &graph, Some(&state))?;

        if !mode.executes() {
            return Ok(ReconciliationResult {
                diff,
                plan,
                report: None,
                config_changed,
                outputs: state.outputs,
            });
        }

        if let Some(expected) = self.expected_plan.as_ref().filter(|e| **e != plan.fingerprint) {
            return Err(PlanError::Stale {
                expected: expected.clone(),
                actual: plan.fingerprint,
            }
            .into());
        }

        self.check_coverage(&plan)?;

        let operation = if mode.tears_down() {
            Operation::Destroy
        } else {
            Operation::Apply
        };
        let resources: Vec<String> = plan
            .steps
            .iter()
            .map(|s| s.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if plan.is_empty() {
            info!("No changes required - state is converged");
            let outputs = self.resolve_outputs(mode, &state);
            if config_changed || outputs != state.outputs {
                state.config_hash = config_hash;
                state.outputs = outputs;
                state.touch();
                store.save(&state).await?;
            }
            return Ok(ReconciliationResult {
                diff,
                plan,
                report: None,
                config_changed,
                outputs: state.outputs,
            });
        }

        let executor = PlanExecutor::new(self.providers.clone())
            .with_config(self.executor_config)
            .with_cancel(self.cancel.clone());

        let report = match executor.execute(&plan, &mut state, store).await {
            Ok(report) => report,
            Err(err) => {
                state.add_history(HistoryEntry::failed(operation, &config_hash, resources, &err.to_string()));
                if let Err(save_err) = store.save(&state).await {
                    warn!("Failed to record history: {save_err}");
                }
                return Err(err);
            }
        };

        if report.all_successful() {
            state.config_hash.clone_from(&config_hash);
            state.add_history(HistoryEntry::new(operation, &config_hash, resources));
        } else {
            let message = if report.cancelled {
                ExecuteError::Aborted {
                    reason: format!("{} of {} steps skipped", report.skipped(), report.results.len()),
                }
                .to_string()
            } else {
                format!(
                    "{} failed, {} skipped of {} steps",
                    report.failed(),
                    report.skipped(),
                    report.results.len()
                )
            };
            state.add_history(HistoryEntry::failed(operation, &config_hash, resources, &message));
        }
        state.outputs = self.resolve_outputs(mode, &state);
        store.save(&state).await?;

        Ok(ReconciliationResult {
            diff,
            plan,
            report: Some(report),
            config_changed,
            outputs: state.outputs,
        })
    }

    /// Evaluates the declared outputs against recorded resources.
    ///
    /// An output whose resource is not recorded (a failed create) is left
    /// out. Destroy leaves nothing to report.
    fn resolve_outputs(&self, mode: Mode, state: &StateSnapshot) -> BTreeMap<String, serde_json::Value> {
        if mode.tears_down() {
            return BTreeMap::new();
        }

        let mut lookup = |r: &Reference| {
            state
                .get(&r.target)
                .and_then(|record| record.output(&r.attribute))
                .ok_or_else(|| r.to_string())
        };

        let mut outputs = BTreeMap::new();
        for (name, expression) in &self.config.outputs {
            match substitute(expression, &mut lookup) {
                Ok(value) => {
                    outputs.insert(name.clone(), value);
                }
                Err(missing) => warn!("Output {name} is unavailable: {missing} is not recorded"),
            }
        }
        outputs
    }

    /// Ensures every planned step has an adapter before anything runs.
    fn check_coverage(&self, plan: &ExecutionPlan) -> Result<()> {
        match plan.steps.iter().find(|s| !self.providers.supports(&s.resource_type)) {
            Some(step) => Err(PlanError::MissingProvider {
                resource: step.name.clone(),
                resource_type: step.resource_type.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success() { "successful" } else { "failed" };
        writeln!(f, "Reconciliation {status}:")?;
        writeln!(f, "  Created: {}", self.diff.creates)?;
        writeln!(f, "  Updated: {}", self.diff.updates)?;
        writeln!(f, "  Replaced: {}", self.diff.replaces)?;
        writeln!(f, "  Deleted: {}", self.diff.deletes)?;
        writeln!(f, "  Unchanged: {}", self.diff.unchanged)?;

        if let Some(report) = &self.report {
            let errors: Vec<_> = report.results.iter().filter(|r| r.error.is_some()).collect();
            if !errors.is_empty() {
                writeln!(f, "  Errors:")?;
                for result in errors {
                    writeln!(
                        f,
                        "    - {} {}: {}",
                        result.action,
                        result.name,
                        result.error.as_deref().unwrap_or_default()
                    )?;
                }
            }
        }

        if !self.outputs.is_empty() {
            writeln!(f, "  Outputs:")?;
            for (name, value) in &self.outputs {
                match value {
                    serde_json::Value::String(text) => writeln!(f, "    {name} = {text}")?,
                    other => writeln!(f, "    {name} = {other}")?,
                }
            }
        }

        Ok(())
    }
}
