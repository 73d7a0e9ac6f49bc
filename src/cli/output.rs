//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{InfraConfig, ValidationResult};
use crate::graph::ResourceGraph;
use crate::planner::{
    ActionType, DiffResult, DiffType, ExecutionPlan, ExecutionReport, ResourceDiff, StepStatus,
};
use crate::reconciler::ReconciliationResult;
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "After")]
    after: String,
}

/// Step result row for table display.
#[derive(Tabled)]
struct StepResultRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Graph node row for table display.
#[derive(Tabled)]
struct GraphRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Resource")]
    address: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn json<T: Serialize + ?Sized>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, config: &InfraConfig, result: &ValidationResult, warnings: bool) -> String {
        if self.is_json() {
            return Self::json(&serde_json::json!({
                "valid": result.is_valid(),
                "project": config.project.name,
                "environment": config.project.environment,
                "resources": config.resource_count(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            }));
        }

        let mut output = String::new();
        if result.is_valid() {
            let _ = writeln!(output, "{} Configuration is valid", "✓".green());
        } else {
            let _ = writeln!(output, "{} Configuration is invalid:", "✗".red());
            for error in &result.errors {
                let _ = writeln!(output, "   - {error}");
            }
        }

        if warnings && !result.warnings.is_empty() {
            let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
            for warning in &result.warnings {
                let _ = writeln!(output, "   - {warning}");
            }
        }

        let _ = writeln!(output, "\nConfiguration summary:");
        let _ = writeln!(output, "   Project: {}", config.project.name);
        let _ = writeln!(output, "   Environment: {}", config.project.environment);
        let _ = writeln!(output, "   Resources: {}", config.resource_count());
        let _ = writeln!(output, "   Providers: {}", config.providers.len());
        output
    }

    /// Formats the resource graph in dependency order.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph, order: &[String]) -> String {
        let nodes: Vec<_> = order.iter().filter_map(|name| graph.get(name)).collect();

        if self.is_json() {
            return Self::json(&nodes);
        }

        if nodes.is_empty() {
            return String::from("   No resources declared.\n");
        }

        let rows: Vec<GraphRow> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| GraphRow {
                index: i + 1,
                address: node.address(),
                dependencies: node.dependencies().into_iter().collect::<Vec<_>>().join(", "),
            })
            .collect();

        format!("{}\n", Table::new(rows))
    }

    /// Formats a plan, optionally with attribute-level changes.
    #[must_use]
    pub fn format_plan(&self, diff: &DiffResult, plan: &ExecutionPlan, detailed: bool) -> String {
        if self.is_json() {
            return Self::json(&serde_json::json!({ "diff": diff, "plan": plan }));
        }

        if plan.is_empty() {
            return format!("{} No changes required - infrastructure is up to date.\n", "✓".green());
        }

        let mut output = String::new();
        let _ = write!(output, "\nExecution Plan\n");
        let _ = write!(output, "   Fingerprint: {}\n\n", Self::truncate(&plan.fingerprint, 8));

        let rows: Vec<PlanStepRow> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| PlanStepRow {
                index: i,
                action: Self::format_action(s.action, s.replacement),
                resource: format!("{}.{}", s.resource_type, s.name),
                id: s.external_id.as_deref().map_or_else(String::new, |id| Self::truncate(id, 20)),
                after: s.dependencies.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for resource in diff.diffs.iter().filter(|d| d.diff_type != DiffType::NoOp) {
                Self::write_diff(&mut output, resource);
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            diff.creates.to_string().green(),
            diff.updates.to_string().yellow(),
            diff.replaces.to_string().magenta(),
            diff.deletes.to_string().red()
        );

        output
    }

    fn write_diff(output: &mut String, diff: &ResourceDiff) {
        let marker = match diff.diff_type {
            DiffType::Create => "+".green(),
            DiffType::Update => "~".yellow(),
            DiffType::Delete => "-".red(),
            DiffType::Replace => "-/+".magenta(),
            DiffType::NoOp => " ".normal(),
        };
        let _ = writeln!(output, "   {marker} {}.{}", diff.resource_type, diff.name);

        for change in &diff.changes {
            let old = change.old.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string);
            let new = change.new.as_ref().map_or_else(|| String::from("(removed)"), ToString::to_string);
            let forces = if change.forces_replacement {
                format!(" {}", "(forces replacement)".red())
            } else {
                String::new()
            };
            let _ = writeln!(output, "       {}: {old} -> {new}{forces}", change.key);
        }
    }

    /// Formats an execution report.
    #[must_use]
    pub fn format_report(&self, report: &ExecutionReport) -> String {
        if self.is_json() {
            return Self::json(report);
        }

        let rows: Vec<StepResultRow> = report
            .results
            .iter()
            .map(|r| StepResultRow {
                index: r.index,
                action: r.action.to_string(),
                resource: format!("{}.{}", r.resource_type, r.name),
                status: Self::format_status(r.status),
                attempts: r.attempts,
                detail: r.error.as_deref().map_or_else(String::new, |e| Self::truncate(e, 60)),
            })
            .collect();

        let mut output = format!("{}\n", Table::new(rows));
        let _ = write!(
            output,
            "\n{} succeeded, {} failed, {} skipped in {}ms",
            report.succeeded().to_string().green(),
            report.failed().to_string().red(),
            report.skipped().to_string().yellow(),
            report.duration().num_milliseconds()
        );
        if report.cancelled {
            let _ = write!(output, " ({})", "cancelled".yellow());
        }
        output.push('\n');
        output
    }

    /// Formats a reconciliation result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        if self.is_json() {
            return Self::json(result);
        }

        let mut output = match &result.report {
            Some(report) => self.format_report(report),
            None => String::new(),
        };

        let status = if result.success() {
            format!("{} Reconciliation successful", "✓".green())
        } else {
            format!("{} Reconciliation failed", "✗".red())
        };
        let _ = writeln!(output, "\n{status}: {}", result.diff.summary());
        Self::write_outputs(&mut output, &result.outputs);
        output
    }

    /// Formats persisted state.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        if self.is_json() {
            return Self::json(state);
        }

        let mut output = String::new();
        let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
        let _ = writeln!(output, "   Version: {}", state.version);
        let _ = writeln!(output, "   Serial: {}", state.serial);
        let _ = writeln!(output, "   Lineage: {}", state.lineage);
        let _ = writeln!(output, "   Config hash: {}", Self::truncate(&state.config_hash, 8));
        let _ = writeln!(output, "   Last updated: {}", state.last_updated);
        let _ = writeln!(output, "   Resources: {}\n", state.records.len());

        if !state.records.is_empty() {
            let rows: Vec<RecordRow> = state
                .records
                .values()
                .map(|r| RecordRow {
                    name: r.name.clone(),
                    resource_type: r.resource_type.clone(),
                    id: Self::truncate(&r.external_id, 24),
                    dependencies: r.dependencies.iter().cloned().collect::<Vec<_>>().join(", "),
                    updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                })
                .collect();
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if !state.history.is_empty() {
            let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
            for entry in state.history.iter().rev().take(5) {
                let status = if entry.success { "✓".green() } else { "✗".red() };
                let _ = write!(
                    output,
                    "     {status} {} - {} ({})",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.operation,
                    entry.resources.join(", ")
                );
                if let Some(error) = &entry.error {
                    let _ = write!(output, ": {error}");
                }
                output.push('\n');
            }
        }

        Self::write_outputs(&mut output, &state.outputs);
        output
    }

    /// Appends stack outputs; strings are shown without quotes.
    fn write_outputs(output: &mut String, outputs: &BTreeMap<String, serde_json::Value>) {
        if outputs.is_empty() {
            return;
        }

        let _ = writeln!(output, "\nOutputs:");
        for (name, value) in outputs {
            let shown = value.as_str().map_or_else(|| value.to_string(), str::to_owned);
            let _ = writeln!(output, "   {} = {shown}", name.bold());
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        if self.is_json() {
            return Self::json(&lock);
        }

        match lock {
            None => String::from("State is not locked.\n"),
            Some(lock) if lock.is_expired() => format!(
                "State lock {} held by {} expired at {}\n",
                lock.lock_id, lock.holder, lock.expires_at
            ),
            Some(lock) => format!(
                "State locked by {} since {} (lock {}, {}s remaining)\n",
                lock.holder,
                lock.acquired_at,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats an action with color.
    fn format_action(action: ActionType, replacement: bool) -> String {
        match (action, replacement) {
            (ActionType::Create, false) => "+create".green().to_string(),
            (ActionType::Create, true) => "+create (replace)".magenta().to_string(),
            (ActionType::Update, _) => "~update".yellow().to_string(),
            (ActionType::Delete, false) => "-delete".red().to_string(),
            (ActionType::Delete, true) => "-delete (replace)".magenta().to_string(),
        }
    }

    /// Formats a step status with color.
    fn format_status(status: StepStatus) -> String {
        match status {
            StepStatus::Succeeded => "succeeded".green().to_string(),
            StepStatus::Failed => "failed".red().to_string(),
            StepStatus::Skipped => "skipped".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDeclaration;
    use crate::graph::GraphBuilder;
    use crate::planner::{DiffEngine, Planner};

    fn network_plan() -> (DiffResult, ExecutionPlan) {
        let decls: BTreeMap<String, ResourceDeclaration> = [
            (String::from("network"), ResourceDeclaration::new("vpc")),
            (
                String::from("server"),
                ResourceDeclaration::new("instance").with_attribute("subnet", "ref(network.id)"),
            ),
        ]
        .into_iter()
        .collect();
        let graph = GraphBuilder::new().build(&decls).expect("graph");
        let diff = DiffEngine::default().compute(&graph, None).expect("diff");
        let plan = Planner::new().plan(&diff, &graph, None).expect("plan");
        (diff, plan)
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a-very-long-identifier", 10), "a-very-...");
    }

    #[test]
    fn test_plan_text_lists_steps_and_unknowns() {
        colored::control::set_override(false);
        let (diff, plan) = network_plan();
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&diff, &plan, true);

        assert!(text.contains("vpc.network"));
        assert!(text.contains("instance.server"));
        assert!(text.contains("subnet: (none) -> (known after apply)"));
        assert!(text.contains("Plan: 2 to create, 0 to update, 0 to replace, 0 to destroy"));
    }

    #[test]
    fn test_plan_json_is_parseable() {
        let (diff, plan) = network_plan();
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&diff, &plan, false);
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");

        assert_eq!(value["plan"]["steps"][1]["name"], "server");
        assert_eq!(value["plan"]["steps"][1]["dependencies"][0], 0);
        assert_eq!(value["diff"]["creates"], 2);
    }

    #[test]
    fn test_state_shows_outputs() {
        colored::control::set_override(false);
        let mut state = StateSnapshot::new("web-stack", "dev");
        state
            .outputs
            .insert(String::from("load_balancer_dns"), serde_json::json!("lb-0001.memory.internal"));
        state.outputs.insert(String::from("port"), serde_json::json!(443));

        let text = OutputFormatter::new(OutputFormat::Text).format_state(&state);
        assert!(text.contains("Outputs:"));
        assert!(text.contains("load_balancer_dns = lb-0001.memory.internal"));
        assert!(text.contains("port = 443"));

        let json = OutputFormatter::new(OutputFormat::Json).format_state(&state);
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(value["outputs"]["load_balancer_dns"], "lb-0001.memory.internal");
    }

    #[test]
    fn test_empty_plan() {
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(
            &DiffResult::default(),
            &ExecutionPlan::empty(),
            false,
        );
        assert!(text.contains("No changes required"));
    }
}
