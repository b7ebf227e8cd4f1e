//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ContentHasher, DeployConfig, ValidationResult};
use crate::executor::{ActionStatus, ApplyResult};
use crate::graph::DependencyGraph;
use crate::model::ResourceAddress;
use crate::planner::{ChangeKind, Plan};
use crate::reconciler::{DriftReport, ReconcileReport};
use crate::state::{Lock, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Level")]
    level: usize,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Deposed")]
    deposed: usize,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    fn json<T: Serialize + ?Sized>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a change plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. Infrastructure matches the configuration.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let title = if plan.destroy { "Destroy Plan" } else { "Change Plan" };
        let _ = writeln!(output, "\n{}", title.bold());
        let _ = writeln!(
            output,
            "   Based on serial {} (config {})\n",
            plan.based_on_serial,
            ContentHasher::short(&plan.config_hash)
        );

        let rows: Vec<PlanActionRow> = plan
            .changes()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_kind(a.kind),
                resource: a.key(),
                level: a.level,
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for action in plan.changes() {
                let _ = writeln!(output, "   {} {}", action.kind.symbol(), action.key());
                for change in &action.changes {
                    let _ = writeln!(output, "       {change}");
                }
            }
        }

        let summary = plan.summary();
        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            summary.delete.to_string().red()
        );
        output
    }

    /// Formats the result of an apply.
    #[must_use]
    pub fn format_apply(&self, result: &ApplyResult) -> String {
        match self.format {
            OutputFormat::Json => Self::json(result),
            OutputFormat::Text => Self::format_apply_text(result),
        }
    }

    fn format_apply_text(result: &ApplyResult) -> String {
        let mut output = String::new();
        let rows: Vec<OutcomeRow> = result
            .outcomes
            .iter()
            .filter(|o| o.kind != ChangeKind::Noop)
            .map(|o| OutcomeRow {
                status: Self::format_status(o.status),
                action: o.kind.to_string(),
                resource: o.key.clone(),
                attempts: o.attempts,
                detail: Self::truncate(o.error.as_deref().or(o.provider_id.as_deref()).unwrap_or(""), 60),
            })
            .collect();
        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let headline = if result.is_success() {
            format!("{} Apply complete", "✓".green())
        } else if result.cancelled {
            format!("{} Apply cancelled", "⚠".yellow())
        } else {
            format!("{} Apply incomplete", "✗".red())
        };
        let _ = writeln!(
            output,
            "\n{headline}: {} succeeded, {} failed, {} skipped (serial {} -> {}, {} ms)",
            result.succeeded(),
            result.failed(),
            result.skipped(),
            result.initial_serial,
            result.final_serial,
            result.duration_ms
        );
        if let Some(reason) = &result.aborted {
            let _ = writeln!(output, "   Aborted: {reason}");
        }
        output
    }

    /// Formats a reconciliation report.
    #[must_use]
    pub fn format_reconcile(&self, report: &ReconcileReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let mut output = String::new();
                for address in &report.dropped {
                    let _ = writeln!(output, "{} {address} no longer exists, will be recreated", "⚠".yellow());
                }
                for address in &report.refreshed {
                    let _ = writeln!(output, "{} {address} refreshed from provider", "~".yellow());
                }
                match &report.result {
                    Some(result) => {
                        output.push_str(&Self::format_plan_text(&report.plan, false));
                        output.push_str(&Self::format_apply_text(result));
                    }
                    None => {
                        let _ = writeln!(output, "{} No changes required - state is converged.", "✓".green());
                    }
                }
                let _ = writeln!(output, "   Attempts: {}", report.attempts);
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected - {} resource(s) match their records.\n",
                        "✓".green(),
                        report.checked
                    );
                }
                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for resource in &report.drifted {
                    let _ = writeln!(
                        output,
                        "   ~ {} ({}): {}",
                        resource.address,
                        resource.provider_id,
                        resource.fields.join(", ")
                    );
                }
                for address in &report.missing {
                    let _ = writeln!(output, "   - {address}: {}", "no longer exists".red());
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted.\n",
                    report.drifted.len() + report.missing.len(),
                    report.checked
                );
                output
            }
        }
    }

    /// Formats the state summary.
    #[must_use]
    pub fn format_state(&self, snapshot: &StateSnapshot, lock: Option<&Lock>, location: &str) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "location": location,
                "version": snapshot.version,
                "lineage": snapshot.lineage,
                "serial": snapshot.serial,
                "last_updated": snapshot.last_updated,
                "resources": snapshot.len(),
                "deposed": snapshot.deposed_count(),
                "lock": lock,
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\n{} {location}\n", "State:".bold());
                let _ = writeln!(output, "   Version: {}", snapshot.version);
                let _ = writeln!(output, "   Lineage: {}", snapshot.lineage);
                let _ = writeln!(output, "   Serial: {}", snapshot.serial);
                let _ = writeln!(output, "   Last updated: {}", snapshot.last_updated.format("%Y-%m-%d %H:%M:%S UTC"));
                let _ = writeln!(output, "   Resources: {}", snapshot.len());
                if snapshot.deposed_count() > 0 {
                    let _ = writeln!(output, "   Deposed objects: {}", snapshot.deposed_count().to_string().yellow());
                }
                match lock {
                    Some(lock) => output.push_str(&Self::format_lock_text(lock)),
                    None => output.push_str("   Lock: none\n"),
                }
                output
            }
        }
    }

    /// Formats the recorded resources as a table.
    #[must_use]
    pub fn format_records(&self, snapshot: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&snapshot.records),
            OutputFormat::Text => {
                if snapshot.is_empty() {
                    return String::from("No resources recorded.\n");
                }
                let rows: Vec<RecordRow> = snapshot
                    .records
                    .values()
                    .map(|r| RecordRow {
                        address: r.address.to_string(),
                        id: Self::truncate(&r.provider_id, 24),
                        hash: ContentHasher::short(&r.content_hash).to_string(),
                        deposed: r.deposed.len(),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a lock.
    #[must_use]
    pub fn format_lock(&self, lock: &Lock) -> String {
        match self.format {
            OutputFormat::Json => Self::json(lock),
            OutputFormat::Text => Self::format_lock_text(lock),
        }
    }

    fn format_lock_text(lock: &Lock) -> String {
        format!(
            "   Lock: {} held by {} since {} (last heartbeat {}s ago, serial {})\n",
            lock.lock_id,
            lock.holder,
            lock.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
            lock.idle_secs(),
            lock.serial_at_acquisition
        )
    }

    /// Formats the dependency graph level by level.
    #[must_use]
    pub fn format_graph(&self, graph: &DependencyGraph, levels: &[Vec<ResourceAddress>]) -> String {
        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<_> = levels
                    .iter()
                    .enumerate()
                    .flat_map(|(level, addresses)| {
                        addresses.iter().map(move |address| (level, address))
                    })
                    .map(|(level, address)| {
                        serde_json::json!({
                            "address": address,
                            "level": level,
                            "depends_on": graph.dependencies(address),
                        })
                    })
                    .collect();
                Self::json(&nodes)
            }
            OutputFormat::Text => {
                let mut output = format!(
                    "{} resource(s), {} edge(s), {} level(s)\n",
                    graph.len(),
                    graph.edge_count(),
                    levels.len()
                );
                for (level, addresses) in levels.iter().enumerate() {
                    let _ = writeln!(output, "\n{}", format!("Level {level}").bold());
                    for address in addresses {
                        let deps = graph.dependencies(address);
                        if deps.is_empty() {
                            let _ = writeln!(output, "   {address}");
                        } else {
                            let deps: Vec<String> = deps.iter().map(ToString::to_string).collect();
                            let _ = writeln!(output, "   {address} <- {}", deps.join(", ").dimmed());
                        }
                    }
                }
                output
            }
        }
    }

    /// Formats a validation result with a configuration summary.
    #[must_use]
    pub fn format_validation(&self, config: &DeployConfig, result: &ValidationResult, warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
                "project": config.project.name,
                "resources": config.resources.len(),
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Configuration is valid!", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration has {} error(s):", "✗".red(), result.error_count());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }
                if (warnings || !result.is_valid()) && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                let _ = writeln!(output, "\nConfiguration summary:");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   State backend: {}", config.state.backend);
                let _ = writeln!(output, "   Declarations: {}", config.resources.len());
                let _ = writeln!(output, "   Resource types: {}", config.resource_types().len());
                output
            }
        }
    }

    /// Formats an action kind with color.
    fn format_kind(kind: ChangeKind) -> String {
        let label = format!("{}{kind}", kind.symbol());
        match kind {
            ChangeKind::Create => label.green().to_string(),
            ChangeKind::Update => label.yellow().to_string(),
            ChangeKind::Replace => label.magenta().to_string(),
            ChangeKind::Delete => label.red().to_string(),
            ChangeKind::Noop => label.dimmed().to_string(),
        }
    }

    /// Formats an action status with color.
    fn format_status(status: ActionStatus) -> String {
        let label = status.to_string();
        match status {
            ActionStatus::Succeeded => label.green().to_string(),
            ActionStatus::Failed => label.red().to_string(),
            ActionStatus::Skipped => label.yellow().to_string(),
            ActionStatus::Pending | ActionStatus::Running => label.dimmed().to_string(),
        }
    }

    /// Truncates a string to at most `max_len` characters.
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
    use crate::model::{AttrValue, ResourceNode};
    use crate::planner::Planner;
    use crate::provider::{MemoryProvider, ProviderRegistry};
    use std::sync::Arc;

    fn plan() -> Plan {
        let nodes = vec![
            ResourceNode::new(ResourceAddress::new("network", "main"))
                .with_attribute("cidr", AttrValue::parse(&serde_json::json!("10.0.0.0/16")).unwrap()),
        ];
        let graph = DependencyGraph::build(nodes).unwrap();
        let mut registry = ProviderRegistry::new();
        registry.set_fallback(Arc::new(MemoryProvider::new()));
        Planner::new(&registry)
            .plan(&graph, &StateSnapshot::empty(), "0123456789abcdef")
            .unwrap()
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("abcdefghijkl", 8), "abcde...");
    }

    #[test]
    fn test_plan_text_and_json() {
        colored::control::set_override(false);
        let plan = plan();

        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan, true);
        assert!(text.contains("network.main"));
        assert!(text.contains("1 to create"));
        assert!(text.contains("cidr"));

        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan, false);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["actions"][0]["kind"], "create");
    }

    #[test]
    fn test_empty_state() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let snapshot = StateSnapshot::empty();
        assert_eq!(formatter.format_records(&snapshot), "No resources recorded.\n");
        let state = formatter.format_state(&snapshot, None, "memory://test");
        assert!(state.contains("Serial: 0"));
        assert!(state.contains("Lock: none"));
    }
}
