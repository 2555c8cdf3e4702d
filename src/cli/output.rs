//! Output formatting for CLI commands.
//!
//! Renders plans, status, outputs and state for the terminal, in text
//! or JSON.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::aws::EnvironmentView;
use crate::outputs::OutputSet;
use crate::planner::{ActionType, ChangePlan, DiffResult};
use crate::reconciler::ApplyReport;
use crate::state::AppliedState;

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
    #[tabled(rename = "Reason")]
    reason: String,
}

/// JSON projection of a change plan.
#[derive(Serialize)]
struct PlanJson {
    config_hash: String,
    actions: Vec<PlanActionJson>,
}

/// JSON projection of a planned action.
#[derive(Serialize)]
struct PlanActionJson {
    action: String,
    resource: String,
    reason: String,
    dependencies: Vec<usize>,
}

/// JSON projection of an apply report.
#[derive(Serialize)]
struct ApplyJson {
    success: bool,
    created: usize,
    updated: usize,
    recreated: usize,
    unchanged: usize,
    errors: Vec<String>,
}

/// JSON projection of the observed environment.
#[derive(Serialize)]
struct StatusJson {
    instance: Option<StatusInstanceJson>,
    security_group: Option<StatusGroupJson>,
}

/// JSON projection of an observed instance.
#[derive(Serialize)]
struct StatusInstanceJson {
    instance_id: String,
    status: String,
    ami: String,
    instance_type: String,
    public_ip: Option<String>,
    private_ip: Option<String>,
}

/// JSON projection of an observed security group.
#[derive(Serialize)]
struct StatusGroupJson {
    group_id: String,
    name: String,
    ingress: Vec<String>,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a change plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ChangePlan, diff: &DiffResult) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&PlanJson::from(plan)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_plan_text(plan, diff),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &ChangePlan, diff: &DiffResult) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::from("\nChange Plan\n");
        if plan.config_hash.len() >= 8 {
            let _ = write!(output, "   Declaration hash: {}\n\n", &plan.config_hash[..8]);
        }

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_type(a.action_type),
                resource: a.resource_name.clone(),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();

        let table = Table::new(rows).to_string();
        output.push_str(&table);
        output.push('\n');

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace\n",
            diff.creates.to_string().green(),
            diff.updates.to_string().yellow(),
            diff.recreates.to_string().red()
        );

        output
    }

    /// Formats the observed environment.
    #[must_use]
    pub fn format_status(&self, view: &EnvironmentView) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&StatusJson::from(view)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_status_text(view),
        }
    }

    /// Formats status as text.
    fn format_status_text(view: &EnvironmentView) -> String {
        let mut output = String::new();

        if view.is_empty() {
            output.push_str("   No managed resources observed.\n");
            return output;
        }

        if let Some(instance) = &view.instance {
            let status = if instance.is_running() {
                instance.status.to_string().green().to_string()
            } else {
                instance.status.to_string().yellow().to_string()
            };

            let _ = writeln!(
                output,
                "\nInstance {} ({status})",
                instance.instance_id
            );
            let _ = writeln!(output, "   AMI:        {}", instance.ami);
            let _ = writeln!(output, "   Type:       {}", instance.instance_type);
            let _ = writeln!(
                output,
                "   Public IP:  {}",
                instance.public_ip.as_deref().unwrap_or("-")
            );
            let _ = writeln!(
                output,
                "   Private IP: {}",
                instance.private_ip.as_deref().unwrap_or("-")
            );
        } else {
            output.push_str("\nInstance: none\n");
        }

        if let Some(group) = &view.security_group {
            let _ = writeln!(output, "\nSecurity group {} ({})", group.name, group.group_id);
            for rule in &group.ingress {
                let _ = writeln!(output, "   allow {rule}");
            }
        } else {
            output.push_str("\nSecurity group: none\n");
        }

        output
    }

    /// Formats an apply report.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&ApplyJson::from(report)).unwrap_or_default()
            }
            OutputFormat::Text => {
                let status = if report.success {
                    format!("{} Apply converged", "✓".green())
                } else {
                    format!("{} Apply incomplete - re-run to converge", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Created: {}", report.created);
                let _ = writeln!(output, "   Updated: {}", report.updated);
                let _ = writeln!(output, "   Replaced: {}", report.recreated);
                let _ = writeln!(output, "   Unchanged: {}", report.unchanged);

                if !report.errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for error in &report.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                output
            }
        }
    }

    /// Formats a published output set.
    #[must_use]
    pub fn format_outputs(&self, outputs: &OutputSet) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outputs).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                for (name, value) in outputs.iter() {
                    let _ = writeln!(output, "{name} = {value}");
                }
                output
            }
        }
    }

    /// Formats applied state.
    #[must_use]
    pub fn format_state(&self, state: &AppliedState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(
                    output,
                    "\nState for {}/{} (serial {})",
                    state.project, state.environment, state.serial
                );

                if let Some(instance) = &state.instance {
                    let _ = writeln!(
                        output,
                        "   instance {} ({}) {}",
                        instance.instance_id,
                        instance.status,
                        instance.public_ip.as_deref().unwrap_or("-")
                    );
                }

                if let Some(group) = &state.security_group {
                    let _ = writeln!(output, "   security group {}", group.group_id);
                }

                if !state.has_resources() {
                    output.push_str("   no resources recorded\n");
                }

                let _ = writeln!(output, "   last updated {}", state.last_updated.to_rfc3339());
                output
            }
        }
    }

    /// Formats an action type for display.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::CreateSecurityGroup | ActionType::RunInstance => {
                format!("{} {action_type}", "+".green())
            }
            ActionType::UpdateIngress => format!("{} {action_type}", "~".yellow()),
            ActionType::DeleteSecurityGroup | ActionType::TerminateInstance => {
                format!("{} {action_type}", "-".red())
            }
            ActionType::Noop => action_type.to_string(),
        }
    }

    /// Truncates a string for table display.
    fn truncate(s: &str, max: usize) -> String {
        if s.len() <= max {
            s.to_string()
        } else {
            format!("{}...", &s[..max.saturating_sub(3)])
        }
    }
}

impl From<&ChangePlan> for PlanJson {
    fn from(plan: &ChangePlan) -> Self {
        Self {
            config_hash: plan.config_hash.clone(),
            actions: plan
                .actions
                .iter()
                .map(|a| PlanActionJson {
                    action: a.action_type.to_string(),
                    resource: a.resource_name.clone(),
                    reason: a.reason.clone(),
                    dependencies: a.dependencies.clone(),
                })
                .collect(),
        }
    }
}

impl From<&ApplyReport> for ApplyJson {
    fn from(report: &ApplyReport) -> Self {
        Self {
            success: report.success,
            created: report.created,
            updated: report.updated,
            recreated: report.recreated,
            unchanged: report.unchanged,
            errors: report.errors.clone(),
        }
    }
}

impl From<&EnvironmentView> for StatusJson {
    fn from(view: &EnvironmentView) -> Self {
        Self {
            instance: view.instance.as_ref().map(|i| StatusInstanceJson {
                instance_id: i.instance_id.clone(),
                status: i.status.to_string(),
                ami: i.ami.clone(),
                instance_type: i.instance_type.clone(),
                public_ip: i.public_ip.clone(),
                private_ip: i.private_ip.clone(),
            }),
            security_group: view.security_group.as_ref().map(|g| StatusGroupJson {
                group_id: g.group_id.clone(),
                name: g.name.clone(),
                ingress: g.ingress.clone(),
            }),
        }
    }
}
