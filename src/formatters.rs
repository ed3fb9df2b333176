use crate::models::*;
use anyhow::Result;
use prettytable::{Cell, Row, Table, format};

pub trait ReportFormatter {
    fn format_report(&self, report: &SuiteReport) -> Result<String>;
    fn format_node_state(&self, state: &NodeStateReport) -> Result<String>;
}

pub struct JsonFormatter;
pub struct YamlFormatter;
pub struct TableFormatter;
pub struct MarkdownFormatter;

impl ReportFormatter for JsonFormatter {
    fn format_report(&self, report: &SuiteReport) -> Result<String> {
        Ok(serde_json::to_string_pretty(report)?)
    }

    fn format_node_state(&self, state: &NodeStateReport) -> Result<String> {
        Ok(serde_json::to_string_pretty(state)?)
    }
}

impl ReportFormatter for YamlFormatter {
    fn format_report(&self, report: &SuiteReport) -> Result<String> {
        Ok(serde_yaml::to_string(report)?)
    }

    fn format_node_state(&self, state: &NodeStateReport) -> Result<String> {
        Ok(serde_yaml::to_string(state)?)
    }
}

impl ReportFormatter for TableFormatter {
    fn format_report(&self, report: &SuiteReport) -> Result<String> {
        let mut output = String::new();

        let summary_table = self.create_summary_table(report);
        output.push_str(&format!("{}\n", summary_table));

        if !report.scenarios.is_empty() {
            output.push_str("\nScenarios:\n");
            let scenario_table = self.create_scenario_table(report);
            output.push_str(&format!("{}\n", scenario_table));
        }

        Ok(output)
    }

    fn format_node_state(&self, state: &NodeStateReport) -> Result<String> {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.set_titles(Row::new(vec![
            Cell::new("Node").style_spec("Fb"),
            Cell::new(&state.node).style_spec("Fc"),
        ]));

        let orig_empty = orig_banned_cpus_empty_label(state.orig_banned_cpus_empty);
        let rows = [
            ("Banned CPUs", cpus_or_none(&state.banned_cpus)),
            ("Default SMP Affinity", state.default_smp_affinity.clone()),
            ("Default Affinity CPUs", cpus_or_none(&state.default_smp_affinity_cpus)),
            ("Online CPUs", cpus_or_none(&state.online_cpus)),
            ("Pristine", if state.pristine { "yes" } else { "no" }.to_string()),
            ("Saved Ban List Empty", orig_empty.to_string()),
        ];
        for (name, value) in rows {
            table.add_row(Row::new(vec![Cell::new(name), Cell::new(&value)]));
        }

        Ok(format!("{}\n", table))
    }
}

impl TableFormatter {
    fn create_summary_table(&self, report: &SuiteReport) -> Table {
        let mut summary_table = Table::new();
        summary_table.set_format(*format::consts::FORMAT_BOX_CHARS);

        summary_table.set_titles(Row::new(vec![
            Cell::new("Metric").style_spec("Fb"),
            Cell::new("Value").style_spec("Fb"),
        ]));

        summary_table.add_row(Row::new(vec![
            Cell::new("Suite"),
            Cell::new(&report.suite).style_spec("Fc"),
        ]));
        if let Some(ref url) = report.api_server_url {
            summary_table.add_row(Row::new(vec![Cell::new("API Server"), Cell::new(url)]));
        }
        summary_table.add_row(Row::new(vec![
            Cell::new("Scenarios"),
            Cell::new(&report.scenarios.len().to_string()),
        ]));
        summary_table.add_row(Row::new(vec![
            Cell::new("Passed"),
            Cell::new(&report.count(ScenarioStatus::Passed).to_string()).style_spec("Fg"),
        ]));
        summary_table.add_row(Row::new(vec![
            Cell::new("Failed"),
            Cell::new(&report.count(ScenarioStatus::Failed).to_string()).style_spec("Fr"),
        ]));
        summary_table.add_row(Row::new(vec![
            Cell::new("Skipped"),
            Cell::new(&report.count(ScenarioStatus::Skipped).to_string()).style_spec("Fy"),
        ]));

        summary_table
    }

    fn create_scenario_table(&self, report: &SuiteReport) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.set_titles(Row::new(vec![
            Cell::new("Scenario").style_spec("Fb"),
            Cell::new("Status").style_spec("Fb"),
            Cell::new("Node").style_spec("Fb"),
            Cell::new("Duration").style_spec("Fb"),
            Cell::new("Detail").style_spec("Fb"),
        ]));

        for scenario in &report.scenarios {
            table.add_row(Row::new(vec![
                Cell::new(&scenario.name),
                Cell::new(&scenario.status.to_string()).style_spec(status_style(scenario.status)),
                Cell::new(scenario.node.as_deref().unwrap_or("-")),
                Cell::new(&format!("{:.1}s", scenario.duration_secs)),
                Cell::new(&truncate_detail(scenario.detail.as_deref().unwrap_or(""), 80)),
            ]));
        }

        table
    }
}

fn status_style(status: ScenarioStatus) -> &'static str {
    match status {
        ScenarioStatus::Passed => "Fg",
        ScenarioStatus::Failed => "Fr",
        ScenarioStatus::Skipped => "Fy",
    }
}

fn orig_banned_cpus_empty_label(empty: Option<bool>) -> &'static str {
    match empty {
        Some(true) => "yes",
        Some(false) => "no",
        None => "unknown",
    }
}

fn cpus_or_none(cpus: &crate::cpuset::CpuSet) -> String {
    if cpus.is_empty() {
        "(none)".to_string()
    } else {
        cpus.to_string()
    }
}

// keep table rows on one line; full details are in the json/yaml output
fn truncate_detail(detail: &str, max_chars: usize) -> String {
    let first_line = detail.lines().next().unwrap_or("");
    if first_line.chars().count() <= max_chars {
        return first_line.to_string();
    }
    let cut: String = first_line.chars().take(max_chars - 3).collect();
    format!("{}...", cut)
}

impl ReportFormatter for MarkdownFormatter {
    fn format_report(&self, report: &SuiteReport) -> Result<String> {
        let mut output = String::new();

        output.push_str(&format!("## Suite: {}\n\n", report.suite));
        if let Some(ref url) = report.api_server_url {
            output.push_str(&format!("**API Server:** {}\n\n", url));
        }
        output.push_str(&format!(
            "**Passed:** {} | **Failed:** {} | **Skipped:** {}\n\n",
            report.count(ScenarioStatus::Passed),
            report.count(ScenarioStatus::Failed),
            report.count(ScenarioStatus::Skipped)
        ));

        if !report.scenarios.is_empty() {
            output.push_str("| Scenario | Status | Node | Duration | Detail |\n");
            output.push_str("|----------|--------|------|----------|--------|\n");
            for scenario in &report.scenarios {
                output.push_str(&format!(
                    "| {} | {} | {} | {:.1}s | {} |\n",
                    scenario.name,
                    scenario.status,
                    scenario.node.as_deref().unwrap_or("-"),
                    scenario.duration_secs,
                    scenario.detail.as_deref().unwrap_or("").replace('|', "\\|")
                ));
            }
        }

        Ok(output)
    }

    fn format_node_state(&self, state: &NodeStateReport) -> Result<String> {
        let mut output = String::new();
        output.push_str(&format!("## Node: {}\n\n", state.node));
        output.push_str(&format!("**Banned CPUs:** {}\n\n", cpus_or_none(&state.banned_cpus)));
        output.push_str(&format!(
            "**Default SMP Affinity:** {} ({})\n\n",
            state.default_smp_affinity,
            cpus_or_none(&state.default_smp_affinity_cpus)
        ));
        output.push_str(&format!("**Online CPUs:** {}\n\n", cpus_or_none(&state.online_cpus)));
        output.push_str(&format!("**Pristine:** {}\n\n", state.pristine));
        output.push_str(&format!(
            "**Saved Ban List Empty:** {}\n",
            orig_banned_cpus_empty_label(state.orig_banned_cpus_empty)
        ));
        Ok(output)
    }
}

pub fn get_formatter(format: &str) -> Box<dyn ReportFormatter> {
    match format {
        "json" => Box::new(JsonFormatter),
        "yaml" => Box::new(YamlFormatter),
        "markdown" | "md" => Box::new(MarkdownFormatter),
        _ => Box::new(TableFormatter),
    }
}
