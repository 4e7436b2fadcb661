use anyhow::Result;
use prettytable::{Cell, Row, Table, format};

use crate::config::Timeouts;
use crate::evaluator::StageStatus;
use crate::scenarios::Scenario;
use crate::scenarios::runner::{ScenarioOutcome, ScenarioReport};

pub trait ReportFormatter {
    fn format_report(&self, reports: &[ScenarioReport]) -> Result<String>;
}

pub struct JsonFormatter;
pub struct YamlFormatter;
pub struct TableFormatter;

impl ReportFormatter for JsonFormatter {
    fn format_report(&self, reports: &[ScenarioReport]) -> Result<String> {
        Ok(serde_json::to_string_pretty(reports)?)
    }
}

impl ReportFormatter for YamlFormatter {
    fn format_report(&self, reports: &[ScenarioReport]) -> Result<String> {
        Ok(serde_yaml::to_string(reports)?)
    }
}

impl ReportFormatter for TableFormatter {
    fn format_report(&self, reports: &[ScenarioReport]) -> Result<String> {
        let mut output = String::new();
        output.push_str(&format!("{}\n", self.create_summary_table(reports)));

        for report in reports.iter().filter(|r| !r.stages.is_empty()) {
            output.push_str(&format!("\nStages of {}:\n", report.scenario));
            output.push_str(&format!("{}\n", self.create_stage_table(report)));
        }

        let teardown: Vec<&ScenarioReport> = reports
            .iter()
            .filter(|r| !r.teardown.warnings.is_empty() || !r.teardown.failures.is_empty())
            .collect();
        if !teardown.is_empty() {
            output.push_str("\nTeardown:\n");
            output.push_str(&format!("{}\n", self.create_teardown_table(&teardown)));
        }

        Ok(output)
    }
}

impl TableFormatter {
    fn create_summary_table(&self, reports: &[ScenarioReport]) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.set_titles(Row::new(vec![
            Cell::new("Scenario").style_spec("Fb"),
            Cell::new("Namespace").style_spec("Fb"),
            Cell::new("Outcome").style_spec("Fb"),
            Cell::new("Duration").style_spec("Fb"),
            Cell::new("Failed Stage").style_spec("Fb"),
        ]));

        for report in reports {
            let outcome = match report.outcome {
                ScenarioOutcome::Passed => Cell::new("PASSED").style_spec("Fg"),
                ScenarioOutcome::Failed => Cell::new("FAILED").style_spec("Fr"),
                ScenarioOutcome::Interrupted => Cell::new("INTERRUPTED").style_spec("Fy"),
            };
            table.add_row(Row::new(vec![
                Cell::new(&report.scenario).style_spec("Fc"),
                Cell::new(&report.namespace),
                outcome,
                Cell::new(&format!("{:.1}s", report.duration_secs())),
                Cell::new(report.failed_stage.as_deref().unwrap_or("-")),
            ]));
        }
        table
    }

    fn create_stage_table(&self, report: &ScenarioReport) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.set_titles(Row::new(vec![
            Cell::new("Stage").style_spec("b"),
            Cell::new("Status").style_spec("b"),
            Cell::new("Elapsed").style_spec("b"),
            Cell::new("Deadline").style_spec("b"),
            Cell::new("Polls").style_spec("b"),
            Cell::new("Detail").style_spec("b"),
        ]));

        for stage in &report.stages {
            let style = match stage.status {
                StageStatus::Passed => "Fg",
                StageStatus::TimedOut | StageStatus::Failed => "Fr",
                StageStatus::Skipped => "Fd",
            };
            table.add_row(Row::new(vec![
                Cell::new(&stage.name),
                Cell::new(&stage.status.to_string()).style_spec(style),
                Cell::new(&format!("{:.1}s", stage.elapsed_secs)),
                Cell::new(&format!("{}s", stage.deadline_secs)),
                Cell::new(&stage.polls.to_string()),
                Cell::new(stage.detail.as_deref().unwrap_or("")),
            ]));
        }
        table
    }

    fn create_teardown_table(&self, reports: &[&ScenarioReport]) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.set_titles(Row::new(vec![
            Cell::new("Scenario").style_spec("b"),
            Cell::new("Resource").style_spec("b"),
            Cell::new("Problem").style_spec("b"),
        ]));

        for report in reports {
            for failure in &report.teardown.failures {
                let target = failure
                    .target
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string());
                table.add_row(Row::new(vec![
                    Cell::new(&report.scenario),
                    Cell::new(&target),
                    Cell::new(&failure.message).style_spec("Fr"),
                ]));
            }
            for warning in &report.teardown.warnings {
                table.add_row(Row::new(vec![
                    Cell::new(&report.scenario),
                    Cell::new(&warning.target.to_string()),
                    Cell::new(&warning.message).style_spec("Fy"),
                ]));
            }
        }
        table
    }
}

/// Scenario catalogue as printed by `list`
pub fn scenario_table(scenarios: &[Box<dyn Scenario>], timeouts: &Timeouts) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BOX_CHARS);
    table.set_titles(Row::new(vec![
        Cell::new("Name").style_spec("Fb"),
        Cell::new("Accelerator").style_spec("Fb"),
        Cell::new("Max Duration").style_spec("Fb"),
        Cell::new("Description").style_spec("Fb"),
    ]));

    for scenario in scenarios {
        table.add_row(Row::new(vec![
            Cell::new(scenario.name()).style_spec("Fc"),
            Cell::new(&scenario.accelerator().to_string()),
            Cell::new(&crate::config::format_duration(
                scenario.expected_duration(timeouts),
            )),
            Cell::new(scenario.description()),
        ]));
    }
    table
}

pub fn get_formatter(format: &str) -> Box<dyn ReportFormatter> {
    match format {
        "json" => Box::new(JsonFormatter),
        "yaml" => Box::new(YamlFormatter),
        _ => Box::new(TableFormatter),
    }
}
