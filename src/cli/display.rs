//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::ValidationResult;
use crate::deploy::gcloud::redact_args;
use crate::pipeline::{PipelineReport, PlannedStep, StepPlan, StepResult};

/// Format rows under upper-cased headers, columns separated by three spaces
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return "No steps.\n".to_string();
    }

    let widths: Vec<usize> = (0..headers.len())
        .map(|i| {
            rows.iter()
                .filter_map(|row| row.get(i))
                .map(|cell| cell.chars().count())
                .chain(std::iter::once(headers[i].len()))
                .max()
                .unwrap_or_default()
        })
        .collect();

    let render = |cells: Vec<String>| -> String {
        let last = cells.len().saturating_sub(1);
        let line: Vec<String> = cells
            .into_iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                // no padding after the last column
                Some(_) if i == last => cell,
                Some(width) => format!("{:width$}", cell, width = width),
                None => cell,
            })
            .collect();
        line.join("   ")
    };

    let mut output = render(headers.iter().map(|h| h.to_uppercase()).collect());
    output.push('\n');
    for row in rows {
        output.push_str(&render(row.clone()));
        output.push('\n');
    }
    output
}

fn result_detail(result: &StepResult) -> String {
    match result {
        StepResult::Success { url, output, .. } => url.clone().unwrap_or_else(|| output.clone()),
        StepResult::Error { error, kind, .. } => format!("{}: {}", kind, error),
        StepResult::Pending { message } => message.clone(),
    }
}

/// Per-step outcome table, resolved URLs and a summary line
pub fn format_report(report: &PipelineReport) -> String {
    let rows: Vec<Vec<String>> = report
        .steps
        .iter()
        .map(|m| {
            vec![
                m.step.clone(),
                m.payload.status().to_string(),
                result_detail(&m.payload),
            ]
        })
        .collect();

    let mut output = format_table(&["step", "status", "detail"], &rows);

    let urls = report.config.urls();
    if !urls.is_empty() {
        output.push_str("\nURLs:\n");
        for (key, url) in &urls {
            output.push_str(&format!("  {}: {}\n", key, url));
        }
    }

    for message in &report.steps {
        if let StepResult::Error {
            stderr: Some(stderr),
            ..
        } = &message.payload
        {
            output.push_str(&format!("\n[{}] stderr:\n{}\n", message.step, stderr.trim_end()));
        }
    }

    let elapsed = report.finished_at - report.started_at;
    output.push_str(&format!(
        "\nPipeline {} {} in {}s\n",
        report.run_id,
        if report.succeeded() { "succeeded" } else { "failed" },
        elapsed.num_seconds()
    ));
    output
}

/// One line per step: what it would do
pub fn format_plan(plan: &[PlannedStep]) -> String {
    let mut output = String::from("Dry run (nothing will be executed)\n\n");
    for (i, planned) in plan.iter().enumerate() {
        let line = match &planned.plan {
            StepPlan::Seed { keys } => format!("seeds {}", keys.join(", ")),
            StepPlan::Issue { program, args } => redact_args(program, args),
            StepPlan::Skip { message } => format!("skipped: {}", message),
            StepPlan::Invalid { error } => format!("invalid: {}", error),
        };
        output.push_str(&format!("  [{}] {}: {}\n", i + 1, planned.step, line));
    }
    output
}

/// Format a validation result
pub fn format_validation_result(result: &ValidationResult, path: &str) -> String {
    let mut output = String::new();

    if result.valid {
        output.push_str(&format!("✓ {} is valid\n\n", path));
        output.push_str(&format!("  Steps: {}\n", result.steps.join(" -> ")));
    } else {
        output.push_str(&format!("✗ {} is invalid\n\n", path));
        if let Some(ref error) = result.error {
            output.push_str(&format!("  Error: {}\n", error));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ConfigEnvelope, PipelineMessage, StepState};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn message(step: &str, payload: StepResult) -> PipelineMessage {
        PipelineMessage {
            step: step.to_string(),
            config: ConfigEnvelope::new(),
            payload,
            trace: vec![StepState::Idle],
        }
    }

    #[test]
    fn test_format_table_alignment() {
        let rows = vec![
            vec!["proxy".to_string(), "success".to_string()],
            vec!["webapp".to_string(), "pending".to_string()],
        ];
        let output = format_table(&["step", "status"], &rows);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "STEP     STATUS");
        assert_eq!(lines[1], "proxy    success");
        assert_eq!(lines[2], "webapp   pending");
    }

    #[test]
    fn test_format_report() {
        let mut config = ConfigEnvelope::new();
        config.insert("proxyUrl", "https://nfa-proxy.run.app");
        let now = Utc::now();
        let report = PipelineReport {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            steps: vec![
                message(
                    "proxy",
                    StepResult::Error {
                        error: "Command failed".to_string(),
                        kind: "command_failed".to_string(),
                        stderr: Some("permission denied\n".to_string()),
                        urls: BTreeMap::new(),
                    },
                ),
                message(
                    "webapp",
                    StepResult::Pending {
                        message: "Waiting for proxyUrl".to_string(),
                    },
                ),
            ],
            config,
        };

        let output = format_report(&report);
        assert!(output.contains("command_failed: Command failed"));
        assert!(output.contains("Waiting for proxyUrl"));
        assert!(output.contains("proxyUrl: https://nfa-proxy.run.app"));
        assert!(output.contains("[proxy] stderr:\npermission denied\n"));
        assert!(output.contains("failed in 0s"));
    }

    #[test]
    fn test_format_plan_redacts_env() {
        let plan = vec![PlannedStep {
            step: "proxy".to_string(),
            plan: StepPlan::Issue {
                program: "gcloud".to_string(),
                args: vec![
                    "run".to_string(),
                    "deploy".to_string(),
                    "--set-env-vars".to_string(),
                    "CONSUMER_PASSWORD=hunter2".to_string(),
                ],
            },
        }];
        let output = format_plan(&plan);
        assert!(output.contains("[1] proxy: gcloud run deploy --set-env-vars"));
        assert!(!output.contains("hunter2"));
    }

    #[test]
    fn test_format_validation_result() {
        let ok = ValidationResult {
            valid: true,
            steps: vec!["config".to_string(), "proxy".to_string()],
            error: None,
        };
        assert!(format_validation_result(&ok, "p.json").contains("config -> proxy"));

        let bad = ValidationResult {
            valid: false,
            steps: Vec::new(),
            error: Some("no steps".to_string()),
        };
        assert!(format_validation_result(&bad, "p.json").contains("Error: no steps"));
    }
}
