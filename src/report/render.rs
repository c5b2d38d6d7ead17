//! Report rendering for operators and downstream tooling.

use anyhow::{Context, Result};
use askama::Template;
use uuid::Uuid;

use super::AnomalyReport;
use crate::calibrate::ThresholdPolicy;
use crate::session::SessionStateMachine;

/// Turns a finished report into a printable document.
pub trait ReportRenderer {
    fn render(&self, report: &AnomalyReport) -> Result<String>;
}

/// Pretty-printed JSON, the report's stable machine format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer;

impl ReportRenderer for JsonRenderer {
    fn render(&self, report: &AnomalyReport) -> Result<String> {
        serde_json::to_string_pretty(report).context("serializing report")
    }
}

/// Plain-text summary for terminals.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextRenderer;

struct AnomalyRow {
    rank: usize,
    sample: usize,
    score: String,
    severity: &'static str,
}

struct CountRow {
    severity: &'static str,
    count: usize,
}

#[derive(Template)]
#[template(
    ext = "txt",
    source = "=== Anomaly Triage Report ===
Session:    {{ session_id }}
Samples:    {{ total_samples }} (min {{ score_min }}, max {{ score_max }}, mean {{ score_mean }})
Anomalies:  {{ anomaly_count }}
Threshold:  {{ threshold }} [{{ policy }}]
Validated:  {{ validated }}
{%- if let Some(cost) = cost %}
Cost:       {{ cost }}
{%- endif %}
{%- if !counts.is_empty() %}

By severity:
{%- for row in counts %}
  {{ \"{:<9}\"|format(row.severity) }} {{ row.count }}
{%- endfor %}
{%- endif %}
{%- if !rows.is_empty() %}

{{ \"{:>4}\"|format(\"#\") }}  {{ \"{:>8}\"|format(\"Sample\") }}  {{ \"{:>12}\"|format(\"Score\") }}  Severity
{%- for row in rows %}
{{ \"{:>4}\"|format(row.rank) }}  {{ \"{:>8}\"|format(row.sample) }}  {{ \"{:>12}\"|format(row.score) }}  {{ row.severity }}
{%- endfor %}
{%- endif %}
"
)]
struct TextReport {
    session_id: Uuid,
    total_samples: usize,
    score_min: String,
    score_max: String,
    score_mean: String,
    anomaly_count: usize,
    threshold: String,
    policy: String,
    validated: &'static str,
    cost: Option<String>,
    counts: Vec<CountRow>,
    rows: Vec<AnomalyRow>,
}

fn describe_policy(policy: &ThresholdPolicy) -> String {
    match policy {
        ThresholdPolicy::CostMinimized => "cost-minimized".to_string(),
        ThresholdPolicy::Percentile { percentile } => format!("p{} fallback", percentile),
        ThresholdPolicy::Supplied => "supplied".to_string(),
    }
}

impl ReportRenderer for TextRenderer {
    fn render(&self, report: &AnomalyReport) -> Result<String> {
        let summary = &report.score_summary;
        let view = TextReport {
            session_id: report.session_id,
            total_samples: report.total_samples,
            score_min: format!("{:.4}", summary.min),
            score_max: format!("{:.4}", summary.max),
            score_mean: format!("{:.4}", summary.mean),
            anomaly_count: report.anomaly_count,
            threshold: format!("{:.6}", report.threshold_used),
            policy: describe_policy(&report.threshold_policy),
            validated: if report.threshold_validated {
                "yes"
            } else {
                "no (no ground truth)"
            },
            cost: report.cost_breakdown.as_ref().map(|c| {
                format!(
                    "{:.2} ({} FP x {} + {} FN x {})",
                    c.total, c.false_positives, c.fp_cost, c.false_negatives, c.fn_cost
                )
            }),
            counts: report
                .severity_counts
                .iter()
                .rev()
                .map(|(severity, count)| CountRow {
                    severity: severity.as_str(),
                    count: *count,
                })
                .collect(),
            rows: report
                .top_ranked
                .iter()
                .enumerate()
                .map(|(i, a)| AnomalyRow {
                    rank: i + 1,
                    sample: a.sample_index,
                    score: format!("{:.6}", a.score),
                    severity: a.severity.as_str(),
                })
                .collect(),
        };
        view.render().context("rendering text report")
    }
}

/// Render the report of a `Completed` session.
pub fn render_completed(
    machine: &SessionStateMachine,
    session_id: Uuid,
    renderer: &dyn ReportRenderer,
) -> Result<String> {
    let report = machine.report(session_id)?;
    renderer.render(&report)
}
