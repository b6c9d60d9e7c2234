//! Human-readable and JSON reporting

use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use super::{IterationOutput, LatencySummary};
use crate::config::RunConfig;
use crate::error::{BenchError, Result};
use crate::provider::OpTiming;

/// Line printed after each iteration
#[must_use]
pub fn format_iteration(output: &IterationOutput) -> String {
    format!(
        "{:?} {:?}\nIteration: {}, Time: {:.6} sec",
        output.texts,
        output.record.new_tokens,
        output.record.index,
        output.record.elapsed.as_secs_f64()
    )
}

/// Print an iteration as soon as it completes
pub fn print_iteration(output: &IterationOutput) {
    println!("{}", format_iteration(output));
}

/// Summary block printed at the end of a run
#[must_use]
pub fn format_summary(summary: &LatencySummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n {} Summary: {}", "-".repeat(10), "-".repeat(10));
    let _ = writeln!(
        out,
        "Inference latency: {:.3} sec.",
        summary.mean_latency.as_secs_f64()
    );
    if let Some(token) = &summary.token_latency {
        let _ = writeln!(
            out,
            "First token average latency: {:.3} sec.",
            token.first_token_mean.as_secs_f64()
        );
        match &token.next_token {
            Some(next) => {
                let _ = writeln!(out, "Average 2... latency: {:.3} sec.", next.mean.as_secs_f64());
                let _ = writeln!(out, "P90 2... latency: {:.3} sec.", next.p90.as_secs_f64());
                let _ = writeln!(out, "P99 2... latency: {:.3} sec.", next.p99.as_secs_f64());
            },
            None => {
                let _ = writeln!(out, "Average 2... latency: n/a (no subsequent tokens)");
            },
        }
    }
    out
}

/// Operator table sorted by self time, largest first
#[must_use]
pub fn format_op_table(table: &[OpTiming]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<40} {:>14} {:>14} {:>10}",
        "Name", "Self CPU (ms)", "CPU total (ms)", "# Calls"
    );
    let _ = writeln!(out, "{}", "-".repeat(81));
    for row in table {
        let _ = writeln!(
            out,
            "{:<40} {:>14.3} {:>14.3} {:>10}",
            row.name,
            row.self_time.as_secs_f64() * 1000.0,
            row.total_time.as_secs_f64() * 1000.0,
            row.calls
        );
    }
    out
}

/// Machine-readable run report
#[derive(Debug, Clone, Serialize)]
pub struct JsonReport<'a> {
    /// Crate version that produced the report
    pub version: &'static str,
    /// Model identifier
    pub model_id: &'a str,
    /// Quantization mode name
    pub quantization: &'static str,
    /// Resolved run configuration
    pub config: &'a RunConfig,
    /// Tokenized prompt length
    pub prompt_tokens: usize,
    /// Mean latency in seconds
    pub latency_sec: f64,
    /// Mean first-token latency in seconds
    pub first_token_sec: Option<f64>,
    /// Mean subsequent-token latency in seconds
    pub next_token_mean_sec: Option<f64>,
    /// p90 subsequent-token latency in seconds
    pub next_token_p90_sec: Option<f64>,
    /// p99 subsequent-token latency in seconds
    pub next_token_p99_sec: Option<f64>,
    /// Full summary
    pub summary: &'a LatencySummary,
}

impl<'a> JsonReport<'a> {
    /// Build a report from a finished run
    #[must_use]
    pub fn new(config: &'a RunConfig, prompt_tokens: usize, summary: &'a LatencySummary) -> Self {
        let token = summary.token_latency.as_ref();
        let next = token.and_then(|t| t.next_token.as_ref());
        Self {
            version: crate::VERSION,
            model_id: &config.model_id,
            quantization: config.quant.as_str(),
            config,
            prompt_tokens,
            latency_sec: summary.mean_latency.as_secs_f64(),
            first_token_sec: token.map(|t| t.first_token_mean.as_secs_f64()),
            next_token_mean_sec: next.map(|n| n.mean.as_secs_f64()),
            next_token_p90_sec: next.map(|n| n.p90.as_secs_f64()),
            next_token_p99_sec: next.map(|n| n.p99.as_secs_f64()),
            summary,
        }
    }

    /// Write the report as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the file write fails.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| BenchError::FormatError {
            reason: format!("failed to serialize report: {e}"),
        })?;
        std::fs::write(path, json).map_err(|e| BenchError::IoError {
            message: format!("failed to write report {}: {e}", path.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bench::{IterationRecord, NextTokenStats, TokenLatencySummary};
    use crate::config::RawOptions;

    fn summary_with_tokens() -> LatencySummary {
        LatencySummary {
            measured_iterations: 2,
            mean_latency: Duration::from_millis(1250),
            token_latency: Some(TokenLatencySummary {
                first_token_mean: Duration::from_millis(300),
                next_token: Some(NextTokenStats {
                    mean: Duration::from_millis(30),
                    p90: Duration::from_millis(41),
                    p99: Duration::from_millis(55),
                    samples: 62,
                }),
            }),
        }
    }

    #[test]
    fn test_format_iteration() {
        let output = IterationOutput {
            texts: vec!["hello world".to_string()],
            record: IterationRecord {
                index: 3,
                warmup: false,
                elapsed: Duration::from_micros(1_500_000),
                new_tokens: vec![32],
                token_latency: None,
            },
        };
        let text = format_iteration(&output);
        assert!(text.contains("[\"hello world\"] [32]"));
        assert!(text.contains("Iteration: 3, Time: 1.500000 sec"));
    }

    #[test]
    fn test_format_summary_latency_only() {
        let summary = LatencySummary {
            measured_iterations: 1,
            mean_latency: Duration::from_millis(2000),
            token_latency: None,
        };
        let text = format_summary(&summary);
        assert!(text.contains("Summary:"));
        assert!(text.contains("Inference latency: 2.000 sec."));
        assert!(!text.contains("First token"));
    }

    #[test]
    fn test_format_summary_with_token_latency() {
        let text = format_summary(&summary_with_tokens());
        assert!(text.contains("First token average latency: 0.300 sec."));
        assert!(text.contains("Average 2... latency: 0.030 sec."));
        assert!(text.contains("P90 2... latency: 0.041 sec."));
        assert!(text.contains("P99 2... latency: 0.055 sec."));
    }

    #[test]
    fn test_format_op_table_rows() {
        let table = vec![OpTiming {
            name: "aten::linear".to_string(),
            self_time: Duration::from_micros(2500),
            total_time: Duration::from_micros(4000),
            calls: 12,
        }];
        let text = format_op_table(&table);
        assert!(text.starts_with("Name"));
        assert!(text.contains("aten::linear"));
        assert!(text.contains("2.500"));
        assert!(text.contains("12"));
    }

    #[test]
    fn test_json_report_write() {
        let config = RunConfig::resolve(&RawOptions::default()).expect("resolve");
        let summary = summary_with_tokens();
        let report = JsonReport::new(&config, 32, &summary);
        assert_eq!(report.quantization, "none");
        assert_eq!(report.next_token_p99_sec, Some(0.055));

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.json");
        report.write(&path).expect("write");

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["model_id"], "facebook/opt-6.7b");
        assert_eq!(value["prompt_tokens"], 32);
        assert_eq!(value["summary"]["measured_iterations"], 2);
    }
}
