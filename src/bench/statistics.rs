//! Latency aggregation over measured iterations
//!
//! Contains:
//! - `LatencySummary`: mean latency plus optional token-latency breakdown
//! - `percentile_index`: floor-based index with a clamp for short samples

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::IterationRecord;
use crate::error::{BenchError, Result};

/// Index of the `q`-quantile in a sorted sequence of `len` values
///
/// Uses `floor(q * len)` and clamps to the last element, so short sequences
/// never index past the end. Returns `None` for an empty sequence.
#[must_use]
pub fn percentile_index(len: usize, q: f64) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let idx = (len as f64 * q).floor() as usize;
    Some(idx.min(len - 1))
}

fn mean(samples: &[Duration]) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let total: u128 = samples.iter().map(Duration::as_nanos).sum();
    Duration::from_nanos((total / samples.len() as u128) as u64)
}

/// Statistics over the pooled subsequent-token latencies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextTokenStats {
    /// Mean of all pooled values
    pub mean: Duration,
    /// 90th percentile
    pub p90: Duration,
    /// 99th percentile
    pub p99: Duration,
    /// Number of pooled values
    pub samples: usize,
}

impl NextTokenStats {
    /// Pool, sort, and summarize; `None` when there is nothing to pool
    #[must_use]
    pub fn from_pooled(mut pooled: Vec<Duration>) -> Option<Self> {
        pooled.sort_unstable();
        let p90 = pooled[percentile_index(pooled.len(), 0.90)?];
        let p99 = pooled[percentile_index(pooled.len(), 0.99)?];
        Some(Self {
            mean: mean(&pooled),
            p90,
            p99,
            samples: pooled.len(),
        })
    }
}

/// First-token and subsequent-token latency breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLatencySummary {
    /// Mean time to first token
    pub first_token_mean: Duration,
    /// Subsequent-token statistics; absent when every generation stopped after one token
    pub next_token: Option<NextTokenStats>,
}

/// Aggregated results of a benchmark run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Iterations that counted towards the statistics
    pub measured_iterations: usize,
    /// Mean wall-clock latency per measured iteration
    pub mean_latency: Duration,
    /// Token-latency breakdown when tracking was enabled
    pub token_latency: Option<TokenLatencySummary>,
}

impl LatencySummary {
    /// Aggregate the measured (non warm-up) records
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::ConfigError`] if no iteration was measured, and
    /// [`BenchError::FormatError`] if token latency is requested but a measured
    /// record carries none.
    pub fn from_records(records: &[IterationRecord], token_latency: bool) -> Result<Self> {
        let measured: Vec<&IterationRecord> = records.iter().filter(|r| !r.warmup).collect();
        if measured.is_empty() {
            return Err(BenchError::ConfigError(
                "no measured iterations: num_iter must exceed num_warmup".to_string(),
            ));
        }

        let elapsed: Vec<Duration> = measured.iter().map(|r| r.elapsed).collect();
        let mean_latency = mean(&elapsed);

        let token_latency = if token_latency {
            let mut firsts = Vec::with_capacity(measured.len());
            let mut pooled = Vec::new();
            for record in &measured {
                let latency = record.token_latency.as_ref().ok_or_else(|| BenchError::FormatError {
                    reason: format!("iteration {} has no token latency", record.index),
                })?;
                firsts.push(latency.first);
                pooled.extend_from_slice(&latency.rest);
            }
            Some(TokenLatencySummary {
                first_token_mean: mean(&firsts),
                next_token: NextTokenStats::from_pooled(pooled),
            })
        } else {
            None
        };

        Ok(Self {
            measured_iterations: measured.len(),
            mean_latency,
            token_latency,
        })
    }
}
