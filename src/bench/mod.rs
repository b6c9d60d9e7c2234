//! Generation benchmark loop
//!
//! Runs `num_iter` tokenize -> generate -> detokenize iterations on a prepared
//! model. The first `num_warmup` iterations are executed but excluded from the
//! statistics. A failure inside any iteration aborts the run; there is no retry
//! and no partial result.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut runner = BenchmarkRunner::new(&mut model, &tokenizer, prompts, params, true);
//! let records = runner.run(100, 10, |out| report::print_iteration(out))?;
//! let summary = LatencySummary::from_records(&records, true)?;
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BenchError, ExternalContext, Result};
use crate::provider::{CausalLm, GenerateParams, TextTokenizer, TokenLatency};

mod profile;
pub mod report;
mod statistics;

pub use profile::{key_averages, run_profile_pass, ProfilePhase, ProfileSchedule};
pub use statistics::{percentile_index, LatencySummary, NextTokenStats, TokenLatencySummary};

// ============================================================================
// Records
// ============================================================================

/// Measurements of one generation iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Iteration index, starting at 0
    pub index: usize,
    /// Whether this iteration was a warm-up
    pub warmup: bool,
    /// Wall-clock time from tokenization to detokenization
    pub elapsed: Duration,
    /// New tokens generated per batch element
    pub new_tokens: Vec<usize>,
    /// Per-token latencies reported by the model
    pub token_latency: Option<TokenLatency>,
}

/// An iteration's record together with the decoded text
#[derive(Debug, Clone, PartialEq)]
pub struct IterationOutput {
    /// Decoded text per batch element
    pub texts: Vec<String>,
    /// Measurements
    pub record: IterationRecord,
}

/// New tokens per batch element
///
/// Decoder-only models echo the prompt, so the prompt length is subtracted.
/// Encoder-decoder models return only generated tokens.
#[must_use]
pub fn new_token_counts(
    input_lengths: &[usize],
    output_lengths: &[usize],
    encoder_decoder: bool,
) -> Vec<usize> {
    input_lengths
        .iter()
        .zip(output_lengths)
        .map(|(&input, &output)| {
            if encoder_decoder {
                output
            } else {
                output.saturating_sub(input)
            }
        })
        .collect()
}

// ============================================================================
// Runner
// ============================================================================

/// Drives generation iterations against a prepared model
pub struct BenchmarkRunner<'a, M: CausalLm, T: TextTokenizer> {
    model: &'a mut M,
    tokenizer: &'a T,
    prompts: Vec<String>,
    params: GenerateParams,
    token_latency: bool,
}

impl<'a, M: CausalLm, T: TextTokenizer> BenchmarkRunner<'a, M, T> {
    /// Create a runner over a batch of prompts
    pub fn new(
        model: &'a mut M,
        tokenizer: &'a T,
        prompts: Vec<String>,
        params: GenerateParams,
        token_latency: bool,
    ) -> Self {
        Self {
            model,
            tokenizer,
            prompts,
            params,
            token_latency,
        }
    }

    /// The model being benchmarked
    pub fn model_mut(&mut self) -> &mut M {
        &mut *self.model
    }

    /// Run a single timed iteration
    ///
    /// # Errors
    ///
    /// Propagates any collaborator failure, and fails if token latency was
    /// requested but the model did not report it.
    pub fn run_iteration(&mut self, index: usize, warmup: bool) -> Result<IterationOutput> {
        let tic = Instant::now();
        let input_ids = self.tokenizer.encode_batch(&self.prompts).during("encode")?;
        let output = self
            .model
            .generate(&input_ids, &self.params)
            .during("generate")?;
        let texts = self
            .tokenizer
            .decode_batch(&output.sequences)
            .during("decode")?;
        let elapsed = tic.elapsed();

        if self.token_latency && output.token_latency.is_none() {
            return Err(BenchError::external(
                "generate",
                "token latency was enabled but the model did not report it".into(),
            ));
        }

        let input_lengths: Vec<usize> = input_ids.iter().map(Vec::len).collect();
        let output_lengths: Vec<usize> = output.sequences.iter().map(Vec::len).collect();
        let new_tokens = new_token_counts(
            &input_lengths,
            &output_lengths,
            self.model.architecture().is_encoder_decoder(),
        );

        Ok(IterationOutput {
            texts,
            record: IterationRecord {
                index,
                warmup,
                elapsed,
                new_tokens,
                token_latency: output.token_latency,
            },
        })
    }

    /// Run `num_iter` iterations, the first `num_warmup` flagged as warm-up
    ///
    /// `on_iteration` sees every iteration as soon as it completes.
    ///
    /// # Errors
    ///
    /// Stops at the first failing iteration and returns its error.
    pub fn run<F>(
        &mut self,
        num_iter: usize,
        num_warmup: usize,
        mut on_iteration: F,
    ) -> Result<Vec<IterationRecord>>
    where
        F: FnMut(&IterationOutput),
    {
        let mut records = Vec::with_capacity(num_iter);
        for index in 0..num_iter {
            let warmup = index < num_warmup;
            let output = self.run_iteration(index, warmup)?;
            debug!(
                index,
                warmup,
                elapsed_ms = output.record.elapsed.as_secs_f64() * 1000.0,
                "iteration complete"
            );
            on_iteration(&output);
            records.push(output.record);
        }
        Ok(records)
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod bench_tests;
