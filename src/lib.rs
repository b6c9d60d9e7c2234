//! # Genbench
//!
//! Latency benchmark harness for quantized causal language model text generation.
//!
//! Genbench resolves a run configuration (quantization mode, weight
//! representation, compute precision, decoding width), prepares a model
//! through an opaque framework backend, runs a fixed number of warm-up and
//! measured generation iterations, and reports mean, first-token, and
//! p90/p99 subsequent-token latency.
//!
//! ## Example
//!
//! ```rust,no_run
//! use genbench::{cli, RawOptions, ReferenceBackend, RunConfig};
//!
//! let config = RunConfig::resolve(&RawOptions {
//!     benchmark: true,
//!     greedy: true,
//!     prompt: Some("Once upon a time".to_string()),
//!     num_iter: 10,
//!     num_warmup: 2,
//!     ..RawOptions::default()
//! })?;
//! let outcome = cli::run(&ReferenceBackend::new(), &config)?;
//! # Ok::<(), genbench::BenchError>(())
//! ```
//!
//! ## Architecture
//!
//! - `config`: option validation and quantization-mode selection
//! - `prompt`: canonical prompt pool and prompt synthesis
//! - `provider`: traits for the model, tokenizer, and quantization services
//! - `prepare`: load / quantize / trace / reload pipeline
//! - `bench`: iteration loop, statistics, profiling pass, reporting
//! - `reference`: deterministic in-process backend

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f64 for statistics
#![allow(clippy::cast_possible_truncation)] // usize -> u32 for Duration scaling
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args
#![allow(clippy::missing_panics_doc)] // Allow missing Panics doc sections

/// Iteration loop, latency statistics, profiling pass, and reports
pub mod bench;
/// CLI parser and run orchestration (extracted for testability)
pub mod cli;
pub mod config;
pub mod error;
/// Model preparation: load, quantize, trace, persist, reload
pub mod prepare;
pub mod prompt;
pub mod provider;
/// Deterministic in-process backend for dry runs and tests
pub mod reference;

// Re-exports for convenience
pub use bench::{IterationRecord, LatencySummary};
pub use config::{RawOptions, RunConfig};
pub use error::{BenchError, Result};
pub use reference::ReferenceBackend;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
