//! Run configuration resolution
//!
//! Turns the raw option bag coming from the command line into an immutable,
//! validated [`RunConfig`]. Quantization mode, weight representation, and
//! compute precision are resolved here once and never mutated afterwards.
//!
//! Weight compression and activation/accumulation precision are independent
//! axes: `--int8` or weight-only quantization never implies bf16 autocast, only
//! `--int8-bf16-mixed` does.

use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};
use crate::prompt::MAX_INPUT_TOKENS;
use crate::provider::GenerateParams;

/// Beam width used when greedy decoding is not requested
pub const DEFAULT_BEAM_WIDTH: usize = 4;

/// Sampling temperature passed to generation (inert while sampling is disabled)
pub const GENERATION_TEMPERATURE: f32 = 0.9;

/// Prompt pool shipped with the crate, relative to the crate root
pub const DEFAULT_PROMPT_FILE: &str = "demos/prompt.json";

// ============================================================================
// Option enums
// ============================================================================

/// Requested weight data type for weight-only quantization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum WeightDtype {
    /// 8-bit integer weights
    #[value(name = "INT8")]
    #[serde(rename = "INT8")]
    Int8,
    /// 4-bit integer weights
    #[value(name = "INT4")]
    #[serde(rename = "INT4")]
    Int4,
}

/// Requested low-precision compute mode for weight-only quantization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum LowpMode {
    /// bfloat16 compute
    #[value(name = "BF16")]
    #[serde(rename = "BF16")]
    Bf16,
    /// Full fp32 compute
    #[value(name = "FP32")]
    #[serde(rename = "FP32")]
    Fp32,
    /// int8 compute
    #[value(name = "INT8")]
    #[serde(rename = "INT8")]
    Int8,
    /// fp16 compute
    #[value(name = "FP16")]
    #[serde(rename = "FP16")]
    Fp16,
}

/// Concrete weight storage handed to the quantization service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeightRepr {
    /// Signed 8-bit quantized weights
    QInt8,
    /// Two unsigned 4-bit values packed per byte
    QUInt4x2,
}

impl From<WeightDtype> for WeightRepr {
    fn from(dtype: WeightDtype) -> Self {
        match dtype {
            WeightDtype::Int8 => Self::QInt8,
            WeightDtype::Int4 => Self::QUInt4x2,
        }
    }
}

/// Concrete low-precision compute mode handed to the quantization service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LowpCompute {
    /// No low-precision compute, fp32 throughout
    None,
    /// int8 compute
    Int8,
    /// fp16 compute
    Fp16,
    /// bf16 compute (default)
    Bf16,
}

impl From<Option<LowpMode>> for LowpCompute {
    fn from(mode: Option<LowpMode>) -> Self {
        match mode {
            Some(LowpMode::Int8) => Self::Int8,
            Some(LowpMode::Fp32) => Self::None,
            Some(LowpMode::Fp16) => Self::Fp16,
            Some(LowpMode::Bf16) | None => Self::Bf16,
        }
    }
}

/// Weight-only quantization configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightOnlyQConfig {
    /// Weight representation
    pub weight: WeightRepr,
    /// Low-precision compute mode
    pub lowp: LowpCompute,
}

/// Resolved quantization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum QuantMode {
    /// No quantization
    None,
    /// Static int8 quantization from a previously traced artifact
    StaticInt8,
    /// Weight-only quantization
    WeightOnly(WeightOnlyQConfig),
}

impl QuantMode {
    /// Short name used in reports
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::StaticInt8 => "static-int8",
            Self::WeightOnly(WeightOnlyQConfig {
                weight: WeightRepr::QInt8,
                ..
            }) => "weight-only-int8",
            Self::WeightOnly(WeightOnlyQConfig {
                weight: WeightRepr::QUInt4x2,
                ..
            }) => "weight-only-int4",
        }
    }

    /// Weight-only configuration, if any
    #[must_use]
    pub fn weight_only(&self) -> Option<&WeightOnlyQConfig> {
        match self {
            Self::WeightOnly(cfg) => Some(cfg),
            _ => None,
        }
    }
}

/// Numeric compute mode (autocast) for tracing and generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComputeMode {
    /// fp32 accumulation, autocast disabled
    Fp32,
    /// bf16 autocast enabled
    Bf16Mixed,
}

impl ComputeMode {
    /// Whether autocast is enabled
    #[must_use]
    pub fn autocast_enabled(self) -> bool {
        matches!(self, Self::Bf16Mixed)
    }
}

/// Where the prompt text comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptRequest {
    /// Literal prompt supplied by the user
    Explicit(String),
    /// Canonical prompt looked up in the prompt pool
    Pool {
        /// Raw input-token key as given on the command line
        key: String,
        /// Parsed requested length
        length: usize,
    },
}

// ============================================================================
// Raw options
// ============================================================================

/// Unvalidated options, one field per command-line flag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOptions {
    /// Model identifier
    pub model_id: String,
    /// Prompt-pool family override
    pub model_family: Option<String>,
    /// Maximum number of new tokens per generation
    pub max_new_tokens: usize,
    /// Directory receiving the traced artifact
    pub output_dir: PathBuf,
    /// Enable weight-only quantization
    pub weight_only_quantization: bool,
    /// Static int8 path
    pub int8: bool,
    /// Enable bf16 autocast on top of int8
    pub int8_bf16_mixed: bool,
    /// Traced artifact to load in benchmark mode
    pub quantized_model_path: PathBuf,
    /// Run the benchmark loop
    pub benchmark: bool,
    /// Requested input length / prompt-pool key
    pub input_tokens: String,
    /// Literal prompt override
    pub prompt: Option<String>,
    /// Prompt pool JSON file
    pub prompt_file: PathBuf,
    /// Total iterations including warm-up
    pub num_iter: usize,
    /// Warm-up iterations excluded from statistics
    pub num_warmup: usize,
    /// Batch size
    pub batch_size: usize,
    /// Collect first/next token latencies
    pub token_latency: bool,
    /// Greedy decoding (beam width 1)
    pub greedy: bool,
    /// Run the profiling pass
    pub profile: bool,
    /// Low-precision compute mode for weight-only quantization
    pub lowp_mode: Option<LowpMode>,
    /// Weight dtype for weight-only quantization
    pub weight_dtype: WeightDtype,
    /// Write the summary as JSON here
    pub json_output: Option<PathBuf>,
}

impl Default for RawOptions {
    fn default() -> Self {
        Self {
            model_id: "facebook/opt-6.7b".to_string(),
            model_family: None,
            max_new_tokens: 32,
            output_dir: PathBuf::from("./saved_results"),
            weight_only_quantization: false,
            int8: false,
            int8_bf16_mixed: false,
            quantized_model_path: PathBuf::from("./saved_results/best_model.pt"),
            benchmark: false,
            input_tokens: "32".to_string(),
            prompt: None,
            prompt_file: PathBuf::from(DEFAULT_PROMPT_FILE),
            num_iter: 100,
            num_warmup: 10,
            batch_size: 1,
            token_latency: false,
            greedy: false,
            profile: false,
            lowp_mode: Some(LowpMode::Bf16),
            weight_dtype: WeightDtype::Int8,
            json_output: None,
        }
    }
}

// ============================================================================
// RunConfig
// ============================================================================

/// Validated, immutable run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Model identifier
    pub model_id: String,
    /// Prompt-pool family override
    pub model_family: Option<String>,
    /// Quantization mode
    pub quant: QuantMode,
    /// Compute mode for tracing and generation
    pub compute: ComputeMode,
    /// Beam width (1 = greedy)
    pub beam_width: usize,
    /// Batch size
    pub batch_size: usize,
    /// Prompt source
    pub prompt: PromptRequest,
    /// Maximum number of new tokens per generation
    pub max_new_tokens: usize,
    /// Total iterations including warm-up
    pub num_iter: usize,
    /// Warm-up iterations excluded from statistics
    pub num_warmup: usize,
    /// Collect first/next token latencies
    pub token_latency: bool,
    /// Run the benchmark loop
    pub benchmark: bool,
    /// Run the profiling pass
    pub profile: bool,
    /// Directory receiving the traced artifact
    pub output_dir: PathBuf,
    /// Traced artifact to load in benchmark mode
    pub quantized_model_path: PathBuf,
    /// Prompt pool JSON file
    pub prompt_file: PathBuf,
    /// JSON report destination
    pub json_output: Option<PathBuf>,
}

impl RunConfig {
    /// Validate raw options and resolve them into a run configuration
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::ConfigError`] if the input-token length cannot be
    /// parsed while no explicit prompt is given, if the batch size is zero, or
    /// if benchmarking is requested with `num_iter <= num_warmup`.
    pub fn resolve(raw: &RawOptions) -> Result<Self> {
        let beam_width = if raw.greedy { 1 } else { DEFAULT_BEAM_WIDTH };

        let quant = if raw.weight_only_quantization {
            QuantMode::WeightOnly(WeightOnlyQConfig {
                weight: raw.weight_dtype.into(),
                lowp: raw.lowp_mode.into(),
            })
        } else if raw.int8 {
            QuantMode::StaticInt8
        } else {
            QuantMode::None
        };

        let compute = if raw.int8_bf16_mixed {
            ComputeMode::Bf16Mixed
        } else {
            ComputeMode::Fp32
        };

        let prompt = match &raw.prompt {
            Some(text) => PromptRequest::Explicit(text.clone()),
            None => {
                let length = raw.input_tokens.trim().parse::<usize>().map_err(|_| {
                    BenchError::ConfigError(format!(
                        "--input-tokens must be an integer length, got '{}'; use --prompt for custom input",
                        raw.input_tokens
                    ))
                })?;
                if length > MAX_INPUT_TOKENS {
                    return Err(BenchError::ConfigError(format!(
                        "--input-tokens {length} exceeds the maximum of {MAX_INPUT_TOKENS}"
                    )));
                }
                PromptRequest::Pool {
                    key: raw.input_tokens.clone(),
                    length,
                }
            },
        };

        if raw.batch_size == 0 {
            return Err(BenchError::ConfigError(
                "--batch-size must be at least 1".to_string(),
            ));
        }

        if raw.benchmark && raw.num_iter <= raw.num_warmup {
            return Err(BenchError::ConfigError(format!(
                "--num-iter ({}) must be greater than --num-warmup ({})",
                raw.num_iter, raw.num_warmup
            )));
        }

        Ok(Self {
            model_id: raw.model_id.clone(),
            model_family: raw.model_family.clone(),
            quant,
            compute,
            beam_width,
            batch_size: raw.batch_size,
            prompt,
            max_new_tokens: raw.max_new_tokens,
            num_iter: raw.num_iter,
            num_warmup: raw.num_warmup,
            token_latency: raw.token_latency,
            benchmark: raw.benchmark,
            profile: raw.profile,
            output_dir: raw.output_dir.clone(),
            quantized_model_path: raw.quantized_model_path.clone(),
            prompt_file: raw.prompt_file.clone(),
            json_output: raw.json_output.clone(),
        })
    }

    /// Decoding parameters for every generate call
    #[must_use]
    pub fn generate_params(&self) -> GenerateParams {
        GenerateParams {
            max_new_tokens: self.max_new_tokens,
            do_sample: false,
            temperature: GENERATION_TEMPERATURE,
            num_beams: self.beam_width,
            compute: self.compute,
        }
    }

    /// Text length bound used when building the model config
    ///
    /// Only set when the prompt comes from the pool, where the requested
    /// length is known up front.
    #[must_use]
    pub fn text_max_length(&self) -> Option<usize> {
        match &self.prompt {
            PromptRequest::Pool { length, .. } => Some(length.saturating_add(self.max_new_tokens)),
            PromptRequest::Explicit(_) => None,
        }
    }

    /// Path the traced artifact is written to
    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir.join("best_model.pt")
    }

    /// Number of measured (non warm-up) iterations
    #[must_use]
    pub fn measured_iterations(&self) -> usize {
        self.num_iter.saturating_sub(self.num_warmup)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
