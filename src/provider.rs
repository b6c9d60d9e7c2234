//! External collaborator interfaces
//!
//! The harness never touches tensors, kernels, or quantization numerics. It
//! drives three opaque services through the traits in this module:
//!
//! - [`TextTokenizer`]: text <-> token ids
//! - [`CausalLm`]: batched `generate` with optional per-token latency
//! - [`ModelProvider`] and [`QuantizationService`]: loading, optimization,
//!   tracing/freezing, and artifact persistence
//!
//! Optional model features are advertised through [`Capabilities`] instead of
//! being probed at runtime.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ComputeMode, RunConfig, WeightOnlyQConfig};
use crate::error::ExternalResult;

// ============================================================================
// Model description
// ============================================================================

/// Architecture facts the harness needs from a loaded model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArchitecture {
    /// Model type string (e.g. "opt", "llama", "t5")
    pub model_type: String,
    /// Parameter dtype name as reported by the framework
    pub dtype: String,
    /// Attention heads per layer
    pub num_attention_heads: usize,
    /// Hidden size
    pub hidden_size: usize,
    /// Number of decoder layers
    pub num_hidden_layers: usize,
}

impl ModelArchitecture {
    /// Encoder-decoder models return only the generated tokens from `generate`
    #[must_use]
    pub fn is_encoder_decoder(&self) -> bool {
        self.model_type == "t5"
    }
}

/// Optional features a model may expose
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `generate` can report first/next token latencies
    pub token_latency: bool,
    /// The model already carries a traced graph and needs no artifact
    pub trace_graph: bool,
    /// The model can capture per-operator timings
    pub profiling: bool,
}

// ============================================================================
// Generation
// ============================================================================

/// Decoding parameters passed to every generate call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerateParams {
    /// Maximum number of new tokens
    pub max_new_tokens: usize,
    /// Sampling toggle (always false for latency runs)
    pub do_sample: bool,
    /// Sampling temperature
    pub temperature: f32,
    /// Beam width
    pub num_beams: usize,
    /// Autocast mode the call runs under
    pub compute: ComputeMode,
}

/// Per-token latencies measured inside a generate call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLatency {
    /// Time to the first generated token
    pub first: Duration,
    /// Time for each following token, in generation order
    pub rest: Vec<Duration>,
}

/// Result of a generate call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// One token sequence per batch element
    pub sequences: Vec<Vec<u32>>,
    /// Present when token-latency reporting is enabled on the model
    pub token_latency: Option<TokenLatency>,
}

/// Text tokenizer paired with a model
pub trait TextTokenizer {
    /// Encode each prompt of the batch
    fn encode_batch(&self, texts: &[String]) -> ExternalResult<Vec<Vec<u32>>>;

    /// Decode each sequence, skipping special tokens
    fn decode_batch(&self, sequences: &[Vec<u32>]) -> ExternalResult<Vec<String>>;
}

/// One row of a profiler operator table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpTiming {
    /// Operator name
    pub name: String,
    /// Time spent in the operator itself
    pub self_time: Duration,
    /// Time including children
    pub total_time: Duration,
    /// Number of calls
    pub calls: u64,
}

/// Causal language model
pub trait CausalLm {
    /// Architecture facts
    fn architecture(&self) -> &ModelArchitecture;

    /// Optional features currently available
    fn capabilities(&self) -> Capabilities;

    /// Turn on per-token latency reporting in `generate`
    fn enable_token_latency(&mut self) -> ExternalResult<()>;

    /// Run generation for a batch of token sequences
    fn generate(
        &mut self,
        input_ids: &[Vec<u32>],
        params: &GenerateParams,
    ) -> ExternalResult<GenerationOutput>;

    /// Start or stop capturing operator timings
    fn set_op_capture(&mut self, enabled: bool) -> ExternalResult<()>;

    /// Drain the operator timings captured so far
    fn take_op_timings(&mut self) -> ExternalResult<Vec<OpTiming>>;
}

// ============================================================================
// Loading and optimization
// ============================================================================

/// How model weights are materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStrategy {
    /// Build the architecture without weights (benchmark mode)
    Skeleton {
        /// Construct parameters on the meta device
        meta_device: bool,
    },
    /// Load pretrained fp32 weights
    Pretrained,
}

/// Options for model loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Weight materialization
    pub strategy: LoadStrategy,
    /// Text length bound written into the model config
    pub text_max_length: Option<usize>,
    /// Export the model config in a trace-friendly form
    pub torchscript: bool,
}

impl LoadOptions {
    /// Initial load options for a run
    ///
    /// Benchmark runs only need the architecture because weights come from
    /// the traced artifact, so they start from a meta-device skeleton.
    #[must_use]
    pub fn for_run(config: &RunConfig) -> Self {
        let strategy = if config.benchmark {
            LoadStrategy::Skeleton { meta_device: true }
        } else {
            LoadStrategy::Pretrained
        };
        Self {
            strategy,
            text_max_length: config.text_max_length(),
            torchscript: true,
        }
    }
}

/// Loads models and tokenizers by identifier
pub trait ModelProvider {
    /// Model type produced by this provider
    type Model: CausalLm;
    /// Tokenizer type produced by this provider
    type Tokenizer: TextTokenizer;

    /// Load a model
    fn load_model(&self, model_id: &str, options: &LoadOptions) -> ExternalResult<Self::Model>;

    /// Load the tokenizer matching a model
    fn load_tokenizer(&self, model_id: &str) -> ExternalResult<Self::Tokenizer>;
}

/// Shape of one tensor in the trace example inputs
pub type Shape = Vec<usize>;

/// Past key/value entry for one decoder layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastKeyValueShape {
    /// Key cache shape `[1, heads, 1, head_dim]`
    pub key: Shape,
    /// Value cache shape `[1, heads, 1, head_dim]`
    pub value: Shape,
    /// Beam index table shape `[2048, batch * beams]`
    pub beam_idx: Shape,
    /// Offset tensor shape `[1]`
    pub offset: Shape,
}

/// Example inputs used to trace the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceExample {
    /// Input ids (all ones)
    pub input_ids: Vec<u32>,
    /// Attention mask (all ones, same length)
    pub attention_mask: Vec<u32>,
    /// One entry per decoder layer
    pub past_key_values: Vec<PastKeyValueShape>,
}

/// Request for the generic transformer optimization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeRequest {
    /// Mark the model for weight-only quantization
    pub weight_only: bool,
}

/// Framework quantization, tracing, and runtime controls
pub trait QuantizationService<M: CausalLm> {
    /// Opaque traced/frozen model artifact
    type Artifact;

    /// Disable the JIT linear-repack fast path
    fn disable_linear_repack(&self) -> ExternalResult<()>;

    /// Toggle the tensor-expression fuser
    fn set_fuser_enabled(&self, enabled: bool) -> ExternalResult<()>;

    /// Generic int8 transformer optimization, in place
    fn optimize(&self, model: &mut M, request: &OptimizeRequest) -> ExternalResult<()>;

    /// Apply weight-only quantization, in place
    fn quantize_weight_only(
        &self,
        model: &mut M,
        qconfig: &WeightOnlyQConfig,
        compute: ComputeMode,
    ) -> ExternalResult<()>;

    /// Trace the model with example inputs
    fn trace(
        &self,
        model: &M,
        example: &TraceExample,
        compute: ComputeMode,
    ) -> ExternalResult<Self::Artifact>;

    /// Freeze a traced artifact
    fn freeze(&self, artifact: Self::Artifact) -> ExternalResult<Self::Artifact>;

    /// Persist an artifact
    fn save(&self, artifact: &Self::Artifact, path: &Path) -> ExternalResult<()>;

    /// Load a persisted artifact
    fn load(&self, path: &Path) -> ExternalResult<Self::Artifact>;

    /// Route the model's generation through a frozen artifact
    fn attach(&self, model: &mut M, artifact: Self::Artifact) -> ExternalResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawOptions;

    #[test]
    fn test_encoder_decoder_detection() {
        let mut arch = ModelArchitecture {
            model_type: "t5".to_string(),
            dtype: "float32".to_string(),
            num_attention_heads: 8,
            hidden_size: 512,
            num_hidden_layers: 6,
        };
        assert!(arch.is_encoder_decoder());
        arch.model_type = "opt".to_string();
        assert!(!arch.is_encoder_decoder());
    }

    #[test]
    fn test_capabilities_default_off() {
        let caps = Capabilities::default();
        assert!(!caps.token_latency);
        assert!(!caps.trace_graph);
        assert!(!caps.profiling);
    }

    #[test]
    fn test_load_options_benchmark_uses_meta_skeleton() {
        let cfg = RunConfig::resolve(&RawOptions {
            benchmark: true,
            ..RawOptions::default()
        })
        .expect("resolve");
        let options = LoadOptions::for_run(&cfg);
        assert_eq!(options.strategy, LoadStrategy::Skeleton { meta_device: true });
        assert_eq!(options.text_max_length, Some(64));
        assert!(options.torchscript);
    }

    #[test]
    fn test_load_options_default_loads_pretrained() {
        let cfg = RunConfig::resolve(&RawOptions {
            prompt: Some("hi".to_string()),
            ..RawOptions::default()
        })
        .expect("resolve");
        let options = LoadOptions::for_run(&cfg);
        assert_eq!(options.strategy, LoadStrategy::Pretrained);
        assert_eq!(options.text_max_length, None);
    }
}
