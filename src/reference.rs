//! Deterministic in-process reference backend
//!
//! Implements every collaborator trait without a tensor framework so the full
//! pipeline (load, quantize, trace, save, reload, generate, profile) can run
//! end to end. Token ids are bytes offset by the special-token range, generated
//! text is a fixed function of the prompt, and per-token latencies come from a
//! simple cost model instead of measured kernels.
//!
//! Failure injection via [`ReferenceBackend::fail_on`] makes any named
//! operation return an error, which is how the harness's no-retry behavior is
//! tested.

use std::cell::RefCell;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ComputeMode, LowpCompute, WeightOnlyQConfig, WeightRepr};
use crate::error::{ExternalError, ExternalResult};
use crate::provider::{
    Capabilities, CausalLm, GenerateParams, GenerationOutput, LoadOptions, LoadStrategy,
    ModelArchitecture, ModelProvider, OpTiming, OptimizeRequest, QuantizationService,
    TextTokenizer, TokenLatency, TraceExample,
};

/// Ids below this value are special tokens
pub const SPECIAL_TOKENS: u32 = 3;
/// Beginning-of-sequence id
pub const BOS_ID: u32 = 2;

// ============================================================================
// Tokenizer
// ============================================================================

/// Byte-level tokenizer with a BOS prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceTokenizer;

impl TextTokenizer for ReferenceTokenizer {
    fn encode_batch(&self, texts: &[String]) -> ExternalResult<Vec<Vec<u32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                std::iter::once(BOS_ID)
                    .chain(text.bytes().map(|b| u32::from(b) + SPECIAL_TOKENS))
                    .collect()
            })
            .collect())
    }

    fn decode_batch(&self, sequences: &[Vec<u32>]) -> ExternalResult<Vec<String>> {
        sequences
            .iter()
            .map(|seq| -> ExternalResult<String> {
                let bytes = seq
                    .iter()
                    .filter(|&&id| id >= SPECIAL_TOKENS)
                    .map(|&id| {
                        u8::try_from(id - SPECIAL_TOKENS).map_err(|_| {
                            ExternalError::from(format!("token id {id} out of vocabulary"))
                        })
                    })
                    .collect::<ExternalResult<Vec<u8>>>()?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            })
            .collect()
    }
}

// ============================================================================
// Model
// ============================================================================

/// Per-token cost model used for reported token latencies
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Prefill cost per prompt token
    pub prefill_per_token: Duration,
    /// Decode cost per generated token per beam
    pub decode_per_token: Duration,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            prefill_per_token: Duration::from_micros(200),
            decode_per_token: Duration::from_millis(20),
        }
    }
}

impl CostModel {
    /// Scale decode cost by weight compression and compute mode
    #[must_use]
    pub fn scaled(self, qconfig: Option<&WeightOnlyQConfig>, compute: ComputeMode) -> Self {
        let mut decode = self.decode_per_token;
        if let Some(cfg) = qconfig {
            decode = match cfg.weight {
                WeightRepr::QInt8 => decode / 2,
                WeightRepr::QUInt4x2 => decode / 3,
            };
            if cfg.lowp != LowpCompute::None {
                decode = decode * 9 / 10;
            }
        }
        if compute.autocast_enabled() {
            decode = decode * 4 / 5;
        }
        Self {
            prefill_per_token: self.prefill_per_token,
            decode_per_token: decode,
        }
    }
}

/// Reference causal language model
#[derive(Debug, Clone)]
pub struct ReferenceModel {
    architecture: ModelArchitecture,
    has_weights: bool,
    token_latency: bool,
    weight_only: bool,
    optimized: bool,
    qconfig: Option<WeightOnlyQConfig>,
    attached: Option<ReferenceArtifact>,
    cost: CostModel,
    capture: bool,
    captured: Vec<OpTiming>,
    fail_generate_at: Option<usize>,
    generate_calls: usize,
}

impl ReferenceModel {
    /// Create a model with the given architecture
    #[must_use]
    pub fn new(architecture: ModelArchitecture, has_weights: bool) -> Self {
        Self {
            architecture,
            has_weights,
            token_latency: false,
            weight_only: false,
            optimized: false,
            qconfig: None,
            attached: None,
            cost: CostModel::default(),
            capture: false,
            captured: Vec::new(),
            fail_generate_at: None,
            generate_calls: 0,
        }
    }

    /// Make the n-th generate call (0-based) fail
    #[must_use]
    pub fn with_generate_failure_at(mut self, call: usize) -> Self {
        self.fail_generate_at = Some(call);
        self
    }

    /// Whether the generic optimization pass ran
    #[must_use]
    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    /// Whether the model was flagged for weight-only quantization
    #[must_use]
    pub fn is_weight_only(&self) -> bool {
        self.weight_only
    }

    /// Applied weight-only configuration
    #[must_use]
    pub fn qconfig(&self) -> Option<&WeightOnlyQConfig> {
        self.qconfig.as_ref()
    }

    /// Artifact generation is routed through
    #[must_use]
    pub fn attached_artifact(&self) -> Option<&ReferenceArtifact> {
        self.attached.as_ref()
    }

    /// Number of generate calls so far
    #[must_use]
    pub fn generate_calls(&self) -> usize {
        self.generate_calls
    }

    fn continuation(prompt: &[u32], count: usize) -> Vec<u32> {
        let seed = prompt.iter().fold(17u32, |acc, &id| acc.wrapping_mul(31).wrapping_add(id));
        (0..count as u32)
            .map(|i| u32::from(b'a') + SPECIAL_TOKENS + (seed.wrapping_add(i * 7) % 26))
            .collect()
    }

    fn record_ops(&mut self, prompt_tokens: usize, new_tokens: usize, beams: usize) {
        let layers = self.architecture.num_hidden_layers as u64;
        let steps = (new_tokens * beams) as u64;
        let decode = self.cost.decode_per_token;
        let rows = [
            ("aten::embedding", decode / 50, steps + 1),
            ("aten::linear", decode / 8, (steps + 1) * layers * 4),
            ("aten::scaled_dot_product_attention", decode / 20, (steps + 1) * layers),
            ("aten::layer_norm", decode / 100, (steps + 1) * layers * 2),
            ("aten::argmax", decode / 200, steps),
        ];
        for (name, per_call, calls) in rows {
            let prefill = self.cost.prefill_per_token * prompt_tokens as u32;
            let self_time = per_call * calls as u32 + prefill / 10;
            self.captured.push(OpTiming {
                name: name.to_string(),
                self_time,
                total_time: self_time + self_time / 4,
                calls,
            });
        }
    }
}

impl CausalLm for ReferenceModel {
    fn architecture(&self) -> &ModelArchitecture {
        &self.architecture
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            token_latency: self.token_latency,
            trace_graph: self.attached.is_some(),
            profiling: true,
        }
    }

    fn enable_token_latency(&mut self) -> ExternalResult<()> {
        self.token_latency = true;
        Ok(())
    }

    fn generate(
        &mut self,
        input_ids: &[Vec<u32>],
        params: &GenerateParams,
    ) -> ExternalResult<GenerationOutput> {
        let call = self.generate_calls;
        self.generate_calls += 1;
        if self.fail_generate_at == Some(call) {
            return Err(format!("generate call {call} failed").into());
        }
        if !self.has_weights && self.attached.is_none() {
            return Err("model has no weights; attach a traced artifact first".into());
        }
        if params.do_sample {
            return Err("sampling is not supported by the reference model".into());
        }

        let new_tokens = params.max_new_tokens;
        let sequences: Vec<Vec<u32>> = input_ids
            .iter()
            .map(|prompt| {
                let generated = Self::continuation(prompt, new_tokens);
                if self.architecture.is_encoder_decoder() {
                    generated
                } else {
                    prompt.iter().copied().chain(generated).collect()
                }
            })
            .collect();

        let prompt_tokens: usize = input_ids.iter().map(Vec::len).sum();
        let beams = params.num_beams.max(1);
        let qconfig = self.attached.as_ref().and_then(|a| a.qconfig).or(self.qconfig);
        let cost = self.cost.scaled(qconfig.as_ref(), params.compute);

        if self.capture {
            self.record_ops(prompt_tokens, new_tokens, beams);
        }

        let token_latency = (self.token_latency && new_tokens > 0).then(|| {
            let step = cost.decode_per_token * beams as u32;
            TokenLatency {
                first: cost.prefill_per_token * prompt_tokens as u32 + step,
                rest: (1..new_tokens)
                    .map(|i| step + Duration::from_micros((i % 5) as u64 * 10))
                    .collect(),
            }
        });

        Ok(GenerationOutput {
            sequences,
            token_latency,
        })
    }

    fn set_op_capture(&mut self, enabled: bool) -> ExternalResult<()> {
        self.capture = enabled;
        Ok(())
    }

    fn take_op_timings(&mut self) -> ExternalResult<Vec<OpTiming>> {
        Ok(std::mem::take(&mut self.captured))
    }
}

// ============================================================================
// Artifact
// ============================================================================

/// Traced model artifact produced by the reference backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceArtifact {
    /// Model type the artifact was traced from
    pub model_type: String,
    /// Weight-only configuration baked into the graph
    pub qconfig: Option<WeightOnlyQConfig>,
    /// Whether autocast was on while tracing
    pub autocast: bool,
    /// Number of decoder layers in the example inputs
    pub layers: usize,
    /// Whether the graph has been frozen
    pub frozen: bool,
}

// ============================================================================
// Backend
// ============================================================================

/// Reference model provider and quantization service
#[derive(Debug)]
pub struct ReferenceBackend {
    fail_on: Option<&'static str>,
    meta_device: bool,
    calls: RefCell<Vec<&'static str>>,
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceBackend {
    /// Create a backend that supports meta-device construction
    #[must_use]
    pub fn new() -> Self {
        Self {
            fail_on: None,
            meta_device: true,
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Make the named operation fail
    #[must_use]
    pub fn fail_on(mut self, operation: &'static str) -> Self {
        self.fail_on = Some(operation);
        self
    }

    /// Disable meta-device construction
    #[must_use]
    pub fn without_meta_device(mut self) -> Self {
        self.meta_device = false;
        self
    }

    /// Operations called so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    fn enter(&self, operation: &'static str) -> ExternalResult<()> {
        self.calls.borrow_mut().push(operation);
        if self.fail_on == Some(operation) {
            return Err(format!("{operation} failed").into());
        }
        Ok(())
    }

    /// Architecture for a model identifier
    #[must_use]
    pub fn architecture_for(model_id: &str) -> ModelArchitecture {
        let id = model_id.to_lowercase();
        let (model_type, heads, hidden, layers) = if id.contains("t5") {
            ("t5", 8, 512, 6)
        } else if id.contains("llama") {
            ("llama", 32, 4096, 32)
        } else if id.contains("gpt-j") || id.contains("gptj") {
            ("gptj", 16, 4096, 28)
        } else {
            ("opt", 32, 4096, 32)
        };
        ModelArchitecture {
            model_type: model_type.to_string(),
            dtype: "torch.float32".to_string(),
            num_attention_heads: heads,
            hidden_size: hidden,
            num_hidden_layers: layers,
        }
    }
}

impl ModelProvider for ReferenceBackend {
    type Model = ReferenceModel;
    type Tokenizer = ReferenceTokenizer;

    fn load_model(&self, model_id: &str, options: &LoadOptions) -> ExternalResult<Self::Model> {
        self.enter("load_model")?;
        let has_weights = match options.strategy {
            LoadStrategy::Skeleton { meta_device } => {
                if meta_device && !self.meta_device {
                    return Err("meta device construction is not supported".into());
                }
                false
            },
            LoadStrategy::Pretrained => true,
        };
        Ok(ReferenceModel::new(Self::architecture_for(model_id), has_weights))
    }

    fn load_tokenizer(&self, _model_id: &str) -> ExternalResult<Self::Tokenizer> {
        self.enter("load_tokenizer")?;
        Ok(ReferenceTokenizer)
    }
}

impl QuantizationService<ReferenceModel> for ReferenceBackend {
    type Artifact = ReferenceArtifact;

    fn disable_linear_repack(&self) -> ExternalResult<()> {
        self.enter("disable_linear_repack")
    }

    fn set_fuser_enabled(&self, _enabled: bool) -> ExternalResult<()> {
        self.enter("set_fuser_enabled")
    }

    fn optimize(
        &self,
        model: &mut ReferenceModel,
        request: &OptimizeRequest,
    ) -> ExternalResult<()> {
        self.enter("optimize")?;
        model.optimized = true;
        model.weight_only = request.weight_only;
        Ok(())
    }

    fn quantize_weight_only(
        &self,
        model: &mut ReferenceModel,
        qconfig: &WeightOnlyQConfig,
        _compute: ComputeMode,
    ) -> ExternalResult<()> {
        self.enter("quantize_weight_only")?;
        if !model.weight_only {
            return Err("model was not flagged for weight-only quantization".into());
        }
        model.qconfig = Some(*qconfig);
        Ok(())
    }

    fn trace(
        &self,
        model: &ReferenceModel,
        example: &TraceExample,
        compute: ComputeMode,
    ) -> ExternalResult<Self::Artifact> {
        self.enter("trace")?;
        if example.past_key_values.len() != model.architecture.num_hidden_layers {
            return Err(format!(
                "example inputs have {} layers, model has {}",
                example.past_key_values.len(),
                model.architecture.num_hidden_layers
            )
            .into());
        }
        Ok(ReferenceArtifact {
            model_type: model.architecture.model_type.clone(),
            qconfig: model.qconfig,
            autocast: compute.autocast_enabled(),
            layers: example.past_key_values.len(),
            frozen: false,
        })
    }

    fn freeze(&self, mut artifact: Self::Artifact) -> ExternalResult<Self::Artifact> {
        self.enter("freeze")?;
        artifact.frozen = true;
        Ok(artifact)
    }

    fn save(&self, artifact: &Self::Artifact, path: &Path) -> ExternalResult<()> {
        self.enter("save")?;
        let json = serde_json::to_vec_pretty(artifact)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn load(&self, path: &Path) -> ExternalResult<Self::Artifact> {
        self.enter("load")?;
        let bytes = std::fs::read(path)
            .map_err(|e| ExternalError::from(format!("cannot open {}: {e}", path.display())))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn attach(&self, model: &mut ReferenceModel, artifact: Self::Artifact) -> ExternalResult<()> {
        self.enter("attach")?;
        if artifact.model_type != model.architecture.model_type {
            return Err(format!(
                "artifact traced from '{}' cannot drive '{}'",
                artifact.model_type, model.architecture.model_type
            )
            .into());
        }
        model.attached = Some(artifact);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(model_id: &str) -> ReferenceModel {
        ReferenceModel::new(ReferenceBackend::architecture_for(model_id), true)
    }

    fn params(max_new_tokens: usize) -> GenerateParams {
        GenerateParams {
            max_new_tokens,
            do_sample: false,
            temperature: 0.9,
            num_beams: 1,
            compute: ComputeMode::Fp32,
        }
    }

    #[test]
    fn test_tokenizer_roundtrip_skips_bos() {
        let tok = ReferenceTokenizer;
        let ids = tok.encode_batch(&["hi there".to_string()]).expect("encode");
        assert_eq!(ids[0].len(), 9);
        assert_eq!(ids[0][0], BOS_ID);
        let text = tok.decode_batch(&ids).expect("decode");
        assert_eq!(text, vec!["hi there"]);
    }

    #[test]
    fn test_decode_rejects_out_of_vocab() {
        let tok = ReferenceTokenizer;
        assert!(tok.decode_batch(&[vec![10_000]]).is_err());
    }

    #[test]
    fn test_decoder_only_echoes_prompt() {
        let mut model = model("facebook/opt-125m");
        let out = model.generate(&[vec![2; 10]], &params(32)).expect("generate");
        assert_eq!(out.sequences[0].len(), 42);
        assert!(out.token_latency.is_none());
    }

    #[test]
    fn test_encoder_decoder_returns_new_tokens_only() {
        let mut model = model("google/t5-small");
        let out = model.generate(&[vec![2; 10]], &params(15)).expect("generate");
        assert_eq!(out.sequences[0].len(), 15);
    }

    #[test]
    fn test_token_latency_shape() {
        let mut model = model("opt");
        model.enable_token_latency().expect("enable");
        assert!(model.capabilities().token_latency);
        let out = model.generate(&[vec![2; 4]], &params(8)).expect("generate");
        let latency = out.token_latency.expect("latency");
        assert_eq!(latency.rest.len(), 7);
        assert!(latency.first > latency.rest[0]);
    }

    #[test]
    fn test_skeleton_needs_artifact() {
        let mut model = ReferenceModel::new(ReferenceBackend::architecture_for("opt"), false);
        assert!(model.generate(&[vec![2]], &params(1)).is_err());
    }

    #[test]
    fn test_injected_generate_failure() {
        let mut model = model("opt").with_generate_failure_at(1);
        assert!(model.generate(&[vec![2]], &params(1)).is_ok());
        assert!(model.generate(&[vec![2]], &params(1)).is_err());
        assert_eq!(model.generate_calls(), 2);
    }

    #[test]
    fn test_cost_model_scaling() {
        let base = CostModel::default();
        let int4 = base.scaled(
            Some(&WeightOnlyQConfig {
                weight: WeightRepr::QUInt4x2,
                lowp: LowpCompute::None,
            }),
            ComputeMode::Fp32,
        );
        assert!(int4.decode_per_token < base.decode_per_token);
        assert_eq!(int4.prefill_per_token, base.prefill_per_token);
    }

    #[test]
    fn test_meta_device_unsupported() {
        let backend = ReferenceBackend::new().without_meta_device();
        let options = LoadOptions {
            strategy: LoadStrategy::Skeleton { meta_device: true },
            text_max_length: None,
            torchscript: true,
        };
        assert!(backend.load_model("opt", &options).is_err());
        let options = LoadOptions {
            strategy: LoadStrategy::Skeleton { meta_device: false },
            ..options
        };
        assert!(backend.load_model("opt", &options).is_ok());
    }

    #[test]
    fn test_artifact_save_load() {
        let backend = ReferenceBackend::new();
        let artifact = ReferenceArtifact {
            model_type: "opt".to_string(),
            qconfig: None,
            autocast: false,
            layers: 32,
            frozen: true,
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("best_model.pt");
        backend.save(&artifact, &path).expect("save");
        assert_eq!(backend.load(&path).expect("load"), artifact);
        assert_eq!(backend.calls(), vec!["save", "load"]);
    }

    #[test]
    fn test_fail_on_records_call() {
        let backend = ReferenceBackend::new().fail_on("disable_linear_repack");
        assert!(backend.disable_linear_repack().is_err());
        assert_eq!(backend.calls(), vec!["disable_linear_repack"]);
    }
}
