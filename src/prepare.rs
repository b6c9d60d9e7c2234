//! Model preparation
//!
//! Loads the model and tokenizer, applies the configured quantization, traces
//! and persists the optimized graph, and in benchmark mode routes generation
//! through a frozen artifact. Every step is a call into the collaborators; the
//! harness only decides the order and what to do on failure.
//!
//! Only the linear-repack fast path is best effort. All other failures stop
//! the run.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::{BenchError, ExternalContext, Result};
use crate::provider::{
    CausalLm, LoadOptions, LoadStrategy, ModelArchitecture, ModelProvider, OptimizeRequest,
    PastKeyValueShape, QuantizationService, TraceExample,
};

/// Length of the example input ids used for tracing
pub const TRACE_INPUT_LENGTH: usize = 32;

/// Rows of the beam-index table in the example past key/values
pub const BEAM_IDX_ROWS: usize = 2048;

// ============================================================================
// Best-effort fast-path toggle
// ============================================================================

/// Outcome of disabling the JIT linear-repack fast path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastPathOutcome {
    /// Fast path disabled
    Disabled,
    /// The framework could not disable it; the run continues
    Unavailable(String),
}

/// Try to disable the linear-repack fast path, never failing the run
pub fn disable_fast_path<M, Q>(service: &Q) -> FastPathOutcome
where
    M: CausalLm,
    Q: QuantizationService<M>,
{
    match service.disable_linear_repack() {
        Ok(()) => FastPathOutcome::Disabled,
        Err(e) => {
            warn!(error = %e, "could not disable linear repack fast path, continuing");
            FastPathOutcome::Unavailable(e.to_string())
        },
    }
}

// ============================================================================
// Trace example inputs
// ============================================================================

/// Build tracing example inputs for a model architecture
///
/// # Errors
///
/// Returns [`BenchError::ConfigError`] if the hidden size does not split
/// evenly across attention heads.
pub fn trace_example(
    arch: &ModelArchitecture,
    batch_size: usize,
    beam_width: usize,
) -> Result<TraceExample> {
    if arch.num_attention_heads == 0 || arch.hidden_size % arch.num_attention_heads != 0 {
        return Err(BenchError::ConfigError(format!(
            "hidden size {} is not divisible by {} attention heads",
            arch.hidden_size, arch.num_attention_heads
        )));
    }
    let head_dim = arch.hidden_size / arch.num_attention_heads;
    let kv = vec![1, arch.num_attention_heads, 1, head_dim];
    let layer = PastKeyValueShape {
        key: kv.clone(),
        value: kv,
        beam_idx: vec![BEAM_IDX_ROWS, batch_size * beam_width],
        offset: vec![1],
    };

    Ok(TraceExample {
        input_ids: vec![1; TRACE_INPUT_LENGTH],
        attention_mask: vec![1; TRACE_INPUT_LENGTH],
        past_key_values: vec![layer; arch.num_hidden_layers],
    })
}

// ============================================================================
// Pipeline
// ============================================================================

/// A model ready for benchmarking
#[derive(Debug)]
pub struct PreparedModel<M, T> {
    /// Optimized model
    pub model: M,
    /// Matching tokenizer
    pub tokenizer: T,
    /// Result of the fast-path toggle
    pub fast_path: FastPathOutcome,
    /// Where the traced artifact was written, if tracing ran
    pub saved_artifact: Option<PathBuf>,
}

/// Load the model, falling back from a meta-device skeleton once
///
/// # Errors
///
/// Propagates the provider error if loading fails (after the fallback, for
/// meta-device skeletons).
pub fn load_model<P: ModelProvider>(provider: &P, config: &RunConfig) -> Result<P::Model> {
    let options = LoadOptions::for_run(config);
    match provider.load_model(&config.model_id, &options) {
        Ok(model) => Ok(model),
        Err(e) if options.strategy == (LoadStrategy::Skeleton { meta_device: true }) => {
            warn!(error = %e, "meta-device construction failed, building skeleton normally");
            let fallback = LoadOptions {
                strategy: LoadStrategy::Skeleton { meta_device: false },
                ..options
            };
            provider
                .load_model(&config.model_id, &fallback)
                .during("load model")
        },
        Err(e) => Err(BenchError::external("load model", e)),
    }
}

/// Run the full preparation pipeline
///
/// # Errors
///
/// Returns the first failing step's error; only the fast-path toggle is
/// allowed to fail silently.
pub fn prepare<B>(backend: &B, config: &RunConfig) -> Result<PreparedModel<B::Model, B::Tokenizer>>
where
    B: ModelProvider + QuantizationService<<B as ModelProvider>::Model>,
{
    let fast_path = disable_fast_path::<B::Model, B>(backend);

    let mut model = load_model(backend, config)?;
    let tokenizer = backend
        .load_tokenizer(&config.model_id)
        .during("load tokenizer")?;
    info!(
        model = %config.model_id,
        dtype = %model.architecture().dtype,
        "model loaded"
    );

    let weight_only = config.quant.weight_only().copied();
    backend
        .optimize(
            &mut model,
            &OptimizeRequest {
                weight_only: weight_only.is_some(),
            },
        )
        .during("optimize")?;

    let mut saved_artifact = None;
    if let Some(qconfig) = weight_only {
        info!(quantization = config.quant.as_str(), "applying weight-only quantization");
        backend
            .quantize_weight_only(&mut model, &qconfig, config.compute)
            .during("weight-only quantization")?;

        let example = trace_example(model.architecture(), config.batch_size, config.beam_width)?;
        let traced = backend
            .trace(&model, &example, config.compute)
            .during("trace")?;
        let frozen = backend.freeze(traced).during("freeze")?;

        std::fs::create_dir_all(&config.output_dir).map_err(|e| BenchError::IoError {
            message: format!(
                "failed to create output directory {}: {e}",
                config.output_dir.display()
            ),
        })?;
        let path = config.artifact_path();
        backend.save(&frozen, &path).during("save artifact")?;
        info!(path = %path.display(), "traced model saved");
        saved_artifact = Some(path);
    }

    if config.benchmark {
        backend.set_fuser_enabled(false).during("disable fuser")?;
        if !model.capabilities().trace_graph {
            info!(
                path = %config.quantized_model_path.display(),
                "loading quantized model"
            );
            let artifact = backend
                .load(&config.quantized_model_path)
                .during("load artifact")?;
            let frozen = backend.freeze(artifact).during("freeze")?;
            backend.attach(&mut model, frozen).during("attach artifact")?;
        }

        if config.token_latency && !model.capabilities().token_latency {
            model
                .enable_token_latency()
                .during("enable token latency")?;
        }
    }

    Ok(PreparedModel {
        model,
        tokenizer,
        fast_path,
        saved_artifact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawOptions;
    use crate::reference::{ReferenceBackend, ReferenceModel};

    fn arch(heads: usize, hidden: usize, layers: usize) -> ModelArchitecture {
        ModelArchitecture {
            model_type: "opt".to_string(),
            dtype: "torch.float32".to_string(),
            num_attention_heads: heads,
            hidden_size: hidden,
            num_hidden_layers: layers,
        }
    }

    #[test]
    fn test_trace_example_shapes() {
        let example = trace_example(&arch(32, 4096, 2), 2, 4).expect("example");
        assert_eq!(example.input_ids, vec![1; 32]);
        assert_eq!(example.attention_mask.len(), 32);
        assert_eq!(example.past_key_values.len(), 2);
        let layer = &example.past_key_values[0];
        assert_eq!(layer.key, vec![1, 32, 1, 128]);
        assert_eq!(layer.value, vec![1, 32, 1, 128]);
        assert_eq!(layer.beam_idx, vec![2048, 8]);
        assert_eq!(layer.offset, vec![1]);
    }

    #[test]
    fn test_trace_example_rejects_uneven_heads() {
        assert!(trace_example(&arch(3, 4096, 1), 1, 1).is_err());
        assert!(trace_example(&arch(0, 4096, 1), 1, 1).is_err());
    }

    #[test]
    fn test_fast_path_failure_is_non_fatal() {
        let backend = ReferenceBackend::new().fail_on("disable_linear_repack");
        let outcome = disable_fast_path::<ReferenceModel, _>(&backend);
        assert!(matches!(outcome, FastPathOutcome::Unavailable(ref msg) if msg.contains("failed")));

        let config = RunConfig::resolve(&RawOptions {
            prompt: Some("hi".to_string()),
            ..RawOptions::default()
        })
        .expect("resolve");
        let prepared = prepare(&backend, &config).expect("prepare continues");
        assert!(matches!(prepared.fast_path, FastPathOutcome::Unavailable(_)));
        assert!(prepared.model.is_optimized());
    }

    #[test]
    fn test_meta_device_fallback() {
        let backend = ReferenceBackend::new().without_meta_device();
        let config = RunConfig::resolve(&RawOptions {
            benchmark: true,
            ..RawOptions::default()
        })
        .expect("resolve");
        let model = load_model(&backend, &config).expect("fallback load");
        assert_eq!(model.architecture().model_type, "opt");
        assert_eq!(backend.calls(), vec!["load_model", "load_model"]);
    }

    #[test]
    fn test_pretrained_load_has_no_fallback() {
        let backend = ReferenceBackend::new().fail_on("load_model");
        let config = RunConfig::resolve(&RawOptions::default()).expect("resolve");
        let err = load_model(&backend, &config).unwrap_err();
        assert!(err.is_external());
        assert_eq!(backend.calls(), vec!["load_model"]);
    }

    #[test]
    fn test_weight_only_pipeline_saves_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output_dir = dir.path().join("out");
        let backend = ReferenceBackend::new();
        let config = RunConfig::resolve(&RawOptions {
            weight_only_quantization: true,
            output_dir: output_dir.clone(),
            ..RawOptions::default()
        })
        .expect("resolve");

        let prepared = prepare(&backend, &config).expect("prepare");
        let saved = prepared.saved_artifact.expect("artifact path");
        assert_eq!(saved, output_dir.join("best_model.pt"));
        assert!(saved.exists());
        assert!(prepared.model.is_weight_only());
        assert!(prepared.model.qconfig().is_some());
        assert_eq!(
            backend.calls(),
            vec![
                "disable_linear_repack",
                "load_model",
                "load_tokenizer",
                "optimize",
                "quantize_weight_only",
                "trace",
                "freeze",
                "save",
            ]
        );
    }

    #[test]
    fn test_benchmark_loads_artifact_and_enables_token_latency() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ReferenceBackend::new();
        let config = RunConfig::resolve(&RawOptions {
            weight_only_quantization: true,
            benchmark: true,
            token_latency: true,
            output_dir: dir.path().to_path_buf(),
            quantized_model_path: dir.path().join("best_model.pt"),
            ..RawOptions::default()
        })
        .expect("resolve");

        let prepared = prepare(&backend, &config).expect("prepare");
        let caps = prepared.model.capabilities();
        assert!(caps.trace_graph);
        assert!(caps.token_latency);
        let artifact = prepared.model.attached_artifact().expect("attached");
        assert!(artifact.frozen);
        assert!(artifact.qconfig.is_some());
        let calls = backend.calls();
        assert!(calls.ends_with(&["set_fuser_enabled", "load", "freeze", "attach"]));
    }

    #[test]
    fn test_benchmark_missing_artifact_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ReferenceBackend::new();
        let config = RunConfig::resolve(&RawOptions {
            int8: true,
            benchmark: true,
            quantized_model_path: dir.path().join("missing.pt"),
            ..RawOptions::default()
        })
        .expect("resolve");
        let err = prepare(&backend, &config).unwrap_err();
        match err {
            BenchError::ExternalCall { operation, .. } => assert_eq!(operation, "load artifact"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
