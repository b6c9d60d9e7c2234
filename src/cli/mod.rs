//! CLI command implementation
//!
//! Holds the argument parser and the run orchestration, kept out of
//! `main.rs` so both can be tested.

// CLI glue code - relaxed lint requirements
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::missing_errors_doc)]

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use crate::bench::{
    report, run_profile_pass, BenchmarkRunner, IterationRecord, LatencySummary, ProfileSchedule,
};
use crate::config::{
    LowpMode, PromptRequest, RawOptions, RunConfig, WeightDtype, DEFAULT_PROMPT_FILE,
};
use crate::error::{BenchError, ExternalContext, Result};
use crate::prepare::{prepare, PreparedModel};
use crate::prompt::{replicate_batch, resolve_prompt, PromptPool};
use crate::provider::{CausalLm, ModelProvider, QuantizationService, TextTokenizer};
use crate::reference::ReferenceBackend;

/// Quantized causal-LM generation benchmark
#[derive(Debug, Parser)]
#[command(name = "genbench")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Model identifier
    #[arg(short, long, default_value = "facebook/opt-6.7b")]
    pub model_id: String,

    /// Prompt-pool family (inferred from the model identifier when omitted)
    #[arg(long)]
    pub model_family: Option<String>,

    /// Maximum new tokens per generation
    #[arg(long, default_value = "32")]
    pub max_new_tokens: usize,

    /// Directory receiving the traced model
    #[arg(long, default_value = "./saved_results")]
    pub output_dir: PathBuf,

    /// Use weight-only quantization
    #[arg(long, alias = "ipex-weight-only-quantization")]
    pub weight_only_quantization: bool,

    /// Static int8 path
    #[arg(long)]
    pub int8: bool,

    /// Enable bf16 autocast (int8-fp32 mixed otherwise)
    #[arg(long)]
    pub int8_bf16_mixed: bool,

    /// Traced model to load in benchmark mode
    #[arg(long, default_value = "./saved_results/best_model.pt")]
    pub quantized_model_path: PathBuf,

    /// Run the benchmark loop
    #[arg(long)]
    pub benchmark: bool,

    /// Input length, used as the prompt-pool key
    #[arg(long, default_value = "32")]
    pub input_tokens: String,

    /// Custom prompt (overrides --input-tokens)
    #[arg(long)]
    pub prompt: Option<String>,

    /// Prompt pool JSON file
    #[arg(long, default_value = DEFAULT_PROMPT_FILE)]
    pub prompt_file: PathBuf,

    /// Total iterations
    #[arg(long, default_value = "100")]
    pub num_iter: usize,

    /// Warm-up iterations excluded from statistics
    #[arg(long, default_value = "10")]
    pub num_warmup: usize,

    /// Batch size
    #[arg(long, default_value = "1")]
    pub batch_size: usize,

    /// Report first and next token latency
    #[arg(long)]
    pub token_latency: bool,

    /// Greedy decoding (beam width 1 instead of 4)
    #[arg(long)]
    pub greedy: bool,

    /// Run the operator profiling pass
    #[arg(long)]
    pub profile: bool,

    /// Low-precision compute mode for weight-only quantization
    #[arg(long, value_enum, default_value = "BF16")]
    pub lowp_mode: LowpMode,

    /// Weight data type for weight-only quantization
    #[arg(long, value_enum, default_value = "INT8")]
    pub weight_dtype: WeightDtype,

    /// Write the summary as JSON
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl From<Cli> for RawOptions {
    fn from(cli: Cli) -> Self {
        Self {
            model_id: cli.model_id,
            model_family: cli.model_family,
            max_new_tokens: cli.max_new_tokens,
            output_dir: cli.output_dir,
            weight_only_quantization: cli.weight_only_quantization,
            int8: cli.int8,
            int8_bf16_mixed: cli.int8_bf16_mixed,
            quantized_model_path: cli.quantized_model_path,
            benchmark: cli.benchmark,
            input_tokens: cli.input_tokens,
            prompt: cli.prompt,
            prompt_file: cli.prompt_file,
            num_iter: cli.num_iter,
            num_warmup: cli.num_warmup,
            batch_size: cli.batch_size,
            token_latency: cli.token_latency,
            greedy: cli.greedy,
            profile: cli.profile,
            lowp_mode: Some(cli.lowp_mode),
            weight_dtype: cli.weight_dtype,
            json_output: cli.json_output,
        }
    }
}

/// Everything a finished benchmark produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Tokenized length of the resolved prompt
    pub prompt_tokens: usize,
    /// Every iteration, warm-up included
    pub records: Vec<IterationRecord>,
    /// Aggregated statistics
    pub summary: LatencySummary,
}

/// Main CLI entrypoint
pub fn entrypoint(cli: Cli) -> Result<()> {
    let config = RunConfig::resolve(&cli.into())?;
    run(&ReferenceBackend::new(), &config).map(|_| ())
}

/// Resolve the benchmark prompt before any model work
///
/// The pool file is only read when no explicit prompt was given.
pub fn benchmark_prompt(config: &RunConfig) -> Result<String> {
    let pool = match &config.prompt {
        PromptRequest::Explicit(_) => PromptPool::default(),
        PromptRequest::Pool { .. } => PromptPool::load(&config.prompt_file)?,
    };
    resolve_prompt(
        &config.prompt,
        &pool,
        &config.model_id,
        config.model_family.as_deref(),
    )
}

/// Prepare the model and, in benchmark mode, run the measured loop
///
/// Returns `None` when benchmarking was not requested (preparation only).
pub fn run<B>(backend: &B, config: &RunConfig) -> Result<Option<RunOutcome>>
where
    B: ModelProvider + QuantizationService<<B as ModelProvider>::Model>,
{
    let prompt = if config.benchmark {
        Some(benchmark_prompt(config)?)
    } else {
        None
    };

    let PreparedModel {
        mut model,
        tokenizer,
        ..
    } = prepare(backend, config)?;
    println!("Data type of the model: {}", model.architecture().dtype);

    let Some(prompt) = prompt else {
        return Ok(None);
    };

    let prompt_tokens = tokenizer
        .encode_batch(std::slice::from_ref(&prompt))
        .during("encode")?
        .first()
        .map_or(0, Vec::len);
    println!("---- Prompt size: {prompt_tokens}");

    let prompts = replicate_batch(&prompt, config.batch_size);
    let mut runner = BenchmarkRunner::new(
        &mut model,
        &tokenizer,
        prompts,
        config.generate_params(),
        config.token_latency,
    );

    info!(
        num_iter = config.num_iter,
        num_warmup = config.num_warmup,
        measured = config.measured_iterations(),
        batch_size = config.batch_size,
        beams = config.beam_width,
        "starting benchmark"
    );
    let records = runner.run(config.num_iter, config.num_warmup, report::print_iteration)?;

    if config.profile {
        if let Some(table) = run_profile_pass(&mut runner, ProfileSchedule::default())? {
            println!("{}", report::format_op_table(&table));
        }
    }

    let summary = LatencySummary::from_records(&records, config.token_latency)?;
    print!("{}", report::format_summary(&summary));

    if let Some(path) = &config.json_output {
        report::JsonReport::new(config, prompt_tokens, &summary).write(path)?;
        info!(path = %path.display(), "report written");
    }

    Ok(Some(RunOutcome {
        prompt_tokens,
        records,
        summary,
    }))
}

/// Exit code for a failed run
#[must_use]
pub fn exit_code(err: &BenchError) -> i32 {
    match err {
        BenchError::ConfigError(_) => 2,
        _ => 1,
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod cli_tests;
