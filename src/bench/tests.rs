use crate::bench::*;
use crate::config::ComputeMode;
use crate::error::BenchError;
use crate::provider::{CausalLm, GenerateParams, TextTokenizer};
use crate::reference::{ReferenceBackend, ReferenceModel, ReferenceTokenizer};

fn params(max_new_tokens: usize, num_beams: usize) -> GenerateParams {
    GenerateParams {
        max_new_tokens,
        do_sample: false,
        temperature: 0.9,
        num_beams,
        compute: ComputeMode::Fp32,
    }
}

fn model(model_id: &str) -> ReferenceModel {
    ReferenceModel::new(ReferenceBackend::architecture_for(model_id), true)
}

// ============================================================================
// new_token_counts
// ============================================================================

#[test]
fn test_new_tokens_decoder_only() {
    assert_eq!(new_token_counts(&[10], &[42], false), vec![32]);
}

#[test]
fn test_new_tokens_encoder_decoder_uses_output_length() {
    assert_eq!(new_token_counts(&[10], &[15], true), vec![15]);
}

#[test]
fn test_new_tokens_per_batch_element() {
    assert_eq!(new_token_counts(&[5, 7], &[20, 20], false), vec![15, 13]);
}

#[test]
fn test_new_tokens_never_negative() {
    assert_eq!(new_token_counts(&[10], &[4], false), vec![0]);
}

// ============================================================================
// BenchmarkRunner
// ============================================================================

#[test]
fn test_run_marks_warmup_iterations() {
    let mut model = model("facebook/opt-125m");
    let tokenizer = ReferenceTokenizer;
    let mut runner = BenchmarkRunner::new(
        &mut model,
        &tokenizer,
        vec!["hello".to_string()],
        params(4, 1),
        false,
    );

    let mut seen = Vec::new();
    let records = runner
        .run(5, 2, |out| seen.push(out.record.index))
        .expect("run");

    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    let flags: Vec<bool> = records.iter().map(|r| r.warmup).collect();
    assert_eq!(flags, vec![true, true, false, false, false]);
    assert!(records.iter().all(|r| r.new_tokens == vec![4]));
    assert!(records.iter().all(|r| r.token_latency.is_none()));
    assert_eq!(model.generate_calls(), 5);
}

#[test]
fn test_run_decodes_generated_text() {
    let mut model = model("facebook/opt-125m");
    let tokenizer = ReferenceTokenizer;
    let mut runner = BenchmarkRunner::new(
        &mut model,
        &tokenizer,
        vec!["abc".to_string(), "abc".to_string()],
        params(3, 4),
        false,
    );
    let output = runner.run_iteration(0, false).expect("iteration");
    assert_eq!(output.texts.len(), 2);
    assert!(output.texts[0].starts_with("abc"));
    assert_eq!(output.texts[0].len(), 6);
    assert_eq!(output.texts[0], output.texts[1]);
}

#[test]
fn test_encoder_decoder_iteration_counts_output_only() {
    let mut model = model("google/t5-base");
    let tokenizer = ReferenceTokenizer;
    let mut runner = BenchmarkRunner::new(
        &mut model,
        &tokenizer,
        vec!["translate this".to_string()],
        params(15, 1),
        false,
    );
    let output = runner.run_iteration(0, false).expect("iteration");
    assert_eq!(output.record.new_tokens, vec![15]);
}

#[test]
fn test_failure_aborts_run_without_retry() {
    let mut model = model("facebook/opt-125m").with_generate_failure_at(3);
    let tokenizer = ReferenceTokenizer;
    let mut runner = BenchmarkRunner::new(
        &mut model,
        &tokenizer,
        vec!["x".to_string()],
        params(2, 1),
        false,
    );

    let mut completed = 0;
    let err = runner.run(10, 1, |_| completed += 1).unwrap_err();
    assert!(err.is_external());
    assert_eq!(completed, 3);
    assert_eq!(model.generate_calls(), 4);
}

#[test]
fn test_token_latency_collected_when_enabled() {
    let mut model = model("facebook/opt-125m");
    model.enable_token_latency().expect("enable");
    let tokenizer = ReferenceTokenizer;
    let mut runner = BenchmarkRunner::new(
        &mut model,
        &tokenizer,
        vec!["hi".to_string()],
        params(6, 1),
        true,
    );
    let records = runner.run(3, 1, |_| {}).expect("run");
    let summary = LatencySummary::from_records(&records, true).expect("summary");
    let token = summary.token_latency.expect("token");
    assert_eq!(token.next_token.expect("next").samples, 2 * 5);
}

#[test]
fn test_token_latency_requested_but_not_reported() {
    let mut model = model("facebook/opt-125m");
    let tokenizer = ReferenceTokenizer;
    let mut runner = BenchmarkRunner::new(
        &mut model,
        &tokenizer,
        vec!["hi".to_string()],
        params(2, 1),
        true,
    );
    match runner.run_iteration(0, false) {
        Err(BenchError::ExternalCall { operation, .. }) => assert_eq!(operation, "generate"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn test_profile_pass_captures_active_step_only() {
    let mut model = model("facebook/opt-125m");
    let tokenizer = ReferenceTokenizer;
    let mut runner = BenchmarkRunner::new(
        &mut model,
        &tokenizer,
        vec!["hi".to_string()],
        params(2, 1),
        false,
    );
    let table = run_profile_pass(&mut runner, ProfileSchedule::default())
        .expect("profile")
        .expect("table");

    assert!(!table.is_empty());
    assert!(table.windows(2).all(|w| w[0].self_time >= w[1].self_time));
    // one captured generate: embedding runs once per step plus prefill
    let embedding = table.iter().find(|r| r.name == "aten::embedding").expect("row");
    assert_eq!(embedding.calls, 3);
    assert_eq!(model.generate_calls(), 5);
}

#[test]
fn test_tokenizer_batch_replication_lengths() {
    let tokenizer = ReferenceTokenizer;
    let ids = tokenizer
        .encode_batch(&crate::prompt::replicate_batch("abcd", 3))
        .expect("encode");
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|seq| seq.len() == 5));
}
