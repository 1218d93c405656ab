use clap::Parser;
use llm_trial_harness::config::*;
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn test_engine_constants() {
    assert_eq!(PERF_LINE_PREFIX, "llama_perf_context_print:");
    assert_eq!(NON_CONVERSATIONAL_FLAG, "-no-cnv");
    assert_eq!(DEFAULT_MAX_NEW_TOKENS, 250);
}

#[test]
fn test_run_defaults() {
    let args = CliArgs::try_parse_from([
        "llm-trial-harness",
        "run",
        "--engine",
        "llama-cli",
        "--dataset",
        "data.jsonl",
        "--semantic-scorer",
        "bleurt.py",
    ])
    .unwrap();

    let Command::Run(run) = args.command else {
        panic!("expected run subcommand");
    };
    assert_eq!(run.metric, MetricKind::Semantic);
    assert_eq!(run.run_dir, PathBuf::from(DEFAULT_RUN_DIR));
    assert_eq!(run.policy.accuracy_denominator, AccuracyDenominator::Scored);
    assert!(!run.policy.pool_exclude_zero_lcs);
    assert!(!run.abort_on_trial_failure);
    assert!(run.trial_timeout_secs.is_none());

    let config = HarnessConfig::from_args(&run);
    assert!(config.trial_timeout.is_none());
    assert_eq!(config.output_prefix, DEFAULT_OUTPUT_PREFIX);
}

#[test]
fn test_run_policy_flags() {
    let args = CliArgs::try_parse_from([
        "llm-trial-harness",
        "-l",
        "harness.log",
        "run",
        "-e",
        "wrapper.sh",
        "--prompt-dir",
        "prompts",
        "--metric",
        "overlap",
        "--accuracy-denominator",
        "submitted",
        "--pool-exclude-zero-lcs",
        "--abort-on-trial-failure",
        "--trial-timeout-secs",
        "90",
    ])
    .unwrap();

    assert_eq!(args.log_file, Some(PathBuf::from("harness.log")));
    let Command::Run(run) = args.command else {
        panic!("expected run subcommand");
    };
    let config = HarnessConfig::from_args(&run);
    assert_eq!(config.metric, MetricKind::Overlap);
    assert_eq!(config.accuracy_denominator, AccuracyDenominator::Submitted);
    assert!(config.pool_exclude_zero_lcs);
    assert!(config.abort_on_trial_failure);
    assert_eq!(config.trial_timeout, Some(Duration::from_secs(90)));

    let policy = config.aggregation_policy();
    assert_eq!(policy.accuracy_denominator, AccuracyDenominator::Submitted);
    assert!(policy.pool_exclude_zero_lcs);
}

#[test]
fn test_dataset_and_prompt_dir_conflict() {
    let result = CliArgs::try_parse_from([
        "llm-trial-harness",
        "run",
        "-e",
        "llama-cli",
        "--dataset",
        "data.jsonl",
        "--prompt-dir",
        "prompts",
    ]);
    assert!(result.is_err());
}

#[test]
fn test_device_prefix_requires_prompt_dir() {
    let result = CliArgs::try_parse_from([
        "llm-trial-harness",
        "run",
        "-e",
        "llama-cli",
        "--dataset",
        "data.jsonl",
        "--device-prompt-prefix",
        "/data/local/tmp",
    ]);
    assert!(result.is_err());
}

#[test]
fn test_score_outputs_args() {
    let args = CliArgs::try_parse_from([
        "llm-trial-harness",
        "score-outputs",
        "out",
        "-d",
        "data.jsonl",
        "--overlap-scorer",
        "rouge.py",
    ])
    .unwrap();
    let Command::ScoreOutputs(score) = args.command else {
        panic!("expected score-outputs subcommand");
    };
    assert_eq!(score.prefix, DEFAULT_OUTPUT_PREFIX);
    assert_eq!(score.output_dir, PathBuf::from("out"));
}

#[test]
fn test_run_dir_layout() {
    let config = HarnessConfig {
        engine: PathBuf::from("llama-cli"),
        run_dir: PathBuf::from("/tmp/run"),
        output_prefix: "sample".to_string(),
        metric: MetricKind::Latency,
        accuracy_denominator: AccuracyDenominator::Scored,
        pool_exclude_zero_lcs: false,
        trial_timeout: None,
        abort_on_trial_failure: false,
    };

    assert_eq!(config.outputs_dir(), PathBuf::from("/tmp/run/outputs"));
    assert_eq!(config.prompts_dir(), PathBuf::from("/tmp/run/prompts"));
    assert_eq!(config.debug_log_path(), PathBuf::from("/tmp/run/debug.log"));
    assert_eq!(config.report_path(), PathBuf::from("/tmp/run/report.txt"));
    assert_eq!(config.report_json_path(), PathBuf::from("/tmp/run/report.json"));
}

#[test]
fn test_output_file_name_flattens_separators() {
    assert_eq!(output_file_name("sample", "12"), "sample_12.txt");
    assert_eq!(output_file_name("sample", "a/b\\c"), "sample_a_b_c.txt");
}
