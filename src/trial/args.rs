use std::path::{Path, PathBuf};

use crate::config::{NON_CONVERSATIONAL_FLAG, PROMPT_QUOTE_REPLACEMENT};
use crate::settings::TrialConfig;

/// How the prompt reaches the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptDelivery {
    Inline(String),
    File(PathBuf),
}

/// Replace quote characters that the engine wrapper's shell re-quoting
/// would break on. Lossy: the engine never sees the original quotes.
pub fn sanitize_prompt(prompt: &str) -> String {
    prompt
        .chars()
        .map(|c| match c {
            '\'' | '"' => PROMPT_QUOTE_REPLACEMENT,
            other => other,
        })
        .collect()
}

/// Ordered engine arguments for one trial.
pub fn build_args(config: &TrialConfig, prompt: &PromptDelivery) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    if let Some(model) = &config.model {
        push("-m", model.display().to_string());
    }
    match prompt {
        PromptDelivery::Inline(text) => push("-p", sanitize_prompt(text)),
        PromptDelivery::File(path) => push("-f", path.display().to_string()),
    }
    push("-n", config.max_new_tokens.to_string());
    if let Some(v) = config.threads {
        push("-t", v.to_string());
    }
    if let Some(v) = config.ctx_size {
        push("-c", v.to_string());
    }
    if let Some(v) = config.batch_size {
        push("-b", v.to_string());
    }
    if let Some(v) = config.ubatch_size {
        push("-ub", v.to_string());
    }
    if let Some(v) = &config.cache_type_k {
        push("-ctk", v.clone());
    }
    if let Some(v) = &config.cache_type_v {
        push("-ctv", v.clone());
    }
    if let Some(v) = config.temperature {
        push("--temp", v.to_string());
    }
    if let Some(v) = config.repeat_penalty {
        push("--repeat-penalty", v.to_string());
    }
    if let Some(v) = config.top_p {
        push("--top-p", v.to_string());
    }
    if let Some(v) = config.top_k {
        push("--top-k", v.to_string());
    }
    if let Some(v) = config.keep {
        push("--keep", v.to_string());
    }
    if let Some(v) = config.flash_attn {
        push("-fa", v.as_arg().to_string());
    }
    if let Some(v) = config.poll {
        push("--poll", v.to_string());
    }

    let mut out = vec![NON_CONVERSATIONAL_FLAG.to_string()];
    out.extend(args);
    if config.context_shift {
        out.push("--context-shift".to_string());
    }
    if config.mmap == Some(false) {
        out.push("--no-mmap".to_string());
    }
    out.extend(config.extra_args.iter().cloned());
    out
}

/// Program and leading arguments for the engine. Shell scripts are run
/// through bash so they need not be executable.
pub fn engine_command(engine: &Path) -> (PathBuf, Vec<String>) {
    let is_script = engine.extension().is_some_and(|ext| ext == "sh");
    if is_script {
        (PathBuf::from("bash"), vec![engine.display().to_string()])
    } else {
        (engine.to_path_buf(), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::FlashAttention;

    #[test]
    fn test_sanitize_replaces_both_quote_kinds() {
        assert_eq!(
            sanitize_prompt(r#"What's the "best" answer?"#),
            "What s the  best  answer?"
        );
        assert_eq!(sanitize_prompt("plain"), "plain");
    }

    #[test]
    fn test_minimal_args() {
        let config = TrialConfig::default();
        let args = build_args(&config, &PromptDelivery::Inline("Hi 'there'".into()));
        assert_eq!(args, vec!["-no-cnv", "-p", "Hi  there ", "-n", "250"]);
    }

    #[test]
    fn test_full_surface_in_order() {
        let config = TrialConfig {
            threads: Some(6),
            ctx_size: Some(8192),
            batch_size: Some(512),
            ubatch_size: Some(256),
            cache_type_k: Some("f16".into()),
            cache_type_v: Some("q8_0".into()),
            temperature: Some(0.9),
            repeat_penalty: Some(1.25),
            top_p: Some(0.85),
            top_k: Some(80),
            keep: Some(4),
            flash_attn: Some(FlashAttention::On),
            context_shift: true,
            poll: Some(0),
            mmap: Some(false),
            max_new_tokens: 25,
            extra_args: vec!["--seed".into(), "1".into()],
            ..TrialConfig::default()
        };
        let args = build_args(&config, &PromptDelivery::File(PathBuf::from("p/q.prompt.txt")));
        let expected: Vec<&str> = vec![
            "-no-cnv", "-f", "p/q.prompt.txt", "-n", "25", "-t", "6", "-c", "8192", "-b", "512",
            "-ub", "256", "-ctk", "f16", "-ctv", "q8_0", "--temp", "0.9", "--repeat-penalty",
            "1.25", "--top-p", "0.85", "--top-k", "80", "--keep", "4", "-fa", "on", "--poll", "0",
            "--context-shift", "--no-mmap", "--seed", "1",
        ];
        assert_eq!(args, expected);
    }

    #[test]
    fn test_file_prompt_is_not_sanitized() {
        let args = build_args(
            &TrialConfig::default(),
            &PromptDelivery::File(PathBuf::from("it's.txt")),
        );
        assert_eq!(args[2], "it's.txt");
    }

    #[test]
    fn test_shell_wrapper_runs_through_bash() {
        let (program, lead) = engine_command(Path::new("./run-cli.sh"));
        assert_eq!(program, PathBuf::from("bash"));
        assert_eq!(lead, vec!["./run-cli.sh"]);

        let (program, lead) = engine_command(Path::new("/usr/bin/llama-cli"));
        assert_eq!(program, PathBuf::from("/usr/bin/llama-cli"));
        assert!(lead.is_empty());
    }
}
