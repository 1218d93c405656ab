use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{flatten_sample_id, PROMPT_FILE_SUFFIX};
use crate::error::HarnessError;

/// One dataset item. Immutable after loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub prompt: String,
    /// Set when the engine should read the prompt from a file rather than
    /// the command line. This is the path as the engine sees it.
    pub prompt_file: Option<PathBuf>,
    pub correct_answers: Vec<String>,
    pub incorrect_answers: Vec<String>,
}

impl Sample {
    pub fn inline(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            prompt_file: None,
            correct_answers: Vec::new(),
            incorrect_answers: Vec::new(),
        }
    }

    /// Reference used by the overlap metric: the first correct answer.
    pub fn primary_reference(&self) -> Option<&str> {
        self.correct_answers.first().map(|s| s.trim())
    }
}

/// An ordered, finite sequence of samples. Loading again yields the same
/// sequence, which is all "restartable" needs to mean for a run driver that
/// walks it once.
pub trait SampleSource {
    fn describe(&self) -> String;
    fn load(&self) -> Result<Vec<Sample>, HarnessError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonlRecord {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(alias = "question", alias = "input")]
    prompt: String,
    #[serde(default, alias = "answers")]
    correct_answers: Option<OneOrMany>,
    #[serde(default)]
    incorrect_answers: Option<OneOrMany>,
}

/// One JSON object per line. Blank lines are skipped; ids default to the
/// line's position among records.
pub struct JsonlDataset {
    pub path: PathBuf,
    pub limit: Option<usize>,
}

impl SampleSource for JsonlDataset {
    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }

    fn load(&self) -> Result<Vec<Sample>, HarnessError> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| HarnessError::DatasetLoad {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        let samples = parse_jsonl(&content, self.limit).map_err(|reason| {
            HarnessError::DatasetLoad {
                path: self.path.clone(),
                reason,
            }
        })?;

        info!("Loaded {} samples from {:?}", samples.len(), self.path);
        Ok(samples)
    }
}

pub fn parse_jsonl(content: &str, limit: Option<usize>) -> Result<Vec<Sample>, String> {
    let mut samples = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if limit.is_some_and(|n| samples.len() >= n) {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let rec: JsonlRecord =
            serde_json::from_str(line).map_err(|e| format!("line {}: {}", lineno + 1, e))?;

        let id = match rec.id {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(other) => return Err(format!("line {}: unsupported id {}", lineno + 1, other)),
            None => samples.len().to_string(),
        };

        samples.push(Sample {
            id,
            prompt: rec.prompt,
            prompt_file: None,
            correct_answers: rec.correct_answers.map(OneOrMany::into_vec).unwrap_or_default(),
            incorrect_answers: rec
                .incorrect_answers
                .map(OneOrMany::into_vec)
                .unwrap_or_default(),
        });
    }
    ensure_unique_ids(&samples)?;
    Ok(samples)
}

/// Every sample owns one output file, so ids must stay distinct after
/// flattening.
pub fn ensure_unique_ids(samples: &[Sample]) -> Result<(), String> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for sample in samples {
        if let Some(first) = seen.insert(flatten_sample_id(&sample.id), &sample.id) {
            return Err(format!(
                "duplicate sample id {:?} (clashes with {:?})",
                sample.id, first
            ));
        }
    }
    Ok(())
}

/// Directory of pre-written `*.prompt.txt` files, sorted by name. The
/// sample id is the file name without the suffix.
pub struct PromptDir {
    pub dir: PathBuf,
    /// Where the engine finds the same files, if it runs somewhere else.
    pub device_prefix: Option<PathBuf>,
    pub limit: Option<usize>,
}

impl SampleSource for PromptDir {
    fn describe(&self) -> String {
        format!("prompt-dir:{}", self.dir.display())
    }

    fn load(&self) -> Result<Vec<Sample>, HarnessError> {
        let load_err = |reason: String| HarnessError::DatasetLoad {
            path: self.dir.clone(),
            reason,
        };

        if !self.dir.is_dir() {
            return Err(load_err("not a directory".to_string()));
        }

        let dir = glob::Pattern::escape(&self.dir.to_string_lossy());
        let pattern = Path::new(&dir).join(format!("*{}", PROMPT_FILE_SUFFIX));
        let pattern = pattern.to_string_lossy();
        let mut paths: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| load_err(e.to_string()))?
            .filter_map(|entry| match entry {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("Skipping unreadable prompt file: {}", e);
                    None
                }
            })
            .collect();
        paths.sort();

        let mut samples = Vec::new();
        for path in paths {
            if self.limit.is_some_and(|n| samples.len() >= n) {
                break;
            }
            let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
                continue;
            };
            let id = file_name
                .strip_suffix(PROMPT_FILE_SUFFIX)
                .unwrap_or(file_name)
                .to_string();
            let prompt = std::fs::read_to_string(&path)
                .map_err(|e| load_err(format!("{}: {}", path.display(), e)))?;
            let engine_path = device_path(self.device_prefix.as_deref(), &path, file_name);

            samples.push(Sample {
                id,
                prompt,
                prompt_file: Some(engine_path),
                correct_answers: Vec::new(),
                incorrect_answers: Vec::new(),
            });
        }

        ensure_unique_ids(&samples).map_err(load_err)?;
        info!("Found {} prompt files in {:?}", samples.len(), self.dir);
        Ok(samples)
    }
}

fn device_path(prefix: Option<&Path>, local: &Path, file_name: &str) -> PathBuf {
    match prefix {
        Some(prefix) => prefix.join(file_name),
        None => local.to_path_buf(),
    }
}
