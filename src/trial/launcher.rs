use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::HarnessError;

/// How one engine process ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitKind {
    Success,
    Failed(Option<i32>),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub exit: ExitKind,
    /// Diagnostic output written by this process only.
    pub diagnostics: String,
}

/// Everything needed to run the engine once.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub label: &'a str,
    pub program: &'a Path,
    pub args: &'a [String],
    pub stdout_sink: &'a Path,
    pub timeout: Option<Duration>,
}

/// Runs the engine. Implementations must block (await) until the process
/// has exited and its primary output is fully written to `stdout_sink`.
#[allow(async_fn_in_trait)]
pub trait ProcessLauncher {
    async fn launch(&mut self, request: LaunchRequest<'_>) -> Result<LaunchOutcome, HarnessError>;
}

/// Kills the engine's whole process group when dropped, so helpers started
/// by a wrapper script cannot outlive their trial and keep writing to the
/// debug log.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // ESRCH just means the group is already gone.
            unsafe {
                libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

/// Real launcher. Every process shares one run-scoped debug log for its
/// diagnostic stream; the file is closed when the launcher is dropped.
pub struct CommandLauncher {
    debug_log: File,
    debug_log_path: PathBuf,
}

impl CommandLauncher {
    pub fn open(debug_log_path: &Path) -> Result<Self, HarnessError> {
        let debug_log = File::create(debug_log_path)?;
        Ok(Self {
            debug_log,
            debug_log_path: debug_log_path.to_path_buf(),
        })
    }

    /// Read whatever the last process appended after `offset`.
    fn read_since(&self, offset: u64) -> String {
        let read = || -> std::io::Result<String> {
            let mut file = File::open(&self.debug_log_path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        };
        match read() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to read back debug log {:?}: {}", self.debug_log_path, e);
                String::new()
            }
        }
    }
}

impl ProcessLauncher for CommandLauncher {
    async fn launch(&mut self, request: LaunchRequest<'_>) -> Result<LaunchOutcome, HarnessError> {
        writeln!(self.debug_log, "-------- trial {} --------", request.label)?;
        self.debug_log.flush()?;
        let offset = self.debug_log.metadata()?.len();

        let stdout = File::create(request.stdout_sink)?;
        let stderr = self.debug_log.try_clone()?;

        debug!(
            "CMD: {} {}",
            request.program.display(),
            request.args.join(" ")
        );

        let mut command = Command::new(request.program);
        command
            .args(request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| {
                HarnessError::Process(format!(
                    "Failed to spawn {}: {}",
                    request.program.display(),
                    e
                ))
            })?;
        let group = ProcessGroup { pgid: child.id() };

        let status = match request.timeout {
            None => child.wait().await?,
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(
                        "Trial {} timed out after {}s, killing",
                        request.label,
                        limit.as_secs()
                    );
                    drop(group);
                    let _ = child.kill().await;
                    return Ok(LaunchOutcome {
                        exit: ExitKind::TimedOut,
                        diagnostics: self.read_since(offset),
                    });
                }
            },
        };

        drop(group);

        let exit = if status.success() {
            ExitKind::Success
        } else {
            ExitKind::Failed(status.code())
        };

        Ok(LaunchOutcome {
            exit,
            diagnostics: self.read_since(offset),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    struct Fixture {
        dir: TempDir,
        launcher: CommandLauncher,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let launcher = CommandLauncher::open(&dir.path().join("debug.log")).unwrap();
            Self { dir, launcher }
        }

        async fn launch(&mut self, label: &str, script: &str, timeout: Option<Duration>) -> LaunchOutcome {
            let sink = self.dir.path().join(format!("{}.txt", label));
            let args = sh(script);
            self.launcher
                .launch(LaunchRequest {
                    label,
                    program: Path::new("sh"),
                    args: &args,
                    stdout_sink: &sink,
                    timeout,
                })
                .await
                .unwrap()
        }

        fn output(&self, label: &str) -> String {
            std::fs::read_to_string(self.dir.path().join(format!("{}.txt", label))).unwrap()
        }
    }

    #[tokio::test]
    async fn test_stdout_to_sink_and_exit_status() {
        let mut fx = Fixture::new();
        let outcome = fx
            .launch(
                "a",
                "echo Paris; echo 'llama_perf_context_print: eval time = 5.00 ms / 2 runs' >&2; exit 3",
                None,
            )
            .await;

        assert_eq!(outcome.exit, ExitKind::Failed(Some(3)));
        assert_eq!(fx.output("a"), "Paris\n");
        assert!(outcome.diagnostics.contains("eval time = 5.00 ms"));
        assert!(!outcome.diagnostics.contains("Paris"));
    }

    #[tokio::test]
    async fn test_diagnostics_are_per_trial() {
        let mut fx = Fixture::new();
        let first = fx.launch("a", "echo first >&2", None).await;
        let second = fx.launch("b", "echo second >&2", None).await;

        assert_eq!(first.exit, ExitKind::Success);
        assert_eq!(first.diagnostics, "first\n");
        assert_eq!(second.diagnostics, "second\n");

        let log = std::fs::read_to_string(fx.dir.path().join("debug.log")).unwrap();
        assert!(log.contains("-------- trial a --------"));
        assert!(log.contains("-------- trial b --------"));
    }

    #[tokio::test]
    async fn test_timeout_kills_the_trial() {
        let mut fx = Fixture::new();
        let started = Instant::now();
        let outcome = fx
            .launch("slow", "echo second >&2; sleep 10", Some(Duration::from_millis(500)))
            .await;

        assert_eq!(outcome.exit, ExitKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.diagnostics, "second\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_children_of_a_wrapper() {
        let mut fx = Fixture::new();
        // The background job stands in for an engine started by a wrapper
        // script; it would print into the next trial if it survived.
        let timed_out = fx
            .launch(
                "wrapper",
                "(sleep 1; echo late >&2) & sleep 10",
                Some(Duration::from_millis(300)),
            )
            .await;
        assert_eq!(timed_out.exit, ExitKind::TimedOut);

        let next = fx.launch("next", "sleep 2; echo next >&2", None).await;
        assert_eq!(next.diagnostics, "next\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_a_process_error() {
        let dir = TempDir::new().unwrap();
        let mut launcher = CommandLauncher::open(&dir.path().join("debug.log")).unwrap();
        let sink = dir.path().join("out.txt");
        let result = launcher
            .launch(LaunchRequest {
                label: "x",
                program: Path::new("/no/such/engine"),
                args: &[],
                stdout_sink: &sink,
                timeout: None,
            })
            .await;
        assert!(matches!(result, Err(HarnessError::Process(_))));
    }
}
