//! AST Step (spec §4.8): launches an external parser as a subprocess,
//! mounting the repository read-only and letting it write symbol/binding
//! data to the graph store directly. This step itself never touches
//! `GraphStore` — it only supervises the subprocess and surfaces its
//! outcome. Grounded on the teacher's `GitExecutor::run_command` (external
//! process invocation, exit-status-is-truth), generalized to `tokio::process`
//! so stdout can be streamed for log-derived progress while the job runs.

use async_trait::async_trait;
use ingraph_pipeline::contract::{Step, StepOptions, StepStatus};
use ingraph_pipeline::error::{ErrorKind, Result, StepError};
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::progress::JobTable;

/// Matches a progress line the parser writes to stdout, e.g. `PROGRESS 42%`.
/// Parsers that never emit this simply leave progress at its last known
/// value until exit.
fn progress_regex() -> Regex {
    Regex::new(r"PROGRESS\s+(\d{1,3})%").expect("static regex is valid")
}

/// The external parser binary and any fixed arguments that precede the
/// repository path. Configurable per deployment since the parser is opaque
/// to this step (spec §4.8: "an opaque external parser").
#[derive(Debug, Clone)]
pub struct ParserCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ParserCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

pub struct AstStep {
    parser: ParserCommand,
    jobs: JobTable,
}

impl AstStep {
    pub fn new(parser: ParserCommand) -> Self {
        Self {
            parser,
            jobs: JobTable::new(),
        }
    }
}

#[async_trait]
impl Step for AstStep {
    fn name(&self) -> &str {
        "ast"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["filesystem".to_string()]
    }

    async fn run(&self, job_id: Uuid, repo_path: PathBuf, options: StepOptions) -> Result<()> {
        let (status, cancellation) = self.jobs.start(job_id);
        let parser = self.parser.clone();
        let task = tokio::spawn(async move {
            let outcome = run_parser(job_id, parser, repo_path, options, status.clone(), cancellation.clone()).await;
            match outcome {
                Ok(()) if cancellation.is_cancelled() => *status.lock() = StepStatus::cancelled(),
                Ok(()) => *status.lock() = StepStatus::completed(),
                Err(err) => *status.lock() = StepStatus::failed(err),
            }
        });
        self.jobs.attach_task(job_id, task);
        Ok(())
    }

    async fn status(&self, job_id: Uuid) -> Result<StepStatus> {
        self.jobs.status(job_id)
    }

    async fn stop(&self, job_id: Uuid) -> Result<()> {
        self.jobs.stop(job_id);
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.jobs.cancel(job_id);
        Ok(())
    }
}

fn parser_args(options: &StepOptions) -> Vec<String> {
    options
        .get("parser_args")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

#[instrument(skip(parser, status, cancellation), fields(job_id = %job_id))]
async fn run_parser(
    job_id: Uuid,
    parser: ParserCommand,
    repo_path: PathBuf,
    options: StepOptions,
    status: Arc<parking_lot::Mutex<StepStatus>>,
    cancellation: CancellationToken,
) -> std::result::Result<(), StepError> {
    if !repo_path.is_dir() {
        return Err(StepError::new(
            ErrorKind::PermanentInput,
            format!("repository path is not a directory: {}", repo_path.display()),
        ));
    }

    let mut command = Command::new(&parser.program);
    command
        .args(&parser.args)
        .args(parser_args(&options))
        .arg(&repo_path)
        .env("INGRAPH_JOB_ID", job_id.to_string())
        .env("INGRAPH_REPO_PATH_READONLY", "1")
        .current_dir(&repo_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| StepError::new(ErrorKind::ToolFailure, format!("failed to launch parser {}: {e}", parser.program)))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let progress_re = progress_regex();

    let stdout_task = {
        let status = status.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut last_percent = 0u8;
            loop {
                if cancellation.is_cancelled() {
                    return;
                }
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(captures) = progress_re.captures(&line) {
                            if let Ok(pct) = captures[1].parse::<u8>() {
                                last_percent = pct.min(100);
                            }
                        }
                        *status.lock() = StepStatus::running(last_percent, line);
                    }
                    _ => return,
                }
            }
        })
    };

    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stderr_output = String::new();
    while let Ok(Some(line)) = stderr_lines.next_line().await {
        stderr_output.push_str(&line);
        stderr_output.push('\n');
    }

    let exit_status = child
        .wait()
        .await
        .map_err(|e| StepError::new(ErrorKind::ToolFailure, format!("parser process error: {e}")))?;
    stdout_task.abort();

    if cancellation.is_cancelled() {
        info!("ast step: cancellation observed, parser terminated early");
        return Ok(());
    }

    if !exit_status.success() {
        warn!(code = ?exit_status.code(), stderr = %stderr_output, "ast parser exited non-zero");
        return Err(StepError::new(
            ErrorKind::ToolFailure,
            format!("parser exited with {:?}: {}", exit_status.code(), stderr_output.trim()),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn run_to_completion(step: &AstStep, job_id: Uuid, repo: &std::path::Path) {
        step.run(job_id, repo.to_path_buf(), serde_json::json!({})).await.unwrap();
        for _ in 0..200 {
            let status = step.status(job_id).await.unwrap();
            if status.state.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("ast step did not terminate");
    }

    #[tokio::test]
    async fn test_successful_parser_run_completes() {
        let repo = tempfile::TempDir::new().unwrap();
        let step = AstStep::new(ParserCommand::new("/bin/sh").with_args(vec![
            "-c".to_string(),
            "echo 'PROGRESS 50%'; echo 'PROGRESS 100%'; exit 0".to_string(),
        ]));
        let job_id = Uuid::new_v4();
        run_to_completion(&step, job_id, repo.path()).await;

        let status = step.status(job_id).await.unwrap();
        assert_eq!(status.state, ingraph_jobs::StepState::Completed);
    }

    #[tokio::test]
    async fn test_nonzero_exit_surfaces_tool_failure() {
        let repo = tempfile::TempDir::new().unwrap();
        let step = AstStep::new(ParserCommand::new("/bin/sh").with_args(vec![
            "-c".to_string(),
            "echo 'parse error: unexpected token' >&2; exit 1".to_string(),
        ]));
        let job_id = Uuid::new_v4();
        run_to_completion(&step, job_id, repo.path()).await;

        let status = step.status(job_id).await.unwrap();
        assert_eq!(status.state, ingraph_jobs::StepState::Failed);
        let error = status.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ToolFailure);
        assert!(error.message.contains("unexpected token"));
    }

    #[tokio::test]
    async fn test_missing_repo_path_is_permanent_input_error() {
        let step = AstStep::new(ParserCommand::new("/bin/true"));
        let job_id = Uuid::new_v4();
        step.run(job_id, PathBuf::from("/does/not/exist"), serde_json::json!({}))
            .await
            .unwrap();
        for _ in 0..200 {
            let status = step.status(job_id).await.unwrap();
            if status.state.is_terminal() {
                assert_eq!(status.state, ingraph_jobs::StepState::Failed);
                assert_eq!(status.error.unwrap().kind, ErrorKind::PermanentInput);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("ast step did not terminate");
    }

    #[tokio::test]
    async fn test_dependencies_include_filesystem() {
        let step = AstStep::new(ParserCommand::new("/bin/true"));
        assert_eq!(step.dependencies(), vec!["filesystem".to_string()]);
    }
}
