use std::env;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::cost::RateTable;
use crate::decoder::{DecoderKind, select_decoder};
use crate::model::ProjectSummary;
use crate::parser::ProjectParser;

pub const WORKER_SUBCOMMAND: &str = "worker";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("worker i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("worker did not respond within {0:?}")]
    Timeout(Duration),
    #[error("worker exited abnormally: {0}")]
    Exit(String),
    #[error("malformed worker message: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("worker task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTask {
    pub root: PathBuf,
    pub project_ids: Vec<String>,
    pub decoder: DecoderKind,
    pub rates: RateTable,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOutput {
    pub summaries: Vec<ProjectSummary>,
}

#[derive(Debug, Clone)]
pub struct ParseContext {
    pub root: PathBuf,
    pub decoder: DecoderKind,
    pub rates: Arc<RateTable>,
}

impl ParseContext {
    pub fn task(&self, project_ids: Vec<String>) -> WorkerTask {
        WorkerTask {
            root: self.root.clone(),
            project_ids,
            decoder: self.decoder,
            rates: self.rates.as_ref().clone(),
        }
    }

    pub fn parser(&self) -> ProjectParser {
        ProjectParser::new(
            self.root.clone(),
            select_decoder(self.decoder),
            self.rates.clone(),
        )
    }
}

impl WorkerTask {
    pub async fn run(self) -> WorkerOutput {
        let context = ParseContext {
            root: self.root,
            decoder: self.decoder,
            rates: Arc::new(self.rates),
        };
        WorkerOutput {
            summaries: context.parser().parse_many(&self.project_ids).await,
        }
    }
}

/// Runs a [`WorkerTask`] somewhere isolated from the caller and reports
/// either its output or why it could not produce one.
#[async_trait]
pub trait IsolatedExecutor: Send + Sync {
    async fn execute(&self, task: WorkerTask) -> Result<WorkerOutput, ExecutorError>;
}

// Re-invokes an executable with the hidden worker subcommand: one JSON
// task on stdin, one JSON result on stdout, then the child exits.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn current_exe(timeout: Duration) -> io::Result<Self> {
        Ok(Self::new(env::current_exe()?, timeout))
    }
}

#[async_trait]
impl IsolatedExecutor for ProcessExecutor {
    async fn execute(&self, task: WorkerTask) -> Result<WorkerOutput, ExecutorError> {
        let projects = task.project_ids.len();
        let payload = serde_json::to_vec(&task)?;
        let started = Instant::now();

        let mut child = Command::new(&self.program)
            .arg(WORKER_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecutorError::Spawn)?;
        let pid = child.id();
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutorError::Io(io::Error::other("worker stdin unavailable")))?;

        let exchange = async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
            drop(stdin);
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ExecutorError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(ExecutorError::Exit(output.status.to_string()));
        }
        let result: WorkerOutput = serde_json::from_slice(&output.stdout)?;
        debug!(
            pid,
            projects,
            summaries = result.summaries.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "worker finished"
        );
        Ok(result)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessExecutor;

#[async_trait]
impl IsolatedExecutor for InProcessExecutor {
    async fn execute(&self, task: WorkerTask) -> Result<WorkerOutput, ExecutorError> {
        Ok(task.run().await)
    }
}

pub async fn serve_stdio() -> Result<()> {
    let mut raw = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut raw)
        .await
        .context("failed to read worker task from stdin")?;
    let task: WorkerTask = serde_json::from_slice(&raw).context("invalid worker task")?;
    debug!(projects = task.project_ids.len(), "worker task received");

    let output = task.run().await;
    let payload = serde_json::to_vec(&output).context("failed to encode worker output")?;
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(&payload)
        .await
        .context("failed to write worker output")?;
    stdout.flush().await.context("failed to flush worker output")?;
    Ok(())
}
