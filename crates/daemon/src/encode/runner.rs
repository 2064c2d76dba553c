//! Encoder process execution
//!
//! Runs one [`EncoderPass`] as a child process, maps its stderr progress into the
//! pass's slice of the encoding phase and checks the produced file.

use super::plan::EncoderPass;
use super::progress_parser::{DiagnosticLines, ProgressParser};
use crate::progress::scale_into;
use crate::subprocess::{describe_exit, wait_or_cancel, TailBuffer, WaitOutcome};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to start encoder: {0}")]
    Spawn(std::io::Error),

    #[error("encoder pass {pass} failed ({status}): {tail}")]
    Failed { pass: u8, status: String, tail: String },

    #[error("encoder pass {pass} produced an empty file at {path}: {tail}")]
    EmptyOutput { pass: u8, path: PathBuf, tail: String },

    #[error("encoding cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes encoder passes.
///
/// `on_progress` receives encoding phase percent already mapped into the pass's
/// `progress_start..progress_end` slice.
#[async_trait::async_trait]
pub trait EncoderExecutor: Send + Sync {
    async fn run_pass(
        &self,
        pass: &EncoderPass,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        cancel: watch::Receiver<bool>,
    ) -> Result<(), EncodeError>;
}

/// Runs passes with the encoder binary.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    kill_timeout: Duration,
    tail_bytes: usize,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, kill_timeout: Duration, tail_bytes: usize) -> Self {
        Self {
            program: program.into(),
            kill_timeout,
            tail_bytes,
        }
    }

    pub fn build_command(&self, pass: &EncoderPass) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&pass.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl EncoderExecutor for ProcessRunner {
    async fn run_pass(
        &self,
        pass: &EncoderPass,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), EncodeError> {
        let mut child = self.build_command(pass).spawn().map_err(EncodeError::Spawn)?;
        tracing::info!(
            pass = pass.number,
            pid = ?child.id(),
            program = %self.program,
            "encoder pass started"
        );

        let stderr = child.stderr.take();
        let mut tail = TailBuffer::new(self.tail_bytes);
        let read_progress = async {
            let Some(mut stderr) = stderr else {
                return;
            };
            let mut parser = ProgressParser::with_duration_hint(pass.expected_duration_ms);
            let mut lines = DiagnosticLines::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                tail.push_bytes(&buf[..n]);
                for line in lines.push(&buf[..n]) {
                    if let Some(fraction) = parser.feed_line(&line) {
                        on_progress(scale_into(pass.progress_start, pass.progress_end, fraction));
                    }
                }
            }
            if let Some(line) = lines.finish() {
                if let Some(fraction) = parser.feed_line(&line) {
                    on_progress(scale_into(pass.progress_start, pass.progress_end, fraction));
                }
            }
        };

        let (outcome, ()) = tokio::join!(
            wait_or_cancel(&mut child, &mut cancel, self.kill_timeout),
            read_progress
        );

        let status = match outcome? {
            WaitOutcome::Cancelled => return Err(EncodeError::Cancelled),
            WaitOutcome::Exited(status) => status,
        };

        if !status.success() {
            return Err(EncodeError::Failed {
                pass: pass.number,
                status: describe_exit(&status),
                tail: tail.contents(),
            });
        }

        if let Some(path) = &pass.output {
            let len = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
            if len == 0 {
                return Err(EncodeError::EmptyOutput {
                    pass: pass.number,
                    path: path.clone(),
                    tail: tail.contents(),
                });
            }
        }

        on_progress(pass.progress_end);
        tracing::info!(pass = pass.number, "encoder pass finished");
        Ok(())
    }
}
