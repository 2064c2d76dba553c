//! Shared supervision for the external renderer and encoder processes.

use std::collections::VecDeque;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;

/// Bounded buffer keeping the last `capacity` bytes of a diagnostic stream.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    capacity: usize,
    bytes: VecDeque<u8>,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            bytes: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.push_bytes(line.as_bytes());
        self.push_bytes(b"\n");
    }

    pub fn push_bytes(&mut self, data: &[u8]) {
        self.bytes.extend(data.iter().copied());
        let overflow = self.bytes.len().saturating_sub(self.capacity);
        if overflow > 0 {
            self.bytes.drain(..overflow);
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Contents as text; a multi-byte character cut at the front is replaced.
    pub fn contents(&self) -> String {
        let (a, b) = self.bytes.as_slices();
        let mut joined = Vec::with_capacity(a.len() + b.len());
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        String::from_utf8_lossy(&joined).trim().to_string()
    }
}

/// How a supervised child finished.
#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    Cancelled,
}

/// Wait for `child` to exit unless `cancel` flips to true first.
///
/// On cancellation the child is killed and given `kill_timeout` to be reaped.
pub async fn wait_or_cancel(
    child: &mut Child,
    cancel: &mut watch::Receiver<bool>,
    kill_timeout: Duration,
) -> std::io::Result<WaitOutcome> {
    if *cancel.borrow() {
        terminate(child, kill_timeout).await;
        return Ok(WaitOutcome::Cancelled);
    }

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancelled(cancel) => None,
    };

    match exited {
        Some(status) => Ok(WaitOutcome::Exited(status?)),
        None => {
            terminate(child, kill_timeout).await;
            Ok(WaitOutcome::Cancelled)
        }
    }
}

/// Resolves once the flag is set; pends forever if the sender is gone.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn terminate(child: &mut Child, kill_timeout: Duration) {
    let pid = child.id();
    if let Err(e) = child.start_kill() {
        tracing::debug!(?pid, error = %e, "kill failed, child already exited");
        return;
    }
    match tokio::time::timeout(kill_timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(?pid, %status, "child terminated after cancellation"),
        Ok(Err(e)) => tracing::warn!(?pid, error = %e, "failed to reap killed child"),
        Err(_) => tracing::warn!(
            ?pid,
            timeout_secs = kill_timeout.as_secs(),
            "child did not exit after kill within timeout"
        ),
    }
}

/// Format an exit status for error messages.
pub fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[test]
    fn test_tail_buffer_keeps_last_bytes() {
        let mut tail = TailBuffer::new(10);
        tail.push_line("first line");
        tail.push_line("abc");
        assert_eq!(tail.len(), 10);
        assert_eq!(tail.contents(), "line\nabc");
    }

    #[test]
    fn test_tail_buffer_under_capacity() {
        let mut tail = TailBuffer::new(1024);
        assert!(tail.is_empty());
        tail.push_line("error: something broke");
        assert_eq!(tail.contents(), "error: something broke");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_reports_exit_status() {
        let (_tx, mut rx) = watch::channel(false);
        let mut child = Command::new("sh")
            .args(["-c", "exit 3"])
            .stdout(Stdio::null())
            .spawn()
            .expect("sh should spawn");

        let outcome = wait_or_cancel(&mut child, &mut rx, Duration::from_secs(1))
            .await
            .unwrap();
        match outcome {
            WaitOutcome::Exited(status) => assert_eq!(status.code(), Some(3)),
            WaitOutcome::Cancelled => panic!("not cancelled"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_long_running_child() {
        let (tx, mut rx) = watch::channel(false);
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .expect("sleep should spawn");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let started = std::time::Instant::now();
        let outcome = wait_or_cancel(&mut child, &mut rx, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(child.try_wait().unwrap().is_some());
    }
}
