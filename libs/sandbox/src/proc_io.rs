//! Stdio wiring shared by the process-backed providers (container, microVM):
//! child stdin/stdout become the agent channel, stderr is captured to a
//! bounded per-session host log, and process exit is observed.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelHub;

/// Stderr capture cap per session. On overflow the file is truncated and a
/// marker line is written.
const STDERR_LOG_CAP: u64 = 1024 * 1024;

const TRUNCATION_MARKER: &[u8] = b"--- log truncated ---\n";

pub(crate) struct WiredProcess {
    kill: CancellationToken,
    expected_exit: Arc<AtomicBool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl WiredProcess {
    /// Mark the upcoming exit as intentional (pause or terminate) and kill
    /// the child.
    pub(crate) fn kill(&self) {
        self.expected_exit.store(true, Ordering::SeqCst);
        self.kill.cancel();
    }

    pub(crate) fn abort_pumps(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Wire a spawned child into the hub. `on_exit(expected)` runs once after
/// the process is gone and the channel has been notified.
pub(crate) async fn wire_child(
    hub: &Arc<ChannelHub>,
    mut child: Child,
    stderr_log: PathBuf,
    on_exit: impl FnOnce(bool) + Send + 'static,
) -> WiredProcess {
    let mut tasks = Vec::new();

    if let Some(mut stdin) = child.stdin.take() {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        hub.wire_stdin(tx).await;
        tasks.push(tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        }));
    }

    if let Some(stdout) = child.stdout.take() {
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                hub.dispatch_line(line).await;
            }
        }));
    }

    if let Some(stderr) = child.stderr.take() {
        tasks.push(tokio::spawn(capture_stderr(stderr, stderr_log)));
    }

    let kill = CancellationToken::new();
    let expected_exit = Arc::new(AtomicBool::new(false));

    let hub_for_wait = hub.clone();
    let kill_for_wait = kill.clone();
    let expected_for_wait = expected_exit.clone();
    tasks.push(tokio::spawn(async move {
        tokio::select! {
            _ = child.wait() => {}
            _ = kill_for_wait.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        hub_for_wait.notify_peer_exit().await;
        on_exit(expected_for_wait.load(Ordering::SeqCst));
    }));

    WiredProcess {
        kill,
        expected_exit,
        tasks,
    }
}

async fn capture_stderr(stderr: ChildStderr, path: PathBuf) {
    let Ok(mut file) = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    else {
        tracing::warn!(path = %path.display(), "failed to open sandbox stderr log");
        return;
    };

    let mut size = file.metadata().await.map(|meta| meta.len()).unwrap_or(0);
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line_len = line.len() as u64 + 1;
        if size + line_len > STDERR_LOG_CAP {
            let _ = file.set_len(0).await;
            let _ = file.write_all(TRUNCATION_MARKER).await;
            size = TRUNCATION_MARKER.len() as u64;
        }
        if file.write_all(line.as_bytes()).await.is_err() || file.write_all(b"\n").await.is_err() {
            break;
        }
        size += line_len;
    }
}
