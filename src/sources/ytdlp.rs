use anyhow::Result;
use async_trait::async_trait;
use std::{
    io::{self, Read},
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, Command},
    sync::{watch, Mutex},
};
use tokio_util::{io::SyncIoBridge, sync::CancellationToken};
use tracing::{debug, info, warn};

use super::{MediaFetcher, SourceHandle, Termination, TrackSource};
use crate::audio::error::PlaybackError;

/// How long to wait for the process's own exit once its stdout is closed.
const EXIT_REPORT_GRACE: Duration = Duration::from_secs(2);

/// Fetches audio by piping `yt-dlp -o -` into the voice driver.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    command: Vec<String>,
    format: String,
    first_byte_timeout: Duration,
}

impl YtDlpFetcher {
    /// `command` is the program followed by any fixed leading arguments
    /// (e.g. `["python3", "-m", "yt_dlp"]`).
    pub fn new(command: Vec<String>, format: impl Into<String>, first_byte_timeout: Duration) -> Self {
        Self {
            command,
            format: format.into(),
            first_byte_timeout,
        }
    }

    fn build_command(&self, reference: &str) -> Result<Command, PlaybackError> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| unavailable(reference, "yt-dlp command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(["-f", &self.format])
            .args(["--no-playlist", "--quiet", "--no-warnings"])
            .args(["-o", "-"])
            // la referencia nunca debe interpretarse como opción
            .arg("--")
            .arg(reference)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch(&self, reference: &str) -> Result<TrackSource, PlaybackError> {
        let mut child = self
            .build_command(reference)?
            .spawn()
            .map_err(|e| unavailable(reference, format!("failed to spawn yt-dlp: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| unavailable(reference, "yt-dlp stdout not captured"))?;
        let stderr = child.stderr.take();

        let token = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let drained = Arc::new(AtomicBool::new(false));
        tokio::spawn(supervise(
            child,
            stderr,
            token.clone(),
            drained.clone(),
            exit_tx,
            reference.to_string(),
        ));
        let mut handle = SourceHandle::new(token, exit_rx);

        let mut reader = BufReader::new(stdout);
        let first_byte = tokio::time::timeout(self.first_byte_timeout, async {
            reader.fill_buf().await.map(|buf| buf.is_empty())
        })
        .await;

        match first_byte {
            Ok(Ok(false)) => {}
            Ok(Ok(true)) => {
                // stdout cerrado sin audio: el motivo suele estar en stderr
                let reason = match tokio::time::timeout(EXIT_REPORT_GRACE, handle.wait()).await {
                    Ok(Termination::Failed(detail)) => detail,
                    _ => "process produced no audio".to_string(),
                };
                handle.cancel();
                return Err(unavailable(reference, reason));
            }
            Ok(Err(e)) => {
                handle.cancel();
                return Err(unavailable(reference, format!("failed to read audio: {e}")));
            }
            Err(_) => {
                handle.cancel();
                return Err(PlaybackError::FirstByteTimeout {
                    reference: reference.to_string(),
                    timeout: self.first_byte_timeout,
                });
            }
        }

        debug!("🎧 Primer byte recibido para {}", reference);
        Ok(TrackSource::new(
            reference,
            Box::new(DrainTracked {
                inner: SyncIoBridge::new(reader),
                drained,
            }),
            handle,
        ))
    }
}

/// Records when the reader has seen end of file.
struct DrainTracked<R> {
    inner: R,
    drained: Arc<AtomicBool>,
}

impl<R: Read> Read for DrainTracked<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.drained.store(true, Ordering::Release);
        }
        Ok(n)
    }
}

/// Waits for the process to exit or be cancelled, whichever happens first,
/// and publishes exactly one [`Termination`].
///
/// A cancel that arrives after the reader drained stdout does not kill the
/// process: it is already exiting on its own, and its exit status is what
/// gets reported.
async fn supervise(
    mut child: Child,
    stderr: Option<ChildStderr>,
    token: CancellationToken,
    drained: Arc<AtomicBool>,
    exit_tx: watch::Sender<Option<Termination>>,
    reference: String,
) {
    let last_stderr = Arc::new(Mutex::new(None::<String>));
    let stderr_task = stderr.map(|stderr| tokio::spawn(drain_stderr(stderr, last_stderr.clone())));

    let outcome = tokio::select! {
        biased;
        status = child.wait() => exit_outcome(status),
        _ = token.cancelled() => {
            let own_exit = if drained.load(Ordering::Acquire) {
                tokio::time::timeout(EXIT_REPORT_GRACE, child.wait()).await.ok()
            } else {
                None
            };
            match own_exit {
                Some(status) => exit_outcome(status),
                None => {
                    if let Err(e) = child.kill().await {
                        debug!("kill de yt-dlp para {} falló: {:?}", reference, e);
                    }
                    Termination::Cancelled
                }
            }
        }
    };

    let outcome = match outcome {
        Termination::Failed(status) => {
            if let Some(task) = stderr_task {
                let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
            }
            let detail = match last_stderr.lock().await.take() {
                Some(line) => format!("{status}: {line}"),
                None => status,
            };
            warn!("⚠️ yt-dlp terminó inesperadamente para {}: {}", reference, detail);
            Termination::Failed(detail)
        }
        Termination::Cancelled => {
            debug!("🛑 yt-dlp cancelado para {}", reference);
            Termination::Cancelled
        }
        Termination::Completed => {
            debug!("✅ yt-dlp terminó para {}", reference);
            Termination::Completed
        }
    };

    let _ = exit_tx.send(Some(outcome));
}

fn exit_outcome(status: io::Result<ExitStatus>) -> Termination {
    match status {
        Ok(status) if status.success() => Termination::Completed,
        Ok(status) => Termination::Failed(status.to_string()),
        Err(e) => Termination::Failed(format!("failed to wait for yt-dlp: {e}")),
    }
}

async fn drain_stderr(stderr: ChildStderr, last: Arc<Mutex<Option<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        debug!("yt-dlp: {}", line);
        *last.lock().await = Some(line);
    }
}

fn unavailable(reference: &str, reason: impl Into<String>) -> PlaybackError {
    PlaybackError::SourceUnavailable {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}

/// Checks that the configured yt-dlp command runs.
pub async fn verify_dependencies(command: &[String]) -> Result<()> {
    let (program, leading) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("yt-dlp command is empty"))?;

    let output = Command::new(program)
        .args(leading)
        .arg("--version")
        .output()
        .await?;

    if output.status.success() {
        let version = String::from_utf8_lossy(&output.stdout);
        info!("✅ yt-dlp versión: {}", version.trim());
        Ok(())
    } else {
        anyhow::bail!("yt-dlp no disponible ({})", output.status)
    }
}
