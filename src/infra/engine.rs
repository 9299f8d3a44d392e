//! Rendering capability backed by an external harness process.
//!
//! The harness (typically a headless browser driver) speaks JSON lines:
//! commands on stdin carry an `op` tag, events on stdout carry an `event`
//! tag. A launched harness first announces `ready`; `render` is answered
//! asynchronously by `rendered` or `error`, every other command by exactly
//! one event.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::render::{
    EngineError, HarnessJob, RenderCapability, RenderSession, RenderSignals,
};
use crate::domain::render::ImageFormat;
use crate::util::lock::mutex_lock;

const LOCK_TARGET: &str = "infra::engine";
const EXITED_MESSAGE: &str = "render harness exited";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEngineConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Directory the harness writes captured images into.
    pub work_dir: PathBuf,
    /// Bound on launch, probe, capture, reset and close round trips.
    pub command_timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum HarnessCommand<'a> {
    Render {
        source_url: &'a str,
        page: u32,
        scale: f64,
        html: &'a str,
    },
    Probe,
    Capture {
        output: &'a str,
        format: &'a str,
        quality: u8,
    },
    Reset,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HarnessEvent {
    Ready,
    Rendered,
    Error { message: String },
    Probe { has_content: bool },
    Captured,
}

#[derive(Debug, Clone)]
pub struct ProcessCapability {
    config: Arc<ProcessEngineConfig>,
}

impl ProcessCapability {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl RenderCapability for ProcessCapability {
    async fn launch(&self) -> Result<Box<dyn RenderSession>, EngineError> {
        let config = &self.config;
        tokio::fs::create_dir_all(&config.work_dir)
            .await
            .map_err(EngineError::io)?;

        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                EngineError::Launch(format!(
                    "failed to spawn `{}`: {err}",
                    config.program.display()
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(EngineError::Launch("harness stdio unavailable".to_string()));
        };

        let armed = Arc::new(Mutex::new(None));
        let (replies_tx, replies) = mpsc::channel(8);
        let reader = tokio::spawn(read_events(stdout, Arc::clone(&armed), replies_tx));

        let mut session = ProcessSession {
            child,
            stdin,
            replies,
            armed,
            reader,
            work_dir: config.work_dir.clone(),
            command_timeout: config.command_timeout,
        };

        match session.next_reply().await {
            Ok(HarnessEvent::Ready) => {
                info!(
                    target = "infra::engine",
                    op = "engine::launch",
                    result = "ok",
                    pid = session.child.id().unwrap_or_default(),
                    "Render harness ready"
                );
                Ok(Box::new(session))
            }
            Ok(other) => {
                Box::new(session).close().await;
                Err(EngineError::Launch(format!("expected ready, got {other:?}")))
            }
            Err(err) => {
                Box::new(session).close().await;
                Err(EngineError::Launch(err.to_string()))
            }
        }
    }
}

struct Armed {
    success: oneshot::Sender<()>,
    error: oneshot::Sender<String>,
}

type ArmedSlot = Arc<Mutex<Option<Armed>>>;

async fn read_events(stdout: ChildStdout, armed: ArmedSlot, replies: mpsc::Sender<HarnessEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(
                    target = "infra::engine",
                    op = "engine::read_events",
                    result = "read_error",
                    error = %err,
                    "Failed to read from render harness"
                );
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<HarnessEvent>(&line) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    target = "infra::engine",
                    op = "engine::read_events",
                    result = "malformed_event",
                    error = %err,
                    line = %line,
                    "Ignoring malformed harness event"
                );
                continue;
            }
        };

        match event {
            HarnessEvent::Rendered => {
                let slot = mutex_lock(&armed, LOCK_TARGET, "rendered").take();
                match slot {
                    Some(slot) => {
                        let _ = slot.success.send(());
                    }
                    None => debug!(
                        target = "infra::engine",
                        op = "engine::read_events",
                        result = "stale_signal",
                        "Dropping render signal with no pending render"
                    ),
                }
            }
            HarnessEvent::Error { message } => {
                let slot = mutex_lock(&armed, LOCK_TARGET, "error").take();
                match slot {
                    Some(slot) => {
                        let _ = slot.error.send(message);
                    }
                    None => {
                        if replies.send(HarnessEvent::Error { message }).await.is_err() {
                            break;
                        }
                    }
                }
            }
            other => {
                if replies.send(other).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(slot) = mutex_lock(&armed, LOCK_TARGET, "eof").take() {
        let _ = slot.error.send(EXITED_MESSAGE.to_string());
    }
}

struct ProcessSession {
    child: Child,
    stdin: ChildStdin,
    replies: mpsc::Receiver<HarnessEvent>,
    armed: ArmedSlot,
    reader: JoinHandle<()>,
    work_dir: PathBuf,
    command_timeout: Duration,
}

impl ProcessSession {
    async fn send(&mut self, command: &HarnessCommand<'_>) -> Result<(), EngineError> {
        let mut line = serde_json::to_vec(command)
            .map_err(|err| EngineError::Protocol(err.to_string()))?;
        line.push(b'\n');
        self.stdin.write_all(&line).await.map_err(EngineError::io)?;
        self.stdin.flush().await.map_err(EngineError::io)
    }

    async fn next_reply(&mut self) -> Result<HarnessEvent, EngineError> {
        match tokio::time::timeout(self.command_timeout, self.replies.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(EngineError::SessionClosed),
            Err(_) => Err(EngineError::Protocol(format!(
                "no reply within {}ms",
                self.command_timeout.as_millis()
            ))),
        }
    }

    async fn round_trip(&mut self, command: &HarnessCommand<'_>) -> Result<HarnessEvent, EngineError> {
        mutex_lock(&self.armed, LOCK_TARGET, "disarm").take();
        self.send(command).await?;
        match self.next_reply().await? {
            HarnessEvent::Error { message } => Err(EngineError::Harness(message)),
            event => Ok(event),
        }
    }
}

#[async_trait]
impl RenderSession for ProcessSession {
    async fn load(&mut self, job: &HarnessJob) -> Result<RenderSignals, EngineError> {
        let (success_tx, success) = oneshot::channel();
        let (error_tx, error) = oneshot::channel();
        *mutex_lock(&self.armed, LOCK_TARGET, "arm") = Some(Armed {
            success: success_tx,
            error: error_tx,
        });

        self.send(&HarnessCommand::Render {
            source_url: job.source_url.as_str(),
            page: job.page,
            scale: job.scale,
            html: &job.html,
        })
        .await?;
        Ok(RenderSignals { success, error })
    }

    async fn probe(&mut self) -> Result<bool, EngineError> {
        match self.round_trip(&HarnessCommand::Probe).await? {
            HarnessEvent::Probe { has_content } => Ok(has_content),
            other => Err(EngineError::Protocol(format!(
                "expected probe result, got {other:?}"
            ))),
        }
    }

    async fn capture(&mut self, format: ImageFormat, quality: u8) -> Result<Bytes, EngineError> {
        let output = self
            .work_dir
            .join(format!("{}.{}", Uuid::new_v4(), format.extension()));
        let output_str = output.to_string_lossy().into_owned();

        let reply = self
            .round_trip(&HarnessCommand::Capture {
                output: &output_str,
                format: format.as_str(),
                quality,
            })
            .await;
        let result = match reply {
            Ok(HarnessEvent::Captured) => tokio::fs::read(&output)
                .await
                .map(Bytes::from)
                .map_err(EngineError::io),
            Ok(other) => Err(EngineError::Protocol(format!(
                "expected captured, got {other:?}"
            ))),
            Err(err) => Err(err),
        };

        match tokio::fs::remove_file(&output).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                target = "infra::engine",
                op = "engine::capture",
                result = "cleanup_failed",
                path = %output.display(),
                error = %err,
                "Failed to remove captured image"
            ),
        }
        result
    }

    async fn reset(&mut self) -> Result<(), EngineError> {
        match self.round_trip(&HarnessCommand::Reset).await? {
            HarnessEvent::Ready => Ok(()),
            other => Err(EngineError::Protocol(format!(
                "expected ready after reset, got {other:?}"
            ))),
        }
    }

    async fn close(self: Box<Self>) {
        let mut this = self;
        let _ = this.send(&HarnessCommand::Close).await;
        match tokio::time::timeout(this.command_timeout, this.child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(
                target = "infra::engine",
                op = "engine::close",
                result = "wait_failed",
                error = %err,
                "Failed to reap render harness"
            ),
            Err(_) => {
                if let Err(err) = this.child.kill().await {
                    warn!(
                        target = "infra::engine",
                        op = "engine::close",
                        result = "kill_failed",
                        error = %err,
                        "Failed to kill unresponsive render harness"
                    );
                }
            }
        }
        this.reader.abort();
    }
}
