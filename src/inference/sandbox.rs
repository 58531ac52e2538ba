use super::adapter::{BackendInput, InferenceAdapter, InferenceOutput, InputKind};
use crate::config::SandboxConfig;
use crate::error::{Result, ScanError};
use crate::interpreter::{ClassScores, WasteLabel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Request sent into the sandboxed runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxRequest {
    RunInference {
        #[serde(rename = "imageDataUrl")]
        image_data_url: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyStatus {
    Success,
    Error,
}

/// `allPredictions` is either keyed by label or already in label order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllPredictions {
    ByLabel(HashMap<String, f32>),
    Ordered(Vec<f32>),
}

/// Message emitted by the sandboxed runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxMessage {
    ModelReady {
        status: ReadyStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    InferenceResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class: Option<usize>,
        #[serde(rename = "className", default, skip_serializing_if = "Option::is_none")]
        class_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        #[serde(
            rename = "allPredictions",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        all_predictions: Option<AllPredictions>,
    },
    InferenceError {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl SandboxMessage {
    fn into_scores(self) -> Result<ClassScores> {
        match self {
            SandboxMessage::InferenceResult {
                class,
                class_name,
                confidence,
                all_predictions,
            } => {
                match all_predictions {
                    Some(AllPredictions::ByLabel(map)) => return ClassScores::from_label_map(&map),
                    Some(AllPredictions::Ordered(scores)) => return Ok(ClassScores::new(scores)),
                    None => {}
                }

                let label = match (class_name, class) {
                    (Some(name), _) => name.parse()?,
                    (None, Some(index)) => WasteLabel::from_index(index).ok_or_else(|| {
                        ScanError::backend(None, format!("class index {} out of range", index))
                    })?,
                    (None, None) => {
                        return Err(ScanError::backend(None, "inference result without a class"))
                    }
                };
                let confidence = confidence.ok_or_else(|| {
                    ScanError::backend(None, "inference result without a confidence")
                })?;
                ClassScores::from_top(label, confidence)
            }
            SandboxMessage::InferenceError { message } => Err(ScanError::backend(None, message)),
            other => Err(ScanError::backend(
                None,
                format!("unexpected sandbox message {:?}", other),
            )),
        }
    }
}

/// Asynchronous request/response channel into a sandboxed runtime
#[async_trait]
pub trait SandboxTransport: Send + Sync {
    /// Bring the sandbox up; a no-op when it is already running
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Tear the sandbox down so the next `open` starts fresh
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, request: SandboxRequest) -> Result<()>;

    /// Next message; fails once the sandbox has gone away. Cancel safe.
    async fn recv(&self) -> Result<SandboxMessage>;
}

fn closed() -> ScanError {
    ScanError::backend(None, "sandbox channel closed")
}

/// Subprocess speaking newline-delimited JSON on stdin/stdout
pub struct ProcessTransport {
    config: SandboxConfig,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<Lines<BufReader<ChildStdout>>>>,
}

impl ProcessTransport {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SandboxTransport for ProcessTransport {
    async fn open(&self) -> Result<()> {
        let mut child_slot = self.child.lock().await;
        if let Some(child) = child_slot.as_mut() {
            if child.try_wait()?.is_none() {
                return Ok(());
            }
            warn!("Sandbox process exited, restarting");
        }

        info!(
            "Starting sandbox runtime: {} {}",
            self.config.command,
            self.config.args.join(" ")
        );
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScanError::BackendInitFailed {
                details: format!("cannot start {}: {}", self.config.command, e),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ScanError::system("sandbox stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScanError::system("sandbox stdout not captured"))?;

        *self.stdin.lock().await = Some(stdin);
        *self.stdout.lock().await = Some(BufReader::new(stdout).lines());
        *child_slot = Some(child);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stdin.lock().await.take();
        self.stdout.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            debug!("Sandbox process stopped");
        }
        Ok(())
    }

    async fn send(&self, request: SandboxRequest) -> Result<()> {
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or_else(closed)?;
        stdin
            .write_all(&line)
            .await
            .map_err(|e| ScanError::backend(None, format!("sandbox write failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| ScanError::backend(None, format!("sandbox write failed: {}", e)))?;
        Ok(())
    }

    async fn recv(&self) -> Result<SandboxMessage> {
        let mut stdout = self.stdout.lock().await;
        let lines = stdout.as_mut().ok_or_else(closed)?;

        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| ScanError::backend(None, format!("sandbox read failed: {}", e)))?
                .ok_or_else(|| ScanError::backend(None, "sandbox process exited"))?;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(message) => return Ok(message),
                // Runtimes may print diagnostics on stdout
                Err(_) => debug!("sandbox: {}", line),
            }
        }
    }
}

/// In-process channel pair; the other end is a [`SandboxHost`]
pub struct ChannelTransport {
    requests: mpsc::Sender<SandboxRequest>,
    messages: Mutex<mpsc::Receiver<SandboxMessage>>,
}

/// Runtime side of a [`ChannelTransport`]
pub struct SandboxHost {
    requests: mpsc::Receiver<SandboxRequest>,
    messages: mpsc::Sender<SandboxMessage>,
}

impl ChannelTransport {
    pub fn pair(capacity: usize) -> (Self, SandboxHost) {
        let (request_tx, request_rx) = mpsc::channel(capacity.max(1));
        let (message_tx, message_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                requests: request_tx,
                messages: Mutex::new(message_rx),
            },
            SandboxHost {
                requests: request_rx,
                messages: message_tx,
            },
        )
    }
}

#[async_trait]
impl SandboxTransport for ChannelTransport {
    async fn send(&self, request: SandboxRequest) -> Result<()> {
        self.requests.send(request).await.map_err(|_| closed())
    }

    async fn recv(&self) -> Result<SandboxMessage> {
        self.messages.lock().await.recv().await.ok_or_else(closed)
    }
}

impl SandboxHost {
    pub async fn recv_request(&mut self) -> Option<SandboxRequest> {
        self.requests.recv().await
    }

    pub async fn send(&self, message: SandboxMessage) -> Result<()> {
        self.messages.send(message).await.map_err(|_| closed())
    }
}

/// Classifier delegating to a model hosted behind a [`SandboxTransport`]
pub struct SandboxClassifier {
    transport: Arc<dyn SandboxTransport>,
    ready_timeout: Duration,
    inference_timeout: Duration,
    ready: AtomicBool,
    exchange: Mutex<()>,
}

impl SandboxClassifier {
    pub fn new(
        transport: Arc<dyn SandboxTransport>,
        ready_timeout: Duration,
        inference_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            ready_timeout,
            inference_timeout,
            ready: AtomicBool::new(false),
            exchange: Mutex::new(()),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(
            Arc::new(ProcessTransport::new(config.clone())),
            Duration::from_secs(config.ready_timeout_seconds),
            Duration::from_secs(config.inference_timeout_seconds),
        )
    }

    async fn wait_for_model(&self) -> Result<()> {
        loop {
            match self.transport.recv().await? {
                SandboxMessage::ModelReady {
                    status: ReadyStatus::Success,
                    ..
                } => return Ok(()),
                SandboxMessage::ModelReady {
                    status: ReadyStatus::Error,
                    message,
                } => {
                    return Err(ScanError::BackendInitFailed {
                        details: message.unwrap_or_else(|| "model failed to load".to_string()),
                    })
                }
                other => debug!("Ignoring {:?} while waiting for model", other),
            }
        }
    }

    /// Drop results left over from an exchange that timed out
    async fn discard_stale(&self) {
        while let Ok(Ok(message)) = timeout(Duration::ZERO, self.transport.recv()).await {
            debug!("Discarding stale sandbox message {:?}", message);
        }
    }

    async fn await_result(&self) -> Result<SandboxMessage> {
        loop {
            match self.transport.recv().await? {
                message @ (SandboxMessage::InferenceResult { .. }
                | SandboxMessage::InferenceError { .. }) => return Ok(message),
                other => debug!("Ignoring {:?} while waiting for result", other),
            }
        }
    }
}

#[async_trait]
impl InferenceAdapter for SandboxClassifier {
    fn name(&self) -> &str {
        "sandbox"
    }

    fn input_kind(&self) -> InputKind {
        InputKind::EncodedImage
    }

    async fn initialize(&self) -> bool {
        let _exchange = self.exchange.lock().await;
        if self.ready.load(Ordering::Acquire) {
            return true;
        }

        let outcome = match self.transport.open().await {
            Ok(()) => timeout(self.ready_timeout, self.wait_for_model())
                .await
                .unwrap_or_else(|_| {
                    Err(ScanError::BackendInitFailed {
                        details: format!(
                            "no model_ready within {}s",
                            self.ready_timeout.as_secs()
                        ),
                    })
                }),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!("Sandbox model ready");
                self.ready.store(true, Ordering::Release);
                true
            }
            Err(e) => {
                error!("Sandbox runtime failed to initialize: {}", e);
                let _ = self.transport.close().await;
                false
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn infer(&self, input: BackendInput) -> Result<InferenceOutput> {
        let image = match input {
            BackendInput::Image(image) => image,
            BackendInput::Tensor(_) => {
                return Err(ScanError::backend(
                    None,
                    "sandbox backend expects an encoded image",
                ))
            }
        };
        if !self.is_ready() {
            return Err(ScanError::BackendNotReady);
        }

        let _exchange = self.exchange.lock().await;
        self.discard_stale().await;

        let started = Instant::now();
        let request = SandboxRequest::RunInference {
            image_data_url: image.to_data_url(),
        };
        drop(image);

        let exchange = async {
            self.transport.send(request).await?;
            self.await_result().await
        };

        let message = match timeout(self.inference_timeout, exchange).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                warn!("Sandbox channel failed: {}", e);
                self.ready.store(false, Ordering::Release);
                return Err(e);
            }
            Err(_) => {
                return Err(ScanError::backend(
                    None,
                    format!(
                        "sandbox inference timed out after {}s",
                        self.inference_timeout.as_secs()
                    ),
                ))
            }
        };

        let scores = message.into_scores()?;
        Ok(InferenceOutput {
            scores,
            elapsed: started.elapsed(),
        })
    }
}
