use super::report::{emit, manual_scan_failure, user_message};
use super::{ScannerApp, ShutdownReason};
use crate::error::{Result, ScanError};
use crate::interpreter::Prediction;
use crate::keyboard_input::UserCommand;
use crate::scan::ScanState;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

impl ScannerApp {
    /// Serve operator commands until a quit command or a termination signal,
    /// then shut down. Returns the process exit code.
    pub async fn run(&mut self) -> Result<i32> {
        info!("Wastescan is running");

        let shutdown_sender = self
            .shutdown_sender
            .take()
            .ok_or_else(|| ScanError::system("Shutdown sender already taken"))?;
        let mut shutdown_receiver = self
            .shutdown_receiver
            .take()
            .ok_or_else(|| ScanError::system("Shutdown receiver already taken"))?;
        let mut commands = self
            .command_receiver
            .take()
            .ok_or_else(|| ScanError::system("Command receiver already taken"))?;

        self.setup_signal_handlers(shutdown_sender);
        let reporter = self.spawn_reporter();
        self.background_tasks.push(reporter);

        let reason = loop {
            tokio::select! {
                received = &mut shutdown_receiver => {
                    break received.map_err(|_| {
                        ScanError::system("Shutdown channel closed unexpectedly")
                    })?;
                }
                command = commands.recv() => match command {
                    Some(UserCommand::Quit) | None => break ShutdownReason::UserRequest,
                    Some(command) => self.handle_command(command).await,
                },
            }
        };

        info!("Shutdown initiated: {}", reason);
        self.shutdown(reason).await
    }

    /// A single manual scan, for one-shot use without the loop
    pub async fn run_once(&self) -> Result<Prediction> {
        self.controller.scan_once().await
    }

    pub(super) async fn handle_command(&self, command: UserCommand) {
        debug!("Handling command {:?}", command);

        match command {
            UserCommand::ScanOnce => {
                // Predictions reach the operator through events
                let controller = self.controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = controller.scan_once().await {
                        debug!("Manual scan failed: {}", e);
                        emit(&manual_scan_failure(&e));
                    }
                });
            }
            UserCommand::ToggleScan => {
                let result = match self.controller.state() {
                    ScanState::Idle => self.controller.start().await,
                    _ => self.controller.stop().await,
                };
                if let Err(e) = result {
                    warn!("Could not toggle scanning: {}", e);
                    emit(&format!("Could not toggle scanning: {}", e));
                }
            }
            UserCommand::RetryBackend => {
                if self.controller.is_backend_ready() {
                    emit("Backend already ready");
                } else {
                    self.initialize_backend().await;
                }
            }
            UserCommand::Quit => {}
        }
    }

    fn spawn_reporter(&self) -> JoinHandle<()> {
        let mut receiver = self.event_bus.subscribe();
        let cancel = self.cancellation_token.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => {
                            if let Some(text) = user_message(&event) {
                                emit(&text);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("Reporter skipped {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn setup_signal_handlers(&self, shutdown_sender: oneshot::Sender<ShutdownReason>) {
        let shutdown_sender = Arc::new(Mutex::new(Some(shutdown_sender)));

        #[cfg(unix)]
        {
            let sender = Arc::clone(&shutdown_sender);
            tokio::spawn(async move {
                let mut sigterm =
                    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                        Ok(sigterm) => sigterm,
                        Err(e) => {
                            error!("Failed to register SIGTERM handler: {}", e);
                            return;
                        }
                    };
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    if let Some(sender) = sender.lock().await.take() {
                        let _ = sender.send(ShutdownReason::Signal("SIGTERM".to_string()));
                    }
                }
            });
        }

        let sender = Arc::clone(&shutdown_sender);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT signal (Ctrl+C)");
                if let Some(sender) = sender.lock().await.take() {
                    let _ = sender.send(ShutdownReason::Signal("SIGINT".to_string()));
                }
            }
        });
    }
}
