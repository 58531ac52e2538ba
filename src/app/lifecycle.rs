use super::{ComponentState, ScannerApp, ShutdownReason};
use crate::error::{Result, ScanError};
use crate::events::ScanEvent;
use crate::keyboard_input::KeyboardInputHandler;
use std::time::{Duration, SystemTime};
use tokio::time::timeout;
use tracing::{error, info, warn};

const COMPONENT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

impl ScannerApp {
    /// Open the camera, bring up the backend and start optional inputs.
    ///
    /// A backend that fails to initialize is not fatal: scanning stays
    /// disabled and initialization can be retried.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing wastescan components");

        {
            let mut states = self.component_states.lock().await;
            for component in ["camera", "backend", "scanner"] {
                states.insert(component.to_string(), ComponentState::Stopped);
            }
            if self.keyboard_enabled {
                states.insert("keyboard".to_string(), ComponentState::Stopped);
            }
        }

        self.background_tasks.push(
            self.debug_log
                .attach(&self.event_bus, self.cancellation_token.child_token()),
        );

        self.set_component_state("camera", ComponentState::Starting)
            .await;
        if let Err(e) = self.camera.open().await {
            self.set_component_state("camera", ComponentState::Failed)
                .await;
            error!("Failed to open {} camera: {}", self.camera.name(), e);
            return Err(e);
        }
        self.set_component_state("camera", ComponentState::Running)
            .await;
        info!("Camera '{}' ready", self.camera.name());

        self.initialize_backend().await;

        if self.keyboard_enabled {
            self.set_component_state("keyboard", ComponentState::Starting)
                .await;
            let mut handler = KeyboardInputHandler::new(self.command_sender.clone());
            handler.start().map_err(|e| {
                error!("Failed to start keyboard handler: {}", e);
                e
            })?;
            self.keyboard_handler = Some(handler);
            self.set_component_state("keyboard", ComponentState::Running)
                .await;
        }

        info!("All components initialized");
        Ok(())
    }

    /// (Re)run backend initialization and record the outcome
    pub async fn initialize_backend(&self) -> bool {
        self.set_component_state("backend", ComponentState::Starting)
            .await;

        let ready = self.controller.initialize_backend().await;
        if ready {
            self.set_component_state("backend", ComponentState::Running)
                .await;
            info!("{} backend ready", self.controller.backend_name());
        } else {
            self.set_component_state("backend", ComponentState::Failed)
                .await;
            warn!(
                "{} backend unavailable, scanning disabled until it initializes",
                self.controller.backend_name()
            );
        }
        ready
    }

    /// Stop everything in reverse start order. Returns the process exit code.
    pub async fn shutdown(&mut self, reason: ShutdownReason) -> Result<i32> {
        info!("Beginning graceful shutdown ({})", reason);
        self.event_bus
            .publish(ScanEvent::ShutdownRequested {
                timestamp: SystemTime::now(),
                reason: reason.to_string(),
            })
            .await;

        let mut exit_code = match reason {
            ShutdownReason::Error(_) => 1,
            _ => 0,
        };

        if let Some(mut handler) = self.keyboard_handler.take() {
            self.set_component_state("keyboard", ComponentState::Stopping)
                .await;
            handler.stop().await;
            self.set_component_state("keyboard", ComponentState::Stopped)
                .await;
        }

        self.set_component_state("scanner", ComponentState::Stopping)
            .await;
        if timeout(COMPONENT_STOP_TIMEOUT, self.controller.shutdown())
            .await
            .is_err()
        {
            error!("scanner component stop timeout");
            self.set_component_state("scanner", ComponentState::Failed)
                .await;
            exit_code = 1;
        } else {
            self.set_component_state("scanner", ComponentState::Stopped)
                .await;
        }
        self.set_component_state("backend", ComponentState::Stopped)
            .await;

        if let Err(e) = self.stop_camera().await {
            error!("Error stopping camera: {}", e);
            exit_code = 1;
        }

        self.cancellation_token.cancel();
        for task in self.background_tasks.drain(..) {
            if timeout(Duration::from_secs(1), task).await.is_err() {
                warn!("Background task did not finish in time");
            }
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    async fn stop_camera(&self) -> Result<()> {
        self.set_component_state("camera", ComponentState::Stopping)
            .await;
        match timeout(COMPONENT_STOP_TIMEOUT, self.camera.close()).await {
            Ok(Ok(())) => {
                self.set_component_state("camera", ComponentState::Stopped)
                    .await;
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_component_state("camera", ComponentState::Failed)
                    .await;
                Err(e)
            }
            Err(_) => {
                self.set_component_state("camera", ComponentState::Failed)
                    .await;
                Err(ScanError::system("camera component stop timeout"))
            }
        }
    }
}
