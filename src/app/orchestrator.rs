use super::types::{ComponentState, ShutdownReason};
use crate::camera::{CameraBuilder, ImageCapture};
use crate::config::WastescanConfig;
use crate::debug_log::DebugLog;
use crate::error::Result;
use crate::events::EventBus;
use crate::inference::{build_adapter, InferenceAdapter};
use crate::interpreter::ResultInterpreter;
use crate::keyboard_input::{KeyboardInputHandler, UserCommand};
use crate::preprocess::FramePreprocessor;
use crate::scan::ScanLoopController;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Wires camera, backend and scan loop together and owns their lifecycle
pub struct ScannerApp {
    pub(super) config: WastescanConfig,
    pub(super) event_bus: EventBus,
    pub(super) debug_log: DebugLog,

    pub(super) camera: Arc<dyn ImageCapture>,
    pub(super) controller: ScanLoopController,

    pub(super) keyboard_handler: Option<KeyboardInputHandler>,
    pub(super) keyboard_enabled: bool,
    pub(super) command_sender: mpsc::Sender<UserCommand>,
    pub(super) command_receiver: Option<mpsc::Receiver<UserCommand>>,

    pub(super) component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    pub(super) background_tasks: Vec<JoinHandle<()>>,
    pub(super) shutdown_sender: Option<oneshot::Sender<ShutdownReason>>,
    pub(super) shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    pub(super) cancellation_token: CancellationToken,
}

impl ScannerApp {
    /// Build every component from configuration. Nothing is opened or
    /// contacted until [`initialize`](Self::initialize).
    pub fn new(config: WastescanConfig) -> Result<Self> {
        let camera = CameraBuilder::new().config(config.camera.clone()).build()?;
        let adapter = build_adapter(&config)?;
        Ok(Self::with_components(config, camera, adapter))
    }

    /// Build around an already constructed camera and backend
    pub fn with_components(
        config: WastescanConfig,
        camera: Arc<dyn ImageCapture>,
        adapter: Arc<dyn InferenceAdapter>,
    ) -> Self {
        let event_bus = EventBus::new(config.system.event_bus_capacity);
        let debug_log = DebugLog::new(config.system.debug_log_capacity);

        let controller = ScanLoopController::new(
            Arc::clone(&camera),
            adapter,
            FramePreprocessor::new(&config.preprocess),
            ResultInterpreter::new(config.interpreter.min_confidence),
            config.scan.clone(),
            event_bus.clone(),
        );
        debug!(
            "Scanner assembled: camera={}, backend={}",
            camera.name(),
            controller.backend_name()
        );

        let (command_sender, command_receiver) = mpsc::channel(16);
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        Self {
            config,
            event_bus,
            debug_log,
            camera,
            controller,
            keyboard_handler: None,
            keyboard_enabled: false,
            command_sender,
            command_receiver: Some(command_receiver),
            component_states: Arc::new(Mutex::new(HashMap::new())),
            background_tasks: Vec::new(),
            shutdown_sender: Some(shutdown_sender),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Enable or disable terminal key bindings
    pub fn set_keyboard_enabled(&mut self, enabled: bool) {
        self.keyboard_enabled = enabled;
    }

    pub fn controller(&self) -> &ScanLoopController {
        &self.controller
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn debug_log(&self) -> &DebugLog {
        &self.debug_log
    }

    pub fn config(&self) -> &WastescanConfig {
        &self.config
    }

    /// Handle for injecting commands, e.g. from a UI other than the terminal
    pub fn command_sender(&self) -> mpsc::Sender<UserCommand> {
        self.command_sender.clone()
    }

    pub async fn set_component_state(&self, component: &str, state: ComponentState) {
        self.component_states
            .lock()
            .await
            .insert(component.to_string(), state);
        debug!("Component '{}' state changed to: {:?}", component, state);
    }

    pub async fn get_component_state(&self, component: &str) -> Option<ComponentState> {
        self.component_states.lock().await.get(component).copied()
    }

    pub async fn get_all_component_states(&self) -> HashMap<String, ComponentState> {
        self.component_states.lock().await.clone()
    }
}
