mod adapter;
mod local;
mod remote;
mod sandbox;

pub use adapter::{BackendInput, InferenceAdapter, InferenceOutput, InputKind};
#[cfg(feature = "onnx")]
pub use local::OnnxRuntime;
pub use local::{LocalClassifier, RuntimeLoader, TensorRuntime};
pub use remote::RemoteClassifier;
pub use sandbox::{
    AllPredictions, ChannelTransport, ProcessTransport, ReadyStatus, SandboxClassifier,
    SandboxHost, SandboxMessage, SandboxRequest, SandboxTransport,
};

use crate::config::{BackendKind, WastescanConfig};
use crate::error::Result;
use std::sync::Arc;
use tracing::info;

/// Build the configured inference backend. Nothing is loaded or contacted
/// until `initialize` is called.
pub fn build_adapter(config: &WastescanConfig) -> Result<Arc<dyn InferenceAdapter>> {
    let backend = &config.backend;
    info!("Using {:?} inference backend", backend.kind);

    match backend.kind {
        BackendKind::Remote => Ok(Arc::new(RemoteClassifier::new(backend.remote.clone())?)),
        BackendKind::Local => build_local(config),
        BackendKind::Sandbox => Ok(Arc::new(SandboxClassifier::from_config(&backend.sandbox))),
    }
}

#[cfg(feature = "onnx")]
fn build_local(config: &WastescanConfig) -> Result<Arc<dyn InferenceAdapter>> {
    Ok(Arc::new(LocalClassifier::onnx(
        config.backend.local.model_path.clone(),
        config.preprocess.tensor_spec(),
    )))
}

#[cfg(not(feature = "onnx"))]
fn build_local(_config: &WastescanConfig) -> Result<Arc<dyn InferenceAdapter>> {
    Err(crate::error::ScanError::BackendInitFailed {
        details: "local backend requires the `onnx` feature".to_string(),
    })
}
