use crate::error::Result;
use crate::frame::{EncodedImage, Tensor};
use crate::interpreter::ClassScores;
use async_trait::async_trait;
use std::time::Duration;

/// What a backend wants to be fed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// The compressed still; the backend does its own preprocessing
    EncodedImage,
    /// A normalized channel-last tensor
    Tensor,
}

/// Payload handed to a backend for one inference
#[derive(Debug)]
pub enum BackendInput {
    Image(EncodedImage),
    Tensor(Tensor),
}

impl BackendInput {
    pub fn kind(&self) -> InputKind {
        match self {
            BackendInput::Image(_) => InputKind::EncodedImage,
            BackendInput::Tensor(_) => InputKind::Tensor,
        }
    }
}

/// Scores plus the wall-clock time the backend spent producing them
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub scores: ClassScores,
    pub elapsed: Duration,
}

/// Inference backend producing one score per label.
///
/// `initialize` is idempotent: once it has returned `true` further calls are
/// no-ops. A `false` result leaves the adapter not ready until `initialize`
/// is called again. After initialization the adapter is only read from, so
/// `infer` takes `&self`.
#[async_trait]
pub trait InferenceAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn input_kind(&self) -> InputKind;

    async fn initialize(&self) -> bool;

    fn is_ready(&self) -> bool;

    async fn infer(&self, input: BackendInput) -> Result<InferenceOutput>;
}
