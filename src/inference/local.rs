use super::adapter::{BackendInput, InferenceAdapter, InferenceOutput, InputKind};
use crate::error::{Result, ScanError};
use crate::frame::Tensor;
use crate::interpreter::ClassScores;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// In-process model execution
pub trait TensorRuntime: Send + Sync {
    /// Run one channel-last tensor through the model, returning raw scores
    fn run(&self, tensor: &Tensor) -> Result<Vec<f32>>;
}

/// Produces a runtime; called from a blocking thread
pub type RuntimeLoader = Arc<dyn Fn() -> Result<Arc<dyn TensorRuntime>> + Send + Sync>;

/// Classifier running a preloaded model inside this process.
///
/// The model is loaded once by `initialize` on a blocking thread and is
/// read-only afterwards.
pub struct LocalClassifier {
    loader: RuntimeLoader,
    runtime: Mutex<Option<Arc<dyn TensorRuntime>>>,
    ready: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl LocalClassifier {
    pub fn new(loader: RuntimeLoader) -> Self {
        Self {
            loader,
            runtime: Mutex::new(None),
            ready: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Wrap a runtime that is already loaded
    pub fn with_runtime(runtime: Arc<dyn TensorRuntime>) -> Self {
        let loaded = Arc::clone(&runtime);
        Self::new(Arc::new(move || Ok(Arc::clone(&loaded))))
    }

    #[cfg(feature = "onnx")]
    pub fn onnx<P: Into<std::path::PathBuf>>(model_path: P, spec: crate::frame::TensorSpec) -> Self {
        let model_path = model_path.into();
        Self::new(Arc::new(move || {
            let runtime: Arc<dyn TensorRuntime> = Arc::new(OnnxRuntime::load(&model_path, &spec)?);
            Ok(runtime)
        }))
    }

    fn runtime(&self) -> Option<Arc<dyn TensorRuntime>> {
        self.runtime.lock().clone()
    }
}

#[async_trait]
impl InferenceAdapter for LocalClassifier {
    fn name(&self) -> &str {
        "local"
    }

    fn input_kind(&self) -> InputKind {
        InputKind::Tensor
    }

    async fn initialize(&self) -> bool {
        let _guard = self.init_lock.lock().await;
        if self.ready.load(Ordering::Acquire) {
            return true;
        }

        info!("Loading local model");
        let started = Instant::now();
        let loader = Arc::clone(&self.loader);
        let load = tokio::task::spawn_blocking(move || loader())
            .await
            .map_err(|e| ScanError::BackendInitFailed {
                details: format!("model loader task failed: {}", e),
            })
            .and_then(|result| result);

        match load {
            Ok(runtime) => {
                *self.runtime.lock() = Some(runtime);
                self.ready.store(true, Ordering::Release);
                info!("Local model loaded in {}ms", started.elapsed().as_millis());
                true
            }
            Err(e) => {
                error!("Failed to load local model: {}", e);
                false
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn infer(&self, input: BackendInput) -> Result<InferenceOutput> {
        let tensor = match input {
            BackendInput::Tensor(tensor) => tensor,
            BackendInput::Image(_) => {
                return Err(ScanError::backend(None, "local backend expects a tensor"))
            }
        };

        let runtime = self.runtime().ok_or(ScanError::BackendNotReady)?;

        let started = Instant::now();
        let scores = runtime.run(&tensor)?;
        drop(tensor);
        let elapsed = started.elapsed();

        debug!("Local inference took {}ms", elapsed.as_millis());
        Ok(InferenceOutput {
            scores: ClassScores::new(scores),
            elapsed,
        })
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxRuntime;

#[cfg(feature = "onnx")]
mod onnx {
    use super::TensorRuntime;
    use crate::error::{Result, ScanError};
    use crate::frame::{Tensor, TensorSpec};
    use std::path::Path;
    use tract_onnx::prelude::*;

    type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>;

    /// ONNX model executed with tract, input fixed to `[1, H, W, C]` float32
    pub struct OnnxRuntime {
        model: Plan,
        shape: [usize; 3],
    }

    fn load_error<E: std::fmt::Display>(e: E) -> ScanError {
        ScanError::BackendInitFailed {
            details: e.to_string(),
        }
    }

    impl OnnxRuntime {
        pub fn load(path: &Path, spec: &TensorSpec) -> Result<Self> {
            let shape = [
                spec.height as usize,
                spec.width as usize,
                spec.channels as usize,
            ];
            let model = tract_onnx::onnx()
                .model_for_path(path)
                .map_err(load_error)?
                .with_input_fact(0, f32::fact([1, shape[0], shape[1], shape[2]]).into())
                .map_err(load_error)?
                .into_optimized()
                .map_err(load_error)?
                .into_runnable()
                .map_err(load_error)?;

            Ok(Self { model, shape })
        }
    }

    impl TensorRuntime for OnnxRuntime {
        fn run(&self, tensor: &Tensor) -> Result<Vec<f32>> {
            if tensor.shape() != self.shape {
                return Err(ScanError::invalid_frame(format!(
                    "tensor shape {:?} does not match model input {:?}",
                    tensor.shape(),
                    self.shape
                )));
            }

            let [h, w, c] = self.shape;
            let input: tract_onnx::prelude::Tensor =
                tract_ndarray::Array4::from_shape_vec((1, h, w, c), tensor.as_slice().to_vec())
                    .map_err(|e| ScanError::backend(None, e.to_string()))?
                    .into();

            let outputs = self
                .model
                .run(tvec!(input.into_tvalue()))
                .map_err(|e| ScanError::backend(None, format!("model run failed: {}", e)))?;

            let output = outputs
                .first()
                .ok_or_else(|| ScanError::backend(None, "model produced no output"))?
                .to_array_view::<f32>()
                .map_err(|e| ScanError::backend(None, e.to_string()))?;

            Ok(output.iter().copied().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct MeanRuntime;

    impl TensorRuntime for MeanRuntime {
        fn run(&self, tensor: &Tensor) -> Result<Vec<f32>> {
            let mean = tensor.as_slice().iter().sum::<f32>() / tensor.as_slice().len() as f32;
            Ok(vec![mean, 1.0 - mean, 0.0])
        }
    }

    fn tensor(value: f32) -> Tensor {
        Tensor::new(vec![value; 2 * 2 * 3], 2, 2, 3).unwrap()
    }

    #[tokio::test]
    async fn test_local_classifier_lifecycle() {
        let classifier = LocalClassifier::with_runtime(Arc::new(MeanRuntime));
        assert!(!classifier.is_ready());
        assert!(matches!(
            classifier.infer(BackendInput::Tensor(tensor(0.5))).await,
            Err(ScanError::BackendNotReady)
        ));

        assert!(classifier.initialize().await);
        assert!(classifier.is_ready());

        let output = classifier
            .infer(BackendInput::Tensor(tensor(0.75)))
            .await
            .unwrap();
        assert_eq!(output.scores.as_slice(), &[0.75, 0.25, 0.0]);
    }

    #[tokio::test]
    async fn test_failed_load_can_be_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let classifier = LocalClassifier::new(Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ScanError::BackendInitFailed {
                    details: "missing model".to_string(),
                })
            } else {
                let runtime: Arc<dyn TensorRuntime> = Arc::new(MeanRuntime);
                Ok(runtime)
            }
        }));

        assert!(!classifier.initialize().await);
        assert!(!classifier.is_ready());

        assert!(classifier.initialize().await);
        assert!(classifier.initialize().await);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejects_encoded_image() {
        let classifier = LocalClassifier::with_runtime(Arc::new(MeanRuntime));
        classifier.initialize().await;

        let image = crate::frame::EncodedImage {
            data: vec![0xFF, 0xD8],
            width: 1,
            height: 1,
            format: crate::frame::FrameFormat::Jpeg,
        };
        assert!(matches!(
            classifier.infer(BackendInput::Image(image)).await,
            Err(ScanError::BackendError { status: None, .. })
        ));
    }

    #[cfg(feature = "onnx")]
    #[tokio::test]
    async fn test_missing_onnx_model_is_not_ready() {
        let classifier = LocalClassifier::onnx(
            "/nonexistent/model.onnx",
            crate::frame::TensorSpec::default(),
        );
        assert!(!classifier.initialize().await);
        assert!(!classifier.is_ready());
    }
}
