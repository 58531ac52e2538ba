pub mod app;
pub mod camera;
pub mod config;
pub mod debug_log;
pub mod error;
pub mod events;
pub mod frame;
pub mod inference;
pub mod interpreter;
pub mod keyboard_input;
pub mod preprocess;
pub mod recovery;
pub mod scan;

pub use app::{ComponentState, ScannerApp, ShutdownReason};
pub use camera::{CameraBuilder, ImageCapture};
pub use config::WastescanConfig;
pub use debug_log::DebugLog;
pub use error::{Result, ScanError};
pub use events::{EventBus, ScanEvent};
pub use frame::{EncodedImage, Frame, FrameFormat, Tensor, TensorSpec};
pub use inference::{build_adapter, InferenceAdapter};
pub use interpreter::{ClassScores, Prediction, ResultInterpreter, WasteLabel};
pub use keyboard_input::{KeyboardInputHandler, UserCommand};
pub use preprocess::FramePreprocessor;
pub use recovery::{FailureTracker, RateLimitGate, RecoveryAction};
pub use scan::{ScanLoopController, ScanSession, ScanState};
