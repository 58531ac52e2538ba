mod builder;
mod directory;
#[cfg(all(feature = "camera", target_os = "linux"))]
mod gstreamer;
mod interface;
mod mock;
#[cfg(test)]
mod tests;

pub use builder::CameraBuilder;
pub use directory::DirectoryCamera;
#[cfg(all(feature = "camera", target_os = "linux"))]
pub use gstreamer::GstreamerCamera;
pub use interface::ImageCapture;
pub use mock::MockCamera;
