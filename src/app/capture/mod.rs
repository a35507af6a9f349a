pub mod controller;
pub mod progress;
pub mod screenshot;

pub use controller::{DeviceCaptureController, RecordOptions};
pub use progress::RecordProgress;

#[cfg(test)]
mod tests;
