//! Errors raised at the GPU and output boundary.
//!
//! None of these reach the composition layer as failures: it only observes outputs appearing,
//! disappearing, or changing their enabled state.

use std::{io, path::PathBuf};

/// Opening or querying a graphics device failed. Fatal to that device only.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Failed to open device {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to query device resources: {0}")]
    Resources(#[source] io::Error),
    #[error("Device does not support {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A mode commit failed.
#[derive(Debug, thiserror::Error)]
pub enum ModesetError {
    #[error("Atomic commit on crtc {crtc} failed: {source}")]
    Atomic {
        crtc: u32,
        #[source]
        source: io::Error,
    },
    #[error("Legacy mode set on crtc {crtc} failed: {source}")]
    Legacy {
        crtc: u32,
        #[source]
        source: io::Error,
    },
    #[error("Output {0} does not exist")]
    UnknownOutput(u32),
}

/// Turning a surface buffer into a sampleable texture failed.
///
/// The surface keeps showing its previous contents, or nothing, until the next commit retries.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("{0} buffers can not be used by this backend")]
    UnsupportedBuffer(&'static str),
    #[error("No picture format matches visual {0:#x}")]
    NoFormat(u32),
    #[error("Buffer import failed: {0}")]
    Failed(String),
}

/// Presenting a frame failed.
#[derive(Debug, thiserror::Error)]
pub enum PresentError {
    #[error("Device is inactive")]
    DeviceInactive,
    #[error("Presentation failed: {0}")]
    Failed(#[source] io::Error),
    #[error("Rendering context lost: {0}")]
    ContextLost(String),
}

/// Misuse of a render loop's frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("A frame is already being rendered or waiting for presentation")]
    FrameInProgress,
    #[error("No frame has been started")]
    NoFrameStarted,
    #[error("Rendering is inhibited")]
    Inhibited,
}

/// Errors of the top-level backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("The session is not active")]
    SessionLost,
    #[error("Screen {0} does not exist")]
    UnknownScreen(usize),
    #[error("Gpu {0} is not known")]
    UnknownGpu(u64),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Present(#[from] PresentError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Modeset(#[from] ModesetError),
}

/// Reading or writing the persisted output configuration failed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to locate the configuration directory: {0}")]
    Location(#[from] xdg::BaseDirectoriesError),
    #[error("Unable to access output configuration: {0}")]
    Io(#[from] io::Error),
    #[error("Output configuration is malformed: {0}")]
    Encoding(#[from] bincode::Error),
}
