//! The mode-setting primitives a graphics device has to offer.
//!
//! [`DrmDevice`] is implemented by the kernel mode-setting backend in [`crate::kms`] and by the
//! scripted fakes used in tests.

use std::{os::fd::OwnedFd, path::Path, rc::Rc, time::Duration};

use bitflags::bitflags;

use crate::{
    error::{DeviceError, ModesetError},
    presenter::Presenter,
    texture::ImageImporter,
};

bitflags! {
    /// Capability bits read from a device when it is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCapabilities: u32 {
        /// Framebuffers can be created with explicit buffer modifiers
        const ADDFB2_MODIFIERS = 1;
        /// Completion timestamps are taken from `CLOCK_MONOTONIC`
        const MONOTONIC_TIMESTAMPS = 1 << 1;
    }
}

/// The role of a hardware plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    Primary,
    Cursor,
    Overlay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: u32,
    pub kind: PlaneType,
    /// Bit `n` is set if the plane can be used with the `n`-th crtc of the device
    pub possible_crtcs: u32,
}

/// A display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mode {
    pub width: u16,
    pub height: u16,
    /// Refresh rate in mHz
    pub refresh: u32,
    pub preferred: bool,
}

/// Identity of the attached display, as read from its EDID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EdidIdentity {
    pub make: String,
    pub model: String,
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: u32,
    /// Stable connector name, like `DP-1`
    pub name: String,
    pub connected: bool,
    /// Bit `n` is set if the connector can be driven by the `n`-th crtc of the device
    pub possible_crtcs: u32,
    pub modes: Vec<Mode>,
    pub edid: Option<EdidIdentity>,
    /// Physical size in millimeters
    pub physical_size: (u32, u32),
}

impl ConnectorInfo {
    /// The mode flagged as preferred by the display, or its first mode.
    pub fn preferred_mode(&self) -> Option<Mode> {
        self.modes
            .iter()
            .find(|mode| mode.preferred)
            .or_else(|| self.modes.first())
            .copied()
    }
}

/// Everything a device reports about its display hardware.
#[derive(Debug, Clone, Default)]
pub struct DeviceResources {
    pub planes: Vec<PlaneInfo>,
    /// Crtc ids, in the order the possible-crtc bitmasks refer to them
    pub crtcs: Vec<u32>,
    pub connectors: Vec<ConnectorInfo>,
}

/// How display configuration is applied to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModesetPath {
    /// One indivisible transaction per commit
    Atomic,
    /// Per-crtc configuration calls
    Legacy,
}

/// One output's worth of display configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModesetRequest {
    pub crtc: u32,
    pub connector: u32,
    pub primary_plane: Option<u32>,
    pub cursor_plane: Option<u32>,
    /// `None` switches the pipeline off
    pub mode: Option<Mode>,
    /// Only check whether the configuration would be accepted
    pub test_only: bool,
}

/// A frame became visible on a crtc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlip {
    pub crtc: u32,
    pub sequence: u32,
    pub timestamp: Duration,
}

/// Where a presenter delivers its frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanoutTarget {
    pub crtc: u32,
    pub connector: u32,
    pub primary_plane: Option<u32>,
    pub mode: Mode,
    pub path: ModesetPath,
}

/// The hardware rendering context of a device.
#[derive(Clone)]
pub struct EglDisplay {
    pub driver: String,
    pub importer: Rc<dyn ImageImporter>,
}

impl std::fmt::Debug for EglDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EglDisplay")
            .field("driver", &self.driver)
            .finish()
    }
}

/// An opened graphics device.
pub trait DrmDevice {
    /// Reads capability bits.
    fn capabilities(&self) -> DeviceCapabilities;

    /// Enumerates planes, crtcs and connectors, probing connectors for their current state.
    fn resources(&mut self) -> Result<DeviceResources, DeviceError>;

    /// Asks the device to accept atomic commits.
    fn enable_atomic(&mut self) -> Result<(), DeviceError>;

    /// Applies (or with `test_only` checks) one output's configuration.
    fn commit(&mut self, path: ModesetPath, request: &ModesetRequest) -> Result<(), ModesetError>;

    /// Powers the display behind `request` on or off without releasing the pipeline.
    fn set_power(
        &mut self,
        path: ModesetPath,
        request: &ModesetRequest,
        on: bool,
    ) -> Result<(), ModesetError>;

    /// Creates the hardware rendering context.
    fn create_egl_display(&mut self) -> Result<EglDisplay, DeviceError>;

    /// Creates the presenter delivering frames to an enabled pipeline.
    fn create_presenter(&mut self, target: &ScanoutTarget)
        -> Result<Box<dyn Presenter>, DeviceError>;

    /// A descriptor that becomes readable when completion events are pending.
    fn event_fd(&self) -> Option<OwnedFd> {
        None
    }

    /// Reads pending completion events.
    fn receive_events(&mut self) -> Result<Vec<PageFlip>, DeviceError>;

    /// Blocks until all submitted work has completed.
    fn wait_idle(&mut self);
}

/// Turns device nodes into opened devices.
pub trait DeviceOpener {
    fn open(&mut self, path: &Path) -> Result<Box<dyn DrmDevice>, DeviceError>;
}
