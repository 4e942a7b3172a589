//! Display hardware resources and the output pipelines built from them.

use std::fmt;

use uuid::Uuid;

use crate::device::{ConnectorInfo, Mode, ModesetPath, ModesetRequest, PlaneInfo, PlaneType, ScanoutTarget};

/// Identifies a GPU by the device number of its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuId(pub u64);

impl fmt::Display for GpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0 >> 8, self.0 & 0xff)
    }
}

/// Identifies an output pipeline within its GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub u32);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub(crate) info: PlaneInfo,
    pub(crate) owner: Option<OutputId>,
}

impl Plane {
    pub fn id(&self) -> u32 {
        self.info.id
    }

    pub fn kind(&self) -> PlaneType {
        self.info.kind
    }

    pub fn owner(&self) -> Option<OutputId> {
        self.owner
    }

    /// Whether the plane can be used with the crtc at `crtc_index`.
    pub fn is_compatible(&self, crtc_index: u32) -> bool {
        crtc_index < 32 && self.info.possible_crtcs & (1 << crtc_index) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crtc {
    pub(crate) id: u32,
    pub(crate) index: u32,
    pub(crate) owner: Option<OutputId>,
}

impl Crtc {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Position of the crtc in the device's crtc list.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn owner(&self) -> Option<OutputId> {
        self.owner
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    pub(crate) info: ConnectorInfo,
    pub(crate) owner: Option<OutputId>,
}

impl Connector {
    pub fn id(&self) -> u32 {
        self.info.id
    }

    pub fn info(&self) -> &ConnectorInfo {
        &self.info
    }

    pub fn owner(&self) -> Option<OutputId> {
        self.owner
    }
}

/// Lifecycle of an output pipeline.
///
/// `Unbound -> Bound { enabled: false } <-> Bound { enabled: true } -> Removed`. Disabled
/// pipelines keep their hardware so enabling them again needs no renegotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Unbound,
    Bound { enabled: bool },
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DpmsMode {
    #[default]
    On,
    Off,
}

/// One physical display: a connector driven by a crtc scanning out of a primary plane.
///
/// The pipeline only refers to its resources by id; the owning [`crate::gpu::Gpu`] holds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPipeline {
    pub(crate) id: OutputId,
    pub(crate) uuid: Uuid,
    pub(crate) name: String,
    pub(crate) connector: u32,
    pub(crate) crtc: u32,
    pub(crate) primary_plane: Option<u32>,
    pub(crate) cursor_plane: Option<u32>,
    pub(crate) mode: Mode,
    pub(crate) state: PipelineState,
    pub(crate) dpms: DpmsMode,
    pub(crate) physical_size: (u32, u32),
}

impl OutputPipeline {
    pub fn id(&self) -> OutputId {
        self.id
    }

    /// Identifier of the display that stays stable across sessions.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connector(&self) -> u32 {
        self.connector
    }

    pub fn crtc(&self) -> u32 {
        self.crtc
    }

    pub fn primary_plane(&self) -> Option<u32> {
        self.primary_plane
    }

    pub fn cursor_plane(&self) -> Option<u32> {
        self.cursor_plane
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == PipelineState::Bound { enabled: true }
    }

    pub fn dpms(&self) -> DpmsMode {
        self.dpms
    }

    pub fn physical_size(&self) -> (u32, u32) {
        self.physical_size
    }

    /// Whether a pipeline in this state may be driven by the render loop.
    pub fn is_presentable(&self) -> bool {
        self.is_enabled() && self.dpms == DpmsMode::On
    }

    pub(crate) fn modeset_request(&self, enable: bool, test_only: bool) -> ModesetRequest {
        ModesetRequest {
            crtc: self.crtc,
            connector: self.connector,
            primary_plane: self.primary_plane,
            cursor_plane: self.cursor_plane,
            mode: enable.then_some(self.mode),
            test_only,
        }
    }

    pub(crate) fn scanout_target(&self, path: ModesetPath) -> ScanoutTarget {
        ScanoutTarget {
            crtc: self.crtc,
            connector: self.connector,
            primary_plane: self.primary_plane,
            mode: self.mode,
            path,
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        assert!(
            matches!(self.state, PipelineState::Bound { .. }),
            "output {} is not bound",
            self.id
        );
        self.state = PipelineState::Bound { enabled };
    }
}

/// Notifications about the output inventory of a GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Added(OutputPipeline),
    Removed(OutputPipeline),
    Enabled(OutputPipeline),
    Disabled(OutputPipeline),
}

impl OutputEvent {
    pub fn output(&self) -> &OutputPipeline {
        match self {
            OutputEvent::Added(output)
            | OutputEvent::Removed(output)
            | OutputEvent::Enabled(output)
            | OutputEvent::Disabled(output) => output,
        }
    }
}
