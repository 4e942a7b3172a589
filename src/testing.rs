//! Scripted stand-ins for devices, presenters and importers.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use smithay::backend::allocator::Fourcc;

use crate::{
    backend::{PaintedFrame, Scene, ScreenInfo},
    device::{
        ConnectorInfo, DeviceCapabilities, DeviceOpener, DeviceResources, DrmDevice, EglDisplay,
        Mode, ModesetPath, ModesetRequest, PageFlip, PlaneInfo, PlaneType, ScanoutTarget,
    },
    error::{DeviceError, ImportError, ModesetError, PresentError},
    presenter::{PixelTarget, PresentCapabilities, Presenter},
    region::{Rect, Region},
    surface::{Buffer, DmabufBuffer, ShmBuffer, X11Pixmap},
    texture::{ImageImporter, PictureFactory, TextureId},
};

pub fn connector(id: u32, name: &str, connected: bool, possible_crtcs: u32) -> ConnectorInfo {
    ConnectorInfo {
        id,
        name: name.to_owned(),
        connected,
        possible_crtcs,
        modes: vec![
            Mode {
                width: 1280,
                height: 720,
                refresh: 60_000,
                preferred: false,
            },
            Mode {
                width: 1920,
                height: 1080,
                refresh: 60_000,
                preferred: true,
            },
        ],
        edid: None,
        physical_size: (600, 340),
    }
}

pub fn plane(id: u32, kind: PlaneType, possible_crtcs: u32) -> PlaneInfo {
    PlaneInfo {
        id,
        kind,
        possible_crtcs,
    }
}

pub fn shm(width: i32, height: i32, format: Fourcc) -> Buffer {
    Buffer::Shm(ShmBuffer {
        size: (width, height).into(),
        stride: width as u32 * 4,
        format,
        data: vec![0; (width * height * 4) as usize].into(),
    })
}

pub fn dmabuf(width: i32, height: i32, format: Fourcc) -> Buffer {
    Buffer::Dmabuf(DmabufBuffer {
        handle: 1,
        size: (width, height).into(),
        format,
        modifier: 0,
        y_inverted: false,
    })
}

pub fn pixmap(pixmap: u32, visual: u32) -> Buffer {
    Buffer::Pixmap(X11Pixmap {
        pixmap,
        visual,
        depth: 24,
        size: (64, 64).into(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentCall {
    Swap,
    SubBuffer(usize),
    Direct,
}

type Log = Rc<RefCell<Vec<&'static str>>>;

/// A presenter recording what it was asked to do.
#[derive(Debug, Clone)]
pub struct FakePresenter {
    capabilities: PresentCapabilities,
    size: (i32, i32),
    refresh_rate: u32,
    calls: Rc<RefCell<Vec<PresentCall>>>,
    age: Rc<Cell<usize>>,
    lifecycle: Option<Log>,
}

impl FakePresenter {
    pub fn new(capabilities: PresentCapabilities, size: (i32, i32)) -> Self {
        Self {
            capabilities,
            size,
            refresh_rate: 60_000,
            calls: Rc::new(RefCell::new(Vec::new())),
            age: Rc::new(Cell::new(0)),
            lifecycle: None,
        }
    }

    pub fn calls(&self) -> Rc<RefCell<Vec<PresentCall>>> {
        self.calls.clone()
    }

    /// The value reported as buffer age.
    pub fn age_handle(&self) -> Rc<Cell<usize>> {
        self.age.clone()
    }
}

impl Presenter for FakePresenter {
    fn capabilities(&self) -> PresentCapabilities {
        self.capabilities
    }

    fn geometry(&self) -> Rect {
        Rect::from_loc_and_size((0, 0), self.size)
    }

    fn format(&self) -> Fourcc {
        Fourcc::Xrgb8888
    }

    fn refresh_rate(&self) -> u32 {
        self.refresh_rate
    }

    fn buffer_age(&self) -> usize {
        self.age.get()
    }

    fn back_buffer(&mut self) -> Option<PixelTarget<'_>> {
        None
    }

    fn swap_buffers(&mut self) -> Result<(), PresentError> {
        self.calls.borrow_mut().push(PresentCall::Swap);
        Ok(())
    }

    fn post_sub_buffer(&mut self, rects: &[Rect]) -> Result<(), PresentError> {
        self.calls.borrow_mut().push(PresentCall::SubBuffer(rects.len()));
        Ok(())
    }

    fn present_direct(&mut self, _buffer: &DmabufBuffer) -> Result<bool, PresentError> {
        self.calls.borrow_mut().push(PresentCall::Direct);
        Ok(true)
    }
}

impl Drop for FakePresenter {
    fn drop(&mut self) {
        if let Some(log) = &self.lifecycle {
            log.borrow_mut().push("presenter dropped");
        }
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    resources: DeviceResources,
    fail_atomic: bool,
    fail_egl: bool,
    failing_paths: Vec<ModesetPath>,
    atomic_probes: usize,
    commits: Vec<(ModesetPath, u32, bool)>,
    power_changes: Vec<(u32, bool)>,
    presenter_capabilities: Option<PresentCapabilities>,
    presenter_calls: Vec<Rc<RefCell<Vec<PresentCall>>>>,
    flips: Vec<PageFlip>,
    flip_sequence: u32,
    lifecycle: Log,
}

/// A device whose hardware and failures are scripted by the test.
///
/// Clones share their state, so a test keeps a handle to inspect what the code under test did.
#[derive(Debug, Clone, Default)]
pub struct FakeDevice {
    state: Rc<RefCell<DeviceState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_resources(&self, resources: DeviceResources) {
        self.state.borrow_mut().resources = resources;
    }

    pub fn connect(&self, connector: u32, connected: bool) {
        let mut state = self.state.borrow_mut();
        if let Some(info) = state
            .resources
            .connectors
            .iter_mut()
            .find(|info| info.id == connector)
        {
            info.connected = connected;
        }
    }

    pub fn fail_atomic(&self) {
        self.state.borrow_mut().fail_atomic = true;
    }

    pub fn fail_egl(&self) {
        self.state.borrow_mut().fail_egl = true;
    }

    /// Makes every commit through `path` fail, test commits included.
    pub fn fail_commits(&self, path: ModesetPath, fail: bool) {
        let mut state = self.state.borrow_mut();
        state.failing_paths.retain(|p| *p != path);
        if fail {
            state.failing_paths.push(path);
        }
    }

    pub fn set_presenter_capabilities(&self, capabilities: PresentCapabilities) {
        self.state.borrow_mut().presenter_capabilities = Some(capabilities);
    }

    pub fn atomic_probes(&self) -> usize {
        self.state.borrow().atomic_probes
    }

    /// Non-test commits as `(path, crtc, enabling)`, failed ones included.
    pub fn commits(&self) -> Vec<(ModesetPath, u32, bool)> {
        self.state.borrow().commits.clone()
    }

    pub fn power_changes(&self) -> Vec<(u32, bool)> {
        self.state.borrow().power_changes.clone()
    }

    /// Calls made to every presenter this device created.
    pub fn presenter_calls(&self) -> Vec<PresentCall> {
        self.state
            .borrow()
            .presenter_calls
            .iter()
            .flat_map(|calls| calls.borrow().clone())
            .collect()
    }

    pub fn queue_flip(&self, crtc: u32, timestamp: Duration) {
        let mut state = self.state.borrow_mut();
        state.flip_sequence += 1;
        let sequence = state.flip_sequence;
        state.flips.push(PageFlip {
            crtc,
            sequence,
            timestamp,
        });
    }

    /// Order of idle waits, presenter drops and device closes.
    pub fn lifecycle(&self) -> Vec<&'static str> {
        self.state.borrow().lifecycle.borrow().clone()
    }
}

impl DrmDevice for FakeDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::MONOTONIC_TIMESTAMPS
    }

    fn resources(&mut self) -> Result<DeviceResources, DeviceError> {
        Ok(self.state.borrow().resources.clone())
    }

    fn enable_atomic(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        state.atomic_probes += 1;
        if state.fail_atomic {
            return Err(DeviceError::Unsupported("atomic mode setting"));
        }
        Ok(())
    }

    fn commit(&mut self, path: ModesetPath, request: &ModesetRequest) -> Result<(), ModesetError> {
        let mut state = self.state.borrow_mut();
        if !request.test_only {
            state
                .commits
                .push((path, request.crtc, request.mode.is_some()));
        }
        if !state.failing_paths.contains(&path) {
            return Ok(());
        }
        let source = io::Error::from(io::ErrorKind::InvalidInput);
        Err(match path {
            ModesetPath::Atomic => ModesetError::Atomic {
                crtc: request.crtc,
                source,
            },
            ModesetPath::Legacy => ModesetError::Legacy {
                crtc: request.crtc,
                source,
            },
        })
    }

    fn set_power(
        &mut self,
        _path: ModesetPath,
        request: &ModesetRequest,
        on: bool,
    ) -> Result<(), ModesetError> {
        self.state
            .borrow_mut()
            .power_changes
            .push((request.crtc, on));
        Ok(())
    }

    fn create_egl_display(&mut self) -> Result<EglDisplay, DeviceError> {
        if self.state.borrow().fail_egl {
            return Err(DeviceError::Unsupported("rendering"));
        }
        Ok(EglDisplay {
            driver: "fake".into(),
            importer: Rc::new(FakeImporter::default()),
        })
    }

    fn create_presenter(&mut self, target: &ScanoutTarget) -> Result<Box<dyn Presenter>, DeviceError> {
        let mut state = self.state.borrow_mut();
        let capabilities = state
            .presenter_capabilities
            .unwrap_or(PresentCapabilities::COMPLETION_EVENTS);
        let mut presenter = FakePresenter::new(
            capabilities,
            (target.mode.width as i32, target.mode.height as i32),
        );
        presenter.refresh_rate = target.mode.refresh;
        presenter.lifecycle = Some(state.lifecycle.clone());
        state.presenter_calls.push(presenter.calls());
        Ok(Box::new(presenter))
    }

    fn receive_events(&mut self) -> Result<Vec<PageFlip>, DeviceError> {
        Ok(std::mem::take(&mut self.state.borrow_mut().flips))
    }

    fn wait_idle(&mut self) {
        self.state.borrow().lifecycle.borrow_mut().push("wait_idle");
    }
}

/// The device handed out by [`FakeOpener`], noting when it is closed.
struct OpenedDevice(FakeDevice);

impl DrmDevice for OpenedDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.0.capabilities()
    }

    fn resources(&mut self) -> Result<DeviceResources, DeviceError> {
        self.0.resources()
    }

    fn enable_atomic(&mut self) -> Result<(), DeviceError> {
        self.0.enable_atomic()
    }

    fn commit(&mut self, path: ModesetPath, request: &ModesetRequest) -> Result<(), ModesetError> {
        self.0.commit(path, request)
    }

    fn set_power(&mut self, path: ModesetPath, request: &ModesetRequest, on: bool) -> Result<(), ModesetError> {
        self.0.set_power(path, request, on)
    }

    fn create_egl_display(&mut self) -> Result<EglDisplay, DeviceError> {
        self.0.create_egl_display()
    }

    fn create_presenter(&mut self, target: &ScanoutTarget) -> Result<Box<dyn Presenter>, DeviceError> {
        self.0.create_presenter(target)
    }

    fn receive_events(&mut self) -> Result<Vec<PageFlip>, DeviceError> {
        self.0.receive_events()
    }

    fn wait_idle(&mut self) {
        self.0.wait_idle()
    }
}

impl Drop for OpenedDevice {
    fn drop(&mut self) {
        self.0.state.borrow().lifecycle.borrow_mut().push("device closed");
    }
}

#[derive(Debug, Default)]
pub struct FakeOpener {
    devices: HashMap<PathBuf, FakeDevice>,
}

impl FakeOpener {
    pub fn with_device(path: &str, device: FakeDevice) -> Self {
        let mut opener = Self::default();
        opener.add(path, device);
        opener
    }

    pub fn add(&mut self, path: &str, device: FakeDevice) {
        self.devices.insert(PathBuf::from(path), device);
    }
}

impl DeviceOpener for FakeOpener {
    fn open(&mut self, path: &Path) -> Result<Box<dyn DrmDevice>, DeviceError> {
        match self.devices.get(path) {
            Some(device) => Ok(Box::new(OpenedDevice(device.clone()))),
            None => Err(DeviceError::Open {
                path: path.to_path_buf(),
                source: io::Error::from(io::ErrorKind::NotFound),
            }),
        }
    }
}

/// Counts the textures it hands out.
#[derive(Debug, Default)]
pub struct FakeImporter {
    next: Cell<TextureId>,
    live: Cell<usize>,
    updates: Cell<usize>,
    released: Cell<usize>,
    fail: Cell<bool>,
}

impl FakeImporter {
    pub fn live(&self) -> usize {
        self.live.get()
    }

    pub fn updates(&self) -> usize {
        self.updates.get()
    }

    pub fn released(&self) -> usize {
        self.released.get()
    }

    pub fn fail_imports(&self, fail: bool) {
        self.fail.set(fail);
    }

    fn import(&self) -> Result<TextureId, ImportError> {
        if self.fail.get() {
            return Err(ImportError::Failed("scripted failure".into()));
        }
        self.next.set(self.next.get() + 1);
        self.live.set(self.live.get() + 1);
        Ok(self.next.get())
    }
}

impl ImageImporter for FakeImporter {
    fn import_dmabuf(&self, _buffer: &DmabufBuffer) -> Result<TextureId, ImportError> {
        self.import()
    }

    fn upload_shm(&self, _buffer: &ShmBuffer) -> Result<TextureId, ImportError> {
        self.import()
    }

    fn update_shm(&self, _texture: TextureId, _buffer: &ShmBuffer, _damage: &Region) -> Result<(), ImportError> {
        self.updates.set(self.updates.get() + 1);
        Ok(())
    }

    fn import_pixmap(&self, _pixmap: &X11Pixmap) -> Result<TextureId, ImportError> {
        self.import()
    }

    fn release(&self, _texture: TextureId) {
        self.live.set(self.live.get() - 1);
        self.released.set(self.released.get() + 1);
    }
}

/// Knows every visual except `0xbad`.
#[derive(Debug, Default)]
pub struct FakePictures {
    live: Cell<usize>,
}

impl FakePictures {
    pub fn live(&self) -> usize {
        self.live.get()
    }
}

impl PictureFactory for FakePictures {
    fn find_format(&self, visual: u32) -> Option<u32> {
        (visual != 0xbad).then_some(visual)
    }

    fn create_picture(&self, pixmap: u32, _format: u32) -> Result<u32, ImportError> {
        self.live.set(self.live.get() + 1);
        Ok(pixmap)
    }

    fn free_picture(&self, _picture: u32) {
        self.live.set(self.live.get() - 1);
    }
}

/// Repaints whole screens and remembers which screens it painted.
#[derive(Debug, Clone, Default)]
pub struct RecordingScene {
    painted: Rc<RefCell<Vec<usize>>>,
}

impl RecordingScene {
    pub fn painted(&self) -> Vec<usize> {
        self.painted.borrow().clone()
    }
}

impl Scene for RecordingScene {
    fn paint(&mut self, screen: &ScreenInfo, _repaint: &Region, _target: Option<PixelTarget<'_>>) -> PaintedFrame {
        self.painted.borrow_mut().push(screen.index);
        let full = Region::from_rect(screen.geometry);
        PaintedFrame {
            rendered: full.clone(),
            damaged: full,
        }
    }
}
