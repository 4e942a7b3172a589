//! Kernel mode setting through `/dev/dri/card*` nodes.
//!
//! Frames are drawn on the CPU into a shadow buffer and copied into a pair of dumb buffers that
//! are flipped onto the primary plane.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fs::{File, OpenOptions},
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    rc::Rc,
    time::{Duration, Instant},
};

use calloop::{generic::Generic, EventLoop, Interest, Mode as PollMode, PostAction};
use drm::{
    buffer::{Buffer as _, DrmFourcc},
    control::{
        self, atomic, connector, crtc, dumbbuffer::DumbBuffer, framebuffer, plane, property,
        AtomicCommitFlags, Device as ControlDevice, Event, ModeTypeFlags, PageFlipFlags,
        ResourceHandle, ResourceHandles,
    },
    ClientCapability, Device, DriverCapability,
};
use smithay::backend::allocator::Fourcc;
use tracing::{debug, info, trace, warn};

use crate::{
    device::{
        ConnectorInfo, DeviceCapabilities, DeviceOpener, DeviceResources, DrmDevice, EdidIdentity,
        EglDisplay, Mode, ModesetPath, ModesetRequest, PageFlip, PlaneInfo, PlaneType,
        ScanoutTarget,
    },
    error::{DeviceError, ModesetError, PresentError},
    presenter::{PixelTarget, PresentCapabilities, Presenter},
    region::Rect,
};

const DPMS_ON: u64 = 0;
const DPMS_OFF: u64 = 3;
/// Longest time teardown waits for outstanding page flips.
const FLIP_TIMEOUT: Duration = Duration::from_secs(1);

/// An opened card node.
#[derive(Debug)]
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

impl Card {
    pub fn open(path: &Path) -> io::Result<Card> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Card(file))
    }

    fn property(&self, handle: impl ResourceHandle, name: &str) -> io::Result<property::Handle> {
        self.get_properties(handle)?
            .as_hashmap(self)?
            .get(name)
            .map(|info| info.handle())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no {name} property")))
    }

    /// Raw value of the property called `name`.
    fn property_value(&self, handle: impl ResourceHandle, name: &str) -> io::Result<Option<u64>> {
        for (id, value) in self.get_properties(handle)?.iter() {
            let info = self.get_property(*id)?;
            if info.name().to_str().map(|n| n == name).unwrap_or(false) {
                return Ok(Some(*value));
            }
        }
        Ok(None)
    }
}

/// Opens card nodes as [`KmsDevice`]s.
#[derive(Debug, Default)]
pub struct KmsOpener;

impl DeviceOpener for KmsOpener {
    fn open(&mut self, path: &Path) -> Result<Box<dyn DrmDevice>, DeviceError> {
        let card = Card::open(path).map_err(|source| DeviceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(|_| DeviceError::Unsupported("universal planes"))?;
        if let Ok(driver) = card.get_driver() {
            info!(?path, driver = ?driver.name(), "Opened card");
        }
        Ok(Box::new(KmsDevice::new(card, path)))
    }
}

/// Two dumb buffers with framebuffers, one scanned out while the other is filled.
#[derive(Debug)]
struct DumbSwapchain {
    card: Rc<Card>,
    size: (u32, u32),
    buffers: Vec<(DumbBuffer, framebuffer::Handle)>,
    front: usize,
}

impl DumbSwapchain {
    fn new(card: Rc<Card>, size: (u32, u32)) -> io::Result<Self> {
        let mut swapchain = DumbSwapchain {
            card,
            size,
            buffers: Vec::with_capacity(2),
            front: 0,
        };
        for _ in 0..2 {
            let buffer = swapchain
                .card
                .create_dumb_buffer(size, DrmFourcc::Xrgb8888, 32)?;
            let framebuffer = match swapchain.card.add_framebuffer(&buffer, 24, 32) {
                Ok(framebuffer) => framebuffer,
                Err(err) => {
                    if let Err(err) = swapchain.card.destroy_dumb_buffer(buffer) {
                        debug!("Failed to destroy dumb buffer: {err}");
                    }
                    return Err(err);
                }
            };
            swapchain.buffers.push((buffer, framebuffer));
        }
        Ok(swapchain)
    }

    fn front(&self) -> framebuffer::Handle {
        self.buffers[self.front].1
    }

    /// Copies `pixels` into the back buffer and makes it the front buffer.
    fn present(&mut self, pixels: &[u8], stride: usize) -> io::Result<framebuffer::Handle> {
        let back = (self.front + 1) % self.buffers.len();
        let (buffer, framebuffer) = &mut self.buffers[back];
        let pitch = buffer.pitch() as usize;
        let mut mapping = self.card.map_dumb_buffer(buffer)?;
        copy_rows(mapping.as_mut(), pitch, pixels, stride);
        self.front = back;
        Ok(*framebuffer)
    }
}

impl Drop for DumbSwapchain {
    fn drop(&mut self) {
        for (buffer, framebuffer) in self.buffers.drain(..) {
            if let Err(err) = self.card.destroy_framebuffer(framebuffer) {
                debug!("Failed to destroy framebuffer: {err}");
            }
            if let Err(err) = self.card.destroy_dumb_buffer(buffer) {
                debug!("Failed to destroy dumb buffer: {err}");
            }
        }
    }
}

/// A card driven through mode setting ioctls.
pub struct KmsDevice {
    card: Rc<Card>,
    path: PathBuf,
    atomic: bool,
    modes: HashMap<u32, Vec<control::Mode>>,
    swapchains: HashMap<u32, Rc<RefCell<DumbSwapchain>>>,
    pending_flips: Rc<Cell<usize>>,
}

impl std::fmt::Debug for KmsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsDevice")
            .field("path", &self.path)
            .field("atomic", &self.atomic)
            .field("swapchains", &self.swapchains.len())
            .field("pending_flips", &self.pending_flips.get())
            .finish()
    }
}

impl KmsDevice {
    fn new(card: Card, path: &Path) -> Self {
        Self {
            card: Rc::new(card),
            path: path.to_path_buf(),
            atomic: false,
            modes: HashMap::new(),
            swapchains: HashMap::new(),
            pending_flips: Rc::new(Cell::new(0)),
        }
    }

    fn plane_info(&self, handles: &ResourceHandles, handle: plane::Handle) -> io::Result<PlaneInfo> {
        let info = self.card.get_plane(handle)?;
        let kind = match self.card.property_value(handle, "type")? {
            Some(value) if value == control::PlaneType::Primary as u64 => PlaneType::Primary,
            Some(value) if value == control::PlaneType::Cursor as u64 => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        };
        Ok(PlaneInfo {
            id: handle.into(),
            kind,
            possible_crtcs: crtc_mask(handles, &handles.filter_crtcs(info.possible_crtcs())),
        })
    }

    fn connector_info(&mut self, handles: &ResourceHandles, handle: connector::Handle) -> io::Result<ConnectorInfo> {
        let info = self.card.get_connector(handle, true)?;
        let mut possible = Vec::new();
        for encoder in info.encoders() {
            if let Ok(encoder) = self.card.get_encoder(*encoder) {
                possible.extend(handles.filter_crtcs(encoder.possible_crtcs()));
            }
        }

        let edid = match self.card.property_value(handle, "EDID") {
            Ok(Some(blob)) if blob != 0 => self
                .card
                .get_property_blob(blob)
                .ok()
                .and_then(|data| parse_edid(&data)),
            _ => None,
        };

        let modes = info.modes().to_vec();
        let id = u32::from(handle);
        let connector = ConnectorInfo {
            id,
            name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
            connected: info.state() == connector::State::Connected,
            possible_crtcs: crtc_mask(handles, &possible),
            modes: modes.iter().map(convert_mode).collect(),
            edid,
            physical_size: info.size().unwrap_or((0, 0)),
        };
        self.modes.insert(id, modes);
        Ok(connector)
    }

    fn drm_mode(&self, connector: u32, mode: &Mode) -> Option<control::Mode> {
        self.modes
            .get(&connector)?
            .iter()
            .find(|candidate| convert_mode(candidate) == *mode)
            .copied()
    }

    fn swapchain(&mut self, crtc: u32, size: (u32, u32)) -> io::Result<Rc<RefCell<DumbSwapchain>>> {
        if let Some(swapchain) = self.swapchains.get(&crtc) {
            if swapchain.borrow().size == size {
                return Ok(swapchain.clone());
            }
        }
        let swapchain = Rc::new(RefCell::new(DumbSwapchain::new(self.card.clone(), size)?));
        debug!(crtc, ?size, "Created dumb swapchain");
        self.swapchains.insert(crtc, swapchain.clone());
        Ok(swapchain)
    }

    fn atomic_commit(&mut self, request: &ModesetRequest) -> io::Result<()> {
        let card = self.card.clone();
        let crtc: crtc::Handle = handle(request.crtc)?;
        let connector: connector::Handle = handle(request.connector)?;
        let plane: Option<plane::Handle> = request.primary_plane.map(handle).transpose()?;

        let mut req = atomic::AtomicModeReq::new();
        match request.mode {
            Some(mode) => {
                let drm_mode = self
                    .drm_mode(request.connector, &mode)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown mode"))?;
                let (width, height) = (mode.width as u32, mode.height as u32);
                let framebuffer = self.swapchain(request.crtc, (width, height))?.borrow().front();

                req.add_property(
                    connector,
                    card.property(connector, "CRTC_ID")?,
                    property::Value::CRTC(Some(crtc)),
                );
                let blob = card.create_property_blob(&drm_mode)?;
                req.add_property(crtc, card.property(crtc, "MODE_ID")?, blob);
                req.add_property(crtc, card.property(crtc, "ACTIVE")?, property::Value::Boolean(true));
                if let Some(plane) = plane {
                    let values = [
                        ("FB_ID", property::Value::Framebuffer(Some(framebuffer))),
                        ("CRTC_ID", property::Value::CRTC(Some(crtc))),
                        ("SRC_X", property::Value::UnsignedRange(0)),
                        ("SRC_Y", property::Value::UnsignedRange(0)),
                        ("SRC_W", property::Value::UnsignedRange((width as u64) << 16)),
                        ("SRC_H", property::Value::UnsignedRange((height as u64) << 16)),
                        ("CRTC_X", property::Value::SignedRange(0)),
                        ("CRTC_Y", property::Value::SignedRange(0)),
                        ("CRTC_W", property::Value::UnsignedRange(width as u64)),
                        ("CRTC_H", property::Value::UnsignedRange(height as u64)),
                    ];
                    for (name, value) in values {
                        req.add_property(plane, card.property(plane, name)?, value);
                    }
                }
            }
            None => {
                req.add_property(connector, card.property(connector, "CRTC_ID")?, property::Value::CRTC(None));
                req.add_property(crtc, card.property(crtc, "MODE_ID")?, property::Value::Blob(0));
                req.add_property(crtc, card.property(crtc, "ACTIVE")?, property::Value::Boolean(false));
                if let Some(plane) = plane {
                    req.add_property(plane, card.property(plane, "FB_ID")?, property::Value::Framebuffer(None));
                    req.add_property(plane, card.property(plane, "CRTC_ID")?, property::Value::CRTC(None));
                }
            }
        }

        let mut flags = AtomicCommitFlags::ALLOW_MODESET;
        if request.test_only {
            flags |= AtomicCommitFlags::TEST_ONLY;
        }
        card.atomic_commit(flags, req)
    }

    fn legacy_commit(&mut self, request: &ModesetRequest) -> io::Result<()> {
        let crtc: crtc::Handle = handle(request.crtc)?;
        let connector: connector::Handle = handle(request.connector)?;
        if request.test_only {
            // there is no test mode, check that the objects still exist
            self.card.get_crtc(crtc)?;
            self.card.get_connector(connector, false)?;
            return Ok(());
        }
        match request.mode {
            Some(mode) => {
                let drm_mode = self
                    .drm_mode(request.connector, &mode)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown mode"))?;
                let size = (mode.width as u32, mode.height as u32);
                let framebuffer = self.swapchain(request.crtc, size)?.borrow().front();
                self.card
                    .set_crtc(crtc, Some(framebuffer), (0, 0), &[connector], Some(drm_mode))
            }
            None => self.card.set_crtc(crtc, None, (0, 0), &[], None),
        }
    }
}

impl DrmDevice for KmsDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        let mut capabilities = DeviceCapabilities::empty();
        if matches!(self.card.get_driver_capability(DriverCapability::AddFB2Modifiers), Ok(1)) {
            capabilities |= DeviceCapabilities::ADDFB2_MODIFIERS;
        }
        if matches!(self.card.get_driver_capability(DriverCapability::MonotonicTimestamp), Ok(1)) {
            capabilities |= DeviceCapabilities::MONOTONIC_TIMESTAMPS;
        }
        capabilities
    }

    #[cfg_attr(feature = "profiling", profiling::function)]
    fn resources(&mut self) -> Result<DeviceResources, DeviceError> {
        let handles = self.card.resource_handles().map_err(DeviceError::Resources)?;
        let planes = self
            .card
            .plane_handles()
            .map_err(DeviceError::Resources)?
            .into_iter()
            .filter_map(|plane| match self.plane_info(&handles, plane) {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(path = ?self.path, "Skipping plane: {err}");
                    None
                }
            })
            .collect();
        let mut connectors = Vec::new();
        for connector in handles.connectors() {
            match self.connector_info(&handles, *connector) {
                Ok(info) => connectors.push(info),
                Err(err) => warn!(path = ?self.path, "Skipping connector: {err}"),
            }
        }
        Ok(DeviceResources {
            planes,
            crtcs: handles.crtcs().iter().map(|crtc| u32::from(*crtc)).collect(),
            connectors,
        })
    }

    fn enable_atomic(&mut self) -> Result<(), DeviceError> {
        self.card.set_client_capability(ClientCapability::Atomic, true)?;
        self.atomic = true;
        Ok(())
    }

    fn commit(&mut self, path: ModesetPath, request: &ModesetRequest) -> Result<(), ModesetError> {
        trace!(?path, ?request, "commit");
        let crtc = request.crtc;
        match path {
            ModesetPath::Atomic => self
                .atomic_commit(request)
                .map_err(|source| ModesetError::Atomic { crtc, source })?,
            ModesetPath::Legacy => self
                .legacy_commit(request)
                .map_err(|source| ModesetError::Legacy { crtc, source })?,
        }
        if request.mode.is_none() && !request.test_only {
            self.swapchains.remove(&crtc);
        }
        Ok(())
    }

    fn set_power(&mut self, path: ModesetPath, request: &ModesetRequest, on: bool) -> Result<(), ModesetError> {
        let crtc = request.crtc;
        match path {
            ModesetPath::Atomic => {
                let result = (|| {
                    let handle: crtc::Handle = handle(crtc)?;
                    let mut req = atomic::AtomicModeReq::new();
                    req.add_property(handle, self.card.property(handle, "ACTIVE")?, property::Value::Boolean(on));
                    self.card.atomic_commit(AtomicCommitFlags::ALLOW_MODESET, req)
                })();
                result.map_err(|source| ModesetError::Atomic { crtc, source })
            }
            ModesetPath::Legacy => {
                let result = (|| {
                    let connector: connector::Handle = handle(request.connector)?;
                    let dpms = self.card.property(connector, "DPMS")?;
                    self.card
                        .set_property(connector, dpms, if on { DPMS_ON } else { DPMS_OFF })
                })();
                result.map_err(|source| ModesetError::Legacy { crtc, source })
            }
        }
    }

    fn create_egl_display(&mut self) -> Result<EglDisplay, DeviceError> {
        Err(DeviceError::Unsupported("hardware rendering"))
    }

    fn create_presenter(&mut self, target: &ScanoutTarget) -> Result<Box<dyn Presenter>, DeviceError> {
        let size = (target.mode.width as u32, target.mode.height as u32);
        let swapchain = self.swapchain(target.crtc, size)?;
        let crtc: crtc::Handle = handle(target.crtc)?;
        let flipper = CrtcFlipper {
            card: self.card.clone(),
            crtc,
            swapchain,
        };
        Ok(Box::new(DumbPresenter::new(
            flipper,
            size,
            target.mode.refresh,
            self.pending_flips.clone(),
        )))
    }

    fn event_fd(&self) -> Option<OwnedFd> {
        self.card.0.try_clone().map(OwnedFd::from).ok()
    }

    fn receive_events(&mut self) -> Result<Vec<PageFlip>, DeviceError> {
        let mut flips = Vec::new();
        for event in self.card.receive_events()? {
            if let Event::PageFlip(event) = event {
                self.pending_flips
                    .set(self.pending_flips.get().saturating_sub(1));
                flips.push(PageFlip {
                    crtc: event.crtc.into(),
                    sequence: event.frame,
                    timestamp: event.duration,
                });
            }
        }
        Ok(flips)
    }

    fn wait_idle(&mut self) {
        let card = self.card.clone();
        let pending = self.pending_flips.clone();
        let drained = wait_for_flips(&pending, FLIP_TIMEOUT, |timeout| {
            if wait_readable(&card, timeout)? {
                self.receive_events()?;
            }
            Ok(())
        });
        match drained {
            Ok(true) => {}
            Ok(false) => {
                warn!(path = ?self.path, pending = pending.get(), "Timed out waiting for page flips");
                pending.set(0);
            }
            Err(err) => warn!(path = ?self.path, "Failed to wait for pending flips: {err}"),
        }
    }
}

/// Calls `wait` with the time left until `pending` drops to zero or `timeout` passed.
///
/// Returns whether every flip arrived.
fn wait_for_flips(
    pending: &Cell<usize>,
    timeout: Duration,
    mut wait: impl FnMut(Duration) -> Result<(), DeviceError>,
) -> Result<bool, DeviceError> {
    let deadline = Instant::now() + timeout;
    while pending.get() > 0 {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(false);
        }
        wait(left)?;
    }
    Ok(true)
}

/// Polls the card until it has events to read or `timeout` passed.
fn wait_readable(card: &Card, timeout: Duration) -> io::Result<bool> {
    let mut event_loop = EventLoop::<bool>::try_new().map_err(io::Error::other)?;
    let fd = card.0.try_clone()?;
    event_loop
        .handle()
        .insert_source(Generic::new(fd, Interest::READ, PollMode::Level), |_, _, ready| {
            *ready = true;
            Ok(PostAction::Remove)
        })
        .map_err(|err| io::Error::other(err.error))?;
    let mut ready = false;
    event_loop
        .dispatch(Some(timeout), &mut ready)
        .map_err(io::Error::other)?;
    Ok(ready)
}

/// Copies rows of `stride` bytes into rows of `pitch` bytes, truncating whichever is longer.
fn copy_rows(target: &mut [u8], pitch: usize, pixels: &[u8], stride: usize) {
    if pitch == 0 || stride == 0 {
        return;
    }
    for (row, source) in target.chunks_mut(pitch).zip(pixels.chunks(stride)) {
        let len = row.len().min(source.len());
        row[..len].copy_from_slice(&source[..len]);
    }
}

/// Puts a finished frame on screen.
trait Flipper {
    /// Shows `pixels` with the next vertical blank, queueing a page flip event.
    fn flip(&mut self, pixels: &[u8], stride: usize) -> io::Result<()>;
}

/// Flips the dumb swapchain of a crtc.
struct CrtcFlipper {
    card: Rc<Card>,
    crtc: crtc::Handle,
    swapchain: Rc<RefCell<DumbSwapchain>>,
}

impl Flipper for CrtcFlipper {
    fn flip(&mut self, pixels: &[u8], stride: usize) -> io::Result<()> {
        let framebuffer = self.swapchain.borrow_mut().present(pixels, stride)?;
        self.card
            .page_flip(self.crtc, framebuffer, PageFlipFlags::EVENT, None)
    }
}

/// Presents CPU rendered frames by flipping dumb buffers.
struct DumbPresenter<F> {
    flipper: F,
    shadow: Vec<u8>,
    size: (u32, u32),
    refresh_rate: u32,
    presented: bool,
    pending_flips: Rc<Cell<usize>>,
}

impl<F: Flipper> DumbPresenter<F> {
    fn new(flipper: F, size: (u32, u32), refresh_rate: u32, pending_flips: Rc<Cell<usize>>) -> Self {
        Self {
            flipper,
            shadow: vec![0; size.0 as usize * size.1 as usize * 4],
            size,
            refresh_rate,
            presented: false,
            pending_flips,
        }
    }
}

impl<F: Flipper> Presenter for DumbPresenter<F> {
    fn capabilities(&self) -> PresentCapabilities {
        PresentCapabilities::BUFFER_AGE | PresentCapabilities::COMPLETION_EVENTS
    }

    fn geometry(&self) -> Rect {
        Rect::from_loc_and_size((0, 0), (self.size.0 as i32, self.size.1 as i32))
    }

    fn format(&self) -> Fourcc {
        Fourcc::Xrgb8888
    }

    fn refresh_rate(&self) -> u32 {
        self.refresh_rate
    }

    // the shadow buffer always holds the previous frame
    fn buffer_age(&self) -> usize {
        usize::from(self.presented)
    }

    fn back_buffer(&mut self) -> Option<PixelTarget<'_>> {
        Some(PixelTarget {
            data: &mut self.shadow,
            stride: self.size.0 as usize * 4,
            width: self.size.0,
            height: self.size.1,
            format: Fourcc::Xrgb8888,
        })
    }

    #[cfg_attr(feature = "profiling", profiling::function)]
    fn swap_buffers(&mut self) -> Result<(), PresentError> {
        let stride = self.size.0 as usize * 4;
        self.flipper
            .flip(&self.shadow, stride)
            .map_err(present_error)?;
        self.pending_flips.set(self.pending_flips.get() + 1);
        self.presented = true;
        Ok(())
    }

    fn post_sub_buffer(&mut self, _rects: &[Rect]) -> Result<(), PresentError> {
        self.swap_buffers()
    }

    fn reset_buffers(&mut self) {
        self.presented = false;
    }
}

fn present_error(err: io::Error) -> PresentError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => PresentError::DeviceInactive,
        _ => PresentError::Failed(err),
    }
}

fn handle<H: From<control::RawResourceHandle>>(id: u32) -> io::Result<H> {
    control::from_u32(id).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "null handle"))
}

/// Bitmask of the positions of `crtcs` in the device's crtc list.
fn crtc_mask(handles: &ResourceHandles, crtcs: &[crtc::Handle]) -> u32 {
    handles
        .crtcs()
        .iter()
        .enumerate()
        .filter(|(index, crtc)| *index < 32 && crtcs.contains(crtc))
        .fold(0, |mask, (index, _)| mask | 1 << index)
}

fn convert_mode(mode: &control::Mode) -> Mode {
    let (width, height) = mode.size();
    Mode {
        width,
        height,
        refresh: refresh_rate(mode),
        preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
    }
}

/// Refresh rate in mHz, computed from the pixel clock for precision.
fn refresh_rate(mode: &control::Mode) -> u32 {
    let (_, _, htotal) = mode.hsync();
    let (_, _, vtotal) = mode.vsync();
    let pixels = htotal as u64 * vtotal as u64;
    if pixels == 0 {
        return mode.vrefresh() * 1000;
    }
    ((mode.clock() as u64 * 1_000_000 + pixels / 2) / pixels) as u32
}

/// Reads manufacturer, model and serial number from an EDID blob.
fn parse_edid(data: &[u8]) -> Option<EdidIdentity> {
    const HEADER: [u8; 8] = [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];
    if data.len() < 128 || data[..8] != HEADER {
        return None;
    }

    let vendor = u16::from_be_bytes([data[8], data[9]]);
    let make = [10, 5, 0]
        .iter()
        .map(|shift| char::from(b'A' - 1 + ((vendor >> shift) & 0x1f) as u8))
        .collect::<String>();
    let product = u16::from_le_bytes([data[10], data[11]]);
    let serial_number = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);

    let mut model = None;
    let mut serial = None;
    for descriptor in data[54..126].chunks(18) {
        if descriptor[..3] != [0, 0, 0] {
            continue;
        }
        let text = || {
            String::from_utf8_lossy(&descriptor[5..])
                .split('\n')
                .next()
                .unwrap_or_default()
                .trim()
                .to_owned()
        };
        match descriptor[3] {
            0xfc => model = Some(text()),
            0xff => serial = Some(text()),
            _ => {}
        }
    }

    Some(EdidIdentity {
        make,
        model: model.unwrap_or_else(|| format!("{product:#06x}")),
        serial: serial.unwrap_or_else(|| serial_number.to_string()),
    })
}
