//! The output backend: every GPU, its outputs, and the frame loop of every screen.
//!
//! [`Backend`] is the data of the event loop. Device hot-plug, page flips and simulated vertical
//! blanks all arrive as event sources calling back into it.

use std::{
    cell::RefCell,
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use calloop::{
    channel::{Channel, Event as ChannelEvent},
    generic::Generic,
    timer::{TimeoutAction, Timer},
    Interest, LoopHandle, Mode, PostAction, RegistrationToken,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::{BackendConfig, OutputConfig, OutputConfigStore},
    device::DeviceOpener,
    error::{BackendError, PresentError},
    gpu::Gpu,
    multigpu::MultiGpuBackend,
    observer::{CallbackRef, Observers},
    output::{DpmsMode, GpuId, OutputEvent, OutputId, OutputPipeline},
    presenter::{OutputRenderer, PixelTarget, PresentCapabilities},
    region::{Rect, Region},
    render_backend::GpuRenderBackend,
    render_loop::{FrameCompleted, PacingMode, RenderLoop},
    surface::{SurfaceItem, SurfaceKind},
    texture::TextureBackend,
    vsync::SoftwareVsyncMonitor,
};

/// Addresses one output of one GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputKey {
    pub gpu: GpuId,
    pub output: OutputId,
}

/// Hot-plug notifications for graphics devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Added { device_id: u64, path: PathBuf },
    Changed { device_id: u64 },
    Removed { device_id: u64 },
}

/// What the scene needs to know about the screen it paints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenInfo {
    /// Global screen index
    pub index: usize,
    pub key: OutputKey,
    pub name: String,
    pub geometry: Rect,
    /// Refresh rate in mHz
    pub refresh_rate: u32,
}

/// The outcome of painting one frame.
#[derive(Debug, Clone, Default)]
pub struct PaintedFrame {
    /// Everything that was drawn, at least the requested repaint region
    pub rendered: Region,
    /// What changed compared to the previous frame
    pub damaged: Region,
}

/// The composition layer producing frames.
pub trait Scene {
    /// Paints `repaint` and whatever changed since the last frame of `screen`.
    ///
    /// `target` is the back buffer for software presenters. Returning an empty rendered region
    /// skips the frame.
    fn paint(&mut self, screen: &ScreenInfo, repaint: &Region, target: Option<PixelTarget<'_>>) -> PaintedFrame;

    /// A surface covering all of `screen` that could be scanned out without composition.
    fn scanout_candidate(&self, _screen: &ScreenInfo) -> Option<&SurfaceItem> {
        None
    }

    /// A frame became visible. Returns whether `screen` should be repainted.
    fn frame_presented(&mut self, _screen: &ScreenInfo, _frame: &FrameCompleted) -> bool {
        false
    }
}

/// A frame became visible on a screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePresented {
    pub screen: ScreenInfo,
    pub frame: FrameCompleted,
}

#[derive(Debug)]
struct SurfaceData {
    render_loop: RenderLoop,
    vsync: Option<SoftwareVsyncMonitor<Backend>>,
    render_queued: bool,
}

impl SurfaceData {
    fn invalidate(&mut self) {
        self.render_loop.invalidate();
        self.render_queued = false;
        if let Some(vsync) = self.vsync.as_mut() {
            vsync.disarm();
        }
    }
}

#[derive(Debug)]
struct DeviceData {
    surfaces: HashMap<OutputId, SurfaceData>,
    gpu: Gpu,
    event_token: Option<RegistrationToken>,
}

/// Owns every GPU and drives the frame loop of every enabled output.
pub struct Backend {
    pub handle: LoopHandle<'static, Backend>,
    config: BackendConfig,
    // renderers go before the devices they present to
    dispatcher: MultiGpuBackend,
    devices: Vec<DeviceData>,
    opener: Box<dyn DeviceOpener>,
    output_store: OutputConfigStore,
    scene: Box<dyn Scene>,
    session_active: bool,
    // hot-plugged while the session was paused
    pending_devices: Vec<(u64, PathBuf)>,
    presented_frames: u64,
    // filled by the observers registered on every gpu
    gpu_events: Rc<RefCell<Vec<OutputEvent>>>,
    output_events: Observers<OutputEvent>,
    frame_presented: Observers<FramePresented>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("devices", &self.devices)
            .field("session_active", &self.session_active)
            .field("presented_frames", &self.presented_frames)
            .finish_non_exhaustive()
    }
}

impl Backend {
    pub fn new(
        handle: LoopHandle<'static, Backend>,
        config: BackendConfig,
        opener: Box<dyn DeviceOpener>,
        scene: Box<dyn Scene>,
        output_store: OutputConfigStore,
    ) -> Self {
        Self {
            handle,
            config,
            dispatcher: MultiGpuBackend::new(),
            devices: Vec::new(),
            opener,
            output_store,
            scene,
            session_active: true,
            pending_devices: Vec::new(),
            presented_frames: 0,
            gpu_events: Rc::new(RefCell::new(Vec::new())),
            output_events: Observers::new(),
            frame_presented: Observers::new(),
        }
    }

    /// Feeds device hot-plug events from `channel` into the backend.
    pub fn insert_device_channel(
        &self,
        channel: Channel<DeviceEvent>,
    ) -> Result<RegistrationToken, calloop::Error> {
        self.handle
            .insert_source(channel, |event, _, backend| {
                if let ChannelEvent::Msg(event) = event {
                    backend.handle_device_event(event);
                }
            })
            .map_err(|err| err.error)
    }

    pub fn handle_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Added { device_id, path } => {
                if let Err(err) = self.device_added(device_id, &path) {
                    error!(?path, "Skipping device: {err}");
                }
            }
            DeviceEvent::Changed { device_id } => self.device_changed(GpuId(device_id)),
            DeviceEvent::Removed { device_id } => self.device_removed(GpuId(device_id)),
        }
    }

    /// Opens a GPU and brings up its connected outputs. Adding a known GPU does nothing.
    ///
    /// While the session is paused the device is only remembered and opened on
    /// [`Backend::activate_session`].
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn device_added(&mut self, device_id: u64, path: &Path) -> Result<(), BackendError> {
        let id = GpuId(device_id);
        if self.device_index(id).is_some() {
            debug!(%id, ?path, "Device already added");
            return Ok(());
        }
        if !self.session_active {
            debug!(%id, ?path, "Session paused, deferring device");
            self.pending_devices.retain(|(pending, _)| *pending != device_id);
            self.pending_devices.push((device_id, path.to_path_buf()));
            return Ok(());
        }

        let primary = self.devices.is_empty();
        let mut gpu = Gpu::open(
            self.opener.as_mut(),
            path,
            id,
            primary,
            self.config.force_legacy_modeset,
        )?;
        self.observe_gpu(&mut gpu);

        let texture_backend = match gpu.egl_display() {
            Some(display) => TextureBackend::OpenGl(display.importer.clone()),
            None => TextureBackend::Raster,
        };

        let event_token = gpu.event_fd().and_then(|fd| {
            self.handle
                .insert_source(
                    Generic::new(fd, Interest::READ, Mode::Level),
                    move |_, _, backend: &mut Backend| {
                        backend.dispatch_device_events(id);
                        Ok(PostAction::Continue)
                    },
                )
                .map_err(|err| warn!(%id, "Failed to watch device events: {}", err.error))
                .ok()
        });

        self.dispatcher
            .add_gpu(GpuRenderBackend::new(id, texture_backend));
        self.devices.push(DeviceData {
            surfaces: HashMap::new(),
            gpu,
            event_token,
        });

        self.device_changed(id);
        Ok(())
    }

    /// Rescans the outputs of a GPU after a hot-plug notification.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn device_changed(&mut self, id: GpuId) {
        let Some(index) = self.device_index(id) else {
            debug!(%id, "Change event for unknown device");
            return;
        };
        // rescanned on activation
        if !self.session_active {
            trace!(%id, "Session paused, ignoring change event");
            return;
        }

        let changes = self.devices[index].gpu.update_outputs();
        for output in changes.removed.iter() {
            self.teardown_surface(OutputKey {
                gpu: id,
                output: output.id(),
            });
        }
        self.flush_output_events();

        for output_id in changes.added {
            let Some(output) = self.devices[index].gpu.output(output_id).cloned() else {
                continue;
            };
            let enabled = match self.output_store.get(&output.uuid()) {
                Some(config) => config.enabled,
                None => {
                    self.remember_output(&output, true);
                    true
                }
            };
            if !enabled {
                info!(output = %output.name(), "Output disabled by configuration");
                continue;
            }
            let key = OutputKey {
                gpu: id,
                output: output_id,
            };
            if let Err(err) = self.set_output_enabled(key, true) {
                warn!(output = %output.name(), "Unable to enable output: {err}");
            }
        }

        self.devices[index].gpu.check_outputs_are_on();
        self.sync_surfaces(id);
        self.flush_output_events();
    }

    /// Releases a GPU that went away.
    ///
    /// Frame loops of its outputs are invalidated and the device is idle before its renderers are
    /// dropped; outputs are torn down before the device itself.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn device_removed(&mut self, id: GpuId) {
        self.pending_devices.retain(|(pending, _)| *pending != id.0);
        let Some(index) = self.device_index(id) else {
            debug!(%id, "Remove event for unknown device");
            return;
        };
        info!(%id, "Removing device");

        let mut device = self.devices.remove(index);
        for surface in device.surfaces.values_mut() {
            surface.invalidate();
        }
        device.gpu.wait_idle();
        drop(self.dispatcher.remove_gpu(id));
        device.surfaces.clear();

        if let Some(token) = device.event_token.take() {
            self.handle.remove(token);
        }
        device.gpu.teardown();
        self.flush_output_events();
    }

    /// Enables an output and remembers the choice.
    pub fn enable_output(&mut self, key: OutputKey) -> Result<(), BackendError> {
        self.ensure_session()?;
        self.set_output_enabled(key, true)?;
        if let Some(output) = self.output(key).cloned() {
            self.remember_output(&output, true);
        }
        self.sync_surfaces(key.gpu);
        Ok(())
    }

    /// Disables an output and remembers the choice.
    pub fn disable_output(&mut self, key: OutputKey) -> Result<(), BackendError> {
        self.ensure_session()?;
        self.set_output_enabled(key, false)?;
        if let Some(output) = self.output(key).cloned() {
            self.remember_output(&output, false);
        }
        self.sync_surfaces(key.gpu);
        Ok(())
    }

    fn set_output_enabled(&mut self, key: OutputKey, enabled: bool) -> Result<(), BackendError> {
        let index = self
            .device_index(key.gpu)
            .ok_or(BackendError::UnknownGpu(key.gpu.0))?;
        let gpu = &mut self.devices[index].gpu;
        let result = if enabled {
            gpu.enable_output(key.output)
        } else {
            gpu.disable_output(key.output)
        };
        self.flush_output_events();
        Ok(result?)
    }

    /// Queues the output notifications of `gpu` for [`Backend::flush_output_events`].
    fn observe_gpu(&self, gpu: &mut Gpu) {
        let queue = self.gpu_events.clone();
        gpu.on_output_added(move |output| queue.borrow_mut().push(OutputEvent::Added(output.clone())));
        let queue = self.gpu_events.clone();
        gpu.on_output_removed(move |output| queue.borrow_mut().push(OutputEvent::Removed(output.clone())));
        let queue = self.gpu_events.clone();
        gpu.on_output_enabled(move |output| queue.borrow_mut().push(OutputEvent::Enabled(output.clone())));
        let queue = self.gpu_events.clone();
        gpu.on_output_disabled(move |output| queue.borrow_mut().push(OutputEvent::Disabled(output.clone())));
    }

    /// Passes the queued gpu notifications on to the output observers.
    fn flush_output_events(&mut self) {
        let events = std::mem::take(&mut *self.gpu_events.borrow_mut());
        for event in events.iter() {
            self.output_events.emit(event);
        }
    }

    fn remember_output(&mut self, output: &OutputPipeline, enabled: bool) {
        let config = OutputConfig {
            name: output.name().to_owned(),
            enabled,
        };
        if self.output_store.set(output.uuid(), config) {
            if let Err(err) = self.output_store.save() {
                warn!(output = %output.name(), "Failed to save output configuration: {err}");
            }
        }
    }

    /// Creates or drops renderers and frame loops so that exactly the enabled outputs have one.
    fn sync_surfaces(&mut self, id: GpuId) {
        let Some(index) = self.device_index(id) else {
            return;
        };
        let Some(render_backend) = self.dispatcher.backend_mut(id) else {
            return;
        };
        let device = &mut self.devices[index];
        let enabled = device.gpu.enabled_outputs();

        let stale = device
            .surfaces
            .keys()
            .filter(|output| !enabled.contains(output))
            .copied()
            .collect::<Vec<_>>();
        for output in stale {
            if let Some(mut surface) = device.surfaces.remove(&output) {
                surface.invalidate();
            }
            render_backend.remove_output(output);
            debug!(gpu = %id, %output, "Dropped renderer");
        }

        let mut added = Vec::new();
        let mut failed = Vec::new();
        for output in enabled.iter().copied() {
            if device.surfaces.contains_key(&output) {
                continue;
            }
            let presenter = match device.gpu.create_presenter(output) {
                Ok(presenter) => presenter,
                Err(err) => {
                    error!(gpu = %id, %output, "Failed to create presenter: {err}");
                    failed.push(output);
                    continue;
                }
            };
            let renderer = OutputRenderer::new(presenter, self.config.damage_history_depth);
            let refresh_rate = renderer.refresh_rate();
            let key = OutputKey { gpu: id, output };

            let hardware_pacing = renderer
                .capabilities()
                .contains(PresentCapabilities::COMPLETION_EVENTS)
                && !self.config.force_software_vsync;
            let (pacing, vsync) = if hardware_pacing {
                (PacingMode::Hardware, None)
            } else {
                let monitor = SoftwareVsyncMonitor::new(
                    self.handle.clone(),
                    refresh_rate,
                    move |backend: &mut Backend, timestamp| backend.frame_finish(key, timestamp),
                );
                (PacingMode::Software, Some(monitor))
            };
            debug!(gpu = %id, %output, ?pacing, refresh_rate, "Created renderer");

            device.surfaces.insert(
                output,
                SurfaceData {
                    render_loop: RenderLoop::new(refresh_rate, pacing),
                    vsync,
                    render_queued: false,
                },
            );
            render_backend.add_output(output, renderer);
            added.push(key);
        }
        render_backend.sort_outputs(&enabled);

        // an output nothing can be presented to is of no use
        for output in failed {
            if let Err(err) = device.gpu.disable_output(output) {
                warn!(gpu = %id, %output, "Failed to disable output: {err}");
            }
        }
        self.flush_output_events();

        for key in added {
            self.schedule_repaint(key);
        }
    }

    fn teardown_surface(&mut self, key: OutputKey) {
        if let Some(index) = self.device_index(key.gpu) {
            if let Some(mut surface) = self.devices[index].surfaces.remove(&key.output) {
                surface.invalidate();
            }
        }
        if let Some(backend) = self.dispatcher.backend_mut(key.gpu) {
            backend.remove_output(key.output);
        }
    }

    /// Stops rendering until [`Backend::activate_session`], e.g. on a VT switch.
    pub fn pause_session(&mut self) {
        if !self.session_active {
            return;
        }
        info!("Pausing session");
        self.session_active = false;
        for device in self.devices.iter_mut() {
            for surface in device.surfaces.values_mut() {
                surface.invalidate();
            }
        }
    }

    /// Restores every output after the session became active again and repaints everything.
    pub fn activate_session(&mut self) {
        if self.session_active {
            return;
        }
        info!("Resuming session");
        self.session_active = true;

        let gpus = self.devices.iter().map(|d| d.gpu.id()).collect::<Vec<_>>();
        for id in gpus {
            let Some(index) = self.device_index(id) else {
                continue;
            };
            self.devices[index].gpu.restore_outputs();
            self.flush_output_events();
            // connectors may have changed while we were away
            self.device_changed(id);
        }
        for (device_id, path) in std::mem::take(&mut self.pending_devices) {
            if let Err(err) = self.device_added(device_id, &path) {
                error!(?path, "Skipping device: {err}");
            }
        }
        self.dispatcher.reset();
        self.schedule_repaint_all();
    }

    pub fn is_session_active(&self) -> bool {
        self.session_active
    }

    fn ensure_session(&self) -> Result<(), BackendError> {
        if self.session_active {
            Ok(())
        } else {
            Err(BackendError::SessionLost)
        }
    }

    /// Powers the display of `screen` on or off.
    pub fn set_dpms(&mut self, screen: usize, mode: DpmsMode) -> Result<(), BackendError> {
        self.ensure_session()?;
        let (gpu, output) = self
            .dispatcher
            .output(screen)
            .ok_or(BackendError::UnknownScreen(screen))?;
        let key = OutputKey { gpu, output };
        let index = self
            .device_index(gpu)
            .ok_or(BackendError::UnknownGpu(gpu.0))?;
        let previous = self.devices[index].gpu.output(output).map(OutputPipeline::dpms);
        self.devices[index].gpu.set_dpms(output, mode)?;
        if previous == Some(mode) {
            return Ok(());
        }

        match mode {
            DpmsMode::On => {
                if let Some(backend) = self.dispatcher.backend_mut(gpu) {
                    backend.reset();
                }
                if let Some(surface) = self.surface_mut(key) {
                    surface.render_loop.uninhibit();
                }
                self.schedule_repaint(key);
            }
            DpmsMode::Off => {
                if let Some(surface) = self.surface_mut(key) {
                    surface.invalidate();
                    surface.render_loop.inhibit();
                }
            }
        }
        Ok(())
    }

    /// Powers on every display that was switched off. Returns whether any was.
    pub fn turn_outputs_on(&mut self) -> bool {
        if !self.session_active {
            return false;
        }
        let sleeping = (0..self.dispatcher.screen_count())
            .filter(|screen| {
                self.dispatcher
                    .output(*screen)
                    .and_then(|(gpu, output)| self.output(OutputKey { gpu, output }))
                    .is_some_and(|output| output.dpms() == DpmsMode::Off)
            })
            .collect::<Vec<_>>();
        for screen in sleeping.iter() {
            if let Err(err) = self.set_dpms(*screen, DpmsMode::On) {
                warn!(screen, "Failed to power on display: {err}");
            }
        }
        !sleeping.is_empty()
    }

    /// Test-commits every enabled output, disabling those the hardware no longer accepts.
    pub fn check_outputs_are_on(&mut self) {
        if !self.session_active {
            return;
        }
        let gpus = self.devices.iter().map(|d| d.gpu.id()).collect::<Vec<_>>();
        for id in gpus {
            let Some(index) = self.device_index(id) else {
                continue;
            };
            let disabled = self.devices[index].gpu.check_outputs_are_on();
            if !disabled.is_empty() {
                self.sync_surfaces(id);
                self.flush_output_events();
            }
        }
    }

    /// Changes the rate an output is paced at, e.g. after its mode changed.
    pub fn set_refresh_rate(&mut self, key: OutputKey, refresh_rate: u32) {
        let Some(surface) = self.surface_mut(key) else {
            return;
        };
        surface.render_loop.set_refresh_rate(refresh_rate);
        if let Some(vsync) = surface.vsync.as_mut() {
            vsync.set_refresh_rate(refresh_rate);
        }
        debug!(?key, refresh_rate, "Refresh rate changed");
    }

    /// Asks for a new frame on an output.
    pub fn schedule_repaint(&mut self, key: OutputKey) {
        let handle = self.handle.clone();
        let Some(surface) = self.surface_mut(key) else {
            return;
        };
        if surface.render_loop.schedule_repaint() && !surface.render_queued {
            surface.render_queued = true;
            handle.insert_idle(move |backend| backend.render_output(key));
        }
    }

    pub fn schedule_repaint_all(&mut self) {
        for (gpu, output) in self.dispatcher.screens() {
            self.schedule_repaint(OutputKey { gpu, output });
        }
    }

    fn reschedule(&mut self, key: OutputKey, delay: Duration) {
        trace!(?key, ?delay, "reschedule repaint timer");
        let timer = Timer::from_duration(delay);
        if let Err(err) = self.handle.insert_source(timer, move |_, _, backend| {
            backend.schedule_repaint(key);
            TimeoutAction::Drop
        }) {
            error!(?key, "Failed to schedule frame timer: {}", err.error);
        }
    }

    /// Renders and submits one frame of an output.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn render_output(&mut self, key: OutputKey) {
        let Some(surface) = self.surface_mut(key) else {
            return;
        };
        surface.render_queued = false;

        if !self.session_active {
            trace!(?key, "Session inactive, not rendering");
            return;
        }
        if !self.output(key).is_some_and(OutputPipeline::is_presentable) {
            return;
        }
        let Some(screen) = self.screen_info(key) else {
            return;
        };
        let Some(surface) = self.surface_mut(key) else {
            return;
        };
        if let Err(err) = surface.render_loop.begin_frame() {
            trace!(?key, "Not starting frame: {err}");
            return;
        }

        let result = self.draw_frame(&screen);

        let Some(surface) = self.surface_mut(key) else {
            return;
        };
        let refresh_interval = surface.render_loop.refresh_interval();
        match result {
            Ok(submitted) => {
                if let Err(err) = surface.render_loop.end_frame(submitted) {
                    warn!(?key, "Frame loop out of step: {err}");
                }
                if submitted {
                    if let Some(vsync) = surface.vsync.as_mut() {
                        vsync.arm();
                    }
                }
            }
            Err(err) => {
                if let Err(err) = surface.render_loop.end_frame(false) {
                    warn!(?key, "Frame loop out of step: {err}");
                }
                match err {
                    BackendError::Present(PresentError::DeviceInactive) => {
                        debug!(?key, "Device inactive, waiting for the session");
                    }
                    BackendError::Present(PresentError::ContextLost(reason)) => {
                        error!(?key, "Rendering context lost: {reason}");
                    }
                    err => {
                        warn!(?key, "Failed to submit frame: {err}");
                        self.reschedule(key, refresh_interval);
                    }
                }
            }
        }
    }

    fn draw_frame(&mut self, screen: &ScreenInfo) -> Result<bool, BackendError> {
        if let Some(item) = self.scene.scanout_candidate(screen) {
            if self.dispatcher.scanout(screen.index, item) {
                trace!(screen = screen.index, "direct scanout");
                return Ok(true);
            }
        }

        let repaint = self.dispatcher.begin_frame(screen.index)?;
        let target = self.dispatcher.back_buffer(screen.index);
        let frame = self.scene.paint(screen, &repaint, target);
        if frame.rendered.is_empty() {
            trace!(screen = screen.index, "nothing to render");
            return Ok(false);
        }
        self.dispatcher
            .end_frame(screen.index, &frame.rendered, &frame.damaged)?;
        Ok(true)
    }

    /// Handles the completion of the frame in flight on an output.
    ///
    /// Completions for outputs that no longer exist or have no frame in flight are ignored.
    pub fn frame_finish(&mut self, key: OutputKey, timestamp: Duration) {
        let Some(surface) = self.surface_mut(key) else {
            trace!(?key, "Frame completion for unknown output");
            return;
        };
        let Some(frame) = surface.render_loop.notify_frame_completed(timestamp) else {
            return;
        };
        let repaint_pending = surface.render_loop.repaint_pending();
        self.presented_frames += 1;

        let Some(screen) = self.screen_info(key) else {
            return;
        };
        let repaint = self.scene.frame_presented(&screen, &frame);
        self.frame_presented
            .emit(&FramePresented { screen, frame });
        if repaint_pending || repaint {
            self.schedule_repaint(key);
        }
    }

    /// Reads the completion events of a GPU.
    pub fn dispatch_device_events(&mut self, id: GpuId) {
        let Some(index) = self.device_index(id) else {
            return;
        };
        for (output, flip) in self.devices[index].gpu.dispatch_events() {
            self.frame_finish(OutputKey { gpu: id, output }, flip.timestamp);
        }
    }

    /// Removes every GPU.
    pub fn shutdown(&mut self) {
        let gpus = self.devices.iter().map(|d| d.gpu.id()).collect::<Vec<_>>();
        for id in gpus {
            self.device_removed(id);
        }
    }

    /// Creates a surface item using the texture backend of the primary GPU.
    pub fn create_surface_item(&self, kind: SurfaceKind) -> SurfaceItem {
        SurfaceItem::new(kind, self.dispatcher.texture_backend())
    }

    pub fn capabilities(&self) -> PresentCapabilities {
        self.dispatcher.capabilities()
    }

    pub fn direct_scanout_allowed(&self, screen: usize) -> bool {
        self.dispatcher.direct_scanout_allowed(screen)
    }

    pub fn screen_count(&self) -> usize {
        self.dispatcher.screen_count()
    }

    pub fn screens(&self) -> Vec<ScreenInfo> {
        self.dispatcher
            .screens()
            .into_iter()
            .filter_map(|(gpu, output)| self.screen_info(OutputKey { gpu, output }))
            .collect()
    }

    pub fn screen_info(&self, key: OutputKey) -> Option<ScreenInfo> {
        let index = self.dispatcher.screen_of(key.gpu, key.output)?;
        let device = &self.devices[self.device_index(key.gpu)?];
        let output = device.gpu.output(key.output)?;
        let refresh_rate = device
            .surfaces
            .get(&key.output)
            .map(|surface| surface.render_loop.refresh_rate())
            .unwrap_or(output.mode().refresh);
        Some(ScreenInfo {
            index,
            key,
            name: output.name().to_owned(),
            geometry: self.dispatcher.screen_geometry(index)?,
            refresh_rate,
        })
    }

    pub fn gpus(&self) -> impl Iterator<Item = &Gpu> {
        self.devices.iter().map(|device| &device.gpu)
    }

    pub fn output(&self, key: OutputKey) -> Option<&OutputPipeline> {
        let index = self.device_index(key.gpu)?;
        self.devices[index].gpu.output(key.output)
    }

    pub fn render_loop(&self, key: OutputKey) -> Option<&RenderLoop> {
        let index = self.device_index(key.gpu)?;
        self.devices[index]
            .surfaces
            .get(&key.output)
            .map(|surface| &surface.render_loop)
    }

    /// Frames presented on all outputs so far.
    pub fn presented_frames(&self) -> u64 {
        self.presented_frames
    }

    pub fn on_output_event(&mut self, callback: impl FnMut(&OutputEvent) + 'static) -> CallbackRef {
        self.output_events.register(callback)
    }

    pub fn on_frame_presented(&mut self, callback: impl FnMut(&FramePresented) + 'static) -> CallbackRef {
        self.frame_presented.register(callback)
    }

    pub fn forget_callback(&mut self, callback_ref: CallbackRef) {
        self.output_events.forget(callback_ref);
        self.frame_presented.forget(callback_ref);
    }

    fn device_index(&self, id: GpuId) -> Option<usize> {
        self.devices.iter().position(|device| device.gpu.id() == id)
    }

    fn surface_mut(&mut self, key: OutputKey) -> Option<&mut SurfaceData> {
        let index = self.device_index(key.gpu)?;
        self.devices[index].surfaces.get_mut(&key.output)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use calloop::EventLoop;

    use super::*;
    use crate::{
        device::{DeviceResources, ModesetPath, PlaneType},
        output::PipelineState,
        testing::{connector, plane, FakeDevice, FakeOpener, PresentCall, RecordingScene},
    };

    const CARD0: &str = "/dev/dri/card0";
    const CARD1: &str = "/dev/dri/card1";

    fn single_head(connected: [bool; 2]) -> FakeDevice {
        let device = FakeDevice::new();
        device.set_resources(DeviceResources {
            planes: vec![
                plane(10, PlaneType::Primary, 0b01),
                plane(11, PlaneType::Primary, 0b10),
            ],
            crtcs: vec![100, 101],
            connectors: vec![
                connector(200, "DP-1", connected[0], 0b11),
                connector(201, "HDMI-A-1", connected[1], 0b11),
            ],
        });
        device
    }

    struct Harness {
        event_loop: EventLoop<'static, Backend>,
        backend: Backend,
        scene: RecordingScene,
        events: Rc<RefCell<Vec<OutputEvent>>>,
    }

    impl Harness {
        fn new(opener: FakeOpener, store: OutputConfigStore, config: BackendConfig) -> Self {
            let event_loop = EventLoop::<Backend>::try_new().unwrap();
            let scene = RecordingScene::default();
            let mut backend = Backend::new(
                event_loop.handle(),
                config,
                Box::new(opener),
                Box::new(scene.clone()),
                store,
            );
            let events = Rc::new(RefCell::new(Vec::new()));
            let log = events.clone();
            backend.on_output_event(move |event| log.borrow_mut().push(event.clone()));
            Harness {
                event_loop,
                backend,
                scene,
                events,
            }
        }

        fn dispatch(&mut self) {
            self.event_loop
                .dispatch(Some(Duration::ZERO), &mut self.backend)
                .unwrap();
        }
    }

    fn key(gpu: u64, output: u32) -> OutputKey {
        OutputKey {
            gpu: GpuId(gpu),
            output: OutputId(output),
        }
    }

    #[test]
    fn one_connected_display_gives_one_enabled_output() {
        let device = single_head([true, false]);
        let opener = FakeOpener::with_device(CARD0, device.clone());
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());

        harness.backend.device_added(1, Path::new(CARD0)).unwrap();

        assert_eq!(harness.backend.screen_count(), 1);
        let enabled = harness
            .backend
            .gpus()
            .flat_map(|gpu| gpu.outputs())
            .filter(|o| o.state() == PipelineState::Bound { enabled: true })
            .count();
        assert_eq!(enabled, 1);
        let events = harness.events.borrow();
        assert!(matches!(events[0], OutputEvent::Added(_)));
        assert!(matches!(events[1], OutputEvent::Enabled(_)));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn remembered_disabled_outputs_stay_off() {
        let device = single_head([true, false]);
        let mut store = OutputConfigStore::in_memory();
        let info = connector(200, "DP-1", true, 0b11);
        store.set(
            crate::config::output_uuid(&info),
            OutputConfig {
                name: "DP-1".into(),
                enabled: false,
            },
        );
        let opener = FakeOpener::with_device(CARD0, device);
        let mut harness = Harness::new(opener, store, BackendConfig::default());

        harness.backend.device_added(1, Path::new(CARD0)).unwrap();
        assert_eq!(harness.backend.screen_count(), 0);
        assert_eq!(
            harness.backend.output(key(1, 1)).map(|o| o.state()),
            Some(PipelineState::Bound { enabled: false })
        );

        harness.backend.enable_output(key(1, 1)).unwrap();
        assert_eq!(harness.backend.screen_count(), 1);
    }

    #[test]
    fn frames_complete_on_page_flip() {
        let device = single_head([true, false]);
        let opener = FakeOpener::with_device(CARD0, device.clone());
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        let presented = Rc::new(RefCell::new(Vec::new()));
        let log = presented.clone();
        harness
            .backend
            .on_frame_presented(move |event| log.borrow_mut().push(event.frame.sequence));

        harness.backend.device_added(1, Path::new(CARD0)).unwrap();
        harness.dispatch();

        assert_eq!(harness.scene.painted(), vec![0]);
        assert_eq!(device.presenter_calls(), vec![PresentCall::Swap]);
        let render_loop = harness.backend.render_loop(key(1, 1)).unwrap();
        assert_eq!(render_loop.state(), crate::render_loop::FrameState::InFlight);

        device.queue_flip(100, Duration::from_millis(16));
        harness.backend.dispatch_device_events(GpuId(1));
        assert_eq!(*presented.borrow(), vec![1]);
        assert_eq!(harness.backend.presented_frames(), 1);

        // a flip for a frame that is not in flight changes nothing
        harness.backend.frame_finish(key(1, 1), Duration::from_millis(32));
        assert_eq!(*presented.borrow(), vec![1]);
    }

    #[test]
    fn repaint_requests_during_a_frame_are_deferred() {
        let device = single_head([true, false]);
        let opener = FakeOpener::with_device(CARD0, device.clone());
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        harness.backend.device_added(1, Path::new(CARD0)).unwrap();
        harness.dispatch();

        harness.backend.schedule_repaint(key(1, 1));
        harness.dispatch();
        assert_eq!(harness.scene.painted().len(), 1);

        device.queue_flip(100, Duration::from_millis(16));
        harness.backend.dispatch_device_events(GpuId(1));
        harness.dispatch();
        assert_eq!(harness.scene.painted().len(), 2);
    }

    #[test]
    fn removing_a_gpu_with_a_frame_in_flight() {
        let device = single_head([true, false]);
        let opener = FakeOpener::with_device(CARD0, device.clone());
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        harness.backend.device_added(1, Path::new(CARD0)).unwrap();
        harness.dispatch();
        assert_eq!(
            harness.backend.render_loop(key(1, 1)).map(|l| l.state()),
            Some(crate::render_loop::FrameState::InFlight)
        );

        harness.backend.device_removed(GpuId(1));
        assert_eq!(harness.backend.screen_count(), 0);
        assert!(harness.backend.render_loop(key(1, 1)).is_none());
        assert_eq!(
            device.lifecycle(),
            vec!["wait_idle", "presenter dropped", "device closed"]
        );
        assert!(matches!(harness.events.borrow().last(), Some(OutputEvent::Removed(_))));

        // the late flip is dropped
        harness.backend.frame_finish(key(1, 1), Duration::from_millis(16));
        harness.dispatch();
        assert_eq!(harness.scene.painted().len(), 1);
    }

    #[test]
    fn hotplug_adds_and_removes_screens() {
        let device = single_head([true, false]);
        let opener = FakeOpener::with_device(CARD0, device.clone());
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        harness.backend.device_added(1, Path::new(CARD0)).unwrap();

        device.connect(201, true);
        harness.backend.handle_device_event(DeviceEvent::Changed { device_id: 1 });
        assert_eq!(harness.backend.screen_count(), 2);

        device.connect(200, false);
        harness.backend.handle_device_event(DeviceEvent::Changed { device_id: 1 });
        let screens = harness.backend.screens();
        assert_eq!(screens.len(), 1);
        assert_eq!(screens[0].name, "HDMI-A-1");
        assert_eq!(screens[0].index, 0);
    }

    #[test]
    fn screens_follow_gpu_order() {
        let first = single_head([true, true]);
        let second = single_head([true, false]);
        let mut opener = FakeOpener::with_device(CARD0, first);
        opener.add(CARD1, second);
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());

        harness.backend.device_added(1, Path::new(CARD0)).unwrap();
        harness.backend.device_added(2, Path::new(CARD1)).unwrap();
        let screens = harness.backend.screens();
        assert_eq!(screens.len(), 3);
        assert_eq!(screens[2].key, key(2, 1));

        harness.backend.device_removed(GpuId(1));
        let screens = harness.backend.screens();
        assert_eq!(screens.len(), 1);
        assert_eq!(screens[0].index, 0);
        assert_eq!(screens[0].key, key(2, 1));
    }

    #[test]
    fn paused_sessions_do_not_render() {
        let device = single_head([true, false]);
        let opener = FakeOpener::with_device(CARD0, device.clone());
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        harness.backend.device_added(1, Path::new(CARD0)).unwrap();

        harness.backend.pause_session();
        harness.dispatch();
        harness.backend.schedule_repaint_all();
        harness.dispatch();
        assert!(harness.scene.painted().is_empty());

        harness.backend.activate_session();
        harness.dispatch();
        assert_eq!(harness.scene.painted(), vec![0]);
        // the enable commit plus the restore commit
        assert_eq!(device.commits().len(), 2);
    }

    #[test]
    fn hotplug_during_a_pause_waits_for_the_session() {
        let first = single_head([true, false]);
        let second = single_head([true, false]);
        let mut opener = FakeOpener::with_device(CARD0, first.clone());
        opener.add(CARD1, second.clone());
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        harness.backend.device_added(1, Path::new(CARD0)).unwrap();
        assert_eq!(first.commits().len(), 1);

        harness.backend.pause_session();
        first.connect(201, true);
        harness.backend.handle_device_event(DeviceEvent::Changed { device_id: 1 });
        harness.backend.device_added(2, Path::new(CARD1)).unwrap();
        harness.backend.check_outputs_are_on();
        assert!(matches!(
            harness.backend.disable_output(key(1, 1)),
            Err(BackendError::SessionLost)
        ));
        assert!(matches!(
            harness.backend.set_dpms(0, DpmsMode::Off),
            Err(BackendError::SessionLost)
        ));
        assert_eq!(first.commits().len(), 1);
        assert!(second.commits().is_empty());
        assert_eq!(harness.backend.screen_count(), 1);

        harness.backend.activate_session();
        assert_eq!(harness.backend.screen_count(), 3);
        assert_eq!(second.commits().len(), 1);
        harness.dispatch();
        assert_eq!(harness.scene.painted().len(), 3);
    }

    #[test]
    fn outputs_rejected_by_the_device_are_reported_disabled() {
        let device = single_head([true, false]);
        let opener = FakeOpener::with_device(CARD0, device.clone());
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        harness.backend.device_added(1, Path::new(CARD0)).unwrap();
        assert_eq!(harness.backend.screen_count(), 1);

        device.fail_commits(ModesetPath::Atomic, true);
        harness.backend.check_outputs_are_on();

        assert_eq!(harness.backend.screen_count(), 0);
        assert!(harness.backend.render_loop(key(1, 1)).is_none());
        assert!(matches!(harness.events.borrow().last(), Some(OutputEvent::Disabled(_))));
    }

    #[test]
    fn forgetting_one_callback_keeps_the_others() {
        let device = single_head([true, false]);
        let opener = FakeOpener::with_device(CARD0, device);
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());

        let frames = harness.backend.on_frame_presented(|_| {});
        harness.backend.forget_callback(frames);
        harness.backend.device_added(1, Path::new(CARD0)).unwrap();

        assert_eq!(harness.events.borrow().len(), 2);
    }

    #[test]
    fn dpms_off_stops_rendering() {
        let device = single_head([true, false]);
        let opener = FakeOpener::with_device(CARD0, device.clone());
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        harness.backend.device_added(1, Path::new(CARD0)).unwrap();

        harness.backend.set_dpms(0, DpmsMode::Off).unwrap();
        harness.dispatch();
        assert!(harness.scene.painted().is_empty());

        assert!(harness.backend.turn_outputs_on());
        assert!(!harness.backend.turn_outputs_on());
        harness.dispatch();
        assert_eq!(harness.scene.painted(), vec![0]);
    }

    #[test]
    fn software_vsync_completes_frames() {
        let device = single_head([true, false]);
        device.set_presenter_capabilities(PresentCapabilities::empty());
        let opener = FakeOpener::with_device(CARD0, device.clone());
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        harness.backend.device_added(1, Path::new(CARD0)).unwrap();
        assert_eq!(
            harness.backend.render_loop(key(1, 1)).map(|l| l.pacing()),
            Some(PacingMode::Software)
        );

        harness.dispatch();
        for _ in 0..10 {
            if harness.backend.presented_frames() > 0 {
                break;
            }
            harness
                .event_loop
                .dispatch(Some(Duration::from_millis(20)), &mut harness.backend)
                .unwrap();
        }
        assert_eq!(harness.backend.presented_frames(), 1);
    }

    #[test]
    fn refresh_rate_changes_reach_the_frame_loop() {
        let device = single_head([true, false]);
        device.set_presenter_capabilities(PresentCapabilities::empty());
        let opener = FakeOpener::with_device(CARD0, device);
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        harness.backend.device_added(1, Path::new(CARD0)).unwrap();

        harness.backend.set_refresh_rate(key(1, 1), 144_000);
        let render_loop = harness.backend.render_loop(key(1, 1)).unwrap();
        assert_eq!(render_loop.refresh_rate(), 144_000);
        assert_eq!(harness.backend.screens()[0].refresh_rate, 144_000);
    }

    #[test]
    fn refresh_rate_change_with_a_pending_vblank_still_completes_the_frame() {
        let device = single_head([true, false]);
        device.set_presenter_capabilities(PresentCapabilities::empty());
        let opener = FakeOpener::with_device(CARD0, device);
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        harness.backend.device_added(1, Path::new(CARD0)).unwrap();
        harness.dispatch();
        let vsync_armed = |backend: &mut Backend| {
            backend
                .surface_mut(key(1, 1))
                .and_then(|surface| surface.vsync.as_ref())
                .is_some_and(SoftwareVsyncMonitor::is_armed)
        };
        assert!(vsync_armed(&mut harness.backend));

        harness.backend.set_refresh_rate(key(1, 1), 120_000);
        assert!(vsync_armed(&mut harness.backend));

        for _ in 0..10 {
            if harness.backend.presented_frames() > 0 {
                break;
            }
            harness
                .event_loop
                .dispatch(Some(Duration::from_millis(20)), &mut harness.backend)
                .unwrap();
        }
        assert_eq!(harness.backend.presented_frames(), 1);
        assert_eq!(harness.scene.painted(), vec![0]);
    }

    #[test]
    fn unknown_devices_and_screens_are_rejected() {
        let opener = FakeOpener::default();
        let mut harness = Harness::new(opener, OutputConfigStore::in_memory(), BackendConfig::default());
        assert!(harness.backend.device_added(1, Path::new(CARD0)).is_err());
        assert!(matches!(
            harness.backend.set_dpms(0, DpmsMode::Off),
            Err(BackendError::UnknownScreen(0))
        ));
        harness.backend.device_removed(GpuId(1));
        harness.backend.frame_finish(key(1, 1), Duration::ZERO);
    }
}
