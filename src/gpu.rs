//! One graphics device and the output pipelines it drives.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, trace, warn};

use crate::{
    config::output_uuid,
    device::{
        DeviceCapabilities, DeviceOpener, DeviceResources, DrmDevice, EglDisplay, ModesetPath,
        PageFlip, PlaneType,
    },
    error::{DeviceError, ModesetError},
    observer::{CallbackRef, Observers},
    output::{
        Connector, Crtc, DpmsMode, GpuId, OutputId, OutputPipeline, PipelineState, Plane,
    },
    presenter::Presenter,
};

/// Outputs that appeared or disappeared during [`Gpu::update_outputs`].
#[derive(Debug, Default)]
pub struct OutputChanges {
    pub added: Vec<OutputId>,
    pub removed: Vec<OutputPipeline>,
}

#[derive(Debug, Default)]
struct GpuObservers {
    output_added: Observers<OutputPipeline>,
    output_removed: Observers<OutputPipeline>,
    output_enabled: Observers<OutputPipeline>,
    output_disabled: Observers<OutputPipeline>,
}

/// A graphics device together with its planes, crtcs, connectors and output pipelines.
///
/// Every plane, crtc and connector belongs to at most one output at any time. Field order is
/// drop order: outputs go first, then the hardware resources, then the device itself.
pub struct Gpu {
    outputs: Vec<OutputPipeline>,
    planes: Vec<Plane>,
    crtcs: Vec<Crtc>,
    connectors: Vec<Connector>,
    egl_display: Option<EglDisplay>,
    device: Box<dyn DrmDevice>,

    id: GpuId,
    dev_node: PathBuf,
    primary: bool,
    capabilities: DeviceCapabilities,
    atomic_modesetting: Option<bool>,
    force_legacy: bool,
    next_output_id: u32,
    observers: GpuObservers,
}

impl std::fmt::Debug for Gpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpu")
            .field("id", &self.id)
            .field("dev_node", &self.dev_node)
            .field("primary", &self.primary)
            .field("atomic_modesetting", &self.atomic_modesetting)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl Gpu {
    /// Opens the device at `dev_node` and reads its capabilities and resources.
    ///
    /// Failing to create a rendering context is not fatal: such a GPU can still be used as a
    /// display sink.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn open(
        opener: &mut dyn DeviceOpener,
        dev_node: &Path,
        id: GpuId,
        primary: bool,
        force_legacy: bool,
    ) -> Result<Gpu, DeviceError> {
        let mut device = opener.open(dev_node)?;
        let capabilities = device.capabilities();
        let resources = device.resources()?;

        let egl_display = match device.create_egl_display() {
            Ok(egl) => {
                info!(?dev_node, driver = %egl.driver, "Initialized rendering context");
                Some(egl)
            }
            Err(err) => {
                warn!(?dev_node, "No rendering context, using gpu as display sink only: {err}");
                None
            }
        };

        let mut gpu = Gpu {
            outputs: Vec::new(),
            planes: Vec::new(),
            crtcs: Vec::new(),
            connectors: Vec::new(),
            egl_display,
            device,
            id,
            dev_node: dev_node.to_path_buf(),
            primary,
            capabilities,
            atomic_modesetting: None,
            force_legacy,
            next_output_id: 1,
            observers: GpuObservers::default(),
        };
        gpu.load_resources(resources);
        gpu.try_atomic_modeset();

        info!(
            ?dev_node,
            %id,
            primary,
            planes = gpu.planes.len(),
            crtcs = gpu.crtcs.len(),
            connectors = gpu.connectors.len(),
            "Opened gpu"
        );
        Ok(gpu)
    }

    fn load_resources(&mut self, resources: DeviceResources) {
        self.crtcs = resources
            .crtcs
            .into_iter()
            .enumerate()
            .map(|(index, id)| Crtc {
                id,
                index: index as u32,
                owner: None,
            })
            .collect();
        self.planes = resources
            .planes
            .into_iter()
            .map(|info| Plane { info, owner: None })
            .collect();
        self.planes.sort_by_key(|plane| plane.id());
        self.connectors = resources
            .connectors
            .into_iter()
            .map(|info| Connector { info, owner: None })
            .collect();
    }

    /// Decides once whether the device is driven through atomic commits.
    ///
    /// The outcome is cached for the lifetime of the device, so a failed probe is never repeated.
    pub fn try_atomic_modeset(&mut self) -> bool {
        if let Some(atomic) = self.atomic_modesetting {
            return atomic;
        }

        let atomic = if self.force_legacy {
            info!(dev_node = ?self.dev_node, "Atomic mode setting disabled by configuration");
            false
        } else {
            match self.device.enable_atomic() {
                Ok(()) => {
                    info!(dev_node = ?self.dev_node, "Using atomic mode setting");
                    true
                }
                Err(err) => {
                    warn!(
                        dev_node = ?self.dev_node,
                        "Atomic mode setting unavailable, falling back to legacy: {err}"
                    );
                    false
                }
            }
        };
        self.atomic_modesetting = Some(atomic);
        atomic
    }

    pub fn modeset_path(&self) -> ModesetPath {
        match self.atomic_modesetting {
            Some(true) => ModesetPath::Atomic,
            _ => ModesetPath::Legacy,
        }
    }

    /// Picks the free plane of type `kind` with the lowest id that can be used with `crtc`.
    ///
    /// Nothing is reserved; binding happens when the plane is attached to an output.
    pub fn allocate_plane(&self, kind: PlaneType, crtc: u32) -> Option<u32> {
        let index = self.crtc(crtc)?.index;
        self.planes
            .iter()
            .filter(|plane| plane.owner.is_none())
            .filter(|plane| plane.kind() == kind)
            .find(|plane| plane.is_compatible(index))
            .map(Plane::id)
    }

    /// Rescans the connectors and returns the output pipelines afterwards.
    pub fn enumerate_outputs(&mut self) -> &[OutputPipeline] {
        self.update_outputs();
        &self.outputs
    }

    /// Rescans the connectors, forming pipelines for newly connected displays and removing the
    /// pipelines of disconnected ones.
    ///
    /// New pipelines start out bound but disabled.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn update_outputs(&mut self) -> OutputChanges {
        let mut changes = OutputChanges::default();

        let resources = match self.device.resources() {
            Ok(resources) => resources,
            Err(err) => {
                warn!(dev_node = ?self.dev_node, "Failed to rescan connectors: {err}");
                return changes;
            }
        };

        // connectors keep their owner across rescans
        let mut connectors = Vec::with_capacity(resources.connectors.len());
        for info in resources.connectors {
            let owner = self
                .connector(info.id)
                .and_then(|connector| connector.owner);
            connectors.push(Connector { info, owner });
        }
        self.connectors = connectors;

        let stale = self
            .outputs
            .iter()
            .filter(|output| {
                self.connector(output.connector)
                    .map(|connector| !connector.info.connected)
                    .unwrap_or(true)
            })
            .map(|output| output.id)
            .collect::<Vec<_>>();
        for id in stale {
            if let Some(output) = self.remove_output(id) {
                changes.removed.push(output);
            }
        }

        let unclaimed = self
            .connectors
            .iter()
            .filter(|connector| connector.info.connected && connector.owner.is_none())
            .map(Connector::id)
            .collect::<Vec<_>>();
        for connector in unclaimed {
            if let Some(id) = self.form_pipeline(connector) {
                changes.added.push(id);
            }
        }

        changes
    }

    fn form_pipeline(&mut self, connector_id: u32) -> Option<OutputId> {
        let atomic = self.try_atomic_modeset();
        let connector = self.connector(connector_id)?.info.clone();

        let Some(mode) = connector.preferred_mode() else {
            warn!(connector = %connector.name, "Connector has no modes, ignoring");
            return None;
        };

        let candidates = self
            .crtcs
            .iter()
            .filter(|crtc| crtc.owner.is_none())
            .filter(|crtc| crtc.index < 32 && connector.possible_crtcs & (1 << crtc.index) != 0)
            .map(Crtc::id)
            .collect::<Vec<_>>();

        for crtc in candidates {
            let (primary_plane, cursor_plane) = if atomic {
                let Some(primary) = self.allocate_plane(PlaneType::Primary, crtc) else {
                    debug!(connector = %connector.name, crtc, "No primary plane for crtc");
                    continue;
                };
                (Some(primary), self.allocate_plane(PlaneType::Cursor, crtc))
            } else {
                (None, None)
            };

            let id = OutputId(self.next_output_id);
            self.next_output_id += 1;

            self.bind_connector(connector_id, id);
            self.bind_crtc(crtc, id);
            for plane in primary_plane.into_iter().chain(cursor_plane) {
                self.bind_plane(plane, id);
            }

            let output = OutputPipeline {
                id,
                uuid: output_uuid(&connector),
                name: connector.name.clone(),
                connector: connector_id,
                crtc,
                primary_plane,
                cursor_plane,
                mode,
                state: PipelineState::Bound { enabled: false },
                dpms: DpmsMode::On,
                physical_size: connector.physical_size,
            };
            info!(
                gpu = %self.id,
                output = %output.name,
                crtc,
                ?primary_plane,
                ?cursor_plane,
                "{}x{}@{}mHz",
                mode.width,
                mode.height,
                mode.refresh
            );
            self.observers.output_added.emit(&output);
            self.outputs.push(output);
            return Some(id);
        }

        warn!(connector = %connector.name, "No free crtc for connector");
        None
    }

    fn bind_plane(&mut self, plane: u32, output: OutputId) {
        let Some(plane) = self.planes.iter_mut().find(|p| p.id() == plane) else {
            return;
        };
        assert!(
            plane.owner.is_none(),
            "plane {} is already bound to output {:?}",
            plane.id(),
            plane.owner
        );
        plane.owner = Some(output);
    }

    fn bind_crtc(&mut self, crtc: u32, output: OutputId) {
        let Some(crtc) = self.crtcs.iter_mut().find(|c| c.id == crtc) else {
            return;
        };
        assert!(
            crtc.owner.is_none(),
            "crtc {} is already bound to output {:?}",
            crtc.id,
            crtc.owner
        );
        crtc.owner = Some(output);
    }

    fn bind_connector(&mut self, connector: u32, output: OutputId) {
        let Some(connector) = self.connectors.iter_mut().find(|c| c.id() == connector) else {
            return;
        };
        assert!(
            connector.owner.is_none(),
            "connector {} is already bound to output {:?}",
            connector.id(),
            connector.owner
        );
        connector.owner = Some(output);
    }

    fn release(&mut self, output: OutputId) {
        let owned = Some(output);
        for plane in self.planes.iter_mut().filter(|p| p.owner == owned) {
            plane.owner = None;
        }
        for crtc in self.crtcs.iter_mut().filter(|c| c.owner == owned) {
            crtc.owner = None;
        }
        for connector in self.connectors.iter_mut().filter(|c| c.owner == owned) {
            connector.owner = None;
        }
    }

    /// Removes an output, returning its hardware to the free pool.
    pub fn remove_output(&mut self, id: OutputId) -> Option<OutputPipeline> {
        let position = self.outputs.iter().position(|output| output.id == id)?;
        let mut output = self.outputs.remove(position);
        if output.is_enabled() {
            let request = output.modeset_request(false, false);
            if let Err(err) = self.device.commit(self.modeset_path(), &request) {
                debug!(output = %output.name, "Failed to switch off removed output: {err}");
            }
        }
        self.release(id);
        output.state = PipelineState::Removed;
        info!(gpu = %self.id, output = %output.name, "Output removed");
        self.observers.output_removed.emit(&output);
        Some(output)
    }

    /// Enables an output by committing its mode.
    ///
    /// A failing atomic commit is retried once through the legacy path without changing the
    /// cached decision for the device. If neither path succeeds the output ends up disabled.
    pub fn enable_output(&mut self, id: OutputId) -> Result<(), ModesetError> {
        let output = self.output(id).ok_or(ModesetError::UnknownOutput(id.0))?;
        let request = output.modeset_request(true, false);
        let was_enabled = output.is_enabled();

        if let Err(err) = self.commit_with_fallback(&request) {
            error!(gpu = %self.id, output = %id, "Failed to enable output: {err}");
            if was_enabled {
                self.mark_disabled(id);
            }
            return Err(err);
        }

        if !was_enabled {
            if let Some(output) = self.output_mut(id) {
                output.set_enabled(true);
                output.dpms = DpmsMode::On;
            }
            if let Some(output) = self.output(id) {
                info!(gpu = %self.id, output = %output.name, "Output enabled");
                let output = output.clone();
                self.observers.output_enabled.emit(&output);
            }
        }
        Ok(())
    }

    /// Switches an output off while keeping its hardware bound to it.
    pub fn disable_output(&mut self, id: OutputId) -> Result<(), ModesetError> {
        let output = self.output(id).ok_or(ModesetError::UnknownOutput(id.0))?;
        if !output.is_enabled() {
            return Ok(());
        }
        let request = output.modeset_request(false, false);
        if let Err(err) = self.commit_with_fallback(&request) {
            warn!(gpu = %self.id, output = %id, "Failed to switch off output: {err}");
        }
        self.mark_disabled(id);
        Ok(())
    }

    fn mark_disabled(&mut self, id: OutputId) {
        let Some(output) = self.output_mut(id) else {
            return;
        };
        if !output.is_enabled() {
            return;
        }
        output.set_enabled(false);
        let output = output.clone();
        info!(gpu = %self.id, output = %output.name, "Output disabled");
        self.observers.output_disabled.emit(&output);
    }

    fn commit_with_fallback(
        &mut self,
        request: &crate::device::ModesetRequest,
    ) -> Result<(), ModesetError> {
        let path = self.modeset_path();
        match self.device.commit(path, request) {
            Ok(()) => Ok(()),
            Err(err) if path == ModesetPath::Atomic => {
                warn!(gpu = %self.id, crtc = request.crtc, "Atomic commit failed, retrying with legacy: {err}");
                self.device.commit(ModesetPath::Legacy, request)
            }
            Err(err) => Err(err),
        }
    }

    /// Test-commits every enabled output, disabling the ones the device no longer accepts.
    ///
    /// Returns the outputs that were disabled.
    pub fn check_outputs_are_on(&mut self) -> Vec<OutputId> {
        let path = self.modeset_path();
        let enabled = self.enabled_outputs();
        let mut disabled = Vec::new();
        for id in enabled {
            let Some(output) = self.output(id) else {
                continue;
            };
            let request = output.modeset_request(true, true);
            if let Err(err) = self.device.commit(path, &request) {
                warn!(gpu = %self.id, output = %id, "Output no longer accepted by device: {err}");
                self.mark_disabled(id);
                disabled.push(id);
            }
        }
        disabled
    }

    /// Re-applies the configuration of every enabled output, e.g. after the session was resumed.
    ///
    /// Returns the outputs that could not be restored and were disabled.
    pub fn restore_outputs(&mut self) -> Vec<OutputId> {
        let mut disabled = Vec::new();
        for id in self.enabled_outputs() {
            let Some(output) = self.output(id) else {
                continue;
            };
            let request = output.modeset_request(true, false);
            let dpms = output.dpms;
            match self.commit_with_fallback(&request) {
                Ok(()) if dpms == DpmsMode::Off => {
                    if let Err(err) = self.set_dpms(id, DpmsMode::Off) {
                        warn!(gpu = %self.id, output = %id, "Failed to keep display powered off: {err}");
                    }
                }
                Ok(()) => {}
                Err(err) => {
                    error!(gpu = %self.id, output = %id, "Failed to restore output: {err}");
                    self.mark_disabled(id);
                    disabled.push(id);
                }
            }
        }
        disabled
    }

    /// Powers the display of an enabled output on or off.
    pub fn set_dpms(&mut self, id: OutputId, mode: DpmsMode) -> Result<(), ModesetError> {
        let path = self.modeset_path();
        let output = self.output(id).ok_or(ModesetError::UnknownOutput(id.0))?;
        if !output.is_enabled() {
            return Ok(());
        }
        let request = output.modeset_request(true, false);
        self.device
            .set_power(path, &request, mode == DpmsMode::On)?;
        if let Some(output) = self.output_mut(id) {
            debug!(output = %output.name, ?mode, "Changed power state");
            output.dpms = mode;
        }
        Ok(())
    }

    /// Removes every output, returning them in removal order.
    pub fn teardown(&mut self) -> Vec<OutputPipeline> {
        let ids = self.outputs.iter().map(|o| o.id).collect::<Vec<_>>();
        ids.into_iter()
            .filter_map(|id| self.remove_output(id))
            .collect()
    }

    /// Creates the presenter for an enabled output.
    pub fn create_presenter(&mut self, id: OutputId) -> Result<Box<dyn Presenter>, DeviceError> {
        let path = self.modeset_path();
        let target = self
            .output(id)
            .ok_or(DeviceError::Unsupported("presenting to an unknown output"))?
            .scanout_target(path);
        self.device.create_presenter(&target)
    }

    /// Reads completion events and resolves them to the outputs they belong to.
    pub fn dispatch_events(&mut self) -> Vec<(OutputId, PageFlip)> {
        let events = match self.device.receive_events() {
            Ok(events) => events,
            Err(err) => {
                warn!(gpu = %self.id, "Failed to read device events: {err}");
                return Vec::new();
            }
        };
        events
            .into_iter()
            .filter_map(|event| {
                let output = self.outputs.iter().find(|o| o.crtc == event.crtc);
                if output.is_none() {
                    trace!(gpu = %self.id, crtc = event.crtc, "Dropping event for unbound crtc");
                }
                output.map(|o| (o.id, event))
            })
            .collect()
    }

    /// Blocks until the device finished all submitted work.
    pub fn wait_idle(&mut self) {
        self.device.wait_idle();
    }

    pub fn event_fd(&self) -> Option<std::os::fd::OwnedFd> {
        self.device.event_fd()
    }

    /// Pipeline state of the output driving `connector`, or `Unbound`.
    pub fn connector_state(&self, connector: u32) -> PipelineState {
        self.outputs
            .iter()
            .find(|output| output.connector == connector)
            .map(|output| output.state)
            .unwrap_or(PipelineState::Unbound)
    }

    pub fn id(&self) -> GpuId {
        self.id
    }

    pub fn dev_node(&self) -> &Path {
        &self.dev_node
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    pub fn add_fb2_modifiers_supported(&self) -> bool {
        self.capabilities
            .contains(DeviceCapabilities::ADDFB2_MODIFIERS)
    }

    /// Whether completion timestamps use the monotonic clock rather than the realtime clock.
    pub fn presentation_clock_is_monotonic(&self) -> bool {
        self.capabilities
            .contains(DeviceCapabilities::MONOTONIC_TIMESTAMPS)
    }

    pub fn egl_display(&self) -> Option<&EglDisplay> {
        self.egl_display.as_ref()
    }

    pub fn outputs(&self) -> &[OutputPipeline] {
        &self.outputs
    }

    pub fn output(&self, id: OutputId) -> Option<&OutputPipeline> {
        self.outputs.iter().find(|output| output.id == id)
    }

    fn output_mut(&mut self, id: OutputId) -> Option<&mut OutputPipeline> {
        self.outputs.iter_mut().find(|output| output.id == id)
    }

    pub fn enabled_outputs(&self) -> Vec<OutputId> {
        self.outputs
            .iter()
            .filter(|output| output.is_enabled())
            .map(|output| output.id)
            .collect()
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn crtcs(&self) -> &[Crtc] {
        &self.crtcs
    }

    pub fn connectors(&self) -> &[Connector] {
        &self.connectors
    }

    fn crtc(&self, id: u32) -> Option<&Crtc> {
        self.crtcs.iter().find(|crtc| crtc.id == id)
    }

    fn connector(&self, id: u32) -> Option<&Connector> {
        self.connectors.iter().find(|connector| connector.id() == id)
    }

    pub fn on_output_added(&mut self, callback: impl FnMut(&OutputPipeline) + 'static) -> CallbackRef {
        self.observers.output_added.register(callback)
    }

    pub fn on_output_removed(&mut self, callback: impl FnMut(&OutputPipeline) + 'static) -> CallbackRef {
        self.observers.output_removed.register(callback)
    }

    pub fn on_output_enabled(&mut self, callback: impl FnMut(&OutputPipeline) + 'static) -> CallbackRef {
        self.observers.output_enabled.register(callback)
    }

    pub fn on_output_disabled(&mut self, callback: impl FnMut(&OutputPipeline) + 'static) -> CallbackRef {
        self.observers.output_disabled.register(callback)
    }
}
