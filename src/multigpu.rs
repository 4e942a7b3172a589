//! Routing of global screen indices to the GPU owning the screen.

use tracing::{debug, info};

use crate::{
    error::BackendError,
    output::{GpuId, OutputId},
    presenter::{PixelTarget, PresentCapabilities, Submission},
    region::{Rect, Region},
    render_backend::GpuRenderBackend,
    surface::SurfaceItem,
    texture::{SurfaceTexture, TextureBackend},
};

/// Presents all screens of all GPUs behind one screen index space.
///
/// Screens are numbered by walking the GPUs in the order they were added, each GPU contributing
/// as many consecutive indices as it has screens. The first GPU is the primary one and provides
/// the textures of surfaces.
#[derive(Debug, Default)]
pub struct MultiGpuBackend {
    backends: Vec<GpuRenderBackend>,
}

impl MultiGpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a GPU at the end of the routing order. Adding a known GPU does nothing.
    pub fn add_gpu(&mut self, backend: GpuRenderBackend) -> bool {
        if self.contains(backend.gpu()) {
            debug!(gpu = %backend.gpu(), "Gpu already known to the dispatcher");
            return false;
        }
        info!(gpu = %backend.gpu(), screens = backend.screen_count(), "Adding gpu");
        self.backends.push(backend);
        true
    }

    /// Removes a GPU, returning its backend. Removing an unknown GPU does nothing.
    pub fn remove_gpu(&mut self, gpu: GpuId) -> Option<GpuRenderBackend> {
        let index = self.backends.iter().position(|backend| backend.gpu() == gpu)?;
        info!(%gpu, "Removing gpu");
        Some(self.backends.remove(index))
    }

    pub fn contains(&self, gpu: GpuId) -> bool {
        self.backends.iter().any(|backend| backend.gpu() == gpu)
    }

    pub fn backend(&self, gpu: GpuId) -> Option<&GpuRenderBackend> {
        self.backends.iter().find(|backend| backend.gpu() == gpu)
    }

    pub fn backend_mut(&mut self, gpu: GpuId) -> Option<&mut GpuRenderBackend> {
        self.backends.iter_mut().find(|backend| backend.gpu() == gpu)
    }

    pub fn gpus(&self) -> impl Iterator<Item = GpuId> + '_ {
        self.backends.iter().map(GpuRenderBackend::gpu)
    }

    pub fn screen_count(&self) -> usize {
        self.backends.iter().map(GpuRenderBackend::screen_count).sum()
    }

    /// Resolves a global screen index to the owning backend and the screen index within it.
    fn find_backend(&self, screen: usize) -> Option<(usize, usize)> {
        let mut screens = 0;
        for (index, backend) in self.backends.iter().enumerate() {
            if screen < screens + backend.screen_count() {
                return Some((index, screen - screens));
            }
            screens += backend.screen_count();
        }
        None
    }

    fn resolve_mut(&mut self, screen: usize) -> Result<(&mut GpuRenderBackend, usize), BackendError> {
        let (index, local) = self
            .find_backend(screen)
            .ok_or(BackendError::UnknownScreen(screen))?;
        Ok((&mut self.backends[index], local))
    }

    /// The GPU and output showing `screen`.
    pub fn output(&self, screen: usize) -> Option<(GpuId, OutputId)> {
        let (index, local) = self.find_backend(screen)?;
        let backend = &self.backends[index];
        backend.output(local).map(|output| (backend.gpu(), output))
    }

    /// The global index of the screen showing `output` of `gpu`.
    pub fn screen_of(&self, gpu: GpuId, output: OutputId) -> Option<usize> {
        let mut screens = 0;
        for backend in self.backends.iter() {
            if backend.gpu() == gpu {
                return backend.screen_of(output).map(|local| screens + local);
            }
            screens += backend.screen_count();
        }
        None
    }

    /// All screens in index order.
    pub fn screens(&self) -> Vec<(GpuId, OutputId)> {
        self.backends
            .iter()
            .flat_map(|backend| backend.output_ids().map(|output| (backend.gpu(), output)))
            .collect()
    }

    pub fn screen_geometry(&self, screen: usize) -> Option<Rect> {
        let (index, local) = self.find_backend(screen)?;
        self.backends[index].screen_geometry(local)
    }

    pub fn begin_frame(&mut self, screen: usize) -> Result<Region, BackendError> {
        let (backend, local) = self.resolve_mut(screen)?;
        backend
            .begin_frame(local)
            .ok_or(BackendError::UnknownScreen(screen))
    }

    pub fn end_frame(
        &mut self,
        screen: usize,
        rendered: &Region,
        damaged: &Region,
    ) -> Result<Submission, BackendError> {
        let (backend, local) = self.resolve_mut(screen)?;
        let submission = backend
            .end_frame(local, rendered, damaged)
            .ok_or(BackendError::UnknownScreen(screen))?;
        submission.map_err(BackendError::Present)
    }

    pub fn back_buffer(&mut self, screen: usize) -> Option<PixelTarget<'_>> {
        let (index, local) = self.find_backend(screen)?;
        self.backends[index].back_buffer(local)
    }

    pub fn scanout(&mut self, screen: usize, item: &SurfaceItem) -> bool {
        match self.resolve_mut(screen) {
            Ok((backend, local)) => backend.scanout(local, item),
            Err(_) => false,
        }
    }

    pub fn direct_scanout_allowed(&self, screen: usize) -> bool {
        self.find_backend(screen)
            .is_some_and(|(index, local)| self.backends[index].direct_scanout_allowed(local))
    }

    /// Capabilities every screen supports.
    pub fn capabilities(&self) -> PresentCapabilities {
        self.backends
            .iter()
            .fold(PresentCapabilities::all(), |caps, backend| caps & backend.capabilities())
    }

    /// The texture backend of the primary GPU, software rendering if there is none.
    pub fn texture_backend(&self) -> TextureBackend {
        self.backends
            .first()
            .map(|backend| backend.texture_backend().clone())
            .unwrap_or(TextureBackend::Raster)
    }

    /// Creates an (empty) texture for `item` on the primary GPU.
    pub fn create_texture(&self, item: &SurfaceItem) -> SurfaceTexture {
        SurfaceTexture::new(&self.texture_backend(), item.kind())
    }

    /// Forgets the buffer contents of every screen.
    pub fn reset(&mut self) {
        for backend in self.backends.iter_mut() {
            backend.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{
        presenter::OutputRenderer,
        surface::SurfaceKind,
        testing::{FakeImporter, FakePresenter, PresentCall},
    };

    fn backend(gpu: u64, outputs: &[u32], caps: PresentCapabilities) -> (GpuRenderBackend, Vec<FakePresenter>) {
        let mut backend = GpuRenderBackend::new(GpuId(gpu), TextureBackend::Raster);
        let mut presenters = Vec::new();
        for output in outputs {
            let presenter = FakePresenter::new(caps, (100, 100));
            backend.add_output(OutputId(*output), OutputRenderer::new(Box::new(presenter.clone()), 10));
            presenters.push(presenter);
        }
        (backend, presenters)
    }

    #[test]
    fn screens_are_numbered_in_gpu_order() {
        let mut dispatcher = MultiGpuBackend::new();
        dispatcher.add_gpu(backend(1, &[1, 2], PresentCapabilities::empty()).0);
        dispatcher.add_gpu(backend(2, &[7], PresentCapabilities::empty()).0);

        assert_eq!(dispatcher.screen_count(), 3);
        assert_eq!(dispatcher.output(0), Some((GpuId(1), OutputId(1))));
        assert_eq!(dispatcher.output(1), Some((GpuId(1), OutputId(2))));
        assert_eq!(dispatcher.output(2), Some((GpuId(2), OutputId(7))));
        assert_eq!(dispatcher.output(3), None);
        assert_eq!(dispatcher.screen_of(GpuId(2), OutputId(7)), Some(2));
        assert!(matches!(
            dispatcher.begin_frame(3),
            Err(BackendError::UnknownScreen(3))
        ));
    }

    #[test]
    fn frames_reach_the_owning_gpu() {
        let mut dispatcher = MultiGpuBackend::new();
        let (first, first_presenters) = backend(1, &[1], PresentCapabilities::empty());
        let (second, second_presenters) = backend(2, &[1], PresentCapabilities::empty());
        dispatcher.add_gpu(first);
        dispatcher.add_gpu(second);

        let repaint = dispatcher.begin_frame(1).unwrap();
        dispatcher.end_frame(1, &repaint, &repaint).unwrap();

        assert!(first_presenters[0].calls().borrow().is_empty());
        assert_eq!(*second_presenters[0].calls().borrow(), vec![PresentCall::Swap]);
    }

    #[test]
    fn add_and_remove_restores_routing() {
        let mut dispatcher = MultiGpuBackend::new();
        dispatcher.add_gpu(backend(1, &[1], PresentCapabilities::empty()).0);
        dispatcher.add_gpu(backend(2, &[1, 2], PresentCapabilities::empty()).0);
        let before = (0..4).map(|screen| dispatcher.output(screen)).collect::<Vec<_>>();

        assert!(dispatcher.add_gpu(backend(3, &[5], PresentCapabilities::empty()).0));
        assert!(!dispatcher.add_gpu(backend(3, &[5], PresentCapabilities::empty()).0));
        assert_eq!(dispatcher.screen_count(), 4);
        assert!(dispatcher.remove_gpu(GpuId(3)).is_some());
        assert!(dispatcher.remove_gpu(GpuId(3)).is_none());

        let after = (0..4).map(|screen| dispatcher.output(screen)).collect::<Vec<_>>();
        assert_eq!(before, after);
    }

    #[test]
    fn capabilities_are_the_intersection() {
        let mut dispatcher = MultiGpuBackend::new();
        dispatcher.add_gpu(
            backend(
                1,
                &[1],
                PresentCapabilities::BUFFER_AGE | PresentCapabilities::DIRECT_SCANOUT,
            )
            .0,
        );
        dispatcher.add_gpu(backend(2, &[1], PresentCapabilities::BUFFER_AGE).0);

        assert_eq!(dispatcher.capabilities(), PresentCapabilities::BUFFER_AGE);
        assert!(dispatcher.direct_scanout_allowed(0));
        assert!(!dispatcher.direct_scanout_allowed(1));
        assert!(!dispatcher.direct_scanout_allowed(2));
    }

    #[test]
    fn textures_come_from_the_primary_gpu() {
        let mut dispatcher = MultiGpuBackend::new();
        let item = SurfaceItem::new(SurfaceKind::Wayland, TextureBackend::Raster);
        assert!(matches!(
            dispatcher.create_texture(&item).platform(),
            crate::texture::PlatformTexture::Raster(_)
        ));

        let importer = Rc::new(FakeImporter::default());
        dispatcher.add_gpu(GpuRenderBackend::new(GpuId(1), TextureBackend::OpenGl(importer)));
        dispatcher.add_gpu(GpuRenderBackend::new(GpuId(2), TextureBackend::Raster));
        assert!(matches!(
            dispatcher.create_texture(&item).platform(),
            crate::texture::PlatformTexture::OpenGl(_)
        ));
    }
}
