//! Rendering state of one GPU: its texture backend and one renderer per enabled output.

use tracing::{debug, trace, warn};

use crate::{
    error::PresentError,
    output::{GpuId, OutputId},
    presenter::{OutputRenderer, PixelTarget, PresentCapabilities, Submission},
    region::{Rect, Region},
    surface::{Buffer, SurfaceItem},
    texture::TextureBackend,
};

/// The outputs of one GPU, addressed by a screen index local to the GPU.
#[derive(Debug)]
pub struct GpuRenderBackend {
    gpu: GpuId,
    texture_backend: TextureBackend,
    outputs: Vec<(OutputId, OutputRenderer)>,
}

impl GpuRenderBackend {
    pub fn new(gpu: GpuId, texture_backend: TextureBackend) -> Self {
        Self {
            gpu,
            texture_backend,
            outputs: Vec::new(),
        }
    }

    pub fn gpu(&self) -> GpuId {
        self.gpu
    }

    pub fn texture_backend(&self) -> &TextureBackend {
        &self.texture_backend
    }

    pub fn screen_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn output_ids(&self) -> impl Iterator<Item = OutputId> + '_ {
        self.outputs.iter().map(|(id, _)| *id)
    }

    pub fn screen_of(&self, output: OutputId) -> Option<usize> {
        self.outputs.iter().position(|(id, _)| *id == output)
    }

    /// Adds the renderer of an output at the end of the screen list.
    pub fn add_output(&mut self, output: OutputId, renderer: OutputRenderer) {
        if self.screen_of(output).is_some() {
            debug!(gpu = %self.gpu, %output, "Output already has a renderer");
            return;
        }
        self.outputs.push((output, renderer));
    }

    pub fn remove_output(&mut self, output: OutputId) -> Option<OutputRenderer> {
        let index = self.screen_of(output)?;
        Some(self.outputs.remove(index).1)
    }

    /// Orders the screens like `order`. Outputs missing from `order` keep their relative order at
    /// the end.
    pub fn sort_outputs(&mut self, order: &[OutputId]) {
        self.outputs.sort_by_key(|(id, _)| {
            order
                .iter()
                .position(|candidate| candidate == id)
                .unwrap_or(usize::MAX)
        });
    }

    /// Capabilities shared by all outputs of this GPU.
    pub fn capabilities(&self) -> PresentCapabilities {
        self.outputs
            .iter()
            .fold(PresentCapabilities::all(), |caps, (_, renderer)| {
                caps & renderer.capabilities()
            })
    }

    pub fn renderer(&self, screen: usize) -> Option<&OutputRenderer> {
        self.outputs.get(screen).map(|(_, renderer)| renderer)
    }

    pub fn renderer_mut(&mut self, screen: usize) -> Option<&mut OutputRenderer> {
        self.outputs.get_mut(screen).map(|(_, renderer)| renderer)
    }

    pub fn output(&self, screen: usize) -> Option<OutputId> {
        self.outputs.get(screen).map(|(id, _)| *id)
    }

    pub fn screen_geometry(&self, screen: usize) -> Option<Rect> {
        self.renderer(screen).map(OutputRenderer::geometry)
    }

    pub fn begin_frame(&mut self, screen: usize) -> Option<Region> {
        self.renderer_mut(screen).map(OutputRenderer::begin_frame)
    }

    pub fn end_frame(
        &mut self,
        screen: usize,
        rendered: &Region,
        damaged: &Region,
    ) -> Option<Result<Submission, PresentError>> {
        self.renderer_mut(screen)
            .map(|renderer| renderer.end_frame(rendered, damaged))
    }

    pub fn back_buffer(&mut self, screen: usize) -> Option<PixelTarget<'_>> {
        self.renderer_mut(screen)?.presenter_mut().back_buffer()
    }

    /// Whether `screen` may show client buffers without composition.
    pub fn direct_scanout_allowed(&self, screen: usize) -> bool {
        self.renderer(screen).is_some_and(|renderer| {
            renderer
                .capabilities()
                .contains(PresentCapabilities::DIRECT_SCANOUT)
        })
    }

    /// Tries to present the buffer of `item` directly on `screen`.
    ///
    /// This only succeeds if the buffer is opaque and matches the output in size and format.
    pub fn scanout(&mut self, screen: usize, item: &SurfaceItem) -> bool {
        if !self.direct_scanout_allowed(screen) {
            return false;
        }
        let Some(texture) = item.texture() else {
            return false;
        };
        if texture.has_alpha_channel() || texture.is_discarded() {
            return false;
        }
        let Some(Buffer::Dmabuf(buffer)) = item.buffer() else {
            return false;
        };
        let Some(renderer) = self.renderer_mut(screen) else {
            return false;
        };
        if buffer.size != renderer.geometry().size || buffer.format != renderer.format() {
            trace!(gpu = %self.gpu, screen, size = ?buffer.size, format = ?buffer.format, "buffer does not fit the output");
            return false;
        }
        match renderer.presenter_mut().present_direct(buffer) {
            Ok(true) => {
                renderer.scanned_out();
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!(gpu = %self.gpu, screen, "Direct scanout failed: {err}");
                false
            }
        }
    }

    /// Forgets the buffer contents of every output.
    pub fn reset(&mut self) {
        for (_, renderer) in self.outputs.iter_mut() {
            renderer.reset();
        }
    }
}
