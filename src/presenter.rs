//! Frame submission to one output, and the buffer-age damage policy on top of it.

use bitflags::bitflags;
use smithay::backend::allocator::Fourcc;
use tracing::trace;

use crate::{
    damage::DamageHistory,
    error::PresentError,
    region::{Rect, Region},
    surface::DmabufBuffer,
};

bitflags! {
    /// What a presenter supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PresentCapabilities: u32 {
        /// The age of the back buffer can be queried
        const BUFFER_AGE = 1;
        /// Sub-rectangles of the back buffer can be presented on their own
        const PARTIAL_UPDATE = 1 << 1;
        /// The device reports when a frame became visible
        const COMPLETION_EVENTS = 1 << 2;
        /// Client buffers can be scanned out without composition
        const DIRECT_SCANOUT = 1 << 3;
    }
}

/// CPU-visible pixels of a back buffer.
#[derive(Debug)]
pub struct PixelTarget<'a> {
    pub data: &'a mut [u8],
    pub stride: usize,
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
}

impl PixelTarget<'_> {
    /// Fills `rect`, clipped to the target, with an opaque 32-bit color.
    pub fn fill(&mut self, rect: Rect, color: u32) {
        let x0 = rect.loc.x.clamp(0, self.width as i32) as usize;
        let y0 = rect.loc.y.clamp(0, self.height as i32) as usize;
        let x1 = (rect.loc.x + rect.size.w).clamp(0, self.width as i32) as usize;
        let y1 = (rect.loc.y + rect.size.h).clamp(0, self.height as i32) as usize;
        let pixel = color.to_ne_bytes();
        for y in y0..y1 {
            let row = &mut self.data[y * self.stride..];
            for x in x0..x1 {
                row[x * 4..x * 4 + 4].copy_from_slice(&pixel);
            }
        }
    }
}

/// Delivers rendered frames to one output.
pub trait Presenter {
    fn capabilities(&self) -> PresentCapabilities;

    /// Area of the output in its own pixels.
    fn geometry(&self) -> Rect;

    /// Format of the buffers scanned out.
    fn format(&self) -> Fourcc;

    /// Refresh rate in mHz.
    fn refresh_rate(&self) -> u32;

    /// How many frames ago the current back buffer was presented, 0 if its contents are unknown.
    fn buffer_age(&self) -> usize;

    /// The back buffer, for presenters that render on the CPU.
    fn back_buffer(&mut self) -> Option<PixelTarget<'_>> {
        None
    }

    /// Presents the whole back buffer.
    fn swap_buffers(&mut self) -> Result<(), PresentError>;

    /// Presents only `rects` of the back buffer.
    fn post_sub_buffer(&mut self, rects: &[Rect]) -> Result<(), PresentError>;

    /// Scans a client buffer out directly. Returns `false` if the buffer can not be used.
    fn present_direct(&mut self, _buffer: &DmabufBuffer) -> Result<bool, PresentError> {
        Ok(false)
    }

    /// Drops buffer contents, e.g. after the device was inactive.
    fn reset_buffers(&mut self) {}
}

/// How a frame ended up on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Full,
    Partial,
}

/// A presenter plus the damage history of its buffers.
pub struct OutputRenderer {
    presenter: Box<dyn Presenter>,
    history: DamageHistory,
    buffer_age: usize,
}

impl std::fmt::Debug for OutputRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRenderer")
            .field("capabilities", &self.presenter.capabilities())
            .field("geometry", &self.presenter.geometry())
            .field("history", &self.history)
            .field("buffer_age", &self.buffer_age)
            .finish()
    }
}

impl OutputRenderer {
    pub fn new(presenter: Box<dyn Presenter>, history_depth: usize) -> Self {
        Self {
            presenter,
            history: DamageHistory::new(history_depth),
            buffer_age: 0,
        }
    }

    pub fn capabilities(&self) -> PresentCapabilities {
        self.presenter.capabilities()
    }

    pub fn geometry(&self) -> Rect {
        self.presenter.geometry()
    }

    pub fn refresh_rate(&self) -> u32 {
        self.presenter.refresh_rate()
    }

    pub fn format(&self) -> Fourcc {
        self.presenter.format()
    }

    pub fn presenter_mut(&mut self) -> &mut dyn Presenter {
        self.presenter.as_mut()
    }

    /// The region that has to be repainted on top of the frame's own damage.
    ///
    /// With buffer age this is whatever the back buffer missed; a buffer of age 0 has undefined
    /// contents. Without partial updates the whole output is presented every frame and therefore
    /// has to be repainted.
    pub fn begin_frame(&mut self) -> Region {
        let capabilities = self.capabilities();
        let geometry = self.geometry();
        if capabilities.contains(PresentCapabilities::BUFFER_AGE) {
            if self.buffer_age == 0 {
                return Region::from_rect(geometry);
            }
            self.history.accumulate(self.buffer_age, geometry)
        } else if !capabilities.contains(PresentCapabilities::PARTIAL_UPDATE) {
            Region::from_rect(geometry)
        } else {
            Region::new()
        }
    }

    /// Presents `rendered` and records `damaged` in the history.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn end_frame(&mut self, rendered: &Region, damaged: &Region) -> Result<Submission, PresentError> {
        let submission = self.present(rendered)?;
        if self.capabilities().contains(PresentCapabilities::BUFFER_AGE) {
            self.history.push(damaged.clone());
        }
        Ok(submission)
    }

    /// Records a frame that bypassed the back buffers.
    ///
    /// The screen showed a client buffer, so every back buffer misses the whole output.
    pub fn scanned_out(&mut self) {
        if self.capabilities().contains(PresentCapabilities::BUFFER_AGE) {
            self.history.push(Region::from_rect(self.geometry()));
        }
    }

    fn present(&mut self, damage: &Region) -> Result<Submission, PresentError> {
        let capabilities = self.capabilities();
        let geometry = self.geometry();
        let buffer_age = capabilities.contains(PresentCapabilities::BUFFER_AGE);
        let full_repaint = buffer_age || damage.is_rect(geometry);

        if full_repaint || !capabilities.contains(PresentCapabilities::PARTIAL_UPDATE) {
            self.presenter.swap_buffers()?;
            if buffer_age {
                self.buffer_age = self.presenter.buffer_age();
            }
            trace!(buffer_age = self.buffer_age, "swapped buffers");
            Ok(Submission::Full)
        } else {
            let clipped = damage.intersected(geometry);
            self.presenter.post_sub_buffer(clipped.rects())?;
            trace!(rects = clipped.rects().len(), "posted sub buffer");
            Ok(Submission::Partial)
        }
    }

    /// Forgets all buffer contents.
    pub fn reset(&mut self) {
        self.history.clear();
        self.buffer_age = 0;
        self.presenter.reset_buffers();
    }
}
