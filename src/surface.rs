//! Client buffers and the scene items showing them.

use std::rc::Rc;

use smithay::{
    backend::allocator::Fourcc,
    utils::{Physical, Size},
};
use tracing::trace;

use crate::{
    region::{Rect, Region},
    texture::{SurfaceTexture, TextureBackend},
};

/// Where a surface comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    /// Drawn by the compositor itself
    Internal,
    /// A window of an X11 compositing session
    X11,
    /// A Wayland client surface
    Wayland,
    /// An X11 window running on Xwayland
    Xwayland,
}

impl SurfaceKind {
    /// Whether surfaces of this kind can be backed by `buffer`.
    pub fn accepts(&self, buffer: &Buffer) -> bool {
        match self {
            SurfaceKind::X11 => matches!(buffer, Buffer::Pixmap(_)),
            SurfaceKind::Wayland | SurfaceKind::Xwayland => {
                matches!(buffer, Buffer::Shm(_) | Buffer::Dmabuf(_))
            }
            SurfaceKind::Internal => true,
        }
    }
}

/// A shared-memory buffer.
#[derive(Debug, Clone)]
pub struct ShmBuffer {
    pub size: Size<i32, Physical>,
    pub stride: u32,
    pub format: Fourcc,
    pub data: Rc<[u8]>,
}

/// A GPU buffer shared through dma-buf file descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmabufBuffer {
    /// Opaque handle of the underlying buffer
    pub handle: u64,
    pub size: Size<i32, Physical>,
    pub format: Fourcc,
    pub modifier: u64,
    pub y_inverted: bool,
}

/// An X11 pixmap holding a window's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X11Pixmap {
    pub pixmap: u32,
    pub visual: u32,
    pub depth: u8,
    pub size: Size<i32, Physical>,
}

#[derive(Debug, Clone)]
pub enum Buffer {
    Shm(ShmBuffer),
    Dmabuf(DmabufBuffer),
    Pixmap(X11Pixmap),
}

impl Buffer {
    pub fn size(&self) -> Size<i32, Physical> {
        match self {
            Buffer::Shm(buffer) => buffer.size,
            Buffer::Dmabuf(buffer) => buffer.size,
            Buffer::Pixmap(pixmap) => pixmap.size,
        }
    }

    pub fn has_alpha(&self) -> bool {
        match self {
            Buffer::Shm(ShmBuffer { format, .. }) | Buffer::Dmabuf(DmabufBuffer { format, .. }) => {
                format_has_alpha(*format)
            }
            Buffer::Pixmap(pixmap) => pixmap.depth == 32,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Buffer::Shm(_) => "shm",
            Buffer::Dmabuf(_) => "dmabuf",
            Buffer::Pixmap(_) => "pixmap",
        }
    }
}

fn format_has_alpha(format: Fourcc) -> bool {
    matches!(
        format,
        Fourcc::Argb8888
            | Fourcc::Abgr8888
            | Fourcc::Rgba8888
            | Fourcc::Bgra8888
            | Fourcc::Argb2101010
            | Fourcc::Abgr2101010
    )
}

/// A surface in the scene together with the texture showing its contents.
///
/// When the surface goes away its last valid texture can be kept as the previous texture, e.g. to
/// animate the closing window. The previous texture lives until its reference count drops to zero.
#[derive(Debug)]
pub struct SurfaceItem {
    kind: SurfaceKind,
    texture_backend: TextureBackend,
    buffer: Option<Buffer>,
    texture: Option<SurfaceTexture>,
    previous_texture: Option<SurfaceTexture>,
    reference_counter: usize,
    damage: Region,
}

impl SurfaceItem {
    pub fn new(kind: SurfaceKind, texture_backend: TextureBackend) -> Self {
        Self {
            kind,
            texture_backend,
            buffer: None,
            texture: None,
            previous_texture: None,
            reference_counter: 0,
            damage: Region::new(),
        }
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.buffer
            .as_ref()
            .map(Buffer::size)
            .unwrap_or_else(|| Size::from((0, 0)))
    }

    /// Attaches a new buffer, damaging `damage` of it.
    pub fn attach(&mut self, buffer: Option<Buffer>, damage: &Region) {
        self.buffer = buffer;
        self.add_damage(damage);
    }

    /// The texture to draw: the current one if valid, otherwise the previous one if valid.
    pub fn texture(&self) -> Option<&SurfaceTexture> {
        self.texture
            .as_ref()
            .filter(|texture| texture.is_valid())
            .or_else(|| self.previous_texture.as_ref().filter(|texture| texture.is_valid()))
    }

    pub fn previous_texture(&self) -> Option<&SurfaceTexture> {
        self.previous_texture.as_ref()
    }

    /// Keeps the previous texture alive until the matching unreference.
    pub fn reference_previous_texture(&mut self) {
        if self.previous_texture.as_ref().is_some_and(SurfaceTexture::is_discarded) {
            self.reference_counter += 1;
        }
    }

    pub fn unreference_previous_texture(&mut self) {
        if !self.previous_texture.as_ref().is_some_and(SurfaceTexture::is_discarded) {
            return;
        }
        self.reference_counter = self.reference_counter.saturating_sub(1);
        if self.reference_counter == 0 {
            trace!(kind = ?self.kind, "destroying previous texture");
            self.previous_texture = None;
        }
    }

    pub fn add_damage(&mut self, region: &Region) {
        self.damage.union(region);
    }

    pub fn reset_damage(&mut self) {
        self.damage = Region::new();
    }

    pub fn damage(&self) -> &Region {
        &self.damage
    }

    /// Brings the texture up to date with the attached buffer.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn update_texture(&mut self) {
        let texture = self
            .texture
            .get_or_insert_with(|| SurfaceTexture::new(&self.texture_backend, self.kind));
        if texture.is_valid() {
            texture.update(self.buffer.as_ref(), &self.damage);
        } else if texture.create(self.buffer.as_ref()) && self.reference_counter == 0 {
            self.previous_texture = None;
        }
    }

    /// Retires the current texture, e.g. because the surface is going away.
    ///
    /// A valid texture becomes the previous texture, holding one reference that is released with
    /// [`SurfaceItem::unreference_previous_texture`]. A previous texture that is still referenced
    /// is kept and the retired texture is dropped instead.
    pub fn discard_texture(&mut self) {
        if let Some(mut texture) = self.texture.take() {
            if texture.is_valid() && self.reference_counter == 0 {
                texture.mark_as_discarded();
                self.previous_texture = Some(texture);
                self.reference_counter = 1;
            }
        }
        let size = self.size();
        self.add_damage(&Region::from_rect(Rect::from_loc_and_size((0, 0), size)));
    }
}
