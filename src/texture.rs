//! Backend specific textures holding the pixels of a surface.

use std::rc::Rc;

use smithay::utils::{Physical, Size};
use tracing::{debug, trace, warn};

use crate::{
    error::ImportError,
    region::{Rect, Region},
    surface::{Buffer, DmabufBuffer, ShmBuffer, SurfaceKind, X11Pixmap},
};

/// Handle of a texture owned by an [`ImageImporter`].
pub type TextureId = u64;

/// Turns client buffers into textures the hardware can sample from.
pub trait ImageImporter {
    fn import_dmabuf(&self, buffer: &DmabufBuffer) -> Result<TextureId, ImportError>;

    fn upload_shm(&self, buffer: &ShmBuffer) -> Result<TextureId, ImportError>;

    /// Uploads the `damage` of `buffer` into an existing texture.
    fn update_shm(&self, texture: TextureId, buffer: &ShmBuffer, damage: &Region) -> Result<(), ImportError>;

    fn import_pixmap(&self, pixmap: &X11Pixmap) -> Result<TextureId, ImportError>;

    fn release(&self, texture: TextureId);
}

/// Creates render pictures for X11 pixmaps.
pub trait PictureFactory {
    /// Picture format matching `visual`.
    fn find_format(&self, visual: u32) -> Option<u32>;

    fn create_picture(&self, pixmap: u32, format: u32) -> Result<u32, ImportError>;

    fn free_picture(&self, picture: u32);
}

/// The active texture backend, picked once when a surface item is created.
#[derive(Clone)]
pub enum TextureBackend {
    OpenGl(Rc<dyn ImageImporter>),
    Raster,
    XRender(Rc<dyn PictureFactory>),
}

impl std::fmt::Debug for TextureBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextureBackend::OpenGl(_) => write!(f, "TextureBackend::OpenGl"),
            TextureBackend::Raster => write!(f, "TextureBackend::Raster"),
            TextureBackend::XRender(_) => write!(f, "TextureBackend::XRender"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlSource {
    Shm,
    Dmabuf,
    Pixmap,
}

/// A texture sampled by the hardware renderer.
pub struct GlTexture {
    importer: Rc<dyn ImageImporter>,
    texture: Option<TextureId>,
    source: Option<GlSource>,
    y_inverted: bool,
}

impl GlTexture {
    fn new(importer: Rc<dyn ImageImporter>) -> Self {
        Self {
            importer,
            texture: None,
            source: None,
            y_inverted: false,
        }
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }

    pub fn y_inverted(&self) -> bool {
        self.y_inverted
    }

    fn create(&mut self, buffer: &Buffer) -> Result<(), ImportError> {
        let (texture, source, y_inverted) = match buffer {
            Buffer::Shm(shm) => (self.importer.upload_shm(shm)?, GlSource::Shm, false),
            Buffer::Dmabuf(dmabuf) => (
                self.importer.import_dmabuf(dmabuf)?,
                GlSource::Dmabuf,
                dmabuf.y_inverted,
            ),
            Buffer::Pixmap(pixmap) => (self.importer.import_pixmap(pixmap)?, GlSource::Pixmap, true),
        };
        self.destroy();
        self.texture = Some(texture);
        self.source = Some(source);
        self.y_inverted = y_inverted;
        Ok(())
    }

    fn update(&mut self, buffer: &Buffer, damage: &Region) -> Result<(), ImportError> {
        let source = match buffer {
            Buffer::Shm(_) => GlSource::Shm,
            Buffer::Dmabuf(_) => GlSource::Dmabuf,
            Buffer::Pixmap(_) => GlSource::Pixmap,
        };
        // the buffer type changed, start from scratch
        if self.source != Some(source) {
            trace!(from = ?self.source, to = ?source, "recreating texture");
            return self.create(buffer);
        }
        match (buffer, self.texture) {
            (Buffer::Shm(shm), Some(texture)) => self.importer.update_shm(texture, shm, damage),
            // imported images and pixmaps alias the client buffer, a new buffer needs a new import
            (Buffer::Dmabuf(_), _) | (Buffer::Pixmap(_), _) | (_, None) => self.create(buffer),
        }
    }

    fn destroy(&mut self) {
        if let Some(texture) = self.texture.take() {
            self.importer.release(texture);
        }
        self.source = None;
    }
}

impl Drop for GlTexture {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A CPU copy of a shared-memory buffer.
#[derive(Debug, Default)]
pub struct RasterTexture {
    image: Option<RasterImage>,
}

#[derive(Debug, Clone)]
pub struct RasterImage {
    pub size: Size<i32, Physical>,
    pub stride: u32,
    pub data: Vec<u8>,
}

impl RasterTexture {
    pub fn image(&self) -> Option<&RasterImage> {
        self.image.as_ref()
    }

    fn create(&mut self, buffer: &Buffer) -> Result<(), ImportError> {
        let Buffer::Shm(shm) = buffer else {
            return Err(ImportError::UnsupportedBuffer(buffer.kind_name()));
        };
        self.image = Some(RasterImage {
            size: shm.size,
            stride: shm.stride,
            data: shm.data.to_vec(),
        });
        Ok(())
    }

    fn update(&mut self, buffer: &Buffer, damage: &Region) -> Result<(), ImportError> {
        let (Buffer::Shm(shm), Some(image)) = (buffer, self.image.as_mut()) else {
            return self.create(buffer);
        };
        if image.size != shm.size || image.stride != shm.stride {
            return self.create(buffer);
        }
        let bounds = Rect::from_loc_and_size((0, 0), shm.size);
        let stride = shm.stride as usize;
        // either side may be shorter than its size and stride promise
        let len = shm.data.len().min(image.data.len());
        for rect in damage.intersected(bounds).rects() {
            let start = rect.loc.x as usize * 4;
            let end = start + rect.size.w as usize * 4;
            for y in rect.loc.y..rect.loc.y + rect.size.h {
                let row = y as usize * stride;
                if row + end > len {
                    break;
                }
                image.data[row + start..row + end].copy_from_slice(&shm.data[row + start..row + end]);
            }
        }
        Ok(())
    }
}

/// An XRender picture wrapping an X11 pixmap.
pub struct XRenderTexture {
    pictures: Rc<dyn PictureFactory>,
    picture: Option<u32>,
}

impl XRenderTexture {
    fn new(pictures: Rc<dyn PictureFactory>) -> Self {
        Self {
            pictures,
            picture: None,
        }
    }

    pub fn picture(&self) -> Option<u32> {
        self.picture
    }

    fn create(&mut self, buffer: &Buffer) -> Result<(), ImportError> {
        let Buffer::Pixmap(pixmap) = buffer else {
            return Err(ImportError::UnsupportedBuffer(buffer.kind_name()));
        };
        let format = self
            .pictures
            .find_format(pixmap.visual)
            .ok_or(ImportError::NoFormat(pixmap.visual))?;
        let picture = self.pictures.create_picture(pixmap.pixmap, format)?;
        self.destroy();
        self.picture = Some(picture);
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(picture) = self.picture.take() {
            self.pictures.free_picture(picture);
        }
    }
}

impl Drop for XRenderTexture {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// The backend specific part of a [`SurfaceTexture`].
pub enum PlatformTexture {
    OpenGl(GlTexture),
    Raster(RasterTexture),
    XRender(XRenderTexture),
}

impl std::fmt::Debug for PlatformTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformTexture::OpenGl(texture) => f
                .debug_struct("OpenGl")
                .field("texture", &texture.texture)
                .finish(),
            PlatformTexture::Raster(texture) => f
                .debug_struct("Raster")
                .field("has_image", &texture.image.is_some())
                .finish(),
            PlatformTexture::XRender(texture) => f
                .debug_struct("XRender")
                .field("picture", &texture.picture)
                .finish(),
        }
    }
}

impl PlatformTexture {
    fn new(backend: &TextureBackend) -> Self {
        match backend {
            TextureBackend::OpenGl(importer) => PlatformTexture::OpenGl(GlTexture::new(importer.clone())),
            TextureBackend::Raster => PlatformTexture::Raster(RasterTexture::default()),
            TextureBackend::XRender(pictures) => PlatformTexture::XRender(XRenderTexture::new(pictures.clone())),
        }
    }

    fn create(&mut self, buffer: &Buffer) -> Result<(), ImportError> {
        match self {
            PlatformTexture::OpenGl(texture) => texture.create(buffer),
            PlatformTexture::Raster(texture) => texture.create(buffer),
            PlatformTexture::XRender(texture) => texture.create(buffer),
        }
    }

    fn update(&mut self, buffer: &Buffer, damage: &Region) -> Result<(), ImportError> {
        match self {
            PlatformTexture::OpenGl(texture) => texture.update(buffer, damage),
            PlatformTexture::Raster(texture) => texture.update(buffer, damage),
            // a picture tracks its pixmap
            PlatformTexture::XRender(texture) => match texture.picture {
                Some(_) => Ok(()),
                None => texture.create(buffer),
            },
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            PlatformTexture::OpenGl(texture) => texture.texture.is_some(),
            PlatformTexture::Raster(texture) => texture.image.is_some(),
            PlatformTexture::XRender(texture) => texture.picture.is_some(),
        }
    }
}

/// The current pixel contents of a surface.
#[derive(Debug)]
pub struct SurfaceTexture {
    platform: PlatformTexture,
    kind: SurfaceKind,
    size: Size<i32, Physical>,
    contents_rect: Rect,
    has_alpha: bool,
    discarded: bool,
}

impl SurfaceTexture {
    pub fn new(backend: &TextureBackend, kind: SurfaceKind) -> Self {
        Self {
            platform: PlatformTexture::new(backend),
            kind,
            size: Size::from((0, 0)),
            contents_rect: Rect::from_loc_and_size((0, 0), (0, 0)),
            has_alpha: false,
            discarded: false,
        }
    }

    /// Creates the texture from `buffer`. Returns whether the texture is valid afterwards.
    pub fn create(&mut self, buffer: Option<&Buffer>) -> bool {
        let Some(buffer) = buffer else {
            trace!(kind = ?self.kind, "no buffer attached");
            return false;
        };
        if !self.kind.accepts(buffer) {
            debug!(kind = ?self.kind, buffer = buffer.kind_name(), "surface can not use buffer");
            return false;
        }
        match self.platform.create(buffer) {
            Ok(()) => {
                self.adopt(buffer);
                true
            }
            Err(err) => {
                warn!(kind = ?self.kind, "Failed to create surface texture: {err}");
                false
            }
        }
    }

    /// Refreshes the damaged parts of a valid texture from `buffer`.
    pub fn update(&mut self, buffer: Option<&Buffer>, damage: &Region) {
        let Some(buffer) = buffer else {
            return;
        };
        if !self.kind.accepts(buffer) {
            return;
        }
        match self.platform.update(buffer, damage) {
            Ok(()) => self.adopt(buffer),
            Err(err) => warn!(kind = ?self.kind, "Failed to update surface texture: {err}"),
        }
    }

    fn adopt(&mut self, buffer: &Buffer) {
        self.size = buffer.size();
        self.contents_rect = Rect::from_loc_and_size((0, 0), self.size);
        self.has_alpha = buffer.has_alpha();
    }

    pub fn is_valid(&self) -> bool {
        self.platform.is_valid()
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    /// The part of the texture holding the surface's pixels.
    pub fn contents_rect(&self) -> Rect {
        self.contents_rect
    }

    pub fn has_alpha_channel(&self) -> bool {
        self.has_alpha
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub(crate) fn mark_as_discarded(&mut self) {
        self.discarded = true;
    }

    pub fn platform(&self) -> &PlatformTexture {
        &self.platform
    }
}
