// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VA images and the subpictures that overlay them on surfaces.

use std::sync::Arc;

use bitflags::bitflags;

use crate::backend::vaapi::buffer_proxy::BufferProxyParent;
use crate::backend::vaapi::surface::Surface;
use crate::backend::vaapi::Display;
use crate::backend::vaapi::ImageFormat;
use crate::backend::vaapi::VABufferID;
use crate::backend::vaapi::VAImage;
use crate::backend::vaapi::VAImageID;
use crate::backend::vaapi::VASubpictureID;
use crate::backend::vaapi::VASurfaceID;
use crate::backend::vaapi::VaError;
use crate::Rect;
use crate::Resolution;

/// A driver-side image. Destroyed when dropped.
pub struct Image {
    display: Arc<Display>,
    image: VAImage,
    /// Whether the image was derived from a surface, i.e. shares its memory.
    derived: bool,
}

impl Image {
    pub fn new(
        display: &Arc<Display>,
        format: ImageFormat,
        size: Resolution,
    ) -> Result<Self, VaError> {
        let image = display.create_image(format, size.width, size.height)?;

        Ok(Self {
            display: Arc::clone(display),
            image,
            derived: false,
        })
    }

    /// Creates an image sharing the memory of `surface`.
    pub fn derive(surface: &Surface) -> Result<Self, VaError> {
        let display = surface.display();
        let image = display.derive_image(surface.id())?;

        Ok(Self {
            display: Arc::clone(display),
            image,
            derived: true,
        })
    }

    pub fn id(&self) -> VAImageID {
        self.image.image_id
    }

    pub fn format(&self) -> ImageFormat {
        self.image.format
    }

    pub fn size(&self) -> Resolution {
        Resolution::from((self.image.width, self.image.height))
    }

    pub fn is_derived(&self) -> bool {
        self.derived
    }

    pub fn va_image(&self) -> &VAImage {
        &self.image
    }

    /// Maps the pixel buffer of the image, runs `f` on it with the pitch of the first plane, and
    /// unmaps it again.
    pub fn with_pixels<T, F>(&self, f: F) -> Result<T, VaError>
    where
        F: FnOnce(&mut [u8], usize) -> T,
    {
        let pitch = self.image.pitches[0] as usize;

        self.display.map_buffer(self.image.buf)?;
        let res = self
            .display
            .with_mapped_data(self.image.buf, |data| f(data, pitch));
        let unmap = self.display.unmap_buffer(self.image.buf);

        let res = res?;
        unmap?;
        Ok(res)
    }

    /// Copies `height` lines of `src`, laid out with `src_stride`, into the image.
    pub fn upload(&self, src: &[u8], src_stride: usize, height: usize) -> Result<(), VaError> {
        self.with_pixels(|dst, dst_stride| {
            let line_len = src_stride.min(dst_stride);
            for (src_line, dst_line) in src
                .chunks(src_stride)
                .zip(dst.chunks_mut(dst_stride))
                .take(height)
            {
                let len = line_len.min(src_line.len()).min(dst_line.len());
                dst_line[..len].copy_from_slice(&src_line[..len]);
            }
        })
    }
}

impl BufferProxyParent for Image {
    fn display(&self) -> &Arc<Display> {
        &self.display
    }

    fn buffer_id(&self) -> VABufferID {
        self.image.buf
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Err(e) = self.display.destroy_image(self.image.image_id) {
            log::warn!("failed to destroy image {}: {}", self.image.image_id, e);
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("image", &self.image)
            .field("derived", &self.derived)
            .finish()
    }
}

bitflags! {
    /// Subpicture rendering flags. Values match `VA_SUBPICTURE_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubpictureFlags: u32 {
        const CHROMA_KEYING = 0x0001;
        const GLOBAL_ALPHA = 0x0002;
        const DESTINATION_IS_SCREEN_COORD = 0x0004;
        const PREMULTIPLIED_ALPHA = 0x0008;
    }
}

/// A subpicture: an image that can be blended on top of surfaces.
pub struct Subpicture {
    display: Arc<Display>,
    id: VASubpictureID,
    image: Arc<Image>,
    flags: SubpictureFlags,
    global_alpha: f32,
}

impl Subpicture {
    pub fn new(image: Arc<Image>, flags: SubpictureFlags) -> Result<Self, VaError> {
        let display = Arc::clone(image.display());
        let id = display.create_subpicture(image.id())?;

        Ok(Self {
            display,
            id,
            image,
            flags,
            global_alpha: 1.0,
        })
    }

    pub fn id(&self) -> VASubpictureID {
        self.id
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    pub fn flags(&self) -> SubpictureFlags {
        self.flags
    }

    /// Binds a different image to the subpicture.
    pub fn set_image(&mut self, image: Arc<Image>) -> Result<(), VaError> {
        self.display.set_subpicture_image(self.id, image.id())?;
        self.image = image;
        Ok(())
    }

    pub fn global_alpha(&self) -> f32 {
        self.global_alpha
    }

    pub fn set_global_alpha(&mut self, global_alpha: f32) -> Result<(), VaError> {
        if !self.flags.contains(SubpictureFlags::GLOBAL_ALPHA) {
            return Ok(());
        }

        if self.global_alpha != global_alpha {
            self.display
                .set_subpicture_global_alpha(self.id, global_alpha)?;
            self.global_alpha = global_alpha;
        }
        Ok(())
    }

    /// Associates the subpicture with `surface`, blending `src_rect` of the image into
    /// `dst_rect` of the surface.
    pub fn associate(
        &self,
        surface: VASurfaceID,
        src_rect: &Rect,
        dst_rect: &Rect,
    ) -> Result<(), VaError> {
        let flags = self.flags & SubpictureFlags::DESTINATION_IS_SCREEN_COORD;
        self.display
            .associate_subpicture(self.id, &[surface], src_rect, dst_rect, flags.bits())
    }

    pub fn deassociate(&self, surface: VASurfaceID) -> Result<(), VaError> {
        self.display.deassociate_subpicture(self.id, &[surface])
    }
}

impl Drop for Subpicture {
    fn drop(&mut self) {
        if let Err(e) = self.display.destroy_subpicture(self.id) {
            log::warn!("failed to destroy subpicture {}: {}", self.id, e);
        }
    }
}
