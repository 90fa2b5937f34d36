// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The VA display: a driver connection shared by decode and presentation threads.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::backend::vaapi::image::SubpictureFlags;
use crate::backend::vaapi::BufferInfo;
use crate::backend::vaapi::BufferType;
use crate::backend::vaapi::ConfigAttrib;
use crate::backend::vaapi::Entrypoint;
use crate::backend::vaapi::ImageFormat;
use crate::backend::vaapi::Profile;
use crate::backend::vaapi::SurfaceStatus;
use crate::backend::vaapi::VABufferID;
use crate::backend::vaapi::VAConfigID;
use crate::backend::vaapi::VAContextID;
use crate::backend::vaapi::VAImage;
use crate::backend::vaapi::VAImageID;
use crate::backend::vaapi::VASubpictureID;
use crate::backend::vaapi::VASurfaceID;
use crate::backend::vaapi::VaError;
use crate::backend::vaapi::VaStatus;
use crate::Rect;

/// The subset of the VA driver API used by this crate.
///
/// Every method maps to exactly one `va*` entry point. Implementations are never called
/// concurrently: [`Display`] serializes all calls behind its lock.
pub trait VaDriver: Send {
    fn create_buffer(
        &mut self,
        context: VAContextID,
        buffer_type: BufferType,
        size: usize,
        num_elements: u32,
        data: Option<&[u8]>,
    ) -> Result<VABufferID, VaStatus>;
    fn map_buffer(&mut self, buffer: VABufferID) -> Result<(), VaStatus>;
    /// Contents of a mapped buffer. Only valid between `map_buffer` and `unmap_buffer`.
    fn mapped_data(&mut self, buffer: VABufferID) -> Result<&mut [u8], VaStatus>;
    fn unmap_buffer(&mut self, buffer: VABufferID) -> Result<(), VaStatus>;
    fn destroy_buffer(&mut self, buffer: VABufferID) -> Result<(), VaStatus>;

    fn acquire_buffer_handle(
        &mut self,
        buffer: VABufferID,
        mem_type: u32,
    ) -> Result<BufferInfo, VaStatus>;
    fn release_buffer_handle(&mut self, buffer: VABufferID) -> Result<(), VaStatus>;

    fn create_surfaces(
        &mut self,
        rt_format: u32,
        width: u32,
        height: u32,
        num_surfaces: usize,
    ) -> Result<Vec<VASurfaceID>, VaStatus>;
    fn destroy_surfaces(&mut self, surfaces: &[VASurfaceID]) -> Result<(), VaStatus>;
    fn sync_surface(&mut self, surface: VASurfaceID) -> Result<(), VaStatus>;
    fn query_surface_status(&mut self, surface: VASurfaceID) -> Result<SurfaceStatus, VaStatus>;

    fn get_config_attributes(
        &mut self,
        profile: Profile,
        entrypoint: Entrypoint,
        attribs: &mut [ConfigAttrib],
    ) -> Result<(), VaStatus>;
    fn create_config(
        &mut self,
        profile: Profile,
        entrypoint: Entrypoint,
        attribs: &[ConfigAttrib],
    ) -> Result<VAConfigID, VaStatus>;
    fn destroy_config(&mut self, config: VAConfigID) -> Result<(), VaStatus>;

    fn create_context(
        &mut self,
        config: VAConfigID,
        width: u32,
        height: u32,
        flags: u32,
        render_targets: &[VASurfaceID],
    ) -> Result<VAContextID, VaStatus>;
    fn destroy_context(&mut self, context: VAContextID) -> Result<(), VaStatus>;

    fn begin_picture(&mut self, context: VAContextID, target: VASurfaceID)
        -> Result<(), VaStatus>;
    fn render_picture(
        &mut self,
        context: VAContextID,
        buffers: &[VABufferID],
    ) -> Result<(), VaStatus>;
    fn end_picture(&mut self, context: VAContextID) -> Result<(), VaStatus>;

    fn create_image(
        &mut self,
        format: ImageFormat,
        width: u32,
        height: u32,
    ) -> Result<VAImage, VaStatus>;
    fn derive_image(&mut self, surface: VASurfaceID) -> Result<VAImage, VaStatus>;
    fn destroy_image(&mut self, image: VAImageID) -> Result<(), VaStatus>;

    fn create_subpicture(&mut self, image: VAImageID) -> Result<VASubpictureID, VaStatus>;
    fn destroy_subpicture(&mut self, subpicture: VASubpictureID) -> Result<(), VaStatus>;
    fn set_subpicture_image(
        &mut self,
        subpicture: VASubpictureID,
        image: VAImageID,
    ) -> Result<(), VaStatus>;
    fn set_subpicture_global_alpha(
        &mut self,
        subpicture: VASubpictureID,
        global_alpha: f32,
    ) -> Result<(), VaStatus>;
    fn associate_subpicture(
        &mut self,
        subpicture: VASubpictureID,
        surfaces: &[VASurfaceID],
        src_rect: &Rect,
        dst_rect: &Rect,
        flags: u32,
    ) -> Result<(), VaStatus>;
    fn deassociate_subpicture(
        &mut self,
        subpicture: VASubpictureID,
        surfaces: &[VASurfaceID],
    ) -> Result<(), VaStatus>;

    /// Profiles the driver supports. Values this crate does not know are left out.
    fn query_config_profiles(&mut self) -> Result<Vec<Profile>, VaStatus>;
    fn query_config_entrypoints(&mut self, profile: Profile) -> Result<Vec<Entrypoint>, VaStatus>;
    /// Image formats usable for subpictures, with the `VA_SUBPICTURE_*` flags the driver supports
    /// for each of them.
    fn query_subpicture_formats(&mut self) -> Result<Vec<(ImageFormat, u32)>, VaStatus>;
}

/// Driver capabilities, queried once and kept for the lifetime of the display.
#[derive(Default)]
struct Capabilities {
    decoders: Option<Vec<(Profile, Entrypoint)>>,
    subpicture_formats: Option<Vec<(ImageFormat, SubpictureFlags)>>,
}

/// A connection to the VA driver.
///
/// The driver is not reentrant and may be shared between the decoding thread and whatever thread
/// releases the last reference to a surface. All calls therefore go through a single lock which
/// is held for the duration of one driver call only, never across a sequence of calls.
///
/// Capability queries are cached behind a second lock, always taken before the driver lock.
pub struct Display {
    driver: Mutex<Box<dyn VaDriver>>,
    capabilities: Mutex<Capabilities>,
}

impl Display {
    pub fn new<D: VaDriver + 'static>(driver: D) -> Arc<Self> {
        Arc::new(Self {
            driver: Mutex::new(Box::new(driver)),
            capabilities: Default::default(),
        })
    }

    /// Opens the first DRM render node that libva can initialize.
    #[cfg(feature = "vaapi")]
    pub fn open() -> Option<Arc<Self>> {
        crate::backend::vaapi::libva_driver::LibvaDriver::open().map(Self::new)
    }

    /// Opens the DRM device at `path`.
    #[cfg(feature = "vaapi")]
    pub fn open_drm<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Arc<Self>> {
        crate::backend::vaapi::libva_driver::LibvaDriver::open_drm(path).map(Self::new)
    }

    /// Runs `f` with the driver lock held, tagging a failure with the name of the VA entry point.
    fn call<T, F>(&self, call: &'static str, f: F) -> Result<T, VaError>
    where
        F: FnOnce(&mut dyn VaDriver) -> Result<T, VaStatus>,
    {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);

        f(driver.as_mut()).map_err(|status| {
            let err = VaError { call, status };
            log::error!("{}", err);
            err
        })
    }

    pub fn create_buffer(
        &self,
        context: VAContextID,
        buffer_type: BufferType,
        size: usize,
        num_elements: u32,
        data: Option<&[u8]>,
    ) -> Result<VABufferID, VaError> {
        self.call("vaCreateBuffer", |d| {
            d.create_buffer(context, buffer_type, size, num_elements, data)
        })
    }

    pub fn map_buffer(&self, buffer: VABufferID) -> Result<(), VaError> {
        self.call("vaMapBuffer", |d| d.map_buffer(buffer))
    }

    /// Runs `f` on the contents of the mapped `buffer`.
    ///
    /// The driver lock is held while `f` runs, so `f` must not call back into the display: doing
    /// so deadlocks. Copy what is needed out of the buffer and make further calls afterwards.
    pub fn with_mapped_data<T, F>(&self, buffer: VABufferID, f: F) -> Result<T, VaError>
    where
        F: FnOnce(&mut [u8]) -> T,
    {
        self.call("vaMapBuffer", |d| d.mapped_data(buffer).map(f))
    }

    pub fn unmap_buffer(&self, buffer: VABufferID) -> Result<(), VaError> {
        self.call("vaUnmapBuffer", |d| d.unmap_buffer(buffer))
    }

    pub fn destroy_buffer(&self, buffer: VABufferID) -> Result<(), VaError> {
        self.call("vaDestroyBuffer", |d| d.destroy_buffer(buffer))
    }

    pub fn acquire_buffer_handle(
        &self,
        buffer: VABufferID,
        mem_type: u32,
    ) -> Result<BufferInfo, VaError> {
        self.call("vaAcquireBufferHandle", |d| {
            d.acquire_buffer_handle(buffer, mem_type)
        })
    }

    pub fn release_buffer_handle(&self, buffer: VABufferID) -> Result<(), VaError> {
        self.call("vaReleaseBufferHandle", |d| d.release_buffer_handle(buffer))
    }

    pub fn create_surfaces(
        &self,
        rt_format: u32,
        width: u32,
        height: u32,
        num_surfaces: usize,
    ) -> Result<Vec<VASurfaceID>, VaError> {
        self.call("vaCreateSurfaces", |d| {
            d.create_surfaces(rt_format, width, height, num_surfaces)
        })
    }

    pub fn destroy_surfaces(&self, surfaces: &[VASurfaceID]) -> Result<(), VaError> {
        self.call("vaDestroySurfaces", |d| d.destroy_surfaces(surfaces))
    }

    pub fn sync_surface(&self, surface: VASurfaceID) -> Result<(), VaError> {
        self.call("vaSyncSurface", |d| d.sync_surface(surface))
    }

    pub fn query_surface_status(&self, surface: VASurfaceID) -> Result<SurfaceStatus, VaError> {
        self.call("vaQuerySurfaceStatus", |d| d.query_surface_status(surface))
    }

    pub fn get_config_attributes(
        &self,
        profile: Profile,
        entrypoint: Entrypoint,
        attribs: &mut [ConfigAttrib],
    ) -> Result<(), VaError> {
        self.call("vaGetConfigAttributes", |d| {
            d.get_config_attributes(profile, entrypoint, attribs)
        })
    }

    pub fn create_config(
        &self,
        profile: Profile,
        entrypoint: Entrypoint,
        attribs: &[ConfigAttrib],
    ) -> Result<VAConfigID, VaError> {
        self.call("vaCreateConfig", |d| {
            d.create_config(profile, entrypoint, attribs)
        })
    }

    pub fn destroy_config(&self, config: VAConfigID) -> Result<(), VaError> {
        self.call("vaDestroyConfig", |d| d.destroy_config(config))
    }

    pub fn create_context(
        &self,
        config: VAConfigID,
        width: u32,
        height: u32,
        flags: u32,
        render_targets: &[VASurfaceID],
    ) -> Result<VAContextID, VaError> {
        self.call("vaCreateContext", |d| {
            d.create_context(config, width, height, flags, render_targets)
        })
    }

    pub fn destroy_context(&self, context: VAContextID) -> Result<(), VaError> {
        self.call("vaDestroyContext", |d| d.destroy_context(context))
    }

    pub fn begin_picture(&self, context: VAContextID, target: VASurfaceID) -> Result<(), VaError> {
        self.call("vaBeginPicture", |d| d.begin_picture(context, target))
    }

    pub fn render_picture(
        &self,
        context: VAContextID,
        buffers: &[VABufferID],
    ) -> Result<(), VaError> {
        self.call("vaRenderPicture", |d| d.render_picture(context, buffers))
    }

    pub fn end_picture(&self, context: VAContextID) -> Result<(), VaError> {
        self.call("vaEndPicture", |d| d.end_picture(context))
    }

    pub fn create_image(
        &self,
        format: ImageFormat,
        width: u32,
        height: u32,
    ) -> Result<VAImage, VaError> {
        self.call("vaCreateImage", |d| d.create_image(format, width, height))
    }

    pub fn derive_image(&self, surface: VASurfaceID) -> Result<VAImage, VaError> {
        self.call("vaDeriveImage", |d| d.derive_image(surface))
    }

    pub fn destroy_image(&self, image: VAImageID) -> Result<(), VaError> {
        self.call("vaDestroyImage", |d| d.destroy_image(image))
    }

    pub fn create_subpicture(&self, image: VAImageID) -> Result<VASubpictureID, VaError> {
        self.call("vaCreateSubpicture", |d| d.create_subpicture(image))
    }

    pub fn destroy_subpicture(&self, subpicture: VASubpictureID) -> Result<(), VaError> {
        self.call("vaDestroySubpicture", |d| d.destroy_subpicture(subpicture))
    }

    pub fn set_subpicture_image(
        &self,
        subpicture: VASubpictureID,
        image: VAImageID,
    ) -> Result<(), VaError> {
        self.call("vaSetSubpictureImage", |d| {
            d.set_subpicture_image(subpicture, image)
        })
    }

    pub fn set_subpicture_global_alpha(
        &self,
        subpicture: VASubpictureID,
        global_alpha: f32,
    ) -> Result<(), VaError> {
        self.call("vaSetSubpictureGlobalAlpha", |d| {
            d.set_subpicture_global_alpha(subpicture, global_alpha)
        })
    }

    pub fn associate_subpicture(
        &self,
        subpicture: VASubpictureID,
        surfaces: &[VASurfaceID],
        src_rect: &Rect,
        dst_rect: &Rect,
        flags: u32,
    ) -> Result<(), VaError> {
        self.call("vaAssociateSubpicture", |d| {
            d.associate_subpicture(subpicture, surfaces, src_rect, dst_rect, flags)
        })
    }

    pub fn deassociate_subpicture(
        &self,
        subpicture: VASubpictureID,
        surfaces: &[VASurfaceID],
    ) -> Result<(), VaError> {
        self.call("vaDeassociateSubpicture", |d| {
            d.deassociate_subpicture(subpicture, surfaces)
        })
    }

    /// Every (profile, entrypoint) pair the driver can decode with.
    ///
    /// Queried from the driver on first use and cached afterwards. A profile whose entrypoints
    /// cannot be queried is skipped.
    pub fn decode_profiles(&self) -> Result<Vec<(Profile, Entrypoint)>, VaError> {
        let mut caps = self
            .capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(decoders) = &caps.decoders {
            return Ok(decoders.clone());
        }

        let profiles = self.call("vaQueryConfigProfiles", |d| d.query_config_profiles())?;
        let mut decoders = Vec::new();
        for profile in profiles {
            let entrypoints = match self.call("vaQueryConfigEntrypoints", |d| {
                d.query_config_entrypoints(profile)
            }) {
                Ok(entrypoints) => entrypoints,
                Err(e) => {
                    log::debug!("skipping {:?}: {}", profile, e);
                    continue;
                }
            };

            decoders.extend(
                entrypoints
                    .into_iter()
                    .filter(|e| *e == Entrypoint::Vld)
                    .map(|e| (profile, e)),
            );
        }

        log::debug!("decoders: {:?}", decoders);
        caps.decoders = Some(decoders.clone());
        Ok(decoders)
    }

    /// Whether the driver can decode `profile` through `entrypoint`.
    pub fn has_decoder(&self, profile: Profile, entrypoint: Entrypoint) -> Result<bool, VaError> {
        Ok(self.decode_profiles()?.contains(&(profile, entrypoint)))
    }

    /// Image formats usable for subpictures and the flags supported with each. Cached like
    /// [`Display::decode_profiles`].
    pub fn subpicture_formats(&self) -> Result<Vec<(ImageFormat, SubpictureFlags)>, VaError> {
        let mut caps = self
            .capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(formats) = &caps.subpicture_formats {
            return Ok(formats.clone());
        }

        let formats = self
            .call("vaQuerySubpictureFormats", |d| d.query_subpicture_formats())?
            .into_iter()
            .map(|(format, flags)| (format, SubpictureFlags::from_bits_truncate(flags)))
            .collect::<Vec<_>>();

        caps.subpicture_formats = Some(formats.clone());
        Ok(formats)
    }

    /// The subpicture flags supported with `fourcc`, or `None` if subpictures cannot use that
    /// format at all.
    pub fn has_subpicture_format(&self, fourcc: u32) -> Result<Option<SubpictureFlags>, VaError> {
        Ok(self
            .subpicture_formats()?
            .into_iter()
            .find(|(format, _)| format.fourcc == fourcc)
            .map(|(_, flags)| flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDriver;
    use crate::backend::vaapi::VA_FOURCC_BGRA;
    use crate::backend::vaapi::VA_FOURCC_NV12;

    #[test]
    fn decoders_are_queried_once() {
        let (display, driver) = DummyDriver::new_display();
        driver.set_decoders(vec![
            (Profile::Mpeg2Main, Entrypoint::Vld),
            (Profile::H264Main, Entrypoint::Vld),
            (Profile::H264Main, Entrypoint::EncSlice),
        ]);

        assert!(display.has_decoder(Profile::H264Main, Entrypoint::Vld).unwrap());
        assert!(!display
            .has_decoder(Profile::H264Main, Entrypoint::EncSlice)
            .unwrap());
        assert!(!display.has_decoder(Profile::HevcMain, Entrypoint::Vld).unwrap());
        assert_eq!(
            display.decode_profiles().unwrap(),
            [
                (Profile::Mpeg2Main, Entrypoint::Vld),
                (Profile::H264Main, Entrypoint::Vld)
            ]
        );

        assert_eq!(driver.count_calls("vaQueryConfigProfiles"), 1);
        assert_eq!(driver.count_calls("vaQueryConfigEntrypoints"), 2);
    }

    #[test]
    fn failed_profile_query_is_not_cached() {
        let (display, driver) = DummyDriver::new_display();
        driver.fail_call("vaQueryConfigProfiles", 0);

        assert!(display.has_decoder(Profile::Mpeg2Main, Entrypoint::Vld).is_err());
        assert!(display.has_decoder(Profile::Mpeg2Main, Entrypoint::Vld).unwrap());
        assert_eq!(driver.count_calls("vaQueryConfigProfiles"), 2);
    }

    #[test]
    fn profile_without_entrypoints_is_skipped() {
        let (display, driver) = DummyDriver::new_display();
        driver.set_decoders(vec![
            (Profile::Mpeg2Main, Entrypoint::Vld),
            (Profile::Vc1Main, Entrypoint::Vld),
        ]);
        driver.fail_call("vaQueryConfigEntrypoints", 0);

        assert_eq!(
            display.decode_profiles().unwrap(),
            [(Profile::Vc1Main, Entrypoint::Vld)]
        );
    }

    #[test]
    fn subpicture_format_flags() {
        let (display, driver) = DummyDriver::new_display();
        driver.set_subpicture_formats(vec![(
            ImageFormat {
                fourcc: VA_FOURCC_BGRA,
                bits_per_pixel: 32,
            },
            SubpictureFlags::GLOBAL_ALPHA.bits(),
        )]);

        assert_eq!(
            display.has_subpicture_format(VA_FOURCC_BGRA).unwrap(),
            Some(SubpictureFlags::GLOBAL_ALPHA)
        );
        assert_eq!(display.has_subpicture_format(VA_FOURCC_NV12).unwrap(), None);
        assert_eq!(driver.count_calls("vaQuerySubpictureFormats"), 1);
    }
}
