// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`VaDriver`] implementation calling into libva.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr;

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
use crate::backend::vaapi::VaDriver;
use crate::backend::vaapi::VaStatus;
use crate::Rect;

/// `VA_LSB_FIRST`.
const LSB_FIRST: u32 = 1;

/// Render nodes tried by [`LibvaDriver::open`], in order.
const RENDER_NODES: std::ops::Range<u32> = 128..192;

fn va_check(status: libva::VAStatus) -> Result<(), VaStatus> {
    match status as i32 {
        0 => Ok(()),
        status => Err(VaStatus::from_raw(status)),
    }
}

struct MappedBuffer {
    data: *mut u8,
    len: usize,
}

/// A VA display opened on a DRM render node.
pub struct LibvaDriver {
    handle: libva::VADisplay,
    /// Buffers currently mapped, with the mapping returned by libva.
    mapped: HashMap<VABufferID, MappedBuffer>,
    /// Full descriptions of the formats returned by the subpicture format query.
    image_formats: Vec<libva::VAImageFormat>,
    /// Keeps the render node open for as long as the display.
    _drm_file: File,
}

// The display handle and the mappings are only used through `&mut self`, and the owning
// `Display` serializes every call behind its driver lock.
unsafe impl Send for LibvaDriver {}

impl LibvaDriver {
    /// Opens the first render node on which libva initializes.
    pub fn open() -> Option<Self> {
        RENDER_NODES
            .map(|minor| format!("/dev/dri/renderD{}", minor))
            .find_map(|path| match Self::open_drm(&path) {
                Ok(driver) => Some(driver),
                Err(e) => {
                    log::debug!("cannot use {}: {:#}", path, e);
                    None
                }
            })
    }

    /// Opens the DRM device at `path` and initializes libva on it.
    pub fn open_drm<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let drm_file = File::options().read(true).write(true).open(path.as_ref())?;

        // Safe because the file descriptor stays open for the lifetime of the display.
        let handle = unsafe { libva::vaGetDisplayDRM(drm_file.as_raw_fd()) };
        if handle.is_null() {
            anyhow::bail!("vaGetDisplayDRM returned no display");
        }

        let mut major = 0;
        let mut minor = 0;
        // Safe because `handle` was just returned by libva.
        va_check(unsafe { libva::vaInitialize(handle, &mut major, &mut minor) })
            .map_err(|status| anyhow::anyhow!("vaInitialize failed: {:?}", status))?;
        log::info!(
            "opened VA-API {}.{} on {}",
            major,
            minor,
            path.as_ref().display()
        );

        Ok(Self {
            handle,
            mapped: Default::default(),
            image_formats: Default::default(),
            _drm_file: drm_file,
        })
    }

    fn image_format(&self, format: ImageFormat) -> libva::VAImageFormat {
        if let Some(known) = self
            .image_formats
            .iter()
            .find(|f| f.fourcc == format.fourcc && f.bits_per_pixel == format.bits_per_pixel)
        {
            return *known;
        }

        // Safe because `VAImageFormat` is plain data.
        let mut va_format: libva::VAImageFormat = unsafe { std::mem::zeroed() };
        va_format.fourcc = format.fourcc;
        va_format.byte_order = LSB_FIRST;
        va_format.bits_per_pixel = format.bits_per_pixel;
        va_format.depth = format.bits_per_pixel;
        va_format
    }
}

impl Drop for LibvaDriver {
    fn drop(&mut self) {
        // Safe because nothing uses the display after this point.
        if let Err(status) = va_check(unsafe { libva::vaTerminate(self.handle) }) {
            log::error!("vaTerminate failed: {:?}", status);
        }
    }
}

fn from_va_image(image: &libva::VAImage) -> VAImage {
    VAImage {
        image_id: image.image_id,
        format: ImageFormat {
            fourcc: image.format.fourcc,
            bits_per_pixel: image.format.bits_per_pixel,
        },
        buf: image.buf,
        width: image.width as u32,
        height: image.height as u32,
        data_size: image.data_size,
        num_planes: image.num_planes,
        pitches: image.pitches,
        offsets: image.offsets,
    }
}

impl VaDriver for LibvaDriver {
    fn create_buffer(
        &mut self,
        context: VAContextID,
        buffer_type: BufferType,
        size: usize,
        num_elements: u32,
        data: Option<&[u8]>,
    ) -> Result<VABufferID, VaStatus> {
        let mut buffer = 0;
        let data = data.map_or(ptr::null_mut(), |data| data.as_ptr() as *mut _);
        // Safe because libva copies `data` before returning and `buffer` outlives the call.
        va_check(unsafe {
            libva::vaCreateBuffer(
                self.handle,
                context,
                buffer_type as _,
                size as _,
                num_elements as _,
                data,
                &mut buffer,
            )
        })?;
        Ok(buffer)
    }

    fn map_buffer(&mut self, buffer: VABufferID) -> Result<(), VaStatus> {
        let mut buffer_type = 0;
        let mut size = 0;
        let mut num_elements = 0;
        // Safe because all the out parameters outlive the call.
        va_check(unsafe {
            libva::vaBufferInfo(
                self.handle,
                buffer,
                &mut buffer_type,
                &mut size,
                &mut num_elements,
            )
        })?;

        let mut data = ptr::null_mut();
        // Safe because `data` outlives the call.
        va_check(unsafe { libva::vaMapBuffer(self.handle, buffer, &mut data) })?;
        if data.is_null() {
            return Err(VaStatus::OperationFailed);
        }

        self.mapped.insert(
            buffer,
            MappedBuffer {
                data: data as *mut u8,
                len: size as usize * num_elements as usize,
            },
        );
        Ok(())
    }

    fn mapped_data(&mut self, buffer: VABufferID) -> Result<&mut [u8], VaStatus> {
        let mapping = self
            .mapped
            .get(&buffer)
            .ok_or(VaStatus::InvalidBuffer)?;
        // Safe because libva keeps the mapping valid until `unmap_buffer`, which needs `&mut self`
        // and therefore cannot run while the returned slice is alive.
        Ok(unsafe { std::slice::from_raw_parts_mut(mapping.data, mapping.len) })
    }

    fn unmap_buffer(&mut self, buffer: VABufferID) -> Result<(), VaStatus> {
        // Safe because `buffer` is a plain ID.
        va_check(unsafe { libva::vaUnmapBuffer(self.handle, buffer) })?;
        self.mapped.remove(&buffer);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: VABufferID) -> Result<(), VaStatus> {
        self.mapped.remove(&buffer);
        // Safe because `buffer` is a plain ID.
        va_check(unsafe { libva::vaDestroyBuffer(self.handle, buffer) })
    }

    fn acquire_buffer_handle(
        &mut self,
        buffer: VABufferID,
        mem_type: u32,
    ) -> Result<BufferInfo, VaStatus> {
        // Safe because `VABufferInfo` is plain data.
        let mut info: libva::VABufferInfo = unsafe { std::mem::zeroed() };
        info.mem_type = mem_type;
        // Safe because `info` outlives the call.
        va_check(unsafe { libva::vaAcquireBufferHandle(self.handle, buffer, &mut info) })?;
        Ok(BufferInfo {
            handle: info.handle as usize,
            mem_type: info.mem_type,
            mem_size: info.mem_size as usize,
        })
    }

    fn release_buffer_handle(&mut self, buffer: VABufferID) -> Result<(), VaStatus> {
        // Safe because `buffer` is a plain ID.
        va_check(unsafe { libva::vaReleaseBufferHandle(self.handle, buffer) })
    }

    fn create_surfaces(
        &mut self,
        rt_format: u32,
        width: u32,
        height: u32,
        num_surfaces: usize,
    ) -> Result<Vec<VASurfaceID>, VaStatus> {
        let mut surfaces = vec![0; num_surfaces];
        // Safe because `surfaces` holds `num_surfaces` elements and no attributes are passed.
        va_check(unsafe {
            libva::vaCreateSurfaces(
                self.handle,
                rt_format,
                width,
                height,
                surfaces.as_mut_ptr(),
                surfaces.len() as _,
                ptr::null_mut(),
                0,
            )
        })?;
        Ok(surfaces)
    }

    fn destroy_surfaces(&mut self, surfaces: &[VASurfaceID]) -> Result<(), VaStatus> {
        // libva takes a mutable pointer but does not write through it.
        let mut surfaces = surfaces.to_vec();
        // Safe because `surfaces` outlives the call.
        va_check(unsafe {
            libva::vaDestroySurfaces(self.handle, surfaces.as_mut_ptr(), surfaces.len() as _)
        })
    }

    fn sync_surface(&mut self, surface: VASurfaceID) -> Result<(), VaStatus> {
        // Safe because `surface` is a plain ID.
        va_check(unsafe { libva::vaSyncSurface(self.handle, surface) })
    }

    fn query_surface_status(&mut self, surface: VASurfaceID) -> Result<SurfaceStatus, VaStatus> {
        let mut status: libva::VASurfaceStatus::Type = 0;
        // Safe because `status` outlives the call.
        va_check(unsafe { libva::vaQuerySurfaceStatus(self.handle, surface, &mut status) })?;
        match status {
            libva::VASurfaceStatus::VASurfaceRendering => Ok(SurfaceStatus::Rendering),
            libva::VASurfaceStatus::VASurfaceDisplaying => Ok(SurfaceStatus::Displaying),
            libva::VASurfaceStatus::VASurfaceReady => Ok(SurfaceStatus::Ready),
            libva::VASurfaceStatus::VASurfaceSkipped => Ok(SurfaceStatus::Skipped),
            _ => Err(VaStatus::Unknown),
        }
    }

    fn get_config_attributes(
        &mut self,
        profile: Profile,
        entrypoint: Entrypoint,
        attribs: &mut [ConfigAttrib],
    ) -> Result<(), VaStatus> {
        let mut va_attribs = attribs
            .iter()
            .map(|a| libva::VAConfigAttrib {
                type_: a.attrib_type as _,
                value: a.value,
            })
            .collect::<Vec<_>>();
        // Safe because `va_attribs` outlives the call.
        va_check(unsafe {
            libva::vaGetConfigAttributes(
                self.handle,
                profile as _,
                entrypoint as _,
                va_attribs.as_mut_ptr(),
                va_attribs.len() as _,
            )
        })?;

        for (attrib, va_attrib) in attribs.iter_mut().zip(&va_attribs) {
            attrib.value = va_attrib.value;
        }
        Ok(())
    }

    fn create_config(
        &mut self,
        profile: Profile,
        entrypoint: Entrypoint,
        attribs: &[ConfigAttrib],
    ) -> Result<VAConfigID, VaStatus> {
        let mut va_attribs = attribs
            .iter()
            .map(|a| libva::VAConfigAttrib {
                type_: a.attrib_type as _,
                value: a.value,
            })
            .collect::<Vec<_>>();
        let mut config = 0;
        // Safe because `va_attribs` and `config` outlive the call.
        va_check(unsafe {
            libva::vaCreateConfig(
                self.handle,
                profile as _,
                entrypoint as _,
                va_attribs.as_mut_ptr(),
                va_attribs.len() as _,
                &mut config,
            )
        })?;
        Ok(config)
    }

    fn destroy_config(&mut self, config: VAConfigID) -> Result<(), VaStatus> {
        // Safe because `config` is a plain ID.
        va_check(unsafe { libva::vaDestroyConfig(self.handle, config) })
    }

    fn create_context(
        &mut self,
        config: VAConfigID,
        width: u32,
        height: u32,
        flags: u32,
        render_targets: &[VASurfaceID],
    ) -> Result<VAContextID, VaStatus> {
        let mut render_targets = render_targets.to_vec();
        let mut context = 0;
        // Safe because `render_targets` and `context` outlive the call.
        va_check(unsafe {
            libva::vaCreateContext(
                self.handle,
                config,
                width as _,
                height as _,
                flags as _,
                render_targets.as_mut_ptr(),
                render_targets.len() as _,
                &mut context,
            )
        })?;
        Ok(context)
    }

    fn destroy_context(&mut self, context: VAContextID) -> Result<(), VaStatus> {
        // Safe because `context` is a plain ID.
        va_check(unsafe { libva::vaDestroyContext(self.handle, context) })
    }

    fn begin_picture(
        &mut self,
        context: VAContextID,
        target: VASurfaceID,
    ) -> Result<(), VaStatus> {
        // Safe because both arguments are plain IDs.
        va_check(unsafe { libva::vaBeginPicture(self.handle, context, target) })
    }

    fn render_picture(
        &mut self,
        context: VAContextID,
        buffers: &[VABufferID],
    ) -> Result<(), VaStatus> {
        let mut buffers = buffers.to_vec();
        // Safe because `buffers` outlives the call.
        va_check(unsafe {
            libva::vaRenderPicture(
                self.handle,
                context,
                buffers.as_mut_ptr(),
                buffers.len() as _,
            )
        })
    }

    fn end_picture(&mut self, context: VAContextID) -> Result<(), VaStatus> {
        // Safe because `context` is a plain ID.
        va_check(unsafe { libva::vaEndPicture(self.handle, context) })
    }

    fn create_image(
        &mut self,
        format: ImageFormat,
        width: u32,
        height: u32,
    ) -> Result<VAImage, VaStatus> {
        let mut va_format = self.image_format(format);
        // Safe because `VAImage` is plain data.
        let mut image: libva::VAImage = unsafe { std::mem::zeroed() };
        // Safe because `va_format` and `image` outlive the call.
        va_check(unsafe {
            libva::vaCreateImage(
                self.handle,
                &mut va_format,
                width as _,
                height as _,
                &mut image,
            )
        })?;
        Ok(from_va_image(&image))
    }

    fn derive_image(&mut self, surface: VASurfaceID) -> Result<VAImage, VaStatus> {
        // Safe because `VAImage` is plain data.
        let mut image: libva::VAImage = unsafe { std::mem::zeroed() };
        // Safe because `image` outlives the call.
        va_check(unsafe { libva::vaDeriveImage(self.handle, surface, &mut image) })?;
        Ok(from_va_image(&image))
    }

    fn destroy_image(&mut self, image: VAImageID) -> Result<(), VaStatus> {
        // Safe because `image` is a plain ID.
        va_check(unsafe { libva::vaDestroyImage(self.handle, image) })
    }

    fn create_subpicture(&mut self, image: VAImageID) -> Result<VASubpictureID, VaStatus> {
        let mut subpicture = 0;
        // Safe because `subpicture` outlives the call.
        va_check(unsafe { libva::vaCreateSubpicture(self.handle, image, &mut subpicture) })?;
        Ok(subpicture)
    }

    fn destroy_subpicture(&mut self, subpicture: VASubpictureID) -> Result<(), VaStatus> {
        // Safe because `subpicture` is a plain ID.
        va_check(unsafe { libva::vaDestroySubpicture(self.handle, subpicture) })
    }

    fn set_subpicture_image(
        &mut self,
        subpicture: VASubpictureID,
        image: VAImageID,
    ) -> Result<(), VaStatus> {
        // Safe because both arguments are plain IDs.
        va_check(unsafe { libva::vaSetSubpictureImage(self.handle, subpicture, image) })
    }

    fn set_subpicture_global_alpha(
        &mut self,
        subpicture: VASubpictureID,
        global_alpha: f32,
    ) -> Result<(), VaStatus> {
        // Safe because all arguments are plain values.
        va_check(unsafe {
            libva::vaSetSubpictureGlobalAlpha(self.handle, subpicture, global_alpha)
        })
    }

    fn associate_subpicture(
        &mut self,
        subpicture: VASubpictureID,
        surfaces: &[VASurfaceID],
        src_rect: &Rect,
        dst_rect: &Rect,
        flags: u32,
    ) -> Result<(), VaStatus> {
        let mut surfaces = surfaces.to_vec();
        // Safe because `surfaces` outlives the call.
        va_check(unsafe {
            libva::vaAssociateSubpicture(
                self.handle,
                subpicture,
                surfaces.as_mut_ptr(),
                surfaces.len() as _,
                src_rect.x as _,
                src_rect.y as _,
                src_rect.width as _,
                src_rect.height as _,
                dst_rect.x as _,
                dst_rect.y as _,
                dst_rect.width as _,
                dst_rect.height as _,
                flags as _,
            )
        })
    }

    fn deassociate_subpicture(
        &mut self,
        subpicture: VASubpictureID,
        surfaces: &[VASurfaceID],
    ) -> Result<(), VaStatus> {
        let mut surfaces = surfaces.to_vec();
        // Safe because `surfaces` outlives the call.
        va_check(unsafe {
            libva::vaDeassociateSubpicture(
                self.handle,
                subpicture,
                surfaces.as_mut_ptr(),
                surfaces.len() as _,
            )
        })
    }

    fn query_config_profiles(&mut self) -> Result<Vec<Profile>, VaStatus> {
        // Safe because the display is initialized.
        let max = unsafe { libva::vaMaxNumProfiles(self.handle) };
        let mut profiles: Vec<libva::VAProfile::Type> = vec![0; max.max(0) as usize];
        let mut count = 0;
        // Safe because `profiles` holds as many entries as libva may write.
        va_check(unsafe {
            libva::vaQueryConfigProfiles(self.handle, profiles.as_mut_ptr(), &mut count)
        })?;
        profiles.truncate(count.max(0) as usize);

        Ok(profiles
            .into_iter()
            .filter_map(|p| Profile::n(p as i32))
            .collect())
    }

    fn query_config_entrypoints(&mut self, profile: Profile) -> Result<Vec<Entrypoint>, VaStatus> {
        // Safe because the display is initialized.
        let max = unsafe { libva::vaMaxNumEntrypoints(self.handle) };
        let mut entrypoints: Vec<libva::VAEntrypoint::Type> = vec![0; max.max(0) as usize];
        let mut count = 0;
        // Safe because `entrypoints` holds as many entries as libva may write.
        va_check(unsafe {
            libva::vaQueryConfigEntrypoints(
                self.handle,
                profile as _,
                entrypoints.as_mut_ptr(),
                &mut count,
            )
        })?;
        entrypoints.truncate(count.max(0) as usize);

        Ok(entrypoints
            .into_iter()
            .filter_map(|e| Entrypoint::n(e as i32))
            .collect())
    }

    fn query_subpicture_formats(&mut self) -> Result<Vec<(ImageFormat, u32)>, VaStatus> {
        // Safe because the display is initialized.
        let max = unsafe { libva::vaMaxNumSubpictureFormats(self.handle) }.max(0) as usize;
        // Safe because `VAImageFormat` is plain data.
        let mut formats: Vec<libva::VAImageFormat> = vec![unsafe { std::mem::zeroed() }; max];
        let mut flags = vec![0; max];
        let mut count = 0;
        // Safe because `formats` and `flags` hold as many entries as libva may write.
        va_check(unsafe {
            libva::vaQuerySubpictureFormats(
                self.handle,
                formats.as_mut_ptr(),
                flags.as_mut_ptr(),
                &mut count,
            )
        })?;
        formats.truncate(count as usize);
        flags.truncate(count as usize);

        let res = formats
            .iter()
            .zip(flags)
            .map(|(f, flags)| {
                (
                    ImageFormat {
                        fourcc: f.fourcc,
                        bits_per_pixel: f.bits_per_pixel,
                    },
                    flags,
                )
            })
            .collect();
        self.image_formats = formats;
        Ok(res)
    }
}
