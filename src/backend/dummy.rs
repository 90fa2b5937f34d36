// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy driver whose only purpose is to let the VA objects run so we can
//! test them in isolation.
//!
//! The driver records every call it receives, hands out unique IDs, tracks which objects are
//! alive so double destructions are caught, and can be told to fail a given entry point.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::backend::vaapi::image::SubpictureFlags;
use crate::backend::vaapi::BufferInfo;
use crate::backend::vaapi::BufferType;
use crate::backend::vaapi::ConfigAttrib;
use crate::backend::vaapi::ConfigAttribType;
use crate::backend::vaapi::Display;
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
use crate::backend::vaapi::VA_FOURCC_BGRA;
use crate::backend::vaapi::VA_RT_FORMAT_YUV420;
use crate::Rect;

/// One recorded driver call: the VA entry point and the IDs involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub name: &'static str,
    pub ids: Vec<u32>,
}

#[derive(Default)]
struct Log {
    calls: Vec<Call>,
    /// Pending failures: entry point name and number of successful calls left before failing.
    failures: Vec<(&'static str, usize)>,
    next_id: u32,
    buffers: BTreeMap<VABufferID, BufferType>,
    /// Context each buffer was created for.
    buffer_contexts: BTreeMap<VABufferID, VAContextID>,
    acquired_handles: BTreeSet<VABufferID>,
    surfaces: BTreeSet<VASurfaceID>,
    configs: BTreeSet<VAConfigID>,
    contexts: BTreeSet<VAContextID>,
    images: BTreeSet<VAImageID>,
    subpictures: BTreeSet<VASubpictureID>,
    /// Surfaces each subpicture is currently associated with.
    associations: BTreeMap<VASubpictureID, BTreeSet<VASurfaceID>>,
    /// Buffers handed to `vaRenderPicture`, with their contents at that time.
    rendered: Vec<(VABufferID, BufferType, Vec<u8>)>,
    rt_formats: Option<u32>,
    exported_mem_type: Option<u32>,
    decoders: Option<Vec<(Profile, Entrypoint)>>,
    subpicture_formats: Option<Vec<(ImageFormat, u32)>>,
    double_destroys: usize,
}

/// By default every known profile can be decoded through `Vld`.
fn default_decoders() -> Vec<(Profile, Entrypoint)> {
    (0..=Profile::Vp9Profile3 as i32)
        .filter_map(Profile::n)
        .map(|p| (p, Entrypoint::Vld))
        .collect()
}

fn default_subpicture_formats() -> Vec<(ImageFormat, u32)> {
    vec![(
        ImageFormat {
            fourcc: VA_FOURCC_BGRA,
            bits_per_pixel: 32,
        },
        (SubpictureFlags::GLOBAL_ALPHA | SubpictureFlags::PREMULTIPLIED_ALPHA).bits(),
    )]
}

impl Log {
    fn decoders(&self) -> Vec<(Profile, Entrypoint)> {
        self.decoders.clone().unwrap_or_else(default_decoders)
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, name: &'static str, ids: Vec<u32>) -> Result<(), VaStatus> {
        self.calls.push(Call { name, ids });

        if let Some(pos) = self.failures.iter().position(|(n, _)| *n == name) {
            if self.failures[pos].1 == 0 {
                self.failures.remove(pos);
                return Err(VaStatus::OperationFailed);
            }
            self.failures[pos].1 -= 1;
        }

        Ok(())
    }
}

/// Test-side view of a [`DummyDriver`].
#[derive(Clone)]
pub(crate) struct DummyHandle(Arc<Mutex<Log>>);

impl DummyHandle {
    fn log(&self) -> std::sync::MutexGuard<'_, Log> {
        self.0.lock().unwrap()
    }

    /// Makes the call to `name` fail after `skip` more successful calls.
    pub fn fail_call(&self, name: &'static str, skip: usize) {
        self.log().failures.push((name, skip));
    }

    /// Only advertise `rt_formats` in the RTFormat config attribute.
    pub fn set_rt_formats(&self, rt_formats: u32) {
        self.log().rt_formats = Some(rt_formats);
    }

    /// Report `mem_type` from `vaAcquireBufferHandle` regardless of the requested one.
    pub fn set_exported_mem_type(&self, mem_type: u32) {
        self.log().exported_mem_type = Some(mem_type);
    }

    /// Only advertise the (profile, entrypoint) pairs of `decoders`.
    pub fn set_decoders(&self, decoders: Vec<(Profile, Entrypoint)>) {
        self.log().decoders = Some(decoders);
    }

    /// Only advertise `formats` as subpicture formats, with their raw `VA_SUBPICTURE_*` flags.
    pub fn set_subpicture_formats(&self, formats: Vec<(ImageFormat, u32)>) {
        self.log().subpicture_formats = Some(formats);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.log().calls.clear();
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.log().calls.iter().filter(|c| c.name == name).count()
    }

    pub fn rendered(&self) -> Vec<(VABufferID, BufferType, Vec<u8>)> {
        self.log().rendered.clone()
    }

    /// Context `buffer` was created for, if it is still alive.
    pub fn buffer_context(&self, buffer: VABufferID) -> Option<VAContextID> {
        self.log().buffer_contexts.get(&buffer).copied()
    }

    pub fn live_buffers(&self) -> usize {
        self.log().buffers.len()
    }

    pub fn live_surfaces(&self) -> usize {
        self.log().surfaces.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.log().contexts.len()
    }

    pub fn live_configs(&self) -> usize {
        self.log().configs.len()
    }

    pub fn live_images(&self) -> usize {
        self.log().images.len()
    }

    pub fn live_subpictures(&self) -> usize {
        self.log().subpictures.len()
    }

    pub fn acquired_handles(&self) -> usize {
        self.log().acquired_handles.len()
    }

    pub fn associated_surfaces(&self, subpicture: VASubpictureID) -> usize {
        self.log()
            .associations
            .get(&subpicture)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn double_destroys(&self) -> usize {
        self.log().double_destroys
    }
}

struct BufferData {
    data: Vec<u8>,
    mapped: bool,
}

/// Dummy driver that can be used to test any VA object.
pub(crate) struct DummyDriver {
    log: Arc<Mutex<Log>>,
    data: HashMap<VABufferID, BufferData>,
}

impl DummyDriver {
    pub fn new() -> (Self, DummyHandle) {
        let _ = env_logger::builder().is_test(true).try_init();

        let log = Arc::new(Mutex::new(Log::default()));
        (
            Self {
                log: Arc::clone(&log),
                data: HashMap::new(),
            },
            DummyHandle(log),
        )
    }

    /// Creates a display backed by a new dummy driver.
    pub fn new_display() -> (Arc<Display>, DummyHandle) {
        let (driver, handle) = Self::new();
        (Display::new(driver), handle)
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Log> {
        self.log.lock().unwrap()
    }
}

fn destroy_id(
    set: &mut BTreeSet<u32>,
    id: u32,
    double_destroys: &mut usize,
) -> Result<(), VaStatus> {
    if set.remove(&id) {
        Ok(())
    } else {
        *double_destroys += 1;
        Err(VaStatus::InvalidParameter)
    }
}

impl VaDriver for DummyDriver {
    fn create_buffer(
        &mut self,
        context: VAContextID,
        buffer_type: BufferType,
        size: usize,
        num_elements: u32,
        data: Option<&[u8]>,
    ) -> Result<VABufferID, VaStatus> {
        let id = {
            let mut log = self.log();
            let id = log.alloc_id();
            log.record("vaCreateBuffer", vec![id, buffer_type as u32])?;
            log.buffers.insert(id, buffer_type);
            log.buffer_contexts.insert(id, context);
            id
        };

        let mut contents = vec![0u8; size * num_elements.max(1) as usize];
        if let Some(data) = data {
            let len = data.len().min(contents.len());
            contents[..len].copy_from_slice(&data[..len]);
        }
        self.data.insert(
            id,
            BufferData {
                data: contents,
                mapped: false,
            },
        );

        Ok(id)
    }

    fn map_buffer(&mut self, buffer: VABufferID) -> Result<(), VaStatus> {
        self.log().record("vaMapBuffer", vec![buffer])?;
        let data = self.data.get_mut(&buffer).ok_or(VaStatus::InvalidBuffer)?;
        data.mapped = true;
        Ok(())
    }

    fn mapped_data(&mut self, buffer: VABufferID) -> Result<&mut [u8], VaStatus> {
        match self.data.get_mut(&buffer) {
            Some(data) if data.mapped => Ok(&mut data.data),
            _ => Err(VaStatus::InvalidBuffer),
        }
    }

    fn unmap_buffer(&mut self, buffer: VABufferID) -> Result<(), VaStatus> {
        self.log().record("vaUnmapBuffer", vec![buffer])?;
        let data = self.data.get_mut(&buffer).ok_or(VaStatus::InvalidBuffer)?;
        data.mapped = false;
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: VABufferID) -> Result<(), VaStatus> {
        let mut log = self.log.lock().unwrap();
        log.record("vaDestroyBuffer", vec![buffer])?;
        let Log {
            buffers,
            buffer_contexts,
            double_destroys,
            ..
        } = &mut *log;
        if buffers.remove(&buffer).is_none() {
            *double_destroys += 1;
            return Err(VaStatus::InvalidBuffer);
        }
        buffer_contexts.remove(&buffer);
        self.data.remove(&buffer);
        Ok(())
    }

    fn acquire_buffer_handle(
        &mut self,
        buffer: VABufferID,
        mem_type: u32,
    ) -> Result<BufferInfo, VaStatus> {
        let mut log = self.log();
        log.record("vaAcquireBufferHandle", vec![buffer])?;
        if !log.buffers.contains_key(&buffer) {
            return Err(VaStatus::InvalidBuffer);
        }
        log.acquired_handles.insert(buffer);

        Ok(BufferInfo {
            handle: 0x1000 + buffer as usize,
            mem_type: log.exported_mem_type.unwrap_or(mem_type),
            mem_size: self.data.get(&buffer).map(|d| d.data.len()).unwrap_or(0),
        })
    }

    fn release_buffer_handle(&mut self, buffer: VABufferID) -> Result<(), VaStatus> {
        let mut log = self.log();
        log.record("vaReleaseBufferHandle", vec![buffer])?;
        if log.acquired_handles.remove(&buffer) {
            Ok(())
        } else {
            log.double_destroys += 1;
            Err(VaStatus::InvalidBuffer)
        }
    }

    fn create_surfaces(
        &mut self,
        _rt_format: u32,
        _width: u32,
        _height: u32,
        num_surfaces: usize,
    ) -> Result<Vec<VASurfaceID>, VaStatus> {
        let mut log = self.log();
        let ids = (0..num_surfaces).map(|_| log.alloc_id()).collect::<Vec<_>>();
        log.record("vaCreateSurfaces", ids.clone())?;
        log.surfaces.extend(ids.iter().copied());
        Ok(ids)
    }

    fn destroy_surfaces(&mut self, surfaces: &[VASurfaceID]) -> Result<(), VaStatus> {
        let mut log = self.log();
        log.record("vaDestroySurfaces", surfaces.to_vec())?;
        let Log {
            surfaces: live,
            double_destroys,
            ..
        } = &mut *log;
        for id in surfaces {
            destroy_id(live, *id, double_destroys)?;
        }
        Ok(())
    }

    fn sync_surface(&mut self, surface: VASurfaceID) -> Result<(), VaStatus> {
        self.log().record("vaSyncSurface", vec![surface])
    }

    fn query_surface_status(&mut self, surface: VASurfaceID) -> Result<SurfaceStatus, VaStatus> {
        self.log().record("vaQuerySurfaceStatus", vec![surface])?;
        Ok(SurfaceStatus::Ready)
    }

    fn get_config_attributes(
        &mut self,
        _profile: Profile,
        _entrypoint: Entrypoint,
        attribs: &mut [ConfigAttrib],
    ) -> Result<(), VaStatus> {
        let mut log = self.log();
        log.record("vaGetConfigAttributes", vec![])?;
        for attrib in attribs.iter_mut() {
            if attrib.attrib_type == ConfigAttribType::RtFormat {
                attrib.value = log.rt_formats.unwrap_or(VA_RT_FORMAT_YUV420);
            }
        }
        Ok(())
    }

    fn create_config(
        &mut self,
        _profile: Profile,
        _entrypoint: Entrypoint,
        _attribs: &[ConfigAttrib],
    ) -> Result<VAConfigID, VaStatus> {
        let mut log = self.log();
        let id = log.alloc_id();
        log.record("vaCreateConfig", vec![id])?;
        log.configs.insert(id);
        Ok(id)
    }

    fn destroy_config(&mut self, config: VAConfigID) -> Result<(), VaStatus> {
        let mut log = self.log();
        log.record("vaDestroyConfig", vec![config])?;
        let Log {
            configs,
            double_destroys,
            ..
        } = &mut *log;
        destroy_id(configs, config, double_destroys)
    }

    fn create_context(
        &mut self,
        config: VAConfigID,
        _width: u32,
        _height: u32,
        _flags: u32,
        render_targets: &[VASurfaceID],
    ) -> Result<VAContextID, VaStatus> {
        let mut log = self.log();
        let id = log.alloc_id();
        let mut ids = vec![id, config];
        ids.extend_from_slice(render_targets);
        log.record("vaCreateContext", ids)?;
        if !log.configs.contains(&config) {
            return Err(VaStatus::InvalidConfig);
        }
        log.contexts.insert(id);
        Ok(id)
    }

    fn destroy_context(&mut self, context: VAContextID) -> Result<(), VaStatus> {
        let mut log = self.log();
        log.record("vaDestroyContext", vec![context])?;
        let Log {
            contexts,
            double_destroys,
            ..
        } = &mut *log;
        destroy_id(contexts, context, double_destroys)
    }

    fn begin_picture(
        &mut self,
        context: VAContextID,
        target: VASurfaceID,
    ) -> Result<(), VaStatus> {
        self.log().record("vaBeginPicture", vec![context, target])
    }

    fn render_picture(
        &mut self,
        context: VAContextID,
        buffers: &[VABufferID],
    ) -> Result<(), VaStatus> {
        let mut log = self.log.lock().unwrap();
        let mut ids = vec![context];
        ids.extend_from_slice(buffers);
        log.record("vaRenderPicture", ids)?;

        for id in buffers {
            let buffer_type = *log.buffers.get(id).ok_or(VaStatus::InvalidBuffer)?;
            let data = self.data.get(id).ok_or(VaStatus::InvalidBuffer)?;
            if data.mapped {
                return Err(VaStatus::InvalidBuffer);
            }
            log.rendered.push((*id, buffer_type, data.data.clone()));
        }
        Ok(())
    }

    fn end_picture(&mut self, context: VAContextID) -> Result<(), VaStatus> {
        self.log().record("vaEndPicture", vec![context])
    }

    fn create_image(
        &mut self,
        format: ImageFormat,
        width: u32,
        height: u32,
    ) -> Result<VAImage, VaStatus> {
        let (image_id, buf) = {
            let mut log = self.log();
            let image_id = log.alloc_id();
            let buf = log.alloc_id();
            log.record("vaCreateImage", vec![image_id, buf])?;
            log.images.insert(image_id);
            log.buffers.insert(buf, BufferType::Image);
            (image_id, buf)
        };

        let pitch = width * (format.bits_per_pixel / 8).max(1);
        let data_size = pitch * height;
        self.data.insert(
            buf,
            BufferData {
                data: vec![0u8; data_size as usize],
                mapped: false,
            },
        );

        Ok(VAImage {
            image_id,
            format,
            buf,
            width,
            height,
            data_size,
            num_planes: 1,
            pitches: [pitch, 0, 0],
            offsets: [0, 0, 0],
        })
    }

    fn derive_image(&mut self, surface: VASurfaceID) -> Result<VAImage, VaStatus> {
        {
            let mut log = self.log();
            log.record("vaDeriveImage", vec![surface])?;
            if !log.surfaces.contains(&surface) {
                return Err(VaStatus::InvalidSurface);
            }
        }
        let mut image = self.create_image(
            ImageFormat {
                fourcc: crate::backend::vaapi::VA_FOURCC_NV12,
                bits_per_pixel: 12,
            },
            16,
            16,
        )?;
        image.num_planes = 2;
        Ok(image)
    }

    fn destroy_image(&mut self, image: VAImageID) -> Result<(), VaStatus> {
        let mut log = self.log.lock().unwrap();
        log.record("vaDestroyImage", vec![image])?;
        let Log {
            images,
            buffers,
            double_destroys,
            ..
        } = &mut *log;
        destroy_id(images, image, double_destroys)?;
        // The pixel buffer was allocated right after the image.
        let buf = image + 1;
        buffers.remove(&buf);
        self.data.remove(&buf);
        Ok(())
    }

    fn create_subpicture(&mut self, image: VAImageID) -> Result<VASubpictureID, VaStatus> {
        let mut log = self.log();
        let id = log.alloc_id();
        log.record("vaCreateSubpicture", vec![id, image])?;
        log.subpictures.insert(id);
        Ok(id)
    }

    fn destroy_subpicture(&mut self, subpicture: VASubpictureID) -> Result<(), VaStatus> {
        let mut log = self.log();
        log.record("vaDestroySubpicture", vec![subpicture])?;
        log.associations.remove(&subpicture);
        let Log {
            subpictures,
            double_destroys,
            ..
        } = &mut *log;
        destroy_id(subpictures, subpicture, double_destroys)
    }

    fn set_subpicture_image(
        &mut self,
        subpicture: VASubpictureID,
        image: VAImageID,
    ) -> Result<(), VaStatus> {
        self.log()
            .record("vaSetSubpictureImage", vec![subpicture, image])
    }

    fn set_subpicture_global_alpha(
        &mut self,
        subpicture: VASubpictureID,
        _global_alpha: f32,
    ) -> Result<(), VaStatus> {
        self.log()
            .record("vaSetSubpictureGlobalAlpha", vec![subpicture])
    }

    fn associate_subpicture(
        &mut self,
        subpicture: VASubpictureID,
        surfaces: &[VASurfaceID],
        _src_rect: &Rect,
        _dst_rect: &Rect,
        _flags: u32,
    ) -> Result<(), VaStatus> {
        let mut log = self.log();
        let mut ids = vec![subpicture];
        ids.extend_from_slice(surfaces);
        log.record("vaAssociateSubpicture", ids)?;
        log.associations
            .entry(subpicture)
            .or_default()
            .extend(surfaces.iter().copied());
        Ok(())
    }

    fn deassociate_subpicture(
        &mut self,
        subpicture: VASubpictureID,
        surfaces: &[VASurfaceID],
    ) -> Result<(), VaStatus> {
        let mut log = self.log();
        let mut ids = vec![subpicture];
        ids.extend_from_slice(surfaces);
        log.record("vaDeassociateSubpicture", ids)?;
        if let Some(associated) = log.associations.get_mut(&subpicture) {
            for surface in surfaces {
                associated.remove(surface);
            }
        }
        Ok(())
    }

    fn query_config_profiles(&mut self) -> Result<Vec<Profile>, VaStatus> {
        let mut log = self.log();
        log.record("vaQueryConfigProfiles", vec![])?;
        let mut profiles = Vec::new();
        for (profile, _) in log.decoders() {
            if !profiles.contains(&profile) {
                profiles.push(profile);
            }
        }
        Ok(profiles)
    }

    fn query_config_entrypoints(&mut self, profile: Profile) -> Result<Vec<Entrypoint>, VaStatus> {
        let mut log = self.log();
        log.record("vaQueryConfigEntrypoints", vec![profile as u32])?;
        let entrypoints = log
            .decoders()
            .into_iter()
            .filter(|(p, _)| *p == profile)
            .map(|(_, e)| e)
            .collect::<Vec<_>>();
        if entrypoints.is_empty() {
            return Err(VaStatus::UnsupportedProfile);
        }
        Ok(entrypoints)
    }

    fn query_subpicture_formats(&mut self) -> Result<Vec<(ImageFormat, u32)>, VaStatus> {
        let mut log = self.log();
        log.record("vaQuerySubpictureFormats", vec![])?;
        Ok(log
            .subpicture_formats
            .clone()
            .unwrap_or_else(default_subpicture_formats))
    }
}
