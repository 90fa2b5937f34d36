// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware decoding session: a VA config, a VA context and the pool of surfaces it decodes into.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::backend::vaapi::overlay::OverlayComposition;
use crate::backend::vaapi::overlay::OverlayRectangle;
use crate::backend::vaapi::overlay::OverlayState;
use crate::backend::vaapi::surface::Surface;
use crate::backend::vaapi::surface::SurfaceProxy;
use crate::backend::vaapi::surface_pool::lock_pool;
use crate::backend::vaapi::surface_pool::SurfacePool;
use crate::backend::vaapi::va_rt_format_to_string;
use crate::backend::vaapi::ConfigAttrib;
use crate::backend::vaapi::ConfigAttribType;
use crate::backend::vaapi::Display;
use crate::backend::vaapi::Entrypoint;
use crate::backend::vaapi::Error;
use crate::backend::vaapi::Profile;
use crate::backend::vaapi::Result;
use crate::backend::vaapi::VAConfigID;
use crate::backend::vaapi::VAContextID;
use crate::backend::vaapi::VASurfaceID;
use crate::backend::vaapi::VA_ATTRIB_NOT_SUPPORTED;
use crate::backend::vaapi::VA_INVALID_ID;
use crate::backend::vaapi::VA_PROGRESSIVE;
use crate::backend::vaapi::VA_RT_FORMAT_YUV420;
use crate::Resolution;

/// Surfaces allocated on top of the reference frames, for the picture being decoded and the ones
/// waiting to be displayed.
pub const SCRATCH_SURFACES: usize = 4;
/// Reference frames kept by codecs that do not need more.
pub const DEFAULT_REF_FRAMES: usize = 2;
/// Maximum number of reference frames of an H.264 stream.
pub const H264_REF_FRAMES: usize = 16;

/// Number of reference frames to provision surfaces for when decoding `profile`.
pub fn ref_frames(profile: Profile) -> usize {
    if profile.is_h264() {
        H264_REF_FRAMES
    } else {
        DEFAULT_REF_FRAMES
    }
}

/// Total number of surfaces a context decoding `profile` needs.
pub fn num_surfaces(profile: Profile) -> usize {
    ref_frames(profile).max(DEFAULT_REF_FRAMES) + SCRATCH_SURFACES
}

/// Parameters a [`Context`] is created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextInfo {
    pub profile: Profile,
    pub entrypoint: Entrypoint,
    pub size: Resolution,
}

impl ContextInfo {
    pub fn new(profile: Profile, entrypoint: Entrypoint, size: Resolution) -> Self {
        Self {
            profile,
            entrypoint,
            size,
        }
    }
}

/// A decoding session.
///
/// Surfaces are allocated once per size and never shrunk. The VA config is tied to the
/// profile/entrypoint pair and the VA context to both the config and the surface set, so
/// [`Context::reset`] only recreates what the new parameters invalidate.
pub struct Context {
    display: Arc<Display>,
    info: ContextInfo,
    config_id: VAConfigID,
    /// Shared with the codec handles so that objects created after a reset use the new context.
    context_id: Arc<AtomicU32>,
    pool: Arc<Mutex<SurfacePool>>,
    /// Number of surfaces the pool has been grown to.
    capacity: usize,
    overlay: OverlayState,
    /// Whether the last call to `reset` succeeded entirely.
    constructed: bool,
}

impl Context {
    /// Creates a context for `info` and allocates its surfaces.
    pub fn new(display: &Arc<Display>, info: ContextInfo) -> Result<Self> {
        if info.profile == Profile::None {
            return Err(Error::InvalidArgument("no profile"));
        }
        if info.size.is_empty() {
            return Err(Error::InvalidArgument("empty picture size"));
        }

        let mut context = Self {
            display: Arc::clone(display),
            info,
            config_id: VA_INVALID_ID,
            context_id: Arc::new(AtomicU32::new(VA_INVALID_ID)),
            pool: SurfacePool::new(Arc::clone(display), VA_RT_FORMAT_YUV420, info.size),
            capacity: 0,
            overlay: Default::default(),
            constructed: false,
        };

        context.apply(info, true, true)?;
        Ok(context)
    }

    /// Moves the context to `info`, recreating the surfaces if the size changed and the VA config
    /// if the profile or entrypoint changed.
    pub fn reset(&mut self, info: ContextInfo) -> Result<()> {
        if info.profile == Profile::None {
            return Err(Error::InvalidArgument("no profile"));
        }
        if info.size.is_empty() {
            return Err(Error::InvalidArgument("empty picture size"));
        }

        // A context that failed halfway is rebuilt entirely.
        let size_changed = !self.constructed || info.size != self.info.size;
        let codec_changed = !self.constructed
            || info.profile != self.info.profile
            || info.entrypoint != self.info.entrypoint;

        self.apply(info, size_changed, codec_changed)
    }

    fn apply(&mut self, info: ContextInfo, size_changed: bool, codec_changed: bool) -> Result<()> {
        let capacity = num_surfaces(info.profile).max(self.capacity);
        let grow = capacity > lock_pool(&self.pool).num_managed_surfaces();

        if !size_changed && !codec_changed && !grow {
            log::debug!("context already set up for {:?}", info);
            return Ok(());
        }

        log::debug!(
            "resetting context: {:?} -> {:?} (size changed: {}, codec changed: {})",
            self.info,
            info,
            size_changed,
            codec_changed
        );

        self.constructed = false;
        self.info = info;

        // The VA context refers to the config and to every surface, so it goes first whatever
        // changed.
        self.destroy_va_context();
        if codec_changed {
            self.destroy_config();
            self.create_config()?;
        }

        if size_changed {
            // Subpictures are associated with the surfaces that are about to go away.
            self.overlay.clear();
            lock_pool(&self.pool).set_coded_resolution(info.size);
            self.capacity = 0;
        }

        self.ensure_surfaces(capacity)?;
        self.create_va_context()?;

        self.constructed = true;
        Ok(())
    }

    /// Grows the pool to `capacity` surfaces.
    fn ensure_surfaces(&mut self, capacity: usize) -> Result<()> {
        let mut pool = lock_pool(&self.pool);
        let missing = capacity.saturating_sub(pool.num_managed_surfaces());
        if missing == 0 {
            return Ok(());
        }

        pool.add_surfaces(missing)
            .map_err(Error::SurfaceAllocationFailed)?;
        self.capacity = pool.num_managed_surfaces();

        Ok(())
    }

    fn create_config(&mut self) -> Result<()> {
        let supported = self
            .display
            .has_decoder(self.info.profile, self.info.entrypoint)
            .map_err(Error::ContextCreationFailed)?;
        if !supported {
            return Err(Error::UnsupportedProfile {
                profile: self.info.profile,
                entrypoint: self.info.entrypoint,
            });
        }

        let mut attribs = [ConfigAttrib {
            attrib_type: ConfigAttribType::RtFormat,
            value: 0,
        }];
        self.display
            .get_config_attributes(self.info.profile, self.info.entrypoint, &mut attribs)
            .map_err(Error::ContextCreationFailed)?;

        let rt_formats = attribs[0].value;
        if rt_formats == VA_ATTRIB_NOT_SUPPORTED || rt_formats & VA_RT_FORMAT_YUV420 == 0 {
            return Err(Error::UnsupportedFormat(format!(
                "{} is not supported by {:?}/{:?}",
                va_rt_format_to_string(VA_RT_FORMAT_YUV420),
                self.info.profile,
                self.info.entrypoint
            )));
        }

        attribs[0].value = VA_RT_FORMAT_YUV420;
        self.config_id = self
            .display
            .create_config(self.info.profile, self.info.entrypoint, &attribs)
            .map_err(Error::ContextCreationFailed)?;

        Ok(())
    }

    fn create_va_context(&mut self) -> Result<()> {
        let surfaces = lock_pool(&self.pool).surface_ids();
        let context_id = self
            .display
            .create_context(
                self.config_id,
                self.info.size.width,
                self.info.size.height,
                VA_PROGRESSIVE,
                &surfaces,
            )
            .map_err(Error::ContextCreationFailed)?;
        self.context_id.store(context_id, Ordering::Release);

        Ok(())
    }

    fn destroy_va_context(&mut self) {
        // Swapped out first so that no handle picks up the ID while it is being destroyed.
        let context_id = self.context_id.swap(VA_INVALID_ID, Ordering::AcqRel);
        if context_id == VA_INVALID_ID {
            return;
        }

        if let Err(e) = self.display.destroy_context(context_id) {
            log::warn!("failed to destroy VA context {}: {}", context_id, e);
        }
    }

    fn destroy_config(&mut self) {
        if self.config_id == VA_INVALID_ID {
            return;
        }

        if let Err(e) = self.display.destroy_config(self.config_id) {
            log::warn!("failed to destroy VA config {}: {}", self.config_id, e);
        }
        self.config_id = VA_INVALID_ID;
    }

    pub fn display(&self) -> &Arc<Display> {
        &self.display
    }

    pub fn info(&self) -> &ContextInfo {
        &self.info
    }

    pub fn size(&self) -> Resolution {
        self.info.size
    }

    /// ID of the VA context, or `VA_INVALID_ID` if the last reset failed.
    pub fn id(&self) -> VAContextID {
        self.context_id.load(Ordering::Acquire)
    }

    /// The cell holding the current VA context ID. It reads `VA_INVALID_ID` while the context is
    /// being rebuilt or after it has been dropped.
    pub(crate) fn shared_id(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.context_id)
    }

    pub fn config_id(&self) -> VAConfigID {
        self.config_id
    }

    pub fn is_constructed(&self) -> bool {
        self.constructed
    }

    pub fn surface_pool(&self) -> &Arc<Mutex<SurfacePool>> {
        &self.pool
    }

    /// Checks a surface out of the pool. Never blocks: `None` means every surface is in use.
    pub fn get_surface(&self) -> Option<Arc<Surface>> {
        lock_pool(&self.pool).get_surface()
    }

    /// Checks a surface out of the pool, wrapped into a proxy that returns it when dropped.
    pub fn get_surface_proxy(&self) -> Option<SurfaceProxy> {
        let surface = self.get_surface()?;
        Some(SurfaceProxy::new(&self.pool, surface))
    }

    /// Returns a surface obtained from [`Context::get_surface`].
    pub fn put_surface(&self, surface: Arc<Surface>) {
        lock_pool(&self.pool).put_surface(surface)
    }

    /// Number of surfaces that can currently be checked out.
    pub fn surface_count(&self) -> usize {
        lock_pool(&self.pool).num_free_surfaces()
    }

    /// Total number of surfaces of the pool, checked out or not.
    pub fn capacity(&self) -> usize {
        lock_pool(&self.pool).num_managed_surfaces()
    }

    pub fn find_surface_by_id(&self, id: VASurfaceID) -> Option<Arc<Surface>> {
        lock_pool(&self.pool).find_surface_by_id(id)
    }

    /// Binds `composition` to every surface of the context, or removes the current overlay if
    /// `composition` is `None`.
    ///
    /// If a rectangle cannot be bound the context is left without any overlay.
    pub fn apply_composition(&mut self, composition: Option<&OverlayComposition>) -> Result<()> {
        let surfaces = lock_pool(&self.pool).surface_ids();
        self.overlay.apply(&self.display, &surfaces, composition)
    }

    /// Rectangles of the overlay currently bound to the surfaces.
    pub fn overlay_rectangles(&self) -> &[Arc<OverlayRectangle>] {
        self.overlay.current()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.overlay.clear();
        self.destroy_va_context();
        self.destroy_config();
        // Surfaces still checked out are destroyed by their last proxy.
        lock_pool(&self.pool).clear();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("info", &self.info)
            .field("config_id", &self.config_id)
            .field("context_id", &self.id())
            .field("capacity", &self.capacity)
            .field("constructed", &self.constructed)
            .finish()
    }
}
