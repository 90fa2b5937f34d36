// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use bitflags::bitflags;

use crate::backend::vaapi::surface_pool::lock_pool;
use crate::backend::vaapi::surface_pool::SurfacePool;
use crate::backend::vaapi::Display;
use crate::backend::vaapi::SurfaceStatus;
use crate::backend::vaapi::VASurfaceID;
use crate::backend::vaapi::VaError;
use crate::Resolution;

/// A driver-allocated video surface.
///
/// The driver surface is destroyed when the last reference to this object goes away.
pub struct Surface {
    display: Arc<Display>,
    id: VASurfaceID,
    rt_format: u32,
    size: Resolution,
}

impl Surface {
    /// Allocates a single surface of `size` with chroma format `rt_format`.
    pub fn new(display: &Arc<Display>, rt_format: u32, size: Resolution) -> Result<Self, VaError> {
        let ids = display.create_surfaces(rt_format, size.width, size.height, 1)?;
        let id = match ids.as_slice() {
            [id] => *id,
            _ => {
                log::error!("driver returned {} surfaces, expected 1", ids.len());
                if !ids.is_empty() {
                    let _ = display.destroy_surfaces(&ids);
                }
                return Err(VaError {
                    call: "vaCreateSurfaces",
                    status: crate::backend::vaapi::VaStatus::OperationFailed,
                });
            }
        };

        Ok(Self {
            display: Arc::clone(display),
            id,
            rt_format,
            size,
        })
    }

    pub fn id(&self) -> VASurfaceID {
        self.id
    }

    pub fn rt_format(&self) -> u32 {
        self.rt_format
    }

    pub fn size(&self) -> Resolution {
        self.size
    }

    pub fn display(&self) -> &Arc<Display> {
        &self.display
    }

    /// Blocks until all pending operations on the surface have completed.
    pub fn sync(&self) -> Result<(), VaError> {
        self.display.sync_surface(self.id)
    }

    pub fn status(&self) -> Result<SurfaceStatus, VaError> {
        self.display.query_surface_status(self.id)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if let Err(e) = self.display.destroy_surfaces(&[self.id]) {
            log::warn!("failed to destroy surface {}: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.id)
            .field("rt_format", &self.rt_format)
            .field("size", &self.size)
            .finish()
    }
}

bitflags! {
    /// Presentation flags carried by a [`SurfaceProxy`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SurfaceProxyFlags: u32 {
        /// The surface holds an interlaced frame.
        const INTERLACED = 1 << 0;
        /// Top field first.
        const TFF = 1 << 1;
        /// Repeat first field.
        const RFF = 1 << 2;
        /// Only one field is present.
        const ONEFIELD = 1 << 3;
    }
}

struct SurfaceProxyInner {
    surface: Arc<Surface>,
    pool: Weak<Mutex<SurfacePool>>,
    timestamp: AtomicU64,
    duration: AtomicU64,
    flags: AtomicU32,
}

impl Drop for SurfaceProxyInner {
    fn drop(&mut self) {
        match self.pool.upgrade() {
            Some(pool) => lock_pool(&pool).put_surface(Arc::clone(&self.surface)),
            None => log::debug!(
                "pool is gone, dropping surface {} ({:?})",
                self.surface.id(),
                self.surface.size()
            ),
        }
    }
}

/// A shared handle to a surface checked out of a [`SurfacePool`].
///
/// Cloning the proxy adds a reference. When the last reference is dropped the surface goes back
/// to its pool, provided the pool still exists and still manages the surface. This can happen on
/// any thread.
#[derive(Clone)]
pub struct SurfaceProxy(Arc<SurfaceProxyInner>);

impl SurfaceProxy {
    /// Wraps `surface`, which must have been obtained from `pool`.
    pub fn new(pool: &Arc<Mutex<SurfacePool>>, surface: Arc<Surface>) -> Self {
        Self(Arc::new(SurfaceProxyInner {
            surface,
            pool: Arc::downgrade(pool),
            timestamp: AtomicU64::new(0),
            duration: AtomicU64::new(0),
            flags: AtomicU32::new(0),
        }))
    }

    pub fn surface(&self) -> &Arc<Surface> {
        &self.0.surface
    }

    pub fn surface_id(&self) -> VASurfaceID {
        self.0.surface.id()
    }

    pub fn timestamp(&self) -> u64 {
        self.0.timestamp.load(Ordering::Acquire)
    }

    pub fn set_timestamp(&self, timestamp: u64) {
        self.0.timestamp.store(timestamp, Ordering::Release);
    }

    pub fn duration(&self) -> u64 {
        self.0.duration.load(Ordering::Acquire)
    }

    pub fn set_duration(&self, duration: u64) {
        self.0.duration.store(duration, Ordering::Release);
    }

    pub fn flags(&self) -> SurfaceProxyFlags {
        SurfaceProxyFlags::from_bits_truncate(self.0.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: SurfaceProxyFlags) {
        self.0.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn unset_flags(&self, flags: SurfaceProxyFlags) {
        self.0.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Number of live references to this proxy.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl std::fmt::Debug for SurfaceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceProxy")
            .field("surface", &self.0.surface)
            .field("timestamp", &self.timestamp())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDriver;
    use crate::backend::vaapi::VA_RT_FORMAT_YUV420;

    #[test]
    fn last_proxy_returns_surface() {
        let (display, _) = DummyDriver::new_display();
        let pool = SurfacePool::new(
            Arc::clone(&display),
            VA_RT_FORMAT_YUV420,
            Resolution::from((64, 64)),
        );
        lock_pool(&pool).add_surfaces(2).unwrap();

        let surface = lock_pool(&pool).get_surface().unwrap();
        let proxy = SurfaceProxy::new(&pool, surface);
        let other = proxy.clone();
        assert_eq!(proxy.ref_count(), 2);
        assert_eq!(lock_pool(&pool).num_free_surfaces(), 1);

        drop(proxy);
        assert_eq!(lock_pool(&pool).num_free_surfaces(), 1);

        drop(other);
        assert_eq!(lock_pool(&pool).num_free_surfaces(), 2);
    }

    #[test]
    fn proxy_flags_and_timestamp() {
        let (display, _) = DummyDriver::new_display();
        let pool = SurfacePool::new(display, VA_RT_FORMAT_YUV420, Resolution::from((16, 16)));
        lock_pool(&pool).add_surfaces(1).unwrap();
        let surface = lock_pool(&pool).get_surface().unwrap();

        let proxy = SurfaceProxy::new(&pool, surface);
        proxy.set_timestamp(42);
        proxy.set_flags(SurfaceProxyFlags::INTERLACED | SurfaceProxyFlags::TFF);
        proxy.unset_flags(SurfaceProxyFlags::TFF);

        assert_eq!(proxy.timestamp(), 42);
        assert_eq!(proxy.flags(), SurfaceProxyFlags::INTERLACED);
    }

    #[test]
    fn surface_destroyed_when_pool_is_gone() {
        let (display, driver) = DummyDriver::new_display();
        let pool = SurfacePool::new(display, VA_RT_FORMAT_YUV420, Resolution::from((16, 16)));
        lock_pool(&pool).add_surfaces(1).unwrap();
        let proxy = SurfaceProxy::new(&pool, lock_pool(&pool).get_surface().unwrap());

        drop(pool);
        assert_eq!(driver.live_surfaces(), 1);
        drop(proxy);
        assert_eq!(driver.live_surfaces(), 0);
    }
}
