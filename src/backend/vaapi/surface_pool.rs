// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::backend::vaapi::surface::Surface;
use crate::backend::vaapi::Display;
use crate::backend::vaapi::VASurfaceID;
use crate::backend::vaapi::VaError;
use crate::Resolution;

/// Locks `pool`. The pool stays consistent even if a holder panicked, so poisoning is ignored.
pub(crate) fn lock_pool(pool: &Mutex<SurfacePool>) -> MutexGuard<'_, SurfacePool> {
    pool.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fixed set of surfaces that can be checked out and returned.
///
/// The pool only houses surfaces of its coded resolution. Surfaces are never created or destroyed
/// by checking them out or returning them; only [`SurfacePool::add_surfaces`] and
/// [`SurfacePool::clear`] change the managed set.
///
/// Checking out is non-blocking: [`SurfacePool::get_surface`] returns `None` when everything is
/// in use and it is up to the caller to wait for a surface to be returned.
pub struct SurfacePool {
    display: Arc<Display>,
    rt_format: u32,
    coded_resolution: Resolution,
    /// Surfaces currently available.
    surfaces: VecDeque<Arc<Surface>>,
    /// All the surfaces managed by this pool, in allocation order, whether checked out or not.
    managed_surfaces: Vec<Arc<Surface>>,
}

impl SurfacePool {
    /// Create a new, empty pool.
    ///
    /// # Arguments
    ///
    /// * `display` - the VA display to create the surfaces from.
    /// * `rt_format` - the VA RT format to use for the surfaces.
    /// * `coded_resolution` - resolution of the surfaces.
    pub fn new(
        display: Arc<Display>,
        rt_format: u32,
        coded_resolution: Resolution,
    ) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            display,
            rt_format,
            coded_resolution,
            surfaces: VecDeque::new(),
            managed_surfaces: Vec::new(),
        }))
    }

    /// Creates `count` new surfaces and adds them to the pool.
    ///
    /// Surfaces are allocated one at a time. If one allocation fails, the surfaces created by
    /// this call are released again and the pool is left as it was.
    pub fn add_surfaces(&mut self, count: usize) -> Result<(), VaError> {
        let mut new_surfaces = Vec::with_capacity(count);

        for _ in 0..count {
            // `new_surfaces` is dropped on error, destroying what was created so far.
            let surface = Surface::new(&self.display, self.rt_format, self.coded_resolution)?;
            new_surfaces.push(Arc::new(surface));
        }

        log::debug!(
            "adding {} surfaces of {:?} to pool",
            new_surfaces.len(),
            self.coded_resolution
        );
        self.surfaces.extend(new_surfaces.iter().cloned());
        self.managed_surfaces.extend(new_surfaces);

        Ok(())
    }

    /// Retrieve the current coded resolution of the pool
    pub fn coded_resolution(&self) -> Resolution {
        self.coded_resolution
    }

    /// Sets the coded resolution of the pool and releases every surface it manages.
    ///
    /// Surfaces that are currently checked out stay alive until their last user drops them, but
    /// will not be returned to the pool.
    pub fn set_coded_resolution(&mut self, resolution: Resolution) {
        self.coded_resolution = resolution;
        self.clear();
    }

    /// Gets a free surface from the pool, or `None` if all of them are checked out.
    pub fn get_surface(&mut self) -> Option<Arc<Surface>> {
        let surface = self.surfaces.pop_front();

        // Make sure the invariant holds when debugging.
        debug_assert!({
            match surface.as_ref() {
                Some(s) => s.size().can_contain(self.coded_resolution),
                None => true,
            }
        });

        surface
    }

    /// Returns `surface` to the pool.
    ///
    /// Surfaces the pool does not manage (e.g. left over from a previous resolution) are dropped
    /// instead. Returning a surface that is already available is ignored.
    pub fn put_surface(&mut self, surface: Arc<Surface>) {
        let id = surface.id();

        if !self.managed_surfaces.iter().any(|s| s.id() == id) {
            log::debug!("dropping stale surface: {}, ({:?})", id, surface.size());
            return;
        }

        if self.surfaces.iter().any(|s| s.id() == id) {
            log::warn!("surface {} returned to the pool twice", id);
            return;
        }

        self.surfaces.push_back(surface);
    }

    /// Returns the number of surfaces that can currently be checked out.
    pub fn num_free_surfaces(&self) -> usize {
        self.surfaces.len()
    }

    /// Returns the total number of managed surfaces in this pool.
    pub fn num_managed_surfaces(&self) -> usize {
        self.managed_surfaces.len()
    }

    /// Looks up a managed surface by its VA ID.
    pub fn find_surface_by_id(&self, id: VASurfaceID) -> Option<Arc<Surface>> {
        self.managed_surfaces.iter().find(|s| s.id() == id).cloned()
    }

    /// IDs of all managed surfaces, in allocation order.
    pub fn surface_ids(&self) -> Vec<VASurfaceID> {
        self.managed_surfaces.iter().map(|s| s.id()).collect()
    }

    /// Releases every surface managed by the pool.
    pub fn clear(&mut self) {
        self.surfaces.clear();
        self.managed_surfaces.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDriver;
    use crate::backend::vaapi::VA_RT_FORMAT_YUV420;

    fn new_pool() -> (Arc<Mutex<SurfacePool>>, crate::backend::dummy::DummyHandle) {
        let (display, driver) = DummyDriver::new_display();
        let pool = SurfacePool::new(display, VA_RT_FORMAT_YUV420, Resolution::from((32, 32)));
        (pool, driver)
    }

    #[test]
    fn checkout_is_exclusive() {
        let (pool, _driver) = new_pool();
        let mut pool = lock_pool(&pool);
        pool.add_surfaces(3).unwrap();

        let a = pool.get_surface().unwrap();
        let b = pool.get_surface().unwrap();
        let c = pool.get_surface().unwrap();
        assert!(pool.get_surface().is_none());

        let mut ids = vec![a.id(), b.id(), c.id()];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        pool.put_surface(b);
        assert_eq!(pool.num_free_surfaces(), 1);
        assert_eq!(pool.num_managed_surfaces(), 3);
    }

    #[test]
    fn double_return_is_ignored() {
        let (pool, _driver) = new_pool();
        let mut pool = lock_pool(&pool);
        pool.add_surfaces(2).unwrap();

        let a = pool.get_surface().unwrap();
        pool.put_surface(Arc::clone(&a));
        pool.put_surface(a);

        assert_eq!(pool.num_free_surfaces(), 2);
    }

    #[test]
    fn failed_allocation_rolls_back() {
        let (pool, driver) = new_pool();
        driver.fail_call("vaCreateSurfaces", 2);

        let mut pool = lock_pool(&pool);
        assert!(pool.add_surfaces(4).is_err());
        assert_eq!(pool.num_managed_surfaces(), 0);
        assert_eq!(driver.live_surfaces(), 0);
    }

    #[test]
    fn stale_surfaces_are_dropped() {
        let (pool, driver) = new_pool();
        let mut pool = lock_pool(&pool);
        pool.add_surfaces(2).unwrap();
        let a = pool.get_surface().unwrap();

        pool.set_coded_resolution(Resolution::from((64, 64)));
        assert_eq!(driver.live_surfaces(), 1);

        pool.put_surface(a);
        assert_eq!(pool.num_free_surfaces(), 0);
        assert_eq!(driver.live_surfaces(), 0);
    }

    #[test]
    fn find_by_id() {
        let (pool, _driver) = new_pool();
        let mut pool = lock_pool(&pool);
        pool.add_surfaces(2).unwrap();
        let ids = pool.surface_ids();

        assert_eq!(pool.find_surface_by_id(ids[1]).unwrap().id(), ids[1]);
        assert!(pool.find_surface_by_id(0xdead).is_none());
    }
}
