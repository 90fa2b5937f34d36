// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ownership wrapper around an exported driver buffer handle (DMA-BUF, GEM name...).

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::backend::vaapi::image::Image;
use crate::backend::vaapi::surface::Surface;
use crate::backend::vaapi::Display;
use crate::backend::vaapi::Error;
use crate::backend::vaapi::Result;
use crate::backend::vaapi::VABufferID;
use crate::backend::vaapi::VA_INVALID_ID;
use crate::backend::vaapi::VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME;
use crate::backend::vaapi::VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2;
use crate::backend::vaapi::VA_SURFACE_ATTRIB_MEM_TYPE_KERNEL_DRM;

/// Kind of memory a [`BufferProxy`] handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// A DMA-BUF file descriptor.
    DmaBuf,
    /// A DMA-BUF file descriptor exported with a `VADRMPRIMESurfaceDescriptor` layout.
    DmaBuf2,
    /// A kernel DRM (GEM) buffer name.
    GemBuf,
    V4l2,
    UserPtr,
    /// A raw VA image.
    Image,
}

impl MemoryType {
    /// The VA surface memory type matching `self`, if the driver can export it.
    pub fn to_va(self) -> Option<u32> {
        match self {
            MemoryType::DmaBuf => Some(VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME),
            MemoryType::DmaBuf2 => Some(VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2),
            MemoryType::GemBuf => Some(VA_SURFACE_ATTRIB_MEM_TYPE_KERNEL_DRM),
            MemoryType::V4l2 | MemoryType::UserPtr | MemoryType::Image => None,
        }
    }
}

/// An object owning a VA buffer whose handle can be exported.
pub trait BufferProxyParent: Send + Sync {
    fn display(&self) -> &Arc<Display>;
    fn buffer_id(&self) -> VABufferID;
}

/// Called once when the user data of a proxy is released.
pub type DestroyNotify = Box<dyn FnOnce() + Send>;

/// Memory object correlated with a proxy, e.g. the dma-buf memory exported from a surface.
pub type AssociatedMemory = Arc<dyn Any + Send + Sync>;

struct BufferProxyInner {
    parent: Option<Arc<dyn BufferProxyParent>>,
    va_buffer: VABufferID,
    mem_type: MemoryType,
    va_mem_type: u32,
    handle: usize,
    size: usize,
    acquired: bool,
    destroy_func: Mutex<Option<DestroyNotify>>,
    mem: Mutex<Option<AssociatedMemory>>,
}

impl BufferProxyInner {
    fn take_destroy_func(&self) -> Option<DestroyNotify> {
        self.destroy_func
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn release_handle(&mut self) {
        if !self.acquired {
            return;
        }

        if let Some(parent) = &self.parent {
            if let Err(e) = parent.display().release_buffer_handle(self.va_buffer) {
                log::warn!("failed to release handle of buffer {}: {}", self.va_buffer, e);
            }
        }
        self.acquired = false;
    }
}

impl Drop for BufferProxyInner {
    fn drop(&mut self) {
        self.release_handle();

        self.mem
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(destroy_func) = self.take_destroy_func() {
            destroy_func();
        }
        // `parent` is released last, when the fields are dropped.
    }
}

/// A shared handle to one exported hardware buffer.
///
/// Cloning adds a reference. When the last reference is dropped the exported handle is released
/// (if it was acquired from a parent), the associated memory is dropped, the destroy notification
/// runs, and the parent is released, in that order.
#[derive(Clone)]
pub struct BufferProxy(Arc<BufferProxyInner>);

impl BufferProxy {
    /// Wraps a handle allocated by the caller.
    ///
    /// The proxy has no parent, so it never talks to the driver.
    pub fn new(
        handle: usize,
        mem_type: MemoryType,
        size: usize,
        destroy_func: Option<DestroyNotify>,
    ) -> Result<Self> {
        let va_mem_type = mem_type
            .to_va()
            .ok_or(Error::UnsupportedMemoryType(mem_type))?;

        if handle == 0 {
            return Err(Error::InvalidArgument("buffer handle is null"));
        }
        if size == 0 {
            return Err(Error::InvalidArgument("buffer size is zero"));
        }

        Ok(Self(Arc::new(BufferProxyInner {
            parent: None,
            va_buffer: VA_INVALID_ID,
            mem_type,
            va_mem_type,
            handle,
            size,
            acquired: false,
            destroy_func: Mutex::new(destroy_func),
            mem: Mutex::new(None),
        })))
    }

    /// Exports the handle of `va_buffer`, which must be owned by `parent`.
    ///
    /// If `mem_type` has no VA equivalent nothing is taken over and `destroy_func` is dropped
    /// without being called. Once the export has been attempted the proxy owns `destroy_func`, so
    /// it runs if the export fails.
    pub fn new_from_parent(
        parent: Arc<dyn BufferProxyParent>,
        va_buffer: VABufferID,
        mem_type: MemoryType,
        destroy_func: Option<DestroyNotify>,
    ) -> Result<Self> {
        let va_mem_type = mem_type
            .to_va()
            .ok_or(Error::UnsupportedMemoryType(mem_type))?;

        let display = Arc::clone(parent.display());

        // Dropping `inner` on any error below releases what was acquired and runs `destroy_func`.
        let mut inner = BufferProxyInner {
            parent: Some(parent),
            va_buffer,
            mem_type,
            va_mem_type,
            handle: 0,
            size: 0,
            acquired: false,
            destroy_func: Mutex::new(destroy_func),
            mem: Mutex::new(None),
        };

        let info = display
            .acquire_buffer_handle(va_buffer, va_mem_type)
            .map_err(|e| Error::AcquireFailed(e.to_string()))?;
        inner.handle = info.handle;
        inner.size = info.mem_size;
        inner.acquired = true;

        if info.mem_type != va_mem_type {
            return Err(Error::AcquireFailed(format!(
                "driver exported memory type {:#x}, requested {:#x}",
                info.mem_type, va_mem_type
            )));
        }

        Ok(Self(Arc::new(inner)))
    }

    /// Exports the memory backing `surface`, through an image derived from it.
    pub fn new_from_surface(surface: &Surface, mem_type: MemoryType) -> Result<Self> {
        let image = Image::derive(surface).map_err(|e| Error::CreateFailed {
            what: "derived image",
            source: e,
        })?;
        let va_buffer = image.va_image().buf;

        Self::new_from_parent(Arc::new(image), va_buffer, mem_type, None)
    }

    pub fn handle(&self) -> usize {
        self.0.handle
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn memory_type(&self) -> MemoryType {
        self.0.mem_type
    }

    /// The VA memory type the handle was exported as.
    pub fn va_memory_type(&self) -> u32 {
        self.0.va_mem_type
    }

    /// The VA buffer the handle was exported from, or `VA_INVALID_ID` for wrapped handles.
    pub fn va_buffer(&self) -> VABufferID {
        self.0.va_buffer
    }

    pub fn set_associated_memory(&self, mem: Option<AssociatedMemory>) {
        *self.0.mem.lock().unwrap_or_else(PoisonError::into_inner) = mem;
    }

    pub fn associated_memory(&self) -> Option<AssociatedMemory> {
        self.0
            .mem
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs the destroy notification now, without releasing the proxy.
    pub fn release_user_data(&self) {
        if let Some(destroy_func) = self.0.take_destroy_func() {
            destroy_func();
        }
    }

    /// Number of live references to this proxy.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl std::fmt::Debug for BufferProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferProxy")
            .field("handle", &self.0.handle)
            .field("mem_type", &self.0.mem_type)
            .field("size", &self.0.size)
            .field("va_buffer", &self.0.va_buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::backend::dummy::DummyDriver;
    use crate::backend::vaapi::ImageFormat;
    use crate::backend::vaapi::VA_FOURCC_BGRA;
    use crate::backend::vaapi::VA_RT_FORMAT_YUV420;
    use crate::Resolution;

    fn counting_notify(counter: &Arc<AtomicUsize>) -> Option<DestroyNotify> {
        let counter = Arc::clone(counter);
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn wrap_handle() {
        let fired = Arc::new(AtomicUsize::new(0));

        let proxy = BufferProxy::new(0x1000, MemoryType::DmaBuf, 4096, counting_notify(&fired))
            .unwrap();
        assert_eq!(proxy.handle(), 0x1000);
        assert_eq!(proxy.size(), 4096);
        assert_eq!(proxy.memory_type(), MemoryType::DmaBuf);

        let other = proxy.clone();
        drop(proxy);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        drop(other);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_arguments() {
        assert!(matches!(
            BufferProxy::new(0x1000, MemoryType::V4l2, 4096, None),
            Err(Error::UnsupportedMemoryType(MemoryType::V4l2))
        ));
        assert!(matches!(
            BufferProxy::new(0, MemoryType::DmaBuf, 4096, None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            BufferProxy::new(0x1000, MemoryType::GemBuf, 0, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn release_user_data_runs_once() {
        let fired = Arc::new(AtomicUsize::new(0));

        let proxy =
            BufferProxy::new(0x2000, MemoryType::GemBuf, 16, counting_notify(&fired)).unwrap();
        proxy.release_user_data();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        drop(proxy);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn associated_memory() {
        let proxy = BufferProxy::new(0x2000, MemoryType::DmaBuf, 16, None).unwrap();
        assert!(proxy.associated_memory().is_none());

        let mem: AssociatedMemory = Arc::new(7u32);
        proxy.set_associated_memory(Some(Arc::clone(&mem)));
        let got = proxy.associated_memory().unwrap();
        assert_eq!(got.downcast_ref::<u32>(), Some(&7));

        drop(proxy);
        assert_eq!(Arc::strong_count(&mem), 2);
        drop(got);
        assert_eq!(Arc::strong_count(&mem), 1);
    }

    #[test]
    fn export_from_parent_round_trip() {
        let (display, driver) = DummyDriver::new_display();
        let image = Arc::new(
            Image::new(
                &display,
                ImageFormat {
                    fourcc: VA_FOURCC_BGRA,
                    bits_per_pixel: 32,
                },
                Resolution::from((8, 8)),
            )
            .unwrap(),
        );
        let buffers_before = driver.live_buffers();

        let proxy = BufferProxy::new_from_parent(
            Arc::clone(&image) as Arc<dyn BufferProxyParent>,
            image.va_image().buf,
            MemoryType::DmaBuf,
            None,
        )
        .unwrap();
        assert_eq!(driver.acquired_handles(), 1);
        assert_eq!(proxy.size(), 8 * 8 * 4);
        assert_eq!(proxy.va_memory_type(), VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME);

        drop(proxy);
        assert_eq!(driver.acquired_handles(), 0);
        assert_eq!(driver.live_buffers(), buffers_before);
        assert_eq!(driver.count_calls("vaReleaseBufferHandle"), 1);
        assert_eq!(driver.double_destroys(), 0);
    }

    #[test]
    fn mismatched_export_type_fails() {
        let (display, driver) = DummyDriver::new_display();
        driver.set_exported_mem_type(VA_SURFACE_ATTRIB_MEM_TYPE_KERNEL_DRM);
        let surface = Surface::new(&display, VA_RT_FORMAT_YUV420, Resolution::from((16, 16)))
            .unwrap();

        let res = BufferProxy::new_from_surface(&surface, MemoryType::DmaBuf);

        assert!(matches!(res, Err(Error::AcquireFailed(_))));
        assert_eq!(driver.acquired_handles(), 0);
        assert_eq!(driver.live_images(), 0);
    }

    #[test]
    fn export_surface() {
        let (display, driver) = DummyDriver::new_display();
        let surface = Surface::new(&display, VA_RT_FORMAT_YUV420, Resolution::from((16, 16)))
            .unwrap();

        let proxy = BufferProxy::new_from_surface(&surface, MemoryType::DmaBuf).unwrap();
        assert_eq!(driver.count_calls("vaDeriveImage"), 1);
        assert_eq!(driver.live_images(), 1);

        drop(proxy);
        assert_eq!(driver.live_images(), 0);
    }

    fn bgra_image(display: &Arc<Display>) -> Arc<Image> {
        Arc::new(
            Image::new(
                display,
                ImageFormat {
                    fourcc: VA_FOURCC_BGRA,
                    bits_per_pixel: 32,
                },
                Resolution::from((8, 8)),
            )
            .unwrap(),
        )
    }

    #[test]
    fn failed_acquire_runs_destroy_notify() {
        let (display, driver) = DummyDriver::new_display();
        let image = bgra_image(&display);
        let fired = Arc::new(AtomicUsize::new(0));
        driver.fail_call("vaAcquireBufferHandle", 0);

        let res = BufferProxy::new_from_parent(
            Arc::clone(&image) as Arc<dyn BufferProxyParent>,
            image.va_image().buf,
            MemoryType::DmaBuf,
            counting_notify(&fired),
        );

        assert!(matches!(res, Err(Error::AcquireFailed(_))));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(driver.count_calls("vaReleaseBufferHandle"), 0);
        assert_eq!(Arc::strong_count(&image), 1);
    }

    #[test]
    fn mismatched_export_runs_destroy_notify() {
        let (display, driver) = DummyDriver::new_display();
        let image = bgra_image(&display);
        let fired = Arc::new(AtomicUsize::new(0));
        driver.set_exported_mem_type(VA_SURFACE_ATTRIB_MEM_TYPE_KERNEL_DRM);

        let res = BufferProxy::new_from_parent(
            Arc::clone(&image) as Arc<dyn BufferProxyParent>,
            image.va_image().buf,
            MemoryType::DmaBuf,
            counting_notify(&fired),
        );

        assert!(matches!(res, Err(Error::AcquireFailed(_))));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(driver.acquired_handles(), 0);
        assert_eq!(driver.double_destroys(), 0);
    }

    #[test]
    fn unsupported_memory_type_keeps_destroy_notify() {
        let (display, driver) = DummyDriver::new_display();
        let image = bgra_image(&display);
        let fired = Arc::new(AtomicUsize::new(0));

        let res = BufferProxy::new_from_parent(
            Arc::clone(&image) as Arc<dyn BufferProxyParent>,
            image.va_image().buf,
            MemoryType::UserPtr,
            counting_notify(&fired),
        );

        assert!(matches!(
            res,
            Err(Error::UnsupportedMemoryType(MemoryType::UserPtr))
        ));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(driver.count_calls("vaAcquireBufferHandle"), 0);
    }

    #[test]
    fn export_as_prime_2() {
        let (display, driver) = DummyDriver::new_display();
        let image = bgra_image(&display);

        let proxy = BufferProxy::new_from_parent(
            Arc::clone(&image) as Arc<dyn BufferProxyParent>,
            image.va_image().buf,
            MemoryType::DmaBuf2,
            None,
        )
        .unwrap();

        assert_eq!(proxy.memory_type(), MemoryType::DmaBuf2);
        assert_eq!(
            proxy.va_memory_type(),
            VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2
        );
        assert_eq!(driver.acquired_handles(), 1);
    }
}
