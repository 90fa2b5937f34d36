// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Common construction protocol of the objects a codec builds while decoding a picture.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::backend::vaapi::context::Context;
use crate::backend::vaapi::surface_pool::SurfacePool;
use crate::backend::vaapi::Display;
use crate::backend::vaapi::Error;
use crate::backend::vaapi::Result;
use crate::backend::vaapi::VAContextID;
use crate::backend::vaapi::VA_INVALID_ID;

/// The closed set of codec objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecObjectKind {
    IqMatrix,
    BitPlane,
    HuffmanTable,
    Slice,
    Picture,
}

/// Construction arguments shared by all codec objects.
///
/// `param` and `data` may be `None`, in which case the driver zero-initializes buffers of
/// `param_size` and `data_size` bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecObjectArgs<'a> {
    pub param: Option<&'a [u8]>,
    pub param_size: usize,
    pub data: Option<&'a [u8]>,
    pub data_size: usize,
    pub flags: u32,
}

impl<'a> CodecObjectArgs<'a> {
    pub fn with_param(param: Option<&'a [u8]>, param_size: usize) -> Self {
        Self {
            param,
            param_size,
            ..Default::default()
        }
    }
}

/// What codec objects need from the decoder that creates them: the display, the VA context
/// buffers are created for, and the pool pictures take their surface from.
///
/// The handle follows the context across resets: the context ID is read when an object needs it,
/// not when the handle is taken.
#[derive(Clone)]
pub struct CodecHandle {
    display: Arc<Display>,
    context_id: Arc<AtomicU32>,
    pool: Arc<Mutex<SurfacePool>>,
}

impl CodecHandle {
    pub fn new(context: &Context) -> Self {
        Self {
            display: Arc::clone(context.display()),
            context_id: context.shared_id(),
            pool: Arc::clone(context.surface_pool()),
        }
    }

    pub fn display(&self) -> &Arc<Display> {
        &self.display
    }

    /// ID of the live VA context.
    ///
    /// Fails with [`Error::NoContext`] if the last reset of the context failed or the context has
    /// been dropped.
    pub fn context_id(&self) -> Result<VAContextID> {
        match self.context_id.load(Ordering::Acquire) {
            VA_INVALID_ID => Err(Error::NoContext),
            id => Ok(id),
        }
    }

    pub fn surface_pool(&self) -> &Arc<Mutex<SurfacePool>> {
        &self.pool
    }
}

impl std::fmt::Debug for CodecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecHandle")
            .field("context_id", &self.context_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// State shared by every codec object.
#[derive(Debug, Clone)]
pub struct CodecObjectBase {
    codec: CodecHandle,
    constructed: bool,
}

impl CodecObjectBase {
    pub fn new(codec: &CodecHandle) -> Self {
        Self {
            codec: codec.clone(),
            constructed: false,
        }
    }

    pub fn codec(&self) -> &CodecHandle {
        &self.codec
    }

    pub fn is_constructed(&self) -> bool {
        self.constructed
    }
}

/// An object holding driver resources on behalf of a codec.
pub trait CodecObject: Sized {
    const KIND: CodecObjectKind;

    /// Allocates an object that has not been constructed yet.
    fn alloc(codec: &CodecHandle) -> Self;

    fn base(&self) -> &CodecObjectBase;
    fn base_mut(&mut self) -> &mut CodecObjectBase;

    /// Hook run before `create`, for state common to a family of objects.
    fn create_base(&mut self, _args: &CodecObjectArgs) -> Result<()> {
        Ok(())
    }

    /// Creates the driver resources of the object.
    fn create(&mut self, args: &CodecObjectArgs) -> Result<()>;

    /// Releases the driver resources of the object. Must be idempotent, as it also runs on drop.
    fn destroy(&mut self);
}

/// Constructs `object` from `args`. Does nothing if it has already been constructed.
pub fn construct<O: CodecObject>(object: &mut O, args: &CodecObjectArgs) -> Result<()> {
    if object.base().constructed {
        return Ok(());
    }

    object.create_base(args)?;
    object.create(args)?;
    object.base_mut().constructed = true;

    Ok(())
}

/// Constructs an object allocated by the caller, destroying it if that fails.
pub(crate) fn build<O: CodecObject>(mut object: O, args: &CodecObjectArgs) -> Result<O> {
    match construct(&mut object, args) {
        Ok(()) => Ok(object),
        Err(e) => {
            log::debug!("failed to construct {:?}: {}", O::KIND, e);
            object.destroy();
            Err(e)
        }
    }
}

/// Allocates and constructs a new object of type `O`.
///
/// Either a fully constructed object is returned, or everything it had acquired is released.
pub fn codec_object_new<O: CodecObject>(codec: &CodecHandle, args: &CodecObjectArgs) -> Result<O> {
    build(O::alloc(codec), args)
}
