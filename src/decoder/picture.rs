// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A picture being decoded: its parameter buffer, its slices, and the surface it decodes into.

use std::sync::Arc;

use bitflags::bitflags;

use crate::backend::vaapi::buffer::create_buffer;
use crate::backend::vaapi::buffer::VaBuffer;
use crate::backend::vaapi::surface::Surface;
use crate::backend::vaapi::surface::SurfaceProxy;
use crate::backend::vaapi::surface::SurfaceProxyFlags;
use crate::backend::vaapi::surface_pool::lock_pool;
use crate::backend::vaapi::BufferType;
use crate::backend::vaapi::Error;
use crate::backend::vaapi::Result;
use crate::backend::vaapi::VABufferID;
use crate::backend::vaapi::VASurfaceID;
use crate::backend::vaapi::VA_INVALID_ID;
use crate::backend::vaapi::VA_INVALID_SURFACE;
use crate::decoder::codec_object::build;
use crate::decoder::codec_object::codec_object_new;
use crate::decoder::codec_object::CodecHandle;
use crate::decoder::codec_object::CodecObject;
use crate::decoder::codec_object::CodecObjectArgs;
use crate::decoder::codec_object::CodecObjectBase;
use crate::decoder::codec_object::CodecObjectKind;
use crate::decoder::objects::render_buffers;
use crate::decoder::objects::BitPlane;
use crate::decoder::objects::HuffmanTable;
use crate::decoder::objects::IqMatrix;
use crate::decoder::objects::Slice;
use crate::decoder::Decoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureType {
    #[default]
    None,
    I,
    P,
    B,
    S,
    SI,
    SP,
    BI,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureStructure {
    #[default]
    Frame,
    TopField,
    BottomField,
}

impl PictureStructure {
    /// The other field of the frame. A frame stays a frame.
    pub fn opposite_field(self) -> Self {
        match self {
            PictureStructure::Frame => PictureStructure::Frame,
            PictureStructure::TopField => PictureStructure::BottomField,
            PictureStructure::BottomField => PictureStructure::TopField,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PictureFlags: u32 {
        /// The picture is not displayed.
        const SKIPPED = 1 << 0;
        /// The picture is used for reference.
        const REFERENCE = 1 << 1;
        /// The picture has been output.
        const OUTPUT = 1 << 2;
        const INTERLACED = 1 << 3;
        /// First field of a frame.
        const FF = 1 << 4;
        /// Top field first.
        const TFF = 1 << 5;
        /// Only one field of the frame is coded.
        const ONEFIELD = 1 << 6;
        /// Repeat first field.
        const RFF = 1 << 7;
        const CORRUPTED = 1 << 8;
    }
}

/// Flags a second field inherits from the first one.
const FIELD_FLAGS: PictureFlags = PictureFlags::SKIPPED
    .union(PictureFlags::REFERENCE)
    .union(PictureFlags::INTERLACED)
    .union(PictureFlags::FF)
    .union(PictureFlags::TFF);

/// Where a picture stands in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureState {
    /// Surface and parameter buffer are allocated, no slice yet.
    Fresh,
    SlicesAdded,
    /// Submitted to the driver.
    Decoded,
    /// Handed to the output queue of the decoder.
    Output,
}

/// One coded frame or field.
///
/// A picture takes a surface from the pool when created and exclusively owns its slices and
/// optional matrices. It shares its [`SurfaceProxy`] with the output queue once output, and with
/// its second field if it has one. Dropping a picture releases every buffer it still owns.
pub struct Picture {
    base: CodecObjectBase,
    picture_type: PictureType,
    structure: PictureStructure,
    flags: PictureFlags,
    pts: u64,
    poc: i32,
    param: Option<VaBuffer>,
    param_size: usize,
    surface: Option<Arc<Surface>>,
    proxy: Option<SurfaceProxy>,
    slices: Vec<Slice>,
    iq_matrix: Option<IqMatrix>,
    bitplane: Option<BitPlane>,
    huf_table: Option<HuffmanTable>,
    state: PictureState,
}

impl Picture {
    /// Creates a picture on a new surface, with `param_size` bytes of picture parameters copied
    /// from `param`, or zeroes if `param` is `None`.
    ///
    /// Fails with [`Error::NoSurfaceAvailable`] if every surface of the pool is in use.
    pub fn new(codec: &CodecHandle, param: Option<&[u8]>, param_size: usize) -> Result<Self> {
        codec_object_new(codec, &CodecObjectArgs::with_param(param, param_size))
    }

    /// Creates the second field of `parent`, decoded into the same surface.
    pub fn new_field(parent: &Picture) -> Result<Self> {
        let mut picture = Self::alloc(parent.base.codec());

        picture.surface = parent.surface.clone();
        picture.proxy = parent.proxy.clone();
        picture.picture_type = parent.picture_type;
        picture.pts = parent.pts;
        picture.poc = parent.poc;
        picture.flags = parent.flags & FIELD_FLAGS;
        picture.structure = parent.structure;
        if picture.flags.contains(PictureFlags::INTERLACED) {
            picture.structure = parent.structure.opposite_field();
        }
        picture.flags.remove(PictureFlags::FF);

        build(
            picture,
            &CodecObjectArgs::with_param(None, parent.param_size),
        )
    }

    pub fn picture_type(&self) -> PictureType {
        self.picture_type
    }

    pub fn set_picture_type(&mut self, picture_type: PictureType) {
        self.picture_type = picture_type;
    }

    pub fn structure(&self) -> PictureStructure {
        self.structure
    }

    pub fn set_structure(&mut self, structure: PictureStructure) {
        self.structure = structure;
    }

    pub fn flags(&self) -> PictureFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: PictureFlags) {
        self.flags |= flags;
    }

    pub fn unset_flags(&mut self, flags: PictureFlags) {
        self.flags.remove(flags);
    }

    pub fn is_skipped(&self) -> bool {
        self.flags.contains(PictureFlags::SKIPPED)
    }

    pub fn is_reference(&self) -> bool {
        self.flags.contains(PictureFlags::REFERENCE)
    }

    pub fn pts(&self) -> u64 {
        self.pts
    }

    pub fn set_pts(&mut self, pts: u64) {
        self.pts = pts;
    }

    /// Picture order count.
    pub fn poc(&self) -> i32 {
        self.poc
    }

    pub fn set_poc(&mut self, poc: i32) {
        self.poc = poc;
    }

    pub fn state(&self) -> PictureState {
        self.state
    }

    pub fn surface_id(&self) -> VASurfaceID {
        self.surface
            .as_ref()
            .map(|s| s.id())
            .unwrap_or(VA_INVALID_SURFACE)
    }

    pub fn surface_proxy(&self) -> Option<&SurfaceProxy> {
        self.proxy.as_ref()
    }

    /// ID of the picture parameter buffer, or `VA_INVALID_ID` once it has been submitted.
    pub fn param_buffer_id(&self) -> VABufferID {
        self.param.as_ref().map(|b| b.id()).unwrap_or(VA_INVALID_ID)
    }

    /// Runs `f` on the mapped picture parameter struct.
    ///
    /// `f` runs with the display lock held. It must not use the display, directly or through
    /// another codec object, or it deadlocks.
    pub fn param_mut<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut [u8]) -> T,
    {
        let param = self
            .param
            .as_ref()
            .filter(|b| b.is_valid())
            .ok_or(Error::InvalidArgument("picture has been decoded"))?;

        param.with_data(f).map_err(|e| Error::Other(e.into()))
    }

    /// Appends `slice`. Slices are submitted in the order they were added.
    pub fn add_slice(&mut self, slice: Slice) {
        self.slices.push(slice);
        if self.state == PictureState::Fresh {
            self.state = PictureState::SlicesAdded;
        }
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn iq_matrix(&self) -> Option<&IqMatrix> {
        self.iq_matrix.as_ref()
    }

    pub fn set_iq_matrix(&mut self, iq_matrix: IqMatrix) {
        self.iq_matrix = Some(iq_matrix);
    }

    pub fn bitplane(&self) -> Option<&BitPlane> {
        self.bitplane.as_ref()
    }

    pub fn set_bitplane(&mut self, bitplane: BitPlane) {
        self.bitplane = Some(bitplane);
    }

    pub fn huf_table(&self) -> Option<&HuffmanTable> {
        self.huf_table.as_ref()
    }

    pub fn set_huf_table(&mut self, huf_table: HuffmanTable) {
        self.huf_table = Some(huf_table);
    }

    /// Submits the picture to the driver.
    ///
    /// The picture parameters go first, then the matrices if any, then every slice in order. If
    /// the driver rejects anything the remaining buffers are kept until the picture is dropped,
    /// and the picture must not be decoded again.
    ///
    /// The picture is decoded with the context live at the time of the call. Fails with
    /// [`Error::NoContext`] if there is none, and with [`Error::StaleSurface`] if the surface of
    /// the picture was released by a size change since it was created.
    pub fn decode(&mut self) -> Result<()> {
        if self.state == PictureState::Decoded || self.state == PictureState::Output {
            return Err(Error::InvalidArgument("picture has already been decoded"));
        }

        let surface_id = self.surface_id();
        if surface_id == VA_INVALID_SURFACE {
            return Err(Error::NotBound);
        }

        let codec = self.base.codec().clone();
        let display = codec.display();
        let context = codec.context_id()?;

        if lock_pool(codec.surface_pool())
            .find_surface_by_id(surface_id)
            .is_none()
        {
            return Err(Error::StaleSurface(surface_id));
        }

        log::trace!(
            "decoding picture {} into surface {} ({} slices)",
            self.poc,
            surface_id,
            self.slices.len()
        );

        display
            .begin_picture(context, surface_id)
            .map_err(Error::DecodeFailed)?;

        if let Some(param) = self.param.as_mut().filter(|b| b.is_valid()) {
            render_buffers(display, context, &mut [param]).map_err(Error::DecodeFailed)?;
        }
        if let Some(iq_matrix) = self.iq_matrix.as_mut() {
            iq_matrix.render(context).map_err(Error::DecodeFailed)?;
        }
        if let Some(bitplane) = self.bitplane.as_mut() {
            bitplane.render(context).map_err(Error::DecodeFailed)?;
        }
        if let Some(huf_table) = self.huf_table.as_mut() {
            huf_table.render(context).map_err(Error::DecodeFailed)?;
        }
        for slice in self.slices.iter_mut() {
            slice.render(context).map_err(Error::DecodeFailed)?;
        }

        display.end_picture(context).map_err(Error::DecodeFailed)?;

        self.state = PictureState::Decoded;
        Ok(())
    }

    /// Queues the surface of the picture for display on `decoder`, unless the picture is
    /// skipped. The picture is marked as output in both cases.
    pub fn output(&mut self, decoder: &mut Decoder) -> Result<()> {
        let proxy = self.proxy.as_ref().ok_or(Error::NotBound)?;

        if !self.is_skipped() {
            let proxy = proxy.clone();
            proxy.set_timestamp(self.pts);

            if self.flags.contains(PictureFlags::INTERLACED) {
                let mut flags = SurfaceProxyFlags::INTERLACED;
                if self.flags.contains(PictureFlags::TFF) {
                    flags |= SurfaceProxyFlags::TFF;
                }
                if self.flags.contains(PictureFlags::RFF) {
                    flags |= SurfaceProxyFlags::RFF;
                }
                if self.flags.contains(PictureFlags::ONEFIELD) {
                    flags |= SurfaceProxyFlags::ONEFIELD;
                }
                proxy.set_flags(flags);
            }

            decoder.push_output(proxy);
        }

        self.flags |= PictureFlags::OUTPUT;
        self.state = PictureState::Output;
        Ok(())
    }
}

impl CodecObject for Picture {
    const KIND: CodecObjectKind = CodecObjectKind::Picture;

    fn alloc(codec: &CodecHandle) -> Self {
        Self {
            base: CodecObjectBase::new(codec),
            picture_type: PictureType::None,
            structure: PictureStructure::Frame,
            flags: PictureFlags::empty(),
            pts: 0,
            poc: 0,
            param: None,
            param_size: 0,
            surface: None,
            proxy: None,
            slices: Vec::new(),
            iq_matrix: None,
            bitplane: None,
            huf_table: None,
            state: PictureState::Fresh,
        }
    }

    fn base(&self) -> &CodecObjectBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CodecObjectBase {
        &mut self.base
    }

    fn create(&mut self, args: &CodecObjectArgs) -> Result<()> {
        if args.param_size == 0 {
            return Err(Error::InvalidArgument("picture parameter size is zero"));
        }

        let codec = self.base.codec().clone();

        // Fields share the surface of their first field.
        if self.surface.is_none() {
            let pool = codec.surface_pool();
            let surface = lock_pool(pool)
                .get_surface()
                .ok_or(Error::NoSurfaceAvailable)?;

            self.surface = Some(Arc::clone(&surface));
            self.proxy = Some(SurfaceProxy::new(pool, surface));
            self.structure = PictureStructure::Frame;
            self.flags |= PictureFlags::FF;
        }

        let param = create_buffer(
            codec.display(),
            codec.context_id()?,
            BufferType::PictureParameter,
            args.param_size,
            args.param,
            1,
            true,
        )
        .map_err(|e| Error::CreateFailed {
            what: "picture parameters",
            source: e,
        })?;
        self.param = Some(param);
        self.param_size = args.param_size;

        Ok(())
    }

    fn destroy(&mut self) {
        self.slices.clear();
        self.iq_matrix = None;
        self.bitplane = None;
        self.huf_table = None;

        let surface = self.surface.take();
        match self.proxy.take() {
            Some(proxy) => drop(proxy),
            // A surface without a proxy was never handed out, give it back directly.
            None => {
                if let Some(surface) = surface {
                    lock_pool(self.base.codec().surface_pool()).put_surface(surface);
                }
            }
        }

        if let Some(mut param) = self.param.take() {
            param.destroy();
        }
    }
}

impl Drop for Picture {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Picture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Picture")
            .field("picture_type", &self.picture_type)
            .field("structure", &self.structure)
            .field("flags", &self.flags)
            .field("pts", &self.pts)
            .field("poc", &self.poc)
            .field("surface", &self.surface_id())
            .field("slices", &self.slices.len())
            .field("state", &self.state)
            .finish()
    }
}
