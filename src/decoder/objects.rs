// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec objects owning the per-picture VA buffers: quantization matrices, bitplanes, huffman
//! tables and slices.

use bitflags::bitflags;
use byteorder::ByteOrder;
use byteorder::NativeEndian;

use crate::backend::vaapi::buffer::create_buffer;
use crate::backend::vaapi::buffer::VaBuffer;
use crate::backend::vaapi::BufferType;
use crate::backend::vaapi::Display;
use crate::backend::vaapi::Error;
use crate::backend::vaapi::Result;
use crate::backend::vaapi::VABufferID;
use crate::backend::vaapi::VAContextID;
use crate::backend::vaapi::VaError;
use crate::backend::vaapi::VA_INVALID_ID;
use crate::decoder::codec_object::codec_object_new;
use crate::decoder::codec_object::CodecHandle;
use crate::decoder::codec_object::CodecObject;
use crate::decoder::codec_object::CodecObjectArgs;
use crate::decoder::codec_object::CodecObjectBase;
use crate::decoder::codec_object::CodecObjectKind;

/// Unmaps `buffers`, hands them to the driver in one call, and destroys them.
///
/// Buffers are only destroyed once the driver accepted them. On failure they are left alive, and
/// released by their owner later on.
pub(crate) fn render_buffers(
    display: &Display,
    context: VAContextID,
    buffers: &mut [&mut VaBuffer],
) -> std::result::Result<(), VaError> {
    for buffer in buffers.iter_mut() {
        buffer.unmap()?;
    }

    let ids = buffers.iter().map(|b| b.id()).collect::<Vec<_>>();
    display.render_picture(context, &ids)?;

    for buffer in buffers.iter_mut() {
        buffer.destroy();
    }

    Ok(())
}

/// Runs `f` on the mapped contents of `buffer`.
fn with_param<T, F>(buffer: Option<&VaBuffer>, f: F) -> Result<T>
where
    F: FnOnce(&mut [u8]) -> T,
{
    let buffer = buffer
        .filter(|b| b.is_valid())
        .ok_or(Error::InvalidArgument("parameter buffer is gone"))?;

    buffer.with_data(f).map_err(|e| Error::Other(e.into()))
}

/// Codec objects owning a single, mapped parameter buffer.
macro_rules! param_buffer_object {
    ($(#[$attr:meta])* $name:ident, $kind:ident, $buffer_type:ident, $what:literal) => {
        $(#[$attr])*
        pub struct $name {
            base: CodecObjectBase,
            buffer: Option<VaBuffer>,
        }

        impl $name {
            /// Creates the object from `param_size` bytes of `param`, or zeroes if `param` is
            /// `None`.
            pub fn new(codec: &CodecHandle, param: Option<&[u8]>, param_size: usize) -> Result<Self> {
                codec_object_new(codec, &CodecObjectArgs::with_param(param, param_size))
            }

            /// ID of the VA buffer, or `VA_INVALID_ID` once it has been submitted.
            pub fn buffer_id(&self) -> VABufferID {
                self.buffer.as_ref().map(|b| b.id()).unwrap_or(VA_INVALID_ID)
            }

            /// Runs `f` on the mapped parameter struct.
            ///
            /// `f` runs with the display lock held and must not use the display, or it
            /// deadlocks.
            pub fn param_mut<T, F>(&self, f: F) -> Result<T>
            where
                F: FnOnce(&mut [u8]) -> T,
            {
                with_param(self.buffer.as_ref(), f)
            }

            /// Submits the buffer to `context` and destroys it.
            pub(crate) fn render(
                &mut self,
                context: VAContextID,
            ) -> std::result::Result<(), VaError> {
                let codec = self.base.codec();
                match self.buffer.as_mut() {
                    Some(buffer) if buffer.is_valid() => {
                        render_buffers(codec.display(), context, &mut [buffer])
                    }
                    _ => Ok(()),
                }
            }
        }

        impl CodecObject for $name {
            const KIND: CodecObjectKind = CodecObjectKind::$kind;

            fn alloc(codec: &CodecHandle) -> Self {
                Self {
                    base: CodecObjectBase::new(codec),
                    buffer: None,
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
                    return Err(Error::InvalidArgument(concat!($what, " size is zero")));
                }

                let codec = self.base.codec();
                let buffer = create_buffer(
                    codec.display(),
                    codec.context_id()?,
                    BufferType::$buffer_type,
                    args.param_size,
                    args.param,
                    1,
                    true,
                )
                .map_err(|e| Error::CreateFailed {
                    what: $what,
                    source: e,
                })?;
                self.buffer = Some(buffer);

                Ok(())
            }

            fn destroy(&mut self) {
                if let Some(mut buffer) = self.buffer.take() {
                    buffer.destroy();
                }
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.destroy();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("buffer", &self.buffer)
                    .finish()
            }
        }
    };
}

param_buffer_object!(
    /// Inverse quantization matrices of a picture.
    IqMatrix,
    IqMatrix,
    IqMatrix,
    "IQ matrix"
);
param_buffer_object!(
    /// VC-1 bitplanes of a picture.
    BitPlane,
    BitPlane,
    BitPlane,
    "bitplane"
);
param_buffer_object!(
    /// JPEG huffman tables of a picture.
    HuffmanTable,
    HuffmanTable,
    HuffmanTable,
    "huffman table"
);

bitflags! {
    /// Which part of a slice a slice data buffer holds. Values match `VA_SLICE_DATA_FLAG_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SliceDataFlags: u32 {
        /// The whole slice is in the buffer.
        const ALL = 0x00;
        const BEGIN = 0x01;
        const MIDDLE = 0x02;
        const END = 0x04;
    }
}

/// Size of the fields every slice parameter struct starts with (`VASliceParameterBufferBase`):
/// `slice_data_size`, `slice_data_offset` and `slice_data_flag`, all `u32`.
pub const SLICE_PARAM_BASE_SIZE: usize = 12;

/// One slice of a picture: its compressed data and the codec-specific parameters describing it.
pub struct Slice {
    base: CodecObjectBase,
    data: Option<VaBuffer>,
    param: Option<VaBuffer>,
}

impl Slice {
    /// Creates a slice holding `data` whole, with `param_size` bytes of parameters copied from
    /// `param`, or zeroes if `param` is `None`.
    pub fn new(
        codec: &CodecHandle,
        param: Option<&[u8]>,
        param_size: usize,
        data: &[u8],
    ) -> Result<Self> {
        codec_object_new(
            codec,
            &CodecObjectArgs {
                param,
                param_size,
                data: Some(data),
                data_size: data.len(),
                flags: 0,
            },
        )
    }

    pub fn data_buffer_id(&self) -> VABufferID {
        self.data.as_ref().map(|b| b.id()).unwrap_or(VA_INVALID_ID)
    }

    pub fn param_buffer_id(&self) -> VABufferID {
        self.param.as_ref().map(|b| b.id()).unwrap_or(VA_INVALID_ID)
    }

    /// Runs `f` on the mapped slice parameter struct. Same locking rules as
    /// [`IqMatrix::param_mut`].
    pub fn param_mut<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut [u8]) -> T,
    {
        with_param(self.param.as_ref(), f)
    }

    /// Submits the parameters and the data together to `context`, then destroys both buffers.
    pub(crate) fn render(&mut self, context: VAContextID) -> std::result::Result<(), VaError> {
        let codec = self.base.codec();
        match (self.param.as_mut(), self.data.as_mut()) {
            (Some(param), Some(data)) if param.is_valid() && data.is_valid() => {
                render_buffers(codec.display(), context, &mut [param, data])
            }
            _ => Ok(()),
        }
    }
}

impl CodecObject for Slice {
    const KIND: CodecObjectKind = CodecObjectKind::Slice;

    fn alloc(codec: &CodecHandle) -> Self {
        Self {
            base: CodecObjectBase::new(codec),
            data: None,
            param: None,
        }
    }

    fn base(&self) -> &CodecObjectBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CodecObjectBase {
        &mut self.base
    }

    fn create(&mut self, args: &CodecObjectArgs) -> Result<()> {
        if args.param_size < SLICE_PARAM_BASE_SIZE {
            return Err(Error::InvalidArgument("slice parameters are too small"));
        }
        if args.data_size == 0 {
            return Err(Error::InvalidArgument("slice has no data"));
        }
        let data_size = u32::try_from(args.data_size)
            .map_err(|_| Error::InvalidArgument("slice data is too large"))?;

        let codec = self.base.codec().clone();
        let context = codec.context_id()?;

        let data = create_buffer(
            codec.display(),
            context,
            BufferType::SliceData,
            args.data_size,
            args.data,
            1,
            false,
        )
        .map_err(|e| Error::CreateFailed {
            what: "slice data",
            source: e,
        })?;
        self.data = Some(data);

        let param = create_buffer(
            codec.display(),
            context,
            BufferType::SliceParameter,
            args.param_size,
            args.param,
            1,
            true,
        )
        .map_err(|e| Error::CreateFailed {
            what: "slice parameters",
            source: e,
        })?;

        param
            .with_data(|p| {
                NativeEndian::write_u32(&mut p[0..4], data_size);
                NativeEndian::write_u32(&mut p[4..8], 0);
                NativeEndian::write_u32(&mut p[8..12], SliceDataFlags::ALL.bits());
            })
            .map_err(|e| Error::CreateFailed {
                what: "slice parameters",
                source: e,
            })?;
        self.param = Some(param);

        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(mut param) = self.param.take() {
            param.destroy();
        }
        if let Some(mut data) = self.data.take() {
            data.destroy();
        }
    }
}

impl Drop for Slice {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slice")
            .field("data", &self.data)
            .field("param", &self.param)
            .finish()
    }
}

/// MPEG-2 context parameters used by the tests of the decoder modules.
#[cfg(test)]
pub(crate) fn test_info(width: u32, height: u32) -> crate::backend::vaapi::context::ContextInfo {
    use crate::backend::vaapi::context::ContextInfo;
    use crate::backend::vaapi::Entrypoint;
    use crate::backend::vaapi::Profile;
    use crate::Resolution;

    ContextInfo::new(
        Profile::Mpeg2Main,
        Entrypoint::Vld,
        Resolution::from((width, height)),
    )
}

/// Shared by the tests of the decoder modules.
#[cfg(test)]
pub(crate) fn test_codec() -> (
    CodecHandle,
    crate::backend::vaapi::context::Context,
    crate::backend::dummy::DummyHandle,
) {
    use crate::backend::dummy::DummyDriver;
    use crate::backend::vaapi::context::Context;

    let (display, driver) = DummyDriver::new_display();
    let context = Context::new(&display, test_info(16, 16)).unwrap();
    driver.clear_calls();

    (CodecHandle::new(&context), context, driver)
}
