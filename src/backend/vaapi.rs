// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VAAPI backend: driver-facing types and the objects built directly on top of them.

use enumn::N;
use thiserror::Error;

pub mod buffer;
pub mod buffer_proxy;
pub mod context;
pub mod display;
pub mod image;
#[cfg(feature = "vaapi")]
pub mod libva_driver;
pub mod overlay;
pub mod surface;
pub mod surface_pool;

pub use display::Display;
pub use display::VaDriver;

#[cfg(feature = "vaapi")]
pub use libva::constants::VA_FOURCC_NV12;
#[cfg(feature = "vaapi")]
pub use libva::constants::VA_INVALID_ID;
#[cfg(feature = "vaapi")]
pub use libva::constants::VA_INVALID_SURFACE;
#[cfg(feature = "vaapi")]
pub use libva::constants::VA_RT_FORMAT_YUV420;
#[cfg(feature = "vaapi")]
pub use libva::constants::VA_RT_FORMAT_YUV420_10;
#[cfg(feature = "vaapi")]
pub use libva::constants::VA_RT_FORMAT_YUV420_12;
#[cfg(feature = "vaapi")]
pub use libva::constants::VA_RT_FORMAT_YUV422;
#[cfg(feature = "vaapi")]
pub use libva::constants::VA_RT_FORMAT_YUV444;
#[cfg(feature = "vaapi")]
pub use libva::VA_ATTRIB_NOT_SUPPORTED;
#[cfg(feature = "vaapi")]
pub use libva::VABufferID;
#[cfg(feature = "vaapi")]
pub use libva::VAConfigID;
#[cfg(feature = "vaapi")]
pub use libva::VAContextID;
#[cfg(feature = "vaapi")]
pub use libva::VAImageID;
#[cfg(feature = "vaapi")]
pub use libva::VASubpictureID;
#[cfg(feature = "vaapi")]
pub use libva::VASurfaceID;

/// Values of the VA headers, for builds without libva.
#[cfg(not(feature = "vaapi"))]
mod va_defs {
    #![allow(non_camel_case_types)]

    pub type VABufferID = u32;
    pub type VASurfaceID = u32;
    pub type VAContextID = u32;
    pub type VAConfigID = u32;
    pub type VAImageID = u32;
    pub type VASubpictureID = u32;

    pub const VA_INVALID_ID: u32 = 0xffff_ffff;
    pub const VA_INVALID_SURFACE: VASurfaceID = VA_INVALID_ID;

    pub const VA_RT_FORMAT_YUV420: u32 = 0x0000_0001;
    pub const VA_RT_FORMAT_YUV422: u32 = 0x0000_0002;
    pub const VA_RT_FORMAT_YUV444: u32 = 0x0000_0004;
    pub const VA_RT_FORMAT_YUV420_10: u32 = 0x0000_0100;
    pub const VA_RT_FORMAT_YUV420_12: u32 = 0x0000_1000;
    pub const VA_ATTRIB_NOT_SUPPORTED: u32 = 0x8000_0000;

    pub const VA_FOURCC_NV12: u32 = u32::from_le_bytes(*b"NV12");
}

#[cfg(not(feature = "vaapi"))]
pub use va_defs::*;

pub const VA_SURFACE_ATTRIB_MEM_TYPE_KERNEL_DRM: u32 = 0x1000_0000;
pub const VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME: u32 = 0x2000_0000;
pub const VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2: u32 = 0x4000_0000;

/// `VA_PROGRESSIVE` context creation flag.
pub const VA_PROGRESSIVE: u32 = 0x1;

pub const VA_FOURCC_BGRA: u32 = u32::from_le_bytes(*b"BGRA");

pub(crate) fn va_rt_format_to_string(va_rt_format: u32) -> String {
    String::from(match va_rt_format {
        VA_RT_FORMAT_YUV420 => "YUV420",
        VA_RT_FORMAT_YUV422 => "YUV422",
        VA_RT_FORMAT_YUV444 => "YUV444",
        VA_RT_FORMAT_YUV420_10 => "YUV420_10",
        VA_RT_FORMAT_YUV420_12 => "YUV420_12",
        other => return format!("unknown VA rt_format {}", other),
    })
}

/// Non-success VA status codes.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum VaStatus {
    OperationFailed = 0x01,
    AllocationFailed = 0x02,
    InvalidDisplay = 0x03,
    InvalidConfig = 0x04,
    InvalidContext = 0x05,
    InvalidSurface = 0x06,
    InvalidBuffer = 0x07,
    InvalidImage = 0x08,
    InvalidSubpicture = 0x09,
    AttrNotSupported = 0x0a,
    MaxNumExceeded = 0x0b,
    UnsupportedProfile = 0x0c,
    UnsupportedEntrypoint = 0x0d,
    UnsupportedRtFormat = 0x0e,
    UnsupportedBuffertype = 0x0f,
    SurfaceBusy = 0x10,
    FlagNotSupported = 0x11,
    InvalidParameter = 0x12,
    ResolutionNotSupported = 0x13,
    Unimplemented = 0x14,
    SurfaceInDisplaying = 0x15,
    InvalidImageFormat = 0x16,
    DecodingError = 0x17,
    EncodingError = 0x18,
    InvalidValue = 0x19,
    UnsupportedFilter = 0x20,
    InvalidFilterChain = 0x21,
    HwBusy = 0x22,
    UnsupportedMemoryType = 0x24,
    NotEnoughBuffer = 0x25,
    Timedout = 0x26,
    Unknown = -1,
}

impl VaStatus {
    /// Converts a raw, non-zero `VAStatus` into its enum value. Codes this crate does not know
    /// about are reported as [`VaStatus::Unknown`].
    pub fn from_raw(status: i32) -> Self {
        Self::n(status).unwrap_or(VaStatus::Unknown)
    }
}

/// A failed driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{call} failed: {status:?}")]
pub struct VaError {
    /// Name of the VA entry point that failed.
    pub call: &'static str,
    pub status: VaStatus,
}

/// Errors returned by the objects of this backend.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("memory type {0:?} has no VA equivalent")]
    UnsupportedMemoryType(buffer_proxy::MemoryType),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to create {what}")]
    CreateFailed {
        what: &'static str,
        #[source]
        source: VaError,
    },
    #[error("failed to acquire buffer handle: {0}")]
    AcquireFailed(String),
    #[error("failed to create VA context")]
    ContextCreationFailed(#[source] VaError),
    #[error("failed to allocate surface")]
    SurfaceAllocationFailed(#[source] VaError),
    #[error("failed to decode picture")]
    DecodeFailed(#[source] VaError),
    #[error("no free surface left in the pool")]
    NoSurfaceAvailable,
    #[error("picture is not bound to a surface proxy")]
    NotBound,
    #[error("the decoding context is not set up")]
    NoContext,
    #[error("surface {0} no longer belongs to the decoding context")]
    StaleSurface(VASurfaceID),
    #[error("{profile:?} cannot be decoded through {entrypoint:?}")]
    UnsupportedProfile {
        profile: Profile,
        entrypoint: Entrypoint,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// VA profiles. Values match `VAProfile`.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Profile {
    None = -1,
    Mpeg2Simple = 0,
    Mpeg2Main = 1,
    Mpeg4Simple = 2,
    Mpeg4AdvancedSimple = 3,
    Mpeg4Main = 4,
    H264Baseline = 5,
    H264Main = 6,
    H264High = 7,
    Vc1Simple = 8,
    Vc1Main = 9,
    Vc1Advanced = 10,
    H263Baseline = 11,
    JpegBaseline = 12,
    H264ConstrainedBaseline = 13,
    Vp8Version0_3 = 14,
    H264MultiviewHigh = 15,
    H264StereoHigh = 16,
    HevcMain = 17,
    HevcMain10 = 18,
    Vp9Profile0 = 19,
    Vp9Profile1 = 20,
    Vp9Profile2 = 21,
    Vp9Profile3 = 22,
}

impl Profile {
    /// Whether this profile belongs to the H.264 family.
    pub fn is_h264(&self) -> bool {
        matches!(
            self,
            Profile::H264Baseline
                | Profile::H264Main
                | Profile::H264High
                | Profile::H264ConstrainedBaseline
                | Profile::H264MultiviewHigh
                | Profile::H264StereoHigh
        )
    }
}

/// VA entrypoints. Values match `VAEntrypoint`.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Entrypoint {
    Vld = 1,
    Izz = 2,
    Idct = 3,
    MoComp = 4,
    Deblocking = 5,
    EncSlice = 6,
    EncPicture = 7,
    EncSliceLp = 8,
    VideoProc = 10,
}

/// VA buffer types. Values match `VABufferType`.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BufferType {
    PictureParameter = 0,
    IqMatrix = 1,
    BitPlane = 2,
    SliceGroupMap = 3,
    SliceParameter = 4,
    SliceData = 5,
    MacroblockParameter = 6,
    ResidualData = 7,
    DeblockingParameter = 8,
    Image = 9,
    ProtectedSliceData = 10,
    QMatrix = 11,
    HuffmanTable = 12,
    Probability = 13,
}

/// Config attribute types. Values match `VAConfigAttribType`.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ConfigAttribType {
    RtFormat = 0,
    SpatialResidual = 1,
    SpatialClipping = 2,
    IntraResidual = 3,
    Encryption = 4,
    RateControl = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigAttrib {
    pub attrib_type: ConfigAttribType,
    pub value: u32,
}

/// Status of a surface, as reported by `vaQuerySurfaceStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    Rendering,
    Displaying,
    Ready,
    Skipped,
}

/// Description of an image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFormat {
    pub fourcc: u32,
    pub bits_per_pixel: u32,
}

/// A driver-side image, as returned by `vaCreateImage` or `vaDeriveImage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VAImage {
    pub image_id: VAImageID,
    pub format: ImageFormat,
    /// Buffer holding the pixels of the image.
    pub buf: VABufferID,
    pub width: u32,
    pub height: u32,
    pub data_size: u32,
    pub num_planes: u32,
    pub pitches: [u32; 3],
    pub offsets: [u32; 3],
}

/// Information about an exported buffer handle, as returned by `vaAcquireBufferHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub handle: usize,
    pub mem_type: u32,
    pub mem_size: usize,
}
