// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VA-API decode object lifecycle management.
//!
//! This crate allocates and pools driver-backed video surfaces, binds them to a hardware decoding
//! context, builds and submits the per-picture VA buffers in protocol order, and tracks surface
//! ownership so that a surface only returns to its pool once nothing displays or references it
//! anymore.
//!
//! The [`backend`] module contains everything that talks to the VA driver (display lock, buffers,
//! surfaces, contexts, overlays, buffer proxies). The [`decoder`] module builds the codec object
//! layer (pictures, slices, matrices) and the decoder outer loop on top of it.

pub mod backend;
pub mod decoder;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Whether either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// A rectangle inside a frame, in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl From<Resolution> for Rect {
    fn from(value: Resolution) -> Self {
        Self::new(0, 0, value.width, value.height)
    }
}

/// A rational number, used for frame rates and pixel aspect ratios.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fraction {
    pub num: i32,
    pub den: i32,
}

impl Fraction {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl std::fmt::Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::vaapi::buffer_proxy::BufferProxy;
    use crate::backend::vaapi::surface::SurfaceProxy;
    use crate::backend::vaapi::Display;
    use crate::decoder::picture::Picture;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn shared_objects_are_send_and_sync() {
        assert_send_sync::<SurfaceProxy>();
        assert_send_sync::<BufferProxy>();
        assert_send_sync::<Picture>();
        assert_send_sync::<Display>();
    }
}
