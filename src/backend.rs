// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared code for talking to the hardware.
//!
//! The VA driver is consumed through the [`vaapi::VaDriver`] trait and serialized by a
//! [`vaapi::Display`]. With the `vaapi` feature, `vaapi::libva_driver` implements that trait on top
//! of libva. Everything built on top of it (buffers, surfaces, contexts, overlays) lives
//! in [`vaapi`] and is independent of any particular codec.

#[cfg(test)]
pub(crate) mod dummy;
pub mod vaapi;
