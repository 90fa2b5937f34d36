// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder outer loop.
//!
//! A [`Decoder`] holds what is common to every codec: the queue of encoded input, the queue of
//! decoded surfaces, the hardware context and the stream description. The bitstream itself is
//! handled by a [`CodecDecoder`], which builds [`picture::Picture`]s from the input and outputs
//! them. [`VaapiDecoder`] ties both together and drives the decoding.

pub mod caps;
pub mod codec_object;
pub mod objects;
pub mod picture;

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::backend::vaapi::context::Context;
use crate::backend::vaapi::context::ContextInfo;
use crate::backend::vaapi::surface::SurfaceProxy;
use crate::backend::vaapi::Display;
use crate::backend::vaapi::Error;
use crate::decoder::caps::Caps;
use crate::decoder::caps::CAPS_CODEC_DATA;
use crate::decoder::caps::CAPS_FRAMERATE;
use crate::decoder::caps::CAPS_HEIGHT;
use crate::decoder::caps::CAPS_INTERLACED;
use crate::decoder::caps::CAPS_PIXEL_ASPECT_RATIO;
use crate::decoder::caps::CAPS_WIDTH;
use crate::decoder::codec_object::CodecHandle;
use crate::Fraction;
use crate::Resolution;

/// A chunk of encoded input.
///
/// The end of the stream is marked by an empty buffer with the EOS flag set.
#[derive(Debug, Clone, Default)]
pub struct EncodedBuffer {
    data: Bytes,
    timestamp: u64,
    eos: bool,
}

impl EncodedBuffer {
    pub fn new<D: Into<Bytes>>(data: D, timestamp: u64) -> Self {
        Self {
            data: data.into(),
            timestamp,
            eos: false,
        }
    }

    /// The end of stream marker.
    pub fn eos() -> Self {
        Self {
            data: Bytes::new(),
            timestamp: 0,
            eos: true,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A view of `size` bytes of the buffer starting at `offset`, without copying.
    pub fn sub(&self, offset: usize, size: usize) -> Option<Self> {
        let end = offset.checked_add(size)?;
        if end > self.data.len() {
            return None;
        }

        Some(Self {
            data: self.data.slice(offset..end),
            timestamp: self.timestamp,
            eos: false,
        })
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no input to decode")]
    NoData,
    #[error("no free surface to decode into")]
    NoSurface,
    #[error("end of stream")]
    EndOfStream,
    #[error(transparent)]
    Backend(Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<Error> for DecodeError {
    fn from(e: Error) -> Self {
        match e {
            Error::NoSurfaceAvailable => DecodeError::NoSurface,
            e => DecodeError::Backend(e),
        }
    }
}

/// Outcome of decoding one input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// A unit of the stream has been decoded.
    Success,
    /// The buffer has been consumed but more input is needed to make progress.
    NeedMoreData,
}

/// Codec-specific part of a decoder: parses the bitstream and builds the pictures.
pub trait CodecDecoder {
    /// Decodes `buffer`, creating, decoding and outputting pictures through `decoder`.
    fn decode(
        &mut self,
        decoder: &mut Decoder,
        buffer: &EncodedBuffer,
    ) -> Result<DecodeStatus, DecodeError>;

    /// Outputs whatever the codec still holds at the end of the stream.
    fn flush(&mut self, _decoder: &mut Decoder) -> Result<(), DecodeError> {
        Ok(())
    }
}

/// Codec independent decoder state.
pub struct Decoder {
    display: Arc<Display>,
    context: Option<Context>,
    input: VecDeque<EncodedBuffer>,
    output: VecDeque<SurfaceProxy>,
    at_eos: bool,
    caps: Caps,
    picture_size: Resolution,
    framerate: Fraction,
    pixel_aspect_ratio: Fraction,
    interlaced: bool,
    codec_data: Option<Bytes>,
}

impl Decoder {
    pub fn new(display: Arc<Display>) -> Self {
        Self {
            display,
            context: None,
            input: VecDeque::new(),
            output: VecDeque::new(),
            at_eos: false,
            caps: Caps::new(),
            picture_size: Resolution::default(),
            framerate: Fraction::default(),
            pixel_aspect_ratio: Fraction::new(1, 1),
            interlaced: false,
            codec_data: None,
        }
    }

    pub fn display(&self) -> &Arc<Display> {
        &self.display
    }

    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    pub fn context_mut(&mut self) -> Option<&mut Context> {
        self.context.as_mut()
    }

    /// Handle for creating codec objects on the current context. `None` until a context has been
    /// successfully set up.
    pub fn codec_handle(&self) -> Option<CodecHandle> {
        self.context
            .as_ref()
            .filter(|c| c.is_constructed())
            .map(CodecHandle::new)
    }

    /// Queues `buffer` for decoding. `None` marks the end of the stream.
    pub fn put_buffer(&mut self, buffer: Option<EncodedBuffer>) {
        let buffer = buffer.unwrap_or_else(EncodedBuffer::eos);
        if !buffer.is_eos() {
            self.at_eos = false;
        }

        log::trace!(
            "queuing buffer: {} bytes, timestamp {}, eos {}",
            buffer.len(),
            buffer.timestamp(),
            buffer.is_eos()
        );
        self.input.push_back(buffer);
    }

    /// Puts `size` bytes of `buffer` starting at `offset` back at the head of the input queue.
    pub fn push_buffer_sub(
        &mut self,
        buffer: &EncodedBuffer,
        offset: usize,
        size: usize,
    ) -> Result<(), Error> {
        let sub = buffer
            .sub(offset, size)
            .ok_or(Error::InvalidArgument("sub-buffer out of range"))?;

        self.input.push_front(sub);
        Ok(())
    }

    fn pop_buffer(&mut self) -> Option<EncodedBuffer> {
        self.input.pop_front()
    }

    pub fn num_pending_input(&self) -> usize {
        self.input.len()
    }

    /// Queues a decoded surface for the client.
    pub fn push_output(&mut self, surface: SurfaceProxy) {
        self.output.push_back(surface);
    }

    pub fn pop_output(&mut self) -> Option<SurfaceProxy> {
        self.output.pop_front()
    }

    pub fn num_pending_output(&self) -> usize {
        self.output.len()
    }

    /// Drops all queued input and output.
    pub fn clear_buffers(&mut self) {
        self.input.clear();
        self.output.clear();
    }

    /// Makes sure a context matching `info` exists, creating or resetting it as needed.
    pub fn ensure_context(&mut self, info: ContextInfo) -> Result<(), Error> {
        self.set_picture_size(info.size);

        match self.context.as_mut() {
            Some(context) => context.reset(info),
            None => {
                self.context = Some(Context::new(&self.display, info)?);
                Ok(())
            }
        }
    }

    pub fn caps(&self) -> &Caps {
        &self.caps
    }

    /// Returns whether the stream description changed since the last call.
    pub fn take_caps_changed(&mut self) -> bool {
        self.caps.take_changed()
    }

    pub fn picture_size(&self) -> Resolution {
        self.picture_size
    }

    pub fn set_picture_size(&mut self, size: Resolution) {
        if self.picture_size == size {
            return;
        }

        log::debug!("picture size changed to {}x{}", size.width, size.height);
        self.picture_size = size;
        self.caps
            .set(CAPS_WIDTH, i32::try_from(size.width).unwrap_or(i32::MAX));
        self.caps
            .set(CAPS_HEIGHT, i32::try_from(size.height).unwrap_or(i32::MAX));
    }

    pub fn framerate(&self) -> Fraction {
        self.framerate
    }

    pub fn set_framerate(&mut self, framerate: Fraction) {
        if self.framerate == framerate {
            return;
        }

        log::debug!("framerate changed to {}", framerate);
        self.framerate = framerate;
        self.caps.set(CAPS_FRAMERATE, framerate);
    }

    pub fn pixel_aspect_ratio(&self) -> Fraction {
        self.pixel_aspect_ratio
    }

    pub fn set_pixel_aspect_ratio(&mut self, pixel_aspect_ratio: Fraction) {
        if self.pixel_aspect_ratio == pixel_aspect_ratio {
            return;
        }

        log::debug!("pixel aspect ratio changed to {}", pixel_aspect_ratio);
        self.pixel_aspect_ratio = pixel_aspect_ratio;
        self.caps.set(CAPS_PIXEL_ASPECT_RATIO, pixel_aspect_ratio);
    }

    pub fn is_interlaced(&self) -> bool {
        self.interlaced
    }

    pub fn set_interlaced(&mut self, interlaced: bool) {
        if self.interlaced == interlaced {
            return;
        }

        self.interlaced = interlaced;
        self.caps.set(CAPS_INTERLACED, interlaced);
    }

    pub fn codec_data(&self) -> Option<&Bytes> {
        self.codec_data.as_ref()
    }

    /// Sets the out-of-band codec configuration (e.g. avcC).
    pub fn set_codec_data(&mut self, codec_data: Option<Bytes>) {
        if self.codec_data == codec_data {
            return;
        }

        match &codec_data {
            Some(data) => self.caps.set(CAPS_CODEC_DATA, data.clone()),
            None => self.caps.remove(CAPS_CODEC_DATA).is_some(),
        };
        self.codec_data = codec_data;
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        // Queued surfaces go back to the pool before the context goes away.
        self.clear_buffers();
        self.context.take();
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("context", &self.context)
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .field("at_eos", &self.at_eos)
            .field("caps", &self.caps)
            .finish()
    }
}

/// A decoder for the codec implemented by `C`.
pub struct VaapiDecoder<C: CodecDecoder> {
    // Declared first so the pictures held by the codec are released before the context.
    codec: C,
    decoder: Decoder,
}

impl<C: CodecDecoder> VaapiDecoder<C> {
    pub fn new(display: Arc<Display>, codec: C) -> Self {
        Self {
            codec,
            decoder: Decoder::new(display),
        }
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut Decoder {
        &mut self.decoder
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn codec_mut(&mut self) -> &mut C {
        &mut self.codec
    }

    /// Queues `buffer` for decoding. `None` marks the end of the stream.
    pub fn put_buffer(&mut self, buffer: Option<EncodedBuffer>) {
        self.decoder.put_buffer(buffer)
    }

    /// Decodes input until the codec made progress.
    ///
    /// Fails with [`DecodeError::NoSurface`] without consuming input if every surface is in use,
    /// with [`DecodeError::NoData`] if the input queue ran dry, and with
    /// [`DecodeError::EndOfStream`] once the end of the stream has been reached.
    ///
    /// If the last context reset failed, fails with [`Error::NoContext`] without consuming input
    /// until [`Decoder::ensure_context`] succeeds.
    pub fn decode_step(&mut self) -> Result<(), DecodeError> {
        if let Some(context) = self.decoder.context() {
            if !context.is_constructed() {
                return Err(DecodeError::Backend(Error::NoContext));
            }
            if context.surface_count() == 0 {
                return Err(DecodeError::NoSurface);
            }
        }

        loop {
            let buffer = match self.decoder.pop_buffer() {
                Some(buffer) => buffer,
                None if self.decoder.at_eos => return Err(DecodeError::EndOfStream),
                None => return Err(DecodeError::NoData),
            };

            if buffer.is_eos() {
                log::debug!("end of stream");
                self.decoder.at_eos = true;
                self.codec.flush(&mut self.decoder)?;
                return Err(DecodeError::EndOfStream);
            }

            match self.codec.decode(&mut self.decoder, &buffer)? {
                DecodeStatus::Success => return Ok(()),
                DecodeStatus::NeedMoreData => continue,
            }
        }
    }

    /// Returns the next decoded surface, decoding more input if none is ready.
    pub fn get_surface(&mut self) -> Result<SurfaceProxy, DecodeError> {
        loop {
            if let Some(surface) = self.decoder.pop_output() {
                return Ok(surface);
            }

            if let Err(e) = self.decode_step() {
                return self.decoder.pop_output().ok_or(e);
            }
        }
    }
}
