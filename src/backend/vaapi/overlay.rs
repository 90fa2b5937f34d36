// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Binding of overlay compositions (subtitles, graphics) to the surfaces of a context.
//!
//! Every rectangle of a composition becomes a subpicture associated with all the surfaces of the
//! pool, so whatever surface is displayed next carries the overlay. The set of bound rectangles
//! is double-buffered: a new composition is built into the idle generation and only becomes
//! current once it has been associated.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use bitflags::bitflags;
use bytes::Bytes;

use crate::backend::vaapi::image::Image;
use crate::backend::vaapi::image::Subpicture;
use crate::backend::vaapi::image::SubpictureFlags;
use crate::backend::vaapi::Display;
use crate::backend::vaapi::Error;
use crate::backend::vaapi::ImageFormat;
use crate::backend::vaapi::Result;
use crate::backend::vaapi::VASurfaceID;
use crate::backend::vaapi::VA_FOURCC_BGRA;
use crate::Rect;
use crate::Resolution;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OverlayFlags: u32 {
        /// The pixels have their color components multiplied by alpha.
        const PREMULTIPLIED_ALPHA = 1 << 0;
        /// A global alpha value applies on top of the per-pixel one.
        const GLOBAL_ALPHA = 1 << 1;
    }
}

/// Overlay pixels are always BGRA.
const OVERLAY_FORMAT: ImageFormat = ImageFormat {
    fourcc: VA_FOURCC_BGRA,
    bits_per_pixel: 32,
};

static NEXT_SEQNUM: AtomicU32 = AtomicU32::new(1);

fn next_seqnum() -> u32 {
    NEXT_SEQNUM.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone)]
struct OverlaySource {
    pixels: Bytes,
    size: Resolution,
    stride: usize,
    render_rect: Rect,
    global_alpha: f32,
    flags: OverlayFlags,
}

/// One rectangle of an overlay composition, as produced by the overlay source.
///
/// Rectangles are identified by their allocation: the same `Arc` in two successive compositions
/// is the same rectangle. Every mutation gives the rectangle a new sequence number.
#[derive(Debug)]
pub struct VideoOverlayRectangle {
    source: Mutex<OverlaySource>,
    seqnum: AtomicU32,
}

impl VideoOverlayRectangle {
    /// Creates a rectangle of `size` BGRA pixels laid out with `stride`, rendered at
    /// `render_rect`.
    pub fn new(
        pixels: Bytes,
        size: Resolution,
        stride: usize,
        render_rect: Rect,
        flags: OverlayFlags,
    ) -> Result<Arc<Self>> {
        check_pixels(&pixels, size, stride)?;

        Ok(Arc::new(Self {
            source: Mutex::new(OverlaySource {
                pixels,
                size,
                stride,
                render_rect,
                global_alpha: 1.0,
                flags,
            }),
            seqnum: AtomicU32::new(next_seqnum()),
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OverlaySource> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.seqnum.store(next_seqnum(), Ordering::Release);
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum.load(Ordering::Acquire)
    }

    pub fn size(&self) -> Resolution {
        self.lock().size
    }

    pub fn flags(&self) -> OverlayFlags {
        self.lock().flags
    }

    pub fn render_rectangle(&self) -> Rect {
        self.lock().render_rect
    }

    pub fn set_render_rectangle(&self, render_rect: Rect) {
        self.lock().render_rect = render_rect;
        self.touch();
    }

    pub fn global_alpha(&self) -> f32 {
        self.lock().global_alpha
    }

    pub fn set_global_alpha(&self, global_alpha: f32) {
        let mut source = self.lock();
        source.global_alpha = global_alpha;
        source.flags |= OverlayFlags::GLOBAL_ALPHA;
        drop(source);
        self.touch();
    }

    /// Replaces the pixels of the rectangle.
    pub fn set_pixels(&self, pixels: Bytes, size: Resolution, stride: usize) -> Result<()> {
        check_pixels(&pixels, size, stride)?;

        let mut source = self.lock();
        source.pixels = pixels;
        source.size = size;
        source.stride = stride;
        drop(source);
        self.touch();
        Ok(())
    }

    /// Consistent copy of the current state, with the sequence number it corresponds to.
    fn snapshot(&self) -> (OverlaySource, u32) {
        let source = self.lock();
        (source.clone(), self.seqnum())
    }
}

fn check_pixels(pixels: &Bytes, size: Resolution, stride: usize) -> Result<()> {
    if size.is_empty() {
        return Err(Error::InvalidArgument("overlay rectangle is empty"));
    }
    if stride < size.width as usize * 4 {
        return Err(Error::InvalidArgument("overlay stride is too small"));
    }
    if pixels.len() < stride * size.height as usize {
        return Err(Error::InvalidArgument("overlay pixel buffer is too small"));
    }
    Ok(())
}

/// An ordered set of overlay rectangles. The position of a rectangle is its layer.
#[derive(Debug, Default, Clone)]
pub struct OverlayComposition {
    rectangles: Vec<Arc<VideoOverlayRectangle>>,
}

impl OverlayComposition {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_rectangle(&mut self, rectangle: Arc<VideoOverlayRectangle>) {
        self.rectangles.push(rectangle);
    }

    pub fn rectangles(&self) -> &[Arc<VideoOverlayRectangle>] {
        &self.rectangles
    }

    pub fn len(&self) -> usize {
        self.rectangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rectangles.is_empty()
    }
}

impl FromIterator<Arc<VideoOverlayRectangle>> for OverlayComposition {
    fn from_iter<I: IntoIterator<Item = Arc<VideoOverlayRectangle>>>(iter: I) -> Self {
        Self {
            rectangles: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug)]
struct BindState {
    seqnum: u32,
    render_rect: Rect,
    layer: usize,
    associated: bool,
}

/// A composition rectangle bound to a subpicture.
pub struct OverlayRectangle {
    source: Arc<VideoOverlayRectangle>,
    subpicture: Mutex<Subpicture>,
    state: Mutex<BindState>,
}

impl OverlayRectangle {
    fn new(display: &Arc<Display>, source: &Arc<VideoOverlayRectangle>, layer: usize) -> Result<Self> {
        let hw_flags = display
            .has_subpicture_format(OVERLAY_FORMAT.fourcc)
            .map_err(|e| Error::CreateFailed {
                what: "subpicture",
                source: e,
            })?
            .ok_or_else(|| {
                Error::UnsupportedFormat("the driver has no BGRA subpictures".to_string())
            })?;

        let (snapshot, seqnum) = source.snapshot();

        let image = Image::new(display, OVERLAY_FORMAT, snapshot.size).map_err(|e| {
            Error::CreateFailed {
                what: "overlay image",
                source: e,
            }
        })?;
        image
            .upload(&snapshot.pixels, snapshot.stride, snapshot.size.height as usize)
            .map_err(|e| Error::CreateFailed {
                what: "overlay image",
                source: e,
            })?;

        let mut flags = SubpictureFlags::empty();
        if snapshot.flags.contains(OverlayFlags::PREMULTIPLIED_ALPHA) {
            flags |= SubpictureFlags::PREMULTIPLIED_ALPHA;
        }
        if snapshot.flags.contains(OverlayFlags::GLOBAL_ALPHA) {
            flags |= SubpictureFlags::GLOBAL_ALPHA;
        }
        // Flags the driver does not support for the format are dropped.
        flags &= hw_flags;

        let mut subpicture =
            Subpicture::new(Arc::new(image), flags).map_err(|e| Error::CreateFailed {
                what: "subpicture",
                source: e,
            })?;
        subpicture
            .set_global_alpha(snapshot.global_alpha)
            .map_err(|e| Error::CreateFailed {
                what: "subpicture",
                source: e,
            })?;

        Ok(Self {
            source: Arc::clone(source),
            subpicture: Mutex::new(subpicture),
            state: Mutex::new(BindState {
                seqnum,
                render_rect: snapshot.render_rect,
                layer,
                associated: false,
            }),
        })
    }

    fn subpicture(&self) -> std::sync::MutexGuard<'_, Subpicture> {
        self.subpicture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BindState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source(&self) -> &Arc<VideoOverlayRectangle> {
        &self.source
    }

    pub fn layer(&self) -> usize {
        self.state().layer
    }

    pub fn render_rectangle(&self) -> Rect {
        self.state().render_rect
    }

    pub fn is_associated(&self) -> bool {
        self.state().associated
    }

    /// Brings the binding up to date with the source, in place.
    ///
    /// Returns whether the rectangle needs to be associated again, i.e. whether its layer or its
    /// render rectangle changed. Fails if the pixels changed dimensions, in which case a new
    /// binding is needed.
    fn update(&self, layer: usize) -> Result<bool> {
        let mut state = self.state();
        let mut reassociate = state.layer != layer;
        state.layer = layer;

        let (snapshot, seqnum) = self.source.snapshot();
        if state.seqnum == seqnum {
            return Ok(reassociate);
        }

        let mut subpicture = self.subpicture();
        let image = Arc::clone(subpicture.image());
        if image.size() != snapshot.size {
            return Err(Error::InvalidArgument("overlay rectangle changed dimensions"));
        }

        image
            .upload(&snapshot.pixels, snapshot.stride, snapshot.size.height as usize)
            .map_err(|e| Error::CreateFailed {
                what: "overlay image",
                source: e,
            })?;
        subpicture
            .set_global_alpha(snapshot.global_alpha)
            .map_err(|e| Error::CreateFailed {
                what: "subpicture",
                source: e,
            })?;

        if state.render_rect != snapshot.render_rect {
            state.render_rect = snapshot.render_rect;
            reassociate = true;
        }
        state.seqnum = seqnum;

        Ok(reassociate)
    }

    /// Associates the subpicture with every surface of `surfaces`. Returns the number of surfaces
    /// it could be associated with.
    fn associate(&self, surfaces: &[VASurfaceID]) -> usize {
        let mut state = self.state();
        let subpicture = self.subpicture();
        let src_rect = Rect::from(subpicture.image().size());

        let count = surfaces
            .iter()
            .filter(|&&surface| {
                subpicture
                    .associate(surface, &src_rect, &state.render_rect)
                    .is_ok()
            })
            .count();

        state.associated = count > 0;
        count
    }

    /// Deassociates the subpicture from every surface of `surfaces`. Returns the number of
    /// surfaces it could be deassociated from.
    fn deassociate(&self, surfaces: &[VASurfaceID]) -> usize {
        let mut state = self.state();
        if !state.associated {
            return surfaces.len();
        }

        let subpicture = self.subpicture();
        let count = surfaces
            .iter()
            .filter(|&&surface| subpicture.deassociate(surface).is_ok())
            .count();

        state.associated = false;
        count
    }
}

impl std::fmt::Debug for OverlayRectangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        let subpicture = self.subpicture().id();
        f.debug_struct("OverlayRectangle")
            .field("subpicture", &subpicture)
            .field("state", &*state)
            .finish()
    }
}

/// The two generations of bound rectangles of a context.
#[derive(Debug, Default)]
pub(crate) struct OverlayState {
    generations: [Vec<Arc<OverlayRectangle>>; 2],
    /// Selects the current generation.
    current: bool,
}

impl OverlayState {
    fn current_index(&self) -> usize {
        usize::from(self.current)
    }

    pub(crate) fn current(&self) -> &[Arc<OverlayRectangle>] {
        &self.generations[self.current_index()]
    }

    pub(crate) fn is_cleared(&self) -> bool {
        self.generations.iter().all(Vec::is_empty) && !self.current
    }

    pub(crate) fn clear(&mut self) {
        for generation in self.generations.iter_mut() {
            generation.clear();
        }
        self.current = false;
    }

    /// Binds `composition` to `surfaces`, or unbinds everything if it is `None`.
    pub(crate) fn apply(
        &mut self,
        display: &Arc<Display>,
        surfaces: &[VASurfaceID],
        composition: Option<&OverlayComposition>,
    ) -> Result<()> {
        let composition = match composition {
            Some(composition) => composition,
            None => {
                self.clear();
                return Ok(());
            }
        };

        let cur = self.current_index();
        let next = cur ^ 1;
        self.generations[next].clear();

        let mut reassociate = composition.len() != self.generations[cur].len();

        for (layer, source) in composition.rectangles().iter().enumerate() {
            let reused = self.generations[cur]
                .iter()
                .find(|r| Arc::ptr_eq(r.source(), source))
                .and_then(|r| match r.update(layer) {
                    Ok(changed) => Some((Arc::clone(r), changed)),
                    Err(e) => {
                        log::debug!("cannot update overlay rectangle in place: {}", e);
                        None
                    }
                });

            match reused {
                Some((rectangle, changed)) => {
                    reassociate |= changed;
                    self.generations[next].push(rectangle);
                }
                None => match OverlayRectangle::new(display, source, layer) {
                    Ok(rectangle) => {
                        reassociate = true;
                        self.generations[next].push(Arc::new(rectangle));
                    }
                    Err(e) => {
                        self.clear();
                        return Err(e);
                    }
                },
            }
        }

        let mut result = Ok(());
        if reassociate {
            log::debug!(
                "re-associating {} overlay rectangles with {} surfaces",
                self.generations[next].len(),
                surfaces.len()
            );

            for rectangle in &self.generations[cur] {
                rectangle.deassociate(surfaces);
            }
            for rectangle in &self.generations[next] {
                let count = rectangle.associate(surfaces);
                if count < surfaces.len() && result.is_ok() {
                    result = Err(Error::Other(anyhow::anyhow!(
                        "overlay associated with {} of {} surfaces",
                        count,
                        surfaces.len()
                    )));
                }
            }
        }

        self.generations[cur].clear();
        self.current = !self.current;

        result
    }
}
