// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VA buffers and the single primitive used to create them.

use std::sync::Arc;

use crate::backend::vaapi::BufferType;
use crate::backend::vaapi::Display;
use crate::backend::vaapi::VABufferID;
use crate::backend::vaapi::VAContextID;
use crate::backend::vaapi::VaError;
use crate::backend::vaapi::VaStatus;
use crate::backend::vaapi::VA_INVALID_ID;

/// A VA buffer owned by this process.
///
/// The buffer is destroyed when dropped, unless [`VaBuffer::destroy`] has already been called.
pub struct VaBuffer {
    display: Arc<Display>,
    id: VABufferID,
    buffer_type: BufferType,
    size: usize,
    mapped: bool,
}

impl VaBuffer {
    pub fn id(&self) -> VABufferID {
        self.id
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Whether the buffer still refers to a live driver object.
    pub fn is_valid(&self) -> bool {
        self.id != VA_INVALID_ID
    }

    /// Runs `f` on the mapped contents of the buffer.
    pub fn with_data<T, F>(&self, f: F) -> Result<T, VaError>
    where
        F: FnOnce(&mut [u8]) -> T,
    {
        if !self.mapped {
            return Err(VaError {
                call: "vaMapBuffer",
                status: VaStatus::InvalidBuffer,
            });
        }

        self.display.with_mapped_data(self.id, f)
    }

    /// Maps the buffer if it is not mapped yet.
    pub fn map(&mut self) -> Result<(), VaError> {
        if !self.mapped {
            self.display.map_buffer(self.id)?;
            self.mapped = true;
        }

        Ok(())
    }

    /// Unmaps the buffer if it is mapped. The driver will not read a mapped buffer.
    pub fn unmap(&mut self) -> Result<(), VaError> {
        if self.mapped {
            self.display.unmap_buffer(self.id)?;
            self.mapped = false;
        }

        Ok(())
    }

    /// Destroys the driver buffer. Does nothing if it has already been destroyed.
    pub fn destroy(&mut self) {
        if self.id == VA_INVALID_ID {
            return;
        }

        if self.mapped {
            // The error is already logged by the display.
            let _ = self.display.unmap_buffer(self.id);
            self.mapped = false;
        }

        if let Err(e) = self.display.destroy_buffer(self.id) {
            log::warn!("failed to destroy VA buffer {}: {}", self.id, e);
        }
        self.id = VA_INVALID_ID;
    }
}

impl Drop for VaBuffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for VaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaBuffer")
            .field("id", &self.id)
            .field("buffer_type", &self.buffer_type)
            .field("size", &self.size)
            .field("mapped", &self.mapped)
            .finish()
    }
}

/// Creates a VA buffer of `size` bytes, optionally filled from `data`.
///
/// `num_elements` is the number of `size`-sized elements for strided buffers and is `1`
/// otherwise. A `None` `data` lets the driver zero-initialize the buffer.
///
/// If `map` is set the buffer is mapped before being returned. A buffer that cannot be mapped is
/// destroyed and the mapping error is returned, so a caller never holds an unmapped buffer it
/// asked to be mapped.
pub fn create_buffer(
    display: &Arc<Display>,
    context: VAContextID,
    buffer_type: BufferType,
    size: usize,
    data: Option<&[u8]>,
    num_elements: u32,
    map: bool,
) -> Result<VaBuffer, VaError> {
    let id = display.create_buffer(context, buffer_type, size, num_elements, data)?;

    let mut buffer = VaBuffer {
        display: Arc::clone(display),
        id,
        buffer_type,
        size,
        mapped: false,
    };

    if map {
        // On failure `buffer` is dropped here, which destroys the driver object.
        buffer.map()?;
    }

    Ok(buffer)
}
