//! Bump arena over a persistently-mapped device buffer.
//!
//! An arena hands out monotonically increasing byte offsets into a single
//! host-visible buffer. There is no per-allocation free: the only way to reclaim
//! space is [`GpuArena::reset`], which per-frame arenas call once their frame
//! slot's fence has signaled. The mesh arenas are never reset.
//!
//! # Example
//!
//! ```ignore
//! let mut arena = GpuArena::new(backend, 1024 * 1024, BufferUsage::VERTEX, "vertex")?;
//! let offset = arena.push_slice(&vertices)?;
//! ```
//!
//! # Alignment
//!
//! Offsets are only as aligned as the sizes previously allocated. Callers that
//! need a stricter alignment for a given usage pad their own allocations.

use std::sync::Arc;

use crate::backend::{BufferDescriptor, BufferHandle, BufferUsage, GpuBackend};
use crate::error::{RendererError, RendererResult};

/// A bump allocator over one device buffer.
pub struct GpuArena {
    backend: Arc<dyn GpuBackend>,
    buffer: BufferHandle,
    label: &'static str,
    capacity: u64,
    bytes_used: u64,
}

impl GpuArena {
    /// Create an arena backed by a new mapped buffer of `capacity` bytes.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        capacity: u64,
        usage: BufferUsage,
        label: &'static str,
    ) -> RendererResult<Self> {
        if capacity == 0 {
            return Err(RendererError::InvalidConfig(format!(
                "{} arena capacity cannot be zero",
                label
            )));
        }

        let descriptor = BufferDescriptor::new(capacity, usage).with_label(format!("{label}_arena"));
        let buffer = backend.create_buffer(&descriptor)?;
        log::debug!("Created {} arena ({} bytes)", label, capacity);

        Ok(Self {
            backend,
            buffer,
            label,
            capacity,
            bytes_used: 0,
        })
    }

    /// Reserve `size` bytes and return their offset.
    ///
    /// On failure nothing is reserved.
    pub fn allocate(&mut self, size: u64) -> RendererResult<u64> {
        if size > self.remaining() {
            return Err(RendererError::OutOfMemory {
                arena: self.label,
                requested: size,
                available: self.remaining(),
            });
        }

        let offset = self.bytes_used;
        self.bytes_used += size;
        log::trace!("{} arena: allocated {} bytes at {}", self.label, size, offset);
        Ok(offset)
    }

    /// Allocate room for `data` and copy it in. Returns the byte offset.
    pub fn push_slice<T: bytemuck::Pod>(&mut self, data: &[T]) -> RendererResult<u64> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let offset = self.allocate(bytes.len() as u64)?;
        if let Err(e) = self.write(offset, bytes) {
            self.rewind(offset);
            return Err(e);
        }
        Ok(offset)
    }

    /// Copy `data` into an already allocated region.
    pub fn write(&self, offset: u64, data: &[u8]) -> RendererResult<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.bytes_used)
            .ok_or_else(|| {
                RendererError::InvalidHandle(format!(
                    "write of {} bytes at {} outside the {} allocated bytes of the {} arena",
                    data.len(),
                    offset,
                    self.bytes_used,
                    self.label
                ))
            })?;
        log::trace!("{} arena: writing {}..{}", self.label, offset, end);
        self.backend.write_buffer(self.buffer, offset, data)?;
        Ok(())
    }

    /// Release everything allocated at or after `offset`.
    ///
    /// Offsets past the current end are ignored.
    pub fn rewind(&mut self, offset: u64) {
        self.bytes_used = self.bytes_used.min(offset);
    }

    /// Forget every allocation.
    ///
    /// Only valid once the GPU has stopped reading the arena.
    pub fn reset(&mut self) {
        self.bytes_used = 0;
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.bytes_used
    }
}

impl Drop for GpuArena {
    fn drop(&mut self) {
        self.backend.destroy_buffer(self.buffer);
    }
}

impl std::fmt::Debug for GpuArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuArena")
            .field("label", &self.label)
            .field("capacity", &self.capacity)
            .field("bytes_used", &self.bytes_used)
            .finish()
    }
}
