//! Device buffers and host element types.
//!
//! A [`DeviceBuffer`] wraps a [`wgpu::Buffer`] together with its element
//! count, element type and access mode. The byte length and access mode
//! are fixed at creation: the access mode decides which kernel slots the
//! buffer may be bound to, and the element type must match the array type
//! the kernel declares for that slot. All interactions with the GPU go
//! through a [`crate::DeviceContext`].

use bytemuck::{cast_slice, Pod};
use log::debug;
use wgpu::{Buffer, BufferDescriptor, BufferUsages};

use crate::context::{BufferTicket, DeviceContext};
use crate::error::{ComputeError, Result};

/// Scalar element types shared by host sequences and WGSL arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    U32,
    I32,
}

impl ElementType {
    /// Width in bytes. Arrays of these scalars are tightly packed.
    pub const fn size(self) -> usize {
        4
    }

    pub const fn wgsl_name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::U32 => "u32",
            Self::I32 => "i32",
        }
    }

    pub(crate) fn from_scalar(scalar: naga::Scalar) -> Option<Self> {
        match (scalar.kind, scalar.width) {
            (naga::ScalarKind::Float, 4) => Some(Self::F32),
            (naga::ScalarKind::Uint, 4) => Some(Self::U32),
            (naga::ScalarKind::Sint, 4) => Some(Self::I32),
            _ => None,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wgsl_name())
    }
}

/// Host types that can be moved to and from device arrays byte-for-byte.
pub trait Element: Pod + Send + Sync + 'static {
    const TYPE: ElementType;
}

impl Element for f32 {
    const TYPE: ElementType = ElementType::F32;
}

impl Element for u32 {
    const TYPE: ElementType = ElementType::U32;
}

impl Element for i32 {
    const TYPE: ElementType = ElementType::I32;
}

/// How a kernel may touch a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    /// Whether kernels may read the buffer.
    pub const fn device_reads(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// Whether kernels may write the buffer.
    pub const fn device_writes(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }

    fn usages(self) -> BufferUsages {
        // COPY_SRC everywhere so any buffer can be downloaded.
        let usage = BufferUsages::STORAGE | BufferUsages::COPY_SRC;
        if self.device_reads() {
            usage | BufferUsages::COPY_DST
        } else {
            usage
        }
    }
}

/// The properties of a buffer that binding checks look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub len: usize,
    pub element: ElementType,
    pub access: Access,
    pub host_visible: bool,
}

/// A region of device memory holding `len` elements of one [`ElementType`].
#[derive(Debug)]
pub struct DeviceBuffer {
    buffer: Buffer,
    len: usize,
    element: ElementType,
    access: Access,
    host_visible: bool,
    _ticket: BufferTicket,
}

impl DeviceBuffer {
    /// Allocate a buffer sized exactly to `data` and upload it.
    ///
    /// `access` must let kernels read the buffer. The upload goes through
    /// a queue write, so the buffer does not need to be mappable.
    pub fn allocate_input<T: Element>(
        context: &DeviceContext,
        data: &[T],
        access: Access,
    ) -> Result<Self> {
        context.ensure_alive()?;
        if !access.device_reads() {
            return Err(ComputeError::InvalidArgument(format!(
                "input buffers must be readable by kernels, got {access:?}"
            )));
        }
        if data.is_empty() {
            return Err(ComputeError::InvalidArgument(
                "input data must not be empty".into(),
            ));
        }
        let bytes: &[u8] = cast_slice(data);
        check_binding_size(context, bytes.len() as u64)?;

        let buffer = context.scoped(
            |device| {
                let buffer = device.create_buffer(&BufferDescriptor {
                    label: Some("input"),
                    size: bytes.len() as u64,
                    usage: access.usages(),
                    mapped_at_creation: false,
                });
                context.queue().write_buffer(&buffer, 0, bytes);
                buffer
            },
            ComputeError::Allocation,
        )?;
        debug!("allocated input buffer: {} x {}", data.len(), T::TYPE);
        Ok(Self::wrap(context, buffer, data.len(), T::TYPE, access, false))
    }

    /// Allocate an uninitialized buffer of `len` elements of `T`.
    pub fn allocate_output<T: Element>(
        context: &DeviceContext,
        len: usize,
        access: Access,
    ) -> Result<Self> {
        context.ensure_alive()?;
        if !access.device_writes() {
            return Err(ComputeError::InvalidArgument(format!(
                "output buffers must be writable by kernels, got {access:?}"
            )));
        }
        if len == 0 {
            return Err(ComputeError::InvalidArgument(
                "output length must be at least 1".into(),
            ));
        }
        let size = byte_size(len, T::TYPE)?;
        check_binding_size(context, size)?;

        let buffer = context.scoped(
            |device| {
                device.create_buffer(&BufferDescriptor {
                    label: Some("output"),
                    size,
                    usage: access.usages(),
                    mapped_at_creation: false,
                })
            },
            ComputeError::Allocation,
        )?;
        debug!("allocated output buffer: {len} x {}", T::TYPE);
        Ok(Self::wrap(context, buffer, len, T::TYPE, access, false))
    }

    /// Host-visible buffer that a kernel output is copied into for reading.
    pub(crate) fn staging(
        context: &DeviceContext,
        len: usize,
        element: ElementType,
    ) -> Result<Self> {
        let size = byte_size(len, element)?;
        check_buffer_size(context, size)?;
        let buffer = context.scoped(
            |device| {
                device.create_buffer(&BufferDescriptor {
                    label: Some("staging"),
                    size,
                    usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            },
            ComputeError::Allocation,
        )?;
        Ok(Self::wrap(context, buffer, len, element, Access::WriteOnly, true))
    }

    fn wrap(
        context: &DeviceContext,
        buffer: Buffer,
        len: usize,
        element: ElementType,
        access: Access,
        host_visible: bool,
    ) -> Self {
        Self {
            buffer,
            len,
            element,
            access,
            host_visible,
            _ticket: context.track_buffer(),
        }
    }

    /// Replace the buffer contents with `data` of identical length.
    pub fn write<T: Element>(&self, context: &DeviceContext, data: &[T]) -> Result<()> {
        context.ensure_alive()?;
        if self.host_visible || !self.access.device_reads() {
            return Err(ComputeError::InvalidArgument(format!(
                "cannot upload into a {:?} buffer",
                self.access
            )));
        }
        if T::TYPE != self.element {
            return Err(ComputeError::LayoutMismatch(format!(
                "buffer holds {}, data is {}",
                self.element,
                T::TYPE
            )));
        }
        if data.len() != self.len {
            return Err(ComputeError::InvalidArgument(format!(
                "buffer holds {} elements, data has {}",
                self.len,
                data.len()
            )));
        }
        context.queue().write_buffer(&self.buffer, 0, cast_slice(data));
        Ok(())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: empty buffers are rejected at allocation.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> u64 {
        self.buffer.size()
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Whether the host can map this buffer. Only staging buffers can.
    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    pub fn info(&self) -> BufferInfo {
        BufferInfo {
            len: self.len,
            element: self.element,
            access: self.access,
            host_visible: self.host_visible,
        }
    }

    pub fn raw(&self) -> &Buffer {
        &self.buffer
    }
}

fn byte_size(len: usize, element: ElementType) -> Result<u64> {
    len.checked_mul(element.size())
        .map(|bytes| bytes as u64)
        .ok_or_else(|| ComputeError::InvalidArgument(format!("{len} elements overflow usize")))
}

fn check_buffer_size(context: &DeviceContext, size: u64) -> Result<()> {
    let limit = context.limits().max_buffer_size;
    if size > limit {
        return Err(ComputeError::DeviceLimitExceeded {
            what: "buffer size in bytes",
            requested: size,
            limit,
        });
    }
    Ok(())
}

fn check_binding_size(context: &DeviceContext, size: u64) -> Result<()> {
    check_buffer_size(context, size)?;
    let limit = u64::from(context.limits().max_storage_buffer_binding_size);
    if size > limit {
        return Err(ComputeError::DeviceLimitExceeded {
            what: "storage binding size in bytes",
            requested: size,
            limit,
        });
    }
    Ok(())
}

/// Reinterpret mapped bytes as host elements.
pub(crate) fn bytes_to_vec<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    bytemuck::try_cast_slice::<u8, T>(bytes)
        .map(<[T]>::to_vec)
        .map_err(|e| {
            ComputeError::MapFailed(format!(
                "{} mapped bytes are not a sequence of {}: {e}",
                bytes.len(),
                T::TYPE
            ))
        })
}
