//! Host readback of mapped buffers.
//!
//! [`PendingResult`] tracks one map request on a host-visible buffer from
//! the moment it is issued until its bytes have been copied out. Dropping
//! it unmaps the buffer whenever a mapping was requested and did not fail,
//! so early returns and cancelled futures never leave a buffer mapped.

use futures::channel::oneshot;
use log::trace;

use crate::buffer::{bytes_to_vec, DeviceBuffer, Element};
use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};

type MapOutcome = std::result::Result<(), wgpu::BufferAsyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    Requested,
    Ready,
    Failed,
}

/// An in-flight or completed host mapping of a staging buffer.
#[derive(Debug)]
pub(crate) struct PendingResult<'a> {
    buffer: &'a DeviceBuffer,
    receiver: oneshot::Receiver<MapOutcome>,
    state: MapState,
}

impl<'a> PendingResult<'a> {
    /// Ask the device to map `buffer` for reading once pending work is done.
    pub(crate) fn request(buffer: &'a DeviceBuffer) -> Result<Self> {
        if !buffer.is_host_visible() {
            return Err(ComputeError::InvalidArgument(
                "only staging buffers can be mapped".into(),
            ));
        }
        let (sender, receiver) = oneshot::channel();
        buffer
            .raw()
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |outcome| {
                let _ = sender.send(outcome);
            });
        Ok(Self {
            buffer,
            receiver,
            state: MapState::Requested,
        })
    }

    #[cfg(test)]
    fn is_ready(&self) -> bool {
        self.state == MapState::Ready
    }

    /// Wait until the device signals that the mapping completed.
    ///
    /// This is the only suspension point of a dispatch. There is no
    /// timeout; callers that must stay responsive should run it off their
    /// main thread.
    pub(crate) async fn ready(&mut self, context: &DeviceContext) -> Result<()> {
        if let Err(e) = context.device().poll(wgpu::PollType::Wait) {
            context.ensure_alive()?;
            return Err(ComputeError::MapFailed(format!("device poll failed: {e}")));
        }
        match (&mut self.receiver).await {
            Ok(Ok(())) => {
                self.state = MapState::Ready;
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = MapState::Failed;
                context.ensure_alive()?;
                Err(ComputeError::MapFailed(e.to_string()))
            }
            Err(_) => {
                self.state = MapState::Failed;
                context.ensure_alive()?;
                Err(ComputeError::MapFailed(
                    "map callback dropped before completing".into(),
                ))
            }
        }
    }

    /// Copy the mapped bytes out as `T`. The buffer is unmapped afterwards,
    /// whether or not the reinterpretation succeeds.
    pub(crate) fn read<T: Element>(self) -> Result<Vec<T>> {
        if self.state != MapState::Ready {
            return Err(ComputeError::MapFailed("mapping is not ready".into()));
        }
        if T::TYPE != self.buffer.element() {
            return Err(ComputeError::LayoutMismatch(format!(
                "buffer holds {}, read as {}",
                self.buffer.element(),
                T::TYPE
            )));
        }
        let slice = self.buffer.raw().slice(..);
        let view = slice.get_mapped_range();
        let values = bytes_to_vec::<T>(&view);
        // The view must be gone before Drop unmaps.
        drop(view);
        values
    }
}

impl Drop for PendingResult<'_> {
    fn drop(&mut self) {
        if self.state != MapState::Failed {
            // Unmapping a still-pending request aborts it.
            self.buffer.raw().unmap();
            trace!("unmapped staging buffer ({:?})", self.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ElementType;

    // Mapping a buffer that is still mapped fails, so a successful second
    // map shows the first one was released.
    fn remap(context: &DeviceContext, staging: &DeviceBuffer) -> Result<Vec<f32>> {
        let mut pending = PendingResult::request(staging)?;
        pollster::block_on(pending.ready(context))?;
        pending.read::<f32>()
    }

    #[test]
    #[ignore] // Requires GPU
    fn failed_read_still_unmaps() {
        let context = DeviceContext::create().unwrap();
        let staging = DeviceBuffer::staging(&context, 4, ElementType::F32).unwrap();

        let mut pending = PendingResult::request(&staging).unwrap();
        assert!(!pending.is_ready());
        pollster::block_on(pending.ready(&context)).unwrap();
        assert!(pending.is_ready());
        let err = pending.read::<u32>().unwrap_err();
        assert!(matches!(err, ComputeError::LayoutMismatch(_)), "{err}");

        assert_eq!(remap(&context, &staging).unwrap(), vec![0.0; 4]);
    }

    #[test]
    #[ignore] // Requires GPU
    fn dropping_an_unfinished_request_unmaps() {
        let context = DeviceContext::create().unwrap();
        let staging = DeviceBuffer::staging(&context, 4, ElementType::F32).unwrap();

        drop(PendingResult::request(&staging).unwrap());
        assert_eq!(remap(&context, &staging).unwrap(), vec![0.0; 4]);
    }

    #[test]
    #[ignore] // Requires GPU
    fn only_staging_buffers_can_be_mapped() {
        let context = DeviceContext::create().unwrap();
        let buffer =
            DeviceBuffer::allocate_output::<f32>(&context, 4, crate::Access::WriteOnly).unwrap();
        let err = PendingResult::request(&buffer).unwrap_err();
        assert!(matches!(err, ComputeError::InvalidArgument(_)), "{err}");
    }
}
