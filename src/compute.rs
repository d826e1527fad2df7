//! Dispatching compiled kernels.
//!
//! A [`Dispatcher`] drives a [`KernelJob`] through one run: record the
//! pipeline, bind groups and dispatch into a command buffer, submit it,
//! copy the output into the job's staging buffer, wait for the device to
//! map that buffer and copy the bytes back to the host. Every run walks
//! `Idle -> Submitted -> DeviceRunning -> Mapping -> Ready`, or ends in
//! `Failed` with the error's kind. A requested mapping is always released
//! before a run returns, on success and on failure.
//!
//! [`run_elementwise`] wraps the whole flow for the common one-input,
//! one-output kernel and blocks until the results are back on the host.

use std::collections::BTreeMap;

use log::trace;

use crate::buffer::{Access, DeviceBuffer, Element};
use crate::context::DeviceContext;
use crate::error::{ComputeError, ErrorKind, Result};
use crate::job::KernelJob;
use crate::kernel::{CompiledKernel, KernelSource, Slot};
use crate::readback::PendingResult;

/// Where a dispatcher is in its current (or last) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    /// Commands are on the queue.
    Submitted,
    /// The output mapping has been requested; the device may still be busy.
    DeviceRunning,
    /// The device signalled the mapping; bytes are being copied out.
    Mapping,
    /// Results were copied out and the staging buffer unmapped.
    Ready,
    Failed(ErrorKind),
}

/// Runs jobs against one context, one at a time.
///
/// Taking `&mut self` for every run is what serializes submission through a
/// dispatcher: a run completes, unmap included, before the next can start.
#[derive(Debug)]
pub struct Dispatcher<'ctx> {
    context: &'ctx DeviceContext,
    state: DispatchState,
}

impl<'ctx> Dispatcher<'ctx> {
    pub fn new(context: &'ctx DeviceContext) -> Self {
        Self {
            context,
            state: DispatchState::Idle,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn context(&self) -> &'ctx DeviceContext {
        self.context
    }

    /// Run `job` and return its output, blocking the current thread.
    pub fn run<T: Element>(&mut self, job: &KernelJob<T>) -> Result<Vec<T>> {
        pollster::block_on(self.run_async(job))
    }

    /// Run `job` and return its output once the device has finished.
    pub async fn run_async<T: Element>(&mut self, job: &KernelJob<T>) -> Result<Vec<T>> {
        self.state = DispatchState::Idle;
        let result = self.dispatch(job).await;
        self.settle(result)
    }

    /// Copy any kernel-visible buffer back to the host.
    pub fn download<T: Element>(&mut self, buffer: &DeviceBuffer) -> Result<Vec<T>> {
        pollster::block_on(self.download_async(buffer))
    }

    pub async fn download_async<T: Element>(&mut self, buffer: &DeviceBuffer) -> Result<Vec<T>> {
        self.state = DispatchState::Idle;
        let result = self.copy_out(buffer).await;
        self.settle(result)
    }

    async fn dispatch<T: Element>(&mut self, job: &KernelJob<T>) -> Result<Vec<T>> {
        let context = self.context;
        context.ensure_alive()?;
        let _in_flight = job.acquire()?;
        let extents = job.extents();
        extents.check_limits(context.limits())?;

        let kernel = job.kernel();
        let output = job.output();
        let staging = job.staging();
        context
            .scoped_async(
                |device| {
                    let mut encoder =
                        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some(kernel.label()),
                        });
                    {
                        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                            label: Some(kernel.label()),
                            timestamp_writes: None,
                        });
                        cpass.set_pipeline(kernel.pipeline());
                        for (group, bind_group) in job.bind_groups().iter().enumerate() {
                            cpass.set_bind_group(group as u32, bind_group, &[]);
                        }
                        cpass.dispatch_workgroups(extents.x(), extents.y(), extents.z());
                    }
                    encoder.copy_buffer_to_buffer(
                        output.raw(),
                        0,
                        staging.raw(),
                        0,
                        output.byte_len(),
                    );
                    context.queue().submit([encoder.finish()]);
                },
                submission_error,
            )
            .await?;
        self.transition(DispatchState::Submitted);

        self.read_back(staging).await
    }

    async fn copy_out<T: Element>(&mut self, buffer: &DeviceBuffer) -> Result<Vec<T>> {
        let context = self.context;
        context.ensure_alive()?;
        if buffer.is_host_visible() {
            return Err(ComputeError::InvalidArgument(
                "staging buffers are read through their job".into(),
            ));
        }
        if T::TYPE != buffer.element() {
            return Err(ComputeError::LayoutMismatch(format!(
                "buffer holds {}, read as {}",
                buffer.element(),
                T::TYPE
            )));
        }

        let staging = DeviceBuffer::staging(context, buffer.len(), buffer.element())?;
        context
            .scoped_async(
                |device| {
                    let mut encoder =
                        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some("download"),
                        });
                    encoder.copy_buffer_to_buffer(
                        buffer.raw(),
                        0,
                        staging.raw(),
                        0,
                        buffer.byte_len(),
                    );
                    context.queue().submit([encoder.finish()]);
                },
                submission_error,
            )
            .await?;
        self.transition(DispatchState::Submitted);

        self.read_back(&staging).await
    }

    async fn read_back<T: Element>(&mut self, staging: &DeviceBuffer) -> Result<Vec<T>> {
        let mut pending = PendingResult::request(staging)?;
        self.transition(DispatchState::DeviceRunning);
        pending.ready(self.context).await?;
        self.transition(DispatchState::Mapping);
        let values = pending.read::<T>()?;
        self.transition(DispatchState::Ready);
        Ok(values)
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.transition(DispatchState::Failed(e.kind()));
        }
        result
    }

    fn transition(&mut self, next: DispatchState) {
        trace!("dispatch state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// A device validation error raised while recording or submitting work
/// means the bound buffers do not fit the commands that use them.
fn submission_error(message: String) -> ComputeError {
    ComputeError::LayoutMismatch(format!("rejected at submission: {message}"))
}

/// Apply an elementwise kernel to `input` and return the results.
///
/// The kernel reads `var<storage, read>` at `@group(0) @binding(0)` and
/// writes `var<storage, read_write>` at `@group(0) @binding(1)`. Its
/// workgroup size is read from the source, and enough workgroups are
/// dispatched to cover every element; the kernel should guard against
/// out-of-bounds indices when the length is not a multiple of it.
pub fn run_elementwise<T: Element>(
    context: &DeviceContext,
    shader_source: &str,
    entry_point: &str,
    input: &[T],
) -> Result<Vec<T>> {
    if input.is_empty() {
        return Err(ComputeError::InvalidArgument(
            "input slice must not be empty".into(),
        ));
    }
    let source = KernelSource::elementwise(shader_source, entry_point).with_label(entry_point);
    let kernel = CompiledKernel::compile(context, &source)?;
    let x = DeviceBuffer::allocate_input(context, input, Access::ReadOnly)?;
    let y = DeviceBuffer::allocate_output::<T>(context, input.len(), Access::WriteOnly)?;
    let job = KernelJob::<T>::bind(
        context,
        &kernel,
        BTreeMap::from([(Slot::new(0, 0), x), (Slot::new(0, 1), y)]),
    )?;
    Dispatcher::new(context).run(&job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_errors_are_layout_mismatches() {
        let err = submission_error("copy source lacks COPY_SRC".into());
        assert_eq!(err.kind(), ErrorKind::LayoutMismatch);
        assert!(err.to_string().contains("copy source lacks COPY_SRC"));
    }
}
