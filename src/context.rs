//! GPU context initialization.
//!
//! A [`DeviceContext`] owns the adapter, logical device and queue that
//! every other part of the crate borrows. It is created once and passed
//! explicitly; there is no global device. The `create` constructor hides
//! the asynchronous adapter and device requests behind [`pollster`], while
//! [`DeviceContext::create_async`] can be awaited inside an existing
//! executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, error, warn};
use wgpu::{Adapter, AdapterInfo, Backends, Device, Instance, Limits, Queue};

use crate::config::{ContextOptions, LimitsPreset};
use crate::error::{ComputeError, Result};

/// Connection to one accelerator: logical device plus its command queue.
///
/// `wgpu` handles are internally reference counted, so the context is
/// `Send + Sync` and can be lent to several dispatchers. Submission
/// through one context should still be serialized by the caller.
pub struct DeviceContext {
    /// Kept alive for the lifetime of the adapter and device.
    _instance: Instance,
    adapter: Adapter,
    device: Device,
    queue: Queue,
    info: AdapterInfo,
    limits: Limits,
    lost: Arc<OnceLock<String>>,
    live_buffers: Arc<AtomicUsize>,
}

impl DeviceContext {
    /// Create a context with [`ContextOptions::from_env`], blocking the
    /// current thread until the device is ready.
    pub fn create() -> Result<Self> {
        Self::create_with(&ContextOptions::from_env())
    }

    pub fn create_with(options: &ContextOptions) -> Result<Self> {
        pollster::block_on(Self::create_async_with(options))
    }

    /// Asynchronous form of [`Self::create`].
    pub async fn create_async() -> Result<Self> {
        Self::create_async_with(&ContextOptions::from_env()).await
    }

    /// Try each backend set in `options.backends` in order and keep the
    /// first one that yields a compute-capable device.
    pub async fn create_async_with(options: &ContextOptions) -> Result<Self> {
        let mut attempts = Vec::with_capacity(options.backends.len());
        for &backends in &options.backends {
            match Self::try_backends(backends, options).await {
                Ok(context) => return Ok(context),
                Err(reason) => {
                    debug!("backend {backends:?} unavailable: {reason}");
                    attempts.push(format!("{backends:?}: {reason}"));
                }
            }
        }
        if attempts.is_empty() {
            return Err(ComputeError::NoDeviceFound("no backends configured".into()));
        }
        Err(ComputeError::NoDeviceFound(attempts.join("; ")))
    }

    async fn try_backends(
        backends: Backends,
        options: &ContextOptions,
    ) -> std::result::Result<Self, String> {
        let instance = Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                force_fallback_adapter: options.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .map_err(|e| e.to_string())?;
        let info = adapter.get_info();

        // Downlevel adapters (WebGL2 and some GL drivers) may not run compute at all.
        let capabilities = adapter.get_downlevel_capabilities();
        if !capabilities.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            warn!("adapter '{}' ({:?}) lacks compute shader support", info.name, info.backend);
            return Err(format!("adapter '{}' does not support compute shaders", info.name));
        }

        let required_limits = match options.limits {
            LimitsPreset::Downlevel => Limits::downlevel_defaults(),
            LimitsPreset::Adapter => adapter.limits(),
        };
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some(&options.label),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| format!("failed to create device on '{}': {e}", info.name))?;

        let lost = Arc::new(OnceLock::new());
        install_device_handlers(&device, Arc::clone(&lost));
        let limits = device.limits();
        debug!(
            "selected adapter '{}' ({:?}, {:?})",
            info.name, info.backend, info.device_type
        );

        Ok(Self {
            _instance: instance,
            adapter,
            device,
            queue,
            info,
            limits,
            lost,
            live_buffers: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    /// Limits the device was created with.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Whether the device has been lost. A lost context cannot be revived.
    pub fn is_lost(&self) -> bool {
        self.lost.get().is_some()
    }

    /// Number of [`crate::DeviceBuffer`]s created from this context that are
    /// still alive.
    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        match self.lost.get() {
            Some(reason) => Err(ComputeError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn track_buffer(&self) -> BufferTicket {
        self.live_buffers.fetch_add(1, Ordering::AcqRel);
        BufferTicket(Arc::clone(&self.live_buffers))
    }

    /// Run `f` inside out-of-memory and validation error scopes.
    ///
    /// Out-of-memory becomes [`ComputeError::Allocation`]; any other device
    /// error is handed to `on_error`. A lost device wins over both.
    pub(crate) fn scoped<R>(
        &self,
        f: impl FnOnce(&Device) -> R,
        on_error: impl FnOnce(String) -> ComputeError,
    ) -> Result<R> {
        pollster::block_on(self.scoped_async(f, on_error))
    }

    pub(crate) async fn scoped_async<R>(
        &self,
        f: impl FnOnce(&Device) -> R,
        on_error: impl FnOnce(String) -> ComputeError,
    ) -> Result<R> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        // Scopes pop innermost first.
        let validation = self.device.pop_error_scope();
        let out_of_memory = self.device.pop_error_scope();
        let validation = validation.await;
        let out_of_memory = out_of_memory.await;

        self.ensure_alive()?;
        match out_of_memory.or(validation) {
            None => Ok(value),
            Some(err @ wgpu::Error::OutOfMemory { .. }) => {
                Err(ComputeError::Allocation(err.to_string()))
            }
            Some(err) => Err(on_error(err.to_string())),
        }
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("adapter", &self.info.name)
            .field("backend", &self.info.backend)
            .field("lost", &self.is_lost())
            .field("live_buffers", &self.live_buffers())
            .finish()
    }
}

/// Decrements the context's live-buffer count when dropped.
#[derive(Debug)]
pub(crate) struct BufferTicket(Arc<AtomicUsize>);

impl Drop for BufferTicket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn install_device_handlers(device: &Device, lost: Arc<OnceLock<String>>) {
    device.on_uncaptured_error(Box::new(|error| {
        error!("uncaptured device error: {error}");
    }));
    device.set_device_lost_callback(move |reason, message| {
        if matches!(reason, wgpu::DeviceLostReason::Destroyed) {
            debug!("device destroyed: {message}");
        } else {
            error!("device lost ({reason:?}): {message}");
        }
        let _ = lost.set(format!("{reason:?}: {message}"));
    });
}
