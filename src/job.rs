//! Binding buffers to a compiled kernel.
//!
//! [`KernelJob::bind`] checks a set of buffers against a kernel's layout
//! before anything reaches the device, then builds the bind groups and the
//! host-visible staging buffer used for readback. A job owns its buffers
//! and can be dispatched any number of times.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::buffer::{BufferInfo, DeviceBuffer, Element, ElementType};
use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::kernel::{CompiledKernel, KernelLayout, Role, Slot};

/// Number of workgroups launched in each dimension. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extents {
    x: u32,
    y: u32,
    z: u32,
}

impl Extents {
    pub fn new(x: u32, y: u32, z: u32) -> Result<Self> {
        if x == 0 || y == 0 || z == 0 {
            return Err(ComputeError::InvalidArgument(format!(
                "dispatch extents must be at least 1 in every dimension, got ({x}, {y}, {z})"
            )));
        }
        Ok(Self { x, y, z })
    }

    pub fn linear(x: u32) -> Result<Self> {
        Self::new(x, 1, 1)
    }

    /// Enough workgroups of `workgroup_width` invocations to cover
    /// `elements`, laid out along x.
    pub fn covering(elements: usize, workgroup_width: u32) -> Result<Self> {
        if elements == 0 {
            return Err(ComputeError::InvalidArgument(
                "cannot dispatch an empty workload".into(),
            ));
        }
        let width = u64::from(workgroup_width.max(1));
        let groups = (elements as u64).div_ceil(width);
        let x = u32::try_from(groups).map_err(|_| ComputeError::DeviceLimitExceeded {
            what: "workgroups in x",
            requested: groups,
            limit: u64::from(u32::MAX),
        })?;
        Self::linear(x)
    }

    /// Spread `total_groups` over x and y so that x stays within
    /// `per_dim_limit`. Kernels must then index with
    /// `id.x + id.y * num_workgroups.x * workgroup_size.x`.
    pub fn tiled(total_groups: u32, per_dim_limit: u32) -> Result<Self> {
        if per_dim_limit == 0 {
            return Err(ComputeError::InvalidArgument(
                "per-dimension limit must be at least 1".into(),
            ));
        }
        if total_groups <= per_dim_limit {
            Self::linear(total_groups)
        } else {
            Self::new(per_dim_limit, total_groups.div_ceil(per_dim_limit), 1)
        }
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn z(&self) -> u32 {
        self.z
    }

    pub fn total_groups(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }

    /// Fail instead of clamping when any dimension is over the device limit.
    pub fn check_limits(&self, limits: &wgpu::Limits) -> Result<()> {
        let limit = limits.max_compute_workgroups_per_dimension;
        for (what, requested) in [
            ("workgroups in x", self.x),
            ("workgroups in y", self.y),
            ("workgroups in z", self.z),
        ] {
            if requested > limit {
                return Err(ComputeError::DeviceLimitExceeded {
                    what,
                    requested: u64::from(requested),
                    limit: u64::from(limit),
                });
            }
        }
        Ok(())
    }
}

/// Check buffers against a kernel layout. Touches no device state.
///
/// Every declared slot needs exactly one buffer whose element type matches
/// the kernel's array type and whose access mode allows what the kernel
/// does with it. The output slot must hold `output` elements.
pub fn check_bindings(
    layout: &KernelLayout,
    output: ElementType,
    buffers: &BTreeMap<Slot, BufferInfo>,
) -> Result<()> {
    let mut problems = Vec::new();
    for slot in &layout.slots {
        let name = slot.name.as_deref().unwrap_or("<unnamed>");
        let Some(buffer) = buffers.get(&slot.slot) else {
            problems.push(format!("no buffer bound to {} `{name}`", slot.slot));
            continue;
        };
        if buffer.host_visible {
            problems.push(format!("{} `{name}` cannot be bound to a staging buffer", slot.slot));
        }
        if buffer.element != slot.element {
            problems.push(format!(
                "{} `{name}` is array<{}>, buffer holds {}",
                slot.slot, slot.element, buffer.element
            ));
        }
        match slot.role {
            Role::Input if !buffer.access.device_reads() => problems.push(format!(
                "read-only slot {} `{name}` cannot be bound to a {:?} buffer",
                slot.slot, buffer.access
            )),
            Role::Output if !buffer.access.device_writes() => problems.push(format!(
                "output slot {} `{name}` cannot be bound to a {:?} buffer",
                slot.slot, buffer.access
            )),
            _ => {}
        }
        if slot.role == Role::Output && slot.element != output {
            problems.push(format!(
                "kernel output {} `{name}` is {}, results are read as {output}",
                slot.slot, slot.element
            ));
        }
    }
    for slot in buffers.keys() {
        if layout.slot(*slot).is_none() {
            problems.push(format!("{slot} is not declared by the kernel"));
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ComputeError::LayoutMismatch(problems.join("; ")))
    }
}

/// A compiled kernel with a buffer bound to each of its slots.
///
/// `T` is the host element type results are read back as.
pub struct KernelJob<T: Element> {
    kernel: CompiledKernel,
    buffers: BTreeMap<Slot, DeviceBuffer>,
    bind_groups: Vec<wgpu::BindGroup>,
    staging: DeviceBuffer,
    extents: Extents,
    in_flight: AtomicBool,
    _output: PhantomData<fn() -> T>,
}

impl<T: Element> KernelJob<T> {
    /// Take ownership of `buffers` and bind them to `kernel`'s slots.
    ///
    /// Extents default to one x-workgroup per `workgroup_size.x` output
    /// elements.
    pub fn bind(
        context: &DeviceContext,
        kernel: &CompiledKernel,
        buffers: BTreeMap<Slot, DeviceBuffer>,
    ) -> Result<Self> {
        context.ensure_alive()?;
        let layout = kernel.layout();
        let infos = buffers.iter().map(|(slot, b)| (*slot, b.info())).collect();
        check_bindings(layout, T::TYPE, &infos)?;

        let output_slot = layout.output().slot;
        let output = buffers.get(&output_slot).ok_or_else(|| {
            ComputeError::LayoutMismatch(format!("no buffer bound to {output_slot}"))
        })?;
        let extents = Extents::covering(output.len(), layout.workgroup_size[0])?;

        let bind_groups = context.scoped(
            |device| {
                kernel
                    .bind_group_layouts()
                    .iter()
                    .enumerate()
                    .map(|(group, group_layout)| {
                        let entries: Vec<wgpu::BindGroupEntry> = buffers
                            .iter()
                            .filter(|(slot, _)| slot.group as usize == group)
                            .map(|(slot, buffer)| wgpu::BindGroupEntry {
                                binding: slot.binding,
                                resource: buffer.raw().as_entire_binding(),
                            })
                            .collect();
                        device.create_bind_group(&wgpu::BindGroupDescriptor {
                            label: Some(kernel.label()),
                            layout: group_layout,
                            entries: &entries,
                        })
                    })
                    .collect::<Vec<_>>()
            },
            ComputeError::LayoutMismatch,
        )?;
        let staging = DeviceBuffer::staging(context, output.len(), output.element())?;
        debug!(
            "bound {} buffers to kernel '{}', extents {extents:?}",
            buffers.len(),
            kernel.label()
        );

        Ok(Self {
            kernel: kernel.clone(),
            buffers,
            bind_groups,
            staging,
            extents,
            in_flight: AtomicBool::new(false),
            _output: PhantomData,
        })
    }

    /// Replace the default extents.
    pub fn with_extents(mut self, extents: Extents) -> Self {
        self.extents = extents;
        self
    }

    pub fn extents(&self) -> Extents {
        self.extents
    }

    pub fn kernel(&self) -> &CompiledKernel {
        &self.kernel
    }

    pub fn buffer(&self, slot: Slot) -> Option<&DeviceBuffer> {
        self.buffers.get(&slot)
    }

    pub fn output(&self) -> &DeviceBuffer {
        // bind() verified the output slot is covered.
        &self.buffers[&self.kernel.layout().output().slot]
    }

    /// Number of elements a run returns.
    pub fn output_len(&self) -> usize {
        self.output().len()
    }

    /// Upload new host data into the input buffer at `slot`.
    pub fn write_input<U: Element>(
        &self,
        context: &DeviceContext,
        slot: Slot,
        data: &[U],
    ) -> Result<()> {
        let declared = self.kernel.layout().slot(slot).map(|s| s.role);
        if declared != Some(Role::Input) {
            return Err(ComputeError::InvalidArgument(format!(
                "{slot} is not an input slot of kernel '{}'",
                self.kernel.label()
            )));
        }
        let _guard = self.acquire()?;
        match self.buffers.get(&slot) {
            Some(buffer) => buffer.write(context, data),
            None => Err(ComputeError::LayoutMismatch(format!("no buffer bound to {slot}"))),
        }
    }

    pub(crate) fn bind_groups(&self) -> &[wgpu::BindGroup] {
        &self.bind_groups
    }

    pub(crate) fn staging(&self) -> &DeviceBuffer {
        &self.staging
    }

    /// Mark the job busy until the returned guard drops.
    pub(crate) fn acquire(&self) -> Result<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                ComputeError::InvalidArgument(format!(
                    "job for kernel '{}' is already being dispatched",
                    self.kernel.label()
                ))
            })?;
        Ok(InFlight(&self.in_flight))
    }
}

impl<T: Element> std::fmt::Debug for KernelJob<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelJob")
            .field("kernel", &self.kernel.label())
            .field("slots", &self.buffers.keys().collect::<Vec<_>>())
            .field("extents", &self.extents)
            .field("output", &T::TYPE)
            .finish()
    }
}

pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Access;
    use crate::kernel::KernelSource;

    const COS: &str = r#"
@group(0) @binding(0) var<storage, read> x: array<f32>;
@group(0) @binding(1) var<storage, read_write> y: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&x)) {
        y[id.x] = cos(x[id.x]);
    }
}
"#;

    fn info(access: Access) -> BufferInfo {
        BufferInfo {
            len: 5,
            element: ElementType::F32,
            access,
            host_visible: false,
        }
    }

    fn layout() -> KernelLayout {
        KernelSource::elementwise(COS, "main").reflect().unwrap()
    }

    #[test]
    fn matching_buffers_bind() {
        let buffers = BTreeMap::from([
            (Slot::new(0, 0), info(Access::ReadOnly)),
            (Slot::new(0, 1), info(Access::WriteOnly)),
        ]);
        check_bindings(&layout(), ElementType::F32, &buffers).unwrap();

        let buffers = BTreeMap::from([
            (Slot::new(0, 0), info(Access::ReadWrite)),
            (Slot::new(0, 1), info(Access::ReadWrite)),
        ]);
        check_bindings(&layout(), ElementType::F32, &buffers).unwrap();
    }

    #[test]
    fn read_only_slot_rejects_write_only_buffer() {
        let buffers = BTreeMap::from([
            (Slot::new(0, 0), info(Access::WriteOnly)),
            (Slot::new(0, 1), info(Access::WriteOnly)),
        ]);
        let err = check_bindings(&layout(), ElementType::F32, &buffers).unwrap_err();
        assert!(matches!(err, ComputeError::LayoutMismatch(ref m) if m.contains("read-only slot")));
    }

    #[test]
    fn output_slot_rejects_read_only_buffer() {
        let buffers = BTreeMap::from([
            (Slot::new(0, 0), info(Access::ReadOnly)),
            (Slot::new(0, 1), info(Access::ReadOnly)),
        ]);
        let err = check_bindings(&layout(), ElementType::F32, &buffers).unwrap_err();
        assert!(matches!(err, ComputeError::LayoutMismatch(ref m) if m.contains("output slot")));
    }

    #[test]
    fn missing_and_extra_slots_are_reported() {
        let buffers = BTreeMap::from([
            (Slot::new(0, 1), info(Access::WriteOnly)),
            (Slot::new(1, 0), info(Access::ReadOnly)),
        ]);
        let err = check_bindings(&layout(), ElementType::F32, &buffers).unwrap_err();
        let ComputeError::LayoutMismatch(message) = err else {
            panic!("expected a layout mismatch, got {err:?}");
        };
        assert!(message.contains("no buffer bound to @group(0) @binding(0) `x`"));
        assert!(message.contains("@group(1) @binding(0) is not declared"));
    }

    #[test]
    fn element_width_mismatch_is_a_layout_error() {
        let mut ints = info(Access::ReadOnly);
        ints.element = ElementType::U32;
        let buffers = BTreeMap::from([
            (Slot::new(0, 0), ints),
            (Slot::new(0, 1), info(Access::WriteOnly)),
        ]);
        assert!(check_bindings(&layout(), ElementType::F32, &buffers).is_err());

        let buffers = BTreeMap::from([
            (Slot::new(0, 0), info(Access::ReadOnly)),
            (Slot::new(0, 1), info(Access::WriteOnly)),
        ]);
        let err = check_bindings(&layout(), ElementType::I32, &buffers).unwrap_err();
        assert!(matches!(err, ComputeError::LayoutMismatch(ref m) if m.contains("read as i32")));
    }

    #[test]
    fn staging_buffers_cannot_be_bound() {
        let mut staging = info(Access::WriteOnly);
        staging.host_visible = true;
        let buffers = BTreeMap::from([
            (Slot::new(0, 0), info(Access::ReadOnly)),
            (Slot::new(0, 1), staging),
        ]);
        assert!(check_bindings(&layout(), ElementType::F32, &buffers).is_err());
    }

    #[test]
    fn extents_reject_zero() {
        assert!(matches!(
            Extents::new(4, 0, 1),
            Err(ComputeError::InvalidArgument(_))
        ));
        assert!(matches!(
            Extents::covering(0, 64),
            Err(ComputeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn covering_rounds_up() {
        assert_eq!(Extents::covering(5, 1).unwrap(), Extents::linear(5).unwrap());
        assert_eq!(Extents::covering(1028, 64).unwrap().x(), 17);
        assert_eq!(Extents::covering(64, 64).unwrap().x(), 1);
    }

    #[test]
    fn tiled_splits_over_limit() {
        let tiled = Extents::tiled(100_000, 65_535).unwrap();
        assert_eq!((tiled.x(), tiled.y(), tiled.z()), (65_535, 2, 1));
        assert!(tiled.total_groups() >= 100_000);
        assert_eq!(Extents::tiled(10, 65_535).unwrap(), Extents::linear(10).unwrap());
    }

    #[test]
    fn limits_are_not_clamped() {
        let limits = wgpu::Limits::downlevel_defaults();
        let err = Extents::linear(limits.max_compute_workgroups_per_dimension + 1)
            .unwrap()
            .check_limits(&limits)
            .unwrap_err();
        assert!(matches!(
            err,
            ComputeError::DeviceLimitExceeded { what: "workgroups in x", .. }
        ));
        Extents::new(2, 2, 2).unwrap().check_limits(&limits).unwrap();
    }
}
