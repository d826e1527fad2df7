//! Kernel sources, offline reflection and pipeline compilation.
//!
//! A [`KernelSource`] is WGSL text, an entry point and the roles the caller
//! assigns to the kernel's `(group, binding)` slots. [`KernelSource::reflect`]
//! parses and validates the text with `naga` without touching a device and
//! checks the declared roles against what the shader actually declares.
//! [`CompiledKernel::compile`] then checks the result against the device's
//! limits and builds the compute pipeline with an explicit binding layout.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

use log::debug;

use crate::buffer::ElementType;
use crate::context::DeviceContext;
use crate::error::{ComputeError, Diagnostic, Diagnostics, Result};

/// A `(group, binding)` coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot {
    pub group: u32,
    pub binding: u32,
}

impl Slot {
    pub const fn new(group: u32, binding: u32) -> Self {
        Self { group, binding }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@group({}) @binding({})", self.group, self.binding)
    }
}

/// Logical role of a bound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Read by the kernel; `var<storage, read>`.
    Input,
    /// Written by the kernel and read back; `var<storage, read_write>`.
    Output,
}

impl Role {
    pub const fn writes(self) -> bool {
        matches!(self, Self::Output)
    }
}

/// WGSL text plus the declared meaning of each of its binding slots.
#[derive(Debug, Clone)]
pub struct KernelSource {
    label: String,
    text: String,
    entry_point: String,
    slots: Vec<(Slot, Role)>,
}

impl KernelSource {
    pub fn new(text: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            label: "kernel".to_string(),
            text: text.into(),
            entry_point: entry_point.into(),
            slots: Vec::new(),
        }
    }

    /// The usual elementwise shape: input at `(0, 0)`, output at `(0, 1)`.
    pub fn elementwise(text: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self::new(text, entry_point).input(0, 0).output(0, 1)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn input(self, group: u32, binding: u32) -> Self {
        self.slot(Slot::new(group, binding), Role::Input)
    }

    pub fn output(self, group: u32, binding: u32) -> Self {
        self.slot(Slot::new(group, binding), Role::Output)
    }

    pub fn slot(mut self, slot: Slot, role: Role) -> Self {
        self.slots.push((slot, role));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Parse, validate and check the declared slots without a device.
    pub fn reflect(&self) -> Result<KernelLayout> {
        let module = naga::front::wgsl::parse_str(&self.text).map_err(|e| {
            ComputeError::compile(Diagnostic::new(e.message()).at(e.location(&self.text)))
        })?;
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::default(),
        );
        validator.validate(&module).map_err(|e| {
            ComputeError::compile(
                Diagnostic::new(error_chain(e.as_inner())).at(e.location(&self.text)),
            )
        })?;

        let mut diagnostics = Diagnostics::default();

        let entry = module
            .entry_points
            .iter()
            .find(|ep| ep.name == self.entry_point)
            .ok_or_else(|| {
                ComputeError::compile(Diagnostic::new(format!(
                    "entry point `{}` not found",
                    self.entry_point
                )))
            })?;
        if entry.stage != naga::ShaderStage::Compute {
            diagnostics.push(Diagnostic::new(format!(
                "entry point `{}` is a {:?} stage, not compute",
                self.entry_point, entry.stage
            )));
        }

        let (reflected, rejected) = reflect_bindings(&module, &mut diagnostics);

        let mut declared = BTreeMap::new();
        for &(slot, role) in &self.slots {
            if declared.insert(slot, role).is_some() {
                diagnostics.push(Diagnostic::new(format!("slot {slot} is declared twice")));
            }
        }

        let mut slots = Vec::with_capacity(declared.len());
        for (&slot, &role) in &declared {
            if rejected.contains(&slot) {
                continue;
            }
            let Some(binding) = reflected.get(&slot) else {
                diagnostics.push(Diagnostic::new(format!(
                    "slot {slot} is declared as {role:?} but the kernel has no storage binding there"
                )));
                continue;
            };
            if binding.writable != role.writes() {
                let expected = if role.writes() { "read_write" } else { "read" };
                diagnostics.push(Diagnostic::new(format!(
                    "{role:?} slot {slot} `{}` must be declared var<storage, {expected}>",
                    binding.display_name()
                )));
                continue;
            }
            slots.push(SlotLayout {
                slot,
                role,
                name: binding.name.clone(),
                element: binding.element,
            });
        }
        for (slot, binding) in &reflected {
            if !declared.contains_key(slot) {
                diagnostics.push(Diagnostic::new(format!(
                    "kernel binding {slot} `{}` has no declared role",
                    binding.display_name()
                )));
            }
        }

        let outputs = declared.values().filter(|role| role.writes()).count();
        if outputs != 1 {
            diagnostics.push(Diagnostic::new(format!(
                "exactly one output slot is required, {outputs} declared"
            )));
        }

        let output = slots.iter().position(|s| s.role == Role::Output);
        match output {
            Some(output) if diagnostics.is_empty() => Ok(KernelLayout {
                entry_point: self.entry_point.clone(),
                workgroup_size: entry.workgroup_size,
                slots,
                output,
            }),
            _ => Err(ComputeError::Compile { diagnostics }),
        }
    }
}

/// A storage binding found in the shader module.
struct ReflectedBinding {
    name: Option<String>,
    writable: bool,
    element: ElementType,
}

impl ReflectedBinding {
    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

fn reflect_bindings(
    module: &naga::Module,
    diagnostics: &mut Diagnostics,
) -> (BTreeMap<Slot, ReflectedBinding>, BTreeSet<Slot>) {
    let mut reflected = BTreeMap::new();
    let mut rejected = BTreeSet::new();
    for (_, var) in module.global_variables.iter() {
        let Some(binding) = &var.binding else {
            continue;
        };
        let slot = Slot::new(binding.group, binding.binding);
        let name = var.name.as_deref().unwrap_or("<unnamed>");
        let naga::AddressSpace::Storage { access } = var.space else {
            diagnostics.push(Diagnostic::new(format!(
                "binding {slot} `{name}` is in the {:?} address space; only storage buffers are supported",
                var.space
            )));
            rejected.insert(slot);
            continue;
        };
        let Some(element) = array_element(module, var.ty) else {
            diagnostics.push(Diagnostic::new(format!(
                "binding {slot} `{name}` must be a runtime-sized array of f32, u32 or i32"
            )));
            rejected.insert(slot);
            continue;
        };
        reflected.insert(
            slot,
            ReflectedBinding {
                name: var.name.clone(),
                writable: access.contains(naga::StorageAccess::STORE),
                element,
            },
        );
    }
    (reflected, rejected)
}

/// Element type of `array<T>` or of a struct whose only member is one.
fn array_element(module: &naga::Module, ty: naga::Handle<naga::Type>) -> Option<ElementType> {
    match &module.types[ty].inner {
        naga::TypeInner::Array {
            base,
            size: naga::ArraySize::Dynamic,
            ..
        } => match &module.types[*base].inner {
            naga::TypeInner::Scalar(scalar) => ElementType::from_scalar(*scalar),
            _ => None,
        },
        naga::TypeInner::Struct { members, .. } if members.len() == 1 && members[0].offset == 0 => {
            array_element(module, members[0].ty)
        }
        _ => None,
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// One declared and verified binding slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    pub slot: Slot,
    pub role: Role,
    /// Variable name in the kernel source.
    pub name: Option<String>,
    pub element: ElementType,
}

/// Device-independent result of [`KernelSource::reflect`].
///
/// Only reflection builds a layout, so it always holds exactly one output
/// slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLayout {
    pub(crate) entry_point: String,
    pub(crate) workgroup_size: [u32; 3],
    /// Sorted by slot.
    pub(crate) slots: Vec<SlotLayout>,
    /// Index of the output in `slots`.
    pub(crate) output: usize,
}

impl KernelLayout {
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    /// Every bound slot, sorted by group then binding.
    pub fn slots(&self) -> &[SlotLayout] {
        &self.slots
    }

    pub fn slot(&self, slot: Slot) -> Option<&SlotLayout> {
        self.slots.iter().find(|s| s.slot == slot)
    }

    pub fn output(&self) -> &SlotLayout {
        &self.slots[self.output]
    }

    pub fn inputs(&self) -> impl Iterator<Item = &SlotLayout> {
        self.slots.iter().filter(|s| s.role == Role::Input)
    }

    /// Number of bind groups the pipeline layout needs, gaps included.
    pub fn group_count(&self) -> u32 {
        self.slots.iter().map(|s| s.slot.group + 1).max().unwrap_or(0)
    }

    /// Check the layout against what the device can run.
    pub fn check_limits(&self, limits: &wgpu::Limits) -> Result<()> {
        let mut diagnostics = Diagnostics::default();
        let [x, y, z] = self.workgroup_size;
        for (axis, size, limit) in [
            ("x", x, limits.max_compute_workgroup_size_x),
            ("y", y, limits.max_compute_workgroup_size_y),
            ("z", z, limits.max_compute_workgroup_size_z),
        ] {
            if size > limit {
                diagnostics.push(Diagnostic::new(format!(
                    "workgroup size {size} in {axis} exceeds the device limit of {limit}"
                )));
            }
        }
        let invocations = u64::from(x) * u64::from(y) * u64::from(z);
        let max_invocations = u64::from(limits.max_compute_invocations_per_workgroup);
        if invocations > max_invocations {
            diagnostics.push(Diagnostic::new(format!(
                "{invocations} invocations per workgroup exceed the device limit of {max_invocations}"
            )));
        }
        let storage = self.slots.len() as u64;
        let max_storage = u64::from(limits.max_storage_buffers_per_shader_stage);
        if storage > max_storage {
            diagnostics.push(Diagnostic::new(format!(
                "{storage} storage buffers exceed the device limit of {max_storage}"
            )));
        }
        if self.group_count() > limits.max_bind_groups {
            diagnostics.push(Diagnostic::new(format!(
                "{} bind groups exceed the device limit of {}",
                self.group_count(),
                limits.max_bind_groups
            )));
        }
        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(ComputeError::Compile { diagnostics })
        }
    }
}

impl SlotLayout {
    fn layout_entry(&self) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding: self.slot.binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage {
                    read_only: !self.role.writes(),
                },
                has_dynamic_offset: false,
                min_binding_size: NonZeroU64::new(self.element.size() as u64),
            },
            count: None,
        }
    }
}

/// A kernel built into a compute pipeline on one device.
///
/// Cloning is cheap; one compiled kernel can back any number of
/// [`crate::KernelJob`]s.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    inner: Arc<KernelInner>,
}

#[derive(Debug)]
struct KernelInner {
    label: String,
    layout: KernelLayout,
    bind_group_layouts: Vec<wgpu::BindGroupLayout>,
    pipeline: wgpu::ComputePipeline,
}

impl CompiledKernel {
    /// Reflect `source`, check it against the device and build its pipeline.
    ///
    /// Allocates no buffers. Every failure is a [`ComputeError::Compile`]
    /// except a lost device.
    pub fn compile(context: &DeviceContext, source: &KernelSource) -> Result<Self> {
        context.ensure_alive()?;
        let layout = source.reflect()?;
        layout.check_limits(context.limits())?;

        let (bind_group_layouts, pipeline) = context.scoped(
            |device| build_pipeline(device, source, &layout),
            |message| ComputeError::compile(Diagnostic::new(message)),
        )?;
        debug!(
            "compiled kernel '{}' (entry `{}`, workgroup {:?}, {} slots)",
            source.label,
            layout.entry_point,
            layout.workgroup_size,
            layout.slots.len()
        );

        Ok(Self {
            inner: Arc::new(KernelInner {
                label: source.label.clone(),
                layout,
                bind_group_layouts,
                pipeline,
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn layout(&self) -> &KernelLayout {
        &self.inner.layout
    }

    pub(crate) fn pipeline(&self) -> &wgpu::ComputePipeline {
        &self.inner.pipeline
    }

    pub(crate) fn bind_group_layouts(&self) -> &[wgpu::BindGroupLayout] {
        &self.inner.bind_group_layouts
    }
}

fn build_pipeline(
    device: &wgpu::Device,
    source: &KernelSource,
    layout: &KernelLayout,
) -> (Vec<wgpu::BindGroupLayout>, wgpu::ComputePipeline) {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&source.label),
        source: wgpu::ShaderSource::Wgsl(source.text.as_str().into()),
    });
    let bind_group_layouts: Vec<wgpu::BindGroupLayout> = (0..layout.group_count())
        .map(|group| {
            let entries: Vec<wgpu::BindGroupLayoutEntry> = layout
                .slots
                .iter()
                .filter(|s| s.slot.group == group)
                .map(SlotLayout::layout_entry)
                .collect();
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&source.label),
                entries: &entries,
            })
        })
        .collect();
    let layout_refs: Vec<&wgpu::BindGroupLayout> = bind_group_layouts.iter().collect();
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&source.label),
        bind_group_layouts: &layout_refs,
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(&source.label),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some(&layout.entry_point),
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    });
    (bind_group_layouts, pipeline)
}
