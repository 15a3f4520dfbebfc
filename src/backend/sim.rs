//! Backend running on the simulated accelerator.
//!
//! Restriction, basis and QFunction data live in device memory, and all work is launched as
//! kernels on the device stream. The builtin kernels are compiled once per backend, the
//! kernel of each QFunction once per QFunction, from the source text of its companion file.
use std::sync::Arc;

use crate::backend::{Backend, BackendSetup, BasisApply, ElemRestrictionApply, QFunctionApply};
use crate::basis::plan::{Slot, Table};
use crate::basis::Basis;
use crate::device::{
    device_fn, grid_size, Device, DeviceBuffer, DeviceFn, DevicePtr, FieldTable, Kernel, KernelArg, KernelContext,
    ProgramSource, SimDevice,
};
use crate::elem_restriction::ElemRestriction;
use crate::error::ensure_config;
use crate::qfunction::{QFunction, QFunctionKernel};
use crate::registry::BackendOptions;
use crate::vector::Vector;
use crate::{Error, EvalMode, Result, Scalar, TransposeMode};

/// Threads per block if the resource does not set `block_size`.
pub const DEFAULT_BLOCK_SIZE: usize = 64;

pub fn init(_resource: &str, options: &BackendOptions) -> Result<Option<BackendSetup>> {
    let device = SimDevice::new(options.device_id, options.memory_limit)?;
    Ok(Some(BackendSetup {
        device: Some(Arc::new(device)),
    }))
}

fn block_size(backend: &Backend) -> usize {
    backend.options().block_size.unwrap_or(DEFAULT_BLOCK_SIZE)
}

fn require_device(backend: &Backend) -> Result<&Arc<dyn Device>> {
    backend
        .device()
        .ok_or_else(|| Error::configuration(format!("backend `{}` has no device", backend.resource())))
}

const BUILTIN_SOURCE: &str = r#"
// Restriction, basis and weight kernels shared by all objects of a backend.
typedef double CeedScalar;

__global__ void gather(const int n, const int l_size, const unsigned long *indices,
                       const CeedScalar *u, CeedScalar *v) {
  const int i = blockIdx.x * blockDim.x + threadIdx.x;
  if (i < n) v[i] = indices[i] == ~0ul ? 0.0 : u[indices[i]];
}

__global__ void scatter_add(const int n, const int l_size, const unsigned long *indices,
                            const CeedScalar *u, CeedScalar *v) {
  const int i = blockIdx.x * blockDim.x + threadIdx.x;
  if (i < n && indices[i] != ~0ul) atomicAdd(&v[indices[i]], u[i]);
}

__global__ void contract(const int A, const int B, const int C, const int J, const CeedScalar *t,
                         const int transpose, const int add, const CeedScalar *u, CeedScalar *v) {
  const int i = blockIdx.x * blockDim.x + threadIdx.x;
  if (i >= A * J * C) return;
  const int a = i / (J * C), j = (i / C) % J, c = i % C;
  CeedScalar sum = add ? v[i] : 0.0;
  for (int b = 0; b < B; b++) sum += t[transpose ? b * J + j : j * B + b] * u[(a * B + b) * C + c];
  v[i] = sum;
}

__global__ void weight(const int num_elem, const int Q, const CeedScalar *w, CeedScalar *v) {
  const int i = blockIdx.x * blockDim.x + threadIdx.x;
  if (i < num_elem * Q) v[i] = w[i % Q];
}
"#;

/// Fails if a launch of `grid` blocks of `block` threads does not cover `n` threads.
fn check_coverage(context: &KernelContext<'_>, n: usize) -> std::result::Result<(), String> {
    if context.grid * context.block < n {
        return Err(format!(
            "launch of {} x {} threads does not cover {} entries",
            context.grid, context.block, n
        ));
    }
    Ok(())
}

fn required_ptr(context: &KernelContext<'_>, index: usize) -> std::result::Result<DevicePtr, String> {
    context
        .ptr_arg(index)?
        .ok_or_else(|| format!("argument {index} is a null pointer"))
}

fn index_into(index: u64, len: usize) -> std::result::Result<Option<usize>, String> {
    if index == u64::MAX {
        return Ok(None);
    }
    let index = usize::try_from(index).map_err(|_| format!("index {index} does not fit the host"))?;
    if index >= len {
        return Err(format!("index {index} out of bounds for L-vector of length {len}"));
    }
    Ok(Some(index))
}

fn gather_routine() -> DeviceFn {
    device_fn(|context| {
        let (n, l_size) = (context.int_arg(0)?, context.int_arg(1)?);
        check_coverage(context, n)?;
        let indices = context.read_indices(required_ptr(context, 2)?, n)?;
        let u = context.read_scalars(required_ptr(context, 3)?, l_size)?;
        let v = indices
            .into_iter()
            .map(|index| Ok(index_into(index, l_size)?.map_or(0.0, |l| u[l])))
            .collect::<std::result::Result<Vec<Scalar>, String>>()?;
        context.write_scalars(required_ptr(context, 4)?, &v)
    })
}

fn scatter_add_routine() -> DeviceFn {
    device_fn(|context| {
        let (n, l_size) = (context.int_arg(0)?, context.int_arg(1)?);
        check_coverage(context, n)?;
        let indices = context.read_indices(required_ptr(context, 2)?, n)?;
        let u = context.read_scalars(required_ptr(context, 3)?, n)?;
        let v_ptr = required_ptr(context, 4)?;
        let mut v = context.read_scalars(v_ptr, l_size)?;
        for (index, u_i) in indices.into_iter().zip(u) {
            if let Some(l) = index_into(index, l_size)? {
                v[l] += u_i;
            }
        }
        context.write_scalars(v_ptr, &v)
    })
}

fn contract_routine() -> DeviceFn {
    device_fn(|context| {
        let (a, b, c, j) = (
            context.int_arg(0)?,
            context.int_arg(1)?,
            context.int_arg(2)?,
            context.int_arg(3)?,
        );
        let (transpose, add) = (context.int_arg(5)? != 0, context.int_arg(6)? != 0);
        check_coverage(context, a * j * c)?;
        let t = context.read_scalars(required_ptr(context, 4)?, b * j)?;
        let u = context.read_scalars(required_ptr(context, 7)?, a * b * c)?;
        let v_ptr = required_ptr(context, 8)?;
        let mut v = if add {
            context.read_scalars(v_ptr, a * j * c)?
        } else {
            vec![0.0; a * j * c]
        };
        crate::backend::cpu::contract_host(a, b, c, j, transpose, true, &t, &u, &mut v);
        context.write_scalars(v_ptr, &v)
    })
}

fn weight_routine() -> DeviceFn {
    device_fn(|context| {
        let (num_elem, num_qpts) = (context.int_arg(0)?, context.int_arg(1)?);
        check_coverage(context, num_elem * num_qpts)?;
        let w = context.read_scalars(required_ptr(context, 2)?, num_qpts)?;
        let v: Vec<Scalar> = (0..num_elem * num_qpts).map(|i| w[i % num_qpts]).collect();
        context.write_scalars(required_ptr(context, 3)?, &v)
    })
}

/// Builtin kernels of a backend.
#[derive(Debug, Clone)]
struct Builtins {
    gather: Kernel,
    scatter_add: Kernel,
    contract: Kernel,
    weight: Kernel,
}

fn builtins(backend: &Backend) -> Result<Builtins> {
    let device = require_device(backend)?;
    let mut data = backend.data().lock();
    let builtins = data.try_get_or_insert_with(|| {
        let module = device.compile(ProgramSource {
            name: "matfree/builtin.cu".to_string(),
            text: BUILTIN_SOURCE.to_string(),
            defines: vec![("BLOCK_SIZE".to_string(), block_size(backend).to_string())],
            entry_points: vec![
                ("gather".to_string(), gather_routine()),
                ("scatter_add".to_string(), scatter_add_routine()),
                ("contract".to_string(), contract_routine()),
                ("weight".to_string(), weight_routine()),
            ],
        })?;
        Ok(Builtins {
            gather: module.get_kernel("gather")?,
            scatter_add: module.get_kernel("scatter_add")?,
            contract: module.get_kernel("contract")?,
            weight: module.get_kernel("weight")?,
        })
    })?;
    Ok(builtins.clone())
}

/// Device copies of the index tables of a restriction, one per L-vector layout.
#[derive(Debug, Default)]
struct RestrictionIndices {
    interlaced: Option<DeviceBuffer>,
    component_major: Option<DeviceBuffer>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimRestriction;

impl ElemRestrictionApply for SimRestriction {
    fn apply(
        &self,
        restriction: &ElemRestriction,
        tmode: TransposeMode,
        lmode: TransposeMode,
        u: &Vector,
        v: &Vector,
    ) -> Result<()> {
        let backend = restriction.backend();
        let device = require_device(backend)?;
        let kernels = builtins(backend)?;

        let indices = {
            let mut data = restriction.data.lock();
            let tables = data.get_or_default::<RestrictionIndices>();
            let slot = match lmode {
                TransposeMode::Transpose => &mut tables.interlaced,
                TransposeMode::NoTranspose => &mut tables.component_major,
            };
            let buffer = match slot.take() {
                Some(buffer) => buffer,
                None => DeviceBuffer::from_indices(device, &restriction.gather_indices(lmode))?,
            };
            slot.insert(buffer).ptr()
        };

        let (n, l_size) = (restriction.e_size(), restriction.l_size());
        let kernel = match tmode {
            TransposeMode::NoTranspose => &kernels.gather,
            TransposeMode::Transpose => &kernels.scatter_add,
        };
        let u = u.device_view()?;
        let v = v.device_view_mut()?;
        let block = block_size(backend);
        device.launch(
            kernel,
            grid_size(n, block),
            block,
            vec![
                KernelArg::Int(n),
                KernelArg::Int(l_size),
                KernelArg::Ptr(indices),
                KernelArg::Ptr(u.ptr()),
                KernelArg::Ptr(v.ptr()),
            ],
        )
    }
}

/// Device copies of the tables of a basis, and scratch buffers for contraction plans.
#[derive(Debug)]
struct BasisTables {
    interp: DeviceBuffer,
    grad: DeviceBuffer,
    weights: DeviceBuffer,
    scratch: Vec<DeviceBuffer>,
}

impl BasisTables {
    fn upload(basis: &Basis, device: &Arc<dyn Device>) -> Result<Self> {
        Ok(Self {
            interp: DeviceBuffer::from_scalars(device, basis.table(Table::Interp))?,
            grad: DeviceBuffer::from_scalars(device, basis.grad_tables())?,
            weights: DeviceBuffer::from_scalars(device, &basis.q_weights())?,
            scratch: Vec::new(),
        })
    }

    fn ensure_scratch(&mut self, device: &Arc<dyn Device>, len: usize) -> Result<()> {
        let bytes = len * std::mem::size_of::<Scalar>();
        if len == 0 {
            return Ok(());
        }
        if self.scratch.len() < 2 || self.scratch[0].bytes() < bytes {
            self.scratch = vec![DeviceBuffer::allocate(device, bytes)?, DeviceBuffer::allocate(device, bytes)?];
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimBasis;

impl BasisApply for SimBasis {
    fn apply(
        &self,
        basis: &Basis,
        num_elem: usize,
        tmode: TransposeMode,
        emode: EvalMode,
        u: Option<&Vector>,
        v: &Vector,
    ) -> Result<()> {
        let backend = basis.backend();
        let device = require_device(backend)?;
        let kernels = builtins(backend)?;
        let block = block_size(backend);

        let mut data = basis.data.lock();
        let tables = data.try_get_or_insert_with(|| BasisTables::upload(basis, device))?;

        if emode == EvalMode::Weight {
            let num_qpts = basis.num_quadrature_points();
            let v = v.device_view_mut()?;
            return device.launch(
                &kernels.weight,
                grid_size(num_elem * num_qpts, block),
                block,
                vec![
                    KernelArg::Int(num_elem),
                    KernelArg::Int(num_qpts),
                    KernelArg::Ptr(tables.weights.ptr()),
                    KernelArg::Ptr(v.ptr()),
                ],
            );
        }

        let u = u.ok_or_else(|| Error::usage(format!("{emode:?} requires an input vector")))?;
        let plan = basis.plan(num_elem, 1, tmode, emode)?;
        tables.ensure_scratch(device, plan.scratch_len)?;
        let u = u.device_view()?;
        let v = v.device_view_mut()?;

        for step in &plan.steps {
            let slot_ptr = |slot: Slot| match slot {
                Slot::Input(offset) => u.ptr().add_scalars(offset),
                Slot::Output(offset) => v.ptr().add_scalars(offset),
                Slot::Scratch(k) => tables.scratch[k].ptr(),
            };
            let table = match step.table {
                Table::Interp => tables.interp.ptr(),
                Table::Grad(d) => tables.grad.ptr().add_scalars(basis.grad_table_offset(d)),
            };
            device.launch(
                &kernels.contract,
                grid_size(step.dst_len(), block),
                block,
                vec![
                    KernelArg::Int(step.a),
                    KernelArg::Int(step.b),
                    KernelArg::Int(step.c),
                    KernelArg::Int(step.j),
                    KernelArg::Ptr(table),
                    KernelArg::Int(usize::from(step.transpose)),
                    KernelArg::Int(usize::from(step.add)),
                    KernelArg::Ptr(slot_ptr(step.src)),
                    KernelArg::Ptr(slot_ptr(step.dst)),
                ],
            )?;
        }
        Ok(())
    }
}

/// Compiled kernel and device context of a QFunction.
#[derive(Debug)]
struct CompiledQFunction {
    kernel: Kernel,
    context: Option<DeviceBuffer>,
    /// Version of the context last uploaded, `None` before the first upload.
    context_version: Option<u64>,
}

/// Host routine of a QFunction entry point.
///
/// Each block of threads stages its points into `[comp][point]` arrays, runs the kernel on
/// them and writes the outputs back.
fn qfunction_routine(kernel: QFunctionKernel, entry: String, in_sizes: Vec<usize>, out_sizes: Vec<usize>) -> DeviceFn {
    device_fn(move |launch| {
        let context = match launch.ptr_arg(0)? {
            Some(ptr) => launch.read_bytes(ptr, launch.int_arg(1)?)?,
            None => Vec::new(),
        };
        let q = launch.int_arg(2)?;
        let fields = launch.fields_arg(3)?;
        check_coverage(launch, q)?;

        for start in (0..q).step_by(launch.block.max(1)) {
            let n = launch.block.min(q - start);
            let mut inputs = Vec::with_capacity(in_sizes.len());
            for (i, &size) in in_sizes.iter().enumerate() {
                let ptr = fields.inputs[i].ok_or_else(|| format!("input {i} of `{entry}` is not set"))?;
                let mut values = Vec::with_capacity(size * n);
                for comp in 0..size {
                    values.extend(launch.read_scalars(ptr.add_scalars(comp * q + start), n)?);
                }
                inputs.push(values);
            }
            let mut outputs: Vec<Vec<Scalar>> = out_sizes.iter().map(|size| vec![0.0; size * n]).collect();

            let in_slices: Vec<&[Scalar]> = inputs.iter().map(Vec::as_slice).collect();
            let mut out_slices: Vec<&mut [Scalar]> = outputs.iter_mut().map(Vec::as_mut_slice).collect();
            let status = kernel(&context, n, &in_slices, &mut out_slices);
            if status != 0 {
                return Err(format!("QFunction kernel `{entry}` returned status {status}"));
            }

            for (i, (&size, values)) in out_sizes.iter().zip(&outputs).enumerate() {
                let ptr = fields.outputs[i].ok_or_else(|| format!("output {i} of `{entry}` is not set"))?;
                for comp in 0..size {
                    launch.write_scalars(ptr.add_scalars(comp * q + start), &values[comp * n..(comp + 1) * n])?;
                }
            }
        }
        Ok(())
    })
}

fn compile_qfunction(qf: &QFunction, device: &Arc<dyn Device>) -> Result<CompiledQFunction> {
    let text = qf.device_source().ok_or_else(|| {
        Error::configuration(format!("QFunction `{}` has no device source", qf.entry_point()))
    })?;
    let entry = qf.entry_point().to_string();
    let routine = qfunction_routine(
        qf.kernel().clone(),
        entry.clone(),
        qf.inputs().iter().map(|field| field.size()).collect(),
        qf.outputs().iter().map(|field| field.size()).collect(),
    );
    let module = device.compile(ProgramSource {
        name: qf.source().path.display().to_string(),
        text: text.to_string(),
        defines: vec![("CEED_Q_VLA".to_string(), qf.vlength().to_string())],
        entry_points: vec![(entry.clone(), routine)],
    })?;
    Ok(CompiledQFunction {
        kernel: module.get_kernel(&entry)?,
        context: None,
        context_version: None,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimQFunction;

impl QFunctionApply for SimQFunction {
    fn apply(&self, qf: &QFunction, q: usize, inputs: &[&Vector], outputs: &[&Vector]) -> Result<()> {
        let backend = qf.backend();
        let device = require_device(backend)?;
        let block = block_size(backend);
        ensure_config!(
            block % qf.vlength() == 0,
            "block size {} is not a multiple of the vector length {} of QFunction `{}`",
            block,
            qf.vlength(),
            qf.entry_point()
        );

        let mut data = qf.data.lock();
        let compiled = data.try_get_or_insert_with(|| compile_qfunction(qf, device))?;

        let (context, version) = qf.context_snapshot();
        if compiled.context_version != Some(version) {
            if !context.is_empty() {
                let fits = compiled
                    .context
                    .as_ref()
                    .map_or(false, |buffer| buffer.bytes() >= context.len());
                if !fits {
                    compiled.context = Some(DeviceBuffer::allocate(device, context.len())?);
                }
                if let Some(buffer) = &compiled.context {
                    buffer.upload(&context)?;
                }
            }
            compiled.context_version = Some(version);
        }
        let context_arg = match (&compiled.context, context.is_empty()) {
            (Some(buffer), false) => KernelArg::Ptr(buffer.ptr()),
            _ => KernelArg::Null,
        };

        let in_views = inputs.iter().map(|v| v.device_view()).collect::<Result<Vec<_>>>()?;
        let out_views = outputs.iter().map(|v| v.device_view_mut()).collect::<Result<Vec<_>>>()?;
        let mut fields = FieldTable::default();
        for (slot, view) in fields.inputs.iter_mut().zip(&in_views) {
            *slot = Some(view.ptr());
        }
        for (slot, view) in fields.outputs.iter_mut().zip(&out_views) {
            *slot = Some(view.ptr());
        }

        device.launch(
            &compiled.kernel,
            grid_size(q, block),
            block,
            vec![
                context_arg,
                KernelArg::Int(context.len()),
                KernelArg::Int(q),
                KernelArg::Fields(fields),
            ],
        )
    }
}
