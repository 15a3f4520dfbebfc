//! Accelerator abstraction used by device backends.
//!
//! A [`Device`] owns a memory space that is not addressable from the host. Data moves in and
//! out through explicit copies, and kernels run asynchronously on an in-order stream. Work
//! queued on the stream is only guaranteed to have completed after
//! [`synchronize`](Device::synchronize) or a blocking copy back to the host.
//!
//! Kernels are produced by runtime compilation of source text with
//! [`compile`](Device::compile), which yields a [`Module`] from which entry points are
//! looked up by name.
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::ensure_usage;
use crate::{Error, Result, Scalar, MAX_QFUNCTION_FIELDS};

mod compiler;
pub mod sim;

pub use sim::SimDevice;

/// Address in the memory space of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub fn from_address(address: u64) -> Self {
        Self(address)
    }

    pub fn address(&self) -> u64 {
        self.0
    }

    /// The pointer advanced by `bytes` bytes.
    pub fn offset(&self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    /// The pointer advanced by `count` scalars.
    pub fn add_scalars(&self, count: usize) -> Self {
        self.offset(count * std::mem::size_of::<Scalar>())
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Fixed-capacity table of field pointers, passed to QFunction kernels by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldTable {
    pub inputs: [Option<DevicePtr>; MAX_QFUNCTION_FIELDS],
    pub outputs: [Option<DevicePtr>; MAX_QFUNCTION_FIELDS],
}

/// Argument of a kernel launch.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Ptr(DevicePtr),
    Null,
    Int(usize),
    Fields(FieldTable),
}

/// Host routine standing in for the machine code of a compiled entry point.
///
/// A routine may only touch device memory through the given [`KernelContext`]. An error
/// message aborts the launch and is reported at the next synchronization point.
pub type DeviceFn = Arc<dyn Fn(&mut KernelContext<'_>) -> std::result::Result<(), String> + Send + Sync>;

/// Wraps a closure as a [`DeviceFn`].
pub fn device_fn<F>(routine: F) -> DeviceFn
where
    F: Fn(&mut KernelContext<'_>) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    Arc::new(routine)
}

/// Source text handed to the runtime compiler.
#[derive(Clone)]
pub struct ProgramSource {
    /// Name of the program, used in diagnostics.
    pub name: String,
    pub text: String,
    /// Preprocessor definitions, `(name, value)`.
    pub defines: Vec<(String, String)>,
    /// Entry points to export from the module, together with their host routines.
    pub entry_points: Vec<(String, DeviceFn)>,
}

impl Debug for ProgramSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramSource")
            .field("name", &self.name)
            .field("defines", &self.defines)
            .field(
                "entry_points",
                &self.entry_points.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A loadable entry point of a compiled module.
#[derive(Clone)]
pub struct Kernel {
    name: String,
    routine: DeviceFn,
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn run(&self, context: &mut KernelContext<'_>) -> std::result::Result<(), String> {
        (self.routine)(context)
    }
}

impl Debug for Kernel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel").field("name", &self.name).finish()
    }
}

/// Result of a successful runtime compilation.
#[derive(Debug)]
pub struct Module {
    name: String,
    kernels: FxHashMap<String, Kernel>,
    build_log: String,
}

impl Module {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn build_log(&self) -> &str {
        &self.build_log
    }

    pub fn get_kernel(&self, name: &str) -> Result<Kernel> {
        self.kernels.get(name).cloned().ok_or_else(|| {
            Error::configuration(format!("module `{}` has no entry point named `{}`", self.name, name))
        })
    }
}

/// Byte-addressed access to device memory from inside a kernel.
pub trait DeviceMemory {
    fn read_bytes(&self, ptr: DevicePtr, len: usize) -> std::result::Result<Vec<u8>, String>;

    fn write_bytes(&mut self, ptr: DevicePtr, data: &[u8]) -> std::result::Result<(), String>;
}

/// Everything a kernel routine sees while running.
pub struct KernelContext<'a> {
    pub grid: usize,
    pub block: usize,
    pub args: &'a [KernelArg],
    memory: &'a mut dyn DeviceMemory,
}

impl<'a> KernelContext<'a> {
    pub fn new(grid: usize, block: usize, args: &'a [KernelArg], memory: &'a mut dyn DeviceMemory) -> Self {
        Self {
            grid,
            block,
            args,
            memory,
        }
    }

    fn arg(&self, index: usize) -> std::result::Result<&KernelArg, String> {
        self.args
            .get(index)
            .ok_or_else(|| format!("missing kernel argument {index}"))
    }

    /// Pointer argument, `None` for a null pointer.
    pub fn ptr_arg(&self, index: usize) -> std::result::Result<Option<DevicePtr>, String> {
        match self.arg(index)? {
            KernelArg::Ptr(ptr) => Ok(Some(*ptr)),
            KernelArg::Null => Ok(None),
            other => Err(format!("kernel argument {index} is not a pointer: {other:?}")),
        }
    }

    pub fn int_arg(&self, index: usize) -> std::result::Result<usize, String> {
        match self.arg(index)? {
            KernelArg::Int(value) => Ok(*value),
            other => Err(format!("kernel argument {index} is not an integer: {other:?}")),
        }
    }

    pub fn fields_arg(&self, index: usize) -> std::result::Result<FieldTable, String> {
        match self.arg(index)? {
            KernelArg::Fields(fields) => Ok(*fields),
            other => Err(format!("kernel argument {index} is not a field table: {other:?}")),
        }
    }

    pub fn read_bytes(&self, ptr: DevicePtr, len: usize) -> std::result::Result<Vec<u8>, String> {
        self.memory.read_bytes(ptr, len)
    }

    pub fn read_scalars(&self, ptr: DevicePtr, count: usize) -> std::result::Result<Vec<Scalar>, String> {
        let bytes = self.read_bytes(ptr, count * std::mem::size_of::<Scalar>())?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn read_indices(&self, ptr: DevicePtr, count: usize) -> std::result::Result<Vec<u64>, String> {
        let bytes = self.read_bytes(ptr, count * std::mem::size_of::<u64>())?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn write_scalars(&mut self, ptr: DevicePtr, values: &[Scalar]) -> std::result::Result<(), String> {
        self.memory.write_bytes(ptr, bytemuck::cast_slice(values))
    }
}

/// An accelerator with its own memory space and an in-order work stream.
pub trait Device: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Allocates `bytes` bytes of device memory.
    fn allocate(&self, bytes: usize) -> Result<DevicePtr>;

    /// Releases an allocation once all previously queued work has completed.
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Queues a copy of `src` to device memory. The host data is captured immediately.
    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;

    /// Copies device memory into `dst`, blocking until all previously queued work has completed.
    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<()>;

    fn copy_within_device(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()>;

    /// Queues filling `count` scalars starting at `dst` with `value`.
    fn fill(&self, dst: DevicePtr, value: Scalar, count: usize) -> Result<()>;

    /// Blocks until all queued work has completed, reporting the first error it raised.
    fn synchronize(&self) -> Result<()>;

    fn compile(&self, program: ProgramSource) -> Result<Arc<Module>>;

    /// Queues a launch of `kernel` on a one-dimensional grid of `grid` blocks of `block` threads.
    fn launch(&self, kernel: &Kernel, grid: usize, block: usize, args: Vec<KernelArg>) -> Result<()>;
}

/// Owned device allocation, released on drop.
pub struct DeviceBuffer {
    device: Arc<dyn Device>,
    ptr: DevicePtr,
    bytes: usize,
}

impl DeviceBuffer {
    pub fn allocate(device: &Arc<dyn Device>, bytes: usize) -> Result<Self> {
        let ptr = device.allocate(bytes)?;
        Ok(Self {
            device: Arc::clone(device),
            ptr,
            bytes,
        })
    }

    /// Allocates a buffer holding a copy of the given scalars.
    pub fn from_scalars(device: &Arc<dyn Device>, values: &[Scalar]) -> Result<Self> {
        let buffer = Self::allocate(device, std::mem::size_of_val(values))?;
        device.copy_to_device(buffer.ptr, bytemuck::cast_slice(values))?;
        Ok(buffer)
    }

    pub fn from_indices(device: &Arc<dyn Device>, values: &[u64]) -> Result<Self> {
        let buffer = Self::allocate(device, std::mem::size_of_val(values))?;
        device.copy_to_device(buffer.ptr, bytemuck::cast_slice(values))?;
        Ok(buffer)
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len_scalars(&self) -> usize {
        self.bytes / std::mem::size_of::<Scalar>()
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Overwrites the start of the buffer with the given bytes.
    pub fn upload(&self, data: &[u8]) -> Result<()> {
        ensure_usage!(
            data.len() <= self.bytes,
            "cannot upload {} bytes into a device buffer of {} bytes",
            data.len(),
            self.bytes
        );
        self.device.copy_to_device(self.ptr, data)
    }
}

impl Debug for DeviceBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device.name())
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.free(self.ptr) {
            log::warn!("Failed to free device buffer at {}: {}", self.ptr, err);
        }
    }
}

/// Number of blocks needed to cover `n` threads.
pub fn grid_size(n: usize, block: usize) -> usize {
    (n + block - 1) / block
}
