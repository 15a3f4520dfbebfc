//! A simulated accelerator.
//!
//! [`SimDevice`] keeps its memory apart from the host and executes queued work on a dedicated
//! stream thread, so host code only observes results after a synchronization point, just like
//! on real hardware. Errors raised by queued work are sticky: the first one is stored and
//! reported by the next blocking call.
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::device::{compiler, Device, DeviceMemory, DevicePtr, Kernel, KernelArg, KernelContext, Module, ProgramSource};
use crate::{Error, Result, Scalar};

/// Allocations are placed on boundaries of this many bytes, with a gap of the same size between
/// neighbours so that out-of-bounds accesses are detected.
const ALIGNMENT: u64 = 256;
const BASE_ADDRESS: u64 = 0x7f00_0000_0000;

#[derive(Debug)]
struct Allocation {
    bytes: usize,
    words: Vec<u64>,
}

#[derive(Debug)]
struct SimMemory {
    allocations: BTreeMap<u64, Allocation>,
    next_address: u64,
    in_use: usize,
    limit: Option<usize>,
}

impl SimMemory {
    fn new(limit: Option<usize>) -> Self {
        Self {
            allocations: BTreeMap::new(),
            next_address: BASE_ADDRESS,
            in_use: 0,
            limit,
        }
    }

    fn allocate(&mut self, bytes: usize) -> std::result::Result<DevicePtr, String> {
        if let Some(limit) = self.limit {
            if self.in_use + bytes > limit {
                return Err(format!(
                    "out of memory: requested {} bytes with {} of {} bytes in use",
                    bytes, self.in_use, limit
                ));
            }
        }
        let address = self.next_address;
        let span = (bytes as u64 + ALIGNMENT - 1) / ALIGNMENT * ALIGNMENT;
        self.next_address += span + ALIGNMENT;
        self.in_use += bytes;
        // Freshly allocated memory reads as zero
        let words = vec![0u64; (bytes + 7) / 8];
        self.allocations.insert(address, Allocation { bytes, words });
        Ok(DevicePtr::from_address(address))
    }

    fn free(&mut self, ptr: DevicePtr) -> std::result::Result<(), String> {
        match self.allocations.remove(&ptr.address()) {
            Some(allocation) => {
                self.in_use -= allocation.bytes;
                Ok(())
            }
            None => Err(format!("invalid free of {ptr}, which is not the start of an allocation")),
        }
    }

    /// Finds the allocation containing `[ptr, ptr + len)`, returning its base and the byte offset.
    fn locate(&self, ptr: DevicePtr, len: usize) -> std::result::Result<(u64, usize), String> {
        let address = ptr.address();
        let (base, allocation) = self
            .allocations
            .range(..=address)
            .next_back()
            .ok_or_else(|| format!("access to unallocated address {ptr}"))?;
        let offset = (address - base) as usize;
        if offset + len > allocation.bytes {
            return Err(format!(
                "access of {} bytes at {} exceeds allocation of {} bytes at {:#x}",
                len, ptr, allocation.bytes, base
            ));
        }
        Ok((*base, offset))
    }

    fn fill(&mut self, ptr: DevicePtr, value: Scalar, count: usize) -> std::result::Result<(), String> {
        let data = vec![value; count];
        self.write_bytes(ptr, bytemuck::cast_slice(&data))
    }

    fn copy_within(&mut self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> std::result::Result<(), String> {
        let data = self.read_bytes(src, bytes)?;
        self.write_bytes(dst, &data)
    }
}

impl DeviceMemory for SimMemory {
    fn read_bytes(&self, ptr: DevicePtr, len: usize) -> std::result::Result<Vec<u8>, String> {
        let (base, offset) = self.locate(ptr, len)?;
        let words = &self.allocations[&base].words;
        let bytes: &[u8] = bytemuck::cast_slice(words);
        Ok(bytes[offset..offset + len].to_vec())
    }

    fn write_bytes(&mut self, ptr: DevicePtr, data: &[u8]) -> std::result::Result<(), String> {
        let (base, offset) = self.locate(ptr, data.len())?;
        let allocation = self
            .allocations
            .get_mut(&base)
            .ok_or_else(|| format!("allocation at {base:#x} vanished"))?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut allocation.words);
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

enum Command {
    CopyToDevice {
        dst: DevicePtr,
        data: Vec<u8>,
    },
    CopyWithin {
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
    },
    Fill {
        dst: DevicePtr,
        value: Scalar,
        count: usize,
    },
    Launch {
        kernel: Kernel,
        grid: usize,
        block: usize,
        args: Vec<KernelArg>,
    },
    Free(DevicePtr),
    Fence(Sender<()>),
}

#[derive(Debug)]
struct Shared {
    memory: Mutex<SimMemory>,
    /// First error raised by queued work since the last synchronization.
    sticky_error: Mutex<Option<String>>,
}

impl Shared {
    fn record_error(&self, message: String) {
        let mut sticky = self.sticky_error.lock();
        if sticky.is_none() {
            *sticky = Some(message);
        }
    }

    fn execute(&self, command: Command) {
        // Commands queued after a failure still run, only the first error is kept
        let result = match command {
            Command::Free(ptr) => self.memory.lock().free(ptr),
            Command::Fence(reply) => {
                let _ = reply.send(());
                Ok(())
            }
            Command::CopyToDevice { dst, data } => self.memory.lock().write_bytes(dst, &data),
            Command::CopyWithin { dst, src, bytes } => self.memory.lock().copy_within(dst, src, bytes),
            Command::Fill { dst, value, count } => self.memory.lock().fill(dst, value, count),
            Command::Launch {
                kernel,
                grid,
                block,
                args,
            } => {
                let mut memory = self.memory.lock();
                let mut context = KernelContext::new(grid, block, &args, &mut *memory);
                kernel
                    .run(&mut context)
                    .map_err(|message| format!("kernel `{}` failed: {}", kernel.name(), message))
            }
        };
        if let Err(message) = result {
            self.record_error(message);
        }
    }
}

fn run_stream(shared: Arc<Shared>, commands: Receiver<Command>) {
    for command in commands {
        shared.execute(command);
    }
}

/// Simulated accelerator with separate memory and an asynchronous stream.
pub struct SimDevice {
    name: String,
    device_id: usize,
    shared: Arc<Shared>,
    stream: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl SimDevice {
    /// Number of simulated devices available.
    pub const DEVICE_COUNT: usize = 4;

    /// Creates the device with the given id, optionally with a memory limit in bytes.
    pub fn new(device_id: usize, memory_limit: Option<usize>) -> Result<Self> {
        let name = format!("sim:{device_id}");
        if device_id >= Self::DEVICE_COUNT {
            return Err(Error::configuration(format!(
                "there is no simulated device with id {} ({} devices available)",
                device_id,
                Self::DEVICE_COUNT
            )));
        }

        let shared = Arc::new(Shared {
            memory: Mutex::new(SimMemory::new(memory_limit)),
            sticky_error: Mutex::new(None),
        });
        let (sender, receiver) = crossbeam_channel::unbounded();
        let stream_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("matfree-{name}-stream"))
            .spawn(move || run_stream(stream_shared, receiver))
            .map_err(|err| Error::backend(&name, format!("failed to spawn stream thread: {err}")))?;

        log::debug!("Created simulated device {} (memory limit: {:?})", name, memory_limit);
        Ok(Self {
            name,
            device_id,
            shared,
            stream: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Number of bytes currently allocated.
    pub fn memory_in_use(&self) -> usize {
        self.shared.memory.lock().in_use
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::backend(&self.name, message)
    }

    fn enqueue(&self, command: Command) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| self.error("device stream has shut down"))?;
        stream
            .send(command)
            .map_err(|_| self.error("device stream has shut down"))
    }

    /// Waits for all queued work, leaving any pending error in place.
    fn drain(&self) -> Result<()> {
        let (reply, done) = crossbeam_channel::bounded(1);
        self.enqueue(Command::Fence(reply))?;
        done.recv()
            .map_err(|_| self.error("device stream terminated before synchronization"))
    }

    fn take_sticky_error(&self) -> Result<()> {
        match self.shared.sticky_error.lock().take() {
            Some(message) => Err(self.error(message)),
            None => Ok(()),
        }
    }
}

impl Debug for SimDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimDevice")
            .field("name", &self.name)
            .field("memory_in_use", &self.memory_in_use())
            .finish()
    }
}

impl Device for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, bytes: usize) -> Result<DevicePtr> {
        let first_try = self.shared.memory.lock().allocate(bytes);
        match first_try {
            Ok(ptr) => Ok(ptr),
            Err(_) => {
                // Frees are queued on the stream, so wait for them before giving up
                self.drain()?;
                self.shared
                    .memory
                    .lock()
                    .allocate(bytes)
                    .map_err(|message| self.error(message))
            }
        }
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.enqueue(Command::Free(ptr))
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        self.enqueue(Command::CopyToDevice {
            dst,
            data: src.to_vec(),
        })
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        self.synchronize()?;
        let data = self
            .shared
            .memory
            .lock()
            .read_bytes(src, dst.len())
            .map_err(|message| self.error(message))?;
        dst.copy_from_slice(&data);
        Ok(())
    }

    fn copy_within_device(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()> {
        self.enqueue(Command::CopyWithin { dst, src, bytes })
    }

    fn fill(&self, dst: DevicePtr, value: Scalar, count: usize) -> Result<()> {
        self.enqueue(Command::Fill { dst, value, count })
    }

    fn synchronize(&self) -> Result<()> {
        self.drain()?;
        self.take_sticky_error()
    }

    fn compile(&self, program: ProgramSource) -> Result<Arc<Module>> {
        let name = program.name.clone();
        let module = compiler::compile(program)
            .map_err(|build_log| self.error(format!("compilation of `{name}` failed:\n{build_log}")))?;
        log::info!("Compiled device module `{}` for {}", name, self.name);
        log::debug!("Build log of `{}`:\n{}", name, module.build_log());
        Ok(Arc::new(module))
    }

    fn launch(&self, kernel: &Kernel, grid: usize, block: usize, args: Vec<KernelArg>) -> Result<()> {
        if block == 0 {
            return Err(self.error(format!("invalid launch of `{}` with block size 0", kernel.name())));
        }
        self.enqueue(Command::Launch {
            kernel: kernel.clone(),
            grid,
            block,
            args,
        })
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        // Closing the channel ends the stream loop once the queued work is done
        self.stream.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("Stream thread of {} panicked", self.name);
            }
        }
        if let Some(message) = self.shared.sticky_error.lock().take() {
            log::warn!("Unreported error on {} at shutdown: {}", self.name, message);
        }
    }
}
