//! Pointwise kernels evaluated at quadrature points.
//!
//! A [`QFunction`] wraps a user kernel together with the description of its input and
//! output fields. The kernel sees each field as a flat array laid out `[comp][q]` and is
//! called for any number of points that is a multiple of the vector length.
//!
//! Every QFunction also names the source of its kernel as `path/to/file.ext:entry`. Backends
//! that run on a device compile the companion file `path/to/file.h` at runtime and launch
//! the entry point `entry` from it, so the file must define that entry point with
//! `CEED_QFUNCTION(entry)`.
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ensure_config, ensure_usage};
use crate::vector::Vector;
use crate::workspace::Workspace;
use crate::{Backend, Error, EvalMode, Result, Scalar, MAX_QFUNCTION_FIELDS};

/// Kernel signature: `(context, q, inputs, outputs) -> status`, where a non-zero status
/// reports a failure.
pub type QFunctionKernel = Arc<dyn Fn(&[u8], usize, &[&[Scalar]], &mut [&mut [Scalar]]) -> i32 + Send + Sync>;

/// Wraps a closure as a [`QFunctionKernel`].
pub fn kernel_fn<F>(kernel: F) -> QFunctionKernel
where
    F: Fn(&[u8], usize, &[&[Scalar]], &mut [&mut [Scalar]]) -> i32 + Send + Sync + 'static,
{
    Arc::new(kernel)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QFunctionField {
    name: String,
    size: usize,
    eval_mode: EvalMode,
}

impl QFunctionField {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of components the kernel sees per point.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn eval_mode(&self) -> EvalMode {
        self.eval_mode
    }
}

/// Location of the kernel source, parsed from `path:entry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub path: PathBuf,
    pub entry: String,
}

impl KernelSource {
    pub fn parse(source: &str) -> Result<Self> {
        let (path, entry) = source
            .rsplit_once(':')
            .ok_or_else(|| Error::configuration(format!("kernel source `{source}` is not of the form path:entry")))?;
        ensure_config!(
            !path.is_empty() && !entry.is_empty(),
            "kernel source `{}` is not of the form path:entry",
            source
        );
        Ok(Self {
            path: PathBuf::from(path),
            entry: entry.to_string(),
        })
    }

    /// The file device backends compile.
    pub fn companion(&self) -> Result<PathBuf> {
        ensure_config!(
            self.path.extension().is_some(),
            "kernel source path `{}` has no file extension",
            self.path.display()
        );
        Ok(self.path.with_extension("h"))
    }
}

#[derive(Debug, Default)]
struct Context {
    bytes: Vec<u8>,
    version: u64,
}

pub struct QFunction {
    backend: Backend,
    vlength: usize,
    kernel: QFunctionKernel,
    source: KernelSource,
    device_source: Option<String>,
    inputs: Vec<QFunctionField>,
    outputs: Vec<QFunctionField>,
    context: Mutex<Context>,
    pub(crate) data: Mutex<Workspace>,
}

impl Debug for QFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QFunction")
            .field("vlength", &self.vlength)
            .field("source", &self.source)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl QFunction {
    pub(crate) fn interior(backend: Backend, vlength: usize, kernel: QFunctionKernel, source: &str) -> Result<Self> {
        let source = KernelSource::parse(source)?;
        let device_source = match backend.device() {
            Some(_) => Some(read_companion(&source)?),
            None => None,
        };
        Self::with_source(backend, vlength, kernel, source, device_source)
    }

    /// QFunction whose device source is part of the library.
    pub(crate) fn embedded(
        backend: Backend,
        vlength: usize,
        kernel: QFunctionKernel,
        path: &str,
        entry: &str,
        text: &str,
    ) -> Result<Self> {
        let source = KernelSource {
            path: PathBuf::from(path),
            entry: entry.to_string(),
        };
        Self::with_source(backend, vlength, kernel, source, Some(text.to_string()))
    }

    fn with_source(
        backend: Backend,
        vlength: usize,
        kernel: QFunctionKernel,
        source: KernelSource,
        device_source: Option<String>,
    ) -> Result<Self> {
        ensure_config!(vlength > 0, "vector length must be positive");
        log::debug!("Created QFunction `{}` with vector length {}", source.entry, vlength);
        Ok(Self {
            backend,
            vlength,
            kernel,
            source,
            device_source,
            inputs: Vec::new(),
            outputs: Vec::new(),
            context: Mutex::new(Context::default()),
            data: Mutex::new(Workspace::default()),
        })
    }

    fn check_new_field(&self, name: &str, size: usize) -> Result<()> {
        ensure_config!(size > 0, "field `{}` must have at least one component", name);
        let taken = self.inputs.iter().chain(&self.outputs).any(|field| field.name == name);
        ensure_config!(!taken, "QFunction `{}` already has a field named `{}`", self.source.entry, name);
        Ok(())
    }

    /// Adds an input field.
    pub fn input(mut self, name: &str, size: usize, eval_mode: EvalMode) -> Result<Self> {
        ensure_config!(
            self.inputs.len() < MAX_QFUNCTION_FIELDS,
            "QFunction `{}` cannot have more than {} inputs",
            self.source.entry,
            MAX_QFUNCTION_FIELDS
        );
        self.check_new_field(name, size)?;
        ensure_config!(
            eval_mode != EvalMode::Weight || size == 1,
            "weight field `{}` must have size 1, got {}",
            name,
            size
        );
        self.inputs.push(QFunctionField {
            name: name.to_string(),
            size,
            eval_mode,
        });
        Ok(self)
    }

    /// Adds an output field.
    pub fn output(mut self, name: &str, size: usize, eval_mode: EvalMode) -> Result<Self> {
        ensure_config!(
            self.outputs.len() < MAX_QFUNCTION_FIELDS,
            "QFunction `{}` cannot have more than {} outputs",
            self.source.entry,
            MAX_QFUNCTION_FIELDS
        );
        self.check_new_field(name, size)?;
        ensure_config!(
            eval_mode != EvalMode::Weight,
            "output field `{}` cannot have evaluation mode Weight",
            name
        );
        self.outputs.push(QFunctionField {
            name: name.to_string(),
            size,
            eval_mode,
        });
        Ok(self)
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn vlength(&self) -> usize {
        self.vlength
    }

    pub fn inputs(&self) -> &[QFunctionField] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[QFunctionField] {
        &self.outputs
    }

    pub fn source(&self) -> &KernelSource {
        &self.source
    }

    pub fn entry_point(&self) -> &str {
        &self.source.entry
    }

    pub(crate) fn device_source(&self) -> Option<&str> {
        self.device_source.as_deref()
    }

    pub(crate) fn kernel(&self) -> &QFunctionKernel {
        &self.kernel
    }

    /// Stores a copy of `ctx` as the context of the kernel.
    pub fn set_context<C: bytemuck::Pod>(&self, ctx: &C) {
        self.set_context_bytes(bytemuck::bytes_of(ctx));
    }

    pub fn set_context_bytes(&self, bytes: &[u8]) {
        let mut context = self.context.lock();
        context.bytes = bytes.to_vec();
        context.version += 1;
    }

    /// Reads the context back as a value of type `C`.
    pub fn context<C: bytemuck::Pod>(&self) -> Result<C> {
        let context = self.context.lock();
        bytemuck::try_pod_read_unaligned(&context.bytes).map_err(|err| {
            Error::usage(format!(
                "context of {} bytes cannot be read as a value of {} bytes: {}",
                context.bytes.len(),
                std::mem::size_of::<C>(),
                err
            ))
        })
    }

    /// The context and its version, which changes every time the context is set.
    pub(crate) fn context_snapshot(&self) -> (Vec<u8>, u64) {
        let context = self.context.lock();
        (context.bytes.clone(), context.version)
    }

    /// Evaluates the QFunction at `q` points. Field `i` is stored in vector `i`, laid out
    /// `[comp][q]`.
    pub fn apply(&self, q: usize, inputs: &[&Vector], outputs: &[&Vector]) -> Result<()> {
        ensure_usage!(
            inputs.len() == self.inputs.len() && outputs.len() == self.outputs.len(),
            "QFunction `{}` has {} inputs and {} outputs, but {} and {} vectors were given",
            self.source.entry,
            self.inputs.len(),
            self.outputs.len(),
            inputs.len(),
            outputs.len()
        );
        ensure_usage!(
            q % self.vlength == 0,
            "number of points {} is not a multiple of the vector length {}",
            q,
            self.vlength
        );
        let fields = self.inputs.iter().zip(inputs).chain(self.outputs.iter().zip(outputs));
        for (field, vector) in fields {
            ensure_usage!(
                vector.length() == field.size * q,
                "vector for field `{}` has length {}, expected {}",
                field.name,
                vector.length(),
                field.size * q
            );
        }
        self.backend
            .methods()
            .qfunction_apply
            .apply(self, q, inputs, outputs)
    }

    /// Calls the kernel on host arrays, turning a non-zero status into an error.
    pub(crate) fn call_kernel(
        &self,
        ctx: &[u8],
        q: usize,
        inputs: &[&[Scalar]],
        outputs: &mut [&mut [Scalar]],
    ) -> Result<()> {
        let status = (self.kernel)(ctx, q, inputs, outputs);
        if status != 0 {
            return Err(Error::backend(
                self.backend.resource(),
                format!("QFunction kernel `{}` returned status {}", self.source.entry, status),
            ));
        }
        Ok(())
    }
}

fn read_companion(source: &KernelSource) -> Result<String> {
    let path = source.companion()?;
    read_source(&path)
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|err| Error::configuration(format!("cannot read kernel source `{}`: {}", path.display(), err)))
}
