//! Runtime selection of backends from resource strings.
//!
//! A resource string has the form `/path/segments[:key=value,...]`. Backends register under
//! a path prefix with a priority, and methods register under a path prefix per object kind
//! and method name. Resolving a resource picks a backend and then, for every method, the
//! implementation registered under the longest prefix of the backend's own prefix. Backends
//! can therefore inherit methods from more general prefixes and override a few of them.
use std::cmp::Reverse;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::backend::{blocked, cpu, opt, serial, sim};
use crate::backend::{Backend, BackendSetup, Method, Methods, ObjectKind};
use crate::error::ensure_config;
use crate::{Error, Result};

/// Options given after the `:` of a resource string.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendOptions {
    /// Index of the device to run on.
    pub device_id: usize,
    /// Threads per block for device launches, elements per block for blocked CPU backends.
    pub block_size: Option<usize>,
    /// Limit on device memory in bytes.
    pub memory_limit: Option<usize>,
}

impl BackendOptions {
    /// Parses a comma-separated list of `key=value` pairs.
    pub fn parse(options: &str) -> Result<Self> {
        let mut parsed = Self::default();
        for pair in options.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::configuration(format!("backend option `{pair}` is not of the form key=value")))?;
            let number = value.trim().parse::<usize>().map_err(|err| {
                Error::configuration(format!("invalid value `{value}` for backend option `{key}`: {err}"))
            })?;
            match key.trim() {
                "device_id" => parsed.device_id = number,
                "block_size" => {
                    ensure_config!(number > 0, "block_size must be positive");
                    parsed.block_size = Some(number);
                }
                "memory_limit" => parsed.memory_limit = Some(number),
                other => return Err(Error::configuration(format!("unknown backend option `{other}`"))),
            }
        }
        Ok(parsed)
    }
}

/// Initializes a backend for a resource, or declines it by returning `None`.
pub type BackendInit = fn(&str, &BackendOptions) -> Result<Option<BackendSetup>>;

#[derive(Clone)]
struct BackendRegistration {
    prefix: String,
    priority: u32,
    init: BackendInit,
}

impl Debug for BackendRegistration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistration")
            .field("prefix", &self.prefix)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    kind: ObjectKind,
    name: String,
    prefix: String,
}

/// Whether `prefix` consists of whole leading segments of `path`.
fn is_path_prefix(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Name of the method every object kind provides.
pub const APPLY: &str = "Apply";

#[derive(Debug, Clone, Default)]
pub struct Registry {
    backends: Vec<BackendRegistration>,
    methods: FxHashMap<MethodKey, Method>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry of all backends shipped with the library.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_backend("/cpu/self/ref/serial", 50, cpu::init);
        registry.register_backend("/cpu/self/ref/blocked", 55, cpu::init);
        registry.register_backend("/cpu/self/opt/serial", 45, cpu::init);
        registry.register_backend("/cpu/self/opt/blocked", 40, cpu::init);
        registry.register_backend("/gpu/sim/ref", 60, sim::init);

        let builtin_methods = [
            ("/", Method::TensorContract(Arc::new(cpu::RefContract))),
            ("/", Method::OperatorApply(Arc::new(serial::SerialOperator))),
            ("/cpu/self", Method::ElemRestrictionApply(Arc::new(cpu::CpuRestriction))),
            ("/cpu/self", Method::BasisApply(Arc::new(cpu::CpuBasis))),
            ("/cpu/self", Method::QFunctionApply(Arc::new(cpu::CpuQFunction))),
            ("/cpu/self/opt", Method::TensorContract(Arc::new(opt::OptContract))),
            ("/cpu/self/ref/blocked", Method::OperatorApply(Arc::new(blocked::BlockedOperator))),
            ("/cpu/self/opt/blocked", Method::OperatorApply(Arc::new(blocked::BlockedOperator))),
            ("/gpu/sim", Method::ElemRestrictionApply(Arc::new(sim::SimRestriction))),
            ("/gpu/sim", Method::BasisApply(Arc::new(sim::SimBasis))),
            ("/gpu/sim", Method::QFunctionApply(Arc::new(sim::SimQFunction))),
        ];
        for (prefix, method) in builtin_methods {
            registry.insert_method(prefix, APPLY, method);
        }
        registry
    }

    /// Registers a backend. A later registration with the same prefix replaces the earlier one.
    pub fn register_backend(&mut self, prefix: &str, priority: u32, init: BackendInit) {
        self.backends.retain(|backend| backend.prefix != prefix);
        self.backends.push(BackendRegistration {
            prefix: prefix.to_string(),
            priority,
            init,
        });
    }

    /// Registers a method implementation. A later registration with the same prefix, kind and
    /// name replaces the earlier one.
    pub fn register(&mut self, prefix: &str, kind: ObjectKind, name: &str, method: Method) -> Result<()> {
        ensure_config!(
            method.kind() == kind,
            "cannot register a {:?} implementation as {:?}::{}",
            method.kind(),
            kind,
            name
        );
        self.insert_method(prefix, name, method);
        Ok(())
    }

    fn insert_method(&mut self, prefix: &str, name: &str, method: Method) {
        let key = MethodKey {
            kind: method.kind(),
            name: name.to_string(),
            prefix: prefix.to_string(),
        };
        self.methods.insert(key, method);
    }

    /// The implementation of `(kind, name)` for a backend registered under `backend_prefix`.
    fn lookup(&self, backend_prefix: &str, kind: ObjectKind, name: &str) -> Result<Method> {
        self.methods
            .iter()
            .filter(|(key, _)| key.kind == kind && key.name == name && is_path_prefix(&key.prefix, backend_prefix))
            .max_by_key(|(key, _)| key.prefix.len())
            .map(|(_, method)| method.clone())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "backend `{backend_prefix}` has no implementation of {kind:?}::{name}"
                ))
            })
    }

    fn methods_for(&self, backend_prefix: &str) -> Result<Methods> {
        let mismatch = |kind: ObjectKind| Error::configuration(format!("registry holds a mismatched {kind:?} method"));
        let restriction_apply = match self.lookup(backend_prefix, ObjectKind::ElemRestriction, APPLY)? {
            Method::ElemRestrictionApply(method) => method,
            _ => return Err(mismatch(ObjectKind::ElemRestriction)),
        };
        let basis_apply = match self.lookup(backend_prefix, ObjectKind::Basis, APPLY)? {
            Method::BasisApply(method) => method,
            _ => return Err(mismatch(ObjectKind::Basis)),
        };
        let tensor_contract = match self.lookup(backend_prefix, ObjectKind::TensorContract, APPLY)? {
            Method::TensorContract(method) => method,
            _ => return Err(mismatch(ObjectKind::TensorContract)),
        };
        let qfunction_apply = match self.lookup(backend_prefix, ObjectKind::QFunction, APPLY)? {
            Method::QFunctionApply(method) => method,
            _ => return Err(mismatch(ObjectKind::QFunction)),
        };
        let operator_apply = match self.lookup(backend_prefix, ObjectKind::Operator, APPLY)? {
            Method::OperatorApply(method) => method,
            _ => return Err(mismatch(ObjectKind::Operator)),
        };
        Ok(Methods {
            restriction_apply,
            basis_apply,
            tensor_contract,
            qfunction_apply,
            operator_apply,
        })
    }

    /// Prefixes of the registered backends, in registration order.
    pub fn backend_prefixes(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.prefix.as_str()).collect()
    }

    /// Resolves a resource string to a backend.
    ///
    /// Backends whose prefix is a prefix of the requested path are tried first, most specific
    /// first. If there are none, backends whose prefix extends the requested path are tried in
    /// order of priority, lowest value first. The first backend whose initialization accepts
    /// the resource is returned.
    pub fn resolve(&self, resource: &str) -> Result<Backend> {
        let (path, options) = resource.split_once(':').unwrap_or((resource, ""));
        ensure_config!(path.starts_with('/'), "resource `{}` does not start with `/`", resource);
        let options = BackendOptions::parse(options)?;

        let mut candidates: Vec<&BackendRegistration> = self
            .backends
            .iter()
            .filter(|backend| is_path_prefix(&backend.prefix, path))
            .collect();
        if candidates.is_empty() {
            candidates = self
                .backends
                .iter()
                .filter(|backend| is_path_prefix(path, &backend.prefix))
                .collect();
            candidates.sort_by(|a, b| (a.priority, &a.prefix).cmp(&(b.priority, &b.prefix)));
        } else {
            candidates.sort_by_key(|backend| Reverse(backend.prefix.len()));
        }

        for candidate in candidates {
            log::debug!("Trying backend `{}` for resource `{}`", candidate.prefix, resource);
            if let Some(setup) = (candidate.init)(resource, &options)? {
                let methods = self.methods_for(&candidate.prefix)?;
                log::debug!("Resolved resource `{}` to backend `{}`", resource, candidate.prefix);
                return Ok(Backend::new(
                    resource.to_string(),
                    candidate.prefix.clone(),
                    options,
                    setup,
                    methods,
                ));
            }
        }
        Err(Error::configuration(format!("no backend accepts resource `{resource}`")))
    }
}
