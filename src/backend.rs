//! Backend contexts and the method interfaces backends implement.
//!
//! A [`Backend`] is the result of resolving a resource string against a
//! [`Registry`](crate::Registry). It owns the device the backend runs on (if any) and the
//! table of method implementations selected for it, and it is the factory for every other
//! object. Objects keep a handle to the backend that created them and dispatch through its
//! method table.
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::basis::plan::ContractionStep;
use crate::basis::Basis;
use crate::device::Device;
use crate::elem_restriction::{ElemRestriction, RestrictionLayout};
use crate::operator::{CompositeOperator, Operator};
use crate::qfunction::{kernel_fn, QFunction};
use crate::vector::Vector;
use crate::workspace::Workspace;
use crate::{BackendOptions, ElemTopology, EvalMode, QuadMode, Result, Scalar, TransposeMode};

pub mod blocked;
pub mod cpu;
pub mod opt;
pub mod serial;
pub mod sim;

/// Restriction between L-vectors and E-vectors.
pub trait ElemRestrictionApply: Send + Sync {
    fn apply(
        &self,
        restriction: &ElemRestriction,
        tmode: TransposeMode,
        lmode: TransposeMode,
        u: &Vector,
        v: &Vector,
    ) -> Result<()>;
}

/// Basis evaluation. Input and output lengths have been checked by the caller.
pub trait BasisApply: Send + Sync {
    fn apply(
        &self,
        basis: &Basis,
        num_elem: usize,
        tmode: TransposeMode,
        emode: EvalMode,
        u: Option<&Vector>,
        v: &Vector,
    ) -> Result<()>;
}

/// A single 1-D contraction on host data.
///
/// Computes `v[(a * J + j) * C + c] (+)= sum_b t[j][b] * u[(a * B + b) * C + c]`, where the
/// table `t` is `J x B` row-major, or `B x J` row-major if the step is transposed. `v` is
/// overwritten unless the step adds.
pub trait TensorContract: Send + Sync {
    fn contract(&self, step: &ContractionStep, t: &[Scalar], u: &[Scalar], v: &mut [Scalar]);
}

/// Evaluation of a QFunction at `q` points.
pub trait QFunctionApply: Send + Sync {
    fn apply(&self, qf: &QFunction, q: usize, inputs: &[&Vector], outputs: &[&Vector]) -> Result<()>;
}

/// Composition of the operator pipeline.
pub trait OperatorApply: Send + Sync {
    /// Called once when the operator is finalized, to allocate work buffers.
    fn prepare(&self, op: &Operator, workspace: &mut Workspace) -> Result<()>;

    /// Adds the action of the operator on `input` to `output`.
    fn apply_add(&self, op: &Operator, workspace: &mut Workspace, input: &Vector, output: &Vector) -> Result<()>;
}

/// Kind of object a method belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    ElemRestriction,
    Basis,
    TensorContract,
    QFunction,
    Operator,
}

/// A method implementation, as stored in the registry.
#[derive(Clone)]
pub enum Method {
    ElemRestrictionApply(Arc<dyn ElemRestrictionApply>),
    BasisApply(Arc<dyn BasisApply>),
    TensorContract(Arc<dyn TensorContract>),
    QFunctionApply(Arc<dyn QFunctionApply>),
    OperatorApply(Arc<dyn OperatorApply>),
}

impl Method {
    /// The kind of object the implementation can serve.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::ElemRestrictionApply(_) => ObjectKind::ElemRestriction,
            Self::BasisApply(_) => ObjectKind::Basis,
            Self::TensorContract(_) => ObjectKind::TensorContract,
            Self::QFunctionApply(_) => ObjectKind::QFunction,
            Self::OperatorApply(_) => ObjectKind::Operator,
        }
    }
}

impl Debug for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Method::{:?}", self.kind())
    }
}

/// Method table of a resolved backend.
#[derive(Clone)]
pub(crate) struct Methods {
    pub restriction_apply: Arc<dyn ElemRestrictionApply>,
    pub basis_apply: Arc<dyn BasisApply>,
    pub tensor_contract: Arc<dyn TensorContract>,
    pub qfunction_apply: Arc<dyn QFunctionApply>,
    pub operator_apply: Arc<dyn OperatorApply>,
}

/// What the initialization function of a backend hands back when it accepts a resource.
#[derive(Debug, Default)]
pub struct BackendSetup {
    pub device: Option<Arc<dyn Device>>,
}

struct BackendInner {
    resource: String,
    prefix: String,
    options: BackendOptions,
    device: Option<Arc<dyn Device>>,
    methods: Methods,
    data: Mutex<Workspace>,
}

/// Handle to a resolved backend. Cloning is cheap.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

impl Debug for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("resource", &self.inner.resource)
            .field("prefix", &self.inner.prefix)
            .field("options", &self.inner.options)
            .field("device", &self.inner.device.as_ref().map(|d| d.name().to_string()))
            .finish()
    }
}

impl Backend {
    pub(crate) fn new(
        resource: String,
        prefix: String,
        options: BackendOptions,
        setup: BackendSetup,
        methods: Methods,
    ) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                resource,
                prefix,
                options,
                device: setup.device,
                methods,
                data: Mutex::new(Workspace::default()),
            }),
        }
    }

    /// The resource string the backend was resolved from.
    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Prefix of the backend registration that accepted the resource.
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn options(&self) -> &BackendOptions {
        &self.inner.options
    }

    pub fn device(&self) -> Option<&Arc<dyn Device>> {
        self.inner.device.as_ref()
    }

    pub(crate) fn methods(&self) -> &Methods {
        &self.inner.methods
    }

    /// Backend-wide data, such as compiled builtin kernels.
    pub(crate) fn data(&self) -> &Mutex<Workspace> {
        &self.inner.data
    }

    /// Whether two handles refer to the same resolved backend.
    pub fn same_as(&self, other: &Backend) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn vector<'a>(&self, length: usize) -> Result<Vector<'a>> {
        Ok(Vector::create(length, self.inner.device.clone()))
    }

    pub fn vector_from_slice<'a>(&self, values: &[Scalar]) -> Result<Vector<'a>> {
        Ok(Vector::from_slice(values, self.inner.device.clone()))
    }

    /// Restriction with an explicit offset table of `num_elem * elem_size` node indices.
    pub fn elem_restriction(
        &self,
        num_elem: usize,
        elem_size: usize,
        num_comp: usize,
        l_size: usize,
        offsets: &[usize],
    ) -> Result<ElemRestriction> {
        ElemRestriction::new(
            self.clone(),
            num_elem,
            elem_size,
            1,
            num_comp,
            l_size,
            RestrictionLayout::Offsets(offsets.to_vec()),
        )
    }

    /// Restriction with L-vector strides `(node, comp, elem)`.
    pub fn strided_elem_restriction(
        &self,
        num_elem: usize,
        elem_size: usize,
        num_comp: usize,
        l_size: usize,
        strides: [usize; 3],
    ) -> Result<ElemRestriction> {
        ElemRestriction::new(
            self.clone(),
            num_elem,
            elem_size,
            1,
            num_comp,
            l_size,
            RestrictionLayout::Strided(strides),
        )
    }

    /// Strided restriction whose L-vector has the same layout as its E-vector.
    pub fn identity_elem_restriction(
        &self,
        num_elem: usize,
        elem_size: usize,
        num_comp: usize,
        l_size: usize,
    ) -> Result<ElemRestriction> {
        self.strided_elem_restriction(num_elem, elem_size, num_comp, l_size, [1, num_elem * elem_size, elem_size])
    }

    pub fn blocked_elem_restriction(
        &self,
        num_elem: usize,
        elem_size: usize,
        block_size: usize,
        num_comp: usize,
        l_size: usize,
        offsets: &[usize],
    ) -> Result<ElemRestriction> {
        ElemRestriction::new(
            self.clone(),
            num_elem,
            elem_size,
            block_size,
            num_comp,
            l_size,
            RestrictionLayout::Offsets(offsets.to_vec()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn basis_tensor_h1(
        &self,
        dim: usize,
        num_comp: usize,
        p1d: usize,
        q1d: usize,
        interp1d: &[Scalar],
        grad1d: &[Scalar],
        q_ref1d: &[Scalar],
        q_weight1d: &[Scalar],
    ) -> Result<Basis> {
        Basis::tensor_h1(
            self.clone(),
            dim,
            num_comp,
            p1d,
            q1d,
            interp1d,
            grad1d,
            q_ref1d,
            q_weight1d,
        )
    }

    pub fn basis_tensor_h1_lagrange(
        &self,
        dim: usize,
        num_comp: usize,
        p: usize,
        q: usize,
        quad_mode: QuadMode,
    ) -> Result<Basis> {
        Basis::tensor_h1_lagrange(self.clone(), dim, num_comp, p, q, quad_mode)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn basis_h1(
        &self,
        topology: ElemTopology,
        num_comp: usize,
        num_nodes: usize,
        num_qpts: usize,
        interp: &[Scalar],
        grad: &[Scalar],
        q_ref: &[Scalar],
        q_weight: &[Scalar],
    ) -> Result<Basis> {
        Basis::h1(
            self.clone(),
            topology,
            num_comp,
            num_nodes,
            num_qpts,
            interp,
            grad,
            q_ref,
            q_weight,
        )
    }

    /// QFunction evaluated at interior quadrature points.
    ///
    /// `source` names the kernel source as `path/to/file.ext:entry`. Backends with a device
    /// read the companion `path/to/file.h` here.
    pub fn q_function_interior<F>(&self, vlength: usize, kernel: F, source: &str) -> Result<QFunction>
    where
        F: Fn(&[u8], usize, &[&[Scalar]], &mut [&mut [Scalar]]) -> i32 + Send + Sync + 'static,
    {
        QFunction::interior(self.clone(), vlength, kernel_fn(kernel), source)
    }

    /// QFunction from the built-in gallery.
    pub fn q_function_by_name(&self, name: &str) -> Result<QFunction> {
        crate::gallery::by_name(self.clone(), name)
    }

    /// QFunction copying `size` components from its input to its output.
    pub fn q_function_identity(&self, size: usize, in_mode: EvalMode, out_mode: EvalMode) -> Result<QFunction> {
        crate::gallery::identity(self.clone(), size, in_mode, out_mode)
    }

    pub fn operator<'a>(&self, qf: &'a QFunction) -> Result<Operator<'a>> {
        Operator::new(self.clone(), qf)
    }

    pub fn composite_operator<'a>(&self) -> Result<CompositeOperator<'a>> {
        Ok(CompositeOperator::new(self.clone()))
    }
}
