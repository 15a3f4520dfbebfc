//! Operators composing restrictions, bases and a QFunction.
//!
//! An [`Operator`] is built by binding every field of its QFunction to an element
//! restriction, a basis and a vector. Fields bound to [`VectorOpt::Active`] read the input
//! or write the output of [`Operator::apply`], fields bound to a vector use that vector on
//! every application, and weight fields are bound to no vector at all.
//!
//! ```
//! use matfree::operator::{BasisOpt, ElemRestrictionOpt, VectorOpt};
//! use matfree::{EvalMode, QuadMode, Registry, TransposeMode};
//!
//! # fn main() -> matfree::Result<()> {
//! let backend = Registry::builtin().resolve("/cpu/self")?;
//! let (num_elem, p, q) = (2, 2, 2);
//! let r = backend.elem_restriction(num_elem, p, 1, 3, &[0, 1, 1, 2])?;
//! let basis = backend.basis_tensor_h1_lagrange(1, 1, p, q, QuadMode::Gauss)?;
//! let qf = backend.q_function_identity(1, EvalMode::Interp, EvalMode::Interp)?;
//! let op = backend
//!     .operator(&qf)?
//!     .field("input", &r, TransposeMode::Transpose, &basis, VectorOpt::Active)?
//!     .field("output", &r, TransposeMode::Transpose, &basis, VectorOpt::Active)?;
//!
//! let u = backend.vector_from_slice(&[1.0, 1.0, 1.0])?;
//! let v = backend.vector(3)?;
//! op.apply(&u, &v)?;
//! // The middle node is shared by both elements and receives both contributions
//! let v = v.to_vec()?;
//! assert!((v[1] - 2.0 * v[0]).abs() < 1e-12);
//! # Ok(())
//! # }
//! ```
use std::fmt;
use std::fmt::{Debug, Formatter};

use parking_lot::Mutex;

use crate::basis::Basis;
use crate::elem_restriction::ElemRestriction;
use crate::error::{ensure_config, ensure_usage};
use crate::qfunction::QFunction;
use crate::vector::Vector;
use crate::workspace::Workspace;
use crate::{Backend, Error, EvalMode, Result, TransposeMode};

mod composite;
mod diagonal;

pub use composite::CompositeOperator;

/// Element restriction of a field. Only weight fields have none.
#[derive(Debug, Clone, Copy)]
pub enum ElemRestrictionOpt<'a> {
    Some(&'a ElemRestriction),
    None,
}

impl<'a> From<&'a ElemRestriction> for ElemRestrictionOpt<'a> {
    fn from(restriction: &'a ElemRestriction) -> Self {
        Self::Some(restriction)
    }
}

/// Basis of a field, or none for fields given directly at quadrature points.
#[derive(Debug, Clone, Copy)]
pub enum BasisOpt<'a> {
    Some(&'a Basis),
    Collocated,
}

impl<'a> From<&'a Basis> for BasisOpt<'a> {
    fn from(basis: &'a Basis) -> Self {
        Self::Some(basis)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum VectorOpt<'a> {
    Some(&'a Vector<'a>),
    /// The input or output vector of the application.
    Active,
    /// No vector, for weight fields.
    None,
}

impl<'a> From<&'a Vector<'a>> for VectorOpt<'a> {
    fn from(vector: &'a Vector<'a>) -> Self {
        Self::Some(vector)
    }
}

impl VectorOpt<'_> {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// A QFunction field bound to its restriction, basis and vector.
#[derive(Debug, Clone)]
pub struct OperatorField<'a> {
    name: String,
    eval_mode: EvalMode,
    size: usize,
    restriction: Option<&'a ElemRestriction>,
    lmode: TransposeMode,
    basis: Option<&'a Basis>,
    vector: VectorOpt<'a>,
}

impl<'a> OperatorField<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn eval_mode(&self) -> EvalMode {
        self.eval_mode
    }

    /// Size of the QFunction field.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn restriction(&self) -> Option<&'a ElemRestriction> {
        self.restriction
    }

    pub fn lmode(&self) -> TransposeMode {
        self.lmode
    }

    /// The basis, `None` for collocated fields.
    pub fn basis(&self) -> Option<&'a Basis> {
        self.basis
    }

    pub fn vector(&self) -> VectorOpt<'a> {
        self.vector
    }

    /// The vector the field reads or writes, given the active vector of an application.
    pub(crate) fn resolve_vector<'v>(&self, active: &'v Vector<'v>) -> Option<&'v Vector<'v>>
    where
        'a: 'v,
    {
        match self.vector {
            VectorOpt::Some(vector) => Some(vector),
            VectorOpt::Active => Some(active),
            VectorOpt::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorStage {
    Unassembled,
    Finalized,
    Applied,
}

struct OperatorState {
    stage: OperatorStage,
    setup_pending: bool,
    workspace: Workspace,
}

/// An operator run before the first application to compute data the operator reads, such as
/// geometric factors at quadrature points.
struct SetupStage<'a> {
    op: Operator<'a>,
    input: &'a Vector<'a>,
    output: &'a Vector<'a>,
}

pub struct Operator<'a> {
    backend: Backend,
    qf: &'a QFunction,
    inputs: Vec<Option<OperatorField<'a>>>,
    outputs: Vec<Option<OperatorField<'a>>>,
    num_elem: Option<usize>,
    num_qpts: Option<usize>,
    setup: Option<Box<SetupStage<'a>>>,
    state: Mutex<OperatorState>,
}

impl Debug for Operator<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("qfunction", &self.qf.entry_point())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("num_elem", &self.num_elem)
            .field("num_qpts", &self.num_qpts)
            .field("stage", &self.state.try_lock().map(|state| state.stage))
            .finish_non_exhaustive()
    }
}

impl<'a> Operator<'a> {
    pub(crate) fn new(backend: Backend, qf: &'a QFunction) -> Result<Self> {
        ensure_config!(
            qf.backend().same_as(&backend),
            "QFunction `{}` was created by a different backend",
            qf.entry_point()
        );
        Ok(Self {
            backend,
            qf,
            inputs: vec![None; qf.inputs().len()],
            outputs: vec![None; qf.outputs().len()],
            num_elem: None,
            num_qpts: None,
            setup: None,
            state: Mutex::new(OperatorState {
                stage: OperatorStage::Unassembled,
                setup_pending: false,
                workspace: Workspace::default(),
            }),
        })
    }

    /// Binds the QFunction field `name`.
    pub fn field(
        mut self,
        name: &str,
        restriction: impl Into<ElemRestrictionOpt<'a>>,
        lmode: TransposeMode,
        basis: impl Into<BasisOpt<'a>>,
        vector: impl Into<VectorOpt<'a>>,
    ) -> Result<Self> {
        ensure_usage!(
            self.stage() == OperatorStage::Unassembled,
            "cannot bind field `{}` of an operator that has been finalized",
            name
        );
        let (is_input, idx, qf_field) = match self.qf.inputs().iter().position(|f| f.name() == name) {
            Some(idx) => (true, idx, &self.qf.inputs()[idx]),
            None => match self.qf.outputs().iter().position(|f| f.name() == name) {
                Some(idx) => (false, idx, &self.qf.outputs()[idx]),
                None => {
                    return Err(Error::configuration(format!(
                        "QFunction `{}` has no field named `{}`",
                        self.qf.entry_point(),
                        name
                    )))
                }
            },
        };
        let slot = if is_input { &self.inputs[idx] } else { &self.outputs[idx] };
        ensure_usage!(slot.is_none(), "field `{}` is already bound", name);

        let restriction = match restriction.into() {
            ElemRestrictionOpt::Some(r) => Some(r),
            ElemRestrictionOpt::None => None,
        };
        let basis = match basis.into() {
            BasisOpt::Some(b) => Some(b),
            BasisOpt::Collocated => None,
        };
        let vector = vector.into();
        let (size, eval_mode) = (qf_field.size(), qf_field.eval_mode());

        for backend in restriction.map(|r| r.backend()).into_iter().chain(basis.map(|b| b.backend())) {
            ensure_config!(
                backend.same_as(&self.backend),
                "field `{}` uses an object of a different backend",
                name
            );
        }

        let num_qpts = match (eval_mode, restriction, basis) {
            (EvalMode::Weight, None, Some(basis)) => {
                ensure_config!(
                    matches!(vector, VectorOpt::None),
                    "weight field `{}` cannot be bound to a vector",
                    name
                );
                basis.num_quadrature_points()
            }
            (EvalMode::Weight, _, _) => {
                return Err(Error::configuration(format!(
                    "weight field `{name}` needs a basis and no element restriction"
                )))
            }
            (EvalMode::None, Some(r), None) => {
                ensure_config!(
                    r.num_components() == size,
                    "field `{}` has size {}, but its restriction has {} components",
                    name,
                    size,
                    r.num_components()
                );
                r.elem_size()
            }
            (EvalMode::None, _, _) => {
                return Err(Error::configuration(format!(
                    "field `{name}` without evaluation needs a restriction and a collocated basis"
                )))
            }
            (EvalMode::Interp | EvalMode::Grad, Some(r), Some(basis)) => {
                let expected_size = match eval_mode {
                    EvalMode::Grad => basis.num_components() * basis.dim(),
                    _ => basis.num_components(),
                };
                ensure_config!(
                    size == expected_size,
                    "field `{}` has size {}, but {:?} of its basis has {} components",
                    name,
                    size,
                    eval_mode,
                    expected_size
                );
                ensure_config!(
                    r.num_components() == basis.num_components(),
                    "restriction of field `{}` has {} components, but its basis has {}",
                    name,
                    r.num_components(),
                    basis.num_components()
                );
                ensure_config!(
                    r.elem_size() == basis.num_nodes(),
                    "restriction of field `{}` has element size {}, but its basis has {} nodes",
                    name,
                    r.elem_size(),
                    basis.num_nodes()
                );
                basis.num_quadrature_points()
            }
            (_, _, _) => {
                return Err(Error::configuration(format!(
                    "field `{name}` evaluated with {eval_mode:?} needs a restriction and a basis"
                )))
            }
        };

        if let Some(r) = restriction {
            ensure_config!(
                r.block_size() == 1,
                "blocked restrictions cannot be bound to operator fields"
            );
            match vector {
                VectorOpt::Some(v) => ensure_config!(
                    v.length() == r.l_size(),
                    "vector of field `{}` has length {}, but its restriction has L-size {}",
                    name,
                    v.length(),
                    r.l_size()
                ),
                VectorOpt::Active => {
                    let fields = if is_input { &self.inputs } else { &self.outputs };
                    let other = fields
                        .iter()
                        .flatten()
                        .filter(|f| f.vector.is_active())
                        .find_map(|f| f.restriction);
                    if let Some(other) = other {
                        ensure_config!(
                            other.l_size() == r.l_size(),
                            "active field `{}` has L-size {}, but other active fields have L-size {}",
                            name,
                            r.l_size(),
                            other.l_size()
                        );
                    }
                }
                VectorOpt::None => {
                    return Err(Error::configuration(format!("field `{name}` must be bound to a vector")))
                }
            }
            match self.num_elem {
                Some(num_elem) => ensure_config!(
                    num_elem == r.num_elements(),
                    "field `{}` has {} elements, but the operator has {}",
                    name,
                    r.num_elements(),
                    num_elem
                ),
                None => self.num_elem = Some(r.num_elements()),
            }
        }
        match self.num_qpts {
            Some(q) => ensure_config!(
                q == num_qpts,
                "field `{}` has {} quadrature points per element, but the operator has {}",
                name,
                num_qpts,
                q
            ),
            None => self.num_qpts = Some(num_qpts),
        }

        let field = OperatorField {
            name: name.to_string(),
            eval_mode,
            size,
            restriction,
            lmode,
            basis,
            vector,
        };
        if is_input {
            self.inputs[idx] = Some(field);
        } else {
            self.outputs[idx] = Some(field);
        }
        Ok(self)
    }

    /// Runs `setup` on `input` and `output` before the first application, and again before
    /// the first application after [`invalidate_setup`](Self::invalidate_setup).
    pub fn with_setup(mut self, setup: Operator<'a>, input: &'a Vector<'a>, output: &'a Vector<'a>) -> Result<Self> {
        ensure_usage!(
            self.stage() == OperatorStage::Unassembled,
            "the setup stage must be attached before the operator is finalized"
        );
        self.setup = Some(Box::new(SetupStage {
            op: setup,
            input,
            output,
        }));
        self.state.get_mut().setup_pending = true;
        Ok(self)
    }

    /// Makes the setup stage run again before the next application.
    pub fn invalidate_setup(&self) {
        if self.setup.is_some() {
            self.state.lock().setup_pending = true;
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn qfunction(&self) -> &'a QFunction {
        self.qf
    }

    pub fn stage(&self) -> OperatorStage {
        self.state.lock().stage
    }

    /// Number of elements, zero until a field with a restriction is bound.
    pub fn num_elements(&self) -> usize {
        self.num_elem.unwrap_or(0)
    }

    /// Quadrature points per element, zero until a field is bound.
    pub fn num_quadrature_points(&self) -> usize {
        self.num_qpts.unwrap_or(0)
    }

    /// Bound input fields, in QFunction order.
    pub fn input_fields(&self) -> impl Iterator<Item = &OperatorField<'a>> {
        self.inputs.iter().flatten()
    }

    /// Bound output fields, in QFunction order.
    pub fn output_fields(&self) -> impl Iterator<Item = &OperatorField<'a>> {
        self.outputs.iter().flatten()
    }

    fn active_size(fields: &[Option<OperatorField<'a>>]) -> Option<usize> {
        fields
            .iter()
            .flatten()
            .filter(|f| f.vector.is_active())
            .find_map(|f| f.restriction.map(|r| r.l_size()))
    }

    /// Length of the active input, `None` if no input is active.
    pub fn input_size(&self) -> Option<usize> {
        Self::active_size(&self.inputs)
    }

    /// Length of the active output, `None` if no output is active.
    pub fn output_size(&self) -> Option<usize> {
        Self::active_size(&self.outputs)
    }

    pub(crate) fn passive_outputs(&self) -> impl Iterator<Item = &'a Vector<'a>> + '_ {
        self.output_fields().filter_map(|f| match f.vector {
            VectorOpt::Some(v) => Some(v),
            _ => None,
        })
    }

    /// Checks that every field is bound and prepares the backend for applications.
    ///
    /// Applying an operator finalizes it if necessary.
    pub fn finalize(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.finalize_locked(&mut state)
    }

    fn finalize_locked(&self, state: &mut OperatorState) -> Result<()> {
        if state.stage != OperatorStage::Unassembled {
            return Ok(());
        }
        let unbound = self
            .qf
            .inputs()
            .iter()
            .zip(&self.inputs)
            .chain(self.qf.outputs().iter().zip(&self.outputs))
            .find(|(_, bound)| bound.is_none());
        if let Some((field, _)) = unbound {
            return Err(Error::usage(format!(
                "field `{}` of QFunction `{}` is not bound",
                field.name(),
                self.qf.entry_point()
            )));
        }
        let num_elem = self
            .num_elem
            .ok_or_else(|| Error::configuration("operator has no field with an element restriction"))?;
        let num_qpts = self.num_quadrature_points();
        ensure_config!(
            (num_elem * num_qpts) % self.qf.vlength() == 0,
            "{} quadrature points are not a multiple of the QFunction vector length {}",
            num_elem * num_qpts,
            self.qf.vlength()
        );

        self.backend
            .methods()
            .operator_apply
            .prepare(self, &mut state.workspace)?;
        state.stage = OperatorStage::Finalized;
        log::debug!(
            "Finalized operator for QFunction `{}` with {} elements and {} quadrature points per element",
            self.qf.entry_point(),
            num_elem,
            num_qpts
        );
        Ok(())
    }

    fn run_setup_locked(&self, state: &mut OperatorState) -> Result<()> {
        if let Some(setup) = &self.setup {
            if state.setup_pending {
                log::debug!("Running setup of operator for QFunction `{}`", self.qf.entry_point());
                setup.op.apply(setup.input, setup.output)?;
                state.setup_pending = false;
            }
        }
        Ok(())
    }

    /// Finalizes the operator and runs the setup stage if necessary.
    fn prepare_locked(&self) -> Result<parking_lot::MutexGuard<'_, OperatorState>> {
        let mut state = self.state.lock();
        self.finalize_locked(&mut state)?;
        self.run_setup_locked(&mut state)?;
        Ok(state)
    }

    fn check_active(&self, input: &Vector, output: &Vector) -> Result<()> {
        if let Some(size) = self.input_size() {
            ensure_usage!(
                input.length() == size,
                "input vector has length {}, but the operator expects {}",
                input.length(),
                size
            );
        }
        if let Some(size) = self.output_size() {
            ensure_usage!(
                output.length() == size,
                "output vector has length {}, but the operator expects {}",
                output.length(),
                size
            );
        }
        Ok(())
    }

    /// Zeroes the active output and the vectors of passive outputs.
    pub(crate) fn zero_outputs(&self, output: &Vector) -> Result<()> {
        if self.output_size().is_some() {
            output.set_value(0.0)?;
        }
        for vector in self.passive_outputs() {
            vector.set_value(0.0)?;
        }
        Ok(())
    }

    /// Computes `output = A(input)`, also overwriting the vectors of passive output fields.
    pub fn apply(&self, input: &Vector, output: &Vector) -> Result<()> {
        self.check_active(input, output)?;
        self.zero_outputs(output)?;
        self.apply_add(input, output)
    }

    /// Computes `output += A(input)`.
    pub fn apply_add(&self, input: &Vector, output: &Vector) -> Result<()> {
        self.check_active(input, output)?;
        let mut state = self.prepare_locked()?;
        let OperatorState { workspace, .. } = &mut *state;
        self.backend
            .methods()
            .operator_apply
            .apply_add(self, workspace, input, output)?;
        state.stage = OperatorStage::Applied;
        Ok(())
    }

    /// Writes the diagonal of the linear operator to `diag`.
    ///
    /// The QFunction is assumed to be linear in its active input. Supported are operators
    /// with a single active input and output field that share restriction and basis.
    pub fn linear_assemble_diagonal(&self, diag: &Vector) -> Result<()> {
        diag.set_value(0.0)?;
        self.linear_assemble_add_diagonal(diag)
    }

    /// Adds the diagonal of the linear operator to `diag`.
    pub fn linear_assemble_add_diagonal(&self, diag: &Vector) -> Result<()> {
        // Only the setup stage needs the lock, the assembly runs on the bound objects
        drop(self.prepare_locked()?);
        diagonal::assemble_add_diagonal(self, diag)
    }
}
