//! Interpolation and differentiation from element nodes to quadrature points.
//!
//! Nodal data is laid out `[comp][elem][node]`, values at quadrature points
//! `[comp][elem][q]`, gradients `[dim][comp][elem][q]` and quadrature weights `[elem][q]`.
//! Nodes and quadrature points of tensor-product bases are numbered with `x` varying fastest.
use std::fmt;
use std::fmt::{Debug, Formatter};

use nalgebra::DMatrix;
use parking_lot::Mutex;

use crate::backend::TensorContract;
use crate::error::{ensure_config, ensure_usage};
use crate::vector::Vector;
use crate::workspace::Workspace;
use crate::{Backend, ElemTopology, Error, EvalMode, QuadMode, Result, Scalar, TransposeMode};

pub mod plan;

use plan::{ContractionPlan, PlanShape, Slot, Table};

/// 1-D tables of a tensor-product basis. All tables are `q1d x p1d`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorTables {
    pub dim: usize,
    pub p1d: usize,
    pub q1d: usize,
    pub interp1d: Vec<Scalar>,
    pub grad1d: Vec<Scalar>,
    pub q_ref1d: Vec<Scalar>,
    pub q_weight1d: Vec<Scalar>,
}

/// Dense tables of a general basis.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralTables {
    pub topology: ElemTopology,
    pub num_nodes: usize,
    pub num_qpts: usize,
    /// `num_qpts x num_nodes`, row-major.
    pub interp: Vec<Scalar>,
    /// `dim x num_qpts x num_nodes`.
    pub grad: Vec<Scalar>,
    /// `dim x num_qpts`.
    pub q_ref: Vec<Scalar>,
    pub q_weight: Vec<Scalar>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BasisTables {
    Tensor(TensorTables),
    General(GeneralTables),
}

pub struct Basis {
    backend: Backend,
    num_comp: usize,
    tables: BasisTables,
    pub(crate) data: Mutex<Workspace>,
}

impl Debug for Basis {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Basis")
            .field("num_comp", &self.num_comp)
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

fn check_table_len(name: &str, table: &[Scalar], expected: usize) -> Result<()> {
    ensure_config!(
        table.len() == expected,
        "{} table has {} entries, expected {}",
        name,
        table.len(),
        expected
    );
    Ok(())
}

impl Basis {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn tensor_h1(
        backend: Backend,
        dim: usize,
        num_comp: usize,
        p1d: usize,
        q1d: usize,
        interp1d: &[Scalar],
        grad1d: &[Scalar],
        q_ref1d: &[Scalar],
        q_weight1d: &[Scalar],
    ) -> Result<Self> {
        ensure_config!((1..=3).contains(&dim), "tensor bases must have dimension 1, 2 or 3, got {}", dim);
        ensure_config!(num_comp > 0, "number of components must be positive");
        ensure_config!(p1d > 0 && q1d > 0, "tensor bases need at least one node and one quadrature point");
        check_table_len("interpolation", interp1d, q1d * p1d)?;
        check_table_len("gradient", grad1d, q1d * p1d)?;
        check_table_len("quadrature point", q_ref1d, q1d)?;
        check_table_len("quadrature weight", q_weight1d, q1d)?;

        log::debug!(
            "Created {}D tensor basis with {} components, P1d = {}, Q1d = {}",
            dim,
            num_comp,
            p1d,
            q1d
        );
        Ok(Self {
            backend,
            num_comp,
            tables: BasisTables::Tensor(TensorTables {
                dim,
                p1d,
                q1d,
                interp1d: interp1d.to_vec(),
                grad1d: grad1d.to_vec(),
                q_ref1d: q_ref1d.to_vec(),
                q_weight1d: q_weight1d.to_vec(),
            }),
            data: Mutex::new(Workspace::default()),
        })
    }

    /// Tensor-product Lagrange basis with Gauss-Lobatto nodes.
    pub(crate) fn tensor_h1_lagrange(
        backend: Backend,
        dim: usize,
        num_comp: usize,
        p: usize,
        q: usize,
        quad_mode: QuadMode,
    ) -> Result<Self> {
        ensure_config!(p >= 2, "Lagrange bases need at least two nodes per direction, got {}", p);
        let tables = matfree_quadrature::lagrange::LagrangeTables::new(p, q, quad_mode)?;
        Self::tensor_h1(
            backend,
            dim,
            num_comp,
            p,
            q,
            &tables.interp,
            &tables.grad,
            &tables.q_ref,
            &tables.q_weights,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn h1(
        backend: Backend,
        topology: ElemTopology,
        num_comp: usize,
        num_nodes: usize,
        num_qpts: usize,
        interp: &[Scalar],
        grad: &[Scalar],
        q_ref: &[Scalar],
        q_weight: &[Scalar],
    ) -> Result<Self> {
        let dim = topology.dim();
        ensure_config!(num_comp > 0, "number of components must be positive");
        check_table_len("interpolation", interp, num_qpts * num_nodes)?;
        check_table_len("gradient", grad, dim * num_qpts * num_nodes)?;
        check_table_len("quadrature point", q_ref, dim * num_qpts)?;
        check_table_len("quadrature weight", q_weight, num_qpts)?;

        log::debug!(
            "Created {:?} basis with {} components, P = {}, Q = {}",
            topology,
            num_comp,
            num_nodes,
            num_qpts
        );
        Ok(Self {
            backend,
            num_comp,
            tables: BasisTables::General(GeneralTables {
                topology,
                num_nodes,
                num_qpts,
                interp: interp.to_vec(),
                grad: grad.to_vec(),
                q_ref: q_ref.to_vec(),
                q_weight: q_weight.to_vec(),
            }),
            data: Mutex::new(Workspace::default()),
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn tables(&self) -> &BasisTables {
        &self.tables
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self.tables, BasisTables::Tensor(_))
    }

    pub fn dim(&self) -> usize {
        match &self.tables {
            BasisTables::Tensor(t) => t.dim,
            BasisTables::General(g) => g.topology.dim(),
        }
    }

    pub fn topology(&self) -> ElemTopology {
        match &self.tables {
            BasisTables::Tensor(t) => match t.dim {
                1 => ElemTopology::Line,
                2 => ElemTopology::Quad,
                _ => ElemTopology::Hex,
            },
            BasisTables::General(g) => g.topology,
        }
    }

    pub fn num_components(&self) -> usize {
        self.num_comp
    }

    /// Nodes per element.
    pub fn num_nodes(&self) -> usize {
        match &self.tables {
            BasisTables::Tensor(t) => t.p1d.pow(t.dim as u32),
            BasisTables::General(g) => g.num_nodes,
        }
    }

    /// Quadrature points per element.
    pub fn num_quadrature_points(&self) -> usize {
        match &self.tables {
            BasisTables::Tensor(t) => t.q1d.pow(t.dim as u32),
            BasisTables::General(g) => g.num_qpts,
        }
    }

    /// Quadrature weights of all points of an element.
    pub fn q_weights(&self) -> Vec<Scalar> {
        match &self.tables {
            BasisTables::Tensor(t) => matfree_quadrature::tensor::tensor_weights(&t.q_weight1d, t.dim),
            BasisTables::General(g) => g.q_weight.clone(),
        }
    }

    /// Reference coordinates of the quadrature points, `dim x Q`.
    pub fn q_ref(&self) -> Vec<Scalar> {
        match &self.tables {
            BasisTables::Tensor(t) => {
                let num_qpts = self.num_quadrature_points();
                (0..t.dim)
                    .flat_map(|d| {
                        let stride = t.q1d.pow(d as u32);
                        (0..num_qpts).map(move |i| t.q_ref1d[(i / stride) % t.q1d])
                    })
                    .collect()
            }
            BasisTables::General(g) => g.q_ref.clone(),
        }
    }

    /// The table a contraction step refers to.
    pub(crate) fn table(&self, table: Table) -> &[Scalar] {
        match (&self.tables, table) {
            (BasisTables::Tensor(t), Table::Interp) => &t.interp1d,
            (BasisTables::Tensor(t), Table::Grad(_)) => &t.grad1d,
            (BasisTables::General(g), Table::Interp) => &g.interp,
            (BasisTables::General(g), Table::Grad(d)) => {
                let size = g.num_qpts * g.num_nodes;
                &g.grad[d * size..(d + 1) * size]
            }
        }
    }

    /// All derivative tables, as stored on devices.
    pub(crate) fn grad_tables(&self) -> &[Scalar] {
        match &self.tables {
            BasisTables::Tensor(t) => &t.grad1d,
            BasisTables::General(g) => &g.grad,
        }
    }

    /// Offset of the table of direction `d` in [`grad_tables`](Self::grad_tables).
    pub(crate) fn grad_table_offset(&self, d: usize) -> usize {
        match &self.tables {
            BasisTables::Tensor(_) => 0,
            BasisTables::General(g) => d * g.num_qpts * g.num_nodes,
        }
    }

    /// Contraction plan for data of `outer * inner` elements.
    ///
    /// `outer` elements are stored outside the component index and `inner` elements
    /// innermost, so `outer = num_elem, inner = 1` is the standard layout and
    /// `outer = 1, inner = block_size` the blocked one.
    pub(crate) fn plan(&self, outer: usize, inner: usize, tmode: TransposeMode, emode: EvalMode) -> Result<ContractionPlan> {
        match &self.tables {
            BasisTables::Tensor(t) => {
                let shape = PlanShape {
                    dim: t.dim,
                    num_comp: self.num_comp,
                    p: t.p1d,
                    q: t.q1d,
                    outer,
                    inner,
                };
                ContractionPlan::tensor(shape, tmode, emode)
            }
            BasisTables::General(g) => {
                let shape = PlanShape {
                    dim: g.topology.dim(),
                    num_comp: self.num_comp,
                    p: g.num_nodes,
                    q: g.num_qpts,
                    outer,
                    inner,
                };
                ContractionPlan::general(shape, tmode, emode)
            }
        }
    }

    /// Number of quadrature values per element and component for the evaluation mode.
    fn quadrature_factor(&self, emode: EvalMode) -> usize {
        match emode {
            EvalMode::Grad => self.dim() * self.num_comp,
            EvalMode::Weight => 1,
            EvalMode::Interp | EvalMode::None => self.num_comp,
        }
    }

    /// Length of the quadrature-point data of `num_elem` elements.
    pub fn quadrature_len(&self, num_elem: usize, emode: EvalMode) -> usize {
        self.quadrature_factor(emode) * num_elem * self.num_quadrature_points()
    }

    /// Length of the nodal data of `num_elem` elements.
    pub fn nodal_len(&self, num_elem: usize) -> usize {
        self.num_comp * num_elem * self.num_nodes()
    }

    /// Evaluates the basis for `num_elem` elements.
    ///
    /// `NoTranspose` maps nodal values `u` to quadrature values `v`, overwriting `v`.
    /// `Transpose` applies the transposed map and adds the result into `v`. `Weight` ignores
    /// `u` and writes the quadrature weights of every element.
    pub fn apply(
        &self,
        num_elem: usize,
        tmode: TransposeMode,
        emode: EvalMode,
        u: Option<&Vector>,
        v: &Vector,
    ) -> Result<()> {
        match emode {
            EvalMode::None => return Err(Error::usage("evaluation mode None does not apply a basis")),
            EvalMode::Weight => {
                ensure_usage!(
                    !tmode.is_transpose(),
                    "quadrature weights cannot be applied in transpose"
                );
                ensure_usage!(
                    v.length() == self.quadrature_len(num_elem, emode),
                    "weight output has length {}, expected {}",
                    v.length(),
                    self.quadrature_len(num_elem, emode)
                );
            }
            EvalMode::Interp | EvalMode::Grad => {
                let u = u.ok_or_else(|| Error::usage(format!("{emode:?} requires an input vector")))?;
                let nodal = self.nodal_len(num_elem);
                let quad = self.quadrature_len(num_elem, emode);
                let (u_len, v_len) = match tmode {
                    TransposeMode::NoTranspose => (nodal, quad),
                    TransposeMode::Transpose => (quad, nodal),
                };
                ensure_usage!(
                    u.length() == u_len,
                    "basis input has length {}, expected {}",
                    u.length(),
                    u_len
                );
                ensure_usage!(
                    v.length() == v_len,
                    "basis output has length {}, expected {}",
                    v.length(),
                    v_len
                );
            }
        }
        self.backend
            .methods()
            .basis_apply
            .apply(self, num_elem, tmode, emode, u, v)
    }

    /// Writes the weights of `outer * inner` elements into `v`, laid out as in
    /// [`plan`](Self::plan).
    pub(crate) fn fill_weights(&self, outer: usize, inner: usize, v: &mut [Scalar]) {
        let weights = self.q_weights();
        let num_qpts = weights.len();
        for (i, v_i) in v.iter_mut().enumerate().take(outer * num_qpts * inner) {
            *v_i = weights[(i / inner) % num_qpts];
        }
    }

    /// Runs a contraction plan on host data.
    pub(crate) fn run_plan(
        &self,
        plan: &ContractionPlan,
        contract: &dyn TensorContract,
        u: &[Scalar],
        v: &mut [Scalar],
        scratch: &mut [Vec<Scalar>; 2],
    ) -> Result<()> {
        for buffer in scratch.iter_mut() {
            if buffer.len() < plan.scratch_len {
                buffer.resize(plan.scratch_len, 0.0);
            }
        }
        let [scratch0, scratch1] = scratch;

        for step in &plan.steps {
            let (src_len, dst_len) = (step.src_len(), step.dst_len());
            let (src, dst): (&[Scalar], &mut [Scalar]) = match (step.src, step.dst) {
                (Slot::Input(i), Slot::Output(o)) => (&u[i..i + src_len], &mut v[o..o + dst_len]),
                (Slot::Input(i), Slot::Scratch(k)) => {
                    let dst = if k == 0 { &mut *scratch0 } else { &mut *scratch1 };
                    (&u[i..i + src_len], &mut dst[..dst_len])
                }
                (Slot::Scratch(k), Slot::Output(o)) => {
                    let src = if k == 0 { &*scratch0 } else { &*scratch1 };
                    (&src[..src_len], &mut v[o..o + dst_len])
                }
                (Slot::Scratch(0), Slot::Scratch(1)) => (&scratch0[..src_len], &mut scratch1[..dst_len]),
                (Slot::Scratch(1), Slot::Scratch(0)) => (&scratch1[..src_len], &mut scratch0[..dst_len]),
                (src, dst) => {
                    return Err(Error::backend(
                        self.backend.resource(),
                        format!("contraction step cannot read {src:?} and write {dst:?}"),
                    ))
                }
            };
            contract.contract(step, self.table(step.table), src, dst);
        }
        Ok(())
    }

    fn dense(rows: usize, cols: usize, row_major: &[Scalar]) -> DMatrix<Scalar> {
        DMatrix::from_row_slice(rows, cols, row_major)
    }

    fn to_row_major(matrix: &DMatrix<Scalar>) -> Vec<Scalar> {
        matrix.transpose().as_slice().to_vec()
    }

    /// Kronecker product of the 1-D tables, with `grad_axis` using the derivative table.
    fn kronecker(t: &TensorTables, grad_axis: Option<usize>) -> DMatrix<Scalar> {
        let interp = Self::dense(t.q1d, t.p1d, &t.interp1d);
        let grad = Self::dense(t.q1d, t.p1d, &t.grad1d);
        // The slowest index comes first in the product, so start with the last axis
        (0..t.dim).rev().fold(DMatrix::from_element(1, 1, 1.0), |product, axis| {
            let factor = if grad_axis == Some(axis) { &grad } else { &interp };
            product.kronecker(factor)
        })
    }

    /// Dense `Q x P` interpolation matrix, row-major.
    pub fn full_interp(&self) -> Vec<Scalar> {
        match &self.tables {
            BasisTables::Tensor(t) => Self::to_row_major(&Self::kronecker(t, None)),
            BasisTables::General(g) => g.interp.clone(),
        }
    }

    /// Dense `dim x Q x P` gradient matrices, row-major.
    pub fn full_grad(&self) -> Vec<Scalar> {
        match &self.tables {
            BasisTables::Tensor(t) => (0..t.dim)
                .flat_map(|axis| Self::to_row_major(&Self::kronecker(t, Some(axis))))
                .collect(),
            BasisTables::General(g) => g.grad.clone(),
        }
    }
}
