//! Reference implementations running on the host.
use crate::backend::{BackendSetup, BasisApply, ElemRestrictionApply, QFunctionApply, TensorContract};
use crate::basis::plan::ContractionStep;
use crate::basis::Basis;
use crate::elem_restriction::ElemRestriction;
use crate::qfunction::QFunction;
use crate::registry::BackendOptions;
use crate::vector::{Vector, VectorView, VectorViewMut};
use crate::{Error, EvalMode, Result, Scalar, TransposeMode};

/// Host backends accept every resource they are registered for.
pub fn init(_resource: &str, _options: &BackendOptions) -> Result<Option<BackendSetup>> {
    Ok(Some(BackendSetup::default()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuRestriction;

impl ElemRestrictionApply for CpuRestriction {
    fn apply(
        &self,
        restriction: &ElemRestriction,
        tmode: TransposeMode,
        lmode: TransposeMode,
        u: &Vector,
        v: &Vector,
    ) -> Result<()> {
        let u = u.view()?;
        let mut v = v.view_mut()?;
        match tmode {
            TransposeMode::NoTranspose => restriction.gather(lmode, &u, &mut v),
            TransposeMode::Transpose => restriction.scatter_add(lmode, &u, &mut v),
        }
        Ok(())
    }
}

/// Scratch buffers of a basis, kept between applications.
#[derive(Debug, Default)]
struct CpuBasisScratch([Vec<Scalar>; 2]);

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBasis;

impl BasisApply for CpuBasis {
    fn apply(
        &self,
        basis: &Basis,
        num_elem: usize,
        tmode: TransposeMode,
        emode: EvalMode,
        u: Option<&Vector>,
        v: &Vector,
    ) -> Result<()> {
        if emode == EvalMode::Weight {
            basis.fill_weights(num_elem, 1, &mut v.view_mut()?);
            return Ok(());
        }
        let u = u.ok_or_else(|| Error::usage(format!("{emode:?} requires an input vector")))?;
        let plan = basis.plan(num_elem, 1, tmode, emode)?;
        let contract = basis.backend().methods().tensor_contract.clone();

        let u = u.view()?;
        let mut v = v.view_mut()?;
        let mut data = basis.data.lock();
        let CpuBasisScratch(scratch) = data.get_or_default::<CpuBasisScratch>();
        basis.run_plan(&plan, contract.as_ref(), &u, &mut v, scratch)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuQFunction;

impl QFunctionApply for CpuQFunction {
    fn apply(&self, qf: &QFunction, q: usize, inputs: &[&Vector], outputs: &[&Vector]) -> Result<()> {
        let (context, _) = qf.context_snapshot();
        let in_views = inputs.iter().map(|v| v.view()).collect::<Result<Vec<VectorView>>>()?;
        let mut out_views = outputs
            .iter()
            .map(|v| v.view_mut())
            .collect::<Result<Vec<VectorViewMut>>>()?;
        let in_slices: Vec<&[Scalar]> = in_views.iter().map(|view| &**view).collect();
        let mut out_slices: Vec<&mut [Scalar]> = out_views.iter_mut().map(|view| &mut **view).collect();
        qf.call_kernel(&context, q, &in_slices, &mut out_slices)
    }
}

/// Computes a contraction step on host arrays, see [`TensorContract`].
#[allow(clippy::too_many_arguments)]
pub(crate) fn contract_host(
    a: usize,
    b: usize,
    c: usize,
    j: usize,
    transpose: bool,
    add: bool,
    t: &[Scalar],
    u: &[Scalar],
    v: &mut [Scalar],
) {
    let (t_stride_j, t_stride_b) = if transpose { (1, j) } else { (b, 1) };
    if !add {
        v[..a * j * c].fill(0.0);
    }
    for a_idx in 0..a {
        for b_idx in 0..b {
            let u_block = &u[(a_idx * b + b_idx) * c..][..c];
            for j_idx in 0..j {
                let t_jb = t[j_idx * t_stride_j + b_idx * t_stride_b];
                let v_block = &mut v[(a_idx * j + j_idx) * c..][..c];
                for (v_c, u_c) in v_block.iter_mut().zip(u_block) {
                    *v_c += t_jb * u_c;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefContract;

impl TensorContract for RefContract {
    fn contract(&self, step: &ContractionStep, t: &[Scalar], u: &[Scalar], v: &mut [Scalar]) {
        contract_host(step.a, step.b, step.c, step.j, step.transpose, step.add, t, u, v);
    }
}
