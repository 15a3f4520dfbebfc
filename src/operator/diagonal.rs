//! Assembly of the operator diagonal.
//!
//! The QFunction is linear in its active input, so probing it with unit values in each input
//! component yields the pointwise coupling between input and output components. The diagonal
//! of each element matrix then follows from the dense basis matrices, and the element
//! diagonals are summed into the L-vector by the transposed restriction.
use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::basis::Basis;
use crate::error::ensure_usage;
use crate::operator::{Operator, OperatorField, VectorOpt};
use crate::vector::Vector;
use crate::{Backend, Error, EvalMode, Result, Scalar, TransposeMode};

/// Quadrature data of an input field. Active fields are left for the caller to fill.
fn quadrature_input(field: &OperatorField, backend: &Backend, num_elem: usize, n: usize) -> Result<Vector<'static>> {
    let q = backend.vector(field.size() * n)?;
    let missing_basis = || Error::usage(format!("field `{}` has no basis", field.name()));
    let missing_restriction = || Error::usage(format!("field `{}` has no restriction", field.name()));
    match (field.eval_mode(), field.vector()) {
        (_, VectorOpt::Active) => {}
        (EvalMode::Weight, _) => {
            let basis = field.basis().ok_or_else(missing_basis)?;
            basis.apply(num_elem, TransposeMode::NoTranspose, EvalMode::Weight, None, &q)?;
        }
        (emode, VectorOpt::Some(vector)) => {
            let restriction = field.restriction().ok_or_else(missing_restriction)?;
            match field.basis() {
                Some(basis) => {
                    let e = restriction.create_evector()?;
                    restriction.apply(TransposeMode::NoTranspose, field.lmode(), vector, &e)?;
                    basis.apply(num_elem, TransposeMode::NoTranspose, emode, Some(&e), &q)?;
                }
                None => restriction.apply(TransposeMode::NoTranspose, field.lmode(), vector, &q)?,
            }
        }
        (_, VectorOpt::None) => {
            return Err(Error::usage(format!("field `{}` is not bound to a vector", field.name())))
        }
    }
    Ok(q)
}

/// Dense `Q x P` matrices of the field, one per derivative direction.
fn eval_matrices(basis: Option<&Basis>, emode: EvalMode, num_qpts: usize) -> Vec<DMatrix<Scalar>> {
    match basis {
        None => vec![DMatrix::identity(num_qpts, num_qpts)],
        Some(basis) => {
            let p = basis.num_nodes();
            match emode {
                EvalMode::Grad => basis
                    .full_grad()
                    .chunks_exact(num_qpts * p)
                    .map(|grad| DMatrix::from_row_slice(num_qpts, p, grad))
                    .collect(),
                _ => vec![DMatrix::from_row_slice(num_qpts, p, &basis.full_interp())],
            }
        }
    }
}

pub(crate) fn assemble_add_diagonal(op: &Operator, diag: &Vector) -> Result<()> {
    let active_in: Vec<_> = op
        .input_fields()
        .enumerate()
        .filter(|(_, f)| f.vector().is_active())
        .collect();
    let active_out: Vec<_> = op
        .output_fields()
        .enumerate()
        .filter(|(_, f)| f.vector().is_active())
        .collect();
    let ((in_idx, field_in), (out_idx, field_out)) = match (active_in.as_slice(), active_out.as_slice()) {
        ([input], [output]) => (*input, *output),
        _ => {
            return Err(Error::usage(
                "diagonal assembly needs exactly one active input field and one active output field",
            ))
        }
    };

    let restriction = field_in
        .restriction()
        .ok_or_else(|| Error::usage("active input field has no restriction"))?;
    let same_restriction = field_out
        .restriction()
        .map_or(false, |r| std::ptr::eq(r, restriction));
    ensure_usage!(
        same_restriction && field_in.lmode() == field_out.lmode(),
        "diagonal assembly needs the active fields to share their restriction"
    );
    let same_basis = match (field_in.basis(), field_out.basis()) {
        (Some(a), Some(b)) => std::ptr::eq(a, b),
        (None, None) => true,
        _ => false,
    };
    ensure_usage!(same_basis, "diagonal assembly needs the active fields to share their basis");
    ensure_usage!(
        diag.length() == restriction.l_size(),
        "diagonal has length {}, but the operator has L-size {}",
        diag.length(),
        restriction.l_size()
    );

    let (num_elem, num_qpts) = (op.num_elements(), op.num_quadrature_points());
    let n = num_elem * num_qpts;
    let backend = op.backend();
    let qf = op.qfunction();

    let q_inputs = op
        .input_fields()
        .map(|field| quadrature_input(field, backend, num_elem, n))
        .collect::<Result<Vec<_>>>()?;
    let q_outputs = op
        .output_fields()
        .map(|field| backend.vector(field.size() * n))
        .collect::<Result<Vec<_>>>()?;

    // Pointwise coupling, laid out [out comp][in comp][point]
    let (s_in, s_out) = (field_in.size(), field_out.size());
    let mut pointwise = vec![0.0; s_out * s_in * n];
    for k in 0..s_in {
        {
            let mut unit = q_inputs[in_idx].view_mut()?;
            unit.fill(0.0);
            unit[k * n..(k + 1) * n].fill(1.0);
        }
        let ins: Vec<&Vector> = q_inputs.iter().collect();
        let outs: Vec<&Vector> = q_outputs.iter().collect();
        qf.apply(n, &ins, &outs)?;
        let response = q_outputs[out_idx].view()?;
        for kk in 0..s_out {
            for point in 0..n {
                pointwise[(kk * s_in + k) * n + point] = response[kk * n + point];
            }
        }
    }

    let matrices_in = eval_matrices(field_in.basis(), field_in.eval_mode(), num_qpts);
    let matrices_out = eval_matrices(field_out.basis(), field_out.eval_mode(), num_qpts);
    let num_comp = restriction.num_components();
    let elem_size = restriction.elem_size();

    let e_diag = restriction.create_evector()?;
    {
        let mut e_view = e_diag.view_mut()?;
        e_view
            .par_chunks_mut(elem_size)
            .enumerate()
            .for_each(|(ce, elem_diag)| {
                let (comp, elem) = (ce / num_elem, ce % num_elem);
                for (node, value) in elem_diag.iter_mut().enumerate() {
                    let mut sum = 0.0;
                    for (d_out, b_out) in matrices_out.iter().enumerate() {
                        for (d_in, b_in) in matrices_in.iter().enumerate() {
                            let (kk, k) = (d_out * num_comp + comp, d_in * num_comp + comp);
                            let start = (kk * s_in + k) * n + elem * num_qpts;
                            let coupling = &pointwise[start..start + num_qpts];
                            for (qp, d) in coupling.iter().enumerate() {
                                sum += b_out[(qp, node)] * d * b_in[(qp, node)];
                            }
                        }
                    }
                    *value = sum;
                }
            });
    }
    restriction.apply(TransposeMode::Transpose, field_in.lmode(), &e_diag, diag)
}
