//! Operator composition over all elements at once.
//!
//! The pipeline is built from the public object interfaces only, so it works unchanged with
//! any restriction, basis and QFunction implementation, including device ones.
use itertools::izip;

use crate::backend::OperatorApply;
use crate::operator::{Operator, OperatorField};
use crate::vector::Vector;
use crate::workspace::Workspace;
use crate::{Error, EvalMode, Result, TransposeMode};

#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOperator;

/// Work vectors of a finalized operator.
#[derive(Debug)]
struct SerialBuffers {
    /// E-vectors of fields evaluated through a basis.
    e_inputs: Vec<Option<Vector<'static>>>,
    /// Quadrature data of every field, laid out `[comp][elem][q]`.
    q_inputs: Vec<Vector<'static>>,
    e_outputs: Vec<Option<Vector<'static>>>,
    q_outputs: Vec<Vector<'static>>,
}

fn evector_for(field: &OperatorField) -> Result<Option<Vector<'static>>> {
    match (field.restriction(), field.basis(), field.eval_mode()) {
        (Some(restriction), Some(_), EvalMode::Interp | EvalMode::Grad) => restriction.create_evector().map(Some),
        _ => Ok(None),
    }
}

fn not_prepared() -> Error {
    Error::usage("operator work buffers are missing, the operator was not finalized")
}

impl OperatorApply for SerialOperator {
    fn prepare(&self, op: &Operator, workspace: &mut Workspace) -> Result<()> {
        let (num_elem, backend) = (op.num_elements(), op.backend());
        let n = num_elem * op.num_quadrature_points();

        let mut e_inputs = Vec::new();
        let mut q_inputs = Vec::new();
        for field in op.input_fields() {
            e_inputs.push(evector_for(field)?);
            let q = backend.vector(field.size() * n)?;
            if field.eval_mode() == EvalMode::Weight {
                // Weights never change, so they are computed once
                let basis = field
                    .basis()
                    .ok_or_else(|| Error::usage(format!("weight field `{}` has no basis", field.name())))?;
                basis.apply(num_elem, TransposeMode::NoTranspose, EvalMode::Weight, None, &q)?;
            }
            q_inputs.push(q);
        }
        let e_outputs = op.output_fields().map(evector_for).collect::<Result<Vec<_>>>()?;
        let q_outputs = op
            .output_fields()
            .map(|field| backend.vector(field.size() * n))
            .collect::<Result<Vec<_>>>()?;

        workspace.remove::<SerialBuffers>();
        workspace.get_or_insert_with(|| SerialBuffers {
            e_inputs,
            q_inputs,
            e_outputs,
            q_outputs,
        });
        Ok(())
    }

    fn apply_add(&self, op: &Operator, workspace: &mut Workspace, input: &Vector, output: &Vector) -> Result<()> {
        let buffers = workspace.get_mut::<SerialBuffers>().ok_or_else(not_prepared)?;
        let num_elem = op.num_elements();
        let n = num_elem * op.num_quadrature_points();

        for (field, e, q) in izip!(op.input_fields(), &buffers.e_inputs, &buffers.q_inputs) {
            let Some(vector) = field.resolve_vector(input) else {
                continue;
            };
            let restriction = field
                .restriction()
                .ok_or_else(|| Error::usage(format!("field `{}` has no restriction", field.name())))?;
            match (e, field.basis()) {
                (Some(e), Some(basis)) => {
                    restriction.apply(TransposeMode::NoTranspose, field.lmode(), vector, e)?;
                    basis.apply(num_elem, TransposeMode::NoTranspose, field.eval_mode(), Some(e), q)?;
                }
                _ => restriction.apply(TransposeMode::NoTranspose, field.lmode(), vector, q)?,
            }
        }

        let inputs: Vec<&Vector> = buffers.q_inputs.iter().collect();
        let outputs: Vec<&Vector> = buffers.q_outputs.iter().collect();
        op.qfunction().apply(n, &inputs, &outputs)?;

        for (field, e, q) in izip!(op.output_fields(), &buffers.e_outputs, &buffers.q_outputs) {
            let vector = field
                .resolve_vector(output)
                .ok_or_else(|| Error::usage(format!("output field `{}` is not bound to a vector", field.name())))?;
            let restriction = field
                .restriction()
                .ok_or_else(|| Error::usage(format!("field `{}` has no restriction", field.name())))?;
            match (e, field.basis()) {
                (Some(e), Some(basis)) => {
                    e.set_value(0.0)?;
                    basis.apply(num_elem, TransposeMode::Transpose, field.eval_mode(), Some(q), e)?;
                    restriction.apply(TransposeMode::Transpose, field.lmode(), e, vector)?;
                }
                _ => restriction.apply(TransposeMode::Transpose, field.lmode(), q, vector)?,
            }
        }
        Ok(())
    }
}
