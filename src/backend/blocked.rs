//! Operator composition over blocks of elements.
//!
//! Elements are processed in blocks of `block_size` with the element index innermost, so
//! that every contraction runs over contiguous runs of `block_size` values. Work buffers
//! only ever hold one block, which keeps them in cache for large meshes. The last block is
//! padded with zero elements that are never scattered back.
use itertools::izip;

use crate::backend::OperatorApply;
use crate::basis::plan::ContractionPlan;
use crate::error::ensure_config;
use crate::operator::{Operator, OperatorField};
use crate::vector::{Vector, VectorView, VectorViewMut};
use crate::workspace::Workspace;
use crate::{Error, EvalMode, Result, Scalar, TransposeMode};

/// Elements per block if the resource does not set `block_size`.
pub const DEFAULT_BLOCK_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockedOperator;

/// Per-field state for one block.
#[derive(Debug)]
struct BlockField {
    /// Contraction plan of fields evaluated through a basis.
    plan: Option<ContractionPlan>,
    /// Nodal values of the block, laid out `[comp][node][elem]`.
    e: Vec<Scalar>,
    /// Quadrature values of the block, laid out `[comp][q][elem]`.
    q: Vec<Scalar>,
}

#[derive(Debug)]
struct BlockBuffers {
    block_size: usize,
    inputs: Vec<BlockField>,
    outputs: Vec<BlockField>,
    scratch: [Vec<Scalar>; 2],
}

fn block_field(field: &OperatorField, block_size: usize, num_qpts: usize, tmode: TransposeMode) -> Result<BlockField> {
    let q = vec![0.0; field.size() * num_qpts * block_size];
    match (field.basis(), field.eval_mode()) {
        (Some(basis), EvalMode::Weight) => {
            let mut q = q;
            basis.fill_weights(1, block_size, &mut q);
            Ok(BlockField {
                plan: None,
                e: Vec::new(),
                q,
            })
        }
        (Some(basis), emode) => Ok(BlockField {
            plan: Some(basis.plan(1, block_size, tmode, emode)?),
            e: vec![0.0; basis.num_components() * basis.num_nodes() * block_size],
            q,
        }),
        (None, _) => Ok(BlockField {
            plan: None,
            e: Vec::new(),
            q,
        }),
    }
}

fn missing_restriction(field: &OperatorField) -> Error {
    Error::usage(format!("field `{}` has no restriction", field.name()))
}

impl OperatorApply for BlockedOperator {
    fn prepare(&self, op: &Operator, workspace: &mut Workspace) -> Result<()> {
        let block_size = op.backend().options().block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        let num_qpts = op.num_quadrature_points();
        let vlength = op.qfunction().vlength();
        ensure_config!(block_size > 0, "block size must be positive");
        ensure_config!(
            (block_size * num_qpts) % vlength == 0,
            "block of {} elements with {} quadrature points each is not a multiple of the vector length {}",
            block_size,
            num_qpts,
            vlength
        );

        let inputs = op
            .input_fields()
            .map(|field| block_field(field, block_size, num_qpts, TransposeMode::NoTranspose))
            .collect::<Result<Vec<_>>>()?;
        let outputs = op
            .output_fields()
            .map(|field| block_field(field, block_size, num_qpts, TransposeMode::Transpose))
            .collect::<Result<Vec<_>>>()?;

        workspace.remove::<BlockBuffers>();
        workspace.get_or_insert_with(|| BlockBuffers {
            block_size,
            inputs,
            outputs,
            scratch: [Vec::new(), Vec::new()],
        });
        log::debug!(
            "Prepared blocked operator for QFunction `{}` with {} elements per block",
            op.qfunction().entry_point(),
            block_size
        );
        Ok(())
    }

    fn apply_add(&self, op: &Operator, workspace: &mut Workspace, input: &Vector, output: &Vector) -> Result<()> {
        let buffers = workspace
            .get_mut::<BlockBuffers>()
            .ok_or_else(|| Error::usage("operator work buffers are missing, the operator was not finalized"))?;
        let BlockBuffers {
            block_size,
            inputs,
            outputs,
            scratch,
        } = buffers;
        let block_size = *block_size;
        let num_qpts = op.num_quadrature_points();
        let num_blocks = (op.num_elements() + block_size - 1) / block_size;
        let qf = op.qfunction();
        let (context, _) = qf.context_snapshot();
        let contract = op.backend().methods().tensor_contract.clone();

        let in_views = op
            .input_fields()
            .map(|field| field.resolve_vector(input).map(|v| v.view()).transpose())
            .collect::<Result<Vec<Option<VectorView>>>>()?;

        // Several output fields may write to the same vector, which is viewed only once
        let mut out_vectors: Vec<&Vector> = Vec::new();
        let mut out_targets = Vec::new();
        for field in op.output_fields() {
            let vector = field
                .resolve_vector(output)
                .ok_or_else(|| Error::usage(format!("output field `{}` is not bound to a vector", field.name())))?;
            let idx = match out_vectors.iter().position(|v| std::ptr::eq(*v, vector)) {
                Some(idx) => idx,
                None => {
                    out_vectors.push(vector);
                    out_vectors.len() - 1
                }
            };
            out_targets.push(idx);
        }
        let mut out_views = out_vectors
            .iter()
            .map(|v| v.view_mut())
            .collect::<Result<Vec<VectorViewMut>>>()?;

        for block in 0..num_blocks {
            for (field, buffer, view) in izip!(op.input_fields(), inputs.iter_mut(), &in_views) {
                let Some(view) = view else {
                    continue;
                };
                let restriction = field.restriction().ok_or_else(|| missing_restriction(field))?;
                match (&buffer.plan, field.basis()) {
                    (Some(plan), Some(basis)) => {
                        restriction.gather_block(block, block_size, field.lmode(), view, &mut buffer.e);
                        basis.run_plan(plan, contract.as_ref(), &buffer.e, &mut buffer.q, scratch)?;
                    }
                    _ => restriction.gather_block(block, block_size, field.lmode(), view, &mut buffer.q),
                }
            }

            let in_slices: Vec<&[Scalar]> = inputs.iter().map(|buffer| buffer.q.as_slice()).collect();
            let mut out_slices: Vec<&mut [Scalar]> = outputs.iter_mut().map(|buffer| buffer.q.as_mut_slice()).collect();
            qf.call_kernel(&context, block_size * num_qpts, &in_slices, &mut out_slices)?;

            for (field, buffer, &target) in izip!(op.output_fields(), outputs.iter_mut(), &out_targets) {
                let restriction = field.restriction().ok_or_else(|| missing_restriction(field))?;
                let view = &mut out_views[target];
                match (&buffer.plan, field.basis()) {
                    (Some(plan), Some(basis)) => {
                        buffer.e.fill(0.0);
                        basis.run_plan(plan, contract.as_ref(), &buffer.q, &mut buffer.e, scratch)?;
                        restriction.scatter_add_block(block, block_size, field.lmode(), &buffer.e, view);
                    }
                    _ => restriction.scatter_add_block(block, block_size, field.lmode(), &buffer.q, view),
                }
            }
        }
        Ok(())
    }
}
