//! Sequences of one-dimensional contractions evaluating a basis.
//!
//! A tensor-product basis is applied one axis at a time. Each step contracts a single axis
//! of an array viewed as `[a][b][c]` with a 1-D table, producing `[a][j][c]`. Backends only
//! need to implement that single contraction; the plan describes the steps and which
//! buffer each reads from and writes to.
use crate::{Error, EvalMode, Result, TransposeMode};

/// Which table of the basis a step contracts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Interp,
    /// Derivative table. For general bases the index selects the direction, tensor bases
    /// use the same 1-D table for every direction.
    Grad(usize),
}

/// A buffer read or written by a step, with an offset in scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Input(usize),
    Output(usize),
    /// One of two scratch buffers, each of [`ContractionPlan::scratch_len`] scalars.
    Scratch(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractionStep {
    pub table: Table,
    pub a: usize,
    pub b: usize,
    pub c: usize,
    pub j: usize,
    pub transpose: bool,
    pub add: bool,
    pub src: Slot,
    pub dst: Slot,
}

impl ContractionStep {
    pub fn src_len(&self) -> usize {
        self.a * self.b * self.c
    }

    pub fn dst_len(&self) -> usize {
        self.a * self.j * self.c
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractionPlan {
    pub steps: Vec<ContractionStep>,
    pub scratch_len: usize,
}

/// Shape of the data a plan is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanShape {
    pub dim: usize,
    pub num_comp: usize,
    /// Nodes per direction for tensor bases, total nodes otherwise.
    pub p: usize,
    /// Quadrature points per direction for tensor bases, total points otherwise.
    pub q: usize,
    /// Number of elements stored outside the component index, `[comp][elem][..]`.
    pub outer: usize,
    /// Number of elements stored innermost, `[comp][..][elem]`.
    pub inner: usize,
}

impl ContractionPlan {
    /// Plan for a tensor-product basis.
    pub fn tensor(shape: PlanShape, tmode: TransposeMode, emode: EvalMode) -> Result<Self> {
        let PlanShape {
            dim,
            num_comp,
            p,
            q,
            outer,
            inner,
        } = shape;
        let transpose = tmode.is_transpose();
        // Sizes of the array being contracted and the one being produced
        let (from, to) = if transpose { (q, p) } else { (p, q) };
        let field_len = num_comp * outer * inner * q.pow(dim as u32);

        let directions: Vec<Option<usize>> = match emode {
            EvalMode::Interp => vec![None],
            EvalMode::Grad => (0..dim).map(Some).collect(),
            _ => return Err(Error::usage(format!("no contraction plan for evaluation mode {emode:?}"))),
        };

        let mut steps = Vec::new();
        let mut scratch_len = 0;
        for (chain, direction) in directions.iter().enumerate() {
            let quad_offset = chain * field_len;
            for axis in 0..dim {
                let table = match direction {
                    Some(d) if *d == axis => Table::Grad(axis),
                    _ => Table::Interp,
                };
                let src = if axis == 0 {
                    if transpose {
                        Slot::Input(quad_offset)
                    } else {
                        Slot::Input(0)
                    }
                } else {
                    Slot::Scratch((axis - 1) % 2)
                };
                let last = axis + 1 == dim;
                let dst = if last {
                    if transpose {
                        Slot::Output(0)
                    } else {
                        Slot::Output(quad_offset)
                    }
                } else {
                    Slot::Scratch(axis % 2)
                };
                let step = ContractionStep {
                    table,
                    a: num_comp * outer * from.pow((dim - 1 - axis) as u32),
                    b: from,
                    c: to.pow(axis as u32) * inner,
                    j: to,
                    transpose,
                    // Transposed application adds into the nodal output
                    add: last && transpose,
                    src,
                    dst,
                };
                if !last {
                    scratch_len = scratch_len.max(step.dst_len());
                }
                steps.push(step);
            }
        }

        Ok(Self { steps, scratch_len })
    }

    /// Plan for a general basis, a single dense contraction per direction.
    pub fn general(shape: PlanShape, tmode: TransposeMode, emode: EvalMode) -> Result<Self> {
        let PlanShape {
            dim,
            num_comp,
            p,
            q,
            outer,
            inner,
        } = shape;
        let transpose = tmode.is_transpose();
        let (from, to) = if transpose { (q, p) } else { (p, q) };
        let field_len = num_comp * outer * inner * q;
        let tables: Vec<Table> = match emode {
            EvalMode::Interp => vec![Table::Interp],
            EvalMode::Grad => (0..dim).map(Table::Grad).collect(),
            _ => return Err(Error::usage(format!("no contraction plan for evaluation mode {emode:?}"))),
        };

        let steps = tables
            .into_iter()
            .enumerate()
            .map(|(chain, table)| {
                let quad_offset = chain * field_len;
                let (src, dst) = if transpose {
                    (Slot::Input(quad_offset), Slot::Output(0))
                } else {
                    (Slot::Input(0), Slot::Output(quad_offset))
                };
                ContractionStep {
                    table,
                    a: num_comp * outer,
                    b: from,
                    c: inner,
                    j: to,
                    transpose,
                    add: transpose,
                    src,
                    dst,
                }
            })
            .collect();

        Ok(Self { steps, scratch_len: 0 })
    }
}
