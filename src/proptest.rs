//! Strategies for generating restriction layouts and field data.
use ::proptest::collection::vec;
use ::proptest::prelude::*;

use crate::{Scalar, TransposeMode};

/// Parameters of an element restriction with an explicit offset table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRestrictionParams {
    pub num_elem: usize,
    pub elem_size: usize,
    pub num_comp: usize,
    /// Number of nodes of the L-vector. Its length is `num_nodes * num_comp`.
    pub num_nodes: usize,
    pub offsets: Vec<usize>,
    pub lmode: TransposeMode,
}

impl OffsetRestrictionParams {
    pub fn l_size(&self) -> usize {
        self.num_nodes * self.num_comp
    }

    pub fn e_size(&self) -> usize {
        self.num_elem * self.elem_size * self.num_comp
    }
}

pub fn transpose_mode() -> impl Strategy<Value = TransposeMode> {
    prop_oneof![Just(TransposeMode::NoTranspose), Just(TransposeMode::Transpose)]
}

/// Restrictions with arbitrary offsets. Nodes may be shared by any number of elements, and
/// some nodes may belong to no element at all.
pub fn offset_restriction() -> impl Strategy<Value = OffsetRestrictionParams> {
    (1..6usize, 1..5usize, 1..4usize, 1..12usize, transpose_mode()).prop_flat_map(
        |(num_elem, elem_size, num_comp, num_nodes, lmode)| {
            vec(0..num_nodes, num_elem * elem_size).prop_map(move |offsets| OffsetRestrictionParams {
                num_elem,
                elem_size,
                num_comp,
                num_nodes,
                offsets,
                lmode,
            })
        },
    )
}

/// Field values of moderate magnitude.
pub fn field_values(len: usize) -> impl Strategy<Value = Vec<Scalar>> {
    vec(-10.0..10.0, len)
}

/// Restriction parameters together with an L-vector and an E-vector of matching sizes.
pub fn offset_restriction_with_data() -> impl Strategy<Value = (OffsetRestrictionParams, Vec<Scalar>, Vec<Scalar>)> {
    offset_restriction().prop_flat_map(|params| {
        let (l_size, e_size) = (params.l_size(), params.e_size());
        (Just(params), field_values(l_size), field_values(e_size))
    })
}
