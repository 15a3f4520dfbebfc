//! Multi-dimensional rules formed by tensor products of 1D rules.
//!
//! Points are ordered with the first coordinate varying fastest, which matches the
//! node and quadrature point ordering of tensor-product bases.

use crate::{Point, Rule};

/// Tensor product of a one-dimensional rule with itself, `D` times.
pub fn tensor_rule<const D: usize>(rule1d: &Rule<1>) -> Rule<D> {
    let (weights1d, points1d) = rule1d;
    let n = weights1d.len();
    let size = n.pow(D as u32);
    let mut weights = Vec::with_capacity(size);
    let mut points = Vec::with_capacity(size);

    for linear in 0..size {
        let mut w = 1.0;
        let mut point: Point<D> = [0.0; D];
        let mut remainder = linear;
        for coord in point.iter_mut() {
            let i = remainder % n;
            remainder /= n;
            w *= weights1d[i];
            *coord = points1d[i][0];
        }
        weights.push(w);
        points.push(point);
    }

    (weights, points)
}

/// Tensor-product weights only, in the same ordering as [`tensor_rule`].
pub fn tensor_weights(weights1d: &[f64], dim: usize) -> Vec<f64> {
    let n = weights1d.len();
    let size = n.pow(dim as u32);
    (0..size)
        .map(|linear| {
            let mut remainder = linear;
            (0..dim)
                .map(|_| {
                    let i = remainder % n;
                    remainder /= n;
                    weights1d[i]
                })
                .product()
        })
        .collect()
}
