//! Quadrature rules and interpolation tables for tensor-product finite elements.
//!
//! Everything in this crate lives on the reference interval `[-1, 1]`. Multi-dimensional
//! rules are formed as tensor products of the one-dimensional rules, with the `x` coordinate
//! varying fastest. The crate is used by `matfree` to build the 1-D tables of its
//! tensor-product bases, but has no dependency on it.

use std::fmt;
use std::fmt::{Display, Formatter};

pub mod lagrange;
pub mod tensor;
pub mod univariate;

/// Library-wide error type.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The requested rule does not exist for the given number of points.
    InvalidPointCount {
        /// Name of the requested rule.
        rule: &'static str,
        /// Number of points that was requested.
        requested: usize,
        /// Smallest number of points the rule supports.
        minimum: usize,
    },
    /// Two interpolation nodes coincide, so the Lagrange polynomials are undefined.
    DuplicateNodes { first: usize, second: usize },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPointCount {
                rule,
                requested,
                minimum,
            } => {
                write!(
                    f,
                    "{rule} rule requires at least {minimum} points, but {requested} were requested"
                )
            }
            Self::DuplicateNodes { first, second } => {
                write!(f, "interpolation nodes {first} and {second} coincide")
            }
        }
    }
}

impl std::error::Error for Error {}

/// A D-dimensional point.
pub type Point<const D: usize> = [f64; D];

/// A D-dimensional rule, stored as `(weights, points)`.
pub type Rule<const D: usize> = (Vec<f64>, Vec<Point<D>>);

/// Integrates the given function with the provided rule.
pub fn integrate<const D: usize>(rule: &Rule<D>, f: impl Fn(&Point<D>) -> f64) -> f64 {
    let (weights, points) = rule;
    weights.iter().zip(points).map(|(w, x)| w * f(x)).sum()
}

/// Family of one-dimensional quadrature rules.
///
/// The same enum doubles as the choice of node locations for Lagrange bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuadratureKind {
    Gauss,
    GaussLobatto,
}

/// Returns the one-dimensional rule of the given kind with `num_points` points,
/// with points in ascending order.
pub fn rule_1d(kind: QuadratureKind, num_points: usize) -> Result<Rule<1>, Error> {
    match kind {
        QuadratureKind::Gauss => univariate::try_gauss(num_points),
        QuadratureKind::GaussLobatto => univariate::try_gauss_lobatto(num_points),
    }
}
