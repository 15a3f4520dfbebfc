//! Lagrange interpolation tables on the reference interval.
//!
//! Tables are stored row-major with one row per evaluation point, i.e. the entry for
//! evaluation point `i` and node `j` is found at index `i * num_nodes + j`.

use crate::{rule_1d, Error, QuadratureKind};

/// One-dimensional tables of an H1 Lagrange basis.
#[derive(Debug, Clone, PartialEq)]
pub struct LagrangeTables {
    /// Node locations of the basis.
    pub nodes: Vec<f64>,
    /// Quadrature points at which the basis is evaluated.
    pub q_ref: Vec<f64>,
    /// Quadrature weights belonging to `q_ref`.
    pub q_weights: Vec<f64>,
    /// Basis function values, `q_ref.len() x nodes.len()`, row-major.
    pub interp: Vec<f64>,
    /// Basis function derivatives, `q_ref.len() x nodes.len()`, row-major.
    pub grad: Vec<f64>,
}

impl LagrangeTables {
    /// Tables for a basis with `num_nodes` Gauss-Lobatto nodes evaluated at the
    /// `num_qpts` points of the requested quadrature rule.
    pub fn new(num_nodes: usize, num_qpts: usize, quadrature: QuadratureKind) -> Result<Self, Error> {
        let (_, nodes) = rule_1d(QuadratureKind::GaussLobatto, num_nodes)?;
        let (q_weights, q_ref) = rule_1d(quadrature, num_qpts)?;
        let nodes: Vec<f64> = nodes.into_iter().map(|[x]| x).collect();
        let q_ref: Vec<f64> = q_ref.into_iter().map(|[x]| x).collect();
        let (interp, grad) = lagrange_tables(&nodes, &q_ref)?;
        Ok(Self {
            nodes,
            q_ref,
            q_weights,
            interp,
            grad,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_qpts(&self) -> usize {
        self.q_ref.len()
    }
}

/// Computes the values and derivatives of the Lagrange polynomials through `nodes`
/// at each of `points`.
///
/// Returns `(interp, grad)`, both of size `points.len() * nodes.len()` and row-major.
pub fn lagrange_tables(nodes: &[f64], points: &[f64]) -> Result<(Vec<f64>, Vec<f64>), Error> {
    let p = nodes.len();
    for j in 0..p {
        for k in (j + 1)..p {
            if nodes[j] == nodes[k] {
                return Err(Error::DuplicateNodes { first: j, second: k });
            }
        }
    }

    let mut interp = vec![0.0; points.len() * p];
    let mut grad = vec![0.0; points.len() * p];
    for (i, &x) in points.iter().enumerate() {
        for j in 0..p {
            let denominator: f64 = (0..p)
                .filter(|&k| k != j)
                .map(|k| nodes[j] - nodes[k])
                .product();

            let value: f64 = (0..p).filter(|&k| k != j).map(|k| x - nodes[k]).product();

            // Product rule, skipping one factor at a time. This form stays well-defined
            // when x coincides with a node.
            let derivative: f64 = (0..p)
                .filter(|&m| m != j)
                .map(|m| {
                    (0..p)
                        .filter(|&k| k != j && k != m)
                        .map(|k| x - nodes[k])
                        .product::<f64>()
                })
                .sum();

            interp[i * p + j] = value / denominator;
            grad[i * p + j] = derivative / denominator;
        }
    }

    Ok((interp, grad))
}
