//! Quadrature rules for the one-dimensional domain `[-1, 1]`.

use crate::{Error, Rule};
use std::f64::consts::PI;

const NEWTON_TOLERANCE: f64 = 1e-15;
const MAX_NEWTON_ITERATIONS: usize = 100;

/// Legendre polynomial `p_n` and its predecessor `p_{n-1}` evaluated at a point.
///
/// The derivative formula is singular at |x| == 1, so it is only
/// suitable for evaluation in the open interval (-1, 1).
#[derive(Debug, Default)]
struct LegendreRecurrence {
    n: usize,
    x: f64,
    p1: f64,
    p2: f64,
}

impl LegendreRecurrence {
    pub fn evaluate(n: usize, x: f64) -> Self {
        //  m P_m(x) = (2m - 1) * x P_{m - 1}(x) - (m - 1) P_{m - 2}(x)
        let mut p1 = 1.0;
        let mut p2 = 0.0;
        let mut p3;
        for m in 1..=n {
            let m = m as f64;
            p3 = p2;
            p2 = p1;
            p1 = ((2.0 * m - 1.0) * x * p2 - (m - 1.0) * p3) / m;
        }

        Self { n, x, p1, p2 }
    }

    fn value(&self) -> f64 {
        self.p1
    }

    /// `dp_n/dx (x) = n * (x * p_n(x) - p_{n - 1}(x)) / (x^2 - 1)`
    fn derivative(&self) -> f64 {
        let Self { n, x, p1, p2 } = &self;
        let n = *n as f64;
        n * (x * p1 - p2) / (x * x - 1.0)
    }

    /// Second derivative, from the Legendre differential equation
    /// `(1 - x^2) p'' - 2 x p' + n (n + 1) p = 0`.
    fn second_derivative(&self) -> f64 {
        let n = self.n as f64;
        let x = self.x;
        (2.0 * x * self.derivative() - n * (n + 1.0) * self.value()) / (1.0 - x * x)
    }
}

/// Gauss quadrature for the reference interval `[-1, 1]`.
///
/// Given `n` points, the rule integrates polynomials of order up to `2 n - 1` exactly.
/// Points are returned in ascending order.
///
/// # Panics
///
/// Panics if zero points are requested.
pub fn gauss(num_points: usize) -> Rule<1> {
    try_gauss(num_points).expect("number of points must be positive")
}

/// Fallible variant of [`gauss`].
pub fn try_gauss(num_points: usize) -> Result<Rule<1>, Error> {
    let n = num_points;
    if n == 0 {
        return Err(Error::InvalidPointCount {
            rule: "Gauss",
            requested: n,
            minimum: 1,
        });
    }

    let mut points = vec![[0.0]; n];
    let mut weights = vec![0.0; n];

    // Roots are symmetric, so only the negative half is computed with Newton's method
    for i in 0..(n + 1) / 2 {
        let mut x = -(PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let mut recurrence = LegendreRecurrence::evaluate(n, x);
        for _ in 0..MAX_NEWTON_ITERATIONS {
            let dx = -recurrence.value() / recurrence.derivative();
            x += dx;
            recurrence = LegendreRecurrence::evaluate(n, x);
            if dx.abs() <= NEWTON_TOLERANCE {
                break;
            }
        }

        let dp = recurrence.derivative();
        let w = 2.0 / ((1.0 - x * x) * dp * dp);

        points[i] = [x];
        weights[i] = w;
        points[n - 1 - i] = [-x];
        weights[n - 1 - i] = w;
    }

    Ok((weights, points))
}

/// Gauss-Lobatto quadrature for the reference interval `[-1, 1]`.
///
/// The rule contains both end points and integrates polynomials of order up to `2 n - 3`
/// exactly. Its points are also the standard node locations of high-order spectral
/// elements. Points are returned in ascending order.
///
/// Returns an error if fewer than two points are requested.
pub fn try_gauss_lobatto(num_points: usize) -> Result<Rule<1>, Error> {
    let n = num_points;
    if n < 2 {
        return Err(Error::InvalidPointCount {
            rule: "Gauss-Lobatto",
            requested: n,
            minimum: 2,
        });
    }

    // Interior points are the roots of p'_{n-1}
    let m = n - 1;
    let endpoint_weight = 2.0 / (n as f64 * m as f64);
    let mut points = vec![[0.0]; n];
    let mut weights = vec![0.0; n];
    points[0] = [-1.0];
    points[n - 1] = [1.0];
    weights[0] = endpoint_weight;
    weights[n - 1] = endpoint_weight;

    for i in 1..(n + 1) / 2 {
        // Chebyshev-Gauss-Lobatto points are a good initial guess
        let mut x = -(PI * i as f64 / m as f64).cos();
        let mut recurrence = LegendreRecurrence::evaluate(m, x);
        for _ in 0..MAX_NEWTON_ITERATIONS {
            let dx = -recurrence.derivative() / recurrence.second_derivative();
            x += dx;
            recurrence = LegendreRecurrence::evaluate(m, x);
            if dx.abs() <= NEWTON_TOLERANCE {
                break;
            }
        }

        let p = recurrence.value();
        let w = endpoint_weight / (p * p);
        points[i] = [x];
        weights[i] = w;
        points[n - 1 - i] = [-x];
        weights[n - 1 - i] = w;
    }

    if n % 2 == 1 {
        let p = LegendreRecurrence::evaluate(m, 0.0).value();
        points[n / 2] = [0.0];
        weights[n / 2] = endpoint_weight / (p * p);
    }

    Ok((weights, points))
}
