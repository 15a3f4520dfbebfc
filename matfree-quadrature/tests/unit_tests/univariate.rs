use matfree_quadrature::univariate::{gauss, try_gauss, try_gauss_lobatto};
use matfree_quadrature::{integrate, rule_1d, Error, QuadratureKind};

use matrixcompare::assert_scalar_eq;

fn monomial_integral(alpha: i32) -> f64 {
    (1.0 - (-1.0f64).powi(alpha + 1)) / (alpha as f64 + 1.0)
}

#[test]
fn gauss_rules_satisfy_expected_accuracy() {
    for n in 1..=24 {
        let expected_polynomial_degree = 2 * n - 1;
        let rule = gauss(n);

        assert!(rule.0.iter().all(|&w| w > 0.0));
        assert!(rule.1.windows(2).all(|pair| pair[0][0] < pair[1][0]));

        for alpha in 0..=expected_polynomial_degree as i32 {
            let estimated_integral = integrate(&rule, |x| x[0].powi(alpha));
            assert_scalar_eq!(estimated_integral, monomial_integral(alpha), comp = abs, tol = 1e-13);
        }
    }
}

#[test]
fn gauss_lobatto_rules_satisfy_expected_accuracy() {
    assert!(try_gauss_lobatto(0).is_err());
    assert!(try_gauss_lobatto(1).is_err());

    for n in 2..=24 {
        let expected_polynomial_degree = 2 * n - 3;
        let rule = try_gauss_lobatto(n).unwrap();

        // Check that rule contains endpoints, like Gauss-Lobatto should
        assert_eq!(rule.1.first().unwrap(), &[-1.0]);
        assert_eq!(rule.1.last().unwrap(), &[1.0]);
        assert!(rule.0.iter().all(|&w| w > 0.0));
        assert!(rule.1.windows(2).all(|pair| pair[0][0] < pair[1][0]));

        for alpha in 0..=expected_polynomial_degree as i32 {
            let estimated_integral = integrate(&rule, |x| x[0].powi(alpha));
            assert_scalar_eq!(estimated_integral, monomial_integral(alpha), comp = abs, tol = 1e-13);
        }
    }
}

#[test]
fn gauss_lobatto_three_points_are_known() {
    let (weights, points) = try_gauss_lobatto(3).unwrap();
    assert_eq!(points, vec![[-1.0], [0.0], [1.0]]);
    assert_scalar_eq!(weights[0], 1.0 / 3.0, comp = abs, tol = 1e-15);
    assert_scalar_eq!(weights[1], 4.0 / 3.0, comp = abs, tol = 1e-15);
    assert_scalar_eq!(weights[2], 1.0 / 3.0, comp = abs, tol = 1e-15);
}

#[test]
fn rule_selection_reports_invalid_point_counts() {
    assert_eq!(
        try_gauss(0),
        Err(Error::InvalidPointCount {
            rule: "Gauss",
            requested: 0,
            minimum: 1
        })
    );
    assert!(rule_1d(QuadratureKind::GaussLobatto, 1).is_err());
    assert_eq!(rule_1d(QuadratureKind::Gauss, 4).unwrap(), gauss(4));
}
