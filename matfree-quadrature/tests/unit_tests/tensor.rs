use matfree_quadrature::tensor::{tensor_rule, tensor_weights};
use matfree_quadrature::univariate::gauss;
use matfree_quadrature::{integrate, Rule};
use matrixcompare::assert_scalar_eq;

fn monomial_integral_1d(alpha: i32) -> f64 {
    (1.0 - (-1.0f64).powi(alpha + 1)) / (alpha as f64 + 1.0)
}

#[test]
fn quadrilateral_gauss_rules_satisfy_expected_accuracy() {
    for n in 1..=8 {
        let expected_polynomial_degree = 2 * n - 1;
        let rule: Rule<2> = tensor_rule(&gauss(n));
        assert_eq!(rule.0.len(), n * n);
        assert!(rule.0.iter().all(|&w| w > 0.0));

        for alpha in 0..=expected_polynomial_degree as i32 {
            for beta in 0..=expected_polynomial_degree as i32 {
                let expected = monomial_integral_1d(alpha) * monomial_integral_1d(beta);
                let estimated = integrate(&rule, |&[x, y]| x.powi(alpha) * y.powi(beta));
                assert_scalar_eq!(estimated, expected, comp = abs, tol = 1e-13);
            }
        }
    }
}

#[test]
fn hexahedral_gauss_rules_satisfy_expected_accuracy() {
    for n in 1..=5 {
        let expected_polynomial_degree = 2 * n - 1;
        let rule: Rule<3> = tensor_rule(&gauss(n));
        assert_eq!(rule.0.len(), n * n * n);

        for alpha in 0..=expected_polynomial_degree as i32 {
            for beta in 0..=expected_polynomial_degree as i32 {
                for gamma in 0..=expected_polynomial_degree as i32 {
                    let expected =
                        monomial_integral_1d(alpha) * monomial_integral_1d(beta) * monomial_integral_1d(gamma);
                    let estimated = integrate(&rule, |&[x, y, z]| x.powi(alpha) * y.powi(beta) * z.powi(gamma));
                    assert_scalar_eq!(estimated, expected, comp = abs, tol = 1e-13);
                }
            }
        }
    }
}

#[test]
fn first_coordinate_varies_fastest() {
    let rule: Rule<2> = tensor_rule(&gauss(2));
    let points = &rule.1;
    assert_eq!(points[0][1], points[1][1]);
    assert!(points[0][0] < points[1][0]);
    assert_eq!(points[0][0], points[2][0]);
    assert!(points[0][1] < points[2][1]);
}

#[test]
fn tensor_weights_agree_with_tensor_rule() {
    let rule1d = gauss(3);
    let rule: Rule<3> = tensor_rule(&rule1d);
    let weights = tensor_weights(&rule1d.0, 3);
    assert_eq!(weights.len(), rule.0.len());
    for (a, b) in weights.iter().zip(&rule.0) {
        assert_scalar_eq!(*a, *b, comp = abs, tol = 1e-15);
    }
}
