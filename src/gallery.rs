//! Reference QFunctions for mass and Laplace operators.
//!
//! Geometric factors are computed from the reference gradient of the coordinate field, a
//! field with `dim` components evaluated with [`EvalMode::Grad`]. Entry `(c, d)` of the
//! Jacobian, the derivative of coordinate `c` in reference direction `d`, is component
//! `d * dim + c` of that field.
//!
//! Symmetric `dim x dim` quadrature data is stored compactly: one entry in 1D, `(00, 11,
//! 01)` in 2D and `(00, 11, 22, 12, 02, 01)` in 3D.
use nalgebra::{Matrix2, Matrix3, SMatrix};

use crate::qfunction::{kernel_fn, QFunction, QFunctionKernel};
use crate::{Backend, Error, EvalMode, Result, Scalar};

const IDENTITY_SOURCE: &str = r#"
// Copies the input field to the output field.
CEED_QFUNCTION(Identity)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedInt size = *(const CeedInt *)ctx;
  const CeedScalar *u = in[0];
  CeedScalar *v = out[0];
  for (CeedInt i = 0; i < Q * size; i++) {
    v[i] = u[i];
  }
  return 0;
}

// Scales the input field by the factor stored in the context.
CEED_QFUNCTION(Scale)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedScalar scale = *(const CeedScalar *)ctx;
  const CeedScalar *u = in[0];
  CeedScalar *v = out[0];
  for (CeedInt i = 0; i < Q; i++) {
    v[i] = scale * u[i];
  }
  return 0;
}
"#;

const MASS_SOURCE: &str = r#"
CEED_QFUNCTION(Mass1DBuild)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedScalar *J = in[0], *w = in[1];
  CeedScalar *qdata = out[0];
  for (CeedInt i = 0; i < Q; i++) {
    qdata[i] = J[i] * w[i];
  }
  return 0;
}

CEED_QFUNCTION(Mass2DBuild)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedScalar *J = in[0], *w = in[1];
  CeedScalar *qdata = out[0];
  for (CeedInt i = 0; i < Q; i++) {
    qdata[i] = (J[i + Q * 0] * J[i + Q * 3] - J[i + Q * 1] * J[i + Q * 2]) * w[i];
  }
  return 0;
}

CEED_QFUNCTION(Mass3DBuild)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedScalar *J = in[0], *w = in[1];
  CeedScalar *qdata = out[0];
  for (CeedInt i = 0; i < Q; i++) {
    const CeedScalar A00 = J[i + Q * 4] * J[i + Q * 8] - J[i + Q * 5] * J[i + Q * 7];
    const CeedScalar A01 = J[i + Q * 5] * J[i + Q * 6] - J[i + Q * 3] * J[i + Q * 8];
    const CeedScalar A02 = J[i + Q * 3] * J[i + Q * 7] - J[i + Q * 4] * J[i + Q * 6];
    qdata[i] = (J[i + Q * 0] * A00 + J[i + Q * 1] * A01 + J[i + Q * 2] * A02) * w[i];
  }
  return 0;
}

CEED_QFUNCTION(MassApply)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedScalar *u = in[0], *qdata = in[1];
  CeedScalar *v = out[0];
  for (CeedInt i = 0; i < Q; i++) {
    v[i] = qdata[i] * u[i];
  }
  return 0;
}
"#;

const POISSON_SOURCE: &str = r#"
CEED_QFUNCTION(Poisson1DBuild)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedScalar *J = in[0], *w = in[1];
  CeedScalar *qdata = out[0];
  for (CeedInt i = 0; i < Q; i++) {
    qdata[i] = w[i] / J[i];
  }
  return 0;
}

CEED_QFUNCTION(Poisson2DBuild)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedScalar *J = in[0], *w = in[1];
  CeedScalar *qdata = out[0];
  for (CeedInt i = 0; i < Q; i++) {
    const CeedScalar J00 = J[i + Q * 0], J10 = J[i + Q * 1], J01 = J[i + Q * 2], J11 = J[i + Q * 3];
    const CeedScalar qw = w[i] / (J00 * J11 - J10 * J01);
    qdata[i + Q * 0] = qw * (J01 * J01 + J11 * J11);
    qdata[i + Q * 1] = qw * (J00 * J00 + J10 * J10);
    qdata[i + Q * 2] = -qw * (J00 * J01 + J10 * J11);
  }
  return 0;
}

CEED_QFUNCTION(Poisson3DBuild)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedScalar *J = in[0], *w = in[1];
  CeedScalar *qdata = out[0];
  for (CeedInt i = 0; i < Q; i++) {
    CeedScalar A[3][3];
    for (CeedInt j = 0; j < 3; j++) {
      for (CeedInt k = 0; k < 3; k++) {
        A[k][j] = J[i + Q * ((j + 1) % 3 + 3 * ((k + 1) % 3))] * J[i + Q * ((j + 2) % 3 + 3 * ((k + 2) % 3))] -
                  J[i + Q * ((j + 2) % 3 + 3 * ((k + 1) % 3))] * J[i + Q * ((j + 1) % 3 + 3 * ((k + 2) % 3))];
      }
    }
    const CeedScalar qw = w[i] / (J[i + Q * 0] * A[0][0] + J[i + Q * 1] * A[0][1] + J[i + Q * 2] * A[0][2]);
    qdata[i + Q * 0] = qw * (A[0][0] * A[0][0] + A[0][1] * A[0][1] + A[0][2] * A[0][2]);
    qdata[i + Q * 1] = qw * (A[1][0] * A[1][0] + A[1][1] * A[1][1] + A[1][2] * A[1][2]);
    qdata[i + Q * 2] = qw * (A[2][0] * A[2][0] + A[2][1] * A[2][1] + A[2][2] * A[2][2]);
    qdata[i + Q * 3] = qw * (A[1][0] * A[2][0] + A[1][1] * A[2][1] + A[1][2] * A[2][2]);
    qdata[i + Q * 4] = qw * (A[0][0] * A[2][0] + A[0][1] * A[2][1] + A[0][2] * A[2][2]);
    qdata[i + Q * 5] = qw * (A[0][0] * A[1][0] + A[0][1] * A[1][1] + A[0][2] * A[1][2]);
  }
  return 0;
}

CEED_QFUNCTION(Poisson1DApply)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedScalar *du = in[0], *qdata = in[1];
  CeedScalar *dv = out[0];
  for (CeedInt i = 0; i < Q; i++) {
    dv[i] = qdata[i] * du[i];
  }
  return 0;
}

CEED_QFUNCTION(Poisson2DApply)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedScalar *du = in[0], *qdata = in[1];
  CeedScalar *dv = out[0];
  for (CeedInt i = 0; i < Q; i++) {
    const CeedScalar du0 = du[i + Q * 0], du1 = du[i + Q * 1];
    dv[i + Q * 0] = qdata[i + Q * 0] * du0 + qdata[i + Q * 2] * du1;
    dv[i + Q * 1] = qdata[i + Q * 2] * du0 + qdata[i + Q * 1] * du1;
  }
  return 0;
}

CEED_QFUNCTION(Poisson3DApply)(void *ctx, const CeedInt Q, const CeedScalar *const *in, CeedScalar *const *out) {
  const CeedScalar *du = in[0], *qdata = in[1];
  CeedScalar *dv = out[0];
  for (CeedInt i = 0; i < Q; i++) {
    const CeedScalar du0 = du[i + Q * 0], du1 = du[i + Q * 1], du2 = du[i + Q * 2];
    dv[i + Q * 0] = qdata[i + Q * 0] * du0 + qdata[i + Q * 5] * du1 + qdata[i + Q * 4] * du2;
    dv[i + Q * 1] = qdata[i + Q * 5] * du0 + qdata[i + Q * 1] * du1 + qdata[i + Q * 3] * du2;
    dv[i + Q * 2] = qdata[i + Q * 4] * du0 + qdata[i + Q * 3] * du1 + qdata[i + Q * 2] * du2;
  }
  return 0;
}
"#;

/// Names of all QFunctions available through
/// [`Backend::q_function_by_name`](crate::Backend::q_function_by_name).
pub const GALLERY_NAMES: [&str; 12] = [
    "Identity",
    "Scale",
    "Mass1DBuild",
    "Mass2DBuild",
    "Mass3DBuild",
    "MassApply",
    "Poisson1DBuild",
    "Poisson2DBuild",
    "Poisson3DBuild",
    "Poisson1DApply",
    "Poisson2DApply",
    "Poisson3DApply",
];

/// Entries of compact symmetric storage, in storage order.
const SYMMETRIC_2D: [(usize, usize); 3] = [(0, 0), (1, 1), (0, 1)];
const SYMMETRIC_3D: [(usize, usize); 6] = [(0, 0), (1, 1), (2, 2), (1, 2), (0, 2), (0, 1)];

pub(crate) fn by_name(backend: Backend, name: &str) -> Result<QFunction> {
    match name {
        "Identity" => identity(backend, 1, EvalMode::Interp, EvalMode::Interp),
        "Scale" => scale(backend),
        "Mass1DBuild" => mass_build(backend, 1),
        "Mass2DBuild" => mass_build(backend, 2),
        "Mass3DBuild" => mass_build(backend, 3),
        "MassApply" => mass_apply(backend),
        "Poisson1DBuild" => poisson_build(backend, 1),
        "Poisson2DBuild" => poisson_build(backend, 2),
        "Poisson3DBuild" => poisson_build(backend, 3),
        "Poisson1DApply" => poisson_apply(backend, 1),
        "Poisson2DApply" => poisson_apply(backend, 2),
        "Poisson3DApply" => poisson_apply(backend, 3),
        _ => Err(Error::configuration(format!("no QFunction named `{name}` in the gallery"))),
    }
}

pub(crate) fn identity(backend: Backend, size: usize, in_mode: EvalMode, out_mode: EvalMode) -> Result<QFunction> {
    let kernel = kernel_fn(move |_, q, inputs, outputs| {
        outputs[0][..size * q].copy_from_slice(&inputs[0][..size * q]);
        0
    });
    let qf = QFunction::embedded(backend, 1, kernel, "gallery/identity.h", "Identity", IDENTITY_SOURCE)?
        .input("input", size, in_mode)?
        .output("output", size, out_mode)?;
    qf.set_context(&(size as i32));
    Ok(qf)
}

fn scale(backend: Backend) -> Result<QFunction> {
    let kernel = kernel_fn(|ctx, q, inputs, outputs| {
        let scale: Scalar = match bytemuck::try_pod_read_unaligned(ctx) {
            Ok(scale) => scale,
            Err(_) => return 1,
        };
        for (v, u) in outputs[0][..q].iter_mut().zip(&inputs[0][..q]) {
            *v = scale * u;
        }
        0
    });
    let qf = QFunction::embedded(backend, 1, kernel, "gallery/identity.h", "Scale", IDENTITY_SOURCE)?
        .input("input", 1, EvalMode::Interp)?
        .output("output", 1, EvalMode::Interp)?;
    qf.set_context(&1.0f64);
    Ok(qf)
}

/// Jacobian of the coordinate field at point `i` of `q`.
fn jacobian<const D: usize>(dx: &[Scalar], q: usize, i: usize) -> SMatrix<Scalar, D, D> {
    SMatrix::from_fn(|c, d| dx[(d * D + c) * q + i])
}

/// Adjugate of a 2x2 matrix.
fn adjugate2(j: &Matrix2<Scalar>) -> Matrix2<Scalar> {
    Matrix2::new(j[(1, 1)], -j[(0, 1)], -j[(1, 0)], j[(0, 0)])
}

/// Adjugate of a 3x3 matrix, the transposed cofactor matrix.
fn adjugate3(j: &Matrix3<Scalar>) -> Matrix3<Scalar> {
    Matrix3::from_fn(|r, c| {
        let (r1, r2) = ((c + 1) % 3, (c + 2) % 3);
        let (c1, c2) = ((r + 1) % 3, (r + 2) % 3);
        j[(r1, c1)] * j[(r2, c2)] - j[(r1, c2)] * j[(r2, c1)]
    })
}

fn mass_build_kernel(dim: usize) -> QFunctionKernel {
    kernel_fn(move |_, q, inputs, outputs| {
        let (dx, weights) = (inputs[0], inputs[1]);
        for (i, qdata) in outputs[0][..q].iter_mut().enumerate() {
            let det = match dim {
                1 => dx[i],
                2 => jacobian::<2>(dx, q, i).determinant(),
                _ => jacobian::<3>(dx, q, i).determinant(),
            };
            *qdata = det * weights[i];
        }
        0
    })
}

fn mass_build(backend: Backend, dim: usize) -> Result<QFunction> {
    let entry = format!("Mass{dim}DBuild");
    QFunction::embedded(backend, 1, mass_build_kernel(dim), "gallery/mass.h", &entry, MASS_SOURCE)?
        .input("dx", dim * dim, EvalMode::Grad)?
        .input("weights", 1, EvalMode::Weight)?
        .output("qdata", 1, EvalMode::None)
}

fn mass_apply(backend: Backend) -> Result<QFunction> {
    let kernel = kernel_fn(|_, q, inputs, outputs| {
        let (u, qdata) = (inputs[0], inputs[1]);
        for (i, v) in outputs[0][..q].iter_mut().enumerate() {
            *v = qdata[i] * u[i];
        }
        0
    });
    QFunction::embedded(backend, 1, kernel, "gallery/mass.h", "MassApply", MASS_SOURCE)?
        .input("u", 1, EvalMode::Interp)?
        .input("qdata", 1, EvalMode::None)?
        .output("v", 1, EvalMode::Interp)
}

fn poisson_build_kernel(dim: usize) -> QFunctionKernel {
    kernel_fn(move |_, q, inputs, outputs| {
        let (dx, weights) = (inputs[0], inputs[1]);
        let qdata = &mut *outputs[0];
        for i in 0..q {
            match dim {
                1 => qdata[i] = weights[i] / dx[i],
                2 => {
                    let j = jacobian::<2>(dx, q, i);
                    let adj = adjugate2(&j);
                    let metric = adj * adj.transpose() * (weights[i] / j.determinant());
                    for (k, &(r, c)) in SYMMETRIC_2D.iter().enumerate() {
                        qdata[k * q + i] = metric[(r, c)];
                    }
                }
                _ => {
                    let j = jacobian::<3>(dx, q, i);
                    let adj = adjugate3(&j);
                    let metric = adj * adj.transpose() * (weights[i] / j.determinant());
                    for (k, &(r, c)) in SYMMETRIC_3D.iter().enumerate() {
                        qdata[k * q + i] = metric[(r, c)];
                    }
                }
            }
        }
        0
    })
}

fn poisson_build(backend: Backend, dim: usize) -> Result<QFunction> {
    let entry = format!("Poisson{dim}DBuild");
    QFunction::embedded(backend, 1, poisson_build_kernel(dim), "gallery/poisson.h", &entry, POISSON_SOURCE)?
        .input("dx", dim * dim, EvalMode::Grad)?
        .input("weights", 1, EvalMode::Weight)?
        .output("qdata", dim * (dim + 1) / 2, EvalMode::None)
}

/// Index of entry `(r, c)` of a symmetric matrix in compact storage.
fn symmetric_index(dim: usize, r: usize, c: usize) -> usize {
    let (r, c) = (r.min(c), r.max(c));
    match dim {
        1 => 0,
        2 => SYMMETRIC_2D.iter().position(|&entry| entry == (r, c)).unwrap_or(0),
        _ => SYMMETRIC_3D.iter().position(|&entry| entry == (r, c)).unwrap_or(0),
    }
}

fn poisson_apply(backend: Backend, dim: usize) -> Result<QFunction> {
    let kernel = kernel_fn(move |_, q, inputs, outputs| {
        let (du, qdata) = (inputs[0], inputs[1]);
        let dv = &mut *outputs[0];
        for i in 0..q {
            for r in 0..dim {
                dv[r * q + i] = (0..dim)
                    .map(|c| qdata[symmetric_index(dim, r, c) * q + i] * du[c * q + i])
                    .sum();
            }
        }
        0
    });
    let entry = format!("Poisson{dim}DApply");
    let num_qdata = dim * (dim + 1) / 2;
    QFunction::embedded(backend, 1, kernel, "gallery/poisson.h", &entry, POISSON_SOURCE)?
        .input("du", dim, EvalMode::Grad)?
        .input("qdata", num_qdata, EvalMode::None)?
        .output("dv", dim, EvalMode::Grad)
}
