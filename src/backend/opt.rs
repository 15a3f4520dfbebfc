//! Optimized host contraction.
use crate::backend::TensorContract;
use crate::basis::plan::ContractionStep;
use crate::Scalar;

const LANES: usize = 4;

/// Contraction with the component loop unrolled in lanes of four, and a dot-product kernel
/// for contractions without trailing components.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptContract;

impl OptContract {
    fn contract_single(step: &ContractionStep, t: &[Scalar], u: &[Scalar], v: &mut [Scalar]) {
        let (a, b, j) = (step.a, step.b, step.j);
        for a_idx in 0..a {
            let u_row = &u[a_idx * b..(a_idx + 1) * b];
            let v_row = &mut v[a_idx * j..(a_idx + 1) * j];
            for (j_idx, v_j) in v_row.iter_mut().enumerate() {
                let dot: Scalar = if step.transpose {
                    u_row
                        .iter()
                        .enumerate()
                        .map(|(b_idx, u_b)| t[b_idx * j + j_idx] * u_b)
                        .sum()
                } else {
                    t[j_idx * b..(j_idx + 1) * b]
                        .iter()
                        .zip(u_row)
                        .map(|(t_jb, u_b)| t_jb * u_b)
                        .sum()
                };
                if step.add {
                    *v_j += dot;
                } else {
                    *v_j = dot;
                }
            }
        }
    }

    fn contract_lanes(step: &ContractionStep, t: &[Scalar], u: &[Scalar], v: &mut [Scalar]) {
        let (a, b, c, j) = (step.a, step.b, step.c, step.j);
        let (t_stride_j, t_stride_b) = if step.transpose { (1, j) } else { (b, 1) };
        if !step.add {
            v[..a * j * c].fill(0.0);
        }
        for a_idx in 0..a {
            for j_idx in 0..j {
                let v_block = &mut v[(a_idx * j + j_idx) * c..][..c];
                for b_idx in 0..b {
                    let t_jb = t[j_idx * t_stride_j + b_idx * t_stride_b];
                    let u_block = &u[(a_idx * b + b_idx) * c..][..c];
                    let mut v_lanes = v_block.chunks_exact_mut(LANES);
                    let mut u_lanes = u_block.chunks_exact(LANES);
                    for (v_lane, u_lane) in (&mut v_lanes).zip(&mut u_lanes) {
                        v_lane[0] += t_jb * u_lane[0];
                        v_lane[1] += t_jb * u_lane[1];
                        v_lane[2] += t_jb * u_lane[2];
                        v_lane[3] += t_jb * u_lane[3];
                    }
                    for (v_c, u_c) in v_lanes.into_remainder().iter_mut().zip(u_lanes.remainder()) {
                        *v_c += t_jb * u_c;
                    }
                }
            }
        }
    }
}

impl TensorContract for OptContract {
    fn contract(&self, step: &ContractionStep, t: &[Scalar], u: &[Scalar], v: &mut [Scalar]) {
        if step.c == 1 {
            Self::contract_single(step, t, u, v);
        } else {
            Self::contract_lanes(step, t, u, v);
        }
    }
}
