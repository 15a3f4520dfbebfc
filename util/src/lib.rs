//! Helpers shared by tests and benchmarks: approximate comparisons and structured meshes.
pub use nalgebra;

/// Poor man's approx assertion for slices
#[macro_export]
macro_rules! assert_slices_approx_eq {
    ($x:expr, $y:expr, abstol = $tol:expr) => {{
        let x = $crate::nalgebra::DVector::from_column_slice(&$x[..]);
        let y = $crate::nalgebra::DVector::from_column_slice(&$y[..]);
        assert_eq!(x.len(), y.len(), "slices have different lengths");
        let diff = &x - &y;

        let max_absdiff = diff.abs().max();
        let approx_eq = max_absdiff <= $tol;

        if !approx_eq {
            println!("abstol: {:e}", $tol);
            println!("left: {}", x.transpose());
            println!("right: {}", y.transpose());
            println!("diff: {:e}", diff.transpose());
        }
        assert!(approx_eq);
    }};
}

/// Number of nodes along each axis of a box mesh.
pub fn box_mesh_nodes_1d(num_elem_1d: usize, p: usize) -> usize {
    num_elem_1d * (p - 1) + 1
}

/// Total number of nodes of a box mesh.
pub fn box_mesh_num_nodes(dim: usize, num_elem_1d: usize, p: usize) -> usize {
    box_mesh_nodes_1d(num_elem_1d, p).pow(dim as u32)
}

/// Element-to-node offsets of a box mesh of `num_elem_1d^dim` tensor-product elements with
/// `p` nodes per direction.
///
/// Elements and nodes are numbered with the first axis varying fastest, in the same order
/// as the nodes of a tensor-product basis.
pub fn box_mesh_offsets(dim: usize, num_elem_1d: usize, p: usize) -> Vec<usize> {
    let n1 = box_mesh_nodes_1d(num_elem_1d, p);
    let num_elem = num_elem_1d.pow(dim as u32);
    let elem_size = p.pow(dim as u32);
    let mut offsets = Vec::with_capacity(num_elem * elem_size);
    for elem in 0..num_elem {
        for node in 0..elem_size {
            let mut global = 0;
            let mut stride = 1;
            for axis in 0..dim {
                let e = (elem / num_elem_1d.pow(axis as u32)) % num_elem_1d;
                let k = (node / p.pow(axis as u32)) % p;
                global += (e * (p - 1) + k) * stride;
                stride *= n1;
            }
            offsets.push(global);
        }
    }
    offsets
}

/// Node coordinates of a box mesh of `[0, length]^dim`, laid out `[axis][node]`.
///
/// `nodes_1d` are the node locations of the basis on the reference interval `[-1, 1]`.
pub fn box_mesh_coordinates(dim: usize, num_elem_1d: usize, nodes_1d: &[f64], length: f64) -> Vec<f64> {
    let p = nodes_1d.len();
    let n1 = box_mesh_nodes_1d(num_elem_1d, p);
    let h = length / num_elem_1d as f64;
    let position = |i: usize| {
        if i + 1 == n1 {
            length
        } else {
            let (e, k) = (i / (p - 1), i % (p - 1));
            (e as f64 + 0.5 * (nodes_1d[k] + 1.0)) * h
        }
    };
    let num_nodes = n1.pow(dim as u32);
    (0..dim)
        .flat_map(|axis| (0..num_nodes).map(move |node| position((node / n1.pow(axis as u32)) % n1)))
        .collect()
}
