use std::sync::Arc;

use matfree::basis::Basis;
use matfree::elem_restriction::ElemRestriction;
use matfree::operator::{BasisOpt, ElemRestrictionOpt, Operator, OperatorStage, VectorOpt};
use matfree::quadrature::lagrange::LagrangeTables;
use matfree::qfunction::QFunction;
use matfree::vector::Vector;
use matfree::{Backend, EvalMode, QuadMode, Result, TransposeMode};
use matrixcompare::assert_matrix_eq;
use nalgebra::DMatrix;
use parking_lot::Mutex;
use util::{assert_slices_approx_eq, box_mesh_coordinates, box_mesh_num_nodes, box_mesh_offsets};

use super::{backend, dot, RESOURCES};

/// Restrictions, bases and coordinates of a uniform box mesh of `[0, length]^dim`.
struct BoxMesh {
    backend: Backend,
    dim: usize,
    num_nodes: usize,
    r_x: ElemRestriction,
    r_u: ElemRestriction,
    r_q: ElemRestriction,
    basis_x: Basis,
    basis_u: Basis,
    x: Vector<'static>,
    qdata: Vector<'static>,
}

impl BoxMesh {
    fn new(resource: &str, dim: usize, num_elem_1d: usize, p: usize, q: usize, length: f64, qdata_comp: usize) -> Self {
        let backend = backend(resource);
        let num_elem = num_elem_1d.pow(dim as u32);
        let elem_size = p.pow(dim as u32);
        let num_qpts = q.pow(dim as u32);
        let num_nodes = box_mesh_num_nodes(dim, num_elem_1d, p);
        let offsets = box_mesh_offsets(dim, num_elem_1d, p);
        let nodes_1d = LagrangeTables::new(p, q, QuadMode::Gauss).unwrap().nodes;
        let coordinates = box_mesh_coordinates(dim, num_elem_1d, &nodes_1d, length);

        let r_x = backend
            .elem_restriction(num_elem, elem_size, dim, dim * num_nodes, &offsets)
            .unwrap();
        let r_u = backend
            .elem_restriction(num_elem, elem_size, 1, num_nodes, &offsets)
            .unwrap();
        let r_q = backend
            .identity_elem_restriction(num_elem, num_qpts, qdata_comp, num_elem * num_qpts * qdata_comp)
            .unwrap();
        let basis_x = backend
            .basis_tensor_h1_lagrange(dim, dim, p, q, QuadMode::Gauss)
            .unwrap();
        let basis_u = backend
            .basis_tensor_h1_lagrange(dim, 1, p, q, QuadMode::Gauss)
            .unwrap();
        let x = backend.vector_from_slice(&coordinates).unwrap();
        let qdata = r_q.create_lvector().unwrap();
        Self {
            backend,
            dim,
            num_nodes,
            r_x,
            r_u,
            r_q,
            basis_x,
            basis_u,
            x,
            qdata,
        }
    }

    /// Coordinates of every node, one vector per axis.
    fn node_coordinates(&self, axis: usize) -> Vec<f64> {
        let x = self.x.to_vec().unwrap();
        x[axis * self.num_nodes..(axis + 1) * self.num_nodes].to_vec()
    }

    /// Operator computing quadrature data from the coordinates.
    fn setup<'a>(&'a self, qf: &'a QFunction) -> Result<Operator<'a>> {
        self.backend
            .operator(qf)?
            .field("dx", &self.r_x, TransposeMode::NoTranspose, &self.basis_x, VectorOpt::Active)?
            .field("weights", ElemRestrictionOpt::None, TransposeMode::NoTranspose, &self.basis_x, VectorOpt::None)?
            .field("qdata", &self.r_q, TransposeMode::NoTranspose, BasisOpt::Collocated, VectorOpt::Active)
    }

    fn mass<'a>(&'a self, build: &'a QFunction, apply: &'a QFunction) -> Result<Operator<'a>> {
        self.backend
            .operator(apply)?
            .field("u", &self.r_u, TransposeMode::Transpose, &self.basis_u, VectorOpt::Active)?
            .field("qdata", &self.r_q, TransposeMode::NoTranspose, BasisOpt::Collocated, VectorOpt::Some(&self.qdata))?
            .field("v", &self.r_u, TransposeMode::Transpose, &self.basis_u, VectorOpt::Active)?
            .with_setup(self.setup(build)?, &self.x, &self.qdata)
    }

    fn poisson<'a>(&'a self, build: &'a QFunction, apply: &'a QFunction) -> Result<Operator<'a>> {
        self.backend
            .operator(apply)?
            .field("du", &self.r_u, TransposeMode::Transpose, &self.basis_u, VectorOpt::Active)?
            .field("qdata", &self.r_q, TransposeMode::NoTranspose, BasisOpt::Collocated, VectorOpt::Some(&self.qdata))?
            .field("dv", &self.r_u, TransposeMode::Transpose, &self.basis_u, VectorOpt::Active)?
            .with_setup(self.setup(build)?, &self.x, &self.qdata)
    }

    fn mass_functions(&self) -> (QFunction, QFunction) {
        let build = self
            .backend
            .q_function_by_name(&format!("Mass{}DBuild", self.dim))
            .unwrap();
        let apply = self.backend.q_function_by_name("MassApply").unwrap();
        (build, apply)
    }

    fn poisson_functions(&self) -> (QFunction, QFunction) {
        let build = self
            .backend
            .q_function_by_name(&format!("Poisson{}DBuild", self.dim))
            .unwrap();
        let apply = self
            .backend
            .q_function_by_name(&format!("Poisson{}DApply", self.dim))
            .unwrap();
        (build, apply)
    }
}

fn apply_to(op: &Operator, backend: &Backend, u: &[f64]) -> Vec<f64> {
    let u = backend.vector_from_slice(u).unwrap();
    let v = backend.vector(u.length()).unwrap();
    op.apply(&u, &v).unwrap();
    v.to_vec().unwrap()
}

#[test]
fn identity_operator_sums_shared_nodes() {
    for resource in RESOURCES {
        let backend = backend(resource);
        let r = backend.elem_restriction(3, 2, 1, 4, &[0, 1, 1, 2, 2, 3]).unwrap();
        let qf = backend
            .q_function_identity(1, EvalMode::None, EvalMode::None)
            .unwrap();
        let op = backend
            .operator(&qf)
            .unwrap()
            .field("input", &r, TransposeMode::Transpose, BasisOpt::Collocated, VectorOpt::Active)
            .unwrap()
            .field("output", &r, TransposeMode::Transpose, BasisOpt::Collocated, VectorOpt::Active)
            .unwrap();
        assert_eq!(op.stage(), OperatorStage::Unassembled);
        assert_eq!((op.num_elements(), op.num_quadrature_points()), (3, 2));
        assert_eq!((op.input_size(), op.output_size()), (Some(4), Some(4)));

        let v = apply_to(&op, &backend, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(v, vec![1.0, 4.0, 6.0, 4.0], "{resource}");
        assert_eq!(op.stage(), OperatorStage::Applied);
    }
}

#[test]
fn identity_operator_reproduces_input() {
    for resource in RESOURCES {
        let backend = backend(resource);
        let (num_elem, num_qpts, num_comp) = (3, 4, 2);
        let l_size = num_elem * num_qpts * num_comp;
        let r = backend
            .identity_elem_restriction(num_elem, num_qpts, num_comp, l_size)
            .unwrap();
        let qf = backend
            .q_function_identity(num_comp, EvalMode::None, EvalMode::None)
            .unwrap();
        let op = backend
            .operator(&qf)
            .unwrap()
            .field("input", &r, TransposeMode::NoTranspose, BasisOpt::Collocated, VectorOpt::Active)
            .unwrap()
            .field("output", &r, TransposeMode::NoTranspose, BasisOpt::Collocated, VectorOpt::Active)
            .unwrap();

        let u: Vec<f64> = (0..l_size).map(|i| (1.3 * i as f64).sin()).collect();
        assert_eq!(apply_to(&op, &backend, &u), u, "{resource}");
    }
}

#[test]
fn blocked_operator_calls_kernel_once_per_block() {
    let backend = backend("/cpu/self/ref/blocked:block_size=2");
    let (num_elem, num_qpts) = (5, 3);
    let l_size = num_elem * num_qpts;
    let r = backend
        .identity_elem_restriction(num_elem, num_qpts, 1, l_size)
        .unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = calls.clone();
    let qf = backend
        .q_function_interior(
            1,
            move |_, q, inputs, outputs| {
                recorded.lock().push(q);
                outputs[0][..q].copy_from_slice(&inputs[0][..q]);
                0
            },
            "tests/kernels/axpy.c:Copy",
        )
        .unwrap()
        .input("input", 1, EvalMode::None)
        .unwrap()
        .output("output", 1, EvalMode::None)
        .unwrap();
    let op = backend
        .operator(&qf)
        .unwrap()
        .field("input", &r, TransposeMode::NoTranspose, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
        .field("output", &r, TransposeMode::NoTranspose, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap();

    let u: Vec<f64> = (0..l_size).map(|i| i as f64).collect();
    assert_eq!(apply_to(&op, &backend, &u), u);
    // Three blocks of two elements, the last one padded
    assert_eq!(*calls.lock(), vec![2 * num_qpts; 3]);
}

#[test]
fn apply_add_accumulates() {
    let backend = backend("/cpu/self");
    let r = backend.elem_restriction(2, 2, 1, 3, &[0, 1, 1, 2]).unwrap();
    let qf = backend
        .q_function_identity(1, EvalMode::None, EvalMode::None)
        .unwrap();
    let op = backend
        .operator(&qf)
        .unwrap()
        .field("input", &r, TransposeMode::Transpose, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
        .field("output", &r, TransposeMode::Transpose, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap();
    op.finalize().unwrap();
    assert_eq!(op.stage(), OperatorStage::Finalized);

    let u = backend.vector_from_slice(&[1.0, 1.0, 1.0]).unwrap();
    let v = backend.vector_from_slice(&[10.0, 10.0, 10.0]).unwrap();
    op.apply_add(&u, &v).unwrap();
    op.apply_add(&u, &v).unwrap();
    assert_eq!(v.to_vec().unwrap(), vec![12.0, 14.0, 12.0]);
    op.apply(&u, &v).unwrap();
    assert_eq!(v.to_vec().unwrap(), vec![1.0, 2.0, 1.0]);
}

#[test]
fn mass_operator_integrates_over_domain() {
    for resource in RESOURCES {
        let mesh = BoxMesh::new(resource, 1, 4, 3, 4, 2.0, 1);
        let (build, apply) = mesh.mass_functions();
        let op = mesh.mass(&build, &apply).unwrap();

        let ones = vec![1.0; mesh.num_nodes];
        let m_ones = apply_to(&op, &mesh.backend, &ones);
        assert!((m_ones.iter().sum::<f64>() - 2.0).abs() < 1e-12, "{resource}");

        // The integral of x over [0, 2]
        let x = mesh.node_coordinates(0);
        let m_x = apply_to(&op, &mesh.backend, &x);
        assert!((m_x.iter().sum::<f64>() - 2.0).abs() < 1e-12, "{resource}");
        // The integral of x^2, quadratics are represented exactly
        assert!((dot(&x, &m_x) - 8.0 / 3.0).abs() < 1e-12, "{resource}");
    }
}

#[test]
fn mass_operator_in_two_dimensions() {
    for resource in RESOURCES {
        let mesh = BoxMesh::new(resource, 2, 3, 3, 3, 1.5, 1);
        let (build, apply) = mesh.mass_functions();
        let op = mesh.mass(&build, &apply).unwrap();
        let m_ones = apply_to(&op, &mesh.backend, &vec![1.0; mesh.num_nodes]);
        assert!((m_ones.iter().sum::<f64>() - 2.25).abs() < 1e-12, "{resource}");
    }
}

#[test]
fn invalidated_setup_runs_again() {
    let mesh = BoxMesh::new("/cpu/self", 1, 3, 2, 2, 1.0, 1);
    let (build, apply) = mesh.mass_functions();
    let op = mesh.mass(&build, &apply).unwrap();
    let ones = vec![1.0; mesh.num_nodes];
    let before: f64 = apply_to(&op, &mesh.backend, &ones).iter().sum();
    assert!((before - 1.0).abs() < 1e-12);

    mesh.x.scale(2.0).unwrap();
    // Without invalidation the quadrature data is reused
    let stale: f64 = apply_to(&op, &mesh.backend, &ones).iter().sum();
    assert!((stale - 1.0).abs() < 1e-12);

    op.invalidate_setup();
    let after: f64 = apply_to(&op, &mesh.backend, &ones).iter().sum();
    assert!((after - 2.0).abs() < 1e-12);
}

#[test]
fn repeated_application_is_reproducible() {
    for resource in RESOURCES {
        let mesh = BoxMesh::new(resource, 2, 3, 3, 4, 1.0, 3);
        let (build, apply) = mesh.poisson_functions();
        let op = mesh.poisson(&build, &apply).unwrap();
        let u: Vec<f64> = (0..mesh.num_nodes).map(|i| (0.4 * i as f64).cos()).collect();

        let first = apply_to(&op, &mesh.backend, &u);
        for _ in 0..3 {
            assert_eq!(apply_to(&op, &mesh.backend, &u), first, "{resource}");
        }

        // Recomputing the quadrature data from unchanged coordinates changes nothing
        op.invalidate_setup();
        assert_eq!(apply_to(&op, &mesh.backend, &u), first, "{resource}");
    }
}

#[test]
fn poisson_operator_annihilates_constants() {
    for resource in RESOURCES {
        let mesh = BoxMesh::new(resource, 2, 2, 2, 2, 1.0, 3);
        let (build, apply) = mesh.poisson_functions();
        let op = mesh.poisson(&build, &apply).unwrap();

        let k_ones = apply_to(&op, &mesh.backend, &vec![1.0; mesh.num_nodes]);
        assert_slices_approx_eq!(k_ones, vec![0.0; mesh.num_nodes], abstol = 1e-12);

        // u = x + 2y has energy |grad u|^2 = 5 on the unit square
        let (x, y) = (mesh.node_coordinates(0), mesh.node_coordinates(1));
        let u: Vec<f64> = x.iter().zip(&y).map(|(x, y)| x + 2.0 * y).collect();
        let k_u = apply_to(&op, &mesh.backend, &u);
        assert!(k_u.iter().sum::<f64>().abs() < 1e-12, "{resource}");
        assert!((dot(&u, &k_u) - 5.0).abs() < 1e-12, "{resource}");
    }
}

#[test]
fn poisson_operator_in_three_dimensions() {
    let mesh = BoxMesh::new("/cpu/self", 3, 2, 2, 2, 2.0, 6);
    let (build, apply) = mesh.poisson_functions();
    let op = mesh.poisson(&build, &apply).unwrap();
    let z = mesh.node_coordinates(2);
    let k_z = apply_to(&op, &mesh.backend, &z);
    // Energy of u = z on a cube of volume 8
    assert!((dot(&z, &k_z) - 8.0).abs() < 1e-11);
}

#[test]
fn diagonal_matches_operator_columns() {
    for resource in RESOURCES {
        let mesh = BoxMesh::new(resource, 2, 2, 3, 4, 1.0, 3);
        let (build, apply) = mesh.poisson_functions();
        let op = mesh.poisson(&build, &apply).unwrap();
        let n = mesh.num_nodes;

        let diag = mesh.backend.vector(n).unwrap();
        op.linear_assemble_diagonal(&diag).unwrap();
        let diag = diag.to_vec().unwrap();

        // Columns of the operator matrix, one unit vector at a time
        let columns: Vec<f64> = (0..n)
            .flat_map(|i| {
                let mut e_i = vec![0.0; n];
                e_i[i] = 1.0;
                apply_to(&op, &mesh.backend, &e_i)
            })
            .collect();
        let matrix = DMatrix::from_column_slice(n, n, &columns);
        assert_matrix_eq!(matrix, matrix.transpose(), comp = abs, tol = 1e-12);
        assert_slices_approx_eq!(diag, matrix.diagonal().as_slice(), abstol = 1e-12);
    }
}

#[test]
fn composite_operator_sums_its_parts() {
    for resource in RESOURCES {
        let mass_mesh = BoxMesh::new(resource, 1, 3, 3, 4, 1.0, 1);
        // Both operators share the mesh objects, the Poisson operator keeps its own quadrature data
        let (mass_build, mass_apply) = mass_mesh.mass_functions();
        let mass = mass_mesh.mass(&mass_build, &mass_apply).unwrap();
        let (poisson_build, poisson_apply) = mass_mesh.poisson_functions();
        let poisson_qdata = mass_mesh.r_q.create_lvector().unwrap();
        let poisson_setup = mass_mesh.setup(&poisson_build).unwrap();
        let poisson = mass_mesh
            .backend
            .operator(&poisson_apply)
            .unwrap()
            .field("du", &mass_mesh.r_u, TransposeMode::Transpose, &mass_mesh.basis_u, VectorOpt::Active)
            .unwrap()
            .field("qdata", &mass_mesh.r_q, TransposeMode::NoTranspose, BasisOpt::Collocated, VectorOpt::Some(&poisson_qdata))
            .unwrap()
            .field("dv", &mass_mesh.r_u, TransposeMode::Transpose, &mass_mesh.basis_u, VectorOpt::Active)
            .unwrap()
            .with_setup(poisson_setup, &mass_mesh.x, &poisson_qdata)
            .unwrap();

        let composite = mass_mesh
            .backend
            .composite_operator()
            .unwrap()
            .add_sub(&mass)
            .unwrap()
            .add_sub(&poisson)
            .unwrap();
        assert_eq!(composite.sub_operators().len(), 2);
        assert_eq!(composite.input_size(), Some(mass_mesh.num_nodes));

        let u: Vec<f64> = mass_mesh
            .node_coordinates(0)
            .iter()
            .map(|x| (3.0 * x).sin())
            .collect();
        let u_vec = mass_mesh.backend.vector_from_slice(&u).unwrap();
        let v = mass_mesh.backend.vector(u.len()).unwrap();
        composite.apply(&u_vec, &v).unwrap();

        let expected: Vec<f64> = apply_to(&mass, &mass_mesh.backend, &u)
            .iter()
            .zip(apply_to(&poisson, &mass_mesh.backend, &u))
            .map(|(m, k)| m + k)
            .collect();
        assert_slices_approx_eq!(v.to_vec().unwrap(), expected, abstol = 1e-12);

        let diag = mass_mesh.backend.vector(u.len()).unwrap();
        composite.linear_assemble_diagonal(&diag).unwrap();
        let mass_diag = mass_mesh.backend.vector(u.len()).unwrap();
        mass.linear_assemble_diagonal(&mass_diag).unwrap();
        poisson.linear_assemble_add_diagonal(&mass_diag).unwrap();
        assert_slices_approx_eq!(diag.to_vec().unwrap(), mass_diag.to_vec().unwrap(), abstol = 1e-12);
    }
}

#[test]
fn invalid_bindings_are_rejected() {
    let mesh = BoxMesh::new("/cpu/self", 1, 2, 3, 4, 1.0, 1);
    let backend = &mesh.backend;
    let (_, apply) = mesh.mass_functions();
    let op = || backend.operator(&apply).unwrap();
    let active = VectorOpt::Active;
    let lmode = TransposeMode::Transpose;

    let err = op().field("w", &mesh.r_u, lmode, &mesh.basis_u, active).unwrap_err();
    assert!(err.is_configuration());

    let err = op()
        .field("u", &mesh.r_u, lmode, &mesh.basis_u, active)
        .unwrap()
        .field("u", &mesh.r_u, lmode, &mesh.basis_u, active)
        .unwrap_err();
    assert!(err.is_usage());

    // Basis with the wrong number of components
    let two_comp = backend
        .basis_tensor_h1_lagrange(1, 2, 3, 4, QuadMode::Gauss)
        .unwrap();
    let err = op().field("u", &mesh.r_u, lmode, &two_comp, active).unwrap_err();
    assert!(err.is_configuration());

    // Restriction whose element size does not match the basis
    let coarse = backend.elem_restriction(2, 2, 1, 3, &[0, 1, 1, 2]).unwrap();
    let err = op().field("u", &coarse, lmode, &mesh.basis_u, active).unwrap_err();
    assert!(err.is_configuration());

    // Passive vector of the wrong length
    let short = backend.vector(3).unwrap();
    let err = op()
        .field("qdata", &mesh.r_q, lmode, BasisOpt::Collocated, VectorOpt::Some(&short))
        .unwrap_err();
    assert!(err.is_configuration());

    // Collocated fields need a collocated basis
    let err = op()
        .field("qdata", &mesh.r_q, lmode, &mesh.basis_u, VectorOpt::Some(&mesh.qdata))
        .unwrap_err();
    assert!(err.is_configuration());

    // Objects of another backend
    let other = BoxMesh::new("/cpu/self", 1, 2, 3, 4, 1.0, 1);
    let err = op().field("u", &other.r_u, lmode, &other.basis_u, active).unwrap_err();
    assert!(err.is_configuration());

    let blocked = backend
        .blocked_elem_restriction(2, 3, 2, 1, mesh.num_nodes, &box_mesh_offsets(1, 2, 3))
        .unwrap();
    let err = op().field("u", &blocked, lmode, &mesh.basis_u, active).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn weight_fields_take_no_restriction_or_vector() {
    let mesh = BoxMesh::new("/cpu/self", 1, 2, 3, 4, 1.0, 1);
    let (build, _) = mesh.mass_functions();
    let op = || mesh.backend.operator(&build).unwrap();
    let lmode = TransposeMode::NoTranspose;

    let err = op()
        .field("weights", &mesh.r_u, lmode, &mesh.basis_x, VectorOpt::None)
        .unwrap_err();
    assert!(err.is_configuration());
    let err = op()
        .field("weights", ElemRestrictionOpt::None, lmode, &mesh.basis_x, VectorOpt::Active)
        .unwrap_err();
    assert!(err.is_configuration());
    let err = op()
        .field("weights", ElemRestrictionOpt::None, lmode, BasisOpt::Collocated, VectorOpt::None)
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn incomplete_or_misapplied_operators_fail() {
    let mesh = BoxMesh::new("/cpu/self", 1, 2, 3, 4, 1.0, 1);
    let (_, apply) = mesh.mass_functions();
    let lmode = TransposeMode::Transpose;

    let partial = mesh
        .backend
        .operator(&apply)
        .unwrap()
        .field("u", &mesh.r_u, lmode, &mesh.basis_u, VectorOpt::Active)
        .unwrap();
    assert!(partial.finalize().unwrap_err().is_usage());

    let complete = mesh
        .backend
        .operator(&apply)
        .unwrap()
        .field("u", &mesh.r_u, lmode, &mesh.basis_u, VectorOpt::Active)
        .unwrap()
        .field("qdata", &mesh.r_q, TransposeMode::NoTranspose, BasisOpt::Collocated, VectorOpt::Some(&mesh.qdata))
        .unwrap()
        .field("v", &mesh.r_u, lmode, &mesh.basis_u, VectorOpt::Active)
        .unwrap();
    let u = mesh.backend.vector_from_slice(&[1.0; 3]).unwrap();
    let v = mesh.backend.vector(mesh.num_nodes).unwrap();
    assert!(complete.apply(&u, &v).unwrap_err().is_usage());

    complete.finalize().unwrap();
    let err = complete
        .field("v", &mesh.r_u, lmode, &mesh.basis_u, VectorOpt::Active)
        .unwrap_err();
    assert!(err.is_usage());
}

#[test]
fn diagonal_needs_single_shared_active_pair() {
    let backend = backend("/cpu/self");
    let r = backend.elem_restriction(2, 2, 1, 3, &[0, 1, 1, 2]).unwrap();
    let r_other = backend.elem_restriction(2, 2, 1, 3, &[0, 1, 1, 2]).unwrap();
    let qf = backend
        .q_function_identity(1, EvalMode::None, EvalMode::None)
        .unwrap();
    let op = backend
        .operator(&qf)
        .unwrap()
        .field("input", &r, TransposeMode::Transpose, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
        .field("output", &r_other, TransposeMode::Transpose, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap();
    let diag = backend.vector(3).unwrap();
    assert!(op.linear_assemble_diagonal(&diag).unwrap_err().is_usage());

    let op = backend
        .operator(&qf)
        .unwrap()
        .field("input", &r, TransposeMode::Transpose, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
        .field("output", &r, TransposeMode::Transpose, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap();
    op.linear_assemble_diagonal(&diag).unwrap();
    assert_eq!(diag.to_vec().unwrap(), vec![1.0, 2.0, 1.0]);
}
