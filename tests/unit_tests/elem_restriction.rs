use matfree::proptest::offset_restriction_with_data;
use matfree::TransposeMode::{NoTranspose, Transpose};
use proptest::prelude::*;

use super::{backend, dot};

const HOST_AND_DEVICE: [&str; 2] = ["/cpu/self", "/gpu/sim/ref"];

#[test]
fn restriction_duplicates_shared_nodes() {
    for resource in HOST_AND_DEVICE {
        let backend = backend(resource);
        // Two elements of two nodes with two components, node 1 is shared
        let r = backend.elem_restriction(2, 2, 2, 6, &[0, 1, 1, 2]).unwrap();
        let u = backend
            .vector_from_slice(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
            .unwrap();
        let e = r.create_evector().unwrap();

        r.apply(NoTranspose, Transpose, &u, &e).unwrap();
        assert_eq!(e.to_vec().unwrap(), vec![0.0, 2.0, 2.0, 4.0, 1.0, 3.0, 3.0, 5.0], "{resource}");

        r.apply(NoTranspose, NoTranspose, &u, &e).unwrap();
        assert_eq!(e.to_vec().unwrap(), vec![0.0, 1.0, 1.0, 2.0, 3.0, 4.0, 4.0, 5.0], "{resource}");
    }
}

#[test]
fn transpose_adds_element_contributions() {
    for resource in HOST_AND_DEVICE {
        let backend = backend(resource);
        let r = backend.elem_restriction(2, 2, 1, 3, &[0, 1, 1, 2]).unwrap();
        let e = backend.vector_from_slice(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let l = backend.vector_from_slice(&[10.0, 10.0, 10.0]).unwrap();
        r.apply(Transpose, Transpose, &e, &l).unwrap();
        assert_eq!(l.to_vec().unwrap(), vec![11.0, 15.0, 14.0], "{resource}");
    }
}

#[test]
fn multiplicity_counts_elements_per_node() {
    for resource in HOST_AND_DEVICE {
        let backend = backend(resource);
        let r = backend.elem_restriction(2, 2, 2, 6, &[0, 1, 1, 2]).unwrap();
        let mult = r.create_lvector().unwrap();
        r.multiplicity(Transpose, &mult).unwrap();
        assert_eq!(mult.to_vec().unwrap(), vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0], "{resource}");
    }
}

#[test]
fn identity_restriction_copies_lvector() {
    for resource in HOST_AND_DEVICE {
        let backend = backend(resource);
        let r = backend.identity_elem_restriction(2, 3, 2, 12).unwrap();
        let values: Vec<f64> = (0..12).map(f64::from).collect();
        let u = backend.vector_from_slice(&values).unwrap();
        let e = r.create_evector().unwrap();
        r.apply(NoTranspose, NoTranspose, &u, &e).unwrap();
        assert_eq!(e.to_vec().unwrap(), values, "{resource}");
        assert_eq!(r.e_layout().unwrap(), [1, 6, 3]);

        let l = backend.vector_from_slice(&[0.0; 12]).unwrap();
        r.apply(Transpose, NoTranspose, &e, &l).unwrap();
        assert_eq!(l.to_vec().unwrap(), values, "{resource}");
    }
}

#[test]
fn strided_restriction_follows_strides() {
    for resource in HOST_AND_DEVICE {
        let backend = backend(resource);
        // Two nodes per element, elements stored back to back
        let strides = [1, 2, 2];
        let r = backend.strided_elem_restriction(3, 2, 1, 6, strides).unwrap();
        let a: Vec<f64> = (10..16).map(f64::from).collect();
        let u = backend.vector_from_slice(&a).unwrap();
        let y = r.create_evector().unwrap();
        r.apply(NoTranspose, NoTranspose, &u, &y).unwrap();
        let y = y.to_vec().unwrap();

        // Single component, so the component stride never contributes
        let [l0, _, l2] = r.e_layout().unwrap();
        for i in 0..2 {
            for k in 0..3 {
                assert_eq!(y[i * l0 + k * l2], a[i * strides[0] + k * strides[2]], "{resource}");
            }
        }
    }
}

#[test]
fn blocked_restriction_pads_last_block() {
    let backend = backend("/cpu/self");
    let r = backend
        .blocked_elem_restriction(3, 2, 2, 1, 4, &[0, 1, 1, 2, 2, 3])
        .unwrap();
    assert_eq!(r.num_blocks(), 2);
    assert_eq!(r.e_size(), 8);
    assert!(r.e_layout().unwrap_err().is_usage());

    let u = backend.vector_from_slice(&[10.0, 11.0, 12.0, 13.0]).unwrap();
    let e = r.create_evector().unwrap();
    r.apply(NoTranspose, Transpose, &u, &e).unwrap();
    assert_eq!(e.to_vec().unwrap(), vec![10.0, 11.0, 11.0, 12.0, 12.0, 0.0, 13.0, 0.0]);

    let block = backend.vector(4).unwrap();
    r.apply_block(1, NoTranspose, Transpose, &u, &block).unwrap();
    assert_eq!(block.to_vec().unwrap(), vec![12.0, 0.0, 13.0, 0.0]);

    let l = backend.vector_from_slice(&[0.0; 4]).unwrap();
    r.apply_block(1, Transpose, Transpose, &block, &l).unwrap();
    assert_eq!(l.to_vec().unwrap(), vec![0.0, 0.0, 12.0, 13.0]);

    assert!(r.apply_block(2, NoTranspose, Transpose, &u, &block).unwrap_err().is_usage());

    // Padding entries never reach the L-vector
    let mult = r.create_lvector().unwrap();
    r.multiplicity(Transpose, &mult).unwrap();
    assert_eq!(mult.to_vec().unwrap(), vec![1.0, 2.0, 2.0, 1.0]);
}

#[test]
fn invalid_restrictions_are_rejected() {
    let backend = backend("/cpu/self");
    assert!(backend
        .elem_restriction(2, 2, 1, 3, &[0, 1, 1])
        .unwrap_err()
        .is_configuration());
    assert!(backend
        .elem_restriction(2, 2, 1, 3, &[0, 1, 1, 3])
        .unwrap_err()
        .is_configuration());
    assert!(backend
        .elem_restriction(1, 2, 2, 5, &[0, 1])
        .unwrap_err()
        .is_configuration());
    assert!(backend
        .strided_elem_restriction(2, 3, 1, 5, [1, 3, 3])
        .unwrap_err()
        .is_configuration());
    assert!(backend
        .elem_restriction(1, 0, 1, 1, &[])
        .unwrap_err()
        .is_configuration());
}

#[test]
fn vectors_of_wrong_length_are_rejected() {
    let backend = backend("/cpu/self");
    let r = backend.elem_restriction(2, 2, 1, 3, &[0, 1, 1, 2]).unwrap();
    let l = backend.vector_from_slice(&[1.0; 3]).unwrap();
    let short = backend.vector(3).unwrap();
    assert!(r.apply(NoTranspose, Transpose, &l, &short).unwrap_err().is_usage());
    assert!(r.apply(Transpose, Transpose, &l, &short).unwrap_err().is_usage());
}

proptest! {
    #[test]
    fn transpose_is_adjoint_of_restriction((params, l_values, e_values) in offset_restriction_with_data()) {
        for resource in HOST_AND_DEVICE {
            let backend = backend(resource);
            let r = backend
                .elem_restriction(params.num_elem, params.elem_size, params.num_comp, params.l_size(), &params.offsets)
                .unwrap();
            let u = backend.vector_from_slice(&l_values).unwrap();
            let ru = r.create_evector().unwrap();
            r.apply(NoTranspose, params.lmode, &u, &ru).unwrap();

            let v = backend.vector_from_slice(&e_values).unwrap();
            let rtv = backend.vector_from_slice(&vec![0.0; params.l_size()]).unwrap();
            r.apply(Transpose, params.lmode, &v, &rtv).unwrap();

            let lhs = dot(&ru.to_vec().unwrap(), &e_values);
            let rhs = dot(&l_values, &rtv.to_vec().unwrap());
            prop_assert!((lhs - rhs).abs() <= 1e-10 * (1.0 + lhs.abs()), "{}: {} != {}", resource, lhs, rhs);
        }
    }
}
