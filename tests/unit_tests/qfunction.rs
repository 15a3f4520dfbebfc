use matfree::qfunction::QFunction;
use matfree::{Backend, EvalMode, MemType, Scalar, MAX_QFUNCTION_FIELDS};

use super::{backend, RESOURCES};

const AXPY_SOURCE: &str = "tests/kernels/axpy.c:Axpy";

fn axpy(backend: &Backend) -> QFunction {
    backend
        .q_function_interior(
            1,
            |ctx, q, inputs, outputs| {
                let alpha: Scalar = match bytemuck::try_pod_read_unaligned(ctx) {
                    Ok(alpha) => alpha,
                    Err(_) => return -1,
                };
                for i in 0..2 * q {
                    outputs[0][i] = alpha * inputs[0][i] + inputs[1][i];
                }
                0
            },
            AXPY_SOURCE,
        )
        .unwrap()
        .input("u", 2, EvalMode::Interp)
        .unwrap()
        .input("w", 2, EvalMode::Interp)
        .unwrap()
        .output("v", 2, EvalMode::Interp)
        .unwrap()
}

#[test]
fn kernel_sees_fields_and_context() {
    for resource in RESOURCES {
        let backend = backend(resource);
        let qf = axpy(&backend);
        assert_eq!(qf.entry_point(), "Axpy");
        assert_eq!(qf.inputs()[1].name(), "w");
        assert_eq!(qf.outputs()[0].size(), 2);

        let q = 6;
        let u: Vec<f64> = (0..2 * q).map(|i| i as f64).collect();
        let u = backend.vector_from_slice(&u).unwrap();
        let w = backend.vector_from_slice(&vec![1.0; 2 * q]).unwrap();
        let v = backend.vector(2 * q).unwrap();

        qf.set_context(&2.0f64);
        qf.apply(q, &[&u, &w], &[&v]).unwrap();
        let expected: Vec<f64> = (0..2 * q).map(|i| 2.0 * i as f64 + 1.0).collect();
        assert_eq!(v.to_vec().unwrap(), expected, "{resource}");

        // A new context is picked up by the next application
        qf.set_context(&-1.0f64);
        assert_eq!(qf.context::<f64>().unwrap(), -1.0);
        qf.apply(q, &[&u, &w], &[&v]).unwrap();
        let expected: Vec<f64> = (0..2 * q).map(|i| 1.0 - i as f64).collect();
        assert_eq!(v.to_vec().unwrap(), expected, "{resource}");
    }
}

#[test]
fn context_of_wrong_size_cannot_be_read() {
    let backend = backend("/cpu/self");
    let qf = axpy(&backend);
    qf.set_context(&3u32);
    assert!(qf.context::<f64>().unwrap_err().is_usage());
    assert_eq!(qf.context::<u32>().unwrap(), 3);
}

#[test]
fn failing_kernel_reports_backend_error() {
    for resource in RESOURCES {
        let backend = backend(resource);
        let qf = backend
            .q_function_interior(1, |_, _, _, _| 1, "tests/kernels/axpy.c:Fail")
            .unwrap()
            .input("u", 1, EvalMode::Interp)
            .unwrap()
            .output("v", 1, EvalMode::Interp)
            .unwrap();
        let u = backend.vector_from_slice(&[1.0, 2.0]).unwrap();
        let v = backend.vector(2).unwrap();
        // Device failures may only surface once the result is synchronized
        let err = qf
            .apply(2, &[&u], &[&v])
            .and_then(|_| v.sync(MemType::Host))
            .unwrap_err();
        assert!(err.is_backend(), "{resource}: {err}");
    }
}

#[test]
fn failing_kernel_leaves_other_vectors_intact() {
    let backend = backend("/gpu/sim/ref");
    let qf = backend
        .q_function_interior(1, |_, _, _, _| 1, "tests/kernels/axpy.c:Fail")
        .unwrap()
        .input("u", 1, EvalMode::Interp)
        .unwrap()
        .output("v", 1, EvalMode::Interp)
        .unwrap();
    let u = backend.vector_from_slice(&[1.0, 2.0]).unwrap();
    let v = backend.vector(2).unwrap();
    let x = backend.vector_from_slice(&[1.0, 2.0, 3.0]).unwrap();

    let applied = qf.apply(2, &[&u], &[&v]);
    // Queued behind the failing launch
    x.sync(MemType::Device).unwrap();
    let err = applied.and_then(|_| v.sync(MemType::Host)).unwrap_err();
    assert!(err.is_backend(), "{err}");

    // Makes the device copy the only valid one
    drop(x.device_view_mut().unwrap());
    assert_eq!(x.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn field_limit_is_enforced() {
    let backend = backend("/cpu/self");
    let mut qf = axpy(&backend);
    for i in 2..MAX_QFUNCTION_FIELDS {
        qf = qf.input(&format!("in{i}"), 1, EvalMode::None).unwrap();
    }
    assert_eq!(qf.inputs().len(), MAX_QFUNCTION_FIELDS);
    assert!(qf.input("one_too_many", 1, EvalMode::None).unwrap_err().is_configuration());

    let mut qf = axpy(&backend);
    for i in 1..MAX_QFUNCTION_FIELDS {
        qf = qf.output(&format!("out{i}"), 1, EvalMode::None).unwrap();
    }
    assert!(qf.output("one_too_many", 1, EvalMode::None).unwrap_err().is_configuration());
}

#[test]
fn invalid_fields_are_rejected() {
    let backend = backend("/cpu/self");
    let duplicate = axpy(&backend).output("u", 1, EvalMode::Interp).unwrap_err();
    assert!(duplicate.is_configuration());
    let wide_weights = axpy(&backend).input("weights", 2, EvalMode::Weight).unwrap_err();
    assert!(wide_weights.is_configuration());
    let weight_output = axpy(&backend).output("weights", 1, EvalMode::Weight).unwrap_err();
    assert!(weight_output.is_configuration());
    let empty = axpy(&backend).input("empty", 0, EvalMode::None).unwrap_err();
    assert!(empty.is_configuration());
    let no_lanes = backend.q_function_interior(0, |_, _, _, _| 0, AXPY_SOURCE).unwrap_err();
    assert!(no_lanes.is_configuration());
}

#[test]
fn invalid_applications_are_rejected() {
    let backend = backend("/cpu/self");
    let qf = axpy(&backend);
    let u = backend.vector_from_slice(&[0.0; 8]).unwrap();
    let v = backend.vector(8).unwrap();
    let short = backend.vector(6).unwrap();

    assert!(qf.apply(4, &[&u], &[&v]).unwrap_err().is_usage());
    assert!(qf.apply(4, &[&u, &u], &[&short]).unwrap_err().is_usage());

    let wide = backend
        .q_function_interior(4, |_, _, _, _| 0, AXPY_SOURCE)
        .unwrap()
        .input("u", 2, EvalMode::Interp)
        .unwrap();
    let empty: [&matfree::vector::Vector; 0] = [];
    assert!(wide.apply(3, &[&short], &empty).unwrap_err().is_usage());
}

#[test]
fn device_backends_need_companion_source() {
    let missing = "tests/kernels/missing.c:Missing";
    let cpu = backend("/cpu/self");
    assert!(cpu.q_function_interior(1, |_, _, _, _| 0, missing).is_ok());

    let sim = backend("/gpu/sim/ref");
    let err = sim.q_function_interior(1, |_, _, _, _| 0, missing).unwrap_err();
    assert!(err.is_configuration());
    let err = sim.q_function_interior(1, |_, _, _, _| 0, "no-entry-point").unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn entry_point_must_be_defined_in_companion_source() {
    let backend = backend("/gpu/sim/ref");
    let qf = backend
        .q_function_interior(1, |_, _, _, _| 0, "tests/kernels/axpy.c:Undefined")
        .unwrap()
        .input("u", 1, EvalMode::Interp)
        .unwrap()
        .output("v", 1, EvalMode::Interp)
        .unwrap();
    let u = backend.vector_from_slice(&[1.0]).unwrap();
    let v = backend.vector(1).unwrap();
    assert!(qf.apply(1, &[&u], &[&v]).unwrap_err().is_backend());
}

#[test]
fn device_block_size_must_be_multiple_of_vector_length() {
    let backend = backend("/gpu/sim/ref:block_size=6");
    let qf = backend
        .q_function_interior(4, |_, _, _, _| 0, AXPY_SOURCE)
        .unwrap()
        .input("u", 1, EvalMode::Interp)
        .unwrap();
    let u = backend.vector_from_slice(&[0.0; 4]).unwrap();
    let empty: [&matfree::vector::Vector; 0] = [];
    assert!(qf.apply(4, &[&u], &empty).unwrap_err().is_configuration());
}

#[test]
fn gallery_functions_by_name() {
    for resource in RESOURCES {
        let backend = backend(resource);
        let scale = backend.q_function_by_name("Scale").unwrap();
        scale.set_context(&3.0f64);
        let u = backend.vector_from_slice(&[1.0, -2.0]).unwrap();
        let v = backend.vector(2).unwrap();
        scale.apply(2, &[&u], &[&v]).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![3.0, -6.0], "{resource}");

        let identity = backend
            .q_function_identity(2, EvalMode::None, EvalMode::None)
            .unwrap();
        let v = backend.vector(4).unwrap();
        let u = backend.vector_from_slice(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        identity.apply(2, &[&u], &[&v]).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0], "{resource}");

        let mass = backend.q_function_by_name("Mass2DBuild").unwrap();
        let names: Vec<_> = mass.inputs().iter().map(|field| field.name()).collect();
        assert_eq!(names, ["dx", "weights"]);
        assert_eq!(mass.outputs()[0].size(), 1);

        let poisson = backend.q_function_by_name("Poisson3DApply").unwrap();
        assert_eq!(poisson.inputs()[1].size(), 6);
        assert_eq!(poisson.inputs()[0].eval_mode(), EvalMode::Grad);

        assert!(backend.q_function_by_name("Unknown").unwrap_err().is_configuration());
    }
}

#[test]
fn mass_build_computes_weighted_jacobian_determinant() {
    let backend = backend("/cpu/self");
    let qf = backend.q_function_by_name("Mass2DBuild").unwrap();
    // Jacobian [[2, 1], [0, 3]] at both points, entry (c, d) at component d * 2 + c
    let dx = backend
        .vector_from_slice(&[2.0, 2.0, 0.0, 0.0, 1.0, 1.0, 3.0, 3.0])
        .unwrap();
    let weights = backend.vector_from_slice(&[0.5, 1.0]).unwrap();
    let qdata = backend.vector(2).unwrap();
    qf.apply(2, &[&dx, &weights], &[&qdata]).unwrap();
    assert_eq!(qdata.to_vec().unwrap(), vec![3.0, 6.0]);
}
