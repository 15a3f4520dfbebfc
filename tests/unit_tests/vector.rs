use matfree::device::DeviceBuffer;
use matfree::vector::{ArraySource, SyncState};
use matfree::{MemType, NormType};

use super::{backend, RESOURCES};

#[test]
fn values_survive_host_device_round_trip() {
    let backend = backend("/gpu/sim/ref");
    let v = backend.vector_from_slice(&[1.0, -2.0, 3.0]).unwrap();
    assert_eq!(v.sync_state().unwrap(), SyncState::HostValid);

    v.sync(MemType::Device).unwrap();
    assert_eq!(v.sync_state().unwrap(), SyncState::BothValid);

    // Filling happens on the device and invalidates the host copy
    v.set_value(4.0).unwrap();
    assert_eq!(v.sync_state().unwrap(), SyncState::DeviceValid);
    assert_eq!(v.to_vec().unwrap(), vec![4.0, 4.0, 4.0]);
    assert_eq!(v.sync_state().unwrap(), SyncState::BothValid);

    {
        let mut view = v.view_mut().unwrap();
        view[1] = 7.0;
    }
    assert_eq!(v.sync_state().unwrap(), SyncState::HostValid);
    {
        let _device = v.device_view().unwrap();
    }
    assert_eq!(v.sync_state().unwrap(), SyncState::BothValid);
    assert_eq!(v.to_vec().unwrap(), vec![4.0, 7.0, 4.0]);
}

#[test]
fn borrowed_array_is_written_back_on_drop() {
    for resource in RESOURCES {
        let backend = backend(resource);
        let mut data = vec![1.0, 2.0, 3.0];
        {
            let mut v = backend.vector(3).unwrap();
            v.set_array(ArraySource::HostBorrowed(&mut data)).unwrap();
            if backend.device().is_some() {
                v.sync(MemType::Device).unwrap();
                v.set_value(5.0).unwrap();
            } else {
                v.scale(5.0).unwrap();
            }
        }
        let expected = if backend.device().is_some() {
            vec![5.0, 5.0, 5.0]
        } else {
            vec![5.0, 10.0, 15.0]
        };
        assert_eq!(data, expected, "{resource}");
    }
}

#[test]
fn take_array_returns_current_values() {
    let backend = backend("/gpu/sim/ref");
    let mut data = vec![0.0; 4];
    let mut v = backend.vector(4).unwrap();
    v.set_array(ArraySource::HostBorrowed(&mut data)).unwrap();
    v.sync(MemType::Device).unwrap();
    v.set_value(2.5).unwrap();

    let taken = v.take_array().unwrap();
    assert_eq!(taken, &[2.5; 4]);
    // The device copy is still current
    assert_eq!(v.to_vec().unwrap(), vec![2.5; 4]);
    v.destroy().unwrap();
}

#[test]
fn owned_device_array_is_used_directly() -> eyre::Result<()> {
    let backend = backend("/gpu/sim/ref");
    let device = backend.device().unwrap();
    let buffer = DeviceBuffer::from_scalars(device, &[3.0, 1.0])?;
    let source = ArraySource::DeviceOwned(buffer);
    assert_eq!(source.mem_type(), MemType::Device);
    assert_eq!(source.copy_mode(), matfree::CopyMode::OwnPointer);

    let mut v = backend.vector(2)?;
    v.set_array(source)?;
    assert_eq!(v.sync_state()?, SyncState::DeviceValid);
    assert_eq!(v.to_vec()?, vec![3.0, 1.0]);
    Ok(())
}

#[test]
fn conflicting_access_is_a_usage_error() {
    let backend = backend("/cpu/self");
    let v = backend.vector_from_slice(&[1.0, 2.0]).unwrap();
    {
        let _read = v.view().unwrap();
        let _another_read = v.view().unwrap();
        assert!(v.view_mut().unwrap_err().is_usage());
        assert!(v.set_value(0.0).unwrap_err().is_usage());
    }
    {
        let _write = v.view_mut().unwrap();
        assert!(v.view().unwrap_err().is_usage());
    }
    // Released accesses leave the vector usable
    assert_eq!(v.to_vec().unwrap(), vec![1.0, 2.0]);
}

#[test]
fn device_access_without_device_is_a_configuration_error() {
    let backend = backend("/cpu/self/ref/serial");
    let v = backend.vector_from_slice(&[1.0]).unwrap();
    assert!(v.device_view().unwrap_err().is_configuration());
    assert!(v.sync(MemType::Device).unwrap_err().is_configuration());
}

#[test]
fn reading_unwritten_vector_fails() {
    let backend = backend("/cpu/self");
    let v = backend.vector(3).unwrap();
    assert_eq!(v.sync_state().unwrap(), SyncState::Invalid);
    assert!(v.to_vec().unwrap_err().is_usage());
}

#[test]
fn array_of_wrong_length_is_rejected() {
    let backend = backend("/cpu/self");
    let mut v = backend.vector(3).unwrap();
    let err = v.set_array(ArraySource::HostCopy(&[1.0, 2.0])).unwrap_err();
    assert!(err.is_usage());
}

#[test]
fn norms_and_linear_combinations() {
    for resource in RESOURCES {
        let backend = backend(resource);
        let x = backend.vector_from_slice(&[3.0, -4.0, 0.0]).unwrap();
        assert_eq!(x.norm(NormType::One).unwrap(), 7.0);
        assert_eq!(x.norm(NormType::Two).unwrap(), 5.0);
        assert_eq!(x.norm(NormType::Max).unwrap(), 4.0);

        let y = backend.vector_from_slice(&[1.0, 1.0, 1.0]).unwrap();
        y.axpy(2.0, &x).unwrap();
        y.scale(0.5).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![3.5, -3.5, 0.5]);
        assert_eq!(format!("{y}"), "[3.5, -3.5, 0.5]");
    }
}
