//! Field buffers with host/device coherence.
//!
//! A [`Vector`] holds up to two copies of its data, one in host memory and one in device
//! memory, and tracks which of them is current with a [`SyncState`]. Accessing data in a
//! memory space first synchronizes that space if needed, and releasing a write access marks
//! the written space as the only valid one.
//!
//! Access follows the borrowing rules at runtime: any number of read accesses may be
//! outstanding at once, or a single write access. A conflicting request fails with a usage
//! error rather than blocking.
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::device::{Device, DeviceBuffer, DevicePtr};
use crate::error::ensure_usage;
use crate::{CopyMode, Error, MemType, NormType, Result, Scalar};

/// Which memory spaces hold current data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    HostValid,
    DeviceValid,
    BothValid,
    /// Neither space holds data, i.e. nothing has been written yet.
    Invalid,
}

impl SyncState {
    pub fn host_valid(&self) -> bool {
        matches!(self, Self::HostValid | Self::BothValid)
    }

    pub fn device_valid(&self) -> bool {
        matches!(self, Self::DeviceValid | Self::BothValid)
    }
}

/// An array handed to [`Vector::set_array`].
///
/// `'c` is the lifetime of arrays that are copied immediately, `'a` the lifetime of arrays
/// the vector keeps using.
pub enum ArraySource<'c, 'a> {
    HostCopy(&'c [Scalar]),
    HostOwned(Vec<Scalar>),
    HostBorrowed(&'a mut [Scalar]),
    DeviceCopy(DevicePtr),
    DeviceOwned(DeviceBuffer),
    DeviceBorrowed(DevicePtr),
}

impl ArraySource<'_, '_> {
    pub fn mem_type(&self) -> MemType {
        match self {
            Self::HostCopy(_) | Self::HostOwned(_) | Self::HostBorrowed(_) => MemType::Host,
            _ => MemType::Device,
        }
    }

    pub fn copy_mode(&self) -> CopyMode {
        match self {
            Self::HostCopy(_) | Self::DeviceCopy(_) => CopyMode::CopyValues,
            Self::HostOwned(_) | Self::DeviceOwned(_) => CopyMode::OwnPointer,
            Self::HostBorrowed(_) | Self::DeviceBorrowed(_) => CopyMode::UsePointer,
        }
    }
}

/// A host array borrowed from the caller.
///
/// The borrow's lifetime is tracked by the owning [`Vector`], which can only receive such an
/// array through `&mut self`.
struct BorrowedHost {
    ptr: NonNull<Scalar>,
    len: usize,
}

// SAFETY: BorrowedHost stands in for a `&'a mut [Scalar]`, which is Send and Sync
unsafe impl Send for BorrowedHost {}
unsafe impl Sync for BorrowedHost {}

impl BorrowedHost {
    fn new(slice: &mut [Scalar]) -> Self {
        Self {
            ptr: NonNull::from(&mut *slice).cast(),
            len: slice.len(),
        }
    }

    fn as_slice(&self) -> &[Scalar] {
        // SAFETY: the pointer comes from a live mutable borrow that outlives the vector
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [Scalar] {
        // SAFETY: as above, and access is exclusive through &mut self
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Debug for BorrowedHost {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowedHost")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[derive(Debug)]
enum HostArray {
    Unallocated,
    Owned(Vec<Scalar>),
    Borrowed(BorrowedHost),
}

impl HostArray {
    fn ensure_allocated(&mut self, length: usize) {
        if let Self::Unallocated = self {
            *self = Self::Owned(vec![0.0; length]);
        }
    }

    fn as_slice(&self) -> &[Scalar] {
        match self {
            Self::Unallocated => &[],
            Self::Owned(data) => data,
            Self::Borrowed(borrowed) => borrowed.as_slice(),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [Scalar] {
        match self {
            Self::Unallocated => &mut [],
            Self::Owned(data) => data,
            Self::Borrowed(borrowed) => borrowed.as_mut_slice(),
        }
    }
}

#[derive(Debug)]
enum DeviceArray {
    Unallocated,
    Owned(DeviceBuffer),
    Borrowed(DevicePtr),
}

impl DeviceArray {
    fn ptr(&self) -> Option<DevicePtr> {
        match self {
            Self::Unallocated => None,
            Self::Owned(buffer) => Some(buffer.ptr()),
            Self::Borrowed(ptr) => Some(*ptr),
        }
    }
}

#[derive(Debug)]
struct Storage {
    host: HostArray,
    device: DeviceArray,
    state: SyncState,
}

impl Storage {
    fn ensure_device(&mut self, length: usize, device: &Arc<dyn Device>) -> Result<DevicePtr> {
        if let Some(ptr) = self.device.ptr() {
            return Ok(ptr);
        }
        let buffer = DeviceBuffer::allocate(device, length * std::mem::size_of::<Scalar>())?;
        let ptr = buffer.ptr();
        self.device = DeviceArray::Owned(buffer);
        Ok(ptr)
    }

    fn sync_to_host(&mut self, length: usize, device: Option<&Arc<dyn Device>>) -> Result<()> {
        match self.state {
            SyncState::HostValid | SyncState::BothValid => Ok(()),
            SyncState::Invalid => Err(Error::usage("cannot read a vector that holds no data")),
            SyncState::DeviceValid => {
                let (device, src) = device.zip(self.device.ptr()).ok_or_else(|| {
                    Error::usage("vector is marked device-valid but has no device array")
                })?;
                self.host.ensure_allocated(length);
                device.copy_from_device(bytemuck::cast_slice_mut(self.host.as_mut_slice()), src)?;
                self.state = SyncState::BothValid;
                Ok(())
            }
        }
    }

    fn sync_to_device(&mut self, length: usize, device: &Arc<dyn Device>) -> Result<()> {
        match self.state {
            SyncState::DeviceValid | SyncState::BothValid => Ok(()),
            SyncState::Invalid => Err(Error::usage("cannot read a vector that holds no data")),
            SyncState::HostValid => {
                let dst = self.ensure_device(length, device)?;
                device.copy_to_device(dst, bytemuck::cast_slice(self.host.as_slice()))?;
                self.state = SyncState::BothValid;
                Ok(())
            }
        }
    }

    /// Makes sure a borrowed host array holds the current values.
    fn write_back(&mut self, length: usize, device: Option<&Arc<dyn Device>>) -> Result<()> {
        if matches!(self.host, HostArray::Borrowed(_)) && self.state == SyncState::DeviceValid {
            self.sync_to_host(length, device)?;
        }
        Ok(())
    }
}

/// A field buffer of fixed length.
///
/// The lifetime `'a` bounds host arrays borrowed from the caller with
/// [`ArraySource::HostBorrowed`]. Vectors that own their data can have any lifetime.
#[derive(Debug)]
pub struct Vector<'a> {
    length: usize,
    device: Option<Arc<dyn Device>>,
    storage: RwLock<Storage>,
    _borrowed: PhantomData<&'a mut [Scalar]>,
}

/// Read access to the host array of a vector.
#[derive(Debug)]
pub struct VectorView<'v> {
    guard: RwLockReadGuard<'v, Storage>,
}

/// Write access to the host array of a vector. Dropping it marks the host array as the only
/// valid copy.
#[derive(Debug)]
pub struct VectorViewMut<'v> {
    guard: RwLockWriteGuard<'v, Storage>,
}

/// Read access to the device array of a vector.
#[derive(Debug)]
pub struct DeviceView<'v> {
    _guard: RwLockReadGuard<'v, Storage>,
    ptr: DevicePtr,
}

/// Write access to the device array of a vector. Dropping it marks the device array as the
/// only valid copy.
#[derive(Debug)]
pub struct DeviceViewMut<'v> {
    guard: RwLockWriteGuard<'v, Storage>,
    ptr: DevicePtr,
}

impl<'a> Vector<'a> {
    pub(crate) fn create(length: usize, device: Option<Arc<dyn Device>>) -> Self {
        Self {
            length,
            device,
            storage: RwLock::new(Storage {
                host: HostArray::Unallocated,
                device: DeviceArray::Unallocated,
                state: SyncState::Invalid,
            }),
            _borrowed: PhantomData,
        }
    }

    pub(crate) fn from_slice(values: &[Scalar], device: Option<Arc<dyn Device>>) -> Self {
        let vector = Self::create(values.len(), device);
        {
            let mut storage = vector.storage.write();
            storage.host = HostArray::Owned(values.to_vec());
            storage.state = SyncState::HostValid;
        }
        vector
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn device(&self) -> Option<&Arc<dyn Device>> {
        self.device.as_ref()
    }

    fn conflict(&self, requested: &str) -> Error {
        Error::usage(format!(
            "cannot obtain {requested} access to vector of length {}: conflicting access is outstanding",
            self.length
        ))
    }

    fn require_device(&self) -> Result<&Arc<dyn Device>> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::configuration("device memory was requested from a backend without a device"))
    }

    pub fn sync_state(&self) -> Result<SyncState> {
        let storage = self.storage.try_read().ok_or_else(|| self.conflict("read"))?;
        Ok(storage.state)
    }

    /// Hands an array to the vector.
    ///
    /// The array must have exactly [`length`](Self::length) entries. Device arrays require a
    /// backend with a device.
    pub fn set_array(&mut self, source: ArraySource<'_, 'a>) -> Result<()> {
        let length = self.length;
        let storage = self.storage.get_mut();
        let check_len = |len: usize| -> Result<()> {
            ensure_usage!(
                len == length,
                "array of length {} does not match vector of length {}",
                len,
                length
            );
            Ok(())
        };

        match source {
            ArraySource::HostCopy(values) => {
                check_len(values.len())?;
                storage.host.ensure_allocated(length);
                storage.host.as_mut_slice().copy_from_slice(values);
                storage.state = SyncState::HostValid;
            }
            ArraySource::HostOwned(values) => {
                check_len(values.len())?;
                storage.host = HostArray::Owned(values);
                storage.state = SyncState::HostValid;
            }
            ArraySource::HostBorrowed(values) => {
                check_len(values.len())?;
                storage.host = HostArray::Borrowed(BorrowedHost::new(values));
                storage.state = SyncState::HostValid;
            }
            ArraySource::DeviceCopy(src) => {
                let device = self
                    .device
                    .as_ref()
                    .ok_or_else(|| Error::configuration("device arrays require a backend with a device"))?;
                let dst = storage.ensure_device(length, device)?;
                device.copy_within_device(dst, src, length * std::mem::size_of::<Scalar>())?;
                storage.state = SyncState::DeviceValid;
            }
            ArraySource::DeviceOwned(buffer) => {
                ensure_usage!(
                    self.device.is_some(),
                    "device arrays require a backend with a device"
                );
                check_len(buffer.len_scalars())?;
                storage.device = DeviceArray::Owned(buffer);
                storage.state = SyncState::DeviceValid;
            }
            ArraySource::DeviceBorrowed(ptr) => {
                ensure_usage!(
                    self.device.is_some(),
                    "device arrays require a backend with a device"
                );
                storage.device = DeviceArray::Borrowed(ptr);
                storage.state = SyncState::DeviceValid;
            }
        }
        Ok(())
    }

    /// Detaches a borrowed host array from the vector and returns it, holding current values.
    pub fn take_array(&self) -> Result<&'a mut [Scalar]> {
        let mut storage = self.storage.try_write().ok_or_else(|| self.conflict("write"))?;
        ensure_usage!(
            matches!(storage.host, HostArray::Borrowed(_)),
            "only arrays borrowed from the caller can be taken back"
        );
        storage.write_back(self.length, self.device.as_ref())?;
        let HostArray::Borrowed(borrowed) = std::mem::replace(&mut storage.host, HostArray::Unallocated) else {
            unreachable!("checked above");
        };
        storage.state = match storage.state {
            SyncState::BothValid | SyncState::DeviceValid => SyncState::DeviceValid,
            SyncState::HostValid | SyncState::Invalid => SyncState::Invalid,
        };
        // SAFETY: the array was borrowed for 'a and the vector no longer refers to it
        Ok(unsafe { std::slice::from_raw_parts_mut(borrowed.ptr.as_ptr(), borrowed.len) })
    }

    /// Read access to the host array, synchronizing it first if necessary.
    pub fn view(&self) -> Result<VectorView<'_>> {
        let guard = self.storage.try_read().ok_or_else(|| self.conflict("read"))?;
        if guard.state.host_valid() {
            return Ok(VectorView { guard });
        }
        drop(guard);

        // Synchronizing needs exclusive access, so no other read access may be outstanding
        let mut guard = self.storage.try_write().ok_or_else(|| self.conflict("read"))?;
        guard.sync_to_host(self.length, self.device.as_ref())?;
        Ok(VectorView {
            guard: RwLockWriteGuard::downgrade(guard),
        })
    }

    /// Write access to the host array.
    ///
    /// Current values are synchronized to the host first. A vector without data is
    /// zero-initialized.
    pub fn view_mut(&self) -> Result<VectorViewMut<'_>> {
        let mut guard = self.storage.try_write().ok_or_else(|| self.conflict("write"))?;
        match guard.state {
            SyncState::DeviceValid => guard.sync_to_host(self.length, self.device.as_ref())?,
            SyncState::Invalid => guard.host.ensure_allocated(self.length),
            SyncState::HostValid | SyncState::BothValid => {}
        }
        Ok(VectorViewMut { guard })
    }

    /// Read access to the device array, synchronizing it first if necessary.
    pub fn device_view(&self) -> Result<DeviceView<'_>> {
        let device = self.require_device()?;
        let guard = self.storage.try_read().ok_or_else(|| self.conflict("read"))?;
        if guard.state.device_valid() {
            if let Some(ptr) = guard.device.ptr() {
                return Ok(DeviceView { _guard: guard, ptr });
            }
        }
        drop(guard);

        let mut guard = self.storage.try_write().ok_or_else(|| self.conflict("read"))?;
        guard.sync_to_device(self.length, device)?;
        let ptr = guard.ensure_device(self.length, device)?;
        Ok(DeviceView {
            _guard: RwLockWriteGuard::downgrade(guard),
            ptr,
        })
    }

    /// Write access to the device array.
    pub fn device_view_mut(&self) -> Result<DeviceViewMut<'_>> {
        let device = self.require_device()?;
        let mut guard = self.storage.try_write().ok_or_else(|| self.conflict("write"))?;
        if guard.state == SyncState::HostValid {
            guard.sync_to_device(self.length, device)?;
        }
        let ptr = guard.ensure_device(self.length, device)?;
        Ok(DeviceViewMut { guard, ptr })
    }

    /// Makes the given memory space hold current values.
    pub fn sync(&self, mem_type: MemType) -> Result<()> {
        let mut guard = self.storage.try_write().ok_or_else(|| self.conflict("write"))?;
        match mem_type {
            MemType::Host => guard.sync_to_host(self.length, self.device.as_ref()),
            MemType::Device => guard.sync_to_device(self.length, self.require_device()?),
        }
    }

    /// Sets every entry to `value`.
    ///
    /// The fill happens in device memory if the vector has a device array, and in host memory
    /// otherwise. The other space is invalidated.
    pub fn set_value(&self, value: Scalar) -> Result<()> {
        let mut guard = self.storage.try_write().ok_or_else(|| self.conflict("write"))?;
        match (self.device.as_ref(), guard.device.ptr()) {
            (Some(device), Some(ptr)) => {
                device.fill(ptr, value, self.length)?;
                guard.state = SyncState::DeviceValid;
            }
            _ => {
                guard.host.ensure_allocated(self.length);
                guard.host.as_mut_slice().fill(value);
                guard.state = SyncState::HostValid;
            }
        }
        Ok(())
    }

    /// Copy of the current values.
    pub fn to_vec(&self) -> Result<Vec<Scalar>> {
        Ok(self.view()?.to_vec())
    }

    pub fn norm(&self, norm_type: NormType) -> Result<Scalar> {
        let values = self.view()?;
        let norm = match norm_type {
            NormType::One => values.iter().map(|x| x.abs()).sum(),
            NormType::Two => values.iter().map(|x| x * x).sum::<Scalar>().sqrt(),
            NormType::Max => values.iter().fold(0.0, |max: Scalar, x| max.max(x.abs())),
        };
        Ok(norm)
    }

    pub fn scale(&self, alpha: Scalar) -> Result<()> {
        let mut values = self.view_mut()?;
        values.iter_mut().for_each(|x| *x *= alpha);
        Ok(())
    }

    /// Computes `self = alpha * x + self`.
    pub fn axpy(&self, alpha: Scalar, x: &Vector<'_>) -> Result<()> {
        ensure_usage!(
            x.length == self.length,
            "axpy of vectors with lengths {} and {}",
            x.length,
            self.length
        );
        let x = x.view()?;
        let mut y = self.view_mut()?;
        y.iter_mut().zip(x.iter()).for_each(|(y, x)| *y += alpha * x);
        Ok(())
    }

    /// Releases the vector, reporting a failure to write current values back into a borrowed
    /// host array.
    ///
    /// Dropping a vector does the same but can only log the failure.
    pub fn destroy(mut self) -> Result<()> {
        let length = self.length;
        self.storage.get_mut().write_back(length, self.device.as_ref())
    }
}

impl Drop for Vector<'_> {
    fn drop(&mut self) {
        let length = self.length;
        if let Err(err) = self.storage.get_mut().write_back(length, self.device.as_ref()) {
            log::warn!("Failed to write vector back into its borrowed array: {}", err);
        }
    }
}

impl Display for Vector<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.view() {
            Ok(values) => {
                write!(f, "[")?;
                for (i, x) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, "]")
            }
            Err(err) => write!(f, "<vector of length {}: {}>", self.length, err),
        }
    }
}

impl Deref for VectorView<'_> {
    type Target = [Scalar];

    fn deref(&self) -> &[Scalar] {
        self.guard.host.as_slice()
    }
}

impl Deref for VectorViewMut<'_> {
    type Target = [Scalar];

    fn deref(&self) -> &[Scalar] {
        self.guard.host.as_slice()
    }
}

impl DerefMut for VectorViewMut<'_> {
    fn deref_mut(&mut self) -> &mut [Scalar] {
        self.guard.host.as_mut_slice()
    }
}

impl Drop for VectorViewMut<'_> {
    fn drop(&mut self) {
        self.guard.state = SyncState::HostValid;
    }
}

impl DeviceView<'_> {
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }
}

impl DeviceViewMut<'_> {
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }
}

impl Drop for DeviceViewMut<'_> {
    fn drop(&mut self) {
        self.guard.state = SyncState::DeviceValid;
    }
}
