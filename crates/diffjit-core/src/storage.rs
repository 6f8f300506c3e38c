//! Storage - Raw Memory Management for Tensors
//!
//! Storage is the reference-counted `f32` buffer underneath every tensor.
//! Views share it; deep copies don't. Weak handles let callers check whether a
//! buffer is still referenced anywhere, which the freeze step relies on to
//! prove it dropped its hold on module parameters.
//!
//! # Example
//! ```rust
//! use diffjit_core::{Storage, Device};
//!
//! let storage = Storage::zeros(100, Device::Cpu);
//! assert_eq!(storage.len(), 100);
//! let weak = storage.downgrade();
//! drop(storage);
//! assert!(!weak.is_alive());
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::device::Device;
use crate::error::{Error, Result};

// =============================================================================
// Storage Struct
// =============================================================================

/// Raw memory storage for tensor data.
#[derive(Debug, Clone)]
pub struct Storage {
    /// The underlying data buffer.
    inner: Arc<RwLock<Vec<f32>>>,
    /// The device this storage resides on.
    device: Device,
}

impl Storage {
    /// Creates new storage of `len` zeros.
    #[must_use]
    pub fn zeros(len: usize, device: Device) -> Self {
        Self::from_vec(vec![0.0; len], device)
    }

    /// Creates storage from an existing vector.
    #[must_use]
    pub fn from_vec(data: Vec<f32>, device: Device) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
            device,
        }
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns true if the storage is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the device this storage is on.
    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Returns a read guard over the data.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.inner.read()
    }

    /// Returns a write guard over the data.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.inner.write()
    }

    /// Overwrites the contents from a slice of the same length.
    pub fn copy_from_slice(&self, src: &[f32]) -> Result<()> {
        let mut dst = self.inner.write();
        if dst.len() != src.len() {
            return Err(Error::shape_mismatch(&[dst.len()], &[src.len()]));
        }
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Makes a deep copy of this storage.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        Self::from_vec(self.inner.read().clone(), self.device)
    }

    /// Returns a copy of this storage tagged with a different device.
    #[must_use]
    pub fn to_device(&self, device: Device) -> Self {
        if device == self.device {
            return self.clone();
        }
        Self::from_vec(self.inner.read().clone(), device)
    }

    /// Returns true if both handles point at the same buffer.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the number of strong handles to the buffer.
    #[must_use]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Creates a weak handle that does not keep the buffer alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakStorage {
        WeakStorage {
            inner: Arc::downgrade(&self.inner),
            device: self.device,
        }
    }
}

// =============================================================================
// Weak Handles
// =============================================================================

/// A non-owning handle to a storage buffer.
#[derive(Debug, Clone)]
pub struct WeakStorage {
    inner: Weak<RwLock<Vec<f32>>>,
    device: Device,
}

impl WeakStorage {
    /// Returns true while any strong handle to the buffer exists.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Upgrades to a strong handle if the buffer is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Storage> {
        self.inner.upgrade().map(|inner| Storage {
            inner,
            device: self.device,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_zeros() {
        let storage = Storage::zeros(10, Device::Cpu);
        assert_eq!(storage.len(), 10);
        assert!(!storage.is_empty());
        assert!(storage.read().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_storage_clone_shares() {
        let storage1 = Storage::zeros(4, Device::Cpu);
        let storage2 = storage1.clone();
        storage2.write()[0] = 5.0;
        assert_eq!(storage1.read()[0], 5.0);
        assert!(storage1.ptr_eq(&storage2));
        assert_eq!(storage1.strong_count(), 2);
    }

    #[test]
    fn test_storage_deep_copy() {
        let storage1 = Storage::from_vec(vec![1.0, 2.0], Device::Cpu);
        let storage2 = storage1.deep_copy();
        storage2.write()[0] = 9.0;
        assert_eq!(storage1.read()[0], 1.0);
        assert!(!storage1.ptr_eq(&storage2));
    }

    #[test]
    fn test_copy_from_slice_checks_length() {
        let storage = Storage::zeros(3, Device::Cpu);
        assert!(storage.copy_from_slice(&[1.0, 2.0, 3.0]).is_ok());
        assert_eq!(&*storage.read(), &[1.0, 2.0, 3.0]);
        assert!(storage.copy_from_slice(&[1.0]).is_err());
    }

    #[test]
    fn test_weak_handle() {
        let storage = Storage::zeros(2, Device::Cuda(0));
        let weak = storage.downgrade();
        assert!(weak.is_alive());
        assert_eq!(weak.upgrade().map(|s| s.device()), Some(Device::Cuda(0)));
        drop(storage);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }
}
