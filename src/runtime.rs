//! Host-side runtime values: tensors, call arguments, the value stack, and
//! raw allocations owned by a kernel.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::dtype::{Device, Scalar, ScalarType};

/// Shared byte storage. The compiled kernel writes through raw pointers, so
/// the bytes live behind an `UnsafeCell`; each kernel call has exclusive
/// logical access to the tensors it allocates.
pub struct Storage {
    bytes: UnsafeCell<Vec<u8>>,
}

unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn new(bytes: Vec<u8>) -> Arc<Storage> {
        Arc::new(Storage {
            bytes: UnsafeCell::new(bytes),
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }

    pub fn len(&self) -> usize {
        unsafe { (*self.bytes.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A host tensor: byte storage plus sizes, strides, dtype, and device.
#[derive(Clone)]
pub struct TensorData {
    storage: Arc<Storage>,
    sizes: Vec<i64>,
    strides: Vec<i64>,
    dtype: ScalarType,
    device: Device,
}

impl std::fmt::Debug for TensorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorData")
            .field("sizes", &self.sizes)
            .field("strides", &self.strides)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish()
    }
}

/// Row-major strides for the given sizes.
pub fn contiguous_strides(sizes: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; sizes.len()];
    for i in (0..sizes.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * sizes[i + 1].max(1);
    }
    strides
}

/// Smallest number of elements a strided layout must be backed by.
fn strided_extent(sizes: &[i64], strides: &[i64]) -> i64 {
    if sizes.iter().any(|&s| s == 0) {
        return 0;
    }
    let mut extent = 1i64;
    for (size, stride) in sizes.iter().zip(strides) {
        extent += (size - 1) * stride;
    }
    extent
}

impl TensorData {
    /// A contiguous CPU tensor from typed data.
    pub fn from_vec<T: Scalar>(data: Vec<T>, sizes: &[i64]) -> TensorData {
        let mut bytes = Vec::with_capacity(data.len() * T::DTYPE.size_bytes());
        for v in data {
            bytes.extend_from_slice(&v.to_bytes());
        }
        TensorData {
            storage: Storage::new(bytes),
            strides: contiguous_strides(sizes),
            sizes: sizes.to_vec(),
            dtype: T::DTYPE,
            device: Device::Cpu,
        }
    }

    /// An uninitialized (zero-filled) tensor with the given layout.
    pub fn empty_strided(
        sizes: &[i64],
        strides: &[i64],
        dtype: ScalarType,
        device: Device,
    ) -> TensorData {
        let extent = strided_extent(sizes, strides) as usize;
        TensorData {
            storage: Storage::new(vec![0u8; extent * dtype.size_bytes()]),
            sizes: sizes.to_vec(),
            strides: strides.to_vec(),
            dtype,
            device,
        }
    }

    pub fn zeros(sizes: &[i64], dtype: ScalarType) -> TensorData {
        TensorData::empty_strided(sizes, &contiguous_strides(sizes), dtype, Device::Cpu)
    }

    /// Reinterprets this tensor with explicit strides over the same storage.
    pub fn with_strides(mut self, strides: Vec<i64>) -> TensorData {
        assert_eq!(strides.len(), self.sizes.len());
        self.strides = strides;
        self
    }

    pub fn with_device(mut self, device: Device) -> TensorData {
        self.device = device;
        self
    }

    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    pub fn dtype(&self) -> ScalarType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> i64 {
        self.sizes.iter().product()
    }

    pub fn is_contiguous(&self) -> bool {
        self.strides == contiguous_strides(&self.sizes)
    }

    pub fn data_ptr(&self) -> *mut u8 {
        self.storage.ptr()
    }

    /// Element at a logical index, resolved through the strides.
    pub fn at<T: Scalar>(&self, index: &[i64]) -> T {
        assert_eq!(index.len(), self.sizes.len());
        assert_eq!(T::DTYPE, self.dtype);
        let offset: i64 = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
        let byte = offset as usize * self.dtype.size_bytes();
        unsafe {
            let bytes =
                std::slice::from_raw_parts(self.storage.ptr().add(byte), T::DTYPE.size_bytes());
            T::from_bytes(bytes)
        }
    }

    /// All elements in logical (row-major) order, gathering through strides.
    pub fn to_vec<T: Scalar>(&self) -> Vec<T> {
        let numel = self.numel() as usize;
        let mut out = Vec::with_capacity(numel);
        let mut index = vec![0i64; self.sizes.len()];
        for _ in 0..numel {
            out.push(self.at::<T>(&index));
            for axis in (0..index.len()).rev() {
                index[axis] += 1;
                if index[axis] < self.sizes[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        out
    }

    /// A contiguous copy in logical order. Used when a constant arrives with
    /// a non-contiguous layout.
    pub fn clone_contiguous(&self) -> TensorData {
        let elem = self.dtype.size_bytes();
        let numel = self.numel() as usize;
        let mut bytes = vec![0u8; numel * elem];
        let mut index = vec![0i64; self.sizes.len()];
        for flat in 0..numel {
            let offset: i64 = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.storage.ptr().add(offset as usize * elem),
                    bytes.as_mut_ptr().add(flat * elem),
                    elem,
                );
            }
            for axis in (0..index.len()).rev() {
                index[axis] += 1;
                if index[axis] < self.sizes[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        TensorData {
            storage: Storage::new(bytes),
            strides: contiguous_strides(&self.sizes),
            sizes: self.sizes.clone(),
            dtype: self.dtype,
            device: self.device,
        }
    }
}

/// A raw allocation owned by a kernel (pre-allocated intermediates). Freed
/// on drop.
pub struct RawBuffer {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

impl RawBuffer {
    /// Allocates `size` zeroed bytes. Returns `None` when the allocator
    /// refuses.
    pub fn allocate(size: usize) -> Option<RawBuffer> {
        let layout = Layout::from_size_align(size.max(1), 16).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        Some(RawBuffer { ptr, layout })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// One argument of a compiled-kernel call.
#[derive(Debug, Clone, Copy)]
pub enum CallArg {
    Ptr(*mut u8),
    Int(i64),
    Double(f64),
}

/// A value on the interpreter stack.
#[derive(Debug, Clone)]
pub enum RtValue {
    Tensor(TensorData),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl RtValue {
    pub fn as_tensor(&self) -> Option<&TensorData> {
        match self {
            RtValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            RtValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// The caller's value stack: `run` pops its inputs off the top and pushes
/// outputs back in graph-output order.
pub type Stack = Vec<RtValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[5]), vec![1]);
        assert!(contiguous_strides(&[]).is_empty());
    }

    #[test]
    fn test_strided_access() {
        // Transposed view of [[0, 1, 2], [3, 4, 5]].
        let t = TensorData::from_vec(vec![0f32, 1., 2., 3., 4., 5.], &[2, 3])
            .with_strides(vec![1, 2]);
        assert_eq!(t.at::<f32>(&[0, 1]), 2.0);
        assert_eq!(t.at::<f32>(&[1, 2]), 5.0);
        assert!(!t.is_contiguous());
    }

    #[test]
    fn test_clone_contiguous() {
        let t = TensorData::from_vec(vec![0f32, 1., 2., 3., 4., 5.], &[2, 3])
            .with_strides(vec![1, 2]);
        let c = t.clone_contiguous();
        assert!(c.is_contiguous());
        assert_eq!(c.to_vec::<f32>(), vec![0., 2., 4., 1., 3., 5.]);
    }

    #[test]
    fn test_raw_buffer_allocates() {
        let buf = RawBuffer::allocate(64).unwrap();
        assert!(!buf.ptr().is_null());
    }
}
