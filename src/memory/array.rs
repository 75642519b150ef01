//! Storage arrays: [`HostArray`] for host-resident typed grids,
//! [`DeviceArray`] for accelerator-resident per-channel buffers.

use std::ops::{Index, IndexMut};
use std::sync::Arc;

use crate::grid::dim3::Dim3;
use crate::halo_error::HaloError;
use crate::runtime::{AllocMode, DevicePtr, DeviceRuntime};

/// Host-resident typed 3-D array. Resizing to a different extent
/// reallocates; contents are default-filled after a size change.
#[derive(Clone, Debug, Default)]
pub struct HostArray<T> {
    size: Dim3,
    data: Vec<T>,
}

impl<T: Clone + Default> HostArray<T> {
    pub fn new() -> Self {
        Self {
            size: Dim3::ZERO,
            data: Vec::new(),
        }
    }

    pub fn with_size(size: Dim3) -> Self {
        let mut a = Self::new();
        a.resize(size);
        a
    }

    pub fn resize(&mut self, size: Dim3) {
        if size != self.size {
            let n = size.flatten().max(0) as usize;
            self.data = vec![T::default(); n];
            self.size = size;
        }
    }

    #[inline]
    pub fn size(&self) -> Dim3 {
        self.size
    }

    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Element at a 3-D position, x stride-1.
    #[inline]
    pub fn at(&self, pos: Dim3) -> &T {
        &self.data[pos.to_linear(self.size) as usize]
    }

    #[inline]
    pub fn at_mut(&mut self, pos: Dim3) -> &mut T {
        &mut self.data[pos.to_linear(self.size) as usize]
    }

    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }
}

impl<T> Index<usize> for HostArray<T> {
    type Output = T;
    #[inline]
    fn index(&self, n: usize) -> &T {
        &self.data[n]
    }
}

impl<T> IndexMut<usize> for HostArray<T> {
    #[inline]
    fn index_mut(&mut self, n: usize) -> &mut T {
        &mut self.data[n]
    }
}

/// Accelerator-resident buffer for one data channel: a logical 3-D box of
/// `elem_size`-byte cells on one device. The allocation is released on drop.
#[derive(Debug)]
pub struct DeviceArray {
    rt: Arc<DeviceRuntime>,
    device: usize,
    mode: AllocMode,
    elem_size: usize,
    size: Dim3,
    ptr: Option<DevicePtr>,
}

impl DeviceArray {
    pub fn new(rt: Arc<DeviceRuntime>, device: usize, elem_size: usize, mode: AllocMode) -> Self {
        Self {
            rt,
            device,
            mode,
            elem_size,
            size: Dim3::ZERO,
            ptr: None,
        }
    }

    /// Reallocates to the new extent. Contents are zeroed after a size
    /// change, as freshly allocated device memory from the host runtime.
    pub fn resize(&mut self, size: Dim3) -> Result<(), HaloError> {
        if size == self.size {
            return Ok(());
        }
        if let Some(p) = self.ptr.take() {
            self.rt.free(p);
        }
        let n = size.flatten().max(0) as usize * self.elem_size;
        if n > 0 {
            self.rt.set_device(self.device)?;
            let p = match self.mode {
                AllocMode::Device => self.rt.malloc(self.device, n)?,
                AllocMode::Unified => self.rt.malloc_unified(n)?,
            };
            self.ptr = Some(p);
        }
        self.size = size;
        Ok(())
    }

    #[inline]
    pub fn size(&self) -> Dim3 {
        self.size
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    #[inline]
    pub fn device(&self) -> usize {
        self.device
    }

    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.size.flatten().max(0) as usize * self.elem_size
    }

    /// Base device pointer, `None` until a nonzero resize.
    #[inline]
    pub fn ptr(&self) -> Option<DevicePtr> {
        self.ptr
    }

    /// Device pointer to the cell at `pos`.
    #[inline]
    pub fn ptr_at(&self, pos: Dim3) -> Option<DevicePtr> {
        self.ptr
            .map(|p| p.byte_add(pos.to_linear(self.size) as usize * self.elem_size))
    }

    pub fn swap(&mut self, other: &mut Self) {
        debug_assert_eq!(self.elem_size, other.elem_size);
        std::mem::swap(self, other);
    }
}

impl Drop for DeviceArray {
    fn drop(&mut self) {
        if let Some(p) = self.ptr.take() {
            self.rt.free(p);
        }
    }
}
