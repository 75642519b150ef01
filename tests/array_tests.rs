use std::sync::Arc;

use stencil_halo::grid::dim3::Dim3;
use stencil_halo::memory::array::{DeviceArray, HostArray};
use stencil_halo::runtime::{AllocMode, DeviceRuntime};

#[test]
fn host_array_default_is_empty() {
    let arr = HostArray::<i32>::new();
    assert_eq!(arr.size(), Dim3::ZERO);
    assert!(arr.data().is_empty());
}

#[test]
fn host_array_with_size_allocates() {
    let sz = Dim3::new(1, 2, 3);
    let arr = HostArray::<f64>::with_size(sz);
    assert_eq!(arr.size(), sz);
    assert_eq!(arr.data().len(), 6);
}

#[test]
fn host_array_resize() {
    let mut arr = HostArray::<i32>::new();
    let sz = Dim3::new(2, 3, 4);
    arr.resize(sz);
    assert_eq!(arr.size(), sz);
    assert_eq!(arr.data().len(), 24);
    arr.resize(Dim3::ZERO);
    assert_eq!(arr.size(), Dim3::ZERO);
    assert!(arr.data().is_empty());
}

#[test]
fn host_array_swap() {
    let sza = Dim3::splat(10);
    let szb = Dim3::splat(13);
    let mut a = HostArray::<i32>::with_size(sza);
    let mut b = HostArray::<i32>::with_size(szb);
    a.swap(&mut b);
    assert_eq!(a.size(), szb);
    assert_eq!(b.size(), sza);
}

#[test]
fn host_array_element_access() {
    let mut arr = HostArray::<i32>::with_size(Dim3::new(2, 3, 4));
    arr[0] = 10;
    arr[23] = 27;
    assert_eq!(arr[0], 10);
    assert_eq!(arr[23], 27);
    *arr.at_mut(Dim3::new(1, 2, 3)) = 42;
    assert_eq!(*arr.at(Dim3::new(1, 2, 3)), 42);
    assert_eq!(arr[23], 42); // (1,2,3) is the last linear slot
}

#[test]
fn device_array_lifecycle() {
    let rt = Arc::new(DeviceRuntime::new(2));
    let mut arr = DeviceArray::new(Arc::clone(&rt), 1, 8, AllocMode::Device);
    assert!(arr.ptr().is_none());

    arr.resize(Dim3::new(2, 3, 4)).unwrap();
    assert_eq!(arr.size(), Dim3::new(2, 3, 4));
    assert_eq!(arr.len_bytes(), 24 * 8);
    assert_eq!(rt.bytes_in_use(), arr.len_bytes());
    assert!(arr.ptr().is_some());

    drop(arr);
    assert_eq!(rt.bytes_in_use(), 0);
}

#[test]
fn device_array_unified_mode() {
    let rt = Arc::new(DeviceRuntime::new(1));
    let mut arr = DeviceArray::new(Arc::clone(&rt), 0, 4, AllocMode::Unified);
    arr.resize(Dim3::splat(3)).unwrap();
    assert_eq!(rt.bytes_in_use(), 27 * 4);
}

#[test]
fn device_array_rejects_missing_device() {
    let rt = Arc::new(DeviceRuntime::new(1));
    let mut arr = DeviceArray::new(rt, 3, 4, AllocMode::Device);
    assert!(arr.resize(Dim3::splat(2)).is_err());
}
