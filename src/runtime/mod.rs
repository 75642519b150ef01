//! Host-simulated accelerator runtime.
//!
//! The engine consumes the accelerator runtime through a narrow surface:
//! device enumeration, raw allocations addressed by opaque [`DevicePtr`]
//! handles, any-to-any asynchronous copies, peer-access management, and
//! streams. This implementation backs every "device" allocation with host
//! memory, which makes multi-accelerator layouts fully exercisable
//! in-process. Co-located ranks share one [`DeviceRuntime`] handle the same
//! way they share a physical host, so peer-access state and the device id
//! space are host-global, not per-rank.
//!
//! Device memory is never dereferenced directly; all traffic goes through
//! [`DeviceRuntime::memcpy_async`], [`DeviceRuntime::upload`], and
//! [`DeviceRuntime::download`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::halo_error::HaloError;

/// Opaque device pointer: an allocation id plus a byte offset into it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    alloc: u64,
    offset: usize,
}

impl DevicePtr {
    /// Pointer arithmetic within the same allocation.
    #[inline]
    pub fn byte_add(self, n: usize) -> DevicePtr {
        DevicePtr {
            alloc: self.alloc,
            offset: self.offset + n,
        }
    }
}

/// Outcome of a peer-access enable request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeerAccess {
    Enabled,
    AlreadyEnabled,
    InvalidDevice,
    Failed,
}

/// Where an allocation lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocMode {
    Device,
    Unified,
}

/// An asynchronous work queue bound to one device. The host simulation
/// completes copies at issue time, so synchronization is trivially
/// satisfied; a real backend would enqueue on the stream.
#[derive(Copy, Clone, Debug)]
pub struct Stream {
    device: usize,
}

struct Allocation {
    bytes: Box<[u8]>,
    // None marks a unified allocation reachable from every device.
    device: Option<usize>,
}

/// One host's accelerator set.
pub struct DeviceRuntime {
    device_count: usize,
    links: Vec<Vec<bool>>,
    enabled: Mutex<Vec<Vec<bool>>>,
    allocs: Mutex<HashMap<u64, Allocation>>,
    next: AtomicU64,
}

impl fmt::Debug for DeviceRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRuntime")
            .field("device_count", &self.device_count)
            .field("bytes_in_use", &self.bytes_in_use())
            .finish()
    }
}

impl DeviceRuntime {
    /// A host with `device_count` accelerators, every pair peer-linked.
    pub fn new(device_count: usize) -> Self {
        let links = vec![vec![true; device_count]; device_count];
        Self::with_peer_links(device_count, links)
    }

    /// A host with an explicit physical peer-link topology. `links[s][d]`
    /// says whether enabling peer access from `s` to `d` can succeed.
    pub fn with_peer_links(device_count: usize, links: Vec<Vec<bool>>) -> Self {
        assert_eq!(links.len(), device_count, "links must be device_count^2");
        Self {
            device_count,
            links,
            enabled: Mutex::new(vec![vec![false; device_count]; device_count]),
            allocs: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Validates that `device` exists. The host simulation has no per-thread
    /// current-device state to switch.
    pub fn set_device(&self, device: usize) -> Result<(), HaloError> {
        if device >= self.device_count {
            return Err(HaloError::InvalidDevice {
                device,
                count: self.device_count,
            });
        }
        Ok(())
    }

    pub fn malloc(&self, device: usize, bytes: usize) -> Result<DevicePtr, HaloError> {
        self.set_device(device)?;
        Ok(self.alloc_impl(Some(device), bytes))
    }

    pub fn malloc_unified(&self, bytes: usize) -> Result<DevicePtr, HaloError> {
        Ok(self.alloc_impl(None, bytes))
    }

    fn alloc_impl(&self, device: Option<usize>, bytes: usize) -> DevicePtr {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let alloc = Allocation {
            bytes: vec![0u8; bytes].into_boxed_slice(),
            device,
        };
        self.allocs.lock().insert(id, alloc);
        DevicePtr {
            alloc: id,
            offset: 0,
        }
    }

    /// Releases an allocation. Freeing an already-freed pointer is a no-op,
    /// as in the underlying runtimes.
    pub fn free(&self, ptr: DevicePtr) {
        self.allocs.lock().remove(&ptr.alloc);
    }

    /// Total live allocation bytes, for leak diagnostics.
    pub fn bytes_in_use(&self) -> usize {
        self.allocs.lock().values().map(|a| a.bytes.len()).sum()
    }

    pub fn enable_peer_access(&self, src: usize, dst: usize) -> PeerAccess {
        if src >= self.device_count || dst >= self.device_count || src == dst {
            return PeerAccess::InvalidDevice;
        }
        if !self.links[src][dst] {
            return PeerAccess::InvalidDevice;
        }
        let mut enabled = self.enabled.lock();
        if enabled[src][dst] {
            PeerAccess::AlreadyEnabled
        } else {
            enabled[src][dst] = true;
            PeerAccess::Enabled
        }
    }

    pub fn stream_create(&self, device: usize) -> Result<Stream, HaloError> {
        self.set_device(device)?;
        Ok(Stream { device })
    }

    /// Blocks until all work on `stream` is complete.
    pub fn stream_synchronize(&self, stream: &Stream) -> Result<(), HaloError> {
        self.set_device(stream.device)
    }

    /// Device-to-device copy of `len` bytes. Any-to-any: the host path is
    /// used when the two devices are not peer-connected.
    pub fn memcpy_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
        _stream: &Stream,
    ) -> Result<(), HaloError> {
        if len == 0 {
            return Ok(());
        }
        let mut allocs = self.allocs.lock();
        if dst.alloc == src.alloc {
            let a = allocs
                .get_mut(&dst.alloc)
                .ok_or_else(|| dangling(dst))?;
            check_span(a, src, len)?;
            check_span(a, dst, len)?;
            a.bytes
                .copy_within(src.offset..src.offset + len, dst.offset);
        } else {
            let staged = {
                let s = allocs.get(&src.alloc).ok_or_else(|| dangling(src))?;
                check_span(s, src, len)?;
                s.bytes[src.offset..src.offset + len].to_vec()
            };
            let d = allocs
                .get_mut(&dst.alloc)
                .ok_or_else(|| dangling(dst))?;
            check_span(d, dst, len)?;
            d.bytes[dst.offset..dst.offset + len].copy_from_slice(&staged);
        }
        Ok(())
    }

    /// Host-to-device copy.
    pub fn upload(&self, dst: DevicePtr, data: &[u8]) -> Result<(), HaloError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut allocs = self.allocs.lock();
        let d = allocs
            .get_mut(&dst.alloc)
            .ok_or_else(|| dangling(dst))?;
        check_span(d, dst, data.len())?;
        d.bytes[dst.offset..dst.offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Device-to-host copy.
    pub fn download(&self, src: DevicePtr, len: usize) -> Result<Vec<u8>, HaloError> {
        let allocs = self.allocs.lock();
        let s = allocs.get(&src.alloc).ok_or_else(|| dangling(src))?;
        check_span(s, src, len)?;
        Ok(s.bytes[src.offset..src.offset + len].to_vec())
    }
}

fn dangling(ptr: DevicePtr) -> HaloError {
    HaloError::Memory(format!("dangling device pointer {ptr:?}"))
}

fn check_span(a: &Allocation, ptr: DevicePtr, len: usize) -> Result<(), HaloError> {
    if ptr.offset + len > a.bytes.len() {
        return Err(HaloError::Memory(format!(
            "access of {len} bytes at offset {} overruns allocation of {} bytes on {:?}",
            ptr.offset,
            a.bytes.len(),
            a.device,
        )));
    }
    Ok(())
}
