//! Communication abstraction for intra-process (threaded) and inter-process
//! (MPI) message passing.
//!
//! Wire conventions for the halo protocol:
//! - Payloads are raw little-endian cell bytes; shape is implied by the
//!   matching send/recv regions on both sides.
//! - A message is identified by `(src, dst, tag)`; the tag packs the
//!   `(srcGpu, dstGpu, direction, channel)` tuple (see `transport::halo_tag`).
//! - Receivers provide a buffer of the exact expected length; length
//!   mismatches are surfaced by the transport layer, not truncated silently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};

use crate::halo_error::HaloError;

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// The shared-memory sub-communicator view: this rank's position within its
/// host group and the world ranks co-located with it.
#[derive(Clone, Debug)]
pub struct SharedGroup {
    pub shm_rank: usize,
    pub shm_size: usize,
    /// World ranks on the same host, ascending. Always contains the caller.
    pub members: Vec<usize>,
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait + Send;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait + Send;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Rank of this process (0..size-1).
    fn rank(&self) -> usize;
    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Synchronization barrier across all ranks.
    fn barrier(&self);

    /// The host-local sub-communicator (split by shared memory) together
    /// with the gathered world ranks of its members.
    fn shared_group(&self) -> SharedGroup;

    /// Fallible `isend`; the default validates the peer rank.
    fn isend_result(
        &self,
        peer: usize,
        tag: u16,
        buf: &[u8],
    ) -> Result<Self::SendHandle, HaloError> {
        if peer >= self.size() {
            return Err(HaloError::Transport {
                peer,
                reason: format!("send to rank {peer} outside world of {}", self.size()),
            });
        }
        Ok(self.isend(peer, tag, buf))
    }

    /// Fallible `irecv`; the default validates the peer rank.
    fn irecv_result(
        &self,
        peer: usize,
        tag: u16,
        buf: &mut [u8],
    ) -> Result<Self::RecvHandle, HaloError> {
        if peer >= self.size() {
            return Err(HaloError::Transport {
                peer,
                reason: format!("recv from rank {peer} outside world of {}", self.size()),
            });
        }
        Ok(self.irecv(peer, tag, buf))
    }
}

/// Compile-time no-op comm for single-rank runs and serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}

    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn shared_group(&self) -> SharedGroup {
        SharedGroup {
            shm_rank: 0,
            shm_size: 1,
            members: vec![0],
        }
    }
}

// --- ThreadComm: intra-process ranks on threads ---

type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Slot {
    q: VecDeque<Vec<u8>>,
}

struct WorldState {
    hosts: Vec<usize>,
    mail: Mutex<HashMap<Key, Arc<(Mutex<Slot>, Condvar)>>>,
    barrier: Barrier,
}

/// One simulated cluster: a mailbox, a world barrier, and a rank-to-host
/// assignment. A cheap clonable handle; ranks are [`ThreadComm`] values
/// handed out by [`ThreadWorld::comm`] and driven on separate threads.
#[derive(Clone)]
pub struct ThreadWorld {
    state: Arc<WorldState>,
}

impl ThreadWorld {
    /// A world of `size` ranks, all on one host.
    pub fn new(size: usize) -> Self {
        Self::with_hosts(vec![0; size])
    }

    /// A world where rank `r` lives on host `hosts[r]`. Ranks sharing a
    /// host id report each other as co-located.
    pub fn with_hosts(hosts: Vec<usize>) -> Self {
        let size = hosts.len();
        assert!(size > 0, "world must have at least one rank");
        Self {
            state: Arc::new(WorldState {
                hosts,
                mail: Mutex::new(HashMap::new()),
                barrier: Barrier::new(size),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.state.hosts.len()
    }

    pub fn comm(&self, rank: usize) -> ThreadComm {
        assert!(rank < self.size(), "rank {rank} outside world");
        ThreadComm {
            world: self.clone(),
            rank,
        }
    }

    fn entry(&self, key: Key) -> Arc<(Mutex<Slot>, Condvar)> {
        let mut map = self.state.mail.lock().expect("mailbox poisoned");
        map.entry(key)
            .or_insert_with(|| Arc::new((Mutex::new(Slot::default()), Condvar::new())))
            .clone()
    }
}

pub struct ThreadSendHandle;

impl Wait for ThreadSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

pub struct ThreadRecvHandle {
    cell: Arc<(Mutex<Slot>, Condvar)>,
    want_len: usize,
}

impl Wait for ThreadRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("slot poisoned");
        while slot.q.is_empty() {
            slot = cv.wait(slot).expect("condvar poisoned");
        }
        let mut msg = slot.q.pop_front().expect("queue non-empty");
        msg.truncate(self.want_len.min(msg.len()));
        Some(msg)
    }
}

/// One rank of a [`ThreadWorld`].
#[derive(Clone)]
pub struct ThreadComm {
    world: ThreadWorld,
    rank: usize,
}

impl Communicator for ThreadComm {
    type SendHandle = ThreadSendHandle;
    type RecvHandle = ThreadRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let entry = self.world.entry((self.rank, peer, tag));
        let (lock, cv) = &*entry;
        {
            let mut slot = lock.lock().expect("slot poisoned");
            slot.q.push_back(buf.to_vec());
        }
        cv.notify_all();
        ThreadSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        ThreadRecvHandle {
            cell: self.world.entry((peer, self.rank, tag)),
            want_len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.world.size()
    }

    fn barrier(&self) {
        self.world.state.barrier.wait();
    }

    fn shared_group(&self) -> SharedGroup {
        let hosts = &self.world.state.hosts;
        let host = hosts[self.rank];
        let members: Vec<usize> = (0..self.world.size())
            .filter(|&r| hosts[r] == host)
            .collect();
        let shm_rank = members
            .iter()
            .position(|&r| r == self.rank)
            .expect("rank missing from its own host group");
        SharedGroup {
            shm_rank,
            shm_size: members.len(),
            members,
        }
    }
}

// --- MPI backend ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use core::ptr::NonNull;
    use mpi::collective::CommunicatorCollectives;
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    pub struct MpiComm {
        _universe: Universe,
        pub world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl Default for MpiComm {
        fn default() -> Self {
            let uni = mpi::initialize().unwrap();
            let world = uni.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                _universe: uni,
                world,
                rank,
                size,
            }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
            use mpi::request::StaticScope;
            let boxed = buf.to_vec().into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice: &[u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, slice, tag as i32);
            MpiSendHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            }
        }

        fn irecv(&self, peer: usize, tag: u16, template: &mut [u8]) -> Self::RecvHandle {
            use mpi::request::StaticScope;
            let len = template.len();
            let boxed = vec![0u8; len].into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice_mut: &mut [u8] = unsafe { &mut *raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, slice_mut, tag as i32);
            MpiRecvHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
                len,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn shared_group(&self) -> SharedGroup {
            let shm = self.world.split_shared(self.rank as i32);
            let shm_rank = shm.rank() as usize;
            let shm_size = shm.size() as usize;
            let mut members = vec![0i32; shm_size];
            shm.all_gather_into(&(self.rank as i32), &mut members[..]);
            members.sort_unstable();
            SharedGroup {
                shm_rank,
                shm_size,
                members: members.into_iter().map(|r| r as usize).collect(),
            }
        }
    }

    pub struct MpiSendHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
    }

    // The boxed buffer behind `buf` is owned exclusively by this handle.
    unsafe impl Send for MpiSendHandle {}

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
            None
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.test();
                #[cfg(debug_assertions)]
                eprintln!("[MpiSendHandle::drop] send not explicitly waited");
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }

    pub struct MpiRecvHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
        len: usize,
    }

    // The boxed buffer behind `buf` is owned exclusively by this handle.
    unsafe impl Send for MpiRecvHandle {}

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            let ptr = self.buf.take().expect("buffer missing");
            let boxed: Box<[u8]> = unsafe { Box::from_raw(ptr.as_ptr()) };
            let mut v = Vec::from(boxed);
            v.truncate(self.len);
            Some(v)
        }
    }

    impl Drop for MpiRecvHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.test();
                #[cfg(debug_assertions)]
                eprintln!("[MpiRecvHandle::drop] recv not explicitly waited");
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
