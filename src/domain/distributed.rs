//! DistributedDomain: the planner and exchange driver.
//!
//! Construction discovers co-located ranks and the local accelerator set,
//! builds the peer-access matrix over physical device ids, and constructs
//! the partitioner. `realize()` is two-phase: every local subdomain is
//! allocated before any transport is planned, because same-rank transports
//! need the peer subdomain's buffers. `exchange()` then drives one halo
//! round: barrier, concurrent per-subdomain issue, receivers-first wait,
//! closing barrier.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::comm::Communicator;
use crate::domain::local::LocalDomain;
use crate::grid::dim3::Dim3;
use crate::grid::direction::{DirectionMap, DIRECTIONS};
use crate::halo_error::HaloError;
use crate::partition::Partition;
use crate::runtime::{AllocMode, DeviceRuntime, PeerAccess};
use crate::transport::{
    HaloSender, RegionCopier, PackMemcpyCopier, RegionRecver, RegionSender, TransportKind,
    MAX_CHANNELS, MAX_GPUS_PER_RANK,
};

/// Typed handle for a registered data channel.
pub struct DataHandle<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DataHandle<T> {
    /// The channel's insertion index, valid on every local domain.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Clone for DataHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DataHandle<T> {}

/// The cluster-wide view owned by one rank: its local subdomains and the
/// communication plan that fills their halos.
pub struct DistributedDomain<C: Communicator> {
    size: Dim3,
    radius: usize,
    comm: Arc<C>,
    rt: Arc<DeviceRuntime>,
    rank: usize,
    world_size: usize,
    gpus: Vec<usize>,
    colocated: HashSet<usize>,
    peer_access: Vec<Vec<bool>>,
    partition: Partition,
    elem_sizes: Vec<usize>,
    domains: Vec<LocalDomain>,
    domain_idx: Vec<Dim3>,
    senders: Vec<DirectionMap<Option<HaloSender<C>>>>,
    recvers: Vec<DirectionMap<Option<RegionRecver<C>>>>,
    realized: bool,
}

impl<C: Communicator> DistributedDomain<C> {
    /// Queries the messaging library and the accelerator runtime, assigns
    /// local accelerators, enables peer access, and partitions `size`.
    pub fn new(size: Dim3, comm: Arc<C>, rt: Arc<DeviceRuntime>) -> Result<Self, HaloError> {
        if size.any_le_zero() {
            return Err(HaloError::InvalidSize(size));
        }
        let rank = comm.rank();
        let world_size = comm.size();

        comm.barrier(); // stabilize co-location timing
        let start = Instant::now();
        let group = comm.shared_group();
        let colocated: HashSet<usize> = group.members.iter().copied().collect();
        debug_assert!(colocated.contains(&rank), "should be colocated with self");
        log::debug!(
            "time.colocate [{rank}] {:?} ({} co-located ranks)",
            start.elapsed(),
            colocated.len() - 1
        );

        let device_count = rt.device_count();
        if device_count < 1 {
            return Err(HaloError::InvalidWorkerCount {
                what: "accelerator",
                got: 0,
            });
        }

        // Fewer ranks than devices: ceiling round-robin devices over the
        // host group. More ranks: share one device per rank.
        let mut gpus = Vec::new();
        if group.shm_size <= device_count {
            for gpu in 0..device_count {
                if gpu % group.shm_size == group.shm_rank {
                    gpus.push(gpu);
                }
            }
        } else {
            gpus.push(group.shm_rank % device_count);
        }
        if gpus.len() > MAX_GPUS_PER_RANK {
            return Err(HaloError::Unsupported {
                what: "accelerators per rank",
                max: MAX_GPUS_PER_RANK,
                got: gpus.len(),
            });
        }
        for &gpu in &gpus {
            log::debug!("rank {rank}/{world_size} local={} using device {gpu}", group.shm_rank);
        }

        // Peer access over physical device ids: cross-rank same-host peers
        // index into the host-global id space, not this rank's subset.
        let start = Instant::now();
        let mut peer_access = vec![vec![false; device_count]; device_count];
        for src in 0..device_count {
            for dst in 0..device_count {
                if src == dst {
                    peer_access[src][dst] = true;
                    continue;
                }
                rt.set_device(src)?;
                match rt.enable_peer_access(src, dst) {
                    PeerAccess::Enabled | PeerAccess::AlreadyEnabled => {
                        peer_access[src][dst] = true;
                        log::trace!("{src} -> {dst} peer access");
                    }
                    PeerAccess::InvalidDevice => {
                        peer_access[src][dst] = false;
                    }
                    PeerAccess::Failed => {
                        return Err(HaloError::PeerAccess { src, dst });
                    }
                }
            }
        }
        log::debug!("time.peer [{rank}] {:?}", start.elapsed());

        let start = Instant::now();
        let partition = Partition::new(size, world_size, gpus.len())?;
        log::debug!("time.partition [{rank}] {:?}", start.elapsed());

        comm.barrier();
        if rank == 0 {
            log::debug!(
                "split {size} into {}x{}",
                partition.rank_dim(),
                partition.gpu_dim()
            );
        }

        Ok(Self {
            size,
            radius: 0,
            comm,
            rt,
            rank,
            world_size,
            gpus,
            colocated,
            peer_access,
            partition,
            elem_sizes: Vec::new(),
            domains: Vec::new(),
            domain_idx: Vec::new(),
            senders: Vec::new(),
            recvers: Vec::new(),
            realized: false,
        })
    }

    /// Sets the stencil radius, uniform on all axes. A radius of zero is
    /// rejected: such a "domain" would have nothing to exchange.
    pub fn set_radius(&mut self, radius: usize) -> Result<(), HaloError> {
        if self.realized {
            return Err(HaloError::AlreadyRealized);
        }
        if radius < 1 {
            return Err(HaloError::InvalidRadius);
        }
        self.radius = radius;
        Ok(())
    }

    /// Declares a data channel of cells of type `T`. Must precede
    /// [`DistributedDomain::realize`].
    pub fn register_data<T: Pod>(&mut self) -> Result<DataHandle<T>, HaloError> {
        if self.realized {
            return Err(HaloError::RegisterAfterRealize);
        }
        if self.elem_sizes.len() >= MAX_CHANNELS {
            return Err(HaloError::Unsupported {
                what: "data channels",
                max: MAX_CHANNELS,
                got: self.elem_sizes.len() + 1,
            });
        }
        self.elem_sizes.push(std::mem::size_of::<T>());
        Ok(DataHandle {
            index: self.elem_sizes.len() - 1,
            _marker: PhantomData,
        })
    }

    /// Allocates every local subdomain, then builds the communication plan.
    pub fn realize(&mut self, unified: bool) -> Result<(), HaloError> {
        if self.realized {
            return Err(HaloError::AlreadyRealized);
        }
        if self.radius < 1 {
            return Err(HaloError::InvalidRadius);
        }
        self.partition.validate()?;
        let smallest = self
            .partition
            .local_domain_size(self.partition.dom_dim() - Dim3::ONE);
        let thinnest = smallest.x.min(smallest.y).min(smallest.z);
        if (self.radius as i64) > thinnest {
            return Err(HaloError::RadiusExceedsSubdomain {
                radius: self.radius,
                extent: thinnest,
            });
        }

        let mode = if unified {
            AllocMode::Unified
        } else {
            AllocMode::Device
        };

        // Phase 1: realize all locals. Transports constructed later must be
        // able to reference any peer subdomain on this rank.
        let start = Instant::now();
        for (slot, &device) in self.gpus.iter().enumerate() {
            let idx = self.partition.dom_idx(self.rank, slot);
            let extents = self.partition.local_domain_size(idx);
            let mut local = LocalDomain::new(extents, device, self.radius, Arc::clone(&self.rt));
            for &elem_size in &self.elem_sizes {
                local.register_data(elem_size)?;
            }
            if let Err(e) = local.realize(mode) {
                // unwind partially constructed locals; their arrays free on drop
                self.domains.clear();
                self.domain_idx.clear();
                return Err(e);
            }
            log::debug!("rank={} gpu={slot} (device={device}) => {idx}", self.rank);
            self.domains.push(local);
            self.domain_idx.push(idx);
        }
        log::debug!("time.local_realize [{}] {:?}", self.rank, start.elapsed());

        // Phase 2: the communication plan.
        let start = Instant::now();
        let dom_dim = self.partition.dom_dim();
        let mut senders: Vec<DirectionMap<Option<HaloSender<C>>>> =
            (0..self.domains.len()).map(|_| DirectionMap::default()).collect();
        let mut recvers: Vec<DirectionMap<Option<RegionRecver<C>>>> =
            (0..self.domains.len()).map(|_| DirectionMap::default()).collect();

        for (di, my_domain) in self.domains.iter().enumerate() {
            let my_idx = self.domain_idx[di];
            debug_assert_eq!(self.partition.get_rank(my_idx), self.rank);

            for &dir in &DIRECTIONS {
                // who I send to, and who sends to me, for this direction
                let dst_idx = (my_idx + dir).wrap(dom_dim);
                let src_idx = (my_idx - dir).wrap(dom_dim);
                let dst_rank = self.partition.get_rank(dst_idx);
                let dst_gpu = self.partition.get_gpu(dst_idx);
                let src_rank = self.partition.get_rank(src_idx);
                let src_gpu = self.partition.get_gpu(src_idx);

                let mut sender = if dst_rank == self.rank {
                    let my_device = my_domain.device();
                    let dst_device = self.domains[dst_gpu].device();
                    if self.peer_access[my_device][dst_device] {
                        log::trace!("plan [{}] dir={dir} send same rank, peer access", self.rank);
                        HaloSender::Direct(RegionCopier::new(
                            &self.domains[dst_gpu],
                            my_domain,
                            dir,
                        )?)
                    } else {
                        log::trace!("plan [{}] dir={dir} send same rank, staged", self.rank);
                        HaloSender::Staged(PackMemcpyCopier::new(
                            &self.domains[dst_gpu],
                            my_domain,
                            dir,
                        )?)
                    }
                } else {
                    let colocated = self.colocated.contains(&dst_rank);
                    log::trace!(
                        "plan [{}] dir={dir} send to rank {dst_rank} ({})",
                        self.rank,
                        if colocated { "colocated" } else { "remote" }
                    );
                    HaloSender::Remote(RegionSender::new(
                        my_domain,
                        di,
                        dst_rank,
                        dst_gpu,
                        dir,
                        Arc::clone(&self.comm),
                        colocated,
                    )?)
                };

                let mut recver = if src_rank == self.rank {
                    None // the same-rank copier carries both halves
                } else {
                    log::trace!(
                        "plan [{}] dir={dir} recv from rank {src_rank}",
                        self.rank
                    );
                    Some(RegionRecver::new(
                        my_domain,
                        src_rank,
                        src_gpu,
                        di,
                        dir,
                        Arc::clone(&self.comm),
                    )?)
                };

                sender.allocate()?;
                if let Some(rx) = recver.as_mut() {
                    rx.allocate()?;
                }
                *senders[di].at_mut(dir) = Some(sender);
                *recvers[di].at_mut(dir) = recver;
            }
        }
        self.senders = senders;
        self.recvers = recvers;
        self.realized = true;
        log::debug!("time.plan [{}] {:?}", self.rank, start.elapsed());
        Ok(())
    }

    /// One halo exchange round. On return every local halo is populated and
    /// every send buffer is reusable; no rank returns while a peer is still
    /// draining.
    pub fn exchange(&mut self) -> Result<(), HaloError> {
        if !self.realized {
            return Err(HaloError::NotRealized);
        }
        self.comm.barrier(); // stabilize timing; happens-before for the round

        let start = Instant::now();
        let rank = self.rank;
        let first_err: Mutex<Option<HaloError>> = Mutex::new(None);

        // Issue sends and recvs concurrently across subdomains; a library
        // stall on one subdomain must not hold up the others. Within one
        // subdomain the 26 issues are sequential.
        rayon::scope(|scope| {
            for (di, dir_senders) in self.senders.iter_mut().enumerate() {
                let first_err = &first_err;
                scope.spawn(move |_| {
                    let issue = Instant::now();
                    for (_, slot) in dir_senders.iter_mut() {
                        if let Some(tx) = slot.as_mut() {
                            if let Err(e) = tx.send() {
                                let mut guard = first_err.lock();
                                if guard.is_none() {
                                    *guard = Some(e);
                                }
                                return;
                            }
                        }
                    }
                    log::trace!("time.issue_send [{rank}] [{di}] {:?}", issue.elapsed());
                });
            }
            for (di, dir_recvers) in self.recvers.iter_mut().enumerate() {
                let first_err = &first_err;
                scope.spawn(move |_| {
                    let issue = Instant::now();
                    for (_, slot) in dir_recvers.iter_mut() {
                        if let Some(rx) = slot.as_mut() {
                            if let Err(e) = rx.recv() {
                                let mut guard = first_err.lock();
                                if guard.is_none() {
                                    *guard = Some(e);
                                }
                                return;
                            }
                        }
                    }
                    log::trace!("time.issue_recv [{rank}] [{di}] {:?}", issue.elapsed());
                });
            }
        });
        if let Some(e) = first_err.into_inner() {
            return Err(e);
        }

        // Drain: receivers first, so halos are visible before send buffers
        // are declared reusable.
        for (dir_senders, dir_recvers) in self.senders.iter_mut().zip(self.recvers.iter_mut()) {
            for &dir in &DIRECTIONS {
                if let Some(rx) = dir_recvers.at_mut(dir).as_mut() {
                    rx.wait()?;
                }
                if let Some(tx) = dir_senders.at_mut(dir).as_mut() {
                    tx.wait()?;
                }
            }
        }
        log::debug!("time.exchange [{rank}] {:?}", start.elapsed());

        self.comm.barrier(); // no rank leaves while a peer is draining
        Ok(())
    }

    /// The local subdomains, one per owned accelerator.
    pub fn domains(&self) -> &[LocalDomain] {
        &self.domains
    }

    /// The domain index of each local subdomain.
    pub fn domain_indices(&self) -> &[Dim3] {
        &self.domain_idx
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn size(&self) -> Dim3 {
        self.size
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Physical ids of the accelerators this rank owns.
    pub fn local_devices(&self) -> &[usize] {
        &self.gpus
    }

    /// World ranks sharing this host, self included.
    pub fn colocated(&self) -> &HashSet<usize> {
        &self.colocated
    }

    /// Peer-access matrix over physical device ids.
    pub fn peer_access(&self) -> &[Vec<bool>] {
        &self.peer_access
    }

    /// Strategy chosen for a subdomain's direction, if realized.
    pub fn sender_kind(&self, domain: usize, dir: Dim3) -> Option<TransportKind> {
        self.senders
            .get(domain)
            .and_then(|m| m.at(dir).as_ref())
            .map(|tx| tx.kind())
    }

    /// Whether a receiver was planned for a subdomain's direction.
    pub fn has_recver(&self, domain: usize, dir: Dim3) -> bool {
        self.recvers
            .get(domain)
            .map(|m| m.at(dir).is_some())
            .unwrap_or(false)
    }
}
