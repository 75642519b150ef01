//! Per-direction halo transports.
//!
//! Each of a subdomain's 26 directions gets the cheapest strategy
//! consistent with where the peer's data lives:
//!
//! 1. [`RegionCopier`]: same rank with peer access, a direct
//!    device-to-device copy from the sender's interior edge into the
//!    receiver's halo.
//! 2. [`PackMemcpyCopier`]: same rank without peer access, pack into a
//!    staging buffer, cross via the host-reachable path, unpack.
//! 3. [`RegionSender`] / [`RegionRecver`]: different ranks (co-located on
//!    one host or not), pack on device, stage to host, cross the messaging
//!    library; the peer mirrors the steps.
//!
//! The strategies are a closed enum dispatched through a uniform
//! `allocate`/`send`/`recv`/`wait` surface; no indirect calls, and the
//! 27-slot direction maps own their transports outright.

use std::sync::Arc;

use crate::comm::{Communicator, Wait};
use crate::domain::local::{LocalDomain, Region};
use crate::grid::dim3::Dim3;
use crate::grid::direction::dir_index;
use crate::halo_error::HaloError;
use crate::runtime::{DevicePtr, DeviceRuntime, Stream};

/// Most accelerators one rank may own; baked into the tag encoding.
pub const MAX_GPUS_PER_RANK: usize = 16;
/// Most data channels; baked into the tag encoding.
pub const MAX_CHANNELS: usize = 8;

/// Packs `(srcGpu, dstGpu, direction, channel)` into the u16 tag space, so
/// a message needs no header: each ordered `(src, dst, tag)` is unique.
pub fn halo_tag(src_gpu: usize, dst_gpu: usize, dir: Dim3, channel: usize) -> u16 {
    debug_assert!(src_gpu < MAX_GPUS_PER_RANK && dst_gpu < MAX_GPUS_PER_RANK);
    debug_assert!(channel < MAX_CHANNELS);
    let packed =
        ((channel * MAX_GPUS_PER_RANK + src_gpu) * MAX_GPUS_PER_RANK + dst_gpu) * 27
            + dir_index(dir);
    packed as u16
}

/// Which strategy a sender ended up with; used by the planner's logs and
/// the plan tests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Staged,
    Remote,
}

struct ChannelCopy {
    src: DevicePtr,
    dst: DevicePtr,
    elem_size: usize,
}

fn paired_channels(
    src: &LocalDomain,
    dst: &LocalDomain,
) -> Result<Vec<ChannelCopy>, HaloError> {
    debug_assert_eq!(src.num_channels(), dst.num_channels());
    (0..src.num_channels())
        .map(|ch| {
            debug_assert_eq!(src.elem_size(ch), dst.elem_size(ch));
            Ok(ChannelCopy {
                src: src.channel_ptr(ch)?,
                dst: dst.channel_ptr(ch)?,
                elem_size: src.elem_size(ch),
            })
        })
        .collect()
}

/// Device staging buffer released on drop.
struct StageBuf {
    rt: Arc<DeviceRuntime>,
    ptr: DevicePtr,
}

impl StageBuf {
    fn alloc(rt: &Arc<DeviceRuntime>, device: usize, bytes: usize) -> Result<Self, HaloError> {
        Ok(Self {
            rt: Arc::clone(rt),
            ptr: rt.malloc(device, bytes)?,
        })
    }
}

impl Drop for StageBuf {
    fn drop(&mut self) {
        self.rt.free(self.ptr);
    }
}

// --- Strategy 1: same rank, peer access ---

/// Direct accelerator-to-accelerator copy; `send()` performs both halves
/// and `wait()` serializes on the transfer. No receiver object exists.
pub struct RegionCopier {
    rt: Arc<DeviceRuntime>,
    stream: Stream,
    src_dev: usize,
    src_raw: Dim3,
    dst_raw: Dim3,
    src_region: Region,
    dst_region: Region,
    channels: Vec<ChannelCopy>,
}

impl RegionCopier {
    pub fn new(dst: &LocalDomain, src: &LocalDomain, dir: Dim3) -> Result<Self, HaloError> {
        let rt = Arc::clone(src.runtime());
        let stream = rt.stream_create(src.device())?;
        let src_region = src.send_region(dir);
        let dst_region = dst.recv_region(-dir);
        debug_assert_eq!(src_region.extent, dst_region.extent);
        Ok(Self {
            rt,
            stream,
            src_dev: src.device(),
            src_raw: src.raw_size(),
            dst_raw: dst.raw_size(),
            src_region,
            dst_region,
            channels: paired_channels(src, dst)?,
        })
    }

    pub fn allocate(&mut self) -> Result<(), HaloError> {
        Ok(())
    }

    pub fn send(&mut self) -> Result<(), HaloError> {
        self.rt.set_device(self.src_dev)?;
        for ch in &self.channels {
            let src_rows = self.src_region.row_spans(self.src_raw, ch.elem_size);
            let dst_rows = self.dst_region.row_spans(self.dst_raw, ch.elem_size);
            for ((s_off, len), (d_off, _)) in src_rows.zip(dst_rows) {
                self.rt.memcpy_async(
                    ch.dst.byte_add(d_off),
                    ch.src.byte_add(s_off),
                    len,
                    &self.stream,
                )?;
            }
        }
        Ok(())
    }

    pub fn wait(&mut self) -> Result<(), HaloError> {
        self.rt.stream_synchronize(&self.stream)
    }
}

// --- Strategy 2: same rank, no peer access ---

/// Pack the send box into contiguous staging, move staging across the
/// host-reachable path, unpack into the peer's halo. No receiver object.
pub struct PackMemcpyCopier {
    rt: Arc<DeviceRuntime>,
    stream: Stream,
    src_dev: usize,
    dst_dev: usize,
    src_raw: Dim3,
    dst_raw: Dim3,
    src_region: Region,
    dst_region: Region,
    channels: Vec<ChannelCopy>,
    stage_bytes: usize,
    src_stage: Option<StageBuf>,
    dst_stage: Option<StageBuf>,
}

impl PackMemcpyCopier {
    pub fn new(dst: &LocalDomain, src: &LocalDomain, dir: Dim3) -> Result<Self, HaloError> {
        let rt = Arc::clone(src.runtime());
        let stream = rt.stream_create(src.device())?;
        let src_region = src.send_region(dir);
        let dst_region = dst.recv_region(-dir);
        debug_assert_eq!(src_region.extent, dst_region.extent);
        let channels = paired_channels(src, dst)?;
        let stage_bytes = channels
            .iter()
            .map(|ch| src_region.cells() as usize * ch.elem_size)
            .sum();
        Ok(Self {
            rt,
            stream,
            src_dev: src.device(),
            dst_dev: dst.device(),
            src_raw: src.raw_size(),
            dst_raw: dst.raw_size(),
            src_region,
            dst_region,
            channels,
            stage_bytes,
            src_stage: None,
            dst_stage: None,
        })
    }

    pub fn allocate(&mut self) -> Result<(), HaloError> {
        self.src_stage = Some(StageBuf::alloc(&self.rt, self.src_dev, self.stage_bytes)?);
        self.dst_stage = Some(StageBuf::alloc(&self.rt, self.dst_dev, self.stage_bytes)?);
        Ok(())
    }

    pub fn send(&mut self) -> Result<(), HaloError> {
        let src_stage = self
            .src_stage
            .as_ref()
            .ok_or_else(|| HaloError::Memory("copier used before allocate()".into()))?
            .ptr;
        let dst_stage = self
            .dst_stage
            .as_ref()
            .ok_or_else(|| HaloError::Memory("copier used before allocate()".into()))?
            .ptr;

        self.rt.set_device(self.src_dev)?;
        let mut cursor = 0;
        for ch in &self.channels {
            for (off, len) in self.src_region.row_spans(self.src_raw, ch.elem_size) {
                self.rt.memcpy_async(
                    src_stage.byte_add(cursor),
                    ch.src.byte_add(off),
                    len,
                    &self.stream,
                )?;
                cursor += len;
            }
        }

        self.rt
            .memcpy_async(dst_stage, src_stage, self.stage_bytes, &self.stream)?;

        let mut cursor = 0;
        for ch in &self.channels {
            for (off, len) in self.dst_region.row_spans(self.dst_raw, ch.elem_size) {
                self.rt.memcpy_async(
                    ch.dst.byte_add(off),
                    dst_stage.byte_add(cursor),
                    len,
                    &self.stream,
                )?;
                cursor += len;
            }
        }
        Ok(())
    }

    pub fn wait(&mut self) -> Result<(), HaloError> {
        self.rt.stream_synchronize(&self.stream)
    }
}

// --- Strategies 3/4: cross-rank ---

struct SendChannel {
    ptr: DevicePtr,
    elem_size: usize,
}

fn own_channels(dom: &LocalDomain) -> Result<Vec<SendChannel>, HaloError> {
    (0..dom.num_channels())
        .map(|ch| {
            Ok(SendChannel {
                ptr: dom.channel_ptr(ch)?,
                elem_size: dom.elem_size(ch),
            })
        })
        .collect()
}

/// Cross-rank sender: pack on device, stage to host, one message per
/// channel over the messaging library. `wait()` returning only means the
/// library may reuse the buffers; visibility on the peer comes from its
/// receiver's `wait()`.
pub struct RegionSender<C: Communicator> {
    comm: Arc<C>,
    rt: Arc<DeviceRuntime>,
    stream: Stream,
    device: usize,
    raw: Dim3,
    region: Region,
    channels: Vec<SendChannel>,
    src_gpu: usize,
    dst_rank: usize,
    dst_gpu: usize,
    dir: Dim3,
    colocated: bool,
    stage: Option<StageBuf>,
    host_bufs: Vec<Vec<u8>>,
    pending: Vec<C::SendHandle>,
}

impl<C: Communicator> RegionSender<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        src: &LocalDomain,
        src_gpu: usize,
        dst_rank: usize,
        dst_gpu: usize,
        dir: Dim3,
        comm: Arc<C>,
        colocated: bool,
    ) -> Result<Self, HaloError> {
        let rt = Arc::clone(src.runtime());
        let stream = rt.stream_create(src.device())?;
        Ok(Self {
            comm,
            rt,
            stream,
            device: src.device(),
            raw: src.raw_size(),
            region: src.send_region(dir),
            channels: own_channels(src)?,
            src_gpu,
            dst_rank,
            dst_gpu,
            dir,
            colocated,
            stage: None,
            host_bufs: Vec::new(),
            pending: Vec::new(),
        })
    }

    /// True when the peer rank shares this host; kept for transport
    /// specialization and the planner's logs.
    pub fn colocated(&self) -> bool {
        self.colocated
    }

    fn stage_bytes(&self) -> usize {
        self.channels
            .iter()
            .map(|ch| self.region.cells() as usize * ch.elem_size)
            .sum()
    }

    pub fn allocate(&mut self) -> Result<(), HaloError> {
        self.stage = Some(StageBuf::alloc(&self.rt, self.device, self.stage_bytes())?);
        self.host_bufs = self
            .channels
            .iter()
            .map(|ch| vec![0u8; self.region.cells() as usize * ch.elem_size])
            .collect();
        Ok(())
    }

    pub fn send(&mut self) -> Result<(), HaloError> {
        let stage = self
            .stage
            .as_ref()
            .ok_or_else(|| HaloError::Memory("sender used before allocate()".into()))?
            .ptr;
        self.rt.set_device(self.device)?;

        // pack every channel into device staging, then stage to host
        let mut cursor = 0;
        for ch in &self.channels {
            for (off, len) in self.region.row_spans(self.raw, ch.elem_size) {
                self.rt.memcpy_async(
                    stage.byte_add(cursor),
                    ch.ptr.byte_add(off),
                    len,
                    &self.stream,
                )?;
                cursor += len;
            }
        }
        self.rt.stream_synchronize(&self.stream)?;

        let mut cursor = 0;
        for (channel, buf) in self.host_bufs.iter_mut().enumerate() {
            let n = buf.len();
            buf.copy_from_slice(&self.rt.download(stage.byte_add(cursor), n)?);
            cursor += n;
            let tag = halo_tag(self.src_gpu, self.dst_gpu, self.dir, channel);
            self.pending
                .push(self.comm.isend_result(self.dst_rank, tag, buf)?);
        }
        Ok(())
    }

    pub fn wait(&mut self) -> Result<(), HaloError> {
        for handle in self.pending.drain(..) {
            let _ = handle.wait();
        }
        Ok(())
    }
}

/// Cross-rank receiver: mirror image of [`RegionSender`]. After `wait()`
/// the halo is populated and visible to the accelerator.
pub struct RegionRecver<C: Communicator> {
    comm: Arc<C>,
    rt: Arc<DeviceRuntime>,
    stream: Stream,
    device: usize,
    raw: Dim3,
    region: Region,
    channels: Vec<SendChannel>,
    src_rank: usize,
    src_gpu: usize,
    dst_gpu: usize,
    dir: Dim3,
    stage: Option<StageBuf>,
    host_bufs: Vec<Vec<u8>>,
    pending: Vec<C::RecvHandle>,
}

impl<C: Communicator> RegionRecver<C> {
    pub fn new(
        dst: &LocalDomain,
        src_rank: usize,
        src_gpu: usize,
        dst_gpu: usize,
        dir: Dim3,
        comm: Arc<C>,
    ) -> Result<Self, HaloError> {
        let rt = Arc::clone(dst.runtime());
        let stream = rt.stream_create(dst.device())?;
        Ok(Self {
            comm,
            rt,
            stream,
            device: dst.device(),
            raw: dst.raw_size(),
            region: dst.recv_region(-dir),
            channels: own_channels(dst)?,
            src_rank,
            src_gpu,
            dst_gpu,
            dir,
            stage: None,
            host_bufs: Vec::new(),
            pending: Vec::new(),
        })
    }

    pub fn allocate(&mut self) -> Result<(), HaloError> {
        let bytes = self
            .channels
            .iter()
            .map(|ch| self.region.cells() as usize * ch.elem_size)
            .sum();
        self.stage = Some(StageBuf::alloc(&self.rt, self.device, bytes)?);
        self.host_bufs = self
            .channels
            .iter()
            .map(|ch| vec![0u8; self.region.cells() as usize * ch.elem_size])
            .collect();
        Ok(())
    }

    pub fn recv(&mut self) -> Result<(), HaloError> {
        debug_assert!(self.pending.is_empty(), "recv() issued twice without wait()");
        for (channel, buf) in self.host_bufs.iter_mut().enumerate() {
            let tag = halo_tag(self.src_gpu, self.dst_gpu, self.dir, channel);
            self.pending
                .push(self.comm.irecv_result(self.src_rank, tag, buf)?);
        }
        Ok(())
    }

    pub fn wait(&mut self) -> Result<(), HaloError> {
        let stage = self
            .stage
            .as_ref()
            .ok_or_else(|| HaloError::Memory("recver used before allocate()".into()))?
            .ptr;

        let mut cursor = 0;
        for (channel, handle) in self.pending.drain(..).enumerate() {
            let expected = self.host_bufs[channel].len();
            let data = handle.wait().ok_or_else(|| HaloError::Transport {
                peer: self.src_rank,
                reason: format!("no data for direction {} channel {channel}", self.dir),
            })?;
            if data.len() != expected {
                return Err(HaloError::Transport {
                    peer: self.src_rank,
                    reason: format!(
                        "direction {} channel {channel}: expected {expected} bytes, got {}",
                        self.dir,
                        data.len()
                    ),
                });
            }
            self.rt.upload(stage.byte_add(cursor), &data)?;
            cursor += expected;
        }

        self.rt.set_device(self.device)?;
        let mut cursor = 0;
        for ch in &self.channels {
            for (off, len) in self.region.row_spans(self.raw, ch.elem_size) {
                self.rt.memcpy_async(
                    ch.ptr.byte_add(off),
                    stage.byte_add(cursor),
                    len,
                    &self.stream,
                )?;
                cursor += len;
            }
        }
        self.rt.stream_synchronize(&self.stream)
    }
}

/// A subdomain's send half for one direction: exactly one strategy,
/// dispatched without indirection.
pub enum HaloSender<C: Communicator> {
    Direct(RegionCopier),
    Staged(PackMemcpyCopier),
    Remote(RegionSender<C>),
}

impl<C: Communicator> HaloSender<C> {
    pub fn allocate(&mut self) -> Result<(), HaloError> {
        match self {
            HaloSender::Direct(tx) => tx.allocate(),
            HaloSender::Staged(tx) => tx.allocate(),
            HaloSender::Remote(tx) => tx.allocate(),
        }
    }

    /// Non-blocking issue; callable once per exchange round for the life of
    /// the distributed domain.
    pub fn send(&mut self) -> Result<(), HaloError> {
        match self {
            HaloSender::Direct(tx) => tx.send(),
            HaloSender::Staged(tx) => tx.send(),
            HaloSender::Remote(tx) => tx.send(),
        }
    }

    /// For the same-rank strategies the halo is visible once this returns;
    /// for the remote strategy it only releases the send buffers.
    pub fn wait(&mut self) -> Result<(), HaloError> {
        match self {
            HaloSender::Direct(tx) => tx.wait(),
            HaloSender::Staged(tx) => tx.wait(),
            HaloSender::Remote(tx) => tx.wait(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            HaloSender::Direct(_) => TransportKind::Direct,
            HaloSender::Staged(_) => TransportKind::Staged,
            HaloSender::Remote(_) => TransportKind::Remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_unique_per_tuple() {
        use crate::grid::direction::DIRECTIONS;
        let mut seen = std::collections::HashSet::new();
        for src in 0..3 {
            for dst in 0..3 {
                for &dir in &DIRECTIONS {
                    for ch in 0..2 {
                        assert!(seen.insert(halo_tag(src, dst, dir, ch)));
                    }
                }
            }
        }
    }
}
