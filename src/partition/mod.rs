//! Prime-factor / cubeness partitioner.
//!
//! Maps a logical 3D domain onto a two-level rank x accelerator grid. The
//! domain is split repeatedly by the prime factors of the rank count
//! (largest first), then by the prime factors of the per-rank accelerator
//! count, each time along the axis whose ceiling split leaves the
//! per-subdomain box closest to a cube. Splitting by large factors first
//! keeps subdomains as cubic as possible, minimizing halo surface per unit
//! of compute.

use crate::grid::dim3::{cubeness, div_ceil, prime_factors, Dim3};
use crate::halo_error::HaloError;

/// Immutable two-level decomposition of a logical grid.
#[derive(Clone, Debug)]
pub struct Partition {
    size: Dim3,
    ranks: usize,
    gpus: usize,
    rank_dim: Dim3,
    gpu_dim: Dim3,
    base_local: Dim3,
}

impl Partition {
    /// Builds the decomposition of `size` across `ranks` processes with
    /// `gpus` accelerators each.
    pub fn new(size: Dim3, ranks: usize, gpus: usize) -> Result<Self, HaloError> {
        if size.any_le_zero() {
            return Err(HaloError::InvalidSize(size));
        }
        if ranks < 1 {
            return Err(HaloError::InvalidWorkerCount {
                what: "rank",
                got: ranks,
            });
        }
        if gpus < 1 {
            return Err(HaloError::InvalidWorkerCount {
                what: "accelerator",
                got: gpus,
            });
        }

        let mut cur = size;
        let mut rank_dim = Dim3::ONE;
        let mut gpu_dim = Dim3::ONE;

        for f in prime_factors(ranks) {
            let axis = split_axis(cur, f as i64);
            rank_dim = rank_dim.with_axis(axis, rank_dim.axis(axis) * f as i64);
            cur = cur.with_axis(axis, div_ceil(cur.axis(axis), f as i64));
        }
        for f in prime_factors(gpus) {
            let axis = split_axis(cur, f as i64);
            gpu_dim = gpu_dim.with_axis(axis, gpu_dim.axis(axis) * f as i64);
            cur = cur.with_axis(axis, div_ceil(cur.axis(axis), f as i64));
        }

        Ok(Self {
            size,
            ranks,
            gpus,
            rank_dim,
            gpu_dim,
            base_local: cur,
        })
    }

    /// Extent of the rank grid.
    pub fn rank_dim(&self) -> Dim3 {
        self.rank_dim
    }

    /// Extent of the per-rank accelerator grid.
    pub fn gpu_dim(&self) -> Dim3 {
        self.gpu_dim
    }

    /// Extent of the combined domain grid.
    pub fn dom_dim(&self) -> Dim3 {
        self.rank_dim * self.gpu_dim
    }

    /// Nominal per-subdomain extent before remainder correction.
    pub fn base_local(&self) -> Dim3 {
        self.base_local
    }

    pub fn size(&self) -> Dim3 {
        self.size
    }

    /// Rank owning the domain at `idx`.
    pub fn get_rank(&self, idx: Dim3) -> usize {
        (idx / self.gpu_dim).to_linear(self.rank_dim) as usize
    }

    /// Accelerator slot (within its rank) of the domain at `idx`.
    pub fn get_gpu(&self, idx: Dim3) -> usize {
        (idx % self.gpu_dim).to_linear(self.gpu_dim) as usize
    }

    /// Position of a rank in the rank grid.
    pub fn rank_idx(&self, rank: usize) -> Dim3 {
        debug_assert!(rank < self.ranks);
        Dim3::from_linear(rank as i64, self.rank_dim)
    }

    /// Position of an accelerator slot in the per-rank grid.
    pub fn gpu_idx(&self, gpu: usize) -> Dim3 {
        debug_assert!(gpu < self.gpus);
        Dim3::from_linear(gpu as i64, self.gpu_dim)
    }

    /// The domain index for a (rank, accelerator) pair; inverse of
    /// [`Partition::get_rank`] / [`Partition::get_gpu`].
    pub fn dom_idx(&self, rank: usize, gpu: usize) -> Dim3 {
        self.rank_idx(rank) * self.gpu_dim + self.gpu_idx(gpu)
    }

    /// Interior extent of the domain at `idx`. The remainder on each axis
    /// goes to the low-index domains, so extents sum to `size` per axis.
    pub fn local_domain_size(&self, idx: Dim3) -> Dim3 {
        let mut ret = self.base_local;
        let rem = self.size % self.dom_dim();
        if rem.x != 0 && idx.x >= rem.x {
            ret.x -= 1;
        }
        if rem.y != 0 && idx.y >= rem.y {
            ret.y -= 1;
        }
        if rem.z != 0 && idx.z >= rem.z {
            ret.z -= 1;
        }
        ret
    }

    /// Fails when the smallest subdomain has lost every cell on some axis.
    pub fn validate(&self) -> Result<(), HaloError> {
        let dims = self.dom_dim();
        let last = dims - Dim3::ONE;
        let smallest = self.local_domain_size(last);
        if smallest.any_le_zero() {
            return Err(HaloError::EmptySubdomain {
                size: self.size,
                dims,
                idx: last,
            });
        }
        Ok(())
    }
}

/// Axis whose ceiling split by `f` leaves the box closest to a cube.
/// Ties prefer x, then y, then z, in both partitioning passes.
fn split_axis(cur: Dim3, f: i64) -> usize {
    let x_split = cubeness(div_ceil(cur.x, f), cur.y, cur.z);
    let y_split = cubeness(cur.x, div_ceil(cur.y, f), cur.z);
    let z_split = cubeness(cur.x, cur.y, div_ceil(cur.z, f));
    if x_split >= y_split.max(z_split) {
        0
    } else if y_split >= z_split {
        1
    } else {
        2
    }
}
