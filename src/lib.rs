//! # stencil-halo
//!
//! stencil-halo is a distributed 3D stencil halo-exchange engine for
//! multi-rank, multi-accelerator scientific computation. A large logical 3D
//! grid is partitioned across a cluster of ranks, each owning several
//! accelerator-resident subdomains; between stencil iterations every
//! subdomain exchanges its radius-thick boundary cells with its 26 neighbors
//! (faces, edges, and corners, with periodic wrap-around). The communication
//! plan is built once and then driven repeatedly as cheaply as possible.
//!
//! ## Features
//! - Topology-aware prime-factor partitioner that keeps subdomains as cubic
//!   as possible across a two-level rank x accelerator grid
//! - Pluggable per-direction transports: direct peer-access copies, staged
//!   same-host copies, and cross-rank messaging
//! - Pluggable communication backends (serial, threaded, MPI) behind one
//!   non-blocking `Communicator` trait
//! - Exchange driver that issues sends and receives concurrently across
//!   subdomains and synchronizes the whole round
//!
//! ## Usage
//! Add `stencil-halo` as a dependency and enable features as needed:
//!
//! ```toml
//! [dependencies]
//! stencil-halo = "0.3"
//! # Optional features:
//! # features = ["mpi-support"]
//! ```
//!
//! A typical run constructs a [`domain::distributed::DistributedDomain`],
//! registers data channels, calls `realize()`, then alternates the stencil
//! kernel with `exchange()`.

pub mod comm;
pub mod domain;
pub mod grid;
pub mod halo_error;
pub mod memory;
pub mod partition;
pub mod runtime;
pub mod transport;

/// A convenient prelude importing the most-used types.
pub mod prelude {
    pub use crate::comm::{Communicator, NoComm, SharedGroup, ThreadComm, ThreadWorld, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::domain::distributed::{DataHandle, DistributedDomain};
    pub use crate::domain::local::{LocalDomain, Region};
    pub use crate::grid::dim3::Dim3;
    pub use crate::grid::direction::{DirectionMap, DIRECTIONS};
    pub use crate::halo_error::HaloError;
    pub use crate::memory::array::{DeviceArray, HostArray};
    pub use crate::partition::Partition;
    pub use crate::runtime::{AllocMode, DeviceRuntime};
    pub use crate::transport::TransportKind;
}
