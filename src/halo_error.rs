//! HaloError: unified error type for the halo-exchange engine public APIs.
//!
//! Construction and `realize()` may fail; once `realize()` has returned, the
//! steady-state `exchange()` only fails when a transport reports hard
//! failure. Nothing is retried at this layer.

use thiserror::Error;

use crate::grid::dim3::Dim3;

/// Unified error type for halo-exchange operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HaloError {
    /// A domain size with a zero or negative axis.
    #[error("domain size {0} is invalid; every axis must be at least 1")]
    InvalidSize(Dim3),
    /// `set_radius(0)`, or `realize()` without a radius.
    #[error("stencil radius must be at least 1")]
    InvalidRadius,
    /// A rank or accelerator count below 1.
    #[error("{what} count must be at least 1 (got {got})")]
    InvalidWorkerCount { what: &'static str, got: usize },
    /// A limit baked into the message-tag encoding was exceeded.
    #[error("{what} exceeds the supported maximum of {max} (got {got})")]
    Unsupported {
        what: &'static str,
        max: usize,
        got: usize,
    },
    /// `register_data` after `realize()`.
    #[error("data channel registered after realize()")]
    RegisterAfterRealize,
    /// `realize()` or `set_radius()` on an already-realized domain.
    #[error("domain is already realized")]
    AlreadyRealized,
    /// `exchange()` before `realize()`.
    #[error("exchange() called before realize()")]
    NotRealized,
    /// A device id outside the runtime's device range.
    #[error("device {device} is not present (device count {count})")]
    InvalidDevice { device: usize, count: usize },
    /// An accelerator allocation failure.
    #[error("allocation of {bytes} bytes on device {device} failed")]
    Allocation { device: usize, bytes: usize },
    /// Peer-access enable returned an unclassified error.
    #[error("enabling peer access {src} -> {dst} failed")]
    PeerAccess { src: usize, dst: usize },
    /// A device memory access outside any live allocation.
    #[error("device memory access error: {0}")]
    Memory(String),
    /// The partition leaves some subdomain without cells on an axis.
    #[error("partitioning {size} into {dims} domains leaves domain {idx} empty")]
    EmptySubdomain { size: Dim3, dims: Dim3, idx: Dim3 },
    /// A halo thicker than the thinnest subdomain cannot be filled by one
    /// neighbor exchange.
    #[error("stencil radius {radius} exceeds the smallest subdomain extent {extent}")]
    RadiusExceedsSubdomain { radius: usize, extent: i64 },
    /// Failure inside messaging send/recv/wait.
    #[error("transport failure with rank {peer}: {reason}")]
    Transport { peer: usize, reason: String },
}
