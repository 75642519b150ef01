//! The data model: per-accelerator subdomains and the distributed view
//! that plans and drives their halo exchange.

pub mod distributed;
pub mod local;
