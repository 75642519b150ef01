//! Typed 3-D buffers on the host, byte buffers on an accelerator.

pub mod array;
