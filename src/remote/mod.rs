//! Client side of the client-server transaction path.

pub mod codec;
pub mod merge;
