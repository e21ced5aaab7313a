//! Framed JSON messaging over TCP.

pub mod node;
pub mod transport;
