// vim: tw=80
//! The row/column mapper, Galois-field parity math, and active map: the
//! three subsystems the specification concentrates on.

pub mod activemap;
pub mod geometry;
pub mod parity;
