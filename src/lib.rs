// vim: tw=80
//! RAID-Y: a row/column RAID vdev engine with an active-map
//! crash-consistency protocol.
//!
//! The three subsystems the design concentrates on live under [`raid`]: the
//! row/column mapper (`raid::geometry`), the active map (`raid::activemap`),
//! and Reed-Solomon parity (`raid::parity`). [`vdev_raid::VdevRaidY`] wires
//! them together into the write state machine and the open/close/recovery
//! lifecycle described in the specification. Everything else in this crate
//! (`config`, `label`, `error`, `stats`, `vdev`, `vdev_file`) is the ambient
//! stack a vdev implementation needs around that core.

pub mod config;
pub mod error;
pub mod label;
pub mod raid;
pub mod stats;
pub mod types;
pub mod util;
pub mod vdev;
pub mod vdev_file;
pub mod vdev_raid;

pub use error::{Error, Result};
pub use vdev_raid::{VdevHealth, VdevRaidY};
