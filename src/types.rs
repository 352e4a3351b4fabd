// vim: tw=80
//! Core scalar and future-alias types shared across the crate.

use std::{future::Future, pin::Pin};

use crate::error::Error;

/// A byte offset or length within a vdev's logical or a child's physical
/// address space.
pub type ByteT = u64;

/// The index of a row within a RAID-Y vdev (`offset / (S * ndata)`).
pub type RowT = u64;

/// The index of an activemap extent (`row / extent_rows`).
pub type ExtentT = u64;

/// The index of a child vdev, `0..ndisks`.
pub type ChildId = usize;

/// Every async entry point in this crate returns this alias rather than an
/// `async fn`, so that trait objects (`dyn ChildVdev`) stay object-safe
/// without depending on `async-trait`. Mirrors the teacher's `BoxVdevFut`.
pub type BoxRaidyFut<T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'static>>;

/// Default stripe size in bytes: the per-child, per-row I/O unit. A
/// fixed power of two, tunable at build time per the specification.
pub const DEFAULT_STRIPE_SIZE: u32 = 32 * 1024;

/// Size, in rows, of one activemap extent: `ACTIVEMAP_EXTENT_BYTES / S`.
/// `ACTIVEMAP_EXTENT_BYTES` is fixed at 64 MiB, matching the original
/// source's `ACTIVEMAP_EXTENT` constant.
pub const ACTIVEMAP_EXTENT_BYTES: u64 = 64 * 1024 * 1024;

/// Maximum supported parity columns (P, Q, R).
pub const MAX_NPARITY: u8 = 3;

/// The Galois-field generators for P, Q, R respectively, in the order
/// parity columns are assigned by the column-placement rule.
pub const PARITY_GENERATORS: [u8; 3] = [1, 2, 4];

/// Size of the host's label region at the front of every child, left
/// unchanged by this crate (out of scope per the specification); RAID-Y's
/// own on-disk records are placed immediately after it.
pub const VDEV_LABEL_START_SIZE: ByteT = 2 * 1024 * 1024;

/// Fixed-size on-disk slot reserved for one child's `RaidyLabel`, between
/// the host label and the activemap replica.
pub const RAIDY_LABEL_SLOT_SIZE: ByteT = 4096;
