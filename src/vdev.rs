// vim: tw=80
//! The downward interface: what a RAID-Y vdev requires of each child.
//!
//! This is deliberately narrower than the teacher's `Vdev` trait, which
//! additionally carries zone/spacemap geometry for log-structured children.
//! RAID-Y children are addressed purely by byte offset, never by zone, so
//! that machinery has no counterpart here (see DESIGN.md for the drop
//! rationale).

use divbuf::{DivBuf, DivBufShared};
use uuid::Uuid;

use crate::types::{BoxRaidyFut, ByteT};

/// One child vdev of a RAID-Y array. Offsets passed to `read`/`write` are
/// child-relative and never cross the child's own boundary.
pub trait ChildVdev: Send + Sync {
    /// This child's stable identity, persisted in the `RaidyLabel`.
    fn uuid(&self) -> Uuid;

    /// Usable size of this child, in bytes.
    fn size(&self) -> ByteT;

    /// Read `buf.len()` bytes starting at `offset`, filling `buf`.
    fn read_at(&self, buf: DivBufShared, offset: ByteT) -> BoxRaidyFut<DivBuf>;

    /// Write the contents of `buf` starting at `offset`.
    fn write_at(&self, buf: DivBuf, offset: ByteT) -> BoxRaidyFut<()>;

    /// Flush any buffered writes to stable storage (a barrier).
    fn flush(&self) -> BoxRaidyFut<()>;

    /// Close the child, releasing any held resources.
    fn close(&self) -> BoxRaidyFut<()>;
}

#[cfg(test)]
pub use mock::MockChildVdev;
