// vim: tw=80
//! The active map: a persistent bitmap of dirty row-extents, letting a
//! crash-interrupted partial-stripe write be re-paritized on the next open
//! instead of requiring a full-array scrub.
//!
//! One bit per extent of `ACTIVEMAP_EXTENT_BYTES` worth of rows, stored
//! identically on every child and merged (OR) across children at open, so
//! that any child that saw the bit set before a crash is believed.

use std::sync::Mutex;

use fixedbitset::FixedBitSet;

use crate::{
    error::{Error, Result},
    types::{ByteT, ExtentT, RowT},
};

/// Per-extent bookkeeping: how many in-flight writes currently touch this
/// extent, and whether the persisted (on-disk) bit is set. The two can
/// disagree transiently — `dirty_count` goes from 0 to 1 before the
/// persisted bit is flushed, and the caller is told a sync is required.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ExtentState {
    dirty_count: u32,
    persisted: bool,
}

struct Inner {
    extents: Vec<ExtentState>,
    bits: FixedBitSet,
}

/// The active map for one `VdevRaidY`. Guards its state with a single
/// `std::sync::Mutex`, never held across an `.await` — flush is performed
/// by the caller after the lock is released, per the specification's
/// concurrency note that the lock covers state and counters only.
pub struct ActiveMap {
    extent_rows: u64,
    nextents: usize,
    inner: Mutex<Inner>,
}

/// Outcome of `write_start`/`write_complete`: whether the caller must
/// flush the bitmap to every child before (write_start) or can report
/// completion only after (write_complete) the flush finishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncRequired(pub bool);

impl ActiveMap {
    /// Construct an active map covering `nrows` rows, `extent_rows` rows
    /// per persisted extent. All extents start clean.
    pub fn init(nrows: u64, extent_rows: u64) -> Self {
        assert!(extent_rows > 0);
        let nextents = nrows.div_ceil(extent_rows).max(1) as usize;
        ActiveMap {
            extent_rows,
            nextents,
            inner: Mutex::new(Inner {
                extents: vec![ExtentState::default(); nextents],
                bits: FixedBitSet::with_capacity(nextents),
            }),
        }
    }

    fn extent_of(&self, row: RowT) -> usize {
        (row / self.extent_rows) as usize
    }

    /// Bytes reserved per child for the on-disk bitmap replica: one bit
    /// per extent, rounded up to a whole byte.
    pub fn on_disk_size(&self) -> ByteT {
        self.nextents.div_ceil(8) as ByteT
    }

    /// Snapshot the persisted bitmap as a flat byte array, suitable for
    /// writing verbatim to every child. Manual bit-packing rather than
    /// reinterpreting `FixedBitSet`'s block storage, since its blocks are
    /// platform `usize`-sized and this on-disk format must be a flat byte
    /// array regardless of host word size.
    pub fn bitmap(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut out = vec![0u8; self.on_disk_size() as usize];
        for i in 0..self.nextents {
            if inner.bits.contains(i) {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        out
    }

    /// OR-merge a foreign child's bitmap replica into this one. Used at
    /// open time across every child's copy: if any child believed an
    /// extent dirty before the crash, this map believes it too.
    pub fn merge(&self, buf: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        for i in 0..self.nextents {
            let byte = buf.get(i / 8).copied().unwrap_or(0);
            if byte & (1 << (i % 8)) != 0 {
                inner.bits.insert(i);
                inner.extents[i].persisted = true;
            }
        }
    }

    /// Record that a write covering `[row_start, row_start+nrows)` is
    /// starting. Returns `SyncRequired(true)` if any touched extent's
    /// dirty counter transitioned 0→1 while its persisted bit was still
    /// clear — the caller must flush the bitmap to every child before
    /// dispatching the write.
    pub fn write_start(&self, row_start: RowT, nrows: u64) -> SyncRequired {
        let mut inner = self.inner.lock().unwrap();
        let mut needs_sync = false;
        for e in self.touched_extents(row_start, nrows) {
            let st = &mut inner.extents[e];
            st.dirty_count += 1;
            if st.dirty_count == 1 && !st.persisted {
                inner.bits.insert(e);
                st.persisted = true;
                needs_sync = true;
            }
        }
        SyncRequired(needs_sync)
    }

    /// Record that a write covering `[row_start, row_start+nrows)` has
    /// completed. When a touched extent's dirty counter drops to zero, the
    /// persisted bit is cleared in memory and `SyncRequired(true)` is
    /// returned so the caller flushes the bitmap to make that durable —
    /// mirroring `write_start`'s 0→1 reconciliation on the way down,
    /// though a clean flush is not on the data write's critical path the
    /// way a dirty flush is.
    pub fn write_complete(&self, row_start: RowT, nrows: u64) -> SyncRequired {
        let mut inner = self.inner.lock().unwrap();
        let mut needs_sync = false;
        for e in self.touched_extents(row_start, nrows) {
            let st = &mut inner.extents[e];
            assert!(st.dirty_count > 0, "write_complete with no matching write_start");
            st.dirty_count -= 1;
            if st.dirty_count == 0 && st.persisted {
                st.persisted = false;
                inner.bits.set(e, false);
                needs_sync = true;
            }
        }
        SyncRequired(needs_sync)
    }

    fn touched_extents(&self, row_start: RowT, nrows: u64) -> impl Iterator<Item = usize> {
        let first = self.extent_of(row_start);
        let last = self.extent_of(row_start + nrows.saturating_sub(1));
        first..=last
    }

    /// List the currently-dirty extents, as `(extent_id, first_row,
    /// nrows)`, for the recovery sweep to walk. Replaces the original
    /// source's `sync_rewind()`/`sync_offset()` cursor pair with a single
    /// owned snapshot, since nothing here needs to interleave iteration
    /// with concurrent mutation of the map.
    pub fn dirty_extents(&self, total_rows: u64) -> Vec<(ExtentT, RowT, u64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .bits
            .ones()
            .map(|e| {
                let first_row = e as u64 * self.extent_rows;
                let nrows = self.extent_rows.min(total_rows.saturating_sub(first_row));
                (e as ExtentT, first_row, nrows)
            })
            .collect()
    }

    /// Mark an extent clean after the recovery sweep has re-paritized
    /// every row in it. Returns true if the persisted bit was actually
    /// cleared (i.e. a flush is now needed to make that durable).
    pub fn extent_complete(&self, extent: ExtentT) -> SyncRequired {
        let mut inner = self.inner.lock().unwrap();
        let e = extent as usize;
        let st = &mut inner.extents[e];
        if st.persisted {
            st.persisted = false;
            inner.bits.set(e, false);
            SyncRequired(true)
        } else {
            SyncRequired(false)
        }
    }

    /// True if any extent is currently marked dirty.
    pub fn is_clean(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.bits.count_ones(..) == 0
    }
}

/// Validate a bitmap replica read back from a child against the extent
/// count this map expects, before merging it. A replica of the wrong
/// size indicates a label/geometry mismatch, not a simple bit flip.
pub fn validate_replica_len(map: &ActiveMap, buf: &[u8]) -> Result<()> {
    if buf.len() < map.on_disk_size() as usize {
        return Err(Error::ActivemapIOFailure {
            child: usize::MAX,
            errno: nix::errno::Errno::EINVAL,
        });
    }
    Ok(())
}
