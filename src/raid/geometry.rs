// vim: tw=80
//! The row/column I/O mapper.
//!
//! Translates a logical `(offset, size)` on the vdev into a [`Map`] of
//! [`Row`]s, each holding one [`Column`] per child. Grounded directly on
//! `raidy_map_alloc`/`raidy_row_alloc`/`raidy_column_is_parity`/
//! `raidy_column_is_data` in the original source, with the column-placement
//! rule collapsed into the single modular formula `§4.1` of the expanded
//! specification resolves (no special-cased branch for `row > ndata`).

use divbuf::DivBuf;

use crate::types::{ByteT, ChildId, RowT};

/// What role a physical column plays within one row.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ColumnRole {
    /// One of the `nparity` parity columns; `0` is P, `1` is Q, `2` is R.
    Parity(u8),
    /// One of the `ndata` data columns, in ascending logical order.
    Data(usize),
}

/// Classify physical column `col` of row `abs_row`, for an array with
/// `ndata` data and `nparity` parity children.
///
/// A single modular rule: parity for row `r` occupies the `nparity`
/// columns starting at `r mod (ndata+nparity)`, wrapping; data columns
/// fill the rest in ascending logical order, starting immediately after
/// the parity block and wrapping the same way. This is exhaustively
/// tested (`t::column_cycle_is_exhaustive_and_balanced`) rather than
/// copying the original source's overlapping `row > ndata` branches.
pub fn column_role(abs_row: RowT, col: u64, ndata: u8, nparity: u8) -> ColumnRole {
    let w = ndata as u64 + nparity as u64;
    let start = abs_row % w;
    let rel = (col + w - start) % w;
    if rel < nparity as u64 {
        ColumnRole::Parity(rel as u8)
    } else {
        ColumnRole::Data((rel - nparity as u64) as usize)
    }
}

/// List every column of row `abs_row` by role, regardless of whether a
/// particular logical I/O touches it. Used by the recovery sweep (which
/// must read every data column, not just the ones a [`Map`] happened to
/// mark as participating) and by read reconstruction (which needs every
/// surviving sibling column's child index to re-read the shared parity
/// extent).
pub fn columns_for_row(
    abs_row: RowT,
    ndata: u8,
    nparity: u8,
) -> (Vec<(usize, ChildId)>, Vec<(u8, ChildId)>) {
    let w = ndata as u64 + nparity as u64;
    let mut data = Vec::with_capacity(ndata as usize);
    let mut parity = Vec::with_capacity(nparity as usize);
    for col in 0..w {
        match column_role(abs_row, col, ndata, nparity) {
            ColumnRole::Data(i) => data.push((i, col as ChildId)),
            ColumnRole::Parity(g) => parity.push((g, col as ChildId)),
        }
    }
    data.sort_unstable_by_key(|(i, _)| *i);
    parity.sort_unstable_by_key(|(g, _)| *g);
    (data, parity)
}

/// Per-row per-column state (`rc` in the specification).
#[derive(Debug)]
pub struct Column {
    /// Back-reference to the owning row, as an index into `Map::rows`.
    pub row: usize,
    /// This column's physical child index.
    pub child: ChildId,
    /// Role this column plays in its row.
    pub role: ColumnRole,
    /// Child-relative byte offset. `0` and `size == 0` together mean "not
    /// participating in this row".
    pub offset: ByteT,
    pub size: ByteT,
    /// New data (for writes) or the just-read bytes (for reads). Parity
    /// columns get this filled in by the parity-compute phase.
    pub new_buf: Option<DivBuf>,
    /// Previously-on-disk contents, read during the RMW read phase.
    pub prev_buf: Option<DivBuf>,
    /// Original (possibly bad) data kept around on the reconstruction path,
    /// in case of a later repair write-back.
    pub orig_buf: Option<DivBuf>,
    pub error: Option<crate::error::Error>,
    pub flags: ColumnFlags,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ColumnFlags {
    pub tried: bool,
    pub skipped: bool,
    pub need_orig_restore: bool,
    pub force_repair: bool,
    pub allow_repair: bool,
}

impl Column {
    fn empty(row: usize, child: ChildId, role: ColumnRole) -> Self {
        Column {
            row,
            child,
            role,
            offset: 0,
            size: 0,
            new_buf: None,
            prev_buf: None,
            orig_buf: None,
            error: None,
            flags: ColumnFlags { allow_repair: true, ..Default::default() },
        }
    }

    pub fn participates(&self) -> bool {
        self.size > 0
    }

    /// This column's logical data index (`0..ndata`). Panics on a parity
    /// column; callers only ask this of entries from `Row::data_cols`.
    pub fn data_idx(&self) -> usize {
        match self.role {
            ColumnRole::Data(i) => i,
            ColumnRole::Parity(_) => panic!("data_idx() called on a parity column"),
        }
    }

    /// This column's generator index (0=P, 1=Q, 2=R). Panics on a data
    /// column; callers only ask this of entries from `Row::parity_cols`.
    pub fn generator_idx(&self) -> u8 {
        match self.role {
            ColumnRole::Parity(g) => g,
            ColumnRole::Data(_) => panic!("generator_idx() called on a data column"),
        }
    }
}

/// Per-row state (`rr` in the specification). A row exclusively owns its
/// columns; `cols[0..firstdatacol)` are parity, `cols[firstdatacol..)` are
/// data, both in the order the column-placement rule assigns them.
#[derive(Debug)]
pub struct Row {
    /// Index of this row within its containing `Map`.
    pub row_idx: usize,
    /// Absolute row index on the vdev (`offset / (S*ndata)`).
    pub abs_row: RowT,
    pub ncols: usize,
    pub firstdatacol: usize,
    pub fullstripe: bool,
    pub missingdata: usize,
    pub missingparity: usize,
    pub done_reading: bool,
    /// Count of outstanding child I/Os for the phase currently in flight.
    /// Maintained by the caller draining this row's `FuturesUnordered`;
    /// there is exactly one task driving a given row, so a plain counter
    /// suffices (see DESIGN.md for why this isn't an `AtomicU32`).
    pub todo: u32,
    pub cols: Vec<Column>,
}

impl Row {
    pub fn parity_cols(&self) -> &[Column] {
        &self.cols[..self.firstdatacol]
    }

    pub fn parity_cols_mut(&mut self) -> &mut [Column] {
        &mut self.cols[..self.firstdatacol]
    }

    pub fn data_cols(&self) -> &[Column] {
        &self.cols[self.firstdatacol..]
    }

    pub fn data_cols_mut(&mut self) -> &mut [Column] {
        &mut self.cols[self.firstdatacol..]
    }
}

/// One logical I/O's worth of rows (`rm` in the specification). Owned by
/// the future driving the logical I/O; dropped (freeing every row and
/// column) when that future completes or is cancelled.
#[derive(Debug)]
pub struct Map {
    pub rows: Vec<Row>,
    pub ndata: u8,
    pub nparity: u8,
    pub ecksuminjected: bool,
}

/// Build the map for one logical I/O.
///
/// `payload` is `Some(buf)` for writes (the caller's data to write, of
/// exactly `size` bytes) and `None` for reads (per-column buffers are
/// allocated by the caller as it dispatches each child read, per DESIGN.md:
/// `ChildVdev::read_at` owns a fresh buffer rather than a window into a
/// shared one).
pub fn build_map(
    offset: ByteT,
    size: ByteT,
    payload: Option<&DivBuf>,
    ndata: u8,
    nparity: u8,
    stripe_size: u32,
    activemap_size: ByteT,
) -> Map {
    assert!(size > 0, "caller guarantees a non-empty I/O");
    let s = stripe_size as u64;
    let rowsize = s * ndata as u64;
    let first_row = offset / rowsize;
    let last_row = (offset + size - 1) / rowsize;
    let nrows = (last_row - first_row + 1) as usize;

    let mut rows = Vec::with_capacity(nrows);
    let mut cur_offset = offset;
    let mut remaining = size;
    let mut bufoffset: u64 = 0;

    for row_idx in 0..nrows {
        let abs_row = cur_offset / rowsize;
        let rowoffset = abs_row * rowsize;
        let rowdatasize = remaining.min(rowoffset + rowsize - cur_offset);
        let row = build_row(
            row_idx,
            abs_row,
            cur_offset,
            rowdatasize,
            payload,
            &mut bufoffset,
            ndata,
            nparity,
            s,
            activemap_size,
        );
        cur_offset += rowdatasize;
        remaining -= rowdatasize;
        rows.push(row);
    }
    assert_eq!(remaining, 0);

    Map { rows, ndata, nparity, ecksuminjected: false }
}

#[allow(clippy::too_many_arguments)]
fn build_row(
    row_idx: usize,
    abs_row: RowT,
    offset: ByteT,
    rowdatasize: ByteT,
    payload: Option<&DivBuf>,
    bufoffset: &mut ByteT,
    ndata: u8,
    nparity: u8,
    s: ByteT,
    activemap_size: ByteT,
) -> Row {
    let rowsize = s * ndata as u64;
    let w = ndata as usize + nparity as usize;
    let firstdatacol = nparity as usize;

    let mut cols: Vec<Option<Column>> = (0..w).map(|_| None).collect();
    let mut next_parity_slot = 0usize;
    let mut next_data_slot = firstdatacol;

    let mut running_offset = offset;
    let mut remaining = rowdatasize;

    for physical_col in 0..w as u64 {
        let role = column_role(abs_row, physical_col, ndata, nparity);
        match role {
            ColumnRole::Parity(_) => {
                cols[next_parity_slot] =
                    Some(Column::empty(row_idx, physical_col as ChildId, role));
                next_parity_slot += 1;
            }
            ColumnRole::Data(_) => {
                let mut col = Column::empty(row_idx, physical_col as ChildId, role);
                if remaining > 0 {
                    let within_stripe = running_offset % s;
                    let colsize = remaining.min(s - within_stripe);
                    col.offset = abs_row * s + within_stripe + activemap_size;
                    col.size = colsize;
                    if let Some(p) = payload {
                        let start = *bufoffset as usize;
                        col.new_buf = Some(p.slice(start..start + colsize as usize));
                    }
                    *bufoffset += colsize;
                    running_offset += colsize;
                    remaining -= colsize;
                }
                cols[next_data_slot] = Some(col);
                next_data_slot += 1;
            }
        }
    }
    debug_assert_eq!(next_parity_slot, firstdatacol);
    debug_assert_eq!(next_data_slot, w);

    let mut cols: Vec<Column> = cols.into_iter().map(|c| c.expect("every slot filled")).collect();

    let (paritystart, parityend) = data_extent(&cols[firstdatacol..]);
    for c in &mut cols[..firstdatacol] {
        c.offset = paritystart;
        c.size = parityend - paritystart;
    }

    let sum_data: ByteT = cols[firstdatacol..].iter().map(|c| c.size).sum();
    debug_assert_eq!(sum_data, rowdatasize);

    Row {
        row_idx,
        abs_row,
        ncols: w,
        firstdatacol,
        fullstripe: rowdatasize == rowsize,
        missingdata: 0,
        missingparity: 0,
        done_reading: false,
        todo: 0,
        cols,
    }
}

fn data_extent(data_cols: &[Column]) -> (ByteT, ByteT) {
    let mut start = ByteT::MAX;
    let mut end = 0;
    for c in data_cols {
        if c.size > 0 {
            start = start.min(c.offset);
            end = end.max(c.offset + c.size);
        }
    }
    assert!(start < end, "row has no participating data columns");
    (start, end)
}
