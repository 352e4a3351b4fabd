// vim: tw=80
//! The error taxonomy for the RAID-Y core.
//!
//! Every fallible operation in this crate returns [`Error`]. Child I/O
//! errors are classified into [`Error::ChildTransient`] /
//! [`Error::ChildPermanent`] at the point they cross the `ChildVdev`
//! boundary (see [`Error::from_child_io`]), so that everything above that
//! boundary only ever reasons about the taxonomy, never raw `nix`/`io`
//! errors.

use nix::errno::Errno;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// A single child reported a transient error (ESTALE, EIO, ...). The
    /// column is marked and the row may still complete if the total error
    /// count does not exceed `nparity`.
    #[error("child {child} reported a transient error: {errno}")]
    ChildTransient { child: usize, errno: Errno },

    /// A child is permanently unavailable (ENXIO, or the device is simply
    /// missing). The mapper treats this identically to `ChildTransient`,
    /// marking the column `skipped`.
    #[error("child {child} is permanently unavailable: {errno}")]
    ChildPermanent { child: usize, errno: Errno },

    /// Parity recomputed from data disagreed with the parity read from
    /// disk for the named column.
    #[error("checksum mismatch reconstructing column {child} of row {row}")]
    ChecksumMismatch { row: u64, child: usize },

    /// More columns were missing or mismatched in a row than `nparity` can
    /// repair.
    #[error("row {row} is unrecoverable: {missing} columns missing, nparity={nparity}")]
    Unrecoverable { row: u64, missing: usize, nparity: u8 },

    /// The vdev configuration is invalid: bad `nparity`, too few children,
    /// or an on-disk label mismatch.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// An activemap write failed on some (but not necessarily all)
    /// children. The map is still considered persisted as long as at least
    /// one child's write succeeded.
    #[error("activemap I/O failed on child {child}: {errno}")]
    ActivemapIOFailure { child: usize, errno: Errno },

    /// Every child's activemap write failed; the logical I/O cannot
    /// proceed.
    #[error("activemap I/O failed on every child")]
    ActivemapUnpersisted,

    /// The vdev cannot be opened because too many children are faulted.
    #[error("cannot open: {faulted} of {total} children faulted, nparity={nparity}")]
    CantOpenNoReplicas { faulted: usize, total: usize, nparity: u8 },
}

impl Error {
    /// Rank used to aggregate a "worst of" error across columns, rows, and
    /// ultimately the logical I/O. Higher is worse. The taxonomy has no
    /// natural total order otherwise, so this is an explicit mapping rather
    /// than a derived `Ord`.
    pub fn severity(&self) -> u8 {
        match self {
            Error::ChildTransient { .. } => 1,
            Error::ChildPermanent { .. } => 2,
            Error::ActivemapIOFailure { .. } => 2,
            Error::ChecksumMismatch { .. } => 3,
            Error::ActivemapUnpersisted => 4,
            Error::Unrecoverable { .. } => 5,
            Error::CantOpenNoReplicas { .. } => 6,
            Error::ConfigurationInvalid(_) => 6,
        }
    }

    /// Fold `other` into `self`, keeping whichever is worse. Used to
    /// aggregate per-child errors up to a row, and per-row errors up to a
    /// logical I/O.
    pub fn worst(self, other: Error) -> Error {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Classify a raw child I/O errno into the taxonomy.
    pub fn from_child_io(child: usize, errno: Errno) -> Error {
        match errno {
            Errno::ENXIO | Errno::ENODEV => Error::ChildPermanent { child, errno },
            _ => Error::ChildTransient { child, errno },
        }
    }
}

/// Fold an iterator of child-I/O results into a single worst-case `Error`,
/// or `Ok(())` if every result was `Ok`. Used by row completion to turn a
/// `FuturesUnordered` of per-column outcomes into the row's own error.
pub fn fold_worst<I>(results: I) -> Result<()>
where
    I: IntoIterator<Item = Result<()>>,
{
    let mut worst: Option<Error> = None;
    for r in results {
        if let Err(e) = r {
            worst = Some(match worst {
                Some(w) => w.worst(e),
                None => e,
            });
        }
    }
    match worst {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
