// vim: tw=80
//! Process-wide named statistics, shared by every open `VdevRaidY` instance.
//!
//! Grounded on the original source's `raidy_stat_init`/`raidy_stat_fini`,
//! which register a single `kstat` for the whole module the first time any
//! vdev opens, and tear it down when the last one closes. Rust has no kstat
//! equivalent, so the registry is a `static` `OnceLock` guarded by a
//! refcount rather than a kernel object; the counters themselves are named
//! the same way.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    OnceLock,
};

/// Monotonically increasing 64-bit counters, one process-wide instance
/// shared by every `VdevRaidY`.
#[derive(Debug, Default)]
pub struct RaidyStats {
    pub writes: AtomicU64,
    pub partial_stripe_writes: AtomicU64,
    pub full_stripe_writes: AtomicU64,
    pub activemap_updates_on_write_start: AtomicU64,
    pub activemap_updates_on_write_done: AtomicU64,
    pub read_reconstructs: AtomicU64,
    pub activemap_flushes: AtomicU64,
    pub recovery_sweep_rows: AtomicU64,
    pub child_errors: AtomicU64,
}

macro_rules! counter_snapshot_field {
    ($self:ident, $name:ident) => {
        $self.$name.load(Ordering::Relaxed)
    };
}

impl RaidyStats {
    pub fn snapshot(&self) -> RaidyStatsSnapshot {
        RaidyStatsSnapshot {
            writes: counter_snapshot_field!(self, writes),
            partial_stripe_writes: counter_snapshot_field!(self, partial_stripe_writes),
            full_stripe_writes: counter_snapshot_field!(self, full_stripe_writes),
            activemap_updates_on_write_start: counter_snapshot_field!(
                self,
                activemap_updates_on_write_start
            ),
            activemap_updates_on_write_done: counter_snapshot_field!(
                self,
                activemap_updates_on_write_done
            ),
            read_reconstructs: counter_snapshot_field!(self, read_reconstructs),
            activemap_flushes: counter_snapshot_field!(self, activemap_flushes),
            recovery_sweep_rows: counter_snapshot_field!(self, recovery_sweep_rows),
            child_errors: counter_snapshot_field!(self, child_errors),
        }
    }
}

/// A point-in-time copy of every counter, for tests and diagnostics
/// surfaces that want a consistent (if not atomic-across-fields) view.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RaidyStatsSnapshot {
    pub writes: u64,
    pub partial_stripe_writes: u64,
    pub full_stripe_writes: u64,
    pub activemap_updates_on_write_start: u64,
    pub activemap_updates_on_write_done: u64,
    pub read_reconstructs: u64,
    pub activemap_flushes: u64,
    pub recovery_sweep_rows: u64,
    pub child_errors: u64,
}

static STATS: OnceLock<RaidyStats> = OnceLock::new();
static REFCOUNT: AtomicUsize = AtomicUsize::new(0);

/// Return the process-wide stats registry, creating it on first call.
/// Mirrors `raidy_stat_init`: the registry is created once and shared.
pub fn stats() -> &'static RaidyStats {
    STATS.get_or_init(RaidyStats::default)
}

/// Register a new user of the stats registry. Call once per `VdevRaidY`
/// open. Returns the registry so callers don't need a second lookup.
pub fn stat_init() -> &'static RaidyStats {
    REFCOUNT.fetch_add(1, Ordering::AcqRel);
    stats()
}

/// Release a user's registration. Call once per `VdevRaidY` close/drop.
/// The registry itself is never deallocated (it's a `static`), but the
/// refcount models the original's teardown-on-last-release semantics for
/// anything layered on top that wants to know whether it's the last user.
pub fn stat_fini() -> usize {
    REFCOUNT.fetch_sub(1, Ordering::AcqRel) - 1
}

/// Current number of open `VdevRaidY` instances sharing the registry.
pub fn refcount() -> usize {
    REFCOUNT.load(Ordering::Acquire)
}
