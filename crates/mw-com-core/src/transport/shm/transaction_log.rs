// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shm-resident per-subscriber reference-count table (spec.md §3/§4.7).
//!
//! A [`ShmEventChannel`](super::channel::ShmEventChannel) does not track a
//! slot's total outstanding-reader count anywhere else: the invariant "no
//! slot is free while any transaction log entry references it" (spec.md §3)
//! is realized by summing one column of this table across every live entry
//! ([`TransactionLog::slot_refcount`]), so `Allocate`'s LRU eviction check
//! and crash recovery both read the same ground truth.
//!
//! Layout lives directly in the channel's mapped segment, following the
//! [`super::slot::ShmControl`]/[`super::slot::ShmSlot`] array, so both
//! producer and consumer processes see the identical table.

use super::{Result, ShmError, DEFAULT_RING_CAPACITY};
use crate::log_ctx;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

/// Upper bound on slots tracked per subscriber entry. Fixed so
/// `TransactionLogEntry` has a deterministic, `repr(C)` layout regardless of
/// a deployment's configured `slot_count` -- matches the crate's default
/// ring capacity, comfortably above any realistic event channel's slot
/// count.
pub const MAX_SLOTS_PER_EVENT: usize = DEFAULT_RING_CAPACITY;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Free = 0,
    SubscribeIncomplete = 1,
    Subscribed = 2,
    UnsubscribeIncomplete = 3,
}

impl EntryState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EntryState::SubscribeIncomplete,
            2 => EntryState::Subscribed,
            3 => EntryState::UnsubscribeIncomplete,
            _ => EntryState::Free,
        }
    }
}

/// One subscriber's slot in the transaction log table.
///
/// `repr(C, align(64))` so the table is a flat, deterministically-laid-out
/// array of these inside shm -- no pointers, only the implicit offset of
/// `index * size_of::<Self>()`.
#[repr(C, align(64))]
pub struct TransactionLogEntry {
    owner_pid: AtomicU32,
    state: AtomicU8,
    _pad: [u8; 3],
    refcounts: [AtomicU16; MAX_SLOTS_PER_EVENT],
}

impl TransactionLogEntry {
    fn zero_refcounts(&self) {
        for rc in &self.refcounts {
            rc.store(0, Ordering::Relaxed);
        }
    }
}

/// Process liveness check used by crash recovery:
/// `kill(pid, 0)` succeeds (or fails with `EPERM`, meaning it exists but we
/// lack permission to signal it) iff the process is still alive.
fn process_is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 sends no signal; this only probes existence/permission.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Fixed-width, shm-resident subscriber reference-count table.
///
/// Constructed over a raw pointer into an already-sized and already-zeroed
/// region of a mapped [`super::segment::ShmSegment`] (zeroed means every
/// entry starts `Free`, since `EntryState::Free == 0`).
pub struct TransactionLog {
    entries: *mut TransactionLogEntry,
    capacity: usize,
    lock_path: PathBuf,
}

// SAFETY: `entries` points into shared memory; every field access goes
// through atomics, and cross-process scan serialization is provided by the
// `.lock` sidecar file (`acquire`/crash-recovery hold it for the duration of
// their table scan).
unsafe impl Send for TransactionLog {}
unsafe impl Sync for TransactionLog {}

impl TransactionLog {
    /// Bytes a table of `capacity` entries occupies -- callers use this to
    /// size the containing segment.
    #[must_use]
    pub fn byte_size(capacity: usize) -> usize {
        capacity * std::mem::size_of::<TransactionLogEntry>()
    }

    /// Interpret the `capacity`-entry, already-zeroed region starting at
    /// `ptr` as a transaction log table.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least [`TransactionLog::byte_size`] valid,
    /// 64-byte-aligned, zero-initialized bytes that outlive this value and
    /// are not concurrently aliased by anything but other `TransactionLog`
    /// handles onto the same shm region.
    #[must_use]
    pub unsafe fn from_raw(ptr: *mut u8, capacity: usize, lock_path: PathBuf) -> Self {
        TransactionLog {
            entries: ptr.cast::<TransactionLogEntry>(),
            capacity,
            lock_path,
        }
    }

    fn entry(&self, index: usize) -> &TransactionLogEntry {
        assert!(index < self.capacity, "transaction log index out of range");
        // SAFETY: `from_raw`'s contract guarantees `capacity` valid entries.
        unsafe { &*self.entries.add(index) }
    }

    fn lock_scan(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(ShmError::SegmentCreate)?;
        file.lock_exclusive().map_err(ShmError::SegmentCreate)?;
        Ok(file)
    }

    /// Reserve a free entry for the calling process, scanning for a `Free`
    /// entry first and, failing that, for a stale entry owned by a dead
    /// process (spec.md §4.7 crash recovery). The scan is serialized across
    /// processes via the table's `.lock` sidecar file.
    ///
    /// # Errors
    ///
    /// [`crate::error::Error::MaxSubscribersExceeded`]-class
    /// [`ShmError::MaxSubscribersExceeded`] if every entry is held by a live
    /// process.
    pub fn acquire(&self) -> Result<usize> {
        let _guard = self.lock_scan()?;
        let pid = std::process::id();

        for i in 0..self.capacity {
            let e = self.entry(i);
            if e.state
                .compare_exchange(
                    EntryState::Free as u8,
                    EntryState::SubscribeIncomplete as u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                e.owner_pid.store(pid, Ordering::Relaxed);
                e.state.store(EntryState::Subscribed as u8, Ordering::Release);
                return Ok(i);
            }
        }

        for i in 0..self.capacity {
            let e = self.entry(i);
            let state = EntryState::from_u8(e.state.load(Ordering::Acquire));
            if state == EntryState::Free {
                continue;
            }
            let owner = e.owner_pid.load(Ordering::Acquire);
            if process_is_alive(owner) {
                continue;
            }

            log::warn!(
                "{} reclaiming transaction log entry {i} from dead pid {owner} (state {state:?})",
                log_ctx::TXLOG
            );
            e.zero_refcounts();
            e.owner_pid.store(pid, Ordering::Relaxed);
            e.state.store(EntryState::Subscribed as u8, Ordering::Release);
            return Ok(i);
        }

        Err(ShmError::MaxSubscribersExceeded)
    }

    /// Release an entry on a graceful `Unsubscribe`. Callers are expected to
    /// have already dropped every outstanding [`super::channel::SamplePtr`]
    /// referencing it; a nonzero refcount here is logged but not treated as
    /// fatal (crash recovery is the path that legitimately reclaims
    /// outstanding references).
    pub fn release(&self, index: usize) {
        let e = self.entry(index);
        e.state
            .store(EntryState::UnsubscribeIncomplete as u8, Ordering::Release);
        let outstanding: u32 = e.refcounts.iter().map(|rc| u32::from(rc.load(Ordering::Acquire))).sum();
        if outstanding > 0 {
            log::warn!(
                "{} releasing transaction log entry {index} with {outstanding} outstanding sample references",
                log_ctx::TXLOG
            );
        }
        e.zero_refcounts();
        e.state.store(EntryState::Free as u8, Ordering::Release);
    }

    /// Increment `index`'s reference to `slot`, called when a sample pointer
    /// into `slot` is handed to the subscriber owning `index`.
    pub fn incr_ref(&self, index: usize, slot: usize) {
        self.entry(index).refcounts[slot].fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement `index`'s reference to `slot`, called when a
    /// [`super::channel::SamplePtr`] drops.
    pub fn decr_ref(&self, index: usize, slot: usize) {
        let prev = self.entry(index).refcounts[slot].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "transaction log refcount underflow");
    }

    /// Sum of every live entry's reference to `slot` -- the ground truth
    /// `Allocate`'s LRU eviction consults before reclaiming a `Ready` slot
    /// (spec.md §3: "no slot is free while any transaction log entry
    /// references it").
    #[must_use]
    pub fn slot_refcount(&self, slot: usize) -> u32 {
        (0..self.capacity)
            .map(|i| {
                let e = self.entry(i);
                if EntryState::from_u8(e.state.load(Ordering::Acquire)) == EntryState::Free {
                    0
                } else {
                    u32::from(e.refcounts[slot].load(Ordering::Acquire))
                }
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct OwnedTable {
        log: TransactionLog,
        layout: Layout,
        ptr: *mut u8,
        _lock_dir: tempfile::TempDir,
    }

    impl OwnedTable {
        fn new(capacity: usize) -> Self {
            let size = TransactionLog::byte_size(capacity);
            let layout = Layout::from_size_align(size, 64).unwrap();
            // SAFETY: layout has nonzero size and a valid alignment.
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            let dir = tempfile::TempDir::new().unwrap();
            let lock_path = dir.path().join("txlog.lock");
            // SAFETY: ptr was just allocated zeroed with exactly `size` bytes.
            let log = unsafe { TransactionLog::from_raw(ptr, capacity, lock_path) };
            OwnedTable {
                log,
                layout,
                ptr,
                _lock_dir: dir,
            }
        }
    }

    impl Drop for OwnedTable {
        fn drop(&mut self) {
            // SAFETY: ptr/layout match the alloc_zeroed call in `new`.
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn acquire_reserves_distinct_entries() {
        let table = OwnedTable::new(4);
        let a = table.log.acquire().unwrap();
        let b = table.log.acquire().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn acquire_fails_when_table_full_of_live_owners() {
        let table = OwnedTable::new(2);
        table.log.acquire().unwrap();
        table.log.acquire().unwrap();
        assert!(matches!(table.log.acquire(), Err(ShmError::MaxSubscribersExceeded)));
    }

    #[test]
    fn release_zeroes_refcounts_and_frees_entry() {
        let table = OwnedTable::new(2);
        let idx = table.log.acquire().unwrap();
        table.log.incr_ref(idx, 3);
        assert_eq!(table.log.slot_refcount(3), 1);
        table.log.release(idx);
        assert_eq!(table.log.slot_refcount(3), 0);
        // Entry is free again and can be re-acquired.
        let reacquired = table.log.acquire().unwrap();
        assert_eq!(reacquired, idx);
    }

    #[test]
    fn crash_recovery_reclaims_dead_pid_entry_and_zeroes_refs() {
        let table = OwnedTable::new(1);
        let idx = table.log.acquire().unwrap();
        table.log.incr_ref(idx, 5);

        // Simulate the owner dying: stamp a pid guaranteed not to exist.
        table.log.entry(idx).owner_pid.store(u32::MAX - 1, Ordering::Release);
        assert_eq!(table.log.slot_refcount(5), 1);

        let recovered = table.log.acquire().unwrap();
        assert_eq!(recovered, idx);
        assert_eq!(table.log.slot_refcount(5), 0);
    }

    #[test]
    fn slot_refcount_sums_across_subscribers() {
        let table = OwnedTable::new(3);
        let a = table.log.acquire().unwrap();
        let b = table.log.acquire().unwrap();
        table.log.incr_ref(a, 0);
        table.log.incr_ref(b, 0);
        table.log.incr_ref(b, 0);
        assert_eq!(table.log.slot_refcount(0), 3);
    }
}
