// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wakes subscribers blocked on a [`super::channel::ShmEventChannel`] once a
//! new sample is committed.
//!
//! The module this one started from bucketed many simultaneous writer GUIDs
//! across a fixed table of futex words, in its own shared memory segment, to
//! spread contention when many topics shared one notification region. This
//! crate has exactly one producer per event channel (spec.md §3) and the
//! channel already owns a single mapped segment, so the bucket table
//! collapses to one generation counter living inside that segment.

use super::futex::{futex_wait, futex_wake_all};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A shared-memory generation counter subscribers block on.
///
/// Embedded in the channel's control block so every process mapping the
/// segment sees the same word; `futex_wait`/`futex_wake_all` use the shared
/// (not `_PRIVATE`) futex calls for exactly that reason.
#[repr(C, align(64))]
pub struct SlotNotify {
    generation: AtomicU32,
    _pad: [u8; 60],
}

impl SlotNotify {
    /// Construct a fresh notifier. Only the producer does this, at segment
    /// creation time; subscribers reinterpret the same shared memory.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            _pad: [0u8; 60],
        }
    }

    /// Called after `Send` commits a slot: bumps the generation and wakes
    /// every subscriber blocked in `wait`.
    #[inline]
    pub fn notify(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        futex_wake_all(&self.generation);
    }

    /// Snapshot the current generation, to be passed back into `wait`.
    #[inline]
    pub fn snapshot(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Block until the generation differs from `snapshot`, or `timeout`
    /// elapses. Callers should re-check their own predicate (e.g. whether
    /// new samples are actually available) after this returns, since a
    /// wakeup here is a hint, not a guarantee specific to the caller.
    #[inline]
    pub fn wait(&self, snapshot: u32, timeout: Option<Duration>) {
        futex_wait(&self.generation, snapshot, timeout);
    }
}

impl Default for SlotNotify {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: SlotNotify holds only an AtomicU32 and is meant to live in shared
// memory, waited on and woken from multiple processes concurrently.
unsafe impl Send for SlotNotify {}
unsafe impl Sync for SlotNotify {}
