// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared Memory (SHM) transport for inter-process zero-copy communication.
//!
//! This module provides the LoLa binding's event transport: a fixed-size
//! slot ring shared between one producer and any number of subscribers in
//! separate processes, synchronized with futex-based wakeups.
//!
//! # Architecture
//!
//! ```text
//! +------------------+              +------------------+
//! |   Producer        |   Shared     |   Subscriber(s)  |
//! |   (Skeleton)       |   Memory     |   (Proxy)        |
//! |        |          |   (mmap)     |        |         |
//! |        v          |              |        v         |
//! |   ShmEventChannel -+--------------+-> ShmEventChannel |
//! +------------------+   Futex      +------------------+
//!                       (wake)
//! ```
//!
//! # Key Properties
//!
//! - **Zero-copy**: samples are written directly into shared memory.
//! - **Lock-free slot transitions**: a single atomic CAS per slot state
//!   change (`shm::slot`).
//! - **Cache-aligned**: all structures are 64-byte aligned to avoid false
//!   sharing.
//! - **Refcounted reclaim**: a slot only returns to `Free` once every
//!   subscriber that holds a `SamplePtr` into it has dropped it
//!   (`shm::transaction_log`).

pub mod channel;
mod futex;
mod notify;
pub mod segment;
pub mod slot;
pub mod subscription;
pub mod transaction_log;

pub use channel::{SamplePtr, ShmEventChannel, ShmEventChannelReader, ShmEventChannelWriter};
pub use futex::{futex_wait, futex_wake};
pub use notify::SlotNotify;
pub use segment::{cleanup_service_segments, cleanup_stale_segments, ShmSegment};
pub use slot::{ShmControl, ShmSlot, SlotState, SLOT_PAYLOAD_SIZE};
pub use subscription::SubscriptionState;
pub use transaction_log::{TransactionLog, TransactionLogEntry};

use std::fmt;
use std::io;

/// Default ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 256;

/// Default slot payload size (4KB).
pub const DEFAULT_SLOT_PAYLOAD_SIZE: usize = 4096;

/// Errors that can occur in SHM transport operations.
#[derive(Debug)]
pub enum ShmError {
    /// Shared memory segment creation failed
    SegmentCreate(io::Error),
    /// Shared memory segment open failed
    SegmentOpen(io::Error),
    /// Memory mapping failed
    Mmap(io::Error),
    /// Payload too large for slot
    PayloadTooLarge { size: usize, capacity: usize },
    /// No free slot is available (all outstanding refcounts non-zero)
    AllocationFailed,
    /// Data corruption detected during read
    Corruption,
    /// Invalid segment name
    InvalidName(String),
    /// Segment not found
    NotFound(String),
    /// Invalid ring capacity (must be power of 2)
    InvalidCapacity(usize),
    /// Transaction log has no free entry for a new subscriber
    MaxSubscribersExceeded,
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::PayloadTooLarge { size, capacity } => {
                write!(
                    f,
                    "payload too large: {size} bytes exceeds slot capacity {capacity}"
                )
            }
            Self::AllocationFailed => write!(f, "no free slot available"),
            Self::Corruption => write!(f, "data corruption detected during read"),
            Self::InvalidName(name) => write!(f, "invalid segment name: {name}"),
            Self::NotFound(name) => write!(f, "segment not found: {name}"),
            Self::InvalidCapacity(cap) => {
                write!(f, "invalid ring capacity: {cap} (must be power of 2)")
            }
            Self::MaxSubscribersExceeded => write!(f, "transaction log has no free entry"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for SHM operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Generate the deterministic SHM segment name for a service instance's
/// event channel: `/mwcom_svc{service_id}_inst{instance_id}_{quality}`.
///
/// This naming scheme lets a proxy reconstruct the segment name purely from
/// discovery information, with no further coordination.
#[must_use]
pub fn segment_name(service_id: u16, instance_id: u16, quality: &str) -> String {
    format!("/mwcom_svc{service_id}_inst{instance_id}_{quality}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_name() {
        let name = segment_name(42, 3, "asil-b");
        assert_eq!(name, "/mwcom_svc42_inst3_asil-b");
    }

}
