// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-proxy-event subscription state machine (spec.md §4.6).
//!
//! One [`SubscriptionMachine`] guards a single proxy-event's relationship to
//! its provider: whether a `Subscribe` call currently holds a transaction
//! log entry, is merely recorded as intent while the provider is offline, or
//! has never been issued. Grounded in the teacher's per-entity
//! `Mutex`-guarded state pattern (e.g. its NACK scheduler), generalized here
//! from a fixed two-state flag to the three-state table below.

use super::transaction_log::TransactionLog;
use crate::error::{Error, Result};
use crate::log_ctx;
use parking_lot::Mutex;
use std::sync::Arc;

/// Invoked once a slot-ready notification arrives while `Subscribed`.
/// Installed independently of subscription state; [`super::channel::ShmEventChannelReader`]
/// is what actually wires it to the channel's notifier, spawning (and
/// tearing down) a dedicated waiter thread as the reader enters and leaves
/// `Subscribed`.
pub type ReceiveHandler = Arc<dyn Fn() + Send + Sync>;

/// Owns a reserved [`TransactionLog`] entry for the lifetime of a live
/// subscription; releasing it (on drop, i.e. `unsubscribe` or the machine
/// itself dropping) always goes through [`TransactionLog::release`], never a
/// bare state write, so the refcount-zero/warn-on-outstanding bookkeeping in
/// §7 is never bypassed.
pub struct TransactionLogEntryHandle {
    log: Arc<TransactionLog>,
    index: usize,
}

impl TransactionLogEntryHandle {
    fn acquire(log: Arc<TransactionLog>) -> Result<Self> {
        let index = log.acquire()?;
        Ok(TransactionLogEntryHandle { log, index })
    }

    /// This handle's reserved row in the transaction log table.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for TransactionLogEntryHandle {
    fn drop(&mut self) {
        self.log.release(self.index);
    }
}

/// The state table in spec.md §4.6.
pub enum SubscriptionState {
    NotSubscribed,
    SubscriptionPending {
        max_samples: usize,
    },
    Subscribed {
        max_samples: usize,
        log_entry: TransactionLogEntryHandle,
    },
}

impl SubscriptionState {
    /// Maximum sample count recorded for this subscription, if any is active
    /// (pending or fully subscribed).
    #[must_use]
    pub fn max_samples(&self) -> Option<usize> {
        match self {
            SubscriptionState::NotSubscribed => None,
            SubscriptionState::SubscriptionPending { max_samples }
            | SubscriptionState::Subscribed { max_samples, .. } => Some(*max_samples),
        }
    }

    /// True only in the `Subscribed` state -- `GetNewSamples`/
    /// `GetNumNewSamplesAvailable` gate on exactly this.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        matches!(self, SubscriptionState::Subscribed { .. })
    }
}

/// Drives one proxy-event's [`SubscriptionState`] through `subscribe`/
/// `unsubscribe`/availability-change transitions, serialized by a single
/// `parking_lot::Mutex`.
pub struct SubscriptionMachine {
    state: Mutex<SubscriptionState>,
    log: Arc<TransactionLog>,
    receive_handler: Mutex<Option<ReceiveHandler>>,
}

impl SubscriptionMachine {
    #[must_use]
    pub fn new(log: Arc<TransactionLog>) -> Self {
        SubscriptionMachine {
            state: Mutex::new(SubscriptionState::NotSubscribed),
            log,
            receive_handler: Mutex::new(None),
        }
    }

    /// `NotSubscribed -> Subscribed` (if `offer_visible`) or
    /// `-> SubscriptionPending` (otherwise). No-op if already subscribed or
    /// pending with the caller simply re-requesting (spec.md §4.6 only
    /// defines the transition out of `NotSubscribed`; re-subscribing from an
    /// active state is treated as idempotent rather than an error, matching
    /// the teacher's generally idempotent setup calls).
    ///
    /// # Errors
    ///
    /// [`Error::MaxSubscribersExceeded`] if the transaction log has no free
    /// entry, propagated unchanged when transitioning to `Subscribed`.
    pub fn subscribe(&self, max_samples: usize, offer_visible: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, SubscriptionState::NotSubscribed) {
            return Ok(());
        }
        *state = if offer_visible {
            let log_entry = TransactionLogEntryHandle::acquire(self.log.clone())?;
            log::debug!(
                "{} subscribed, transaction log entry {}",
                log_ctx::SHM,
                log_entry.index()
            );
            SubscriptionState::Subscribed { max_samples, log_entry }
        } else {
            SubscriptionState::SubscriptionPending { max_samples }
        };
        Ok(())
    }

    /// `Subscribed -> NotSubscribed` or `SubscriptionPending -> NotSubscribed`.
    /// No-op from `NotSubscribed`.
    pub fn unsubscribe(&self) {
        let mut state = self.state.lock();
        *state = SubscriptionState::NotSubscribed;
        *self.receive_handler.lock() = None;
    }

    /// Provider availability flipped, as reported by
    /// [`crate::discovery::DiscoveryClient`]'s availability-change callback.
    /// `true` drives `SubscriptionPending -> Subscribed`; `false` drives
    /// `Subscribed -> SubscriptionPending` (covers both a graceful
    /// `StopOfferService` and a detected provider crash -- both arrive here
    /// as the same "no longer available" signal).
    pub fn on_availability_changed(&self, available: bool) {
        let mut state = self.state.lock();
        match (&*state, available) {
            (SubscriptionState::SubscriptionPending { max_samples }, true) => {
                let max_samples = *max_samples;
                match TransactionLogEntryHandle::acquire(self.log.clone()) {
                    Ok(log_entry) => {
                        *state = SubscriptionState::Subscribed { max_samples, log_entry };
                    }
                    Err(e) => {
                        log::warn!(
                            "{} could not acquire transaction log entry on availability: {e}",
                            log_ctx::SHM
                        );
                    }
                }
            }
            (SubscriptionState::Subscribed { max_samples, .. }, false) => {
                let max_samples = *max_samples;
                *state = SubscriptionState::SubscriptionPending { max_samples };
            }
            _ => {}
        }
    }

    /// Install (or replace) the handler invoked on slot-ready notifications.
    /// Callable in any state; actual wiring to the channel's notifier only
    /// takes effect once/while `Subscribed` (see
    /// [`super::channel::ShmEventChannelReader::set_receive_handler`]).
    pub fn set_receive_handler(&self, handler: ReceiveHandler) {
        *self.receive_handler.lock() = Some(handler);
    }

    /// Currently installed receive handler, if any. Read by
    /// [`super::channel::ShmEventChannelReader`] after every state
    /// transition to decide whether its notification-waiter thread should be
    /// running.
    #[must_use]
    pub fn receive_handler(&self) -> Option<ReceiveHandler> {
        self.receive_handler.lock().clone()
    }

    /// Snapshot accessor for tests and diagnostics.
    pub fn with_state<R>(&self, f: impl FnOnce(&SubscriptionState) -> R) -> R {
        f(&self.state.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OwnedLog {
        log: Arc<TransactionLog>,
        layout: Layout,
        ptr: *mut u8,
        _dir: tempfile::TempDir,
    }

    impl OwnedLog {
        fn new(capacity: usize) -> Self {
            let size = TransactionLog::byte_size(capacity);
            let layout = Layout::from_size_align(size, 64).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            let dir = tempfile::TempDir::new().unwrap();
            let lock_path = dir.path().join("txlog.lock");
            let log = unsafe { TransactionLog::from_raw(ptr, capacity, lock_path) };
            OwnedLog {
                log: Arc::new(log),
                layout,
                ptr,
                _dir: dir,
            }
        }
    }

    impl Drop for OwnedLog {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn subscribe_with_visible_offer_goes_straight_to_subscribed() {
        let owned = OwnedLog::new(2);
        let machine = SubscriptionMachine::new(owned.log.clone());
        machine.subscribe(4, true).unwrap();
        machine.with_state(|s| assert!(s.is_subscribed()));
    }

    #[test]
    fn subscribe_without_visible_offer_goes_pending() {
        let owned = OwnedLog::new(2);
        let machine = SubscriptionMachine::new(owned.log.clone());
        machine.subscribe(4, false).unwrap();
        machine.with_state(|s| {
            assert!(!s.is_subscribed());
            assert_eq!(s.max_samples(), Some(4));
        });
    }

    #[test]
    fn availability_true_promotes_pending_to_subscribed() {
        let owned = OwnedLog::new(2);
        let machine = SubscriptionMachine::new(owned.log.clone());
        machine.subscribe(4, false).unwrap();
        machine.on_availability_changed(true);
        machine.with_state(|s| assert!(s.is_subscribed()));
    }

    #[test]
    fn availability_false_demotes_subscribed_to_pending_and_keeps_max_samples() {
        let owned = OwnedLog::new(2);
        let machine = SubscriptionMachine::new(owned.log.clone());
        machine.subscribe(7, true).unwrap();
        machine.on_availability_changed(false);
        machine.with_state(|s| {
            assert!(!s.is_subscribed());
            assert_eq!(s.max_samples(), Some(7));
        });
    }

    #[test]
    fn unsubscribe_releases_transaction_log_entry() {
        let owned = OwnedLog::new(1);
        let machine = SubscriptionMachine::new(owned.log.clone());
        machine.subscribe(1, true).unwrap();
        machine.unsubscribe();
        machine.with_state(|s| assert!(matches!(s, SubscriptionState::NotSubscribed)));
        // Entry must be free again: a second machine can now acquire it.
        let machine2 = SubscriptionMachine::new(owned.log.clone());
        machine2.subscribe(1, true).unwrap();
    }

    #[test]
    fn unsubscribe_from_pending_drops_intent() {
        let owned = OwnedLog::new(1);
        let machine = SubscriptionMachine::new(owned.log.clone());
        machine.subscribe(1, false).unwrap();
        machine.unsubscribe();
        machine.with_state(|s| assert!(matches!(s, SubscriptionState::NotSubscribed)));
    }

    #[test]
    fn receive_handler_is_invoked_once_installed() {
        let owned = OwnedLog::new(1);
        let machine = SubscriptionMachine::new(owned.log.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        machine.set_receive_handler(Arc::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        machine.subscribe(1, true).unwrap();
        let handler = machine.receive_handler().unwrap();
        handler();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_when_transaction_log_full_surfaces_max_subscribers_exceeded() {
        let owned = OwnedLog::new(1);
        let other = SubscriptionMachine::new(owned.log.clone());
        other.subscribe(1, true).unwrap();

        let machine = SubscriptionMachine::new(owned.log.clone());
        let err = machine.subscribe(1, true).unwrap_err();
        assert!(matches!(err, Error::Shm(crate::transport::shm::ShmError::MaxSubscribersExceeded)));
    }
}
