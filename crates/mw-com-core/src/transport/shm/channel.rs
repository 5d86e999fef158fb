// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The shared-memory event channel: one producer, any number of
//! subscribers, zero-copy (spec.md §3/§4.5).
//!
//! A channel's segment lays out, back to back: the [`ShmControl`] header,
//! the `ShmSlot` ring, a [`SlotNotify`] generation counter, and the
//! [`TransactionLog`] table -- one mapped region, one name, so a subscriber
//! reconstructs everything purely from the deployment's `capacity`/
//! `max_subscribers` and the discovery-derived segment name, with no further
//! coordination (matching [`super::segment_name`]'s doc comment).

use super::notify::SlotNotify;
use super::segment::ShmSegment;
use super::slot::{ShmControl, ShmSlot, SlotState, SLOT_PAYLOAD_SIZE};
use super::subscription::{ReceiveHandler, SubscriptionMachine, SubscriptionState};
use super::transaction_log::TransactionLog;
use super::{Result as ShmResult, ShmError};
use crate::error::{Error, Result};
use crate::log_ctx;
use parking_lot::Mutex as PlMutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct Layout {
    slots_off: usize,
    notify_off: usize,
    txlog_off: usize,
    total: usize,
}

fn compute_layout(capacity: usize, max_subscribers: usize) -> Layout {
    let slots_off = std::mem::size_of::<ShmControl>();
    let notify_off = slots_off + capacity * std::mem::size_of::<ShmSlot>();
    let txlog_off = notify_off + std::mem::size_of::<SlotNotify>();
    let total = txlog_off + TransactionLog::byte_size(max_subscribers);
    Layout { slots_off, notify_off, txlog_off, total }
}

fn lock_path_for(segment_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-txlog.lock", segment_name.trim_start_matches('/')))
}

/// The mapped segment and the handful of typed views into it, shared by a
/// writer and every reader that opens the same name. Internal plumbing --
/// public only so [`ShmEventChannelWriter`]/[`ShmEventChannelReader`] can
/// name the `Arc<ShmEventChannel>` they wrap; all actual operations go
/// through those two handles.
pub struct ShmEventChannel {
    segment: ShmSegment,
    capacity: usize,
    ctrl_ptr: *const ShmControl,
    slots_ptr: *const ShmSlot,
    notify_ptr: *const SlotNotify,
    log: Arc<TransactionLog>,
}

// SAFETY: every field past `segment` is a raw pointer into that same mapped,
// shared-memory region; all access goes through the atomics `ShmControl`/
// `ShmSlot`/`SlotNotify`/`TransactionLog` already provide.
unsafe impl Send for ShmEventChannel {}
unsafe impl Sync for ShmEventChannel {}

impl ShmEventChannel {
    fn ctrl(&self) -> &ShmControl {
        // SAFETY: ctrl_ptr was derived from the segment's base pointer at
        // construction and the segment outlives this reference.
        unsafe { &*self.ctrl_ptr }
    }

    fn slot(&self, index: usize) -> &ShmSlot {
        assert!(index < self.capacity, "slot index out of range");
        // SAFETY: slots_ptr points to `capacity` contiguous `ShmSlot`s.
        unsafe { &*self.slots_ptr.add(index) }
    }

    fn notify(&self) -> &SlotNotify {
        // SAFETY: notify_ptr was derived from the segment's base pointer.
        unsafe { &*self.notify_ptr }
    }
}

/// Producer/skeleton side: allocates and publishes samples.
pub struct ShmEventChannelWriter {
    channel: Arc<ShmEventChannel>,
}

impl ShmEventChannelWriter {
    /// Create a fresh channel segment sized for `capacity` slots and
    /// `max_subscribers` concurrent subscriptions.
    ///
    /// # Errors
    ///
    /// Propagates segment creation/mapping failures.
    pub fn create(
        service_id: u16,
        instance_id: u16,
        quality: &str,
        capacity: usize,
        max_subscribers: usize,
    ) -> ShmResult<Self> {
        let name = super::segment_name(service_id, instance_id, quality);
        let layout = compute_layout(capacity, max_subscribers);
        let segment = ShmSegment::create(&name, layout.total)?;

        let ctrl = ShmControl::new(capacity as u32, SLOT_PAYLOAD_SIZE as u32, max_subscribers as u32);
        // SAFETY: segment was just created with exactly `layout.total` zeroed
        // bytes; the control header fits at offset 0 and nothing else has
        // observed this segment yet.
        unsafe {
            std::ptr::write(segment.as_ptr().cast::<ShmControl>(), ctrl);
        }
        // The slot array, `SlotNotify`, and transaction log table are all
        // valid in their zeroed state already (`Free`/generation-0/`Free`
        // respectively), since `ShmSegment::create` zero-initializes the
        // whole region.

        let channel = Self::attach(segment, capacity, max_subscribers, &name)?;
        Ok(ShmEventChannelWriter { channel })
    }

    fn attach(
        segment: ShmSegment,
        capacity: usize,
        max_subscribers: usize,
        name: &str,
    ) -> ShmResult<Arc<ShmEventChannel>> {
        let layout = compute_layout(capacity, max_subscribers);
        let base = segment.as_ptr();
        let ctrl_ptr = base.cast::<ShmControl>().cast_const();
        // SAFETY: offsets computed by `compute_layout` match how the segment
        // was sized; each region is 64-byte aligned since every preceding
        // region's size is itself a multiple of 64.
        let slots_ptr = unsafe { base.add(layout.slots_off).cast::<ShmSlot>().cast_const() };
        let notify_ptr = unsafe { base.add(layout.notify_off).cast::<SlotNotify>().cast_const() };
        let log = Arc::new(unsafe {
            TransactionLog::from_raw(base.add(layout.txlog_off), max_subscribers, lock_path_for(name))
        });

        Ok(Arc::new(ShmEventChannel {
            segment,
            capacity,
            ctrl_ptr,
            slots_ptr,
            notify_ptr,
            log,
        }))
    }

    /// Reserve a slot for writing: a `Free` slot if one exists, else the
    /// oldest `Ready` slot with zero outstanding subscriber references
    /// (LRU). Never blocks.
    ///
    /// # Errors
    ///
    /// [`ShmError::AllocationFailed`] if every slot is `Ready` with at least
    /// one outstanding reference.
    pub fn allocate(&self) -> ShmResult<usize> {
        for i in 0..self.channel.capacity {
            if self.channel.slot(i).try_mark_writing() {
                return Ok(i);
            }
        }

        let mut oldest: Option<(usize, u64)> = None;
        for i in 0..self.channel.capacity {
            let Some(ts) = self.channel.slot(i).ready_ts() else {
                continue;
            };
            if self.channel.log.slot_refcount(i) > 0 {
                continue;
            }
            let is_older = match oldest {
                Some((_, best_ts)) => ts < best_ts,
                None => true,
            };
            if is_older {
                oldest = Some((i, ts));
            }
        }

        if let Some((i, ts)) = oldest {
            if self.channel.slot(i).try_evict(ts) {
                return Ok(i);
            }
        }

        Err(ShmError::AllocationFailed)
    }

    /// Copy `data` into `slot` and publish it: `Writing -> Ready(ts)` with
    /// `ts` drawn from the channel's monotonic producer counter, then wake
    /// any subscriber blocked on new samples.
    ///
    /// # Errors
    ///
    /// [`ShmError::PayloadTooLarge`] if `data` exceeds the per-slot capacity.
    pub fn send(&self, slot: usize, data: &[u8]) -> ShmResult<()> {
        if data.len() > SLOT_PAYLOAD_SIZE {
            return Err(ShmError::PayloadTooLarge {
                size: data.len(),
                capacity: SLOT_PAYLOAD_SIZE,
            });
        }

        let s = self.channel.slot(slot);
        // SAFETY: `slot` was returned by `allocate` and is currently
        // `Writing`, so no reader observes the payload until `commit` below
        // performs its Release store.
        unsafe {
            (*s.payload.get())[..data.len()].copy_from_slice(data);
        }
        s.len.store(data.len() as u32, Ordering::Release);

        let ts = self.channel.ctrl().next_timestamp();
        s.commit(ts);
        self.channel.notify().notify();
        Ok(())
    }

    /// Segment name this writer publishes under.
    #[must_use]
    pub fn segment_name(&self) -> &str {
        self.channel.segment.name()
    }

    /// Unlink the backing segment. Only the producer should call this, once
    /// it is done publishing (mirrors [`ShmSegment`]'s "creator unlinks"
    /// contract).
    pub fn unlink(self) {
        let _ = ShmSegment::unlink(self.channel.segment.name());
    }
}

/// Background thread driving an installed [`ReceiveHandler`] off the
/// channel's [`SlotNotify`] generation counter, running only while its
/// reader is `Subscribed` and a handler is installed.
struct ReceiveWaiter {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Proxy/consumer side: owns a [`SubscriptionMachine`] and tracks which
/// samples it has already delivered.
pub struct ShmEventChannelReader {
    channel: Arc<ShmEventChannel>,
    machine: SubscriptionMachine,
    last_seen_ts: AtomicU64,
    waiter: PlMutex<Option<ReceiveWaiter>>,
}

impl ShmEventChannelReader {
    /// Open an already-published channel. `capacity`/`max_subscribers` must
    /// match the values the writer was created with -- both sides get them
    /// from the same `ServiceInstanceDeployment` (spec.md §2).
    ///
    /// # Errors
    ///
    /// [`ShmError::NotFound`] if no writer has created the segment yet.
    pub fn open(
        service_id: u16,
        instance_id: u16,
        quality: &str,
        capacity: usize,
        max_subscribers: usize,
    ) -> ShmResult<Self> {
        let name = super::segment_name(service_id, instance_id, quality);
        let layout = compute_layout(capacity, max_subscribers);
        let segment = ShmSegment::open(&name, layout.total)?;
        if !(unsafe { &*segment.as_ptr().cast::<ShmControl>() }).validate() {
            return Err(ShmError::Corruption);
        }
        let channel = ShmEventChannelWriter::attach(segment, capacity, max_subscribers, &name)?;
        let log = channel.log.clone();
        Ok(ShmEventChannelReader {
            channel,
            machine: SubscriptionMachine::new(log),
            last_seen_ts: AtomicU64::new(0),
            waiter: PlMutex::new(None),
        })
    }

    /// See [`SubscriptionMachine::subscribe`]. Entry into `Subscribed` spawns
    /// the notification-waiter thread if a receive handler is already
    /// installed (spec.md §4.6: wiring to slot-ready notifications happens
    /// on entry into `Subscribed`).
    ///
    /// # Errors
    ///
    /// Propagates [`Error::MaxSubscribersExceeded`]-class failures from the
    /// transaction log.
    pub fn subscribe(&self, max_samples: usize, offer_visible: bool) -> Result<()> {
        self.machine.subscribe(max_samples, offer_visible)?;
        self.sync_receive_waiter();
        Ok(())
    }

    /// See [`SubscriptionMachine::unsubscribe`]. Tears down the
    /// notification-waiter thread, if one was running.
    pub fn unsubscribe(&self) {
        self.machine.unsubscribe();
        self.sync_receive_waiter();
    }

    /// See [`SubscriptionMachine::on_availability_changed`]. Starts or stops
    /// the notification-waiter thread to match the resulting state.
    pub fn on_availability_changed(&self, available: bool) {
        self.machine.on_availability_changed(available);
        self.sync_receive_waiter();
    }

    /// See [`SubscriptionMachine::set_receive_handler`]. If this reader is
    /// already `Subscribed`, starts the notification-waiter thread
    /// immediately rather than waiting for the next state transition.
    pub fn set_receive_handler(&self, handler: ReceiveHandler) {
        self.machine.set_receive_handler(handler);
        self.sync_receive_waiter();
    }

    /// Block until the channel's generation counter advances, or `timeout`
    /// elapses. Callers should re-check `get_num_new_samples_available`
    /// after this returns.
    ///
    /// A synchronous alternative to [`Self::set_receive_handler`]'s push
    /// callback: this blocks the calling thread directly on the channel's
    /// notifier instead of running a handler on a background thread. The two
    /// styles are independent -- a reader may poll with this and never
    /// install a handler at all.
    pub fn wait_for_samples(&self, timeout: Option<Duration>) {
        let snapshot = self.channel.notify().snapshot();
        self.channel.notify().wait(snapshot, timeout);
    }

    /// Start or stop the background waiter thread that drives the installed
    /// [`ReceiveHandler`] on every slot-ready notification, matching the
    /// current state: running only while `Subscribed` with a handler
    /// installed, torn down otherwise.
    fn sync_receive_waiter(&self) {
        let handler = self.machine.receive_handler();
        let should_run =
            handler.is_some() && self.machine.with_state(SubscriptionState::is_subscribed);

        let mut waiter = self.waiter.lock();
        match (should_run, waiter.is_some()) {
            (true, false) => {
                let handler = handler.expect("should_run implies handler.is_some()");
                let shutdown = Arc::new(AtomicBool::new(false));
                let thread_shutdown = shutdown.clone();
                let channel = self.channel.clone();
                let handle = std::thread::Builder::new()
                    .name("mw-com-recv-waiter".into())
                    .spawn(move || {
                        let mut seen = channel.notify().snapshot();
                        while !thread_shutdown.load(Ordering::Acquire) {
                            channel.notify().wait(seen, Some(Duration::from_millis(200)));
                            if thread_shutdown.load(Ordering::Acquire) {
                                break;
                            }
                            let current = channel.notify().snapshot();
                            if current != seen {
                                seen = current;
                                handler();
                            }
                        }
                    })
                    .expect("spawning the receive-waiter thread");
                *waiter = Some(ReceiveWaiter { shutdown, handle });
            }
            (false, true) => {
                stop_waiter(waiter.take());
            }
            _ => {}
        }
    }

    fn require_subscribed(&self) -> Result<()> {
        if self.machine.with_state(SubscriptionState::is_subscribed) {
            Ok(())
        } else {
            Err(Error::NotSubscribed)
        }
    }

    /// Count of committed samples newer than the last delivered one.
    ///
    /// # Errors
    ///
    /// [`Error::NotSubscribed`] outside the `Subscribed` state.
    pub fn get_num_new_samples_available(&self) -> Result<usize> {
        self.require_subscribed()?;
        let last_seen = self.last_seen_ts.load(Ordering::Acquire);
        Ok((0..self.channel.capacity)
            .filter(|&i| matches!(self.channel.slot(i).state(), SlotState::Ready(ts) if ts > last_seen))
            .count())
    }

    /// Deliver up to `max` new samples, ascending by publish timestamp.
    /// Each returned [`SamplePtr`] holds a transaction-log reference that
    /// keeps its slot from being reclaimed until dropped.
    ///
    /// # Errors
    ///
    /// [`Error::NotSubscribed`] outside the `Subscribed` state.
    pub fn get_new_samples(&self, max: usize) -> Result<Vec<SamplePtr>> {
        self.require_subscribed()?;
        let log_index = self
            .machine
            .with_state(|s| match s {
                SubscriptionState::Subscribed { log_entry, .. } => Some(log_entry.index()),
                _ => None,
            })
            .ok_or(Error::NotSubscribed)?;

        let last_seen = self.last_seen_ts.load(Ordering::Acquire);
        let mut ready: Vec<(u64, usize)> = (0..self.channel.capacity)
            .filter_map(|i| match self.channel.slot(i).state() {
                SlotState::Ready(ts) if ts > last_seen => Some((ts, i)),
                _ => None,
            })
            .collect();
        ready.sort_unstable_by_key(|&(ts, _)| ts);
        ready.truncate(max);

        let mut new_last = last_seen;
        let mut out = Vec::with_capacity(ready.len());
        for (ts, slot_index) in ready {
            self.channel.log.incr_ref(log_index, slot_index);
            out.push(SamplePtr {
                channel: self.channel.clone(),
                log_index,
                slot_index,
                ts,
            });
            new_last = new_last.max(ts);
        }
        self.last_seen_ts.store(new_last, Ordering::Release);
        Ok(out)
    }
}

impl Drop for ShmEventChannelReader {
    fn drop(&mut self) {
        stop_waiter(self.waiter.lock().take());
    }
}

/// Signal `waiter`'s thread to stop and join it. The thread checks the
/// shutdown flag at most every 200ms (its `SlotNotify::wait` timeout), so
/// this blocks the caller for up to that long in the worst case.
fn stop_waiter(waiter: Option<ReceiveWaiter>) {
    let Some(waiter) = waiter else { return };
    waiter.shutdown.store(true, Ordering::Release);
    if waiter.handle.join().is_err() {
        log::warn!("{} receive-waiter thread panicked", log_ctx::SHM);
    }
}

/// An owning handle to one delivered sample. Dropping it releases the
/// transaction-log reference that was keeping the slot from being reclaimed.
pub struct SamplePtr {
    channel: Arc<ShmEventChannel>,
    log_index: usize,
    slot_index: usize,
    ts: u64,
}

impl SamplePtr {
    /// The sample's bytes, valid for as long as this `SamplePtr` lives.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let slot = self.channel.slot(self.slot_index);
        let len = slot.len.load(Ordering::Acquire) as usize;
        // SAFETY: the slot was `Ready` when this pointer was created and the
        // held transaction-log reference prevents `Allocate` from evicting
        // it out from under us.
        unsafe { &(*slot.payload.get())[..len] }
    }

    /// Publish timestamp of this sample.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.ts
    }
}

impl Drop for SamplePtr {
    fn drop(&mut self) {
        self.channel.log.decr_ref(self.log_index, self.slot_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_ids() -> (u16, u16) {
        use std::sync::atomic::{AtomicU16, Ordering as O};
        static NEXT: AtomicU16 = AtomicU16::new(1);
        (NEXT.fetch_add(1, O::SeqCst), 0)
    }

    #[test]
    fn receive_handler_fires_on_send_after_subscribe() {
        use std::sync::atomic::AtomicUsize;
        use std::time::{Duration, Instant};

        let (service_id, instance_id) = unique_ids();
        let writer = ShmEventChannelWriter::create(service_id, instance_id, "asil-qm", 4, 2).unwrap();
        let reader = ShmEventChannelReader::open(service_id, instance_id, "asil-qm", 4, 2).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        reader.set_receive_handler(Arc::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        reader.subscribe(4, true).unwrap();
        assert!(reader.waiter.lock().is_some(), "waiter thread must be running while subscribed");

        let slot = writer.allocate().unwrap();
        writer.send(slot, b"hello").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        reader.unsubscribe();
        assert!(reader.waiter.lock().is_none(), "waiter thread must stop once unsubscribed");
        writer.unlink();
    }

    #[test]
    fn receive_handler_installed_after_subscribe_starts_waiter_immediately() {
        let (service_id, instance_id) = unique_ids();
        let writer = ShmEventChannelWriter::create(service_id, instance_id, "asil-qm", 4, 2).unwrap();
        let reader = ShmEventChannelReader::open(service_id, instance_id, "asil-qm", 4, 2).unwrap();

        reader.subscribe(4, true).unwrap();
        assert!(reader.waiter.lock().is_none(), "no handler installed yet");

        reader.set_receive_handler(Arc::new(|| {}));
        assert!(reader.waiter.lock().is_some(), "installing a handler while subscribed starts the waiter");

        writer.unlink();
    }

    #[test]
    fn send_then_subscribe_then_get_new_samples_sees_it() {
        let (service_id, instance_id) = unique_ids();
        let writer = ShmEventChannelWriter::create(service_id, instance_id, "asil-qm", 4, 2).unwrap();
        let slot = writer.allocate().unwrap();
        writer.send(slot, b"hello").unwrap();

        let reader = ShmEventChannelReader::open(service_id, instance_id, "asil-qm", 4, 2).unwrap();
        reader.subscribe(4, true).unwrap();

        assert_eq!(reader.get_num_new_samples_available().unwrap(), 1);
        let samples = reader.get_new_samples(10).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].as_bytes(), b"hello");

        assert_eq!(reader.get_num_new_samples_available().unwrap(), 0);
        writer.unlink();
    }

    #[test]
    fn get_new_samples_outside_subscribed_state_errors() {
        let (service_id, instance_id) = unique_ids();
        let writer = ShmEventChannelWriter::create(service_id, instance_id, "asil-qm", 4, 2).unwrap();
        let reader = ShmEventChannelReader::open(service_id, instance_id, "asil-qm", 4, 2).unwrap();

        assert!(matches!(
            reader.get_new_samples(1),
            Err(Error::NotSubscribed)
        ));
        assert!(matches!(
            reader.get_num_new_samples_available(),
            Err(Error::NotSubscribed)
        ));
        writer.unlink();
    }

    #[test]
    fn allocate_exhausts_then_recovers_after_drop() {
        let (service_id, instance_id) = unique_ids();
        let writer = ShmEventChannelWriter::create(service_id, instance_id, "asil-qm", 2, 2).unwrap();
        let reader = ShmEventChannelReader::open(service_id, instance_id, "asil-qm", 2, 2).unwrap();
        reader.subscribe(2, true).unwrap();

        let s0 = writer.allocate().unwrap();
        writer.send(s0, b"a").unwrap();
        let s1 = writer.allocate().unwrap();
        writer.send(s1, b"b").unwrap();

        // Both slots are Ready and held by the subscriber once delivered.
        let samples = reader.get_new_samples(10).unwrap();
        assert_eq!(samples.len(), 2);

        // No free slot, and both outstanding Ready slots are referenced.
        assert!(matches!(writer.allocate(), Err(ShmError::AllocationFailed)));

        drop(samples);
        // Now eviction should succeed (refcounts dropped to zero).
        assert!(writer.allocate().is_ok());
        writer.unlink();
    }

    #[test]
    fn unsubscribe_then_resubscribe_starts_from_current_samples() {
        let (service_id, instance_id) = unique_ids();
        let writer = ShmEventChannelWriter::create(service_id, instance_id, "asil-qm", 4, 2).unwrap();
        let reader = ShmEventChannelReader::open(service_id, instance_id, "asil-qm", 4, 2).unwrap();
        reader.subscribe(4, true).unwrap();

        let slot = writer.allocate().unwrap();
        writer.send(slot, b"x").unwrap();
        let _ = reader.get_new_samples(10).unwrap();

        reader.unsubscribe();
        assert!(matches!(
            reader.get_new_samples(1),
            Err(Error::NotSubscribed)
        ));

        reader.subscribe(4, true).unwrap();
        assert_eq!(reader.get_num_new_samples_available().unwrap(), 0);
        writer.unlink();
    }
}
