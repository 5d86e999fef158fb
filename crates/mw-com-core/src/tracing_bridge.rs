// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bookkeeping side of the trace-point bridge (spec.md §4.8/§6).
//!
//! Grounded in `original_source/mw/com/impl/bindings/lola/tracing/tracing_runtime.cpp`
//! and `trace_point_key.h`. The tracing daemon itself is an opaque external
//! collaborator (spec.md §1 Non-goal: modeled only as a callback sink,
//! [`TraceSink`]); what lives here is everything the binding owns regardless
//! of which sink is plugged in: a bounded `TraceContextId -> SamplePtr` slot
//! table and the registration/done-callback plumbing around it.

use crate::log_ctx;
use crate::transport::shm::SamplePtr;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Identifies one in-flight trace-point hand-off to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceContextId(u32);

impl TraceContextId {
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A failure from the external trace sink. Never fatal -- callers log and
/// move on (spec.md §7).
#[derive(Debug)]
pub struct TraceSinkError(pub String);

impl fmt::Display for TraceSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace sink error: {}", self.0)
    }
}

impl std::error::Error for TraceSinkError {}

/// The tracing daemon's interface, as seen by this binding. Deliberately
/// opaque: this crate never implements a concrete sink, only drives one
/// (spec.md §1 Non-goal).
pub trait TraceSink: Send + Sync {
    /// Register this process as a tracing client.
    fn register_client(&self, client_name: &str);
    /// Announce a shm segment the sink may need to map to read traced
    /// samples out of.
    fn register_shm_object(&self, segment_name: &str);
    /// Retract a previously-registered shm segment.
    fn unregister_shm_object(&self, segment_name: &str);
    /// Install the callback the sink invokes once it is done reading a
    /// traced sample, so its `TraceContextId` slot can be released. Called
    /// exactly once, by [`TracingBridge::new`].
    fn register_trace_done_cb(&self, callback: Arc<dyn Fn(TraceContextId) + Send + Sync>);
    /// Hand a sample off to the sink for asynchronous consumption.
    ///
    /// # Errors
    ///
    /// Any sink-side failure; the bridge logs and discards it.
    fn trace(
        &self,
        client: &str,
        meta: &str,
        data: &[u8],
        context_id: TraceContextId,
    ) -> Result<(), TraceSinkError>;
}

/// Drives one [`TraceSink`]: owns the bounded slot table that keeps a traced
/// sample's transaction-log reference alive until the sink signals it is
/// done with it, and the allow-list of elements tracing is enabled for.
pub struct TracingBridge {
    sink: Arc<dyn TraceSink>,
    slots: Vec<Mutex<Option<SamplePtr>>>,
    next_context_id: AtomicU32,
    enabled: HashSet<crate::identity::ElementFqId>,
}

impl TracingBridge {
    /// Construct a bridge with `traced_element_count` pre-allocated trace
    /// context slots (one per service element the loaded configuration
    /// marks as traced with a done-callback, spec.md §9) and `enabled` as
    /// the allow-list of elements tracing actually fires for
    /// (`TracingFilterConfig`-style, `tracing_filter_config.h`).
    ///
    /// Registers this bridge's own done-callback with `sink` immediately,
    /// matching the original's `RegisterWithGenericTraceApi`.
    #[must_use]
    pub fn new(
        sink: Arc<dyn TraceSink>,
        traced_element_count: usize,
        enabled: HashSet<crate::identity::ElementFqId>,
    ) -> Arc<Self> {
        let slots = (0..traced_element_count).map(|_| Mutex::new(None)).collect();
        let bridge = Arc::new(TracingBridge {
            sink: sink.clone(),
            slots,
            next_context_id: AtomicU32::new(0),
            enabled,
        });

        let done_bridge = bridge.clone();
        sink.register_trace_done_cb(Arc::new(move |context_id| {
            done_bridge.on_trace_done(context_id);
        }));

        bridge
    }

    /// Whether tracing is enabled for `element` by the configured allow-list.
    #[must_use]
    pub fn is_enabled(&self, element: &crate::identity::ElementFqId) -> bool {
        self.enabled.contains(element)
    }

    /// Pass through to the sink's client registration.
    pub fn register_client(&self, client_name: &str) {
        self.sink.register_client(client_name);
    }

    /// Pass through to the sink's shm object registration.
    pub fn register_shm_object(&self, segment_name: &str) {
        self.sink.register_shm_object(segment_name);
    }

    /// Pass through to the sink's shm object de-registration.
    pub fn unregister_shm_object(&self, segment_name: &str) {
        self.sink.unregister_shm_object(segment_name);
    }

    /// Reserve the next `TraceContextId`, one per traced service element at
    /// startup.
    ///
    /// # Panics
    ///
    /// If called more times than `traced_element_count` passed to
    /// [`TracingBridge::new`] -- exceeding the pre-allocated budget is a
    /// programmer error (a configuration/registration mismatch), matching
    /// the original's `LogFatal` + terminate.
    pub fn register_service_element(&self) -> TraceContextId {
        let idx = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        assert!(
            (idx as usize) < self.slots.len(),
            "{} trace context id budget exceeded: configured for {} traced elements",
            log_ctx::TRACE,
            self.slots.len()
        );
        TraceContextId(idx)
    }

    /// Hand `sample` to the sink under `context_id`, keeping it alive (and
    /// thus its transaction-log reference held) until the sink's done
    /// callback fires.
    ///
    /// # Panics
    ///
    /// If `context_id`'s slot already holds a sample -- a caller tracing the
    /// same context twice without waiting for the done callback is a
    /// programmer error (spec.md: "setting into an already-occupied slot is
    /// a fatal error").
    pub fn trace_send(
        &self,
        context_id: TraceContextId,
        client: &str,
        meta: &str,
        sample: SamplePtr,
    ) {
        let idx = context_id.0 as usize;
        let mut slot = self.slots[idx].lock();
        assert!(
            slot.is_none(),
            "{} trace context {idx} already holds a sample",
            log_ctx::TRACE
        );
        let data = sample.as_bytes().to_vec();
        *slot = Some(sample);
        drop(slot);

        if let Err(e) = self.sink.trace(client, meta, &data, context_id) {
            log::warn!("{} trace sink rejected context {idx}: {e}", log_ctx::TRACE);
        }
    }

    fn on_trace_done(&self, context_id: TraceContextId) {
        let idx = context_id.0 as usize;
        let Some(slot) = self.slots.get(idx) else {
            log::warn!(
                "{} trace done callback for out-of-range context id {idx}",
                log_ctx::TRACE
            );
            return;
        };
        // Dropping the `SamplePtr` here releases its transaction-log
        // reference (shm::channel::SamplePtr::drop).
        *slot.lock() = None;
    }
}
