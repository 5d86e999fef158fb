// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging conventions shared across the crate.
//!
//! This crate emits plain [`log`](https://docs.rs/log) records -- the same
//! facade the rest of this codebase uses -- and leaves backend selection
//! (env_logger, tracing-subscriber, a vehicle's OS logger) to the integrator.
//! No bespoke logging backend lives here; what's shared is a handful of
//! bracketed subsystem prefixes for grep-ability, matching this codebase's
//! existing `[SHM]`-style tags.

/// Prefix for [`crate::discovery`] log records.
pub const DISCOVERY: &str = "[DISCOVERY]";
/// Prefix for [`crate::transport::shm`] log records.
pub const SHM: &str = "[SHM]";
/// Prefix for [`crate::transport::shm::transaction_log`] log records.
pub const TXLOG: &str = "[TXLOG]";
/// Prefix for [`crate::tracing_bridge`] log records.
pub const TRACE: &str = "[TRACE]";
/// Prefix for [`crate::runtime`] log records.
pub const RUNTIME: &str = "[RUNTIME]";
