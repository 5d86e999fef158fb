// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Filesystem+inotify-based service discovery: the offer/find protocol.
//!
//! - [`flagfile`] publishes/retracts the marker files an `Offer` creates.
//! - [`client`] watches those files with inotify and dispatches find-service
//!   callbacks.
//! - [`facade`] is the public entry point, fanning a specifier out across
//!   the (single, LoLa) binding and owning the user-supplied handlers.

pub mod client;
pub mod facade;
pub mod flagfile;

pub use client::{DiscoveryClient, FindServiceHandler};
pub use facade::DiscoveryFacade;
pub use flagfile::FlagFilePublisher;

use std::path::PathBuf;

/// Which quality's flag file(s) an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTypeSelector {
    /// Only the `asil-qm` file.
    Qm,
    /// Only the `asil-b` file.
    B,
    /// Both files (used by `StopOfferService` on full teardown).
    Both,
}

/// Discovery filesystem root. `/tmp/mw_com_lola/service_discovery` by
/// default, overridable via `MW_COM_DISCOVERY_ROOT` for test isolation
/// (spec.md §6; this crate's equivalent of the corpus's env-var overrides
/// for test/dev shm roots, e.g. `HDDS_*` toggles).
#[must_use]
pub fn discovery_root() -> PathBuf {
    if let Ok(root) = std::env::var("MW_COM_DISCOVERY_ROOT") {
        return PathBuf::from(root);
    }
    PathBuf::from("/tmp/mw_com_lola/service_discovery")
}

/// Directory holding flag files for one service instance:
/// `<root>/<service_id>/<instance_id>/`.
#[must_use]
pub fn instance_dir(service_id: u16, instance_id: u16) -> PathBuf {
    discovery_root()
        .join(service_id.to_string())
        .join(instance_id.to_string())
}

/// Directory holding instance subdirectories for a service:
/// `<root>/<service_id>/`.
#[must_use]
pub fn service_dir(service_id: u16) -> PathBuf {
    discovery_root().join(service_id.to_string())
}
