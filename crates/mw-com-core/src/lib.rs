// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # mw-com-core
//!
//! Core of a shared-memory publish/subscribe IPC middleware for
//! safety-critical automotive applications: a filesystem+inotify service
//! discovery engine (offer/find) paired with a zero-copy shared-memory event
//! transport (proxy/skeleton subscription state machine, slot ring,
//! crash-consistent transaction log).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mw_com_core::identity::{
//!     ElementId, InstanceId, InstanceIdentifier, Quality, ServiceId,
//!     ServiceInstanceDeployment, ServiceTypeDeployment,
//! };
//! use mw_com_core::discovery::QualityTypeSelector;
//! use mw_com_core::runtime::Runtime;
//! use std::sync::Arc;
//!
//! # fn main() -> mw_com_core::Result<()> {
//! let identifier = InstanceIdentifier {
//!     instance_deployment: Arc::new(ServiceInstanceDeployment {
//!         instance_id: InstanceId::LoLa(1),
//!         quality: Quality::Qm,
//!         max_samples: 4,
//!         max_subscribers: 4,
//!     }),
//!     type_deployment: Arc::new(ServiceTypeDeployment {
//!         service_id: ServiceId(7),
//!         event_ids: vec![ElementId(1)],
//!         field_ids: vec![],
//!     }),
//! };
//!
//! let rt = Runtime::instance();
//! rt.discovery().offer_service(&identifier)?;
//! rt.discovery().stop_offer_service(&identifier, QualityTypeSelector::Both);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                       Application (generated proxy/skeleton)        |
//! +---------------------------------------------------------------------+
//! |  runtime::Runtime  --  process-wide singleton, owns the facade       |
//! +---------------------------------------------------------------------+
//! |  discovery::DiscoveryFacade  -- specifier -> identifiers, fan-out    |
//! |    discovery::flagfile  |  discovery::client (inotify worker)       |
//! +---------------------------------------------------------------------+
//! |  transport::shm  -- slot ring, subscription machine, transaction log|
//! |    tracing_bridge  -- optional trace-point hand-off to a sink       |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`runtime::Runtime`] | Process-wide singleton; entry point to the discovery facade |
//! | [`discovery::DiscoveryFacade`] | Offer/find API: specifier/identifier -> handles |
//! | [`transport::shm::ShmEventChannelWriter`] | Producer/skeleton side of one event's slot ring |
//! | [`transport::shm::ShmEventChannelReader`] | Consumer/proxy side: subscribe, poll new samples |
//! | [`identity::InstanceIdentifier`] | Service type + instance + quality, value-comparable and hashable |
//!
//! ## Out of scope (spec.md §1)
//!
//! Deployment manifest *parsing* (only the in-memory [`config::Configuration`]
//! shape is owned here), code generation for typed event/field wrappers,
//! process-wide logging/assertion/init plumbing beyond the [`log`] facade,
//! the tracing daemon's implementation (modeled only via
//! [`tracing_bridge::TraceSink`]), and the typed-memory allocator (modeled
//! only via [`transport::shm::ShmSegment`]).

/// In-memory configuration shape (specifier -> deployments) and JSON ingestion.
pub mod config;
/// Filesystem+inotify service discovery: flag files, the inotify worker, and
/// the public offer/find facade.
pub mod discovery;
/// Crate-wide error type and result alias.
pub mod error;
/// Instance/service identifiers, handles, and enriched identifiers.
pub mod identity;
/// Bracketed subsystem prefixes shared by this crate's `log` records.
pub mod log_ctx;
/// Process-wide runtime singleton: owns the discovery facade and the LoLa binding.
pub mod runtime;
/// Shared-memory transport (the LoLa binding's only transport).
pub mod transport;
/// Trace-point bookkeeping bridging `Send`s to an external trace sink.
pub mod tracing_bridge;

pub use error::{Error, Result};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
