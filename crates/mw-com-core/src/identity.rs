// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Value types naming a service type, a service instance, and a discovered
//! handle to one. These are the vocabulary every other module speaks: the
//! discovery engine watches `InstanceIdentifier`s, the facade mints
//! `FindServiceHandle`s, and the transport layer is keyed by `ElementFqId`.
//!
//! Grounded in `original_source/mw/com/impl/{instance_identifier,
//! handle_type, instance_specifier, find_service_handle}.h`.

use crate::config::Configuration;
use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Current on-wire version of [`InstanceIdentifier::serialize`]'s format.
/// A mismatch on deserialize is a programmer error (stale binary talking to
/// a newer/older one on the same host) and aborts the process.
pub const SERIALIZATION_VERSION: u32 = 1;

/// Numeric identifier of a service type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(pub u16);

/// Numeric identifier of one event or field within a service type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementId(pub u16);

/// Tagged union over the instance-id spaces this crate can represent.
///
/// `Any` is the "empty" variant of spec.md §3: an `InstanceIdentifier`
/// carrying it is a find-any template, never a concrete offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceId {
    /// Local shared-memory (LoLa) binding instance id. The only binding
    /// this crate actually transports.
    LoLa(u16),
    /// SomeIp instance id -- representable, never produced by this crate's
    /// transport (spec.md Non-goal: network-transparent IPC).
    SomeIp(u16),
    /// Find-any template: no concrete instance is named.
    Any,
}

impl InstanceId {
    /// `true` for `Any`, i.e. this instance id names no concrete instance.
    #[must_use]
    pub fn is_any(&self) -> bool {
        matches!(self, InstanceId::Any)
    }

    /// Write this id's stable hash-string representation into `buf`,
    /// returning the number of bytes written. No heap allocation.
    fn write_hash_string(&self, buf: &mut [u8]) -> usize {
        let s = match self {
            InstanceId::LoLa(n) => format!("L{n}"),
            InstanceId::SomeIp(n) => format!("S{n}"),
            InstanceId::Any => "A".to_string(),
        };
        let bytes = s.as_bytes();
        assert!(
            bytes.len() <= buf.len(),
            "InstanceId hash string exceeds fixed stack buffer"
        );
        buf[..bytes.len()].copy_from_slice(bytes);
        bytes.len()
    }

    /// Maximum length of [`InstanceId::write_hash_string`]'s output: a tag
    /// byte plus a `u16` in decimal.
    const HASH_STRING_MAX: usize = 1 + 5;
}

impl Ord for InstanceId {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(id: &InstanceId) -> (u8, u16) {
            match id {
                InstanceId::LoLa(n) => (0, *n),
                InstanceId::SomeIp(n) => (1, *n),
                InstanceId::Any => (2, 0),
            }
        }
        rank(self).cmp(&rank(other))
    }
}

impl PartialOrd for InstanceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Safety integrity level of a service instance deployment.
///
/// `B` requires a second, safety-segregated shm region (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    /// Quality-managed. One shm region.
    Qm,
    /// ASIL-B. A second, segregated shm region is created in addition.
    B,
}

impl Quality {
    /// Literal directory/filename component for this quality (spec.md §6).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Qm => "asil-qm",
            Quality::B => "asil-b",
        }
    }
}

/// Descriptor of a service type: its id and the events/fields it offers.
/// Immutable after configuration load; interned behind `Arc` so every
/// `InstanceIdentifier` referencing it shares one allocation.
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceTypeDeployment {
    /// Numeric service type id.
    pub service_id: ServiceId,
    /// Events this service type offers.
    pub event_ids: Vec<ElementId>,
    /// Fields this service type offers.
    pub field_ids: Vec<ElementId>,
}

impl ServiceTypeDeployment {
    fn write_hash_string(&self, buf: &mut [u8]) -> usize {
        let s = format!("T{}", self.service_id.0);
        let bytes = s.as_bytes();
        assert!(
            bytes.len() <= buf.len(),
            "ServiceTypeDeployment hash string exceeds fixed stack buffer"
        );
        buf[..bytes.len()].copy_from_slice(bytes);
        bytes.len()
    }

    const HASH_STRING_MAX: usize = 1 + 5;
}

/// Descriptor binding a service type to an instance id and quality level.
/// Immutable after configuration load; interned behind `Arc`.
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceInstanceDeployment {
    /// Instance id this deployment binds to (concrete for a real offer).
    pub instance_id: InstanceId,
    /// Safety integrity level.
    pub quality: Quality,
    /// Max outstanding samples a single subscriber may hold per event.
    pub max_samples: usize,
    /// Max concurrent subscribers; bounds the transaction log's table size.
    pub max_subscribers: usize,
}

/// `(ServiceInstanceDeployment, ServiceTypeDeployment)` pair: everything
/// needed to name one service instance, independent of whether it has yet
/// been discovered at a concrete handle.
///
/// Value-equal, totally ordered, hashable; serializes losslessly through a
/// canonical string carrying an embedded [`SERIALIZATION_VERSION`].
#[derive(Debug, Clone)]
pub struct InstanceIdentifier {
    /// Instance-level deployment (instance id, quality, limits).
    pub instance_deployment: Arc<ServiceInstanceDeployment>,
    /// Type-level deployment (service id, element ids).
    pub type_deployment: Arc<ServiceTypeDeployment>,
}

impl PartialEq for InstanceIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.instance_deployment == other.instance_deployment
            && self.type_deployment == other.type_deployment
    }
}
impl Eq for InstanceIdentifier {}

impl PartialOrd for InstanceIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InstanceIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        (
            self.type_deployment.service_id,
            self.instance_deployment.instance_id,
        )
            .cmp(&(
                other.type_deployment.service_id,
                other.instance_deployment.instance_id,
            ))
    }
}

impl Hash for InstanceIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_string().hash(state);
    }
}

impl InstanceIdentifier {
    /// Write this identifier's stable hash-string into a fixed stack
    /// buffer and return it. No heap allocation; panics (programmer error,
    /// per spec.md §4.1) if the concatenation would exceed the statically
    /// known maximum length.
    #[must_use]
    pub fn hash_string(&self) -> String {
        const MAX: usize =
            ServiceTypeDeployment::HASH_STRING_MAX + InstanceId::HASH_STRING_MAX;
        let mut buf = [0u8; MAX];
        let a = self.type_deployment.write_hash_string(&mut buf);
        let b = self
            .instance_deployment
            .instance_id
            .write_hash_string(&mut buf[a..]);
        String::from_utf8_lossy(&buf[..a + b]).into_owned()
    }

    /// Canonical, lossless string serialization carrying an embedded
    /// [`SERIALIZATION_VERSION`].
    ///
    /// Format: `v{version}:{service_id}:{instance_id_tag}{instance_id}`.
    #[must_use]
    pub fn serialize(&self) -> String {
        let id_tag = match self.instance_deployment.instance_id {
            InstanceId::LoLa(n) => format!("L{n}"),
            InstanceId::SomeIp(n) => format!("S{n}"),
            InstanceId::Any => "A".to_string(),
        };
        format!(
            "v{}:{}:{}",
            SERIALIZATION_VERSION, self.type_deployment.service_id.0, id_tag
        )
    }

    /// Inverse of [`InstanceIdentifier::serialize`].
    ///
    /// Looks up the embedded `(service_id, instance_id)` pair in `config`;
    /// no match is [`Error::InvalidConfiguration`]. Malformed input (wrong
    /// field count, non-numeric ids) is
    /// [`Error::InvalidInstanceIdentifierString`]. A `serialization_version`
    /// mismatch is a programmer error and aborts the process.
    pub fn deserialize(s: &str, config: &Configuration) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let version_field = parts.next().ok_or(Error::InvalidInstanceIdentifierString)?;
        let service_field = parts.next().ok_or(Error::InvalidInstanceIdentifierString)?;
        let id_field = parts.next().ok_or(Error::InvalidInstanceIdentifierString)?;
        if parts.next().is_some() {
            return Err(Error::InvalidInstanceIdentifierString);
        }

        let version: u32 = version_field
            .strip_prefix('v')
            .and_then(|v| v.parse().ok())
            .ok_or(Error::InvalidInstanceIdentifierString)?;
        assert_eq!(
            version, SERIALIZATION_VERSION,
            "InstanceIdentifier serialization_version mismatch: on-disk/wire {version} != binary {SERIALIZATION_VERSION}"
        );

        let service_id: u16 = service_field
            .parse()
            .map_err(|_| Error::InvalidInstanceIdentifierString)?;

        if id_field.is_empty() {
            return Err(Error::InvalidInstanceIdentifierString);
        }
        let (tag, rest) = id_field.split_at(1);
        let instance_id = match tag {
            "L" => InstanceId::LoLa(
                rest.parse()
                    .map_err(|_| Error::InvalidInstanceIdentifierString)?,
            ),
            "S" => InstanceId::SomeIp(
                rest.parse()
                    .map_err(|_| Error::InvalidInstanceIdentifierString)?,
            ),
            "A" if rest.is_empty() => InstanceId::Any,
            _ => return Err(Error::InvalidInstanceIdentifierString),
        };

        config
            .resolve(ServiceId(service_id), instance_id)
            .ok_or(Error::InvalidConfiguration)
    }
}

/// Opaque monotonically-increasing handle minted by
/// [`crate::discovery::facade::DiscoveryFacade::start_find_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FindServiceHandle(u64);

static NEXT_FIND_SERVICE_HANDLE: AtomicU64 = AtomicU64::new(1);

impl FindServiceHandle {
    /// Mint a fresh handle from the process-wide atomic counter.
    #[must_use]
    pub fn new() -> Self {
        FindServiceHandle(NEXT_FIND_SERVICE_HANDLE.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Raw numeric value, for logging/debugging.
    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for FindServiceHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FindServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FindServiceHandle({})", self.0)
    }
}

/// The user-facing identifier of a discovered instance, sufficient to
/// construct a proxy: an [`InstanceIdentifier`] plus a concrete
/// [`InstanceId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleType {
    /// The identifier this handle was discovered against.
    pub identifier: InstanceIdentifier,
    /// Always concrete: never [`InstanceId::Any`].
    pub instance_id: InstanceId,
}

impl HandleType {
    /// Construct a handle, resolving the concrete instance id from either
    /// `identifier` itself or the supplied override.
    ///
    /// A programmer error (panics) if neither source is concrete, or if
    /// both are concrete and disagree (spec.md §4.1).
    #[must_use]
    pub fn new(identifier: InstanceIdentifier, instance_id: Option<InstanceId>) -> Self {
        let own = identifier.instance_deployment.instance_id;
        let resolved = match (own.is_any(), instance_id) {
            (false, None) => own,
            (false, Some(supplied)) => {
                assert_eq!(
                    own, supplied,
                    "HandleType::new: identifier's own instance id {own:?} disagrees with supplied {supplied:?}"
                );
                own
            }
            (true, Some(supplied)) => {
                assert!(
                    !supplied.is_any(),
                    "HandleType::new: supplied instance id must be concrete"
                );
                supplied
            }
            (true, None) => {
                panic!("HandleType::new: identifier has no concrete instance id and none was supplied")
            }
        };
        HandleType {
            identifier,
            instance_id: resolved,
        }
    }
}

impl PartialOrd for HandleType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HandleType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identifier
            .cmp(&other.identifier)
            .then_with(|| self.instance_id.cmp(&other.instance_id))
    }
}

/// What kind of service element an [`ElementFqId`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// A published/subscribed event.
    Event,
    /// A field (event with a cached last value -- not separately modeled
    /// by the transport layer in this crate; see SPEC_FULL Non-goals).
    Field,
}

/// Fully qualifies one event or field across the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementFqId {
    /// Owning service type id.
    pub service_id: u16,
    /// Owning instance id.
    pub instance_id: u16,
    /// Event/field id within the service type.
    pub element_id: u16,
    /// Whether this names an event or a field.
    pub element_kind: ElementKind,
}

/// A validated short-name path used to look up configured deployments.
///
/// Accepts only `[A-Za-z_/][A-Za-z_/0-9]*` with no duplicate (`//`) or
/// trailing (`/`) slash (spec.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceSpecifier(String);

impl InstanceSpecifier {
    /// Validate and construct an `InstanceSpecifier`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMetaModelShortname`] if `s` does not match
    /// the accepted grammar.
    pub fn new(s: &str) -> Result<Self> {
        if !Self::is_valid(s) {
            return Err(Error::InvalidMetaModelShortname);
        }
        Ok(InstanceSpecifier(s.to_string()))
    }

    fn is_valid(s: &str) -> bool {
        let mut chars = s.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        if !(first.is_ascii_alphabetic() || first == '_' || first == '/') {
            return false;
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/')
        {
            return false;
        }
        if s.contains("//") || s.ends_with('/') {
            return false;
        }
        true
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
