// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide runtime singleton (spec.md §4.9/§9).
//!
//! Grounded in the teacher's `OnceLock`-backed globals
//! (`core::rt::slabpool`/`telemetry::{init_metrics, get_metrics}`): a runtime
//! is constructed once, lazily if nothing ever called [`Runtime::init`], and
//! every later [`Runtime::init`] call before the first [`Runtime::instance`]
//! access overwrites it (logged). Once any access has observed a value,
//! further `init` calls are no-ops, logged as a warning rather than treated
//! as an error -- mirroring how the teacher's `init_exporter` silently drops
//! a second bind rather than failing the caller.
//!
//! The single binding this crate transports (LoLa) is modeled as a one-arm
//! closed variant per spec.md §9's "polymorphic bindings -> tagged variant"
//! redesign note, so a second binding kind has a home without reintroducing
//! virtual dispatch.

use crate::config::Configuration;
use crate::discovery::DiscoveryFacade;
use crate::error::Result;
use crate::log_ctx;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

/// The binding kinds this crate's runtime can construct. Only `LoLa`
/// actually transports anything (spec.md §1 Non-goal: network-transparent
/// IPC); the variant exists so the match at the one dispatch site
/// (`Runtime::new`) stays exhaustive if a second binding is ever added.
enum Binding {
    LoLa(LolaBinding),
}

/// Per-binding state the runtime owns on the LoLa binding's behalf. Today
/// this is just the discovery facade; a binding with its own background
/// workers would add their join handles here.
struct LolaBinding {
    discovery: DiscoveryFacade,
}

/// Operations a caller reaches through [`Runtime::instance`]. Implemented by
/// [`Runtime`] itself and by anything injected through
/// [`Runtime::inject_mock`] -- test code supplies its own implementor
/// instead of a trait-object wrapper around a real `Runtime`, so a mock can
/// fake discovery failures without standing up inotify watches.
pub trait RuntimeApi: Send + Sync {
    /// The discovery facade this runtime's LoLa binding constructed.
    fn discovery(&self) -> &DiscoveryFacade;
    /// The configuration this runtime was built from.
    fn config(&self) -> &Arc<Configuration>;
}

/// Blanket seam so any `RuntimeApi` implementor can be injected via
/// [`Runtime::inject_mock`] without a separate trait to hand-implement.
pub trait MockRuntime: RuntimeApi {}
impl<T: RuntimeApi> MockRuntime for T {}

/// The process-wide runtime: one discovery facade, one LoLa binding, for the
/// lifetime of the process (or until a test clears it).
pub struct Runtime {
    binding: Binding,
    config: Arc<Configuration>,
}

impl Runtime {
    fn new(config: Configuration) -> Result<Self> {
        let config = Arc::new(config);
        let discovery = DiscoveryFacade::new(config.clone())?;
        Ok(Runtime {
            binding: Binding::LoLa(LolaBinding { discovery }),
            config,
        })
    }
}

impl RuntimeApi for Runtime {
    fn discovery(&self) -> &DiscoveryFacade {
        let Binding::LoLa(lola) = &self.binding;
        &lola.discovery
    }

    fn config(&self) -> &Arc<Configuration> {
        &self.config
    }
}

static REAL: OnceLock<RwLock<Option<Arc<dyn RuntimeApi>>>> = OnceLock::new();
static MOCK: OnceLock<RwLock<Option<Arc<dyn RuntimeApi>>>> = OnceLock::new();
static ACCESSED: AtomicBool = AtomicBool::new(false);

fn real_slot() -> &'static RwLock<Option<Arc<dyn RuntimeApi>>> {
    REAL.get_or_init(|| RwLock::new(None))
}

fn mock_slot() -> &'static RwLock<Option<Arc<dyn RuntimeApi>>> {
    MOCK.get_or_init(|| RwLock::new(None))
}

impl Runtime {
    /// Construct (or replace) the process-wide runtime from a pre-parsed
    /// [`Configuration`].
    ///
    /// Idempotent before the first [`Runtime::instance`] call: later calls
    /// overwrite earlier ones, last-writer-wins, with a logged warning. Once
    /// `instance()` has been observed once, this is a no-op (logged).
    ///
    /// # Errors
    ///
    /// Propagates [`DiscoveryFacade::new`] failures (spinning up the
    /// inotify watcher thread).
    pub fn init(config: Configuration) -> Result<()> {
        if ACCESSED.load(Ordering::SeqCst) {
            log::warn!(
                "{} Runtime::init called after first access; ignored",
                log_ctx::RUNTIME
            );
            return Ok(());
        }
        let mut slot = real_slot().write();
        if slot.is_some() {
            log::warn!(
                "{} Runtime::init called again before first access; replacing prior configuration",
                log_ctx::RUNTIME
            );
        }
        let runtime: Arc<dyn RuntimeApi> = Arc::new(Runtime::new(config)?);
        *slot = Some(runtime);
        Ok(())
    }

    /// Locate a manifest path from a thin command-line view and initialize
    /// from it.
    ///
    /// Parsing the manifest itself is the out-of-scope external collaborator
    /// (spec.md §1); this only recognizes `--mw-com-config <path>` and hands
    /// the rest to [`Configuration::from_json_value`] once a loader supplies
    /// the parsed JSON. With no matching argument, initializes from an empty
    /// configuration (every specifier then fails to resolve).
    ///
    /// # Errors
    ///
    /// Propagates [`Runtime::init`]'s errors, or a config file's read/parse
    /// failure surfaced as [`crate::error::Error::InvalidConfiguration`].
    pub fn init_from_args(args: &[String]) -> Result<()> {
        let config = match config_path(args) {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let value: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|_| crate::error::Error::InvalidConfiguration)?;
                Configuration::from_json_value(value)?
            }
            None => Configuration::empty(),
        };
        Runtime::init(config)
    }

    /// Access the process-wide runtime, constructing a default one (empty
    /// configuration) on first access if [`Runtime::init`] was never called
    /// -- mirroring the teacher's `get_metrics()` lazily-initializing
    /// fallback. Returns the injected mock instead, if one is set.
    #[must_use]
    pub fn instance() -> Arc<dyn RuntimeApi> {
        if let Some(mock) = mock_slot().read().clone() {
            return mock;
        }
        ACCESSED.store(true, Ordering::SeqCst);
        if let Some(rt) = real_slot().read().clone() {
            return rt;
        }
        let mut slot = real_slot().write();
        if let Some(rt) = slot.clone() {
            return rt;
        }
        let runtime: Arc<dyn RuntimeApi> = Arc::new(
            Runtime::new(Configuration::empty())
                .expect("Runtime::new with an empty configuration cannot fail"),
        );
        *slot = Some(runtime.clone());
        runtime
    }

    /// Test seam: while `mock` is injected, every [`Runtime::instance`] call
    /// returns it instead of the real runtime, regardless of whether
    /// [`Runtime::init`] was ever called.
    pub fn inject_mock(mock: Arc<dyn RuntimeApi>) {
        *mock_slot().write() = Some(mock);
    }

    /// Remove an injected mock, restoring real [`Runtime::instance`] access.
    pub fn clear_mock() {
        *mock_slot().write() = None;
    }
}

fn config_path(args: &[String]) -> Option<&str> {
    args.iter()
        .position(|a| a == "--mw-com-config")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InstanceSpecifier;
    use serial_test::serial;

    struct Recording {
        config: Arc<Configuration>,
    }

    impl RuntimeApi for Recording {
        fn discovery(&self) -> &DiscoveryFacade {
            unimplemented!("mock does not need a real discovery facade for these tests")
        }
        fn config(&self) -> &Arc<Configuration> {
            &self.config
        }
    }

    fn reset() {
        *real_slot().write() = None;
        *mock_slot().write() = None;
        ACCESSED.store(false, Ordering::SeqCst);
    }

    #[test]
    #[serial]
    fn instance_lazily_constructs_a_default_runtime() {
        reset();
        let rt = Runtime::instance();
        let specifier = InstanceSpecifier::new("Unconfigured/Port").unwrap();
        assert!(rt.discovery().find_service_by_specifier(&specifier).is_err());
        reset();
    }

    #[test]
    #[serial]
    fn init_before_access_overwrites_prior_configuration() {
        reset();
        let mut first = Configuration::empty();
        first.max_subscribers_default = 1;
        Runtime::init(first).unwrap();

        let mut second = Configuration::empty();
        second.max_subscribers_default = 9;
        Runtime::init(second).unwrap();

        assert_eq!(Runtime::instance().config().max_subscribers_default, 9);
        reset();
    }

    #[test]
    #[serial]
    fn init_after_access_is_ignored() {
        reset();
        let mut first = Configuration::empty();
        first.max_subscribers_default = 3;
        Runtime::init(first).unwrap();
        let _ = Runtime::instance();

        let mut second = Configuration::empty();
        second.max_subscribers_default = 11;
        Runtime::init(second).unwrap();

        assert_eq!(Runtime::instance().config().max_subscribers_default, 3);
        reset();
    }

    #[test]
    #[serial]
    fn injected_mock_overrides_real_access() {
        reset();
        let mut cfg = Configuration::empty();
        cfg.max_subscribers_default = 42;
        let mock: Arc<dyn RuntimeApi> = Arc::new(Recording { config: Arc::new(cfg) });
        Runtime::inject_mock(mock);

        assert_eq!(Runtime::instance().config().max_subscribers_default, 42);

        Runtime::clear_mock();
        reset();
    }
}
