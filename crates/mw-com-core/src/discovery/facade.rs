// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Public entry point for the offer/find protocol. Grounded in
//! `original_source/mw/com/impl/service_discovery.h`: `OfferService`,
//! `StopOfferService`, the `StartFindService` family and `FindService` are
//! this binding's only concrete implementation, so `ServiceDiscovery`'s
//! fan-out across multiple bindings collapses to a direct call into
//! [`DiscoveryClient`]. `handle_to_instances_`'s `unordered_multimap` (one
//! external [`FindServiceHandle`] resolving to several
//! `EnrichedInstanceIdentifier`s when a specifier names more than one
//! deployment) is realized here as one internal sub-[`FindServiceHandle`]
//! per resolved deployment, fanning the merged result back out to a single
//! user callback under the external handle.

use super::client::{DiscoveryClient, FindServiceHandler};
use super::QualityTypeSelector;
use super::FlagFilePublisher;
use crate::config::Configuration;
use crate::error::Result;
use crate::identity::{
    FindServiceHandle, HandleType, InstanceIdentifier, InstanceSpecifier,
};

use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct MergedSearch {
    user_callback: FindServiceHandler,
    per_target: PlMutex<HashMap<InstanceIdentifier, HashSet<HandleType>>>,
}

struct FacadeSearch {
    sub_handles: Vec<FindServiceHandle>,
    /// Kept alive for the lifetime of the search; each sub-handle's wrapped
    /// callback holds its own clone.
    _merged: Arc<MergedSearch>,
}

/// Fans a specifier/identifier out to the LoLa binding's discovery client and
/// owns the user-supplied `FindServiceHandler`s the binding itself is
/// stateless about.
pub struct DiscoveryFacade {
    client: Arc<DiscoveryClient>,
    flagfiles: PlMutex<FlagFilePublisher>,
    config: Arc<Configuration>,
    searches: DashMap<FindServiceHandle, FacadeSearch>,
}

impl DiscoveryFacade {
    /// # Errors
    ///
    /// Propagates failures from spinning up the underlying inotify watcher
    /// thread.
    pub fn new(config: Arc<Configuration>) -> Result<Self> {
        Ok(DiscoveryFacade {
            client: DiscoveryClient::new()?,
            flagfiles: PlMutex::new(FlagFilePublisher::new()),
            config,
            searches: DashMap::new(),
        })
    }

    /// Offer `identifier`. Requires a concrete instance id; offering
    /// [`crate::identity::InstanceId::Any`] is a programmer error.
    pub fn offer_service(&self, identifier: &InstanceIdentifier) -> Result<()> {
        let instance_id = concrete_instance_id(identifier);
        let service_id = identifier.type_deployment.service_id.0;
        let quality = identifier.instance_deployment.quality;
        self.flagfiles.lock().offer(service_id, instance_id, quality)
    }

    /// Retract `identifier`'s flag file(s) matching `selector`. A full
    /// teardown (e.g. on drop of the offering handle) passes
    /// [`QualityTypeSelector::Both`].
    pub fn stop_offer_service(
        &self,
        identifier: &InstanceIdentifier,
        selector: QualityTypeSelector,
    ) {
        let instance_id = concrete_instance_id(identifier);
        let service_id = identifier.type_deployment.service_id.0;
        self.flagfiles.lock().stop_offer(service_id, instance_id, selector);
    }

    /// Register an asynchronous search against one already-resolved
    /// identifier (concrete instance, or `Any` for a find-any search).
    pub fn start_find_service_by_identifier(
        &self,
        callback: FindServiceHandler,
        target: InstanceIdentifier,
    ) -> Result<FindServiceHandle> {
        self.start_find_service_impl(callback, vec![target])
    }

    /// Register an asynchronous search against every deployment `specifier`
    /// resolves to, merging their results under one handle.
    pub fn start_find_service_by_specifier(
        &self,
        callback: FindServiceHandler,
        specifier: &InstanceSpecifier,
    ) -> Result<FindServiceHandle> {
        let targets = self.config.resolve_specifier(specifier)?.to_vec();
        self.start_find_service_impl(callback, targets)
    }

    fn start_find_service_impl(
        &self,
        user_callback: FindServiceHandler,
        targets: Vec<InstanceIdentifier>,
    ) -> Result<FindServiceHandle> {
        let external = FindServiceHandle::new();
        let merged = Arc::new(MergedSearch {
            user_callback,
            per_target: PlMutex::new(HashMap::new()),
        });

        let mut sub_handles = Vec::with_capacity(targets.len());
        for target in targets {
            let sub = FindServiceHandle::new();
            let merged_for_cb = merged.clone();
            let target_for_cb = target.clone();
            let wrapped: FindServiceHandler = Arc::new(move |handles, _sub_handle| {
                let mut per_target = merged_for_cb.per_target.lock();
                per_target.insert(target_for_cb.clone(), handles);
                let union: HashSet<HandleType> =
                    per_target.values().flatten().cloned().collect();
                drop(per_target);
                (merged_for_cb.user_callback)(union, external);
            });

            if let Err(e) = self.client.start_find_service(sub, wrapped, target) {
                for already in &sub_handles {
                    let _ = self.client.stop_find_service(*already);
                }
                return Err(e);
            }
            sub_handles.push(sub);
        }

        self.searches.insert(
            external,
            FacadeSearch {
                sub_handles,
                _merged: merged,
            },
        );
        Ok(external)
    }

    /// Deregister a search. Safe to call re-entrantly from inside a running
    /// handler (see [`DiscoveryClient::stop_find_service`]).
    pub fn stop_find_service(&self, handle: FindServiceHandle) -> Result<()> {
        if let Some((_, search)) = self.searches.remove(&handle) {
            for sub in search.sub_handles {
                self.client.stop_find_service(sub)?;
            }
        }
        Ok(())
    }

    /// Synchronous lookup against one resolved identifier.
    pub fn find_service_by_identifier(
        &self,
        target: &InstanceIdentifier,
    ) -> Result<HashSet<HandleType>> {
        self.client.find_service(target)
    }

    /// Synchronous lookup across every deployment `specifier` resolves to.
    pub fn find_service_by_specifier(
        &self,
        specifier: &InstanceSpecifier,
    ) -> Result<HashSet<HandleType>> {
        let mut out = HashSet::new();
        for target in self.config.resolve_specifier(specifier)? {
            out.extend(self.client.find_service(target)?);
        }
        Ok(out)
    }
}

fn concrete_instance_id(identifier: &InstanceIdentifier) -> u16 {
    super::flagfile::numeric_instance_id(identifier.instance_deployment.instance_id)
        .expect("offer/stop-offer require a concrete instance id, not Any")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{
        ElementId, InstanceId, Quality, ServiceId, ServiceInstanceDeployment, ServiceTypeDeployment,
    };
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn identifier(service_id: u16, instance_id: u16, quality: Quality) -> InstanceIdentifier {
        InstanceIdentifier {
            instance_deployment: Arc::new(ServiceInstanceDeployment {
                instance_id: InstanceId::LoLa(instance_id),
                quality,
                max_samples: 4,
                max_subscribers: 4,
            }),
            type_deployment: Arc::new(ServiceTypeDeployment {
                service_id: ServiceId(service_id),
                event_ids: vec![ElementId(1)],
                field_ids: vec![],
            }),
        }
    }

    fn with_root<F: FnOnce()>(f: F) {
        let dir = TempDir::new().unwrap();
        std::env::set_var("MW_COM_DISCOVERY_ROOT", dir.path());
        f();
        std::env::remove_var("MW_COM_DISCOVERY_ROOT");
    }

    fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    #[serial]
    fn offer_then_find_any_reports_the_instance() {
        with_root(|| {
            let facade = DiscoveryFacade::new(Arc::new(Configuration::empty())).unwrap();
            let id = identifier(10, 1, Quality::Qm);
            facade.offer_service(&id).unwrap();

            let found = facade.find_service_by_identifier(&id).unwrap();
            assert_eq!(found.len(), 1);
        });
    }

    #[test]
    #[serial]
    fn stop_offer_service_removes_visibility() {
        with_root(|| {
            let facade = DiscoveryFacade::new(Arc::new(Configuration::empty())).unwrap();
            let id = identifier(11, 1, Quality::Qm);
            facade.offer_service(&id).unwrap();
            facade.stop_offer_service(&id, QualityTypeSelector::Both);
            let found = facade.find_service_by_identifier(&id).unwrap();
            assert!(found.is_empty());
        });
    }

    #[test]
    #[serial]
    fn async_find_service_sees_later_offer() {
        with_root(|| {
            let facade = DiscoveryFacade::new(Arc::new(Configuration::empty())).unwrap();
            let id = identifier(12, 1, Quality::Qm);

            let count = Arc::new(AtomicUsize::new(0));
            let count2 = count.clone();
            let callback: FindServiceHandler = Arc::new(move |_handles, _h| {
                count2.fetch_add(1, Ordering::SeqCst);
            });
            let handle = facade
                .start_find_service_by_identifier(callback, id.clone())
                .unwrap();

            facade.offer_service(&id).unwrap();
            assert!(wait_until(|| count.load(Ordering::SeqCst) > 0));
            facade.stop_find_service(handle).unwrap();
        });
    }

    #[test]
    #[serial]
    fn start_find_service_by_specifier_merges_multiple_deployments() {
        with_root(|| {
            let mut config = Configuration::empty();
            let specifier = InstanceSpecifier::new("Fused/Port").unwrap();
            for instance_id in [1u16, 2u16] {
                let id = identifier(13, instance_id, Quality::Qm);
                config.register(
                    specifier.clone(),
                    id.instance_deployment.clone(),
                    id.type_deployment.clone(),
                );
            }
            let facade = DiscoveryFacade::new(Arc::new(config)).unwrap();

            for instance_id in [1u16, 2u16] {
                facade.offer_service(&identifier(13, instance_id, Quality::Qm)).unwrap();
            }

            let last: Arc<StdMutex<HashSet<HandleType>>> = Arc::new(StdMutex::new(HashSet::new()));
            let last2 = last.clone();
            let callback: FindServiceHandler = Arc::new(move |handles, _h| {
                *last2.lock().unwrap() = handles;
            });
            let handle = facade
                .start_find_service_by_specifier(callback, &specifier)
                .unwrap();

            assert!(wait_until(|| last.lock().unwrap().len() == 2));
            facade.stop_find_service(handle).unwrap();
        });
    }
}
