// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory configuration the (out-of-scope) JSON-manifest parser hands
//! back to the runtime: a mapping from [`InstanceSpecifier`] to the
//! [`ServiceInstanceDeployment`]s it resolves to.
//!
//! Reading manifests from disk is explicitly out of scope (spec.md §1); what
//! this module owns is the shape the parser contractually fills in, plus
//! [`Configuration::from_json_value`] so test code and a future loader can
//! exercise it without this crate's involvement.

use crate::identity::{
    InstanceId, InstanceIdentifier, InstanceSpecifier, Quality, ServiceId, ServiceInstanceDeployment,
    ServiceTypeDeployment,
};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Parsed view of a deployment manifest.
#[derive(Debug, Default)]
pub struct Configuration {
    instances: HashMap<InstanceSpecifier, Vec<InstanceIdentifier>>,
    /// `(service_id, instance_id)` -> resolved identifier, used by
    /// [`InstanceIdentifier::deserialize`](crate::identity::InstanceIdentifier::deserialize).
    by_service_and_instance: HashMap<(ServiceId, InstanceId), InstanceIdentifier>,
    /// Default `max_subscribers` applied when a deployment doesn't specify one.
    pub max_subscribers_default: usize,
}

impl Configuration {
    /// An empty configuration: every lookup fails with
    /// [`Error::InstanceIdCouldNotBeResolved`] / [`Error::InvalidConfiguration`].
    #[must_use]
    pub fn empty() -> Self {
        Configuration {
            instances: HashMap::new(),
            by_service_and_instance: HashMap::new(),
            max_subscribers_default: 8,
        }
    }

    /// Register one resolved identifier under `specifier`. Used by tests and
    /// by a future manifest loader once it parses deployments out of JSON.
    pub fn register(
        &mut self,
        specifier: InstanceSpecifier,
        instance_deployment: Arc<ServiceInstanceDeployment>,
        type_deployment: Arc<ServiceTypeDeployment>,
    ) {
        let identifier = InstanceIdentifier {
            instance_deployment: instance_deployment.clone(),
            type_deployment: type_deployment.clone(),
        };
        self.by_service_and_instance.insert(
            (type_deployment.service_id, instance_deployment.instance_id),
            identifier.clone(),
        );
        self.instances
            .entry(specifier)
            .or_default()
            .push(identifier);
    }

    /// Resolve a specifier to its configured identifiers.
    ///
    /// # Errors
    ///
    /// [`Error::InstanceIdCouldNotBeResolved`] if the specifier names no
    /// configured deployment.
    pub fn resolve_specifier(&self, specifier: &InstanceSpecifier) -> Result<&[InstanceIdentifier]> {
        self.instances
            .get(specifier)
            .map(Vec::as_slice)
            .ok_or(Error::InstanceIdCouldNotBeResolved)
    }

    /// Resolve a `(service_id, instance_id)` pair, as embedded in a
    /// serialized [`InstanceIdentifier`]. `None` if unresolvable.
    #[must_use]
    pub fn resolve(&self, service_id: ServiceId, instance_id: InstanceId) -> Option<InstanceIdentifier> {
        self.by_service_and_instance
            .get(&(service_id, instance_id))
            .cloned()
    }

    /// Parse a [`Configuration`] out of already-parsed JSON.
    ///
    /// Expected shape:
    /// ```json
    /// {
    ///   "max_subscribers_default": 8,
    ///   "instances": {
    ///     "My/Port": [
    ///       {
    ///         "service_id": 1, "instance_id": 3, "quality": "qm",
    ///         "max_samples": 4, "max_subscribers": 4,
    ///         "event_ids": [1, 2], "field_ids": []
    ///       }
    ///     ]
    ///   }
    /// }
    /// ```
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] if the JSON doesn't match this shape.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        let obj = value.as_object().ok_or(Error::InvalidConfiguration)?;
        let mut config = Configuration::empty();
        if let Some(d) = obj.get("max_subscribers_default").and_then(|v| v.as_u64()) {
            config.max_subscribers_default = d as usize;
        }

        let instances = obj
            .get("instances")
            .and_then(|v| v.as_object())
            .ok_or(Error::InvalidConfiguration)?;

        for (specifier_str, deployments) in instances {
            let specifier = InstanceSpecifier::new(specifier_str)
                .map_err(|_| Error::InvalidConfiguration)?;
            let deployments = deployments.as_array().ok_or(Error::InvalidConfiguration)?;
            for dep in deployments {
                let dep = dep.as_object().ok_or(Error::InvalidConfiguration)?;
                let service_id = dep
                    .get("service_id")
                    .and_then(|v| v.as_u64())
                    .ok_or(Error::InvalidConfiguration)? as u16;
                let instance_id = dep
                    .get("instance_id")
                    .and_then(|v| v.as_u64())
                    .ok_or(Error::InvalidConfiguration)? as u16;
                let quality = match dep.get("quality").and_then(|v| v.as_str()) {
                    Some("b") | Some("B") | Some("asil-b") => Quality::B,
                    Some("qm") | Some("QM") | Some("asil-qm") | None => Quality::Qm,
                    Some(_) => return Err(Error::InvalidConfiguration),
                };
                let max_samples = dep
                    .get("max_samples")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(4) as usize;
                let max_subscribers = dep
                    .get("max_subscribers")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(config.max_subscribers_default as u64)
                    as usize;
                let event_ids = dep
                    .get("event_ids")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|x| x.as_u64())
                            .map(|x| crate::identity::ElementId(x as u16))
                            .collect()
                    })
                    .unwrap_or_default();
                let field_ids = dep
                    .get("field_ids")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|x| x.as_u64())
                            .map(|x| crate::identity::ElementId(x as u16))
                            .collect()
                    })
                    .unwrap_or_default();

                let instance_deployment = Arc::new(ServiceInstanceDeployment {
                    instance_id: InstanceId::LoLa(instance_id),
                    quality,
                    max_samples,
                    max_subscribers,
                });
                let type_deployment = Arc::new(ServiceTypeDeployment {
                    service_id: ServiceId(service_id),
                    event_ids,
                    field_ids,
                });
                config.register(specifier.clone(), instance_deployment, type_deployment);
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_value_parses_instances() {
        let value = json!({
            "max_subscribers_default": 16,
            "instances": {
                "My/Port": [
                    { "service_id": 1, "instance_id": 3, "quality": "qm",
                      "max_samples": 4, "max_subscribers": 4, "event_ids": [1] }
                ]
            }
        });
        let config = Configuration::from_json_value(value).unwrap();
        let specifier = InstanceSpecifier::new("My/Port").unwrap();
        let resolved = config.resolve_specifier(&specifier).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].type_deployment.service_id, ServiceId(1));
        assert_eq!(
            resolved[0].instance_deployment.instance_id,
            InstanceId::LoLa(3)
        );
    }

    #[test]
    fn from_json_value_rejects_non_object() {
        assert!(matches!(
            Configuration::from_json_value(json!("not an object")),
            Err(Error::InvalidConfiguration)
        ));
    }

    #[test]
    fn resolve_specifier_unknown_fails() {
        let config = Configuration::empty();
        let specifier = InstanceSpecifier::new("Unknown/Port").unwrap();
        assert!(matches!(
            config.resolve_specifier(&specifier),
            Err(Error::InstanceIdCouldNotBeResolved)
        ));
    }
}
