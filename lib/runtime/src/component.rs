// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Component addressing and instance registration.
//!
//! A component advertises named operations under a `namespace/component`
//! address; dependents resolve typed [`Client`] handles from the address at
//! startup instead of relying on implicit global lookup. Registration is an
//! [`Instance`] record written to the key/value store under
//! `v1/instances/{namespace}/{component}/{endpoint}/{instance_id:x}`; records
//! are attached to the process lease, so a dead process disappears from the
//! listing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DistributedRuntime, ErrorContext, KeyValueStore, Result, raise};

/// Store bucket holding instance registrations.
pub const INSTANCE_ROOT_PATH: &str = "v1/instances";

/// Poll period for [`Client::wait_for_instances`].
const INSTANCE_POLL_PERIOD: Duration = Duration::from_millis(500);

fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        raise!("{kind} name must not be empty");
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        raise!("{kind} name {value:?} may only contain alphanumerics, '-' and '_'");
    }
    Ok(())
}

/// Root of the address chain: `Namespace -> Component -> Endpoint`.
#[derive(Clone)]
pub struct Namespace {
    drt: DistributedRuntime,
    name: String,
}

impl Namespace {
    pub(crate) fn new(drt: DistributedRuntime, name: String) -> Result<Self> {
        validate_segment("namespace", &name)?;
        Ok(Self { drt, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn drt(&self) -> &DistributedRuntime {
        &self.drt
    }

    pub fn component(&self, name: impl Into<String>) -> Result<Component> {
        let name = name.into();
        validate_segment("component", &name)?;
        Ok(Component {
            namespace: self.clone(),
            name,
        })
    }
}

#[derive(Clone)]
pub struct Component {
    namespace: Namespace,
    name: String,
}

impl Component {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn drt(&self) -> &DistributedRuntime {
        self.namespace.drt()
    }

    /// `{namespace}/{component}`
    pub fn path(&self) -> String {
        format!("{}/{}", self.namespace.name(), self.name)
    }

    pub fn endpoint(&self, name: impl Into<String>) -> Endpoint {
        Endpoint {
            component: self.clone(),
            name: name.into(),
        }
    }
}

#[derive(Clone)]
pub struct Endpoint {
    component: Component,
    name: String,
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> &Component {
        &self.component
    }

    /// `{namespace}/{component}/{endpoint}`
    pub fn path(&self) -> String {
        format!("{}/{}", self.component.path(), self.name)
    }

    /// NATS-style subject for this endpoint.
    pub fn subject(&self) -> String {
        format!(
            "{}.{}.{}",
            self.component.namespace().name(),
            self.component.name(),
            self.name
        )
    }

    /// Advertise this endpoint under the component address.
    pub async fn register_instance(&self) -> Result<Instance> {
        validate_segment("endpoint", &self.name)?;
        let drt = self.component.drt();
        let instance = Instance {
            namespace: self.component.namespace().name().to_string(),
            component: self.component.name().to_string(),
            endpoint: self.name.clone(),
            instance_id: drt.connection_id(),
            subject: self.subject(),
        };
        let key = format!("{}/{:x}", self.path(), instance.instance_id);
        let value = serde_json::to_vec(&instance)
            .context("failed to serialize instance record")?;
        drt.store()
            .put(INSTANCE_ROOT_PATH, &key, value.into())
            .await
            .with_context(|| format!("failed to register instance at {key}"))?;
        tracing::info!(path = %self.path(), instance_id = instance.instance_id, "registered endpoint instance");
        Ok(instance)
    }

    /// Resolve a client handle for this endpoint address.
    pub fn client(&self) -> Client {
        Client {
            endpoint: self.clone(),
        }
    }
}

/// One live endpoint registration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub namespace: String,
    pub component: String,
    pub endpoint: String,
    pub instance_id: u64,
    pub subject: String,
}

impl Instance {
    pub fn id(&self) -> u64 {
        self.instance_id
    }
}

/// Client side of an endpoint address: lists the live peers registered there.
#[derive(Clone)]
pub struct Client {
    endpoint: Endpoint,
}

impl Client {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Instances currently registered for this endpoint. Records that fail to
    /// parse are skipped with a warning rather than failing the listing.
    pub async fn instances(&self) -> Result<Vec<Instance>> {
        let prefix = format!("{}/", self.endpoint.path());
        let entries = self
            .endpoint
            .component()
            .drt()
            .store()
            .get_prefix(INSTANCE_ROOT_PATH, &prefix)
            .await?;

        let mut instances = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_slice::<Instance>(&value) {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping unparseable instance record");
                }
            }
        }
        Ok(instances)
    }

    pub async fn instance_ids(&self) -> Result<Vec<u64>> {
        Ok(self.instances().await?.iter().map(|i| i.id()).collect())
    }

    /// Block until at least `min_instances` peers are registered.
    ///
    /// The wait is bounded by `timeout`; an unmet quorum is an error, not a
    /// silent stall.
    pub async fn wait_for_instances(
        &self,
        min_instances: usize,
        timeout: Duration,
    ) -> Result<Vec<Instance>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let instances = self.instances().await?;
            if instances.len() >= min_instances {
                return Ok(instances);
            }
            tracing::info!(
                path = %self.endpoint.path(),
                found = instances.len(),
                required = min_instances,
                "waiting for required instances"
            );
            if tokio::time::Instant::now() + INSTANCE_POLL_PERIOD > deadline {
                raise!(
                    "required {min_instances} instances of {} did not appear within {timeout:?}",
                    self.endpoint.path()
                );
            }
            tokio::time::sleep(INSTANCE_POLL_PERIOD).await;
        }
    }
}
