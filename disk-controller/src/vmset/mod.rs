// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polymorphic interface over the two compute topologies a node can live in.
//!
//! The controller only ever sees the uniform "get model / update model"
//! contract; whether a node is a standalone VM or one instance of a scale
//! set is resolved here, once per node, and cached.

mod scaleset;
mod standalone;

pub use scaleset::ScaleSetVmSet;
pub use standalone::StandaloneVmSet;

use crate::model;
use crate::model::DataDisk;
use crate::model::Lun;
use async_trait::async_trait;
use cirrus_arm_client::RateLimitedRetryClient;
use cirrus_arm_client::ResourceTransport;
use cirrus_common::api::Error;
use cirrus_common::api::NodeName;
use cirrus_common::config::CloudConfig;
use cirrus_common::config::VmType;
use cirrus_common::OpContext;
use serde_json::Value;
use std::sync::Arc;

/// A node's compute-resource model as last fetched from the remote API.
///
/// Doubles as the model version token: the etag captured here must
/// accompany the update, and a mismatch surfaces as `Conflict`.  The full
/// resource body is retained so an update round-trips fields this crate
/// does not model.
#[derive(Clone, Debug)]
pub struct NodeModel {
    resource_id: String,
    etag: Option<String>,
    vm_size: Option<String>,
    data_disks: Vec<DataDisk>,
    body: Value,
}

impl NodeModel {
    /// Build a model from a raw resource representation.
    pub fn from_resource(
        resource_id: &str,
        body: Value,
        etag: Option<String>,
    ) -> Result<NodeModel, Error> {
        let disks_value = body
            .pointer("/properties/storageProfile/dataDisks")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let data_disks =
            serde_json::from_value(disks_value).map_err(|e| {
                Error::internal_error(&format!(
                    "decoding data disks of {}: {}",
                    resource_id, e
                ))
            })?;
        let vm_size = body
            .pointer("/properties/hardwareProfile/vmSize")
            .or_else(|| body.pointer("/sku/name"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        Ok(NodeModel {
            resource_id: resource_id.to_owned(),
            etag,
            vm_size,
            data_disks,
            body,
        })
    }

    /// Build a model directly from parts; intended for `VmSet`
    /// implementations that do not hold a raw resource body (fakes, tests).
    pub fn from_parts(
        resource_id: &str,
        vm_size: Option<&str>,
        data_disks: Vec<DataDisk>,
        etag: Option<String>,
    ) -> NodeModel {
        NodeModel {
            resource_id: resource_id.to_owned(),
            etag,
            vm_size: vm_size.map(str::to_owned),
            data_disks,
            body: serde_json::json!({}),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn data_disks(&self) -> &[DataDisk] {
        &self.data_disks
    }

    pub fn max_data_disk_count(&self) -> Lun {
        model::max_data_disk_count(self.vm_size.as_deref())
    }

    /// The resource body to send on update, with `disks` substituted in.
    pub fn body_with_disks(&self, disks: &[DataDisk]) -> Result<Value, Error> {
        let mut body = self.body.clone();
        let disks_value = serde_json::to_value(disks).map_err(|e| {
            Error::internal_error(&format!(
                "encoding data disks of {}: {}",
                self.resource_id, e
            ))
        })?;
        if !body.is_object() {
            body = serde_json::json!({});
        }
        let properties = body
            .as_object_mut()
            .unwrap()
            .entry("properties")
            .or_insert_with(|| serde_json::json!({}));
        let storage_profile = properties
            .as_object_mut()
            .ok_or_else(|| {
                Error::internal_error(&format!(
                    "resource {} has non-object properties",
                    self.resource_id
                ))
            })?
            .entry("storageProfile")
            .or_insert_with(|| serde_json::json!({}));
        storage_profile
            .as_object_mut()
            .ok_or_else(|| {
                Error::internal_error(&format!(
                    "resource {} has non-object storage profile",
                    self.resource_id
                ))
            })?
            .insert("dataDisks".to_owned(), disks_value);
        Ok(body)
    }
}

/// Select the VMSet implementation for the configured compute topology.
pub fn from_config<T: ResourceTransport + 'static>(
    log: &slog::Logger,
    client: Arc<RateLimitedRetryClient<T>>,
    config: &CloudConfig,
) -> Result<Arc<dyn VmSet>, Error> {
    match config.vm_type {
        VmType::Standard => Ok(Arc::new(StandaloneVmSet::new(
            log,
            client,
            &config.subscription_id,
            &config.resource_group,
        ))),
        VmType::ScaleSet => {
            let scale_set =
                config.scale_set_name.as_deref().ok_or_else(|| {
                    Error::internal_error(
                        "vm_type is scale-set but no scale_set_name is \
                         configured",
                    )
                })?;
            Ok(Arc::new(ScaleSetVmSet::new(
                log,
                client,
                &config.subscription_id,
                &config.resource_group,
                scale_set,
            )))
        }
    }
}

/// Uniform contract over the compute topologies.
///
/// Implementations surface a concurrent remote modification of the model as
/// `Conflict`; the controller then retries with a freshly fetched model
/// rather than blind-overwriting.
#[async_trait]
pub trait VmSet: Send + Sync {
    /// Fetch the node's current model, including its data-disk list and
    /// version token.
    async fn get_data_disks(
        &self,
        opctx: &OpContext,
        node: &NodeName,
    ) -> Result<NodeModel, Error>;

    /// Replace the node's data-disk list under the model's version token.
    async fn update_data_disks(
        &self,
        opctx: &OpContext,
        node: &NodeName,
        model: &NodeModel,
        disks: Vec<DataDisk>,
    ) -> Result<(), Error>;

    /// Drop any per-node resolution state (topology mapping caches).
    fn invalidate(&self, _node: &NodeName) {}
}
