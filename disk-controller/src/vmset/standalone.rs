// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VMSet over standalone virtual machines: one compute resource per node.

use super::NodeModel;
use super::VmSet;
use crate::model::DataDisk;
use async_trait::async_trait;
use cirrus_arm_client::RateLimitedRetryClient;
use cirrus_arm_client::ResourceTransport;
use cirrus_common::api::Error;
use cirrus_common::api::NodeName;
use cirrus_common::api::ResourceType;
use cirrus_common::OpContext;
use slog::debug;
use slog::o;
use slog::Logger;
use std::sync::Arc;

pub struct StandaloneVmSet<T> {
    log: Logger,
    client: Arc<RateLimitedRetryClient<T>>,
    subscription_id: String,
    resource_group: String,
}

impl<T: ResourceTransport> StandaloneVmSet<T> {
    pub fn new(
        log: &Logger,
        client: Arc<RateLimitedRetryClient<T>>,
        subscription_id: &str,
        resource_group: &str,
    ) -> StandaloneVmSet<T> {
        StandaloneVmSet {
            log: log.new(o!("component" => "vmset-standalone")),
            client,
            subscription_id: subscription_id.to_owned(),
            resource_group: resource_group.to_owned(),
        }
    }

    fn vm_resource_id(&self, node: &NodeName) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}",
            self.subscription_id, self.resource_group, node,
        )
    }
}

#[async_trait]
impl<T: ResourceTransport> VmSet for StandaloneVmSet<T> {
    async fn get_data_disks(
        &self,
        opctx: &OpContext,
        node: &NodeName,
    ) -> Result<NodeModel, Error> {
        let resource_id = self.vm_resource_id(node);
        let resource = self
            .client
            .get::<serde_json::Value>(opctx, &resource_id)
            .await
            .map_err(|e| match e {
                Error::NotFound { .. } => {
                    Error::not_found(ResourceType::Node, node.as_str())
                }
                other => other,
            })?;
        NodeModel::from_resource(&resource_id, resource.body, resource.etag)
    }

    async fn update_data_disks(
        &self,
        opctx: &OpContext,
        node: &NodeName,
        model: &NodeModel,
        disks: Vec<DataDisk>,
    ) -> Result<(), Error> {
        debug!(
            self.log, "updating data disks";
            "node" => %node,
            "disk_count" => disks.len(),
        );
        let body = model.body_with_disks(&disks)?;
        self.client
            .create_or_update(
                opctx,
                model.resource_id(),
                &body,
                model.etag(),
                true,
            )
            .await
    }
}
