// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VMSet over scale-set instances: a node is one member of a homogeneous
//! group, addressed by (scale set, instance id).

use super::NodeModel;
use super::VmSet;
use crate::helpers::is_instance_not_found_message;
use crate::model::DataDisk;
use async_trait::async_trait;
use cirrus_arm_client::RateLimitedRetryClient;
use cirrus_arm_client::ResourceTransport;
use cirrus_common::api::Error;
use cirrus_common::api::NodeName;
use cirrus_common::api::ResourceType;
use cirrus_common::OpContext;
use serde::Deserialize;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

/// Listing entry for one scale-set instance.  The node name callers use is
/// the instance's computer name, which may differ from the resource name.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScaleSetVmEntry {
    instance_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    properties: Option<ScaleSetVmProperties>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScaleSetVmProperties {
    #[serde(default)]
    os_profile: Option<OsProfile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OsProfile {
    #[serde(default)]
    computer_name: Option<String>,
}

impl ScaleSetVmEntry {
    fn is_named(&self, node: &NodeName) -> bool {
        let computer_name = self
            .properties
            .as_ref()
            .and_then(|p| p.os_profile.as_ref())
            .and_then(|p| p.computer_name.as_deref());
        computer_name
            .map_or(false, |n| n.eq_ignore_ascii_case(node.as_str()))
            || self
                .name
                .as_deref()
                .map_or(false, |n| n.eq_ignore_ascii_case(node.as_str()))
    }
}

pub struct ScaleSetVmSet<T> {
    log: Logger,
    client: Arc<RateLimitedRetryClient<T>>,
    subscription_id: String,
    resource_group: String,
    scale_set: String,
    /// node name → instance id, resolved once per node and dropped only via
    /// `invalidate`.
    instances: Mutex<HashMap<NodeName, String>>,
}

impl<T: ResourceTransport> ScaleSetVmSet<T> {
    pub fn new(
        log: &Logger,
        client: Arc<RateLimitedRetryClient<T>>,
        subscription_id: &str,
        resource_group: &str,
        scale_set: &str,
    ) -> ScaleSetVmSet<T> {
        ScaleSetVmSet {
            log: log.new(o!("component" => "vmset-scaleset")),
            client,
            subscription_id: subscription_id.to_owned(),
            resource_group: resource_group.to_owned(),
            scale_set: scale_set.to_owned(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn collection_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}/virtualMachines",
            self.subscription_id, self.resource_group, self.scale_set,
        )
    }

    fn instance_resource_id(&self, instance_id: &str) -> String {
        format!("{}/{}", self.collection_id(), instance_id)
    }

    async fn resolve_instance(
        &self,
        opctx: &OpContext,
        node: &NodeName,
    ) -> Result<String, Error> {
        if let Some(instance_id) =
            self.instances.lock().unwrap().get(node).cloned()
        {
            return Ok(instance_id);
        }
        let entries: Vec<ScaleSetVmEntry> =
            self.client.list(opctx, &self.collection_id()).await?;
        let entry = entries
            .iter()
            .find(|entry| entry.is_named(node))
            .ok_or_else(|| {
                Error::not_found(ResourceType::Node, node.as_str())
            })?;
        debug!(
            self.log, "resolved scale set instance";
            "node" => %node,
            "instance_id" => &entry.instance_id,
        );
        self.instances
            .lock()
            .unwrap()
            .insert(node.clone(), entry.instance_id.clone());
        Ok(entry.instance_id.clone())
    }
}

#[async_trait]
impl<T: ResourceTransport> VmSet for ScaleSetVmSet<T> {
    async fn get_data_disks(
        &self,
        opctx: &OpContext,
        node: &NodeName,
    ) -> Result<NodeModel, Error> {
        let instance_id = self.resolve_instance(opctx, node).await?;
        let resource_id = self.instance_resource_id(&instance_id);
        let resource = self
            .client
            .get::<serde_json::Value>(opctx, &resource_id)
            .await
            .map_err(|e| match e {
                Error::NotFound { .. } => {
                    // The mapping went stale underneath us; drop it so the
                    // next call re-resolves.
                    self.invalidate(node);
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
            self.log, "updating instance data disks";
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
            .map_err(|e| match &e {
                Error::RequestError { message, .. }
                    if is_instance_not_found_message(message) =>
                {
                    self.invalidate(node);
                    Error::not_found(ResourceType::Node, node.as_str())
                }
                _ => e,
            })
    }

    fn invalidate(&self, node: &NodeName) {
        self.instances.lock().unwrap().remove(node);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use cirrus_arm_client::OperationHandle;
    use cirrus_arm_client::RateLimitPolicy;
    use cirrus_arm_client::TransportError;
    use cirrus_arm_client::TransportResponse;
    use http::StatusCode;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn opctx() -> OpContext {
        OpContext::new(&test_logger())
    }

    /// One scale set with two instances; counts listings and rejects
    /// updates when primed to.
    struct FakeScaleSetApi {
        list_calls: Arc<AtomicUsize>,
        reject_update_message: Arc<Mutex<Option<String>>>,
    }

    impl FakeScaleSetApi {
        fn new() -> FakeScaleSetApi {
            FakeScaleSetApi {
                list_calls: Arc::new(AtomicUsize::new(0)),
                reject_update_message: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl ResourceTransport for FakeScaleSetApi {
        async fn get(
            &self,
            resource_id: &str,
        ) -> Result<TransportResponse, TransportError> {
            if resource_id.ends_with("/virtualMachines/4") {
                Ok(TransportResponse {
                    etag: Some("w/1".to_owned()),
                    ..TransportResponse::ok(json!({
                        "instanceId": "4",
                        "sku": {"name": "Standard_D4s_v3"},
                        "properties": {
                            "osProfile": {"computerName": "agent-000004"},
                            "storageProfile": {"dataDisks": []},
                        },
                    }))
                })
            } else {
                Ok(TransportResponse::status_only(StatusCode::NOT_FOUND))
            }
        }

        async fn list(
            &self,
            _collection_id: &str,
        ) -> Result<TransportResponse, TransportError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(TransportResponse::ok(json!({
                "value": [
                    {
                        "instanceId": "3",
                        "name": "agents_3",
                        "properties": {
                            "osProfile": {"computerName": "agent-000003"},
                        },
                    },
                    {
                        "instanceId": "4",
                        "name": "agents_4",
                        "properties": {
                            "osProfile": {"computerName": "agent-000004"},
                        },
                    },
                ],
            })))
        }

        async fn put(
            &self,
            _resource_id: &str,
            _body: serde_json::Value,
            _etag: Option<&str>,
        ) -> Result<TransportResponse, TransportError> {
            if let Some(message) =
                self.reject_update_message.lock().unwrap().take()
            {
                return Ok(TransportResponse {
                    status: StatusCode::BAD_REQUEST,
                    ..TransportResponse::ok(
                        json!({"error": {"message": message}}),
                    )
                });
            }
            Ok(TransportResponse::status_only(StatusCode::OK))
        }

        async fn delete(
            &self,
            _resource_id: &str,
        ) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse::status_only(StatusCode::OK))
        }

        async fn wait_for_operation(
            &self,
            _operation: &OperationHandle,
        ) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse::status_only(StatusCode::OK))
        }
    }

    fn vmset(api: FakeScaleSetApi) -> ScaleSetVmSet<FakeScaleSetApi> {
        let log = test_logger();
        let client = Arc::new(RateLimitedRetryClient::new(
            &log,
            api,
            RateLimitPolicy::Always,
            RateLimitPolicy::Always,
        ));
        ScaleSetVmSet::new(&log, client, "sub", "rg", "agents")
    }

    #[tokio::test]
    async fn test_instance_resolution_is_cached() {
        let api = FakeScaleSetApi::new();
        let list_calls = Arc::clone(&api.list_calls);
        let vmset = vmset(api);
        let node = NodeName::from("agent-000004");

        let model = vmset.get_data_disks(&opctx(), &node).await.unwrap();
        assert!(model.resource_id().ends_with("/virtualMachines/4"));
        assert_eq!(model.max_data_disk_count(), 8);

        // second fetch reuses the cached instance mapping
        vmset.get_data_disks(&opctx(), &node).await.unwrap();
        assert_eq!(list_calls.load(Ordering::SeqCst), 1);

        // until it is invalidated
        vmset.invalidate(&node);
        vmset.get_data_disks(&opctx(), &node).await.unwrap();
        assert_eq!(list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_node_is_not_found() {
        let vmset = vmset(FakeScaleSetApi::new());
        let error = vmset
            .get_data_disks(&opctx(), &NodeName::from("agent-000099"))
            .await
            .unwrap_err();
        assert_matches!(error, Error::NotFound { .. });
    }

    #[tokio::test]
    async fn test_inactive_instance_update_maps_to_not_found() {
        let api = FakeScaleSetApi::new();
        let reject = Arc::clone(&api.reject_update_message);
        *reject.lock().unwrap() = Some(
            "The provided instanceId 4 is not an active Virtual Machine \
             Scale Set VM instanceId."
                .to_owned(),
        );
        let vmset = vmset(api);
        let node = NodeName::from("agent-000004");
        let model = vmset.get_data_disks(&opctx(), &node).await.unwrap();

        let error = vmset
            .update_data_disks(&opctx(), &node, &model, Vec::new())
            .await
            .unwrap_err();
        assert_matches!(error, Error::NotFound { .. });
        // the stale mapping was dropped
        assert!(vmset.instances.lock().unwrap().is_empty());
    }
}
