// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire model of the remote compute API's disk-related resources.

use serde::Deserialize;
use serde::Serialize;

/// Logical Unit Number: the hardware slot a data disk occupies on a node.
/// Scarce; the addressable range is bounded by the node's VM size.
pub type Lun = i32;

/// Sentinel for an attachment whose slot has not been assigned yet.
pub const LUN_UNASSIGNED: Lun = -1;

/// Cap applied when the VM size is not in the table.
const DEFAULT_MAX_DATA_DISKS: i32 = 16;

/// One entry in a compute node's data-disk list.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDisk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "unassigned_lun")]
    pub lun: Lun,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching: Option<CachingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_accelerator_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_disk: Option<ManagedDiskParameters>,
    /// Soft-delete marker: set locally when a detach is pending, and
    /// stripped (together with the entry) from the list sent remotely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_be_detached: Option<bool>,
}

fn unassigned_lun() -> Lun {
    LUN_UNASSIGNED
}

impl DataDisk {
    /// URI of the managed disk backing this attachment, when there is one.
    pub fn disk_uri(&self) -> Option<&str> {
        self.managed_disk.as_ref().and_then(|m| m.id.as_deref())
    }

    pub fn is_detaching(&self) -> bool {
        self.to_be_detached == Some(true)
    }

    /// Whether this entry matches the given disk name or URI.  Either key
    /// suffices; comparisons are case-insensitive, as remote resource
    /// identifiers are.
    pub fn matches(&self, name: Option<&str>, uri: Option<&str>) -> bool {
        if let Some(uri) = uri {
            if self
                .disk_uri()
                .map_or(false, |u| u.eq_ignore_ascii_case(uri))
            {
                return true;
            }
        }
        if let Some(name) = name {
            if self
                .name
                .as_deref()
                .map_or(false, |n| n.eq_ignore_ascii_case(name))
            {
                return true;
            }
        }
        false
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedDiskParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_encryption_set: Option<DiskEncryptionSetParameters>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskEncryptionSetParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Host caching discipline for an attachment.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum CachingMode {
    None,
    #[default]
    ReadOnly,
    ReadWrite,
}

/// Caller-supplied parameters for one attach request.
#[derive(Clone, Debug)]
pub struct AttachDiskOptions {
    pub disk_name: String,
    pub caching: CachingMode,
    pub write_accelerator_enabled: bool,
    pub disk_encryption_set_id: Option<String>,
    /// Slot to use; [`LUN_UNASSIGNED`] lets the controller pick.
    pub lun: Lun,
}

impl AttachDiskOptions {
    pub fn new(disk_name: &str) -> AttachDiskOptions {
        AttachDiskOptions {
            disk_name: disk_name.to_owned(),
            caching: CachingMode::default(),
            write_accelerator_enabled: false,
            disk_encryption_set_id: None,
            lun: LUN_UNASSIGNED,
        }
    }
}

/// The managed-disk resource itself, as returned by a disk lookup.  Distinct
/// from [`DataDisk`], which is the attachment entry embedded in a node.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedDisk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resource id of the compute node this disk is attached to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_by: Option<String>,
    #[serde(default)]
    pub properties: ManagedDiskProperties,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedDiskProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_state: Option<RemoteDiskState>,
    /// Number of nodes the disk may be attached to simultaneously; absent
    /// or 1 means exclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_shares: Option<i32>,
}

impl ManagedDisk {
    /// Whether the disk supports simultaneous attachment to several nodes.
    pub fn is_shareable(&self) -> bool {
        self.properties.max_shares.map_or(false, |shares| shares > 1)
    }
}

/// Attachment state of a managed disk as reported by the remote API.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RemoteDiskState {
    Unattached,
    Attached,
    Reserved,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for RemoteDiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RemoteDiskState::Unattached => "Unattached",
            RemoteDiskState::Attached => "Attached",
            RemoteDiskState::Reserved => "Reserved",
            RemoteDiskState::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Describes how a new storage volume originates.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationData {
    pub create_option: DiskCreateOption,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_resource_id: Option<String>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum DiskCreateOption {
    #[default]
    Empty,
    Copy,
}

/// Number of data disks the given VM size can address.
///
/// Abbreviated SKU table covering the families we deploy; anything
/// unrecognized gets [`DEFAULT_MAX_DATA_DISKS`].
pub fn max_data_disk_count(vm_size: Option<&str>) -> i32 {
    match vm_size {
        Some("Standard_B1s" | "Standard_B1ms") => 2,
        Some("Standard_B2s" | "Standard_D2s_v3" | "Standard_D2_v3") => 4,
        Some("Standard_D4s_v3" | "Standard_D4_v3" | "Standard_E4s_v3") => 8,
        Some(
            "Standard_D8s_v3" | "Standard_D8_v3" | "Standard_E8s_v3"
            | "Standard_DS3_v2",
        ) => 16,
        Some(
            "Standard_D16s_v3" | "Standard_D16_v3" | "Standard_E16s_v3"
            | "Standard_DS4_v2",
        ) => 32,
        Some(
            "Standard_D32s_v3" | "Standard_D32_v3" | "Standard_E32s_v3"
            | "Standard_DS5_v2",
        ) => 32,
        Some("Standard_D64s_v3" | "Standard_E64s_v3") => 64,
        _ => DEFAULT_MAX_DATA_DISKS,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_disk_wire_shape() {
        let disk: DataDisk = serde_json::from_value(json!({
            "name": "disk-1",
            "lun": 2,
            "caching": "ReadOnly",
            "managedDisk": {"id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/disks/disk-1"},
        }))
        .unwrap();
        assert_eq!(disk.lun, 2);
        assert!(!disk.is_detaching());
        assert!(disk.matches(Some("DISK-1"), None));
        assert!(disk.matches(
            None,
            Some("/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/disks/DISK-1"),
        ));
        assert!(!disk.matches(Some("disk-2"), None));

        // a disk with no lun on the wire deserializes as unassigned
        let bare: DataDisk =
            serde_json::from_value(json!({"name": "disk-2"})).unwrap();
        assert_eq!(bare.lun, LUN_UNASSIGNED);
    }

    #[test]
    fn test_managed_disk_shareability() {
        let exclusive: ManagedDisk = serde_json::from_value(json!({
            "name": "d",
            "managedBy": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm0",
            "properties": {"diskState": "Attached", "maxShares": 1},
        }))
        .unwrap();
        assert!(!exclusive.is_shareable());
        assert_eq!(
            exclusive.properties.disk_state,
            Some(RemoteDiskState::Attached)
        );

        let shared: ManagedDisk = serde_json::from_value(json!({
            "name": "d",
            "properties": {"maxShares": 3},
        }))
        .unwrap();
        assert!(shared.is_shareable());
    }

    #[test]
    fn test_max_data_disk_count() {
        assert_eq!(max_data_disk_count(Some("Standard_B1s")), 2);
        assert_eq!(max_data_disk_count(Some("Standard_D8s_v3")), 16);
        assert_eq!(max_data_disk_count(Some("Standard_Mystery")), 16);
        assert_eq!(max_data_disk_count(None), 16);
    }
}
