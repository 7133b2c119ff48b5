// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creation-data derivation and data-disk list reconciliation helpers.

use crate::model::CreationData;
use crate::model::DataDisk;
use crate::model::DiskCreateOption;
use crate::model::ManagedDisk;
use cirrus_arm_client::RateLimitedRetryClient;
use cirrus_arm_client::ResourceTransport;
use cirrus_common::api::Error;
use cirrus_common::OpContext;
use once_cell::sync::Lazy;
use regex::Regex;
use slog::warn;

/// Source kinds accepted by [`derive_creation_data`].
pub const SOURCE_SNAPSHOT: &str = "snapshot";
pub const SOURCE_VOLUME: &str = "volume";

static MANAGED_DISK_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i).*/subscriptions/(?:.*)/resourceGroups/(?:.*)/providers/Microsoft\.Compute/disks/(.+)",
    )
    .unwrap()
});

static DISK_SNAPSHOT_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i).*/subscriptions/(?:.*)/resourceGroups/(?:.*)/providers/Microsoft\.Compute/snapshots/(.+)",
    )
    .unwrap()
});

fn managed_disk_path(sub: &str, rg: &str, name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/disks/{}",
        sub, rg, name
    )
}

fn disk_snapshot_path(sub: &str, rg: &str, name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/snapshots/{}",
        sub, rg, name
    )
}

/// Derive the creation data for a new volume from a source reference.
///
/// An empty `source_kind` yields a blank volume.  For `snapshot` and
/// `volume` sources, a bare name is expanded under the supplied subscription
/// and resource group; a fully-qualified id is used as-is, even when scoped
/// elsewhere.  Pure: no remote lookups, no side effects.
pub fn derive_creation_data(
    subscription_id: &str,
    resource_group: &str,
    source_resource_id: &str,
    source_kind: &str,
) -> Result<CreationData, Error> {
    let (re, qualified) = match source_kind {
        SOURCE_SNAPSHOT => (
            &*DISK_SNAPSHOT_PATH_RE,
            disk_snapshot_path(
                subscription_id,
                resource_group,
                source_resource_id,
            ),
        ),
        SOURCE_VOLUME => (
            &*MANAGED_DISK_PATH_RE,
            managed_disk_path(
                subscription_id,
                resource_group,
                source_resource_id,
            ),
        ),
        _ => {
            return Ok(CreationData {
                create_option: DiskCreateOption::Empty,
                source_resource_id: None,
            })
        }
    };

    let source_id = if re.is_match(source_resource_id) {
        source_resource_id.to_owned()
    } else {
        qualified
    };
    // A canonical id has exactly nine slash-separated components.
    if source_id.split('/').count() != 9 {
        return Err(Error::invalid_reference(&format!(
            "source resource id {} is invalid, expected format: {}",
            source_id,
            re.as_str(),
        )));
    }
    Ok(CreationData {
        create_option: DiskCreateOption::Copy,
        source_resource_id: Some(source_id),
    })
}

/// Drop entries already marked for detach, preserving the order of the
/// remainder.  An absent marker counts as "not detaching".
pub fn filter_detaching_disks(disks: Vec<DataDisk>) -> Vec<DataDisk> {
    disks.into_iter().filter(|disk| !disk.is_detaching()).collect()
}

/// Drop entries whose managed disk no longer exists remotely.
///
/// Only a confirmed `NotFound` drops a disk; an ambiguous remote error must
/// not silently remove a real attachment, so every other outcome keeps it.
pub async fn filter_non_existing_disks<T: ResourceTransport>(
    opctx: &OpContext,
    client: &RateLimitedRetryClient<T>,
    disks: Vec<DataDisk>,
) -> Vec<DataDisk> {
    let mut kept = Vec::with_capacity(disks.len());
    for disk in disks {
        let uri = match disk.disk_uri() {
            // Not a managed disk reference; nothing to look up.
            None => {
                kept.push(disk);
                continue;
            }
            Some(uri) => uri.to_owned(),
        };
        match client.get::<ManagedDisk>(opctx, &uri).await {
            Ok(_) => kept.push(disk),
            Err(e) if e.is_not_found() => {
                warn!(
                    opctx.log(), "dropping reference to deleted disk";
                    "disk_uri" => &uri,
                );
            }
            Err(e) => {
                warn!(
                    opctx.log(),
                    "disk lookup failed, keeping attachment";
                    "disk_uri" => &uri,
                    "error" => %e,
                );
                kept.push(disk);
            }
        }
    }
    kept
}

/// Whether the given managed-disk URI names a disk that currently exists.
/// A malformed URI is an error, not a "no".
pub async fn check_disk_exists<T: ResourceTransport>(
    opctx: &OpContext,
    client: &RateLimitedRetryClient<T>,
    disk_uri: &str,
) -> Result<bool, Error> {
    if !MANAGED_DISK_PATH_RE.is_match(disk_uri) {
        return Err(Error::invalid_reference(&format!(
            "disk uri {} is invalid, expected format: {}",
            disk_uri,
            MANAGED_DISK_PATH_RE.as_str(),
        )));
    }
    match client.get::<ManagedDisk>(opctx, disk_uri).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Extract the disk name from a canonical managed-disk URI.
pub fn disk_name_from_uri(disk_uri: &str) -> Result<&str, Error> {
    MANAGED_DISK_PATH_RE
        .captures(disk_uri)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| {
            Error::invalid_reference(&format!(
                "disk uri {} is invalid, expected format: {}",
                disk_uri,
                MANAGED_DISK_PATH_RE.as_str(),
            ))
        })
}

/// The scale-set API reports a deallocated or deleted instance through a
/// well-known message rather than a 404.
pub fn is_instance_not_found_message(message: &str) -> bool {
    message
        .to_lowercase()
        .contains("is not an active virtual machine scale set vm instanceid")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::ManagedDiskParameters;
    use assert_matches::assert_matches;

    fn data_disk(
        name: &str,
        to_be_detached: Option<bool>,
        managed_id: Option<&str>,
    ) -> DataDisk {
        DataDisk {
            name: Some(name.to_owned()),
            lun: 0,
            caching: None,
            write_accelerator_enabled: None,
            managed_disk: managed_id.map(|id| ManagedDiskParameters {
                id: Some(id.to_owned()),
                disk_encryption_set: None,
            }),
            to_be_detached,
        }
    }

    #[test]
    fn test_filter_detaching_disks() {
        let disks = vec![
            data_disk("DiskName1", Some(false), Some("ManagedID")),
            data_disk("DiskName2", Some(true), None),
            data_disk("DiskName3", None, None),
            data_disk("DiskName4", None, None),
        ];
        let filtered = filter_detaching_disks(disks);
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered[0].name.as_deref(), Some("DiskName1"));
        assert_eq!(
            filtered[0].managed_disk.as_ref().unwrap().id.as_deref(),
            Some("ManagedID")
        );
        assert_eq!(filtered[1].name.as_deref(), Some("DiskName3"));
        assert_eq!(filtered[2].name.as_deref(), Some("DiskName4"));

        assert!(filter_detaching_disks(Vec::new()).is_empty());
    }

    #[test]
    fn test_derive_creation_data_empty() {
        let data = derive_creation_data("", "", "", "").unwrap();
        assert_eq!(data.create_option, DiskCreateOption::Empty);
        assert_eq!(data.source_resource_id, None);

        // a bare source id with no kind still means a blank volume
        let data = derive_creation_data("", "", "xxx", "").unwrap();
        assert_eq!(data.create_option, DiskCreateOption::Empty);
    }

    #[test]
    fn test_derive_creation_data_qualified_ids() {
        let snapshot_id = "/subscriptions/xxx/resourceGroups/xxx/providers/Microsoft.Compute/snapshots/xxx";
        let data =
            derive_creation_data("", "", snapshot_id, SOURCE_SNAPSHOT)
                .unwrap();
        assert_eq!(data.create_option, DiskCreateOption::Copy);
        assert_eq!(data.source_resource_id.as_deref(), Some(snapshot_id));

        let volume_id = "/subscriptions/xxx/resourceGroups/xxx/providers/Microsoft.Compute/disks/xxx";
        let data =
            derive_creation_data("", "", volume_id, SOURCE_VOLUME).unwrap();
        assert_eq!(data.source_resource_id.as_deref(), Some(volume_id));
    }

    #[test]
    fn test_derive_creation_data_bare_names_expand() {
        let data =
            derive_creation_data("xxx", "xxx", "xxx", SOURCE_SNAPSHOT)
                .unwrap();
        assert_eq!(
            data.source_resource_id.as_deref(),
            Some("/subscriptions/xxx/resourceGroups/xxx/providers/Microsoft.Compute/snapshots/xxx"),
        );

        let data = derive_creation_data("xxx", "xxx", "xxx", SOURCE_VOLUME)
            .unwrap();
        assert_eq!(
            data.source_resource_id.as_deref(),
            Some("/subscriptions/xxx/resourceGroups/xxx/providers/Microsoft.Compute/disks/xxx"),
        );
    }

    #[test]
    fn test_derive_creation_data_malformed() {
        // missing resourceGroups segment
        let err = derive_creation_data(
            "",
            "",
            "/subscriptions/23/providers/Microsoft.Compute/disks/name",
            SOURCE_SNAPSHOT,
        )
        .unwrap_err();
        assert_matches!(err, Error::InvalidReference { message }
            if message.contains("expected format")
                && message.contains("snapshots"));

        // an arbitrary URL
        let err = derive_creation_data(
            "",
            "",
            "http://test.com/vhds/name",
            SOURCE_SNAPSHOT,
        )
        .unwrap_err();
        assert_matches!(err, Error::InvalidReference { .. });

        // matches the pattern, but has trailing segments
        let err = derive_creation_data(
            "",
            "",
            "/subscriptions/xxx/resourceGroups/xxx/providers/Microsoft.Compute/snapshots/xxx/snapshots/xxx/snapshots/xxx",
            SOURCE_SNAPSHOT,
        )
        .unwrap_err();
        assert_matches!(err, Error::InvalidReference { message }
            if message.contains("/snapshots/xxx/snapshots/xxx/snapshots/xxx"));

        // a snapshot id is not a valid volume source
        let err = derive_creation_data(
            "",
            "",
            "/subscriptions/xxx/resourceGroups/xxx/providers/Microsoft.Compute/snapshots/xxx",
            SOURCE_VOLUME,
        )
        .unwrap_err();
        assert_matches!(err, Error::InvalidReference { message }
            if message.contains("disks"));
    }

    #[test]
    fn test_disk_name_from_uri() {
        let uri = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/disks/data-01";
        assert_eq!(disk_name_from_uri(uri).unwrap(), "data-01");
        assert_matches!(
            disk_name_from_uri("incorrect disk URI format"),
            Err(Error::InvalidReference { .. })
        );
    }

    #[test]
    fn test_is_instance_not_found_message() {
        assert!(!is_instance_not_found_message(""));
        assert!(!is_instance_not_found_message("other error"));
        assert!(is_instance_not_found_message(
            "The provided instanceId 857 is not an active Virtual Machine \
             Scale Set VM instanceId."
        ));
        assert!(is_instance_not_found_message(
            r#"compute.VirtualMachineScaleSetVMsClient#Update: Failure sending request: StatusCode=400 -- Original Error: Code="InvalidParameter" Message="The provided instanceId 1181 is not an active Virtual Machine Scale Set VM instanceId." Target="instanceIds""#
        ));
    }
}
