// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk attach/detach controller for the Cirrus control plane.
//!
//! Reconciles a cluster's desired disk-attachment state against the remote
//! compute API.  The controller assigns hardware slots (LUNs) to disks,
//! serializes conflicting updates to the same compute node, batches
//! concurrent requests into single consolidated mutations, and reconciles
//! in-memory state against remote truth under partial failure.
//!
//! The compute topology behind a node (standalone VM or scale-set instance)
//! is abstracted by the [`vmset::VmSet`] trait; all remote traffic flows
//! through the rate-limited client in `cirrus-arm-client`.

pub mod controller;
pub mod helpers;
pub mod model;
pub mod vmset;

pub use controller::AttachDetachController;
pub use model::AttachDiskOptions;
pub use model::DataDisk;
pub use model::Lun;
pub use model::LUN_UNASSIGNED;
