// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The disk attach/detach controller.
//!
//! Per node, the controller moves through Idle → Batching → Flushing and
//! back: concurrent attach/detach requests accumulate into one pending
//! update, exactly one flush (a single consolidated remote mutation) is in
//! flight at a time, and requests arriving mid-flush join the next batch.
//! Requests batched into the same flush share its outcome.
//!
//! Nodes are independent: the per-node gate is keyed, never global.

use crate::helpers::check_disk_exists;
use crate::helpers::filter_detaching_disks;
use crate::helpers::filter_non_existing_disks;
use crate::model::AttachDiskOptions;
use crate::model::DataDisk;
use crate::model::DiskEncryptionSetParameters;
use crate::model::Lun;
use crate::model::ManagedDisk;
use crate::model::ManagedDiskParameters;
use crate::model::RemoteDiskState;
use crate::vmset::NodeModel;
use crate::vmset::VmSet;
use cirrus_arm_client::RateLimitedRetryClient;
use cirrus_arm_client::ResourceTransport;
use cirrus_common::api::Error;
use cirrus_common::api::NodeName;
use cirrus_common::api::ResourceType;
use cirrus_common::backoff::Backoff;
use cirrus_common::config::RetryConfig;
use cirrus_common::OpContext;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// One queued mutation of a node's data-disk list.
enum DiskOp {
    Attach { disk: DataDisk },
    Detach { name: Option<String>, uri: Option<String> },
}

struct PendingOp {
    op: DiskOp,
    /// Lun claimed for an attach at enqueue time, released when its flush
    /// settles.
    claimed_lun: Option<Lun>,
    done: oneshot::Sender<Result<(), Error>>,
}

/// Mutable per-node state: the cached model snapshot and the accumulating
/// pending update.
#[derive(Default)]
struct NodeState {
    cached: Option<NodeModel>,
    pending: Vec<PendingOp>,
    claimed_luns: BTreeSet<Lun>,
}

struct NodeEntry {
    name: NodeName,
    state: tokio::sync::Mutex<NodeState>,
    /// The one-flush-in-flight gate.  Flushes execute in the order this is
    /// acquired; it is never held while idle.
    flush_gate: tokio::sync::Mutex<()>,
}

/// Reconciles disk attachments per compute node against the remote API.
pub struct AttachDetachController<T> {
    log: Logger,
    vmset: Arc<dyn VmSet>,
    disks_client: Arc<RateLimitedRetryClient<T>>,
    retry: RetryConfig,
    nodes: Mutex<HashMap<NodeName, Arc<NodeEntry>>>,
}

impl<T: ResourceTransport> AttachDetachController<T> {
    pub fn new(
        log: &Logger,
        vmset: Arc<dyn VmSet>,
        disks_client: Arc<RateLimitedRetryClient<T>>,
        retry: RetryConfig,
    ) -> AttachDetachController<T> {
        AttachDetachController {
            log: log.new(o!("component" => "disk-controller")),
            vmset,
            disks_client,
            retry,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the disk at `disk_uri` to `node`, returning the assigned lun.
    ///
    /// Idempotent: a disk already attached (and not detaching) yields its
    /// existing lun with no mutation issued.  The assigned lun is published
    /// to `lun_sink`, when supplied, before the remote update completes;
    /// observers must not take that as remote durability.  `existing_disk`
    /// is the disk resource as last seen by the caller, used to reject
    /// attachments the disk's own state forbids.
    pub async fn attach_disk(
        &self,
        opctx: &OpContext,
        node: &NodeName,
        disk_uri: &str,
        options: &AttachDiskOptions,
        existing_disk: Option<&ManagedDisk>,
        lun_sink: Option<oneshot::Sender<Lun>>,
    ) -> Result<Lun, Error> {
        let entry = self.node_entry(node);
        let (lun, outcome) = {
            let mut state = entry.state.lock().await;
            let model =
                self.ensure_snapshot(opctx, node, &mut state).await?.clone();

            if let Some(existing) = model
                .data_disks()
                .iter()
                .find(|d| d.matches(None, Some(disk_uri)) && !d.is_detaching())
            {
                debug!(
                    self.log, "disk already attached";
                    "node" => %node,
                    "disk_uri" => disk_uri,
                    "lun" => existing.lun,
                );
                return Ok(existing.lun);
            }

            if let Some(disk) = existing_disk {
                check_attachable(node, disk_uri, disk)?;
            }

            // An attach for the same disk already in the pending batch:
            // join it rather than claiming a second slot.
            let joined = state.pending.iter().find_map(|p| match &p.op {
                DiskOp::Attach { disk }
                    if disk.matches(None, Some(disk_uri)) =>
                {
                    Some(disk.lun)
                }
                _ => None,
            });

            let (lun, claimed) = match joined {
                Some(lun) => (lun, None),
                None => {
                    let lun = lowest_free_lun(
                        model.data_disks(),
                        &state.claimed_luns,
                        model.max_data_disk_count(),
                    )
                    .ok_or_else(|| {
                        Error::no_available_lun(&format!(
                            "all {} data disk slots on node {} are in use",
                            model.max_data_disk_count(),
                            node,
                        ))
                    })?;
                    state.claimed_luns.insert(lun);
                    (lun, Some(lun))
                }
            };

            let disk = DataDisk {
                name: Some(options.disk_name.clone()),
                lun,
                caching: Some(options.caching),
                write_accelerator_enabled: options
                    .write_accelerator_enabled
                    .then_some(true),
                managed_disk: Some(ManagedDiskParameters {
                    id: Some(disk_uri.to_owned()),
                    disk_encryption_set: options
                        .disk_encryption_set_id
                        .as_ref()
                        .map(|id| DiskEncryptionSetParameters {
                            id: Some(id.clone()),
                        }),
                }),
                to_be_detached: None,
            };
            let (tx, rx) = oneshot::channel();
            state.pending.push(PendingOp {
                op: DiskOp::Attach { disk },
                claimed_lun: claimed,
                done: tx,
            });
            info!(
                self.log, "attach queued";
                "node" => %node,
                "disk_uri" => disk_uri,
                "lun" => lun,
            );
            // Lun assignment is a local decision; publish it right away so
            // the caller can begin device-path discovery.
            if let Some(sink) = lun_sink {
                let _ = sink.send(lun);
            }
            (lun, rx)
        };

        let _ = self.flush_node(opctx, &entry, false).await;
        match outcome.await {
            Ok(Ok(())) => Ok(lun),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::internal_error(&format!(
                "flush outcome dropped for node {}",
                node
            ))),
        }
    }

    /// Detach the disk matching `disk_name` or `disk_uri` from `node`.
    ///
    /// Detaching a disk that is not attached (or a node that does not
    /// exist) succeeds as a no-op; crash recovery re-issues detaches.
    pub async fn detach_disk(
        &self,
        opctx: &OpContext,
        node: &NodeName,
        disk_name: Option<&str>,
        disk_uri: Option<&str>,
    ) -> Result<(), Error> {
        let entry = self.node_entry(node);
        let outcome = {
            let mut state = entry.state.lock().await;
            let model = match self.ensure_snapshot(opctx, node, &mut state).await
            {
                Err(e) if e.is_not_found() => {
                    info!(
                        self.log, "node not found, nothing to detach";
                        "node" => %node,
                    );
                    return Ok(());
                }
                other => other?.clone(),
            };
            if !model
                .data_disks()
                .iter()
                .any(|d| d.matches(disk_name, disk_uri))
            {
                info!(
                    self.log, "disk not attached, nothing to detach";
                    "node" => %node,
                    "disk_name" => disk_name.unwrap_or(""),
                    "disk_uri" => disk_uri.unwrap_or(""),
                );
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.pending.push(PendingOp {
                op: DiskOp::Detach {
                    name: disk_name.map(str::to_owned),
                    uri: disk_uri.map(str::to_owned),
                },
                claimed_lun: None,
                done: tx,
            });
            info!(
                self.log, "detach queued";
                "node" => %node,
                "disk_name" => disk_name.unwrap_or(""),
                "disk_uri" => disk_uri.unwrap_or(""),
            );
            rx
        };

        let _ = self.flush_node(opctx, &entry, false).await;
        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(Error::internal_error(&format!(
                "flush outcome dropped for node {}",
                node
            ))),
        }
    }

    /// Force a flush of whatever is pending for `node`, issuing a remote
    /// update even when nothing is queued.  An absent node is a no-op.
    pub async fn update_vm(
        &self,
        opctx: &OpContext,
        node: &NodeName,
    ) -> Result<(), Error> {
        let entry = self.node_entry(node);
        match self.flush_node(opctx, &entry, true).await {
            Err(e) if e.is_not_found() => {
                info!(
                    self.log, "node not found, nothing to update";
                    "node" => %node,
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Look up the lun of an attached disk, matching by URI first, then by
    /// name.  An absent node is `Ok(None)`; an absent disk on a present
    /// node is a `NotFound` error.
    pub async fn get_disk_lun(
        &self,
        opctx: &OpContext,
        disk_name: Option<&str>,
        disk_uri: Option<&str>,
        node: &NodeName,
    ) -> Result<Option<Lun>, Error> {
        let entry = self.node_entry(node);
        let mut state = entry.state.lock().await;
        let model = match self.ensure_snapshot(opctx, node, &mut state).await {
            Err(e) if e.is_not_found() => return Ok(None),
            other => other?,
        };
        if let Some(uri) = disk_uri {
            if let Some(disk) = model
                .data_disks()
                .iter()
                .find(|d| d.matches(None, Some(uri)))
            {
                return Ok(Some(disk.lun));
            }
        }
        if let Some(name) = disk_name {
            if let Some(disk) = model
                .data_disks()
                .iter()
                .find(|d| d.matches(Some(name), None))
            {
                return Ok(Some(disk.lun));
            }
        }
        Err(Error::not_found(
            ResourceType::Disk,
            disk_name.or(disk_uri).unwrap_or(""),
        ))
    }

    /// Plan lun placement for a whole batch of disks at once, writing the
    /// chosen lun into each entry's options.
    ///
    /// Disks already attached keep their current lun; the rest get the
    /// lowest free slots, atomically across the batch so no two entries
    /// collide.  No attach is issued; this only pre-computes placement.
    pub async fn set_disk_lun(
        &self,
        opctx: &OpContext,
        node: &NodeName,
        disk_map: &mut BTreeMap<String, AttachDiskOptions>,
    ) -> Result<(), Error> {
        if disk_map.is_empty() {
            return Ok(());
        }
        let entry = self.node_entry(node);
        let mut state = entry.state.lock().await;
        let model =
            self.ensure_snapshot(opctx, node, &mut state).await?.clone();

        let occupied: BTreeSet<Lun> = model
            .data_disks()
            .iter()
            .map(|d| d.lun)
            .chain(state.claimed_luns.iter().copied())
            .collect();
        let max = model.max_data_disk_count();

        let mut planned: BTreeMap<String, Lun> = BTreeMap::new();
        for uri in disk_map.keys() {
            if let Some(disk) = model
                .data_disks()
                .iter()
                .find(|d| d.matches(None, Some(uri)))
            {
                planned.insert(uri.clone(), disk.lun);
            }
        }
        let mut free = (0..max).filter(|lun| !occupied.contains(lun));
        for uri in disk_map.keys() {
            if planned.contains_key(uri) {
                continue;
            }
            match free.next() {
                Some(lun) => {
                    planned.insert(uri.clone(), lun);
                }
                None => {
                    return Err(Error::no_available_lun(&format!(
                        "cannot place {} disks on node {}: only {} slots",
                        disk_map.len(),
                        node,
                        max,
                    )));
                }
            }
        }
        for (uri, options) in disk_map.iter_mut() {
            options.lun = planned[uri];
        }
        Ok(())
    }

    /// For each requested disk name, whether it is attached to `node`.  An
    /// absent node maps every name to false; its absence is reported by
    /// other components, not synthesized as an error here.
    pub async fn disks_are_attached(
        &self,
        opctx: &OpContext,
        disk_names: &[String],
        node: &NodeName,
    ) -> Result<BTreeMap<String, bool>, Error> {
        let mut attached: BTreeMap<String, bool> = disk_names
            .iter()
            .map(|name| (name.clone(), false))
            .collect();
        let entry = self.node_entry(node);
        let mut state = entry.state.lock().await;
        let model = match self.ensure_snapshot(opctx, node, &mut state).await {
            Err(e) if e.is_not_found() => return Ok(attached),
            other => other?,
        };
        for name in disk_names {
            if model
                .data_disks()
                .iter()
                .any(|d| d.matches(Some(name), None))
            {
                attached.insert(name.clone(), true);
            }
        }
        Ok(attached)
    }

    /// Whether the managed disk at `disk_uri` currently exists remotely.
    pub async fn check_disk_exists(
        &self,
        opctx: &OpContext,
        disk_uri: &str,
    ) -> Result<bool, Error> {
        check_disk_exists(opctx, &self.disks_client, disk_uri).await
    }

    /// Drop the cached snapshot (and topology resolution) for `node`.
    /// Eviction policy belongs to the caller; the controller never evicts
    /// on its own.
    pub async fn invalidate_node(&self, node: &NodeName) {
        let entry = self.node_entry(node);
        entry.state.lock().await.cached = None;
        self.vmset.invalidate(node);
    }

    fn node_entry(&self, node: &NodeName) -> Arc<NodeEntry> {
        let mut nodes = self.nodes.lock().unwrap();
        Arc::clone(nodes.entry(node.clone()).or_insert_with(|| {
            Arc::new(NodeEntry {
                name: node.clone(),
                state: tokio::sync::Mutex::new(NodeState::default()),
                flush_gate: tokio::sync::Mutex::new(()),
            })
        }))
    }

    async fn ensure_snapshot<'a>(
        &self,
        opctx: &OpContext,
        node: &NodeName,
        state: &'a mut NodeState,
    ) -> Result<&'a NodeModel, Error> {
        if state.cached.is_none() {
            let model = self.vmset.get_data_disks(opctx, node).await?;
            state.cached = Some(model);
        }
        Ok(state.cached.as_ref().unwrap())
    }

    /// Acquire the node's flush gate, drain the pending batch, and issue
    /// one consolidated remote update for it.  The shared outcome is
    /// delivered to every drained request.  With `force`, an update is
    /// issued even when the batch is empty.
    async fn flush_node(
        &self,
        opctx: &OpContext,
        entry: &NodeEntry,
        force: bool,
    ) -> Result<(), Error> {
        let _gate = entry.flush_gate.lock().await;
        let ops = {
            let mut state = entry.state.lock().await;
            std::mem::take(&mut state.pending)
        };
        if ops.is_empty() && !force {
            // The batch containing our request was flushed ahead of us.
            return Ok(());
        }

        let result = self.flush_with_retries(opctx, entry, &ops).await;

        {
            let mut state = entry.state.lock().await;
            for op in &ops {
                if let Some(lun) = op.claimed_lun {
                    state.claimed_luns.remove(&lun);
                }
            }
            match &result {
                // A canceled flush leaves the cached model untouched; the
                // mutation was never confirmed either way.
                Err(Error::DeadlineExceeded { .. }) => {}
                // Otherwise remote truth has (or may have) moved.
                _ => state.cached = None,
            }
        }
        for op in ops {
            let _ = op.done.send(result.clone());
        }
        result
    }

    async fn flush_with_retries(
        &self,
        opctx: &OpContext,
        entry: &NodeEntry,
        ops: &[PendingOp],
    ) -> Result<(), Error> {
        let mut policy = cirrus_common::backoff::policy_with_max(
            self.retry.initial_backoff(),
            self.retry.max_backoff(),
            Some(self.retry.max_elapsed()),
        );
        loop {
            let error = match self.flush_once(opctx, entry, ops).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            // Throttling and conflicts are retried against a freshly
            // fetched model; a missing node is terminal (retrying cannot
            // manufacture an instance), as is everything else.
            if !matches!(
                error,
                Error::Throttled { .. } | Error::Conflict { .. }
            ) {
                return Err(error);
            }
            let Some(delay) = policy.next_backoff() else {
                warn!(
                    self.log, "flush retry budget exhausted";
                    "node" => %entry.name,
                    "error" => %error,
                );
                return Err(error);
            };
            warn!(
                self.log, "flush failed, will retry";
                "node" => %entry.name,
                "error" => %error,
                "delay_ms" => delay.as_millis() as u64,
            );
            entry.state.lock().await.cached = None;
            tokio::time::sleep(delay).await;
        }
    }

    async fn flush_once(
        &self,
        opctx: &OpContext,
        entry: &NodeEntry,
        ops: &[PendingOp],
    ) -> Result<(), Error> {
        let model = {
            let mut state = entry.state.lock().await;
            self.ensure_snapshot(opctx, &entry.name, &mut state)
                .await?
                .clone()
        };
        let mut disks = model.data_disks().to_vec();
        for op in ops {
            apply_op(&mut disks, &op.op, &entry.name)?;
        }
        let disks = filter_detaching_disks(
            filter_non_existing_disks(opctx, &self.disks_client, disks).await,
        );
        debug!(
            self.log, "flushing node update";
            "node" => %entry.name,
            "disk_count" => disks.len(),
        );
        opctx
            .run_until_deadline(
                "flush node update",
                self.vmset.update_data_disks(opctx, &entry.name, &model, disks),
            )
            .await
    }
}

/// The lowest lun in `[0, max)` not present in the current attachment set
/// or already claimed by a pending attach.
fn lowest_free_lun(
    disks: &[DataDisk],
    claimed: &BTreeSet<Lun>,
    max: Lun,
) -> Option<Lun> {
    let used: BTreeSet<Lun> =
        disks.iter().map(|d| d.lun).chain(claimed.iter().copied()).collect();
    (0..max).find(|lun| !used.contains(lun))
}

/// Reject attachments the disk resource's own state forbids.  A shareable
/// disk (max shares above one) is exempt from both checks.
fn check_attachable(
    node: &NodeName,
    disk_uri: &str,
    disk: &ManagedDisk,
) -> Result<(), Error> {
    if disk.is_shareable() {
        return Ok(());
    }
    if let Some(managed_by) = &disk.managed_by {
        return Err(Error::attach_conflict(&format!(
            "disk {} cannot be attached to node {}: already managed by {}",
            disk_uri, node, managed_by,
        )));
    }
    if let Some(state) = disk.properties.disk_state {
        if state != RemoteDiskState::Unattached {
            return Err(Error::attach_conflict(&format!(
                "disk {} is in state {}, expected Unattached",
                disk_uri, state,
            )));
        }
    }
    Ok(())
}

fn apply_op(
    disks: &mut Vec<DataDisk>,
    op: &DiskOp,
    node: &NodeName,
) -> Result<(), Error> {
    match op {
        DiskOp::Attach { disk } => {
            let uri = disk.disk_uri();
            if disks
                .iter()
                .any(|d| d.matches(None, uri) && !d.is_detaching())
            {
                // Already present (an earlier op in this batch, or a retry
                // against a model the mutation partially reached).
                return Ok(());
            }
            if let Some(existing) = disks
                .iter()
                .find(|d| d.lun == disk.lun && !d.is_detaching())
            {
                return Err(Error::attach_conflict(&format!(
                    "lun {} on node {} was claimed concurrently by disk {}",
                    disk.lun,
                    node,
                    existing.name.as_deref().unwrap_or("<unnamed>"),
                )));
            }
            disks.push(disk.clone());
            Ok(())
        }
        DiskOp::Detach { name, uri } => {
            // Soft-delete locally; the wire list drops marked entries.
            for disk in disks
                .iter_mut()
                .filter(|d| d.matches(name.as_deref(), uri.as_deref()))
            {
                disk.to_be_detached = Some(true);
            }
            Ok(())
        }
    }
}
