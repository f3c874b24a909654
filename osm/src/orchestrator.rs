//! Migration orchestrator (C6, spec.md §4.6): the per-VM state machine
//! that sequences C1–C5 per disk, with guaranteed cleanup on every exit
//! path.

use std::collections::HashMap;

use tracing::{error, info, warn};

use crate::config::{MigrateInput, VolumeTypeMapping};
use crate::convert::{self, ConvertRequest};
use crate::error::{Error, Result};
use crate::model::{
    capacity_gib_ceil, decide, volume_name, Decision, DiskOutcome, DiskOutcomeKind, GuestFamily,
    MigrationOutcome, MigrationResult, SourceVM, Volume, META_CHANGE_ID, META_CONVERTED, META_OSM,
};
use crate::mover;
use crate::openstack::OpenStackSession;
use crate::proc::{Endpoint, Supervised};
use crate::run::RunContext;
use crate::vmware::VmwareSession;

/// Everything the orchestrator needs beyond the raw JSON input: the
/// sessions and the run context.
pub struct Orchestrator<'a> {
    pub vmware: &'a VmwareSession,
    pub openstack: &'a OpenStackSession,
    pub run: &'a RunContext,
    pub input: &'a MigrateInput,
}

/// Outcome of handling one disk, used to decide whether to escalate v2v
/// to the next disk (spec.md §4.6 failure semantics).
struct DiskHandled {
    outcome: DiskOutcome,
    v2v_failed: bool,
}

impl<'a> Orchestrator<'a> {
    /// Runs the full per-VM migration (spec.md §4.6 state machine).
    pub async fn migrate(&self) -> Result<MigrationResult> {
        let vm = self.vmware.find_vm(&self.input.vmname).await?;
        let safe_vm_name = crate::run::safe_name(&self.input.vmname);

        let mut disks = Vec::new();
        let mut force_v2v = false;
        let mut any_v2v_fail = false;

        for (index, disk) in vm.disks.iter().enumerate() {
            self.run.cancel.check()?;

            let existing = self.openstack.find_volume(&safe_vm_name, disk.key).await?;
            let decision = decide(existing.as_ref(), self.input.cbtsync, self.input.cutover);

            if let Decision::Skip = decision {
                let vol = existing.expect("Skip decision implies an existing volume");
                disks.push(DiskOutcome {
                    disk_key: disk.key,
                    volume_id: vol.id,
                    outcome: DiskOutcomeKind::Skipped,
                });
                continue;
            }
            if let Decision::Refuse = decision {
                let vol = existing.expect("Refuse decision implies an existing volume");
                return Err(Error::Precondition {
                    message: "volume already exists".to_owned(),
                    existing_volume_id: Some(vol.id),
                });
            }

            let is_boot_disk = index == 0;
            let run_v2v = !self.input.skipconversion && (is_boot_disk || force_v2v);

            let handled = self
                .handle_disk(&vm, &safe_vm_name, disk, existing, decision, run_v2v)
                .await?;

            if handled.v2v_failed {
                any_v2v_fail = true;
                force_v2v = true;
            } else if run_v2v {
                force_v2v = false;
            }

            disks.push(handled.outcome);
        }

        let outcome = if any_v2v_fail {
            MigrationOutcome::PartialV2VFailure
        } else {
            MigrationOutcome::Succeeded
        };

        Ok(MigrationResult { outcome, disks })
    }

    /// Handles one disk end to end: power-off (if needed), snapshot,
    /// volume, nbdkit, copy, v2v, metadata — with cleanup run on every
    /// exit path.
    async fn handle_disk(
        &self,
        vm: &SourceVM,
        safe_vm_name: &str,
        disk: &crate::model::VirtualDisk,
        existing: Option<Volume>,
        decision: Decision,
        run_v2v: bool,
    ) -> Result<DiskHandled> {
        // spec.md §9 Open Question: Windows is shut down before the
        // snapshot whenever v2v will run on this disk; Linux is not.
        // Preserved as documented, asymmetric behavior (DESIGN.md).
        let needs_power_off =
            self.input.cutover || (run_v2v && vm.guest_family == GuestFamily::Windows);
        if needs_power_off {
            self.vmware.power_off(vm).await?;
        }

        let snapshot = self.vmware.create_snapshot(vm).await?;
        let result = self
            .copy_and_convert(vm, safe_vm_name, disk, existing, decision, run_v2v, &snapshot)
            .await;

        if let Err(e) = self.vmware.remove_snapshot(&snapshot).await {
            warn!(disk_key = disk.key, error = %e, "snapshot removal failed");
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_and_convert(
        &self,
        vm: &SourceVM,
        safe_vm_name: &str,
        disk: &crate::model::VirtualDisk,
        existing: Option<Volume>,
        decision: Decision,
        run_v2v: bool,
        snapshot: &crate::model::SnapshotRef,
    ) -> Result<DiskHandled> {
        let volume = match existing {
            Some(v) => v,
            None => self.ensure_volume(vm, safe_vm_name, disk).await?,
        };

        let conversion_host_id = self.input.instanceuuid.clone();
        self.openstack
            .attach(&volume.id, conversion_host_id.as_deref())
            .await?;

        let attach_result = self.sync_disk(vm, disk, &volume, decision, snapshot).await;
        let new_change_id = match attach_result {
            Ok(cid) => cid,
            Err(e) => {
                self.detach_best_effort(&volume.id, conversion_host_id.as_deref()).await;
                return Err(e);
            }
        };

        let device = OpenStackSession::find_device_path(&volume.id)?;

        let mut v2v_failed = false;
        let outcome_kind = if run_v2v {
            let request = ConvertRequest {
                device: &device,
                guest_family: vm.guest_family,
                run_script: self.input.run_script.as_deref().map(std::path::Path::new),
                boot_script: self.input.boot_script.as_deref().map(std::path::Path::new),
                extra_opts: self.input.extra_opts.as_deref(),
                debug: self.input.debug,
            };
            match convert::run(&request).await {
                Ok(()) => {
                    let mut patch = HashMap::new();
                    patch.insert(META_CONVERTED.to_owned(), "true".to_owned());
                    if let Err(e) = self.openstack.write_metadata(&volume.id, &patch).await {
                        warn!(volume_id = %volume.id, error = %e, "post-v2v metadata write failed; will be detected on next run");
                    }
                    DiskOutcomeKind::Converted
                }
                Err(Error::Conversion { stderr_tail }) => {
                    error!(disk_key = disk.key, %stderr_tail, "virt-v2v-in-place failed");
                    v2v_failed = true;
                    DiskOutcomeKind::V2vFail
                }
                Err(e) => {
                    self.detach_best_effort(&volume.id, conversion_host_id.as_deref()).await;
                    return Err(e);
                }
            }
        } else {
            let mut patch = HashMap::new();
            patch.insert(META_CONVERTED.to_owned(), "false".to_owned());
            if !new_change_id.is_empty() {
                patch.insert(META_CHANGE_ID.to_owned(), new_change_id);
            }
            if let Err(e) = self.openstack.write_metadata(&volume.id, &patch).await {
                warn!(volume_id = %volume.id, error = %e, "metadata write failed");
            }
            DiskOutcomeKind::Copied
        };

        self.detach_best_effort(&volume.id, conversion_host_id.as_deref()).await;

        Ok(DiskHandled {
            outcome: DiskOutcome {
                disk_key: disk.key,
                volume_id: volume.id,
                outcome: outcome_kind,
            },
            v2v_failed,
        })
    }

    async fn detach_best_effort(&self, volume_id: &str, conversion_host_id: Option<&str>) {
        let Some(host_id) = conversion_host_id else {
            warn!(volume_id, "no conversion host id recorded; skipping detach");
            return;
        };
        if let Err(e) = self.openstack.detach(volume_id, host_id).await {
            warn!(volume_id, error = %e, "detach failed");
        }
    }

    async fn ensure_volume(
        &self,
        vm: &SourceVM,
        safe_vm_name: &str,
        disk: &crate::model::VirtualDisk,
    ) -> Result<Volume> {
        let name = volume_name(safe_vm_name, disk.key);
        let size_gib = capacity_gib_ceil(disk.capacity_bytes);

        let volume_type = self
            .vmware
            .datastore_for_disk(vm, disk.key)
            .and_then(|ds| resolve_volume_type(&self.input.volume_type_mapping, ds))
            .or(self.input.volume_type.as_deref());

        let mut metadata = HashMap::new();
        metadata.insert(META_OSM.to_owned(), "true".to_owned());
        metadata.insert(META_CONVERTED.to_owned(), "false".to_owned());

        let set_uefi = vm.firmware == crate::model::Firmware::Uefi;

        self.openstack
            .create_volume(
                &name,
                size_gib,
                volume_type,
                self.input.volume_az.as_deref(),
                &metadata,
                set_uefi,
            )
            .await
    }

    async fn sync_disk(
        &self,
        vm: &SourceVM,
        disk: &crate::model::VirtualDisk,
        volume: &Volume,
        decision: Decision,
        snapshot: &crate::model::SnapshotRef,
    ) -> Result<String> {
        let device = OpenStackSession::find_device_path(&volume.id)?;
        let endpoint = self.nbdkit_endpoint();
        let nbdkit_args = self.nbdkit_args(disk, &endpoint);

        let mut supervisor = Supervised::start_nbdkit(endpoint.clone(), &nbdkit_args).await?;
        let source_uri = endpoint.nbd_uri();

        let result = match decision {
            Decision::FullCopy => {
                mover::full_copy(&source_uri, &device, self.input.assumezero, &self.run.cancel)
                    .await
                    .map(|()| String::new())
            }
            Decision::DeltaSync | Decision::CutoverOnly => {
                let prior_change_id = self.openstack.change_id(&volume.id).await?;
                mover::delta_sync(
                    self.vmware,
                    &vm.moref,
                    &snapshot.moref,
                    disk.key,
                    &prior_change_id,
                    disk.capacity_bytes,
                    &source_uri,
                    &device,
                    &self.run.cancel,
                )
                .await
            }
            Decision::Skip | Decision::Refuse => unreachable!("handled before sync_disk"),
        };

        supervisor.stop();
        info!(disk_key = disk.key, "disk sync complete");
        result
    }

    fn nbdkit_endpoint(&self) -> Endpoint {
        if self.input.use_socks {
            Endpoint::UnixSocket(self.run.socket_path())
        } else {
            Endpoint::Tcp { port: 10809 }
        }
    }

    fn nbdkit_args(&self, disk: &crate::model::VirtualDisk, endpoint: &Endpoint) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(local_path) = &self.input.local_disk_path {
            args.push("file".to_owned());
            args.push(format!("{local_path}/{}", disk.backing_path));
        } else {
            args.push("vddk".to_owned());
            args.push(format!("libdir={}", self.input.libdir));
            args.push(format!("file={}", disk.backing_path));
            args.push(crate::vmware::vddk_compression_arg(self.input.compression));
        }

        match endpoint {
            Endpoint::UnixSocket(path) => {
                args.push("--unix".to_owned());
                args.push(path.display().to_string());
            }
            Endpoint::Tcp { port } => {
                args.push("--port".to_owned());
                args.push(port.to_string());
            }
        }

        args
    }
}

/// Looks up the Cinder volume type for a datastore via the caller's
/// mapping table (spec.md §4.2 `DatastoreNameForDiskKey`).
fn resolve_volume_type<'a>(mapping: &'a [VolumeTypeMapping], datastore: &str) -> Option<&'a str> {
    mapping
        .iter()
        .find(|m| m.vmware_datastore == datastore)
        .map(|m| m.openstack_type.as_str())
}
