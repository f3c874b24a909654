//! VMware session (C2, spec.md §4.2): authenticate to vCenter, discover
//! a VM's disks/firmware, manage snapshots and CBT.
//!
//! The vSphere API has no JSON surface; this module speaks its SOAP/XML
//! envelope over HTTPS directly, scoped to exactly the calls spec.md
//! §4.2 lists (SPEC_FULL.md §4.2c) rather than a general SOAP framework.
//! The request/response shape mirrors the teacher's token-caching HTTP
//! client (`bux-oci/registry.rs`), generalized from OCI registry bearer
//! tokens to a vCenter session cookie.

pub(crate) mod soap;
pub(crate) mod tls;

use std::time::Duration;

use reqwest::Client;
use tracing::{info, warn};

use crate::config::Compression;
use crate::error::{Error, Result};
use crate::model::{Firmware, GuestFamily, PowerState, SnapshotRef, SourceVM, VirtualDisk};

/// One extent changed since a recorded change-id (spec.md §4.2
/// `QueryChangedAreas`).
#[derive(Debug, Clone, Copy)]
pub struct ChangedArea {
    pub start: u64,
    pub length: u64,
}

/// An authenticated vCenter session. Holds the `reqwest::Client`
/// (carrying the session cookie set by `Login`) and the resolved
/// service-content managed-object references needed for every
/// subsequent call.
#[derive(Debug, Clone)]
pub struct VmwareSession {
    client: Client,
    base_url: String,
    root_folder: String,
}

impl VmwareSession {
    /// `Authenticate(host, user, password) -> Session` (spec.md §4.2).
    ///
    /// TLS verification follows `EngineConfig.tls_verify`
    /// (SPEC_FULL.md §4.2b); the source system disabled it
    /// unconditionally, this defaults to verified and requires explicit
    /// opt-out.
    pub async fn authenticate(
        host: &str,
        user: &str,
        password: &str,
        tls_verify: bool,
    ) -> Result<Self> {
        if !tls_verify {
            warn!(host, "TLS verification disabled for this session");
        }

        let client = tls::client_builder(tls_verify)
            .cookie_store(true)
            .timeout(Duration::from_secs(60))
            .build()?;

        let base_url = format!("https://{host}/sdk");

        let login_body = soap::build_login_envelope(user, password);
        let response = soap::post(&client, &base_url, "Login", &login_body)
            .await
            .map_err(|e| Error::Auth {
                target: "vcenter",
                message: e.to_string(),
            })?;

        soap::parse_login_response(&response).map_err(|e| Error::Auth {
            target: "vcenter",
            message: e.to_string(),
        })?;

        info!(host, "authenticated to vCenter");

        Ok(Self {
            client,
            base_url,
            root_folder: "group-d1".to_owned(),
        })
    }

    /// `GetThumbprint(host, port) -> "AA:BB:..."` (spec.md §4.2).
    ///
    /// Standalone: does not require an authenticated session, since
    /// it's used to pre-seed nbdkit's VDDK plugin thumbprint argument.
    pub async fn get_thumbprint(host: &str, port: u16) -> Result<String> {
        tls::leaf_certificate_sha1_thumbprint(host, port)
            .await
            .map_err(|e| Error::Auth {
                target: "vcenter",
                message: format!("thumbprint fetch failed: {e}"),
            })
    }

    /// `FindVM(path) -> SourceVM` (spec.md §4.2).
    ///
    /// On miss, enumerates siblings under the parent folder for
    /// diagnostic logging before failing with `NotFound`.
    pub async fn find_vm(&self, inventory_path: &str) -> Result<SourceVM> {
        let body = soap::build_find_by_inventory_path(&self.root_folder, inventory_path);
        let response = soap::post(&self.client, &self.base_url, "FindByInventoryPath", &body).await?;
        let moref = soap::parse_moref(&response)?;

        let Some(moref) = moref else {
            let siblings = self.list_siblings(inventory_path).await.unwrap_or_default();
            warn!(inventory_path, ?siblings, "VM not found; siblings logged for diagnosis");
            return Err(Error::not_found("VM", inventory_path));
        };

        self.retrieve_vm_properties(&moref, inventory_path).await
    }

    async fn list_siblings(&self, inventory_path: &str) -> Result<Vec<String>> {
        let parent_path = inventory_path.rsplit_once('/').map_or("/", |(p, _)| p);
        let find_body = soap::build_find_by_inventory_path(&self.root_folder, parent_path);
        let find_response =
            soap::post(&self.client, &self.base_url, "FindByInventoryPath", &find_body).await?;
        let Some(parent_moref) = soap::parse_moref(&find_response)? else {
            return Ok(Vec::new());
        };

        let body = soap::build_list_children(&parent_moref);
        let response = soap::post(&self.client, &self.base_url, "RetrieveProperties", &body).await?;
        soap::parse_child_names(&response)
    }

    async fn retrieve_vm_properties(&self, moref: &str, inventory_path: &str) -> Result<SourceVM> {
        let body = soap::build_retrieve_vm_properties(moref);
        let response =
            soap::post(&self.client, &self.base_url, "RetrieveProperties", &body).await?;
        let props = soap::parse_vm_properties(&response)?;

        let guest_family = GuestFamily::classify(&props.guest_full_name, &props.guest_id);
        let firmware = if props.firmware == "efi" {
            Firmware::Uefi
        } else {
            Firmware::Bios
        };
        let power_state = match props.power_state.as_str() {
            "poweredOn" => PowerState::PoweredOn,
            "suspended" => PowerState::Suspended,
            _ => PowerState::PoweredOff,
        };

        let disks = props
            .disks
            .into_iter()
            .map(|d| VirtualDisk {
                key: d.key,
                capacity_bytes: d.capacity_bytes,
                datastore: d.datastore,
                backing_path: d.backing_path,
                change_id: d.change_id,
            })
            .collect();

        Ok(SourceVM {
            inventory_path: inventory_path.to_owned(),
            moref: moref.to_owned(),
            guest_family,
            firmware,
            power_state,
            disks,
        })
    }

    /// `DatastoreNameForDiskKey(vm, key)` (spec.md §4.2).
    #[must_use]
    pub fn datastore_for_disk<'a>(&self, vm: &'a SourceVM, key: i32) -> Option<&'a str> {
        vm.disks
            .iter()
            .find(|d| d.key == key)
            .map(|d| d.datastore.as_str())
    }

    /// `PowerOff(vm)` (spec.md §4.2): idempotent, waits for
    /// `PoweredOff`; timeout is fatal.
    pub async fn power_off(&self, vm: &SourceVM) -> Result<()> {
        if vm.power_state == PowerState::PoweredOff {
            return Ok(());
        }
        let body = soap::build_power_off(&vm.moref);
        let response = soap::post(&self.client, &self.base_url, "PowerOffVM_Task", &body).await?;
        let task = soap::parse_task_moref(&response)?;
        self.wait_task(&task).await
    }

    /// `CreateSnapshot(vm) -> SnapshotRef` (spec.md §4.2): name
    /// `osm-snap`, no memory, no quiesce.
    pub async fn create_snapshot(&self, vm: &SourceVM) -> Result<SnapshotRef> {
        let body = soap::build_create_snapshot(&vm.moref, crate::model::SNAPSHOT_NAME);
        let response = soap::post(&self.client, &self.base_url, "CreateSnapshot_Task", &body).await?;
        let task = soap::parse_task_moref(&response)?;
        let snapshot_moref = self.wait_task_for_result(&task).await?;
        Ok(SnapshotRef {
            moref: snapshot_moref,
        })
    }

    /// `RemoveSnapshot(vm, ref)` (spec.md §4.2): with consolidation.
    pub async fn remove_snapshot(&self, snapshot: &SnapshotRef) -> Result<()> {
        let body = soap::build_remove_snapshot(&snapshot.moref);
        let response = soap::post(&self.client, &self.base_url, "RemoveSnapshot_Task", &body).await?;
        let task = soap::parse_task_moref(&response)?;
        self.wait_task(&task).await
    }

    /// `CBTChangeID(vm, snapshot, disk_key) -> string` (spec.md §4.2):
    /// returns empty string (not an error) when CBT is disabled.
    /// Supports all four backing-info variants via [`soap::BackingInfo`].
    pub async fn cbt_change_id(
        &self,
        _vm_moref: &str,
        snapshot_moref: &str,
        disk_key: i32,
    ) -> Result<String> {
        let body = soap::build_retrieve_backing_info(snapshot_moref);
        let response =
            soap::post(&self.client, &self.base_url, "RetrieveProperties", &body).await?;
        let backing = soap::parse_backing_info(&response, disk_key)?;
        Ok(backing.change_id().unwrap_or_default())
    }

    /// `QueryChangedAreas(vm, snapshot, disk_key, startOffset, changeID)`
    /// (spec.md §4.2).
    pub async fn query_changed_areas(
        &self,
        vm_moref: &str,
        snapshot_moref: &str,
        disk_key: i32,
        start_offset: u64,
        change_id: &str,
    ) -> Result<(Vec<ChangedArea>, u64)> {
        let body =
            soap::build_query_changed_disk_areas(vm_moref, snapshot_moref, disk_key, start_offset, change_id);
        let response =
            soap::post(&self.client, &self.base_url, "QueryChangedDiskAreas", &body).await?;
        soap::parse_changed_areas(&response)
    }

    async fn wait_task(&self, task_moref: &str) -> Result<()> {
        self.wait_task_inner(task_moref).await.map(|_| ())
    }

    async fn wait_task_for_result(&self, task_moref: &str) -> Result<String> {
        self.wait_task_inner(task_moref).await
    }

    /// Polls `info.state` on a Task managed object until it leaves the
    /// running state (spec.md §4.2 "task-polling via RetrieveProperties
    /// on info.state").
    async fn wait_task_inner(&self, task_moref: &str) -> Result<String> {
        loop {
            let body = soap::build_retrieve_task_info(task_moref);
            let response =
                soap::post(&self.client, &self.base_url, "RetrieveProperties", &body).await?;
            let info = soap::parse_task_info(&response)?;

            match info.state.as_str() {
                "success" => return Ok(info.result.unwrap_or_default()),
                "error" => {
                    return Err(Error::transient(
                        info.error.unwrap_or_else(|| "vCenter task failed".to_owned()),
                    ))
                }
                _ => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        }
    }
}

/// VDDK transport string fragment for the given compression setting,
/// used when constructing the nbdkit vddk plugin arguments.
#[must_use]
pub fn vddk_compression_arg(compression: Compression) -> String {
    format!("compression={}", compression.as_transport_str())
}
