//! Core data model (spec.md §3): VMs, disks, snapshots, volumes, and the
//! per-disk decision table.

use std::collections::HashMap;

use serde::Serialize;

/// Guest OS family, classified once at VM discovery by case-insensitive
/// substring match on `config.guestFullName`/`config.guestId`
/// (spec.md §4.2, §9 "Dynamic guest-OS dispatch").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestFamily {
    Windows,
    RhelCentos8Plus,
    OtherLinux,
    Other,
}

impl GuestFamily {
    /// Classifies a guest from its vCenter `guestFullName`/`guestId`
    /// strings.
    #[must_use]
    pub fn classify(guest_full_name: &str, guest_id: &str) -> Self {
        let full = guest_full_name.to_ascii_lowercase();
        let id = guest_id.to_ascii_lowercase();
        let combined = format!("{full} {id}");

        if combined.contains("microsoft") || combined.contains("windows") {
            return Self::Windows;
        }
        let is_rhel_family = combined.contains("red hat")
            || combined.contains("centos")
            || combined.contains("rhel");
        if is_rhel_family && (combined.contains('8') || combined.contains('9')) {
            return Self::RhelCentos8Plus;
        }
        if combined.contains("linux") {
            return Self::OtherLinux;
        }
        Self::Other
    }
}

/// Firmware type of a source VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    Bios,
    Uefi,
}

/// Power state of a source VM, as reported by vCenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// One virtual disk attached to a [`SourceVM`] (spec.md §3).
#[derive(Debug, Clone)]
pub struct VirtualDisk {
    /// Unique-per-VM device key, stable across snapshots.
    pub key: i32,
    /// Capacity in bytes.
    pub capacity_bytes: u64,
    /// Backing datastore name.
    pub datastore: String,
    /// Backing `.vmdk` file path.
    pub backing_path: String,
    /// CBT change-id for this disk on the active snapshot, if CBT is
    /// enabled on the VM; `None` when disabled.
    pub change_id: Option<String>,
}

/// An opaque handle to a VMware managed object plus the attributes the
/// engine needs (spec.md §3).
#[derive(Debug, Clone)]
pub struct SourceVM {
    /// Inventory path, e.g. `/Datacenter/vm/folder/name`.
    pub inventory_path: String,
    /// Managed object reference id (`vm-1234`), opaque to callers.
    pub moref: String,
    pub guest_family: GuestFamily,
    pub firmware: Firmware,
    pub power_state: PowerState,
    /// Disks in hardware order; index 0 is the boot disk by convention.
    pub disks: Vec<VirtualDisk>,
}

impl SourceVM {
    /// The boot disk: the first disk in hardware order (spec.md Glossary
    /// "Boot disk").
    #[must_use]
    pub fn boot_disk(&self) -> Option<&VirtualDisk> {
        self.disks.first()
    }
}

/// A VMware snapshot reference (spec.md §3): named `osm-snap`, owned by
/// exactly one in-flight migration.
#[derive(Debug, Clone)]
pub struct SnapshotRef {
    /// Managed object reference id of the snapshot.
    pub moref: String,
}

/// Name used for every snapshot this engine creates.
pub const SNAPSHOT_NAME: &str = "osm-snap";

/// Metadata key marking a volume as owned by this system. Required for
/// any `FindVolume` lookup to consider the volume at all.
pub const META_OSM: &str = "osm";
/// Metadata key recording whether virt-v2v has completed on the volume.
pub const META_CONVERTED: &str = "converted";
/// Metadata key recording the CBT change-id the volume was last synced to.
pub const META_CHANGE_ID: &str = "changeID";
/// Metadata key for UEFI Cinder image metadata.
pub const META_HW_FIRMWARE_TYPE: &str = "hw_firmware_type";
/// Metadata key for UEFI Cinder image metadata (paired with the above).
pub const META_HW_MACHINE_TYPE: &str = "hw_machine_type";

/// A Cinder volume (spec.md §3), including its durable migration-state
/// metadata map.
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_gib: u64,
    pub status: String,
    pub bootable: bool,
    pub metadata: HashMap<String, String>,
}

impl Volume {
    /// `metadata.converted == "true"` (spec.md §4.3 `IsConverted`).
    #[must_use]
    pub fn is_converted(&self) -> bool {
        self.metadata.get(META_CONVERTED).map(String::as_str) == Some("true")
    }

    /// `metadata.changeID`, or empty when absent (spec.md §4.3 `ChangeID`).
    #[must_use]
    pub fn change_id(&self) -> &str {
        self.metadata
            .get(META_CHANGE_ID)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// The Cinder volume name convention: `<sanitized-vm-name>-<disk-key>`.
#[must_use]
pub fn volume_name(safe_vm_name: &str, disk_key: i32) -> String {
    format!("{safe_vm_name}-{disk_key}")
}

/// Converts a disk capacity in bytes to whole GiB, rounding up
/// (spec.md §9 Open Question: "Volume-size rounding... preserve with
/// explicit ceil").
#[must_use]
pub fn capacity_gib_ceil(capacity_bytes: u64) -> u64 {
    const GIB: u64 = 1024 * 1024 * 1024;
    capacity_bytes.div_ceil(GIB)
}

/// Per-disk migration decision (spec.md §3, §4.6 decision table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Volume already converted; return its existing id unchanged.
    Skip,
    /// No volume exists yet: create one, copy fully, then v2v if boot disk.
    FullCopy,
    /// Volume exists, unconverted, CBT enabled, no cutover: resync only.
    DeltaSync,
    /// Volume exists, unconverted, CBT enabled, cutover requested: resync
    /// then convert.
    CutoverOnly,
    /// Volume exists, unconverted, CBT disabled: refuse to overwrite.
    Refuse,
}

/// Computes the per-disk decision from the inputs in spec.md §4.6.
#[must_use]
pub fn decide(existing: Option<&Volume>, cbt: bool, cutover: bool) -> Decision {
    let Some(vol) = existing else {
        return Decision::FullCopy;
    };
    if vol.is_converted() {
        return Decision::Skip;
    }
    if !cbt {
        return Decision::Refuse;
    }
    if cutover {
        Decision::CutoverOnly
    } else {
        Decision::DeltaSync
    }
}

/// Per-disk outcome recorded in the module's JSON response.
#[derive(Debug, Clone, Serialize)]
pub struct DiskOutcome {
    pub disk_key: i32,
    pub volume_id: String,
    pub outcome: DiskOutcomeKind,
}

/// The per-disk outcome tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskOutcomeKind {
    Converted,
    Copied,
    Skipped,
    V2vFail,
}

/// Top-level per-VM outcome (spec.md §3 `MigrationResult`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    Succeeded,
    PartialV2VFailure,
    Failed,
}

/// A VM's complete migration result.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub outcome: MigrationOutcome,
    pub disks: Vec<DiskOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(converted: bool) -> Volume {
        let mut metadata = HashMap::new();
        metadata.insert(META_OSM.to_owned(), "true".to_owned());
        metadata.insert(
            META_CONVERTED.to_owned(),
            if converted { "true" } else { "false" }.to_owned(),
        );
        Volume {
            id: "vol-1".to_owned(),
            name: "vm-2000".to_owned(),
            size_gib: 10,
            status: "in-use".to_owned(),
            bootable: true,
            metadata,
        }
    }

    #[test]
    fn decide_no_volume_is_full_copy() {
        assert_eq!(decide(None, false, false), Decision::FullCopy);
    }

    #[test]
    fn decide_converted_volume_is_skip() {
        assert_eq!(decide(Some(&volume(true)), true, true), Decision::Skip);
    }

    #[test]
    fn decide_unconverted_no_cbt_is_refuse() {
        assert_eq!(decide(Some(&volume(false)), false, false), Decision::Refuse);
    }

    #[test]
    fn decide_unconverted_cbt_no_cutover_is_delta_sync() {
        assert_eq!(decide(Some(&volume(false)), true, false), Decision::DeltaSync);
    }

    #[test]
    fn decide_unconverted_cbt_cutover_is_cutover() {
        assert_eq!(decide(Some(&volume(false)), true, true), Decision::CutoverOnly);
    }

    #[test]
    fn guest_family_classifies_windows() {
        assert_eq!(
            GuestFamily::classify("Microsoft Windows Server 2019", "windows2019srv_64Guest"),
            GuestFamily::Windows
        );
    }

    #[test]
    fn guest_family_classifies_rhel8() {
        assert_eq!(
            GuestFamily::classify("Red Hat Enterprise Linux 8 (64-bit)", "rhel8_64Guest"),
            GuestFamily::RhelCentos8Plus
        );
    }

    #[test]
    fn guest_family_classifies_other_linux() {
        assert_eq!(
            GuestFamily::classify("Ubuntu Linux (64-bit)", "ubuntu64Guest"),
            GuestFamily::OtherLinux
        );
    }

    #[test]
    fn capacity_rounds_up_partial_gib() {
        assert_eq!(capacity_gib_ceil(1024 * 1024 * 1024 + 1), 2);
        assert_eq!(capacity_gib_ceil(1024 * 1024 * 1024), 1);
    }
}
