//! Module input parsing and the resolved engine configuration
//! (spec.md §6, SPEC_FULL.md §2 ambient Configuration).

use serde::{Deserialize, Serialize};

/// VDDK transport compression mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression.
    None,
    /// FastLZ compression.
    Fastlz,
    /// zlib compression.
    Zlib,
    /// Skip compression (`"skipz"` in the VDDK transport string).
    Skipz,
}

impl Compression {
    /// Renders the VDDK transport compression token.
    #[must_use]
    pub const fn as_transport_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fastlz => "fastlz",
            Self::Zlib => "zlib",
            Self::Skipz => "skipz",
        }
    }
}

/// Maps a VMware datastore name to an OpenStack Cinder volume type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeTypeMapping {
    /// Datastore name as reported by vCenter.
    pub vmware_datastore: String,
    /// Cinder volume type to use for disks backed by that datastore.
    pub openstack_type: String,
}

/// Explicit OpenStack auth parameters (`dst_cloud` in the JSON input),
/// used when `OS_AUTH_URL` is not set in the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenStackAuth {
    /// Keystone auth URL.
    pub auth_url: String,
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
    /// Project id (either this or `project_name` must be set).
    #[serde(default)]
    pub project_id: Option<String>,
    /// Project name.
    #[serde(default)]
    pub project_name: Option<String>,
    /// User domain name.
    #[serde(default = "default_domain")]
    pub user_domain_name: String,
    /// Region name.
    #[serde(default)]
    pub region: Option<String>,
    /// Endpoint interface (`"public"`, `"internal"`, `"admin"`).
    #[serde(default = "default_interface")]
    pub interface: String,
}

fn default_domain() -> String {
    "Default".to_owned()
}

fn default_interface() -> String {
    "public".to_owned()
}

/// Raw deserialization of the migrate module's JSON argument file
/// (spec.md §6, verbatim schema).
#[derive(Debug, Clone, Deserialize)]
pub struct MigrateInput {
    /// vCenter username.
    pub user: String,
    /// vCenter password.
    pub password: String,
    /// vCenter server hostname or IP.
    pub server: String,
    /// Inventory path of the source VM.
    pub vmname: String,
    /// Path to the VDDK library directory on the conversion host.
    pub vddkpath: String,
    /// VDDK `libdir` parameter passed to nbdkit's vddk plugin.
    pub libdir: String,
    /// VDDK transport compression.
    pub compression: Compression,
    /// Use a Unix socket for nbdkit instead of TCP (required for
    /// concurrent migrations on one conversion host).
    #[serde(default)]
    pub use_socks: bool,
    /// Enable CBT delta sync instead of refusing an existing volume.
    #[serde(default)]
    pub cbtsync: bool,
    /// Perform cutover: power off the source and run virt-v2v after sync.
    #[serde(default)]
    pub cutover: bool,
    /// Skip virt-v2v entirely (data-copy only, no guest conversion).
    #[serde(default)]
    pub skipconversion: bool,
    /// Pass `--destination-is-zero` to `nbdcopy`.
    #[serde(default)]
    pub assumezero: bool,
    /// Optional NFS-mounted directory holding the VM's vmdk files,
    /// used instead of the VDDK transport when set.
    #[serde(default)]
    pub local_disk_path: Option<String>,
    /// Manage a caller-provided Cinder volume instead of creating one.
    #[serde(default)]
    pub external_volume: bool,
    /// Name of the caller-provided volume (with `external_volume`).
    #[serde(default)]
    pub volume_name: Option<String>,
    /// Host aggregate / pool hint for volume placement.
    #[serde(default)]
    pub host_pool: Option<String>,
    /// Conversion host instance name override.
    #[serde(default)]
    pub conv_host_name: Option<String>,
    /// Conversion host instance UUID override (bypasses the metadata
    /// service lookup in spec.md §4.3 `Attach`).
    #[serde(default)]
    pub instanceuuid: Option<String>,
    /// Cinder volume type for newly created volumes.
    #[serde(default)]
    pub volume_type: Option<String>,
    /// Cinder availability zone for newly created volumes.
    #[serde(default)]
    pub volume_az: Option<String>,
    /// Datastore-to-volume-type mapping table.
    #[serde(default)]
    pub volume_type_mapping: Vec<VolumeTypeMapping>,
    /// Guest run-script path (Linux only, regenerates udev net rules).
    #[serde(default)]
    pub run_script: Option<String>,
    /// Guest firstboot script path.
    #[serde(default)]
    pub boot_script: Option<String>,
    /// Extra `virt-v2v-in-place` CLI options, space-separated.
    #[serde(default)]
    pub extra_opts: Option<String>,
    /// Directory for osm's own data (logs default here if set).
    #[serde(default)]
    pub osm_data_dir: Option<String>,
    /// Enable `LIBGUESTFS_DEBUG`/`LIBGUESTFS_TRACE` and verbose logging.
    #[serde(default)]
    pub debug: bool,
    /// Destination OpenStack cloud auth, used when `OS_AUTH_URL` is unset.
    #[serde(default)]
    pub dst_cloud: Option<OpenStackAuth>,
    /// Require TLS certificate verification against vCenter/OpenStack.
    ///
    /// SPEC_FULL.md §4.2b: the source system disabled this unconditionally;
    /// here it defaults to `true` and must be explicitly opted out of.
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
}

const fn default_tls_verify() -> bool {
    true
}

/// The module's JSON response envelope (spec.md §6), shared by every
/// osm-cli binary.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleResponse {
    /// Whether this invocation changed anything.
    pub changed: bool,
    /// Whether this invocation failed.
    pub failed: bool,
    /// Human-readable result message.
    pub msg: String,
    /// Cinder volume UUIDs in disk order, for the migrate operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Vec<String>>,
    /// Path to the per-invocation log file, present on any fatal path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    /// Per-disk outcomes, present for the migrate operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<crate::model::DiskOutcome>>,
}

/// Resolves OpenStack auth: environment variables take precedence over
/// `dst_cloud` when `OS_AUTH_URL` is set (spec.md §6 "Environment").
#[must_use]
pub fn resolve_openstack_auth(dst_cloud: Option<&OpenStackAuth>) -> Option<OpenStackAuth> {
    if let Ok(auth_url) = std::env::var("OS_AUTH_URL") {
        return Some(OpenStackAuth {
            auth_url,
            username: std::env::var("OS_USERNAME").unwrap_or_default(),
            password: std::env::var("OS_PASSWORD").unwrap_or_default(),
            project_id: std::env::var("OS_PROJECT_ID").ok(),
            project_name: std::env::var("OS_PROJECT_NAME").ok(),
            user_domain_name: std::env::var("OS_USER_DOMAIN_NAME")
                .unwrap_or_else(|_| default_domain()),
            region: std::env::var("OS_REGION_NAME").ok(),
            interface: std::env::var("OS_INTERFACE").unwrap_or_else(|_| default_interface()),
        });
    }
    dst_cloud.cloned()
}
