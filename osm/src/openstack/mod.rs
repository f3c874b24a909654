//! OpenStack session (C3, spec.md §4.3): Keystone auth, Cinder volume
//! lifecycle, attach/detach to the conversion host, and volume metadata
//! as the engine's sole durable state.
//!
//! Token caching and re-auth-on-expiry mirror the teacher's bearer-token
//! cache in `bux-oci/registry.rs` (`tokens: HashMap<String, String>`,
//! `ensure_token`/`fetch_bearer_token`), generalized from one registry
//! host to a single Keystone catalog entry per session.

mod auth;

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::OpenStackAuth;
use crate::error::{Error, Result};
use crate::model::{Volume, META_CHANGE_ID, META_CONVERTED, META_HW_FIRMWARE_TYPE, META_HW_MACHINE_TYPE, META_OSM};

pub use auth::TokenCache;

/// Polling parameters for volume status transitions
/// (spec.md §4.3 `CreateVolume`, §5 "Hard timeouts").
const VOLUME_POLL_PERIOD: Duration = Duration::from_secs(5);
const VOLUME_POLL_MAX_ITER: u32 = 3000;

/// An authenticated OpenStack session: Keystone token cache plus the
/// Cinder and Compute endpoint URLs resolved from the service catalog.
#[derive(Debug)]
pub struct OpenStackSession {
    client: Client,
    auth: OpenStackAuth,
    tokens: Mutex<TokenCache>,
    cinder_endpoint: String,
    compute_endpoint: String,
}

impl OpenStackSession {
    /// Resolves credentials (env vars take precedence, spec.md §6) and
    /// performs the initial Keystone v3 password auth.
    pub async fn connect(auth: OpenStackAuth, tls_verify: bool) -> Result<Self> {
        if !tls_verify {
            warn!("TLS verification disabled for OpenStack session");
        }
        let client = crate::vmware::tls::client_builder(tls_verify)
            .timeout(Duration::from_secs(60))
            .build()?;

        let (token, catalog) = auth::password_auth(&client, &auth).await?;
        let cinder_endpoint = auth::endpoint_from_catalog(&catalog, "volumev3", &auth.interface, auth.region.as_deref())
            .or_else(|| auth::endpoint_from_catalog(&catalog, "block-storage", &auth.interface, auth.region.as_deref()))
            .ok_or_else(|| Error::Auth {
                target: "openstack",
                message: "no volumev3/block-storage endpoint in catalog".to_owned(),
            })?;
        let compute_endpoint = auth::endpoint_from_catalog(&catalog, "compute", &auth.interface, auth.region.as_deref())
            .ok_or_else(|| Error::Auth {
                target: "openstack",
                message: "no compute endpoint in catalog".to_owned(),
            })?;

        info!("authenticated to OpenStack");

        Ok(Self {
            client,
            auth,
            tokens: Mutex::new(TokenCache::new(token)),
            cinder_endpoint,
            compute_endpoint,
        })
    }

    /// Runs `request` with the cached token, transparently re-authenticating
    /// and retrying exactly once on a `401` (spec.md §4.3: the single
    /// mechanism backing initial auth and the detach-retry rule).
    async fn authed_request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        for attempt in 0..2 {
            let token = self.tokens.lock().await.token().to_owned();
            let mut req = self.client.request(method.clone(), url).header("X-Auth-Token", token);
            if let Some(b) = body {
                req = req.json(b);
            }
            let response = req.send().await?;

            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!("OpenStack token rejected, re-authenticating");
                let (token, _catalog) = auth::password_auth(&self.client, &self.auth).await?;
                *self.tokens.lock().await = TokenCache::new(token);
                continue;
            }
            return Ok(response);
        }
        unreachable!("loop always returns or re-authenticates exactly once")
    }

    /// `FindVolume(vmName, diskKey) -> Volume?` (spec.md §4.3).
    pub async fn find_volume(&self, vm_name: &str, disk_key: i32) -> Result<Option<Volume>> {
        let name = crate::model::volume_name(vm_name, disk_key);
        let url = format!("{}/volumes/detail?name={name}", self.cinder_endpoint);
        let response = self.authed_request(reqwest::Method::GET, &url, None).await?;
        let body: Value = response.json().await?;

        let matches: Vec<Volume> = body["volumes"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|v| v["metadata"][META_OSM].as_str() == Some("true"))
            .map(parse_volume)
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.into_iter().next()),
            _ => Err(Error::ambiguous(
                "volume",
                format!("{} volumes named {name} carry osm:true", matches.len()),
            )),
        }
    }

    /// `CreateVolume(...) -> Volume` (spec.md §4.3): create, poll until
    /// `available`, mark bootable, optionally set UEFI image properties.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_volume(
        &self,
        name: &str,
        size_gib: u64,
        volume_type: Option<&str>,
        az: Option<&str>,
        metadata: &HashMap<String, String>,
        set_uefi_image_properties: bool,
    ) -> Result<Volume> {
        let mut body = json!({
            "volume": {
                "name": name,
                "size": size_gib,
                "metadata": metadata,
            }
        });
        if let Some(t) = volume_type {
            body["volume"]["volume_type"] = json!(t);
        }
        if let Some(z) = az {
            body["volume"]["availability_zone"] = json!(z);
        }

        let url = format!("{}/volumes", self.cinder_endpoint);
        let response = self.authed_request(reqwest::Method::POST, &url, Some(&body)).await?;
        let created: Value = response.json().await?;
        let id = created["volume"]["id"]
            .as_str()
            .ok_or_else(|| Error::transient("create_volume response missing id"))?
            .to_owned();

        let volume = self.wait_volume_status(&id, "available").await?;
        self.set_bootable(&id, true).await?;

        if set_uefi_image_properties {
            self.set_image_metadata(&id, META_HW_MACHINE_TYPE, "q35").await?;
            self.set_image_metadata(&id, META_HW_FIRMWARE_TYPE, "uefi").await?;
        }

        Ok(volume)
    }

    async fn set_bootable(&self, volume_id: &str, bootable: bool) -> Result<()> {
        let url = format!("{}/volumes/{volume_id}/action", self.cinder_endpoint);
        let body = json!({ "os-set_bootable": { "bootable": bootable } });
        self.authed_request(reqwest::Method::POST, &url, Some(&body)).await?;
        Ok(())
    }

    async fn set_image_metadata(&self, volume_id: &str, key: &str, value: &str) -> Result<()> {
        let url = format!("{}/volumes/{volume_id}/action", self.cinder_endpoint);
        let body = json!({ "os-set_image_metadata": { "metadata": { key: value } } });
        self.authed_request(reqwest::Method::POST, &url, Some(&body)).await?;
        Ok(())
    }

    async fn wait_volume_status(&self, volume_id: &str, want: &str) -> Result<Volume> {
        for _ in 0..VOLUME_POLL_MAX_ITER {
            let url = format!("{}/volumes/{volume_id}", self.cinder_endpoint);
            let response = self.authed_request(reqwest::Method::GET, &url, None).await?;
            let body: Value = response.json().await?;
            let volume = parse_volume(body["volume"].clone());
            if volume.status == want {
                return Ok(volume);
            }
            if volume.status == "error" {
                return Err(Error::transient(format!("volume {volume_id} entered error state")));
            }
            sleep(VOLUME_POLL_PERIOD).await;
        }
        Err(Error::transient(format!(
            "volume {volume_id} did not reach {want} within the poll budget"
        )))
    }

    /// `Attach(volumeId, conversionHostId)` (spec.md §4.3): if
    /// `conversion_host_id` is absent, discovers it from the instance
    /// metadata service.
    pub async fn attach(&self, volume_id: &str, conversion_host_id: Option<&str>) -> Result<()> {
        let host_id = match conversion_host_id {
            Some(id) => id.to_owned(),
            None => fetch_local_instance_id().await?,
        };

        let url = format!("{}/servers/{host_id}/os-volume_attachments", self.compute_endpoint);
        let body = json!({ "volumeAttachment": { "volumeId": volume_id } });
        self.authed_request(reqwest::Method::POST, &url, Some(&body)).await?;

        self.wait_volume_status(volume_id, "in-use").await?;
        Ok(())
    }

    /// `Detach(volumeId, conversionHostId)` (spec.md §4.3): on a
    /// transient auth failure, re-authenticate once and retry
    /// (handled transparently by [`Self::authed_request`]).
    pub async fn detach(&self, volume_id: &str, conversion_host_id: &str) -> Result<()> {
        let url = format!(
            "{}/servers/{conversion_host_id}/os-volume_attachments/{volume_id}",
            self.compute_endpoint
        );
        self.authed_request(reqwest::Method::DELETE, &url, None).await?;
        self.wait_volume_status(volume_id, "available").await?;
        Ok(())
    }

    /// `FindDevicePath(volumeId) -> "/dev/..."` (spec.md §4.3): scans
    /// `/dev/disk/by-id/` for an entry containing the first 18
    /// characters of the volume UUID.
    pub fn find_device_path(volume_id: &str) -> Result<std::path::PathBuf> {
        if volume_id.len() < 18 {
            return Err(Error::transient(format!(
                "volume id {volume_id} shorter than 18 characters"
            )));
        }
        let prefix = &volume_id[..18];
        let by_id = std::path::Path::new("/dev/disk/by-id");
        let mut matches = Vec::new();
        for entry in std::fs::read_dir(by_id)?.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().contains(prefix) {
                matches.push(entry.path());
            }
        }
        match matches.len() {
            0 => Err(Error::not_found("device path", volume_id)),
            1 => std::fs::canonicalize(&matches[0]).map_err(Error::from),
            _ => Err(Error::ambiguous(
                "device path",
                format!("{} /dev/disk/by-id entries match {prefix}", matches.len()),
            )),
        }
    }

    /// `ReadMetadata(volumeId) -> map` (spec.md §4.3).
    pub async fn read_metadata(&self, volume_id: &str) -> Result<HashMap<String, String>> {
        let url = format!("{}/volumes/{volume_id}/metadata", self.cinder_endpoint);
        let response = self.authed_request(reqwest::Method::GET, &url, None).await?;
        let body: Value = response.json().await?;
        Ok(serde_json::from_value(body["metadata"].clone())?)
    }

    /// `WriteMetadata(volumeId, patch)` (spec.md §4.3): last-write-wins.
    pub async fn write_metadata(&self, volume_id: &str, patch: &HashMap<String, String>) -> Result<()> {
        let mut current = self.read_metadata(volume_id).await?;
        current.extend(patch.clone());
        let url = format!("{}/volumes/{volume_id}/metadata", self.cinder_endpoint);
        let body = json!({ "metadata": current });
        self.authed_request(reqwest::Method::PUT, &url, Some(&body)).await?;
        Ok(())
    }

    /// `IsConverted(volumeId) -> bool` (spec.md §4.3): parse error is
    /// fatal (malformed durable state).
    pub async fn is_converted(&self, volume_id: &str) -> Result<bool> {
        let metadata = self.read_metadata(volume_id).await?;
        Ok(metadata.get(META_CONVERTED).map(String::as_str) == Some("true"))
    }

    /// `ChangeID(volumeId) -> string` (spec.md §4.3).
    pub async fn change_id(&self, volume_id: &str) -> Result<String> {
        let metadata = self.read_metadata(volume_id).await?;
        Ok(metadata.get(META_CHANGE_ID).cloned().unwrap_or_default())
    }
}

/// Discovers the conversion host's own instance id from the instance
/// metadata service (spec.md §4.3 `Attach`). If the service is down,
/// the caller must supply `conv_host_name`/`instanceuuid` instead.
async fn fetch_local_instance_id() -> Result<String> {
    let url = "http://169.254.169.254/openstack/latest/meta_data.json";
    let response = reqwest::Client::new()
        .get(url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| Error::transient(format!("instance metadata service unreachable: {e}")))?;
    let body: Value = response.json().await?;
    body["uuid"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::transient("instance metadata service response missing uuid"))
}

fn parse_volume(raw: Value) -> Volume {
    let metadata: HashMap<String, String> = raw["metadata"]
        .as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default();

    Volume {
        id: raw["id"].as_str().unwrap_or_default().to_owned(),
        name: raw["name"].as_str().unwrap_or_default().to_owned(),
        size_gib: raw["size"].as_u64().unwrap_or_default(),
        status: raw["status"].as_str().unwrap_or_default().to_owned(),
        bootable: raw["bootable"].as_str() == Some("true"),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_volume_reads_osm_metadata() {
        let raw = json!({
            "id": "vol-1",
            "name": "vm-2000",
            "size": 10,
            "status": "available",
            "bootable": "true",
            "metadata": { "osm": "true", "converted": "false" },
        });
        let volume = parse_volume(raw);
        assert_eq!(volume.id, "vol-1");
        assert!(!volume.is_converted());
    }

    #[test]
    fn device_path_requires_eighteen_char_prefix() {
        let err = OpenStackSession::find_device_path("short-id");
        assert!(err.is_err());
    }
}
