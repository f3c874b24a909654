//! Keystone v3 password auth (SPEC_FULL.md §4.3b): `POST
//! /v3/auth/tokens`, caching the `X-Subject-Token` value.

use reqwest::Client;
use serde_json::{json, Value};

use crate::config::OpenStackAuth;
use crate::error::{Error, Result};

/// A cached Keystone token. There is no proactive expiry tracking: the
/// single re-auth mechanism is `OpenStackSession::authed_request`
/// retrying once on `401` (SPEC_FULL.md §4.3b "the single mechanism"),
/// so this type only holds the current token string.
#[derive(Debug, Clone)]
pub struct TokenCache {
    token: String,
}

impl TokenCache {
    #[must_use]
    pub fn new(token: String) -> Self {
        Self { token }
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Performs `POST /v3/auth/tokens` and returns the subject token plus
/// the raw service catalog for endpoint resolution.
pub async fn password_auth(client: &Client, auth: &OpenStackAuth) -> Result<(String, Value)> {
    let mut project = json!({ "domain": { "name": auth.user_domain_name } });
    if let Some(id) = &auth.project_id {
        project = json!({ "id": id });
    } else if let Some(name) = &auth.project_name {
        project["name"] = json!(name);
    }

    let body = json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": auth.username,
                        "password": auth.password,
                        "domain": { "name": auth.user_domain_name },
                    }
                }
            },
            "scope": { "project": project }
        }
    });

    let url = format!("{}/auth/tokens", auth.auth_url.trim_end_matches('/'));
    let response = client.post(&url).json(&body).send().await?;

    if !response.status().is_success() {
        return Err(Error::Auth {
            target: "openstack",
            message: format!("keystone returned {}", response.status()),
        });
    }

    let token = response
        .headers()
        .get("X-Subject-Token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Auth {
            target: "openstack",
            message: "response missing X-Subject-Token".to_owned(),
        })?
        .to_owned();

    let parsed: Value = response.json().await?;
    let catalog = parsed["token"]["catalog"].clone();

    Ok((token, catalog))
}

/// Finds the endpoint URL for `service_type` in the Keystone catalog,
/// preferring `interface`, optionally filtered by `region`.
#[must_use]
pub fn endpoint_from_catalog(
    catalog: &Value,
    service_type: &str,
    interface: &str,
    region: Option<&str>,
) -> Option<String> {
    let entries = catalog.as_array()?;
    let service = entries.iter().find(|e| e["type"].as_str() == Some(service_type))?;
    let endpoints = service["endpoints"].as_array()?;

    endpoints
        .iter()
        .find(|ep| {
            ep["interface"].as_str() == Some(interface)
                && region.is_none_or(|r| ep["region"].as_str() == Some(r))
        })
        .or_else(|| endpoints.iter().find(|ep| ep["interface"].as_str() == Some(interface)))
        .and_then(|ep| ep["url"].as_str())
        .map(|s| s.trim_end_matches('/').to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_prefers_matching_region() {
        let catalog = json!([
            {
                "type": "volumev3",
                "endpoints": [
                    { "interface": "public", "region": "RegionOne", "url": "https://cinder.example/v3" },
                    { "interface": "public", "region": "RegionTwo", "url": "https://cinder2.example/v3" },
                ]
            }
        ]);
        let url = endpoint_from_catalog(&catalog, "volumev3", "public", Some("RegionTwo"));
        assert_eq!(url.as_deref(), Some("https://cinder2.example/v3"));
    }

    #[test]
    fn endpoint_falls_back_without_region_match() {
        let catalog = json!([
            {
                "type": "compute",
                "endpoints": [
                    { "interface": "public", "region": "RegionOne", "url": "https://nova.example/v2.1" },
                ]
            }
        ]);
        let url = endpoint_from_catalog(&catalog, "compute", "public", Some("RegionTwo"));
        assert_eq!(url.as_deref(), Some("https://nova.example/v2.1"));
    }
}
