//! `osm-thumbprint` — wraps `GetThumbprint` (spec.md §4.2, SPEC_FULL.md
//! §3) as a standalone argv[1]-JSON-in/JSON-stdout-out module.

use std::process::ExitCode;

use osm::vmware::VmwareSession;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
struct ThumbprintRequest {
    server: String,
    #[serde(default = "default_port")]
    port: u16,
}

const fn default_port() -> u16 {
    443
}

#[derive(Debug, Serialize)]
struct ThumbprintResponse {
    changed: bool,
    failed: bool,
    msg: String,
    thumbprint: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let response = match run().await {
        Ok(thumbprint) => ThumbprintResponse {
            changed: false,
            failed: false,
            msg: "thumbprint retrieved".to_owned(),
            thumbprint: Some(thumbprint),
        },
        Err(e) => ThumbprintResponse {
            changed: false,
            failed: true,
            msg: e.to_string(),
            thumbprint: None,
        },
    };

    let failed = response.failed;
    match serde_json::to_string(&response) {
        Ok(json) => println!("{json}"),
        Err(e) => println!(r#"{{"changed":false,"failed":true,"msg":"response serialization failed: {e}","thumbprint":null}}"#),
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run() -> anyhow::Result<String> {
    let arg_path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: osm-thumbprint <args.json>"))?;
    let raw = std::fs::read_to_string(&arg_path)?;
    let request: ThumbprintRequest = serde_json::from_str(&raw)?;

    let thumbprint = VmwareSession::get_thumbprint(&request.server, request.port).await?;
    Ok(thumbprint)
}
