//! `osm-migrate` — the migrate operation's module entry point
//! (spec.md §6): reads `argv[1]` as a JSON argument file, drives the
//! migration orchestrator, and writes one JSON object to stdout.

use std::process::ExitCode;

use osm::config::{resolve_openstack_auth, MigrateInput, ModuleResponse};
use osm::openstack::OpenStackSession;
use osm::orchestrator::Orchestrator;
use osm::run::RunContext;
use osm::vmware::VmwareSession;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = rustls::crypto::ring::default_provider().install_default();
    match run().await {
        Ok(response) => {
            print_response(&response);
            if response.failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            print_response(&ModuleResponse {
                changed: false,
                failed: true,
                msg: e.to_string(),
                id: None,
                log_file: None,
                disks: None,
            });
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ModuleResponse> {
    let arg_path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: osm-migrate <args.json>"))?;
    let raw = std::fs::read_to_string(&arg_path)?;
    let input: MigrateInput = serde_json::from_str(&raw)?;

    let run_ctx = RunContext::new(&input.vmname, input.osm_data_dir.as_deref());
    let _log_guard = osm::logging::init(&run_ctx.log_file, input.debug)?;

    let result = migrate(&input, &run_ctx).await;
    let log_file = run_ctx.log_file.display().to_string();

    match result {
        Ok(migration_result) => {
            let ids: Vec<String> = migration_result
                .disks
                .iter()
                .map(|d| d.volume_id.clone())
                .collect();
            let changed = migration_result
                .disks
                .iter()
                .any(|d| d.outcome != osm::model::DiskOutcomeKind::Skipped);
            Ok(ModuleResponse {
                changed,
                failed: matches!(migration_result.outcome, osm::model::MigrationOutcome::Failed),
                msg: describe_outcome(migration_result.outcome),
                id: Some(ids),
                log_file: Some(log_file),
                disks: Some(migration_result.disks),
            })
        }
        Err(e) => Ok(ModuleResponse {
            changed: false,
            failed: true,
            msg: e.to_string(),
            id: None,
            log_file: Some(log_file),
            disks: None,
        }),
    }
}

async fn migrate(input: &MigrateInput, run_ctx: &RunContext) -> osm::Result<osm::model::MigrationResult> {
    let vmware = VmwareSession::authenticate(&input.server, &input.user, &input.password, input.tls_verify).await?;

    let auth = resolve_openstack_auth(input.dst_cloud.as_ref()).ok_or_else(|| osm::Error::Auth {
        target: "openstack",
        message: "no OS_AUTH_URL and no dst_cloud supplied".to_owned(),
    })?;
    let openstack = OpenStackSession::connect(auth, input.tls_verify).await?;

    let orchestrator = Orchestrator {
        vmware: &vmware,
        openstack: &openstack,
        run: run_ctx,
        input,
    };
    orchestrator.migrate().await
}

fn describe_outcome(outcome: osm::model::MigrationOutcome) -> String {
    match outcome {
        osm::model::MigrationOutcome::Succeeded => "VM migrated successfully".to_owned(),
        osm::model::MigrationOutcome::PartialV2VFailure => {
            "VM data migrated but guest conversion failed on at least one disk".to_owned()
        }
        osm::model::MigrationOutcome::Failed => "VM migration failed".to_owned(),
    }
}

fn print_response(response: &ModuleResponse) {
    match serde_json::to_string(response) {
        Ok(json) => println!("{json}"),
        Err(e) => println!(r#"{{"changed":false,"failed":true,"msg":"response serialization failed: {e}"}}"#),
    }
}
