use serde::Serialize;
use serde_json::json;
use tgdesk_core::config::AppConfig;
use tgdesk_core::EncryptionContext;

use crate::commands::{
    connect, load_config, runtime, CommandResult, EXIT_CONFIG, EXIT_DB_CONNECT, EXIT_RUNTIME,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
    #[serde(skip)]
    exit_code: u8,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into(), exit_code: 0 }
    }

    fn fail(name: &'static str, details: impl Into<String>, exit_code: u8) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into(), exit_code }
    }

    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: CheckStatus::Skipped,
            details: "skipped because configuration did not load".to_string(),
            exit_code: 0,
        }
    }
}

/// Runs every readiness check. `--json` adds the per-check breakdown to the output line.
pub fn run(include_checks: bool) -> CommandResult {
    let checks = build_checks();
    let failed: Vec<&DoctorCheck> =
        checks.iter().filter(|check| check.status != CheckStatus::Pass).collect();
    let details = include_checks.then(|| json!({ "checks": checks }));

    match failed.first() {
        None => CommandResult::success_with("doctor", "all readiness checks passed", details),
        Some(first) => {
            let summary = failed
                .iter()
                .map(|check| format!("{}: {}", check.name, check.details))
                .collect::<Vec<_>>()
                .join("; ");
            CommandResult::failure_with(
                "doctor",
                first.name,
                summary,
                first.exit_code,
                details,
            )
        }
    }
}

fn build_checks() -> Vec<DoctorCheck> {
    match load_config("doctor") {
        Ok(config) => vec![
            DoctorCheck::pass("config_validation", "configuration loaded and validated"),
            check_encryption_key(&config),
            check_database_connectivity(&config),
        ],
        Err(failure) => vec![
            DoctorCheck::fail("config_validation", message_of(&failure), EXIT_CONFIG),
            DoctorCheck::skipped("encryption_key_readiness"),
            DoctorCheck::skipped("database_connectivity"),
        ],
    }
}

fn check_encryption_key(config: &AppConfig) -> DoctorCheck {
    match EncryptionContext::new(&config.encryption.key) {
        Ok(context) => match context.encrypt("doctor").and_then(|sealed| context.decrypt(&sealed)) {
            Ok(_) => {
                DoctorCheck::pass("encryption_key_readiness", "key seals and opens credentials")
            }
            Err(error) => {
                DoctorCheck::fail("encryption_key_readiness", error.to_string(), EXIT_CONFIG)
            }
        },
        Err(error) => DoctorCheck::fail("encryption_key_readiness", error.to_string(), EXIT_CONFIG),
    }
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let runtime = match runtime("doctor") {
        Ok(runtime) => runtime,
        Err(failure) => {
            return DoctorCheck::fail("database_connectivity", message_of(&failure), EXIT_RUNTIME)
        }
    };

    runtime.block_on(async {
        match connect("doctor", config).await {
            Ok(pool) => {
                pool.close().await;
                DoctorCheck::pass("database_connectivity", "database reachable")
            }
            Err(failure) => {
                DoctorCheck::fail("database_connectivity", message_of(&failure), EXIT_DB_CONNECT)
            }
        }
    })
}

fn message_of(result: &CommandResult) -> String {
    serde_json::from_str::<serde_json::Value>(&result.output)
        .ok()
        .and_then(|payload| payload["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| result.output.clone())
}
