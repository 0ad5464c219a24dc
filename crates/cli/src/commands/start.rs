use tgdesk_core::EncryptionContext;

use crate::commands::{connect, load_config, runtime, CommandResult, EXIT_CONFIG};

/// Startup preflight: config, encryption key and database reachability, without serving.
pub fn run() -> CommandResult {
    let config = match load_config("start") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    if let Err(error) = EncryptionContext::new(&config.encryption.key) {
        return CommandResult::failure(
            "start",
            "config_validation",
            format!("encryption key unusable: {error}"),
            EXIT_CONFIG,
        );
    }
    let runtime = match runtime("start") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        match connect("start", &config).await {
            Ok(pool) => {
                pool.close().await;
                CommandResult::success(
                    "start",
                    format!(
                        "startup preflight passed; server would bind {}:{}",
                        config.server.bind_address, config.server.port
                    ),
                )
            }
            Err(failure) => failure,
        }
    })
}
