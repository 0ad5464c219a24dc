use tgdesk_db::migrations;

use crate::commands::{connect, load_config, runtime, CommandResult, EXIT_MIGRATION};

pub fn run() -> CommandResult {
    let config = match load_config("migrate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("migrate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let pool = match connect("migrate", &config).await {
            Ok(pool) => pool,
            Err(failure) => return failure,
        };
        let applied = migrations::run_pending(&pool).await;
        let count = migrations::applied_count(&pool).await.unwrap_or_default();
        pool.close().await;

        match applied {
            Ok(()) => CommandResult::success(
                "migrate",
                format!("applied pending migrations ({count} recorded)"),
            ),
            Err(error) => CommandResult::failure(
                "migrate",
                "migration",
                format!("migration failed: {error}"),
                EXIT_MIGRATION,
            ),
        }
    })
}
