use std::process::ExitCode;

fn main() -> ExitCode {
    tgdesk_cli::run()
}
