//! dispatch-core CLI entry point.
//!
//! ## CLI Subcommands
//!
//! - `dispatch-core-cli run [FILE]` - Process a batch payload (stdin when no file)
//! - `dispatch-core-cli status [--json]` - Show pipeline status
//! - `dispatch-core-cli config show|defaults|validate` - Inspect configuration

use std::process::ExitCode;

use dispatch_core::cli::{config_cmd, run_batch, run_status};
use dispatch_core::config;
use dispatch_core::telemetry::{describe_metrics, init_logging, LogConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "run" => {
            init_telemetry();
            let code = run_batch(args.get(2).map(|s| s.as_str())).await;
            ExitCode::from(code as u8)
        }
        "status" => {
            init_telemetry();
            let json_output = args.get(2).map(|s| s.as_str()) == Some("--json");
            let code = run_status(json_output).await;
            ExitCode::from(code as u8)
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => {
                    config_cmd::run_show();
                    ExitCode::SUCCESS
                }
                "defaults" => {
                    config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                "validate" => {
                    let code = config_cmd::run_validate();
                    ExitCode::from(code as u8)
                }
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("dispatch-core {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// Install logging from `DISPATCH_LOG_*` and register metric descriptions.
fn init_telemetry() {
    let env = config::load();
    let log_config = LogConfig {
        format: env.log_format,
        level: env.log_level,
        output_path: None,
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Logging disabled: {}", e);
    }
    describe_metrics();
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "dispatch-core - request deduplication, scheduling and batching v{}

USAGE:
    dispatch-core-cli [COMMAND] [OPTIONS]

COMMANDS:
    run [FILE]   Process a batch payload (reads stdin when FILE is omitted or -)
    status       Show pipeline status
    config       Inspect configuration (show, defaults, validate)
    version      Show version information
    help         Show this help message

ENVIRONMENT:
    DISPATCH_CONFIG_FILE  Optional TOML configuration file
    DISPATCH_LOG_LEVEL    Log filter (default: dispatch_core=info)
    DISPATCH_LOG_FORMAT   json or pretty
    DISPATCH_*            See `dispatch-core-cli config show`

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "run" => {
            eprintln!(
                "dispatch-core-cli run - Process a batch payload

USAGE:
    dispatch-core-cli run [FILE]

DESCRIPTION:
    Reads a JSON payload of the form
        {{\"requests\": [{{\"method\": \"GET\", \"url\": \"/users\"}}], \"options\": {{}}}}
    and processes it through a local pipeline whose executor echoes each
    request back. Prints the responses and batch metadata as JSON.

EXAMPLES:
    dispatch-core-cli run payload.json
    cat payload.json | dispatch-core-cli run
"
            );
        }
        "status" => {
            eprintln!(
                "dispatch-core-cli status - Show pipeline status

USAGE:
    dispatch-core-cli status [--json]
"
            );
        }
        "config" => {
            eprintln!(
                "dispatch-core-cli config - Inspect configuration

USAGE:
    dispatch-core-cli config <SUBCOMMAND>

SUBCOMMANDS:
    show           Show effective configuration
    defaults       Show default configuration
    validate       Validate configuration file and values
"
            );
        }
        _ => {
            eprintln!(
                "No detailed help available for '{}'. Use 'dispatch-core-cli help' for general usage.",
                command
            );
        }
    }
}
