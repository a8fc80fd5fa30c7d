mod daemon;
mod inspect;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::core::terminal::{self, GuideSection, print_error};

const DEFAULT_DEAD_LETTER_LIMIT: usize = 20;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Core")
        .command("run", "Start the pipeline and API in the foreground")
        .command("daemon-run", "Same as run, without the startup summary")
        .print();

    GuideSection::new("Inspect")
        .command("status", "Show the status of a running daemon")
        .command("dead-letters", "List permanently failed alerts")
        .command("config", "Validate and print the configuration")
        .print();

    GuideSection::new("Options")
        .text("--config <path>       Config file (default: <data dir>/alert-relay.toml)")
        .text("--api-host <host>     API bind or connect host")
        .text("--api-port <port>     API bind or connect port")
        .text("--limit <n>           Rows to show for dead-letters")
        .blank()
        .text("Set ALERT_RELAY_DATA_DIR to move the data directory.")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("alert-relay").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommonFlags {
    pub config_path: Option<PathBuf>,
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
    pub limit: Option<usize>,
}

pub(crate) fn parse_common_flags(args: &[String], start: usize) -> CommonFlags {
    let mut flags = CommonFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    flags.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--limit" | "-n" => {
                if i + 1 < args.len() {
                    flags.limit = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    let (api_host, api_port) = parse_api_server_flags(args, start);
    flags.api_host = api_host;
    flags.api_port = api_port;
    flags
}

pub(crate) fn parse_api_server_flags(args: &[String], start: usize) -> (Option<String>, Option<u16>) {
    let mut api_host = None;
    let mut api_port = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let cmd = args[1].as_str();
    let flags = parse_common_flags(&args, 2);
    match cmd {
        "run" | "daemon-run" => {
            daemon::run_daemon(daemon::DaemonOptions {
                config_path: flags.config_path,
                api_host: flags.api_host,
                api_port: flags.api_port,
                interactive: cmd == "run",
            })
            .await
        }
        "status" => {
            let (host, port) = inspect::configured_server(flags.config_path.as_deref()).await;
            inspect::show_status(
                &flags.api_host.unwrap_or(host),
                flags.api_port.unwrap_or(port),
            )
            .await
        }
        "dead-letters" => {
            inspect::list_dead_letters(flags.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)).await
        }
        "config" => inspect::show_config(flags.config_path.as_deref()).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
