//! `mdroid` – the vehicle hub daemon.
//!
//! 1. Initialises tracing (see [`telemetry`]).
//! 2. Loads `~/.mdroid/config.toml` (or the path given as the first
//!    argument), writing a default file on first run.
//! 3. Boots the hub: state store, settings, policies, one supervised link per
//!    configured serial port.
//! 4. On Ctrl-C (or SIGTERM) stops the links, drains the hooks and saves the
//!    session.

mod config;
mod hub;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use mdroid_serial::SerialConnector;
use tokio::sync::watch;
use tracing::{error, warn};

fn main() -> ExitCode {
    let _telemetry = telemetry::init_tracing("mdroid");

    print_banner();

    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let cfg = match config::load(explicit.as_deref()) {
        Ok((cfg, true)) => {
            let path = explicit.unwrap_or_else(config::config_path);
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok((cfg, false)) => {
            let path = explicit.unwrap_or_else(config::config_path);
            match config::save_to(&cfg, &path) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    path.display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    if cfg.serial.is_empty() {
        println!(
            "  {}  Add a [[serial]] entry or set {} to talk to the vehicle.",
            "No serial ports configured.".yellow(),
            "MDROID_SERIAL_DEVICE".bold()
        );
    }
    for port in &cfg.serial {
        println!("  Serial {} @ {} baud", port.device.bold(), port.baud);
    }
    println!();

    let (stop_tx, stop_rx) = watch::channel(false);
    let ctrlc_tx = stop_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down the hub …".yellow().bold());
        let _ = ctrlc_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown will not be available");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(hub::run(cfg, stop_rx, Arc::new(SerialConnector)));
    drop(stop_tx);

    match result {
        Ok(()) => {
            println!("{}", "  ✓ Hub stopped.".green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "hub failed");
            println!("{}: {}", "Hub error".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"               _           _     _ "#.bold().cyan());
    println!("{}", r#"  _ __ ___  __| |_ __ ___ (_) __| |"#.bold().cyan());
    println!("{}", r#" | '_ ` _ \/ _` | '__/ _ \| |/ _` |"#.bold().cyan());
    println!("{}", r#" | | | | | | (_| | | | (_) | | (_| |"#.bold().cyan());
    println!("{}", r#" |_| |_| |_|\__,_|_|  \___/|_|\__,_|"#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "mdroid".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  In-vehicle hub");
    println!();
}
