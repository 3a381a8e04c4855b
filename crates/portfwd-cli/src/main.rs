//! portfwd: multi-rule TCP/UDP port forwarder.
//!
//! Parses `-t`/`-u` rules, starts one forwarder per rule, and runs until
//! SIGINT or SIGTERM. Exits 1 on any invalid rule or config before a socket
//! is opened, and with 128 + signal number after a signal.

mod cli;
mod config;
mod melt;

use cli::Cli;
use config::{Overrides, Settings};
use melt::SelfRemoval;
use portfwd_core::ForwardingSupervisor;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let (cli, rule_args) = match Cli::try_parse_ordered(std::env::args_os()) {
        Ok(parsed) => parsed,
        // Prints help/version and exits 0, or prints usage and exits 2.
        Err(e) => e.exit(),
    };

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting portfwd");

    // Load settings (file + CLI overrides)
    let overrides = Overrides {
        local_address: cli.local,
        udp_idle_timeout: cli.udp_idle_timeout,
        shutdown_grace: cli.grace_period,
        tcp_connect_timeout: cli.connect_timeout,
    };
    let config_path = PathBuf::from(&cli.config);
    let settings = match Settings::load(Some(&config_path), &overrides) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to load config");
            std::process::exit(1);
        }
    };

    // Validate every rule before any socket opens
    let rules = match cli::build_rules(&rule_args, settings.local_address) {
        Ok(rules) => rules,
        Err(e) => {
            error!(error = %e, "invalid rule, exiting");
            std::process::exit(1);
        }
    };

    if cli.melt > 0 {
        match SelfRemoval::current_exe() {
            Ok(mut melt) => {
                if let Err(e) = melt.remove() {
                    warn!(path = %melt.path().display(), error = %e, "failed to remove executable");
                }
            }
            Err(e) => warn!(error = %e, "cannot locate executable"),
        }
    }

    for rule in &rules {
        info!(rule = %rule, "rule configured");
    }
    if rules.is_empty() {
        info!("no rules given, waiting for a signal");
    }

    let signal = ForwardingSupervisor::new(rules, settings.forward)
        .run_until_signal()
        .await;

    info!(signal = %signal, "portfwd stopped");
    std::process::exit(signal.exit_code());
}
