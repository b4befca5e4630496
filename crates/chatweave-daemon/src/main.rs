//! Chatweave daemon — unattended multi-protocol chat relay.
//!
//! Usage:
//!
//!   chatweave [OPTIONS]
//!
//! Options:
//!
//!   --conf <PATH>   Configuration file (default: chatweave.toml)
//!   --debug         Verbose logging (same as RUST_LOG=debug)
//!   --version       Print the version and exit
//!
//! Environment:
//!
//!   RUST_LOG        Log level filter (default: info)
//!
//! The daemon runs until interrupted with Ctrl+C (SIGINT/SIGTERM).
//! Exit codes: 0 on a normal stop, non-zero on a configuration error or
//! when every adapter fails its first connect.

use std::path::PathBuf;

use chatweave_bridge::registry::Registry;
use chatweave_gateway::Router;
use chatweave_types::config::RootConfig;

// ---------------------------------------------------------------------------
// CLI arguments (manual parsing, in keeping with the tiny flag surface)
// ---------------------------------------------------------------------------

struct CliArgs {
    conf: PathBuf,
    debug: bool,
}

impl CliArgs {
    fn parse(args: &[String]) -> Self {
        let mut cli = Self {
            conf: PathBuf::from("chatweave.toml"),
            debug: false,
        };

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--conf" => {
                    i += 1;
                    if let Some(path) = args.get(i) {
                        cli.conf = PathBuf::from(path);
                    }
                }
                "--debug" => {
                    cli.debug = true;
                }
                "--version" | "-v" => {
                    println!("chatweave {}", env!("CARGO_PKG_VERSION"));
                    std::process::exit(0);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("unknown argument: {other}");
                    eprintln!("use --help for usage information");
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        cli
    }

    fn parse_from_env() -> Self {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::parse(&args)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse_from_env();

    // Tracing / logging.
    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    print_banner();

    if let Err(e) = run_daemon(&cli).await {
        tracing::error!("daemon error: {e}");
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Daemon main logic
// ---------------------------------------------------------------------------

async fn run_daemon(cli: &CliArgs) -> Result<(), String> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------

    let cfg = RootConfig::load(&cli.conf)
        .map_err(|e| format!("configuration load failed: {e}"))?;

    tracing::info!(
        conf = %cli.conf.display(),
        gateways = cfg.gateways.iter().filter(|g| g.enable).count(),
        "configuration loaded"
    );

    // -----------------------------------------------------------------------
    // 2. Router assembly
    // -----------------------------------------------------------------------

    let registry = Registry::with_defaults();
    let mut router = Router::from_config(&cfg, &registry)
        .await
        .map_err(|e| format!("router assembly failed: {e}"))?;

    // -----------------------------------------------------------------------
    // 3. First connect (single attempt per adapter)
    // -----------------------------------------------------------------------

    router
        .connect_all()
        .await
        .map_err(|e| format!("startup connect failed: {e}"))?;

    let mut dispatch_handle = router
        .start()
        .map_err(|e| format!("router start failed: {e}"))?;

    tracing::info!("relay running, press Ctrl+C to stop");

    // -----------------------------------------------------------------------
    // 4. Wait for shutdown
    // -----------------------------------------------------------------------

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C, shutting down...");
                router.shutdown();
                if let Err(e) = (&mut dispatch_handle).await {
                    tracing::warn!(error = %e, "dispatch task join failed");
                }
                break;
            }
            result = &mut dispatch_handle => {
                match result {
                    Ok(()) => {
                        return Err("dispatch loop exited unexpectedly".into());
                    }
                    Err(e) => {
                        return Err(format!("dispatch loop panicked: {e}"));
                    }
                }
            }
        }
    }

    tracing::info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn print_banner() {
    println!(
        r#"
        _           _
   ___ | |__   __ _| |___      _____  __ ___   _____
  / __|| '_ \ / _` | __\ \ /\ / / _ \/ _` \ \ / / _ \
 | (__ | | | | (_| | |_ \ V  V /  __/ (_| |\ V /  __/
  \___||_| |_|\__,_|\__| \_/\_/ \___|\__,_| \_/ \___|
                                       relay v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}

fn print_help() {
    println!(
        r#"Chatweave - multi-protocol chat relay daemon

USAGE:
    chatweave [OPTIONS]

OPTIONS:
    --conf <PATH>    Configuration file (default: chatweave.toml)
    --debug          Verbose logging (same as RUST_LOG=debug)
    --version, -v    Print the version and exit
    -h, --help       Show this help

EXAMPLES:
    # Run with the default config file
    chatweave

    # Run a specific config with verbose logging
    chatweave --conf /etc/chatweave/relay.toml --debug

ENVIRONMENT:
    RUST_LOG         Log level filter (default: info)
"#
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_when_no_flags() {
        let cli = CliArgs::parse(&[]);
        assert_eq!(cli.conf, PathBuf::from("chatweave.toml"));
        assert!(!cli.debug);
    }

    #[test]
    fn conf_and_debug_parsed() {
        let cli = CliArgs::parse(&args(&["--conf", "/etc/chatweave/relay.toml", "--debug"]));
        assert_eq!(cli.conf, PathBuf::from("/etc/chatweave/relay.toml"));
        assert!(cli.debug);
    }
}
