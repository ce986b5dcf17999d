//! EVCP Monitor Node - operator console for one charging point
//!
//! # Usage
//!
//! ```bash
//! # Engine port derived from the CP number (6000 + 1)
//! evcp-monitor CP-001
//!
//! # Explicit endpoints
//! evcp-monitor CP-002 --central-host central --central-port 5000 \
//!     --engine-host engine-2 --engine-port 6002 \
//!     --registry-url http://registry:5001
//! ```
//!
//! Console commands: `status`, `help`, `quit`.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use evcp_monitor::{
    Coordinator, FileCredentialStore, HttpRegistry, MonitorConfig, MonitorEvent, StatusSnapshot,
    StopOutcome,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// EV charging point monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Charging point id, e.g. CP-001
    #[arg(env = "EVCP_CP_ID")]
    cp_id: String,

    /// Engine host
    #[arg(long, env = "EVCP_ENGINE_HOST", default_value = "localhost")]
    engine_host: String,

    /// Engine port (default: 6000 + CP number)
    #[arg(long, env = "EVCP_ENGINE_PORT")]
    engine_port: Option<u16>,

    /// Central controller host
    #[arg(long, env = "EVCP_CENTRAL_HOST", default_value = "localhost")]
    central_host: String,

    /// Central controller port
    #[arg(long, env = "EVCP_CENTRAL_PORT", default_value = "5000")]
    central_port: u16,

    /// Registry base URL
    #[arg(long, env = "EVCP_REGISTRY_URL", default_value = "http://localhost:5001")]
    registry_url: String,

    /// Credential cache directory
    #[arg(long, env = "EVCP_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "EVCP_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Operator console command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Status,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "status" => Some(Command::Status),
            "help" => Some(Command::Help),
            "quit" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging; RUST_LOG wins over --log-level
    let level = match args.log_level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => args.log_level.as_str(),
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = MonitorConfig::new(&args.cp_id)
        .with_engine(&args.engine_host, args.engine_port)
        .with_controller(&args.central_host, args.central_port)
        .with_registry(&args.registry_url)
        .with_cache_dir(&args.data_dir);
    let engine_port = config.engine_port()?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              EVCP Monitor - Charging Point Node              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  CP:       {:<50} ║", config.cp_id);
    println!(
        "║  Engine:   {:<50} ║",
        truncate(&format!("{}:{}", config.engine.host, engine_port), 50)
    );
    println!(
        "║  Central:  {:<50} ║",
        truncate(&format!("{}:{}", config.controller.host, config.controller.port), 50)
    );
    println!("║  Registry: {:<50} ║", truncate(&config.registry.url, 50));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let store = Arc::new(FileCredentialStore::new(&config.cache_dir));
    let registry = Arc::new(HttpRegistry::new(&config.registry)?);

    let monitor = match Coordinator::start(config, store, registry).await {
        Ok(monitor) => monitor,
        Err(e) => {
            error!("Monitor failed to start: {}", e);
            return Err(e.into());
        }
    };
    let mut events = monitor.subscribe();

    // Spawn stdin handler for operator commands
    let (command_tx, mut command_rx) = mpsc::channel::<Command>(16);
    std::thread::spawn(move || {
        print_help();
        let stdin = io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            if line.trim().is_empty() {
                continue;
            }
            match Command::parse(&line) {
                Some(command) => {
                    if command_tx.blocking_send(command).is_err() {
                        break;
                    }
                }
                None => println!("Unknown command {:?}. Try: help", line.trim()),
            }
        }
    });

    // Main event loop
    loop {
        tokio::select! {
            _ = monitor.closed() => break,

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }

            Some(command) = command_rx.recv() => match command {
                Command::Status => print_status(&monitor.status()),
                Command::Help => print_help(),
                Command::Quit => break,
            },

            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Console fell behind, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if let Some(reason) = monitor.shutdown().await {
        error!("Monitor stopped: {}", reason);
        return Err(reason.into());
    }

    info!("Monitor stopped");
    Ok(())
}

fn print_help() {
    println!("\nCommands:");
    println!("  status  - Show engine health and charging state");
    println!("  help    - Show this list");
    println!("  quit    - Disconnect and exit\n");
}

fn print_status(status: &StatusSnapshot) {
    let health = if status.engine_healthy {
        format!(
            "OK ({}/{} failures)",
            status.consecutive_failures, status.failure_threshold
        )
    } else {
        format!("FAULT ({} failures)", status.consecutive_failures)
    };

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  CP:       {:<50} ║", status.cp_id);
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Engine:   {:<50} ║", health);
    println!("║  Point:    {:<50} ║", status.point.label());
    if let Some(session) = &status.session {
        println!("║  Driver:   {:<50} ║", truncate(&session.driver_id, 50));
        println!(
            "║  Started:  {:<50} ║",
            format!(
                "{} UTC, full by {}",
                session.started_at.format("%H:%M:%S"),
                session.expected_end.format("%H:%M:%S")
            )
        );
        println!("║  Elapsed:  {:<50} ║", format!("{}s", session.elapsed.as_secs()));
        println!(
            "║  Progress: {:<50} ║",
            format!("{}% ({:.2} kWh)", session.progress, session.energy_kwh)
        );
    }
    println!(
        "║  Session:  {:<50} ║",
        if status.authenticated { "key held" } else { "no key" }
    );
    if let Some(reason) = &status.fatal {
        println!("║  Fatal:    {:<50} ║", truncate(reason, 50));
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

fn print_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::SessionStarted {
            driver_id,
            started_at,
            expected_duration,
            ..
        } => {
            println!(
                "\n>>> Charging started for driver {} at {} UTC, about {}s to full",
                driver_id,
                started_at.format("%H:%M:%S"),
                expected_duration.as_secs()
            );
        }
        MonitorEvent::Progress {
            progress,
            energy_kwh,
            ..
        } => {
            println!("    {:>3}%  {:.2} kWh", progress, energy_kwh);
        }
        MonitorEvent::ChargingComplete {
            driver_id,
            energy_kwh,
            ..
        } => {
            println!(
                "\n>>> Charged to 100% ({:.2} kWh). Driver {} may unplug.",
                energy_kwh, driver_id
            );
        }
        MonitorEvent::UnplugReminder { driver_id } => {
            println!("    Waiting for driver {} to unplug", driver_id);
        }
        MonitorEvent::SessionEnded {
            driver_id,
            outcome,
            final_progress,
            energy_kwh,
        } => {
            let how = match outcome {
                StopOutcome::FullCompletion => "full charge",
                StopOutcome::EarlyDisconnect => "early disconnect",
            };
            println!(
                "\n>>> Session for {} ended: {} at {}% ({:.2} kWh)",
                driver_id, how, final_progress, energy_kwh
            );
        }
        MonitorEvent::EngineFaulted {
            consecutive_failures,
        } => {
            println!(
                "\n!!! ENGINE FAULT after {} failed health checks, controller notified",
                consecutive_failures
            );
        }
        MonitorEvent::EngineRecovered => {
            println!("\n>>> Engine recovered, controller notified");
        }
        MonitorEvent::ControllerLost => {
            println!("\n!!! Lost controller connection, re-authenticating");
        }
        MonitorEvent::ControllerRestored => {
            println!("\n>>> Controller connection restored");
        }
        MonitorEvent::Fatal { reason } => {
            println!("\n!!! FATAL: {}", reason);
        }
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse("status"), Some(Command::Status));
        assert_eq!(Command::parse("  HELP \n"), Some(Command::Help));
        assert_eq!(Command::parse("exit"), Some(Command::Quit));
        assert_eq!(Command::parse("reboot"), None);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("http://registry.example:5001", 12), "http://re...");
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["evcp-monitor", "CP-004"]).unwrap();
        assert_eq!(args.cp_id, "CP-004");
        assert_eq!(args.central_port, 5000);
        assert!(args.engine_port.is_none());
        assert_eq!(args.data_dir, PathBuf::from("data"));
    }
}
