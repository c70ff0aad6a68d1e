//! `lab-controller` binary: loads configuration, probes for instruments, and
//! wires the session/sequence/trigger engines together. The outer socket
//! that actually serves [`lab_controller::server::protocol::ClientRequest`]s
//! is deliberately not implemented here (see `server::router` docs) — this
//! binary's `serve` command brings the engines up and keeps them running so
//! an embedding process (or a future transport crate) can drive the
//! [`Router`] directly.

use clap::{Parser, Subcommand};
use lab_controller::config::Settings;
use lab_controller::driver::registry::Scanner;
use lab_controller::server::store::{DeviceAlias, FileStore};
use lab_controller::server::Router;
use lab_controller::session::manager::SessionManager;
use lab_controller::sequence;
use lab_controller::trigger;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "lab-controller", version, about = "Multi-device laboratory instrument server")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, default_value = "lab-controller.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probes configured serial ports for PSU/load instruments and prints
    /// what was found, without starting any engine.
    Scan,
    /// Brings up the session manager, sequence engine, and trigger engine,
    /// then idles. Intended to be embedded by a process that also owns the
    /// client-facing socket and drives `server::Router` against this state.
    Serve,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config).unwrap_or_else(|e| {
        tracing::warn!(error = %e, path = %cli.config.display(), "failed to load config file, using defaults");
        Settings::default()
    });

    match cli.command {
        Command::Scan => run_scan().await,
        Command::Serve => run_serve(settings).await,
    }
}

/// Enumerates available serial ports, probes each as a PSU/load candidate,
/// and prints the instruments found.
#[cfg(feature = "transport_serial")]
async fn run_scan() -> anyhow::Result<()> {
    use lab_controller::transport::serial::SerialTransport;

    let scanner = Scanner::new();
    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        println!("no serial ports found");
        return Ok(());
    }

    for port in ports {
        let transport = SerialTransport::new(port.port_name.clone(), 9600);
        match scanner.probe_psu_or_load(transport).await {
            Ok(driver) => {
                let info = driver.info();
                println!("{}: {} {} ({})", port.port_name, info.manufacturer, info.model, info.serial);
            }
            Err(e) => info!(port = %port.port_name, error = %e, "candidate rejected"),
        }
    }
    Ok(())
}

#[cfg(not(feature = "transport_serial"))]
async fn run_scan() -> anyhow::Result<()> {
    anyhow::bail!("serial port scanning requires the `transport_serial` feature")
}

async fn run_serve(settings: Settings) -> anyhow::Result<()> {
    let sessions = SessionManager::new();
    let sequences = sequence::spawn(sessions.clone());

    let store_dir = PathBuf::from(&settings.store_dir);
    let sequence_store: Arc<FileStore<lab_controller::sequence::SequenceDefinition>> =
        Arc::new(FileStore::open(store_dir.join("sequences.json")).await?);
    let trigger_store: Arc<FileStore<lab_controller::trigger::TriggerScript>> =
        Arc::new(FileStore::open(store_dir.join("trigger_scripts.json")).await?);
    let alias_store: Arc<FileStore<DeviceAlias>> = Arc::new(FileStore::open(store_dir.join("aliases.json")).await?);

    let sequence_source = Arc::new(lab_controller::server::store::SequenceLibrarySource::new(sequence_store.clone()));
    let triggers = trigger::spawn(sessions.clone(), sequences.clone(), sequence_source);

    let _router = Router::new(sessions, sequences, triggers, sequence_store, trigger_store, alias_store, settings.sequence);

    info!("lab-controller engines started; awaiting an embedding transport");
    std::future::pending::<()>().await;
    Ok(())
}
