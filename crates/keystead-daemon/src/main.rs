use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use zeroize::Zeroizing;

use keystead_core::export::ExportService;
use keystead_core::orchestrator::{BootOutcome, DualVolumeOrchestrator, StorageHandoff};
use keystead_core::paths;
use keystead_core::volume::VolumeKind;
use keystead_core::{IntegrityAlert, KdfParams};

#[derive(Parser, Debug)]
#[command(author, version, about = "Keystead key-lifecycle daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision the device: create the key set and both volumes
    Init {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Boot the volumes and serve the admin console on stdin
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Write an encrypted export bundle
    Export {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Bundle destination path
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Restore a bundle onto this device
    Import {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        bundle: PathBuf,
    },
    /// Show initialization and lock state
    Status {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

/// Storage-subsystem stand-in: the real subsystem registers here; until it
/// does, phase transitions are only logged. Key material never reaches the
/// log.
struct LoggingHandoff;

impl StorageHandoff for LoggingHandoff {
    fn enter_restricted(&self, key: &[u8]) -> keystead_core::Result<()> {
        info!(key_bytes = key.len(), "storage subsystem entered restricted mode");
        Ok(())
    }

    fn pivot_full(&self, key: &[u8]) -> keystead_core::Result<()> {
        info!(key_bytes = key.len(), "storage subsystem pivoted to full mode");
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { data_dir } => init_command(data_dir),
        Commands::Run { data_dir } => run_command(data_dir),
        Commands::Export { data_dir, output } => export_command(data_dir, output),
        Commands::Import { data_dir, bundle } => import_command(data_dir, bundle),
        Commands::Status { data_dir } => status_command(data_dir),
    }
}

fn resolve_data_dir(data_dir: Option<PathBuf>) -> Result<PathBuf> {
    Ok(match data_dir {
        Some(dir) => dir,
        None => paths::data_dir()?,
    })
}

fn init_command(data_dir: Option<PathBuf>) -> Result<()> {
    let data = resolve_data_dir(data_dir)?;
    let orch = DualVolumeOrchestrator::new(&data, None)?;
    if orch.key_manager().is_initialized() {
        return Err(anyhow!("device already provisioned at {}", data.display()));
    }
    let password = prompt_password_twice("Create admin password: ")?;
    let phrase = orch.provision(&password)?;
    println!("Device provisioned at {}", data.display());
    println!();
    println!("Recovery phrase (shown once, store it offline):");
    println!("  {}", phrase.as_str());
    Ok(())
}

fn run_command(data_dir: Option<PathBuf>) -> Result<()> {
    let data = resolve_data_dir(data_dir)?;
    let orch = DualVolumeOrchestrator::new(&data, None)?;
    if !orch.key_manager().is_initialized() {
        return Err(anyhow!("device not provisioned; run init first"));
    }

    let handoff = LoggingHandoff;
    match orch.boot(&handoff)? {
        BootOutcome::Restricted { alerts } => report_alerts(&alerts),
        BootOutcome::AwaitingAdmin { alerts } => report_alerts(&alerts),
    }

    info!("daemon started; type 'help' for commands");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("unlock") => {
                let password = prompt_password_once("Admin password: ")?;
                match orch.unlock(&password, &handoff) {
                    Ok(alerts) => report_alerts(&alerts),
                    Err(e) => warn!("unlock failed: {e}"),
                }
            }
            Some("recover") => {
                let phrase = prompt_password_once("Recovery phrase: ")?;
                match orch.unlock_with_recovery(&phrase, &handoff) {
                    Ok(alerts) => report_alerts(&alerts),
                    Err(e) => warn!("recovery unlock failed: {e}"),
                }
            }
            Some("lock") => {
                orch.lock();
                println!("locked");
            }
            Some("rewrap") => {
                let new = prompt_password_twice("New admin password: ")?;
                match orch.key_manager().rewrap_unlocked(&new) {
                    Ok(()) => println!("password changed"),
                    Err(e) => warn!("rewrap failed: {e}"),
                }
            }
            Some("status") => print_status(&orch),
            Some("help") => {
                println!("commands: unlock, recover, lock, rewrap, status, quit");
            }
            Some("quit") | Some("exit") => break,
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }

    orch.lock();
    info!("daemon stopped");
    Ok(())
}

fn export_command(data_dir: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let data = resolve_data_dir(data_dir)?;
    let orch = DualVolumeOrchestrator::new(&data, None)?;
    let handoff = LoggingHandoff;
    orch.boot(&handoff)?;
    let password = prompt_password_once("Admin password: ")?;
    orch.unlock(&password, &handoff)?;

    let dest = match output {
        Some(path) => path,
        None => {
            let dir = paths::exports_dir()?;
            std::fs::create_dir_all(&dir)?;
            dir.join("device.keystead")
        }
    };
    let result = ExportService::export(&orch, None, &dest);
    orch.lock();
    let manifest = result?;
    println!("Export written to {}", dest.display());
    for (name, summary) in &manifest.volumes {
        println!("  {name}: {} files, {}", summary.file_count, summary.hash);
    }
    Ok(())
}

fn import_command(data_dir: Option<PathBuf>, bundle: PathBuf) -> Result<()> {
    let data = resolve_data_dir(data_dir)?;
    let password = prompt_password_once("Admin password for the bundle: ")?;
    let orch = ExportService::import(&bundle, &password, &data, None, KdfParams::default())?;
    println!("Import complete; volumes restored under {}", data.display());
    print_status(&orch);
    Ok(())
}

fn status_command(data_dir: Option<PathBuf>) -> Result<()> {
    let data = resolve_data_dir(data_dir)?;
    let orch = DualVolumeOrchestrator::new(&data, None)?;
    print_status(&orch);
    Ok(())
}

fn print_status(orch: &DualVolumeOrchestrator) {
    println!(
        "initialized: {}",
        if orch.key_manager().is_initialized() { "yes" } else { "no" }
    );
    println!(
        "key set: {}",
        if orch.key_manager().is_locked() { "locked" } else { "unlocked" }
    );
    for kind in [VolumeKind::PreAuth, VolumeKind::PostAuth] {
        let handle = orch.handle(kind);
        println!(
            "volume {}: {}",
            kind,
            if handle.mounted { "mounted" } else { "not mounted" }
        );
    }
}

fn report_alerts(alerts: &[IntegrityAlert]) {
    for alert in alerts {
        eprintln!(
            "INTEGRITY ALERT: volume {} changed outside the daemon (expected {}, got {}); {}",
            alert.volume, alert.expected, alert.actual, alert.recommendation
        );
    }
}

fn prompt_password_once(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("KEYSTEAD_PASSWORD") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    std::io::stdout().flush()?;
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}

fn prompt_password_twice(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("KEYSTEAD_PASSWORD") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let first = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    if first.len() < 12 {
        return Err(anyhow!("password too short; minimum 12 characters"));
    }
    let second = rpassword::prompt_password("Confirm password: ")
        .map_err(|e| anyhow!("password prompt: {e}"))?;
    if first != second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(Zeroizing::new(first))
}
