//! Vestibule - native-messaging host for the wallet extension
//!
//! Reads framed requests from stdin, answers on stdout, logs to stderr.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use vestibule::{
    config::{Args, Command},
    logging,
    protocol::{read_frame, write_frame, InboundMessage, ResultEnvelope},
    services::{Collaborators, LocalDirectory},
    session::{vault, KdfParams, Vault},
    signer, Coordinator, VestibuleError,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    logging::init_tracing(&args.log_level, args.log_json);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    match args.command() {
        Command::Init { secret, force } => init(&args, &secret, force),
        Command::Health => health(&args).await,
        Command::Run => run(&args).await,
    }
}

/// Create the vault with a fresh seed
fn init(args: &Args, secret: &str, force: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating {}", args.data_dir.display()))?;

    let vault = Vault::in_dir(&args.data_dir);
    if vault.exists() && !force {
        bail!(
            "vault already exists at {} (use --force to replace it)",
            vault.path().display()
        );
    }

    let seed = vault::generate_seed();
    let file = vault.create(secret, &seed, KdfParams::default())?;
    let keys = signer::derive(seed.as_slice())?;

    info!(path = %vault.path().display(), "Vault created");
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "vault": vault.path(),
            "identity_public_key": file.identity_public_key,
            "secondary_public_key": keys.public_key_encoded,
            "fingerprint": keys.fingerprint(),
        }))?
    );
    Ok(())
}

async fn open(args: &Args) -> anyhow::Result<Coordinator> {
    let config = args.coordinator_config();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    let directory_db = sled::open(config.data_dir.join("directory"))
        .context("opening local name directory")?;
    let collaborators = Collaborators::offline(LocalDirectory::open(&directory_db)?);

    let coordinator = Coordinator::open(config, collaborators).await?;
    if let Some(path) = &args.audit_log {
        coordinator
            .audit()
            .init_file(path.clone())
            .await
            .with_context(|| format!("opening audit log {}", path.display()))?;
    }
    Ok(coordinator)
}

/// Print store status and exit
async fn health(args: &Args) -> anyhow::Result<()> {
    let coordinator = open(args).await?;

    let mut phases = serde_json::Map::new();
    for entry in coordinator.journal().entries()? {
        let phase = serde_json::to_value(entry.phase)?;
        let key = phase.as_str().unwrap_or("unknown").to_string();
        let count = phases.get(&key).and_then(Value::as_u64).unwrap_or(0);
        phases.insert(key, json!(count + 1));
    }

    let migration_id = vestibule::storage::AddressForm::CURRENT.migration_id();
    let tokens = match coordinator.token_health().await {
        Ok(report) => serde_json::to_value(report)?,
        Err(e) => json!({ "error": e.to_string() }),
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "vault": coordinator.sessions().vault().exists(),
            "interrupted_approvals": coordinator.interrupted(),
            "journal": phases,
            "address_migration": coordinator.kv().flag(&migration_id)?,
            "tokens": tokens,
        }))?
    );

    coordinator.shutdown().await;
    Ok(())
}

/// Serve native-messaging frames until stdin closes
async fn run(args: &Args) -> anyhow::Result<()> {
    let coordinator = Arc::new(open(args).await?);

    info!("======================================");
    info!("  Vestibule - wallet session coordinator");
    info!("======================================");
    info!("Data dir: {}", args.data_dir.display());
    info!("Vault: {}", if coordinator.sessions().vault().exists() { "present" } else { "MISSING" });
    info!("Connect timeout: {}s", args.connect_timeout_secs);
    info!("Auto-lock: {}", match args.auto_lock_secs {
        0 => "disabled".to_string(),
        secs => format!("{secs}s"),
    });
    info!("======================================");

    for entry in coordinator.interrupted() {
        warn!(
            request_id = %entry.request_id,
            origin = %entry.origin,
            "Approval from a previous run ended without settling"
        );
    }

    // Single writer for stdout
    let (tx, mut rx) = mpsc::unbounded_channel::<ResultEnvelope>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = write_frame(&mut stdout, &envelope).await {
                error!("Failed to write frame: {}", e);
                break;
            }
        }
    });

    let mut stdin = tokio::io::stdin();
    loop {
        let frame = tokio::select! {
            frame = read_frame::<_, Value>(&mut stdin) => frame,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        };

        let raw = match frame {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("stdin closed, shutting down");
                break;
            }
            Err(e) if e.is_fatal() => {
                error!("Unreadable frame, closing: {}", e);
                break;
            }
            Err(e) => {
                warn!("Skipping frame: {}", e);
                continue;
            }
        };

        let message: InboundMessage = match serde_json::from_value(raw.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed message: {}", e);
                if let Some(id) = raw.get("correlation_id").and_then(Value::as_str) {
                    let err = VestibuleError::InvalidRequest(e.to_string());
                    let _ = tx.send(ResultEnvelope::err(id, &err));
                }
                continue;
            }
        };

        if !coordinator.router().is_registered(message.context()) {
            coordinator.attach_context(message.context(), tx.clone());
        }

        let coordinator = Arc::clone(&coordinator);
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(reply) = coordinator.handle(message).await {
                let _ = tx.send(reply);
            }
        });
    }

    coordinator.shutdown().await;
    drop(tx);
    // Routed results hold sender clones; give the writer a moment to drain
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), writer).await;
    Ok(())
}
