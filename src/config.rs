//! Configuration for Vestibule
//!
//! CLI arguments and environment variable handling using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::protocol::DEFAULT_CONTEXT;

/// Vestibule - background session coordinator for the wallet extension
#[derive(Parser, Debug, Clone)]
#[command(name = "vestibule")]
#[command(about = "Session coordinator and native-messaging host for the wallet extension")]
pub struct Args {
    /// Directory holding the vault, key-value store and object databases
    #[arg(long, env = "VESTIBULE_DATA_DIR", default_value = ".vestibule", global = true)]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value = "false", global = true)]
    pub log_json: bool,

    /// How long a connect request waits for unlock (seconds)
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value = "120")]
    pub connect_timeout_secs: u64,

    /// Bound on each message-transport call (milliseconds)
    #[arg(long, env = "TRANSPORT_TIMEOUT_MS", default_value = "5000")]
    pub transport_timeout_ms: u64,

    /// Lock the session after this long without activity (seconds, 0 disables)
    #[arg(long, env = "AUTO_LOCK_SECS", default_value = "900")]
    pub auto_lock_secs: u64,

    /// How long settled approvals stay in the journal (seconds)
    #[arg(long, env = "JOURNAL_RETENTION_SECS", default_value = "604800")]
    pub journal_retention_secs: u64,

    /// Context id of the approval surface; only it may unlock, approve or reject
    #[arg(long, env = "SURFACE_CONTEXT", default_value = "native")]
    pub surface_context: String,

    /// JSONL audit log path (disabled when unset)
    #[arg(long, env = "AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve native-messaging frames on stdin/stdout (default)
    Run,

    /// Create the vault with a fresh identity seed
    Init {
        /// Unlock secret for the new vault
        #[arg(long, env = "VESTIBULE_SECRET", hide_env_values = true)]
        secret: String,

        /// Replace an existing vault
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Print store status as JSON and exit
    Health,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout_secs == 0 {
            return Err("CONNECT_TIMEOUT_SECS must be greater than zero".to_string());
        }

        if self.transport_timeout_ms == 0 {
            return Err("TRANSPORT_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.surface_context.trim().is_empty() {
            return Err("SURFACE_CONTEXT must not be empty".to_string());
        }

        if let Some(Command::Init { secret, .. }) = &self.command {
            if secret.is_empty() {
                return Err("VESTIBULE_SECRET must not be empty".to_string());
            }
        }

        Ok(())
    }

    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    /// Coordinator settings derived from the arguments
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            data_dir: self.data_dir.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            transport_timeout: Duration::from_millis(self.transport_timeout_ms),
            auto_lock: (self.auto_lock_secs > 0).then(|| Duration::from_secs(self.auto_lock_secs)),
            journal_retention: Duration::from_secs(self.journal_retention_secs),
            surface_context: self.surface_context.clone(),
        }
    }
}

/// Runtime settings for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub data_dir: PathBuf,
    pub connect_timeout: Duration,
    pub transport_timeout: Duration,
    /// Idle window before auto-lock; `None` disables
    pub auto_lock: Option<Duration>,
    pub journal_retention: Duration,
    /// The one context allowed to send approval-surface commands
    pub surface_context: String,
}

impl CoordinatorConfig {
    /// Defaults rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            connect_timeout: Duration::from_secs(120),
            transport_timeout: Duration::from_secs(5),
            auto_lock: None,
            journal_retention: Duration::from_secs(7 * 24 * 3600),
            surface_context: DEFAULT_CONTEXT.to_string(),
        }
    }

    /// sled database for the key-value namespaces and the approval journal
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    /// Root of the per-address object databases
    pub fn objects_path(&self) -> PathBuf {
        self.data_dir.join("objects")
    }
}
