use anyhow::{Result, anyhow};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use crate::OutputFormat;

/// Installs the process-wide tracing subscriber, writing to stderr and filtered by
/// `RUST_LOG`. Fails if a global subscriber is already set.
pub fn setup_logging(format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Jsonl => {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_writer(std::io::stderr)
                .json()
                .with_env_filter(EnvFilter::from_default_env())
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| anyhow!("Failed to initialize tracing: {e}"))
        }
        OutputFormat::Pretty => {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_writer(std::io::stderr)
                .with_env_filter(EnvFilter::from_default_env())
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| anyhow!("Failed to initialize tracing: {e}"))
        }
    }
}

/// Hex-encoded SHA-256 of `s`.
pub fn hash_string(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

/// Strings hash as their contents; every other value hashes as its compact JSON.
pub fn hash_value(value: &Value) -> String {
    match value {
        Value::String(s) => hash_string(s),
        other => hash_string(&other.to_string()),
    }
}
