use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Clone)]
pub struct Config {
    /// Path to the sqlite database file (from `DATABASE_URL`, with an
    /// optional `sqlite://` prefix).
    pub database_path: PathBuf,
    /// Decoded 32-byte AES key for provider token encryption.
    pub encryption_key: Vec<u8>,
    pub listen_addr: String,
    /// Base URL of the external reviewer service.
    pub reviewer_url: String,
    /// Optional model override forwarded to the reviewer.
    pub review_model: Option<String>,
    /// Optional token budget forwarded to the reviewer.
    pub max_tokens: Option<u32>,
}

/// Read a required config value.
///
/// For a key like "ENCRYPTION_KEY":
/// 1. Check if ENCRYPTION_KEY_FILE is set - if so, read from that file path
/// 2. Otherwise, check ENCRYPTION_KEY env var directly
fn read_secret(key: &str) -> Result<String> {
    let file_key = format!("{}_FILE", key);

    if let Ok(path) = env::var(&file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} from file: {}", key, path))?;
        // Trim trailing whitespace (files often have trailing newlines)
        Ok(contents.trim_end().to_string())
    } else {
        env::var(key)
            .with_context(|| format!("{} or {} environment variable is required", key, file_key))
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let database_path = PathBuf::from(
            database_url
                .strip_prefix("sqlite://")
                .unwrap_or(&database_url),
        );

        let encryption_key = reviewd_core::crypto::decode_key(&read_secret("ENCRYPTION_KEY")?)
            .context("ENCRYPTION_KEY must be a hex- or base64-encoded 32-byte key")?;

        let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let reviewer_url = env::var("REVIEWER_URL").context("REVIEWER_URL is required")?;
        let reviewer_url = reviewer_url.trim_end_matches('/').to_string();

        let review_model = env::var("REVIEW_MODEL").ok().filter(|s| !s.trim().is_empty());

        let max_tokens = match env::var("MAX_TOKENS") {
            Ok(v) => Some(
                v.parse::<u32>()
                    .context("MAX_TOKENS must be a valid number")?,
            ),
            Err(_) => None,
        };

        Ok(Config {
            database_path,
            encryption_key,
            listen_addr,
            reviewer_url,
            review_model,
            max_tokens,
        })
    }
}
