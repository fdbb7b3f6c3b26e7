use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pacing::RetryPolicy;

pub const DEFAULT_LOOKBACK_DAYS: u32 = 7;
pub const DEFAULT_PROCESSED_LABEL: &str = "JobTracker-Processed";
pub const DEFAULT_MODEL: &str = "gemini";

/// Knobs for one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub lookback_days: u32,
    /// Pause after each accepted sent-folder event.
    pub outbound_pause: Duration,
    /// Pause after each accepted inbox event; longer because it may have triggered a backfill.
    pub inbound_pause: Duration,
    pub excerpt_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            outbound_pause: Duration::from_secs(31),
            inbound_pause: Duration::from_secs(46),
            excerpt_chars: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ledger_path: PathBuf,
    pub token_file: PathBuf,
    pub processed_label: String,
    pub model: String,
    pub classifier_retry: RetryPolicy,
    pub engine: EngineConfig,
    pub dry_run: bool,
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "applytrack")
}

pub fn default_ledger_path() -> PathBuf {
    // Use XDG data directory or fall back to the working directory
    match project_dirs() {
        Some(dirs) => dirs.data_dir().join("job_applications.csv"),
        None => PathBuf::from("job_applications.csv"),
    }
}

pub fn default_token_path() -> PathBuf {
    match project_dirs() {
        Some(dirs) => dirs.config_dir().join("gmail_token.txt"),
        None => PathBuf::from("gmail_token.txt"),
    }
}

/// `GMAIL_ACCESS_TOKEN` wins over the token file.
pub fn read_access_token(from_env: Option<String>, token_file: &Path) -> Result<String> {
    if let Some(token) = from_env.filter(|t| !t.trim().is_empty()) {
        return Ok(token.trim().to_string());
    }
    let token = std::fs::read_to_string(token_file).with_context(|| {
        format!(
            "Failed to read Gmail access token from {}. Set GMAIL_ACCESS_TOKEN or write the token to that file.",
            token_file.display()
        )
    })?;
    Ok(token.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.lookback_days, 7);
        assert!(config.inbound_pause > config.outbound_pause);
    }

    #[test]
    fn test_default_paths_have_file_names() {
        assert!(default_ledger_path().ends_with("job_applications.csv"));
        assert!(default_token_path().ends_with("gmail_token.txt"));
    }

    #[test]
    fn test_read_access_token_prefers_env() {
        let token = read_access_token(Some(" abc \n".to_string()), Path::new("/nonexistent")).unwrap();
        assert_eq!(token, "abc");
    }

    #[test]
    fn test_read_access_token_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.txt");
        std::fs::write(&path, "ya29.token\n").unwrap();

        assert_eq!(read_access_token(None, &path).unwrap(), "ya29.token");
        assert_eq!(read_access_token(Some("  ".to_string()), &path).unwrap(), "ya29.token");
    }

    #[test]
    fn test_read_access_token_missing_file() {
        let err = read_access_token(None, Path::new("/nonexistent/token.txt")).unwrap_err();
        assert!(err.to_string().contains("GMAIL_ACCESS_TOKEN"));
    }
}
