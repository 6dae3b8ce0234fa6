use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{ProxyError, ProxyResult};

// One login credential for the upstream. `k2_password` is a deprecated
// spelling still found in older account files.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountRecord {
    pub email: String,
    #[serde(alias = "k2_password")]
    pub password: String,
}

// Token file: UTF-8, one token per line, blank lines and `#` comments
// ignored, order preserved.
pub fn read_token_lines(path: &Path) -> ProxyResult<Vec<String>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!("cannot read tokens file {}: {}", path.display(), e))
    })?;
    Ok(parse_token_lines(&raw))
}

pub fn parse_token_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

// Accounts file: one JSON object per line, blank lines and `#` comments
// ignored. Unparseable lines are skipped with a warning so one bad record
// does not block a refresh over the rest.
pub fn read_accounts(path: &Path) -> ProxyResult<Vec<AccountRecord>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!(
            "cannot read accounts file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(parse_account_lines(&raw))
}

pub fn parse_account_lines(raw: &str) -> Vec<AccountRecord> {
    let mut accounts = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.contains("\"k2_password\"") {
            warn!(
                "accounts line {}: deprecated field 'k2_password', use 'password'",
                lineno + 1
            );
        }
        match serde_json::from_str::<AccountRecord>(line) {
            Ok(account) => accounts.push(account),
            Err(e) => warn!("Skipping malformed account on line {}: {}", lineno + 1, e),
        }
    }
    accounts
}

// Rewrite the token file atomically: write a temp file in the same
// directory, then rename over the target so concurrent readers never see a
// half-written file.
pub fn write_tokens_atomic(path: &Path, tokens: &[String]) -> ProxyResult<()> {
    let mut contents = String::new();
    for token in tokens {
        contents.push_str(token);
        contents.push('\n');
    }

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents).map_err(|e| {
        ProxyError::Refresher(format!(
            "cannot write temp tokens file {}: {}",
            tmp_path.display(),
            e
        ))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        ProxyError::Refresher(format!(
            "cannot replace tokens file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(())
}
