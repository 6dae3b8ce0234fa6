use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};

use super::store;

#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub value: String,
    pub failure_count: u32,
    pub disabled: bool,
}

impl TokenEntry {
    fn new(value: String) -> Self {
        Self {
            value,
            failure_count: 0,
            disabled: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EntryStats {
    pub index: usize,
    pub failure_count: u32,
    pub disabled: bool,
}

#[derive(Debug, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub disabled: usize,
    pub entries: Vec<EntryStats>,
}

struct PoolState {
    entries: Vec<TokenEntry>,
    cursor: usize,
}

// Round-robin pool of upstream bearer tokens with per-token failure
// accounting. Every mutation happens under one lock; `replace` swaps the
// whole entry vector so readers never observe a partial update.
pub struct TokenPool {
    state: Mutex<PoolState>,
    max_failures: u32,
}

impl TokenPool {
    pub fn new(values: Vec<String>, max_failures: u32) -> Self {
        let entries = values.into_iter().map(TokenEntry::new).collect();
        Self {
            state: Mutex::new(PoolState { entries, cursor: 0 }),
            max_failures,
        }
    }

    pub fn load(path: &Path, max_failures: u32) -> ProxyResult<Self> {
        let values = store::read_token_lines(path)?;
        info!("Loaded {} tokens from {}", values.len(), path.display());
        Ok(Self::new(values, max_failures))
    }

    // Advance the cursor round-robin and return the next active token value.
    // A full pass over the entries without finding an active one means the
    // pool is exhausted.
    pub fn select(&self) -> Option<String> {
        let mut state = self.state.lock().expect("token pool lock poisoned");
        let len = state.entries.len();
        if len == 0 {
            return None;
        }
        for _ in 0..len {
            let index = state.cursor;
            state.cursor = (state.cursor + 1) % len;
            let entry = &state.entries[index];
            if !entry.disabled {
                debug!(
                    "Selected token (index: {}, failures: {})",
                    index, entry.failure_count
                );
                return Some(entry.value.clone());
            }
        }
        warn!("All tokens in the pool are disabled");
        None
    }

    pub fn record_success(&self, token: &str) {
        let mut state = self.state.lock().expect("token pool lock poisoned");
        if let Some((index, entry)) = state
            .entries
            .iter_mut()
            .enumerate()
            .find(|(_, e)| e.value == token)
        {
            if entry.failure_count > 0 {
                info!(
                    "Token recovered (index: {}, failures: {} -> 0)",
                    index, entry.failure_count
                );
            }
            entry.failure_count = 0;
            entry.disabled = false;
        }
    }

    // Returns the new failure count and whether this call disabled the token.
    pub fn record_failure(&self, token: &str, reason: &str) -> (u32, bool) {
        let max_failures = self.max_failures;
        let mut state = self.state.lock().expect("token pool lock poisoned");
        let Some((index, entry)) = state
            .entries
            .iter_mut()
            .enumerate()
            .find(|(_, e)| e.value == token)
        else {
            warn!("No matching token for failure accounting");
            return (0, false);
        };

        entry.failure_count += 1;
        let disabled_now = !entry.disabled && entry.failure_count >= max_failures;
        if entry.failure_count >= max_failures {
            entry.disabled = true;
        }
        if disabled_now {
            warn!(
                "Token disabled (index: {}, failures: {}/{}): {}",
                index, entry.failure_count, max_failures, reason
            );
        } else {
            warn!(
                "Token failure (index: {}, failures: {}/{}): {}",
                index, entry.failure_count, max_failures, reason
            );
        }
        (entry.failure_count, disabled_now)
    }

    pub fn reset(&self, index: usize) -> bool {
        let mut state = self.state.lock().expect("token pool lock poisoned");
        match state.entries.get_mut(index) {
            Some(entry) => {
                let old_failures = entry.failure_count;
                entry.failure_count = 0;
                entry.disabled = false;
                info!(
                    "Token reset (index: {}, failures: {} -> 0)",
                    index, old_failures
                );
                true
            }
            None => {
                warn!("Invalid token index for reset: {}", index);
                false
            }
        }
    }

    pub fn reset_all(&self) {
        let mut state = self.state.lock().expect("token pool lock poisoned");
        let mut reset_count = 0;
        for entry in state.entries.iter_mut() {
            if entry.failure_count > 0 || entry.disabled {
                entry.failure_count = 0;
                entry.disabled = false;
                reset_count += 1;
            }
        }
        info!(
            "Reset {} tokens, pool size {}",
            reset_count,
            state.entries.len()
        );
    }

    // Atomically swap the whole entry set. Callers already holding a token
    // value keep using it; subsequent selections only see the new entries.
    pub fn replace(&self, values: Vec<String>) {
        let entries: Vec<TokenEntry> = values.into_iter().map(TokenEntry::new).collect();
        let mut state = self.state.lock().expect("token pool lock poisoned");
        let old = state.entries.len();
        state.entries = entries;
        state.cursor = 0;
        info!("Token pool replaced: {} -> {}", old, state.entries.len());
    }

    pub fn reload(&self, path: &Path) -> ProxyResult<usize> {
        let values = store::read_token_lines(path)
            .map_err(|e| ProxyError::Config(format!("reload failed: {}", e)))?;
        let count = values.len();
        self.replace(values);
        Ok(count)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().expect("token pool lock poisoned");
        let entries: Vec<EntryStats> = state
            .entries
            .iter()
            .enumerate()
            .map(|(index, e)| EntryStats {
                index,
                failure_count: e.failure_count,
                disabled: e.disabled,
            })
            .collect();
        let disabled = entries.iter().filter(|e| e.disabled).count();
        PoolStats {
            total: entries.len(),
            active: entries.len() - disabled,
            disabled,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("token pool lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_len(&self) -> usize {
        let state = self.state.lock().expect("token pool lock poisoned");
        state.entries.iter().filter(|e| !e.disabled).count()
    }
}
