use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::proxy::config::ProxyConfig;
use crate::proxy::token::pool::TokenPool;
use crate::proxy::token::store;
use crate::proxy::upstream::client::UpstreamClient;

#[derive(Debug, Default)]
struct UpdaterState {
    // The background scheduler loop is alive (distinct from `in_progress`,
    // which tracks one refresh actually executing).
    running: bool,
    in_progress: bool,
    last_run_at: Option<DateTime<Utc>>,
    last_result: Option<String>,
    update_count: u64,
    error_count: u64,
}

#[derive(Debug, Serialize)]
pub struct UpdaterStatus {
    pub enabled: bool,
    pub running: bool,
    pub in_progress: bool,
    pub last_run_at: Option<String>,
    pub last_result: Option<String>,
    pub next_run_at: Option<String>,
    pub update_count: u64,
    pub error_count: u64,
}

// Background refresher: periodically logs into the upstream with the stored
// accounts, rewrites the token file atomically and swaps the pool. A single
// task owns the refresh loop, so refreshes never overlap; `force_update`
// leaves one queued wake-up at most, which gives the coalescing the admin
// surface promises.
pub struct TokenUpdater {
    config: Arc<ProxyConfig>,
    pool: Arc<TokenPool>,
    upstream: Arc<UpstreamClient>,
    state: Mutex<UpdaterState>,
    force_notify: Notify,
    stop_notify: Notify,
}

impl TokenUpdater {
    pub fn new(
        config: Arc<ProxyConfig>,
        pool: Arc<TokenPool>,
        upstream: Arc<UpstreamClient>,
    ) -> Self {
        Self {
            config,
            pool,
            upstream,
            state: Mutex::new(UpdaterState::default()),
            force_notify: Notify::new(),
            stop_notify: Notify::new(),
        }
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let updater = self;
        tokio::spawn(async move {
            info!(
                "Token updater started (auto-update: {}, interval: {}s)",
                updater.config.enable_token_auto_update,
                updater.config.token_update_interval.as_secs()
            );
            updater.set_running(true);

            // A pool that loaded empty is useless until the first login
            // round, so refresh immediately instead of waiting a full tick.
            if updater.config.enable_token_auto_update && updater.pool.is_empty() {
                info!("Token pool is empty at startup, refreshing now");
                updater.run_refresh().await;
            }

            let mut interval = tokio::time::interval(updater.config.token_update_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if updater.config.enable_token_auto_update {
                            updater.run_refresh().await;
                        }
                    }
                    _ = updater.force_notify.notified() => {
                        updater.run_refresh().await;
                    }
                    _ = updater.stop_notify.notified() => {
                        info!("Token updater stopped");
                        break;
                    }
                }
            }
            updater.set_running(false);
        })
    }

    fn set_running(&self, running: bool) {
        let mut state = self.state.lock().expect("updater state lock poisoned");
        state.running = running;
    }

    // Schedule an immediate refresh. Safe to call from any task; requests
    // arriving while a refresh runs collapse into one follow-up run.
    pub fn force_update(&self) {
        self.force_notify.notify_one();
    }

    pub fn stop(&self) {
        self.stop_notify.notify_one();
    }

    pub fn status(&self) -> UpdaterStatus {
        let state = self.state.lock().expect("updater state lock poisoned");
        let next_run_at = if self.config.enable_token_auto_update {
            state
                .last_run_at
                .map(|t| t + self.config.token_update_interval)
        } else {
            None
        };
        UpdaterStatus {
            enabled: self.config.enable_token_auto_update,
            running: state.running,
            in_progress: state.in_progress,
            last_run_at: state.last_run_at.map(|t| t.to_rfc3339()),
            last_result: state.last_result.clone(),
            next_run_at: next_run_at.map(|t| t.to_rfc3339()),
            update_count: state.update_count,
            error_count: state.error_count,
        }
    }

    async fn run_refresh(&self) {
        {
            let mut state = self.state.lock().expect("updater state lock poisoned");
            state.in_progress = true;
            state.last_run_at = Some(Utc::now());
        }
        let result = self.refresh_once().await;
        let mut state = self.state.lock().expect("updater state lock poisoned");
        state.in_progress = false;
        match result {
            Ok(count) => {
                state.update_count += 1;
                state.last_result = Some(format!("ok: {} tokens", count));
            }
            Err(message) => {
                state.error_count += 1;
                state.last_result = Some(format!("error: {}", message));
            }
        }
    }

    // One refresh round. The previous pool stays active unless at least one
    // login succeeds, and the file swap is temp-file + rename so readers
    // never see a partial token list.
    async fn refresh_once(&self) -> Result<usize, String> {
        let accounts = match store::read_accounts(&self.config.accounts_file) {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("Skipping token refresh: {}", e);
                return Err(e.to_string());
            }
        };
        if accounts.is_empty() {
            warn!(
                "Skipping token refresh: no accounts in {}",
                self.config.accounts_file.display()
            );
            return Err("no accounts configured".to_string());
        }

        info!("Refreshing tokens for {} accounts", accounts.len());
        let mut tokens = Vec::new();
        let mut failed = 0usize;
        for account in &accounts {
            match self.upstream.login(&account.email, &account.password).await {
                Ok(token) => tokens.push(token),
                Err(e) => {
                    failed += 1;
                    warn!("Login failed for {}: {}", account.email, e);
                }
            }
        }

        if tokens.is_empty() {
            error!(
                "Token refresh produced no tokens ({} accounts failed); keeping previous pool",
                failed
            );
            return Err(format!("all {} logins failed", failed));
        }

        store::write_tokens_atomic(&self.config.tokens_file, &tokens)
            .map_err(|e| e.to_string())?;
        let count = tokens.len();
        self.pool.replace(tokens);
        info!(
            "Token refresh complete: {} tokens ({} logins failed)",
            count, failed
        );
        Ok(count)
    }
}
