pub mod constants;
pub mod error;
pub mod logger;
pub mod proxy;

use tracing::{error, info};

use proxy::{AppState, ProxyConfig};

pub fn run() {
    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    logger::init_logger(config.debug_logging);

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        let state = match AppState::from_config(config) {
            Ok(state) => state,
            Err(e) => {
                error!("Startup failed: {}", e);
                std::process::exit(1);
            }
        };

        let updater_handle = state.updater.clone().start();

        let (_addr, server_handle) = match proxy::start_server(state.clone()).await {
            Ok(started) => started,
            Err(e) => {
                error!("Startup failed: {}", e);
                std::process::exit(1);
            }
        };

        info!(
            "K2Gate running (model: {}, tool support: {}, auto-update: {})",
            state.config.upstream_model_id,
            state.config.tool_support,
            state.config.enable_token_auto_update
        );

        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
        state.updater.stop();
        let _ = updater_handle.await;
        server_handle.abort();
    });
}
