pub mod admin;
pub mod config;
pub mod handlers;
pub mod mappers;
pub mod middleware;
pub mod server;
pub mod token;
pub mod upstream;

pub use config::ProxyConfig;
pub use server::{build_router, start_server, AppState};
pub use token::{TokenPool, TokenUpdater};
