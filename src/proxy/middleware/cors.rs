use axum::http::Method;
use tower_http::cors::{Any, CorsLayer};

// The gateway fronts arbitrary OpenAI clients, so CORS is permissive.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(Any)
        .max_age(std::time::Duration::from_secs(3600))
}
