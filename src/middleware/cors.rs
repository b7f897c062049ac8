use http::HeaderValue;
use tower_http::cors::{Any, CorsLayer};

/// Restricts to `origin` when configured, otherwise allows any origin.
pub fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match origin.and_then(|o| HeaderValue::from_str(o).ok()) {
        Some(value) => layer.allow_origin(value),
        None => layer.allow_origin(Any),
    }
}
