//! Embedded home page, a minimal browser client for the hub

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use rust_embed::Embed;

#[derive(Embed)]
#[folder = "assets/"]
struct HomeAssets;

/// Serve `home.html`
pub async fn index_handler() -> Response {
    serve_asset("home.html")
}

fn serve_asset(path: &str) -> Response {
    match HomeAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            (
                [(header::CONTENT_TYPE, mime.as_ref().to_string())],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}
