//! Static UI serving (spec §6: `GET /home/*`) and the process-liveness
//! probe.
//!
//! Grounded on `src/route/static.rs`'s `#[cfg(debug_assertions)]` split:
//! `tower_http::services::ServeDir`/`ServeFile` in debug builds so the UI
//! can be edited without a rebuild, `rust_embed` embedding `assets/` into
//! the binary in release builds. Mounted at `/home/*path` per spec §6
//! rather than the teacher's root `/`, since this relay's root HTTP port
//! also carries the FLV and WebRTC-signalling routes.

use axum::response::IntoResponse;
use axum::Router;
use http::StatusCode;

#[cfg(not(debug_assertions))]
use {axum::extract::Path as AxumPath, http::header, rust_embed::RustEmbed};

#[cfg(not(debug_assertions))]
#[derive(RustEmbed)]
#[folder = "assets/"]
struct Assets;

pub fn mount(router: Router) -> Router {
    #[cfg(debug_assertions)]
    {
        use tower_http::services::{ServeDir, ServeFile};
        let serve_dir = ServeDir::new("assets").not_found_service(ServeFile::new("assets/index.html"));
        router.nest_service("/home", serve_dir)
    }
    #[cfg(not(debug_assertions))]
    {
        router.route("/home/*path", axum::routing::get(static_handler))
    }
}

#[cfg(not(debug_assertions))]
async fn static_handler(AxumPath(path): AxumPath<String>) -> impl IntoResponse {
    let path = if path.is_empty() { "index.html" } else { path.as_str() };
    match Assets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.as_ref())], content.data).into_response()
        }
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// `GET /healthz` (spec §6, ambient): liveness once the Supervisor has
/// bound every listener and the route is reachable at all.
pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}
