use axum::Router;
use axum::routing::{delete, get, post, put};
use tower_http::trace::TraceLayer;

use super::{AppState, streams, volumes};

/// The volume API router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/volumes",
            get(volumes::list_volumes).post(volumes::create_volume),
        )
        .route("/volumes/destroy", delete(volumes::destroy_volumes))
        .route(
            "/volumes/{handle}",
            get(volumes::get_volume).delete(volumes::destroy_volume),
        )
        .route(
            "/volumes/{handle}/properties/{property}",
            put(volumes::set_property),
        )
        .route(
            "/volumes/{handle}/privileged",
            get(volumes::get_privileged).put(volumes::set_privileged),
        )
        .route("/volumes/{handle}/stream-in", put(streams::stream_in))
        .route("/volumes/{handle}/stream-out", put(streams::stream_out))
        .route(
            "/volumes/{handle}/stream-p2p-out",
            put(streams::stream_p2p_out),
        )
        .route("/volumes-async", post(volumes::create_volume_async))
        .route(
            "/volumes-async/{handle}",
            get(volumes::check_volume_async).delete(volumes::cancel_volume_async),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
