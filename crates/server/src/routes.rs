//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::ratelimit::rate_limit_middleware;
use crate::state::AppState;
use axum::Router;
use axum::handler::Handler;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Only planning is rate limited; downloads of planned chunks are not.
    let planning_routes = Router::new()
        .route("/zip-chunks/init", post(handlers::init_chunks))
        .route_layer(middleware::from_fn_with_state(
            state.rate_limit.clone(),
            rate_limit_middleware,
        ));

    let mut router = Router::new()
        .merge(planning_routes)
        .route("/zip-chunks/{handle}", get(handlers::get_chunk))
        .route("/gh-update", post(handlers::trigger_update))
        .route("/health", get(handlers::health_check));

    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    // Everything else is served straight from the mirror, with listings for
    // directories that have no index.html.
    let listing = handlers::list_directory.with_state(state.clone());
    let mirror = ServeDir::new(&state.config.mirror.root).fallback(listing);

    router
        .fallback_service(mirror)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
