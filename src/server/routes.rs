use axum::routing::{any, get};
use axum::Router;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::server::handlers;
use crate::server::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let debug = state.config.debug;

    let mut router = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/healthz", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/stats/cache", get(handlers::cache_stats))
        .route("/v2/", get(handlers::v2_root))
        .route("/v2/auth", get(handlers::v2_auth))
        .route("/v2/{*path}", any(handlers::v2_dispatch))
        .layer(TraceLayer::new_for_http());

    if debug {
        router = router
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));
    }

    router.with_state(state)
}
