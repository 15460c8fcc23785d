mod instances;
mod proxy;

use axum::{
    Router,
    middleware,
    routing::{any, delete, get, post, put},
};
use tower_http::trace::TraceLayer;

use crate::{auth::require_api_key, state::AppState};

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/instances", get(instances::list))
        .route(
            "/instances/{name}",
            post(instances::create).get(instances::get).put(instances::update).delete(instances::delete),
        )
        .route("/instances/{name}/start", post(instances::start))
        .route("/instances/{name}/stop", post(instances::stop))
        .route("/instances/{name}/restart", post(instances::restart))
        .route("/instances/{name}/logs", get(instances::logs))
        .route("/instances/{name}/proxy/{*rest}", any(proxy::proxy))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
