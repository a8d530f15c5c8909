use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;

use crate::routes;
use crate::state::AppState;

pub(crate) fn build_app(state: AppState) -> Router {
    let app = Router::new()
        .route(
            "/api/placement/state",
            axum::routing::get(routes::api::get_placement_state),
        )
        .route(
            "/api/placement/category",
            axum::routing::post(routes::api::set_category),
        )
        .route(
            "/api/placement/mode",
            axum::routing::post(routes::api::set_placement_mode),
        )
        .route(
            "/api/placement/click",
            axum::routing::post(routes::api::place_club),
        )
        .route(
            "/api/placement/move",
            axum::routing::post(routes::api::move_club),
        )
        .route(
            "/api/placement/select",
            axum::routing::post(routes::api::select_club),
        )
        .route(
            "/api/placement/reload",
            axum::routing::post(routes::api::reload_clubs),
        )
        .route("/api/markers", axum::routing::get(routes::api::get_markers))
        .route(
            "/api/markers/refresh",
            axum::routing::post(routes::api::refresh_markers),
        )
        .route(
            "/api/markers/resolve",
            axum::routing::get(routes::api::resolve_marker),
        )
        .route(
            "/api/viewport",
            axum::routing::get(routes::api::get_viewport)
                .post(routes::api::update_viewport),
        )
        .route(
            "/api/invitations",
            axum::routing::post(routes::api::send_invitations),
        )
        .route("/api/events", axum::routing::get(routes::sse::marker_events))
        .route("/api/health", axum::routing::get(routes::api::health))
        .route("/api/metrics", axum::routing::get(routes::api::metrics));

    // The placement UI is served separately; allow it to reach the API from
    // another origin during development.
    app.layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    use super::build_app;
    use crate::state::AppState;

    fn test_state() -> AppState {
        AppState::new(
            "http://127.0.0.1:9".to_string(),
            "test-event".to_string(),
        )
    }

    #[tokio::test]
    async fn health_route_is_wired() {
        let app = build_app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should be served");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_routes_return_not_found() {
        let app = build_app(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/unknown")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should be served");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
