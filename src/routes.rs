// routes.rs
use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, patch, post},
    Router,
};
use tracing::warn;

use crate::error::AppError;
use crate::handlers;
use crate::state::AppState;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let authorized = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|token| state.admits(token));

    if !authorized {
        warn!(path = %request.uri().path(), "Admin request refused");
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(request).await)
}

fn admin_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/polls/{id}", patch(handlers::edit_poll))
        .route("/polls/{id}/approve", post(handlers::approve_poll))
        .route("/polls/{id}/reject", post(handlers::reject_poll))
        .route("/polls/{id}/end", post(handlers::end_poll))
        .route("/polls/{id}/select-winner", post(handlers::select_winner))
        .route("/polls/{id}/votes", get(handlers::poll_votes))
        .route("/sweep", post(handlers::sweep))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}

pub fn create_routes(state: AppState) -> Router {
    let api = Router::new()
        .route("/otp/send", post(handlers::send_code))
        .route("/otp/verify", post(handlers::verify_code))
        .route(
            "/polls",
            get(handlers::featured_polls).post(handlers::create_poll),
        )
        .route("/polls/{id}", get(handlers::get_poll))
        .route("/polls/{id}/vote", post(handlers::cast_vote))
        .route("/polls/{id}/tally", get(handlers::get_tally))
        .route("/polls/{id}/stream", get(handlers::stream_tally))
        .route("/polls/{id}/winner-ranking", get(handlers::winner_ranking))
        .nest("/admin", admin_routes(state.clone()));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .with_state(state)
}
