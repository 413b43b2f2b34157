// handlers.rs
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};

use crate::error::AppError;
use crate::ledger::CastVote;
use crate::lifecycle::{EndedPoll, SweepReport};
use crate::models::{PollDetails, PollEdit, Purpose, Tally, Vote};
use crate::poll::PollInput;
use crate::services::{CreatePoll, PublicPoll, WinnerRanking};
use crate::state::AppState;
use crate::tally::VOTE_CAST_EVENT;
use crate::verification::IssuedChallenge;

const TALLY_EVENT: &str = "tally";

/// Envelope shared by every successful response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;

fn ok<T>(message: impl Into<String>, data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse {
        success: true,
        message: message.into(),
        data: Some(data),
    }))
}

fn done(message: impl Into<String>) -> ApiResult<()> {
    Ok(Json(ApiResponse {
        success: true,
        message: message.into(),
        data: None,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SendCodeRequest {
    pub phone_number: String,
    pub purpose: Purpose,
    pub poll_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyCodeRequest {
    pub phone_number: String,
    pub code: String,
    pub purpose: Purpose,
    pub poll_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePollRequest {
    pub phone_number: String,
    pub code: String,
    pub creator_name: Option<String>,
    #[serde(flatten)]
    pub poll: PollInput,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub option_id: i64,
    pub phone_number: String,
    pub code: String,
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn send_code(
    State(state): State<AppState>,
    Json(request): Json<SendCodeRequest>,
) -> ApiResult<IssuedChallenge> {
    let issued = state
        .service
        .issue_challenge(&request.phone_number, request.purpose, request.poll_id)
        .await?;
    let message = if issued.delivered {
        "Verification code sent"
    } else {
        "Verification code created but could not be delivered, please try again"
    };
    ok(message, issued)
}

pub async fn verify_code(
    State(state): State<AppState>,
    Json(request): Json<VerifyCodeRequest>,
) -> ApiResult<()> {
    state
        .service
        .verify_challenge(
            &request.phone_number,
            &request.code,
            request.purpose,
            request.poll_id,
        )
        .await?;
    done("Code verified")
}

pub async fn featured_polls(State(state): State<AppState>) -> ApiResult<Vec<PublicPoll>> {
    ok("Featured polls", state.service.featured_polls().await?)
}

pub async fn create_poll(
    State(state): State<AppState>,
    Json(request): Json<CreatePollRequest>,
) -> ApiResult<PollDetails> {
    let details = state
        .service
        .create_poll(CreatePoll {
            phone_number: request.phone_number,
            code: request.code,
            creator_name: request.creator_name,
            poll: request.poll,
        })
        .await?;
    ok("Poll created", details)
}

pub async fn get_poll(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<PublicPoll> {
    let details = state.service.find_poll(&key).await?;
    ok("Poll found", state.service.public_poll(details).await?)
}

pub async fn cast_vote(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
    Json(request): Json<VoteRequest>,
) -> ApiResult<Value> {
    let vote = state
        .service
        .cast_vote(CastVote {
            poll_id,
            option_id: request.option_id,
            phone_number: request.phone_number,
            code: request.code,
        })
        .await?;
    ok(
        "Vote recorded",
        json!({ "poll_id": vote.poll_id, "option_id": vote.option_id, "voted_at": vote.cast_at }),
    )
}

pub async fn get_tally(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
) -> ApiResult<Tally> {
    ok("Tally", state.service.get_tally(poll_id).await?)
}

/// Live tally as Server-Sent Events: the current tally first, then one
/// `vote.cast` event per accepted vote. Lagged updates are skipped.
pub async fn stream_tally(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    // Subscribe before reading so no vote falls between the two.
    let receiver = state.service.channels().subscribe(poll_id);
    let tally = state.service.get_tally(poll_id).await?;

    let initial = Event::default().event(TALLY_EVENT).json_data(&tally);
    let updates = BroadcastStream::new(receiver)
        .filter_map(|update| update.ok())
        .map(|update| Event::default().event(VOTE_CAST_EVENT).json_data(update));

    Ok(Sse::new(tokio_stream::once(initial).chain(updates)).keep_alive(KeepAlive::default()))
}

pub async fn winner_ranking(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
) -> ApiResult<WinnerRanking> {
    ok("Winner ranking", state.service.winner_ranking(poll_id).await?)
}

// Admin

pub async fn approve_poll(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
) -> ApiResult<Value> {
    let poll = state.service.approve_poll(poll_id).await?;
    ok("Poll approved", json!({ "id": poll.id, "status": poll.status }))
}

pub async fn reject_poll(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
) -> ApiResult<Value> {
    let poll = state.service.reject_poll(poll_id).await?;
    ok("Poll rejected", json!({ "id": poll.id, "status": poll.status }))
}

pub async fn end_poll(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
) -> ApiResult<EndedPoll> {
    ok("Poll ended", state.service.end_poll(poll_id).await?)
}

pub async fn select_winner(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
) -> ApiResult<Option<Vote>> {
    match state.service.reselect_winner(poll_id).await? {
        Some(winner) => ok("Winner selected", Some(winner)),
        None => ok("No votes cast, no winner selected", None),
    }
}

pub async fn edit_poll(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
    Json(edit): Json<PollEdit>,
) -> ApiResult<PollDetails> {
    ok("Poll updated", state.service.edit_poll(poll_id, edit).await?)
}

pub async fn poll_votes(
    State(state): State<AppState>,
    Path(poll_id): Path<i64>,
) -> ApiResult<Vec<Vote>> {
    ok("Votes", state.service.poll_votes(poll_id).await?)
}

pub async fn sweep(State(state): State<AppState>) -> ApiResult<SweepReport> {
    ok("Sweep finished", state.service.sweep_expired_polls().await?)
}
