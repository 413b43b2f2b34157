// src/services.rs
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::AppError;
use crate::lottery::{winning_option, Lottery};
use crate::models::{
    PollDetails, PollEdit, PollOption, PollStatus, Purpose, Tally, Vote,
};
use crate::notify::NotificationSink;
use crate::phone;
use crate::poll::{checked_text, PollInput};
use crate::store::{EditOutcome, PollStore};
use crate::tally::PollChannels;
use crate::verification::{IssuedChallenge, VerificationGate};

const DEFAULT_CREATOR_NAME: &str = "Anonymous";
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub auto_activate_polls: bool,
    pub otp_ttl: Duration,
    pub read_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            auto_activate_polls: false,
            otp_ttl: Duration::from_secs(10 * 60),
            read_retries: 2,
        }
    }
}

/// A request to create a poll, authorized by a `create_poll` code.
#[derive(Debug, Clone)]
pub struct CreatePoll {
    pub phone_number: String,
    pub code: String,
    pub creator_name: Option<String>,
    pub poll: PollInput,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionView {
    pub id: i64,
    pub text: String,
    pub color: String,
    pub votes: i64,
}

/// Winner as shown publicly: the phone is masked.
#[derive(Debug, Clone, Serialize)]
pub struct WinnerView {
    pub phone_number: String,
    pub voted_at: DateTime<Utc>,
}

impl From<&Vote> for WinnerView {
    fn from(vote: &Vote) -> Self {
        Self {
            phone_number: phone::mask(&vote.identity_phone),
            voted_at: vote.cast_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicPoll {
    pub id: i64,
    pub public_id: String,
    pub question: String,
    pub end_time: Option<DateTime<Utc>>,
    pub status: PollStatus,
    pub created_at: DateTime<Utc>,
    pub options: Vec<OptionView>,
    pub total_votes: i64,
    pub winner: Option<WinnerView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedVoter {
    pub rank: usize,
    pub phone_number: String,
    pub voted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WinnerRanking {
    pub winner: Option<WinnerView>,
    pub winning_option: Option<OptionView>,
    pub winning_option_voters: Vec<RankedVoter>,
}

fn option_views(options: &[PollOption], tally: &Tally) -> Vec<OptionView> {
    options
        .iter()
        .map(|option| OptionView {
            id: option.id,
            text: option.text.clone(),
            color: option.color.clone(),
            votes: tally.count(option.id),
        })
        .collect()
}

/// The poll engine: verification, ledger, tallies, lifecycle and lottery over
/// one store. Cheap to share behind an `Arc`; holds no locks across awaits.
pub struct PollService {
    pub(crate) store: Arc<dyn PollStore>,
    pub(crate) gate: VerificationGate,
    pub(crate) channels: PollChannels,
    pub(crate) notifier: Arc<dyn NotificationSink>,
    pub(crate) lottery: Lottery,
    pub(crate) clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl PollService {
    pub fn new(
        store: Arc<dyn PollStore>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let gate = VerificationGate::new(
            store.clone(),
            notifier.clone(),
            clock.clone(),
            settings.otp_ttl,
        );
        Self {
            store,
            gate,
            channels: PollChannels::new(),
            notifier,
            lottery: Lottery::from_entropy(),
            clock,
            settings,
        }
    }

    pub fn with_lottery(mut self, lottery: Lottery) -> Self {
        self.lottery = lottery;
        self
    }

    pub fn channels(&self) -> &PollChannels {
        &self.channels
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Runs a read-only operation, retrying storage failures with linear backoff.
    pub(crate) async fn with_read_retry<T, F, Fut>(&self, op: F) -> Result<T, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.settings.read_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "Read failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                result => return result,
            }
        }
    }

    pub async fn issue_challenge(
        &self,
        phone_number: &str,
        purpose: Purpose,
        poll_id: Option<i64>,
    ) -> Result<IssuedChallenge, AppError> {
        if let (Purpose::CastVote, Some(poll_id)) = (purpose, poll_id) {
            self.load_poll(poll_id).await?;
        }
        self.gate.issue(phone_number, purpose, poll_id).await
    }

    pub async fn verify_challenge(
        &self,
        phone_number: &str,
        code: &str,
        purpose: Purpose,
        poll_id: Option<i64>,
    ) -> Result<(), AppError> {
        self.gate.verify(phone_number, code, purpose, poll_id).await
    }

    /// Validates the definition, consumes the creator's code, then stores the
    /// poll. New polls are `pending` unless auto-activation is configured.
    pub async fn create_poll(&self, request: CreatePoll) -> Result<PollDetails, AppError> {
        let phone_number = phone::normalize(&request.phone_number)?;
        let status = if self.settings.auto_activate_polls {
            PollStatus::Active
        } else {
            PollStatus::Pending
        };
        let new_poll = request
            .poll
            .into_new_poll(phone_number.clone(), status, self.now())?;
        let creator_name = match request.creator_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => checked_text("creator name", name)?,
            _ => DEFAULT_CREATOR_NAME.to_string(),
        };

        self.gate
            .verify(&phone_number, &request.code, Purpose::CreatePoll, None)
            .await?;

        self.store
            .find_or_create_identity(&phone_number, &creator_name)
            .await?;
        let details = self.store.create_poll(new_poll).await?;

        info!(
            poll_id = details.poll.id,
            public_id = %details.poll.public_id,
            status = %details.poll.status,
            options = details.options.len(),
            "Poll created"
        );
        Ok(details)
    }

    async fn read_tally(&self, poll_id: i64) -> Result<Tally, AppError> {
        self.with_read_retry(|| async { self.store.tally(poll_id).await.map_err(AppError::from) })
            .await
    }

    async fn read_winner(&self, poll_id: i64) -> Result<Option<Vote>, AppError> {
        self.with_read_retry(|| async { self.store.winner(poll_id).await.map_err(AppError::from) })
            .await
    }

    pub(crate) async fn load_poll(&self, poll_id: i64) -> Result<PollDetails, AppError> {
        self.with_read_retry(|| async { self.store.poll(poll_id).await.map_err(AppError::from) })
            .await?
            .ok_or(AppError::PollNotFound)
    }

    /// Looks a poll up by its public id, falling back to the numeric id.
    pub async fn find_poll(&self, key: &str) -> Result<PollDetails, AppError> {
        let by_public_id = self
            .with_read_retry(|| async {
                self.store.poll_by_public_id(key).await.map_err(AppError::from)
            })
            .await?;
        match (by_public_id, key.parse::<i64>()) {
            (Some(details), _) => Ok(details),
            (None, Ok(poll_id)) => self.load_poll(poll_id).await,
            (None, Err(_)) => Err(AppError::PollNotFound),
        }
    }

    pub async fn get_tally(&self, poll_id: i64) -> Result<Tally, AppError> {
        self.load_poll(poll_id).await?;
        self.read_tally(poll_id).await
    }

    /// Poll with derived counts; the winner is shown once the end time has passed.
    pub async fn public_poll(&self, details: PollDetails) -> Result<PublicPoll, AppError> {
        let poll_id = details.poll.id;
        let now = self.now();
        let tally = self.read_tally(poll_id).await?;
        let winner = if details.poll.is_due_at(now) {
            self.read_winner(poll_id).await?
        } else {
            None
        };

        let PollDetails { poll, options } = details;
        Ok(PublicPoll {
            id: poll.id,
            status: poll.effective_status(now),
            options: option_views(&options, &tally),
            total_votes: tally.total,
            winner: winner.as_ref().map(WinnerView::from),
            public_id: poll.public_id,
            question: poll.question,
            end_time: poll.end_time,
            created_at: poll.created_at,
        })
    }

    /// The latest still-open poll and the latest closed one, when they exist.
    pub async fn featured_polls(&self) -> Result<Vec<PublicPoll>, AppError> {
        let now = self.now();
        let mut featured = Vec::with_capacity(2);
        for open in [true, false] {
            let latest = self
                .with_read_retry(|| async {
                    self.store.latest_poll(open, now).await.map_err(AppError::from)
                })
                .await?;
            if let Some(details) = latest {
                featured.push(self.public_poll(details).await?);
            }
        }
        Ok(featured)
    }

    /// Winner plus every voter of the winning option, earliest vote first.
    pub async fn winner_ranking(&self, poll_id: i64) -> Result<WinnerRanking, AppError> {
        let details = self.load_poll(poll_id).await?;
        if !details.poll.is_due_at(self.now()) {
            return Err(AppError::PollStillOpen);
        }

        let tally = self.read_tally(poll_id).await?;
        let Some((option_id, _)) = winning_option(&tally) else {
            return Ok(WinnerRanking {
                winner: None,
                winning_option: None,
                winning_option_voters: Vec::new(),
            });
        };

        let winner = self.read_winner(poll_id).await?;
        let voters = self
            .with_read_retry(|| async {
                self.store
                    .option_votes(poll_id, option_id)
                    .await
                    .map_err(AppError::from)
            })
            .await?;

        Ok(WinnerRanking {
            winner: winner.as_ref().map(WinnerView::from),
            winning_option: option_views(&details.options, &tally)
                .into_iter()
                .find(|option| option.id == option_id),
            winning_option_voters: voters
                .iter()
                .enumerate()
                .map(|(index, vote)| RankedVoter {
                    rank: index + 1,
                    phone_number: phone::mask(&vote.identity_phone),
                    voted_at: vote.cast_at,
                })
                .collect(),
        })
    }

    /// Full ledger of a poll, for administrators.
    pub async fn poll_votes(&self, poll_id: i64) -> Result<Vec<Vote>, AppError> {
        self.load_poll(poll_id).await?;
        self.with_read_retry(|| async { self.store.votes(poll_id).await.map_err(AppError::from) })
            .await
    }

    /// Administrative edit of question, end time and options while not ended.
    pub async fn edit_poll(&self, poll_id: i64, mut edit: PollEdit) -> Result<PollDetails, AppError> {
        if let Some(question) = edit.question.as_deref() {
            edit.question = Some(checked_text("question", question)?);
        }
        for option in &mut edit.options {
            option.text = checked_text("option text", &option.text)?;
        }

        match self.store.edit_poll(poll_id, edit).await? {
            EditOutcome::Edited(details) => {
                info!(poll_id, "Poll edited");
                Ok(details)
            }
            EditOutcome::Locked(status) => Err(AppError::Validation(format!(
                "a {status} poll can no longer be edited"
            ))),
            EditOutcome::UnknownOption(_) => Err(AppError::InvalidOption),
            EditOutcome::OptionCount(count) => Err(AppError::Validation(format!(
                "a poll needs between 2 and 5 options, the edit leaves {count}"
            ))),
            EditOutcome::Missing => Err(AppError::PollNotFound),
        }
    }
}
