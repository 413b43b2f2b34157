//! Vote casting.
//!
//! Checks run in a fixed order: the poll exists and accepts votes, the code
//! is valid for this phone and poll, the option belongs to the poll, then the
//! insert itself, which the store guards with the one-vote-per-identity
//! constraint. The tally broadcast happens only after the insert committed.

use tracing::{info, warn};

use crate::error::AppError;
use crate::models::{NewVote, Purpose, Vote};
use crate::phone;
use crate::services::PollService;
use crate::store::VoteInsert;
use crate::tally::TallyUpdate;

const DEFAULT_VOTER_NAME: &str = "Anonymous Voter";

#[derive(Debug, Clone)]
pub struct CastVote {
    pub poll_id: i64,
    pub option_id: i64,
    pub phone_number: String,
    pub code: String,
}

impl PollService {
    pub async fn cast_vote(&self, request: CastVote) -> Result<Vote, AppError> {
        let CastVote {
            poll_id,
            option_id,
            phone_number,
            code,
        } = request;
        let phone_number = phone::normalize(&phone_number)?;

        let details = self.load_poll(poll_id).await?;
        if !details.poll.is_open_at(self.now()) {
            return Err(AppError::PollNotActive);
        }

        self.gate
            .verify(&phone_number, &code, Purpose::CastVote, Some(poll_id))
            .await?;

        if details.option(option_id).is_none() {
            return Err(AppError::InvalidOption);
        }

        self.store
            .find_or_create_identity(&phone_number, DEFAULT_VOTER_NAME)
            .await?;

        let inserted = self
            .store
            .insert_vote(NewVote {
                poll_id,
                option_id,
                identity_phone: phone_number.clone(),
                cast_at: self.now(),
            })
            .await?;

        let vote = match inserted {
            VoteInsert::Inserted(vote) => vote,
            VoteInsert::Duplicate => {
                warn!(poll_id, phone = %phone::mask(&phone_number), "Duplicate vote rejected");
                return Err(AppError::DuplicateVote);
            }
            // The poll ended or changed between the checks above and the insert.
            VoteInsert::PollNotActive => return Err(AppError::PollNotActive),
            VoteInsert::InvalidOption => return Err(AppError::InvalidOption),
            VoteInsert::PollMissing => return Err(AppError::PollNotFound),
        };

        info!(
            poll_id,
            option_id,
            vote_id = vote.id,
            phone = %phone::mask(&phone_number),
            "Vote recorded"
        );

        // The vote is committed; a failed broadcast only delays subscribers.
        match self.store.tally(poll_id).await {
            Ok(tally) => {
                self.channels.publish(TallyUpdate::new(tally, option_id));
            }
            Err(e) => warn!(poll_id, error = %e, "Tally read after vote failed, broadcast skipped"),
        }

        Ok(vote)
    }
}
