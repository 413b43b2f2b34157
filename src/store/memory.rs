//! In-process store. All tables sit behind one async mutex and every trait
//! method holds it for its whole body, which gives each call the same
//! all-or-nothing behaviour a database transaction has.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{EditOutcome, PollStore, Transition, VoteInsert};
use crate::error::StoreError;
use crate::models::{
    ChallengeAttempt, Identity, NewChallenge, NewPoll, NewVote, Poll, PollDetails, PollEdit,
    PollOption, PollStatus, Tally, VerificationChallenge, Vote,
};
use crate::poll::{default_color, MAX_OPTIONS, MIN_OPTIONS};

#[derive(Debug, Default)]
struct Tables {
    identities: Vec<Identity>,
    challenges: Vec<VerificationChallenge>,
    polls: BTreeMap<i64, Poll>,
    options: Vec<PollOption>,
    votes: Vec<Vote>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn details(&self, poll: &Poll) -> PollDetails {
        PollDetails {
            poll: poll.clone(),
            options: self
                .options
                .iter()
                .filter(|option| option.poll_id == poll.id)
                .cloned()
                .collect(),
        }
    }

    fn ledger(&self, poll_id: i64) -> Vec<Vote> {
        let mut votes: Vec<Vote> = self
            .votes
            .iter()
            .filter(|vote| vote.poll_id == poll_id)
            .cloned()
            .collect();
        votes.sort_by_key(|vote| (vote.cast_at, vote.id));
        votes
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    async fn find_or_create_identity(
        &self,
        phone: &str,
        name: &str,
    ) -> Result<Identity, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(identity) = tables.identities.iter().find(|i| i.phone == phone) {
            return Ok(identity.clone());
        }
        let identity = Identity {
            id: tables.next_id(),
            phone: phone.to_string(),
            name: name.to_string(),
        };
        tables.identities.push(identity.clone());
        Ok(identity)
    }

    async fn insert_challenge(
        &self,
        challenge: NewChallenge,
    ) -> Result<VerificationChallenge, StoreError> {
        let mut tables = self.tables.lock().await;
        let row = VerificationChallenge {
            id: tables.next_id(),
            identity_phone: challenge.identity_phone,
            code: challenge.code,
            purpose: challenge.purpose,
            target_poll_id: challenge.target_poll_id,
            created_at: challenge.created_at,
            expires_at: challenge.expires_at,
            consumed: false,
        };
        tables.challenges.push(row.clone());
        Ok(row)
    }

    async fn consume_challenge(
        &self,
        attempt: ChallengeAttempt<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let matching = tables.challenges.iter_mut().rev().find(|c| {
            c.identity_phone == attempt.identity_phone
                && c.code == attempt.code
                && c.purpose == attempt.purpose
                && c.target_poll_id == attempt.target_poll_id
                && !c.consumed
                && c.expires_at > now
        });
        match matching {
            Some(challenge) => {
                challenge.consumed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_challenges(&self, expired_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.challenges.len();
        tables
            .challenges
            .retain(|challenge| challenge.expires_at >= expired_before);
        Ok((before - tables.challenges.len()) as u64)
    }

    async fn create_poll(&self, new: NewPoll) -> Result<PollDetails, StoreError> {
        let mut tables = self.tables.lock().await;
        let poll = Poll {
            id: tables.next_id(),
            public_id: new.public_id,
            question: new.question,
            creator_phone: new.creator_phone,
            end_time: new.end_time,
            status: new.status,
            created_at: new.created_at,
        };
        for option in new.options {
            let row = PollOption {
                id: tables.next_id(),
                poll_id: poll.id,
                text: option.text,
                color: option.color,
            };
            tables.options.push(row);
        }
        tables.polls.insert(poll.id, poll.clone());
        Ok(tables.details(&poll))
    }

    async fn poll(&self, poll_id: i64) -> Result<Option<PollDetails>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.polls.get(&poll_id).map(|poll| tables.details(poll)))
    }

    async fn poll_by_public_id(&self, public_id: &str) -> Result<Option<PollDetails>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .polls
            .values()
            .find(|poll| poll.public_id == public_id)
            .map(|poll| tables.details(poll)))
    }

    async fn latest_poll(
        &self,
        open: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<PollDetails>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .polls
            .values()
            .filter(|poll| matches!(poll.status, PollStatus::Active | PollStatus::Ended))
            .filter(|poll| match poll.end_time {
                Some(end) => (end > now) == open,
                None => false,
            })
            .max_by_key(|poll| (poll.created_at, poll.id))
            .map(|poll| tables.details(poll)))
    }

    async fn edit_poll(&self, poll_id: i64, edit: PollEdit) -> Result<EditOutcome, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(poll) = tables.polls.get(&poll_id).cloned() else {
            return Ok(EditOutcome::Missing);
        };
        if poll.status.is_terminal() {
            return Ok(EditOutcome::Locked(poll.status));
        }

        let existing = tables
            .options
            .iter()
            .filter(|o| o.poll_id == poll_id)
            .count();
        for option in &edit.options {
            if let Some(id) = option.id {
                if !tables.options.iter().any(|o| o.id == id && o.poll_id == poll_id) {
                    return Ok(EditOutcome::UnknownOption(id));
                }
            }
        }
        let added = edit.options.iter().filter(|o| o.id.is_none()).count();
        let resulting = existing + added;
        if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&resulting) {
            return Ok(EditOutcome::OptionCount(resulting));
        }

        let mut position = existing;
        for option in edit.options {
            match option.id {
                Some(id) => {
                    if let Some(row) = tables.options.iter_mut().find(|o| o.id == id) {
                        row.text = option.text;
                        if let Some(color) = option.color {
                            row.color = color;
                        }
                    }
                }
                None => {
                    let row = PollOption {
                        id: tables.next_id(),
                        poll_id,
                        text: option.text,
                        color: option.color.unwrap_or_else(|| default_color(position).to_string()),
                    };
                    position += 1;
                    tables.options.push(row);
                }
            }
        }

        let Some(poll) = tables.polls.get_mut(&poll_id) else {
            return Ok(EditOutcome::Missing);
        };
        if let Some(question) = edit.question {
            poll.question = question;
        }
        if let Some(end_time) = edit.end_time {
            poll.end_time = Some(end_time);
        }
        let poll = poll.clone();
        Ok(EditOutcome::Edited(tables.details(&poll)))
    }

    async fn transition(
        &self,
        poll_id: i64,
        from: PollStatus,
        to: PollStatus,
    ) -> Result<Transition, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(poll) = tables.polls.get_mut(&poll_id) else {
            return Ok(Transition::Missing);
        };
        if poll.status != from {
            return Ok(Transition::Refused(poll.clone()));
        }
        if matches!(to, PollStatus::Active | PollStatus::Ended) && poll.end_time.is_none() {
            return Err(StoreError::Corrupt(format!(
                "poll {poll_id} cannot become {to} without an end time"
            )));
        }
        poll.status = to;
        Ok(Transition::Applied(poll.clone()))
    }

    async fn insert_vote(&self, vote: NewVote) -> Result<VoteInsert, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(poll) = tables.polls.get(&vote.poll_id) else {
            return Ok(VoteInsert::PollMissing);
        };
        if !poll.is_open_at(vote.cast_at) {
            return Ok(VoteInsert::PollNotActive);
        }
        if !tables
            .options
            .iter()
            .any(|o| o.id == vote.option_id && o.poll_id == vote.poll_id)
        {
            return Ok(VoteInsert::InvalidOption);
        }
        if tables
            .votes
            .iter()
            .any(|v| v.poll_id == vote.poll_id && v.identity_phone == vote.identity_phone)
        {
            return Ok(VoteInsert::Duplicate);
        }

        let row = Vote {
            id: tables.next_id(),
            poll_id: vote.poll_id,
            option_id: vote.option_id,
            identity_phone: vote.identity_phone,
            cast_at: vote.cast_at,
            is_winner: false,
        };
        tables.votes.push(row.clone());
        Ok(VoteInsert::Inserted(row))
    }

    async fn tally(&self, poll_id: i64) -> Result<Tally, StoreError> {
        let tables = self.tables.lock().await;
        let counts = tables
            .options
            .iter()
            .filter(|option| option.poll_id == poll_id)
            .map(|option| {
                let count = tables
                    .votes
                    .iter()
                    .filter(|vote| vote.option_id == option.id)
                    .count() as i64;
                (option.id, count)
            });
        Ok(Tally::from_counts(poll_id, counts))
    }

    async fn votes(&self, poll_id: i64) -> Result<Vec<Vote>, StoreError> {
        Ok(self.tables.lock().await.ledger(poll_id))
    }

    async fn option_votes(&self, poll_id: i64, option_id: i64) -> Result<Vec<Vote>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .ledger(poll_id)
            .into_iter()
            .filter(|vote| vote.option_id == option_id)
            .collect())
    }

    async fn winner(&self, poll_id: i64) -> Result<Option<Vote>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .votes
            .iter()
            .find(|vote| vote.poll_id == poll_id && vote.is_winner)
            .cloned())
    }

    async fn mark_winner(&self, poll_id: i64, vote_id: i64) -> Result<Option<Vote>, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables
            .votes
            .iter()
            .any(|vote| vote.poll_id == poll_id && vote.is_winner)
        {
            return Ok(None);
        }
        Ok(tables
            .votes
            .iter_mut()
            .find(|vote| vote.id == vote_id && vote.poll_id == poll_id)
            .map(|vote| {
                vote.is_winner = true;
                vote.clone()
            }))
    }

    async fn clear_winner(&self, poll_id: i64) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut cleared = 0;
        for vote in tables
            .votes
            .iter_mut()
            .filter(|vote| vote.poll_id == poll_id && vote.is_winner)
        {
            vote.is_winner = false;
            cleared += 1;
        }
        Ok(cleared)
    }

    async fn due_active_polls(&self, now: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .polls
            .values()
            .filter(|poll| poll.status == PollStatus::Active && poll.is_due_at(now))
            .map(|poll| poll.id)
            .collect())
    }

    async fn ended_polls_without_winner(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .polls
            .values()
            .filter(|poll| poll.status == PollStatus::Ended && poll.is_due_at(now))
            .filter(|poll| {
                let mut ledger = tables.votes.iter().filter(|vote| vote.poll_id == poll.id);
                ledger.clone().next().is_some() && !ledger.any(|vote| vote.is_winner)
            })
            .map(|poll| poll.id)
            .collect())
    }
}
