//! Persistence for polls, the vote ledger and verification challenges.
//!
//! Every method is a single atomic unit against the backing store. Invariants
//! that must hold under concurrent requests (one vote per identity per poll,
//! single-use codes, one winner per poll, monotonic status) are enforced here
//! by transactions, conditional updates and unique constraints. Callers never
//! lock around store calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{
    ChallengeAttempt, Identity, NewChallenge, NewPoll, NewVote, Poll, PollDetails, PollEdit,
    PollStatus, Tally, VerificationChallenge, Vote,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Result of a conditional status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The poll was in `from` and now is in `to`.
    Applied(Poll),
    /// The poll was not in `from`; nothing was written.
    Refused(Poll),
    Missing,
}

/// Result of the atomic vote insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteInsert {
    Inserted(Vote),
    PollMissing,
    PollNotActive,
    InvalidOption,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Edited(PollDetails),
    /// The poll has ended (or been rejected) and can no longer be edited.
    Locked(PollStatus),
    UnknownOption(i64),
    /// The edit would leave the poll outside the 2-5 option range.
    OptionCount(usize),
    Missing,
}

#[async_trait]
pub trait PollStore: Send + Sync {
    /// Idempotent upsert keyed by phone. An existing name is left untouched.
    async fn find_or_create_identity(&self, phone: &str, name: &str)
        -> Result<Identity, StoreError>;

    async fn insert_challenge(
        &self,
        challenge: NewChallenge,
    ) -> Result<VerificationChallenge, StoreError>;

    /// Marks the newest matching, unconsumed, unexpired challenge as consumed.
    /// Returns `false` when no such challenge exists. Of two concurrent calls for
    /// the same challenge at most one returns `true`.
    async fn consume_challenge(
        &self,
        attempt: ChallengeAttempt<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Deletes challenges that expired before `expired_before`, consumed or not.
    async fn purge_challenges(&self, expired_before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Inserts the poll and all its options in one transaction.
    async fn create_poll(&self, poll: NewPoll) -> Result<PollDetails, StoreError>;

    async fn poll(&self, poll_id: i64) -> Result<Option<PollDetails>, StoreError>;

    async fn poll_by_public_id(&self, public_id: &str) -> Result<Option<PollDetails>, StoreError>;

    /// Most recently created active or ended poll whose end time is after `now`
    /// (`open = true`) or at/before `now` (`open = false`).
    async fn latest_poll(
        &self,
        open: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<PollDetails>, StoreError>;

    async fn edit_poll(&self, poll_id: i64, edit: PollEdit) -> Result<EditOutcome, StoreError>;

    /// `UPDATE … SET status = to WHERE status = from`. Moving to `Ended` holds an
    /// exclusive lock on the poll row, so it serializes against in-flight vote inserts.
    async fn transition(
        &self,
        poll_id: i64,
        from: PollStatus,
        to: PollStatus,
    ) -> Result<Transition, StoreError>;

    /// Re-checks that the poll is open at `vote.cast_at` and that the option
    /// belongs to it, then inserts under the `(poll_id, identity_phone)` constraint.
    async fn insert_vote(&self, vote: NewVote) -> Result<VoteInsert, StoreError>;

    async fn tally(&self, poll_id: i64) -> Result<Tally, StoreError>;

    /// All votes of a poll in ledger order (`cast_at`, then `id`).
    async fn votes(&self, poll_id: i64) -> Result<Vec<Vote>, StoreError>;

    /// Votes for one option in ledger order.
    async fn option_votes(&self, poll_id: i64, option_id: i64) -> Result<Vec<Vote>, StoreError>;

    async fn winner(&self, poll_id: i64) -> Result<Option<Vote>, StoreError>;

    /// Flags `vote_id` as the winner unless the poll already has one.
    /// Returns `None` when another winner was already recorded.
    async fn mark_winner(&self, poll_id: i64, vote_id: i64) -> Result<Option<Vote>, StoreError>;

    /// Clears every winner flag of the poll. Returns the number of rows changed.
    async fn clear_winner(&self, poll_id: i64) -> Result<u64, StoreError>;

    /// Active polls whose end time is at or before `now`.
    async fn due_active_polls(&self, now: DateTime<Utc>) -> Result<Vec<i64>, StoreError>;

    /// Ended polls past their end time that have votes but no winner flag yet.
    async fn ended_polls_without_winner(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError>;
}
