use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::{EditOutcome, PollStore, Transition, VoteInsert};
use crate::error::StoreError;
use crate::models::{
    ChallengeAttempt, Identity, NewChallenge, NewPoll, NewVote, Poll, PollDetails, PollEdit,
    PollOption, PollStatus, Tally, VerificationChallenge, Vote,
};
use crate::poll::{default_color, MAX_OPTIONS, MIN_OPTIONS};

const POLL_COLUMNS: &str = "id, public_id, question, creator_phone, end_time, status, created_at";
const VOTE_COLUMNS: &str = "id, poll_id, option_id, identity_phone, cast_at, is_winner";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn options_of<'e, E>(executor: E, poll_id: i64) -> Result<Vec<PollOption>, StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let options = sqlx::query_as::<_, PollOption>(
            "SELECT id, poll_id, text, color FROM poll_options WHERE poll_id = $1 ORDER BY id",
        )
        .bind(poll_id)
        .fetch_all(executor)
        .await?;
        Ok(options)
    }

    async fn with_options(&self, poll: Option<Poll>) -> Result<Option<PollDetails>, StoreError> {
        match poll {
            Some(poll) => {
                let options = Self::options_of(&self.pool, poll.id).await?;
                Ok(Some(PollDetails { poll, options }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PollStore for PgStore {
    async fn find_or_create_identity(
        &self,
        phone: &str,
        name: &str,
    ) -> Result<Identity, StoreError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let identity = sqlx::query_as::<_, Identity>(
            r#"
            INSERT INTO identities (phone, name)
            VALUES ($1, $2)
            ON CONFLICT (phone) DO UPDATE SET phone = EXCLUDED.phone
            RETURNING id, phone, name
            "#,
        )
        .bind(phone)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(identity)
    }

    async fn insert_challenge(
        &self,
        challenge: NewChallenge,
    ) -> Result<VerificationChallenge, StoreError> {
        let row = sqlx::query_as::<_, VerificationChallenge>(
            r#"
            INSERT INTO verification_challenges
                (identity_phone, code, purpose, target_poll_id, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, identity_phone, code, purpose, target_poll_id, created_at, expires_at, consumed
            "#,
        )
        .bind(&challenge.identity_phone)
        .bind(&challenge.code)
        .bind(challenge.purpose.as_str())
        .bind(challenge.target_poll_id)
        .bind(challenge.created_at)
        .bind(challenge.expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn consume_challenge(
        &self,
        attempt: ChallengeAttempt<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // SKIP LOCKED makes a concurrent verifier of the same row see no match
        // instead of waiting and re-checking.
        let consumed = sqlx::query(
            r#"
            UPDATE verification_challenges
            SET consumed = TRUE
            WHERE NOT consumed
              AND id = (
                SELECT id FROM verification_challenges
                WHERE identity_phone = $1
                  AND code = $2
                  AND purpose = $3
                  AND target_poll_id IS NOT DISTINCT FROM $4
                  AND NOT consumed
                  AND expires_at > $5
                ORDER BY id DESC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
              )
            RETURNING id
            "#,
        )
        .bind(attempt.identity_phone)
        .bind(attempt.code)
        .bind(attempt.purpose.as_str())
        .bind(attempt.target_poll_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(consumed.is_some())
    }

    async fn purge_challenges(&self, expired_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM verification_challenges WHERE expires_at < $1")
            .bind(expired_before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn create_poll(&self, new: NewPoll) -> Result<PollDetails, StoreError> {
        let mut tx = self.pool.begin().await?;

        let poll = sqlx::query_as::<_, Poll>(&format!(
            r#"
            INSERT INTO polls (public_id, question, creator_phone, end_time, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {POLL_COLUMNS}
            "#
        ))
        .bind(&new.public_id)
        .bind(&new.question)
        .bind(&new.creator_phone)
        .bind(new.end_time)
        .bind(new.status.as_str())
        .bind(new.created_at)
        .fetch_one(&mut *tx)
        .await?;

        let mut options = Vec::with_capacity(new.options.len());
        for option in &new.options {
            let row = sqlx::query_as::<_, PollOption>(
                r#"
                INSERT INTO poll_options (poll_id, text, color)
                VALUES ($1, $2, $3)
                RETURNING id, poll_id, text, color
                "#,
            )
            .bind(poll.id)
            .bind(&option.text)
            .bind(&option.color)
            .fetch_one(&mut *tx)
            .await?;
            options.push(row);
        }

        tx.commit().await?;
        Ok(PollDetails { poll, options })
    }

    async fn poll(&self, poll_id: i64) -> Result<Option<PollDetails>, StoreError> {
        let poll = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1"
        ))
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?;
        self.with_options(poll).await
    }

    async fn poll_by_public_id(&self, public_id: &str) -> Result<Option<PollDetails>, StoreError> {
        let poll = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE public_id = $1"
        ))
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await?;
        self.with_options(poll).await
    }

    async fn latest_poll(
        &self,
        open: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<PollDetails>, StoreError> {
        let comparison = if open { ">" } else { "<=" };
        let poll = sqlx::query_as::<_, Poll>(&format!(
            r#"
            SELECT {POLL_COLUMNS} FROM polls
            WHERE status IN ('active', 'ended') AND end_time {comparison} $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        self.with_options(poll).await
    }

    async fn edit_poll(&self, poll_id: i64, edit: PollEdit) -> Result<EditOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(poll) = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1 FOR UPDATE"
        ))
        .bind(poll_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(EditOutcome::Missing);
        };
        if poll.status.is_terminal() {
            return Ok(EditOutcome::Locked(poll.status));
        }

        let current = Self::options_of(&mut *tx, poll_id).await?;
        if let Some(unknown) = edit
            .options
            .iter()
            .filter_map(|option| option.id)
            .find(|id| !current.iter().any(|option| option.id == *id))
        {
            return Ok(EditOutcome::UnknownOption(unknown));
        }
        let resulting = current.len() + edit.options.iter().filter(|o| o.id.is_none()).count();
        if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&resulting) {
            return Ok(EditOutcome::OptionCount(resulting));
        }

        sqlx::query(
            r#"
            UPDATE polls
            SET question = COALESCE($2, question),
                end_time = COALESCE($3, end_time)
            WHERE id = $1
            "#,
        )
        .bind(poll_id)
        .bind(&edit.question)
        .bind(edit.end_time)
        .execute(&mut *tx)
        .await?;

        let mut position = current.len();
        for option in &edit.options {
            match option.id {
                Some(id) => {
                    sqlx::query(
                        r#"
                        UPDATE poll_options
                        SET text = $3, color = COALESCE($4, color)
                        WHERE id = $1 AND poll_id = $2
                        "#,
                    )
                    .bind(id)
                    .bind(poll_id)
                    .bind(&option.text)
                    .bind(&option.color)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    let color = option
                        .color
                        .clone()
                        .unwrap_or_else(|| default_color(position).to_string());
                    position += 1;
                    sqlx::query("INSERT INTO poll_options (poll_id, text, color) VALUES ($1, $2, $3)")
                        .bind(poll_id)
                        .bind(&option.text)
                        .bind(color)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        let poll = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1"
        ))
        .bind(poll_id)
        .fetch_one(&mut *tx)
        .await?;
        let options = Self::options_of(&mut *tx, poll_id).await?;

        tx.commit().await?;
        Ok(EditOutcome::Edited(PollDetails { poll, options }))
    }

    async fn transition(
        &self,
        poll_id: i64,
        from: PollStatus,
        to: PollStatus,
    ) -> Result<Transition, StoreError> {
        let applied = sqlx::query_as::<_, Poll>(&format!(
            r#"
            UPDATE polls SET status = $3
            WHERE id = $1 AND status = $2
            RETURNING {POLL_COLUMNS}
            "#
        ))
        .bind(poll_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(poll) = applied {
            return Ok(Transition::Applied(poll));
        }

        let current = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1"
        ))
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(current.map_or(Transition::Missing, Transition::Refused))
    }

    async fn insert_vote(&self, vote: NewVote) -> Result<VoteInsert, StoreError> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        // FOR SHARE blocks the ending transition until this vote commits or
        // rolls back, and is itself blocked while a transition is in flight.
        let Some(poll) = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1 FOR SHARE"
        ))
        .bind(vote.poll_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(VoteInsert::PollMissing);
        };
        if !poll.is_open_at(vote.cast_at) {
            return Ok(VoteInsert::PollNotActive);
        }

        let owned = sqlx::query("SELECT 1 FROM poll_options WHERE id = $1 AND poll_id = $2")
            .bind(vote.option_id)
            .bind(vote.poll_id)
            .fetch_optional(&mut *tx)
            .await?;
        if owned.is_none() {
            return Ok(VoteInsert::InvalidOption);
        }

        let inserted = sqlx::query_as::<_, Vote>(&format!(
            r#"
            INSERT INTO votes (poll_id, option_id, identity_phone, cast_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT ON CONSTRAINT votes_one_per_identity DO NOTHING
            RETURNING {VOTE_COLUMNS}
            "#
        ))
        .bind(vote.poll_id)
        .bind(vote.option_id)
        .bind(&vote.identity_phone)
        .bind(vote.cast_at)
        .fetch_optional(&mut *tx)
        .await?;

        match inserted {
            Some(row) => {
                tx.commit().await?;
                Ok(VoteInsert::Inserted(row))
            }
            None => Ok(VoteInsert::Duplicate),
        }
    }

    async fn tally(&self, poll_id: i64) -> Result<Tally, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT o.id AS option_id, COUNT(v.id) AS vote_count
            FROM poll_options o
            LEFT JOIN votes v ON v.option_id = o.id
            WHERE o.poll_id = $1
            GROUP BY o.id
            ORDER BY o.id
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        let counts = rows
            .into_iter()
            .map(|row| -> Result<(i64, i64), StoreError> {
                Ok((row.try_get("option_id")?, row.try_get("vote_count")?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Tally::from_counts(poll_id, counts))
    }

    async fn votes(&self, poll_id: i64) -> Result<Vec<Vote>, StoreError> {
        let votes = sqlx::query_as::<_, Vote>(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE poll_id = $1 ORDER BY cast_at, id"
        ))
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(votes)
    }

    async fn option_votes(&self, poll_id: i64, option_id: i64) -> Result<Vec<Vote>, StoreError> {
        let votes = sqlx::query_as::<_, Vote>(&format!(
            r#"
            SELECT {VOTE_COLUMNS} FROM votes
            WHERE poll_id = $1 AND option_id = $2
            ORDER BY cast_at, id
            "#
        ))
        .bind(poll_id)
        .bind(option_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(votes)
    }

    async fn winner(&self, poll_id: i64) -> Result<Option<Vote>, StoreError> {
        let vote = sqlx::query_as::<_, Vote>(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE poll_id = $1 AND is_winner"
        ))
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(vote)
    }

    async fn mark_winner(&self, poll_id: i64, vote_id: i64) -> Result<Option<Vote>, StoreError> {
        let marked = sqlx::query_as::<_, Vote>(&format!(
            r#"
            UPDATE votes SET is_winner = TRUE
            WHERE id = $2 AND poll_id = $1 AND NOT is_winner
              AND NOT EXISTS (SELECT 1 FROM votes WHERE poll_id = $1 AND is_winner)
            RETURNING {VOTE_COLUMNS}
            "#
        ))
        .bind(poll_id)
        .bind(vote_id)
        .fetch_optional(&self.pool)
        .await;

        match marked {
            Ok(vote) => Ok(vote),
            // A concurrent selection won the race on the one-winner index.
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_winner(&self, poll_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE votes SET is_winner = FALSE WHERE poll_id = $1 AND is_winner")
            .bind(poll_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn due_active_polls(&self, now: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM polls WHERE status = 'active' AND end_time <= $1 ORDER BY id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn ended_polls_without_winner(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT p.id FROM polls p
            WHERE p.status = 'ended'
              AND p.end_time <= $1
              AND EXISTS (SELECT 1 FROM votes v WHERE v.poll_id = p.id)
              AND NOT EXISTS (SELECT 1 FROM votes v WHERE v.poll_id = p.id AND v.is_winner)
            ORDER BY p.id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
