// models.rs
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Pending,
    Active,
    Ended,
    Rejected,
}

impl PollStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PollStatus::Pending => "pending",
            PollStatus::Active => "active",
            PollStatus::Ended => "ended",
            PollStatus::Rejected => "rejected",
        }
    }

    /// Edges of the lifecycle graph. `Ended` and `Rejected` have no outgoing edges.
    pub fn can_transition_to(self, next: PollStatus) -> bool {
        matches!(
            (self, next),
            (PollStatus::Pending, PollStatus::Active)
                | (PollStatus::Pending, PollStatus::Rejected)
                | (PollStatus::Active, PollStatus::Ended)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PollStatus::Ended | PollStatus::Rejected)
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PollStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PollStatus::Pending),
            "active" => Ok(PollStatus::Active),
            "ended" => Ok(PollStatus::Ended),
            "rejected" => Ok(PollStatus::Rejected),
            other => Err(UnknownVariant {
                kind: "poll status",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for PollStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// What a verification code authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    CreatePoll,
    CastVote,
    AdminLogin,
}

impl Purpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::CreatePoll => "create_poll",
            Purpose::CastVote => "cast_vote",
            Purpose::AdminLogin => "admin_login",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_poll" => Ok(Purpose::CreatePoll),
            "cast_vote" => Ok(Purpose::CastVote),
            "admin_login" => Ok(Purpose::AdminLogin),
            other => Err(UnknownVariant {
                kind: "verification purpose",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for Purpose {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Identity {
    pub id: i64,
    pub phone: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Poll {
    pub id: i64,
    pub public_id: String,
    pub question: String,
    pub creator_phone: String,
    pub end_time: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: PollStatus,
    pub created_at: DateTime<Utc>,
}

impl Poll {
    /// Accepting votes: active and the end time is still ahead.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status == PollStatus::Active && self.end_time.is_some_and(|end| end > now)
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.end_time.is_some_and(|end| end <= now)
    }

    /// Status as observed at `now`: an active poll past its end time reads as ended
    /// even before the sweep has written the transition.
    pub fn effective_status(&self, now: DateTime<Utc>) -> PollStatus {
        match self.status {
            PollStatus::Active if self.is_due_at(now) => PollStatus::Ended,
            status => status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PollOption {
    pub id: i64,
    pub poll_id: i64,
    pub text: String,
    pub color: String,
}

/// A poll together with its options, ordered by creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollDetails {
    #[serde(flatten)]
    pub poll: Poll,
    pub options: Vec<PollOption>,
}

impl PollDetails {
    pub fn option(&self, option_id: i64) -> Option<&PollOption> {
        self.options.iter().find(|option| option.id == option_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vote {
    pub id: i64,
    pub poll_id: i64,
    pub option_id: i64,
    pub identity_phone: String,
    pub cast_at: DateTime<Utc>,
    pub is_winner: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct VerificationChallenge {
    pub id: i64,
    pub identity_phone: String,
    #[serde(skip_serializing)]
    pub code: String,
    #[sqlx(try_from = "String")]
    pub purpose: Purpose,
    pub target_poll_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

#[derive(Debug, Clone)]
pub struct NewChallenge {
    pub identity_phone: String,
    pub code: String,
    pub purpose: Purpose,
    pub target_poll_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// The exact tuple a presented code must match.
#[derive(Debug, Clone, Copy)]
pub struct ChallengeAttempt<'a> {
    pub identity_phone: &'a str,
    pub code: &'a str,
    pub purpose: Purpose,
    pub target_poll_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewOption {
    pub text: String,
    pub color: String,
}

#[derive(Debug, Clone)]
pub struct NewPoll {
    pub public_id: String,
    pub question: String,
    pub creator_phone: String,
    pub end_time: Option<DateTime<Utc>>,
    pub status: PollStatus,
    pub created_at: DateTime<Utc>,
    pub options: Vec<NewOption>,
}

#[derive(Debug, Clone)]
pub struct NewVote {
    pub poll_id: i64,
    pub option_id: i64,
    pub identity_phone: String,
    pub cast_at: DateTime<Utc>,
}

/// Administrative edit of a poll that has not ended.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollEdit {
    pub question: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub options: Vec<OptionEdit>,
}

/// `id: None` appends a new option.
#[derive(Debug, Clone, Deserialize)]
pub struct OptionEdit {
    pub id: Option<i64>,
    pub text: String,
    pub color: Option<String>,
}

/// Vote counts derived from the ledger. Every option of the poll has an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub poll_id: i64,
    pub total: i64,
    pub per_option: BTreeMap<i64, i64>,
}

impl Tally {
    pub fn from_counts(poll_id: i64, counts: impl IntoIterator<Item = (i64, i64)>) -> Self {
        let per_option: BTreeMap<i64, i64> = counts.into_iter().collect();
        let total = per_option.values().sum();
        Self {
            poll_id,
            total,
            per_option,
        }
    }

    pub fn count(&self, option_id: i64) -> i64 {
        self.per_option.get(&option_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn poll(status: PollStatus, end_time: Option<DateTime<Utc>>) -> Poll {
        Poll {
            id: 1,
            public_id: "abc".into(),
            question: "Q?".into(),
            creator_phone: "01711111111".into(),
            end_time,
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn lifecycle_edges() {
        use PollStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Active.can_transition_to(Ended));
        for next in [Pending, Active, Ended, Rejected] {
            assert!(!Ended.can_transition_to(next));
            assert!(!Rejected.can_transition_to(next));
        }
        assert!(!Active.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Ended));
    }

    #[test]
    fn active_poll_past_end_time_reads_as_ended() {
        let now = Utc::now();
        let due = poll(PollStatus::Active, Some(now - Duration::seconds(1)));
        assert!(!due.is_open_at(now));
        assert_eq!(due.effective_status(now), PollStatus::Ended);

        let open = poll(PollStatus::Active, Some(now + Duration::minutes(5)));
        assert!(open.is_open_at(now));
        assert_eq!(open.effective_status(now), PollStatus::Active);

        let pending = poll(PollStatus::Pending, None);
        assert!(!pending.is_open_at(now));
        assert_eq!(pending.effective_status(now), PollStatus::Pending);
    }

    #[test]
    fn status_and_purpose_parse_their_wire_names() {
        for status in [
            PollStatus::Pending,
            PollStatus::Active,
            PollStatus::Ended,
            PollStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<PollStatus>().unwrap(), status);
        }
        assert_eq!("cast_vote".parse::<Purpose>().unwrap(), Purpose::CastVote);
        assert!("poll_vote".parse::<Purpose>().is_err());
    }

    #[test]
    fn tally_total_is_sum_of_options() {
        let tally = Tally::from_counts(9, [(1, 7), (2, 3), (3, 0)]);
        assert_eq!(tally.total, 10);
        assert_eq!(tally.count(2), 3);
        assert_eq!(tally.count(42), 0);
    }
}
