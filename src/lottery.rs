//! Winner lottery.
//!
//! The winning option is the one with the most votes; ties go to the option
//! created first (lowest id). One voter of that option is drawn uniformly at
//! random and flagged as the poll's winner. A poll that already has a winner
//! keeps it: drawing again returns the recorded winner unchanged.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::error::AppError;
use crate::models::{Tally, Vote};
use crate::phone;
use crate::store::PollStore;

/// `(option_id, votes)` of the winning option, or `None` when nobody voted.
pub fn winning_option(tally: &Tally) -> Option<(i64, i64)> {
    tally
        .per_option
        .iter()
        .map(|(&option_id, &count)| (option_id, count))
        .filter(|&(_, count)| count > 0)
        // On equal counts the lower option id compares greater.
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
}

/// Uniform draw: every entry has probability `1 / voters.len()`.
pub fn draw<'a, R: Rng + ?Sized>(voters: &'a [Vote], rng: &mut R) -> Option<&'a Vote> {
    if voters.is_empty() {
        return None;
    }
    voters.get(rng.gen_range(0..voters.len()))
}

/// Result of a selection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Draw {
    /// This call chose and recorded the winner.
    Selected(Vote),
    /// A winner was already recorded; it is returned unchanged.
    Existing(Vote),
    NoVotes,
}

impl Draw {
    pub fn winner(&self) -> Option<&Vote> {
        match self {
            Draw::Selected(vote) | Draw::Existing(vote) => Some(vote),
            Draw::NoVotes => None,
        }
    }

    pub fn into_winner(self) -> Option<Vote> {
        match self {
            Draw::Selected(vote) | Draw::Existing(vote) => Some(vote),
            Draw::NoVotes => None,
        }
    }
}

pub struct Lottery {
    rng: Mutex<StdRng>,
}

impl Lottery {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic draws, for reproducible simulations and tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn pick(&self, voters: &[Vote]) -> Option<Vote> {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        draw(voters, &mut *rng).cloned()
    }

    /// Selects and persists the winner of `poll_id`, or returns the one already
    /// recorded.
    pub async fn select_winner(&self, store: &dyn PollStore, poll_id: i64) -> Result<Draw, AppError> {
        if let Some(existing) = store.winner(poll_id).await? {
            return Ok(Draw::Existing(existing));
        }

        let tally = store.tally(poll_id).await?;
        let Some((option_id, votes)) = winning_option(&tally) else {
            info!(poll_id, "No votes cast, no winner to select");
            return Ok(Draw::NoVotes);
        };

        let voters = store.option_votes(poll_id, option_id).await?;
        let Some(chosen) = self.pick(&voters) else {
            return Ok(Draw::NoVotes);
        };

        match store.mark_winner(poll_id, chosen.id).await? {
            Some(winner) => {
                info!(
                    poll_id,
                    option_id,
                    votes,
                    voters = voters.len(),
                    winner = %phone::mask(&winner.identity_phone),
                    "Poll winner selected"
                );
                Ok(Draw::Selected(winner))
            }
            // Lost a race against a concurrent selection; theirs stands.
            None => Ok(store
                .winner(poll_id)
                .await?
                .map_or(Draw::NoVotes, Draw::Existing)),
        }
    }
}
