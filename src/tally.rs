//! Live tallies.
//!
//! Counts are always derived from the vote ledger. After each accepted vote
//! the fresh tally is published on the poll's channel (`poll.{id}`). Delivery
//! is at-most-once: a slow subscriber drops messages and resynchronizes by
//! reading the tally again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::Tally;

pub const VOTE_CAST_EVENT: &str = "vote.cast";
const CHANNEL_CAPACITY: usize = 64;

pub fn channel_name(poll_id: i64) -> String {
    format!("poll.{poll_id}")
}

/// Payload published after an accepted vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TallyUpdate {
    pub poll_id: i64,
    pub option_id: i64,
    pub total_votes: i64,
    pub option_votes: BTreeMap<i64, i64>,
}

impl TallyUpdate {
    pub fn new(tally: Tally, option_id: i64) -> Self {
        Self {
            poll_id: tally.poll_id,
            option_id,
            total_votes: tally.total,
            option_votes: tally.per_option,
        }
    }
}

/// In-process publish/subscribe hub, one broadcast channel per poll.
#[derive(Debug, Default)]
pub struct PollChannels {
    channels: Mutex<HashMap<String, broadcast::Sender<TallyUpdate>>>,
}

impl PollChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, poll_id: i64) -> broadcast::Receiver<TallyUpdate> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(channel_name(poll_id))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Returns the number of subscribers the update reached. Channels with no
    /// subscribers left are dropped.
    pub fn publish(&self, update: TallyUpdate) -> usize {
        let name = channel_name(update.poll_id);
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(sender) = channels.get(&name) else {
            return 0;
        };
        match sender.send(update) {
            Ok(reached) => {
                debug!(channel = %name, reached, "Tally published");
                reached
            }
            Err(_) => {
                channels.remove(&name);
                0
            }
        }
    }
}
