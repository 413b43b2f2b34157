//! Poll lifecycle: approval, rejection, ending and winner selection.
//!
//! `pending -> active`, `pending -> rejected` and `active -> ended` are the
//! only transitions. The admin "end now" action and the periodic sweep share
//! one ending procedure, so a poll is settled the same way whichever path
//! reaches it first.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::lottery::Draw;
use crate::models::{Poll, PollStatus, Vote};
use crate::notify::Notification;
use crate::phone;
use crate::services::PollService;
use crate::store::Transition;

/// Voters of the winning option notified besides the winner.
const RESULT_NOTICE_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct EndedPoll {
    pub poll: Poll,
    pub winner: Option<Vote>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub ended: usize,
    pub winners_backfilled: usize,
    pub failed: usize,
    pub challenges_purged: u64,
}

impl PollService {
    /// Conditional status change. `already_there` accepts a poll that is in `to`
    /// already instead of refusing it.
    async fn move_poll(
        &self,
        poll_id: i64,
        from: PollStatus,
        to: PollStatus,
        already_there: bool,
    ) -> Result<Poll, AppError> {
        match self.store.transition(poll_id, from, to).await? {
            Transition::Applied(poll) => {
                info!(poll_id, %from, %to, "Poll status changed");
                Ok(poll)
            }
            Transition::Refused(poll) if already_there && poll.status == to => Ok(poll),
            Transition::Refused(poll) => Err(AppError::InvalidTransition {
                from: poll.status,
                to,
            }),
            Transition::Missing => Err(AppError::PollNotFound),
        }
    }

    pub async fn approve_poll(&self, poll_id: i64) -> Result<Poll, AppError> {
        let details = self.load_poll(poll_id).await?;
        if details.poll.status == PollStatus::Pending && details.poll.end_time.is_none() {
            return Err(AppError::Validation("a poll needs an end time before it can be approved".into()));
        }
        self.move_poll(poll_id, PollStatus::Pending, PollStatus::Active, false)
            .await
    }

    pub async fn reject_poll(&self, poll_id: i64) -> Result<Poll, AppError> {
        self.move_poll(poll_id, PollStatus::Pending, PollStatus::Rejected, false)
            .await
    }

    /// Ending procedure shared by the admin action and the sweep. Ends an
    /// active poll and, once its end time has passed, draws the winner.
    /// Calling it again on an ended poll changes nothing.
    pub async fn end_poll(&self, poll_id: i64) -> Result<EndedPoll, AppError> {
        let poll = self
            .move_poll(poll_id, PollStatus::Active, PollStatus::Ended, true)
            .await?;

        let winner = if poll.is_due_at(self.now()) {
            self.settle(&poll).await?
        } else {
            // Ended ahead of its end time; a later sweep draws the winner.
            self.store.winner(poll_id).await?
        };

        Ok(EndedPoll { poll, winner })
    }

    /// Draws the winner of a poll past its end time, or returns the recorded one.
    /// A poll still marked active is ended first.
    pub async fn select_winner(&self, poll_id: i64) -> Result<Option<Vote>, AppError> {
        let details = self.load_poll(poll_id).await?;
        if !details.poll.is_due_at(self.now()) {
            return Err(AppError::PollStillOpen);
        }
        if details.poll.status == PollStatus::Active {
            return Ok(self.end_poll(poll_id).await?.winner);
        }
        self.settle(&details.poll).await
    }

    /// Administrative re-run: clears the recorded winner and draws again.
    pub async fn reselect_winner(&self, poll_id: i64) -> Result<Option<Vote>, AppError> {
        let details = self.load_poll(poll_id).await?;
        if !details.poll.is_due_at(self.now()) {
            return Err(AppError::PollStillOpen);
        }
        let poll = match details.poll.status {
            // The draw must not start before late votes are fenced off.
            PollStatus::Active => {
                self.move_poll(poll_id, PollStatus::Active, PollStatus::Ended, true)
                    .await?
            }
            _ => details.poll,
        };
        let cleared = self.store.clear_winner(poll_id).await?;
        info!(poll_id, cleared, "Winner cleared for re-selection");
        self.settle(&poll).await
    }

    async fn settle(&self, poll: &Poll) -> Result<Option<Vote>, AppError> {
        let draw = self.lottery.select_winner(self.store.as_ref(), poll.id).await?;
        if let Draw::Selected(winner) = &draw {
            self.announce_winner(poll, winner);
        }
        Ok(draw.into_winner())
    }

    /// Notifies the winner and a bounded number of the other voters of the
    /// winning option. Runs in the background after the winner is persisted.
    fn announce_winner(&self, poll: &Poll, winner: &Vote) {
        let store = self.store.clone();
        let notifier = self.notifier.clone();
        let question = poll.question.clone();
        let winner = winner.clone();

        tokio::spawn(async move {
            let won = Notification::PollResult {
                question: question.clone(),
                won: true,
            };
            if let Err(e) = notifier.send(&winner.identity_phone, &won).await {
                warn!(poll_id = winner.poll_id, phone = %phone::mask(&winner.identity_phone), error = %e, "Winner notification failed");
            }

            let voters = match store.option_votes(winner.poll_id, winner.option_id).await {
                Ok(voters) => voters,
                Err(e) => {
                    error!(poll_id = winner.poll_id, error = %e, "Could not load voters for result notices");
                    return;
                }
            };
            let thanks = Notification::PollResult { question, won: false };
            for vote in voters
                .iter()
                .filter(|vote| vote.id != winner.id)
                .take(RESULT_NOTICE_LIMIT)
            {
                if let Err(e) = notifier.send(&vote.identity_phone, &thanks).await {
                    warn!(poll_id = vote.poll_id, phone = %phone::mask(&vote.identity_phone), error = %e, "Result notification failed");
                }
            }
        });
    }

    /// Ends every active poll past its end time, draws winners for ended polls
    /// that still lack one and drops stale verification codes. One failing poll
    /// does not stop the others.
    pub async fn sweep_expired_polls(&self) -> Result<SweepReport, AppError> {
        let now = self.now();
        let mut report = SweepReport::default();

        for poll_id in self.store.due_active_polls(now).await? {
            match self.end_poll(poll_id).await {
                Ok(_) => report.ended += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(poll_id, error = %e, "Failed to end poll");
                }
            }
        }

        for poll_id in self.store.ended_polls_without_winner(now).await? {
            match self.select_winner(poll_id).await {
                Ok(Some(_)) => report.winners_backfilled += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    error!(poll_id, error = %e, "Failed to select winner");
                }
            }
        }

        match self.gate.purge_stale().await {
            Ok(purged) => report.challenges_purged = purged,
            Err(e) => error!(error = %e, "Failed to purge stale verification codes"),
        }

        if report != SweepReport::default() {
            info!(
                ended = report.ended,
                winners_backfilled = report.winners_backfilled,
                failed = report.failed,
                challenges_purged = report.challenges_purged,
                "Sweep finished"
            );
        }
        Ok(report)
    }
}

/// Runs the sweep every `interval` until the runtime shuts down.
pub fn spawn_sweeper(service: Arc<PollService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = service.sweep_expired_polls().await {
                error!(error = %e, "Sweep failed");
            }
        }
    })
}
