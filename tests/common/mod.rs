#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use poll_backend::clock::{Clock, ManualClock};
use poll_backend::error::AppError;
use poll_backend::ledger::CastVote;
use poll_backend::lottery::Lottery;
use poll_backend::models::{PollDetails, Purpose, Vote};
use poll_backend::notify::{Notification, NotificationSink, NotifyError};
use poll_backend::poll::{OptionInput, PollInput};
use poll_backend::services::CreatePoll;
use poll_backend::store::MemoryStore;
use poll_backend::{EngineSettings, PollService};

/// Phones in the helpers are already in the stored international form.
pub const CREATOR: &str = "8801700000001";

/// Keeps every notification so tests can read codes and result notices.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, Notification)>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_code(&self, phone: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find_map(|(to, notification)| match notification {
                Notification::VerificationCode { code, .. } if to == phone => Some(code),
                _ => None,
            })
    }

    pub fn results(&self) -> Vec<(String, bool)> {
        self.sent()
            .into_iter()
            .filter_map(|(to, notification)| match notification {
                Notification::PollResult { won, .. } => Some((to, won)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, phone: &str, notification: &Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((phone.to_string(), notification.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub service: Arc<PollService>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<RecordingSink>,
}

pub fn harness() -> Harness {
    harness_with(EngineSettings::default())
}

pub fn harness_with(settings: EngineSettings) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let sink = Arc::new(RecordingSink::default());
    let service = PollService::new(store.clone(), sink.clone(), clock.clone(), settings)
        .with_lottery(Lottery::seeded(2026));
    Harness {
        service: Arc::new(service),
        store,
        clock,
        sink,
    }
}

pub fn voter(n: usize) -> String {
    format!("880181{n:07}")
}

pub fn input(question: &str, options: &[&str], end_time: DateTime<Utc>) -> PollInput {
    PollInput {
        question: question.into(),
        end_time,
        options: options
            .iter()
            .map(|text| OptionInput {
                text: text.to_string(),
                color: None,
            })
            .collect(),
    }
}

impl Harness {
    pub async fn code(&self, phone: &str, purpose: Purpose, poll_id: Option<i64>) -> String {
        self.service
            .issue_challenge(phone, purpose, poll_id)
            .await
            .unwrap()
            .code
    }

    /// Creates a pending poll ending one hour after the manual clock's start.
    pub async fn pending_poll(&self, options: &[&str]) -> PollDetails {
        let code = self.code(CREATOR, Purpose::CreatePoll, None).await;
        let poll = input(
            "Who should win the seat?",
            options,
            self.clock.now() + Duration::hours(1),
        );
        self.service
            .create_poll(CreatePoll {
                phone_number: CREATOR.into(),
                code,
                creator_name: Some("Returning Officer".into()),
                poll,
            })
            .await
            .unwrap()
    }

    pub async fn active_poll(&self, options: &[&str]) -> PollDetails {
        let details = self.pending_poll(options).await;
        self.service.approve_poll(details.poll.id).await.unwrap();
        details
    }

    pub async fn vote(&self, poll_id: i64, option_id: i64, phone: &str) -> Result<Vote, AppError> {
        let code = self.code(phone, Purpose::CastVote, Some(poll_id)).await;
        self.service
            .cast_vote(CastVote {
                poll_id,
                option_id,
                phone_number: phone.into(),
                code,
            })
            .await
    }

    /// Moves the clock past the poll's end time.
    pub fn close(&self) {
        self.clock.advance(Duration::hours(2));
    }

    /// Lets spawned notification tasks run to completion.
    pub async fn settle_background(&self) {
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
    }
}
