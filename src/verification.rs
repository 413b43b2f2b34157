//! One-time verification codes.
//!
//! A challenge is bound to a phone, a purpose and (for votes) one poll. It is
//! consumed by the first successful verification and is useless after its
//! expiry. Every failed verification looks the same to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, Rng};
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::AppError;
use crate::models::{ChallengeAttempt, NewChallenge, Purpose};
use crate::notify::{Notification, NotificationSink};
use crate::phone;
use crate::store::PollStore;

pub const CODE_LENGTH: usize = 6;

pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    rng.gen_range(100_000..=999_999u32).to_string()
}

/// Outcome of issuing a code. Storage and delivery are reported separately:
/// a stored code stays valid even when the notifier failed.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedChallenge {
    #[serde(skip_serializing)]
    pub code: String,
    pub delivered: bool,
    #[serde(skip_serializing)]
    pub expires_at: DateTime<Utc>,
}

pub struct VerificationGate {
    store: Arc<dyn PollStore>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl VerificationGate {
    pub fn new(
        store: Arc<dyn PollStore>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(10)),
        }
    }

    /// Persists a fresh challenge and hands the code to the notifier.
    pub async fn issue(
        &self,
        phone_number: &str,
        purpose: Purpose,
        target_poll_id: Option<i64>,
    ) -> Result<IssuedChallenge, AppError> {
        let phone_number = phone::normalize(phone_number)?;
        match (purpose, target_poll_id) {
            (Purpose::CastVote, None) => {
                return Err(AppError::Validation("poll_id is required for cast_vote".into()))
            }
            (Purpose::CreatePoll | Purpose::AdminLogin, Some(_)) => {
                return Err(AppError::Validation(format!(
                    "poll_id does not apply to {purpose}"
                )))
            }
            _ => {}
        }

        let code = generate_code(&mut OsRng);
        let now = self.clock.now();
        let challenge = self
            .store
            .insert_challenge(NewChallenge {
                identity_phone: phone_number.clone(),
                code: code.clone(),
                purpose,
                target_poll_id,
                created_at: now,
                expires_at: now + self.ttl,
            })
            .await?;

        let notification = Notification::VerificationCode {
            code: code.clone(),
            purpose,
        };
        let delivered = match self.notifier.send(&phone_number, &notification).await {
            Ok(()) => true,
            Err(e) => {
                warn!(phone = %phone::mask(&phone_number), %purpose, error = %e, "Verification code delivery failed");
                false
            }
        };

        info!(
            phone = %phone::mask(&phone_number),
            %purpose,
            poll_id = ?target_poll_id,
            delivered,
            "Verification code issued"
        );

        Ok(IssuedChallenge {
            code,
            delivered,
            expires_at: challenge.expires_at,
        })
    }

    /// Drops challenges that expired more than one lifetime ago.
    pub async fn purge_stale(&self) -> Result<u64, AppError> {
        let cutoff = self.clock.now() - self.ttl;
        Ok(self.store.purge_challenges(cutoff).await?)
    }

    /// Consumes a matching challenge. Any mismatch, reuse or expiry yields
    /// `InvalidVerification` without touching storage state.
    pub async fn verify(
        &self,
        phone_number: &str,
        code: &str,
        purpose: Purpose,
        target_poll_id: Option<i64>,
    ) -> Result<(), AppError> {
        let phone_number = phone::normalize(phone_number).map_err(|_| AppError::InvalidVerification)?;
        let code = code.trim();
        if code.len() != CODE_LENGTH || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::InvalidVerification);
        }
        if purpose == Purpose::CastVote && target_poll_id.is_none() {
            return Err(AppError::InvalidVerification);
        }

        let attempt = ChallengeAttempt {
            identity_phone: &phone_number,
            code,
            purpose,
            target_poll_id,
        };
        if self.store.consume_challenge(attempt, self.clock.now()).await? {
            Ok(())
        } else {
            warn!(phone = %phone::mask(&phone_number), %purpose, "Verification rejected");
            Err(AppError::InvalidVerification)
        }
    }
}
