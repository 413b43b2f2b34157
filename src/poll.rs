// src/poll.rs
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{NewOption, NewPoll, PollStatus};

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 5;
pub const MAX_TEXT_LEN: usize = 255;
const PUBLIC_ID_LEN: usize = 16;

const PALETTE: [&str; 5] = ["#C8102E", "#00A651", "#F42A41", "#06A77D", "#666666"];

/// Colour for the option at `index` when the creator did not pick one.
pub fn default_color(index: usize) -> &'static str {
    PALETTE[index % PALETTE.len()]
}

/// Opaque identifier exposed in public URLs instead of the sequential id.
pub fn new_public_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(PUBLIC_ID_LEN);
    id
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionInput {
    pub text: String,
    pub color: Option<String>,
}

/// Poll definition as submitted by a verified identity.
#[derive(Debug, Clone, Deserialize)]
pub struct PollInput {
    pub question: String,
    pub end_time: DateTime<Utc>,
    pub options: Vec<OptionInput>,
}

impl PollInput {
    /// Checks the definition and turns it into a row set ready for insertion.
    pub fn into_new_poll(
        self,
        creator_phone: String,
        status: PollStatus,
        now: DateTime<Utc>,
    ) -> Result<NewPoll, AppError> {
        let question = checked_text("question", &self.question)?;

        if self.end_time <= now {
            return Err(AppError::Validation("end time must be in the future".into()));
        }
        if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&self.options.len()) {
            return Err(AppError::Validation(format!(
                "a poll needs between {MIN_OPTIONS} and {MAX_OPTIONS} options"
            )));
        }

        let options = self
            .options
            .into_iter()
            .enumerate()
            .map(|(index, option)| {
                Ok(NewOption {
                    text: checked_text("option text", &option.text)?,
                    color: option
                        .color
                        .map(|color| color.trim().to_string())
                        .filter(|color| !color.is_empty())
                        .unwrap_or_else(|| default_color(index).to_string()),
                })
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        Ok(NewPoll {
            public_id: new_public_id(),
            question,
            creator_phone,
            end_time: Some(self.end_time),
            status,
            created_at: now,
            options,
        })
    }
}

pub fn checked_text(field: &str, raw: &str) -> Result<String, AppError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(AppError::Validation(format!("{field} is required")));
    }
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(AppError::Validation(format!(
            "{field} must be at most {MAX_TEXT_LEN} characters"
        )));
    }
    Ok(text.to_string())
}
