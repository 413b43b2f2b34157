//! Poll voting and winner lottery for the election portal.
//!
//! Verified phone numbers create polls and cast one vote per poll; tallies are
//! derived from the vote ledger and pushed to live observers; once a poll ends
//! one voter of the winning option is drawn uniformly at random.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod lifecycle;
pub mod lottery;
pub mod models;
pub mod notify;
pub mod phone;
pub mod poll;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod tally;
pub mod verification;

pub use error::{AppError, StoreError};
pub use services::{EngineSettings, PollService};
pub use state::AppState;
