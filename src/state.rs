use std::sync::Arc;

use crate::services::PollService;

/// Shared by every handler. Cloning only bumps reference counts.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PollService>,
    /// `None` locks every admin route.
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(service: Arc<PollService>, admin_token: Option<String>) -> Self {
        Self {
            service,
            admin_token: admin_token.map(Arc::from),
        }
    }

    /// Compares without short-circuiting on the first differing byte.
    pub fn admits(&self, presented: &str) -> bool {
        let Some(expected) = self.admin_token.as_deref() else {
            return false;
        };
        let (expected, presented) = (expected.as_bytes(), presented.as_bytes());
        expected.len() == presented.len()
            && expected
                .iter()
                .zip(presented)
                .fold(0u8, |diff, (a, b)| diff | (a ^ b))
                == 0
    }
}
