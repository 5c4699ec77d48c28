//! Shared state for the HTTP API.

use crate::supervisor::{SupervisorHandle, SupervisorState};

use std::time::Instant;

/// State shared across all API handlers.
pub struct ApiState {
    pub started_at: Instant,
    /// One handle per configured bot identity, in config order.
    pub bots: Vec<SupervisorHandle>,
}

impl ApiState {
    pub fn new(bots: Vec<SupervisorHandle>) -> Self {
        Self {
            started_at: Instant::now(),
            bots,
        }
    }

    pub fn running_bots(&self) -> usize {
        self.bots
            .iter()
            .filter(|bot| bot.state() == SupervisorState::Connected)
            .count()
    }

    /// Live tickers across all identities.
    pub async fn active_tickers(&self) -> usize {
        let mut total = 0;
        for bot in &self.bots {
            total += bot.active_tickers().await;
        }
        total
    }
}
