use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio::time::{timeout_at, Instant};

/// Budget attached at pipeline entry and shared by every network call of one event.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

#[derive(Debug, Clone, Copy, Error)]
#[error("pipeline deadline exceeded")]
pub struct DeadlineExceeded;

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Drives `call` until it finishes or the deadline passes.
    pub async fn run<F, T, X, E>(&self, call: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, X>>,
        E: From<X> + From<DeadlineExceeded>,
    {
        match timeout_at(self.at, call).await {
            Ok(result) => result.map_err(E::from),
            Err(_) => Err(DeadlineExceeded.into()),
        }
    }
}
