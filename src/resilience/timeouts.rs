//! Deadline propagation.
//!
//! # Responsibilities
//! - Carry the caller's overall request deadline into every store call
//! - Derive strictly smaller sub-deadlines for store round trips
//! - Cancel store futures cleanly when the deadline passes
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - A child deadline never outlives its parent
//! - Timeout errors are distinct from other store errors

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Point in time by which an operation must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

/// Returned when a future did not finish before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExceeded {
    pub budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Time left; zero once the deadline has passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Sub-deadline of at most `budget`, clipped to this deadline.
    pub fn child(&self, budget: Duration) -> Self {
        let candidate = Instant::now() + budget;
        Self {
            at: candidate.min(self.at),
        }
    }

    /// Run `fut` until it completes or the deadline passes.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, DeadlineExceeded>
    where
        F: Future<Output = T>,
    {
        let budget = self.remaining();
        tokio::time::timeout_at(self.at, fut)
            .await
            .map_err(|_| DeadlineExceeded { budget })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_never_outlives_parent() {
        let parent = Deadline::after(Duration::from_millis(20));
        let child = parent.child(Duration::from_secs(5));
        assert_eq!(child.instant(), parent.instant());

        let tight = parent.child(Duration::from_millis(5));
        assert!(tight.instant() < parent.instant());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let result = deadline
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await;
        assert!(result.is_err());
        assert!(deadline.is_expired());
    }

    #[tokio::test]
    async fn test_run_completes_in_time() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let value = deadline.run(async { 7 }).await;
        assert_eq!(value, Ok(7));
    }
}
