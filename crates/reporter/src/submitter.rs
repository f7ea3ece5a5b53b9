//! Report submission with deadline-bounded retries

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use oracle_core::{ChainError, RoundId, RoundSettings};

use crate::builder::Report;
use crate::gateway::{ChainGateway, TxHash, TxStatus};

/// Submission configuration
#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub confirm_timeout: Duration,
    pub confirm_poll_interval: Duration,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(8),
            confirm_timeout: Duration::from_secs(30),
            confirm_poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&RoundSettings> for SubmitterConfig {
    fn from(s: &RoundSettings) -> Self {
        Self {
            retry_initial: Duration::from_millis(s.submit_retry_initial_ms),
            retry_max: Duration::from_millis(s.submit_retry_max_ms),
            confirm_timeout: Duration::from_millis(s.confirm_timeout_ms),
            confirm_poll_interval: Duration::from_millis(s.confirm_poll_interval_ms.max(1)),
        }
    }
}

/// How a round's submission sequence ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted { tx: TxHash, attempts: u32 },
    /// The contract refused the report; not retried
    Rejected(String),
    /// The node answered with something unreadable; not retried
    Failed(String),
    /// Retries ran into the next round's boundary
    Abandoned { attempts: u32, last_error: String },
    /// Shutdown interrupted the sequence
    Cancelled,
    /// This round already had its submission sequence
    Duplicate,
}

impl SubmitOutcome {
    pub fn tx(&self) -> Option<TxHash> {
        match self {
            SubmitOutcome::Submitted { tx, .. } => Some(*tx),
            _ => None,
        }
    }
}

/// How waiting for inclusion ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Included(u64),
    Failed,
    TimedOut,
    Cancelled,
}

/// Runs at most one submission sequence per round
pub struct ReportSubmitter {
    config: SubmitterConfig,
    gateway: Arc<dyn ChainGateway>,
    last_round: Option<RoundId>,
}

impl ReportSubmitter {
    pub fn new(config: SubmitterConfig, gateway: Arc<dyn ChainGateway>) -> Self {
        Self {
            config,
            gateway,
            last_round: None,
        }
    }

    pub fn last_round(&self) -> Option<RoundId> {
        self.last_round
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.config
            .retry_initial
            .saturating_mul(1u32 << exponent)
            .min(self.config.retry_max)
    }

    /// Submit `report`, retrying network and node errors until `deadline`.
    ///
    /// A stale attempt is abandoned rather than sent after the deadline.
    pub async fn submit(
        &mut self,
        report: &Report,
        deadline: Instant,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SubmitOutcome {
        if self.last_round.is_some_and(|r| report.round <= r) {
            warn!(round = report.round, "Round already submitted, skipping");
            return SubmitOutcome::Duplicate;
        }
        self.last_round = Some(report.round);

        let mut attempts = 0u32;
        loop {
            if *shutdown.borrow() {
                return SubmitOutcome::Cancelled;
            }
            attempts += 1;

            let attempt = tokio::time::timeout_at(deadline, self.gateway.submit_report(report));
            let result = tokio::select! {
                result = attempt => result,
                _ = shutdown.changed() => return SubmitOutcome::Cancelled,
            };

            let error = match result {
                Ok(Ok(tx)) => {
                    info!(
                        round = report.round,
                        symbols = report.entries.len(),
                        attempts,
                        "Report submitted: {}",
                        tx
                    );
                    return SubmitOutcome::Submitted { tx, attempts };
                }
                Ok(Err(e @ ChainError::Rejected(_))) => {
                    warn!(target: "audit", round = report.round, "Report rejected: {}", e);
                    return SubmitOutcome::Rejected(e.to_string());
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    error!(round = report.round, attempts, "Submission failed: {}", e);
                    return SubmitOutcome::Failed(e.to_string());
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "submission still pending at round deadline".to_string(),
            };

            let delay = self.backoff(attempts);
            if Instant::now() + delay >= deadline {
                warn!(
                    target: "audit",
                    round = report.round,
                    attempts,
                    "Abandoning stale submission: {}",
                    error
                );
                return SubmitOutcome::Abandoned {
                    attempts,
                    last_error: error,
                };
            }

            debug!(round = report.round, attempts, "Submission failed, retrying in {:?}: {}", delay, error);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return SubmitOutcome::Cancelled,
            }
        }
    }

    /// Poll until the transaction is included or failed.
    ///
    /// Gives up at `deadline` or after the confirm timeout, whichever is first.
    pub async fn confirm(
        &self,
        tx: &TxHash,
        deadline: Instant,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Confirmation {
        let deadline = deadline.min(Instant::now() + self.config.confirm_timeout);

        loop {
            match self.gateway.transaction_status(tx).await {
                Ok(TxStatus::Included { block }) => return Confirmation::Included(block),
                Ok(TxStatus::Failed) => return Confirmation::Failed,
                Ok(TxStatus::Pending) => {}
                Err(e) => debug!("Transaction status unavailable: {}", e),
            }

            if Instant::now() + self.config.confirm_poll_interval > deadline {
                return Confirmation::TimedOut;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.confirm_poll_interval) => {}
                _ = shutdown.changed() => return Confirmation::Cancelled,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGateway;

    fn report(round: RoundId) -> Report {
        Report { round, entries: vec![] }
    }

    fn submitter(gateway: &Arc<MockGateway>) -> ReportSubmitter {
        ReportSubmitter::new(SubmitterConfig::default(), gateway.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_network_errors() {
        let gateway = Arc::new(MockGateway::default());
        gateway.fail_submissions([
            ChainError::Network("timeout".into()),
            ChainError::Node { code: -32000, message: "txpool full".into() },
        ]);
        let (_tx, mut shutdown) = watch::channel(false);

        let deadline = Instant::now() + Duration::from_secs(20);
        let outcome = submitter(&gateway).submit(&report(5), deadline, &mut shutdown).await;

        assert!(matches!(outcome, SubmitOutcome::Submitted { attempts: 3, .. }));
        assert_eq!(gateway.submitted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let gateway = Arc::new(MockGateway::default());
        gateway.fail_submissions([ChainError::Rejected("not a committee member".into())]);
        let (_tx, mut shutdown) = watch::channel(false);

        let deadline = Instant::now() + Duration::from_secs(20);
        let outcome = submitter(&gateway).submit(&report(5), deadline, &mut shutdown).await;

        assert_eq!(outcome, SubmitOutcome::Rejected("Report rejected: not a committee member".into()));
        assert!(gateway.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandons_at_deadline() {
        let gateway = Arc::new(MockGateway::default());
        gateway.fail_submissions((0..100).map(|_| ChainError::Network("down".into())));
        let (_tx, mut shutdown) = watch::channel(false);

        let started = Instant::now();
        let deadline = started + Duration::from_secs(3);
        let outcome = submitter(&gateway).submit(&report(5), deadline, &mut shutdown).await;

        // 0.5 + 1 succeed, the 2 s wait would cross the deadline
        assert_eq!(
            outcome,
            SubmitOutcome::Abandoned { attempts: 3, last_error: "Network error: down".into() }
        );
        assert!(Instant::now() < deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_sequence_per_round() {
        let gateway = Arc::new(MockGateway::default());
        let (_tx, mut shutdown) = watch::channel(false);
        let mut submitter = submitter(&gateway);
        let deadline = Instant::now() + Duration::from_secs(20);

        assert!(submitter.submit(&report(5), deadline, &mut shutdown).await.tx().is_some());
        assert_eq!(submitter.submit(&report(5), deadline, &mut shutdown).await, SubmitOutcome::Duplicate);
        assert_eq!(submitter.submit(&report(4), deadline, &mut shutdown).await, SubmitOutcome::Duplicate);
        assert!(submitter.submit(&report(6), deadline, &mut shutdown).await.tx().is_some());
        assert_eq!(gateway.submitted().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_retries() {
        let gateway = Arc::new(MockGateway::default());
        gateway.fail_submissions((0..100).map(|_| ChainError::Network("down".into())));
        let (tx, mut shutdown) = watch::channel(false);

        let deadline = Instant::now() + Duration::from_secs(60);
        let mut submitter = submitter(&gateway);
        let rep = report(5);
        let run = submitter.submit(&rep, deadline, &mut shutdown);
        let stop = async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            tx.send(true).unwrap();
        };

        let (outcome, _) = tokio::join!(run, stop);
        assert_eq!(outcome, SubmitOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_outcomes() {
        let gateway = Arc::new(MockGateway::default());
        let (_tx, mut shutdown) = watch::channel(false);
        let submitter = submitter(&gateway);
        let hash = TxHash::with_last_byte(1);
        let far = Instant::now() + Duration::from_secs(600);

        gateway.set_tx_status(TxStatus::Included { block: 88 });
        assert_eq!(submitter.confirm(&hash, far, &mut shutdown).await, Confirmation::Included(88));

        gateway.set_tx_status(TxStatus::Failed);
        assert_eq!(submitter.confirm(&hash, far, &mut shutdown).await, Confirmation::Failed);

        gateway.set_tx_status(TxStatus::Pending);
        let started = Instant::now();
        assert_eq!(submitter.confirm(&hash, far, &mut shutdown).await, Confirmation::TimedOut);
        assert!(started.elapsed() <= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_stops_at_deadline() {
        let gateway = Arc::new(MockGateway::default());
        gateway.set_tx_status(TxStatus::Pending);
        let (_tx, mut shutdown) = watch::channel(false);

        let started = Instant::now();
        let deadline = started + Duration::from_secs(10);
        let confirmation = submitter(&gateway)
            .confirm(&TxHash::with_last_byte(2), deadline, &mut shutdown)
            .await;

        assert_eq!(confirmation, Confirmation::TimedOut);
        assert!(Instant::now() <= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_reply_is_not_a_rejection() {
        let gateway = Arc::new(MockGateway::default());
        gateway.fail_submissions([ChainError::Malformed("bad hex".into())]);
        let (_tx, mut shutdown) = watch::channel(false);

        let deadline = Instant::now() + Duration::from_secs(20);
        let outcome = submitter(&gateway).submit(&report(5), deadline, &mut shutdown).await;

        assert!(matches!(outcome, SubmitOutcome::Failed(_)), "{outcome:?}");
        assert!(gateway.submitted().is_empty());
    }
}
