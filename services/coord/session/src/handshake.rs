//! Bidirectional connection confirmation.
//!
//! Before a participant trusts a join to work it proves two-way reachability:
//! it sends a `ConnectionTest` carrying a fresh test id and waits for the
//! coordinator's `ConnectionTestResponse` with the same id. The control loop
//! owns the [`PendingTests`] table that matches responses to waiters.

use crate::config::ConnectionTestConfig;
use crate::SessionError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outstanding connection tests keyed by test id
#[derive(Debug, Default)]
pub struct PendingTests {
    pending: HashMap<String, (oneshot::Sender<()>, Instant)>,
}

impl PendingTests {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `test_id`
    pub fn register(&mut self, test_id: impl Into<String>, reply: oneshot::Sender<()>) {
        self.pending.insert(test_id.into(), (reply, Instant::now()));
    }

    /// Complete the waiter for `test_id`. Returns false for unknown or abandoned tests.
    pub fn resolve(&mut self, test_id: &str) -> bool {
        match self.pending.remove(test_id) {
            Some((reply, _)) => reply.send(()).is_ok(),
            None => {
                debug!("Response for unknown connection test {}", test_id);
                false
            }
        }
    }

    /// Drop tests whose waiter went away or that are older than `max_age`
    pub fn prune(&mut self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending.retain(|_, (reply, registered)| {
            !reply.is_closed() && now.saturating_duration_since(*registered) <= max_age
        });
        before - self.pending.len()
    }

    /// Number of outstanding tests
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no test is outstanding
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Sends one connection test
#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    /// Send a `ConnectionTest` for `test_id`; the receiver completes when the response arrives
    async fn send_test(&self, test_id: &str) -> Result<oneshot::Receiver<()>, SessionError>;
}

/// Confirm two-way reachability, retrying per `config`.
///
/// Makes `config.max_retries` attempts in total, each with a fresh test id and
/// a `config.timeout` wait, sleeping `config.retry_delay` between attempts.
/// Returns the number of the attempt that succeeded.
pub async fn confirm_connection<P>(probe: &P, config: &ConnectionTestConfig) -> Result<u32, SessionError>
where
    P: ConnectionProbe + ?Sized,
{
    for attempt in 1..=config.max_retries {
        let test_id = uuid::Uuid::new_v4().to_string();
        let response = probe.send_test(&test_id).await?;

        match tokio::time::timeout(config.timeout, response).await {
            Ok(Ok(())) => {
                info!("Connection confirmed on attempt {}", attempt);
                return Ok(attempt);
            }
            Ok(Err(_)) => debug!("Connection test {} abandoned", test_id),
            Err(_) => debug!(
                "Connection test {} timed out after {:?} (attempt {}/{})",
                test_id, config.timeout, attempt, config.max_retries
            ),
        }

        if attempt < config.max_retries {
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    warn!(
        "No connection test response after {} attempts",
        config.max_retries
    );
    Err(SessionError::ConnectionUnconfirmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Answers only from the `answer_on`-th attempt onwards
    struct FlakyProbe {
        attempts: AtomicU32,
        answer_on: u32,
        table: Mutex<PendingTests>,
    }

    impl FlakyProbe {
        fn new(answer_on: u32) -> Self {
            Self {
                attempts: AtomicU32::new(0),
                answer_on,
                table: Mutex::new(PendingTests::new()),
            }
        }
    }

    #[async_trait]
    impl ConnectionProbe for FlakyProbe {
        async fn send_test(&self, test_id: &str) -> Result<oneshot::Receiver<()>, SessionError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let (tx, rx) = oneshot::channel();
            let mut table = self.table.lock().unwrap();
            table.register(test_id, tx);
            if attempt >= self.answer_on {
                assert!(table.resolve(test_id));
            }
            Ok(rx)
        }
    }

    fn config() -> ConnectionTestConfig {
        ConnectionTestConfig {
            max_retries: 3,
            timeout: Duration::from_secs(1),
            retry_delay: Duration::from_millis(250),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirms_on_later_attempt() {
        let probe = FlakyProbe::new(2);
        let attempt = confirm_connection(&probe, &config()).await.unwrap();
        assert_eq!(attempt, 2);
        assert_eq!(probe.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_makes_max_retries_attempts() {
        let probe = FlakyProbe::new(u32::MAX);
        let started = Instant::now();
        let result = confirm_connection(&probe, &config()).await;

        assert_eq!(result, Err(SessionError::ConnectionUnconfirmed));
        assert_eq!(probe.attempts.load(Ordering::SeqCst), 3);
        // Three timeouts and two delays between them
        assert_eq!(started.elapsed(), Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_abandoned_and_expired() {
        let mut table = PendingTests::new();
        let (kept_tx, _kept_rx) = oneshot::channel();
        let (dropped_tx, dropped_rx) = oneshot::channel();
        table.register("kept", kept_tx);
        table.register("dropped", dropped_tx);
        drop(dropped_rx);

        assert_eq!(table.prune(Duration::from_secs(5)), 1);
        assert_eq!(table.len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(table.prune(Duration::from_secs(5)), 1);
        assert!(table.is_empty());
        assert!(!table.resolve("kept"));
    }
}
