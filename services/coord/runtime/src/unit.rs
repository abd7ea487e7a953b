//! Supervised execution units.
//!
//! A unit is a [`UnitWorker`] running on its own task. It owns its state, reads
//! commands from an inbound channel and writes results to an outbound channel.
//! When `run` returns an error (or panics) the supervisor consults a
//! [`RecoveryTracker`] and either restarts the same worker after a backoff or
//! disables it for good.

use crate::recovery::{RecoveryDecision, RecoveryPolicy, RecoveryTracker};
use crate::registry::{Layer, LayerRegistry};
use crate::{IsolateError, IsolationError};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Body of an execution unit
#[async_trait]
pub trait UnitWorker: Send + 'static {
    /// Messages from the owner
    type Inbound: Send + 'static;
    /// Messages to the owner
    type Outbound: Send + 'static;

    /// Run until the inbox closes or a fault occurs.
    ///
    /// After a recoverable fault the same worker is run again with the same
    /// channels, so anything queued during the backoff is still delivered.
    async fn run(
        &mut self,
        inbox: &mut mpsc::Receiver<Self::Inbound>,
        outbox: &mpsc::Sender<Self::Outbound>,
    ) -> Result<(), IsolateError>;
}

/// Supervisor view of a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    /// Worker is running
    Running,
    /// Waiting out the backoff before a restart
    Recovering {
        /// 1-based recovery attempt
        attempt: u32,
        /// Backoff duration
        delay: Duration,
    },
    /// Worker finished normally
    Stopped,
    /// Worker was permanently disabled
    Disabled {
        /// Why recovery was refused
        reason: String,
    },
}

impl UnitStatus {
    /// Whether the unit will never run again
    pub fn is_final(&self) -> bool {
        matches!(self, UnitStatus::Stopped | UnitStatus::Disabled { .. })
    }
}

/// Owner side of a supervised unit
#[derive(Debug)]
pub struct UnitHandle<In> {
    id: String,
    layer: Layer,
    inbox: mpsc::Sender<In>,
    status: watch::Receiver<UnitStatus>,
    task: JoinHandle<()>,
}

impl<In: Send + 'static> UnitHandle<In> {
    /// Unit id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unit layer
    pub fn layer(&self) -> Layer {
        self.layer
    }

    /// Sender for the unit's inbox
    pub fn sender(&self) -> mpsc::Sender<In> {
        self.inbox.clone()
    }

    /// Deliver a message to the unit
    pub async fn send(&self, message: In) -> Result<(), IsolationError> {
        self.inbox
            .send(message)
            .await
            .map_err(|_| IsolationError::Closed(self.id.clone()))
    }

    /// Current status
    pub fn status(&self) -> UnitStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn status_watch(&self) -> watch::Receiver<UnitStatus> {
        self.status.clone()
    }

    /// Wait until the unit stops. A disabled unit yields an error.
    pub async fn wait(&self) -> Result<(), IsolationError> {
        let mut status = self.status.clone();
        let final_status = match status.wait_for(UnitStatus::is_final).await {
            Ok(status) => status.clone(),
            // Supervisor task is gone without a final status
            Err(_) => return Err(IsolationError::Closed(self.id.clone())),
        };
        match final_status {
            UnitStatus::Disabled { reason } => Err(IsolationError::Disabled {
                id: self.id.clone(),
                reason,
            }),
            _ => Ok(()),
        }
    }

    /// Whether the supervisor task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Kill the unit without waiting for it
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Close the inbox and wait up to `grace` for the unit to stop, killing it otherwise
    pub async fn shutdown(self, grace: Duration) {
        let UnitHandle { id, inbox, task, .. } = self;
        drop(inbox);

        let abort = task.abort_handle();
        if tokio::time::timeout(grace, task).await.is_err() {
            warn!("Unit {} did not stop within {:?}, aborting", id, grace);
            abort.abort();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Register `worker` under `id` in `layer` and run it on its own task.
///
/// Returns the owner handle and the receiving end of the unit's outbox. The
/// registration is released when the supervisor task ends.
pub fn spawn_supervised<W: UnitWorker>(
    registry: &LayerRegistry,
    layer: Layer,
    id: impl Into<String>,
    mut worker: W,
    policy: RecoveryPolicy,
    capacity: usize,
) -> Result<(UnitHandle<W::Inbound>, mpsc::Receiver<W::Outbound>), IsolationError> {
    let id = id.into();
    let registration = registry.register(id.clone(), layer)?;

    let (inbox_tx, mut inbox_rx) = mpsc::channel(capacity.max(1));
    let (outbox_tx, outbox_rx) = mpsc::channel(capacity.max(1));
    let (status_tx, status_rx) = watch::channel(UnitStatus::Running);

    let unit_id = id.clone();
    let task = tokio::spawn(async move {
        let _registration = registration;
        let mut tracker = RecoveryTracker::new(policy);

        info!("Started {} unit {}", layer, unit_id);
        loop {
            status_tx.send_replace(UnitStatus::Running);

            let outcome = AssertUnwindSafe(worker.run(&mut inbox_rx, &outbox_tx))
                .catch_unwind()
                .await;

            let fault = match outcome {
                Ok(Ok(())) => {
                    info!("Unit {} stopped", unit_id);
                    status_tx.send_replace(UnitStatus::Stopped);
                    break;
                }
                Ok(Err(fault)) => fault,
                Err(panic) => IsolateError::new(format!("unit {} panicked", unit_id))
                    .with_cause(panic_message(panic.as_ref())),
            };

            warn!(
                "Unit {} faulted: {} (cause: {})",
                unit_id,
                fault,
                fault.cause.as_deref().unwrap_or("none")
            );

            match tracker.on_error(&fault) {
                RecoveryDecision::Retry { attempt, delay } => {
                    info!(
                        "Recovering unit {} (attempt {}) in {:?}",
                        unit_id, attempt, delay
                    );
                    status_tx.send_replace(UnitStatus::Recovering { attempt, delay });
                    tokio::time::sleep(delay).await;
                }
                RecoveryDecision::Disable { reason } => {
                    error!("Unit {} disabled: {}", unit_id, reason);
                    status_tx.send_replace(UnitStatus::Disabled { reason });
                    break;
                }
            }
        }
    });

    Ok((
        UnitHandle {
            id,
            layer,
            inbox: inbox_tx,
            status: status_rx,
            task,
        },
        outbox_rx,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echoes inputs; fails on "fail", panics on "panic", fatal on "fatal"
    struct Echo {
        runs: u32,
    }

    #[async_trait]
    impl UnitWorker for Echo {
        type Inbound = String;
        type Outbound = String;

        async fn run(
            &mut self,
            inbox: &mut mpsc::Receiver<String>,
            outbox: &mpsc::Sender<String>,
        ) -> Result<(), IsolateError> {
            self.runs += 1;
            while let Some(message) = inbox.recv().await {
                match message.as_str() {
                    "fail" => return Err(IsolateError::new("asked to fail").with_cause("test")),
                    "fatal" => return Err(IsolateError::fatal("asked to die")),
                    "panic" => panic!("asked to panic"),
                    _ => {
                        let _ = outbox.send(format!("{}#{}", message, self.runs)).await;
                    }
                }
            }
            Ok(())
        }
    }

    fn spawn_echo(
        registry: &LayerRegistry,
    ) -> (UnitHandle<String>, mpsc::Receiver<String>) {
        spawn_supervised(
            registry,
            Layer::Control,
            "echo",
            Echo { runs: 0 },
            RecoveryPolicy::default(),
            16,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_recovers_and_keeps_inbox() {
        let registry = LayerRegistry::new();
        let (handle, mut outbox) = spawn_echo(&registry);

        handle.send("a".into()).await.unwrap();
        assert_eq!(outbox.recv().await.unwrap(), "a#1");

        handle.send("fail".into()).await.unwrap();
        // Queued while the unit is backing off
        handle.send("b".into()).await.unwrap();
        assert_eq!(outbox.recv().await.unwrap(), "b#2");

        handle.send("panic".into()).await.unwrap();
        handle.send("c".into()).await.unwrap();
        assert_eq!(outbox.recv().await.unwrap(), "c#3");
        assert_eq!(handle.status(), UnitStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_fault_disables_unit() {
        let registry = LayerRegistry::new();
        let (handle, _outbox) = spawn_echo(&registry);

        handle.send("fatal".into()).await.unwrap();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, IsolationError::Disabled { .. }));

        // Registration is released once the unit is gone
        tokio::task::yield_now().await;
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.layer_of("echo"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_recovery_disables_unit() {
        let registry = LayerRegistry::new();
        let (handle, _outbox) = spawn_echo(&registry);

        for _ in 0..4 {
            handle.send("fail".into()).await.unwrap();
        }
        let err = handle.wait().await.unwrap_err();
        match err {
            IsolationError::Disabled { reason, .. } => assert!(reason.contains("exhausted")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clean_stop_and_duplicate_id() {
        let registry = LayerRegistry::new();
        let (handle, _outbox) = spawn_echo(&registry);

        let duplicate = spawn_supervised(
            &registry,
            Layer::Data,
            "echo",
            Echo { runs: 0 },
            RecoveryPolicy::default(),
            16,
        );
        assert!(matches!(duplicate, Err(IsolationError::Overlap { .. })));

        let status = handle.status_watch();
        handle.shutdown(Duration::from_secs(1)).await;
        assert_eq!(*status.borrow(), UnitStatus::Stopped);
        assert_eq!(registry.layer_of("echo"), None);
    }
}
