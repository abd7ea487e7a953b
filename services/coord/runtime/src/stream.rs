//! Stream lifecycle state machine.

use crate::StreamError;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Lifecycle state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamState {
    /// Configured, no endpoints yet
    Created,
    /// Endpoints being opened
    Initializing,
    /// Samples flowing
    Active,
    /// Endpoints open, no samples flowing
    Paused,
    /// Endpoints released, may be started again
    Stopping,
    /// Gone for good
    Disposed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Created => "created",
            StreamState::Initializing => "initializing",
            StreamState::Active => "active",
            StreamState::Paused => "paused",
            StreamState::Stopping => "stopping",
            StreamState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Validated transitions of one stream.
///
/// Repeating the operation that led to the current state is accepted as a
/// no-op, so replayed remote commands are harmless.
#[derive(Debug, Clone)]
pub struct StreamLifecycle {
    name: String,
    state: StreamState,
}

impl StreamLifecycle {
    /// New lifecycle in `Created`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StreamState::Created,
        }
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    fn invalid(&self, operation: &'static str) -> StreamError {
        if self.state == StreamState::Disposed {
            return StreamError::Closed(self.name.clone());
        }
        StreamError::InvalidState {
            stream: self.name.clone(),
            operation,
            state: self.state,
        }
    }

    fn set(&mut self, state: StreamState) -> StreamState {
        if self.state != state {
            debug!("Stream {} {} -> {}", self.name, self.state, state);
            self.state = state;
        }
        state
    }

    /// Begin starting: `Created`/`Stopping` -> `Initializing`.
    ///
    /// Returns `false` when the stream is already active, meaning there is
    /// nothing to start.
    pub fn begin_start(&mut self) -> Result<bool, StreamError> {
        match self.state {
            StreamState::Created | StreamState::Stopping => {
                self.set(StreamState::Initializing);
                Ok(true)
            }
            StreamState::Active => Ok(false),
            _ => Err(self.invalid("start")),
        }
    }

    /// Finish starting: `Initializing` -> `Active`
    pub fn activate(&mut self) -> Result<StreamState, StreamError> {
        match self.state {
            StreamState::Initializing => Ok(self.set(StreamState::Active)),
            _ => Err(self.invalid("activate")),
        }
    }

    /// Abort a failed start: `Initializing` -> `Created`
    pub fn abort_start(&mut self) {
        if self.state == StreamState::Initializing {
            self.set(StreamState::Created);
        }
    }

    /// `Active` -> `Paused`
    pub fn pause(&mut self) -> Result<StreamState, StreamError> {
        match self.state {
            StreamState::Active | StreamState::Paused => Ok(self.set(StreamState::Paused)),
            _ => Err(self.invalid("pause")),
        }
    }

    /// `Paused` -> `Active`
    pub fn resume(&mut self) -> Result<StreamState, StreamError> {
        match self.state {
            StreamState::Paused | StreamState::Active => Ok(self.set(StreamState::Active)),
            _ => Err(self.invalid("resume")),
        }
    }

    /// Check that a flush is allowed; never changes state
    pub fn check_flush(&self) -> Result<StreamState, StreamError> {
        match self.state {
            StreamState::Active | StreamState::Paused => Ok(self.state),
            _ => Err(self.invalid("flush")),
        }
    }

    /// Check that a sample may be pushed
    pub fn check_push(&self) -> Result<(), StreamError> {
        match self.state {
            StreamState::Active => Ok(()),
            _ => Err(self.invalid("push to")),
        }
    }

    /// `Active`/`Paused` -> `Stopping`
    pub fn stop(&mut self) -> Result<StreamState, StreamError> {
        match self.state {
            StreamState::Active | StreamState::Paused | StreamState::Stopping => {
                Ok(self.set(StreamState::Stopping))
            }
            _ => Err(self.invalid("stop")),
        }
    }

    /// Any state -> `Disposed`; terminal
    pub fn destroy(&mut self) -> Result<StreamState, StreamError> {
        match self.state {
            StreamState::Disposed => Err(self.invalid("destroy")),
            _ => Ok(self.set(StreamState::Disposed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut lifecycle = StreamLifecycle::new("s1");
        assert_eq!(lifecycle.state(), StreamState::Created);

        assert!(lifecycle.begin_start().unwrap());
        assert_eq!(lifecycle.state(), StreamState::Initializing);
        assert_eq!(lifecycle.activate().unwrap(), StreamState::Active);
        assert!(!lifecycle.begin_start().unwrap());

        assert_eq!(lifecycle.pause().unwrap(), StreamState::Paused);
        assert_eq!(lifecycle.check_flush().unwrap(), StreamState::Paused);
        assert!(lifecycle.check_push().is_err());
        assert_eq!(lifecycle.resume().unwrap(), StreamState::Active);
        assert!(lifecycle.check_push().is_ok());

        assert_eq!(lifecycle.stop().unwrap(), StreamState::Stopping);
        assert!(lifecycle.begin_start().unwrap());
        lifecycle.activate().unwrap();

        assert_eq!(lifecycle.destroy().unwrap(), StreamState::Disposed);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut lifecycle = StreamLifecycle::new("s1");
        assert!(matches!(
            lifecycle.pause(),
            Err(StreamError::InvalidState { operation: "pause", .. })
        ));
        assert!(lifecycle.stop().is_err());
        assert!(lifecycle.check_flush().is_err());

        lifecycle.begin_start().unwrap();
        lifecycle.abort_start();
        assert_eq!(lifecycle.state(), StreamState::Created);
    }

    #[test]
    fn test_disposed_is_terminal() {
        let mut lifecycle = StreamLifecycle::new("s1");
        lifecycle.destroy().unwrap();

        assert_eq!(lifecycle.destroy(), Err(StreamError::Closed("s1".into())));
        assert_eq!(lifecycle.begin_start(), Err(StreamError::Closed("s1".into())));
        assert_eq!(lifecycle.check_push(), Err(StreamError::Closed("s1".into())));
    }
}
