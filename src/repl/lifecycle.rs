//! Start/stop state machine shared by long-lived replication components.

use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Running,
    Stopped,
}

shardrepl_core::enum_str! {
    impl LifecycleState {
        pub fn as_str(&self) -> &'static str;
        pub fn parse_str(raw: &str) -> Option<Self>;
        variants {
            Created => ["created"],
            Running => ["running", "started"],
            Stopped => ["stopped"],
        }
    }
}

impl LifecycleState {
    fn to_u8(self) -> u8 {
        match self {
            LifecycleState::Created => 0,
            LifecycleState::Running => 1,
            LifecycleState::Stopped => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Created,
            1 => LifecycleState::Running,
            _ => LifecycleState::Stopped,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("lifecycle transition requires state {expected}, found {actual}")]
pub struct LifecycleError {
    pub expected: LifecycleState,
    pub actual: LifecycleState,
}

#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Created.to_u8()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Moves `from -> to` atomically; fails without effect otherwise.
    pub fn transition(
        &self,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<(), LifecycleError> {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| LifecycleError {
                expected: from,
                actual: LifecycleState::from_u8(actual),
            })
    }

    pub fn start(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Created, LifecycleState::Running)
    }

    pub fn stop(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Running, LifecycleState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_stop() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Created);
        lifecycle.start().unwrap();
        assert!(lifecycle.is_running());
        lifecycle.stop().unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn invalid_transitions_report_actual_state() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle.stop().unwrap_err();
        assert_eq!(
            err,
            LifecycleError {
                expected: LifecycleState::Running,
                actual: LifecycleState::Created,
            }
        );

        lifecycle.start().unwrap();
        let err = lifecycle.start().unwrap_err();
        assert_eq!(err.actual, LifecycleState::Running);

        lifecycle.stop().unwrap();
        assert!(lifecycle.start().is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn state_strings() {
        assert_eq!(LifecycleState::Running.to_string(), "running");
        assert_eq!(
            LifecycleState::parse_str("started"),
            Some(LifecycleState::Running)
        );
    }
}
