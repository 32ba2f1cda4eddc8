use thiserror::Error;

pub use crate::core::{Effect, Transience};

use crate::config::ConfigError;
use crate::core::{CoreError, ErrorCode};
use crate::repl::{AckManagerError, ClientError, LifecycleError, ServerError};

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    AckManager(#[from] AckManagerError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Core(e) => e.code(),
            Error::AckManager(e) => e.code(),
            Error::Lifecycle(_) => ErrorCode::ShuttingDown,
            Error::Config(e) => e.code(),
            Error::Server(ServerError::Io(_)) => ErrorCode::Unavailable,
            Error::Server(ServerError::Limits(_)) => ErrorCode::InvalidRequest,
            Error::Client(e) => e.code(),
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::AckManager(e) => e.transience(),
            Error::Lifecycle(_) => Transience::Permanent,
            Error::Config(e) => e.transience(),
            Error::Server(ServerError::Io(_)) => Transience::Unknown,
            Error::Server(ServerError::Limits(_)) => Transience::Permanent,
            Error::Client(e) => e.transience(),
        }
    }

    /// Nothing in this crate mutates replication state, so only a client
    /// request that reached the wire has an unknown effect.
    pub fn effect(&self) -> Effect {
        match self {
            Error::AckManager(e) => e.effect(),
            Error::Client(ClientError::Io(_) | ClientError::Closed) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::repl::LifecycleState;

    #[test]
    fn wraps_capability_errors() {
        let err: Error = AckManagerError::Cancelled.into();
        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert!(err.transience().is_retryable());
        assert_eq!(err.effect(), Effect::None);

        let err: Error = LifecycleError {
            expected: LifecycleState::Created,
            actual: LifecycleState::Stopped,
        }
        .into();
        assert_eq!(err.transience(), Transience::Permanent);

        let err: Error = ClientError::Closed.into();
        assert_eq!(err.effect(), Effect::Unknown);
    }
}
