//! Client errors and command outcomes.

use thiserror::Error;

use crate::bus::BusError;
use crate::perms::PermissionsError;
use crate::platform::PlatformError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("special handler {0} is already registered")]
    DuplicateSpecial(String),

    #[error("channel reference {reference} is configured as {target}, which does not exist")]
    UnknownChannel { reference: String, target: String },

    #[error("no such command: {0}")]
    UnknownCommand(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Permissions(#[from] PermissionsError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Why a command handler failed, as far as the user is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Talking to the chat platform failed.
    Platform,
    Internal,
}

impl FailureKind {
    /// Classify a handler error by looking for a [`PlatformError`] anywhere
    /// in its chain.
    pub fn categorize(error: &anyhow::Error) -> Self {
        if error.chain().any(|cause| cause.downcast_ref::<PlatformError>().is_some()) {
            return FailureKind::Platform;
        }
        FailureKind::Internal
    }

    /// Reply sent to the user. Never includes the error itself.
    pub fn user_message(self) -> &'static str {
        match self {
            FailureKind::Platform => {
                "I've encountered an error communicating with the chat service. \
                 This should be a transient issue, but if it happens again \
                 report it to your server administrator"
            }
            FailureKind::Internal => {
                "I encountered unexpected error while processing your command. \
                 Please report this to your server administrator"
            }
        }
    }
}

/// How one command invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed,
    /// The author lacks permission; they were told so.
    Denied,
    /// Arguments did not parse; the reply was the usage text.
    Usage(String),
    Failed(FailureKind),
}

pub(crate) const DENIED_MESSAGE: &str = "You do not have permissions to use this command";

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_categorize() {
        let platform: anyhow::Error = PlatformError::Unavailable("gateway down".into()).into();
        assert_eq!(FailureKind::categorize(&platform), FailureKind::Platform);

        let wrapped = Err::<(), _>(PlatformError::Unavailable("gateway down".into()))
            .context("sending reply")
            .unwrap_err();
        assert_eq!(FailureKind::categorize(&wrapped), FailureKind::Platform);

        let internal = anyhow::anyhow!("division by zero");
        assert_eq!(FailureKind::categorize(&internal), FailureKind::Internal);
        assert!(!FailureKind::Internal.user_message().contains("division"));
    }
}
