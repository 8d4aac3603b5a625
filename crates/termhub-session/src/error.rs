use termhub_core::{RuntimeError, SessionId};
use thiserror::Error;

use crate::automation::AutomationError;

/// Session and registry errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Maximum sessions ({max}) reached")]
    Capacity { max: usize },
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Failed to connect to container {container_id}: {source}")]
    Connection {
        container_id: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Automation not enabled for session {0}")]
    AutomationDisabled(SessionId),
    #[error(transparent)]
    Automation(#[from] AutomationError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
