use std::time::Duration;
use thiserror::Error;

use crate::messages::{GantryState, Position};

/// Failures of the serial link itself
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("Serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed by device")]
    Closed,
}

/// Why a controller refused to send a command
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Precondition {
    #[error("Cannot move while docked")]
    Docked,
    #[error("Cannot dock at {0}")]
    NotDockable(Position),
    #[error("Invalid target position: {0}")]
    InvalidTarget(Position),
    #[error("Intake requires docking at storage_1 (docked: {docked}, position: {position})")]
    IntakeNotDocked { docked: bool, position: Position },
    #[error("Cannot {action} while {actual} (requires {required})")]
    WrongState {
        action: &'static str,
        required: GantryState,
        actual: GantryState,
    },
}

/// Failure of a single controller step
///
/// Controllers hand these back as values; they never abort a workflow on
/// their own.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("\"{expected}\" not received within {timeout:?}")]
    Timeout { expected: String, timeout: Duration },
    #[error(transparent)]
    Precondition(#[from] Precondition),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Workflow-aborting error raised by the orchestrator
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Expected \"{action}\" but action failed: {source}")]
    Failed {
        action: String,
        #[source]
        source: StepError,
    },
    #[error("\"{0}\" is not a valid location")]
    InvalidLocation(String),
    #[error("Slot must be between 1 and 4, got {0}")]
    InvalidSlot(u8),
    #[error("\"{action}\" did not succeed within {waited:?}")]
    PollTimeout { action: String, waited: Duration },
}

impl ActionError {
    /// Name of the action that aborted the workflow, if any
    pub fn action(&self) -> Option<&str> {
        match self {
            ActionError::Failed { action, .. } | ActionError::PollTimeout { action, .. } => {
                Some(action)
            }
            ActionError::InvalidLocation(_) | ActionError::InvalidSlot(_) => None,
        }
    }
}
