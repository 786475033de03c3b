//! Program status and the production transition table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a machine program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    Preparing,
    Ready,
    Running,
    Suspended,
    Completed,
}

/// Side effect applied when a program enters a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEffect {
    /// Nothing beyond the status write.
    None,
    /// Progress floor of [`RUNNING_PROGRESS_FLOOR`] when progress is still 0.
    ProgressFloor,
    /// Notes, when given, replace the program notes.
    RecordReason,
    /// End time is stamped and progress forced to 100.
    Finish,
}

/// Progress shown once a program starts running without reported progress.
pub const RUNNING_PROGRESS_FLOOR: u8 = 5;

impl ProgramStatus {
    pub const ALL: [ProgramStatus; 5] = [
        ProgramStatus::Preparing,
        ProgramStatus::Ready,
        ProgramStatus::Running,
        ProgramStatus::Suspended,
        ProgramStatus::Completed,
    ];

    /// Stable lowercase name used in storage and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ProgramStatus::Preparing => "preparing",
            ProgramStatus::Ready => "ready",
            ProgramStatus::Running => "running",
            ProgramStatus::Suspended => "suspended",
            ProgramStatus::Completed => "completed",
        }
    }

    /// Active programs occupy a machine: ready, running or suspended.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProgramStatus::Ready | ProgramStatus::Running | ProgramStatus::Suspended
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProgramStatus::Completed)
    }

    /// Whether the transition table permits `self -> next`.
    ///
    /// Self-transitions are not transitions and are rejected.
    pub fn can_transition_to(self, next: ProgramStatus) -> bool {
        use ProgramStatus::*;
        matches!(
            (self, next),
            (Preparing, Ready)
                | (Ready, Running)
                | (Ready, Suspended)
                | (Running, Suspended)
                | (Running, Completed)
                | (Suspended, Running)
                | (Suspended, Completed)
        )
    }

    /// The side effect of entering this state.
    pub fn entry_effect(self) -> EntryEffect {
        match self {
            ProgramStatus::Running => EntryEffect::ProgressFloor,
            ProgramStatus::Suspended => EntryEffect::RecordReason,
            ProgramStatus::Completed => EntryEffect::Finish,
            ProgramStatus::Preparing | ProgramStatus::Ready => EntryEffect::None,
        }
    }
}

impl fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown program status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ProgramStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preparing" => Ok(ProgramStatus::Preparing),
            "ready" => Ok(ProgramStatus::Ready),
            "running" => Ok(ProgramStatus::Running),
            "suspended" => Ok(ProgramStatus::Suspended),
            "completed" => Ok(ProgramStatus::Completed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
