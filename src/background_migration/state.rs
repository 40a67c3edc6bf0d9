//! Lifecycle states of batched migrations and their batches.
//!
//! `active ⇄ paused`, `active → finished`, `active → failed`. A failed
//! migration is only revived by an explicit operator `resume`; nothing
//! else ever leaves `finished` or `failed`.

use std::fmt;
use std::str::FromStr;

use crate::error::StateError;

/// Status of a batched migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationStatus {
    Active,
    Paused,
    Finished,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses never get new batches planned.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown migration status '{other}'")),
        }
    }
}

/// Events accepted by [`next_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationEvent {
    Pause,
    Resume,
    MarkFinished,
    MarkFailed,
}

impl MigrationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::MarkFinished => "mark_finished",
            Self::MarkFailed => "mark_failed",
        }
    }
}

impl fmt::Display for MigrationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown batch status '{other}'")),
        }
    }
}

/// Applies `event` to `from`, returning the resulting status or the reason it is illegal.
pub fn next_status(
    from: MigrationStatus,
    event: MigrationEvent,
) -> Result<MigrationStatus, StateError> {
    use MigrationEvent::*;
    use MigrationStatus::*;

    match (from, event) {
        (Active, Pause) => Ok(Paused),
        (Paused, Resume) | (Failed, Resume) => Ok(Active),
        (Active, MarkFinished) => Ok(Finished),
        (Active, MarkFailed) => Ok(Failed),
        _ => Err(StateError::IllegalTransition { from, event }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_and_paused_toggle() {
        assert_eq!(
            next_status(MigrationStatus::Active, MigrationEvent::Pause),
            Ok(MigrationStatus::Paused)
        );
        assert_eq!(
            next_status(MigrationStatus::Paused, MigrationEvent::Resume),
            Ok(MigrationStatus::Active)
        );
    }

    #[test]
    fn finished_is_terminal() {
        for event in [
            MigrationEvent::Pause,
            MigrationEvent::Resume,
            MigrationEvent::MarkFinished,
            MigrationEvent::MarkFailed,
        ] {
            assert_eq!(
                next_status(MigrationStatus::Finished, event),
                Err(StateError::IllegalTransition {
                    from: MigrationStatus::Finished,
                    event,
                })
            );
        }
    }

    #[test]
    fn failed_only_accepts_operator_resume() {
        assert_eq!(
            next_status(MigrationStatus::Failed, MigrationEvent::Resume),
            Ok(MigrationStatus::Active)
        );
        assert!(next_status(MigrationStatus::Failed, MigrationEvent::Pause).is_err());
        assert!(next_status(MigrationStatus::Failed, MigrationEvent::MarkFinished).is_err());
    }

    #[test]
    fn paused_migrations_cannot_finish_or_fail() {
        assert!(next_status(MigrationStatus::Paused, MigrationEvent::MarkFinished).is_err());
        assert!(next_status(MigrationStatus::Paused, MigrationEvent::MarkFailed).is_err());
        assert!(next_status(MigrationStatus::Paused, MigrationEvent::Pause).is_err());
        assert!(next_status(MigrationStatus::Active, MigrationEvent::Resume).is_err());
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in [
            MigrationStatus::Active,
            MigrationStatus::Paused,
            MigrationStatus::Finished,
            MigrationStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<MigrationStatus>(), Ok(status));
        }
        assert!("finalizing".parse::<MigrationStatus>().is_err());
        assert_eq!("running".parse::<BatchStatus>(), Ok(BatchStatus::Running));
    }
}
