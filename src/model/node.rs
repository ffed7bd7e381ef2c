//! Node records and lifecycle states

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Initialization state of a replica node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    Uninitialized,
    Preparing,
    Copying,
    CatchingUp,
    Synchronized,
    Diverged,
    Failed,
    Reinitializing,
}

impl InitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitState::Uninitialized => "uninitialized",
            InitState::Preparing => "preparing",
            InitState::Copying => "copying",
            InitState::CatchingUp => "catching_up",
            InitState::Synchronized => "synchronized",
            InitState::Diverged => "diverged",
            InitState::Failed => "failed",
            InitState::Reinitializing => "reinitializing",
        }
    }

    /// States with a running pipeline stage
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InitState::Preparing
                | InitState::Copying
                | InitState::CatchingUp
                | InitState::Reinitializing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InitState::Synchronized | InitState::Diverged | InitState::Failed
        )
    }

    /// `Start` is accepted only from these states
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            InitState::Uninitialized | InitState::Failed | InitState::Diverged
        )
    }

    /// `Reinitialize` is accepted only from the recovery states
    pub fn can_reinitialize(&self) -> bool {
        matches!(self, InitState::Failed | InitState::Diverged)
    }

    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the lifecycle graph has an edge from `self` to `next`
    pub fn can_transition_to(&self, next: InitState) -> bool {
        use InitState::*;
        match (self, next) {
            (Uninitialized, Preparing) => true,
            (Preparing, Copying) => true,
            (Copying, CatchingUp) => true,
            (CatchingUp, Synchronized) => true,
            (CatchingUp, Diverged) => true,
            (Failed | Diverged, Preparing | Reinitializing) => true,
            (Reinitializing, Preparing) => true,
            // cancellation and unrecoverable errors
            (s, Failed) => !s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InitState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "uninitialized" => InitState::Uninitialized,
            "preparing" => InitState::Preparing,
            "copying" => InitState::Copying,
            "catching_up" => InitState::CatchingUp,
            "synchronized" => InitState::Synchronized,
            "diverged" => InitState::Diverged,
            "failed" => InitState::Failed,
            "reinitializing" => InitState::Reinitializing,
            other => return Err(Error::Internal(format!("unknown init state: {}", other))),
        })
    }
}

/// Identity and lifecycle anchor for a replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub state: InitState,
    /// Node supplying the snapshot
    pub source_node: Option<String>,
    pub last_error: Option<String>,
    pub init_started_at: Option<DateTime<Utc>>,
    pub init_completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state: InitState::Uninitialized,
            source_node: None,
            last_error: None,
            init_started_at: None,
            init_completed_at: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [InitState; 8] = [
        InitState::Uninitialized,
        InitState::Preparing,
        InitState::Copying,
        InitState::CatchingUp,
        InitState::Synchronized,
        InitState::Diverged,
        InitState::Failed,
        InitState::Reinitializing,
    ];

    #[test]
    fn test_happy_path_edges() {
        assert!(InitState::Uninitialized.can_transition_to(InitState::Preparing));
        assert!(InitState::Preparing.can_transition_to(InitState::Copying));
        assert!(InitState::Copying.can_transition_to(InitState::CatchingUp));
        assert!(InitState::CatchingUp.can_transition_to(InitState::Synchronized));
        assert!(!InitState::Copying.can_transition_to(InitState::Synchronized));
        assert!(!InitState::Preparing.can_transition_to(InitState::Uninitialized));
    }

    #[test]
    fn test_recovery_edges() {
        for s in [InitState::Failed, InitState::Diverged] {
            assert!(s.can_reinitialize());
            assert!(s.can_start());
            assert!(s.can_transition_to(InitState::Reinitializing));
        }
        assert!(InitState::Reinitializing.can_transition_to(InitState::Preparing));
        assert!(!InitState::Synchronized.can_reinitialize());
        assert!(!InitState::Synchronized.can_start());
        // only catch-up can diverge
        assert!(!InitState::Copying.can_transition_to(InitState::Diverged));
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal_state() {
        for s in ALL {
            assert_eq!(s.can_transition_to(InitState::Failed), !s.is_terminal(), "{}", s);
            assert!(!s.can_transition_to(InitState::Uninitialized));
        }
    }

    #[test]
    fn test_string_roundtrip() {
        for s in ALL {
            assert_eq!(s.as_str().parse::<InitState>().unwrap(), s);
        }
        assert!("copying_maybe".parse::<InitState>().is_err());
    }
}
