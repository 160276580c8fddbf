//! Lifecycle state machine shared by containers and volumes.
//!
//! ```text
//! creating --created()--> created --destroying()--> destroying --destroy()--> [deleted]
//! creating --failed()--> failed --destroy()--> [deleted]
//! ```
//!
//! Transitions are applied as conditional updates whose WHERE clause accepts
//! both the source and the target state, so a caller that crashed after
//! committing can safely retry. Zero affected rows is classified by a
//! follow-up read: row gone means another process deleted it outright;
//! row present in a different state means the transition is illegal.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Creating,
    Created,
    Destroying,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Destroying => "destroying",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(Self::Creating),
            "created" => Some(Self::Created),
            "destroying" => Some(Self::Destroying),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// The state a row must currently be in for a transition into `self`.
    ///
    /// `Creating` is an initial state, never a transition target.
    pub fn transition_source(self) -> Option<LifecycleState> {
        match self {
            Self::Created => Some(Self::Creating),
            Self::Destroying => Some(Self::Created),
            Self::Failed => Some(Self::Creating),
            Self::Creating => None,
        }
    }

    /// Whether a row in this state may be deleted outright.
    pub fn deletable(self) -> bool {
        matches!(self, Self::Destroying | Self::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
