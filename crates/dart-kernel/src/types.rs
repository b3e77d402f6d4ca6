//! Identifiers and lifecycle enums shared by every mission component
//!
//! - ULID-based identifiers (sortable by creation time)
//! - Mission stages of the OODA loop
//! - Terminal outcomes

use serde::{Deserialize, Serialize};
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a fresh identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(
    /// Unique mission identifier (one per incident investigation)
    MissionId
);
ulid_id!(
    /// Identifier of one fetched evidence artifact
    EvidenceId
);
ulid_id!(
    /// Identifier of one vendor probe result
    SignalId
);
ulid_id!(
    /// Identifier of one remediation proposal
    ProposalId
);

/// Stage of a mission in the OODA loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Mission registered, nothing launched yet
    Created,
    /// Evidence fan-out, vendor probe and memory lookup in flight
    Observing,
    /// Merging evidence and reconciling vendor claims
    Orienting,
    /// Choosing between acting, looping and escalating
    Deciding,
    /// Obtaining, gating and executing a remediation
    Acting,
    /// Suspended on a pending approval
    Blocked,
    /// Persisting the incident summary
    Learning,
    /// Terminal
    Closed,
}

impl Stage {
    /// All stages in declaration order
    pub const ALL: [Stage; 8] = [
        Stage::Created,
        Stage::Observing,
        Stage::Orienting,
        Stage::Deciding,
        Stage::Acting,
        Stage::Blocked,
        Stage::Learning,
        Stage::Closed,
    ];

    /// Stable lowercase name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Observing => "observing",
            Stage::Orienting => "orienting",
            Stage::Deciding => "deciding",
            Stage::Acting => "acting",
            Stage::Blocked => "blocked",
            Stage::Learning => "learning",
            Stage::Closed => "closed",
        }
    }

    /// Whether no further transition is possible
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Closed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a mission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Remediation executed and the incident learned
    Resolved,
    /// Automated resolution stopped; a human takes over
    Escalated,
    /// Operator cancelled the mission
    Aborted,
}

impl Outcome {
    /// Stable lowercase name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Resolved => "resolved",
            Outcome::Escalated => "escalated",
            Outcome::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mission_id_generation() {
        let id1 = MissionId::new();
        let id2 = MissionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn only_closed_is_terminal() {
        for stage in Stage::ALL {
            assert_eq!(stage.is_terminal(), stage == Stage::Closed);
        }
    }

    #[test]
    fn stage_display_is_lowercase() {
        assert_eq!(Stage::Blocked.to_string(), "blocked");
        assert_eq!(Outcome::Escalated.to_string(), "escalated");
    }
}
