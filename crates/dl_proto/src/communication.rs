//! `BaseCommunication` — a conversation descriptor (§3), channel or direct.
//!
//! Replaces the signed-epoch group model with the flatter shape the
//! specification calls for: a single encrypted metadata blob naming an
//! administrator, a set of operators, a set of members, and a set of
//! blocked members, guarded by the channel-membership invariants below.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimum operator count for a channel, per §3/§6 configuration.
pub const MINIMUM_CHANNEL_OPERATORS: usize = 1;
/// Minimum member count for a channel, per §3/§6 configuration.
pub const MINIMUM_CHANNEL_MEMBERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationKind {
    Direct,
    Channel,
}

/// Which batch of one-time keys an operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OneTimeKeyKind {
    Curve,
    MlKem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommunicationError {
    TooFewOperators { found: usize, minimum: usize },
    TooFewMembers { found: usize, minimum: usize },
    AdministratorNotOperator,
    OperatorNotMember,
    BlockedMemberStillMember,
}

impl std::fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooFewOperators { found, minimum } => {
                write!(f, "channel has {found} operators, minimum is {minimum}")
            }
            Self::TooFewMembers { found, minimum } => {
                write!(f, "channel has {found} members, minimum is {minimum}")
            }
            Self::AdministratorNotOperator => write!(f, "administrator is not an operator"),
            Self::OperatorNotMember => write!(f, "an operator is not a member"),
            Self::BlockedMemberStillMember => write!(f, "a blocked member is still a member"),
        }
    }
}

impl std::error::Error for CommunicationError {}

/// Encrypted-at-rest conversation descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseCommunication {
    pub id: Uuid,
    pub kind: CommunicationKind,
    pub name: String,
    pub administrator: Uuid,
    pub operators: HashSet<Uuid>,
    pub members: HashSet<Uuid>,
    pub blocked_members: HashSet<Uuid>,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BaseCommunication {
    pub fn new_direct(id: Uuid, administrator: Uuid, peer: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind: CommunicationKind::Direct,
            name: String::new(),
            administrator,
            operators: HashSet::from([administrator]),
            members: HashSet::from([administrator, peer]),
            blocked_members: HashSet::new(),
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_channel(
        id: Uuid,
        name: String,
        administrator: Uuid,
        operators: HashSet<Uuid>,
        members: HashSet<Uuid>,
    ) -> Result<Self, CommunicationError> {
        let now = Utc::now();
        let comm = Self {
            id,
            kind: CommunicationKind::Channel,
            name,
            administrator,
            operators,
            members,
            blocked_members: HashSet::new(),
            message_count: 0,
            created_at: now,
            updated_at: now,
        };
        comm.check_invariants()?;
        Ok(comm)
    }

    /// `|operators| ≥ minimumChannelOperators`, `|members| ≥ minimumChannelMembers`,
    /// `administrator ∈ operators ⊆ members`, `blockedMembers ∩ members = ∅`.
    /// Direct communications are exempt (they are not channels).
    pub fn check_invariants(&self) -> Result<(), CommunicationError> {
        if self.kind != CommunicationKind::Channel {
            return Ok(());
        }
        if self.operators.len() < MINIMUM_CHANNEL_OPERATORS {
            return Err(CommunicationError::TooFewOperators {
                found: self.operators.len(),
                minimum: MINIMUM_CHANNEL_OPERATORS,
            });
        }
        if self.members.len() < MINIMUM_CHANNEL_MEMBERS {
            return Err(CommunicationError::TooFewMembers {
                found: self.members.len(),
                minimum: MINIMUM_CHANNEL_MEMBERS,
            });
        }
        if !self.operators.contains(&self.administrator) {
            return Err(CommunicationError::AdministratorNotOperator);
        }
        if !self.operators.is_subset(&self.members) {
            return Err(CommunicationError::OperatorNotMember);
        }
        if !self.blocked_members.is_disjoint(&self.members) {
            return Err(CommunicationError::BlockedMemberStillMember);
        }
        Ok(())
    }

    /// Members eligible to receive a fan-out send: members minus blocked.
    pub fn deliverable_members(&self) -> impl Iterator<Item = &Uuid> {
        self.members.iter().filter(move |m| !self.blocked_members.contains(m))
    }
}
