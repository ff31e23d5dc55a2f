use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Membership, MembershipStatus, Ms};
use crate::store::StorageError;

pub const MEMBERSHIP_NOT_FOUND: &str = "membership_not_found";
pub const MEMBERSHIP_INACTIVE: &str = "membership_inactive";
pub const MEMBERSHIP_NOT_STARTED: &str = "membership_not_started";
pub const MEMBERSHIP_EXPIRED: &str = "membership_expired";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipVerdict {
    pub can_book: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl MembershipVerdict {
    pub fn allowed() -> Self {
        Self {
            can_book: true,
            error_code: None,
            error_message: None,
        }
    }

    pub fn denied(code: &str, message: impl Into<String>) -> Self {
        Self {
            can_book: false,
            error_code: Some(code.to_string()),
            error_message: Some(message.into()),
        }
    }
}

/// Answers whether a member's subscription allows booking a class that starts at
/// `class_start`. Implemented by the billing side of the host system.
#[async_trait]
pub trait MembershipGate: Send + Sync {
    async fn validate(
        &self,
        member_id: Ulid,
        organization_id: &str,
        class_start: Ms,
    ) -> Result<MembershipVerdict, StorageError>;
}

/// In-memory membership table for one organization, fed through `set_membership`.
#[derive(Default)]
pub struct MembershipRegistry {
    members: DashMap<Ulid, Membership>,
}

impl MembershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, membership: Membership) {
        self.members.insert(membership.member_id, membership);
    }

    pub fn get(&self, member_id: &Ulid) -> Option<Membership> {
        self.members.get(member_id).map(|m| m.value().clone())
    }

    pub fn all(&self) -> Vec<Membership> {
        self.members.iter().map(|m| m.value().clone()).collect()
    }

    pub fn check(&self, member_id: &Ulid, class_start: Ms) -> MembershipVerdict {
        let Some(m) = self.members.get(member_id) else {
            return MembershipVerdict::denied(MEMBERSHIP_NOT_FOUND, "member has no membership");
        };
        if m.status != MembershipStatus::Active {
            return MembershipVerdict::denied(
                MEMBERSHIP_INACTIVE,
                format!("membership is {:?}", m.status).to_lowercase(),
            );
        }
        if class_start < m.valid_from {
            return MembershipVerdict::denied(
                MEMBERSHIP_NOT_STARTED,
                "membership starts after the class",
            );
        }
        if let Some(until) = m.valid_until
            && class_start >= until
        {
            return MembershipVerdict::denied(
                MEMBERSHIP_EXPIRED,
                "membership expires before the class",
            );
        }
        MembershipVerdict::allowed()
    }
}

#[async_trait]
impl MembershipGate for MembershipRegistry {
    async fn validate(
        &self,
        member_id: Ulid,
        _organization_id: &str,
        class_start: Ms,
    ) -> Result<MembershipVerdict, StorageError> {
        Ok(self.check(&member_id, class_start))
    }
}
