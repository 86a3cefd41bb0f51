#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use automation_center_domain::ActorId;
use serde::Serialize;

/// Resolves whether an actor holds elevated rights over runs it does not own.
pub trait AccessPolicy: Send + Sync {
    fn is_privileged(&self, actor: &ActorId) -> bool;
}

/// Policy with no privileged actors: only owners may act on their runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerOnlyPolicy;

impl AccessPolicy for OwnerOnlyPolicy {
    fn is_privileged(&self, _actor: &ActorId) -> bool {
        false
    }
}

/// Fixed set of privileged actors, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct PrivilegedActors {
    actors: BTreeSet<ActorId>,
}

impl PrivilegedActors {
    #[must_use]
    pub fn new(actors: impl IntoIterator<Item = ActorId>) -> Self {
        Self {
            actors: actors
                .into_iter()
                .filter(|actor| !actor.as_str().trim().is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

impl AccessPolicy for PrivilegedActors {
    fn is_privileged(&self, actor: &ActorId) -> bool {
        self.actors.contains(actor)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessBasis {
    Owner,
    Privileged,
    Denied,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub basis: AccessBasis,
    pub reason: &'static str,
}

/// Decide whether `requester` may stop a run owned by `owner`.
#[must_use]
pub fn authorize_stop(
    policy: &dyn AccessPolicy,
    owner: &ActorId,
    requester: &ActorId,
) -> AccessDecision {
    if owner == requester {
        return AccessDecision {
            allowed: true,
            basis: AccessBasis::Owner,
            reason: "requester_owns_run",
        };
    }
    if policy.is_privileged(requester) {
        return AccessDecision {
            allowed: true,
            basis: AccessBasis::Privileged,
            reason: "requester_is_privileged",
        };
    }
    AccessDecision {
        allowed: false,
        basis: AccessBasis::Denied,
        reason: "requester_not_owner_or_privileged",
    }
}
