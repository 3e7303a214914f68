use serde::{Deserialize, Serialize};

/// Role token attached to an authenticated caller. Identity issuance and
/// custom-claim assignment happen upstream; the core only consumes the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Participant,
    Coordinator,
}

/// Authenticated caller as delivered by the serving layer.
#[derive(Clone, Debug)]
pub struct CallerIdentity {
    pub user_id: String,
    pub email: String,
    pub role: Role,
}

impl CallerIdentity {
    pub fn is_coordinator(&self) -> bool {
        self.role == Role::Coordinator
    }
}

/// Coordinator role is granted to registered emails under the configured
/// domain; everyone else is a plain participant.
pub fn role_for_email(email: &str, coordinator_domain: &str) -> Role {
    match email.rsplit_once('@') {
        Some((_, domain)) if domain.eq_ignore_ascii_case(coordinator_domain) => Role::Coordinator,
        _ => Role::Participant,
    }
}
